use dashmap::DashMap;

/// Which function names are known to exist in the connected plugin.
///
/// Entries are written once and never changed or removed for the lifetime
/// of the handle; the plugin's function set is assumed fixed after startup.
#[derive(Debug, Default)]
pub struct ExistenceCache {
    entries: DashMap<String, bool>,
}

impl ExistenceCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<bool> {
        self.entries.get(name).map(|entry| *entry)
    }

    /// Record a `ListFunctionNames` result: every discovered name as
    /// present, and `queried` as present or absent. Returns whether
    /// `queried` exists, taking any earlier entry into account.
    pub fn populate(&self, queried: &str, discovered: &[String]) -> bool {
        self.record_present(discovered);
        let found = discovered.iter().any(|name| name == queried);
        *self.entries.entry(queried.to_string()).or_insert(found)
    }

    /// Mark every name in a full listing as present.
    pub fn record_present(&self, discovered: &[String]) {
        for name in discovered {
            self.entries.entry(name.clone()).or_insert(true);
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
