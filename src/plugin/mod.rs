//! Host side of the bridge
//!
//! # Modules
//!
//! - `config`: launch options resolved at `init` time
//! - `process`: child process spawning and teardown
//! - `negotiator`: transport selection, handshake and dispense
//! - `cache`: memoized function existence
//! - `handle`: the [`PluginHandle`] façade tying them together

pub mod cache;
pub mod config;
pub mod handle;
pub mod negotiator;
pub mod process;

pub use cache::ExistenceCache;
pub use config::{LanguageKind, LogOptions, PluginOptions};
pub use handle::{HandleState, PluginHandle};
pub use process::{PluginProcess, ProcessState};
