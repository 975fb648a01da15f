//! Transport selection and the handshake/dispense sequence

use std::sync::Arc;

use crate::error::BridgeError;
use crate::plugin::config::LanguageKind;
use crate::plugin::process::PluginProcess;
use crate::protocol::handshake::HandshakeTracker;
use crate::transport::{self, FunctionCaller, TransportStyle};

/// Pick the transport for a launch. Scripted plugins only speak the
/// multiplexed style; native plugins honour an explicit `rpc` designator
/// and otherwise default to multiplexed.
pub fn choose_style(language: LanguageKind, designator: Option<&str>) -> TransportStyle {
    match language {
        LanguageKind::Scripted => TransportStyle::Multiplexed,
        LanguageKind::Native => TransportStyle::from_designator(designator),
    }
}

/// Wait for the child's announcement, connect to it and dispense the
/// service matching its transport style.
pub async fn negotiate(
    process: &mut PluginProcess,
    tracker: &mut HandshakeTracker,
) -> Result<Arc<dyn FunctionCaller>, BridgeError> {
    let style = process.style();
    let path = process.path().to_path_buf();
    let handshake_failed = |reason: String| BridgeError::HandshakeFailed {
        path: path.clone(),
        reason,
    };

    let line = process
        .wait_for_handshake(tracker.remaining())
        .await
        .map_err(|e| handshake_failed(e.to_string()))?;
    line.validate(style)
        .map_err(|e| handshake_failed(e.to_string()))?;
    tracker.mark_announced();

    let connect = tokio::time::timeout(tracker.remaining(), transport::connect(style, line.address));
    let dispenser = match connect.await {
        Ok(Ok(dispenser)) => dispenser,
        Ok(Err(e)) => return Err(handshake_failed(e.to_string())),
        Err(_) => return Err(handshake_failed(format!("connecting to {} timed out", line.address))),
    };

    let service = style.as_str();
    let dispense_failed = |reason: String| BridgeError::DispenseFailed {
        path: path.clone(),
        service: service.to_string(),
        reason,
    };
    let caller = match tokio::time::timeout(tracker.remaining(), dispenser.dispense(service)).await {
        Ok(Ok(caller)) => caller,
        Ok(Err(e)) => return Err(dispense_failed(e.to_string())),
        Err(_) => return Err(dispense_failed("dispense timed out".into())),
    };
    tracker.mark_dispensed();

    tracing::debug!(
        plugin = %path.display(),
        transport = %style,
        address = %line.address,
        duration_ms = tracker.duration_ms(),
        "Plugin negotiated"
    );
    Ok(caller)
}
