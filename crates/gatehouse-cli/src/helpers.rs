//! Shared helper functions used across CLI subcommands.

use std::sync::Arc;

use gatehouse_kernel::{EventBus, GateEvent};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::LogFormat;

// ---------------------------------------------------------------------------
// Tracing
// ---------------------------------------------------------------------------

/// Initialize the tracing subscriber.  `RUST_LOG` wins over `default_level`.
pub fn init_tracing(default_level: &str, format: LogFormat) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    match format {
        LogFormat::Compact => builder.compact().init(),
        LogFormat::Json => builder.json().init(),
    }
}

// ---------------------------------------------------------------------------
// Audit log
// ---------------------------------------------------------------------------

/// Log every bus event under the `audit` target until the bus closes.
pub fn spawn_audit_log(bus: &EventBus) -> JoinHandle<()> {
    let mut rx = bus.subscribe();
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => log_event(&event),
                Err(RecvError::Lagged(missed)) => {
                    warn!(target: "audit", missed, "audit log fell behind");
                }
                Err(RecvError::Closed) => break,
            }
        }
    })
}

fn log_event(event: &Arc<GateEvent>) {
    let request_id = event.request_id().unwrap_or("-");
    match serde_json::to_string(event.as_ref()) {
        Ok(json) => info!(target: "audit", request_id, event = %json, "audit"),
        Err(e) => warn!(target: "audit", request_id, error = %e, "unserializable event"),
    }
}
