//! Diagnostics sink for non-fatal runtime faults.

use std::any::Any;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::error::RegistryError;
use crate::events::SubscriptionId;
use crate::types::ModuleId;

/// A structured, non-fatal event the runtime wants the host to know about.
#[derive(Debug, Clone, PartialEq)]
pub enum Diagnostic {
    /// An event handler returned an error or panicked.
    HandlerFault {
        topic: String,
        subscription: SubscriptionId,
        owner: ModuleId,
        sequence: u64,
        message: String,
    },
    /// A teardown hook did not finish in time; the unload completed anyway.
    TeardownTimeout { module: ModuleId, timeout: Duration },
    /// A teardown hook returned an error; the unload completed anyway.
    TeardownFailed { module: ModuleId, message: String },
    /// A load attempt ended in `Failed`.
    LoadFailed {
        module: ModuleId,
        error: RegistryError,
    },
    /// A fetch completed after its load attempt was cancelled or superseded.
    StaleLoadDiscarded { module: ModuleId },
}

/// Receives diagnostics. Implementations must not block.
pub trait DiagnosticsSink: Send + Sync {
    fn emit(&self, diagnostic: Diagnostic);
}

/// Default sink: forwards every diagnostic to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsSink for TracingDiagnostics {
    fn emit(&self, diagnostic: Diagnostic) {
        match diagnostic {
            Diagnostic::HandlerFault {
                topic,
                subscription,
                owner,
                sequence,
                message,
            } => {
                warn!(%topic, subscription, %owner, sequence, "event handler fault: {message}");
            }
            Diagnostic::TeardownTimeout { module, timeout } => {
                warn!(%module, ?timeout, "teardown timed out, unload forced");
            }
            Diagnostic::TeardownFailed { module, message } => {
                warn!(%module, "teardown failed: {message}");
            }
            Diagnostic::LoadFailed { module, error } => {
                error!(%module, "load failed: {error}");
            }
            Diagnostic::StaleLoadDiscarded { module } => {
                info!(%module, "discarded result of a cancelled load");
            }
        }
    }
}

/// Best-effort text of a caught panic payload.
pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
