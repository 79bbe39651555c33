//! Reporting sink
//!
//! The probe decides severity and builds the message; rendering belongs to
//! the sink. Every message carries a stable identifier so operators and
//! tooling can match on it.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

/// Severity of a reported diagnostic
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum Level {
    /// Detail useful only when investigating
    Debug,
    /// Normal progress
    Info,
    /// Something unexpected that didn't fail the run
    Warn,
    /// A failure
    Error,
}

/// Receives identified diagnostics from the probe
pub trait Reporter: Send + Sync {
    /// Emit one diagnostic
    fn report(&self, level: Level, id: &str, message: &str);

    /// Emit at debug severity
    fn debug(&self, id: &str, message: &str) {
        self.report(Level::Debug, id, message);
    }

    /// Emit at info severity
    fn info(&self, id: &str, message: &str) {
        self.report(Level::Info, id, message);
    }

    /// Emit at warn severity
    fn warn(&self, id: &str, message: &str) {
        self.report(Level::Warn, id, message);
    }

    /// Emit at error severity
    fn error(&self, id: &str, message: &str) {
        self.report(Level::Error, id, message);
    }
}

/// Reporter that forwards diagnostics as tracing events
#[derive(Clone, Copy, Debug, Default)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, level: Level, id: &str, message: &str) {
        match level {
            Level::Debug => debug!(target: "appcreate::report", id, "{}", message),
            Level::Info => info!(target: "appcreate::report", id, "{}", message),
            Level::Warn => warn!(target: "appcreate::report", id, "{}", message),
            Level::Error => error!(target: "appcreate::report", id, "{}", message),
        }
    }
}

/// Forwards to another reporter until `stop` fires, then drops everything.
///
/// Handed to the pipeline worker so a worker left running after an interrupt
/// can't report behind the run summary.
pub struct GatedReporter {
    inner: Arc<dyn Reporter>,
    stop: CancellationToken,
}

impl GatedReporter {
    /// Gate `inner` on `stop`
    pub fn new(inner: Arc<dyn Reporter>, stop: CancellationToken) -> Self {
        Self { inner, stop }
    }
}

impl Reporter for GatedReporter {
    fn report(&self, level: Level, id: &str, message: &str) {
        if self.stop.is_cancelled() {
            trace!(id, ?level, "run stopped, dropping report");
            return;
        }
        self.inner.report(level, id, message);
    }
}

/// Stable diagnostic identifiers
pub mod ids {
    /// The run succeeded
    pub const RUN_SUCCEEDED: &str = "AC0001";
    /// The run failed
    pub const RUN_FAILED: &str = "AC0002";
    /// An interrupt aborted the run
    pub const RUN_INTERRUPTED: &str = "AC0003";
    /// The pipeline worker crashed
    pub const RUN_CRASHED: &str = "AC0004";
    /// Stage progress and skipped sub-steps
    pub const STAGE_PROGRESS: &str = "AC0005";
    /// The route stage was skipped by configuration
    pub const ROUTE_STAGE_SKIPPED: &str = "AC0006";

    /// The namespace could not be created
    pub const SETUP_NAMESPACE: &str = "AC1001";
    /// Stale resources didn't go away in time
    pub const SETUP_STALE_RESOURCES: &str = "AC1002";
    /// A stale resource could not be deleted
    pub const SETUP_STALE_DELETE: &str = "AC1003";
    /// The namespace was ready
    pub const SETUP_READY: &str = "AC1004";

    /// The workload stage succeeded
    pub const WORKLOAD_READY: &str = "AC2000";
    /// The pod could not be created
    pub const WORKLOAD_CREATE: &str = "AC2001";
    /// The pod did not become Running in time
    pub const WORKLOAD_TIMEOUT: &str = "AC2002";
    /// The pod reached a state it can't recover from
    pub const WORKLOAD_FAILED: &str = "AC2003";

    /// The endpoint stage succeeded
    pub const ENDPOINT_READY: &str = "AC3000";
    /// The service could not be created
    pub const ENDPOINT_CREATE: &str = "AC3001";
    /// No endpoint address appeared in time
    pub const ENDPOINT_TIMEOUT: &str = "AC3002";
    /// The endpoints object was removed or is unusable
    pub const ENDPOINT_FAILED: &str = "AC3003";
    /// The service did not answer over HTTP
    pub const ENDPOINT_CONNECT: &str = "AC3004";

    /// The route stage succeeded
    pub const ROUTE_READY: &str = "AC4000";
    /// The route could not be created
    pub const ROUTE_CREATE: &str = "AC4001";
    /// No router admitted the route in time
    pub const ROUTE_TIMEOUT: &str = "AC4002";
    /// A router rejected the route or it was removed
    pub const ROUTE_FAILED: &str = "AC4003";
    /// The route host did not answer over HTTP
    pub const ROUTE_CONNECT: &str = "AC4004";

    /// A cleanup deletion failed
    pub const CLEANUP_FAILED: &str = "AC5001";
    /// Cleanup finished
    pub const CLEANUP_DONE: &str = "AC5002";
    /// A resource was kept on request
    pub const CLEANUP_KEPT: &str = "AC5003";
}
