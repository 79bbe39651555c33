//! AppCreate - synthetic end-to-end application probe for Kubernetes clusters
//!
//! The probe creates a chain of dependent resources in a scratch namespace,
//! waits for each to become ready by consuming watch streams with deadlines,
//! checks live connectivity with bounded retries, and always cleans up after
//! itself, including when the run is interrupted.
//!
//! # Pipeline
//!
//! - workload: a Pod running a small HTTP responder, ready when `Running`
//! - endpoint: a Service selecting the pod, ready when its Endpoints have an address
//! - route: an OpenShift Route to the Service, ready when a router admits it
//!
//! # Modules
//!
//! - [`api`] - Narrow resource control API over kube-rs (create/list/delete/watch)
//! - [`route`] - Route resource types addressed through the dynamic API
//! - [`waiter`] - Deadline-bounded watch consumption
//! - [`prober`] - Retrying HTTP connectivity prober
//! - [`stage`] - The create/wait-ready/test stage template and its three stages
//! - [`orchestrator`] - Pipeline sequencing, interrupt handling, cleanup ownership
//! - [`environment`] - Namespace preparation and best-effort cleanup
//! - [`result`] - Run and stage results with null-safe JSON persistence
//! - [`reporter`] - Reporting sink for identified diagnostics
//! - [`config`] - Probe configuration and validation
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod api;
pub mod config;
pub mod environment;
pub mod error;
pub mod orchestrator;
pub mod prober;
pub mod reporter;
pub mod result;
pub mod route;
pub mod stage;
pub mod waiter;

#[cfg(test)]
pub(crate) mod testing;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Default name for the probe's pod, service and route
pub const DEFAULT_APP_NAME: &str = "diagnostic-appcreate";

/// Prefix for generated namespace names
pub const DEFAULT_NAMESPACE_PREFIX: &str = "appcreate-probe-";

/// Default image for the probe workload
///
/// agnhost's `netexec` answers `200 OK` on `/` which is all the connectivity
/// tests need.
pub const DEFAULT_IMAGE: &str = "registry.k8s.io/e2e-test-images/agnhost:2.47";

/// Default port the workload listens on
pub const DEFAULT_PORT: u16 = 8080;

/// Default port used when probing the admitted route host
pub const DEFAULT_ROUTE_PORT: u16 = 80;

/// Default per-attempt HTTP timeout in milliseconds
pub const DEFAULT_HTTP_TIMEOUT_MS: u64 = 1000;

/// Default number of HTTP retries after the first attempt
pub const DEFAULT_HTTP_RETRIES: u32 = 10;

/// Default readiness deadline for the workload and endpoint stages
pub const DEFAULT_APP_TIMEOUT_SECS: u64 = 120;

/// Default deadline for a router to admit the route
pub const DEFAULT_ROUTE_ADMISSION_TIMEOUT_SECS: u64 = 10;

/// Default bound on waiting for stale workloads to disappear during setup
pub const DEFAULT_PREPARE_TIMEOUT_SECS: u64 = 60;

/// Label key selecting the probe's workload
pub const APP_LABEL: &str = "app";

/// Label marking namespaces created by the probe
pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";

/// Value for [`MANAGED_BY_LABEL`]
pub const MANAGED_BY_VALUE: &str = "appcreate";

/// File name used when persisting run results
pub const RESULTS_FILE_NAME: &str = "appcreate-results.json";
