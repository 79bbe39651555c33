//! Probe namespace preparation and teardown
//!
//! [`Environment::prepare`] makes sure the namespace exists and holds no
//! leftovers from an earlier run. [`Environment::cleanup`] removes what the
//! run created. Cleanup is advisory: deletion failures are logged and never
//! change the diagnostic result, and every deletion is delete-if-exists so the
//! cleaner can run while an abandoned stage is still creating resources.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use k8s_openapi::api::core::v1::Namespace;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, trace};

use crate::api::{ClusterApis, Selector};
use crate::config::ProbeConfig;
use crate::reporter::{ids, GatedReporter, Reporter};
use crate::{Error, Result, MANAGED_BY_LABEL, MANAGED_BY_VALUE};

/// Interval between checks for stale workloads
pub const STALE_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Poll `check_fn` until it returns `Ok(true)` or `timeout` elapses.
///
/// Check errors are treated as "not yet" and logged at trace level. A check
/// still running at the deadline is dropped. Returns whether the condition
/// was met.
pub async fn poll_until<F, Fut>(timeout: Duration, poll_interval: Duration, mut check_fn: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        match tokio::time::timeout_at(deadline, check_fn()).await {
            Ok(Ok(true)) => return true,
            Ok(Ok(false)) => trace!("polling condition not yet met"),
            Ok(Err(e)) => trace!(error = %e, "polling check failed, retrying"),
            Err(_) => {
                trace!("polling check still running at the deadline");
                return false;
            }
        }

        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(poll_interval).await;
    }
}

/// Prepares and tears down the probe namespace
pub struct Environment {
    apis: ClusterApis,
    config: Arc<ProbeConfig>,
    /// Cleanup reports; always delivered
    reporter: Arc<dyn Reporter>,
    /// Preparation reports; silenced once `stop` fires
    setup_reporter: Arc<dyn Reporter>,
    stop: CancellationToken,
    namespace_created: AtomicBool,
}

impl Environment {
    /// Create an environment handle; nothing touches the cluster yet
    pub fn new(apis: ClusterApis, config: Arc<ProbeConfig>, reporter: Arc<dyn Reporter>) -> Self {
        Self {
            apis,
            config,
            setup_reporter: reporter.clone(),
            reporter,
            stop: CancellationToken::new(),
            namespace_created: AtomicBool::new(false),
        }
    }

    /// Abandon preparation quietly once `stop` fires.
    ///
    /// Cleanup is unaffected and keeps reporting.
    pub fn with_stop(mut self, stop: CancellationToken) -> Self {
        self.setup_reporter = Arc::new(GatedReporter::new(self.reporter.clone(), stop.clone()));
        self.stop = stop;
        self
    }

    /// Whether this run created the namespace
    pub fn namespace_created(&self) -> bool {
        self.namespace_created.load(Ordering::SeqCst)
    }

    /// Ensure the namespace exists and is free of stale probe resources.
    ///
    /// Any error here is a setup error: no stage may run afterwards.
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn prepare(&self) -> Result<()> {
        self.ensure_namespace().await?;
        self.check_stop("creating the namespace")?;
        self.sweep_stale().await;
        self.check_stop("sweeping stale resources")?;

        tokio::select! {
            biased;
            () = self.stop.cancelled() => {
                return Err(Error::interrupted("waiting for stale pods"));
            }
            waited = self.wait_for_stale_workloads() => waited?,
        }

        self.setup_reporter.info(
            ids::SETUP_READY,
            &format!("namespace {} is ready for the probe", self.config.namespace),
        );
        Ok(())
    }

    fn check_stop(&self, during: &str) -> Result<()> {
        if self.stop.is_cancelled() {
            debug!(during, "run stopped during preparation");
            return Err(Error::interrupted(during));
        }
        Ok(())
    }

    async fn ensure_namespace(&self) -> Result<()> {
        let namespace = &self.config.namespace;
        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(namespace.clone()),
                labels: Some(BTreeMap::from([(
                    MANAGED_BY_LABEL.to_string(),
                    MANAGED_BY_VALUE.to_string(),
                )])),
                ..Default::default()
            },
            ..Default::default()
        };

        match self.apis.namespaces.create(&ns).await {
            Ok(_) => {
                self.namespace_created.store(true, Ordering::SeqCst);
                info!(namespace = %namespace, "created probe namespace");
                Ok(())
            }
            Err(Error::AlreadyExists { .. }) => {
                debug!(namespace = %namespace, "reusing existing namespace");
                Ok(())
            }
            Err(e) => {
                let message = format!("cannot create namespace {}: {}", namespace, e);
                self.setup_reporter.error(ids::SETUP_NAMESPACE, &message);
                Err(Error::setup(message))
            }
        }
    }

    /// Best-effort removal of same-named resources left by an earlier run
    async fn sweep_stale(&self) {
        let name = self.config.app_name.as_str();
        let results = [
            ("pod", self.apis.pods.delete(name).await),
            ("service", self.apis.services.delete(name).await),
            (
                "route",
                if self.config.skip_route_test {
                    Ok(())
                } else {
                    self.apis.routes.delete(name).await
                },
            ),
        ];

        for (kind, result) in results {
            if let Err(e) = result {
                self.setup_reporter.debug(
                    ids::SETUP_STALE_DELETE,
                    &format!("could not delete stale {} {}: {}", kind, name, e),
                );
            }
        }
    }

    async fn wait_for_stale_workloads(&self) -> Result<()> {
        let selector = Selector::labelled(self.config.app_selector());
        let timeout = self.config.prepare_timeout;

        let pods = &self.apis.pods;
        let selector = &selector;

        let gone = poll_until(timeout, STALE_POLL_INTERVAL, move || async move {
            let remaining = pods.list(selector).await?;
            if !remaining.is_empty() {
                debug!(count = remaining.len(), "waiting for stale probe pods to terminate");
            }
            Ok::<_, Error>(remaining.is_empty())
        })
        .await;

        if gone {
            return Ok(());
        }
        let message = format!(
            "stale pods labelled {} still present after {}s",
            self.config.app_selector(),
            timeout.as_secs()
        );
        self.setup_reporter.error(ids::SETUP_STALE_RESOURCES, &message);
        Err(Error::setup(message))
    }

    /// Delete the run's resources in pipeline order, then the namespace.
    ///
    /// Never fails; safe to call repeatedly.
    #[instrument(skip(self), fields(namespace = %self.config.namespace))]
    pub async fn cleanup(&self) {
        let name = self.config.app_name.as_str();

        if self.config.keep_app {
            self.reporter.info(
                ids::CLEANUP_KEPT,
                &format!("keeping pod, service and route {}", name),
            );
        } else {
            self.delete_logged("pod", name, self.apis.pods.delete(name))
                .await;
            self.delete_logged("service", name, self.apis.services.delete(name))
                .await;
            if !self.config.skip_route_test {
                self.delete_logged("route", name, self.apis.routes.delete(name))
                    .await;
            }
        }

        let namespace = self.config.namespace.as_str();
        if self.config.keep_namespace {
            self.reporter.info(
                ids::CLEANUP_KEPT,
                &format!("keeping namespace {}", namespace),
            );
        } else if self.namespace_created() {
            self.delete_logged(
                "namespace",
                namespace,
                self.apis.namespaces.delete(namespace),
            )
            .await;
        } else {
            debug!(namespace, "namespace existed before the run, leaving it");
        }

        self.reporter.info(ids::CLEANUP_DONE, "cleanup finished");
    }

    async fn delete_logged(
        &self,
        kind: &str,
        name: &str,
        deletion: impl Future<Output = Result<()>>,
    ) {
        match deletion.await {
            Ok(()) => debug!(kind, name, "deleted"),
            Err(e) => self.reporter.debug(
                ids::CLEANUP_FAILED,
                &format!("failed to delete {} {}: {}", kind, name, e),
            ),
        }
    }
}
