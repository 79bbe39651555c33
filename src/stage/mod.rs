//! Pipeline stages
//!
//! Every stage follows the same template: create one resource, wait for it to
//! become ready, optionally test it over the network, and finalize its
//! timings. [`run_stage`] implements the template once; the stage types only
//! provide the resource-specific parts.
//!
//! - [`WorkloadStage`] - the probe pod
//! - [`EndpointStage`] - the service in front of the pod
//! - [`RouteStage`] - the external route to the service

use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::api::ClusterApis;
use crate::config::ProbeConfig;
use crate::prober::ConnectivityProbe;
use crate::reporter::{ids, Reporter};
use crate::result::{ProbeRun, Stage, StageResult};
use crate::{Error, Result};

pub mod endpoint;
pub mod route;
pub mod workload;

pub use endpoint::EndpointStage;
pub use route::RouteStage;
pub use workload::WorkloadStage;

/// Everything a stage needs to do its work
#[derive(Clone)]
pub struct StageContext {
    /// Probe configuration
    pub config: Arc<ProbeConfig>,
    /// Resource APIs scoped to the probe namespace
    pub apis: ClusterApis,
    /// Connectivity prober for the optional test phase
    pub prober: Arc<dyn ConnectivityProbe>,
    /// Reporting sink
    pub reporter: Arc<dyn Reporter>,
    /// Fires when the run is interrupted; stops further probe attempts
    pub stop: CancellationToken,
}

/// Sub-step of a stage
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Phase {
    /// Issuing the creation call
    Create,
    /// Waiting for readiness
    WaitReady,
    /// Connectivity test
    Test,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create its resource"),
            Self::WaitReady => write!(f, "become ready"),
            Self::Test => write!(f, "pass its connectivity test"),
        }
    }
}

/// How a stage classifies one of its failures for the operator
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Diagnosis {
    /// Stable diagnostic identifier
    pub id: &'static str,
    /// Most likely root causes, most likely first
    pub causes: &'static [&'static str],
}

/// Resource-specific parts of a stage
#[async_trait]
pub trait ProbeStage: Send + Sync {
    /// What the create phase hands to the wait phase
    type Created: Send;
    /// What the wait phase hands to the test phase
    type Ready: Send + Sync;

    /// Which stage this is
    fn kind(&self) -> Stage;

    /// Identifier reported when the stage succeeds
    fn success_id(&self) -> &'static str;

    /// Issue the single creation call
    async fn create(&self, ctx: &StageContext) -> Result<Self::Created>;

    /// Wait until the created resource is usable
    async fn wait_ready(&self, ctx: &StageContext, created: Self::Created) -> Result<Self::Ready>;

    /// Whether the test phase runs under this configuration
    fn runs_test(&self, _config: &ProbeConfig) -> bool {
        false
    }

    /// Exercise the ready resource, returning the attempts it took
    async fn test(&self, _ctx: &StageContext, _ready: &Self::Ready) -> Result<u32> {
        Ok(0)
    }

    /// Classify a failure for reporting
    fn diagnose(&self, phase: Phase, error: &Error) -> Diagnosis;
}

/// Run one stage through the create, wait-ready, test template.
///
/// Every transition is written into the run held by `progress`, which the
/// caller must be the only writer of. Returns whether the stage succeeded.
///
/// Once `ctx.stop` fires the stage goes quiet: it is not begun if it hasn't
/// started, the readiness wait is dropped, and nothing further is recorded.
/// A creation call already in flight is left to finish.
pub async fn run_stage<S: ProbeStage>(
    stage: &S,
    ctx: &StageContext,
    progress: &watch::Sender<ProbeRun>,
) -> bool {
    let kind = stage.kind();
    if ctx.stop.is_cancelled() {
        debug!(stage = %kind, "run stopped, not starting stage");
        return false;
    }
    let record = |update: &dyn Fn(&mut StageResult)| {
        progress.send_modify(|run| update(run.stage_mut(kind)));
    };

    let stage_started = Instant::now();
    record(&|r| r.begin());
    debug!(stage = %kind, "stage started");

    let created = match stage.create(ctx).await {
        Ok(created) => created,
        Err(e) => return fail(stage, ctx, &record, Phase::Create, stage_started, e),
    };
    if ctx.stop.is_cancelled() {
        debug!(stage = %kind, "run stopped after create");
        return false;
    }
    record(&|r| r.mark_created());

    let wait_started = Instant::now();
    let waited = tokio::select! {
        biased;
        () = ctx.stop.cancelled() => {
            debug!(stage = %kind, "run stopped while waiting for readiness");
            return false;
        }
        waited = stage.wait_ready(ctx, created) => waited,
    };
    let ready = match waited {
        Ok(ready) => ready,
        Err(e) => return fail(stage, ctx, &record, Phase::WaitReady, wait_started, e),
    };
    record(&|r| r.mark_ready());

    if stage.runs_test(&ctx.config) {
        let test_started = Instant::now();
        match stage.test(ctx, &ready).await {
            Ok(attempts) => {
                record(&|r| r.mark_tested());
                debug!(stage = %kind, attempts, "connectivity test passed");
            }
            Err(e) => return fail(stage, ctx, &record, Phase::Test, test_started, e),
        }
    } else {
        ctx.reporter.debug(
            ids::STAGE_PROGRESS,
            &format!("{} stage: connectivity test not run", kind),
        );
    }

    if ctx.stop.is_cancelled() {
        debug!(stage = %kind, "run stopped before the stage could finish");
        return false;
    }
    record(&|r| r.finish(true));
    ctx.reporter.info(
        stage.success_id(),
        &format!(
            "{} stage succeeded in {:.1}s",
            kind,
            stage_started.elapsed().as_secs_f64()
        ),
    );
    true
}

fn fail<S: ProbeStage>(
    stage: &S,
    ctx: &StageContext,
    record: &dyn Fn(&dyn Fn(&mut StageResult)),
    phase: Phase,
    phase_started: Instant,
    error: Error,
) -> bool {
    let message = error.to_string();
    record(&|r| r.fail(message.clone()));

    let diagnosis = stage.diagnose(phase, &error);
    ctx.reporter.error(
        diagnosis.id,
        &failure_message(stage.kind(), phase, phase_started, &error, diagnosis.causes),
    );
    false
}

/// Operator-facing failure text: stage, phase, elapsed time, error, causes
pub fn failure_message(
    stage: Stage,
    phase: Phase,
    phase_started: Instant,
    error: &Error,
    causes: &[&str],
) -> String {
    let mut message = format!(
        "{} stage failed to {} after {:.1}s: {}",
        stage,
        phase,
        phase_started.elapsed().as_secs_f64(),
        error
    );
    if !causes.is_empty() {
        message.push_str("\nLikely causes:");
        for cause in causes {
            message.push_str("\n  - ");
            message.push_str(cause);
        }
    }
    message
}

/// `http://host:port/`, bracketing IPv6 literals
pub(crate) fn http_url(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("http://[{}]:{}/", host, port)
    } else {
        format!("http://{}:{}/", host, port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reporter::recording::RecordingReporter;
    use crate::reporter::Level;
    use crate::testing::{context, probe_config, MockApis};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    /// Stage double whose phases succeed or fail on request
    struct ScriptedStage {
        create_ok: bool,
        ready_ok: bool,
        test: Option<bool>,
        created: AtomicBool,
        tested: AtomicBool,
    }

    impl ScriptedStage {
        fn new(create_ok: bool, ready_ok: bool, test: Option<bool>) -> Self {
            Self {
                create_ok,
                ready_ok,
                test,
                created: AtomicBool::new(false),
                tested: AtomicBool::new(false),
            }
        }
    }

    #[async_trait]
    impl ProbeStage for ScriptedStage {
        type Created = ();
        type Ready = ();

        fn kind(&self) -> Stage {
            Stage::Endpoint
        }

        fn success_id(&self) -> &'static str {
            "OK"
        }

        async fn create(&self, _ctx: &StageContext) -> Result<()> {
            self.created.store(true, Ordering::SeqCst);
            if self.create_ok {
                Ok(())
            } else {
                Err(Error::AlreadyExists {
                    kind: "Service".to_string(),
                    name: "app".to_string(),
                })
            }
        }

        async fn wait_ready(&self, _ctx: &StageContext, _created: ()) -> Result<()> {
            if self.ready_ok {
                Ok(())
            } else {
                Err(Error::ReadinessTimeout {
                    resource: "endpoints/app".to_string(),
                    condition: "ready".to_string(),
                    waited: Duration::from_secs(5),
                    last_observed: "no subsets".to_string(),
                })
            }
        }

        fn runs_test(&self, _config: &ProbeConfig) -> bool {
            self.test.is_some()
        }

        async fn test(&self, _ctx: &StageContext, _ready: &()) -> Result<u32> {
            self.tested.store(true, Ordering::SeqCst);
            match self.test {
                Some(true) => Ok(1),
                _ => Err(Error::Connectivity {
                    url: "http://10.0.0.1:8080/".to_string(),
                    attempts: 3,
                    reason: "connection refused".to_string(),
                }),
            }
        }

        fn diagnose(&self, phase: Phase, _error: &Error) -> Diagnosis {
            let id = match phase {
                Phase::Create => "CREATE",
                Phase::WaitReady => "WAIT",
                Phase::Test => "TEST",
            };
            Diagnosis {
                id,
                causes: &["first cause", "second cause"],
            }
        }
    }

    async fn run(stage: ScriptedStage) -> (bool, StageResult, Arc<RecordingReporter>) {
        let reporter = Arc::new(RecordingReporter::default());
        let ctx = context(MockApis::new(), None, reporter.clone(), probe_config());
        let (tx, _rx) = watch::channel(ProbeRun::new("probe-ns"));

        let ok = run_stage(&stage, &ctx, &tx).await;
        let result = tx.borrow().stage(Stage::Endpoint).clone();
        (ok, result, reporter)
    }

    /// Story: All phases pass and every stamp is recorded
    #[tokio::test]
    async fn story_successful_stage_records_all_stamps() {
        let (ok, r, reporter) = run(ScriptedStage::new(true, true, Some(true))).await;

        assert!(ok);
        assert!(r.required && r.success);
        assert!(r.created_time.is_some() && r.ready_time.is_some());
        assert!(r.test_time.is_some() && r.end_time.is_some());
        assert_eq!(reporter.find("OK").map(|(l, _)| l), Some(Level::Info));
    }

    /// Story: Creation failure ends the stage as required and failed
    #[tokio::test]
    async fn story_create_failure_marks_required_failed() {
        let (ok, r, reporter) = run(ScriptedStage::new(false, true, Some(true))).await;

        assert!(!ok);
        assert!(r.required && !r.success);
        assert!(r.created_time.is_none());
        assert!(r.end_time.is_some());
        assert!(r.error.as_deref().unwrap().contains("already exists"));

        let (level, message) = reporter.find("CREATE").unwrap();
        assert_eq!(level, Level::Error);
        assert!(message.starts_with("endpoint stage failed to create its resource"));
        assert!(message.contains("Likely causes:\n  - first cause\n  - second cause"));
    }

    /// Story: A readiness timeout stops the stage before any test
    #[tokio::test]
    async fn story_readiness_failure_skips_test() {
        let stage = ScriptedStage::new(true, false, Some(true));
        let reporter = Arc::new(RecordingReporter::default());
        let ctx = context(MockApis::new(), None, reporter.clone(), probe_config());
        let (tx, _rx) = watch::channel(ProbeRun::new("probe-ns"));

        assert!(!run_stage(&stage, &ctx, &tx).await);
        assert!(!stage.tested.load(Ordering::SeqCst));

        let r = tx.borrow().stage(Stage::Endpoint).clone();
        assert!(r.created_time.is_some());
        assert!(r.ready_time.is_none());
        assert!(r.end_time.is_some());
        let (_, message) = reporter.find("WAIT").unwrap();
        assert!(message.contains("timed out after 5s"));
    }

    /// Story: A skipped test still yields a successful stage without a test stamp
    #[tokio::test]
    async fn story_skipped_test_is_success() {
        let (ok, r, reporter) = run(ScriptedStage::new(true, true, None)).await;

        assert!(ok);
        assert!(r.success);
        assert!(r.test_time.is_none());
        assert!(r.test_duration().is_none());
        assert!(reporter.ids().contains(&ids::STAGE_PROGRESS.to_string()));
    }

    /// Story: A failed test names the attempts in the stage error
    #[tokio::test]
    async fn story_test_failure_records_error() {
        let (ok, r, reporter) = run(ScriptedStage::new(true, true, Some(false))).await;

        assert!(!ok);
        assert!(r.ready_time.is_some());
        assert!(r.test_time.is_none());
        assert!(r.error.as_deref().unwrap().contains("3 attempt(s)"));
        assert!(reporter.find("TEST").is_some());
    }

    /// Story: A stopped run never begins another stage
    ///
    /// After an interrupt the worker may still reach the next stage. It must
    /// not create anything or touch the recorded result once cleanup may
    /// already have run.
    #[tokio::test]
    async fn story_stopped_run_creates_nothing() {
        let stage = ScriptedStage::new(true, true, Some(true));
        let reporter = Arc::new(RecordingReporter::default());
        let ctx = context(MockApis::new(), None, reporter.clone(), probe_config());
        ctx.stop.cancel();
        let (tx, _rx) = watch::channel(ProbeRun::new("probe-ns"));

        assert!(!run_stage(&stage, &ctx, &tx).await);

        assert!(!stage.created.load(Ordering::SeqCst));
        assert!(!stage.tested.load(Ordering::SeqCst));
        let r = tx.borrow().stage(Stage::Endpoint).clone();
        assert!(!r.required);
        assert!(r.begin_time.is_none());
        assert!(reporter.entries().is_empty());
    }

    #[test]
    fn http_url_brackets_ipv6() {
        assert_eq!(http_url("10.0.0.1", 8080), "http://10.0.0.1:8080/");
        assert_eq!(http_url("fd00::1", 80), "http://[fd00::1]:80/");
    }
}
