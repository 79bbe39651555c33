//! Probe orchestration
//!
//! The pipeline (prepare, then the workload, endpoint and route stages) runs on
//! a dedicated worker task while the orchestrator waits for either the worker
//! or an external interrupt. If the interrupt wins, the worker is abandoned in
//! place: it is not aborted, the orchestrator stops waiting on it, records the
//! in-flight stage as aborted, and goes straight to cleanup. Cleanup runs
//! exactly once per run, whatever the outcome.
//!
//! An abandoned worker is told to stop through a cancellation token. It then
//! starts no further stage, no longer moves the run state, and its reports
//! are dropped, so nothing it does can land after the summary.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::api::ClusterApis;
use crate::config::ProbeConfig;
use crate::environment::Environment;
use crate::prober::ConnectivityProbe;
use crate::reporter::{ids, GatedReporter, Reporter};
use crate::result::{ProbeRun, RunOutcome, Stage, StageResult};
use crate::stage::{run_stage, EndpointStage, RouteStage, StageContext, WorkloadStage};

/// Message recorded on the stage that was in flight when the run was interrupted
pub const INTERRUPT_MESSAGE: &str = "received interrupt; aborting";

/// Where the run currently is
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProbeState {
    /// Preparing the namespace
    Preparing,
    /// Workload stage in progress
    RunningWorkloadStage,
    /// Endpoint stage in progress
    RunningEndpointStage,
    /// Route stage in progress
    RunningRouteStage,
    /// Deriving the final result
    Finalizing,
    /// Tearing down resources
    Cleanup,
    /// Finished
    Done,
}

impl fmt::Display for ProbeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Preparing => "preparing the environment",
            Self::RunningWorkloadStage => "running the workload stage",
            Self::RunningEndpointStage => "running the endpoint stage",
            Self::RunningRouteStage => "running the route stage",
            Self::Finalizing => "finalizing",
            Self::Cleanup => "cleaning up",
            Self::Done => "done",
        };
        write!(f, "{}", s)
    }
}

fn transition(state: &watch::Sender<ProbeState>, next: ProbeState) {
    let previous = state.send_replace(next);
    debug!(from = ?previous, to = ?next, "probe state transition");
}

/// Worker-side transition. Returns false, leaving the state alone, once
/// `stop` has fired.
///
/// The check runs under the channel's write lock, and the orchestrator
/// cancels before its own transitions, so a stopped worker can never
/// overwrite them.
fn advance(state: &watch::Sender<ProbeState>, stop: &CancellationToken, next: ProbeState) -> bool {
    state.send_if_modified(|current| {
        if stop.is_cancelled() {
            return false;
        }
        debug!(from = ?*current, to = ?next, "probe state transition");
        *current = next;
        true
    })
}

/// Drives one probe run from setup to cleanup
pub struct ProbeOrchestrator {
    config: Arc<ProbeConfig>,
    apis: ClusterApis,
    prober: Arc<dyn ConnectivityProbe>,
    reporter: Arc<dyn Reporter>,
    state: Arc<watch::Sender<ProbeState>>,
}

impl ProbeOrchestrator {
    /// Create an orchestrator; the configuration is expected to be validated
    pub fn new(
        config: ProbeConfig,
        apis: ClusterApis,
        prober: Arc<dyn ConnectivityProbe>,
        reporter: Arc<dyn Reporter>,
    ) -> Self {
        let (state, _) = watch::channel(ProbeState::Preparing);
        Self {
            config: Arc::new(config),
            apis,
            prober,
            reporter,
            state: Arc::new(state),
        }
    }

    /// Follow the run's progress through [`ProbeState`]
    pub fn state(&self) -> watch::Receiver<ProbeState> {
        self.state.subscribe()
    }

    /// Run the probe until the pipeline finishes or `interrupt` resolves.
    ///
    /// Never fails: every failure, including a crash of the pipeline worker,
    /// is recorded in the returned run.
    #[instrument(skip(self, interrupt), fields(namespace = %self.config.namespace))]
    pub async fn run<I>(&self, interrupt: I) -> ProbeRun
    where
        I: Future<Output = ()> + Send,
    {
        let stop = CancellationToken::new();
        let environment = Arc::new(
            Environment::new(self.apis.clone(), self.config.clone(), self.reporter.clone())
                .with_stop(stop.clone()),
        );
        let (progress, snapshot) = watch::channel(ProbeRun::new(self.config.namespace.clone()));
        let ctx = StageContext {
            config: self.config.clone(),
            apis: self.apis.clone(),
            prober: self.prober.clone(),
            reporter: Arc::new(GatedReporter::new(self.reporter.clone(), stop.clone())),
            stop: stop.clone(),
        };

        transition(&self.state, ProbeState::Preparing);
        info!(app = %self.config.app_name, "starting probe run");
        let worker = tokio::spawn(pipeline(environment.clone(), ctx, progress, self.state.clone()));

        let (outcome, message, abandoned) = tokio::select! {
            biased;
            joined = worker => match joined {
                Ok((outcome, message)) => (outcome, message, None),
                Err(e) => {
                    let message = format!("pipeline worker crashed: {}", panic_message(e));
                    (RunOutcome::Crashed, Some(message.clone()), Some(message))
                }
            },
            () = interrupt => {
                stop.cancel();
                let during = *self.state.borrow();
                warn!(state = %during, "received interrupt, abandoning pipeline worker");
                (
                    RunOutcome::Aborted,
                    Some(format!("interrupted while {}", during)),
                    Some(INTERRUPT_MESSAGE.to_string()),
                )
            }
        };

        transition(&self.state, ProbeState::Finalizing);
        let mut run = snapshot.borrow().clone();
        if let Some(reason) = abandoned {
            abandon_in_flight(&mut run, &reason);
        }
        if message.is_some() {
            run.message = message;
        }
        run.finalize(outcome);

        transition(&self.state, ProbeState::Cleanup);
        environment.cleanup().await;

        self.report_summary(&run);
        transition(&self.state, ProbeState::Done);
        run
    }

    fn report_summary(&self, run: &ProbeRun) {
        let verdict = match (run.outcome, run.success) {
            (_, true) => "succeeded",
            (RunOutcome::Aborted, _) => "was aborted",
            (RunOutcome::Crashed, _) => "crashed",
            (RunOutcome::SetupFailed, _) => "failed during setup",
            _ => "failed",
        };
        let mut summary = format!(
            "probe run in namespace {} {} after {}",
            run.namespace,
            verdict,
            format_millis(run.total_duration().map(|d| d.num_milliseconds()))
        );
        if let Some(message) = &run.message {
            summary.push_str(&format!(": {}", message));
        }
        for stage in Stage::ALL {
            summary.push_str(&format!("\n  {}: {}", stage, describe_stage(run.stage(stage))));
        }

        match run.outcome {
            _ if run.success => self.reporter.info(ids::RUN_SUCCEEDED, &summary),
            RunOutcome::Aborted => self.reporter.warn(ids::RUN_INTERRUPTED, &summary),
            RunOutcome::Crashed => self.reporter.error(ids::RUN_CRASHED, &summary),
            _ => self.reporter.error(ids::RUN_FAILED, &summary),
        }
    }
}

/// The pipeline worker. The only writer of the run held by `progress`.
///
/// Checks `ctx.stop` before every step; the outcome it returns after a stop
/// is never used.
async fn pipeline(
    environment: Arc<Environment>,
    ctx: StageContext,
    progress: watch::Sender<ProbeRun>,
    state: Arc<watch::Sender<ProbeState>>,
) -> (RunOutcome, Option<String>) {
    let stopped = || (RunOutcome::Aborted, Some(INTERRUPT_MESSAGE.to_string()));

    if let Err(e) = environment.prepare().await {
        return (RunOutcome::SetupFailed, Some(e.to_string()));
    }

    if !advance(&state, &ctx.stop, ProbeState::RunningWorkloadStage) {
        return stopped();
    }
    if !run_stage(&WorkloadStage, &ctx, &progress).await {
        return (RunOutcome::Completed, None);
    }

    if !advance(&state, &ctx.stop, ProbeState::RunningEndpointStage) {
        return stopped();
    }
    if !run_stage(&EndpointStage, &ctx, &progress).await {
        return (RunOutcome::Completed, None);
    }

    if ctx.config.skip_route_test {
        ctx.reporter
            .info(ids::ROUTE_STAGE_SKIPPED, "route stage skipped by configuration");
        return (RunOutcome::Completed, None);
    }

    if !advance(&state, &ctx.stop, ProbeState::RunningRouteStage) {
        return stopped();
    }
    run_stage(&RouteStage, &ctx, &progress).await;
    (RunOutcome::Completed, None)
}

/// End every begun-but-unfinished stage as failed with `reason`
fn abandon_in_flight(run: &mut ProbeRun, reason: &str) {
    for stage in Stage::ALL {
        let result = run.stage_mut(stage);
        if result.in_flight() {
            result.fail(reason);
        }
    }
}

fn panic_message(error: JoinError) -> String {
    if !error.is_panic() {
        return error.to_string();
    }
    let payload = error.into_panic();
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn describe_stage(result: &StageResult) -> String {
    if !result.required {
        return "not run".to_string();
    }
    let total = format_millis(result.total_duration().map(|d| d.num_milliseconds()));
    if result.success {
        let mut parts = vec![format!("succeeded in {}", total)];
        if let Some(d) = result.ready_duration() {
            parts.push(format!("ready after {}", format_millis(Some(d.num_milliseconds()))));
        }
        if let Some(d) = result.test_duration() {
            parts.push(format!("tested in {}", format_millis(Some(d.num_milliseconds()))));
        }
        parts.join(", ")
    } else {
        format!(
            "failed after {}: {}",
            total,
            result.error.as_deref().unwrap_or("unknown error")
        )
    }
}

fn format_millis(ms: Option<i64>) -> String {
    match ms {
        Some(ms) => format!("{:.1}s", ms as f64 / 1000.0),
        None => "n/a".to_string(),
    }
}
