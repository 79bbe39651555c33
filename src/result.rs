//! Run and stage results
//!
//! A [`ProbeRun`] is written only by the pipeline worker while the run is in
//! flight and handed out as a finished snapshot afterwards. Timestamps that
//! never happened stay `None` and serialize to `null`, as do durations whose
//! endpoints are missing, so "never happened" can't be read as "instant".

use std::fmt;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde::{Serialize, Serializer};

use crate::{Result, RESULTS_FILE_NAME};

/// One unit of the pipeline
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Stage {
    /// The probe pod
    Workload,
    /// The service and its endpoints
    Endpoint,
    /// The external route
    Route,
}

impl Stage {
    /// All stages in pipeline order
    pub const ALL: [Stage; 3] = [Stage::Workload, Stage::Endpoint, Stage::Route];
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Workload => write!(f, "workload"),
            Self::Endpoint => write!(f, "endpoint"),
            Self::Route => write!(f, "route"),
        }
    }
}

/// How the run ended
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum RunOutcome {
    /// Still in flight
    #[default]
    Running,
    /// The pipeline ran to its natural end (stages may still have failed)
    Completed,
    /// The environment could not be prepared; no stage ran
    SetupFailed,
    /// An external interrupt arrived before the pipeline finished
    Aborted,
    /// The pipeline worker panicked
    Crashed,
}

/// Outcome and timing of one stage
#[derive(Clone, Debug, Default, PartialEq)]
pub struct StageResult {
    /// When the stage started
    pub begin_time: Option<DateTime<Utc>>,
    /// When the stage's resource was created
    pub created_time: Option<DateTime<Utc>>,
    /// When the resource was observed ready
    pub ready_time: Option<DateTime<Utc>>,
    /// When the connectivity test passed
    pub test_time: Option<DateTime<Utc>>,
    /// When the stage finished
    pub end_time: Option<DateTime<Utc>>,
    /// Whether failure of this stage fails the run; set once attempted
    pub required: bool,
    /// Whether the stage succeeded
    pub success: bool,
    /// Failure message, if the stage failed
    pub error: Option<String>,
}

impl StageResult {
    /// Mark the stage as attempted and stamp its begin time
    pub fn begin(&mut self) {
        self.required = true;
        self.begin_time = Some(self.next_stamp());
    }

    /// Stamp the creation time. Ignored unless the stage has begun.
    pub fn mark_created(&mut self) {
        if self.begin_time.is_some() {
            self.created_time = Some(self.next_stamp());
        }
    }

    /// Stamp the ready time. Ignored unless creation was stamped.
    pub fn mark_ready(&mut self) {
        if self.created_time.is_some() {
            self.ready_time = Some(self.next_stamp());
        }
    }

    /// Stamp the test time. Ignored unless readiness was stamped.
    pub fn mark_tested(&mut self) {
        if self.ready_time.is_some() {
            self.test_time = Some(self.next_stamp());
        }
    }

    /// Stamp the end time and record the outcome
    pub fn finish(&mut self, success: bool) {
        if self.begin_time.is_some() {
            self.end_time = Some(self.next_stamp());
        }
        self.success = success;
    }

    /// Stamp the end time as a failure with the given message
    pub fn fail(&mut self, message: impl Into<String>) {
        self.error = Some(message.into());
        self.finish(false);
    }

    /// Whether the stage has begun but not finished
    pub fn in_flight(&self) -> bool {
        self.begin_time.is_some() && self.end_time.is_none()
    }

    /// `created - begin`
    pub fn created_duration(&self) -> Option<TimeDelta> {
        between(self.begin_time, self.created_time)
    }

    /// `ready - created`
    pub fn ready_duration(&self) -> Option<TimeDelta> {
        between(self.created_time, self.ready_time)
    }

    /// `test - ready`
    pub fn test_duration(&self) -> Option<TimeDelta> {
        between(self.ready_time, self.test_time)
    }

    /// `end - begin`
    pub fn total_duration(&self) -> Option<TimeDelta> {
        between(self.begin_time, self.end_time)
    }

    // Never earlier than the latest stamp already recorded, so the sequence
    // stays monotonic even if the wall clock steps backwards.
    fn next_stamp(&self) -> DateTime<Utc> {
        let now = Utc::now();
        [
            self.begin_time,
            self.created_time,
            self.ready_time,
            self.test_time,
            self.end_time,
        ]
        .into_iter()
        .flatten()
        .max()
        .map_or(now, |latest| latest.max(now))
    }
}

fn between(start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> Option<TimeDelta> {
    Some(end? - start?)
}

fn millis(delta: Option<TimeDelta>) -> Option<i64> {
    delta.map(|d| d.num_milliseconds())
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct StageResultRecord<'a> {
    begin_time: Option<DateTime<Utc>>,
    created_time: Option<DateTime<Utc>>,
    ready_time: Option<DateTime<Utc>>,
    test_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    created_duration_ms: Option<i64>,
    ready_duration_ms: Option<i64>,
    test_duration_ms: Option<i64>,
    total_duration_ms: Option<i64>,
    required: bool,
    success: bool,
    error: Option<&'a str>,
}

impl Serialize for StageResult {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        StageResultRecord {
            begin_time: self.begin_time,
            created_time: self.created_time,
            ready_time: self.ready_time,
            test_time: self.test_time,
            end_time: self.end_time,
            created_duration_ms: millis(self.created_duration()),
            ready_duration_ms: millis(self.ready_duration()),
            test_duration_ms: millis(self.test_duration()),
            total_duration_ms: millis(self.total_duration()),
            required: self.required,
            success: self.success,
            error: self.error.as_deref(),
        }
        .serialize(serializer)
    }
}

/// Per-stage results
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Stages {
    /// Workload stage
    pub workload: StageResult,
    /// Endpoint stage
    pub endpoint: StageResult,
    /// Route stage
    pub route: StageResult,
}

/// Result of one probe invocation
#[derive(Clone, Debug, PartialEq)]
pub struct ProbeRun {
    /// Namespace the run used
    pub namespace: String,
    /// When the run started
    pub begin_time: DateTime<Utc>,
    /// When the run finished
    pub end_time: Option<DateTime<Utc>>,
    /// True iff the run completed and every required stage succeeded
    pub success: bool,
    /// How the run ended
    pub outcome: RunOutcome,
    /// Run-level message for setup failures, interrupts and crashes
    pub message: Option<String>,
    /// Per-stage results
    pub stages: Stages,
}

impl ProbeRun {
    /// Start a new run now
    pub fn new(namespace: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            begin_time: Utc::now(),
            end_time: None,
            success: false,
            outcome: RunOutcome::Running,
            message: None,
            stages: Stages::default(),
        }
    }

    /// Result of one stage
    pub fn stage(&self, stage: Stage) -> &StageResult {
        match stage {
            Stage::Workload => &self.stages.workload,
            Stage::Endpoint => &self.stages.endpoint,
            Stage::Route => &self.stages.route,
        }
    }

    /// Mutable result of one stage
    pub fn stage_mut(&mut self, stage: Stage) -> &mut StageResult {
        match stage {
            Stage::Workload => &mut self.stages.workload,
            Stage::Endpoint => &mut self.stages.endpoint,
            Stage::Route => &mut self.stages.route,
        }
    }

    /// Whether every stage that was attempted succeeded.
    ///
    /// Stages that were never reached are not required and don't count.
    pub fn required_stages_succeeded(&self) -> bool {
        Stage::ALL
            .iter()
            .map(|s| self.stage(*s))
            .filter(|r| r.required)
            .all(|r| r.success)
    }

    /// Stamp the end time, record the outcome and derive overall success
    pub fn finalize(&mut self, outcome: RunOutcome) {
        self.outcome = outcome;
        let now = Utc::now();
        self.end_time = Some(now.max(self.begin_time));
        self.success = outcome == RunOutcome::Completed && self.required_stages_succeeded();
    }

    /// `end - begin`
    pub fn total_duration(&self) -> Option<TimeDelta> {
        between(Some(self.begin_time), self.end_time)
    }

    /// Write the run as pretty JSON to `<dir>/appcreate-results.json`
    pub fn persist(&self, dir: &Path) -> Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(RESULTS_FILE_NAME);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct ProbeRunRecord<'a> {
    namespace: &'a str,
    begin_time: DateTime<Utc>,
    end_time: Option<DateTime<Utc>>,
    total_duration_ms: Option<i64>,
    success: bool,
    outcome: RunOutcome,
    message: Option<&'a str>,
    stages: &'a Stages,
}

impl Serialize for ProbeRun {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        ProbeRunRecord {
            namespace: &self.namespace,
            begin_time: self.begin_time,
            end_time: self.end_time,
            total_duration_ms: millis(self.total_duration()),
            success: self.success,
            outcome: self.outcome,
            message: self.message.as_deref(),
            stages: &self.stages,
        }
        .serialize(serializer)
    }
}
