//! Records the reaper reads and, in a few narrow places, writes.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::ROOT_PIPELINE_ID_KEY;

/// Parameters handed to an enqueued batch job.
pub type JobParams = serde_json::Map<String, serde_json::Value>;

/// Lifecycle status of a batch-job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Claimed,
    Completed,
    Failed,
    Canceled,
}

impl JobStatus {
    pub fn is_finished(self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Canceled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Claimed => "claimed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Canceled => "canceled",
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "claimed" => Ok(JobStatus::Claimed),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            "canceled" => Ok(JobStatus::Canceled),
            other => Err(format!("unknown job status '{}'", other)),
        }
    }
}

/// Persisted metadata for one batch-job run.
///
/// Status fields belong to the job runtime. The reaper only ever flips
/// `cleaned_up`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub job_id: String,
    /// Store key of the record, shown in alerts for triage.
    pub key: String,
    pub job_class: String,
    pub status: JobStatus,
    pub started_at_ms: Option<i64>,
    pub updated_at_ms: i64,
    #[serde(default)]
    pub counters: BTreeMap<String, i64>,
    #[serde(default)]
    pub shard_retries: u32,
    #[serde(default)]
    pub slice_retries: u32,
    pub last_work_item: Option<String>,
    #[serde(default)]
    pub cleaned_up: bool,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl JobRecord {
    /// Minimal record with empty status fields.
    pub fn new(job_id: impl Into<String>, job_class: impl Into<String>) -> Self {
        let job_id = job_id.into();
        Self {
            key: job_id.clone(),
            job_id,
            job_class: job_class.into(),
            status: JobStatus::Pending,
            started_at_ms: None,
            updated_at_ms: 0,
            counters: BTreeMap::new(),
            shard_retries: 0,
            slice_retries: 0,
            last_work_item: None,
            cleaned_up: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn root_pipeline_id(&self) -> Option<&str> {
        self.metadata
            .get(ROOT_PIPELINE_ID_KEY)
            .map(String::as_str)
            .filter(|id| !id.is_empty())
    }

    /// True when the job started strictly before `max_start_time_ms`.
    /// Jobs that never started are not eligible.
    pub fn started_before(&self, max_start_time_ms: i64) -> bool {
        self.started_at_ms
            .is_some_and(|started| started < max_start_time_ms)
    }
}

/// Status reported by the pipeline runtime for a root pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Waiting,
    Running,
    Retry,
    Done,
    Aborted,
    /// A value the pipeline runtime sent that this crate does not know.
    #[serde(other)]
    Unrecognized,
}

impl PipelineStatus {
    /// Parse a runtime status string. Unknown values map to `Unrecognized`
    /// rather than failing, so one odd row never breaks a listing.
    pub fn parse(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "waiting" => PipelineStatus::Waiting,
            "run" | "running" => PipelineStatus::Running,
            "retry" => PipelineStatus::Retry,
            "done" => PipelineStatus::Done,
            "aborted" => PipelineStatus::Aborted,
            _ => PipelineStatus::Unrecognized,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, PipelineStatus::Done | PipelineStatus::Aborted)
    }
}

impl fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PipelineStatus::Waiting => "waiting",
            PipelineStatus::Running => "running",
            PipelineStatus::Retry => "retry",
            PipelineStatus::Done => "done",
            PipelineStatus::Aborted => "aborted",
            PipelineStatus::Unrecognized => "unrecognized",
        };
        f.write_str(s)
    }
}

/// Root pipeline as listed by the pipeline registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineState {
    pub pipeline_id: String,
    pub status: Option<PipelineStatus>,
    pub start_time_ms: Option<i64>,
    pub current_attempt: u32,
    pub max_attempts: u32,
}

impl PipelineState {
    pub fn new(pipeline_id: impl Into<String>, status: Option<PipelineStatus>) -> Self {
        Self {
            pipeline_id: pipeline_id.into(),
            status,
            start_time_ms: None,
            current_attempt: 0,
            max_attempts: 1,
        }
    }

    pub fn retries_exhausted(&self) -> bool {
        self.current_attempt > self.max_attempts
    }
}

/// The two kinds of auxiliary bookkeeping rows the aggregator sweeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuxiliaryKind {
    /// Per-run map/reduce state. Aged by start time.
    Run,
    /// Per-shard state. Aged by last update time.
    Shard,
}

impl AuxiliaryKind {
    pub fn as_str(self) -> &'static str {
        match self {
            AuxiliaryKind::Run => "run",
            AuxiliaryKind::Shard => "shard",
        }
    }
}

/// Final result of a run or shard.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Failed,
    Aborted,
}

impl FromStr for ResultStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(ResultStatus::Success),
            "failed" => Ok(ResultStatus::Failed),
            "aborted" => Ok(ResultStatus::Aborted),
            other => Err(format!("unknown result status '{}'", other)),
        }
    }
}

/// One auxiliary row. `result_status` is `None` while the run is in flight.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxiliaryState {
    pub id: String,
    pub kind: AuxiliaryKind,
    pub result_status: Option<ResultStatus>,
    pub started_at_ms: Option<i64>,
    pub updated_at_ms: Option<i64>,
}

impl AuxiliaryState {
    /// The timestamp this kind is aged by.
    pub fn reference_time_ms(&self) -> Option<i64> {
        match self.kind {
            AuxiliaryKind::Run => self.started_at_ms,
            AuxiliaryKind::Shard => self.updated_at_ms,
        }
    }

    /// Succeeded and aged past `max_start_time_ms`.
    pub fn is_expired(&self, max_start_time_ms: i64) -> bool {
        self.result_status == Some(ResultStatus::Success)
            && self
                .reference_time_ms()
                .is_some_and(|t| t < max_start_time_ms)
    }
}
