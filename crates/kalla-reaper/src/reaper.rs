//! Stale job reaper: cleans up pipelines of finished or abandoned jobs.
//!
//! One pass:
//! 1. fetch recent job records and index the eligible ones by root pipeline id
//! 2. judge every root pipeline as terminated, abandoned, live or ambiguous
//! 3. for terminated/abandoned pipelines, flag the correlated job record as
//!    cleaned, then request pipeline cleanup
//! 4. launch the cleanup aggregator unless one is already unfinished
//!
//! Flagging a job record always completes before its pipeline's cleanup is
//! requested; a failed flag skips the cleanup for that pipeline. Nothing done
//! earlier in a pass is rolled back.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::ReapError;
use crate::model::{JobParams, JobRecord, PipelineState};
use crate::registry::{BatchJobRuntime, JobRegistry, PipelineRegistry};
use crate::window::RetentionWindow;
use crate::{CLEANUP_AGGREGATOR_CLASS, PARAM_MAX_START_TIME_MSEC};

/// Default number of job records fetched per pass.
pub const DEFAULT_FETCH_LIMIT: usize = 1000;

/// Termination judgement for one root pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    /// Done, aborted, or out of retries.
    Terminated,
    /// Started before the threshold; presumed abandoned whatever its status says.
    Abandoned,
    /// No termination signal.
    Live,
    /// Status missing or unrecognized; left alone.
    Ambiguous,
}

impl Verdict {
    pub fn is_terminable(self) -> bool {
        matches!(self, Verdict::Terminated | Verdict::Abandoned)
    }
}

/// Decide whether a pipeline can be cleaned up safely.
///
/// Exhausted retries and an old start time are judged without the status
/// field. A missing or unrecognized status only rules out the done/aborted
/// check; when nothing else applies it leaves the pipeline alone.
pub fn assess(pipeline: &PipelineState, max_start_time_ms: i64) -> Verdict {
    if pipeline.retries_exhausted() {
        return Verdict::Terminated;
    }

    let status = pipeline
        .status
        .filter(|status| *status != crate::PipelineStatus::Unrecognized);
    if status.is_some_and(|status| status.is_terminal()) {
        return Verdict::Terminated;
    }

    match (pipeline.start_time_ms, status) {
        (Some(started), _) if started < max_start_time_ms => Verdict::Abandoned,
        (_, None) => Verdict::Ambiguous,
        _ => Verdict::Live,
    }
}

/// Index eligible job records by root pipeline id.
///
/// Eligible: started before `max_start_time_ms`, not yet cleaned up, and
/// linked to a root pipeline. Records without a link are out of scope.
pub fn correlate(jobs: Vec<JobRecord>, max_start_time_ms: i64) -> HashMap<String, JobRecord> {
    let mut by_pipeline = HashMap::new();
    for job in jobs {
        if job.cleaned_up || !job.started_before(max_start_time_ms) {
            continue;
        }
        if let Some(pipeline_id) = job.root_pipeline_id() {
            by_pipeline.insert(pipeline_id.to_string(), job);
        }
    }
    by_pipeline
}

/// What happened to the cleanup aggregator at the end of a pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AggregatorLaunch {
    Enqueued { job_id: String },
    AlreadyRunning,
    Failed(String),
}

impl AggregatorLaunch {
    pub fn label(&self) -> &'static str {
        match self {
            AggregatorLaunch::Enqueued { .. } => "enqueued",
            AggregatorLaunch::AlreadyRunning => "already_running",
            AggregatorLaunch::Failed(_) => "failed",
        }
    }
}

/// Summary of one reap pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReapOutcome {
    pub max_start_time_ms: i64,
    pub jobs_correlated: usize,
    pub pipelines_seen: usize,
    pub pipelines_cleaned: usize,
    pub jobs_marked: usize,
    pub ambiguous: usize,
    pub errors: Vec<String>,
    pub aggregator: AggregatorLaunch,
}

pub struct StaleJobReaper {
    jobs: Arc<dyn JobRegistry>,
    pipelines: Arc<dyn PipelineRegistry>,
    runtime: Arc<dyn BatchJobRuntime>,
    window: RetentionWindow,
    fetch_limit: usize,
}

impl StaleJobReaper {
    pub fn new(
        jobs: Arc<dyn JobRegistry>,
        pipelines: Arc<dyn PipelineRegistry>,
        runtime: Arc<dyn BatchJobRuntime>,
    ) -> Self {
        Self {
            jobs,
            pipelines,
            runtime,
            window: RetentionWindow::default(),
            fetch_limit: DEFAULT_FETCH_LIMIT,
        }
    }

    pub fn with_window(mut self, window: RetentionWindow) -> Self {
        self.window = window;
        self
    }

    pub fn with_fetch_limit(mut self, fetch_limit: usize) -> Self {
        self.fetch_limit = fetch_limit;
        self
    }

    pub fn window(&self) -> RetentionWindow {
        self.window
    }

    /// Run one reap pass against the clock value `now_ms`.
    pub async fn reap(&self, now_ms: i64) -> Result<ReapOutcome, ReapError> {
        let max_start_time_ms = self.window.max_start_time_ms(now_ms);

        let recent = self
            .jobs
            .list_recent_jobs(self.fetch_limit, self.window.max_age_ms())
            .await
            .map_err(ReapError::ListJobs)?;
        let mut by_pipeline = correlate(recent, max_start_time_ms);
        let jobs_correlated = by_pipeline.len();

        let pipelines = self
            .pipelines
            .list_root_pipelines()
            .await
            .map_err(ReapError::ListPipelines)?;

        let mut outcome = ReapOutcome {
            max_start_time_ms,
            jobs_correlated,
            pipelines_seen: 0,
            pipelines_cleaned: 0,
            jobs_marked: 0,
            ambiguous: 0,
            errors: Vec::new(),
            aggregator: AggregatorLaunch::AlreadyRunning,
        };

        let mut seen = HashSet::new();
        for pipeline in pipelines {
            if !seen.insert(pipeline.pipeline_id.clone()) {
                continue;
            }
            outcome.pipelines_seen += 1;

            match assess(&pipeline, max_start_time_ms) {
                Verdict::Ambiguous => {
                    debug!(
                        "Pipeline {} has no usable status, leaving it alone",
                        pipeline.pipeline_id
                    );
                    outcome.ambiguous += 1;
                }
                verdict if verdict.is_terminable() => {
                    let job = by_pipeline.remove(&pipeline.pipeline_id);
                    self.clean_pipeline(&pipeline.pipeline_id, job, &mut outcome)
                        .await;
                }
                _ => {}
            }
        }

        info!("{} batch job pipelines cleaned up.", outcome.pipelines_cleaned);

        outcome.aggregator = self.launch_aggregator(max_start_time_ms).await;
        Ok(outcome)
    }

    async fn clean_pipeline(
        &self,
        pipeline_id: &str,
        job: Option<JobRecord>,
        outcome: &mut ReapOutcome,
    ) {
        if let Some(job) = job {
            if let Err(e) = self.jobs.mark_cleaned_up(&job.job_id).await {
                warn!(
                    "Failed to mark job {} cleaned up, skipping pipeline {}: {}",
                    job.job_id, pipeline_id, e
                );
                outcome
                    .errors
                    .push(format!("mark {}: {}", job.job_id, e));
                return;
            }
            outcome.jobs_marked += 1;
        }

        match self.pipelines.cleanup(pipeline_id).await {
            Ok(true) => outcome.pipelines_cleaned += 1,
            Ok(false) => debug!("Pipeline {} is already gone", pipeline_id),
            Err(e) => {
                warn!("Cleanup request for pipeline {} failed: {}", pipeline_id, e);
                outcome
                    .errors
                    .push(format!("cleanup {}: {}", pipeline_id, e));
            }
        }
    }

    async fn launch_aggregator(&self, max_start_time_ms: i64) -> AggregatorLaunch {
        match self
            .jobs
            .has_unfinished_instances_of(CLEANUP_AGGREGATOR_CLASS)
            .await
        {
            Ok(true) => {
                info!("A previous cleanup job is still running.");
                return AggregatorLaunch::AlreadyRunning;
            }
            Ok(false) => {}
            Err(e) => {
                warn!("Could not check for running cleanup jobs, not launching: {}", e);
                return AggregatorLaunch::Failed(e.to_string());
            }
        }

        let mut params = JobParams::new();
        params.insert(
            PARAM_MAX_START_TIME_MSEC.to_string(),
            max_start_time_ms.into(),
        );

        match self.runtime.enqueue(CLEANUP_AGGREGATOR_CLASS, params).await {
            Ok(job_id) => {
                info!("Deletion job {} for auxiliary entities kicked off.", job_id);
                AggregatorLaunch::Enqueued { job_id }
            }
            Err(e) => {
                warn!("Failed to enqueue cleanup job: {}", e);
                AggregatorLaunch::Failed(e.to_string())
            }
        }
    }
}
