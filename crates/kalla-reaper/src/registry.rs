//! Collaborator interfaces consumed by the reaper.

use async_trait::async_trait;

use crate::error::CollaboratorError;
use crate::model::{AuxiliaryKind, AuxiliaryState, JobParams, JobRecord, PipelineState};

pub type CollaboratorResult<T> = Result<T, CollaboratorError>;

/// Query and flag job records.
#[async_trait]
pub trait JobRegistry: Send + Sync {
    /// Up to `limit` records queued within the last `max_age_ms`, newest first.
    async fn list_recent_jobs(
        &self,
        limit: usize,
        max_age_ms: i64,
    ) -> CollaboratorResult<Vec<JobRecord>>;

    /// Persist `cleaned_up = true` for one record.
    async fn mark_cleaned_up(&self, job_id: &str) -> CollaboratorResult<()>;

    /// Whether any instance of `job_class` is still pending or running.
    async fn has_unfinished_instances_of(&self, job_class: &str) -> CollaboratorResult<bool>;

    /// Records the registry considers stuck relative to `stuck_threshold_ms`.
    async fn get_stuck_jobs(&self, stuck_threshold_ms: i64) -> CollaboratorResult<Vec<JobRecord>>;
}

/// Root pipelines of the execution-graph runtime.
#[async_trait]
pub trait PipelineRegistry: Send + Sync {
    async fn list_root_pipelines(&self) -> CollaboratorResult<Vec<PipelineState>>;

    /// Schedule deletion of a pipeline's backing records. Returns `false`
    /// when the pipeline no longer exists. Repeat calls must be harmless.
    async fn cleanup(&self, pipeline_id: &str) -> CollaboratorResult<bool>;
}

/// Delivers admin alerts.
#[async_trait]
pub trait AlertSender: Send + Sync {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> CollaboratorResult<()>;
}

/// Launches batch jobs.
#[async_trait]
pub trait BatchJobRuntime: Send + Sync {
    /// Enqueue a run of `job_class`, returning the new job id.
    async fn enqueue(&self, job_class: &str, params: JobParams) -> CollaboratorResult<String>;
}

/// Auxiliary bookkeeping rows swept by the cleanup aggregator.
#[async_trait]
pub trait AuxiliaryStore: Send + Sync {
    /// One page of rows of `kind` ordered by id, starting after `after`.
    async fn scan(
        &self,
        kind: AuxiliaryKind,
        after: Option<&str>,
        limit: usize,
    ) -> CollaboratorResult<Vec<AuxiliaryState>>;

    async fn delete(&self, kind: AuxiliaryKind, id: &str) -> CollaboratorResult<()>;
}
