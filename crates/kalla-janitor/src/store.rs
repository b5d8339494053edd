//! Postgres-backed registries.
//!
//! Tables read and written here:
//! - `job_records`: one row per batch-job run (status, timing, counters,
//!   `cleaned_up`, JSON `metadata` carrying `root_pipeline_id`)
//! - `pipelines` / `pipeline_slots`: execution-graph state; root pipelines
//!   have `pipeline_id = root_pipeline_id`
//! - `mapreduce_states` / `shard_states`: auxiliary per-run and per-shard state

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kalla_reaper::registry::CollaboratorResult;
use kalla_reaper::{
    AuxiliaryKind, AuxiliaryState, AuxiliaryStore, CollaboratorError, JobRecord, JobRegistry,
    JobStatus, PipelineRegistry, PipelineState, PipelineStatus,
};
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use std::collections::BTreeMap;
use tracing::{debug, warn};

fn millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

fn db_error(collaborator: &'static str) -> impl Fn(sqlx::Error) -> CollaboratorError {
    move |e| CollaboratorError::unavailable(collaborator, e)
}

// ---------------------------------------------------------------------------
// Job records
// ---------------------------------------------------------------------------

const JOB_COLUMNS: &str = "job_id, key, job_class, status, started_at, updated_at, counters, \
     shard_retries, slice_retries, last_work_item, cleaned_up, metadata";

#[derive(FromRow)]
struct JobRow {
    job_id: String,
    key: String,
    job_class: String,
    status: String,
    started_at: Option<DateTime<Utc>>,
    updated_at: DateTime<Utc>,
    counters: Json<BTreeMap<String, i64>>,
    shard_retries: i32,
    slice_retries: i32,
    last_work_item: Option<String>,
    cleaned_up: bool,
    metadata: Json<BTreeMap<String, String>>,
}

impl TryFrom<JobRow> for JobRecord {
    type Error = CollaboratorError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status: JobStatus = row
            .status
            .parse()
            .map_err(|e| CollaboratorError::Malformed(format!("job {}: {}", row.job_id, e)))?;
        Ok(JobRecord {
            job_id: row.job_id,
            key: row.key,
            job_class: row.job_class,
            status,
            started_at_ms: row.started_at.map(millis),
            updated_at_ms: millis(row.updated_at),
            counters: row.counters.0,
            shard_retries: row.shard_retries.max(0) as u32,
            slice_retries: row.slice_retries.max(0) as u32,
            last_work_item: row.last_work_item,
            cleaned_up: row.cleaned_up,
            metadata: row.metadata.0,
        })
    }
}

/// Convert rows, dropping (and logging) any that do not parse.
fn job_records(rows: Vec<JobRow>) -> Vec<JobRecord> {
    rows.into_iter()
        .filter_map(|row| match JobRecord::try_from(row) {
            Ok(job) => Some(job),
            Err(e) => {
                warn!("Skipping job record: {}", e);
                None
            }
        })
        .collect()
}

/// Only the flag changes; `updated_at` keeps tracking the job's own progress.
const MARK_CLEANED_UP_QUERY: &str = "UPDATE job_records SET cleaned_up = TRUE WHERE job_id = $1";

/// A job holds the single-flight slot while it is pending and queued within
/// the lease, or claimed with a heartbeat within the lease.
const UNFINISHED_JOB_QUERY: &str = "SELECT EXISTS (
         SELECT 1 FROM job_records
         WHERE job_class = $1
           AND ((status = 'pending'
                 AND queued_at > now() - ($2::float8 * interval '1 second'))
                OR (status = 'claimed'
                    AND last_heartbeat > now() - ($2::float8 * interval '1 second')))
     )";

#[derive(Clone)]
pub struct PgJobRegistry {
    pool: PgPool,
    job_lease_secs: u64,
}

impl PgJobRegistry {
    pub fn new(pool: PgPool, job_lease_secs: u64) -> Self {
        Self {
            pool,
            job_lease_secs,
        }
    }
}

#[async_trait]
impl JobRegistry for PgJobRegistry {
    async fn list_recent_jobs(
        &self,
        limit: usize,
        max_age_ms: i64,
    ) -> CollaboratorResult<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT {} FROM job_records
             WHERE COALESCE(started_at, queued_at) > now() - ($2::float8 * interval '1 millisecond')
             ORDER BY COALESCE(started_at, queued_at) DESC
             LIMIT $1",
            JOB_COLUMNS
        ))
        .bind(limit as i64)
        .bind(max_age_ms as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("job registry"))?;

        Ok(job_records(rows))
    }

    async fn mark_cleaned_up(&self, job_id: &str) -> CollaboratorResult<()> {
        let result = sqlx::query(MARK_CLEANED_UP_QUERY)
            .bind(job_id)
            .execute(&self.pool)
            .await
            .map_err(db_error("job registry"))?;

        if result.rows_affected() == 0 {
            return Err(CollaboratorError::NotFound(job_id.to_string()));
        }
        Ok(())
    }

    async fn has_unfinished_instances_of(&self, job_class: &str) -> CollaboratorResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(UNFINISHED_JOB_QUERY)
            .bind(job_class)
            .bind(self.job_lease_secs as f64)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("job registry"))?;

        Ok(exists)
    }

    /// Shards that were retried and updated inside the threshold window.
    async fn get_stuck_jobs(&self, stuck_threshold_ms: i64) -> CollaboratorResult<Vec<JobRecord>> {
        let rows: Vec<JobRow> = sqlx::query_as(
            "SELECT s.job_id,
                    s.shard_id AS key,
                    COALESCE(j.job_class, '') AS job_class,
                    COALESCE(j.status, 'claimed') AS status,
                    s.started_at,
                    s.updated_at,
                    s.counters,
                    s.retries AS shard_retries,
                    s.slice_retries,
                    s.last_work_item,
                    COALESCE(j.cleaned_up, FALSE) AS cleaned_up,
                    COALESCE(j.metadata, '{}'::jsonb) AS metadata
             FROM shard_states s
             LEFT JOIN job_records j ON j.job_id = s.job_id
             WHERE s.updated_at > now() - ($1::float8 * interval '1 millisecond')
               AND s.retries > 0
             ORDER BY s.updated_at DESC",
        )
        .bind(stuck_threshold_ms as f64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("job registry"))?;

        Ok(job_records(rows))
    }
}

// ---------------------------------------------------------------------------
// Pipelines
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct PipelineRow {
    pipeline_id: String,
    status: Option<String>,
    started_at: Option<DateTime<Utc>>,
    current_attempt: i32,
    max_attempts: i32,
}

impl From<PipelineRow> for PipelineState {
    fn from(row: PipelineRow) -> Self {
        PipelineState {
            pipeline_id: row.pipeline_id,
            status: row.status.as_deref().map(PipelineStatus::parse),
            start_time_ms: row.started_at.map(millis),
            current_attempt: row.current_attempt.max(0) as u32,
            max_attempts: row.max_attempts.max(0) as u32,
        }
    }
}

#[derive(Clone)]
pub struct PgPipelineRegistry {
    pool: PgPool,
}

impl PgPipelineRegistry {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn delete_pipeline_records(pool: &PgPool, root_pipeline_id: &str) -> sqlx::Result<u64> {
    let mut tx = pool.begin().await?;
    let slots = sqlx::query("DELETE FROM pipeline_slots WHERE root_pipeline_id = $1")
        .bind(root_pipeline_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    let pipelines = sqlx::query("DELETE FROM pipelines WHERE root_pipeline_id = $1")
        .bind(root_pipeline_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();
    tx.commit().await?;
    Ok(slots + pipelines)
}

#[async_trait]
impl PipelineRegistry for PgPipelineRegistry {
    async fn list_root_pipelines(&self) -> CollaboratorResult<Vec<PipelineState>> {
        let rows: Vec<PipelineRow> = sqlx::query_as(
            "SELECT pipeline_id, status, started_at, current_attempt, max_attempts
             FROM pipelines
             WHERE pipeline_id = root_pipeline_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("pipeline registry"))?;

        Ok(rows.into_iter().map(PipelineState::from).collect())
    }

    /// Confirms the pipeline exists, then deletes its records in the background.
    async fn cleanup(&self, pipeline_id: &str) -> CollaboratorResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            "SELECT EXISTS (SELECT 1 FROM pipelines WHERE pipeline_id = $1 AND pipeline_id = root_pipeline_id)",
        )
        .bind(pipeline_id)
        .fetch_one(&self.pool)
        .await
        .map_err(db_error("pipeline registry"))?;

        if !exists {
            return Ok(false);
        }

        let pool = self.pool.clone();
        let pipeline_id = pipeline_id.to_string();
        tokio::spawn(async move {
            match delete_pipeline_records(&pool, &pipeline_id).await {
                Ok(rows) => debug!("Deleted {} rows for pipeline {}", rows, pipeline_id),
                Err(e) => warn!("Background cleanup of pipeline {} failed: {}", pipeline_id, e),
            }
        });
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// Auxiliary state
// ---------------------------------------------------------------------------

#[derive(FromRow)]
struct AuxiliaryRow {
    id: String,
    result_status: Option<String>,
    started_at: Option<DateTime<Utc>>,
    updated_at: Option<DateTime<Utc>>,
}

fn table_for(kind: AuxiliaryKind) -> (&'static str, &'static str) {
    match kind {
        AuxiliaryKind::Run => ("mapreduce_states", "mapreduce_id"),
        AuxiliaryKind::Shard => ("shard_states", "shard_id"),
    }
}

#[derive(Clone)]
pub struct PgAuxiliaryStore {
    pool: PgPool,
}

impl PgAuxiliaryStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuxiliaryStore for PgAuxiliaryStore {
    async fn scan(
        &self,
        kind: AuxiliaryKind,
        after: Option<&str>,
        limit: usize,
    ) -> CollaboratorResult<Vec<AuxiliaryState>> {
        let (table, id_column) = table_for(kind);
        let rows: Vec<AuxiliaryRow> = sqlx::query_as(&format!(
            "SELECT {id} AS id, result_status, started_at, updated_at
             FROM {table}
             WHERE ($1::text IS NULL OR {id} > $1)
             ORDER BY {id}
             LIMIT $2",
            id = id_column,
            table = table
        ))
        .bind(after)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("auxiliary store"))?;

        Ok(rows
            .into_iter()
            .map(|row| AuxiliaryState {
                id: row.id,
                kind,
                result_status: row.result_status.and_then(|s| s.parse().ok()),
                started_at_ms: row.started_at.map(millis),
                updated_at_ms: row.updated_at.map(millis),
            })
            .collect())
    }

    async fn delete(&self, kind: AuxiliaryKind, id: &str) -> CollaboratorResult<()> {
        let (table, id_column) = table_for(kind);
        sqlx::query(&format!("DELETE FROM {} WHERE {} = $1", table, id_column))
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(db_error("auxiliary store"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job_row(status: &str) -> JobRow {
        let mut metadata = BTreeMap::new();
        metadata.insert("root_pipeline_id".to_string(), "p-1".to_string());
        JobRow {
            job_id: "job-1".to_string(),
            key: "job-1".to_string(),
            job_class: "ExportJob".to_string(),
            status: status.to_string(),
            started_at: DateTime::from_timestamp_millis(1_000),
            updated_at: DateTime::from_timestamp_millis(2_000).unwrap(),
            counters: Json(BTreeMap::new()),
            shard_retries: -1,
            slice_retries: 3,
            last_work_item: None,
            cleaned_up: false,
            metadata: Json(metadata),
        }
    }

    fn normalized(sql: &str) -> String {
        sql.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    #[test]
    fn pending_and_claimed_jobs_both_expire_with_the_lease() {
        let sql = normalized(UNFINISHED_JOB_QUERY);
        assert!(sql.contains(
            "status = 'pending' AND queued_at > now() - ($2::float8 * interval '1 second')"
        ));
        assert!(sql.contains(
            "status = 'claimed' AND last_heartbeat > now() - ($2::float8 * interval '1 second')"
        ));
    }

    #[test]
    fn marking_cleaned_up_leaves_update_time_alone() {
        let sql = normalized(MARK_CLEANED_UP_QUERY);
        assert_eq!(sql, "UPDATE job_records SET cleaned_up = TRUE WHERE job_id = $1");
        assert!(!sql.contains("updated_at"));
    }

    #[test]
    fn job_row_converts_to_record() {
        let job = JobRecord::try_from(job_row("completed")).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.started_at_ms, Some(1_000));
        assert_eq!(job.updated_at_ms, 2_000);
        assert_eq!(job.shard_retries, 0);
        assert_eq!(job.slice_retries, 3);
        assert_eq!(job.root_pipeline_id(), Some("p-1"));
    }

    #[test]
    fn unparseable_job_rows_are_dropped() {
        let jobs = job_records(vec![job_row("completed"), job_row("exploded")]);
        assert_eq!(jobs.len(), 1);
    }

    #[test]
    fn pipeline_row_keeps_missing_status_missing() {
        let state = PipelineState::from(PipelineRow {
            pipeline_id: "p-1".to_string(),
            status: None,
            started_at: None,
            current_attempt: 2,
            max_attempts: 1,
        });
        assert_eq!(state.status, None);
        assert!(state.retries_exhausted());

        let state = PipelineState::from(PipelineRow {
            pipeline_id: "p-2".to_string(),
            status: Some("run".to_string()),
            started_at: DateTime::from_timestamp_millis(5),
            current_attempt: 0,
            max_attempts: 3,
        });
        assert_eq!(state.status, Some(PipelineStatus::Running));
        assert_eq!(state.start_time_ms, Some(5));
    }

    #[test]
    fn auxiliary_tables_by_kind() {
        assert_eq!(table_for(AuxiliaryKind::Run).0, "mapreduce_states");
        assert_eq!(table_for(AuxiliaryKind::Shard).1, "shard_id");
    }
}
