//! In-memory collaborators with failure injection.
//!
//! Compiled for this crate's tests and behind the `test-util` feature.

use async_trait::async_trait;
use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::CollaboratorError;
use crate::model::{AuxiliaryKind, AuxiliaryState, JobParams, JobRecord, JobStatus, PipelineState};
use crate::registry::{
    AlertSender, AuxiliaryStore, BatchJobRuntime, CollaboratorResult, JobRegistry,
    PipelineRegistry,
};

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Job registry
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryJobRegistry {
    now_ms: AtomicI64,
    lease_ms: AtomicI64,
    jobs: Mutex<BTreeMap<String, JobRecord>>,
    stuck: Mutex<Vec<JobRecord>>,
    marked: Mutex<Vec<String>>,
    fail_mark: Mutex<HashSet<String>>,
    fail_list: AtomicBool,
    fail_stuck: AtomicBool,
    fail_unfinished: AtomicBool,
}

impl InMemoryJobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Clock used to evaluate `max_age_ms` in `list_recent_jobs`.
    pub fn set_now(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }

    /// Unfinished jobs whose `updated_at_ms` is older than `lease_ms` stop
    /// counting as running. Zero disables expiry.
    pub fn set_lease(&self, lease_ms: i64) {
        self.lease_ms.store(lease_ms, Ordering::SeqCst);
    }

    pub fn insert(&self, job: JobRecord) {
        lock(&self.jobs).insert(job.job_id.clone(), job);
    }

    pub fn get(&self, job_id: &str) -> Option<JobRecord> {
        lock(&self.jobs).get(job_id).cloned()
    }

    pub fn set_status(&self, job_id: &str, status: JobStatus) {
        if let Some(job) = lock(&self.jobs).get_mut(job_id) {
            job.status = status;
        }
    }

    pub fn set_stuck(&self, stuck: Vec<JobRecord>) {
        *lock(&self.stuck) = stuck;
    }

    /// Every successful `mark_cleaned_up` call, in order.
    pub fn marked(&self) -> Vec<String> {
        lock(&self.marked).clone()
    }

    pub fn fail_mark(&self, job_id: &str) {
        lock(&self.fail_mark).insert(job_id.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    pub fn fail_stuck_query(&self, fail: bool) {
        self.fail_stuck.store(fail, Ordering::SeqCst);
    }

    pub fn fail_unfinished_check(&self, fail: bool) {
        self.fail_unfinished.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl JobRegistry for InMemoryJobRegistry {
    async fn list_recent_jobs(
        &self,
        limit: usize,
        max_age_ms: i64,
    ) -> CollaboratorResult<Vec<JobRecord>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("job registry", "listing disabled"));
        }
        let oldest = self.now_ms.load(Ordering::SeqCst).saturating_sub(max_age_ms);
        let mut recent: Vec<JobRecord> = lock(&self.jobs)
            .values()
            .filter(|job| job.started_at_ms.unwrap_or(job.updated_at_ms) >= oldest)
            .cloned()
            .collect();
        recent.sort_by_key(|job| std::cmp::Reverse(job.started_at_ms.unwrap_or(job.updated_at_ms)));
        recent.truncate(limit);
        Ok(recent)
    }

    async fn mark_cleaned_up(&self, job_id: &str) -> CollaboratorResult<()> {
        if lock(&self.fail_mark).contains(job_id) {
            return Err(CollaboratorError::unavailable("job registry", "write rejected"));
        }
        let mut jobs = lock(&self.jobs);
        let job = jobs
            .get_mut(job_id)
            .ok_or_else(|| CollaboratorError::NotFound(job_id.to_string()))?;
        job.cleaned_up = true;
        lock(&self.marked).push(job_id.to_string());
        Ok(())
    }

    async fn has_unfinished_instances_of(&self, job_class: &str) -> CollaboratorResult<bool> {
        if self.fail_unfinished.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("job registry", "query disabled"));
        }
        let lease_ms = self.lease_ms.load(Ordering::SeqCst);
        let live_after = self.now_ms().saturating_sub(lease_ms);
        Ok(lock(&self.jobs).values().any(|job| {
            job.job_class == job_class
                && !job.status.is_finished()
                && (lease_ms == 0 || job.updated_at_ms > live_after)
        }))
    }

    async fn get_stuck_jobs(&self, _stuck_threshold_ms: i64) -> CollaboratorResult<Vec<JobRecord>> {
        if self.fail_stuck.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("job registry", "query disabled"));
        }
        Ok(lock(&self.stuck).clone())
    }
}

// ---------------------------------------------------------------------------
// Pipeline registry
// ---------------------------------------------------------------------------

/// Pipelines stay listed after cleanup; deletion is asynchronous on the
/// real runtime, so a later pass may see them again.
#[derive(Default)]
pub struct InMemoryPipelineRegistry {
    pipelines: Mutex<Vec<PipelineState>>,
    cleanups: Mutex<Vec<String>>,
    fail_cleanup: Mutex<HashSet<String>>,
    fail_list: AtomicBool,
}

impl InMemoryPipelineRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, pipeline: PipelineState) {
        lock(&self.pipelines).push(pipeline);
    }

    /// Every `cleanup` call that reached an existing pipeline, in order.
    pub fn cleanups(&self) -> Vec<String> {
        lock(&self.cleanups).clone()
    }

    pub fn fail_cleanup(&self, pipeline_id: &str) {
        lock(&self.fail_cleanup).insert(pipeline_id.to_string());
    }

    pub fn fail_listing(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl PipelineRegistry for InMemoryPipelineRegistry {
    async fn list_root_pipelines(&self) -> CollaboratorResult<Vec<PipelineState>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("pipeline registry", "listing disabled"));
        }
        Ok(lock(&self.pipelines).clone())
    }

    async fn cleanup(&self, pipeline_id: &str) -> CollaboratorResult<bool> {
        if lock(&self.fail_cleanup).contains(pipeline_id) {
            return Err(CollaboratorError::unavailable("pipeline registry", "cleanup rejected"));
        }
        let exists = lock(&self.pipelines)
            .iter()
            .any(|p| p.pipeline_id == pipeline_id);
        if exists {
            lock(&self.cleanups).push(pipeline_id.to_string());
        }
        Ok(exists)
    }
}

// ---------------------------------------------------------------------------
// Batch job runtime
// ---------------------------------------------------------------------------

/// Records enqueued jobs as pending rows in the paired job registry, so the
/// single-flight check sees them.
pub struct InMemoryJobRuntime {
    registry: Arc<InMemoryJobRegistry>,
    enqueued: Mutex<Vec<(String, JobParams)>>,
    next_id: AtomicUsize,
    fail: AtomicBool,
}

impl InMemoryJobRuntime {
    pub fn new(registry: Arc<InMemoryJobRegistry>) -> Self {
        Self {
            registry,
            enqueued: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            fail: AtomicBool::new(false),
        }
    }

    pub fn enqueued(&self) -> Vec<(String, JobParams)> {
        lock(&self.enqueued).clone()
    }

    pub fn fail_enqueue(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl BatchJobRuntime for InMemoryJobRuntime {
    async fn enqueue(&self, job_class: &str, params: JobParams) -> CollaboratorResult<String> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("job runtime", "enqueue rejected"));
        }
        let job_id = format!("job-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let mut job = JobRecord::new(job_id.clone(), job_class);
        job.updated_at_ms = self.registry.now_ms();
        self.registry.insert(job);
        lock(&self.enqueued).push((job_class.to_string(), params));
        Ok(job_id)
    }
}

// ---------------------------------------------------------------------------
// Alert sender
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentAlert {
    pub recipient: String,
    pub subject: String,
    pub body: String,
}

#[derive(Default)]
pub struct RecordingAlertSender {
    sent: Mutex<Vec<SentAlert>>,
    attempts: AtomicUsize,
    fail: AtomicBool,
}

impl RecordingAlertSender {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<SentAlert> {
        lock(&self.sent).clone()
    }

    /// Number of `send` calls, including failed ones.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    pub fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AlertSender for RecordingAlertSender {
    async fn send(&self, recipient: &str, subject: &str, body: &str) -> CollaboratorResult<()> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("alert sender", "delivery refused"));
        }
        lock(&self.sent).push(SentAlert {
            recipient: recipient.to_string(),
            subject: subject.to_string(),
            body: body.to_string(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Auxiliary store
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct InMemoryAuxiliaryStore {
    rows: Mutex<BTreeMap<(AuxiliaryKind, String), AuxiliaryState>>,
    fail_delete: Mutex<HashSet<String>>,
    fail_scan: AtomicBool,
}

impl InMemoryAuxiliaryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, state: AuxiliaryState) {
        lock(&self.rows).insert((state.kind, state.id.clone()), state);
    }

    pub fn contains(&self, kind: AuxiliaryKind, id: &str) -> bool {
        lock(&self.rows).contains_key(&(kind, id.to_string()))
    }

    pub fn len(&self) -> usize {
        lock(&self.rows).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn fail_delete(&self, id: &str) {
        lock(&self.fail_delete).insert(id.to_string());
    }

    pub fn fail_scans(&self, fail: bool) {
        self.fail_scan.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl AuxiliaryStore for InMemoryAuxiliaryStore {
    async fn scan(
        &self,
        kind: AuxiliaryKind,
        after: Option<&str>,
        limit: usize,
    ) -> CollaboratorResult<Vec<AuxiliaryState>> {
        if self.fail_scan.load(Ordering::SeqCst) {
            return Err(CollaboratorError::unavailable("auxiliary store", "scan disabled"));
        }
        Ok(lock(&self.rows)
            .values()
            .filter(|s| s.kind == kind && after.map_or(true, |a| s.id.as_str() > a))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete(&self, kind: AuxiliaryKind, id: &str) -> CollaboratorResult<()> {
        if lock(&self.fail_delete).contains(id) {
            return Err(CollaboratorError::unavailable("auxiliary store", "delete rejected"));
        }
        lock(&self.rows).remove(&(kind, id.to_string()));
        Ok(())
    }
}
