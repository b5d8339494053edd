//! Integration tests for reap passes against in-memory registries

use std::sync::Arc;

use kalla_reaper::memory::{InMemoryJobRegistry, InMemoryJobRuntime, InMemoryPipelineRegistry};
use kalla_reaper::window::DAY_MS;
use kalla_reaper::{
    AggregatorLaunch, JobRecord, JobStatus, PipelineState, PipelineStatus, ReapError,
    RetentionWindow, StaleJobReaper, CLEANUP_AGGREGATOR_CLASS, PARAM_MAX_START_TIME_MSEC,
    ROOT_PIPELINE_ID_KEY,
};

const NOW: i64 = 100 * DAY_MS;

struct Harness {
    jobs: Arc<InMemoryJobRegistry>,
    pipelines: Arc<InMemoryPipelineRegistry>,
    runtime: Arc<InMemoryJobRuntime>,
    reaper: StaleJobReaper,
}

fn harness(window: RetentionWindow) -> Harness {
    let jobs = Arc::new(InMemoryJobRegistry::new());
    jobs.set_now(NOW);
    let pipelines = Arc::new(InMemoryPipelineRegistry::new());
    let runtime = Arc::new(InMemoryJobRuntime::new(jobs.clone()));
    let reaper = StaleJobReaper::new(jobs.clone(), pipelines.clone(), runtime.clone())
        .with_window(window);
    Harness {
        jobs,
        pipelines,
        runtime,
        reaper,
    }
}

fn linked_job(id: &str, started_days_ago: i64, pipeline_id: Option<&str>) -> JobRecord {
    let mut job = JobRecord::new(id, "ExportJob");
    job.status = JobStatus::Completed;
    job.started_at_ms = Some(NOW - started_days_ago * DAY_MS);
    job.updated_at_ms = NOW - started_days_ago * DAY_MS;
    if let Some(pid) = pipeline_id {
        job.metadata
            .insert(ROOT_PIPELINE_ID_KEY.to_string(), pid.to_string());
    }
    job
}

fn pipeline(
    id: &str,
    status: Option<PipelineStatus>,
    started_days_ago: Option<i64>,
) -> PipelineState {
    PipelineState {
        start_time_ms: started_days_ago.map(|d| NOW - d * DAY_MS),
        ..PipelineState::new(id, status)
    }
}

#[tokio::test]
async fn mixed_records_and_pipelines_scenario() {
    let h = harness(RetentionWindow::from_min_age(9 * DAY_MS));
    h.jobs.insert(linked_job("job-a", 12, Some("p-done")));
    h.jobs.insert(linked_job("job-b", 10, Some("p-running")));
    h.jobs.insert(linked_job("job-c", 11, None));
    h.pipelines
        .insert(pipeline("p-done", Some(PipelineStatus::Done), None));
    h.pipelines
        .insert(pipeline("p-running", Some(PipelineStatus::Running), Some(10)));

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert_eq!(outcome.pipelines_cleaned, 2);
    assert_eq!(outcome.jobs_marked, 2);
    assert_eq!(outcome.jobs_correlated, 2);
    assert!(outcome.errors.is_empty());

    let mut cleaned = h.pipelines.cleanups();
    cleaned.sort();
    assert_eq!(cleaned, vec!["p-done", "p-running"]);
    assert!(h.jobs.get("job-a").unwrap().cleaned_up);
    assert!(h.jobs.get("job-b").unwrap().cleaned_up);
    assert!(!h.jobs.get("job-c").unwrap().cleaned_up);
}

#[tokio::test]
async fn terminal_status_cleans_regardless_of_start_time() {
    let h = harness(RetentionWindow::default());
    h.jobs.insert(linked_job("job-1", 3, Some("p-1")));
    h.jobs.insert(linked_job("job-2", 3, Some("p-2")));
    h.pipelines
        .insert(pipeline("p-1", Some(PipelineStatus::Done), Some(0)));
    h.pipelines
        .insert(pipeline("p-2", Some(PipelineStatus::Aborted), None));

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert_eq!(outcome.pipelines_cleaned, 2);
    assert_eq!(h.jobs.marked().len(), 2);
}

#[tokio::test]
async fn exhausted_retries_clean_a_running_pipeline() {
    let h = harness(RetentionWindow::default());
    h.jobs.insert(linked_job("job-1", 3, Some("p-1")));
    let mut p = pipeline("p-1", Some(PipelineStatus::Running), Some(0));
    p.current_attempt = 5;
    p.max_attempts = 4;
    h.pipelines.insert(p);

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert_eq!(outcome.pipelines_cleaned, 1);
    assert_eq!(h.jobs.marked(), vec!["job-1"]);
}

#[tokio::test]
async fn live_and_ambiguous_pipelines_are_untouched() {
    let h = harness(RetentionWindow::default());
    h.jobs.insert(linked_job("job-1", 3, Some("p-waiting")));
    h.pipelines
        .insert(pipeline("p-waiting", Some(PipelineStatus::Waiting), None));
    h.pipelines
        .insert(pipeline("p-recent", Some(PipelineStatus::Running), Some(1)));
    h.pipelines.insert(pipeline("p-unknown", None, Some(1)));
    h.pipelines
        .insert(pipeline("p-odd", Some(PipelineStatus::Unrecognized), None));

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert_eq!(outcome.pipelines_seen, 4);
    assert_eq!(outcome.pipelines_cleaned, 0);
    assert_eq!(outcome.ambiguous, 2);
    assert!(h.pipelines.cleanups().is_empty());
    assert!(h.jobs.marked().is_empty());
}

#[tokio::test]
async fn old_or_exhausted_pipelines_clean_without_a_usable_status() {
    let h = harness(RetentionWindow::default());
    h.jobs.insert(linked_job("job-1", 3, Some("p-unknown")));
    h.pipelines.insert(pipeline("p-unknown", None, Some(30)));
    h.pipelines.insert(pipeline(
        "p-odd",
        Some(PipelineStatus::Unrecognized),
        Some(30),
    ));
    let mut exhausted = pipeline("p-exhausted", None, None);
    exhausted.current_attempt = 5;
    exhausted.max_attempts = 3;
    h.pipelines.insert(exhausted);

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert_eq!(outcome.pipelines_cleaned, 3);
    assert_eq!(outcome.ambiguous, 0);
    assert_eq!(h.jobs.marked(), vec!["job-1"]);
    let mut cleaned = h.pipelines.cleanups();
    cleaned.sort();
    assert_eq!(cleaned, vec!["p-exhausted", "p-odd", "p-unknown"]);
}

#[tokio::test]
async fn second_pass_does_not_remark_job_records() {
    let h = harness(RetentionWindow::default());
    h.jobs.insert(linked_job("job-1", 3, Some("p-1")));
    h.pipelines
        .insert(pipeline("p-1", Some(PipelineStatus::Done), None));

    let first = h.reaper.reap(NOW).await.unwrap();
    assert_eq!(first.jobs_marked, 1);

    let second = h.reaper.reap(NOW).await.unwrap();
    assert_eq!(second.jobs_marked, 0);
    assert_eq!(second.jobs_correlated, 0);
    assert_eq!(h.jobs.marked(), vec!["job-1"]);
    // The pipeline is still listed until its deletion lands; a repeat
    // cleanup request is expected and harmless.
    assert_eq!(h.pipelines.cleanups(), vec!["p-1", "p-1"]);
}

#[tokio::test]
async fn duplicate_listing_is_cleaned_once_per_pass() {
    let h = harness(RetentionWindow::default());
    h.pipelines
        .insert(pipeline("p-1", Some(PipelineStatus::Done), None));
    h.pipelines
        .insert(pipeline("p-1", Some(PipelineStatus::Done), None));

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert_eq!(outcome.pipelines_seen, 1);
    assert_eq!(h.pipelines.cleanups(), vec!["p-1"]);
}

#[tokio::test]
async fn failed_mark_skips_that_pipeline_only() {
    let h = harness(RetentionWindow::default());
    h.jobs.insert(linked_job("job-1", 3, Some("p-1")));
    h.jobs.insert(linked_job("job-2", 3, Some("p-2")));
    h.jobs.fail_mark("job-1");
    h.pipelines
        .insert(pipeline("p-1", Some(PipelineStatus::Done), None));
    h.pipelines
        .insert(pipeline("p-2", Some(PipelineStatus::Done), None));

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert_eq!(h.pipelines.cleanups(), vec!["p-2"]);
    assert_eq!(outcome.pipelines_cleaned, 1);
    assert_eq!(outcome.errors.len(), 1);
    assert!(!h.jobs.get("job-1").unwrap().cleaned_up);
}

#[tokio::test]
async fn failed_cleanup_keeps_the_flag_and_continues() {
    let h = harness(RetentionWindow::default());
    h.jobs.insert(linked_job("job-1", 3, Some("p-1")));
    h.pipelines.fail_cleanup("p-1");
    h.pipelines
        .insert(pipeline("p-1", Some(PipelineStatus::Done), None));
    h.pipelines
        .insert(pipeline("p-2", Some(PipelineStatus::Aborted), None));

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert!(h.jobs.get("job-1").unwrap().cleaned_up);
    assert_eq!(outcome.pipelines_cleaned, 1);
    assert_eq!(outcome.errors.len(), 1);
}

#[tokio::test]
async fn enqueues_one_aggregator_with_the_pass_threshold() {
    let h = harness(RetentionWindow::default());

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert!(matches!(outcome.aggregator, AggregatorLaunch::Enqueued { .. }));
    let enqueued = h.runtime.enqueued();
    assert_eq!(enqueued.len(), 1);
    assert_eq!(enqueued[0].0, CLEANUP_AGGREGATOR_CLASS);
    assert_eq!(
        enqueued[0].1[PARAM_MAX_START_TIME_MSEC].as_i64(),
        Some(NOW - 2 * DAY_MS)
    );
    assert_eq!(outcome.max_start_time_ms, NOW - 2 * DAY_MS);
}

#[tokio::test]
async fn unfinished_aggregator_blocks_a_second_launch() {
    let h = harness(RetentionWindow::default());

    h.reaper.reap(NOW).await.unwrap();
    let second = h.reaper.reap(NOW).await.unwrap();

    assert_eq!(second.aggregator, AggregatorLaunch::AlreadyRunning);
    assert_eq!(h.runtime.enqueued().len(), 1);
}

#[tokio::test]
async fn finished_aggregator_allows_the_next_launch() {
    let h = harness(RetentionWindow::default());

    let first = h.reaper.reap(NOW).await.unwrap();
    let AggregatorLaunch::Enqueued { job_id } = first.aggregator else {
        panic!("expected an enqueued aggregator");
    };
    h.jobs.set_status(&job_id, JobStatus::Completed);

    let second = h.reaper.reap(NOW).await.unwrap();
    assert!(matches!(second.aggregator, AggregatorLaunch::Enqueued { .. }));
    assert_eq!(h.runtime.enqueued().len(), 2);
}

#[tokio::test]
async fn never_claimed_aggregator_stops_blocking_after_its_lease() {
    let h = harness(RetentionWindow::default());
    let lease_ms = 5 * 60 * 1000;
    h.jobs.set_lease(lease_ms);

    let first = h.reaper.reap(NOW).await.unwrap();
    assert!(matches!(first.aggregator, AggregatorLaunch::Enqueued { .. }));

    h.jobs.set_now(NOW + lease_ms - 1);
    let blocked = h.reaper.reap(NOW + lease_ms - 1).await.unwrap();
    assert_eq!(blocked.aggregator, AggregatorLaunch::AlreadyRunning);

    h.jobs.set_now(NOW + lease_ms + 1);
    let relaunched = h.reaper.reap(NOW + lease_ms + 1).await.unwrap();
    assert!(matches!(relaunched.aggregator, AggregatorLaunch::Enqueued { .. }));
    assert_eq!(h.runtime.enqueued().len(), 2);
}

#[tokio::test]
async fn unknown_aggregator_state_does_not_launch() {
    let h = harness(RetentionWindow::default());
    h.jobs.fail_unfinished_check(true);

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert!(matches!(outcome.aggregator, AggregatorLaunch::Failed(_)));
    assert!(h.runtime.enqueued().is_empty());
}

#[tokio::test]
async fn listing_failures_abort_the_pass() {
    let h = harness(RetentionWindow::default());
    h.jobs.fail_listing(true);
    assert!(matches!(
        h.reaper.reap(NOW).await,
        Err(ReapError::ListJobs(_))
    ));

    h.jobs.fail_listing(false);
    h.pipelines.fail_listing(true);
    assert!(matches!(
        h.reaper.reap(NOW).await,
        Err(ReapError::ListPipelines(_))
    ));
    assert!(h.runtime.enqueued().is_empty());
}

#[tokio::test]
async fn records_outside_the_fetch_window_are_not_marked() {
    let h = harness(RetentionWindow::default());
    h.jobs.insert(linked_job("job-ancient", 30, Some("p-1")));
    h.pipelines
        .insert(pipeline("p-1", Some(PipelineStatus::Done), None));

    let outcome = h.reaper.reap(NOW).await.unwrap();

    assert_eq!(outcome.pipelines_cleaned, 1);
    assert_eq!(outcome.jobs_marked, 0);
    assert!(!h.jobs.get("job-ancient").unwrap().cleaned_up);
}
