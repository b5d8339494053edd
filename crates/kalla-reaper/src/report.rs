//! Stuck job reporter: turns the registry's stuck jobs into one admin alert.

use chrono::{DateTime, SecondsFormat};
use std::sync::Arc;
use tracing::{error, info};

use crate::error::ReportError;
use crate::model::JobRecord;
use crate::registry::{AlertSender, JobRegistry};
use crate::window::HOUR_MS;

/// Default inactivity threshold for the stuck-job scan.
pub const DEFAULT_STUCK_THRESHOLD_MS: i64 = 25 * HOUR_MS;
/// Default number of jobs detailed in one alert.
pub const DEFAULT_MAX_JOBS_TO_REPORT: usize = 50;

pub const FAILURE_SUBJECT: &str = "Batch job failure alert";
pub const ALL_CLEAR_SUBJECT: &str = "Batch job status report";
pub const ALL_CLEAR_BODY: &str = "All batch jobs are running fine.";

const BLOCK_SEPARATOR: &str = "-----------------------------------";

/// What a report invocation sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StuckJobReport {
    pub total: usize,
    pub listed: usize,
    pub subject: String,
    pub body: String,
}

impl StuckJobReport {
    pub fn all_clear(&self) -> bool {
        self.total == 0
    }
}

pub struct StuckJobReporter {
    jobs: Arc<dyn JobRegistry>,
    sender: Arc<dyn AlertSender>,
    recipient: String,
}

impl StuckJobReporter {
    pub fn new(
        jobs: Arc<dyn JobRegistry>,
        sender: Arc<dyn AlertSender>,
        recipient: impl Into<String>,
    ) -> Self {
        Self {
            jobs,
            sender,
            recipient: recipient.into(),
        }
    }

    /// Query stuck jobs and send exactly one alert describing them.
    ///
    /// Send failures are not retried; they are logged and returned.
    pub async fn report(
        &self,
        stuck_threshold_ms: i64,
        max_jobs_to_list: usize,
    ) -> Result<StuckJobReport, ReportError> {
        let stuck = self
            .jobs
            .get_stuck_jobs(stuck_threshold_ms)
            .await
            .map_err(|e| {
                error!("Stuck job query failed: {}", e);
                ReportError::Query(e)
            })?;

        let report = compose_report(&stuck, stuck_threshold_ms, max_jobs_to_list);

        if let Err(e) = self
            .sender
            .send(&self.recipient, &report.subject, &report.body)
            .await
        {
            error!(
                "Failed to send stuck job alert to {}: {}",
                self.recipient, e
            );
            return Err(ReportError::Send(e));
        }

        info!(
            "Stuck job report sent to {} ({} stuck, {} listed)",
            self.recipient, report.total, report.listed
        );
        Ok(report)
    }
}

/// Build the subject and body for a set of stuck jobs.
pub fn compose_report(
    stuck: &[JobRecord],
    stuck_threshold_ms: i64,
    max_jobs_to_list: usize,
) -> StuckJobReport {
    if stuck.is_empty() {
        return StuckJobReport {
            total: 0,
            listed: 0,
            subject: ALL_CLEAR_SUBJECT.to_string(),
            body: ALL_CLEAR_BODY.to_string(),
        };
    }

    let listed = stuck.len().min(max_jobs_to_list);
    let mut body = format!(
        "{} jobs have failed in the past {} hours. More information \
         (about at most {} jobs; to see more, please check the logs):",
        stuck.len(),
        stuck_threshold_ms / HOUR_MS,
        max_jobs_to_list
    );

    for job in &stuck[..listed] {
        body.push('\n');
        body.push_str(BLOCK_SEPARATOR);
        body.push('\n');
        write_job_block(&mut body, job);
    }

    StuckJobReport {
        total: stuck.len(),
        listed,
        subject: FAILURE_SUBJECT.to_string(),
        body,
    }
}

fn write_job_block(out: &mut String, job: &JobRecord) {
    let counters = serde_json::to_string(&job.counters).unwrap_or_default();
    out.push_str(&format!(
        "Job with id {} (key {}) failed. More info:\n\n\
         \x20 counters: {}\n\
         \x20 shard_retries: {}\n\
         \x20 slice_retries: {}\n\
         \x20 last_update_time: {}\n\
         \x20 last_work_item: {}\n",
        job.job_id,
        job.key,
        counters,
        job.shard_retries,
        job.slice_retries,
        format_millis(job.updated_at_ms),
        job.last_work_item.as_deref().unwrap_or("none"),
    ));
}

fn format_millis(ms: i64) -> String {
    DateTime::from_timestamp_millis(ms)
        .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true))
        .unwrap_or_else(|| ms.to_string())
}
