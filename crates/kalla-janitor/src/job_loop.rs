//! Job loop: pulls cleanup aggregator jobs and runs them.

use anyhow::Result;
use futures::StreamExt;
use kalla_reaper::CleanupAggregator;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::JanitorConfig;
use crate::heartbeat::spawn_lease_renewal;
use crate::metrics::{JanitorMetrics, Label};
use crate::queue::{JobMessage, QueueClient};

/// Where the loop receives jobs from. Mirrors `runtime::Dispatcher`.
pub enum JobSource {
    Nats(Arc<QueueClient>),
    Local(mpsc::Receiver<JobMessage>),
}

/// Everything a job needs to run.
pub struct JobContext {
    pub pool: PgPool,
    pub aggregator: CleanupAggregator,
    pub metrics: JanitorMetrics,
    pub worker_id: String,
    pub heartbeat_interval_secs: u64,
    pub job_lease_secs: u64,
}

impl JobContext {
    pub fn new(
        config: &JanitorConfig,
        pool: PgPool,
        aggregator: CleanupAggregator,
        metrics: JanitorMetrics,
    ) -> Self {
        Self {
            pool,
            aggregator,
            metrics,
            worker_id: config.worker_id.clone(),
            heartbeat_interval_secs: config.heartbeat_interval_secs,
            job_lease_secs: config.job_lease_secs,
        }
    }
}

/// Run the job loop until the source is exhausted.
pub async fn run_job_loop(ctx: Arc<JobContext>, source: JobSource) -> Result<()> {
    info!("Job loop started for worker {}", ctx.worker_id);

    match source {
        JobSource::Local(mut rx) => {
            while let Some(job) = rx.recv().await {
                if let Err(e) = handle_job(&ctx, job).await {
                    error!("Job failed: {}", e);
                }
            }
            info!("Local job channel closed, job loop exiting");
        }
        JobSource::Nats(queue) => {
            let consumer = queue.consumer(&ctx.worker_id).await?;
            let mut messages = consumer.messages().await?;

            loop {
                if let Ok(depth) = queue.queue_depth().await {
                    ctx.metrics.queue_depth.set(depth as i64);
                }

                let Some(msg) = messages.next().await else {
                    warn!("Cleanup consumer stream ended");
                    break;
                };

                match msg {
                    Ok(msg) => {
                        match serde_json::from_slice::<JobMessage>(&msg.payload) {
                            Ok(job) => {
                                if let Err(e) = handle_job(&ctx, job).await {
                                    error!("Job failed: {}", e);
                                }
                            }
                            Err(e) => warn!("Invalid cleanup message: {}", e),
                        }
                        msg.ack().await.ok();
                    }
                    Err(e) => warn!("Cleanup consumer error: {}", e),
                }
            }
        }
    }

    Ok(())
}

/// Claim and run one job, recording its final status.
///
/// A job that is no longer pending (already claimed by another replica, or a
/// redelivery of a finished one) is skipped.
pub async fn handle_job(ctx: &JobContext, job: JobMessage) -> Result<()> {
    let job_id = job.job_id();

    if !claim_job(&ctx.pool, job_id, &ctx.worker_id).await? {
        info!("Job {} is no longer pending, skipping", job_id);
        return Ok(());
    }

    let _lease = spawn_lease_renewal(
        ctx.pool.clone(),
        job_id,
        ctx.heartbeat_interval_secs,
        ctx.job_lease_secs,
    );
    ctx.metrics.active_jobs.inc();

    let result = match &job {
        JobMessage::CleanupAggregate { params, .. } => ctx.aggregator.run_with_params(params).await,
    };

    ctx.metrics.active_jobs.dec();

    match result {
        Ok(tally) => {
            ctx.metrics.record_tally(&tally);
            ctx.metrics
                .aggregator_jobs
                .get_or_create(&Label::outcome("completed"))
                .inc();
            finish_job(&ctx.pool, job_id, "completed").await?;
            info!(
                "Cleanup job {} finished: {} deleted, {} remaining",
                job_id,
                tally.deleted(),
                tally.remaining()
            );
            Ok(())
        }
        Err(e) => {
            ctx.metrics
                .aggregator_jobs
                .get_or_create(&Label::outcome("failed"))
                .inc();
            finish_job(&ctx.pool, job_id, "failed").await?;
            Err(e.into())
        }
    }
}

async fn claim_job(pool: &PgPool, job_id: Uuid, worker_id: &str) -> Result<bool> {
    let claimed: Option<(String,)> = sqlx::query_as(
        "UPDATE job_records SET status = 'claimed', claimed_by = $2,
         started_at = now(), last_heartbeat = now(), updated_at = now()
         WHERE job_id = $1 AND status = 'pending'
         RETURNING job_id",
    )
    .bind(job_id.to_string())
    .bind(worker_id)
    .fetch_optional(pool)
    .await?;
    Ok(claimed.is_some())
}

async fn finish_job(pool: &PgPool, job_id: Uuid, status: &str) -> Result<()> {
    sqlx::query("UPDATE job_records SET status = $2, updated_at = now() WHERE job_id = $1")
        .bind(job_id.to_string())
        .bind(status)
        .execute(pool)
        .await?;
    Ok(())
}
