//! Batch job runtime: records aggregator runs in `job_records` and hands
//! them to a worker, either over NATS or through an in-process channel.

use async_trait::async_trait;
use kalla_reaper::registry::CollaboratorResult;
use kalla_reaper::{BatchJobRuntime, CollaboratorError, JobParams};
use sqlx::types::Json;
use sqlx::PgPool;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::queue::{JobMessage, QueueClient};

/// Where enqueued jobs are delivered.
#[derive(Clone)]
pub enum Dispatcher {
    Nats(Arc<QueueClient>),
    Local(mpsc::Sender<JobMessage>),
}

impl Dispatcher {
    async fn dispatch(&self, msg: JobMessage) -> anyhow::Result<()> {
        match self {
            Dispatcher::Nats(queue) => queue.publish(&msg).await,
            Dispatcher::Local(tx) => tx
                .send(msg)
                .await
                .map_err(|_| anyhow::anyhow!("local job channel closed")),
        }
    }
}

pub struct PgBatchJobRuntime {
    pool: PgPool,
    dispatcher: Dispatcher,
}

impl PgBatchJobRuntime {
    pub fn new(pool: PgPool, dispatcher: Dispatcher) -> Self {
        Self { pool, dispatcher }
    }
}

#[async_trait]
impl BatchJobRuntime for PgBatchJobRuntime {
    async fn enqueue(&self, job_class: &str, params: JobParams) -> CollaboratorResult<String> {
        let job_id = Uuid::new_v4();

        sqlx::query(
            "INSERT INTO job_records
                 (job_id, key, job_class, status, params, queued_at, updated_at,
                  counters, shard_retries, slice_retries, cleaned_up, metadata)
             VALUES ($1, $1, $2, 'pending', $3, now(), now(), '{}'::jsonb, 0, 0, FALSE, '{}'::jsonb)",
        )
        .bind(job_id.to_string())
        .bind(job_class)
        .bind(Json(&params))
        .execute(&self.pool)
        .await
        .map_err(|e| CollaboratorError::unavailable("job runtime", e))?;

        let msg = JobMessage::CleanupAggregate { job_id, params };
        if let Err(e) = self.dispatcher.dispatch(msg).await {
            // A pending row that never reaches a worker would block every
            // later launch.
            warn!("Dispatch of job {} failed, marking it failed: {}", job_id, e);
            if let Err(db_err) = sqlx::query(
                "UPDATE job_records SET status = 'failed', updated_at = now() WHERE job_id = $1",
            )
            .bind(job_id.to_string())
            .execute(&self.pool)
            .await
            {
                warn!("Could not mark job {} failed: {}", job_id, db_err);
            }
            return Err(CollaboratorError::unavailable("job runtime", e));
        }

        info!("Enqueued {} job {}", job_class, job_id);
        Ok(job_id.to_string())
    }
}
