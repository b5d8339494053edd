//! NATS JetStream queue client and message types.

use anyhow::Result;
use async_nats::jetstream::{self, consumer::PullConsumer, stream::Stream as JsStream};
use kalla_reaper::JobParams;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub const CLEANUP_STREAM: &str = "KALLA_JANITOR";
pub const CLEANUP_SUBJECT: &str = "kalla.janitor.cleanup";

/// Job types that flow through the janitor queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum JobMessage {
    /// Sweep auxiliary run/shard state older than the parameters' threshold.
    CleanupAggregate { job_id: Uuid, params: JobParams },
}

impl JobMessage {
    pub fn job_id(&self) -> Uuid {
        match self {
            JobMessage::CleanupAggregate { job_id, .. } => *job_id,
        }
    }
}

/// NATS JetStream queue client.
pub struct QueueClient {
    jetstream: jetstream::Context,
    stream: tokio::sync::Mutex<JsStream>,
}

impl QueueClient {
    /// Connect to NATS and ensure the stream exists.
    pub async fn connect(nats_url: &str) -> Result<Self> {
        let client = async_nats::connect(nats_url).await?;
        let jetstream = jetstream::new(client);

        let stream = jetstream
            .get_or_create_stream(jetstream::stream::Config {
                name: CLEANUP_STREAM.to_string(),
                subjects: vec![CLEANUP_SUBJECT.to_string()],
                retention: jetstream::stream::RetentionPolicy::WorkQueue,
                ..Default::default()
            })
            .await?;

        Ok(Self {
            jetstream,
            stream: tokio::sync::Mutex::new(stream),
        })
    }

    /// Publish a job to the cleanup queue.
    pub async fn publish(&self, msg: &JobMessage) -> Result<()> {
        let payload = serde_json::to_vec(msg)?;
        self.jetstream
            .publish(CLEANUP_SUBJECT, payload.into())
            .await?
            .await?;
        Ok(())
    }

    /// Create a pull consumer for the cleanup queue. Replicas sharing a
    /// consumer name share the work.
    pub async fn consumer(&self, consumer_name: &str) -> Result<PullConsumer> {
        let stream = self.stream.lock().await;
        let consumer = stream
            .get_or_create_consumer(
                consumer_name,
                jetstream::consumer::pull::Config {
                    durable_name: Some(consumer_name.to_string()),
                    ack_policy: jetstream::consumer::AckPolicy::Explicit,
                    ..Default::default()
                },
            )
            .await?;
        Ok(consumer)
    }

    /// Get current pending message count for the cleanup stream.
    pub async fn queue_depth(&self) -> Result<u64> {
        let mut stream = self.stream.lock().await;
        let info = stream.info().await?;
        Ok(info.state.messages)
    }
}
