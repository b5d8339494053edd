//! Prometheus metrics for reaper passes, alerts and the cleanup aggregator.

use kalla_reaper::{CleanupTally, ReapOutcome};
use prometheus_client::encoding::text::encode;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use tracing::warn;

/// Single-label set, e.g. `outcome="enqueued"`.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub struct Label {
    name: &'static str,
    value: String,
}

impl Label {
    pub fn outcome(value: impl Into<String>) -> Self {
        Self {
            name: "outcome",
            value: value.into(),
        }
    }

    pub fn key(value: impl Into<String>) -> Self {
        Self {
            name: "key",
            value: value.into(),
        }
    }
}

impl prometheus_client::encoding::EncodeLabelSet for Label {
    fn encode(
        &self,
        mut encoder: prometheus_client::encoding::LabelSetEncoder,
    ) -> Result<(), std::fmt::Error> {
        use prometheus_client::encoding::EncodeLabel;
        (self.name, self.value.as_str()).encode(encoder.encode_label())?;
        Ok(())
    }
}

#[derive(Clone)]
pub struct JanitorMetrics {
    pub pipelines_cleaned: Counter,
    pub jobs_marked: Counter,
    pub reap_item_errors: Counter,
    pub reap_failures: Counter,
    pub aggregator_launches: Family<Label, Counter>,
    pub stuck_jobs: Gauge,
    pub alerts_sent: Counter,
    pub alerts_failed: Counter,
    pub auxiliary_entities: Family<Label, Counter>,
    pub aggregator_jobs: Family<Label, Counter>,
    pub active_jobs: Gauge,
    pub queue_depth: Gauge,
    pub registry: Arc<Registry>,
}

impl JanitorMetrics {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let pipelines_cleaned = Counter::default();
        registry.register(
            "kalla_reaper_pipelines_cleaned",
            "Root pipelines whose cleanup was requested",
            pipelines_cleaned.clone(),
        );

        let jobs_marked = Counter::default();
        registry.register(
            "kalla_reaper_jobs_marked",
            "Job records flagged as cleaned up",
            jobs_marked.clone(),
        );

        let reap_item_errors = Counter::default();
        registry.register(
            "kalla_reaper_item_errors",
            "Per-pipeline collaborator failures during reap passes",
            reap_item_errors.clone(),
        );

        let reap_failures = Counter::default();
        registry.register(
            "kalla_reaper_pass_failures",
            "Reap passes that could not run",
            reap_failures.clone(),
        );

        let aggregator_launches = Family::<Label, Counter>::default();
        registry.register(
            "kalla_reaper_aggregator_launches",
            "Cleanup aggregator launch decisions by outcome",
            aggregator_launches.clone(),
        );

        let stuck_jobs = Gauge::default();
        registry.register(
            "kalla_reaper_stuck_jobs",
            "Stuck jobs found by the last report",
            stuck_jobs.clone(),
        );

        let alerts_sent = Counter::default();
        registry.register(
            "kalla_reaper_alerts_sent",
            "Stuck job alerts delivered",
            alerts_sent.clone(),
        );

        let alerts_failed = Counter::default();
        registry.register(
            "kalla_reaper_alerts_failed",
            "Stuck job reports that failed",
            alerts_failed.clone(),
        );

        let auxiliary_entities = Family::<Label, Counter>::default();
        registry.register(
            "kalla_aggregator_entities",
            "Auxiliary entities seen by the cleanup aggregator by tally key",
            auxiliary_entities.clone(),
        );

        let aggregator_jobs = Family::<Label, Counter>::default();
        registry.register(
            "kalla_aggregator_jobs",
            "Cleanup aggregator jobs finished by outcome",
            aggregator_jobs.clone(),
        );

        let active_jobs = Gauge::default();
        registry.register(
            "kalla_aggregator_active_jobs",
            "Cleanup aggregator jobs currently running",
            active_jobs.clone(),
        );

        let queue_depth = Gauge::default();
        registry.register(
            "kalla_janitor_queue_depth",
            "Number of pending cleanup jobs",
            queue_depth.clone(),
        );

        Self {
            pipelines_cleaned,
            jobs_marked,
            reap_item_errors,
            reap_failures,
            aggregator_launches,
            stuck_jobs,
            alerts_sent,
            alerts_failed,
            auxiliary_entities,
            aggregator_jobs,
            active_jobs,
            queue_depth,
            registry: Arc::new(registry),
        }
    }

    pub fn record_reap(&self, outcome: &ReapOutcome) {
        self.pipelines_cleaned.inc_by(outcome.pipelines_cleaned as u64);
        self.jobs_marked.inc_by(outcome.jobs_marked as u64);
        self.reap_item_errors.inc_by(outcome.errors.len() as u64);
        self.aggregator_launches
            .get_or_create(&Label::outcome(outcome.aggregator.label()))
            .inc();
    }

    pub fn record_tally(&self, tally: &CleanupTally) {
        for (key, count) in tally.iter() {
            self.auxiliary_entities
                .get_or_create(&Label::key(key.as_str()))
                .inc_by(count);
        }
    }

    /// Encode all metrics as Prometheus text format.
    pub fn encode(&self) -> String {
        let mut buf = String::new();
        if let Err(e) = encode(&mut buf, &self.registry) {
            warn!("Failed to encode metrics: {}", e);
        }
        buf
    }
}

impl Default for JanitorMetrics {
    fn default() -> Self {
        Self::new()
    }
}
