//! Kalla Reaper - housekeeping for the batch-job runtime
//!
//! This crate decides which finished or abandoned jobs can be cleaned up:
//! - StaleJobReaper: correlates job records with root pipelines and requests cleanup
//! - StuckJobReporter: summarises stuck jobs into a single admin alert
//! - CleanupAggregator: deletes old per-run and per-shard bookkeeping rows
//!
//! Storage, transport and delivery are collaborators behind the traits in
//! [`registry`].

pub mod aggregator;
pub mod error;
#[cfg(any(test, feature = "test-util"))]
pub mod memory;
pub mod model;
pub mod reaper;
pub mod registry;
pub mod report;
pub mod window;

pub use aggregator::{CleanupAggregator, CleanupTally, TallyKey};
pub use error::{AggregateError, CollaboratorError, ReapError, ReportError};
pub use model::{
    AuxiliaryKind, AuxiliaryState, JobParams, JobRecord, JobStatus, PipelineState,
    PipelineStatus, ResultStatus,
};
pub use reaper::{AggregatorLaunch, ReapOutcome, StaleJobReaper, Verdict};
pub use registry::{AlertSender, AuxiliaryStore, BatchJobRuntime, JobRegistry, PipelineRegistry};
pub use report::{StuckJobReport, StuckJobReporter};
pub use window::RetentionWindow;

/// Job class name under which the cleanup aggregator is enqueued and tracked.
pub const CLEANUP_AGGREGATOR_CLASS: &str = "JobCleanupAggregator";

/// Parameter carrying the reaper's staleness threshold into the aggregator.
pub const PARAM_MAX_START_TIME_MSEC: &str = "max_start_time_msec";

/// Metadata key linking a job record to its root pipeline.
pub const ROOT_PIPELINE_ID_KEY: &str = "root_pipeline_id";
