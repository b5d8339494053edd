//! Retention thresholds derived from a reference clock.

use crate::error::AggregateError;

pub const HOUR_MS: i64 = 60 * 60 * 1000;
pub const DAY_MS: i64 = 24 * HOUR_MS;

/// Default retention for map/reduce metadata.
pub const DEFAULT_RETENTION_MS: i64 = 2 * DAY_MS;
/// How far beyond the retention window job records are still fetched.
pub const DEFAULT_FETCH_LOOKBACK_MS: i64 = 7 * DAY_MS;

/// Latest start time a job may have and still be eligible for cleanup.
pub fn compute_threshold(now_ms: i64, min_age_ms: i64) -> i64 {
    now_ms.saturating_sub(min_age_ms)
}

/// The two windows a reap pass works with.
///
/// `min_age_ms` bounds the termination-safety check (pipelines and job
/// records must have started before `now - min_age_ms`). `max_age_ms` bounds
/// which job records are fetched at all. They are kept independent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionWindow {
    min_age_ms: i64,
    max_age_ms: i64,
}

impl RetentionWindow {
    /// Window with the fetch bound set to `min_age_ms` plus seven days.
    pub fn from_min_age(min_age_ms: i64) -> Self {
        Self {
            min_age_ms,
            max_age_ms: min_age_ms.saturating_add(DEFAULT_FETCH_LOOKBACK_MS),
        }
    }

    /// Window with an explicit fetch bound. Returns `None` when the fetch
    /// bound is shorter than the retention, which would exclude every
    /// eligible record.
    pub fn new(min_age_ms: i64, max_age_ms: i64) -> Option<Self> {
        if min_age_ms < 0 || max_age_ms < min_age_ms {
            return None;
        }
        Some(Self {
            min_age_ms,
            max_age_ms,
        })
    }

    pub fn min_age_ms(&self) -> i64 {
        self.min_age_ms
    }

    pub fn max_age_ms(&self) -> i64 {
        self.max_age_ms
    }

    pub fn max_start_time_ms(&self, now_ms: i64) -> i64 {
        compute_threshold(now_ms, self.min_age_ms)
    }
}

impl Default for RetentionWindow {
    fn default() -> Self {
        Self::from_min_age(DEFAULT_RETENTION_MS)
    }
}

/// Read the staleness threshold passed to an aggregator run.
pub fn threshold_from_params(params: &crate::JobParams) -> Result<i64, AggregateError> {
    let name = crate::PARAM_MAX_START_TIME_MSEC;
    let value = params.get(name).ok_or(AggregateError::MissingParam(name))?;
    value.as_i64().ok_or_else(|| AggregateError::InvalidParam {
        name,
        value: value.to_string(),
    })
}
