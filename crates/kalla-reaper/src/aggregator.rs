//! Cleanup aggregator: scan-and-delete job over auxiliary run/shard state.
//!
//! The map step judges one row, deletes it when it succeeded and aged past the
//! threshold, and emits a `(key, 1)` tally. Rows of a page are mapped
//! concurrently; both kinds are scanned side by side. The reduce step sums
//! tallies per key and logs deleted counts apart from remaining counts.

use futures::stream::{self, StreamExt};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::AggregateError;
use crate::model::{AuxiliaryKind, AuxiliaryState, JobParams};
use crate::registry::AuxiliaryStore;
use crate::window::threshold_from_params;

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_PAGE_SIZE: usize = 500;

/// Tally keys emitted by the map step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TallyKey {
    RunDeleted,
    RunRemaining,
    ShardDeleted,
    ShardRemaining,
}

impl TallyKey {
    fn for_kind(kind: AuxiliaryKind, deleted: bool) -> Self {
        match (kind, deleted) {
            (AuxiliaryKind::Run, true) => TallyKey::RunDeleted,
            (AuxiliaryKind::Run, false) => TallyKey::RunRemaining,
            (AuxiliaryKind::Shard, true) => TallyKey::ShardDeleted,
            (AuxiliaryKind::Shard, false) => TallyKey::ShardRemaining,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TallyKey::RunDeleted => "run_deleted",
            TallyKey::RunRemaining => "run_remaining",
            TallyKey::ShardDeleted => "shard_deleted",
            TallyKey::ShardRemaining => "shard_remaining",
        }
    }

    pub fn is_deleted(self) -> bool {
        matches!(self, TallyKey::RunDeleted | TallyKey::ShardDeleted)
    }
}

impl fmt::Display for TallyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Summed tallies of one aggregator run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupTally {
    counts: BTreeMap<TallyKey, u64>,
}

impl CleanupTally {
    /// Sum `(key, count)` pairs. Order does not matter.
    pub fn reduce(tallies: impl IntoIterator<Item = (TallyKey, u64)>) -> Self {
        let mut summed = Self::default();
        for (key, count) in tallies {
            *summed.counts.entry(key).or_insert(0) += count;
        }
        summed
    }

    pub fn merge(&mut self, other: CleanupTally) {
        for (key, count) in other.counts {
            *self.counts.entry(key).or_insert(0) += count;
        }
    }

    pub fn get(&self, key: TallyKey) -> u64 {
        self.counts.get(&key).copied().unwrap_or(0)
    }

    pub fn deleted(&self) -> u64 {
        self.iter()
            .filter(|(k, _)| k.is_deleted())
            .map(|(_, c)| c)
            .sum()
    }

    pub fn remaining(&self) -> u64 {
        self.iter()
            .filter(|(k, _)| !k.is_deleted())
            .map(|(_, c)| c)
            .sum()
    }

    pub fn iter(&self) -> impl Iterator<Item = (TallyKey, u64)> + '_ {
        self.counts.iter().map(|(k, c)| (*k, *c))
    }

    fn log(&self) {
        for (key, count) in self.iter() {
            if key.is_deleted() {
                info!("Delete count: {} entities ({})", count, key);
            } else {
                info!("Entities remaining count: {} entities ({})", count, key);
            }
        }
    }
}

pub struct CleanupAggregator {
    store: Arc<dyn AuxiliaryStore>,
    concurrency: usize,
    page_size: usize,
}

impl CleanupAggregator {
    pub fn new(store: Arc<dyn AuxiliaryStore>) -> Self {
        Self {
            store,
            concurrency: DEFAULT_CONCURRENCY,
            page_size: DEFAULT_PAGE_SIZE,
        }
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Run from enqueued job parameters.
    pub async fn run_with_params(&self, params: &JobParams) -> Result<CleanupTally, AggregateError> {
        let max_start_time_ms = threshold_from_params(params)?;
        self.run(max_start_time_ms).await
    }

    /// Sweep both auxiliary kinds and return the reduced tally.
    pub async fn run(&self, max_start_time_ms: i64) -> Result<CleanupTally, AggregateError> {
        let (runs, shards) = futures::join!(
            self.sweep(AuxiliaryKind::Run, max_start_time_ms),
            self.sweep(AuxiliaryKind::Shard, max_start_time_ms),
        );

        let mut tally = runs?;
        tally.merge(shards?);
        tally.log();
        Ok(tally)
    }

    async fn sweep(
        &self,
        kind: AuxiliaryKind,
        max_start_time_ms: i64,
    ) -> Result<CleanupTally, AggregateError> {
        let mut tally = CleanupTally::default();
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .store
                .scan(kind, cursor.as_deref(), self.page_size)
                .await
                .map_err(AggregateError::Scan)?;
            let Some(last) = page.last() else { break };
            cursor = Some(last.id.clone());
            let full_page = page.len() >= self.page_size;

            let emitted: Vec<(TallyKey, u64)> = stream::iter(page)
                .map(|item| self.map_item(item, max_start_time_ms))
                .buffer_unordered(self.concurrency)
                .collect()
                .await;
            tally.merge(CleanupTally::reduce(emitted));

            if !full_page {
                break;
            }
        }

        Ok(tally)
    }

    /// Judge and possibly delete one row. A failed delete counts as remaining.
    pub async fn map_item(&self, item: AuxiliaryState, max_start_time_ms: i64) -> (TallyKey, u64) {
        if !item.is_expired(max_start_time_ms) {
            return (TallyKey::for_kind(item.kind, false), 1);
        }

        match self.store.delete(item.kind, &item.id).await {
            Ok(()) => (TallyKey::for_kind(item.kind, true), 1),
            Err(e) => {
                warn!(
                    "Failed to delete {} state {}, leaving it for the next pass: {}",
                    item.kind.as_str(),
                    item.id,
                    e
                );
                (TallyKey::for_kind(item.kind, false), 1)
            }
        }
    }
}
