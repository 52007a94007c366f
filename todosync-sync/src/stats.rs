//! Running statistics and the bounded sync history.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use todosync_core::SyncDirection;

use crate::events::SyncOutcome;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncStatistics {
    pub total_syncs: u64,
    pub success_count: u64,
    pub failure_count: u64,
    pub average_duration_ms: f64,
    pub conflict_count: u64,
    pub retry_count: u64,
    pub last_sync_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub sync_id: Uuid,
    pub direction: SyncDirection,
    pub outcome: SyncOutcome,
    pub duration_ms: u64,
    pub timestamp: DateTime<Utc>,
    pub tasks_written: usize,
    pub conflicts: usize,
    pub retries: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Statistics plus history, updated together under one lock.
#[derive(Debug)]
pub(crate) struct StatsRecorder {
    stats: SyncStatistics,
    history: VecDeque<HistoryEntry>,
    limit: usize,
}

impl StatsRecorder {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            stats: SyncStatistics::default(),
            history: VecDeque::with_capacity(limit.min(1024)),
            limit: limit.max(1),
        }
    }

    pub(crate) fn record(&mut self, entry: HistoryEntry) {
        let stats = &mut self.stats;
        stats.total_syncs += 1;
        match entry.outcome {
            SyncOutcome::Failed => stats.failure_count += 1,
            SyncOutcome::Success | SyncOutcome::NoChange => stats.success_count += 1,
        }
        let n = stats.total_syncs as f64;
        stats.average_duration_ms += (entry.duration_ms as f64 - stats.average_duration_ms) / n;
        stats.conflict_count += entry.conflicts as u64;
        stats.retry_count += u64::from(entry.retries);
        stats.last_sync_at = Some(entry.timestamp);

        if self.history.len() == self.limit {
            self.history.pop_front();
        }
        self.history.push_back(entry);
    }

    pub(crate) fn stats(&self) -> SyncStatistics {
        self.stats.clone()
    }

    /// Statistics go back to zero; history is kept.
    pub(crate) fn reset_stats(&mut self) {
        self.stats = SyncStatistics::default();
    }

    /// Up to `limit` entries, newest first.
    pub(crate) fn history(&self, limit: usize) -> Vec<HistoryEntry> {
        self.history.iter().rev().take(limit).cloned().collect()
    }
}
