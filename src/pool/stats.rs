use crate::core::errors::{PoolError, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Live per-run counters shared by every participant
#[derive(Debug)]
pub struct RunStats {
    run_id: Uuid,
    participants: usize,
    tasks: usize,
    started_at: DateTime<Utc>,
    per_worker: DashMap<String, u64>,
}

impl RunStats {
    pub fn new(participants: usize, tasks: usize) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            participants,
            tasks,
            started_at: Utc::now(),
            per_worker: DashMap::new(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Count one finished task for `worker`
    pub fn record(&self, worker: &str) {
        *self.per_worker.entry(worker.to_string()).or_insert(0) += 1;
    }

    /// Tasks finished so far across all participants
    pub fn processed(&self) -> u64 {
        self.per_worker.iter().map(|entry| *entry.value()).sum()
    }

    pub fn report(&self) -> RunReport {
        let per_worker: BTreeMap<String, u64> = self
            .per_worker
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect();
        RunReport {
            run_id: self.run_id.to_string(),
            participants: self.participants,
            tasks: self.tasks,
            processed: per_worker.values().sum(),
            per_worker,
            started_at: self.started_at,
            finished_at: Utc::now(),
        }
    }
}

/// Snapshot of a finished run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    /// Spawned workers plus the coordinator's helper
    pub participants: usize,
    pub tasks: usize,
    pub processed: u64,
    pub per_worker: BTreeMap<String, u64>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn processed_by(&self, worker: &str) -> u64 {
        self.per_worker.get(worker).copied().unwrap_or(0)
    }

    pub fn elapsed(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| PoolError::io("serialize run report", e.into()))
    }
}
