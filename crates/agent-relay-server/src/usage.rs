//! Usage counters and their periodic reporting.
//!
//! Counters only ever grow between reports. A report takes a snapshot, sends
//! it and subtracts exactly what was sent, so increments made in the meantime
//! and counts from failed reports carry over to the next attempt.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use agent_relay_core::MetadataError;
use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use tracing::debug;

use crate::api::RelayApi;
use crate::stream::StreamContext;

/// Name of the counter bumped once per delivered GitOps turn.
pub const GITOPS_SYNC_COUNT: &str = "gitops_sync_count";

#[derive(Debug, thiserror::Error)]
pub enum UsageError {
    #[error("counter with name {0} already exists")]
    DuplicateCounter(String),
}

/// Handle to a registered counter.
#[derive(Debug, Clone)]
pub struct Counter {
    n: Arc<AtomicI64>,
}

impl Counter {
    pub fn inc(&self) {
        self.n.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of non-zero counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UsageData {
    pub counters: HashMap<String, i64>,
}

#[derive(Debug, Default)]
pub struct UsageTracker {
    counters: DashMap<String, Arc<AtomicI64>>,
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_counter(&self, name: &str) -> Result<Counter, UsageError> {
        use dashmap::mapref::entry::Entry;

        match self.counters.entry(name.to_string()) {
            Entry::Occupied(_) => Err(UsageError::DuplicateCounter(name.to_string())),
            Entry::Vacant(slot) => {
                let n = Arc::new(AtomicI64::new(0));
                slot.insert(n.clone());
                Ok(Counter { n })
            }
        }
    }

    /// Current non-zero counters, and whether all counters are zero.
    pub fn clone_usage_data(&self) -> (UsageData, bool) {
        let counters: HashMap<String, i64> = self
            .counters
            .iter()
            .filter_map(|entry| {
                let n = entry.value().load(Ordering::Relaxed);
                (n != 0).then(|| (entry.key().clone(), n))
            })
            .collect();
        let all_zeroes = counters.is_empty();
        (UsageData { counters }, all_zeroes)
    }

    /// Remove counts that have been reported.
    pub fn subtract(&self, data: &UsageData) {
        for (name, n) in &data.counters {
            if let Some(counter) = self.counters.get(name) {
                counter.fetch_sub(*n, Ordering::Relaxed);
            }
        }
    }
}

/// Destination for usage reports.
#[async_trait]
pub trait UsageSink: Send + Sync {
    async fn send_usage(&self, data: &UsageData) -> Result<(), MetadataError>;
}

/// Sends usage data every `period`. A zero period disables reporting.
pub struct UsageReporter {
    tracker: Arc<UsageTracker>,
    sink: Arc<dyn UsageSink>,
    api: Arc<RelayApi>,
    period: Duration,
}

impl UsageReporter {
    pub fn new(
        tracker: Arc<UsageTracker>,
        sink: Arc<dyn UsageSink>,
        api: Arc<RelayApi>,
        period: Duration,
    ) -> Self {
        Self {
            tracker,
            sink,
            api,
            period,
        }
    }

    pub async fn run(&self, ctx: &StreamContext) {
        if self.period.is_zero() {
            return;
        }

        let mut ticker =
            tokio::time::interval_at(tokio::time::Instant::now() + self.period, self.period);
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return,
                _ = ticker.tick() => {
                    if let Err(e) = self.send_usage().await {
                        self.api.handle_processing_error("Failed to send usage data", &e);
                    }
                }
            }
        }
    }

    /// Report accumulated counts once.
    pub async fn send_usage(&self) -> Result<(), MetadataError> {
        let (data, all_zeroes) = self.tracker.clone_usage_data();
        if all_zeroes {
            return Ok(());
        }
        self.sink.send_usage(&data).await?;
        debug!("Reported usage counters: {:?}", data.counters);
        self.tracker.subtract(&data);
        Ok(())
    }
}
