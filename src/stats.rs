//! Per-queue transmit/receive counters with periodic depth sampling.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::model::QueueStats;

/// Aggregate pseudo-queue tracked alongside the real ones.
pub const TOTAL_QUEUE: &str = "total";

#[derive(Debug, Default, Clone, Copy)]
struct Counters {
    tx: u64,
    rx: u64,
}

/// Counter table shared by the dispatch path and the stats ticker. A
/// single mutex covers both paths; every registered queue also feeds the
/// `total` aggregate.
pub struct QueueStatsTable {
    proc: String,
    inner: Mutex<HashMap<String, Counters>>,
}

impl QueueStatsTable {
    /// Register the fixed queue set up front; counts for unregistered
    /// queues are dropped silently, matching the immutable worker table.
    pub fn new(proc: impl Into<String>, queues: impl IntoIterator<Item = String>) -> Self {
        let mut inner: HashMap<String, Counters> =
            queues.into_iter().map(|q| (q, Counters::default())).collect();
        inner.insert(TOTAL_QUEUE.to_string(), Counters::default());
        Self {
            proc: proc.into(),
            inner: Mutex::new(inner),
        }
    }

    pub fn increment_tx(&self, queue: &str, count: u64) {
        self.increment(queue, count, true);
    }

    pub fn increment_rx(&self, queue: &str, count: u64) {
        self.increment(queue, count, false);
    }

    fn increment(&self, queue: &str, count: u64, tx: bool) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        if !guard.contains_key(queue) {
            return;
        }
        for key in [queue, TOTAL_QUEUE] {
            if let Some(c) = guard.get_mut(key) {
                if tx {
                    c.tx += count;
                } else {
                    c.rx += count;
                }
            }
        }
    }

    /// Registered queue names, aggregate excluded (it has no depth).
    pub fn queue_names(&self) -> Vec<String> {
        match self.inner.lock() {
            Ok(guard) => {
                let mut names: Vec<String> = guard
                    .keys()
                    .filter(|k| k.as_str() != TOTAL_QUEUE)
                    .cloned()
                    .collect();
                names.sort();
                names
            }
            Err(_) => Vec::new(),
        }
    }

    /// Build one flushable row per registered queue, attaching the depth
    /// samples collected by the caller.
    pub fn rows(&self, depths: &HashMap<String, u64>, ts: f64) -> Vec<QueueStats> {
        let Ok(guard) = self.inner.lock() else {
            return Vec::new();
        };
        let mut rows: Vec<QueueStats> = guard
            .iter()
            .map(|(queue, c)| QueueStats {
                proc: self.proc.clone(),
                queue: queue.clone(),
                total_tx_msg: c.tx,
                total_rx_msg: c.rx,
                qlen: depths.get(queue).copied().unwrap_or(0),
                ts,
            })
            .collect();
        rows.sort_by(|a, b| a.queue.cmp(&b.queue));
        rows
    }
}
