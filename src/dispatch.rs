//! Hash-partitioned work dispatch with bulking and per-queue sequencing.
//!
//! Routing is deterministic: a message lands on
//! `workers[hash(vnid, addr) % len]` for its role, so the subscriber and
//! every worker agree on partition ownership without coordination. Each
//! (worker, queue) pair carries a strictly monotonic sequence number;
//! the queue's lock spans both the stamp and the push so messages reach
//! the queue in sequence order. Transport errors are logged and
//! swallowed; a stuck broker must never block event ingestion.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use tokio::sync::Mutex;

use crate::bus::{
    Bus, WATCHER_BROADCAST_CHANNEL, WORKER_BROADCAST_CHANNEL, WORKER_CTRL_CHANNEL,
};
use crate::msg::{Bulk, Msg, Role, WorkMsg};
use crate::stats::QueueStatsTable;

/// One downstream worker or watcher process and its queues.
pub struct TrackedWorker {
    pub worker_id: String,
    pub role: Role,
    pub queues: Vec<String>,
    last_seq: Vec<Mutex<u64>>,
}

impl TrackedWorker {
    pub fn new(worker_id: impl Into<String>, role: Role, queues: Vec<String>) -> Self {
        let last_seq = queues.iter().map(|_| Mutex::new(0)).collect();
        Self {
            worker_id: worker_id.into(),
            role,
            queues,
            last_seq,
        }
    }
}

/// Workers indexed by role. Built once at subscriber start and immutable
/// for the life of the instance; worker membership changes go through a
/// full restart.
#[derive(Default)]
pub struct ActiveWorkerTable {
    by_role: HashMap<Role, Vec<Arc<TrackedWorker>>>,
}

impl ActiveWorkerTable {
    pub fn new(workers: Vec<TrackedWorker>) -> Self {
        let mut by_role: HashMap<Role, Vec<Arc<TrackedWorker>>> = HashMap::new();
        for w in workers {
            by_role.entry(w.role).or_default().push(Arc::new(w));
        }
        Self { by_role }
    }

    pub fn workers(&self, role: Role) -> &[Arc<TrackedWorker>] {
        self.by_role.get(&role).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn all(&self) -> impl Iterator<Item = &Arc<TrackedWorker>> {
        self.by_role.values().flatten()
    }

    /// Every queue name, for stats registration.
    pub fn queue_names(&self) -> Vec<String> {
        self.all().flat_map(|w| w.queues.iter().cloned()).collect()
    }
}

/// Routes work items onto worker queues and broadcast channels.
pub struct Dispatcher {
    fabric: String,
    bus: Arc<dyn Bus>,
    workers: ActiveWorkerTable,
    stats: Arc<QueueStatsTable>,
    max_bulk: usize,
    worker_broadcast_seq: AtomicU64,
    watcher_broadcast_seq: AtomicU64,
}

impl Dispatcher {
    pub fn new(
        fabric: impl Into<String>,
        bus: Arc<dyn Bus>,
        workers: ActiveWorkerTable,
        max_bulk: usize,
    ) -> Self {
        let fabric = fabric.into();
        let mut queues = workers.queue_names();
        queues.extend([
            WORKER_BROADCAST_CHANNEL.to_string(),
            WATCHER_BROADCAST_CHANNEL.to_string(),
            WORKER_CTRL_CHANNEL.to_string(),
        ]);
        let stats = Arc::new(QueueStatsTable::new(format!("fab-{fabric}"), queues));
        Self {
            fabric,
            bus,
            workers,
            stats,
            max_bulk,
            worker_broadcast_seq: AtomicU64::new(0),
            watcher_broadcast_seq: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> Arc<QueueStatsTable> {
        Arc::clone(&self.stats)
    }

    pub fn worker_table(&self) -> &ActiveWorkerTable {
        &self.workers
    }

    /// Dispatch messages to their hash-selected workers. Messages for one
    /// (worker, queue) keep their intake order and are folded into bulks
    /// of at most `max_bulk`; a group of one goes out as a plain
    /// envelope. `prepend` head-inserts, used by on-demand refresh to jump
    /// the queue.
    pub async fn send(&self, msgs: Vec<WorkMsg>, prepend: bool) {
        // group by (worker, qnum) preserving intake order within a group
        let mut groups: Vec<(Arc<TrackedWorker>, usize, Vec<WorkMsg>)> = Vec::new();
        let mut index: HashMap<(String, usize), usize> = HashMap::new();
        for mut m in msgs {
            m.fabric = self.fabric.clone();
            let Some(role) = m.role else {
                warn!("dropping work item without role: {:?}", m.work_type);
                continue;
            };
            let workers = self.workers.workers(role);
            if workers.is_empty() {
                warn!("no available workers for role '{role:?}'");
                continue;
            }
            let worker = &workers[m.hash() as usize % workers.len()];
            if m.qnum >= worker.queues.len() {
                if worker.queues.is_empty() {
                    warn!("unable to send message to worker {} with 0 queues", worker.worker_id);
                    continue;
                }
                warn!(
                    "unable to enqueue work on worker {}, queue {} does not exist",
                    worker.worker_id, m.qnum
                );
                m.qnum = worker.queues.len() - 1;
                debug!("overwriting queue to {}", m.qnum);
            }
            let key = (worker.worker_id.clone(), m.qnum);
            let slot = *index.entry(key).or_insert_with(|| {
                groups.push((Arc::clone(worker), m.qnum, Vec::new()));
                groups.len() - 1
            });
            groups[slot].2.push(m);
        }

        for (worker, qnum, mut group) in groups {
            let queue = &worker.queues[qnum];
            // lock spans stamping and push so per-queue sequence order is
            // exactly delivery order
            let mut last_seq = worker.last_seq[qnum].lock().await;
            for m in group.iter_mut() {
                *last_seq += 1;
                m.seq = *last_seq;
            }
            self.stats.increment_tx(queue, group.len() as u64);
            for chunk in group.chunks(self.max_bulk) {
                let msg = if chunk.len() == 1 {
                    Msg::Work(chunk[0].clone())
                } else {
                    Msg::Bulk(Bulk {
                        seq: chunk[chunk.len() - 1].seq,
                        msgs: chunk.to_vec(),
                    })
                };
                self.push(queue, &msg, prepend).await;
            }
        }
    }

    /// Address a specific worker, bypassing the hash (EPM EOF markers).
    /// Same per-queue sequencing discipline as `send`.
    pub async fn send_direct(&self, worker: &TrackedWorker, msgs: Vec<WorkMsg>) {
        for mut m in msgs {
            m.fabric = self.fabric.clone();
            if m.qnum >= worker.queues.len() {
                warn!(
                    "unable to enqueue work on worker {}, queue {} does not exist",
                    worker.worker_id, m.qnum
                );
                continue;
            }
            let queue = &worker.queues[m.qnum];
            let mut last_seq = worker.last_seq[m.qnum].lock().await;
            *last_seq += 1;
            m.seq = *last_seq;
            self.stats.increment_tx(queue, 1);
            self.push(queue, &Msg::Work(m), false).await;
        }
    }

    /// Publish messages on the broadcast channel(s) selected by role;
    /// `role = None` goes to both. Each channel keeps its own monotonic
    /// counter; delivery is best-effort fan-out.
    pub async fn broadcast(&self, msgs: Vec<WorkMsg>) {
        for mut m in msgs {
            m.fabric = self.fabric.clone();
            let channels: &[&str] = match m.role {
                Some(Role::Worker) => &[WORKER_BROADCAST_CHANNEL],
                Some(Role::Watcher) => &[WATCHER_BROADCAST_CHANNEL],
                None => &[WORKER_BROADCAST_CHANNEL, WATCHER_BROADCAST_CHANNEL],
            };
            for channel in channels {
                let counter = match *channel {
                    WORKER_BROADCAST_CHANNEL => &self.worker_broadcast_seq,
                    _ => &self.watcher_broadcast_seq,
                };
                m.seq = counter.fetch_add(1, Ordering::Relaxed) + 1;
                debug!("broadcast [q:{channel}] {:?}", m.work_type);
                let payload = match Msg::Work(m.clone()).encode() {
                    Ok(p) => p,
                    Err(e) => {
                        error!("failed to encode broadcast msg: {e}");
                        continue;
                    }
                };
                if let Err(e) = self.bus.publish(channel, payload).await {
                    error!("failed to publish on {channel}: {e}");
                    continue;
                }
                self.stats.increment_tx(channel, 1);
            }
        }
    }

    async fn push(&self, queue: &str, msg: &Msg, prepend: bool) {
        let payload = match msg.encode() {
            Ok(p) => p,
            Err(e) => {
                error!("failed to encode msg for queue {queue}: {e}");
                return;
            }
        };
        if let Err(e) = self.bus.push(queue, payload, prepend).await {
            error!("failed to enqueue msg on queue {queue}: {e}");
        }
    }
}
