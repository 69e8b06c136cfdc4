use serde::{Deserialize, Serialize};

/// Flushed counters and one depth sample for a single queue or channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Owning process, `fab-<fabric>` for the subscriber.
    pub proc: String,
    pub queue: String,
    pub total_tx_msg: u64,
    pub total_rx_msg: u64,
    /// Queue depth observed at collection time.
    pub qlen: u64,
    pub ts: f64,
}
