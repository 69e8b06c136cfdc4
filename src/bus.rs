//! Broker seam: pub/sub channels plus per-worker list queues.
//!
//! The production implementation is a redis-like client owned by the
//! deployment; the subscriber only depends on this trait. Queue pushes
//! support head insertion so an on-demand endpoint refresh can jump the
//! line without a separate priority queue.

use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::Result;

/// Commands into the subscriber (refresh, delete, settings reload, EOF
/// acks).
pub const SUBSCRIBER_CTRL_CHANNEL: &str = "subscriber_ctrl";
/// Subscriber-to-supervisor restart requests.
pub const MANAGER_CTRL_CHANNEL: &str = "manager_ctrl";
/// Hello/keepalive messages from fabric processes.
pub const WORKER_CTRL_CHANNEL: &str = "worker_ctrl";
/// Fan-out of work items to every worker.
pub const WORKER_BROADCAST_CHANNEL: &str = "worker_broadcast";
/// Fan-out of control messages to every watcher.
pub const WATCHER_BROADCAST_CHANNEL: &str = "watcher_broadcast";

/// One message observed on a subscribed channel.
#[derive(Debug, Clone)]
pub struct ChannelMsg {
    pub channel: String,
    pub payload: String,
}

#[async_trait]
pub trait Bus: Send + Sync {
    /// Publish a payload to every current subscriber of `channel`.
    /// Best-effort fan-out; delivery is not acknowledged.
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Append (or with `prepend`, head-insert) a payload onto a worker
    /// queue.
    async fn push(&self, queue: &str, payload: String, prepend: bool) -> Result<()>;

    /// Current depth of a queue, for stats sampling.
    async fn queue_len(&self, queue: &str) -> Result<u64>;

    /// Subscribe to a channel, returning the stream of its messages. The
    /// stream ends when the bus connection is torn down.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, ChannelMsg>>;
}
