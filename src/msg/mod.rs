//! Wire envelope and payload types shared with workers and watchers.
//!
//! Every message is a self-delimited JSON object tagged by `msg_type`.
//! Work items fan out hash-partitioned onto per-worker queues; a bulk
//! envelope folds up to the configured send length of work items into a
//! single queue push and inherits the last inner sequence number.

pub mod epm;

use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::Result;
use crate::model::AddrType;

/// Destination role for a work item. `None` on a broadcast means all
/// roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Worker,
    Watcher,
}

/// Work item classification understood by workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkType {
    Raw,
    StdMo,
    EpmIpEvent,
    EpmMacEvent,
    EpmRsIpEvent,
    FlushCache,
    FabricWatchPause,
    FabricWatchResume,
    FabricEpmEof,
    SettingsReload,
    DeleteEpt,
    WatchNode,
}

/// One unit of work addressed to a worker or watcher queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkMsg {
    #[serde(default)]
    pub fabric: String,
    pub work_type: WorkType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    /// Endpoint address or worker id; empty for control-style work items.
    #[serde(default)]
    pub addr: String,
    #[serde(default)]
    pub qnum: usize,
    #[serde(default)]
    pub vnid: u32,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub seq: u64,
    #[serde(default)]
    pub ts: f64,
    /// Force re-analysis even when the worker sees no change.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub force: bool,
}

impl WorkMsg {
    pub fn new(addr: impl Into<String>, role: Option<Role>, work_type: WorkType) -> Self {
        Self {
            fabric: String::new(),
            work_type,
            role,
            addr: addr.into(),
            qnum: 1,
            vnid: 0,
            data: Value::Null,
            seq: 0,
            ts: 0.0,
            force: false,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_qnum(mut self, qnum: usize) -> Self {
        self.qnum = qnum;
        self
    }

    /// Partition key for hashed dispatch.
    pub fn hash(&self) -> u32 {
        msg_hash(self.vnid, &self.addr)
    }
}

/// Heartbeat published on the worker control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub fabric: String,
    /// Reporting process name (`subscriber` here).
    pub name: String,
    #[serde(default)]
    pub queues: Vec<String>,
    pub start_ts: f64,
    #[serde(default)]
    pub seq: u64,
}

/// Bulk wrapper amortizing queue pushes under event bursts. The outer
/// `seq` equals the last inner `seq`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bulk {
    #[serde(default)]
    pub seq: u64,
    pub msgs: Vec<WorkMsg>,
}

/// Every message shape seen on the bus, tagged by `msg_type`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "msg_type", rename_all = "snake_case")]
pub enum Msg {
    Hello(Hello),
    Work(WorkMsg),
    Bulk(Bulk),
    /// Targeted endpoint refresh request from the API layer.
    RefreshEpt {
        fabric: String,
        vnid: u32,
        addr: String,
        #[serde(rename = "type")]
        addr_type: AddrType,
    },
    /// Request to enqueue a delete job for one endpoint key.
    DeleteEpt {
        fabric: String,
        vnid: u32,
        addr: String,
        #[serde(default)]
        qnum: usize,
    },
    /// Reload persisted settings and tell every process to do the same.
    SettingsReload { fabric: String },
    /// Worker acknowledgment of the EPM end-of-snapshot marker.
    FabricEpmEofAck { fabric: String, addr: String },
    /// Subscriber-to-supervisor restart request.
    FabricRestart { fabric: String, reason: String },
}

impl Msg {
    pub fn encode(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Stable partition hash over `(vnid, addr)`. Must agree with the worker
/// implementation so both sides route an endpoint to the same queue.
pub fn msg_hash(vnid: u32, addr: &str) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(vnid.to_string().as_bytes());
    hasher.update(addr.as_bytes());
    hasher.finalize()
}

/// Seconds since the unix epoch as a float, the timestamp unit used on
/// the wire and in the snapshot tables.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
