//! Document store seam: snapshot tables, MO cache collections, settings,
//! queue stats, fabric events, and the worker-owned endpoint history
//! projection.
//!
//! The subscriber is the sole writer of the snapshot tables during
//! bootstrap and restart. Saves are upserts keyed by each table's natural
//! key; flushes remove every row for one fabric.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::model::{
    Epg, HistoryFilter, HistoryProjection, Node, Pc, QueueStats, Subnet, Tunnel, Vnid, Vpc,
};
use crate::settings::Settings;

/// One raw managed object as cached from a controller class query.
#[derive(Debug, Clone, PartialEq)]
pub struct MoRow {
    pub dn: String,
    pub attrs: Map<String, Value>,
    pub ts: f64,
}

impl MoRow {
    /// String attribute accessor; absent or non-string yields `""`.
    pub fn attr(&self, name: &str) -> &str {
        self.attrs.get(name).and_then(Value::as_str).unwrap_or("")
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Cheap liveness probe used by the stats loop to escalate a dead DB.
    async fn alive(&self) -> bool;

    async fn load_settings(&self, fabric: &str) -> Result<Settings>;
    async fn save_settings(&self, settings: &Settings) -> Result<()>;

    /// Record a user-visible fabric status event (`initializing`,
    /// `failed`, `running`, …).
    async fn add_fabric_event(&self, fabric: &str, status: &str, description: &str) -> Result<()>;
    /// Persist the auto-start flag; cleared on semantic validation
    /// failures so the supervisor stops respawning a doomed fabric.
    async fn set_auto_start(&self, fabric: &str, auto_start: bool) -> Result<()>;

    async fn flush_nodes(&self, fabric: &str) -> Result<()>;
    async fn save_nodes(&self, rows: &[Node]) -> Result<()>;
    async fn nodes(&self, fabric: &str) -> Result<Vec<Node>>;
    async fn node(&self, fabric: &str, node: u32) -> Result<Option<Node>>;

    async fn flush_tunnels(&self, fabric: &str) -> Result<()>;
    async fn save_tunnels(&self, rows: &[Tunnel]) -> Result<()>;
    async fn tunnels(&self, fabric: &str) -> Result<Vec<Tunnel>>;

    async fn flush_pcs(&self, fabric: &str) -> Result<()>;
    async fn save_pcs(&self, rows: &[Pc]) -> Result<()>;
    async fn pcs(&self, fabric: &str) -> Result<Vec<Pc>>;

    async fn flush_vpcs(&self, fabric: &str) -> Result<()>;
    async fn save_vpcs(&self, rows: &[Vpc]) -> Result<()>;

    async fn flush_vnids(&self, fabric: &str) -> Result<()>;
    async fn save_vnids(&self, rows: &[Vnid]) -> Result<()>;
    async fn vnids(&self, fabric: &str) -> Result<Vec<Vnid>>;

    async fn flush_epgs(&self, fabric: &str) -> Result<()>;
    async fn save_epgs(&self, rows: &[Epg]) -> Result<()>;
    async fn epgs(&self, fabric: &str) -> Result<Vec<Epg>>;

    async fn flush_subnets(&self, fabric: &str) -> Result<()>;
    async fn save_subnets(&self, rows: &[Subnet]) -> Result<()>;

    /// Replace the cached rows for one MO class.
    async fn save_mo(&self, fabric: &str, class: &str, rows: &[MoRow]) -> Result<()>;

    async fn save_queue_stats(&self, rows: &[QueueStats]) -> Result<()>;

    /// Stream the endpoint-history projection (most recent event not a
    /// delete), optionally narrowed to one endpoint key.
    async fn endpoint_history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<BoxStream<'static, Result<HistoryProjection>>>;
}
