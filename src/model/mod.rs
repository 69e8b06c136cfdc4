//! Snapshot table rows owned by the store.
//!
//! The subscriber is the sole writer of these tables during bootstrap and
//! restart; workers and watchers read them (and own the endpoint history
//! collection, which the subscriber only projects during delete
//! synthesis).

mod epg;
mod history;
mod node;
mod pc;
mod queue_stats;
mod subnet;
mod tunnel;
mod vnid;

pub use epg::Epg;
pub use history::{AddrType, HistoryFilter, HistoryProjection};
pub use node::{vpc_domain_id, Node, NodeRole, VpcMember};
pub use pc::{Pc, Vpc};
pub use queue_stats::QueueStats;
pub use subnet::Subnet;
pub use tunnel::Tunnel;
pub use vnid::Vnid;

/// Derived tables a worker may cache; named in `FLUSH_CACHE` work items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EptTable {
    Node,
    Tunnel,
    Pc,
    Vpc,
    Vnid,
    Epg,
    Subnet,
}

impl EptTable {
    pub const fn as_str(self) -> &'static str {
        match self {
            EptTable::Node => "node",
            EptTable::Tunnel => "tunnel",
            EptTable::Pc => "pc",
            EptTable::Vpc => "vpc",
            EptTable::Vnid => "vnid",
            EptTable::Epg => "epg",
            EptTable::Subnet => "subnet",
        }
    }
}
