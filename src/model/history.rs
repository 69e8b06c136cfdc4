use std::fmt;

use serde::{Deserialize, Serialize};

/// Address family of a tracked endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddrType {
    Mac,
    Ip,
}

impl fmt::Display for AddrType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddrType::Mac => write!(f, "mac"),
            AddrType::Ip => write!(f, "ip"),
        }
    }
}

/// Projection of one endpoint-history document. The collection itself is
/// owned by the workers; the subscriber only reads this projection while
/// synthesizing delete jobs, already filtered to entries whose most
/// recent event is not a delete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryProjection {
    pub node: u32,
    pub vnid: u32,
    pub addr: String,
    #[serde(rename = "type")]
    pub addr_type: AddrType,
}

/// Filter for the history projection stream.
#[derive(Debug, Clone, Default)]
pub struct HistoryFilter {
    pub fabric: String,
    /// Restrict to a single endpoint key (targeted refresh).
    pub addr: Option<String>,
    pub vnid: Option<u32>,
}
