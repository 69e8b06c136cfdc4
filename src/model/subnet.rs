use serde::{Deserialize, Serialize};

/// One configured subnet, attached to its BD vnid. The same ip may
/// appear under multiple BDs (shared services), so there is no
/// uniqueness constraint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subnet {
    pub fabric: String,
    pub bd: u32,
    pub ip: String,
    /// Dn of the source subnet object.
    pub name: String,
    pub ts: f64,
}
