use serde::{Deserialize, Serialize};

/// One layer-2/layer-3 segment: vrf, BD, service BD, or external encap.
/// Keyed by `name` (the source object dn) within a fabric.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vnid {
    pub fabric: String,
    pub vnid: u32,
    /// Dn of the source object.
    pub name: String,
    #[serde(default)]
    pub encap: String,
    /// Owning vrf vnid, resolved for external encaps only.
    #[serde(default)]
    pub vrf: u32,
    #[serde(default)]
    pub external: bool,
    pub ts: f64,
}
