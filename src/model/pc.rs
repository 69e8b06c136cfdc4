use serde::{Deserialize, Serialize};

/// Port-channel aggregate on a node, with member interfaces resolved
/// from the aggregate's member links.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pc {
    pub fabric: String,
    pub node: u32,
    /// Local interface id, e.g. `po1`.
    pub intf: String,
    /// Full dn of the aggregate; member links reference it as parent.
    pub name: String,
    #[serde(default)]
    pub members: Vec<String>,
    pub ts: f64,
}

/// Mapping of a local port-channel to its logical vpc interface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Vpc {
    pub fabric: String,
    pub node: u32,
    /// Local port-channel id.
    pub intf: String,
    /// Logical vpc interface id shared by both members.
    pub vpc: u32,
    pub ts: f64,
}
