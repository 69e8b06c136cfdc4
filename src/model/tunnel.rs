use serde::{Deserialize, Serialize};

/// One tunnel interface on a node. `remote` is resolved by matching
/// `dst` against a node TEP; tunnels whose destination is outside the
/// fabric (vxlan, proxy, dci, golf, fabric-ext, underlay-mcast) keep
/// `remote = 0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tunnel {
    pub fabric: String,
    pub node: u32,
    /// Interface id, e.g. `tunnel9`.
    pub intf: String,
    /// Full dn of the tunnel interface.
    pub name: String,
    /// Source TEP with the prefix length stripped.
    pub src: String,
    pub dst: String,
    #[serde(default)]
    pub remote: u32,
    pub status: String,
    /// `ivxlan` for fabric tunnels, `vxlan` for external ones.
    pub encap: String,
    /// Comma-separated type flags as reported by the controller.
    pub flags: String,
    pub ts: f64,
}

impl Tunnel {
    /// Flags/encap that legitimately resolve to no remote fabric node.
    pub fn external(&self) -> bool {
        self.encap == "vxlan"
            || ["proxy", "dci", "golf", "fabric-ext", "underlay-mcast"]
                .iter()
                .any(|f| self.flags.contains(f))
    }
}
