use std::fmt;

use serde::{Deserialize, Serialize};

/// Role reported by the controller for a fabric node. `Vpc` is reserved
/// for the pseudo-nodes synthesized from vpc protection groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Leaf,
    Spine,
    Controller,
    Vpc,
}

impl fmt::Display for NodeRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeRole::Leaf => write!(f, "leaf"),
            NodeRole::Spine => write!(f, "spine"),
            NodeRole::Controller => write!(f, "controller"),
            NodeRole::Vpc => write!(f, "vpc"),
        }
    }
}

/// Member leaf of a vpc pseudo-node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VpcMember {
    pub node: u32,
    pub addr: String,
}

/// One fabric node, physical or vpc pseudo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub fabric: String,
    pub node: u32,
    pub pod_id: u32,
    /// TEP address. Overlaid from topSystem for active nodes; for vpc
    /// pseudo-nodes this is the virtual ip with the mask stripped.
    pub addr: String,
    pub name: String,
    pub role: NodeRole,
    pub state: String,
    pub version: String,
    /// Peer node id for members of a vpc domain.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub peer: Option<u32>,
    /// The two member leaves, populated on vpc pseudo-nodes only.
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub nodes: Vec<VpcMember>,
}

/// Deterministic id for the pseudo-node representing a vpc domain.
/// Commutative in its arguments so both members derive the same id.
pub fn vpc_domain_id(a: u32, b: u32) -> u32 {
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    (lo << 16) | hi
}
