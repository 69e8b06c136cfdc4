//! Local managed-object cache and the dependency registry.
//!
//! The cache holds the raw attributes of every slow-MO class, rebuilt
//! from class queries during bootstrap and kept current from
//! subscription events afterwards. The registry maps each class to the
//! derived tables it feeds and, where a class projects directly into a
//! table row, a typed projector. Build phases and the event router both
//! go through it, so a class is only ever interpreted in one place.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use log::{debug, warn};
use serde_json::{Map, Value};

use crate::controller::{ClassQuery, ControllerSession};
use crate::error::{Error, Result};
use crate::model::{Epg, EptTable, Node, NodeRole, Pc, Subnet, Tunnel, Vnid, Vpc};
use crate::msg::now_ts;
use crate::store::{MoRow, Store};

/// Slow-MO classes in dependency order: vrfs before l3outs, BDs before
/// EPGs, pc aggregates before their member links.
pub const ORDERED_MO_CLASSES: [&str; 22] = [
    "fvCtx",
    "l3extRsEctx",
    "l3extOut",
    "l3extExtEncapAllocator",
    "l3extInstP",
    "fvBD",
    "fvSvcBD",
    "fvRsBd",
    "vnsRsEPpInfoToBD",
    "vnsRsLIfCtxToBD",
    "vnsLIfCtx",
    "mgmtRsMgmtBD",
    "mgmtInB",
    "fvAEPg",
    "vnsEPpInfo",
    "fvSubnet",
    "fvIpAttr",
    "pcAggrIf",
    "pcRsMbrIfs",
    "tunnelIf",
    "vpcRsVpcConf",
    "datetimeFormat",
];

/// Partially-built row for one derived table; fields that need
/// cross-object resolution (external vrf, epg bd, subnet bd, tunnel
/// remote) are finished by the owning build phase.
#[derive(Debug, Clone, PartialEq)]
pub enum EntityPartial {
    Node(Node),
    Tunnel(Tunnel),
    Pc(Pc),
    Vpc(Vpc),
    Vnid(Vnid),
    Epg(Epg),
    Subnet(Subnet),
}

type Projector = fn(&str, &MoRow) -> Option<EntityPartial>;

/// Registry entry for one MO class.
pub struct DependencyNode {
    /// Derived tables fed by this class; workers flush these caches when
    /// the class changes.
    pub tables: &'static [EptTable],
    /// Direct projection into a table row, when one exists (relation
    /// classes resolve through their neighbors instead).
    pub project: Option<Projector>,
}

/// Registry of projectors and flush targets keyed by MO class name.
pub fn dependency_map() -> &'static HashMap<&'static str, DependencyNode> {
    static MAP: OnceLock<HashMap<&'static str, DependencyNode>> = OnceLock::new();
    MAP.get_or_init(|| {
        let mut m: HashMap<&'static str, DependencyNode> = HashMap::new();
        let mut add = |class: &'static str, tables: &'static [EptTable], project: Option<Projector>| {
            m.insert(class, DependencyNode { tables, project });
        };
        add("fabricNode", &[EptTable::Node], Some(project_fabric_node));
        add("tunnelIf", &[EptTable::Tunnel], Some(project_tunnel));
        add("pcAggrIf", &[EptTable::Pc], Some(project_pc));
        add("pcRsMbrIfs", &[EptTable::Pc], None);
        add("vpcRsVpcConf", &[EptTable::Vpc], Some(project_vpc));
        add("fvCtx", &[EptTable::Vnid], Some(project_ctx_vnid));
        add("fvBD", &[EptTable::Vnid], Some(project_bd_vnid));
        add("fvSvcBD", &[EptTable::Vnid], Some(project_bd_vnid));
        add("l3extExtEncapAllocator", &[EptTable::Vnid], Some(project_ext_vnid));
        add("l3extRsEctx", &[EptTable::Vnid], None);
        add("l3extOut", &[EptTable::Vnid], None);
        add("fvAEPg", &[EptTable::Epg], Some(project_epg));
        add("mgmtInB", &[EptTable::Epg], Some(project_epg));
        add("vnsEPpInfo", &[EptTable::Epg], Some(project_epg));
        add("l3extInstP", &[EptTable::Epg], Some(project_epg));
        add("fvRsBd", &[EptTable::Epg], None);
        add("vnsRsEPpInfoToBD", &[EptTable::Epg], None);
        add("mgmtRsMgmtBD", &[EptTable::Epg], None);
        add("fvSubnet", &[EptTable::Subnet], Some(project_subnet));
        add("fvIpAttr", &[EptTable::Subnet], Some(project_subnet));
        add("vnsRsLIfCtxToBD", &[EptTable::Subnet], None);
        add("vnsLIfCtx", &[EptTable::Subnet], None);
        add("datetimeFormat", &[], None);
        m
    })
}

/// In-memory MO collections for one fabric, write-through to the store.
pub struct MoCache {
    fabric: String,
    classes: Mutex<HashMap<String, HashMap<String, MoRow>>>,
}

impl MoCache {
    pub fn new(fabric: impl Into<String>) -> Self {
        Self {
            fabric: fabric.into(),
            classes: Mutex::new(HashMap::new()),
        }
    }

    /// Fully repopulate one class from a controller class query.
    pub async fn rebuild(
        &self,
        class: &str,
        session: &dyn ControllerSession,
        store: &dyn Store,
    ) -> Result<()> {
        let query = ClassQuery::ordered_by(&format!("{class}.dn"));
        let objects = session.class_query(class, &query).await?;
        let ts = now_ts();
        let mut rows = HashMap::new();
        for obj in &objects {
            match crate::controller::object_attributes(obj) {
                Some((_, attrs)) => {
                    let dn = attrs.get("dn").and_then(Value::as_str).unwrap_or("");
                    if dn.is_empty() {
                        warn!("skipping {class} object without dn");
                        continue;
                    }
                    rows.insert(
                        dn.to_string(),
                        MoRow {
                            dn: dn.to_string(),
                            attrs: attrs.clone(),
                            ts,
                        },
                    );
                }
                None => warn!("invalid {class} object in class query"),
            }
        }
        debug!("rebuilt mo cache {} with {} objects", class, rows.len());
        let flat: Vec<MoRow> = rows.values().cloned().collect();
        store.save_mo(&self.fabric, class, &flat).await?;
        self.classes
            .lock()
            .map_err(|_| Error::Store("mo cache lock poisoned".to_string()))?
            .insert(class.to_string(), rows);
        Ok(())
    }

    /// Snapshot of all cached rows for a class.
    pub fn rows(&self, class: &str) -> Vec<MoRow> {
        let guard = match self.classes.lock() {
            Ok(g) => g,
            Err(_) => return Vec::new(),
        };
        guard
            .get(class)
            .map(|rows| {
                let mut v: Vec<MoRow> = rows.values().cloned().collect();
                v.sort_by(|a, b| a.dn.cmp(&b.dn));
                v
            })
            .unwrap_or_default()
    }

    /// Whether a class is populated in the cache (build phases fall back
    /// to a streamed controller query otherwise).
    pub fn has_class(&self, class: &str) -> bool {
        self.classes
            .lock()
            .map(|g| g.contains_key(class))
            .unwrap_or(false)
    }

    /// Apply one subscription event to the cache and return the derived
    /// tables (with the source dn) that workers must flush.
    pub fn sync_event(
        &self,
        class: &str,
        attrs: &Map<String, Value>,
        ts: f64,
    ) -> Vec<(EptTable, String)> {
        let Some(dn) = attrs.get("dn").and_then(Value::as_str) else {
            warn!("ignoring {class} event without dn");
            return Vec::new();
        };
        let status = attrs.get("status").and_then(Value::as_str).unwrap_or("");
        if let Ok(mut guard) = self.classes.lock() {
            let rows = guard.entry(class.to_string()).or_default();
            if status == "deleted" {
                rows.remove(dn);
            } else {
                match rows.entry(dn.to_string()) {
                    // modify events carry only the changed attributes
                    Entry::Occupied(mut entry) => {
                        let row = entry.get_mut();
                        for (k, v) in attrs {
                            row.attrs.insert(k.clone(), v.clone());
                        }
                        row.ts = ts;
                    }
                    Entry::Vacant(entry) => {
                        entry.insert(MoRow {
                            dn: dn.to_string(),
                            attrs: attrs.clone(),
                            ts,
                        });
                    }
                }
            }
        }
        match dependency_map().get(class) {
            Some(node) => node
                .tables
                .iter()
                .map(|t| (*t, dn.to_string()))
                .collect(),
            None => Vec::new(),
        }
    }
}

/// Parent dn, skipping separators inside bracketed segments
/// (`uni/tn-t1/BD-bd1/subnet-[10.1.1.0/24]` → `uni/tn-t1/BD-bd1`).
pub fn parent_dn(dn: &str) -> Option<&str> {
    let mut depth = 0usize;
    let mut last = None;
    for (i, c) in dn.char_indices() {
        match c {
            '[' => depth += 1,
            ']' => depth = depth.saturating_sub(1),
            '/' if depth == 0 => last = Some(i),
            _ => {}
        }
    }
    last.map(|i| &dn[..i])
}

fn pod_and_node(dn: &str) -> Option<(u32, u32)> {
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"topology/pod-(?P<pod>\d+)/node-(?P<node>\d+)").expect("pod/node regex")
    });
    let caps = re.captures(dn)?;
    Some((caps["pod"].parse().ok()?, caps["node"].parse().ok()?))
}

fn strip_mask(addr: &str) -> &str {
    addr.split('/').next().unwrap_or(addr)
}

fn project_fabric_node(fabric: &str, mo: &MoRow) -> Option<EntityPartial> {
    let (pod_id, node) = pod_and_node(&mo.dn)?;
    let role = match mo.attr("role") {
        "leaf" => NodeRole::Leaf,
        "spine" => NodeRole::Spine,
        "controller" => NodeRole::Controller,
        other => {
            debug!("skipping fabricNode {} with role '{}'", mo.dn, other);
            return None;
        }
    };
    Some(EntityPartial::Node(Node {
        fabric: fabric.to_string(),
        node,
        pod_id,
        addr: mo.attr("address").to_string(),
        name: mo.attr("name").to_string(),
        role,
        state: String::new(),
        version: String::new(),
        peer: None,
        nodes: Vec::new(),
    }))
}

fn project_tunnel(fabric: &str, mo: &MoRow) -> Option<EntityPartial> {
    let (_, node) = pod_and_node(&mo.dn)?;
    Some(EntityPartial::Tunnel(Tunnel {
        fabric: fabric.to_string(),
        node,
        intf: mo.attr("id").to_string(),
        name: mo.dn.clone(),
        src: strip_mask(mo.attr("src")).to_string(),
        dst: mo.attr("dest").to_string(),
        remote: 0,
        status: mo.attr("operSt").to_string(),
        encap: mo.attr("tType").to_string(),
        flags: mo.attr("type").to_string(),
        ts: mo.ts,
    }))
}

fn project_pc(fabric: &str, mo: &MoRow) -> Option<EntityPartial> {
    let (_, node) = pod_and_node(&mo.dn)?;
    Some(EntityPartial::Pc(Pc {
        fabric: fabric.to_string(),
        node,
        intf: mo.attr("id").to_string(),
        name: mo.dn.clone(),
        members: Vec::new(),
        ts: mo.ts,
    }))
}

fn project_vpc(fabric: &str, mo: &MoRow) -> Option<EntityPartial> {
    let (_, node) = pod_and_node(&mo.dn)?;
    let vpc = mo.attr("parentSKey").parse().ok()?;
    Some(EntityPartial::Vpc(Vpc {
        fabric: fabric.to_string(),
        node,
        intf: mo.attr("tSKey").to_string(),
        vpc,
        ts: mo.ts,
    }))
}

fn project_ctx_vnid(fabric: &str, mo: &MoRow) -> Option<EntityPartial> {
    let vnid = mo.attr("scope").parse().ok()?;
    Some(EntityPartial::Vnid(Vnid {
        fabric: fabric.to_string(),
        vnid,
        name: mo.dn.clone(),
        encap: String::new(),
        vrf: 0,
        external: false,
        ts: mo.ts,
    }))
}

fn project_bd_vnid(fabric: &str, mo: &MoRow) -> Option<EntityPartial> {
    let vnid = mo.attr("seg").parse().ok()?;
    Some(EntityPartial::Vnid(Vnid {
        fabric: fabric.to_string(),
        vnid,
        name: mo.dn.clone(),
        encap: String::new(),
        vrf: 0,
        external: false,
        ts: mo.ts,
    }))
}

fn project_ext_vnid(fabric: &str, mo: &MoRow) -> Option<EntityPartial> {
    // extEncap is of the form vxlan-<n>; vrf is resolved by the build
    // phase through the l3out context relation
    let vnid = mo
        .attr("extEncap")
        .strip_prefix("vxlan-")
        .and_then(|v| v.parse().ok())?;
    Some(EntityPartial::Vnid(Vnid {
        fabric: fabric.to_string(),
        vnid,
        name: mo.dn.clone(),
        encap: mo.attr("encap").to_string(),
        vrf: 0,
        external: true,
        ts: mo.ts,
    }))
}

fn project_epg(fabric: &str, mo: &MoRow) -> Option<EntityPartial> {
    Some(EntityPartial::Epg(Epg {
        fabric: fabric.to_string(),
        name: mo.dn.clone(),
        bd: 0,
        ts: mo.ts,
    }))
}

fn project_subnet(fabric: &str, mo: &MoRow) -> Option<EntityPartial> {
    let ip = mo.attr("ip");
    if ip.is_empty() {
        return None;
    }
    Some(EntityPartial::Subnet(Subnet {
        fabric: fabric.to_string(),
        bd: 0,
        ip: ip.to_string(),
        name: mo.dn.clone(),
        ts: mo.ts,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn mo(dn: &str, attrs: Value) -> MoRow {
        let mut map = attrs.as_object().cloned().unwrap_or_default();
        map.insert("dn".to_string(), json!(dn));
        MoRow {
            dn: dn.to_string(),
            attrs: map,
            ts: 10.0,
        }
    }

    #[test]
    fn test_parent_dn_bracket_aware() {
        assert_eq!(
            parent_dn("uni/tn-t1/BD-bd1/subnet-[10.1.1.0/24]"),
            Some("uni/tn-t1/BD-bd1")
        );
        assert_eq!(parent_dn("uni/tn-t1/out-l3/encap-[vxlan-1234]"), Some("uni/tn-t1/out-l3"));
        assert_eq!(parent_dn("uni"), None);
    }

    #[test]
    fn test_project_tunnel_strips_src_mask() {
        let row = mo(
            "topology/pod-1/node-101/sys/tunnel-[tunnel9]",
            json!({"id": "tunnel9", "src": "10.0.88.90/32", "dest": "10.0.88.95",
                   "operSt": "up", "tType": "ivxlan", "type": "physical"}),
        );
        match project_tunnel("fab1", &row).unwrap() {
            EntityPartial::Tunnel(t) => {
                assert_eq!(t.node, 101);
                assert_eq!(t.src, "10.0.88.90");
                assert_eq!(t.dst, "10.0.88.95");
            }
            other => panic!("unexpected partial: {other:?}"),
        }
    }

    #[test]
    fn test_project_external_vnid() {
        let row = mo(
            "uni/tn-t1/out-l3/encap-[vxlan-15826915]",
            json!({"extEncap": "vxlan-15826915", "encap": "vlan-100"}),
        );
        match project_ext_vnid("fab1", &row).unwrap() {
            EntityPartial::Vnid(v) => {
                assert_eq!(v.vnid, 15826915);
                assert!(v.external);
                assert_eq!(v.vrf, 0);
            }
            other => panic!("unexpected partial: {other:?}"),
        }
    }

    #[test]
    fn test_sync_event_updates_cache_and_names_tables() {
        let cache = MoCache::new("fab1");
        let mut attrs = Map::new();
        attrs.insert("dn".to_string(), json!("uni/tn-t1/BD-bd1"));
        attrs.insert("seg".to_string(), json!("15826914"));
        let flushes = cache.sync_event("fvBD", &attrs, 1.0);
        assert_eq!(flushes, vec![(EptTable::Vnid, "uni/tn-t1/BD-bd1".to_string())]);
        assert_eq!(cache.rows("fvBD").len(), 1);

        // modify merges into the existing row
        let mut update = Map::new();
        update.insert("dn".to_string(), json!("uni/tn-t1/BD-bd1"));
        update.insert("status".to_string(), json!("modified"));
        update.insert("seg".to_string(), json!("15826999"));
        cache.sync_event("fvBD", &update, 2.0);
        assert_eq!(cache.rows("fvBD")[0].attr("seg"), "15826999");

        let mut delete = Map::new();
        delete.insert("dn".to_string(), json!("uni/tn-t1/BD-bd1"));
        delete.insert("status".to_string(), json!("deleted"));
        cache.sync_event("fvBD", &delete, 3.0);
        assert!(cache.rows("fvBD").is_empty());
    }
}
