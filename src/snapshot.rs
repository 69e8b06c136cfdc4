//! Bootstrap build phases.
//!
//! Each phase fully repopulates one derived table from controller state.
//! A phase failure aborts the bootstrap; the FSM surfaces it as a
//! `failed` fabric event and terminates. Tables are flushed immediately
//! before their bulk insert to minimize the window where readers see an
//! empty table.

use std::collections::{HashMap, HashSet};

use futures_util::StreamExt;
use log::{debug, warn};
use serde_json::Value;

use crate::controller::{
    object_attributes, object_children, ClassQuery, ControllerSession, EventStream,
    SubscriptionCtrl,
};
use crate::dispatch::Dispatcher;
use crate::error::{Error, Result};
use crate::mo::{dependency_map, parent_dn, EntityPartial, MoCache, ORDERED_MO_CLASSES};
use crate::model::{
    vpc_domain_id, Epg, HistoryFilter, HistoryProjection, Node, NodeRole, Subnet, Vnid, VpcMember,
};
use crate::msg::epm::{EpmEventParser, EPM_CLASSES};
use crate::msg::{now_ts, WorkMsg};
use crate::store::{MoRow, Store};

/// Drives the seven snapshot phases for one fabric.
pub struct SnapshotBuilder<'a> {
    fabric: &'a str,
    session: &'a dyn ControllerSession,
    store: &'a dyn Store,
    cache: &'a MoCache,
}

impl<'a> SnapshotBuilder<'a> {
    pub fn new(
        fabric: &'a str,
        session: &'a dyn ControllerSession,
        store: &'a dyn Store,
        cache: &'a MoCache,
    ) -> Self {
        Self {
            fabric,
            session,
            store,
            cache,
        }
    }

    /// Phase 1: repopulate the MO cache for every slow class, in
    /// dependency order.
    pub async fn build_mo(&self) -> Result<()> {
        for class in ORDERED_MO_CLASSES {
            self.cache.rebuild(class, self.session, self.store).await?;
        }
        Ok(())
    }

    /// Phase 2: node table, including vpc pseudo-nodes.
    pub async fn build_node_db(&self) -> Result<()> {
        debug!("initializing node db");
        let mut all_nodes: HashMap<u32, Node> = HashMap::new();
        for partial in self.project_class("fabricNode").await? {
            if let EntityPartial::Node(n) = partial {
                all_nodes.insert(n.node, n);
            }
        }
        if all_nodes.is_empty() {
            return Err(Error::BuildPhase("no fabric nodes discovered".to_string()));
        }

        // overlay active TEP/state, then firmware version
        let top_system = self
            .session
            .class_query("topSystem", &ClassQuery::default())
            .await?;
        for obj in &top_system {
            let Some((_, attrs)) = object_attributes(obj) else {
                continue;
            };
            let id = attrs
                .get("id")
                .and_then(Value::as_str)
                .and_then(|v| v.parse::<u32>().ok());
            let addr = attrs.get("address").and_then(Value::as_str);
            let state = attrs.get("state").and_then(Value::as_str);
            match (id, addr, state) {
                (Some(id), Some(addr), Some(state)) => match all_nodes.get_mut(&id) {
                    Some(node) => {
                        node.addr = addr.to_string();
                        node.state = state.to_string();
                    }
                    None => warn!("ignoring unknown topSystem node id '{id}'"),
                },
                _ => warn!("invalid topSystem object (missing id or address)"),
            }
        }
        let firmware = self
            .session
            .class_query("firmwareRunning", &ClassQuery::default())
            .await?;
        for obj in &firmware {
            let Some((_, attrs)) = object_attributes(obj) else {
                continue;
            };
            let dn = attrs.get("dn").and_then(Value::as_str).unwrap_or("");
            let Some(id) = node_id_from_dn(dn) else {
                warn!("failed to parse node id from firmwareRunning dn {dn}");
                continue;
            };
            match all_nodes.get_mut(&id) {
                Some(node) => node.version = attrs
                    .get("peVer")
                    .and_then(Value::as_str)
                    .unwrap_or("")
                    .to_string(),
                None => warn!("ignoring unknown firmwareRunning node id {dn}"),
            }
        }

        self.build_vpc_nodes(&mut all_nodes).await?;

        let mut rows: Vec<Node> = all_nodes.into_values().collect();
        rows.sort_by_key(|n| n.node);
        self.store.flush_nodes(self.fabric).await?;
        self.store.save_nodes(&rows).await?;
        Ok(())
    }

    /// Pseudo-node per vpc protection group. Explicit groups win; auto
    /// groups are only consulted when no explicit group exists.
    async fn build_vpc_nodes(&self, all_nodes: &mut HashMap<u32, Node>) -> Result<()> {
        let mut vpc_type = "fabricExplicitGEp";
        let mut data = self
            .session
            .class_query(vpc_type, &ClassQuery::with_subtree("fabricNodePEp"))
            .await?;
        if data.is_empty() {
            debug!("no vpcs found for fabricExplicitGEp, checking fabricAutoGEp");
            vpc_type = "fabricAutoGEp";
            data = self
                .session
                .class_query(vpc_type, &ClassQuery::with_subtree("fabricNodePEp"))
                .await?;
            if data.is_empty() {
                debug!("no vpc configuration found");
            }
        }

        for obj in &data {
            let Some((_, attrs)) = object_attributes(obj) else {
                warn!("invalid {vpc_type} object");
                continue;
            };
            let (Some(virtual_ip), Some(name)) = (
                attrs.get("virtualIp").and_then(Value::as_str),
                attrs.get("name").and_then(Value::as_str),
            ) else {
                warn!("invalid {vpc_type} object (missing virtualIp or name)");
                continue;
            };
            let mut member_ids = Vec::new();
            for child in object_children(obj, "fabricNodePEp") {
                let Some((_, cattrs)) = object_attributes(child) else {
                    warn!("invalid fabricNodePEp object");
                    continue;
                };
                let id = cattrs
                    .get("id")
                    .and_then(Value::as_str)
                    .and_then(|v| v.parse::<u32>().ok());
                match id {
                    Some(id) if all_nodes.contains_key(&id) => member_ids.push(id),
                    Some(id) => warn!("unknown node id {id} in {vpc_type}"),
                    None => warn!("invalid fabricNodePEp object"),
                }
            }
            if member_ids.len() != 2 {
                warn!("expected 2 fabricNodePEp child objects for {name}");
                continue;
            }
            let (a, b) = (member_ids[0], member_ids[1]);
            let vpc_id = vpc_domain_id(a, b);
            let members: Vec<VpcMember> = [a, b]
                .iter()
                .map(|id| VpcMember {
                    node: *id,
                    addr: all_nodes[id].addr.clone(),
                })
                .collect();
            let pod_id = all_nodes[&a].pod_id;
            if let Some(n) = all_nodes.get_mut(&a) {
                n.peer = Some(b);
            }
            if let Some(n) = all_nodes.get_mut(&b) {
                n.peer = Some(a);
            }
            all_nodes.insert(
                vpc_id,
                Node {
                    fabric: self.fabric.to_string(),
                    node: vpc_id,
                    pod_id,
                    addr: strip_mask(virtual_ip).to_string(),
                    name: name.to_string(),
                    role: NodeRole::Vpc,
                    state: "in-service".to_string(),
                    version: String::new(),
                    peer: None,
                    nodes: members,
                },
            );
        }
        Ok(())
    }

    /// Phase 3a: port-channel and vpc interface tables.
    pub async fn build_vpc_db(&self) -> Result<()> {
        debug!("initializing pc/vpc db");
        let mut vpcs = Vec::new();
        for partial in self.project_class("vpcRsVpcConf").await? {
            if let EntityPartial::Vpc(v) = partial {
                vpcs.push(v);
            }
        }
        self.store.flush_vpcs(self.fabric).await?;
        self.store.save_vpcs(&vpcs).await?;

        let mut pcs = Vec::new();
        for partial in self.project_class("pcAggrIf").await? {
            if let EntityPartial::Pc(p) = partial {
                pcs.push(p);
            }
        }
        // member interfaces keyed by the aggregate's dn
        let mut members: HashMap<String, Vec<String>> = HashMap::new();
        for mo in self.cache.rows("pcRsMbrIfs") {
            let Some(parent) = parent_dn(&mo.dn) else {
                continue;
            };
            members
                .entry(parent.to_string())
                .or_default()
                .push(mo.attr("tSKey").to_string());
        }
        for pc in pcs.iter_mut() {
            if let Some(m) = members.get(&pc.name) {
                pc.members = m.clone();
            }
        }
        self.store.flush_pcs(self.fabric).await?;
        self.store.save_pcs(&pcs).await?;
        Ok(())
    }

    /// Phase 3b: tunnel table with remote-node resolution.
    pub async fn build_tunnel_db(&self) -> Result<()> {
        debug!("initializing tunnel db");
        let mut tunnels = Vec::new();
        for partial in self.project_class("tunnelIf").await? {
            if let EntityPartial::Tunnel(t) = partial {
                tunnels.push(t);
            }
        }
        let by_addr: HashMap<String, Node> = self
            .store
            .nodes(self.fabric)
            .await?
            .into_iter()
            .map(|n| (n.addr.clone(), n))
            .collect();
        for t in tunnels.iter_mut() {
            match by_addr.get(&t.dst) {
                Some(node) => t.remote = node.node,
                None if t.external() => {}
                None => {
                    // unresolved from a leaf is worth a warning; spines
                    // and proxy/dci/golf tunnels legitimately miss
                    if by_addr
                        .get(&t.src)
                        .is_some_and(|n| n.role == NodeRole::Leaf)
                    {
                        warn!("failed to map tunnel for leaf to remote node: {}", t.name);
                    }
                }
            }
        }
        self.store.flush_tunnels(self.fabric).await?;
        self.store.save_tunnels(&tunnels).await?;
        Ok(())
    }

    /// Phase 4: vnid table from vrfs, BDs, service BDs, and external
    /// encaps.
    pub async fn build_vnid_db(&self) -> Result<()> {
        debug!("initializing vnid db");
        let mut rows: Vec<Vnid> = Vec::new();
        for class in ["fvCtx", "fvBD", "fvSvcBD"] {
            for partial in self.project_class(class).await? {
                if let EntityPartial::Vnid(v) = partial {
                    rows.push(v);
                }
            }
        }

        // external encaps resolve their vrf through the l3out context
        // relation
        let vnid_by_name: HashMap<String, u32> =
            rows.iter().map(|v| (v.name.clone(), v.vnid)).collect();
        let mut l3ctx: HashMap<String, u32> = HashMap::new();
        for mo in self.cache.rows("l3extRsEctx") {
            let t_dn = mo.attr("tDn");
            match vnid_by_name.get(t_dn) {
                Some(vnid) => {
                    if let Some(parent) = parent_dn(&mo.dn) {
                        l3ctx.insert(parent.to_string(), *vnid);
                    }
                }
                None => warn!("failed to map l3extRsEctx tDn({t_dn}) to vrf vnid"),
            }
        }
        for partial in self.project_class("l3extExtEncapAllocator").await? {
            if let EntityPartial::Vnid(mut v) = partial {
                match parent_dn(&v.name).and_then(|p| l3ctx.get(p)) {
                    Some(vrf) => v.vrf = *vrf,
                    None => warn!("failed to map l3extOut to vrf vnid for {}", v.name),
                }
                rows.push(v);
            }
        }

        self.store.flush_vnids(self.fabric).await?;
        self.store.save_vnids(&rows).await?;
        Ok(())
    }

    /// Phase 5: epg table with BD resolution through the link relations.
    pub async fn build_epg_db(&self) -> Result<()> {
        debug!("initializing epg db");
        let mut epgs: HashMap<String, Epg> = HashMap::new();
        for class in ["fvAEPg", "mgmtInB", "vnsEPpInfo", "l3extInstP"] {
            for partial in self.project_class(class).await? {
                if let EntityPartial::Epg(e) = partial {
                    epgs.insert(e.name.clone(), e);
                }
            }
        }

        debug!("mapping epg to bd vnid");
        let vnid_by_name: HashMap<String, u32> = self
            .store
            .vnids(self.fabric)
            .await?
            .into_iter()
            .map(|v| (v.name, v.vnid))
            .collect();
        let mut linked: HashSet<String> = HashSet::new();
        for class in ["fvRsBd", "vnsRsEPpInfoToBD", "mgmtRsMgmtBD"] {
            debug!("map epg bd vnid from {class}");
            for mo in self.cache.rows(class) {
                let Some(epg_name) = parent_dn(&mo.dn) else {
                    continue;
                };
                let bd_name = mo.attr("tDn");
                let Some(epg) = epgs.get_mut(epg_name) else {
                    warn!("cannot map bd to unknown epg '{epg_name}' from '{class}'");
                    continue;
                };
                let Some(bd_vnid) = vnid_by_name.get(bd_name) else {
                    warn!("cannot map epg {epg_name} to unknown bd '{bd_name}'");
                    continue;
                };
                if !linked.insert(epg_name.to_string()) {
                    warn!("skipping duplicate dn: {epg_name}");
                    continue;
                }
                epg.bd = *bd_vnid;
            }
        }

        let mut rows: Vec<Epg> = epgs.into_values().collect();
        rows.sort_by(|a, b| a.name.cmp(&b.name));
        self.store.flush_epgs(self.fabric).await?;
        self.store.save_epgs(&rows).await?;
        Ok(())
    }

    /// Phase 6: subnet table. Parents resolve to a BD directly or via
    /// epg→BD (including the service logical-interface contexts).
    pub async fn build_subnet_db(&self) -> Result<()> {
        debug!("initializing subnet db");
        let vnid_by_name: HashMap<String, u32> = self
            .store
            .vnids(self.fabric)
            .await?
            .into_iter()
            .map(|v| (v.name, v.vnid))
            .collect();
        let mut epg_bd: HashMap<String, u32> = self
            .store
            .epgs(self.fabric)
            .await?
            .into_iter()
            .filter(|e| e.bd != 0)
            .map(|e| (e.name, e.bd))
            .collect();
        for mo in self.cache.rows("vnsRsLIfCtxToBD") {
            let t_dn = mo.attr("tDn");
            match vnid_by_name.get(t_dn) {
                Some(vnid) => {
                    if let Some(parent) = parent_dn(&mo.dn) {
                        epg_bd.insert(parent.to_string(), *vnid);
                    }
                }
                None => warn!("vnsRsLIfCtxToBD tDn {t_dn} not in vnids"),
            }
        }

        let mut rows: Vec<Subnet> = Vec::new();
        for class in ["fvSubnet", "fvIpAttr"] {
            for partial in self.project_class(class).await? {
                if let EntityPartial::Subnet(mut s) = partial {
                    let parent = parent_dn(&s.name).unwrap_or("");
                    let bd = vnid_by_name
                        .get(parent)
                        .or_else(|| epg_bd.get(parent))
                        .copied();
                    match bd {
                        Some(bd) => {
                            s.bd = bd;
                            rows.push(s);
                        }
                        None => warn!("failed to map subnet '{}' ({parent}) to a bd", s.ip),
                    }
                }
            }
        }

        debug!("flushing subnet entries for fabric {}", self.fabric);
        self.store.flush_subnets(self.fabric).await?;
        self.store.save_subnets(&rows).await?;
        Ok(())
    }

    /// Phase 7: stream current endpoint state as CREATE work items, then
    /// synthesize DELETEs for history entries the fabric no longer
    /// reports. Live EPM interests are added right after each class query
    /// starts so events during the (potentially long) query are captured
    /// (paused when the operator queues init events, dropped otherwise).
    pub async fn build_endpoint_db(
        &self,
        subs: &dyn SubscriptionCtrl,
        dispatcher: &Dispatcher,
        parser: &EpmEventParser,
        queue_init_epm_events: bool,
        batch: usize,
    ) -> Result<()> {
        debug!("initialize endpoint db");
        let start = now_ts();
        let mut endpoints: PresentSet = HashMap::new();
        let mut total_create = 0usize;
        for class in EPM_CLASSES {
            let order_by = if class == "epmRsMacEpToIpEpAtt" {
                format!("{class}.dn")
            } else {
                format!("{class}.addr")
            };
            let mut stream = self
                .session
                .stream_class(class, &ClassQuery::ordered_by(&order_by))
                .await?;
            let ts = now_ts();
            subs.add_interest(class, EventStream::Epm, queue_init_epm_events)
                .await?;
            let mut create_count = 0usize;
            let mut create_msgs: Vec<WorkMsg> = Vec::new();
            while let Some(obj) = stream.next().await {
                let obj = obj?;
                let Some((_, attrs)) = object_attributes(&obj) else {
                    warn!("invalid {class} object");
                    continue;
                };
                let Some(ev) = parser.parse(class, attrs, ts) else {
                    warn!("invalid {class} object");
                    continue;
                };
                create_count += 1;
                endpoints
                    .entry(ev.node)
                    .or_default()
                    .entry(ev.vnid)
                    .or_default()
                    .insert(ev.addr);
                create_msgs.push(ev.work);
                // dispatch as we go, full result sets don't fit in memory
                // on scale fabrics
                if create_msgs.len() >= batch {
                    debug!("build_endpoint_db sending {} create for {class}", create_msgs.len());
                    dispatcher.send(std::mem::take(&mut create_msgs), false).await;
                }
            }
            if !create_msgs.is_empty() {
                debug!("build_endpoint_db sending {} create for {class}", create_msgs.len());
                dispatcher.send(create_msgs, false).await;
            }
            debug!("build_endpoint_db total {create_count} create for {class}");
            total_create += create_count;
        }

        // delete jobs for history entries absent from the live snapshot
        let mut delete_count = 0usize;
        let mut delete_msgs: Vec<WorkMsg> = Vec::new();
        let filter = HistoryFilter {
            fabric: self.fabric.to_string(),
            addr: None,
            vnid: None,
        };
        let ts = now_ts();
        let mut history = self.store.endpoint_history(&filter).await?;
        while let Some(entry) = history.next().await {
            let entry = entry?;
            if present(&endpoints, &entry) {
                continue;
            }
            for msg in delete_events(parser, &entry, ts) {
                delete_count += 1;
                delete_msgs.push(msg);
                if delete_msgs.len() >= batch {
                    debug!("build_endpoint_db sending {} delete jobs", delete_msgs.len());
                    dispatcher.send(std::mem::take(&mut delete_msgs), false).await;
                }
            }
        }
        if !delete_msgs.is_empty() {
            debug!("build_endpoint_db sending {} delete jobs", delete_msgs.len());
            dispatcher.send(delete_msgs, false).await;
        }
        debug!("build_endpoint_db total {delete_count} delete jobs");
        debug!("build_endpoint_db total time: {:.3}", now_ts() - start);

        self.store
            .add_fabric_event(
                self.fabric,
                "initializing",
                &format!("analyzing {} endpoint records", total_create + delete_count),
            )
            .await?;
        Ok(())
    }

    /// Project every object of `class` through its registry projector,
    /// reading the MO cache when the class is cached and falling back to
    /// a streamed class query otherwise.
    async fn project_class(&self, class: &str) -> Result<Vec<EntityPartial>> {
        let Some(node) = dependency_map().get(class) else {
            return Err(Error::BuildPhase(format!(
                "no projector registered for {class}"
            )));
        };
        let Some(project) = node.project else {
            return Err(Error::BuildPhase(format!(
                "class {class} has no direct projection"
            )));
        };
        let rows = if self.cache.has_class(class) {
            self.cache.rows(class)
        } else {
            let mut rows = Vec::new();
            let ts = now_ts();
            let mut stream = self
                .session
                .stream_class(class, &ClassQuery::ordered_by(&format!("{class}.dn")))
                .await?;
            while let Some(obj) = stream.next().await {
                let obj = obj?;
                match object_attributes(&obj) {
                    Some((_, attrs)) => {
                        let dn = attrs.get("dn").and_then(Value::as_str).unwrap_or("");
                        rows.push(MoRow {
                            dn: dn.to_string(),
                            attrs: attrs.clone(),
                            ts,
                        });
                    }
                    None => warn!("invalid {class} object in class query"),
                }
            }
            rows
        };
        let mut partials = Vec::new();
        for row in &rows {
            match project(self.fabric, row) {
                Some(p) => partials.push(p),
                None => debug!("{class} object not projected (no matching attributes): {}", row.dn),
            }
        }
        Ok(partials)
    }
}

type PresentSet = HashMap<u32, HashMap<u32, HashSet<String>>>;

fn present(endpoints: &PresentSet, entry: &HistoryProjection) -> bool {
    endpoints
        .get(&entry.node)
        .and_then(|vnids| vnids.get(&entry.vnid))
        .is_some_and(|addrs| addrs.contains(&entry.addr))
}

/// Delete work items for one history entry: a mac endpoint takes one
/// delete, an ip endpoint takes one for the mac-to-ip link and one for
/// the ip itself.
pub(crate) fn delete_events(
    parser: &EpmEventParser,
    entry: &HistoryProjection,
    ts: f64,
) -> Vec<WorkMsg> {
    use crate::model::AddrType;
    let classes: &[&str] = match entry.addr_type {
        AddrType::Mac => &["epmMacEp"],
        AddrType::Ip => &["epmRsMacEpToIpEpAtt", "epmIpEp"],
    };
    classes
        .iter()
        .filter_map(|c| parser.delete_event(c, entry.node, entry.vnid, &entry.addr, ts))
        .map(|ev| ev.work)
        .collect()
}

fn node_id_from_dn(dn: &str) -> Option<u32> {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"topology/pod-\d+/node-(?P<value>\d+)").expect("node id regex")
    });
    re.captures(dn)?["value"].parse().ok()
}

fn strip_mask(addr: &str) -> &str {
    addr.split('/').next().unwrap_or(addr)
}
