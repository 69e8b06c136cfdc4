//! Event classification and handling.
//!
//! The subscription layer delivers events one class at a time. Control
//! classes run their named handlers in-line (and may restart the
//! subscriber); slow MO classes update the local cache and queue a
//! STD_MO work item for the watcher; EPM classes parse into typed work
//! items. Both queues drain through the background batcher, which hands
//! them to the dispatcher in bulk.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use log::{debug, warn};
use serde_json::{json, Map, Value};

use crate::controller::{object_attributes, DeliveredEvent, EventStream, RawEvent};
use crate::mo::ORDERED_MO_CLASSES;
use crate::msg::{Role, WorkMsg, WorkType};
use crate::subscriber::Subscriber;

impl Subscriber {
    pub(crate) async fn route_event(self: &Arc<Self>, delivered: DeliveredEvent) {
        match delivered.stream {
            EventStream::Control => self.handle_event(&delivered.event).await,
            EventStream::StdMo => self.handle_std_mo_event(&delivered.event).await,
            EventStream::Epm => self.handle_epm_event(&delivered.event).await,
        }
    }

    /// Control MO events: fabric protection policy, vpc protection
    /// groups, and fabric nodes.
    async fn handle_event(self: &Arc<Self>, event: &RawEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("ignoring event (subscriber stopped and waiting for reset)");
            return;
        }
        if self.initializing.load(Ordering::SeqCst) {
            // when queue_init_events is set the subscription layer is
            // paused and buffering for us, so anything that lands here
            // during init is an intentional drop
            debug!("ignoring event (in initializing state)");
            return;
        }
        for (class, attrs) in parse_event(event) {
            match class.as_str() {
                "fabricProtPol" => self.handle_fabric_prot_pol(&attrs).await,
                "fabricAutoGEp" | "fabricExplicitGEp" => {
                    self.handle_fabric_group_ep(&class, event.ts).await
                }
                "fabricNode" => self.handle_fabric_node(&attrs, event.ts).await,
                other => warn!("no event handler defined for classname: {other}"),
            }
        }
    }

    /// Slow MO events: sync the local cache, flush derived worker caches,
    /// and queue the event for the watcher.
    async fn handle_std_mo_event(self: &Arc<Self>, event: &RawEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("ignoring event (subscriber stopped and waiting for reset)");
            return;
        }
        if self.initializing.load(Ordering::SeqCst) {
            debug!("ignoring event (in initializing state)");
            return;
        }
        for (class, attrs) in parse_event(event) {
            if !ORDERED_MO_CLASSES.contains(&class.as_str())
                || !attrs.contains_key("dn")
                || !attrs.contains_key("status")
            {
                warn!("event received for unknown classname: {class}");
                continue;
            }
            for (table, name) in self.cache.sync_event(&class, &attrs, event.ts) {
                self.send_flush(table, Some(name.as_str())).await;
            }
            // a single watcher consumes these today, so the hash key is
            // static
            let mut data = Map::new();
            data.insert(class, Value::Object(attrs));
            let mut msg =
                WorkMsg::new("", Some(Role::Watcher), WorkType::StdMo).with_data(Value::Object(data));
            msg.ts = event.ts;
            if self.std_mo_tx.send(msg).is_err() {
                warn!("std mo event queue closed");
            }
        }
    }

    /// EPM events: full parse up front so the hash fields are ready for
    /// dispatch, then queue for the batcher.
    async fn handle_epm_event(self: &Arc<Self>, event: &RawEvent) {
        if self.stopped.load(Ordering::SeqCst) {
            debug!("ignoring event (subscriber stopped and waiting for reset)");
            return;
        }
        if self.epm_initializing.load(Ordering::SeqCst) {
            debug!("ignoring event (in epm_initializing state)");
            return;
        }
        let Some(parser) = self.epm_parser.get() else {
            debug!("ignoring epm event before parser is ready");
            return;
        };
        for (class, attrs) in parse_event(event) {
            match parser.parse(&class, &attrs, event.ts) {
                Some(ev) => {
                    if self.epm_tx.send(ev.work).is_err() {
                        warn!("epm event queue closed");
                    }
                }
                None => warn!("failed to parse {class} event"),
            }
        }
    }

    /// A vpc pair-type change invalidates every pseudo-node id.
    async fn handle_fabric_prot_pol(self: &Arc<Self>, attrs: &Map<String, Value>) {
        let Some(pair_t) = attrs.get("pairT").and_then(Value::as_str) else {
            debug!("no change in fabricProtPol");
            return;
        };
        debug!("handle fabricProtPol event: {pair_t}");
        let current = self.settings().vpc_pair_type;
        if pair_t != current {
            let msg = format!("fabricProtPol changed from {current} to {pair_t}");
            warn!("{msg}");
            self.hard_restart(&msg).await;
        } else {
            debug!("no change in fabricProtPol");
        }
    }

    /// Any vpc protection-group update re-derives the pseudo-nodes.
    async fn handle_fabric_group_ep(self: &Arc<Self>, class: &str, ts: f64) {
        debug!("handle {class} event");
        self.soft_restart(Some(ts), &format!("({class}) vpc domain update"))
            .await;
    }

    /// Node lifecycle. A leaf turning active means an unknown window of
    /// missed endpoint events, so the whole fabric restarts; a leaf
    /// leaving active becomes a watch job; name changes update in place.
    async fn handle_fabric_node(self: &Arc<Self>, attrs: &Map<String, Value>, ts: f64) {
        let Some(dn) = attrs.get("dn").and_then(Value::as_str) else {
            debug!("ignoring fabricNode event (dn not present in attributes)");
            return;
        };
        debug!("handle fabricNode event: {dn}");
        let Some((pod, node_id)) = pod_and_node(dn) else {
            warn!("failed to extract node id from fabricNode dn: {dn}");
            return;
        };
        let status = attrs.get("fabricSt").and_then(Value::as_str);
        let name = attrs.get("name").and_then(Value::as_str);

        let node = match self.store.node(self.fabric(), node_id).await {
            Ok(node) => node,
            Err(e) => {
                warn!("failed to load node {node_id}: {e}");
                return;
            }
        };

        if let (Some(name), Some(node)) = (name, node.as_ref()) {
            if node.name != name {
                debug!("node {node_id} name updated from {} to {name}", node.name);
                let mut updated = node.clone();
                updated.name = name.to_string();
                if let Err(e) = self.store.save_nodes(&[updated]).await {
                    warn!("failed to update node name: {e}");
                }
            }
        }

        let Some(status) = status else {
            return;
        };
        match node {
            Some(node) => {
                if node.role != crate::model::NodeRole::Leaf {
                    debug!("ignoring fabricNode event for '{}'", node.role);
                } else if status == "active" {
                    self.hard_restart(&format!("leaf '{}' became active", node.node))
                        .await;
                } else {
                    debug!("node {} '{status}', sending watch_node event", node.node);
                    let mut msg = WorkMsg::new("1", Some(Role::Watcher), WorkType::WatchNode)
                        .with_data(json!({"node": node.node, "status": status}));
                    msg.ts = ts;
                    self.dispatcher.send(vec![msg], false).await;
                }
            }
            None => {
                if status != "active" {
                    debug!("ignoring '{status}' event for unknown node: {node_id}");
                    return;
                }
                // double check the new active node is a leaf before the
                // expensive restart
                let new_dn = format!("topology/pod-{pod}/node-{node_id}");
                match self.session.get_attributes(&new_dn).await {
                    Ok(Some(new_attrs))
                        if new_attrs.get("role").and_then(Value::as_str) == Some("leaf") =>
                    {
                        self.hard_restart(&format!("new leaf '{node_id}' became active"))
                            .await;
                    }
                    Ok(_) => debug!("ignoring active event for non-leaf"),
                    Err(e) => warn!("failed to query new node {node_id}: {e}"),
                }
            }
        }
    }
}

/// Unpack one subscription delivery into `(classname, attributes)`
/// pairs, skipping malformed objects with a warning.
fn parse_event(event: &RawEvent) -> Vec<(String, Map<String, Value>)> {
    let mut out = Vec::new();
    for obj in &event.imdata {
        match object_attributes(obj) {
            Some((class, attrs)) => out.push((class.to_string(), attrs.clone())),
            None => warn!("invalid event object"),
        }
    }
    out
}

fn pod_and_node(dn: &str) -> Option<(u32, u32)> {
    use std::sync::OnceLock;
    static RE: OnceLock<regex::Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        regex::Regex::new(r"topology/pod-(?P<pod>\d+)/node-(?P<node>\d+)").expect("pod/node regex")
    });
    let caps = re.captures(dn)?;
    Some((caps["pod"].parse().ok()?, caps["node"].parse().ok()?))
}
