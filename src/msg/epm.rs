//! Parser for endpoint-manager (EPM) subscription events.
//!
//! EPM objects arrive at high volume and carry everything the partition
//! hash needs inside their dn, so the subscriber parses them into fully
//! typed work messages before they ever reach a queue. The parser is
//! constructed only once the overlay vnid is known; endpoints learned in
//! the overlay context have no vxlan segment in their dn.

use std::sync::OnceLock;

use log::warn;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::msg::{Role, WorkMsg, WorkType};

/// EPM classes in their subscription (and analysis) order: mac-to-ip
/// links first so local ip endpoints already have rewrite info when they
/// are analyzed.
pub const EPM_CLASSES: [&str; 3] = ["epmRsMacEpToIpEpAtt", "epmIpEp", "epmMacEp"];

/// One parsed EPM event, with the routing key fields lifted out of the dn.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEpmEvent {
    pub node: u32,
    pub vnid: u32,
    pub addr: String,
    pub work: WorkMsg,
}

pub struct EpmEventParser {
    fabric: String,
    overlay_vnid: u32,
}

impl EpmEventParser {
    pub fn new(fabric: impl Into<String>, overlay_vnid: u32) -> Self {
        Self {
            fabric: fabric.into(),
            overlay_vnid,
        }
    }

    /// Parse one EPM object into a typed work message. Returns `None` on
    /// schema violations, which the caller logs and skips.
    pub fn parse(&self, classname: &str, attr: &Map<String, Value>, ts: f64) -> Option<ParsedEpmEvent> {
        let dn = attr.get("dn").and_then(Value::as_str)?;
        let node = capture_u32(node_re(), dn)?;
        let (work_type, vnid, addr) = match classname {
            "epmMacEp" => {
                let bd = capture_u32(bd_re(), dn)?;
                let mac = capture(mac_re(), dn)?;
                (WorkType::EpmMacEvent, bd, mac)
            }
            "epmIpEp" => {
                let ctx = self.ctx_vnid(dn)?;
                let ip = capture(ip_re(), dn)?;
                (WorkType::EpmIpEvent, ctx, ip)
            }
            "epmRsMacEpToIpEpAtt" => {
                // the target ip and its vrf live inside the relation
                // bracket, after the source mac portion of the dn
                let target = dn.split("rsmacEpToIpEpAtt-").nth(1)?;
                let ctx = self.ctx_vnid(target)?;
                let ip = capture(ip_re(), target)?;
                (WorkType::EpmRsIpEvent, ctx, ip)
            }
            other => {
                warn!("unexpected epm classname: {other}");
                return None;
            }
        };

        let mut data = attr.clone();
        data.insert("node".to_string(), json!(node));
        let mut work = WorkMsg::new(addr.clone(), Some(Role::Worker), work_type);
        work.fabric = self.fabric.clone();
        work.vnid = vnid;
        work.data = Value::Object(data);
        work.ts = ts;
        Some(ParsedEpmEvent {
            node,
            vnid,
            addr,
            work,
        })
    }

    /// Synthesize a delete event for an endpoint absent from the live
    /// snapshot.
    pub fn delete_event(
        &self,
        classname: &str,
        node: u32,
        vnid: u32,
        addr: &str,
        ts: f64,
    ) -> Option<ParsedEpmEvent> {
        let work_type = match classname {
            "epmMacEp" => WorkType::EpmMacEvent,
            "epmIpEp" => WorkType::EpmIpEvent,
            "epmRsMacEpToIpEpAtt" => WorkType::EpmRsIpEvent,
            other => {
                warn!("unexpected epm delete classname: {other}");
                return None;
            }
        };
        let mut work = WorkMsg::new(addr, Some(Role::Worker), work_type);
        work.fabric = self.fabric.clone();
        work.vnid = vnid;
        work.data = json!({"node": node, "status": "deleted"});
        work.ts = ts;
        Some(ParsedEpmEvent {
            node,
            vnid,
            addr: addr.to_string(),
            work,
        })
    }

    /// Vrf vnid from a dn fragment: an explicit vxlan segment, or the
    /// overlay vnid for endpoints under `inst-overlay-1`.
    fn ctx_vnid(&self, dn: &str) -> Option<u32> {
        if let Some(vnid) = capture_u32(ctx_re(), dn) {
            return Some(vnid);
        }
        if dn.contains("inst-overlay-1") {
            return Some(self.overlay_vnid);
        }
        None
    }
}

fn node_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"topology/pod-\d+/node-(?P<value>\d+)/sys").expect("node regex"))
}

fn ctx_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"ctx-\[vxlan-(?P<value>\d+)\]").expect("ctx regex"))
}

fn bd_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"bd-\[vxlan-(?P<value>\d+)\]").expect("bd regex"))
}

fn mac_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"db-ep/mac-(?P<value>[0-9A-Fa-f:]+)").expect("mac regex"))
}

fn ip_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"db-ep/ip-\[(?P<value>[^\]]+)\]").expect("ip regex"))
}

fn capture(re: &Regex, haystack: &str) -> Option<String> {
    re.captures(haystack).map(|c| c["value"].to_string())
}

fn capture_u32(re: &Regex, haystack: &str) -> Option<u32> {
    capture(re, haystack).and_then(|v| v.parse().ok())
}
