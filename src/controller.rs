//! Controller seams: the REST/websocket session and the subscription
//! layer.
//!
//! Both are external collaborators. The session exposes DN and class
//! queries over objects in imdata form (`{class: {attributes: {..},
//! children: [..]}}`); the subscription layer maintains long-lived class
//! subscriptions and delivers their events into the channel the
//! subscriber was constructed with. A paused interest buffers events
//! (bounded only by memory) until resumed; whether the subscriber
//! pauses during bootstrap or lets events drop is its own setting, not a
//! property of this layer.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use regex::Regex;
use serde_json::{Map, Value};

use crate::error::{Error, Result};
use crate::version::{NodeVersion, VersionReport};

/// Options for a class query; mirrors the controller's query parameters.
#[derive(Debug, Clone, Default)]
pub struct ClassQuery {
    pub order_by: Option<String>,
    pub rsp_subtree: Option<String>,
    pub rsp_subtree_class: Option<String>,
    pub query_target: Option<String>,
    pub target_subtree_class: Option<String>,
    pub query_target_filter: Option<String>,
}

impl ClassQuery {
    pub fn ordered_by(attr: &str) -> Self {
        Self {
            order_by: Some(attr.to_string()),
            ..Self::default()
        }
    }

    pub fn with_subtree(class: &str) -> Self {
        Self {
            rsp_subtree: Some("full".to_string()),
            rsp_subtree_class: Some(class.to_string()),
            ..Self::default()
        }
    }
}

/// Access level granted to the session's login.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionRole {
    /// Login has visibility into security domain `all`.
    pub domain_all: bool,
    /// Login carries the admin role.
    pub role_admin: bool,
}

#[async_trait]
pub trait ControllerSession: Send + Sync {
    fn hostname(&self) -> String;

    /// Role/domain information for the authenticated user.
    async fn session_role(&self) -> Result<SessionRole>;

    /// Attributes of a single object by dn; `None` when it doesn't exist.
    async fn get_attributes(&self, dn: &str) -> Result<Option<Map<String, Value>>>;

    /// Buffered class query returning imdata objects.
    async fn class_query(&self, class: &str, query: &ClassQuery) -> Result<Vec<Value>>;

    /// Streamed class query for result sets too large to buffer.
    async fn stream_class(
        &self,
        class: &str,
        query: &ClassQuery,
    ) -> Result<BoxStream<'static, Result<Value>>>;

    /// Subscription refresh interval currently configured on the session.
    fn subscription_refresh(&self) -> Duration;
    /// Clamp the refresh interval (pre-4.x nodes cannot go longer).
    fn set_subscription_refresh(&self, interval: Duration);

    async fn close(&self);
}

/// Which handler family a subscribed class feeds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStream {
    /// Named control handlers (fabricProtPol, vpc groups, fabricNode).
    Control,
    /// Slow MO classes routed through the dependency registry.
    StdMo,
    /// High-volume endpoint manager classes.
    Epm,
}

/// One subscription delivery: a list of imdata objects plus the receive
/// timestamp.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub ts: f64,
    pub imdata: Vec<Value>,
}

/// Event as handed to the subscriber's pump, tagged with the stream of
/// the interest that produced it.
#[derive(Debug, Clone)]
pub struct DeliveredEvent {
    pub stream: EventStream,
    pub event: RawEvent,
}

#[async_trait]
pub trait SubscriptionCtrl: Send + Sync {
    /// Register interest in a class. Events flow to the subscriber's
    /// event channel tagged with `stream`; when `paused`, they buffer
    /// inside this layer until the class is resumed.
    async fn add_interest(&self, class: &str, stream: EventStream, paused: bool) -> Result<()>;

    async fn remove_interest(&self, classes: &[&str]) -> Result<()>;

    async fn pause(&self, classes: &[&str]) -> Result<()>;

    /// Resume paused classes, draining anything buffered. Safe to call
    /// for classes that were never paused.
    async fn resume(&self, classes: &[&str]) -> Result<()>;

    /// Open the websocket subscriptions for all registered interests.
    /// Non-blocking; liveness is observed through `is_alive`.
    async fn start(&self) -> Result<()>;

    async fn stop(&self);

    fn is_alive(&self) -> bool;

    /// Populated when the layer died on its own (refresh failure,
    /// websocket loss); surfaced as the fabric failure reason.
    fn failure_reason(&self) -> Option<String>;
}

/// Unwrap one imdata object into `(classname, attributes)`.
pub fn object_attributes(obj: &Value) -> Option<(&str, &Map<String, Value>)> {
    let map = obj.as_object()?;
    let (class, body) = map.iter().next()?;
    let attrs = body.get("attributes")?.as_object()?;
    Some((class.as_str(), attrs))
}

/// Child objects of one imdata object matching `class`.
pub fn object_children<'a>(obj: &'a Value, class: &str) -> Vec<&'a Value> {
    let Some(map) = obj.as_object() else {
        return Vec::new();
    };
    let Some((_, body)) = map.iter().next() else {
        return Vec::new();
    };
    body.get("children")
        .and_then(Value::as_array)
        .map(|children| {
            children
                .iter()
                .filter(|c| c.as_object().is_some_and(|o| o.contains_key(class)))
                .collect()
        })
        .unwrap_or_default()
}

/// Firmware versions for every controller and switch in the fabric.
pub async fn fabric_version(session: &dyn ControllerSession) -> Result<VersionReport> {
    let mut report = VersionReport::default();
    let controllers = session
        .class_query("firmwareCtrlrRunning", &ClassQuery::default())
        .await?;
    for obj in &controllers {
        if let Some(nv) = node_version(obj, "version") {
            report.controller.push(nv);
        }
    }
    let switches = session
        .class_query("firmwareRunning", &ClassQuery::default())
        .await?;
    for obj in &switches {
        if let Some(nv) = node_version(obj, "peVer") {
            report.switch.push(nv);
        }
    }
    if report.controller.is_empty() {
        return Err(Error::Controller(
            "failed to determine controller version".to_string(),
        ));
    }
    Ok(report)
}

fn node_version(obj: &Value, version_attr: &str) -> Option<NodeVersion> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"topology/pod-\d+/node-(?P<value>\d+)").expect("node id regex")
    });
    let (_, attrs) = object_attributes(obj)?;
    let dn = attrs.get("dn").and_then(Value::as_str)?;
    let node = re.captures(dn)?["value"].parse().ok()?;
    let version = attrs.get(version_attr).and_then(Value::as_str)?.to_string();
    Some(NodeVersion { node, version })
}
