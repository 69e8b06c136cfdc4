//! In-memory fakes for the subscriber's collaborators.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde_json::{json, Map, Value};
use tokio::sync::mpsc;

use weft::bus::{Bus, ChannelMsg};
use weft::controller::{
    ClassQuery, ControllerSession, EventStream, SessionRole, SubscriptionCtrl,
};
use weft::error::Result;
use weft::model::{
    Epg, HistoryFilter, HistoryProjection, Node, Pc, QueueStats, Subnet, Tunnel, Vnid, Vpc,
};
use weft::settings::Settings;
use weft::store::{MoRow, Store};

// ---------------------------------------------------------------- bus

#[derive(Default)]
pub struct MemBus {
    pub queues: Mutex<HashMap<String, VecDeque<String>>>,
    pub published: Mutex<Vec<(String, String)>>,
    subscribers: Mutex<HashMap<String, Vec<mpsc::UnboundedSender<ChannelMsg>>>>,
}

impl MemBus {
    pub fn queue(&self, name: &str) -> Vec<String> {
        self.queues
            .lock()
            .unwrap()
            .get(name)
            .map(|q| q.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }
}

#[async_trait]
impl Bus for MemBus {
    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.published
            .lock()
            .unwrap()
            .push((channel.to_string(), payload.clone()));
        let subscribers = self.subscribers.lock().unwrap();
        if let Some(senders) = subscribers.get(channel) {
            for tx in senders {
                let _ = tx.send(ChannelMsg {
                    channel: channel.to_string(),
                    payload: payload.clone(),
                });
            }
        }
        Ok(())
    }

    async fn push(&self, queue: &str, payload: String, prepend: bool) -> Result<()> {
        let mut queues = self.queues.lock().unwrap();
        let q = queues.entry(queue.to_string()).or_default();
        if prepend {
            q.push_front(payload);
        } else {
            q.push_back(payload);
        }
        Ok(())
    }

    async fn queue_len(&self, queue: &str) -> Result<u64> {
        Ok(self
            .queues
            .lock()
            .unwrap()
            .get(queue)
            .map(|q| q.len() as u64)
            .unwrap_or(0))
    }

    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, ChannelMsg>> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.subscribers
            .lock()
            .unwrap()
            .entry(channel.to_string())
            .or_default()
            .push(tx);
        Ok(Box::pin(futures_util::stream::poll_fn(move |cx| {
            rx.poll_recv(cx)
        })))
    }
}

// -------------------------------------------------------------- store

#[derive(Default)]
pub struct StoreInner {
    pub settings: Option<Settings>,
    pub events: Vec<(String, String)>,
    pub auto_start: Option<bool>,
    pub nodes: HashMap<u32, Node>,
    pub tunnels: Vec<Tunnel>,
    pub pcs: Vec<Pc>,
    pub vpcs: Vec<Vpc>,
    pub vnids: Vec<Vnid>,
    pub epgs: Vec<Epg>,
    pub subnets: Vec<Subnet>,
    pub mo: HashMap<String, Vec<MoRow>>,
    pub queue_stats: Vec<QueueStats>,
    pub history: Vec<HistoryProjection>,
}

#[derive(Default)]
pub struct MemStore {
    pub inner: Mutex<StoreInner>,
    pub dead: AtomicBool,
}

impl MemStore {
    pub fn with_history(history: Vec<HistoryProjection>) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().history = history;
        store
    }

    pub fn events(&self) -> Vec<(String, String)> {
        self.inner.lock().unwrap().events.clone()
    }

    pub fn event_count(&self, status: &str) -> usize {
        self.inner
            .lock()
            .unwrap()
            .events
            .iter()
            .filter(|(s, _)| s == status)
            .count()
    }

    pub fn nodes(&self) -> Vec<Node> {
        let mut rows: Vec<Node> = self.inner.lock().unwrap().nodes.values().cloned().collect();
        rows.sort_by_key(|n| n.node);
        rows
    }
}

#[async_trait]
impl Store for MemStore {
    async fn alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    async fn load_settings(&self, fabric: &str) -> Result<Settings> {
        Ok(self
            .inner
            .lock()
            .unwrap()
            .settings
            .clone()
            .unwrap_or_else(|| Settings::new(fabric)))
    }

    async fn save_settings(&self, settings: &Settings) -> Result<()> {
        self.inner.lock().unwrap().settings = Some(settings.clone());
        Ok(())
    }

    async fn add_fabric_event(&self, _fabric: &str, status: &str, description: &str) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .events
            .push((status.to_string(), description.to_string()));
        Ok(())
    }

    async fn set_auto_start(&self, _fabric: &str, auto_start: bool) -> Result<()> {
        self.inner.lock().unwrap().auto_start = Some(auto_start);
        Ok(())
    }

    async fn flush_nodes(&self, _fabric: &str) -> Result<()> {
        self.inner.lock().unwrap().nodes.clear();
        Ok(())
    }

    async fn save_nodes(&self, rows: &[Node]) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        for n in rows {
            inner.nodes.insert(n.node, n.clone());
        }
        Ok(())
    }

    async fn nodes(&self, _fabric: &str) -> Result<Vec<Node>> {
        Ok(self.nodes())
    }

    async fn node(&self, _fabric: &str, node: u32) -> Result<Option<Node>> {
        Ok(self.inner.lock().unwrap().nodes.get(&node).cloned())
    }

    async fn flush_tunnels(&self, _fabric: &str) -> Result<()> {
        self.inner.lock().unwrap().tunnels.clear();
        Ok(())
    }

    async fn save_tunnels(&self, rows: &[Tunnel]) -> Result<()> {
        self.inner.lock().unwrap().tunnels.extend_from_slice(rows);
        Ok(())
    }

    async fn tunnels(&self, _fabric: &str) -> Result<Vec<Tunnel>> {
        Ok(self.inner.lock().unwrap().tunnels.clone())
    }

    async fn flush_pcs(&self, _fabric: &str) -> Result<()> {
        self.inner.lock().unwrap().pcs.clear();
        Ok(())
    }

    async fn save_pcs(&self, rows: &[Pc]) -> Result<()> {
        self.inner.lock().unwrap().pcs.extend_from_slice(rows);
        Ok(())
    }

    async fn pcs(&self, _fabric: &str) -> Result<Vec<Pc>> {
        Ok(self.inner.lock().unwrap().pcs.clone())
    }

    async fn flush_vpcs(&self, _fabric: &str) -> Result<()> {
        self.inner.lock().unwrap().vpcs.clear();
        Ok(())
    }

    async fn save_vpcs(&self, rows: &[Vpc]) -> Result<()> {
        self.inner.lock().unwrap().vpcs.extend_from_slice(rows);
        Ok(())
    }

    async fn flush_vnids(&self, _fabric: &str) -> Result<()> {
        self.inner.lock().unwrap().vnids.clear();
        Ok(())
    }

    async fn save_vnids(&self, rows: &[Vnid]) -> Result<()> {
        self.inner.lock().unwrap().vnids.extend_from_slice(rows);
        Ok(())
    }

    async fn vnids(&self, _fabric: &str) -> Result<Vec<Vnid>> {
        Ok(self.inner.lock().unwrap().vnids.clone())
    }

    async fn flush_epgs(&self, _fabric: &str) -> Result<()> {
        self.inner.lock().unwrap().epgs.clear();
        Ok(())
    }

    async fn save_epgs(&self, rows: &[Epg]) -> Result<()> {
        self.inner.lock().unwrap().epgs.extend_from_slice(rows);
        Ok(())
    }

    async fn epgs(&self, _fabric: &str) -> Result<Vec<Epg>> {
        Ok(self.inner.lock().unwrap().epgs.clone())
    }

    async fn flush_subnets(&self, _fabric: &str) -> Result<()> {
        self.inner.lock().unwrap().subnets.clear();
        Ok(())
    }

    async fn save_subnets(&self, rows: &[Subnet]) -> Result<()> {
        self.inner.lock().unwrap().subnets.extend_from_slice(rows);
        Ok(())
    }

    async fn save_mo(&self, _fabric: &str, class: &str, rows: &[MoRow]) -> Result<()> {
        self.inner
            .lock()
            .unwrap()
            .mo
            .insert(class.to_string(), rows.to_vec());
        Ok(())
    }

    async fn save_queue_stats(&self, rows: &[QueueStats]) -> Result<()> {
        self.inner.lock().unwrap().queue_stats = rows.to_vec();
        Ok(())
    }

    async fn endpoint_history(
        &self,
        filter: &HistoryFilter,
    ) -> Result<BoxStream<'static, Result<HistoryProjection>>> {
        let rows: Vec<HistoryProjection> = self
            .inner
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|h| {
                filter.addr.as_ref().map_or(true, |a| &h.addr == a)
                    && filter.vnid.map_or(true, |v| h.vnid == v)
            })
            .cloned()
            .collect();
        Ok(futures_util::stream::iter(rows.into_iter().map(Ok)).boxed())
    }
}

// ------------------------------------------------------------ session

pub struct FakeSession {
    pub dns: Mutex<HashMap<String, Map<String, Value>>>,
    pub classes: Mutex<HashMap<String, Vec<Value>>>,
    pub role: SessionRole,
    refresh: Mutex<Duration>,
}

impl Default for FakeSession {
    fn default() -> Self {
        Self {
            dns: Mutex::new(HashMap::new()),
            classes: Mutex::new(HashMap::new()),
            role: SessionRole {
                domain_all: true,
                role_admin: true,
            },
            refresh: Mutex::new(Duration::from_secs(180)),
        }
    }
}

impl FakeSession {
    pub fn set_dn(&self, dn: &str, attrs: Value) {
        let map = attrs.as_object().cloned().unwrap_or_default();
        self.dns.lock().unwrap().insert(dn.to_string(), map);
    }

    pub fn set_class(&self, class: &str, objects: Vec<Value>) {
        self.classes
            .lock()
            .unwrap()
            .insert(class.to_string(), objects);
    }
}

#[async_trait]
impl ControllerSession for FakeSession {
    fn hostname(&self) -> String {
        "controller-1.test".to_string()
    }

    async fn session_role(&self) -> Result<SessionRole> {
        Ok(self.role)
    }

    async fn get_attributes(&self, dn: &str) -> Result<Option<Map<String, Value>>> {
        Ok(self.dns.lock().unwrap().get(dn).cloned())
    }

    async fn class_query(&self, class: &str, _query: &ClassQuery) -> Result<Vec<Value>> {
        Ok(self
            .classes
            .lock()
            .unwrap()
            .get(class)
            .cloned()
            .unwrap_or_default())
    }

    async fn stream_class(
        &self,
        class: &str,
        query: &ClassQuery,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let objects = self.class_query(class, query).await?;
        Ok(futures_util::stream::iter(objects.into_iter().map(Ok)).boxed())
    }

    fn subscription_refresh(&self) -> Duration {
        *self.refresh.lock().unwrap()
    }

    fn set_subscription_refresh(&self, interval: Duration) {
        *self.refresh.lock().unwrap() = interval;
    }

    async fn close(&self) {}
}

// ------------------------------------------------------- subscriptions

#[derive(Default)]
pub struct FakeSubs {
    pub interests: Mutex<Vec<(String, bool)>>,
    pub paused: Mutex<Vec<String>>,
    pub resumed: Mutex<Vec<String>>,
    pub started: AtomicBool,
    pub stopped: AtomicBool,
    pub dead: AtomicBool,
    pub failure: Mutex<Option<String>>,
}

#[async_trait]
impl SubscriptionCtrl for FakeSubs {
    async fn add_interest(&self, class: &str, _stream: EventStream, paused: bool) -> Result<()> {
        self.interests
            .lock()
            .unwrap()
            .push((class.to_string(), paused));
        Ok(())
    }

    async fn remove_interest(&self, classes: &[&str]) -> Result<()> {
        let mut interests = self.interests.lock().unwrap();
        interests.retain(|(c, _)| !classes.contains(&c.as_str()));
        Ok(())
    }

    async fn pause(&self, classes: &[&str]) -> Result<()> {
        self.paused
            .lock()
            .unwrap()
            .extend(classes.iter().map(|c| c.to_string()));
        Ok(())
    }

    async fn resume(&self, classes: &[&str]) -> Result<()> {
        self.resumed
            .lock()
            .unwrap()
            .extend(classes.iter().map(|c| c.to_string()));
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        self.started.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    fn is_alive(&self) -> bool {
        !self.dead.load(Ordering::SeqCst)
    }

    fn failure_reason(&self) -> Option<String> {
        self.failure.lock().unwrap().clone()
    }
}

// ------------------------------------------------------------ fixture

/// Imdata-shaped object constructor.
pub fn imdata(class: &str, attrs: Value) -> Value {
    json!({ class: {"attributes": attrs} })
}

/// The S1 happy-path fabric: two leaves paired in an explicit vpc group,
/// one spine, one BD with an epg and a subnet.
pub fn happy_path_session() -> FakeSession {
    let session = FakeSession::default();
    session.set_dn("info", json!({"id": "1"}));
    session.set_dn("uni/tn-infra/ctx-overlay-1", json!({"scope": "2392068"}));
    session.set_dn("uni/fabric/protpol", json!({"pairT": "explicit"}));
    session.set_dn(
        "uni/fabric/format-default",
        json!({"tz": "p0_UTC", "displayFormat": "utc"}),
    );
    session.set_class(
        "firmwareCtrlrRunning",
        vec![imdata(
            "firmwareCtrlrRunning",
            json!({"dn": "topology/pod-1/node-1/sys/ctrlrfwstatuscont/ctrlrrunning",
                   "version": "5.0(1k)"}),
        )],
    );
    session.set_class(
        "firmwareRunning",
        vec![
            imdata(
                "firmwareRunning",
                json!({"dn": "topology/pod-1/node-101/sys/fwstatuscont/running", "peVer": "5.0(1k)"}),
            ),
            imdata(
                "firmwareRunning",
                json!({"dn": "topology/pod-1/node-102/sys/fwstatuscont/running", "peVer": "5.0(1k)"}),
            ),
        ],
    );
    session.set_class(
        "fabricNode",
        vec![
            imdata(
                "fabricNode",
                json!({"dn": "topology/pod-1/node-101", "id": "101", "name": "leaf-101",
                       "role": "leaf", "address": "10.0.0.101"}),
            ),
            imdata(
                "fabricNode",
                json!({"dn": "topology/pod-1/node-102", "id": "102", "name": "leaf-102",
                       "role": "leaf", "address": "10.0.0.102"}),
            ),
            imdata(
                "fabricNode",
                json!({"dn": "topology/pod-1/node-201", "id": "201", "name": "spine-201",
                       "role": "spine", "address": "10.0.0.201"}),
            ),
        ],
    );
    session.set_class(
        "topSystem",
        vec![
            imdata(
                "topSystem",
                json!({"id": "101", "address": "10.0.0.101", "state": "in-service"}),
            ),
            imdata(
                "topSystem",
                json!({"id": "102", "address": "10.0.0.102", "state": "in-service"}),
            ),
            imdata(
                "topSystem",
                json!({"id": "201", "address": "10.0.0.201", "state": "in-service"}),
            ),
        ],
    );
    session.set_class(
        "fabricExplicitGEp",
        vec![json!({"fabricExplicitGEp": {
            "attributes": {"dn": "uni/fabric/protpol/expgep-vpc1", "name": "vpc1",
                            "virtualIp": "10.0.0.1/32"},
            "children": [
                {"fabricNodePEp": {"attributes": {"id": "101", "peerIp": "10.0.0.102/32"}}},
                {"fabricNodePEp": {"attributes": {"id": "102", "peerIp": "10.0.0.101/32"}}}
            ]
        }})],
    );
    session.set_class(
        "fvBD",
        vec![imdata(
            "fvBD",
            json!({"dn": "uni/tn-t1/BD-bd1", "seg": "14680065"}),
        )],
    );
    session.set_class(
        "fvAEPg",
        vec![imdata(
            "fvAEPg",
            json!({"dn": "uni/tn-t1/ap-a1/epg-e1"}),
        )],
    );
    session.set_class(
        "fvRsBd",
        vec![imdata(
            "fvRsBd",
            json!({"dn": "uni/tn-t1/ap-a1/epg-e1/rsbd", "tDn": "uni/tn-t1/BD-bd1"}),
        )],
    );
    session.set_class(
        "fvSubnet",
        vec![imdata(
            "fvSubnet",
            json!({"dn": "uni/tn-t1/BD-bd1/subnet-[10.1.1.0/24]", "ip": "10.1.1.0/24"}),
        )],
    );
    session
}

// ------------------------------------------------------------ harness

use std::sync::Arc;

use tokio::task::JoinHandle;

use weft::controller::DeliveredEvent;
use weft::dispatch::TrackedWorker;
use weft::msg::Role;
use weft::settings::FabricConfig;
use weft::subscriber::Subscriber;

/// A running subscriber wired to in-memory collaborators.
pub struct Harness {
    pub subscriber: Arc<Subscriber>,
    pub bus: Arc<MemBus>,
    pub store: Arc<MemStore>,
    pub session: Arc<FakeSession>,
    pub subs: Arc<FakeSubs>,
    pub events: mpsc::UnboundedSender<DeliveredEvent>,
    pub task: JoinHandle<Result<()>>,
}

impl Harness {
    pub async fn start(
        session: FakeSession,
        store: MemStore,
        worker_ids: &[&str],
        tune: impl FnOnce(&mut FabricConfig),
    ) -> Self {
        let _ = env_logger::builder().is_test(true).try_init();
        let mut config = FabricConfig::new("fab1");
        config.subscription_check_interval = Duration::from_millis(50);
        config.bg_event_handler_interval = Duration::from_millis(20);
        config.hello_interval = Duration::from_secs(30);
        config.stats_interval = Duration::from_secs(30);
        tune(&mut config);

        let session = Arc::new(session);
        let store = Arc::new(store);
        let bus = Arc::new(MemBus::default());
        let subs = Arc::new(FakeSubs::default());
        let workers = worker_ids
            .iter()
            .map(|id| {
                TrackedWorker::new(
                    *id,
                    Role::Worker,
                    vec![format!("q0_{id}"), format!("q1_{id}")],
                )
            })
            .collect();
        let (events, events_rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber::new(
            config,
            session.clone(),
            store.clone(),
            bus.clone(),
            subs.clone(),
            workers,
            events_rx,
        );
        let task = tokio::spawn(Arc::clone(&subscriber).run());
        Self {
            subscriber,
            bus,
            store,
            session,
            subs,
            events,
            task,
        }
    }

    /// Deliver an ack on the subscriber control channel as a worker
    /// would.
    pub async fn ack_epm_eof(&self, worker_id: &str) {
        let msg = weft::msg::Msg::FabricEpmEofAck {
            fabric: "fab1".to_string(),
            addr: worker_id.to_string(),
        };
        self.bus
            .publish(weft::bus::SUBSCRIBER_CTRL_CHANNEL, msg.encode().unwrap())
            .await
            .unwrap();
    }
}

/// Poll until `check` passes or the timeout lapses.
pub async fn wait_for<F>(what: &str, timeout: Duration, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if check() {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
