//! Per-fabric subscriber: bootstrap orchestration, restart state
//! machine, background loops, and the control channel.
//!
//! One instance exists per fabric per process. The main loop drives the
//! init pipeline (connect, validate, build, endpoint snapshot, EPM EOF
//! barrier) and then polls subscription liveness; four background tasks
//! carry the heartbeat, stats flush, event batching, and control-channel
//! listening. Worker membership is fixed for the life of the instance;
//! membership changes arrive as a restart from the supervisor.

mod router;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex as StdMutex, OnceLock, RwLock};
use std::sync::Arc;

use futures_util::StreamExt;
use log::{debug, error, info, warn};
use serde_json::{json, Value};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep};

use crate::bus::{Bus, ChannelMsg, MANAGER_CTRL_CHANNEL, SUBSCRIBER_CTRL_CHANNEL, WORKER_CTRL_CHANNEL};
use crate::controller::{ClassQuery, ControllerSession, DeliveredEvent, EventStream, SubscriptionCtrl};
use crate::dispatch::{ActiveWorkerTable, Dispatcher, TrackedWorker};
use crate::error::{Error, Result};
use crate::mo::{MoCache, ORDERED_MO_CLASSES};
use crate::model::{AddrType, EptTable, HistoryFilter};
use crate::msg::epm::{EpmEventParser, EPM_CLASSES};
use crate::msg::{now_ts, Hello, Msg, Role, WorkMsg, WorkType};
use crate::settings::{FabricConfig, Settings, DEFAULT_SUBSCRIPTION_REFRESH};
use crate::snapshot::{delete_events, SnapshotBuilder};
use crate::store::Store;
use crate::version::{FirmwareVersion, MINIMUM_SUPPORTED_VERSION};

/// Control classes with dedicated handlers; everything else slow flows
/// through the dependency registry.
pub const CONTROL_CLASSES: [&str; 4] = [
    "fabricProtPol",
    "fabricAutoGEp",
    "fabricExplicitGEp",
    "fabricNode",
];

/// Subscriber lifecycle state, visible for supervision and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FabricState {
    Booting,
    Connecting,
    Validating,
    Building,
    Running,
    SoftRestarting,
    HardRestarting,
    Terminated,
}

struct EofTracking {
    start: f64,
    acked: HashMap<String, bool>,
}

/// Per-fabric subscriber instance. Construct with [`Subscriber::new`] and
/// drive with [`Subscriber::run`].
pub struct Subscriber {
    config: FabricConfig,
    settings: RwLock<Settings>,
    session: Arc<dyn ControllerSession>,
    store: Arc<dyn Store>,
    bus: Arc<dyn Bus>,
    subs: Arc<dyn SubscriptionCtrl>,
    dispatcher: Dispatcher,
    cache: MoCache,
    epm_parser: OnceLock<EpmEventParser>,

    state: StdMutex<FabricState>,
    initializing: AtomicBool,
    epm_initializing: AtomicBool,
    stopped: AtomicBool,
    soft_restart_ts: StdMutex<f64>,
    epm_eof: StdMutex<Option<EofTracking>>,

    // event plumbing; receivers are taken by their tasks at run()
    events_rx: StdMutex<Option<mpsc::UnboundedReceiver<DeliveredEvent>>>,
    std_mo_tx: mpsc::UnboundedSender<WorkMsg>,
    std_mo_rx: StdMutex<Option<mpsc::UnboundedReceiver<WorkMsg>>>,
    epm_tx: mpsc::UnboundedSender<WorkMsg>,
    epm_rx: StdMutex<Option<mpsc::UnboundedReceiver<WorkMsg>>>,

    shutdown: watch::Sender<bool>,
    manager_ctrl_lock: Mutex<()>,
    hello_start: f64,
    hello_seq: AtomicU64,
}

impl Subscriber {
    /// Build a subscriber around its collaborators. `events` is the
    /// channel the subscription layer delivers into; `workers` is the
    /// worker membership as known at start, trusted for the life of this
    /// instance.
    pub fn new(
        config: FabricConfig,
        session: Arc<dyn ControllerSession>,
        store: Arc<dyn Store>,
        bus: Arc<dyn Bus>,
        subs: Arc<dyn SubscriptionCtrl>,
        workers: Vec<TrackedWorker>,
        events: mpsc::UnboundedReceiver<DeliveredEvent>,
    ) -> Arc<Self> {
        let dispatcher = Dispatcher::new(
            config.fabric.clone(),
            Arc::clone(&bus),
            ActiveWorkerTable::new(workers),
            config.max_send_msg_length,
        );
        let (std_mo_tx, std_mo_rx) = mpsc::unbounded_channel();
        let (epm_tx, epm_rx) = mpsc::unbounded_channel();
        let (shutdown, _) = watch::channel(false);
        let settings = Settings::new(config.fabric.clone());
        let cache = MoCache::new(config.fabric.clone());
        Arc::new(Self {
            settings: RwLock::new(settings),
            cache,
            dispatcher,
            session,
            store,
            bus,
            subs,
            epm_parser: OnceLock::new(),
            state: StdMutex::new(FabricState::Booting),
            initializing: AtomicBool::new(true),
            epm_initializing: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            soft_restart_ts: StdMutex::new(0.0),
            epm_eof: StdMutex::new(None),
            events_rx: StdMutex::new(Some(events)),
            std_mo_tx,
            std_mo_rx: StdMutex::new(Some(std_mo_rx)),
            epm_tx,
            epm_rx: StdMutex::new(Some(epm_rx)),
            shutdown,
            manager_ctrl_lock: Mutex::new(()),
            hello_start: now_ts(),
            hello_seq: AtomicU64::new(0),
            config,
        })
    }

    pub fn state(&self) -> FabricState {
        self.state.lock().map(|g| *g).unwrap_or(FabricState::Terminated)
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Worker ids still missing an EPM EOF ack, `None` once the barrier
    /// has completed or timed out.
    pub fn epm_eof_pending(&self) -> Option<Vec<String>> {
        let guard = self.epm_eof.lock().ok()?;
        guard.as_ref().map(|t| {
            let mut pending: Vec<String> = t
                .acked
                .iter()
                .filter(|(_, acked)| !**acked)
                .map(|(id, _)| id.clone())
                .collect();
            pending.sort();
            pending
        })
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    fn set_state(&self, state: FabricState) {
        if let Ok(mut guard) = self.state.lock() {
            *guard = state;
        }
    }

    pub(crate) fn settings(&self) -> Settings {
        self.settings
            .read()
            .map(|g| g.clone())
            .unwrap_or_else(|_| Settings::new(self.config.fabric.clone()))
    }

    fn fabric(&self) -> &str {
        &self.config.fabric
    }

    /// Run the subscriber to completion: background loops, bootstrap,
    /// steady state. Returns when validation fails, the subscription
    /// layer dies, a hard restart hands control back to the supervisor,
    /// or the store becomes unreachable.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("starting subscriber for fabric '{}'", self.fabric());
        match self.store.load_settings(self.fabric()).await {
            Ok(s) => {
                if let Ok(mut guard) = self.settings.write() {
                    *guard = s;
                }
            }
            Err(e) => warn!("failed to load settings, using defaults: {e}"),
        }

        let (fatal_tx, fatal_rx) = mpsc::channel::<String>(1);
        let mut tasks: Vec<JoinHandle<()>> = vec![
            self.spawn_hello_loop(),
            self.spawn_stats_loop(fatal_tx),
            self.spawn_batcher_loop(),
            self.spawn_event_pump(),
        ];

        let result = self.main_loop(fatal_rx, &mut tasks).await;
        match &result {
            Ok(()) => info!("subscriber exiting for fabric '{}'", self.fabric()),
            Err(e) => warn!("subscriber exit: {e}"),
        }

        self.set_state(FabricState::Terminated);
        self.subs.stop().await;
        let _ = self.shutdown.send(true);
        for task in tasks {
            let _ = task.await;
        }
        self.session.close().await;
        result
    }

    /// Bootstrap then steady-state poll; mirrors the init pipeline order
    /// exactly since live events cannot be interpreted before the
    /// snapshot they refer to exists.
    async fn main_loop(
        self: &Arc<Self>,
        mut fatal_rx: mpsc::Receiver<String>,
        tasks: &mut Vec<JoinHandle<()>>,
    ) -> Result<()> {
        let fabric = self.fabric().to_string();

        // connect: the session is handed in, so acquiring it means the
        // first authenticated exchange
        self.set_state(FabricState::Connecting);
        let role = match self.session.session_role().await {
            Ok(role) => role,
            Err(e) => {
                warn!("failed to connect to fabric {fabric}: {e}");
                self.store
                    .add_fabric_event(&fabric, "failed", "failed to connect to controller")
                    .await?;
                return Ok(());
            }
        };
        if !role.domain_all || !role.role_admin {
            let err_msg = "session requires admin role with domain 'all'";
            self.store.set_auto_start(&fabric, false).await?;
            self.store.add_fabric_event(&fabric, "failed", err_msg).await?;
            return Ok(());
        }
        let connected = match self.session.get_attributes("info").await {
            Ok(Some(attrs)) => match attrs.get("id").and_then(Value::as_str) {
                Some(id) => format!("connected to controller-{id}, {}", self.session.hostname()),
                None => format!("connected to controller {}", self.session.hostname()),
            },
            _ => {
                warn!("unable to get info for controller");
                format!("connected to controller {}", self.session.hostname())
            }
        };
        self.store
            .add_fabric_event(&fabric, "initializing", &connected)
            .await?;

        // validate version and fabric-wide constants
        self.set_state(FabricState::Validating);
        if !self.validate(&fabric).await? {
            return Ok(());
        }

        // build: broadcast the watch pause before any table is touched
        self.set_state(FabricState::Building);
        debug!("broadcasting pause to all watchers");
        self.dispatcher
            .broadcast(vec![WorkMsg::new("", Some(Role::Watcher), WorkType::FabricWatchPause)])
            .await;

        let slow = slow_classes();
        for class in CONTROL_CLASSES {
            self.subs.add_interest(class, EventStream::Control, false).await?;
        }
        for class in ORDERED_MO_CLASSES {
            self.subs.add_interest(class, EventStream::StdMo, false).await?;
        }
        if self.settings().queue_init_events {
            self.subs.pause(&slow).await?;
        }
        if let Err(e) = self.subs.start().await {
            warn!("failed to start subscriptions: {e}");
            self.ensure_subscription_alive().await?;
            self.store
                .add_fabric_event(&fabric, "failed", "failed to start one or more subscriptions")
                .await?;
            return Ok(());
        }

        let builder = SnapshotBuilder::new(&fabric, &*self.session, &*self.store, &self.cache);
        self.store
            .add_fabric_event(&fabric, "initializing", "collecting base managed objects")
            .await?;
        if let Err(e) = builder.build_mo().await {
            self.store
                .add_fabric_event(&fabric, "failed", &format!("failed to collect managed objects: {e}"))
                .await?;
            return Ok(());
        }
        self.ensure_subscription_alive().await?;

        self.store
            .add_fabric_event(&fabric, "initializing", "building node db")
            .await?;
        if let Err(e) = builder.build_node_db().await {
            warn!("failed to build node db: {e}");
            self.store
                .add_fabric_event(&fabric, "failed", "failed to build node db")
                .await?;
            return Ok(());
        }
        if let Err(e) = builder.build_vpc_db().await {
            warn!("failed to build vpc db: {e}");
            self.store
                .add_fabric_event(&fabric, "failed", "failed to build node pc to vpc db")
                .await?;
            return Ok(());
        }
        self.ensure_subscription_alive().await?;

        self.store
            .add_fabric_event(&fabric, "initializing", "building tunnel db")
            .await?;
        if let Err(e) = builder.build_tunnel_db().await {
            warn!("failed to build tunnel db: {e}");
            self.store
                .add_fabric_event(&fabric, "failed", "failed to build tunnel db")
                .await?;
            return Ok(());
        }
        self.ensure_subscription_alive().await?;

        self.store
            .add_fabric_event(&fabric, "initializing", "building vnid db")
            .await?;
        if let Err(e) = builder.build_vnid_db().await {
            warn!("failed to build vnid db: {e}");
            self.store
                .add_fabric_event(&fabric, "failed", "failed to build vnid db")
                .await?;
            return Ok(());
        }
        self.ensure_subscription_alive().await?;

        self.store
            .add_fabric_event(&fabric, "initializing", "building epg db")
            .await?;
        if let Err(e) = builder.build_epg_db().await {
            warn!("failed to build epg db: {e}");
            self.store
                .add_fabric_event(&fabric, "failed", "failed to build epg db")
                .await?;
            return Ok(());
        }
        self.ensure_subscription_alive().await?;

        self.store
            .add_fabric_event(&fabric, "initializing", "building subnet db")
            .await?;
        if let Err(e) = builder.build_subnet_db().await {
            warn!("failed to build subnet db: {e}");
            self.store
                .add_fabric_event(&fabric, "failed", "failed to build subnet db")
                .await?;
            return Ok(());
        }
        self.ensure_subscription_alive().await?;

        // slow objects initialized; resume is safe even if never paused
        self.initializing.store(false, Ordering::SeqCst);
        self.subs.resume(&slow).await?;

        let settings = self.settings();
        let parser = EpmEventParser::new(fabric.clone(), settings.overlay_vnid);
        let _ = self.epm_parser.set(parser);

        self.store
            .add_fabric_event(&fabric, "initializing", "getting initial endpoint state")
            .await?;
        let parser = self.epm_parser.get().expect("epm parser initialized above");
        if let Err(e) = builder
            .build_endpoint_db(
                &*self.subs,
                &self.dispatcher,
                parser,
                settings.queue_init_epm_events,
                self.config.max_send_msg_length,
            )
            .await
        {
            warn!("failed to build endpoint db: {e}");
            self.store
                .add_fabric_event(&fabric, "failed", "failed to build initial endpoint db")
                .await?;
            return Ok(());
        }
        self.ensure_subscription_alive().await?;

        self.epm_initializing.store(false, Ordering::SeqCst);
        self.subs.resume(&EPM_CLASSES).await?;

        // listen for control messages only once fully initialized, and
        // before the EOF markers so no ack can be missed
        tasks.push(self.spawn_ctrl_listener().await?);

        self.start_epm_eof_barrier().await;
        debug!("sending fabric epm eof to all workers");
        self.store
            .add_fabric_event(&fabric, "initializing", "building endpoint db")
            .await?;

        self.set_state(FabricState::Running);
        loop {
            tokio::select! {
                _ = sleep(self.config.subscription_check_interval) => {
                    self.ensure_subscription_alive().await?;
                    self.check_epm_eof_timeout().await?;
                }
                reason = fatal_rx.recv() => {
                    let reason = reason.unwrap_or_else(|| "fatal channel closed".to_string());
                    return Err(Error::Store(reason));
                }
            }
        }
    }

    /// Version, role, and fabric-constant validation. `Ok(false)` means a
    /// user-visible validation failure was recorded and the subscriber
    /// should terminate without error.
    async fn validate(&self, fabric: &str) -> Result<bool> {
        let report = match crate::controller::fabric_version(&*self.session).await {
            Ok(report) => report,
            Err(e) => {
                warn!("failed to determine controller version: {e}");
                self.store
                    .add_fabric_event(fabric, "failed", "failed to determine controller version")
                    .await?;
                return Ok(false);
            }
        };
        let distinct: std::collections::HashSet<&str> = report
            .controller
            .iter()
            .map(|n| n.version.as_str())
            .collect();
        if distinct.len() > 1 {
            warn!("version mismatch for {fabric}: {distinct:?}");
            let desc = report
                .controller
                .iter()
                .map(|n| format!("controller-{}: {}", n.node, n.version))
                .collect::<Vec<_>>()
                .join(", ");
            self.store
                .add_fabric_event(fabric, "warning", &format!("version mismatch: {desc}"))
                .await?;
        }
        let raw_version = &report.controller[0].version;
        let min = FirmwareVersion::parse(MINIMUM_SUPPORTED_VERSION).expect("minimum version parses");
        let version = FirmwareVersion::parse(raw_version);
        self.store
            .add_fabric_event(
                fabric,
                "initializing",
                &format!(
                    "controller version: {raw_version}, controller count: {}",
                    report.controller.len()
                ),
            )
            .await?;
        let supported = version.as_ref().is_some_and(|v| v.at_least(&min));
        if !supported {
            warn!("fabric does not meet minimum code version ({raw_version} < {min})");
            self.store
                .add_fabric_event(
                    fabric,
                    "failed",
                    &format!("unknown or unsupported controller version: {raw_version}"),
                )
                .await?;
            self.store.set_auto_start(fabric, false).await?;
            return Ok(false);
        }
        // pre-4.x code cannot sustain long subscription refresh intervals,
        // and every switch counts, not just the controllers
        let version = version.expect("checked above");
        let mut refresh_ok = version.major >= 4;
        for sv in &report.switch {
            if FirmwareVersion::parse(&sv.version).is_some_and(|v| v.major < 4) {
                refresh_ok = false;
                break;
            }
        }
        if !refresh_ok && self.session.subscription_refresh() > DEFAULT_SUBSCRIPTION_REFRESH {
            info!(
                "resetting subscription refresh from {:?} to {:?}",
                self.session.subscription_refresh(),
                DEFAULT_SUBSCRIPTION_REFRESH
            );
            self.session.set_subscription_refresh(DEFAULT_SUBSCRIPTION_REFRESH);
        }

        // overlay vnid, vpc pair type, and timezone
        let overlay = self
            .session
            .get_attributes("uni/tn-infra/ctx-overlay-1")
            .await
            .ok()
            .flatten();
        let overlay_vnid = overlay
            .as_ref()
            .and_then(|a| a.get("scope"))
            .and_then(Value::as_str)
            .and_then(|s| s.parse::<u32>().ok());
        let Some(overlay_vnid) = overlay_vnid else {
            warn!("failed to determine overlay vnid");
            self.store
                .add_fabric_event(fabric, "failed", "unable to determine overlay-1 vnid")
                .await?;
            return Ok(false);
        };
        let vpc_attr = self.session.get_attributes("uni/fabric/protpol").await.ok().flatten();
        let tz_attr = self
            .session
            .get_attributes("uni/fabric/format-default")
            .await
            .ok()
            .flatten();
        let pair_t = vpc_attr
            .as_ref()
            .and_then(|a| a.get("pairT"))
            .and_then(Value::as_str);
        match (pair_t, tz_attr.as_ref()) {
            (Some(pair_t), Some(tz_attrs)) => {
                let tz = if tz_attrs.get("displayFormat").and_then(Value::as_str) == Some("utc") {
                    "UTC".to_string()
                } else {
                    let raw = tz_attrs.get("tz").and_then(Value::as_str).unwrap_or("");
                    let parsed = crate::settings::parse_tz(raw);
                    debug!("setting timezone from {raw} to {parsed}");
                    parsed
                };
                let updated = {
                    let mut guard = self.settings.write().map_err(|_| {
                        Error::Store("settings lock poisoned".to_string())
                    })?;
                    guard.overlay_vnid = overlay_vnid;
                    guard.vpc_pair_type = pair_t.to_string();
                    guard.tz = tz;
                    guard.clone()
                };
                self.store.save_settings(&updated).await?;
            }
            _ => {
                warn!("failed to determine fabric protection pairT (using default)");
                if let Ok(mut guard) = self.settings.write() {
                    guard.overlay_vnid = overlay_vnid;
                }
            }
        }
        Ok(true)
    }

    /// Record EOF tracking and send the marker to every worker's
    /// lowest-priority queue so its ack signals a drained backlog.
    async fn start_epm_eof_barrier(&self) {
        let workers: Vec<Arc<TrackedWorker>> = self
            .dispatcher
            .worker_table()
            .workers(Role::Worker)
            .to_vec();
        {
            let mut guard = match self.epm_eof.lock() {
                Ok(g) => g,
                Err(_) => return,
            };
            let mut acked = HashMap::new();
            for w in &workers {
                debug!("epm eof tracking for worker {}", w.worker_id);
                acked.insert(w.worker_id.clone(), false);
            }
            *guard = Some(EofTracking {
                start: now_ts(),
                acked,
            });
        }
        for w in &workers {
            let msg = WorkMsg::new("", Some(Role::Worker), WorkType::FabricEpmEof).with_qnum(0);
            self.dispatcher.send_direct(w, vec![msg]).await;
        }
    }

    /// Steady-loop check: give up on the EOF barrier after the configured
    /// bound and resume watchers anyway.
    async fn check_epm_eof_timeout(&self) -> Result<()> {
        let pending = {
            let Ok(mut guard) = self.epm_eof.lock() else {
                return Ok(());
            };
            let expired = guard.as_ref().is_some_and(|t| {
                now_ts() - t.start >= self.config.max_epm_build_time.as_secs_f64()
            });
            if !expired {
                return Ok(());
            }
            let tracking = guard.take().expect("checked above");
            let mut pending: Vec<String> = tracking
                .acked
                .iter()
                .filter(|(_, acked)| !**acked)
                .map(|(id, _)| id.clone())
                .collect();
            pending.sort();
            pending
        };
        let err = format!(
            "epm max build time({}s) exceeded while waiting for worker[{}]",
            self.config.max_epm_build_time.as_secs(),
            pending.join(",")
        );
        warn!("{err}");
        self.store
            .add_fabric_event(self.fabric(), "warning", &err)
            .await?;
        debug!("broadcasting resume to all watchers");
        self.dispatcher
            .broadcast(vec![WorkMsg::new("", Some(Role::Watcher), WorkType::FabricWatchResume)])
            .await;
        self.store
            .add_fabric_event(self.fabric(), "running", "")
            .await?;
        Ok(())
    }

    async fn ensure_subscription_alive(&self) -> Result<()> {
        if self.subs.is_alive() {
            return Ok(());
        }
        warn!("subscription no longer alive for {}", self.fabric());
        if let Some(reason) = self.subs.failure_reason() {
            let _ = self
                .store
                .add_fabric_event(self.fabric(), "failed", &reason)
                .await;
        }
        Err(Error::SubscriberExit(
            "subscription is no longer alive".to_string(),
        ))
    }

    /// Soft restart: re-pause slow interests and rebuild only the node,
    /// pc/vpc, and tunnel tables, then tell workers to drop the matching
    /// caches. Stale requests (older than the newest handled one) are
    /// dropped. Any phase failure escalates to a hard restart.
    pub(crate) async fn soft_restart(self: &Arc<Self>, ts: Option<f64>, reason: &str) {
        debug!("soft restart requested: {reason}");
        if let Ok(mut last) = self.soft_restart_ts.lock() {
            if let Some(ts) = ts {
                if *last > ts {
                    debug!("skipping stale soft_restart request ({:.3} > {:.3})", *last, ts);
                    return;
                }
                *last = ts;
            }
        }
        self.set_state(FabricState::SoftRestarting);
        self.initializing.store(true, Ordering::SeqCst);
        let slow = slow_classes();
        let _ = self.subs.remove_interest(&slow).await;
        for class in CONTROL_CLASSES {
            let _ = self.subs.add_interest(class, EventStream::Control, true).await;
        }
        for class in ORDERED_MO_CLASSES {
            let _ = self.subs.add_interest(class, EventStream::StdMo, true).await;
        }

        let fabric = self.fabric().to_string();
        let _ = self.store.add_fabric_event(&fabric, "soft-reset", reason).await;
        let _ = self
            .store
            .add_fabric_event(&fabric, "re-initializing", "building node db")
            .await;
        let builder = SnapshotBuilder::new(&fabric, &*self.session, &*self.store, &self.cache);
        if let Err(e) = builder.build_node_db().await {
            warn!("soft restart failed to build node db: {e}");
            let _ = self
                .store
                .add_fabric_event(&fabric, "failed", "failed to build node db")
                .await;
            return self.hard_restart("failed to build node db").await;
        }
        for class in ["vpcRsVpcConf", "pcAggrIf", "pcRsMbrIfs"] {
            if let Err(e) = self.cache.rebuild(class, &*self.session, &*self.store).await {
                warn!("soft restart failed to rebuild {class}: {e}");
                let _ = self
                    .store
                    .add_fabric_event(&fabric, "failed", &format!("failed to rebuild {class}"))
                    .await;
                return self.hard_restart("failed to build node pc to vpc db").await;
            }
        }
        if let Err(e) = builder.build_vpc_db().await {
            warn!("soft restart failed to build vpc db: {e}");
            let _ = self
                .store
                .add_fabric_event(&fabric, "failed", "failed to build node pc to vpc db")
                .await;
            return self.hard_restart("failed to build node pc to vpc db").await;
        }
        let _ = self
            .store
            .add_fabric_event(&fabric, "re-initializing", "building tunnel db")
            .await;
        if let Err(e) = builder.build_tunnel_db().await {
            warn!("soft restart failed to build tunnel db: {e}");
            let _ = self
                .store
                .add_fabric_event(&fabric, "failed", "failed to build tunnel db")
                .await;
            return self.hard_restart("failed to build tunnel db").await;
        }

        for table in [EptTable::Node, EptTable::Vpc, EptTable::Pc, EptTable::Tunnel] {
            self.send_flush(table, None).await;
        }

        let _ = self.store.add_fabric_event(&fabric, "running", "").await;
        self.initializing.store(false, Ordering::SeqCst);
        let _ = self.subs.resume(&slow).await;
        self.set_state(FabricState::Running);
    }

    /// Hard restart: stop ingesting, kill the subscriptions, and ask the
    /// supervisor for a fresh process.
    pub(crate) async fn hard_restart(&self, reason: &str) {
        warn!("restarting fabric monitor '{}': {reason}", self.fabric());
        self.set_state(FabricState::HardRestarting);
        let _ = self
            .store
            .add_fabric_event(self.fabric(), "restarting", reason)
            .await;
        self.stopped.store(true, Ordering::SeqCst);
        self.subs.stop().await;

        let msg = Msg::FabricRestart {
            fabric: self.fabric().to_string(),
            reason: format!("restarting: {reason}"),
        };
        let payload = match msg.encode() {
            Ok(p) => p,
            Err(e) => {
                error!("failed to encode restart msg: {e}");
                return;
            }
        };
        let _guard = self.manager_ctrl_lock.lock().await;
        if let Err(e) = self.bus.publish(MANAGER_CTRL_CHANNEL, payload).await {
            error!("failed to publish restart request: {e}");
        }
    }

    /// Broadcast a cache-flush work item for one derived table.
    pub(crate) async fn send_flush(&self, table: EptTable, name: Option<&str>) {
        debug!("flush {} (name:{})", table.as_str(), name.unwrap_or("-"));
        let msg = WorkMsg::new("", Some(Role::Worker), WorkType::FlushCache)
            .with_data(json!({"cache": table.as_str(), "name": name}));
        self.dispatcher.broadcast(vec![msg]).await;
    }

    /// Handle one message from the subscriber control channel. Errors are
    /// logged, never fatal; the listener keeps running.
    pub(crate) async fn handle_subscriber_ctrl(self: &Arc<Self>, msg: Msg) {
        match msg {
            Msg::RefreshEpt {
                fabric,
                vnid,
                addr,
                addr_type,
            } => {
                if fabric != self.fabric() {
                    debug!("request not for this fabric");
                    return;
                }
                self.refresh_endpoint(vnid, &addr, addr_type).await;
            }
            Msg::DeleteEpt {
                fabric,
                vnid,
                addr,
                qnum,
            } => {
                if fabric != self.fabric() {
                    debug!("request not for this fabric");
                    return;
                }
                let mut work = WorkMsg::new(addr, Some(Role::Worker), WorkType::DeleteEpt)
                    .with_qnum(qnum);
                work.vnid = vnid;
                self.dispatcher.send(vec![work], false).await;
            }
            Msg::SettingsReload { fabric } => {
                if fabric != self.fabric() {
                    debug!("request not for this fabric");
                    return;
                }
                debug!("reloading local settings");
                match self.store.load_settings(&fabric).await {
                    Ok(s) => {
                        if let Ok(mut guard) = self.settings.write() {
                            *guard = s;
                        }
                    }
                    Err(e) => warn!("failed to reload settings: {e}"),
                }
                debug!("broadcasting settings reload to all roles");
                self.dispatcher
                    .broadcast(vec![WorkMsg::new("", None, WorkType::SettingsReload)])
                    .await;
            }
            Msg::FabricEpmEofAck { fabric, addr } => {
                if fabric != self.fabric() {
                    debug!("request not for this fabric");
                    return;
                }
                self.handle_epm_eof_ack(&addr).await;
            }
            other => debug!("ignoring unexpected msg type: {other:?}"),
        }
    }

    async fn handle_epm_eof_ack(&self, worker_id: &str) {
        debug!("{} receiving EPM EOF ACK: {worker_id}", self.fabric());
        let complete = {
            let Ok(mut guard) = self.epm_eof.lock() else {
                return;
            };
            let Some(tracking) = guard.as_mut() else {
                debug!("ignoring ack as tracking is disabled");
                return;
            };
            match tracking.acked.get_mut(worker_id) {
                Some(acked) => *acked = true,
                None => warn!("received ack from unknown worker {worker_id}"),
            }
            let pending: Vec<&String> = tracking
                .acked
                .iter()
                .filter(|(_, acked)| !**acked)
                .map(|(id, _)| id)
                .collect();
            debug!("pending ack from {} workers", pending.len());
            if pending.is_empty() {
                *guard = None;
                true
            } else {
                false
            }
        };
        if complete {
            debug!("received epm ack from all workers, broadcasting resume to all watchers");
            self.dispatcher
                .broadcast(vec![WorkMsg::new("", Some(Role::Watcher), WorkType::FabricWatchResume)])
                .await;
            let _ = self
                .store
                .add_fabric_event(self.fabric(), "running", "")
                .await;
        }
    }

    /// Targeted endpoint refresh: query the controller for one endpoint
    /// key, feed the results back through the normal event path with
    /// `force` set, and head-insert so the worker re-analyzes now.
    pub(crate) async fn refresh_endpoint(&self, vnid: u32, addr: &str, addr_type: AddrType) {
        debug!("refreshing [0x{vnid:06x} {addr}]");
        let Some(parser) = self.epm_parser.get() else {
            debug!("refresh before epm parser is ready");
            return;
        };
        let (classname, query) = match addr_type {
            AddrType::Mac => (
                "epmMacEp",
                ClassQuery {
                    query_target_filter: Some(format!("eq(epmMacEp.addr,\"{addr}\")")),
                    ..ClassQuery::default()
                },
            ),
            AddrType::Ip => (
                "epmDb",
                ClassQuery {
                    query_target: Some("subtree".to_string()),
                    target_subtree_class: Some("epmIpEp,epmRsMacEpToIpEpAtt".to_string()),
                    query_target_filter: Some(format!(
                        "or(eq(epmIpEp.addr,\"{addr}\"),wcard(epmRsMacEpToIpEpAtt.dn,\"ip-\\[{addr}\\]\"))"
                    )),
                    ..ClassQuery::default()
                },
            ),
        };
        let objects = match self.session.class_query(classname, &query).await {
            Ok(objects) => objects,
            Err(e) => {
                debug!("failed to get epm objects: {e}");
                return;
            }
        };
        let ts = now_ts();
        let mut msgs: Vec<WorkMsg> = Vec::new();
        let mut present: HashMap<u32, HashMap<u32, std::collections::HashSet<String>>> =
            HashMap::new();
        for obj in &objects {
            let Some((class, attrs)) = crate::controller::object_attributes(obj) else {
                debug!("ignoring invalid epm object");
                continue;
            };
            if let Some(ev) = parser.parse(class, attrs, ts) {
                present
                    .entry(ev.node)
                    .or_default()
                    .entry(ev.vnid)
                    .or_default()
                    .insert(ev.addr);
                msgs.push(ev.work);
            }
        }
        let filter = HistoryFilter {
            fabric: self.fabric().to_string(),
            addr: Some(addr.to_string()),
            vnid: Some(vnid),
        };
        match self.store.endpoint_history(&filter).await {
            Ok(mut history) => {
                while let Some(entry) = history.next().await {
                    let Ok(entry) = entry else {
                        break;
                    };
                    let known = present
                        .get(&entry.node)
                        .and_then(|v| v.get(&entry.vnid))
                        .is_some_and(|addrs| addrs.contains(&entry.addr));
                    if !known {
                        msgs.extend(delete_events(parser, &entry, ts));
                    }
                }
            }
            Err(e) => warn!("failed to read endpoint history for refresh: {e}"),
        }
        debug!("sending {} msgs from refresh", msgs.len());
        for m in msgs.iter_mut() {
            m.force = true;
        }
        self.dispatcher.send(msgs, true).await;
    }

    fn spawn_hello_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let sub = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(sub.config.hello_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => sub.send_hello().await,
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn send_hello(&self) {
        let hello = Hello {
            fabric: self.fabric().to_string(),
            name: "subscriber".to_string(),
            queues: Vec::new(),
            start_ts: self.hello_start,
            seq: self.hello_seq.fetch_add(1, Ordering::Relaxed) + 1,
        };
        let payload = match Msg::Hello(hello).encode() {
            Ok(p) => p,
            Err(e) => {
                error!("failed to encode hello: {e}");
                return;
            }
        };
        if let Err(e) = self.bus.publish(WORKER_CTRL_CHANNEL, payload).await {
            error!("failed to publish hello: {e}");
            return;
        }
        self.dispatcher.stats().increment_tx(WORKER_CTRL_CHANNEL, 1);
    }

    fn spawn_stats_loop(self: &Arc<Self>, fatal_tx: mpsc::Sender<String>) -> JoinHandle<()> {
        let sub = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(sub.config.stats_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !sub.store.alive().await {
                            error!("store no longer reachable/alive");
                            let _ = fatal_tx.try_send("store no longer reachable".to_string());
                            continue;
                        }
                        sub.flush_stats().await;
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn flush_stats(&self) {
        let stats = self.dispatcher.stats();
        let mut depths = HashMap::new();
        for queue in stats.queue_names() {
            match self.bus.queue_len(&queue).await {
                Ok(len) => {
                    depths.insert(queue, len);
                }
                Err(e) => debug!("failed to sample depth for {queue}: {e}"),
            }
        }
        let rows = stats.rows(&depths, now_ts());
        if let Err(e) = self.store.save_queue_stats(&rows).await {
            warn!("failed to flush queue stats: {e}");
        }
    }

    /// Drain both event queues each tick and hand the batches to the
    /// dispatcher, which folds them into bulks.
    fn spawn_batcher_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let sub = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let mut std_mo_rx = self
            .std_mo_rx
            .lock()
            .ok()
            .and_then(|mut g| g.take())
            .expect("batcher receiver taken once");
        let mut epm_rx = self
            .epm_rx
            .lock()
            .ok()
            .and_then(|mut g| g.take())
            .expect("batcher receiver taken once");
        tokio::spawn(async move {
            let mut ticker = interval(sub.config.bg_event_handler_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        for rx in [&mut std_mo_rx, &mut epm_rx] {
                            let mut batch = Vec::new();
                            while let Ok(msg) = rx.try_recv() {
                                batch.push(msg);
                            }
                            if !batch.is_empty() {
                                sub.dispatcher.send(batch, false).await;
                            }
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    fn spawn_event_pump(self: &Arc<Self>) -> JoinHandle<()> {
        let sub = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let mut events = self
            .events_rx
            .lock()
            .ok()
            .and_then(|mut g| g.take())
            .expect("event receiver taken once");
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    delivered = events.recv() => {
                        match delivered {
                            Some(ev) => sub.route_event(ev).await,
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        })
    }

    async fn spawn_ctrl_listener(self: &Arc<Self>) -> Result<JoinHandle<()>> {
        let mut stream = self.bus.subscribe(SUBSCRIBER_CTRL_CHANNEL).await?;
        debug!("[{}] listening for events on {SUBSCRIBER_CTRL_CHANNEL}", self.fabric());
        let sub = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        Ok(tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = stream.next() => {
                        match msg {
                            Some(msg) => sub.handle_channel_msg(msg).await,
                            None => break,
                        }
                    }
                    _ = shutdown.changed() => break,
                }
            }
        }))
    }

    async fn handle_channel_msg(self: &Arc<Self>, raw: ChannelMsg) {
        if raw.channel != SUBSCRIBER_CTRL_CHANNEL {
            warn!("[{}] unsupported channel: {}", self.fabric(), raw.channel);
            return;
        }
        match Msg::decode(&raw.payload) {
            Ok(msg) => {
                debug!("[{}] msg on q({}): {msg:?}", self.fabric(), raw.channel);
                self.handle_subscriber_ctrl(msg).await;
            }
            Err(e) => error!("failed to handle channel msg: {e}"),
        }
    }
}

/// All slow classes: control handlers plus the ordered MO list.
fn slow_classes() -> Vec<&'static str> {
    CONTROL_CLASSES
        .iter()
        .chain(ORDERED_MO_CLASSES.iter())
        .copied()
        .collect()
}
