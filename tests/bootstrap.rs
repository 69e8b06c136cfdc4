//! Bootstrap happy path: snapshot tables, watch pause ordering, and the
//! EPM EOF barrier.

mod common;

use std::time::Duration;

use common::{happy_path_session, wait_for, Harness, MemStore};
use weft::bus::WATCHER_BROADCAST_CHANNEL;
use weft::model::{vpc_domain_id, NodeRole};
use weft::msg::{Msg, WorkType};
use weft::subscriber::FabricState;

fn decode_work(raw: &str) -> weft::msg::WorkMsg {
    match Msg::decode(raw).expect("decodes") {
        Msg::Work(w) => w,
        other => panic!("expected work msg, got {other:?}"),
    }
}

#[tokio::test]
async fn test_bootstrap_happy_path() {
    let harness = Harness::start(happy_path_session(), MemStore::default(), &["w0", "w1"], |_| {})
        .await;
    let sub = &harness.subscriber;
    wait_for("subscriber running", Duration::from_secs(5), || {
        sub.state() == FabricState::Running
    })
    .await;

    // node table: two leaves, one spine, one vpc pseudo-node
    let nodes = harness.store.nodes();
    assert_eq!(nodes.len(), 4);
    let vpc_id = vpc_domain_id(101, 102);
    let by_id: std::collections::HashMap<u32, _> =
        nodes.iter().map(|n| (n.node, n)).collect();
    assert_eq!(by_id[&101].peer, Some(102));
    assert_eq!(by_id[&102].peer, Some(101));
    assert_eq!(by_id[&101].state, "in-service");
    assert_eq!(by_id[&201].role, NodeRole::Spine);
    let vpc = by_id[&vpc_id];
    assert_eq!(vpc.role, NodeRole::Vpc);
    assert_eq!(vpc.addr, "10.0.0.1");
    assert_eq!(vpc.state, "in-service");
    let members: Vec<u32> = vpc.nodes.iter().map(|m| m.node).collect();
    assert_eq!(members, vec![101, 102]);

    // vnid, epg, and subnet tables
    let inner = harness.store.inner.lock().unwrap();
    assert!(inner.vnids.iter().any(|v| v.vnid == 0xE00001));
    let epg = inner
        .epgs
        .iter()
        .find(|e| e.name == "uni/tn-t1/ap-a1/epg-e1")
        .expect("epg row");
    assert_eq!(epg.bd, 0xE00001);
    assert_eq!(inner.subnets.len(), 1);
    assert_eq!(inner.subnets[0].bd, 0xE00001);
    drop(inner);

    // a single watch pause precedes everything else sent to watchers
    let watcher_msgs = harness.bus.published_on(WATCHER_BROADCAST_CHANNEL);
    assert!(!watcher_msgs.is_empty());
    assert_eq!(decode_work(&watcher_msgs[0]).work_type, WorkType::FabricWatchPause);
    let pause_count = watcher_msgs
        .iter()
        .filter(|m| decode_work(m).work_type == WorkType::FabricWatchPause)
        .count();
    assert_eq!(pause_count, 1);

    // one EOF marker per worker, on queue 0, first seq on that queue
    for worker in ["w0", "w1"] {
        let q0 = harness.bus.queue(&format!("q0_{worker}"));
        assert_eq!(q0.len(), 1, "queue q0_{worker}");
        let eof = decode_work(&q0[0]);
        assert_eq!(eof.work_type, WorkType::FabricEpmEof);
        assert_eq!(eof.qnum, 0);
        assert_eq!(eof.seq, 1);
    }
    assert_eq!(
        sub.epm_eof_pending(),
        Some(vec!["w0".to_string(), "w1".to_string()])
    );

    // acks from both workers complete the barrier
    harness.ack_epm_eof("w0").await;
    wait_for("first ack registered", Duration::from_secs(5), || {
        sub.epm_eof_pending() == Some(vec!["w1".to_string()])
    })
    .await;
    harness.ack_epm_eof("w1").await;
    wait_for("barrier complete", Duration::from_secs(5), || {
        sub.epm_eof_pending().is_none()
    })
    .await;
    let resume_count = || {
        harness
            .bus
            .published_on(WATCHER_BROADCAST_CHANNEL)
            .iter()
            .filter(|m| decode_work(m).work_type == WorkType::FabricWatchResume)
            .count()
    };
    wait_for("resume broadcast", Duration::from_secs(5), || resume_count() == 1).await;
    wait_for("running event", Duration::from_secs(5), || {
        harness.store.event_count("running") >= 1
    })
    .await;
    assert_eq!(resume_count(), 1);

    harness.task.abort();
}

#[tokio::test]
async fn test_bootstrap_pauses_slow_interests_when_queueing() {
    let harness = Harness::start(happy_path_session(), MemStore::default(), &["w0"], |_| {}).await;
    wait_for("subscriber running", Duration::from_secs(5), || {
        harness.subscriber.state() == FabricState::Running
    })
    .await;

    // queue_init_events defaults on, so slow classes were paused before
    // the subscription started, and epm interests were added paused
    let paused = harness.subs.paused.lock().unwrap().clone();
    assert!(paused.iter().any(|c| c == "fvBD"));
    assert!(paused.iter().any(|c| c == "fabricNode"));
    let interests = harness.subs.interests.lock().unwrap().clone();
    assert!(interests.contains(&("epmIpEp".to_string(), true)));

    // and resumed afterwards
    let resumed = harness.subs.resumed.lock().unwrap().clone();
    assert!(resumed.iter().any(|c| c == "fvBD"));
    assert!(resumed.iter().any(|c| c == "epmIpEp"));

    harness.task.abort();
}

#[tokio::test]
async fn test_unsupported_version_fails_validation() {
    let session = happy_path_session();
    session.set_class(
        "firmwareCtrlrRunning",
        vec![common::imdata(
            "firmwareCtrlrRunning",
            serde_json::json!({"dn": "topology/pod-1/node-1/sys/ctrlrfwstatuscont/ctrlrrunning",
                   "version": "2.1(3h)"}),
        )],
    );
    let harness = Harness::start(session, MemStore::default(), &["w0"], |_| {}).await;
    let result = harness.task.await.expect("task joins");
    assert!(result.is_ok());
    assert_eq!(harness.subscriber.state(), FabricState::Terminated);
    assert!(harness
        .store
        .events()
        .iter()
        .any(|(s, d)| s == "failed" && d.contains("unsupported controller version")));
    assert_eq!(harness.store.inner.lock().unwrap().auto_start, Some(false));
}
