//! Hash partitioning, bulking, and per-queue sequencing.

mod common;

use std::sync::Arc;

use common::MemBus;
use weft::dispatch::{ActiveWorkerTable, Dispatcher, TrackedWorker};
use weft::msg::{msg_hash, Msg, Role, WorkMsg, WorkType};

fn single_queue_workers(count: usize) -> ActiveWorkerTable {
    ActiveWorkerTable::new(
        (0..count)
            .map(|i| TrackedWorker::new(format!("w{i}"), Role::Worker, vec![format!("q0_w{i}")]))
            .collect(),
    )
}

fn endpoint_msg(vnid: u32, addr: &str) -> WorkMsg {
    let mut m = WorkMsg::new(addr, Some(Role::Worker), WorkType::EpmIpEvent);
    m.vnid = vnid;
    m
}

#[tokio::test]
async fn test_identical_keys_land_on_one_worker_in_two_bulks() {
    let bus = Arc::new(MemBus::default());
    let dispatcher = Dispatcher::new("fab1", bus.clone(), single_queue_workers(3), 20);

    let vnid = 0xE00001;
    let addr = "10.1.1.101";
    let msgs: Vec<WorkMsg> = (0..25).map(|_| endpoint_msg(vnid, addr)).collect();
    dispatcher.send(msgs, false).await;

    let expected_worker = msg_hash(vnid, addr) as usize % 3;
    let expected_queue = format!("q0_w{expected_worker}");
    for i in 0..3 {
        let queue = format!("q0_w{i}");
        let len = bus.queue(&queue).len();
        if queue == expected_queue {
            assert_eq!(len, 2, "two outbound bulks on the owning queue");
        } else {
            assert_eq!(len, 0, "nothing on {queue}");
        }
    }

    let payloads = bus.queue(&expected_queue);
    let mut inner_seqs = Vec::new();
    let mut sizes = Vec::new();
    for raw in &payloads {
        match Msg::decode(raw).unwrap() {
            Msg::Bulk(b) => {
                assert_eq!(b.seq, b.msgs.last().unwrap().seq);
                sizes.push(b.msgs.len());
                for m in &b.msgs {
                    // qnum clamped onto the worker's only queue
                    assert_eq!(m.qnum, 0);
                    inner_seqs.push(m.seq);
                }
            }
            other => panic!("expected bulk, got {other:?}"),
        }
    }
    assert_eq!(sizes, vec![20, 5]);
    assert_eq!(inner_seqs, (1..=25).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_seq_is_gap_free_across_sends() {
    let bus = Arc::new(MemBus::default());
    let dispatcher = Dispatcher::new("fab1", bus.clone(), single_queue_workers(1), 10);

    for _ in 0..4 {
        dispatcher
            .send((0..7).map(|_| endpoint_msg(5, "aa:bb")).collect(), false)
            .await;
    }

    let mut seqs = Vec::new();
    for raw in bus.queue("q0_w0") {
        match Msg::decode(&raw).unwrap() {
            Msg::Bulk(b) => seqs.extend(b.msgs.iter().map(|m| m.seq)),
            Msg::Work(w) => seqs.push(w.seq),
            other => panic!("unexpected msg: {other:?}"),
        }
    }
    assert_eq!(seqs, (1..=28).collect::<Vec<u64>>());
}

#[tokio::test]
async fn test_routing_stable_across_dispatchers() {
    // same worker table, same message: two dispatcher instances agree
    let bus1 = Arc::new(MemBus::default());
    let bus2 = Arc::new(MemBus::default());
    let d1 = Dispatcher::new("fab1", bus1.clone(), single_queue_workers(5), 20);
    let d2 = Dispatcher::new("fab1", bus2.clone(), single_queue_workers(5), 20);

    d1.send(vec![endpoint_msg(77, "de:ad:be:ef:00:01")], false).await;
    d2.send(vec![endpoint_msg(77, "de:ad:be:ef:00:01")], false).await;

    let landed = |bus: &MemBus| -> String {
        (0..5)
            .map(|i| format!("q0_w{i}"))
            .find(|q| !bus.queue(q).is_empty())
            .expect("message landed")
    };
    assert_eq!(landed(&bus1), landed(&bus2));
}

#[tokio::test]
async fn test_prepend_head_inserts() {
    let bus = Arc::new(MemBus::default());
    let dispatcher = Dispatcher::new("fab1", bus.clone(), single_queue_workers(1), 20);

    dispatcher.send(vec![endpoint_msg(1, "a")], false).await;
    dispatcher.send(vec![endpoint_msg(1, "a")], true).await;

    let payloads = bus.queue("q0_w0");
    assert_eq!(payloads.len(), 2);
    // the prepended message (seq 2) sits at the head
    match Msg::decode(&payloads[0]).unwrap() {
        Msg::Work(w) => assert_eq!(w.seq, 2),
        other => panic!("unexpected msg: {other:?}"),
    }
}
