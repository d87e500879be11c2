use std::sync::Arc;
use std::sync::Mutex;

use pretty_assertions::assert_eq;
use tickraft::RaftError;
use tickraft::RaftResult;

use fixtures::Cluster;

mod fixtures;

type ReadSlot = Arc<Mutex<Option<RaftResult<u64>>>>;

fn slot() -> ReadSlot {
    Arc::new(Mutex::new(None))
}

fn capture(slot: &ReadSlot) -> impl FnOnce(RaftResult<u64>) + Send + 'static {
    let slot = slot.clone();
    move |res| *slot.lock().unwrap() = Some(res)
}

/// A linearizable read completes only after a majority confirms the
/// leader, pinned at the commit index it was accepted at.
#[test]
fn read_completes_with_majority_acks() {
    fixtures::init_tracing();

    let mut cluster = Cluster::new(&[0, 1, 2]);
    cluster.start_all();
    cluster.elect(0);
    cluster.propose(0, b"c1");

    let result = slot();
    cluster.node_mut(0).read_index(capture(&result));

    // The heartbeat round is still on the bus; nothing confirmed yet.
    assert!(result.lock().unwrap().is_none());

    cluster.deliver_all();
    match result.lock().unwrap().take() {
        Some(Ok(index)) => assert_eq!(index, 1),
        other => panic!("expected read at index 1, got {:?}", other),
    };
}

/// Reads on a single-node cluster complete inline.
#[test]
fn single_node_read_completes_immediately() {
    fixtures::init_tracing();

    let mut cluster = Cluster::new(&[3]);
    cluster.start_all();
    cluster.propose(3, b"c1");

    let result = slot();
    cluster.node_mut(3).read_index(capture(&result));
    match result.lock().unwrap().take() {
        Some(Ok(index)) => assert_eq!(index, 1),
        other => panic!("expected read at index 1, got {:?}", other),
    };
}

/// Reads on a follower fail immediately with the leader hint.
#[test]
fn follower_read_rejected() {
    fixtures::init_tracing();

    let mut cluster = Cluster::new(&[0, 1, 2]);
    cluster.start_all();
    cluster.elect(0);

    let result = slot();
    cluster.node_mut(1).read_index(capture(&result));
    match result.lock().unwrap().take() {
        Some(Err(RaftError::NotLeader { leader_hint })) => assert_eq!(leader_hint, Some(0)),
        other => panic!("expected not-leader, got {:?}", other),
    };
}

/// A pending read is cancelled with `NotLeader` when the node is deposed
/// before gathering its majority.
#[test]
fn read_cancelled_on_leadership_loss() {
    fixtures::init_tracing();

    let mut cluster = Cluster::new(&[0, 1, 2]);
    cluster.start_all();
    cluster.elect(0);

    // The confirmation round is lost to a partition.
    cluster.isolate(0);
    let result = slot();
    cluster.node_mut(0).read_index(capture(&result));
    cluster.deliver_all();
    assert!(result.lock().unwrap().is_none());

    // A new leader rises; its heartbeat deposes the old one.
    cluster.elect(1);
    cluster.drop_in_flight();
    cluster.restore(0);
    cluster.heartbeat(1);

    assert!(!cluster.node(0).state().is_leader());
    match result.lock().unwrap().take() {
        Some(Err(RaftError::NotLeader { .. })) => {}
        other => panic!("expected not-leader, got {:?}", other),
    };
}
