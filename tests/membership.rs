use anyhow::Result;
use maplit::btreeset;
use pretty_assertions::assert_eq;
use tickraft::RaftError;
use tickraft::State;

use fixtures::Cluster;

mod fixtures;

/// Single-step member addition.
///
/// What does this test do?
///
/// - elects node 0 over `{0, 1, 2}` and commits one command.
/// - proposes adding node 3 (which was started knowing the full member
///   set) and asserts further changes are rejected while it is pending.
/// - asserts the config entry commits under the enlarged quorum, every
///   node ends with members `{0, 1, 2, 3}`, and the new node both catches
///   up on history and receives new commands.
#[test]
fn add_node_single_step() -> Result<()> {
    fixtures::init_tracing();

    let mut cluster = Cluster::new_custom(
        &[
            (0, btreeset![0, 1, 2]),
            (1, btreeset![0, 1, 2]),
            (2, btreeset![0, 1, 2]),
            (3, btreeset![0, 1, 2, 3]),
        ],
        |_, builder| builder,
    );
    cluster.start_all();
    cluster.elect(0);
    cluster.propose(0, b"c1");
    cluster.heartbeat(0);

    cluster.node_mut(0).add_node(3)?;

    // Exactly one change may be in flight.
    match cluster.node_mut(0).remove_node(1) {
        Err(RaftError::ChangeInProgress) => {}
        other => panic!("expected change-in-progress, got {:?}", other.map(|_| ())),
    }

    cluster.deliver_all();
    cluster.heartbeat(0);
    cluster.heartbeat(0);

    for id in 0..=3 {
        let membership = cluster.node(id).metrics().membership;
        assert_eq!(membership.members, btreeset![0, 1, 2, 3], "node {} membership", id);
        assert!(membership.pending.is_none(), "node {} still pending", id);
    }

    // The joiner holds the full history and keeps up with new commands.
    cluster.propose(0, b"c2");
    cluster.heartbeat(0);
    cluster.heartbeat(0);
    cluster.assert_applied(&[b"c1", b"c2"]);

    // With the change applied, the next change is accepted again.
    cluster.node_mut(0).remove_node(1)?;
    Ok(())
}

/// Removing a node shrinks the quorum once the entry applies; a leader
/// that removes itself steps down after applying the entry.
#[test]
fn remove_node_and_leader_self_removal() -> Result<()> {
    fixtures::init_tracing();

    let mut cluster = Cluster::new(&[0, 1, 2]);
    cluster.start_all();
    cluster.elect(0);
    cluster.propose(0, b"c1");
    cluster.heartbeat(0);

    // Removing an unknown node is an error.
    match cluster.node_mut(0).remove_node(9) {
        Err(RaftError::NotFound) => {}
        other => panic!("expected not-found, got {:?}", other.map(|_| ())),
    }

    cluster.node_mut(0).remove_node(2)?;
    cluster.deliver_all();
    cluster.heartbeat(0);

    assert_eq!(cluster.node(0).metrics().membership.members, btreeset![0, 1]);
    assert_eq!(cluster.node(1).metrics().membership.members, btreeset![0, 1]);

    // The leader writes itself out of the cluster and steps down when the
    // entry applies.
    cluster.node_mut(0).remove_node(0)?;
    cluster.deliver_all();
    assert_eq!(cluster.node(0).state(), State::Follower);

    // The survivor finishes the change and carries on alone.
    cluster.elect(1);
    cluster.heartbeat(1);
    assert_eq!(cluster.node(1).metrics().membership.members, btreeset![1]);
    cluster.node_mut(1).propose(b"c2".to_vec())?;
    assert_eq!(cluster.node(1).commit_index(), cluster.node(1).last_log_index());
    Ok(())
}
