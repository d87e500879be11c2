use anyhow::Result;
use pretty_assertions::assert_eq;
use tickraft::State;

use fixtures::Cluster;

mod fixtures;

/// Partition heal.
///
/// What does this test do?
///
/// - elects node 0 leader of a five-node cluster and commits a command.
/// - isolates node 0, which keeps believing it leads term 1 and accepts a
///   proposal that can never commit.
/// - the majority side elects node 1 in a higher term and commits through
///   it.
/// - reconnects node 0 and asserts it steps down, adopts the higher term,
///   discards its divergent entry, and the cluster ends with exactly one
///   leader and one history.
#[test]
fn partition_heal_single_leader() -> Result<()> {
    fixtures::init_tracing();

    let mut cluster = Cluster::new(&[0, 1, 2, 3, 4]);
    cluster.start_all();
    cluster.elect(0);
    let original_term = cluster.node(0).current_term();

    cluster.propose(0, b"c1");
    cluster.heartbeat(0);

    // Cut the leader off. It still thinks it leads and takes a proposal
    // that will only ever live in its own log.
    cluster.isolate(0);
    cluster.node_mut(0).propose(b"lost".to_vec())?;
    assert_eq!(cluster.node(0).commit_index(), 1);

    // The majority moves on without it.
    cluster.elect(1);
    assert!(cluster.node(1).current_term() > original_term);
    cluster.propose(1, b"c2");
    cluster.heartbeat(1);

    // Heal the partition; the next heartbeat demotes the stale leader.
    cluster.drop_in_flight();
    cluster.restore(0);
    cluster.heartbeat(1);

    assert_eq!(cluster.node(0).state(), State::Follower);
    assert!(cluster.node(0).current_term() > original_term);
    assert_eq!(cluster.leader(), Some(1));

    // The divergent entry is gone; every node applied the same history.
    cluster.heartbeat(1);
    cluster.assert_applied(&[b"c1", b"c2"]);
    assert_eq!(cluster.node(0).last_log_index(), cluster.node(1).last_log_index());
    Ok(())
}
