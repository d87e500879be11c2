use anyhow::Result;
use pretty_assertions::assert_eq;
use tickraft::State;

use fixtures::Cluster;

mod fixtures;

/// Prev-term non-commit (§5.4.2).
///
/// What does this test do?
///
/// - node 0 leads term 1 and replicates one command, but every
///   acknowledgement back to it is lost, so nothing commits.
/// - node 1 wins term 2 holding that uncommitted term-1 entry.
/// - asserts the new leader does not commit the old entry by counting
///   replicas alone: it appends a term-2 no-op, and only when that no-op
///   reaches a majority do both entries commit together.
#[test]
fn prior_term_entries_commit_with_current_term_entry() -> Result<()> {
    fixtures::init_tracing();

    let mut cluster = Cluster::new(&[0, 1, 2]);
    cluster.start_all();
    cluster.elect(0);

    // The command reaches both followers, but the acks never make it back.
    cluster.node_mut(0).propose(b"c1".to_vec())?;
    cluster.deliver_from(0);
    cluster.drop_in_flight();

    assert_eq!(cluster.node(0).commit_index(), 0);
    assert_eq!(cluster.node(1).last_log_index(), 1);
    assert_eq!(cluster.node(1).commit_index(), 0);

    // Node 1 takes over term 2 with the term-1 entry still uncommitted.
    cluster.tick(1, 301);
    assert_eq!(cluster.node(1).state(), State::Candidate);
    assert_eq!(cluster.node(1).current_term(), 2);
    cluster.deliver_all();

    assert_eq!(cluster.node(1).state(), State::Leader);
    // The new leader appended a no-op in its own term on top of the
    // inherited entry, and committing the no-op committed both.
    assert_eq!(cluster.node(1).last_log_index(), 2);
    assert_eq!(cluster.node(1).commit_index(), 2);
    assert_eq!(cluster.node(1).state_machine().applied, vec![(1, b"c1".to_vec())]);

    // The whole cluster converges on exactly one apply of the command.
    cluster.heartbeat(1);
    cluster.heartbeat(1);
    cluster.assert_applied(&[b"c1"]);
    Ok(())
}
