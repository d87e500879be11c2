//! A snapshot of a Raft node's observable state.

use serde::Deserialize;
use serde::Serialize;

use crate::core::State;
use crate::raft::ClusterConfig;
use crate::NodeId;

/// A point-in-time view of a node, returned by
/// [`RaftNode::metrics`](crate::RaftNode::metrics).
///
/// Values are copied out of the node; holding a `RaftMetrics` does not pin
/// the node's state in any way.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RaftMetrics {
    /// This node's ID.
    pub id: NodeId,
    /// This node's current role.
    pub state: State,
    /// The current term.
    pub current_term: u64,
    /// The index of the last entry in the log.
    pub last_log_index: u64,
    /// The highest log index known to be committed.
    pub commit_index: u64,
    /// The highest log index applied to the state machine.
    pub last_applied: u64,
    /// The ID of the current leader, if known.
    pub current_leader: Option<NodeId>,
    /// The cluster's current membership configuration.
    pub membership: ClusterConfig,
    /// The last log index covered by the current snapshot, 0 when none.
    pub snapshot_last_index: u64,
}
