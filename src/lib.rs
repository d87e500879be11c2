//! A deterministic, tick-driven implementation of the Raft consensus protocol.
//!
//! A [`RaftNode`] is a single passive object: it never spawns threads, never
//! blocks on the network, and performs all disk I/O inline on the calling
//! thread. The hosting application drives it from exactly three event
//! sources:
//!
//! 1. **`tick(elapsed_ms)`** — advances the node's virtual clock, firing
//!    election timeouts and leader heartbeats.
//! 2. **`receive(from, bytes)`** — hands the node a frame delivered by the
//!    transport; any responses are produced through the [`Transport`]
//!    callback.
//! 3. **The local client API** — `propose`, `read_index`,
//!    `transfer_leadership`, `add_node`, `remove_node`.
//!
//! All three mutate the node through `&mut self`, so the single-writer
//! discipline the protocol relies on is enforced by the borrow checker. A
//! process may drive any number of independent nodes, which makes multi-node
//! clusters fully testable in a single thread with seeded timers.
//!
//! Outbound effects are calls to [`Transport::send`], calls to
//! [`StateMachine::apply`], and writes to the node's durable directory (see
//! the [`storage`] module for the on-disk formats).

mod config;
mod core;
pub mod error;
mod log;
mod metrics;
pub mod raft;
pub mod storage;
pub mod wire;

pub use crate::config::Config;
pub use crate::config::ConfigBuilder;
pub use crate::core::State;
pub use crate::error::ConfigError;
pub use crate::error::RaftError;
pub use crate::error::RaftResult;
pub use crate::metrics::RaftMetrics;
pub use crate::raft::ClusterConfig;
pub use crate::raft::Entry;
pub use crate::raft::EntryKind;
pub use crate::raft::RaftNode;
pub use crate::storage::HardState;
pub use crate::storage::SnapshotMeta;

/// A Raft node's ID.
///
/// IDs are persisted in the node's state and config-change entries, so they
/// must be stable across restarts.
pub type NodeId = u32;

/// The interface the node uses to hand frames to the transport.
///
/// `send` must not block: the node calls it inline from its mutating
/// entry-points, and the transport is responsible for its own queuing. The
/// node never assumes delivery — every protocol exchange tolerates dropped,
/// duplicated, and reordered frames.
pub trait Transport {
    /// Hand an encoded frame to the transport for delivery to `target`.
    fn send(&self, target: NodeId, frame: &[u8]);
}

/// The replicated state machine the node applies committed commands to.
///
/// Callbacks are invoked synchronously from within the node's mutating
/// entry-points and must not reenter the node.
pub trait StateMachine {
    /// Apply a committed `Command` entry.
    ///
    /// Invoked exactly once per log index, in index order.
    fn apply(&mut self, entry: &Entry);

    /// Produce opaque bytes representing all state up to `last_applied`.
    ///
    /// Returning `Ok(None)` means the machine does not support snapshots;
    /// automatic log compaction is then disabled for this node.
    fn snapshot(&self) -> RaftResult<Option<Vec<u8>>> {
        Ok(None)
    }

    /// Replace the machine's state with the contents of a snapshot.
    fn restore(&mut self, data: &[u8]) -> RaftResult<()>;
}

/// Callback invoked when a linearizable read is safe, or has been cancelled.
///
/// On success the argument is the read index: the state machine reflects at
/// least that log position and may be read directly.
pub type ReadCallback = Box<dyn FnOnce(RaftResult<u64>) + Send>;

/// A short, single-line summary of a message, for tracing output.
pub trait MessageSummary {
    fn summary(&self) -> String;
}
