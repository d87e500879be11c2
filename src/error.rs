//! Error types exposed by this crate.

use thiserror::Error;

use crate::NodeId;

/// A result whose error variant is [`RaftError`].
pub type RaftResult<T> = std::result::Result<T, RaftError>;

/// Error variants surfaced by the node's public API.
#[derive(Debug, Error)]
pub enum RaftError {
    /// A leader-only operation was attempted on a non-leader.
    ///
    /// This is an expected, common error; `leader_hint` carries the last
    /// known leader so the caller can redirect.
    #[error("not the cluster leader")]
    NotLeader {
        /// The ID of the current leader, if known.
        leader_hint: Option<NodeId>,
    },

    /// The node has been stopped; all mutating operations are rejected.
    #[error("the node has been stopped")]
    Stopped,

    /// The requested file, snapshot, or entry does not exist.
    #[error("not found")]
    NotFound,

    /// The caller violated an API contract.
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    /// An I/O operation failed.
    ///
    /// The node does not advance any in-memory state that the failed call
    /// was supposed to persist.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A CRC, magic, or version check failed.
    ///
    /// On load the node refuses to start rather than serve divergent state.
    #[error("corruption detected: {0}")]
    Corruption(String),

    /// A membership change is already pending.
    #[error("a configuration change is already in progress")]
    ChangeInProgress,

    /// A leadership transfer is already pending.
    #[error("a leadership transfer is already in progress")]
    TransferInProgress,
}

/// Errors produced by [`ConfigBuilder::validate`](crate::ConfigBuilder::validate).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// The initial member set is empty.
    #[error("the initial member set may not be empty")]
    EmptyMembers,

    /// The initial member set does not contain this node's ID.
    #[error("the initial member set must contain this node's id")]
    NodeNotMember,

    /// The minimum election timeout is not less than the maximum.
    #[error("election timeout min must be strictly less than max")]
    InvalidElectionTimeout,

    /// The heartbeat interval does not leave room for the election timeout.
    #[error("heartbeat interval must be less than the minimum election timeout")]
    InvalidHeartbeatInterval,

    /// `max_entries_per_append` is zero.
    #[error("max entries per append must be greater than 0")]
    InvalidMaxEntries,
}
