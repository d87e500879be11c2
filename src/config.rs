//! Runtime configuration for a Raft node.

use std::collections::BTreeSet;
use std::path::PathBuf;

use rand::Rng;

use crate::error::ConfigError;
use crate::NodeId;

/// Default minimum election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MIN: u64 = 150;
/// Default maximum election timeout, in milliseconds.
pub const DEFAULT_ELECTION_TIMEOUT_MAX: u64 = 300;
/// Default leader heartbeat interval, in milliseconds.
pub const DEFAULT_HEARTBEAT_INTERVAL: u64 = 50;
/// Default maximum number of entries shipped in one AppendEntries frame.
pub const DEFAULT_MAX_ENTRIES_PER_APPEND: u64 = 64;

/// The runtime configuration of a Raft node.
///
/// Instances are built via [`Config::build`] and are immutable once
/// validated:
///
/// ```ignore
/// let config = Config::build(1, btreeset![1, 2, 3]).validate()?;
/// ```
#[derive(Clone, Debug)]
pub struct Config {
    /// The ID of the node this config belongs to.
    pub node_id: NodeId,
    /// The initial voting members of the cluster, including this node.
    ///
    /// Ignored when the durable directory already holds state; the persisted
    /// log and snapshot are then authoritative for membership.
    pub members: BTreeSet<NodeId>,
    /// The minimum election timeout in milliseconds.
    pub election_timeout_min: u64,
    /// The maximum election timeout in milliseconds.
    pub election_timeout_max: u64,
    /// The leader heartbeat interval in milliseconds.
    pub heartbeat_interval: u64,
    /// The maximum number of entries per AppendEntries frame.
    pub max_entries_per_append: u64,
    /// Take a snapshot and compact the log after this many applied entries.
    ///
    /// `0` disables automatic compaction.
    pub auto_compaction_threshold: u64,
    /// Run the PreVote phase before real elections.
    pub prevote_enabled: bool,
    /// Apply committed entries automatically as the commit index advances.
    ///
    /// When disabled, the host drains committed entries with
    /// [`apply_batch`](crate::RaftNode::apply_batch).
    pub auto_apply: bool,
    /// Fsync durable writes before acknowledging them.
    pub sync_writes: bool,
    /// Directory for the node's durable files; `None` runs fully in memory.
    pub data_dir: Option<PathBuf>,
    /// Seed for the election timer RNG, for deterministic tests.
    pub timer_seed: Option<u64>,
}

impl Config {
    /// Start building a config for node `node_id` in the given cluster.
    pub fn build(node_id: NodeId, members: BTreeSet<NodeId>) -> ConfigBuilder {
        ConfigBuilder {
            node_id,
            members,
            election_timeout_min: None,
            election_timeout_max: None,
            heartbeat_interval: None,
            max_entries_per_append: None,
            auto_compaction_threshold: None,
            prevote_enabled: false,
            auto_apply: true,
            sync_writes: true,
            data_dir: None,
            timer_seed: None,
        }
    }

    /// Draw a new randomized election timeout from the configured range.
    pub(crate) fn new_rand_election_timeout(&self, rng: &mut impl Rng) -> u64 {
        rng.gen_range(self.election_timeout_min..=self.election_timeout_max)
    }
}

/// A builder for [`Config`].
#[derive(Clone, Debug)]
pub struct ConfigBuilder {
    node_id: NodeId,
    members: BTreeSet<NodeId>,
    election_timeout_min: Option<u64>,
    election_timeout_max: Option<u64>,
    heartbeat_interval: Option<u64>,
    max_entries_per_append: Option<u64>,
    auto_compaction_threshold: Option<u64>,
    prevote_enabled: bool,
    auto_apply: bool,
    sync_writes: bool,
    data_dir: Option<PathBuf>,
    timer_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the election timeout range in milliseconds.
    pub fn election_timeout(mut self, min: u64, max: u64) -> Self {
        self.election_timeout_min = Some(min);
        self.election_timeout_max = Some(max);
        self
    }

    /// Set the heartbeat interval in milliseconds.
    pub fn heartbeat_interval(mut self, interval: u64) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    /// Set the maximum number of entries per AppendEntries frame.
    pub fn max_entries_per_append(mut self, max: u64) -> Self {
        self.max_entries_per_append = Some(max);
        self
    }

    /// Snapshot and compact after this many applied entries; `0` disables.
    pub fn auto_compaction_threshold(mut self, threshold: u64) -> Self {
        self.auto_compaction_threshold = Some(threshold);
        self
    }

    /// Enable the PreVote phase.
    pub fn prevote(mut self, enabled: bool) -> Self {
        self.prevote_enabled = enabled;
        self
    }

    /// Enable or disable automatic application of committed entries.
    pub fn auto_apply(mut self, enabled: bool) -> Self {
        self.auto_apply = enabled;
        self
    }

    /// Enable or disable fsync on durable writes.
    pub fn sync_writes(mut self, enabled: bool) -> Self {
        self.sync_writes = enabled;
        self
    }

    /// Set the durable directory.
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Seed the election timer RNG, making timeouts deterministic.
    pub fn timer_seed(mut self, seed: u64) -> Self {
        self.timer_seed = Some(seed);
        self
    }

    /// Validate the accumulated options and produce the final config.
    pub fn validate(self) -> Result<Config, ConfigError> {
        let config = Config {
            node_id: self.node_id,
            members: self.members,
            election_timeout_min: self.election_timeout_min.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MIN),
            election_timeout_max: self.election_timeout_max.unwrap_or(DEFAULT_ELECTION_TIMEOUT_MAX),
            heartbeat_interval: self.heartbeat_interval.unwrap_or(DEFAULT_HEARTBEAT_INTERVAL),
            max_entries_per_append: self.max_entries_per_append.unwrap_or(DEFAULT_MAX_ENTRIES_PER_APPEND),
            auto_compaction_threshold: self.auto_compaction_threshold.unwrap_or(0),
            prevote_enabled: self.prevote_enabled,
            auto_apply: self.auto_apply,
            sync_writes: self.sync_writes,
            data_dir: self.data_dir,
            timer_seed: self.timer_seed,
        };

        if config.members.is_empty() {
            return Err(ConfigError::EmptyMembers);
        }
        if !config.members.contains(&config.node_id) {
            return Err(ConfigError::NodeNotMember);
        }
        if config.election_timeout_min >= config.election_timeout_max {
            return Err(ConfigError::InvalidElectionTimeout);
        }
        if config.heartbeat_interval >= config.election_timeout_min {
            return Err(ConfigError::InvalidHeartbeatInterval);
        }
        if config.max_entries_per_append == 0 {
            return Err(ConfigError::InvalidMaxEntries);
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use maplit::btreeset;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    use super::*;

    #[test]
    fn defaults_validate() {
        let config = Config::build(1, btreeset![1, 2, 3]).validate().unwrap();
        assert_eq!(config.election_timeout_min, DEFAULT_ELECTION_TIMEOUT_MIN);
        assert_eq!(config.election_timeout_max, DEFAULT_ELECTION_TIMEOUT_MAX);
        assert_eq!(config.heartbeat_interval, DEFAULT_HEARTBEAT_INTERVAL);
        assert_eq!(config.max_entries_per_append, DEFAULT_MAX_ENTRIES_PER_APPEND);
        assert_eq!(config.auto_compaction_threshold, 0);
        assert!(!config.prevote_enabled);
        assert!(config.auto_apply);
    }

    #[test]
    fn empty_members_rejected() {
        let res = Config::build(1, btreeset![]).validate();
        assert_eq!(res.unwrap_err(), ConfigError::EmptyMembers);
    }

    #[test]
    fn node_must_be_member() {
        let res = Config::build(4, btreeset![1, 2, 3]).validate();
        assert_eq!(res.unwrap_err(), ConfigError::NodeNotMember);
    }

    #[test]
    fn inverted_election_timeout_rejected() {
        let res = Config::build(1, btreeset![1]).election_timeout(300, 150).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidElectionTimeout);
    }

    #[test]
    fn heartbeat_must_undercut_election_timeout() {
        let res = Config::build(1, btreeset![1]).election_timeout(150, 300).heartbeat_interval(200).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidHeartbeatInterval);
    }

    #[test]
    fn zero_max_entries_rejected() {
        let res = Config::build(1, btreeset![1]).max_entries_per_append(0).validate();
        assert_eq!(res.unwrap_err(), ConfigError::InvalidMaxEntries);
    }

    #[test]
    fn seeded_timeouts_are_deterministic() {
        let config = Config::build(1, btreeset![1, 2, 3]).validate().unwrap();

        let mut a = StdRng::seed_from_u64(42);
        let mut b = StdRng::seed_from_u64(42);
        for _ in 0..16 {
            let ta = config.new_rand_election_timeout(&mut a);
            let tb = config.new_rand_election_timeout(&mut b);
            assert_eq!(ta, tb);
            assert!(ta >= config.election_timeout_min && ta <= config.election_timeout_max);
        }
    }
}
