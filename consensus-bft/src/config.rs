//! Consensus timing and resource configuration.
//!
//! Timeouts are in milliseconds. Round-dependent timeouts grow linearly with
//! the round so that a slow network eventually gets enough time to converge.

use {
    kestrel_chain_store::BlockLimits,
    kestrel_types::BLOCK_PART_SIZE_BYTES,
    serde::{Deserialize, Serialize},
    std::time::Duration,
};

/// What the state machine does when its own internal message queue is full.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueOverflowPolicy {
    /// Hand the message to a short-lived thread that blocks until there is
    /// room. The message may then be processed after messages queued later.
    #[default]
    SpawnRetry,
    /// Drop the message and log an error.
    DropWithLog,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsensusConfig {
    /// Time to wait for a proposal at round 0.
    pub timeout_propose_ms: u64,
    /// Added to `timeout_propose_ms` per round.
    pub timeout_propose_delta_ms: u64,
    /// Time to wait after seeing +2/3 of any prevotes.
    pub timeout_prevote_ms: u64,
    pub timeout_prevote_delta_ms: u64,
    /// Time to wait after seeing +2/3 of any precommits.
    pub timeout_precommit_ms: u64,
    pub timeout_precommit_delta_ms: u64,
    /// Time to wait after committing before starting the next height, so
    /// that late precommits can still be collected.
    pub timeout_commit_ms: u64,
    /// Start the next height as soon as all precommits are in.
    pub skip_timeout_commit: bool,

    /// Capacity of the peer and internal message queues.
    pub msg_queue_size: usize,
    pub internal_queue_overflow: QueueOverflowPolicy,
    /// Capacity of each event subscriber's queue.
    pub event_queue_size: usize,

    pub block_part_size: usize,
    pub max_txs_per_block: usize,
    pub max_block_size_bytes: usize,
    /// Unexpected future rounds a single peer may make us track.
    pub max_catchup_rounds_per_peer: usize,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        Self {
            timeout_propose_ms: 3000,
            timeout_propose_delta_ms: 500,
            timeout_prevote_ms: 1000,
            timeout_prevote_delta_ms: 500,
            timeout_precommit_ms: 1000,
            timeout_precommit_delta_ms: 500,
            timeout_commit_ms: 1000,
            skip_timeout_commit: false,
            msg_queue_size: 1000,
            internal_queue_overflow: QueueOverflowPolicy::SpawnRetry,
            event_queue_size: 1000,
            block_part_size: BLOCK_PART_SIZE_BYTES,
            max_txs_per_block: 10_000,
            max_block_size_bytes: 21 * 1024 * 1024,
            max_catchup_rounds_per_peer: 2,
        }
    }
}

impl ConsensusConfig {
    /// Short timeouts for tests and local clusters.
    #[cfg(any(test, feature = "dev-context-only-utils"))]
    pub fn dev_default() -> Self {
        Self {
            timeout_propose_ms: 400,
            timeout_propose_delta_ms: 10,
            timeout_prevote_ms: 100,
            timeout_prevote_delta_ms: 10,
            timeout_precommit_ms: 100,
            timeout_precommit_delta_ms: 10,
            timeout_commit_ms: 50,
            ..Self::default()
        }
    }

    pub fn propose(&self, round: i32) -> Duration {
        round_timeout(self.timeout_propose_ms, self.timeout_propose_delta_ms, round)
    }

    pub fn prevote(&self, round: i32) -> Duration {
        round_timeout(self.timeout_prevote_ms, self.timeout_prevote_delta_ms, round)
    }

    pub fn precommit(&self, round: i32) -> Duration {
        round_timeout(
            self.timeout_precommit_ms,
            self.timeout_precommit_delta_ms,
            round,
        )
    }

    /// When the next height may start, given the commit time `t_ms`.
    pub fn commit(&self, t_ms: u64) -> u64 {
        t_ms.saturating_add(self.timeout_commit_ms)
    }

    pub fn block_limits(&self) -> BlockLimits {
        BlockLimits {
            block_part_size: self.block_part_size,
            max_txs_per_block: self.max_txs_per_block,
            max_block_size_bytes: self.max_block_size_bytes,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("timeout_propose_ms", self.timeout_propose_ms),
            ("timeout_prevote_ms", self.timeout_prevote_ms),
            ("timeout_precommit_ms", self.timeout_precommit_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroTimeout(name));
            }
        }
        for (name, value) in [
            ("msg_queue_size", self.msg_queue_size),
            ("event_queue_size", self.event_queue_size),
            ("block_part_size", self.block_part_size),
            ("max_txs_per_block", self.max_txs_per_block),
        ] {
            if value == 0 {
                return Err(ConfigError::ZeroCapacity(name));
            }
        }
        if self.max_block_size_bytes < self.block_part_size {
            return Err(ConfigError::BlockSmallerThanPart {
                max_block_size_bytes: self.max_block_size_bytes,
                block_part_size: self.block_part_size,
            });
        }
        Ok(())
    }
}

fn round_timeout(base_ms: u64, delta_ms: u64, round: i32) -> Duration {
    let round = u64::try_from(round.max(0)).unwrap_or_default();
    Duration::from_millis(base_ms.saturating_add(delta_ms.saturating_mul(round)))
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be > 0")]
    ZeroTimeout(&'static str),
    #[error("{0} must be > 0")]
    ZeroCapacity(&'static str),
    #[error("max_block_size_bytes ({max_block_size_bytes}) is below block_part_size ({block_part_size})")]
    BlockSmallerThanPart {
        max_block_size_bytes: usize,
        block_part_size: usize,
    },
}
