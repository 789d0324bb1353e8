//! Consensus configuration.
//!
//! Timeouts grow linearly with the round number: `base + delta * round`.
//! The defaults give a proposer three seconds before replicas prevote nil,
//! and one second of grace in each of the two vote-collection waits.

use crate::types::Step;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default number of blocks per epoch; validator sets are read from the
/// checkpoint header at `height - (height % epoch)`.
pub const DEFAULT_EPOCH: u64 = 30_000;

/// Proposer election policy.
///
/// Only round-robin is implemented; the knob exists so the wire/config
/// surface does not change when other policies are added.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProposerPolicy {
    /// Rotate the proposer by round offset within the ordered set
    #[default]
    RoundRobin,
}

/// Configuration for the consensus core
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base duration of the propose step
    pub propose_base: Duration,
    /// Additional propose duration per round
    pub propose_delta: Duration,

    /// Base duration of the prevote wait
    pub prevote_base: Duration,
    /// Additional prevote wait duration per round
    pub prevote_delta: Duration,

    /// Base duration of the precommit wait
    pub precommit_base: Duration,
    /// Additional precommit wait duration per round
    pub precommit_delta: Duration,

    /// Number of blocks per epoch (checkpoint spacing)
    pub epoch: u64,

    /// Minimum spacing between blocks, in seconds
    pub block_period: u64,

    /// Proposer election policy
    pub proposer_policy: ProposerPolicy,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            propose_base: Duration::from_secs(3),
            propose_delta: Duration::from_millis(500),
            prevote_base: Duration::from_secs(1),
            prevote_delta: Duration::from_millis(500),
            precommit_base: Duration::from_secs(1),
            precommit_delta: Duration::from_millis(500),
            epoch: DEFAULT_EPOCH,
            block_period: 1,
            proposer_policy: ProposerPolicy::RoundRobin,
        }
    }
}

impl Config {
    /// A configuration with short timeouts for tests.
    pub fn fast() -> Self {
        Self {
            propose_base: Duration::from_millis(100),
            propose_delta: Duration::from_millis(50),
            prevote_base: Duration::from_millis(100),
            prevote_delta: Duration::from_millis(50),
            precommit_base: Duration::from_millis(100),
            precommit_delta: Duration::from_millis(50),
            epoch: 100,
            block_period: 0,
            proposer_policy: ProposerPolicy::RoundRobin,
        }
    }

    /// Propose timeout for the given round: `base + delta * round`.
    pub fn propose_timeout(&self, round: i64) -> Duration {
        Self::scaled(self.propose_base, self.propose_delta, round)
    }

    /// Prevote-wait timeout for the given round.
    pub fn prevote_timeout(&self, round: i64) -> Duration {
        Self::scaled(self.prevote_base, self.prevote_delta, round)
    }

    /// Precommit-wait timeout for the given round.
    pub fn precommit_timeout(&self, round: i64) -> Duration {
        Self::scaled(self.precommit_base, self.precommit_delta, round)
    }

    /// Timeout duration for a waiting step at the given round.
    ///
    /// Steps without an associated timer return `None`.
    pub fn timeout_for(&self, step: Step, round: i64) -> Option<Duration> {
        match step {
            Step::Propose => Some(self.propose_timeout(round)),
            Step::PrevoteWait => Some(self.prevote_timeout(round)),
            Step::PrecommitWait => Some(self.precommit_timeout(round)),
            _ => None,
        }
    }

    fn scaled(base: Duration, delta: Duration, round: i64) -> Duration {
        let round = round.max(0) as u32;
        base.saturating_add(delta.saturating_mul(round))
    }
}
