//! Vote accumulation and quorum detection.
//!
//! A [`VoteSet`] collects the prevotes or precommits of one
//! (height, round) and answers the two questions the state machine asks:
//! is there a +2/3 majority on a single hash, and have +2/3 of the
//! validators voted at all. Voting is unweighted, so both are plain
//! counts against `quorum = 2f + 1`.
//!
//! The set owns a copy of the height's validator set: membership checks
//! never reach through shared references, and the set stays valid for the
//! whole height.

use crate::errors::{ConsensusError, Result};
use crate::message::{Message, MessageSet};
use crate::types::{MsgCode, Vote};
use crate::validator::ValidatorSet;
use ember_types::{Address, H256};
use std::collections::HashMap;
use tracing::trace;

/// Accumulator for the votes of one (height, round, kind).
#[derive(Debug)]
pub struct VoteSet {
    block_number: u64,
    round: i64,
    code: MsgCode,
    val_set: ValidatorSet,
    votes: HashMap<Address, Vote>,
    count_by_hash: HashMap<H256, usize>,
    messages: MessageSet,
}

impl VoteSet {
    /// Create an empty vote set for the given (height, round, kind).
    pub fn new(block_number: u64, round: i64, code: MsgCode, val_set: ValidatorSet) -> Self {
        Self {
            block_number,
            round,
            code,
            val_set,
            votes: HashMap::new(),
            count_by_hash: HashMap::new(),
            messages: MessageSet::new(),
        }
    }

    /// The height this set accumulates for.
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// The round this set accumulates for.
    pub fn round(&self) -> i64 {
        self.round
    }

    /// The vote kind (prevote or precommit) held in this set.
    pub fn code(&self) -> MsgCode {
        self.code
    }

    /// Admit a vote carried by `msg`.
    ///
    /// Returns `Ok(true)` when the vote was newly recorded, `Ok(false)`
    /// for an identical duplicate (same sender, same hash). A second vote
    /// from the same sender for a *different* hash is surfaced as
    /// [`ConsensusError::Equivocation`]; the first vote stays recorded and
    /// the counters are unchanged. Senders outside the validator set are
    /// rejected with [`ConsensusError::InvalidValidatorAddress`].
    pub fn add(&mut self, msg: &Message, vote: &Vote) -> Result<bool> {
        if !self.val_set.contains(&msg.address) {
            return Err(ConsensusError::InvalidValidatorAddress);
        }

        if let Some(prev) = self.votes.get(&msg.address) {
            if prev.block_hash != vote.block_hash {
                return Err(ConsensusError::Equivocation {
                    sender: msg.address,
                });
            }
            return Ok(false);
        }

        trace!(
            block_number = self.block_number,
            round = self.round,
            code = %self.code,
            from = %msg.address,
            vote = %vote,
            "recording vote"
        );

        self.messages.add(msg.clone());
        self.votes.insert(msg.address, *vote);
        *self.count_by_hash.entry(vote.block_hash).or_default() += 1;
        Ok(true)
    }

    /// The unique hash holding at least `2f + 1` votes, if any.
    ///
    /// Uniqueness follows from `quorum > n/2`: two hashes cannot both
    /// reach it.
    pub fn two_thirds_majority(&self) -> Option<H256> {
        let quorum = self.val_set.quorum();
        self.count_by_hash
            .iter()
            .find(|(_, count)| **count >= quorum)
            .map(|(hash, _)| *hash)
    }

    /// Whether at least `2f + 1` distinct validators voted, on any hashes.
    pub fn has_two_thirds_any(&self) -> bool {
        self.votes.len() >= self.val_set.quorum()
    }

    /// Number of votes recorded for a specific hash.
    pub fn count_for(&self, hash: &H256) -> usize {
        self.count_by_hash.get(hash).copied().unwrap_or(0)
    }

    /// Total number of distinct voters.
    pub fn len(&self) -> usize {
        self.votes.len()
    }

    /// Whether no votes were recorded yet.
    pub fn is_empty(&self) -> bool {
        self.votes.is_empty()
    }

    /// The recorded vote of a specific validator.
    pub fn get_vote(&self, address: &Address) -> Option<&Vote> {
        self.votes.get(address)
    }

    /// The stored message of a specific voter (for re-gossip or evidence).
    pub fn get_message(&self, address: &Address) -> Option<Message> {
        self.messages.get(address)
    }
}
