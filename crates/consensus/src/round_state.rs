//! Per-height mutable consensus state.
//!
//! A [`RoundState`] is owned by the single event-loop task; all mutation
//! happens there. It tracks the current (round, step), the proposal under
//! consideration, the lock and valid-block bookkeeping, the own-proposal
//! candidate, and the per-round vote sets.
//!
//! Invariants maintained here:
//! - `locked_round == -1` iff `locked_block` is `None`
//! - `valid_round` is non-decreasing within a height (except the round-0
//!   reset) and never exceeds the current round
//! - (round, step) only advances; a higher round resets the step and
//!   clears the received proposal

use crate::message::Message;
use crate::types::{MsgCode, Proposal, Step, View, Vote};
use crate::validator::ValidatorSet;
use crate::vote_set::VoteSet;
use crate::errors::Result;
use ember_types::Block;
use std::collections::HashMap;
use std::time::Instant;
use tracing::debug;

/// Mutable consensus state for one height.
#[derive(Debug)]
pub struct RoundState {
    block_number: u64,
    round: i64,
    step: Step,

    proposal_received: Option<Proposal>,

    locked_round: i64,
    locked_block: Option<Block>,
    valid_round: i64,
    valid_block: Option<Block>,

    /// Own proposal candidate, supplied by the chain backend
    block: Option<Block>,

    prevotes: HashMap<i64, VoteSet>,
    precommits: HashMap<i64, VoteSet>,

    start_time: Instant,
}

impl RoundState {
    /// Fresh state for a height: round 0, step `NewHeight`, nothing locked.
    pub fn new(block_number: u64) -> Self {
        Self {
            block_number,
            round: 0,
            step: Step::NewHeight,
            proposal_received: None,
            locked_round: -1,
            locked_block: None,
            valid_round: -1,
            valid_block: None,
            block: None,
            prevotes: HashMap::new(),
            precommits: HashMap::new(),
            start_time: Instant::now(),
        }
    }

    /// The height this state tracks.
    #[inline]
    pub fn block_number(&self) -> u64 {
        self.block_number
    }

    /// The current round.
    #[inline]
    pub fn round(&self) -> i64 {
        self.round
    }

    /// The current step.
    #[inline]
    pub fn step(&self) -> Step {
        self.step
    }

    /// The current (height, round) view.
    pub fn view(&self) -> View {
        View {
            block_number: self.block_number,
            round: self.round,
        }
    }

    /// When this height started.
    pub fn start_time(&self) -> Instant {
        self.start_time
    }

    /// Advance to (round, step).
    ///
    /// Moving to a higher round resets the step to the given one and
    /// clears the received proposal (at most one proposal is admitted per
    /// round). Within the current round only forward step moves are
    /// applied; anything else is ignored.
    pub fn update_round_step(&mut self, round: i64, step: Step) {
        if round > self.round {
            debug!(
                block_number = self.block_number,
                from_round = self.round,
                to_round = round,
                step = %step,
                "advancing round"
            );
            self.round = round;
            self.step = step;
            self.proposal_received = None;
        } else if round == self.round && step > self.step {
            self.step = step;
        }
    }

    /// The proposal admitted for the current round, if any.
    pub fn proposal_received(&self) -> Option<&Proposal> {
        self.proposal_received.as_ref()
    }

    /// Record the round's proposal, or clear it with `None`.
    ///
    /// Setting a proposal is first-wins: a second `Some` while one is
    /// already held is ignored. `None` always clears (used when a +2/3
    /// prevote majority lands on a hash we do not hold).
    pub fn set_proposal_received(&mut self, proposal: Option<Proposal>) {
        match proposal {
            Some(p) => {
                if self.proposal_received.is_none() {
                    self.proposal_received = Some(p);
                }
            }
            None => self.proposal_received = None,
        }
    }

    /// The round we locked in, `-1` when unlocked.
    #[inline]
    pub fn locked_round(&self) -> i64 {
        self.locked_round
    }

    /// The locked block, if any.
    pub fn locked_block(&self) -> Option<&Block> {
        self.locked_block.as_ref()
    }

    /// Lock onto `block` at `round`.
    pub fn lock(&mut self, round: i64, block: Block) {
        debug!(
            block_number = self.block_number,
            round = round,
            block_hash = %block.hash(),
            "locking on block"
        );
        self.locked_round = round;
        self.locked_block = Some(block);
    }

    /// Clear the lock.
    pub fn unlock(&mut self) {
        if self.locked_round != -1 {
            debug!(
                block_number = self.block_number,
                locked_round = self.locked_round,
                "unlocking"
            );
        }
        self.locked_round = -1;
        self.locked_block = None;
    }

    /// The round of the latest observed valid block, `-1` when none.
    #[inline]
    pub fn valid_round(&self) -> i64 {
        self.valid_round
    }

    /// The latest observed valid block, if any.
    pub fn valid_block(&self) -> Option<&Block> {
        self.valid_block.as_ref()
    }

    /// Record the latest valid (round, block).
    ///
    /// `(-1, None)` is the reset used when entering round 0 of a height;
    /// otherwise `valid_round` only moves forward.
    pub fn set_valid_round_and_block(&mut self, round: i64, block: Option<Block>) {
        if round == -1 && block.is_none() {
            self.valid_round = -1;
            self.valid_block = None;
            return;
        }
        if round < self.valid_round {
            return;
        }
        self.valid_round = round;
        self.valid_block = block;
    }

    /// The own-proposal candidate obtained from the chain backend.
    pub fn block(&self) -> Option<&Block> {
        self.block.as_ref()
    }

    /// Set the own-proposal candidate.
    pub fn set_block(&mut self, block: Block) {
        self.block = Some(block);
    }

    /// Admit a prevote, creating the round's vote set on first use.
    pub fn add_prevote(&mut self, msg: &Message, vote: &Vote, val_set: &ValidatorSet) -> Result<bool> {
        let block_number = self.block_number;
        self.prevotes
            .entry(vote.round)
            .or_insert_with(|| VoteSet::new(block_number, vote.round, MsgCode::Prevote, val_set.clone()))
            .add(msg, vote)
    }

    /// Admit a precommit, creating the round's vote set on first use.
    pub fn add_precommit(&mut self, msg: &Message, vote: &Vote, val_set: &ValidatorSet) -> Result<bool> {
        let block_number = self.block_number;
        self.precommits
            .entry(vote.round)
            .or_insert_with(|| VoteSet::new(block_number, vote.round, MsgCode::Precommit, val_set.clone()))
            .add(msg, vote)
    }

    /// The prevote set of a round, if any vote arrived for it.
    pub fn get_prevotes(&self, round: i64) -> Option<&VoteSet> {
        self.prevotes.get(&round)
    }

    /// The precommit set of a round, if any vote arrived for it.
    pub fn get_precommits(&self, round: i64) -> Option<&VoteSet> {
        self.precommits.get(&round)
    }

    /// Whether the round's proposal is complete.
    ///
    /// A proposal with no Proof-of-Lock round is complete on its own; one
    /// carrying `pol_round >= 0` is complete once the prevotes of that
    /// round show a +2/3 majority.
    pub fn is_proposal_complete(&self) -> bool {
        match &self.proposal_received {
            None => false,
            Some(p) if p.pol_round == -1 => true,
            Some(p) => self
                .prevotes
                .get(&p.pol_round)
                .is_some_and(|votes| votes.two_thirds_majority().is_some()),
        }
    }
}
