//! The consensus core: state machine, message handlers, and event loop.
//!
//! A single task multiplexes two channels, inbound events (messages and
//! block availability) and fired timeouts, and processes each to
//! completion under one coarse mutex. All state transitions run inside
//! that task; transport sends and commits are offloaded to fire-and-forget
//! tasks so the loop never blocks on I/O.
//!
//! Every `enter_*` transition starts with a staleness guard, which makes
//! the transitions idempotent under duplicate triggers: replaying a
//! message or a timeout cannot move the state backwards.

use crate::backend::Backend;
use crate::config::Config;
use crate::errors::{ConsensusError, Result};
use crate::message::Message;
use crate::round_state::RoundState;
use crate::timeout::{TimeoutInfo, TimeoutScheduler};
use crate::types::{ConsensusEvent, MsgCode, Proposal, Step, View, Vote};
use crate::validator::ValidatorSet;
use ember_types::{Block, H256};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of the timeout delivery channel.
const TIMEOUT_CHANNEL_CAPACITY: usize = 64;

/// A point-in-time view of the core's state, for monitoring and tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreSnapshot {
    /// Current height
    pub block_number: u64,
    /// Current round
    pub round: i64,
    /// Current step
    pub step: Step,
    /// Locked round, `-1` when unlocked
    pub locked_round: i64,
    /// Hash of the locked block, if any
    pub locked_block_hash: Option<H256>,
    /// Valid round, `-1` when none observed
    pub valid_round: i64,
    /// Hash of the admitted proposal's block, if any
    pub proposal_block_hash: Option<H256>,
}

struct Inner {
    state: RoundState,
    val_set: ValidatorSet,
}

struct Shared<B> {
    backend: Arc<B>,
    config: Config,
    timeout: TimeoutScheduler,
    inner: Mutex<Inner>,
}

/// The consensus engine for one validator.
///
/// Public surface: [`Core::start`], [`Core::stop`], and
/// [`Core::set_block_for_proposal`]. Everything else happens through the
/// backend's event channel.
pub struct Core<B: Backend> {
    shared: Arc<Shared<B>>,
    events_rx: Option<mpsc::Receiver<ConsensusEvent>>,
    timeouts_rx: Option<mpsc::Receiver<TimeoutInfo>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl<B: Backend> Core<B> {
    /// Create a core for `block_number`, reading events from `events_rx`.
    ///
    /// The sending half of `events_rx` belongs to the backend: transport
    /// messages, self-broadcasts and block availability all arrive there.
    pub fn new(
        backend: Arc<B>,
        config: Config,
        block_number: u64,
        events_rx: mpsc::Receiver<ConsensusEvent>,
    ) -> Self {
        let (timeout, timeouts_rx) = TimeoutScheduler::new(TIMEOUT_CHANNEL_CAPACITY);
        let shared = Arc::new(Shared {
            backend,
            config,
            timeout,
            inner: Mutex::new(Inner {
                state: RoundState::new(block_number),
                val_set: ValidatorSet::new(Vec::new(), Default::default()),
            }),
        });
        Self {
            shared,
            events_rx: Some(events_rx),
            timeouts_rx: Some(timeouts_rx),
            handle: None,
        }
    }

    /// Start the event loop and enter round zero of the current height.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&mut self) -> Result<()> {
        let events = self
            .events_rx
            .take()
            .ok_or_else(|| ConsensusError::Backend("core already started".into()))?;
        let timeouts = self
            .timeouts_rx
            .take()
            .ok_or_else(|| ConsensusError::Backend("core already started".into()))?;

        {
            let mut inner = self.shared.inner.lock();
            self.shared.start_round_zero(&mut inner);
        }

        let shared = self.shared.clone();
        self.handle = Some(tokio::spawn(run_loop(shared, events, timeouts)));
        Ok(())
    }

    /// Stop the event loop.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }

    /// Force the own-proposal candidate (testing hook).
    pub fn set_block_for_proposal(&self, block: Block) {
        self.shared.inner.lock().state.set_block(block);
    }

    /// The current (height, round) view.
    pub fn current_view(&self) -> View {
        self.shared.inner.lock().state.view()
    }

    /// A snapshot of the current consensus state.
    pub fn snapshot(&self) -> CoreSnapshot {
        let inner = self.shared.inner.lock();
        CoreSnapshot {
            block_number: inner.state.block_number(),
            round: inner.state.round(),
            step: inner.state.step(),
            locked_round: inner.state.locked_round(),
            locked_block_hash: inner.state.locked_block().map(|b| b.hash()),
            valid_round: inner.state.valid_round(),
            proposal_block_hash: inner.state.proposal_received().map(|p| p.block_hash()),
        }
    }
}

impl<B: Backend> Drop for Core<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run_loop<B: Backend>(
    shared: Arc<Shared<B>>,
    mut events: mpsc::Receiver<ConsensusEvent>,
    mut timeouts: mpsc::Receiver<TimeoutInfo>,
) {
    loop {
        tokio::select! {
            maybe_event = events.recv() => match maybe_event {
                Some(event) => shared.process_event(event),
                None => {
                    debug!("event channel closed, stopping core");
                    break;
                }
            },
            maybe_timeout = timeouts.recv() => match maybe_timeout {
                Some(info) => shared.process_timeout(info),
                None => break,
            },
        }
    }
}

impl<B: Backend> Shared<B> {
    fn process_event(&self, event: ConsensusEvent) {
        match event {
            ConsensusEvent::NewBlock(block) => {
                let mut inner = self.inner.lock();
                self.on_new_block(&mut inner, block);
            }
            ConsensusEvent::Message(payload) => {
                let msg = match Message::rlp_decode(&payload) {
                    Ok(msg) => msg,
                    Err(e) => {
                        error!(error = %e, "failed to decode message");
                        return;
                    }
                };
                let mut inner = self.inner.lock();
                match self.handle_msg(&mut inner, msg) {
                    Ok(()) => {}
                    // Normal during network lag; already logged at debug
                    Err(ConsensusError::VoteHeightMismatch) => {}
                    Err(e) => warn!(error = %e, "failed to handle message"),
                }
            }
        }
    }

    fn start_round_zero(&self, inner: &mut Inner) {
        let block_number = inner.state.block_number();
        if inner.val_set.is_empty() {
            match self.backend.validators(block_number) {
                Ok(val_set) => inner.val_set = val_set,
                Err(e) => {
                    error!(block_number, error = %e, "cannot resolve validator set");
                    return;
                }
            }
        }
        if !self.backend.find_peers(&inner.val_set) {
            warn!(block_number, "fewer than f+1 validator peers connected");
        }
        self.enter_new_round(inner, block_number, 0);
    }

    /// A block arrived from the chain backend. At the current height it
    /// becomes the own-proposal candidate; at a later height it starts
    /// that height.
    fn on_new_block(&self, inner: &mut Inner, block: Block) {
        let current = inner.state.block_number();
        let number = block.number();
        if number == current {
            info!(block_number = number, block_hash = %block.hash(), "received proposal candidate");
            inner.state.set_block(block);
        } else if number > current {
            info!(block_number = number, "starting new height");
            match self.backend.validators(number) {
                Ok(val_set) => inner.val_set = val_set,
                Err(e) => {
                    error!(block_number = number, error = %e, "cannot resolve validator set");
                    return;
                }
            }
            inner.state = RoundState::new(number);
            inner.state.set_block(block);
            self.enter_new_round(inner, number, 0);
        } else {
            debug!(block_number = number, current, "ignoring block for a past height");
        }
    }

    fn handle_msg(&self, inner: &mut Inner, msg: Message) -> Result<()> {
        match MsgCode::try_from(msg.code)? {
            MsgCode::Propose => self.handle_propose(inner, msg),
            MsgCode::Prevote => self.handle_prevote(inner, msg),
            MsgCode::Precommit => self.handle_precommit(inner, msg),
        }
    }

    fn verify_proposal(
        &self,
        val_set: &ValidatorSet,
        proposal: &Proposal,
        msg: &Message,
    ) -> Result<()> {
        // POLRound must be -1 or in [0, proposal.round)
        if proposal.pol_round != -1 && !(0..proposal.round).contains(&proposal.pol_round) {
            return Err(ConsensusError::InvalidProposalPOLRound);
        }

        let signer = msg.address_from_signature()?;
        let proposer = val_set.get_proposer()?;
        if proposer.address() != signer {
            return Err(ConsensusError::InvalidProposalSignature);
        }

        if proposal.block_hash().is_nil() {
            return Err(ConsensusError::EmptyBlockProposal);
        }
        Ok(())
    }

    fn handle_propose(&self, inner: &mut Inner, msg: Message) -> Result<()> {
        let proposal: Proposal = rlp::decode(&msg.msg)?;

        // Already have one for this round
        if inner.state.proposal_received().is_some() {
            return Ok(());
        }

        // Not an error, normal during network lag
        if proposal.block.number() != inner.state.block_number()
            || proposal.round != inner.state.round()
        {
            debug!(
                proposal_number = proposal.block.number(),
                proposal_round = proposal.round,
                current = %inner.state.view(),
                "ignoring proposal for a different view"
            );
            return Ok(());
        }

        self.verify_proposal(&inner.val_set, &proposal, &msg)?;

        info!(
            from = %msg.address,
            round = proposal.round,
            pol_round = proposal.pol_round,
            block_hash = %proposal.block_hash(),
            "admitted proposal"
        );
        inner.state.set_proposal_received(Some(proposal));

        if inner.state.step() == Step::Propose && inner.state.is_proposal_complete() {
            let (block_number, round) = (inner.state.block_number(), inner.state.round());
            self.enter_prevote(inner, block_number, round);
        }
        Ok(())
    }

    /// A vote envelope must be signed by the validator it claims to come
    /// from; anything else is dropped before it can touch accounting.
    fn verify_vote_sender(&self, msg: &Message) -> Result<()> {
        let signer = msg.address_from_signature()?;
        if signer != msg.address {
            return Err(ConsensusError::InvalidValidatorAddress);
        }
        Ok(())
    }

    fn handle_prevote(&self, inner: &mut Inner, msg: Message) -> Result<()> {
        let vote: Vote = rlp::decode(&msg.msg)?;
        self.verify_vote_sender(&msg)?;

        if vote.block_number != inner.state.block_number() {
            debug!(
                vote_number = vote.block_number,
                current = inner.state.block_number(),
                "ignoring prevote for a different height"
            );
            return Err(ConsensusError::VoteHeightMismatch);
        }

        let added = match inner.state.add_prevote(&msg, &vote, &inner.val_set) {
            Ok(added) => added,
            Err(ConsensusError::Equivocation { sender }) => {
                self.backend
                    .handle_equivocation(sender, vote.block_number, vote.round, MsgCode::Prevote);
                return Err(ConsensusError::Equivocation { sender });
            }
            Err(e) => return Err(e),
        };
        if !added {
            return Ok(());
        }
        debug!(from = %msg.address, vote = %vote, "added prevote");

        let (majority, two_thirds_any) = {
            let prevotes = inner
                .state
                .get_prevotes(vote.round)
                .expect("prevote set must exist after insertion");
            (prevotes.two_thirds_majority(), prevotes.has_two_thirds_any())
        };

        if let Some(maj_hash) = majority {
            info!(round = vote.round, block_hash = %maj_hash, "+2/3 prevotes on a hash");

            // Unlock on POL: a majority for another block at a later round
            // (but not beyond the current one) releases our lock.
            let locked_round = inner.state.locked_round();
            if locked_round != -1
                && locked_round < vote.round
                && vote.round <= inner.state.round()
                && inner.state.locked_block().map(|b| b.hash()) != Some(maj_hash)
            {
                info!(locked_round, pol_round = vote.round, "unlocking because of POL");
                inner.state.unlock();
            }

            // Track the latest valid block for this height
            if !maj_hash.is_nil()
                && inner.state.valid_round() < vote.round
                && vote.round == inner.state.round()
            {
                let matching = inner
                    .state
                    .proposal_received()
                    .filter(|p| p.block_hash() == maj_hash)
                    .map(|p| p.block.clone());
                match matching {
                    Some(block) => {
                        info!(valid_round = vote.round, "updating valid block because of POL");
                        inner.state.set_valid_round_and_block(vote.round, Some(block));
                    }
                    None => {
                        info!("clearing proposal: +2/3 prevotes on a block we do not have");
                        inner.state.set_proposal_received(None);
                    }
                }
            }
        }

        if msg.address != self.backend.address() {
            self.spawn_gossip(&inner.val_set, msg.rlp_bytes());
        }

        // Transitions; first matching clause wins
        let block_number = inner.state.block_number();
        if inner.state.round() < vote.round && two_thirds_any {
            // Skip ahead to the vote's round
            self.enter_new_round(inner, block_number, vote.round);
        } else if inner.state.round() == vote.round && inner.state.step() >= Step::Prevote {
            if let Some(maj_hash) = majority {
                if inner.state.is_proposal_complete() || maj_hash.is_nil() {
                    self.enter_precommit(inner, block_number, vote.round);
                } else {
                    self.enter_prevote_wait(inner, block_number, vote.round);
                }
            } else if two_thirds_any {
                self.enter_prevote_wait(inner, block_number, vote.round);
            }
        } else if inner
            .state
            .proposal_received()
            .is_some_and(|p| p.pol_round >= 0 && p.pol_round == vote.round)
            && inner.state.is_proposal_complete()
        {
            self.enter_prevote(inner, block_number, vote.round);
        }
        Ok(())
    }

    fn handle_precommit(&self, inner: &mut Inner, msg: Message) -> Result<()> {
        let vote: Vote = rlp::decode(&msg.msg)?;
        self.verify_vote_sender(&msg)?;

        if vote.block_number != inner.state.block_number() {
            debug!(
                vote_number = vote.block_number,
                current = inner.state.block_number(),
                "ignoring precommit for a different height"
            );
            return Err(ConsensusError::VoteHeightMismatch);
        }

        let added = match inner.state.add_precommit(&msg, &vote, &inner.val_set) {
            Ok(added) => added,
            Err(ConsensusError::Equivocation { sender }) => {
                self.backend
                    .handle_equivocation(sender, vote.block_number, vote.round, MsgCode::Precommit);
                return Err(ConsensusError::Equivocation { sender });
            }
            Err(e) => return Err(e),
        };
        if !added {
            return Ok(());
        }
        debug!(from = %msg.address, vote = %vote, "added precommit");

        if msg.address != self.backend.address() {
            self.spawn_gossip(&inner.val_set, msg.rlp_bytes());
        }

        let (majority, two_thirds_any) = {
            let precommits = inner
                .state
                .get_precommits(vote.round)
                .expect("precommit set must exist after insertion");
            (
                precommits.two_thirds_majority(),
                precommits.has_two_thirds_any(),
            )
        };

        let block_number = inner.state.block_number();
        if let Some(maj_hash) = majority {
            info!(round = vote.round, block_hash = %maj_hash, "+2/3 precommits on a hash");
            // Walk the round steps again so a higher vote round updates
            // the state before acting on the majority.
            self.enter_new_round(inner, block_number, vote.round);
            self.enter_precommit(inner, block_number, vote.round);
            if !maj_hash.is_nil() {
                self.enter_commit(inner, block_number, vote.round);
            } else {
                self.enter_precommit_wait(inner, block_number, vote.round);
            }
            return Ok(());
        }

        if inner.state.round() <= vote.round && two_thirds_any {
            self.enter_new_round(inner, block_number, vote.round);
            self.enter_precommit_wait(inner, block_number, vote.round);
        }
        Ok(())
    }

    fn process_timeout(&self, info: TimeoutInfo) {
        let mut inner = self.inner.lock();

        let stale = info.block_number != inner.state.block_number()
            || info.round < inner.state.round()
            || (info.round == inner.state.round() && info.step < inner.state.step());
        if stale {
            debug!(
                timeout_round = info.round,
                timeout_step = %info.step,
                current = %inner.state.view(),
                current_step = %inner.state.step(),
                "ignoring stale timeout"
            );
            return;
        }

        info!(
            block_number = info.block_number,
            round = info.round,
            step = %info.step,
            duration_ms = info.duration.as_millis() as u64,
            "timeout fired"
        );

        let block_number = inner.state.block_number();
        match info.step {
            Step::NewHeight => self.enter_new_round(&mut inner, block_number, 0),
            Step::NewRound => self.enter_propose(&mut inner, block_number, 0),
            Step::Propose => self.enter_prevote(&mut inner, block_number, info.round),
            Step::PrevoteWait => self.enter_precommit(&mut inner, block_number, info.round),
            Step::PrecommitWait => {
                self.enter_precommit(&mut inner, block_number, info.round);
                self.enter_new_round(&mut inner, block_number, info.round + 1);
            }
            // Prevote/Precommit/Commit timers are never armed; reaching
            // this arm means the scheduler state is corrupt.
            step => panic!("invalid timeout step: {}", step),
        }
    }

    // ------------------------------------------------------------------
    // State transitions. Every transition is guarded so that replays and
    // duplicate triggers are no-ops.
    // ------------------------------------------------------------------

    fn enter_new_round(&self, inner: &mut Inner, block_number: u64, round: i64) {
        let (s_number, s_round, s_step) = (
            inner.state.block_number(),
            inner.state.round(),
            inner.state.step(),
        );
        if s_number != block_number
            || round < s_round
            || (s_round == round && s_step != Step::NewHeight)
        {
            debug!(
                block_number,
                round,
                current_round = s_round,
                current_step = %s_step,
                "enter_new_round ignored: state is ahead"
            );
            return;
        }

        debug!(block_number, round, "entering new round");

        // A higher round means the proposer moved on without us; advance
        // the cached proposer by the offset we skipped.
        if s_round < round {
            let prev = match inner.val_set.get_proposer() {
                Ok(proposer) => proposer.address(),
                Err(e) => {
                    error!(error = %e, "cannot read current proposer");
                    return;
                }
            };
            if let Err(e) = inner.val_set.calc_proposer(&prev, (round - s_round) as u64) {
                error!(error = %e, "cannot advance proposer");
                return;
            }
        }

        inner.state.update_round_step(round, Step::NewRound);

        // No valid block can exist yet when the height starts
        if round == 0 {
            inner.state.set_valid_round_and_block(-1, None);
        }

        self.enter_propose(inner, block_number, round);
    }

    fn enter_propose(&self, inner: &mut Inner, block_number: u64, round: i64) {
        let (s_number, s_round, s_step) = (
            inner.state.block_number(),
            inner.state.round(),
            inner.state.step(),
        );
        if s_number != block_number || round < s_round || (s_round == round && s_step >= Step::Propose)
        {
            debug!(
                block_number,
                round,
                current_round = s_round,
                current_step = %s_step,
                "enter_propose ignored: state is ahead"
            );
            return;
        }

        debug!(block_number, round, "entering propose");

        // Even the proposer arms this timer; if its own proposal stalls,
        // the round still moves to prevote nil.
        self.timeout.schedule(TimeoutInfo {
            duration: self.config.propose_timeout(round),
            block_number,
            round,
            step: Step::Propose,
        });

        let our_address = self.backend.address();
        if inner.val_set.contains(&our_address) {
            if inner.val_set.is_proposer(&our_address) {
                info!(block_number, round, "this node is the proposer of this round");
                match self.decide_proposal(inner, round) {
                    Some(proposal) => self.send_propose(inner, &proposal),
                    None => warn!(block_number, round, "no block available to propose"),
                }
            }
        } else {
            debug!(block_number, round, "not a validator at this height");
        }

        inner.state.update_round_step(round, Step::Propose);

        if inner.state.is_proposal_complete() {
            self.enter_prevote(inner, block_number, round);
        }
    }

    /// The default proposal selector: re-propose the valid block when one
    /// is known, otherwise propose the candidate supplied by the backend.
    fn decide_proposal(&self, inner: &Inner, round: i64) -> Option<Proposal> {
        if inner.state.valid_round() != -1 {
            let block = inner.state.valid_block()?.clone();
            debug!(valid_round = inner.state.valid_round(), "re-proposing valid block");
            Some(Proposal::new(block, round, inner.state.valid_round()))
        } else {
            let block = inner.state.block()?.clone();
            Some(Proposal::new(block, round, -1))
        }
    }

    fn enter_prevote(&self, inner: &mut Inner, block_number: u64, round: i64) {
        let (s_number, s_round, s_step) = (
            inner.state.block_number(),
            inner.state.round(),
            inner.state.step(),
        );
        if s_number != block_number || round < s_round || (s_round == round && s_step >= Step::Prevote)
        {
            debug!(
                block_number,
                round,
                current_round = s_round,
                current_step = %s_step,
                "enter_prevote ignored: state is ahead"
            );
            return;
        }

        debug!(block_number, round, "entering prevote");
        self.do_prevote(inner, round);
        inner.state.update_round_step(round, Step::Prevote);
    }

    /// The default prevote selector: locked block first, nil without a
    /// proposal, otherwise the received proposal.
    fn do_prevote(&self, inner: &Inner, round: i64) {
        if inner.state.locked_round() != -1 {
            let hash = inner
                .state
                .locked_block()
                .expect("locked block must exist while locked")
                .hash();
            info!(round, block_hash = %hash, "prevoting locked block");
            self.send_vote(inner, MsgCode::Prevote, hash, round);
            return;
        }

        match inner.state.proposal_received() {
            None => {
                info!(round, "prevoting nil");
                self.send_vote(inner, MsgCode::Prevote, H256::NIL, round);
            }
            Some(proposal) => {
                let hash = proposal.block_hash();
                info!(round, block_hash = %hash, "prevoting proposal block");
                self.send_vote(inner, MsgCode::Prevote, hash, round);
            }
        }
    }

    fn enter_prevote_wait(&self, inner: &mut Inner, block_number: u64, round: i64) {
        let (s_number, s_round, s_step) = (
            inner.state.block_number(),
            inner.state.round(),
            inner.state.step(),
        );
        if s_number != block_number
            || round < s_round
            || (s_round == round && s_step >= Step::PrevoteWait)
        {
            return;
        }

        let Some(prevotes) = inner.state.get_prevotes(round) else {
            debug!(block_number, round, "enter_prevote_wait ignored: no prevotes");
            return;
        };
        if !prevotes.has_two_thirds_any() {
            debug!(block_number, round, "enter_prevote_wait ignored: no +2/3 prevotes");
            return;
        }

        debug!(block_number, round, "entering prevote wait");
        self.timeout.schedule(TimeoutInfo {
            duration: self.config.prevote_timeout(round),
            block_number,
            round,
            step: Step::PrevoteWait,
        });
        inner.state.update_round_step(round, Step::PrevoteWait);
    }

    fn enter_precommit(&self, inner: &mut Inner, block_number: u64, round: i64) {
        let (s_number, s_round, s_step) = (
            inner.state.block_number(),
            inner.state.round(),
            inner.state.step(),
        );
        if s_number != block_number
            || round < s_round
            || (s_round == round && s_step >= Step::Precommit)
        {
            debug!(
                block_number,
                round,
                current_round = s_round,
                current_step = %s_step,
                "enter_precommit ignored: state is ahead"
            );
            return;
        }

        debug!(block_number, round, "entering precommit");

        let (majority, two_thirds_any) = inner
            .state
            .get_prevotes(round)
            .map(|p| (p.two_thirds_majority(), p.has_two_thirds_any()))
            .unwrap_or((None, false));

        match majority {
            Some(maj_hash) if maj_hash.is_nil() => {
                debug!(round, "+2/3 prevoted nil, unlocking");
                inner.state.unlock();
                self.send_vote(inner, MsgCode::Precommit, H256::NIL, round);
            }
            Some(maj_hash) => {
                let matching = inner
                    .state
                    .proposal_received()
                    .filter(|p| p.block_hash() == maj_hash)
                    .map(|p| p.block.clone());
                match matching {
                    Some(block) => {
                        inner.state.lock(round, block.clone());
                        inner.state.set_valid_round_and_block(round, Some(block));
                        self.send_vote(inner, MsgCode::Precommit, maj_hash, round);
                    }
                    None => {
                        warn!(
                            round,
                            block_hash = %maj_hash,
                            "+2/3 prevotes on a block we do not have, precommitting nil"
                        );
                        inner.state.unlock();
                        inner.state.set_proposal_received(None);
                        self.send_vote(inner, MsgCode::Precommit, H256::NIL, round);
                    }
                }
            }
            None if two_thirds_any => {
                debug!(round, "+2/3 prevotes without a majority, precommitting nil");
                self.send_vote(inner, MsgCode::Precommit, H256::NIL, round);
            }
            None => {
                // Reached only by catching up through precommits of a
                // round we never prevoted in; nil is the safe vote.
                error!(round, "entered precommit without prevote quorum, precommitting nil");
                self.send_vote(inner, MsgCode::Precommit, H256::NIL, round);
            }
        }

        inner.state.update_round_step(round, Step::Precommit);
    }

    fn enter_precommit_wait(&self, inner: &mut Inner, block_number: u64, round: i64) {
        let (s_number, s_round, s_step) = (
            inner.state.block_number(),
            inner.state.round(),
            inner.state.step(),
        );
        if s_number != block_number
            || round < s_round
            || (s_round == round && s_step >= Step::PrecommitWait)
        {
            return;
        }

        let Some(precommits) = inner.state.get_precommits(round) else {
            debug!(block_number, round, "enter_precommit_wait ignored: no precommits");
            return;
        };
        if !precommits.has_two_thirds_any() {
            debug!(block_number, round, "enter_precommit_wait ignored: no +2/3 precommits");
            return;
        }

        debug!(block_number, round, "entering precommit wait");
        self.timeout.schedule(TimeoutInfo {
            duration: self.config.precommit_timeout(round),
            block_number,
            round,
            step: Step::PrecommitWait,
        });
        inner.state.update_round_step(round, Step::PrecommitWait);
    }

    fn enter_commit(&self, inner: &mut Inner, block_number: u64, round: i64) {
        let (s_number, s_round, s_step) = (
            inner.state.block_number(),
            inner.state.round(),
            inner.state.step(),
        );
        if s_number != block_number || round < s_round || s_step == Step::Commit {
            return;
        }

        let majority = inner
            .state
            .get_precommits(round)
            .and_then(|p| p.two_thirds_majority());
        let Some(maj_hash) = majority else {
            error!(block_number, round, "enter_commit without a precommit majority");
            return;
        };
        if maj_hash.is_nil() {
            error!(block_number, round, "enter_commit with a nil majority");
            return;
        }

        // We can only deliver a block we hold. A majority on an unknown
        // hash leaves the step untouched; a late proposal or vote will
        // re-trigger the commit.
        let block = if inner.state.locked_block().map(|b| b.hash()) == Some(maj_hash) {
            inner.state.locked_block().cloned()
        } else {
            inner
                .state
                .proposal_received()
                .filter(|p| p.block_hash() == maj_hash)
                .map(|p| p.block.clone())
        };
        let Some(block) = block else {
            warn!(
                block_number,
                round,
                block_hash = %maj_hash,
                "commit majority on a block we do not hold, waiting for it"
            );
            return;
        };

        inner.state.update_round_step(round, Step::Commit);
        info!(block_number, round, block_hash = %maj_hash, "committing block");

        let backend = self.backend.clone();
        tokio::spawn(async move {
            backend.commit(block).await;
        });
    }

    // ------------------------------------------------------------------
    // Outbound messages
    // ------------------------------------------------------------------

    fn send_propose(&self, inner: &Inner, proposal: &Proposal) {
        info!(
            round = proposal.round,
            pol_round = proposal.pol_round,
            block_hash = %proposal.block_hash(),
            "broadcasting proposal"
        );
        self.sign_and_broadcast(inner, MsgCode::Propose, rlp::encode(proposal).to_vec());
    }

    fn send_vote(&self, inner: &Inner, code: MsgCode, block_hash: H256, round: i64) {
        let vote = Vote::new(inner.state.block_number(), round, block_hash);
        debug!(code = %code, vote = %vote, "broadcasting vote");
        self.sign_and_broadcast(inner, code, rlp::encode(&vote).to_vec());
    }

    fn sign_and_broadcast(&self, inner: &Inner, code: MsgCode, payload: Vec<u8>) {
        let mut msg = Message::new(code, payload, self.backend.address());
        match self.backend.sign(&msg.payload_for_signing()) {
            Ok(signature) => msg.signature = signature,
            Err(e) => {
                error!(code = %code, error = %e, "failed to sign message");
                return;
            }
        }

        let encoded = msg.rlp_bytes();
        let backend = self.backend.clone();
        let val_set = inner.val_set.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.broadcast(&val_set, encoded).await {
                error!(error = %e, "failed to broadcast message");
            }
        });
    }

    fn spawn_gossip(&self, val_set: &ValidatorSet, payload: Vec<u8>) {
        let backend = self.backend.clone();
        let val_set = val_set.clone();
        tokio::spawn(async move {
            if let Err(e) = backend.gossip(&val_set, payload).await {
                error!(error = %e, "failed to re-gossip message");
            }
        });
    }
}
