//! End-to-end scenarios for the consensus core.
//!
//! Each test runs one replica (the core under test) against three
//! scripted peers in a 4-validator set (f = 1, quorum = 3). Peer
//! messages are signed with real keys and injected through the backend's
//! event channel; the core's own messages loop back through
//! `Backend::broadcast` exactly as they would in production.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use ember_consensus::{
    Backend, Config, ConsensusEvent, Core, CoreSnapshot, Message, MsgCode, Proposal,
    ProposerPolicy, Result as ConsensusResult, Step, ValidatorSet, Vote,
};
use ember_crypto::PrivateKey;
use ember_types::{Address, Block, BlockHeader, H256};

const WAIT: Duration = Duration::from_secs(5);

struct TestBackend {
    key: PrivateKey,
    address: Address,
    val_addrs: Vec<Address>,
    event_tx: mpsc::Sender<ConsensusEvent>,
    outbound_tx: mpsc::UnboundedSender<Message>,
    commit_tx: mpsc::UnboundedSender<Block>,
    equivocations: Mutex<Vec<Address>>,
}

#[async_trait]
impl Backend for TestBackend {
    fn address(&self) -> Address {
        self.address
    }

    fn sign(&self, data: &[u8]) -> ConsensusResult<Vec<u8>> {
        Ok(self.key.sign(data)?.to_bytes().to_vec())
    }

    fn validators(&self, _block_number: u64) -> ConsensusResult<ValidatorSet> {
        Ok(ValidatorSet::new(
            self.val_addrs.clone(),
            ProposerPolicy::RoundRobin,
        ))
    }

    fn event_sender(&self) -> mpsc::Sender<ConsensusEvent> {
        self.event_tx.clone()
    }

    async fn gossip(&self, _val_set: &ValidatorSet, _payload: Vec<u8>) -> ConsensusResult<()> {
        Ok(())
    }

    async fn broadcast(&self, val_set: &ValidatorSet, payload: Vec<u8>) -> ConsensusResult<()> {
        // Record the decoded message for assertions, then self-post via
        // the default gossip + event-channel path
        if let Ok(msg) = Message::rlp_decode(&payload) {
            let _ = self.outbound_tx.send(msg);
        }
        self.gossip(val_set, payload.clone()).await?;
        let _ = self
            .event_sender()
            .send(ConsensusEvent::Message(payload))
            .await;
        Ok(())
    }

    async fn commit(&self, block: Block) {
        let _ = self.commit_tx.send(block);
    }

    fn find_peers(&self, _val_set: &ValidatorSet) -> bool {
        true
    }

    fn handle_equivocation(&self, sender: Address, _block_number: u64, _round: i64, _code: MsgCode) {
        self.equivocations.lock().push(sender);
    }
}

struct Harness {
    core: Core<TestBackend>,
    backend: Arc<TestBackend>,
    event_tx: mpsc::Sender<ConsensusEvent>,
    outbound_rx: mpsc::UnboundedReceiver<Message>,
    commit_rx: mpsc::UnboundedReceiver<Block>,
    keys: Vec<PrivateKey>,
}

/// Build a harness where the core under test is validator `our_index` in
/// a four-member set ordered V1..V4 (V1 proposes round 0 of height 1).
fn harness(our_index: usize) -> Harness {
    harness_with(our_index, Config::fast())
}

/// A configuration whose propose timer practically never fires, for
/// scenarios that inject proposals and must not race the timeout.
fn patient_propose_config() -> Config {
    Config {
        propose_base: Duration::from_secs(30),
        ..Config::fast()
    }
}

fn harness_with(our_index: usize, config: Config) -> Harness {
    let keys: Vec<PrivateKey> = (0..4).map(|_| PrivateKey::random()).collect();
    let val_addrs: Vec<Address> = keys.iter().map(|k| Address::from(k.address())).collect();

    let (event_tx, event_rx) = mpsc::channel(64);
    let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
    let (commit_tx, commit_rx) = mpsc::unbounded_channel();

    let backend = Arc::new(TestBackend {
        key: keys[our_index].clone(),
        address: val_addrs[our_index],
        val_addrs,
        event_tx: event_tx.clone(),
        outbound_tx,
        commit_tx,
        equivocations: Mutex::new(Vec::new()),
    });

    let core = Core::new(backend.clone(), config, 1, event_rx);
    Harness {
        core,
        backend,
        event_tx,
        outbound_rx,
        commit_rx,
        keys,
    }
}

fn block_at(number: u64, tag: &[u8]) -> Block {
    Block::from_header(BlockHeader::new(
        number,
        H256::keccak256(tag),
        number,
        Address::ZERO,
    ))
}

impl Harness {
    fn signed_payload(&self, key_index: usize, code: MsgCode, payload: Vec<u8>) -> Vec<u8> {
        let key = &self.keys[key_index];
        let mut msg = Message::new(code, payload, Address::from(key.address()));
        msg.signature = key
            .sign(&msg.payload_for_signing())
            .unwrap()
            .to_bytes()
            .to_vec();
        msg.rlp_bytes()
    }

    async fn send_proposal(&self, key_index: usize, block: Block, round: i64, pol_round: i64) {
        let payload = rlp::encode(&Proposal::new(block, round, pol_round)).to_vec();
        let encoded = self.signed_payload(key_index, MsgCode::Propose, payload);
        self.event_tx
            .send(ConsensusEvent::Message(encoded))
            .await
            .unwrap();
    }

    async fn send_vote(&self, key_index: usize, code: MsgCode, round: i64, block_hash: H256) {
        let payload = rlp::encode(&Vote::new(1, round, block_hash)).to_vec();
        let encoded = self.signed_payload(key_index, code, payload);
        self.event_tx
            .send(ConsensusEvent::Message(encoded))
            .await
            .unwrap();
    }

    async fn send_new_block(&self, block: Block) {
        self.event_tx
            .send(ConsensusEvent::NewBlock(block))
            .await
            .unwrap();
    }

    /// Pop outbound messages until one matches (code, round, hash).
    async fn wait_for_vote(&mut self, code: MsgCode, round: i64, block_hash: H256) -> Message {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let msg = tokio::time::timeout(remaining, self.outbound_rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {} r={}", code, round))
                .expect("outbound channel closed");
            if msg.code != code.as_u64() {
                continue;
            }
            let vote: Vote = rlp::decode(&msg.msg).unwrap();
            if vote.round == round && vote.block_hash == block_hash {
                return msg;
            }
        }
    }

    /// Pop outbound messages until a proposal appears.
    async fn wait_for_proposal(&mut self) -> Proposal {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            let msg = tokio::time::timeout(remaining, self.outbound_rx.recv())
                .await
                .expect("timed out waiting for proposal")
                .expect("outbound channel closed");
            if msg.code == MsgCode::Propose.as_u64() {
                return rlp::decode(&msg.msg).unwrap();
            }
        }
    }

    async fn wait_for_commit(&mut self) -> Block {
        tokio::time::timeout(WAIT, self.commit_rx.recv())
            .await
            .expect("timed out waiting for commit")
            .expect("commit channel closed")
    }

    async fn wait_until<F: Fn(&CoreSnapshot) -> bool>(&self, pred: F, what: &str) {
        let deadline = tokio::time::Instant::now() + WAIT;
        loop {
            let snapshot = self.core.snapshot();
            if pred(&snapshot) {
                return;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("timed out waiting for {}; state: {:?}", what, snapshot);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Assert that no further outbound message shows up for a while.
    async fn expect_outbound_silence(&mut self, for_ms: u64) {
        let res = tokio::time::timeout(Duration::from_millis(for_ms), self.outbound_rx.recv()).await;
        if let Ok(Some(msg)) = res {
            panic!("unexpected outbound message: {}", msg);
        }
    }
}

#[tokio::test]
async fn test_happy_path_commits_in_round_zero() {
    // We are V1, the proposer of (1, 0)
    let mut h = harness(0);
    let block = block_at(1, b"happy");
    h.core.set_block_for_proposal(block.clone());
    h.core.start().unwrap();

    // Our proposal goes out, then our prevote for it
    let proposal = h.wait_for_proposal().await;
    assert_eq!(proposal.block_hash(), block.hash());
    assert_eq!(proposal.round, 0);
    assert_eq!(proposal.pol_round, -1);
    h.wait_for_vote(MsgCode::Prevote, 0, block.hash()).await;

    // V2 and V3 prevote the block; with ours that is quorum
    h.send_vote(1, MsgCode::Prevote, 0, block.hash()).await;
    h.send_vote(2, MsgCode::Prevote, 0, block.hash()).await;
    h.wait_for_vote(MsgCode::Precommit, 0, block.hash()).await;
    h.wait_until(|s| s.locked_round == 0, "lock on round 0").await;

    // V2 and V3 precommit; the block commits
    h.send_vote(1, MsgCode::Precommit, 0, block.hash()).await;
    h.send_vote(2, MsgCode::Precommit, 0, block.hash()).await;
    let committed = h.wait_for_commit().await;
    assert_eq!(committed.hash(), block.hash());
    h.wait_until(|s| s.step == Step::Commit, "commit step").await;

    // The next height starts only on the NewBlock announcement
    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.block_number, 1);

    let next = block_at(2, b"next");
    h.send_new_block(next.clone()).await;
    h.wait_until(|s| s.block_number == 2, "height 2").await;
    // We propose again at (2, 0)
    let proposal = h.wait_for_proposal().await;
    assert_eq!(proposal.block_hash(), next.hash());
}

#[tokio::test]
async fn test_silent_proposer_nil_round_then_next_round_commits() {
    // We are V2; V1 (round-0 proposer) never shows up
    let mut h = harness(1);
    let own_block = block_at(1, b"round-one-block");
    h.core.set_block_for_proposal(own_block.clone());
    h.core.start().unwrap();

    // Propose timeout fires; we prevote nil
    h.wait_for_vote(MsgCode::Prevote, 0, H256::NIL).await;

    // V3 and V4 prevote nil too; we precommit nil
    h.send_vote(2, MsgCode::Prevote, 0, H256::NIL).await;
    h.send_vote(3, MsgCode::Prevote, 0, H256::NIL).await;
    h.wait_for_vote(MsgCode::Precommit, 0, H256::NIL).await;

    // V3 and V4 precommit nil; after the precommit wait we move to round 1
    h.send_vote(2, MsgCode::Precommit, 0, H256::NIL).await;
    h.send_vote(3, MsgCode::Precommit, 0, H256::NIL).await;
    h.wait_until(|s| s.round == 1, "round 1").await;

    // Round 1: we are the proposer and run the happy path with our block
    let proposal = h.wait_for_proposal().await;
    assert_eq!(proposal.round, 1);
    assert_eq!(proposal.block_hash(), own_block.hash());
    h.wait_for_vote(MsgCode::Prevote, 1, own_block.hash()).await;

    h.send_vote(2, MsgCode::Prevote, 1, own_block.hash()).await;
    h.send_vote(3, MsgCode::Prevote, 1, own_block.hash()).await;
    h.wait_for_vote(MsgCode::Precommit, 1, own_block.hash()).await;

    h.send_vote(2, MsgCode::Precommit, 1, own_block.hash()).await;
    h.send_vote(3, MsgCode::Precommit, 1, own_block.hash()).await;
    let committed = h.wait_for_commit().await;
    assert_eq!(committed.hash(), own_block.hash());
}

#[tokio::test]
async fn test_lock_then_unlock_via_pol_at_later_round() {
    // We are V4; V1 proposes B in round 0, V2 proposes B' in round 1
    let mut h = harness_with(3, patient_propose_config());
    h.core.start().unwrap();

    let block_a = block_at(1, b"block-a");
    let block_b = block_at(1, b"block-b");
    assert_ne!(block_a.hash(), block_b.hash());

    // Round 0: admit B, prevote it, see +2/3 prevotes, lock and precommit
    h.send_proposal(0, block_a.clone(), 0, -1).await;
    h.wait_for_vote(MsgCode::Prevote, 0, block_a.hash()).await;
    h.send_vote(0, MsgCode::Prevote, 0, block_a.hash()).await;
    h.send_vote(1, MsgCode::Prevote, 0, block_a.hash()).await;
    h.wait_for_vote(MsgCode::Precommit, 0, block_a.hash()).await;
    h.wait_until(
        |s| s.locked_round == 0 && s.locked_block_hash == Some(block_a.hash()),
        "lock on B",
    )
    .await;

    // Round 1 prevotes for B' from the other three: we skip ahead
    h.send_vote(0, MsgCode::Prevote, 1, block_b.hash()).await;
    h.send_vote(1, MsgCode::Prevote, 1, block_b.hash()).await;
    h.send_vote(2, MsgCode::Prevote, 1, block_b.hash()).await;
    h.wait_until(|s| s.round == 1, "round 1").await;

    // V2's round-1 proposal arrives; still locked, we prevote B...
    h.send_proposal(1, block_b.clone(), 1, -1).await;
    h.wait_for_vote(MsgCode::Prevote, 1, block_a.hash()).await;

    // ...but our own prevote lands on a +2/3 majority for B' at a round
    // later than our lock: we unlock, re-lock on B' and precommit it
    h.wait_for_vote(MsgCode::Precommit, 1, block_b.hash()).await;
    h.wait_until(
        |s| s.locked_round == 1 && s.locked_block_hash == Some(block_b.hash()),
        "re-lock on B'",
    )
    .await;

    // Finish the height on B'
    h.send_vote(0, MsgCode::Precommit, 1, block_b.hash()).await;
    h.send_vote(1, MsgCode::Precommit, 1, block_b.hash()).await;
    let committed = h.wait_for_commit().await;
    assert_eq!(committed.hash(), block_b.hash());
}

#[tokio::test]
async fn test_equivocating_prevote_is_rejected_first_vote_stands() {
    // We are V4; V3 equivocates at (1, 0)
    let mut h = harness(3);
    h.core.start().unwrap();

    let block_a = block_at(1, b"block-a");
    let block_b = block_at(1, b"block-b");

    h.send_vote(2, MsgCode::Prevote, 0, block_a.hash()).await;
    h.send_vote(2, MsgCode::Prevote, 0, block_b.hash()).await;

    // The conflicting vote is surfaced through the equivocation hook
    h.wait_until(|_| !h.backend.equivocations.lock().is_empty(), "equivocation report")
        .await;
    let reported = h.backend.equivocations.lock().clone();
    assert_eq!(reported, vec![Address::from(h.keys[2].address())]);

    // Only V3's first vote and our nil prevote (after the propose
    // timeout) exist; no quorum, no precommit on any block
    h.wait_for_vote(MsgCode::Prevote, 0, H256::NIL).await;
    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.round, 0);
    assert!(snapshot.step <= Step::Prevote);
}

#[tokio::test]
async fn test_stale_propose_timeout_is_discarded() {
    // We are V2; the proposal arrives before the propose timeout fires
    let mut h = harness_with(
        1,
        Config {
            propose_base: Duration::from_millis(300),
            ..Config::fast()
        },
    );
    h.core.start().unwrap();

    let block = block_at(1, b"prompt");
    h.send_proposal(0, block.clone(), 0, -1).await;
    h.wait_for_vote(MsgCode::Prevote, 0, block.hash()).await;
    h.wait_until(|s| s.step == Step::Prevote, "prevote step").await;

    // Let the now-stale propose timer fire; the dispatcher must discard
    // it instead of prevoting again
    tokio::time::sleep(Duration::from_millis(600)).await;
    h.expect_outbound_silence(100).await;

    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.round, 0);
    assert_eq!(snapshot.step, Step::Prevote);
}

#[tokio::test]
async fn test_pol_majority_on_unknown_block_precommits_nil_and_clears_proposal() {
    // We are V4 and never saw the proposal the others prevote
    let mut h = harness(3);
    h.core.start().unwrap();

    let hidden = block_at(1, b"hidden");

    // +2/3 prevotes for a hash we do not hold
    h.send_vote(0, MsgCode::Prevote, 0, hidden.hash()).await;
    h.send_vote(1, MsgCode::Prevote, 0, hidden.hash()).await;
    h.send_vote(2, MsgCode::Prevote, 0, hidden.hash()).await;

    // After the propose timeout we prevote nil, then the prevote wait
    // expires and we precommit nil because the block is unknown
    h.wait_for_vote(MsgCode::Prevote, 0, H256::NIL).await;
    h.wait_for_vote(MsgCode::Precommit, 0, H256::NIL).await;
    let snapshot = h.core.snapshot();
    assert!(snapshot.proposal_block_hash.is_none(), "proposal must be cleared");

    // A late valid proposal for that hash can now be admitted...
    h.send_proposal(0, hidden.clone(), 0, -1).await;
    h.wait_until(
        |s| s.proposal_block_hash == Some(hidden.hash()),
        "late proposal admitted",
    )
    .await;

    // ...and +2/3 precommits for it commit the block after all
    h.send_vote(0, MsgCode::Precommit, 0, hidden.hash()).await;
    h.send_vote(1, MsgCode::Precommit, 0, hidden.hash()).await;
    h.send_vote(2, MsgCode::Precommit, 0, hidden.hash()).await;
    let committed = h.wait_for_commit().await;
    assert_eq!(committed.hash(), hidden.hash());
}

#[tokio::test]
async fn test_proposal_from_wrong_signer_is_rejected() {
    // We are V4; V3 pretends to propose although V1 holds the round
    let mut h = harness(3);
    h.core.start().unwrap();

    let block = block_at(1, b"imposter");
    h.send_proposal(2, block, 0, -1).await;

    // Give the loop time to process, then confirm nothing was admitted
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.core.snapshot().proposal_block_hash.is_none());
}

#[tokio::test]
async fn test_vote_with_forged_sender_is_dropped() {
    // We are V2; V3 signs a vote but claims it comes from V4
    let mut h = harness_with(1, patient_propose_config());
    h.core.start().unwrap();

    let block = block_at(1, b"forged");
    h.send_proposal(0, block.clone(), 0, -1).await;
    h.wait_for_vote(MsgCode::Prevote, 0, block.hash()).await;

    // Two honest prevotes plus one forged: the forged vote must not
    // complete the quorum
    h.send_vote(0, MsgCode::Prevote, 0, block.hash()).await;
    let payload = rlp::encode(&Vote::new(1, 0, block.hash())).to_vec();
    let mut forged = Message::new(MsgCode::Prevote, payload, Address::from(h.keys[3].address()));
    forged.signature = h.keys[2]
        .sign(&forged.payload_for_signing())
        .unwrap()
        .to_bytes()
        .to_vec();
    h.event_tx
        .send(ConsensusEvent::Message(forged.rlp_bytes()))
        .await
        .unwrap();

    h.expect_outbound_silence(200).await;
    assert!(h.core.snapshot().step <= Step::Prevote);
}

#[tokio::test]
async fn test_replayed_prevote_counts_once() {
    // We are V2; a replayed vote must not fabricate a quorum
    let mut h = harness_with(1, patient_propose_config());
    h.core.start().unwrap();

    let block = block_at(1, b"replay");
    h.send_proposal(0, block.clone(), 0, -1).await;
    h.wait_for_vote(MsgCode::Prevote, 0, block.hash()).await;

    // V3's prevote arrives three times; together with ours that is still
    // only two distinct voters
    for _ in 0..3 {
        h.send_vote(2, MsgCode::Prevote, 0, block.hash()).await;
    }

    h.expect_outbound_silence(300).await;
    assert!(h.core.snapshot().step <= Step::Prevote);

    // The third distinct voter completes the quorum
    h.send_vote(3, MsgCode::Prevote, 0, block.hash()).await;
    h.wait_for_vote(MsgCode::Precommit, 0, block.hash()).await;
}

#[tokio::test]
async fn test_future_round_prevotes_skip_ahead() {
    // We are V4 at round 0; +2/3 prevotes at round 2 pull us forward
    let mut h = harness(3);
    h.core.start().unwrap();

    let block = block_at(1, b"future");
    h.send_vote(0, MsgCode::Prevote, 2, block.hash()).await;
    h.send_vote(1, MsgCode::Prevote, 2, block.hash()).await;
    h.send_vote(2, MsgCode::Prevote, 2, block.hash()).await;

    h.wait_until(|s| s.round == 2, "round 2").await;
    // Round 2 of height 1 belongs to V3
    let snapshot = h.core.snapshot();
    assert_eq!(snapshot.block_number, 1);
    assert_eq!(snapshot.round, 2);
}
