//! Consensus-specific types for the Ember BFT protocol.
//!
//! This module defines the core data structures used in the consensus
//! protocol:
//! - [`Step`] - Position inside a round; totally ordered
//! - [`MsgCode`] - Wire code of a consensus message
//! - [`View`] - (block number, round) pair
//! - [`Proposal`] - Block proposal with Proof-of-Lock round
//! - [`Vote`] - Prevote or precommit payload
//! - [`ConsensusEvent`] - Inputs fed to the core's event loop
//!
//! Rounds are `i64` values; `-1` never appears inside a [`View`] and is
//! only used as the sentinel for `pol_round`, `locked_round` and
//! `valid_round`. RLP has no signed integers, so rounds are encoded on the
//! wire offset by one (`-1` encodes as `0`).

use crate::errors::ConsensusError;
use ember_types::{Block, H256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Consensus step within a round.
///
/// The declaration order defines the total order used by the staleness
/// checks: `NewHeight < NewRound < Propose < Prevote < PrevoteWait <
/// Precommit < PrecommitWait < Commit`. Within a round the step only
/// advances; a higher round resets it through `NewRound`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Step {
    /// Waiting for the height to start
    NewHeight,
    /// Round entered, proposer not yet acted
    NewRound,
    /// Waiting for the round's proposal
    Propose,
    /// Prevote broadcast, collecting prevotes
    Prevote,
    /// +2/3 prevotes seen without a hash majority; waiting for more
    PrevoteWait,
    /// Precommit broadcast, collecting precommits
    Precommit,
    /// +2/3 precommits seen without a block majority; waiting for more
    PrecommitWait,
    /// Block committed; waiting for the next height
    Commit,
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Step::NewHeight => "NewHeight",
            Step::NewRound => "NewRound",
            Step::Propose => "Propose",
            Step::Prevote => "Prevote",
            Step::PrevoteWait => "PrevoteWait",
            Step::Precommit => "Precommit",
            Step::PrecommitWait => "PrecommitWait",
            Step::Commit => "Commit",
        };
        write!(f, "{}", name)
    }
}

/// Wire code of a consensus message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsgCode {
    /// Block proposal from the round's proposer
    Propose,
    /// First voting phase
    Prevote,
    /// Second voting phase
    Precommit,
}

impl MsgCode {
    /// The numeric wire representation.
    pub fn as_u64(self) -> u64 {
        match self {
            MsgCode::Propose => 0,
            MsgCode::Prevote => 1,
            MsgCode::Precommit => 2,
        }
    }
}

impl TryFrom<u64> for MsgCode {
    type Error = ConsensusError;

    fn try_from(code: u64) -> Result<Self, Self::Error> {
        match code {
            0 => Ok(MsgCode::Propose),
            1 => Ok(MsgCode::Prevote),
            2 => Ok(MsgCode::Precommit),
            other => Err(ConsensusError::UnknownMessageCode(other)),
        }
    }
}

impl fmt::Display for MsgCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgCode::Propose => "Propose",
            MsgCode::Prevote => "Prevote",
            MsgCode::Precommit => "Precommit",
        };
        write!(f, "{}", name)
    }
}

/// A (block number, round) pair identifying one voting attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct View {
    /// Block height
    pub block_number: u64,
    /// Round within the height; never negative inside a view
    pub round: i64,
}

impl fmt::Display for View {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "View(number={}, round={})", self.block_number, self.round)
    }
}

// Wire encoding of a round: offset by one so that the -1 sentinel fits an
// unsigned RLP integer.
fn round_to_wire(round: i64) -> u64 {
    (round + 1) as u64
}

fn round_from_wire(raw: u64) -> i64 {
    raw as i64 - 1
}

/// Block proposal message from the designated proposer.
///
/// `pol_round` is the round at which the proposer claims a Proof of Lock
/// (+2/3 prevotes) exists for this block, or `-1` when there is none.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proposal {
    /// The proposed block
    pub block: Block,
    /// Round this proposal is for
    pub round: i64,
    /// Proof-of-Lock round, `-1` or `[0, round)`
    pub pol_round: i64,
}

impl Proposal {
    /// Create a new proposal.
    pub fn new(block: Block, round: i64, pol_round: i64) -> Self {
        Self {
            block,
            round,
            pol_round,
        }
    }

    /// The hash of the proposed block.
    pub fn block_hash(&self) -> H256 {
        self.block.hash()
    }
}

impl Encodable for Proposal {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.block);
        s.append(&round_to_wire(self.round));
        s.append(&round_to_wire(self.pol_round));
    }
}

impl Decodable for Proposal {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if !rlp.is_list() || rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            block: rlp.val_at(0)?,
            round: round_from_wire(rlp.val_at(1)?),
            pol_round: round_from_wire(rlp.val_at(2)?),
        })
    }
}

/// Vote payload for prevotes and precommits.
///
/// A nil-vote carries [`H256::NIL`] as its block hash; the hash field is
/// never absent on the wire (a short or missing hash fails decoding).
/// The vote kind is carried by the enclosing message's [`MsgCode`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vote {
    /// Block height this vote applies to
    pub block_number: u64,
    /// Round this vote applies to
    pub round: i64,
    /// Hash voted for; [`H256::NIL`] for a nil-vote
    pub block_hash: H256,
}

impl Vote {
    /// Create a new vote.
    pub fn new(block_number: u64, round: i64, block_hash: H256) -> Self {
        Self {
            block_number,
            round,
            block_hash,
        }
    }

    /// Whether this is a nil-vote.
    pub fn is_nil(&self) -> bool {
        self.block_hash.is_nil()
    }
}

impl fmt::Display for Vote {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Vote(number={}, round={}, hash={})",
            self.block_number,
            self.round,
            if self.is_nil() {
                "NIL".to_string()
            } else {
                self.block_hash.short_hex()
            }
        )
    }
}

impl Encodable for Vote {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(3);
        s.append(&self.block_number);
        s.append(&round_to_wire(self.round));
        s.append(&self.block_hash);
    }
}

impl Decodable for Vote {
    fn decode(rlp: &Rlp<'_>) -> Result<Self, DecoderError> {
        if !rlp.is_list() || rlp.item_count()? != 3 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            block_number: rlp.val_at(0)?,
            round: round_from_wire(rlp.val_at(1)?),
            block_hash: rlp.val_at(2)?,
        })
    }
}

/// Inputs multiplexed by the core's event loop.
#[derive(Debug, Clone)]
pub enum ConsensusEvent {
    /// A block became available from the chain backend. A block at the
    /// current height becomes the own-proposal candidate; a block at a
    /// later height starts that height.
    NewBlock(Block),
    /// An encoded consensus message arrived from the transport (or from
    /// ourselves via broadcast).
    Message(Vec<u8>),
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_types::BlockHeader;

    #[test]
    fn test_step_ordering() {
        assert!(Step::NewHeight < Step::NewRound);
        assert!(Step::NewRound < Step::Propose);
        assert!(Step::Propose < Step::Prevote);
        assert!(Step::Prevote < Step::PrevoteWait);
        assert!(Step::PrevoteWait < Step::Precommit);
        assert!(Step::Precommit < Step::PrecommitWait);
        assert!(Step::PrecommitWait < Step::Commit);
    }

    #[test]
    fn test_msg_code_roundtrip() {
        for code in [MsgCode::Propose, MsgCode::Prevote, MsgCode::Precommit] {
            assert_eq!(MsgCode::try_from(code.as_u64()).unwrap(), code);
        }
        assert!(MsgCode::try_from(3).is_err());
    }

    #[test]
    fn test_vote_rlp_roundtrip() {
        let vote = Vote::new(9, 2, H256::keccak256(b"block"));
        let encoded = rlp::encode(&vote);
        let decoded: Vote = rlp::decode(&encoded).unwrap();
        assert_eq!(vote, decoded);
    }

    #[test]
    fn test_nil_vote_roundtrip() {
        let vote = Vote::new(1, 0, H256::NIL);
        assert!(vote.is_nil());
        let decoded: Vote = rlp::decode(&rlp::encode(&vote)).unwrap();
        assert!(decoded.is_nil());
    }

    #[test]
    fn test_proposal_rlp_roundtrip() {
        let block = Block::from_header(BlockHeader::new(3, H256::keccak256(b"p"), 42, Default::default()));
        let proposal = Proposal::new(block, 1, -1);
        let encoded = rlp::encode(&proposal);
        let decoded: Proposal = rlp::decode(&encoded).unwrap();
        assert_eq!(proposal, decoded);
        assert_eq!(decoded.pol_round, -1);
    }

    #[test]
    fn test_truncated_vote_rejected() {
        // A two-item list is not a valid vote payload
        let mut s = RlpStream::new_list(2);
        s.append(&1u64);
        s.append(&1u64);
        let res: Result<Vote, _> = rlp::decode(&s.out());
        assert!(res.is_err());
    }
}
