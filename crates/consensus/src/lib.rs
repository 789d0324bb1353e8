//! # Ember Consensus
//!
//! Tendermint-style BFT consensus core for the Ember blockchain.
//!
//! For each block height the protocol runs rounds of three phases until a
//! block gathers a +2/3 precommit majority, tolerating `f` faulty
//! validators in a set of `n >= 3f + 1`:
//!
//! ```text
//! Round r, height h:
//!
//! ┌────────────┐  proposer = validators[(round0_proposer + r) % n]
//! │  PROPOSE   │  proposer broadcasts Proposal{block, r, pol_round}
//! └─────┬──────┘
//!       ▼
//! ┌────────────┐  prevote locked block, else proposal block, else nil;
//! │  PREVOTE   │  on +2/3 prevotes for one hash: lock it
//! └─────┬──────┘
//!       ▼
//! ┌────────────┐  precommit the majority hash, or nil without one;
//! │ PRECOMMIT  │  on +2/3 precommits for a block: commit
//! └─────┬──────┘
//!       ▼
//! ┌────────────┐  deliver the block to the chain backend; the next
//! │   COMMIT   │  height starts when it announces the new block
//! └────────────┘
//! ```
//!
//! The core is single-threaded: one event loop consumes transport
//! messages and fired timeouts, and every state transition happens inside
//! it. Locking (`locked_round`/`locked_block`) preserves safety across
//! rounds; Proof-of-Lock (`pol_round`, +2/3 prevotes at an earlier round)
//! lets replicas release a stale lock without violating it.
//!
//! External collaborators are abstracted behind [`Backend`] (signing,
//! gossip, commit delivery) and [`ChainReader`] (checkpoint headers for
//! validator-set resolution).

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod backend;
pub mod config;
pub mod engine;
pub mod errors;
pub mod message;
pub mod provider;
pub mod round_state;
pub mod timeout;
pub mod types;
pub mod validator;
pub mod vote_set;

// Re-export main types at crate root for convenience
pub use backend::{Backend, ChainReader};
pub use engine::{Core, CoreSnapshot};
pub use config::{Config, ProposerPolicy, DEFAULT_EPOCH};
pub use errors::{ConsensusError, Result};
pub use message::{Message, MessageSet};
pub use provider::{checkpoint_number, encode_validators, extract_validators, validator_set_for_height};
pub use round_state::RoundState;
pub use timeout::{TimeoutInfo, TimeoutScheduler};
pub use types::{ConsensusEvent, MsgCode, Proposal, Step, View, Vote};
pub use validator::{Validator, ValidatorSet};
pub use vote_set::VoteSet;
