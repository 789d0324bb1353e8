//! Error types for the consensus core.
//!
//! Propagation policy: decode errors, signature-recovery errors, and
//! equivocation are logged and dropped by the event loop (the round
//! proceeds). Height/round mismatches are silently dropped since they are
//! normal during network lag. [`ConsensusError::EmptyBlockProposal`] and
//! [`ConsensusError::InvalidProposalSignature`] reject the proposal without
//! advancing state.

use ember_types::Address;

/// Result type alias for consensus operations
pub type Result<T> = std::result::Result<T, ConsensusError>;

/// Errors that can occur in the consensus core
#[derive(Debug, thiserror::Error)]
pub enum ConsensusError {
    /// Proposal POL round outside `{-1} ∪ [0, round)`
    #[error("invalid proposal POL round")]
    InvalidProposalPOLRound,

    /// Proposal signer is not the proposer of the round
    #[error("invalid proposal signature")]
    InvalidProposalSignature,

    /// Proposal carries no block or the empty block hash
    #[error("empty block proposal")]
    EmptyBlockProposal,

    /// Vote is for a different height than the current one
    #[error("vote height mismatch")]
    VoteHeightMismatch,

    /// Message signer is not a member of the validator set
    #[error("invalid validator address")]
    InvalidValidatorAddress,

    /// A second, conflicting vote from the same signer at the same
    /// (height, round, kind)
    #[error("equivocation from {sender}")]
    Equivocation {
        /// The equivocating signer
        sender: Address,
    },

    /// Checkpoint header not found in the chain
    #[error("unknown block")]
    UnknownBlock,

    /// Validator set resolved to an empty list
    #[error("empty validator set")]
    EmptyValSet,

    /// Transport not attached to the backend
    #[error("no broadcaster is set")]
    NoBroadcaster,

    /// Message carries a code outside the known set
    #[error("unknown message code {0}")]
    UnknownMessageCode(u64),

    /// Wire decoding failed
    #[error("rlp decode error: {0}")]
    Rlp(#[from] rlp::DecoderError),

    /// Signing or signature recovery failed
    #[error("crypto error: {0}")]
    Crypto(#[from] ember_crypto::CryptoError),

    /// Backend-specific failure (transport, chain access)
    #[error("backend error: {0}")]
    Backend(String),
}
