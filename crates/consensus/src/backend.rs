//! External interfaces consumed by the consensus core.
//!
//! The core never talks to the network, the key store, or the chain
//! database directly; everything goes through [`Backend`] and
//! [`ChainReader`]. Transport sends may block, so the core only calls
//! [`Backend::gossip`] / [`Backend::broadcast`] from fire-and-forget
//! tasks.

use crate::errors::Result;
use crate::types::{ConsensusEvent, MsgCode};
use crate::validator::ValidatorSet;
use async_trait::async_trait;
use ember_types::{Address, Block, BlockHeader};
use tokio::sync::mpsc;

/// Services the consensus core requires from the surrounding node.
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    /// This node's validator address.
    fn address(&self) -> Address;

    /// Sign `data`: Keccak256 then ECDSA, returning the 65-byte
    /// recoverable signature.
    fn sign(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Resolve the validator set effective at `block_number`.
    fn validators(&self, block_number: u64) -> Result<ValidatorSet>;

    /// The sending half of the core's event channel. Self-posted
    /// messages and block-availability events are delivered through it.
    fn event_sender(&self) -> mpsc::Sender<ConsensusEvent>;

    /// Best-effort send of `payload` to every member of `val_set` except
    /// ourselves.
    async fn gossip(&self, val_set: &ValidatorSet, payload: Vec<u8>) -> Result<()>;

    /// [`Backend::gossip`] plus posting the payload back to our own event
    /// channel, so the core processes its own messages through the same
    /// path as everyone else's.
    async fn broadcast(&self, val_set: &ValidatorSet, payload: Vec<u8>) -> Result<()> {
        self.gossip(val_set, payload.clone()).await?;
        // A closed channel means the core stopped; nothing left to notify
        let _ = self
            .event_sender()
            .send(ConsensusEvent::Message(payload))
            .await;
        Ok(())
    }

    /// Hand a decided block to the chain backend (per-height commit
    /// channel).
    async fn commit(&self, block: Block);

    /// Whether at least `f + 1` peers of `val_set` are connected.
    fn find_peers(&self, val_set: &ValidatorSet) -> bool;

    /// Called when a validator is caught sending two conflicting votes
    /// for the same (height, round, kind). Slashing is not a core
    /// concern; the default does nothing.
    fn handle_equivocation(&self, _sender: Address, _block_number: u64, _round: i64, _code: MsgCode) {
    }
}

/// Read-only access to persisted chain headers.
pub trait ChainReader: Send + Sync {
    /// The header at `number`, if the chain has one.
    fn header_by_number(&self, number: u64) -> Option<BlockHeader>;
}
