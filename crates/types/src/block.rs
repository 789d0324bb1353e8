//! Block and BlockHeader types for Ember.
//!
//! This module provides the block-related types:
//! - [`BlockHeader`] - The header containing chain metadata and the consensus
//!   extra-data field
//! - [`Block`] - A complete block with header and opaque transaction payloads
//!
//! The consensus core treats transaction contents as opaque: blocks are
//! assembled and executed by the chain backend, and the core only needs
//! stable hashing and wire encoding.

use crate::{Address, Error, Result, H256};
use bytes::Bytes;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A block header containing all metadata about a block.
///
/// The `extra` field carries consensus extra-data. At epoch checkpoint
/// heights it holds the RLP-encoded list of validator addresses effective
/// for the epoch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Block number (0-indexed, genesis is number 0)
    pub number: u64,
    /// Hash of the parent block (NIL for genesis)
    pub parent_hash: H256,
    /// Unix timestamp in seconds
    pub timestamp: u64,
    /// Address of the block proposer
    pub proposer: Address,
    /// Merkle root of the transactions in this block
    pub transactions_root: H256,
    /// Merkle root of the world state after executing this block
    pub state_root: H256,
    /// Maximum gas allowed in this block
    pub gas_limit: u64,
    /// Total gas used by all transactions in this block
    pub gas_used: u64,
    /// Consensus extra-data (RLP validator list at epoch checkpoints)
    #[serde(with = "serde_hex_bytes")]
    pub extra: Vec<u8>,
}

impl Default for BlockHeader {
    fn default() -> Self {
        Self {
            number: 0,
            parent_hash: H256::NIL,
            timestamp: 0,
            proposer: Address::ZERO,
            transactions_root: H256::NIL,
            state_root: H256::NIL,
            gas_limit: 30_000_000,
            gas_used: 0,
            extra: Vec::new(),
        }
    }
}

impl BlockHeader {
    /// Creates a new block header.
    pub fn new(number: u64, parent_hash: H256, timestamp: u64, proposer: Address) -> Self {
        Self {
            number,
            parent_hash,
            timestamp,
            proposer,
            ..Default::default()
        }
    }

    /// Computes the hash of this block header.
    ///
    /// The hash is the Keccak256 of the RLP-encoded header.
    pub fn hash(&self) -> H256 {
        H256::keccak256(&rlp::encode(self))
    }

    /// Decodes a header from RLP bytes.
    pub fn rlp_decode(data: &[u8]) -> Result<Self> {
        let rlp = Rlp::new(data);
        Self::decode(&rlp).map_err(Error::RlpDecode)
    }

    /// Validates the header against basic structural rules.
    pub fn validate_basic(&self) -> Result<()> {
        if self.number > 0 && self.parent_hash.is_nil() {
            return Err(Error::InvalidBlock(
                "non-genesis block must have parent hash".into(),
            ));
        }

        if self.gas_used > self.gas_limit {
            return Err(Error::InvalidBlock(format!(
                "gas used ({}) exceeds gas limit ({})",
                self.gas_used, self.gas_limit
            )));
        }

        Ok(())
    }

    /// Sets the consensus extra-data.
    pub fn with_extra(mut self, extra: Vec<u8>) -> Self {
        self.extra = extra;
        self
    }
}

impl Encodable for BlockHeader {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(9);
        s.append(&self.number);
        s.append(&self.parent_hash);
        s.append(&self.timestamp);
        s.append(&self.proposer);
        s.append(&self.transactions_root);
        s.append(&self.state_root);
        s.append(&self.gas_limit);
        s.append(&self.gas_used);
        s.append(&self.extra);
    }
}

impl Decodable for BlockHeader {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        if !rlp.is_list() || rlp.item_count()? != 9 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            number: rlp.val_at(0)?,
            parent_hash: rlp.val_at(1)?,
            timestamp: rlp.val_at(2)?,
            proposer: rlp.val_at(3)?,
            transactions_root: rlp.val_at(4)?,
            state_root: rlp.val_at(5)?,
            gas_limit: rlp.val_at(6)?,
            gas_used: rlp.val_at(7)?,
            extra: rlp.val_at(8)?,
        })
    }
}

/// A complete block: header plus opaque transaction payloads.
///
/// Transactions are carried as raw encoded bytes. The consensus core
/// never inspects them; building and executing blocks is the chain
/// backend's responsibility.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    /// The block header
    pub header: BlockHeader,
    /// Opaque encoded transactions
    pub transactions: Vec<Bytes>,
}

impl Block {
    /// Creates a new block from a header and transaction payloads.
    pub fn new(header: BlockHeader, transactions: Vec<Bytes>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    /// Creates an empty block with the given header.
    pub fn from_header(header: BlockHeader) -> Self {
        Self {
            header,
            transactions: Vec::new(),
        }
    }

    /// Returns the block number.
    #[inline]
    pub fn number(&self) -> u64 {
        self.header.number
    }

    /// Computes the block hash (the header hash).
    pub fn hash(&self) -> H256 {
        self.header.hash()
    }

    /// Decodes a block from RLP bytes.
    pub fn rlp_decode(data: &[u8]) -> Result<Self> {
        let rlp = Rlp::new(data);
        Self::decode(&rlp).map_err(Error::RlpDecode)
    }
}

impl fmt::Display for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Block(number={}, hash={}, txs={})",
            self.number(),
            self.hash(),
            self.transactions.len()
        )
    }
}

impl Encodable for Block {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(2);
        s.append(&self.header);
        s.begin_list(self.transactions.len());
        for tx in &self.transactions {
            s.append(&tx.as_ref());
        }
    }
}

impl Decodable for Block {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        if !rlp.is_list() || rlp.item_count()? != 2 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        let header: BlockHeader = rlp.val_at(0)?;
        let txs_rlp = rlp.at(1)?;
        let mut transactions = Vec::with_capacity(txs_rlp.item_count()?);
        for tx in txs_rlp.iter() {
            let raw: Vec<u8> = tx.as_val()?;
            transactions.push(Bytes::from(raw));
        }
        Ok(Self {
            header,
            transactions,
        })
    }
}

mod serde_hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(bytes)))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        let s = s.strip_prefix("0x").unwrap_or(&s);
        hex::decode(s).map_err(serde::de::Error::custom)
    }
}
