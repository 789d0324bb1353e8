//! # Ember Types
//!
//! Core type definitions for the Ember blockchain.
//!
//! This crate provides the fundamental types used throughout Ember:
//! - [`Address`] - Ethereum-compatible 20-byte addresses
//! - [`H256`] - 32-byte hashes with Keccak256 support
//! - [`Block`] and [`BlockHeader`] - Block structures
//!
//! ## Example
//!
//! ```rust
//! use ember_types::{Address, H256};
//!
//! // Create an address from hex
//! let addr: Address = "0x742d35Cc6634C0532925a3b844Bc9e7595f0bEb1".parse().unwrap();
//!
//! // Create a hash
//! let hash = H256::keccak256(b"hello world");
//!
//! // Check the nil hash constant
//! assert_ne!(hash, H256::NIL);
//! ```

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod address;
pub mod block;
pub mod hash;

// Re-export main types at crate root
pub use address::Address;
pub use block::{Block, BlockHeader};
pub use hash::H256;

/// Result type alias for Ember types operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur when working with Ember types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),

    /// Invalid length for a fixed-size type
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid address format
    #[error("invalid address format: {0}")]
    InvalidAddress(String),

    /// Invalid hash format
    #[error("invalid hash format: {0}")]
    InvalidHash(String),

    /// Invalid block
    #[error("invalid block: {0}")]
    InvalidBlock(String),

    /// RLP decoding error
    #[error("RLP decode error: {0}")]
    RlpDecode(#[from] rlp::DecoderError),
}
