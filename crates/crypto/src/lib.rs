//! # Ember Crypto
//!
//! Cryptographic primitives for the Ember blockchain:
//!
//! - Keccak256 hashing ([`keccak256`], [`keccak256_concat`])
//! - ECDSA over secp256k1 with public-key recovery ([`ecdsa`])
//!
//! Consensus messages are authenticated by signing the Keccak256 hash of
//! their canonical encoding and recovering the signer address from the
//! 65-byte recoverable signature.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![deny(unsafe_code)]

pub mod ecdsa;

pub use ecdsa::{Address, PrivateKey, PublicKey, Signature};

/// A 32-byte hash digest
pub type Hash = [u8; 32];

/// Result type alias for crypto operations
pub type Result<T> = std::result::Result<T, CryptoError>;

/// Errors that can occur during cryptographic operations
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Invalid private key bytes
    #[error("invalid private key: {0}")]
    InvalidPrivateKey(String),

    /// Invalid public key bytes
    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    /// Invalid signature bytes
    #[error("invalid signature: {0}")]
    InvalidSignature(String),

    /// Public key recovery failed
    #[error("recovery failed: {0}")]
    RecoveryFailed(String),

    /// Invalid length for a fixed-size input
    #[error("invalid length: expected {expected}, got {actual}")]
    InvalidLength {
        /// Expected length
        expected: usize,
        /// Actual length
        actual: usize,
    },

    /// Invalid hex string
    #[error("invalid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Computes the Keccak256 hash of the given data.
pub fn keccak256(data: &[u8]) -> Hash {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

/// Computes the Keccak256 hash of multiple data slices.
pub fn keccak256_concat(data: &[&[u8]]) -> Hash {
    use sha3::{Digest, Keccak256};
    let mut hasher = Keccak256::new();
    for slice in data {
        hasher.update(slice);
    }
    let mut out = [0u8; 32];
    out.copy_from_slice(&hasher.finalize());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keccak256_vector() {
        let hash = keccak256(b"");
        assert_eq!(
            hex::encode(hash),
            "c5d2460186f7233c927e7db2dcc703c0e500b653ca82273b7bfad8045d85a470"
        );
    }

    #[test]
    fn test_keccak256_concat_matches_single() {
        assert_eq!(
            keccak256_concat(&[b"hello", b" ", b"world"]),
            keccak256(b"hello world")
        );
    }
}
