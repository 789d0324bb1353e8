//! ECDSA signatures using secp256k1.
//!
//! This module provides ECDSA signing with public-key recovery, compatible
//! with Ethereum-style message authentication: data is hashed with Keccak256,
//! the hash is signed, and verifiers recover the signer's public key (and
//! from it the 20-byte address) directly from the 65-byte signature.
//!
//! ## Example
//!
//! ```rust
//! use ember_crypto::ecdsa::PrivateKey;
//!
//! let key = PrivateKey::random();
//! let sig = key.sign(b"consensus payload").unwrap();
//!
//! let recovered = sig.recover(b"consensus payload").unwrap();
//! assert_eq!(recovered.to_address(), key.public_key().to_address());
//! ```

use crate::{keccak256, CryptoError, Result};
use k256::{
    ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    SecretKey,
};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

/// Ethereum-style 20-byte address
pub type Address = [u8; 20];

/// ECDSA private key (32 bytes)
#[derive(Clone)]
pub struct PrivateKey {
    inner: SigningKey,
}

impl PrivateKey {
    /// Generate a random private key using a cryptographically secure RNG.
    pub fn random() -> Self {
        let secret_key = SecretKey::random(&mut OsRng);
        Self {
            inner: SigningKey::from(secret_key),
        }
    }

    /// Create a private key from raw bytes.
    ///
    /// Returns an error if the bytes don't represent a valid private key.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        let secret_key = SecretKey::from_bytes(bytes.into())
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;
        Ok(Self {
            inner: SigningKey::from(secret_key),
        })
    }

    /// Create a private key from a hex string (with or without 0x prefix).
    pub fn from_hex(hex: &str) -> Result<Self> {
        let hex = hex.strip_prefix("0x").unwrap_or(hex);
        let bytes = hex::decode(hex)?;
        if bytes.len() != 32 {
            return Err(CryptoError::InvalidLength {
                expected: 32,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Self::from_bytes(&arr)
    }

    /// Derive the public key from this private key.
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            inner: *self.inner.verifying_key(),
        }
    }

    /// The signer's 20-byte address.
    pub fn address(&self) -> Address {
        self.public_key().to_address()
    }

    /// Sign raw data: the data is hashed with Keccak256, then signed.
    pub fn sign(&self, data: &[u8]) -> Result<Signature> {
        let hash = keccak256(data);
        self.sign_prehash(&hash)
    }

    /// Sign a pre-hashed message (32-byte hash).
    pub fn sign_prehash(&self, hash: &[u8; 32]) -> Result<Signature> {
        let (sig, recovery_id) = self
            .inner
            .sign_prehash_recoverable(hash)
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

        let r_bytes: [u8; 32] = sig.r().to_bytes().into();
        let s_bytes: [u8; 32] = sig.s().to_bytes().into();

        Ok(Signature {
            r: r_bytes,
            s: s_bytes,
            v: recovery_id.to_byte(),
        })
    }
}

impl std::fmt::Debug for PrivateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrivateKey")
            .field("address", &hex::encode(self.address()))
            .finish()
    }
}

/// ECDSA public key
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct PublicKey {
    inner: VerifyingKey,
}

impl PublicKey {
    /// Create a public key from SEC1 encoded bytes (compressed or uncompressed).
    pub fn from_sec1_bytes(bytes: &[u8]) -> Result<Self> {
        let verifying_key = VerifyingKey::from_sec1_bytes(bytes)
            .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;
        Ok(Self {
            inner: verifying_key,
        })
    }

    /// Get the uncompressed public key bytes (64 bytes, without 0x04 prefix).
    pub fn to_uncompressed(&self) -> [u8; 64] {
        let point = self.inner.to_encoded_point(false);
        let bytes = point.as_bytes();
        let mut result = [0u8; 64];
        result.copy_from_slice(&bytes[1..65]);
        result
    }

    /// Derive the Ethereum-style address from this public key.
    ///
    /// The address is the last 20 bytes of the Keccak256 hash of the
    /// uncompressed public key (without the 0x04 prefix).
    pub fn to_address(&self) -> Address {
        let uncompressed = self.to_uncompressed();
        let hash = keccak256(&uncompressed);
        let mut address = [0u8; 20];
        address.copy_from_slice(&hash[12..32]);
        address
    }

    /// Verify a signature against pre-hashed data.
    pub fn verify_prehash(&self, hash: &[u8; 32], signature: &Signature) -> Result<bool> {
        let sig = signature.to_k256_signature()?;

        use k256::ecdsa::signature::hazmat::PrehashVerifier;
        match self.inner.verify_prehash(hash, &sig) {
            Ok(()) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Verify a signature against raw data (hashed first).
    pub fn verify(&self, data: &[u8], signature: &Signature) -> Result<bool> {
        let hash = keccak256(data);
        self.verify_prehash(&hash, signature)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey")
            .field("address", &hex::encode(self.to_address()))
            .finish()
    }
}

/// ECDSA signature with recovery ID (r || s || v, 65 bytes on the wire)
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    /// The r component of the signature (32 bytes)
    pub r: [u8; 32],
    /// The s component of the signature (32 bytes)
    pub s: [u8; 32],
    /// Recovery ID (0 or 1)
    pub v: u8,
}

impl Signature {
    /// Create a signature from raw bytes (65 bytes: r || s || v).
    pub fn from_bytes(bytes: &[u8; 65]) -> Self {
        let mut r = [0u8; 32];
        let mut s = [0u8; 32];
        r.copy_from_slice(&bytes[0..32]);
        s.copy_from_slice(&bytes[32..64]);
        let v = bytes[64];
        Self { r, s, v }
    }

    /// Create a signature from a byte slice, checking the length.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 65 {
            return Err(CryptoError::InvalidLength {
                expected: 65,
                actual: bytes.len(),
            });
        }
        let mut arr = [0u8; 65];
        arr.copy_from_slice(bytes);
        Ok(Self::from_bytes(&arr))
    }

    /// Get the signature as raw bytes (65 bytes: r || s || v).
    pub fn to_bytes(&self) -> [u8; 65] {
        let mut bytes = [0u8; 65];
        bytes[0..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        bytes[64] = self.v;
        bytes
    }

    /// Get the normalized v value (0 or 1), accepting legacy 27/28 values.
    pub fn v_normalized(&self) -> u8 {
        if self.v >= 27 {
            self.v - 27
        } else {
            self.v
        }
    }

    fn to_k256_signature(&self) -> Result<K256Signature> {
        let mut bytes = [0u8; 64];
        bytes[0..32].copy_from_slice(&self.r);
        bytes[32..64].copy_from_slice(&self.s);
        K256Signature::from_bytes((&bytes).into())
            .map_err(|e| CryptoError::InvalidSignature(e.to_string()))
    }

    /// Recover the public key from this signature and the signed hash.
    pub fn recover_prehash(&self, hash: &[u8; 32]) -> Result<PublicKey> {
        let sig = self.to_k256_signature()?;
        let recovery_id = RecoveryId::from_byte(self.v_normalized())
            .ok_or_else(|| CryptoError::RecoveryFailed("invalid recovery id".to_string()))?;

        let verifying_key = VerifyingKey::recover_from_prehash(hash, &sig, recovery_id)
            .map_err(|e| CryptoError::RecoveryFailed(e.to_string()))?;

        Ok(PublicKey {
            inner: verifying_key,
        })
    }

    /// Recover the public key from this signature and raw data (hashed first).
    pub fn recover(&self, data: &[u8]) -> Result<PublicKey> {
        let hash = keccak256(data);
        self.recover_prehash(&hash)
    }
}

impl std::fmt::Debug for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signature")
            .field("r", &hex::encode(self.r))
            .field("s", &hex::encode(self.s))
            .field("v", &self.v)
            .finish()
    }
}
