//! Signed consensus message envelope and authentication.
//!
//! Every consensus payload travels in a [`Message`]: a 5-field RLP list of
//! `(code, payload, sender, signature, committed_seal)`. The signature
//! covers the Keccak256 hash of the message re-encoded with an empty
//! signature field; verifiers recover the signer address directly from the
//! 65-byte recoverable signature.

use crate::errors::Result;
use crate::types::MsgCode;
use ember_crypto::Signature;
use ember_types::Address;
use parking_lot::Mutex;
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::collections::HashMap;
use std::fmt;

/// A signed consensus message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Wire code; see [`MsgCode`]
    pub code: u64,
    /// Encoded payload (a [`Proposal`](crate::types::Proposal) or
    /// [`Vote`](crate::types::Vote))
    pub msg: Vec<u8>,
    /// Declared sender address
    pub address: Address,
    /// 65-byte recoverable signature over the cleared-signature encoding
    pub signature: Vec<u8>,
    /// Commit seal carried alongside precommits; opaque to the core
    pub committed_seal: Vec<u8>,
}

impl Message {
    /// Create an unsigned message.
    pub fn new(code: MsgCode, msg: Vec<u8>, address: Address) -> Self {
        Self {
            code: code.as_u64(),
            msg,
            address,
            signature: Vec::new(),
            committed_seal: Vec::new(),
        }
    }

    /// The canonical bytes covered by the signature: this message
    /// re-encoded with the signature field cleared.
    pub fn payload_for_signing(&self) -> Vec<u8> {
        let unsigned = Message {
            code: self.code,
            msg: self.msg.clone(),
            address: self.address,
            signature: Vec::new(),
            committed_seal: self.committed_seal.clone(),
        };
        rlp::encode(&unsigned).to_vec()
    }

    /// Recover the signer address from the signature.
    ///
    /// The signing bytes are hashed with Keccak256 before recovery,
    /// matching the signing side.
    pub fn address_from_signature(&self) -> Result<Address> {
        let sig = Signature::from_slice(&self.signature)?;
        let hash = ember_crypto::keccak256(&self.payload_for_signing());
        let pubkey = sig.recover_prehash(&hash)?;
        Ok(Address::from(pubkey.to_address()))
    }

    /// Decode a message from its RLP wire form.
    pub fn rlp_decode(data: &[u8]) -> Result<Self> {
        Ok(rlp::decode(data)?)
    }

    /// Encode this message to its RLP wire form.
    pub fn rlp_bytes(&self) -> Vec<u8> {
        rlp::encode(self).to_vec()
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message(code={}, from={})", self.code, self.address)
    }
}

impl Encodable for Message {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(5);
        s.append(&self.code);
        s.append(&self.msg);
        s.append(&self.address);
        s.append(&self.signature);
        s.append(&self.committed_seal);
    }
}

impl Decodable for Message {
    fn decode(rlp: &Rlp<'_>) -> std::result::Result<Self, DecoderError> {
        if !rlp.is_list() || rlp.item_count()? != 5 {
            return Err(DecoderError::RlpIncorrectListLen);
        }
        Ok(Self {
            code: rlp.val_at(0)?,
            msg: rlp.val_at(1)?,
            address: rlp.val_at(2)?,
            signature: rlp.val_at(3)?,
            committed_seal: rlp.val_at(4)?,
        })
    }
}

/// Per-sender message storage for one (height, round, kind).
///
/// Insertion is first-wins: a second message from the same sender is
/// rejected without altering the stored one.
#[derive(Debug, Default)]
pub struct MessageSet {
    messages: Mutex<HashMap<Address, Message>>,
}

impl MessageSet {
    /// Create an empty message set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a message keyed by its sender. Returns `false` when the
    /// sender already has a message recorded.
    pub fn add(&self, msg: Message) -> bool {
        let mut messages = self.messages.lock();
        if messages.contains_key(&msg.address) {
            return false;
        }
        messages.insert(msg.address, msg);
        true
    }

    /// Fetch the stored message for a sender.
    pub fn get(&self, address: &Address) -> Option<Message> {
        self.messages.lock().get(address).cloned()
    }

    /// Number of distinct senders recorded.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Whether the set is empty.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Addresses of all recorded senders.
    pub fn addresses(&self) -> Vec<Address> {
        self.messages.lock().keys().copied().collect()
    }
}
