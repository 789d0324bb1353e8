//! Validator-set resolution from checkpoint headers.
//!
//! The validator set for height `H` is read from the checkpoint header at
//! `H - (H % epoch)`: its consensus extra-data field carries the
//! RLP-encoded list of validator addresses effective for the epoch.

use crate::config::ProposerPolicy;
use crate::errors::{ConsensusError, Result};
use crate::backend::ChainReader;
use crate::validator::ValidatorSet;
use ember_types::Address;
use rlp::Rlp;
use tracing::debug;

/// Decode the RLP address list held in a checkpoint header's extra-data.
pub fn extract_validators(extra: &[u8]) -> Result<Vec<Address>> {
    let rlp = Rlp::new(extra);
    let addresses: Vec<Address> = rlp.as_list()?;
    Ok(addresses)
}

/// The checkpoint height whose header governs `block_number`.
pub fn checkpoint_number(epoch: u64, block_number: u64) -> u64 {
    block_number - (block_number % epoch)
}

/// Resolve the validator set effective at `block_number`.
///
/// Fails with [`ConsensusError::UnknownBlock`] when the checkpoint header
/// is absent and [`ConsensusError::EmptyValSet`] when the decoded list is
/// empty; decode errors propagate.
pub fn validator_set_for_height(
    chain: &dyn ChainReader,
    epoch: u64,
    block_number: u64,
) -> Result<ValidatorSet> {
    let checkpoint = checkpoint_number(epoch, block_number);
    let header = chain
        .header_by_number(checkpoint)
        .ok_or(ConsensusError::UnknownBlock)?;

    let addresses = extract_validators(&header.extra)?;
    if addresses.is_empty() {
        return Err(ConsensusError::EmptyValSet);
    }

    debug!(
        block_number = block_number,
        checkpoint = checkpoint,
        validators = addresses.len(),
        "resolved validator set"
    );

    Ok(ValidatorSet::new(addresses, ProposerPolicy::RoundRobin))
}

/// Encode a validator list into checkpoint extra-data form.
///
/// The inverse of [`extract_validators`]; used by genesis tooling and
/// tests to build checkpoint headers.
pub fn encode_validators(addresses: &[Address]) -> Vec<u8> {
    let mut stream = rlp::RlpStream::new_list(addresses.len());
    for address in addresses {
        stream.append(address);
    }
    stream.out().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_number() {
        assert_eq!(checkpoint_number(100, 0), 0);
        assert_eq!(checkpoint_number(100, 99), 0);
        assert_eq!(checkpoint_number(100, 100), 100);
        assert_eq!(checkpoint_number(100, 250), 200);
    }

    #[test]
    fn test_extract_roundtrip() {
        let addresses: Vec<Address> = (1u8..=4).map(|i| Address::from([i; 20])).collect();
        let extra = encode_validators(&addresses);
        assert_eq!(extract_validators(&extra).unwrap(), addresses);
    }

    #[test]
    fn test_extract_garbage_fails() {
        assert!(extract_validators(&[0xff, 0x01, 0x02]).is_err());
    }
}
