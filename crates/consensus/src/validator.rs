//! Validators and the per-height validator set.
//!
//! The set is an ordered list of unique addresses, immutable within a
//! height; order comes from the checkpoint header. Proposer election is
//! round-robin: the cached proposer index advances by the round offset, so
//! election never scans the list.

use crate::config::ProposerPolicy;
use crate::errors::{ConsensusError, Result};
use ember_types::Address;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A consensus validator, identified by address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Validator {
    address: Address,
}

impl Validator {
    /// Create a new validator.
    pub fn new(address: Address) -> Self {
        Self { address }
    }

    /// The validator's address.
    #[inline]
    pub fn address(&self) -> Address {
        self.address
    }
}

impl fmt::Display for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.address)
    }
}

/// Ordered set of validators for one height.
///
/// Quorum arithmetic: for `n` validators, `f = ⌊(n-1)/3⌋` faults are
/// tolerated and `quorum = 2f + 1` votes are required for a majority.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidatorSet {
    validators: Vec<Validator>,
    proposer_idx: usize,
    policy: ProposerPolicy,
}

impl ValidatorSet {
    /// Create a validator set from an ordered address list.
    ///
    /// The first entry is the round-0 proposer. Order is preserved as
    /// given; it is derived deterministically from the checkpoint header.
    pub fn new(addresses: Vec<Address>, policy: ProposerPolicy) -> Self {
        let validators = addresses.into_iter().map(Validator::new).collect();
        Self {
            validators,
            proposer_idx: 0,
            policy,
        }
    }

    /// The ordered validator list.
    pub fn list(&self) -> &[Validator] {
        &self.validators
    }

    /// Number of validators.
    #[inline]
    pub fn size(&self) -> usize {
        self.validators.len()
    }

    /// Whether the set is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    /// Maximum number of faulty validators tolerated: `⌊(n-1)/3⌋`.
    pub fn f(&self) -> usize {
        self.validators.len().saturating_sub(1) / 3
    }

    /// Votes required for a two-thirds majority: `2f + 1`.
    pub fn quorum(&self) -> usize {
        2 * self.f() + 1
    }

    /// The proposer election policy.
    pub fn policy(&self) -> ProposerPolicy {
        self.policy
    }

    /// Look up a validator by address, returning its index in the set.
    pub fn get_by_address(&self, address: &Address) -> Option<(usize, &Validator)> {
        self.validators
            .iter()
            .enumerate()
            .find(|(_, v)| &v.address == address)
    }

    /// Whether the address belongs to the set.
    pub fn contains(&self, address: &Address) -> bool {
        self.get_by_address(address).is_some()
    }

    /// The current proposer.
    pub fn get_proposer(&self) -> Result<&Validator> {
        self.validators
            .get(self.proposer_idx)
            .ok_or(ConsensusError::EmptyValSet)
    }

    /// Whether the address is the current proposer.
    pub fn is_proposer(&self, address: &Address) -> bool {
        self.get_proposer()
            .map(|v| v.address == *address)
            .unwrap_or(false)
    }

    /// Advance the proposer by `round` positions from `prev_proposer`.
    ///
    /// Round-robin: the next proposer index is
    /// `(index_of(prev_proposer) + round) mod n`. The caller passes the
    /// round offset it is skipping over, so election is O(1) regardless of
    /// how many rounds were missed.
    pub fn calc_proposer(&mut self, prev_proposer: &Address, round: u64) -> Result<()> {
        if self.validators.is_empty() {
            return Err(ConsensusError::EmptyValSet);
        }
        let (idx, _) = self
            .get_by_address(prev_proposer)
            .ok_or(ConsensusError::InvalidValidatorAddress)?;
        self.proposer_idx = (idx + round as usize) % self.validators.len();
        Ok(())
    }
}

impl fmt::Display for ValidatorSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ValidatorSet(size={}, f={})", self.size(), self.f())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(byte: u8) -> Address {
        Address::from([byte; 20])
    }

    fn set_of(n: u8) -> ValidatorSet {
        ValidatorSet::new((0..n).map(|i| addr(i + 1)).collect(), ProposerPolicy::RoundRobin)
    }

    #[test]
    fn test_quorum_arithmetic() {
        let vs = set_of(4);
        assert_eq!(vs.f(), 1);
        assert_eq!(vs.quorum(), 3);

        let vs = set_of(7);
        assert_eq!(vs.f(), 2);
        assert_eq!(vs.quorum(), 5);

        let vs = set_of(1);
        assert_eq!(vs.f(), 0);
        assert_eq!(vs.quorum(), 1);
    }

    #[test]
    fn test_initial_proposer_is_first() {
        let vs = set_of(4);
        assert_eq!(vs.get_proposer().unwrap().address(), addr(1));
        assert!(vs.is_proposer(&addr(1)));
        assert!(!vs.is_proposer(&addr(2)));
    }

    #[test]
    fn test_calc_proposer_advances_round_robin() {
        let mut vs = set_of(4);
        vs.calc_proposer(&addr(1), 1).unwrap();
        assert_eq!(vs.get_proposer().unwrap().address(), addr(2));

        // Skipping several rounds wraps around
        vs.calc_proposer(&addr(2), 3).unwrap();
        assert_eq!(vs.get_proposer().unwrap().address(), addr(1));
    }

    #[test]
    fn test_calc_proposer_unknown_address() {
        let mut vs = set_of(4);
        assert!(matches!(
            vs.calc_proposer(&addr(0x99), 1),
            Err(ConsensusError::InvalidValidatorAddress)
        ));
    }

    #[test]
    fn test_empty_set_errors() {
        let mut vs = ValidatorSet::new(Vec::new(), ProposerPolicy::RoundRobin);
        assert!(matches!(vs.get_proposer(), Err(ConsensusError::EmptyValSet)));
        assert!(matches!(
            vs.calc_proposer(&addr(1), 0),
            Err(ConsensusError::EmptyValSet)
        ));
    }

    #[test]
    fn test_get_by_address() {
        let vs = set_of(4);
        let (idx, v) = vs.get_by_address(&addr(3)).unwrap();
        assert_eq!(idx, 2);
        assert_eq!(v.address(), addr(3));
        assert!(vs.get_by_address(&addr(0x99)).is_none());
    }
}
