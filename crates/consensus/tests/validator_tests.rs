//! Tests for validator sets and round-robin proposer election.

use ember_consensus::{ConsensusError, ProposerPolicy, ValidatorSet};
use ember_types::Address;

fn addr(byte: u8) -> Address {
    Address::from([byte; 20])
}

fn set_of(n: u8) -> ValidatorSet {
    ValidatorSet::new(
        (0..n).map(|i| addr(i + 1)).collect(),
        ProposerPolicy::RoundRobin,
    )
}

#[test]
fn test_order_is_preserved_as_given() {
    // The constructor must not reorder; the checkpoint header dictates
    // the sequence, and element 0 proposes round 0
    let addresses = vec![addr(9), addr(3), addr(7), addr(1)];
    let vs = ValidatorSet::new(addresses.clone(), ProposerPolicy::RoundRobin);

    let listed: Vec<Address> = vs.list().iter().map(|v| v.address()).collect();
    assert_eq!(listed, addresses);
    assert_eq!(vs.get_proposer().unwrap().address(), addr(9));
}

#[test]
fn test_quorum_table() {
    // f = (n - 1) / 3, quorum = 2f + 1
    for (n, f, quorum) in [
        (1, 0, 1),
        (3, 0, 1),
        (4, 1, 3),
        (6, 1, 3),
        (7, 2, 5),
        (10, 3, 7),
    ] {
        let vs = set_of(n);
        assert_eq!(vs.f(), f, "f for n={}", n);
        assert_eq!(vs.quorum(), quorum, "quorum for n={}", n);
    }
}

#[test]
fn test_round_robin_walks_every_validator() {
    let mut vs = set_of(4);

    // Advancing one round at a time cycles through the whole set
    let mut seen = Vec::new();
    for _ in 0..4 {
        let current = vs.get_proposer().unwrap().address();
        seen.push(current);
        vs.calc_proposer(&current, 1).unwrap();
    }
    assert_eq!(seen, vec![addr(1), addr(2), addr(3), addr(4)]);

    // After a full cycle we are back at the start
    assert_eq!(vs.get_proposer().unwrap().address(), addr(1));
}

#[test]
fn test_skipped_rounds_advance_by_offset() {
    let mut vs = set_of(4);

    // Jumping straight from round 0 to round 3 lands on the same
    // proposer as three single steps would
    vs.calc_proposer(&addr(1), 3).unwrap();
    assert_eq!(vs.get_proposer().unwrap().address(), addr(4));

    // Offsets larger than the set wrap around
    vs.calc_proposer(&addr(4), 6).unwrap();
    assert_eq!(vs.get_proposer().unwrap().address(), addr(2));
}

#[test]
fn test_is_proposer_tracks_election() {
    let mut vs = set_of(4);
    assert!(vs.is_proposer(&addr(1)));
    assert!(!vs.is_proposer(&addr(2)));

    vs.calc_proposer(&addr(1), 1).unwrap();
    assert!(!vs.is_proposer(&addr(1)));
    assert!(vs.is_proposer(&addr(2)));
}

#[test]
fn test_membership_lookup() {
    let vs = set_of(4);

    assert!(vs.contains(&addr(2)));
    assert!(!vs.contains(&addr(0x42)));

    let (index, validator) = vs.get_by_address(&addr(4)).unwrap();
    assert_eq!(index, 3);
    assert_eq!(validator.address(), addr(4));
}

#[test]
fn test_empty_set_operations_fail() {
    let mut vs = ValidatorSet::new(Vec::new(), ProposerPolicy::RoundRobin);

    assert!(vs.is_empty());
    assert_eq!(vs.size(), 0);
    assert!(matches!(vs.get_proposer(), Err(ConsensusError::EmptyValSet)));
    assert!(matches!(
        vs.calc_proposer(&addr(1), 1),
        Err(ConsensusError::EmptyValSet)
    ));
}

#[test]
fn test_calc_proposer_from_unknown_address_fails() {
    let mut vs = set_of(4);
    assert!(matches!(
        vs.calc_proposer(&addr(0x42), 1),
        Err(ConsensusError::InvalidValidatorAddress)
    ));
    // The cached proposer is untouched by the failed call
    assert_eq!(vs.get_proposer().unwrap().address(), addr(1));
}
