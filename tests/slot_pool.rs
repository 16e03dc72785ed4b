//! Slot pool properties observed through the public API: no slot is ever
//! handed to two owners, and allocated + free always equals capacity.

use std::collections::HashSet;

use proptest::prelude::*;
use tlsvault::emulator::SoftElement;
use tlsvault::{AllocError, CipherSuite, CryptoError, Session, Side, Vault, VaultConfig};

const SUITE: CipherSuite = CipherSuite::Tls13Aes128GcmSha256;
const SESSIONS: usize = 4;

#[derive(Debug, Clone)]
enum Op {
    Reserve(usize),
    Close(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        3 => (0..SESSIONS).prop_map(Op::Reserve),
        1 => (0..SESSIONS).prop_map(Op::Close),
    ]
}

fn open(vault: &Vault) -> Session {
    vault.begin_handshake(Side::Client, SUITE).unwrap()
}

proptest! {
    #[test]
    fn test_slots_unique_and_conserved(ops in prop::collection::vec(op(), 1..80)) {
        let vault = Vault::new(SoftElement::new());
        let capacity = usize::from(vault.config().slot_capacity);
        let mut sessions: Vec<Session> = (0..SESSIONS).map(|_| open(&vault)).collect();
        let mut held = [0usize; SESSIONS];

        for op in ops {
            match op {
                Op::Reserve(i) => match sessions[i].reserve_slot() {
                    Ok(_) => held[i] += 1,
                    Err(CryptoError::Alloc(AllocError::SlotsExhausted)) => {
                        prop_assert_eq!(vault.allocated_slots(), capacity);
                    }
                    Err(other) => prop_assert!(false, "unexpected error: {}", other),
                },
                Op::Close(i) => {
                    prop_assert_eq!(sessions[i].close(), held[i]);
                    sessions[i] = open(&vault);
                    held[i] = 0;
                }
            }

            let total: usize = held.iter().sum();
            prop_assert_eq!(vault.allocated_slots(), total);
            prop_assert!(total <= capacity);

            let mut seen = HashSet::new();
            for session in &sessions {
                for slot in vault.slots_owned_by(session.id()) {
                    prop_assert!(seen.insert(slot), "{} owned twice", slot);
                }
            }
            prop_assert_eq!(seen.len(), total);
        }
    }
}

#[test]
fn test_exhaustion_is_reported() {
    let config = VaultConfig {
        slot_capacity: 3,
        ..VaultConfig::default()
    };
    let vault = Vault::with_config(SoftElement::new(), config).unwrap();
    let mut session = open(&vault);

    for _ in 0..3 {
        session.reserve_slot().unwrap();
    }
    assert_eq!(
        session.reserve_slot(),
        Err(CryptoError::Alloc(AllocError::SlotsExhausted))
    );

    // Running out of slots is not a hardware failure.
    assert_eq!(session.state(), tlsvault::SessionState::Idle);
    assert_eq!(session.close(), 3);
    assert_eq!(vault.allocated_slots(), 0);
}

#[test]
fn test_slot_ids_start_at_base() {
    let config = VaultConfig {
        slot_base: 0x0100,
        slot_capacity: 2,
        ..VaultConfig::default()
    };
    let vault = Vault::with_config(SoftElement::new(), config).unwrap();
    let mut session = open(&vault);
    let a = session.reserve_slot().unwrap();
    let b = session.reserve_slot().unwrap();
    assert_eq!(a.object_id(), 0x0100);
    assert_eq!(b.object_id(), 0x0101);
}
