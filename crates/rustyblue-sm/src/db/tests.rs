//! Tests for the security database

use super::file::{decode_snapshot, encode_snapshot};
use super::*;
use crate::error::SmError;
use crate::gap::{AddressType, BdAddr, Whitelist};
use crate::smp::{Csrk, Ediv, Irk, Ltk, Rand};

fn addr(last: u8) -> BdAddr {
    BdAddr::new([0x10, 0x20, 0x30, 0x40, 0x50, last])
}

fn bond(db: &mut SecurityDb, peer: BdAddr) -> EntryHandle {
    let entry = db.open_entry(AddressType::Public, peer).unwrap();
    db.set_entry_peer_ltk(entry, &Ltk::new([peer.bytes[5]; 16]));
    db.set_entry_peer_ediv_rand(entry, &Ediv::from_u16(0x1234), &Rand::new([7; 8]));
    db.close_entry(entry, false);
    entry
}

#[test]
fn test_reserved_entry_freed_on_close() {
    let mut db = SecurityDb::memory(5);
    let entry = db.open_entry(AddressType::Public, addr(1)).unwrap();
    assert_eq!(db.entry_state(entry), Some(EntryState::Reserved));
    assert_eq!(db.distribution_flags(entry).unwrap().peer_address, addr(1));

    db.close_entry(entry, false);
    assert_eq!(db.entry_state(entry), Some(EntryState::Free));
    assert!(db.distribution_flags(entry).is_none());
}

#[test]
fn test_written_entry_found_again() {
    let mut db = SecurityDb::memory(5);
    let entry = bond(&mut db, addr(1));
    assert_eq!(db.entry_state(entry), Some(EntryState::Written));

    let reopened = db.open_entry(AddressType::Public, addr(1)).unwrap();
    assert_eq!(reopened, entry);

    // a second connection from the same address does not share the entry
    let other = db.open_entry(AddressType::Public, addr(1)).unwrap();
    assert_ne!(other, entry);
}

#[test]
fn test_local_keys_match_ediv_rand() {
    let mut db = SecurityDb::memory(5);
    let entry = db.open_entry(AddressType::Public, addr(1)).unwrap();
    let ltk = Ltk::new([0x42; 16]);
    let ediv = Ediv::from_u16(0xBEEF);
    let rand = Rand::new([1, 2, 3, 4, 5, 6, 7, 8]);
    db.set_entry_local_ltk(entry, &ltk);
    db.set_entry_local_ediv_rand(entry, &ediv, &rand);
    assert!(db.distribution_flags(entry).unwrap().ltk_sent);

    let query = db.get_entry_local_keys(entry, &ediv, &rand);
    assert_eq!(
        db.take_completion(),
        Some(DbCompletion::LocalKeys {
            query,
            entry,
            keys: Some(SecurityEntryKeys { ltk, ediv, rand }),
        })
    );

    let query = db.get_entry_local_keys(entry, &Ediv::from_u16(0xBEEE), &rand);
    assert_eq!(
        db.take_completion(),
        Some(DbCompletion::LocalKeys {
            query,
            entry,
            keys: None
        })
    );
    assert_eq!(db.take_completion(), None);
}

#[test]
fn test_secure_connections_keys_require_flag() {
    let mut db = SecurityDb::memory(5);
    let entry = db.open_entry(AddressType::Public, addr(1)).unwrap();
    db.set_entry_local_ltk(entry, &Ltk::new([9; 16]));

    db.get_entry_local_keys_secure_connections(entry);
    match db.take_completion() {
        Some(DbCompletion::LocalKeys { keys, .. }) => assert!(keys.is_none()),
        other => panic!("unexpected completion {other:?}"),
    }

    db.distribution_flags_mut(entry)
        .unwrap()
        .secure_connections_paired = true;
    db.get_entry_local_keys_secure_connections(entry);
    match db.take_completion() {
        Some(DbCompletion::LocalKeys { keys, .. }) => {
            assert_eq!(keys.unwrap().ltk, Ltk::new([9; 16]))
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

#[test]
fn test_queries_complete_exactly_once() {
    let mut db = SecurityDb::memory(5);
    let entry = db.open_entry(AddressType::Public, addr(1)).unwrap();
    let stale = EntryHandle(4);

    let queries = vec![
        db.get_entry_peer_keys(entry),
        db.get_entry_peer_csrk(entry),
        db.get_entry_identity(entry),
        db.get_entry_identity(stale),
        db.get_entry_local_keys(stale, &Ediv::default(), &Rand::default()),
        db.get_identity_list(5),
        db.generate_whitelist_from_bond_table(Whitelist::with_capacity(5)),
    ];

    let mut completed = Vec::new();
    while let Some(completion) = db.take_completion() {
        completed.push(completion.query());
    }
    assert_eq!(completed, queries);
    assert!(!db.has_pending_completions());
}

#[test]
fn test_identity_lookup() {
    let mut db = SecurityDb::memory(5);
    let connection_address = BdAddr::new([1, 2, 3, 4, 5, 0x45]);
    let identity_address = addr(9);
    let irk = Irk::new([3; 16]);

    let entry = db.open_entry(AddressType::Random, connection_address).unwrap();
    // resolvable private addresses are never kept as the peer address
    assert!(db.distribution_flags(entry).unwrap().peer_address.is_zero());

    db.get_entry_identity(entry);
    match db.take_completion() {
        Some(DbCompletion::Identity { identity, .. }) => assert!(identity.is_none()),
        other => panic!("unexpected completion {other:?}"),
    }

    db.set_entry_peer_irk(entry, &irk);
    db.set_entry_peer_bdaddr(entry, true, &identity_address);
    db.close_entry(entry, false);

    let reopened = db
        .open_entry(AddressType::PublicIdentity, identity_address)
        .unwrap();
    assert_eq!(reopened, entry);

    db.get_entry_identity(entry);
    match db.take_completion() {
        Some(DbCompletion::Identity { identity, .. }) => {
            let identity = identity.unwrap();
            assert_eq!(identity.irk, irk);
            assert_eq!(identity.identity_address, identity_address);
            assert!(identity.identity_address_is_public);
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

#[test]
fn test_identity_type_needs_irk() {
    let mut db = SecurityDb::memory(5);
    let entry = bond(&mut db, addr(1));
    let other = db
        .open_entry(AddressType::PublicIdentity, addr(1))
        .unwrap();
    assert_ne!(other, entry);
}

#[test]
fn test_one_entry_per_identity() {
    let mut db = SecurityDb::memory(5);
    let identity_address = addr(9);

    let first = db.open_entry(AddressType::Public, addr(1)).unwrap();
    db.set_entry_peer_irk(first, &Irk::new([1; 16]));
    db.set_entry_peer_bdaddr(first, true, &identity_address);
    db.close_entry(first, false);

    let second = db.open_entry(AddressType::Public, addr(2)).unwrap();
    db.set_entry_peer_irk(second, &Irk::new([2; 16]));
    db.set_entry_peer_bdaddr(second, true, &identity_address);

    assert_eq!(db.entry_state(first), Some(EntryState::Free));
    assert_eq!(db.entry_state(second), Some(EntryState::Written));
}

#[test]
fn test_pool_exhaustion() {
    let mut db = SecurityDb::memory(3);
    for i in 0..3 {
        assert!(db.open_entry(AddressType::Public, addr(i)).is_some());
    }
    assert!(db.open_entry(AddressType::Public, addr(7)).is_none());
}

#[test]
fn test_whitelist_truncation() {
    let mut db = SecurityDb::memory(8);
    for i in 0..8 {
        bond(&mut db, addr(i));
    }
    assert_eq!(db.written_count(), 8);

    let query = db.generate_whitelist_from_bond_table(Whitelist::with_capacity(5));
    match db.take_completion() {
        Some(DbCompletion::Whitelist {
            query: done,
            whitelist,
        }) => {
            assert_eq!(done, query);
            assert_eq!(whitelist.len(), 5);
            assert_eq!(whitelist.entries()[0].address, addr(0));
        }
        other => panic!("unexpected completion {other:?}"),
    }
}

#[test]
fn test_remove_and_clear() {
    let mut db = SecurityDb::memory(5);
    let first = bond(&mut db, addr(1));
    let second = bond(&mut db, addr(2));
    db.set_local_csrk(&Csrk::new([5; 16]));

    assert!(db.remove_entry(&addr(1)));
    assert!(!db.remove_entry(&addr(1)));
    assert_eq!(db.entry_state(first), Some(EntryState::Free));
    assert_eq!(db.entry_state(second), Some(EntryState::Written));

    db.clear_entries();
    assert_eq!(db.written_count(), 0);
    assert!(db.local_csrk().is_none());
}

#[test]
fn test_memory_storage_restore() {
    let mut storage = MemoryStorage::default();
    let mut db = SecurityDb::memory(5);
    bond(&mut db, addr(1));
    db.set_local_sign_counter(11);
    let snapshot = db.snapshot();
    storage.store(&snapshot).unwrap();

    let mut restored = SecurityDb::new(Box::new(storage), 5);
    restored.restore().unwrap();
    assert_eq!(restored.written_count(), 1);
    assert_eq!(restored.local_sign_counter(), 11);
}

#[test]
fn test_file_storage_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bonds.db");

    let mut db = SecurityDb::new(Box::new(FileStorage::open(&path).unwrap()), 5);
    db.restore().unwrap();
    assert_eq!(db.written_count(), 0);

    let entry = db.open_entry(AddressType::Public, addr(1)).unwrap();
    db.set_entry_peer_ltk(entry, &Ltk::new([1; 16]));
    db.set_entry_peer_ediv_rand(entry, &Ediv::from_u16(77), &Rand::new([8; 8]));
    db.set_entry_local_ltk(entry, &Ltk::new([2; 16]));
    db.set_entry_peer_irk(entry, &Irk::new([3; 16]));
    db.set_entry_peer_bdaddr(entry, true, &addr(1));
    db.set_entry_peer_csrk(entry, &Csrk::new([4; 16]));
    db.set_entry_peer_sign_counter(entry, 99);
    db.distribution_flags_mut(entry).unwrap().ltk_mitm_protected = true;
    db.set_local_identity(&Irk::new([6; 16]), &addr(0xC0), false);
    db.close_entry(entry, true);

    let mut reloaded = SecurityDb::new(Box::new(FileStorage::open(&path).unwrap()), 5);
    reloaded.restore().unwrap();
    assert_eq!(reloaded.written_count(), 1);

    let entry = reloaded.open_entry(AddressType::Public, addr(1)).unwrap();
    let flags = reloaded.distribution_flags(entry).unwrap().clone();
    assert!(flags.ltk_stored && flags.ltk_mitm_protected && flags.irk_stored);
    assert!(flags.csrk_stored && flags.ltk_sent);
    assert!(!flags.secure_connections_paired);

    reloaded.get_entry_peer_csrk(entry);
    match reloaded.take_completion() {
        Some(DbCompletion::PeerSigning { signing, .. }) => {
            let signing = signing.unwrap();
            assert_eq!(signing.csrk, Csrk::new([4; 16]));
            assert_eq!(signing.counter, 99);
        }
        other => panic!("unexpected completion {other:?}"),
    }
    assert_eq!(
        reloaded.local_identity().unwrap().identity_address,
        addr(0xC0)
    );
}

#[test]
fn test_corrupt_file_degrades_to_empty() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bonds.db");

    let mut db = SecurityDb::new(Box::new(FileStorage::open(&path).unwrap()), 5);
    bond(&mut db, addr(1));
    db.sync().unwrap();

    let mut data = std::fs::read(&path).unwrap();
    data[10] ^= 0xFF;
    std::fs::write(&path, &data).unwrap();

    let mut reloaded = SecurityDb::new(Box::new(FileStorage::open(&path).unwrap()), 5);
    assert!(matches!(
        reloaded.restore(),
        Err(SmError::CorruptDatabase(_))
    ));
    assert_eq!(reloaded.written_count(), 0);
    assert!(reloaded.open_entry(AddressType::Public, addr(1)).is_some());
}

#[test]
fn test_restore_disabled_ignores_bonds() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bonds.db");

    let mut db = SecurityDb::new(Box::new(FileStorage::open(&path).unwrap()), 5);
    bond(&mut db, addr(1));
    db.set_restore(false);

    let mut reloaded = SecurityDb::new(Box::new(FileStorage::open(&path).unwrap()), 5);
    reloaded.restore().unwrap();
    assert_eq!(reloaded.written_count(), 0);
    assert!(!reloaded.restore_enabled());
}

#[test]
fn test_decode_rejects_truncated_data() {
    let snapshot = DbSnapshot {
        entries: vec![EntryRecord::default()],
        ..DbSnapshot::default()
    };
    let data = encode_snapshot(&snapshot).unwrap();
    assert_eq!(decode_snapshot(&data).unwrap(), snapshot);
    assert!(decode_snapshot(&data[..data.len() - 9]).is_err());
    assert!(decode_snapshot(b"RB").is_err());
}
