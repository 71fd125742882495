//! Security database
//!
//! Bonded device records live in a fixed pool of entries addressed by an
//! [`EntryHandle`]. An entry moves from `Free` to `Reserved` when a
//! connection opens it, to `Written` once any key lands in it, and back to
//! `Free` when it is closed unwritten, removed or purged.
//!
//! Key lookups are queries: each `get_*` call returns a [`QueryId`] and the
//! answer is queued as a [`DbCompletion`] that carries the same id. Every
//! query completes exactly once, with `None` standing for "not found".
//! Durability is delegated to a [`DbStorage`] back end.

mod file;
mod storage;

pub use self::file::FileStorage;
pub use self::storage::{DbSnapshot, DbStorage, MemoryStorage};

use crate::error::SmResult;
use crate::gap::{AddressType, BdAddr, Whitelist, WhitelistAddressType, WhitelistEntry};
use crate::smp::{Csrk, Ediv, Irk, Ltk, Rand};
use log::{debug, info, warn};
use std::collections::VecDeque;

/// Number of bonded peers kept when no capacity is configured
pub const DEFAULT_DB_CAPACITY: usize = 5;

/// Opaque reference to a database entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryHandle(usize);

impl EntryHandle {
    pub fn index(&self) -> usize {
        self.0
    }
}

/// Correlation id tying a completion to the query that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryId(u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EntryState {
    #[default]
    Free,
    Reserved,
    Written,
}

/// Which keys were exchanged with a peer and how they were obtained
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecurityDistributionFlags {
    /// Address used to identify the peer before its identity is known
    pub peer_address: BdAddr,
    pub peer_address_is_public: bool,
    pub encryption_key_size: u8,
    pub csrk_stored: bool,
    pub csrk_mitm_protected: bool,
    pub ltk_stored: bool,
    pub ltk_mitm_protected: bool,
    /// Local LTK handed to the peer
    pub ltk_sent: bool,
    pub irk_stored: bool,
    pub secure_connections_paired: bool,
}

/// LTK with the EDIV and RAND that identify it
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityEntryKeys {
    pub ltk: Ltk,
    pub ediv: Ediv,
    pub rand: Rand,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityEntryIdentity {
    pub irk: Irk,
    pub identity_address: BdAddr,
    pub identity_address_is_public: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SecurityEntrySigning {
    pub csrk: Csrk,
    pub counter: u32,
}

/// Everything persisted for one peer
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryRecord {
    pub flags: SecurityDistributionFlags,
    pub peer_keys: SecurityEntryKeys,
    pub local_keys: SecurityEntryKeys,
    pub peer_identity: SecurityEntryIdentity,
    pub peer_signing: SecurityEntrySigning,
}

#[derive(Debug, Clone, Default)]
struct Entry {
    state: EntryState,
    /// Held by a live connection
    connected: bool,
    record: EntryRecord,
}

impl Entry {
    fn is_written(&self) -> bool {
        self.state == EntryState::Written
    }

    fn claims_identity(&self, address: &BdAddr, is_public: bool) -> bool {
        self.record.flags.irk_stored
            && self.record.peer_identity.identity_address == *address
            && self.record.peer_identity.identity_address_is_public == is_public
    }
}

/// Answer to a database query
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbCompletion {
    LocalKeys {
        query: QueryId,
        entry: EntryHandle,
        keys: Option<SecurityEntryKeys>,
    },
    PeerKeys {
        query: QueryId,
        entry: EntryHandle,
        keys: Option<SecurityEntryKeys>,
    },
    PeerSigning {
        query: QueryId,
        entry: EntryHandle,
        signing: Option<SecurityEntrySigning>,
    },
    Identity {
        query: QueryId,
        entry: EntryHandle,
        identity: Option<SecurityEntryIdentity>,
    },
    IdentityList {
        query: QueryId,
        identities: Vec<SecurityEntryIdentity>,
    },
    Whitelist {
        query: QueryId,
        whitelist: Whitelist,
    },
}

impl DbCompletion {
    pub fn query(&self) -> QueryId {
        match self {
            DbCompletion::LocalKeys { query, .. }
            | DbCompletion::PeerKeys { query, .. }
            | DbCompletion::PeerSigning { query, .. }
            | DbCompletion::Identity { query, .. }
            | DbCompletion::IdentityList { query, .. }
            | DbCompletion::Whitelist { query, .. } => *query,
        }
    }
}

/// Fixed capacity store of bonded device records
pub struct SecurityDb {
    entries: Vec<Entry>,
    local_identity: Option<SecurityEntryIdentity>,
    local_csrk: Option<Csrk>,
    local_sign_counter: u32,
    /// Whether stored bonds are loaded again by [`SecurityDb::restore`]
    restore: bool,
    storage: Box<dyn DbStorage>,
    completions: VecDeque<DbCompletion>,
    next_query: u64,
}

impl SecurityDb {
    pub fn new(storage: Box<dyn DbStorage>, capacity: usize) -> Self {
        Self {
            entries: vec![Entry::default(); capacity],
            local_identity: None,
            local_csrk: None,
            local_sign_counter: 0,
            restore: true,
            storage,
            completions: VecDeque::new(),
            next_query: 0,
        }
    }

    /// Volatile database backed by [`MemoryStorage`]
    pub fn memory(capacity: usize) -> Self {
        Self::new(Box::new(MemoryStorage::default()), capacity)
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn entry_state(&self, entry: EntryHandle) -> Option<EntryState> {
        self.entries.get(entry.0).map(|e| e.state)
    }

    /// Number of entries holding keys
    pub fn written_count(&self) -> usize {
        self.entries.iter().filter(|e| e.is_written()).count()
    }

    fn live_entry(&self, entry: EntryHandle) -> Option<&Entry> {
        self.entries
            .get(entry.0)
            .filter(|e| e.state != EntryState::Free)
    }

    fn live_entry_mut(&mut self, entry: EntryHandle) -> Option<&mut Entry> {
        self.entries
            .get_mut(entry.0)
            .filter(|e| e.state != EntryState::Free)
    }

    /// Entry about to receive a key; it now counts as written
    fn written_entry_mut(&mut self, entry: EntryHandle) -> Option<&mut Entry> {
        match self.live_entry_mut(entry) {
            Some(e) => {
                e.state = EntryState::Written;
                Some(e)
            }
            None => {
                warn!("Ignoring write to free security database entry {}", entry.0);
                None
            }
        }
    }

    pub fn distribution_flags(&self, entry: EntryHandle) -> Option<&SecurityDistributionFlags> {
        self.live_entry(entry).map(|e| &e.record.flags)
    }

    /// Mutable flags; does not change the entry state
    pub fn distribution_flags_mut(
        &mut self,
        entry: EntryHandle,
    ) -> Option<&mut SecurityDistributionFlags> {
        self.live_entry_mut(entry).map(|e| &mut e.record.flags)
    }

    pub fn set_distribution_flags(&mut self, entry: EntryHandle, flags: SecurityDistributionFlags) {
        if let Some(e) = self.written_entry_mut(entry) {
            e.record.flags = flags;
        }
    }

    fn next_query_id(&mut self) -> QueryId {
        let id = QueryId(self.next_query);
        self.next_query = self.next_query.wrapping_add(1);
        id
    }

    /// Pop the oldest pending completion
    pub fn take_completion(&mut self) -> Option<DbCompletion> {
        self.completions.pop_front()
    }

    pub fn has_pending_completions(&self) -> bool {
        !self.completions.is_empty()
    }

    /// Local LTK matching a legacy EDIV and RAND
    pub fn get_entry_local_keys(&mut self, entry: EntryHandle, ediv: &Ediv, rand: &Rand) -> QueryId {
        let query = self.next_query_id();
        let keys = self
            .live_entry(entry)
            .map(|e| e.record.local_keys)
            .filter(|keys| keys.ediv == *ediv && keys.rand == *rand);
        self.completions
            .push_back(DbCompletion::LocalKeys { query, entry, keys });
        query
    }

    /// Local LTK of a Secure Connections bond
    pub fn get_entry_local_keys_secure_connections(&mut self, entry: EntryHandle) -> QueryId {
        let query = self.next_query_id();
        let keys = self
            .live_entry(entry)
            .filter(|e| e.record.flags.secure_connections_paired)
            .map(|e| e.record.local_keys);
        self.completions
            .push_back(DbCompletion::LocalKeys { query, entry, keys });
        query
    }

    pub fn get_entry_peer_keys(&mut self, entry: EntryHandle) -> QueryId {
        let query = self.next_query_id();
        let keys = self
            .live_entry(entry)
            .filter(|e| e.record.flags.ltk_stored)
            .map(|e| e.record.peer_keys);
        self.completions
            .push_back(DbCompletion::PeerKeys { query, entry, keys });
        query
    }

    pub fn get_entry_peer_csrk(&mut self, entry: EntryHandle) -> QueryId {
        let query = self.next_query_id();
        let signing = self
            .live_entry(entry)
            .filter(|e| e.record.flags.csrk_stored)
            .map(|e| e.record.peer_signing);
        self.completions.push_back(DbCompletion::PeerSigning {
            query,
            entry,
            signing,
        });
        query
    }

    pub fn get_entry_identity(&mut self, entry: EntryHandle) -> QueryId {
        let query = self.next_query_id();
        let identity = self
            .live_entry(entry)
            .filter(|e| e.record.flags.irk_stored)
            .map(|e| e.record.peer_identity);
        self.completions.push_back(DbCompletion::Identity {
            query,
            entry,
            identity,
        });
        query
    }

    /// Identities of all bonded peers that distributed an IRK, up to `max`
    pub fn get_identity_list(&mut self, max: usize) -> QueryId {
        let query = self.next_query_id();
        let identities = self
            .entries
            .iter()
            .filter(|e| e.is_written() && e.record.flags.irk_stored)
            .map(|e| e.record.peer_identity)
            .take(max)
            .collect();
        self.completions
            .push_back(DbCompletion::IdentityList { query, identities });
        query
    }

    /// Fill `whitelist` with the identity of every bonded peer.
    ///
    /// Peers that never distributed an identity are listed under the address
    /// they bonded with. Filling stops silently once the list is full.
    pub fn generate_whitelist_from_bond_table(&mut self, mut whitelist: Whitelist) -> QueryId {
        let query = self.next_query_id();
        for entry in self.entries.iter().filter(|e| e.is_written()) {
            if whitelist.is_full() {
                break;
            }
            let flags = &entry.record.flags;
            let (address, is_public) = if flags.irk_stored {
                let identity = &entry.record.peer_identity;
                (identity.identity_address, identity.identity_address_is_public)
            } else if !flags.peer_address.is_zero() {
                (flags.peer_address, flags.peer_address_is_public)
            } else {
                continue;
            };
            whitelist.push(WhitelistEntry {
                address_type: if is_public {
                    WhitelistAddressType::Public
                } else {
                    WhitelistAddressType::RandomStatic
                },
                address,
            });
        }
        self.completions
            .push_back(DbCompletion::Whitelist { query, whitelist });
        query
    }

    pub fn set_entry_local_ltk(&mut self, entry: EntryHandle, ltk: &Ltk) {
        if let Some(e) = self.written_entry_mut(entry) {
            e.record.flags.ltk_sent = true;
            e.record.local_keys.ltk = *ltk;
        }
    }

    pub fn set_entry_local_ediv_rand(&mut self, entry: EntryHandle, ediv: &Ediv, rand: &Rand) {
        if let Some(e) = self.written_entry_mut(entry) {
            e.record.local_keys.ediv = *ediv;
            e.record.local_keys.rand = *rand;
        }
    }

    pub fn set_entry_peer_ltk(&mut self, entry: EntryHandle, ltk: &Ltk) {
        if let Some(e) = self.written_entry_mut(entry) {
            e.record.flags.ltk_stored = true;
            e.record.peer_keys.ltk = *ltk;
        }
    }

    pub fn set_entry_peer_ediv_rand(&mut self, entry: EntryHandle, ediv: &Ediv, rand: &Rand) {
        if let Some(e) = self.written_entry_mut(entry) {
            e.record.peer_keys.ediv = *ediv;
            e.record.peer_keys.rand = *rand;
        }
    }

    pub fn set_entry_peer_irk(&mut self, entry: EntryHandle, irk: &Irk) {
        if let Some(e) = self.written_entry_mut(entry) {
            e.record.flags.irk_stored = true;
            e.record.peer_identity.irk = *irk;
        }
    }

    /// Record the identity address of the peer.
    ///
    /// An older disconnected entry claiming the same identity is dropped so
    /// that a peer never owns two bonds.
    pub fn set_entry_peer_bdaddr(&mut self, entry: EntryHandle, is_public: bool, address: &BdAddr) {
        let Some(e) = self.written_entry_mut(entry) else {
            return;
        };
        e.record.peer_identity.identity_address = *address;
        e.record.peer_identity.identity_address_is_public = is_public;

        for (index, other) in self.entries.iter_mut().enumerate() {
            if index != entry.0
                && other.is_written()
                && !other.connected
                && other.claims_identity(address, is_public)
            {
                debug!("Dropping stale bond {} for identity {}", index, address);
                *other = Entry::default();
            }
        }
    }

    pub fn set_entry_peer_csrk(&mut self, entry: EntryHandle, csrk: &Csrk) {
        if let Some(e) = self.written_entry_mut(entry) {
            e.record.flags.csrk_stored = true;
            e.record.peer_signing.csrk = *csrk;
        }
    }

    pub fn set_entry_peer_sign_counter(&mut self, entry: EntryHandle, counter: u32) {
        if let Some(e) = self.written_entry_mut(entry) {
            e.record.peer_signing.counter = counter;
        }
    }

    pub fn local_identity(&self) -> Option<&SecurityEntryIdentity> {
        self.local_identity.as_ref()
    }

    pub fn set_local_identity(&mut self, irk: &Irk, identity_address: &BdAddr, is_public: bool) {
        self.local_identity = Some(SecurityEntryIdentity {
            irk: *irk,
            identity_address: *identity_address,
            identity_address_is_public: is_public,
        });
    }

    pub fn local_csrk(&self) -> Option<&Csrk> {
        self.local_csrk.as_ref()
    }

    pub fn set_local_csrk(&mut self, csrk: &Csrk) {
        self.local_csrk = Some(*csrk);
    }

    pub fn local_sign_counter(&self) -> u32 {
        self.local_sign_counter
    }

    pub fn set_local_sign_counter(&mut self, counter: u32) {
        self.local_sign_counter = counter;
    }

    /// Find the bond of a newly connected peer or reserve a slot for it.
    ///
    /// Identity addresses are matched first, then the raw connection address.
    /// Entries held by another live connection are never returned. `None`
    /// means the pool is full.
    pub fn open_entry(&mut self, address_type: AddressType, address: BdAddr) -> Option<EntryHandle> {
        let is_public = address_type.is_public();

        let by_identity = self.entries.iter().position(|e| {
            e.is_written() && !e.connected && e.claims_identity(&address, is_public)
        });
        let existing = by_identity.or_else(|| {
            if address_type.is_identity() {
                return None;
            }
            self.entries.iter().position(|e| {
                let flags = &e.record.flags;
                e.is_written()
                    && !e.connected
                    && !flags.peer_address.is_zero()
                    && flags.peer_address == address
                    && flags.peer_address_is_public == is_public
            })
        });

        if let Some(index) = existing {
            self.entries[index].connected = true;
            debug!("Opened bonded security entry {} for {}", index, address);
            return Some(EntryHandle(index));
        }

        let Some(index) = self
            .entries
            .iter()
            .position(|e| e.state == EntryState::Free)
        else {
            warn!("Security database full, {} cannot be stored", address);
            return None;
        };

        let entry = &mut self.entries[index];
        *entry = Entry {
            state: EntryState::Reserved,
            connected: true,
            record: EntryRecord::default(),
        };
        if !address.is_private(address_type) {
            entry.record.flags.peer_address = address;
        }
        entry.record.flags.peer_address_is_public = is_public;
        debug!("Reserved security entry {} for {}", index, address);
        Some(EntryHandle(index))
    }

    /// Release an entry at the end of a connection.
    ///
    /// A reserved entry that never received a key returns to the pool.
    pub fn close_entry(&mut self, entry: EntryHandle, require_sync: bool) {
        let Some(e) = self.entries.get_mut(entry.0) else {
            return;
        };
        e.connected = false;
        if e.state == EntryState::Reserved {
            *e = Entry::default();
        }
        if require_sync {
            if let Err(err) = self.sync() {
                warn!("Failed to sync security database: {}", err);
            }
        }
    }

    /// Drop an entry regardless of its state
    pub fn discard_entry(&mut self, entry: EntryHandle) {
        if let Some(e) = self.entries.get_mut(entry.0) {
            *e = Entry::default();
        }
    }

    /// Delete the bond of a peer identified by its identity address
    pub fn remove_entry(&mut self, identity_address: &BdAddr) -> bool {
        let mut removed = false;
        for entry in self.entries.iter_mut().filter(|e| e.is_written()) {
            let matches = if entry.record.flags.irk_stored {
                entry.record.peer_identity.identity_address == *identity_address
            } else {
                entry.record.flags.peer_address == *identity_address
            };
            if matches {
                *entry = Entry::default();
                removed = true;
            }
        }
        removed
    }

    /// Forget every bond and the local keys
    pub fn clear_entries(&mut self) {
        for entry in self.entries.iter_mut() {
            *entry = Entry::default();
        }
        self.local_identity = None;
        self.local_csrk = None;
        self.local_sign_counter = 0;
        info!("Security database cleared");
    }

    pub fn set_restore(&mut self, restore: bool) {
        self.restore = restore;
        if let Err(err) = self.sync() {
            warn!("Failed to persist restore flag: {}", err);
        }
    }

    pub fn restore_enabled(&self) -> bool {
        self.restore
    }

    fn snapshot(&self) -> DbSnapshot {
        DbSnapshot {
            restore: self.restore,
            local_identity: self.local_identity,
            local_csrk: self.local_csrk,
            local_sign_counter: self.local_sign_counter,
            entries: self
                .entries
                .iter()
                .filter(|e| e.is_written())
                .map(|e| e.record.clone())
                .collect(),
        }
    }

    /// Write all bonds to the storage back end
    pub fn sync(&mut self) -> SmResult<()> {
        let snapshot = self.snapshot();
        self.storage.store(&snapshot)
    }

    /// Drop the in-memory state and load it again from storage.
    ///
    /// With restore disabled this leaves the database empty.
    pub fn reload(&mut self) -> SmResult<()> {
        for entry in self.entries.iter_mut() {
            *entry = Entry::default();
        }
        self.local_identity = None;
        self.local_csrk = None;
        self.local_sign_counter = 0;
        self.completions.clear();
        self.restore()
    }

    /// Load bonds from the storage back end.
    ///
    /// On failure the database is left empty and the error is returned; a
    /// lost or corrupt store means "no bonded peers".
    pub fn restore(&mut self) -> SmResult<()> {
        let snapshot = match self.storage.load() {
            Ok(snapshot) => snapshot,
            Err(err) => {
                warn!("Discarding unreadable security database: {}", err);
                return Err(err);
            }
        };
        let Some(snapshot) = snapshot else {
            debug!("No stored security database");
            return Ok(());
        };

        self.restore = snapshot.restore;
        if !snapshot.restore {
            info!("Stored bonds ignored, restore disabled");
            return Ok(());
        }

        let capacity = self.entries.len();
        if snapshot.entries.len() > capacity {
            warn!(
                "Stored database holds {} bonds, keeping the first {}",
                snapshot.entries.len(),
                capacity
            );
        }
        for (slot, record) in self.entries.iter_mut().zip(snapshot.entries) {
            *slot = Entry {
                state: EntryState::Written,
                connected: false,
                record,
            };
        }
        self.local_identity = snapshot.local_identity;
        self.local_csrk = snapshot.local_csrk;
        self.local_sign_counter = snapshot.local_sign_counter;
        info!("Restored {} bonded peers", self.written_count());
        Ok(())
    }
}

#[cfg(test)]
mod tests;
