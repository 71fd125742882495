//! Per-connection security state

use crate::db::EntryHandle;
use crate::gap::{BdAddr, ConnectionHandle};
use crate::smp::{KeyDistribution, LinkEncryption, PairingState};
use log::{debug, warn};

/// Number of links tracked when no capacity is configured
pub const DEFAULT_CONTROL_BLOCK_CAPACITY: usize = 5;

/// Consecutive signature failures tolerated before keys are refreshed
pub const MAX_CSRK_FAILURES: u8 = 3;

/// User input the controller is waiting for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MitmInput {
    Passkey,
    Confirmation,
}

/// Security state of one live link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlBlock {
    pub connection: ConnectionHandle,
    /// Database entry of the peer; `None` when the database was full
    pub db_entry: Option<EntryHandle>,
    /// Address the local device uses on this link
    pub local_address: BdAddr,
    pub initiator_key_distribution: KeyDistribution,
    pub responder_key_distribution: KeyDistribution,
    pub pairing_state: PairingState,
    pub pending_input: Option<MitmInput>,
    /// The entry held keys before this connection opened it
    pub entry_preexisting: bool,

    pub connected: bool,
    /// MITM protected encryption was reached during this connection
    pub authenticated: bool,
    pub is_master: bool,

    pub encryption_requested: bool,
    pub encryption_failed: bool,
    pub encrypted: bool,
    /// Level last reported by the controller while encrypted
    pub encryption_level: LinkEncryption,

    pub signing_requested: bool,
    /// `signing_requested` replaces the global signing default
    pub signing_override_default: bool,

    pub mitm_requested: bool,
    pub mitm_performed: bool,

    pub attempt_oob: bool,
    pub oob_mitm_protection: bool,
    pub oob_present: bool,
    pub legacy_pairing_oob_request_pending: bool,

    /// Signed write verification failures in a row, below [`MAX_CSRK_FAILURES`]
    pub csrk_failures: u8,
}

impl ControlBlock {
    pub fn new(connection: ConnectionHandle) -> Self {
        Self {
            connection,
            db_entry: None,
            local_address: BdAddr::default(),
            initiator_key_distribution: KeyDistribution::empty(),
            responder_key_distribution: KeyDistribution::empty(),
            pairing_state: PairingState::Idle,
            pending_input: None,
            entry_preexisting: false,
            connected: true,
            authenticated: false,
            is_master: false,
            encryption_requested: false,
            encryption_failed: false,
            encrypted: false,
            encryption_level: LinkEncryption::NotEncrypted,
            signing_requested: false,
            signing_override_default: false,
            mitm_requested: false,
            mitm_performed: false,
            attempt_oob: false,
            oob_mitm_protection: true,
            oob_present: false,
            legacy_pairing_oob_request_pending: false,
            csrk_failures: 0,
        }
    }

    /// Whether keys for signing are wanted on this link
    pub fn signing(&self, default: bool) -> bool {
        if self.signing_override_default {
            self.signing_requested
        } else {
            default
        }
    }
}

/// Fixed capacity arena of control blocks
#[derive(Debug)]
pub struct ControlBlockPool {
    slots: Vec<Option<ControlBlock>>,
}

impl ControlBlockPool {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of blocks in use
    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Take a free slot for a new link.
    ///
    /// Returns `None` when the pool is exhausted or the handle already owns a
    /// block; existing blocks are never touched.
    pub fn acquire(&mut self, connection: ConnectionHandle) -> Option<&mut ControlBlock> {
        if self.get(connection).is_some() {
            warn!("Connection {} already has a control block", connection);
            return None;
        }
        let Some(slot) = self.slots.iter_mut().find(|slot| slot.is_none()) else {
            warn!("No free control block for connection {}", connection);
            return None;
        };
        debug!("Acquired control block for connection {}", connection);
        Some(slot.insert(ControlBlock::new(connection)))
    }

    pub fn get(&self, connection: ConnectionHandle) -> Option<&ControlBlock> {
        self.iter().find(|cb| cb.connection == connection)
    }

    pub fn get_mut(&mut self, connection: ConnectionHandle) -> Option<&mut ControlBlock> {
        self.slots
            .iter_mut()
            .flatten()
            .find(|cb| cb.connection == connection)
    }

    pub fn find_by_entry(&self, entry: EntryHandle) -> Option<&ControlBlock> {
        self.iter().find(|cb| cb.db_entry == Some(entry))
    }

    pub fn find<P>(&self, mut predicate: P) -> Option<&ControlBlock>
    where
        P: FnMut(&ControlBlock) -> bool,
    {
        self.iter().find(|cb| predicate(cb))
    }

    /// Free the block of a link. Releasing a free block does nothing.
    pub fn release(&mut self, connection: ConnectionHandle) -> Option<ControlBlock> {
        let slot = self
            .slots
            .iter_mut()
            .find(|slot| matches!(slot, Some(cb) if cb.connection == connection))?;
        debug!("Released control block for connection {}", connection);
        slot.take()
    }

    pub fn release_all(&mut self) {
        self.slots.iter_mut().for_each(|slot| *slot = None);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ControlBlock> {
        self.slots.iter().flatten()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut ControlBlock> {
        self.slots.iter_mut().flatten()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_bound() {
        let mut pool = ControlBlockPool::with_capacity(3);
        for handle in 1..=3 {
            pool.acquire(handle).unwrap().is_master = handle == 2;
        }
        assert!(pool.acquire(4).is_none());
        assert_eq!(pool.len(), 3);
        assert!(pool.get(2).unwrap().is_master);
        assert!(!pool.get(1).unwrap().is_master);
        assert!(pool.get(4).is_none());
    }

    #[test]
    fn test_duplicate_handle_rejected() {
        let mut pool = ControlBlockPool::with_capacity(2);
        pool.acquire(7).unwrap().encrypted = true;
        assert!(pool.acquire(7).is_none());
        assert!(pool.get(7).unwrap().encrypted);
        assert_eq!(pool.len(), 1);
    }

    #[test]
    fn test_release_is_idempotent() {
        let mut pool = ControlBlockPool::with_capacity(2);
        pool.acquire(1);
        pool.acquire(2);
        assert!(pool.release(1).is_some());
        assert!(pool.release(1).is_none());
        assert!(pool.release(1).is_none());
        assert_eq!(pool.len(), 1);
        assert!(pool.get(2).is_some());

        // The freed slot can be reused
        assert!(pool.acquire(3).is_some());
        assert!(pool.acquire(4).is_none());
    }

    #[test]
    fn test_signing_override() {
        let mut cb = ControlBlock::new(1);
        assert!(cb.signing(true));
        cb.signing_override_default = true;
        assert!(!cb.signing(true));
        cb.signing_requested = true;
        assert!(cb.signing(false));
    }
}
