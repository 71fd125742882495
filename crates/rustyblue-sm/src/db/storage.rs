use super::{EntryRecord, SecurityEntryIdentity};
use crate::error::SmResult;
use crate::smp::Csrk;

/// Image of the database as handed to a storage back end
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbSnapshot {
    pub restore: bool,
    pub local_identity: Option<SecurityEntryIdentity>,
    pub local_csrk: Option<Csrk>,
    pub local_sign_counter: u32,
    /// Written entries only
    pub entries: Vec<EntryRecord>,
}

impl Default for DbSnapshot {
    fn default() -> Self {
        Self {
            restore: true,
            local_identity: None,
            local_csrk: None,
            local_sign_counter: 0,
            entries: Vec::new(),
        }
    }
}

/// Durable home of the security database
pub trait DbStorage {
    /// Read the last stored snapshot; `Ok(None)` when nothing was stored yet
    fn load(&mut self) -> SmResult<Option<DbSnapshot>>;

    /// Replace the stored snapshot
    fn store(&mut self, snapshot: &DbSnapshot) -> SmResult<()>;
}

/// Keeps the last synced snapshot in memory
///
/// Bonds survive a manager reset but not the process.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    snapshot: Option<DbSnapshot>,
}

impl DbStorage for MemoryStorage {
    fn load(&mut self) -> SmResult<Option<DbSnapshot>> {
        Ok(self.snapshot.clone())
    }

    fn store(&mut self, snapshot: &DbSnapshot) -> SmResult<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }
}
