use crate::db::DEFAULT_DB_CAPACITY;
use crate::smp::{IoCapability, Passkey};
use std::path::PathBuf;

/// Global defaults applied by `SecurityManager::init`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecurityManagerConfig {
    /// Request bonding when pairing
    pub bondable: bool,
    /// Require MITM protected keys
    pub mitm: bool,
    pub io_capability: IoCapability,
    /// Static passkey to display; a random one is used when absent
    pub passkey: Option<Passkey>,
    /// Exchange signing keys
    pub signing: bool,
    /// Bond storage file; bonds are kept in memory when absent
    pub db_path: Option<PathBuf>,
    /// Number of bonded peers the database can hold
    pub db_capacity: usize,
}

impl Default for SecurityManagerConfig {
    fn default() -> Self {
        Self {
            bondable: true,
            mitm: true,
            io_capability: IoCapability::NoInputNoOutput,
            passkey: None,
            signing: true,
            db_path: None,
            db_capacity: DEFAULT_DB_CAPACITY,
        }
    }
}
