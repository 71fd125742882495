//! RustyBlue SM - Bluetooth Low Energy Security Manager
//!
//! This library implements the host side of the BLE Security Manager: it
//! decides how links are paired and encrypted, answers the controller's key
//! requests from a bond database, and reports security events to the
//! application. The link controller itself sits behind the platform
//! abstraction layer in [`pal`], so the same manager can drive a real HCI
//! transport or a test double.

pub mod db;
pub mod error;
pub mod gap;
pub mod manager;
pub mod pal;
pub mod smp;

// Re-export common types for convenience
pub use db::{DbStorage, FileStorage, MemoryStorage, SecurityDb};
pub use error::{SmError, SmResult};
pub use gap::{AddressType, BdAddr, ConnectionHandle, ConnectionRole, Whitelist};
pub use manager::{
    SecurityEvent, SecurityManager, SecurityManagerConfig, SecurityManagerEventHandler,
};
pub use pal::{ControllerSecurityManager, ControllerTransport, PalEvent, PalSecurityManager};
pub use smp::{AuthenticationMask, IoCapability, KeyDistribution, LinkEncryption, Passkey};
