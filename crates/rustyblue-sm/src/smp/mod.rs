//! Security Manager protocol vocabulary
//!
//! This module holds the protocol level types shared by the database, the
//! PAL and the security manager core:
//! - IO capabilities, authentication and key distribution masks
//! - Pairing failure reasons and completion statuses
//! - Link encryption levels
//! - Key material and random key generation

pub mod constants;
mod crypto;
mod keys;
mod types;

// Re-export public API
pub use self::crypto::*;
pub use self::keys::*;
pub use self::types::*;

#[cfg(test)]
mod tests;
