//! Generic Access Profile types consumed by the security manager
//!
//! The GAP layer itself lives outside this crate. It reports connection
//! lifecycle events and addresses using the types defined here.

pub mod constants;
pub mod types;

pub use constants::*;
pub use types::*;
