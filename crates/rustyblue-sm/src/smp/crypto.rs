//! Random key generation
//!
//! The pairing algorithms themselves (c1, s1, f4, f5, f6, g2) run inside the
//! controller. The host only needs random material for the keys it owns and
//! for the values it shows to the user.

use super::constants::PASSKEY_MAX;
use super::keys::{Csrk, Irk, OobTk, Rand};
use rand::RngCore;

/// Generate a 128-bit random number
pub fn generate_random_128() -> [u8; 16] {
    let mut bytes = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut bytes);
    bytes
}

/// Generate a random passkey (0-999999)
pub fn generate_passkey() -> u32 {
    rand::random::<u32>() % (PASSKEY_MAX + 1)
}

/// Generate a local Identity Resolving Key
pub fn generate_irk() -> Irk {
    Irk::new(generate_random_128())
}

/// Generate a local Connection Signature Resolving Key
pub fn generate_csrk() -> Csrk {
    Csrk::new(generate_random_128())
}

/// Generate a temporary key for legacy OOB pairing
pub fn generate_oob_tk() -> OobTk {
    OobTk::new(generate_random_128())
}

/// Generate the 64-bit random data handed out by the controller
pub fn generate_rand() -> Rand {
    Rand::new(rand::random::<[u8; 8]>())
}

/// Six digit value shown for numeric comparison, derived from the confirm value
pub fn compare_value(confirm: &[u8; 16]) -> u32 {
    let value = u32::from_le_bytes([confirm[0], confirm[1], confirm[2], confirm[3]]);
    value % (PASSKEY_MAX + 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_passkey_range() {
        for _ in 0..1000 {
            assert!(generate_passkey() <= PASSKEY_MAX);
        }
    }

    #[test]
    fn test_generated_keys_differ() {
        assert_ne!(generate_irk(), generate_irk());
        assert_ne!(generate_csrk(), generate_csrk());
    }

    #[test]
    fn test_compare_value() {
        let mut confirm = [0u8; 16];
        confirm[..4].copy_from_slice(&1_234_567u32.to_le_bytes());
        assert_eq!(compare_value(&confirm), 234_567);
    }
}
