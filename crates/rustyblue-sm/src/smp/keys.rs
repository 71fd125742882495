//! Key material types
//!
//! Every key, diversifier and OOB value is a fixed size byte array wrapped
//! in its own type so that an IRK can never be passed where an LTK is
//! expected. Values compare byte-wise and print as hex.

use std::fmt;

macro_rules! key_type {
    ($(#[$meta:meta])* $name:ident, $len:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash)]
        pub struct $name([u8; $len]);

        impl $name {
            pub const LEN: usize = $len;

            pub const fn new(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }

            pub fn from_slice(slice: &[u8]) -> Option<Self> {
                let bytes: [u8; $len] = slice.get(..$len)?.try_into().ok()?;
                Some(Self(bytes))
            }

            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            pub fn is_zero(&self) -> bool {
                self.0.iter().all(|b| *b == 0)
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self([0u8; $len])
            }
        }

        impl From<[u8; $len]> for $name {
            fn from(bytes: [u8; $len]) -> Self {
                Self(bytes)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), hex::encode(self.0))
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&hex::encode(self.0))
            }
        }
    };
}

key_type!(
    /// Long Term Key
    Ltk,
    16
);
key_type!(
    /// Identity Resolving Key
    Irk,
    16
);
key_type!(
    /// Connection Signature Resolving Key
    Csrk,
    16
);
key_type!(
    /// Encrypted diversifier distributed with a legacy LTK
    Ediv,
    2
);
key_type!(
    /// Random number distributed with a legacy LTK
    Rand,
    8
);
key_type!(
    /// Temporary key used by legacy OOB pairing
    OobTk,
    16
);
key_type!(
    /// Random value of Secure Connections OOB data
    OobLescValue,
    16
);
key_type!(
    /// Confirmation value of Secure Connections OOB data
    OobConfirm,
    16
);
key_type!(
    /// One coordinate of a P-256 public key
    PublicKeyCoord,
    32
);
key_type!(
    /// P-256 private key
    PrivateKey,
    32
);
key_type!(
    /// Diffie-Hellman shared secret
    DhKey,
    32
);

impl Ediv {
    pub fn from_u16(value: u16) -> Self {
        Self(value.to_le_bytes())
    }

    pub fn to_u16(&self) -> u16 {
        u16::from_le_bytes(self.0)
    }
}

/// P-256 public key used by Secure Connections pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PublicKey {
    pub x: PublicKeyCoord,
    pub y: PublicKeyCoord,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_formatting() {
        let ltk = Ltk::new([0xAB; 16]);
        assert_eq!(ltk.to_string(), "ab".repeat(16));
        assert!(format!("{ltk:?}").starts_with("Ltk("));
        assert!(!ltk.is_zero());
        assert!(Rand::default().is_zero());
    }

    #[test]
    fn test_from_slice() {
        assert_eq!(Rand::from_slice(&[1, 2, 3]), None);
        let rand = Rand::from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9]).unwrap();
        assert_eq!(rand.as_bytes(), &[1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_ediv_endianness() {
        let ediv = Ediv::from_u16(0x1234);
        assert_eq!(ediv.as_bytes(), &[0x34, 0x12]);
        assert_eq!(ediv.to_u16(), 0x1234);
    }
}
