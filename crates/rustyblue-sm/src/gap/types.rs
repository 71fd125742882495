use crate::error::SmError;
use crate::gap::constants::*;
use std::fmt;
use std::str::FromStr;

/// Handle of a live link, as assigned by the controller
pub type ConnectionHandle = u16;

/// Role of the local device on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionRole {
    Master,
    Slave,
}

impl From<u8> for ConnectionRole {
    fn from(value: u8) -> Self {
        match value {
            ROLE_SLAVE => ConnectionRole::Slave,
            _ => ConnectionRole::Master,
        }
    }
}

impl From<ConnectionRole> for u8 {
    fn from(value: ConnectionRole) -> Self {
        match value {
            ConnectionRole::Master => ROLE_MASTER,
            ConnectionRole::Slave => ROLE_SLAVE,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AddressType {
    Public,
    Random,
    PublicIdentity,
    RandomIdentity,
}

impl AddressType {
    /// Whether the address belongs to the public address space
    pub fn is_public(&self) -> bool {
        matches!(self, AddressType::Public | AddressType::PublicIdentity)
    }

    /// Whether the controller already resolved this address to an identity
    pub fn is_identity(&self) -> bool {
        matches!(self, AddressType::PublicIdentity | AddressType::RandomIdentity)
    }
}

impl From<u8> for AddressType {
    fn from(value: u8) -> Self {
        match value {
            PUBLIC_DEVICE_ADDRESS => AddressType::Public,
            RANDOM_DEVICE_ADDRESS => AddressType::Random,
            PUBLIC_IDENTITY_ADDRESS => AddressType::PublicIdentity,
            RANDOM_IDENTITY_ADDRESS => AddressType::RandomIdentity,
            _ => AddressType::Public,
        }
    }
}

impl From<AddressType> for u8 {
    fn from(value: AddressType) -> Self {
        match value {
            AddressType::Public => PUBLIC_DEVICE_ADDRESS,
            AddressType::Random => RANDOM_DEVICE_ADDRESS,
            AddressType::PublicIdentity => PUBLIC_IDENTITY_ADDRESS,
            AddressType::RandomIdentity => RANDOM_IDENTITY_ADDRESS,
        }
    }
}

/// Sub-type of a random device address
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RandomAddressType {
    Static,
    ResolvablePrivate,
    NonResolvablePrivate,
}

/// Bluetooth device address, stored least significant byte first
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct BdAddr {
    pub bytes: [u8; 6],
}

impl BdAddr {
    pub fn new(bytes: [u8; 6]) -> Self {
        Self { bytes }
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() >= 6 {
            let mut bytes = [0u8; 6];
            bytes.copy_from_slice(&slice[0..6]);
            Some(Self { bytes })
        } else {
            None
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes
    }

    /// The all zero address is used as "no address"
    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    /// Classify this address assuming it is a random address
    pub fn random_address_type(&self) -> Option<RandomAddressType> {
        match self.bytes[5] & RANDOM_ADDRESS_TYPE_MASK {
            RANDOM_ADDRESS_STATIC => Some(RandomAddressType::Static),
            RANDOM_ADDRESS_RESOLVABLE => Some(RandomAddressType::ResolvablePrivate),
            RANDOM_ADDRESS_NON_RESOLVABLE => Some(RandomAddressType::NonResolvablePrivate),
            _ => None,
        }
    }

    /// Private addresses change over time and cannot identify a peer
    pub fn is_private(&self, address_type: AddressType) -> bool {
        address_type == AddressType::Random
            && !matches!(self.random_address_type(), Some(RandomAddressType::Static))
    }
}

impl fmt::Display for BdAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            self.bytes[5],
            self.bytes[4],
            self.bytes[3],
            self.bytes[2],
            self.bytes[1],
            self.bytes[0]
        )
    }
}

impl FromStr for BdAddr {
    type Err = SmError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: String = s.split(':').collect();
        let mut bytes = [0u8; 6];
        hex::decode_to_slice(&digits, &mut bytes)
            .map_err(|e| SmError::InvalidParameter(format!("malformed address {s:?}: {e}")))?;
        bytes.reverse();
        Ok(Self { bytes })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistAddressType {
    Public,
    RandomStatic,
}

impl From<WhitelistAddressType> for u8 {
    fn from(value: WhitelistAddressType) -> Self {
        match value {
            WhitelistAddressType::Public => WHITELIST_ADDRESS_PUBLIC,
            WhitelistAddressType::RandomStatic => WHITELIST_ADDRESS_RANDOM_STATIC,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WhitelistEntry {
    pub address_type: WhitelistAddressType,
    pub address: BdAddr,
}

/// Fixed capacity list of addresses allowed through the controller filter
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Whitelist {
    entries: Vec<WhitelistEntry>,
    capacity: usize,
}

impl Whitelist {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            entries: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Append an entry. Returns false and leaves the list untouched when full.
    pub fn push(&mut self, entry: WhitelistEntry) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries.push(entry);
        true
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn entries(&self) -> &[WhitelistEntry] {
        &self.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bdaddr_display_and_parse() {
        let addr = BdAddr::new([0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(addr.to_string(), "11:22:33:44:55:66");

        let parsed: BdAddr = "11:22:33:44:55:66".parse().unwrap();
        assert_eq!(parsed, addr);

        assert!("11:22:33".parse::<BdAddr>().is_err());
        assert!("zz:22:33:44:55:66".parse::<BdAddr>().is_err());
    }

    #[test]
    fn test_random_address_classification() {
        let static_addr = BdAddr::new([1, 2, 3, 4, 5, 0xC5]);
        let resolvable = BdAddr::new([1, 2, 3, 4, 5, 0x45]);
        let non_resolvable = BdAddr::new([1, 2, 3, 4, 5, 0x05]);

        assert_eq!(static_addr.random_address_type(), Some(RandomAddressType::Static));
        assert_eq!(
            resolvable.random_address_type(),
            Some(RandomAddressType::ResolvablePrivate)
        );
        assert_eq!(
            non_resolvable.random_address_type(),
            Some(RandomAddressType::NonResolvablePrivate)
        );
        assert_eq!(BdAddr::new([1, 2, 3, 4, 5, 0x85]).random_address_type(), None);

        assert!(!static_addr.is_private(AddressType::Random));
        assert!(resolvable.is_private(AddressType::Random));
        assert!(!resolvable.is_private(AddressType::Public));
    }

    #[test]
    fn test_whitelist_capacity() {
        let mut whitelist = Whitelist::with_capacity(2);
        let entry = WhitelistEntry {
            address_type: WhitelistAddressType::Public,
            address: BdAddr::new([1; 6]),
        };

        assert!(whitelist.push(entry));
        assert!(whitelist.push(entry));
        assert!(!whitelist.push(entry));
        assert_eq!(whitelist.len(), 2);
        assert!(whitelist.is_full());
    }

    #[test]
    fn test_address_type_conversion() {
        assert_eq!(AddressType::from(0x02), AddressType::PublicIdentity);
        assert_eq!(u8::from(AddressType::RandomIdentity), 0x03);
        assert!(AddressType::PublicIdentity.is_public());
        assert!(!AddressType::Random.is_public());
        assert_eq!(ConnectionRole::from(ROLE_SLAVE), ConnectionRole::Slave);
    }
}
