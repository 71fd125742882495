// Address types as reported by the controller for a connection
pub const PUBLIC_DEVICE_ADDRESS: u8 = 0x00;
pub const RANDOM_DEVICE_ADDRESS: u8 = 0x01;
pub const PUBLIC_IDENTITY_ADDRESS: u8 = 0x02;
pub const RANDOM_IDENTITY_ADDRESS: u8 = 0x03;

// Whitelist address types (LE Add Device To White List)
pub const WHITELIST_ADDRESS_PUBLIC: u8 = 0x00;
pub const WHITELIST_ADDRESS_RANDOM_STATIC: u8 = 0x01;

// Sub-type of a random address, carried in the two most significant bits
pub const RANDOM_ADDRESS_TYPE_MASK: u8 = 0xC0;
pub const RANDOM_ADDRESS_NON_RESOLVABLE: u8 = 0x00;
pub const RANDOM_ADDRESS_RESOLVABLE: u8 = 0x40;
pub const RANDOM_ADDRESS_STATIC: u8 = 0xC0;

// Link roles
pub const ROLE_MASTER: u8 = 0x00;
pub const ROLE_SLAVE: u8 = 0x01;
