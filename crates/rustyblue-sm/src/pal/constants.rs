//! Vendor controller security command and event constants

// Packet types
pub const HCI_COMMAND_PKT: u8 = 0x01;

// Vendor specific commands (OGF: 0x3F)
pub const OGF_VENDOR: u8 = 0x3F;

pub const OCF_SEC_PAIR_REQUEST: u16 = 0x0001;
pub const OCF_SEC_PAIR_RESPONSE: u16 = 0x0002;
pub const OCF_SEC_CANCEL_PAIRING: u16 = 0x0003;
pub const OCF_SEC_SLAVE_REQUEST: u16 = 0x0004;
pub const OCF_SEC_ENCRYPT_REQUEST: u16 = 0x0005;
pub const OCF_SEC_LTK_RESPONSE: u16 = 0x0006;
pub const OCF_SEC_AUTH_RESPONSE: u16 = 0x0007;
pub const OCF_SEC_COMPARE_RESPONSE: u16 = 0x0008;
pub const OCF_SEC_KEYPRESS: u16 = 0x0009;
pub const OCF_SEC_SET_LOCAL_IRK: u16 = 0x000A;
pub const OCF_SEC_SET_LOCAL_CSRK: u16 = 0x000B;
pub const OCF_SEC_SET_PEER_CSRK: u16 = 0x000C;
pub const OCF_SEC_WRITE_AUTH_PAYLOAD_TIMEOUT: u16 = 0x000D;
pub const OCF_SEC_SET_RPA_TIMEOUT: u16 = 0x000E;
pub const OCF_SEC_GENERATE_ECC_KEY: u16 = 0x000F;
pub const OCF_SEC_CALC_OOB: u16 = 0x0010;
pub const OCF_SEC_SET_OOB_DATA: u16 = 0x0011;
pub const OCF_SEC_SET_IO_CAPABILITY: u16 = 0x0012;
pub const OCF_SEC_SET_KEY_SIZES: u16 = 0x0013;
pub const OCF_SEC_ADD_RESOLVING_LIST: u16 = 0x0014;
pub const OCF_SEC_REMOVE_RESOLVING_LIST: u16 = 0x0015;
pub const OCF_SEC_CLEAR_RESOLVING_LIST: u16 = 0x0016;

// Vendor specific event and its sub-events
pub const EVT_VENDOR: u8 = 0xFF;

pub const EVT_SEC_PAIR_COMPLETE: u8 = 0x01;
pub const EVT_SEC_PAIR_FAIL: u8 = 0x02;
pub const EVT_SEC_ENCRYPT_IND: u8 = 0x03;
pub const EVT_SEC_ENCRYPT_FAIL: u8 = 0x04;
pub const EVT_SEC_AUTH_REQUEST: u8 = 0x05;
pub const EVT_SEC_KEY_IND: u8 = 0x06;
pub const EVT_SEC_LTK_REQUEST: u8 = 0x07;
pub const EVT_SEC_PAIR_IND: u8 = 0x08;
pub const EVT_SEC_SLAVE_REQUEST: u8 = 0x09;
pub const EVT_SEC_OOB_CALCULATED: u8 = 0x0A;
pub const EVT_SEC_ECC_KEY: u8 = 0x0B;
pub const EVT_SEC_COMPARE_IND: u8 = 0x0C;
pub const EVT_SEC_KEYPRESS_IND: u8 = 0x0D;
pub const EVT_SEC_AUTH_PAYLOAD_TIMEOUT: u8 = 0x0E;

// Distributed key types carried by EVT_SEC_KEY_IND
pub const KEY_TYPE_LOCAL_LTK: u8 = 0x01;
pub const KEY_TYPE_PEER_LTK: u8 = 0x02;
pub const KEY_TYPE_IRK: u8 = 0x04;
pub const KEY_TYPE_CSRK: u8 = 0x08;

// Controller pairing status codes outside the SMP reason range
pub const PAIR_STATUS_MEMORY: u8 = 0x75;
pub const PAIR_STATUS_TIMEOUT: u8 = 0x76;

// HCI error reported when the peer did not answer an encryption request
pub const HCI_ERR_LL_RESPONSE_TIMEOUT: u8 = 0x22;

// Default number of resolving list entries
pub const DEFAULT_RESOLVING_LIST_CAPACITY: u8 = 8;
