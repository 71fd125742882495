//! Vendor controller security packets
//!
//! This module contains the command and event set spoken by a link
//! controller that runs the SMP state machine itself. Commands travel as HCI
//! command packets in the vendor opcode group; events arrive as a single
//! vendor event whose first parameter selects the sub-event.
//!
//! ```text
//! 0xFF | length u8 | sub-event u8 | connection handle u16 | sub-event fields
//! ```
//!
//! The handle slot is present in every sub-event. The controller wide
//! sub-events (OOB calculated, ECC key) fill it with a placeholder that the
//! parser skips.

use super::constants::*;
use crate::error::{SmError, SmResult};
use crate::gap::{BdAddr, ConnectionHandle};
use crate::smp::{
    Csrk, Ediv, Irk, Ltk, OobConfirm, OobLescValue, PublicKey, PublicKeyCoord, Rand,
};
use byteorder::{LittleEndian, ReadBytesExt};
use log::trace;
use std::io::{Cursor, Read, Write};

/// Security commands understood by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ControllerCommand {
    PairRequest {
        handle: ConnectionHandle,
        oob: bool,
        auth: u8,
        initiator_dist: u8,
        responder_dist: u8,
    },
    PairResponse {
        handle: ConnectionHandle,
        oob: bool,
        auth: u8,
        initiator_dist: u8,
        responder_dist: u8,
    },
    CancelPairing { handle: ConnectionHandle, reason: u8 },
    SlaveSecurityRequest { handle: ConnectionHandle, auth: u8 },
    EncryptRequest {
        handle: ConnectionHandle,
        level: u8,
        ltk: Ltk,
        ediv: Ediv,
        rand: Rand,
    },
    LtkResponse {
        handle: ConnectionHandle,
        found: bool,
        level: u8,
        ltk: Ltk,
    },
    AuthResponse { handle: ConnectionHandle, data: Vec<u8> },
    CompareResponse { handle: ConnectionHandle, confirm: bool },
    Keypress { handle: ConnectionHandle, keypress: u8 },
    SetLocalIrk { irk: Irk },
    SetLocalCsrk { csrk: Csrk, sign_counter: u32 },
    SetPeerCsrk {
        handle: ConnectionHandle,
        csrk: Csrk,
        authenticated: bool,
        sign_counter: u32,
    },
    WriteAuthPayloadTimeout { handle: ConnectionHandle, timeout: u16 },
    SetRpaTimeout { timeout: u16 },
    GenerateEccKey,
    CalcOob { random: OobLescValue, public_key_x: PublicKeyCoord },
    SetOobData {
        handle: ConnectionHandle,
        local_random: OobLescValue,
        peer_random: OobLescValue,
        peer_confirm: OobConfirm,
    },
    SetIoCapability { io_capability: u8 },
    SetKeySizes { min: u8, max: u8 },
    AddDeviceToResolvingList {
        address_type: u8,
        address: BdAddr,
        peer_irk: Irk,
        local_irk: Irk,
    },
    RemoveDeviceFromResolvingList { address_type: u8, address: BdAddr },
    ClearResolvingList,
}

impl ControllerCommand {
    /// Get the OGF and OCF for this command
    pub fn opcode_parts(&self) -> (u8, u16) {
        let ocf = match self {
            Self::PairRequest { .. } => OCF_SEC_PAIR_REQUEST,
            Self::PairResponse { .. } => OCF_SEC_PAIR_RESPONSE,
            Self::CancelPairing { .. } => OCF_SEC_CANCEL_PAIRING,
            Self::SlaveSecurityRequest { .. } => OCF_SEC_SLAVE_REQUEST,
            Self::EncryptRequest { .. } => OCF_SEC_ENCRYPT_REQUEST,
            Self::LtkResponse { .. } => OCF_SEC_LTK_RESPONSE,
            Self::AuthResponse { .. } => OCF_SEC_AUTH_RESPONSE,
            Self::CompareResponse { .. } => OCF_SEC_COMPARE_RESPONSE,
            Self::Keypress { .. } => OCF_SEC_KEYPRESS,
            Self::SetLocalIrk { .. } => OCF_SEC_SET_LOCAL_IRK,
            Self::SetLocalCsrk { .. } => OCF_SEC_SET_LOCAL_CSRK,
            Self::SetPeerCsrk { .. } => OCF_SEC_SET_PEER_CSRK,
            Self::WriteAuthPayloadTimeout { .. } => OCF_SEC_WRITE_AUTH_PAYLOAD_TIMEOUT,
            Self::SetRpaTimeout { .. } => OCF_SEC_SET_RPA_TIMEOUT,
            Self::GenerateEccKey => OCF_SEC_GENERATE_ECC_KEY,
            Self::CalcOob { .. } => OCF_SEC_CALC_OOB,
            Self::SetOobData { .. } => OCF_SEC_SET_OOB_DATA,
            Self::SetIoCapability { .. } => OCF_SEC_SET_IO_CAPABILITY,
            Self::SetKeySizes { .. } => OCF_SEC_SET_KEY_SIZES,
            Self::AddDeviceToResolvingList { .. } => OCF_SEC_ADD_RESOLVING_LIST,
            Self::RemoveDeviceFromResolvingList { .. } => OCF_SEC_REMOVE_RESOLVING_LIST,
            Self::ClearResolvingList => OCF_SEC_CLEAR_RESOLVING_LIST,
        };
        (OGF_VENDOR, ocf)
    }

    pub fn opcode(&self) -> u16 {
        let (ogf, ocf) = self.opcode_parts();
        ((ogf as u16) << 10) | (ocf & 0x3ff)
    }

    /// Convert the command to its raw parameter bytes
    fn parameters(&self) -> Vec<u8> {
        let mut params = Vec::new();
        match self {
            Self::PairRequest {
                handle,
                oob,
                auth,
                initiator_dist,
                responder_dist,
            }
            | Self::PairResponse {
                handle,
                oob,
                auth,
                initiator_dist,
                responder_dist,
            } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&[*oob as u8, *auth, *initiator_dist, *responder_dist]);
            }
            Self::CancelPairing { handle, reason } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*reason);
            }
            Self::SlaveSecurityRequest { handle, auth } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*auth);
            }
            Self::EncryptRequest {
                handle,
                level,
                ltk,
                ediv,
                rand,
            } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*level);
                params.extend_from_slice(ltk.as_bytes());
                params.extend_from_slice(ediv.as_bytes());
                params.extend_from_slice(rand.as_bytes());
            }
            Self::LtkResponse {
                handle,
                found,
                level,
                ltk,
            } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*found as u8);
                params.push(*level);
                params.extend_from_slice(ltk.as_bytes());
            }
            Self::AuthResponse { handle, data } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(data.len() as u8);
                params.extend_from_slice(data);
            }
            Self::CompareResponse { handle, confirm } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*confirm as u8);
            }
            Self::Keypress { handle, keypress } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.push(*keypress);
            }
            Self::SetLocalIrk { irk } => params.extend_from_slice(irk.as_bytes()),
            Self::SetLocalCsrk { csrk, sign_counter } => {
                params.extend_from_slice(csrk.as_bytes());
                params.extend_from_slice(&sign_counter.to_le_bytes());
            }
            Self::SetPeerCsrk {
                handle,
                csrk,
                authenticated,
                sign_counter,
            } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(csrk.as_bytes());
                params.push(*authenticated as u8);
                params.extend_from_slice(&sign_counter.to_le_bytes());
            }
            Self::WriteAuthPayloadTimeout { handle, timeout } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(&timeout.to_le_bytes());
            }
            Self::SetRpaTimeout { timeout } => params.extend_from_slice(&timeout.to_le_bytes()),
            Self::GenerateEccKey | Self::ClearResolvingList => {}
            Self::CalcOob {
                random,
                public_key_x,
            } => {
                params.extend_from_slice(random.as_bytes());
                params.extend_from_slice(public_key_x.as_bytes());
            }
            Self::SetOobData {
                handle,
                local_random,
                peer_random,
                peer_confirm,
            } => {
                params.extend_from_slice(&handle.to_le_bytes());
                params.extend_from_slice(local_random.as_bytes());
                params.extend_from_slice(peer_random.as_bytes());
                params.extend_from_slice(peer_confirm.as_bytes());
            }
            Self::SetIoCapability { io_capability } => params.push(*io_capability),
            Self::SetKeySizes { min, max } => params.extend_from_slice(&[*min, *max]),
            Self::AddDeviceToResolvingList {
                address_type,
                address,
                peer_irk,
                local_irk,
            } => {
                params.push(*address_type);
                params.extend_from_slice(address.as_slice());
                params.extend_from_slice(peer_irk.as_bytes());
                params.extend_from_slice(local_irk.as_bytes());
            }
            Self::RemoveDeviceFromResolvingList {
                address_type,
                address,
            } => {
                params.push(*address_type);
                params.extend_from_slice(address.as_slice());
            }
        }
        params
    }

    /// Convert the command to a raw HCI packet
    pub fn to_packet(&self) -> Vec<u8> {
        let params = self.parameters();

        let mut packet = vec![HCI_COMMAND_PKT];
        packet.extend_from_slice(&self.opcode().to_le_bytes());
        packet.push(params.len() as u8);
        packet.extend_from_slice(&params);
        packet
    }
}

/// Key handed over during the key distribution phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistributedKey {
    /// LTK generated locally and sent to the peer
    LocalLtk { ltk: Ltk, ediv: Ediv, rand: Rand },
    /// LTK received from the peer
    PeerLtk { ltk: Ltk, ediv: Ediv, rand: Rand },
    Irk {
        irk: Irk,
        address_type: u8,
        address: BdAddr,
    },
    Csrk { csrk: Csrk },
}

/// Security events raised by the controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControllerEvent {
    PairComplete { handle: ConnectionHandle, auth: u8 },
    PairFail { handle: ConnectionHandle, status: u8 },
    EncryptInd {
        handle: ConnectionHandle,
        level: u8,
        key_size: u8,
    },
    EncryptFail { handle: ConnectionHandle, status: u8 },
    AuthRequest {
        handle: ConnectionHandle,
        oob: bool,
        display: bool,
        secure_connections: bool,
    },
    KeyInd {
        handle: ConnectionHandle,
        level: u8,
        key: DistributedKey,
    },
    LtkRequest {
        handle: ConnectionHandle,
        ediv: Ediv,
        rand: Rand,
    },
    PairInd {
        handle: ConnectionHandle,
        oob: bool,
        auth: u8,
        initiator_dist: u8,
        responder_dist: u8,
    },
    SlaveSecurityRequest { handle: ConnectionHandle, auth: u8 },
    OobCalculated {
        confirm: OobConfirm,
        random: OobLescValue,
    },
    EccKey { key: PublicKey },
    CompareInd {
        handle: ConnectionHandle,
        confirm: [u8; 16],
    },
    KeypressInd { handle: ConnectionHandle, keypress: u8 },
    AuthPayloadTimeout { handle: ConnectionHandle },
}

fn read_array<const N: usize>(cursor: &mut Cursor<&[u8]>) -> Option<[u8; N]> {
    let mut bytes = [0u8; N];
    cursor.read_exact(&mut bytes).ok()?;
    Some(bytes)
}

fn read_bool(cursor: &mut Cursor<&[u8]>) -> Option<bool> {
    Some(cursor.read_u8().ok()? != 0)
}

impl ControllerEvent {
    /// Parse a vendor security event from raw bytes (event code, length, parameters)
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 2 || data[0] != EVT_VENDOR {
            return None;
        }
        let length = data[1] as usize;
        let params = data.get(2..2 + length)?;
        trace!("Vendor security event {:02x?}", params);

        let mut cursor = Cursor::new(params);
        let subevent = cursor.read_u8().ok()?;
        // Placeholder for the controller wide sub-events
        let handle = cursor.read_u16::<LittleEndian>().ok()?;

        let event = match subevent {
            EVT_SEC_PAIR_COMPLETE => ControllerEvent::PairComplete {
                handle,
                auth: cursor.read_u8().ok()?,
            },
            EVT_SEC_PAIR_FAIL => ControllerEvent::PairFail {
                handle,
                status: cursor.read_u8().ok()?,
            },
            EVT_SEC_ENCRYPT_IND => ControllerEvent::EncryptInd {
                handle,
                level: cursor.read_u8().ok()?,
                key_size: cursor.read_u8().ok()?,
            },
            EVT_SEC_ENCRYPT_FAIL => ControllerEvent::EncryptFail {
                handle,
                status: cursor.read_u8().ok()?,
            },
            EVT_SEC_AUTH_REQUEST => ControllerEvent::AuthRequest {
                handle,
                oob: read_bool(&mut cursor)?,
                display: read_bool(&mut cursor)?,
                secure_connections: read_bool(&mut cursor)?,
            },
            EVT_SEC_KEY_IND => {
                let key_type = cursor.read_u8().ok()?;
                let level = cursor.read_u8().ok()?;
                let key = match key_type {
                    KEY_TYPE_LOCAL_LTK | KEY_TYPE_PEER_LTK => {
                        let ltk = Ltk::new(read_array(&mut cursor)?);
                        let ediv = Ediv::new(read_array(&mut cursor)?);
                        let rand = Rand::new(read_array(&mut cursor)?);
                        if key_type == KEY_TYPE_LOCAL_LTK {
                            DistributedKey::LocalLtk { ltk, ediv, rand }
                        } else {
                            DistributedKey::PeerLtk { ltk, ediv, rand }
                        }
                    }
                    KEY_TYPE_IRK => DistributedKey::Irk {
                        irk: Irk::new(read_array(&mut cursor)?),
                        address_type: cursor.read_u8().ok()?,
                        address: BdAddr::new(read_array(&mut cursor)?),
                    },
                    KEY_TYPE_CSRK => DistributedKey::Csrk {
                        csrk: Csrk::new(read_array(&mut cursor)?),
                    },
                    _ => return None,
                };
                ControllerEvent::KeyInd { handle, level, key }
            }
            EVT_SEC_LTK_REQUEST => ControllerEvent::LtkRequest {
                handle,
                ediv: Ediv::new(read_array(&mut cursor)?),
                rand: Rand::new(read_array(&mut cursor)?),
            },
            EVT_SEC_PAIR_IND => ControllerEvent::PairInd {
                handle,
                oob: read_bool(&mut cursor)?,
                auth: cursor.read_u8().ok()?,
                initiator_dist: cursor.read_u8().ok()?,
                responder_dist: cursor.read_u8().ok()?,
            },
            EVT_SEC_SLAVE_REQUEST => ControllerEvent::SlaveSecurityRequest {
                handle,
                auth: cursor.read_u8().ok()?,
            },
            EVT_SEC_OOB_CALCULATED => ControllerEvent::OobCalculated {
                confirm: OobConfirm::new(read_array(&mut cursor)?),
                random: OobLescValue::new(read_array(&mut cursor)?),
            },
            EVT_SEC_ECC_KEY => ControllerEvent::EccKey {
                key: PublicKey {
                    x: PublicKeyCoord::new(read_array(&mut cursor)?),
                    y: PublicKeyCoord::new(read_array(&mut cursor)?),
                },
            },
            EVT_SEC_COMPARE_IND => ControllerEvent::CompareInd {
                handle,
                confirm: read_array(&mut cursor)?,
            },
            EVT_SEC_KEYPRESS_IND => ControllerEvent::KeypressInd {
                handle,
                keypress: cursor.read_u8().ok()?,
            },
            EVT_SEC_AUTH_PAYLOAD_TIMEOUT => ControllerEvent::AuthPayloadTimeout { handle },
            _ => return None,
        };
        Some(event)
    }
}

/// Sink for commands addressed to the controller
pub trait ControllerTransport {
    fn send_command(&mut self, command: ControllerCommand) -> SmResult<()>;
}

/// Keeps every command in order; useful to drive a simulated controller
impl ControllerTransport for Vec<ControllerCommand> {
    fn send_command(&mut self, command: ControllerCommand) -> SmResult<()> {
        self.push(command);
        Ok(())
    }
}

/// Writes commands as raw HCI packets to any byte stream
#[derive(Debug)]
pub struct PacketWriter<W: Write>(pub W);

impl<W: Write> ControllerTransport for PacketWriter<W> {
    fn send_command(&mut self, command: ControllerCommand) -> SmResult<()> {
        let packet = command.to_packet();
        trace!("Sending controller command {:02x?}", packet);
        self.0
            .write_all(&packet)
            .and_then(|_| self.0.flush())
            .map_err(|e| SmError::Transport(e.to_string()))
    }
}
