//! PAL implementation on top of a controller that runs SMP itself

use super::constants::*;
use super::controller::{ControllerCommand, ControllerEvent, ControllerTransport, DistributedKey};
use super::{PalEvent, PalSecurityManager};
use crate::error::{SmError, SmResult};
use crate::gap::{AddressType, BdAddr, ConnectionHandle, PUBLIC_DEVICE_ADDRESS, RANDOM_DEVICE_ADDRESS};
use crate::smp::constants::*;
use crate::smp::{
    compare_value, generate_passkey, generate_rand, generate_random_128, validate_key_size_range,
    AuthenticationMask, Csrk, Ediv, IoCapability, Irk, KeyDistribution, Keypress,
    LinkEncryption, Ltk, LtkRequest, OobConfirm, OobLescValue, OobTk, PairingFailure, Passkey,
    PublicKey, Rand, SecurityLevel,
};
use log::{debug, trace, warn};
use std::collections::{HashMap, VecDeque};

/// How a controller pairing status is reported upwards
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingStatus {
    Failed(PairingFailure),
    TimedOut,
}

/// Map a controller pairing status onto a failure reason or a timeout.
///
/// SMP reasons keep their meaning, the timeout status is kept apart and
/// everything else collapses to an unspecified reason.
pub fn classify_pairing_status(status: u8) -> PairingStatus {
    if status == PAIR_STATUS_TIMEOUT {
        return PairingStatus::TimedOut;
    }
    match PairingFailure::try_from(status) {
        Ok(reason) => PairingStatus::Failed(reason),
        Err(_) => PairingStatus::Failed(PairingFailure::UnspecifiedReason),
    }
}

/// Security manager PAL driving a vendor controller through a [`ControllerTransport`]
pub struct ControllerSecurityManager<T: ControllerTransport> {
    transport: T,
    events: VecDeque<PalEvent>,
    identity_address: BdAddr,
    identity_address_is_public: bool,
    secure_connections: bool,
    resolving_list_capacity: u8,
    /// Static passkey shown on display requests
    display_passkey: Option<u32>,
    io_capability: IoCapability,
    min_key_size: u8,
    max_key_size: u8,
    /// ECC public key reported by the controller
    public_key: Option<PublicKey>,
    local_irk: Irk,
    auth_timeouts: HashMap<ConnectionHandle, u16>,
    key_sizes: HashMap<ConnectionHandle, u8>,
    peer_csrks: HashMap<ConnectionHandle, Csrk>,
}

impl<T: ControllerTransport> ControllerSecurityManager<T> {
    pub fn new(transport: T, identity_address: BdAddr, identity_address_is_public: bool) -> Self {
        Self {
            transport,
            events: VecDeque::new(),
            identity_address,
            identity_address_is_public,
            secure_connections: true,
            resolving_list_capacity: DEFAULT_RESOLVING_LIST_CAPACITY,
            display_passkey: None,
            io_capability: IoCapability::default(),
            min_key_size: SMP_MIN_ENCRYPTION_KEY_SIZE,
            max_key_size: SMP_MAX_ENCRYPTION_KEY_SIZE,
            public_key: None,
            local_irk: Irk::default(),
            auth_timeouts: HashMap::new(),
            key_sizes: HashMap::new(),
            peer_csrks: HashMap::new(),
        }
    }

    pub fn with_secure_connections(mut self, supported: bool) -> Self {
        self.secure_connections = supported;
        self
    }

    pub fn with_resolving_list_capacity(mut self, capacity: u8) -> Self {
        self.resolving_list_capacity = capacity;
        self
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub fn transport_mut(&mut self) -> &mut T {
        &mut self.transport
    }

    pub fn public_key(&self) -> Option<&PublicKey> {
        self.public_key.as_ref()
    }

    pub fn peer_csrk(&self, connection: ConnectionHandle) -> Option<&Csrk> {
        self.peer_csrks.get(&connection)
    }

    fn send(&mut self, command: ControllerCommand) -> SmResult<()> {
        trace!("Controller command {:?}", command);
        self.transport.send_command(command)
    }

    fn queue(&mut self, event: PalEvent) {
        self.events.push_back(event);
    }

    fn display_passkey_for_request(&self) -> SmResult<Passkey> {
        let value = self.display_passkey.unwrap_or_else(generate_passkey);
        Passkey::from_number(value)
    }

    fn on_auth_request(
        &mut self,
        connection: ConnectionHandle,
        oob: bool,
        display: bool,
        secure_connections: bool,
    ) -> SmResult<()> {
        if oob {
            if secure_connections {
                self.queue(PalEvent::SecureConnectionsOobRequest { connection });
            } else {
                self.queue(PalEvent::LegacyPairingOobRequest { connection });
            }
        } else if display {
            let passkey = self.display_passkey_for_request()?;
            let data = passkey.to_number().to_le_bytes()[..3].to_vec();
            self.send(ControllerCommand::AuthResponse {
                handle: connection,
                data,
            })?;
            self.queue(PalEvent::PasskeyDisplay {
                connection,
                passkey,
            });
        } else {
            self.queue(PalEvent::PasskeyRequest { connection });
        }
        Ok(())
    }

    fn on_key_ind(&mut self, connection: ConnectionHandle, level: u8, key: DistributedKey) {
        let secure_connections = level == SecurityLevel::SecureConnections.to_u8();
        match key {
            DistributedKey::LocalLtk { ltk, .. } | DistributedKey::PeerLtk { ltk, .. }
                if secure_connections =>
            {
                self.queue(PalEvent::SecureConnectionsLtkGenerated { connection, ltk });
            }
            DistributedKey::LocalLtk { ltk, ediv, rand } => {
                self.queue(PalEvent::KeysDistributedLocalLtk { connection, ltk });
                self.queue(PalEvent::KeysDistributedLocalEdivRand {
                    connection,
                    ediv,
                    rand,
                });
            }
            DistributedKey::PeerLtk { ltk, ediv, rand } => {
                self.queue(PalEvent::KeysDistributedLtk { connection, ltk });
                self.queue(PalEvent::KeysDistributedEdivRand {
                    connection,
                    ediv,
                    rand,
                });
            }
            DistributedKey::Irk {
                irk,
                address_type,
                address,
            } => {
                let peer_address_type = if address_type == PUBLIC_DEVICE_ADDRESS {
                    AddressType::PublicIdentity
                } else {
                    AddressType::RandomIdentity
                };
                self.queue(PalEvent::KeysDistributedIrk { connection, irk });
                self.queue(PalEvent::KeysDistributedBdaddr {
                    connection,
                    peer_address_type,
                    peer_identity_address: address,
                });
            }
            DistributedKey::Csrk { csrk } => {
                self.queue(PalEvent::KeysDistributedCsrk { connection, csrk });
            }
        }
    }
}

impl<T: ControllerTransport> PalSecurityManager for ControllerSecurityManager<T> {
    type ControllerEvent = ControllerEvent;

    fn handle_controller_event(&mut self, event: ControllerEvent) -> SmResult<()> {
        trace!("Controller event {:?}", event);
        match event {
            ControllerEvent::PairComplete { handle, .. } => {
                self.queue(PalEvent::PairingCompleted { connection: handle });
            }
            ControllerEvent::PairFail { handle, status } => match classify_pairing_status(status) {
                PairingStatus::TimedOut => {
                    self.queue(PalEvent::PairingTimedOut { connection: handle })
                }
                PairingStatus::Failed(error) => self.queue(PalEvent::PairingError {
                    connection: handle,
                    error,
                }),
            },
            ControllerEvent::EncryptInd {
                handle,
                level,
                key_size,
            } => {
                self.key_sizes.insert(handle, key_size);
                let result = SecurityLevel::from_u8(level)
                    .filter(|level| *level != SecurityLevel::None)
                    .map(|level| level.link_encryption())
                    .unwrap_or(LinkEncryption::Encrypted);
                self.queue(PalEvent::LinkEncryptionResult {
                    connection: handle,
                    result,
                });
            }
            ControllerEvent::EncryptFail { handle, status } => {
                self.key_sizes.remove(&handle);
                if status == HCI_ERR_LL_RESPONSE_TIMEOUT {
                    self.queue(PalEvent::LinkEncryptionRequestTimedOut { connection: handle });
                } else {
                    self.queue(PalEvent::LinkEncryptionResult {
                        connection: handle,
                        result: LinkEncryption::NotEncrypted,
                    });
                }
            }
            ControllerEvent::AuthRequest {
                handle,
                oob,
                display,
                secure_connections,
            } => self.on_auth_request(handle, oob, display, secure_connections)?,
            ControllerEvent::KeyInd { handle, level, key } => self.on_key_ind(handle, level, key),
            ControllerEvent::LtkRequest { handle, ediv, rand } => {
                let request = if ediv.is_zero() && rand.is_zero() {
                    LtkRequest::SecureConnections
                } else {
                    LtkRequest::Legacy { ediv, rand }
                };
                self.queue(PalEvent::LtkRequest {
                    connection: handle,
                    request,
                });
            }
            ControllerEvent::PairInd {
                handle,
                oob,
                auth,
                initiator_dist,
                responder_dist,
            } => self.queue(PalEvent::PairingRequest {
                connection: handle,
                use_oob: oob,
                authentication: AuthenticationMask::from_bits_truncate(auth),
                initiator_dist: KeyDistribution::from_u8(initiator_dist),
                responder_dist: KeyDistribution::from_u8(responder_dist),
            }),
            ControllerEvent::SlaveSecurityRequest { handle, auth } => {
                self.queue(PalEvent::SlaveSecurityRequest {
                    connection: handle,
                    authentication: AuthenticationMask::from_bits_truncate(auth),
                })
            }
            ControllerEvent::OobCalculated { confirm, random } => {
                self.queue(PalEvent::SecureConnectionsOobGenerated { random, confirm })
            }
            ControllerEvent::EccKey { key } => {
                debug!("Controller ECC key pair ready");
                self.public_key = Some(key);
            }
            ControllerEvent::CompareInd { handle, confirm } => {
                let passkey = Passkey::from_number(compare_value(&confirm))?;
                self.queue(PalEvent::PasskeyDisplay {
                    connection: handle,
                    passkey,
                });
                self.queue(PalEvent::ConfirmationRequest { connection: handle });
            }
            ControllerEvent::KeypressInd { handle, keypress } => match Keypress::from_u8(keypress) {
                Some(keypress) => self.queue(PalEvent::KeypressNotification {
                    connection: handle,
                    keypress,
                }),
                None => warn!("Ignoring unknown keypress type {}", keypress),
            },
            ControllerEvent::AuthPayloadTimeout { handle } => {
                self.queue(PalEvent::ValidMicTimeout { connection: handle })
            }
        }
        Ok(())
    }

    fn poll_event(&mut self) -> Option<PalEvent> {
        self.events.pop_front()
    }

    fn initialize(&mut self) -> SmResult<()> {
        self.send(ControllerCommand::SetIoCapability {
            io_capability: self.io_capability.to_u8(),
        })?;
        self.send(ControllerCommand::SetKeySizes {
            min: self.min_key_size,
            max: self.max_key_size,
        })?;
        if self.secure_connections {
            self.send(ControllerCommand::GenerateEccKey)?;
        }
        Ok(())
    }

    fn terminate(&mut self) -> SmResult<()> {
        self.events.clear();
        Ok(())
    }

    fn reset(&mut self) -> SmResult<()> {
        self.events.clear();
        self.auth_timeouts.clear();
        self.key_sizes.clear();
        self.peer_csrks.clear();
        self.public_key = None;
        Ok(())
    }

    fn read_resolving_list_capacity(&self) -> u8 {
        self.resolving_list_capacity
    }

    fn add_device_to_resolving_list(
        &mut self,
        peer_identity_address_is_public: bool,
        peer_identity_address: &BdAddr,
        peer_irk: &Irk,
    ) -> SmResult<()> {
        let local_irk = self.local_irk;
        self.send(ControllerCommand::AddDeviceToResolvingList {
            address_type: if peer_identity_address_is_public {
                PUBLIC_DEVICE_ADDRESS
            } else {
                RANDOM_DEVICE_ADDRESS
            },
            address: *peer_identity_address,
            peer_irk: *peer_irk,
            local_irk,
        })
    }

    fn remove_device_from_resolving_list(
        &mut self,
        peer_identity_address_is_public: bool,
        peer_identity_address: &BdAddr,
    ) -> SmResult<()> {
        self.send(ControllerCommand::RemoveDeviceFromResolvingList {
            address_type: if peer_identity_address_is_public {
                PUBLIC_DEVICE_ADDRESS
            } else {
                RANDOM_DEVICE_ADDRESS
            },
            address: *peer_identity_address,
        })
    }

    fn clear_resolving_list(&mut self) -> SmResult<()> {
        self.send(ControllerCommand::ClearResolvingList)
    }

    fn get_secure_connections_support(&self) -> bool {
        self.secure_connections
    }

    fn set_authentication_timeout(
        &mut self,
        connection: ConnectionHandle,
        timeout_in_10ms: u16,
    ) -> SmResult<()> {
        self.send(ControllerCommand::WriteAuthPayloadTimeout {
            handle: connection,
            timeout: timeout_in_10ms,
        })?;
        self.auth_timeouts.insert(connection, timeout_in_10ms);
        Ok(())
    }

    fn get_authentication_timeout(&self, connection: ConnectionHandle) -> SmResult<u16> {
        Ok(self
            .auth_timeouts
            .get(&connection)
            .copied()
            .unwrap_or(DEFAULT_AUTHENTICATION_TIMEOUT))
    }

    fn slave_security_request(
        &mut self,
        connection: ConnectionHandle,
        authentication: AuthenticationMask,
    ) -> SmResult<()> {
        self.send(ControllerCommand::SlaveSecurityRequest {
            handle: connection,
            auth: authentication.bits(),
        })
    }

    fn enable_encryption(
        &mut self,
        connection: ConnectionHandle,
        ltk: &Ltk,
        rand: &Rand,
        ediv: &Ediv,
        mitm: bool,
    ) -> SmResult<()> {
        self.send(ControllerCommand::EncryptRequest {
            handle: connection,
            level: SecurityLevel::for_key(mitm, false).to_u8(),
            ltk: *ltk,
            ediv: *ediv,
            rand: *rand,
        })
    }

    fn enable_secure_connections_encryption(
        &mut self,
        connection: ConnectionHandle,
        ltk: &Ltk,
        mitm: bool,
    ) -> SmResult<()> {
        self.send(ControllerCommand::EncryptRequest {
            handle: connection,
            level: SecurityLevel::for_key(mitm, true).to_u8(),
            ltk: *ltk,
            ediv: Ediv::default(),
            rand: Rand::default(),
        })
    }

    fn get_encryption_key_size(&self, connection: ConnectionHandle) -> SmResult<u8> {
        self.key_sizes.get(&connection).copied().ok_or_else(|| {
            SmError::InvalidState(format!("connection {connection} is not encrypted"))
        })
    }

    fn set_private_address_timeout(&mut self, timeout_in_seconds: u16) -> SmResult<()> {
        self.send(ControllerCommand::SetRpaTimeout {
            timeout: timeout_in_seconds,
        })
    }

    fn get_identity_address(&self) -> (BdAddr, bool) {
        (self.identity_address, self.identity_address_is_public)
    }

    fn set_ltk(
        &mut self,
        connection: ConnectionHandle,
        ltk: &Ltk,
        mitm: bool,
        secure_connections: bool,
    ) -> SmResult<()> {
        self.send(ControllerCommand::LtkResponse {
            handle: connection,
            found: true,
            level: SecurityLevel::for_key(mitm, secure_connections).to_u8(),
            ltk: *ltk,
        })
    }

    fn set_ltk_not_found(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        self.send(ControllerCommand::LtkResponse {
            handle: connection,
            found: false,
            level: SecurityLevel::None.to_u8(),
            ltk: Ltk::default(),
        })
    }

    fn set_irk(&mut self, irk: &Irk) -> SmResult<()> {
        self.local_irk = *irk;
        self.send(ControllerCommand::SetLocalIrk { irk: *irk })
    }

    fn set_csrk(&mut self, csrk: &Csrk, sign_counter: u32) -> SmResult<()> {
        self.send(ControllerCommand::SetLocalCsrk {
            csrk: *csrk,
            sign_counter,
        })
    }

    fn set_peer_csrk(
        &mut self,
        connection: ConnectionHandle,
        csrk: &Csrk,
        authenticated: bool,
        sign_counter: u32,
    ) -> SmResult<()> {
        self.send(ControllerCommand::SetPeerCsrk {
            handle: connection,
            csrk: *csrk,
            authenticated,
            sign_counter,
        })?;
        self.peer_csrks.insert(connection, *csrk);
        Ok(())
    }

    fn release_connection(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        self.peer_csrks.remove(&connection);
        self.auth_timeouts.remove(&connection);
        self.key_sizes.remove(&connection);
        Ok(())
    }

    fn set_display_passkey(&mut self, passkey: Option<u32>) -> SmResult<()> {
        if let Some(value) = passkey {
            Passkey::from_number(value)?;
        }
        self.display_passkey = passkey;
        Ok(())
    }

    fn set_io_capability(&mut self, io_capability: IoCapability) -> SmResult<()> {
        self.send(ControllerCommand::SetIoCapability {
            io_capability: io_capability.to_u8(),
        })?;
        self.io_capability = io_capability;
        Ok(())
    }

    fn set_encryption_key_requirements(&mut self, min: u8, max: u8) -> SmResult<()> {
        validate_key_size_range(min, max)?;
        self.send(ControllerCommand::SetKeySizes { min, max })?;
        self.min_key_size = min;
        self.max_key_size = max;
        Ok(())
    }

    fn encryption_key_requirements(&self) -> (u8, u8) {
        (self.min_key_size, self.max_key_size)
    }

    fn send_pairing_request(
        &mut self,
        connection: ConnectionHandle,
        oob_data_flag: bool,
        authentication: AuthenticationMask,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    ) -> SmResult<()> {
        self.send(ControllerCommand::PairRequest {
            handle: connection,
            oob: oob_data_flag,
            auth: authentication.bits(),
            initiator_dist: initiator_dist.to_u8(),
            responder_dist: responder_dist.to_u8(),
        })
    }

    fn send_pairing_response(
        &mut self,
        connection: ConnectionHandle,
        oob_data_flag: bool,
        authentication: AuthenticationMask,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    ) -> SmResult<()> {
        self.send(ControllerCommand::PairResponse {
            handle: connection,
            oob: oob_data_flag,
            auth: authentication.bits(),
            initiator_dist: initiator_dist.to_u8(),
            responder_dist: responder_dist.to_u8(),
        })
    }

    fn cancel_pairing(
        &mut self,
        connection: ConnectionHandle,
        reason: PairingFailure,
    ) -> SmResult<()> {
        self.send(ControllerCommand::CancelPairing {
            handle: connection,
            reason: reason.into(),
        })
    }

    fn get_random_data(&mut self) -> SmResult<Rand> {
        Ok(generate_rand())
    }

    fn passkey_request_reply(
        &mut self,
        connection: ConnectionHandle,
        passkey: u32,
    ) -> SmResult<()> {
        Passkey::from_number(passkey)?;
        self.send(ControllerCommand::AuthResponse {
            handle: connection,
            data: passkey.to_le_bytes()[..3].to_vec(),
        })
    }

    fn legacy_pairing_oob_request_reply(
        &mut self,
        connection: ConnectionHandle,
        oob_data: &OobTk,
    ) -> SmResult<()> {
        self.send(ControllerCommand::AuthResponse {
            handle: connection,
            data: oob_data.as_bytes().to_vec(),
        })
    }

    fn confirmation_entered(
        &mut self,
        connection: ConnectionHandle,
        confirmation: bool,
    ) -> SmResult<()> {
        self.send(ControllerCommand::CompareResponse {
            handle: connection,
            confirm: confirmation,
        })
    }

    fn send_keypress_notification(
        &mut self,
        connection: ConnectionHandle,
        keypress: Keypress,
    ) -> SmResult<()> {
        self.send(ControllerCommand::Keypress {
            handle: connection,
            keypress: keypress.to_u8(),
        })
    }

    fn generate_secure_connections_oob(&mut self) -> SmResult<()> {
        if !self.secure_connections {
            return Err(SmError::NotImplemented);
        }
        let Some(public_key) = self.public_key else {
            return Err(SmError::InvalidState(
                "ECC key pair not generated yet".into(),
            ));
        };
        self.send(ControllerCommand::CalcOob {
            random: OobLescValue::new(generate_random_128()),
            public_key_x: public_key.x,
        })
    }

    fn secure_connections_oob_request_reply(
        &mut self,
        connection: ConnectionHandle,
        local_random: &OobLescValue,
        peer_random: &OobLescValue,
        peer_confirm: &OobConfirm,
    ) -> SmResult<()> {
        self.send(ControllerCommand::SetOobData {
            handle: connection,
            local_random: *local_random,
            peer_random: *peer_random,
            peer_confirm: *peer_confirm,
        })
    }
}
