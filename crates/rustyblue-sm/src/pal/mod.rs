//! Platform abstraction layer for the security manager
//!
//! The PAL hides the link controller behind [`PalSecurityManager`]. Requests
//! go down as method calls; everything the controller reports comes back as
//! [`PalEvent`] values which the owner drains with
//! [`PalSecurityManager::poll_event`] and routes to a
//! [`PalSecurityManagerEventHandler`].
//!
//! Connection lifecycle and signed write notifications come from other
//! collaborators (GAP and the ATT signing monitor) and have their own narrow
//! handler traits.

mod adapter;
pub mod constants;
mod controller;

pub use self::adapter::{classify_pairing_status, ControllerSecurityManager, PairingStatus};
pub use self::controller::{
    ControllerCommand, ControllerEvent, ControllerTransport, DistributedKey, PacketWriter,
};

use crate::error::SmResult;
use crate::gap::{AddressType, BdAddr, ConnectionHandle, ConnectionRole};
use crate::smp::{
    AuthenticationMask, Csrk, Ediv, IoCapability, Irk, KeyDistribution, Keypress,
    LinkEncryption, Ltk, LtkRequest, OobConfirm, OobLescValue, OobTk, PairingFailure, Passkey,
    Rand,
};

/// Security event reported by the PAL
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PalEvent {
    PairingRequest {
        connection: ConnectionHandle,
        use_oob: bool,
        authentication: AuthenticationMask,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    },
    PairingError {
        connection: ConnectionHandle,
        error: PairingFailure,
    },
    PairingTimedOut {
        connection: ConnectionHandle,
    },
    PairingCompleted {
        connection: ConnectionHandle,
    },
    ValidMicTimeout {
        connection: ConnectionHandle,
    },
    SlaveSecurityRequest {
        connection: ConnectionHandle,
        authentication: AuthenticationMask,
    },
    LinkEncryptionResult {
        connection: ConnectionHandle,
        result: LinkEncryption,
    },
    LinkEncryptionRequestTimedOut {
        connection: ConnectionHandle,
    },
    PasskeyDisplay {
        connection: ConnectionHandle,
        passkey: Passkey,
    },
    KeypressNotification {
        connection: ConnectionHandle,
        keypress: Keypress,
    },
    PasskeyRequest {
        connection: ConnectionHandle,
    },
    ConfirmationRequest {
        connection: ConnectionHandle,
    },
    SecureConnectionsOobRequest {
        connection: ConnectionHandle,
    },
    LegacyPairingOobRequest {
        connection: ConnectionHandle,
    },
    SecureConnectionsOobGenerated {
        random: OobLescValue,
        confirm: OobConfirm,
    },
    SecureConnectionsLtkGenerated {
        connection: ConnectionHandle,
        ltk: Ltk,
    },
    KeysDistributedLtk {
        connection: ConnectionHandle,
        ltk: Ltk,
    },
    KeysDistributedEdivRand {
        connection: ConnectionHandle,
        ediv: Ediv,
        rand: Rand,
    },
    KeysDistributedLocalLtk {
        connection: ConnectionHandle,
        ltk: Ltk,
    },
    KeysDistributedLocalEdivRand {
        connection: ConnectionHandle,
        ediv: Ediv,
        rand: Rand,
    },
    KeysDistributedIrk {
        connection: ConnectionHandle,
        irk: Irk,
    },
    KeysDistributedBdaddr {
        connection: ConnectionHandle,
        peer_address_type: AddressType,
        peer_identity_address: BdAddr,
    },
    KeysDistributedCsrk {
        connection: ConnectionHandle,
        csrk: Csrk,
    },
    LtkRequest {
        connection: ConnectionHandle,
        request: LtkRequest,
    },
}

impl PalEvent {
    /// Call the handler method matching this event
    pub fn dispatch<H: PalSecurityManagerEventHandler + ?Sized>(self, handler: &mut H) {
        match self {
            PalEvent::PairingRequest {
                connection,
                use_oob,
                authentication,
                initiator_dist,
                responder_dist,
            } => handler.on_pairing_request(
                connection,
                use_oob,
                authentication,
                initiator_dist,
                responder_dist,
            ),
            PalEvent::PairingError { connection, error } => {
                handler.on_pairing_error(connection, error)
            }
            PalEvent::PairingTimedOut { connection } => handler.on_pairing_timed_out(connection),
            PalEvent::PairingCompleted { connection } => handler.on_pairing_completed(connection),
            PalEvent::ValidMicTimeout { connection } => handler.on_valid_mic_timeout(connection),
            PalEvent::SlaveSecurityRequest {
                connection,
                authentication,
            } => handler.on_slave_security_request(connection, authentication),
            PalEvent::LinkEncryptionResult { connection, result } => {
                handler.on_link_encryption_result(connection, result)
            }
            PalEvent::LinkEncryptionRequestTimedOut { connection } => {
                handler.on_link_encryption_request_timed_out(connection)
            }
            PalEvent::PasskeyDisplay {
                connection,
                passkey,
            } => handler.on_passkey_display(connection, passkey),
            PalEvent::KeypressNotification {
                connection,
                keypress,
            } => handler.on_keypress_notification(connection, keypress),
            PalEvent::PasskeyRequest { connection } => handler.on_passkey_request(connection),
            PalEvent::ConfirmationRequest { connection } => {
                handler.on_confirmation_request(connection)
            }
            PalEvent::SecureConnectionsOobRequest { connection } => {
                handler.on_secure_connections_oob_request(connection)
            }
            PalEvent::LegacyPairingOobRequest { connection } => {
                handler.on_legacy_pairing_oob_request(connection)
            }
            PalEvent::SecureConnectionsOobGenerated { random, confirm } => {
                handler.on_secure_connections_oob_generated(random, confirm)
            }
            PalEvent::SecureConnectionsLtkGenerated { connection, ltk } => {
                handler.on_secure_connections_ltk_generated(connection, ltk)
            }
            PalEvent::KeysDistributedLtk { connection, ltk } => {
                handler.on_keys_distributed_ltk(connection, ltk)
            }
            PalEvent::KeysDistributedEdivRand {
                connection,
                ediv,
                rand,
            } => handler.on_keys_distributed_ediv_rand(connection, ediv, rand),
            PalEvent::KeysDistributedLocalLtk { connection, ltk } => {
                handler.on_keys_distributed_local_ltk(connection, ltk)
            }
            PalEvent::KeysDistributedLocalEdivRand {
                connection,
                ediv,
                rand,
            } => handler.on_keys_distributed_local_ediv_rand(connection, ediv, rand),
            PalEvent::KeysDistributedIrk { connection, irk } => {
                handler.on_keys_distributed_irk(connection, irk)
            }
            PalEvent::KeysDistributedBdaddr {
                connection,
                peer_address_type,
                peer_identity_address,
            } => handler.on_keys_distributed_bdaddr(
                connection,
                peer_address_type,
                peer_identity_address,
            ),
            PalEvent::KeysDistributedCsrk { connection, csrk } => {
                handler.on_keys_distributed_csrk(connection, csrk)
            }
            PalEvent::LtkRequest {
                connection,
                request,
            } => handler.on_ltk_request(connection, request),
        }
    }
}

/// Receiver of the security events raised by the PAL
pub trait PalSecurityManagerEventHandler {
    fn on_pairing_request(
        &mut self,
        connection: ConnectionHandle,
        use_oob: bool,
        authentication: AuthenticationMask,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    );
    fn on_pairing_error(&mut self, connection: ConnectionHandle, error: PairingFailure);
    fn on_pairing_timed_out(&mut self, connection: ConnectionHandle);
    fn on_pairing_completed(&mut self, connection: ConnectionHandle);
    fn on_valid_mic_timeout(&mut self, connection: ConnectionHandle);
    fn on_slave_security_request(
        &mut self,
        connection: ConnectionHandle,
        authentication: AuthenticationMask,
    );
    fn on_link_encryption_result(&mut self, connection: ConnectionHandle, result: LinkEncryption);
    fn on_link_encryption_request_timed_out(&mut self, connection: ConnectionHandle);
    fn on_passkey_display(&mut self, connection: ConnectionHandle, passkey: Passkey);
    fn on_keypress_notification(&mut self, connection: ConnectionHandle, keypress: Keypress);
    fn on_passkey_request(&mut self, connection: ConnectionHandle);
    fn on_confirmation_request(&mut self, connection: ConnectionHandle);
    fn on_secure_connections_oob_request(&mut self, connection: ConnectionHandle);
    fn on_legacy_pairing_oob_request(&mut self, connection: ConnectionHandle);
    fn on_secure_connections_oob_generated(&mut self, random: OobLescValue, confirm: OobConfirm);
    fn on_secure_connections_ltk_generated(&mut self, connection: ConnectionHandle, ltk: Ltk);
    fn on_keys_distributed_ltk(&mut self, connection: ConnectionHandle, ltk: Ltk);
    fn on_keys_distributed_ediv_rand(&mut self, connection: ConnectionHandle, ediv: Ediv, rand: Rand);
    fn on_keys_distributed_local_ltk(&mut self, connection: ConnectionHandle, ltk: Ltk);
    fn on_keys_distributed_local_ediv_rand(
        &mut self,
        connection: ConnectionHandle,
        ediv: Ediv,
        rand: Rand,
    );
    fn on_keys_distributed_irk(&mut self, connection: ConnectionHandle, irk: Irk);
    fn on_keys_distributed_bdaddr(
        &mut self,
        connection: ConnectionHandle,
        peer_address_type: AddressType,
        peer_identity_address: BdAddr,
    );
    fn on_keys_distributed_csrk(&mut self, connection: ConnectionHandle, csrk: Csrk);
    fn on_ltk_request(&mut self, connection: ConnectionHandle, request: LtkRequest);
}

/// Connection lifecycle notifications supplied by GAP
pub trait PalConnectionMonitorEventHandler {
    /// A link came up. Fails when no per-connection security state can be allocated.
    fn on_connected(
        &mut self,
        connection: ConnectionHandle,
        role: ConnectionRole,
        peer_address_type: AddressType,
        peer_address: BdAddr,
        local_address_type: AddressType,
        local_address: BdAddr,
    ) -> SmResult<()>;

    fn on_disconnected(&mut self, connection: ConnectionHandle, reason: u8);
}

/// Signed write notifications supplied by the ATT layer
pub trait PalSigningMonitorEventHandler {
    /// A signed write from the peer passed verification
    fn on_signed_write_received(&mut self, connection: ConnectionHandle, sign_counter: u32);

    fn on_signed_write_verification_failure(&mut self, connection: ConnectionHandle);

    /// A signed write was sent to a peer
    fn on_signed_write(&mut self);
}

/// Security operations offered by a link controller
///
/// Methods return as soon as the request is handed over; outcomes arrive
/// later as [`PalEvent`]s.
pub trait PalSecurityManager {
    /// Native event type of the controller
    type ControllerEvent;

    /// Translate a controller event and queue the resulting PAL events
    fn handle_controller_event(&mut self, event: Self::ControllerEvent) -> SmResult<()>;

    /// Next queued PAL event
    fn poll_event(&mut self) -> Option<PalEvent>;

    fn initialize(&mut self) -> SmResult<()>;
    fn terminate(&mut self) -> SmResult<()>;
    fn reset(&mut self) -> SmResult<()>;

    // Resolving list

    fn read_resolving_list_capacity(&self) -> u8;
    fn add_device_to_resolving_list(
        &mut self,
        peer_identity_address_is_public: bool,
        peer_identity_address: &BdAddr,
        peer_irk: &Irk,
    ) -> SmResult<()>;
    fn remove_device_from_resolving_list(
        &mut self,
        peer_identity_address_is_public: bool,
        peer_identity_address: &BdAddr,
    ) -> SmResult<()>;
    fn clear_resolving_list(&mut self) -> SmResult<()>;

    // Feature support

    fn get_secure_connections_support(&self) -> bool;

    // Security settings

    /// Authenticated payload timeout in units of 10 ms
    fn set_authentication_timeout(
        &mut self,
        connection: ConnectionHandle,
        timeout_in_10ms: u16,
    ) -> SmResult<()>;
    fn get_authentication_timeout(&self, connection: ConnectionHandle) -> SmResult<u16>;
    fn slave_security_request(
        &mut self,
        connection: ConnectionHandle,
        authentication: AuthenticationMask,
    ) -> SmResult<()>;

    // Encryption

    fn enable_encryption(
        &mut self,
        connection: ConnectionHandle,
        ltk: &Ltk,
        rand: &Rand,
        ediv: &Ediv,
        mitm: bool,
    ) -> SmResult<()>;
    fn enable_secure_connections_encryption(
        &mut self,
        connection: ConnectionHandle,
        ltk: &Ltk,
        mitm: bool,
    ) -> SmResult<()>;
    fn get_encryption_key_size(&self, connection: ConnectionHandle) -> SmResult<u8>;

    // Privacy

    fn set_private_address_timeout(&mut self, timeout_in_seconds: u16) -> SmResult<()>;
    /// Identity address of the local device and whether it is public
    fn get_identity_address(&self) -> (BdAddr, bool);

    // Keys

    fn set_ltk(
        &mut self,
        connection: ConnectionHandle,
        ltk: &Ltk,
        mitm: bool,
        secure_connections: bool,
    ) -> SmResult<()>;
    fn set_ltk_not_found(&mut self, connection: ConnectionHandle) -> SmResult<()>;
    fn set_irk(&mut self, irk: &Irk) -> SmResult<()>;
    fn set_csrk(&mut self, csrk: &Csrk, sign_counter: u32) -> SmResult<()>;
    fn set_peer_csrk(
        &mut self,
        connection: ConnectionHandle,
        csrk: &Csrk,
        authenticated: bool,
        sign_counter: u32,
    ) -> SmResult<()>;
    /// Forget everything cached for a closed link, peer CSRK included
    fn release_connection(&mut self, connection: ConnectionHandle) -> SmResult<()>;

    // Authentication

    /// Passkey shown on display requests; `None` picks a random one each time
    fn set_display_passkey(&mut self, passkey: Option<u32>) -> SmResult<()>;
    fn set_io_capability(&mut self, io_capability: IoCapability) -> SmResult<()>;
    fn set_encryption_key_requirements(&mut self, min: u8, max: u8) -> SmResult<()>;
    fn encryption_key_requirements(&self) -> (u8, u8);
    fn send_pairing_request(
        &mut self,
        connection: ConnectionHandle,
        oob_data_flag: bool,
        authentication: AuthenticationMask,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    ) -> SmResult<()>;
    fn send_pairing_response(
        &mut self,
        connection: ConnectionHandle,
        oob_data_flag: bool,
        authentication: AuthenticationMask,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    ) -> SmResult<()>;
    fn cancel_pairing(&mut self, connection: ConnectionHandle, reason: PairingFailure)
        -> SmResult<()>;

    // MITM

    fn get_random_data(&mut self) -> SmResult<Rand>;
    fn passkey_request_reply(&mut self, connection: ConnectionHandle, passkey: u32)
        -> SmResult<()>;
    fn legacy_pairing_oob_request_reply(
        &mut self,
        connection: ConnectionHandle,
        oob_data: &OobTk,
    ) -> SmResult<()>;
    fn confirmation_entered(&mut self, connection: ConnectionHandle, confirmation: bool)
        -> SmResult<()>;
    fn send_keypress_notification(
        &mut self,
        connection: ConnectionHandle,
        keypress: Keypress,
    ) -> SmResult<()>;
    fn generate_secure_connections_oob(&mut self) -> SmResult<()>;
    fn secure_connections_oob_request_reply(
        &mut self,
        connection: ConnectionHandle,
        local_random: &OobLescValue,
        peer_random: &OobLescValue,
        peer_confirm: &OobConfirm,
    ) -> SmResult<()>;
}

#[cfg(test)]
mod tests;
