//! Application facing security events

use crate::gap::{BdAddr, ConnectionHandle, Whitelist};
use crate::smp::{
    Csrk, Keypress, LinkEncryption, OobConfirm, OobLescValue, OobTk, Passkey,
    SecurityCompletionStatus,
};

/// Receiver of security events.
///
/// Every method has an empty default so an application only overrides what
/// it cares about.
#[allow(unused_variables)]
pub trait SecurityManagerEventHandler {
    /// The peer asked to pair and authorisation is required.
    /// Answer with `accept_pairing_request` or `cancel_pairing_request`.
    fn pairing_request(&mut self, connection: ConnectionHandle) {}

    fn pairing_result(&mut self, connection: ConnectionHandle, result: SecurityCompletionStatus) {}

    fn link_encryption_result(&mut self, connection: ConnectionHandle, result: LinkEncryption) {}

    fn passkey_display(&mut self, connection: ConnectionHandle, passkey: Passkey) {}

    fn confirmation_request(&mut self, connection: ConnectionHandle) {}

    fn passkey_request(&mut self, connection: ConnectionHandle) {}

    fn keypress_notification(&mut self, connection: ConnectionHandle, keypress: Keypress) {}

    fn legacy_pairing_oob_request(&mut self, connection: ConnectionHandle) {}

    fn legacy_pairing_oob_generated(&mut self, address: &BdAddr, temporary_key: &OobTk) {}

    fn oob_generated(&mut self, address: &BdAddr, random: &OobLescValue, confirm: &OobConfirm) {}

    fn signing_key(&mut self, connection: ConnectionHandle, csrk: &Csrk, authenticated: bool) {}

    fn whitelist_from_bond_table(&mut self, whitelist: Whitelist) {}

    /// Identity of the peer, `None` when it never distributed one
    fn peer_identity(&mut self, connection: ConnectionHandle, identity: Option<(BdAddr, bool)>) {}

    fn valid_mic_timeout(&mut self, connection: ConnectionHandle) {}
}

/// Handler installed until the application registers its own
#[derive(Debug, Default)]
pub struct DefaultEventHandler;

impl SecurityManagerEventHandler for DefaultEventHandler {}

/// Security events as plain values
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SecurityEvent {
    /// Peer requests pairing
    PairingRequest(ConnectionHandle),
    /// Pairing finished
    PairingResult(ConnectionHandle, SecurityCompletionStatus),
    /// Encryption state of the link settled
    LinkEncryptionResult(ConnectionHandle, LinkEncryption),
    /// Passkey to show to the user
    PasskeyDisplay(ConnectionHandle, Passkey),
    /// User must confirm the displayed value
    ConfirmationRequest(ConnectionHandle),
    /// User must enter the passkey shown by the peer
    PasskeyRequest(ConnectionHandle),
    KeypressNotification(ConnectionHandle, Keypress),
    LegacyPairingOobRequest(ConnectionHandle),
    LegacyPairingOobGenerated(BdAddr, OobTk),
    /// Local Secure Connections OOB data ready
    OobGenerated(BdAddr, OobLescValue, OobConfirm),
    /// Peer CSRK and whether it was obtained with MITM protection
    SigningKey(ConnectionHandle, Csrk, bool),
    WhitelistFromBondTable(Whitelist),
    PeerIdentity(ConnectionHandle, Option<(BdAddr, bool)>),
    ValidMicTimeout(ConnectionHandle),
}

/// Adapts a closure taking [`SecurityEvent`]s into a handler
pub struct EventCallback<F: FnMut(SecurityEvent)>(pub F);

impl<F: FnMut(SecurityEvent)> SecurityManagerEventHandler for EventCallback<F> {
    fn pairing_request(&mut self, connection: ConnectionHandle) {
        (self.0)(SecurityEvent::PairingRequest(connection))
    }

    fn pairing_result(&mut self, connection: ConnectionHandle, result: SecurityCompletionStatus) {
        (self.0)(SecurityEvent::PairingResult(connection, result))
    }

    fn link_encryption_result(&mut self, connection: ConnectionHandle, result: LinkEncryption) {
        (self.0)(SecurityEvent::LinkEncryptionResult(connection, result))
    }

    fn passkey_display(&mut self, connection: ConnectionHandle, passkey: Passkey) {
        (self.0)(SecurityEvent::PasskeyDisplay(connection, passkey))
    }

    fn confirmation_request(&mut self, connection: ConnectionHandle) {
        (self.0)(SecurityEvent::ConfirmationRequest(connection))
    }

    fn passkey_request(&mut self, connection: ConnectionHandle) {
        (self.0)(SecurityEvent::PasskeyRequest(connection))
    }

    fn keypress_notification(&mut self, connection: ConnectionHandle, keypress: Keypress) {
        (self.0)(SecurityEvent::KeypressNotification(connection, keypress))
    }

    fn legacy_pairing_oob_request(&mut self, connection: ConnectionHandle) {
        (self.0)(SecurityEvent::LegacyPairingOobRequest(connection))
    }

    fn legacy_pairing_oob_generated(&mut self, address: &BdAddr, temporary_key: &OobTk) {
        (self.0)(SecurityEvent::LegacyPairingOobGenerated(*address, *temporary_key))
    }

    fn oob_generated(&mut self, address: &BdAddr, random: &OobLescValue, confirm: &OobConfirm) {
        (self.0)(SecurityEvent::OobGenerated(*address, *random, *confirm))
    }

    fn signing_key(&mut self, connection: ConnectionHandle, csrk: &Csrk, authenticated: bool) {
        (self.0)(SecurityEvent::SigningKey(connection, *csrk, authenticated))
    }

    fn whitelist_from_bond_table(&mut self, whitelist: Whitelist) {
        (self.0)(SecurityEvent::WhitelistFromBondTable(whitelist))
    }

    fn peer_identity(&mut self, connection: ConnectionHandle, identity: Option<(BdAddr, bool)>) {
        (self.0)(SecurityEvent::PeerIdentity(connection, identity))
    }

    fn valid_mic_timeout(&mut self, connection: ConnectionHandle) {
        (self.0)(SecurityEvent::ValidMicTimeout(connection))
    }
}
