//! Security manager core
//!
//! [`SecurityManager`] owns the per-connection control blocks, the bond
//! database, the process wide OOB state and the application event handler.
//! It drives a [`PalSecurityManager`] and consumes the events it reports.
//!
//! Everything runs on one logical thread. Controller events are fed in with
//! [`SecurityManager::process_controller_event`] (or queued on the PAL and
//! drained by [`SecurityManager::poll`]); database queries complete through
//! the same loop, so a key lookup started by one event is answered before
//! the next controller event is looked at.

mod config;
mod control_block;
mod events;
mod oob;

pub use self::config::SecurityManagerConfig;
pub use self::control_block::{
    ControlBlock, ControlBlockPool, MitmInput, DEFAULT_CONTROL_BLOCK_CAPACITY, MAX_CSRK_FAILURES,
};
pub use self::events::{
    DefaultEventHandler, EventCallback, SecurityEvent, SecurityManagerEventHandler,
};
pub use self::oob::{LegacyOob, LocalOob, OobState, PeerOob};

use crate::db::{
    DbCompletion, DbStorage, EntryHandle, EntryState, FileStorage, MemoryStorage, QueryId,
    SecurityDb, SecurityDistributionFlags, SecurityEntryIdentity, SecurityEntryKeys,
    SecurityEntrySigning,
};
use crate::error::{SmError, SmResult};
use crate::gap::{AddressType, BdAddr, ConnectionHandle, ConnectionRole, Whitelist};
use crate::pal::{
    PalConnectionMonitorEventHandler, PalSecurityManager, PalSecurityManagerEventHandler,
    PalSigningMonitorEventHandler,
};
use crate::smp::{
    generate_csrk, generate_irk, generate_oob_tk, validate_key_size_range, AuthenticationMask,
    Csrk, Ediv, IoCapability, Irk, KeyDistribution, Keypress, LinkEncryption, Ltk, LtkRequest,
    OobConfirm, OobLescValue, OobTk, PairingFailure, PairingState, Passkey, Rand,
    SecurityCompletionStatus, SecurityMode,
};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Work left to do once a database query completes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DbContinuation {
    /// Answer the controller's LTK request
    SetLtk,
    /// Start encryption with the stored peer LTK
    EnableEncryption,
    /// Hand the peer CSRK to the application
    ReturnCsrk,
    /// Install the peer CSRK in the controller
    SetPeerCsrk,
    PeerIdentity {
        connection: ConnectionHandle,
        notify_app: bool,
    },
    /// Rebuild the controller resolving list
    ResolvingList,
    Whitelist,
}

fn unknown_connection(connection: ConnectionHandle) -> SmError {
    SmError::InvalidParameter(format!("unknown connection {}", connection))
}

fn log_failure(operation: &str, result: SmResult<()>) {
    if let Err(err) = result {
        warn!("{} failed: {}", operation, err);
    }
}

/// Open the bond database at `path`, keeping bonds in memory when the file
/// cannot be used.
fn open_database(path: Option<&Path>, capacity: usize) -> SecurityDb {
    let storage: Box<dyn DbStorage> = match path {
        Some(path) => match FileStorage::open(path) {
            Ok(storage) => Box::new(storage),
            Err(err) => {
                warn!(
                    "Cannot use security database {}: {}, bonds kept in memory",
                    path.display(),
                    err
                );
                Box::new(MemoryStorage::default())
            }
        },
        None => Box::new(MemoryStorage::default()),
    };
    let mut db = SecurityDb::new(storage, capacity);
    if let Err(err) = db.restore() {
        warn!("Starting with an empty security database: {}", err);
    }
    db
}

/// Generic security manager
pub struct SecurityManager<P: PalSecurityManager> {
    pal: P,
    db: Option<SecurityDb>,
    control_blocks: ControlBlockPool,
    /// Database queries awaiting their completion
    pending: HashMap<QueryId, DbContinuation>,
    oob: OobState,
    handler: Box<dyn SecurityManagerEventHandler>,
    config: SecurityManagerConfig,

    default_authentication: AuthenticationMask,
    default_key_distribution: KeyDistribution,
    pairing_authorisation_required: bool,
    legacy_pairing_allowed: bool,
    /// Master distributes its own keys in anticipation of a role swap
    master_sends_keys: bool,
}

impl<P: PalSecurityManager> SecurityManager<P> {
    pub fn new(pal: P) -> Self {
        Self::with_capacity(pal, DEFAULT_CONTROL_BLOCK_CAPACITY)
    }

    /// Manager able to track `max_connections` links at once
    pub fn with_capacity(pal: P, max_connections: usize) -> Self {
        Self {
            pal,
            db: None,
            control_blocks: ControlBlockPool::with_capacity(max_connections),
            pending: HashMap::new(),
            oob: OobState::default(),
            handler: Box::new(DefaultEventHandler),
            config: SecurityManagerConfig::default(),
            default_authentication: AuthenticationMask::empty(),
            default_key_distribution: KeyDistribution::empty(),
            pairing_authorisation_required: false,
            legacy_pairing_allowed: true,
            master_sends_keys: false,
        }
    }

    pub fn pal(&self) -> &P {
        &self.pal
    }

    pub fn pal_mut(&mut self) -> &mut P {
        &mut self.pal
    }

    /// Bond database, present once [`SecurityManager::init`] ran
    pub fn db(&self) -> Option<&SecurityDb> {
        self.db.as_ref()
    }

    pub fn control_block(&self, connection: ConnectionHandle) -> Option<&ControlBlock> {
        self.control_blocks.get(connection)
    }

    pub fn oob_state(&self) -> &OobState {
        &self.oob
    }

    pub fn default_authentication(&self) -> AuthenticationMask {
        self.default_authentication
    }

    pub fn default_key_distribution(&self) -> KeyDistribution {
        self.default_key_distribution
    }

    pub fn set_event_handler(&mut self, handler: Box<dyn SecurityManagerEventHandler>) {
        self.handler = handler;
    }

    /// Deliver events to a closure as [`SecurityEvent`] values
    pub fn set_event_callback<F>(&mut self, callback: F)
    where
        F: FnMut(SecurityEvent) + 'static,
    {
        self.handler = Box::new(EventCallback(callback));
    }

    /// Drain database completions and PAL events until both queues are empty
    pub fn poll(&mut self) {
        loop {
            if let Some(completion) = self.db.as_mut().and_then(SecurityDb::take_completion) {
                self.on_db_completion(completion);
            } else if let Some(event) = self.pal.poll_event() {
                debug!("PAL event {:?}", event);
                event.dispatch(self);
            } else {
                break;
            }
        }
    }

    /// Hand a controller event to the PAL and process everything it causes
    pub fn process_controller_event(&mut self, event: P::ControllerEvent) -> SmResult<()> {
        let result = self.pal.handle_controller_event(event);
        self.poll();
        result
    }

    //
    // Lifecycle
    //

    /// Apply global defaults, open the bond database and load the local keys.
    ///
    /// May be called again to change settings. Switching to another database
    /// fails with `InvalidState` while links are up.
    pub fn init(&mut self, config: SecurityManagerConfig) -> SmResult<()> {
        let reopen = self.db.is_none()
            || config.db_path != self.config.db_path
            || config.db_capacity != self.config.db_capacity;
        if reopen && self.db.is_some() && !self.control_blocks.is_empty() {
            return Err(SmError::InvalidState(
                "cannot switch security database with active connections".to_string(),
            ));
        }
        if reopen {
            if let Some(db) = self.db.as_mut() {
                log_failure("Security database sync", db.sync());
            }
            self.pending.clear();
            self.db = Some(open_database(config.db_path.as_deref(), config.db_capacity));
        }

        self.pal.initialize()?;
        self.pal.set_io_capability(config.io_capability)?;
        self.pal
            .set_display_passkey(config.passkey.map(|passkey| passkey.to_number()))?;
        self.legacy_pairing_allowed = true;

        let mut authentication = AuthenticationMask::KEYPRESS_NOTIFICATION;
        authentication.set(AuthenticationMask::BONDING, config.bondable);
        authentication.set(AuthenticationMask::MITM, config.mitm);
        authentication.set(
            AuthenticationMask::SECURE_CONNECTIONS,
            self.pal.get_secure_connections_support(),
        );
        self.default_authentication = authentication;

        let mut distribution = KeyDistribution::ENCRYPTION | KeyDistribution::IDENTITY;
        distribution.set(KeyDistribution::SIGNING, config.signing);
        self.default_key_distribution = distribution;
        self.config = config;

        if self.config.signing {
            self.init_signing()?;
        }
        self.init_identity()?;
        self.init_resolving_list()?;
        info!(
            "Security manager initialized, authentication {:?}, distribution {:?}",
            self.default_authentication, self.default_key_distribution
        );
        Ok(())
    }

    /// Flush bonds and return to the uninitialised defaults.
    ///
    /// Bonds survive in the database when restore is enabled. Call
    /// [`SecurityManager::init`] again before using the manager.
    pub fn reset(&mut self) -> SmResult<()> {
        if let Some(db) = self.db.as_mut() {
            for cb in self.control_blocks.iter() {
                if let Some(entry) = cb.db_entry {
                    db.close_entry(entry, false);
                }
            }
            log_failure("Security database sync", db.sync());
            log_failure("Security database reload", db.reload());
        }
        self.pal.reset()?;
        self.control_blocks.release_all();
        self.pending.clear();
        self.oob = OobState::default();
        self.handler = Box::new(DefaultEventHandler);
        self.pairing_authorisation_required = false;
        self.master_sends_keys = false;
        info!("Security manager reset");
        Ok(())
    }

    /// Persist bonds and shut the PAL down
    pub fn terminate(&mut self) -> SmResult<()> {
        if let Some(db) = self.db.as_mut() {
            db.sync()?;
        }
        self.pal.terminate()
    }

    /// Keep bonds across resets and restarts
    pub fn preserve_bonding_state_on_reset(&mut self, enable: bool) -> SmResult<()> {
        self.db_mut()?.set_restore(enable);
        Ok(())
    }

    /// Store bonds in another file, or in memory with `None`
    pub fn set_database_filepath(&mut self, path: Option<PathBuf>) -> SmResult<()> {
        if !self.control_blocks.is_empty() {
            return Err(SmError::InvalidState(
                "cannot switch security database with active connections".to_string(),
            ));
        }
        if let Some(db) = self.db.as_mut() {
            log_failure("Security database sync", db.sync());
        }
        self.pending.clear();
        self.db = Some(open_database(path.as_deref(), self.config.db_capacity));
        self.config.db_path = path;

        if self.config.signing {
            self.init_signing()?;
        }
        self.init_identity()?;
        self.init_resolving_list()
    }

    fn db_mut(&mut self) -> SmResult<&mut SecurityDb> {
        self.db.as_mut().ok_or(SmError::NotInitialized)
    }

    fn init_signing(&mut self) -> SmResult<()> {
        let db = self.db_mut()?;
        let csrk = match db.local_csrk() {
            Some(csrk) => *csrk,
            None => {
                let csrk = generate_csrk();
                db.set_local_csrk(&csrk);
                db.set_local_sign_counter(0);
                debug!("Generated local CSRK");
                csrk
            }
        };
        let counter = db.local_sign_counter();
        self.pal.set_csrk(&csrk, counter)
    }

    fn init_identity(&mut self) -> SmResult<()> {
        let (address, is_public) = self.pal.get_identity_address();
        let db = self.db_mut()?;
        let irk = match db.local_identity() {
            Some(identity) if !identity.irk.is_zero() => identity.irk,
            _ => {
                let irk = generate_irk();
                db.set_local_identity(&irk, &address, is_public);
                debug!("Generated local IRK for {}", address);
                irk
            }
        };
        self.pal.set_irk(&irk)
    }

    fn init_resolving_list(&mut self) -> SmResult<()> {
        let capacity = usize::from(self.pal.read_resolving_list_capacity());
        let query = self.db_mut()?.get_identity_list(capacity);
        self.pending.insert(query, DbContinuation::ResolvingList);
        Ok(())
    }

    //
    // Bond management
    //

    /// Forget every bond and regenerate the local keys
    pub fn purge_all_bonding_state(&mut self) -> SmResult<()> {
        let db = self.db_mut()?;
        db.clear_entries();
        log_failure("Security database sync", db.sync());
        // Live links keep running unbonded
        for cb in self.control_blocks.iter_mut() {
            cb.db_entry = None;
            cb.entry_preexisting = false;
        }
        self.pending.clear();

        if self.config.signing {
            self.init_signing()?;
        }
        self.init_identity()?;
        self.init_resolving_list()
    }

    /// Fill `whitelist` with bonded peers; delivered via `whitelist_from_bond_table`
    pub fn generate_whitelist_from_bond_table(&mut self, whitelist: Whitelist) -> SmResult<()> {
        let query = self.db_mut()?.generate_whitelist_from_bond_table(whitelist);
        self.pending.insert(query, DbContinuation::Whitelist);
        Ok(())
    }

    /// Look up the identity of a peer; delivered via `peer_identity`
    pub fn get_peer_identity(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        let cb = self.block(connection)?;
        match cb.db_entry {
            Some(entry) => {
                let query = self.db_mut()?.get_entry_identity(entry);
                self.pending.insert(
                    query,
                    DbContinuation::PeerIdentity {
                        connection,
                        notify_app: true,
                    },
                );
            }
            None => self.handler.peer_identity(connection, None),
        }
        Ok(())
    }

    //
    // Global settings
    //

    pub fn set_io_capability(&mut self, io_capability: IoCapability) -> SmResult<()> {
        self.pal.set_io_capability(io_capability)?;
        self.config.io_capability = io_capability;
        Ok(())
    }

    /// Static passkey for display requests; `None` selects a random one per pairing
    pub fn set_display_passkey(&mut self, passkey: Option<Passkey>) -> SmResult<()> {
        self.pal
            .set_display_passkey(passkey.map(|passkey| passkey.to_number()))?;
        self.config.passkey = passkey;
        Ok(())
    }

    pub fn set_pairing_request_authorisation(&mut self, required: bool) {
        self.pairing_authorisation_required = required;
    }

    /// Whether legacy pairing requests are accepted
    pub fn allow_legacy_pairing(&mut self, allow: bool) {
        self.legacy_pairing_allowed = allow;
    }

    pub fn set_keypress_notification(&mut self, enabled: bool) {
        self.default_authentication
            .set(AuthenticationMask::KEYPRESS_NOTIFICATION, enabled);
    }

    /// Have the master distribute its own keys too
    pub fn set_hint_future_role_reversal(&mut self, enable: bool) {
        self.master_sends_keys = enable;
    }

    pub fn get_secure_connections_support(&self) -> bool {
        self.pal.get_secure_connections_support()
    }

    pub fn set_private_address_timeout(&mut self, timeout_in_seconds: u16) -> SmResult<()> {
        self.pal.set_private_address_timeout(timeout_in_seconds)
    }

    pub fn set_encryption_key_requirements(&mut self, min: u8, max: u8) -> SmResult<()> {
        validate_key_size_range(min, max)?;
        self.pal.set_encryption_key_requirements(min, max)
    }

    pub fn get_encryption_key_requirements(&self) -> (u8, u8) {
        self.pal.encryption_key_requirements()
    }

    /// Authenticated payload timeout of a link, in milliseconds
    pub fn set_authentication_timeout(
        &mut self,
        connection: ConnectionHandle,
        timeout_in_ms: u32,
    ) -> SmResult<()> {
        self.block(connection)?;
        let timeout = u16::try_from(timeout_in_ms / 10).map_err(|_| {
            SmError::InvalidParameter(format!("timeout {} ms out of range", timeout_in_ms))
        })?;
        self.pal.set_authentication_timeout(connection, timeout)
    }

    pub fn get_authentication_timeout(&self, connection: ConnectionHandle) -> SmResult<u32> {
        self.block(connection)?;
        let timeout = self.pal.get_authentication_timeout(connection)?;
        Ok(u32::from(timeout) * 10)
    }

    /// Size of the key encrypting the link; `InvalidState` while unencrypted
    pub fn get_encryption_key_size(&self, connection: ConnectionHandle) -> SmResult<u8> {
        self.block(connection)?;
        self.pal.get_encryption_key_size(connection)
    }

    //
    // Pairing
    //

    /// Start pairing on a link where the local device is master
    pub fn request_pairing(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        let cb = self.block(connection)?;
        if !cb.is_master {
            return Err(SmError::NotImplemented);
        }
        self.update_oob_presence(connection);
        let cb = self.block(connection)?;

        let authentication = self.link_authentication(&cb);
        let signing = cb.signing(self.default_signing());

        let mut initiator_dist = KeyDistribution::IDENTITY;
        initiator_dist.set(KeyDistribution::SIGNING, signing);
        if self.master_sends_keys {
            initiator_dist = self.default_key_distribution;
        }
        let mut responder_dist = self.default_key_distribution;
        responder_dist.set(KeyDistribution::SIGNING, signing);

        self.pal.send_pairing_request(
            connection,
            cb.oob_present,
            authentication,
            initiator_dist,
            responder_dist,
        )?;
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.pairing_state = PairingState::Requested;
        }
        debug!("Pairing requested on connection {}", connection);
        Ok(())
    }

    /// Answer a pairing request from the peer with the local preferences
    pub fn accept_pairing_request(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        self.block(connection)?;
        self.update_oob_presence(connection);
        let cb = self.block(connection)?;

        let authentication = self.link_authentication(&cb);
        let signing = cb.signing(self.default_signing());

        let mut initiator_dist = cb.initiator_key_distribution;
        let master_signing = initiator_dist.contains(KeyDistribution::SIGNING);
        if self.master_sends_keys {
            initiator_dist &= self.default_key_distribution;
        } else {
            initiator_dist &= KeyDistribution::IDENTITY | KeyDistribution::LINK;
        }
        if master_signing {
            initiator_dist.set(KeyDistribution::SIGNING, signing);
        }

        let mut responder_dist = cb.responder_key_distribution & self.default_key_distribution;
        if responder_dist.contains(KeyDistribution::SIGNING) {
            responder_dist.set(KeyDistribution::SIGNING, signing);
        }

        self.pal.send_pairing_response(
            connection,
            cb.oob_present,
            authentication,
            initiator_dist,
            responder_dist,
        )?;
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.pairing_state = PairingState::InProgress;
        }
        Ok(())
    }

    pub fn cancel_pairing_request(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        self.block(connection)?;
        self.pal
            .cancel_pairing(connection, PairingFailure::UnspecifiedReason)
    }

    pub fn pairing_state(&self, connection: ConnectionHandle) -> SmResult<PairingState> {
        Ok(self.block(connection)?.pairing_state)
    }

    //
    // Encryption and signing
    //

    /// Current encryption state of a link
    pub fn get_link_encryption(&self, connection: ConnectionHandle) -> SmResult<LinkEncryption> {
        let cb = self.block(connection)?;
        Ok(if cb.encrypted {
            cb.encryption_level
        } else if cb.encryption_requested {
            LinkEncryption::EncryptionInProgress
        } else {
            LinkEncryption::NotEncrypted
        })
    }

    /// Raise the encryption of a link.
    ///
    /// Levels never go down: asking for the current level or a lower one
    /// succeeds at once and reports the unchanged level through
    /// `link_encryption_result`.
    pub fn set_link_encryption(
        &mut self,
        connection: ConnectionHandle,
        encryption: LinkEncryption,
    ) -> SmResult<()> {
        let cb = self.block(connection)?;
        let current = self.get_link_encryption(connection)?;
        if current == LinkEncryption::EncryptionInProgress {
            return Err(SmError::Busy);
        }
        let Some(requested_rank) = encryption.rank() else {
            return Err(SmError::InvalidParameter(
                "encryption in progress is not a level".to_string(),
            ));
        };
        if current.rank().is_some_and(|rank| requested_rank <= rank) {
            self.handler.link_encryption_result(connection, current);
            return Ok(());
        }

        let flags = self.entry_flags(&cb);
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.encryption_requested = true;
        }
        let result = match encryption {
            LinkEncryption::Encrypted => self.enable_encryption(connection),
            LinkEncryption::EncryptedWithScAndMitm if !flags.secure_connections_paired => {
                if let Some(cb) = self.control_blocks.get_mut(connection) {
                    cb.mitm_requested = true;
                }
                self.pair_or_request(connection)
            }
            _ if flags.ltk_mitm_protected && !cb.encrypted => self.enable_encryption(connection),
            _ => self.request_authentication(connection),
        };
        if result.is_err() {
            if let Some(cb) = self.control_blocks.get_mut(connection) {
                cb.encryption_requested = false;
            }
        }
        result
    }

    /// Require encryption and, for the signed modes, a peer CSRK
    pub fn set_link_security(
        &mut self,
        connection: ConnectionHandle,
        mode: SecurityMode,
    ) -> SmResult<()> {
        match mode {
            SecurityMode::NoAccess => Err(SmError::InvalidParameter(
                "no access is not a link security mode".to_string(),
            )),
            SecurityMode::EncryptionOpenLink => {
                self.set_link_encryption(connection, LinkEncryption::NotEncrypted)
            }
            SecurityMode::EncryptionNoMitm => {
                self.set_link_encryption(connection, LinkEncryption::Encrypted)
            }
            SecurityMode::EncryptionWithMitm => {
                self.set_link_encryption(connection, LinkEncryption::EncryptedWithMitm)
            }
            SecurityMode::SignedNoMitm => self.get_signing_key(connection, false),
            SecurityMode::SignedWithMitm => self.get_signing_key(connection, true),
        }
    }

    /// Fetch the peer CSRK, pairing first when none of the required quality exists.
    /// The key arrives through `signing_key`.
    pub fn get_signing_key(
        &mut self,
        connection: ConnectionHandle,
        authenticated: bool,
    ) -> SmResult<()> {
        let cb = self.block(connection)?;
        let flags = self.entry_flags(&cb);
        match cb.db_entry {
            Some(entry) if flags.csrk_stored && (flags.csrk_mitm_protected || !authenticated) => {
                let query = self.db_mut()?.get_entry_peer_csrk(entry);
                self.pending.insert(query, DbContinuation::ReturnCsrk);
                Ok(())
            }
            _ if authenticated => self.request_authentication(connection),
            _ => self.pair_or_request(connection),
        }
    }

    /// Ask for signing keys on one link, overriding the global default
    pub fn enable_signing(&mut self, connection: ConnectionHandle, enabled: bool) -> SmResult<()> {
        let cb = self.block(connection)?;
        let flags = self.entry_flags(&cb);
        let default_signing = self.default_signing();

        let wanted = enabled && !cb.signing_requested && !default_signing;
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.signing_override_default = true;
            cb.signing_requested = enabled;
        }
        if !wanted {
            return Ok(());
        }

        match cb.db_entry {
            Some(entry) if flags.csrk_stored => {
                let query = self.db_mut()?.get_entry_peer_csrk(entry);
                self.pending.insert(query, DbContinuation::ReturnCsrk);
                Ok(())
            }
            _ => {
                self.init_signing()?;
                self.pair_or_request(connection)
            }
        }
    }

    fn enable_encryption(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        let cb = self.block(connection)?;
        if !cb.is_master {
            return self.slave_security_request(connection);
        }
        let flags = self.entry_flags(&cb);
        match cb.db_entry {
            Some(entry) if flags.ltk_stored => {
                let query = self.db_mut()?.get_entry_peer_keys(entry);
                self.pending.insert(query, DbContinuation::EnableEncryption);
                Ok(())
            }
            _ => self.request_pairing(connection),
        }
    }

    /// Ask for MITM protected keys, pairing again when the bond lacks them
    pub fn request_authentication(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        let cb = self.block(connection)?;
        let flags = self.entry_flags(&cb);
        if flags.ltk_mitm_protected {
            if cb.authenticated {
                return Ok(());
            }
            if let Some(cb) = self.control_blocks.get_mut(connection) {
                cb.encryption_requested = true;
            }
            self.enable_encryption(connection)
        } else {
            if let Some(cb) = self.control_blocks.get_mut(connection) {
                cb.mitm_requested = true;
            }
            self.pair_or_request(connection)
        }
    }

    fn slave_security_request(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        let cb = self.block(connection)?;
        let authentication = self.link_authentication(&cb);
        self.pal.slave_security_request(connection, authentication)
    }

    /// Pair as master or ask the master to do it
    fn pair_or_request(&mut self, connection: ConnectionHandle) -> SmResult<()> {
        if self.block(connection)?.is_master {
            self.request_pairing(connection)
        } else {
            self.slave_security_request(connection)
        }
    }

    //
    // MITM
    //

    pub fn passkey_entered(&mut self, connection: ConnectionHandle, passkey: Passkey) -> SmResult<()> {
        self.expect_input(connection, MitmInput::Passkey)?;
        self.pal.passkey_request_reply(connection, passkey.to_number())?;
        self.clear_input(connection);
        Ok(())
    }

    pub fn confirmation_entered(
        &mut self,
        connection: ConnectionHandle,
        confirmation: bool,
    ) -> SmResult<()> {
        self.expect_input(connection, MitmInput::Confirmation)?;
        self.pal.confirmation_entered(connection, confirmation)?;
        self.clear_input(connection);
        Ok(())
    }

    /// Report passkey entry progress to the peer
    pub fn send_keypress_notification(
        &mut self,
        connection: ConnectionHandle,
        keypress: Keypress,
    ) -> SmResult<()> {
        if !self.default_authentication.keypress_notification() {
            return Err(SmError::InvalidState(
                "keypress notifications are disabled".to_string(),
            ));
        }
        self.expect_input(connection, MitmInput::Passkey)?;
        self.pal.send_keypress_notification(connection, keypress)
    }

    fn expect_input(&self, connection: ConnectionHandle, input: MitmInput) -> SmResult<()> {
        let cb = self.block(connection)?;
        if cb.pending_input == Some(input) {
            Ok(())
        } else {
            Err(SmError::InvalidState(format!(
                "no {:?} request outstanding on connection {}",
                input, connection
            )))
        }
    }

    fn clear_input(&mut self, connection: ConnectionHandle) {
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.pending_input = None;
        }
    }

    //
    // Out of band data
    //

    /// Create OOB data for `address`.
    ///
    /// The legacy temporary key is reported through
    /// `legacy_pairing_oob_generated` once the controller took the request;
    /// Secure Connections data follows in `oob_generated` when the
    /// controller supports it. On error nothing changes.
    pub fn generate_oob(&mut self, address: &BdAddr) -> SmResult<()> {
        if self.oob.is_generating() {
            return Err(SmError::Busy);
        }

        let tk = generate_oob_tk();
        let previous = (self.oob.local, self.oob.local_address);
        self.oob.local_address = *address;
        self.oob.local = LocalOob::Generating;
        if let Err(err) = self.pal.generate_secure_connections_oob() {
            (self.oob.local, self.oob.local_address) = previous;
            if err != SmError::NotImplemented {
                return Err(err);
            }
            debug!("Secure Connections OOB not supported, legacy key only");
        }

        self.oob.legacy = Some(LegacyOob {
            creator: *address,
            tk,
        });
        self.handler.legacy_pairing_oob_generated(address, &tk);
        Ok(())
    }

    /// Use OOB data on a link, with OOB counting as MITM protection
    pub fn set_oob_data_usage(&mut self, connection: ConnectionHandle, use_oob: bool) -> SmResult<()> {
        self.set_oob_data_usage_with_mitm(connection, use_oob, true)
    }

    pub fn set_oob_data_usage_with_mitm(
        &mut self,
        connection: ConnectionHandle,
        use_oob: bool,
        oob_provides_mitm: bool,
    ) -> SmResult<()> {
        let cb = self.control_blocks.get_mut(connection).ok_or_else(|| unknown_connection(connection))?;
        cb.attempt_oob = use_oob;
        cb.oob_mitm_protection = oob_provides_mitm;
        let local_address = cb.local_address;
        if !use_oob {
            return Ok(());
        }
        match self.generate_oob(&local_address) {
            // Data already on its way
            Err(SmError::Busy) => Ok(()),
            result => result,
        }
    }

    /// Legacy temporary key received out of band from `address`
    pub fn legacy_pairing_oob_received(&mut self, address: &BdAddr, tk: &OobTk) -> SmResult<()> {
        let cb = self
            .control_blocks
            .iter()
            .find(|cb| self.entry_flags(cb).peer_address == *address)
            .copied()
            .ok_or_else(|| {
                SmError::InvalidParameter(format!("no connection to {}", address))
            })?;

        self.oob.legacy = Some(LegacyOob {
            creator: *address,
            tk: *tk,
        });
        if let Some(block) = self.control_blocks.get_mut(cb.connection) {
            block.attempt_oob = true;
        }
        if cb.legacy_pairing_oob_request_pending {
            self.on_legacy_pairing_oob_request(cb.connection);
            if let Some(block) = self.control_blocks.get_mut(cb.connection) {
                block.legacy_pairing_oob_request_pending = false;
            }
        }
        Ok(())
    }

    /// Secure Connections OOB data received from `address`
    pub fn oob_received(
        &mut self,
        address: &BdAddr,
        random: &OobLescValue,
        confirm: &OobConfirm,
    ) -> SmResult<()> {
        self.oob.peer = Some(PeerOob {
            address: *address,
            random: *random,
            confirm: *confirm,
        });
        Ok(())
    }

    fn update_oob_presence(&mut self, connection: ConnectionHandle) {
        let Some(cb) = self.control_blocks.get(connection).copied() else {
            return;
        };
        let peer_address = self.entry_flags(&cb).peer_address;
        let oob_present = if self.default_authentication.secure_connections() {
            self.oob
                .peer
                .is_some_and(|peer| !peer_address.is_zero() && peer.address == peer_address)
        } else {
            cb.attempt_oob
                || self.oob.legacy.is_some_and(|legacy| {
                    legacy.creator == cb.local_address
                        || (!peer_address.is_zero() && legacy.creator == peer_address)
                })
        };
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.oob_present = oob_present;
        }
    }

    //
    // Helpers
    //

    fn block(&self, connection: ConnectionHandle) -> SmResult<ControlBlock> {
        self.control_blocks
            .get(connection)
            .copied()
            .ok_or_else(|| unknown_connection(connection))
    }

    /// Distribution flags of the link's entry, empty when it has none
    fn entry_flags(&self, cb: &ControlBlock) -> SecurityDistributionFlags {
        cb.db_entry
            .and_then(|entry| self.db.as_ref()?.distribution_flags(entry).cloned())
            .unwrap_or_default()
    }

    /// Entry of a live link for storing distributed keys
    fn keys_entry(&self, connection: ConnectionHandle) -> Option<(ControlBlock, EntryHandle)> {
        let cb = self.control_blocks.get(connection)?;
        match cb.db_entry {
            Some(entry) if self.db.is_some() => Some((*cb, entry)),
            _ => {
                debug!("Dropping keys for connection {} without a bond entry", connection);
                None
            }
        }
    }

    fn default_signing(&self) -> bool {
        self.default_key_distribution
            .contains(KeyDistribution::SIGNING)
    }

    fn link_authentication(&self, cb: &ControlBlock) -> AuthenticationMask {
        let mut authentication = self.default_authentication;
        if cb.mitm_requested {
            authentication.insert(AuthenticationMask::MITM);
        }
        if cb.db_entry.is_none() {
            authentication.remove(AuthenticationMask::BONDING);
        }
        authentication
    }

    fn set_mitm_performed(&mut self, connection: ConnectionHandle, performed: bool) {
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.mitm_performed = performed;
            if matches!(cb.pairing_state, PairingState::Idle | PairingState::Requested) {
                cb.pairing_state = PairingState::InProgress;
            }
        }
    }

    fn with_flags<F>(&mut self, entry: EntryHandle, update: F)
    where
        F: FnOnce(&mut SecurityDistributionFlags),
    {
        if let Some(flags) = self
            .db
            .as_mut()
            .and_then(|db| db.distribution_flags_mut(entry))
        {
            update(flags);
        }
    }

    fn end_pairing(&mut self, connection: ConnectionHandle, status: SecurityCompletionStatus) {
        let Some(cb) = self.control_blocks.get_mut(connection) else {
            warn!("Pairing ended on unknown connection {}", connection);
            return;
        };
        cb.mitm_performed = false;
        cb.mitm_requested = false;
        cb.pending_input = None;
        cb.pairing_state = match status {
            SecurityCompletionStatus::Timeout => PairingState::TimedOut,
            _ => PairingState::Failed,
        };
        // Encryption waiting on this pairing can no longer complete
        let encryption_abandoned = cb.encryption_requested;
        cb.encryption_requested = false;
        cb.encryption_failed = false;
        let level = if cb.encrypted {
            cb.encryption_level
        } else {
            LinkEncryption::NotEncrypted
        };

        info!("Pairing on connection {} ended: {:?}", connection, status);
        self.handler.pairing_result(connection, status);
        if encryption_abandoned {
            self.handler.link_encryption_result(connection, level);
        }
    }

    //
    // Database completions
    //

    fn on_db_completion(&mut self, completion: DbCompletion) {
        let Some(continuation) = self.pending.remove(&completion.query()) else {
            debug!("Dropping stale database completion {:?}", completion.query());
            return;
        };
        match (continuation, completion) {
            (DbContinuation::SetLtk, DbCompletion::LocalKeys { entry, keys, .. }) => {
                self.set_ltk_cb(entry, keys)
            }
            (DbContinuation::EnableEncryption, DbCompletion::PeerKeys { entry, keys, .. }) => {
                self.enable_encryption_cb(entry, keys)
            }
            (DbContinuation::ReturnCsrk, DbCompletion::PeerSigning { entry, signing, .. }) => {
                self.return_csrk_cb(entry, signing)
            }
            (DbContinuation::SetPeerCsrk, DbCompletion::PeerSigning { entry, signing, .. }) => {
                self.set_peer_csrk_cb(entry, signing)
            }
            (
                DbContinuation::PeerIdentity {
                    connection,
                    notify_app,
                },
                DbCompletion::Identity { identity, .. },
            ) => self.peer_identity_cb(connection, notify_app, identity),
            (DbContinuation::ResolvingList, DbCompletion::IdentityList { identities, .. }) => {
                self.resolving_list_cb(identities)
            }
            (DbContinuation::Whitelist, DbCompletion::Whitelist { whitelist, .. }) => {
                self.handler.whitelist_from_bond_table(whitelist)
            }
            (continuation, completion) => {
                warn!(
                    "Database completion {:?} does not match {:?}",
                    completion, continuation
                );
            }
        }
    }

    fn link_for_entry(&self, entry: EntryHandle) -> Option<ControlBlock> {
        let cb = self.control_blocks.find_by_entry(entry).copied();
        if cb.is_none() {
            debug!("No live connection for security entry {}", entry.index());
        }
        cb
    }

    fn set_ltk_cb(&mut self, entry: EntryHandle, keys: Option<SecurityEntryKeys>) {
        let Some(cb) = self.link_for_entry(entry) else {
            return;
        };
        let flags = self.entry_flags(&cb);
        let result = match keys {
            Some(keys) => self.pal.set_ltk(
                cb.connection,
                &keys.ltk,
                flags.ltk_mitm_protected,
                flags.secure_connections_paired,
            ),
            None => self.pal.set_ltk_not_found(cb.connection),
        };
        log_failure("LTK reply", result);
    }

    fn enable_encryption_cb(&mut self, entry: EntryHandle, keys: Option<SecurityEntryKeys>) {
        let Some(cb) = self.link_for_entry(entry) else {
            return;
        };
        let flags = self.entry_flags(&cb);
        let result = match keys {
            Some(keys) if flags.secure_connections_paired => self
                .pal
                .enable_secure_connections_encryption(cb.connection, &keys.ltk, flags.ltk_mitm_protected),
            Some(keys) => self.pal.enable_encryption(
                cb.connection,
                &keys.ltk,
                &keys.rand,
                &keys.ediv,
                flags.ltk_mitm_protected,
            ),
            None => Err(SmError::NotFound),
        };
        if let Err(err) = result {
            warn!("Cannot start encryption on connection {}: {}", cb.connection, err);
            if let Some(block) = self.control_blocks.get_mut(cb.connection) {
                block.encryption_requested = false;
            }
            self.handler
                .link_encryption_result(cb.connection, LinkEncryption::NotEncrypted);
        }
    }

    fn return_csrk_cb(&mut self, entry: EntryHandle, signing: Option<SecurityEntrySigning>) {
        let Some(cb) = self.link_for_entry(entry) else {
            return;
        };
        match signing {
            Some(signing) => {
                let authenticated = self.entry_flags(&cb).csrk_mitm_protected;
                self.handler
                    .signing_key(cb.connection, &signing.csrk, authenticated);
            }
            None => debug!("No CSRK stored for connection {}", cb.connection),
        }
    }

    fn set_peer_csrk_cb(&mut self, entry: EntryHandle, signing: Option<SecurityEntrySigning>) {
        let Some(cb) = self.link_for_entry(entry) else {
            return;
        };
        if let Some(signing) = signing {
            let authenticated = self.entry_flags(&cb).csrk_mitm_protected;
            log_failure(
                "Peer CSRK install",
                self.pal
                    .set_peer_csrk(cb.connection, &signing.csrk, authenticated, signing.counter),
            );
        }
    }

    fn peer_identity_cb(
        &mut self,
        connection: ConnectionHandle,
        notify_app: bool,
        identity: Option<SecurityEntryIdentity>,
    ) {
        if let Some(identity) = identity {
            log_failure(
                "Resolving list update",
                self.pal.add_device_to_resolving_list(
                    identity.identity_address_is_public,
                    &identity.identity_address,
                    &identity.irk,
                ),
            );
        }
        if notify_app {
            self.handler.peer_identity(
                connection,
                identity.map(|id| (id.identity_address, id.identity_address_is_public)),
            );
        }
    }

    fn resolving_list_cb(&mut self, identities: Vec<SecurityEntryIdentity>) {
        log_failure("Resolving list clear", self.pal.clear_resolving_list());
        for identity in &identities {
            log_failure(
                "Resolving list update",
                self.pal.add_device_to_resolving_list(
                    identity.identity_address_is_public,
                    &identity.identity_address,
                    &identity.irk,
                ),
            );
        }
        debug!("Resolving list holds {} identities", identities.len());
    }
}

impl<P: PalSecurityManager> PalSecurityManagerEventHandler for SecurityManager<P> {
    fn on_pairing_request(
        &mut self,
        connection: ConnectionHandle,
        _use_oob: bool,
        authentication: AuthenticationMask,
        initiator_dist: KeyDistribution,
        responder_dist: KeyDistribution,
    ) {
        if !self.legacy_pairing_allowed && !authentication.secure_connections() {
            info!("Rejecting legacy pairing on connection {}", connection);
            log_failure("Pairing cancel", self.cancel_pairing_request(connection));
            return;
        }

        let Some(cb) = self.control_blocks.get_mut(connection) else {
            warn!("Pairing request on unknown connection {}", connection);
            return;
        };
        cb.initiator_key_distribution = initiator_dist;
        cb.responder_key_distribution = responder_dist;
        cb.mitm_performed = false;
        cb.pairing_state = PairingState::Requested;

        if self.pairing_authorisation_required {
            self.handler.pairing_request(connection);
        } else {
            log_failure("Pairing response", self.accept_pairing_request(connection));
        }
    }

    fn on_pairing_error(&mut self, connection: ConnectionHandle, error: PairingFailure) {
        self.end_pairing(connection, SecurityCompletionStatus::Failure(error));
    }

    fn on_pairing_timed_out(&mut self, connection: ConnectionHandle) {
        self.end_pairing(connection, SecurityCompletionStatus::Timeout);
    }

    fn on_pairing_completed(&mut self, connection: ConnectionHandle) {
        let Some(cb) = self.control_blocks.get_mut(connection) else {
            warn!("Pairing completed on unknown connection {}", connection);
            return;
        };
        cb.pairing_state = PairingState::Paired;
        cb.pending_input = None;
        cb.mitm_requested = false;
        let entry = cb.db_entry;

        if let (Some(entry), Some(db)) = (entry, self.db.as_mut()) {
            let query = db.get_entry_identity(entry);
            self.pending.insert(
                query,
                DbContinuation::PeerIdentity {
                    connection,
                    notify_app: false,
                },
            );
            if self.default_authentication.bondable() {
                log_failure("Security database sync", db.sync());
            }
        }

        info!("Pairing completed on connection {}", connection);
        self.handler
            .pairing_result(connection, SecurityCompletionStatus::Success);
    }

    fn on_valid_mic_timeout(&mut self, connection: ConnectionHandle) {
        self.handler.valid_mic_timeout(connection);
    }

    fn on_slave_security_request(
        &mut self,
        connection: ConnectionHandle,
        authentication: AuthenticationMask,
    ) {
        let Ok(cb) = self.block(connection) else {
            warn!("Security request on unknown connection {}", connection);
            return;
        };
        let flags = self.entry_flags(&cb);

        let mut pairing_required = authentication.secure_connections()
            && !flags.secure_connections_paired
            && self.default_authentication.secure_connections();
        if authentication.mitm() && !flags.ltk_mitm_protected {
            pairing_required = true;
            if let Some(cb) = self.control_blocks.get_mut(connection) {
                cb.mitm_requested = true;
            }
        }

        if pairing_required {
            log_failure("Pairing request", self.request_pairing(connection));
        } else if !cb.encryption_requested {
            log_failure("Encryption", self.enable_encryption(connection));
        }
    }

    fn on_link_encryption_result(&mut self, connection: ConnectionHandle, result: LinkEncryption) {
        let Some(cb) = self.control_blocks.get_mut(connection) else {
            warn!("Encryption result on unknown connection {}", connection);
            return;
        };
        match result {
            LinkEncryption::Encrypted
            | LinkEncryption::EncryptedWithMitm
            | LinkEncryption::EncryptedWithScAndMitm => {
                cb.encryption_requested = false;
                cb.encryption_failed = false;
                cb.encrypted = true;
                cb.encryption_level = result;
                if result != LinkEncryption::Encrypted {
                    cb.authenticated = true;
                }
                let entry = cb.db_entry;
                if let (Some(entry), Ok(key_size)) =
                    (entry, self.pal.get_encryption_key_size(connection))
                {
                    self.with_flags(entry, |flags| flags.encryption_key_size = key_size);
                }
            }
            LinkEncryption::NotEncrypted
                if cb.encryption_requested && !cb.encryption_failed && cb.is_master =>
            {
                // The peer may have lost its bond, pair once more before giving up
                cb.encryption_failed = true;
                match self.request_pairing(connection) {
                    Ok(()) => {
                        info!("Encryption failed on connection {}, pairing again", connection);
                        return;
                    }
                    Err(err) => {
                        warn!("Cannot pair again on connection {}: {}", connection, err);
                        if let Some(cb) = self.control_blocks.get_mut(connection) {
                            cb.encryption_requested = false;
                            cb.encryption_failed = false;
                        }
                    }
                }
            }
            LinkEncryption::NotEncrypted => {
                cb.encryption_requested = false;
                cb.encryption_failed = false;
                cb.encrypted = false;
                cb.encryption_level = LinkEncryption::NotEncrypted;
            }
            LinkEncryption::EncryptionInProgress => {}
        }
        self.handler.link_encryption_result(connection, result);
    }

    fn on_link_encryption_request_timed_out(&mut self, connection: ConnectionHandle) {
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.encryption_requested = false;
            cb.encryption_failed = false;
        }
        self.handler
            .link_encryption_result(connection, LinkEncryption::NotEncrypted);
    }

    fn on_passkey_display(&mut self, connection: ConnectionHandle, passkey: Passkey) {
        self.set_mitm_performed(connection, true);
        self.handler.passkey_display(connection, passkey);
    }

    fn on_keypress_notification(&mut self, connection: ConnectionHandle, keypress: Keypress) {
        self.set_mitm_performed(connection, true);
        self.handler.keypress_notification(connection, keypress);
    }

    fn on_passkey_request(&mut self, connection: ConnectionHandle) {
        self.set_mitm_performed(connection, true);
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.pending_input = Some(MitmInput::Passkey);
        }
        self.handler.passkey_request(connection);
    }

    fn on_confirmation_request(&mut self, connection: ConnectionHandle) {
        self.set_mitm_performed(connection, true);
        if let Some(cb) = self.control_blocks.get_mut(connection) {
            cb.pending_input = Some(MitmInput::Confirmation);
        }
        self.handler.confirmation_request(connection);
    }

    fn on_secure_connections_oob_request(&mut self, connection: ConnectionHandle) {
        let Ok(cb) = self.block(connection) else {
            warn!("OOB request on unknown connection {}", connection);
            return;
        };
        let peer_address = self.entry_flags(&cb).peer_address;
        let result = match self.oob.take_peer(&peer_address) {
            Some(peer) => {
                self.set_mitm_performed(connection, cb.oob_mitm_protection);
                let local_random = self.oob.local_random();
                self.pal.secure_connections_oob_request_reply(
                    connection,
                    &local_random,
                    &peer.random,
                    &peer.confirm,
                )
            }
            None => {
                info!("No OOB data for connection {}", connection);
                self.pal
                    .cancel_pairing(connection, PairingFailure::OobNotAvailable)
            }
        };
        log_failure("OOB reply", result);
    }

    fn on_legacy_pairing_oob_request(&mut self, connection: ConnectionHandle) {
        let Ok(cb) = self.block(connection) else {
            warn!("OOB request on unknown connection {}", connection);
            return;
        };
        let peer_address = self.entry_flags(&cb).peer_address;
        match self.oob.take_legacy_tk(&peer_address, &cb.local_address) {
            Some(tk) => {
                self.set_mitm_performed(connection, cb.oob_mitm_protection);
                log_failure(
                    "OOB reply",
                    self.pal.legacy_pairing_oob_request_reply(connection, &tk),
                );
            }
            None if !cb.legacy_pairing_oob_request_pending => {
                if let Some(cb) = self.control_blocks.get_mut(connection) {
                    cb.legacy_pairing_oob_request_pending = true;
                }
                self.handler.legacy_pairing_oob_request(connection);
            }
            None => {}
        }
    }

    fn on_secure_connections_oob_generated(&mut self, random: OobLescValue, confirm: OobConfirm) {
        self.oob.local = LocalOob::Ready(random);
        let address = self.oob.local_address;
        self.handler.oob_generated(&address, &random, &confirm);
    }

    fn on_secure_connections_ltk_generated(&mut self, connection: ConnectionHandle, ltk: Ltk) {
        let Some((cb, entry)) = self.keys_entry(connection) else {
            return;
        };
        self.with_flags(entry, |flags| {
            flags.ltk_mitm_protected = cb.mitm_performed;
            flags.secure_connections_paired = true;
        });
        if let Some(db) = self.db.as_mut() {
            db.set_entry_peer_ltk(entry, &ltk);
            db.set_entry_local_ltk(entry, &ltk);
        }
    }

    fn on_keys_distributed_ltk(&mut self, connection: ConnectionHandle, ltk: Ltk) {
        let Some((cb, entry)) = self.keys_entry(connection) else {
            return;
        };
        self.with_flags(entry, |flags| flags.ltk_mitm_protected = cb.mitm_performed);
        if let Some(db) = self.db.as_mut() {
            db.set_entry_peer_ltk(entry, &ltk);
        }
    }

    fn on_keys_distributed_ediv_rand(&mut self, connection: ConnectionHandle, ediv: Ediv, rand: Rand) {
        if let (Some((_, entry)), Some(db)) = (self.keys_entry(connection), self.db.as_mut()) {
            db.set_entry_peer_ediv_rand(entry, &ediv, &rand);
        }
    }

    fn on_keys_distributed_local_ltk(&mut self, connection: ConnectionHandle, ltk: Ltk) {
        let Some((cb, entry)) = self.keys_entry(connection) else {
            return;
        };
        self.with_flags(entry, |flags| flags.ltk_mitm_protected = cb.mitm_performed);
        if let Some(db) = self.db.as_mut() {
            db.set_entry_local_ltk(entry, &ltk);
        }
    }

    fn on_keys_distributed_local_ediv_rand(
        &mut self,
        connection: ConnectionHandle,
        ediv: Ediv,
        rand: Rand,
    ) {
        if let (Some((_, entry)), Some(db)) = (self.keys_entry(connection), self.db.as_mut()) {
            db.set_entry_local_ediv_rand(entry, &ediv, &rand);
        }
    }

    fn on_keys_distributed_irk(&mut self, connection: ConnectionHandle, irk: Irk) {
        if let (Some((_, entry)), Some(db)) = (self.keys_entry(connection), self.db.as_mut()) {
            db.set_entry_peer_irk(entry, &irk);
        }
    }

    fn on_keys_distributed_bdaddr(
        &mut self,
        connection: ConnectionHandle,
        peer_address_type: AddressType,
        peer_identity_address: BdAddr,
    ) {
        if let (Some((_, entry)), Some(db)) = (self.keys_entry(connection), self.db.as_mut()) {
            db.set_entry_peer_bdaddr(entry, peer_address_type.is_public(), &peer_identity_address);
        }
    }

    fn on_keys_distributed_csrk(&mut self, connection: ConnectionHandle, csrk: Csrk) {
        let Some((cb, entry)) = self.keys_entry(connection) else {
            return;
        };
        self.with_flags(entry, |flags| flags.csrk_mitm_protected = cb.mitm_performed);
        if let Some(db) = self.db.as_mut() {
            db.set_entry_peer_csrk(entry, &csrk);
        }
        self.handler
            .signing_key(connection, &csrk, cb.mitm_performed);
    }

    fn on_ltk_request(&mut self, connection: ConnectionHandle, request: LtkRequest) {
        let entry = self
            .control_blocks
            .get(connection)
            .and_then(|cb| cb.db_entry);
        let (Some(entry), Some(db)) = (entry, self.db.as_mut()) else {
            debug!("No bond for LTK request on connection {}", connection);
            log_failure("LTK reply", self.pal.set_ltk_not_found(connection));
            return;
        };
        let query = match request {
            LtkRequest::Legacy { ediv, rand } => db.get_entry_local_keys(entry, &ediv, &rand),
            LtkRequest::SecureConnections => db.get_entry_local_keys_secure_connections(entry),
        };
        self.pending.insert(query, DbContinuation::SetLtk);
    }
}

impl<P: PalSecurityManager> PalConnectionMonitorEventHandler for SecurityManager<P> {
    fn on_connected(
        &mut self,
        connection: ConnectionHandle,
        role: ConnectionRole,
        peer_address_type: AddressType,
        peer_address: BdAddr,
        _local_address_type: AddressType,
        local_address: BdAddr,
    ) -> SmResult<()> {
        let Some(db) = self.db.as_mut() else {
            return Err(SmError::NotInitialized);
        };
        if self.control_blocks.get(connection).is_some() {
            return Err(SmError::InvalidState(format!(
                "connection {} already tracked",
                connection
            )));
        }
        let cb = self.control_blocks.acquire(connection).ok_or_else(|| {
            SmError::NoResources(format!("no control block for connection {}", connection))
        })?;
        cb.local_address = local_address;
        cb.is_master = role == ConnectionRole::Master;

        cb.db_entry = db.open_entry(peer_address_type, peer_address);
        match cb.db_entry {
            Some(entry) => cb.entry_preexisting = db.entry_state(entry) == Some(EntryState::Written),
            None => warn!(
                "Connection {} to {} proceeds without bonding",
                connection, peer_address
            ),
        }
        let cb = *cb;
        info!(
            "Connection {} to {} as {:?}, bonded: {}",
            connection, peer_address, role, cb.entry_preexisting
        );

        let flags = self.entry_flags(&cb);
        if let Some(entry) = cb.db_entry {
            if cb.signing(self.default_signing()) && flags.csrk_stored {
                let query = self.db_mut()?.get_entry_peer_csrk(entry);
                self.pending.insert(query, DbContinuation::SetPeerCsrk);
            }
        }
        Ok(())
    }

    fn on_disconnected(&mut self, connection: ConnectionHandle, reason: u8) {
        let Some(cb) = self.control_blocks.release(connection) else {
            debug!("Disconnect of untracked connection {}", connection);
            return;
        };
        log_failure("PAL connection release", self.pal.release_connection(connection));

        if let (Some(entry), Some(db)) = (cb.db_entry, self.db.as_mut()) {
            if self.default_authentication.bondable() || cb.entry_preexisting {
                db.close_entry(entry, true);
            } else {
                db.discard_entry(entry);
            }
        }
        info!("Connection {} closed, reason 0x{:02x}", connection, reason);
    }
}

impl<P: PalSecurityManager> PalSigningMonitorEventHandler for SecurityManager<P> {
    fn on_signed_write_received(&mut self, connection: ConnectionHandle, sign_counter: u32) {
        let Some(cb) = self.control_blocks.get_mut(connection) else {
            return;
        };
        cb.csrk_failures = 0;
        if let (Some(entry), Some(db)) = (cb.db_entry, self.db.as_mut()) {
            db.set_entry_peer_sign_counter(entry, sign_counter);
        }
    }

    fn on_signed_write_verification_failure(&mut self, connection: ConnectionHandle) {
        let default_signing = self.default_signing();
        let Some(cb) = self.control_blocks.get_mut(connection) else {
            return;
        };
        if !cb.signing(default_signing) {
            return;
        }
        cb.csrk_failures += 1;
        if cb.csrk_failures < MAX_CSRK_FAILURES {
            return;
        }
        cb.csrk_failures = 0;
        warn!("Repeated signature failures on connection {}, refreshing keys", connection);
        log_failure("Key refresh", self.pair_or_request(connection));
    }

    fn on_signed_write(&mut self) {
        if let Some(db) = self.db.as_mut() {
            let counter = db.local_sign_counter().wrapping_add(1);
            db.set_local_sign_counter(counter);
            // The counter must never go backwards across restarts
            log_failure("Security database sync", db.sync());
        }
    }
}
