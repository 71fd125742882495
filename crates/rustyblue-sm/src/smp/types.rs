//! Type definitions for the Security Manager
use super::constants::*;
use super::keys::{Ediv, Rand};
use crate::error::{SmError, SmResult};
use bitflags::bitflags;
use std::fmt;

/// IO Capability types for pairing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IoCapability {
    /// Display only capability
    DisplayOnly,
    /// Display with yes/no capability
    DisplayYesNo,
    /// Keyboard only
    KeyboardOnly,
    /// No input, no output
    #[default]
    NoInputNoOutput,
    /// Both keyboard and display
    KeyboardDisplay,
}

impl IoCapability {
    /// Convert to u8 value for protocol
    pub fn to_u8(&self) -> u8 {
        match self {
            IoCapability::DisplayOnly => SMP_IO_CAPABILITY_DISPLAY_ONLY,
            IoCapability::DisplayYesNo => SMP_IO_CAPABILITY_DISPLAY_YES_NO,
            IoCapability::KeyboardOnly => SMP_IO_CAPABILITY_KEYBOARD_ONLY,
            IoCapability::NoInputNoOutput => SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT,
            IoCapability::KeyboardDisplay => SMP_IO_CAPABILITY_KEYBOARD_DISPLAY,
        }
    }

    /// Convert from u8 value from protocol
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_IO_CAPABILITY_DISPLAY_ONLY => Some(IoCapability::DisplayOnly),
            SMP_IO_CAPABILITY_DISPLAY_YES_NO => Some(IoCapability::DisplayYesNo),
            SMP_IO_CAPABILITY_KEYBOARD_ONLY => Some(IoCapability::KeyboardOnly),
            SMP_IO_CAPABILITY_NO_INPUT_NO_OUTPUT => Some(IoCapability::NoInputNoOutput),
            SMP_IO_CAPABILITY_KEYBOARD_DISPLAY => Some(IoCapability::KeyboardDisplay),
            _ => None,
        }
    }
}

impl fmt::Display for IoCapability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoCapability::DisplayOnly => write!(f, "Display Only"),
            IoCapability::DisplayYesNo => write!(f, "Display Yes/No"),
            IoCapability::KeyboardOnly => write!(f, "Keyboard Only"),
            IoCapability::NoInputNoOutput => write!(f, "No Input No Output"),
            IoCapability::KeyboardDisplay => write!(f, "Keyboard Display"),
        }
    }
}

bitflags! {
    /// AuthReq field of the pairing request and response
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct AuthenticationMask: u8 {
        const BONDING = SMP_AUTH_REQ_BONDING;
        const MITM = SMP_AUTH_REQ_MITM;
        const SECURE_CONNECTIONS = SMP_AUTH_REQ_SC;
        const KEYPRESS_NOTIFICATION = SMP_AUTH_REQ_KEYPRESS;
        const CT2 = SMP_AUTH_REQ_CT2;
    }
}

impl AuthenticationMask {
    pub fn bondable(&self) -> bool {
        self.contains(Self::BONDING)
    }

    pub fn mitm(&self) -> bool {
        self.contains(Self::MITM)
    }

    pub fn secure_connections(&self) -> bool {
        self.contains(Self::SECURE_CONNECTIONS)
    }

    pub fn keypress_notification(&self) -> bool {
        self.contains(Self::KEYPRESS_NOTIFICATION)
    }
}

bitflags! {
    /// Key distribution field of the pairing request and response
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct KeyDistribution: u8 {
        const ENCRYPTION = SMP_KEY_DIST_ENC_KEY;
        const IDENTITY = SMP_KEY_DIST_ID_KEY;
        const SIGNING = SMP_KEY_DIST_SIGN_KEY;
        const LINK = SMP_KEY_DIST_LINK_KEY;
    }
}

impl KeyDistribution {
    /// Decode a received mask; reserved upper bits are dropped
    pub fn from_u8(value: u8) -> Self {
        Self::from_bits_truncate(value)
    }

    pub fn to_u8(&self) -> u8 {
        self.bits()
    }
}

/// Reason carried by a pairing failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PairingFailure {
    PasskeyEntryFailed,
    OobNotAvailable,
    AuthenticationRequirements,
    ConfirmValueFailed,
    PairingNotSupported,
    EncryptionKeySize,
    CommandNotSupported,
    UnspecifiedReason,
    RepeatedAttempts,
    InvalidParameters,
    DhKeyCheckFailed,
    NumericComparisonFailed,
    BrEdrPairingInProgress,
    CrossTransportKeyNotAllowed,
}

impl TryFrom<u8> for PairingFailure {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            SMP_REASON_PASSKEY_ENTRY_FAILED => PairingFailure::PasskeyEntryFailed,
            SMP_REASON_OOB_NOT_AVAILABLE => PairingFailure::OobNotAvailable,
            SMP_REASON_AUTHENTICATION_REQUIREMENTS => PairingFailure::AuthenticationRequirements,
            SMP_REASON_CONFIRM_VALUE_FAILED => PairingFailure::ConfirmValueFailed,
            SMP_REASON_PAIRING_NOT_SUPPORTED => PairingFailure::PairingNotSupported,
            SMP_REASON_ENCRYPTION_KEY_SIZE => PairingFailure::EncryptionKeySize,
            SMP_REASON_COMMAND_NOT_SUPPORTED => PairingFailure::CommandNotSupported,
            SMP_REASON_UNSPECIFIED_REASON => PairingFailure::UnspecifiedReason,
            SMP_REASON_REPEATED_ATTEMPTS => PairingFailure::RepeatedAttempts,
            SMP_REASON_INVALID_PARAMETERS => PairingFailure::InvalidParameters,
            SMP_REASON_DHKEY_CHECK_FAILED => PairingFailure::DhKeyCheckFailed,
            SMP_REASON_NUMERIC_COMPARISON_FAILED => PairingFailure::NumericComparisonFailed,
            SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS => PairingFailure::BrEdrPairingInProgress,
            SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED => {
                PairingFailure::CrossTransportKeyNotAllowed
            }
            other => return Err(other),
        })
    }
}

impl From<PairingFailure> for u8 {
    fn from(value: PairingFailure) -> Self {
        match value {
            PairingFailure::PasskeyEntryFailed => SMP_REASON_PASSKEY_ENTRY_FAILED,
            PairingFailure::OobNotAvailable => SMP_REASON_OOB_NOT_AVAILABLE,
            PairingFailure::AuthenticationRequirements => SMP_REASON_AUTHENTICATION_REQUIREMENTS,
            PairingFailure::ConfirmValueFailed => SMP_REASON_CONFIRM_VALUE_FAILED,
            PairingFailure::PairingNotSupported => SMP_REASON_PAIRING_NOT_SUPPORTED,
            PairingFailure::EncryptionKeySize => SMP_REASON_ENCRYPTION_KEY_SIZE,
            PairingFailure::CommandNotSupported => SMP_REASON_COMMAND_NOT_SUPPORTED,
            PairingFailure::UnspecifiedReason => SMP_REASON_UNSPECIFIED_REASON,
            PairingFailure::RepeatedAttempts => SMP_REASON_REPEATED_ATTEMPTS,
            PairingFailure::InvalidParameters => SMP_REASON_INVALID_PARAMETERS,
            PairingFailure::DhKeyCheckFailed => SMP_REASON_DHKEY_CHECK_FAILED,
            PairingFailure::NumericComparisonFailed => SMP_REASON_NUMERIC_COMPARISON_FAILED,
            PairingFailure::BrEdrPairingInProgress => SMP_REASON_BR_EDR_PAIRING_IN_PROGRESS,
            PairingFailure::CrossTransportKeyNotAllowed => {
                SMP_REASON_CROSS_TRANSPORT_KEY_NOT_ALLOWED
            }
        }
    }
}

impl fmt::Display for PairingFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PairingFailure::PasskeyEntryFailed => "passkey entry failed",
            PairingFailure::OobNotAvailable => "OOB data not available",
            PairingFailure::AuthenticationRequirements => "authentication requirements not met",
            PairingFailure::ConfirmValueFailed => "confirm value failed",
            PairingFailure::PairingNotSupported => "pairing not supported",
            PairingFailure::EncryptionKeySize => "encryption key size",
            PairingFailure::CommandNotSupported => "command not supported",
            PairingFailure::UnspecifiedReason => "unspecified reason",
            PairingFailure::RepeatedAttempts => "repeated attempts",
            PairingFailure::InvalidParameters => "invalid parameters",
            PairingFailure::DhKeyCheckFailed => "DHKey check failed",
            PairingFailure::NumericComparisonFailed => "numeric comparison failed",
            PairingFailure::BrEdrPairingInProgress => "BR/EDR pairing in progress",
            PairingFailure::CrossTransportKeyNotAllowed => "cross-transport key not allowed",
        };
        f.write_str(text)
    }
}

/// Encryption state of a link as seen by the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEncryption {
    NotEncrypted,
    EncryptionInProgress,
    Encrypted,
    EncryptedWithMitm,
    EncryptedWithScAndMitm,
}

impl LinkEncryption {
    /// Position on the escalation ladder; `None` for the transient in-progress state
    pub fn rank(&self) -> Option<u8> {
        match self {
            LinkEncryption::NotEncrypted => Some(0),
            LinkEncryption::EncryptionInProgress => None,
            LinkEncryption::Encrypted => Some(1),
            LinkEncryption::EncryptedWithMitm => Some(2),
            LinkEncryption::EncryptedWithScAndMitm => Some(3),
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(
            self,
            LinkEncryption::Encrypted
                | LinkEncryption::EncryptedWithMitm
                | LinkEncryption::EncryptedWithScAndMitm
        )
    }
}

impl fmt::Display for LinkEncryption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkEncryption::NotEncrypted => write!(f, "not encrypted"),
            LinkEncryption::EncryptionInProgress => write!(f, "encryption in progress"),
            LinkEncryption::Encrypted => write!(f, "encrypted"),
            LinkEncryption::EncryptedWithMitm => write!(f, "encrypted with MITM"),
            LinkEncryption::EncryptedWithScAndMitm => write!(f, "encrypted with SC and MITM"),
        }
    }
}

/// Controller security level used when starting encryption or answering an LTK request
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SecurityLevel {
    None,
    Encryption,
    AuthenticatedEncryption,
    SecureConnections,
}

impl SecurityLevel {
    /// Level for a key obtained with the given pairing properties.
    ///
    /// Secure Connections only raises the level when MITM protection was
    /// also performed.
    pub fn for_key(mitm: bool, secure_connections: bool) -> Self {
        match (mitm, secure_connections) {
            (false, _) => SecurityLevel::Encryption,
            (true, false) => SecurityLevel::AuthenticatedEncryption,
            (true, true) => SecurityLevel::SecureConnections,
        }
    }

    pub fn to_u8(&self) -> u8 {
        match self {
            SecurityLevel::None => 0,
            SecurityLevel::Encryption => 1,
            SecurityLevel::AuthenticatedEncryption => 2,
            SecurityLevel::SecureConnections => 3,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(SecurityLevel::None),
            1 => Some(SecurityLevel::Encryption),
            2 => Some(SecurityLevel::AuthenticatedEncryption),
            3 => Some(SecurityLevel::SecureConnections),
            _ => None,
        }
    }

    /// Link encryption reached once the controller runs at this level
    pub fn link_encryption(&self) -> LinkEncryption {
        match self {
            SecurityLevel::None => LinkEncryption::NotEncrypted,
            SecurityLevel::Encryption => LinkEncryption::Encrypted,
            SecurityLevel::AuthenticatedEncryption => LinkEncryption::EncryptedWithMitm,
            SecurityLevel::SecureConnections => LinkEncryption::EncryptedWithScAndMitm,
        }
    }
}

/// Combined encryption and signing requirement for a link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityMode {
    NoAccess,
    EncryptionOpenLink,
    EncryptionNoMitm,
    EncryptionWithMitm,
    SignedNoMitm,
    SignedWithMitm,
}

/// Outcome of a pairing procedure as reported to the application
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SecurityCompletionStatus {
    Success,
    Timeout,
    Failure(PairingFailure),
}

impl SecurityCompletionStatus {
    pub fn to_u8(&self) -> u8 {
        match self {
            SecurityCompletionStatus::Success => SEC_STATUS_SUCCESS,
            SecurityCompletionStatus::Timeout => SEC_STATUS_TIMEOUT,
            SecurityCompletionStatus::Failure(reason) => SEC_STATUS_FAILURE_MASK | u8::from(*reason),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, SecurityCompletionStatus::Success)
    }
}

/// Keypress notification types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Keypress {
    EntryStarted,
    DigitEntered,
    DigitErased,
    Cleared,
    EntryCompleted,
}

impl Keypress {
    pub fn to_u8(&self) -> u8 {
        match self {
            Keypress::EntryStarted => SMP_KEYPRESS_ENTRY_STARTED,
            Keypress::DigitEntered => SMP_KEYPRESS_DIGIT_ENTERED,
            Keypress::DigitErased => SMP_KEYPRESS_DIGIT_ERASED,
            Keypress::Cleared => SMP_KEYPRESS_CLEARED,
            Keypress::EntryCompleted => SMP_KEYPRESS_ENTRY_COMPLETED,
        }
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            SMP_KEYPRESS_ENTRY_STARTED => Some(Keypress::EntryStarted),
            SMP_KEYPRESS_DIGIT_ENTERED => Some(Keypress::DigitEntered),
            SMP_KEYPRESS_DIGIT_ERASED => Some(Keypress::DigitErased),
            SMP_KEYPRESS_CLEARED => Some(Keypress::Cleared),
            SMP_KEYPRESS_ENTRY_COMPLETED => Some(Keypress::EntryCompleted),
            _ => None,
        }
    }
}

/// Six digit passkey held as ASCII digits, most significant digit first
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Passkey([u8; PASSKEY_DIGITS]);

impl Passkey {
    /// Build a passkey from its numeric value. Values above 999999 are rejected.
    pub fn from_number(value: u32) -> SmResult<Self> {
        if value > PASSKEY_MAX {
            return Err(SmError::InvalidParameter(format!(
                "passkey {value} has more than {PASSKEY_DIGITS} digits"
            )));
        }
        let mut digits = [b'0'; PASSKEY_DIGITS];
        let mut remaining = value;
        for digit in digits.iter_mut().rev() {
            *digit = b'0' + (remaining % 10) as u8;
            remaining /= 10;
        }
        Ok(Self(digits))
    }

    pub fn to_number(&self) -> u32 {
        self.0
            .iter()
            .fold(0u32, |acc, digit| acc * 10 + u32::from(digit - b'0'))
    }

    pub fn as_ascii(&self) -> &[u8; PASSKEY_DIGITS] {
        &self.0
    }
}

impl TryFrom<&str> for Passkey {
    type Error = SmError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        let bytes = value.as_bytes();
        if bytes.len() != PASSKEY_DIGITS || !bytes.iter().all(u8::is_ascii_digit) {
            return Err(SmError::InvalidParameter(format!(
                "passkey must be {PASSKEY_DIGITS} ASCII digits"
            )));
        }
        let mut digits = [0u8; PASSKEY_DIGITS];
        digits.copy_from_slice(bytes);
        Ok(Self(digits))
    }
}

impl fmt::Display for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for digit in self.0 {
            write!(f, "{}", digit as char)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Passkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Passkey({self})")
    }
}

/// Informal per-connection pairing state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PairingState {
    #[default]
    Idle,
    Requested,
    InProgress,
    Paired,
    Failed,
    TimedOut,
}

/// Long term key request raised by the controller when the peer starts encryption
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LtkRequest {
    /// Legacy pairing key, identified by the EDIV and RAND it was distributed with
    Legacy { ediv: Ediv, rand: Rand },
    /// Secure Connections key, identified by the link alone
    SecureConnections,
}

/// Check encryption key size bounds
pub fn validate_key_size_range(min: u8, max: u8) -> SmResult<()> {
    if min < SMP_MIN_ENCRYPTION_KEY_SIZE || max > SMP_MAX_ENCRYPTION_KEY_SIZE || min > max {
        return Err(SmError::InvalidParameter(format!(
            "encryption key size range {min}..={max} outside \
             {SMP_MIN_ENCRYPTION_KEY_SIZE}..={SMP_MAX_ENCRYPTION_KEY_SIZE}"
        )));
    }
    Ok(())
}
