//! Tests for the Security Manager protocol types

use super::constants::*;
use super::*;

#[test]
fn test_pairing_failure_codes() {
    for code in 0x01..=0x0Eu8 {
        let reason = PairingFailure::try_from(code).unwrap();
        assert_eq!(u8::from(reason), code);
    }
    assert_eq!(PairingFailure::try_from(0x00), Err(0x00));
    assert_eq!(PairingFailure::try_from(0x0F), Err(0x0F));
    assert_eq!(
        PairingFailure::try_from(SMP_REASON_DHKEY_CHECK_FAILED),
        Ok(PairingFailure::DhKeyCheckFailed)
    );
}

#[test]
fn test_key_size_bounds() {
    for min in 0..=20u8 {
        for max in 0..=20u8 {
            let valid = (7..=16).contains(&min) && (7..=16).contains(&max) && min <= max;
            assert_eq!(
                validate_key_size_range(min, max).is_ok(),
                valid,
                "min {min} max {max}"
            );
        }
    }
}

#[test]
fn test_security_level_table() {
    assert_eq!(SecurityLevel::for_key(false, false), SecurityLevel::Encryption);
    assert_eq!(SecurityLevel::for_key(false, true), SecurityLevel::Encryption);
    assert_eq!(
        SecurityLevel::for_key(true, false),
        SecurityLevel::AuthenticatedEncryption
    );
    assert_eq!(SecurityLevel::for_key(true, true), SecurityLevel::SecureConnections);
    assert_eq!(
        SecurityLevel::SecureConnections.link_encryption(),
        LinkEncryption::EncryptedWithScAndMitm
    );
}

#[test]
fn test_authentication_mask_bits() {
    let mask = AuthenticationMask::BONDING
        | AuthenticationMask::MITM
        | AuthenticationMask::SECURE_CONNECTIONS
        | AuthenticationMask::KEYPRESS_NOTIFICATION;
    assert_eq!(mask.bits(), 0x1D);
    assert!(mask.bondable());
    assert!(mask.mitm());
    assert!(!AuthenticationMask::from_bits_truncate(0x01).mitm());
    assert_eq!(AuthenticationMask::CT2.bits(), 0x20);
}

#[test]
fn test_key_distribution_truncates_reserved_bits() {
    let dist = KeyDistribution::from_u8(0xFF);
    assert_eq!(dist, KeyDistribution::all());
    assert_eq!(dist.to_u8(), 0x0F);
    assert_eq!(KeyDistribution::SIGNING.to_u8(), SMP_KEY_DIST_SIGN_KEY);
}

#[test]
fn test_completion_status_codes() {
    assert_eq!(SecurityCompletionStatus::Success.to_u8(), 0x00);
    assert_eq!(SecurityCompletionStatus::Timeout.to_u8(), 0x01);
    assert_eq!(
        SecurityCompletionStatus::Failure(PairingFailure::UnspecifiedReason).to_u8(),
        0x88
    );
}

#[test]
fn test_passkey_conversions() {
    let passkey = Passkey::from_number(12345).unwrap();
    assert_eq!(passkey.as_ascii(), b"012345");
    assert_eq!(passkey.to_number(), 12345);
    assert_eq!(passkey.to_string(), "012345");

    let typed = Passkey::try_from("987654").unwrap();
    assert_eq!(typed.to_number(), 987654);

    assert!(Passkey::from_number(1_000_000).is_err());
    assert!(Passkey::try_from("12345").is_err());
    assert!(Passkey::try_from("12a456").is_err());
}

#[test]
fn test_link_encryption_rank() {
    assert!(LinkEncryption::Encrypted.rank() < LinkEncryption::EncryptedWithMitm.rank());
    assert_eq!(LinkEncryption::EncryptionInProgress.rank(), None);
    assert!(!LinkEncryption::NotEncrypted.is_encrypted());
    assert!(LinkEncryption::EncryptedWithScAndMitm.is_encrypted());
}

#[test]
fn test_io_capability_round_trip() {
    assert_eq!(IoCapability::from_u8(0x04), Some(IoCapability::KeyboardDisplay));
    assert_eq!(IoCapability::from_u8(0x05), None);
    assert_eq!(IoCapability::DisplayYesNo.to_u8(), 0x01);
    assert_eq!(Keypress::from_u8(0x03), Some(Keypress::Cleared));
}
