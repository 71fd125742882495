//! Tests for the PAL controller codec and adapter

use super::constants::*;
use super::*;
use crate::error::SmError;
use crate::smp::{LinkEncryption, LtkRequest, Passkey, PublicKey, PublicKeyCoord};

type TestPal = ControllerSecurityManager<Vec<ControllerCommand>>;

fn test_pal() -> TestPal {
    ControllerSecurityManager::new(Vec::new(), BdAddr::new([1, 2, 3, 4, 5, 6]), true)
}

fn drain(pal: &mut TestPal) -> Vec<PalEvent> {
    std::iter::from_fn(|| pal.poll_event()).collect()
}

#[test]
fn test_command_packet_encoding() {
    let cmd = ControllerCommand::PairRequest {
        handle: 0x0040,
        oob: false,
        auth: 0x05,
        initiator_dist: 0x03,
        responder_dist: 0x07,
    };
    assert_eq!(cmd.opcode_parts(), (OGF_VENDOR, OCF_SEC_PAIR_REQUEST));
    assert_eq!(
        cmd.to_packet(),
        vec![HCI_COMMAND_PKT, 0x01, 0xFC, 6, 0x40, 0x00, 0x00, 0x05, 0x03, 0x07]
    );

    let cmd = ControllerCommand::ClearResolvingList;
    assert_eq!(cmd.to_packet(), vec![HCI_COMMAND_PKT, 0x16, 0xFC, 0]);

    let cmd = ControllerCommand::AuthResponse {
        handle: 0x0001,
        data: vec![0x40, 0xE2, 0x01],
    };
    assert_eq!(
        cmd.to_packet(),
        vec![HCI_COMMAND_PKT, 0x07, 0xFC, 6, 0x01, 0x00, 3, 0x40, 0xE2, 0x01]
    );
}

#[test]
fn test_packet_writer() {
    let mut writer = PacketWriter(Vec::new());
    writer
        .send_command(ControllerCommand::GenerateEccKey)
        .unwrap();
    assert_eq!(writer.0, vec![HCI_COMMAND_PKT, 0x0F, 0xFC, 0]);
}

#[test]
fn test_event_parsing() {
    let data = [EVT_VENDOR, 4, EVT_SEC_PAIR_FAIL, 0x40, 0x00, 0x03];
    assert_eq!(
        ControllerEvent::parse(&data),
        Some(ControllerEvent::PairFail {
            handle: 0x0040,
            status: 0x03
        })
    );

    let mut data = vec![EVT_VENDOR, 31, EVT_SEC_KEY_IND, 0x01, 0x00, KEY_TYPE_PEER_LTK, 1];
    data.extend_from_slice(&[0xAA; 16]);
    data.extend_from_slice(&[0x34, 0x12]);
    data.extend_from_slice(&[0x55; 8]);
    assert_eq!(
        ControllerEvent::parse(&data),
        Some(ControllerEvent::KeyInd {
            handle: 1,
            level: 1,
            key: DistributedKey::PeerLtk {
                ltk: Ltk::new([0xAA; 16]),
                ediv: Ediv::from_u16(0x1234),
                rand: Rand::new([0x55; 8]),
            },
        })
    );
}

#[test]
fn test_controller_wide_events_ignore_handle_slot() {
    for placeholder in [[0x00, 0x00], [0xFF, 0xFF]] {
        let mut data = vec![EVT_VENDOR, 67, EVT_SEC_ECC_KEY];
        data.extend_from_slice(&placeholder);
        data.extend_from_slice(&[0x11; 32]);
        data.extend_from_slice(&[0x22; 32]);
        assert_eq!(
            ControllerEvent::parse(&data),
            Some(ControllerEvent::EccKey {
                key: PublicKey {
                    x: PublicKeyCoord::new([0x11; 32]),
                    y: PublicKeyCoord::new([0x22; 32]),
                },
            })
        );

        let mut data = vec![EVT_VENDOR, 35, EVT_SEC_OOB_CALCULATED];
        data.extend_from_slice(&placeholder);
        data.extend_from_slice(&[0x33; 16]);
        data.extend_from_slice(&[0x44; 16]);
        assert_eq!(
            ControllerEvent::parse(&data),
            Some(ControllerEvent::OobCalculated {
                confirm: OobConfirm::new([0x33; 16]),
                random: OobLescValue::new([0x44; 16]),
            })
        );
    }

    // The slot is still required
    assert_eq!(
        ControllerEvent::parse(&[EVT_VENDOR, 1, EVT_SEC_ECC_KEY]),
        None
    );
}

#[test]
fn test_malformed_events_are_rejected() {
    // Wrong event code
    assert_eq!(ControllerEvent::parse(&[0x0E, 3, 0x01, 0x00, 0x00]), None);
    // Length exceeds the buffer
    assert_eq!(ControllerEvent::parse(&[EVT_VENDOR, 10, EVT_SEC_PAIR_FAIL, 0x00]), None);
    // Missing status byte
    assert_eq!(
        ControllerEvent::parse(&[EVT_VENDOR, 3, EVT_SEC_PAIR_FAIL, 0x00, 0x00]),
        None
    );
    // Unknown sub-event
    assert_eq!(ControllerEvent::parse(&[EVT_VENDOR, 3, 0x7F, 0x00, 0x00]), None);
    assert_eq!(ControllerEvent::parse(&[]), None);
}

#[test]
fn test_pairing_status_classification() {
    for status in 0..=255u8 {
        let expected = match status {
            0x01..=0x0E => PairingStatus::Failed(PairingFailure::try_from(status).unwrap()),
            PAIR_STATUS_TIMEOUT => PairingStatus::TimedOut,
            _ => PairingStatus::Failed(PairingFailure::UnspecifiedReason),
        };
        assert_eq!(classify_pairing_status(status), expected, "status {status:#04x}");
    }
    assert_eq!(
        classify_pairing_status(PAIR_STATUS_MEMORY),
        PairingStatus::Failed(PairingFailure::UnspecifiedReason)
    );
}

#[test]
fn test_pair_fail_translation() {
    let mut pal = test_pal();
    pal.handle_controller_event(ControllerEvent::PairFail {
        handle: 1,
        status: PAIR_STATUS_TIMEOUT,
    })
    .unwrap();
    pal.handle_controller_event(ControllerEvent::PairFail {
        handle: 1,
        status: 0x04,
    })
    .unwrap();
    assert_eq!(
        drain(&mut pal),
        vec![
            PalEvent::PairingTimedOut { connection: 1 },
            PalEvent::PairingError {
                connection: 1,
                error: PairingFailure::ConfirmValueFailed
            },
        ]
    );
}

#[test]
fn test_display_request_answers_with_static_passkey() {
    let mut pal = test_pal();
    pal.set_display_passkey(Some(123_456)).unwrap();
    pal.handle_controller_event(ControllerEvent::AuthRequest {
        handle: 3,
        oob: false,
        display: true,
        secure_connections: false,
    })
    .unwrap();

    assert_eq!(
        pal.transport(),
        &vec![ControllerCommand::AuthResponse {
            handle: 3,
            data: vec![0x40, 0xE2, 0x01],
        }]
    );
    assert_eq!(
        drain(&mut pal),
        vec![PalEvent::PasskeyDisplay {
            connection: 3,
            passkey: Passkey::from_number(123_456).unwrap(),
        }]
    );
}

#[test]
fn test_auth_request_routing() {
    let mut pal = test_pal();
    for (oob, display, sc) in [(true, false, true), (true, false, false), (false, false, false)] {
        pal.handle_controller_event(ControllerEvent::AuthRequest {
            handle: 1,
            oob,
            display,
            secure_connections: sc,
        })
        .unwrap();
    }
    assert_eq!(
        drain(&mut pal),
        vec![
            PalEvent::SecureConnectionsOobRequest { connection: 1 },
            PalEvent::LegacyPairingOobRequest { connection: 1 },
            PalEvent::PasskeyRequest { connection: 1 },
        ]
    );
    assert!(pal.transport().is_empty());
}

#[test]
fn test_ltk_request_variants() {
    let mut pal = test_pal();
    pal.handle_controller_event(ControllerEvent::LtkRequest {
        handle: 2,
        ediv: Ediv::default(),
        rand: Rand::default(),
    })
    .unwrap();
    pal.handle_controller_event(ControllerEvent::LtkRequest {
        handle: 2,
        ediv: Ediv::from_u16(7),
        rand: Rand::default(),
    })
    .unwrap();
    assert_eq!(
        drain(&mut pal),
        vec![
            PalEvent::LtkRequest {
                connection: 2,
                request: LtkRequest::SecureConnections,
            },
            PalEvent::LtkRequest {
                connection: 2,
                request: LtkRequest::Legacy {
                    ediv: Ediv::from_u16(7),
                    rand: Rand::default(),
                },
            },
        ]
    );
}

#[test]
fn test_encryption_events() {
    let mut pal = test_pal();
    assert!(matches!(
        pal.get_encryption_key_size(1),
        Err(SmError::InvalidState(_))
    ));

    pal.handle_controller_event(ControllerEvent::EncryptInd {
        handle: 1,
        level: 2,
        key_size: 16,
    })
    .unwrap();
    assert_eq!(pal.get_encryption_key_size(1), Ok(16));

    pal.handle_controller_event(ControllerEvent::EncryptFail {
        handle: 1,
        status: HCI_ERR_LL_RESPONSE_TIMEOUT,
    })
    .unwrap();
    pal.handle_controller_event(ControllerEvent::EncryptFail {
        handle: 1,
        status: 0x06,
    })
    .unwrap();

    assert_eq!(
        drain(&mut pal),
        vec![
            PalEvent::LinkEncryptionResult {
                connection: 1,
                result: LinkEncryption::EncryptedWithMitm,
            },
            PalEvent::LinkEncryptionRequestTimedOut { connection: 1 },
            PalEvent::LinkEncryptionResult {
                connection: 1,
                result: LinkEncryption::NotEncrypted,
            },
        ]
    );
}

#[test]
fn test_numeric_comparison() {
    let mut pal = test_pal();
    let mut confirm = [0u8; 16];
    confirm[..4].copy_from_slice(&1_234_567u32.to_le_bytes());
    pal.handle_controller_event(ControllerEvent::CompareInd { handle: 4, confirm })
        .unwrap();
    assert_eq!(
        drain(&mut pal),
        vec![
            PalEvent::PasskeyDisplay {
                connection: 4,
                passkey: Passkey::from_number(234_567).unwrap(),
            },
            PalEvent::ConfirmationRequest { connection: 4 },
        ]
    );
}

#[test]
fn test_identity_key_distribution() {
    let mut pal = test_pal();
    let address = BdAddr::new([6, 5, 4, 3, 2, 1]);
    pal.handle_controller_event(ControllerEvent::KeyInd {
        handle: 1,
        level: 1,
        key: DistributedKey::Irk {
            irk: Irk::new([9; 16]),
            address_type: 0,
            address,
        },
    })
    .unwrap();
    assert_eq!(
        drain(&mut pal),
        vec![
            PalEvent::KeysDistributedIrk {
                connection: 1,
                irk: Irk::new([9; 16]),
            },
            PalEvent::KeysDistributedBdaddr {
                connection: 1,
                peer_address_type: AddressType::PublicIdentity,
                peer_identity_address: address,
            },
        ]
    );
}

#[test]
fn test_secure_connections_ltk_indication() {
    let mut pal = test_pal();
    pal.handle_controller_event(ControllerEvent::KeyInd {
        handle: 1,
        level: 3,
        key: DistributedKey::LocalLtk {
            ltk: Ltk::new([7; 16]),
            ediv: Ediv::default(),
            rand: Rand::default(),
        },
    })
    .unwrap();
    assert_eq!(
        drain(&mut pal),
        vec![PalEvent::SecureConnectionsLtkGenerated {
            connection: 1,
            ltk: Ltk::new([7; 16]),
        }]
    );
}

#[test]
fn test_encryption_level_table() {
    let mut pal = test_pal();
    let ltk = Ltk::new([1; 16]);
    pal.enable_encryption(1, &ltk, &Rand::default(), &Ediv::default(), false)
        .unwrap();
    pal.enable_encryption(1, &ltk, &Rand::default(), &Ediv::default(), true)
        .unwrap();
    pal.enable_secure_connections_encryption(1, &ltk, true)
        .unwrap();
    pal.enable_secure_connections_encryption(1, &ltk, false)
        .unwrap();
    pal.set_ltk(2, &ltk, true, false).unwrap();
    pal.set_ltk_not_found(2).unwrap();

    let levels: Vec<(bool, u8)> = pal
        .transport()
        .iter()
        .map(|cmd| match cmd {
            ControllerCommand::EncryptRequest { level, .. } => (true, *level),
            ControllerCommand::LtkResponse { found, level, .. } => (*found, *level),
            other => panic!("unexpected command {other:?}"),
        })
        .collect();
    assert_eq!(
        levels,
        vec![(true, 1), (true, 2), (true, 3), (true, 1), (true, 2), (false, 0)]
    );
}

#[test]
fn test_secure_connections_oob_needs_public_key() {
    let mut pal = test_pal();
    assert!(matches!(
        pal.generate_secure_connections_oob(),
        Err(SmError::InvalidState(_))
    ));

    let key = PublicKey {
        x: PublicKeyCoord::new([0x11; 32]),
        y: PublicKeyCoord::new([0x22; 32]),
    };
    pal.handle_controller_event(ControllerEvent::EccKey { key })
        .unwrap();
    pal.generate_secure_connections_oob().unwrap();
    match pal.transport().last() {
        Some(ControllerCommand::CalcOob { public_key_x, .. }) => assert_eq!(*public_key_x, key.x),
        other => panic!("unexpected command {other:?}"),
    }

    let mut legacy_only = test_pal().with_secure_connections(false);
    assert_eq!(
        legacy_only.generate_secure_connections_oob(),
        Err(SmError::NotImplemented)
    );
}

#[test]
fn test_key_size_requirements() {
    let mut pal = test_pal();
    assert!(pal.set_encryption_key_requirements(6, 16).is_err());
    assert!(pal.set_encryption_key_requirements(10, 9).is_err());
    assert!(pal.transport().is_empty());

    pal.set_encryption_key_requirements(10, 12).unwrap();
    assert_eq!(pal.encryption_key_requirements(), (10, 12));
    assert_eq!(
        pal.transport(),
        &vec![ControllerCommand::SetKeySizes { min: 10, max: 12 }]
    );
}

#[test]
fn test_authentication_timeout_cache() {
    let mut pal = test_pal();
    assert_eq!(
        pal.get_authentication_timeout(1),
        Ok(crate::smp::constants::DEFAULT_AUTHENTICATION_TIMEOUT)
    );
    pal.set_authentication_timeout(1, 500).unwrap();
    assert_eq!(pal.get_authentication_timeout(1), Ok(500));
    pal.release_connection(1).unwrap();
    assert_eq!(
        pal.get_authentication_timeout(1),
        Ok(crate::smp::constants::DEFAULT_AUTHENTICATION_TIMEOUT)
    );
}
