//! Process wide out-of-band pairing data

use crate::gap::BdAddr;
use crate::smp::{OobConfirm, OobLescValue, OobTk};

/// Progress of the local Secure Connections OOB data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LocalOob {
    #[default]
    Idle,
    /// The controller is computing a new random and confirm pair
    Generating,
    Ready(OobLescValue),
}

/// Secure Connections OOB data received from a peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerOob {
    pub address: BdAddr,
    pub random: OobLescValue,
    pub confirm: OobConfirm,
}

/// Legacy pairing temporary key and the device that produced it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LegacyOob {
    pub creator: BdAddr,
    pub tk: OobTk,
}

/// Only one OOB generation may be in flight for the whole stack
#[derive(Debug, Clone, Default)]
pub struct OobState {
    pub local: LocalOob,
    /// Address the local OOB data was generated for
    pub local_address: BdAddr,
    pub peer: Option<PeerOob>,
    pub legacy: Option<LegacyOob>,
}

impl OobState {
    pub fn is_generating(&self) -> bool {
        self.local == LocalOob::Generating
    }

    /// Local random to hand to the controller, all zero when none was generated
    pub fn local_random(&self) -> OobLescValue {
        match self.local {
            LocalOob::Ready(random) => random,
            _ => OobLescValue::default(),
        }
    }

    /// Peer OOB data for `address`, consumed so it is never used twice
    pub fn take_peer(&mut self, address: &BdAddr) -> Option<PeerOob> {
        match self.peer {
            Some(peer) if peer.address == *address => self.peer.take(),
            _ => None,
        }
    }

    /// Temporary key usable on a link between `peer` and `local`.
    ///
    /// A key received from the peer is consumed; one generated locally stays
    /// available for further links.
    pub fn take_legacy_tk(&mut self, peer: &BdAddr, local: &BdAddr) -> Option<OobTk> {
        let legacy = self.legacy?;
        if legacy.creator == *peer {
            self.legacy = None;
            Some(legacy.tk)
        } else if legacy.creator == *local {
            Some(legacy.tk)
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_oob_used_once() {
        let address = BdAddr::new([1; 6]);
        let mut oob = OobState {
            peer: Some(PeerOob {
                address,
                random: OobLescValue::new([2; 16]),
                confirm: OobConfirm::new([3; 16]),
            }),
            ..OobState::default()
        };
        assert!(oob.take_peer(&BdAddr::new([9; 6])).is_none());
        assert!(oob.take_peer(&address).is_some());
        assert!(oob.take_peer(&address).is_none());
    }

    #[test]
    fn test_legacy_tk_ownership() {
        let local = BdAddr::new([1; 6]);
        let peer = BdAddr::new([2; 6]);
        let tk = OobTk::new([5; 16]);

        let mut oob = OobState {
            legacy: Some(LegacyOob { creator: local, tk }),
            ..OobState::default()
        };
        assert_eq!(oob.take_legacy_tk(&peer, &local), Some(tk));
        assert_eq!(oob.take_legacy_tk(&peer, &local), Some(tk));

        oob.legacy = Some(LegacyOob { creator: peer, tk });
        assert_eq!(oob.take_legacy_tk(&peer, &local), Some(tk));
        assert_eq!(oob.take_legacy_tk(&peer, &local), None);
    }

    #[test]
    fn test_local_random_defaults_to_zero() {
        let mut oob = OobState::default();
        assert!(oob.local_random().is_zero());
        oob.local = LocalOob::Generating;
        assert!(oob.is_generating());
        oob.local = LocalOob::Ready(OobLescValue::new([4; 16]));
        assert_eq!(oob.local_random(), OobLescValue::new([4; 16]));
    }
}
