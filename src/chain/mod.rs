// SPDX-License-Identifier: Apache-2.0

//! The beacon-production engine: round clock, partial aggregation,
//! chain store, catch-up sync and subscriber fan-out.

pub mod cache;
pub mod callback;
pub mod handler;
pub mod info;
pub mod signer;
pub mod store;
pub mod sync;
pub mod ticker;
pub mod time;

pub use handler::{init_chain, BeaconState, ChainCmd, ChainError};
pub use store::StoreError;
pub use sync::SyncError;

use crate::key::KeyPoint;
use crate::key::Scheme;
use crate::key::SigPoint;
use crate::protobuf::randchain::BeaconPacket;

use sha2::Digest;
use sha2::Sha256;

/// Domain separation prefix for the round message.
const BEACON_DST: &[u8] = b"randchain:beacon:v1";

/// One link of the randomness chain. `previous_round` is the round of the
/// last *stored* beacon, not necessarily `round - 1`: rounds that fail to
/// reach threshold are skipped and the chain continues over the gap.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Beacon {
    pub round: u64,
    pub previous_round: u64,
    pub previous_sig: Vec<u8>,
    pub signature: Vec<u8>,
}

impl Beacon {
    /// Round-0 anchor carrying the genesis seed as its signature.
    pub fn genesis(seed: Vec<u8>) -> Self {
        Self {
            round: 0,
            previous_round: 0,
            previous_sig: vec![],
            signature: seed,
        }
    }

    /// Next beacon on top of `prev` for `round` with a recovered signature.
    pub fn next(prev: &Self, round: u64, signature: Vec<u8>) -> Self {
        Self {
            round,
            previous_round: prev.round,
            previous_sig: prev.signature.clone(),
            signature,
        }
    }

    /// Randomness delivered to clients.
    pub fn randomness(&self) -> [u8; 32] {
        let mut h = Sha256::new();
        h.update(&self.signature);
        h.finalize().into()
    }

    pub fn short_sig(&self) -> String {
        hex::encode(self.signature.get(..3).unwrap_or_default())
    }
}

impl From<BeaconPacket> for Beacon {
    fn from(p: BeaconPacket) -> Self {
        Self {
            round: p.round,
            previous_round: p.previous_round,
            previous_sig: p.previous_sig,
            signature: p.signature,
        }
    }
}

impl From<Beacon> for BeaconPacket {
    fn from(b: Beacon) -> Self {
        Self {
            round: b.round,
            previous_round: b.previous_round,
            previous_sig: b.previous_sig,
            signature: b.signature,
        }
    }
}

/// The message signed for `round` on top of the chain head.
pub fn message(previous_sig: &[u8], previous_round: u64, round: u64) -> [u8; 32] {
    let mut h = Sha256::new();
    h.update(BEACON_DST);
    h.update(previous_sig);
    h.update(previous_round.to_be_bytes());
    h.update(round.to_be_bytes());
    h.finalize().into()
}

/// BLS check of a recovered or synced signature against the distributed
/// public key and the head it claims to extend.
pub(crate) fn is_valid_signature<S: Scheme>(
    public_key: &KeyPoint<S>,
    prev: &Beacon,
    round: u64,
    signature: &SigPoint<S>,
) -> bool {
    let msg = message(&prev.signature, prev.round, round);
    S::bls_verify(public_key, signature, &msg).is_ok()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn message_binds_all_inputs() {
        let base = message(b"sig", 1, 2);
        assert_ne!(base, message(b"sig", 1, 3));
        assert_ne!(base, message(b"sig", 0, 2));
        assert_ne!(base, message(b"gis", 1, 2));
        assert_eq!(base, message(b"sig", 1, 2));
    }

    #[test]
    fn genesis_links_round_one() {
        let genesis = Beacon::genesis(vec![7; 32]);
        let msg = message(&genesis.signature, genesis.round, 1);
        // Round 1 signs over the seed with previous_round == 0.
        assert_eq!(msg, message(&[7; 32], 0, 1));
        assert_eq!(genesis.round, 0);
    }

    #[test]
    fn randomness_is_hash_of_signature() {
        let b = Beacon {
            round: 5,
            previous_round: 4,
            previous_sig: vec![1],
            signature: vec![2, 3],
        };
        let mut h = Sha256::new();
        h.update([2u8, 3]);
        let expected: [u8; 32] = h.finalize().into();
        assert_eq!(b.randomness(), expected);
    }
}
