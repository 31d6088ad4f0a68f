use crate::key::KeyPoint;
use crate::key::Scheme;
use crate::net::utils::Seconds;
use crate::protobuf::randchain::ChainInfoPacket;

use energon::traits::Affine;
use sha2::Digest;

/// Public information necessary for a client to verify any beacon
/// present in the randomness chain.
#[derive(Clone, PartialEq)]
pub struct ChainInfo<S: Scheme> {
    pub public_key: KeyPoint<S>,
    pub period: Seconds,
    pub genesis_time: u64,
    pub genesis_seed: Vec<u8>,
}

impl<S: Scheme> ChainInfo<S> {
    pub fn as_packet(&self) -> Option<ChainInfoPacket> {
        let public_key: Vec<u8> = self.public_key.serialize().ok()?.into();
        let hash = self.hash()?;

        Some(ChainInfoPacket {
            public_key,
            period: self.period.get_value(),
            genesis_time: self.genesis_time,
            genesis_seed: self.genesis_seed.clone(),
            hash: hash.into(),
            scheme_id: S::ID.to_string(),
        })
    }

    /// Canonical hash clients pin to identify the chain.
    pub fn hash(&self) -> Option<[u8; 32]> {
        let pk_bytes: Vec<u8> = self.public_key.serialize().ok()?.into();

        let mut h = sha2::Sha256::new();
        h.update(self.period.get_value().to_be_bytes());
        h.update(self.genesis_time.to_be_bytes());
        h.update(&pk_bytes);
        h.update(&self.genesis_seed);

        Some(h.finalize().into())
    }
}
