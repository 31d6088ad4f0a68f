use super::handler::ChainError;
use super::message;
use super::Beacon;
use crate::key::node::Node;
use crate::key::Scheme;
use crate::net::utils::Peer;
use crate::protobuf::randchain::PartialPacket;

use energon::kyber::dkg::DistKeyShare;
use energon::kyber::poly::PubPoly;
use energon::kyber::poly::PubShare;
use energon::kyber::tbls;
use energon::kyber::tbls::SigShare;

/// Remote group member with its public share, computed by evaluating the
/// public sharing polynomial at the node index.
pub struct RemoteNode<S: Scheme> {
    peer: Peer,
    share: PubShare<S>,
}

impl<S: Scheme> RemoteNode<S> {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }
}

/// Produces this node's partial signatures and validates the ones
/// received from the rest of the group. The private share never leaves
/// this struct.
pub struct PartialSigner<S: Scheme> {
    share: DistKeyShare<S>,
    remote_nodes: Vec<RemoteNode<S>>,
}

impl<S: Scheme> PartialSigner<S> {
    pub fn new(nodes: &[Node<S>], share: DistKeyShare<S>) -> Self {
        let poly = PubPoly::<S> {
            commits: share.commits.clone(),
        };

        let remote_nodes = nodes
            .iter()
            .filter(|n| n.index() != share.pri_share.index())
            .map(|n| RemoteNode {
                share: poly.eval(n.index()),
                peer: n.to_peer(),
            })
            .collect();

        Self {
            share,
            remote_nodes,
        }
    }

    pub fn our_index(&self) -> u32 {
        self.share.pri_share.index()
    }

    pub fn remote_nodes(&self) -> &[RemoteNode<S>] {
        &self.remote_nodes
    }

    pub fn peers(&self) -> Vec<Peer> {
        self.remote_nodes.iter().map(|n| n.peer.clone()).collect()
    }

    /// Partial BLS signature over the canonical message for `round` on
    /// top of `head`.
    pub fn sign_round(&self, round: u64, head: &Beacon) -> Result<SigShare<S>, ChainError> {
        let msg = message(&head.signature, head.round, round);

        tbls::sign(&self.share.pri_share, &msg).map_err(ChainError::TBls)
    }

    /// Returns the [`SigShare`] with the sender's peer if the partial is
    /// valid against the public polynomial at the claimed index.
    pub fn verify_partial(
        &self,
        packet: &PartialPacket,
    ) -> Result<(SigShare<S>, &Peer), ChainError> {
        let sig_share = SigShare::deserialize(&packet.partial_sig).map_err(ChainError::TBls)?;

        let node = self
            .remote_nodes
            .iter()
            .find(|n| n.share.i == sig_share.index())
            .ok_or(ChainError::UnknownIndex(sig_share.index()))?;

        let msg = message(
            &packet.previous_sig,
            packet.previous_round,
            packet.round,
        );

        if S::bls_verify(&node.share.v, sig_share.value(), &msg).is_err() {
            return Err(ChainError::InvalidPartialSignature);
        }

        Ok((sig_share, &node.peer))
    }
}

/// Extracts the signer index from a serialized partial: the first two
/// bytes carry the index, the rest is the signature point.
pub fn partial_index<S: Scheme>(partial: &[u8]) -> Option<u32> {
    let expected = <S::Sig as energon::traits::Group>::POINT_SIZE + 2;
    if partial.len() != expected {
        return None;
    }

    Some(u32::from_be_bytes([0, 0, partial[0], partial[1]]))
}
