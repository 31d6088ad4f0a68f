// SPDX-License-Identifier: Apache-2.0

use super::keys::DistPublic;
use super::keys::Identity;
use super::node::Node;
use super::Scheme;
use crate::net::utils::Peer;
use crate::net::utils::Seconds;

use energon::traits::Affine;
use sha2::Digest;
use sha2::Sha256;

/// Immutable description of one committee epoch. Created by the operator
/// tooling without `dist_key`; the DKG augments it with the distributed
/// public key and, for resharings, a transition time.
///
/// The TOML encoding (see [`super::toml`]) is canonical so that
/// [`Group::hash`] agrees across nodes.
#[derive(Debug, Clone, PartialEq)]
pub struct Group<S: Scheme> {
    pub nodes: Vec<Node<S>>,
    pub threshold: u32,
    /// Period in seconds between two rounds.
    pub period: Seconds,
    /// Minimum delay before re-emitting a partial while behind the clock.
    pub catchup_period: Seconds,
    pub genesis_time: u64,
    /// First second of the epoch this group signs for. Equals
    /// `genesis_time` for the first epoch.
    pub transition_time: u64,
    pub genesis_seed: Vec<u8>,
    pub dist_key: DistPublic<S>,
}

#[derive(thiserror::Error, Debug)]
pub enum GroupError {
    #[error("threshold {threshold} out of bounds for {nodes} nodes")]
    InvalidThreshold { threshold: u32, nodes: u32 },
    #[error("failed to serialize group element")]
    Serialize,
}

impl<S: Scheme> Group<S> {
    /// Minimal threshold able to recover the secret for `n` shares.
    pub fn minimum_threshold(n: usize) -> u32 {
        (n as u32 >> 1) + 1
    }

    /// Checks threshold bounds against the node count.
    pub fn validate(&self) -> Result<(), GroupError> {
        let nodes = self.nodes.len() as u32;
        if self.threshold < Self::minimum_threshold(self.nodes.len()) || self.threshold > nodes {
            return Err(GroupError::InvalidThreshold {
                threshold: self.threshold,
                nodes,
            });
        }

        Ok(())
    }

    pub fn find_index(&self, identity: &Identity<S>) -> Option<u32> {
        self.nodes
            .iter()
            .find(|node| node.public() == identity)
            .map(Node::index)
    }

    pub fn node(&self, index: u32) -> Option<&Node<S>> {
        self.nodes.iter().find(|node| node.index() == index)
    }

    /// Every peer in the group except the node at `index`.
    pub fn peers_except(&self, index: u32) -> Vec<Peer> {
        self.nodes
            .iter()
            .filter(|node| node.index() != index)
            .map(Node::to_peer)
            .collect()
    }

    /// Canonical hash over the group fields, stable across nodes.
    pub fn hash(&self) -> Result<[u8; 32], GroupError> {
        let mut h = Sha256::new();
        h.update(self.threshold.to_be_bytes());
        h.update(u32::from(self.period).to_be_bytes());
        h.update(self.genesis_time.to_be_bytes());
        h.update(self.transition_time.to_be_bytes());

        // Nodes are totally ordered by index.
        let mut nodes: Vec<&Node<S>> = self.nodes.iter().collect();
        nodes.sort_by_key(|n| n.index());
        for node in nodes {
            h.update(node.index().to_be_bytes());
            let key: Vec<u8> = node
                .public()
                .key()
                .serialize()
                .map_err(|_| GroupError::Serialize)?
                .into();
            h.update(&key);
        }

        for commit in self.dist_key.commits() {
            let bytes: Vec<u8> = commit.serialize().map_err(|_| GroupError::Serialize)?.into();
            h.update(&bytes);
        }

        Ok(h.finalize().into())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use energon::drand::schemes::DefaultScheme;

    #[test]
    fn minimum_threshold_majority() {
        assert_eq!(Group::<DefaultScheme>::minimum_threshold(3), 2);
        assert_eq!(Group::<DefaultScheme>::minimum_threshold(4), 3);
        assert_eq!(Group::<DefaultScheme>::minimum_threshold(6), 4);
        assert_eq!(Group::<DefaultScheme>::minimum_threshold(8), 5);
    }
}
