// SPDX-License-Identifier: Apache-2.0

use super::keys::Identity;
use super::Scheme;
use crate::net::utils::Peer;

/// Identity plus the index the node holds within its group. The index
/// selects the evaluation point of the sharing polynomial and is stable
/// across resharings as long as the member is retained.
#[derive(Debug, Clone, PartialEq)]
pub struct Node<S: Scheme> {
    identity: Identity<S>,
    index: u32,
}

impl<S: Scheme> Node<S> {
    pub fn new(identity: Identity<S>, index: u32) -> Self {
        Self { identity, index }
    }

    pub fn public(&self) -> &Identity<S> {
        &self.identity
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn to_peer(&self) -> Peer {
        Peer {
            address: self.identity.address().clone(),
            tls: self.identity.tls(),
        }
    }
}
