// SPDX-License-Identifier: Apache-2.0

//! Distributed key generation and resharing.
//!
//! The cryptographic phases (Deal, Response, Justification) run inside
//! the pairing backend's protocol instance; this module orchestrates the
//! announcement, bundle gossip, timeouts and the handoff of the finished
//! epoch to the beacon engine.

pub mod broadcast;
pub mod execution;
pub mod handler;
pub mod state;

pub use energon::kyber::dkg::Node as DkgNode;

use crate::key::group::GroupError;
use crate::key::store::FileStoreError;
use crate::net::utils::Classify;
use crate::net::utils::ErrorKind;

#[derive(thiserror::Error, Debug)]
pub enum DkgError {
    #[error("a key generation is already in progress")]
    AlreadyRunning,
    #[error("no finished epoch to reshare from")]
    ReshareWithoutEpoch,
    #[error("no proposed group file for this node")]
    MissingProposedGroup,
    #[error("proposed group hash does not match the leader's")]
    GroupHashMismatch,
    #[error("our key is not part of the proposed group")]
    NotInGroup,
    #[error("key generation timed out")]
    Timeout,
    #[error("no key generation is running")]
    NotRunning,
    #[error("failed to decode bundle from packet")]
    InvalidBundle,
    #[error("resharing must preserve the distributed public key")]
    DistKeyChanged,
    #[error("dkg protocol: {0}")]
    Protocol(energon::kyber::dkg::DkgError),
    #[error("group: {0}")]
    Group(#[from] GroupError),
    #[error("fs: {0}")]
    FileStore(#[from] FileStoreError),
    #[error("chain handoff channel closed")]
    HandoffClosed,
}

impl Classify for DkgError {
    fn kind(&self) -> ErrorKind {
        match self {
            DkgError::AlreadyRunning
            | DkgError::ReshareWithoutEpoch
            | DkgError::MissingProposedGroup
            | DkgError::NotRunning => ErrorKind::NotReady,
            DkgError::Timeout => ErrorKind::Timeout,
            DkgError::GroupHashMismatch
            | DkgError::NotInGroup
            | DkgError::InvalidBundle
            | DkgError::DistKeyChanged
            | DkgError::Group(_) => ErrorKind::Invalid,
            _ => ErrorKind::Transient,
        }
    }
}
