// SPDX-License-Identifier: Apache-2.0

use super::KeyPoint;
use super::Scheme;
use super::SigPoint;
use crate::net::utils::Address;

use energon::traits::Affine;
use energon::traits::ScalarField;

use sha2::Digest;
use sha2::Sha256;
use std::fmt::Display;

#[derive(thiserror::Error, Debug)]
pub enum KeyError {
    #[error("failed to serialize group element")]
    Serialize,
    #[error("failed to sign identity key")]
    SelfSign,
}

/// Long-term node keypair. The public half is the node identity
/// distributed in the group file.
#[derive(Debug, PartialEq)]
pub struct Pair<S: Scheme> {
    private: S::Scalar,
    public: Identity<S>,
}

impl<S: Scheme> Pair<S> {
    /// Generates a fresh keypair for given listening address.
    pub fn generate(address: Address, tls: bool) -> Result<Self, KeyError> {
        let private = S::Scalar::random();
        let key = S::sk_to_pk(&private);
        let signature =
            S::bls_sign(&identity_digest::<S>(&key)?, &private).map_err(|_| KeyError::SelfSign)?;

        Ok(Self {
            private,
            public: Identity {
                address,
                tls,
                key,
                signature,
            },
        })
    }

    pub fn set(private: S::Scalar, public: Identity<S>) -> Self {
        Self { private, public }
    }

    pub fn private(&self) -> &S::Scalar {
        &self.private
    }

    pub fn public(&self) -> &Identity<S> {
        &self.public
    }
}

/// Public identity of a node: address, TLS flag and long-term key,
/// self-signed to prove possession of the private scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity<S: Scheme> {
    address: Address,
    tls: bool,
    key: KeyPoint<S>,
    signature: SigPoint<S>,
}

impl<S: Scheme> Identity<S> {
    pub fn new(address: Address, tls: bool, key: KeyPoint<S>, signature: SigPoint<S>) -> Self {
        Self {
            address,
            tls,
            key,
            signature,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn tls(&self) -> bool {
        self.tls
    }

    pub fn key(&self) -> &KeyPoint<S> {
        &self.key
    }

    pub fn signature(&self) -> &SigPoint<S> {
        &self.signature
    }

    /// Verifies the self-signature over the long-term key.
    pub fn is_valid_signature(&self) -> bool {
        match identity_digest::<S>(&self.key) {
            Ok(msg) => S::bls_verify(&self.key, &self.signature, &msg).is_ok(),
            Err(_) => false,
        }
    }
}

/// Message signed by a node to prove ownership of its long-term key.
fn identity_digest<S: Scheme>(key: &KeyPoint<S>) -> Result<Vec<u8>, KeyError> {
    let key_bytes: Vec<u8> = key.serialize().map_err(|_| KeyError::Serialize)?.into();
    let mut h = Sha256::new();
    h.update(&key_bytes);

    Ok([S::ID.as_bytes(), h.finalize().as_slice()].concat())
}

/// Commitments to the distributed secret polynomial. The constant term
/// is the group public key every recovered beacon verifies under.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct DistPublic<S: Scheme> {
    commits: Vec<KeyPoint<S>>,
}

impl<S: Scheme> DistPublic<S> {
    pub fn new(commits: Vec<KeyPoint<S>>) -> Self {
        Self { commits }
    }

    pub fn commits(&self) -> &[KeyPoint<S>] {
        &self.commits
    }

    /// Group public key, present once DKG has completed.
    pub fn public_key(&self) -> Option<&KeyPoint<S>> {
        self.commits.first()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }
}

impl<S: Scheme> Display for Identity<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(
            f,
            "Address = {}\nKey = {}\nTLS = {}\nSchemeName = {}",
            self.address,
            self.key,
            self.tls,
            S::ID
        )
    }
}
