// SPDX-License-Identifier: Apache-2.0

//! Canonical TOML encoding for identity, group and share files.
//!
//! Field order and formats are stable: nodes agree on [`Group::hash`]
//! only if they encode the group file identically.

use super::group::Group;
use super::keys::DistPublic;
use super::keys::Identity;
use super::node::Node;
use super::KeyPoint;
use super::Scheme;
use crate::net::utils::Address;
use crate::net::utils::Seconds;

use energon::kyber::dkg::DistKeyShare;
use energon::kyber::poly::PriShare;
use energon::traits::Affine;
use energon::traits::ScalarField;

use anyhow::anyhow;
use anyhow::bail;
use anyhow::Result;
use std::str::FromStr;
use toml::value::Array;
use toml::Table;
use toml::Value;

/// Create Map<String, Value> from (key:&str, value:Value) pairs.
macro_rules! map {
    ($($key:literal : $value:expr),* $(,)?) => {
        {
            let kv = [$(($key.to_string(), $value.into())),*];
            IntoIterator::into_iter(kv).collect::<Table>()
        }
    };
}

/// Get value by $key:&str, define resulting type of value by $method.
macro_rules! get {
    ($map:expr, $key:literal, $method:ident) => {
        $map.get($key)
            .and_then(|v| v.$method())
            .ok_or_else(|| anyhow!(concat!("expected ", $key)))
    };
}

pub trait IntoToml: Sized {
    fn to_value(&self) -> Result<Value>;

    fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string(&self.to_value()?)?)
    }
}

pub trait FromToml: Sized {
    fn from_value(value: &Value) -> Result<Self>;

    fn from_toml(toml: &str) -> Result<Self> {
        Self::from_value(&toml::from_str(toml)?)
    }
}

fn point_hex(point: &impl Affine) -> Result<String> {
    let bytes: Vec<u8> = point
        .serialize()
        .map_err(|err| anyhow!("point serialization: {err:?}"))?
        .into();

    Ok(hex::encode(bytes))
}

impl<S: Scheme> IntoToml for Identity<S> {
    fn to_value(&self) -> Result<Value> {
        let map = map![
             "Address":    self.address().as_str(),
             "Key":        point_hex(self.key())?,
             "TLS":        self.tls(),
             "Signature":  point_hex(self.signature())?,
             "SchemeName": S::ID,
        ];

        Ok(Value::Table(map))
    }
}

impl<S: Scheme> FromToml for Identity<S> {
    fn from_value(value: &Value) -> Result<Self> {
        let scheme_str = get!(value, "SchemeName", as_str)?;
        if S::ID != scheme_str {
            bail!("identity load: expected scheme {}, received {scheme_str}", S::ID)
        }
        let address = Address::precheck(get!(value, "Address", as_str)?)?;
        let tls = get!(value, "TLS", as_bool)?;
        let key_bytes = hex::decode(get!(value, "Key", as_str)?)?;
        let sig_bytes = hex::decode(get!(value, "Signature", as_str)?)?;

        Ok(Self::new(
            address,
            tls,
            Affine::deserialize(&key_bytes).map_err(|err| anyhow!("identity key: {err:?}"))?,
            Affine::deserialize(&sig_bytes).map_err(|err| anyhow!("identity sig: {err:?}"))?,
        ))
    }
}

/// Private scalar file holds a single hex-encoded field.
pub struct ScalarSerialized(pub Vec<u8>);

pub fn scalar_to_toml<S: ScalarField>(scalar: &S) -> Result<String> {
    let bytes: Vec<u8> = scalar
        .to_bytes_be()
        .map_err(|err| anyhow!("scalar serialization: {err:?}"))?
        .into();

    Ok(toml::to_string(&Value::Table(
        map!("Key": hex::encode(bytes)),
    ))?)
}

impl FromToml for ScalarSerialized {
    fn from_value(value: &Value) -> Result<Self> {
        Ok(Self(hex::decode(get!(value, "Key", as_str)?)?))
    }
}

impl<S: Scheme> IntoToml for Node<S> {
    fn to_value(&self) -> Result<Value> {
        let mut map = self
            .public()
            .to_value()?
            .as_table()
            .expect("identity value is a table")
            .to_owned();
        map.extend(map! {"Index": i64::from(self.index())});

        Ok(Value::Table(map))
    }
}

impl<S: Scheme> FromToml for Node<S> {
    fn from_value(value: &Value) -> Result<Self> {
        let index = u32::try_from(get!(value, "Index", as_integer)?)?;
        let identity = Identity::from_value(value)?;

        Ok(Self::new(identity, index))
    }
}

impl<S: Scheme> IntoToml for Group<S> {
    fn to_value(&self) -> Result<Value> {
        let mut map = map! {
            "Threshold":      i64::from(self.threshold),
            "Period":         self.period.to_string(),
            "CatchupPeriod":  self.catchup_period.to_string(),
            "GenesisTime":    i64::try_from(self.genesis_time)?,
            "TransitionTime": i64::try_from(self.transition_time)?,
            "GenesisSeed":    hex::encode(&self.genesis_seed),
            "SchemeID":       S::ID,
        };

        let mut nodes = Array::with_capacity(self.nodes.len());
        for node in &self.nodes {
            nodes.push(node.to_value()?);
        }
        map.insert("Nodes".to_string(), Value::Array(nodes));

        // Present only after DKG.
        if !self.dist_key.is_empty() {
            let mut coefficients = Array::with_capacity(self.dist_key.commits().len());
            for commit in self.dist_key.commits() {
                coefficients.push(Value::String(point_hex(commit)?));
            }
            let mut public_key = Table::new();
            public_key.insert("Coefficients".to_string(), Value::Array(coefficients));
            map.insert("PublicKey".to_string(), Value::Table(public_key));
        }

        Ok(Value::Table(map))
    }
}

impl<S: Scheme> FromToml for Group<S> {
    fn from_value(value: &Value) -> Result<Self> {
        let scheme_str = get!(value, "SchemeID", as_str)?;
        if S::ID != scheme_str {
            bail!("group load: expected scheme {}, received {scheme_str}", S::ID)
        }
        let threshold = u32::try_from(get!(value, "Threshold", as_integer)?)?;
        let period = Seconds::from_str(get!(value, "Period", as_str)?)
            .map_err(|_| anyhow!("invalid Period"))?;
        let catchup_period = Seconds::from_str(get!(value, "CatchupPeriod", as_str)?)
            .map_err(|_| anyhow!("invalid CatchupPeriod"))?;
        let genesis_time = u64::try_from(get!(value, "GenesisTime", as_integer)?)?;
        let transition_time = u64::try_from(get!(value, "TransitionTime", as_integer)?)?;
        let genesis_seed = hex::decode(get!(value, "GenesisSeed", as_str)?)?;

        let mut nodes = vec![];
        for node in get!(value, "Nodes", as_array)? {
            nodes.push(Node::from_value(node)?);
        }

        let dist_key = match value.get("PublicKey") {
            Some(public_key) => {
                let mut commits: Vec<KeyPoint<S>> = vec![];
                for coefficient in get!(public_key, "Coefficients", as_array)? {
                    let Some(hex_str) = coefficient.as_str() else {
                        bail!("group load: coefficient is not a string")
                    };
                    commits.push(
                        Affine::deserialize(&hex::decode(hex_str)?)
                            .map_err(|err| anyhow!("dist key commit: {err:?}"))?,
                    );
                }
                DistPublic::new(commits)
            }
            None => DistPublic::default(),
        };

        Ok(Group {
            nodes,
            threshold,
            period,
            catchup_period,
            genesis_time,
            transition_time,
            genesis_seed,
            dist_key,
        })
    }
}

impl<S: Scheme> IntoToml for DistKeyShare<S> {
    fn to_value(&self) -> Result<Value> {
        let share_bytes: Vec<u8> = self
            .pri_share
            .v
            .to_bytes_be()
            .map_err(|err| anyhow!("share scalar: {err:?}"))?
            .into();
        let mut map = map! {
            "Index": i64::from(self.pri_share.i),
            "Share": hex::encode(share_bytes),
            "SchemeName": S::ID,
        };

        let mut commits = Array::with_capacity(self.commits.len());
        for commit in &self.commits {
            commits.push(Value::String(point_hex(commit)?));
        }
        map.insert("Commits".to_string(), Value::Array(commits));

        Ok(Value::Table(map))
    }
}

impl<S: Scheme> FromToml for DistKeyShare<S> {
    fn from_value(value: &Value) -> Result<Self> {
        let scheme_str = get!(value, "SchemeName", as_str)?;
        if S::ID != scheme_str {
            bail!("share load: expected scheme {}, received {scheme_str}", S::ID)
        }
        let i = u32::try_from(get!(value, "Index", as_integer)?)?;
        let share_bytes = hex::decode(get!(value, "Share", as_str)?)?;
        let v = S::Scalar::from_bytes_be(&share_bytes)
            .map_err(|err| anyhow!("share scalar: {err:?}"))?;

        let mut commits: Vec<KeyPoint<S>> = vec![];
        for commit in get!(value, "Commits", as_array)? {
            let Some(hex_str) = commit.as_str() else {
                bail!("share load: commit is not a string")
            };
            commits.push(
                Affine::deserialize(&hex::decode(hex_str)?)
                    .map_err(|err| anyhow!("share commit: {err:?}"))?,
            );
        }

        Ok(DistKeyShare {
            commits,
            pri_share: PriShare { i, v },
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use energon::drand::schemes::DefaultScheme;

    fn test_identity(port: u16) -> Identity<DefaultScheme> {
        use crate::key::keys::Pair;

        let address = Address::precheck(&format!("127.0.0.1:{port}")).unwrap();
        Pair::generate(address, false).unwrap().public().clone()
    }

    #[test]
    fn identity_roundtrip() {
        let identity = test_identity(8080);
        let encoded = identity.to_toml().unwrap();
        let decoded = Identity::<DefaultScheme>::from_toml(&encoded).unwrap();
        assert_eq!(identity, decoded);
    }

    #[test]
    fn group_roundtrip_and_stable_hash() {
        let nodes = (0..3u32)
            .map(|i| Node::new(test_identity(7000 + i as u16), i))
            .collect::<Vec<_>>();

        let group = Group::<DefaultScheme> {
            nodes,
            threshold: 2,
            period: Seconds::new(2),
            catchup_period: Seconds::new(1),
            genesis_time: 1_600_000_000,
            transition_time: 1_600_000_000,
            genesis_seed: vec![1, 2, 3],
            dist_key: DistPublic::default(),
        };

        let encoded = group.to_toml().unwrap();
        let decoded = Group::<DefaultScheme>::from_toml(&encoded).unwrap();
        assert_eq!(group, decoded);

        // Hash agreement between the original and its re-encoded copy.
        assert_eq!(group.hash().unwrap(), decoded.hash().unwrap());
    }
}
