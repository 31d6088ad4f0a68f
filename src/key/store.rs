// SPDX-License-Identifier: Apache-2.0

//! On-disk layout of one node instance:
//!
//! ```text
//! <base>/key/randchain_id.private   long-term scalar
//! <base>/key/randchain_id.public    identity (address, tls, key)
//! <base>/groups/group.toml          current group file
//! <base>/groups/dist_share.private  distributed key share after DKG
//! <base>/db/                        chain store
//! ```

use super::group::Group;
use super::keys::Identity;
use super::keys::Pair;
use super::toml::scalar_to_toml;
use super::toml::FromToml;
use super::toml::IntoToml;
use super::toml::ScalarSerialized;
use super::Scheme;

use energon::kyber::dkg::DistKeyShare;
use energon::traits::ScalarField;

use std::path::PathBuf;
use std::sync::Arc;

const KEY_FOLDER: &str = "key";
const GROUP_FOLDER: &str = "groups";
const DB_FOLDER: &str = "db";
const PRIVATE_ID_FILE: &str = "randchain_id.private";
const PUBLIC_ID_FILE: &str = "randchain_id.public";
const GROUP_FILE: &str = "group.toml";
const PROPOSED_GROUP_FILE: &str = "proposed_group.toml";
const DIST_SHARE_FILE: &str = "dist_share.private";

#[derive(thiserror::Error, Debug)]
pub enum FileStoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid data: {0}")]
    InvalidData(String),
}

/// Cheaply clonable handle for the node's persisted state.
#[derive(Debug, Clone)]
pub struct FileStore {
    inner: Arc<InnerFs>,
}

#[derive(Debug)]
struct InnerFs {
    private_key_file: PathBuf,
    public_key_file: PathBuf,
    group_file: PathBuf,
    proposed_group_file: PathBuf,
    dist_share_file: PathBuf,
    db_folder: PathBuf,
}

impl FileStore {
    /// Lays out (and creates) the folder structure under `base`.
    pub fn create(base: PathBuf) -> Result<Self, FileStoreError> {
        let key_folder = base.join(KEY_FOLDER);
        let group_folder = base.join(GROUP_FOLDER);
        let db_folder = base.join(DB_FOLDER);
        std::fs::create_dir_all(&key_folder)?;
        std::fs::create_dir_all(&group_folder)?;
        std::fs::create_dir_all(&db_folder)?;

        Ok(Self {
            inner: Arc::new(InnerFs {
                private_key_file: key_folder.join(PRIVATE_ID_FILE),
                public_key_file: key_folder.join(PUBLIC_ID_FILE),
                group_file: group_folder.join(GROUP_FILE),
                proposed_group_file: group_folder.join(PROPOSED_GROUP_FILE),
                dist_share_file: group_folder.join(DIST_SHARE_FILE),
                db_folder,
            }),
        })
    }

    pub fn chain_store_path(&self) -> PathBuf {
        self.inner.db_folder.clone()
    }

    /// A node is fresh until its first DKG has persisted a share.
    pub fn is_fresh_run(&self) -> bool {
        !self.inner.dist_share_file.exists()
    }

    pub fn save_pair<S: Scheme>(&self, pair: &Pair<S>) -> Result<(), FileStoreError> {
        let private = scalar_to_toml(pair.private())
            .map_err(|err| FileStoreError::InvalidData(err.to_string()))?;
        std::fs::write(&self.inner.private_key_file, private)?;
        std::fs::write(&self.inner.public_key_file, encode(pair.public())?)?;

        Ok(())
    }

    pub fn load_pair<S: Scheme>(&self) -> Result<Pair<S>, FileStoreError> {
        let private_str = std::fs::read_to_string(&self.inner.private_key_file)?;
        let public_str = std::fs::read_to_string(&self.inner.public_key_file)?;

        let scalar_bytes = decode::<ScalarSerialized>(&private_str)?;
        let private = S::Scalar::from_bytes_be(&scalar_bytes.0)
            .map_err(|err| FileStoreError::InvalidData(format!("private scalar: {err:?}")))?;
        let public = decode::<Identity<S>>(&public_str)?;

        Ok(Pair::set(private, public))
    }

    pub fn save_group<S: Scheme>(&self, group: &Group<S>) -> Result<(), FileStoreError> {
        std::fs::write(&self.inner.group_file, encode(group)?)?;

        Ok(())
    }

    pub fn load_group<S: Scheme>(&self) -> Result<Group<S>, FileStoreError> {
        decode(&std::fs::read_to_string(&self.inner.group_file)?)
    }

    /// The operator-provided group file of a resharing in progress.
    pub fn save_proposed_group<S: Scheme>(&self, group: &Group<S>) -> Result<(), FileStoreError> {
        std::fs::write(&self.inner.proposed_group_file, encode(group)?)?;

        Ok(())
    }

    pub fn load_proposed_group<S: Scheme>(&self) -> Result<Group<S>, FileStoreError> {
        decode(&std::fs::read_to_string(&self.inner.proposed_group_file)?)
    }

    pub fn has_proposed_group(&self) -> bool {
        self.inner.proposed_group_file.exists()
    }

    pub fn save_share<S: Scheme>(&self, share: &DistKeyShare<S>) -> Result<(), FileStoreError> {
        std::fs::write(&self.inner.dist_share_file, encode(share)?)?;

        Ok(())
    }

    pub fn load_share<S: Scheme>(&self) -> Result<DistKeyShare<S>, FileStoreError> {
        decode(&std::fs::read_to_string(&self.inner.dist_share_file)?)
    }

    /// Atomic replacement of the distributed materials at DKG completion:
    /// both files are written to a temp name first, then renamed over the
    /// previous epoch's files.
    pub fn save_distributed<S: Scheme>(
        &self,
        group: &Group<S>,
        share: &DistKeyShare<S>,
    ) -> Result<(), FileStoreError> {
        let tmp_group = self.inner.group_file.with_extension("tmp");
        let tmp_share = self.inner.dist_share_file.with_extension("tmp");
        std::fs::write(&tmp_group, encode(group)?)?;
        std::fs::write(&tmp_share, encode(share)?)?;
        std::fs::rename(&tmp_group, &self.inner.group_file)?;
        std::fs::rename(&tmp_share, &self.inner.dist_share_file)?;

        Ok(())
    }

    /// Full reset: deletes distributed materials, keeps the long-term pair.
    pub fn reset_distributed(&self) -> Result<(), FileStoreError> {
        for file in [&self.inner.group_file, &self.inner.dist_share_file] {
            if file.exists() {
                std::fs::remove_file(file)?;
            }
        }

        Ok(())
    }
}

fn encode(value: &impl IntoToml) -> Result<String, FileStoreError> {
    value
        .to_toml()
        .map_err(|err| FileStoreError::InvalidData(err.to_string()))
}

fn decode<T: FromToml>(raw: &str) -> Result<T, FileStoreError> {
    T::from_toml(raw).map_err(|err| FileStoreError::InvalidData(err.to_string()))
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::net::utils::Address;
    use energon::drand::schemes::DefaultScheme;

    #[test]
    fn pair_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let fs = FileStore::create(dir.path().to_path_buf()).unwrap();

        let address = Address::precheck("127.0.0.1:9000").unwrap();
        let pair = Pair::<DefaultScheme>::generate(address, true).unwrap();
        fs.save_pair(&pair).unwrap();

        let loaded = fs.load_pair::<DefaultScheme>().unwrap();
        assert_eq!(pair, loaded);
        assert!(fs.is_fresh_run());
    }
}
