// This file is part of Tantu and is licensed under the GNU Affero General Public License v3.0 or later.
// See the LICENSE file in the project root for license details.

#![forbid(unsafe_code)]

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Result as AnyResult;
use async_trait::async_trait;
use thiserror::Error;

use crate::link::StoredLink;
use crate::merkle::MerkleTriple;
use crate::{LinkId, Uid};

/// Database key namespaces for chain tails.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DbType {
    SigChainTailPublic,
    SigChainTailPrivate,
}

impl DbType {
    fn file_name(self) -> &'static str {
        match self {
            Self::SigChainTailPublic => "tail_public",
            Self::SigChainTailPrivate => "tail_private",
        }
    }
}

/// Local persistence capability. Values are serialized merkle triples
/// (tails, keyed by `(DbType, uid)`) and serialized links (keyed by
/// link id under the uid).
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get_tail(&self, db: DbType, uid: &Uid) -> AnyResult<Option<MerkleTriple>>;
    async fn put_tail(&self, db: DbType, uid: &Uid, tail: &MerkleTriple) -> AnyResult<()>;
    async fn get_link(&self, uid: &Uid, id: &LinkId) -> AnyResult<Option<StoredLink>>;
    /// Returns false when the link was already present.
    async fn put_link(&self, uid: &Uid, id: &LinkId, link: &StoredLink) -> AnyResult<bool>;
}

/// Errors produced by the disk-backed store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to create directory {path}: {source}")]
    CreateDir {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to read {path}: {source}")]
    Read {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write {path}: {source}")]
    Write {
        path: Arc<PathBuf>,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to decode {path}: {error}")]
    Decode { path: Arc<PathBuf>, error: String },
    #[error("failed to encode value for {path}: {error}")]
    Encode { path: Arc<PathBuf>, error: String },
}

/// Disk-backed [`LocalStore`]: one directory per uid, CBOR values.
#[derive(Clone, Debug)]
pub struct DiskStore {
    root: PathBuf,
}

impl DiskStore {
    pub fn new<P: AsRef<Path>>(root: P) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
        }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn uid_dir(&self, uid: &Uid) -> PathBuf {
        self.root.join(uid.as_str())
    }

    fn tail_path(&self, db: DbType, uid: &Uid) -> PathBuf {
        self.uid_dir(uid).join(db.file_name())
    }

    fn link_path(&self, uid: &Uid, id: &LinkId) -> PathBuf {
        self.uid_dir(uid).join("links").join(id.to_string())
    }

    async fn read_file(path: PathBuf) -> Result<Option<Vec<u8>>, StoreError> {
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(source) => Err(StoreError::Read {
                path: Arc::new(path),
                source,
            }),
        }
    }

    async fn write_file(path: PathBuf, bytes: Vec<u8>) -> Result<(), StoreError> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: Arc::new(parent.to_path_buf()),
                    source,
                })?;
        }
        tokio::fs::write(&path, bytes)
            .await
            .map_err(|source| StoreError::Write {
                path: Arc::new(path),
                source,
            })
    }
}

#[async_trait]
impl LocalStore for DiskStore {
    async fn get_tail(&self, db: DbType, uid: &Uid) -> AnyResult<Option<MerkleTriple>> {
        let path = self.tail_path(db, uid);
        let Some(bytes) = Self::read_file(path.clone()).await? else {
            return Ok(None);
        };
        let tail = serde_cbor::from_slice(&bytes).map_err(|error| StoreError::Decode {
            path: Arc::new(path),
            error: error.to_string(),
        })?;
        Ok(Some(tail))
    }

    async fn put_tail(&self, db: DbType, uid: &Uid, tail: &MerkleTriple) -> AnyResult<()> {
        let path = self.tail_path(db, uid);
        let bytes = serde_cbor::to_vec(tail).map_err(|error| StoreError::Encode {
            path: Arc::new(path.clone()),
            error: error.to_string(),
        })?;
        Self::write_file(path, bytes).await?;
        Ok(())
    }

    async fn get_link(&self, uid: &Uid, id: &LinkId) -> AnyResult<Option<StoredLink>> {
        let path = self.link_path(uid, id);
        let Some(bytes) = Self::read_file(path.clone()).await? else {
            return Ok(None);
        };
        let link = serde_cbor::from_slice(&bytes).map_err(|error| StoreError::Decode {
            path: Arc::new(path),
            error: error.to_string(),
        })?;
        Ok(Some(link))
    }

    async fn put_link(&self, uid: &Uid, id: &LinkId, link: &StoredLink) -> AnyResult<bool> {
        let path = self.link_path(uid, id);
        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(false);
        }
        let bytes = serde_cbor::to_vec(link).map_err(|error| StoreError::Encode {
            path: Arc::new(path.clone()),
            error: error.to_string(),
        })?;
        Self::write_file(path, bytes).await?;
        Ok(true)
    }
}
