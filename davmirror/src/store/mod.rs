//! Store abstraction: one uniform contract over local filesystems,
//! WebDAV endpoints and the cloud-disk REST API.
//!
//! All `rel_path` arguments are canonical paths relative to the store's
//! configured base directory; backends canonicalize on entry and exit.

pub mod composite;
pub mod disk;
pub mod local;
pub mod webdav;

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;

use davmirror_core::{DavError, DiskError};

use crate::config::{ClientConfig, ClientType};

pub use composite::CompositeStore;
pub use disk::DiskStore;
pub use local::LocalStore;
pub use webdav::DavStore;

/// Streamed file payload.
pub type ByteReader = Box<dyn tokio::io::AsyncRead + Send + Unpin>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("webdav error: {0}")]
    Dav(#[from] DavError),
    #[error("disk api error: {0}")]
    Disk(#[from] DiskError),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("resource not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    AlreadyExists(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

/// One node of a store tree.
#[derive(Debug, Clone, Default)]
pub struct Resource {
    /// Canonical path relative to the base directory.
    pub path: String,
    /// Backend-absolute path, including any backend prefix (`disk:`).
    pub abs_path: String,
    pub name: String,
    pub is_dir: bool,
    pub size: i64,
    pub mod_time: Option<OffsetDateTime>,
    pub hash_etag: Option<String>,
    pub hash_md5: Option<String>,
    pub hash_sha256: Option<String>,
    /// Opaque backend payload.
    pub user_data: Option<serde_json::Value>,
}

impl Resource {
    /// True when any present hash equals `hash`.
    pub fn matches_any_hash(&self, hash: &str) -> bool {
        if hash.is_empty() {
            return false;
        }
        [&self.hash_sha256, &self.hash_md5, &self.hash_etag]
            .into_iter()
            .any(|own| own.as_deref().is_some_and(|own| !own.is_empty() && own == hash))
    }
}

/// Immutable result of one tree read.
#[derive(Debug, Default)]
pub struct TreeSnapshot {
    /// Ancestor directories of the base itself, keyed by backend-absolute
    /// path. Used only to decide which mkdir calls are unnecessary.
    pub parents: BTreeMap<String, Resource>,
    /// Everything at or below the base, keyed by relative path.
    pub children: BTreeMap<String, Resource>,
}

impl TreeSnapshot {
    pub fn child_paths(&self) -> Vec<String> {
        self.children.keys().cloned().collect()
    }
}

#[async_trait]
pub trait Store: Send + Sync {
    /// Discover the whole tree under the base directory.
    async fn read_tree(&self) -> Result<TreeSnapshot, StoreError>;

    /// Stat a single path. `None` means not found.
    async fn read_resource(&self, rel_path: &str) -> Result<Option<Resource>, StoreError>;

    /// Create a directory, including missing ancestors. Creating an
    /// existing directory is not an error.
    async fn make_dir(&self, rel_path: &str) -> Result<(), StoreError>;

    async fn read_file(&self, rel_path: &str) -> Result<ByteReader, StoreError>;

    /// Write a file from a stream. `size <= 0` means unknown.
    async fn write_file(
        &self,
        rel_path: &str,
        source: ByteReader,
        size: i64,
    ) -> Result<(), StoreError>;

    async fn move_file(&self, src_rel: &str, dst_rel: &str) -> Result<(), StoreError>;

    async fn delete_file(&self, rel_path: &str) -> Result<(), StoreError>;

    fn to_abs(&self, rel_path: &str) -> String;

    fn to_rel(&self, abs_path: &str) -> String;
}

/// Build a store from its JSON client config.
pub fn create_store(config: &ClientConfig) -> Result<Arc<dyn Store>, StoreError> {
    match config.client_type {
        ClientType::Local => Ok(Arc::new(LocalStore::new(
            &config.local_options,
            &config.base_dir,
        ))),
        ClientType::Webdav => Ok(Arc::new(DavStore::new(
            &config.webdav_options,
            &config.base_dir,
        )?)),
        ClientType::YadiskRest => Ok(Arc::new(DiskStore::new(
            &config.yadisk_rest_options,
            &config.base_dir,
        )?)),
        ClientType::Yadisk => Ok(Arc::new(CompositeStore::new(
            DiskStore::new(&config.yadisk_rest_options, &config.base_dir)?,
            DavStore::new(&config.webdav_options, &config.base_dir)?,
        ))),
    }
}
