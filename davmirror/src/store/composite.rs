//! Composite backend: listing and stat go through the REST API (which
//! reports md5/sha256), byte transfer goes over WebDAV (which streams).

use async_trait::async_trait;

use super::{ByteReader, DavStore, DiskStore, Resource, Store, StoreError, TreeSnapshot};

pub struct CompositeStore {
    list: DiskStore,
    transfer: DavStore,
}

impl CompositeStore {
    pub fn new(list: DiskStore, transfer: DavStore) -> Self {
        Self { list, transfer }
    }
}

#[async_trait]
impl Store for CompositeStore {
    async fn read_tree(&self) -> Result<TreeSnapshot, StoreError> {
        self.list.read_tree().await
    }

    async fn read_resource(&self, rel_path: &str) -> Result<Option<Resource>, StoreError> {
        self.list.read_resource(rel_path).await
    }

    async fn make_dir(&self, rel_path: &str) -> Result<(), StoreError> {
        self.transfer.make_dir(rel_path).await
    }

    async fn read_file(&self, rel_path: &str) -> Result<ByteReader, StoreError> {
        self.transfer.read_file(rel_path).await
    }

    async fn write_file(
        &self,
        rel_path: &str,
        source: ByteReader,
        size: i64,
    ) -> Result<(), StoreError> {
        self.transfer.write_file(rel_path, source, size).await
    }

    async fn move_file(&self, src_rel: &str, dst_rel: &str) -> Result<(), StoreError> {
        self.transfer.move_file(src_rel, dst_rel).await
    }

    async fn delete_file(&self, rel_path: &str) -> Result<(), StoreError> {
        self.transfer.delete_file(rel_path).await
    }

    fn to_abs(&self, rel_path: &str) -> String {
        self.transfer.to_abs(rel_path)
    }

    fn to_rel(&self, abs_path: &str) -> String {
        self.transfer.to_rel(abs_path)
    }
}
