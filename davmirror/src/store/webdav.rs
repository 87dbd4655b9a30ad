//! WebDAV backend, a thin mapping from the store contract onto the
//! adapter verbs. Tree discovery goes through the parallel crawler.

use std::io;

use async_trait::async_trait;
use futures_util::TryStreamExt;
use tokio_util::io::{ReaderStream, StreamReader};

use davmirror_core::{DavClient, DavEntry, DavError, DavOptions, Depth, TreeCrawler, paths};

use super::{ByteReader, Resource, Store, StoreError, TreeSnapshot};
use crate::config::WebdavOptions;

const CRAWL_WORKERS: usize = 4;

pub struct DavStore {
    client: DavClient,
    base_dir: String,
}

impl DavStore {
    pub fn new(options: &WebdavOptions, base_dir: &str) -> Result<Self, StoreError> {
        if options.dav_uri.is_empty() {
            return Err(StoreError::Config("webdav DavUri is empty".to_string()));
        }
        let client = DavClient::new(DavOptions {
            dav_uri: options.dav_uri.clone(),
            auth_token: options.auth_token.clone(),
            auth_token_type: options.auth_token_type.clone(),
            auth_user: options.auth_user.clone(),
            auth_pass: options.auth_pass.clone(),
            ..DavOptions::default()
        })?;
        Ok(Self {
            client,
            base_dir: paths::normalize_base(base_dir),
        })
    }

    fn resource_from_entry(&self, rel: &str, entry: &DavEntry) -> Resource {
        Resource {
            path: rel.to_string(),
            abs_path: entry.abs_path(),
            name: entry.display_name.clone(),
            is_dir: entry.is_collection,
            size: if entry.is_collection {
                0
            } else {
                entry.content_length
            },
            mod_time: entry.last_modified,
            hash_etag: entry.etag.clone(),
            user_data: entry
                .content_type
                .as_ref()
                .map(|ct| serde_json::json!({ "content_type": ct })),
            ..Resource::default()
        }
    }
}

#[async_trait]
impl Store for DavStore {
    async fn read_tree(&self) -> Result<TreeSnapshot, StoreError> {
        let crawler = TreeCrawler::new(self.client.clone(), &self.base_dir, CRAWL_WORKERS);
        let tree = crawler.crawl().await?;

        let mut snapshot = TreeSnapshot::default();
        for (abs, entry) in &tree.parents {
            let rel = paths::to_rel(abs, &self.base_dir);
            snapshot
                .parents
                .insert(abs.clone(), self.resource_from_entry(&rel, entry));
        }
        for (rel, entry) in &tree.children {
            snapshot
                .children
                .insert(rel.clone(), self.resource_from_entry(rel, entry));
        }
        Ok(snapshot)
    }

    async fn read_resource(&self, rel_path: &str) -> Result<Option<Resource>, StoreError> {
        let abs = self.to_abs(rel_path);
        let Some(entries) = self.client.propfind(&abs, Depth::Zero).await? else {
            return Ok(None);
        };
        let Some(entry) = entries.first() else {
            return Ok(None);
        };
        let rel = paths::normalize(rel_path, entry.is_collection);
        Ok(Some(self.resource_from_entry(&rel, entry)))
    }

    async fn make_dir(&self, rel_path: &str) -> Result<(), StoreError> {
        let abs = paths::normalize(&self.to_abs(rel_path), true);
        for level in paths::parents(&abs).into_iter().chain([abs]) {
            let status = self.client.mkcol(&level).await?;
            match status.as_u16() {
                // 405/409: collection already exists
                200 | 201 | 405 | 409 => {}
                _ => {
                    return Err(StoreError::Dav(DavError::Status {
                        method: "MKCOL",
                        path: level,
                        status,
                    }));
                }
            }
        }
        Ok(())
    }

    async fn read_file(&self, rel_path: &str) -> Result<ByteReader, StoreError> {
        let response = self.client.get(&self.to_abs(rel_path)).await?;
        let stream = Box::pin(response.bytes_stream().map_err(io::Error::other));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn write_file(
        &self,
        rel_path: &str,
        source: ByteReader,
        size: i64,
    ) -> Result<(), StoreError> {
        let body = reqwest::Body::wrap_stream(ReaderStream::new(source));
        self.client.put(&self.to_abs(rel_path), body, size).await?;
        Ok(())
    }

    async fn move_file(&self, src_rel: &str, dst_rel: &str) -> Result<(), StoreError> {
        self.client
            .move_resource(&self.to_abs(src_rel), &self.to_abs(dst_rel))
            .await?;
        Ok(())
    }

    async fn delete_file(&self, rel_path: &str) -> Result<(), StoreError> {
        self.client.delete_resource(&self.to_abs(rel_path)).await?;
        Ok(())
    }

    fn to_abs(&self, rel_path: &str) -> String {
        paths::to_abs(rel_path, &self.base_dir)
    }

    fn to_rel(&self, abs_path: &str) -> String {
        paths::to_rel(abs_path, &self.base_dir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> DavStore {
        DavStore::new(
            &WebdavOptions {
                dav_uri: server.uri(),
                auth_user: "user".to_string(),
                auth_pass: "pass".to_string(),
                ..WebdavOptions::default()
            },
            "/backup",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn make_dir_walks_ancestors_and_tolerates_conflicts() {
        let server = MockServer::start().await;
        Mock::given(method("MKCOL"))
            .and(path("/backup/"))
            .respond_with(ResponseTemplate::new(405))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("MKCOL"))
            .and(path("/backup/a/"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server).make_dir("/a/").await.unwrap();
    }

    #[tokio::test]
    async fn write_file_streams_put_with_content_length() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/backup/f.bin"))
            .and(header("Content-Length", "4"))
            .respond_with(ResponseTemplate::new(201))
            .mount(&server)
            .await;

        let source: ByteReader = Box::new(std::io::Cursor::new(b"data".to_vec()));
        store_for(&server)
            .write_file("/f.bin", source, 4)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn read_resource_maps_missing_to_none() {
        let server = MockServer::start().await;
        Mock::given(method("PROPFIND"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let found = store_for(&server).read_resource("/gone.txt").await.unwrap();
        assert!(found.is_none());
    }
}
