//! Cloud-disk REST backend.
//!
//! The tree comes from one flat "list every file" call, filtered to the
//! base client-side. The listing only contains files, so every missing
//! ancestor becomes a synthetic directory resource.

use std::collections::BTreeMap;
use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures_util::TryStreamExt;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio_util::io::{ReaderStream, StreamReader};

use davmirror_core::{DiskClient, DiskOptions, DiskResource, paths};

use super::{ByteReader, Resource, Store, StoreError, TreeSnapshot};
use crate::config::YadiskRestOptions;

type Listing = Arc<BTreeMap<String, DiskResource>>;

pub struct DiskStore {
    client: DiskClient,
    base_dir: String,
    delete_permanent: bool,
    listing: Mutex<Option<Listing>>,
}

impl DiskStore {
    pub fn new(options: &YadiskRestOptions, base_dir: &str) -> Result<Self, StoreError> {
        if options.api_uri.is_empty() {
            return Err(StoreError::Config("disk ApiUri is empty".to_string()));
        }
        let client = DiskClient::new(DiskOptions {
            api_uri: options.api_uri.clone(),
            auth_token: options.auth_token.clone(),
            ..DiskOptions::default()
        })?;
        Ok(Self {
            client,
            base_dir: paths::normalize_base(base_dir),
            delete_permanent: options.delete_permanent,
            listing: Mutex::new(None),
        })
    }

    /// Plain absolute path (no `disk:` prefix) for API calls.
    fn api_path(&self, rel_path: &str) -> String {
        paths::to_abs(rel_path, &self.base_dir)
    }

    async fn listing(&self) -> Result<Listing, StoreError> {
        if let Some(listing) = self.listing.lock().expect("listing mutex poisoned").clone() {
            return Ok(listing);
        }
        let items = self.client.list_files().await?;
        let mut by_rel = BTreeMap::new();
        for item in items {
            let abs = item.plain_abs_path();
            if !abs.starts_with(&self.base_dir) {
                continue;
            }
            by_rel.insert(paths::to_rel(&abs, &self.base_dir), item);
        }
        let listing: Listing = Arc::new(by_rel);
        *self.listing.lock().expect("listing mutex poisoned") = Some(listing.clone());
        Ok(listing)
    }

    fn resource_from_item(&self, rel: &str, item: &DiskResource) -> Resource {
        Resource {
            path: rel.to_string(),
            abs_path: item.path.clone(),
            name: item.name.clone(),
            is_dir: item.is_dir(),
            size: if item.is_dir() { 0 } else { item.size },
            mod_time: parse_modified(item.modified.as_deref())
                .or_else(|| parse_modified(item.created.as_deref())),
            hash_md5: item.md5.clone(),
            hash_sha256: item.sha256.clone(),
            user_data: item.resource_id.as_ref().map(|id| {
                serde_json::json!({ "resource_id": id })
            }),
            ..Resource::default()
        }
    }

    fn synthetic_dir(&self, rel: &str) -> Resource {
        let name = rel
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
            .to_string();
        Resource {
            path: rel.to_string(),
            abs_path: self.to_abs(rel),
            name,
            is_dir: true,
            ..Resource::default()
        }
    }
}

#[async_trait]
impl Store for DiskStore {
    async fn read_tree(&self) -> Result<TreeSnapshot, StoreError> {
        let listing = self.listing().await?;

        let mut snapshot = TreeSnapshot::default();
        for (rel, item) in listing.iter() {
            snapshot
                .children
                .insert(rel.clone(), self.resource_from_item(rel, item));
        }
        // files-only listing: missing ancestors become synthetic dirs
        let file_rels: Vec<String> = snapshot.children.keys().cloned().collect();
        for rel in file_rels {
            for dir in paths::parents(&rel) {
                if !snapshot.children.contains_key(&dir) {
                    snapshot.children.insert(dir.clone(), self.synthetic_dir(&dir));
                }
            }
        }
        Ok(snapshot)
    }

    async fn read_resource(&self, rel_path: &str) -> Result<Option<Resource>, StoreError> {
        let Some(item) = self.client.get_resource(&self.api_path(rel_path)).await? else {
            return Ok(None);
        };
        let rel = paths::normalize(rel_path, item.is_dir());
        Ok(Some(self.resource_from_item(&rel, &item)))
    }

    async fn make_dir(&self, rel_path: &str) -> Result<(), StoreError> {
        let abs = paths::normalize(&self.api_path(rel_path), true);
        for level in paths::parents(&abs).into_iter().chain([abs]) {
            let target = level.trim_end_matches('/');
            if target.is_empty() {
                continue;
            }
            let status = self.client.create_folder(target).await?;
            match status.as_u16() {
                // 409: directory already exists
                200 | 201 | 409 => {}
                other => {
                    return Err(StoreError::Protocol(format!(
                        "mkdir '{target}' returned {other}"
                    )));
                }
            }
        }
        Ok(())
    }

    async fn read_file(&self, rel_path: &str) -> Result<ByteReader, StoreError> {
        let rel = paths::normalize(rel_path, false);
        let listing = self.listing().await?;
        let item = listing
            .get(&rel)
            .ok_or_else(|| StoreError::NotFound(rel.clone()))?;
        if item.is_dir() {
            return Err(StoreError::Protocol(format!("'{rel}' is not a file")));
        }
        let href = item
            .file
            .as_deref()
            .ok_or_else(|| StoreError::Protocol(format!("'{rel}' has no download href")))?;
        let response = self.client.download(href).await?;
        let stream = Box::pin(response.bytes_stream().map_err(io::Error::other));
        Ok(Box::new(StreamReader::new(stream)))
    }

    async fn write_file(
        &self,
        rel_path: &str,
        source: ByteReader,
        size: i64,
    ) -> Result<(), StoreError> {
        let link = self.client.upload_link(&self.api_path(rel_path), true).await?;
        let body = reqwest::Body::wrap_stream(ReaderStream::new(source));
        self.client.upload(&link, body, size).await?;
        Ok(())
    }

    async fn move_file(&self, src_rel: &str, dst_rel: &str) -> Result<(), StoreError> {
        self.client
            .move_resource(&self.api_path(src_rel), &self.api_path(dst_rel), true)
            .await?;
        Ok(())
    }

    async fn delete_file(&self, rel_path: &str) -> Result<(), StoreError> {
        self.client
            .delete_resource(&self.api_path(rel_path), self.delete_permanent)
            .await?;
        Ok(())
    }

    fn to_abs(&self, rel_path: &str) -> String {
        format!("disk:{}", paths::to_abs(rel_path, &self.base_dir))
    }

    fn to_rel(&self, abs_path: &str) -> String {
        let plain = abs_path.strip_prefix("disk:").unwrap_or(abs_path);
        paths::to_rel(plain, &self.base_dir)
    }
}

fn parse_modified(value: Option<&str>) -> Option<OffsetDateTime> {
    OffsetDateTime::parse(value?, &Rfc3339).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn store_for(server: &MockServer) -> DiskStore {
        DiskStore::new(
            &YadiskRestOptions {
                api_uri: server.uri(),
                auth_token: "test-token".to_string(),
                delete_permanent: true,
            },
            "/backup",
        )
        .unwrap()
    }

    fn listing_body() -> serde_json::Value {
        json!({
            "items": [
                {
                    "path": "disk:/backup/docs/a.txt",
                    "type": "file",
                    "name": "a.txt",
                    "size": 11,
                    "modified": "2026-01-02T10:20:30Z",
                    "md5": "m1",
                    "sha256": "s1",
                    "file": "https://download.example/a.txt"
                },
                {
                    "path": "disk:/elsewhere/b.txt",
                    "type": "file",
                    "name": "b.txt",
                    "size": 3
                }
            ]
        })
    }

    #[tokio::test]
    async fn read_tree_filters_base_and_synthesizes_dirs() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/resources/files"))
            .respond_with(ResponseTemplate::new(200).set_body_json(listing_body()))
            .mount(&server)
            .await;

        let snapshot = store_for(&server).read_tree().await.unwrap();
        let keys: Vec<&str> = snapshot.children.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["/docs/", "/docs/a.txt"]);

        let dir = &snapshot.children["/docs/"];
        assert!(dir.is_dir);
        assert_eq!(dir.size, 0);

        let file = &snapshot.children["/docs/a.txt"];
        assert_eq!(file.hash_sha256.as_deref(), Some("s1"));
        assert_eq!(file.abs_path, "disk:/backup/docs/a.txt");
    }

    #[tokio::test]
    async fn make_dir_creates_each_level() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/resources"))
            .and(query_param("path", "/backup"))
            .respond_with(ResponseTemplate::new(409))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("PUT"))
            .and(path("/resources"))
            .and(query_param("path", "/backup/docs"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&server)
            .await;

        store_for(&server).make_dir("/docs/").await.unwrap();
    }

    #[tokio::test]
    async fn path_mapping_carries_disk_prefix() {
        let server = MockServer::start().await;
        let store = store_for(&server);
        assert_eq!(store.to_abs("/docs/a.txt"), "disk:/backup/docs/a.txt");
        assert_eq!(store.to_rel("disk:/backup/docs/a.txt"), "/docs/a.txt");
    }
}
