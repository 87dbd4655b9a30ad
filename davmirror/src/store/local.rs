//! Local filesystem backend.

use std::io;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use walkdir::WalkDir;

use davmirror_core::paths;

use super::{ByteReader, Resource, Store, StoreError, TreeSnapshot};
use crate::config::LocalOptions;

pub struct LocalStore {
    base_dir: String,
    dir_mode: u32,
    file_mode: u32,
}

impl LocalStore {
    pub fn new(options: &LocalOptions, base_dir: &str) -> Self {
        // Relative bases are anchored to the working directory up front so
        // path mapping stays a pure string operation afterwards.
        let absolute = std::path::absolute(Path::new(base_dir))
            .unwrap_or_else(|_| PathBuf::from(base_dir));
        Self {
            base_dir: paths::normalize_base(&absolute.to_string_lossy()),
            dir_mode: options.dir_mode,
            file_mode: options.file_mode,
        }
    }

    fn fs_path(&self, rel_path: &str) -> PathBuf {
        PathBuf::from(paths::to_abs(rel_path, &self.base_dir))
    }

    fn resource_from_meta(&self, abs: &str, meta: &std::fs::Metadata) -> Resource {
        let abs_path = paths::normalize(abs, meta.is_dir());
        let rel = paths::to_rel(&abs_path, &self.base_dir);
        let name = abs_path
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .unwrap_or("")
            .to_string();
        Resource {
            path: rel,
            abs_path,
            name,
            is_dir: meta.is_dir(),
            size: if meta.is_dir() { 0 } else { meta.len() as i64 },
            mod_time: meta.modified().ok().map(OffsetDateTime::from),
            ..Resource::default()
        }
    }
}

#[async_trait]
impl Store for LocalStore {
    async fn read_tree(&self) -> Result<TreeSnapshot, StoreError> {
        let trimmed = self.base_dir.trim_end_matches('/');
        let base = PathBuf::from(if trimmed.is_empty() { "/" } else { trimmed });
        // An output base that does not exist yet is an empty tree; the
        // sync provisions it during the make-dirs phase.
        if !base.exists() {
            return Ok(TreeSnapshot::default());
        }
        let walked = tokio::task::spawn_blocking(move || {
            let mut out = Vec::new();
            for entry in WalkDir::new(&base).follow_links(false) {
                let entry = entry.map_err(io::Error::from)?;
                let meta = entry.metadata().map_err(io::Error::from)?;
                out.push((entry.path().to_string_lossy().into_owned(), meta));
            }
            Ok::<_, io::Error>(out)
        })
        .await
        .map_err(io::Error::other)??;

        let mut snapshot = TreeSnapshot::default();
        for (abs, meta) in &walked {
            let resource = self.resource_from_meta(abs, meta);
            snapshot.children.insert(resource.path.clone(), resource);
        }
        Ok(snapshot)
    }

    async fn read_resource(&self, rel_path: &str) -> Result<Option<Resource>, StoreError> {
        let fs_path = self.fs_path(rel_path);
        match tokio::fs::metadata(&fs_path).await {
            Ok(meta) => Ok(Some(
                self.resource_from_meta(&fs_path.to_string_lossy(), &meta),
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    async fn make_dir(&self, rel_path: &str) -> Result<(), StoreError> {
        let mut builder = tokio::fs::DirBuilder::new();
        builder.recursive(true);
        #[cfg(unix)]
        builder.mode(self.dir_mode);
        builder.create(self.fs_path(rel_path)).await?;
        Ok(())
    }

    async fn read_file(&self, rel_path: &str) -> Result<ByteReader, StoreError> {
        let file = tokio::fs::File::open(self.fs_path(rel_path)).await?;
        Ok(Box::new(file))
    }

    async fn write_file(
        &self,
        rel_path: &str,
        mut source: ByteReader,
        _size: i64,
    ) -> Result<(), StoreError> {
        let mut options = OpenOptions::new();
        options.create(true).write(true).truncate(true);
        #[cfg(unix)]
        options.mode(self.file_mode);
        let mut file = options.open(self.fs_path(rel_path)).await?;
        tokio::io::copy(&mut source, &mut file).await?;
        file.flush().await?;
        Ok(())
    }

    async fn move_file(&self, src_rel: &str, dst_rel: &str) -> Result<(), StoreError> {
        tokio::fs::rename(self.fs_path(src_rel), self.fs_path(dst_rel)).await?;
        Ok(())
    }

    async fn delete_file(&self, rel_path: &str) -> Result<(), StoreError> {
        tokio::fs::remove_file(self.fs_path(rel_path)).await?;
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
    use tempfile::tempdir;

    fn store_for(base: &Path) -> LocalStore {
        LocalStore::new(&LocalOptions::default(), &base.to_string_lossy())
    }

    #[tokio::test]
    async fn read_tree_lists_relative_canonical_paths() {
        let dir = tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        std::fs::write(dir.path().join("sub/a.txt"), b"hello").unwrap();

        let snapshot = store_for(dir.path()).read_tree().await.unwrap();
        let keys: Vec<&str> = snapshot.children.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["/", "/sub/", "/sub/a.txt"]);

        let file = &snapshot.children["/sub/a.txt"];
        assert_eq!(file.size, 5);
        assert!(!file.is_dir);
        assert!(file.mod_time.is_some());
    }

    #[tokio::test]
    async fn missing_base_reads_as_empty_tree() {
        let dir = tempdir().unwrap();
        let store = store_for(&dir.path().join("not-there"));
        let snapshot = store.read_tree().await.unwrap();
        assert!(snapshot.children.is_empty());
    }

    #[tokio::test]
    async fn write_then_read_round_trips() {
        let dir = tempdir().unwrap();
        let store = store_for(dir.path());

        let source: ByteReader = Box::new(std::io::Cursor::new(b"payload".to_vec()));
        store.write_file("/out.bin", source, 7).await.unwrap();

        let resource = store.read_resource("/out.bin").await.unwrap().unwrap();
        assert_eq!(resource.size, 7);

        let mut reader = store.read_file("/out.bin").await.unwrap();
        let mut content = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut reader, &mut content)
            .await
            .unwrap();
        assert_eq!(content, b"payload");
    }

    #[tokio::test]
    async fn move_renames_and_delete_removes() {
        let dir = tempdir().unwrap();
        let store = store_for(dir.path());
        std::fs::write(dir.path().join("a.txt"), b"x").unwrap();

        store.move_file("/a.txt", "/b.txt").await.unwrap();
        assert!(store.read_resource("/a.txt").await.unwrap().is_none());
        assert!(store.read_resource("/b.txt").await.unwrap().is_some());

        store.delete_file("/b.txt").await.unwrap();
        assert!(store.read_resource("/b.txt").await.unwrap().is_none());
    }
}
