//! End-to-end engine scenarios over an in-memory store pair.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;

use davmirror::store::{ByteReader, Resource, Store, StoreError, TreeSnapshot};
use davmirror::sync::{OneWaySync, SyncError, SyncOptions};

#[derive(Default)]
struct MemoryStore {
    dirs: Mutex<BTreeSet<String>>,
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    size_overrides: Mutex<BTreeMap<String, i64>>,
    expose_md5: bool,
    expose_sha256: bool,
    /// stat calls answering "not found" before the file becomes visible
    hidden_stats: AtomicI32,
    /// next stat reports a corrupted md5
    corrupt_md5_once: AtomicBool,
    write_log: Mutex<Vec<String>>,
    dir_log: Mutex<Vec<String>>,
    stat_calls: AtomicUsize,
    move_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MemoryStore {
    fn with_dir(self, path: &str) -> Self {
        self.dirs.lock().unwrap().insert(path.to_string());
        self
    }

    fn with_file(self, path: &str, content: &[u8]) -> Self {
        self.files
            .lock()
            .unwrap()
            .insert(path.to_string(), content.to_vec());
        self
    }

    fn written_paths(&self) -> Vec<String> {
        self.write_log.lock().unwrap().clone()
    }

    fn created_dirs(&self) -> Vec<String> {
        self.dir_log.lock().unwrap().clone()
    }

    fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn file_resource(&self, path: &str, content: &[u8]) -> Resource {
        let size = self
            .size_overrides
            .lock()
            .unwrap()
            .get(path)
            .copied()
            .unwrap_or(content.len() as i64);
        let md5 = if self.expose_md5 {
            if self.corrupt_md5_once.swap(false, Ordering::SeqCst) {
                Some("deadbeef".to_string())
            } else {
                Some(format!("{:x}", md5::compute(content)))
            }
        } else {
            None
        };
        let sha256 = if self.expose_sha256 {
            let mut hasher = Sha256::new();
            hasher.update(content);
            Some(
                hasher
                    .finalize()
                    .iter()
                    .map(|b| format!("{b:02x}"))
                    .collect(),
            )
        } else {
            None
        };
        Resource {
            path: path.to_string(),
            abs_path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or("").to_string(),
            is_dir: false,
            size,
            hash_md5: md5,
            hash_sha256: sha256,
            ..Resource::default()
        }
    }

    fn dir_resource(&self, path: &str) -> Resource {
        Resource {
            path: path.to_string(),
            abs_path: path.to_string(),
            is_dir: true,
            ..Resource::default()
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn read_tree(&self) -> Result<TreeSnapshot, StoreError> {
        let mut snapshot = TreeSnapshot::default();
        for dir in self.dirs.lock().unwrap().iter() {
            snapshot.children.insert(dir.clone(), self.dir_resource(dir));
        }
        for (path, content) in self.files.lock().unwrap().iter() {
            snapshot
                .children
                .insert(path.clone(), self.file_resource(path, content));
        }
        Ok(snapshot)
    }

    async fn read_resource(&self, rel_path: &str) -> Result<Option<Resource>, StoreError> {
        self.stat_calls.fetch_add(1, Ordering::SeqCst);
        if self.hidden_stats.fetch_sub(1, Ordering::SeqCst) > 0 {
            return Ok(None);
        }
        if self.dirs.lock().unwrap().contains(rel_path) {
            return Ok(Some(self.dir_resource(rel_path)));
        }
        match self.files.lock().unwrap().get(rel_path) {
            Some(content) => Ok(Some(self.file_resource(rel_path, content))),
            None => Ok(None),
        }
    }

    async fn make_dir(&self, rel_path: &str) -> Result<(), StoreError> {
        self.dir_log.lock().unwrap().push(rel_path.to_string());
        self.dirs.lock().unwrap().insert(rel_path.to_string());
        Ok(())
    }

    async fn read_file(&self, rel_path: &str) -> Result<ByteReader, StoreError> {
        let content = self
            .files
            .lock()
            .unwrap()
            .get(rel_path)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(rel_path.to_string()))?;
        Ok(Box::new(std::io::Cursor::new(content)))
    }

    async fn write_file(
        &self,
        rel_path: &str,
        mut source: ByteReader,
        _size: i64,
    ) -> Result<(), StoreError> {
        let mut content = Vec::new();
        tokio::io::AsyncReadExt::read_to_end(&mut source, &mut content).await?;
        self.write_log.lock().unwrap().push(rel_path.to_string());
        self.files
            .lock()
            .unwrap()
            .insert(rel_path.to_string(), content);
        Ok(())
    }

    async fn move_file(&self, src_rel: &str, dst_rel: &str) -> Result<(), StoreError> {
        self.move_calls.fetch_add(1, Ordering::SeqCst);
        let content = self
            .files
            .lock()
            .unwrap()
            .remove(src_rel)
            .ok_or_else(|| StoreError::NotFound(src_rel.to_string()))?;
        self.files
            .lock()
            .unwrap()
            .insert(dst_rel.to_string(), content);
        Ok(())
    }

    async fn delete_file(&self, rel_path: &str) -> Result<(), StoreError> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        self.files
            .lock()
            .unwrap()
            .remove(rel_path)
            .ok_or_else(|| StoreError::NotFound(rel_path.to_string()))?;
        Ok(())
    }

    fn to_abs(&self, rel_path: &str) -> String {
        rel_path.to_string()
    }

    fn to_rel(&self, abs_path: &str) -> String {
        abs_path.to_string()
    }
}

fn quick_options() -> SyncOptions {
    SyncOptions {
        ignore_existing: true,
        indirect_upload: false,
        allow_delete: false,
        thread_count: 1,
        attempt_max: 1,
        attempt_delay: Duration::from_secs(1),
        upload_check_timeout: Duration::from_secs(10),
        upload_check_delay: Duration::from_secs(1),
        ..SyncOptions::default()
    }
}

async fn run_sync(
    input: Arc<MemoryStore>,
    output: Arc<MemoryStore>,
    options: SyncOptions,
) -> Vec<SyncError> {
    let (errors_tx, mut errors_rx) = mpsc::channel(8);
    let engine = OneWaySync::new(input, output, options, errors_tx);
    engine.run().await;
    drop(engine);
    let mut errors = Vec::new();
    while let Some(err) = errors_rx.recv().await {
        errors.push(err);
    }
    errors
}

#[tokio::test(start_paused = true)]
async fn fresh_copy_creates_dirs_then_uploads() {
    let input = Arc::new(
        MemoryStore::default()
            .with_dir("/")
            .with_dir("/a/")
            .with_file("/a/b.txt", b"hello world"),
    );
    let output = Arc::new(MemoryStore {
        expose_sha256: true,
        ..MemoryStore::default()
    });

    let errors = run_sync(input, output.clone(), quick_options()).await;

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(output.file("/a/b.txt").unwrap(), b"hello world");
    // ancestors strictly before descendants
    assert_eq!(output.created_dirs(), vec!["/", "/a/"]);
    assert_eq!(output.written_paths(), vec!["/a/b.txt"]);
    assert_eq!(output.move_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn existing_paths_are_skipped() {
    let input = Arc::new(
        MemoryStore::default()
            .with_dir("/")
            .with_dir("/a/")
            .with_file("/a/b.txt", b"hello world"),
    );
    let output = Arc::new(
        MemoryStore::default()
            .with_dir("/")
            .with_dir("/a/")
            .with_file("/a/b.txt", b"hello world"),
    );

    let errors = run_sync(input, output.clone(), quick_options()).await;

    assert!(errors.is_empty());
    assert!(output.written_paths().is_empty());
    assert!(output.created_dirs().is_empty());
    assert_eq!(output.move_calls.load(Ordering::SeqCst), 0);
    assert_eq!(output.delete_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn indirect_upload_stages_then_moves_with_size_verification() {
    let payload = vec![7u8; 4096];
    let input = Arc::new(
        MemoryStore::default()
            .with_dir("/")
            .with_dir("/docs/")
            .with_file("/docs/r.bin", &payload),
    );
    // no hashes exposed: verification falls back to size comparison
    let output = Arc::new(MemoryStore::default());

    let options = SyncOptions {
        indirect_upload: true,
        upload_path_format: "/tmp/u-%x.bin".to_string(),
        ..quick_options()
    };
    let errors = run_sync(input, output.clone(), options).await;

    let mut hasher = Sha256::new();
    hasher.update(b"/docs/r.bin:4096");
    let digest: String = hasher
        .finalize()
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect();
    let staging = format!("/tmp/u-{digest}.bin");

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(output.written_paths(), vec![staging.clone()]);
    assert_eq!(output.move_calls.load(Ordering::SeqCst), 1);
    assert_eq!(output.file("/docs/r.bin").unwrap(), payload);
    assert!(output.file(&staging).is_none());
}

#[tokio::test(start_paused = true)]
async fn verification_waits_for_delayed_visibility() {
    let input = Arc::new(
        MemoryStore::default()
            .with_dir("/")
            .with_file("/slow.txt", b"eventually"),
    );
    let output = Arc::new(MemoryStore {
        expose_sha256: true,
        hidden_stats: AtomicI32::new(1),
        ..MemoryStore::default()
    });

    let errors = run_sync(input, output.clone(), quick_options()).await;

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(output.written_paths().len(), 1);
    // first poll missed, second succeeded
    assert_eq!(output.stat_calls.load(Ordering::SeqCst), 2);
}

#[tokio::test(start_paused = true)]
async fn hash_mismatch_fails_attempt_and_outer_retry_succeeds() {
    let input = Arc::new(
        MemoryStore::default()
            .with_dir("/")
            .with_file("/c.txt", b"content"),
    );
    let output = Arc::new(MemoryStore {
        expose_md5: true,
        corrupt_md5_once: AtomicBool::new(true),
        ..MemoryStore::default()
    });

    let options = SyncOptions {
        attempt_max: 2,
        ..quick_options()
    };
    let errors = run_sync(input, output.clone(), options).await;

    assert!(errors.is_empty(), "second attempt should succeed: {errors:?}");
    assert_eq!(output.written_paths().len(), 2);
    assert_eq!(output.file("/c.txt").unwrap(), b"content");
}

#[tokio::test(start_paused = true)]
async fn incomplete_upload_is_published_as_error() {
    let input = Arc::new(
        MemoryStore::default()
            .with_dir("/")
            .with_file("/short.bin", b"12345"),
    );
    // the tree promises more bytes than the stream delivers
    input
        .size_overrides
        .lock()
        .unwrap()
        .insert("/short.bin".to_string(), 10);
    let output = Arc::new(MemoryStore::default());

    let errors = run_sync(input, output.clone(), quick_options()).await;

    assert_eq!(errors.len(), 1);
    assert!(matches!(
        errors[0],
        SyncError::UploadIncomplete { read: 5, total: 10 }
    ));
    assert_eq!(output.move_calls.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn delete_phase_removes_files_but_never_directories() {
    let input = Arc::new(MemoryStore::default().with_dir("/"));
    let output = Arc::new(
        MemoryStore::default()
            .with_dir("/")
            .with_dir("/olddir/")
            .with_file("/old.txt", b"stale"),
    );

    let options = SyncOptions {
        allow_delete: true,
        ..quick_options()
    };
    let errors = run_sync(input, output.clone(), options).await;

    assert!(errors.is_empty());
    assert_eq!(output.delete_calls.load(Ordering::SeqCst), 1);
    assert!(output.file("/old.txt").is_none());
    assert!(output.dirs.lock().unwrap().contains("/olddir/"));
}

#[tokio::test(start_paused = true)]
async fn existing_paths_reupload_when_not_ignored() {
    let input = Arc::new(
        MemoryStore::default()
            .with_dir("/")
            .with_file("/a.txt", b"new content"),
    );
    let output = Arc::new(MemoryStore {
        expose_sha256: true,
        ..MemoryStore::default()
    });
    {
        let mut dirs = output.dirs.lock().unwrap();
        dirs.insert("/".to_string());
    }
    output
        .files
        .lock()
        .unwrap()
        .insert("/a.txt".to_string(), b"old".to_vec());

    let options = SyncOptions {
        ignore_existing: false,
        ..quick_options()
    };
    let errors = run_sync(input, output.clone(), options).await;

    assert!(errors.is_empty(), "unexpected errors: {errors:?}");
    assert_eq!(output.written_paths(), vec!["/a.txt"]);
    assert_eq!(output.file("/a.txt").unwrap(), b"new content");
}
