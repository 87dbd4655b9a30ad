//! One-way synchronization: input tree wins, output tree follows.
//!
//! Phases run strictly in order: read both trees, diff, create missing
//! directories (ancestors first), upload files through a bounded worker
//! pool, then optionally delete extraneous output files. Workers publish
//! terminal errors to a channel and keep draining; nothing inside a
//! phase aborts the run.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use davmirror_core::paths;

use super::progress::{HashingReader, ReaderProgress, format_bytes, hex};
use crate::store::{Resource, Store, StoreError, TreeSnapshot};

const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_UPLOAD_PATH_FORMAT: &str = "/ucam-%x.bin";

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("upload not complete: {read} of {total} bytes")]
    UploadIncomplete { read: i64, total: i64 },
    #[error("written {algo} not matched ({read} -> {written}) at {path}")]
    HashMismatch {
        algo: &'static str,
        read: String,
        written: String,
        path: String,
    },
    #[error("uploaded size not matched ({expected} -> {written}) at {path}")]
    SizeMismatch {
        expected: i64,
        written: i64,
        path: String,
    },
    #[error("uploaded but not found after {timeout:?} at {path}")]
    CheckTimeout { path: String, timeout: Duration },
}

impl SyncError {
    /// Hash mismatches indicate corruption, not publication lag; the
    /// verification poll loop must not keep waiting on them.
    fn is_terminal(&self) -> bool {
        matches!(self, SyncError::HashMismatch { .. })
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Skip paths present on both sides without comparing content.
    pub ignore_existing: bool,
    /// Upload to a content-addressed staging path, then rename.
    pub indirect_upload: bool,
    /// Staging path template; `%x` expands to a hex SHA-256 digest.
    pub upload_path_format: String,
    pub allow_delete: bool,
    /// Files larger than this serialize against each other. `<= 0`
    /// disables the gate.
    pub single_threaded_file_size: i64,
    pub thread_count: usize,
    pub attempt_max: u32,
    pub attempt_delay: Duration,
    pub upload_check_timeout: Duration,
    pub upload_check_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            ignore_existing: true,
            indirect_upload: true,
            upload_path_format: DEFAULT_UPLOAD_PATH_FORMAT.to_string(),
            allow_delete: false,
            single_threaded_file_size: 64 * 1024 * 1024,
            thread_count: 4,
            attempt_max: 3,
            attempt_delay: Duration::from_secs(30),
            upload_check_timeout: Duration::from_secs(30 * 60),
            upload_check_delay: Duration::from_secs(10),
        }
    }
}

impl SyncOptions {
    pub fn normalized(mut self) -> Self {
        if self.upload_path_format.is_empty() {
            self.upload_path_format = DEFAULT_UPLOAD_PATH_FORMAT.to_string();
        }
        self.thread_count = self.thread_count.max(1);
        self.attempt_max = self.attempt_max.max(1);
        self.attempt_delay = self.attempt_delay.max(Duration::from_secs(1));
        self.upload_check_timeout = self.upload_check_timeout.max(Duration::from_secs(1));
        self.upload_check_delay = self.upload_check_delay.max(Duration::from_secs(1));
        self
    }
}

#[derive(Clone)]
pub struct OneWaySync {
    input: Arc<dyn Store>,
    output: Arc<dyn Store>,
    options: SyncOptions,
    errors: mpsc::Sender<SyncError>,
    single_upload: Arc<AsyncMutex<()>>,
}

impl OneWaySync {
    pub fn new(
        input: Arc<dyn Store>,
        output: Arc<dyn Store>,
        options: SyncOptions,
        errors: mpsc::Sender<SyncError>,
    ) -> Self {
        Self {
            input,
            output,
            options: options.normalized(),
            errors,
            single_upload: Arc::new(AsyncMutex::new(())),
        }
    }

    pub async fn run(&self) {
        let Some((input_tree, output_tree)) = self.read_trees().await else {
            return;
        };
        let (both, add, del) = self.diff(&input_tree, &output_tree);
        self.make_dirs(&output_tree, &both, &add).await;
        self.upload_files(&input_tree, &both, &add).await;
        self.delete_files(&output_tree, &del).await;
    }

    async fn read_trees(&self) -> Option<(TreeSnapshot, TreeSnapshot)> {
        info!("reading input and output trees");
        let (input_tree, output_tree) =
            tokio::join!(self.input.read_tree(), self.output.read_tree());
        let input_tree = match input_tree {
            Ok(tree) => Some(tree),
            Err(err) => {
                self.publish(err.into()).await;
                None
            }
        };
        let output_tree = match output_tree {
            Ok(tree) => Some(tree),
            Err(err) => {
                self.publish(err.into()).await;
                None
            }
        };
        Some((input_tree?, output_tree?))
    }

    fn diff(
        &self,
        input_tree: &TreeSnapshot,
        output_tree: &TreeSnapshot,
    ) -> (Vec<String>, Vec<String>, Vec<String>) {
        let (both, add, del) =
            paths::diff(&input_tree.child_paths(), &output_tree.child_paths());
        info!(
            both = both.len(),
            add = add.len(),
            del = del.len(),
            "path diff computed"
        );
        for path in &both {
            debug!(path = %path, "diff: both");
        }
        for path in &add {
            debug!(path = %path, "diff: add");
        }
        for path in &del {
            debug!(path = %path, "diff: del");
        }
        (both, add, del)
    }

    async fn make_dirs(&self, output_tree: &TreeSnapshot, both: &[String], add: &[String]) {
        let both_dirs = paths::sorted_dirs(both);
        let add_dirs = paths::sorted_dirs(add);
        let (_, dirs_to_add, _) = paths::diff(&add_dirs, &both_dirs);
        if dirs_to_add.is_empty() {
            info!("no directories to create");
            return;
        }
        let mut created: BTreeSet<String> = BTreeSet::new();
        for dir in dirs_to_add {
            if created.contains(&dir) {
                continue;
            }
            if output_tree
                .children
                .get(&dir)
                .is_some_and(|existing| existing.is_dir)
            {
                continue;
            }
            if output_tree.parents.contains_key(&self.output.to_abs(&dir)) {
                continue;
            }
            info!(path = %dir, "make dir");
            match self.output.make_dir(&dir).await {
                Ok(()) | Err(StoreError::AlreadyExists(_)) => {
                    created.insert(dir);
                }
                Err(err) => self.publish(err.into()).await,
            }
        }
    }

    async fn upload_files(&self, input_tree: &TreeSnapshot, both: &[String], add: &[String]) {
        let mut candidates: Vec<String> = add.to_vec();
        if !self.options.ignore_existing {
            candidates.extend_from_slice(both);
        }
        let mut files: Vec<(String, Resource)> = candidates
            .into_iter()
            .filter_map(|path| {
                let resource = input_tree.children.get(&path)?;
                (!resource.is_dir).then(|| (path, resource.clone()))
            })
            .collect();
        files.sort_by(|a, b| a.0.cmp(&b.0));

        let total = files.len();
        if total == 0 {
            info!("nothing to upload");
            return;
        }
        info!(total, threads = self.options.thread_count, "uploading files");

        let queue = Arc::new(StdMutex::new(VecDeque::from(files)));
        let handled = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();
        for worker in 0..self.options.thread_count {
            let engine = self.clone();
            let queue = queue.clone();
            let handled = handled.clone();
            workers.spawn(async move {
                loop {
                    let next = queue.lock().expect("upload queue poisoned").pop_front();
                    let Some((path, resource)) = next else {
                        break;
                    };
                    let mut outcome: Result<(), SyncError> = Ok(());
                    for attempt in 1..=engine.options.attempt_max {
                        debug!(
                            worker,
                            path = %path,
                            attempt,
                            max = engine.options.attempt_max,
                            "upload attempt"
                        );
                        outcome = engine.upload_file(&path, &resource, worker).await;
                        match &outcome {
                            Ok(()) => break,
                            Err(err) => {
                                warn!(
                                    worker,
                                    path = %path,
                                    attempt,
                                    max = engine.options.attempt_max,
                                    "upload attempt failed: {err}"
                                );
                                tokio::time::sleep(engine.options.attempt_delay).await;
                            }
                        }
                    }
                    let done = handled.fetch_add(1, Ordering::AcqRel) + 1;
                    match outcome {
                        Ok(()) => info!(
                            worker,
                            path = %path,
                            "U {} complete",
                            phase_progress(done, total)
                        ),
                        Err(err) => {
                            error!(worker, path = %path, "U {} ERROR: {err}", phase_progress(done, total));
                            engine.publish(err).await;
                        }
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}
        info!("upload files complete");
    }

    async fn upload_file(
        &self,
        path: &str,
        resource: &Resource,
        worker: usize,
    ) -> Result<(), SyncError> {
        // The gate is taken unconditionally and released immediately for
        // regular files, so oversize uploads serialize against each other
        // while small ones pass through.
        let parked: Arc<StdMutex<Option<OwnedMutexGuard<()>>>> = Arc::new(StdMutex::new(None));
        let guard = self.single_upload.clone().lock_owned().await;
        if self.needs_single_thread(resource) {
            info!(
                worker,
                path,
                size = %format_bytes(resource.size),
                "single-threaded upload begin"
            );
            *parked.lock().expect("single-thread gate poisoned") = Some(guard);
        } else {
            drop(guard);
        }

        let upload_path = self.upload_path_for(path, resource);
        if upload_path != path {
            info!(worker, path, staging = %upload_path, "uploading via staging path");
        }

        let source = match self.input.read_file(path).await {
            Ok(reader) => reader,
            Err(err) => {
                release_single_thread(&parked, worker, path);
                return Err(err.into());
            }
        };

        let mut reader = HashingReader::new(source, resource.size);
        let progress = reader.progress();
        {
            let log_path = path.to_string();
            let last_log = StdMutex::new(Instant::now());
            reader.on_progress(move |p| {
                let mut last = last_log.lock().expect("progress log poisoned");
                if last.elapsed() >= PROGRESS_LOG_INTERVAL {
                    *last = Instant::now();
                    info!(
                        worker,
                        path = %log_path,
                        "{:.2}% ({} / {})",
                        100.0 * p.progress(),
                        format_bytes(p.bytes_read()),
                        format_bytes(p.bytes_total())
                    );
                }
            });
        }
        {
            let parked = parked.clone();
            let log_path = path.to_string();
            reader.on_complete(move |p| {
                info!(
                    worker,
                    path = %log_path,
                    "{:.2}% ({} / {})",
                    100.0 * p.progress(),
                    format_bytes(p.bytes_read()),
                    format_bytes(p.bytes_total())
                );
                release_single_thread(&parked, worker, &log_path);
            });
        }

        let written = self
            .output
            .write_file(&upload_path, Box::new(reader), resource.size)
            .await;
        release_single_thread(&parked, worker, path);

        if let Err(err) = written {
            // a trailing EOF from the transport is fine once every byte
            // was handed over; verification settles the rest
            if !(progress.is_complete() && is_eof_error(&err)) {
                return Err(err.into());
            }
            warn!(worker, path, "write ended with eof after full read: {err}");
        }

        debug!(
            worker,
            path,
            bytes = progress.bytes_read(),
            md5 = %progress.hash_md5(),
            sha256 = %progress.hash_sha256(),
            "upload digests"
        );

        self.check_uploaded(&upload_path, resource, &progress, worker)
            .await?;

        if upload_path != path {
            info!(worker, path, staging = %upload_path, "moving into place");
            self.output.move_file(&upload_path, path).await?;
        }
        Ok(())
    }

    async fn check_uploaded(
        &self,
        upload_path: &str,
        resource: &Resource,
        progress: &ReaderProgress,
        worker: usize,
    ) -> Result<(), SyncError> {
        if !progress.is_complete() {
            return Err(SyncError::UploadIncomplete {
                read: progress.bytes_read(),
                total: progress.bytes_total(),
            });
        }
        let timeout = self.options.upload_check_timeout;
        let started = Instant::now();
        let mut last_err: Option<SyncError> = None;
        while started.elapsed() < timeout {
            debug!(worker, path = %upload_path, elapsed = ?started.elapsed(), "checking upload");
            match self.output.read_resource(upload_path).await {
                Err(err) => last_err = Some(err.into()),
                Ok(None) => last_err = None,
                Ok(Some(written)) => {
                    match check_written(&written, resource, progress, upload_path) {
                        Ok(verdict) => {
                            info!(worker, path = %upload_path, "{verdict}");
                            return Ok(());
                        }
                        Err(err) if err.is_terminal() => return Err(err),
                        Err(err) => last_err = Some(err),
                    }
                }
            }
            tokio::time::sleep(self.options.upload_check_delay).await;
        }
        Err(last_err.unwrap_or_else(|| SyncError::CheckTimeout {
            path: upload_path.to_string(),
            timeout,
        }))
    }

    async fn delete_files(&self, output_tree: &TreeSnapshot, del: &[String]) {
        if !self.options.allow_delete {
            info!("deleting disabled, skipping");
            return;
        }
        // directories are never deleted, only files
        let files: Vec<String> = paths::sorted(
            &del.iter()
                .filter(|path| {
                    output_tree
                        .children
                        .get(*path)
                        .is_some_and(|resource| !resource.is_dir)
                })
                .cloned()
                .collect::<Vec<_>>(),
        );
        let total = files.len();
        if total == 0 {
            info!("nothing to delete");
            return;
        }
        info!(total, threads = self.options.thread_count, "deleting files");

        let queue = Arc::new(StdMutex::new(VecDeque::from(files)));
        let handled = Arc::new(AtomicUsize::new(0));
        let mut workers = JoinSet::new();
        for worker in 0..self.options.thread_count {
            let engine = self.clone();
            let queue = queue.clone();
            let handled = handled.clone();
            workers.spawn(async move {
                loop {
                    let next = queue.lock().expect("delete queue poisoned").pop_front();
                    let Some(path) = next else {
                        break;
                    };
                    let mut outcome: Result<(), SyncError> = Ok(());
                    for attempt in 1..=engine.options.attempt_max {
                        debug!(worker, path = %path, attempt, "delete attempt");
                        outcome = engine
                            .output
                            .delete_file(&path)
                            .await
                            .map_err(SyncError::from);
                        match &outcome {
                            Ok(()) => break,
                            Err(err) => {
                                warn!(worker, path = %path, attempt, "delete attempt failed: {err}");
                                tokio::time::sleep(engine.options.attempt_delay).await;
                            }
                        }
                    }
                    let done = handled.fetch_add(1, Ordering::AcqRel) + 1;
                    match outcome {
                        Ok(()) => info!(
                            worker,
                            path = %path,
                            "D {} complete",
                            phase_progress(done, total)
                        ),
                        Err(err) => {
                            error!(worker, path = %path, "D {} ERROR: {err}", phase_progress(done, total));
                            engine.publish(err).await;
                        }
                    }
                }
            });
        }
        while workers.join_next().await.is_some() {}
        info!("delete files complete");
    }

    fn needs_single_thread(&self, resource: &Resource) -> bool {
        self.options.single_threaded_file_size > 0
            && resource.size > self.options.single_threaded_file_size
    }

    fn upload_path_for(&self, path: &str, resource: &Resource) -> String {
        if !self.options.indirect_upload {
            return path.to_string();
        }
        let mut hasher = Sha256::new();
        hasher.update(format!("{path}:{}", resource.size).as_bytes());
        let digest = hex(hasher.finalize().as_slice());
        if self.options.upload_path_format.contains("%x") {
            self.options.upload_path_format.replacen("%x", &digest, 1)
        } else {
            self.options.upload_path_format.clone()
        }
    }

    async fn publish(&self, err: SyncError) {
        if self.errors.send(err).await.is_err() {
            warn!("error listener is gone");
        }
    }
}

/// Verification priority: strict sha256, strict md5, any-hash matches,
/// size fallback for backends with no hash metadata.
fn check_written(
    written: &Resource,
    input: &Resource,
    progress: &ReaderProgress,
    path: &str,
) -> Result<&'static str, SyncError> {
    let read_sha256 = progress.hash_sha256();
    if let Some(written_sha256) = written.hash_sha256.as_deref().filter(|h| !h.is_empty()) {
        if written_sha256 == read_sha256 {
            return Ok("check ok: sha256 strict match");
        }
        return Err(SyncError::HashMismatch {
            algo: "sha256",
            read: read_sha256,
            written: written_sha256.to_string(),
            path: path.to_string(),
        });
    }
    let read_md5 = progress.hash_md5();
    if let Some(written_md5) = written.hash_md5.as_deref().filter(|h| !h.is_empty()) {
        if written_md5 == read_md5 {
            return Ok("check ok: md5 strict match");
        }
        return Err(SyncError::HashMismatch {
            algo: "md5",
            read: read_md5,
            written: written_md5.to_string(),
            path: path.to_string(),
        });
    }
    if written.matches_any_hash(&read_sha256) {
        return Ok("check ok: sha256 match");
    }
    if written.matches_any_hash(&read_md5) {
        return Ok("check ok: md5 match");
    }
    if written.size == input.size && input.size == progress.bytes_read() {
        return Ok("check ok: size match");
    }
    Err(SyncError::SizeMismatch {
        expected: input.size,
        written: written.size,
        path: path.to_string(),
    })
}

fn release_single_thread(
    parked: &StdMutex<Option<OwnedMutexGuard<()>>>,
    worker: usize,
    path: &str,
) {
    if parked
        .lock()
        .expect("single-thread gate poisoned")
        .take()
        .is_some()
    {
        info!(worker, path, "single-threaded upload end");
    }
}

fn phase_progress(handled: usize, total: usize) -> String {
    let percent = if total > 0 {
        100.0 * handled as f64 / total as f64
    } else {
        0.0
    };
    format!("{percent:.2}% ({handled}/{total})")
}

/// True when the error chain bottoms out in an unexpected-EOF I/O error.
fn is_eof_error(err: &StoreError) -> bool {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(io_err) = current.downcast_ref::<std::io::Error>() {
            if io_err.kind() == std::io::ErrorKind::UnexpectedEof {
                return true;
            }
        }
        source = current.source();
    }
    false
}
