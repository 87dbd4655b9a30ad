//! Streaming hash/progress instrumentation for uploads.
//!
//! [`HashingReader`] wraps the source stream of an upload; the paired
//! [`ReaderProgress`] handle keeps the counters and digests observable
//! after the reader itself has been consumed by `write_file`.

use std::fmt::Write as _;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::task::{Context, Poll};

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, ReadBuf};

use crate::store::ByteReader;

type Callback = Box<dyn FnMut(&ReaderProgress) + Send>;

struct Digests {
    md5: md5::Context,
    sha256: Sha256,
}

struct SharedState {
    bytes_total: i64,
    bytes_read: AtomicI64,
    complete: AtomicBool,
    digests: Mutex<Digests>,
}

pub struct HashingReader {
    inner: ByteReader,
    shared: Arc<SharedState>,
    on_progress: Option<Callback>,
    on_complete: Option<Callback>,
}

impl HashingReader {
    /// `bytes_total <= 0` means the payload size is unknown; such a
    /// reader never reports completion.
    pub fn new(inner: ByteReader, bytes_total: i64) -> Self {
        Self {
            inner,
            shared: Arc::new(SharedState {
                bytes_total,
                bytes_read: AtomicI64::new(0),
                complete: AtomicBool::new(false),
                digests: Mutex::new(Digests {
                    md5: md5::Context::new(),
                    sha256: Sha256::new(),
                }),
            }),
            on_progress: None,
            on_complete: None,
        }
    }

    /// Observer handle that outlives the reader.
    pub fn progress(&self) -> ReaderProgress {
        ReaderProgress {
            shared: self.shared.clone(),
        }
    }

    /// Fired after every read.
    pub fn on_progress(&mut self, callback: impl FnMut(&ReaderProgress) + Send + 'static) {
        self.on_progress = Some(Box::new(callback));
    }

    /// Fired exactly once, when `bytes_read` first reaches `bytes_total`.
    pub fn on_complete(&mut self, callback: impl FnMut(&ReaderProgress) + Send + 'static) {
        self.on_complete = Some(Box::new(callback));
    }
}

impl AsyncRead for HashingReader {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        match Pin::new(&mut this.inner).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let data = &buf.filled()[before..];
                if !data.is_empty() {
                    let mut digests = this.shared.digests.lock().expect("digest mutex poisoned");
                    digests.md5.consume(data);
                    digests.sha256.update(data);
                    this.shared
                        .bytes_read
                        .fetch_add(data.len() as i64, Ordering::AcqRel);
                }
                let handle = ReaderProgress {
                    shared: this.shared.clone(),
                };
                if let Some(callback) = this.on_progress.as_mut() {
                    callback(&handle);
                }
                let total = this.shared.bytes_total;
                if total > 0
                    && this.shared.bytes_read.load(Ordering::Acquire) >= total
                    && !this.shared.complete.swap(true, Ordering::AcqRel)
                {
                    if let Some(callback) = this.on_complete.as_mut() {
                        callback(&handle);
                    }
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// Shared view of a [`HashingReader`]'s counters and digests.
#[derive(Clone)]
pub struct ReaderProgress {
    shared: Arc<SharedState>,
}

impl ReaderProgress {
    pub fn bytes_read(&self) -> i64 {
        self.shared.bytes_read.load(Ordering::Acquire)
    }

    pub fn bytes_total(&self) -> i64 {
        self.shared.bytes_total
    }

    /// Latches true once all expected bytes were delivered.
    pub fn is_complete(&self) -> bool {
        self.shared.complete.load(Ordering::Acquire)
    }

    pub fn progress(&self) -> f64 {
        let read = self.bytes_read();
        let total = self.bytes_total();
        if total <= 0 || read <= 0 {
            return 0.0;
        }
        read as f64 / total as f64
    }

    /// Hex MD5 of everything read so far, without finalizing the stream.
    pub fn hash_md5(&self) -> String {
        let digests = self.shared.digests.lock().expect("digest mutex poisoned");
        hex(&digests.md5.clone().compute().0)
    }

    /// Hex SHA-256 of everything read so far, without finalizing.
    pub fn hash_sha256(&self) -> String {
        let digests = self.shared.digests.lock().expect("digest mutex poisoned");
        hex(digests.sha256.clone().finalize().as_slice())
    }
}

pub fn hex(bytes: &[u8]) -> String {
    bytes.iter().fold(
        String::with_capacity(bytes.len() * 2),
        |mut out, byte| {
            let _ = write!(out, "{byte:02x}");
            out
        },
    )
}

/// Human byte count: `512 B`, `1.5 KiB`, `2.0 MiB`, ...
pub fn format_bytes(size: i64) -> String {
    if size < 1024 {
        return format!("{size} B");
    }
    const SUFFIXES: [&str; 7] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB", "EiB"];
    let mut rest = size;
    let mut mul = 1i64;
    let mut exp = 0usize;
    while rest >> 10 > 0 && exp < SUFFIXES.len() - 1 {
        rest >>= 10;
        mul <<= 10;
        exp += 1;
    }
    format!("{:.1} {}", size as f64 / mul as f64, SUFFIXES[exp])
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::AsyncReadExt;

    fn reader_over(data: &[u8], total: i64) -> HashingReader {
        HashingReader::new(Box::new(std::io::Cursor::new(data.to_vec())), total)
    }

    #[tokio::test]
    async fn digests_match_known_vectors() {
        let mut reader = reader_over(b"hello world", 11);
        let progress = reader.progress();
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();

        assert_eq!(progress.bytes_read(), 11);
        assert!(progress.is_complete());
        assert_eq!(progress.progress(), 1.0);
        assert_eq!(progress.hash_md5(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
        assert_eq!(
            progress.hash_sha256(),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[tokio::test]
    async fn digest_snapshots_do_not_finalize() {
        let mut reader = reader_over(b"hello world", 11);
        let progress = reader.progress();
        let mut first = [0u8; 5];
        reader.read_exact(&mut first).await.unwrap();

        // "hello" so far
        assert_eq!(progress.hash_md5(), "5d41402abc4b2a76b9719d911017c592");
        assert!(!progress.is_complete());

        let mut rest = Vec::new();
        reader.read_to_end(&mut rest).await.unwrap();
        assert_eq!(progress.hash_md5(), "5eb63bbbe01eeed093cb22bb8f5acdc3");
    }

    #[tokio::test]
    async fn on_complete_fires_exactly_once() {
        let mut reader = reader_over(b"abcd", 4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = fired.clone();
        reader.on_complete(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let mut sink = Vec::new();
        // extra reads past EOF must not re-fire
        reader.read_to_end(&mut sink).await.unwrap();
        let mut empty = [0u8; 1];
        let _ = reader.read(&mut empty).await;

        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn unknown_total_never_completes() {
        let mut reader = reader_over(b"abc", 0);
        let progress = reader.progress();
        let mut sink = Vec::new();
        reader.read_to_end(&mut sink).await.unwrap();

        assert_eq!(progress.bytes_read(), 3);
        assert!(!progress.is_complete());
        assert_eq!(progress.progress(), 0.0);
    }

    #[test]
    fn byte_formatting_ladder() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(64 * 1024 * 1024), "64.0 MiB");
    }
}
