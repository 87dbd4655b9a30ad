pub mod engine;
pub mod progress;

pub use engine::{OneWaySync, SyncError, SyncOptions};
pub use progress::{HashingReader, ReaderProgress, format_bytes};
