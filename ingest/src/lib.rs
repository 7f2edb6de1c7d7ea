//! Producer-side ingestion: watch a directory, decode new image files
//! defensively and publish them into a [`LatestFrameCache`].
//!
//! [`LatestFrameCache`]: frame_relay_common::cache::LatestFrameCache

pub mod decode;
pub mod prune;
pub mod reaper;
pub mod watcher;

use std::path::PathBuf;

pub use decode::{DecodeError, DecodeOptions};
pub use watcher::{check_directory, FrameWatcher, WatcherOptions};

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("frames directory does not exist: {}", .0.display())]
    DirectoryMissing(PathBuf),
    #[error("frames path exists but is not a directory: {}", .0.display())]
    NotADirectory(PathBuf),
    #[error("cannot access frames directory {}: {source}", .path.display())]
    DirectoryAccess {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("watched directory disappeared: {}", .0.display())]
    DirectoryLost(PathBuf),
    #[error("filesystem event stream for {} closed", .0.display())]
    EventStreamClosed(PathBuf),
    #[error("failed to watch directory: {0}")]
    Watch(#[from] notify::Error),
}
