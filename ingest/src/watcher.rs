use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use frame_relay_common::cache::LatestFrameCache;
use frame_relay_common::frame::Frame;
use notify::event::{AccessKind, AccessMode, ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::decode::{is_candidate_image, load_with_retry, DecodeError, DecodeOptions};
use crate::prune::prune_older_than;
use crate::IngestError;

const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct WatcherOptions {
    pub decode: DecodeOptions,
    /// How often the watched directory is re-checked for existence.
    pub dir_check_interval: Duration,
    /// When set, producer files older than the current frame by more than
    /// this age are deleted after each publish.
    pub prune_max_age: Option<Duration>,
}

impl Default for WatcherOptions {
    fn default() -> Self {
        Self {
            decode: DecodeOptions::default(),
            dir_check_interval: Duration::from_secs(1),
            prune_max_age: None,
        }
    }
}

/// Fail unless `dir` exists and is a directory.
pub fn check_directory(dir: &Path) -> Result<(), IngestError> {
    match std::fs::metadata(dir) {
        Ok(meta) if meta.is_dir() => Ok(()),
        Ok(_) => Err(IngestError::NotADirectory(dir.to_path_buf())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(IngestError::DirectoryMissing(dir.to_path_buf()))
        }
        Err(e) => Err(IngestError::DirectoryAccess {
            path: dir.to_path_buf(),
            source: e,
        }),
    }
}

/// Identity of a file version on disk, used to skip repeated events for a
/// file that was already published.
#[derive(Debug, Clone, PartialEq, Eq)]
struct FileSignature {
    path: PathBuf,
    modified: Option<SystemTime>,
    len: u64,
}

impl FileSignature {
    async fn of(path: &Path) -> Option<Self> {
        let meta = tokio::fs::metadata(path).await.ok()?;
        Some(Self {
            path: path.to_path_buf(),
            modified: meta.modified().ok(),
            len: meta.len(),
        })
    }
}

/// Turns producer files appearing in one directory into published frames.
///
/// The watcher is the only writer of its cache. Sequence numbers come from a
/// counter owned by the watcher, never from file names.
pub struct FrameWatcher {
    source: String,
    dir: PathBuf,
    cache: Arc<LatestFrameCache>,
    opts: WatcherOptions,
    next_sequence: u64,
    last_published: Option<FileSignature>,
}

impl FrameWatcher {
    pub fn new(
        source: impl Into<String>,
        dir: impl Into<PathBuf>,
        cache: Arc<LatestFrameCache>,
        opts: WatcherOptions,
    ) -> Self {
        let next_sequence = cache.last_sequence().map(|s| s + 1).unwrap_or(1);
        Self {
            source: source.into(),
            dir: dir.into(),
            cache,
            opts,
            next_sequence,
            last_published: None,
        }
    }

    /// Publish the newest existing candidate file, if any.
    ///
    /// Returns the sequence assigned to it.
    pub async fn bootstrap(&mut self) -> Result<Option<u64>, IngestError> {
        check_directory(&self.dir)?;
        let Some(newest) = newest_candidate(&self.dir).await? else {
            info!(source = %self.source, dir = %self.dir.display(), "no existing frames to bootstrap from");
            return Ok(None);
        };
        info!(source = %self.source, path = %newest.display(), "bootstrapping from newest existing frame");
        Ok(self.ingest_path(&newest).await)
    }

    /// Watch the directory until it becomes unusable.
    ///
    /// Only returns on a fatal condition; a successful return never happens
    /// while the directory is healthy.
    pub async fn run(mut self) -> Result<(), IngestError> {
        check_directory(&self.dir)?;

        let (tx, mut rx) = mpsc::channel::<notify::Result<Event>>(EVENT_CHANNEL_CAPACITY);
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            // Runs on the notify backend thread; a closed channel means the
            // ingestion loop is gone and there is nobody left to tell.
            let _ = tx.blocking_send(res);
        })?;
        watcher.watch(&self.dir, RecursiveMode::NonRecursive)?;

        info!(source = %self.source, dir = %self.dir.display(), "watching for new frames");

        let mut health = tokio::time::interval(self.opts.dir_check_interval);
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                event = rx.recv() => match event {
                    Some(Ok(event)) => self.handle_event(event).await?,
                    Some(Err(e)) => {
                        warn!(source = %self.source, error = %e, "filesystem watch error");
                        self.ensure_directory()?;
                    }
                    None => return Err(IngestError::EventStreamClosed(self.dir.clone())),
                },
                _ = health.tick() => self.ensure_directory()?,
            }
        }
    }

    fn ensure_directory(&self) -> Result<(), IngestError> {
        check_directory(&self.dir).map_err(|e| {
            error!(source = %self.source, dir = %self.dir.display(), error = %e, "watched directory lost");
            IngestError::DirectoryLost(self.dir.clone())
        })
    }

    async fn handle_event(&mut self, event: Event) -> Result<(), IngestError> {
        if matches!(event.kind, EventKind::Remove(_)) && event.paths.iter().any(|p| p == &self.dir) {
            return self.ensure_directory();
        }
        for path in event_targets(&event) {
            if self.accepts(path) {
                self.ingest_path(path).await;
            }
        }
        Ok(())
    }

    fn accepts(&self, path: &Path) -> bool {
        is_candidate_image(path) && path.parent() == Some(self.dir.as_path())
    }

    /// Decode `path` and publish it. Failures are logged and skipped.
    async fn ingest_path(&mut self, path: &Path) -> Option<u64> {
        let signature = FileSignature::of(path).await;
        if signature.is_some() && signature == self.last_published {
            debug!(source = %self.source, path = %path.display(), "file unchanged since last publish, skipping");
            return None;
        }

        let jpeg = match load_with_retry(path, &self.opts.decode).await {
            Ok(jpeg) => jpeg,
            Err(DecodeError::Exhausted { attempts, source, .. }) => {
                warn!(
                    source = %self.source,
                    path = %path.display(),
                    attempts,
                    error = %source,
                    "skipping undecodable frame"
                );
                return None;
            }
            Err(e) => {
                warn!(source = %self.source, path = %path.display(), error = %e, "skipping frame");
                return None;
            }
        };

        let seq = self.next_sequence;
        self.next_sequence += 1;
        let bytes = jpeg.len();
        let frame = Frame::new(jpeg, seq).with_origin(path);
        if !self.cache.publish(frame) {
            return None;
        }
        debug!(source = %self.source, seq, bytes, path = %path.display(), "published frame");
        // The stat taken before the read: if the file changed after it, the
        // next event must not match and gets published.
        self.last_published = signature;

        if let Some(max_age) = self.opts.prune_max_age {
            let removed = prune_older_than(&self.dir, path, max_age).await;
            if removed > 0 {
                debug!(source = %self.source, removed, "pruned old frames");
            }
        }
        Some(seq)
    }
}

/// Paths an event points at that may hold a finished image.
fn event_targets(event: &Event) -> &[PathBuf] {
    match event.kind {
        EventKind::Create(_)
        | EventKind::Access(AccessKind::Close(AccessMode::Write))
        | EventKind::Modify(ModifyKind::Data(_))
        | EventKind::Modify(ModifyKind::Any)
        | EventKind::Modify(ModifyKind::Name(RenameMode::To))
        | EventKind::Modify(ModifyKind::Name(RenameMode::Any)) => &event.paths,
        // [from, to]: only the destination is a new file.
        EventKind::Modify(ModifyKind::Name(RenameMode::Both)) => match event.paths.last() {
            Some(last) => std::slice::from_ref(last),
            None => &[],
        },
        _ => &[],
    }
}

async fn newest_candidate(dir: &Path) -> Result<Option<PathBuf>, IngestError> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| IngestError::DirectoryAccess {
            path: dir.to_path_buf(),
            source: e,
        })?;
    let mut newest: Option<(SystemTime, PathBuf)> = None;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if !is_candidate_image(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        let Ok(modified) = meta.modified() else {
            continue;
        };
        if newest.as_ref().map(|(t, _)| modified > *t).unwrap_or(true) {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, path)| path))
}
