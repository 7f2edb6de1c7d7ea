use std::path::Path;
use std::time::Duration;

use tracing::debug;

use crate::decode::is_candidate_image;

/// Delete candidate images in `dir` whose mtime is more than `max_age` older
/// than the mtime of `current`.
///
/// Best-effort: files that vanish or cannot be removed are skipped, and
/// `current` itself is never deleted. Returns the number of files removed.
pub async fn prune_older_than(dir: &Path, current: &Path, max_age: Duration) -> usize {
    if max_age.is_zero() {
        return 0;
    }
    let Ok(current_mtime) = tokio::fs::metadata(current).await.and_then(|m| m.modified()) else {
        return 0;
    };
    let Some(threshold) = current_mtime.checked_sub(max_age) else {
        return 0;
    };
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return 0;
    };

    let mut removed = 0;
    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path == current || !is_candidate_image(&path) {
            continue;
        }
        let Ok(meta) = entry.metadata().await else {
            continue;
        };
        if !meta.is_file() {
            continue;
        }
        match meta.modified() {
            Ok(mtime) if mtime < threshold => match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) => debug!(path = %path.display(), error = %e, "failed to prune frame"),
            },
            _ => {}
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::FileTimes;
    use std::time::SystemTime;

    fn touch(path: &Path, mtime: SystemTime) {
        std::fs::write(path, b"x").unwrap();
        let file = std::fs::File::options().write(true).open(path).unwrap();
        file.set_times(FileTimes::new().set_modified(mtime)).unwrap();
    }

    #[tokio::test]
    async fn removes_only_old_candidate_files() {
        let dir = tempfile::tempdir().unwrap();
        let now = SystemTime::now();
        let current = dir.path().join("current.jpg");
        let recent = dir.path().join("recent.png");
        let old = dir.path().join("old.jpeg");
        let old_other = dir.path().join("old.log");
        touch(&current, now);
        touch(&recent, now - Duration::from_secs(5));
        touch(&old, now - Duration::from_secs(60));
        touch(&old_other, now - Duration::from_secs(60));

        let removed = prune_older_than(dir.path(), &current, Duration::from_secs(10)).await;
        assert_eq!(removed, 1);
        assert!(current.exists());
        assert!(recent.exists());
        assert!(!old.exists());
        assert!(old_other.exists());
    }

    #[tokio::test]
    async fn missing_current_or_zero_age_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let old = dir.path().join("old.jpg");
        touch(&old, SystemTime::now() - Duration::from_secs(3600));

        let gone = dir.path().join("gone.jpg");
        assert_eq!(prune_older_than(dir.path(), &gone, Duration::from_secs(1)).await, 0);
        assert_eq!(prune_older_than(dir.path(), &old, Duration::ZERO).await, 0);
        assert!(old.exists());
    }
}
