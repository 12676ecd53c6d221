use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    time::SystemTime,
};

use tokio::time::{sleep, Duration, Instant};
use tracing::debug;

use common::error::AppError;

const SNAPSHOT_POLL: Duration = Duration::from_millis(200);
const COMPLETION_POLL: Duration = Duration::from_millis(500);
const VISIBILITY_SETTLE: Duration = Duration::from_millis(300);

/// The directory downloads land in. Observing a download means diffing
/// snapshots of this directory and polling the in-progress placeholder the
/// transfer mechanism writes next to the final artifact.
#[derive(Debug, Clone)]
pub struct WorkArea {
    dir: PathBuf,
    partial_suffix: String,
}

impl WorkArea {
    pub fn new(dir: impl Into<PathBuf>, partial_suffix: &str) -> Self {
        Self {
            dir: dir.into(),
            partial_suffix: partial_suffix.trim_start_matches('.').to_string(),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn is_partial(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| e.eq_ignore_ascii_case(&self.partial_suffix))
    }

    /// Every file currently visible, finished artifacts and in-progress
    /// placeholders alike.
    pub fn snapshot(&self) -> Result<HashSet<PathBuf>, AppError> {
        let mut entries = HashSet::new();
        let read = match std::fs::read_dir(&self.dir) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(entries),
            Err(err) => return Err(err.into()),
        };
        for entry in read {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                entries.insert(entry.path());
            }
        }
        Ok(entries)
    }

    pub fn finished_files(&self) -> Result<Vec<PathBuf>, AppError> {
        let mut finished: Vec<PathBuf> = self
            .snapshot()?
            .into_iter()
            .filter(|p| !self.is_partial(p))
            .collect();
        finished.sort();
        Ok(finished)
    }

    pub fn has_partials(&self) -> Result<bool, AppError> {
        Ok(self.snapshot()?.iter().any(|p| self.is_partial(p)))
    }

    /// Waits for a new entry (finished artifact or placeholder) to appear
    /// relative to `prev`. `None` after the timeout means the transfer never
    /// started — a failure for this attempt, classified by the caller.
    pub async fn wait_download_started(
        &self,
        prev: &HashSet<PathBuf>,
        timeout: Duration,
    ) -> Result<Option<PathBuf>, AppError> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            let current = self.snapshot()?;
            let mut fresh: Vec<PathBuf> = current.difference(prev).cloned().collect();
            if !fresh.is_empty() {
                // Files can vanish between listing and stat on a network
                // mount; a missing candidate just sorts last.
                fresh.sort_by_key(|p| {
                    std::fs::metadata(p)
                        .and_then(|m| m.modified())
                        .unwrap_or(SystemTime::UNIX_EPOCH)
                });
                if let Some(newest) = fresh.pop() {
                    return Ok(Some(newest));
                }
            }
            sleep(SNAPSHOT_POLL).await;
        }
        Ok(None)
    }

    /// Follows a started transfer to its finished artifact. A placeholder
    /// whose size stops growing for `stall` is treated as finished-or-stuck:
    /// resolved to the artifact if it exists, `None` otherwise. Bounded by
    /// `timeout` overall.
    pub async fn wait_download_completed(
        &self,
        started: &Path,
        timeout: Duration,
        stall: Duration,
    ) -> Result<Option<PathBuf>, AppError> {
        if !self.is_partial(started) {
            return Ok(started.is_file().then(|| started.to_path_buf()));
        }

        let finished = started.with_extension("");
        let mut last_size: Option<u64> = None;
        let mut last_change = Instant::now();
        let deadline = Instant::now() + timeout;

        while Instant::now() < deadline {
            let artifact_exists = finished.is_file();
            let placeholder_exists = started.is_file();

            if artifact_exists && !placeholder_exists {
                return Ok(Some(finished));
            }

            if placeholder_exists {
                match std::fs::metadata(started) {
                    Ok(meta) => {
                        let size = meta.len();
                        if last_size != Some(size) {
                            last_size = Some(size);
                            last_change = Instant::now();
                        } else if last_change.elapsed() > stall {
                            debug!(path = %started.display(), "placeholder stalled");
                            return Ok(finished.is_file().then_some(finished));
                        }
                    }
                    Err(_) => {
                        // Placeholder vanished between the existence check and
                        // the stat; give the rename a moment to become visible.
                        sleep(VISIBILITY_SETTLE).await;
                        if finished.is_file() {
                            return Ok(Some(finished));
                        }
                        continue;
                    }
                }
            } else {
                // On network mounts the placeholder can disappear before the
                // finished artifact becomes visible.
                sleep(VISIBILITY_SETTLE).await;
                if finished.is_file() {
                    return Ok(Some(finished));
                }
            }

            sleep(COMPLETION_POLL).await;
        }

        Ok(finished.is_file().then_some(finished))
    }

    /// Bounded wait for every placeholder to clear, used once per unit before
    /// the manifest is sealed.
    pub async fn wait_partials_settled(&self, timeout: Duration) -> Result<bool, AppError> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if !self.has_partials()? {
                return Ok(true);
            }
            sleep(COMPLETION_POLL).await;
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn area(dir: &Path) -> WorkArea {
        WorkArea::new(dir, "crdownload")
    }

    #[test]
    fn partial_detection_by_suffix() {
        let dir = tempdir().expect("tempdir");
        let work = area(dir.path());
        assert!(work.is_partial(Path::new("a.pdf.crdownload")));
        assert!(!work.is_partial(Path::new("a.pdf")));
    }

    #[tokio::test]
    async fn detects_new_download_start() {
        let dir = tempdir().expect("tempdir");
        let work = area(dir.path());
        std::fs::write(dir.path().join("old.pdf"), b"old").expect("seed");
        let prev = work.snapshot().expect("snapshot");

        let path = dir.path().join("new.pdf.crdownload");
        let writer = {
            let path = path.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(150)).await;
                std::fs::write(&path, b"partial").expect("write placeholder");
            })
        };

        let started = work
            .wait_download_started(&prev, Duration::from_secs(3))
            .await
            .expect("wait");
        writer.await.expect("writer task");
        assert_eq!(started, Some(path));
    }

    #[tokio::test]
    async fn start_wait_times_out_without_new_files() {
        let dir = tempdir().expect("tempdir");
        let work = area(dir.path());
        let prev = work.snapshot().expect("snapshot");
        let started = work
            .wait_download_started(&prev, Duration::from_millis(400))
            .await
            .expect("wait");
        assert_eq!(started, None);
    }

    #[tokio::test]
    async fn completion_resolves_when_placeholder_becomes_artifact() {
        let dir = tempdir().expect("tempdir");
        let work = area(dir.path());
        let placeholder = dir.path().join("doc.pdf.crdownload");
        let artifact = dir.path().join("doc.pdf");
        std::fs::write(&placeholder, b"grow").expect("placeholder");

        let mover = {
            let placeholder = placeholder.clone();
            let artifact = artifact.clone();
            tokio::spawn(async move {
                sleep(Duration::from_millis(300)).await;
                std::fs::rename(&placeholder, &artifact).expect("finish download");
            })
        };

        let finished = work
            .wait_download_completed(&placeholder, Duration::from_secs(5), Duration::from_secs(5))
            .await
            .expect("wait");
        mover.await.expect("mover task");
        assert_eq!(finished, Some(artifact));
    }

    #[tokio::test]
    async fn stalled_placeholder_without_artifact_fails() {
        let dir = tempdir().expect("tempdir");
        let work = area(dir.path());
        let placeholder = dir.path().join("doc.pdf.crdownload");
        std::fs::write(&placeholder, b"stuck").expect("placeholder");

        let finished = work
            .wait_download_completed(
                &placeholder,
                Duration::from_secs(5),
                Duration::from_millis(200),
            )
            .await
            .expect("wait");
        assert_eq!(finished, None);
    }

    #[tokio::test]
    async fn already_finished_artifact_is_accepted_directly() {
        let dir = tempdir().expect("tempdir");
        let work = area(dir.path());
        let artifact = dir.path().join("doc.pdf");
        std::fs::write(&artifact, b"done").expect("artifact");

        let finished = work
            .wait_download_completed(&artifact, Duration::from_secs(1), Duration::from_secs(1))
            .await
            .expect("wait");
        assert_eq!(finished, Some(artifact));
    }
}
