use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use tokio::{
    sync::watch,
    time::{sleep, Duration},
};
use tracing::{info, warn};

use common::{
    error::AppError,
    manifest::{store::ManifestStore, Manifest, MANIFEST_SUFFIX},
    utils::config::AppConfig,
};

use crate::workarea::WorkArea;

/// Moves provably-complete units from the acquisition area into the handoff
/// area: all unit files first, the manifest last, so a crash in between
/// leaves downstream an orphaned manifest that means "nothing to do yet".
pub struct Relocator {
    acquire: WorkArea,
    handoff_dir: PathBuf,
    source_manifests: Arc<dyn ManifestStore>,
    dest_manifests: Arc<dyn ManifestStore>,
    poll: Duration,
}

impl Relocator {
    pub fn new(
        source_manifests: Arc<dyn ManifestStore>,
        dest_manifests: Arc<dyn ManifestStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            acquire: WorkArea::new(&config.acquire_dir, &config.partial_suffix),
            handoff_dir: PathBuf::from(&config.handoff_dir),
            source_manifests,
            dest_manifests,
            poll: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }

    /// Background loop. Keeps draining until the Acquirer has stopped *and*
    /// no unit file remains in the acquisition area, so units completing
    /// after the Acquirer's last page still get moved.
    pub async fn run(&self, acquirer_done: watch::Receiver<bool>) -> Result<(), AppError> {
        loop {
            let ready = match self.ready_units().await {
                Ok(ready) => ready,
                Err(err) => {
                    warn!(error = %err, "relocation scan failed; retrying");
                    sleep(self.poll).await;
                    continue;
                }
            };

            if ready.is_empty() {
                // A failed scan conservatively counts as work remaining.
                let remain = self.unit_files_remain().unwrap_or(true);
                if *acquirer_done.borrow() && !remain {
                    break;
                }
                sleep(self.poll).await;
                continue;
            }

            for (manifest, files) in ready {
                self.move_unit(&manifest, &files).await;
            }
            sleep(Duration::from_secs(1)).await;
        }

        info!("relocator drained; exiting");
        Ok(())
    }

    /// A unit may move when its manifest says `complete`, none of its files
    /// is still an in-progress placeholder, and at least `min(expected,
    /// have)` finished files are visible (tolerates `have` being momentarily
    /// stale relative to disk).
    async fn ready_units(&self) -> Result<Vec<(Manifest, Vec<PathBuf>)>, AppError> {
        let mut ready = Vec::new();

        for manifest in self.source_manifests.list().await? {
            if !manifest.is_complete() {
                continue;
            }

            let snapshot = self.acquire.snapshot()?;
            let has_placeholder = snapshot.iter().any(|path| {
                self.acquire.is_partial(path) && file_has_prefix(path, &manifest.safe_id)
            });
            if has_placeholder {
                continue;
            }

            let unit_files: Vec<PathBuf> = snapshot
                .into_iter()
                .filter(|path| {
                    !self.acquire.is_partial(path)
                        && !is_manifest_file(path)
                        && file_has_prefix(path, &manifest.safe_id)
                })
                .collect();

            let required = manifest.expected.min(manifest.have) as usize;
            if manifest.expected > 0 && unit_files.len() < required {
                continue;
            }

            ready.push((manifest, unit_files));
        }
        Ok(ready)
    }

    async fn move_unit(&self, manifest: &Manifest, files: &[PathBuf]) {
        if let Err(err) = tokio::fs::create_dir_all(&self.handoff_dir).await {
            warn!(error = %err, "cannot create handoff area");
            return;
        }

        let mut moved = 0usize;
        let mut move_failed = false;
        for file in files {
            let Some(name) = file.file_name() else {
                continue;
            };
            let dest = self.handoff_dir.join(name);
            match tokio::fs::rename(file, &dest).await {
                Ok(()) => {
                    moved += 1;
                    info!(unit_id = %manifest.unit_id, file = %dest.display(), "relocated");
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                    // Already gone; another pass got it.
                }
                Err(err) => {
                    warn!(unit_id = %manifest.unit_id, file = %file.display(), error = %err, "relocation failed");
                    move_failed = true;
                }
            }
        }

        // Manifest last. On a partially failed move the source manifest is
        // still removed best-effort so the unit cannot loop forever.
        if move_failed {
            warn!(unit_id = %manifest.unit_id, moved, "unit moved incompletely; dropping source manifest");
            if let Err(err) = self.source_manifests.delete(&manifest.safe_id).await {
                warn!(unit_id = %manifest.unit_id, error = %err, "best-effort manifest delete failed");
            }
            return;
        }

        match self.dest_manifests.put(manifest).await {
            Ok(()) => {
                if let Err(err) = self.source_manifests.delete(&manifest.safe_id).await {
                    warn!(unit_id = %manifest.unit_id, error = %err, "source manifest delete failed");
                }
                info!(unit_id = %manifest.unit_id, files = moved, "unit handed off");
            }
            Err(err) => {
                warn!(unit_id = %manifest.unit_id, error = %err, "manifest handoff failed");
                if let Err(err) = self.source_manifests.delete(&manifest.safe_id).await {
                    warn!(unit_id = %manifest.unit_id, error = %err, "best-effort manifest delete failed");
                }
            }
        }
    }

    /// Any finished unit file or placeholder still in the acquisition area?
    fn unit_files_remain(&self) -> Result<bool, AppError> {
        Ok(self
            .acquire
            .snapshot()?
            .iter()
            .any(|path| !is_manifest_file(path)))
    }
}

fn is_manifest_file(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.ends_with(MANIFEST_SUFFIX) || n.ends_with(".json.tmp"))
}

fn file_has_prefix(path: &Path, safe_id: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(safe_id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::manifest::store::FsManifestStore;
    use tempfile::tempdir;

    struct Fixture {
        _root: tempfile::TempDir,
        acquire_dir: PathBuf,
        handoff_dir: PathBuf,
        source: Arc<FsManifestStore>,
        dest: Arc<FsManifestStore>,
        relocator: Relocator,
    }

    fn fixture() -> Fixture {
        let root = tempdir().expect("tempdir");
        let acquire_dir = root.path().join("acquired");
        let handoff_dir = root.path().join("handoff");
        std::fs::create_dir_all(&acquire_dir).expect("acquire dir");
        std::fs::create_dir_all(&handoff_dir).expect("handoff dir");

        let config = AppConfig {
            acquire_dir: acquire_dir.display().to_string(),
            handoff_dir: handoff_dir.display().to_string(),
            ..AppConfig::default()
        };
        let source = Arc::new(FsManifestStore::new(&acquire_dir));
        let dest = Arc::new(FsManifestStore::new(&handoff_dir));
        let relocator = Relocator::new(source.clone(), dest.clone(), &config);

        Fixture {
            _root: root,
            acquire_dir,
            handoff_dir,
            source,
            dest,
            relocator,
        }
    }

    fn complete_manifest(files: u32) -> Manifest {
        let mut manifest = Manifest::new("A40-5/2024", "court", "claimant", vec![], files);
        for _ in 0..files {
            manifest.record_fetched();
        }
        manifest.finalize();
        manifest
    }

    fn unit_file_name(manifest: &Manifest, seq: u32) -> String {
        format!("{} — court — claimant — NA — {seq:02}.pdf", manifest.safe_id)
    }

    #[tokio::test]
    async fn complete_unit_moves_all_files_then_manifest() {
        let fx = fixture();
        let manifest = complete_manifest(3);
        for seq in 1..=3 {
            std::fs::write(fx.acquire_dir.join(unit_file_name(&manifest, seq)), b"%PDF")
                .expect("unit file");
        }
        fx.source.put(&manifest).await.expect("put");

        let ready = fx.relocator.ready_units().await.expect("ready");
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].1.len(), 3);

        fx.relocator.move_unit(&ready[0].0, &ready[0].1).await;

        // 3 files + the manifest landed in handoff; source manifest removed.
        for seq in 1..=3 {
            assert!(fx.handoff_dir.join(unit_file_name(&manifest, seq)).exists());
            assert!(!fx.acquire_dir.join(unit_file_name(&manifest, seq)).exists());
        }
        assert!(fx
            .dest
            .get(&manifest.safe_id)
            .await
            .expect("get")
            .is_some());
        assert!(fx
            .source
            .get(&manifest.safe_id)
            .await
            .expect("get")
            .is_none());
    }

    #[tokio::test]
    async fn partial_manifest_is_never_eligible() {
        let fx = fixture();
        let mut manifest = Manifest::new("A40-5/2024", "court", "claimant", vec![], 3);
        manifest.record_fetched();
        manifest.record_fetched();
        manifest.finalize();
        assert_eq!(manifest.have, 2);

        // All three files present on disk; eligibility must still refuse.
        for seq in 1..=3 {
            std::fs::write(fx.acquire_dir.join(unit_file_name(&manifest, seq)), b"%PDF")
                .expect("unit file");
        }
        fx.source.put(&manifest).await.expect("put");

        let ready = fx.relocator.ready_units().await.expect("ready");
        assert!(ready.is_empty());
    }

    #[tokio::test]
    async fn placeholder_with_unit_prefix_blocks_relocation() {
        let fx = fixture();
        let manifest = complete_manifest(1);
        std::fs::write(fx.acquire_dir.join(unit_file_name(&manifest, 1)), b"%PDF")
            .expect("unit file");
        std::fs::write(
            fx.acquire_dir
                .join(format!("{} — late retry.pdf.crdownload", manifest.safe_id)),
            b"partial",
        )
        .expect("placeholder");
        fx.source.put(&manifest).await.expect("put");

        assert!(fx.relocator.ready_units().await.expect("ready").is_empty());

        // Placeholder cleared: the unit becomes eligible.
        std::fs::remove_file(
            fx.acquire_dir
                .join(format!("{} — late retry.pdf.crdownload", manifest.safe_id)),
        )
        .expect("clear placeholder");
        assert_eq!(fx.relocator.ready_units().await.expect("ready").len(), 1);
    }

    #[tokio::test]
    async fn missing_files_on_disk_defer_relocation() {
        let fx = fixture();
        let manifest = complete_manifest(2);
        std::fs::write(fx.acquire_dir.join(unit_file_name(&manifest, 1)), b"%PDF")
            .expect("unit file");
        fx.source.put(&manifest).await.expect("put");

        // have = expected = 2 but only one file is visible yet.
        assert!(fx.relocator.ready_units().await.expect("ready").is_empty());
    }

    #[tokio::test]
    async fn drains_and_exits_once_acquirer_is_done() {
        let fx = fixture();
        let manifest = complete_manifest(1);
        std::fs::write(fx.acquire_dir.join(unit_file_name(&manifest, 1)), b"%PDF")
            .expect("unit file");
        fx.source.put(&manifest).await.expect("put");

        let (done_tx, done_rx) = watch::channel(true);
        fx.relocator.run(done_rx).await.expect("run");
        drop(done_tx);

        assert!(fx
            .dest
            .get(&manifest.safe_id)
            .await
            .expect("get")
            .is_some());
        assert!(fx.handoff_dir.join(unit_file_name(&manifest, 1)).exists());
    }
}
