use std::{collections::HashSet, sync::Arc};

use tokio::{
    sync::watch,
    time::{sleep, Duration},
};
use tracing::{error, info, warn};

use common::{error::AppError, manifest::store::ManifestStore, utils::config::AppConfig};

use crate::assemble::Assembler;

/// Watches the handoff area for completed manifests and invokes the
/// Assembler once per polling cycle when at least one new one is seen,
/// deleting only the manifests actually consumed in that cycle.
pub struct HandoffTrigger {
    manifests: Arc<dyn ManifestStore>,
    assembler: Assembler,
    poll: Duration,
}

impl HandoffTrigger {
    pub fn new(
        manifests: Arc<dyn ManifestStore>,
        assembler: Assembler,
        config: &AppConfig,
    ) -> Self {
        Self {
            manifests,
            assembler,
            poll: Duration::from_secs(config.poll_interval_secs.max(1)),
        }
    }

    /// Background loop. Exits once the Acquirer is done and the handoff area
    /// stays empty across one confirmation poll, so a manifest arriving in
    /// the same instant is not lost.
    pub async fn run(&self, acquirer_done: watch::Receiver<bool>) -> Result<(), AppError> {
        // Manifests assembled in an earlier cycle whose deletion failed;
        // never re-trigger for these.
        let mut consumed: HashSet<String> = HashSet::new();

        loop {
            match self.cycle(&mut consumed).await {
                Ok(_) => {}
                Err(err) => {
                    error!(error = %err, "handoff cycle failed; retrying");
                }
            }

            if *acquirer_done.borrow() && self.area_is_empty().await {
                sleep(self.poll).await;
                if self.area_is_empty().await {
                    break;
                }
            }

            sleep(self.poll).await;
        }

        info!("handoff trigger drained; exiting");
        Ok(())
    }

    /// One poll: collect newly seen complete manifests, run the Assembler
    /// once for the whole batch, then delete exactly those manifests.
    /// Unparseable or non-complete manifests stay for a future cycle.
    pub async fn cycle(&self, consumed: &mut HashSet<String>) -> Result<usize, AppError> {
        let fresh: Vec<String> = self
            .manifests
            .list()
            .await?
            .into_iter()
            .filter(|m| m.is_complete())
            .map(|m| m.safe_id)
            .filter(|safe_id| !consumed.contains(safe_id))
            .collect();

        if fresh.is_empty() {
            self.retry_pending_deletes(consumed).await;
            return Ok(0);
        }

        info!(batch = fresh.len(), "complete manifests seen; assembling");
        let written = self.assembler.assemble_all().await?;
        info!(written, "assembly pass finished");

        for safe_id in fresh {
            consumed.insert(safe_id.clone());
            match self.manifests.delete(&safe_id).await {
                Ok(()) => {
                    consumed.remove(&safe_id);
                }
                Err(err) => {
                    warn!(%safe_id, error = %err, "consumed manifest not deleted; will retry");
                }
            }
        }
        Ok(written)
    }

    async fn retry_pending_deletes(&self, consumed: &mut HashSet<String>) {
        let pending: Vec<String> = consumed.iter().cloned().collect();
        for safe_id in pending {
            if self.manifests.delete(&safe_id).await.is_ok() {
                consumed.remove(&safe_id);
            }
        }
    }

    async fn area_is_empty(&self) -> bool {
        self.manifests
            .list()
            .await
            .map(|manifests| manifests.is_empty())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::manifest::{store::FsManifestStore, Manifest, MANIFEST_SUFFIX};
    use std::path::{Path, PathBuf};
    use tempfile::tempdir;

    use crate::assemble::TextExtractor;

    struct PlainTextExtractor;

    impl TextExtractor for PlainTextExtractor {
        fn extract_text(&self, path: &Path) -> Result<String, AppError> {
            Ok(std::fs::read_to_string(path)?)
        }
    }

    struct Fixture {
        _root: tempfile::TempDir,
        handoff_dir: PathBuf,
        merged_dir: PathBuf,
        store: Arc<FsManifestStore>,
        trigger: HandoffTrigger,
    }

    fn fixture() -> Fixture {
        let root = tempdir().expect("tempdir");
        let handoff_dir = root.path().join("handoff");
        let merged_dir = root.path().join("merged");
        std::fs::create_dir_all(&handoff_dir).expect("handoff dir");

        let config = AppConfig {
            poll_interval_secs: 1,
            ..AppConfig::default()
        };
        let store = Arc::new(FsManifestStore::new(&handoff_dir));
        let assembler = Assembler::new(
            &handoff_dir,
            &merged_dir,
            Arc::new(PlainTextExtractor),
            "crdownload",
        );
        let trigger = HandoffTrigger::new(store.clone(), assembler, &config);

        Fixture {
            _root: root,
            handoff_dir,
            merged_dir,
            store,
            trigger,
        }
    }

    fn complete_manifest(unit_id: &str) -> Manifest {
        let mut manifest = Manifest::new(unit_id, "court", "claimant", vec![], 1);
        manifest.record_fetched();
        manifest.finalize();
        manifest
    }

    #[tokio::test]
    async fn consumes_only_complete_manifests() {
        let fx = fixture();

        let complete = complete_manifest("A40-1/2024");
        std::fs::write(
            fx.handoff_dir
                .join(format!("{} — court — claimant — NA — 01.pdf", complete.safe_id)),
            "document body",
        )
        .expect("unit file");
        fx.store.put(&complete).await.expect("put complete");

        let downloading = Manifest::new("A40-2/2024", "court", "claimant", vec![], 2);
        fx.store.put(&downloading).await.expect("put downloading");

        std::fs::write(
            fx.handoff_dir.join(format!("broken{MANIFEST_SUFFIX}")),
            b"{ nope",
        )
        .expect("broken manifest");

        let mut consumed = HashSet::new();
        fx.trigger.cycle(&mut consumed).await.expect("cycle");

        // The complete manifest is gone, the others are untouched.
        assert!(fx
            .store
            .get(&complete.safe_id)
            .await
            .expect("get")
            .is_none());
        assert!(fx
            .store
            .get(&downloading.safe_id)
            .await
            .expect("get")
            .is_some());
        assert!(fx
            .handoff_dir
            .join(format!("broken{MANIFEST_SUFFIX}"))
            .exists());

        // And the assembler actually ran.
        assert!(fx.merged_dir.join("A40-1_2024.txt").exists());
    }

    #[tokio::test]
    async fn idle_cycle_invokes_nothing() {
        let fx = fixture();
        let mut consumed = HashSet::new();
        let written = fx.trigger.cycle(&mut consumed).await.expect("cycle");
        assert_eq!(written, 0);
        assert!(!fx.merged_dir.exists());
    }

    #[tokio::test]
    async fn drains_after_acquirer_stops() {
        let fx = fixture();
        let manifest = complete_manifest("A40-3/2024");
        std::fs::write(
            fx.handoff_dir
                .join(format!("{} — court — claimant — NA — 01.pdf", manifest.safe_id)),
            "body",
        )
        .expect("unit file");
        fx.store.put(&manifest).await.expect("put");

        let (done_tx, done_rx) = watch::channel(true);
        tokio::time::timeout(Duration::from_secs(10), fx.trigger.run(done_rx))
            .await
            .expect("run drains")
            .expect("run ok");
        drop(done_tx);

        assert!(fx.merged_dir.join("A40-3_2024.txt").exists());
        assert!(fx.store.list().await.expect("list").is_empty());
    }
}
