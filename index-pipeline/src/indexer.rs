use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::SystemTime,
};

use tokio_retry::{
    strategy::{jitter, ExponentialBackoff},
    Retry,
};
use tracing::{info, warn};

use common::{
    error::AppError,
    record_header::{parse_header, HeaderFields},
    utils::{config::AppConfig, naming},
};

use crate::{
    chunker::split_chunks,
    embedding::EmbeddingService,
    ledger::ProcessedLedger,
    vector::{ChunkPoint, VectorStore},
};

/// One pass of the resumable indexing stage: finds merged records that lack
/// a processed marker and have been stable on disk, embeds their chunks in
/// batches and applies the marker only after a successful forced flush.
pub struct Indexer {
    merged_dir: PathBuf,
    ledger: Arc<dyn ProcessedLedger>,
    embedder: Arc<dyn EmbeddingService>,
    store: Arc<dyn VectorStore>,
    file_stable_secs: u64,
    chunk_chars: usize,
    chunk_overlap_chars: usize,
    batch_size: usize,
}

impl Indexer {
    pub fn new(
        ledger: Arc<dyn ProcessedLedger>,
        embedder: Arc<dyn EmbeddingService>,
        store: Arc<dyn VectorStore>,
        config: &AppConfig,
    ) -> Self {
        Self {
            merged_dir: PathBuf::from(&config.merged_dir),
            ledger,
            embedder,
            store,
            file_stable_secs: config.file_stable_secs,
            chunk_chars: config.chunk_chars,
            chunk_overlap_chars: config.chunk_overlap_chars,
            batch_size: config.embed_batch_size.max(1),
        }
    }

    /// Indexes every eligible record once. Returns how many records were
    /// fully processed. Quota exhaustion propagates; any other per-record
    /// failure is logged and the scan continues.
    pub async fn index_pending(&self) -> Result<usize, AppError> {
        self.store.ensure_ready(self.embedder.dimension()).await?;

        let mut processed = 0usize;
        for path in self.candidate_files()? {
            match self.index_record(&path).await {
                Ok(()) => processed += 1,
                Err(err) if err.is_quota_exhausted() => return Err(err),
                Err(err) => {
                    warn!(record = %path.display(), error = %err, "record failed; will retry next cycle");
                }
            }
        }
        Ok(processed)
    }

    /// Unmarked `.txt` records old enough to be certainly done being written.
    fn candidate_files(&self) -> Result<Vec<PathBuf>, AppError> {
        let mut candidates = Vec::new();
        let read = match std::fs::read_dir(&self.merged_dir) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(candidates),
            Err(err) => return Err(err.into()),
        };

        for entry in read {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("txt") {
                continue;
            }
            if self.ledger.is_processed(&path) {
                continue;
            }
            if !self.is_stable(&path) {
                continue;
            }
            candidates.push(path);
        }
        candidates.sort();
        Ok(candidates)
    }

    fn is_stable(&self, path: &Path) -> bool {
        let Ok(meta) = std::fs::metadata(path) else {
            return false;
        };
        let Ok(modified) = meta.modified() else {
            return false;
        };
        SystemTime::now()
            .duration_since(modified)
            .map(|age| age.as_secs() >= self.file_stable_secs)
            .unwrap_or(false)
    }

    async fn index_record(&self, path: &Path) -> Result<(), AppError> {
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let record_stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();

        let raw = tokio::fs::read_to_string(path).await?;
        let fields = parse_header(&raw);
        // The filename carries the docket number even when the header is
        // damaged; the header is the fallback.
        let unit_id = naming::find_unit_id(&file_name)
            .or_else(|| fields.unit_id.clone())
            .unwrap_or_else(|| "UNKNOWN".to_string());
        let tag = retrieval_tag(&unit_id, &fields);

        let chunks = split_chunks(&raw, self.chunk_chars, self.chunk_overlap_chars)?;
        let total = chunks.len();

        let mut batch: Vec<ChunkPoint> = Vec::with_capacity(self.batch_size);
        let mut stored = 0usize;
        for (index, chunk) in chunks.into_iter().enumerate() {
            let text_block = format!("{tag}{chunk}");
            let embedding = match self.embedder.embed(&text_block).await {
                Ok(embedding) => embedding,
                Err(err) if err.is_quota_exhausted() => return Err(err),
                Err(err) => {
                    warn!(record = %file_name, chunk = index, error = %err, "embedding failed; chunk skipped");
                    continue;
                }
            };

            batch.push(ChunkPoint {
                id: ChunkPoint::point_id(&record_stem, index),
                unit_id: unit_id.clone(),
                origin: fields.origin.clone(),
                primary: fields.primary.clone(),
                secondary: fields.secondary.clone(),
                file: file_name.clone(),
                text: text_block,
                embedding,
            });

            if batch.len() >= self.batch_size {
                self.store.upsert(&batch, false).await?;
                stored += batch.len();
                batch.clear();
            }
        }

        // Forced flush at end-of-record, acknowledged, with a short retry.
        // Only after it succeeds may the marker be applied; the marker, not
        // the batch count, is the durability boundary.
        if !batch.is_empty() {
            let strategy = ExponentialBackoff::from_millis(100).map(jitter).take(3);
            Retry::spawn(strategy, || self.store.upsert(&batch, true)).await?;
            stored += batch.len();
        }

        let marked = self.ledger.mark_processed(path).await?;
        info!(
            record = %file_name,
            unit_id = %unit_id,
            chunks = total,
            stored,
            marked = %marked.display(),
            "record indexed"
        );
        Ok(())
    }
}

/// Tag prefixed to every chunk so retrieval can be filtered by the unit's
/// header fields; party lists are capped at two entries.
fn retrieval_tag(unit_id: &str, fields: &HeaderFields) -> String {
    let mut tag = format!("<CASE:{unit_id}>");
    if let Some(origin) = &fields.origin {
        tag.push_str(&format!(" <COURT:{origin}>"));
    }
    if !fields.secondary.is_empty() || fields.primary.is_some() {
        if let Some(primary) = &fields.primary {
            tag.push_str(&format!(" <CLAIMANT:{primary}>"));
        }
        if !fields.secondary.is_empty() {
            let capped: Vec<&str> = fields
                .secondary
                .iter()
                .take(2)
                .map(String::as_str)
                .collect();
            tag.push_str(&format!(" <RESPONDENT:{}>", capped.join(";")));
        }
    }
    tag.push('\n');
    tag
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use tempfile::tempdir;

    use crate::embedding::HashedEmbedder;
    use crate::ledger::RenameLedger;
    use common::record_header::build_header;

    /// In-memory vector store keyed by point id, with failure knobs.
    #[derive(Default)]
    struct MemoryVectorStore {
        points: Mutex<std::collections::BTreeMap<String, ChunkPoint>>,
        fail_waited_flush: Mutex<bool>,
    }

    #[async_trait::async_trait]
    impl VectorStore for MemoryVectorStore {
        async fn ensure_ready(&self, _dimension: usize) -> Result<(), AppError> {
            Ok(())
        }

        async fn upsert(&self, points: &[ChunkPoint], wait: bool) -> Result<(), AppError> {
            if wait && *self.fail_waited_flush.lock().expect("flag lock") {
                return Err(AppError::Processing("flush rejected".into()));
            }
            let mut stored = self.points.lock().expect("points lock");
            for point in points {
                stored.insert(point.id.clone(), point.clone());
            }
            Ok(())
        }

        async fn fetch_by_unit(&self, unit_id: &str) -> Result<Vec<ChunkPoint>, AppError> {
            Ok(self
                .points
                .lock()
                .expect("points lock")
                .values()
                .filter(|p| p.unit_id == unit_id)
                .cloned()
                .collect())
        }
    }

    /// Embedder that fails with quota exhaustion from a given call onward.
    struct QuotaEmbedder {
        inner: HashedEmbedder,
        fail_from: usize,
        calls: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl EmbeddingService for QuotaEmbedder {
        fn dimension(&self) -> usize {
            self.inner.dimension()
        }

        async fn embed(&self, text: &str) -> Result<Vec<f32>, AppError> {
            {
                let mut calls = self.calls.lock().expect("calls lock");
                *calls += 1;
                if *calls > self.fail_from {
                    return Err(AppError::QuotaExhausted("insufficient balance".into()));
                }
            }
            self.inner.embed(text).await
        }
    }

    fn write_record(dir: &Path, stem: &str, body_words: usize) -> PathBuf {
        let header = build_header(&HeaderFields {
            unit_id: naming::find_unit_id(stem),
            origin: Some("Commercial Court".to_string()),
            primary: Some("Alfa Leasing LLC".to_string()),
            secondary: vec!["Beta Trade LLC".to_string()],
        });
        let body = "lease payment dispute ".repeat(body_words);
        let path = dir.join(format!("{stem}.txt"));
        std::fs::write(&path, format!("{header}{body}")).expect("record");
        path
    }

    fn indexer_with(
        dir: &Path,
        embedder: Arc<dyn EmbeddingService>,
        store: Arc<MemoryVectorStore>,
    ) -> Indexer {
        let config = AppConfig {
            merged_dir: dir.display().to_string(),
            file_stable_secs: 0,
            chunk_chars: 200,
            chunk_overlap_chars: 40,
            embed_batch_size: 4,
            ..AppConfig::default()
        };
        Indexer::new(Arc::new(RenameLedger::default()), embedder, store, &config)
    }

    #[tokio::test]
    async fn double_run_produces_one_marker_and_no_duplicates() {
        let dir = tempdir().expect("tempdir");
        write_record(dir.path(), "A40-1_2024", 100);

        let store = Arc::new(MemoryVectorStore::default());
        let indexer = indexer_with(
            dir.path(),
            Arc::new(HashedEmbedder::new(16)),
            store.clone(),
        );

        let first = indexer.index_pending().await.expect("first run");
        assert_eq!(first, 1);
        let points_after_first = store.points.lock().expect("lock").len();
        assert!(points_after_first > 1);

        let second = indexer.index_pending().await.expect("second run");
        assert_eq!(second, 0);
        assert_eq!(
            store.points.lock().expect("lock").len(),
            points_after_first
        );

        // Exactly one marker on disk; the original name is gone.
        let names: Vec<String> = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["A40-1_2024.indexed.txt".to_string()]);
    }

    #[tokio::test]
    async fn quota_exhaustion_stops_the_pass_without_marker() {
        let dir = tempdir().expect("tempdir");
        let path = write_record(dir.path(), "A40-2_2024", 200);

        let store = Arc::new(MemoryVectorStore::default());
        let embedder = Arc::new(QuotaEmbedder {
            inner: HashedEmbedder::new(16),
            fail_from: 2,
            calls: Mutex::new(0),
        });
        let indexer = indexer_with(dir.path(), embedder, store.clone());

        let result = indexer.index_pending().await;
        assert!(matches!(result, Err(AppError::QuotaExhausted(_))));
        // No marker: the record must be fully re-embedded after restart.
        assert!(path.exists());
        assert!(!dir.path().join("A40-2_2024.indexed.txt").exists());
    }

    #[tokio::test]
    async fn failed_forced_flush_leaves_record_unmarked() {
        let dir = tempdir().expect("tempdir");
        let path = write_record(dir.path(), "A40-3_2024", 30);

        let store = Arc::new(MemoryVectorStore::default());
        *store.fail_waited_flush.lock().expect("flag") = true;
        let indexer = indexer_with(
            dir.path(),
            Arc::new(HashedEmbedder::new(16)),
            store.clone(),
        );

        let processed = indexer.index_pending().await.expect("pass");
        assert_eq!(processed, 0);
        assert!(path.exists());

        // Once the store recovers, the next cycle finishes the record.
        *store.fail_waited_flush.lock().expect("flag") = false;
        let processed = indexer.index_pending().await.expect("pass");
        assert_eq!(processed, 1);
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn young_files_wait_for_stability() {
        let dir = tempdir().expect("tempdir");
        write_record(dir.path(), "A40-4_2024", 10);

        let store = Arc::new(MemoryVectorStore::default());
        let config = AppConfig {
            merged_dir: dir.path().display().to_string(),
            file_stable_secs: 3600,
            ..AppConfig::default()
        };
        let indexer = Indexer::new(
            Arc::new(RenameLedger::default()),
            Arc::new(HashedEmbedder::new(16)),
            store,
            &config,
        );

        let processed = indexer.index_pending().await.expect("pass");
        assert_eq!(processed, 0);
    }

    #[test]
    fn retrieval_tag_caps_parties() {
        let fields = HeaderFields {
            unit_id: Some("A40-1/2024".to_string()),
            origin: Some("Court".to_string()),
            primary: Some("Alfa".to_string()),
            secondary: vec!["B".to_string(), "C".to_string(), "D".to_string()],
        };
        let tag = retrieval_tag("A40-1/2024", &fields);
        assert!(tag.contains("<CASE:A40-1/2024>"));
        assert!(tag.contains("<RESPONDENT:B;C>"));
        assert!(!tag.contains(";D"));
        assert!(tag.ends_with('\n'));
    }
}
