use std::{
    collections::HashSet,
    ffi::OsStr,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::NaiveDate;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use common::{
    error::AppError,
    manifest::{store::ManifestStore, Manifest},
    utils::{config::AppConfig, naming},
};

use crate::{
    relevance::RelevanceGate,
    renderer::{CaseMeta, PageRenderer, PageSignature, SearchFilter},
    throttle::{Pacer, ThrottleClassifier},
    workarea::WorkArea,
};

const PAGE_POLL: Duration = Duration::from_millis(200);

/// Drives the page renderer through every (origin, date) filter combination,
/// validates page transitions, fetches each relevant unit's file set and
/// keeps that unit's manifest truthful after every fetch.
pub struct Acquirer {
    renderer: Arc<dyn PageRenderer>,
    manifests: Arc<dyn ManifestStore>,
    classifier: Arc<dyn ThrottleClassifier>,
    work: WorkArea,
    acquire_dir: PathBuf,
    pacer: Pacer,
    gate: RelevanceGate,
    start_date: NaiveDate,
    end_date: NaiveDate,
    origins: Vec<String>,
    max_pages: u32,
    page_wait: Duration,
    start_timeout: Duration,
    stall_timeout: Duration,
    per_file_timeout: Duration,
}

impl Acquirer {
    pub fn new(
        renderer: Arc<dyn PageRenderer>,
        manifests: Arc<dyn ManifestStore>,
        classifier: Arc<dyn ThrottleClassifier>,
        config: &AppConfig,
    ) -> Result<Self, AppError> {
        let excluded: Vec<String> = config
            .excluded_origins
            .iter()
            .map(|e| e.to_lowercase())
            .collect();
        let origins = config
            .origins
            .iter()
            .filter(|origin| {
                let lowered = origin.to_lowercase();
                !excluded.iter().any(|e| lowered.contains(e))
            })
            .cloned()
            .collect();

        Ok(Self {
            renderer,
            manifests,
            classifier,
            work: WorkArea::new(&config.work_dir, &config.partial_suffix),
            acquire_dir: PathBuf::from(&config.acquire_dir),
            pacer: Pacer::from_config(config),
            gate: RelevanceGate::from_config(config)?,
            start_date: config.start_date,
            end_date: config.end_date,
            origins,
            max_pages: config.max_pages,
            page_wait: Duration::from_secs(config.page_wait_secs),
            start_timeout: Duration::from_secs(config.start_timeout_secs),
            stall_timeout: Duration::from_secs(config.stall_timeout_secs),
            per_file_timeout: Duration::from_secs(config.per_file_timeout_secs),
        })
    }

    /// Walks the whole filter space. The only natural termination in the
    /// pipeline: every other actor drains after this returns.
    pub async fn run(&self) -> Result<(), AppError> {
        if self.origins.is_empty() {
            warn!("no origins left after exclusions; nothing to acquire");
            return Ok(());
        }
        info!(origins = self.origins.len(), "acquisition sweep starting");

        for origin in &self.origins {
            info!(%origin, "origin sweep starting");
            let mut date = self.start_date;
            while date <= self.end_date {
                self.pacer.daily_break_if_due().await;
                let filter = SearchFilter {
                    origin: origin.clone(),
                    date,
                };
                // One bad day/origin must never halt the whole run.
                if let Err(err) = self.process_filter(&filter).await {
                    error!(%origin, date = %date, error = %err, "filter combination aborted");
                }
                date = match date.succ_opt() {
                    Some(next) => next,
                    None => break,
                };
            }
            info!(%origin, "origin sweep finished");
        }

        info!("acquisition sweep finished");
        Ok(())
    }

    async fn process_filter(&self, filter: &SearchFilter) -> Result<(), AppError> {
        self.renderer.apply_filter(filter).await?;

        let mut seen: HashSet<PageSignature> = HashSet::new();
        let mut page: u32 = 1;

        while page <= self.max_pages {
            let ids = self.renderer.result_ids().await?;
            let signature = PageSignature::of(&ids);
            if !seen.insert(signature.clone()) {
                warn!(
                    origin = %filter.origin,
                    date = %filter.date,
                    page,
                    "page signature repeated; stopping this filter"
                );
                break;
            }
            if ids.is_empty() {
                debug!(origin = %filter.origin, date = %filter.date, page, "no results");
                break;
            }

            info!(
                origin = %filter.origin,
                date = %filter.date,
                page,
                results = ids.len(),
                "processing result page"
            );
            for id in &ids {
                self.process_case(filter, id).await?;
            }

            if !self.advance_page(page, &signature).await? {
                debug!(origin = %filter.origin, date = %filter.date, page, "no further pages");
                break;
            }
            page += 1;
        }
        Ok(())
    }

    /// Moves from `current` to `current + 1` and proves the landing. The
    /// signature must change to something non-blank AND the active-page
    /// indicator must equal the target; anything else within the bounded wait
    /// is a failed transition. A changed signature on the wrong page gets one
    /// corrective re-request before the deadline decides.
    async fn advance_page(
        &self,
        current: u32,
        prev_signature: &PageSignature,
    ) -> Result<bool, AppError> {
        let target = current + 1;
        if !self.renderer.request_page(target).await? {
            return Ok(false);
        }

        let deadline = Instant::now() + self.page_wait;
        let mut corrected = false;
        while Instant::now() < deadline {
            let ids = self.renderer.result_ids().await?;
            let signature = PageSignature::of(&ids);
            let changed = signature != *prev_signature && !signature.is_blank();

            if changed {
                match self.renderer.active_page().await? {
                    Some(active) if active == target => return Ok(true),
                    active => {
                        if !corrected {
                            warn!(
                                target,
                                ?active,
                                "content changed but landed off-target; re-requesting"
                            );
                            corrected = true;
                            self.renderer.request_page(target).await?;
                        }
                    }
                }
            }
            sleep(PAGE_POLL).await;
        }

        Err(AppError::Transient(format!(
            "transition to page {target} not confirmed within {:?}",
            self.page_wait
        )))
    }

    async fn process_case(&self, filter: &SearchFilter, id: &str) -> Result<(), AppError> {
        self.pacer.inter_request_delay().await;
        let card = self.renderer.open_case(id).await?;

        if !self.gate.is_relevant(&card.body_text) {
            info!(case = %id, "skipping: relevance gate not met");
            return Ok(());
        }
        if card.meta.unit_id.is_empty() {
            warn!(case = %id, "skipping: no recognizable unit identifier");
            return Ok(());
        }

        let mut meta = card.meta.clone();
        // The filter knows the origin authoritatively; the card's own origin
        // field is frequently blank or abbreviated.
        meta.origin = filter.origin.clone();

        self.fetch_unit(&meta, &card.documents).await
    }

    /// Downloads every document of one unit, rewriting the manifest after
    /// each success so a crash mid-unit leaves accurate partial progress.
    /// Failed files get exactly one second pass.
    async fn fetch_unit(&self, meta: &CaseMeta, documents: &[String]) -> Result<(), AppError> {
        let mut manifest = Manifest::new(
            &meta.unit_id,
            &meta.origin,
            &meta.primary,
            meta.secondary.clone(),
            documents.len() as u32,
        );
        info!(unit_id = %manifest.unit_id, expected = manifest.expected, "unit discovered");
        self.manifests.put(&manifest).await?;

        let mut seq: u32 = 1;
        let mut failed: Vec<String> = Vec::new();

        for document in documents {
            if self.fetch_and_place(meta, document, seq, 1).await? {
                manifest.record_fetched();
                self.manifests.put(&manifest).await?;
                seq += 1;
            } else {
                failed.push(document.clone());
            }
        }

        if !failed.is_empty() {
            info!(
                unit_id = %manifest.unit_id,
                retrying = failed.len(),
                "second pass over failed files"
            );
            let mut missing: u32 = 0;
            for document in &failed {
                if self.fetch_and_place(meta, document, seq, 2).await? {
                    manifest.record_fetched();
                    self.manifests.put(&manifest).await?;
                    seq += 1;
                } else {
                    missing += 1;
                }
            }
            if missing > 0 {
                warn!(unit_id = %manifest.unit_id, missing, "files still missing after retry pass");
            }
        }

        if !self.work.wait_partials_settled(self.per_file_timeout).await? {
            warn!(unit_id = %manifest.unit_id, "placeholders still present after settle wait");
        }

        manifest.finalize();
        self.manifests.put(&manifest).await?;
        info!(
            unit_id = %manifest.unit_id,
            status = manifest.status.as_str(),
            have = manifest.have,
            expected = manifest.expected,
            "manifest sealed"
        );
        Ok(())
    }

    /// One fetch attempt: snapshot, trigger, bounded start wait, stall-aware
    /// completion wait, then placement under the canonical unit file name.
    /// Failures classify the page text to pick between a long cooldown and a
    /// short randomized backoff, and report `false` instead of erroring.
    async fn fetch_and_place(
        &self,
        meta: &CaseMeta,
        document: &str,
        seq: u32,
        attempt: u32,
    ) -> Result<bool, AppError> {
        self.pacer.inter_request_delay().await;
        debug!(attempt, document, "triggering download");

        let prev = self.work.snapshot()?;
        self.renderer.trigger_download(document).await?;

        let Some(started) = self
            .work
            .wait_download_started(&prev, self.start_timeout)
            .await?
        else {
            self.classify_and_pause("download did not start").await;
            return Ok(false);
        };
        debug!(started = %started.display(), "download started");

        match self
            .work
            .wait_download_completed(&started, self.per_file_timeout, self.stall_timeout)
            .await?
        {
            Some(artifact) => {
                self.place_artifact(&artifact, meta, seq).await?;
                Ok(true)
            }
            None => {
                self.classify_and_pause("download stalled or timed out")
                    .await;
                Ok(false)
            }
        }
    }

    async fn classify_and_pause(&self, reason: &str) {
        let page_text = self.renderer.page_text().await.unwrap_or_default();
        if self.classifier.is_rate_limited(&page_text) {
            self.pacer.cooldown(reason).await;
        } else {
            self.pacer.retry_backoff(reason).await;
        }
    }

    /// Moves a finished artifact out of the work area into the acquisition
    /// area under the canonical name, deduplicating with a ` (n)` suffix.
    async fn place_artifact(
        &self,
        artifact: &Path,
        meta: &CaseMeta,
        seq: u32,
    ) -> Result<(), AppError> {
        let ext = artifact
            .extension()
            .and_then(OsStr::to_str)
            .unwrap_or("pdf");
        let name = naming::unit_file_name(
            &naming::safe_id(&meta.unit_id),
            &meta.origin,
            &meta.primary,
            &meta.secondary,
            seq,
            ext,
        );

        tokio::fs::create_dir_all(&self.acquire_dir).await?;
        let suffix = format!(".{ext}");
        let stem = name.trim_end_matches(&suffix).to_string();
        let mut dest = self.acquire_dir.join(&name);
        let mut dup = 2;
        while tokio::fs::try_exists(&dest).await? {
            dest = self.acquire_dir.join(format!("{stem} ({dup}){suffix}"));
            dup += 1;
        }

        tokio::fs::rename(artifact, &dest).await?;
        info!(artifact = %dest.display(), "artifact placed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use common::manifest::{store::FsManifestStore, ManifestStatus};
    use std::sync::Mutex;
    use tempfile::tempdir;

    use crate::renderer::CaseCard;
    use crate::throttle::MarkerPhraseClassifier;

    /// Scripted renderer: a fixed set of result pages plus a knob for where
    /// `request_page` really lands, and an optional download side effect.
    struct StubRenderer {
        pages: Vec<Vec<String>>,
        active: Mutex<u32>,
        lands_on: Option<u32>,
        work_dir: PathBuf,
        download_works: bool,
        downloads: Mutex<u32>,
    }

    impl StubRenderer {
        fn paging(pages: Vec<Vec<String>>, lands_on: Option<u32>) -> Self {
            Self {
                pages,
                active: Mutex::new(1),
                lands_on,
                work_dir: PathBuf::new(),
                download_works: false,
                downloads: Mutex::new(0),
            }
        }

        fn downloading(work_dir: PathBuf, download_works: bool) -> Self {
            Self {
                pages: vec![vec!["case-1".to_string()]],
                active: Mutex::new(1),
                lands_on: None,
                work_dir,
                download_works,
                downloads: Mutex::new(0),
            }
        }

        fn current(&self) -> u32 {
            *self.active.lock().expect("active lock")
        }
    }

    #[async_trait]
    impl PageRenderer for StubRenderer {
        async fn apply_filter(&self, _filter: &SearchFilter) -> Result<(), AppError> {
            *self.active.lock().expect("active lock") = 1;
            Ok(())
        }

        async fn result_ids(&self) -> Result<Vec<String>, AppError> {
            let page = self.current() as usize;
            Ok(self.pages.get(page - 1).cloned().unwrap_or_default())
        }

        async fn active_page(&self) -> Result<Option<u32>, AppError> {
            Ok(Some(self.current()))
        }

        async fn request_page(&self, page: u32) -> Result<bool, AppError> {
            if page as usize > self.pages.len() {
                return Ok(false);
            }
            *self.active.lock().expect("active lock") = self.lands_on.unwrap_or(page);
            Ok(true)
        }

        async fn open_case(&self, id: &str) -> Result<CaseCard, AppError> {
            Ok(CaseCard {
                meta: CaseMeta {
                    unit_id: "A40-77/2024".to_string(),
                    origin: String::new(),
                    primary: "Alfa Leasing LLC".to_string(),
                    secondary: vec!["Beta Trade LLC".to_string()],
                },
                documents: vec![format!("{id}/doc-1.pdf")],
                body_text: "finance lease dispute".to_string(),
            })
        }

        async fn trigger_download(&self, _document: &str) -> Result<(), AppError> {
            let mut downloads = self.downloads.lock().expect("downloads lock");
            *downloads += 1;
            if self.download_works {
                std::fs::write(self.work_dir.join(format!("dl-{downloads}.pdf")), b"%PDF")?;
            }
            Ok(())
        }

        async fn page_text(&self) -> Result<String, AppError> {
            Ok("results".to_string())
        }
    }

    fn test_config(root: &Path) -> AppConfig {
        AppConfig {
            work_dir: root.join("work").display().to_string(),
            acquire_dir: root.join("acquired").display().to_string(),
            origins: vec!["Commercial Court".to_string()],
            start_date: NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
            end_date: NaiveDate::from_ymd_opt(2024, 3, 1).expect("date"),
            page_wait_secs: 1,
            start_timeout_secs: 1,
            stall_timeout_secs: 1,
            per_file_timeout_secs: 1,
            delay_min_secs: 0,
            delay_max_secs: 0,
            retry_backoff_min_secs: 0,
            retry_backoff_max_secs: 0,
            rate_limit_cooldown_secs: 0,
            ..AppConfig::default()
        }
    }

    fn acquirer(renderer: Arc<dyn PageRenderer>, config: &AppConfig) -> Acquirer {
        let manifests = Arc::new(FsManifestStore::new(PathBuf::from(&config.acquire_dir)));
        Acquirer::new(
            renderer,
            manifests,
            Arc::new(MarkerPhraseClassifier::default()),
            config,
        )
        .expect("acquirer")
    }

    fn two_pages() -> Vec<Vec<String>> {
        vec![
            vec!["case-1".to_string(), "case-2".to_string()],
            vec!["case-3".to_string(), "case-4".to_string()],
        ]
    }

    #[tokio::test]
    async fn advance_accepts_exact_target_landing() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let renderer = Arc::new(StubRenderer::paging(two_pages(), None));
        let acquirer = acquirer(renderer.clone(), &config);

        let before = PageSignature::of(&renderer.result_ids().await.expect("ids"));
        let advanced = acquirer.advance_page(1, &before).await.expect("advance");
        assert!(advanced);
        assert_eq!(renderer.current(), 2);
    }

    #[tokio::test]
    async fn advance_rejects_multi_page_jump() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path());
        // request_page(2) really lands on page 3: content changes but the
        // active-page indicator never equals the target.
        let pages = vec![
            vec!["case-1".to_string()],
            vec!["case-2".to_string()],
            vec!["case-3".to_string()],
        ];
        let renderer = Arc::new(StubRenderer::paging(pages, Some(3)));
        let acquirer = acquirer(renderer.clone(), &config);

        let before = PageSignature::of(&renderer.result_ids().await.expect("ids"));
        let result = acquirer.advance_page(1, &before).await;
        assert!(matches!(result, Err(AppError::Transient(_))));
    }

    #[tokio::test]
    async fn advance_reports_missing_next_page() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path());
        let renderer = Arc::new(StubRenderer::paging(vec![vec!["case-1".to_string()]], None));
        let acquirer = acquirer(renderer.clone(), &config);

        let before = PageSignature::of(&renderer.result_ids().await.expect("ids"));
        let advanced = acquirer.advance_page(1, &before).await.expect("advance");
        assert!(!advanced);
    }

    #[tokio::test]
    async fn successful_fetch_seals_complete_manifest_and_places_file() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.work_dir).expect("work dir");
        let renderer = Arc::new(StubRenderer::downloading(
            PathBuf::from(&config.work_dir),
            true,
        ));
        let acquirer = acquirer(renderer, &config);

        acquirer.run().await.expect("run");

        let manifests = FsManifestStore::new(PathBuf::from(&config.acquire_dir));
        let listed = manifests.list().await.expect("list");
        assert_eq!(listed.len(), 1);
        let manifest = &listed[0];
        assert_eq!(manifest.status, ManifestStatus::Complete);
        assert_eq!(manifest.have, 1);
        assert_eq!(manifest.expected, 1);
        assert_eq!(manifest.origin, "Commercial Court");

        let placed: Vec<_> = std::fs::read_dir(&config.acquire_dir)
            .expect("read acquire dir")
            .filter_map(Result::ok)
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .filter(|n| n.ends_with(".pdf"))
            .collect();
        assert_eq!(placed.len(), 1);
        let parsed = naming::parse_unit_file_stem(placed[0].trim_end_matches(".pdf"));
        assert_eq!(parsed.unit_id, Some("A40-77/2024".to_string()));
        assert_eq!(parsed.origin, Some("Commercial Court".to_string()));
    }

    #[tokio::test]
    async fn failed_fetch_seals_partial_manifest() {
        let dir = tempdir().expect("tempdir");
        let config = test_config(dir.path());
        std::fs::create_dir_all(&config.work_dir).expect("work dir");
        let renderer = Arc::new(StubRenderer::downloading(
            PathBuf::from(&config.work_dir),
            false,
        ));
        let acquirer = acquirer(renderer.clone(), &config);

        acquirer.run().await.expect("run");

        // First pass plus exactly one retry pass.
        assert_eq!(*renderer.downloads.lock().expect("downloads"), 2);

        let manifests = FsManifestStore::new(PathBuf::from(&config.acquire_dir));
        let listed = manifests.list().await.expect("list");
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].status, ManifestStatus::Partial);
        assert_eq!(listed[0].have, 0);
    }
}
