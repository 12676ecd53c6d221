use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::Arc,
};

use tracing::{info, warn};

use common::{
    error::AppError,
    manifest::MANIFEST_SUFFIX,
    record_header::{build_header, HeaderFields},
    utils::naming::{self, natural_key, ParsedFileName},
};

/// Boundary to the content-extraction collaborator: one fetched file in,
/// extracted text out. An empty result means the file has no text layer.
pub trait TextExtractor: Send + Sync {
    fn extract_text(&self, path: &Path) -> Result<String, AppError>;
}

/// Text-layer PDF extraction; scans come back empty rather than erroring the
/// unit.
#[derive(Debug, Default)]
pub struct PdfTextExtractor;

impl TextExtractor for PdfTextExtractor {
    fn extract_text(&self, path: &Path) -> Result<String, AppError> {
        let text = pdf_extract::extract_text(path)
            .map_err(|err| AppError::Processing(format!("{}: {err}", path.display())))?;
        Ok(normalize_extracted(&text))
    }
}

fn normalize_extracted(text: &str) -> String {
    let text = text.replace('\r', "");
    let trimmed_lines: Vec<&str> = text.lines().map(str::trim_end).collect();
    trimmed_lines.join("\n").trim().to_string()
}

struct FileEntry {
    path: PathBuf,
    file_name: String,
    parsed: ParsedFileName,
    text: String,
}

#[derive(Default)]
struct UnitBucket {
    files: Vec<FileEntry>,
}

impl UnitBucket {
    /// First non-empty value wins for single-valued fields.
    fn merge_scalar(&self, pick: impl Fn(&ParsedFileName) -> Option<&String>) -> Option<String> {
        self.files
            .iter()
            .find_map(|entry| pick(&entry.parsed).cloned())
    }

    /// Order-preserving, case-insensitive union for the party list.
    fn merge_secondary(&self) -> Vec<String> {
        let mut seen = std::collections::HashSet::new();
        let mut merged = Vec::new();
        for entry in &self.files {
            for party in &entry.parsed.secondary {
                let key = party.to_lowercase();
                if !naming::is_empty_token(&key) && seen.insert(key) {
                    merged.push(party.clone());
                }
            }
        }
        merged
    }
}

/// Merges every unit's files in the handoff area into one normalized record.
/// Files whose identifier cannot be parsed are preserved individually in the
/// `unidentified/` area instead of being dropped. Consumed source files are
/// deleted after a successful write so a record is created exactly once.
pub struct Assembler {
    handoff_dir: PathBuf,
    merged_dir: PathBuf,
    unidentified_dir: PathBuf,
    extractor: Arc<dyn TextExtractor>,
    partial_suffix: String,
}

impl Assembler {
    pub fn new(
        handoff_dir: impl Into<PathBuf>,
        merged_dir: impl Into<PathBuf>,
        extractor: Arc<dyn TextExtractor>,
        partial_suffix: &str,
    ) -> Self {
        let merged_dir = merged_dir.into();
        Self {
            handoff_dir: handoff_dir.into(),
            unidentified_dir: merged_dir.join("unidentified"),
            merged_dir,
            extractor,
            partial_suffix: partial_suffix.trim_start_matches('.').to_string(),
        }
    }

    /// One assembly pass over the handoff area. Returns the number of merged
    /// records written.
    pub async fn assemble_all(&self) -> Result<usize, AppError> {
        let mut sources = self.source_files()?;
        if sources.is_empty() {
            return Ok(0);
        }
        sources.sort_by_key(|p| {
            natural_key(&p.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default())
        });

        let mut buckets: BTreeMap<String, UnitBucket> = BTreeMap::new();
        let mut singles: Vec<FileEntry> = Vec::new();

        for path in sources {
            let file_name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name.to_string(),
                None => continue,
            };
            let stem = file_name
                .rsplit_once('.')
                .map_or(file_name.as_str(), |(stem, _)| stem);
            let parsed = naming::parse_unit_file_stem(stem);

            let text = match self.extractor.extract_text(&path) {
                Ok(text) => text,
                Err(err) => {
                    warn!(file = %file_name, error = %err, "text extraction failed; leaving file");
                    continue;
                }
            };
            if text.is_empty() {
                warn!(file = %file_name, "no extractable text (scan?); skipping");
                continue;
            }

            let entry = FileEntry {
                path,
                file_name,
                parsed,
                text,
            };
            match entry.parsed.unit_id.clone() {
                Some(unit_id) => buckets.entry(unit_id).or_default().files.push(entry),
                None => singles.push(entry),
            }
        }

        let mut written = 0usize;
        for (unit_id, mut bucket) in buckets {
            bucket
                .files
                .sort_by_key(|entry| natural_key(&entry.file_name));
            match self.write_merged(&unit_id, &bucket).await {
                Ok(()) => {
                    written += 1;
                    self.consume(&bucket.files).await;
                }
                Err(err) => {
                    warn!(%unit_id, error = %err, "failed to write merged record; keeping sources");
                }
            }
        }

        for single in singles {
            match self.write_unidentified(&single).await {
                Ok(()) => self.consume(std::slice::from_ref(&single)).await,
                Err(err) => {
                    warn!(file = %single.file_name, error = %err, "failed to write unidentified record");
                }
            }
        }

        Ok(written)
    }

    fn source_files(&self) -> Result<Vec<PathBuf>, AppError> {
        let mut files = Vec::new();
        let read = match std::fs::read_dir(&self.handoff_dir) {
            Ok(read) => read,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(err) => return Err(err.into()),
        };
        for entry in read {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if name.ends_with(MANIFEST_SUFFIX) {
                continue;
            }
            if Path::new(name)
                .extension()
                .and_then(|e| e.to_str())
                .is_some_and(|e| e.eq_ignore_ascii_case(&self.partial_suffix))
            {
                continue;
            }
            files.push(entry.path());
        }
        Ok(files)
    }

    async fn write_merged(&self, unit_id: &str, bucket: &UnitBucket) -> Result<(), AppError> {
        let fields = HeaderFields {
            unit_id: Some(unit_id.to_string()),
            origin: bucket.merge_scalar(|p| p.origin.as_ref()),
            primary: bucket.merge_scalar(|p| p.primary.as_ref()),
            secondary: bucket.merge_secondary(),
        };

        let mut pieces = vec![build_header(&fields)];
        for entry in &bucket.files {
            pieces.push(entry.text.trim().to_string());
            pieces.push("\n\n".to_string());
        }
        let content = format!("{}\n", pieces.join("\n").trim());

        let target = self
            .merged_dir
            .join(format!("{}.txt", naming::safe_id(unit_id)));
        self.write_atomic(&target, &content).await?;
        info!(unit_id, files = bucket.files.len(), record = %target.display(), "merged record written");
        Ok(())
    }

    async fn write_unidentified(&self, entry: &FileEntry) -> Result<(), AppError> {
        let fields = HeaderFields {
            unit_id: None,
            origin: entry.parsed.origin.clone(),
            primary: entry.parsed.primary.clone(),
            secondary: entry.parsed.secondary.clone(),
        };
        let content = format!("{}{}\n", build_header(&fields), entry.text);

        let stem = entry
            .file_name
            .rsplit_once('.')
            .map_or(entry.file_name.as_str(), |(stem, _)| stem);
        let target = self
            .unidentified_dir
            .join(format!("{}.txt", naming::sanitize_component(stem, 200)));
        self.write_atomic(&target, &content).await?;
        info!(file = %entry.file_name, record = %target.display(), "unidentified record written");
        Ok(())
    }

    async fn write_atomic(&self, target: &Path, content: &str) -> Result<(), AppError> {
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let tmp = target.with_extension("txt.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, target).await?;
        Ok(())
    }

    async fn consume(&self, files: &[FileEntry]) {
        for entry in files {
            if let Err(err) = tokio::fs::remove_file(&entry.path).await {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!(file = %entry.file_name, error = %err, "failed to remove consumed file");
                }
            }
        }
    }
}
