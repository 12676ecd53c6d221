use std::path::{Path, PathBuf};

use async_trait::async_trait;

use common::error::AppError;

/// The durable "done set" of the indexing loop. Abstract so the shipped
/// rename implementation can be replaced by a key-value ledger without
/// touching the loop.
#[async_trait]
pub trait ProcessedLedger: Send + Sync {
    fn is_processed(&self, path: &Path) -> bool;
    async fn mark_processed(&self, path: &Path) -> Result<PathBuf, AppError>;
}

/// Marks a record by inserting a tag before its extension:
/// `decision.txt` → `decision.indexed.txt`. The rename is the durability
/// boundary; on restart the scan simply skips marked names.
#[derive(Debug, Clone)]
pub struct RenameLedger {
    tag: String,
}

impl RenameLedger {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: format!(".{}", tag.trim_matches('.')),
        }
    }

    fn marked_name(&self, path: &Path) -> PathBuf {
        let stem = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default();
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => path.with_file_name(format!("{stem}{}.{ext}", self.tag)),
            None => path.with_file_name(format!("{stem}{}", self.tag)),
        }
    }
}

impl Default for RenameLedger {
    fn default() -> Self {
        Self::new("indexed")
    }
}

#[async_trait]
impl ProcessedLedger for RenameLedger {
    fn is_processed(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => name.ends_with(&format!("{}.{ext}", self.tag)),
            None => name.ends_with(&self.tag),
        }
    }

    async fn mark_processed(&self, path: &Path) -> Result<PathBuf, AppError> {
        let marked = self.marked_name(path);
        tokio::fs::rename(path, &marked).await?;
        Ok(marked)
    }
}
