pub mod chrome;

use async_trait::async_trait;
use chrono::NaiveDate;

use common::error::AppError;

/// One (origin, date) slice of the result space. A failure inside one filter
/// never aborts the others.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchFilter {
    pub origin: String,
    pub date: NaiveDate,
}

/// Case metadata scraped from an opened result card.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaseMeta {
    pub unit_id: String,
    pub origin: String,
    pub primary: String,
    pub secondary: Vec<String>,
}

/// An opened result item: its metadata, the identifiers of the documents that
/// can be downloaded from it, and its visible text (for the relevance gate).
#[derive(Debug, Clone, Default)]
pub struct CaseCard {
    pub meta: CaseMeta,
    pub documents: Vec<String>,
    pub body_text: String,
}

/// Content signature of a result page: the first few result identifiers.
/// Page transitions are validated by signature change, never by trusting that
/// a click succeeded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct PageSignature(Vec<String>);

impl PageSignature {
    pub const WIDTH: usize = 5;

    pub fn of(ids: &[String]) -> Self {
        Self(ids.iter().take(Self::WIDTH).cloned().collect())
    }

    /// A signature with no non-empty identifier cannot prove a transition.
    pub fn is_blank(&self) -> bool {
        self.0.iter().all(String::is_empty)
    }
}

/// Boundary to the mechanism that renders result pages and serves downloads.
/// Everything behind this trait is an external collaborator; the acquisition
/// state machine only relies on the contract below.
#[async_trait]
pub trait PageRenderer: Send + Sync {
    /// Applies a filter combination and lands on its first result page.
    async fn apply_filter(&self, filter: &SearchFilter) -> Result<(), AppError>;

    /// Identifiers of the results on the currently rendered page, in order.
    async fn result_ids(&self) -> Result<Vec<String>, AppError>;

    /// The page number the UI currently marks active, if determinable.
    async fn active_page(&self) -> Result<Option<u32>, AppError>;

    /// Requests a transition to `page`. Returns false when the UI offers no
    /// way there (last page). A true return proves nothing; the caller must
    /// validate the landing.
    async fn request_page(&self, page: u32) -> Result<bool, AppError>;

    /// Opens one result item and scrapes its card.
    async fn open_case(&self, id: &str) -> Result<CaseCard, AppError>;

    /// Triggers the download of one document into the work area. Landing and
    /// completion are observed through the work area, not through this call.
    async fn trigger_download(&self, document: &str) -> Result<(), AppError>;

    /// Visible text of the current page, for rate-limit phrase detection.
    async fn page_text(&self) -> Result<String, AppError>;
}
