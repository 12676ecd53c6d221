use chrono::NaiveDate;
use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Copy, Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingBackend {
    Openai,
    Hashed,
}

/// Every tuning constant of the pipeline lives here so nothing is a hardcoded
/// magic number; values come from an optional `config` file merged with
/// environment variables.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    // Remote source
    pub search_url_template: String,
    pub origins: Vec<String>,
    pub excluded_origins: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub max_pages: u32,
    pub download_all: bool,

    // Relevance gate
    pub relevance_strict: Vec<String>,
    pub relevance_near: Vec<String>,
    pub relevance_anchor: String,
    pub relevance_window: usize,

    // Directories shared between the actors
    pub work_dir: String,
    pub acquire_dir: String,
    pub handoff_dir: String,
    pub merged_dir: String,

    // Acquisition pacing and timeouts (seconds unless noted)
    pub page_wait_secs: u64,
    pub start_timeout_secs: u64,
    pub stall_timeout_secs: u64,
    pub per_file_timeout_secs: u64,
    pub delay_min_secs: u64,
    pub delay_max_secs: u64,
    pub retry_backoff_min_secs: u64,
    pub retry_backoff_max_secs: u64,
    pub rate_limit_cooldown_secs: u64,
    pub daily_break_hours: u64,
    pub partial_suffix: String,

    // Relocator / handoff polling
    pub poll_interval_secs: u64,

    // Indexer
    pub index_poll_secs: u64,
    pub index_max_backoff_secs: u64,
    pub file_stable_secs: u64,
    pub chunk_chars: usize,
    pub chunk_overlap_chars: usize,
    pub embed_batch_size: usize,

    // Embedding service
    pub embedding_backend: EmbeddingBackend,
    pub embedding_model: String,
    pub embedding_dimensions: u32,
    pub openai_api_key: String,
    pub openai_base_url: String,

    // Vector store
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    pub surrealdb_namespace: String,
    pub surrealdb_database: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            search_url_template:
                "https://docket.example.org/search?origin={origin}&date={date}&page={page}"
                    .to_string(),
            origins: Vec::new(),
            excluded_origins: Vec::new(),
            start_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default(),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or_default(),
            max_pages: 40,
            download_all: false,
            relevance_strict: vec![
                r"(?i)\bleasing\b".to_string(),
                r"(?i)\blease(?:s|d)?\b".to_string(),
                r"(?i)\bfinance\s+lease\b".to_string(),
                r"(?i)\blessor\b".to_string(),
                r"(?i)\blessee\b".to_string(),
                r"(?i)\bsub-?lease\w*\b".to_string(),
                r"(?i)\blease\s+payment\w*\b".to_string(),
            ],
            relevance_near: vec![r"(?i)\bbalance\s+of\s+mutual\s+obligations\b".to_string()],
            relevance_anchor: r"(?i)leas(?:e|ing)|finance\s+lease".to_string(),
            relevance_window: 120,
            work_dir: "./data/work".to_string(),
            acquire_dir: "./data/acquired".to_string(),
            handoff_dir: "./data/handoff".to_string(),
            merged_dir: "./data/merged".to_string(),
            page_wait_secs: 60,
            start_timeout_secs: 45,
            stall_timeout_secs: 40,
            per_file_timeout_secs: 600,
            delay_min_secs: 9,
            delay_max_secs: 15,
            retry_backoff_min_secs: 20,
            retry_backoff_max_secs: 45,
            rate_limit_cooldown_secs: 180,
            daily_break_hours: 5,
            partial_suffix: "crdownload".to_string(),
            poll_interval_secs: 2,
            index_poll_secs: 120,
            index_max_backoff_secs: 900,
            file_stable_secs: 2,
            chunk_chars: 3200,
            chunk_overlap_chars: 640,
            embed_batch_size: 128,
            embedding_backend: EmbeddingBackend::Openai,
            embedding_model: "text-embedding-3-small".to_string(),
            embedding_dimensions: 768,
            openai_api_key: String::new(),
            openai_base_url: "https://api.openai.com/v1".to_string(),
            surrealdb_address: "ws://localhost:8000".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: "docket".to_string(),
            surrealdb_database: "docket".to_string(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
