use std::{
    path::PathBuf,
    sync::{Arc, Mutex},
};

use async_trait::async_trait;
use headless_chrome::{Browser, LaunchOptionsBuilder, Tab};
use tracing::{debug, info, warn};

use common::{error::AppError, utils::config::AppConfig, utils::naming};

use super::{CaseCard, CaseMeta, PageRenderer, SearchFilter};

const CASE_LINK_SELECTOR: &str = "a.case-link";
const PAGER_SELECTOR: &str = "#pages";
const ORIGIN_SELECTOR: &str = ".court-name";
const PRIMARY_SELECTOR: &str = "td.plaintiffs li";
const SECONDARY_SELECTOR: &str = "td.defendants li";
const DOCUMENT_SELECTOR: &str = "a[href$='.pdf']";

/// `headless_chrome`-backed renderer. Calls into the browser are blocking;
/// the acquirer is the only caller and runs them inline, accepting the block
/// the same way the rest of the pipeline accepts filesystem latency.
pub struct ChromeRenderer {
    browser: Browser,
    results_tab: Arc<Tab>,
    download_tab: Mutex<Option<Arc<Tab>>>,
    current_filter: Mutex<Option<SearchFilter>>,
    search_url_template: String,
    work_dir: PathBuf,
}

impl ChromeRenderer {
    pub fn new(config: &AppConfig) -> Result<Self, AppError> {
        let options = LaunchOptionsBuilder::default()
            .headless(true)
            .sandbox(false)
            .build()
            .map_err(|e| AppError::Processing(e.to_string()))?;
        let browser = Browser::new(options)?;
        let results_tab = browser.new_tab()?;

        let renderer = Self {
            browser,
            results_tab,
            download_tab: Mutex::new(None),
            current_filter: Mutex::new(None),
            search_url_template: config.search_url_template.clone(),
            work_dir: PathBuf::from(&config.work_dir),
        };
        renderer.allow_downloads()?;
        info!("browser session started");
        Ok(renderer)
    }

    fn allow_downloads(&self) -> Result<(), AppError> {
        use headless_chrome::protocol::cdp::Browser::{
            SetDownloadBehavior, SetDownloadBehaviorBehaviorOption,
        };

        self.results_tab.call_method(SetDownloadBehavior {
            behavior: SetDownloadBehaviorBehaviorOption::Allow,
            browser_context_id: None,
            download_path: Some(self.work_dir.display().to_string()),
            events_enabled: None,
        })?;
        Ok(())
    }

    fn search_url(&self, filter: &SearchFilter, page: u32) -> String {
        self.search_url_template
            .replace("{origin}", &filter.origin.replace(' ', "+"))
            .replace("{date}", &filter.date.format("%Y-%m-%d").to_string())
            .replace("{page}", &page.to_string())
    }

    fn eval_value(&self, tab: &Tab, js: &str) -> Result<serde_json::Value, AppError> {
        let result = tab.evaluate(js, false)?;
        Ok(result.value.unwrap_or(serde_json::Value::Null))
    }

    fn eval_string(&self, tab: &Tab, js: &str) -> Result<String, AppError> {
        Ok(self
            .eval_value(tab, js)?
            .as_str()
            .unwrap_or_default()
            .to_string())
    }

    /// Runs a JS expression expected to produce `JSON.stringify`-ed string
    /// array and parses it back.
    fn eval_string_vec(&self, tab: &Tab, js: &str) -> Result<Vec<String>, AppError> {
        let raw = self.eval_string(tab, js)?;
        if raw.is_empty() {
            return Ok(Vec::new());
        }
        let parsed: Vec<String> = serde_json::from_str(&raw)?;
        Ok(parsed)
    }

    fn collect_texts(&self, tab: &Tab, selector: &str) -> Result<Vec<String>, AppError> {
        let js = format!(
            "JSON.stringify(Array.from(document.querySelectorAll(\"{selector}\"))\
             .map(e => (e.textContent || '').trim()).filter(t => t.length))"
        );
        self.eval_string_vec(tab, &js)
    }

    fn visible_text(&self, tab: &Tab) -> Result<String, AppError> {
        let text =
            self.eval_string(tab, "document.body ? document.body.innerText : ''")?;
        if !text.is_empty() {
            return Ok(text);
        }
        Ok(tab.get_content().unwrap_or_default())
    }
}

#[async_trait]
impl PageRenderer for ChromeRenderer {
    async fn apply_filter(&self, filter: &SearchFilter) -> Result<(), AppError> {
        let url = self.search_url(filter, 1);
        debug!(%url, "applying filter");
        self.results_tab.navigate_to(&url)?.wait_until_navigated()?;
        if let Ok(mut current) = self.current_filter.lock() {
            *current = Some(filter.clone());
        }
        Ok(())
    }

    async fn result_ids(&self) -> Result<Vec<String>, AppError> {
        let js = format!(
            "JSON.stringify(Array.from(document.querySelectorAll(\"{CASE_LINK_SELECTOR}\"))\
             .map(a => a.href || ''))"
        );
        self.eval_string_vec(&self.results_tab, &js)
    }

    async fn active_page(&self) -> Result<Option<u32>, AppError> {
        let js = format!(
            "(document.querySelector(\"{PAGER_SELECTOR} li.active\") || {{}}).textContent || ''"
        );
        let text = self.eval_string(&self.results_tab, &js)?;
        let digits: String = text.chars().filter(char::is_ascii_digit).collect();
        Ok(digits.parse().ok())
    }

    async fn request_page(&self, page: u32) -> Result<bool, AppError> {
        // Click the explicit page-number link; clicking "next" risks a
        // multi-page jump when the pager is rendered from stale state.
        let js = format!(
            "(() => {{\
               const links = Array.from(document.querySelectorAll(\"{PAGER_SELECTOR} a\"));\
               const target = links.find(a => (a.textContent || '').trim() === '{page}');\
               if (!target) return false;\
               target.scrollIntoView({{block: 'end'}});\
               target.click();\
               return true;\
             }})()"
        );
        let value = self.eval_value(&self.results_tab, &js)?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn open_case(&self, id: &str) -> Result<CaseCard, AppError> {
        let tab = self.browser.new_tab()?;
        tab.navigate_to(id)?.wait_until_navigated()?;

        let body_text = self.visible_text(&tab)?;
        let origin = self
            .collect_texts(&tab, ORIGIN_SELECTOR)?
            .into_iter()
            .max_by_key(String::len)
            .unwrap_or_default();
        let primary = self.collect_texts(&tab, PRIMARY_SELECTOR)?.join("; ");
        let secondary = self.collect_texts(&tab, SECONDARY_SELECTOR)?;
        let documents = {
            let js = format!(
                "JSON.stringify(Array.from(document.querySelectorAll(\"{DOCUMENT_SELECTOR}\"))\
                 .map(a => a.href || '').filter(h => h.length))"
            );
            self.eval_string_vec(&tab, &js)?
        };
        let unit_id = naming::find_unit_id(&body_text).unwrap_or_default();

        if let Err(err) = tab.close(true) {
            warn!(error = %err, "failed to close case tab");
        }

        Ok(CaseCard {
            meta: CaseMeta {
                unit_id,
                origin,
                primary,
                secondary,
            },
            documents,
            body_text,
        })
    }

    async fn trigger_download(&self, document: &str) -> Result<(), AppError> {
        if let Ok(mut slot) = self.download_tab.lock() {
            if let Some(previous) = slot.take() {
                if let Err(err) = previous.close(true) {
                    debug!(error = %err, "previous download tab already gone");
                }
            }
        }

        let tab = self.browser.new_tab()?;
        // Navigating at a document URL starts the download; the navigation
        // itself may be aborted by the browser, which is not a failure here.
        if let Err(err) = tab.navigate_to(document) {
            warn!(%document, error = %err, "download navigation reported an error");
        }
        if let Ok(mut slot) = self.download_tab.lock() {
            *slot = Some(tab);
        }
        Ok(())
    }

    async fn page_text(&self) -> Result<String, AppError> {
        self.visible_text(&self.results_tab)
    }
}
