use std::sync::Mutex;

use chrono::{NaiveDate, Utc};
use rand::Rng;
use tokio::time::{sleep, Duration};
use tracing::{debug, info, warn};

use common::utils::config::AppConfig;

/// Decides whether a page's visible text looks like an upstream rate-limit
/// response. Inherently fuzzy, so it lives behind a trait: detection rules
/// can evolve without touching the retry/backoff logic.
pub trait ThrottleClassifier: Send + Sync {
    fn is_rate_limited(&self, page_text: &str) -> bool;
}

/// Marker-phrase heuristic: a numeric status code or any known phrase in the
/// page title/body counts as throttled.
#[derive(Debug, Clone)]
pub struct MarkerPhraseClassifier {
    markers: Vec<String>,
}

impl MarkerPhraseClassifier {
    pub fn new(markers: Vec<String>) -> Self {
        Self {
            markers: markers.into_iter().map(|m| m.to_lowercase()).collect(),
        }
    }
}

impl Default for MarkerPhraseClassifier {
    fn default() -> Self {
        Self::new(vec![
            "429".to_string(),
            "too many requests".to_string(),
            "request limit exceeded".to_string(),
            "temporarily blocked".to_string(),
        ])
    }
}

impl ThrottleClassifier for MarkerPhraseClassifier {
    fn is_rate_limited(&self, page_text: &str) -> bool {
        let lowered = page_text.to_lowercase();
        self.markers.iter().any(|marker| lowered.contains(marker))
    }
}

/// Central pacing of outbound requests: small randomized delays before every
/// fetch, randomized backoff after failures, a long cooldown after throttle
/// detection and one human-scale pause per calendar day.
pub struct Pacer {
    delay_range: (u64, u64),
    retry_range: (u64, u64),
    cooldown: Duration,
    daily_break: Duration,
    last_break: Mutex<Option<NaiveDate>>,
}

impl Pacer {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            delay_range: (config.delay_min_secs, config.delay_max_secs),
            retry_range: (config.retry_backoff_min_secs, config.retry_backoff_max_secs),
            cooldown: Duration::from_secs(config.rate_limit_cooldown_secs),
            daily_break: Duration::from_secs(config.daily_break_hours * 3600),
            last_break: Mutex::new(None),
        }
    }

    fn pick(range: (u64, u64)) -> Duration {
        let (min, max) = range;
        let secs = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_secs(secs)
    }

    /// Jittered pause before every fetch attempt, success or failure.
    pub async fn inter_request_delay(&self) {
        let pause = Self::pick(self.delay_range);
        debug!(secs = pause.as_secs(), "inter-request delay");
        sleep(pause).await;
    }

    /// Short randomized backoff after a non-throttle failure.
    pub async fn retry_backoff(&self, reason: &str) {
        let pause = Self::pick(self.retry_range);
        info!(secs = pause.as_secs(), reason, "backing off");
        sleep(pause).await;
    }

    /// Long cooldown after the classifier flags a throttle response.
    pub async fn cooldown(&self, reason: &str) {
        warn!(secs = self.cooldown.as_secs(), reason, "rate-limit cooldown");
        sleep(self.cooldown).await;
    }

    /// One long pause per calendar day of operation. The first call only
    /// records the date; a date change triggers the pause. Best-effort: a
    /// poisoned lock skips the break rather than failing the run.
    pub async fn daily_break_if_due(&self) {
        let due = {
            let Ok(mut last) = self.last_break.lock() else {
                return;
            };
            let today = Utc::now().date_naive();
            match *last {
                None => {
                    *last = Some(today);
                    false
                }
                Some(date) if date != today => {
                    *last = Some(today);
                    true
                }
                Some(_) => false,
            }
        };

        if due {
            warn!(
                hours = self.daily_break.as_secs() / 3600,
                "daily break to keep the access pattern human-scale"
            );
            sleep(self.daily_break).await;
        }
    }
}
