use regex::Regex;
use tracing::debug;

use common::{error::AppError, utils::config::AppConfig};

/// Topic gate evaluated on a case card's visible text. Strict patterns are
/// self-sufficient; near patterns only count when an anchor pattern occurs
/// within `window` characters of the match.
pub struct RelevanceGate {
    strict: Vec<Regex>,
    near: Vec<Regex>,
    anchor: Regex,
    window: usize,
    bypass: bool,
}

impl RelevanceGate {
    pub fn from_config(config: &AppConfig) -> Result<Self, AppError> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>, AppError> {
            patterns
                .iter()
                .map(|p| Regex::new(p).map_err(AppError::from))
                .collect()
        };
        Ok(Self {
            strict: compile(&config.relevance_strict)?,
            near: compile(&config.relevance_near)?,
            anchor: Regex::new(&config.relevance_anchor)?,
            window: config.relevance_window,
            bypass: config.download_all,
        })
    }

    pub fn is_relevant(&self, text: &str) -> bool {
        if self.bypass {
            return true;
        }
        if let Some(hit) = self.strict_hit(text) {
            debug!(hit, "relevance: strict match");
            return true;
        }
        if let Some(hit) = self.near_hit(text) {
            debug!(hit, window = self.window, "relevance: near match");
            return true;
        }
        false
    }

    fn strict_hit<'t>(&self, text: &'t str) -> Option<&'t str> {
        self.strict
            .iter()
            .find_map(|pattern| pattern.find(text).map(|m| m.as_str()))
    }

    fn near_hit<'t>(&self, text: &'t str) -> Option<&'t str> {
        for pattern in &self.near {
            for m in pattern.find_iter(text) {
                let start = floor_char_boundary(text, m.start().saturating_sub(self.window));
                let end = ceil_char_boundary(text, (m.end() + self.window).min(text.len()));
                if self.anchor.is_match(&text[start..end]) {
                    return Some(m.as_str());
                }
            }
        }
        None
    }
}

fn floor_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx > 0 && !text.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

fn ceil_char_boundary(text: &str, mut idx: usize) -> usize {
    while idx < text.len() && !text.is_char_boundary(idx) {
        idx += 1;
    }
    idx
}
