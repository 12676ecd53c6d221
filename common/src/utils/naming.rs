use std::sync::OnceLock;

use regex::Regex;

/// Characters that cannot appear in a filename component on any of the
/// filesystems the shared directories may be mounted from.
const INVALID_FS: &str = "<>:\"/\\|?*";

/// Values treated as "no data" when merging header fields.
const EMPTY_TOKENS: [&str; 5] = ["", "n/a", "na", "none", "unknown"];

/// Docket numbers look like `A40-12345/2024` (court code, serial, year) or
/// `IP-715/2022` for the specialized court; the year separator is tolerant of
/// `-`, `/` and `_` because the filesystem-safe form replaces `/`.
fn unit_id_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(?:[A-Z]{1,2}\d{1,3}-\d{1,7}[-/_]\d{4})|(?:IP-\d{1,7}(?:[-/_]\d{4})?)")
            .expect("unit id pattern is valid")
    })
}

fn segment_split_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\s+[—–-]\s+").expect("segment pattern is valid"))
}

pub fn is_empty_token(value: &str) -> bool {
    let lowered = value.trim().to_lowercase();
    EMPTY_TOKENS.contains(&lowered.as_str())
}

fn collapse_whitespace(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Filesystem-safe rendition of an arbitrary string: whitespace collapsed,
/// reserved characters replaced, trailing dots stripped, bounded length.
/// Never returns an empty string.
pub fn sanitize_component(value: &str, max_len: usize) -> String {
    let collapsed = collapse_whitespace(value);
    let mut sanitized: String = collapsed
        .chars()
        .map(|c| if INVALID_FS.contains(c) { '_' } else { c })
        .collect();
    sanitized = sanitized.trim_end_matches(['.', ' ']).to_string();
    if sanitized.chars().count() > max_len {
        sanitized = sanitized.chars().take(max_len).collect();
        sanitized = sanitized.trim_end_matches(['.', ' ']).to_string();
    }
    if sanitized.is_empty() {
        "NA".to_string()
    } else {
        sanitized
    }
}

/// Canonical form of a unit identifier: uppercase, `_` (the filesystem-safe
/// stand-in) restored to `/`, runs of separators collapsed to their first
/// character.
pub fn normalize_unit_id(raw: &str) -> String {
    let mut normalized = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for c in raw.trim().to_uppercase().chars() {
        let mapped = if c == '_' { '/' } else { c };
        let is_sep = matches!(mapped, '-' | '/');
        if is_sep && last_was_sep {
            continue;
        }
        last_was_sep = is_sep;
        normalized.push(mapped);
    }
    normalized
}

/// Finds the first docket number in `text`, normalized.
pub fn find_unit_id(text: &str) -> Option<String> {
    unit_id_regex()
        .find(text)
        .map(|m| normalize_unit_id(m.as_str()))
}

/// Filename prefix for a unit; unique enough because docket numbers are.
pub fn safe_id(unit_id: &str) -> String {
    sanitize_component(unit_id, 40)
}

/// Builds the canonical unit file name:
/// `<safe_id> — <origin> — <primary> — <secondary;…> — <seq>.<ext>`.
pub fn unit_file_name(
    safe_id: &str,
    origin: &str,
    primary: &str,
    secondary: &[String],
    seq: u32,
    ext: &str,
) -> String {
    let origin = sanitize_component(origin, 70);
    let primary = sanitize_component(primary, 70);
    let secondary = sanitize_component(&secondary.join("; "), 70);
    format!("{safe_id} — {origin} — {primary} — {secondary} — {seq:02}.{ext}")
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParsedFileName {
    pub unit_id: Option<String>,
    pub origin: Option<String>,
    pub primary: Option<String>,
    pub secondary: Vec<String>,
}

fn cleanup_entity(value: &str) -> Option<String> {
    let cleaned = collapse_whitespace(&value.replace('_', " "))
        .trim_matches([' ', ';', ','])
        .to_string();
    if cleaned.is_empty() || is_empty_token(&cleaned) {
        None
    } else {
        Some(cleaned)
    }
}

/// Parses a unit file stem back into its metadata segments. Segments beyond
/// the recognized four (plus the sequence number) are ignored.
pub fn parse_unit_file_stem(stem: &str) -> ParsedFileName {
    let parts: Vec<&str> = segment_split_regex()
        .split(stem)
        .map(str::trim)
        .collect();

    let mut parsed = ParsedFileName::default();
    if let Some(first) = parts.first() {
        parsed.unit_id = find_unit_id(first);
    }
    if let Some(origin) = parts.get(1) {
        parsed.origin = cleanup_entity(origin);
    }
    if let Some(primary) = parts.get(2) {
        parsed.primary = cleanup_entity(primary);
    }
    if let Some(secondary) = parts.get(3) {
        parsed.secondary = secondary.split(';').filter_map(cleanup_entity).collect();
    }
    parsed
}

/// Token of a natural-order sort key; numeric runs compare numerically so
/// `file-2` sorts before `file-10`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum NaturalToken {
    Number(u64),
    Text(String),
}

pub fn natural_key(value: &str) -> Vec<NaturalToken> {
    let mut key = Vec::new();
    let mut digits = String::new();
    let mut text = String::new();

    let mut flush_digits = |digits: &mut String, key: &mut Vec<NaturalToken>| {
        if !digits.is_empty() {
            match digits.parse::<u64>() {
                Ok(n) => key.push(NaturalToken::Number(n)),
                Err(_) => key.push(NaturalToken::Text(std::mem::take(digits))),
            }
            digits.clear();
        }
    };

    for c in value.chars() {
        if c.is_ascii_digit() {
            if !text.is_empty() {
                key.push(NaturalToken::Text(std::mem::take(&mut text).to_lowercase()));
            }
            digits.push(c);
        } else {
            flush_digits(&mut digits, &mut key);
            text.push(c);
        }
    }
    flush_digits(&mut digits, &mut key);
    if !text.is_empty() {
        key.push(NaturalToken::Text(text.to_lowercase()));
    }
    key
}
