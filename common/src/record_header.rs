use crate::utils::naming::{find_unit_id, is_empty_token};

/// Normalized header fields shared by the Assembler (which writes them at the
/// top of every merged record) and the Indexer (which reads them back as
/// retrieval metadata).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeaderFields {
    pub unit_id: Option<String>,
    pub origin: Option<String>,
    pub primary: Option<String>,
    pub secondary: Vec<String>,
}

const BORDER_WIDTH: usize = 80;
const HEADER_TITLE: &str = " CASE HEADER ";
/// Only the head of a record is scanned when parsing; bodies can be megabytes.
const HEADER_SLICE: usize = 6000;

const LABEL_UNIT: &str = "Case No:";
const LABEL_ORIGIN: &str = "Court:";
const LABEL_PRIMARY: &str = "Claimant:";
const LABEL_SECONDARY: &str = "Respondents:";

pub fn build_header(fields: &HeaderFields) -> String {
    let secondary = if fields.secondary.is_empty() {
        "N/A".to_string()
    } else {
        fields.secondary.join("; ")
    };
    let value_or_na = |v: &Option<String>| v.clone().unwrap_or_else(|| "N/A".to_string());

    let border = "=".repeat(BORDER_WIDTH);
    let pad = BORDER_WIDTH.saturating_sub(HEADER_TITLE.len()) / 2;
    let title_line = format!(
        "{}{}{}",
        "=".repeat(pad),
        HEADER_TITLE,
        "=".repeat(BORDER_WIDTH.saturating_sub(HEADER_TITLE.len() + pad))
    );

    format!(
        "{title_line}\n{LABEL_UNIT} {}\n{LABEL_ORIGIN} {}\n{LABEL_PRIMARY} {}\n{LABEL_SECONDARY} {}\n{border}\n\n",
        value_or_na(&fields.unit_id),
        value_or_na(&fields.origin),
        value_or_na(&fields.primary),
        secondary,
    )
}

fn clean_value(raw: &str) -> Option<String> {
    let cleaned = raw
        .replace('\u{00a0}', " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if cleaned.is_empty() || is_empty_token(&cleaned) {
        None
    } else {
        Some(cleaned)
    }
}

fn split_parties(raw: &str) -> Vec<String> {
    raw.split([';', ','])
        .filter_map(clean_value)
        .collect()
}

/// Parses the header block back out of a merged record. Tolerant of CRLF and
/// of records with no header at all (every field comes back empty).
pub fn parse_header(text: &str) -> HeaderFields {
    let head: String = text.chars().take(HEADER_SLICE).collect();
    let head = head.replace("\r\n", "\n").replace('\r', "\n");

    let mut fields = HeaderFields::default();
    for line in head.lines() {
        let line = line.trim();
        if line.starts_with("===") && fields.unit_id.is_some() {
            // closing border: the header block is done
            break;
        }
        if let Some(rest) = line.strip_prefix(LABEL_UNIT) {
            fields.unit_id = clean_value(rest).and_then(|v| find_unit_id(&v));
        } else if let Some(rest) = line.strip_prefix(LABEL_ORIGIN) {
            fields.origin = clean_value(rest);
        } else if let Some(rest) = line.strip_prefix(LABEL_PRIMARY) {
            fields.primary = clean_value(rest);
        } else if let Some(rest) = line.strip_prefix(LABEL_SECONDARY) {
            fields.secondary = split_parties(rest);
        }
    }
    fields
}
