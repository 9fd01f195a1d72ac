//! Citation helpers: quote verification, deep links, page numbers and
//! location markers.
//!
//! Every function here is deterministic. The extractor uses them after the
//! model call returns, so nothing the model reports about its own citation
//! is trusted without a check against the supplied chunk texts.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Deserializer};

/// Maximum number of characters of the quote used in a deep-link fragment.
pub const FRAGMENT_MAX_CHARS: usize = 60;

/// Maximum location markers kept per record.
pub const MAX_LOCATION_MARKERS: usize = 5;

/// Appended to extraction context that was cut short.
pub const TRUNCATION_MARKER: &str = "\n\n[DOCUMENT TRUNCATED]";

static PAGE_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)\[page\s+(\d+)\]",
        r"(?i)\bpage\s+(\d+)",
        r"(?i)\bp\.\s*(\d+)",
        r"(?i)\bpg\.\s*(\d+)",
        r"—\s*(\d+)\s*—",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("page pattern compiles"))
    .collect()
});

static MARKER_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^(?i)article\s+\d+",
        r"^(?i)section\s+\d+",
        r"^\d+\.\s+[A-Z][^.]*?\.",
        r"^[A-Z][^.]*:",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("marker pattern compiles"))
    .collect()
});

/// Lowercase and collapse every whitespace run into a single space.
pub fn normalize(text: &str) -> String {
    text.split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// True when `quote` is a normalized substring of at least one of `texts`.
///
/// An empty quote is never grounded.
pub fn quote_is_grounded<'a>(quote: &str, texts: impl IntoIterator<Item = &'a str>) -> bool {
    let needle = normalize(quote);
    if needle.is_empty() {
        return false;
    }
    texts.into_iter().any(|t| normalize(t).contains(&needle))
}

/// Passage text without a trailing [`TRUNCATION_MARKER`].
pub fn strip_truncation(text: &str) -> &str {
    text.strip_suffix(TRUNCATION_MARKER).unwrap_or(text)
}

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "for", "from", "in", "is", "it", "of", "on",
    "or", "shall", "that", "the", "this", "to", "was", "will", "with",
];

/// Lowercased alphanumeric tokens of `text`, stopwords removed.
pub fn content_tokens(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
        .map(str::to_lowercase)
        .filter(|w| !STOPWORDS.contains(&w.as_str()))
        .collect()
}

/// True when every content token of `value` occurs as a token of `text`.
///
/// A value with no content tokens is never supported.
pub fn supports_value(text: &str, value: &str) -> bool {
    let wanted = content_tokens(value);
    if wanted.is_empty() {
        return false;
    }
    let present = content_tokens(text);
    wanted.iter().all(|w| present.contains(w))
}

/// Percent-encoded text fragment for a quote.
///
/// Non-alphanumeric characters become spaces, whitespace is collapsed, and
/// the result is cut to [`FRAGMENT_MAX_CHARS`] characters before encoding.
pub fn text_fragment(quote: &str) -> String {
    let cleaned: String = quote
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    let collapsed = cleaned.split_whitespace().collect::<Vec<_>>().join(" ");
    let cut: String = collapsed.chars().take(FRAGMENT_MAX_CHARS).collect();
    urlencoding::encode(cut.trim_end()).into_owned()
}

/// Deep link to the cited passage of a document.
///
/// `{base}/{document_id}/edit#:~:text={fragment}`, or without the fragment
/// when the quote has no usable characters.
pub fn document_url(base: &str, document_id: &str, quote: &str) -> String {
    let base = base.trim_end_matches('/');
    let fragment = text_fragment(quote);
    if fragment.is_empty() {
        format!("{}/{}/edit", base, document_id)
    } else {
        format!("{}/{}/edit#:~:text={}", base, document_id, fragment)
    }
}

/// Page numbers mentioned in `text`, deduplicated and sorted numerically.
pub fn extract_page_numbers(text: &str) -> Vec<u32> {
    let mut pages: Vec<u32> = PAGE_PATTERNS
        .iter()
        .flat_map(|re| re.captures_iter(text))
        .filter_map(|caps| caps.get(1)?.as_str().parse::<u32>().ok())
        .filter(|p| *p > 0)
        .collect();
    pages.sort_unstable();
    pages.dedup();
    pages
}

/// Section headers, numbered clauses, articles and sections found at the
/// start of lines, at most [`MAX_LOCATION_MARKERS`], each cut to 100 chars.
pub fn location_markers(text: &str) -> Vec<String> {
    let mut markers = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Some(m) = MARKER_PATTERNS.iter().find_map(|re| re.find(line)) {
            markers.push(m.as_str().chars().take(100).collect());
            if markers.len() == MAX_LOCATION_MARKERS {
                break;
            }
        }
    }
    markers
}

/// Page numbers for a cell whose model reported none.
///
/// Looks only at passages whose text contains the quote and unions their
/// page metadata with the page numbers mentioned in their text.
pub fn fallback_page_numbers<'a>(
    quote: &str,
    passages: impl IntoIterator<Item = (&'a str, &'a [u32])>,
) -> Vec<u32> {
    let needle = normalize(quote);
    if needle.is_empty() {
        return Vec::new();
    }
    let mut pages = Vec::new();
    for (text, meta) in passages {
        if normalize(text).contains(&needle) {
            pages.extend_from_slice(meta);
            pages.extend(extract_page_numbers(text));
        }
    }
    pages.retain(|p| *p > 0);
    pages.sort_unstable();
    pages.dedup();
    pages
}

/// Cut extraction context to `max_chars` characters.
///
/// Prefers ending on a sentence boundary when one falls in the last fifth
/// of the window, then appends [`TRUNCATION_MARKER`]. Short text is
/// returned unchanged.
pub fn truncate_context(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let byte_end = text
        .char_indices()
        .nth(max_chars)
        .map(|(i, _)| i)
        .unwrap_or(text.len());
    let mut window = &text[..byte_end];
    if let Some(period) = window.rfind('.') {
        let period_chars = window[..period].chars().count();
        if period_chars * 5 > max_chars * 4 {
            window = &window[..=period];
        }
    }
    format!("{}{}", window, TRUNCATION_MARKER)
}

/// Serde helper for model-reported page numbers.
///
/// Accepts integers and numeric strings; drops anything that is not a
/// positive integer instead of failing the whole response.
pub fn lenient_page_numbers<'de, D>(deserializer: D) -> Result<Vec<u32>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<serde_json::Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut pages: Vec<u32> = raw
        .iter()
        .filter_map(|v| match v {
            serde_json::Value::Number(n) => n.as_u64(),
            serde_json::Value::String(s) => s.trim().parse::<u64>().ok(),
            _ => None,
        })
        .filter(|p| *p > 0 && *p <= u32::MAX as u64)
        .map(|p| p as u32)
        .collect();
    pages.sort_unstable();
    pages.dedup();
    Ok(pages)
}
