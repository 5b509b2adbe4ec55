//! Content normalization.
//!
//! Converts raw archive content into the canonical text form that gets
//! indexed: HTML is reduced to its main article content and rendered as
//! lightweight marked-up text, plain text passes through, and both are
//! cleaned of control characters, comments, and front matter. Heading,
//! link, date, and keyword extraction happen on the side and land in
//! document metadata; they never alter the normalized text.

use futures::stream::{self, StreamExt};
use regex::Regex;
use scraper::{Html, Selector};
use std::collections::HashMap;
use std::sync::OnceLock;
use tracing::warn;

use crate::error::{Error, Result};
use crate::models::Document;

/// Number of documents normalized concurrently by [`process_batch`].
const BATCH_WINDOW: usize = 5;

const KEYWORD_LIMIT: usize = 20;

/// Normalize one document: content rewritten in canonical form, side
/// extractions merged into metadata. Pure with respect to the store.
pub fn process(doc: &Document) -> Result<Document> {
    let text = if looks_like_markup(&doc.content) {
        let main = extract_main_content(&doc.content);
        html_to_text(&main)?
    } else {
        doc.content.clone()
    };

    let content = normalize_text(&text);

    let mut metadata = match &doc.metadata {
        serde_json::Value::Object(map) => map.clone(),
        _ => serde_json::Map::new(),
    };
    metadata.insert("headings".into(), extract_headings(&content));
    metadata.insert("links".into(), extract_links(&content));
    metadata.insert("dates".into(), extract_dates(&content));
    metadata.insert("keywords".into(), extract_keywords(&content));

    let mut normalized = doc.clone();
    normalized.content = content;
    normalized.metadata = serde_json::Value::Object(metadata);
    Ok(normalized)
}

/// Normalize a batch with a bounded concurrency window. A failure on one
/// document is logged and that document is passed through unchanged —
/// never dropped.
pub async fn process_batch(docs: Vec<Document>) -> Vec<Document> {
    stream::iter(docs)
        .map(|doc| async move {
            match process(&doc) {
                Ok(normalized) => normalized,
                Err(e) => {
                    warn!(id = %doc.id, path = %doc.path, error = %e, "normalization failed, passing document through");
                    doc
                }
            }
        })
        .buffered(BATCH_WINDOW)
        .collect()
        .await
}

/// Tag-sniffing markup detection.
pub fn looks_like_markup(content: &str) -> bool {
    markup_re().is_match(content)
}

/// Readability-style boilerplate removal: prefer the article/main container,
/// drop script/style/nav chrome, keep the rest.
fn extract_main_content(html: &str) -> String {
    let document = Html::parse_document(html);

    for selector_str in ["article", "main", "#content", ".content", "body"] {
        if let Ok(selector) = Selector::parse(selector_str) {
            if let Some(element) = document.select(&selector).next() {
                return strip_boilerplate(&element.html());
            }
        }
    }

    strip_boilerplate(html)
}

fn strip_boilerplate(html: &str) -> String {
    let without_scripts = script_re().replace_all(html, "");
    let without_chrome = chrome_re().replace_all(&without_scripts, "");
    without_chrome.into_owned()
}

fn html_to_text(html: &str) -> Result<String> {
    html2text::from_read(html.as_bytes(), 80).map_err(|e| Error::Normalization(e.to_string()))
}

/// Canonical text cleanup: unified line endings, no control characters,
/// no HTML comments or leading front matter, collapsed whitespace, and a
/// paragraph break after each sentence boundary.
pub fn normalize_text(text: &str) -> String {
    let text = text.replace("\r\n", "\n").replace('\r', "\n");
    let text = comment_re().replace_all(&text, "");
    let text = leading_front_matter_re().replace(&text, "");

    let text: String = text
        .chars()
        .filter(|c| !c.is_control() || *c == '\n' || *c == '\t')
        .collect();

    let text = horizontal_ws_re().replace_all(&text, " ");
    let text = sentence_break_re().replace_all(&text, "$1\n\n$2");
    let text = blank_runs_re().replace_all(&text, "\n\n");

    text.lines()
        .map(|l| l.trim_end())
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

// ============ Side extraction ============

fn extract_headings(content: &str) -> serde_json::Value {
    let headings: Vec<serde_json::Value> = heading_re()
        .captures_iter(content)
        .map(|caps| {
            serde_json::json!({
                "level": caps[1].len(),
                "text": caps[2].trim(),
            })
        })
        .collect();
    serde_json::Value::Array(headings)
}

fn extract_links(content: &str) -> serde_json::Value {
    let links: Vec<serde_json::Value> = link_re()
        .captures_iter(content)
        .map(|caps| {
            serde_json::json!({
                "text": &caps[1],
                "url": &caps[2],
            })
        })
        .collect();
    serde_json::Value::Array(links)
}

fn extract_dates(content: &str) -> serde_json::Value {
    let mut seen = std::collections::HashSet::new();
    let dates: Vec<serde_json::Value> = iso_date_re()
        .captures_iter(content)
        .map(|caps| caps[1].to_string())
        .filter(|d| seen.insert(d.clone()))
        .map(serde_json::Value::String)
        .collect();
    serde_json::Value::Array(dates)
}

/// Top-20 keywords by stop-word-filtered term frequency. Ties break
/// alphabetically so the output is deterministic.
fn extract_keywords(content: &str) -> serde_json::Value {
    let mut counts: HashMap<String, usize> = HashMap::new();
    for word in word_re().find_iter(&content.to_lowercase()) {
        let word = word.as_str();
        if word.len() < 3 || STOP_WORDS.contains(&word) || word.chars().all(|c| c.is_ascii_digit())
        {
            continue;
        }
        *counts.entry(word.to_string()).or_insert(0) += 1;
    }

    let mut ranked: Vec<(String, usize)> = counts.into_iter().collect();
    ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
    ranked.truncate(KEYWORD_LIMIT);

    serde_json::Value::Array(
        ranked
            .into_iter()
            .map(|(word, _)| serde_json::Value::String(word))
            .collect(),
    )
}

const STOP_WORDS: [&str; 60] = [
    "the", "and", "for", "are", "but", "not", "you", "all", "can", "had", "her", "was", "one",
    "our", "out", "day", "get", "has", "him", "his", "how", "man", "new", "now", "old", "see",
    "two", "way", "who", "its", "did", "yes", "with", "this", "that", "from", "they", "will",
    "would", "there", "their", "what", "about", "which", "when", "were", "been", "have", "more",
    "also", "into", "than", "then", "them", "these", "some", "such", "only", "over", "most",
];

// ============ Compiled patterns ============

fn markup_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)<\s*(?:html|head|body|div|p|a|span|article|section|h[1-6])[\s>/]").unwrap()
    })
}

fn script_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?is)<(script|style)\b.*?</(script|style)>").unwrap())
}

fn chrome_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)<(nav|header|footer|aside)\b.*?</(nav|header|footer|aside)>").unwrap()
    })
}

fn comment_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)<!--.*?-->").unwrap())
}

fn leading_front_matter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\A---\s*\n.*?\n---\s*\n").unwrap())
}

fn horizontal_ws_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[ \t]+").unwrap())
}

// No lookahead in the regex crate, so the following capital is captured
// and re-emitted by the replacement.
fn sentence_break_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"([.!?]) ([A-Z])").unwrap())
}

fn blank_runs_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n{3,}").unwrap())
}

fn heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^(#{1,6})\s+(.+)$").unwrap())
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\[([^\]]*)\]\(([^)\s]+)\)").unwrap())
}

fn iso_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap())
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9]+").unwrap())
}
