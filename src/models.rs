//! Core data models used throughout the index.
//!
//! These types represent the documents and citation edges that flow through
//! the scan → normalize → store pipeline and back out of the query engine.

use serde::{Deserialize, Serialize};

/// Which archive tree a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Research,
    UrlContent,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Research => "research",
            Source::UrlContent => "url-content",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "research" => Some(Source::Research),
            "url-content" => Some(Source::UrlContent),
            _ => None,
        }
    }
}

/// Best-effort classification of a document's content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    Report,
    Search,
    Webpage,
    Unknown,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::Report => "report",
            DocType::Search => "search",
            DocType::Webpage => "webpage",
            DocType::Unknown => "unknown",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "report" => DocType::Report,
            "search" => DocType::Search,
            "webpage" => DocType::Webpage,
            _ => DocType::Unknown,
        }
    }
}

/// One archived unit of research or captured web content.
///
/// The `id` is derived from `(source, path)` and never changes once
/// assigned. Re-indexing a modified file replaces `content`, `title`, and
/// `metadata` wholesale rather than merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    /// Path relative to the archive root for its source.
    pub path: String,
    pub source: Source,
    pub doc_type: DocType,
    /// ISO date, best-effort extracted from front matter or content.
    pub date: Option<String>,
    /// Normalized full text.
    pub content: String,
    /// Originating research query, when declared.
    pub query: Option<String>,
    /// Open key/value map: headings, links, dates, keywords, original URL.
    pub metadata: serde_json::Value,
}

impl Document {
    /// Original URL recorded for captured pages, if any.
    pub fn original_url(&self) -> Option<&str> {
        self.metadata.get("url").and_then(|v| v.as_str())
    }
}

/// A directed edge asserting that `source_id` references `target_url`,
/// possibly resolved to another archived document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Citation {
    pub id: String,
    pub source_id: String,
    pub target_url: String,
    /// Present only when the URL resolves to an archived document.
    pub target_id: Option<String>,
    /// Bounded window of text surrounding the reference.
    pub context: String,
    /// 1.0 for explicit markdown links, the similarity score for inferred
    /// citations.
    pub confidence: f64,
}

/// Which side of the citation edge to query from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Citations whose target is the given document (who cites me).
    Citing,
    /// Citations whose source is the given document (who do I cite).
    Cited,
}

/// Store-level counters reported by `cdx stats`.
#[derive(Debug, Clone, Serialize)]
pub struct StoreStats {
    pub document_count: i64,
    pub citation_count: i64,
    pub size_bytes: u64,
}
