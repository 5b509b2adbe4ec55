//! Archive scanner.
//!
//! Walks the `research/` and `url-content/` trees, skips files not modified
//! since the last successful run (unless forced), and turns each retained
//! file into a raw document candidate with front-matter metadata extracted
//! by regex. Unreadable files are logged and skipped; they never abort the
//! scan. Deletion detection compares the store's known id set against every
//! id seen on disk, so a file removed from the archive is reported even
//! when nothing else changed.

use chrono::{DateTime, Utc};
use globset::{Glob, GlobSet, GlobSetBuilder};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::path::Path;
use std::sync::OnceLock;
use tracing::warn;
use walkdir::WalkDir;

use crate::error::Result;
use crate::models::{DocType, Document, Source};

/// Everything one scan pass produced.
#[derive(Debug)]
pub struct ScanOutcome {
    /// New or modified documents, metadata extracted, content still raw.
    pub documents: Vec<Document>,
    /// Ids known to the store but no longer present on disk.
    pub deleted_ids: Vec<String>,
    /// Wall-clock start of the scan; becomes the next watermark only after
    /// a successful commit.
    pub scan_time: DateTime<Utc>,
}

/// Stable content-path identifier: SHA-256 of `source:relative-path`,
/// truncated. Immutable for the lifetime of the file.
pub fn document_id(source: Source, relative_path: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_str().as_bytes());
    hasher.update(b":");
    hasher.update(relative_path.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    digest[..32].to_string()
}

/// Scan both archive trees. `known_ids` is the store's current id set and
/// is only used for deletion detection.
pub fn scan(
    research_root: &Path,
    url_content_root: &Path,
    last_scan: Option<DateTime<Utc>>,
    force: bool,
    known_ids: &HashSet<String>,
) -> Result<ScanOutcome> {
    let scan_time = Utc::now();
    let include = include_globs()?;

    let mut documents = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    for (source, root) in [
        (Source::Research, research_root),
        (Source::UrlContent, url_content_root),
    ] {
        if !root.is_dir() {
            warn!(root = %root.display(), "archive root missing, skipping");
            continue;
        }
        scan_tree(source, root, &include, last_scan, force, &mut documents, &mut seen);
    }

    let mut deleted_ids: Vec<String> = known_ids.difference(&seen).cloned().collect();
    deleted_ids.sort();

    Ok(ScanOutcome {
        documents,
        deleted_ids,
        scan_time,
    })
}

fn scan_tree(
    source: Source,
    root: &Path,
    include: &GlobSet,
    last_scan: Option<DateTime<Utc>>,
    force: bool,
    documents: &mut Vec<Document>,
    seen: &mut HashSet<String>,
) {
    for entry in WalkDir::new(root) {
        let entry = match entry {
            Ok(e) => e,
            Err(e) => {
                warn!(error = %e, "unreadable directory entry, skipping");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let rel_str = relative.to_string_lossy().to_string();

        if !include.is_match(&rel_str) || rel_str.split('/').any(|c| c.starts_with('.')) {
            continue;
        }

        let id = document_id(source, &rel_str);
        seen.insert(id.clone());

        let modified = entry
            .metadata()
            .ok()
            .and_then(|m| m.modified().ok())
            .map(DateTime::<Utc>::from);

        if !force {
            if let (Some(mtime), Some(last)) = (modified, last_scan) {
                if mtime <= last {
                    continue;
                }
            }
        }

        let raw = match std::fs::read_to_string(path) {
            Ok(s) => s,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "unreadable file, skipping");
                continue;
            }
        };

        documents.push(parse_document(id, source, &rel_str, raw, modified));
    }
}

/// Extract front-matter-style metadata and derive title, type, and date.
/// Content is left raw; normalization happens downstream.
fn parse_document(
    id: String,
    source: Source,
    relative_path: &str,
    raw: String,
    modified: Option<DateTime<Utc>>,
) -> Document {
    let mut metadata = serde_json::Map::new();

    // YAML-ish front-matter block: `--- key: value ... ---`
    if let Some(caps) = front_matter_re().captures(&raw) {
        for line in caps[1].lines() {
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim().to_lowercase();
                let value = value.trim();
                if !key.is_empty() && !value.is_empty() {
                    metadata.insert(key, serde_json::Value::String(value.to_string()));
                }
            }
        }
    }

    // Captured-page heading: `# Source: [title](original-url)`
    let mut captured_title = None;
    if let Some(caps) = captured_heading_re().captures(&raw) {
        captured_title = Some(caps[1].trim().to_string());
        metadata.insert(
            "url".to_string(),
            serde_json::Value::String(caps[2].to_string()),
        );
    }

    // Research `## Source:` line carries the declared source.
    if let Some(caps) = declared_source_re().captures(&raw) {
        metadata.insert(
            "declared_source".to_string(),
            serde_json::Value::String(caps[1].trim().to_string()),
        );
    }

    let first_heading = first_heading_re()
        .captures(&raw)
        .map(|caps| caps[1].trim().to_string());

    let title = captured_title
        .or_else(|| first_heading.clone())
        .unwrap_or_else(|| file_stem(relative_path));

    // Research reports record their originating query as the first heading.
    let query = match source {
        Source::Research => metadata
            .get("query")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
            .or(first_heading),
        Source::UrlContent => None,
    };

    let date = extract_date(&raw, &metadata, modified);
    let doc_type = classify(source, relative_path, &metadata);

    Document {
        id,
        title,
        path: relative_path.to_string(),
        source,
        doc_type,
        date,
        content: raw,
        query,
        metadata: serde_json::Value::Object(metadata),
    }
}

fn extract_date(
    raw: &str,
    metadata: &serde_json::Map<String, serde_json::Value>,
    modified: Option<DateTime<Utc>>,
) -> Option<String> {
    if let Some(date) = metadata.get("date").and_then(|v| v.as_str()) {
        if let Some(caps) = iso_date_re().captures(date) {
            return Some(caps[1].to_string());
        }
    }

    // Captured-page date line: `## Captured: 2024-01-31`
    if let Some(caps) = captured_date_re().captures(raw) {
        if let Some(iso) = iso_date_re().captures(&caps[1]) {
            return Some(iso[1].to_string());
        }
    }

    if let Some(caps) = iso_date_re().captures(raw) {
        return Some(caps[1].to_string());
    }

    modified.map(|m| m.format("%Y-%m-%d").to_string())
}

fn classify(
    source: Source,
    relative_path: &str,
    metadata: &serde_json::Map<String, serde_json::Value>,
) -> DocType {
    if let Some(declared) = metadata.get("type").and_then(|v| v.as_str()) {
        return DocType::parse(declared);
    }

    match source {
        Source::UrlContent => DocType::Webpage,
        Source::Research => {
            let path_lower = relative_path.to_lowercase();
            if path_lower.contains("search") {
                DocType::Search
            } else {
                DocType::Report
            }
        }
    }
}

fn file_stem(relative_path: &str) -> String {
    Path::new(relative_path)
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| relative_path.to_string())
}

fn include_globs() -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in ["**/*.md", "**/*.markdown", "**/*.txt", "**/*.html", "**/*.htm"] {
        builder.add(
            Glob::new(pattern).map_err(|e| crate::error::Error::Scan(e.to_string()))?,
        );
    }
    builder
        .build()
        .map_err(|e| crate::error::Error::Scan(e.to_string()))
}

// Compiled once; scans run repeatedly under the watcher.
fn front_matter_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?s)\A---\s*\n(.*?)\n---\s*\n").unwrap())
}

fn captured_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#\s+Source:\s*\[([^\]]*)\]\(([^)\s]+)\)").unwrap())
}

fn declared_source_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^##\s+Source:\s*(.+)$").unwrap())
}

fn captured_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^##\s+Captured:\s*(.+)$").unwrap())
}

fn first_heading_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^#\s+(.+)$").unwrap())
}

fn iso_date_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(\d{4}-\d{2}-\d{2})\b").unwrap())
}
