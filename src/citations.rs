//! Citation graph construction and traversal.
//!
//! Explicit citations come from markdown links; implicit ones are inferred
//! by paragraph-level Jaccard similarity against every other document. The
//! similarity pass is intentionally quadratic in corpus size × paragraph
//! count — it runs on the periodic indexing path over a bounded archive,
//! never on the query path.
//!
//! Persistence regenerates a document's outgoing edges from scratch each
//! run. The `manage_transaction` flag on [`persist`] decides whether this
//! module opens its own transaction (standalone use) or writes into the
//! ambient one opened by the indexing run — the store rejects nesting, so
//! exactly one owner exists per run.

use regex::Regex;
use std::collections::{HashMap, HashSet};
use std::sync::OnceLock;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Citation, Direction, Document, Source};
use crate::store::DocumentStore;

/// Characters of surrounding text kept on each side of an explicit link.
const CONTEXT_WINDOW: usize = 100;

/// Paragraphs shorter than this are too generic to infer citations from.
const MIN_PARAGRAPH_LEN: usize = 100;

/// Jaccard similarity above which a paragraph counts as citing a document.
const SIMILARITY_THRESHOLD: f64 = 0.7;

/// Upper bound on stored context for inferred citations.
const IMPLICIT_CONTEXT_LEN: usize = 200;

/// Build the full citation set for one indexing pass: explicit links from
/// every scanned document (resolved against captured pages), plus inferred
/// edges from research reports.
pub fn build(
    research_docs: &[Document],
    url_content_docs: &[Document],
    all_docs: &[Document],
) -> Vec<Citation> {
    let mut citations = Vec::new();

    for doc in research_docs.iter().chain(url_content_docs.iter()) {
        let mut explicit = extract_explicit(doc);
        match_url_references(&mut explicit, url_content_docs);
        citations.extend(explicit);
    }

    for doc in research_docs {
        citations.extend(detect_implicit(doc, all_docs));
    }

    citations
}

/// Every markdown-style `[text](url)` occurrence yields one citation with
/// confidence 1.0. Image embeds are not citations.
pub fn extract_explicit(doc: &Document) -> Vec<Citation> {
    link_re()
        .captures_iter(&doc.content)
        .filter(|caps| caps.get(1).map(|m| m.as_str()) != Some("!"))
        .map(|caps| {
            let m = caps.get(0).unwrap();
            Citation {
                id: Uuid::new_v4().to_string(),
                source_id: doc.id.clone(),
                target_url: caps[3].to_string(),
                target_id: None,
                context: char_window(&doc.content, m.start(), m.end(), CONTEXT_WINDOW),
                confidence: 1.0,
            }
        })
        .collect()
}

/// Resolve citation URLs against the captured pages' recorded original
/// URLs. Matching ignores scheme, trailing slash, and case.
pub fn match_url_references(citations: &mut [Citation], url_content_docs: &[Document]) {
    let by_url: HashMap<String, &str> = url_content_docs
        .iter()
        .filter_map(|d| d.original_url().map(|u| (normalize_url(u), d.id.as_str())))
        .collect();

    for citation in citations.iter_mut() {
        if citation.target_id.is_none() {
            if let Some(id) = by_url.get(&normalize_url(&citation.target_url)) {
                citation.target_id = Some(id.to_string());
            }
        }
    }
}

/// Infer citations from a research report by comparing each substantial
/// paragraph against every other document's full content.
pub fn detect_implicit(doc: &Document, all_docs: &[Document]) -> Vec<Citation> {
    if doc.source != Source::Research {
        return Vec::new();
    }

    let candidates: Vec<(&Document, HashSet<String>)> = all_docs
        .iter()
        .filter(|other| other.id != doc.id && !other.content.is_empty())
        .map(|other| (other, word_set(&other.content)))
        .collect();

    let mut citations = Vec::new();

    for paragraph in paragraph_re().split(&doc.content) {
        let paragraph = paragraph.trim();
        if paragraph.len() < MIN_PARAGRAPH_LEN {
            continue;
        }
        let words = word_set(paragraph);
        if words.is_empty() {
            continue;
        }

        for (other, other_words) in &candidates {
            let similarity = jaccard(&words, other_words);
            if similarity > SIMILARITY_THRESHOLD {
                citations.push(Citation {
                    id: Uuid::new_v4().to_string(),
                    source_id: doc.id.clone(),
                    target_url: other
                        .original_url()
                        .map(|u| u.to_string())
                        .unwrap_or_else(|| other.path.clone()),
                    target_id: Some(other.id.clone()),
                    context: char_window(paragraph, 0, 0, IMPLICIT_CONTEXT_LEN),
                    confidence: similarity,
                });
            }
        }
    }

    citations
}

/// Word-set intersection over union, case-folded, punctuation-stripped.
pub fn jaccard(a: &HashSet<String>, b: &HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 0.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    intersection / union
}

fn word_set(text: &str) -> HashSet<String> {
    word_re()
        .find_iter(&text.to_lowercase())
        .map(|m| m.as_str().to_string())
        .collect()
}

/// Strip scheme and trailing slash, fold case. `http://X.com/a/` and
/// `https://x.com/a` normalize identically.
pub fn normalize_url(raw: &str) -> String {
    if let Ok(parsed) = url::Url::parse(raw) {
        let host = parsed.host_str().unwrap_or("").to_lowercase();
        let path = parsed.path().trim_end_matches('/').to_lowercase();
        match parsed.query() {
            Some(q) => format!("{}{}?{}", host, path, q),
            None => format!("{}{}", host, path),
        }
    } else {
        let lower = raw.trim().to_lowercase();
        lower
            .trim_start_matches("https://")
            .trim_start_matches("http://")
            .trim_end_matches('/')
            .to_string()
    }
}

/// Char-boundary-safe window of `margin` characters around a byte span.
fn char_window(text: &str, start: usize, end: usize, margin: usize) -> String {
    let from = text[..start]
        .char_indices()
        .rev()
        .nth(margin.saturating_sub(1))
        .map(|(i, _)| i)
        .unwrap_or(0);
    let to = text[end..]
        .char_indices()
        .nth(margin)
        .map(|(i, _)| end + i)
        .unwrap_or(text.len());
    text[from..to].to_string()
}

/// Write one pass's citations: drop every rebuilt document's outgoing
/// edges, then insert the fresh set. With `manage_transaction` the whole
/// operation is wrapped here; without it the caller's open transaction is
/// used as-is.
pub async fn persist(
    store: &DocumentStore,
    rebuilt_ids: &[String],
    citations: &[Citation],
    manage_transaction: bool,
) -> Result<usize> {
    if manage_transaction {
        store.begin().await?;
    }

    let result = async {
        for id in rebuilt_ids {
            store.delete_citations_from(id).await?;
        }
        let mut written = 0usize;
        for citation in citations {
            store.add_citation(citation).await?;
            written += 1;
        }
        Ok::<usize, Error>(written)
    }
    .await;

    if manage_transaction {
        match &result {
            Ok(_) => store.commit().await?,
            Err(_) => {
                let _ = store.rollback().await;
            }
        }
    }

    result
}

/// Breadth-first traversal over the union of incoming and outgoing edges,
/// up to `depth` hops. Each document is visited at most once; the origin
/// is never part of the result.
pub async fn related_documents(
    store: &DocumentStore,
    id: &str,
    depth: usize,
) -> Result<Vec<Document>> {
    // Distinguish "unknown id" from "no relations".
    store.get(id).await?;

    let mut visited: HashSet<String> = HashSet::from([id.to_string()]);
    let mut frontier = vec![id.to_string()];
    let mut related = Vec::new();

    for _ in 0..depth {
        let mut next = Vec::new();
        for node in frontier.drain(..) {
            let incoming = store.citations_for(&node, Direction::Citing).await?;
            let outgoing = store.citations_for(&node, Direction::Cited).await?;

            let neighbors = incoming
                .iter()
                .map(|c| c.source_id.clone())
                .chain(outgoing.iter().filter_map(|c| c.target_id.clone()));

            for neighbor in neighbors {
                if visited.insert(neighbor.clone()) {
                    next.push(neighbor);
                }
            }
        }

        for neighbor in &next {
            related.push(store.get(neighbor).await?);
        }
        frontier = next;
    }

    Ok(related)
}

/// Serialization formats for [`export_graph`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphFormat {
    Json,
    Graphml,
    Dot,
}

impl GraphFormat {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "json" => Some(GraphFormat::Json),
            "graphml" => Some(GraphFormat::Graphml),
            "dot" => Some(GraphFormat::Dot),
            _ => None,
        }
    }
}

/// Serialize the node/edge set for external visualization. Read-side
/// convenience only; the indexing and search paths never call this.
pub fn export_graph(
    docs: &[Document],
    citations: &[Citation],
    format: GraphFormat,
) -> Result<String> {
    match format {
        GraphFormat::Json => {
            let nodes: Vec<serde_json::Value> = docs
                .iter()
                .map(|d| {
                    serde_json::json!({
                        "id": d.id,
                        "title": d.title,
                        "source": d.source,
                        "type": d.doc_type,
                    })
                })
                .collect();
            let edges: Vec<serde_json::Value> = citations
                .iter()
                .map(|c| {
                    serde_json::json!({
                        "source": c.source_id,
                        "target": c.target_id,
                        "target_url": c.target_url,
                        "confidence": c.confidence,
                    })
                })
                .collect();
            Ok(serde_json::to_string_pretty(
                &serde_json::json!({ "nodes": nodes, "edges": edges }),
            )?)
        }
        GraphFormat::Graphml => {
            let mut out = String::new();
            out.push_str("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
            out.push_str("<graphml xmlns=\"http://graphml.graphdrawing.org/xmlns\">\n");
            out.push_str("  <key id=\"title\" for=\"node\" attr.name=\"title\" attr.type=\"string\"/>\n");
            out.push_str("  <key id=\"confidence\" for=\"edge\" attr.name=\"confidence\" attr.type=\"double\"/>\n");
            out.push_str("  <graph id=\"citations\" edgedefault=\"directed\">\n");
            for doc in docs {
                out.push_str(&format!(
                    "    <node id=\"{}\"><data key=\"title\">{}</data></node>\n",
                    doc.id,
                    xml_escape(&doc.title)
                ));
            }
            for citation in citations {
                if let Some(target) = &citation.target_id {
                    out.push_str(&format!(
                        "    <edge source=\"{}\" target=\"{}\"><data key=\"confidence\">{:.3}</data></edge>\n",
                        citation.source_id, target, citation.confidence
                    ));
                }
            }
            out.push_str("  </graph>\n</graphml>\n");
            Ok(out)
        }
        GraphFormat::Dot => {
            let mut out = String::from("digraph citations {\n");
            for doc in docs {
                out.push_str(&format!(
                    "  \"{}\" [label=\"{}\"];\n",
                    doc.id,
                    doc.title.replace('"', "\\\"")
                ));
            }
            for citation in citations {
                if let Some(target) = &citation.target_id {
                    out.push_str(&format!(
                        "  \"{}\" -> \"{}\" [label=\"{:.2}\"];\n",
                        citation.source_id, target, citation.confidence
                    ));
                }
            }
            out.push_str("}\n");
            Ok(out)
        }
    }
}

fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

fn link_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(!?)\[([^\]]*)\]\(([^)\s]+)\)").unwrap())
}

fn paragraph_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\n\s*\n").unwrap())
}

fn word_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[a-z0-9]+").unwrap())
}
