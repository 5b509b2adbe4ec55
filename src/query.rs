//! Query surface exposed to the host tool layer.
//!
//! Ranking is delegated to the store's full-text search; this layer clamps
//! options, optionally enriches results with citation context, and computes
//! citation-network reports and visualizations. Unknown document ids are a
//! distinct not-found condition, never an empty result set.

use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;

use crate::citations;
use crate::config::SearchConfig;
use crate::error::Result;
use crate::models::{Citation, Direction, Document, Source};
use crate::store::{DocumentStore, FieldHighlight};

/// One search invocation's options.
#[derive(Debug, Clone)]
pub struct SearchRequest {
    pub query: String,
    pub fuzzy: bool,
    pub fields: Option<Vec<String>>,
    pub limit: Option<i64>,
    pub include_citations: bool,
    pub citation_depth: u8,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            fuzzy: false,
            fields: None,
            limit: None,
            include_citations: false,
            citation_depth: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DocumentSummary {
    pub id: String,
    pub title: String,
    pub path: String,
    pub source: Source,
    pub date: Option<String>,
    pub score: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CitationLists {
    pub citing: Vec<Citation>,
    pub cited: Vec<Citation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResultEntry {
    pub document: DocumentSummary,
    pub highlights: Vec<FieldHighlight>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<CitationLists>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphNode {
    pub id: String,
    pub title: String,
    pub source: Source,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphEdge {
    pub source: String,
    pub target: String,
    pub target_url: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct GraphView {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<GraphEdge>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchMetadata {
    pub query: String,
    pub fuzzy: bool,
    pub total: usize,
    pub elapsed_ms: u128,
}

#[derive(Debug, Clone, Serialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResultEntry>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citation_graph: Option<GraphView>,
    pub metadata: SearchMetadata,
}

/// Per-document citation metrics plus a one-hop network snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct CitationReport {
    pub document_id: String,
    pub outgoing_count: usize,
    pub incoming_count: usize,
    pub mean_confidence: f64,
    pub network: GraphView,
}

pub struct SearchApi {
    store: Arc<DocumentStore>,
    config: SearchConfig,
}

impl SearchApi {
    pub fn new(store: Arc<DocumentStore>, config: SearchConfig) -> Self {
        Self { store, config }
    }

    /// Ranked full-text search with optional citation enrichment.
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started = std::time::Instant::now();
        let limit = request
            .limit
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit);
        let depth = request.citation_depth.clamp(1, 3) as usize;

        let matches = self
            .store
            .search(
                &request.query,
                request.fields.as_deref(),
                request.fuzzy,
                limit,
            )
            .await?;

        let mut results = Vec::with_capacity(matches.len());
        for m in &matches {
            let citations_attached = if request.include_citations {
                Some(CitationLists {
                    citing: self
                        .store
                        .citations_for(&m.document.id, Direction::Citing)
                        .await?,
                    cited: self
                        .store
                        .citations_for(&m.document.id, Direction::Cited)
                        .await?,
                })
            } else {
                None
            };

            results.push(SearchResultEntry {
                document: summarize(&m.document, m.score),
                highlights: m.highlights.clone(),
                citations: citations_attached,
            });
        }

        let citation_graph = if request.include_citations && !matches.is_empty() {
            let mut node_ids: HashSet<String> =
                matches.iter().map(|m| m.document.id.clone()).collect();
            for m in &matches {
                for doc in citations::related_documents(&self.store, &m.document.id, depth).await? {
                    node_ids.insert(doc.id);
                }
            }
            Some(self.build_graph(&node_ids).await?)
        } else {
            None
        };

        Ok(SearchResponse {
            metadata: SearchMetadata {
                query: request.query.clone(),
                fuzzy: request.fuzzy,
                total: results.len(),
                elapsed_ms: started.elapsed().as_millis(),
            },
            results,
            citation_graph,
        })
    }

    /// Documents within `depth` citation hops of `id`, origin excluded.
    pub async fn find_related(&self, id: &str, depth: usize) -> Result<Vec<DocumentSummary>> {
        let related = citations::related_documents(&self.store, id, depth).await?;
        Ok(related.iter().map(|d| summarize(d, 0.0)).collect())
    }

    /// Citation metrics and a single-document network snapshot.
    pub async fn citation_report(&self, id: &str) -> Result<CitationReport> {
        // Surfaces NotFound for unknown ids before any counting.
        self.store.get(id).await?;

        let outgoing = self.store.citations_for(id, Direction::Cited).await?;
        let incoming = self.store.citations_for(id, Direction::Citing).await?;

        let total = outgoing.len() + incoming.len();
        let mean_confidence = if total == 0 {
            0.0
        } else {
            let sum: f64 = outgoing
                .iter()
                .chain(incoming.iter())
                .map(|c| c.confidence)
                .sum();
            sum / total as f64
        };

        let mut node_ids: HashSet<String> = HashSet::from([id.to_string()]);
        for citation in &incoming {
            node_ids.insert(citation.source_id.clone());
        }
        for citation in &outgoing {
            if let Some(target) = &citation.target_id {
                node_ids.insert(target.clone());
            }
        }

        Ok(CitationReport {
            document_id: id.to_string(),
            outgoing_count: outgoing.len(),
            incoming_count: incoming.len(),
            mean_confidence,
            network: self.build_graph(&node_ids).await?,
        })
    }

    /// Node/edge set over the given documents and their direct citation
    /// partners.
    pub async fn citation_visualization(&self, ids: &[String]) -> Result<GraphView> {
        let mut node_ids: HashSet<String> = HashSet::new();
        for id in ids {
            // NotFound on any unknown id rather than a silently smaller graph.
            self.store.get(id).await?;
            node_ids.insert(id.clone());

            for citation in self.store.citations_for(id, Direction::Citing).await? {
                node_ids.insert(citation.source_id.clone());
            }
            for citation in self.store.citations_for(id, Direction::Cited).await? {
                if let Some(target) = &citation.target_id {
                    node_ids.insert(target.clone());
                }
            }
        }

        self.build_graph(&node_ids).await
    }

    // Graph over a fixed node set: one node per document, one edge per
    // resolved citation whose endpoints are both in the set.
    async fn build_graph(&self, node_ids: &HashSet<String>) -> Result<GraphView> {
        let mut nodes = Vec::with_capacity(node_ids.len());
        let mut edges = Vec::new();
        let mut seen_edges: HashSet<String> = HashSet::new();

        let mut sorted_ids: Vec<&String> = node_ids.iter().collect();
        sorted_ids.sort();

        for id in sorted_ids {
            let doc = self.store.get(id).await?;
            nodes.push(GraphNode {
                id: doc.id.clone(),
                title: doc.title.clone(),
                source: doc.source,
            });

            for citation in self.store.citations_for(id, Direction::Cited).await? {
                if let Some(target) = &citation.target_id {
                    if node_ids.contains(target) && seen_edges.insert(citation.id.clone()) {
                        edges.push(GraphEdge {
                            source: citation.source_id.clone(),
                            target: target.clone(),
                            target_url: citation.target_url.clone(),
                            confidence: citation.confidence,
                        });
                    }
                }
            }
        }

        Ok(GraphView { nodes, edges })
    }
}

fn summarize(doc: &Document, score: f64) -> DocumentSummary {
    DocumentSummary {
        id: doc.id.clone(),
        title: doc.title.clone(),
        path: doc.path.clone(),
        source: doc.source,
        date: doc.date.clone(),
        score,
    }
}
