//! Embedded document and citation store.
//!
//! Sole owner of the SQLite schema: documents, citations, and the FTS5
//! tables over both. All other components go through this type; none of
//! them open their own transactions. A single ambient transaction can be
//! opened with [`DocumentStore::begin`] — while it is open, every read and
//! write on this handle routes through it, so a multi-step indexing run
//! commits or rolls back as one unit. The store rejects nested `begin`
//! calls with a named error rather than guessing at savepoint semantics.

use serde::Serialize;
use sqlx::sqlite::{SqliteArguments, SqliteQueryResult, SqliteRow};
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::migrate;
use crate::models::{Citation, Direction, DocType, Document, Source, StoreStats};

type Query<'q> = sqlx::query::Query<'q, Sqlite, SqliteArguments<'q>>;

/// Fields searchable through [`DocumentStore::search`].
const SEARCHABLE_FIELDS: [&str; 3] = ["title", "content", "query"];

/// A ranked full-text match with per-field highlighted snippets.
#[derive(Debug, Clone, Serialize)]
pub struct SearchMatch {
    pub document: Document,
    pub score: f64,
    pub highlights: Vec<FieldHighlight>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FieldHighlight {
    pub field: String,
    pub snippets: Vec<String>,
}

/// Outcome of an upsert: the stable id, and whether the document was new.
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    pub id: String,
    pub added: bool,
}

pub struct DocumentStore {
    pool: SqlitePool,
    db_path: PathBuf,
    tx: Mutex<Option<Transaction<'static, Sqlite>>>,
}

impl DocumentStore {
    /// Open (creating if missing) the index database and run migrations.
    pub async fn open(db_path: &Path) -> Result<Self> {
        let pool = crate::db::connect(db_path).await?;
        migrate::run_migrations(&pool).await?;
        Ok(Self {
            pool,
            db_path: db_path.to_path_buf(),
            tx: Mutex::new(None),
        })
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    // ============ Transaction primitives ============

    /// Open the ambient transaction. Errors with
    /// [`Error::NestedTransaction`] if one is already open.
    pub async fn begin(&self) -> Result<()> {
        let mut guard = self.tx.lock().await;
        if guard.is_some() {
            return Err(Error::NestedTransaction);
        }
        *guard = Some(self.pool.begin().await?);
        Ok(())
    }

    pub async fn commit(&self) -> Result<()> {
        let mut guard = self.tx.lock().await;
        match guard.take() {
            Some(tx) => {
                tx.commit().await?;
                Ok(())
            }
            None => Err(Error::NoTransaction),
        }
    }

    pub async fn rollback(&self) -> Result<()> {
        let mut guard = self.tx.lock().await;
        match guard.take() {
            Some(tx) => {
                tx.rollback().await?;
                Ok(())
            }
            None => Err(Error::NoTransaction),
        }
    }

    pub async fn in_transaction(&self) -> bool {
        self.tx.lock().await.is_some()
    }

    // Route a statement through the ambient transaction when one is open,
    // directly through the pool otherwise.
    async fn execute(&self, query: Query<'_>) -> Result<SqliteQueryResult> {
        let mut guard = self.tx.lock().await;
        match guard.as_mut() {
            Some(tx) => Ok(query.execute(&mut **tx).await?),
            None => Ok(query.execute(&self.pool).await?),
        }
    }

    async fn fetch_all(&self, query: Query<'_>) -> Result<Vec<SqliteRow>> {
        let mut guard = self.tx.lock().await;
        match guard.as_mut() {
            Some(tx) => Ok(query.fetch_all(&mut **tx).await?),
            None => Ok(query.fetch_all(&self.pool).await?),
        }
    }

    async fn fetch_optional(&self, query: Query<'_>) -> Result<Option<SqliteRow>> {
        let mut guard = self.tx.lock().await;
        match guard.as_mut() {
            Some(tx) => Ok(query.fetch_optional(&mut **tx).await?),
            None => Ok(query.fetch_optional(&self.pool).await?),
        }
    }

    // ============ Documents ============

    /// Insert or replace a document. Idempotent on `id`; replaces content,
    /// title, and metadata wholesale on conflict.
    pub async fn upsert(&self, doc: &Document) -> Result<UpsertOutcome> {
        let existing = self
            .fetch_optional(sqlx::query("SELECT 1 FROM documents WHERE id = ?").bind(&doc.id))
            .await?;
        let added = existing.is_none();

        let metadata_json = serde_json::to_string(&doc.metadata)?;

        self.execute(
            sqlx::query(
                r#"
                INSERT INTO documents (id, title, path, source, doc_type, date, query, content, metadata_json)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    doc_type = excluded.doc_type,
                    date = excluded.date,
                    query = excluded.query,
                    content = excluded.content,
                    metadata_json = excluded.metadata_json
                "#,
            )
            .bind(&doc.id)
            .bind(&doc.title)
            .bind(&doc.path)
            .bind(doc.source.as_str())
            .bind(doc.doc_type.as_str())
            .bind(&doc.date)
            .bind(&doc.query)
            .bind(&doc.content)
            .bind(&metadata_json),
        )
        .await?;

        // Replace the FTS row. A document with no content still gets a row
        // for its title, but contributes no content matches.
        self.execute(
            sqlx::query("DELETE FROM documents_fts WHERE document_id = ?").bind(&doc.id),
        )
        .await?;
        self.execute(
            sqlx::query(
                "INSERT INTO documents_fts (document_id, title, content, query) VALUES (?, ?, ?, ?)",
            )
            .bind(&doc.id)
            .bind(&doc.title)
            .bind(&doc.content)
            .bind(doc.query.as_deref().unwrap_or("")),
        )
        .await?;

        Ok(UpsertOutcome {
            id: doc.id.clone(),
            added,
        })
    }

    pub async fn get(&self, id: &str) -> Result<Document> {
        let row = self
            .fetch_optional(
                sqlx::query(
                    "SELECT id, title, path, source, doc_type, date, query, content, metadata_json \
                     FROM documents WHERE id = ?",
                )
                .bind(id),
            )
            .await?;

        match row {
            Some(row) => row_to_document(&row),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    /// Delete a document and its outgoing citations. Returns `false` if the
    /// document was absent.
    pub async fn delete(&self, id: &str) -> Result<bool> {
        self.delete_citations_from(id).await?;

        self.execute(sqlx::query("DELETE FROM documents_fts WHERE document_id = ?").bind(id))
            .await?;
        let result = self
            .execute(sqlx::query("DELETE FROM documents WHERE id = ?").bind(id))
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// One full materialization of every document. Acceptable at target
    /// corpus scale; callers needing pagination should not exist yet.
    pub async fn list(&self) -> Result<Vec<Document>> {
        let rows = self
            .fetch_all(sqlx::query(
                "SELECT id, title, path, source, doc_type, date, query, content, metadata_json \
                 FROM documents ORDER BY source, path",
            ))
            .await?;

        rows.iter().map(row_to_document).collect()
    }

    // ============ Full-text search ============

    /// Ranked full-text search. Title matches weigh 2× content matches;
    /// `fuzzy` expands each term with a prefix wildcard. Snippets are
    /// bounded windows around the first match per field, ellipsis-padded,
    /// with matched terms delimited by `>>>`/`<<<`.
    pub async fn search(
        &self,
        query: &str,
        fields: Option<&[String]>,
        fuzzy: bool,
        limit: i64,
    ) -> Result<Vec<SearchMatch>> {
        let match_expr = match build_match_expression(query, fields, fuzzy) {
            Some(expr) => expr,
            None => return Ok(Vec::new()),
        };

        let rows = self
            .fetch_all(
                sqlx::query(
                    r#"
                    SELECT d.id, d.title, d.path, d.source, d.doc_type, d.date, d.query,
                           d.content, d.metadata_json,
                           bm25(documents_fts, 0.0, 2.0, 1.0, 1.0) AS fts_rank,
                           snippet(documents_fts, 1, '>>>', '<<<', '...', 24) AS title_snippet,
                           snippet(documents_fts, 2, '>>>', '<<<', '...', 24) AS content_snippet,
                           snippet(documents_fts, 3, '>>>', '<<<', '...', 24) AS query_snippet
                    FROM documents_fts
                    JOIN documents d ON d.id = documents_fts.document_id
                    WHERE documents_fts MATCH ?
                    ORDER BY fts_rank
                    LIMIT ?
                    "#,
                )
                .bind(&match_expr)
                .bind(limit),
            )
            .await?;

        let mut matches = Vec::with_capacity(rows.len());
        for row in &rows {
            let document = row_to_document(row)?;
            let rank: f64 = row.get("fts_rank");

            let mut highlights = Vec::new();
            for (field, col) in [
                ("title", "title_snippet"),
                ("content", "content_snippet"),
                ("query", "query_snippet"),
            ] {
                let snippet: String = row.get(col);
                if snippet.contains(">>>") {
                    highlights.push(FieldHighlight {
                        field: field.to_string(),
                        snippets: vec![snippet],
                    });
                }
            }

            matches.push(SearchMatch {
                document,
                score: -rank, // bm25 is better-is-lower; negate so higher = better
                highlights,
            });
        }

        Ok(matches)
    }

    // ============ Citations ============

    pub async fn add_citation(&self, citation: &Citation) -> Result<String> {
        let id = if citation.id.is_empty() {
            uuid::Uuid::new_v4().to_string()
        } else {
            citation.id.clone()
        };

        self.execute(
            sqlx::query(
                r#"
                INSERT INTO citations (id, source_id, target_url, target_id, context, confidence)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(&id)
            .bind(&citation.source_id)
            .bind(&citation.target_url)
            .bind(&citation.target_id)
            .bind(&citation.context)
            .bind(citation.confidence),
        )
        .await?;

        self.execute(
            sqlx::query("INSERT INTO citations_fts (citation_id, context) VALUES (?, ?)")
                .bind(&id)
                .bind(&citation.context),
        )
        .await?;

        Ok(id)
    }

    /// Citations around a document. `Citing` returns edges pointing at it
    /// (who cites me); `Cited` returns edges leaving it (who do I cite).
    pub async fn citations_for(&self, document_id: &str, direction: Direction) -> Result<Vec<Citation>> {
        let sql = match direction {
            Direction::Citing => {
                "SELECT id, source_id, target_url, target_id, context, confidence \
                 FROM citations WHERE target_id = ?"
            }
            Direction::Cited => {
                "SELECT id, source_id, target_url, target_id, context, confidence \
                 FROM citations WHERE source_id = ?"
            }
        };

        let rows = self.fetch_all(sqlx::query(sql).bind(document_id)).await?;
        Ok(rows.iter().map(row_to_citation).collect())
    }

    /// Every citation edge in the store. Used by graph export.
    pub async fn list_citations(&self) -> Result<Vec<Citation>> {
        let rows = self
            .fetch_all(sqlx::query(
                "SELECT id, source_id, target_url, target_id, context, confidence \
                 FROM citations ORDER BY source_id, target_url",
            ))
            .await?;
        Ok(rows.iter().map(row_to_citation).collect())
    }

    /// Drop every citation originating from a document. Used by the
    /// indexing run to regenerate a document's edges from scratch.
    pub async fn delete_citations_from(&self, document_id: &str) -> Result<u64> {
        self.execute(
            sqlx::query(
                "DELETE FROM citations_fts WHERE citation_id IN \
                 (SELECT id FROM citations WHERE source_id = ?)",
            )
            .bind(document_id),
        )
        .await?;

        let result = self
            .execute(sqlx::query("DELETE FROM citations WHERE source_id = ?").bind(document_id))
            .await?;

        Ok(result.rows_affected())
    }

    // ============ Stats ============

    pub async fn stats(&self) -> Result<StoreStats> {
        let doc_row = self
            .fetch_optional(sqlx::query("SELECT COUNT(*) AS n FROM documents"))
            .await?;
        let citation_row = self
            .fetch_optional(sqlx::query("SELECT COUNT(*) AS n FROM citations"))
            .await?;

        let document_count = doc_row.map(|r| r.get::<i64, _>("n")).unwrap_or(0);
        let citation_count = citation_row.map(|r| r.get::<i64, _>("n")).unwrap_or(0);
        let size_bytes = std::fs::metadata(&self.db_path).map(|m| m.len()).unwrap_or(0);

        Ok(StoreStats {
            document_count,
            citation_count,
            size_bytes,
        })
    }
}

fn row_to_document(row: &SqliteRow) -> Result<Document> {
    let source_str: String = row.get("source");
    let source = Source::parse(&source_str)
        .ok_or_else(|| Error::Store(format!("unknown source value: {}", source_str)))?;
    let doc_type_str: String = row.get("doc_type");
    let metadata_json: String = row.get("metadata_json");
    let metadata =
        serde_json::from_str(&metadata_json).unwrap_or_else(|_| serde_json::json!({}));

    Ok(Document {
        id: row.get("id"),
        title: row.get("title"),
        path: row.get("path"),
        source,
        doc_type: DocType::parse(&doc_type_str),
        date: row.get("date"),
        content: row.get("content"),
        query: row.get("query"),
        metadata,
    })
}

fn row_to_citation(row: &SqliteRow) -> Citation {
    Citation {
        id: row.get("id"),
        source_id: row.get("source_id"),
        target_url: row.get("target_url"),
        target_id: row.get("target_id"),
        context: row.get("context"),
        confidence: row.get("confidence"),
    }
}

/// Build the FTS5 MATCH expression: sanitized terms ANDed together,
/// optionally prefix-expanded, optionally restricted to a field subset via
/// a column filter.
fn build_match_expression(query: &str, fields: Option<&[String]>, fuzzy: bool) -> Option<String> {
    let terms: Vec<String> = query
        .split_whitespace()
        .map(|t| {
            t.chars()
                .filter(|c| c.is_alphanumeric())
                .collect::<String>()
        })
        .filter(|t| !t.is_empty())
        .map(|t| {
            if fuzzy {
                format!("\"{}\"*", t)
            } else {
                format!("\"{}\"", t)
            }
        })
        .collect();

    if terms.is_empty() {
        return None;
    }

    let expr = terms.join(" ");

    let selected: Vec<&str> = fields
        .map(|fs| {
            fs.iter()
                .map(|f| f.as_str())
                .filter(|f| SEARCHABLE_FIELDS.contains(f))
                .collect()
        })
        .unwrap_or_default();

    if selected.is_empty() || selected.len() == SEARCHABLE_FIELDS.len() {
        Some(expr)
    } else {
        Some(format!("{{{}}}: ({})", selected.join(" "), expr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn open_store() -> (TempDir, DocumentStore) {
        let tmp = TempDir::new().unwrap();
        let store = DocumentStore::open(&tmp.path().join("cdx.sqlite"))
            .await
            .unwrap();
        (tmp, store)
    }

    fn doc(id: &str, title: &str, content: &str) -> Document {
        Document {
            id: id.to_string(),
            title: title.to_string(),
            path: format!("{}.md", id),
            source: Source::Research,
            doc_type: DocType::Report,
            date: None,
            content: content.to_string(),
            query: None,
            metadata: serde_json::json!({}),
        }
    }

    fn citation(source_id: &str, target_url: &str, target_id: Option<&str>) -> Citation {
        Citation {
            id: String::new(),
            source_id: source_id.to_string(),
            target_url: target_url.to_string(),
            target_id: target_id.map(|s| s.to_string()),
            context: "see link".to_string(),
            confidence: 1.0,
        }
    }

    #[tokio::test]
    async fn test_upsert_get_roundtrip() {
        let (_tmp, store) = open_store().await;
        let mut d = doc("d1", "First", "some body text");
        d.metadata = serde_json::json!({"url": "https://example.com/a"});
        d.date = Some("2024-03-01".to_string());

        let outcome = store.upsert(&d).await.unwrap();
        assert!(outcome.added);

        let fetched = store.get("d1").await.unwrap();
        assert_eq!(fetched.title, "First");
        assert_eq!(fetched.date.as_deref(), Some("2024-03-01"));
        assert_eq!(fetched.original_url(), Some("https://example.com/a"));
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent_on_id() {
        let (_tmp, store) = open_store().await;
        store.upsert(&doc("d1", "Old title", "old")).await.unwrap();
        let outcome = store.upsert(&doc("d1", "New title", "new")).await.unwrap();
        assert!(!outcome.added);

        let all = store.list().await.unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].title, "New title");
        assert_eq!(all[0].content, "new");
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let (_tmp, store) = open_store().await;
        match store.get("nope").await {
            Err(Error::NotFound(id)) => assert_eq!(id, "nope"),
            other => panic!("expected NotFound, got {:?}", other.map(|d| d.id)),
        }
    }

    #[tokio::test]
    async fn test_delete() {
        let (_tmp, store) = open_store().await;
        store.upsert(&doc("d1", "One", "body")).await.unwrap();

        assert!(store.delete("d1").await.unwrap());
        assert!(!store.delete("d1").await.unwrap());
        assert!(store.list().await.unwrap().is_empty());

        // No longer reachable through search either
        let hits = store.search("body", None, false, 10).await.unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_title_match_ranks_above_content_match() {
        let (_tmp, store) = open_store().await;
        store
            .upsert(&doc("x", "alpha methods", "unrelated body"))
            .await
            .unwrap();
        store
            .upsert(&doc("y", "other title", "mentions alpha in the body only"))
            .await
            .unwrap();

        let hits = store.search("alpha", None, false, 10).await.unwrap();
        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].document.id, "x");
        assert!(hits[0].score > hits[1].score);
    }

    #[tokio::test]
    async fn test_fuzzy_prefix_match() {
        let (_tmp, store) = open_store().await;
        store
            .upsert(&doc("d1", "Rust programming", "systems language"))
            .await
            .unwrap();

        assert!(store.search("progr", None, false, 10).await.unwrap().is_empty());
        let hits = store.search("progr", None, true, 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].document.id, "d1");
    }

    #[tokio::test]
    async fn test_field_restriction() {
        let (_tmp, store) = open_store().await;
        store
            .upsert(&doc("d1", "quartz crystals", "nothing relevant"))
            .await
            .unwrap();

        let fields = vec!["content".to_string()];
        let hits = store
            .search("quartz", Some(&fields), false, 10)
            .await
            .unwrap();
        assert!(hits.is_empty());

        let fields = vec!["title".to_string()];
        let hits = store
            .search("quartz", Some(&fields), false, 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_highlights_delimit_matches() {
        let (_tmp, store) = open_store().await;
        store
            .upsert(&doc("d1", "plain", "the zebra crossed the road"))
            .await
            .unwrap();

        let hits = store.search("zebra", None, false, 10).await.unwrap();
        let content_highlight = hits[0]
            .highlights
            .iter()
            .find(|h| h.field == "content")
            .expect("content highlight");
        assert!(content_highlight.snippets[0].contains(">>>zebra<<<"));
    }

    #[tokio::test]
    async fn test_empty_query_returns_nothing() {
        let (_tmp, store) = open_store().await;
        store.upsert(&doc("d1", "One", "body")).await.unwrap();
        assert!(store.search("   ", None, false, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nested_begin_is_rejected() {
        let (_tmp, store) = open_store().await;
        store.begin().await.unwrap();
        match store.begin().await {
            Err(Error::NestedTransaction) => {}
            other => panic!("expected NestedTransaction, got {:?}", other.err()),
        }
        store.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn test_commit_without_begin_is_rejected() {
        let (_tmp, store) = open_store().await;
        assert!(matches!(store.commit().await, Err(Error::NoTransaction)));
    }

    #[tokio::test]
    async fn test_rollback_discards_writes() {
        let (_tmp, store) = open_store().await;
        store.begin().await.unwrap();
        store.upsert(&doc("d1", "One", "body")).await.unwrap();
        store.rollback().await.unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert!(store.search("body", None, false, 10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_commit_persists_writes() {
        let (_tmp, store) = open_store().await;
        store.begin().await.unwrap();
        store.upsert(&doc("d1", "One", "body")).await.unwrap();
        store.commit().await.unwrap();

        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_citation_directions() {
        let (_tmp, store) = open_store().await;
        store.upsert(&doc("a", "A", "")).await.unwrap();
        store.upsert(&doc("b", "B", "")).await.unwrap();
        store
            .add_citation(&citation("a", "https://x.com/b", Some("b")))
            .await
            .unwrap();

        // b is cited by a
        let citing = store.citations_for("b", Direction::Citing).await.unwrap();
        assert_eq!(citing.len(), 1);
        assert_eq!(citing[0].source_id, "a");

        // a cites b
        let cited = store.citations_for("a", Direction::Cited).await.unwrap();
        assert_eq!(cited.len(), 1);
        assert_eq!(cited[0].target_id.as_deref(), Some("b"));

        assert!(store.citations_for("a", Direction::Citing).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_duplicate_citations_are_kept() {
        let (_tmp, store) = open_store().await;
        store.upsert(&doc("a", "A", "")).await.unwrap();
        store
            .add_citation(&citation("a", "https://x.com/p", None))
            .await
            .unwrap();
        let mut inferred = citation("a", "https://x.com/p", None);
        inferred.confidence = 0.8;
        store.add_citation(&inferred).await.unwrap();

        let cited = store.citations_for("a", Direction::Cited).await.unwrap();
        assert_eq!(cited.len(), 2);
    }

    #[tokio::test]
    async fn test_delete_citations_from() {
        let (_tmp, store) = open_store().await;
        store.upsert(&doc("a", "A", "")).await.unwrap();
        store
            .add_citation(&citation("a", "https://x.com/1", None))
            .await
            .unwrap();
        store
            .add_citation(&citation("a", "https://x.com/2", None))
            .await
            .unwrap();

        assert_eq!(store.delete_citations_from("a").await.unwrap(), 2);
        assert!(store.citations_for("a", Direction::Cited).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_stats() {
        let (_tmp, store) = open_store().await;
        store.upsert(&doc("a", "A", "body")).await.unwrap();
        store.upsert(&doc("b", "B", "body")).await.unwrap();
        store
            .add_citation(&citation("a", "https://x.com/b", Some("b")))
            .await
            .unwrap();

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.document_count, 2);
        assert_eq!(stats.citation_count, 1);
        assert!(stats.size_bytes > 0);
    }

    #[test]
    fn test_match_expression_sanitizes_operators() {
        let expr = build_match_expression("hello OR\" drop(", None, false).unwrap();
        assert_eq!(expr, "\"hello\" \"OR\" \"drop\"");
    }

    #[test]
    fn test_match_expression_field_filter() {
        let fields = vec!["title".to_string(), "bogus".to_string()];
        let expr = build_match_expression("rust", Some(&fields), true).unwrap();
        assert_eq!(expr, "{title}: (\"rust\"*)");
    }
}
