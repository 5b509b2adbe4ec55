use sqlx::SqlitePool;

use crate::error::Result;

/// Create the schema. Idempotent — safe to run on every start.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    // Documents table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS documents (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            path TEXT NOT NULL,
            source TEXT NOT NULL,
            doc_type TEXT NOT NULL DEFAULT 'unknown',
            date TEXT,
            query TEXT,
            content TEXT NOT NULL DEFAULT '',
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(source, path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Citations table
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS citations (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL,
            target_url TEXT NOT NULL,
            target_id TEXT,
            context TEXT NOT NULL DEFAULT '',
            confidence REAL NOT NULL DEFAULT 1.0,
            FOREIGN KEY (source_id) REFERENCES documents(id) ON DELETE CASCADE,
            FOREIGN KEY (target_id) REFERENCES documents(id) ON DELETE SET NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 virtual tables over documents and citation context.
    // FTS5 CREATE is not idempotent natively, so we check first.
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='documents_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE documents_fts USING fts5(
                document_id UNINDEXED,
                title,
                content,
                query
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    let citation_fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='citations_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !citation_fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE citations_fts USING fts5(
                citation_id UNINDEXED,
                context
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    // Indexes
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_citations_source_id ON citations(source_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_citations_target_id ON citations(target_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_citations_target_url ON citations(target_url)")
        .execute(pool)
        .await?;

    Ok(())
}
