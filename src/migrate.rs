use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

/// Create every table and index `cmx` needs. Safe to run repeatedly.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Chunks are written by the ingestion collaborator and only read here.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS document_chunks (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            document_name TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL DEFAULT 0,
            text TEXT NOT NULL,
            embedding BLOB,
            page_numbers_json TEXT NOT NULL DEFAULT '[]',
            location_markers_json TEXT NOT NULL DEFAULT '[]',
            external_file_id TEXT
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS analysis_requests (
            request_id TEXT PRIMARY KEY,
            caller_id TEXT NOT NULL,
            prompt TEXT NOT NULL,
            analysis_type TEXT NOT NULL,
            columns_json TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL,
            retry_count INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS matrix_cells (
            request_id TEXT NOT NULL,
            document_id TEXT NOT NULL,
            field_name TEXT NOT NULL,
            document_name TEXT NOT NULL,
            value TEXT NOT NULL,
            exact_quote TEXT NOT NULL DEFAULT '',
            page_numbers_json TEXT NOT NULL DEFAULT '[]',
            document_url TEXT NOT NULL DEFAULT '',
            confidence REAL NOT NULL,
            verified INTEGER NOT NULL DEFAULT 0,
            reported_quote TEXT,
            source TEXT,
            location_markers_json TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (request_id, document_id, field_name)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // FTS5 CREATE is not idempotent natively, so we check first
    let fts_exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name='chunks_fts'",
    )
    .fetch_one(pool)
    .await?;

    if !fts_exists {
        sqlx::query(
            r#"
            CREATE VIRTUAL TABLE chunks_fts USING fts5(
                chunk_id UNINDEXED,
                document_id UNINDEXED,
                owner_id UNINDEXED,
                text
            )
            "#,
        )
        .execute(pool)
        .await?;
    }

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_chunks_owner ON document_chunks(owner_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_document_chunks_document ON document_chunks(document_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_analysis_requests_caller ON analysis_requests(caller_id)",
    )
    .execute(pool)
    .await?;

    Ok(())
}
