//! Vector store schema.

use anyhow::Result;
use sqlx::SqlitePool;

pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS records (
            id TEXT PRIMARY KEY,
            source_path TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            kind TEXT NOT NULL,
            content_hash TEXT NOT NULL,
            text TEXT NOT NULL,
            embedding BLOB NOT NULL,
            dims INTEGER NOT NULL,
            model TEXT NOT NULL DEFAULT '',
            timestamp INTEGER NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            UNIQUE(source_path, chunk_index)
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Stores created before records carried their model. The empty name
    // never matches a provider, so those chunks are re-embedded once.
    let columns: Vec<String> = sqlx::query_scalar("SELECT name FROM pragma_table_info('records')")
        .fetch_all(pool)
        .await?;
    if !columns.iter().any(|c| c == "model") {
        sqlx::query("ALTER TABLE records ADD COLUMN model TEXT NOT NULL DEFAULT ''")
            .execute(pool)
            .await?;
    }

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_source_path ON records(source_path)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_records_kind ON records(kind)")
        .execute(pool)
        .await?;

    Ok(())
}
