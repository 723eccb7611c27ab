//! SQLite schema of the secondary index. Everything here can be rebuilt from the vault.

use sqlx::SqlitePool;

/// Bumped whenever a table definition changes; a mismatch drops and recreates the index.
pub const SCHEMA_VERSION: i64 = 1;

const TABLES: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS memories (
        id          TEXT PRIMARY KEY,
        project     TEXT NOT NULL,
        category    TEXT NOT NULL,
        tags        TEXT NOT NULL DEFAULT '[]',
        title       TEXT NOT NULL,
        what        TEXT NOT NULL,
        why         TEXT,
        impact      TEXT,
        source      TEXT,
        created_at  TEXT NOT NULL,
        file_path   TEXT NOT NULL,
        summary     TEXT NOT NULL,
        has_more    INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE INDEX IF NOT EXISTS idx_memories_project_created ON memories(project, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_memories_created ON memories(created_at DESC, id)",
    "CREATE VIRTUAL TABLE IF NOT EXISTS memories_fts USING fts5(
        id UNINDEXED,
        title,
        what,
        why,
        impact,
        tags,
        tokenize = 'porter unicode61'
    )",
    "CREATE TABLE IF NOT EXISTS memory_vectors (
        id         TEXT PRIMARY KEY REFERENCES memories(id) ON DELETE CASCADE,
        model      TEXT NOT NULL,
        dims       INTEGER NOT NULL,
        embedding  BLOB NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS meta (
        key    TEXT PRIMARY KEY,
        value  TEXT NOT NULL
    )",
];

const DROP_ALL: &[&str] = &[
    "DROP TABLE IF EXISTS memory_vectors",
    "DROP TABLE IF EXISTS memories_fts",
    "DROP TABLE IF EXISTS memories",
    "DROP TABLE IF EXISTS meta",
];

/// Create the index tables, recreating them if they were built by another schema version.
pub async fn run_migrations(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    let version: i64 = sqlx::query_scalar("PRAGMA user_version")
        .fetch_one(pool)
        .await?;

    let mut tx = pool.begin().await?;
    if version != 0 && version != SCHEMA_VERSION {
        tracing::info!(
            found = version,
            expected = SCHEMA_VERSION,
            "index schema changed, rebuilding tables; run reindex to repopulate"
        );
        for stmt in DROP_ALL {
            sqlx::query(stmt).execute(&mut *tx).await?;
        }
    }
    for stmt in TABLES {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }
    sqlx::query(&format!("PRAGMA user_version = {SCHEMA_VERSION}"))
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;
    Ok(())
}
