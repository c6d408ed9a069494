use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    apply(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index. Idempotent.
pub async fn apply(pool: &SqlitePool) -> Result<()> {
    // One row per distinct source URL
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS harvested_records (
            source_url TEXT PRIMARY KEY,
            source_repository TEXT NOT NULL,
            source_checksum TEXT NOT NULL,
            registry_id TEXT,
            registry_checksum TEXT,
            status TEXT NOT NULL DEFAULT 'in_progress',
            title TEXT,
            site_references TEXT NOT NULL DEFAULT '[]',
            habitat_references TEXT NOT NULL DEFAULT '[]',
            dataset_type TEXT,
            keywords TEXT NOT NULL DEFAULT '[]',
            last_harvested_at INTEGER NOT NULL,
            last_seen_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Operator patches; values are JSON text
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS record_rules (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            registry_id TEXT NOT NULL,
            target_path TEXT NOT NULL,
            before_value TEXT NOT NULL DEFAULT 'null',
            after_value TEXT NOT NULL DEFAULT 'null',
            UNIQUE(registry_id, target_path)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS resolved_records (
            registry_id TEXT PRIMARY KEY,
            resolved_by TEXT,
            resolved_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_repository ON harvested_records(source_repository)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_registry_id ON harvested_records(registry_id)",
    )
    .execute(pool)
    .await?;
    sqlx::query(
        "CREATE INDEX IF NOT EXISTS idx_records_last_seen ON harvested_records(last_seen_at)",
    )
    .execute(pool)
    .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_rules_registry_id ON record_rules(registry_id)")
        .execute(pool)
        .await?;

    Ok(())
}
