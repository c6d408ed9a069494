//! SQLite-backed [`Store`] implementation.
//!
//! [`SqliteStore`] runs every call on its own pooled connection, so each one
//! commits alone. [`Store::begin`] hands out a [`SqliteTransaction`] that owns
//! one sqlx transaction for the life of a run. SQLite admits one writer at a
//! time, so transactions begun on the same store queue behind each other
//! instead of failing on a busy database.

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::debug;

use harvester_core::models::{
    HarvestedRecord, OverrideRule, RecordStatus, RepositoryType, RuleDraft,
};
use harvester_core::store::{RecordStore, Store, StoreTransaction};

/// SQLite implementation of the [`Store`] trait.
pub struct SqliteStore {
    pool: SqlitePool,
    writer: Arc<Mutex<()>>,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl SqliteStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            writer: Arc::new(Mutex::new(())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

const RECORD_COLUMNS: &str = "source_url, source_repository, source_checksum, registry_id, \
     registry_checksum, status, title, site_references, habitat_references, dataset_type, \
     keywords, last_harvested_at, last_seen_at";

fn record_from_row(row: &SqliteRow) -> Result<HarvestedRecord> {
    let repository: String = row.try_get("source_repository")?;
    let status: String = row.try_get("status")?;
    let sites: String = row.try_get("site_references")?;
    let habitats: String = row.try_get("habitat_references")?;
    let keywords: String = row.try_get("keywords")?;
    Ok(HarvestedRecord {
        source_url: row.try_get("source_url")?,
        source_repository: repository.parse()?,
        source_checksum: row.try_get("source_checksum")?,
        registry_id: row.try_get("registry_id")?,
        registry_checksum: row.try_get("registry_checksum")?,
        status: status.parse()?,
        title: row.try_get("title")?,
        site_references: serde_json::from_str(&sites).context("corrupt site_references")?,
        habitat_references: serde_json::from_str(&habitats)
            .context("corrupt habitat_references")?,
        dataset_type: row.try_get("dataset_type")?,
        keywords: serde_json::from_str(&keywords).context("corrupt keywords")?,
        last_harvested_at: row.try_get("last_harvested_at")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn rule_from_row(row: &SqliteRow) -> Result<OverrideRule> {
    let before: String = row.try_get("before_value")?;
    let after: String = row.try_get("after_value")?;
    Ok(OverrideRule {
        id: row.try_get("id")?,
        registry_id: row.try_get("registry_id")?,
        target_path: row.try_get("target_path")?,
        before_value: serde_json::from_str(&before)?,
        after_value: serde_json::from_str(&after)?,
    })
}

#[async_trait]
impl RecordStore for SqliteStore {
    async fn records_by_source_url(&self, source_url: &str) -> Result<Vec<HarvestedRecord>> {
        let mut conn = self.pool.acquire().await?;
        sql::records_by_source_url(&mut conn, source_url).await
    }

    async fn record_by_registry_id(&self, registry_id: &str) -> Result<Option<HarvestedRecord>> {
        let mut conn = self.pool.acquire().await?;
        sql::record_by_registry_id(&mut conn, registry_id).await
    }

    async fn list_by_repository(
        &self,
        repository: Option<RepositoryType>,
    ) -> Result<Vec<HarvestedRecord>> {
        let mut conn = self.pool.acquire().await?;
        sql::list_by_repository(&mut conn, repository).await
    }

    async fn list_registry_ids(&self, repository: RepositoryType) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        sql::list_registry_ids(&mut conn, repository).await
    }

    async fn create_record(&self, record: &HarvestedRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sql::create_record(&mut conn, record).await
    }

    async fn update_record(&self, current_url: &str, record: &HarvestedRecord) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sql::update_record(&mut conn, current_url, record).await
    }

    async fn set_status(&self, source_url: &str, status: RecordStatus) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sql::set_status(&mut conn, source_url, status).await
    }

    async fn mark_seen(&self, source_url: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sql::mark_seen(&mut conn, source_url).await
    }

    async fn mark_repository_in_progress(&self, repository: RepositoryType) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        sql::mark_repository_in_progress(&mut conn, repository).await
    }

    async fn delete_record(&self, source_url: &str) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sql::delete_record(&mut conn, source_url).await
    }

    async fn delete_unseen(&self, repository: RepositoryType, cutoff: i64) -> Result<Vec<String>> {
        let mut conn = self.pool.acquire().await?;
        sql::delete_unseen(&mut conn, repository, cutoff).await
    }

    async fn rules_for_record(&self, registry_id: &str) -> Result<Vec<OverrideRule>> {
        let mut conn = self.pool.acquire().await?;
        sql::rules_for_record(&mut conn, registry_id).await
    }

    async fn upsert_rule(&self, registry_id: &str, draft: &RuleDraft) -> Result<OverrideRule> {
        let mut conn = self.pool.acquire().await?;
        sql::upsert_rule(&mut conn, registry_id, draft).await
    }

    async fn delete_rule(&self, registry_id: &str, rule_id: i64) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        sql::delete_rule(&mut conn, registry_id, rule_id).await
    }

    async fn mark_resolved(&self, registry_id: &str, resolved_by: Option<&str>) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        sql::mark_resolved(&mut conn, registry_id, resolved_by).await
    }

    async fn delete_resolved(&self, registry_id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        sql::delete_resolved(&mut conn, registry_id).await
    }

    async fn is_resolved(&self, registry_id: &str) -> Result<bool> {
        let mut conn = self.pool.acquire().await?;
        sql::is_resolved(&mut conn, registry_id).await
    }
}

#[async_trait]
impl Store for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let writer = Arc::clone(&self.writer).lock_owned().await;
        let tx = self.pool.begin().await.context("Failed to begin transaction")?;
        debug!("transaction opened");
        Ok(Box::new(SqliteTransaction {
            open: Mutex::new(Some(OpenTx {
                tx,
                _writer: writer,
            })),
        }))
    }
}

struct OpenTx {
    tx: Transaction<'static, Sqlite>,
    _writer: OwnedMutexGuard<()>,
}

/// A run-scoped transaction. Calls are serialized on its one connection.
/// Dropping it unfinished rolls it back.
pub struct SqliteTransaction {
    open: Mutex<Option<OpenTx>>,
}

impl SqliteTransaction {
    async fn finish(&self) -> Result<Transaction<'static, Sqlite>> {
        self.open
            .lock()
            .await
            .take()
            .map(|open| open.tx)
            .ok_or_else(|| anyhow!("transaction already finished"))
    }
}

fn live(open: &mut Option<OpenTx>) -> Result<&mut SqliteConnection> {
    open.as_mut()
        .map(|open| &mut *open.tx)
        .ok_or_else(|| anyhow!("transaction already finished"))
}

#[async_trait]
impl RecordStore for SqliteTransaction {
    async fn records_by_source_url(&self, source_url: &str) -> Result<Vec<HarvestedRecord>> {
        let mut open = self.open.lock().await;
        sql::records_by_source_url(live(&mut open)?, source_url).await
    }

    async fn record_by_registry_id(&self, registry_id: &str) -> Result<Option<HarvestedRecord>> {
        let mut open = self.open.lock().await;
        sql::record_by_registry_id(live(&mut open)?, registry_id).await
    }

    async fn list_by_repository(
        &self,
        repository: Option<RepositoryType>,
    ) -> Result<Vec<HarvestedRecord>> {
        let mut open = self.open.lock().await;
        sql::list_by_repository(live(&mut open)?, repository).await
    }

    async fn list_registry_ids(&self, repository: RepositoryType) -> Result<Vec<String>> {
        let mut open = self.open.lock().await;
        sql::list_registry_ids(live(&mut open)?, repository).await
    }

    async fn create_record(&self, record: &HarvestedRecord) -> Result<()> {
        let mut open = self.open.lock().await;
        sql::create_record(live(&mut open)?, record).await
    }

    async fn update_record(&self, current_url: &str, record: &HarvestedRecord) -> Result<()> {
        let mut open = self.open.lock().await;
        sql::update_record(live(&mut open)?, current_url, record).await
    }

    async fn set_status(&self, source_url: &str, status: RecordStatus) -> Result<()> {
        let mut open = self.open.lock().await;
        sql::set_status(live(&mut open)?, source_url, status).await
    }

    async fn mark_seen(&self, source_url: &str) -> Result<()> {
        let mut open = self.open.lock().await;
        sql::mark_seen(live(&mut open)?, source_url).await
    }

    async fn mark_repository_in_progress(&self, repository: RepositoryType) -> Result<u64> {
        let mut open = self.open.lock().await;
        sql::mark_repository_in_progress(live(&mut open)?, repository).await
    }

    async fn delete_record(&self, source_url: &str) -> Result<()> {
        let mut open = self.open.lock().await;
        sql::delete_record(live(&mut open)?, source_url).await
    }

    async fn delete_unseen(&self, repository: RepositoryType, cutoff: i64) -> Result<Vec<String>> {
        let mut open = self.open.lock().await;
        sql::delete_unseen(live(&mut open)?, repository, cutoff).await
    }

    async fn rules_for_record(&self, registry_id: &str) -> Result<Vec<OverrideRule>> {
        let mut open = self.open.lock().await;
        sql::rules_for_record(live(&mut open)?, registry_id).await
    }

    async fn upsert_rule(&self, registry_id: &str, draft: &RuleDraft) -> Result<OverrideRule> {
        let mut open = self.open.lock().await;
        sql::upsert_rule(live(&mut open)?, registry_id, draft).await
    }

    async fn delete_rule(&self, registry_id: &str, rule_id: i64) -> Result<bool> {
        let mut open = self.open.lock().await;
        sql::delete_rule(live(&mut open)?, registry_id, rule_id).await
    }

    async fn mark_resolved(&self, registry_id: &str, resolved_by: Option<&str>) -> Result<()> {
        let mut open = self.open.lock().await;
        sql::mark_resolved(live(&mut open)?, registry_id, resolved_by).await
    }

    async fn delete_resolved(&self, registry_id: &str) -> Result<bool> {
        let mut open = self.open.lock().await;
        sql::delete_resolved(live(&mut open)?, registry_id).await
    }

    async fn is_resolved(&self, registry_id: &str) -> Result<bool> {
        let mut open = self.open.lock().await;
        sql::is_resolved(live(&mut open)?, registry_id).await
    }
}

#[async_trait]
impl StoreTransaction for SqliteTransaction {
    async fn commit(&self) -> Result<()> {
        self.finish().await?.commit().await?;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.finish().await?.rollback().await?;
        Ok(())
    }
}

mod sql {
    use super::*;
    use anyhow::bail;

    pub(super) async fn records_by_source_url(
        conn: &mut SqliteConnection,
        source_url: &str,
    ) -> Result<Vec<HarvestedRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM harvested_records WHERE source_url = ?",
            RECORD_COLUMNS
        ))
        .bind(source_url)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(record_from_row).collect()
    }

    pub(super) async fn record_by_registry_id(
        conn: &mut SqliteConnection,
        registry_id: &str,
    ) -> Result<Option<HarvestedRecord>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM harvested_records WHERE registry_id = ? LIMIT 1",
            RECORD_COLUMNS
        ))
        .bind(registry_id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(record_from_row).transpose()
    }

    pub(super) async fn list_by_repository(
        conn: &mut SqliteConnection,
        repository: Option<RepositoryType>,
    ) -> Result<Vec<HarvestedRecord>> {
        let rows = match repository {
            Some(repo) => {
                sqlx::query(&format!(
                    "SELECT {} FROM harvested_records WHERE source_repository = ? ORDER BY source_url",
                    RECORD_COLUMNS
                ))
                .bind(repo.as_str())
                .fetch_all(&mut *conn)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM harvested_records ORDER BY source_url",
                    RECORD_COLUMNS
                ))
                .fetch_all(&mut *conn)
                .await?
            }
        };
        rows.iter().map(record_from_row).collect()
    }

    pub(super) async fn list_registry_ids(
        conn: &mut SqliteConnection,
        repository: RepositoryType,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            "SELECT registry_id FROM harvested_records WHERE source_repository = ? AND registry_id IS NOT NULL",
        )
        .bind(repository.as_str())
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }

    pub(super) async fn create_record(
        conn: &mut SqliteConnection,
        record: &HarvestedRecord,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO harvested_records (source_url, source_repository, source_checksum,
                                           registry_id, registry_checksum, status, title,
                                           site_references, habitat_references, dataset_type,
                                           keywords, last_harvested_at, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_url) DO UPDATE SET
                source_repository = excluded.source_repository,
                source_checksum = excluded.source_checksum,
                registry_id = excluded.registry_id,
                registry_checksum = excluded.registry_checksum,
                status = excluded.status,
                title = excluded.title,
                site_references = excluded.site_references,
                habitat_references = excluded.habitat_references,
                dataset_type = excluded.dataset_type,
                keywords = excluded.keywords,
                last_harvested_at = excluded.last_harvested_at,
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(&record.source_url)
        .bind(record.source_repository.as_str())
        .bind(&record.source_checksum)
        .bind(&record.registry_id)
        .bind(&record.registry_checksum)
        .bind(record.status.as_str())
        .bind(&record.title)
        .bind(serde_json::to_string(&record.site_references)?)
        .bind(serde_json::to_string(&record.habitat_references)?)
        .bind(&record.dataset_type)
        .bind(serde_json::to_string(&record.keywords)?)
        .bind(record.last_harvested_at)
        .bind(record.last_seen_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub(super) async fn update_record(
        conn: &mut SqliteConnection,
        current_url: &str,
        record: &HarvestedRecord,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE harvested_records SET
                source_url = ?,
                source_repository = ?,
                source_checksum = ?,
                registry_id = ?,
                registry_checksum = ?,
                status = ?,
                title = ?,
                site_references = ?,
                habitat_references = ?,
                dataset_type = ?,
                keywords = ?,
                last_harvested_at = ?,
                last_seen_at = ?
            WHERE source_url = ?
            "#,
        )
        .bind(&record.source_url)
        .bind(record.source_repository.as_str())
        .bind(&record.source_checksum)
        .bind(&record.registry_id)
        .bind(&record.registry_checksum)
        .bind(record.status.as_str())
        .bind(&record.title)
        .bind(serde_json::to_string(&record.site_references)?)
        .bind(serde_json::to_string(&record.habitat_references)?)
        .bind(&record.dataset_type)
        .bind(serde_json::to_string(&record.keywords)?)
        .bind(record.last_harvested_at)
        .bind(record.last_seen_at)
        .bind(current_url)
        .execute(&mut *conn)
        .await
        .with_context(|| format!("Failed to update record {}", current_url))?;
        if result.rows_affected() == 0 {
            bail!("no record stored at {}", current_url);
        }
        Ok(())
    }

    pub(super) async fn set_status(
        conn: &mut SqliteConnection,
        source_url: &str,
        status: RecordStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE harvested_records SET
                status = ?,
                last_seen_at = CASE WHEN ? THEN ? ELSE last_seen_at END
            WHERE source_url = ?
            "#,
        )
        .bind(status.as_str())
        .bind(status == RecordStatus::Success)
        .bind(now())
        .bind(source_url)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub(super) async fn mark_seen(conn: &mut SqliteConnection, source_url: &str) -> Result<()> {
        sqlx::query("UPDATE harvested_records SET last_seen_at = ? WHERE source_url = ?")
            .bind(now())
            .bind(source_url)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub(super) async fn mark_repository_in_progress(
        conn: &mut SqliteConnection,
        repository: RepositoryType,
    ) -> Result<u64> {
        let result =
            sqlx::query("UPDATE harvested_records SET status = ? WHERE source_repository = ?")
                .bind(RecordStatus::InProgress.as_str())
                .bind(repository.as_str())
                .execute(&mut *conn)
                .await?;
        Ok(result.rows_affected())
    }

    pub(super) async fn delete_record(conn: &mut SqliteConnection, source_url: &str) -> Result<()> {
        sqlx::query("DELETE FROM harvested_records WHERE source_url = ?")
            .bind(source_url)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub(super) async fn delete_unseen(
        conn: &mut SqliteConnection,
        repository: RepositoryType,
        cutoff: i64,
    ) -> Result<Vec<String>> {
        let ids: Vec<String> = sqlx::query_scalar(
            r#"
            DELETE FROM harvested_records
            WHERE source_repository = ?
              AND last_seen_at < ?
              AND registry_id IS NOT NULL
              AND registry_id NOT IN (SELECT registry_id FROM record_rules)
              AND registry_id NOT IN (SELECT registry_id FROM resolved_records)
            RETURNING registry_id
            "#,
        )
        .bind(repository.as_str())
        .bind(cutoff)
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }

    pub(super) async fn rules_for_record(
        conn: &mut SqliteConnection,
        registry_id: &str,
    ) -> Result<Vec<OverrideRule>> {
        let rows = sqlx::query(
            "SELECT id, registry_id, target_path, before_value, after_value FROM record_rules WHERE registry_id = ? ORDER BY id",
        )
        .bind(registry_id)
        .fetch_all(&mut *conn)
        .await?;
        rows.iter().map(rule_from_row).collect()
    }

    pub(super) async fn upsert_rule(
        conn: &mut SqliteConnection,
        registry_id: &str,
        draft: &RuleDraft,
    ) -> Result<OverrideRule> {
        let row = sqlx::query(
            r#"
            INSERT INTO record_rules (registry_id, target_path, before_value, after_value)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(registry_id, target_path) DO UPDATE SET
                before_value = excluded.before_value,
                after_value = excluded.after_value
            RETURNING id, registry_id, target_path, before_value, after_value
            "#,
        )
        .bind(registry_id)
        .bind(&draft.target_path)
        .bind(serde_json::to_string(&draft.before_value)?)
        .bind(serde_json::to_string(&draft.after_value)?)
        .fetch_one(&mut *conn)
        .await?;
        rule_from_row(&row)
    }

    pub(super) async fn delete_rule(
        conn: &mut SqliteConnection,
        registry_id: &str,
        rule_id: i64,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM record_rules WHERE registry_id = ? AND id = ?")
            .bind(registry_id)
            .bind(rule_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(super) async fn mark_resolved(
        conn: &mut SqliteConnection,
        registry_id: &str,
        resolved_by: Option<&str>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO resolved_records (registry_id, resolved_by, resolved_at)
            VALUES (?, ?, ?)
            ON CONFLICT(registry_id) DO UPDATE SET
                resolved_by = excluded.resolved_by,
                resolved_at = excluded.resolved_at
            "#,
        )
        .bind(registry_id)
        .bind(resolved_by)
        .bind(now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub(super) async fn delete_resolved(
        conn: &mut SqliteConnection,
        registry_id: &str,
    ) -> Result<bool> {
        let result = sqlx::query("DELETE FROM resolved_records WHERE registry_id = ?")
            .bind(registry_id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub(super) async fn is_resolved(
        conn: &mut SqliteConnection,
        registry_id: &str,
    ) -> Result<bool> {
        let found: Option<i64> =
            sqlx::query_scalar("SELECT 1 FROM resolved_records WHERE registry_id = ?")
                .bind(registry_id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(found.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{db, migrate};
    use tempfile::TempDir;

    async fn open() -> (TempDir, SqliteStore) {
        let dir = TempDir::new().unwrap();
        let pool = db::connect_path(&dir.path().join("data/harvester.sqlite"))
            .await
            .unwrap();
        migrate::apply(&pool).await.unwrap();
        (dir, SqliteStore::new(pool))
    }

    fn row(url: &str, registry_id: &str, last_seen_at: i64) -> HarvestedRecord {
        HarvestedRecord {
            source_url: url.to_string(),
            source_repository: RepositoryType::B2shareEudat,
            source_checksum: "c1".to_string(),
            registry_id: Some(registry_id.to_string()),
            registry_checksum: Some("m1".to_string()),
            status: RecordStatus::Success,
            title: Some("Title".to_string()),
            site_references: vec![harvester_core::dataset::SiteReference {
                site_id: "site-1".to_string(),
                site_name: Some("Site One".to_string()),
            }],
            habitat_references: Vec::new(),
            dataset_type: None,
            keywords: vec!["soil".to_string()],
            last_harvested_at: last_seen_at,
            last_seen_at,
        }
    }

    #[tokio::test]
    async fn test_rename_moves_primary_key() {
        let (_dir, store) = open().await;
        store.create_record(&row("old", "r1", 5)).await.unwrap();
        let mut renamed = row("new", "r1", 5);
        renamed.source_checksum = "c2".to_string();
        store.update_record("old", &renamed).await.unwrap();

        assert!(store.records_by_source_url("old").await.unwrap().is_empty());
        let rows = store.records_by_source_url("new").await.unwrap();
        assert_eq!(rows, vec![renamed]);
        assert!(store.update_record("old", &row("x", "r9", 0)).await.is_err());
    }

    #[tokio::test]
    async fn test_transaction_rollback_discards_writes() {
        let (_dir, store) = open().await;
        store.create_record(&row("keep", "r1", 5)).await.unwrap();

        let tx = store.begin().await.unwrap();
        tx.create_record(&row("temp", "r2", 5)).await.unwrap();
        tx.delete_record("keep").await.unwrap();
        assert_eq!(tx.records_by_source_url("temp").await.unwrap().len(), 1);
        assert!(store.records_by_source_url("temp").await.unwrap().is_empty());
        tx.rollback().await.unwrap();

        assert!(store.records_by_source_url("temp").await.unwrap().is_empty());
        assert_eq!(store.records_by_source_url("keep").await.unwrap().len(), 1);
        assert!(tx.commit().await.is_err());
    }

    #[tokio::test]
    async fn test_rule_stored_outside_survives_rollback() {
        let (_dir, store) = open().await;
        let tx = store.begin().await.unwrap();
        store
            .upsert_rule(
                "r9",
                &RuleDraft {
                    target_path: "metadata.language".to_string(),
                    before_value: serde_json::Value::Null,
                    after_value: serde_json::json!("en"),
                },
            )
            .await
            .unwrap();
        tx.create_record(&row("temp", "r2", 5)).await.unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(store.rules_for_record("r9").await.unwrap().len(), 1);
        assert!(store.records_by_source_url("temp").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_second_transaction_waits_for_the_first() {
        let (_dir, store) = open().await;
        let first = store.begin().await.unwrap();
        first.create_record(&row("a", "r1", 5)).await.unwrap();

        let waiting =
            tokio::time::timeout(std::time::Duration::from_millis(100), store.begin()).await;
        assert!(waiting.is_err());

        first.commit().await.unwrap();
        let second = store.begin().await.unwrap();
        second.create_record(&row("b", "r2", 5)).await.unwrap();
        second.commit().await.unwrap();
        assert_eq!(store.list_by_repository(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_delete_unseen_returns_registry_ids() {
        let (_dir, store) = open().await;
        store.create_record(&row("stale", "r1", 10)).await.unwrap();
        store.create_record(&row("ruled", "r2", 10)).await.unwrap();
        store.create_record(&row("fresh", "r3", 10_000)).await.unwrap();
        store
            .upsert_rule(
                "r2",
                &RuleDraft {
                    target_path: "metadata.language".to_string(),
                    before_value: serde_json::Value::Null,
                    after_value: serde_json::json!("en"),
                },
            )
            .await
            .unwrap();

        let deleted = store
            .delete_unseen(RepositoryType::B2shareEudat, 100)
            .await
            .unwrap();
        assert_eq!(deleted, vec!["r1".to_string()]);
        assert_eq!(store.list_by_repository(None).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_rules_and_resolved_markers() {
        let (_dir, store) = open().await;
        let draft = RuleDraft {
            target_path: "metadata.titles[0].titleText".to_string(),
            before_value: serde_json::json!("a"),
            after_value: serde_json::json!("b"),
        };
        let first = store.upsert_rule("r1", &draft).await.unwrap();
        let again = store
            .upsert_rule(
                "r1",
                &RuleDraft {
                    after_value: serde_json::json!("c"),
                    ..draft
                },
            )
            .await
            .unwrap();
        assert_eq!(first.id, again.id);
        assert_eq!(again.after_value, serde_json::json!("c"));

        assert!(!store.is_resolved("r1").await.unwrap());
        store.mark_resolved("r1", Some("ops")).await.unwrap();
        assert!(store.is_resolved("r1").await.unwrap());
        assert!(store.delete_resolved("r1").await.unwrap());
        assert!(!store.delete_resolved("r1").await.unwrap());
    }
}
