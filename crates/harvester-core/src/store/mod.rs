//! Storage abstraction for harvested records.
//!
//! [`RecordStore`] is the CRUD contract the reconciliation engine relies on.
//! [`Store`] is the shared, process-wide handle: every call on it stands
//! alone. [`Store::begin`] hands out a run-scoped [`StoreTransaction`] that
//! only its owner writes through, so concurrent runs and operator calls never
//! join each other's transaction.
//!
//! A SQLite implementation lives in the native crate; [`memory`] provides an
//! in-memory one for tests and embedders.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::models::{HarvestedRecord, OverrideRule, RecordStatus, RepositoryType, RuleDraft};

/// Durable storage for harvested rows, override rules and resolved markers.
///
/// Implementations must be `Send + Sync`: record tasks of one run share a
/// single transaction concurrently.
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// All rows stored under `source_url`. More than one is a consistency violation.
    async fn records_by_source_url(&self, source_url: &str) -> Result<Vec<HarvestedRecord>>;

    async fn record_by_registry_id(&self, registry_id: &str) -> Result<Option<HarvestedRecord>>;

    /// Rows for one repository, or every row when `None`.
    async fn list_by_repository(&self, repository: Option<RepositoryType>) -> Result<Vec<HarvestedRecord>>;

    async fn list_registry_ids(&self, repository: RepositoryType) -> Result<Vec<String>>;

    /// Insert a row, replacing any row with the same source URL.
    async fn create_record(&self, record: &HarvestedRecord) -> Result<()>;

    /// Overwrite the row stored at `current_url`. When `record.source_url`
    /// differs this renames the primary key.
    async fn update_record(&self, current_url: &str, record: &HarvestedRecord) -> Result<()>;

    /// Set the status. `Success` also refreshes `last_seen_at`.
    async fn set_status(&self, source_url: &str, status: RecordStatus) -> Result<()>;

    async fn mark_seen(&self, source_url: &str) -> Result<()>;

    /// Flag every row of a repository `in_progress`. Returns the row count.
    async fn mark_repository_in_progress(&self, repository: RepositoryType) -> Result<u64>;

    async fn delete_record(&self, source_url: &str) -> Result<()>;

    /// Delete rows of `repository` last seen before `cutoff` (Unix seconds)
    /// that carry a registry id, no rules and no resolved marker.
    /// Returns the registry ids of the deleted rows.
    async fn delete_unseen(&self, repository: RepositoryType, cutoff: i64) -> Result<Vec<String>>;

    /// Rules for a registry id, in stored order.
    async fn rules_for_record(&self, registry_id: &str) -> Result<Vec<OverrideRule>>;

    /// Insert or replace the rule keyed by `(registry_id, target_path)`.
    async fn upsert_rule(&self, registry_id: &str, draft: &RuleDraft) -> Result<OverrideRule>;

    /// Returns `false` when no such rule existed.
    async fn delete_rule(&self, registry_id: &str, rule_id: i64) -> Result<bool>;

    async fn mark_resolved(&self, registry_id: &str, resolved_by: Option<&str>) -> Result<()>;

    /// Returns `false` when the record was not resolved.
    async fn delete_resolved(&self, registry_id: &str) -> Result<bool>;

    async fn is_resolved(&self, registry_id: &str) -> Result<bool>;
}

/// The shared store. Calls on it commit on their own.
#[async_trait]
pub trait Store: RecordStore {
    /// Open a transaction owned by the caller. Writes made through it are
    /// invisible to the shared store until [`StoreTransaction::commit`].
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>>;
}

/// A run-scoped transaction. Finishing it twice is an error.
#[async_trait]
pub trait StoreTransaction: RecordStore {
    async fn commit(&self) -> Result<()>;
    async fn rollback(&self) -> Result<()>;
}
