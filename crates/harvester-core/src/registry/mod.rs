//! Contract for the external asset registry.
//!
//! The registry is the system of record downstream consumers query. The
//! engine only needs lookup by source URL, create, update, bulk delete and a
//! per-repository id listing.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::dataset::CanonicalDatasetRecord;
use crate::models::RepositoryType;

#[async_trait]
pub trait Registry: Send + Sync {
    /// Registry id of the record whose external source URI equals `source_url`.
    async fn find_by_source_url(&self, source_url: &str) -> Result<Option<String>>;

    /// Create a record, returning its new registry id.
    async fn create(&self, record: &CanonicalDatasetRecord) -> Result<String>;

    async fn update(&self, registry_id: &str, record: &CanonicalDatasetRecord) -> Result<()>;

    /// Delete each id independently. Returns the ids that could not be deleted.
    async fn delete(&self, registry_ids: &[String]) -> Result<Vec<String>>;

    /// Every registry id belonging to `repository`, across all pages.
    async fn list_by_repository(&self, repository: RepositoryType) -> Result<Vec<String>>;
}
