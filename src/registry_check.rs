//! Compare local registry ids with the registry's own listing.
//!
//! Registry writes are at-least-once, so the registry can end up holding
//! records the local store no longer knows about. This check reports both
//! directions and can delete the remote extras.

use std::collections::BTreeSet;

use anyhow::{Context, Result};
use harvester_core::models::RepositoryType;
use harvester_core::registry::Registry;
use harvester_core::store::{RecordStore, Store};
use serde::Serialize;
use tracing::{info, warn};

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RegistryCheck {
    /// In the registry, unknown locally.
    pub extra_on_remote: Vec<String>,
    /// Stored locally, missing from the registry.
    pub extra_in_local: Vec<String>,
    /// Remote extras that were deleted, when cleanup was requested.
    pub deleted: Vec<String>,
}

pub async fn check_registry(
    store: &dyn Store,
    registry: &dyn Registry,
    repository: RepositoryType,
    cleanup: bool,
) -> Result<RegistryCheck> {
    let remote = registry
        .list_by_repository(repository)
        .await
        .with_context(|| format!("failed to list registry records for {}", repository))?;
    info!(repository = %repository, records = remote.len(), "registry listing fetched");
    let local = store.list_registry_ids(repository).await?;

    let remote_set: BTreeSet<&String> = remote.iter().collect();
    let local_set: BTreeSet<&String> = local.iter().collect();

    let extra_on_remote: Vec<String> = remote
        .iter()
        .filter(|id| !local_set.contains(id))
        .cloned()
        .collect();
    let extra_in_local: Vec<String> = local
        .iter()
        .filter(|id| !remote_set.contains(id))
        .cloned()
        .collect();
    warn!(repository = %repository, ids = ?extra_on_remote, "extra on remote");
    warn!(repository = %repository, ids = ?extra_in_local, "extra in local");

    let mut deleted = Vec::new();
    if cleanup && !extra_on_remote.is_empty() {
        warn!(repository = %repository, records = extra_on_remote.len(), "deleting extra registry records");
        let failed = registry.delete(&extra_on_remote).await?;
        deleted = extra_on_remote
            .iter()
            .filter(|id| !failed.contains(id))
            .cloned()
            .collect();
    }

    Ok(RegistryCheck {
        extra_on_remote,
        extra_in_local,
        deleted,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_core::dataset::CanonicalDatasetRecord;
    use harvester_core::models::{HarvestedRecord, RecordStatus};
    use harvester_core::registry::memory::InMemoryRegistry;
    use harvester_core::store::memory::InMemoryStore;

    fn remote(name: &str) -> CanonicalDatasetRecord {
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "assetType": "Dataset",
                "externalSourceInformation": { "externalSourceName": name }
            }
        }))
        .unwrap()
    }

    fn local(url: &str, registry_id: &str) -> HarvestedRecord {
        HarvestedRecord {
            source_url: url.to_string(),
            source_repository: RepositoryType::Zenodo,
            source_checksum: "c".to_string(),
            registry_id: Some(registry_id.to_string()),
            registry_checksum: None,
            status: RecordStatus::Success,
            title: None,
            site_references: Vec::new(),
            habitat_references: Vec::new(),
            dataset_type: None,
            keywords: Vec::new(),
            last_harvested_at: 0,
            last_seen_at: 0,
        }
    }

    async fn fixture() -> (InMemoryStore, InMemoryRegistry) {
        let store = InMemoryStore::new();
        store.create_record(&local("https://z/1", "a")).await.unwrap();
        store.create_record(&local("https://z/2", "b")).await.unwrap();
        let registry = InMemoryRegistry::new();
        registry.insert("a", remote("Zenodo")).unwrap();
        registry.insert("x", remote("Zenodo")).unwrap();
        registry.insert("y", remote("FieldSites")).unwrap();
        (store, registry)
    }

    #[tokio::test]
    async fn test_reports_both_directions() {
        let (store, registry) = fixture().await;
        let check = check_registry(&store, &registry, RepositoryType::Zenodo, false)
            .await
            .unwrap();
        assert_eq!(check.extra_on_remote, vec!["x"]);
        assert_eq!(check.extra_in_local, vec!["b"]);
        assert!(check.deleted.is_empty());
        assert_eq!(registry.len(), 3);
    }

    #[tokio::test]
    async fn test_cleanup_deletes_remote_extras_only() {
        let (store, registry) = fixture().await;
        let check = check_registry(&store, &registry, RepositoryType::Zenodo, true)
            .await
            .unwrap();
        assert_eq!(check.deleted, vec!["x"]);
        assert!(registry.get("x").is_none());
        assert!(registry.get("a").is_some());
        assert!(registry.get("y").is_some());
    }
}
