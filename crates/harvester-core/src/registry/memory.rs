//! In-memory [`Registry`] with write counters, for tests.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::RwLock;

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;

use crate::dataset::CanonicalDatasetRecord;
use crate::models::RepositoryType;

use super::Registry;

#[derive(Default)]
pub struct InMemoryRegistry {
    records: RwLock<BTreeMap<String, CanonicalDatasetRecord>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    fail_writes: AtomicBool,
}

impl InMemoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record without counting it as a write.
    pub fn insert(&self, registry_id: &str, record: CanonicalDatasetRecord) -> Result<()> {
        self.records
            .write()
            .map_err(|_| anyhow!("registry lock poisoned"))?
            .insert(registry_id.to_string(), record);
        Ok(())
    }

    pub fn get(&self, registry_id: &str) -> Option<CanonicalDatasetRecord> {
        self.records.read().ok()?.get(registry_id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records.read().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Make every subsequent create/update fail.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn creates(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn updates(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn deletes(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    /// Creates plus updates plus deletes.
    pub fn writes(&self) -> usize {
        self.creates() + self.updates() + self.deletes()
    }
}

#[async_trait]
impl Registry for InMemoryRegistry {
    async fn find_by_source_url(&self, source_url: &str) -> Result<Option<String>> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("registry lock poisoned"))?;
        Ok(records
            .iter()
            .find(|(_, record)| record.external_source_uri() == Some(source_url))
            .map(|(id, _)| id.clone()))
    }

    async fn create(&self, record: &CanonicalDatasetRecord) -> Result<String> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("registry rejected create");
        }
        let id = format!("reg-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.insert(&id, record.clone())?;
        self.creates.fetch_add(1, Ordering::SeqCst);
        Ok(id)
    }

    async fn update(&self, registry_id: &str, record: &CanonicalDatasetRecord) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            bail!("registry rejected update of {}", registry_id);
        }
        self.insert(registry_id, record.clone())?;
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete(&self, registry_ids: &[String]) -> Result<Vec<String>> {
        let mut records = self
            .records
            .write()
            .map_err(|_| anyhow!("registry lock poisoned"))?;
        let mut failed = Vec::new();
        for id in registry_ids {
            if records.remove(id).is_some() {
                self.deletes.fetch_add(1, Ordering::SeqCst);
            } else {
                failed.push(id.clone());
            }
        }
        Ok(failed)
    }

    async fn list_by_repository(&self, repository: RepositoryType) -> Result<Vec<String>> {
        let records = self
            .records
            .read()
            .map_err(|_| anyhow!("registry lock poisoned"))?;
        let name = repository.external_source_name();
        Ok(records
            .iter()
            .filter(|(_, record)| {
                record
                    .metadata
                    .external_source_information
                    .external_source_name
                    .as_deref()
                    == Some(name)
            })
            .map(|(id, _)| id.clone())
            .collect())
    }
}
