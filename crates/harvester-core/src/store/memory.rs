//! In-memory [`Store`] implementation for tests and embedders.
//!
//! State lives behind `std::sync::RwLock`. Rows are kept in a `Vec` rather
//! than a map keyed by URL so that tests can seed duplicate rows and observe
//! the engine's consistency check.
//!
//! A transaction works on a private copy of the state and journals every
//! change it makes. Commit replays the journal onto the shared state, so
//! writes made outside the transaction in the meantime survive it.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;

use crate::models::{
    HarvestedRecord, OverrideRule, RecordStatus, RepositoryType, ResolvedMarker, RuleDraft,
};

use super::{RecordStore, Store, StoreTransaction};

#[derive(Debug, Clone, Default)]
struct State {
    records: Vec<HarvestedRecord>,
    rules: Vec<OverrideRule>,
    resolved: Vec<ResolvedMarker>,
    next_rule_id: i64,
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

impl State {
    fn records_by_source_url(&self, source_url: &str) -> Vec<HarvestedRecord> {
        self.records
            .iter()
            .filter(|r| r.source_url == source_url)
            .cloned()
            .collect()
    }

    fn record_by_registry_id(&self, registry_id: &str) -> Option<HarvestedRecord> {
        self.records
            .iter()
            .find(|r| r.registry_id.as_deref() == Some(registry_id))
            .cloned()
    }

    fn list_by_repository(&self, repository: Option<RepositoryType>) -> Vec<HarvestedRecord> {
        let mut rows: Vec<HarvestedRecord> = self
            .records
            .iter()
            .filter(|r| repository.map_or(true, |repo| r.source_repository == repo))
            .cloned()
            .collect();
        rows.sort_by(|a, b| a.source_url.cmp(&b.source_url));
        rows
    }

    fn list_registry_ids(&self, repository: RepositoryType) -> Vec<String> {
        self.records
            .iter()
            .filter(|r| r.source_repository == repository)
            .filter_map(|r| r.registry_id.clone())
            .collect()
    }

    fn rules_for_record(&self, registry_id: &str) -> Vec<OverrideRule> {
        self.rules
            .iter()
            .filter(|r| r.registry_id == registry_id)
            .cloned()
            .collect()
    }

    fn is_resolved(&self, registry_id: &str) -> bool {
        self.resolved.iter().any(|m| m.registry_id == registry_id)
    }

    fn create_record(&mut self, record: &HarvestedRecord) {
        match self
            .records
            .iter_mut()
            .find(|r| r.source_url == record.source_url)
        {
            Some(existing) => *existing = record.clone(),
            None => self.records.push(record.clone()),
        }
    }

    fn update_record(&mut self, current_url: &str, record: &HarvestedRecord) -> Result<()> {
        if record.source_url != current_url
            && self.records.iter().any(|r| r.source_url == record.source_url)
        {
            bail!(
                "cannot rename {} to {}: target url already stored",
                current_url,
                record.source_url
            );
        }
        let row = self
            .records
            .iter_mut()
            .find(|r| r.source_url == current_url)
            .ok_or_else(|| anyhow!("no record stored at {}", current_url))?;
        *row = record.clone();
        Ok(())
    }

    fn set_status(&mut self, source_url: &str, status: RecordStatus, at: i64) {
        for row in self.records.iter_mut().filter(|r| r.source_url == source_url) {
            row.status = status;
            if status == RecordStatus::Success {
                row.last_seen_at = at;
            }
        }
    }

    fn set_last_seen(&mut self, source_url: &str, at: i64) {
        for row in self.records.iter_mut().filter(|r| r.source_url == source_url) {
            row.last_seen_at = at;
        }
    }

    fn mark_repository_in_progress(&mut self, repository: RepositoryType) -> u64 {
        let mut count = 0;
        for row in self
            .records
            .iter_mut()
            .filter(|r| r.source_repository == repository)
        {
            row.status = RecordStatus::InProgress;
            count += 1;
        }
        count
    }

    fn delete_record(&mut self, source_url: &str) {
        self.records.retain(|r| r.source_url != source_url);
    }

    fn delete_unseen(&mut self, repository: RepositoryType, cutoff: i64) -> Vec<String> {
        let State {
            records,
            rules,
            resolved,
            ..
        } = self;
        let mut deleted = Vec::new();
        records.retain(|r| {
            let Some(id) = r.registry_id.as_deref() else {
                return true;
            };
            let stale = r.source_repository == repository && r.last_seen_at < cutoff;
            let has_rules = rules.iter().any(|rule| rule.registry_id == id);
            let is_resolved = resolved.iter().any(|m| m.registry_id == id);
            if stale && !has_rules && !is_resolved {
                deleted.push(id.to_string());
                false
            } else {
                true
            }
        });
        deleted
    }

    fn upsert_rule(&mut self, registry_id: &str, draft: &RuleDraft) -> OverrideRule {
        if let Some(rule) = self
            .rules
            .iter_mut()
            .find(|r| r.registry_id == registry_id && r.target_path == draft.target_path)
        {
            rule.before_value = draft.before_value.clone();
            rule.after_value = draft.after_value.clone();
            return rule.clone();
        }
        self.next_rule_id += 1;
        let rule = OverrideRule {
            id: self.next_rule_id,
            registry_id: registry_id.to_string(),
            target_path: draft.target_path.clone(),
            before_value: draft.before_value.clone(),
            after_value: draft.after_value.clone(),
        };
        self.rules.push(rule.clone());
        rule
    }

    fn delete_rule(&mut self, registry_id: &str, rule_id: i64) -> bool {
        let before = self.rules.len();
        self.rules
            .retain(|r| !(r.registry_id == registry_id && r.id == rule_id));
        self.rules.len() < before
    }

    fn mark_resolved(&mut self, registry_id: &str, resolved_by: Option<&str>, at: i64) {
        self.resolved.retain(|m| m.registry_id != registry_id);
        self.resolved.push(ResolvedMarker {
            registry_id: registry_id.to_string(),
            resolved_by: resolved_by.map(str::to_string),
            resolved_at: at,
        });
    }

    fn delete_resolved(&mut self, registry_id: &str) -> bool {
        let before = self.resolved.len();
        self.resolved.retain(|m| m.registry_id != registry_id);
        self.resolved.len() < before
    }
}

/// One journaled write, replayed onto the shared state at commit.
#[derive(Debug, Clone)]
enum Change {
    Create(HarvestedRecord),
    Update {
        current_url: String,
        record: HarvestedRecord,
    },
    Status {
        source_url: String,
        status: RecordStatus,
        at: i64,
    },
    Seen {
        source_url: String,
        at: i64,
    },
    InProgress(RepositoryType),
    Delete(String),
    DeleteUnseen {
        repository: RepositoryType,
        cutoff: i64,
    },
    UpsertRule {
        registry_id: String,
        draft: RuleDraft,
    },
    DeleteRule {
        registry_id: String,
        rule_id: i64,
    },
    Resolve {
        registry_id: String,
        resolved_by: Option<String>,
        at: i64,
    },
    Unresolve(String),
}

impl Change {
    fn replay(&self, state: &mut State) -> Result<()> {
        match self {
            Change::Create(record) => state.create_record(record),
            Change::Update {
                current_url,
                record,
            } => state.update_record(current_url, record)?,
            Change::Status {
                source_url,
                status,
                at,
            } => state.set_status(source_url, *status, *at),
            Change::Seen { source_url, at } => state.set_last_seen(source_url, *at),
            Change::InProgress(repository) => {
                state.mark_repository_in_progress(*repository);
            }
            Change::Delete(source_url) => state.delete_record(source_url),
            Change::DeleteUnseen { repository, cutoff } => {
                state.delete_unseen(*repository, *cutoff);
            }
            Change::UpsertRule { registry_id, draft } => {
                state.upsert_rule(registry_id, draft);
            }
            Change::DeleteRule {
                registry_id,
                rule_id,
            } => {
                state.delete_rule(registry_id, *rule_id);
            }
            Change::Resolve {
                registry_id,
                resolved_by,
                at,
            } => state.mark_resolved(registry_id, resolved_by.as_deref(), *at),
            Change::Unresolve(registry_id) => {
                state.delete_resolved(registry_id);
            }
        }
        Ok(())
    }
}

/// In-memory store.
#[derive(Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
    open: Arc<AtomicUsize>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|_| anyhow!("store lock poisoned"))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|_| anyhow!("store lock poisoned"))
    }

    /// Push a row without the primary-key check.
    pub fn insert_raw(&self, record: HarvestedRecord) -> Result<()> {
        self.write()?.records.push(record);
        Ok(())
    }

    /// Overwrite `last_seen_at` of every row stored at `source_url`.
    pub fn set_last_seen(&self, source_url: &str, last_seen_at: i64) -> Result<()> {
        self.write()?.set_last_seen(source_url, last_seen_at);
        Ok(())
    }

    /// Transactions begun on this store and not yet finished.
    pub fn open_transactions(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn records_by_source_url(&self, source_url: &str) -> Result<Vec<HarvestedRecord>> {
        Ok(self.read()?.records_by_source_url(source_url))
    }

    async fn record_by_registry_id(&self, registry_id: &str) -> Result<Option<HarvestedRecord>> {
        Ok(self.read()?.record_by_registry_id(registry_id))
    }

    async fn list_by_repository(
        &self,
        repository: Option<RepositoryType>,
    ) -> Result<Vec<HarvestedRecord>> {
        Ok(self.read()?.list_by_repository(repository))
    }

    async fn list_registry_ids(&self, repository: RepositoryType) -> Result<Vec<String>> {
        Ok(self.read()?.list_registry_ids(repository))
    }

    async fn create_record(&self, record: &HarvestedRecord) -> Result<()> {
        self.write()?.create_record(record);
        Ok(())
    }

    async fn update_record(&self, current_url: &str, record: &HarvestedRecord) -> Result<()> {
        self.write()?.update_record(current_url, record)
    }

    async fn set_status(&self, source_url: &str, status: RecordStatus) -> Result<()> {
        self.write()?.set_status(source_url, status, now());
        Ok(())
    }

    async fn mark_seen(&self, source_url: &str) -> Result<()> {
        self.set_last_seen(source_url, now())
    }

    async fn mark_repository_in_progress(&self, repository: RepositoryType) -> Result<u64> {
        Ok(self.write()?.mark_repository_in_progress(repository))
    }

    async fn delete_record(&self, source_url: &str) -> Result<()> {
        self.write()?.delete_record(source_url);
        Ok(())
    }

    async fn delete_unseen(&self, repository: RepositoryType, cutoff: i64) -> Result<Vec<String>> {
        Ok(self.write()?.delete_unseen(repository, cutoff))
    }

    async fn rules_for_record(&self, registry_id: &str) -> Result<Vec<OverrideRule>> {
        Ok(self.read()?.rules_for_record(registry_id))
    }

    async fn upsert_rule(&self, registry_id: &str, draft: &RuleDraft) -> Result<OverrideRule> {
        Ok(self.write()?.upsert_rule(registry_id, draft))
    }

    async fn delete_rule(&self, registry_id: &str, rule_id: i64) -> Result<bool> {
        Ok(self.write()?.delete_rule(registry_id, rule_id))
    }

    async fn mark_resolved(&self, registry_id: &str, resolved_by: Option<&str>) -> Result<()> {
        self.write()?.mark_resolved(registry_id, resolved_by, now());
        Ok(())
    }

    async fn delete_resolved(&self, registry_id: &str) -> Result<bool> {
        Ok(self.write()?.delete_resolved(registry_id))
    }

    async fn is_resolved(&self, registry_id: &str) -> Result<bool> {
        Ok(self.read()?.is_resolved(registry_id))
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
        let working = self.read()?.clone();
        self.open.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(InMemoryTransaction {
            shared: Arc::clone(&self.state),
            open: Arc::clone(&self.open),
            working: Mutex::new(Some(Working {
                state: working,
                journal: Vec::new(),
            })),
        }))
    }
}

struct Working {
    state: State,
    journal: Vec<Change>,
}

/// A transaction over an [`InMemoryStore`].
pub struct InMemoryTransaction {
    shared: Arc<RwLock<State>>,
    open: Arc<AtomicUsize>,
    working: Mutex<Option<Working>>,
}

impl InMemoryTransaction {
    fn read<T>(&self, f: impl FnOnce(&State) -> T) -> Result<T> {
        let guard = self
            .working
            .lock()
            .map_err(|_| anyhow!("transaction lock poisoned"))?;
        let working = guard
            .as_ref()
            .ok_or_else(|| anyhow!("transaction already finished"))?;
        Ok(f(&working.state))
    }

    /// Apply `change` to the private copy and journal it.
    fn write<T>(&self, change: Change, f: impl FnOnce(&mut State) -> Result<T>) -> Result<T> {
        let mut guard = self
            .working
            .lock()
            .map_err(|_| anyhow!("transaction lock poisoned"))?;
        let working = guard
            .as_mut()
            .ok_or_else(|| anyhow!("transaction already finished"))?;
        let out = f(&mut working.state)?;
        working.journal.push(change);
        Ok(out)
    }

    fn finish(&self) -> Result<Working> {
        let working = self
            .working
            .lock()
            .map_err(|_| anyhow!("transaction lock poisoned"))?
            .take()
            .ok_or_else(|| anyhow!("transaction already finished"))?;
        self.open.fetch_sub(1, Ordering::SeqCst);
        Ok(working)
    }
}

impl Drop for InMemoryTransaction {
    fn drop(&mut self) {
        if let Ok(working) = self.working.get_mut() {
            if working.take().is_some() {
                self.open.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

#[async_trait]
impl RecordStore for InMemoryTransaction {
    async fn records_by_source_url(&self, source_url: &str) -> Result<Vec<HarvestedRecord>> {
        self.read(|s| s.records_by_source_url(source_url))
    }

    async fn record_by_registry_id(&self, registry_id: &str) -> Result<Option<HarvestedRecord>> {
        self.read(|s| s.record_by_registry_id(registry_id))
    }

    async fn list_by_repository(
        &self,
        repository: Option<RepositoryType>,
    ) -> Result<Vec<HarvestedRecord>> {
        self.read(|s| s.list_by_repository(repository))
    }

    async fn list_registry_ids(&self, repository: RepositoryType) -> Result<Vec<String>> {
        self.read(|s| s.list_registry_ids(repository))
    }

    async fn create_record(&self, record: &HarvestedRecord) -> Result<()> {
        self.write(Change::Create(record.clone()), |s| {
            s.create_record(record);
            Ok(())
        })
    }

    async fn update_record(&self, current_url: &str, record: &HarvestedRecord) -> Result<()> {
        let change = Change::Update {
            current_url: current_url.to_string(),
            record: record.clone(),
        };
        self.write(change, |s| s.update_record(current_url, record))
    }

    async fn set_status(&self, source_url: &str, status: RecordStatus) -> Result<()> {
        let at = now();
        let change = Change::Status {
            source_url: source_url.to_string(),
            status,
            at,
        };
        self.write(change, |s| {
            s.set_status(source_url, status, at);
            Ok(())
        })
    }

    async fn mark_seen(&self, source_url: &str) -> Result<()> {
        let at = now();
        let change = Change::Seen {
            source_url: source_url.to_string(),
            at,
        };
        self.write(change, |s| {
            s.set_last_seen(source_url, at);
            Ok(())
        })
    }

    async fn mark_repository_in_progress(&self, repository: RepositoryType) -> Result<u64> {
        self.write(Change::InProgress(repository), |s| {
            Ok(s.mark_repository_in_progress(repository))
        })
    }

    async fn delete_record(&self, source_url: &str) -> Result<()> {
        self.write(Change::Delete(source_url.to_string()), |s| {
            s.delete_record(source_url);
            Ok(())
        })
    }

    async fn delete_unseen(&self, repository: RepositoryType, cutoff: i64) -> Result<Vec<String>> {
        self.write(Change::DeleteUnseen { repository, cutoff }, |s| {
            Ok(s.delete_unseen(repository, cutoff))
        })
    }

    async fn rules_for_record(&self, registry_id: &str) -> Result<Vec<OverrideRule>> {
        self.read(|s| s.rules_for_record(registry_id))
    }

    async fn upsert_rule(&self, registry_id: &str, draft: &RuleDraft) -> Result<OverrideRule> {
        let change = Change::UpsertRule {
            registry_id: registry_id.to_string(),
            draft: draft.clone(),
        };
        self.write(change, |s| Ok(s.upsert_rule(registry_id, draft)))
    }

    async fn delete_rule(&self, registry_id: &str, rule_id: i64) -> Result<bool> {
        let change = Change::DeleteRule {
            registry_id: registry_id.to_string(),
            rule_id,
        };
        self.write(change, |s| Ok(s.delete_rule(registry_id, rule_id)))
    }

    async fn mark_resolved(&self, registry_id: &str, resolved_by: Option<&str>) -> Result<()> {
        let at = now();
        let change = Change::Resolve {
            registry_id: registry_id.to_string(),
            resolved_by: resolved_by.map(str::to_string),
            at,
        };
        self.write(change, |s| {
            s.mark_resolved(registry_id, resolved_by, at);
            Ok(())
        })
    }

    async fn delete_resolved(&self, registry_id: &str) -> Result<bool> {
        self.write(Change::Unresolve(registry_id.to_string()), |s| {
            Ok(s.delete_resolved(registry_id))
        })
    }

    async fn is_resolved(&self, registry_id: &str) -> Result<bool> {
        self.read(|s| s.is_resolved(registry_id))
    }
}

#[async_trait]
impl StoreTransaction for InMemoryTransaction {
    async fn commit(&self) -> Result<()> {
        let working = self.finish()?;
        let mut shared = self
            .shared
            .write()
            .map_err(|_| anyhow!("store lock poisoned"))?;
        let mut merged = shared.clone();
        for change in &working.journal {
            change
                .replay(&mut merged)
                .context("transaction conflicts with a concurrent write")?;
        }
        *shared = merged;
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.finish().map(drop)
    }
}
