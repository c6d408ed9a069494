//! Reconciliation engine.
//!
//! One [`HarvestContext`] drives one run for one repository. A repository
//! run has three phases that each finish before the next starts:
//!
//! 1. **Local validation**: every stored row of the repository is marked
//!    `in_progress` and re-reconciled against its upstream.
//! 2. **Remote crawl**: the listing API (or sitemap) is walked and every
//!    record found is reconciled.
//! 3. **Cleanup**: rows unseen for longer than the threshold, with no rules
//!    and no resolved marker, are deleted locally and in the registry.
//!
//! All three phases share one store transaction owned by the run; other
//! runs and operator calls on the shared store never see or join it.
//! Per-record problems
//! (upstream unavailable, registry write rejected, unmappable payload) are
//! logged and counted; anything else a record task returns, a
//! [`HarvestError::Consistency`] above all, rolls the whole run back.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use harvester_core::checksum::checksum;
use harvester_core::dataset::CanonicalDatasetRecord;
use harvester_core::error::{self, HarvestError};
use harvester_core::models::{HarvestedRecord, RecordStatus, RepositoryType};
use harvester_core::registry::Registry;
use harvester_core::rules::apply_all_rules_for_record;
use harvester_core::skip::{skip_after_fetch, skip_without_fetch};
use harvester_core::store::{RecordStore, Store, StoreTransaction};
use serde::Serialize;
use serde_json::Value;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::RepositoryConfig;
use crate::crawl;
use crate::fetch::Fetcher;
use crate::mapper::Mapper;
use crate::payload::{nested, SourcePayload};
use crate::sites::SiteCatalogue;
use crate::version::resolve_latest_version;

/// What happened to one record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// Settled row, nothing fetched or written.
    Skipped,
    /// Upstream could not be fetched this pass; row left as it was.
    Unavailable,
    Created,
    Updated,
    /// Moved from an older version's URL to the latest one.
    Migrated,
    Unchanged,
    Failed,
}

/// Counts of record outcomes for one run.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: u64,
    pub updated: u64,
    pub migrated: u64,
    pub unchanged: u64,
    pub skipped: u64,
    pub unavailable: u64,
    pub failed: u64,
    /// Rows removed by cleanup.
    pub deleted: u64,
}

impl SyncReport {
    pub fn processed(&self) -> u64 {
        self.created
            + self.updated
            + self.migrated
            + self.unchanged
            + self.skipped
            + self.unavailable
            + self.failed
    }
}

impl std::fmt::Display for SyncReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "created {}, updated {}, migrated {}, unchanged {}, skipped {}, unavailable {}, failed {}, deleted {}",
            self.created,
            self.updated,
            self.migrated,
            self.unchanged,
            self.skipped,
            self.unavailable,
            self.failed,
            self.deleted
        )
    }
}

#[derive(Debug, Default)]
struct Counters {
    created: AtomicU64,
    updated: AtomicU64,
    migrated: AtomicU64,
    unchanged: AtomicU64,
    skipped: AtomicU64,
    unavailable: AtomicU64,
    failed: AtomicU64,
    deleted: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: RecordOutcome) {
        let counter = match outcome {
            RecordOutcome::Skipped => &self.skipped,
            RecordOutcome::Unavailable => &self.unavailable,
            RecordOutcome::Created => &self.created,
            RecordOutcome::Updated => &self.updated,
            RecordOutcome::Migrated => &self.migrated,
            RecordOutcome::Unchanged => &self.unchanged,
            RecordOutcome::Failed => &self.failed,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> SyncReport {
        SyncReport {
            created: self.created.load(Ordering::Relaxed),
            updated: self.updated.load(Ordering::Relaxed),
            migrated: self.migrated.load(Ordering::Relaxed),
            unchanged: self.unchanged.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            unavailable: self.unavailable.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            deleted: self.deleted.load(Ordering::Relaxed),
        }
    }
}

fn now() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Everything one run needs. Shared by its record tasks behind an `Arc`.
pub struct HarvestContext {
    store: Arc<dyn Store>,
    registry: Arc<dyn Registry>,
    fetcher: Arc<dyn Fetcher>,
    mapper: Arc<dyn Mapper>,
    sites: Arc<SiteCatalogue>,
    repository: RepositoryType,
    repo_config: RepositoryConfig,
    must_verify: bool,
    cleanup_days: u32,
    counters: Counters,
    /// The open run's transaction. Every engine read and write goes here.
    tx: Mutex<Option<Arc<dyn StoreTransaction>>>,
}

impl HarvestContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        registry: Arc<dyn Registry>,
        fetcher: Arc<dyn Fetcher>,
        mapper: Arc<dyn Mapper>,
        sites: Arc<SiteCatalogue>,
        repository: RepositoryType,
        repo_config: RepositoryConfig,
        must_verify: bool,
        cleanup_days: u32,
    ) -> Self {
        Self {
            store,
            registry,
            fetcher,
            mapper,
            sites,
            repository,
            repo_config,
            must_verify,
            cleanup_days,
            counters: Counters::default(),
            tx: Mutex::new(None),
        }
    }

    pub fn repository(&self) -> RepositoryType {
        self.repository
    }

    pub fn report(&self) -> SyncReport {
        self.counters.snapshot()
    }

    fn slot(&self) -> Result<MutexGuard<'_, Option<Arc<dyn StoreTransaction>>>> {
        self.tx.lock().map_err(|_| anyhow!("run lock poisoned"))
    }

    fn tx(&self) -> Result<Arc<dyn StoreTransaction>> {
        self.slot()?
            .clone()
            .ok_or_else(|| anyhow!("no run in progress"))
    }

    /// The single row stored at `source_url`, failing on duplicates.
    async fn unique_row(&self, source_url: &str) -> Result<Option<HarvestedRecord>> {
        let mut rows = self.tx()?.records_by_source_url(source_url).await?;
        if rows.len() > 1 {
            return Err(HarvestError::Consistency {
                source_url: source_url.to_string(),
                rows: rows.len(),
            }
            .into());
        }
        Ok(rows.pop())
    }

    async fn rule_count(&self, row: Option<&HarvestedRecord>) -> Result<usize> {
        match row.and_then(|r| r.registry_id.as_deref()) {
            Some(registry_id) => Ok(self.tx()?.rules_for_record(registry_id).await?.len()),
            None => Ok(0),
        }
    }

    /// Mark an existing row failed after a soft failure. Checksums stay as
    /// they were so the next pass retries the record. Every caller has just
    /// fetched the record, so the row also counts as seen.
    async fn fail_row(&self, row: Option<&HarvestedRecord>) -> Result<RecordOutcome> {
        if let Some(row) = row {
            let tx = self.tx()?;
            tx.set_status(&row.source_url, RecordStatus::Failed).await?;
            tx.mark_seen(&row.source_url).await?;
        }
        Ok(RecordOutcome::Failed)
    }

    /// Reconcile one record.
    pub async fn process_one_record(&self, source_url: &str) -> Result<RecordOutcome> {
        let mut existing = self.unique_row(source_url).await?;
        let mut rule_count = self.rule_count(existing.as_ref()).await?;

        if skip_without_fetch(existing.as_ref(), rule_count, self.must_verify) {
            debug!(url = source_url, "settled, skipping");
            self.tx()?.mark_seen(source_url).await?;
            return Ok(RecordOutcome::Skipped);
        }

        let Some(raw) = self.fetcher.fetch_json(source_url).await else {
            warn!(url = source_url, "record unavailable this pass");
            return Ok(RecordOutcome::Unavailable);
        };
        let source_checksum = checksum(&raw)?;

        if skip_after_fetch(existing.as_ref(), rule_count, self.must_verify, &source_checksum) {
            debug!(url = source_url, "source unchanged, skipping");
            self.tx()?.mark_seen(source_url).await?;
            return Ok(RecordOutcome::Skipped);
        }

        let mut record = match self.map_record(source_url, raw).await {
            Ok(record) => record,
            Err(e) => {
                warn!(url = source_url, error = %e, "could not map record");
                return self.fail_row(existing.as_ref()).await;
            }
        };

        let effective_url = record
            .external_source_uri()
            .unwrap_or(source_url)
            .to_string();
        if effective_url != source_url {
            info!(from = source_url, to = %effective_url, "record resolves to a different url");
            if let Some(row) = self.unique_row(&effective_url).await? {
                rule_count = self.rule_count(Some(&row)).await?;
                existing = Some(row);
                let settled = skip_without_fetch(existing.as_ref(), rule_count, self.must_verify)
                    || skip_after_fetch(
                        existing.as_ref(),
                        rule_count,
                        self.must_verify,
                        &source_checksum,
                    );
                if settled {
                    self.tx()?.mark_seen(&effective_url).await?;
                    return Ok(RecordOutcome::Skipped);
                }
            }
        }

        if let Some(registry_id) = existing.as_ref().and_then(|r| r.registry_id.as_deref()) {
            let tx = self.tx()?;
            apply_all_rules_for_record(tx.as_ref(), &mut record, registry_id).await?;
        }

        self.synchronize_record(
            &effective_url,
            source_url,
            &source_checksum,
            &record,
            existing.as_ref(),
        )
        .await
    }

    /// Resolve to the latest version, match sites and map.
    async fn map_record(&self, source_url: &str, raw: Value) -> Result<CanonicalDatasetRecord> {
        let resolution =
            resolve_latest_version(self.fetcher.as_ref(), self.repository, source_url, raw).await;
        let payload = SourcePayload::parse(self.repository, &resolution.payload)?;
        let sites = self.sites.match_payload(&resolution.payload);
        let mut record = self
            .mapper
            .map(&resolution.url, &payload, &sites, self.repository)?;
        record.add_related_identifiers(resolution.relations);
        Ok(record)
    }

    /// Decide the write path for a mapped record and apply it.
    ///
    /// `url` is the record's canonical URL; `fetched_url` the URL it was
    /// fetched from, which is treated as an older version when they differ.
    pub async fn synchronize_record(
        &self,
        url: &str,
        fetched_url: &str,
        source_checksum: &str,
        record: &CanonicalDatasetRecord,
        existing: Option<&HarvestedRecord>,
    ) -> Result<RecordOutcome> {
        let registry_checksum = checksum(record)?;
        let now = now();

        // Version migration.
        let mut candidates: Vec<&str> = record.previous_version_urls().collect();
        if fetched_url != url {
            candidates.push(fetched_url);
        }
        let row_at_url = existing.filter(|row| row.source_url == url);
        for old_url in candidates.into_iter().filter(|c| *c != url) {
            let Some(old) = self.unique_row(old_url).await? else {
                continue;
            };
            let Some(old_id) = old.registry_id.clone() else {
                continue;
            };
            if row_at_url.is_some() {
                warn!(
                    url,
                    old_url,
                    "older version is stored but so is the latest, leaving both"
                );
                break;
            }
            info!(url, old_url, registry_id = %old_id, "migrating record to its latest version");
            if let Err(e) = self.registry.update(&old_id, record).await {
                return self.registry_failure("update", &old_id, e, Some(&old)).await;
            }
            let row = HarvestedRecord::from_canonical(
                url,
                self.repository,
                source_checksum,
                Some(old_id),
                &registry_checksum,
                record,
                now,
            );
            self.tx()?.update_record(&old.source_url, &row).await?;
            return Ok(RecordOutcome::Migrated);
        }

        let registry_id = match self.registry.find_by_source_url(url).await {
            Ok(found) => found,
            Err(e) => {
                warn!(url, error = %e, "registry lookup failed");
                return self.fail_row(existing).await;
            }
        };

        let Some(registry_id) = registry_id else {
            let registry_id = match self.registry.create(record).await {
                Ok(id) => id,
                Err(e) => return self.registry_failure("create", url, e, existing).await,
            };
            info!(url, registry_id = %registry_id, "created");
            let row = HarvestedRecord::from_canonical(
                url,
                self.repository,
                source_checksum,
                Some(registry_id),
                &registry_checksum,
                record,
                now,
            );
            let tx = self.tx()?;
            match existing {
                Some(old) if old.source_url != url => tx.update_record(&old.source_url, &row).await?,
                _ => tx.create_record(&row).await?,
            }
            return Ok(RecordOutcome::Created);
        };

        let changed = existing.map_or(true, |row| {
            row.source_checksum != source_checksum
                || row.registry_checksum.as_deref() != Some(registry_checksum.as_str())
        });
        if !changed {
            if let Some(row) = existing {
                self.tx()?
                    .set_status(&row.source_url, RecordStatus::Success)
                    .await?;
            }
            return Ok(RecordOutcome::Unchanged);
        }

        match existing {
            None => info!(url, "no local row, updating registry record"),
            Some(row) if row.source_checksum != source_checksum => {
                info!(url, previous = %row.source_checksum, current = %source_checksum, "source changed")
            }
            Some(_) => info!(url, "mapping changed"),
        }
        if self.tx()?.delete_resolved(&registry_id).await? {
            debug!(registry_id = %registry_id, "dropped resolved marker");
        }
        if let Err(e) = self.registry.update(&registry_id, record).await {
            return self.registry_failure("update", &registry_id, e, existing).await;
        }
        let row = HarvestedRecord::from_canonical(
            url,
            self.repository,
            source_checksum,
            Some(registry_id),
            &registry_checksum,
            record,
            now,
        );
        let tx = self.tx()?;
        match existing {
            Some(old) => tx.update_record(&old.source_url, &row).await?,
            None => tx.create_record(&row).await?,
        }
        Ok(RecordOutcome::Updated)
    }

    async fn registry_failure(
        &self,
        operation: &'static str,
        target: &str,
        cause: anyhow::Error,
        row: Option<&HarvestedRecord>,
    ) -> Result<RecordOutcome> {
        let err = match cause.downcast::<HarvestError>() {
            Ok(err) => err,
            Err(other) => HarvestError::RegistryWrite {
                operation,
                target: target.to_string(),
                reason: format!("{:#}", other),
            },
        };
        error!(error = %err, "registry write failed");
        self.fail_row(row).await
    }

    /// Reconcile `urls` concurrently and wait for all of them.
    async fn run_batch(self: &Arc<Self>, urls: Vec<String>) -> Result<()> {
        let mut tasks = JoinSet::new();
        for url in urls {
            let ctx = Arc::clone(self);
            tasks.spawn(async move {
                let result = ctx.process_one_record(&url).await;
                (url, result)
            });
        }

        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            let failure = match joined {
                Ok((_, Ok(outcome))) => {
                    self.counters.record(outcome);
                    continue;
                }
                Ok((url, Err(e))) => {
                    if error::is_fatal(&e) {
                        error!(url = %url, error = %e, "consistency violation");
                    } else {
                        error!(url = %url, error = %format!("{:#}", e), "record task failed");
                    }
                    e
                }
                Err(join_error) => anyhow!("record task panicked: {}", join_error),
            };
            first_error.get_or_insert(failure);
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn validate_local(self: &Arc<Self>) -> Result<()> {
        let tx = self.tx()?;
        let marked = tx.mark_repository_in_progress(self.repository).await?;
        let urls: Vec<String> = tx
            .list_by_repository(Some(self.repository))
            .await?
            .into_iter()
            .map(|row| row.source_url)
            .collect();
        info!(repository = %self.repository, rows = marked, "phase 1: validating local records");
        self.run_batch(urls).await
    }

    async fn crawl_remote(self: &Arc<Self>) -> Result<()> {
        info!(repository = %self.repository, "phase 2: crawling remote listing");
        if self.repository.is_sitemap() {
            let urls = crawl::fetch_sitemap(self.fetcher.as_ref(), &self.repo_config.api_url)
                .await
                .unwrap_or_else(|| {
                    warn!(url = %self.repo_config.api_url, "sitemap unavailable");
                    Vec::new()
                });
            info!(records = urls.len(), "sitemap listed");
            return self.run_batch(urls).await;
        }

        let page_size = self.repo_config.page_size.unwrap_or_default();
        let mut page = 1;
        loop {
            let Some(listing) = crawl::fetch_page(self.fetcher.as_ref(), &self.repo_config, page).await
            else {
                warn!(page, "listing page unavailable, stopping");
                break;
            };
            if listing.item_count == 0 {
                info!(page, "empty page, stopping");
                break;
            }
            info!(page, records = listing.urls.len(), "listing page");
            let more = listing.has_more(page_size);
            self.run_batch(listing.urls).await?;
            if !more {
                info!(page, "last page reached");
                break;
            }
            page += 1;
        }
        Ok(())
    }

    async fn cleanup(&self) -> Result<()> {
        let cutoff = now() - i64::from(self.cleanup_days) * 86_400;
        let deleted = self.tx()?.delete_unseen(self.repository, cutoff).await?;
        if deleted.is_empty() {
            info!(repository = %self.repository, "phase 3: nothing to clean up");
            return Ok(());
        }
        info!(
            repository = %self.repository,
            rows = deleted.len(),
            days = self.cleanup_days,
            "phase 3: deleted unseen records"
        );
        self.counters
            .deleted
            .fetch_add(deleted.len() as u64, Ordering::Relaxed);
        match self.registry.delete(&deleted).await {
            Ok(failed) if failed.is_empty() => {}
            Ok(failed) => warn!(ids = ?failed, "registry kept records deleted locally"),
            Err(e) => warn!(error = %e, "registry cleanup failed"),
        }
        Ok(())
    }

    /// Open the run's own transaction on the shared store.
    async fn begin_run(&self) -> Result<Arc<dyn StoreTransaction>> {
        if self.slot()?.is_some() {
            bail!("a run is already in progress on this context");
        }
        let tx: Arc<dyn StoreTransaction> = Arc::from(self.store.begin().await?);
        *self.slot()? = Some(Arc::clone(&tx));
        Ok(tx)
    }

    async fn in_transaction<F, Fut>(self: &Arc<Self>, body: F) -> Result<SyncReport>
    where
        F: FnOnce(Arc<Self>) -> Fut,
        Fut: std::future::Future<Output = Result<()>>,
    {
        let tx = self.begin_run().await?;
        let result = body(Arc::clone(self)).await;
        self.slot()?.take();
        match result {
            Ok(()) => {
                tx.commit().await?;
                Ok(self.report())
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    error!(error = %rollback, "rollback failed");
                }
                Err(e)
            }
        }
    }

    /// Run all three phases in one transaction.
    pub async fn sync_repository(self: &Arc<Self>) -> Result<SyncReport> {
        self.in_transaction(|ctx| async move {
            ctx.validate_local().await?;
            ctx.crawl_remote().await?;
            ctx.cleanup().await
        })
        .await
    }

    /// Reconcile the single record behind `source_url` in its own transaction.
    ///
    /// The URL is fetched first to find the record's self link, unwrapping
    /// `single_record_key` when the upstream wraps single records.
    pub async fn sync_one_record(self: &Arc<Self>, source_url: &str) -> Result<SyncReport> {
        let source_url = source_url.to_string();
        self.in_transaction(|ctx| async move {
            let Some(raw) = ctx.fetcher.fetch_json(&source_url).await else {
                warn!(url = %source_url, "record unavailable");
                ctx.counters.record(RecordOutcome::Unavailable);
                return Ok(());
            };
            let data = match ctx.repo_config.single_record_key.as_deref() {
                Some(key) if !key.is_empty() => nested(&raw, key).unwrap_or(&raw),
                _ => &raw,
            };
            let record_url = ctx
                .repo_config
                .self_link_key
                .as_deref()
                .and_then(|key| nested(data, key))
                .and_then(Value::as_str)
                .filter(|u| !u.is_empty())
                .unwrap_or(&source_url)
                .to_string();
            if record_url != source_url {
                info!(from = %source_url, to = %record_url, "harvesting from the record's self link");
            }
            ctx.tx()?
                .set_status(&record_url, RecordStatus::InProgress)
                .await?;
            let outcome = ctx.process_one_record(&record_url).await?;
            ctx.counters.record(outcome);
            Ok(())
        })
        .await
    }
}

/// Spawn a repository run. The handle resolves to the run's report.
pub fn start_repository_sync(ctx: Arc<HarvestContext>) -> JoinHandle<Result<SyncReport>> {
    tokio::spawn(async move {
        let repository = ctx.repository();
        info!(repository = %repository, "starting repository sync");
        let result = ctx.sync_repository().await;
        match &result {
            Ok(report) => info!(repository = %repository, %report, "repository sync finished"),
            Err(e) => error!(repository = %repository, error = %format!("{:#}", e), "repository sync rolled back"),
        }
        result
    })
}

/// Spawn a single-record run.
pub fn start_record_sync(
    ctx: Arc<HarvestContext>,
    source_url: String,
) -> JoinHandle<Result<SyncReport>> {
    tokio::spawn(async move {
        info!(url = %source_url, repository = %ctx.repository(), "starting record sync");
        let result = ctx.sync_one_record(&source_url).await;
        match &result {
            Ok(report) => info!(url = %source_url, %report, "record sync finished"),
            Err(e) => error!(url = %source_url, error = %format!("{:#}", e), "record sync rolled back"),
        }
        result
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use harvester_core::registry::memory::InMemoryRegistry;
    use harvester_core::store::memory::InMemoryStore;
    use std::sync::atomic::AtomicUsize;

    /// Serves one fixed body, or nothing.
    #[derive(Default)]
    struct Canned {
        body: Option<String>,
        requests: AtomicUsize,
    }

    #[async_trait::async_trait]
    impl Fetcher for Canned {
        async fn fetch_text(&self, _url: &str) -> Option<String> {
            self.requests.fetch_add(1, Ordering::SeqCst);
            self.body.clone()
        }
    }

    fn zenodo_record(url: &str) -> Value {
        serde_json::json!({
            "id": 1,
            "links": { "self": url },
            "metadata": {
                "title": "Lake chemistry",
                "publication_date": "2024-03-01",
                "resource_type": { "type": "dataset" },
                "relations": { "version": [{ "is_last": true }] }
            }
        })
    }

    fn settled_row(url: &str) -> HarvestedRecord {
        HarvestedRecord {
            source_url: url.to_string(),
            source_repository: RepositoryType::Zenodo,
            source_checksum: "c1".to_string(),
            registry_id: Some("reg-1".to_string()),
            registry_checksum: Some("m1".to_string()),
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

    fn context(
        store: Arc<InMemoryStore>,
        registry: Arc<InMemoryRegistry>,
        fetcher: Arc<Canned>,
        must_verify: bool,
    ) -> Arc<HarvestContext> {
        Arc::new(HarvestContext::new(
            store,
            registry,
            fetcher,
            Arc::new(crate::mapper::DefaultMapper),
            Arc::new(SiteCatalogue::empty()),
            RepositoryType::Zenodo,
            RepositoryConfig {
                api_url: "https://zenodo.test/api/records?q=".to_string(),
                page_size: Some(2),
                data_key: Some("hits.hits".to_string()),
                self_link_key: Some("links.self".to_string()),
                single_record_key: None,
                registry_query: None,
                auth_token_env: None,
            },
            must_verify,
            30,
        ))
    }

    #[tokio::test]
    async fn test_settled_row_is_skipped_without_fetch_and_seen() {
        let url = "https://zenodo.test/records/1";
        let store = Arc::new(InMemoryStore::new());
        store.create_record(&settled_row(url)).await.unwrap();
        let fetcher = Arc::new(Canned::default());
        let ctx = context(store.clone(), Arc::new(InMemoryRegistry::new()), fetcher.clone(), false);

        let tx = ctx.begin_run().await.unwrap();
        let outcome = ctx.process_one_record(url).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome, RecordOutcome::Skipped);
        assert_eq!(fetcher.requests.load(Ordering::SeqCst), 0);
        let row = store.records_by_source_url(url).await.unwrap().remove(0);
        assert!(row.last_seen_at > now() - 60);
        assert_eq!(row.status, RecordStatus::Success);
    }

    #[tokio::test]
    async fn test_verified_unchanged_row_is_skipped_after_fetch_and_seen() {
        let url = "https://zenodo.test/records/1";
        let raw = zenodo_record(url);
        let store = Arc::new(InMemoryStore::new());
        let mut row = settled_row(url);
        row.source_checksum = checksum(&raw).unwrap();
        store.create_record(&row).await.unwrap();
        let registry = Arc::new(InMemoryRegistry::new());
        let fetcher = Arc::new(Canned {
            body: Some(raw.to_string()),
            ..Canned::default()
        });
        let ctx = context(store.clone(), registry.clone(), fetcher.clone(), true);

        let tx = ctx.begin_run().await.unwrap();
        let outcome = ctx.process_one_record(url).await.unwrap();
        tx.commit().await.unwrap();

        assert_eq!(outcome, RecordOutcome::Skipped);
        assert_eq!(fetcher.requests.load(Ordering::SeqCst), 1);
        assert_eq!(registry.writes(), 0);
        let row = store.records_by_source_url(url).await.unwrap().remove(0);
        assert!(row.last_seen_at > now() - 60);
        assert_eq!(row.registry_checksum.as_deref(), Some("m1"));
    }

    #[tokio::test]
    async fn test_engine_calls_need_an_open_run() {
        let ctx = context(
            Arc::new(InMemoryStore::new()),
            Arc::new(InMemoryRegistry::new()),
            Arc::new(Canned::default()),
            false,
        );
        let err = ctx
            .process_one_record("https://zenodo.test/records/1")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no run in progress"));

        let _tx = ctx.begin_run().await.unwrap();
        assert!(ctx.begin_run().await.is_err());
    }
}
