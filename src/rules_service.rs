//! Operator rule management.
//!
//! Stores override rules for a registry record and re-syncs the record so
//! the change reaches the registry. Re-sync failures are logged, never
//! returned: the rule itself was stored either way.

use anyhow::Result;
use harvester_core::models::{HarvestedRecord, OverrideRule, RuleDraft};
use harvester_core::rules::normalize;
use harvester_core::store::RecordStore;
use thiserror::Error;
use tracing::{error, info};

use crate::harvest::start_record_sync;
use crate::services::Services;

#[derive(Debug, Error, PartialEq)]
pub enum RuleRequestError {
    #[error("expected a non-empty list of rules")]
    EmptyBatch,
    #[error("rule {index} has no target_path")]
    MissingPath { index: usize },
    #[error("rule for '{path}' has neither a before nor an after value")]
    BothNull { path: String },
    #[error("no local record carries registry id {0}")]
    UnknownRecord(String),
}

fn validate(drafts: &[RuleDraft]) -> Result<(), RuleRequestError> {
    if drafts.is_empty() {
        return Err(RuleRequestError::EmptyBatch);
    }
    for (index, draft) in drafts.iter().enumerate() {
        if draft.target_path.trim().is_empty() {
            return Err(RuleRequestError::MissingPath { index });
        }
        if draft.before_value.is_null() && draft.after_value.is_null() {
            return Err(RuleRequestError::BothNull {
                path: draft.target_path.clone(),
            });
        }
    }
    Ok(())
}

async fn local_record(services: &Services, registry_id: &str) -> Result<HarvestedRecord> {
    services
        .store
        .record_by_registry_id(registry_id)
        .await?
        .ok_or_else(|| RuleRequestError::UnknownRecord(registry_id.to_string()).into())
}

async fn resync(services: &Services, row: &HarvestedRecord) {
    let ctx = match services.context(row.source_repository, false) {
        Ok(ctx) => ctx,
        Err(e) => {
            error!(url = %row.source_url, error = %e, "cannot re-sync record");
            return;
        }
    };
    match start_record_sync(ctx, row.source_url.clone()).await {
        Ok(Ok(_)) => info!(url = %row.source_url, "re-sync finished"),
        Ok(Err(e)) => error!(url = %row.source_url, error = %format!("{:#}", e), "re-sync failed"),
        Err(e) => error!(url = %row.source_url, error = %e, "re-sync task panicked"),
    }
}

/// Store `drafts` for `registry_id` and re-sync the record. Returns the paths
/// of the rules that were stored; drafts whose before and after values are
/// equivalent are skipped.
pub async fn apply_rules(
    services: &Services,
    registry_id: &str,
    drafts: &[RuleDraft],
) -> Result<Vec<String>> {
    validate(drafts)?;
    let row = local_record(services, registry_id).await?;

    let mut processed = Vec::new();
    for draft in drafts {
        if normalize(&draft.before_value) == normalize(&draft.after_value) {
            info!(registry_id, path = %draft.target_path, "rule changes nothing, skipped");
            continue;
        }
        services.store.upsert_rule(registry_id, draft).await?;
        processed.push(draft.target_path.clone());
    }

    if processed.is_empty() {
        return Ok(processed);
    }
    info!(registry_id, rules = processed.len(), paths = ?processed, "rules stored");
    resync(services, &row).await;
    Ok(processed)
}

/// Delete one rule and re-sync its record if it is stored locally.
/// Returns `false` when the rule did not exist.
pub async fn delete_rule(services: &Services, registry_id: &str, rule_id: i64) -> Result<bool> {
    let deleted = services.store.delete_rule(registry_id, rule_id).await?;
    if let Some(row) = services.store.record_by_registry_id(registry_id).await? {
        info!(registry_id, rule_id, "rule deleted, re-syncing record");
        resync(services, &row).await;
    }
    Ok(deleted)
}

pub async fn list_rules(services: &Services, registry_id: &str) -> Result<Vec<OverrideRule>> {
    services.store.rules_for_record(registry_id).await
}
