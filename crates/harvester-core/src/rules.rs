//! Override-rule engine.
//!
//! A rule `(path, before, after)` is re-applied to every freshly harvested
//! canonical record. It applies only while the live value at `path` still
//! normalizes to `before`, and only when the patched record still passes
//! schema validation. Rules that do not apply are deleted by
//! [`apply_all_rules_for_record`].

use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::dataset::CanonicalDatasetRecord;
use crate::error::HarvestError;
use crate::models::{OverrideRule, RuleDraft};
use crate::path::{self, FieldPath};
use crate::store::RecordStore;

/// Upstream identity; never operator-editable.
pub const PROTECTED_PATH: &str = "metadata.externalSourceInformation";

#[derive(Debug, Clone, PartialEq)]
pub enum RuleOutcome {
    Applied,
    /// Path targets the external-source identity fields.
    Protected,
    /// The live value no longer matches `before_value`.
    Stale,
    /// Unparseable path or a patch the schema rejects.
    Invalid(String),
}

impl RuleOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, RuleOutcome::Applied)
    }

    /// The validation error for a rule at `path` that did not apply.
    pub fn rejection(&self, path: &str) -> Option<HarvestError> {
        let reason = match self {
            RuleOutcome::Applied => return None,
            RuleOutcome::Protected => "targets the upstream identity".to_string(),
            RuleOutcome::Stale => "live value no longer matches".to_string(),
            RuleOutcome::Invalid(reason) => reason.clone(),
        };
        Some(HarvestError::Validation {
            path: path.to_string(),
            reason,
        })
    }
}

pub fn is_protected(path: &FieldPath) -> bool {
    FieldPath::parse(PROTECTED_PATH)
        .map(|protected| path.starts_with(&protected))
        .unwrap_or(false)
}

/// Apply one rule. `record` is left untouched unless the outcome is `Applied`.
pub fn apply_rule(record: &mut CanonicalDatasetRecord, rule: &OverrideRule) -> RuleOutcome {
    let target = match FieldPath::parse(&rule.target_path) {
        Ok(target) => target,
        Err(e) => return RuleOutcome::Invalid(e.to_string()),
    };
    if is_protected(&target) {
        return RuleOutcome::Protected;
    }

    let mut scratch = match serde_json::to_value(&*record) {
        Ok(value) => value,
        Err(e) => return RuleOutcome::Invalid(e.to_string()),
    };
    let live = path::get(&scratch, &target).cloned().unwrap_or(Value::Null);
    if normalize(&live) != normalize(&rule.before_value) {
        return RuleOutcome::Stale;
    }

    if let Err(e) = path::set(&mut scratch, &target, rule.after_value.clone()) {
        return RuleOutcome::Invalid(e.to_string());
    }
    strip_nulls(&mut scratch);
    let patched: CanonicalDatasetRecord = match serde_json::from_value(scratch) {
        Ok(patched) => patched,
        Err(e) => return RuleOutcome::Invalid(e.to_string()),
    };
    if let Err(e) = patched.validate() {
        return RuleOutcome::Invalid(e.to_string());
    }
    *record = patched;
    RuleOutcome::Applied
}

/// Outcome of layering every stored rule onto a record.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RuleSummary {
    pub applied: Vec<String>,
    pub deleted: Vec<i64>,
}

/// Apply every rule stored for `registry_id` in stored order, deleting the
/// ones that no longer apply.
pub async fn apply_all_rules_for_record<S: RecordStore + ?Sized>(
    store: &S,
    record: &mut CanonicalDatasetRecord,
    registry_id: &str,
) -> anyhow::Result<RuleSummary> {
    let mut summary = RuleSummary::default();
    for rule in store.rules_for_record(registry_id).await? {
        match apply_rule(record, &rule) {
            RuleOutcome::Applied => {
                debug!(registry_id, path = %rule.target_path, "rule applied");
                summary.applied.push(rule.target_path);
            }
            outcome => {
                if let Some(err) = outcome.rejection(&rule.target_path) {
                    warn!(
                        registry_id,
                        rule_id = rule.id,
                        error = %err,
                        "deleting rule that no longer applies"
                    );
                }
                store.delete_rule(registry_id, rule.id).await?;
                summary.deleted.push(rule.id);
            }
        }
    }
    Ok(summary)
}

/// Collapse "nothing" values so that null, blank strings and empty or
/// all-empty containers compare equal. Returns `None` for nothing.
pub fn normalize(value: &Value) -> Option<Value> {
    match value {
        Value::Null => None,
        Value::String(s) if s.trim().is_empty() => None,
        Value::Array(items) => {
            let kept: Vec<Value> = items.iter().filter_map(normalize).collect();
            if kept.is_empty() {
                None
            } else {
                Some(Value::Array(kept))
            }
        }
        Value::Object(map) => {
            let kept: Map<String, Value> = map
                .iter()
                .filter_map(|(k, v)| normalize(v).map(|v| (k.clone(), v)))
                .collect();
            if kept.is_empty() {
                None
            } else {
                Some(Value::Object(kept))
            }
        }
        other => Some(other.clone()),
    }
}

/// Drop object keys holding null, so optional fields deserialize as absent.
fn strip_nulls(value: &mut Value) {
    match value {
        Value::Object(map) => {
            map.retain(|_, v| !v.is_null());
            map.values_mut().for_each(strip_nulls);
        }
        Value::Array(items) => items.iter_mut().for_each(strip_nulls),
        _ => {}
    }
}

/// Derive rule drafts that turn `original` into `edited`.
///
/// Objects are compared key by key; arrays and scalars are replaced whole.
pub fn diff_rules(original: &Value, edited: &Value) -> Vec<RuleDraft> {
    let mut drafts = Vec::new();
    diff_into(original, edited, "", &mut drafts);
    drafts
}

fn diff_into(original: &Value, edited: &Value, prefix: &str, out: &mut Vec<RuleDraft>) {
    match (original, edited) {
        (Value::Object(before), Value::Object(after)) => {
            let mut keys: Vec<&String> = before.keys().chain(after.keys()).collect();
            keys.sort();
            keys.dedup();
            for key in keys {
                let child = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                let b = before.get(key).unwrap_or(&Value::Null);
                let a = after.get(key).unwrap_or(&Value::Null);
                diff_into(b, a, &child, out);
            }
        }
        (before, after) => {
            if !prefix.is_empty() && normalize(before) != normalize(after) {
                out.push(RuleDraft {
                    target_path: prefix.to_string(),
                    before_value: before.clone(),
                    after_value: after.clone(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::InMemoryStore;
    use crate::store::{Store, StoreTransaction};
    use serde_json::json;

    fn record() -> CanonicalDatasetRecord {
        serde_json::from_value(json!({
            "metadata": {
                "assetType": "Dataset",
                "titles": [{ "titleText": "Original title" }],
                "language": "en",
                "externalSourceInformation": {
                    "externalSourceName": "Zenodo",
                    "externalSourceURI": "https://zenodo.org/api/records/1"
                }
            }
        }))
        .unwrap()
    }

    fn rule(id: i64, path: &str, before: Value, after: Value) -> OverrideRule {
        OverrideRule {
            id,
            registry_id: "reg-1".to_string(),
            target_path: path.to_string(),
            before_value: before,
            after_value: after,
        }
    }

    #[test]
    fn test_rule_round_trip_restores_original() {
        let original = record();
        let mut rec = original.clone();
        let path = "metadata.titles[0].titleText";
        let forward = rule(1, path, json!("Original title"), json!("Better title"));
        let back = rule(2, path, json!("Better title"), json!("Original title"));
        assert_eq!(apply_rule(&mut rec, &forward), RuleOutcome::Applied);
        assert_eq!(rec.primary_title(), Some("Better title"));
        assert_eq!(apply_rule(&mut rec, &back), RuleOutcome::Applied);
        assert_eq!(rec, original);
    }

    #[test]
    fn test_stale_rule_leaves_record_unchanged() {
        let original = record();
        let mut rec = original.clone();
        let stale = rule(1, "metadata.language", json!("de"), json!("fr"));
        assert_eq!(apply_rule(&mut rec, &stale), RuleOutcome::Stale);
        assert_eq!(
            serde_json::to_vec(&rec).unwrap(),
            serde_json::to_vec(&original).unwrap()
        );
    }

    #[test]
    fn test_protected_path_rejected() {
        let mut rec = record();
        let r = rule(
            1,
            "metadata.externalSourceInformation.externalSourceURI",
            json!("https://zenodo.org/api/records/1"),
            json!("https://evil"),
        );
        assert_eq!(apply_rule(&mut rec, &r), RuleOutcome::Protected);
        assert_eq!(rec, record());
    }

    #[test]
    fn test_schema_violation_rejected() {
        let mut rec = record();
        let r = rule(1, "metadata.assetType", json!("Dataset"), json!(""));
        assert!(matches!(apply_rule(&mut rec, &r), RuleOutcome::Invalid(_)));
        let unknown = rule(1, "metadata.colour", Value::Null, json!("blue"));
        assert!(matches!(apply_rule(&mut rec, &unknown), RuleOutcome::Invalid(_)));
        assert_eq!(rec, record());
    }

    #[test]
    fn test_empty_before_matches_missing_field() {
        let mut rec = record();
        let r = rule(1, "metadata.keywords", json!([]), json!([{ "keywordLabel": "soil" }]));
        assert_eq!(apply_rule(&mut rec, &r), RuleOutcome::Applied);
        assert_eq!(rec.metadata.keywords[0].keyword_label, "soil");
    }

    #[test]
    fn test_null_after_removes_optional_field() {
        let mut rec = record();
        let r = rule(1, "metadata.language", json!("en"), Value::Null);
        assert_eq!(apply_rule(&mut rec, &r), RuleOutcome::Applied);
        assert_eq!(rec.metadata.language, None);
    }

    #[test]
    fn test_rejection_describes_why_a_rule_was_dropped() {
        assert!(RuleOutcome::Applied.rejection("metadata.language").is_none());
        let err = RuleOutcome::Stale.rejection("metadata.language").unwrap();
        assert!(!err.is_fatal());
        assert_eq!(
            err.to_string(),
            "rule for 'metadata.language' rejected: live value no longer matches"
        );
        let err = RuleOutcome::Invalid("empty assetType".to_string())
            .rejection("metadata.assetType")
            .unwrap();
        assert!(matches!(err, HarvestError::Validation { ref reason, .. } if reason == "empty assetType"));
    }

    #[test]
    fn test_normalize_treats_empties_alike() {
        assert_eq!(normalize(&Value::Null), None);
        assert_eq!(normalize(&json!([])), None);
        assert_eq!(normalize(&json!({"a": [], "b": null})), None);
        assert_eq!(normalize(&json!({"a": 1, "b": {}})), Some(json!({"a": 1})));
    }

    #[test]
    fn test_diff_rules_recurses_objects_replaces_arrays() {
        let original = json!({"metadata": {"language": "en", "keywords": [{"keywordLabel": "a"}]}});
        let edited = json!({"metadata": {"keywords": [{"keywordLabel": "b"}], "datasetType": "Raw"}});
        let drafts = diff_rules(&original, &edited);
        let paths: Vec<&str> = drafts.iter().map(|d| d.target_path.as_str()).collect();
        assert_eq!(
            paths,
            vec!["metadata.datasetType", "metadata.keywords", "metadata.language"]
        );
        assert_eq!(drafts[0].before_value, Value::Null);
        assert_eq!(drafts[2].after_value, Value::Null);
    }

    #[tokio::test]
    async fn test_apply_all_deletes_rules_that_do_not_apply() {
        let store = InMemoryStore::new();
        let good = RuleDraft {
            target_path: "metadata.language".to_string(),
            before_value: json!("en"),
            after_value: json!("de"),
        };
        let stale = RuleDraft {
            target_path: "metadata.titles[0].titleText".to_string(),
            before_value: json!("Some other title"),
            after_value: json!("x"),
        };
        store.upsert_rule("reg-1", &good).await.unwrap();
        store.upsert_rule("reg-1", &stale).await.unwrap();

        let mut rec = record();
        let summary = apply_all_rules_for_record(&store, &mut rec, "reg-1").await.unwrap();
        assert_eq!(summary.applied, vec!["metadata.language".to_string()]);
        assert_eq!(summary.deleted.len(), 1);
        assert_eq!(rec.metadata.language.as_deref(), Some("de"));
        let left = store.rules_for_record("reg-1").await.unwrap();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].target_path, "metadata.language");
    }

    #[tokio::test]
    async fn test_apply_all_inside_a_transaction() {
        let store = InMemoryStore::new();
        let stale = RuleDraft {
            target_path: "metadata.language".to_string(),
            before_value: json!("fr"),
            after_value: json!("de"),
        };
        store.upsert_rule("reg-1", &stale).await.unwrap();

        let tx = store.begin().await.unwrap();
        let mut rec = record();
        let summary = apply_all_rules_for_record(tx.as_ref(), &mut rec, "reg-1")
            .await
            .unwrap();
        assert_eq!(summary.deleted.len(), 1);
        assert_eq!(store.rules_for_record("reg-1").await.unwrap().len(), 1);
        tx.commit().await.unwrap();
        assert!(store.rules_for_record("reg-1").await.unwrap().is_empty());
    }
}
