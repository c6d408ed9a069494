//! Core data models for the harvester.
//!
//! [`HarvestedRecord`] is the durable per-source-URL row, [`OverrideRule`] an
//! operator patch keyed by registry id, and [`RepositoryType`] the closed set
//! of upstream sources the engine knows how to reconcile.

use std::fmt;
use std::str::FromStr;

use anyhow::bail;
use serde::{Deserialize, Serialize};

use crate::dataset::{CanonicalDatasetRecord, SiteReference};

/// Supported upstream repositories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RepositoryType {
    Zenodo,
    ZenodoIt,
    B2shareEudat,
    B2shareJuelich,
    Sites,
    Dataregistry,
}

/// Upstream rate-limit domains. Several repositories may share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpstreamFamily {
    Zenodo,
    B2shareEudat,
    B2shareJuelich,
    FieldSites,
    DataRegistry,
}

impl RepositoryType {
    pub const ALL: [RepositoryType; 6] = [
        RepositoryType::Zenodo,
        RepositoryType::ZenodoIt,
        RepositoryType::B2shareEudat,
        RepositoryType::B2shareJuelich,
        RepositoryType::Sites,
        RepositoryType::Dataregistry,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            RepositoryType::Zenodo => "ZENODO",
            RepositoryType::ZenodoIt => "ZENODO_IT",
            RepositoryType::B2shareEudat => "B2SHARE_EUDAT",
            RepositoryType::B2shareJuelich => "B2SHARE_JUELICH",
            RepositoryType::Sites => "SITES",
            RepositoryType::Dataregistry => "DATAREGISTRY",
        }
    }

    pub fn family(&self) -> UpstreamFamily {
        match self {
            RepositoryType::Zenodo | RepositoryType::ZenodoIt => UpstreamFamily::Zenodo,
            RepositoryType::B2shareEudat => UpstreamFamily::B2shareEudat,
            RepositoryType::B2shareJuelich => UpstreamFamily::B2shareJuelich,
            RepositoryType::Sites => UpstreamFamily::FieldSites,
            RepositoryType::Dataregistry => UpstreamFamily::DataRegistry,
        }
    }

    /// Sitemap sources are listed from XML instead of a paged JSON API.
    pub fn is_sitemap(&self) -> bool {
        matches!(self, RepositoryType::Sites)
    }

    /// Name written to `externalSourceInformation.externalSourceName`.
    pub fn external_source_name(&self) -> &'static str {
        match self {
            RepositoryType::Zenodo | RepositoryType::ZenodoIt => "Zenodo",
            RepositoryType::B2shareEudat => "B2Share Eudat",
            RepositoryType::B2shareJuelich => "B2Share Juelich",
            RepositoryType::Sites => "FieldSites",
            RepositoryType::Dataregistry => "DataRegistry",
        }
    }
}

impl fmt::Display for RepositoryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RepositoryType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        let upper = s.trim().to_ascii_uppercase();
        for repo in RepositoryType::ALL {
            if repo.as_str() == upper {
                return Ok(repo);
            }
        }
        bail!("unknown repository type '{}'", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordStatus {
    InProgress,
    Success,
    Failed,
}

impl RecordStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RecordStatus::InProgress => "in_progress",
            RecordStatus::Success => "success",
            RecordStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for RecordStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "in_progress" => Ok(RecordStatus::InProgress),
            "success" => Ok(RecordStatus::Success),
            "failed" => Ok(RecordStatus::Failed),
            other => bail!("unknown record status '{}'", other),
        }
    }
}

/// One row per distinct source URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarvestedRecord {
    pub source_url: String,
    pub source_repository: RepositoryType,
    pub source_checksum: String,
    pub registry_id: Option<String>,
    pub registry_checksum: Option<String>,
    pub status: RecordStatus,
    pub title: Option<String>,
    pub site_references: Vec<SiteReference>,
    pub habitat_references: Vec<String>,
    pub dataset_type: Option<String>,
    pub keywords: Vec<String>,
    /// Unix seconds.
    pub last_harvested_at: i64,
    /// Unix seconds. Drives staleness cleanup.
    pub last_seen_at: i64,
}

impl HarvestedRecord {
    /// Build a fresh row from a reconciled canonical record.
    pub fn from_canonical(
        source_url: &str,
        repository: RepositoryType,
        source_checksum: &str,
        registry_id: Option<String>,
        registry_checksum: &str,
        record: &CanonicalDatasetRecord,
        now: i64,
    ) -> Self {
        let mut row = HarvestedRecord {
            source_url: source_url.to_string(),
            source_repository: repository,
            source_checksum: source_checksum.to_string(),
            registry_id,
            registry_checksum: Some(registry_checksum.to_string()),
            status: RecordStatus::Success,
            title: None,
            site_references: Vec::new(),
            habitat_references: Vec::new(),
            dataset_type: None,
            keywords: Vec::new(),
            last_harvested_at: now,
            last_seen_at: now,
        };
        row.refresh_facets(record);
        row
    }

    /// Copy the denormalized search facets from the canonical record.
    pub fn refresh_facets(&mut self, record: &CanonicalDatasetRecord) {
        self.title = record.primary_title().map(str::to_string);
        self.site_references = record.metadata.site_references.clone();
        self.habitat_references = record.metadata.habitat_references.clone();
        self.dataset_type = record.metadata.dataset_type.clone();
        self.keywords = record
            .metadata
            .keywords
            .iter()
            .map(|k| k.keyword_label.clone())
            .collect();
    }
}

/// A stored operator patch against one field of a canonical record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OverrideRule {
    pub id: i64,
    pub registry_id: String,
    pub target_path: String,
    pub before_value: serde_json::Value,
    pub after_value: serde_json::Value,
}

/// An operator-submitted rule before it is stored.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RuleDraft {
    #[serde(default)]
    pub target_path: String,
    #[serde(default)]
    pub before_value: serde_json::Value,
    #[serde(default)]
    pub after_value: serde_json::Value,
}

/// Operator acknowledgement that a record's current state was reviewed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedMarker {
    pub registry_id: String,
    pub resolved_by: Option<String>,
    pub resolved_at: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_repository_type_parses_wire_names() {
        assert_eq!("zenodo_it".parse::<RepositoryType>().unwrap(), RepositoryType::ZenodoIt);
        assert_eq!(
            "B2SHARE_JUELICH".parse::<RepositoryType>().unwrap(),
            RepositoryType::B2shareJuelich
        );
        assert!("FIGSHARE".parse::<RepositoryType>().is_err());
    }

    #[test]
    fn test_serde_matches_display() {
        for repo in RepositoryType::ALL {
            let json = serde_json::to_value(repo).unwrap();
            assert_eq!(json, serde_json::json!(repo.to_string()));
        }
    }

    #[test]
    fn test_zenodo_variants_share_a_family() {
        assert_eq!(RepositoryType::Zenodo.family(), RepositoryType::ZenodoIt.family());
        assert_ne!(
            RepositoryType::B2shareEudat.family(),
            RepositoryType::B2shareJuelich.family()
        );
    }
}
