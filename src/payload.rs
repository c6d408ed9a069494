//! Typed views of upstream payloads.
//!
//! Each upstream is one [`SourcePayload`] variant holding a serde view of the
//! fields the harvester reads. Views are lenient (`#[serde(default)]`), so an
//! upstream adding or dropping optional fields never fails a parse; only a
//! payload of the wrong overall shape does.

use anyhow::{Context, Result};
use harvester_core::models::{RepositoryType, UpstreamFamily};
use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Links {
    #[serde(rename = "self")]
    pub self_url: Option<String>,
    pub versions: Option<String>,
}

/// `{ "hits": { "hits": [...] } }`, the search envelope shared by Zenodo,
/// B2Share and the registry.
#[derive(Debug, Clone, Deserialize)]
pub struct SearchPage<T> {
    pub hits: Hits<T>,
    #[serde(default)]
    pub links: PageLinks,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hits<T> {
    #[serde(default = "Vec::new")]
    pub hits: Vec<T>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct PageLinks {
    pub next: Option<String>,
}

/// A string or a list of strings.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum OneOrMany {
    One(String),
    Many(Vec<String>),
}

impl OneOrMany {
    pub fn into_vec(self) -> Vec<String> {
        match self {
            OneOrMany::One(s) => vec![s],
            OneOrMany::Many(v) => v,
        }
    }
}

// ---- Zenodo ----

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZenodoRecord {
    pub id: Option<Value>,
    pub doi: Option<String>,
    pub created: Option<String>,
    pub links: Links,
    pub metadata: ZenodoMetadata,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZenodoMetadata {
    pub title: Option<String>,
    pub description: Option<String>,
    pub publication_date: Option<String>,
    pub keywords: Vec<String>,
    pub language: Option<String>,
    pub license: Option<ZenodoLicense>,
    pub resource_type: Option<ZenodoResourceType>,
    pub relations: Option<ZenodoRelations>,
    pub creators: Vec<ZenodoCreator>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZenodoLicense {
    pub id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZenodoResourceType {
    pub title: Option<String>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZenodoRelations {
    pub version: Vec<ZenodoVersionRelation>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZenodoVersionRelation {
    pub is_last: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ZenodoCreator {
    pub name: Option<String>,
    pub affiliation: Option<String>,
    pub orcid: Option<String>,
}

impl ZenodoRecord {
    /// True when the record flags itself as the last version.
    pub fn is_last_version(&self) -> bool {
        self.metadata
            .relations
            .as_ref()
            .and_then(|r| r.version.first())
            .map_or(false, |v| v.is_last)
    }
}

// ---- B2Share ----

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2ShareRecord {
    pub id: Option<String>,
    pub created: Option<String>,
    pub links: Links,
    pub metadata: B2ShareMetadata,
    pub pids: Option<B2SharePids>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2ShareMetadata {
    pub titles: Vec<B2ShareTitle>,
    pub descriptions: Vec<B2ShareDescription>,
    pub keywords: Vec<B2ShareKeyword>,
    pub publication_date: Option<String>,
    pub language: Option<String>,
    pub rights: Vec<B2ShareRight>,
    pub creators: Vec<B2ShareCreator>,
    pub resource_types: Vec<B2ShareResourceType>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2ShareTitle {
    pub title: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2ShareDescription {
    pub description: String,
    pub description_type: Option<String>,
}

/// Legacy records list plain strings, newer ones `{ "keyword": ... }`.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum B2ShareKeyword {
    Plain(String),
    Tagged { keyword: String },
}

impl B2ShareKeyword {
    pub fn label(&self) -> &str {
        match self {
            B2ShareKeyword::Plain(s) => s,
            B2ShareKeyword::Tagged { keyword } => keyword,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2ShareRight {
    pub id: Option<String>,
    pub title: Option<Value>,
    pub link: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2ShareCreator {
    pub creator_name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2ShareResourceType {
    pub resource_type_general: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2SharePids {
    pub doi: Option<B2ShareDoi>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2ShareDoi {
    pub identifier: Option<String>,
    pub provider: Option<String>,
}

/// Version listings exist in two coexisting shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum B2ShareVersions {
    /// `{ "versions": [{ "id", "url", "version" }] }`
    Legacy { versions: Vec<B2ShareLegacyVersion> },
    /// `{ "hits": { "hits": [{ "id", "links": { "self" }, "versions": { "is_latest" } }] } }`
    Search { hits: Hits<B2ShareVersionHit> },
}

#[derive(Debug, Clone, Deserialize)]
pub struct B2ShareLegacyVersion {
    pub id: String,
    pub url: String,
    pub version: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct B2ShareVersionHit {
    pub id: String,
    #[serde(default)]
    pub links: Links,
    #[serde(default)]
    pub versions: B2ShareVersionFlags,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct B2ShareVersionFlags {
    pub is_latest: bool,
}

// ---- FieldSites ----

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FieldSitesRecord {
    pub pid: Option<String>,
    pub file_name: Option<String>,
    pub access_url: Option<String>,
    pub previous_version: Option<OneOrMany>,
    pub latest_version: Option<String>,
    pub references: FieldSitesReferences,
    pub specification: FieldSitesSpecification,
    pub submission: FieldSitesSubmission,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct FieldSitesReferences {
    pub title: Option<String>,
    pub licence: Option<FieldSitesLicence>,
    pub temporal_coverage_display: Option<String>,
    pub keywords: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FieldSitesLicence {
    pub name: Option<String>,
    pub url: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FieldSitesSpecification {
    pub keywords: Vec<String>,
    #[serde(rename = "self")]
    pub self_info: FieldSitesSelf,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FieldSitesSelf {
    pub label: Option<String>,
    pub comments: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FieldSitesSubmission {
    pub start: Option<String>,
}

impl FieldSitesRecord {
    pub fn previous_versions(&self) -> Vec<String> {
        self.previous_version
            .clone()
            .map(OneOrMany::into_vec)
            .unwrap_or_default()
            .into_iter()
            .filter(|u| !u.trim().is_empty())
            .collect()
    }
}

// ---- DataRegistry ----

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataRegistryRecord {
    pub resource: DataRegistryResource,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataRegistryResource {
    pub title: Option<String>,
    #[serde(rename = "abstract")]
    pub abstract_text: Option<String>,
    pub keywords: Vec<DataRegistryKeyword>,
    pub date: Option<String>,
    pub language: Option<String>,
    pub resource_type: Option<String>,
    pub license: Option<DataRegistryLicense>,
    pub link: Option<String>,
    pub doi: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataRegistryKeyword {
    pub name: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct DataRegistryLicense {
    pub identifier: Option<String>,
}

/// A parsed upstream payload.
#[derive(Debug, Clone)]
pub enum SourcePayload {
    Zenodo(Box<ZenodoRecord>),
    B2Share(Box<B2ShareRecord>),
    FieldSites(Box<FieldSitesRecord>),
    DataRegistry(Box<DataRegistryRecord>),
}

impl SourcePayload {
    pub fn parse(repository: RepositoryType, raw: &Value) -> Result<Self> {
        let payload = match repository.family() {
            UpstreamFamily::Zenodo => SourcePayload::Zenodo(Box::new(
                serde_json::from_value(raw.clone()).context("not a Zenodo record")?,
            )),
            UpstreamFamily::B2shareEudat | UpstreamFamily::B2shareJuelich => {
                SourcePayload::B2Share(Box::new(
                    serde_json::from_value(raw.clone()).context("not a B2Share record")?,
                ))
            }
            UpstreamFamily::FieldSites => SourcePayload::FieldSites(Box::new(
                serde_json::from_value(raw.clone()).context("not a FieldSites record")?,
            )),
            UpstreamFamily::DataRegistry => SourcePayload::DataRegistry(Box::new(
                serde_json::from_value(raw.clone()).context("not a DataRegistry record")?,
            )),
        };
        Ok(payload)
    }

    /// The self URL the payload reports for itself, when it carries one.
    pub fn self_url(&self) -> Option<&str> {
        match self {
            SourcePayload::Zenodo(r) => r.links.self_url.as_deref(),
            SourcePayload::B2Share(r) => r.links.self_url.as_deref(),
            SourcePayload::FieldSites(_) => None,
            SourcePayload::DataRegistry(r) => r.resource.link.as_deref(),
        }
        .filter(|u| !u.is_empty())
    }
}

/// Resolve a dotted key such as `hits.hits` inside a JSON value.
pub fn nested<'a>(value: &'a Value, dotted: &str) -> Option<&'a Value> {
    dotted
        .split('.')
        .filter(|k| !k.is_empty())
        .try_fold(value, |node, key| node.get(key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_b2share_versions_both_shapes() {
        let legacy: B2ShareVersions = serde_json::from_value(json!({
            "versions": [{ "id": "a", "url": "https://b2/a", "version": 1 }]
        }))
        .unwrap();
        assert!(matches!(legacy, B2ShareVersions::Legacy { .. }));

        let search: B2ShareVersions = serde_json::from_value(json!({
            "hits": { "hits": [{ "id": "a", "links": { "self": "https://b2/a" }, "versions": { "is_latest": true } }] }
        }))
        .unwrap();
        match search {
            B2ShareVersions::Search { hits } => assert!(hits.hits[0].versions.is_latest),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_b2share_keywords_mixed() {
        let record: B2ShareRecord = serde_json::from_value(json!({
            "metadata": { "keywords": ["soil", { "keyword": "water" }] }
        }))
        .unwrap();
        let labels: Vec<&str> = record.metadata.keywords.iter().map(|k| k.label()).collect();
        assert_eq!(labels, vec!["soil", "water"]);
    }

    #[test]
    fn test_fieldsites_previous_version_one_or_many() {
        let one: FieldSitesRecord =
            serde_json::from_value(json!({ "previousVersion": "https://fs/1" })).unwrap();
        let many: FieldSitesRecord =
            serde_json::from_value(json!({ "previousVersion": ["https://fs/1", " ", "https://fs/2"] }))
                .unwrap();
        assert_eq!(one.previous_versions(), vec!["https://fs/1"]);
        assert_eq!(many.previous_versions(), vec!["https://fs/1", "https://fs/2"]);
    }

    #[test]
    fn test_zenodo_last_version_flag() {
        let raw = json!({
            "links": { "self": "https://zenodo.org/api/records/2" },
            "metadata": { "relations": { "version": [{ "is_last": true }] } }
        });
        let payload = SourcePayload::parse(RepositoryType::ZenodoIt, &raw).unwrap();
        match &payload {
            SourcePayload::Zenodo(r) => assert!(r.is_last_version()),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(payload.self_url(), Some("https://zenodo.org/api/records/2"));
    }

    #[test]
    fn test_wrong_shape_rejected() {
        assert!(SourcePayload::parse(RepositoryType::Zenodo, &json!(["not", "a", "record"])).is_err());
    }

    #[test]
    fn test_nested_lookup() {
        let page = json!({ "hits": { "hits": [1, 2] } });
        assert_eq!(nested(&page, "hits.hits"), Some(&json!([1, 2])));
        assert_eq!(nested(&page, "hits.missing"), None);
    }
}
