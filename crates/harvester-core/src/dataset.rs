//! Canonical dataset record.
//!
//! Every upstream payload is mapped into [`CanonicalDatasetRecord`] before it
//! is diffed against the local store and written to the registry. The serde
//! model doubles as the schema: unknown fields are rejected on
//! deserialization and [`CanonicalDatasetRecord::validate`] enforces the
//! value-level constraints that types alone cannot express.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Relation type marking the related identifier as an older version.
pub const IS_NEW_VERSION_OF: &str = "IsNewVersionOf";
/// Relation type marking the related identifier as a newer version.
pub const IS_PREVIOUS_VERSION_OF: &str = "IsPreviousVersionOf";

#[derive(Debug, Error, PartialEq)]
pub enum SchemaError {
    #[error("metadata.assetType must not be empty")]
    MissingAssetType,
    #[error("{field}[{index}] must not be blank")]
    Blank { field: &'static str, index: usize },
    #[error("{field} is not an ISO date: '{value}'")]
    InvalidDate { field: String, value: String },
    #[error("temporal coverage {index} ends before it starts")]
    InvertedCoverage { index: usize },
    #[error("bounding box {index} is out of range")]
    BoundingBoxOutOfRange { index: usize },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct CanonicalDatasetRecord {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pids: Option<Pids>,
    pub metadata: DatasetMetadata,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Pids {
    pub doi: Doi,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Doi {
    pub identifier: String,
    pub provider: String,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DatasetMetadata {
    pub asset_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_type: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub alternate_identifiers: Vec<AlternateIdentifier>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub titles: Vec<Title>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub creators: Vec<Creator>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contact_points: Vec<ContactPoint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub descriptions: Vec<Description>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub keywords: Vec<Keyword>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub temporal_coverages: Vec<TemporalCoverage>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub geo_locations: Vec<GeoLocation>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub licenses: Vec<License>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<DataFile>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub responsible_organizations: Vec<Organization>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub contributors: Vec<Contributor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub publication_date: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taxonomic_coverages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub projects: Vec<Project>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub site_references: Vec<SiteReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub habitat_references: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_metadata: Vec<AdditionalMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_identifiers: Vec<RelatedIdentifier>,
    pub external_source_information: ExternalSourceInformation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AlternateIdentifier {
    #[serde(rename = "alternateID")]
    pub alternate_id: String,
    #[serde(rename = "alternateIDType")]
    pub alternate_id_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Title {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title_language: Option<String>,
    pub title_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Description {
    pub description_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Keyword {
    pub keyword_label: String,
    #[serde(rename = "keywordURI", default, skip_serializing_if = "Option::is_none")]
    pub keyword_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct EntityId {
    #[serde(rename = "entityID", default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(rename = "entityIDSchema", default, skip_serializing_if = "Option::is_none")]
    pub entity_id_schema: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Affiliation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_name: Option<String>,
    #[serde(rename = "entityID", default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Creator {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub creator_affiliation: Option<Affiliation>,
    #[serde(rename = "creatorIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub creator_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ContactPoint {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contact_email: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContributorType {
    ContactPerson,
    DataCollector,
    DataCurator,
    DataManager,
    MetadataProvider,
    Producer,
    ProjectLeader,
    ProjectManager,
    ProjectMember,
    RegistrationAuthority,
    RelatedPerson,
    Researcher,
    ResearchGroup,
    Other,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Contributor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributor_family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributor_given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributor_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributor_affiliation: Option<Affiliation>,
    #[serde(rename = "contributorIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub contributor_ids: Vec<EntityId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contributor_type: Option<ContributorType>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct TemporalCoverage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_date: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_date: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BoundingBox {
    pub west_bound_longitude: f64,
    pub east_bound_longitude: f64,
    pub south_bound_latitude: f64,
    pub north_bound_latitude: f64,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Coordinates {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latitude: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub longitude: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct GeoLocation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub geographic_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bounding_box: Option<BoundingBox>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub point: Option<Coordinates>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct License {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license_code: Option<String>,
    #[serde(rename = "licenseURI", default, skip_serializing_if = "Option::is_none")]
    pub license_uri: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct DataFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "sourceUrl", default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub md5: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Organization {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_email: Option<String>,
    #[serde(rename = "organizationIDs", default, skip_serializing_if = "Vec::is_empty")]
    pub organization_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Project {
    #[serde(rename = "projectID", default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SiteReference {
    #[serde(rename = "siteID")]
    pub site_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub site_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct AdditionalMetadata {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct RelatedIdentifier {
    #[serde(rename = "relatedID")]
    pub related_id: String,
    #[serde(rename = "relatedIDType")]
    pub related_id_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub related_resource_type: Option<String>,
    pub relation_type: String,
}

impl RelatedIdentifier {
    /// A URL relation between two dataset versions.
    pub fn version_link(url: &str, relation_type: &str) -> Self {
        Self {
            related_id: url.to_string(),
            related_id_type: "URL".to_string(),
            related_resource_type: Some("Dataset".to_string()),
            relation_type: relation_type.to_string(),
        }
    }
}

/// Upstream identity of a record. Never operator-editable.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExternalSourceInformation {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_source_name: Option<String>,
    #[serde(rename = "externalSourceURI", default, skip_serializing_if = "Option::is_none")]
    pub external_source_uri: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_source_info: Option<String>,
}

impl CanonicalDatasetRecord {
    /// The canonical source URI, which doubles as the store's primary key.
    pub fn external_source_uri(&self) -> Option<&str> {
        self.metadata
            .external_source_information
            .external_source_uri
            .as_deref()
            .filter(|uri| !uri.is_empty())
    }

    /// URLs this record declares itself to be a new version of.
    pub fn previous_version_urls(&self) -> impl Iterator<Item = &str> {
        self.metadata
            .related_identifiers
            .iter()
            .filter(|rel| rel.relation_type == IS_NEW_VERSION_OF)
            .map(|rel| rel.related_id.as_str())
    }

    /// First title text, used as the display title of the local row.
    pub fn primary_title(&self) -> Option<&str> {
        self.metadata.titles.first().map(|t| t.title_text.as_str())
    }

    /// Append relations not already present.
    pub fn add_related_identifiers(&mut self, relations: impl IntoIterator<Item = RelatedIdentifier>) {
        for rel in relations {
            let exists = self.metadata.related_identifiers.iter().any(|existing| {
                existing.related_id == rel.related_id && existing.relation_type == rel.relation_type
            });
            if !exists {
                self.metadata.related_identifiers.push(rel);
            }
        }
    }

    /// Value-level schema checks on top of the structural serde model.
    pub fn validate(&self) -> Result<(), SchemaError> {
        let meta = &self.metadata;
        if meta.asset_type.trim().is_empty() {
            return Err(SchemaError::MissingAssetType);
        }
        for (index, title) in meta.titles.iter().enumerate() {
            if title.title_text.trim().is_empty() {
                return Err(SchemaError::Blank { field: "titles", index });
            }
        }
        for (index, description) in meta.descriptions.iter().enumerate() {
            if description.description_text.trim().is_empty() {
                return Err(SchemaError::Blank {
                    field: "descriptions",
                    index,
                });
            }
        }
        for (index, keyword) in meta.keywords.iter().enumerate() {
            if keyword.keyword_label.trim().is_empty() {
                return Err(SchemaError::Blank {
                    field: "keywords",
                    index,
                });
            }
        }
        if let Some(date) = &meta.publication_date {
            parse_date("publicationDate", date)?;
        }
        for (index, coverage) in meta.temporal_coverages.iter().enumerate() {
            let start = match &coverage.start_date {
                Some(s) => Some(parse_date(&format!("temporalCoverages[{}].startDate", index), s)?),
                None => None,
            };
            let end = match &coverage.end_date {
                Some(s) => Some(parse_date(&format!("temporalCoverages[{}].endDate", index), s)?),
                None => None,
            };
            if let (Some(start), Some(end)) = (start, end) {
                if end < start {
                    return Err(SchemaError::InvertedCoverage { index });
                }
            }
        }
        for (index, location) in meta.geo_locations.iter().enumerate() {
            if let Some(bbox) = &location.bounding_box {
                let lat_ok = |v: f64| (-90.0..=90.0).contains(&v);
                let lon_ok = |v: f64| (-180.0..=180.0).contains(&v);
                if !(lon_ok(bbox.west_bound_longitude)
                    && lon_ok(bbox.east_bound_longitude)
                    && lat_ok(bbox.south_bound_latitude)
                    && lat_ok(bbox.north_bound_latitude))
                {
                    return Err(SchemaError::BoundingBoxOutOfRange { index });
                }
            }
        }
        Ok(())
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp.
fn parse_date(field: &str, value: &str) -> Result<NaiveDate, SchemaError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d")
        .or_else(|_| chrono::DateTime::parse_from_rfc3339(value).map(|dt| dt.date_naive()))
        .map_err(|_| SchemaError::InvalidDate {
            field: field.to_string(),
            value: value.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> CanonicalDatasetRecord {
        serde_json::from_value(serde_json::json!({
            "metadata": {
                "assetType": "Dataset",
                "titles": [{ "titleText": "Soil moisture" }],
                "temporalCoverages": [{ "startDate": "2020-01-01", "endDate": "2021-01-01" }],
                "externalSourceInformation": {
                    "externalSourceName": "Zenodo",
                    "externalSourceURI": "https://zenodo.org/api/records/1"
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn test_valid_record_passes() {
        assert_eq!(sample().validate(), Ok(()));
    }

    #[test]
    fn test_unknown_field_rejected() {
        let result: Result<CanonicalDatasetRecord, _> = serde_json::from_value(serde_json::json!({
            "metadata": {
                "assetType": "Dataset",
                "colour": "blue",
                "externalSourceInformation": {}
            }
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_blank_title_rejected() {
        let mut record = sample();
        record.metadata.titles[0].title_text = "  ".to_string();
        assert_eq!(
            record.validate(),
            Err(SchemaError::Blank {
                field: "titles",
                index: 0
            })
        );
    }

    #[test]
    fn test_inverted_coverage_rejected() {
        let mut record = sample();
        record.metadata.temporal_coverages[0].end_date = Some("2019-01-01".to_string());
        assert_eq!(
            record.validate(),
            Err(SchemaError::InvertedCoverage { index: 0 })
        );
    }

    #[test]
    fn test_bad_publication_date_rejected() {
        let mut record = sample();
        record.metadata.publication_date = Some("last tuesday".to_string());
        assert!(matches!(
            record.validate(),
            Err(SchemaError::InvalidDate { .. })
        ));
    }

    #[test]
    fn test_add_related_identifiers_dedups() {
        let mut record = sample();
        let rel = RelatedIdentifier::version_link("https://old", IS_NEW_VERSION_OF);
        record.add_related_identifiers(vec![rel.clone(), rel]);
        assert_eq!(record.previous_version_urls().collect::<Vec<_>>(), vec!["https://old"]);
    }

    #[test]
    fn test_empty_vectors_not_serialized() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json["metadata"].get("keywords").is_none());
        assert_eq!(
            sample().external_source_uri(),
            Some("https://zenodo.org/api/records/1")
        );
    }
}
