//! Upstream payload to canonical record.
//!
//! [`Mapper`] is the seam the engine calls once a payload has been resolved
//! to its latest version. [`DefaultMapper`] covers the descriptive core of
//! each upstream (titles, descriptions, keywords, dates, licences, creators,
//! identifiers) and stamps the external source identity.

use anyhow::{Context, Result};
use harvester_core::dataset::{
    Affiliation, CanonicalDatasetRecord, Creator, DataFile, DatasetMetadata, Description, Doi,
    EntityId, ExternalSourceInformation, Keyword, License, Pids, SiteReference, Title,
};
use harvester_core::models::RepositoryType;

use crate::payload::{
    B2ShareRecord, DataRegistryRecord, FieldSitesRecord, SourcePayload, ZenodoRecord,
};

pub trait Mapper: Send + Sync {
    /// Map a payload fetched from `source_url`. Must be deterministic for
    /// identical inputs.
    fn map(
        &self,
        source_url: &str,
        payload: &SourcePayload,
        sites: &[SiteReference],
        repository: RepositoryType,
    ) -> Result<CanonicalDatasetRecord>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultMapper;

impl Mapper for DefaultMapper {
    fn map(
        &self,
        source_url: &str,
        payload: &SourcePayload,
        sites: &[SiteReference],
        repository: RepositoryType,
    ) -> Result<CanonicalDatasetRecord> {
        let (pids, mut metadata) = match payload {
            SourcePayload::Zenodo(r) => map_zenodo(r),
            SourcePayload::B2Share(r) => map_b2share(r),
            SourcePayload::FieldSites(r) => map_fieldsites(r),
            SourcePayload::DataRegistry(r) => map_dataregistry(r),
        };

        metadata.site_references = sites.to_vec();
        metadata.external_source_information = ExternalSourceInformation {
            external_source_name: Some(repository.external_source_name().to_string()),
            external_source_uri: Some(payload.self_url().unwrap_or(source_url).to_string()),
            external_source_info: None,
        };

        let record = CanonicalDatasetRecord { pids, metadata };
        record
            .validate()
            .with_context(|| format!("mapped record for {} is invalid", source_url))?;
        Ok(record)
    }
}

fn non_blank(s: Option<&str>) -> Option<String> {
    s.map(str::trim).filter(|s| !s.is_empty()).map(str::to_string)
}

fn titles(candidates: &[Option<&str>]) -> Vec<Title> {
    candidates
        .iter()
        .find_map(|c| non_blank(*c))
        .map(|title_text| Title {
            title_language: None,
            title_text,
        })
        .into_iter()
        .collect()
}

fn keywords<'a>(labels: impl IntoIterator<Item = &'a str>) -> Vec<Keyword> {
    let mut seen: Vec<String> = Vec::new();
    for label in labels {
        let label = label.trim();
        if !label.is_empty() && !seen.iter().any(|s| s == label) {
            seen.push(label.to_string());
        }
    }
    seen.into_iter()
        .map(|keyword_label| Keyword {
            keyword_label,
            keyword_uri: None,
        })
        .collect()
}

fn abstract_of(text: Option<&str>) -> Vec<Description> {
    non_blank(text)
        .map(|description_text| Description {
            description_text,
            description_type: Some("Abstract".to_string()),
        })
        .into_iter()
        .collect()
}

/// `YYYY-MM-DD` from a date or timestamp; anything else is dropped.
fn iso_date(value: Option<&str>) -> Option<String> {
    let value = value?.trim();
    let prefix = value.get(..10)?;
    chrono::NaiveDate::parse_from_str(prefix, "%Y-%m-%d")
        .ok()
        .map(|d| d.format("%Y-%m-%d").to_string())
}

/// A DOI given bare (`10.x/y`) or as a resolver URL.
fn doi_pid(doi: Option<&str>) -> Option<Pids> {
    let doi = non_blank(doi)?;
    let (provider, identifier) = match doi.split_once("://") {
        Some((_, rest)) => {
            let (host, path) = rest.split_once('/')?;
            (host.to_string(), path.to_string())
        }
        None => ("doi.org".to_string(), doi),
    };
    if identifier.is_empty() {
        return None;
    }
    Some(Pids {
        doi: Doi {
            identifier,
            provider,
        },
    })
}

/// "Family, Given" or a single display name.
fn creator(name: &str, affiliation: Option<&str>, orcid: Option<&str>) -> Option<Creator> {
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let (family, given) = match name.split_once(',') {
        Some((family, given)) => (family.trim(), non_blank(Some(given))),
        None => (name, None),
    };
    Some(Creator {
        creator_family_name: Some(family.to_string()),
        creator_given_name: given,
        creator_affiliation: non_blank(affiliation).map(|entity_name| Affiliation {
            entity_name: Some(entity_name),
            entity_id: None,
        }),
        creator_ids: non_blank(orcid)
            .map(|id| EntityId {
                entity_id: Some(id),
                entity_id_schema: Some("ORCID".to_string()),
            })
            .into_iter()
            .collect(),
        ..Creator::default()
    })
}

fn zenodo_asset_type(kind: Option<&str>) -> &'static str {
    match kind.map(|k| k.trim().to_ascii_lowercase()).as_deref() {
        None | Some("dataset") => "Dataset",
        Some("software") => "Software",
        Some("image") => "Image",
        Some("video") => "Audiovisual",
        Some("publication") => "Text",
        Some(_) => "Other",
    }
}

fn map_zenodo(r: &ZenodoRecord) -> (Option<Pids>, DatasetMetadata) {
    let meta = &r.metadata;
    let metadata = DatasetMetadata {
        asset_type: zenodo_asset_type(meta.resource_type.as_ref().and_then(|t| t.kind.as_deref()))
            .to_string(),
        dataset_type: meta
            .resource_type
            .as_ref()
            .and_then(|t| non_blank(t.title.as_deref())),
        titles: titles(&[meta.title.as_deref()]),
        creators: meta
            .creators
            .iter()
            .filter_map(|c| {
                creator(
                    c.name.as_deref().unwrap_or_default(),
                    c.affiliation.as_deref(),
                    c.orcid.as_deref(),
                )
            })
            .collect(),
        descriptions: abstract_of(meta.description.as_deref()),
        keywords: keywords(meta.keywords.iter().map(String::as_str)),
        publication_date: iso_date(meta.publication_date.as_deref().or(r.created.as_deref())),
        language: non_blank(meta.language.as_deref()),
        licenses: meta
            .license
            .as_ref()
            .and_then(|l| non_blank(l.id.as_deref()))
            .map(|code| License {
                license_code: Some(code),
                license_uri: None,
            })
            .into_iter()
            .collect(),
        ..DatasetMetadata::default()
    };
    (doi_pid(r.doi.as_deref()), metadata)
}

fn map_b2share(r: &B2ShareRecord) -> (Option<Pids>, DatasetMetadata) {
    let meta = &r.metadata;
    let descriptions = meta
        .descriptions
        .iter()
        .filter_map(|d| {
            non_blank(Some(d.description.as_str())).map(|description_text| Description {
                description_text,
                description_type: Some(
                    d.description_type
                        .clone()
                        .unwrap_or_else(|| "Abstract".to_string()),
                ),
            })
        })
        .collect();
    let licenses = meta
        .rights
        .iter()
        .filter_map(|right| {
            let code = non_blank(right.id.as_deref())
                .or_else(|| right.title.as_ref().and_then(|t| non_blank(t.as_str())));
            let uri = non_blank(right.link.as_deref());
            (code.is_some() || uri.is_some()).then(|| License {
                license_code: code,
                license_uri: uri,
            })
        })
        .collect();
    let metadata = DatasetMetadata {
        asset_type: "Dataset".to_string(),
        dataset_type: meta
            .resource_types
            .first()
            .and_then(|t| non_blank(t.resource_type_general.as_deref())),
        titles: titles(&[meta.titles.first().map(|t| t.title.as_str())]),
        creators: meta
            .creators
            .iter()
            .filter_map(|c| creator(c.creator_name.as_deref().unwrap_or_default(), None, None))
            .collect(),
        descriptions,
        keywords: keywords(meta.keywords.iter().map(|k| k.label())),
        publication_date: iso_date(meta.publication_date.as_deref().or(r.created.as_deref())),
        language: non_blank(meta.language.as_deref()),
        licenses,
        ..DatasetMetadata::default()
    };
    let pids = r
        .pids
        .as_ref()
        .and_then(|p| p.doi.as_ref())
        .and_then(|doi| doi_pid(doi.identifier.as_deref()));
    (pids, metadata)
}

fn map_fieldsites(r: &FieldSitesRecord) -> (Option<Pids>, DatasetMetadata) {
    let descriptions = r
        .specification
        .self_info
        .comments
        .iter()
        .filter_map(|c| non_blank(Some(c.as_str())))
        .map(|description_text| Description {
            description_text,
            description_type: Some("Abstract".to_string()),
        })
        .collect();
    let licenses = r
        .references
        .licence
        .as_ref()
        .map(|l| License {
            license_code: non_blank(l.name.as_deref()),
            license_uri: non_blank(l.url.as_deref()),
        })
        .filter(|l| l.license_code.is_some() || l.license_uri.is_some())
        .into_iter()
        .collect();
    let files = r
        .access_url
        .as_deref()
        .and_then(|u| non_blank(Some(u)))
        .map(|source_url| DataFile {
            name: non_blank(r.file_name.as_deref()),
            source_url: Some(source_url),
            ..DataFile::default()
        })
        .into_iter()
        .collect();
    let metadata = DatasetMetadata {
        asset_type: "Dataset".to_string(),
        titles: titles(&[
            r.references.title.as_deref(),
            r.specification.self_info.label.as_deref(),
            r.file_name.as_deref(),
        ]),
        descriptions,
        keywords: keywords(
            r.references
                .keywords
                .iter()
                .chain(r.specification.keywords.iter())
                .map(String::as_str),
        ),
        publication_date: iso_date(r.submission.start.as_deref()),
        licenses,
        files,
        ..DatasetMetadata::default()
    };
    (doi_pid(r.pid.as_deref().filter(|p| p.starts_with("10."))), metadata)
}

fn map_dataregistry(r: &DataRegistryRecord) -> (Option<Pids>, DatasetMetadata) {
    let res = &r.resource;
    let metadata = DatasetMetadata {
        asset_type: if res.resource_type.as_deref() == Some("dataset") {
            "Dataset"
        } else {
            "Other"
        }
        .to_string(),
        titles: titles(&[res.title.as_deref()]),
        descriptions: abstract_of(res.abstract_text.as_deref()),
        keywords: keywords(res.keywords.iter().map(|k| k.name.as_str())),
        publication_date: iso_date(res.date.as_deref()),
        language: non_blank(res.language.as_deref()),
        licenses: res
            .license
            .as_ref()
            .and_then(|l| non_blank(l.identifier.as_deref()))
            .map(|code| License {
                license_code: Some(code),
                license_uri: None,
            })
            .into_iter()
            .collect(),
        ..DatasetMetadata::default()
    };
    (doi_pid(res.doi.as_deref()), metadata)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn map(repo: RepositoryType, url: &str, raw: serde_json::Value) -> CanonicalDatasetRecord {
        let payload = SourcePayload::parse(repo, &raw).unwrap();
        DefaultMapper.map(url, &payload, &[], repo).unwrap()
    }

    #[test]
    fn test_zenodo_core_fields() {
        let record = map(
            RepositoryType::Zenodo,
            "https://zenodo.org/api/records/1",
            json!({
                "doi": "10.5281/zenodo.1",
                "links": { "self": "https://zenodo.org/api/records/1" },
                "metadata": {
                    "title": "Soil moisture",
                    "description": "Daily readings",
                    "publication_date": "2021-03-04",
                    "keywords": ["soil", "soil", " "],
                    "license": { "id": "cc-by-4.0" },
                    "resource_type": { "type": "dataset", "title": "Dataset" },
                    "creators": [{ "name": "Rossi, Maria", "orcid": "0000-0001" }]
                }
            }),
        );
        let meta = &record.metadata;
        assert_eq!(record.primary_title(), Some("Soil moisture"));
        assert_eq!(meta.asset_type, "Dataset");
        assert_eq!(meta.keywords.len(), 1);
        assert_eq!(meta.publication_date.as_deref(), Some("2021-03-04"));
        assert_eq!(meta.creators[0].creator_given_name.as_deref(), Some("Maria"));
        assert_eq!(record.pids.as_ref().unwrap().doi.provider, "doi.org");
        assert_eq!(
            meta.external_source_information.external_source_name.as_deref(),
            Some("Zenodo")
        );
        assert_eq!(record.external_source_uri(), Some("https://zenodo.org/api/records/1"));
    }

    #[test]
    fn test_self_link_wins_over_fetched_url() {
        let record = map(
            RepositoryType::B2shareEudat,
            "https://b2share.eudat.eu/api/records/abc?x=1",
            json!({
                "links": { "self": "https://b2share.eudat.eu/api/records/abc" },
                "metadata": { "titles": [{ "title": "Lake data" }] }
            }),
        );
        assert_eq!(
            record.external_source_uri(),
            Some("https://b2share.eudat.eu/api/records/abc")
        );
    }

    #[test]
    fn test_fieldsites_uses_fetched_url_and_timestamp_date() {
        let record = map(
            RepositoryType::Sites,
            "https://meta.fieldsites.se/objects/xyz",
            json!({
                "fileName": "data.csv",
                "submission": { "start": "2022-06-01T10:00:00Z" },
                "references": { "keywords": ["lake"] },
                "specification": { "keywords": ["lake", "temperature"] }
            }),
        );
        assert_eq!(record.primary_title(), Some("data.csv"));
        assert_eq!(record.metadata.publication_date.as_deref(), Some("2022-06-01"));
        assert_eq!(record.metadata.keywords.len(), 2);
        assert_eq!(record.external_source_uri(), Some("https://meta.fieldsites.se/objects/xyz"));
    }

    #[test]
    fn test_dataregistry_resource_fields() {
        let record = map(
            RepositoryType::Dataregistry,
            "https://dataregistry.lteritalia.it/api/1",
            json!({
                "resource": {
                    "title": "Plankton",
                    "abstract": "Counts",
                    "keywords": [{ "name": "plankton" }],
                    "date": "2019-12-31",
                    "resource_type": "dataset",
                    "license": { "identifier": "CC-BY-4.0" },
                    "doi": "https://doi.org/10.1234/abc"
                }
            }),
        );
        assert_eq!(record.metadata.asset_type, "Dataset");
        assert_eq!(record.metadata.licenses[0].license_code.as_deref(), Some("CC-BY-4.0"));
        assert_eq!(record.pids.unwrap().doi.identifier, "10.1234/abc");
    }

    #[test]
    fn test_sites_are_attached() {
        let site = SiteReference {
            site_id: "abc".to_string(),
            site_name: Some("Site".to_string()),
        };
        let payload = SourcePayload::parse(RepositoryType::Zenodo, &json!({})).unwrap();
        let record = DefaultMapper
            .map("https://z/1", &payload, &[site.clone()], RepositoryType::Zenodo)
            .unwrap();
        assert_eq!(record.metadata.site_references, vec![site]);
    }

    #[test]
    fn test_unparseable_dates_are_dropped() {
        assert_eq!(iso_date(Some("yesterday")), None);
        assert_eq!(iso_date(Some("2020-02-30")), None);
        assert_eq!(iso_date(Some("2020-02-03")), Some("2020-02-03".to_string()));
    }
}
