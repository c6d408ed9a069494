//! Latest-version resolution.
//!
//! Upstreams publish every version of a dataset under its own URL. Before a
//! payload is mapped, [`resolve_latest_version`] chases it to the latest
//! version and collects version relations for the older siblings, so a
//! migrated dataset keeps a single registry entry. Resolution never fails a
//! record: any fetch or parse problem falls back to the payload as fetched,
//! with no relations.

use harvester_core::dataset::{RelatedIdentifier, IS_NEW_VERSION_OF, IS_PREVIOUS_VERSION_OF};
use harvester_core::models::{RepositoryType, UpstreamFamily};
use serde_json::Value;
use tracing::{debug, warn};

use crate::fetch::Fetcher;
use crate::payload::{
    B2ShareRecord, B2ShareVersions, FieldSitesRecord, SearchPage, ZenodoRecord,
};

/// Result of chasing a payload to its latest version.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// URL of the latest version, or the input URL.
    pub url: String,
    pub payload: Value,
    pub relations: Vec<RelatedIdentifier>,
}

impl Resolution {
    fn unchanged(url: &str, payload: Value) -> Self {
        Self {
            url: url.to_string(),
            payload,
            relations: Vec::new(),
        }
    }

    /// True when the resolver moved to a different version.
    pub fn redirected(&self, from: &str) -> bool {
        self.url != from
    }
}

pub async fn resolve_latest_version(
    fetcher: &dyn Fetcher,
    repository: RepositoryType,
    url: &str,
    payload: Value,
) -> Resolution {
    let resolved = match repository.family() {
        UpstreamFamily::Zenodo => resolve_zenodo(fetcher, url, &payload).await,
        UpstreamFamily::B2shareEudat | UpstreamFamily::B2shareJuelich => {
            resolve_b2share(fetcher, url, &payload).await
        }
        UpstreamFamily::FieldSites => resolve_fieldsites(fetcher, url, &payload).await,
        UpstreamFamily::DataRegistry => None,
    };
    match resolved {
        Some(resolution) => {
            if resolution.redirected(url) {
                debug!(from = url, to = %resolution.url, "resolved to latest version");
            }
            resolution
        }
        None => Resolution::unchanged(url, payload),
    }
}

async fn resolve_zenodo(fetcher: &dyn Fetcher, url: &str, payload: &Value) -> Option<Resolution> {
    let record: ZenodoRecord = serde_json::from_value(payload.clone()).ok()?;
    let versions_url = match (&record.links.versions, record.is_last_version()) {
        (Some(versions_url), false) => versions_url,
        _ => return Some(Resolution::unchanged(url, payload.clone())),
    };

    let listing = fetcher.fetch_json(versions_url).await?;
    let page: SearchPage<ZenodoRecord> = match serde_json::from_value(listing) {
        Ok(page) => page,
        Err(e) => {
            warn!(url = %versions_url, error = %e, "unexpected Zenodo versions listing");
            return None;
        }
    };

    let latest = page.hits.hits.iter().find(|hit| hit.is_last_version())?;
    let latest_url = latest.links.self_url.clone()?;
    let relations = page
        .hits
        .hits
        .iter()
        .filter(|hit| !hit.is_last_version())
        .filter_map(|hit| hit.links.self_url.as_deref())
        .map(|sibling| RelatedIdentifier::version_link(sibling, IS_NEW_VERSION_OF))
        .collect();

    let latest_payload = if latest_url == url {
        payload.clone()
    } else {
        fetcher.fetch_json(&latest_url).await?
    };
    Some(Resolution {
        url: latest_url,
        payload: latest_payload,
        relations,
    })
}

async fn resolve_b2share(fetcher: &dyn Fetcher, url: &str, payload: &Value) -> Option<Resolution> {
    let record: B2ShareRecord = serde_json::from_value(payload.clone()).ok()?;
    let Some(versions_url) = record.links.versions.as_deref() else {
        return Some(Resolution::unchanged(url, payload.clone()));
    };
    let record_id = record.id.clone().unwrap_or_default();

    let listing = fetcher.fetch_json(versions_url).await?;
    let versions: B2ShareVersions = match serde_json::from_value(listing) {
        Ok(versions) => versions,
        Err(e) => {
            warn!(url = %versions_url, error = %e, "unexpected B2Share versions listing");
            return None;
        }
    };

    let (latest_id, latest_url, relations) = match versions {
        B2ShareVersions::Legacy { versions } => {
            let latest = versions.iter().max_by_key(|v| v.version)?;
            let relations = versions
                .iter()
                .filter(|v| v.id != latest.id)
                .map(|v| {
                    let relation = if v.version < latest.version {
                        IS_NEW_VERSION_OF
                    } else {
                        IS_PREVIOUS_VERSION_OF
                    };
                    RelatedIdentifier::version_link(&v.url, relation)
                })
                .collect();
            (latest.id.clone(), latest.url.clone(), relations)
        }
        B2ShareVersions::Search { hits } => {
            let latest = hits.hits.iter().find(|hit| hit.versions.is_latest)?;
            let relations = hits
                .hits
                .iter()
                .filter(|hit| !hit.versions.is_latest)
                .filter_map(|hit| hit.links.self_url.as_deref())
                .map(|sibling| RelatedIdentifier::version_link(sibling, IS_NEW_VERSION_OF))
                .collect();
            (
                latest.id.clone(),
                latest.links.self_url.clone()?,
                relations,
            )
        }
    };

    if latest_id == record_id {
        return Some(Resolution {
            url: url.to_string(),
            payload: payload.clone(),
            relations,
        });
    }
    let latest_payload = fetcher.fetch_json(&latest_url).await?;
    Some(Resolution {
        url: latest_url,
        payload: latest_payload,
        relations,
    })
}

async fn resolve_fieldsites(
    fetcher: &dyn Fetcher,
    url: &str,
    payload: &Value,
) -> Option<Resolution> {
    let record: FieldSitesRecord = serde_json::from_value(payload.clone()).ok()?;
    let mut relations: Vec<RelatedIdentifier> = record
        .previous_versions()
        .iter()
        .map(|prev| RelatedIdentifier::version_link(prev, IS_NEW_VERSION_OF))
        .collect();

    match record.latest_version.as_deref().filter(|l| !l.is_empty()) {
        Some(latest) if latest != url => {
            relations.push(RelatedIdentifier::version_link(url, IS_NEW_VERSION_OF));
            let latest_payload = fetcher.fetch_json(latest).await?;
            Some(Resolution {
                url: latest.to_string(),
                payload: latest_payload,
                relations,
            })
        }
        _ => Some(Resolution {
            url: url.to_string(),
            payload: payload.clone(),
            relations,
        }),
    }
}
