//! Known research sites and matching them inside payloads.
//!
//! The catalogue is the DEIMS site listing: `[{ "title", "id": { "suffix" } }]`.
//! A payload references a site when the site's id suffix occurs anywhere in
//! its serialized JSON as a whole word, ignoring case.

use anyhow::{Context, Result};
use harvester_core::dataset::SiteReference;
use regex::{Regex, RegexBuilder};
use serde::Deserialize;
use serde_json::Value;
use tracing::{info, warn};

use crate::fetch::Fetcher;

#[derive(Debug, Deserialize)]
struct DeimsSite {
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    id: Option<DeimsId>,
}

#[derive(Debug, Deserialize)]
struct DeimsId {
    #[serde(default)]
    suffix: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SiteCatalogue {
    sites: Vec<SiteReference>,
    pattern: Option<Regex>,
}

impl SiteCatalogue {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(sites: Vec<SiteReference>) -> Result<Self> {
        let alternatives: Vec<String> = sites
            .iter()
            .map(|s| regex::escape(&s.site_id))
            .filter(|s| !s.is_empty())
            .collect();
        let pattern = if alternatives.is_empty() {
            None
        } else {
            Some(
                RegexBuilder::new(&format!(r"\b(?:{})\b", alternatives.join("|")))
                    .case_insensitive(true)
                    .build()
                    .context("failed to build site pattern")?,
            )
        };
        Ok(Self { sites, pattern })
    }

    /// Parse a DEIMS site listing. Entries without an id suffix are ignored.
    pub fn from_deims(listing: &Value) -> Result<Self> {
        let entries: Vec<DeimsSite> =
            serde_json::from_value(listing.clone()).context("site listing is not an array")?;
        let sites = entries
            .into_iter()
            .filter_map(|entry| {
                let suffix = entry.id?.suffix?;
                Some(SiteReference {
                    site_id: suffix,
                    site_name: entry.title,
                })
            })
            .collect();
        Self::new(sites)
    }

    /// Fetch the catalogue. An unreachable or malformed listing yields an
    /// empty catalogue, so harvesting proceeds without site references.
    pub async fn load(fetcher: &dyn Fetcher, url: &str) -> Self {
        let Some(listing) = fetcher.fetch_json(url).await else {
            warn!(url, "site listing unavailable, matching no sites");
            return Self::empty();
        };
        match Self::from_deims(&listing) {
            Ok(catalogue) => {
                info!(url, sites = catalogue.len(), "loaded site catalogue");
                catalogue
            }
            Err(e) => {
                warn!(url, error = %e, "site listing malformed, matching no sites");
                Self::empty()
            }
        }
    }

    pub fn len(&self) -> usize {
        self.sites.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sites.is_empty()
    }

    /// Sites referenced by `payload`, in catalogue order.
    pub fn match_payload(&self, payload: &Value) -> Vec<SiteReference> {
        let Some(pattern) = &self.pattern else {
            return Vec::new();
        };
        let text = payload.to_string();
        let found: Vec<String> = pattern
            .find_iter(&text)
            .map(|m| m.as_str().to_ascii_lowercase())
            .collect();
        if found.is_empty() {
            return Vec::new();
        }
        self.sites
            .iter()
            .filter(|site| found.contains(&site.site_id.to_ascii_lowercase()))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn catalogue() -> SiteCatalogue {
        SiteCatalogue::from_deims(&json!([
            { "title": "Lake Maggiore", "id": { "prefix": "https://deims.org/", "suffix": "f30007c4-8a6e-4f11-ab87-569db54638fe" } },
            { "title": "Abisko", "id": { "prefix": "https://deims.org/", "suffix": "d1e5a3f2-0000-4bbb-9ccc-123456789abc" } },
            { "title": "No id" }
        ]))
        .unwrap()
    }

    #[test]
    fn test_entries_without_suffix_are_skipped() {
        assert_eq!(catalogue().len(), 2);
    }

    #[test]
    fn test_matches_anywhere_ignoring_case() {
        let payload = json!({
            "metadata": { "description": "Sampled at https://deims.org/F30007C4-8A6E-4F11-AB87-569DB54638FE." }
        });
        let matched = catalogue().match_payload(&payload);
        assert_eq!(
            matched,
            vec![SiteReference {
                site_id: "f30007c4-8a6e-4f11-ab87-569db54638fe".to_string(),
                site_name: Some("Lake Maggiore".to_string()),
            }]
        );
    }

    #[test]
    fn test_requires_word_boundary() {
        let payload = json!({ "id": "xd1e5a3f2-0000-4bbb-9ccc-123456789abcx" });
        assert!(catalogue().match_payload(&payload).is_empty());
    }

    #[test]
    fn test_empty_catalogue_matches_nothing() {
        assert!(SiteCatalogue::empty().match_payload(&json!({"a": "b"})).is_empty());
    }
}
