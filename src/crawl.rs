//! Remote listing: paged JSON APIs and XML sitemaps.

use anyhow::{Context, Result};
use quick_xml::events::Event;
use serde_json::Value;
use tracing::{info, warn};

use crate::config::RepositoryConfig;
use crate::fetch::Fetcher;
use crate::payload::nested;

/// URL of listing page `page` (1-based).
pub fn page_url(api_url: &str, page_size: u32, page: u32) -> String {
    let sep = if api_url.contains('?') { '&' } else { '?' };
    format!("{}{}size={}&page={}", api_url, sep, page_size, page)
}

/// Self URLs of the items on one listing page. Items without a string at
/// `self_link_key` are skipped.
pub fn item_urls(page: &Value, data_key: &str, self_link_key: &str) -> Vec<String> {
    let Some(items) = nested(page, data_key).and_then(Value::as_array) else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| nested(item, self_link_key).and_then(Value::as_str))
        .filter(|url| !url.is_empty())
        .map(str::to_string)
        .collect()
}

/// One page of a paged listing.
#[derive(Debug, Clone, PartialEq)]
pub struct ListingPage {
    pub urls: Vec<String>,
    /// Number of items the page held, including ones without a self link.
    pub item_count: usize,
}

impl ListingPage {
    /// Whether a following page may exist.
    pub fn has_more(&self, page_size: u32) -> bool {
        self.item_count > 0 && self.item_count >= page_size as usize
    }
}

/// Fetch listing page `page`. `None` when the page is unavailable.
pub async fn fetch_page(
    fetcher: &dyn Fetcher,
    repo: &RepositoryConfig,
    page: u32,
) -> Option<ListingPage> {
    let page_size = repo.page_size?;
    let data_key = repo.data_key.as_deref()?;
    let self_link_key = repo.self_link_key.as_deref()?;

    let url = page_url(&repo.api_url, page_size, page);
    info!(url = %url, "fetching listing page");
    let body = fetcher.fetch_json(&url).await?;
    let item_count = nested(&body, data_key)
        .and_then(Value::as_array)
        .map_or(0, Vec::len);
    let urls = item_urls(&body, data_key, self_link_key);
    if urls.len() < item_count {
        warn!(
            url = %url,
            missing = item_count - urls.len(),
            "listing items without a self link"
        );
    }
    Some(ListingPage { urls, item_count })
}

/// Text of every `<loc>` element in a sitemap.
pub fn sitemap_urls(xml: &str) -> Result<Vec<String>> {
    let mut reader = quick_xml::Reader::from_str(xml);
    reader.config_mut().trim_text(true);
    let mut urls = Vec::new();
    let mut in_loc = false;
    loop {
        match reader.read_event().context("malformed sitemap")? {
            Event::Start(e) if e.local_name().as_ref() == b"loc" => in_loc = true,
            Event::End(e) if e.local_name().as_ref() == b"loc" => in_loc = false,
            Event::Text(text) if in_loc => {
                let url = text.unescape().context("malformed sitemap text")?;
                if !url.is_empty() {
                    urls.push(url.into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }
    Ok(urls)
}

/// Fetch and parse a sitemap. `None` when unavailable or malformed.
pub async fn fetch_sitemap(fetcher: &dyn Fetcher, url: &str) -> Option<Vec<String>> {
    info!(url, "fetching sitemap");
    let body = fetcher.fetch_text(url).await?;
    match sitemap_urls(&body) {
        Ok(urls) => Some(urls),
        Err(e) => {
            warn!(url, error = %e, "failed to parse sitemap");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_page_url_separator() {
        assert_eq!(
            page_url("https://zenodo.org/api/records?q=", 100, 2),
            "https://zenodo.org/api/records?q=&size=100&page=2"
        );
        assert_eq!(
            page_url("https://dr.example/api/records", 10, 1),
            "https://dr.example/api/records?size=10&page=1"
        );
    }

    #[test]
    fn test_item_urls_dotted_keys() {
        let page = json!({
            "hits": { "hits": [
                { "links": { "self": "https://z/1" } },
                { "links": {} },
                { "links": { "self": "https://z/2" } }
            ] }
        });
        assert_eq!(item_urls(&page, "hits.hits", "links.self"), vec!["https://z/1", "https://z/2"]);
        assert!(item_urls(&page, "data", "links.self").is_empty());
    }

    #[test]
    fn test_last_page_detection() {
        let full = ListingPage { urls: vec![], item_count: 10 };
        let short = ListingPage { urls: vec![], item_count: 3 };
        let empty = ListingPage { urls: vec![], item_count: 0 };
        assert!(full.has_more(10));
        assert!(!short.has_more(10));
        assert!(!empty.has_more(10));
    }

    #[test]
    fn test_sitemap_locs() {
        let xml = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">
  <url><loc>https://meta.fieldsites.se/objects/a</loc><lastmod>2024-01-01</lastmod></url>
  <url><loc> https://meta.fieldsites.se/objects/b?x=1&amp;y=2 </loc></url>
</urlset>"#;
        assert_eq!(
            sitemap_urls(xml).unwrap(),
            vec![
                "https://meta.fieldsites.se/objects/a",
                "https://meta.fieldsites.se/objects/b?x=1&y=2"
            ]
        );
    }

    #[test]
    fn test_malformed_sitemap_is_error() {
        assert!(sitemap_urls("<urlset><url><loc>a</url></urlset>").is_err());
    }
}
