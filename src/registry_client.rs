//! HTTP client for the asset registry.
//!
//! Endpoints, relative to `registry.api_url`:
//!
//! | Operation | Request |
//! |-----------|---------|
//! | find      | `GET /external-datasets?q=&metadata_externalSourceInformation_externalSourceURI=<url>` |
//! | create    | `POST /external-datasets`, returns `{ "id" }` |
//! | update    | `PUT /external-datasets/<id>` |
//! | delete    | `DELETE /external-datasets/<id>` |
//! | list      | `GET <registry_query>`, then `links.next` until absent |
//!
//! Every request waits on the registry scheduler and retries HTTP 429 like
//! the upstream fetch client.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use harvester_core::dataset::CanonicalDatasetRecord;
use harvester_core::error::HarvestError;
use harvester_core::models::RepositoryType;
use harvester_core::registry::Registry;
use reqwest::{Method, RequestBuilder, Response, StatusCode, Url};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::fetch::{http_client, retry_after, RetryPolicy};
use crate::payload::SearchPage;
use crate::rate_limit::RequestScheduler;

#[derive(Debug, Deserialize)]
struct RegistryHit {
    id: String,
}

#[derive(Debug, Deserialize)]
struct Created {
    id: String,
}

pub struct HttpRegistry {
    client: reqwest::Client,
    api_url: String,
    scheduler: Arc<RequestScheduler>,
    retry: RetryPolicy,
    token: Option<String>,
    queries: BTreeMap<RepositoryType, String>,
}

impl HttpRegistry {
    pub fn new(
        client: reqwest::Client,
        api_url: &str,
        scheduler: Arc<RequestScheduler>,
        retry: RetryPolicy,
        token: Option<String>,
    ) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
            scheduler,
            retry,
            token,
            queries: BTreeMap::new(),
        }
    }

    /// Build from config. The auth token is read from the configured
    /// environment variable; a missing token only warns, since read-only
    /// registries accept anonymous lookups.
    pub fn from_config(config: &Config, scheduler: Arc<RequestScheduler>) -> Result<Self> {
        let token = std::env::var(&config.registry.auth_token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        if token.is_none() {
            warn!(
                env = %config.registry.auth_token_env,
                "registry auth token not set, writes will likely be rejected"
            );
        }
        let mut registry = Self::new(
            http_client(config)?,
            &config.registry.api_url,
            scheduler,
            RetryPolicy::from_config(config),
            token,
        );
        for repository in config.repository_types() {
            if let Some(query) = config
                .repository(repository)?
                .registry_query
                .as_deref()
                .filter(|q| !q.is_empty())
            {
                registry.queries.insert(repository, query.to_string());
            }
        }
        Ok(registry)
    }

    pub fn with_query(mut self, repository: RepositoryType, query: &str) -> Self {
        self.queries.insert(repository, query.to_string());
        self
    }

    fn collection_url(&self) -> String {
        format!("{}/external-datasets", self.api_url)
    }

    fn item_url(&self, registry_id: &str) -> String {
        format!("{}/external-datasets/{}", self.api_url, registry_id)
    }

    fn search_url(&self, source_url: &str) -> Result<Url> {
        let mut url = Url::parse(&self.collection_url())
            .with_context(|| format!("invalid registry url {}", self.api_url))?;
        url.query_pairs_mut()
            .append_pair("q", "")
            .append_pair("metadata_externalSourceInformation_externalSourceURI", source_url);
        Ok(url)
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let mut request = self
            .client
            .request(method, url)
            .header(reqwest::header::ACCEPT, "application/json");
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        request
    }

    /// Send with throttling and 429 retries. Non-success statuses other than
    /// 429 are returned to the caller.
    async fn send(&self, build: impl Fn() -> RequestBuilder) -> Result<Response> {
        for attempt in 0..=self.retry.max_retries {
            self.scheduler.acquire().await;
            let response = build().send().await.context("registry request failed")?;
            if response.status() == StatusCode::TOO_MANY_REQUESTS
                && attempt < self.retry.max_retries
            {
                let delay = self.retry.delay(attempt + 1, retry_after(response.headers()));
                warn!(
                    url = %response.url(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "registry rate limited, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }
            return Ok(response);
        }
        bail!("registry rate limit retries exhausted")
    }

    async fn write(
        &self,
        operation: &'static str,
        target: &str,
        build: impl Fn() -> RequestBuilder,
    ) -> Result<Response> {
        let response = self.send(build).await.map_err(|e| HarvestError::RegistryWrite {
            operation,
            target: target.to_string(),
            reason: e.to_string(),
        })?;
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response
            .text()
            .await
            .unwrap_or_else(|_| "could not read error response".to_string());
        Err(HarvestError::RegistryWrite {
            operation,
            target: target.to_string(),
            reason: format!("{}: {}", status.as_u16(), body),
        }
        .into())
    }
}

#[async_trait]
impl Registry for HttpRegistry {
    async fn find_by_source_url(&self, source_url: &str) -> Result<Option<String>> {
        let url = self.search_url(source_url)?;
        let response = self
            .send(|| self.request(Method::GET, url.as_str()))
            .await?;
        let status = response.status();
        if !status.is_success() {
            bail!("registry search for {} returned {}", source_url, status.as_u16());
        }
        let page: SearchPage<RegistryHit> = response
            .json()
            .await
            .context("registry search response is malformed")?;
        Ok(page.hits.hits.into_iter().next().map(|hit| hit.id))
    }

    async fn create(&self, record: &CanonicalDatasetRecord) -> Result<String> {
        let url = self.collection_url();
        let target = record.external_source_uri().unwrap_or(&url).to_string();
        let response = self
            .write("create", &target, || {
                self.request(Method::POST, &url).json(record)
            })
            .await?;
        let created: Created = response
            .json()
            .await
            .context("registry create response carries no id")?;
        info!(source_url = %target, registry_id = %created.id, "created registry record");
        Ok(created.id)
    }

    async fn update(&self, registry_id: &str, record: &CanonicalDatasetRecord) -> Result<()> {
        let url = self.item_url(registry_id);
        self.write("update", registry_id, || {
            self.request(Method::PUT, &url).json(record)
        })
        .await?;
        info!(registry_id, "updated registry record");
        Ok(())
    }

    async fn delete(&self, registry_ids: &[String]) -> Result<Vec<String>> {
        let mut failed = Vec::new();
        for registry_id in registry_ids {
            let url = self.item_url(registry_id);
            match self
                .write("delete", registry_id, || self.request(Method::DELETE, &url))
                .await
            {
                Ok(_) => debug!(registry_id = %registry_id, "deleted registry record"),
                Err(e) => {
                    warn!(registry_id = %registry_id, error = %e, "registry delete failed");
                    failed.push(registry_id.clone());
                }
            }
        }
        Ok(failed)
    }

    async fn list_by_repository(&self, repository: RepositoryType) -> Result<Vec<String>> {
        let Some(first) = self.queries.get(&repository) else {
            bail!("repositories.{}.registry_query is not configured", repository);
        };
        let mut ids = Vec::new();
        let mut visited = HashSet::new();
        let mut next = Some(first.clone());
        while let Some(url) = next.take() {
            if !visited.insert(url.clone()) {
                warn!(url = %url, "registry listing links back to a visited page");
                break;
            }
            info!(url = %url, "fetching registry listing page");
            let response = self.send(|| self.request(Method::GET, &url)).await?;
            let status = response.status();
            if !status.is_success() {
                bail!("registry listing {} returned {}", url, status.as_u16());
            }
            let page: SearchPage<RegistryHit> = response
                .json()
                .await
                .with_context(|| format!("registry listing {} is malformed", url))?;
            ids.extend(page.hits.hits.into_iter().map(|hit| hit.id));
            next = page.links.next.filter(|n| !n.is_empty());
        }
        Ok(ids)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    /// Reads one full request, body included, so the socket is drained
    /// before the reply closes it.
    async fn read_request(socket: &mut TcpStream) -> String {
        let mut data = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = socket.read(&mut buf).await.unwrap_or(0);
            if n == 0 {
                break;
            }
            data.extend_from_slice(&buf[..n]);
            if let Some(end) = data.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&data[..end]).to_ascii_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|l| l.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                if data.len() >= end + 4 + body_len {
                    break;
                }
            }
        }
        String::from_utf8_lossy(&data).to_string()
    }

    /// Serves canned responses in order and hands back each raw request.
    async fn serve(
        responses: Vec<(u16, String)>,
    ) -> (String, tokio::sync::mpsc::UnboundedReceiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let _ = tx.send(read_request(&mut socket).await);
                let reply = format!(
                    "HTTP/1.1 {} X\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        (format!("http://{}/api", addr), rx)
    }

    fn registry(api: &str) -> HttpRegistry {
        HttpRegistry::new(
            reqwest::Client::new(),
            api,
            Arc::new(RequestScheduler::per_minute("registry", 60_000)),
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            },
            Some("secret".to_string()),
        )
    }

    #[tokio::test]
    async fn test_find_encodes_source_url() {
        let (api, mut requests) =
            serve(vec![(200, r#"{"hits":{"hits":[{"id":"abc"}]}}"#.to_string())]).await;
        let found = registry(&api)
            .find_by_source_url("https://zenodo.org/api/records/1?x=1")
            .await
            .unwrap();
        assert_eq!(found.as_deref(), Some("abc"));
        let request = requests.recv().await.unwrap();
        assert!(request.contains(
            "metadata_externalSourceInformation_externalSourceURI=https%3A%2F%2Fzenodo.org%2Fapi%2Frecords%2F1%3Fx%3D1"
        ));
        assert!(request.to_ascii_lowercase().contains("authorization: bearer secret"));
    }

    #[tokio::test]
    async fn test_find_without_hits_is_none() {
        let (api, _requests) = serve(vec![(200, r#"{"hits":{"hits":[]}}"#.to_string())]).await;
        assert_eq!(registry(&api).find_by_source_url("u").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_create_retries_429_and_returns_id() {
        let (api, _requests) =
            serve(vec![(429, String::new()), (201, r#"{"id":"new-1"}"#.to_string())]).await;
        let record: CanonicalDatasetRecord = serde_json::from_value(serde_json::json!({
            "metadata": { "assetType": "Dataset", "externalSourceInformation": {} }
        }))
        .unwrap();
        assert_eq!(registry(&api).create(&record).await.unwrap(), "new-1");
    }

    #[tokio::test]
    async fn test_failed_write_is_registry_write_error() {
        let (api, _requests) = serve(vec![(500, "boom".to_string())]).await;
        let record: CanonicalDatasetRecord = serde_json::from_value(serde_json::json!({
            "metadata": { "assetType": "Dataset", "externalSourceInformation": {} }
        }))
        .unwrap();
        let err = registry(&api).update("abc", &record).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarvestError>(),
            Some(HarvestError::RegistryWrite { operation: "update", .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_reports_failures_per_id() {
        let (api, _requests) = serve(vec![(204, String::new()), (404, String::new())]).await;
        let failed = registry(&api)
            .delete(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(failed, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_listing_follows_next_links() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        let page2 = format!("{}/api/external-datasets?page=2", base);
        let bodies = vec![
            format!(r#"{{"hits":{{"hits":[{{"id":"a"}},{{"id":"b"}}]}},"links":{{"next":"{}"}}}}"#, page2),
            r#"{"hits":{"hits":[{"id":"c"}]},"links":{}}"#.to_string(),
        ];
        tokio::spawn(async move {
            for body in bodies {
                let (mut socket, _) = listener.accept().await.unwrap();
                read_request(&mut socket).await;
                let reply = format!(
                    "HTTP/1.1 200 OK\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        let client = registry(&format!("{}/api", base)).with_query(
            RepositoryType::Zenodo,
            &format!("{}/api/external-datasets?page=1", base),
        );
        let ids = client.list_by_repository(RepositoryType::Zenodo).await.unwrap();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert!(client.list_by_repository(RepositoryType::Sites).await.is_err());
    }
}
