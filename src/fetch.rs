//! Rate-limited, retrying upstream fetch client.
//!
//! Every request first waits on the upstream's [`RequestScheduler`]. HTTP 429
//! is retried up to `max_retries` times with a growing delay (or the server's
//! `Retry-After`, within the same cap), and each retry waits on the scheduler again. Any other
//! failure is logged and reported as `None`: callers treat missing data as
//! "unavailable this pass", never as a reason to abort a run.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use harvester_core::error::HarvestError;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use tracing::{debug, error, warn};

use crate::config::Config;
use crate::rate_limit::RequestScheduler;

/// Source of raw upstream payloads.
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Response body, or `None` when the upstream is unavailable.
    async fn fetch_text(&self, url: &str) -> Option<String>;

    /// Response body parsed as JSON, or `None`.
    async fn fetch_json(&self, url: &str) -> Option<serde_json::Value> {
        let body = self.fetch_text(url).await?;
        match serde_json::from_str(&body) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(url, error = %e, "response is not valid JSON");
                None
            }
        }
    }
}

/// Retry knobs shared by the fetch and registry clients.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_retries: config.harvest.max_retries,
            base_delay: Duration::from_millis(config.harvest.retry_base_delay_ms),
        }
    }

    /// Longest single wait, `base * 2^5`.
    pub fn max_delay(&self) -> Duration {
        self.base_delay * (1u32 << 5)
    }

    /// Delay before retry number `attempt` (1-based): `base * 2^(attempt-1)`,
    /// or `Retry-After` when the server asks for longer. Never more than
    /// [`max_delay`](Self::max_delay).
    pub fn delay(&self, attempt: u32, retry_after: Option<Duration>) -> Duration {
        let backoff = self.base_delay * (1u32 << attempt.saturating_sub(1).min(5));
        match retry_after {
            Some(wait) if wait > backoff => wait.min(self.max_delay()),
            _ => backoff,
        }
    }
}

pub(crate) fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

pub(crate) fn http_client(config: &Config) -> anyhow::Result<reqwest::Client> {
    Ok(reqwest::Client::builder()
        .timeout(Duration::from_secs(config.harvest.timeout_secs))
        .user_agent(concat!("dataset-harvester/", env!("CARGO_PKG_VERSION")))
        .build()?)
}

/// [`Fetcher`] over HTTP for one upstream family.
pub struct HttpFetcher {
    client: reqwest::Client,
    scheduler: Option<Arc<RequestScheduler>>,
    retry: RetryPolicy,
    bearer: Option<String>,
}

impl HttpFetcher {
    pub fn new(client: reqwest::Client, scheduler: Arc<RequestScheduler>, retry: RetryPolicy) -> Self {
        Self {
            client,
            scheduler: Some(scheduler),
            retry,
            bearer: None,
        }
    }

    /// A fetcher that is not throttled, for one-off lookups.
    pub fn unthrottled(client: reqwest::Client, retry: RetryPolicy) -> Self {
        Self {
            client,
            scheduler: None,
            retry,
            bearer: None,
        }
    }

    pub fn with_bearer(mut self, token: Option<String>) -> Self {
        self.bearer = token;
        self
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch_text(&self, url: &str) -> Option<String> {
        for attempt in 0..=self.retry.max_retries {
            if let Some(scheduler) = &self.scheduler {
                scheduler.acquire().await;
            }

            let mut request = self.client.get(url);
            if let Some(token) = &self.bearer {
                request = request.bearer_auth(token);
            }

            let response = match request.send().await {
                Ok(response) => response,
                Err(e) => {
                    let err = HarvestError::Network {
                        url: url.to_string(),
                        reason: e.to_string(),
                    };
                    warn!(url, error = %err, "fetch failed");
                    return None;
                }
            };

            let status = response.status();
            if status.is_success() {
                debug!(url, attempt, "fetched");
                return match response.text().await {
                    Ok(body) => Some(body),
                    Err(e) => {
                        warn!(url, error = %e, "failed to read response body");
                        None
                    }
                };
            }

            if status == StatusCode::TOO_MANY_REQUESTS && attempt < self.retry.max_retries {
                let delay = self.retry.delay(attempt + 1, retry_after(response.headers()));
                warn!(
                    url,
                    status = status.as_u16(),
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "rate limited, retrying"
                );
                tokio::time::sleep(delay).await;
                continue;
            }

            error!(url, status = status.as_u16(), "fetch gave up");
            return None;
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    fn policy(base_ms: u64) -> RetryPolicy {
        RetryPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(base_ms),
        }
    }

    #[test]
    fn test_delay_grows_and_caps() {
        let p = policy(10);
        assert_eq!(p.delay(1, None), Duration::from_millis(10));
        assert_eq!(p.delay(2, None), Duration::from_millis(20));
        assert_eq!(p.delay(4, None), Duration::from_millis(80));
        assert_eq!(p.delay(9, None), Duration::from_millis(320));
        assert_eq!(p.delay(1, Some(Duration::from_millis(150))), Duration::from_millis(150));
        assert_eq!(p.delay(3, Some(Duration::from_millis(5))), Duration::from_millis(40));
    }

    #[test]
    fn test_retry_after_is_capped() {
        let p = policy(10);
        assert_eq!(p.delay(1, Some(Duration::from_secs(86_400))), p.max_delay());
        assert_eq!(p.max_delay(), Duration::from_millis(320));
    }

    /// Serves the given (status, body) responses in order, one per connection.
    async fn serve(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            for (status, body) in responses {
                let (mut socket, _) = listener.accept().await.unwrap();
                let mut buf = [0u8; 4096];
                let _ = socket.read(&mut buf).await;
                let reply = format!(
                    "HTTP/1.1 {} X\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    status,
                    body.len(),
                    body
                );
                socket.write_all(reply.as_bytes()).await.unwrap();
                let _ = socket.shutdown().await;
            }
        });
        format!("http://{}/record", addr)
    }

    #[tokio::test]
    async fn test_retries_429_then_succeeds() {
        let url = serve(vec![(429, ""), (429, ""), (200, r#"{"id": 7}"#)]).await;
        let fetcher = HttpFetcher::unthrottled(reqwest::Client::new(), policy(1));
        let json = fetcher.fetch_json(&url).await;
        assert_eq!(json, Some(serde_json::json!({"id": 7})));
    }

    #[tokio::test]
    async fn test_other_errors_yield_none() {
        let url = serve(vec![(404, "gone")]).await;
        let fetcher = HttpFetcher::unthrottled(reqwest::Client::new(), policy(1));
        assert_eq!(fetcher.fetch_text(&url).await, None);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_retries() {
        let url = serve(vec![(429, ""), (429, ""), (429, "")]).await;
        let fetcher = HttpFetcher::unthrottled(
            reqwest::Client::new(),
            RetryPolicy {
                max_retries: 2,
                base_delay: Duration::from_millis(1),
            },
        );
        assert_eq!(fetcher.fetch_text(&url).await, None);
    }
}
