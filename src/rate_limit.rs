//! Per-upstream request throttling.
//!
//! Each upstream family gets one [`RequestScheduler`] with a burst of one, so
//! requests are released no faster than `60000 / requests_per_minute` ms
//! apart no matter how many record tasks are waiting. Schedulers are built
//! once at startup by [`RateLimiters::from_config`] and shared by every run.

use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use harvester_core::models::UpstreamFamily;

use crate::config::Config;

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Minimum-interval scheduler for one upstream.
pub struct RequestScheduler {
    name: String,
    requests_per_minute: u32,
    limiter: DirectLimiter,
}

impl std::fmt::Debug for RequestScheduler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestScheduler")
            .field("name", &self.name)
            .field("requests_per_minute", &self.requests_per_minute)
            .finish()
    }
}

impl RequestScheduler {
    pub fn per_minute(name: &str, requests_per_minute: u32) -> Self {
        let rate = NonZeroU32::new(requests_per_minute.max(1)).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::per_minute(rate).allow_burst(NonZeroU32::MIN);
        Self {
            name: name.to_string(),
            requests_per_minute: rate.get(),
            limiter: RateLimiter::direct(quota),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(60_000 / u64::from(self.requests_per_minute))
    }

    /// Wait for the next release slot.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }
}

/// One scheduler per upstream family plus one for the registry.
#[derive(Debug, Clone)]
pub struct RateLimiters {
    zenodo: Arc<RequestScheduler>,
    b2share_eudat: Arc<RequestScheduler>,
    b2share_juelich: Arc<RequestScheduler>,
    fieldsites: Arc<RequestScheduler>,
    dataregistry: Arc<RequestScheduler>,
    registry: Arc<RequestScheduler>,
}

impl RateLimiters {
    pub fn from_config(config: &Config) -> Self {
        let limits = &config.rate_limits;
        Self {
            zenodo: Arc::new(RequestScheduler::per_minute("zenodo", limits.zenodo)),
            b2share_eudat: Arc::new(RequestScheduler::per_minute(
                "b2share_eudat",
                limits.b2share_eudat,
            )),
            b2share_juelich: Arc::new(RequestScheduler::per_minute(
                "b2share_juelich",
                limits.b2share_juelich,
            )),
            fieldsites: Arc::new(RequestScheduler::per_minute("fieldsites", limits.fieldsites)),
            dataregistry: Arc::new(RequestScheduler::per_minute(
                "dataregistry",
                limits.dataregistry,
            )),
            registry: Arc::new(RequestScheduler::per_minute(
                "registry",
                config.registry.requests_per_minute,
            )),
        }
    }

    pub fn for_family(&self, family: UpstreamFamily) -> Arc<RequestScheduler> {
        match family {
            UpstreamFamily::Zenodo => Arc::clone(&self.zenodo),
            UpstreamFamily::B2shareEudat => Arc::clone(&self.b2share_eudat),
            UpstreamFamily::B2shareJuelich => Arc::clone(&self.b2share_juelich),
            UpstreamFamily::FieldSites => Arc::clone(&self.fieldsites),
            UpstreamFamily::DataRegistry => Arc::clone(&self.dataregistry),
        }
    }

    pub fn registry(&self) -> Arc<RequestScheduler> {
        Arc::clone(&self.registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn test_min_interval_from_rpm() {
        assert_eq!(
            RequestScheduler::per_minute("z", 80).min_interval(),
            Duration::from_millis(750)
        );
        assert_eq!(
            RequestScheduler::per_minute("r", 0).min_interval(),
            Duration::from_secs(60)
        );
    }

    #[tokio::test]
    async fn test_concurrent_callers_are_spaced() {
        let scheduler = Arc::new(RequestScheduler::per_minute("fast", 1200));
        let start = Instant::now();
        let mut handles = Vec::new();
        for _ in 0..4 {
            let s = Arc::clone(&scheduler);
            handles.push(tokio::spawn(async move { s.acquire().await }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // 50ms apart; the first is released immediately.
        assert!(start.elapsed() >= Duration::from_millis(140));
    }
}
