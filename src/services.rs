//! Process-wide wiring.
//!
//! [`Services`] is built once at startup and owns everything that outlives a
//! single run: the store, the registry client, the per-upstream rate
//! limiters and the site catalogue. Runs get a fresh [`HarvestContext`] from
//! [`Services::context`].

use std::sync::Arc;

use anyhow::Result;
use harvester_core::models::RepositoryType;
use harvester_core::registry::Registry;
use harvester_core::store::Store;
use tracing::warn;

use crate::config::Config;
use crate::fetch::{http_client, Fetcher, HttpFetcher, RetryPolicy};
use crate::harvest::HarvestContext;
use crate::mapper::{DefaultMapper, Mapper};
use crate::rate_limit::RateLimiters;
use crate::registry_client::HttpRegistry;
use crate::sites::SiteCatalogue;

enum Upstreams {
    /// Real HTTP, throttled per upstream family.
    Http {
        client: reqwest::Client,
        limiters: RateLimiters,
        retry: RetryPolicy,
    },
    /// One fetcher for every repository.
    Fixed(Arc<dyn Fetcher>),
}

pub struct Services {
    pub config: Config,
    pub store: Arc<dyn Store>,
    pub registry: Arc<dyn Registry>,
    mapper: Arc<dyn Mapper>,
    sites: Arc<SiteCatalogue>,
    upstreams: Upstreams,
}

impl Services {
    /// Build HTTP clients and limiters from config and load the site catalogue.
    pub async fn from_config(config: Config, store: Arc<dyn Store>) -> Result<Self> {
        let limiters = RateLimiters::from_config(&config);
        let client = http_client(&config)?;
        let retry = RetryPolicy::from_config(&config);
        let registry: Arc<dyn Registry> =
            Arc::new(HttpRegistry::from_config(&config, limiters.registry())?);

        let sites = match config.harvest.sites_url.as_deref() {
            Some(url) => {
                let fetcher = HttpFetcher::unthrottled(client.clone(), retry.clone());
                SiteCatalogue::load(&fetcher, url).await
            }
            None => SiteCatalogue::empty(),
        };

        Ok(Self {
            config,
            store,
            registry,
            mapper: Arc::new(DefaultMapper),
            sites: Arc::new(sites),
            upstreams: Upstreams::Http {
                client,
                limiters,
                retry,
            },
        })
    }

    /// Wire explicit collaborators, bypassing HTTP entirely.
    pub fn with_fetcher(
        config: Config,
        store: Arc<dyn Store>,
        registry: Arc<dyn Registry>,
        fetcher: Arc<dyn Fetcher>,
    ) -> Self {
        Self {
            config,
            store,
            registry,
            mapper: Arc::new(DefaultMapper),
            sites: Arc::new(SiteCatalogue::empty()),
            upstreams: Upstreams::Fixed(fetcher),
        }
    }

    pub fn with_sites(mut self, sites: SiteCatalogue) -> Self {
        self.sites = Arc::new(sites);
        self
    }

    pub fn with_mapper(mut self, mapper: Arc<dyn Mapper>) -> Self {
        self.mapper = mapper;
        self
    }

    fn fetcher_for(&self, repository: RepositoryType) -> Result<Arc<dyn Fetcher>> {
        match &self.upstreams {
            Upstreams::Fixed(fetcher) => Ok(Arc::clone(fetcher)),
            Upstreams::Http {
                client,
                limiters,
                retry,
            } => {
                let token = match self.config.repository(repository)?.auth_token_env.as_deref() {
                    Some(var) => {
                        let token = std::env::var(var).ok().filter(|t| !t.is_empty());
                        if token.is_none() {
                            warn!(env = var, repository = %repository, "upstream token not set");
                        }
                        token
                    }
                    None => None,
                };
                let fetcher = HttpFetcher::new(
                    client.clone(),
                    limiters.for_family(repository.family()),
                    retry.clone(),
                )
                .with_bearer(token);
                Ok(Arc::new(fetcher))
            }
        }
    }

    /// A fresh run context for `repository`.
    pub fn context(&self, repository: RepositoryType, must_verify: bool) -> Result<Arc<HarvestContext>> {
        let repo_config = self.config.repository(repository)?.clone();
        Ok(Arc::new(HarvestContext::new(
            Arc::clone(&self.store),
            Arc::clone(&self.registry),
            self.fetcher_for(repository)?,
            Arc::clone(&self.mapper),
            Arc::clone(&self.sites),
            repository,
            repo_config,
            must_verify,
            self.config.harvest.cleanup_days_threshold,
        )))
    }
}
