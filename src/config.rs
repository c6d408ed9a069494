use anyhow::{Context, Result};
use harvester_core::models::{RepositoryType, UpstreamFamily};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    pub registry: RegistryConfig,
    #[serde(default)]
    pub harvest: HarvestConfig,
    #[serde(default)]
    pub rate_limits: RateLimitConfig,
    /// Keyed by repository type name, e.g. `ZENODO`.
    #[serde(default)]
    pub repositories: BTreeMap<String, RepositoryConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct RegistryConfig {
    pub api_url: String,
    #[serde(default = "default_registry_token_env")]
    pub auth_token_env: String,
    #[serde(default = "default_registry_rpm")]
    pub requests_per_minute: u32,
}

fn default_registry_token_env() -> String {
    "REGISTRY_AUTH_TOKEN".to_string()
}
fn default_registry_rpm() -> u32 {
    200
}

#[derive(Debug, Deserialize, Clone)]
pub struct HarvestConfig {
    #[serde(default = "default_cleanup_days")]
    pub cleanup_days_threshold: u32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_base_delay_ms")]
    pub retry_base_delay_ms: u64,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub sites_url: Option<String>,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            cleanup_days_threshold: 30,
            max_retries: 5,
            retry_base_delay_ms: 10_000,
            timeout_secs: 60,
            sites_url: None,
        }
    }
}

fn default_cleanup_days() -> u32 {
    30
}
fn default_max_retries() -> u32 {
    5
}
fn default_retry_base_delay_ms() -> u64 {
    10_000
}
fn default_timeout_secs() -> u64 {
    60
}

/// Requests per minute, one budget per upstream family.
#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_rpm")]
    pub zenodo: u32,
    #[serde(default = "default_rpm")]
    pub b2share_eudat: u32,
    #[serde(default = "default_rpm")]
    pub b2share_juelich: u32,
    #[serde(default = "default_rpm")]
    pub fieldsites: u32,
    #[serde(default = "default_rpm")]
    pub dataregistry: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            zenodo: 80,
            b2share_eudat: 80,
            b2share_juelich: 80,
            fieldsites: 80,
            dataregistry: 80,
        }
    }
}

fn default_rpm() -> u32 {
    80
}

impl RateLimitConfig {
    pub fn for_family(&self, family: UpstreamFamily) -> u32 {
        match family {
            UpstreamFamily::Zenodo => self.zenodo,
            UpstreamFamily::B2shareEudat => self.b2share_eudat,
            UpstreamFamily::B2shareJuelich => self.b2share_juelich,
            UpstreamFamily::FieldSites => self.fieldsites,
            UpstreamFamily::DataRegistry => self.dataregistry,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct RepositoryConfig {
    /// Listing endpoint, or the sitemap URL for sitemap sources.
    pub api_url: String,
    #[serde(default)]
    pub page_size: Option<u32>,
    /// Dotted path to the item array inside a listing page.
    #[serde(default)]
    pub data_key: Option<String>,
    /// Dotted path to an item's self URL.
    #[serde(default)]
    pub self_link_key: Option<String>,
    /// Dotted path unwrapping a single-record response, when the upstream wraps it.
    #[serde(default)]
    pub single_record_key: Option<String>,
    /// Registry search URL listing this repository's registry records.
    #[serde(default)]
    pub registry_query: Option<String>,
    /// Environment variable holding an upstream API token.
    #[serde(default)]
    pub auth_token_env: Option<String>,
}

impl Config {
    pub fn repository(&self, repository: RepositoryType) -> Result<&RepositoryConfig> {
        self.repositories
            .get(repository.as_str())
            .with_context(|| format!("repository {} is not configured", repository))
    }

    /// Configured repositories in declaration-independent order.
    pub fn repository_types(&self) -> Vec<RepositoryType> {
        self.repositories
            .keys()
            .filter_map(|k| k.parse().ok())
            .collect()
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    if config.registry.api_url.trim().is_empty() {
        anyhow::bail!("registry.api_url must not be empty");
    }
    if config.registry.requests_per_minute == 0 {
        anyhow::bail!("registry.requests_per_minute must be > 0");
    }
    if config.harvest.cleanup_days_threshold == 0 {
        anyhow::bail!("harvest.cleanup_days_threshold must be > 0");
    }
    if config.harvest.timeout_secs == 0 {
        anyhow::bail!("harvest.timeout_secs must be > 0");
    }

    let limits = &config.rate_limits;
    for (name, rpm) in [
        ("zenodo", limits.zenodo),
        ("b2share_eudat", limits.b2share_eudat),
        ("b2share_juelich", limits.b2share_juelich),
        ("fieldsites", limits.fieldsites),
        ("dataregistry", limits.dataregistry),
    ] {
        if rpm == 0 {
            anyhow::bail!("rate_limits.{} must be > 0", name);
        }
    }

    for (key, repo) in &config.repositories {
        let repository: RepositoryType = key
            .parse()
            .with_context(|| format!("Invalid [repositories.{}] section", key))?;
        if repo.api_url.trim().is_empty() {
            anyhow::bail!("repositories.{}.api_url must not be empty", key);
        }
        if repo.page_size == Some(0) {
            anyhow::bail!("repositories.{}.page_size must be > 0", key);
        }
        if repository.is_sitemap() {
            continue;
        }
        if repo.page_size.is_none() {
            anyhow::bail!("repositories.{}.page_size is required", key);
        }
        if repo.data_key.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("repositories.{}.data_key is required", key);
        }
        if repo.self_link_key.as_deref().map_or(true, str::is_empty) {
            anyhow::bail!("repositories.{}.self_link_key is required", key);
        }
    }

    Ok(config)
}
