//! # Dataset Harvester CLI (`harvester`)
//!
//! Runs harvests against the configured repositories and exposes the
//! operator tooling: override rules, resolved markers and the registry
//! consistency check.
//!
//! ## Usage
//!
//! ```bash
//! harvester --config ./config/harvester.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `harvester init` | Create the SQLite database and run schema migrations |
//! | `harvester repositories` | List configured repositories |
//! | `harvester sync <REPO>` | Run the three-phase sync for one repository |
//! | `harvester sync-record <REPO> <URL>` | Sync one record |
//! | `harvester rules list\|apply\|delete` | Manage override rules |
//! | `harvester resolve <ID>` / `unresolve <ID>` | Manage resolved markers |
//! | `harvester records` | List harvested records |
//! | `harvester registry-check <REPO>` | Compare local and registry ids |
//!
//! Logs go to stderr (`RUST_LOG` overrides the `info` default); command
//! output goes to stdout.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dataset_harvester::config::{self, Config};
use dataset_harvester::harvest::{start_record_sync, start_repository_sync};
use dataset_harvester::registry_check::check_registry;
use dataset_harvester::services::Services;
use dataset_harvester::sqlite_store::SqliteStore;
use dataset_harvester::{db, migrate, rules_service};
use harvester_core::models::{RepositoryType, RuleDraft};
use harvester_core::rules::diff_rules;
use harvester_core::store::RecordStore;

/// Dataset Harvester: pulls dataset metadata from research-data
/// repositories and reconciles it with a local store and an asset registry.
#[derive(Parser)]
#[command(name = "harvester", version, about)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/harvester.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// List configured repositories and their listing endpoints.
    Repositories,

    /// Re-validate local records, crawl the upstream listing and clean up
    /// records that have not been seen for the configured number of days.
    Sync {
        /// Repository type, e.g. `ZENODO` or `SITES`.
        repository: RepositoryType,

        /// Fetch and compare checksums even for settled records.
        #[arg(long)]
        verify: bool,
    },

    /// Sync a single record by its upstream URL.
    SyncRecord {
        repository: RepositoryType,
        url: String,

        #[arg(long)]
        verify: bool,
    },

    /// Manage override rules.
    Rules {
        #[command(subcommand)]
        action: RulesAction,
    },

    /// Mark a registry record as reviewed; resolved records survive cleanup.
    Resolve {
        registry_id: String,

        /// Who resolved it.
        #[arg(long)]
        by: Option<String>,
    },

    /// Drop the resolved marker of a registry record.
    Unresolve { registry_id: String },

    /// List harvested records.
    Records {
        #[arg(long)]
        repository: Option<RepositoryType>,
    },

    /// Compare local registry ids with the registry listing.
    RegistryCheck {
        repository: RepositoryType,

        /// Delete registry records unknown locally.
        #[arg(long)]
        cleanup: bool,
    },
}

#[derive(Subcommand)]
enum RulesAction {
    /// Print the rules stored for a registry record as JSON.
    List { registry_id: String },

    /// Store rules and re-sync the record.
    ///
    /// Rules come either from `--file` (a JSON array of
    /// `{target_path, before_value, after_value}`) or from the difference
    /// between `--original` and `--edited` record JSON files.
    Apply {
        registry_id: String,

        #[arg(long, conflicts_with_all = ["original", "edited"])]
        file: Option<PathBuf>,

        #[arg(long, requires = "edited")]
        original: Option<PathBuf>,

        #[arg(long, requires = "original")]
        edited: Option<PathBuf>,
    },

    /// Delete one rule and re-sync the record.
    Delete { registry_id: String, rule_id: i64 },
}

fn read_json(path: &Path) -> Result<serde_json::Value> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Invalid JSON in {}", path.display()))
}

fn rule_drafts(
    file: Option<PathBuf>,
    original: Option<PathBuf>,
    edited: Option<PathBuf>,
) -> Result<Vec<RuleDraft>> {
    match (file, original, edited) {
        (Some(file), _, _) => serde_json::from_value(read_json(&file)?)
            .with_context(|| format!("{} is not a list of rules", file.display())),
        (None, Some(original), Some(edited)) => {
            Ok(diff_rules(&read_json(&original)?, &read_json(&edited)?))
        }
        _ => bail!("either --file or --original/--edited is required"),
    }
}

async fn open_store(cfg: &Config) -> Result<Arc<SqliteStore>> {
    let pool = db::connect(cfg).await?;
    migrate::apply(&pool).await?;
    Ok(Arc::new(SqliteStore::new(pool)))
}

async fn open_services(cfg: Config) -> Result<Services> {
    let store = open_store(&cfg).await?;
    Services::from_config(cfg, store).await
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Repositories => {
            for repository in cfg.repository_types() {
                let repo = cfg.repository(repository)?;
                let kind = if repository.is_sitemap() { "sitemap" } else { "api" };
                println!("{}\t{}\t{}", repository, kind, repo.api_url);
            }
        }
        Commands::Sync { repository, verify } => {
            let services = open_services(cfg).await?;
            let ctx = services.context(repository, verify)?;
            let report = start_repository_sync(ctx)
                .await
                .context("sync task panicked")??;
            println!("{}: {}", repository, report);
        }
        Commands::SyncRecord {
            repository,
            url,
            verify,
        } => {
            let services = open_services(cfg).await?;
            let ctx = services.context(repository, verify)?;
            let report = start_record_sync(ctx, url.clone())
                .await
                .context("sync task panicked")??;
            println!("{}: {}", url, report);
        }
        Commands::Rules { action } => {
            let services = open_services(cfg).await?;
            match action {
                RulesAction::List { registry_id } => {
                    let rules = rules_service::list_rules(&services, &registry_id).await?;
                    println!("{}", serde_json::to_string_pretty(&rules)?);
                }
                RulesAction::Apply {
                    registry_id,
                    file,
                    original,
                    edited,
                } => {
                    let drafts = rule_drafts(file, original, edited)?;
                    let applied =
                        rules_service::apply_rules(&services, &registry_id, &drafts).await?;
                    for path in &applied {
                        println!("{}", path);
                    }
                    println!("{} rule(s) processed.", applied.len());
                }
                RulesAction::Delete {
                    registry_id,
                    rule_id,
                } => {
                    if rules_service::delete_rule(&services, &registry_id, rule_id).await? {
                        println!("Rule {} deleted.", rule_id);
                    } else {
                        bail!("rule {} not found for {}", rule_id, registry_id);
                    }
                }
            }
        }
        Commands::Resolve { registry_id, by } => {
            let store = open_store(&cfg).await?;
            if store.record_by_registry_id(&registry_id).await?.is_none() {
                bail!("no local record carries registry id {}", registry_id);
            }
            store.mark_resolved(&registry_id, by.as_deref()).await?;
            println!("{} marked resolved.", registry_id);
        }
        Commands::Unresolve { registry_id } => {
            let store = open_store(&cfg).await?;
            if store.delete_resolved(&registry_id).await? {
                println!("{} unresolved.", registry_id);
            } else {
                println!("{} was not resolved.", registry_id);
            }
        }
        Commands::Records { repository } => {
            let store = open_store(&cfg).await?;
            for row in store.list_by_repository(repository).await? {
                println!(
                    "{}\t{}\t{}\t{}\t{}",
                    row.source_repository,
                    row.status,
                    row.registry_id.as_deref().unwrap_or("-"),
                    row.source_url,
                    row.title.as_deref().unwrap_or("")
                );
            }
        }
        Commands::RegistryCheck {
            repository,
            cleanup,
        } => {
            let services = open_services(cfg).await?;
            let check = check_registry(
                services.store.as_ref(),
                services.registry.as_ref(),
                repository,
                cleanup,
            )
            .await?;
            println!("{}", serde_json::to_string_pretty(&check)?);
        }
    }

    Ok(())
}
