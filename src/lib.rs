//! # Dataset Harvester
//!
//! Harvests dataset metadata from external research-data repositories
//! (Zenodo, B2Share, Swedish Field Sites, a data registry), maps every record
//! into one canonical schema and reconciles it with a local SQLite store and
//! a remote asset registry.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌─────────────────┐   ┌──────────┐
//! │  Upstreams  │──▶│  Harvest engine │──▶│  SQLite  │
//! │ JSON/sitemap│   │ map+rules+diff  │   │  store   │
//! └─────────────┘   └────────┬────────┘   └──────────┘
//!                            │
//!                            ▼
//!                      ┌──────────┐
//!                      │ Registry │
//!                      └──────────┘
//! ```
//!
//! A repository sync runs three phases inside a store transaction owned by that run:
//! re-validate every locally known record, crawl the upstream listing, and
//! delete records that have not been seen for a configured number of days.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] / [`migrate`] | SQLite connection and schema |
//! | [`sqlite_store`] | [`harvester_core::store::Store`] over SQLite |
//! | [`fetch`] / [`rate_limit`] | Throttled, retrying upstream HTTP |
//! | [`crawl`] | Paged listings and sitemaps |
//! | [`payload`] / [`version`] | Upstream payload views, latest-version resolution |
//! | [`sites`] / [`mapper`] | Site matching and canonical mapping |
//! | [`registry_client`] | HTTP registry client |
//! | [`harvest`] | The per-record pipeline and the three-phase run |
//! | [`services`] | Process-wide wiring |
//! | [`rules_service`] / [`registry_check`] | Operator tooling |

pub mod config;
pub mod crawl;
pub mod db;
pub mod fetch;
pub mod harvest;
pub mod mapper;
pub mod migrate;
pub mod payload;
pub mod rate_limit;
pub mod registry_check;
pub mod registry_client;
pub mod rules_service;
pub mod services;
pub mod sites;
pub mod sqlite_store;
pub mod version;
