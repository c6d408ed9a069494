//! # Harvester Core
//!
//! Runtime-free logic for the dataset harvester: data models, the canonical
//! dataset schema, checksums, field paths, the override-rule engine, skip
//! predicates, the error taxonomy, and the store and registry abstractions.
//!
//! This crate contains no tokio, sqlx or HTTP dependencies.

pub mod checksum;
pub mod dataset;
pub mod error;
pub mod models;
pub mod path;
pub mod registry;
pub mod rules;
pub mod skip;
pub mod store;
