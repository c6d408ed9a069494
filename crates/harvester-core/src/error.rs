//! Error taxonomy for harvesting runs.
//!
//! Only [`HarvestError::Consistency`] is fatal to a run. The other variants
//! describe per-record failures that are logged and isolated so that one
//! bad record never blocks the rest of a repository.

use thiserror::Error;

/// Classified failures raised while reconciling records.
#[derive(Debug, Error)]
pub enum HarvestError {
    /// Transient upstream failure. Retried by the fetch client, otherwise
    /// degrades to "no data this pass".
    #[error("network error fetching {url}: {reason}")]
    Network { url: String, reason: String },

    /// An override rule was rejected. Local only, never surfaces as a run failure.
    #[error("rule for '{path}' rejected: {reason}")]
    Validation { path: String, reason: String },

    /// More than one local row for one source URL. Aborts and rolls back the run.
    #[error("{rows} local records share source url {source_url}")]
    Consistency { source_url: String, rows: usize },

    /// A registry create/update/delete failed. Marks the record failed.
    #[error("registry {operation} for {target} failed: {reason}")]
    RegistryWrite {
        operation: &'static str,
        target: String,
        reason: String,
    },
}

impl HarvestError {
    /// Whether this error must abort the surrounding run.
    pub fn is_fatal(&self) -> bool {
        matches!(self, HarvestError::Consistency { .. })
    }
}

/// Returns `true` when an `anyhow` error chain carries a fatal [`HarvestError`].
pub fn is_fatal(err: &anyhow::Error) -> bool {
    err.chain()
        .filter_map(|cause| cause.downcast_ref::<HarvestError>())
        .any(HarvestError::is_fatal)
}
