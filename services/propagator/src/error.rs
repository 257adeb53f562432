//! Error types for the propagation core.

use propagator_reconcile::Retryable;
use thiserror::Error;

use crate::store::StoreError;

/// Result type for propagation operations.
pub type PropagationResult<T> = Result<T, PropagationError>;

/// Errors surfaced by the decision resolver, template engine, replicator
/// and root policy reconciler.
#[derive(Debug, Error)]
pub enum PropagationError {
    /// Remote store failure. Transient unless the store says otherwise.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// A placement binding references a kind that cannot be resolved.
    #[error("placement binding {namespace}/{binding} reference is not valid")]
    InvalidReference { namespace: String, binding: String },

    /// Templates used where they are not allowed.
    #[error("{0}")]
    SpecValidity(String),

    /// Hub template resolution failed for one cluster.
    #[error("failed to resolve templates for cluster {cluster}: {message}")]
    TemplateResolution { cluster: String, message: String },

    /// One or more deletions failed after retries.
    #[error("{message} ({failed} failed)")]
    AggregateCleanupFailure { message: String, failed: usize },

    /// No placement decisions could be resolved for the root policy.
    #[error("could not get the placement decisions")]
    DecisionsUnavailable,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl PropagationError {
    /// True for a store `NotFound`.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_not_found())
    }
}

impl Retryable for PropagationError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Store(e) => e.is_retryable(),
            _ => false,
        }
    }
}
