//! Policy propagator core.
//!
//! Replicates root policies into the namespaces of the clusters their
//! placement bindings select, resolves hub templates per cluster, removes
//! replicas that are no longer placed and rolls replica compliance up into
//! the root policy's status.
//!
//! ## Flow
//!
//! ```text
//! PropagationWorker
//! └── PolicyReconciler        (one root policy per call)
//!     ├── resolve_decisions   (per placement binding)
//!     └── Replicator          (per cluster decision)
//!         └── TemplateEngine  (when the root has hub templates)
//! ```
//!
//! Every remote call goes through the retry policy from
//! `propagator-reconcile`.
//!
//! ## Modules
//!
//! - `store`: remote object store contract and the in-memory store
//! - `decisions`: placement decision resolution
//! - `templates`: hub template processing
//! - `replicator`: per-cluster replica create/update
//! - `status`: compliance rollup
//! - `reconciler`: root policy reconciliation
//! - `worker`: periodic passes over all root policies

pub mod config;
pub mod decisions;
pub mod error;
pub mod reconciler;
pub mod replicator;
pub mod status;
pub mod store;
pub mod telemetry;
pub mod templates;
pub mod worker;

pub use config::Config;
pub use error::{PropagationError, PropagationResult};
pub use reconciler::PolicyReconciler;
pub use worker::{PassStats, PropagationWorker};
