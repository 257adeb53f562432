//! # propagator-api
//!
//! Object model shared by the policy propagator.
//!
//! ## Objects
//!
//! - [`Policy`]: a root policy authored by a user, or a replica of one placed
//!   in a managed cluster's namespace
//! - [`PlacementBinding`]: links policies to a placement reference
//! - [`PlacementRule`]: legacy placement kind, decisions embedded in status
//! - [`Placement`] + [`PlacementDecision`]: generic placement kind, decisions
//!   published as separate labeled objects
//!
//! ## Identity
//!
//! Replicas are named `<root namespace>.<root name>` and carry the
//! [`labels::ROOT_POLICY`], [`labels::CLUSTER_NAME`] and
//! [`labels::CLUSTER_NAMESPACE`] labels. All label and annotation keys are
//! wire-compatible with the cluster-side policy controllers and must not
//! change.

mod meta;
mod placement;
mod policy;

pub use meta::*;
pub use placement::*;
pub use policy::*;

/// API group of policies and placement bindings.
pub const POLICY_GROUP: &str = "policy.open-cluster-management.io";

/// API group of the legacy placement rule kind.
pub const APPS_GROUP: &str = "apps.open-cluster-management.io";

/// API group of the generic placement kinds.
pub const CLUSTER_GROUP: &str = "cluster.open-cluster-management.io";

/// Well-known label keys.
pub mod labels {
    /// Managed cluster name a replica was propagated to.
    pub const CLUSTER_NAME: &str = "policy.open-cluster-management.io/cluster-name";

    /// Managed cluster namespace a replica was propagated to.
    pub const CLUSTER_NAMESPACE: &str = "policy.open-cluster-management.io/cluster-namespace";

    /// Full name of the root policy a replica was derived from.
    pub const ROOT_POLICY: &str = "policy.open-cluster-management.io/root-policy";

    /// Name of the placement a decision-list object belongs to.
    pub const PLACEMENT: &str = "cluster.open-cluster-management.io/placement";
}

/// Well-known annotation keys.
pub mod annotations {
    /// Boolean; when true, hub templates are left unresolved.
    pub const DISABLE_TEMPLATES: &str = "policy.open-cluster-management.io/disable-templates";

    /// Root-only marker used to force template reprocessing. Never replicated.
    pub const TRIGGER_UPDATE: &str = "policy.open-cluster-management.io/trigger-update";

    /// Set on a nested policy template when hub template resolution failed.
    pub const HUB_TEMPLATES_ERROR: &str = "policy.open-cluster-management.io/hub-templates-error";
}
