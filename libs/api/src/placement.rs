//! Placement bindings and the two placement kinds they can reference.

use serde::{Deserialize, Serialize};

use crate::meta::impl_resource;
use crate::{
    ObjectMeta, Policy, Resource, APPS_GROUP, CLUSTER_GROUP, POLICY_GROUP, POLICY_KIND,
};

pub const PLACEMENT_BINDING_KIND: &str = "PlacementBinding";
pub const PLACEMENT_RULE_KIND: &str = "PlacementRule";
pub const PLACEMENT_KIND: &str = "Placement";
pub const PLACEMENT_DECISION_KIND: &str = "PlacementDecision";

/// A typed reference by API group, kind and name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypedRef {
    #[serde(default)]
    pub api_group: String,
    pub kind: String,
    pub name: String,
}

impl TypedRef {
    pub fn new(api_group: &str, kind: &str, name: impl Into<String>) -> Self {
        Self {
            api_group: api_group.to_string(),
            kind: kind.to_string(),
            name: name.into(),
        }
    }

    /// True when this reference names the given root policy.
    pub fn refers_to_policy(&self, policy: &Policy) -> bool {
        self.api_group == POLICY_GROUP && self.kind == POLICY_KIND && self.name == policy.name()
    }
}

/// Binds policies (subjects) to one placement reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementBinding {
    pub metadata: ObjectMeta,
    pub placement_ref: TypedRef,
    #[serde(default)]
    pub subjects: Vec<TypedRef>,
}

impl_resource!(PlacementBinding, POLICY_GROUP, PLACEMENT_BINDING_KIND);

impl PlacementBinding {
    /// True when any subject names the policy.
    pub fn binds(&self, policy: &Policy) -> bool {
        self.subjects.iter().any(|s| s.refers_to_policy(policy))
    }
}

/// A resolved (cluster name, cluster namespace) target.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterDecision {
    pub cluster_name: String,
    #[serde(default)]
    pub cluster_namespace: String,
}

impl ClusterDecision {
    pub fn new(cluster_name: impl Into<String>, cluster_namespace: impl Into<String>) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            cluster_namespace: cluster_namespace.into(),
        }
    }

    /// Replication identity: `clusterNamespace/clusterName`.
    pub fn key(&self) -> String {
        format!("{}/{}", self.cluster_namespace, self.cluster_name)
    }
}

/// Legacy placement kind; decisions live directly in its status.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRule {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
    #[serde(default)]
    pub status: PlacementRuleStatus,
}

impl_resource!(PlacementRule, APPS_GROUP, PLACEMENT_RULE_KIND);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementRuleStatus {
    #[serde(default)]
    pub decisions: Vec<ClusterDecision>,
}

/// Generic placement kind; decisions are published as [`PlacementDecision`]
/// objects labeled with the placement's name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Placement {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub spec: serde_json::Value,
}

impl_resource!(Placement, CLUSTER_GROUP, PLACEMENT_KIND);

/// One page of decisions for a generic placement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementDecision {
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: PlacementDecisionStatus,
}

impl_resource!(PlacementDecision, CLUSTER_GROUP, PLACEMENT_DECISION_KIND);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementDecisionStatus {
    #[serde(default)]
    pub decisions: Vec<ClusterSelection>,
}

/// A cluster selected by a generic placement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterSelection {
    pub cluster_name: String,
    #[serde(default)]
    pub reason: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_binding_subject_match() {
        let policy = Policy::new("default", "p1");
        let binding: PlacementBinding = serde_json::from_value(json!({
            "metadata": {"name": "b1", "namespace": "default"},
            "placementRef": {"apiGroup": APPS_GROUP, "kind": "PlacementRule", "name": "r1"},
            "subjects": [
                {"apiGroup": POLICY_GROUP, "kind": "Policy", "name": "other"},
                {"apiGroup": POLICY_GROUP, "kind": "Policy", "name": "p1"}
            ]
        }))
        .unwrap();

        assert!(binding.binds(&policy));
        assert!(!binding.binds(&Policy::new("default", "p2")));
    }

    #[test]
    fn test_subject_requires_policy_group_and_kind() {
        let policy = Policy::new("default", "p1");
        assert!(!TypedRef::new("other.io", POLICY_KIND, "p1").refers_to_policy(&policy));
        assert!(!TypedRef::new(POLICY_GROUP, "PolicySet", "p1").refers_to_policy(&policy));
    }

    #[test]
    fn test_decision_key() {
        let decision = ClusterDecision::new("cluster1", "cluster1-ns");
        assert_eq!(decision.key(), "cluster1-ns/cluster1");
    }
}
