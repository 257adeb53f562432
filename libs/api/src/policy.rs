//! Policy objects and their status.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::meta::impl_resource;
use crate::{annotations, labels, ObjectMeta, POLICY_GROUP};

/// Kind name of policies.
pub const POLICY_KIND: &str = "Policy";

/// A policy: either a root policy or one of its per-cluster replicas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Policy {
    pub metadata: ObjectMeta,

    #[serde(default)]
    pub spec: PolicySpec,

    #[serde(default)]
    pub status: PolicyStatus,
}

impl_resource!(Policy, POLICY_GROUP, POLICY_KIND);

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicySpec {
    #[serde(default)]
    pub disabled: bool,

    /// `inform` or `enforce`; passed through to replicas untouched.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remediation_action: Option<String>,

    #[serde(default)]
    pub policy_templates: Vec<PolicyTemplate>,
}

/// A nested object definition carried inside a policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyTemplate {
    pub object_definition: serde_json::Value,
}

impl PolicyTemplate {
    pub fn new(object_definition: serde_json::Value) -> Self {
        Self { object_definition }
    }

    /// The embedded object's `kind`, if it has one.
    pub fn kind(&self) -> Option<&str> {
        self.object_definition.get("kind").and_then(|k| k.as_str())
    }

    /// JSON encoding of the embedded object.
    pub fn raw(&self) -> Vec<u8> {
        // Serializing a `Value` cannot fail.
        serde_json::to_vec(&self.object_definition).unwrap_or_default()
    }
}

/// Compliance reported by a cluster, or rolled up on a root policy.
///
/// The unset (pending) state is `None` wherever this type appears, and an
/// empty string on the wire decodes to `None`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComplianceState {
    Compliant,
    NonCompliant,
}

impl ComplianceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compliant => "Compliant",
            Self::NonCompliant => "NonCompliant",
        }
    }
}

impl fmt::Display for ComplianceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ComplianceState {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Decodes an optional compliance state, mapping `""` and unknown values to `None`.
fn compliance_opt<'de, D>(deserializer: D) -> Result<Option<ComplianceState>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(match raw.as_deref() {
        Some("Compliant") => Some(ComplianceState::Compliant),
        Some("NonCompliant") => Some(ComplianceState::NonCompliant),
        _ => None,
    })
}

/// Compliance of one managed cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompliancePerClusterStatus {
    pub cluster_name: String,

    pub cluster_namespace: String,

    #[serde(
        default,
        rename = "compliant",
        deserialize_with = "compliance_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub compliance_state: Option<ComplianceState>,
}

/// Records which placement a binding resolved to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlacementSummary {
    pub placement_binding: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement_rule: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyStatus {
    /// Aggregate compliance on a root policy, or the cluster's own
    /// compliance on a replica.
    #[serde(
        default,
        rename = "compliant",
        deserialize_with = "compliance_opt",
        skip_serializing_if = "Option::is_none"
    )]
    pub compliance_state: Option<ComplianceState>,

    #[serde(default)]
    pub placement: Vec<PlacementSummary>,

    #[serde(default)]
    pub status: Vec<CompliancePerClusterStatus>,
}

impl Policy {
    /// Create an empty policy.
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            metadata: ObjectMeta::new(namespace, name),
            spec: PolicySpec::default(),
            status: PolicyStatus::default(),
        }
    }

    /// Name used for every replica of this policy: `<namespace>.<name>`.
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.metadata.namespace, self.metadata.name)
    }

    /// Root policies are the ones not carrying the root-policy label.
    pub fn is_root(&self) -> bool {
        !self.metadata.labels.contains_key(labels::ROOT_POLICY)
    }

    /// Label selector matching every replica of this root policy.
    pub fn replica_selector(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(labels::ROOT_POLICY.to_string(), self.full_name())])
    }

    /// `clusterNamespace/clusterName` of a replica, read from its labels.
    pub fn cluster_key(&self) -> Option<String> {
        let namespace = self.metadata.labels.get(labels::CLUSTER_NAMESPACE)?;
        let name = self.metadata.labels.get(labels::CLUSTER_NAME)?;
        Some(format!("{namespace}/{name}"))
    }
}

/// Annotations that take part in replica comparison.
fn relevant_annotations(policy: &Policy) -> BTreeMap<&str, &str> {
    policy
        .metadata
        .annotations
        .iter()
        .filter(|(k, _)| k.as_str() != annotations::TRIGGER_UPDATE)
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect()
}

/// True when `a` and `b` agree on spec and on every annotation except the
/// root-only reprocessing marker.
pub fn compare_spec_and_annotations(a: &Policy, b: &Policy) -> bool {
    a.spec == b.spec && relevant_annotations(a) == relevant_annotations(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_full_name_and_selector() {
        let policy = Policy::new("policies", "require-labels");
        assert_eq!(policy.full_name(), "policies.require-labels");
        assert_eq!(
            policy.replica_selector().get(labels::ROOT_POLICY),
            Some(&"policies.require-labels".to_string())
        );
        assert!(policy.is_root());
    }

    #[test]
    fn test_cluster_key_requires_both_labels() {
        let mut replica = Policy::new("cluster1", "policies.p1");
        replica
            .metadata
            .labels
            .insert(labels::CLUSTER_NAME.to_string(), "cluster1".to_string());
        assert_eq!(replica.cluster_key(), None);

        replica
            .metadata
            .labels
            .insert(labels::CLUSTER_NAMESPACE.to_string(), "cluster1-ns".to_string());
        assert_eq!(replica.cluster_key(), Some("cluster1-ns/cluster1".to_string()));
    }

    #[test]
    fn test_empty_compliance_decodes_as_unset() {
        let status: PolicyStatus = serde_json::from_value(json!({
            "compliant": "",
            "status": [
                {"clusterName": "c1", "clusterNamespace": "c1", "compliant": "NonCompliant"},
                {"clusterName": "c2", "clusterNamespace": "c2"}
            ]
        }))
        .unwrap();

        assert_eq!(status.compliance_state, None);
        assert_eq!(
            status.status[0].compliance_state,
            Some(ComplianceState::NonCompliant)
        );
        assert_eq!(status.status[1].compliance_state, None);
    }

    #[test]
    fn test_compare_ignores_trigger_update() {
        let mut a = Policy::new("ns", "p");
        a.spec.policy_templates = vec![PolicyTemplate::new(json!({"kind": "ConfigurationPolicy"}))];
        let mut b = a.clone();

        a.metadata
            .annotations
            .insert(annotations::TRIGGER_UPDATE.to_string(), "1".to_string());
        assert!(compare_spec_and_annotations(&a, &b));

        b.metadata
            .annotations
            .insert("team".to_string(), "platform".to_string());
        assert!(!compare_spec_and_annotations(&a, &b));
    }

    #[test]
    fn test_compare_detects_spec_change() {
        let a = Policy::new("ns", "p");
        let mut b = a.clone();
        b.spec.disabled = true;
        assert!(!compare_spec_and_annotations(&a, &b));
    }

    #[test]
    fn test_template_kind() {
        let template = PolicyTemplate::new(json!({"kind": "CertificatePolicy", "spec": {}}));
        assert_eq!(template.kind(), Some("CertificatePolicy"));
        assert_eq!(PolicyTemplate::new(json!("text")).kind(), None);
    }
}
