//! Placement decision resolution.
//!
//! A placement binding references one of two placement kinds. Both are
//! normalized to the same shape: an ordered list of cluster decisions and
//! a placement summary for the root policy's status.

use propagator_api::{
    labels, ClusterDecision, Placement, PlacementBinding, PlacementDecision, PlacementRule,
    PlacementSummary, Policy, Resource, TypedRef,
};
use tracing::debug;

use crate::error::{PropagationError, PropagationResult};
use crate::store::{ignore_not_found, LabelSelector, ObjectStore};

/// Decisions produced by one placement binding.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedPlacement {
    pub decisions: Vec<ClusterDecision>,
    pub summary: PlacementSummary,
}

/// How decisions are read for a placement reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PlacementStrategy {
    /// Decisions are embedded in the rule's status.
    LegacyRule,
    /// Decisions are published as labeled decision-list objects.
    GenericPlacement,
}

impl PlacementStrategy {
    fn for_ref(reference: &TypedRef) -> Option<Self> {
        let is = |group: &str, kind: &str| reference.api_group == group && reference.kind == kind;

        if is(PlacementRule::API_GROUP, PlacementRule::KIND) {
            Some(Self::LegacyRule)
        } else if is(Placement::API_GROUP, Placement::KIND) {
            Some(Self::GenericPlacement)
        } else {
            None
        }
    }
}

/// Resolve the clusters a binding places the root policy on.
///
/// A missing placement object yields zero decisions, not an error. The
/// summary always names the binding and, per kind, the placement.
pub async fn resolve_decisions<S: ObjectStore>(
    store: &S,
    binding: &PlacementBinding,
    root: &Policy,
) -> PropagationResult<ResolvedPlacement> {
    let reference = &binding.placement_ref;
    let namespace = root.namespace();

    let Some(strategy) = PlacementStrategy::for_ref(reference) else {
        return Err(PropagationError::InvalidReference {
            namespace: binding.namespace().to_string(),
            binding: binding.name().to_string(),
        });
    };

    let mut summary = PlacementSummary {
        placement_binding: binding.name().to_string(),
        ..Default::default()
    };

    let decisions = match strategy {
        PlacementStrategy::LegacyRule => {
            summary.placement_rule = Some(reference.name.clone());
            legacy_rule_decisions(store, namespace, &reference.name).await?
        }
        PlacementStrategy::GenericPlacement => {
            summary.placement = Some(reference.name.clone());
            generic_placement_decisions(store, namespace, &reference.name).await?
        }
    };

    debug!(
        binding = %binding.name(),
        ?strategy,
        decisions = decisions.len(),
        "resolved placement decisions"
    );

    Ok(ResolvedPlacement { decisions, summary })
}

async fn legacy_rule_decisions<S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
) -> PropagationResult<Vec<ClusterDecision>> {
    let rule = ignore_not_found(store.get::<PlacementRule>(namespace, name).await)?;
    Ok(rule.map(|r| r.status.decisions).unwrap_or_default())
}

async fn generic_placement_decisions<S: ObjectStore>(
    store: &S,
    namespace: &str,
    name: &str,
) -> PropagationResult<Vec<ClusterDecision>> {
    if ignore_not_found(store.get::<Placement>(namespace, name).await)?.is_none() {
        return Ok(Vec::new());
    }

    let selector = LabelSelector::from([(labels::PLACEMENT.to_string(), name.to_string())]);
    let lists = ignore_not_found(
        store
            .list::<PlacementDecision>(Some(namespace), &selector)
            .await,
    )?
    .unwrap_or_default();

    // Managed cluster namespaces are named after the cluster.
    Ok(lists
        .into_iter()
        .flat_map(|list| list.status.decisions)
        .map(|selection| {
            ClusterDecision::new(selection.cluster_name.clone(), selection.cluster_name)
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{InMemoryStore, Operation, StoreError};
    use propagator_api::{
        ClusterSelection, ObjectMeta, PlacementDecisionStatus, PlacementRuleStatus,
        APPS_GROUP, CLUSTER_GROUP,
    };
    use serde_json::Value;

    fn binding(api_group: &str, kind: &str, name: &str) -> PlacementBinding {
        PlacementBinding {
            metadata: ObjectMeta::new("policies", "bind"),
            placement_ref: TypedRef::new(api_group, kind, name),
            subjects: Vec::new(),
        }
    }

    fn decision_list(name: &str, placement: &str, clusters: &[&str]) -> PlacementDecision {
        let mut metadata = ObjectMeta::new("policies", name);
        metadata
            .labels
            .insert(labels::PLACEMENT.to_string(), placement.to_string());
        PlacementDecision {
            metadata,
            status: PlacementDecisionStatus {
                decisions: clusters
                    .iter()
                    .map(|c| ClusterSelection {
                        cluster_name: c.to_string(),
                        reason: String::new(),
                    })
                    .collect(),
            },
        }
    }

    #[tokio::test]
    async fn test_legacy_rule_decisions() {
        let store = InMemoryStore::new();
        store
            .insert(PlacementRule {
                metadata: ObjectMeta::new("policies", "rule"),
                spec: Value::Null,
                status: PlacementRuleStatus {
                    decisions: vec![
                        ClusterDecision::new("east", "east-ns"),
                        ClusterDecision::new("west", "west-ns"),
                    ],
                },
            })
            .unwrap();

        let root = Policy::new("policies", "p1");
        let resolved = resolve_decisions(
            &store,
            &binding(APPS_GROUP, "PlacementRule", "rule"),
            &root,
        )
        .await
        .unwrap();

        assert_eq!(resolved.decisions.len(), 2);
        assert_eq!(resolved.decisions[0].key(), "east-ns/east");
        assert_eq!(resolved.summary.placement_rule.as_deref(), Some("rule"));
        assert_eq!(resolved.summary.placement, None);
    }

    #[tokio::test]
    async fn test_missing_rule_yields_no_decisions() {
        let store = InMemoryStore::new();
        let root = Policy::new("policies", "p1");

        let resolved = resolve_decisions(
            &store,
            &binding(APPS_GROUP, "PlacementRule", "absent"),
            &root,
        )
        .await
        .unwrap();

        assert!(resolved.decisions.is_empty());
        assert_eq!(resolved.summary.placement_binding, "bind");
        assert_eq!(resolved.summary.placement_rule.as_deref(), Some("absent"));
    }

    #[tokio::test]
    async fn test_generic_placement_flattens_decision_lists() {
        let store = InMemoryStore::new();
        store
            .insert(Placement {
                metadata: ObjectMeta::new("policies", "pl"),
                spec: Value::Null,
            })
            .unwrap();
        store.insert(decision_list("pl-1", "pl", &["a", "b"])).unwrap();
        store.insert(decision_list("pl-2", "pl", &["c"])).unwrap();
        store.insert(decision_list("other-1", "other", &["z"])).unwrap();

        let root = Policy::new("policies", "p1");
        let resolved = resolve_decisions(&store, &binding(CLUSTER_GROUP, "Placement", "pl"), &root)
            .await
            .unwrap();

        let keys: Vec<String> = resolved.decisions.iter().map(|d| d.key()).collect();
        assert_eq!(keys, vec!["a/a", "b/b", "c/c"]);
        assert_eq!(resolved.summary.placement.as_deref(), Some("pl"));
    }

    #[tokio::test]
    async fn test_generic_placement_without_decision_lists() {
        let store = InMemoryStore::new();
        store
            .insert(Placement {
                metadata: ObjectMeta::new("policies", "pl"),
                spec: Value::Null,
            })
            .unwrap();

        let root = Policy::new("policies", "p1");
        let resolved = resolve_decisions(&store, &binding(CLUSTER_GROUP, "Placement", "pl"), &root)
            .await
            .unwrap();

        assert!(resolved.decisions.is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_kind_is_invalid_reference() {
        let store = InMemoryStore::new();
        let root = Policy::new("policies", "p1");

        let err = resolve_decisions(&store, &binding(CLUSTER_GROUP, "ManagedClusterSet", "x"), &root)
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PropagationError::InvalidReference { ref binding, .. } if binding == "bind"
        ));
    }

    #[tokio::test]
    async fn test_store_failure_propagates() {
        let store = InMemoryStore::new();
        store.fail_next::<PlacementRule>(Operation::Get, 1);
        let root = Policy::new("policies", "p1");

        let err = resolve_decisions(&store, &binding(APPS_GROUP, "PlacementRule", "rule"), &root)
            .await
            .unwrap_err();

        assert!(matches!(err, PropagationError::Store(StoreError::Unavailable(_))));
    }
}
