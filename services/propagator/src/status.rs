//! Compliance rollup for root policies.

use std::collections::HashSet;

use propagator_api::{
    labels, CompliancePerClusterStatus, ComplianceState, PlacementSummary, Policy, PolicyStatus,
};

/// Aggregate compliance of a root policy.
///
/// `Compliant` only when there is at least one record and every record is
/// compliant; `NonCompliant` when any record is; unset otherwise.
pub fn aggregate_compliance(records: &[CompliancePerClusterStatus]) -> Option<ComplianceState> {
    if records
        .iter()
        .any(|r| r.compliance_state == Some(ComplianceState::NonCompliant))
    {
        return Some(ComplianceState::NonCompliant);
    }

    if !records.is_empty()
        && records
            .iter()
            .all(|r| r.compliance_state == Some(ComplianceState::Compliant))
    {
        return Some(ComplianceState::Compliant);
    }

    None
}

/// Per-cluster compliance records for a root policy.
///
/// Replicas of failed clusters are skipped; every failed cluster key is
/// reported `NonCompliant` instead. Records are sorted by cluster name.
pub fn cluster_statuses(
    replicas: &[Policy],
    failed_clusters: &HashSet<String>,
) -> Vec<CompliancePerClusterStatus> {
    let mut records: Vec<CompliancePerClusterStatus> = replicas
        .iter()
        .filter(|replica| {
            replica
                .cluster_key()
                .is_none_or(|key| !failed_clusters.contains(&key))
        })
        .map(|replica| {
            let label = |key: &str| {
                replica
                    .metadata
                    .labels
                    .get(key)
                    .cloned()
                    .unwrap_or_default()
            };
            CompliancePerClusterStatus {
                cluster_name: label(labels::CLUSTER_NAME),
                cluster_namespace: label(labels::CLUSTER_NAMESPACE),
                compliance_state: replica.status.compliance_state,
            }
        })
        .collect();

    for key in failed_clusters {
        let (namespace, name) = key.split_once('/').unwrap_or(("", key.as_str()));
        records.push(CompliancePerClusterStatus {
            cluster_name: name.to_string(),
            cluster_namespace: namespace.to_string(),
            compliance_state: Some(ComplianceState::NonCompliant),
        });
    }

    records.sort_by(|a, b| {
        a.cluster_name
            .cmp(&b.cluster_name)
            .then_with(|| a.cluster_namespace.cmp(&b.cluster_namespace))
    });
    records
}

/// Build the status of a root policy from its cluster records and the
/// placement summaries of its bindings.
pub fn root_status(
    records: Vec<CompliancePerClusterStatus>,
    mut placements: Vec<PlacementSummary>,
) -> PolicyStatus {
    placements.sort_by(|a, b| a.placement_binding.cmp(&b.placement_binding));
    PolicyStatus {
        compliance_state: aggregate_compliance(&records),
        placement: placements,
        status: records,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use rstest::rstest;

    use ComplianceState::{Compliant, NonCompliant};

    fn record(name: &str, state: Option<ComplianceState>) -> CompliancePerClusterStatus {
        CompliancePerClusterStatus {
            cluster_name: name.to_string(),
            cluster_namespace: name.to_string(),
            compliance_state: state,
        }
    }

    fn replica(cluster: &str, state: Option<ComplianceState>) -> Policy {
        let mut policy = Policy::new(cluster, "policies.p1");
        policy
            .metadata
            .labels
            .insert(labels::CLUSTER_NAME.to_string(), cluster.to_string());
        policy
            .metadata
            .labels
            .insert(labels::CLUSTER_NAMESPACE.to_string(), cluster.to_string());
        policy.status.compliance_state = state;
        policy
    }

    #[rstest]
    #[case(vec![Some(Compliant), Some(Compliant)], Some(Compliant))]
    #[case(vec![Some(Compliant), Some(NonCompliant)], Some(NonCompliant))]
    #[case(vec![], None)]
    #[case(vec![Some(Compliant), None], None)]
    #[case(vec![None, Some(NonCompliant)], Some(NonCompliant))]
    fn test_rollup(
        #[case] states: Vec<Option<ComplianceState>>,
        #[case] expected: Option<ComplianceState>,
    ) {
        let records: Vec<_> = states
            .into_iter()
            .enumerate()
            .map(|(i, s)| record(&format!("c{i}"), s))
            .collect();
        assert_eq!(aggregate_compliance(&records), expected);
    }

    #[test]
    fn test_failed_clusters_are_synthesized_and_sorted() {
        let replicas = vec![
            replica("west", Some(Compliant)),
            replica("east", Some(Compliant)),
            replica("north", Some(Compliant)),
        ];
        let failed = HashSet::from(["north/north".to_string(), "alpha/alpha".to_string()]);

        let records = cluster_statuses(&replicas, &failed);
        let names: Vec<_> = records.iter().map(|r| r.cluster_name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "east", "north", "west"]);

        // The failed cluster's stale compliance is replaced, not kept.
        assert_eq!(records[2].compliance_state, Some(NonCompliant));
        assert_eq!(aggregate_compliance(&records), Some(NonCompliant));
    }

    #[test]
    fn test_root_status_sorts_placements() {
        let placements = vec![
            PlacementSummary {
                placement_binding: "b2".into(),
                ..Default::default()
            },
            PlacementSummary {
                placement_binding: "b1".into(),
                ..Default::default()
            },
        ];
        let status = root_status(vec![record("c1", Some(Compliant))], placements);
        assert_eq!(status.placement[0].placement_binding, "b1");
        assert_eq!(status.compliance_state, Some(Compliant));
    }

    fn state() -> impl Strategy<Value = Option<ComplianceState>> {
        prop_oneof![Just(None), Just(Some(Compliant)), Just(Some(NonCompliant))]
    }

    proptest! {
        #[test]
        fn prop_rollup_matches_definition(states in prop::collection::vec(state(), 0..12)) {
            let records: Vec<_> = states
                .iter()
                .enumerate()
                .map(|(i, s)| record(&format!("c{i}"), *s))
                .collect();
            let aggregate = aggregate_compliance(&records);

            let any_non_compliant = states.contains(&Some(NonCompliant));
            let all_compliant = !states.is_empty() && states.iter().all(|s| *s == Some(Compliant));

            prop_assert_eq!(aggregate == Some(NonCompliant), any_non_compliant);
            prop_assert_eq!(aggregate == Some(Compliant), all_compliant);
            prop_assert_eq!(aggregate.is_none(), !any_non_compliant && !all_compliant);
        }
    }
}
