//! Root policy reconciliation.
//!
//! One call to [`PolicyReconciler::reconcile`] drives a single root policy
//! through a full pass:
//!
//! 1. Disabled roots have every replica deleted
//! 2. Placement bindings in the root's namespace are listed
//! 3. Each binding naming the root is resolved to cluster decisions, and
//!    each decision is replicated (unless the root is disabled)
//! 4. Replica compliance is collected, failed clusters are reported
//!    `NonCompliant`
//! 5. The aggregate compliance and placement summaries are computed
//! 6. The root's status is patched against the originally-read object
//! 7. Replicas of clusters outside the decision set are deleted
//!
//! Remote calls go through the configured [`RetryPolicy`]. Errors that
//! abort a pass are recorded as warning events on the root and returned;
//! scheduling the next attempt is the caller's concern.
//!
//! [`RetryPolicy`]: propagator_reconcile::RetryPolicy

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Instant;

use propagator_api::{PlacementBinding, PlacementSummary, Policy, Resource};
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::decisions::{resolve_decisions, ResolvedPlacement};
use crate::error::{PropagationError, PropagationResult};
use crate::replicator::Replicator;
use crate::status::{cluster_statuses, root_status};
use crate::store::{LabelSelector, ObjectStore};
use crate::telemetry::{
    observe_duration, EventRecorder, EventSubject, EventType, EVENT_REASON,
    ROOT_POLICY_DURATION_METRIC,
};
use crate::templates::TemplateResolver;

/// Outcome of step 3 for one pass.
#[derive(Debug, Default)]
struct DecisionOutcome {
    placements: Vec<PlacementSummary>,
    /// Every decided cluster, as `namespace/name`.
    decided: BTreeSet<String>,
    /// Clusters whose replication gave up, as `namespace/name`.
    failed: HashSet<String>,
}

/// Reconciles root policies against the object store.
pub struct PolicyReconciler<S> {
    store: Arc<S>,
    resolver: Arc<dyn TemplateResolver>,
    recorder: Arc<dyn EventRecorder>,
    config: Arc<Config>,
}

impl<S> Clone for PolicyReconciler<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            resolver: Arc::clone(&self.resolver),
            recorder: Arc::clone(&self.recorder),
            config: Arc::clone(&self.config),
        }
    }
}

impl<S: ObjectStore> PolicyReconciler<S> {
    pub fn new(
        store: Arc<S>,
        resolver: Arc<dyn TemplateResolver>,
        recorder: Arc<dyn EventRecorder>,
        config: Arc<Config>,
    ) -> Self {
        Self {
            store,
            resolver,
            recorder,
            config,
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run one reconciliation pass for a root policy.
    #[instrument(
        skip_all,
        fields(policy_namespace = %root.namespace(), policy_name = %root.name())
    )]
    pub async fn reconcile(&self, root: &Policy) -> PropagationResult<()> {
        let started = Instant::now();
        let result = self.handle_root_policy(root).await;
        observe_duration(
            ROOT_POLICY_DURATION_METRIC,
            started.elapsed().as_secs_f64(),
        );
        result
    }

    async fn handle_root_policy(&self, root: &Policy) -> PropagationResult<()> {
        let store = &*self.store;
        let retry = &self.config.retry;
        let disabled = root.spec.disabled;

        if disabled {
            info!("Policy is disabled, doing clean up");
            if let Err(e) = self.cleanup_policy(root).await {
                info!("Giving up on the policy clean up");
                return Err(self.warning(root, "One or more replicated policies could not be deleted", e));
            }
            self.event(
                root,
                EventType::Normal,
                &format!("Policy {}/{} was disabled", root.namespace(), root.name()),
            );
        }

        let no_selector = LabelSelector::new();
        let bindings = match retry
            .execute("Retrying to list the placement bindings", || {
                store.list::<PlacementBinding>(Some(root.namespace()), &no_selector)
            })
            .await
        {
            Ok(bindings) => bindings,
            Err(e) => {
                info!("Giving up on listing the placement bindings");
                return Err(self.warning(root, "Could not list the placement bindings", e.into()));
            }
        };

        let Some(outcome) = self.handle_decisions(root, &bindings).await else {
            info!("Failed to get any placement decisions, giving up");
            return Err(self.warning(
                root,
                "Could not get the placement decisions",
                PropagationError::DecisionsUnavailable,
            ));
        };

        let records = if disabled {
            Vec::new()
        } else {
            let selector = root.replica_selector();
            let replicas = match retry
                .execute("Retrying to list the replicated policies", || {
                    store.list::<Policy>(None, &selector)
                })
                .await
            {
                Ok(replicas) => replicas,
                Err(e) => {
                    info!("Giving up on listing the replicated policies");
                    return Err(self.warning(root, "Could not list the replicated policies", e.into()));
                }
            };

            for cluster in &outcome.failed {
                info!(
                    cluster = %cluster,
                    "Setting the policy to noncompliant since the replication failed"
                );
            }
            cluster_statuses(&replicas, &outcome.failed)
        };

        let mut updated = root.clone();
        updated.status = root_status(records, outcome.placements);

        if updated.status == root.status {
            debug!("Root policy status is unchanged");
        } else if let Err(e) = retry
            .execute("Retrying to update the root policy status", || {
                store.patch_status(root, &updated)
            })
            .await
        {
            error!(error = %e, "Giving up on updating the root policy status");
            return Err(self.warning(root, "Failed to update the policy status", e.into()));
        }

        if let Err(e) = self.cleanup_orphans(&updated, &outcome.decided).await {
            error!(error = %e, "Giving up on deleting the orphaned replicated policies");
            return Err(self.warning(root, "Failed to delete orphaned replicated policies", e));
        }

        info!("Reconciliation complete");
        Ok(())
    }

    /// Resolve every binding naming the root and replicate to its clusters.
    ///
    /// Returns `None` when decisions for a binding could not be resolved,
    /// which leaves the pass without a trustworthy decision set.
    async fn handle_decisions(
        &self,
        root: &Policy,
        bindings: &[PlacementBinding],
    ) -> Option<DecisionOutcome> {
        let store = &*self.store;
        let retry = &self.config.retry;
        let replicator = Replicator::new(
            store,
            &self.config.templates,
            &*self.resolver,
            &*self.recorder,
        );

        let mut outcome = DecisionOutcome::default();

        for binding in bindings.iter().filter(|b| b.binds(root)) {
            let resolved = retry
                .execute("Retrying to get the placement decisions", || {
                    resolve_decisions(store, binding, root)
                })
                .await;

            let ResolvedPlacement { decisions, summary } = match resolved {
                Ok(resolved) => resolved,
                Err(e) => {
                    warn!(binding = %binding.name(), error = %e, "Giving up on getting the placement decisions");
                    return None;
                }
            };

            outcome.placements.push(summary);
            if root.spec.disabled {
                continue;
            }

            for decision in decisions {
                let key = decision.key();
                outcome.decided.insert(key.clone());

                let replicated = retry
                    .execute("Retrying to replicate the policy", || {
                        replicator.replicate_to(root, &decision)
                    })
                    .await;

                if let Err(e) = replicated {
                    info!(
                        cluster_namespace = %decision.cluster_namespace,
                        replica = %root.full_name(),
                        error = %e,
                        "Giving up on replicating the policy"
                    );
                    outcome.failed.insert(key);
                }
            }
        }

        Some(outcome)
    }

    /// Delete every replica of the root policy.
    ///
    /// Individual failures do not stop the sweep; they are reported as one
    /// aggregate error at the end.
    pub async fn cleanup_policy(&self, root: &Policy) -> PropagationResult<()> {
        let store = &*self.store;
        let retry = &self.config.retry;
        let selector = root.replica_selector();

        let replicas = retry
            .execute("Retrying to list the replicated policies", || {
                store.list::<Policy>(None, &selector)
            })
            .await?;

        let mut failed = 0;
        for replica in &replicas {
            if let Err(e) = self.delete_replica(replica.namespace(), replica.name()).await {
                error!(
                    namespace = %replica.namespace(),
                    name = %replica.name(),
                    error = %e,
                    "Failed to delete replicated policy"
                );
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(PropagationError::AggregateCleanupFailure {
                message: "failed to delete one or more replicated policies".to_string(),
                failed,
            });
        }
        Ok(())
    }

    /// Delete replicas recorded in `updated`'s status whose cluster is not
    /// part of the current decision set.
    async fn cleanup_orphans(
        &self,
        updated: &Policy,
        decided: &BTreeSet<String>,
    ) -> PropagationResult<()> {
        let name = updated.full_name();
        let mut failed = 0;

        for cluster in &updated.status.status {
            let key = format!("{}/{}", cluster.cluster_namespace, cluster.cluster_name);
            if decided.contains(&key) {
                continue;
            }

            info!(
                cluster_namespace = %cluster.cluster_namespace,
                replica = %name,
                "Deleting orphaned replicated policy"
            );
            if let Err(e) = self.delete_replica(&cluster.cluster_namespace, &name).await {
                error!(
                    cluster_namespace = %cluster.cluster_namespace,
                    replica = %name,
                    error = %e,
                    "Failed to delete the orphaned replicated policy"
                );
                failed += 1;
            }
        }

        if failed > 0 {
            return Err(PropagationError::AggregateCleanupFailure {
                message: "one or more orphaned replicated policies failed to be deleted".to_string(),
                failed,
            });
        }
        Ok(())
    }

    /// Delete one replica, treating an absent object as deleted.
    async fn delete_replica(&self, namespace: &str, name: &str) -> PropagationResult<()> {
        let store = &*self.store;
        let deleted = self
            .config
            .retry
            .execute("Retrying to delete the replicated policy", || async move {
                match store.delete::<Policy>(namespace, name).await {
                    Err(e) if e.is_not_found() => Ok(()),
                    other => other,
                }
            })
            .await;
        Ok(deleted?)
    }

    fn event(&self, root: &Policy, event_type: EventType, message: &str) {
        self.recorder
            .record(&EventSubject::of(root), event_type, EVENT_REASON, message);
    }

    /// Record `<prefix> for the policy <ns>/<name>` and hand the error back.
    fn warning(&self, root: &Policy, prefix: &str, err: PropagationError) -> PropagationError {
        self.event(
            root,
            EventType::Warning,
            &format!(
                "{prefix} for the policy {}/{}",
                root.namespace(),
                root.name()
            ),
        );
        err
    }
}
