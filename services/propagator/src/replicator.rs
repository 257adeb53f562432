//! Per-cluster replication of a root policy.
//!
//! For one (root policy, cluster) pair the replica is created when
//! missing, updated when its spec or annotations diverge from the
//! (template-resolved) root, and left alone otherwise. Store errors are
//! returned as-is; the caller retries the whole operation.

use propagator_api::{
    annotations, compare_spec_and_annotations, labels, ClusterDecision, Policy, PolicyStatus,
    Resource,
};
use tracing::{debug, info};

use crate::error::PropagationResult;
use crate::store::{ignore_not_found, ObjectStore};
use crate::telemetry::{EventRecorder, EventSubject, EventType, EVENT_REASON};
use crate::templates::{policy_has_templates, TemplateConfig, TemplateEngine, TemplateResolver};

/// Build a fresh replica of `root` for the decision's cluster.
///
/// Identity fields, finalizers, owner references and status are cleared;
/// cluster and root-policy labels are set.
pub fn build_replica(root: &Policy, decision: &ClusterDecision) -> Policy {
    let mut replica = root.clone();
    replica.status = PolicyStatus::default();

    let metadata = &mut replica.metadata;
    metadata.name = root.full_name();
    metadata.namespace = decision.cluster_namespace.clone();
    metadata.uid = None;
    metadata.resource_version = None;
    metadata.finalizers.clear();
    metadata.owner_references.clear();
    metadata.annotations.remove(annotations::TRIGGER_UPDATE);

    metadata
        .labels
        .insert(labels::CLUSTER_NAME.to_string(), decision.cluster_name.clone());
    metadata.labels.insert(
        labels::CLUSTER_NAMESPACE.to_string(),
        decision.cluster_namespace.clone(),
    );
    metadata
        .labels
        .insert(labels::ROOT_POLICY.to_string(), root.full_name());

    replica
}

/// What [`Replicator::replicate_to`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaAction {
    Created,
    Updated,
    Unchanged,
}

/// Keeps the replica of a root policy in one cluster in sync.
pub struct Replicator<'a, S> {
    store: &'a S,
    templates: &'a TemplateConfig,
    engine: TemplateEngine<'a>,
    recorder: &'a dyn EventRecorder,
}

impl<'a, S: ObjectStore> Replicator<'a, S> {
    pub fn new(
        store: &'a S,
        templates: &'a TemplateConfig,
        resolver: &'a dyn TemplateResolver,
        recorder: &'a dyn EventRecorder,
    ) -> Self {
        Self {
            store,
            templates,
            engine: TemplateEngine::new(templates, resolver, recorder),
            recorder,
        }
    }

    /// Ensure the cluster's replica matches the root policy.
    pub async fn replicate_to(
        &self,
        root: &Policy,
        decision: &ClusterDecision,
    ) -> PropagationResult<ReplicaAction> {
        let name = root.full_name();
        let has_templates = policy_has_templates(root, self.templates);

        let existing = ignore_not_found(
            self.store
                .get::<Policy>(&decision.cluster_namespace, &name)
                .await,
        )?;

        let Some(existing) = existing else {
            let mut replica = build_replica(root, decision);
            if has_templates {
                self.engine.process(&mut replica, decision, root)?;
            }

            info!(
                policy_namespace = %root.namespace(),
                policy_name = %root.name(),
                cluster_namespace = %decision.cluster_namespace,
                cluster_name = %decision.cluster_name,
                "Creating the replicated policy"
            );
            self.store.create(&replica).await?;

            self.event(
                root,
                format!(
                    "Policy {}/{} was propagated to cluster {}/{}",
                    root.namespace(),
                    root.name(),
                    decision.cluster_namespace,
                    decision.cluster_name
                ),
            );
            return Ok(ReplicaAction::Created);
        };

        // Resolve into a copy of the root so a failure never touches the
        // live replica.
        let mut desired = root.clone();
        if has_templates {
            self.engine.process(&mut desired, decision, root)?;
        }
        desired
            .metadata
            .annotations
            .remove(annotations::TRIGGER_UPDATE);

        if compare_spec_and_annotations(&desired, &existing) {
            debug!(
                cluster_namespace = %decision.cluster_namespace,
                cluster_name = %decision.cluster_name,
                "Replicated policy is up to date"
            );
            return Ok(ReplicaAction::Unchanged);
        }

        let mut updated = existing;
        updated.metadata.annotations = desired.metadata.annotations;
        updated.spec = desired.spec;

        info!(
            policy_namespace = %root.namespace(),
            policy_name = %root.name(),
            cluster_namespace = %decision.cluster_namespace,
            cluster_name = %decision.cluster_name,
            "Root policy and replicated policy mismatch, updating replicated policy"
        );
        self.store.update(&updated).await?;

        self.event(
            root,
            format!(
                "Policy {}/{} was updated for cluster {}/{}",
                root.namespace(),
                root.name(),
                decision.cluster_namespace,
                decision.cluster_name
            ),
        );
        Ok(ReplicaAction::Updated)
    }

    fn event(&self, root: &Policy, message: String) {
        self.recorder.record(
            &EventSubject::of(root),
            EventType::Normal,
            EVENT_REASON,
            &message,
        );
    }
}
