//! Propagation background worker.
//!
//! Runs a reconciliation pass over every root policy on a periodic
//! interval. Root policies whose last reconciliation failed are held back
//! for the configured requeue delay.

use std::sync::Mutex;
use std::time::Duration;

use propagator_api::{Policy, Resource};
use propagator_reconcile::RequeueTracker;
use serde::Serialize;
use tokio::sync::watch;
use tracing::{error, info, instrument, warn};

use crate::error::PropagationResult;
use crate::reconciler::PolicyReconciler;
use crate::store::{LabelSelector, ObjectStore};

/// Shortest interval between passes.
const MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Counters for one worker pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PassStats {
    pub reconciled: usize,
    pub failed: usize,
    /// Held back by the requeue delay.
    pub skipped: usize,
}

/// Worker that periodically reconciles all root policies.
pub struct PropagationWorker<S> {
    reconciler: PolicyReconciler<S>,
    interval: Duration,
    requeue: Mutex<RequeueTracker>,
}

impl<S: ObjectStore> PropagationWorker<S> {
    pub fn new(reconciler: PolicyReconciler<S>) -> Self {
        let config = reconciler.config();
        let interval = config.resync_interval.max(MIN_INTERVAL);
        let requeue = RequeueTracker::new(config.requeue_error_delay);
        Self {
            reconciler,
            interval,
            requeue: Mutex::new(requeue),
        }
    }

    pub fn reconciler(&self) -> &PolicyReconciler<S> {
        &self.reconciler
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting propagation worker"
        );

        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        error!(error = %e, "Propagation pass failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Propagation worker shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// Reconcile every root policy once, in namespace/name order.
    pub async fn run_once(&self) -> PropagationResult<PassStats> {
        let store = self.reconciler.store();
        let no_selector = LabelSelector::new();
        let policies = self
            .reconciler
            .config()
            .retry
            .execute("Retrying to list the root policies", || {
                store.list::<Policy>(None, &no_selector)
            })
            .await?;

        self.requeue_tracker().prune();

        let mut stats = PassStats::default();
        for root in policies.iter().filter(|p| p.is_root()) {
            let key = root.metadata().key();
            if self.requeue_tracker().is_pending(&key) {
                stats.skipped += 1;
                continue;
            }

            match self.reconciler.reconcile(root).await {
                Ok(()) => {
                    self.requeue_tracker().clear(&key);
                    stats.reconciled += 1;
                }
                Err(e) => {
                    warn!(policy = %key, error = %e, "Reconciling the root policy failed, requeueing");
                    self.requeue_tracker().record_failure(&key);
                    stats.failed += 1;
                }
            }
        }

        if stats.failed > 0 || stats.reconciled > 0 {
            info!(
                reconciled = stats.reconciled,
                failed = stats.failed,
                skipped = stats.skipped,
                "Propagation pass complete"
            );
        }

        Ok(stats)
    }

    fn requeue_tracker(&self) -> std::sync::MutexGuard<'_, RequeueTracker> {
        self.requeue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::replicator::build_replica;
    use crate::store::{InMemoryStore, Operation};
    use crate::telemetry::MemoryEventRecorder;
    use crate::templates::HubTemplateResolver;
    use propagator_api::{ClusterDecision, PlacementBinding};
    use propagator_reconcile::RetryPolicy;

    fn worker(store: Arc<InMemoryStore>, requeue: Duration) -> PropagationWorker<InMemoryStore> {
        worker_with(
            store,
            Config {
                retry: RetryPolicy::immediate(2),
                requeue_error_delay: requeue,
                ..Config::default()
            },
        )
    }

    fn worker_with(store: Arc<InMemoryStore>, config: Config) -> PropagationWorker<InMemoryStore> {
        PropagationWorker::new(PolicyReconciler::new(
            store,
            Arc::new(HubTemplateResolver::new()),
            Arc::new(MemoryEventRecorder::new()),
            Arc::new(config),
        ))
    }

    #[tokio::test]
    async fn test_run_once_skips_replicas() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(Policy::new("policies", "p1")).unwrap();
        store.insert(Policy::new("policies", "p2")).unwrap();

        let replica = build_replica(
            &Policy::new("policies", "p1"),
            &ClusterDecision::new("cluster1", "cluster1"),
        );
        store.insert(replica).unwrap();

        let stats = worker(store, Duration::from_secs(300)).run_once().await.unwrap();
        assert_eq!(
            stats,
            PassStats {
                reconciled: 2,
                failed: 0,
                skipped: 0
            }
        );
    }

    #[tokio::test]
    async fn test_failed_root_is_held_back() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(Policy::new("policies", "p1")).unwrap();
        store.fail_next::<PlacementBinding>(Operation::List, 2);

        let worker = worker(Arc::clone(&store), Duration::from_secs(300));

        let first = worker.run_once().await.unwrap();
        assert_eq!(first.failed, 1);

        let second = worker.run_once().await.unwrap();
        assert_eq!(second.skipped, 1);
        assert_eq!(second.reconciled, 0);
    }

    #[tokio::test]
    async fn test_zero_requeue_delay_retries_next_pass() {
        let store = Arc::new(InMemoryStore::new());
        store.insert(Policy::new("policies", "p1")).unwrap();
        store.fail_next::<PlacementBinding>(Operation::List, 2);

        let worker = worker(Arc::clone(&store), Duration::ZERO);

        assert_eq!(worker.run_once().await.unwrap().failed, 1);
        assert_eq!(worker.run_once().await.unwrap().reconciled, 1);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let store = Arc::new(InMemoryStore::new());
        let worker = worker(store, Duration::from_secs(300));
        let (tx, rx) = watch::channel(false);

        let handle = async {
            worker.run(rx).await;
        };
        let stop = async {
            tx.send(true).unwrap();
        };
        tokio::join!(handle, stop);
    }

    #[tokio::test]
    async fn test_zero_resync_interval_is_clamped() {
        let store = Arc::new(InMemoryStore::new());
        let config = Config {
            resync_interval: Duration::ZERO,
            ..Config::default()
        };
        let worker = worker_with(store, config);
        assert_eq!(worker.interval, MIN_INTERVAL);

        let (tx, rx) = watch::channel(false);
        let handle = async {
            worker.run(rx).await;
        };
        let stop = async {
            tx.send(true).unwrap();
        };
        tokio::join!(handle, stop);
    }
}
