//! In-process object store.
//!
//! Behaves like the remote store the propagator talks to: it assigns
//! identity fields, enforces optimistic concurrency and applies status
//! patches as JSON merge patches. Used by tests and by the dry-run binary.
//!
//! Faults can be injected per operation and kind to exercise retry and
//! partial-failure paths, and every write is counted.

use std::collections::BTreeMap;
use std::sync::{Mutex, MutexGuard};

use async_trait::async_trait;
use propagator_api::{
    Placement, PlacementBinding, PlacementDecision, PlacementRule, Policy, Resource,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use super::{LabelSelector, ObjectStore, StoreError, StoreResult};

/// Store operations, for fault injection and accounting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Operation {
    Get,
    List,
    Create,
    Update,
    Delete,
    PatchStatus,
}

impl Operation {
    fn is_write(&self) -> bool {
        !matches!(self, Self::Get | Self::List)
    }
}

/// Every object in a store, grouped by kind.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    #[serde(default)]
    pub policies: Vec<Policy>,
    #[serde(default)]
    pub placement_bindings: Vec<PlacementBinding>,
    #[serde(default)]
    pub placement_rules: Vec<PlacementRule>,
    #[serde(default)]
    pub placements: Vec<Placement>,
    #[serde(default)]
    pub placement_decisions: Vec<PlacementDecision>,
}

/// (kind, namespace, name)
type ObjectKey = (&'static str, String, String);

#[derive(Debug)]
struct Fault {
    op: Operation,
    kind: &'static str,
    namespace: Option<String>,
    remaining: u32,
}

#[derive(Debug, Default)]
struct StoreState {
    objects: BTreeMap<ObjectKey, Value>,
    last_version: u64,
    faults: Vec<Fault>,
    calls: BTreeMap<Operation, u64>,
}

impl StoreState {
    fn next_version(&mut self) -> String {
        self.last_version += 1;
        self.last_version.to_string()
    }

    /// Count the call and fire a matching injected fault, if any.
    fn enter(&mut self, op: Operation, kind: &'static str, namespace: &str) -> StoreResult<()> {
        *self.calls.entry(op).or_default() += 1;

        let fault = self.faults.iter_mut().find(|f| {
            f.op == op
                && f.kind == kind
                && f.remaining > 0
                && f.namespace.as_deref().is_none_or(|ns| ns == namespace)
        });

        match fault {
            Some(fault) => {
                fault.remaining -= 1;
                debug!(?op, kind, namespace, "injected store fault");
                Err(StoreError::Unavailable(format!(
                    "injected fault on {op:?} {kind}"
                )))
            }
            None => Ok(()),
        }
    }
}

/// Thread-safe in-memory [`ObjectStore`].
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: Mutex<StoreState>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store holding every object of the snapshot.
    pub fn from_snapshot(snapshot: Snapshot) -> StoreResult<Self> {
        let store = Self::new();
        for object in snapshot.policies {
            store.insert(object)?;
        }
        for object in snapshot.placement_bindings {
            store.insert(object)?;
        }
        for object in snapshot.placement_rules {
            store.insert(object)?;
        }
        for object in snapshot.placements {
            store.insert(object)?;
        }
        for object in snapshot.placement_decisions {
            store.insert(object)?;
        }
        Ok(store)
    }

    /// Export every object.
    pub fn snapshot(&self) -> StoreResult<Snapshot> {
        Ok(Snapshot {
            policies: self.objects()?,
            placement_bindings: self.objects()?,
            placement_rules: self.objects()?,
            placements: self.objects()?,
            placement_decisions: self.objects()?,
        })
    }

    fn lock(&self) -> MutexGuard<'_, StoreState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Seed an object, replacing any existing one. Not counted as a write.
    pub fn insert<K: Resource>(&self, mut object: K) -> StoreResult<K> {
        let mut state = self.lock();
        let version = state.next_version();
        let meta = object.metadata_mut();
        meta.resource_version = Some(version);
        if meta.uid.is_none() {
            meta.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        let key = (K::KIND, meta.namespace.clone(), meta.name.clone());
        state.objects.insert(key, serde_json::to_value(&object)?);
        Ok(object)
    }

    /// Read an object without counting a call.
    pub fn peek<K: Resource>(&self, namespace: &str, name: &str) -> StoreResult<Option<K>> {
        let state = self.lock();
        let key = (K::KIND, namespace.to_string(), name.to_string());
        state
            .objects
            .get(&key)
            .map(|v| serde_json::from_value(v.clone()).map_err(StoreError::from))
            .transpose()
    }

    /// Every object of a kind, ordered by namespace and name.
    pub fn objects<K: Resource>(&self) -> StoreResult<Vec<K>> {
        let state = self.lock();
        state
            .objects
            .iter()
            .filter(|((kind, _, _), _)| *kind == K::KIND)
            .map(|(_, v)| serde_json::from_value(v.clone()).map_err(StoreError::from))
            .collect()
    }

    /// Fail the next `times` calls of `op` on kind `K`.
    pub fn fail_next<K: Resource>(&self, op: Operation, times: u32) {
        self.lock().faults.push(Fault {
            op,
            kind: K::KIND,
            namespace: None,
            remaining: times,
        });
    }

    /// Fail the next `times` calls of `op` on kind `K` in one namespace.
    pub fn fail_next_in<K: Resource>(&self, op: Operation, namespace: &str, times: u32) {
        self.lock().faults.push(Fault {
            op,
            kind: K::KIND,
            namespace: Some(namespace.to_string()),
            remaining: times,
        });
    }

    /// Number of calls made for an operation.
    pub fn calls(&self, op: Operation) -> u64 {
        self.lock().calls.get(&op).copied().unwrap_or(0)
    }

    /// Number of mutating calls made, successful or not.
    pub fn writes(&self) -> u64 {
        self.lock()
            .calls
            .iter()
            .filter(|(op, _)| op.is_write())
            .map(|(_, n)| n)
            .sum()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get<K: Resource>(&self, namespace: &str, name: &str) -> StoreResult<K> {
        let mut state = self.lock();
        state.enter(Operation::Get, K::KIND, namespace)?;

        let key = (K::KIND, namespace.to_string(), name.to_string());
        let value = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::not_found::<K>(namespace, name))?;
        Ok(serde_json::from_value(value.clone())?)
    }

    async fn list<K: Resource>(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> StoreResult<Vec<K>> {
        let mut state = self.lock();
        state.enter(Operation::List, K::KIND, namespace.unwrap_or_default())?;

        let mut items = Vec::new();
        for ((kind, ns, _), value) in &state.objects {
            if *kind != K::KIND || namespace.is_some_and(|n| n != ns.as_str()) {
                continue;
            }
            let object: K = serde_json::from_value(value.clone())?;
            if object.metadata().matches_labels(selector) {
                items.push(object);
            }
        }
        Ok(items)
    }

    async fn create<K: Resource>(&self, object: &K) -> StoreResult<K> {
        let mut state = self.lock();
        let meta = object.metadata();
        state.enter(Operation::Create, K::KIND, &meta.namespace)?;

        let key = (K::KIND, meta.namespace.clone(), meta.name.clone());
        if state.objects.contains_key(&key) {
            return Err(StoreError::AlreadyExists {
                kind: K::KIND.to_string(),
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            });
        }

        let mut created = object.clone();
        let version = state.next_version();
        let meta = created.metadata_mut();
        meta.resource_version = Some(version);
        meta.uid = Some(uuid::Uuid::new_v4().to_string());
        state.objects.insert(key, serde_json::to_value(&created)?);
        Ok(created)
    }

    async fn update<K: Resource>(&self, object: &K) -> StoreResult<K> {
        let mut state = self.lock();
        let meta = object.metadata();
        state.enter(Operation::Update, K::KIND, &meta.namespace)?;

        let key = (K::KIND, meta.namespace.clone(), meta.name.clone());
        let stored_version = state
            .objects
            .get(&key)
            .ok_or_else(|| StoreError::not_found::<K>(&meta.namespace, &meta.name))?
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str)
            .map(str::to_string);

        if meta.resource_version.is_some() && meta.resource_version != stored_version {
            return Err(StoreError::Conflict {
                kind: K::KIND.to_string(),
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            });
        }

        let mut updated = object.clone();
        let version = state.next_version();
        updated.metadata_mut().resource_version = Some(version);
        state.objects.insert(key, serde_json::to_value(&updated)?);
        Ok(updated)
    }

    async fn delete<K: Resource>(&self, namespace: &str, name: &str) -> StoreResult<()> {
        let mut state = self.lock();
        state.enter(Operation::Delete, K::KIND, namespace)?;

        let key = (K::KIND, namespace.to_string(), name.to_string());
        state
            .objects
            .remove(&key)
            .map(|_| ())
            .ok_or_else(|| StoreError::not_found::<K>(namespace, name))
    }

    async fn patch_status<K: Resource>(&self, original: &K, updated: &K) -> StoreResult<K> {
        let mut state = self.lock();
        let meta = original.metadata();
        state.enter(Operation::PatchStatus, K::KIND, &meta.namespace)?;

        let key = (K::KIND, meta.namespace.clone(), meta.name.clone());
        let original_json = serde_json::to_value(original)?;
        let updated_json = serde_json::to_value(updated)?;
        let patch = merge_diff(
            original_json.get("status").unwrap_or(&Value::Null),
            updated_json.get("status").unwrap_or(&Value::Null),
        );

        let version = state.next_version();
        let stored = state
            .objects
            .get_mut(&key)
            .ok_or_else(|| StoreError::not_found::<K>(&meta.namespace, &meta.name))?;

        let stored_version = stored
            .pointer("/metadata/resourceVersion")
            .and_then(Value::as_str);
        if meta.resource_version.is_some() && meta.resource_version.as_deref() != stored_version {
            return Err(StoreError::Conflict {
                kind: K::KIND.to_string(),
                namespace: meta.namespace.clone(),
                name: meta.name.clone(),
            });
        }

        if let Some(patch) = patch {
            if let Some(obj) = stored.as_object_mut() {
                apply_merge_patch(obj.entry("status").or_insert(Value::Null), &patch);
            }
        }
        if let Some(meta) = stored.get_mut("metadata").and_then(Value::as_object_mut) {
            meta.insert("resourceVersion".to_string(), Value::String(version));
        }

        Ok(serde_json::from_value(stored.clone())?)
    }
}

/// JSON merge patch turning `original` into `updated`, or `None` if equal.
fn merge_diff(original: &Value, updated: &Value) -> Option<Value> {
    match (original, updated) {
        (Value::Object(o), Value::Object(u)) => {
            let mut patch = Map::new();
            for (k, ov) in o {
                match u.get(k) {
                    None => {
                        patch.insert(k.clone(), Value::Null);
                    }
                    Some(uv) => {
                        if let Some(d) = merge_diff(ov, uv) {
                            patch.insert(k.clone(), d);
                        }
                    }
                }
            }
            for (k, uv) in u {
                if !o.contains_key(k) {
                    patch.insert(k.clone(), uv.clone());
                }
            }
            (!patch.is_empty()).then_some(Value::Object(patch))
        }
        _ if original == updated => None,
        _ => Some(updated.clone()),
    }
}

fn apply_merge_patch(target: &mut Value, patch: &Value) {
    let Value::Object(entries) = patch else {
        *target = patch.clone();
        return;
    };

    if !target.is_object() {
        *target = Value::Object(Map::new());
    }
    if let Some(obj) = target.as_object_mut() {
        for (k, v) in entries {
            if v.is_null() {
                obj.remove(k);
            } else {
                apply_merge_patch(obj.entry(k.clone()).or_insert(Value::Null), v);
            }
        }
    }
}
