//! In-memory [`ObjectStore`].
//!
//! Ownership is an explicit relation: every Machine is registered under the
//! `MachineSet` that owns it. Resource versions are tracked so stale writes fail
//! with a conflict, and individual targets can be told to reject updates.

use super::nodes::{self, NodeLookup};
use super::{
    LabelUpdate, LabeledObject, MachineSetId, MachineSetState, MachineState, ObjectKind,
    ObjectStore, StoreError, StoreResult, TargetRef,
};
use crate::crds::MachineSelector;
use crate::labels::LabelSet;
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet};
use tokio::sync::RwLock;

struct StoredMachine {
    owner: MachineSetId,
    state: MachineState,
}

struct StoredNode {
    object: LabeledObject,
    provider_id: Option<String>,
}

#[derive(Default)]
struct State {
    machine_sets: BTreeMap<MachineSetId, MachineSetState>,
    machines: BTreeMap<TargetRef, StoredMachine>,
    nodes: BTreeMap<String, StoredNode>,
    failing_targets: BTreeSet<TargetRef>,
    failing_lists: bool,
    updates: Vec<TargetRef>,
    version: u64,
}

impl State {
    fn next_version(&mut self) -> Option<String> {
        self.version += 1;
        Some(self.version.to_string())
    }

    fn object(&self, target: &TargetRef) -> Option<&LabeledObject> {
        match target.kind {
            ObjectKind::Machine => self.machines.get(target).map(|m| &m.state.object),
            ObjectKind::Node => self.nodes.get(&target.name).map(|n| &n.object),
            ObjectKind::MachineSet => None,
        }
    }

    fn object_mut(&mut self, target: &TargetRef) -> Option<&mut LabeledObject> {
        match target.kind {
            ObjectKind::Machine => self.machines.get_mut(target).map(|m| &mut m.state.object),
            ObjectKind::Node => self.nodes.get_mut(&target.name).map(|n| &mut n.object),
            ObjectKind::MachineSet => None,
        }
    }
}

#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create or replace a `MachineSet` with the given template labels.
    pub async fn put_machine_set(&self, id: &MachineSetId, desired_labels: Option<LabelSet>) {
        let mut state = self.state.write().await;
        state.machine_sets.insert(
            id.clone(),
            MachineSetState {
                id: id.clone(),
                uid: Some(format!("uid-{}-{}", id.namespace, id.name)),
                selector: MachineSelector::default(),
                desired_labels,
            },
        );
    }

    /// Change the template labels of an existing `MachineSet`.
    pub async fn set_desired_labels(&self, id: &MachineSetId, desired_labels: Option<LabelSet>) {
        if let Some(machine_set) = self.state.write().await.machine_sets.get_mut(id) {
            machine_set.desired_labels = desired_labels;
        }
    }

    pub async fn delete_machine_set(&self, id: &MachineSetId) {
        self.state.write().await.machine_sets.remove(id);
    }

    /// Register a Machine owned by `owner`.
    pub async fn put_machine(
        &self,
        owner: &MachineSetId,
        name: &str,
        labels: Option<LabelSet>,
    ) -> TargetRef {
        let mut state = self.state.write().await;
        let target = TargetRef::namespaced(ObjectKind::Machine, owner.namespace.clone(), name);
        let resource_version = state.next_version();

        state.machines.insert(
            target.clone(),
            StoredMachine {
                owner: owner.clone(),
                state: MachineState {
                    object: LabeledObject {
                        labels,
                        resource_version,
                        ..LabeledObject::new(target.clone())
                    },
                    node_name: None,
                    provider_id: None,
                },
            },
        );
        target
    }

    /// Record the Node a Machine was provisioned as (`status.nodeRef`).
    pub async fn bind_machine(&self, machine: &TargetRef, node_name: &str) {
        if let Some(stored) = self.state.write().await.machines.get_mut(machine) {
            stored.state.node_name = Some(node_name.to_string());
        }
    }

    /// Set the provider ID a Machine reports before its node reference appears.
    pub async fn set_machine_provider_id(&self, machine: &TargetRef, provider_id: &str) {
        if let Some(stored) = self.state.write().await.machines.get_mut(machine) {
            stored.state.provider_id = Some(provider_id.to_string());
        }
    }

    pub async fn put_node(
        &self,
        name: &str,
        labels: Option<LabelSet>,
        provider_id: Option<&str>,
    ) -> TargetRef {
        let mut state = self.state.write().await;
        let target = TargetRef::cluster(ObjectKind::Node, name);
        let resource_version = state.next_version();

        state.nodes.insert(
            name.to_string(),
            StoredNode {
                object: LabeledObject {
                    labels,
                    resource_version,
                    ..LabeledObject::new(target.clone())
                },
                provider_id: provider_id.map(str::to_string),
            },
        );
        target
    }

    /// Edit a label the way another actor would, bumping the resource version.
    pub async fn set_label(&self, target: &TargetRef, key: &str, value: &str) {
        let mut state = self.state.write().await;
        let version = state.next_version();
        if let Some(object) = state.object_mut(target) {
            object
                .labels
                .get_or_insert_with(LabelSet::new)
                .insert(key.to_string(), value.to_string());
            object.resource_version = version;
        }
    }

    /// Current view of a Machine or Node.
    pub async fn object(&self, target: &TargetRef) -> Option<LabeledObject> {
        self.state.read().await.object(target).cloned()
    }

    /// Current labels of a Machine or Node.
    pub async fn labels(&self, target: &TargetRef) -> Option<LabelSet> {
        self.object(target).await.and_then(|object| object.labels)
    }

    /// Make every update on `target` fail with a backend error.
    pub async fn fail_updates_on(&self, target: &TargetRef) {
        self.state.write().await.failing_targets.insert(target.clone());
    }

    /// Make Machine listing fail (or succeed again).
    pub async fn fail_lists(&self, failing: bool) {
        self.state.write().await.failing_lists = failing;
    }

    pub async fn clear_failures(&self) {
        let mut state = self.state.write().await;
        state.failing_targets.clear();
        state.failing_lists = false;
    }

    /// Targets of every successful update, in order.
    pub async fn updates(&self) -> Vec<TargetRef> {
        self.state.read().await.updates.clone()
    }
}

#[async_trait]
impl ObjectStore for InMemoryStore {
    async fn get_machine_set(&self, id: &MachineSetId) -> StoreResult<Option<MachineSetState>> {
        Ok(self.state.read().await.machine_sets.get(id).cloned())
    }

    async fn list_machines_owned_by(
        &self,
        machine_set: &MachineSetState,
    ) -> StoreResult<Vec<MachineState>> {
        let state = self.state.read().await;
        if state.failing_lists {
            return Err(StoreError::Backend(format!(
                "listing machines for {} failed",
                machine_set.id
            )));
        }

        Ok(state
            .machines
            .values()
            .filter(|stored| stored.owner == machine_set.id)
            .map(|stored| stored.state.clone())
            .collect())
    }

    async fn get_node_for_machine(
        &self,
        machine: &MachineState,
    ) -> StoreResult<Option<LabeledObject>> {
        let state = self.state.read().await;
        let node = match nodes::lookup_for(machine) {
            NodeLookup::ByName(name) => state.nodes.get(name),
            NodeLookup::ByProviderId(provider_id) => state
                .nodes
                .values()
                .find(|node| node.provider_id.as_deref() == Some(provider_id)),
            NodeLookup::Unbound => None,
        };
        Ok(node.map(|node| node.object.clone()))
    }

    async fn update_labels(&self, update: &LabelUpdate) -> StoreResult<()> {
        let mut state = self.state.write().await;
        let target = &update.target;

        if state.failing_targets.contains(target) {
            return Err(StoreError::Backend(format!("update of {target} rejected")));
        }

        let version = state.next_version();
        let object = state.object_mut(target).ok_or_else(|| StoreError::NotFound {
            target: target.to_string(),
        })?;

        if update.resource_version.is_some() && update.resource_version != object.resource_version {
            return Err(StoreError::Conflict {
                target: target.to_string(),
            });
        }

        object.labels = Some(update.labels.clone());
        for (key, value) in &update.annotations {
            match value {
                Some(value) => {
                    object
                        .annotations
                        .get_or_insert_with(BTreeMap::new)
                        .insert(key.clone(), value.clone());
                }
                None => {
                    if let Some(annotations) = object.annotations.as_mut() {
                        annotations.remove(key);
                    }
                }
            }
        }
        object.resource_version = version;

        state.updates.push(target.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::LabelDiff;

    fn update_for(object: &LabeledObject, labels: LabelSet) -> LabelUpdate {
        LabelUpdate {
            target: object.target.clone(),
            resource_version: object.resource_version.clone(),
            labels,
            diff: LabelDiff::default(),
            annotations: BTreeMap::from([("a/b".to_string(), Some("x".to_string()))]),
        }
    }

    #[tokio::test]
    async fn test_stale_resource_version_conflicts() {
        let store = InMemoryStore::new();
        let node = store.put_node("node-a", None, None).await;
        let observed = store.object(&node).await.unwrap();

        store.set_label(&node, "zone", "a").await;

        let err = store
            .update_labels(&update_for(&observed, LabelSet::new()))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict { .. }));
        assert!(store.updates().await.is_empty());
    }

    #[tokio::test]
    async fn test_update_writes_labels_and_annotations() {
        let store = InMemoryStore::new();
        let node = store.put_node("node-a", None, None).await;
        let observed = store.object(&node).await.unwrap();
        let labels = LabelSet::from([("env".to_string(), "prod".to_string())]);

        store.update_labels(&update_for(&observed, labels.clone())).await.unwrap();

        let current = store.object(&node).await.unwrap();
        assert_eq!(current.labels, Some(labels));
        assert_eq!(current.annotations.unwrap().get("a/b").unwrap(), "x");
        assert_ne!(current.resource_version, observed.resource_version);
        assert_eq!(store.updates().await, vec![node]);
    }

    #[tokio::test]
    async fn test_ownership_is_explicit() {
        let store = InMemoryStore::new();
        let workers = MachineSetId::new("ns", "workers");
        let infra = MachineSetId::new("ns", "infra");
        store.put_machine_set(&workers, None).await;
        store.put_machine(&workers, "workers-1", None).await;
        store.put_machine(&infra, "infra-1", None).await;

        let set = store.get_machine_set(&workers).await.unwrap().unwrap();
        let machines = store.list_machines_owned_by(&set).await.unwrap();

        assert_eq!(machines.len(), 1);
        assert_eq!(machines[0].object.target.name, "workers-1");
    }

    #[tokio::test]
    async fn test_node_resolution_by_provider_id() {
        let store = InMemoryStore::new();
        let owner = MachineSetId::new("ns", "workers");
        let machine = store.put_machine(&owner, "workers-1", None).await;
        store.put_node("node-a", None, Some("aws:///i-1")).await;
        store.set_machine_provider_id(&machine, "aws:///i-1").await;

        let set = MachineSetState {
            id: owner,
            uid: None,
            selector: MachineSelector::default(),
            desired_labels: None,
        };
        let state = store.list_machines_owned_by(&set).await.unwrap().remove(0);
        let node = store.get_node_for_machine(&state).await.unwrap().unwrap();

        assert_eq!(node.target.name, "node-a");
    }
}
