//! Kubernetes-backed [`ObjectStore`].
//!
//! Writes are JSON merge patches that only carry the label keys being changed,
//! so labels managed by other controllers are never rewritten. The observed
//! `resourceVersion` is included in every patch, which turns a concurrent
//! modification into a `409 Conflict` instead of a lost update.

use super::nodes::{self, NodeLookup};
use super::{
    LabelUpdate, LabeledObject, MachineSetId, MachineSetState, MachineState, ObjectKind,
    ObjectStore, StoreError, StoreResult, TargetRef,
};
use crate::crds::{Machine, MachineSet};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams, Patch, PatchParams};
use kube::{Client, ResourceExt};
use serde_json::{json, Map, Value};
use std::fmt::Display;
use tracing::{debug, instrument, warn};

const FIELD_MANAGER: &str = "node-metadata-operator";

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    #[must_use]
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    fn nodes(&self) -> Api<Node> {
        Api::all(self.client.clone())
    }
}

fn store_error(target: impl Display, err: kube::Error) -> StoreError {
    match err {
        kube::Error::Api(response) if response.code == 404 => StoreError::NotFound {
            target: target.to_string(),
        },
        kube::Error::Api(response) if response.code == 409 => StoreError::Conflict {
            target: target.to_string(),
        },
        other => StoreError::Backend(format!("{target}: {other}")),
    }
}

/// Project a `MachineSet` onto the reconciler's view.
#[must_use]
pub fn machine_set_state(machine_set: &MachineSet) -> Option<MachineSetState> {
    Some(MachineSetState {
        id: MachineSetId::new(machine_set.namespace()?, machine_set.metadata.name.clone()?),
        uid: machine_set.uid(),
        selector: machine_set.spec.selector.clone(),
        desired_labels: machine_set.template_labels().cloned(),
    })
}

/// Project a `Machine` onto the reconciler's view.
#[must_use]
pub fn machine_state(machine: &Machine) -> Option<MachineState> {
    let target = TargetRef::namespaced(
        ObjectKind::Machine,
        machine.namespace()?,
        machine.metadata.name.clone()?,
    );

    Some(MachineState {
        object: LabeledObject {
            target,
            labels: machine.propagated_labels().cloned(),
            annotations: machine.metadata.annotations.clone(),
            resource_version: machine.resource_version(),
        },
        node_name: machine.node_name().map(str::to_string),
        provider_id: machine.spec.provider_id.clone(),
    })
}

/// Decide whether `machine` belongs to `machine_set`.
///
/// A controller owner reference is authoritative. Machines without one are
/// matched through the set's selector, the way the Machine API adopts orphans.
#[must_use]
pub fn is_owned_by(machine: &Machine, machine_set: &MachineSetState) -> bool {
    if machine.namespace().as_deref() != Some(machine_set.id.namespace.as_str()) {
        return false;
    }

    let controller = machine
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true));

    match controller {
        Some(owner) => {
            owner.kind == "MachineSet"
                && match &machine_set.uid {
                    Some(uid) => owner.uid == *uid,
                    None => owner.name == machine_set.id.name,
                }
        }
        None => machine_set.selector.matches(machine.metadata.labels.as_ref()),
    }
}

/// Build the merge patch for a label update.
pub fn build_patch(update: &LabelUpdate) -> StoreResult<Value> {
    let mut labels = Map::new();
    for (key, value) in &update.diff.upserts {
        labels.insert(key.clone(), Value::String(value.clone()));
    }
    for key in &update.diff.removals {
        labels.insert(key.clone(), Value::Null);
    }

    let mut annotations = Map::new();
    for (key, value) in &update.annotations {
        let value = value.clone().map_or(Value::Null, Value::String);
        annotations.insert(key.clone(), value);
    }

    let mut metadata = Map::new();
    if let Some(version) = &update.resource_version {
        metadata.insert("resourceVersion".to_string(), Value::String(version.clone()));
    }
    if !annotations.is_empty() {
        metadata.insert("annotations".to_string(), Value::Object(annotations));
    }

    match update.target.kind {
        ObjectKind::Machine => Ok(json!({
            "metadata": metadata,
            "spec": { "metadata": { "labels": labels } },
        })),
        ObjectKind::Node => {
            metadata.insert("labels".to_string(), Value::Object(labels));
            Ok(json!({ "metadata": metadata }))
        }
        ObjectKind::MachineSet => Err(StoreError::Backend(format!(
            "label updates are not supported for {}",
            update.target
        ))),
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    #[instrument(skip(self), fields(machine_set = %id))]
    async fn get_machine_set(&self, id: &MachineSetId) -> StoreResult<Option<MachineSetState>> {
        let api: Api<MachineSet> = Api::namespaced(self.client.clone(), &id.namespace);
        let machine_set = api
            .get_opt(&id.name)
            .await
            .map_err(|e| store_error(format!("MachineSet {id}"), e))?;

        Ok(machine_set.as_ref().and_then(machine_set_state))
    }

    #[instrument(skip(self, machine_set), fields(machine_set = %machine_set.id))]
    async fn list_machines_owned_by(
        &self,
        machine_set: &MachineSetState,
    ) -> StoreResult<Vec<MachineState>> {
        let list = self
            .machines(&machine_set.id.namespace)
            .list(&ListParams::default())
            .await
            .map_err(|e| store_error(format!("Machines in {}", machine_set.id.namespace), e))?;

        let owned: Vec<MachineState> = list
            .items
            .iter()
            .filter(|machine| is_owned_by(machine, machine_set))
            .filter_map(machine_state)
            .collect();

        debug!(
            total = list.items.len(),
            owned = owned.len(),
            "Listed machines for MachineSet"
        );
        Ok(owned)
    }

    #[instrument(skip(self, machine), fields(machine = %machine.object.target))]
    async fn get_node_for_machine(
        &self,
        machine: &MachineState,
    ) -> StoreResult<Option<LabeledObject>> {
        match nodes::lookup_for(machine) {
            NodeLookup::ByName(name) => {
                let node = self
                    .nodes()
                    .get_opt(name)
                    .await
                    .map_err(|e| store_error(format!("Node {name}"), e))?;
                if node.is_none() {
                    warn!(node = %name, "Machine references a Node that does not exist");
                }
                Ok(node.as_ref().and_then(nodes::labeled_node))
            }
            NodeLookup::ByProviderId(provider_id) => {
                let list = self
                    .nodes()
                    .list(&ListParams::default())
                    .await
                    .map_err(|e| store_error("Nodes", e))?;
                Ok(nodes::find_by_provider_id(&list.items, provider_id)
                    .and_then(nodes::labeled_node))
            }
            NodeLookup::Unbound => Ok(None),
        }
    }

    #[instrument(skip(self, update), fields(target = %update.target, changes = update.diff.len()))]
    async fn update_labels(&self, update: &LabelUpdate) -> StoreResult<()> {
        let patch = build_patch(update)?;
        let params = PatchParams {
            field_manager: Some(FIELD_MANAGER.to_string()),
            ..PatchParams::default()
        };
        let target = &update.target;

        match (target.kind, target.namespace.as_deref()) {
            (ObjectKind::Machine, Some(namespace)) => {
                self.machines(namespace)
                    .patch(&target.name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| store_error(target, e))?;
            }
            (ObjectKind::Node, _) => {
                self.nodes()
                    .patch(&target.name, &params, &Patch::Merge(&patch))
                    .await
                    .map_err(|e| store_error(target, e))?;
            }
            _ => {
                return Err(StoreError::Backend(format!(
                    "cannot update labels on {target}"
                )))
            }
        }

        debug!("Patched labels");
        Ok(())
    }
}
