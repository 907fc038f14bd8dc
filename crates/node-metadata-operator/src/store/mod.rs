//! # Object Store Abstraction
//!
//! The reconciler never talks to the Kubernetes API directly. It reads and
//! writes through [`ObjectStore`], a small capability interface covering the
//! three object kinds it cares about:
//!
//! - **`KubeStore`**: backed by the API server through kube-rs
//! - **`InMemoryStore`**: explicit ownership relation, used by tests and tooling

pub mod kubernetes;
pub mod memory;
pub mod nodes;

pub use kubernetes::KubeStore;
pub use memory::InMemoryStore;

use crate::crds::MachineSelector;
use crate::labels::{LabelDiff, LabelSet};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

/// Kinds of objects the operator reads or writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ObjectKind {
    MachineSet,
    Machine,
    Node,
}

impl fmt::Display for ObjectKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ObjectKind::MachineSet => write!(f, "MachineSet"),
            ObjectKind::Machine => write!(f, "Machine"),
            ObjectKind::Node => write!(f, "Node"),
        }
    }
}

/// Identity of a `MachineSet`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MachineSetId {
    pub namespace: String,
    pub name: String,
}

impl MachineSetId {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MachineSetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Reference to an object whose labels can be updated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TargetRef {
    pub kind: ObjectKind,
    pub namespace: Option<String>,
    pub name: String,
}

impl TargetRef {
    pub fn namespaced(kind: ObjectKind, namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    pub fn cluster(kind: ObjectKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            namespace: None,
            name: name.into(),
        }
    }
}

impl fmt::Display for TargetRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Snapshot of a `MachineSet` as seen by the reconciler.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineSetState {
    pub id: MachineSetId,
    pub uid: Option<String>,
    pub selector: MachineSelector,
    /// Template labels; `None` when the template declares none
    pub desired_labels: Option<LabelSet>,
}

/// Labels and annotations of a Machine or Node, with its concurrency token.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledObject {
    pub target: TargetRef,
    pub labels: Option<LabelSet>,
    pub annotations: Option<BTreeMap<String, String>>,
    pub resource_version: Option<String>,
}

impl LabeledObject {
    pub fn new(target: TargetRef) -> Self {
        Self {
            target,
            labels: None,
            annotations: None,
            resource_version: None,
        }
    }
}

/// Snapshot of a `Machine`: its propagated labels plus how to find its Node.
#[derive(Debug, Clone, PartialEq)]
pub struct MachineState {
    pub object: LabeledObject,
    /// `status.nodeRef.name`, absent until provisioned
    pub node_name: Option<String>,
    pub provider_id: Option<String>,
}

/// A single label write.
#[derive(Debug, Clone, PartialEq)]
pub struct LabelUpdate {
    pub target: TargetRef,
    /// Expected resource version; a mismatch must fail with [`StoreError::Conflict`]
    pub resource_version: Option<String>,
    /// Complete label set after the update
    pub labels: LabelSet,
    /// Changes relative to the observed label set
    pub diff: LabelDiff,
    /// Annotation changes; `None` deletes the annotation
    pub annotations: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("{target} not found")]
    NotFound { target: String },

    #[error("{target} was modified concurrently")]
    Conflict { target: String },

    #[error("{0}")]
    Backend(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Capability interface over the cluster state the reconciler needs.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch a `MachineSet`; `None` when it no longer exists.
    async fn get_machine_set(&self, id: &MachineSetId) -> StoreResult<Option<MachineSetState>>;

    /// List the Machines owned by `machine_set`.
    async fn list_machines_owned_by(
        &self,
        machine_set: &MachineSetState,
    ) -> StoreResult<Vec<MachineState>>;

    /// Resolve the Node backing `machine`; `None` while unbound.
    async fn get_node_for_machine(&self, machine: &MachineState)
        -> StoreResult<Option<LabeledObject>>;

    /// Persist new labels (and annotations) on a Machine or Node.
    async fn update_labels(&self, update: &LabelUpdate) -> StoreResult<()>;
}

#[async_trait]
impl<T: ObjectStore + ?Sized> ObjectStore for Arc<T> {
    async fn get_machine_set(&self, id: &MachineSetId) -> StoreResult<Option<MachineSetState>> {
        (**self).get_machine_set(id).await
    }

    async fn list_machines_owned_by(
        &self,
        machine_set: &MachineSetState,
    ) -> StoreResult<Vec<MachineState>> {
        (**self).list_machines_owned_by(machine_set).await
    }

    async fn get_node_for_machine(&self, machine: &MachineState)
        -> StoreResult<Option<LabeledObject>> {
        (**self).get_node_for_machine(machine).await
    }

    async fn update_labels(&self, update: &LabelUpdate) -> StoreResult<()> {
        (**self).update_labels(update).await
    }
}
