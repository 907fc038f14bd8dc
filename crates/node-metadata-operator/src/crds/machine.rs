//! `Machine` Custom Resource Definition

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Metadata block nested in a Machine spec; its labels end up on the Node.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct ObjectMetaTemplate {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub annotations: Option<BTreeMap<String, String>>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "machine.openshift.io", version = "v1beta1", kind = "Machine")]
#[kube(namespaced)]
#[kube(status = "MachineStatus")]
#[kube(printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#)]
#[kube(printcolumn = r#"{"name":"Node","type":"string","jsonPath":".status.nodeRef.name"}"#)]
pub struct MachineSpec {
    /// Labels and annotations to apply to the backing Node
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ObjectMetaTemplate>,

    /// Cloud provider identifier, matches `Node.spec.providerID` once provisioned
    #[serde(default, rename = "providerID", skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<String>,
}

/// Reference from a Machine to the Node it provisioned.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct NodeReference {
    pub name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uid: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct MachineStatus {
    #[serde(default, rename = "nodeRef", skip_serializing_if = "Option::is_none")]
    pub node_ref: Option<NodeReference>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phase: Option<String>,
}

impl Machine {
    /// Labels propagated towards the Node (`spec.metadata.labels`).
    #[must_use]
    pub fn propagated_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.spec.metadata.as_ref().and_then(|m| m.labels.as_ref())
    }

    /// Name of the bound Node, if the Machine has been provisioned.
    #[must_use]
    pub fn node_name(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.node_ref.as_ref())
            .map(|r| r.name.as_str())
            .filter(|name| !name.is_empty())
    }
}
