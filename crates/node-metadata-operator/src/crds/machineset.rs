//! `MachineSet` Custom Resource Definition

use super::machine::MachineSpec;
use super::selector::MachineSelector;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Labels and annotations stamped onto Machines created from the template.
#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct MachineTemplateMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub labels: Option<BTreeMap<String, String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
pub struct MachineTemplateSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<MachineTemplateMeta>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<MachineSpec>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, JsonSchema)]
#[kube(group = "machine.openshift.io", version = "v1beta1", kind = "MachineSet")]
#[kube(namespaced)]
#[kube(printcolumn = r#"{"name":"Desired","type":"integer","jsonPath":".spec.replicas"}"#)]
pub struct MachineSetSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Selects the Machines this set manages
    #[serde(default)]
    pub selector: MachineSelector,

    #[serde(default)]
    pub template: MachineTemplateSpec,
}

impl MachineSet {
    /// Labels the set wants on every Machine and Node (`spec.template.spec.metadata.labels`).
    #[must_use]
    pub fn template_labels(&self) -> Option<&BTreeMap<String, String>> {
        self.spec
            .template
            .spec
            .as_ref()
            .and_then(|s| s.metadata.as_ref())
            .and_then(|m| m.labels.as_ref())
    }
}
