//! Machine to Node resolution helpers.

use super::{LabeledObject, MachineState, ObjectKind, TargetRef};
use k8s_openapi::api::core::v1::Node;

/// How the Node backing a Machine should be located.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeLookup<'a> {
    /// `status.nodeRef` is set
    ByName(&'a str),
    /// Not yet bound, but the provider ID is known
    ByProviderId(&'a str),
    /// Nothing to go on yet
    Unbound,
}

/// Pick the lookup strategy for `machine`. The node reference wins over the
/// provider ID since it is what the Machine API itself recorded.
#[must_use]
pub fn lookup_for(machine: &MachineState) -> NodeLookup<'_> {
    fn non_empty(value: &Option<String>) -> Option<&str> {
        value.as_deref().filter(|v| !v.is_empty())
    }

    if let Some(name) = non_empty(&machine.node_name) {
        NodeLookup::ByName(name)
    } else if let Some(provider_id) = non_empty(&machine.provider_id) {
        NodeLookup::ByProviderId(provider_id)
    } else {
        NodeLookup::Unbound
    }
}

/// Find the Node whose `spec.providerID` equals `provider_id`.
#[must_use]
pub fn find_by_provider_id<'a>(nodes: &'a [Node], provider_id: &str) -> Option<&'a Node> {
    nodes.iter().find(|node| {
        node.spec
            .as_ref()
            .and_then(|spec| spec.provider_id.as_deref())
            == Some(provider_id)
    })
}

/// Project a Node onto the fields the reconciler works with.
#[must_use]
pub fn labeled_node(node: &Node) -> Option<LabeledObject> {
    let name = node.metadata.name.clone()?;
    let mut object = LabeledObject::new(TargetRef::cluster(ObjectKind::Node, name));
    object.labels = node.metadata.labels.clone();
    object.annotations = node.metadata.annotations.clone();
    object.resource_version = node.metadata.resource_version.clone();
    Some(object)
}
