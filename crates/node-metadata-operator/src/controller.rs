//! Controller wiring
//!
//! Drives [`LabelPropagator`] from the kube-runtime controller: every change to
//! a `MachineSet`, or to a `Machine` it controls, triggers a pass for that set.
//! The runtime serializes passes per object, so the propagator never races
//! itself on one `MachineSet`. Nodes are not watched; the periodic resync picks
//! up labels removed or changed on them directly.

use crate::config::OperatorConfig;
use crate::crds::{Machine, MachineSet};
use crate::reconciler::{LabelPropagator, ReconcileOutcome};
use crate::store::{KubeStore, MachineSetId};
use crate::types::{Error, ErrorKind, Result};
use futures::StreamExt;
use kube::api::ListParams;
use kube::runtime::controller::{Action, Controller};
use kube::runtime::reflector::ObjectRef;
use kube::runtime::watcher::Config;
use kube::{Api, Client, ResourceExt};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn, Instrument};

/// Shared state handed to every reconciliation.
pub struct Context {
    pub propagator: LabelPropagator<KubeStore>,
    pub config: Arc<OperatorConfig>,
    /// Cancelled on shutdown; aborts in-flight passes at the next read or write
    pub shutdown: CancellationToken,
}

fn scoped_api<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: kube::Resource<Scope = kube::core::NamespaceResourceScope>,
    <K as kube::Resource>::DynamicType: Default,
{
    match namespace {
        Some(ns) => Api::namespaced(client.clone(), ns),
        None => Api::all(client.clone()),
    }
}

/// Confirm the Machine API is served before starting the controller.
///
/// Without the `machine.openshift.io` CRDs every watch would fail forever, so
/// this fails fast with an explanation instead.
pub async fn verify_machine_api(client: &Client, namespace: Option<&str>) -> Result<()> {
    let probe = ListParams::default().limit(1);

    let machine_sets: Api<MachineSet> = scoped_api(client, namespace);
    if let Err(e) = machine_sets.list(&probe).await {
        error!("❌ Cannot list MachineSets: {}", e);
        error!("The machine.openshift.io/v1beta1 API must be installed and the operator's");
        error!("ServiceAccount must be allowed to get/list/watch machinesets and machines.");
        return Err(Error::KubeError(e));
    }

    let machines: Api<Machine> = scoped_api(client, namespace);
    if let Err(e) = machines.list(&probe).await {
        error!("❌ Cannot list Machines: {}", e);
        return Err(Error::KubeError(e));
    }

    info!("  ✓ Machine API available");
    Ok(())
}

/// The `MachineSet` controlling `machine`, if any.
#[must_use]
pub fn controlling_machine_set(machine: &Machine) -> Option<ObjectRef<MachineSet>> {
    let namespace = machine.namespace()?;
    machine
        .owner_references()
        .iter()
        .find(|owner| owner.controller == Some(true) && owner.kind == "MachineSet")
        .map(|owner| ObjectRef::new(&owner.name).within(&namespace))
}

#[instrument(skip(machine_set, ctx), fields(machine_set = %machine_set.name_any(), namespace = ?machine_set.namespace()))]
pub async fn reconcile_machine_set(machine_set: Arc<MachineSet>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = machine_set.namespace().ok_or(Error::MissingObjectKey)?;
    let id = MachineSetId::new(namespace, machine_set.name_any());

    match ctx.propagator.reconcile(&id, &ctx.shutdown).await? {
        ReconcileOutcome::NoOp => debug!("MachineSet labels already converged"),
        ReconcileOutcome::Updated { machines, nodes } => {
            info!(machines, nodes, "MachineSet labels propagated");
        }
    }

    Ok(Action::requeue(ctx.config.resync_interval()))
}

/// Failed passes are retried from scratch after a fixed delay.
fn error_policy(machine_set: Arc<MachineSet>, err: &Error, ctx: Arc<Context>) -> Action {
    if err.kind() == ErrorKind::Cancelled {
        debug!(machine_set = %machine_set.name_any(), "Reconciliation cancelled during shutdown");
        return Action::await_change();
    }

    warn!(
        error = %err,
        kind = ?err.kind(),
        retryable = err.is_retryable(),
        machine_set = %machine_set.name_any(),
        "MachineSet label propagation failed, requeueing"
    );
    Action::requeue(ctx.config.error_requeue())
}

/// Run the MachineSet label controller until a termination signal arrives.
#[instrument(skip(client, config, shutdown), fields(namespace = ?config.namespace))]
pub async fn run_controller(
    client: Client,
    config: Arc<OperatorConfig>,
    shutdown: CancellationToken,
) -> Result<()> {
    info!("Starting MachineSet label controller");

    let namespace = config.namespace.as_deref();
    let machine_sets: Api<MachineSet> = scoped_api(&client, namespace);
    let machines: Api<Machine> = scoped_api(&client, namespace);
    let watcher_config = Config::default().any_semantic();

    let context = Arc::new(Context {
        propagator: LabelPropagator::new(
            KubeStore::new(client.clone()),
            config.propagation_settings(),
        ),
        config: config.clone(),
        shutdown,
    });

    Controller::new(machine_sets, watcher_config.clone())
        .watches(machines, watcher_config, |machine| {
            controlling_machine_set(&machine)
        })
        .shutdown_on_signal()
        .run(reconcile_machine_set, error_policy, context)
        .for_each(|reconciliation_result| {
            let span = tracing::info_span!("machineset_reconciliation_result");
            async move {
                match reconciliation_result {
                    Ok((object, _action)) => {
                        debug!(resource = %object, "MachineSet reconciliation successful");
                    }
                    Err(reconciliation_err) => {
                        warn!(error = %reconciliation_err, "MachineSet reconciliation error");
                    }
                }
            }
            .instrument(span)
        })
        .await;

    info!("MachineSet label controller shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crds::MachineSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    fn owner(kind: &str, controller: Option<bool>) -> OwnerReference {
        OwnerReference {
            api_version: "machine.openshift.io/v1beta1".to_string(),
            kind: kind.to_string(),
            name: "workers".to_string(),
            uid: "uid-1".to_string(),
            controller,
            block_owner_deletion: None,
        }
    }

    fn machine(owners: Vec<OwnerReference>) -> Machine {
        let mut machine = Machine::new("workers-abc", MachineSpec::default());
        machine.metadata.namespace = Some("openshift-machine-api".to_string());
        machine.metadata.owner_references = Some(owners);
        machine
    }

    #[test]
    fn test_machine_maps_to_controlling_machine_set() {
        let reference = controlling_machine_set(&machine(vec![owner("MachineSet", Some(true))])).unwrap();

        assert_eq!(reference.name, "workers");
        assert_eq!(reference.namespace.as_deref(), Some("openshift-machine-api"));
    }

    #[test]
    fn test_non_controller_owners_are_ignored() {
        assert!(controlling_machine_set(&machine(vec![owner("MachineSet", None)])).is_none());
        assert!(controlling_machine_set(&machine(vec![owner("ControlPlaneMachineSet", Some(true))])).is_none());
        assert!(controlling_machine_set(&machine(vec![])).is_none());
    }
}
