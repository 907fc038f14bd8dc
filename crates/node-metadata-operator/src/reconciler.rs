//! Label propagation pass.
//!
//! One pass reads the `MachineSet` fresh from the store, walks its Machines in
//! order and converges each Machine and then its Node. The pass is stateless and
//! idempotent; the first failed read or write aborts it and the caller is
//! expected to retry with a new pass.

use crate::labels::{reconcile_labels, LabelGuard, LabelSet, Provenance};
use crate::store::{LabelUpdate, LabeledObject, MachineSetId, ObjectStore};
use crate::types::{Error, Result};
use std::collections::{BTreeMap, BTreeSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

/// Result of a successful pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Nothing needed changing, or the `MachineSet` is gone
    NoOp,
    /// Number of Machines and Nodes written
    Updated { machines: usize, nodes: usize },
}

/// Settings that shape how labels are applied.
#[derive(Debug, Clone)]
pub struct PropagationSettings {
    /// Annotation key holding the provenance record
    pub provenance_annotation: String,
    /// Keys that must never be touched on Nodes
    pub node_guard: LabelGuard,
}

impl Default for PropagationSettings {
    fn default() -> Self {
        Self {
            provenance_annotation: crate::labels::DEFAULT_PROVENANCE_ANNOTATION.to_string(),
            node_guard: LabelGuard::with_protected_domains(["kubernetes.io", "k8s.io"]),
        }
    }
}

/// What converging one object produced.
struct Convergence {
    written: bool,
    /// Keys this source owns on the object afterwards
    owned: BTreeSet<String>,
}

/// Runs propagation passes against an [`ObjectStore`].
pub struct LabelPropagator<S> {
    store: S,
    settings: PropagationSettings,
}

impl<S: ObjectStore> LabelPropagator<S> {
    pub fn new(store: S, settings: PropagationSettings) -> Self {
        Self { store, settings }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run one pass for the `MachineSet` identified by `id`.
    ///
    /// A deleted `MachineSet` is a terminal success. Machines that are not yet
    /// bound to a Node only receive the Machine-level update.
    #[instrument(skip(self, cancel), fields(machine_set = %id))]
    pub async fn reconcile(
        &self,
        id: &MachineSetId,
        cancel: &CancellationToken,
    ) -> Result<ReconcileOutcome> {
        checkpoint(cancel)?;

        let Some(machine_set) = self
            .store
            .get_machine_set(id)
            .await
            .map_err(|source| Error::Fetch {
                target: format!("MachineSet {id}"),
                source,
            })?
        else {
            info!("MachineSet no longer exists, nothing to propagate");
            return Ok(ReconcileOutcome::NoOp);
        };

        // An empty template still drives removal of previously propagated keys.
        let desired = machine_set.desired_labels.clone().unwrap_or_default();
        let source = id.to_string();

        checkpoint(cancel)?;
        let machines = self
            .store
            .list_machines_owned_by(&machine_set)
            .await
            .map_err(|source| Error::List {
                machine_set: id.clone(),
                source,
            })?;

        debug!(
            machines = machines.len(),
            desired = desired.len(),
            "Propagating labels"
        );

        let mut updated_machines = 0;
        let mut updated_nodes = 0;
        let mut unbound = 0;
        let machine_guard = LabelGuard::permissive();

        for machine in &machines {
            checkpoint(cancel)?;
            let machine_step = self
                .converge(&machine.object, &desired, &source, &machine_guard, &BTreeSet::new())
                .await?;
            if machine_step.written {
                updated_machines += 1;
            }

            checkpoint(cancel)?;
            let node = self
                .store
                .get_node_for_machine(machine)
                .await
                .map_err(|source| Error::Fetch {
                    target: format!("Node for {}", machine.object.target),
                    source,
                })?;

            let Some(node) = node else {
                debug!(machine = %machine.object.target, "Machine has no Node yet, skipping Node labels");
                unbound += 1;
                continue;
            };

            // The Machine API copies Machine labels onto the Node on its own, so
            // a matching Node value for a key owned on the Machine is ours too.
            checkpoint(cancel)?;
            let node_step = self
                .converge(
                    &node,
                    &desired,
                    &source,
                    &self.settings.node_guard,
                    &machine_step.owned,
                )
                .await?;
            if node_step.written {
                updated_nodes += 1;
            }
        }

        if updated_machines == 0 && updated_nodes == 0 {
            debug!(unbound, "Labels already converged");
            return Ok(ReconcileOutcome::NoOp);
        }

        info!(
            machines = updated_machines,
            nodes = updated_nodes,
            unbound,
            "Propagated MachineSet labels"
        );
        Ok(ReconcileOutcome::Updated {
            machines: updated_machines,
            nodes: updated_nodes,
        })
    }

    /// Bring one object's labels in line with `desired`.
    ///
    /// Keys in `adopt` whose current value already equals the desired one are
    /// recorded as owned even though this pass did not write them.
    async fn converge(
        &self,
        object: &LabeledObject,
        desired: &LabelSet,
        source: &str,
        guard: &LabelGuard,
        adopt: &BTreeSet<String>,
    ) -> Result<Convergence> {
        let annotation = self.settings.provenance_annotation.as_str();
        let prior = Provenance::from_annotations(object.annotations.as_ref(), annotation);
        let mut owned = Provenance::owned_by(prior.as_ref(), source);

        let mut labels = object.labels.clone().unwrap_or_default();
        owned.extend(
            adopt
                .iter()
                .filter(|key| desired.get(*key).is_some() && desired.get(*key) == labels.get(*key))
                .cloned(),
        );
        let diff = reconcile_labels(desired, &mut labels, &mut owned, guard);

        let record = (!owned.is_empty()).then(|| Provenance {
            source: source.to_string(),
            keys: owned.clone(),
        });

        // A foreign record with nothing of ours to add is left in place.
        let record_changed = match (&prior, &record) {
            (Some(prior), None) => prior.source == source,
            (prior, record) => prior != record,
        };

        if diff.is_empty() && !record_changed {
            return Ok(Convergence {
                written: false,
                owned,
            });
        }

        let mut annotations = BTreeMap::new();
        if record_changed {
            let value = record
                .as_ref()
                .map(Provenance::to_annotation_value)
                .transpose()
                .map_err(|e| Error::from_update(object.target.clone(), e.into()))?;
            annotations.insert(annotation.to_string(), value);
        }

        let update = LabelUpdate {
            target: object.target.clone(),
            resource_version: object.resource_version.clone(),
            labels,
            diff,
            annotations,
        };

        self.store
            .update_labels(&update)
            .await
            .map_err(|e| Error::from_update(object.target.clone(), e))?;

        debug!(
            target = %object.target,
            upserts = update.diff.upserts.len(),
            removals = update.diff.removals.len(),
            "Updated labels"
        );
        Ok(Convergence {
            written: true,
            owned,
        })
    }
}

fn checkpoint(cancel: &CancellationToken) -> Result<()> {
    if cancel.is_cancelled() {
        return Err(Error::Cancelled);
    }
    Ok(())
}
