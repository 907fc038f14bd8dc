//! End-to-end propagation scenarios over the in-memory store.

use node_metadata_operator::labels::DEFAULT_PROVENANCE_ANNOTATION;
use node_metadata_operator::reconciler::PropagationSettings;
use node_metadata_operator::store::TargetRef;
use node_metadata_operator::wait::{wait_for_all, PollSettings};
use node_metadata_operator::{
    ErrorKind, InMemoryStore, LabelPropagator, LabelSet, MachineSetId, ReconcileOutcome,
};
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

fn labels(pairs: &[(&str, &str)]) -> LabelSet {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

fn workers() -> MachineSetId {
    MachineSetId::new("openshift-machine-api", "workers")
}

struct Cluster {
    propagator: LabelPropagator<Arc<InMemoryStore>>,
    store: Arc<InMemoryStore>,
    bound_machine: TargetRef,
    unbound_machine: TargetRef,
    node: TargetRef,
}

impl Cluster {
    /// One MachineSet with two Machines, only the first bound to a Node.
    async fn new(desired: Option<LabelSet>) -> Self {
        let store = Arc::new(InMemoryStore::new());
        store.put_machine_set(&workers(), desired).await;

        let bound_machine = store.put_machine(&workers(), "workers-a", None).await;
        let unbound_machine = store.put_machine(&workers(), "workers-b", None).await;
        let node = store
            .put_node(
                "ip-10-0-1-1",
                Some(labels(&[
                    ("kubernetes.io/hostname", "ip-10-0-1-1"),
                    ("node-role.kubernetes.io/worker", ""),
                ])),
                None,
            )
            .await;
        store.bind_machine(&bound_machine, "ip-10-0-1-1").await;

        Self {
            propagator: LabelPropagator::new(store.clone(), PropagationSettings::default()),
            store,
            bound_machine,
            unbound_machine,
            node,
        }
    }

    async fn pass(&self) -> node_metadata_operator::Result<ReconcileOutcome> {
        self.propagator
            .reconcile(&workers(), &CancellationToken::new())
            .await
    }

    async fn labels_of(&self, target: &TargetRef) -> LabelSet {
        self.store.labels(target).await.unwrap_or_default()
    }
}

#[tokio::test]
async fn test_end_to_end_add_then_remove() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod")]))).await;

    let outcome = cluster.pass().await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated { machines: 2, nodes: 1 });

    assert_eq!(cluster.labels_of(&cluster.bound_machine).await, labels(&[("env", "prod")]));
    assert_eq!(cluster.labels_of(&cluster.unbound_machine).await, labels(&[("env", "prod")]));
    assert_eq!(
        cluster.labels_of(&cluster.node).await.get("env").map(String::as_str),
        Some("prod")
    );

    cluster.store.set_desired_labels(&workers(), Some(LabelSet::new())).await;
    let outcome = cluster.pass().await.unwrap();
    assert_eq!(outcome, ReconcileOutcome::Updated { machines: 2, nodes: 1 });

    assert!(cluster.labels_of(&cluster.bound_machine).await.is_empty());
    assert!(cluster.labels_of(&cluster.unbound_machine).await.is_empty());
    assert!(!cluster.labels_of(&cluster.node).await.contains_key("env"));

    // Emptied maps stay present rather than reverting to unset.
    assert_eq!(cluster.store.labels(&cluster.bound_machine).await, Some(LabelSet::new()));

    // Nothing of ours is left, so the provenance record is gone too.
    let node = cluster.store.object(&cluster.node).await.unwrap();
    assert!(node
        .annotations
        .unwrap_or_default()
        .get(DEFAULT_PROVENANCE_ANNOTATION)
        .is_none());
}

#[tokio::test]
async fn test_second_pass_is_noop() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod"), ("tier", "backend")]))).await;

    cluster.pass().await.unwrap();
    let writes = cluster.store.updates().await.len();

    assert_eq!(cluster.pass().await.unwrap(), ReconcileOutcome::NoOp);
    assert_eq!(cluster.store.updates().await.len(), writes);
}

#[tokio::test]
async fn test_empty_desired_and_empty_targets_issue_no_updates() {
    let cluster = Cluster::new(None).await;

    assert_eq!(cluster.pass().await.unwrap(), ReconcileOutcome::NoOp);
    assert!(cluster.store.updates().await.is_empty());
}

#[tokio::test]
async fn test_node_labels_from_elsewhere_survive_every_pass() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod")]))).await;
    cluster.store.set_label(&cluster.node, "topology.example.com/rack", "r12").await;

    cluster.pass().await.unwrap();
    cluster.store.set_desired_labels(&workers(), Some(labels(&[("env", "dev"), ("team", "a")]))).await;
    cluster.pass().await.unwrap();
    cluster.store.set_desired_labels(&workers(), None).await;
    cluster.pass().await.unwrap();

    assert_eq!(
        cluster.labels_of(&cluster.node).await,
        labels(&[
            ("kubernetes.io/hostname", "ip-10-0-1-1"),
            ("node-role.kubernetes.io/worker", ""),
            ("topology.example.com/rack", "r12"),
        ])
    );
}

#[tokio::test]
async fn test_protected_node_role_is_not_overridden() {
    let cluster = Cluster::new(Some(labels(&[
        ("Fake-Node-Label", "Fake-Node-Label-Value"),
        ("node-role.kubernetes.io/worker", "overruled"),
    ])))
    .await;

    cluster.pass().await.unwrap();

    let node = cluster.labels_of(&cluster.node).await;
    assert_eq!(node.get("Fake-Node-Label").map(String::as_str), Some("Fake-Node-Label-Value"));
    assert_eq!(node.get("node-role.kubernetes.io/worker").map(String::as_str), Some(""));

    // Machines are not subject to the Node guard.
    let machine = cluster.labels_of(&cluster.bound_machine).await;
    assert_eq!(
        machine.get("node-role.kubernetes.io/worker").map(String::as_str),
        Some("overruled")
    );
}

#[tokio::test]
async fn test_labels_from_another_machine_set_are_not_removed() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod")]))).await;
    cluster.pass().await.unwrap();

    // The Node is now claimed by a different MachineSet with nothing to propagate.
    let infra = MachineSetId::new("openshift-machine-api", "infra");
    cluster.store.put_machine_set(&infra, None).await;
    let infra_machine = cluster.store.put_machine(&infra, "infra-a", None).await;
    cluster.store.bind_machine(&infra_machine, "ip-10-0-1-1").await;

    let infra_propagator = LabelPropagator::new(cluster.store.clone(), PropagationSettings::default());
    infra_propagator
        .reconcile(&infra, &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        cluster.labels_of(&cluster.node).await.get("env").map(String::as_str),
        Some("prod")
    );
}

#[tokio::test]
async fn test_update_failure_aborts_pass_and_next_pass_reconverges() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod")]))).await;
    cluster.store.fail_updates_on(&cluster.node).await;

    let err = cluster.pass().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UpdateFailure);
    assert!(err.is_retryable());

    // The bound machine was written before the failure, the second one never reached.
    assert_eq!(cluster.labels_of(&cluster.bound_machine).await, labels(&[("env", "prod")]));
    assert!(cluster.labels_of(&cluster.unbound_machine).await.is_empty());

    cluster.store.clear_failures().await;
    assert_eq!(
        cluster.pass().await.unwrap(),
        ReconcileOutcome::Updated { machines: 1, nodes: 1 }
    );
    assert_eq!(cluster.labels_of(&cluster.unbound_machine).await, labels(&[("env", "prod")]));
}

#[tokio::test]
async fn test_list_failure_is_reported() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod")]))).await;
    cluster.store.fail_lists(true).await;

    let err = cluster.pass().await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ListFailure);
    assert!(cluster.store.updates().await.is_empty());
}

#[tokio::test]
async fn test_deleted_machine_set_is_terminal_success() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod")]))).await;
    cluster.store.delete_machine_set(&workers()).await;

    assert_eq!(cluster.pass().await.unwrap(), ReconcileOutcome::NoOp);
    assert!(cluster.store.updates().await.is_empty());
}

#[tokio::test]
async fn test_unbound_machine_node_resolved_by_provider_id() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod")]))).await;
    let node = cluster.store.put_node("ip-10-0-2-2", None, Some("aws:///us-east-1a/i-0abc")).await;
    cluster
        .store
        .set_machine_provider_id(&cluster.unbound_machine, "aws:///us-east-1a/i-0abc")
        .await;

    assert_eq!(
        cluster.pass().await.unwrap(),
        ReconcileOutcome::Updated { machines: 2, nodes: 2 }
    );
    assert_eq!(cluster.labels_of(&node).await, labels(&[("env", "prod")]));
}

#[tokio::test]
async fn test_node_label_copied_by_machine_api_is_removed_later() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod")]))).await;

    // Our Node write fails; the Machine API then copies the Machine label across.
    cluster.store.fail_updates_on(&cluster.node).await;
    assert!(cluster.pass().await.is_err());
    cluster.store.clear_failures().await;
    cluster.store.set_label(&cluster.node, "env", "prod").await;

    // Only the provenance record is written to the Node.
    assert_eq!(
        cluster.pass().await.unwrap(),
        ReconcileOutcome::Updated { machines: 1, nodes: 1 }
    );
    assert_eq!(
        cluster.labels_of(&cluster.node).await.get("env").map(String::as_str),
        Some("prod")
    );

    cluster.store.set_desired_labels(&workers(), Some(LabelSet::new())).await;
    assert_eq!(
        cluster.pass().await.unwrap(),
        ReconcileOutcome::Updated { machines: 2, nodes: 1 }
    );

    assert!(cluster.labels_of(&cluster.bound_machine).await.is_empty());
    assert!(!cluster.labels_of(&cluster.node).await.contains_key("env"));
}

#[tokio::test]
async fn test_node_label_set_by_someone_else_is_not_adopted_without_machine_ownership() {
    let cluster = Cluster::new(Some(labels(&[("team", "infra")]))).await;
    cluster.store.set_label(&cluster.bound_machine, "team", "infra").await;
    cluster.store.set_label(&cluster.node, "team", "infra").await;

    cluster.pass().await.unwrap();
    cluster.store.set_desired_labels(&workers(), None).await;
    cluster.pass().await.unwrap();

    assert_eq!(cluster.labels_of(&cluster.bound_machine).await, labels(&[("team", "infra")]));
    assert_eq!(
        cluster.labels_of(&cluster.node).await.get("team").map(String::as_str),
        Some("infra")
    );
}

#[tokio::test]
async fn test_node_ref_to_missing_node_is_unresolved() {
    let cluster = Cluster::new(Some(labels(&[("env", "prod")]))).await;
    cluster.store.bind_machine(&cluster.unbound_machine, "ip-10-0-9-9").await;

    assert_eq!(
        cluster.pass().await.unwrap(),
        ReconcileOutcome::Updated { machines: 2, nodes: 1 }
    );
    assert_eq!(cluster.labels_of(&cluster.unbound_machine).await, labels(&[("env", "prod")]));
    assert_eq!(
        cluster.labels_of(&cluster.node).await.get("env").map(String::as_str),
        Some("prod")
    );
}

/// Mirrors a live cluster: a background loop keeps reconciling while the
/// desired labels change, and the test polls until everything converged.
#[tokio::test]
async fn test_wait_for_convergence_with_background_loop() {
    let cluster = Arc::new(Cluster::new(None).await);
    let stop = CancellationToken::new();

    let worker = {
        let cluster = cluster.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            while !stop.is_cancelled() {
                let _ = cluster.propagator.reconcile(&workers(), &stop).await;
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
    };

    let poll = PollSettings {
        interval: Duration::from_millis(10),
        timeout: Duration::from_secs(5),
    };
    let targets = vec![
        cluster.bound_machine.clone(),
        cluster.unbound_machine.clone(),
        cluster.node.clone(),
    ];

    cluster
        .store
        .set_desired_labels(&workers(), Some(labels(&[("Fake-Node-Label", "Fake-Node-Label-Value")])))
        .await;

    let fetch = || {
        let store = cluster.store.clone();
        let targets = targets.clone();
        async move {
            let mut observed = Vec::new();
            for target in targets {
                let labels = store.labels(&target).await.unwrap_or_default();
                observed.push((target, labels));
            }
            Ok::<_, Infallible>(observed)
        }
    };

    wait_for_all(poll, fetch, |(target, labels): &(TargetRef, LabelSet)| {
        match labels.get("Fake-Node-Label").map(String::as_str) {
            Some("Fake-Node-Label-Value") => Ok(()),
            _ => Err(target.to_string()),
        }
    })
    .await
    .unwrap();

    cluster.store.set_desired_labels(&workers(), Some(LabelSet::new())).await;

    wait_for_all(poll, fetch, |(target, labels): &(TargetRef, LabelSet)| {
        if labels.contains_key("Fake-Node-Label") {
            Err(target.to_string())
        } else {
            Ok(())
        }
    })
    .await
    .unwrap();

    stop.cancel();
    worker.await.unwrap();
}
