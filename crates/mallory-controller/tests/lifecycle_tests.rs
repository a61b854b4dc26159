use mallory_controller::{Error, IntruderIdentity, OperatorConfig};
use mallory_crd::{reasons, Intruder, RunResult, Verb, FINALIZER};
use mallory_test_utils::*;
use pretty_assertions::assert_eq;

const NS: &str = "team-a";

#[tokio::test]
async fn test_finalizer_added_exactly_once() {
    let h = Harness::new();
    let event = event_resource("probe", NS, Intruder::default(), vec![]);

    h.reconcile(&event).await.unwrap();
    assert_eq!(h.store.finalizer_writes(), vec![vec![FINALIZER.to_string()]]);

    // second pass sees the stored finalizer and leaves it alone
    let stored = with_finalizers(&event, &[FINALIZER]);
    h.reconcile(&stored).await.unwrap();
    assert_eq!(h.store.finalizer_writes().len(), 1);
}

#[tokio::test]
async fn test_finalizer_add_keeps_foreign_finalizers() {
    let h = Harness::new();
    let event = with_finalizers(
        &event_resource("probe", NS, Intruder::default(), vec![]),
        &["backup.example.com/hold"],
    );

    h.reconcile(&event).await.unwrap();
    assert_eq!(
        h.store.finalizer_writes(),
        vec![vec!["backup.example.com/hold".to_string(), FINALIZER.to_string()]]
    );
}

#[tokio::test]
async fn test_get_and_existing_create_succeed() {
    let h = Harness::new();
    h.cluster.insert(document(pod_doc("web", NS, &[("app", "web")])));
    let event = event_resource(
        "probe",
        NS,
        Intruder::default(),
        vec![
            op("read-pod", Verb::Get, pod_doc("web", "", &[])),
            op("make-pod", Verb::Create, pod_doc("web", "", &[])),
        ],
    );

    h.reconcile(&event).await.unwrap();

    assert_eq!(h.store.last_status().unwrap().result, Some(RunResult::Success));
    assert_eq!(
        h.sink.reasons(),
        vec![
            ("read-pod".to_string(), reasons::OPERATION_SUCCEEDED),
            ("read-pod".to_string(), reasons::OPERATION_OUTPUT),
            ("make-pod".to_string(), reasons::OPERATION_SUCCEEDED),
        ]
    );
    assert_eq!(h.journal.count("create"), 0);
}

#[tokio::test]
async fn test_update_of_missing_object_is_error() {
    let h = Harness::new();
    let event = event_resource(
        "probe",
        NS,
        Intruder::default(),
        vec![op("patch-cm", Verb::Update, configmap_doc("absent", NS, &[("k", "v")]))],
    );

    h.reconcile(&event).await.unwrap();

    assert_eq!(h.store.last_status().unwrap().result, Some(RunResult::Error));
    assert_eq!(h.sink.reasons(), vec![("patch-cm".to_string(), reasons::OPERATION_FAILED)]);
}

#[tokio::test]
async fn test_failure_does_not_stop_later_operations() {
    let h = Harness::new();
    let event = event_resource(
        "probe",
        NS,
        Intruder::default(),
        vec![
            raw_op("bad", "escalate", pod_doc("web", "", &[])),
            op("make-cm", Verb::Create, configmap_doc("loot", NS, &[])),
        ],
    );

    h.reconcile(&event).await.unwrap();

    assert!(h.cluster.contains("v1", "ConfigMap", NS, "loot"));
    assert_eq!(h.store.last_status().unwrap().result, Some(RunResult::Error));
    let events = h.sink.events();
    assert_eq!(events[0].0, "bad");
    assert!(events[0].1.note("bad").contains("unsupported verb: escalate"));
}

#[tokio::test]
async fn test_cleanup_reverses_creates_before_finalizer_removal() {
    let h = Harness::new();
    h.cluster.insert(document(pod_doc("bystander", NS, &[])));
    let event = event_resource(
        "probe",
        NS,
        intruder_service_account("builder"),
        vec![
            op("make-a", Verb::Create, configmap_doc("cm-a", NS, &[])),
            op("read", Verb::Get, pod_doc("bystander", "", &[])),
            op("make-b", Verb::Create, configmap_doc("cm-b", NS, &[])),
        ],
    );
    h.reconcile(&event).await.unwrap();
    assert!(h.cluster.contains("v1", "ConfigMap", NS, "cm-a"));

    h.reconcile(&deleting(&event, &[FINALIZER])).await.unwrap();

    assert!(!h.cluster.contains("v1", "ConfigMap", NS, "cm-a"));
    assert!(!h.cluster.contains("v1", "ConfigMap", NS, "cm-b"));
    // only created objects are reversed
    assert!(h.cluster.contains("v1", "Pod", NS, "bystander"));

    let released = h.journal.position("finalizers []").unwrap();
    assert!(h.journal.position("delete ConfigMap/team-a/cm-a").unwrap() < released);
    assert!(h.journal.position("delete ConfigMap/team-a/cm-b").unwrap() < released);
    assert_eq!(h.store.finalizer_writes().last(), Some(&Vec::<String>::new()));

    // every reversal ran under the same intruder
    assert!(h.factory.identities().iter().all(|id| *id
        == IntruderIdentity::ServiceAccount {
            username: "system:serviceaccount:team-a:builder".to_string()
        }));
}

#[tokio::test]
async fn test_failed_reversal_keeps_finalizer() {
    let h = Harness::new();
    let event = event_resource(
        "probe",
        NS,
        Intruder::default(),
        vec![op("make-cm", Verb::Create, configmap_doc("pinned", NS, &[]))],
    );
    h.cluster.forbid_delete("pinned");

    let err = h.reconcile(&deleting(&event, &[FINALIZER])).await.unwrap_err();

    assert!(matches!(err, Error::Cleanup { ref id, .. } if id == "make-cm"));
    assert!(err.to_string().starts_with("failed to delete resource make-cm"));
    assert!(h.store.finalizer_writes().is_empty());
    assert!(h.cluster.contains("v1", "ConfigMap", NS, "pinned"));
}

#[tokio::test]
async fn test_deleting_without_our_finalizer_is_noop() {
    let h = Harness::new();
    let event = event_resource(
        "probe",
        NS,
        Intruder::default(),
        vec![op("make-cm", Verb::Create, configmap_doc("cm", NS, &[]))],
    );

    h.reconcile(&deleting(&event, &["backup.example.com/hold"])).await.unwrap();

    assert!(h.journal.entries().is_empty());
    assert!(h.store.statuses().is_empty());
}

#[tokio::test]
async fn test_client_construction_failure_marks_every_operation() {
    let h = Harness::new();
    h.factory.fail_builds();
    let event = event_resource(
        "probe",
        NS,
        intruder_token("expired"),
        vec![
            op("a", Verb::Get, pod_doc("web", "", &[])),
            op("b", Verb::List, pod_doc("web", "", &[])),
        ],
    );

    h.reconcile(&event).await.unwrap();

    assert_eq!(h.store.last_status().unwrap().result, Some(RunResult::Error));
    assert_eq!(
        h.sink.reasons(),
        vec![
            ("a".to_string(), reasons::OPERATION_FAILED),
            ("b".to_string(), reasons::OPERATION_FAILED),
        ]
    );
}

#[tokio::test]
async fn test_token_wins_over_service_account() {
    let h = Harness::new();
    let intruder = Intruder {
        token: Some("stolen".to_string()),
        service_account: Some("builder".to_string()),
        user: None,
    };
    let event = event_resource(
        "probe",
        NS,
        intruder,
        vec![op("read", Verb::Get, pod_doc("web", "", &[]))],
    );

    h.reconcile(&event).await.unwrap();

    assert_eq!(
        h.factory.identities(),
        vec![IntruderIdentity::Token("stolen".to_string())]
    );
}

#[tokio::test]
async fn test_persistence_failure_reaches_scheduler() {
    let h = Harness::new();
    h.store.fail_status_writes();
    let event = with_finalizers(
        &event_resource("probe", NS, Intruder::default(), vec![]),
        &[FINALIZER],
    );

    let err = h.reconcile(&event).await.unwrap_err();

    assert_eq!(err.kind(), "persistence");
    assert!(err.is_retryable());
}

#[tokio::test]
async fn test_logs_use_configured_tail() {
    let h = Harness::with_config(OperatorConfig::default().with_log_tail_lines(3));
    h.cluster.insert(document(pod_doc("web-0", NS, &[("app", "web")])));
    h.cluster.set_log_output("c\nd\ne\n");
    let event = event_resource(
        "probe",
        NS,
        Intruder::default(),
        vec![op("tail", Verb::Logs, pod_doc("web", "", &[("app", "web")]))],
    );

    h.reconcile(&event).await.unwrap();

    assert_eq!(h.cluster.log_requests()[0].tail_lines, 3);
    assert_eq!(h.sink.outputs_for("tail"), vec!["c\nd\ne\n".to_string()]);
}
