//! Testing utilities for the Mallory workspace
//!
//! In-memory fakes of the cluster boundary and fixtures for `Event`
//! resources. Every fake writes to a shared [`Journal`] so tests can assert
//! on the order of side effects across components.

#![allow(missing_docs)]

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{SelfSubjectAccessReview, SubjectAccessReviewStatus};
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use mallory_controller::client::{ExecOutput, ExecRequest, LogRequest};
use mallory_controller::document::{ListTarget, ObjectKey};
use mallory_controller::{
    ClientFactory, ClusterApi, Context, Error, EventSink, EventStore, IntruderIdentity,
    OperationDispatcher, OperationEvent, OperatorConfig, ResourceDocument, Result,
};
use mallory_crd::{EventResource, EventSpec, EventStatus, Intruder, Operation, Verb};
use parking_lot::Mutex;
use serde_json::{json, Value};

/// Ordered record of side effects, shared by all fakes
#[derive(Debug, Clone, Default)]
pub struct Journal(Arc<Mutex<Vec<String>>>);

impl Journal {
    pub fn push(&self, entry: impl Into<String>) {
        self.0.lock().push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.0.lock().clone()
    }

    /// Index of the first entry starting with `prefix`
    pub fn position(&self, prefix: &str) -> Option<usize> {
        self.0.lock().iter().position(|e| e.starts_with(prefix))
    }

    pub fn count(&self, prefix: &str) -> usize {
        self.0.lock().iter().filter(|e| e.starts_with(prefix)).count()
    }
}

fn api_error(code: u16, reason: &str, message: String) -> kube::Error {
    kube::Error::Api(kube::error::ErrorResponse {
        status: "Failure".to_string(),
        message,
        reason: reason.to_string(),
        code,
    })
}

fn plural(kind: &str) -> String {
    format!("{}s", kind.to_lowercase())
}

fn key_label(key: &ObjectKey) -> String {
    format!(
        "{}/{}/{}",
        key.kind,
        key.namespace.as_deref().unwrap_or_default(),
        key.name
    )
}

/// In-memory object store standing in for the API server
#[derive(Debug, Default)]
pub struct FakeCluster {
    objects: Mutex<BTreeMap<ObjectKey, ResourceDocument>>,
    forbidden_deletes: Mutex<BTreeSet<String>>,
    exec_output: Mutex<Option<ExecOutput>>,
    log_output: Mutex<String>,
    review: Mutex<SubjectAccessReviewStatus>,
    exec_requests: Mutex<Vec<ExecRequest>>,
    log_requests: Mutex<Vec<LogRequest>>,
    journal: Journal,
}

impl FakeCluster {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    /// Seed an object; its namespace must already be set
    pub fn insert(&self, doc: ResourceDocument) {
        let key = doc.object_key().expect("seeded object needs apiVersion, kind and name");
        self.objects.lock().insert(key, doc);
    }

    pub fn contains(&self, api_version: &str, kind: &str, namespace: &str, name: &str) -> bool {
        self.objects.lock().contains_key(&ObjectKey {
            api_version: api_version.to_string(),
            kind: kind.to_string(),
            namespace: Some(namespace.to_string()),
            name: name.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.objects.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.lock().is_empty()
    }

    /// Deletes of `name` fail with 403
    pub fn forbid_delete(&self, name: &str) {
        self.forbidden_deletes.lock().insert(name.to_string());
    }

    pub fn set_exec_output(&self, output: ExecOutput) {
        *self.exec_output.lock() = Some(output);
    }

    pub fn set_log_output(&self, output: &str) {
        *self.log_output.lock() = output.to_string();
    }

    pub fn set_review(&self, status: SubjectAccessReviewStatus) {
        *self.review.lock() = status;
    }

    pub fn exec_requests(&self) -> Vec<ExecRequest> {
        self.exec_requests.lock().clone()
    }

    pub fn log_requests(&self) -> Vec<LogRequest> {
        self.log_requests.lock().clone()
    }

    fn not_found(key: &ObjectKey) -> Error {
        Error::NotFound(format!("{} \"{}\" not found", plural(&key.kind), key.name))
    }
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn get(&self, key: &ObjectKey) -> Result<ResourceDocument> {
        self.objects
            .lock()
            .get(key)
            .cloned()
            .ok_or_else(|| Self::not_found(key))
    }

    async fn list(&self, target: &ListTarget) -> Result<Vec<ResourceDocument>> {
        Ok(self
            .objects
            .lock()
            .iter()
            .filter(|(key, doc)| {
                key.api_version == target.api_version
                    && key.kind == target.kind
                    && (target.namespace.is_none() || key.namespace == target.namespace)
                    && target.matches(&doc.labels())
            })
            .map(|(_, doc)| doc.clone())
            .collect())
    }

    async fn create(&self, document: &ResourceDocument) -> Result<ResourceDocument> {
        let key = document.object_key()?;
        let mut objects = self.objects.lock();
        if objects.contains_key(&key) {
            return Err(Error::Api(api_error(
                409,
                "AlreadyExists",
                format!("{} \"{}\" already exists", plural(&key.kind), key.name),
            )));
        }
        self.journal.push(format!("create {}", key_label(&key)));
        objects.insert(key, document.clone());
        Ok(document.clone())
    }

    async fn replace(&self, document: &ResourceDocument) -> Result<ResourceDocument> {
        let key = document.object_key()?;
        let mut objects = self.objects.lock();
        let Some(existing) = objects.get_mut(&key) else {
            return Err(Self::not_found(&key));
        };
        self.journal.push(format!("update {}", key_label(&key)));
        *existing = document.clone();
        Ok(document.clone())
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        if self.forbidden_deletes.lock().contains(&key.name) {
            return Err(Error::Api(api_error(
                403,
                "Forbidden",
                format!("{} \"{}\" is forbidden", plural(&key.kind), key.name),
            )));
        }
        match self.objects.lock().remove(key) {
            Some(_) => {
                self.journal.push(format!("delete {}", key_label(key)));
                Ok(())
            }
            None => Err(Self::not_found(key)),
        }
    }

    async fn access_review(
        &self,
        _review: SelfSubjectAccessReview,
    ) -> Result<SubjectAccessReviewStatus> {
        Ok(self.review.lock().clone())
    }

    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        self.journal.push(format!("exec {}/{}", request.namespace, request.pod));
        self.exec_requests.lock().push(request.clone());
        Ok(self.exec_output.lock().clone().unwrap_or_default())
    }

    async fn logs(&self, request: &LogRequest) -> Result<String> {
        self.log_requests.lock().push(request.clone());
        Ok(self.log_output.lock().clone())
    }
}

/// Hands out the shared [`FakeCluster`] and records every identity asked for
#[derive(Debug)]
pub struct FakeClientFactory {
    cluster: Arc<FakeCluster>,
    identities: Mutex<Vec<IntruderIdentity>>,
    fail: Mutex<bool>,
}

impl FakeClientFactory {
    pub fn new(cluster: Arc<FakeCluster>) -> Self {
        Self {
            cluster,
            identities: Mutex::new(Vec::new()),
            fail: Mutex::new(false),
        }
    }

    pub fn identities(&self) -> Vec<IntruderIdentity> {
        self.identities.lock().clone()
    }

    /// Make every later build fail with `ClientConstruction`
    pub fn fail_builds(&self) {
        *self.fail.lock() = true;
    }
}

impl ClientFactory for FakeClientFactory {
    fn build(&self, identity: &IntruderIdentity) -> Result<Arc<dyn ClusterApi>> {
        self.identities.lock().push(identity.clone());
        if *self.fail.lock() {
            return Err(Error::ClientConstruction(api_error(
                401,
                "Unauthorized",
                "invalid bearer token".to_string(),
            )));
        }
        Ok(self.cluster.clone() as Arc<dyn ClusterApi>)
    }
}

/// Event sink that keeps everything in memory
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<(String, OperationEvent)>>,
}

impl RecordingEventSink {
    /// `(operation id, event)` in emission order
    pub fn events(&self) -> Vec<(String, OperationEvent)> {
        self.events.lock().clone()
    }

    /// `(operation id, reason)` in emission order
    pub fn reasons(&self) -> Vec<(String, &'static str)> {
        self.events
            .lock()
            .iter()
            .map(|(id, ev)| (id.clone(), ev.reason()))
            .collect()
    }

    pub fn outputs_for(&self, operation_id: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|(id, _)| id == operation_id)
            .filter_map(|(_, ev)| match ev {
                OperationEvent::Output(text) => Some(text.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn record(&self, _object: &ObjectReference, operation_id: &str, event: &OperationEvent) {
        self.events.lock().push((operation_id.to_string(), event.clone()));
    }
}

/// Event store that applies writes to an in-memory copy
#[derive(Debug, Default)]
pub struct FakeEventStore {
    finalizer_writes: Mutex<Vec<Vec<String>>>,
    statuses: Mutex<Vec<EventStatus>>,
    fail_status: Mutex<bool>,
    journal: Journal,
}

impl FakeEventStore {
    pub fn new(journal: Journal) -> Self {
        Self {
            journal,
            ..Self::default()
        }
    }

    /// Every finalizer list written, oldest first
    pub fn finalizer_writes(&self) -> Vec<Vec<String>> {
        self.finalizer_writes.lock().clone()
    }

    pub fn statuses(&self) -> Vec<EventStatus> {
        self.statuses.lock().clone()
    }

    pub fn last_status(&self) -> Option<EventStatus> {
        self.statuses.lock().last().cloned()
    }

    pub fn fail_status_writes(&self) {
        *self.fail_status.lock() = true;
    }

    fn bump(event: &mut EventResource) {
        let next = event
            .resource_version()
            .and_then(|rv| rv.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        event.metadata.resource_version = Some(next.to_string());
    }
}

#[async_trait]
impl EventStore for FakeEventStore {
    async fn set_finalizers(
        &self,
        event: &EventResource,
        finalizers: Vec<String>,
    ) -> Result<EventResource> {
        self.journal.push(format!("finalizers {finalizers:?}"));
        self.finalizer_writes.lock().push(finalizers.clone());
        let mut updated = event.clone();
        updated.metadata.finalizers = Some(finalizers);
        Self::bump(&mut updated);
        Ok(updated)
    }

    async fn set_status(
        &self,
        event: &EventResource,
        status: &EventStatus,
    ) -> Result<EventResource> {
        if *self.fail_status.lock() {
            return Err(Error::Persistence(api_error(
                409,
                "Conflict",
                "the object has been modified".to_string(),
            )));
        }
        self.journal.push("status");
        self.statuses.lock().push(status.clone());
        let mut updated = event.clone();
        updated.status = Some(status.clone());
        Self::bump(&mut updated);
        Ok(updated)
    }
}

/// All fakes wired into a reconcile `Context`
pub struct Harness {
    pub journal: Journal,
    pub cluster: Arc<FakeCluster>,
    pub factory: Arc<FakeClientFactory>,
    pub store: Arc<FakeEventStore>,
    pub sink: Arc<RecordingEventSink>,
    pub ctx: Arc<Context>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(OperatorConfig::default())
    }

    pub fn with_config(config: OperatorConfig) -> Self {
        let journal = Journal::default();
        let cluster = Arc::new(FakeCluster::new(journal.clone()));
        let factory = Arc::new(FakeClientFactory::new(cluster.clone()));
        let store = Arc::new(FakeEventStore::new(journal.clone()));
        let sink = Arc::new(RecordingEventSink::default());
        let ctx = Arc::new(Context::new(
            store.clone(),
            OperationDispatcher::new(factory.clone(), &config),
            sink.clone(),
            config,
        ));
        Self {
            journal,
            cluster,
            factory,
            store,
            sink,
            ctx,
        }
    }

    pub fn dispatcher(&self) -> OperationDispatcher {
        OperationDispatcher::new(self.factory.clone(), self.ctx.config())
    }

    pub async fn reconcile(&self, event: &EventResource) -> Result<Action> {
        mallory_controller::reconcile(Arc::new(event.clone()), self.ctx.clone()).await
    }
}

impl Default for Harness {
    fn default() -> Self {
        Self::new()
    }
}

/// `Event` in `namespace` running `operations` as `intruder`
pub fn event_resource(
    name: &str,
    namespace: &str,
    intruder: Intruder,
    operations: Vec<Operation>,
) -> EventResource {
    let mut event = EventResource::new(name, EventSpec { intruder, operations });
    event.metadata.namespace = Some(namespace.to_string());
    event.metadata.resource_version = Some("1".to_string());
    event
}

/// Copy of `event` with the given finalizers and a deletion timestamp
pub fn deleting(event: &EventResource, finalizers: &[&str]) -> EventResource {
    let mut event = event.clone();
    event.metadata.finalizers = Some(finalizers.iter().map(|f| (*f).to_string()).collect());
    event.metadata.deletion_timestamp = Some(Time(Default::default()));
    event
}

/// Copy of `event` carrying the given finalizers
pub fn with_finalizers(event: &EventResource, finalizers: &[&str]) -> EventResource {
    let mut event = event.clone();
    event.metadata.finalizers = Some(finalizers.iter().map(|f| (*f).to_string()).collect());
    event
}

pub fn op(id: &str, verb: Verb, resource: Value) -> Operation {
    Operation::new(id, verb, resource)
}

/// Operation with an arbitrary verb string
pub fn raw_op(id: &str, verb: &str, resource: Value) -> Operation {
    Operation {
        id: id.to_string(),
        verb: verb.to_string(),
        resource,
    }
}

pub fn intruder_token(token: &str) -> Intruder {
    Intruder {
        token: Some(token.to_string()),
        ..Intruder::default()
    }
}

pub fn intruder_service_account(name: &str) -> Intruder {
    Intruder {
        service_account: Some(name.to_string()),
        ..Intruder::default()
    }
}

/// Bare `v1/Pod` document; `namespace` may be empty
pub fn pod_doc(name: &str, namespace: &str, labels: &[(&str, &str)]) -> Value {
    let mut metadata = json!({ "name": name, "labels": labels_map(labels) });
    if !namespace.is_empty() {
        metadata["namespace"] = json!(namespace);
    }
    json!({
        "apiVersion": "v1",
        "kind": "Pod",
        "metadata": metadata,
        "spec": {
            "containers": [{ "name": "main", "image": "busybox", "command": ["sleep", "3600"] }]
        }
    })
}

/// `apps/v1/Deployment` selecting `app=<app>` with one container
pub fn deployment_doc(name: &str, app: &str, command: &[&str], args: &[&str]) -> Value {
    json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": { "name": name },
        "spec": {
            "selector": { "matchLabels": { "app": app } },
            "template": {
                "metadata": { "labels": { "app": app } },
                "spec": { "containers": [
                    { "name": "shell", "image": "busybox", "command": command, "args": args }
                ] }
            }
        }
    })
}

pub fn configmap_doc(name: &str, namespace: &str, data: &[(&str, &str)]) -> Value {
    json!({
        "apiVersion": "v1",
        "kind": "ConfigMap",
        "metadata": { "name": name, "namespace": namespace, "resourceVersion": "7" },
        "data": labels_map(data)
    })
}

pub fn document(value: Value) -> ResourceDocument {
    ResourceDocument::from_value(value).expect("fixture must be an object")
}

fn labels_map(pairs: &[(&str, &str)]) -> Value {
    Value::Object(
        pairs
            .iter()
            .map(|(k, v)| ((*k).to_string(), Value::String((*v).to_string())))
            .collect(),
    )
}
