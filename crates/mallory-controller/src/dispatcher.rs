//! Operation dispatch
//!
//! Every verb follows the same preamble: build a client scoped to the
//! intruder, parse the target document and default its namespace to the
//! reconciled resource's. The handlers then normalise outcomes to
//! `Result<String>`; `NotFound` is reported as output where the verb
//! tolerates it.

use std::sync::Arc;

use k8s_openapi::api::authorization::v1::{SelfSubjectAccessReview, SubjectAccessReviewStatus};
use mallory_crd::{Intruder, Operation, Verb};
use tracing::{debug, instrument};

use crate::bridge;
use crate::client::{ClientFactory, ClusterApi};
use crate::config::OperatorConfig;
use crate::document::ResourceDocument;
use crate::error::{Error, Result};
use crate::identity::IntruderIdentity;

/// Routes operations to verb handlers under a scoped identity
#[derive(Clone)]
pub struct OperationDispatcher {
    factory: Arc<dyn ClientFactory>,
    log_tail_lines: i64,
}

impl OperationDispatcher {
    /// Create dispatcher
    #[must_use]
    pub fn new(factory: Arc<dyn ClientFactory>, config: &OperatorConfig) -> Self {
        Self {
            factory,
            log_tail_lines: config.log_tail_lines,
        }
    }

    /// Execute one operation
    ///
    /// # Errors
    /// `UnsupportedVerb` for verbs outside the vocabulary, `ClientConstruction`
    /// when the scoped client cannot be built, and whatever the verb
    /// handler does not tolerate
    #[instrument(
        skip_all,
        fields(operation = %op.id, verb = %op.verb, namespace = %namespace)
    )]
    pub async fn execute(
        &self,
        op: &Operation,
        intruder: &Intruder,
        namespace: &str,
    ) -> Result<String> {
        let verb = op.parsed_verb()?;
        let api = self.scoped_client(intruder, namespace)?;
        let doc = target_document(op, namespace)?;

        match verb {
            Verb::Create => create(api.as_ref(), &doc).await,
            Verb::Delete => delete(api.as_ref(), &doc).await,
            Verb::Get => get(api.as_ref(), &doc).await,
            Verb::List => list(api.as_ref(), &doc).await,
            Verb::Update => {
                api.replace(&doc).await?;
                Ok(String::new())
            }
            Verb::Exec => bridge::exec(api.as_ref(), &doc).await,
            Verb::Auth => auth(api.as_ref(), op).await,
            Verb::Logs => bridge::logs(api.as_ref(), &doc, self.log_tail_lines).await,
        }
    }

    /// Delete the object a `create` operation materialised
    ///
    /// Uses the same document, namespace defaulting and identity as the
    /// original operation. An already absent object counts as success.
    ///
    /// # Errors
    /// Any failure other than `NotFound`
    #[instrument(skip_all, fields(operation = %op.id, namespace = %namespace))]
    pub async fn reverse(
        &self,
        op: &Operation,
        intruder: &Intruder,
        namespace: &str,
    ) -> Result<()> {
        let api = self.scoped_client(intruder, namespace)?;
        let doc = target_document(op, namespace)?;
        match api.delete(&doc.object_key()?).await {
            Ok(()) => Ok(()),
            Err(Error::NotFound(message)) => {
                debug!(%message, "created object already absent");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    /// Submit an access review under the intruder's identity
    ///
    /// # Errors
    /// Client construction and API failures
    pub async fn access_review(
        &self,
        intruder: &Intruder,
        namespace: &str,
        review: SelfSubjectAccessReview,
    ) -> Result<SubjectAccessReviewStatus> {
        self.scoped_client(intruder, namespace)?
            .access_review(review)
            .await
    }

    fn scoped_client(&self, intruder: &Intruder, namespace: &str) -> Result<Arc<dyn ClusterApi>> {
        let identity = IntruderIdentity::resolve(intruder, namespace);
        debug!(identity = identity.label(), "resolved intruder identity");
        self.factory.build(&identity)
    }
}

/// Parse the operation's document and default its namespace
fn target_document(op: &Operation, namespace: &str) -> Result<ResourceDocument> {
    let mut doc = ResourceDocument::from_value(op.resource.clone())?;
    doc.default_namespace(namespace);
    Ok(doc)
}

/// Idempotent create: an existing object satisfies the operation
async fn create(api: &dyn ClusterApi, doc: &ResourceDocument) -> Result<String> {
    let key = doc.object_key()?;
    match api.get(&key).await {
        Ok(_) => {
            debug!(name = %key.name, "object already exists");
            Ok(String::new())
        }
        Err(Error::NotFound(_)) => {
            api.create(doc).await?;
            Ok(String::new())
        }
        Err(err) => Err(err),
    }
}

async fn delete(api: &dyn ClusterApi, doc: &ResourceDocument) -> Result<String> {
    match api.delete(&doc.object_key()?).await {
        Ok(()) => Ok(String::new()),
        Err(Error::NotFound(message)) => Ok(message),
        Err(err) => Err(err),
    }
}

async fn get(api: &dyn ClusterApi, doc: &ResourceDocument) -> Result<String> {
    match api.get(&doc.object_key()?).await {
        Ok(found) => found.to_json(),
        Err(Error::NotFound(message)) => Ok(message),
        Err(err) => Err(err),
    }
}

async fn list(api: &dyn ClusterApi, doc: &ResourceDocument) -> Result<String> {
    let target = doc.list_target()?;
    let found = match api.list(&target).await {
        Ok(found) => found,
        Err(Error::NotFound(message)) => return Ok(message),
        Err(err) => return Err(err),
    };
    if found.is_empty() {
        // reported like a missing object, never as an empty array
        return Ok(no_matches_message(&target.kind, target.namespace.as_deref()));
    }
    let names: Vec<&str> = found.iter().map(ResourceDocument::name).collect();
    Ok(serde_json::to_string(&names)?)
}

async fn auth(api: &dyn ClusterApi, op: &Operation) -> Result<String> {
    let review: SelfSubjectAccessReview = serde_json::from_value(op.resource.clone())
        .map_err(|e| {
            Error::InvalidDocument(format!("error unmarshaling to SelfSubjectAccessReview: {e}"))
        })?;
    let status = api.access_review(review).await?;
    Ok(format_review(&status))
}

/// `allowed=<bool> denied=<bool> reason="<text>"`, plus any evaluation error
#[must_use]
pub fn format_review(status: &SubjectAccessReviewStatus) -> String {
    let mut out = format!(
        "allowed={} denied={} reason={:?}",
        status.allowed,
        status.denied.unwrap_or(false),
        status.reason.as_deref().unwrap_or_default()
    );
    if let Some(err) = status.evaluation_error.as_deref().filter(|e| !e.is_empty()) {
        out.push_str(&format!(" evaluationError={err:?}"));
    }
    out
}

fn no_matches_message(kind: &str, namespace: Option<&str>) -> String {
    match namespace {
        Some(ns) => format!("{kind} objects matching labels not found in namespace {ns:?}"),
        None => format!("{kind} objects matching labels not found"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MockClientFactory, MockClusterApi};
    use mockall::predicate::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn dispatcher_with(api: MockClusterApi) -> OperationDispatcher {
        let api: Arc<dyn ClusterApi> = Arc::new(api);
        let mut factory = MockClientFactory::new();
        factory.expect_build().returning(move |_| Ok(api.clone()));
        OperationDispatcher::new(Arc::new(factory), &OperatorConfig::default())
    }

    fn pod_op(verb: &str) -> Operation {
        serde_json::from_value(json!({
            "id": "op-1",
            "verb": verb,
            "resource": {
                "apiVersion": "v1",
                "kind": "Pod",
                "metadata": { "name": "web", "labels": { "app": "web" } }
            }
        }))
        .unwrap()
    }

    fn found(name: &str) -> ResourceDocument {
        ResourceDocument::from_value(json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": { "name": name, "namespace": "team-a" }
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn unknown_verb_carries_literal() {
        let dispatcher = dispatcher_with(MockClusterApi::new());
        let err = dispatcher
            .execute(&pod_op("escalate"), &Intruder::default(), "team-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::UnsupportedVerb(ref v) if v == "escalate"));
    }

    #[tokio::test]
    async fn create_skips_existing_object() {
        let mut api = MockClusterApi::new();
        api.expect_get()
            .withf(|key| key.name == "web" && key.namespace.as_deref() == Some("team-a"))
            .returning(|_| Ok(found("web")));
        api.expect_create().never();

        let out = dispatcher_with(api)
            .execute(&pod_op("create"), &Intruder::default(), "team-a")
            .await
            .unwrap();
        assert_eq!(out, "");
    }

    #[tokio::test]
    async fn create_defaults_namespace() {
        let mut api = MockClusterApi::new();
        api.expect_get()
            .returning(|_| Err(Error::NotFound("pods \"web\" not found".to_string())));
        api.expect_create()
            .withf(|doc| doc.namespace() == Some("team-a"))
            .times(1)
            .returning(|doc| Ok(doc.clone()));

        dispatcher_with(api)
            .execute(&pod_op("create"), &Intruder::default(), "team-a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn get_not_found_is_output() {
        let mut api = MockClusterApi::new();
        api.expect_get()
            .returning(|_| Err(Error::NotFound("pods \"web\" not found".to_string())));

        let out = dispatcher_with(api)
            .execute(&pod_op("get"), &Intruder::default(), "team-a")
            .await
            .unwrap();
        assert_eq!(out, "pods \"web\" not found");
    }

    #[tokio::test]
    async fn list_returns_names() {
        let mut api = MockClusterApi::new();
        api.expect_list()
            .withf(|target| target.selector().as_deref() == Some("app=web"))
            .returning(|_| Ok(vec![found("web-1"), found("web-2")]));

        let out = dispatcher_with(api)
            .execute(&pod_op("list"), &Intruder::default(), "team-a")
            .await
            .unwrap();
        assert_eq!(out, r#"["web-1","web-2"]"#);
    }

    #[tokio::test]
    async fn update_propagates_not_found() {
        let mut api = MockClusterApi::new();
        api.expect_replace()
            .returning(|_| Err(Error::NotFound("pods \"web\" not found".to_string())));

        let err = dispatcher_with(api)
            .execute(&pod_op("update"), &Intruder::default(), "team-a")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn delete_tolerates_missing_object() {
        let mut api = MockClusterApi::new();
        api.expect_delete()
            .returning(|_| Err(Error::NotFound("pods \"web\" not found".to_string())));

        let out = dispatcher_with(api)
            .execute(&pod_op("delete"), &Intruder::default(), "team-a")
            .await
            .unwrap();
        assert_eq!(out, "pods \"web\" not found");
    }

    #[tokio::test]
    async fn auth_formats_decision() {
        let mut api = MockClusterApi::new();
        api.expect_access_review()
            .withf(|review| {
                review
                    .spec
                    .resource_attributes
                    .as_ref()
                    .and_then(|attrs| attrs.verb.as_deref())
                    == Some("create")
            })
            .returning(|_| {
                Ok(SubjectAccessReviewStatus {
                    allowed: false,
                    reason: Some("no RBAC policy matched".to_string()),
                    ..Default::default()
                })
            });
        let op: Operation = serde_json::from_value(json!({
            "id": "can-create",
            "verb": "auth",
            "resource": {
                "apiVersion": "authorization.k8s.io/v1",
                "kind": "SelfSubjectAccessReview",
                "spec": {
                    "resourceAttributes": {
                        "verb": "create",
                        "resource": "pods",
                        "namespace": "team-a"
                    }
                }
            }
        }))
        .unwrap();

        let out = dispatcher_with(api)
            .execute(&op, &Intruder::default(), "team-a")
            .await
            .unwrap();
        assert_eq!(out, r#"allowed=false denied=false reason="no RBAC policy matched""#);
    }

    #[tokio::test]
    async fn auth_rejects_malformed_review() {
        let mut api = MockClusterApi::new();
        api.expect_access_review().never();
        let op: Operation = serde_json::from_value(json!({
            "id": "bad", "verb": "auth", "resource": { "spec": "nope" }
        }))
        .unwrap();

        let err = dispatcher_with(api)
            .execute(&op, &Intruder::default(), "team-a")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidDocument(_)));
    }

    #[tokio::test]
    async fn reverse_swallows_not_found() {
        let mut api = MockClusterApi::new();
        api.expect_delete()
            .with(eq(found("web").object_key().unwrap()))
            .returning(|_| Err(Error::NotFound("gone".to_string())));

        dispatcher_with(api)
            .reverse(&pod_op("create"), &Intruder::default(), "team-a")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn client_construction_failure_fails_operation() {
        let mut factory = MockClientFactory::new();
        factory.expect_build().returning(|_| {
            Err(Error::ClientConstruction(kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "invalid bearer token".to_string(),
                reason: "Unauthorized".to_string(),
                code: 401,
            })))
        });
        let dispatcher = OperationDispatcher::new(Arc::new(factory), &OperatorConfig::default());

        let err = dispatcher
            .execute(&pod_op("get"), &Intruder::default(), "team-a")
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "client_construction");
    }

    #[tokio::test]
    async fn identity_is_resolved_per_call() {
        let mut factory = MockClientFactory::new();
        factory
            .expect_build()
            .with(eq(IntruderIdentity::ServiceAccount {
                username: "system:serviceaccount:team-a:builder".to_string(),
            }))
            .times(1)
            .returning(|_| {
                let mut api = MockClusterApi::new();
                api.expect_get().returning(|_| Ok(found("web")));
                Ok(Arc::new(api) as Arc<dyn ClusterApi>)
            });
        let intruder = Intruder {
            service_account: Some("builder".to_string()),
            ..Default::default()
        };

        OperationDispatcher::new(Arc::new(factory), &OperatorConfig::default())
            .execute(&pod_op("get"), &intruder, "team-a")
            .await
            .unwrap();
    }

    #[test]
    fn review_format_includes_evaluation_error() {
        let status = SubjectAccessReviewStatus {
            allowed: true,
            denied: Some(false),
            reason: None,
            evaluation_error: Some("webhook timeout".to_string()),
        };
        assert_eq!(
            format_review(&status),
            r#"allowed=true denied=false reason="" evaluationError="webhook timeout""#
        );
    }
}
