//! Scoped, schema-less cluster clients
//!
//! `ClusterApi` is the whole cluster surface the core needs: CRUD on
//! documents addressed by `(apiVersion, kind, namespace, name)`, label
//! listing, access review, exec and log tail. `ClientFactory` builds one
//! per operation, bound to the resolved intruder identity.

use std::sync::Arc;

use async_trait::async_trait;
use k8s_openapi::api::authorization::v1::{SelfSubjectAccessReview, SubjectAccessReviewStatus};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{
    Api, ApiResource, AttachParams, DeleteParams, DynamicObject, ListParams, LogParams, PostParams,
};
use kube::core::GroupVersionKind;
use kube::discovery::{self, Scope};
use kube::Client;
use tracing::{debug, instrument};

#[cfg(test)]
use mockall::automock;

use crate::bridge::BoundedSink;
use crate::config::StreamLimits;
use crate::document::{ListTarget, ObjectKey, ResourceDocument};
use crate::error::{Error, Result};
use crate::identity::IntruderIdentity;

/// Command to run in one container of one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container name
    pub container: String,
    /// `command` followed by `args`
    pub command: Vec<String>,
}

/// Captured result of a remote command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    /// Captured stdout
    pub stdout: String,
    /// Captured stderr
    pub stderr: String,
    /// Server-reported failure, `None` on a zero exit
    pub failure: Option<String>,
}

impl ExecOutput {
    /// Successful run
    #[must_use]
    pub fn success(stdout: impl Into<String>, stderr: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            failure: None,
        }
    }

    /// Stdout followed by stderr
    #[must_use]
    pub fn combined(&self) -> String {
        let mut out = String::with_capacity(self.stdout.len() + self.stderr.len());
        out.push_str(&self.stdout);
        out.push_str(&self.stderr);
        out
    }

    /// Combined output, or `RemoteExecution` carrying stderr on failure
    ///
    /// # Errors
    /// `Error::RemoteExecution` when the remote command did not succeed
    pub fn into_result(self) -> Result<String> {
        match self.failure {
            None => Ok(self.combined()),
            Some(message) => Err(Error::RemoteExecution {
                message,
                stderr: self.stderr,
            }),
        }
    }
}

/// Log tail request for one pod
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogRequest {
    /// Pod namespace
    pub namespace: String,
    /// Pod name
    pub pod: String,
    /// Container, when the pod has several
    pub container: Option<String>,
    /// Number of trailing lines
    pub tail_lines: i64,
}

/// Schema-less cluster operations under one identity
///
/// A 404 from the server surfaces as `Error::NotFound` carrying its message.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch one object
    async fn get(&self, key: &ObjectKey) -> Result<ResourceDocument>;

    /// Objects of a kind matching every label of the target
    async fn list(&self, target: &ListTarget) -> Result<Vec<ResourceDocument>>;

    /// Create an object
    async fn create(&self, document: &ResourceDocument) -> Result<ResourceDocument>;

    /// Replace an object
    async fn replace(&self, document: &ResourceDocument) -> Result<ResourceDocument>;

    /// Delete an object
    async fn delete(&self, key: &ObjectKey) -> Result<()>;

    /// Submit a self subject access review
    async fn access_review(
        &self,
        review: SelfSubjectAccessReview,
    ) -> Result<SubjectAccessReviewStatus>;

    /// Run a command to completion
    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput>;

    /// Read the tail of a pod log
    async fn logs(&self, request: &LogRequest) -> Result<String>;
}

/// Builds a `ClusterApi` bound to an identity
#[cfg_attr(test, automock)]
pub trait ClientFactory: Send + Sync {
    /// Build a scoped client
    ///
    /// # Errors
    /// `Error::ClientConstruction` when the connection settings are unusable
    fn build(&self, identity: &IntruderIdentity) -> Result<Arc<dyn ClusterApi>>;
}

/// Factory over the controller's inferred connection config
#[derive(Clone)]
pub struct KubeClientFactory {
    base: Arc<kube::Config>,
    limits: StreamLimits,
}

impl KubeClientFactory {
    /// Create factory; `base` is shared read-only by every client
    #[must_use]
    pub fn new(base: Arc<kube::Config>, limits: StreamLimits) -> Self {
        Self { base, limits }
    }
}

impl ClientFactory for KubeClientFactory {
    fn build(&self, identity: &IntruderIdentity) -> Result<Arc<dyn ClusterApi>> {
        let config = identity.apply(&self.base);
        let client = Client::try_from(config).map_err(Error::ClientConstruction)?;
        debug!(identity = identity.label(), "built scoped client");
        Ok(Arc::new(KubeClusterApi::new(client, self.limits)))
    }
}

/// `ClusterApi` over a live `kube::Client`
#[derive(Clone)]
pub struct KubeClusterApi {
    client: Client,
    limits: StreamLimits,
}

impl KubeClusterApi {
    /// Wrap a client
    #[must_use]
    pub fn new(client: Client, limits: StreamLimits) -> Self {
        Self { client, limits }
    }

    /// Dynamic API for a kind, scoped by discovery
    async fn dynamic_api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<(Api<DynamicObject>, ApiResource)> {
        let (group, version) = parse_api_version(api_version);
        let gvk = GroupVersionKind::gvk(group, version, kind);
        let (ar, caps) = discovery::pinned_kind(&self.client, &gvk)
            .await
            .map_err(Error::from_kube)?;
        let api = match (&caps.scope, namespace) {
            (Scope::Namespaced, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (Scope::Namespaced, None) => Api::default_namespaced_with(self.client.clone(), &ar),
            (Scope::Cluster, _) => Api::all_with(self.client.clone(), &ar),
        };
        Ok((api, ar))
    }
}

#[async_trait]
impl ClusterApi for KubeClusterApi {
    #[instrument(skip(self), fields(kind = %key.kind, name = %key.name))]
    async fn get(&self, key: &ObjectKey) -> Result<ResourceDocument> {
        let (api, ar) = self
            .dynamic_api(&key.api_version, &key.kind, key.namespace.as_deref())
            .await?;
        let obj = api.get(&key.name).await.map_err(Error::from_kube)?;
        to_document(obj, &ar)
    }

    #[instrument(skip(self), fields(kind = %target.kind))]
    async fn list(&self, target: &ListTarget) -> Result<Vec<ResourceDocument>> {
        let (api, ar) = self
            .dynamic_api(&target.api_version, &target.kind, target.namespace.as_deref())
            .await?;
        let mut params = ListParams::default();
        if let Some(selector) = target.selector() {
            params = params.labels(&selector);
        }
        let list = api.list(&params).await.map_err(Error::from_kube)?;
        list.items.into_iter().map(|obj| to_document(obj, &ar)).collect()
    }

    async fn create(&self, document: &ResourceDocument) -> Result<ResourceDocument> {
        let (api, ar) = self
            .dynamic_api(document.api_version(), document.kind(), document.namespace())
            .await?;
        let created = api
            .create(&PostParams::default(), &to_dynamic(document)?)
            .await
            .map_err(Error::from_kube)?;
        to_document(created, &ar)
    }

    async fn replace(&self, document: &ResourceDocument) -> Result<ResourceDocument> {
        let (api, ar) = self
            .dynamic_api(document.api_version(), document.kind(), document.namespace())
            .await?;
        let replaced = api
            .replace(document.name(), &PostParams::default(), &to_dynamic(document)?)
            .await
            .map_err(Error::from_kube)?;
        to_document(replaced, &ar)
    }

    async fn delete(&self, key: &ObjectKey) -> Result<()> {
        let (api, _) = self
            .dynamic_api(&key.api_version, &key.kind, key.namespace.as_deref())
            .await?;
        api.delete(&key.name, &DeleteParams::default())
            .await
            .map_err(Error::from_kube)?;
        Ok(())
    }

    async fn access_review(
        &self,
        review: SelfSubjectAccessReview,
    ) -> Result<SubjectAccessReviewStatus> {
        let api: Api<SelfSubjectAccessReview> = Api::all(self.client.clone());
        let created = api
            .create(&PostParams::default(), &review)
            .await
            .map_err(Error::from_kube)?;
        Ok(created.status.unwrap_or_default())
    }

    #[instrument(skip(self), fields(pod = %request.pod, container = %request.container))]
    async fn exec(&self, request: &ExecRequest) -> Result<ExecOutput> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);
        let params = AttachParams::default()
            .container(request.container.clone())
            .stdin(false)
            .stdout(true)
            .stderr(true)
            .tty(false);
        let limit = self.limits.max_output_bytes;

        let run = async {
            let mut attached = pods
                .exec(&request.pod, request.command.clone(), &params)
                .await
                .map_err(|e| Error::RemoteExecution {
                    message: e.to_string(),
                    stderr: String::new(),
                })?;
            let status = attached.take_status();
            let stdout_reader = attached.stdout();
            let stderr_reader = attached.stderr();
            let (stdout, stderr) = tokio::join!(
                read_bounded(stdout_reader, limit),
                read_bounded(stderr_reader, limit)
            );
            let stderr = stderr.map_err(|e| Error::RemoteExecution {
                message: e.to_string(),
                stderr: String::new(),
            })?;
            let stdout = stdout.map_err(|e| Error::RemoteExecution {
                message: e.to_string(),
                stderr: stderr.clone(),
            })?;

            let status = match status {
                Some(status) => status.await,
                None => None,
            };
            attached.join().await.map_err(|e| Error::RemoteExecution {
                message: e.to_string(),
                stderr: stderr.clone(),
            })?;

            let failure = status.and_then(|s| {
                (s.status.as_deref() != Some("Success")).then(|| {
                    s.message
                        .or(s.reason)
                        .unwrap_or_else(|| "command terminated with a failure status".to_string())
                })
            });
            Ok(ExecOutput {
                stdout,
                stderr,
                failure,
            })
        };

        tokio::time::timeout(self.limits.timeout, run)
            .await
            .map_err(|_| Error::Timeout {
                duration_secs: self.limits.timeout.as_secs(),
            })?
    }

    #[instrument(skip(self), fields(pod = %request.pod))]
    async fn logs(&self, request: &LogRequest) -> Result<String> {
        use futures::io::AsyncReadExt;

        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &request.namespace);
        let params = LogParams {
            container: request.container.clone(),
            tail_lines: Some(request.tail_lines),
            ..LogParams::default()
        };
        let limit = self.limits.max_output_bytes;

        let read = async {
            // dropped on every return path, which closes the response body
            let mut stream = Box::pin(
                pods.log_stream(&request.pod, &params)
                    .await
                    .map_err(Error::from_kube)?,
            );
            let mut sink = BoundedSink::new(limit);
            let mut chunk = [0u8; 8192];
            loop {
                let n = stream.read(&mut chunk).await.map_err(|e| Error::RemoteExecution {
                    message: format!("failed to read logs: {e}"),
                    stderr: String::new(),
                })?;
                if n == 0 {
                    break;
                }
                sink.extend(&chunk[..n]);
            }
            Ok(sink.into_string())
        };

        tokio::time::timeout(self.limits.timeout, read)
            .await
            .map_err(|_| Error::Timeout {
                duration_secs: self.limits.timeout.as_secs(),
            })?
    }
}

/// Split `apiVersion` into group and version; core resources have no group
#[must_use]
pub fn parse_api_version(api_version: &str) -> (&str, &str) {
    match api_version.split_once('/') {
        Some((group, version)) => (group, version),
        None => ("", api_version),
    }
}

fn to_dynamic(document: &ResourceDocument) -> Result<DynamicObject> {
    Ok(serde_json::from_value(document.clone().into_value())?)
}

fn to_document(obj: DynamicObject, ar: &ApiResource) -> Result<ResourceDocument> {
    let mut value = serde_json::to_value(obj)?;
    // list items come back without type meta
    if let Some(map) = value.as_object_mut() {
        map.entry("apiVersion")
            .or_insert_with(|| ar.api_version.clone().into());
        map.entry("kind").or_insert_with(|| ar.kind.clone().into());
    }
    ResourceDocument::from_value(value)
}

async fn read_bounded<R>(reader: Option<R>, limit: usize) -> std::io::Result<String>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let Some(mut reader) = reader else {
        return Ok(String::new());
    };
    let mut sink = BoundedSink::new(limit);
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        sink.extend(&chunk[..n]);
    }
    Ok(sink.into_string())
}
