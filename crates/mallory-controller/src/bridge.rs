//! Remote exec and log tail against a label-selected pod
//!
//! Only the first pod matched by the selector is targeted. Output is
//! collected into a [`BoundedSink`] so a chatty command cannot grow memory
//! past `max_output_bytes`.

use tracing::{debug, info};

use crate::client::{ClusterApi, ExecRequest, LogRequest};
use crate::document::{nested_in, string_array, ListTarget, ResourceDocument};
use crate::error::{Error, Result};

/// Marker appended when a stream exceeded its byte cap
pub const TRUNCATION_MARKER: &str = "\n[output truncated]\n";

/// Byte buffer that keeps the first `limit` bytes and counts the rest
#[derive(Debug)]
pub struct BoundedSink {
    buf: Vec<u8>,
    limit: usize,
    dropped: usize,
}

impl BoundedSink {
    /// Create sink
    #[must_use]
    pub fn new(limit: usize) -> Self {
        Self {
            buf: Vec::with_capacity(limit.min(8192)),
            limit,
            dropped: 0,
        }
    }

    /// Append a chunk; bytes past the cap are discarded
    pub fn extend(&mut self, chunk: &[u8]) {
        let room = self.limit.saturating_sub(self.buf.len());
        let take = room.min(chunk.len());
        self.buf.extend_from_slice(&chunk[..take]);
        self.dropped += chunk.len() - take;
    }

    /// Whether any input was discarded
    #[inline]
    #[must_use]
    pub fn is_truncated(&self) -> bool {
        self.dropped > 0
    }

    /// Lossy UTF-8 text, with the truncation marker if bytes were dropped
    #[must_use]
    pub fn into_string(self) -> String {
        let mut out = String::from_utf8_lossy(&self.buf).into_owned();
        if self.dropped > 0 {
            out.push_str(TRUNCATION_MARKER);
        }
        out
    }
}

/// Container and command extracted from a workload document
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecSpec {
    /// First declared container
    pub container: String,
    /// `command` followed by `args`
    pub command: Vec<String>,
}

impl ExecSpec {
    /// Read the first container of the document's pod spec
    ///
    /// # Errors
    /// `UnsupportedKind` for kinds without a pod spec, `InvalidDocument`
    /// when the container has no name or no `command`
    pub fn from_document(doc: &ResourceDocument) -> Result<Self> {
        let container = first_container(doc)?;
        let name = container
            .get("name")
            .and_then(serde_json::Value::as_str)
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::InvalidDocument("container has no name".to_string()))?;
        let mut command = container
            .get("command")
            .ok_or_else(|| {
                Error::InvalidDocument(format!("container {name} declares no command"))
            })
            .and_then(|v| string_array(v, "command"))?;
        if let Some(args) = container.get("args") {
            command.extend(string_array(args, "args")?);
        }
        Ok(Self {
            container: name.to_string(),
            command,
        })
    }
}

/// Outcome of resolving the target pod
#[derive(Debug, Clone, PartialEq)]
pub enum PodTarget {
    /// First pod matched
    Pod {
        /// Pod namespace
        namespace: String,
        /// Pod name
        name: String,
    },
    /// Listing reported not-found; the message is the operation output
    Missing(String),
}

/// Pods selected by a workload document
///
/// A `Pod` selects by its own labels. A `Deployment` or `ReplicaSet`
/// selects by `spec.selector.matchLabels`, then its template labels, then
/// its own labels.
///
/// # Errors
/// `UnsupportedKind` for any other kind
pub fn pod_selector(doc: &ResourceDocument) -> Result<ListTarget> {
    let labels = match doc.kind() {
        "Pod" => doc.labels(),
        "Deployment" | "ReplicaSet" => [
            doc.nested_string_map(&["spec", "selector", "matchLabels"]),
            doc.nested_string_map(&["spec", "template", "metadata", "labels"]),
        ]
        .into_iter()
        .find(|labels| !labels.is_empty())
        .unwrap_or_else(|| doc.labels()),
        other => return Err(Error::UnsupportedKind(other.to_string())),
    };
    Ok(ListTarget {
        api_version: "v1".to_string(),
        kind: "Pod".to_string(),
        namespace: doc.namespace().map(str::to_string),
        labels,
    })
}

/// List the selected pods and take the first one
///
/// # Errors
/// `NoMatchingTarget` when the selector matches nothing; other list
/// failures propagate
pub async fn resolve_pod(api: &dyn ClusterApi, doc: &ResourceDocument) -> Result<PodTarget> {
    let target = pod_selector(doc)?;
    let pods = match api.list(&target).await {
        Ok(pods) => pods,
        Err(Error::NotFound(message)) => return Ok(PodTarget::Missing(message)),
        Err(err) => return Err(err),
    };
    let namespace = target.namespace.clone().unwrap_or_default();
    let Some(pod) = pods.first() else {
        return Err(Error::NoMatchingTarget {
            kind: target.kind,
            namespace,
        });
    };
    if pods.len() > 1 {
        debug!(
            matched = pods.len(),
            pod = pod.name(),
            "selector matched several pods, using first"
        );
    }
    Ok(PodTarget::Pod {
        namespace: pod.namespace().map_or(namespace, str::to_string),
        name: pod.name().to_string(),
    })
}

/// Run the document's first container command in the first matched pod
///
/// Returns stdout followed by stderr.
///
/// # Errors
/// Resolution errors, `RemoteExecution` carrying stderr on a failed run,
/// `Timeout` when the stream outlives its bound
pub async fn exec(api: &dyn ClusterApi, doc: &ResourceDocument) -> Result<String> {
    let spec = ExecSpec::from_document(doc)?;
    let (namespace, pod) = match resolve_pod(api, doc).await? {
        PodTarget::Pod { namespace, name } => (namespace, name),
        PodTarget::Missing(message) => return Ok(message),
    };
    info!(pod = %pod, container = %spec.container, "executing in pod");
    api.exec(&ExecRequest {
        namespace,
        pod,
        container: spec.container,
        command: spec.command,
    })
    .await?
    .into_result()
}

/// Tail the log of the first matched pod
///
/// # Errors
/// Resolution errors and stream failures
pub async fn logs(api: &dyn ClusterApi, doc: &ResourceDocument, tail_lines: i64) -> Result<String> {
    let (namespace, pod) = match resolve_pod(api, doc).await? {
        PodTarget::Pod { namespace, name } => (namespace, name),
        PodTarget::Missing(message) => return Ok(message),
    };
    let container = first_container(doc)
        .ok()
        .and_then(|c| c.get("name").and_then(serde_json::Value::as_str))
        .filter(|s| !s.is_empty())
        .map(str::to_string);
    api.logs(&LogRequest {
        namespace,
        pod,
        container,
        tail_lines,
    })
    .await
}

fn first_container(doc: &ResourceDocument) -> Result<&serde_json::Map<String, serde_json::Value>> {
    let path: &[&str] = match doc.kind() {
        "Pod" => &["spec", "containers"],
        "Deployment" | "ReplicaSet" => &["spec", "template", "spec", "containers"],
        other => return Err(Error::UnsupportedKind(other.to_string())),
    };
    nested_in(doc.as_object(), path)
        .and_then(serde_json::Value::as_array)
        .and_then(|containers| containers.first())
        .and_then(serde_json::Value::as_object)
        .ok_or_else(|| {
            Error::InvalidDocument(format!("{} declares no containers", doc.kind()))
        })
}
