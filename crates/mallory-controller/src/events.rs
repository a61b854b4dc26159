//! Audit events for operation outcomes

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use mallory_crd::reasons;
use tracing::warn;

#[cfg(test)]
use mockall::automock;

/// Byte limit the events API enforces on a note
pub const MAX_NOTE_BYTES: usize = 1024;

const ACTION: &str = "Reconcile";

/// Outcome of one operation, as recorded against its resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationEvent {
    /// Operation returned an error
    Failed(String),
    /// Operation completed
    Succeeded,
    /// Operation produced non-empty output
    Output(String),
}

impl OperationEvent {
    /// Event reason
    #[must_use]
    pub fn reason(&self) -> &'static str {
        match self {
            Self::Failed(_) => reasons::OPERATION_FAILED,
            Self::Succeeded => reasons::OPERATION_SUCCEEDED,
            Self::Output(_) => reasons::OPERATION_OUTPUT,
        }
    }

    /// `Warning` for failures, `Normal` otherwise
    #[must_use]
    pub fn event_type(&self) -> EventType {
        match self {
            Self::Failed(_) => EventType::Warning,
            Self::Succeeded | Self::Output(_) => EventType::Normal,
        }
    }

    /// Note text prefixed with the operation ID and cut to [`MAX_NOTE_BYTES`]
    #[must_use]
    pub fn note(&self, operation_id: &str) -> String {
        let body = match self {
            Self::Failed(reason) => format!("failed to process resource operation: {reason}"),
            Self::Succeeded => "Resource processed successfully".to_string(),
            Self::Output(text) => text.clone(),
        };
        truncate_on_char_boundary(format!("[{operation_id}] {body}"), MAX_NOTE_BYTES)
    }
}

/// Destination for per-operation audit events
///
/// Recording never fails the pass; implementations log and drop errors.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record one outcome against `object`
    async fn record(&self, object: &ObjectReference, operation_id: &str, event: &OperationEvent);
}

/// Publishes through the cluster events API
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// Create sink reporting as `controller`
    #[must_use]
    pub fn new(client: Client, controller: impl Into<String>) -> Self {
        let reporter = Reporter {
            controller: controller.into(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn record(&self, object: &ObjectReference, operation_id: &str, event: &OperationEvent) {
        let ev = Event {
            type_: event.event_type(),
            reason: event.reason().to_string(),
            note: Some(event.note(operation_id)),
            action: ACTION.to_string(),
            secondary: None,
        };
        if let Err(err) = self.recorder.publish(&ev, object).await {
            warn!(
                operation = operation_id,
                reason = event.reason(),
                error = %err,
                "failed to publish event"
            );
        }
    }
}

fn truncate_on_char_boundary(mut text: String, max: usize) -> String {
    if text.len() > max {
        let mut cut = max;
        while !text.is_char_boundary(cut) {
            cut -= 1;
        }
        text.truncate(cut);
    }
    text
}
