//! `Event` custom resource

use kube::CustomResource;
use schemars::gen::SchemaGenerator;
use schemars::schema::{InstanceType, Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::verb::{UnknownVerb, Verb};

/// Ownership marker placed on every `EventResource` until cleanup completes
pub const FINALIZER: &str = "events.mallory.io/finalizer";

/// Desired state of an `Event`: who acts, and what they attempt
#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[kube(
    group = "mallory.io",
    version = "v1",
    kind = "Event",
    root = "EventResource",
    namespaced,
    status = "EventStatus",
    shortname = "mev",
    derive = "PartialEq",
    printcolumn = r#"{"name":"Result","type":"string","jsonPath":".status.result"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EventSpec {
    /// Identity every operation runs under
    #[serde(default)]
    pub intruder: Intruder,
    /// Operations, executed strictly in this order
    #[serde(default)]
    pub operations: Vec<Operation>,
}

/// Identity descriptor for the simulated attacker
///
/// When several fields are set the token wins, then the service account,
/// then the user. None set means the controller's own identity.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Intruder {
    /// Bearer token, used verbatim
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    /// Service account name in the resource's namespace
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account: Option<String>,
    /// User and groups to impersonate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<UserInfo>,
}

/// Impersonated user
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct UserInfo {
    /// User name
    pub name: String,
    /// Group names, passed through in order
    #[serde(default)]
    pub groups: Vec<String>,
}

/// One verb applied to one schema-less target document
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, JsonSchema)]
pub struct Operation {
    /// Correlation label used in events and cleanup errors
    pub id: String,
    /// One of `create|delete|get|list|update|exec|auth|logs`
    pub verb: String,
    /// Target object, or a `SelfSubjectAccessReview` for `auth`
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub resource: serde_json::Value,
}

impl Operation {
    /// Create operation
    #[inline]
    pub fn new(id: impl Into<String>, verb: Verb, resource: serde_json::Value) -> Self {
        Self {
            id: id.into(),
            verb: verb.as_str().to_string(),
            resource,
        }
    }

    /// Parse the declared verb
    ///
    /// # Errors
    /// `UnknownVerb` carrying the literal string
    #[inline]
    pub fn parsed_verb(&self) -> Result<Verb, UnknownVerb> {
        self.verb.parse()
    }

    /// Whether cleanup must reverse this operation
    #[inline]
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        self.parsed_verb().is_ok_and(Verb::is_reversible)
    }
}

/// Observed state of an `Event`
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct EventStatus {
    /// Aggregate of the most recent pass
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<RunResult>,
}

/// Aggregate outcome of one reconciliation pass
#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum RunResult {
    /// Every operation succeeded
    Success,
    /// At least one operation failed
    Error,
}

impl RunResult {
    /// `Error` iff any operation failed
    #[inline]
    #[must_use]
    pub fn from_failures(failed: usize) -> Self {
        if failed == 0 {
            Self::Success
        } else {
            Self::Error
        }
    }

    /// Wire form
    #[inline]
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "Success",
            Self::Error => "Error",
        }
    }
}

fn preserve_unknown_fields(_: &mut SchemaGenerator) -> Schema {
    let mut schema = SchemaObject {
        instance_type: Some(InstanceType::Object.into()),
        ..Default::default()
    };
    schema.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    Schema::Object(schema)
}
