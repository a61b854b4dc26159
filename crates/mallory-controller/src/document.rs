//! Schema-less resource documents
//!
//! Operation targets are arbitrary Kubernetes objects, so they are kept as
//! a JSON object with path accessors instead of per-kind structs.

use std::collections::BTreeMap;

use serde_json::{Map, Value};

use crate::error::{Error, Result};

/// An untyped object document (`apiVersion`, `kind`, `metadata`, ...)
#[derive(Debug, Clone, PartialEq)]
pub struct ResourceDocument {
    object: Map<String, Value>,
}

/// Address of a single object
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    /// `apiVersion`, e.g. `apps/v1`
    pub api_version: String,
    /// Kind, e.g. `Deployment`
    pub kind: String,
    /// Namespace; ignored for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

/// Label-selected set of objects of one kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListTarget {
    /// `apiVersion`
    pub api_version: String,
    /// Kind
    pub kind: String,
    /// Namespace; ignored for cluster-scoped kinds
    pub namespace: Option<String>,
    /// Labels that must all match
    pub labels: BTreeMap<String, String>,
}

impl ListTarget {
    /// Label selector in `k=v,k2=v2` form; `None` selects everything
    #[must_use]
    pub fn selector(&self) -> Option<String> {
        if self.labels.is_empty() {
            return None;
        }
        Some(
            self.labels
                .iter()
                .map(|(k, v)| format!("{k}={v}"))
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Whether an object's labels satisfy this target
    #[must_use]
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.labels.iter().all(|(k, v)| labels.get(k) == Some(v))
    }
}

impl ResourceDocument {
    /// Wrap a JSON value; it must be an object
    ///
    /// # Errors
    /// `Error::InvalidDocument` for any non-object value
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(object) => Ok(Self { object }),
            Value::Null => Err(Error::InvalidDocument("resource is empty".to_string())),
            other => Err(Error::InvalidDocument(format!(
                "expected an object, got {}",
                type_name(&other)
            ))),
        }
    }

    /// Underlying JSON object
    #[inline]
    #[must_use]
    pub fn as_object(&self) -> &Map<String, Value> {
        &self.object
    }

    /// Consume into a JSON value
    #[inline]
    #[must_use]
    pub fn into_value(self) -> Value {
        Value::Object(self.object)
    }

    /// Serialize to compact JSON
    ///
    /// # Errors
    /// `Error::Serialization` if encoding fails
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&self.object)?)
    }

    /// Field at `path`, walking nested objects
    #[must_use]
    pub fn nested(&self, path: &[&str]) -> Option<&Value> {
        nested_in(&self.object, path)
    }

    /// String field at `path`; empty strings count as absent
    #[must_use]
    pub fn nested_str(&self, path: &[&str]) -> Option<&str> {
        self.nested(path).and_then(Value::as_str).filter(|s| !s.is_empty())
    }

    /// Array field at `path`
    #[must_use]
    pub fn nested_array(&self, path: &[&str]) -> Option<&Vec<Value>> {
        self.nested(path).and_then(Value::as_array)
    }

    /// String map at `path`; non-string values are skipped
    #[must_use]
    pub fn nested_string_map(&self, path: &[&str]) -> BTreeMap<String, String> {
        self.nested(path)
            .and_then(Value::as_object)
            .map(|map| {
                map.iter()
                    .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// `apiVersion`, empty when absent
    #[inline]
    #[must_use]
    pub fn api_version(&self) -> &str {
        self.nested_str(&["apiVersion"]).unwrap_or_default()
    }

    /// `kind`, empty when absent
    #[inline]
    #[must_use]
    pub fn kind(&self) -> &str {
        self.nested_str(&["kind"]).unwrap_or_default()
    }

    /// `metadata.name`, empty when absent
    #[inline]
    #[must_use]
    pub fn name(&self) -> &str {
        self.nested_str(&["metadata", "name"]).unwrap_or_default()
    }

    /// `metadata.namespace` when set and non-empty
    #[inline]
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.nested_str(&["metadata", "namespace"])
    }

    /// `metadata.labels`
    #[inline]
    #[must_use]
    pub fn labels(&self) -> BTreeMap<String, String> {
        self.nested_string_map(&["metadata", "labels"])
    }

    /// Set `metadata.namespace`, creating `metadata` if needed
    pub fn set_namespace(&mut self, namespace: &str) {
        let metadata = self
            .object
            .entry("metadata")
            .or_insert_with(|| Value::Object(Map::new()));
        if !metadata.is_object() {
            *metadata = Value::Object(Map::new());
        }
        if let Value::Object(metadata) = metadata {
            metadata.insert("namespace".to_string(), Value::String(namespace.to_string()));
        }
    }

    /// Fill `metadata.namespace` only when it is empty
    pub fn default_namespace(&mut self, namespace: &str) {
        if self.namespace().is_none() {
            self.set_namespace(namespace);
        }
    }

    /// Address of this object
    ///
    /// # Errors
    /// `Error::InvalidDocument` when `apiVersion`, `kind` or `metadata.name` is missing
    pub fn object_key(&self) -> Result<ObjectKey> {
        let name = self.require(&["metadata", "name"])?;
        Ok(ObjectKey {
            api_version: self.require(&["apiVersion"])?.to_string(),
            kind: self.require(&["kind"])?.to_string(),
            namespace: self.namespace().map(str::to_string),
            name: name.to_string(),
        })
    }

    /// Objects of this document's kind carrying its labels
    ///
    /// # Errors
    /// `Error::InvalidDocument` when `apiVersion` or `kind` is missing
    pub fn list_target(&self) -> Result<ListTarget> {
        Ok(ListTarget {
            api_version: self.require(&["apiVersion"])?.to_string(),
            kind: self.require(&["kind"])?.to_string(),
            namespace: self.namespace().map(str::to_string),
            labels: self.labels(),
        })
    }

    fn require(&self, path: &[&str]) -> Result<&str> {
        self.nested_str(path).ok_or_else(|| {
            Error::InvalidDocument(format!(
                "the '{}' field was not found in the resource",
                path.join(".")
            ))
        })
    }
}

/// Field at `path` inside an arbitrary JSON object
pub(crate) fn nested_in<'a>(object: &'a Map<String, Value>, path: &[&str]) -> Option<&'a Value> {
    let (first, rest) = path.split_first()?;
    rest.iter()
        .try_fold(object.get(*first)?, |value, key| value.as_object()?.get(*key))
}

/// Strings of a JSON array; any non-string element is an error
pub(crate) fn string_array(value: &Value, field: &str) -> Result<Vec<String>> {
    let items = value.as_array().ok_or_else(|| {
        Error::InvalidDocument(format!(
            "expected '{field}' to be an array but got {}",
            type_name(value)
        ))
    })?;
    items
        .iter()
        .map(|item| {
            item.as_str().map(str::to_string).ok_or_else(|| {
                Error::InvalidDocument(format!("element of '{field}' is not a string: {item}"))
            })
        })
        .collect()
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
