//! condwatch core types – condition model, status extraction, change stream

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Coordinate of the watched collection: `{group, version, resource}`.
///
/// `resource` is the lowercase plural name ("clusters"), not the kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceCoordinate {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ResourceCoordinate {
    pub fn new(
        group: impl Into<String>,
        version: impl Into<String>,
        resource: impl Into<String>,
    ) -> Self {
        Self { group: group.into(), version: version.into(), resource: resource.into() }
    }
}

impl std::fmt::Display for ResourceCoordinate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.group.is_empty() {
            write!(f, "{}/{}", self.version, self.resource)
        } else {
            write!(f, "{}/{}/{}", self.group, self.version, self.resource)
        }
    }
}

/// Observed value of a condition's `status` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConditionStatus {
    True,
    False,
    Unknown,
}

impl ConditionStatus {
    /// Only `True` counts as healthy; `Unknown` is deliberately not a third
    /// category because the event type space downstream is Normal/Warning.
    pub fn is_healthy(self) -> bool {
        matches!(self, ConditionStatus::True)
    }
}

/// One dimension of the watched object's reported state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Condition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: ConditionStatus,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub message: String,
}

/// Decoded `status` section of a watched object.
///
/// Only `conditions` is modeled; sibling fields are ignored on decode.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("decoding status: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Read `status` off a raw object.
///
/// Absent or null `status` is not an error: the object simply has nothing to
/// report yet. A present-but-undecodable `status` (wrong shape, malformed
/// conditions) is a local error the caller logs and drops: the watched
/// schema is operator-configured and must never take the pipeline down.
pub fn extract_status(raw: &Value) -> Result<Option<Status>, ExtractError> {
    let Some(status) = raw.get("status") else {
        return Ok(None);
    };
    if status.is_null() {
        return Ok(None);
    }
    let status: Status = serde_json::from_value(status.clone())?;
    Ok(Some(status))
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum ChangeKind {
    Applied,
    Deleted,
    /// Synthetic re-delivery of an unchanged mirrored object.
    Resynced,
}

/// One notification out of the watch hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Change {
    pub kind: ChangeKind,
    /// Raw object (managedFields stripped).
    pub raw: Value,
}

/// Identity of the object a change came from, copied at notification time.
/// Never retained past the emission call that consumes it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRef {
    pub uid: String,
    pub kind: String,
    pub name: String,
    pub namespace: Option<String>,
    pub api_version: String,
    pub resource_version: String,
}

impl SourceRef {
    /// Best-effort copy of the identifying fields; anything missing stays empty.
    pub fn from_raw(raw: &Value) -> Self {
        let meta = raw.get("metadata");
        let str_of = |v: Option<&Value>| v.and_then(|v| v.as_str()).unwrap_or("").to_string();
        Self {
            uid: str_of(meta.and_then(|m| m.get("uid"))),
            kind: str_of(raw.get("kind")),
            name: str_of(meta.and_then(|m| m.get("name"))),
            namespace: meta
                .and_then(|m| m.get("namespace"))
                .and_then(|v| v.as_str())
                .map(|s| s.to_string()),
            api_version: str_of(raw.get("apiVersion")),
            resource_version: str_of(meta.and_then(|m| m.get("resourceVersion"))),
        }
    }

    /// "namespace/name" for namespaced objects, bare name otherwise.
    pub fn display_name(&self) -> String {
        match self.namespace.as_deref() {
            Some(ns) => format!("{}/{}", ns, self.name),
            None => self.name.clone(),
        }
    }
}

pub mod prelude {
    pub use super::{
        extract_status, Change, ChangeKind, Condition, ConditionStatus, ExtractError,
        ResourceCoordinate, SourceRef, Status,
    };
}
