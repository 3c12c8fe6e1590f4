//! Function, project and function-event records.
//!
//! A function is addressed by `(namespace, name)`. Its declarative spec is
//! also serialized into the container labels on every deploy, so the
//! container runtime remains a ground-truth copy of the configuration even
//! if the record store is lost.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::logstream::LogEntry;

pub const MIB: usize = 1 << 20;

/// Hard bound on `status.message`, regardless of storage backend.
pub const MAX_STATUS_MESSAGE_BYTES: usize = 4 * MIB;

pub const PLATFORM_NAME: &str = "local";

pub const LABEL_PLATFORM: &str = "nuclio.io/platform";
pub const LABEL_NAMESPACE: &str = "nuclio.io/namespace";
pub const LABEL_FUNCTION_NAME: &str = "nuclio.io/function-name";
pub const LABEL_FUNCTION_SPEC: &str = "nuclio.io/function-spec";
pub const LABEL_ANNOTATIONS: &str = "nuclio.io/annotations";
pub const LABEL_PROJECT_NAME: &str = "nuclio.io/project-name";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub annotations: HashMap<String, String>,
}

impl FunctionMeta {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            namespace: namespace.into(),
            ..Default::default()
        }
    }

    /// Globally unique identity, used as the record store key.
    pub fn unique_id(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }

    pub fn is_complete(&self) -> bool {
        !self.name.is_empty() && !self.namespace.is_empty()
    }

    /// Deterministic container name for this identity.
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub host_path: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionSpec {
    #[serde(default)]
    pub image: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub env: HashMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub volumes: Vec<Volume>,
    /// Desired host HTTP port. When unset the port of the previous
    /// deployment is reused, falling back to an ephemeral port.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_port: Option<u16>,
    /// Zero means the platform default (60s).
    #[serde(default)]
    pub readiness_timeout_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    /// Registries are stripped by the local backend, which has none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_registry: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_registry: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionConfig {
    #[serde(rename = "metadata")]
    pub meta: FunctionMeta,
    #[serde(default)]
    pub spec: FunctionSpec,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FunctionState {
    /// Transient: a deployment is in flight for this identity.
    #[default]
    Building,
    /// The container existed and reported healthy at deploy time.
    Ready,
    /// Terminal failure; `message` carries the formatted error chain.
    Error,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionStatus {
    #[serde(default)]
    pub state: FunctionState,
    #[serde(default, rename = "httpPort")]
    pub http_port: u16,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogEntry>,
}

/// The authoritative record for one function.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionRecord {
    pub config: FunctionConfig,
    #[serde(default)]
    pub status: FunctionStatus,
}

impl FunctionRecord {
    pub fn unique_id(&self) -> String {
        self.config.meta.unique_id()
    }

    pub fn state(&self) -> FunctionState {
        self.status.state
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl ProjectMeta {
    pub fn unique_id(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// A labeling grouping over functions and events.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProjectConfig {
    #[serde(rename = "metadata")]
    pub meta: ProjectMeta,
    #[serde(default)]
    pub spec: ProjectSpec,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FunctionEventMeta {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    /// Association to a function goes through the
    /// `nuclio.io/function-name` label.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub labels: HashMap<String, String>,
}

impl FunctionEventMeta {
    pub fn unique_id(&self) -> String {
        format!("{}:{}", self.namespace, self.name)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionEventSpec {
    #[serde(default)]
    pub trigger_name: String,
    #[serde(default)]
    pub trigger_kind: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub attributes: HashMap<String, serde_json::Value>,
}

/// A saved invocation template. Not executable by itself.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FunctionEventConfig {
    #[serde(rename = "metadata")]
    pub meta: FunctionEventMeta,
    #[serde(default)]
    pub spec: FunctionEventSpec,
}

/// Enforce the status message bound in place, respecting char boundaries.
pub fn truncate_status_message(message: &mut String) {
    if message.len() <= MAX_STATUS_MESSAGE_BYTES {
        return;
    }
    let mut end = MAX_STATUS_MESSAGE_BYTES;
    while !message.is_char_boundary(end) {
        end -= 1;
    }
    message.truncate(end);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unique_id_and_container_name() {
        let meta = FunctionMeta::new("nuclio", "echo");
        assert_eq!(meta.unique_id(), "nuclio:echo");
        assert_eq!(meta.container_name(), "nuclio-echo");
        assert!(meta.is_complete());
        assert!(!FunctionMeta::new("", "echo").is_complete());
    }

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&FunctionState::Ready).unwrap(),
            "\"ready\""
        );
        assert_eq!(
            serde_json::from_str::<FunctionState>("\"error\"").unwrap(),
            FunctionState::Error
        );
    }

    #[test]
    fn test_spec_roundtrip_camel_case() {
        let spec = FunctionSpec {
            image: "echo:1".to_string(),
            http_port: Some(9000),
            readiness_timeout_seconds: 10,
            ..Default::default()
        };
        let encoded = serde_json::to_string(&spec).unwrap();
        assert!(encoded.contains("\"httpPort\":9000"));
        assert!(encoded.contains("\"readinessTimeoutSeconds\":10"));
        let decoded: FunctionSpec = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, spec);
    }

    #[test]
    fn test_truncate_status_message() {
        let mut short = "all good".to_string();
        truncate_status_message(&mut short);
        assert_eq!(short, "all good");

        let mut long = "x".repeat(MAX_STATUS_MESSAGE_BYTES + 10);
        truncate_status_message(&mut long);
        assert_eq!(long.len(), MAX_STATUS_MESSAGE_BYTES);

        // multi-byte char straddling the bound must not split
        let mut multibyte = "x".repeat(MAX_STATUS_MESSAGE_BYTES - 1);
        multibyte.push('é');
        multibyte.push_str("tail");
        truncate_status_message(&mut multibyte);
        assert!(multibyte.len() <= MAX_STATUS_MESSAGE_BYTES);
        assert!(multibyte.is_char_boundary(multibyte.len()));
    }
}
