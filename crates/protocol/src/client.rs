//! Client → Server request bodies

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Overrides supplied when creating a session.
///
/// Every field is optional; absent fields fall back to the cluster defaults
/// for the session's kind.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entrypoint: Option<Vec<String>>,
    /// Merged key-by-key over the default environment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<BTreeMap<String, String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slots: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpus: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shm_size_mb: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub work_dir: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl SessionSpec {
    pub fn is_empty(&self) -> bool {
        *self == SessionSpec::default()
    }
}

/// Body of `POST /{kind}/{id}/input`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRequest {
    pub data: String,
}

#[cfg(test)]
mod tests {
    use super::SessionSpec;

    #[test]
    fn empty_body_is_an_empty_spec() {
        let spec: SessionSpec = serde_json::from_str("{}").expect("parse empty spec");
        assert!(spec.is_empty());
    }

    #[test]
    fn deserializes_partial_overrides() {
        let json = r#"{
          "image":"python:3.12",
          "environment":{"FOO":"bar"},
          "memory_mb":2048
        }"#;

        let spec: SessionSpec = serde_json::from_str(json).expect("parse spec");
        assert_eq!(spec.image.as_deref(), Some("python:3.12"));
        assert_eq!(spec.memory_mb, Some(2048));
        assert_eq!(
            spec.environment.as_ref().and_then(|env| env.get("FOO")).map(String::as_str),
            Some("bar")
        );
        assert!(spec.entrypoint.is_none());
        assert!(!spec.is_empty());
    }

    #[test]
    fn rejects_unknown_fields() {
        let result: Result<SessionSpec, _> = serde_json::from_str(r#"{"imagee":"typo"}"#);
        assert!(result.is_err());
    }
}
