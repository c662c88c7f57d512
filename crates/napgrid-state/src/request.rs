//! Captured asynchronous invocation, as stored in a function queue.
//!
//! The body is `None` for methods that carry no body (GET, HEAD, DELETE,
//! TRACE) and `Some` otherwise, including `Some(vec![])` for an empty
//! POST. On the wire a missing body is omitted and a present one is
//! base64, so the distinction survives a round trip.

use serde::{Deserialize, Serialize};

use crate::error::{StateError, StateResult};

/// One request header with all of its values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CustomHeader {
    pub key: String,
    pub values: Vec<String>,
}

/// A serializable HTTP call waiting to be dispatched to a function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomRequest {
    pub headers: Vec<CustomHeader>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "base64_body")]
    pub body: Option<Vec<u8>>,
    pub function_name: String,
    /// Sub-path below `/async-function/<name>`, e.g. `/compute`.
    pub path: String,
    pub method: String,
    /// Raw query string including the leading `?`, or empty.
    pub query: String,
}

impl CustomRequest {
    /// Whether a request with this method has its body captured.
    pub fn method_carries_body(method: &str) -> bool {
        !["GET", "HEAD", "DELETE", "TRACE"]
            .iter()
            .any(|m| m.eq_ignore_ascii_case(method))
    }

    pub fn to_json(&self) -> StateResult<String> {
        serde_json::to_string(self).map_err(|e| StateError::Serialize(e.to_string()))
    }

    pub fn from_json(json: &str) -> StateResult<Self> {
        serde_json::from_str(json).map_err(|e| StateError::Deserialize(e.to_string()))
    }
}

mod base64_body {
    use base64::Engine;
    use base64::engine::general_purpose::STANDARD;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(body: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match body {
            Some(bytes) => serializer.serialize_str(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
