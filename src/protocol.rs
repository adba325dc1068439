//! Boundary message contract
//!
//! Requests travel to the authoritative side as [`Request`] values and come
//! back wrapped in an [`Envelope`]. The transport that carries them is up to
//! the host; see [`crate::messaging::Transport`].

use crate::error::{Result, SyncError};
use crate::record::{ItemState, Record};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A request to the authoritative side
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum Request {
    /// Readiness probe
    Health,
    /// Fetch records for many ids at once
    GetMany { ids: Vec<String> },
    /// Change the state of one item
    SetState {
        id: String,
        state: ItemState,
        #[serde(default)]
        title: String,
    },
    /// One page of stored records, newest first
    GetPage(PageRequest),
    /// Record counts per state
    Stats,
    /// Drop every stored record
    Clear,
}

impl Request {
    /// Short name used in logs and error-log contexts
    pub fn name(&self) -> &'static str {
        match self {
            Request::Health => "health",
            Request::GetMany { .. } => "get_many",
            Request::SetState { .. } => "set_state",
            Request::GetPage(_) => "get_page",
            Request::Stats => "stats",
            Request::Clear => "clear",
        }
    }
}

/// Response envelope: `{ ok, result?, error? }`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Envelope {
    /// Wrap a successful result
    pub fn success<T: Serialize>(result: &T) -> Result<Self> {
        Ok(Self {
            ok: true,
            result: Some(serde_json::to_value(result)?),
            error: None,
        })
    }

    /// Wrap a failure message
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            ok: false,
            result: None,
            error: Some(error.into()),
        }
    }

    /// Decode the result payload
    pub fn decode<T: DeserializeOwned>(self) -> Result<T> {
        if !self.ok {
            return Err(SyncError::Rejected(
                self.error.unwrap_or_else(|| "request failed".to_string()),
            ));
        }
        let value = self.result.unwrap_or(serde_json::Value::Null);
        serde_json::from_value(value).map_err(|e| SyncError::Protocol(e.to_string()))
    }
}

/// Health check response
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthResponse {
    pub ready: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Get-many response; ids without a record are missing from the map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GetManyResponse {
    pub records: HashMap<String, Record>,
}

/// Set-state response; `record` is `None` when the new state is normal
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStateResponse {
    pub record: Option<Record>,
}

/// Pagination request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageRequest {
    pub limit: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cursor: Option<String>,
}

/// One page of records ordered by `updatedAt` descending
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Page {
    pub items: Vec<Record>,
    pub has_more: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_cursor: Option<String>,
}

/// Record counts in the persistent store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct StoreStats {
    pub total: usize,
    pub hidden: usize,
    pub dimmed: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_format() {
        let request = Request::GetMany {
            ids: vec!["a".into(), "b".into()],
        };
        assert_eq!(
            serde_json::to_value(&request).unwrap(),
            json!({"type": "get_many", "payload": {"ids": ["a", "b"]}})
        );
        assert_eq!(
            serde_json::to_value(Request::Health).unwrap(),
            json!({"type": "health"})
        );
        assert_eq!(request.name(), "get_many");
    }

    #[test]
    fn test_envelope_decode() {
        let envelope = Envelope::success(&HealthResponse {
            ready: true,
            error: None,
        })
        .unwrap();
        let health: HealthResponse = envelope.decode().unwrap();
        assert!(health.ready);
    }

    #[test]
    fn test_failed_envelope_is_rejected() {
        let result: Result<HealthResponse> = Envelope::failure("Network error").decode();
        assert_eq!(result, Err(SyncError::Rejected("Network error".to_string())));
    }

    #[test]
    fn test_malformed_result_is_protocol_error() {
        let envelope = Envelope {
            ok: true,
            result: Some(json!({"unexpected": 1})),
            error: None,
        };
        let result: Result<GetManyResponse> = envelope.decode();
        assert!(matches!(result, Err(SyncError::Protocol(_))));
    }

    #[test]
    fn test_page_wire_format() {
        let page = Page {
            items: vec![],
            has_more: true,
            next_cursor: Some("c".into()),
        };
        let value = serde_json::to_value(&page).unwrap();
        assert_eq!(value["hasMore"], true);
        assert_eq!(value["nextCursor"], "c");
    }
}
