//! Control bridge command handlers
//!
//! Requests arrive as JSON objects tagged by `op`. Each one is routed to a
//! handler in [`download`] or [`system`], and the outcome is wrapped in a
//! [`ControlResponse`]. Errors become `success: false` responses rather than
//! failing the bridge.

pub mod download;
pub mod system;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::models::JobSpec;
use crate::core::runtime::DownloadRuntimeHandle;

pub use download::*;
pub use system::*;

/// Operations accepted by the bridge
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ControlRequest {
    Probe {
        url: String,
        #[serde(default)]
        limit: Option<usize>,
    },
    Submit(JobSpec),
    Pause {
        id: String,
    },
    Resume {
        id: String,
    },
    Cancel {
        id: String,
    },
    Status,
    RemoveFromHistory {
        id: String,
    },
    ListHistory,
    Redownload {
        id: String,
    },
    ToolInfo,
    Sweep,
}

/// One request line: an operation plus an optional correlation id
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct BridgeRequest {
    #[serde(default)]
    pub request_id: Option<Value>,
    #[serde(flatten)]
    pub request: ControlRequest,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename = "response")]
pub struct ControlResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<Value>,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ControlResponse {
    pub fn error(request_id: Option<Value>, message: impl Into<String>) -> Self {
        Self {
            request_id,
            success: false,
            data: None,
            error: Some(message.into()),
        }
    }

    fn from_result<T: Serialize>(request_id: Option<Value>, result: Result<T, String>) -> Self {
        match result.and_then(|v| serde_json::to_value(v).map_err(|e| e.to_string())) {
            Ok(data) => Self {
                request_id,
                success: true,
                data: Some(data),
                error: None,
            },
            Err(message) => Self::error(request_id, message),
        }
    }
}

/// Parse one request line
pub fn parse_request(line: &str) -> Result<BridgeRequest, String> {
    serde_json::from_str(line).map_err(|e| format!("Invalid request: {}", e))
}

/// Route a request to its handler
pub async fn dispatch(handle: &DownloadRuntimeHandle, bridge: BridgeRequest) -> ControlResponse {
    let BridgeRequest {
        request_id,
        request,
    } = bridge;
    tracing::debug!("Bridge request: {:?}", request);

    match request {
        ControlRequest::Probe { url, limit } => {
            ControlResponse::from_result(request_id, probe_url(handle, url, limit).await)
        }
        ControlRequest::Submit(spec) => {
            ControlResponse::from_result(request_id, submit_download(handle, spec).await)
        }
        ControlRequest::Pause { id } => {
            ControlResponse::from_result(request_id, pause_download(handle, id).await)
        }
        ControlRequest::Resume { id } => {
            ControlResponse::from_result(request_id, resume_download(handle, id).await)
        }
        ControlRequest::Cancel { id } => {
            ControlResponse::from_result(request_id, cancel_download(handle, id).await)
        }
        ControlRequest::Status => {
            ControlResponse::from_result(request_id, get_queue_status(handle).await)
        }
        ControlRequest::RemoveFromHistory { id } => {
            ControlResponse::from_result(request_id, remove_from_history(handle, id).await)
        }
        ControlRequest::ListHistory => {
            ControlResponse::from_result(request_id, get_history(handle).await)
        }
        ControlRequest::Redownload { id } => {
            ControlResponse::from_result(request_id, redownload(handle, id).await)
        }
        ControlRequest::ToolInfo => ControlResponse::from_result(request_id, check_tool(handle).await),
        ControlRequest::Sweep => {
            ControlResponse::from_result(request_id, sweep_history(handle).await)
        }
    }
}
