//! Wire record shapes for the appliance's JSON-RPC-2.0-shaped framing,
//! carried one-object-per-text-frame over the WebSocket-like channel.

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const JSONRPC_VERSION: &str = "2.0";

#[derive(Debug, Serialize)]
pub struct Request {
    pub jsonrpc: &'static str,
    pub id: Value,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl Request {
    pub fn new(id: Value, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION,
            id,
            method: method.into(),
            params,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// An incoming frame is either a response keyed to one of our request ids, or
/// an unsolicited notification (auth confirmation, job progress, ping/pong).
#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum Frame {
    Response {
        #[serde(default)]
        jsonrpc: Option<String>,
        id: Value,
        #[serde(default)]
        result: Option<Value>,
        #[serde(default)]
        error: Option<RpcError>,
    },
    Notification {
        #[serde(default)]
        jsonrpc: Option<String>,
        method: String,
        #[serde(default)]
        params: Option<Value>,
    },
}

pub const METHOD_AUTH: &str = "auth.login";
pub const METHOD_AUTH_CONFIRM: &str = "auth.confirmed";
pub const METHOD_PING: &str = "core.ping";
pub const METHOD_JOB_PROGRESS: &str = "core.job_progress";
pub const METHOD_JOB_CANCEL: &str = "core.job_cancel";

#[derive(Debug, Deserialize)]
pub struct JobProgress {
    pub job_id: u64,
    pub state: JobState,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Running,
    Success,
    Failure,
}
