//! Transport-level error enum. Deliberately has no notion of `tonic::Status`:
//! that conversion happens once, at the CSI adapter boundary, not here.

use snafu::Snafu;

/// Classification of a JSON-RPC numeric error code into a shape callers can
/// match on without re-parsing integers.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum RpcCode {
    ParseError,
    InvalidRequest,
    MethodNotFound,
    InvalidParams,
    InternalError,
    NotFound,
    AlreadyExists,
    Other(i32),
}

impl From<i32> for RpcCode {
    fn from(code: i32) -> Self {
        const ENOENT: i32 = 2;
        const EEXIST: i32 = 17;
        match code {
            -32700 => RpcCode::ParseError,
            -32600 => RpcCode::InvalidRequest,
            -32601 => RpcCode::MethodNotFound,
            -32602 => RpcCode::InvalidParams,
            -32603 => RpcCode::InternalError,
            c if c == -ENOENT => RpcCode::NotFound,
            c if c == -EEXIST => RpcCode::AlreadyExists,
            other => RpcCode::Other(other),
        }
    }
}

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum TransportError {
    #[snafu(display("failed to connect to {}: {}", url, source))]
    Connect {
        url: String,
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[snafu(display("handshake with appliance at {} failed: {}", url, reason))]
    Handshake { url: String, reason: String },

    #[snafu(display("websocket error: {}", source))]
    Socket {
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[snafu(display("failed to encode request: {}", source))]
    Encode { source: serde_json::Error },

    #[snafu(display("failed to decode frame: {}", source))]
    Decode { source: serde_json::Error },

    #[snafu(display("appliance returned malformed response (id {})", id))]
    MalformedResponse { id: String },

    #[snafu(display("appliance rejected request: {:?}: {}", code, message))]
    Rpc { code: RpcCode, message: String },

    #[snafu(display("no heartbeat from appliance within deadline"))]
    HeartbeatTimeout,

    #[snafu(display("connection closed while request was in flight"))]
    Disconnected,

    #[snafu(display("reconnection attempts exhausted after {} tries", attempts))]
    ReconnectExhausted { attempts: u32 },

    #[snafu(display("request cancelled"))]
    Cancelled,

    #[snafu(display("request timed out after {:?}", elapsed))]
    RequestTimeout { elapsed: std::time::Duration },
}

pub type Result<T, E = TransportError> = std::result::Result<T, E>;
