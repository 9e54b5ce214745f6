use snafu::Snafu;

/// Classified appliance error, produced by inspecting the transport's
/// `RpcCode` and, where that is ambiguous, the error message text.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum ApplianceError {
    #[snafu(display("{} '{}' already exists", kind, name))]
    AlreadyExists { kind: String, name: String },

    #[snafu(display("{} '{}' not found", kind, name))]
    NotFound { kind: String, name: String },

    #[snafu(display("invalid argument: {}", message))]
    InvalidArgument { message: String },

    #[snafu(display("{} '{}' is in use", kind, name))]
    Conflict { kind: String, name: String },

    #[snafu(display("appliance temporarily unavailable: {}", message))]
    Unavailable { message: String },

    #[snafu(display("rejected unknown property key: {}", key))]
    UnknownProperty { key: String },

    #[snafu(display("transport error: {}", source))]
    Transport { source: rpc_transport::TransportError },

    #[snafu(display("appliance error: {}", message))]
    Internal { message: String },
}

pub type Result<T, E = ApplianceError> = std::result::Result<T, E>;

impl From<rpc_transport::TransportError> for ApplianceError {
    fn from(source: rpc_transport::TransportError) -> Self {
        use rpc_transport::{RpcCode, TransportError};
        match &source {
            TransportError::Rpc { code, message } => match code {
                RpcCode::AlreadyExists => ApplianceError::AlreadyExists {
                    kind: "entity".into(),
                    name: message.clone(),
                },
                RpcCode::NotFound => ApplianceError::NotFound {
                    kind: "entity".into(),
                    name: message.clone(),
                },
                RpcCode::InvalidParams => ApplianceError::InvalidArgument {
                    message: message.clone(),
                },
                _ => classify_by_message(message),
            },
            TransportError::HeartbeatTimeout
            | TransportError::Disconnected
            | TransportError::ReconnectExhausted { .. }
            | TransportError::RequestTimeout { .. } => ApplianceError::Unavailable {
                message: source.to_string(),
            },
            _ => ApplianceError::Transport { source },
        }
    }
}

/// Appliance errors that don't carry a clean numeric code fall back to
/// substring matching on the message; anything unrecognized collapses to
/// `Internal` rather than risk a wrong classification.
fn classify_by_message(message: &str) -> ApplianceError {
    let lower = message.to_lowercase();
    if lower.contains("already exists") {
        ApplianceError::AlreadyExists {
            kind: "entity".into(),
            name: message.to_string(),
        }
    } else if lower.contains("not found") || lower.contains("no such") {
        ApplianceError::NotFound {
            kind: "entity".into(),
            name: message.to_string(),
        }
    } else if lower.contains("busy") || lower.contains("in use") || lower.contains("has dependent") {
        ApplianceError::Conflict {
            kind: "entity".into(),
            name: message.to_string(),
        }
    } else if lower.contains("unavailable") || lower.contains("timed out") {
        ApplianceError::Unavailable {
            message: message.to_string(),
        }
    } else {
        ApplianceError::Internal {
            message: message.to_string(),
        }
    }
}
