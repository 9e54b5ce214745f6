//! Client for the appliance's JSON-RPC-shaped control channel.
//!
//! The channel is a persistent, full-duplex, WebSocket-like connection that
//! the appliance may drop at any time; [`Transport`] hides reconnection,
//! heartbeating and request/response correlation behind a handle that is
//! cheap to clone and safe to share across the volume controller and node
//! publisher.

mod error;
mod transport;
mod wire;

pub use error::{RpcCode, Result, TransportError};
pub use transport::{ConnectionState, Transport};
pub use wire::{JobProgress, JobState};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rpc_code_classifies_enoent_and_eexist() {
        assert_eq!(RpcCode::from(-2), RpcCode::NotFound);
        assert_eq!(RpcCode::from(-17), RpcCode::AlreadyExists);
        assert_eq!(RpcCode::from(-32602), RpcCode::InvalidParams);
        assert_eq!(RpcCode::from(-1), RpcCode::Other(-1));
    }
}
