//! Generated CSI message and service types.

tonic::include_proto!("csi.v1");

/// Generated types for the auxiliary node-plugin surface (`freeze.rs`).
pub(crate) mod node_plugin {
    tonic::include_proto!("nodeplugin.v1");
}
