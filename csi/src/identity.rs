//! CSI Identity service: plugin metadata and liveness.

use tonic::{Code, Request, Response, Status};
use tracing::debug;

use rpc_transport::{ConnectionState, Transport};

use crate::proto::*;

const PLUGIN_NAME: &str = "io.csi-appliance.driver";
const PLUGIN_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Clone)]
pub(crate) struct Identity {
    pub(crate) transport: Transport,
}

#[tonic::async_trait]
impl identity_server::Identity for Identity {
    async fn get_plugin_info(
        &self,
        _request: Request<GetPluginInfoRequest>,
    ) -> Result<Response<GetPluginInfoResponse>, Status> {
        debug!("GetPluginInfo request ({}:{})", PLUGIN_NAME, PLUGIN_VERSION);

        Ok(Response::new(GetPluginInfoResponse {
            name: PLUGIN_NAME.to_owned(),
            vendor_version: PLUGIN_VERSION.to_owned(),
            manifest: Default::default(),
        }))
    }

    async fn get_plugin_capabilities(
        &self,
        _request: Request<GetPluginCapabilitiesRequest>,
    ) -> Result<Response<GetPluginCapabilitiesResponse>, Status> {
        let caps = vec![
            plugin_capability::service::Type::ControllerService,
            plugin_capability::service::Type::VolumeAccessibilityConstraints,
        ];

        let mut capabilities: Vec<PluginCapability> = caps
            .into_iter()
            .map(|c| PluginCapability {
                r#type: Some(plugin_capability::Type::Service(plugin_capability::Service { r#type: c as i32 })),
            })
            .collect();

        capabilities.push(PluginCapability {
            r#type: Some(plugin_capability::Type::VolumeExpansion(plugin_capability::VolumeExpansion {
                r#type: plugin_capability::volume_expansion::Type::Online as i32,
            })),
        });

        debug!(?capabilities, "GetPluginCapabilities request");

        Ok(Response::new(GetPluginCapabilitiesResponse { capabilities }))
    }

    async fn probe(&self, _request: Request<ProbeRequest>) -> Result<Response<ProbeResponse>, Status> {
        match self.transport.state().await {
            ConnectionState::Ready => Ok(Response::new(ProbeResponse { ready: true })),
            ConnectionState::Degraded => Ok(Response::new(ProbeResponse { ready: true })),
            ConnectionState::Connecting => Ok(Response::new(ProbeResponse { ready: false })),
            ConnectionState::Closed => Err(Status::new(Code::Unavailable, "appliance connection is closed")),
        }
    }
}
