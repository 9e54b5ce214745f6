//! `driver` binary: CSI Unix-socket server plus the auxiliary loopback
//! gRPC server used by backup tooling.

use std::fs;
use std::io::ErrorKind;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use appliance_api::ApplianceApi;
use clap::Parser;
use futures_util::TryStreamExt;
use rpc_transport::Transport;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UnixListener;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::{server::Connected, Server};
use tracing::{error, info};

mod config;
mod controller;
mod dev;
mod error;
mod findmnt;
mod format;
mod freeze;
mod identity;
mod match_dev;
mod mount;
mod node;
mod proto;
mod session;
mod shutdown_event;

use config::Cli;
use controller::Controller;
use identity::Identity;
use node::Node;
use proto::{controller_server::ControllerServer, identity_server::IdentityServer, node_server::NodeServer};
use proto::node_plugin::node_plugin_server::NodePluginServer;

#[derive(Clone, Debug)]
pub struct UdsConnectInfo {
    pub peer_addr: Option<Arc<tokio::net::unix::SocketAddr>>,
    pub peer_cred: Option<tokio::net::unix::UCred>,
}

#[derive(Debug)]
struct UnixStream(tokio::net::UnixStream);

impl Connected for UnixStream {
    type ConnectInfo = UdsConnectInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        UdsConnectInfo {
            peer_addr: self.0.peer_addr().ok().map(Arc::new),
            peer_cred: self.0.peer_cred().ok(),
        }
    }
}

impl AsyncRead for UnixStream {
    fn poll_read(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl AsyncWrite for UnixStream {
    fn poll_write(mut self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

fn remove_stale_socket(path: &std::path::Path) -> Result<(), String> {
    match fs::remove_file(path) {
        Ok(()) => {
            info!(path = %path.display(), "removed stale CSI socket");
            Ok(())
        }
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(format!("error removing stale CSI socket {}: {}", path.display(), err)),
    }
}

#[tokio::main]
async fn main() -> Result<(), String> {
    let cli = Cli::parse();
    let config = config::init(&cli);

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::new(&config.log_level))
        .init();

    // TLS verification for the appliance connection is configured on the
    // URL scheme itself (wss vs ws); `appliance_tls_insecure` is read by
    // operators wiring up the connection, not by this driver.
    let url = config
        .appliance_url
        .parse()
        .map_err(|err| format!("invalid --appliance-url: {}", err))?;
    let transport = Transport::connect(url, config.appliance_api_key.clone());
    let appliance = ApplianceApi::new(transport.clone(), "csi-appliance-driver");

    remove_stale_socket(&config.csi_endpoint)?;

    let csi = async {
        let uds = UnixListener::bind(&config.csi_endpoint)
            .map_err(|err| format!("failed to bind {}: {}", config.csi_endpoint.display(), err))?;
        info!(path = %config.csi_endpoint.display(), "CSI plugin listening");

        let incoming = UnixListenerStream::new(uds).map_ok(UnixStream);

        Server::builder()
            .add_service(IdentityServer::new(Identity { transport: transport.clone() }))
            .add_service(ControllerServer::new(Controller::new(appliance.clone())))
            .add_service(NodeServer::new(
                Node::new(config.node_name.clone(), config.max_volumes_per_node).await,
            ))
            .serve_with_incoming_shutdown(incoming, shutdown_event::wait())
            .await
            .map_err(|err| {
                error!(error = %err, "CSI server failed");
                err.to_string()
            })
    };

    let auxiliary = async {
        let addr = config
            .grpc_endpoint
            .parse()
            .map_err(|err| format!("invalid --grpc-endpoint: {}", err))?;
        info!(%addr, "auxiliary node-plugin server listening");

        Server::builder()
            .add_service(NodePluginServer::new(freeze::NodePluginSvc::default()))
            .serve_with_shutdown(addr, shutdown_event::wait())
            .await
            .map_err(|err| {
                error!(error = %err, "auxiliary gRPC server failed");
                err.to_string()
            })
    };

    let (csi_result, auxiliary_result) = tokio::join!(csi, auxiliary);
    csi_result?;
    auxiliary_result?;
    Ok(())
}
