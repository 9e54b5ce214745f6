//! Shutdown signal plumbing shared by the CSI and auxiliary gRPC servers.

use std::future::Future;
use std::sync::{Arc, Mutex};

use once_cell::sync::Lazy;
use tokio::signal::unix::SignalKind;
use tokio::sync::oneshot;

/// Returns a future that completes when a shutdown event has been received.
/// Shutdown events: INT|TERM.
pub async fn wait() {
    let _ = Shutdown::wait().await;
}

type ShutdownSync = Arc<Mutex<Shutdown>>;

/// Shutdown event handler.
struct Shutdown {
    /// Listeners awaiting the shutdown.
    listeners: Vec<oneshot::Sender<SignalKind>>,
    /// Whether we've already received the shutdown signal and which signal
    /// triggered it.
    shutdown: Option<SignalKind>,
}

impl Shutdown {
    /// Get a sync wrapper of `Self`. The internal task to listen on the
    /// shutdown event is scheduled.
    fn new_sync(event: impl ShutdownEvent + 'static) -> ShutdownSync {
        let this = Arc::new(Mutex::new(Self::new()));
        let this_clone = this.clone();
        tokio::spawn(async move { Self::run(this_clone, event).await });
        this
    }

    fn new() -> Self {
        Shutdown {
            listeners: Vec::new(),
            shutdown: None,
        }
    }

    /// Get a shutdown channel to await on, or the signal that already
    /// triggered shutdown.
    fn shutdown_chan(&mut self) -> Result<oneshot::Receiver<SignalKind>, SignalKind> {
        if let Some(event) = self.shutdown {
            Err(event)
        } else {
            let (send, receive) = oneshot::channel();
            self.listeners.push(send);
            Ok(receive)
        }
    }

    /// Run the main waiting loop that waits for the reception of SIGINT or
    /// SIGTERM. When either is received the listeners are notified.
    async fn run(this: ShutdownSync, event: impl ShutdownEvent) {
        let kind = event.wait().await;

        let mut this = this.lock().expect("not poisoned");
        this.shutdown = Some(kind);

        for sender in std::mem::take(&mut this.listeners) {
            sender.send(kind).ok();
        }
    }

    /// Returns a future that completes when a shutdown event has been
    /// received, yielding the signal that triggered it.
    fn wait() -> impl Future<Output = Option<SignalKind>> {
        Self::wait_int_term()
    }

    fn wait_int_term() -> impl Future<Output = Option<SignalKind>> {
        static TERM: Lazy<ShutdownSync> = Lazy::new(|| Shutdown::new_sync(IntTermEvent {}));
        let chan = TERM.lock().expect("not poisoned").shutdown_chan();
        async move {
            match chan {
                Ok(wait) => wait.await.ok(),
                Err(signal) => Some(signal),
            }
        }
    }
}

/// Internal shutdown event which reports which signal triggered it.
#[async_trait::async_trait]
trait ShutdownEvent: Send + Sync {
    async fn wait(&self) -> SignalKind;
}

/// Shutdown event fired when INT or TERM is received.
struct IntTermEvent {}

#[async_trait::async_trait]
impl ShutdownEvent for IntTermEvent {
    async fn wait(&self) -> SignalKind {
        let mut sig_int = tokio::signal::unix::signal(SignalKind::interrupt()).expect("to register SIGINT");
        let mut sig_term = tokio::signal::unix::signal(SignalKind::terminate()).expect("to register SIGTERM");

        tokio::select! {
            _ = sig_int.recv() => {
                tracing::warn!(signal = ?SignalKind::interrupt(), "signalled");
                SignalKind::interrupt()
            },
            _ = sig_term.recv() => {
                tracing::warn!(signal = ?SignalKind::terminate(), "signalled");
                SignalKind::terminate()
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use tonic::transport::{Server, Uri};
    use tonic::{Code, Request, Response, Status};

    use crate::proto::node_plugin::node_plugin_client::NodePluginClient;
    use crate::proto::node_plugin::node_plugin_server::{NodePlugin, NodePluginServer};
    use crate::proto::node_plugin::{
        FindVolumeReply, FindVolumeRequest, FreezeFsReply, FreezeFsRequest, UnfreezeFsReply, UnfreezeFsRequest,
    };

    #[derive(Debug, Default)]
    struct SlowNodePluginSvc {
        first_call: Arc<Mutex<Option<tokio::sync::oneshot::Sender<()>>>>,
    }

    impl SlowNodePluginSvc {
        fn new(chan: tokio::sync::oneshot::Sender<()>) -> Self {
            Self {
                first_call: Arc::new(Mutex::new(Some(chan))),
            }
        }
    }

    #[tonic::async_trait]
    impl NodePlugin for SlowNodePluginSvc {
        async fn freeze_fs(&self, _request: Request<FreezeFsRequest>) -> Result<Response<FreezeFsReply>, Status> {
            unimplemented!()
        }

        async fn unfreeze_fs(&self, _request: Request<UnfreezeFsRequest>) -> Result<Response<UnfreezeFsReply>, Status> {
            unimplemented!()
        }

        async fn find_volume(&self, _request: Request<FindVolumeRequest>) -> Result<Response<FindVolumeReply>, Status> {
            {
                let mut inner = self.first_call.lock().unwrap();
                let sender = inner.take().expect("only the first call should get through");
                sender.send(()).unwrap();
            }
            tokio::time::sleep(Duration::from_secs(2)).await;
            Ok(Response::new(FindVolumeReply {
                filesystem_type: "ext4".to_string(),
            }))
        }
    }

    /// A shutdown event is issued after a "long" request starts being
    /// processed. That request should complete even though it takes longer,
    /// but any new requests arriving after shutdown should be rejected.
    #[tokio::test]
    async fn shutdown() {
        async fn wait(wait: tokio::sync::oneshot::Receiver<()>) {
            wait.await.unwrap();
        }
        let (first_sender, first_receiver) = tokio::sync::oneshot::channel();
        let (shutdown_sender, shutdown_receiver) = tokio::sync::oneshot::channel();

        tokio::spawn(async move {
            if let Err(err) = Server::builder()
                .add_service(NodePluginServer::new(SlowNodePluginSvc::new(first_sender)))
                .serve_with_shutdown("0.0.0.0:50011".parse().unwrap(), wait(shutdown_receiver))
                .await
            {
                panic!("gRPC server failed with error: {}", err);
            }
        });
        tokio::time::sleep(Duration::from_millis(250)).await;
        let channel = tonic::transport::Endpoint::from(Uri::from_str("https://0.0.0.0:50011").unwrap())
            .connect()
            .await
            .unwrap();
        let mut cli = NodePluginClient::new(channel);

        let mut cli_first = cli.clone();
        let first_request = tokio::spawn(async move {
            cli_first
                .find_volume(FindVolumeRequest {
                    volume_id: "".to_string(),
                })
                .await
        });
        first_receiver.await.unwrap();

        shutdown_sender.send(()).unwrap();
        tokio::time::sleep(Duration::from_millis(250)).await;

        let second_response = cli
            .find_volume(FindVolumeRequest {
                volume_id: "".to_string(),
            })
            .await;
        assert_eq!(second_response.unwrap_err().code(), Code::Unknown);

        let first_request_resp = first_request.await.unwrap();
        assert_eq!(
            first_request_resp.unwrap().into_inner().filesystem_type,
            "ext4".to_string()
        );
    }
}
