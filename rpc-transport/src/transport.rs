//! Persistent, reconnecting, multiplexed client for the appliance control
//! channel.
//!
//! A single background task owns the socket. Callers never touch it
//! directly: `Transport::call` enqueues a request, registers a oneshot
//! waiter keyed by request id in the pending table, and awaits the reply.
//! A second task sends heartbeat pings and declares the connection broken
//! if too many go unanswered, which drives the reconnect loop.

use crate::error::{self, Result, RpcCode, TransportError};
use crate::wire::{Frame, JobProgress, JobState, Request, METHOD_JOB_CANCEL, METHOD_PING};
use futures_util::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use snafu::{OptionExt, ResultExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, Mutex, RwLock};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use url::Url;

const PING_INTERVAL: Duration = Duration::from_secs(30);
const PONG_DEADLINE_MULTIPLIER: u32 = 4;
const MAX_MISSED_PONGS: u32 = 3;
const RECONNECT_BACKOFF_FLOOR: Duration = Duration::from_secs(5);
const RECONNECT_BACKOFF_CEILING: Duration = Duration::from_secs(60);
const MAX_RECONNECT_ATTEMPTS_PER_OUTAGE: u32 = 5;

type PendingTable = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Value>>>>>;
type JobTable = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<JobProgress>>>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Ready,
    Degraded,
    Closed,
}

struct Shared {
    state: RwLock<ConnectionState>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Message>>>,
}

/// Cancels its job on the appliance if dropped while still armed. Disarmed
/// once `call_long_running` observes the job's terminal notification, so the
/// ordinary completion path never sends a spurious cancel.
struct JobGuard {
    transport: Transport,
    job_id: u64,
    armed: bool,
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let transport = self.transport.clone();
        let job_id = self.job_id;
        tokio::spawn(async move {
            transport.jobs.lock().await.remove(&job_id);
            warn!(job_id, "long-running job abandoned by caller, cancelling");
            transport.cancel_job(job_id).await;
        });
    }
}

/// Handle to the appliance's control channel. Cheap to clone; all clones
/// share the same background connection.
#[derive(Clone)]
pub struct Transport {
    url: Url,
    api_key: String,
    next_id: Arc<AtomicU64>,
    pending: PendingTable,
    jobs: JobTable,
    shared: Arc<Shared>,
}

impl Transport {
    /// Spawns the background connection task and returns immediately; the
    /// first `call` blocks until the initial handshake completes or fails.
    pub fn connect(url: Url, api_key: impl Into<String>) -> Self {
        let transport = Transport {
            url,
            api_key: api_key.into(),
            next_id: Arc::new(AtomicU64::new(1)),
            pending: Arc::new(Mutex::new(HashMap::new())),
            jobs: Arc::new(Mutex::new(HashMap::new())),
            shared: Arc::new(Shared {
                state: RwLock::new(ConnectionState::Connecting),
                outbound: Mutex::new(None),
            }),
        };
        tokio::spawn(transport.clone().run());
        transport
    }

    pub async fn state(&self) -> ConnectionState {
        *self.shared.state.read().await
    }

    /// Sends a request and waits for its matching response.
    pub async fn call<T: DeserializeOwned>(&self, method: &str, params: Option<Value>) -> Result<T> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if let Err(e) = self.send(id, method, params).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        let value = rx.await.map_err(|_| TransportError::Disconnected)??;
        serde_json::from_value(value).context(error::DecodeSnafu)
    }

    /// Long-running operations return a `job_id` immediately; this awaits
    /// its terminal notification instead of a direct RPC reply. If the
    /// caller drops this future early (a `tokio::time::timeout` firing, or
    /// a `select!` picking a different branch), `JobGuard` cancels the job
    /// on the appliance instead of leaving it running unattended.
    pub async fn call_long_running<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T> {
        let job_id: u64 = self.call(method, params).await?;
        let (tx, mut rx) = mpsc::unbounded_channel();
        self.jobs.lock().await.insert(job_id, tx);
        let mut guard = JobGuard { transport: self.clone(), job_id, armed: true };

        let result = loop {
            match rx.recv().await {
                Some(progress) if progress.state == JobState::Running => continue,
                Some(progress) if progress.state == JobState::Success => {
                    break progress.result.context(error::MalformedResponseSnafu {
                        id: job_id.to_string(),
                    });
                }
                Some(progress) => {
                    break Err(TransportError::Rpc {
                        code: RpcCode::InternalError,
                        message: progress.error.unwrap_or_else(|| "job failed".into()),
                    });
                }
                None => break Err(TransportError::Disconnected),
            }
        };
        guard.armed = false;
        self.jobs.lock().await.remove(&job_id);
        let value = result?;
        serde_json::from_value(value).context(error::DecodeSnafu)
    }

    /// Best-effort: tells the appliance to cancel a job we're no longer
    /// waiting on. Never surfaces an error to the caller.
    pub async fn cancel_job(&self, job_id: u64) {
        let params = serde_json::json!({ "job_id": job_id });
        let _: Result<Value> = self.call(METHOD_JOB_CANCEL, Some(params)).await;
    }

    async fn send(&self, id: u64, method: &str, params: Option<Value>) -> Result<()> {
        let request = Request::new(Value::from(id), method, params);
        let text = serde_json::to_string(&request).context(error::EncodeSnafu)?;
        let outbound = self.shared.outbound.lock().await;
        match outbound.as_ref() {
            Some(tx) => tx
                .send(Message::Text(text))
                .map_err(|_| TransportError::Disconnected),
            None => Err(TransportError::Disconnected),
        }
    }

    async fn run(self) {
        let mut attempt: u32 = 0;
        loop {
            *self.shared.state.write().await = ConnectionState::Connecting;
            match self.connect_once().await {
                Ok(()) => attempt = 0,
                Err(e) => warn!(error = %e, "appliance connection ended"),
            }

            *self.shared.outbound.lock().await = None;
            self.fail_all_pending(TransportError::Disconnected).await;

            attempt += 1;
            if attempt > MAX_RECONNECT_ATTEMPTS_PER_OUTAGE {
                *self.shared.state.write().await = ConnectionState::Closed;
                warn!(attempts = attempt, "giving up reconnecting to appliance");
                return;
            }
            *self.shared.state.write().await = ConnectionState::Degraded;
            let backoff = std::cmp::min(
                RECONNECT_BACKOFF_FLOOR.saturating_mul(1 << (attempt - 1).min(5)),
                RECONNECT_BACKOFF_CEILING,
            );
            debug!(?backoff, attempt, "reconnecting to appliance after backoff");
            tokio::time::sleep(backoff).await;
        }
    }

    async fn connect_once(&self) -> Result<()> {
        let (ws, _resp) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .context(error::ConnectSnafu {
                url: self.url.to_string(),
            })?;
        let (mut write, mut read) = ws.split();

        let auth_id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let auth = Request::new(
            Value::from(auth_id),
            crate::wire::METHOD_AUTH,
            Some(serde_json::json!({ "api_key": self.api_key })),
        );
        let text = serde_json::to_string(&auth).context(error::EncodeSnafu)?;
        write
            .send(Message::Text(text))
            .await
            .context(error::SocketSnafu)?;

        let confirmed = loop {
            match read.next().await {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<Frame>(&text) {
                        Ok(Frame::Response { id, error: Some(e), .. }) if id == Value::from(auth_id) => {
                            return Err(TransportError::Handshake {
                                url: self.url.to_string(),
                                reason: e.message,
                            });
                        }
                        Ok(Frame::Response { id, .. }) if id == Value::from(auth_id) => break true,
                        Ok(Frame::Notification { method, .. })
                            if method == crate::wire::METHOD_AUTH_CONFIRM =>
                        {
                            break true
                        }
                        _ => continue,
                    }
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Socket { source: e }),
                None => {
                    return Err(TransportError::Handshake {
                        url: self.url.to_string(),
                        reason: "connection closed during handshake".into(),
                    })
                }
            }
        };
        if !confirmed {
            return Err(TransportError::Handshake {
                url: self.url.to_string(),
                reason: "no confirmation from appliance".into(),
            });
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        *self.shared.outbound.lock().await = Some(out_tx.clone());
        *self.shared.state.write().await = ConnectionState::Ready;
        info!(url = %self.url, "connected to appliance");

        let last_pong = Arc::new(Mutex::new(Instant::now()));
        let missed = Arc::new(AtomicU64::new(0));

        let writer = {
            let last_pong = last_pong.clone();
            async move {
                loop {
                    tokio::select! {
                        msg = out_rx.recv() => {
                            match msg {
                                Some(m) => {
                                    if write.send(m).await.is_err() {
                                        return;
                                    }
                                }
                                None => return,
                            }
                        }
                        _ = tokio::time::sleep(PING_INTERVAL) => {
                            let elapsed = last_pong.lock().await.elapsed();
                            if elapsed > PING_INTERVAL * PONG_DEADLINE_MULTIPLIER {
                                return;
                            }
                            if write.send(Message::Ping(vec![])).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            }
        };

        let reader = self.clone().read_loop(read, out_tx, last_pong.clone(), missed.clone());

        tokio::select! {
            _ = writer => {}
            result = reader => { result?; }
        }
        Ok(())
    }

    async fn read_loop(
        self,
        mut read: futures_util::stream::SplitStream<
            tokio_tungstenite::WebSocketStream<
                tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
            >,
        >,
        out_tx: mpsc::UnboundedSender<Message>,
        last_pong: Arc<Mutex<Instant>>,
        missed: Arc<AtomicU64>,
    ) -> Result<()> {
        loop {
            match read.next().await {
                Some(Ok(Message::Pong(_))) => {
                    *last_pong.lock().await = Instant::now();
                    missed.store(0, Ordering::Relaxed);
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = out_tx.send(Message::Pong(payload));
                }
                Some(Ok(Message::Text(text))) => {
                    self.dispatch(&text).await;
                }
                Some(Ok(Message::Close(_))) | None => return Err(TransportError::Disconnected),
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(TransportError::Socket { source: e }),
            }
        }
    }

    async fn dispatch(&self, text: &str) {
        let frame = match serde_json::from_str::<Frame>(text) {
            Ok(f) => f,
            Err(e) => {
                debug!(error = %e, "dropping malformed frame from appliance");
                return;
            }
        };
        match frame {
            Frame::Response { id, result, error, .. } => {
                let id = match id.as_u64() {
                    Some(id) => id,
                    None => return,
                };
                if let Some(tx) = self.pending.lock().await.remove(&id) {
                    let outcome = match error {
                        Some(e) => Err(TransportError::Rpc {
                            code: RpcCode::from(e.code),
                            message: e.message,
                        }),
                        None => Ok(result.unwrap_or(Value::Null)),
                    };
                    let _ = tx.send(outcome);
                }
            }
            Frame::Notification { method, params } if method == METHOD_PING => {
                let _ = params;
            }
            Frame::Notification { method, params } if method == crate::wire::METHOD_JOB_PROGRESS => {
                if let Some(params) = params {
                    if let Ok(progress) = serde_json::from_value::<JobProgress>(params) {
                        if let Some(tx) = self.jobs.lock().await.get(&progress.job_id) {
                            let _ = tx.send(progress);
                        }
                    }
                }
            }
            Frame::Notification { .. } => {}
        }
    }

    async fn fail_all_pending(&self, err: TransportError) {
        let mut pending = self.pending.lock().await;
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(match &err {
                TransportError::Disconnected => TransportError::Disconnected,
                other => TransportError::Rpc {
                    code: RpcCode::InternalError,
                    message: other.to_string(),
                },
            }));
        }
    }
}
