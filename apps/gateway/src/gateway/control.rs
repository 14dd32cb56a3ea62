//! Control-channel peer: the JSON WebSocket bridged between the client and
//! the pod, with observer fan-out and automatic reconnect.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use futures_util::stream::SplitStream;
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as PodMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use super::events::{Update, WebSocketData};
use super::keepalive::{ClientMgr, KEEP_ALIVE_TIMEOUT};
use super::session::CloseOrigin;
use super::socket::{self, OutboundHandle, WsFrame};

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const DIAL_RETRY_DELAY: Duration = Duration::from_secs(2);
/// 13 attempts every 2 s give the LFS.X up to ~26 s to boot.
const DIAL_ATTEMPTS: u32 = 13;
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

struct Side {
    tx: OutboundHandle,
    keepalive: u64,
}

/// WebSocket proxy peer between the control endpoint a client opens on the
/// gateway and the LFS.X control socket on the pod.
///
/// The pod side is dialed eagerly during session creation; the client side
/// is attached later when the user upgrades the control endpoint.
pub struct ControlPeer {
    /// User name, for logs only.
    username: String,
    /// `ws://<pod>/kubernetes`.
    url: String,

    client: RwLock<Option<Side>>,
    pod: RwLock<Option<Side>>,

    observers: RwLock<Vec<(u64, mpsc::UnboundedSender<Update>)>>,
    next_observer: AtomicU64,

    /// Set once the client side is attached.
    ready: AtomicBool,
    /// Suppresses reconnection after a local teardown.
    intentionally_closed: AtomicBool,

    cancel: CancellationToken,
    keepalive: Arc<ClientMgr>,
}

impl ControlPeer {
    pub fn new(
        username: &str,
        url: String,
        cancel: CancellationToken,
        keepalive: Arc<ClientMgr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            username: username.to_string(),
            url,
            client: RwLock::new(None),
            pod: RwLock::new(None),
            observers: RwLock::new(Vec::new()),
            next_observer: AtomicU64::new(1),
            ready: AtomicBool::new(false),
            intentionally_closed: AtomicBool::new(false),
            cancel,
            keepalive,
        })
    }

    /// Dial the pod's control socket, retrying while the LFS.X boots.
    pub async fn connect(self: &Arc<Self>) -> Result<(), String> {
        for _ in 0..DIAL_ATTEMPTS {
            if self.cancel.is_cancelled() {
                return Err("context canceled".to_string());
            }

            match tokio::time::timeout(DIAL_TIMEOUT, connect_async(self.url.as_str())).await {
                Ok(Ok((stream, _))) => {
                    let (sink, read) = stream.split();
                    let tx = socket::spawn_pod_writer(sink);
                    let keepalive = self.keepalive.add(tx.clone());
                    *self.pod.write() = Some(Side { tx, keepalive });
                    tokio::spawn(pod_read_loop(self.clone(), read, keepalive));
                    tracing::debug!(user = %self.username, "connected to the LFS.X control socket");
                    return Ok(());
                }
                Ok(Err(e)) => {
                    tracing::trace!(?e, "failed to connect to the LFS.X, trying again in 2 seconds");
                }
                Err(_) => {
                    tracing::trace!("control dial timed out, trying again in 2 seconds");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(DIAL_RETRY_DELAY) => {}
                _ = self.cancel.cancelled() => return Err("context canceled".to_string()),
            }
        }
        Err("unable to connect to WebSocket".to_string())
    }

    /// Attach the client side and pump it until it closes. Runs inside the
    /// upgrade future of the control endpoint.
    pub async fn attach_client(self: Arc<Self>, socket: WebSocket) {
        let (sink, mut stream) = socket.split();
        let tx = socket::spawn_client_writer(sink);
        let keepalive = self.keepalive.add(tx.clone());
        *self.client.write() = Some(Side { tx, keepalive });
        self.ready.store(true, Ordering::SeqCst);

        loop {
            let frame = tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = tokio::time::timeout(KEEP_ALIVE_TIMEOUT, stream.next()) => frame,
            };
            match frame {
                Err(_) => {
                    tracing::debug!(user = %self.username, "control client read deadline exceeded");
                    break;
                }
                Ok(Some(Ok(ClientMessage::Text(text)))) => self.on_client_message(text.as_str()),
                Ok(Some(Ok(ClientMessage::Close(_)))) | Ok(None) => break,
                Ok(Some(Err(e))) => {
                    tracing::debug!(?e, "control client read error");
                    break;
                }
                Ok(Some(Ok(_))) => continue,
            }
        }

        self.keepalive.remove(keepalive);
        *self.client.write() = None;
        tracing::debug!(user = %self.username, "closed control WebSocket connection (client)");
    }

    /// Subscribe to all messages crossing this peer.
    pub fn register_observer(&self) -> (u64, mpsc::UnboundedReceiver<Update>) {
        let id = self.next_observer.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.observers.write().push((id, tx));
        (id, rx)
    }

    /// Unsubscribe; dropping the sender closes the observer's channel.
    pub fn remove_observer(&self, id: u64) {
        self.observers.write().retain(|(oid, _)| *oid != id);
    }

    /// Send an envelope to the LFS.X.
    pub fn send_to_pod(&self, data: &WebSocketData) {
        if self.intentionally_closed.load(Ordering::SeqCst) || self.cancel.is_cancelled() {
            tracing::debug!("not sending control message, the connection is already closed");
            return;
        }
        match self.pod.read().as_ref() {
            Some(pod) => {
                let _ = pod.tx.send(WsFrame::Text(data.to_json()));
            }
            None => tracing::debug!("not sending control message, no pod connection"),
        }
    }

    /// Idempotent teardown. Locks are taken client side first, pod side
    /// second; `close` is the only place both are held at once.
    pub fn close(&self, err: Option<String>, from: CloseOrigin) {
        let mut client = self.client.write();
        let mut pod = self.pod.write();

        if self.intentionally_closed.swap(true, Ordering::SeqCst) || self.cancel.is_cancelled() {
            tracing::debug!("control peer was already closed, not closing again");
            return;
        }

        if let Some(side) = client.take() {
            if from != CloseOrigin::Client {
                let frame = match &err {
                    Some(reason) => WsFrame::Close(1008, reason.clone()),
                    None => WsFrame::Close(1000, String::new()),
                };
                let _ = side.tx.send(frame);
            }
            self.keepalive.remove(side.keepalive);
        }

        if let Some(side) = pod.take() {
            if from != CloseOrigin::Backend {
                // Closed without notifying the pod's higher layer.
                let _ = side.tx.send(WsFrame::Close(1000, String::new()));
            }
            self.keepalive.remove(side.keepalive);
        }

        self.cancel.cancel();
    }

    fn on_pod_message(&self, raw: &str) {
        tracing::debug!(user = %self.username, "received control message from the LFS.X");
        let data: WebSocketData = match serde_json::from_str(raw) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(?e, "failed to parse control message from the LFS.X");
                return;
            }
        };
        self.notify_observers(true, &data);

        if !self.ready.load(Ordering::SeqCst) {
            return;
        }
        if let Some(client) = self.client.read().as_ref() {
            let _ = client.tx.send(WsFrame::Text(raw.to_string()));
        }
    }

    fn on_client_message(&self, raw: &str) {
        tracing::debug!(user = %self.username, "received control message from the client");
        let data: WebSocketData = match serde_json::from_str(raw) {
            Ok(data) => data,
            Err(e) => {
                tracing::warn!(?e, "failed to parse control message from the client");
                return;
            }
        };
        self.notify_observers(false, &data);

        if let Some(pod) = self.pod.read().as_ref() {
            let _ = pod.tx.send(WsFrame::Text(raw.to_string()));
        }
    }

    /// One update per inner message, delivered independently per observer.
    /// Sends never block the read loop.
    fn notify_observers(&self, from_backend: bool, data: &WebSocketData) {
        let observers = self.observers.read();
        for (_, tx) in observers.iter() {
            for message in &data.messages {
                let _ = tx.send(Update {
                    message: message.clone(),
                    id: data.id,
                    response_to: data.response_to,
                    from_backend,
                });
            }
        }
    }

    /// Schedule a reconnect unless this peer was intentionally closed.
    fn try_reconnect(self: &Arc<Self>) {
        if self.intentionally_closed.load(Ordering::SeqCst) {
            tracing::debug!("control socket was intentionally closed, not reconnecting");
            return;
        }
        if self.cancel.is_cancelled() {
            return;
        }
        tracing::debug!(user = %self.username, "trying to reconnect to the LFS.X in 5 seconds");

        let peer = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    _ = peer.cancel.cancelled() => {
                        tracing::debug!("not rescheduling reconnect, context was canceled");
                        return;
                    }
                }
                match peer.connect().await {
                    Ok(()) => return,
                    Err(e) => {
                        tracing::debug!(%e, "failed to reconnect to the LFS.X control socket");
                        if peer.cancel.is_cancelled()
                            || peer.intentionally_closed.load(Ordering::SeqCst)
                        {
                            return;
                        }
                    }
                }
            }
        });
    }
}

async fn pod_read_loop(
    peer: Arc<ControlPeer>,
    mut stream: SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>,
    keepalive_id: u64,
) {
    loop {
        let frame = tokio::select! {
            _ = peer.cancel.cancelled() => break,
            frame = tokio::time::timeout(KEEP_ALIVE_TIMEOUT, stream.next()) => frame,
        };
        match frame {
            Err(_) => {
                tracing::debug!(user = %peer.username, "pod control read deadline exceeded");
                break;
            }
            Ok(Some(Ok(PodMessage::Text(text)))) => peer.on_pod_message(text.as_str()),
            Ok(Some(Ok(PodMessage::Close(_)))) | Ok(None) => break,
            Ok(Some(Err(e))) => {
                tracing::debug!(?e, "pod control read error");
                break;
            }
            Ok(Some(Ok(_))) => continue,
        }
    }

    tracing::debug!(user = %peer.username, "closed control WebSocket connection to the LFS.X");
    peer.keepalive.remove(keepalive_id);
    *peer.pod.write() = None;
    peer.try_reconnect();
}
