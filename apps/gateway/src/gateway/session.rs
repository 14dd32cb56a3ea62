//! Per-session shared state and the close discipline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use crate::models::user::User;

use super::control::ControlPeer;
use super::guac::{GuacWriter, INTERNAL_OPCODE_PREFIX};
use super::httpproxy::PodProxy;
use super::keepalive::ClientMgr;
use super::registry::SessionRegistry;
use super::socket::{OutboundHandle, WsFrame};

/// Upper bound a close waits for session setup to finish, so a teardown
/// never races the backend handshake.
pub const READY_WAIT_BOUND: Duration = Duration::from_secs(20);

/// How the framebuffer bytes are carried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendMode {
    /// Untransformed VNC bytes as binary frames.
    Raw,
    /// Guacamole instructions as text frames.
    Guacamole,
}

/// Which side triggered a close. The originator's half is not closed again.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseOrigin {
    Unknown,
    Client,
    Backend,
}

/// One logical gateway session: the client WebSocket, the backend tunnel,
/// the optional control peer and the two reverse proxies.
pub struct Session {
    pub user: User,
    pub mode: BackendMode,

    /// Write handle of the client WebSocket.
    client: OutboundHandle,
    client_keepalive: u64,

    /// Write half of the raw VNC connection (RAW mode).
    tcp: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    /// Write half of the guacd connection (GUAC mode).
    guac: tokio::sync::Mutex<Option<GuacWriter<TcpStream>>>,

    control: RwLock<Option<Arc<ControlPeer>>>,

    pub app_proxy: PodProxy,
    pub host_proxy: PodProxy,

    ready: AtomicBool,
    ready_notify: Notify,
    closed: AtomicBool,

    cancel: CancellationToken,
    registry: Arc<SessionRegistry>,
    keepalive: Arc<ClientMgr>,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user: User,
        mode: BackendMode,
        client: OutboundHandle,
        client_keepalive: u64,
        app_proxy: PodProxy,
        host_proxy: PodProxy,
        cancel: CancellationToken,
        registry: Arc<SessionRegistry>,
        keepalive: Arc<ClientMgr>,
    ) -> Arc<Self> {
        Arc::new(Self {
            user,
            mode,
            client,
            client_keepalive,
            tcp: tokio::sync::Mutex::new(None),
            guac: tokio::sync::Mutex::new(None),
            control: RwLock::new(None),
            app_proxy,
            host_proxy,
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
            closed: AtomicBool::new(false),
            cancel,
            registry,
            keepalive,
        })
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Latch the session ready once all child connections are established.
    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
        self.ready_notify.notify_waiters();
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub async fn set_tcp_writer(&self, writer: OwnedWriteHalf) {
        *self.tcp.lock().await = Some(writer);
    }

    pub async fn set_guac_writer(&self, writer: GuacWriter<TcpStream>) {
        *self.guac.lock().await = Some(writer);
    }

    pub fn set_control(&self, control: Arc<ControlPeer>) {
        *self.control.write() = Some(control);
    }

    pub fn control(&self) -> Option<Arc<ControlPeer>> {
        self.control.read().clone()
    }

    /// Queue a frame for the client WebSocket. Fails when the writer is gone.
    pub fn send_to_client(&self, frame: WsFrame) -> Result<(), ()> {
        self.client.send(frame).map_err(|_| ())
    }

    /// Forward one client frame to the backend: verbatim in RAW mode, with
    /// internal instructions dropped in GUAC mode.
    pub async fn forward_client_frame(&self, data: &[u8]) {
        if !self.is_ready() {
            return;
        }

        match self.mode {
            BackendMode::Raw => {
                if let Some(tcp) = self.tcp.lock().await.as_mut() {
                    if let Err(e) = tcp.write_all(data).await {
                        tracing::warn!(
                            ?e,
                            user = %self.user.username,
                            "failed to write to the VNC backend"
                        );
                    }
                }
            }
            BackendMode::Guacamole => {
                if data.starts_with(INTERNAL_OPCODE_PREFIX) {
                    // Internal instructions are never sent to guacd.
                    return;
                }
                if let Some(guac) = self.guac.lock().await.as_mut() {
                    if let Err(e) = guac.write_raw(data).await {
                        tracing::debug!(?e, "failed writing message to guacd");
                    }
                }
            }
        }
    }

    /// Idempotent teardown. The first caller wins; `from` names the side
    /// whose socket is already gone.
    pub async fn close(self: &Arc<Self>, err: Option<String>, from: CloseOrigin) {
        if self.closed.swap(true, Ordering::SeqCst) {
            tracing::debug!("session was already closed, not closing again");
            return;
        }
        tracing::debug!(?from, reason = ?err, user = %self.user.username, "closing session");

        // A disconnect right after admission must not tear the backend down
        // mid-handshake; wait until setup latched ready.
        if !self.is_ready()
            && tokio::time::timeout(READY_WAIT_BOUND, self.wait_ready())
                .await
                .is_err()
        {
            tracing::error!(
                user = %self.user.username,
                "connection setup did not finish before close"
            );
        }

        if let Some(control) = self.control.read().clone() {
            // The origin is not passed down: the control peer's partner did
            // not actually close, only ours did.
            control.close(err.clone(), CloseOrigin::Unknown);
        }

        if from != CloseOrigin::Client {
            let frame = match &err {
                Some(reason) => WsFrame::Close(1008, reason.clone()),
                None => WsFrame::Close(1000, String::new()),
            };
            let _ = self.client.send(frame);
        }

        if from != CloseOrigin::Backend {
            self.tcp.lock().await.take();
            self.guac.lock().await.take();
        }

        self.cancel.cancel();
        self.keepalive.remove(self.client_keepalive);
        self.registry.remove(&self.user.identifier(), self);
        tracing::info!(
            user = %self.user.username,
            db = self.user.database.as_str(),
            "closed connection"
        );
    }

    async fn wait_ready(&self) {
        loop {
            if self.is_ready() {
                return;
            }
            let notified = self.ready_notify.notified();
            if self.is_ready() {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub fn stub(db_user: &str) -> Arc<Self> {
        use crate::models::user::Database;

        let (client, _rx) = tokio::sync::mpsc::unbounded_channel();
        let http = reqwest::Client::new();
        Session::new(
            User {
                username: db_user.to_string(),
                db_user: db_user.to_string(),
                db_password: String::new(),
                database: Database::Lfs,
                database_str: "lfs".to_string(),
                workplace: String::new(),
                expiration: 0,
            },
            BackendMode::Raw,
            client,
            0,
            PodProxy::new("http://127.0.0.1:8888", http.clone()),
            PodProxy::new("http://127.0.0.1:4021", http),
            CancellationToken::new(),
            Arc::new(SessionRegistry::new()),
            Arc::new(ClientMgr::new(super::keepalive::KEEP_ALIVE_TIMEOUT)),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn close_is_idempotent() {
        let session = Session::stub("alice");
        session.mark_ready();

        session.close(Some("first".to_string()), CloseOrigin::Unknown).await;
        assert!(session.is_closed());
        // A second close is a no-op and must not panic or send again.
        session.close(Some("second".to_string()), CloseOrigin::Client).await;
    }

    #[tokio::test]
    async fn close_sends_1008_with_reason_to_the_client() {
        let (client, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let http = reqwest::Client::new();
        let session = Session::new(
            crate::models::user::User {
                username: "alice".to_string(),
                db_user: "alice".to_string(),
                db_password: String::new(),
                database: crate::models::user::Database::Lfs,
                database_str: "lfs".to_string(),
                workplace: String::new(),
                expiration: 0,
            },
            BackendMode::Raw,
            client,
            0,
            PodProxy::new("http://127.0.0.1:8888", http.clone()),
            PodProxy::new("http://127.0.0.1:4021", http),
            CancellationToken::new(),
            Arc::new(SessionRegistry::new()),
            Arc::new(ClientMgr::new(super::super::keepalive::KEEP_ALIVE_TIMEOUT)),
        );
        session.mark_ready();

        session
            .close(Some("USER_ALREADY_EXISTS".to_string()), CloseOrigin::Unknown)
            .await;

        match rx.recv().await {
            Some(WsFrame::Close(code, reason)) => {
                assert_eq!(code, 1008);
                assert_eq!(reason, "USER_ALREADY_EXISTS");
            }
            other => panic!("expected close frame, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_from_client_does_not_write_to_the_client() {
        let (client, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let http = reqwest::Client::new();
        let session = Session::new(
            crate::models::user::User {
                username: "alice".to_string(),
                db_user: "alice".to_string(),
                db_password: String::new(),
                database: crate::models::user::Database::Lfs,
                database_str: "lfs".to_string(),
                workplace: String::new(),
                expiration: 0,
            },
            BackendMode::Raw,
            client,
            0,
            PodProxy::new("http://127.0.0.1:8888", http.clone()),
            PodProxy::new("http://127.0.0.1:4021", http),
            CancellationToken::new(),
            Arc::new(SessionRegistry::new()),
            Arc::new(ClientMgr::new(super::super::keepalive::KEEP_ALIVE_TIMEOUT)),
        );
        session.mark_ready();

        session.close(None, CloseOrigin::Client).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn close_cancels_the_session_context() {
        let session = Session::stub("alice");
        session.mark_ready();
        let token = session.cancel_token().clone();

        session.close(None, CloseOrigin::Unknown).await;
        assert!(token.is_cancelled());
    }

    #[tokio::test]
    async fn frames_before_ready_are_dropped() {
        let session = Session::stub("alice");
        // No tcp writer attached and not ready: must be a silent no-op.
        session.forward_client_frame(b"abc").await;
    }
}
