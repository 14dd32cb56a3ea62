//! The session gateway: admission, pod allocation, channel setup and the
//! per-session lifecycle.

pub mod control;
pub mod events;
pub mod guac;
pub mod httpproxy;
pub mod keepalive;
pub mod peer;
pub mod registry;
pub mod session;
pub mod socket;

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as ClientMessage, WebSocket};
use axum::extract::Request;
use axum::response::Response;
use futures_util::StreamExt;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::error::ApiError;
use crate::kuber::Kuber;
use crate::models::user::User;

use control::ControlPeer;
use events::{WebSocketData, WebSocketMessage, LFS_STARTUP_KEY};
use guac::{GuacConfig, GuacStream};
use httpproxy::PodProxy;
use keepalive::{ClientMgr, KEEP_ALIVE_TIMEOUT};
use registry::SessionRegistry;
use session::{BackendMode, CloseOrigin, Session};
use socket::{OutboundHandle, WsFrame};

/// TCP dial timeout for the raw VNC backend.
const VNC_DIAL_TIMEOUT: Duration = Duration::from_secs(3);
/// How long the login step waits for the LFS.X startup message.
const STARTUP_WAIT: Duration = Duration::from_secs(20);
/// Timeout for HTTP calls to the in-pod host API.
const HOST_API_TIMEOUT: Duration = Duration::from_secs(5);

/// User-provided connection settings.
#[derive(Debug, Clone, Copy)]
pub struct VncSettings {
    /// Scaling factor in percent, 100 = unscaled.
    pub scaling: i32,
}

impl Default for VncSettings {
    fn default() -> Self {
        Self { scaling: 100 }
    }
}

/// Resolved backend endpoints for one session.
#[derive(Debug, Clone)]
pub struct PodTarget {
    /// `host:port` of the framebuffer backend (VNC or guacd).
    pub backend_addr: String,
    pub newly_created: bool,
    /// `http://<pod>:8888`.
    pub app_base: String,
    /// `http://<pod>:<host-port>`.
    pub host_base: String,
    /// `ws://<pod>:8888/kubernetes`.
    pub control_url: String,
}

/// Orchestrates sessions between browser clients and their LFS.X pods.
pub struct VncGateway {
    config: Arc<Config>,
    kuber: Option<Arc<Kuber>>,
    registry: Arc<SessionRegistry>,
    keepalive: Arc<ClientMgr>,
    /// Client for host-API calls (short timeout).
    host_api: reqwest::Client,
    /// Client backing the reverse proxies (streaming, no global timeout).
    proxy_client: reqwest::Client,
    cancel: CancellationToken,
}

impl VncGateway {
    /// Create the gateway and start its keep-alive sweep. All resources stop
    /// when `cancel` fires.
    pub fn new(
        config: Arc<Config>,
        kuber: Option<Arc<Kuber>>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        let keepalive = Arc::new(ClientMgr::new(KEEP_ALIVE_TIMEOUT));
        let sweep = keepalive.clone();
        let sweep_cancel = cancel.clone();
        tokio::spawn(async move { sweep.run(sweep_cancel).await });

        Arc::new(Self {
            config,
            kuber,
            registry: Arc::new(SessionRegistry::new()),
            keepalive,
            host_api: reqwest::Client::builder()
                .timeout(HOST_API_TIMEOUT)
                .build()
                .expect("failed to build host API client"),
            proxy_client: reqwest::Client::new(),
            cancel,
        })
    }

    pub fn is_user_connected(&self, user: &User) -> bool {
        self.registry.contains(&user.identifier())
    }

    /// Validate admission and make sure a pod exists for the user, blocking
    /// until it is ready. Never upgrades a WebSocket.
    pub async fn probe(&self, user: &User, settings: VncSettings) -> Result<(), ApiError> {
        if self.is_user_connected(user) {
            return Err(ApiError::user_already_exists());
        }

        // With a static backend address there is no pod to create.
        if self.config.dev.bypasses_cluster() {
            return Ok(());
        }

        let kuber = self
            .kuber
            .as_ref()
            .ok_or_else(|| ApiError::internal("Failed to create pod"))?;
        let (pod_ip, created) = kuber.pod_for_user(user).await.map_err(|e| {
            tracing::warn!(%e, "failed to create pod");
            ApiError::internal("Failed to create pod")
        })?;

        let host_base = format!("http://{pod_ip}:{}", self.config.lfs_api_port);
        if let Err(e) = self.apply_vnc_settings(settings, &host_base, created).await {
            tracing::warn!(%e, "failed to apply scaling factor");
        }
        Ok(())
    }

    /// Admission check and pod allocation; runs before the client WebSocket
    /// upgrade so admission errors are still plain HTTP responses.
    pub async fn prepare_session(
        &self,
        user: &User,
        use_guacamole: bool,
    ) -> Result<PodTarget, ApiError> {
        if self.is_user_connected(user) {
            return Err(ApiError::user_already_exists());
        }
        self.resolve_target(user, use_guacamole).await
    }

    async fn resolve_target(&self, user: &User, use_guacamole: bool) -> Result<PodTarget, ApiError> {
        let dev = &self.config.dev;
        let dev_backend = if use_guacamole {
            &dev.guacamole_address
        } else {
            &dev.vnc_address
        };

        let (host, backend_addr, newly_created) = if !dev_backend.is_empty() {
            tracing::info!(addr = %dev_backend, "using predefined address instead of pod address");
            let host = dev_backend
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .ok_or_else(|| ApiError::internal("invalid development backend address"))?;
            (host, dev_backend.clone(), true)
        } else {
            let kuber = self
                .kuber
                .as_ref()
                .ok_or_else(|| ApiError::internal("Failed to create pod"))?;
            let (pod_ip, created) = kuber.pod_for_user(user).await.map_err(|e| {
                tracing::warn!(%e, "cannot get IP of pod");
                ApiError::internal("Failed to create pod")
            })?;
            let port = if use_guacamole { 4822 } else { 5910 };
            (pod_ip.clone(), format!("{pod_ip}:{port}"), created)
        };

        let app_authority = if dev.app_address.is_empty() {
            format!("{host}:8888")
        } else {
            dev.app_address.clone()
        };
        let host_authority = if dev.host_address.is_empty() {
            format!("{host}:{}", self.config.lfs_api_port)
        } else {
            dev.host_address.clone()
        };

        Ok(PodTarget {
            backend_addr,
            newly_created,
            app_base: format!("http://{app_authority}"),
            host_base: format!("http://{host_authority}"),
            control_url: format!("ws://{app_authority}/kubernetes"),
        })
    }

    /// Drive one session from the upgraded client WebSocket to teardown.
    pub async fn run_session(
        self: Arc<Self>,
        socket: WebSocket,
        user: User,
        target: PodTarget,
        use_guacamole: bool,
        settings: VncSettings,
        quality: String,
    ) {
        let mode = if use_guacamole {
            BackendMode::Guacamole
        } else {
            BackendMode::Raw
        };

        let (sink, mut stream) = socket.split();
        let client_tx = socket::spawn_client_writer(sink);
        let keepalive_id = self.keepalive.add(client_tx.clone());
        let cancel = self.cancel.child_token();

        // Dial the framebuffer backend.
        let backend = match mode {
            BackendMode::Raw => {
                match tokio::time::timeout(
                    VNC_DIAL_TIMEOUT,
                    TcpStream::connect(&target.backend_addr),
                )
                .await
                {
                    Ok(Ok(conn)) => conn,
                    Ok(Err(e)) => {
                        tracing::warn!(?e, addr = %target.backend_addr, "cannot connect to VNC backend");
                        self.abort_upgrade(client_tx, keepalive_id, "cannot connect to VNC backend");
                        return;
                    }
                    Err(_) => {
                        tracing::warn!(addr = %target.backend_addr, "VNC backend dial timed out");
                        self.abort_upgrade(client_tx, keepalive_id, "cannot connect to VNC backend");
                        return;
                    }
                }
            }
            BackendMode::Guacamole => match TcpStream::connect(&target.backend_addr).await {
                Ok(conn) => conn,
                Err(e) => {
                    tracing::warn!(?e, addr = %target.backend_addr, "cannot connect to guacd");
                    self.abort_upgrade(client_tx, keepalive_id, "cannot connect to guacd");
                    return;
                }
            },
        };

        let session = Session::new(
            user.clone(),
            mode,
            client_tx,
            keepalive_id,
            PodProxy::new(&target.app_base, self.proxy_client.clone()),
            PodProxy::new(&target.host_base, self.proxy_client.clone()),
            cancel.clone(),
            self.registry.clone(),
            self.keepalive.clone(),
        );

        // Scaling may restart the in-pod application; the control dial loop
        // below absorbs the downtime.
        if let Err(e) = self
            .apply_vnc_settings(settings, &target.host_base, target.newly_created)
            .await
        {
            tracing::warn!(%e, "failed to apply scaling factor");
        }

        // Eagerly connect the control channel and log the user in.
        let control = ControlPeer::new(
            &user.username,
            target.control_url.clone(),
            cancel.child_token(),
            self.keepalive.clone(),
        );
        match control.connect().await {
            Ok(()) => {
                session.set_control(control.clone());
                let (observer, mut updates) = control.register_observer();

                control.send_to_pod(&WebSocketData::new(
                    0,
                    vec![WebSocketMessage::login(
                        &user.username,
                        &user.db_password,
                        &user.database_str,
                    )],
                ));

                // Wait until the LFS.X boots up, then proceed regardless.
                tokio::select! {
                    _ = tokio::time::sleep(STARTUP_WAIT) => {
                        tracing::debug!("LFS.X did not boot up within 20 seconds, continuing anyway");
                    }
                    update = updates.recv() => {
                        if let Some(update) = update {
                            if update.message.kind != LFS_STARTUP_KEY {
                                // Harmless: the LFS.X sends nothing before it
                                // finished bootstrapping.
                                tracing::debug!(
                                    kind = %update.message.kind,
                                    "received unexpected message while waiting for startup"
                                );
                            }
                        }
                    }
                }
                control.remove_observer(observer);
            }
            Err(e) => {
                tracing::warn!(
                    %e,
                    "cannot connect to the LFS.X WebSocket, LFS.X specific functions won't be available"
                );
            }
        }

        // Finalize and register; losing an admission race tears down with
        // the winner untouched.
        session.mark_ready();
        if let Err(e) = self.registry.insert(&user.identifier(), session.clone()) {
            session
                .close(Some(e.message.clone()), CloseOrigin::Unknown)
                .await;
            return;
        }

        // Start the backend pumps.
        match mode {
            BackendMode::Raw => {
                let (read, write) = backend.into_split();
                session.set_tcp_writer(write).await;
                peer::spawn_raw_backend_pump(session.clone(), read);
            }
            BackendMode::Guacamole => {
                let mut guac_stream = GuacStream::new(backend);
                match guac_stream
                    .handshake(&GuacConfig::vnc(&quality), KEEP_ALIVE_TIMEOUT)
                    .await
                {
                    Ok(id) => tracing::debug!(connection = %id, "connected to guacd"),
                    Err(e) => {
                        tracing::error!(%e, "failed to create proxy to guacd");
                        session
                            .close(Some(e.to_string()), CloseOrigin::Backend)
                            .await;
                        return;
                    }
                }
                let (reader, writer) = guac_stream.split();
                session.set_guac_writer(writer).await;
                peer::spawn_guac_backend_pump(session.clone(), reader);
            }
        }

        tracing::info!(
            user = %user.username,
            db = user.database.as_str(),
            "opened connection for user"
        );

        // Client read loop; the read deadline doubles as keep-alive check.
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = tokio::time::timeout(KEEP_ALIVE_TIMEOUT, stream.next()) => frame,
            };
            match frame {
                Err(_) => {
                    session
                        .close(Some("read deadline exceeded".to_string()), CloseOrigin::Client)
                        .await;
                    break;
                }
                Ok(Some(Ok(ClientMessage::Binary(data)))) => {
                    session.forward_client_frame(&data).await;
                }
                Ok(Some(Ok(ClientMessage::Text(text)))) => {
                    session.forward_client_frame(text.as_bytes()).await;
                }
                Ok(Some(Ok(ClientMessage::Close(_)))) | Ok(None) => {
                    tracing::debug!("client closed connection for VNC");
                    session.close(None, CloseOrigin::Client).await;
                    break;
                }
                Ok(Some(Err(e))) => {
                    session
                        .close(Some(e.to_string()), CloseOrigin::Client)
                        .await;
                    break;
                }
                Ok(Some(Ok(_))) => continue,
            }
        }
    }

    /// Dispatch a request through the session's application-API proxy.
    /// An explicit `Db` header must agree with the session's database.
    pub async fn proxy_app_request(
        &self,
        user: &User,
        path_and_query: &str,
        req: Request,
    ) -> Result<Response, ApiError> {
        let session = self
            .registry
            .get(&user.identifier())
            .ok_or_else(ApiError::not_connected)?;

        if let Some(requested) = req.headers().get("Db").and_then(|v| v.to_str().ok()) {
            if !requested.is_empty() && !requested.eq_ignore_ascii_case(&session.user.database_str)
            {
                return Err(ApiError::database_mismatch());
            }
        }

        Ok(session.app_proxy.forward(path_and_query, req).await)
    }

    /// Dispatch a request through the session's host-API proxy.
    pub async fn proxy_host_request(
        &self,
        user: &User,
        path_and_query: &str,
        req: Request,
    ) -> Result<Response, ApiError> {
        let session = self
            .registry
            .get(&user.identifier())
            .ok_or_else(ApiError::not_connected)?;
        Ok(session.host_proxy.forward(path_and_query, req).await)
    }

    /// The control peer for the user's session, for the `/app/ws` upgrade.
    pub fn control_peer(&self, user: &User) -> Result<Arc<ControlPeer>, ApiError> {
        let session = self
            .registry
            .get(&user.identifier())
            .ok_or_else(ApiError::no_vnc_connection)?;
        if !session.is_ready() {
            return Err(ApiError::no_vnc_connection());
        }
        session.control().ok_or_else(ApiError::no_vnc_connection)
    }

    /// Apply the scaling factor by calling the hard-scaling endpoint of the
    /// pod host. 207 means partial success and is accepted; the LFS.X may
    /// restart as a consequence.
    async fn apply_vnc_settings(
        &self,
        settings: VncSettings,
        host_base: &str,
        newly_created: bool,
    ) -> Result<(), String> {
        if !newly_created || settings.scaling == 100 || settings.scaling == 0 {
            return Ok(());
        }

        let url = format!("{host_base}/api/vnc/scale/hard");
        let resp = self
            .host_api
            .post(&url)
            .json(&serde_json::json!({ "factor": settings.scaling }))
            .send()
            .await
            .map_err(|e| format!("request to LFS.X host: {e}"))?;

        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        if status == 200 || status == 207 {
            tracing::debug!(%body, "result from applying host scaling factor");
            Ok(())
        } else {
            Err(format!("{status}: {body}"))
        }
    }

    /// Tear down a half-open upgrade when the backend cannot be reached.
    fn abort_upgrade(&self, client_tx: OutboundHandle, keepalive_id: u64, reason: &str) {
        let _ = client_tx.send(WsFrame::Close(1008, reason.to_string()));
        self.keepalive.remove(keepalive_id);
    }

    #[doc(hidden)]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }
}
