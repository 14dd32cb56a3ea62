//! Shared test harness: boots the real router on an ephemeral port and
//! points every backend channel at in-process pod stubs.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes128Gcm, Nonce};
use axum::extract::ws::{Message as StubMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get, post};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use sha2::{Digest, Sha256};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;

use lfsx_gateway::config::{Config, DevConfig};
use lfsx_gateway::gateway::guac::{GuacStream, Instruction};
use lfsx_gateway::gateway::VncGateway;
use lfsx_gateway::AppState;

pub const JWT_KEY: &[u8] = b"integration-test-jwt-key";

/// Everything the pod stubs record for assertions.
#[derive(Default)]
pub struct StubState {
    /// Envelopes received on the control socket.
    pub control_envelopes: Mutex<Vec<serde_json::Value>>,
    /// Number of control connections accepted so far.
    pub control_conns: AtomicUsize,
    /// Close the first control connection right after the login reply.
    pub drop_first_control_conn: AtomicBool,
    /// Delay the LfsStartup reply (admission-race tests).
    pub delay_startup_reply: AtomicBool,

    /// `method path` seen by the host API stub.
    pub host_requests: Mutex<Vec<String>>,
    /// Bytes the raw VNC stub received from the gateway.
    pub vnc_received: Mutex<Vec<u8>>,
    /// Instructions the fake guacd received after the handshake.
    pub guacd_received: Mutex<Vec<String>>,
    /// The connect args of the guacd handshake.
    pub guacd_connect_args: Mutex<Vec<String>>,
}

pub struct TestEnv {
    pub addr: SocketAddr,
    pub state: AppState,
    pub stub: Arc<StubState>,
}

/// Boot all stubs plus the gateway itself; returns the gateway address.
pub async fn start_gateway() -> TestEnv {
    let stub = Arc::new(StubState::default());

    let vnc_addr = spawn_vnc_stub(stub.clone()).await;
    let guacd_addr = spawn_guacd_stub(stub.clone()).await;
    let pod_addr = spawn_pod_stub(stub.clone()).await;
    let host_addr = spawn_host_stub(stub.clone()).await;

    let config = Arc::new(Config {
        version: "test".to_string(),
        address: ":0".to_string(),
        production: false,
        lfs_service_endpoint: format!("http://{host_addr}"),
        jwt_key: JWT_KEY.to_vec(),
        jwt_cookie_name: "JWTAuthentication".to_string(),
        lfs_api_port: 4021,
        base_app_name: "lfsx-web".to_string(),
        lfs_image_name: "lfsx-web-lfs:test".to_string(),
        lfs_image_name_file: String::new(),
        dev: DevConfig {
            dev_server: false,
            dev_server_port: 5173,
            vnc_address: vnc_addr.to_string(),
            guacamole_address: guacd_addr.to_string(),
            app_address: pod_addr.to_string(),
            host_address: host_addr.to_string(),
        },
    });

    let gateway = VncGateway::new(config.clone(), None, CancellationToken::new());
    let state = AppState {
        config,
        gateway,
    };

    let app = lfsx_gateway::routes::router(state.clone());
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestEnv { addr, state, stub }
}

// ---------------------------------------------------------------------------
// Token minting (mirrors the upstream auth service)
// ---------------------------------------------------------------------------

fn encrypt_claim(plaintext: &str) -> String {
    let hash = Sha256::digest(JWT_KEY);
    let cipher = Aes128Gcm::new_from_slice(&hash[..16]).unwrap();
    let nonce_bytes = [3u8; 12];
    let nonce = Nonce::from_slice(&nonce_bytes);
    let mut out = nonce_bytes.to_vec();
    out.extend(cipher.encrypt(nonce, plaintext.as_bytes()).unwrap());
    STANDARD.encode(out)
}

/// Mint a token for `db_user` on database `db` (e.g. "lfs").
pub fn mint_token(db_user: &str, db: &str) -> String {
    let exp = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs()
        + 3600;

    let claims = serde_json::json!({
        "sub": db_user,
        "h_d": encrypt_claim(db),
        "h_p": encrypt_claim("secret-password"),
        "h_u": encrypt_claim(db_user),
        "h_ap": encrypt_claim("wp1"),
        "exp": exp,
    });

    jsonwebtoken::encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(JWT_KEY),
    )
    .unwrap()
}

// ---------------------------------------------------------------------------
// Client helpers
// ---------------------------------------------------------------------------

pub type ClientWs = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Open an authenticated WebSocket against the gateway.
pub async fn connect_ws(addr: SocketAddr, path: &str, token: &str) -> ClientWs {
    try_connect_ws(addr, path, token).await.expect("ws connect")
}

pub async fn try_connect_ws(
    addr: SocketAddr,
    path: &str,
    token: &str,
) -> Result<ClientWs, tokio_tungstenite::tungstenite::Error> {
    let mut request = format!("ws://{addr}{path}").into_client_request().unwrap();
    request.headers_mut().insert(
        "Authorization",
        format!("Bearer {token}").parse().unwrap(),
    );
    connect_async(request).await.map(|(ws, _)| ws)
}

pub fn http_client() -> reqwest::Client {
    reqwest::Client::new()
}

/// Poll until `predicate` holds or the deadline passes.
pub async fn wait_for(deadline: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    predicate()
}

// ---------------------------------------------------------------------------
// Raw VNC stub: greets like a VNC server, records every received byte
// ---------------------------------------------------------------------------

async fn spawn_vnc_stub(stub: Arc<StubState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind vnc stub");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut conn, _)) = listener.accept().await else {
                break;
            };
            let stub = stub.clone();
            tokio::spawn(async move {
                let _ = conn.write_all(b"RFB 003.008\n").await;
                let mut buf = [0u8; 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => stub.vnc_received.lock().extend_from_slice(&buf[..n]),
                    }
                }
            });
        }
    });
    addr
}

// ---------------------------------------------------------------------------
// Fake guacd: serves the handshake, pushes two instructions, records input
// ---------------------------------------------------------------------------

async fn spawn_guacd_stub(stub: Arc<StubState>) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind guacd stub");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((conn, _)) = listener.accept().await else {
                break;
            };
            let stub = stub.clone();
            tokio::spawn(async move {
                let timeout = Duration::from_secs(10);
                let mut stream = GuacStream::new(conn);

                let select = stream.read_instruction(timeout).await.unwrap();
                assert_eq!(select.opcode, "select");

                stream
                    .write_instruction(&Instruction::new(
                        "args",
                        vec![
                            "VERSION_1_5_0".to_string(),
                            "hostname".to_string(),
                            "port".to_string(),
                            "color-depth".to_string(),
                        ],
                    ))
                    .await
                    .unwrap();

                for _ in 0..4 {
                    // size, audio, video, image
                    stream.read_instruction(timeout).await.unwrap();
                }
                let connect = stream.read_instruction(timeout).await.unwrap();
                assert_eq!(connect.opcode, "connect");
                *stub.guacd_connect_args.lock() = connect.args.clone();

                stream
                    .write_instruction(&Instruction::new("ready", vec!["$conn".to_string()]))
                    .await
                    .unwrap();

                // One real instruction and one internal one.
                stream
                    .write_instruction(&Instruction::new("sync", vec!["12345678".to_string()]))
                    .await
                    .unwrap();
                stream
                    .write_instruction(&Instruction::new("", vec!["internal".to_string()]))
                    .await
                    .unwrap();

                // Record whatever the gateway forwards from the client.
                let (mut reader, _writer) = stream.split();
                while let Ok(raw) = reader.read_some().await {
                    let text = String::from_utf8_lossy(&raw).into_owned();
                    stub.guacd_received.lock().push(text);
                }
            });
        }
    });
    addr
}

// ---------------------------------------------------------------------------
// Pod stub: the application API and the control WebSocket on one port
// ---------------------------------------------------------------------------

async fn spawn_pod_stub(stub: Arc<StubState>) -> SocketAddr {
    let app = Router::new()
        .route("/kubernetes", get(control_upgrade))
        .route("/{*path}", any(echo_app))
        .with_state(stub);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind pod stub");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn control_upgrade(ws: WebSocketUpgrade, State(stub): State<Arc<StubState>>) -> Response {
    ws.on_upgrade(move |socket| handle_control(socket, stub))
}

async fn handle_control(mut socket: WebSocket, stub: Arc<StubState>) {
    let conn_index = stub.control_conns.fetch_add(1, Ordering::SeqCst);

    while let Some(Ok(msg)) = socket.recv().await {
        let StubMessage::Text(text) = msg else {
            continue;
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap_or_default();
        let is_login = value["messages"][0]["type"] == "LoginRequest";
        stub.control_envelopes.lock().push(value);

        if is_login {
            if stub.delay_startup_reply.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            let reply = serde_json::json!({
                "id": 99,
                "responseTo": 0,
                "messages": [{"type": "LfsStartup"}],
            });
            let _ = socket
                .send(StubMessage::Text(reply.to_string().into()))
                .await;

            if conn_index == 0 && stub.drop_first_control_conn.load(Ordering::SeqCst) {
                // Simulate the LFS.X restarting: drop the socket server-side.
                return;
            }
        }
    }
}

async fn echo_app(headers: HeaderMap, req: axum::extract::Request) -> Response {
    let db = headers
        .get("Db")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();
    format!("app:{} db:{db}", req.uri().path()).into_response()
}

// ---------------------------------------------------------------------------
// Host stub: host API plus the upstream login endpoint
// ---------------------------------------------------------------------------

async fn spawn_host_stub(stub: Arc<StubState>) -> SocketAddr {
    let app = Router::new()
        .route("/user/login", post(upstream_login))
        .route("/{*path}", any(record_host))
        .with_state(stub);

    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind host stub");
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

async fn upstream_login() -> Response {
    (
        [(
            "Set-Cookie",
            "AuthToken=tok123; Expires=Wed, 21 Oct 2026 07:28:00 GMT",
        )],
        "login-ok",
    )
        .into_response()
}

async fn record_host(
    State(stub): State<Arc<StubState>>,
    req: axum::extract::Request,
) -> Response {
    stub.host_requests
        .lock()
        .push(format!("{} {}", req.method(), req.uri().path()));
    "host-ok".into_response()
}
