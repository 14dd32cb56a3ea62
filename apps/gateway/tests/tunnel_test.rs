mod common;

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

/// Happy path: the VNC greeting reaches the client untouched and client
/// bytes reach the TCP backend as the same concatenation.
#[tokio::test]
async fn raw_session_tunnels_bytes_both_ways() {
    let env = common::start_gateway().await;
    let token = common::mint_token("alice", "lfs");

    let mut ws = common::connect_ws(env.addr, "/api/vnc/ws", &token).await;

    // The backend greeting is the first binary frame.
    let greeting = loop {
        match ws.next().await.expect("frame").expect("frame ok") {
            Message::Binary(data) => break data,
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame before greeting: {other:?}"),
        }
    };
    assert_eq!(&greeting[..], b"RFB 003.008\n");

    // Client bytes arrive verbatim on the TCP side.
    ws.send(Message::Binary(vec![0x41, 0x42, 0x43].into()))
        .await
        .unwrap();
    ws.send(Message::Binary(vec![0x44].into())).await.unwrap();

    let stub = env.stub.clone();
    assert!(
        common::wait_for(Duration::from_secs(5), move || {
            *stub.vnc_received.lock() == b"ABCD".to_vec()
        })
        .await,
        "backend did not receive the client bytes"
    );

    // The in-band login was sent over the control channel.
    let logins = env.stub.control_envelopes.lock();
    let login = logins
        .iter()
        .find(|e| e["messages"][0]["type"] == "LoginRequest")
        .expect("login envelope");
    assert_eq!(login["messages"][0]["loginRequest"]["username"], "alice");
    assert_eq!(login["messages"][0]["loginRequest"]["db"], "lfs");
}

/// Byte transparency holds for larger transfers split across many frames.
#[tokio::test]
async fn raw_session_preserves_large_payloads() {
    let env = common::start_gateway().await;
    let token = common::mint_token("ivan", "lfs");

    let mut ws = common::connect_ws(env.addr, "/api/vnc/ws", &token).await;
    // Drain the greeting first.
    loop {
        match ws.next().await.expect("frame").expect("frame ok") {
            Message::Binary(_) => break,
            _ => continue,
        }
    }

    let payload: Vec<u8> = (0..256 * 1024).map(|i| (i % 251) as u8).collect();
    for chunk in payload.chunks(4096) {
        ws.send(Message::Binary(chunk.to_vec().into())).await.unwrap();
    }

    let stub = env.stub.clone();
    let expected = payload.clone();
    assert!(
        common::wait_for(Duration::from_secs(10), move || {
            *stub.vnc_received.lock() == expected
        })
        .await,
        "backend did not receive the full payload in order"
    );
}

/// Two concurrent sessions for the same identifier: exactly one wins, the
/// loser is told USER_ALREADY_EXISTS over a 1008 close frame, and the
/// registry returns to its previous size after the winner closes.
#[tokio::test]
async fn duplicate_session_is_refused() {
    let env = common::start_gateway().await;
    env.stub
        .delay_startup_reply
        .store(true, std::sync::atomic::Ordering::SeqCst);
    let token = common::mint_token("bob", "lfs");

    let ws_a = common::connect_ws(env.addr, "/api/vnc/ws", &token).await;
    let ws_b = common::connect_ws(env.addr, "/api/vnc/ws", &token).await;

    let mut winners = 0;
    let mut losers = 0;
    for mut ws in [ws_a, ws_b] {
        loop {
            match tokio::time::timeout(Duration::from_secs(10), ws.next())
                .await
                .expect("frame before timeout")
            {
                Some(Ok(Message::Binary(data))) => {
                    assert_eq!(&data[..], b"RFB 003.008\n");
                    winners += 1;
                    break;
                }
                Some(Ok(Message::Close(Some(frame)))) => {
                    assert_eq!(u16::from(frame.code), 1008);
                    assert!(frame.reason.contains("USER_ALREADY_EXISTS"));
                    losers += 1;
                    break;
                }
                Some(Ok(_)) => continue,
                other => panic!("unexpected ws result: {other:?}"),
            }
        }
    }
    assert_eq!((winners, losers), (1, 1));

    // A session is registered for bob; once it closes, the slot frees up.
    let registry = env.state.gateway.registry().clone();
    assert_eq!(registry.len(), 1);
}

/// A third connect attempt while a session is open is refused with 409
/// before any upgrade happens.
#[tokio::test]
async fn existing_session_rejects_new_upgrade_with_409() {
    let env = common::start_gateway().await;
    let token = common::mint_token("carol", "lfs");

    let mut ws = common::connect_ws(env.addr, "/api/vnc/ws", &token).await;
    // Wait until the session is fully registered.
    let registry = env.state.gateway.registry().clone();
    let reg = registry.clone();
    assert!(common::wait_for(Duration::from_secs(5), move || reg.len() == 1).await);

    match common::try_connect_ws(env.addr, "/api/vnc/ws", &token).await {
        Err(tokio_tungstenite::tungstenite::Error::Http(response)) => {
            assert_eq!(response.status(), 409);
        }
        other => panic!("expected HTTP 409, got {other:?}"),
    }

    // Closing the first session frees the identifier again.
    ws.close(None).await.unwrap();
    assert!(common::wait_for(Duration::from_secs(5), move || registry.is_empty()).await);
}

/// An explicit Db header must agree with the session database.
#[tokio::test]
async fn app_proxy_rejects_database_mismatch() {
    let env = common::start_gateway().await;
    let token = common::mint_token("dave", "lfs");

    let _ws = common::connect_ws(env.addr, "/api/vnc/ws", &token).await;
    let registry = env.state.gateway.registry().clone();
    let reg = registry.clone();
    assert!(common::wait_for(Duration::from_secs(5), move || reg.len() == 1).await);

    let client = common::http_client();

    let mismatch = client
        .get(format!("http://{}/api/app/x", env.addr))
        .bearer_auth(&token)
        .header("Db", "PRJ")
        .send()
        .await
        .unwrap();
    assert_eq!(mismatch.status(), 409);

    let matching = client
        .get(format!("http://{}/api/app/x", env.addr))
        .bearer_auth(&token)
        .header("Db", "LFS")
        .send()
        .await
        .unwrap();
    assert_eq!(matching.status(), 200);
    let body = matching.text().await.unwrap();
    // `/api/app` is stripped before dispatch.
    assert!(body.starts_with("app:/x"), "unexpected body {body:?}");
}

/// Proxy dispatch without an open session is a 421.
#[tokio::test]
async fn app_proxy_without_session_is_misdirected() {
    let env = common::start_gateway().await;
    let token = common::mint_token("erin", "lfs");

    let resp = common::http_client()
        .get(format!("http://{}/api/app/x", env.addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 421);
}

#[tokio::test]
async fn connected_reports_session_state() {
    let env = common::start_gateway().await;
    let token = common::mint_token("frank", "lfs");
    let client = common::http_client();
    let url = format!("http://{}/api/connected", env.addr);

    let before: serde_json::Value = client
        .get(&url)
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(before["status"], "disconnected");

    let _ws = common::connect_ws(env.addr, "/api/vnc/ws", &token).await;
    let registry = env.state.gateway.registry().clone();
    assert!(common::wait_for(Duration::from_secs(5), move || registry.len() == 1).await);

    let after: serde_json::Value = client
        .get(&url)
        .bearer_auth(&token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(after["status"], "connected");
}

/// Logout clears the cookie and results in a stop call on the host API.
#[tokio::test]
async fn logout_clears_cookie_and_stops_the_pod() {
    let env = common::start_gateway().await;
    let token = common::mint_token("grace", "lfs");

    let _ws = common::connect_ws(env.addr, "/api/vnc/ws", &token).await;
    let registry = env.state.gateway.registry().clone();
    assert!(common::wait_for(Duration::from_secs(5), move || registry.len() == 1).await);

    let resp = common::http_client()
        .post(format!("http://{}/api/logout", env.addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let cookie = resp
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .expect("set-cookie header");
    assert!(cookie.starts_with("JWTAuthentication="));
    assert!(cookie.contains("Max-Age=0"));
    assert!(cookie.contains("Path=/"));

    let stub = env.stub.clone();
    assert!(
        common::wait_for(Duration::from_secs(5), move || {
            stub.host_requests
                .lock()
                .iter()
                .any(|r| r == "POST /api/stop")
        })
        .await,
        "host API did not receive the stop request"
    );
}

/// Login relays the upstream response and re-issues the cookie under the
/// gateway's name with hardened attributes.
#[tokio::test]
async fn login_captures_and_renames_the_upstream_cookie() {
    let env = common::start_gateway().await;

    let resp = common::http_client()
        .post(format!("http://{}/api/login", env.addr))
        .form(&[("username", "alice"), ("password", "pw"), ("db", "lfs")])
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);

    let cookie = resp
        .headers()
        .get("set-cookie")
        .and_then(|v| v.to_str().ok())
        .expect("set-cookie header");
    assert!(cookie.starts_with("JWTAuthentication=tok123"));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Strict"));
    assert!(cookie.contains("Expires=Wed, 21 Oct 2026 07:28:00 GMT"));

    assert_eq!(resp.text().await.unwrap(), "login-ok");
}

/// The probe validates admission without upgrading anything.
#[tokio::test]
async fn probe_succeeds_without_a_session() {
    let env = common::start_gateway().await;
    let token = common::mint_token("heidi", "lfs");

    let resp = common::http_client()
        .get(format!("http://{}/api/vnc/ws/probe", env.addr))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "Ok");
}

/// Requests without a token are refused before touching any session state.
#[tokio::test]
async fn missing_token_is_refused() {
    let env = common::start_gateway().await;

    let resp = common::http_client()
        .get(format!("http://{}/api/connected", env.addr))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 403);

    let resp = common::http_client()
        .get(format!("http://{}/api/connected", env.addr))
        .bearer_auth("not-a-jwt")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}
