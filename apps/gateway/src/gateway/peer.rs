//! Backend tunnel pumps: bytes from the pod toward the client WebSocket.
//!
//! Both pumps are spawned only after the session latched `ready`, so the
//! first bytes of the backend handshake (the RFB greeting in RAW mode) are
//! never consumed before the client can receive them.

use std::sync::Arc;

use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;

use super::guac::{GuacError, GuacReader, INTERNAL_OPCODE_PREFIX, MAX_GUAC_MESSAGE};
use super::session::{CloseOrigin, Session};
use super::socket::WsFrame;

const TCP_READ_CHUNK: usize = 32 * 1024;

/// Pump raw VNC bytes to the client, one binary frame per read.
pub fn spawn_raw_backend_pump(session: Arc<Session>, mut read: OwnedReadHalf) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; TCP_READ_CHUNK];
        loop {
            let n = tokio::select! {
                _ = session.cancel_token().cancelled() => return,
                result = read.read(&mut buf) => match result {
                    Ok(0) => {
                        session.close(None, CloseOrigin::Backend).await;
                        return;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        if !session.is_closed() {
                            session
                                .close(Some(e.to_string()), CloseOrigin::Backend)
                                .await;
                        }
                        return;
                    }
                },
            };

            if session
                .send_to_client(WsFrame::Binary(buf[..n].to_vec()))
                .is_err()
            {
                tracing::warn!(
                    user = %session.user.username,
                    "failed to write message to the WebSocket client"
                );
                return;
            }
        }
    });
}

/// Pump guacd instructions to the client: internal instructions are dropped,
/// the rest are buffered and flushed as one text frame when nothing more is
/// immediately readable or the buffer reached `MAX_GUAC_MESSAGE`.
pub fn spawn_guac_backend_pump(session: Arc<Session>, mut reader: GuacReader<TcpStream>) {
    tokio::spawn(async move {
        let mut buf: Vec<u8> = Vec::with_capacity(MAX_GUAC_MESSAGE * 2);
        loop {
            let instruction = tokio::select! {
                _ = session.cancel_token().cancelled() => return,
                result = reader.read_some() => match result {
                    Ok(instruction) => instruction,
                    Err(e) => {
                        tracing::debug!(%e, "error reading from guacd");
                        if matches!(e, GuacError::Eof) && !session.is_closed() {
                            session
                                .close(Some("EOF".to_string()), CloseOrigin::Backend)
                                .await;
                        }
                        return;
                    }
                },
            };

            if instruction.starts_with(INTERNAL_OPCODE_PREFIX) {
                // Internal instructions are never sent to the WebSocket.
                continue;
            }
            buf.extend_from_slice(&instruction);

            if !reader.available() || buf.len() >= MAX_GUAC_MESSAGE {
                let text = String::from_utf8_lossy(&buf).into_owned();
                buf.clear();
                if session.send_to_client(WsFrame::Text(text)).is_err() {
                    tracing::debug!("failed sending message to ws, terminating peer");
                    session
                        .close(
                            Some("use of closed network connection".to_string()),
                            CloseOrigin::Unknown,
                        )
                        .await;
                    return;
                }
            }
        }
    });
}
