//! Outbound WebSocket write handles.
//!
//! Every WebSocket in the gateway gets a dedicated writer task that owns the
//! sink half. Peers, the keep-alive sweep and the close path all write
//! through the same cloneable handle, so frame order is total per socket and
//! nobody blocks on a slow sink.

use axum::extract::ws::{CloseFrame, Message as ClientMessage, WebSocket};
use futures_util::stream::SplitSink;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as PodCloseFrame;
use tokio_tungstenite::tungstenite::Message as PodMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

/// A frame queued for an outbound writer, independent of the socket flavor.
#[derive(Debug, Clone)]
pub enum WsFrame {
    Text(String),
    Binary(Vec<u8>),
    Ping,
    /// Send a CLOSE frame with status code and reason, then stop the writer.
    Close(u16, String),
}

/// Cloneable handle to a socket's writer task. A failed send means the
/// writer (and with it the socket) is gone.
pub type OutboundHandle = mpsc::UnboundedSender<WsFrame>;

/// Spawn the writer task for a client-side (axum) WebSocket.
pub fn spawn_client_writer(mut sink: SplitSink<WebSocket, ClientMessage>) -> OutboundHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<WsFrame>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let last = matches!(frame, WsFrame::Close(..));
            let msg = match frame {
                WsFrame::Text(text) => ClientMessage::Text(text.into()),
                WsFrame::Binary(data) => ClientMessage::Binary(data.into()),
                WsFrame::Ping => ClientMessage::Ping(Vec::new().into()),
                WsFrame::Close(code, reason) => ClientMessage::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })),
            };
            if sink.send(msg).await.is_err() || last {
                break;
            }
        }
        let _ = sink.close().await;
    });
    tx
}

/// Spawn the writer task for a pod-side (tungstenite) WebSocket.
pub fn spawn_pod_writer(
    mut sink: SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, PodMessage>,
) -> OutboundHandle {
    let (tx, mut rx) = mpsc::unbounded_channel::<WsFrame>();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let last = matches!(frame, WsFrame::Close(..));
            let msg = match frame {
                WsFrame::Text(text) => PodMessage::Text(text.into()),
                WsFrame::Binary(data) => PodMessage::Binary(data.into()),
                WsFrame::Ping => PodMessage::Ping(Vec::new().into()),
                WsFrame::Close(code, reason) => PodMessage::Close(Some(PodCloseFrame {
                    code: CloseCode::from(code),
                    reason: reason.into(),
                })),
            };
            if sink.send(msg).await.is_err() || last {
                break;
            }
        }
        let _ = sink.close().await;
    });
    tx
}
