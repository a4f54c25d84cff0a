//! HTTP + WebSocket front door.
//!
//! One TCP listener serves both protocols.  Each accepted connection is
//! peeked (not consumed) until its request head is complete, then routed:
//!
//! * any request over the per-IP rate limit → `429 Too Many Requests`,
//! * `Upgrade: websocket` → a client session driven by the
//!   [`MessageHandler`][crate::handler::MessageHandler],
//! * `GET /health` and `GET /ready` → JSON status endpoints,
//! * everything else → `404 Not Found`.
//!
//! A WebSocket session runs a read loop (decode → handler, in receipt order)
//! and a separate write task that drains the client's hub queue and encodes
//! each message in the client's [`WireFormat`].  Text frames are decoded as
//! JSON and binary frames as MessagePack; `?format=msgpack` on the upgrade
//! URL selects MessagePack for outbound frames.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use robogate_middleware::{ClientHandle, WireFormat, codec};
use robogate_types::{GateError, Message, MessageType};
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{accept_async, tungstenite::Message as WsMessage};
use tracing::{debug, error, info, warn};

use crate::Gateway;
use crate::handler::ClientSession;

/// Largest request head accepted before routing.
const MAX_HEAD_BYTES: usize = 16 * 1024;

/// Time a client has to deliver its request head.
const HEAD_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between peeks while the head is still arriving.  `peek` returns
/// the same bytes immediately until more land, so it cannot simply wait.
const PEEK_RETRY: Duration = Duration::from_millis(5);

/// Accept connections on `listener` until the gateway is shut down.
///
/// # Errors
///
/// Currently only returns once cancelled; per-connection failures are
/// logged and do not stop the server.
pub async fn serve(gateway: Arc<Gateway>, listener: TcpListener) -> Result<(), GateError> {
    let local = listener.local_addr()?;
    info!(addr = %local, "gateway listening");
    let cancel = gateway.cancel_token();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let gateway = Arc::clone(&gateway);
                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, peer, gateway).await {
                            debug!(peer = %peer, error = %e, "connection ended with error");
                        }
                    });
                }
                Err(e) => warn!(error = %e, "accept failed"),
            },
        }
    }
    info!("gateway listener stopped");
    Ok(())
}

/// First line of an HTTP request, split into its parts.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RequestHead {
    method: String,
    path: String,
    query: Option<String>,
    upgrade: bool,
}

fn parse_head(raw: &str) -> Option<RequestHead> {
    let mut lines = raw.lines();
    let mut parts = lines.next()?.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?;
    let (path, query) = match target.split_once('?') {
        Some((p, q)) => (p.to_string(), Some(q.to_string())),
        None => (target.to_string(), None),
    };
    let upgrade = lines.take_while(|line| !line.is_empty()).any(|line| {
        let line = line.to_ascii_lowercase();
        line.starts_with("upgrade:") && line.contains("websocket")
    });
    Some(RequestHead {
        method,
        path,
        query,
        upgrade,
    })
}

fn head_complete(bytes: &[u8]) -> bool {
    bytes.windows(4).any(|w| w == b"\r\n\r\n")
}

/// Peek until `buf` holds a full request head, the peer stops sending, or
/// `buf` is full.  Nothing is consumed, so the WebSocket handshake still
/// sees the whole request.
async fn peek_head(stream: &TcpStream, buf: &mut [u8]) -> Result<usize, GateError> {
    loop {
        let n = stream.peek(buf).await?;
        if n == 0 || n == buf.len() || head_complete(&buf[..n]) {
            return Ok(n);
        }
        tokio::time::sleep(PEEK_RETRY).await;
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    gateway: Arc<Gateway>,
) -> Result<(), GateError> {
    let mut buf = vec![0u8; MAX_HEAD_BYTES];
    let n = match tokio::time::timeout(HEAD_TIMEOUT, peek_head(&stream, &mut buf)).await {
        Ok(peeked) => peeked?,
        Err(_) => {
            debug!(peer = %peer, "request head not received in time");
            return Ok(());
        }
    };
    let complete = head_complete(&buf[..n]);
    let head = complete
        .then(|| parse_head(&String::from_utf8_lossy(&buf[..n])))
        .flatten();
    if !head.as_ref().is_some_and(|h| h.upgrade) {
        // Plain HTTP: drain what was peeked so closing does not reset the peer.
        stream.read_exact(&mut buf[..n]).await?;
    }
    if !complete && n == MAX_HEAD_BYTES {
        return write_response(
            &mut stream,
            "431 Request Header Fields Too Large",
            &json!({"error": "request head too large"}),
        )
        .await;
    }
    let Some(head) = head else {
        return write_response(&mut stream, "400 Bad Request", &json!({"error": "bad request"})).await;
    };

    if !gateway.rate_limiter().check(peer.ip()) {
        warn!(peer = %peer, path = %head.path, "rate limit exceeded");
        return write_response(
            &mut stream,
            "429 Too Many Requests",
            &json!({"error": "rate limit exceeded"}),
        )
        .await;
    }

    if head.upgrade {
        let format = WireFormat::from_query(head.query.as_deref());
        return handle_ws(stream, peer, format, gateway).await;
    }

    match (head.method.as_str(), head.path.as_str()) {
        ("GET", "/health") => {
            let body = json!({"status": "ok", "uptime_secs": gateway.uptime().as_secs()});
            write_response(&mut stream, "200 OK", &body).await
        }
        ("GET", "/ready") => {
            let body = json!({
                "ready": !gateway.cancel_token().is_cancelled(),
                "robots": gateway.registry().len().await,
                "clients": gateway.hub().stats().await.clients,
            });
            write_response(&mut stream, "200 OK", &body).await
        }
        _ => write_response(&mut stream, "404 Not Found", &json!({"error": "not found"})).await,
    }
}

async fn write_response(
    stream: &mut TcpStream,
    status: &str,
    body: &serde_json::Value,
) -> Result<(), GateError> {
    let body = body.to_string();
    let response = format!(
        "HTTP/1.1 {status}\r\n\
         Content-Type: application/json\r\n\
         Content-Length: {}\r\n\
         Connection: close\r\n\
         \r\n\
         {body}",
        body.len(),
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await?;
    Ok(())
}

fn encode_frame(msg: &Message, format: WireFormat) -> Result<WsMessage, GateError> {
    match format {
        WireFormat::Json => codec::encode_json(msg).map(|text| WsMessage::Text(text.into())),
        WireFormat::MsgPack => codec::encode(msg).map(|bytes| WsMessage::Binary(bytes.into())),
    }
}

async fn handle_ws(
    stream: TcpStream,
    peer: SocketAddr,
    format: WireFormat,
    gateway: Arc<Gateway>,
) -> Result<(), GateError> {
    let ws = accept_async(stream)
        .await
        .map_err(|e| GateError::Io(format!("websocket handshake from {peer}: {e}")))?;
    let (mut ws_tx, mut ws_rx) = ws.split();

    let hub = gateway.hub().clone();
    let (handle, mut outbound) = ClientHandle::new();
    let mut session = ClientSession::new(handle.id.clone());
    hub.register(handle);
    hub.send_to(
        &session.id,
        Message::new(MessageType::ConnectionStatus)
            .with_field("client_id", session.id.as_str())
            .with_field("authenticated", false)
            .with_field("format", format.as_str()),
    );
    info!(client = %session.id, peer = %peer, %format, "client connected");

    let writer = {
        let client = session.id.clone();
        tokio::spawn(async move {
            while let Some(msg) = outbound.recv().await {
                let frame = match encode_frame(&msg, format) {
                    Ok(frame) => frame,
                    Err(e) => {
                        error!(client = %client, kind = %msg.kind, error = %e, "encode failed, message dropped");
                        continue;
                    }
                };
                if ws_tx.send(frame).await.is_err() {
                    break;
                }
            }
            let _ = ws_tx.close().await;
        })
    };

    let cancel = gateway.cancel_token();
    let handler = gateway.handler();
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = ws_rx.next() => frame,
        };
        let decoded = match frame {
            Some(Ok(WsMessage::Text(text))) => codec::decode_json(text.as_str()),
            Some(Ok(WsMessage::Binary(bytes))) => codec::decode(&bytes),
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                debug!(client = %session.id, error = %e, "websocket read failed");
                break;
            }
        };
        match decoded {
            Ok(msg) => handler.handle(&mut session, msg).await,
            Err(e) => {
                warn!(client = %session.id, error = %e, "undecodable frame, closing connection");
                hub.send_to(&session.id, Message::error_reply("", &e));
                break;
            }
        }
    }

    hub.unregister(&session.id);
    let _ = writer.await;
    info!(client = %session.id, user_id = ?session.user_id, "client disconnected");
    Ok(())
}
