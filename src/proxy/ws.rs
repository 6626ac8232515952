use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::http::{HeaderMap, Uri};
use axum::response::{IntoResponse, Response};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungsteniteCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungsteniteMessage;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, error};

use crate::node::NodeControl;
use crate::proxy::{proxy_error, ProxyServer, NODE_NOT_READY};

type UpstreamSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Close code used when a side goes away without a close frame.
const NORMAL_CLOSURE: u16 = 1000;

/// Headers copied verbatim from the incoming handshake to the upstream
/// dial.
const FORWARDED_HEADERS: &[&str] = &["origin", "sec-websocket-protocol", "cookie"];

/// Serves one proxied WebSocket connection: the same busy/activity/wake
/// gate as the HTTP path, then an upstream dial and bidirectional
/// replication. Every frame arriving from the client counts as activity.
pub(super) async fn handle(
    State(ps): State<Arc<ProxyServer>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    uri: Uri,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Err(e) = ps.ctl.is_node_busy() {
        return proxy_error(e.to_string());
    }

    let path_and_query = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    if !ps.can_ignore_request(&path_and_query) {
        ps.ctl.reset_inactive_sync_time();
        if !ps.ctl.prepare_client().await {
            error!("proxy {}: waking the node failed", ps.name());
            return proxy_error(NODE_NOT_READY);
        }
    }

    let url = ps.upstream_url(&path_and_query);
    let mut upstream_req = match url.clone().into_client_request() {
        Ok(req) => req,
        Err(e) => {
            error!("proxy {}: bad upstream url {url}: {e}", ps.name());
            return proxy_error("bad upstream url");
        }
    };
    for name in FORWARDED_HEADERS {
        for value in headers.get_all(*name) {
            upstream_req
                .headers_mut()
                .append(axum::http::HeaderName::from_static(*name), value.clone());
        }
    }
    let forwarded_for = match headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        Some(prior) => format!("{prior}, {}", remote.ip()),
        None => remote.ip().to_string(),
    };
    if let Ok(value) = axum::http::HeaderValue::from_str(&forwarded_for) {
        upstream_req.headers_mut().insert("x-forwarded-for", value);
    }
    upstream_req.headers_mut().insert(
        "x-forwarded-proto",
        axum::http::HeaderValue::from_static("http"),
    );

    let (upstream, handshake_resp) = match connect_async(upstream_req).await {
        Ok(pair) => pair,
        Err(e) => {
            error!("proxy {}: upstream websocket dial failed: {e}", ps.name());
            return (
                axum::http::StatusCode::SERVICE_UNAVAILABLE,
                "upstream unavailable",
            )
                .into_response();
        }
    };

    // mirror the subprotocol the upstream agreed to
    let mut ws = ws;
    if let Some(proto) = handshake_resp
        .headers()
        .get("sec-websocket-protocol")
        .and_then(|v| v.to_str().ok())
    {
        ws = ws.protocols([proto.to_string()]);
    }

    let ctl = Arc::clone(&ps.ctl);
    let name = ps.name().to_string();
    ws.on_upgrade(move |client| replicate(name, client, upstream, ctl))
}

/// Replicates frames in both directions until either side ends, forwarding
/// close frames with their original code where one was supplied.
async fn replicate(name: String, client: WebSocket, upstream: UpstreamSocket, ctl: Arc<NodeControl>) {
    let (mut client_tx, mut client_rx) = client.split();
    let (mut upstream_tx, mut upstream_rx) = upstream.split();

    let client_to_upstream = async move {
        while let Some(res) = client_rx.next().await {
            let msg = match res {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("ws proxy {name}: client read failed: {e}");
                    let _ = upstream_tx
                        .send(TungsteniteMessage::Close(Some(TungsteniteCloseFrame {
                            code: CloseCode::from(NORMAL_CLOSURE),
                            reason: "".into(),
                        })))
                        .await;
                    return;
                }
            };
            // every inbound client frame counts as activity
            ctl.reset_inactive_time();
            match msg {
                Message::Close(frame) => {
                    let mirrored = frame.map(|f| TungsteniteCloseFrame {
                        code: CloseCode::from(f.code),
                        reason: f.reason.into_owned().into(),
                    });
                    let _ = upstream_tx.send(TungsteniteMessage::Close(mirrored)).await;
                    return;
                }
                Message::Text(text) => {
                    if upstream_tx.send(TungsteniteMessage::Text(text)).await.is_err() {
                        return;
                    }
                }
                Message::Binary(data) => {
                    if upstream_tx.send(TungsteniteMessage::Binary(data)).await.is_err() {
                        return;
                    }
                }
                Message::Ping(data) => {
                    if upstream_tx.send(TungsteniteMessage::Ping(data)).await.is_err() {
                        return;
                    }
                }
                Message::Pong(data) => {
                    if upstream_tx.send(TungsteniteMessage::Pong(data)).await.is_err() {
                        return;
                    }
                }
            }
        }
        let _ = upstream_tx.send(TungsteniteMessage::Close(None)).await;
    };

    let upstream_to_client = async move {
        while let Some(res) = upstream_rx.next().await {
            let msg = match res {
                Ok(msg) => msg,
                Err(e) => {
                    debug!("ws proxy: upstream read failed: {e}");
                    let _ = client_tx
                        .send(Message::Close(Some(CloseFrame {
                            code: NORMAL_CLOSURE,
                            reason: "".into(),
                        })))
                        .await;
                    return;
                }
            };
            match msg {
                TungsteniteMessage::Close(frame) => {
                    let mirrored = frame.map(|f| CloseFrame {
                        code: f.code.into(),
                        reason: f.reason.into_owned().into(),
                    });
                    let _ = client_tx.send(Message::Close(mirrored)).await;
                    return;
                }
                TungsteniteMessage::Text(text) => {
                    if client_tx.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                TungsteniteMessage::Binary(data) => {
                    if client_tx.send(Message::Binary(data)).await.is_err() {
                        return;
                    }
                }
                TungsteniteMessage::Ping(data) => {
                    if client_tx.send(Message::Ping(data)).await.is_err() {
                        return;
                    }
                }
                TungsteniteMessage::Pong(data) => {
                    if client_tx.send(Message::Pong(data)).await.is_err() {
                        return;
                    }
                }
                TungsteniteMessage::Frame(_) => {}
            }
        }
        let _ = client_tx.send(Message::Close(None)).await;
    };

    // first direction to end tears the whole bridge down
    tokio::select! {
        _ = client_to_upstream => {}
        _ = upstream_to_client => {}
    }
}
