use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::{debug, error};

use crate::privatetx;
use crate::proxy::{proxy_error, ProxyServer, NODE_NOT_READY, SOME_PARTICIPANTS_DOWN};

/// Headers that must not be forwarded hop to hop.
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
    "host",
    "content-length",
];

fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| name.eq_ignore_ascii_case(h))
}

/// Serves one proxied HTTP request: reject while busy, count activity, wake
/// the node, pre-heat private-transaction participants, then forward.
pub(super) async fn handle(
    State(ps): State<Arc<ProxyServer>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    req: Request,
) -> Response {
    if let Err(e) = ps.ctl.is_node_busy() {
        return proxy_error(e.to_string());
    }

    let (parts, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("proxy {}: reading request failed: {e}", ps.name());
            return proxy_error("Reading request failed");
        }
    };

    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();

    if !ps.can_ignore_request(&path_and_query) {
        debug!("proxy {}: request {} counts as activity", ps.name(), path_and_query);
        ps.ctl.reset_inactive_sync_time();

        if !ps.ctl.prepare_client().await {
            error!("proxy {}: waking the node failed", ps.name());
            return proxy_error(NODE_NOT_READY);
        }

        if ps.ctl.has_privacy_manager() {
            match privatetx::is_private_tx(&body) {
                Ok(Some(participants)) => {
                    debug!("proxy {}: private tx for {:?}", ps.name(), participants);
                    if let Err(e) = ps.ctl.prepare_hibernator_for_private_tx(&participants).await {
                        error!("proxy {}: private tx prep failed: {e}", ps.name());
                        return proxy_error(SOME_PARTICIPANTS_DOWN);
                    }
                }
                Ok(None) => {}
                // not JSON-RPC at all: forward unchanged
                Err(e) => debug!("proxy {}: body not inspectable: {e}", ps.name()),
            }
        }
    }

    forward(&ps, parts, body, remote).await
}

async fn forward(
    ps: &ProxyServer,
    parts: axum::http::request::Parts,
    body: bytes::Bytes,
    remote: SocketAddr,
) -> Response {
    let url = ps.upstream_url(
        parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/"),
    );

    let method = match reqwest::Method::from_bytes(parts.method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(_) => return proxy_error("unsupported method"),
    };

    let mut upstream_req = ps.forward.request(method, &url);
    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name.as_str()) && name.as_str() != "x-forwarded-for" {
            upstream_req = upstream_req.header(name.as_str(), value.as_bytes());
        }
    }
    let forwarded_for = match parts
        .headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
    {
        Some(prior) => format!("{prior}, {}", remote.ip()),
        None => remote.ip().to_string(),
    };
    upstream_req = upstream_req.header("x-forwarded-for", forwarded_for);
    if !body.is_empty() {
        upstream_req = upstream_req.body(body.to_vec());
    }

    let upstream_resp = match upstream_req.send().await {
        Ok(resp) => resp,
        Err(e) => {
            error!("proxy {}: upstream call failed: {e}", ps.name());
            return (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
        }
    };

    let status = StatusCode::from_u16(upstream_resp.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    let mut builder = Response::builder().status(status);
    for (name, value) in upstream_resp.headers().iter() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name.as_str(), value.as_bytes());
        }
    }
    let bytes = match upstream_resp.bytes().await {
        Ok(bytes) => bytes,
        Err(e) => {
            error!("proxy {}: reading upstream response failed: {e}", ps.name());
            return (StatusCode::BAD_GATEWAY, "upstream unavailable").into_response();
        }
    };
    builder
        .body(Body::from(bytes))
        .unwrap_or_else(|_| proxy_error("building response failed"))
}
