use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::http::{HeaderValue, Method};
use axum::routing::post;
use axum::{Json, Router};
use axum_server::tls_rustls::RustlsConfig;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::RpcServerConfig;
use crate::error::{HibernatorError, Result};
use crate::node::NodeControl;
use crate::rpc::{JsonRpcRequest, JsonRpcResponse};
use crate::types::{ClientStatus, StatusReply};

/// Grace period for in-flight requests on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// JSON-RPC server exposing the control plane to sibling hibernators:
/// `node_isNodeUp`, `node_nodeStatus`, `node_prepareForPrivateTx`.
pub struct RpcService {
    ctl: Arc<NodeControl>,
    cfg: RpcServerConfig,
}

impl RpcService {
    pub fn new(ctl: Arc<NodeControl>, cfg: RpcServerConfig) -> Self {
        Self { ctl, cfg }
    }

    /// Binds the configured address (TLS when configured) and serves until
    /// cancelled. Returns the server handle so callers can observe the
    /// bound address.
    pub async fn start(
        self,
        cancel: CancellationToken,
        err_tx: mpsc::Sender<anyhow::Error>,
    ) -> Result<(tokio::task::JoinHandle<()>, axum_server::Handle)> {
        let addr: SocketAddr = self
            .cfg
            .rpc_addr
            .parse()
            .map_err(|e| HibernatorError::config(format!("bad rpcAddr: {e}")))?;

        let router = Router::new()
            .route("/", post(handle))
            .layer(self.cors_layer())
            .with_state(Arc::clone(&self.ctl));

        let handle = axum_server::Handle::new();
        {
            let handle = handle.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
            });
        }

        info!("starting control rpc server on {addr}");
        let task = match &self.cfg.tls_config {
            Some(tls) => {
                let rustls = RustlsConfig::from_config(tls.rustls_server_config()?);
                let server = axum_server::bind_rustls(addr, rustls)
                    .handle(handle.clone())
                    .serve(router.into_make_service());
                tokio::spawn(async move {
                    if let Err(e) = server.await {
                        error!("control rpc server failed: {e}");
                        let _ = err_tx.send(anyhow::anyhow!("rpc server: {e}")).await;
                    }
                })
            }
            None => {
                let server = axum_server::bind(addr)
                    .handle(handle.clone())
                    .serve(router.into_make_service());
                tokio::spawn(async move {
                    if let Err(e) = server.await {
                        error!("control rpc server failed: {e}");
                        let _ = err_tx.send(anyhow::anyhow!("rpc server: {e}")).await;
                    }
                })
            }
        };
        Ok((task, handle))
    }

    fn cors_layer(&self) -> tower_http::cors::CorsLayer {
        use tower_http::cors::{Any, CorsLayer};
        if self.cfg.rpc_cors_list.iter().any(|o| o == "*") {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<HeaderValue> = self
                .cfg
                .rpc_cors_list
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods([Method::POST])
                .allow_headers(Any)
        }
    }
}

async fn handle(State(ctl): State<Arc<NodeControl>>, body: Bytes) -> Json<JsonRpcResponse> {
    let req: JsonRpcRequest = match serde_json::from_slice(&body) {
        Ok(req) => req,
        Err(e) => {
            debug!("control rpc: unparsable request: {e}");
            return Json(JsonRpcResponse::error(None, -32700, "Parse error"));
        }
    };
    Json(dispatch(&ctl, req).await)
}

/// Routes one control request to the node controller.
async fn dispatch(ctl: &Arc<NodeControl>, req: JsonRpcRequest) -> JsonRpcResponse {
    let from = req
        .params
        .as_ref()
        .and_then(|p| p.get(0))
        .and_then(|v| v.as_str())
        .unwrap_or("unknown")
        .to_string();
    let id = req.id.clone();

    let result = match req.method.as_str() {
        "node_isNodeUp" => {
            let up = ctl.is_client_up();
            debug!("rpc isNodeUp from {from}: {up}");
            serde_json::to_value(StatusReply { status: up })
        }
        "node_nodeStatus" => {
            let status = ctl.get_node_status();
            info!("rpc nodeStatus from {from}: {}", status.status);
            serde_json::to_value(status)
        }
        "node_prepareForPrivateTx" => {
            let status = prepare_for_private_tx(ctl).await;
            info!("rpc prepareForPrivateTx from {from}: ready={status}");
            serde_json::to_value(StatusReply { status })
        }
        other => {
            debug!("rpc unknown method {other} from {from}");
            return JsonRpcResponse::error(id, -32601, "Method not found");
        }
    };

    match result {
        Ok(value) => JsonRpcResponse::result(id, value),
        Err(e) => JsonRpcResponse::error(id, -32603, format!("Internal error: {e}")),
    }
}

/// A peer wants this node ready for a private transaction. Counts as
/// activity. When the node is down the reply is immediate and the start
/// runs in the background; the peer retries until the node reports ready.
async fn prepare_for_private_tx(ctl: &Arc<NodeControl>) -> bool {
    ctl.reset_inactive_time();
    if ctl.is_node_busy().is_err() {
        return false;
    }
    if ctl.client_status() == ClientStatus::Down {
        ctl.spawn_prepare();
        return false;
    }
    ctl.prepare_client().await
}
