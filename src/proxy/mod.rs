use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::config::{ProxyConfig, ProxyKind};
use crate::error::{HibernatorError, Result};
use crate::node::NodeControl;

pub mod http;
pub mod ws;

/// Body returned when the node cannot be woken for a request.
pub const NODE_NOT_READY: &str = "NodeIsNotReadyToAcceptRequest";
/// Body returned when a private transaction's participants cannot all be
/// brought up.
pub const SOME_PARTICIPANTS_DOWN: &str = "SomeParticipantsDown";

const UPSTREAM_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// One reverse-proxy listener fronting the managed node. Every request
/// funnels through the shared NodeControl: activity resets the timers and a
/// hibernated node is woken before the request is forwarded.
pub struct ProxyServer {
    cfg: ProxyConfig,
    ctl: Arc<NodeControl>,
    forward: reqwest::Client,
}

impl ProxyServer {
    pub fn new(ctl: Arc<NodeControl>, cfg: ProxyConfig) -> Result<Self> {
        let forward = reqwest::Client::builder()
            .connect_timeout(UPSTREAM_DIAL_TIMEOUT)
            .timeout(Duration::from_secs(cfg.read_timeout + cfg.write_timeout))
            .build()
            .map_err(|e| HibernatorError::config(format!("building proxy client: {e}")))?;
        Ok(Self { cfg, ctl, forward })
    }

    /// Builds one proxy per configured listener.
    pub fn make_proxies(ctl: &Arc<NodeControl>) -> Result<Vec<Arc<ProxyServer>>> {
        ctl.config()
            .basic
            .proxies
            .iter()
            .map(|cfg| ProxyServer::new(Arc::clone(ctl), cfg.clone()).map(Arc::new))
            .collect()
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    /// True when the request should neither count as activity nor wake a
    /// hibernated node. Matches by substring of the request URI.
    pub fn can_ignore_request(&self, uri: &str) -> bool {
        self.cfg
            .ignore_paths_for_activity
            .iter()
            .any(|p| uri.contains(p.as_str()))
    }

    /// Binds the listener and serves until cancelled. Fatal serve errors go
    /// to the supervisor's error channel. Returns the server handle so
    /// callers can observe the bound address.
    pub fn start(
        self: Arc<Self>,
        cancel: CancellationToken,
        err_tx: mpsc::Sender<anyhow::Error>,
    ) -> Result<(tokio::task::JoinHandle<()>, axum_server::Handle)> {
        let addr: SocketAddr = self.cfg.proxy_addr.parse().map_err(|e| {
            HibernatorError::config(format!("proxy {}: bad listen address: {e}", self.cfg.name))
        })?;

        let router = match self.cfg.kind {
            ProxyKind::Http => Router::new()
                .fallback(http::handle)
                .with_state(Arc::clone(&self)),
            ProxyKind::Ws => Router::new()
                .fallback(ws::handle)
                .with_state(Arc::clone(&self)),
        };

        let handle = axum_server::Handle::new();
        let grace = Duration::from_secs(self.cfg.write_timeout);
        {
            let handle = handle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                cancel.cancelled().await;
                handle.graceful_shutdown(Some(grace));
            });
        }

        info!("starting {} proxy {} on {}", kind_name(self.cfg.kind), self.cfg.name, addr);
        let name = self.cfg.name.clone();
        let server = axum_server::bind(addr)
            .handle(handle.clone())
            .serve(router.into_make_service_with_connect_info::<SocketAddr>());

        let task = tokio::spawn(async move {
            if let Err(e) = server.await {
                error!("proxy {name} server failed: {e}");
                let _ = err_tx.send(anyhow::anyhow!("proxy {name}: {e}")).await;
            }
        });
        Ok((task, handle))
    }

    fn upstream_url(&self, path_and_query: &str) -> String {
        format!(
            "{}{}",
            self.cfg.upstream_addr.trim_end_matches('/'),
            path_and_query
        )
    }
}

fn kind_name(kind: ProxyKind) -> &'static str {
    match kind {
        ProxyKind::Http => "http",
        ProxyKind::Ws => "websocket",
    }
}

/// 500 response carrying the reason in the body.
pub(crate) fn proxy_error(msg: impl Into<String>) -> Response {
    (axum::http::StatusCode::INTERNAL_SERVER_ERROR, msg.into()).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PeerConfig;
    use crate::testutil::{control, node_config, with_privacy_manager, FakeProcess, StaticConsensus};
    use serde_json::json;
    use std::sync::atomic::Ordering;
    use wiremock::matchers::{body_partial_json, method, path, header_exists};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn http_proxy_cfg(upstream: String, ignore: Vec<String>) -> ProxyConfig {
        ProxyConfig {
            name: "geth-rpc".to_string(),
            kind: ProxyKind::Http,
            proxy_addr: "127.0.0.1:0".to_string(),
            upstream_addr: upstream,
            ignore_paths_for_activity: ignore,
            read_timeout: 15,
            write_timeout: 15,
        }
    }

    async fn start_proxy(
        ctl: Arc<NodeControl>,
        cfg: ProxyConfig,
    ) -> (SocketAddr, CancellationToken) {
        let cancel = CancellationToken::new();
        let (err_tx, _err_rx) = mpsc::channel(1);
        let proxy = Arc::new(ProxyServer::new(ctl, cfg).unwrap());
        let (_task, handle) = proxy.start(cancel.clone(), err_tx).unwrap();
        let addr = handle.listening().await.unwrap();
        (addr, cancel)
    }

    #[test]
    fn ignore_list_matches_by_substring() {
        let ctl = control(
            node_config("node1"),
            FakeProcess::new("geth", true),
            None,
            StaticConsensus::allowing(false),
            &[],
        );
        let proxy = ProxyServer::new(
            ctl,
            http_proxy_cfg(
                "http://localhost:22000".to_string(),
                vec!["/upcheck".to_string(), "/metrics".to_string()],
            ),
        )
        .unwrap();

        assert!(proxy.can_ignore_request("/upcheck"));
        assert!(proxy.can_ignore_request("/v1/upcheck?verbose=true"));
        assert!(!proxy.can_ignore_request("/sendTransaction"));
    }

    #[tokio::test]
    async fn forwards_request_and_response_bodies() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/rpc"))
            .and(body_partial_json(json!({"method": "eth_blockNumber"})))
            .and(header_exists("x-forwarded-for"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"jsonrpc":"2.0","id":1,"result":"0x10"}"#,
            ))
            .mount(&upstream)
            .await;

        let ctl = control(
            node_config("node1"),
            FakeProcess::new("geth", true),
            None,
            StaticConsensus::allowing(false),
            &[],
        );
        let (addr, cancel) = start_proxy(ctl, http_proxy_cfg(upstream.uri(), vec![])).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/rpc"))
            .json(&json!({"jsonrpc":"2.0","method":"eth_blockNumber","params":[],"id":1}))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.text().await.unwrap().contains("0x10"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn wakes_a_hibernated_node_before_forwarding() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("pong"))
            .mount(&upstream)
            .await;

        let bc = FakeProcess::new("geth", false);
        let ctl = control(
            node_config("node1"),
            Arc::clone(&bc),
            None,
            StaticConsensus::allowing(false),
            &[],
        );
        let (addr, cancel) = start_proxy(ctl.clone(), http_proxy_cfg(upstream.uri(), vec![])).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/"))
            .body("ping")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(bc.start_calls.load(Ordering::SeqCst), 1);
        assert_eq!(ctl.client_status(), crate::types::ClientStatus::Up);

        cancel.cancel();
    }

    #[tokio::test]
    async fn ignored_paths_never_wake_the_node() {
        let upstream = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/upcheck"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .mount(&upstream)
            .await;

        let bc = FakeProcess::new("geth", false);
        let ctl = control(
            node_config("node1"),
            Arc::clone(&bc),
            None,
            StaticConsensus::allowing(false),
            &[],
        );
        let (addr, cancel) = start_proxy(
            ctl,
            http_proxy_cfg(upstream.uri(), vec!["/upcheck".to_string()]),
        )
        .await;

        let resp = reqwest::get(format!("http://{addr}/upcheck")).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(bc.start_calls.load(Ordering::SeqCst), 0);

        cancel.cancel();
    }

    #[tokio::test]
    async fn failed_wake_returns_node_not_ready() {
        let bc = FakeProcess::failing_start("geth");
        let ctl = control(
            node_config("node1"),
            bc,
            None,
            StaticConsensus::allowing(false),
            &[],
        );
        let (addr, cancel) = start_proxy(
            ctl,
            http_proxy_cfg("http://127.0.0.1:1".to_string(), vec![]),
        )
        .await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.text().await.unwrap(), NODE_NOT_READY);

        cancel.cancel();
    }

    #[tokio::test]
    async fn busy_node_rejects_requests_early() {
        let bc = FakeProcess::slow_start("geth", Duration::from_millis(500));
        let ctl = control(
            node_config("node1"),
            bc,
            None,
            StaticConsensus::allowing(false),
            &[],
        );
        let (addr, cancel) = start_proxy(
            ctl.clone(),
            http_proxy_cfg("http://127.0.0.1:1".to_string(), vec![]),
        )
        .await;

        ctl.spawn_prepare();
        tokio::time::sleep(Duration::from_millis(100)).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/"))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        assert!(resp.text().await.unwrap().contains("node is being started"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn private_tx_with_down_participant_is_rejected_before_forwarding() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&upstream)
            .await;

        // the peer owning K2 reports it cannot get ready
        let peer = MockServer::start().await;
        Mock::given(body_partial_json(json!({"method": "node_prepareForPrivateTx"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"jsonrpc":"2.0","id":67,"result":{"Status":false}}"#,
            ))
            .mount(&peer)
            .await;

        let peers = [PeerConfig {
            name: "node2".to_string(),
            rpc_url: peer.uri(),
            privacy_manager_key: Some("K2".to_string()),
            tls_config: None,
        }];
        let bc = FakeProcess::new("geth", true);
        let pm = FakeProcess::new("tessera", true);
        let ctl = control(
            with_privacy_manager(node_config("node1"), "OWN"),
            bc,
            Some(pm),
            StaticConsensus::allowing(false),
            &peers,
        );
        let (addr, cancel) = start_proxy(ctl, http_proxy_cfg(upstream.uri(), vec![])).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/"))
            .json(&json!({
                "jsonrpc": "2.0",
                "method": "eth_sendTransaction",
                "params": [{"from": "0x1", "privateFor": ["K2"]}],
                "id": 1
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 500);
        assert_eq!(resp.text().await.unwrap(), SOME_PARTICIPANTS_DOWN);

        cancel.cancel();
    }

    #[tokio::test]
    async fn private_tx_with_ready_participants_is_forwarded() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"jsonrpc":"2.0","id":1,"result":"0xtxhash"}"#,
            ))
            .expect(1)
            .mount(&upstream)
            .await;

        let peer = MockServer::start().await;
        Mock::given(body_partial_json(json!({"method": "node_prepareForPrivateTx"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"jsonrpc":"2.0","id":67,"result":{"Status":true}}"#,
            ))
            .expect(1)
            .mount(&peer)
            .await;

        let peers = [PeerConfig {
            name: "node2".to_string(),
            rpc_url: peer.uri(),
            privacy_manager_key: Some("K2".to_string()),
            tls_config: None,
        }];
        let bc = FakeProcess::new("geth", true);
        let pm = FakeProcess::new("tessera", true);
        let ctl = control(
            with_privacy_manager(node_config("node1"), "OWN"),
            bc,
            Some(pm),
            StaticConsensus::allowing(false),
            &peers,
        );
        let (addr, cancel) = start_proxy(ctl, http_proxy_cfg(upstream.uri(), vec![])).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/"))
            .json(&json!({
                "jsonrpc": "2.0",
                "method": "eth_sendTransaction",
                "params": [{"from": "0x1", "privateFor": ["K2"]}],
                "id": 1
            }))
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert!(resp.text().await.unwrap().contains("0xtxhash"));

        cancel.cancel();
    }

    #[tokio::test]
    async fn non_json_bodies_are_forwarded_unchanged() {
        let upstream = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string("accepted"))
            .expect(1)
            .mount(&upstream)
            .await;

        let bc = FakeProcess::new("geth", true);
        let pm = FakeProcess::new("tessera", true);
        let ctl = control(
            with_privacy_manager(node_config("node1"), "OWN"),
            bc,
            Some(pm),
            StaticConsensus::allowing(false),
            &[],
        );
        let (addr, cancel) = start_proxy(ctl, http_proxy_cfg(upstream.uri(), vec![])).await;

        let resp = reqwest::Client::new()
            .post(format!("http://{addr}/"))
            .body("opaque non-json payload")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.text().await.unwrap(), "accepted");

        cancel.cancel();
    }
}
