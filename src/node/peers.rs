use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;
use tracing::debug;

use crate::config::PeerConfig;
use crate::error::{HibernatorError, Result};
use crate::rpc::RpcClient;
use crate::types::{NodeStatusInfo, StatusReply};

/// Deadline for any single peer RPC during a fan-out.
pub(crate) const PEER_DEADLINE: Duration = Duration::from_secs(5);

/// Typed RPC surface of one sibling hibernator. Each peer gets its own
/// client so per-peer TLS material stays isolated.
pub struct PeerClient {
    cfg: PeerConfig,
    client: RpcClient,
}

impl PeerClient {
    pub fn new(cfg: PeerConfig) -> Result<Self> {
        let client = RpcClient::new(cfg.tls_config.as_ref())?;
        Ok(Self { cfg, client })
    }

    pub fn name(&self) -> &str {
        &self.cfg.name
    }

    pub fn privacy_manager_key(&self) -> Option<&str> {
        self.cfg.privacy_manager_key.as_deref()
    }

    pub async fn is_node_up(&self, from: &str) -> Result<bool> {
        let reply: StatusReply = self
            .client
            .call_rpc(&self.cfg.rpc_url, "node_isNodeUp", json!([from]))
            .await?;
        Ok(reply.status)
    }

    pub async fn node_status(&self, from: &str) -> Result<NodeStatusInfo> {
        self.client
            .call_rpc(&self.cfg.rpc_url, "node_nodeStatus", json!([from]))
            .await
    }

    /// Asks the peer to have its node ready for a private transaction. A
    /// false reply means the peer's node is not up yet; the peer starts it
    /// in the background and the caller retries.
    pub async fn prepare_for_private_tx(&self, from: &str) -> Result<bool> {
        let reply: StatusReply = self
            .client
            .call_rpc(&self.cfg.rpc_url, "node_prepareForPrivateTx", json!([from]))
            .await?;
        Ok(reply.status)
    }
}

/// The set of sibling hibernators, indexed for participant resolution.
pub struct PeerRegistry {
    peers: Vec<Arc<PeerClient>>,
}

impl PeerRegistry {
    pub fn new(cfgs: &[PeerConfig]) -> Result<Self> {
        let peers = cfgs
            .iter()
            .map(|c| PeerClient::new(c.clone()).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { peers })
    }

    pub fn peers(&self) -> &[Arc<PeerClient>] {
        &self.peers
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Resolves a participant public key to the peer whose privacy manager
    /// owns it.
    pub fn find_by_participant(&self, key: &str) -> Option<Arc<PeerClient>> {
        self.peers
            .iter()
            .find(|p| p.privacy_manager_key() == Some(key))
            .cloned()
    }

    /// Polls every peer's status concurrently. Each call is bounded by the
    /// peer deadline; a timed-out or failed peer yields an error entry.
    pub async fn poll_statuses(&self, from: &str) -> Vec<(String, Result<NodeStatusInfo>)> {
        let futures = self.peers.iter().map(|peer| {
            let peer = Arc::clone(peer);
            let from = from.to_string();
            async move {
                let res = match tokio::time::timeout(PEER_DEADLINE, peer.node_status(&from)).await {
                    Ok(res) => res,
                    Err(_) => Err(HibernatorError::transport(
                        peer.name(),
                        "peer status deadline exceeded",
                    )),
                };
                debug!("peer {} status poll: {:?}", peer.name(), res.as_ref().map(|s| s.status));
                (peer.name().to_string(), res)
            }
        });
        join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::body_partial_json;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn peer_cfg(name: &str, url: String, key: Option<&str>) -> PeerConfig {
        PeerConfig {
            name: name.to_string(),
            rpc_url: url,
            privacy_manager_key: key.map(str::to_string),
            tls_config: None,
        }
    }

    #[tokio::test]
    async fn node_status_round_trips() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(json!({"method": "node_nodeStatus"})))
            .respond_with(ResponseTemplate::new(200).set_body_string(
                r#"{"jsonrpc":"2.0","id":67,"result":{"Status":"up","InactiveTimeLimit":60,"InactiveTime":12,"TimeToShutdown":48}}"#,
            ))
            .mount(&server)
            .await;

        let peer = PeerClient::new(peer_cfg("node2", server.uri(), None)).unwrap();
        let status = peer.node_status("node1").await.unwrap();
        assert_eq!(status.status, crate::types::ClientStatus::Up);
        assert_eq!(status.time_to_shutdown, 48);
    }

    #[tokio::test]
    async fn prepare_for_private_tx_reads_status_reply() {
        let server = MockServer::start().await;
        Mock::given(body_partial_json(
            json!({"method": "node_prepareForPrivateTx", "params": ["node1"]}),
        ))
        .respond_with(ResponseTemplate::new(200).set_body_string(
            r#"{"jsonrpc":"2.0","id":67,"result":{"Status":true}}"#,
        ))
        .mount(&server)
        .await;

        let peer = PeerClient::new(peer_cfg("node2", server.uri(), Some("K2"))).unwrap();
        assert!(peer.prepare_for_private_tx("node1").await.unwrap());
    }

    #[tokio::test]
    async fn registry_resolves_participants_by_key() {
        let registry = PeerRegistry::new(&[
            peer_cfg("node2", "http://host2:8081".to_string(), Some("K2")),
            peer_cfg("node3", "http://host3:8081".to_string(), Some("K3")),
            peer_cfg("node4", "http://host4:8081".to_string(), None),
        ])
        .unwrap();

        assert_eq!(registry.len(), 3);
        assert_eq!(registry.find_by_participant("K3").unwrap().name(), "node3");
        assert!(registry.find_by_participant("K9").is_none());
    }

    #[tokio::test]
    async fn poll_statuses_reports_unreachable_peers() {
        let registry = PeerRegistry::new(&[peer_cfg(
            "node2",
            "http://127.0.0.1:1".to_string(),
            None,
        )])
        .unwrap();

        let statuses = registry.poll_statuses("node1").await;
        assert_eq!(statuses.len(), 1);
        assert_eq!(statuses[0].0, "node2");
        assert!(statuses[0].1.is_err());
    }
}
