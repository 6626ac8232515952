use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::consensus::Consensus;
use crate::error::{HibernatorError, Result};
use crate::rpc::RpcClient;

const MINTER: &str = "minter";
const LEARNER: &str = "learner";

/// One entry of the `raft_cluster` reply.
#[derive(Debug, Deserialize)]
struct RaftClusterEntry {
    #[serde(default, rename = "nodeActive")]
    node_active: bool,
}

/// Shutdown gate for raft consensus. The minter must never go down; a
/// learner may always go down; a verifier may go down only while a majority
/// of the cluster stays active without it.
pub struct RaftConsensus {
    rpc_url: String,
    client: RpcClient,
}

impl RaftConsensus {
    pub fn new(rpc_url: String, client: RpcClient) -> Self {
        Self { rpc_url, client }
    }

    async fn role(&self) -> Result<String> {
        self.client
            .call_rpc(&self.rpc_url, "raft_role", json!([]))
            .await
            .map_err(|e| {
                HibernatorError::ConsensusViolation(format!("unable to check raft role: {e}"))
            })
    }

    async fn cluster(&self) -> Result<Vec<RaftClusterEntry>> {
        self.client
            .call_rpc(&self.rpc_url, "raft_cluster", json!([]))
            .await
            .map_err(|e| {
                HibernatorError::ConsensusViolation(format!(
                    "unable to check raft cluster info: {e}"
                ))
            })
    }
}

#[async_trait]
impl Consensus for RaftConsensus {
    async fn validate_shutdown(&self) -> Result<bool> {
        let role = self.role().await?;

        if role == MINTER {
            return Err(HibernatorError::ConsensusViolation(
                "minter node, cannot be shutdown".to_string(),
            ));
        }
        if role == LEARNER {
            info!("raft consensus check - role:learner, ok to shutdown");
            return Ok(false);
        }

        let cluster = self.cluster().await?;
        let total_nodes = cluster.len();
        let active_nodes = cluster.iter().filter(|n| n.node_active).count();
        let min_active_nodes = total_nodes / 2 + 1;
        info!(
            "raft consensus check - role:{role} totalNodes:{total_nodes} activeNodes:{active_nodes} minActiveNodes:{min_active_nodes}"
        );

        if active_nodes <= min_active_nodes {
            return Err(HibernatorError::ConsensusViolation(format!(
                "raft quorum failed, activeNodes={active_nodes} minimumActiveNodesRequired={min_active_nodes} cannot be shutdown"
            )));
        }
        Ok(true)
    }
}
