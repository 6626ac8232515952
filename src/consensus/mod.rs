use std::sync::Arc;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, warn};

use crate::config::{BasicConfig, ClientKind, ConsensusKind, NodeConfig};
use crate::error::{HibernatorError, Result};
use crate::rpc::RpcClient;

pub mod clique;
pub mod istanbul;
pub mod raft;

pub use clique::CliqueConsensus;
pub use istanbul::IstanbulConsensus;
pub use raft::RaftConsensus;

/// Consensus-specific shutdown gate.
#[async_trait]
pub trait Consensus: Send + Sync {
    /// Checks whether hibernating this node can break network liveness.
    ///
    /// `Ok(is_consensus_member)` means shutdown is safe; the flag reports
    /// whether this node participates in consensus, so strict mode can keep
    /// it alive regardless. Any error means shutdown must not proceed, and
    /// error paths count as consensus membership so responsibility is
    /// attributed conservatively.
    async fn validate_shutdown(&self) -> Result<bool>;
}

/// Builds the validator matching the configured consensus algorithm.
pub fn new_consensus(cfg: &NodeConfig, client: RpcClient) -> Arc<dyn Consensus> {
    let bc = &cfg.basic.blockchain_client;
    match bc.consensus {
        ConsensusKind::Raft => Arc::new(RaftConsensus::new(bc.rpc_url.clone(), client)),
        ConsensusKind::Istanbul => Arc::new(IstanbulConsensus::new(
            bc.rpc_url.clone(),
            client,
            bc.sealer_activity_threshold,
        )),
        ConsensusKind::Clique => Arc::new(CliqueConsensus::new(
            bc.rpc_url.clone(),
            client,
            bc.sealer_activity_threshold,
        )),
    }
}

/// Verifies at startup that the configured consensus matches what the
/// running goquorum client reports via `admin_nodeInfo`. An unreachable
/// client is not an error, the client may legitimately be hibernated.
pub async fn verify_client_consensus(client: &RpcClient, cfg: &BasicConfig) -> Result<()> {
    if cfg.blockchain_client.client_type == ClientKind::Besu {
        return Ok(());
    }

    let info: serde_json::Value = match client
        .call_rpc(&cfg.blockchain_client.rpc_url, "admin_nodeInfo", json!([]))
        .await
    {
        Ok(v) => v,
        Err(e) => {
            warn!("skipping consensus verification, client not answering: {e}");
            return Ok(());
        }
    };
    debug!("admin_nodeInfo response: {info}");

    let protocols = info
        .get("protocols")
        .and_then(|p| p.as_object())
        .ok_or_else(|| HibernatorError::config("no consensus info found in admin_nodeInfo"))?;

    if protocols.contains_key("istanbul") {
        if cfg.blockchain_client.consensus == ConsensusKind::Istanbul {
            return Ok(());
        }
        return Err(HibernatorError::config(
            "consensus mismatch: client reports istanbul",
        ));
    }

    let reported = protocols
        .get("eth")
        .and_then(|eth| eth.get("consensus"))
        .and_then(|c| c.as_str())
        .ok_or_else(|| HibernatorError::config("consensus key missing in admin_nodeInfo output"))?;
    let expected = cfg.blockchain_client.consensus.to_string();
    if reported == expected {
        Ok(())
    } else {
        Err(HibernatorError::config(format!(
            "consensus mismatch: expected {expected}, client reports {reported}"
        )))
    }
}
