use std::collections::HashMap;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::consensus::Consensus;
use crate::error::{HibernatorError, Result};
use crate::rpc::RpcClient;

/// Reply of `istanbul_status`: the size of the sampled block window and the
/// last block each sealer sealed inside it.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct IstanbulStatus {
    #[serde(default)]
    num_blocks: u64,
    #[serde(default)]
    sealer_activity: HashMap<String, u64>,
}

/// Shutdown gate for IBFT. A non-validator may always go down. A validator
/// may go down only while the number of inactive sealers stays strictly
/// under the BFT tolerance of floor((N-1)/3).
pub struct IstanbulConsensus {
    rpc_url: String,
    client: RpcClient,
    activity_threshold: u64,
}

impl IstanbulConsensus {
    pub fn new(rpc_url: String, client: RpcClient, activity_threshold: u64) -> Self {
        Self {
            rpc_url,
            client,
            activity_threshold,
        }
    }
}

#[async_trait]
impl Consensus for IstanbulConsensus {
    async fn validate_shutdown(&self) -> Result<bool> {
        let is_validator: bool = self
            .client
            .call_rpc(&self.rpc_url, "istanbul_isValidator", json!([]))
            .await
            .map_err(|e| {
                HibernatorError::ConsensusViolation(format!(
                    "unable to check if istanbul validator: {e}"
                ))
            })?;
        if !is_validator {
            info!("istanbul consensus check - not a validator, ok to shutdown");
            return Ok(false);
        }

        let status: IstanbulStatus = self
            .client
            .call_rpc(&self.rpc_url, "istanbul_status", json!([]))
            .await
            .map_err(|e| {
                HibernatorError::ConsensusViolation(format!(
                    "unable to check istanbul sealer status: {e}"
                ))
            })?;

        if status.num_blocks == 0 {
            return Err(HibernatorError::ConsensusViolation(
                "istanbul consensus check failed - block minting not started at network"
                    .to_string(),
            ));
        }

        let total = status.sealer_activity.len();
        let down = status
            .sealer_activity
            .values()
            .filter(|sealed| status.num_blocks.saturating_sub(**sealed) > self.activity_threshold)
            .count();
        let tolerable = total.saturating_sub(1) / 3;
        info!(
            "istanbul consensus check - signers:{total} down:{down} tolerable:{tolerable}"
        );

        if down >= tolerable {
            return Err(HibernatorError::ConsensusViolation(format!(
                "istanbul consensus check - the number of nodes currently down has reached threshold, numOfNodesThatCanBeDown:{tolerable} numNodesDown:{down}"
            )));
        }
        Ok(true)
    }
}
