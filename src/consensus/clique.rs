use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::consensus::Consensus;
use crate::error::{HibernatorError, Result};
use crate::rpc::RpcClient;

/// One entry of the `clique_getSignerMetrics` reply.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CliqueSignerMetric {
    #[serde(default)]
    address: String,
    #[serde(default)]
    last_proposed_block_number: String,
}

/// Shutdown gate for clique. A node that is not a signer may always go
/// down. A signer may go down only while the number of inactive signers
/// stays strictly under the clique tolerance of floor((N-1)/2).
pub struct CliqueConsensus {
    rpc_url: String,
    client: RpcClient,
    activity_threshold: u64,
}

impl CliqueConsensus {
    pub fn new(rpc_url: String, client: RpcClient, activity_threshold: u64) -> Self {
        Self {
            rpc_url,
            client,
            activity_threshold,
        }
    }

    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
        context: &str,
    ) -> Result<T> {
        self.client
            .call_rpc(&self.rpc_url, method, params)
            .await
            .map_err(|e| HibernatorError::ConsensusViolation(format!("unable to {context}: {e}")))
    }
}

#[async_trait]
impl Consensus for CliqueConsensus {
    async fn validate_shutdown(&self) -> Result<bool> {
        let coinbase: String = self
            .call("eth_coinbase", json!([]), "check clique signer address")
            .await?;
        let signers: Vec<String> = self
            .call("clique_getSigners", json!(["latest"]), "check clique signers")
            .await?;

        if !signers.iter().any(|s| s.eq_ignore_ascii_case(&coinbase)) {
            info!("clique consensus check - not a signer, ok to shutdown");
            return Ok(false);
        }

        let latest_hex: String = self
            .call("eth_blockNumber", json!([]), "check latest block")
            .await?;
        let latest = parse_quantity(&latest_hex)?;
        if latest == 0 {
            return Err(HibernatorError::ConsensusViolation(
                "clique consensus check failed - block minting not started at network".to_string(),
            ));
        }

        let metrics: Vec<CliqueSignerMetric> = self
            .call(
                "clique_getSignerMetrics",
                json!([]),
                "check clique signer metrics",
            )
            .await?;

        let mut down = 0usize;
        for signer in &signers {
            let sealed_recently = metrics
                .iter()
                .find(|m| m.address.eq_ignore_ascii_case(signer))
                .and_then(|m| parse_quantity(&m.last_proposed_block_number).ok())
                .map(|last| latest.saturating_sub(last) <= self.activity_threshold)
                .unwrap_or(false);
            if !sealed_recently {
                down += 1;
            }
        }
        let total = signers.len();
        let tolerable = total.saturating_sub(1) / 2;
        info!("clique consensus check - signers:{total} down:{down} tolerable:{tolerable}");

        if down >= tolerable {
            return Err(HibernatorError::ConsensusViolation(format!(
                "clique consensus check - the number of nodes currently down has reached threshold, numOfNodesThatCanBeDown:{tolerable} numNodesDown:{down}"
            )));
        }
        Ok(true)
    }
}

/// Parses an eth hex quantity such as "0x1a4".
fn parse_quantity(raw: &str) -> Result<u64> {
    let digits = raw.trim_start_matches("0x");
    u64::from_str_radix(digits, 16)
        .map_err(|e| HibernatorError::Decode(format!("bad block quantity {raw}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::body_partial_json;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn mock_method(server: &MockServer, method: &str, body: &str) {
        Mock::given(body_partial_json(json!({ "method": method })))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(server)
            .await;
    }

    async fn mock_clique_server(
        coinbase: &str,
        signers: &str,
        block_number: &str,
        metrics: &str,
    ) -> MockServer {
        let server = MockServer::start().await;
        mock_method(&server, "eth_coinbase", coinbase).await;
        mock_method(&server, "clique_getSigners", signers).await;
        mock_method(&server, "eth_blockNumber", block_number).await;
        mock_method(&server, "clique_getSignerMetrics", metrics).await;
        server
    }

    fn clique(server: &MockServer) -> CliqueConsensus {
        CliqueConsensus::new(server.uri(), RpcClient::new(None).unwrap(), 5)
    }

    #[tokio::test]
    async fn non_signer_may_shutdown() {
        let server = mock_clique_server(
            r#"{"result": "0xaaa1"}"#,
            r#"{"result": ["0xbbb1", "0xbbb2"]}"#,
            r#"{"result": "0x64"}"#,
            r#"{"result": []}"#,
        )
        .await;
        let is_member = clique(&server).validate_shutdown().await.unwrap();
        assert!(!is_member);
    }

    #[tokio::test]
    async fn refuses_before_minting_starts() {
        let server = mock_clique_server(
            r#"{"result": "0xaaa1"}"#,
            r#"{"result": ["0xAAA1", "0xbbb2"]}"#,
            r#"{"result": "0x0"}"#,
            r#"{"result": []}"#,
        )
        .await;
        let err = clique(&server).validate_shutdown().await.unwrap_err();
        assert!(err.to_string().contains("block minting not started"));
    }

    #[tokio::test]
    async fn three_active_signers_allow_one_down() {
        let server = mock_clique_server(
            r#"{"result": "0xaaa1"}"#,
            r#"{"result": ["0xaaa1", "0xaaa2", "0xaaa3"]}"#,
            r#"{"result": "0x64"}"#,
            r#"{"result": [
                {"address":"0xaaa1","lastProposedBlockNumber":"0x64"},
                {"address":"0xaaa2","lastProposedBlockNumber":"0x63"},
                {"address":"0xaaa3","lastProposedBlockNumber":"0x62"}
            ]}"#,
        )
        .await;
        let is_member = clique(&server).validate_shutdown().await.unwrap();
        assert!(is_member);
    }

    #[tokio::test]
    async fn stale_signer_consumes_the_tolerance() {
        // 0xaaa3 last sealed block 1 of 100: inactive, tolerance exhausted
        let server = mock_clique_server(
            r#"{"result": "0xaaa1"}"#,
            r#"{"result": ["0xaaa1", "0xaaa2", "0xaaa3"]}"#,
            r#"{"result": "0x64"}"#,
            r#"{"result": [
                {"address":"0xaaa1","lastProposedBlockNumber":"0x64"},
                {"address":"0xaaa2","lastProposedBlockNumber":"0x63"},
                {"address":"0xaaa3","lastProposedBlockNumber":"0x1"}
            ]}"#,
        )
        .await;
        let err = clique(&server).validate_shutdown().await.unwrap_err();
        assert!(err
            .to_string()
            .contains("numOfNodesThatCanBeDown:1 numNodesDown:1"));
    }

    #[tokio::test]
    async fn missing_metric_counts_as_down() {
        let server = mock_clique_server(
            r#"{"result": "0xaaa1"}"#,
            r#"{"result": ["0xaaa1", "0xaaa2", "0xaaa3"]}"#,
            r#"{"result": "0x64"}"#,
            r#"{"result": [
                {"address":"0xaaa1","lastProposedBlockNumber":"0x64"},
                {"address":"0xaaa2","lastProposedBlockNumber":"0x63"}
            ]}"#,
        )
        .await;
        assert!(clique(&server).validate_shutdown().await.is_err());
    }

    #[tokio::test]
    async fn coinbase_rpc_error_blocks_shutdown() {
        let server = mock_clique_server(
            r#"{"error": {"code":111,"message":"someerror"}}"#,
            r#"{"result": []}"#,
            r#"{"result": "0x64"}"#,
            r#"{"result": []}"#,
        )
        .await;
        let err = clique(&server).validate_shutdown().await.unwrap_err();
        assert!(err
            .to_string()
            .starts_with("unable to check clique signer address"));
    }

    #[test]
    fn parses_hex_quantities() {
        assert_eq!(parse_quantity("0x64").unwrap(), 100);
        assert_eq!(parse_quantity("0x0").unwrap(), 0);
        assert!(parse_quantity("nonsense").is_err());
    }
}
