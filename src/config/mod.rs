use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::error::{HibernatorError, Result};

pub mod peers;
pub mod tls;

pub use peers::PeerConfig;
pub use tls::{ClientTls, ServerTls};

/// Minimum allowed inactivity window in seconds.
const MIN_INACTIVITY_TIME: u64 = 60;
const DEFAULT_PROXY_TIMEOUT_SECS: u64 = 15;
const DEFAULT_SEALER_ACTIVITY_THRESHOLD: u64 = 5;

/// Fully loaded and validated hibernator configuration: the node's own
/// settings plus its sibling peers. Immutable after load.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub basic: BasicConfig,
    pub peers: Vec<PeerConfig>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConfigFile {
    basic_config: BasicConfig,
}

/// Per-node settings, mirroring the hibernator config file schema.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BasicConfig {
    /// Name of this hibernator; also the tie-break key between peers.
    pub name: String,
    /// Strict mode keeps consensus members alive always; this flag turns
    /// that protection off.
    #[serde(default)]
    pub disable_strict_mode: bool,
    /// Up-check polling interval in seconds for the managed processes.
    pub upcheck_polling_interval: u64,
    /// File listing the sibling hibernators.
    pub peers_config_file: PathBuf,
    /// Seconds of inactivity after which hibernation is attempted.
    pub inactivity_time: u64,
    /// Seconds after which a hibernated client is restarted to resync with
    /// the chain. Zero disables resync.
    #[serde(default)]
    pub resync_time: u64,
    pub blockchain_client: BlockchainClient,
    #[serde(default)]
    pub privacy_manager: Option<PrivacyManager>,
    pub server: RpcServerConfig,
    #[serde(default)]
    pub proxies: Vec<ProxyConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientKind {
    GoQuorum,
    Besu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsensusKind {
    Raft,
    Istanbul,
    Clique,
}

impl std::fmt::Display for ConsensusKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ConsensusKind::Raft => "raft",
            ConsensusKind::Istanbul => "istanbul",
            ConsensusKind::Clique => "clique",
        };
        f.write_str(s)
    }
}

/// The blockchain client fronted by this hibernator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockchainClient {
    #[serde(rename = "type")]
    pub client_type: ClientKind,
    pub consensus: ConsensusKind,
    pub rpc_url: String,
    #[serde(default)]
    pub tls_config: Option<ClientTls>,
    pub process: ProcessConfig,
    /// A sealer counts as active when it sealed within this many recent
    /// blocks (Istanbul and Clique liveness checks).
    #[serde(default = "default_sealer_activity_threshold")]
    pub sealer_activity_threshold: u64,
}

fn default_sealer_activity_threshold() -> u64 {
    DEFAULT_SEALER_ACTIVITY_THRESHOLD
}

/// The optional privacy manager fronted by this hibernator.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivacyManager {
    pub public_key: String,
    #[serde(default)]
    pub tls_config: Option<ClientTls>,
    pub process: ProcessConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessControlKind {
    Shell,
    Docker,
}

/// A managed OS process and the commands and up-check that control it.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessConfig {
    pub name: String,
    pub control_type: ProcessControlKind,
    /// Container name or id, docker control only.
    #[serde(default)]
    pub container_id: String,
    /// Start command argv, shell control only.
    #[serde(default)]
    pub start_command: Vec<String>,
    /// Stop command argv, shell control only.
    #[serde(default)]
    pub stop_command: Vec<String>,
    pub upcheck_config: UpcheckConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum UpcheckMethod {
    #[default]
    Get,
    Post,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpcheckReturnType {
    /// Compare the raw response body with `expected`.
    #[default]
    String,
    /// Expect a JSON-RPC envelope whose `error` field is absent.
    RpcResult,
}

/// How to decide whether a managed process is up.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpcheckConfig {
    pub url: String,
    #[serde(default)]
    pub method: UpcheckMethod,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub return_type: UpcheckReturnType,
    /// Expected response body for `returnType = "string"`.
    #[serde(default)]
    pub expected: Option<String>,
}

/// Control RPC server exposed to sibling hibernators.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RpcServerConfig {
    pub rpc_addr: String,
    #[serde(default)]
    pub rpc_cors_list: Vec<String>,
    #[serde(default, rename = "rpcvHosts")]
    pub rpc_vhosts: Vec<String>,
    #[serde(default)]
    pub tls_config: Option<ServerTls>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProxyKind {
    Http,
    Ws,
}

/// One reverse-proxy listener fronting the managed node.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProxyConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ProxyKind,
    /// Listen address, host:port.
    pub proxy_addr: String,
    /// Upstream URL requests are forwarded to.
    pub upstream_addr: String,
    /// Requests whose URI contains any of these substrings neither count as
    /// activity nor wake the node.
    #[serde(default)]
    pub ignore_paths_for_activity: Vec<String>,
    #[serde(default = "default_proxy_timeout")]
    pub read_timeout: u64,
    #[serde(default = "default_proxy_timeout")]
    pub write_timeout: u64,
}

fn default_proxy_timeout() -> u64 {
    DEFAULT_PROXY_TIMEOUT_SECS
}

impl NodeConfig {
    pub fn is_strict_mode(&self) -> bool {
        !self.basic.disable_strict_mode
    }

    pub fn is_resync_enabled(&self) -> bool {
        self.basic.resync_time != 0
    }
}

impl BasicConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(HibernatorError::config("name is empty"));
        }
        if self.peers_config_file.as_os_str().is_empty() {
            return Err(HibernatorError::config("peersConfigFile is empty"));
        }
        if self.upcheck_polling_interval == 0 {
            return Err(HibernatorError::config(
                "upcheckPollingInterval must be greater than zero",
            ));
        }
        if self.inactivity_time < MIN_INACTIVITY_TIME {
            return Err(HibernatorError::config(
                "inactivityTime must be greater than or equal to 60 (seconds)",
            ));
        }
        if self.resync_time != 0 && self.resync_time < self.inactivity_time {
            return Err(HibernatorError::config(
                "resyncTime must be reasonably greater than the inactivityTime",
            ));
        }

        self.blockchain_client.is_valid()?;
        if let Some(pm) = &self.privacy_manager {
            pm.is_valid()?;
        }
        self.server.is_valid()?;

        if self.proxies.is_empty() {
            return Err(HibernatorError::config("proxies is empty"));
        }
        for proxy in &self.proxies {
            proxy.is_valid()?;
        }
        Ok(())
    }
}

impl BlockchainClient {
    pub fn is_valid(&self) -> Result<()> {
        if self.client_type == ClientKind::Besu && self.consensus != ConsensusKind::Clique {
            return Err(HibernatorError::config(
                "blockchainClient: besu supports clique consensus only",
            ));
        }
        if self.rpc_url.is_empty() {
            return Err(HibernatorError::config("blockchainClient: rpcUrl is empty"));
        }
        if let Some(tls) = &self.tls_config {
            tls.is_valid()?;
        }
        self.process.is_valid()
    }
}

impl PrivacyManager {
    pub fn is_valid(&self) -> Result<()> {
        if self.public_key.is_empty() {
            return Err(HibernatorError::config("privacyManager: publicKey is empty"));
        }
        if let Some(tls) = &self.tls_config {
            tls.is_valid()?;
        }
        self.process.is_valid()
    }
}

impl ProcessConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(HibernatorError::config("process: name is empty"));
        }
        match self.control_type {
            ProcessControlKind::Shell => {
                if self.start_command.is_empty() || self.stop_command.is_empty() {
                    return Err(HibernatorError::config(format!(
                        "process {}: shell control requires startCommand and stopCommand",
                        self.name
                    )));
                }
            }
            ProcessControlKind::Docker => {
                if self.container_id.is_empty() {
                    return Err(HibernatorError::config(format!(
                        "process {}: docker control requires containerId",
                        self.name
                    )));
                }
            }
        }
        self.upcheck_config.is_valid(&self.name)
    }
}

impl UpcheckConfig {
    fn is_valid(&self, process: &str) -> Result<()> {
        if self.url.is_empty() {
            return Err(HibernatorError::config(format!(
                "process {process}: upcheckConfig.url is empty"
            )));
        }
        if self.return_type == UpcheckReturnType::RpcResult
            && (self.method != UpcheckMethod::Post || self.body.is_empty())
        {
            return Err(HibernatorError::config(format!(
                "process {process}: rpcresult upcheck requires method POST and a body"
            )));
        }
        Ok(())
    }
}

impl RpcServerConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.rpc_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(HibernatorError::config(format!(
                "invalid rpcAddr: {}",
                self.rpc_addr
            )));
        }
        if let Some(tls) = &self.tls_config {
            tls.is_valid()?;
        }
        Ok(())
    }
}

impl ProxyConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(HibernatorError::config("proxy: name is empty"));
        }
        if self.proxy_addr.parse::<std::net::SocketAddr>().is_err() {
            return Err(HibernatorError::config(format!(
                "proxy {}: invalid proxyAddr {}",
                self.name, self.proxy_addr
            )));
        }
        let expected_schemes: &[&str] = match self.kind {
            ProxyKind::Http => &["http://", "https://"],
            ProxyKind::Ws => &["ws://", "wss://"],
        };
        if !expected_schemes
            .iter()
            .any(|s| self.upstream_addr.starts_with(s))
        {
            return Err(HibernatorError::config(format!(
                "proxy {}: upstreamAddr {} does not match proxy type",
                self.name, self.upstream_addr
            )));
        }
        Ok(())
    }
}

/// Loads and validates the hibernator config file plus its peers file.
pub fn load(path: &Path) -> Result<NodeConfig> {
    let file: ConfigFile = read_config_file(path)?;
    let basic = file.basic_config;
    basic.is_valid()?;

    // peers file path is resolved relative to the main config file
    let peers_path = if basic.peers_config_file.is_relative() {
        path.parent()
            .unwrap_or_else(|| Path::new("."))
            .join(&basic.peers_config_file)
    } else {
        basic.peers_config_file.clone()
    };
    let peers = peers::load_peers(&peers_path, &basic.name)?;

    Ok(NodeConfig { basic, peers })
}

/// Reads a TOML or JSON file, chosen by extension.
pub(crate) fn read_config_file<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| HibernatorError::config(format!("cannot read {}: {e}", path.display())))?;
    match path.extension().and_then(|e| e.to_str()) {
        Some("toml") => toml::from_str(&raw)
            .map_err(|e| HibernatorError::config(format!("{}: {e}", path.display()))),
        Some("json") => serde_json::from_str(&raw)
            .map_err(|e| HibernatorError::config(format!("{}: {e}", path.display()))),
        _ => Err(HibernatorError::config(format!(
            "{}: unsupported config format, use .toml or .json",
            path.display()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_process(name: &str) -> String {
        format!(
            r#"
            name = "{name}"
            controlType = "shell"
            startCommand = ["bash", "start.sh"]
            stopCommand = ["bash", "stop.sh"]
            [basicConfig.blockchainClient.process.upcheckConfig]
            url = "http://localhost:22000"
            "#
        )
    }

    fn sample_config(peers_file: &str) -> String {
        format!(
            r#"
            [basicConfig]
            name = "node1"
            upcheckPollingInterval = 1
            peersConfigFile = "{peers_file}"
            inactivityTime = 60
            resyncTime = 120

            [basicConfig.blockchainClient]
            type = "goquorum"
            consensus = "raft"
            rpcUrl = "http://localhost:22000"
            [basicConfig.blockchainClient.process]
            {process}

            [basicConfig.server]
            rpcAddr = "0.0.0.0:8081"
            rpcCorsList = ["*"]

            [[basicConfig.proxies]]
            name = "geth-rpc"
            type = "http"
            proxyAddr = "0.0.0.0:9091"
            upstreamAddr = "http://localhost:22000"
            ignorePathsForActivity = ["/upcheck"]
            "#,
            peers_file = peers_file,
            process = sample_process("geth"),
        )
    }

    fn write_temp(suffix: &str, content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(suffix).tempfile().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_valid_toml_config() {
        let peers = write_temp(
            ".toml",
            r#"
            [[peers]]
            name = "node2"
            rpcUrl = "http://host2:8081"
            "#,
        );
        let cfg_file = write_temp(
            ".toml",
            &sample_config(peers.path().to_str().unwrap()),
        );

        let cfg = load(cfg_file.path()).unwrap();
        assert_eq!(cfg.basic.name, "node1");
        assert_eq!(cfg.basic.blockchain_client.consensus, ConsensusKind::Raft);
        assert_eq!(cfg.basic.blockchain_client.sealer_activity_threshold, 5);
        assert_eq!(cfg.peers.len(), 1);
        assert!(cfg.is_strict_mode());
        assert!(cfg.is_resync_enabled());
    }

    #[test]
    fn rejects_short_inactivity_time() {
        let cfg = sample_config("peers.toml").replace("inactivityTime = 60", "inactivityTime = 10");
        let f = write_temp(".toml", &cfg);
        let err = load(f.path()).unwrap_err();
        assert!(err.to_string().contains("inactivityTime"));
    }

    #[test]
    fn rejects_resync_below_inactivity() {
        let cfg = sample_config("peers.toml").replace("resyncTime = 120", "resyncTime = 30");
        let f = write_temp(".toml", &cfg);
        assert!(load(f.path()).is_err());
    }

    #[test]
    fn rejects_besu_with_raft() {
        let cfg = sample_config("peers.toml").replace(r#"type = "goquorum""#, r#"type = "besu""#);
        let f = write_temp(".toml", &cfg);
        let err = load(f.path()).unwrap_err();
        assert!(err.to_string().contains("clique"));
    }

    #[test]
    fn rejects_missing_proxies() {
        let cfg = sample_config("peers.toml");
        let cfg = cfg.split("[[basicConfig.proxies]]").next().unwrap().to_string();
        let f = write_temp(".toml", &cfg);
        let err = load(f.path()).unwrap_err();
        assert!(err.to_string().contains("proxies"));
    }

    #[test]
    fn rejects_ws_proxy_with_http_upstream() {
        let cfg = sample_config("peers.toml")
            .replace(r#"type = "http""#, r#"type = "ws""#);
        let f = write_temp(".toml", &cfg);
        assert!(load(f.path()).is_err());
    }

    #[test]
    fn rejects_unknown_extension() {
        let f = write_temp(".yaml", "basicConfig:");
        assert!(load(f.path()).is_err());
    }
}
