use std::collections::HashSet;
use std::path::Path;

use serde::Deserialize;

use crate::config::tls::ClientTls;
use crate::config::read_config_file;
use crate::error::{HibernatorError, Result};

/// A sibling hibernator in the same logical group.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConfig {
    pub name: String,
    /// RPC address of the peer hibernator's control server.
    pub rpc_url: String,
    /// Public key of the privacy manager fronted by this peer, when it has one.
    #[serde(default)]
    pub privacy_manager_key: Option<String>,
    #[serde(default)]
    pub tls_config: Option<ClientTls>,
}

#[derive(Debug, Deserialize)]
struct PeersFile {
    peers: Vec<PeerConfig>,
}

impl PeerConfig {
    pub fn is_valid(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(HibernatorError::config("peer name is empty"));
        }
        if self.rpc_url.is_empty() {
            return Err(HibernatorError::config(format!(
                "peer {}: rpcUrl is empty",
                self.name
            )));
        }
        if let Some(tls) = &self.tls_config {
            tls.is_valid()?;
        }
        Ok(())
    }
}

/// Loads the peers file, validating uniqueness and excluding this node's
/// own entry.
pub fn load_peers(path: &Path, own_name: &str) -> Result<Vec<PeerConfig>> {
    let file: PeersFile = read_config_file(path)?;

    let mut seen = HashSet::new();
    for peer in &file.peers {
        peer.is_valid()?;
        if !seen.insert(peer.name.clone()) {
            return Err(HibernatorError::config(format!(
                "duplicate peer name {}",
                peer.name
            )));
        }
    }

    Ok(file
        .peers
        .into_iter()
        .filter(|p| p.name != own_name)
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_peers(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    #[test]
    fn loads_and_excludes_own_node() {
        let f = write_peers(
            r#"
            [[peers]]
            name = "node1"
            rpcUrl = "http://host1:8081"
            privacyManagerKey = "K1"

            [[peers]]
            name = "node2"
            rpcUrl = "http://host2:8081"
            "#,
        );
        let peers = load_peers(f.path(), "node1").unwrap();
        assert_eq!(peers.len(), 1);
        assert_eq!(peers[0].name, "node2");
        assert!(peers[0].privacy_manager_key.is_none());
    }

    #[test]
    fn rejects_duplicate_names() {
        let f = write_peers(
            r#"
            [[peers]]
            name = "node1"
            rpcUrl = "http://host1:8081"

            [[peers]]
            name = "node1"
            rpcUrl = "http://host3:8081"
            "#,
        );
        let err = load_peers(f.path(), "me").unwrap_err();
        assert!(err.to_string().contains("duplicate peer name"));
    }

    #[test]
    fn rejects_missing_rpc_url() {
        let f = write_peers(
            r#"
            [[peers]]
            name = "node1"
            rpcUrl = ""
            "#,
        );
        assert!(load_peers(f.path(), "me").is_err());
    }
}
