use std::fs;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::CertificateDer;
use serde::Deserialize;

use crate::error::{HibernatorError, Result};

/// TLS material for outbound connections (blockchain client, privacy
/// manager, peer hibernators).
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientTls {
    /// CA bundle used to verify the remote certificate.
    #[serde(default)]
    pub ca_certificate_file: Option<PathBuf>,
    /// Client certificate presented to the remote, paired with `key_file`.
    #[serde(default)]
    pub certificate_file: Option<PathBuf>,
    #[serde(default)]
    pub key_file: Option<PathBuf>,
    /// Skip verification of the remote certificate chain.
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// TLS material for a listening server.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerTls {
    pub certificate_file: PathBuf,
    pub key_file: PathBuf,
}

impl ClientTls {
    pub fn is_valid(&self) -> Result<()> {
        if self.certificate_file.is_some() != self.key_file.is_some() {
            return Err(HibernatorError::config(
                "tlsConfig: certificateFile and keyFile must be provided together",
            ));
        }
        Ok(())
    }

    /// CA certificates to trust, parsed from the configured bundle.
    pub fn root_certificates(&self) -> Result<Vec<reqwest::Certificate>> {
        let Some(path) = &self.ca_certificate_file else {
            return Ok(Vec::new());
        };
        read_certs(path)?
            .into_iter()
            .map(|der| {
                reqwest::Certificate::from_der(der.as_ref()).map_err(|e| {
                    HibernatorError::config(format!("bad CA certificate {}: {e}", path.display()))
                })
            })
            .collect()
    }

    /// Client identity (certificate + key) if one is configured.
    pub fn identity(&self) -> Result<Option<reqwest::Identity>> {
        let (Some(cert), Some(key)) = (&self.certificate_file, &self.key_file) else {
            return Ok(None);
        };
        let mut pem = read_file(cert)?;
        pem.extend_from_slice(&read_file(key)?);
        let identity = reqwest::Identity::from_pem(&pem).map_err(|e| {
            HibernatorError::config(format!("bad client identity {}: {e}", cert.display()))
        })?;
        Ok(Some(identity))
    }
}

impl ServerTls {
    pub fn is_valid(&self) -> Result<()> {
        if self.certificate_file.as_os_str().is_empty() || self.key_file.as_os_str().is_empty() {
            return Err(HibernatorError::config(
                "tlsConfig: certificateFile and keyFile are required",
            ));
        }
        Ok(())
    }

    /// Assembled server config. ALPN is pinned to HTTP/1.1 so the TLS
    /// listener never negotiates h2 and its cipher requirements.
    pub fn rustls_server_config(&self) -> Result<Arc<rustls::ServerConfig>> {
        let certs = read_certs(&self.certificate_file)?;
        if certs.is_empty() {
            return Err(HibernatorError::config(format!(
                "no certificates found in {}",
                self.certificate_file.display()
            )));
        }

        let key_pem = read_file(&self.key_file)?;
        let key = rustls_pemfile::private_key(&mut BufReader::new(key_pem.as_slice()))
            .map_err(|e| {
                HibernatorError::config(format!("bad key file {}: {e}", self.key_file.display()))
            })?
            .ok_or_else(|| {
                HibernatorError::config(format!(
                    "no private key found in {}",
                    self.key_file.display()
                ))
            })?;

        let mut config = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| HibernatorError::config(format!("invalid TLS material: {e}")))?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        Ok(Arc::new(config))
    }
}

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path)
        .map_err(|e| HibernatorError::config(format!("cannot read {}: {e}", path.display())))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = read_file(path)?;
    rustls_pemfile::certs(&mut BufReader::new(pem.as_slice()))
        .map(|c| {
            c.map_err(|e| {
                HibernatorError::config(format!("bad certificate in {}: {e}", path.display()))
            })
        })
        .collect()
}
