//! Locally served domains and their TLS material.

use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use tokio_rustls::rustls::server::{ClientHello, ResolvesServerCert};
use tokio_rustls::rustls::sign::CertifiedKey;
use tokio_rustls::rustls::{self, ServerConfig};
use tracing::info;

use crate::config::HostConfig;
use crate::XmppError;

/// Registry of local domains. Built at startup, read-only afterwards.
#[derive(Clone, Default)]
pub struct Hosts {
    default_host: String,
    certificates: HashMap<String, Option<Arc<CertifiedKey>>>,
}

impl Hosts {
    /// Registry serving only `default_host`, without TLS material.
    pub fn new(default_host: impl Into<String>) -> Self {
        let default_host = default_host.into();
        let mut certificates = HashMap::new();
        certificates.insert(default_host.clone(), None);
        Self {
            default_host,
            certificates,
        }
    }

    /// Build the registry from configuration, loading every PEM pair.
    pub fn from_config(default_host: &str, hosts: &[HostConfig]) -> Result<Self, XmppError> {
        let mut registry = Self::new(default_host);
        for host in hosts {
            let certificate = match (&host.cert_file, &host.key_file) {
                (Some(cert), Some(key)) => Some(load_certified_key(cert, key)?),
                (None, None) => None,
                _ => {
                    return Err(XmppError::config(format!(
                        "host {} needs both cert_file and key_file",
                        host.domain
                    )))
                }
            };
            info!(domain = %host.domain, tls = certificate.is_some(), "Registered local host");
            registry.add_host(&host.domain, certificate);
        }
        Ok(registry)
    }

    /// Register a domain.
    pub fn add_host(&mut self, domain: &str, certificate: Option<Arc<CertifiedKey>>) {
        self.certificates.insert(domain.to_string(), certificate);
    }

    /// Domain used when a stream names none.
    pub fn default_host(&self) -> &str {
        &self.default_host
    }

    /// Whether `domain` is served by this server.
    pub fn is_local_host(&self, domain: &str) -> bool {
        self.certificates.contains_key(domain)
    }

    /// Every loaded certificate.
    pub fn certificates(&self) -> Vec<Arc<CertifiedKey>> {
        self.certificates.values().flatten().cloned().collect()
    }

    /// Certificate for `domain`, falling back to the default host's.
    pub fn certificate_for(&self, domain: Option<&str>) -> Option<Arc<CertifiedKey>> {
        domain
            .and_then(|d| self.certificates.get(d).cloned().flatten())
            .or_else(|| self.certificates.get(&self.default_host).cloned().flatten())
            .or_else(|| self.certificates().into_iter().next())
    }

    /// TLS server configuration selecting certificates by SNI. `None` when no
    /// host carries TLS material.
    pub fn tls_config(self: &Arc<Self>) -> Result<Option<Arc<ServerConfig>>, XmppError> {
        if self.certificates().is_empty() {
            return Ok(None);
        }
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| XmppError::config(format!("TLS config error: {}", e)))?
            .with_no_client_auth()
            .with_cert_resolver(Arc::new(HostCertResolver {
                hosts: Arc::clone(self),
            }));
        Ok(Some(Arc::new(config)))
    }
}

impl std::fmt::Debug for Hosts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hosts")
            .field("default_host", &self.default_host)
            .field("domains", &self.certificates.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// SNI-driven certificate selection.
#[derive(Debug)]
struct HostCertResolver {
    hosts: Arc<Hosts>,
}

impl ResolvesServerCert for HostCertResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        self.hosts.certificate_for(client_hello.server_name())
    }
}

/// Load a certificate chain and private key from PEM files.
pub fn load_certified_key(cert_path: &Path, key_path: &Path) -> Result<Arc<CertifiedKey>, XmppError> {
    let cert_file = File::open(cert_path).map_err(|e| {
        XmppError::config(format!("Failed to open cert file {}: {}", cert_path.display(), e))
    })?;
    let key_file = File::open(key_path).map_err(|e| {
        XmppError::config(format!("Failed to open key file {}: {}", key_path.display(), e))
    })?;

    let certs: Vec<_> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| XmppError::config(format!("Invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(XmppError::config(format!(
            "No certificate found in {}",
            cert_path.display()
        )));
    }

    let key = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| XmppError::config(format!("Invalid key PEM: {}", e)))?
        .ok_or_else(|| XmppError::config("No private key found"))?;

    let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)
        .map_err(|e| XmppError::config(format!("Unsupported private key: {}", e)))?;

    Ok(Arc::new(CertifiedKey::new(certs, signing_key)))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn self_signed(dir: &Path, name: &str) -> (std::path::PathBuf, std::path::PathBuf) {
        let cert = rcgen::generate_simple_self_signed(vec![name.to_string()]).unwrap();
        let cert_path = dir.join(format!("{}.crt", name));
        let key_path = dir.join(format!("{}.key", name));
        std::fs::write(&cert_path, cert.cert.pem()).unwrap();
        std::fs::write(&key_path, cert.key_pair.serialize_pem()).unwrap();
        (cert_path, key_path)
    }

    #[test]
    fn test_default_host_is_local() {
        let hosts = Hosts::new("localhost");
        assert!(hosts.is_local_host("localhost"));
        assert!(!hosts.is_local_host("jabber.org"));
        assert_eq!(hosts.default_host(), "localhost");
        assert!(hosts.certificates().is_empty());
    }

    #[test]
    fn test_no_tls_config_without_certificates() {
        let hosts = Arc::new(Hosts::new("localhost"));
        assert!(hosts.tls_config().unwrap().is_none());
    }

    #[test]
    fn test_from_config_loads_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, key) = self_signed(dir.path(), "localhost");
        let (cert2, key2) = self_signed(dir.path(), "example.net");

        let hosts = Hosts::from_config(
            "localhost",
            &[
                HostConfig {
                    domain: "localhost".into(),
                    cert_file: Some(cert),
                    key_file: Some(key),
                },
                HostConfig {
                    domain: "example.net".into(),
                    cert_file: Some(cert2),
                    key_file: Some(key2),
                },
            ],
        )
        .unwrap();

        assert!(hosts.is_local_host("example.net"));
        assert_eq!(hosts.certificates().len(), 2);
        assert!(hosts.certificate_for(Some("example.net")).is_some());
        assert!(hosts.certificate_for(Some("unknown.org")).is_some());
        assert!(Arc::new(hosts).tls_config().unwrap().is_some());
    }

    #[test]
    fn test_half_configured_host_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (cert, _) = self_signed(dir.path(), "localhost");
        let result = Hosts::from_config(
            "localhost",
            &[HostConfig {
                domain: "localhost".into(),
                cert_file: Some(cert),
                key_file: None,
            }],
        );
        assert!(matches!(result, Err(XmppError::Config(_))));
    }
}
