//! TLS Configuration - Client-facing TLS settings for interception
//!
//! Builds the rustls `ServerConfig` used to terminate a client's TLS session
//! with a minted leaf certificate.
//!
//! - TLS 1.2 and 1.3 only
//! - Served chain is `[leaf, CA]`
//! - ALPN list supplied per handshake

use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::version::{TLS12, TLS13};
use rustls::ServerConfig;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// TLS configuration errors
#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("TLS configuration error: {0}")]
    ConfigError(String),

    #[error("empty certificate chain")]
    EmptyChain,
}

/// Client-facing TLS config (proxy acts as server with a minted cert)
pub struct ClientTlsConfig {
    config: Arc<ServerConfig>,
}

impl ClientTlsConfig {
    /// Build a server config for one intercepted host
    pub fn new(
        cert_chain: Vec<CertificateDer<'static>>,
        private_key: PrivateKeyDer<'static>,
        alpn_protocols: Vec<Vec<u8>>,
    ) -> Result<Self, TlsConfigError> {
        if cert_chain.is_empty() {
            return Err(TlsConfigError::EmptyChain);
        }

        let provider = Arc::new(ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?
            .with_no_client_auth()
            .with_single_cert(cert_chain, private_key)
            .map_err(|e| TlsConfigError::ConfigError(e.to_string()))?;

        config.alpn_protocols = alpn_protocols;

        debug!(
            alpn = ?config
                .alpn_protocols
                .iter()
                .map(|p| String::from_utf8_lossy(p).into_owned())
                .collect::<Vec<_>>(),
            "Client-facing TLS config created"
        );

        Ok(Self {
            config: Arc::new(config),
        })
    }

    /// Get rustls ServerConfig
    pub fn server_config(&self) -> Arc<ServerConfig> {
        Arc::clone(&self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mitm::ca::{CaKeyPair, HostIdentifier};

    #[test]
    fn test_client_config_with_leaf() {
        let ca = CaKeyPair::generate("TLS Config Test CA").unwrap();
        let leaf = ca
            .sign(&HostIdentifier::from_hostname("example.com").unwrap())
            .unwrap();

        let config = ClientTlsConfig::new(
            vec![leaf.cert_der().clone(), ca.cert_der().clone()],
            leaf.private_key(),
            vec![b"h2".to_vec()],
        )
        .unwrap();

        assert_eq!(config.server_config().alpn_protocols, vec![b"h2".to_vec()]);
    }

    #[tokio::test]
    async fn test_accepts_tls12_client() {
        let ca = CaKeyPair::generate("Version Test CA").unwrap();
        let leaf = ca
            .sign(&HostIdentifier::from_hostname("example.com").unwrap())
            .unwrap();
        let server = ClientTlsConfig::new(
            vec![leaf.cert_der().clone(), ca.cert_der().clone()],
            leaf.private_key(),
            Vec::new(),
        )
        .unwrap()
        .server_config();

        let mut roots = rustls::RootCertStore::empty();
        roots.add(ca.cert_der().clone()).unwrap();
        let client = rustls::ClientConfig::builder_with_provider(Arc::new(ring::default_provider()))
            .with_protocol_versions(&[&TLS12])
            .unwrap()
            .with_root_certificates(roots)
            .with_no_client_auth();

        let (client_io, server_io) = tokio::io::duplex(16 * 1024);
        let name = rustls::pki_types::ServerName::try_from("example.com").unwrap();
        let (client, server) = tokio::join!(
            tokio_rustls::TlsConnector::from(Arc::new(client)).connect(name, client_io),
            tokio_rustls::TlsAcceptor::from(server).accept(server_io)
        );

        server.unwrap();
        assert_eq!(
            client.unwrap().get_ref().1.protocol_version(),
            Some(rustls::ProtocolVersion::TLSv1_2)
        );
    }

    #[test]
    fn test_empty_chain_rejected() {
        let ca = CaKeyPair::generate("Empty Chain CA").unwrap();
        let leaf = ca
            .sign(&HostIdentifier::from_hostname("example.com").unwrap())
            .unwrap();

        assert!(matches!(
            ClientTlsConfig::new(Vec::new(), leaf.private_key(), Vec::new()),
            Err(TlsConfigError::EmptyChain)
        ));
    }
}
