//! MITM Interceptor - Client-facing TLS termination
//!
//! Interception flow for a sniffed TLS connection:
//! 1. Ask the bypass evaluator; `Deny` hands back the untouched stream
//! 2. Fetch or mint the leaf certificate for the SNI host
//! 3. Complete a server-role TLS handshake with the client
//! 4. Return the decrypted stream; the outbound leg is the caller's job
//!
//! Once the handshake starts there is no plaintext fallback: a failure closes
//! the connection.

use crate::mitm::{
    bypass::{BypassDecision, BypassEvaluator},
    ca::LeafCertificate,
    error::MitmError,
    tls_config::{ClientTlsConfig, TlsConfigError},
    MitmMaterial,
};
use crate::rewind::Rewind;
use crate::sniff::ClientHello;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_rustls::server::TlsStream;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, info, warn};

/// Interception errors
#[derive(Debug, Error)]
pub enum InterceptionError {
    /// TLS handshake with the client failed
    #[error("interception failed for {host}: {reason}")]
    InterceptionFailed { host: String, reason: String },

    /// Leaf certificate could not be obtained
    #[error("MITM error: {0}")]
    Mitm(#[from] MitmError),

    /// Server config could not be built from the leaf
    #[error("TLS config error: {0}")]
    TlsConfig(#[from] TlsConfigError),
}

/// Result of an interception attempt
pub enum Interception<S> {
    /// Client TLS terminated; `stream` yields plaintext
    Intercepted {
        stream: Box<TlsStream<Rewind<S>>>,
        alpn: Option<String>,
        leaf: Arc<LeafCertificate>,
    },

    /// Bypass denied interception; original bytes untouched
    Bypassed(Rewind<S>),
}

impl<S> std::fmt::Debug for Interception<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Intercepted { alpn, leaf, .. } => f
                .debug_struct("Intercepted")
                .field("host", &leaf.host())
                .field("alpn", alpn)
                .finish(),
            Self::Bypassed(_) => f.write_str("Bypassed"),
        }
    }
}

/// MITM Interceptor
pub struct MitmInterceptor {
    /// CA and leaf cache
    material: Arc<MitmMaterial>,

    /// Interception gate; `None` allows every host
    bypass: Option<Arc<dyn BypassEvaluator>>,

    /// Protocol to negotiate instead of the client's offer
    alpn: Option<String>,
}

impl MitmInterceptor {
    /// Create new interceptor
    pub fn new(
        material: Arc<MitmMaterial>,
        bypass: Option<Arc<dyn BypassEvaluator>>,
        alpn: Option<String>,
    ) -> Self {
        Self {
            material,
            bypass,
            alpn,
        }
    }

    /// CA and leaf cache backing this interceptor
    pub fn material(&self) -> &Arc<MitmMaterial> {
        &self.material
    }

    /// Intercept a sniffed TLS connection
    pub async fn intercept<S>(
        &self,
        stream: Rewind<S>,
        hello: &ClientHello,
        destination: Option<SocketAddr>,
    ) -> Result<Interception<S>, InterceptionError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let host = hello.server_name.as_str();

        if let Some(bypass) = &self.bypass {
            if bypass.decide(host, destination).await == BypassDecision::Deny {
                info!(host = %host, "MITM bypassed");
                return Ok(Interception::Bypassed(stream));
            }
        }

        let started = Instant::now();
        let leaf = self.material.leaves().get_or_mint(host).await?;

        let alpn_protocols = match &self.alpn {
            Some(proto) => vec![proto.as_bytes().to_vec()],
            None => hello.alpn.iter().map(|p| p.as_bytes().to_vec()).collect(),
        };

        let chain = vec![leaf.cert_der().clone(), self.material.ca().cert_der().clone()];
        let tls_config = ClientTlsConfig::new(chain, leaf.private_key(), alpn_protocols)?;
        let acceptor = TlsAcceptor::from(tls_config.server_config());

        let tls_stream = acceptor.accept(stream).await.map_err(|e| {
            warn!(host = %host, error = %e, "Client TLS handshake failed");
            InterceptionError::InterceptionFailed {
                host: host.to_string(),
                reason: e.to_string(),
            }
        })?;

        let alpn = tls_stream
            .get_ref()
            .1
            .alpn_protocol()
            .map(|p| String::from_utf8_lossy(p).into_owned());

        debug!(
            host = %host,
            alpn = ?alpn,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Client TLS established"
        );

        Ok(Interception::Intercepted {
            stream: Box::new(tls_stream),
            alpn,
            leaf,
        })
    }
}
