//! Per-connection processing pipeline
//!
//! An accepted stream passes the rate limiter, then the sniffing gate, then
//! (for TLS with a server name and configured MITM material) the interceptor.
//! The result is a [`Handoff`]: a byte stream positioned exactly where the
//! protocol handler expects it, plus everything learned on the way.

use crate::affinity;
use crate::mitm::{Interception, InterceptionError, MitmInterceptor};
use crate::mux::{MuxError, Session};
use crate::policy::PolicySnapshot;
use crate::rate_limiter::RateLimitError;
use crate::sniff::{SniffResult, Sniffer};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

/// Byte stream handed to protocol handlers
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type BoxedStream = Box<dyn AsyncStream>;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("rejected: {0}")]
    RateLimited(#[from] RateLimitError),

    #[error("sniffing failed: {0}")]
    Sniff(#[source] io::Error),

    #[error(transparent)]
    Interception(#[from] InterceptionError),

    #[error(transparent)]
    Mux(#[from] MuxError),
}

impl PipelineError {
    /// Connection was turned away by the rate limiter
    pub fn is_throttled(&self) -> bool {
        matches!(self, Self::RateLimited(RateLimitError::Throttled { .. }))
    }
}

/// Addressing facts about one connection or mux stream
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub peer: Option<SocketAddr>,
    pub local: Option<SocketAddr>,
    /// Original destination, when the transport knows it
    pub destination: Option<SocketAddr>,
    /// Set for streams carried by a mux session
    pub stream_id: Option<u32>,
}

impl ConnectionInfo {
    pub fn new(peer: Option<SocketAddr>, local: Option<SocketAddr>) -> Self {
        Self {
            peer,
            local,
            ..Default::default()
        }
    }

    pub fn with_stream(self, stream_id: u32) -> Self {
        Self {
            stream_id: Some(stream_id),
            ..self
        }
    }

    /// Key used for rate limiting
    pub fn client_key(&self) -> String {
        self.peer
            .map(|addr| addr.ip().to_string())
            .unwrap_or_else(|| "unknown".to_string())
    }
}

/// What the pipeline did to the byte stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Disposition {
    /// Untouched; sniffed bytes are replayed
    PassThrough,
    /// TLS seen but the bypass evaluator denied interception
    Bypassed,
    /// Client TLS terminated; the stream yields plaintext
    Intercepted { host: String, alpn: Option<String> },
}

/// Classified connection ready for a protocol handler
pub struct Handoff {
    pub stream: BoxedStream,
    pub sniff: SniffResult,
    pub disposition: Disposition,
    pub info: ConnectionInfo,
    /// Policy captured when the connection was accepted
    pub policy: Arc<PolicySnapshot>,
}

impl Handoff {
    /// Server name from the Client Hello, if any
    pub fn host(&self) -> Option<&str> {
        self.sniff
            .client_hello()
            .map(|hello| hello.server_name.as_str())
            .filter(|name| !name.is_empty())
    }

    pub fn is_intercepted(&self) -> bool {
        matches!(self.disposition, Disposition::Intercepted { .. })
    }

    /// Pick an upstream using the policy's affinity key
    ///
    /// Without a usable key the first candidate wins.
    pub fn select_upstream<'a, T>(&self, candidates: &'a [T]) -> Option<&'a T> {
        let key = self
            .policy
            .hash_source()
            .and_then(|source| source.key(self.host(), self.info.peer));

        match key {
            Some(key) => affinity::select(&key, candidates),
            None => candidates.first(),
        }
    }
}

impl std::fmt::Debug for Handoff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handoff")
            .field("sniff", &self.sniff)
            .field("disposition", &self.disposition)
            .field("info", &self.info)
            .finish()
    }
}

/// Pipeline bound to one policy snapshot
pub struct ConnectionPipeline {
    policy: Arc<PolicySnapshot>,
    sniffer: Sniffer,
    interceptor: Option<MitmInterceptor>,
}

impl ConnectionPipeline {
    pub fn new(policy: Arc<PolicySnapshot>) -> Self {
        Self {
            sniffer: policy.sniffer(),
            interceptor: policy.interceptor(),
            policy,
        }
    }

    pub fn policy(&self) -> &Arc<PolicySnapshot> {
        &self.policy
    }

    /// Consult the policy's rate limiter, if any
    pub async fn admit(&self, info: &ConnectionInfo) -> Result<(), PipelineError> {
        let Some(limiter) = &self.policy.rate_limiter else {
            return Ok(());
        };

        let key = info.client_key();
        limiter.acquire(&key, 1).await.map_err(|e| {
            debug!(key = %key, stream_id = ?info.stream_id, error = %e, "Admission denied");
            PipelineError::from(e)
        })
    }

    /// Sniff and optionally intercept `stream`
    pub async fn classify<S>(&self, stream: S, info: ConnectionInfo) -> Result<Handoff, PipelineError>
    where
        S: AsyncStream + 'static,
    {
        let (sniff, rewound) = self.sniffer.sniff(stream).await.map_err(PipelineError::Sniff)?;
        debug!(result = ?sniff, stream_id = ?info.stream_id, "Sniffed");

        let hello = sniff
            .client_hello()
            .filter(|hello| !hello.server_name.is_empty());

        let (stream, disposition) = match (&self.interceptor, hello) {
            (Some(interceptor), Some(hello)) => {
                match interceptor.intercept(rewound, hello, info.destination).await? {
                    Interception::Intercepted { stream, alpn, leaf } => {
                        info!(host = %leaf.host(), alpn = ?alpn, "Connection intercepted");
                        (
                            stream as BoxedStream,
                            Disposition::Intercepted {
                                host: leaf.host().to_string(),
                                alpn,
                            },
                        )
                    }
                    Interception::Bypassed(stream) => {
                        (Box::new(stream) as BoxedStream, Disposition::Bypassed)
                    }
                }
            }
            _ => (Box::new(rewound) as BoxedStream, Disposition::PassThrough),
        };

        Ok(Handoff {
            stream,
            sniff,
            disposition,
            info,
            policy: Arc::clone(&self.policy),
        })
    }

    /// Admit then classify
    pub async fn process<S>(&self, stream: S, info: ConnectionInfo) -> Result<Handoff, PipelineError>
    where
        S: AsyncStream + 'static,
    {
        self.admit(&info).await?;
        self.classify(stream, info).await
    }

    /// Open the server side of a mux session over `stream`
    pub async fn open_mux<S>(&self, stream: S) -> Result<Session, PipelineError>
    where
        S: AsyncStream + 'static,
    {
        Ok(Session::server(stream, self.policy.mux.clone()).await?)
    }
}
