//! MITM error types

use std::path::PathBuf;
use thiserror::Error;

/// Result type for certificate operations
pub type Result<T> = std::result::Result<T, MitmError>;

/// Errors raised while loading CA material from disk
#[derive(Error, Debug)]
pub enum MaterialError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// PEM file contained no certificate
    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    /// Certificate or key could not be parsed
    #[error("failed to parse CA material: {0}")]
    Parse(String),

    /// Private key does not belong to the certificate
    #[error("CA private key does not match the CA certificate")]
    KeyMismatch,
}

/// Certificate minting errors
#[derive(Error, Debug)]
pub enum MitmError {
    /// Leaf certificate generation failed
    #[error("failed to generate certificate for {host}: {reason}")]
    CertGenerationFailed { host: String, reason: String },

    /// Hostname cannot be placed in a certificate
    #[error("invalid host for certificate: {0}")]
    InvalidHost(String),

    /// Minting task was cancelled or panicked
    #[error("certificate minting aborted for {0}")]
    MintAborted(String),
}

impl MitmError {
    /// Create a certificate generation error
    pub fn cert_generation(host: impl Into<String>, msg: impl ToString) -> Self {
        Self::CertGenerationFailed {
            host: host.into(),
            reason: msg.to_string(),
        }
    }
}

impl MaterialError {
    pub(crate) fn parse(msg: impl ToString) -> Self {
        Self::Parse(msg.to_string())
    }
}
