//! MITM (Man-in-the-Middle) interception module
//!
//! - CA key pair loading and leaf certificate signing
//! - Single-flight leaf certificate cache
//! - Client-facing TLS configuration
//! - Bypass evaluation for sensitive destinations

pub mod bypass;
pub mod ca;
pub mod cert_cache;
pub mod error;
pub mod interceptor;
pub mod tls_config;

pub use bypass::{BypassConfig, BypassDecision, BypassEvaluator, StaticBypass};
pub use ca::{CaKeyPair, HostIdentifier, LeafCertificate};
pub use cert_cache::LeafCertCache;
pub use error::{MaterialError, MitmError};
pub use interceptor::{Interception, InterceptionError, MitmInterceptor};
pub use tls_config::{ClientTlsConfig, TlsConfigError};

use std::path::Path;
use std::sync::Arc;

/// CA key pair plus the leaf certificates minted with it
///
/// Lives exactly as long as the policy snapshot that loaded it, so a reload
/// starts with an empty leaf cache.
pub struct MitmMaterial {
    ca: Arc<CaKeyPair>,
    leaves: LeafCertCache,
}

impl MitmMaterial {
    /// Wrap an already loaded CA
    pub fn new(ca: CaKeyPair) -> Self {
        let ca = Arc::new(ca);
        Self {
            leaves: LeafCertCache::new(Arc::clone(&ca)),
            ca,
        }
    }

    /// Load the CA certificate and private key from PEM files
    pub fn load(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, MaterialError> {
        CaKeyPair::load(cert_path, key_path).map(Self::new)
    }

    /// CA key pair
    pub fn ca(&self) -> &Arc<CaKeyPair> {
        &self.ca
    }

    /// Leaf certificate cache
    pub fn leaves(&self) -> &LeafCertCache {
        &self.leaves
    }
}

impl std::fmt::Debug for MitmMaterial {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MitmMaterial")
            .field("ca", &self.ca)
            .field("leaves", &self.leaves.len())
            .finish()
    }
}
