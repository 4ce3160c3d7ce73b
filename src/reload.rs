use crate::policy::{Options, PolicyError, PolicySnapshot};
use crate::registry::Registry;
use arc_swap::ArcSwap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum ReloadError {
    #[error(transparent)]
    Policy(#[from] PolicyError),

    #[error("policy resolution task failed: {0}")]
    Aborted(String),
}

/// Reloadable policy snapshot that supports atomic replacement
///
/// Connections call [`PolicyHandle::current`] once at accept time and keep the
/// returned `Arc` for their whole lifetime.
pub struct PolicyHandle {
    current: ArcSwap<PolicySnapshot>,
    version: AtomicU64,
}

impl PolicyHandle {
    pub fn new(snapshot: PolicySnapshot) -> Self {
        Self {
            current: ArcSwap::from_pointee(snapshot),
            version: AtomicU64::new(0),
        }
    }

    /// Resolve the initial snapshot
    pub fn resolve(options: &Options, registry: &Registry) -> Result<Self, PolicyError> {
        PolicySnapshot::resolve(options, registry).map(Self::new)
    }

    /// Snapshot new connections should use
    pub fn current(&self) -> Arc<PolicySnapshot> {
        self.current.load_full()
    }

    /// Number of successful reloads
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Publish an already resolved snapshot
    pub fn publish(&self, snapshot: PolicySnapshot) -> u64 {
        self.current.store(Arc::new(snapshot));
        self.version.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Resolve `options` off the runtime threads and publish the result
    ///
    /// On error the previous snapshot stays in place.
    pub async fn reload(
        &self,
        options: Options,
        registry: Arc<Registry>,
    ) -> Result<u64, ReloadError> {
        info!(options = options.len(), "Reloading policy");

        let resolved =
            tokio::task::spawn_blocking(move || PolicySnapshot::resolve(&options, &registry))
                .await
                .map_err(|e| ReloadError::Aborted(e.to_string()))?;

        match resolved {
            Ok(snapshot) => {
                let version = self.publish(snapshot);
                info!(version, "Policy reloaded");
                Ok(version)
            }
            Err(e) => {
                error!(error = %e, key = ?e.key(), "Policy reload failed, keeping current policy");
                Err(e.into())
            }
        }
    }
}

impl std::fmt::Debug for PolicyHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyHandle")
            .field("version", &self.version())
            .field("current", &self.current.load_full())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_reload_publishes_new_snapshot() {
        let registry = Arc::new(Registry::new());
        let handle = PolicyHandle::resolve(&Options::new(), &registry).unwrap();
        let captured = handle.current();

        let version = handle
            .reload(Options::new().with("readTimeout", "40s"), Arc::clone(&registry))
            .await
            .unwrap();

        assert_eq!(version, 1);
        assert_eq!(handle.current().read_timeout, Duration::from_secs(40));
        assert_eq!(captured.read_timeout, Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_failed_reload_keeps_previous() {
        let registry = Arc::new(Registry::new());
        let handle = PolicyHandle::new(PolicySnapshot {
            sniffing: true,
            ..Default::default()
        });

        let err = handle
            .reload(
                Options::new().with("mitm.certFile", "/nonexistent/ca.pem"),
                registry,
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ReloadError::Policy(PolicyError::MitmMaterialIncomplete { .. })
        ));
        assert!(handle.current().sniffing);
        assert_eq!(handle.version(), 0);
    }
}
