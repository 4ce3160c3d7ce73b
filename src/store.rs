//! Versioned configuration store
//!
//! Holds the list of named policy objects (rate limiters, bypass rule sets)
//! as an immutable, versioned snapshot. Readers load an `Arc` and keep it for
//! as long as they need; writers build a modified copy and publish it with a
//! single pointer swap. A snapshot is never mutated in place.

use crate::mitm::BypassConfig;
use crate::rate_limiter::RateLimiterConfig;
use anyhow::Context;
use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Named policy objects managed at runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    #[serde(default)]
    pub limiters: Vec<RateLimiterConfig>,

    #[serde(default)]
    pub bypasses: Vec<BypassConfig>,
}

impl GlobalConfig {
    /// Find a rate limiter config by name
    pub fn limiter(&self, name: &str) -> Option<&RateLimiterConfig> {
        self.limiters.iter().find(|l| l.name == name)
    }

    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&data)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }
}

/// One published version of the configuration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedConfig {
    pub version: u64,
    pub config: GlobalConfig,
}

/// Copy-on-write configuration store with optional JSON persistence
pub struct ConfigStore {
    current: ArcSwap<VersionedConfig>,
    path: Option<PathBuf>,
}

impl ConfigStore {
    /// In-memory store starting at version 0
    pub fn new(config: GlobalConfig) -> Self {
        Self {
            current: ArcSwap::from_pointee(VersionedConfig { version: 0, config }),
            path: None,
        }
    }

    /// Store persisted to `path`; loads it when it exists
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            GlobalConfig::load(&path)?
        } else {
            GlobalConfig::default()
        };

        info!(
            path = %path.display(),
            limiters = config.limiters.len(),
            bypasses = config.bypasses.len(),
            "Config store opened"
        );

        Ok(Self {
            current: ArcSwap::from_pointee(VersionedConfig { version: 0, config }),
            path: Some(path),
        })
    }

    /// Current snapshot
    pub fn snapshot(&self) -> Arc<VersionedConfig> {
        self.current.load_full()
    }

    /// Current version number
    pub fn version(&self) -> u64 {
        self.current.load().version
    }

    /// Build the next version from the current one, persist it, then publish
    ///
    /// Callers serialize writers; a failed `edit` or save leaves the
    /// current snapshot untouched.
    pub fn publish<E>(
        &self,
        edit: impl FnOnce(&mut GlobalConfig) -> Result<(), E>,
    ) -> Result<Arc<VersionedConfig>, E>
    where
        E: From<anyhow::Error>,
    {
        let current = self.current.load_full();
        let mut config = current.config.clone();
        edit(&mut config)?;

        if let Some(path) = &self.path {
            save(path, &config)?;
        }

        let next = Arc::new(VersionedConfig {
            version: current.version + 1,
            config,
        });
        self.current.store(Arc::clone(&next));

        debug!(version = next.version, "Config version published");
        Ok(next)
    }
}

/// Write through a temp file so readers never see a partial file
fn save(path: &Path, config: &GlobalConfig) -> anyhow::Result<()> {
    let data = serde_json::to_vec_pretty(config).context("failed to serialize config")?;
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data).with_context(|| format!("failed to write {}", tmp.display()))?;
    std::fs::rename(&tmp, path)
        .with_context(|| format!("failed to replace {}", path.display()))?;
    Ok(())
}
