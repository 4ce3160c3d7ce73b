//! Rate limiter administration
//!
//! Create, update and delete named rate limiters. Each successful call
//! changes the live registry and publishes a new version of the
//! configuration list together, under one writer lock, so readers never see
//! one without the other. Transport (HTTP routing, auth) is left to the
//! embedding application; this module provides the operations and their
//! response envelopes.

use crate::rate_limiter::{RateLimiter, RateLimiterConfig, TokenBucketLimiter};
use crate::registry::Registry;
use crate::store::ConfigStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Success envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Response {
    pub msg: String,
}

impl Response {
    pub fn ok() -> Self {
        Self {
            msg: "OK".to_string(),
        }
    }
}

/// Error envelope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: u32,
    pub msg: String,
}

#[derive(Debug, Error)]
pub enum AdminError {
    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("object {0:?} already exists")]
    Duplicate(String),

    #[error("object {0:?} not found")]
    NotFound(String),

    #[error("failed to save config: {0}")]
    Save(#[source] anyhow::Error),
}

impl AdminError {
    /// Stable error code carried in the envelope
    pub fn code(&self) -> u32 {
        match self {
            Self::Invalid(_) => 40001,
            Self::Duplicate(_) => 40002,
            Self::NotFound(_) => 40004,
            Self::Save(_) => 40005,
        }
    }

    /// HTTP status for transports that need one
    pub fn status(&self) -> u16 {
        match self {
            Self::Invalid(_) | Self::Duplicate(_) => 400,
            Self::NotFound(_) => 404,
            Self::Save(_) => 500,
        }
    }

    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            code: self.code(),
            msg: self.to_string(),
        }
    }
}

impl From<anyhow::Error> for AdminError {
    fn from(err: anyhow::Error) -> Self {
        Self::Save(err)
    }
}

/// CRUD operations over named rate limiters
pub struct RateLimiterAdmin {
    registry: Arc<Registry>,
    store: Arc<ConfigStore>,
    write_lock: Mutex<()>,
}

impl RateLimiterAdmin {
    pub fn new(registry: Arc<Registry>, store: Arc<ConfigStore>) -> Self {
        Self {
            registry,
            store,
            write_lock: Mutex::new(()),
        }
    }

    /// Create a limiter; the name must be unused
    pub async fn create(&self, config: RateLimiterConfig) -> Result<Response, AdminError> {
        if config.name.trim().is_empty() {
            return Err(AdminError::Invalid("name is required".to_string()));
        }
        let limiter = build(&config)?;

        let _guard = self.write_lock.lock().await;
        let name = config.name.clone();
        if self.registry.rate_limiters().is_registered(&name) {
            return Err(AdminError::Duplicate(name));
        }

        self.store.publish(|global| {
            if global.limiter(&name).is_some() {
                return Err(AdminError::Duplicate(name.clone()));
            }
            global.limiters.push(config);
            Ok(())
        })?;

        self.registry
            .rate_limiters()
            .register(&name, limiter)
            .map_err(|_| AdminError::Duplicate(name.clone()))?;

        info!(name = %name, version = self.store.version(), "Rate limiter created");
        Ok(Response::ok())
    }

    /// Replace an existing limiter; its state starts fresh
    pub async fn update(
        &self,
        name: &str,
        mut config: RateLimiterConfig,
    ) -> Result<Response, AdminError> {
        config.name = name.to_string();
        let limiter = build(&config)?;

        let _guard = self.write_lock.lock().await;
        if !self.registry.rate_limiters().is_registered(name) {
            return Err(AdminError::NotFound(name.to_string()));
        }

        self.store.publish(|global| {
            match global.limiters.iter_mut().find(|l| l.name == name) {
                Some(existing) => *existing = config,
                None => global.limiters.push(config),
            }
            Ok::<_, AdminError>(())
        })?;

        self.registry
            .rate_limiters()
            .replace(name, limiter)
            .map_err(|_| AdminError::NotFound(name.to_string()))?;

        info!(name = %name, version = self.store.version(), "Rate limiter updated");
        Ok(Response::ok())
    }

    /// Remove a limiter
    pub async fn delete(&self, name: &str) -> Result<Response, AdminError> {
        let _guard = self.write_lock.lock().await;
        if !self.registry.rate_limiters().is_registered(name) {
            return Err(AdminError::NotFound(name.to_string()));
        }

        self.store.publish(|global| {
            global.limiters.retain(|l| l.name != name);
            Ok::<_, AdminError>(())
        })?;

        self.registry
            .rate_limiters()
            .unregister(name)
            .map_err(|_| AdminError::NotFound(name.to_string()))?;

        info!(name = %name, version = self.store.version(), "Rate limiter deleted");
        Ok(Response::ok())
    }
}

fn build(config: &RateLimiterConfig) -> Result<Arc<dyn RateLimiter>, AdminError> {
    TokenBucketLimiter::new(config.clone())
        .map(|limiter| Arc::new(limiter) as Arc<dyn RateLimiter>)
        .map_err(|e| {
            warn!(name = %config.name, error = %e, "Rejected rate limiter config");
            AdminError::Invalid(e.to_string())
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::GlobalConfig;

    fn config(name: &str) -> RateLimiterConfig {
        RateLimiterConfig {
            name: name.to_string(),
            requests_per_minute: 60,
            burst_size: 5,
            bucket_ttl_seconds: 300,
            max_buckets: 100,
        }
    }

    fn admin() -> RateLimiterAdmin {
        RateLimiterAdmin::new(
            Arc::new(Registry::new()),
            Arc::new(ConfigStore::new(GlobalConfig::default())),
        )
    }

    #[test]
    fn test_envelopes_serialize() {
        assert_eq!(
            serde_json::to_string(&Response::ok()).unwrap(),
            r#"{"msg":"OK"}"#
        );

        let err = AdminError::NotFound("x".to_string());
        let body = serde_json::to_value(err.to_response()).unwrap();
        assert_eq!(body["code"], 40004);
        assert_eq!(err.status(), 404);
    }

    #[tokio::test]
    async fn test_create_requires_name() {
        let admin = admin();
        let err = admin.create(config("")).await.unwrap_err();
        assert!(matches!(err, AdminError::Invalid(_)));
        assert_eq!(err.code(), 40001);
    }

    #[tokio::test]
    async fn test_invalid_config_changes_nothing() {
        let admin = admin();
        let mut bad = config("bad");
        bad.burst_size = 0;

        assert!(matches!(
            admin.create(bad).await,
            Err(AdminError::Invalid(_))
        ));
        assert_eq!(admin.store.version(), 0);
        assert!(admin.registry.rate_limiters().is_empty());
    }

    #[tokio::test]
    async fn test_update_keeps_list_consistent() {
        let admin = admin();
        admin.create(config("a")).await.unwrap();

        let mut changed = config("ignored");
        changed.burst_size = 50;
        admin.update("a", changed).await.unwrap();

        let snapshot = admin.store.snapshot();
        assert_eq!(snapshot.config.limiters.len(), 1);
        assert_eq!(snapshot.config.limiter("a").unwrap().burst_size, 50);
        assert_eq!(snapshot.version, 2);
    }
}
