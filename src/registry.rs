//! Named object registry
//!
//! An explicit registry value, built once at startup and passed to whatever
//! needs lookups (policy resolution, admin CRUD). There is no global
//! instance.

use crate::mitm::{BypassEvaluator, StaticBypass};
use crate::rate_limiter::{RateLimitError, RateLimiter, TokenBucketLimiter};
use crate::store::GlobalConfig;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("{kind} {name:?} already registered")]
    Duplicate { kind: &'static str, name: String },

    #[error("{kind} {name:?} not registered")]
    NotFound { kind: &'static str, name: String },

    #[error(transparent)]
    RateLimit(#[from] RateLimitError),
}

/// Name -> shared object map
pub struct NamedRegistry<T: ?Sized> {
    kind: &'static str,
    items: DashMap<String, Arc<T>>,
}

impl<T: ?Sized + Send + Sync> NamedRegistry<T> {
    pub fn new(kind: &'static str) -> Self {
        Self {
            kind,
            items: DashMap::new(),
        }
    }

    /// Add a new object; fails if the name is taken
    pub fn register(&self, name: &str, item: Arc<T>) -> Result<(), RegistryError> {
        match self.items.entry(name.to_string()) {
            Entry::Occupied(_) => Err(RegistryError::Duplicate {
                kind: self.kind,
                name: name.to_string(),
            }),
            Entry::Vacant(entry) => {
                entry.insert(item);
                debug!(kind = self.kind, name = %name, "Registered");
                Ok(())
            }
        }
    }

    /// Swap the object behind an existing name
    pub fn replace(&self, name: &str, item: Arc<T>) -> Result<Arc<T>, RegistryError> {
        match self.items.get_mut(name) {
            Some(mut entry) => Ok(std::mem::replace(entry.value_mut(), item)),
            None => Err(self.not_found(name)),
        }
    }

    /// Remove an object
    pub fn unregister(&self, name: &str) -> Result<Arc<T>, RegistryError> {
        self.items
            .remove(name)
            .map(|(_, item)| item)
            .ok_or_else(|| self.not_found(name))
    }

    pub fn get(&self, name: &str) -> Option<Arc<T>> {
        self.items.get(name).map(|entry| Arc::clone(entry.value()))
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.items.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.items.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn not_found(&self, name: &str) -> RegistryError {
        RegistryError::NotFound {
            kind: self.kind,
            name: name.to_string(),
        }
    }
}

/// All named objects a policy may reference
pub struct Registry {
    bypasses: NamedRegistry<dyn BypassEvaluator>,
    rate_limiters: NamedRegistry<dyn RateLimiter>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            bypasses: NamedRegistry::new("bypass"),
            rate_limiters: NamedRegistry::new("rate limiter"),
        }
    }

    /// Build every object listed in `config`
    pub fn from_config(config: &GlobalConfig) -> Result<Self, RegistryError> {
        let registry = Self::new();

        for bypass in &config.bypasses {
            registry
                .bypasses
                .register(&bypass.name, Arc::new(StaticBypass::new(bypass)))?;
        }
        for limiter in &config.limiters {
            registry
                .rate_limiters
                .register(&limiter.name, Arc::new(TokenBucketLimiter::new(limiter.clone())?))?;
        }

        info!(
            bypasses = registry.bypasses.len(),
            rate_limiters = registry.rate_limiters.len(),
            "Registry loaded"
        );
        Ok(registry)
    }

    pub fn bypasses(&self) -> &NamedRegistry<dyn BypassEvaluator> {
        &self.bypasses
    }

    pub fn rate_limiters(&self) -> &NamedRegistry<dyn RateLimiter> {
        &self.rate_limiters
    }

    /// Look up a bypass evaluator by name
    pub fn bypass(&self, name: &str) -> Option<Arc<dyn BypassEvaluator>> {
        self.bypasses.get(name)
    }

    /// Look up a rate limiter by name
    pub fn rate_limiter(&self, name: &str) -> Option<Arc<dyn RateLimiter>> {
        self.rate_limiters.get(name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
