//! Leaf Certificate Cache
//!
//! Maps hostnames to minted leaf certificates. Entries live until the cache
//! is dropped with its policy snapshot; there is no TTL since leaves are only
//! signed identities.
//!
//! Minting is single-flight per hostname: the map lock guards only the lookup
//! of a per-host `OnceCell`, and every concurrent caller for the same host
//! awaits that cell, so exactly one CA signature is produced per host.

use super::ca::{CaKeyPair, HostIdentifier, LeafCertificate};
use super::error::{MitmError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::debug;

type Slot = Arc<OnceCell<Arc<LeafCertificate>>>;

/// Hostname -> leaf certificate cache with in-flight coordination
pub struct LeafCertCache {
    ca: Arc<CaKeyPair>,
    slots: Mutex<HashMap<String, Slot>>,
    hits: AtomicU64,
    mints: AtomicU64,
}

impl LeafCertCache {
    /// Create an empty cache signing with `ca`
    pub fn new(ca: Arc<CaKeyPair>) -> Self {
        Self {
            ca,
            slots: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            mints: AtomicU64::new(0),
        }
    }

    /// CA used to sign leaves
    pub fn ca(&self) -> &Arc<CaKeyPair> {
        &self.ca
    }

    /// Return the cached leaf for `host`, minting it on first use
    pub async fn get_or_mint(&self, host: &str) -> Result<Arc<LeafCertificate>> {
        let id = HostIdentifier::from_hostname(host)?;
        let key = id.name();

        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(slots.entry(key.clone()).or_default())
        };

        if let Some(leaf) = slot.get() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            debug!(host = %key, "Leaf certificate cache hit");
            return Ok(Arc::clone(leaf));
        }

        let minted = slot
            .get_or_try_init(|| async {
                let ca = Arc::clone(&self.ca);
                let host = key.clone();
                let leaf = tokio::task::spawn_blocking(move || ca.sign(&id))
                    .await
                    .map_err(|_| MitmError::MintAborted(host))??;
                self.mints.fetch_add(1, Ordering::Relaxed);
                Ok::<_, MitmError>(Arc::new(leaf))
            })
            .await;

        match minted {
            Ok(leaf) => Ok(Arc::clone(leaf)),
            Err(e) => {
                self.forget_failed(&key, &slot);
                Err(e)
            }
        }
    }

    /// Remove the in-flight marker left by a failed mint
    fn forget_failed(&self, key: &str, slot: &Slot) {
        let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slots.get(key) {
            if Arc::ptr_eq(current, slot) && !current.initialized() {
                slots.remove(key);
            }
        }
    }

    /// Number of hosts with a minted certificate
    pub fn len(&self) -> usize {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .filter(|slot| slot.initialized())
            .count()
    }

    /// Check if the cache holds no certificates
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of lookups served from the cache
    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    /// Number of certificates signed by the CA
    pub fn mints(&self) -> u64 {
        self.mints.load(Ordering::Relaxed)
    }

    /// Drop every cached certificate
    pub fn clear(&self) {
        self.slots
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache() -> LeafCertCache {
        LeafCertCache::new(Arc::new(CaKeyPair::generate("Cache Test CA").unwrap()))
    }

    #[tokio::test]
    async fn test_cache_mint_and_hit() {
        let cache = cache();

        let first = cache.get_or_mint("example.com").await.unwrap();
        let second = cache.get_or_mint("example.com").await.unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.mints(), 1);
        assert_eq!(cache.hits(), 1);
    }

    #[tokio::test]
    async fn test_cache_normalizes_hostnames() {
        let cache = cache();

        let a = cache.get_or_mint("Example.com").await.unwrap();
        let b = cache.get_or_mint("example.com.").await.unwrap();

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(cache.mints(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_first_use_mints_once() {
        let cache = Arc::new(cache());

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let cache = Arc::clone(&cache);
                tokio::spawn(async move { cache.get_or_mint("race.example.com").await.unwrap() })
            })
            .collect();

        let mut leaves = Vec::new();
        for handle in handles {
            leaves.push(handle.await.unwrap());
        }

        for leaf in &leaves[1..] {
            assert_eq!(leaf.cert_der().as_ref(), leaves[0].cert_der().as_ref());
        }
        assert_eq!(cache.mints(), 1);
    }

    #[tokio::test]
    async fn test_cache_clear() {
        let cache = cache();
        cache.get_or_mint("a.example.com").await.unwrap();
        cache.get_or_mint("b.example.com").await.unwrap();
        assert_eq!(cache.len(), 2);

        cache.clear();
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_host_is_rejected() {
        let cache = cache();
        assert!(matches!(
            cache.get_or_mint("").await,
            Err(MitmError::InvalidHost(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_mint_leaves_no_slot() {
        let cache = cache();

        // Not representable as an IA5 DNS name
        let err = cache.get_or_mint("bücher.example").await.unwrap_err();
        assert!(matches!(err, MitmError::InvalidHost(_)));
        assert!(cache.slots.lock().unwrap().is_empty());
        assert_eq!(cache.mints(), 0);

        cache.get_or_mint("buecher.example").await.unwrap();
        assert_eq!(cache.len(), 1);
    }
}
