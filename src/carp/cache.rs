//! Resolution cache
//!
//! Keyed by the request fingerprint `(goal_hash, agent_id, canonical
//! scope)`. Entries expire with their resolution; expired entries are
//! removed lazily on access and periodically by the sweeper. The cache is
//! bounded, evicting the least recently used entry when full.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::ident::sha256_hex;
use crate::timing::Clock;

use super::request::RequestScope;
use super::resolution::Resolution;

/// Cache configuration
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum entries; LRU eviction beyond this
    pub max_entries: usize,

    /// Sweeper wake interval
    pub sweep_interval: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 256,
            sweep_interval: Duration::from_secs(30),
        }
    }
}

impl CacheConfig {
    /// Set the entry bound
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = max.max(1);
        self
    }
}

/// Cache key: the request fingerprint
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    fingerprint: String,
}

impl CacheKey {
    /// Build a key from the goal hash, the agent, and the canonical scope
    pub fn new(goal_hash: &str, agent_id: &str, scope: Option<&RequestScope>) -> Self {
        let scope_canonical = scope
            .map(RequestScope::canonical)
            .unwrap_or_else(|| "{}".to_string());
        Self {
            fingerprint: sha256_hex(
                format!("{}\n{}\n{}", goal_hash, agent_id, scope_canonical).as_bytes(),
            ),
        }
    }

    /// The fingerprint string
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    resolution: Arc<Resolution>,
    expires_at: DateTime<Utc>,
    last_used: DateTime<Utc>,
}

/// Bounded TTL cache of resolutions
pub struct ResolutionCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    config: CacheConfig,
}

impl ResolutionCache {
    /// Create a cache with default configuration
    pub fn new() -> Self {
        Self::with_config(CacheConfig::default())
    }

    /// Create a cache with explicit configuration
    pub fn with_config(config: CacheConfig) -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            config,
        }
    }

    /// Fetch a non-expired resolution; expired entries are removed
    pub fn get(&self, key: &CacheKey, now: DateTime<Utc>) -> Option<Arc<Resolution>> {
        let mut entries = self.entries.write().ok()?;
        match entries.get_mut(key.fingerprint()) {
            Some(entry) if entry.expires_at > now => {
                entry.last_used = now;
                Some(entry.resolution.clone())
            }
            Some(_) => {
                entries.remove(key.fingerprint());
                None
            }
            None => None,
        }
    }

    /// Insert a resolution; last writer wins on identical keys
    pub fn insert(&self, key: CacheKey, resolution: Resolution, now: DateTime<Utc>) {
        let Ok(mut entries) = self.entries.write() else {
            return;
        };
        if entries.len() >= self.config.max_entries
            && !entries.contains_key(key.fingerprint())
        {
            // Evict the least recently used entry
            if let Some(oldest) = entries
                .iter()
                .min_by_key(|(_, e)| e.last_used)
                .map(|(k, _)| k.clone())
            {
                entries.remove(&oldest);
            }
        }
        let expires_at = resolution.ttl.resolution_expires_at;
        entries.insert(
            key.fingerprint().to_string(),
            CacheEntry {
                resolution: Arc::new(resolution),
                expires_at,
                last_used: now,
            },
        );
    }

    /// Remove every entry whose resolution references `atlas_ref`
    pub fn invalidate_atlas(&self, atlas_ref: &str) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|_, entry| !entry.resolution.references_atlas(atlas_ref));
        }
    }

    /// Remove expired entries
    pub fn sweep(&self, now: DateTime<Utc>) {
        if let Ok(mut entries) = self.entries.write() {
            entries.retain(|_, entry| entry.expires_at > now);
        }
    }

    /// Current entry count
    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every entry
    pub fn clear(&self) {
        if let Ok(mut entries) = self.entries.write() {
            entries.clear();
        }
    }

    /// Start a background sweeper over this cache
    pub fn start_sweeper(cache: Arc<Self>, clock: Arc<dyn Clock>) -> SweeperHandle {
        let shutdown = Arc::new(AtomicBool::new(false));
        let interval = cache.config.sweep_interval;
        let worker_shutdown = shutdown.clone();

        let handle = std::thread::spawn(move || {
            while !worker_shutdown.load(Ordering::Relaxed) {
                std::thread::sleep(interval);
                cache.sweep(clock.now());
            }
        });

        SweeperHandle {
            shutdown,
            handle: Some(handle),
        }
    }
}

impl Default for ResolutionCache {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running cache sweeper
pub struct SweeperHandle {
    shutdown: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl SweeperHandle {
    /// Stop the sweeper
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Relaxed);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}
