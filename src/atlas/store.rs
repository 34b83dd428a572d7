//! Atlas store
//!
//! Owns loaded atlases for the lifetime of a load generation and projects
//! them into resolutions: context blocks under a token budget, action
//! permissions under a risk ceiling, and composed policy outcomes.
//!
//! The atlas map is swapped atomically on (re)load; readers holding the
//! prior snapshot continue against it. Cache entries expire after a
//! configurable TTL and are pruned on access.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::carp::{ActionPermission, ContextBlock, PolicyApplication, RiskTier};
use crate::error::{Result, WardenError};
use crate::ident::{sha256_hex, IdSource, UuidV7Source};
use crate::timing::{Clock, SystemClock};

use super::loader::{AtlasLoader, LoadedAtlas};
use super::manifest::{PolicyEffect, PolicyRule};
use super::policy::{evaluate_condition, PolicyContext, PolicyOutcome};

/// How long an action permission stays valid after projection
const ACTION_VALIDITY: Duration = Duration::from_secs(300);

/// Store configuration
#[derive(Debug, Clone)]
pub struct AtlasStoreConfig {
    /// Cache entry TTL; expired entries are pruned on access
    pub cache_ttl: Duration,
}

impl Default for AtlasStoreConfig {
    fn default() -> Self {
        Self {
            cache_ttl: Duration::from_secs(600),
        }
    }
}

impl AtlasStoreConfig {
    /// Set the cache TTL
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = ttl;
        self
    }
}

/// Context selection query
#[derive(Debug, Clone, Default)]
pub struct ContextQuery {
    /// Domain filter; empty matches all
    pub domains: Vec<String>,

    /// Tag filter; any overlap counts, empty matches all
    pub tags: Vec<String>,

    /// Token budget
    pub max_tokens: u64,
}

/// Action projection query
#[derive(Debug, Clone, Default)]
pub struct ActionQuery {
    /// Domain filter; empty matches all
    pub domains: Vec<String>,

    /// Risk ceiling: include actions at or below this tier
    pub risk_tier: Option<RiskTier>,

    /// Explicit action-type allow list; empty matches all
    pub action_types: Vec<String>,
}

/// Tokens estimated as `ceil(byte_length / 4)`
pub fn estimate_tokens(byte_length: usize) -> u64 {
    ((byte_length + 3) / 4) as u64
}

/// A cached atlas with its expiry
#[derive(Debug, Clone)]
pub struct CachedAtlas {
    /// The loaded atlas
    pub atlas: Arc<LoadedAtlas>,
    /// When the cache entry lapses
    pub expires_at: DateTime<Utc>,
}

/// One load generation of the atlas map
pub type AtlasMap = HashMap<String, CachedAtlas>;

/// Owner of loaded atlases and the projection operations over them
pub struct AtlasStore {
    atlases: RwLock<Arc<AtlasMap>>,
    loader: AtlasLoader,
    config: AtlasStoreConfig,
    clock: Arc<dyn Clock>,
    ids: Arc<dyn IdSource>,
}

impl AtlasStore {
    /// Create a store with default configuration
    pub fn new() -> Self {
        Self::with_parts(
            AtlasStoreConfig::default(),
            Arc::new(SystemClock),
            Arc::new(UuidV7Source),
        )
    }

    /// Create a store with explicit configuration
    pub fn with_config(config: AtlasStoreConfig) -> Self {
        Self::with_parts(config, Arc::new(SystemClock), Arc::new(UuidV7Source))
    }

    /// Create a store with injected clock and identifier source
    pub fn with_parts(
        config: AtlasStoreConfig,
        clock: Arc<dyn Clock>,
        ids: Arc<dyn IdSource>,
    ) -> Self {
        Self {
            atlases: RwLock::new(Arc::new(HashMap::new())),
            loader: AtlasLoader::new().with_clock(clock.clone()),
            config,
            clock,
            ids,
        }
    }

    // ---- loading and the cache ------------------------------------------

    /// Load an atlas package directory and cache it
    pub fn load<P: AsRef<Path>>(&self, path: P) -> Result<Arc<LoadedAtlas>> {
        let atlas = self.loader.load_from_directory(path)?;
        Ok(self.insert(atlas))
    }

    /// Insert an already-loaded atlas, swapping the map atomically
    pub fn insert(&self, atlas: LoadedAtlas) -> Arc<LoadedAtlas> {
        let atlas = Arc::new(atlas);
        let entry = CachedAtlas {
            atlas: atlas.clone(),
            expires_at: self.clock.now()
                + chrono::Duration::from_std(self.config.cache_ttl)
                    .unwrap_or_else(|_| chrono::Duration::seconds(600)),
        };
        self.swap_map(|map| {
            map.insert(atlas.atlas_ref.clone(), entry.clone());
        });
        atlas
    }

    /// Current snapshot after pruning expired entries
    ///
    /// In-flight readers of a previous snapshot are unaffected.
    pub fn snapshot(&self) -> Arc<AtlasMap> {
        self.prune_cache();
        self.atlases
            .read()
            .map(|map| map.clone())
            .unwrap_or_else(|_| Arc::new(HashMap::new()))
    }

    /// Look up an atlas by `id@version` or by `id` prefix
    pub fn get(&self, reference: &str) -> Option<Arc<LoadedAtlas>> {
        let snapshot = self.snapshot();
        if let Some(entry) = snapshot.get(reference) {
            return Some(entry.atlas.clone());
        }
        snapshot
            .values()
            .find(|entry| ref_matches(&entry.atlas.atlas_ref, reference))
            .map(|entry| entry.atlas.clone())
    }

    /// Every loaded atlas, in stable reference order
    pub fn list(&self) -> Vec<Arc<LoadedAtlas>> {
        let snapshot = self.snapshot();
        let mut atlases: Vec<Arc<LoadedAtlas>> =
            snapshot.values().map(|e| e.atlas.clone()).collect();
        atlases.sort_by(|a, b| a.atlas_ref.cmp(&b.atlas_ref));
        atlases
    }

    /// Loaded atlas count (after pruning)
    pub fn len(&self) -> usize {
        self.snapshot().len()
    }

    /// Whether no atlases are loaded
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop every cached atlas
    pub fn clear_cache(&self) {
        self.swap_map(|map| map.clear());
    }

    /// Drop expired cache entries
    pub fn prune_cache(&self) {
        let now = self.clock.now();
        let expired = {
            let map = match self.atlases.read() {
                Ok(map) => map,
                Err(_) => return,
            };
            map.values().any(|entry| entry.expires_at <= now)
        };
        if expired {
            self.swap_map(|map| map.retain(|_, entry| entry.expires_at > now));
        }
    }

    fn swap_map(&self, mutate: impl FnOnce(&mut AtlasMap)) {
        if let Ok(mut guard) = self.atlases.write() {
            let mut next: AtlasMap = (**guard).clone();
            mutate(&mut next);
            *guard = Arc::new(next);
        }
    }

    // ---- projections ----------------------------------------------------

    /// Select context blocks from one atlas under a token budget
    ///
    /// Candidates are filtered by domain and tag, sorted by priority
    /// descending (pack id ascending on ties), and accumulated greedily;
    /// selection stops at the first block that would exceed the budget.
    pub fn get_context_blocks(&self, atlas: &LoadedAtlas, query: &ContextQuery) -> Vec<ContextBlock> {
        let mut candidates: Vec<_> = atlas
            .manifest
            .context_packs
            .iter()
            .filter(|pack| query.domains.is_empty() || query.domains.contains(&pack.domain))
            .filter(|pack| {
                query.tags.is_empty() || pack.tags.iter().any(|tag| query.tags.contains(tag))
            })
            .filter_map(|pack| atlas.pack_content(&pack.id).map(|content| (pack, content)))
            .collect();

        candidates.sort_by(|(a, _), (b, _)| {
            b.priority.cmp(&a.priority).then_with(|| a.id.cmp(&b.id))
        });

        let mut blocks = Vec::new();
        let mut total = 0u64;
        for (pack, content) in candidates {
            let token_count = estimate_tokens(content.len());
            if total + token_count > query.max_tokens {
                break;
            }
            total += token_count;
            blocks.push(ContextBlock {
                block_id: self.ids.next_id(),
                content_hash: sha256_hex(content.as_bytes()),
                atlas_ref: atlas.atlas_ref.clone(),
                pack_ref: pack.id.clone(),
                domain: pack.domain.clone(),
                content_type: pack.content_type,
                content: content.to_string(),
                token_count,
                ttl_seconds: pack.ttl_seconds,
                priority: pack.priority,
                tags: pack.tags.clone(),
                evidence_refs: vec![],
                redactions: None,
            });
        }
        blocks
    }

    /// Project action permissions from one atlas
    ///
    /// The query's risk tier is a ceiling: actions whose tier index exceeds
    /// it are excluded. High and critical actions come back flagged
    /// `requires_approval`; permissions are valid for five minutes.
    pub fn get_action_permissions(
        &self,
        atlas: &LoadedAtlas,
        query: &ActionQuery,
    ) -> Vec<ActionPermission> {
        let valid_until = self.clock.now()
            + chrono::Duration::from_std(ACTION_VALIDITY)
                .unwrap_or_else(|_| chrono::Duration::seconds(300));

        atlas
            .manifest
            .actions
            .iter()
            .filter(|action| query.domains.is_empty() || query.domains.contains(&action.domain))
            .filter(|action| {
                query.action_types.is_empty()
                    || query.action_types.contains(&action.action_type)
            })
            .filter(|action| match query.risk_tier {
                Some(ceiling) => action.risk_tier.index() <= ceiling.index(),
                None => true,
            })
            .map(|action| ActionPermission {
                action_id: action.id.clone(),
                action_type: action.action_type.clone(),
                name: action.name.clone(),
                description: action.description.clone(),
                parameters_schema: action.parameters_schema.clone(),
                examples: action.examples.clone(),
                constraints: action.constraints.clone(),
                parameter_constraints: action.parameter_constraints.clone(),
                requires_approval: action.risk_tier.requires_approval(),
                risk_tier: action.risk_tier,
                rate_limit: action.rate_limit,
                source_atlas: atlas.atlas_ref.clone(),
                valid_until,
            })
            .collect()
    }

    /// Evaluate one atlas's policies against a context
    ///
    /// Rules are evaluated by descending priority (declaration order on
    /// ties); every match is recorded. A rule whose condition is malformed
    /// is skipped with a warning and never fails the evaluation.
    pub fn evaluate_policies(&self, atlas: &LoadedAtlas, ctx: &PolicyContext) -> PolicyOutcome {
        let mut outcome = PolicyOutcome::default();

        for policy in &atlas.manifest.policies {
            let mut rules: Vec<&PolicyRule> = policy.rules.iter().collect();
            rules.sort_by(|a, b| b.priority.cmp(&a.priority));

            for rule in rules {
                match evaluate_condition(&rule.condition, ctx) {
                    Ok(false) => continue,
                    Ok(true) => {
                        outcome.matched_rules.push(PolicyApplication {
                            policy_id: policy.id.clone(),
                            rule_id: rule.id.clone(),
                            atlas_ref: atlas.atlas_ref.clone(),
                            effect: rule.effect,
                            priority: rule.priority,
                            message: rule.message.clone(),
                        });
                        match rule.effect {
                            PolicyEffect::Deny => outcome.allowed = false,
                            PolicyEffect::RequireApproval => outcome.requires_approval = true,
                            PolicyEffect::Redact => {
                                outcome.redactions.push(format!("{}/{}", policy.id, rule.id));
                            }
                            PolicyEffect::Allow | PolicyEffect::Constrain => {}
                        }
                    }
                    Err(reason) => {
                        tracing::warn!(
                            policy = %policy.id,
                            rule = %rule.id,
                            "skipping rule with malformed condition: {}",
                            reason
                        );
                    }
                }
            }
        }

        outcome
    }
}

impl Default for AtlasStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Whether `atlas_ref` (`id@version`) matches a caller-supplied reference:
/// exact, or a prefix up to the `@`
pub fn ref_matches(atlas_ref: &str, reference: &str) -> bool {
    if atlas_ref == reference {
        return true;
    }
    atlas_ref
        .strip_prefix(reference)
        .map(|rest| rest.starts_with('@'))
        .unwrap_or(false)
}
