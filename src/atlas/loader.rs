//! Atlas loading
//!
//! Loads an atlas package from a directory: the `atlas.json` or
//! `atlas.yaml` manifest plus every context pack file it references, read
//! as UTF-8 and held in memory for the lifetime of the load. Pack sources
//! must resolve inside the atlas base directory.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::error::{Result, WardenError};
use crate::timing::{Clock, SystemClock};

use super::manifest::AtlasManifest;
use super::validator::{AtlasValidator, IssueSeverity};

/// An atlas held in memory: manifest, pack contents, adapter configs
#[derive(Debug, Clone)]
pub struct LoadedAtlas {
    /// The validated manifest
    pub manifest: AtlasManifest,

    /// `id@version`
    pub atlas_ref: String,

    /// Pack contents, `pack_id -> bytes` (UTF-8)
    pub content: HashMap<String, String>,

    /// Adapter configuration blobs
    pub adapters: HashMap<String, Value>,

    /// Directory the atlas was loaded from, if file-backed
    pub source_path: Option<PathBuf>,

    /// When the load happened
    pub loaded_at: DateTime<Utc>,
}

impl LoadedAtlas {
    /// Build an in-memory atlas from parts (no filesystem involved)
    pub fn from_parts(
        manifest: AtlasManifest,
        content: HashMap<String, String>,
        loaded_at: DateTime<Utc>,
    ) -> Self {
        let atlas_ref = manifest.atlas_ref();
        let adapters = manifest.adapters.clone();
        Self {
            manifest,
            atlas_ref,
            content,
            adapters,
            source_path: None,
            loaded_at,
        }
    }

    /// Content of a pack, if loaded
    pub fn pack_content(&self, pack_id: &str) -> Option<&str> {
        self.content.get(pack_id).map(String::as_str)
    }
}

/// Loads atlas packages from disk or memory
pub struct AtlasLoader {
    validate_on_load: bool,
    clock: Arc<dyn Clock>,
}

impl Default for AtlasLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl AtlasLoader {
    /// Create a loader that validates on load
    pub fn new() -> Self {
        Self {
            validate_on_load: true,
            clock: Arc::new(SystemClock),
        }
    }

    /// Skip validation (trusted packages only)
    pub fn skip_validation(mut self) -> Self {
        self.validate_on_load = false;
        self
    }

    /// Use a specific clock for load timestamps
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Load an atlas package directory
    ///
    /// The directory must contain `atlas.json` or `atlas.yaml` at its root.
    /// Any error-severity validation issue fails the load atomically; pack
    /// file handles are released before this returns.
    pub fn load_from_directory<P: AsRef<Path>>(&self, path: P) -> Result<LoadedAtlas> {
        let path = path.as_ref();
        if !path.is_dir() {
            return Err(WardenError::AtlasLoad {
                path: path.display().to_string(),
                reason: "not a directory".to_string(),
            });
        }

        let manifest = self.read_manifest(path)?;
        self.check(&manifest)?;

        let base = path.canonicalize().map_err(|e| WardenError::AtlasLoad {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let mut content = HashMap::new();
        for pack in &manifest.context_packs {
            let source = base.join(&pack.source);
            let resolved = source.canonicalize().map_err(|e| WardenError::AtlasLoad {
                path: source.display().to_string(),
                reason: format!("pack {}: {}", pack.id, e),
            })?;
            if !resolved.starts_with(&base) {
                return Err(WardenError::AtlasLoad {
                    path: pack.source.clone(),
                    reason: format!("pack {} resolves outside the atlas root", pack.id),
                });
            }
            let bytes = fs::read_to_string(&resolved).map_err(|e| WardenError::AtlasLoad {
                path: resolved.display().to_string(),
                reason: format!("pack {}: {}", pack.id, e),
            })?;
            content.insert(pack.id.clone(), bytes);
        }

        let mut atlas = LoadedAtlas::from_parts(manifest, content, self.clock.now());
        atlas.source_path = Some(path.to_path_buf());
        Ok(atlas)
    }

    /// Load an atlas from an in-memory manifest and pack map
    pub fn load_from_manifest(
        &self,
        manifest: AtlasManifest,
        content: HashMap<String, String>,
    ) -> Result<LoadedAtlas> {
        self.check(&manifest)?;
        for pack in &manifest.context_packs {
            if !content.contains_key(&pack.id) {
                return Err(WardenError::AtlasLoad {
                    path: pack.source.clone(),
                    reason: format!("pack {} has no content", pack.id),
                });
            }
        }
        Ok(LoadedAtlas::from_parts(manifest, content, self.clock.now()))
    }

    fn read_manifest(&self, dir: &Path) -> Result<AtlasManifest> {
        let json_path = dir.join("atlas.json");
        let yaml_path = dir.join("atlas.yaml");

        if json_path.is_file() {
            let text = fs::read_to_string(&json_path)?;
            serde_json::from_str(&text).map_err(|e| WardenError::InvalidManifest {
                reason: format!("{}: {}", json_path.display(), e),
            })
        } else if yaml_path.is_file() {
            let text = fs::read_to_string(&yaml_path)?;
            serde_yaml::from_str(&text).map_err(|e| WardenError::InvalidManifest {
                reason: format!("{}: {}", yaml_path.display(), e),
            })
        } else {
            Err(WardenError::AtlasLoad {
                path: dir.display().to_string(),
                reason: "no atlas.json or atlas.yaml at package root".to_string(),
            })
        }
    }

    fn check(&self, manifest: &AtlasManifest) -> Result<()> {
        if !self.validate_on_load {
            return Ok(());
        }
        let report = AtlasValidator::validate(manifest);
        for issue in &report.issues {
            if issue.severity == IssueSeverity::Warning {
                tracing::warn!(path = %issue.path, "{}", issue.message);
            }
        }
        if !report.is_valid() {
            return Err(WardenError::InvalidManifest {
                reason: report.error_summary(),
            });
        }
        Ok(())
    }
}
