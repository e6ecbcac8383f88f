//! Cache configuration with environment and file-based loading, plus a
//! process-wide instance cache.
//!
//! Environment variables:
//! - `CAS_PATH`: cache directory
//! - `CAS_SIZE_LIMIT`: advisory size limit in bytes
//! - `CAS_FAULT_IN`: `full-tree` or `single-node`
//!
//! Default path: `~/.cache/cas`
//!
//! Opening the same directory twice in one process returns the same store
//! instance. `freeze()` additionally pins the constructed store to the
//! options value and wipes the visible settings, so code handed a frozen
//! `CasOptions` can use the store but cannot learn or change where it
//! lives.

use std::collections::HashMap;
use std::env;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, OnceLock};

use anyhow::{bail, Context, Result};
use cas_ondisk::FaultInPolicy;
use serde::Deserialize;
use tracing::debug;

use crate::ondisk::OnDiskStore;

/// Settings that identify one cache directory configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CasSettings {
    path: PathBuf,
    size_limit: Option<u64>,
    policy: FaultInPolicy,
}

/// Configuration for content-addressable storage.
#[derive(Clone)]
pub struct CasOptions {
    /// Cache directory. Objects, key bindings, and lock files all live
    /// under this path.
    pub path: PathBuf,

    /// Advisory size limit in bytes; exceeding it schedules garbage
    /// collection rather than failing writes.
    pub size_limit: Option<u64>,

    /// How aggressively to copy data in from an upstream generation.
    pub policy: FaultInPolicy,

    frozen: Option<Arc<OnDiskStore>>,
}

impl std::fmt::Debug for CasOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CasOptions")
            .field("path", &self.path)
            .field("size_limit", &self.size_limit)
            .field("policy", &self.policy)
            .field("frozen", &self.frozen.is_some())
            .finish()
    }
}

impl Default for CasOptions {
    fn default() -> Self {
        Self {
            path: default_cas_path(),
            size_limit: None,
            policy: FaultInPolicy::default(),
            frozen: None,
        }
    }
}

/// Get the default cache path (~/.cache/cas).
fn default_cas_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| dirs.cache_dir().join("cas"))
        .unwrap_or_else(|| PathBuf::from(".cas"))
}

fn parse_policy(value: &str) -> Result<FaultInPolicy> {
    match value {
        "full-tree" => Ok(FaultInPolicy::FullTree),
        "single-node" => Ok(FaultInPolicy::SingleNode),
        other => bail!("unknown fault-in policy: {other}"),
    }
}

impl CasOptions {
    /// Load configuration from environment variables, falling back to
    /// defaults.
    pub fn from_env() -> Result<Self> {
        let mut options = Self::default();
        if let Ok(path) = env::var("CAS_PATH") {
            options.path = PathBuf::from(path);
        }
        if let Ok(limit) = env::var("CAS_SIZE_LIMIT") {
            let limit: u64 = limit
                .parse()
                .context("failed to parse CAS_SIZE_LIMIT as bytes")?;
            options.size_limit = Some(limit);
        }
        if let Ok(policy) = env::var("CAS_FAULT_IN") {
            options.policy = parse_policy(&policy)?;
        }
        Ok(options)
    }

    /// Load configuration from a TOML file's `[cas]` section, falling back
    /// to the environment when the section is absent.
    ///
    /// ```toml
    /// [cas]
    /// path = "/tank/build/cas"
    /// size_limit = 10737418240
    /// policy = "full-tree"
    /// ```
    pub fn from_file(path: &Path) -> Result<Self> {
        #[derive(Deserialize)]
        struct CasSection {
            path: Option<PathBuf>,
            size_limit: Option<u64>,
            policy: Option<FaultInPolicy>,
        }

        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let table: toml::Table = contents
            .parse()
            .with_context(|| format!("failed to parse TOML: {}", path.display()))?;

        let Some(section) = table.get("cas") else {
            return Self::from_env();
        };
        let section: CasSection = section
            .clone()
            .try_into()
            .context("failed to parse [cas] section")?;

        let defaults = Self::default();
        Ok(Self {
            path: section.path.unwrap_or(defaults.path),
            size_limit: section.size_limit,
            policy: section.policy.unwrap_or_default(),
            frozen: None,
        })
    }

    fn settings(&self) -> CasSettings {
        CasSettings {
            path: self.path.clone(),
            size_limit: self.size_limit,
            policy: self.policy,
        }
    }

    /// Open the configured store, reusing the process-wide instance if
    /// this configuration was opened before.
    pub fn get_or_create(&self) -> Result<Arc<OnDiskStore>> {
        if let Some(store) = &self.frozen {
            return Ok(store.clone());
        }

        static INSTANCES: OnceLock<Mutex<HashMap<CasSettings, Arc<OnDiskStore>>>> =
            OnceLock::new();
        let instances = INSTANCES.get_or_init(Mutex::default);

        let settings = self.settings();
        let mut instances = instances.lock().unwrap();
        if let Some(store) = instances.get(&settings) {
            return Ok(store.clone());
        }
        debug!(path = %settings.path.display(), "opening cache directory");
        let store = Arc::new(OnDiskStore::open(
            &settings.path,
            settings.size_limit,
            settings.policy,
        )?);
        instances.insert(settings, store.clone());
        Ok(store)
    }

    /// Open the store, pin it to this value, and wipe the visible
    /// settings.
    ///
    /// After freezing, the store keeps working through this value, but the
    /// directory it uses can no longer be read or redirected from here.
    pub fn freeze(&mut self) -> Result<Arc<OnDiskStore>> {
        let store = self.get_or_create()?;
        let defaults = Self::default();
        self.path = defaults.path;
        self.size_limit = defaults.size_limit;
        self.policy = defaults.policy;
        self.frozen = Some(store.clone());
        Ok(store)
    }

    /// Whether this value has been frozen.
    pub fn is_frozen(&self) -> bool {
        self.frozen.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_path_is_sane() {
        let options = CasOptions::default();
        assert!(options.path.ends_with("cas") || options.path.ends_with(".cas"));
        assert_eq!(options.size_limit, None);
    }

    #[test]
    fn test_parse_policy() {
        assert_eq!(parse_policy("full-tree").unwrap(), FaultInPolicy::FullTree);
        assert_eq!(
            parse_policy("single-node").unwrap(),
            FaultInPolicy::SingleNode
        );
        assert!(parse_policy("eager").is_err());
    }

    #[test]
    fn test_from_file() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(
            &config,
            r#"
[cas]
path = "/tank/build/cas"
size_limit = 1048576
policy = "single-node"
"#,
        )?;

        let options = CasOptions::from_file(&config)?;
        assert_eq!(options.path, PathBuf::from("/tank/build/cas"));
        assert_eq!(options.size_limit, Some(1048576));
        assert_eq!(options.policy, FaultInPolicy::SingleNode);
        Ok(())
    }

    #[test]
    fn test_from_file_without_section_falls_back() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let config = dir.path().join("config.toml");
        std::fs::write(&config, "[other]\nkey = 1\n")?;

        let options = CasOptions::from_file(&config)?;
        assert_eq!(options.size_limit, CasOptions::default().size_limit);
        Ok(())
    }

    #[test]
    fn test_instance_cache_returns_same_store() -> Result<()> {
        let dir = tempfile::tempdir().unwrap();
        let options = CasOptions {
            path: dir.path().join("store"),
            ..Default::default()
        };

        let a = options.get_or_create()?;
        let b = options.get_or_create()?;
        assert!(Arc::ptr_eq(&a, &b));
        Ok(())
    }

    #[test]
    fn test_freeze_hides_settings_but_keeps_store() -> Result<()> {
        use crate::traits::ObjectStore;

        let dir = tempfile::tempdir().unwrap();
        let real_path = dir.path().join("hidden");
        let mut options = CasOptions {
            path: real_path.clone(),
            size_limit: Some(1 << 30),
            ..Default::default()
        };

        let store = options.freeze()?;
        assert!(options.is_frozen());
        assert_ne!(options.path, real_path);
        assert_eq!(options.size_limit, None);

        // The frozen store still points at the real directory.
        let r = store.store(&[], b"still writable")?;
        assert!(store.is_materialized(r)?);
        assert!(Arc::ptr_eq(&store, &options.get_or_create()?));
        Ok(())
    }
}
