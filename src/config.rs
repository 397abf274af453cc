use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Deserialize;

use crate::identity::{IdentityDirectory, UNKNOWN};
use crate::registry::CollectionKind;

/// Top-level configuration for the bizpulse service.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Logging verbosity (debug, info, warn, error). Default: "info".
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Backend collection endpoints.
    #[serde(default)]
    pub source: SourceConfig,

    /// Push-channel subscription.
    #[serde(default)]
    pub live: LiveConfig,

    /// Creator id to display name.
    #[serde(default)]
    pub identities: BTreeMap<String, String>,

    /// Consumer views, each with its own collections and refresh cadence.
    #[serde(default = "default_views")]
    pub views: Vec<ViewConfig>,

    /// Snapshot cache sizing.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Maximum log lines kept per kind and feed. Default: 200.
    #[serde(default = "default_log_limit")]
    pub log_limit: usize,

    /// Offset of the business timezone from UTC, in minutes. Default: 0.
    #[serde(default)]
    pub utc_offset_minutes: i32,

    /// Metrics and API server.
    #[serde(default)]
    pub server: ServerConfig,
}

/// Backend collection endpoints.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    /// Base URL of the backend (e.g., "http://localhost:5000").
    #[serde(default)]
    pub endpoint: String,

    /// Request timeout. Default: 10s.
    #[serde(default = "default_source_timeout", with = "humantime_serde")]
    pub timeout: Duration,

    /// Primary per-collection path; `{collection}` is substituted.
    #[serde(default = "default_primary_path")]
    pub primary_path: String,

    /// Fallback path used when the primary request fails.
    #[serde(default = "default_fallback_path")]
    pub fallback_path: String,
}

/// Push-channel subscription.
#[derive(Debug, Clone, Deserialize)]
pub struct LiveConfig {
    /// Subscribe to live events. Default: true.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// WebSocket URL of the push channel.
    #[serde(default = "default_live_url")]
    pub url: String,

    /// Delay between reconnection attempts. Default: 5s.
    #[serde(default = "default_reconnect_delay", with = "humantime_serde")]
    pub reconnect_delay: Duration,
}

/// One consumer view.
#[derive(Debug, Clone, Deserialize)]
pub struct ViewConfig {
    pub name: String,

    /// Collections aggregated by this view. Default: all.
    #[serde(default = "all_collections")]
    pub collections: Vec<CollectionKind>,

    /// How long a snapshot of today stays fresh. Default: 30s.
    #[serde(default = "default_refresh_interval", with = "humantime_serde")]
    pub refresh_interval: Duration,
}

/// Snapshot cache sizing.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Maximum cached (date, identity) entries per view. Default: 64.
    #[serde(default = "default_cache_entries")]
    pub max_entries: usize,
}

/// Metrics and API server.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Listen address; ":port" binds all interfaces. Default: ":9090".
    #[serde(default = "default_server_addr")]
    pub addr: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_source_timeout() -> Duration {
    Duration::from_secs(10)
}

fn default_primary_path() -> String {
    "/fetch-logs/{collection}".to_string()
}

fn default_fallback_path() -> String {
    "/get-local-data/{collection}".to_string()
}

fn default_true() -> bool {
    true
}

fn default_live_url() -> String {
    "ws://localhost:4000".to_string()
}

fn default_reconnect_delay() -> Duration {
    Duration::from_secs(5)
}

fn all_collections() -> Vec<CollectionKind> {
    CollectionKind::all().to_vec()
}

fn default_refresh_interval() -> Duration {
    Duration::from_secs(30)
}

fn default_views() -> Vec<ViewConfig> {
    vec![
        ViewConfig {
            name: "logs".to_string(),
            collections: all_collections(),
            refresh_interval: Duration::from_secs(30),
        },
        ViewConfig {
            name: "live".to_string(),
            collections: CollectionKind::all()
                .iter()
                .copied()
                .filter(|kind| *kind != CollectionKind::Opportunities)
                .collect(),
            refresh_interval: Duration::from_secs(1_000),
        },
        ViewConfig {
            name: "approvals".to_string(),
            collections: CollectionKind::all()
                .iter()
                .copied()
                .filter(|kind| kind.has_approvals())
                .collect(),
            refresh_interval: Duration::from_secs(600),
        },
    ]
}

fn default_cache_entries() -> usize {
    64
}

fn default_log_limit() -> usize {
    200
}

fn default_server_addr() -> String {
    ":9090".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            source: SourceConfig::default(),
            live: LiveConfig::default(),
            identities: BTreeMap::new(),
            views: default_views(),
            cache: CacheConfig::default(),
            log_limit: default_log_limit(),
            utc_offset_minutes: 0,
            server: ServerConfig::default(),
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            timeout: default_source_timeout(),
            primary_path: default_primary_path(),
            fallback_path: default_fallback_path(),
        }
    }
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            url: default_live_url(),
            reconnect_delay: default_reconnect_delay(),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: default_cache_entries(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_server_addr(),
        }
    }
}

// --- Validation and loading ---

impl Config {
    /// Load configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)
            .with_context(|| format!("reading config file {}", path.display()))?;

        Self::from_yaml(&data).with_context(|| format!("parsing config file {}", path.display()))
    }

    /// Parse and validate configuration from YAML text.
    pub fn from_yaml(data: &str) -> Result<Self> {
        let cfg: Config = serde_yaml::from_str(data).context("decoding YAML")?;

        cfg.validate()?;

        Ok(cfg)
    }

    /// Validate the configuration for required fields and consistency.
    pub fn validate(&self) -> Result<()> {
        if self.source.endpoint.is_empty() {
            bail!("source.endpoint is required");
        }

        for (field, path) in [
            ("primary_path", &self.source.primary_path),
            ("fallback_path", &self.source.fallback_path),
        ] {
            if !path.contains("{collection}") {
                bail!("source.{field} must contain {{collection}}: {path}");
            }
        }

        if self.live.enabled
            && !(self.live.url.starts_with("ws://") || self.live.url.starts_with("wss://"))
        {
            bail!("live.url must be a ws:// or wss:// URL when enabled");
        }

        for (id, name) in &self.identities {
            if id.trim().is_empty() {
                bail!("identity ids must not be empty");
            }
            if name.trim().is_empty() {
                bail!("identity {id} has an empty display name");
            }
            if id == UNKNOWN || name == UNKNOWN {
                bail!("identity {id} uses the reserved name {UNKNOWN}");
            }
        }

        if self.views.is_empty() {
            bail!("at least one view is required");
        }

        let mut names = HashSet::new();
        for view in &self.views {
            if view.name.is_empty() {
                bail!("view name must not be empty");
            }
            if !names.insert(view.name.as_str()) {
                bail!("duplicate view name: {}", view.name);
            }
            if view.collections.is_empty() {
                bail!("view {} must list at least one collection", view.name);
            }
            let mut seen = HashSet::new();
            for kind in &view.collections {
                if !seen.insert(*kind) {
                    bail!("view {} lists {kind} more than once", view.name);
                }
            }
            if view.refresh_interval.is_zero() {
                bail!("view {} refresh_interval must be positive", view.name);
            }
        }

        if self.cache.max_entries == 0 {
            bail!("cache.max_entries must be positive");
        }

        if self.log_limit == 0 {
            bail!("log_limit must be positive");
        }

        if self.utc_offset_minutes.abs() > 14 * 60 {
            bail!("utc_offset_minutes must be within +/-840");
        }

        Ok(())
    }

    /// Looks up a view by name.
    pub fn view(&self, name: &str) -> Option<&ViewConfig> {
        self.views.iter().find(|v| v.name == name)
    }

    /// Identity directory built from the `identities` table.
    pub fn directory(&self) -> IdentityDirectory {
        IdentityDirectory::new(
            self.identities
                .iter()
                .map(|(id, name)| (id.clone(), name.clone())),
        )
    }
}
