//! Runtime configuration for driftsync.
//!
//! One immutable [`Config`] value is constructed at startup (TOML file plus
//! command-line overrides) and passed into every component. Nothing reads
//! configuration from globals or the environment after that point.
//!
//! Config priority: explicit `--config` path > `driftsync.toml` in the
//! working directory > `~/.config/driftsync/config.toml` > built-in defaults.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

// ============================================================================
// Defaults
// ============================================================================

/// Account prefix that marks object-store accounts on the volume.
pub const DEFAULT_RESELLER_PREFIX: &str = "AUTH_";

/// Directory of per-identifier entries used for reverse path lookup.
pub const DEFAULT_IDENT_DIR: &str = ".gfid";

/// Extended attribute holding the logical path for an opaque identifier.
pub const DEFAULT_REVERSE_PATH_ATTR: &str = "glusterfs.ancestry.path";

/// Extended attribute the index service stamps on files it writes itself.
pub const DEFAULT_OWNERSHIP_ATTR: &str = "user.swift.metadata";

/// Suffix of tombstone files (rename-before-unlink deletions).
pub const DEFAULT_TOMBSTONE_SUFFIX: &str = ".ts";

fn default_reserved_prefixes() -> Vec<String> {
  vec!["async_pending".into(), ".glusterfs".into()]
}

// ============================================================================
// Sections
// ============================================================================

/// Path resolver settings (opaque identifier -> logical path).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
  /// Directory under the volume root containing per-identifier entries
  pub ident_dir: String,
  /// Xattr that stores the reverse path on those entries
  pub reverse_path_attr: String,
}

impl Default for ResolverConfig {
  fn default() -> Self {
    Self {
      ident_dir: DEFAULT_IDENT_DIR.into(),
      reverse_path_attr: DEFAULT_REVERSE_PATH_ATTR.into(),
    }
  }
}

/// Self-write classifier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifyConfig {
  /// Xattr present on files written by the index service itself
  pub ownership_attr: String,
  /// Suffix of tombstone files (deletes performed by the index service)
  pub tombstone_suffix: String,
}

impl Default for ClassifyConfig {
  fn default() -> Self {
    Self {
      ownership_attr: DEFAULT_OWNERSHIP_ATTR.into(),
      tombstone_suffix: DEFAULT_TOMBSTONE_SUFFIX.into(),
    }
  }
}

/// Changelog source settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangelogConfig {
  /// Directory where the storage layer publishes changelog segments
  pub dir: PathBuf,
  /// Scratch directory for processed-segment bookkeeping
  pub scratch_dir: PathBuf,
  /// Seconds to sleep between scans
  pub poll_interval_secs: u64,
}

impl Default for ChangelogConfig {
  fn default() -> Self {
    Self {
      dir: PathBuf::from("changelogs"),
      scratch_dir: PathBuf::from("changelog-scratch"),
      poll_interval_secs: 15,
    }
  }
}

/// Reconciliation crawler settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CrawlConfig {
  /// Seconds between full crawls (0 = run once and stop)
  pub interval_secs: u64,
  /// Run a crawl immediately on startup
  pub run_at_startup: bool,
  /// Containers diffed concurrently
  pub max_concurrent_containers: usize,
}

impl Default for CrawlConfig {
  fn default() -> Self {
    Self {
      interval_secs: 300,
      run_at_startup: true,
      max_concurrent_containers: 4,
    }
  }
}

/// Broker (event hand-off) settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
  /// AMQP connection URL
  pub url: String,
  /// Named durable queue for watch events
  pub queue: String,
  /// Publish attempts before the watch backend gives up
  pub publish_attempts: u32,
  /// Initial backoff between attempts (doubles each retry)
  pub retry_backoff_ms: u64,
}

impl Default for BrokerConfig {
  fn default() -> Self {
    Self {
      url: "amqp://127.0.0.1:5672/%2f".into(),
      queue: "driftsync-events".into(),
      publish_attempts: 5,
      retry_backoff_ms: 200,
    }
  }
}

/// Index query / update collaborator settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
  /// Base URL of the index listing API
  pub base_url: String,
  /// Per-request timeout
  pub request_timeout_secs: u64,
  /// Replica base URLs for direct update application; falls back to
  /// `base_url` when empty
  pub replicas: Vec<String>,
}

impl Default for IndexConfig {
  fn default() -> Self {
    Self {
      base_url: "http://127.0.0.1:8080".into(),
      request_timeout_secs: 10,
      replicas: Vec::new(),
    }
  }
}

/// Logging settings (consumed by the CLI when wiring tracing).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// off | error | warn | info | debug | trace
  pub level: String,
  /// daily | hourly | never
  pub rotation: String,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      level: "info".into(),
      rotation: "daily".into(),
    }
  }
}

// ============================================================================
// Config
// ============================================================================

/// Complete driftsync configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// POSIX volume that backs the object store
  pub volume_root: PathBuf,
  /// Account prefix marking object-store accounts
  pub reseller_prefix: String,
  /// Storage policy index stamped on every update record
  pub storage_policy_index: u32,
  /// Root for the durable queue; defaults to `volume_root`
  pub queue_root: Option<PathBuf>,
  /// Top-level names under the volume root that never hold objects
  pub reserved_prefixes: Vec<String>,

  pub resolver: ResolverConfig,
  pub classify: ClassifyConfig,
  pub changelog: ChangelogConfig,
  pub crawl: CrawlConfig,
  pub broker: BrokerConfig,
  pub index: IndexConfig,
  pub log: LogConfig,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      volume_root: PathBuf::from("/mnt/volume"),
      reseller_prefix: DEFAULT_RESELLER_PREFIX.into(),
      storage_policy_index: 0,
      queue_root: None,
      reserved_prefixes: default_reserved_prefixes(),
      resolver: ResolverConfig::default(),
      classify: ClassifyConfig::default(),
      changelog: ChangelogConfig::default(),
      crawl: CrawlConfig::default(),
      broker: BrokerConfig::default(),
      index: IndexConfig::default(),
      log: LogConfig::default(),
    }
  }
}

impl Config {
  /// Load from an explicit path, falling back to defaults on parse errors
  /// (the error is logged, not propagated, so a bad config file cannot
  /// take the capture pipeline down).
  pub fn load(path: &Path) -> Self {
    match std::fs::read_to_string(path) {
      Ok(content) => match toml::from_str(&content) {
        Ok(config) => {
          debug!(path = %path.display(), "Loaded config");
          config
        }
        Err(e) => {
          warn!(path = %path.display(), error = %e, "Invalid config file, using defaults");
          Self::default()
        }
      },
      Err(e) => {
        warn!(path = %path.display(), error = %e, "Unreadable config file, using defaults");
        Self::default()
      }
    }
  }

  /// Load from the default locations: `./driftsync.toml`, then the user
  /// config directory.
  pub fn load_default() -> Self {
    let local = PathBuf::from("driftsync.toml");
    if local.exists() {
      return Self::load(&local);
    }
    if let Some(user) = Self::user_config_path()
      && user.exists()
    {
      return Self::load(&user);
    }
    Self::default()
  }

  /// `~/.config/driftsync/config.toml` (platform equivalent).
  pub fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("driftsync").join("config.toml"))
  }

  /// Effective durable queue root.
  pub fn queue_root(&self) -> &Path {
    self.queue_root.as_deref().unwrap_or(&self.volume_root)
  }

  /// Name of the per-policy queue directory under the queue root.
  pub fn async_dir_name(&self) -> String {
    format!("async_pending-{}", self.storage_policy_index)
  }

  /// Whether a volume-relative path falls under a reserved subtree.
  ///
  /// Covers the durable queue directories and internal bookkeeping trees;
  /// events under these never describe objects.
  pub fn is_reserved(&self, relative: &str) -> bool {
    let first = relative.trim_start_matches('/').split('/').next().unwrap_or("");
    self.reserved_prefixes.iter().any(|p| first.starts_with(p.as_str()))
  }
}
