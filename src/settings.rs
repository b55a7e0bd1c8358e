//! Host settings for ironcage
//!
//! Parses `ironcage.toml` using serde. Every field has a default, so a
//! missing file is equivalent to an empty one.

use crate::error::{Error, Result};
use crate::hooks::Hook;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Default settings location
pub const DEFAULT_PATH: &str = "/usr/local/etc/ironcage.toml";

/// Load settings from a file, falling back to defaults when it is absent
pub fn load(path: &Path) -> Result<Settings> {
    if !path.exists() {
        tracing::debug!(path = %path.display(), "no settings file, using defaults");
        return Ok(Settings::default());
    }

    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    let settings: Settings = toml::from_str(&content)?;
    settings.validate()?;
    Ok(settings)
}

/// Root settings structure
#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// ZFS pool holding the ironcage datasets
    #[serde(default = "default_pool")]
    pub pool: String,

    /// Root dataset name under the pool
    #[serde(default = "default_root")]
    pub root: String,

    /// Mountpoint of the root dataset (defaults to /<pool>/<root>)
    pub iocroot: Option<PathBuf>,

    /// Directory for runtime artifacts and lock files
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,

    #[serde(default)]
    pub devfs: DevfsSettings,

    #[serde(default)]
    pub nat: NatSettings,

    /// Backoff for dataset operations that hit a busy dataset
    #[serde(default)]
    pub retry: RetryConfig,

    #[serde(default)]
    pub bulk: BulkSettings,

    /// Host-wide lifecycle hooks, run in addition to per-jail exec_* properties
    #[serde(default)]
    pub hooks: Vec<Hook>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            pool: default_pool(),
            root: default_root(),
            iocroot: None,
            run_dir: default_run_dir(),
            devfs: DevfsSettings::default(),
            nat: NatSettings::default(),
            retry: RetryConfig::default(),
            bulk: BulkSettings::default(),
            hooks: Vec::new(),
        }
    }
}

impl Settings {
    /// Validate the settings
    pub fn validate(&self) -> Result<()> {
        if self.pool.is_empty() || self.pool.contains('/') {
            return Err(Error::InvalidConfiguration(format!(
                "pool must be a bare pool name, got '{}'",
                self.pool
            )));
        }
        if self.nat.block != 24 && self.nat.block != 30 {
            return Err(Error::InvalidConfiguration(format!(
                "nat.block must be 24 or 30, got {}",
                self.nat.block
            )));
        }
        // 65535 is the default rule
        if self.nat.ipfw_rule_base == 0 || self.nat.ipfw_rule_max() >= 65535 {
            return Err(Error::InvalidConfiguration(format!(
                "nat.ipfw_rule_base {} leaves no room for /{} blocks below rule 65535",
                self.nat.ipfw_rule_base, self.nat.block
            )));
        }
        if self.devfs.base_ruleset > self.devfs.floor {
            return Err(Error::InvalidConfiguration(format!(
                "devfs.base_ruleset {} is above the reserved floor {}",
                self.devfs.base_ruleset, self.devfs.floor
            )));
        }
        if self.bulk.workers == 0 {
            return Err(Error::InvalidConfiguration(
                "bulk.workers must be at least 1".into(),
            ));
        }
        if self.bulk.start_burst.is_nan() || self.bulk.start_burst < 1.0 {
            return Err(Error::InvalidConfiguration(format!(
                "bulk.start_burst must be at least 1, got {}",
                self.bulk.start_burst
            )));
        }
        if self.bulk.start_rate.is_nan() || self.bulk.start_rate <= 0.0 {
            return Err(Error::InvalidConfiguration(format!(
                "bulk.start_rate must be above 0, got {}",
                self.bulk.start_rate
            )));
        }
        Ok(())
    }

    /// Root dataset, e.g. `zroot/iocage`
    pub fn root_dataset(&self) -> String {
        format!("{}/{}", self.pool, self.root)
    }

    /// Mountpoint of the root dataset
    pub fn iocroot(&self) -> PathBuf {
        self.iocroot
            .clone()
            .unwrap_or_else(|| PathBuf::from(format!("/{}/{}", self.pool, self.root)))
    }
}

fn default_pool() -> String {
    "zroot".to_string()
}

fn default_root() -> String {
    "iocage".to_string()
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("/var/run/ironcage")
}

/// Dynamic devfs ruleset allocation
#[derive(Debug, Clone, Deserialize)]
pub struct DevfsSettings {
    /// Highest reserved ruleset id; allocation starts above it
    #[serde(default = "default_devfs_floor")]
    pub floor: u32,

    /// Ruleset cloned into every allocated one
    #[serde(default = "default_devfs_base")]
    pub base_ruleset: u32,
}

impl Default for DevfsSettings {
    fn default() -> Self {
        Self {
            floor: default_devfs_floor(),
            base_ruleset: default_devfs_base(),
        }
    }
}

fn default_devfs_floor() -> u32 {
    4
}

fn default_devfs_base() -> u32 {
    4
}

/// Packet filter used for NAT rules
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NatBackend {
    #[default]
    Ipfw,
    Pf,
}

/// NAT address allocation and rule files
#[derive(Debug, Clone, Deserialize)]
pub struct NatSettings {
    #[serde(default)]
    pub backend: NatBackend,

    /// Prefix length of the block handed to each jail (30 or 24)
    #[serde(default = "default_nat_block")]
    pub block: u8,

    /// Rule file loaded with `ipfw -q <file>`
    #[serde(default = "default_ipfw_rules")]
    pub ipfw_rules: PathBuf,

    /// Rule file loaded into the pf anchor
    #[serde(default = "default_pf_rules")]
    pub pf_rules: PathBuf,

    /// pf anchor receiving the NAT rules
    #[serde(default = "default_pf_anchor")]
    pub pf_anchor: String,

    /// First ipfw rule and nat instance number owned by ironcage; each
    /// block of the NAT prefix maps to one number above it
    #[serde(default = "default_ipfw_rule_base")]
    pub ipfw_rule_base: u32,
}

impl NatSettings {
    /// Highest rule number the configured block size can reach
    pub fn ipfw_rule_max(&self) -> u32 {
        self.ipfw_rule_base
            .saturating_add(u32::MAX >> 16 >> (32 - u32::from(self.block)))
    }
}

impl Default for NatSettings {
    fn default() -> Self {
        Self {
            backend: NatBackend::default(),
            block: default_nat_block(),
            ipfw_rules: default_ipfw_rules(),
            pf_rules: default_pf_rules(),
            pf_anchor: default_pf_anchor(),
            ipfw_rule_base: default_ipfw_rule_base(),
        }
    }
}

fn default_nat_block() -> u8 {
    30
}

fn default_ipfw_rule_base() -> u32 {
    40000
}

fn default_ipfw_rules() -> PathBuf {
    PathBuf::from("/var/run/ironcage/ipfw.rules")
}

fn default_pf_rules() -> PathBuf {
    PathBuf::from("/var/run/ironcage/pf-nat.conf")
}

fn default_pf_anchor() -> String {
    "ironcage/nat".to_string()
}

// Retry configuration defaults
fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    5
}

fn default_jitter_factor() -> f64 {
    0.25
}

/// Retry/backoff configuration for busy datasets
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds before first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between retries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Bulk start/stop behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct BulkSettings {
    /// Worker threads for jails sharing a priority
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Burst of starts allowed before rate limiting kicks in
    #[serde(default = "default_start_burst")]
    pub start_burst: f64,

    /// Sustained starts per second
    #[serde(default = "default_start_rate")]
    pub start_rate: f64,
}

impl Default for BulkSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            start_burst: default_start_burst(),
            start_rate: default_start_rate(),
        }
    }
}

fn default_workers() -> usize {
    1
}

fn default_start_burst() -> f64 {
    5.0
}

fn default_start_rate() -> f64 {
    1.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::{HookPhase, HookTarget};

    #[test]
    fn test_defaults() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.pool, "zroot");
        assert_eq!(settings.root_dataset(), "zroot/iocage");
        assert_eq!(settings.iocroot(), PathBuf::from("/zroot/iocage"));
        assert_eq!(settings.nat.block, 30);
        assert_eq!(settings.nat.backend, NatBackend::Ipfw);
        assert_eq!(settings.devfs.floor, 4);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_full_settings() {
        let toml = r#"
pool = "tank"
iocroot = "/mnt/iocage"

[nat]
backend = "pf"
block = 24

[retry]
max_attempts = 3

[bulk]
workers = 4

[[hooks]]
phase = "post_start"
target = "jail"
command = "/usr/sbin/service"
args = ["sshd", "onestart"]
"#;
        let settings: Settings = toml::from_str(toml).unwrap();
        assert_eq!(settings.root_dataset(), "tank/iocage");
        assert_eq!(settings.iocroot(), PathBuf::from("/mnt/iocage"));
        assert_eq!(settings.nat.backend, NatBackend::Pf);
        assert_eq!(settings.retry.max_attempts, 3);
        assert_eq!(settings.retry.base_delay_ms, 500);
        assert_eq!(settings.bulk.workers, 4);
        assert_eq!(settings.hooks.len(), 1);
        assert_eq!(settings.hooks[0].phase, HookPhase::PostStart);
        assert_eq!(settings.hooks[0].target, HookTarget::Jail);
    }

    #[test]
    fn test_rejects_bad_block() {
        let settings: Settings = toml::from_str("[nat]\nblock = 28").unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_ipfw_rule_range() {
        let settings: Settings = toml::from_str("").unwrap();
        assert_eq!(settings.nat.ipfw_rule_base, 40000);
        assert_eq!(settings.nat.ipfw_rule_max(), 40000 + 16383);

        let settings: Settings = toml::from_str("[nat]\nblock = 24\nipfw_rule_base = 65000").unwrap();
        assert_eq!(settings.nat.ipfw_rule_max(), 65255);
        assert!(settings.validate().is_err());

        let settings: Settings = toml::from_str("[nat]\nipfw_rule_base = 0").unwrap();
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_bulk_settings() {
        for bulk in ["workers = 0", "start_burst = 0.5", "start_rate = 0.0", "start_rate = -2.0"] {
            let settings: Settings = toml::from_str(&format!("[bulk]\n{}", bulk)).unwrap();
            let err = settings.validate().unwrap_err();
            assert!(err.to_string().contains("bulk."), "{}: {}", bulk, err);
        }
        let settings: Settings = toml::from_str("[bulk]\nstart_burst = 1.0\nstart_rate = 0.25").unwrap();
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_load_rejects_zero_start_rate() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ironcage.toml");
        fs::write(&path, "[bulk]\nstart_rate = 0.0\n").unwrap();
        assert!(load(&path).is_err());
    }

    #[test]
    fn test_missing_file_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(settings.pool, "zroot");
    }

    #[test]
    fn test_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ironcage.toml");
        fs::write(&path, "pool = \"data\"\nrun_dir = \"/tmp/ic\"\n").unwrap();
        let settings = load(&path).unwrap();
        assert_eq!(settings.pool, "data");
        assert_eq!(settings.run_dir, PathBuf::from("/tmp/ic"));
    }
}
