//! Engine configuration
//!
//! A JSON file with every knob the engine reads at construction. Missing
//! fields take the defaults of a normal Linux host, so an empty object is a
//! valid configuration.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::types::MountBy;

/// Settings of one engine instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Prepended to mount points and the fstab path
    pub root_prefix: PathBuf,
    /// Advisory lock file; `None` disables locking
    pub lock_path: Option<PathBuf>,
    /// fstab location inside the root prefix
    pub fstab_path: PathBuf,
    pub proc_partitions: PathBuf,
    pub read_only: bool,
    pub dry_run: bool,
    pub device_wait_retries: u32,
    pub device_wait_interval_ms: u64,
    /// Mount-by policy given to newly mounted volumes
    pub default_mount_by: MountBy,
    pub default_pe_size_k: u64,
    /// Space a physical volume loses to metadata, in KiB
    pub pv_metadata_reserve_k: u64,
    /// Soft time cap for probe commands
    pub probe_soft_cap_ms: u64,
    /// Record SIGINT/SIGTERM/SIGHUP during a commit instead of dying
    pub defer_signals: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            root_prefix: PathBuf::from("/"),
            lock_path: Some(PathBuf::from("/run/lock/storplan.lock")),
            fstab_path: PathBuf::from("/etc/fstab"),
            proc_partitions: PathBuf::from("/proc/partitions"),
            read_only: false,
            dry_run: false,
            device_wait_retries: 50,
            device_wait_interval_ms: 100,
            default_mount_by: MountBy::Uuid,
            default_pe_size_k: 4096,
            pv_metadata_reserve_k: 1024,
            probe_soft_cap_ms: 10_000,
            defer_signals: true,
        }
    }
}

impl EngineConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Configuration for a target tree at `root`, without locking.
    pub fn for_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root_prefix: root.into(),
            lock_path: None,
            ..Self::default()
        }
    }

    /// `path` placed under the root prefix.
    pub fn under_root(&self, path: &Path) -> PathBuf {
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative.as_os_str().is_empty() {
            return self.root_prefix.clone();
        }
        self.root_prefix.join(relative)
    }

    /// The fstab file this engine maintains.
    pub fn fstab_file(&self) -> PathBuf {
        self.under_root(&self.fstab_path)
    }

    pub fn device_wait_interval(&self) -> Duration {
        Duration::from_millis(self.device_wait_interval_ms)
    }

    pub fn probe_soft_cap(&self) -> Duration {
        Duration::from_millis(self.probe_soft_cap_ms)
    }

    /// Save configuration to a JSON file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)
            .context("Failed to serialize configuration to JSON")?;

        fs::write(&path, json)
            .with_context(|| format!("Failed to write configuration to {:?}", path.as_ref()))?;

        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read configuration from {:?}", path.as_ref()))?;

        let config: Self =
            serde_json::from_str(&content).context("Failed to parse configuration JSON")?;

        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if !self.root_prefix.is_absolute() {
            anyhow::bail!("Root prefix must be an absolute path: {:?}", self.root_prefix);
        }
        if !self.fstab_path.is_absolute() {
            anyhow::bail!("fstab path must be absolute: {:?}", self.fstab_path);
        }
        if let Some(lock) = &self.lock_path {
            if lock.file_name().is_none() {
                anyhow::bail!("Lock path must name a file: {:?}", lock);
            }
        }
        if self.default_pe_size_k == 0 || !self.default_pe_size_k.is_power_of_two() {
            anyhow::bail!(
                "Extent size must be a power of two in KiB, got {}",
                self.default_pe_size_k
            );
        }
        if self.device_wait_retries > 0 && self.device_wait_interval_ms == 0 {
            anyhow::bail!("Device wait interval must be positive when retries are enabled");
        }
        Ok(())
    }
}
