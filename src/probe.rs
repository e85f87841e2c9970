//! System-state probes the engine consults while committing.
//!
//! The engine only needs a handful of answers from the live system: the
//! size of a device, whether its node exists, its filesystem UUID, and the
//! free extent count of a pool. [`Prober`] is that seam.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::command_runner::{CommandRunner, SystemRunner, argv};
use crate::error::Result;

/// Answers questions about the live system.
pub trait Prober {
    /// Size of `device` in KiB.
    fn device_size_k(&mut self, device: &str) -> Option<u64>;

    /// Device node present.
    fn device_exists(&mut self, device: &str) -> bool;

    /// Filesystem UUID of `device`.
    fn device_uuid(&mut self, _device: &str) -> Option<String> {
        None
    }

    /// Free extents of the pool named `pool` as the volume manager sees it.
    fn pool_free_extents(&mut self, _pool: &str) -> Option<u64> {
        None
    }
}

/// `/proc/partitions` as a name → KiB table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcPartitions {
    sizes: HashMap<String, u64>,
}

impl ProcPartitions {
    /// Parse `major minor #blocks name` lines; the header and junk are skipped.
    pub fn parse(text: &str) -> Self {
        let sizes = text
            .lines()
            .filter_map(|line| {
                let fields: Vec<&str> = line.split_whitespace().collect();
                if fields.len() != 4 {
                    return None;
                }
                let blocks = fields[2].parse::<u64>().ok()?;
                fields[0].parse::<u32>().ok()?;
                Some((fields[3].to_string(), blocks))
            })
            .collect();
        Self { sizes }
    }

    pub fn load(path: &Path) -> Result<Self> {
        Ok(Self::parse(&std::fs::read_to_string(path)?))
    }

    /// Size of `device` (with or without the `/dev/` prefix).
    pub fn size_k(&self, device: &str) -> Option<u64> {
        self.sizes
            .get(device.strip_prefix("/dev/").unwrap_or(device))
            .copied()
    }

    pub fn len(&self) -> usize {
        self.sizes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sizes.is_empty()
    }
}

/// Probes the host: `/proc/partitions`, device nodes, `blkid` and `vgs`.
pub struct SystemProber {
    partitions_path: PathBuf,
    root: PathBuf,
    runner: SystemRunner,
}

impl SystemProber {
    pub fn new(partitions_path: impl Into<PathBuf>, root: impl Into<PathBuf>, soft_cap: Duration) -> Self {
        Self {
            partitions_path: partitions_path.into(),
            root: root.into(),
            runner: SystemRunner::with_soft_cap(soft_cap),
        }
    }

    fn first_line(&mut self, parts: &[&str]) -> Option<String> {
        let out = self.runner.run(&argv(parts)).ok()?;
        if !out.success() {
            return None;
        }
        out.stdout
            .into_iter()
            .map(|l| l.trim().to_string())
            .find(|l| !l.is_empty())
    }
}

impl Prober for SystemProber {
    fn device_size_k(&mut self, device: &str) -> Option<u64> {
        match ProcPartitions::load(&self.partitions_path) {
            Ok(table) => table.size_k(device),
            Err(e) => {
                debug!(path = %self.partitions_path.display(), error = %e, "Cannot read partition table");
                None
            }
        }
    }

    fn device_exists(&mut self, device: &str) -> bool {
        let relative = device.trim_start_matches('/');
        self.root.join(relative).exists()
    }

    fn device_uuid(&mut self, device: &str) -> Option<String> {
        self.first_line(&["blkid", "-s", "UUID", "-o", "value", device])
    }

    fn pool_free_extents(&mut self, pool: &str) -> Option<u64> {
        let line = self.first_line(&["vgs", "--noheadings", "-o", "vg_free_count", pool])?;
        line.parse().ok()
    }
}

/// Fixed answers, for tests and for planning from a saved model.
#[derive(Debug, Clone, Default)]
pub struct StaticProber {
    pub sizes: HashMap<String, u64>,
    pub uuids: HashMap<String, String>,
    pub pool_free: HashMap<String, u64>,
    /// Devices reported missing; every other device exists
    pub missing: HashSet<String>,
}

impl StaticProber {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size(mut self, device: &str, size_k: u64) -> Self {
        self.sizes.insert(device.to_string(), size_k);
        self
    }

    pub fn with_uuid(mut self, device: &str, uuid: &str) -> Self {
        self.uuids.insert(device.to_string(), uuid.to_string());
        self
    }

    pub fn with_pool_free(mut self, pool: &str, free: u64) -> Self {
        self.pool_free.insert(pool.to_string(), free);
        self
    }

    pub fn with_missing(mut self, device: &str) -> Self {
        self.missing.insert(device.to_string());
        self
    }
}

impl Prober for StaticProber {
    fn device_size_k(&mut self, device: &str) -> Option<u64> {
        self.sizes.get(device).copied()
    }

    fn device_exists(&mut self, device: &str) -> bool {
        !self.missing.contains(device)
    }

    fn device_uuid(&mut self, device: &str) -> Option<String> {
        self.uuids.get(device).cloned()
    }

    fn pool_free_extents(&mut self, pool: &str) -> Option<u64> {
        self.pool_free.get(pool).copied()
    }
}
