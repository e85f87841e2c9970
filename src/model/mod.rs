//! Entity model: an arena of containers, each owning its volumes by value.
//!
//! Cross references (`usedBy`, action targets) are typed keys resolved
//! through the arena when used, never pointers into it.

pub mod container;
pub mod volume;

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::types::UsedByKind;

pub use container::{Container, ContainerDetail, DiskInfo};
pub use volume::{
    DmInfo, Extentable, LoopInfo, LvExtents, MdInfo, Mountable, NfsInfo, PartitionInfo, PeMap,
    Resizable, Stripable, Volume, VolumeDetail,
};

/// Stable identity of a container inside the engine arena.
///
/// Ids are handed out in insertion order, so a higher id means a container
/// that was probed or created later.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u32);

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Identity of a volume within its container: a number (partitions, RAID
/// arrays, loop devices) or a name (logical volumes, mounts).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VolumeKey {
    Num(u32),
    Name(String),
}

impl VolumeKey {
    /// Numeric part used to order removals/creations inside a container.
    pub fn sequence(&self) -> u32 {
        match self {
            Self::Num(n) => *n,
            Self::Name(_) => 0,
        }
    }
}

impl fmt::Display for VolumeKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Num(n) => write!(f, "{}", n),
            Self::Name(name) => write!(f, "{}", name),
        }
    }
}

/// Non-owning record that another entity consumes a volume.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UsedBy {
    pub kind: UsedByKind,
    /// Device name of the consumer, e.g. `/dev/system` or `/dev/md0`
    pub device: String,
}

impl UsedBy {
    pub fn new(kind: UsedByKind, device: impl Into<String>) -> Self {
        Self {
            kind,
            device: device.into(),
        }
    }
}

impl fmt::Display for UsedBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.device)
    }
}

/// Typed reference to a volume: container id, key, and the `deleted` flag
/// that tells a pending delete apart from a same-named pending create.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VolumeRef {
    pub container: ContainerId,
    pub key: VolumeKey,
    pub deleted: bool,
}

/// Any entity an action can target.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    Container(ContainerId),
    Volume(VolumeRef),
}

/// Serialized form of a probed model, used by the CLI in place of live probes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelSnapshot {
    pub containers: Vec<Container>,
}

/// Partition device path for a disk and partition number.
///
/// Handles both `/dev/sdX` → `/dev/sdX1` and `/dev/nvme0n1` → `/dev/nvme0n1p1` patterns.
pub fn partition_device(disk: &str, number: u32) -> String {
    // NVMe, mmcblk and loop devices use a 'p' separator
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{}p{}", disk, number)
    } else {
        format!("{}{}", disk, number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partition_device_sda() {
        assert_eq!(partition_device("/dev/sda", 1), "/dev/sda1");
        assert_eq!(partition_device("/dev/sda", 12), "/dev/sda12");
    }

    #[test]
    fn test_partition_device_nvme() {
        assert_eq!(partition_device("/dev/nvme0n1", 1), "/dev/nvme0n1p1");
        assert_eq!(partition_device("/dev/mmcblk0", 2), "/dev/mmcblk0p2");
    }

    #[test]
    fn test_volume_key_ordering() {
        assert!(VolumeKey::Num(2) < VolumeKey::Num(10));
        assert!(VolumeKey::Name("home".into()) < VolumeKey::Name("root".into()));
        assert_eq!(VolumeKey::Num(7).sequence(), 7);
        assert_eq!(VolumeKey::Name("x".into()).sequence(), 0);
    }

    #[test]
    fn test_used_by_display() {
        let used = UsedBy::new(UsedByKind::Lvm, "/dev/system");
        assert_eq!(used.to_string(), "lvm:/dev/system");
    }
}
