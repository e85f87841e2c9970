//! Type-safe vocabulary for the storage model
//!
//! Filesystems, mount-by policies, encryption, commit stages and container
//! kinds are proper Rust enums so matches stay exhaustive and string forms
//! come from one place.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Filesystem type of a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum FsType {
    /// No filesystem detected or requested
    #[default]
    Unknown,
    Ext2,
    Ext3,
    Ext4,
    Btrfs,
    Xfs,
    Vfat,
    Ntfs,
    Swap,
    Nfs,
    Tmpfs,
}

/// What a filesystem can do to itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsCapabilities {
    pub can_grow: bool,
    pub can_shrink: bool,
    /// Growing/shrinking requires the filesystem to be mounted
    pub resize_needs_mount: bool,
    pub supports_label: bool,
    pub label_max_len: usize,
    pub supports_uuid: bool,
}

impl FsType {
    /// Capability table used by resize/label/mount-by validation.
    pub const fn capabilities(self) -> FsCapabilities {
        let (grow, shrink, needs_mount, label_len, uuid) = match self {
            Self::Unknown => (true, true, false, 0, false),
            Self::Ext2 | Self::Ext3 | Self::Ext4 => (true, true, false, 16, true),
            Self::Btrfs => (true, true, true, 255, true),
            Self::Xfs => (true, false, true, 12, true),
            Self::Vfat => (false, false, false, 11, true),
            Self::Ntfs => (true, true, false, 128, true),
            Self::Swap => (true, true, false, 15, true),
            Self::Nfs | Self::Tmpfs => (false, false, false, 0, false),
        };
        FsCapabilities {
            can_grow: grow,
            can_shrink: shrink,
            resize_needs_mount: needs_mount,
            supports_label: label_len > 0,
            label_max_len: label_len,
            supports_uuid: uuid,
        }
    }

    /// True for filesystems that live on a block device.
    pub const fn is_block_fs(self) -> bool {
        !matches!(self, Self::Unknown | Self::Nfs | Self::Tmpfs)
    }
}

/// How an fstab entry names its device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MountBy {
    #[default]
    Device,
    Uuid,
    Label,
}

/// Encryption layered over a volume
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EncryptType {
    #[default]
    None,
    Luks,
}

/// Ordering phase of a commit action.
///
/// The derived `Ord` is the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum CommitStage {
    Decrease,
    Increase,
    Format,
    Mount,
}

/// Kind tag of a container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    Disk,
    Md,
    DmRaid,
    DmMultipath,
    Lvm,
    Dm,
    Loop,
    Nfs,
    Tmpfs,
}

impl ContainerKind {
    /// Structural group used by the scheduler: providers have lower keys
    /// than the containers built on top of them.
    pub const fn structural_group(self) -> u8 {
        match self {
            Self::Disk => 0,
            Self::Md => 1,
            Self::DmRaid | Self::DmMultipath => 2,
            Self::Lvm => 3,
            Self::Dm => 4,
            Self::Loop => 5,
            Self::Nfs | Self::Tmpfs => 6,
        }
    }

    /// Virtual containers group volumes that have no parent device.
    pub const fn is_virtual(self) -> bool {
        matches!(self, Self::Md | Self::Dm | Self::Loop | Self::Nfs | Self::Tmpfs)
    }
}

/// Software RAID level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum MdLevel {
    Raid0,
    Raid1,
    Raid5,
    Raid6,
    Raid10,
}

impl MdLevel {
    /// Minimum number of member devices.
    pub const fn min_members(self) -> usize {
        match self {
            Self::Raid0 | Self::Raid1 | Self::Raid10 => 2,
            Self::Raid5 => 3,
            Self::Raid6 => 4,
        }
    }

    /// Usable size in KiB for members of the given sizes.
    pub fn usable_size_k(self, member_sizes: &[u64]) -> u64 {
        let n = member_sizes.len() as u64;
        let smallest = member_sizes.iter().copied().min().unwrap_or(0);
        match self {
            Self::Raid0 => member_sizes.iter().sum(),
            Self::Raid1 => smallest,
            Self::Raid5 => smallest * n.saturating_sub(1),
            Self::Raid6 => smallest * n.saturating_sub(2),
            Self::Raid10 => smallest * n / 2,
        }
    }
}

/// Kind of consumer recorded in a `usedBy` relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[strum(serialize_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UsedByKind {
    Lvm,
    Md,
    Dm,
    DmRaid,
    DmMultipath,
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn test_fs_type_string_forms() {
        assert_eq!(FsType::Ext4.to_string(), "ext4");
        assert_eq!("xfs".parse::<FsType>().expect("valid fs"), FsType::Xfs); // test: known-good input
        assert!("zfs".parse::<FsType>().is_err());
    }

    #[test]
    fn test_commit_stage_order() {
        let stages: Vec<CommitStage> = CommitStage::iter().collect();
        assert_eq!(
            stages,
            vec![CommitStage::Decrease, CommitStage::Increase, CommitStage::Format, CommitStage::Mount]
        );
        assert!(CommitStage::Decrease < CommitStage::Mount);
        assert_eq!(CommitStage::Format.to_string(), "FORMAT");
    }

    #[test]
    fn test_structural_groups_put_providers_first() {
        assert!(ContainerKind::Disk.structural_group() < ContainerKind::Md.structural_group());
        assert!(ContainerKind::Md.structural_group() < ContainerKind::DmRaid.structural_group());
        assert!(ContainerKind::DmMultipath.structural_group() < ContainerKind::Lvm.structural_group());
        assert!(ContainerKind::Lvm.structural_group() < ContainerKind::Nfs.structural_group());
    }

    #[test]
    fn test_xfs_cannot_shrink() {
        let caps = FsType::Xfs.capabilities();
        assert!(caps.can_grow);
        assert!(!caps.can_shrink);
        assert_eq!(caps.label_max_len, 12);
    }

    #[test]
    fn test_md_usable_size() {
        assert_eq!(MdLevel::Raid1.usable_size_k(&[100, 120]), 100);
        assert_eq!(MdLevel::Raid0.usable_size_k(&[100, 120]), 220);
        assert_eq!(MdLevel::Raid5.usable_size_k(&[100, 100, 100]), 200);
        assert_eq!(MdLevel::Raid6.min_members(), 4);
    }
}
