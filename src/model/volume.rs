//! Volumes: the addressable storage objects owned by containers.
//!
//! Every volume carries its current state next to the last committed
//! (`orig_*`) state; the difference between the two is what the diff
//! builder turns into commit actions.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use super::{UsedBy, VolumeKey};
use crate::types::{EncryptType, FsType, MdLevel, MountBy};

/// Extents consumed per pool member, iterated in member-name order.
pub type PeMap = BTreeMap<String, u64>;

/// Mount point used by swap volumes.
pub const SWAP_MOUNT: &str = "swap";

// ============================================================================
// Variant data
// ============================================================================

/// Partition on a disk
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    pub number: u32,
    /// Offset of the first KiB on the disk
    pub start_k: u64,
}

/// Logical volume in an extent pool
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LvExtents {
    /// Extent count of the volume
    pub le: u64,
    pub pe_map: PeMap,
    pub stripes: u32,
    pub stripe_size_k: u64,
}

impl LvExtents {
    pub fn new(stripes: u32, stripe_size_k: u64) -> Self {
        Self {
            le: 0,
            pe_map: PeMap::new(),
            stripes: stripes.max(1),
            stripe_size_k,
        }
    }

    /// Total extents recorded in the map.
    pub fn mapped(&self) -> u64 {
        self.pe_map.values().sum()
    }
}

/// Software RAID array
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MdInfo {
    pub number: u32,
    pub level: MdLevel,
    pub members: Vec<String>,
    #[serde(default)]
    pub chunk_k: u64,
}

/// Device-mapper volume described by its table
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DmInfo {
    /// Target names of the table, in table order
    pub targets: Vec<String>,
    /// Extents (of the table's extent size) consumed per underlying device
    pub pe_map: PeMap,
}

/// Loop device over a backing file
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopInfo {
    pub number: u32,
    pub file: PathBuf,
    /// Use the file as it is instead of creating it
    pub reuse_file: bool,
}

/// NFS mount
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NfsInfo {
    pub share: String,
}

/// Variant part of a volume.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeDetail {
    Partition(PartitionInfo),
    LogicalVolume(LvExtents),
    Md(MdInfo),
    Dm(DmInfo),
    Loop(LoopInfo),
    Nfs(NfsInfo),
    Tmpfs,
}

// ============================================================================
// Capability traits
// ============================================================================

/// Volumes whose device size can change.
pub trait Resizable {
    fn can_resize(&self) -> bool;
}

/// Volumes striped over several devices.
pub trait Stripable {
    fn stripes(&self) -> u32 {
        1
    }
}

/// Volumes that can carry a filesystem of their own.
pub trait Mountable {
    fn can_format(&self) -> bool {
        true
    }
}

/// Volumes that consume extents of underlying devices.
pub trait Extentable {
    fn pe_map(&self) -> Option<&PeMap>;

    /// Allocator-managed extents; only pool volumes have them.
    fn lv_extents_mut(&mut self) -> Option<&mut LvExtents> {
        None
    }
}

impl Resizable for PartitionInfo {
    fn can_resize(&self) -> bool {
        true
    }
}
impl Stripable for PartitionInfo {}
impl Mountable for PartitionInfo {}

impl Resizable for LvExtents {
    fn can_resize(&self) -> bool {
        true
    }
}
impl Stripable for LvExtents {
    fn stripes(&self) -> u32 {
        self.stripes.max(1)
    }
}
impl Mountable for LvExtents {}
impl Extentable for LvExtents {
    fn pe_map(&self) -> Option<&PeMap> {
        Some(&self.pe_map)
    }

    fn lv_extents_mut(&mut self) -> Option<&mut LvExtents> {
        Some(self)
    }
}

impl Resizable for MdInfo {
    fn can_resize(&self) -> bool {
        false
    }
}
impl Stripable for MdInfo {
    fn stripes(&self) -> u32 {
        match self.level {
            MdLevel::Raid0 => self.members.len().max(1) as u32,
            _ => 1,
        }
    }
}
impl Mountable for MdInfo {}

impl Resizable for DmInfo {
    fn can_resize(&self) -> bool {
        false
    }
}
impl Mountable for DmInfo {}
impl Extentable for DmInfo {
    fn pe_map(&self) -> Option<&PeMap> {
        Some(&self.pe_map)
    }
}

impl Resizable for LoopInfo {
    fn can_resize(&self) -> bool {
        false
    }
}
impl Mountable for LoopInfo {}

impl Mountable for NfsInfo {
    fn can_format(&self) -> bool {
        false
    }
}

impl Resizable for VolumeDetail {
    fn can_resize(&self) -> bool {
        match self {
            Self::Partition(p) => p.can_resize(),
            Self::LogicalVolume(lv) => lv.can_resize(),
            Self::Md(md) => md.can_resize(),
            Self::Dm(dm) => dm.can_resize(),
            Self::Loop(lo) => lo.can_resize(),
            Self::Nfs(_) | Self::Tmpfs => false,
        }
    }
}

impl Stripable for VolumeDetail {
    fn stripes(&self) -> u32 {
        match self {
            Self::Partition(p) => p.stripes(),
            Self::LogicalVolume(lv) => lv.stripes(),
            Self::Md(md) => md.stripes(),
            _ => 1,
        }
    }
}

impl Mountable for VolumeDetail {
    fn can_format(&self) -> bool {
        match self {
            Self::Partition(p) => p.can_format(),
            Self::LogicalVolume(lv) => lv.can_format(),
            Self::Md(md) => md.can_format(),
            Self::Dm(dm) => dm.can_format(),
            Self::Loop(lo) => lo.can_format(),
            Self::Nfs(nfs) => nfs.can_format(),
            Self::Tmpfs => false,
        }
    }
}

impl Extentable for VolumeDetail {
    fn pe_map(&self) -> Option<&PeMap> {
        match self {
            Self::LogicalVolume(lv) => lv.pe_map(),
            Self::Dm(dm) => dm.pe_map(),
            _ => None,
        }
    }

    fn lv_extents_mut(&mut self) -> Option<&mut LvExtents> {
        match self {
            Self::LogicalVolume(lv) => lv.lv_extents_mut(),
            _ => None,
        }
    }
}

impl VolumeDetail {
    /// Short kind name for logs and errors.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::Partition(_) => "partition",
            Self::LogicalVolume(_) => "logical volume",
            Self::Md(_) => "raid",
            Self::Dm(_) => "device-mapper",
            Self::Loop(_) => "loop",
            Self::Nfs(_) => "nfs",
            Self::Tmpfs => "tmpfs",
        }
    }

    pub fn lv_extents(&self) -> Option<&LvExtents> {
        match self {
            Self::LogicalVolume(lv) => Some(lv),
            _ => None,
        }
    }
}

// ============================================================================
// Volume
// ============================================================================

/// One addressable storage object inside a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub key: VolumeKey,
    pub device: String,
    pub size_k: u64,
    /// Size at the last successful commit (0 while pending creation)
    pub orig_size_k: u64,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub format: bool,
    #[serde(default)]
    pub fs: FsType,
    #[serde(default)]
    pub detected_fs: FsType,
    #[serde(default)]
    pub mount: String,
    #[serde(default)]
    pub orig_mount: String,
    #[serde(default)]
    pub mount_by: MountBy,
    #[serde(default)]
    pub orig_mount_by: MountBy,
    #[serde(default)]
    pub fstab_options: String,
    #[serde(default)]
    pub orig_fstab_options: String,
    #[serde(default)]
    pub encryption: EncryptType,
    #[serde(default)]
    pub orig_encryption: EncryptType,
    #[serde(default)]
    pub crypt_active: bool,
    #[serde(default)]
    pub crypt_key_file: Option<PathBuf>,
    #[serde(default)]
    pub is_loop: bool,
    #[serde(default)]
    pub loop_active: bool,
    #[serde(default)]
    pub uuid: String,
    #[serde(default)]
    pub label: String,
    #[serde(default)]
    pub orig_label: String,
    #[serde(default)]
    pub used_by: Option<UsedBy>,
    pub detail: VolumeDetail,
}

impl Volume {
    /// A committed volume as a probe would report it.
    pub fn new(key: VolumeKey, device: impl Into<String>, size_k: u64, detail: VolumeDetail) -> Self {
        let is_loop = matches!(detail, VolumeDetail::Loop(_));
        Self {
            key,
            device: device.into(),
            size_k,
            orig_size_k: size_k,
            created: false,
            deleted: false,
            format: false,
            fs: FsType::Unknown,
            detected_fs: FsType::Unknown,
            mount: String::new(),
            orig_mount: String::new(),
            mount_by: MountBy::Device,
            orig_mount_by: MountBy::Device,
            fstab_options: String::new(),
            orig_fstab_options: String::new(),
            encryption: EncryptType::None,
            orig_encryption: EncryptType::None,
            crypt_active: false,
            crypt_key_file: None,
            is_loop,
            loop_active: is_loop,
            uuid: String::new(),
            label: String::new(),
            orig_label: String::new(),
            used_by: None,
            detail,
        }
    }

    /// Committed partition `number` of `disk`.
    pub fn partition(disk: &str, number: u32, start_k: u64, size_k: u64) -> Self {
        Self::new(
            VolumeKey::Num(number),
            super::partition_device(disk, number),
            size_k,
            VolumeDetail::Partition(PartitionInfo { number, start_k }),
        )
    }

    /// Committed logical volume `name` in the pool at `pool_device`.
    pub fn logical(pool_device: &str, name: &str, pe_size_k: u64, extents: LvExtents) -> Self {
        let size_k = extents.le * pe_size_k;
        Self::new(
            VolumeKey::Name(name.to_string()),
            format!("{}/{}", pool_device, name),
            size_k,
            VolumeDetail::LogicalVolume(extents),
        )
    }

    /// Turn a freshly built volume into a pending creation.
    pub fn into_pending(mut self) -> Self {
        self.created = true;
        self.orig_size_k = 0;
        self.detected_fs = FsType::Unknown;
        self.orig_mount.clear();
        self.orig_label.clear();
        self.orig_fstab_options.clear();
        self.orig_encryption = EncryptType::None;
        self.loop_active = false;
        self.crypt_active = false;
        self
    }

    /// Detected filesystem (committed state).
    pub fn with_fs(mut self, fs: FsType) -> Self {
        self.fs = fs;
        self.detected_fs = fs;
        self
    }

    /// Committed mount point.
    pub fn with_mount(mut self, mount: &str) -> Self {
        self.mount = mount.to_string();
        self.orig_mount = mount.to_string();
        self
    }

    /// Committed label.
    pub fn with_label(mut self, label: &str) -> Self {
        self.label = label.to_string();
        self.orig_label = label.to_string();
        self
    }

    pub fn with_uuid(mut self, uuid: &str) -> Self {
        self.uuid = uuid.to_string();
        self
    }

    pub fn with_used_by(mut self, used_by: UsedBy) -> Self {
        self.used_by = Some(used_by);
        self
    }

    pub fn is_swap(&self) -> bool {
        self.mount == SWAP_MOUNT
    }

    /// Name of the dm-crypt mapping layered over this volume.
    pub fn crypt_name(&self) -> String {
        let base = self.device.rsplit('/').next().unwrap_or(&self.device);
        format!("cr_{}", base)
    }

    /// Device that carries the filesystem: the crypt mapping when encrypted.
    pub fn fs_device(&self) -> String {
        if self.encryption == EncryptType::None {
            self.device.clone()
        } else {
            format!("/dev/mapper/{}", self.crypt_name())
        }
    }

    /// Loop or crypt state differs from what is active on the system.
    pub fn needs_setup(&self) -> bool {
        self.is_loop != self.loop_active
            || (self.encryption != EncryptType::None) != self.crypt_active
    }

    /// Only fstab metadata differs from the committed state. Unmounted
    /// volumes have no entry to change.
    pub fn fstab_changed(&self) -> bool {
        !self.mount.is_empty()
            && (self.mount_by != self.orig_mount_by
                || self.fstab_options != self.orig_fstab_options
                || self.encryption != self.orig_encryption)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_volume_is_committed() {
        let vol = Volume::partition("/dev/sda", 2, 1024, 4096);
        assert_eq!(vol.device, "/dev/sda2");
        assert_eq!(vol.orig_size_k, 4096);
        assert!(!vol.created);
        assert!(!vol.needs_setup());
    }

    #[test]
    fn test_pending_volume_has_no_orig_state() {
        let vol = Volume::partition("/dev/sda", 1, 1024, 4096)
            .with_fs(FsType::Ext4)
            .with_mount("/home")
            .into_pending();
        assert!(vol.created);
        assert_eq!(vol.orig_size_k, 0);
        assert_eq!(vol.detected_fs, FsType::Unknown);
        assert!(vol.orig_mount.is_empty());
        assert_eq!(vol.mount, "/home");
    }

    #[test]
    fn test_crypt_device_names() {
        let mut vol = Volume::partition("/dev/sdb", 3, 1024, 4096);
        assert_eq!(vol.fs_device(), "/dev/sdb3");
        vol.encryption = EncryptType::Luks;
        assert_eq!(vol.crypt_name(), "cr_sdb3");
        assert_eq!(vol.fs_device(), "/dev/mapper/cr_sdb3");
        assert!(vol.needs_setup());
    }

    #[test]
    fn test_capabilities_per_variant() {
        let lv = VolumeDetail::LogicalVolume(LvExtents::new(2, 64));
        assert!(lv.can_resize());
        assert_eq!(lv.stripes(), 2);
        assert!(lv.pe_map().is_some());

        let nfs = VolumeDetail::Nfs(NfsInfo { share: "srv:/export".into() });
        assert!(!nfs.can_resize());
        assert!(!nfs.can_format());

        let md = VolumeDetail::Md(MdInfo {
            number: 0,
            level: MdLevel::Raid0,
            members: vec!["/dev/sda1".into(), "/dev/sdb1".into()],
            chunk_k: 64,
        });
        assert_eq!(md.stripes(), 2);
        assert!(md.pe_map().is_none());
    }
}
