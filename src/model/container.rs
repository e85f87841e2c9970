//! Containers: disks, extent pools and the virtual groups the engine
//! creates on demand.

use serde::{Deserialize, Serialize};

use super::{ContainerId, Volume, VolumeKey};
use crate::error::{Result, StorageError};
use crate::pool::ExtentPool;
use crate::types::ContainerKind;

/// Disk-specific state
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskInfo {
    pub size_k: u64,
    /// Partition table type (`gpt`, `msdos`)
    #[serde(default)]
    pub label: String,
    /// Pending "destroy partition table"
    #[serde(default)]
    pub destroy_label: bool,
}

/// Kind-specific part of a container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContainerDetail {
    Disk(DiskInfo),
    Lvm(ExtentPool),
    Md,
    DmRaid,
    DmMultipath,
    Dm,
    Loop,
    Nfs,
    Tmpfs,
}

/// A storage-managing unit; exclusively owns its volumes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    /// Assigned by the engine arena on insertion
    #[serde(default = "unassigned_id")]
    pub id: ContainerId,
    pub name: String,
    pub device: String,
    #[serde(default)]
    pub created: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub read_only: bool,
    /// Sorted by key, a deleted entry before a pending create of the same key
    #[serde(default)]
    pub volumes: Vec<Volume>,
    pub detail: ContainerDetail,
}

fn unassigned_id() -> ContainerId {
    ContainerId(0)
}

impl Container {
    pub fn new(name: &str, device: &str, detail: ContainerDetail) -> Self {
        Self {
            id: unassigned_id(),
            name: name.to_string(),
            device: device.to_string(),
            created: false,
            deleted: false,
            read_only: false,
            volumes: Vec::new(),
            detail,
        }
    }

    /// A probed disk of `size_k` KiB with a partition table of type `label`.
    pub fn disk(device: &str, size_k: u64, label: &str) -> Self {
        let name = device.trim_start_matches("/dev/");
        Self::new(
            name,
            device,
            ContainerDetail::Disk(DiskInfo {
                size_k,
                label: label.to_string(),
                destroy_label: false,
            }),
        )
    }

    /// A probed extent pool named `name`.
    pub fn lvm(name: &str, pool: ExtentPool) -> Self {
        Self::new(name, &format!("/dev/{}", name), ContainerDetail::Lvm(pool))
    }

    /// Empty virtual group of the given kind.
    pub fn virtual_group(kind: ContainerKind) -> Option<Self> {
        let detail = match kind {
            ContainerKind::Md => ContainerDetail::Md,
            ContainerKind::Dm => ContainerDetail::Dm,
            ContainerKind::Loop => ContainerDetail::Loop,
            ContainerKind::Nfs => ContainerDetail::Nfs,
            ContainerKind::Tmpfs => ContainerDetail::Tmpfs,
            _ => return None,
        };
        let name = kind.to_string();
        Some(Self::new(&name, "", detail))
    }

    pub fn kind(&self) -> ContainerKind {
        match self.detail {
            ContainerDetail::Disk(_) => ContainerKind::Disk,
            ContainerDetail::Lvm(_) => ContainerKind::Lvm,
            ContainerDetail::Md => ContainerKind::Md,
            ContainerDetail::DmRaid => ContainerKind::DmRaid,
            ContainerDetail::DmMultipath => ContainerKind::DmMultipath,
            ContainerDetail::Dm => ContainerKind::Dm,
            ContainerDetail::Loop => ContainerKind::Loop,
            ContainerDetail::Nfs => ContainerKind::Nfs,
            ContainerDetail::Tmpfs => ContainerKind::Tmpfs,
        }
    }

    pub fn pool(&self) -> Option<&ExtentPool> {
        match &self.detail {
            ContainerDetail::Lvm(pool) => Some(pool),
            _ => None,
        }
    }

    pub fn pool_mut(&mut self) -> Option<&mut ExtentPool> {
        match &mut self.detail {
            ContainerDetail::Lvm(pool) => Some(pool),
            _ => None,
        }
    }

    pub fn disk_info(&self) -> Option<&DiskInfo> {
        match &self.detail {
            ContainerDetail::Disk(info) => Some(info),
            _ => None,
        }
    }

    /// Extent pool and volumes borrowed together, for the allocator.
    pub fn pool_and_volumes(&mut self) -> Option<(&mut ExtentPool, &mut Vec<Volume>)> {
        match &mut self.detail {
            ContainerDetail::Lvm(pool) => Some((pool, &mut self.volumes)),
            _ => None,
        }
    }

    /// The live (not pending-delete) volume with this key.
    pub fn find_volume(&self, key: &VolumeKey) -> Option<&Volume> {
        self.volumes.iter().find(|v| &v.key == key && !v.deleted)
    }

    pub fn volume_index(&self, key: &VolumeKey, deleted: bool) -> Option<usize> {
        self.volumes
            .iter()
            .position(|v| &v.key == key && v.deleted == deleted)
    }

    pub fn find_by_device(&self, device: &str) -> Option<&Volume> {
        self.volumes.iter().find(|v| v.device == device && !v.deleted)
    }

    /// Insert keeping the key order; a live volume with the same key is an error.
    pub fn insert_volume(&mut self, volume: Volume) -> Result<()> {
        if self.find_volume(&volume.key).is_some() {
            return Err(StorageError::in_use(
                volume.device.clone(),
                format!("existing volume {} of {}", volume.key, self.name),
            ));
        }
        let pos = self
            .volumes
            .partition_point(|v| (&v.key, !v.deleted) <= (&volume.key, !volume.deleted));
        self.volumes.insert(pos, volume);
        Ok(())
    }

    /// Next free number after the highest numbered volume.
    pub fn next_number(&self) -> u32 {
        self.volumes
            .iter()
            .filter_map(|v| match v.key {
                VolumeKey::Num(n) => Some(n),
                VolumeKey::Name(_) => None,
            })
            .max()
            .map_or(if self.kind() == ContainerKind::Disk { 1 } else { 0 }, |n| n + 1)
    }

    /// Live volumes only.
    pub fn live_volumes(&self) -> impl Iterator<Item = &Volume> {
        self.volumes.iter().filter(|v| !v.deleted)
    }
}
