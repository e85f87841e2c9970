//! Storage engine
//!
//! Owns the container arena, the command runner, the prober and the engine
//! lock. Mutating calls only change the model (and the extent bookkeeping of
//! pools); nothing touches the system until [`Storage::commit`].
//!
//! # Operations
//!
//! | Area        | Calls |
//! |-------------|-------|
//! | Disk        | `create_partition`, `destroy_partition_table` |
//! | Pool        | `create_vg`, `remove_vg`, `extend_vg`, `reduce_vg`, `create_lv` |
//! | RAID / loop | `create_md`, `create_loop` |
//! | Virtual     | `add_nfs`, `add_tmpfs`, `probe_dm_volume` |
//! | Volume      | `remove_volume`, `resize_volume`, `change_*`, `set_encryption`, `set_used_by` |
//! | Commit      | `plan`, `commit`, `check_consistency` |
//!
//! Every mutating call fails with `ReadOnly` on a read-only engine or
//! container.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::command_runner::CommandRunner;
use crate::config::EngineConfig;
use crate::dm_table::{resolve_block_device, DmTable};
use crate::error::{Result, StorageError};
use crate::lock::{EngineLock, LockMode};
use crate::model::{
    Container, ContainerDetail, ContainerId, DmInfo, Extentable, LoopInfo, LvExtents, MdInfo,
    ModelSnapshot, Mountable, NfsInfo, Resizable, Stripable, UsedBy, Volume, VolumeDetail, VolumeKey,
};
use crate::pool::{self, ExtentPool, PvInfo};
use crate::probe::Prober;
use crate::process_guard::{signal_name, SignalDeferral};
use crate::subsystem::SubsystemState;
use crate::types::{ContainerKind, EncryptType, FsType, MdLevel, MountBy, UsedByKind};

use super::actions::{build_all, CommitAction};
use super::executor::{ConfirmFn, Executor};
use super::scheduler::{schedule, ExecutionPlan};

/// First usable partition offset, in KiB.
pub const FIRST_PARTITION_OFFSET_K: u64 = 1024;

/// What a successful commit did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    /// Executed actions, in order
    pub executed: Vec<String>,
    /// First termination signal received while the batch ran
    pub deferred_signal: Option<i32>,
}

/// The storage planner engine.
pub struct Storage {
    config: EngineConfig,
    containers: Vec<Container>,
    next_id: u32,
    runner: Box<dyn CommandRunner>,
    prober: Box<dyn Prober>,
    subsystems: SubsystemState,
    confirm: Option<Box<ConfirmFn>>,
    lock: Option<EngineLock>,
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("containers", &self.containers.len())
            .field("read_only", &self.config.read_only)
            .field("dry_run", &self.runner.is_dry_run())
            .field("lock", &self.lock)
            .finish()
    }
}

impl Storage {
    /// Build an engine; takes the lock when a lock path is configured.
    pub fn new(config: EngineConfig, runner: Box<dyn CommandRunner>, prober: Box<dyn Prober>) -> Result<Self> {
        let lock = match &config.lock_path {
            Some(path) => {
                let mode = if config.read_only { LockMode::Shared } else { LockMode::Exclusive };
                Some(EngineLock::acquire(path, mode)?)
            }
            None => None,
        };
        info!(
            root = %config.root_prefix.display(),
            read_only = config.read_only,
            dry_run = runner.is_dry_run(),
            "Storage engine ready"
        );
        Ok(Self {
            config,
            containers: Vec::new(),
            next_id: 1,
            runner,
            prober,
            subsystems: SubsystemState::new(),
            confirm: None,
            lock,
        })
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn subsystems(&self) -> &SubsystemState {
        &self.subsystems
    }

    pub fn lock_mode(&self) -> Option<LockMode> {
        self.lock.as_ref().map(EngineLock::mode)
    }

    pub fn containers(&self) -> &[Container] {
        &self.containers
    }

    pub fn container(&self, id: ContainerId) -> Option<&Container> {
        self.containers.iter().find(|c| c.id == id)
    }

    pub fn container_by_name(&self, name: &str) -> Option<&Container> {
        self.containers.iter().find(|c| c.name == name && !c.deleted)
    }

    /// Live volume with this device path.
    pub fn volume(&self, device: &str) -> Option<&Volume> {
        self.containers.iter().find_map(|c| c.find_by_device(device))
    }

    /// The model as a serializable snapshot.
    pub fn snapshot(&self) -> ModelSnapshot {
        ModelSnapshot {
            containers: self.containers.clone(),
        }
    }

    /// Pending actions in execution order, one per dirty entity.
    pub fn plan(&self) -> ExecutionPlan {
        schedule(build_all(&self.containers))
    }

    /// Verify the extent bookkeeping of every pool.
    pub fn check_consistency(&self) -> Result<()> {
        for c in &self.containers {
            if let Some(pool) = c.pool() {
                pool::check_consistency(pool, &c.volumes).map_err(|e| match e {
                    StorageError::PeMapInconsistent(msg) => {
                        StorageError::pe_map(format!("{}: {}", c.name, msg))
                    }
                    other => other,
                })?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // Model population
    // ========================================================================

    /// Insert a probed container; ids follow insertion order.
    pub fn add_container(&mut self, mut container: Container) -> ContainerId {
        container.id = ContainerId(self.next_id);
        self.next_id += 1;
        debug!(id = %container.id, name = %container.name, kind = %container.kind(), "Container added");
        let id = container.id;
        self.containers.push(container);
        id
    }

    pub fn load_snapshot(&mut self, snapshot: ModelSnapshot) -> Vec<ContainerId> {
        snapshot
            .containers
            .into_iter()
            .map(|c| self.add_container(c))
            .collect()
    }

    pub fn set_confirm_callback<F>(&mut self, callback: F)
    where
        F: FnMut(&CommitAction) -> bool + 'static,
    {
        self.confirm = Some(Box::new(callback));
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(StorageError::read_only("engine opened read-only"));
        }
        Ok(())
    }

    /// Container and volume index of the live volume at `device`.
    fn locate(&self, device: &str) -> Result<(usize, usize)> {
        self.containers
            .iter()
            .enumerate()
            .find_map(|(ci, c)| {
                c.volumes
                    .iter()
                    .position(|v| v.device == device && !v.deleted)
                    .map(|vi| (ci, vi))
            })
            .ok_or_else(|| StorageError::not_found(device.to_string()))
    }

    /// Like `locate`, for a call that changes the volume.
    fn locate_writable(&self, device: &str) -> Result<(usize, usize)> {
        self.writable()?;
        let (ci, vi) = self.locate(device)?;
        if self.containers[ci].read_only {
            return Err(StorageError::read_only(self.containers[ci].name.clone()));
        }
        Ok((ci, vi))
    }

    fn writable_volume(&mut self, device: &str) -> Result<&mut Volume> {
        let (ci, vi) = self.locate_writable(device)?;
        Ok(&mut self.containers[ci].volumes[vi])
    }

    fn container_index(&self, name: &str) -> Result<usize> {
        self.containers
            .iter()
            .position(|c| c.name == name && !c.deleted)
            .ok_or_else(|| StorageError::not_found(format!("container {}", name)))
    }

    fn writable_container(&self, name: &str, kind: ContainerKind) -> Result<usize> {
        self.writable()?;
        let ci = self.container_index(name)?;
        let container = &self.containers[ci];
        if container.kind() != kind {
            return Err(StorageError::InvalidEntityKind {
                operation: "container operation",
                found: container.kind().to_string(),
            });
        }
        if container.read_only {
            return Err(StorageError::read_only(container.name.clone()));
        }
        Ok(ci)
    }

    fn disk_index(&self, device: &str) -> Result<usize> {
        self.writable()?;
        let ci = self
            .containers
            .iter()
            .position(|c| c.device == device)
            .ok_or_else(|| StorageError::not_found(device.to_string()))?;
        if self.containers[ci].kind() != ContainerKind::Disk {
            return Err(StorageError::InvalidEntityKind {
                operation: "partitioning",
                found: self.containers[ci].kind().to_string(),
            });
        }
        if self.containers[ci].read_only {
            return Err(StorageError::read_only(device.to_string()));
        }
        Ok(ci)
    }

    /// The virtual group of `kind`, created on first use.
    fn virtual_index(&mut self, kind: ContainerKind) -> Result<usize> {
        if let Some(ci) = self.containers.iter().position(|c| c.kind() == kind) {
            return Ok(ci);
        }
        let group = Container::virtual_group(kind).ok_or_else(|| StorageError::InvalidEntityKind {
            operation: "virtual group",
            found: kind.to_string(),
        })?;
        self.add_container(group);
        Ok(self.containers.len() - 1)
    }

    /// Fail unless `device` is a free volume; returns its size.
    fn claimable(&self, device: &str) -> Result<u64> {
        let (ci, vi) = self.locate(device)?;
        let volume = &self.containers[ci].volumes[vi];
        if let Some(used_by) = &volume.used_by {
            return Err(StorageError::in_use(device.to_string(), used_by.to_string()));
        }
        if !volume.mount.is_empty() {
            return Err(StorageError::in_use(device.to_string(), format!("mount {}", volume.mount)));
        }
        Ok(volume.size_k)
    }

    fn set_used_by_at(&mut self, device: &str, used_by: Option<UsedBy>) {
        if let Ok((ci, vi)) = self.locate(device) {
            self.containers[ci].volumes[vi].used_by = used_by;
        }
    }

    /// Forget `usedBy` entries naming `consumer`.
    fn release_consumed(&mut self, consumer: &str) {
        for volume in self.containers.iter_mut().flat_map(|c| c.volumes.iter_mut()) {
            if volume.used_by.as_ref().is_some_and(|u| u.device == consumer) {
                volume.used_by = None;
            }
        }
    }

    fn ensure_mount_free(&self, mount: &str, except: &str) -> Result<()> {
        if mount.is_empty() || mount == crate::model::volume::SWAP_MOUNT {
            return Ok(());
        }
        let holder = self
            .containers
            .iter()
            .flat_map(|c| c.live_volumes())
            .find(|v| v.mount == mount && v.device != except);
        match holder {
            Some(v) => Err(StorageError::in_use(mount.to_string(), v.device.clone())),
            None => Ok(()),
        }
    }

    fn members_per_pool(&self, device: &str, pe_size_k: u64) -> Result<PvInfo> {
        let size_k = self.claimable(device)?;
        let usable = size_k.saturating_sub(self.config.pv_metadata_reserve_k);
        let num_pe = usable / pe_size_k;
        if num_pe == 0 {
            return Err(StorageError::invalid(format!("{} is too small for an extent of {}k", device, pe_size_k)));
        }
        Ok(PvInfo::new(device, num_pe))
    }

    fn prepared(&self, volume: Volume) -> Volume {
        let mut volume = volume.into_pending();
        volume.mount_by = self.config.default_mount_by;
        volume
    }

    // ========================================================================
    // Disks
    // ========================================================================

    /// Append a partition of `size_k` KiB after the last live partition.
    pub fn create_partition(&mut self, disk: &str, size_k: u64) -> Result<String> {
        let ci = self.disk_index(disk)?;
        if size_k == 0 {
            return Err(StorageError::invalid("partition size must be positive"));
        }
        let container = &self.containers[ci];
        let disk_size = container.disk_info().map_or(0, |d| d.size_k);
        let start = container
            .live_volumes()
            .filter_map(|v| match &v.detail {
                VolumeDetail::Partition(p) => Some(p.start_k.saturating_add(v.size_k)),
                _ => None,
            })
            .max()
            .unwrap_or(FIRST_PARTITION_OFFSET_K);
        if start.checked_add(size_k).is_none_or(|end| end > disk_size) {
            return Err(StorageError::InsufficientSpace {
                requested: size_k,
                available: disk_size.saturating_sub(start),
            });
        }
        let number = container
            .live_volumes()
            .map(|v| v.key.sequence())
            .max()
            .map_or(1, |n| n + 1);

        let volume = self.prepared(Volume::partition(disk, number, start, size_k));
        let device = volume.device.clone();
        self.containers[ci].insert_volume(volume)?;
        info!(%device, start_k = start, size_k, "Partition planned");
        Ok(device)
    }

    /// Replace the partition table; every partition on the disk goes.
    pub fn destroy_partition_table(&mut self, disk: &str, label: &str) -> Result<()> {
        let ci = self.disk_index(disk)?;
        let container = &mut self.containers[ci];
        if let Some(v) = container.live_volumes().find(|v| v.used_by.is_some()) {
            let used_by = v.used_by.as_ref().map(ToString::to_string).unwrap_or_default();
            return Err(StorageError::in_use(v.device.clone(), used_by));
        }
        container.volumes.retain(|v| !v.created);
        for v in &mut container.volumes {
            v.deleted = true;
        }
        if let ContainerDetail::Disk(info) = &mut container.detail {
            info.destroy_label = true;
            if !label.is_empty() {
                info.label = label.to_string();
            }
        }
        info!(disk, label, "Partition table marked for replacement");
        Ok(())
    }

    // ========================================================================
    // Extent pools
    // ========================================================================

    /// New pool `name` over `members`; `pe_size_k == 0` takes the default.
    pub fn create_vg(&mut self, name: &str, pe_size_k: u64, members: &[&str]) -> Result<ContainerId> {
        self.writable()?;
        if name.is_empty() || name.contains('/') {
            return Err(StorageError::invalid(format!("invalid volume group name '{}'", name)));
        }
        if self.container_by_name(name).is_some() {
            return Err(StorageError::in_use(format!("/dev/{}", name), "existing container"));
        }
        let pe_size_k = if pe_size_k == 0 { self.config.default_pe_size_k } else { pe_size_k };
        if !pe_size_k.is_power_of_two() {
            return Err(StorageError::invalid(format!("extent size {}k is not a power of two", pe_size_k)));
        }

        let mut pool = ExtentPool::new(pe_size_k);
        for device in members {
            pool.add_member(self.members_per_pool(device, pe_size_k)?)?;
        }
        let mut container = Container::lvm(name, pool);
        container.created = true;
        let owner = UsedBy::new(UsedByKind::Lvm, container.device.clone());
        for device in members {
            self.set_used_by_at(device, Some(owner.clone()));
        }
        info!(name, pe_size_k, members = members.len(), "Volume group planned");
        Ok(self.add_container(container))
    }

    /// Remove pool `name` with all its logical volumes.
    pub fn remove_vg(&mut self, name: &str) -> Result<()> {
        let ci = self.writable_container(name, ContainerKind::Lvm)?;
        if let Some(v) = self.containers[ci].live_volumes().find(|v| v.used_by.is_some()) {
            let used_by = v.used_by.as_ref().map(ToString::to_string).unwrap_or_default();
            return Err(StorageError::in_use(v.device.clone(), used_by));
        }

        if self.containers[ci].created {
            let removed = self.containers.remove(ci);
            self.release_consumed(&removed.device);
            info!(name, "Pending volume group dropped");
            return Ok(());
        }

        let container = &mut self.containers[ci];
        container.volumes.retain(|v| !v.created);
        if let Some((pool, volumes)) = container.pool_and_volumes() {
            for v in volumes.iter_mut().filter(|v| !v.deleted) {
                if let Some(lv) = v.detail.lv_extents_mut() {
                    let mapped = lv.mapped();
                    pool.reclaim(&mut lv.pe_map, mapped)?;
                }
                v.deleted = true;
            }
        }
        container.deleted = true;
        info!(name, "Volume group marked for removal");
        Ok(())
    }

    /// Stage `members` to join pool `name`.
    pub fn extend_vg(&mut self, name: &str, members: &[&str]) -> Result<()> {
        let ci = self.writable_container(name, ContainerKind::Lvm)?;
        let owner = UsedBy::new(UsedByKind::Lvm, self.containers[ci].device.clone());
        let pe_size_k = self.containers[ci].pool().map_or(self.config.default_pe_size_k, |p| p.pe_size_k);

        for device in members {
            let staged_out = self.containers[ci]
                .pool()
                .is_some_and(|p| p.pv_remove.iter().any(|m| m.device == *device));
            let member = if staged_out {
                PvInfo::new(*device, 0)
            } else {
                self.members_per_pool(device, pe_size_k)?
            };
            if let Some(pool) = self.containers[ci].pool_mut() {
                pool.add_member(member)?;
            }
            self.set_used_by_at(device, Some(owner.clone()));
        }
        info!(name, added = members.len(), "Volume group extension planned");
        Ok(())
    }

    /// Stage `member` to leave pool `name`, moving its extents elsewhere.
    pub fn reduce_vg(&mut self, name: &str, member: &str) -> Result<()> {
        let ci = self.writable_container(name, ContainerKind::Lvm)?;
        let container = &mut self.containers[ci];
        let staged_out = match container.pool_and_volumes() {
            Some((pool, volumes)) => {
                pool::try_remove_member(pool, volumes, member)?;
                pool.pv_remove.iter().any(|m| m.device == member)
            }
            None => false,
        };
        if !staged_out {
            self.set_used_by_at(member, None);
        }
        info!(name, member, "Volume group reduction planned");
        Ok(())
    }

    /// New logical volume `lv` of `size_k` KiB in pool `vg`.
    pub fn create_lv(&mut self, vg: &str, lv: &str, size_k: u64, stripes: u32, stripe_size_k: u64) -> Result<String> {
        let ci = self.writable_container(vg, ContainerKind::Lvm)?;
        if lv.is_empty() || lv.contains('/') {
            return Err(StorageError::invalid(format!("invalid logical volume name '{}'", lv)));
        }
        if size_k == 0 || stripes == 0 {
            return Err(StorageError::invalid("size and stripe count must be positive"));
        }
        let key = VolumeKey::Name(lv.to_string());
        let container = &self.containers[ci];
        if let Some(existing) = container.find_volume(&key) {
            return Err(StorageError::in_use(existing.device.clone(), container.name.clone()));
        }
        let pool_device = container.device.clone();

        let mut extents = LvExtents::new(stripes, stripe_size_k);
        let pe_size_k = match self.containers[ci].pool_mut() {
            Some(pool) => {
                let le = pool.extents_for_volume(size_k, stripes)?;
                pool.allocate(&mut extents.pe_map, le, stripes)?;
                extents.le = le;
                pool.pe_size_k
            }
            None => return Err(StorageError::not_found(format!("extent pool {}", vg))),
        };

        let volume = self.prepared(Volume::logical(&pool_device, lv, pe_size_k, extents));
        let device = volume.device.clone();
        self.containers[ci].insert_volume(volume)?;
        info!(%device, size_k, stripes, "Logical volume planned");
        Ok(device)
    }

    // ========================================================================
    // RAID, loop and virtual mounts
    // ========================================================================

    /// New software RAID array over `members`.
    pub fn create_md(&mut self, level: MdLevel, members: &[&str], chunk_k: u64) -> Result<String> {
        self.writable()?;
        if members.len() < level.min_members() {
            return Err(StorageError::invalid(format!(
                "{} needs at least {} members, got {}",
                level,
                level.min_members(),
                members.len()
            )));
        }
        let mut sizes = Vec::with_capacity(members.len());
        for (i, device) in members.iter().enumerate() {
            if members[..i].contains(device) {
                return Err(StorageError::invalid(format!("{} listed twice", device)));
            }
            sizes.push(self.claimable(device)?);
        }

        let gi = self.virtual_index(ContainerKind::Md)?;
        let number = self.containers[gi].next_number();
        let device = format!("/dev/md{}", number);
        let info = MdInfo {
            number,
            level,
            members: members.iter().map(|m| m.to_string()).collect(),
            chunk_k,
        };
        let volume = self.prepared(Volume::new(
            VolumeKey::Num(number),
            device.clone(),
            level.usable_size_k(&sizes),
            VolumeDetail::Md(info),
        ));
        self.containers[gi].insert_volume(volume)?;
        let owner = UsedBy::new(UsedByKind::Md, device.clone());
        for member in members {
            self.set_used_by_at(member, Some(owner.clone()));
        }
        info!(%device, %level, members = members.len(), "RAID array planned");
        Ok(device)
    }

    /// New loop device over `file`. A reused file keeps its size when
    /// `size_k` is 0.
    pub fn create_loop(&mut self, file: &Path, reuse_file: bool, size_k: u64) -> Result<String> {
        self.writable()?;
        let size_k = match (reuse_file, size_k) {
            (true, 0) => {
                let meta = fs::metadata(self.config.under_root(file))
                    .map_err(|_| StorageError::not_found(file.display().to_string()))?;
                meta.len() / 1024
            }
            (false, 0) => return Err(StorageError::invalid("loop file size must be positive")),
            (_, size) => size,
        };
        let gi = self.virtual_index(ContainerKind::Loop)?;
        let taken = self.containers[gi]
            .live_volumes()
            .any(|v| matches!(&v.detail, VolumeDetail::Loop(lo) if lo.file.as_path() == file));
        if taken {
            return Err(StorageError::in_use(file.display().to_string(), "loop device"));
        }
        let number = self.containers[gi].next_number();
        let device = format!("/dev/loop{}", number);
        let info = LoopInfo {
            number,
            file: PathBuf::from(file),
            reuse_file,
        };
        let volume = self.prepared(Volume::new(VolumeKey::Num(number), device.clone(), size_k, VolumeDetail::Loop(info)));
        self.containers[gi].insert_volume(volume)?;
        info!(%device, file = %file.display(), size_k, "Loop device planned");
        Ok(device)
    }

    fn add_virtual_mount(&mut self, kind: ContainerKind, device: String, mount: &str, options: &str, detail: VolumeDetail, fs_type: FsType) -> Result<String> {
        self.writable()?;
        if !mount.starts_with('/') {
            return Err(StorageError::invalid(format!("mount point must be absolute: '{}'", mount)));
        }
        self.ensure_mount_free(mount, "")?;
        let gi = self.virtual_index(kind)?;
        let mut volume = Volume::new(VolumeKey::Name(mount.to_string()), device.clone(), 0, detail).into_pending();
        volume.fs = fs_type;
        volume.mount = mount.to_string();
        volume.fstab_options = options.trim().to_string();
        self.containers[gi].insert_volume(volume)?;
        info!(%device, mount, "Virtual mount planned");
        Ok(device)
    }

    /// Mount NFS `share` at `mount`.
    pub fn add_nfs(&mut self, share: &str, mount: &str, options: &str) -> Result<String> {
        if !share.contains(':') {
            return Err(StorageError::invalid(format!("'{}' is not a host:/path share", share)));
        }
        let detail = VolumeDetail::Nfs(NfsInfo { share: share.to_string() });
        self.add_virtual_mount(ContainerKind::Nfs, share.to_string(), mount, options, detail, FsType::Nfs)
    }

    /// Mount a tmpfs at `mount`; its device is named `tmpfs:<mount>`.
    pub fn add_tmpfs(&mut self, mount: &str, options: &str) -> Result<String> {
        let device = format!("tmpfs:{}", mount);
        self.add_virtual_mount(ContainerKind::Tmpfs, device, mount, options, VolumeDetail::Tmpfs, FsType::Tmpfs)
    }

    /// Register an existing device-mapper device from its table text.
    ///
    /// Volumes the table consumes are marked as used by the new device.
    pub fn probe_dm_volume(&mut self, name: &str, table_text: &str) -> Result<String> {
        let table = DmTable::parse(table_text)?;
        let device = format!("/dev/mapper/{}", name);
        let root = self.config.root_prefix.clone();
        let pe_map = table.pe_map(self.config.default_pe_size_k, |majmin| resolve_block_device(&root, majmin));

        let gi = self.virtual_index(ContainerKind::Dm)?;
        let info = DmInfo {
            targets: table.target_names(),
            pe_map: pe_map.clone(),
        };
        let mut volume = Volume::new(VolumeKey::Name(name.to_string()), device.clone(), table.size_k(), VolumeDetail::Dm(info));
        volume.uuid = self.prober.device_uuid(&device).unwrap_or_default();
        self.containers[gi].insert_volume(volume)?;

        let owner = UsedBy::new(UsedByKind::Dm, device.clone());
        for member in pe_map.keys() {
            if let Ok((ci, vi)) = self.locate(member) {
                let v = &mut self.containers[ci].volumes[vi];
                if v.used_by.is_none() {
                    v.used_by = Some(owner.clone());
                }
            }
        }
        debug!(%device, targets = table.targets.len(), "Device-mapper volume registered");
        Ok(device)
    }

    // ========================================================================
    // Volume-generic changes
    // ========================================================================

    /// Remove the volume at `device`. A pending volume simply disappears.
    pub fn remove_volume(&mut self, device: &str) -> Result<()> {
        let (ci, vi) = self.locate_writable(device)?;
        let container = &mut self.containers[ci];
        if let Some(used_by) = &container.volumes[vi].used_by {
            return Err(StorageError::in_use(device.to_string(), used_by.to_string()));
        }

        if let Some((pool, volumes)) = container.pool_and_volumes() {
            if let Some(lv) = volumes[vi].detail.lv_extents_mut() {
                let mapped = lv.mapped();
                pool.reclaim(&mut lv.pe_map, mapped)?;
            }
        }
        if container.volumes[vi].created {
            container.volumes.remove(vi);
            self.release_consumed(device);
            info!(device, "Pending volume dropped");
        } else {
            container.volumes[vi].deleted = true;
            info!(device, "Volume marked for removal");
        }
        Ok(())
    }

    /// Change the size of a partition or logical volume.
    pub fn resize_volume(&mut self, device: &str, size_k: u64) -> Result<()> {
        let (ci, vi) = self.locate_writable(device)?;
        if size_k == 0 {
            return Err(StorageError::invalid("size must be positive"));
        }
        let volume = &self.containers[ci].volumes[vi];
        if !volume.detail.can_resize() {
            return Err(StorageError::InvalidEntityKind {
                operation: "resize",
                found: volume.detail.kind_name().to_string(),
            });
        }
        if let Some(used_by) = &volume.used_by {
            return Err(StorageError::in_use(device.to_string(), used_by.to_string()));
        }
        check_fs_resize(volume, size_k)?;

        let container = &mut self.containers[ci];
        match container.volumes[vi].detail.clone() {
            VolumeDetail::Partition(part) => {
                let limit = container
                    .live_volumes()
                    .filter_map(|v| match &v.detail {
                        VolumeDetail::Partition(p) if p.start_k > part.start_k => Some(p.start_k),
                        _ => None,
                    })
                    .min()
                    .or_else(|| container.disk_info().map(|d| d.size_k))
                    .unwrap_or(0);
                if part.start_k.checked_add(size_k).is_none_or(|end| end > limit) {
                    return Err(StorageError::InsufficientSpace {
                        requested: size_k,
                        available: limit.saturating_sub(part.start_k),
                    });
                }
                container.volumes[vi].size_k = size_k;
            }
            VolumeDetail::LogicalVolume(_) => {
                let Some((pool, volumes)) = container.pool_and_volumes() else {
                    return Err(StorageError::not_found(format!("extent pool of {}", device)));
                };
                let volume = &mut volumes[vi];
                let stripes = volume.detail.stripes();
                let new_le = pool.extents_for_volume(size_k, stripes)?;
                let Some(lv) = volume.detail.lv_extents_mut() else {
                    return Err(StorageError::not_found(device.to_string()));
                };
                if new_le > lv.le {
                    pool.allocate(&mut lv.pe_map, new_le - lv.le, stripes)?;
                } else if new_le < lv.le {
                    pool.reclaim(&mut lv.pe_map, lv.le - new_le)?;
                }
                lv.le = new_le;
                volume.size_k = new_le * pool.pe_size_k;
            }
            other => {
                return Err(StorageError::InvalidEntityKind {
                    operation: "resize",
                    found: other.kind_name().to_string(),
                })
            }
        }
        info!(device, size_k, "Resize planned");
        Ok(())
    }

    /// Request (or cancel) a new filesystem on the volume.
    pub fn change_format(&mut self, device: &str, format: bool, fs_type: FsType) -> Result<()> {
        let volume = self.writable_volume(device)?;
        if let Some(used_by) = &volume.used_by {
            return Err(StorageError::in_use(device.to_string(), used_by.to_string()));
        }
        if !volume.detail.can_format() {
            return Err(StorageError::InvalidEntityKind {
                operation: "format",
                found: volume.detail.kind_name().to_string(),
            });
        }
        if format {
            if !fs_type.is_block_fs() {
                return Err(StorageError::UnsupportedByFilesystem { fs: fs_type, operation: "format" });
            }
            volume.format = true;
            volume.fs = fs_type;
        } else {
            volume.format = false;
            volume.fs = volume.detected_fs;
        }
        debug!(device, format, fs = %volume.fs, "Format changed");
        Ok(())
    }

    /// Set the mount point; empty unmounts, `swap` activates swap.
    pub fn change_mount(&mut self, device: &str, mount: &str) -> Result<()> {
        let (ci, vi) = self.locate_writable(device)?;
        let volume = &self.containers[ci].volumes[vi];
        if let Some(used_by) = &volume.used_by {
            return Err(StorageError::in_use(device.to_string(), used_by.to_string()));
        }
        if mount == crate::model::volume::SWAP_MOUNT {
            if volume.fs != FsType::Swap {
                return Err(StorageError::invalid(format!("{} does not hold swap", device)));
            }
        } else if !mount.is_empty() && !mount.starts_with('/') {
            return Err(StorageError::invalid(format!("mount point must be absolute: '{}'", mount)));
        }
        self.ensure_mount_free(mount, device)?;
        self.containers[ci].volumes[vi].mount = mount.to_string();
        debug!(device, mount, "Mount point changed");
        Ok(())
    }

    /// How the fstab entry names the device.
    pub fn change_mount_by(&mut self, device: &str, mount_by: MountBy) -> Result<()> {
        let volume = self.writable_volume(device)?;
        let caps = volume.fs.capabilities();
        match mount_by {
            MountBy::Uuid if !caps.supports_uuid => {
                return Err(StorageError::UnsupportedByFilesystem { fs: volume.fs, operation: "mount by uuid" });
            }
            MountBy::Label if !caps.supports_label => {
                return Err(StorageError::UnsupportedByFilesystem { fs: volume.fs, operation: "mount by label" });
            }
            MountBy::Label if volume.label.is_empty() => {
                return Err(StorageError::invalid(format!("{} has no label", device)));
            }
            _ => {}
        }
        volume.mount_by = mount_by;
        Ok(())
    }

    pub fn change_fstab_options(&mut self, device: &str, options: &str) -> Result<()> {
        let options = options.trim();
        if options.contains(char::is_whitespace) {
            return Err(StorageError::invalid(format!("fstab options may not contain spaces: '{}'", options)));
        }
        self.writable_volume(device)?.fstab_options = options.to_string();
        Ok(())
    }

    pub fn change_label(&mut self, device: &str, label: &str) -> Result<()> {
        let volume = self.writable_volume(device)?;
        let caps = volume.fs.capabilities();
        if !caps.supports_label {
            return Err(StorageError::UnsupportedByFilesystem { fs: volume.fs, operation: "label" });
        }
        if label.len() > caps.label_max_len {
            return Err(StorageError::invalid(format!(
                "label '{}' exceeds {} characters for {}",
                label, caps.label_max_len, volume.fs
            )));
        }
        if label.is_empty() && volume.mount_by == MountBy::Label {
            return Err(StorageError::invalid(format!("{} is mounted by label", device)));
        }
        volume.label = label.to_string();
        Ok(())
    }

    /// Layer encryption over the volume. Turning it on needs a key file and
    /// a new volume or a pending format.
    pub fn set_encryption(&mut self, device: &str, encryption: EncryptType, key_file: Option<PathBuf>) -> Result<()> {
        let volume = self.writable_volume(device)?;
        if encryption != EncryptType::None {
            if key_file.is_none() {
                return Err(StorageError::invalid(format!("encrypting {} needs a key file", device)));
            }
            if volume.orig_encryption == EncryptType::None && !volume.created && !volume.format {
                return Err(StorageError::invalid(format!("encrypting {} needs a format", device)));
            }
        }
        volume.encryption = encryption;
        volume.crypt_key_file = key_file;
        debug!(device, %encryption, "Encryption changed");
        Ok(())
    }

    pub fn set_used_by(&mut self, device: &str, used_by: Option<UsedBy>) -> Result<()> {
        self.writable_volume(device)?.used_by = used_by;
        Ok(())
    }

    // ========================================================================
    // Commit
    // ========================================================================

    /// Realize every pending change. Fail-fast, no rollback.
    pub fn commit(&mut self) -> Result<CommitReport> {
        self.writable()?;
        let mut deferral = if self.config.defer_signals {
            match SignalDeferral::install() {
                Ok(deferral) => Some(deferral),
                Err(e) => {
                    warn!(error = %e, "Could not defer signals during commit");
                    None
                }
            }
        } else {
            None
        };

        let result = Executor::new(
            &mut self.containers,
            self.runner.as_mut(),
            self.prober.as_mut(),
            &mut self.subsystems,
            &self.config,
        )
        .with_confirm(self.confirm.as_deref_mut())
        .with_signals(deferral.as_mut())
        .run();

        let deferred_signal = deferral.and_then(SignalDeferral::finish);
        if let Some(sig) = deferred_signal {
            warn!(signal = signal_name(sig), "Signal arrived during commit");
        }
        Ok(CommitReport {
            executed: result?,
            deferred_signal,
        })
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.subsystems.teardown();
    }
}

/// Refuse size changes the filesystem cannot follow.
fn check_fs_resize(volume: &Volume, size_k: u64) -> Result<()> {
    if volume.format || volume.detected_fs == FsType::Unknown {
        return Ok(());
    }
    let fs = volume.detected_fs;
    let caps = fs.capabilities();
    if size_k > volume.size_k && !caps.can_grow {
        return Err(StorageError::UnsupportedByFilesystem { fs, operation: "grow" });
    }
    if size_k < volume.size_k && !caps.can_shrink {
        return Err(StorageError::UnsupportedByFilesystem { fs, operation: "shrink" });
    }
    if caps.resize_needs_mount && volume.orig_mount.is_empty() {
        return Err(StorageError::UnsupportedByFilesystem { fs, operation: "resize while unmounted" });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::RecordingRunner;
    use crate::engine::ActionKind;
    use crate::probe::StaticProber;

    fn engine() -> Storage {
        let config = EngineConfig::for_root("/mnt");
        let mut storage = Storage::new(config, Box::new(RecordingRunner::new()), Box::new(StaticProber::new()))
            .expect("engine"); // test: known-good input
        storage.add_container(Container::disk("/dev/sda", 100 << 20, "gpt"));
        storage.add_container(Container::disk("/dev/sdb", 100 << 20, "gpt"));
        storage
    }

    #[test]
    fn test_partitions_are_appended() {
        let mut s = engine();
        let first = s.create_partition("/dev/sda", 512 << 10).expect("p1"); // test: known-good input
        let second = s.create_partition("/dev/sda", 1 << 20).expect("p2"); // test: known-good input
        assert_eq!((first.as_str(), second.as_str()), ("/dev/sda1", "/dev/sda2"));

        let p2 = s.volume("/dev/sda2").expect("p2"); // test: known-good input
        match &p2.detail {
            VolumeDetail::Partition(p) => assert_eq!(p.start_k, FIRST_PARTITION_OFFSET_K + (512 << 10)),
            other => panic!("unexpected detail {other:?}"),
        }
        assert_eq!(p2.mount_by, MountBy::Uuid);
        assert!(matches!(
            s.create_partition("/dev/sda", 200 << 20),
            Err(StorageError::InsufficientSpace { .. })
        ));
    }

    #[test]
    fn test_read_only_engine_refuses_changes() {
        let config = EngineConfig {
            read_only: true,
            ..EngineConfig::for_root("/mnt")
        };
        let mut s = Storage::new(config, Box::new(RecordingRunner::new()), Box::new(StaticProber::new()))
            .expect("engine"); // test: known-good input
        s.add_container(Container::disk("/dev/sda", 100 << 20, "gpt"));
        assert!(matches!(s.create_partition("/dev/sda", 1024), Err(StorageError::ReadOnly(_))));
        assert!(matches!(s.commit(), Err(StorageError::ReadOnly(_))));
    }

    #[test]
    fn test_pool_lifecycle_keeps_invariant() {
        let mut s = engine();
        let a = s.create_partition("/dev/sda", 41 << 10).expect("pv a"); // test: known-good input
        let b = s.create_partition("/dev/sdb", 21 << 10).expect("pv b"); // test: known-good input
        s.create_vg("system", 4096, &[&a, &b]).expect("vg"); // test: known-good input

        let vg = s.container_by_name("system").expect("vg"); // test: known-good input
        let pool = vg.pool().expect("pool"); // test: known-good input
        assert_eq!((pool.num_pe, pool.free_pe), (15, 15));
        assert!(s.volume(&a).and_then(|v| v.used_by.as_ref()).is_some());

        let root = s.create_lv("system", "root", 40 << 10, 1, 0).expect("lv"); // test: known-good input
        assert_eq!(root, "/dev/system/root");
        s.resize_volume(&root, 48 << 10).expect("grow"); // test: known-good input
        s.check_consistency().expect("consistent"); // test: known-good input
        assert_eq!(s.container_by_name("system").and_then(|c| c.pool()).map(|p| p.free_pe), Some(3));

        s.remove_volume(&root).expect("remove"); // test: known-good input
        assert!(s.volume(&root).is_none());
        s.check_consistency().expect("consistent"); // test: known-good input

        assert!(matches!(s.remove_volume(&a), Err(StorageError::AlreadyInUse { .. })));
        s.remove_vg("system").expect("remove vg"); // test: known-good input
        assert!(s.container_by_name("system").is_none());
        assert!(s.volume(&a).and_then(|v| v.used_by.as_ref()).is_none());
    }

    #[test]
    fn test_oversized_requests_are_refused_without_overflow() {
        let mut s = engine();
        let err = s.create_partition("/dev/sda", u64::MAX).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientSpace { requested: u64::MAX, .. }));

        let dev = s.create_partition("/dev/sda", 8 << 20).expect("part"); // test: known-good input
        let err = s.resize_volume(&dev, u64::MAX).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientSpace { requested: u64::MAX, .. }));
        assert_eq!(s.volume(&dev).map(|v| v.size_k), Some(8 << 20));

        s.create_vg("data", 1, &[&dev]).expect("vg"); // test: known-good input
        let err = s.create_lv("data", "huge", u64::MAX, 2, 0).unwrap_err();
        assert!(matches!(err, StorageError::InsufficientSpace { .. }));
    }

    #[test]
    fn test_xfs_cannot_shrink() {
        let mut s = engine();
        let dev = s.create_partition("/dev/sda", 8 << 20).expect("part"); // test: known-good input
        let (ci, vi) = s.locate(&dev).expect("locate"); // test: known-good input
        let v = &mut s.containers[ci].volumes[vi];
        v.created = false;
        v.orig_size_k = v.size_k;
        v.detected_fs = FsType::Xfs;
        v.fs = FsType::Xfs;
        v.orig_mount = "/srv".into();
        v.mount = "/srv".into();

        let err = s.resize_volume(&dev, 4 << 20).unwrap_err();
        assert!(matches!(err, StorageError::UnsupportedByFilesystem { fs: FsType::Xfs, operation: "shrink" }));
        s.change_format(&dev, true, FsType::Ext4).expect("format"); // test: known-good input
        s.resize_volume(&dev, 4 << 20).expect("shrink with format"); // test: known-good input

        let kinds: Vec<ActionKind> = s.plan().actions.iter().map(|a| a.kind).collect();
        assert_eq!(kinds, vec![ActionKind::Format]);
    }

    #[test]
    fn test_md_claims_members() {
        let mut s = engine();
        let a = s.create_partition("/dev/sda", 1 << 20).expect("a"); // test: known-good input
        let b = s.create_partition("/dev/sdb", 2 << 20).expect("b"); // test: known-good input
        assert!(s.create_md(MdLevel::Raid5, &[&a, &b], 0).is_err());

        let md = s.create_md(MdLevel::Raid1, &[&a, &b], 0).expect("md"); // test: known-good input
        assert_eq!(md, "/dev/md0");
        assert_eq!(s.volume(&md).map(|v| v.size_k), Some(1 << 20));
        assert!(matches!(s.create_md(MdLevel::Raid1, &[&a, &b], 0), Err(StorageError::AlreadyInUse { .. })));

        s.remove_volume(&md).expect("drop pending md"); // test: known-good input
        assert!(s.volume(&a).and_then(|v| v.used_by.as_ref()).is_none());
    }

    #[test]
    fn test_virtual_mounts_and_labels() {
        let mut s = engine();
        s.add_tmpfs("/tmp", "size=2G").expect("tmpfs"); // test: known-good input
        assert!(matches!(s.add_nfs("srv:/export", "/tmp", ""), Err(StorageError::AlreadyInUse { .. })));
        assert!(s.add_nfs("no-share", "/net", "").is_err());
        s.add_nfs("srv:/export", "/net", "ro").expect("nfs"); // test: known-good input
        assert!(s.change_format("srv:/export", true, FsType::Ext4).is_err());

        let dev = s.create_partition("/dev/sda", 1 << 20).expect("part"); // test: known-good input
        s.change_format(&dev, true, FsType::Vfat).expect("format"); // test: known-good input
        assert!(s.change_label(&dev, "TOO-LONG-LABEL").is_err());
        s.change_label(&dev, "EFI").expect("label"); // test: known-good input
        s.change_mount_by(&dev, MountBy::Label).expect("mount by label"); // test: known-good input
        assert!(s.change_mount(&dev, "boot").is_err());
        s.change_mount(&dev, "/boot").expect("mount"); // test: known-good input
    }

    #[test]
    fn test_dm_volume_claims_table_devices() {
        let mut s = engine();
        let dev = s.create_partition("/dev/sda", 1 << 20).expect("part"); // test: known-good input
        let table = format!("0 2097152 crypt aes-xts-plain64 :64:logon:cryptsetup 0 {} 4096\n", dev);
        let dm = s.probe_dm_volume("cr_data", &table).expect("dm"); // test: known-good input
        assert_eq!(dm, "/dev/mapper/cr_data");
        assert_eq!(
            s.volume(&dev).and_then(|v| v.used_by.as_ref()).map(|u| u.device.as_str()),
            Some("/dev/mapper/cr_data")
        );
    }

    #[test]
    fn test_plan_renders_pending_work() {
        let mut s = engine();
        let dev = s.create_partition("/dev/sda", 1 << 20).expect("part"); // test: known-good input
        s.change_format(&dev, true, FsType::Ext4).expect("format"); // test: known-good input
        let plan = s.plan();
        assert_eq!(plan.len(), 1);
        assert!(plan.summary().contains("Create partition /dev/sda1"));
    }
}
