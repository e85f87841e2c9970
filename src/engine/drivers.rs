//! Drivers: the external tool invocations behind each commit action.
//!
//! A driver only builds command lines; the executor runs them. Dispatch is a
//! match over the action kind and the entity variant, and a combination no
//! tool handles yields `InvalidEntityKind`.

use crate::config::EngineConfig;
use crate::error::{Result, StorageError};
use crate::model::{Container, ContainerDetail, Volume, VolumeDetail};
use crate::types::{EncryptType, FsType};

use super::actions::{ActionKind, CommitAction};

/// Commands for one action, plus the device node to wait for afterwards.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverPlan {
    pub commands: Vec<Vec<String>>,
    pub wait_for: Option<String>,
}

impl DriverPlan {
    fn push<S: AsRef<str>>(&mut self, parts: &[S]) {
        self.commands.push(parts.iter().map(|p| p.as_ref().to_string()).collect());
    }

    fn wait(mut self, device: &str) -> Self {
        self.wait_for = Some(device.to_string());
        self
    }
}

fn wrong_kind(operation: &'static str, found: &str) -> StorageError {
    StorageError::InvalidEntityKind {
        operation,
        found: found.to_string(),
    }
}

/// Commands realizing `action`.
pub fn plan_action(
    action: &CommitAction,
    container: &Container,
    volume: Option<&Volume>,
    config: &EngineConfig,
) -> Result<DriverPlan> {
    match volume {
        Some(volume) => plan_volume(action, container, volume, config),
        None => plan_container(action, container, config),
    }
}

// ============================================================================
// Container actions
// ============================================================================

fn plan_container(action: &CommitAction, container: &Container, config: &EngineConfig) -> Result<DriverPlan> {
    let mut plan = DriverPlan::default();
    match (&container.detail, action.kind) {
        (ContainerDetail::Lvm(pool), ActionKind::Create) => {
            let devices: Vec<&str> = pool.pv_add.iter().map(|m| m.device.as_str()).collect();
            for dev in &devices {
                plan.push(&["pvcreate", "-ff", "-y", dev]);
            }
            let pe = format!("{}k", pool.pe_size_k);
            let mut cmd = vec!["vgcreate", "-s", pe.as_str(), container.name.as_str()];
            cmd.extend(devices.iter().copied());
            plan.push(&cmd);
        }
        (ContainerDetail::Lvm(pool), ActionKind::ExtendPool) => {
            let devices: Vec<&str> = pool.pv_add.iter().map(|m| m.device.as_str()).collect();
            for dev in &devices {
                plan.push(&["pvcreate", "-ff", "-y", dev]);
            }
            let mut cmd = vec!["vgextend", container.name.as_str()];
            cmd.extend(devices.iter().copied());
            plan.push(&cmd);
        }
        (ContainerDetail::Lvm(pool), ActionKind::ReducePool) => {
            for member in &pool.pv_remove {
                plan.push(&["vgreduce", container.name.as_str(), member.device.as_str()]);
                plan.push(&["pvremove", "-y", member.device.as_str()]);
            }
        }
        (ContainerDetail::Lvm(pool), ActionKind::Remove) => {
            unmount_all(&mut plan, container, config);
            plan.push(&["vgremove", "-f", container.name.as_str()]);
            for member in pool.pv.iter().chain(pool.pv_remove.iter()) {
                plan.push(&["pvremove", "-y", member.device.as_str()]);
            }
        }
        (ContainerDetail::Disk(disk), ActionKind::DestroyTable) => {
            unmount_all(&mut plan, container, config);
            let label = if disk.label.is_empty() { "gpt" } else { disk.label.as_str() };
            plan.push(&["parted", "-s", container.device.as_str(), "mklabel", label]);
            plan.push(&["udevadm", "settle"]);
        }
        _ => return Err(wrong_kind("container action", &format!("{} on {}", action.kind, container.kind()))),
    }
    Ok(plan)
}

fn unmount_all(plan: &mut DriverPlan, container: &Container, config: &EngineConfig) {
    for v in container.volumes.iter().filter(|v| !v.orig_mount.is_empty()) {
        unmount(plan, v, config);
    }
}

// ============================================================================
// Volume actions
// ============================================================================

fn plan_volume(
    action: &CommitAction,
    container: &Container,
    volume: &Volume,
    config: &EngineConfig,
) -> Result<DriverPlan> {
    match action.kind {
        ActionKind::Remove => plan_remove(volume, container, config),
        ActionKind::Resize => plan_resize(action, volume, container, config),
        ActionKind::Create => plan_create(volume, container),
        ActionKind::Setup => plan_setup(volume),
        ActionKind::Format => plan_format(volume, config),
        ActionKind::Mount => plan_mount(volume, config),
        other => Err(wrong_kind("volume action", &other.to_string())),
    }
}

fn plan_remove(volume: &Volume, container: &Container, config: &EngineConfig) -> Result<DriverPlan> {
    let mut plan = DriverPlan::default();
    if !volume.orig_mount.is_empty() {
        unmount(&mut plan, volume, config);
    }
    if volume.crypt_active {
        plan.push(&["cryptsetup", "close", volume.crypt_name().as_str()]);
    }
    match &volume.detail {
        VolumeDetail::Partition(p) => {
            plan.push(&["parted", "-s", container.device.as_str(), "rm", p.number.to_string().as_str()]);
            plan.push(&["udevadm", "settle"]);
        }
        VolumeDetail::LogicalVolume(_) => plan.push(&["lvremove", "-f", volume.device.as_str()]),
        VolumeDetail::Md(md) => {
            plan.push(&["mdadm", "--stop", volume.device.as_str()]);
            for member in &md.members {
                plan.push(&["mdadm", "--zero-superblock", member.as_str()]);
            }
        }
        VolumeDetail::Dm(_) => {
            let name = volume.device.rsplit('/').next().unwrap_or(&volume.device);
            plan.push(&["dmsetup", "remove", name]);
        }
        VolumeDetail::Loop(lo) => {
            if volume.loop_active {
                plan.push(&["losetup", "-d", volume.device.as_str()]);
            }
            if !lo.reuse_file {
                plan.push(&["rm", "-f", lo.file.to_string_lossy().as_ref()]);
            }
        }
        VolumeDetail::Nfs(_) | VolumeDetail::Tmpfs => {}
    }
    Ok(plan)
}

fn plan_resize(
    action: &CommitAction,
    volume: &Volume,
    container: &Container,
    config: &EngineConfig,
) -> Result<DriverPlan> {
    let mut device = DriverPlan::default();
    match &volume.detail {
        VolumeDetail::Partition(p) => {
            let end = format!("{}KiB", p.start_k + volume.size_k);
            device.push(&[
                "parted",
                "-s",
                container.device.as_str(),
                "unit",
                "KiB",
                "resizepart",
                p.number.to_string().as_str(),
                end.as_str(),
            ]);
        }
        VolumeDetail::LogicalVolume(lv) => {
            device.push(&["lvresize", "-f", "-l", lv.le.to_string().as_str(), volume.device.as_str()]);
        }
        other => return Err(wrong_kind("resize", other.kind_name())),
    }

    let mut fs = DriverPlan::default();
    if action.resize_fs {
        fs_resize(&mut fs, volume, config)?;
    }

    let shrinking = volume.size_k < volume.orig_size_k;
    let mut plan = DriverPlan::default();
    let (first, second) = if shrinking { (fs, device) } else { (device, fs) };
    plan.commands.extend(first.commands);
    plan.commands.extend(second.commands);
    Ok(plan)
}

fn fs_resize(plan: &mut DriverPlan, volume: &Volume, config: &EngineConfig) -> Result<()> {
    let dev = volume.fs_device();
    let size = format!("{}K", volume.size_k);
    let mounted_at = || config.under_root(volume.orig_mount.as_ref()).to_string_lossy().into_owned();
    match volume.detected_fs {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => plan.push(&["resize2fs", dev.as_str(), size.as_str()]),
        FsType::Btrfs => {
            let size = format!("{}k", volume.size_k);
            plan.push(&["btrfs", "filesystem", "resize", size.as_str(), mounted_at().as_str()]);
        }
        FsType::Xfs => plan.push(&["xfs_growfs", mounted_at().as_str()]),
        FsType::Ntfs => {
            let size = format!("{}k", volume.size_k);
            plan.push(&["ntfsresize", "-f", "-s", size.as_str(), dev.as_str()]);
        }
        FsType::Swap => {
            let mut cmd = vec!["mkswap", "-f"];
            if !volume.label.is_empty() {
                cmd.extend(["-L", volume.label.as_str()]);
            }
            cmd.push(dev.as_str());
            plan.push(&cmd);
        }
        FsType::Unknown => {}
        fs @ (FsType::Vfat | FsType::Nfs | FsType::Tmpfs) => {
            return Err(StorageError::UnsupportedByFilesystem { fs, operation: "resize" });
        }
    }
    Ok(())
}

fn plan_create(volume: &Volume, container: &Container) -> Result<DriverPlan> {
    let mut plan = DriverPlan::default();
    match &volume.detail {
        VolumeDetail::Partition(p) => {
            let start = format!("{}KiB", p.start_k);
            let end = format!("{}KiB", p.start_k + volume.size_k);
            plan.push(&[
                "parted",
                "-s",
                "-a",
                "optimal",
                container.device.as_str(),
                "unit",
                "KiB",
                "mkpart",
                "primary",
                start.as_str(),
                end.as_str(),
            ]);
            plan.push(&["udevadm", "settle"]);
            Ok(plan.wait(&volume.device))
        }
        VolumeDetail::LogicalVolume(lv) => {
            let name = volume.key.to_string();
            let le = lv.le.to_string();
            let stripes = lv.stripes.to_string();
            let stripe_size = format!("{}k", lv.stripe_size_k);
            let mut cmd = vec!["lvcreate", "-y", "-n", name.as_str(), "-l", le.as_str()];
            if lv.stripes > 1 {
                cmd.extend(["-i", stripes.as_str()]);
                if lv.stripe_size_k > 0 {
                    cmd.extend(["-I", stripe_size.as_str()]);
                }
            }
            cmd.push(container.name.as_str());
            plan.push(&cmd);
            Ok(plan.wait(&volume.device))
        }
        VolumeDetail::Md(md) => {
            let level = format!("--level={}", md.level);
            let count = format!("--raid-devices={}", md.members.len());
            let chunk = format!("--chunk={}", md.chunk_k);
            let mut cmd = vec!["mdadm", "--create", volume.device.as_str(), "--run", level.as_str(), count.as_str()];
            if md.chunk_k > 0 {
                cmd.push(chunk.as_str());
            }
            cmd.extend(md.members.iter().map(String::as_str));
            plan.push(&cmd);
            Ok(plan.wait(&volume.device))
        }
        VolumeDetail::Loop(lo) => {
            let file = lo.file.to_string_lossy();
            if !lo.reuse_file {
                let size = format!("{}K", volume.size_k);
                plan.push(&["truncate", "-s", size.as_str(), file.as_ref()]);
            }
            plan.push(&["losetup", volume.device.as_str(), file.as_ref()]);
            Ok(plan.wait(&volume.device))
        }
        VolumeDetail::Nfs(_) | VolumeDetail::Tmpfs => Ok(plan),
        VolumeDetail::Dm(_) => Err(wrong_kind("create", "device-mapper")),
    }
}

fn plan_setup(volume: &Volume) -> Result<DriverPlan> {
    let mut plan = DriverPlan::default();
    if volume.is_loop != volume.loop_active {
        let VolumeDetail::Loop(lo) = &volume.detail else {
            return Err(wrong_kind("loop setup", volume.detail.kind_name()));
        };
        if volume.is_loop {
            plan.push(&["losetup", volume.device.as_str(), lo.file.to_string_lossy().as_ref()]);
            plan = plan.wait(&volume.device);
        } else {
            plan.push(&["losetup", "-d", volume.device.as_str()]);
        }
    }

    let wants_crypt = volume.encryption != EncryptType::None;
    if wants_crypt != volume.crypt_active {
        let name = volume.crypt_name();
        if wants_crypt {
            let key = volume
                .crypt_key_file
                .as_ref()
                .map(|k| k.to_string_lossy().into_owned())
                .ok_or_else(|| StorageError::invalid(format!("no key file for encrypted {}", volume.device)))?;
            if volume.orig_encryption == EncryptType::None {
                plan.push(&["cryptsetup", "-q", "luksFormat", "--key-file", key.as_str(), volume.device.as_str()]);
            }
            plan.push(&["cryptsetup", "open", "--key-file", key.as_str(), volume.device.as_str(), name.as_str()]);
            plan = plan.wait(&volume.fs_device());
        } else {
            plan.push(&["cryptsetup", "close", name.as_str()]);
        }
    }
    Ok(plan)
}

fn plan_format(volume: &Volume, config: &EngineConfig) -> Result<DriverPlan> {
    let mut plan = DriverPlan::default();
    if !volume.orig_mount.is_empty() {
        unmount(&mut plan, volume, config);
    }
    let dev = volume.fs_device();
    let label = volume.label.as_str();
    let (tool, force, label_flag): (&str, Option<&str>, &str) = match volume.fs {
        FsType::Ext2 => ("mkfs.ext2", Some("-F"), "-L"),
        FsType::Ext3 => ("mkfs.ext3", Some("-F"), "-L"),
        FsType::Ext4 => ("mkfs.ext4", Some("-F"), "-L"),
        FsType::Btrfs => ("mkfs.btrfs", Some("-f"), "-L"),
        FsType::Xfs => ("mkfs.xfs", Some("-f"), "-L"),
        FsType::Vfat => ("mkfs.vfat", None, "-n"),
        FsType::Ntfs => ("mkfs.ntfs", Some("-Q"), "-L"),
        FsType::Swap => ("mkswap", Some("-f"), "-L"),
        fs @ (FsType::Unknown | FsType::Nfs | FsType::Tmpfs) => {
            return Err(StorageError::UnsupportedByFilesystem { fs, operation: "format" });
        }
    };
    let mut cmd = vec![tool];
    cmd.extend(force);
    if !label.is_empty() {
        cmd.extend([label_flag, label]);
    }
    cmd.push(dev.as_str());
    plan.push(&cmd);
    Ok(plan)
}

fn plan_mount(volume: &Volume, config: &EngineConfig) -> Result<DriverPlan> {
    let mut plan = DriverPlan::default();
    let moved = volume.mount != volume.orig_mount;

    if moved && !volume.orig_mount.is_empty() {
        unmount(&mut plan, volume, config);
    }
    if volume.label != volume.orig_label {
        relabel(&mut plan, volume)?;
    }
    if moved && !volume.mount.is_empty() {
        mount(&mut plan, volume, config);
    }
    Ok(plan)
}

fn relabel(plan: &mut DriverPlan, volume: &Volume) -> Result<()> {
    let dev = volume.fs_device();
    let label = volume.label.as_str();
    match volume.fs {
        FsType::Ext2 | FsType::Ext3 | FsType::Ext4 => plan.push(&["e2label", dev.as_str(), label]),
        FsType::Xfs => plan.push(&["xfs_admin", "-L", label, dev.as_str()]),
        FsType::Btrfs => plan.push(&["btrfs", "filesystem", "label", dev.as_str(), label]),
        FsType::Swap => plan.push(&["swaplabel", "-L", label, dev.as_str()]),
        FsType::Vfat => plan.push(&["fatlabel", dev.as_str(), label]),
        FsType::Ntfs => plan.push(&["ntfslabel", dev.as_str(), label]),
        fs @ (FsType::Unknown | FsType::Nfs | FsType::Tmpfs) => {
            return Err(StorageError::UnsupportedByFilesystem { fs, operation: "label" });
        }
    }
    Ok(())
}

fn mount(plan: &mut DriverPlan, volume: &Volume, config: &EngineConfig) {
    if volume.is_swap() {
        plan.push(&["swapon", volume.fs_device().as_str()]);
        return;
    }
    let target = config.under_root(volume.mount.as_ref()).to_string_lossy().into_owned();
    let (source, fs_type) = match &volume.detail {
        VolumeDetail::Nfs(nfs) => (nfs.share.clone(), "nfs".to_string()),
        VolumeDetail::Tmpfs => ("tmpfs".to_string(), "tmpfs".to_string()),
        _ if volume.fs == FsType::Unknown => (volume.fs_device(), "auto".to_string()),
        _ => (volume.fs_device(), volume.fs.to_string()),
    };
    plan.push(&["mkdir", "-p", target.as_str()]);
    let mut cmd = vec!["mount", "-t", fs_type.as_str()];
    let options = volume.fstab_options.trim();
    if !options.is_empty() && options != "defaults" {
        cmd.extend(["-o", options]);
    }
    cmd.extend([source.as_str(), target.as_str()]);
    plan.push(&cmd);
}

fn unmount(plan: &mut DriverPlan, volume: &Volume, config: &EngineConfig) {
    if volume.orig_mount == crate::model::volume::SWAP_MOUNT {
        plan.push(&["swapoff", volume.fs_device().as_str()]);
    } else {
        let target = config.under_root(volume.orig_mount.as_ref());
        plan.push(&["umount", target.to_string_lossy().as_ref()]);
    }
}
