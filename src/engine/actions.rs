//! Diff builder: turns dirty model state into commit actions.
//!
//! Every entity yields at most one action per evaluation. The rules are
//! tried in a fixed priority order and the first match wins:
//!
//! | # | Condition                       | Stage    | Action  | Destructive |
//! |---|---------------------------------|----------|---------|-------------|
//! | 1 | deleted                         | DECREASE | remove  | yes |
//! | 2 | shrinking                       | DECREASE | resize  | yes |
//! | 3 | created                         | INCREASE | create  | no  |
//! | 4 | growing                         | INCREASE | resize  | yes |
//! | 5 | loop/crypt setup differs        | INCREASE or FORMAT | setup | iff mounted |
//! | 6 | format requested                | FORMAT   | format  | yes |
//! | 7 | mount, label or fstab changed   | MOUNT    | mount   | no  |
//!
//! Containers may add one action of their own; a DECREASE container action
//! that tears the container down subsumes the DECREASE actions of its volumes.

use serde::Serialize;
use std::fmt;
use strum::Display;

use crate::model::{Container, ContainerId, Volume, VolumeRef};
use crate::types::{CommitStage, ContainerKind, FsType};

/// What an action does to its entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Display)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Remove,
    Resize,
    Create,
    Setup,
    Format,
    Mount,
    DestroyTable,
    ExtendPool,
    ReducePool,
}

/// Position of an action relative to the volume actions of its container.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum ActionSlot {
    ContainerFirst,
    Volume,
    ContainerLast,
}

/// One pending real-world operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitAction {
    pub stage: CommitStage,
    pub kind: ActionKind,
    pub container: ContainerId,
    pub container_kind: ContainerKind,
    /// Target volume; `None` for container-scope actions
    #[serde(skip)]
    pub volume: Option<VolumeRef>,
    pub destructive: bool,
    pub description: String,
    /// Mount point after the action (empty for none)
    pub mount_point: String,
    /// Mount point before the action (empty for none)
    pub orig_mount_point: String,
    pub is_swap: bool,
    pub slot: ActionSlot,
    /// Volume number inside its container, 0 for named volumes
    pub sequence: u32,
    /// Resize the filesystem along with the device
    pub resize_fs: bool,
    /// Container action that makes the volumes' DECREASE actions redundant
    pub subsumes: bool,
}

impl CommitAction {
    fn for_container(c: &Container, stage: CommitStage, kind: ActionKind, slot: ActionSlot) -> Self {
        let destructive = matches!(
            kind,
            ActionKind::Remove | ActionKind::DestroyTable | ActionKind::ReducePool
        );
        Self {
            stage,
            kind,
            container: c.id,
            container_kind: c.kind(),
            volume: None,
            destructive,
            description: String::new(),
            mount_point: String::new(),
            orig_mount_point: String::new(),
            is_swap: false,
            slot,
            sequence: 0,
            resize_fs: false,
            subsumes: false,
        }
    }

    fn for_volume(
        c: &Container,
        v: &Volume,
        stage: CommitStage,
        kind: ActionKind,
        destructive: bool,
    ) -> Self {
        Self {
            stage,
            kind,
            container: c.id,
            container_kind: c.kind(),
            volume: Some(VolumeRef {
                container: c.id,
                key: v.key.clone(),
                deleted: v.deleted,
            }),
            destructive,
            description: String::new(),
            mount_point: v.mount.clone(),
            orig_mount_point: v.orig_mount.clone(),
            is_swap: v.is_swap(),
            slot: ActionSlot::Volume,
            sequence: v.key.sequence(),
            resize_fs: false,
            subsumes: false,
        }
    }

    fn described(mut self, text: String) -> Self {
        self.description = text;
        self
    }
}

impl fmt::Display for CommitAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.stage, self.description)
    }
}

fn size_text(size_k: u64) -> String {
    const UNITS: [&str; 4] = ["KiB", "MiB", "GiB", "TiB"];
    let mut value = size_k as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

// ============================================================================
// Volume rules
// ============================================================================

impl Volume {
    /// The pending action of this volume, if any.
    pub fn build_action(&self, container: &Container) -> Option<CommitAction> {
        let kind_name = self.detail.kind_name();
        let fs_resizable = !self.format && self.detected_fs != FsType::Unknown;

        if self.deleted {
            let action = CommitAction::for_volume(container, self, CommitStage::Decrease, ActionKind::Remove, true);
            return Some(action.described(format!("Remove {} {}", kind_name, self.device)));
        }

        if !self.created && !self.format && self.size_k < self.orig_size_k {
            let mut action =
                CommitAction::for_volume(container, self, CommitStage::Decrease, ActionKind::Resize, true);
            action.resize_fs = fs_resizable;
            return Some(action.described(format!(
                "Shrink {} {} to {}",
                kind_name,
                self.device,
                size_text(self.size_k)
            )));
        }

        if self.created {
            let action =
                CommitAction::for_volume(container, self, CommitStage::Increase, ActionKind::Create, false);
            return Some(action.described(format!(
                "Create {} {} ({})",
                kind_name,
                self.device,
                size_text(self.size_k)
            )));
        }

        if !self.format && self.size_k > self.orig_size_k {
            let mut action =
                CommitAction::for_volume(container, self, CommitStage::Increase, ActionKind::Resize, true);
            action.resize_fs = fs_resizable;
            return Some(action.described(format!(
                "Extend {} {} to {}",
                kind_name,
                self.device,
                size_text(self.size_k)
            )));
        }

        if self.needs_setup() {
            let mounted = !self.mount.is_empty();
            let stage = if mounted { CommitStage::Format } else { CommitStage::Increase };
            let action = CommitAction::for_volume(container, self, stage, ActionKind::Setup, mounted);
            let what = if self.is_loop != self.loop_active { "loop device" } else { "encryption" };
            return Some(action.described(format!("Set up {} for {}", what, self.device)));
        }

        if self.format {
            let action =
                CommitAction::for_volume(container, self, CommitStage::Format, ActionKind::Format, true);
            return Some(action.described(format!("Format {} with {}", self.fs_device(), self.fs)));
        }

        if self.mount != self.orig_mount || self.label != self.orig_label || self.fstab_changed() {
            let action =
                CommitAction::for_volume(container, self, CommitStage::Mount, ActionKind::Mount, false);
            let text = match (self.orig_mount.is_empty(), self.mount.is_empty()) {
                _ if self.mount == self.orig_mount && self.label != self.orig_label => {
                    format!("Set label of {} to '{}'", self.device, self.label)
                }
                _ if self.mount == self.orig_mount => format!("Update fstab entry of {}", self.device),
                (true, false) => format!("Mount {} at {}", self.device, self.mount),
                (false, true) => format!("Unmount {} from {}", self.device, self.orig_mount),
                _ => format!("Move {} from {} to {}", self.device, self.orig_mount, self.mount),
            };
            return Some(action.described(text));
        }

        None
    }
}

// ============================================================================
// Container rules
// ============================================================================

impl Container {
    /// The container's own action, if any.
    pub fn container_action(&self) -> Option<CommitAction> {
        if let Some(pool) = self.pool() {
            if self.deleted {
                let mut action =
                    CommitAction::for_container(self, CommitStage::Decrease, ActionKind::Remove, ActionSlot::ContainerFirst);
                action.subsumes = true;
                return Some(action.described(format!("Remove volume group {}", self.name)));
            }
            if !pool.pv_remove.is_empty() {
                let devices: Vec<&str> = pool.pv_remove.iter().map(|m| m.device.as_str()).collect();
                let action =
                    CommitAction::for_container(self, CommitStage::Decrease, ActionKind::ReducePool, ActionSlot::ContainerLast);
                return Some(action.described(format!(
                    "Remove {} from volume group {}",
                    devices.join(", "),
                    self.name
                )));
            }
            if self.created {
                let devices: Vec<&str> = pool.pv_add.iter().map(|m| m.device.as_str()).collect();
                let action =
                    CommitAction::for_container(self, CommitStage::Increase, ActionKind::Create, ActionSlot::ContainerFirst);
                return Some(action.described(format!(
                    "Create volume group {} on {}",
                    self.name,
                    devices.join(", ")
                )));
            }
            if !pool.pv_add.is_empty() {
                let devices: Vec<&str> = pool.pv_add.iter().map(|m| m.device.as_str()).collect();
                let action =
                    CommitAction::for_container(self, CommitStage::Increase, ActionKind::ExtendPool, ActionSlot::ContainerFirst);
                return Some(action.described(format!(
                    "Add {} to volume group {}",
                    devices.join(", "),
                    self.name
                )));
            }
            return None;
        }

        match self.disk_info() {
            Some(disk) if disk.destroy_label => {
                let mut action = CommitAction::for_container(
                    self,
                    CommitStage::Decrease,
                    ActionKind::DestroyTable,
                    ActionSlot::ContainerFirst,
                );
                action.subsumes = true;
                Some(action.described(format!(
                    "Create new {} partition table on {}",
                    if disk.label.is_empty() { "gpt" } else { disk.label.as_str() },
                    self.device
                )))
            }
            _ => None,
        }
    }

    /// All pending actions of this container and its volumes.
    pub fn build_actions(&self) -> Vec<CommitAction> {
        let own = self.container_action();
        let subsumes = own.as_ref().is_some_and(|a| a.subsumes);
        let mut actions: Vec<CommitAction> = own.into_iter().collect();
        actions.extend(
            self.volumes
                .iter()
                .filter_map(|v| v.build_action(self))
                .filter(|a| !(subsumes && a.stage == CommitStage::Decrease)),
        );
        actions
    }
}

/// Pending actions of every container.
pub fn build_all(containers: &[Container]) -> Vec<CommitAction> {
    containers.iter().flat_map(Container::build_actions).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{LvExtents, VolumeKey};
    use crate::pool::{ExtentPool, PvInfo};

    fn disk_with(parts: Vec<Volume>) -> Container {
        let mut disk = Container::disk("/dev/sda", 100 << 20, "gpt");
        disk.id = ContainerId(1);
        for p in parts {
            disk.insert_volume(p).expect("insert"); // test: known-good input
        }
        disk
    }

    fn only_action(v: Volume) -> Option<CommitAction> {
        let disk = disk_with(vec![v]);
        disk.volumes[0].build_action(&disk)
    }

    #[test]
    fn test_clean_volume_has_no_action() {
        let v = Volume::partition("/dev/sda", 1, 1024, 4096).with_fs(FsType::Ext4).with_mount("/");
        assert!(only_action(v).is_none());
    }

    #[test]
    fn test_deleted_wins_over_everything() {
        let mut v = Volume::partition("/dev/sda", 1, 1024, 4096);
        v.deleted = true;
        v.format = true;
        v.size_k = 1;
        let a = only_action(v).expect("action"); // test: known-good input
        assert_eq!(a.kind, ActionKind::Remove);
        assert_eq!(a.stage, CommitStage::Decrease);
        assert!(a.destructive);
    }

    #[test]
    fn test_shrink_carries_fs_flag_without_format() {
        let mut v = Volume::partition("/dev/sda", 1, 1024, 8192).with_fs(FsType::Ext4);
        v.size_k = 4096;
        let a = only_action(v.clone()).expect("action"); // test: known-good input
        assert_eq!((a.stage, a.kind), (CommitStage::Decrease, ActionKind::Resize));
        assert!(a.resize_fs);

        v.format = true;
        let a = only_action(v).expect("action"); // test: known-good input
        assert_eq!((a.stage, a.kind), (CommitStage::Format, ActionKind::Format));
        assert!(!a.resize_fs);
    }

    #[test]
    fn test_pending_format_wins_over_grow() {
        let mut v = Volume::partition("/dev/sda", 1, 1024, 4096).with_fs(FsType::Ext4);
        v.size_k = 8192;
        v.format = true;
        let a = only_action(v).expect("action"); // test: known-good input
        assert_eq!((a.stage, a.kind), (CommitStage::Format, ActionKind::Format));
    }

    #[test]
    fn test_created_is_increase_create() {
        let v = Volume::partition("/dev/sda", 1, 1024, 4096).into_pending();
        let a = only_action(v).expect("action"); // test: known-good input
        assert_eq!((a.stage, a.kind), (CommitStage::Increase, ActionKind::Create));
        assert!(!a.destructive);
    }

    #[test]
    fn test_grow_is_destructive_increase() {
        let mut v = Volume::partition("/dev/sda", 1, 1024, 4096);
        v.size_k = 8192;
        let a = only_action(v).expect("action"); // test: known-good input
        assert_eq!((a.stage, a.kind), (CommitStage::Increase, ActionKind::Resize));
        assert!(a.destructive);
        assert!(!a.resize_fs);
    }

    #[test]
    fn test_setup_stage_depends_on_mount_point() {
        let mut v = Volume::partition("/dev/sda", 1, 1024, 4096);
        v.encryption = crate::types::EncryptType::Luks;
        let a = only_action(v.clone()).expect("action"); // test: known-good input
        assert_eq!((a.stage, a.kind, a.destructive), (CommitStage::Increase, ActionKind::Setup, false));

        v.mount = "/secret".into();
        let a = only_action(v).expect("action"); // test: known-good input
        assert_eq!((a.stage, a.destructive), (CommitStage::Format, true));
    }

    #[test]
    fn test_format_then_mount_rules() {
        let mut v = Volume::partition("/dev/sda", 1, 1024, 4096);
        v.format = true;
        v.fs = FsType::Xfs;
        v.mount = "/srv".into();
        let a = only_action(v.clone()).expect("action"); // test: known-good input
        assert_eq!(a.kind, ActionKind::Format);

        v.format = false;
        let a = only_action(v.clone()).expect("action"); // test: known-good input
        assert_eq!((a.stage, a.kind), (CommitStage::Mount, ActionKind::Mount));
        assert_eq!(a.mount_point, "/srv");

        v.orig_mount = "/srv".into();
        v.fstab_options = "noatime".into();
        let a = only_action(v).expect("action"); // test: known-good input
        assert!(a.description.contains("fstab"));
    }

    #[test]
    fn test_destroy_table_subsumes_volume_removals() {
        let mut disk = disk_with(vec![
            Volume::partition("/dev/sda", 1, 1024, 4096),
            Volume::partition("/dev/sda", 2, 5120, 4096),
        ]);
        for v in &mut disk.volumes {
            v.deleted = true;
        }
        disk.insert_volume(Volume::partition("/dev/sda", 1, 1024, 8192).into_pending())
            .expect("insert"); // test: known-good input
        if let crate::model::ContainerDetail::Disk(info) = &mut disk.detail {
            info.destroy_label = true;
        }

        let actions = disk.build_actions();
        assert_eq!(actions.len(), 2);
        assert_eq!(actions[0].kind, ActionKind::DestroyTable);
        assert_eq!(actions[1].kind, ActionKind::Create);
    }

    #[test]
    fn test_pool_actions() {
        let mut vg = Container::lvm(
            "system",
            ExtentPool::with_members(4096, vec![PvInfo::new("/dev/sda2", 100)]),
        );
        assert!(vg.build_actions().is_empty());

        vg.pool_mut()
            .expect("pool") // test: known-good input
            .add_member(PvInfo::new("/dev/sdb1", 50))
            .expect("add"); // test: known-good input
        let lv = Volume::logical("/dev/system", "root", 4096, LvExtents::new(1, 0)).into_pending();
        vg.insert_volume(lv).expect("insert"); // test: known-good input

        let actions = vg.build_actions();
        assert_eq!(actions[0].kind, ActionKind::ExtendPool);
        assert_eq!(actions[0].slot, ActionSlot::ContainerFirst);
        assert_eq!(actions[1].volume.as_ref().map(|r| &r.key), Some(&VolumeKey::Name("root".into())));
    }
}
