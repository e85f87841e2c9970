//! Executor: runs scheduled actions against the system, one at a time.
//!
//! # Commit loop
//!
//! For each stage in order the executor rebuilds the pending actions of that
//! stage from the model, schedules them and runs them. A stage repeats while
//! it still yields actions, since committing one action can expose the next
//! (a created volume still has to get its encryption set up).
//!
//! Per action:
//!
//! 1. re-validate (container writable, entity present, not consumed)
//! 2. ask the confirmation callback
//! 3. activate the needed kernel subsystems
//! 4. run the driver commands, then wait for the new device node
//! 5. commit the diff into the model and the fstab
//!
//! The first failure ends the batch. Nothing already applied is rolled back.

use std::collections::HashSet;
use std::thread;
use strum::IntoEnumIterator;
use tracing::{debug, error, info, warn};

use crate::command_runner::CommandRunner;
use crate::config::EngineConfig;
use crate::error::{Result, StorageError};
use crate::fstab::{device_spec, FstabEntry, FstabStore};
use crate::model::{Container, ContainerDetail, ContainerId, EntityRef, Volume, VolumeDetail};
use crate::pool::rebalance_on_overcommit;
use crate::probe::Prober;
use crate::process_guard::SignalDeferral;
use crate::subsystem::{Subsystem, SubsystemState};
use crate::types::{CommitStage, ContainerKind, EncryptType};

use super::actions::{build_all, ActionKind, CommitAction};
use super::drivers::plan_action;
use super::scheduler::{schedule, ExecutionPlan};

/// Confirmation callback; returning false aborts the batch.
pub type ConfirmFn = dyn FnMut(&CommitAction) -> bool;

/// Rounds per stage before the executor gives up on a stage that keeps
/// producing actions.
const MAX_ROUNDS: usize = 8;

/// Runs commit batches over an engine's model and collaborators.
pub struct Executor<'a> {
    containers: &'a mut Vec<Container>,
    runner: &'a mut dyn CommandRunner,
    prober: &'a mut dyn Prober,
    subsystems: &'a mut SubsystemState,
    config: &'a EngineConfig,
    confirm: Option<&'a mut ConfirmFn>,
    signals: Option<&'a mut SignalDeferral>,
    fstab: Option<FstabStore>,
    rebalanced: HashSet<ContainerId>,
    executed: Vec<String>,
}

impl<'a> Executor<'a> {
    pub fn new(
        containers: &'a mut Vec<Container>,
        runner: &'a mut dyn CommandRunner,
        prober: &'a mut dyn Prober,
        subsystems: &'a mut SubsystemState,
        config: &'a EngineConfig,
    ) -> Self {
        Self {
            containers,
            runner,
            prober,
            subsystems,
            config,
            confirm: None,
            signals: None,
            fstab: None,
            rebalanced: HashSet::new(),
            executed: Vec::new(),
        }
    }

    pub fn with_confirm(mut self, confirm: Option<&'a mut ConfirmFn>) -> Self {
        self.confirm = confirm;
        self
    }

    pub fn with_signals(mut self, signals: Option<&'a mut SignalDeferral>) -> Self {
        self.signals = signals;
        self
    }

    /// Run every stage; returns the descriptions of the executed actions.
    pub fn run(mut self) -> Result<Vec<String>> {
        for stage in CommitStage::iter() {
            self.run_stage(stage)?;
        }
        info!(actions = self.executed.len(), "Commit finished");
        Ok(self.executed)
    }

    fn run_stage(&mut self, stage: CommitStage) -> Result<()> {
        for round in 0..MAX_ROUNDS {
            let actions: Vec<CommitAction> = build_all(self.containers)
                .into_iter()
                .filter(|a| a.stage == stage)
                .collect();
            if actions.is_empty() {
                return Ok(());
            }
            let plan = schedule(actions);
            check_unique(&plan)?;
            debug!(%stage, round, actions = plan.len(), "Executing round");

            for action in &plan.actions {
                let index = self.executed.len();
                if let Err(e) = self.execute(action) {
                    error!(index, action = %action.description, error = %e, "Commit action failed");
                    return Err(match e {
                        StorageError::CommitAborted(_) => e,
                        other => StorageError::CommitFailed {
                            index,
                            description: action.description.clone(),
                            source: Box::new(other),
                        },
                    });
                }
                info!(index, "{}", action);
                self.executed.push(action.to_string());
                if let Some(signals) = self.signals.as_deref_mut() {
                    signals.poll();
                }
            }
        }
        warn!(%stage, rounds = MAX_ROUNDS, "Stage still has pending actions, moving on");
        Ok(())
    }

    fn execute(&mut self, action: &CommitAction) -> Result<()> {
        let (ci, vi) = self.validate(action)?;

        if let Some(confirm) = self.confirm.as_deref_mut() {
            if !confirm(action) {
                return Err(StorageError::CommitAborted(action.description.clone()));
            }
        }

        self.activate_subsystems(action, ci, vi)?;

        if action.container_kind == ContainerKind::Lvm
            && vi.is_some()
            && matches!(action.kind, ActionKind::Create | ActionKind::Resize)
            && action.stage == CommitStage::Increase
        {
            self.rebalance_pool(ci)?;
        }

        let driver = {
            let container = &self.containers[ci];
            plan_action(action, container, vi.map(|i| &container.volumes[i]), self.config)?
        };
        for cmd in &driver.commands {
            self.runner.run(cmd)?.ensure_success(cmd)?;
        }
        if let Some(device) = &driver.wait_for {
            if !self.runner.is_dry_run() {
                self.wait_for_device(device)?;
            }
        }

        match vi {
            Some(vi) => self.commit_volume(ci, vi, action)?,
            None => self.commit_container(ci, action)?,
        }

        if !self.runner.is_dry_run() {
            if let Some(fstab) = self.fstab.as_mut() {
                fstab.flush()?;
            }
        }
        Ok(())
    }

    /// Container and volume indexes of the action's target.
    fn validate(&self, action: &CommitAction) -> Result<(usize, Option<usize>)> {
        let ci = self
            .containers
            .iter()
            .position(|c| c.id == action.container)
            .ok_or_else(|| StorageError::not_found(format!("container {}", action.container)))?;
        let container = &self.containers[ci];
        if container.read_only {
            return Err(StorageError::read_only(container.name.clone()));
        }

        let Some(target) = &action.volume else {
            return Ok((ci, None));
        };
        let vi = container
            .volume_index(&target.key, target.deleted)
            .ok_or_else(|| StorageError::not_found(format!("volume {} of {}", target.key, container.name)))?;
        let volume = &container.volumes[vi];
        if action.destructive {
            if let Some(used_by) = &volume.used_by {
                return Err(StorageError::in_use(volume.device.clone(), used_by.to_string()));
            }
        }
        Ok((ci, Some(vi)))
    }

    fn activate_subsystems(&mut self, action: &CommitAction, ci: usize, vi: Option<usize>) -> Result<()> {
        if let Some(subsystem) = Subsystem::for_container(action.container_kind) {
            self.subsystems.activate(subsystem, &mut *self.runner)?;
        }
        let encrypted = vi
            .map(|i| &self.containers[ci].volumes[i])
            .is_some_and(|v| v.encryption != EncryptType::None || v.crypt_active);
        if encrypted {
            self.subsystems.activate(Subsystem::DeviceMapper, &mut *self.runner)?;
        }
        Ok(())
    }

    /// Scale back the pool's pending volumes once per commit, against the
    /// free count the volume manager reports.
    fn rebalance_pool(&mut self, ci: usize) -> Result<()> {
        let (id, name, created) = {
            let c = &self.containers[ci];
            (c.id, c.name.clone(), c.created)
        };
        if created || !self.rebalanced.insert(id) {
            return Ok(());
        }
        let Some(free) = self.prober.pool_free_extents(&name) else {
            debug!(pool = %name, "No free extent count reported, skipping rebalance");
            return Ok(());
        };
        if let Some((pool, volumes)) = self.containers[ci].pool_and_volumes() {
            let shortfall = rebalance_on_overcommit(pool, volumes, free)?;
            if shortfall > 0 {
                warn!(pool = %name, shortfall, "Pending volumes scaled back to fit the pool");
            }
        }
        Ok(())
    }

    fn wait_for_device(&mut self, device: &str) -> Result<()> {
        let retries = self.config.device_wait_retries;
        for attempt in 0..=retries {
            if self.prober.device_exists(device) {
                return Ok(());
            }
            if attempt < retries {
                thread::sleep(self.config.device_wait_interval());
            }
        }
        Err(StorageError::DeviceTimeout(device.to_string()))
    }

    fn fstab(&mut self) -> Result<&mut FstabStore> {
        if self.fstab.is_none() {
            self.fstab = Some(FstabStore::load(self.config.fstab_file())?);
        }
        match self.fstab.as_mut() {
            Some(store) => Ok(store),
            None => Err(StorageError::not_found("fstab")),
        }
    }

    /// Drop the fstab entry the volume had before this commit.
    fn forget_mount(&mut self, volume: &Volume) -> Result<()> {
        let (mount_point, device) = committed_fstab_key(volume);
        if !self.fstab()?.remove(&mount_point, device.as_deref()) {
            debug!(mount = %mount_point, "No fstab entry to remove");
        }
        Ok(())
    }

    // ========================================================================
    // Diff commit
    // ========================================================================

    fn commit_volume(&mut self, ci: usize, vi: usize, action: &CommitAction) -> Result<()> {
        let dry_run = self.runner.is_dry_run();
        match action.kind {
            ActionKind::Remove => {
                let removed = self.containers[ci].volumes.remove(vi);
                if !removed.orig_mount.is_empty() {
                    self.forget_mount(&removed)?;
                }
                clear_used_by(self.containers, &removed.device);
            }
            ActionKind::Create | ActionKind::Resize => {
                let volume = &self.containers[ci].volumes[vi];
                let reprobe = !dry_run
                    && matches!(
                        volume.detail,
                        VolumeDetail::Partition(_) | VolumeDetail::Md(_) | VolumeDetail::Loop(_)
                    );
                let probed = if reprobe {
                    let device = volume.device.clone();
                    self.prober.device_size_k(&device)
                } else {
                    None
                };
                let volume = &mut self.containers[ci].volumes[vi];
                if let Some(size_k) = probed {
                    volume.size_k = size_k;
                }
                volume.orig_size_k = volume.size_k;
                if action.kind == ActionKind::Create {
                    volume.created = false;
                    volume.loop_active = volume.is_loop;
                }
            }
            ActionKind::Setup => {
                let volume = &mut self.containers[ci].volumes[vi];
                volume.loop_active = volume.is_loop;
                volume.crypt_active = volume.encryption != EncryptType::None;
            }
            ActionKind::Format => {
                let volume = self.containers[ci].volumes[vi].clone();
                if !volume.orig_mount.is_empty() {
                    self.forget_mount(&volume)?;
                }
                let uuid = if dry_run { None } else { self.prober.device_uuid(&volume.fs_device()) };
                let volume = &mut self.containers[ci].volumes[vi];
                volume.format = false;
                volume.detected_fs = volume.fs;
                volume.orig_label = volume.label.clone();
                volume.orig_mount.clear();
                if let Some(uuid) = uuid {
                    volume.uuid = uuid;
                }
            }
            ActionKind::Mount => {
                let volume = self.containers[ci].volumes[vi].clone();
                if !volume.orig_mount.is_empty() {
                    self.forget_mount(&volume)?;
                }
                if !volume.mount.is_empty() {
                    self.fstab()?.add(FstabEntry::for_volume(&volume));
                }
                let volume = &mut self.containers[ci].volumes[vi];
                volume.orig_mount = volume.mount.clone();
                volume.orig_mount_by = volume.mount_by;
                volume.orig_fstab_options = volume.fstab_options.clone();
                volume.orig_encryption = volume.encryption;
                volume.orig_label = volume.label.clone();
            }
            other => {
                return Err(StorageError::InvalidEntityKind {
                    operation: "volume commit",
                    found: other.to_string(),
                })
            }
        }
        Ok(())
    }

    fn commit_container(&mut self, ci: usize, action: &CommitAction) -> Result<()> {
        match action.kind {
            ActionKind::Remove => {
                let mounted: Vec<Volume> = self.containers[ci]
                    .volumes
                    .iter()
                    .filter(|v| !v.orig_mount.is_empty())
                    .cloned()
                    .collect();
                for volume in &mounted {
                    self.forget_mount(volume)?;
                }
                let removed = self.containers.remove(ci);
                clear_used_by(self.containers, &removed.device);
            }
            ActionKind::ReducePool => {
                let container = &mut self.containers[ci];
                let owner = container.device.clone();
                let released: Vec<String> = match container.pool_mut() {
                    Some(pool) => pool.pv_remove.drain(..).map(|m| m.device).collect(),
                    None => Vec::new(),
                };
                for volume in self.containers.iter_mut().flat_map(|c| c.volumes.iter_mut()) {
                    let owned = volume.used_by.as_ref().is_some_and(|u| u.device == owner);
                    if owned && released.contains(&volume.device) {
                        volume.used_by = None;
                    }
                }
            }
            ActionKind::Create | ActionKind::ExtendPool => {
                let container = &mut self.containers[ci];
                container.created = false;
                if let Some(pool) = container.pool_mut() {
                    let added: Vec<_> = pool.pv_add.drain(..).collect();
                    pool.pv.extend(added);
                }
            }
            ActionKind::DestroyTable => {
                let dropped: Vec<Volume> = self.containers[ci]
                    .volumes
                    .iter()
                    .filter(|v| v.deleted)
                    .cloned()
                    .collect();
                for volume in dropped.iter().filter(|v| !v.orig_mount.is_empty()) {
                    self.forget_mount(volume)?;
                }
                let container = &mut self.containers[ci];
                container.volumes.retain(|v| !v.deleted);
                if let ContainerDetail::Disk(info) = &mut container.detail {
                    info.destroy_label = false;
                }
                for volume in &dropped {
                    clear_used_by(self.containers, &volume.device);
                }
            }
            other => {
                return Err(StorageError::InvalidEntityKind {
                    operation: "container commit",
                    found: other.to_string(),
                })
            }
        }
        Ok(())
    }
}

/// The same entity twice in one round means the model is corrupt.
fn check_unique(plan: &ExecutionPlan) -> Result<()> {
    let mut seen = HashSet::new();
    for action in &plan.actions {
        let entity = match &action.volume {
            Some(volume) => EntityRef::Volume(volume.clone()),
            None => EntityRef::Container(action.container),
        };
        if !seen.insert(entity) {
            return Err(StorageError::invalid(format!(
                "entity scheduled twice in one round: {}",
                action.description
            )));
        }
    }
    Ok(())
}

/// Forget every `usedBy` naming `device`.
fn clear_used_by(containers: &mut [Container], device: &str) {
    for volume in containers.iter_mut().flat_map(|c| c.volumes.iter_mut()) {
        if volume.used_by.as_ref().is_some_and(|u| u.device == device) {
            debug!(volume = %volume.device, consumer = device, "usedBy cleared");
            volume.used_by = None;
        }
    }
}

/// fstab key of the committed mount: mount point, plus the device spec
/// for swap, whose entries share the mount point.
fn committed_fstab_key(volume: &Volume) -> (String, Option<String>) {
    if volume.orig_mount != crate::model::volume::SWAP_MOUNT {
        return (volume.orig_mount.clone(), None);
    }
    let device = if volume.orig_encryption == EncryptType::None {
        volume.device.clone()
    } else {
        format!("/dev/mapper/{}", volume.crypt_name())
    };
    let spec = device_spec(volume.orig_mount_by, &device, &volume.uuid, &volume.orig_label);
    (volume.orig_mount.clone(), Some(spec))
}
