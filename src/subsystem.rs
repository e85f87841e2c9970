//! Kernel subsystems the engine activates on demand.
//!
//! Activation state lives in the engine, not in process-wide flags: it is
//! created with the engine, switched on before the first action that needs
//! a subsystem, and dropped with the engine.

use strum::Display;
use tracing::{debug, info};

use crate::command_runner::{CommandRunner, argv};
use crate::error::Result;
use crate::types::ContainerKind;

/// A kernel subsystem
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
#[strum(serialize_all = "lowercase")]
pub enum Subsystem {
    DeviceMapper,
    Md,
    Lvm,
    DmRaid,
    Multipath,
}

impl Subsystem {
    /// Kernel module to load, if any.
    fn module(self) -> Option<&'static str> {
        match self {
            Self::DeviceMapper => Some("dm-mod"),
            Self::Md => Some("md-mod"),
            Self::Multipath => Some("dm-multipath"),
            Self::Lvm | Self::DmRaid => None,
        }
    }

    /// Subsystem serving containers of `kind`.
    pub fn for_container(kind: ContainerKind) -> Option<Self> {
        match kind {
            ContainerKind::Md => Some(Self::Md),
            ContainerKind::Lvm => Some(Self::Lvm),
            ContainerKind::Dm => Some(Self::DeviceMapper),
            ContainerKind::DmRaid => Some(Self::DmRaid),
            ContainerKind::DmMultipath => Some(Self::Multipath),
            ContainerKind::Disk | ContainerKind::Loop | ContainerKind::Nfs | ContainerKind::Tmpfs => None,
        }
    }
}

/// Which subsystems this engine has brought up.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubsystemState {
    pub dm: bool,
    pub md: bool,
    pub lvm: bool,
    pub dmraid: bool,
    pub multipath: bool,
}

impl SubsystemState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_active(&self, subsystem: Subsystem) -> bool {
        match subsystem {
            Subsystem::DeviceMapper => self.dm,
            Subsystem::Md => self.md,
            Subsystem::Lvm => self.lvm,
            Subsystem::DmRaid => self.dmraid,
            Subsystem::Multipath => self.multipath,
        }
    }

    fn flag(&mut self, subsystem: Subsystem) -> &mut bool {
        match subsystem {
            Subsystem::DeviceMapper => &mut self.dm,
            Subsystem::Md => &mut self.md,
            Subsystem::Lvm => &mut self.lvm,
            Subsystem::DmRaid => &mut self.dmraid,
            Subsystem::Multipath => &mut self.multipath,
        }
    }

    /// Bring `subsystem` up once; LVM, dmraid and multipath pull in device-mapper.
    pub fn activate(&mut self, subsystem: Subsystem, runner: &mut dyn CommandRunner) -> Result<()> {
        if self.is_active(subsystem) {
            return Ok(());
        }
        if matches!(subsystem, Subsystem::Lvm | Subsystem::DmRaid | Subsystem::Multipath) {
            self.activate(Subsystem::DeviceMapper, runner)?;
        }
        if let Some(module) = subsystem.module() {
            let cmd = argv(&["modprobe", module]);
            runner.run(&cmd)?.ensure_success(&cmd)?;
        }
        *self.flag(subsystem) = true;
        info!(%subsystem, "Subsystem activated");
        Ok(())
    }

    /// Forget every activation.
    pub fn teardown(&mut self) {
        if *self != Self::default() {
            debug!(state = ?self, "Subsystem state torn down");
        }
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command_runner::RecordingRunner;

    #[test]
    fn test_lvm_pulls_in_device_mapper_once() {
        let mut runner = RecordingRunner::new();
        let mut state = SubsystemState::new();
        state.activate(Subsystem::Lvm, &mut runner).expect("activate"); // test: known-good input
        state.activate(Subsystem::Lvm, &mut runner).expect("activate again"); // test: known-good input
        state.activate(Subsystem::DeviceMapper, &mut runner).expect("dm"); // test: known-good input

        assert!(state.lvm && state.dm);
        assert_eq!(runner.history(), &[argv(&["modprobe", "dm-mod"])]);
    }

    #[test]
    fn test_failed_modprobe_leaves_state_inactive() {
        let mut runner = RecordingRunner::new().fail_on(&["modprobe", "md-mod"], 1, "not found");
        let mut state = SubsystemState::new();
        assert!(state.activate(Subsystem::Md, &mut runner).is_err());
        assert!(!state.is_active(Subsystem::Md));
    }

    #[test]
    fn test_teardown_clears_flags() {
        let mut runner = RecordingRunner::new();
        let mut state = SubsystemState::new();
        state.activate(Subsystem::Multipath, &mut runner).expect("activate"); // test: known-good input
        state.teardown();
        assert_eq!(state, SubsystemState::default());
    }
}
