//! storplan library
//!
//! A Linux storage-configuration planner: an in-memory model of disks,
//! RAID arrays, device-mapper devices, extent pools, loop devices and
//! network/virtual mounts, an extent allocator that keeps pool bookkeeping
//! exact, and a staged commit engine that realizes pending changes with
//! external tools in a dependency-safe order.

pub mod cli;
pub mod command_runner;
pub mod config;
pub mod dm_table;
pub mod engine;
pub mod error;
pub mod fstab;
pub mod lock;
pub mod model;
pub mod pool;
pub mod probe;
pub mod process_guard;
pub mod subsystem;
pub mod types;

// Re-export main types for convenience
pub use command_runner::{CommandOutput, CommandRunner, DryRunRunner, RecordingRunner, SystemRunner};
pub use config::EngineConfig;
pub use engine::{CommitAction, CommitReport, ExecutionPlan, Storage};
pub use error::{codes, to_code, Result, StorageError};
pub use model::{Container, ContainerId, ModelSnapshot, UsedBy, Volume, VolumeKey};
pub use pool::{ExtentPool, PvInfo};
pub use probe::{Prober, StaticProber, SystemProber};
pub use types::{CommitStage, ContainerKind, EncryptType, FsType, MdLevel, MountBy, UsedByKind};
