//! Commit engine: the diff builder, the stage scheduler, the drivers and the
//! executor, plus the `Storage` API that owns them.
//!
//! Mutations mark entities dirty; `Storage::commit` turns the dirty state
//! into actions, orders them and runs them against the system.

pub mod actions;
pub mod drivers;
pub mod executor;
pub mod scheduler;
pub mod storage;

pub use actions::{build_all, ActionKind, ActionSlot, CommitAction};
pub use drivers::{plan_action, DriverPlan};
pub use executor::{ConfirmFn, Executor};
pub use scheduler::{compare_mounts, schedule, ExecutionPlan};
pub use storage::{CommitReport, Storage, FIRST_PARTITION_OFFSET_K};
