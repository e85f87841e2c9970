//! Commit stage scheduler
//!
//! Orders a list of commit actions into an execution plan with one stable
//! sort. The stage is the primary key over the whole list, so every MOUNT
//! follows every FORMAT, which follows every INCREASE, which follows every
//! DECREASE. Inside a stage:
//!
//! - **DECREASE**: dependents first (higher structural group, then later
//!   containers), container actions around their volumes, highest number first
//! - **INCREASE**: providers first (lower group, then earlier containers),
//!   lowest number first
//! - **FORMAT**: by structural group
//! - **MOUNT**: the mount comparator alone, across all containers

use std::cmp::{Ordering, Reverse};

use super::actions::CommitAction;
use crate::types::CommitStage;

/// Scheduled, ready-to-run list of actions.
#[derive(Debug, Clone, Default)]
pub struct ExecutionPlan {
    pub actions: Vec<CommitAction>,
}

impl ExecutionPlan {
    /// True if any action destroys data.
    pub fn is_destructive(&self) -> bool {
        self.actions.iter().any(|a| a.destructive)
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    /// Human-readable plan for logging and the CLI.
    pub fn summary(&self) -> String {
        let mut lines = vec![format!("Storage Plan: {} action(s)", self.actions.len())];
        if self.is_destructive() {
            lines.push("  WARNING: plan contains destructive actions".to_string());
        }
        for (i, action) in self.actions.iter().enumerate() {
            let marker = if action.destructive { " (destructive)" } else { "" };
            lines.push(format!("    {}. {}{}", i + 1, action, marker));
        }
        lines.join("\n")
    }
}

/// Sort `actions` into execution order.
pub fn schedule(mut actions: Vec<CommitAction>) -> ExecutionPlan {
    actions.sort_by(compare);
    ExecutionPlan { actions }
}

fn compare(a: &CommitAction, b: &CommitAction) -> Ordering {
    a.stage.cmp(&b.stage).then_with(|| match a.stage {
        CommitStage::Decrease => decrease_key(a).cmp(&decrease_key(b)),
        CommitStage::Increase => increase_key(a).cmp(&increase_key(b)),
        CommitStage::Format => a
            .container_kind
            .structural_group()
            .cmp(&b.container_kind.structural_group()),
        CommitStage::Mount => compare_mounts(a, b),
    })
}

type DecreaseKey = (Reverse<u8>, Reverse<u32>, u8, Reverse<u32>);

fn decrease_key(a: &CommitAction) -> DecreaseKey {
    (
        Reverse(a.container_kind.structural_group()),
        Reverse(a.container.0),
        a.slot as u8,
        Reverse(a.sequence),
    )
}

fn increase_key(a: &CommitAction) -> (u8, u32, u8, u32) {
    (
        a.container_kind.structural_group(),
        a.container.0,
        a.slot as u8,
        a.sequence,
    )
}

/// Mount entries: volumes before volume-less entries, swap last among
/// volumes, existing mount points before new ones, then by path.
pub fn compare_mounts(a: &CommitAction, b: &CommitAction) -> Ordering {
    mount_rank(a)
        .cmp(&mount_rank(b))
        .then_with(|| a.orig_mount_point.is_empty().cmp(&b.orig_mount_point.is_empty()))
        .then_with(|| mount_path(a).cmp(mount_path(b)))
}

fn mount_rank(a: &CommitAction) -> u8 {
    match (&a.volume, a.is_swap) {
        (Some(_), false) => 0,
        (Some(_), true) => 1,
        (None, _) => 2,
    }
}

fn mount_path(a: &CommitAction) -> &str {
    if a.mount_point.is_empty() {
        &a.orig_mount_point
    } else {
        &a.mount_point
    }
}
