//! Planning engine: the planners that build a `PartitioningPlan` and the plan
//! itself, which drives format, mount and unmount.
//!
//! Control flow: `AutoPlanner` or `ManualPlanner` -> `PartitioningPlan` ->
//! `format_and_mount_partitions` -> (on completion or failure) `umount_partitions`.

pub mod auto;
pub mod manual;
pub mod plan;

pub use auto::{AutoPlanner, AutoPolicy};
pub use manual::ManualPlanner;
pub use plan::{PartitioningPlan, RetryPolicy};

use crate::disk::partition::Passphrase;
use crate::error::Result;
use crate::prompt::Prompter;

/// Result of one interactive planning run.
#[derive(Debug)]
pub enum PlannerOutcome {
    /// The user accepted this plan
    Accepted(PartitioningPlan),
    /// The user abandoned this planner and wants the other planning mode
    SwitchMode,
}

/// Prompt for the plan's LUKS passphrase until a non-empty one is given.
pub fn ask_passphrase(prompter: &dyn Prompter) -> Result<Passphrase> {
    loop {
        let secret = prompter.password("LUKS passphrase")?;
        match Passphrase::new(secret) {
            Ok(passphrase) => return Ok(passphrase),
            Err(e) => prompter.notify(&e.to_string())?,
        }
    }
}
