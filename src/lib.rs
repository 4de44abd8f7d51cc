//! archdisk library
//!
//! Disk layout planning and format/mount orchestration for the Arch Linux
//! installer: disk inspection, the automatic and manual planners, the
//! partitioning plan with its LUKS and btrfs handling, and the session file.

pub mod cli;
pub mod command_runner;
pub mod disk;
pub mod engine;
pub mod error;
pub mod hardware;
pub mod process_guard;
pub mod prompt;
pub mod sanity;
pub mod session;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod types;
pub mod units;

// Re-export main types for convenience
pub use command_runner::{CommandOutput, CommandRunner, SystemRunner, ToolCommand};
pub use disk::{inspect_disk, list_disks, BlockName, Disk, Passphrase, PartitionInfo, PartitionRecord};
pub use engine::{AutoPlanner, AutoPolicy, ManualPlanner, PartitioningPlan, PlannerOutcome, RetryPolicy};
pub use error::{LayoutError, Result};
pub use hardware::{detect_firmware_mode, FirmwareMode};
pub use process_guard::{IsolatedSpawn, SessionGuard, ToolRegistry};
pub use prompt::{ConsolePrompter, Prompter};
pub use session::{InstallSession, PreLaunch};
pub use types::{FormatType, PlanningMode, Role, SwapPolicy};
