use clap::{Parser, Subcommand};
use std::path::PathBuf;

use crate::engine::plan::DEFAULT_TARGET_ROOT;

/// archdisk - disk layout planning for the Arch Linux installer
#[derive(Parser)]
#[command(name = "archdisk")]
#[command(about = "Plan, format and mount the disk layout of a new Arch Linux system")]
#[command(version)]
pub struct Cli {
    /// Dry-run mode: show what would be executed without making changes.
    ///
    /// Destructive operations (partition tables, mkfs, cryptsetup, mount) are
    /// printed and skipped. Read-only inspection (lsblk, sfdisk -J, findmnt)
    /// still executes so the plan is realistic.
    #[arg(long, global = true)]
    pub dry_run: bool,

    /// Directory the new system is mounted under
    #[arg(long, global = true, default_value = DEFAULT_TARGET_ROOT)]
    pub target: PathBuf,

    /// Skip the root privilege check (development only)
    #[arg(long, global = true)]
    pub skip_root_check: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Print the partitions and free space of a disk, or list all disks
    Inspect {
        /// Disk device (e.g., /dev/sda)
        disk: Option<PathBuf>,
    },
    /// Plan the layout interactively, then format and mount it
    Plan {
        /// Start with manual partitioning instead of the automatic planner
        #[arg(long)]
        manual: bool,

        /// Disk to plan on (skips the disk selection prompt)
        #[arg(long)]
        disk: Option<PathBuf>,

        /// Save the session to this file once the plan is accepted
        #[arg(long)]
        save: Option<PathBuf>,
    },
    /// Format and mount the plan of a saved session
    Apply {
        /// Path to the session file
        session: PathBuf,
    },
    /// Unmount everything a saved session mounted
    Umount {
        /// Path to the session file
        session: PathBuf,
    },
    /// Validate a session file
    Validate {
        /// Path to the session file
        session: PathBuf,
    },
}

impl Cli {
    pub fn parse_args() -> Self {
        Self::parse()
    }

    /// Subcommands that change disks and therefore need the pre-flight checks.
    pub fn is_destructive(&self) -> bool {
        matches!(
            self.command,
            Commands::Plan { .. } | Commands::Apply { .. } | Commands::Umount { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_structure() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_requires_subcommand() {
        assert!(Cli::try_parse_from(["archdisk"]).is_err());
    }

    #[test]
    fn test_cli_plan_defaults() {
        let cli = Cli::try_parse_from(["archdisk", "plan"]).unwrap();
        assert!(!cli.dry_run);
        assert_eq!(cli.target, PathBuf::from("/mnt"));
        assert!(cli.is_destructive());
        match cli.command {
            Commands::Plan { manual, disk, save } => {
                assert!(!manual);
                assert!(disk.is_none());
                assert!(save.is_none());
            }
            _ => panic!("Expected Plan command"),
        }
    }

    #[test]
    fn test_cli_plan_with_options() {
        let cli = Cli::try_parse_from([
            "archdisk",
            "plan",
            "--manual",
            "--disk",
            "/dev/nvme0n1",
            "--save",
            "/tmp/session.json",
            "--dry-run",
            "--target",
            "/target",
        ])
        .unwrap();
        assert!(cli.dry_run);
        assert_eq!(cli.target, PathBuf::from("/target"));
        match cli.command {
            Commands::Plan { manual, disk, save } => {
                assert!(manual);
                assert_eq!(disk.unwrap(), PathBuf::from("/dev/nvme0n1"));
                assert_eq!(save.unwrap(), PathBuf::from("/tmp/session.json"));
            }
            _ => panic!("Expected Plan command"),
        }
    }

    #[test]
    fn test_cli_validate_command() {
        let cli = Cli::try_parse_from(["archdisk", "validate", "/path/to/session.json"]).unwrap();
        assert!(!cli.is_destructive());
        match cli.command {
            Commands::Validate { session } => {
                assert_eq!(session.to_str().unwrap(), "/path/to/session.json");
            }
            _ => panic!("Expected Validate command"),
        }
    }

    #[test]
    fn test_cli_inspect_disk_is_optional() {
        let cli = Cli::try_parse_from(["archdisk", "inspect"]).unwrap();
        assert!(matches!(cli.command, Commands::Inspect { disk: None }));
        assert!(!cli.is_destructive());
        let cli = Cli::try_parse_from(["archdisk", "inspect", "/dev/sda"]).unwrap();
        assert!(matches!(cli.command, Commands::Inspect { disk: Some(_) }));
    }
}
