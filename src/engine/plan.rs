//! Partitioning Plan
//!
//! The ordered collection of Partition Records for one installation target,
//! plus swap-file policy, and the format -> mount -> unmount orchestration.
//!
//! # Ordering
//!
//! | Phase   | Order |
//! |---------|-------|
//! | format  | plan order (table order) |
//! | mount   | ascending mount-point length: `/` before `/boot` before `/boot/efi` |
//! | unmount | exact reverse of the mount order |
//!
//! Mount and unmount run as bounded passes: a mount that fails because its
//! parent directory is not there yet is retried on the next pass, and the whole
//! loop gives up with `LayoutError::Timeout` after `RetryPolicy::max_attempts`.

use crate::command_runner::{CommandRunner, ToolCommand};
use crate::disk::btrfs;
use crate::disk::inspector;
use crate::disk::partition::{Passphrase, PartitionRecord};
use crate::error::{LayoutError, Result};
use crate::types::{FormatType, Role};
use crate::units::format_iec;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const DEFAULT_TARGET_ROOT: &str = "/mnt";

fn default_target_root() -> PathBuf {
    PathBuf::from(DEFAULT_TARGET_ROOT)
}

/// Bound on mount/unmount convergence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 50,
            delay: Duration::from_millis(200),
        }
    }
}

impl RetryPolicy {
    /// No sleeping between passes.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            delay: Duration::ZERO,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PartitioningPlan {
    #[serde(default)]
    main_disk: Option<PathBuf>,
    #[serde(default)]
    partitions: Vec<PartitionRecord>,
    #[serde(default)]
    swap_file_size: Option<u64>,
    #[serde(default)]
    btrfs_in_use: bool,
    #[serde(default)]
    xfs_in_use: bool,
    #[serde(default = "default_target_root")]
    target_root: PathBuf,
    #[serde(skip)]
    passphrase: Option<Passphrase>,
    #[serde(skip)]
    retry: RetryPolicy,
}

impl Default for PartitioningPlan {
    fn default() -> Self {
        Self::new(DEFAULT_TARGET_ROOT)
    }
}

impl PartitioningPlan {
    pub fn new(target_root: impl Into<PathBuf>) -> Self {
        Self {
            main_disk: None,
            partitions: Vec::new(),
            swap_file_size: None,
            btrfs_in_use: false,
            xfs_in_use: false,
            target_root: target_root.into(),
            passphrase: None,
            retry: RetryPolicy::default(),
        }
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    pub fn main_disk(&self) -> Option<&Path> {
        self.main_disk.as_deref()
    }

    pub fn set_main_disk(&mut self, disk: Option<PathBuf>) {
        self.main_disk = disk;
    }

    pub fn partitions(&self) -> &[PartitionRecord] {
        &self.partitions
    }

    pub fn partitions_mut(&mut self) -> &mut [PartitionRecord] {
        &mut self.partitions
    }

    pub fn add_partition(&mut self, record: PartitionRecord) {
        self.partitions.push(record);
    }

    /// Drop every collected decision (a rejected planning pass).
    pub fn clear(&mut self) {
        self.main_disk = None;
        self.partitions.clear();
        self.swap_file_size = None;
        self.passphrase = None;
        self.btrfs_in_use = false;
        self.xfs_in_use = false;
    }

    pub fn find_role(&self, role: Role) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| p.role() == role)
    }

    pub fn has_role(&self, role: Role) -> bool {
        self.find_role(role).is_some()
    }

    pub fn root(&self) -> Option<&PartitionRecord> {
        self.find_role(Role::Root)
    }

    pub fn swap_file_size(&self) -> Option<u64> {
        self.swap_file_size
    }

    /// A swap file and a SWAP partition are mutually exclusive.
    pub fn set_swap_file_size(&mut self, size: Option<u64>) -> Result<()> {
        match size {
            Some(0) => Err(LayoutError::validation("swap file size must be positive")),
            Some(_) if self.has_role(Role::Swap) => Err(LayoutError::validation(
                "a swap file cannot be combined with a SWAP partition",
            )),
            _ => {
                self.swap_file_size = size;
                Ok(())
            }
        }
    }

    /// Copy-on-write filesystem observed during formatting.
    pub fn btrfs_in_use(&self) -> bool {
        self.btrfs_in_use
    }

    /// XFS observed during formatting.
    pub fn xfs_in_use(&self) -> bool {
        self.xfs_in_use
    }

    pub fn target_root(&self) -> &Path {
        &self.target_root
    }

    pub fn set_target_root(&mut self, target_root: impl Into<PathBuf>) {
        self.target_root = target_root.into();
    }

    pub fn needs_passphrase(&self) -> bool {
        self.partitions.iter().any(PartitionRecord::is_encrypted)
    }

    pub fn set_passphrase(&mut self, passphrase: Option<Passphrase>) {
        self.passphrase = passphrase;
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    pub fn set_retry_policy(&mut self, retry: RetryPolicy) {
        self.retry = retry;
    }

    /// Mount points served by a partition other than ROOT.
    pub fn dedicated_mount_points(&self) -> Vec<String> {
        self.partitions
            .iter()
            .filter(|p| p.role() != Role::Root)
            .filter_map(|p| p.mount_point().map(str::to_string))
            .collect()
    }

    /// Record positions with a mount point, shortest mount point first.
    pub fn mount_order(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.partitions.len())
            .filter(|&i| self.partitions[i].mount_point().is_some())
            .collect();
        order.sort_by_key(|&i| self.partitions[i].mount_point().map_or(0, str::len));
        order
    }

    /// Reverse of `mount_order`: children before parents.
    pub fn umount_order(&self) -> Vec<usize> {
        let mut order = self.mount_order();
        order.reverse();
        order
    }

    // ========================================================================
    // Validation and summary
    // ========================================================================

    /// Firmware-independent invariants of a finished plan.
    pub fn validate(&self) -> Result<()> {
        let roots = self.partitions.iter().filter(|p| p.role() == Role::Root).count();
        if roots == 0 {
            return Err(LayoutError::missing_partition("a ROOT partition is required"));
        }
        if roots > 1 {
            return Err(LayoutError::validation("only one ROOT partition is allowed"));
        }
        if self.partitions.iter().filter(|p| p.role() == Role::Efi).count() > 1 {
            return Err(LayoutError::validation("only one EFI partition is allowed"));
        }

        let mut seen = HashSet::new();
        for record in &self.partitions {
            if let Some(mp) = record.mount_point() {
                if !seen.insert(mp) {
                    return Err(LayoutError::validation(format!(
                        "mount point {} is used twice",
                        mp
                    )));
                }
            }
            if record.role() == Role::Other && record.mount_point().is_none() {
                return Err(LayoutError::validation(format!(
                    "partition #{} (OTHER) needs a mount point",
                    record.index()
                )));
            }
        }

        if self.swap_file_size.is_some() && self.has_role(Role::Swap) {
            return Err(LayoutError::validation(
                "a swap file cannot be combined with a SWAP partition",
            ));
        }
        Ok(())
    }

    /// Human-readable summary shown before the user accepts a plan.
    pub fn summary(&self) -> String {
        let mut lines = Vec::new();
        lines.push(format!(
            "Partitioning plan for {} (target {})",
            self.main_disk
                .as_deref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "-".to_string()),
            self.target_root.display()
        ));
        for record in &self.partitions {
            lines.push(format!("  {}", record));
        }
        lines.push(match self.swap_file_size {
            Some(size) => format!("  Swap file: {}", format_iec(size)),
            None if self.has_role(Role::Swap) => "  Swap: partition".to_string(),
            None => "  Swap: none".to_string(),
        });
        lines.join("\n")
    }

    // ========================================================================
    // Orchestration
    // ========================================================================

    /// Format every record in plan order, then mount everything.
    ///
    /// A formatting failure unmounts whatever was set up so far and is returned
    /// as-is; there is no retry of formatting. A plan with encrypted records
    /// and no passphrase is refused before any command runs.
    pub fn format_and_mount_partitions(&mut self, runner: &dyn CommandRunner) -> Result<()> {
        if self.needs_passphrase() && self.passphrase.is_none() {
            return Err(LayoutError::PassphraseMissing);
        }

        self.btrfs_in_use = false;
        self.xfs_in_use = false;

        for i in 0..self.partitions.len() {
            let record = &self.partitions[i];
            if record.role().is_mountable() {
                match record.format_type() {
                    FormatType::Btrfs => self.btrfs_in_use = true,
                    FormatType::Xfs => self.xfs_in_use = true,
                    FormatType::Vfat | FormatType::Ext4 => {}
                }
            }

            if let Err(e) = self.format_one(runner, i) {
                error!("formatting partition #{} failed: {}", self.partitions[i].index(), e);
                if let Err(cleanup) = self.umount_partitions(runner) {
                    warn!("cleanup after failed format did not finish: {}", cleanup);
                }
                return Err(e);
            }
        }

        self.mount_partitions(runner)
    }

    fn format_one(&self, runner: &dyn CommandRunner, i: usize) -> Result<()> {
        let record = &self.partitions[i];
        record.format_partition(runner, self.passphrase.as_ref())?;

        if record.role() == Role::Root && record.format_type().is_cow() && record.should_format() {
            btrfs::create_layout(
                runner,
                &record.real_path()?,
                &self.target_root,
                &self.dedicated_mount_points(),
            )?;
        }
        Ok(())
    }

    fn count_unmounted(&self, runner: &dyn CommandRunner, order: &[usize]) -> Result<usize> {
        let mut count = 0;
        for &i in order {
            if !self.partitions[i].is_mounted(runner, &self.target_root)? {
                count += 1;
            }
        }
        Ok(count)
    }

    /// Mount every record with a mount point, in bounded passes.
    pub fn mount_partitions(&self, runner: &dyn CommandRunner) -> Result<()> {
        let order = self.mount_order();
        let cow_root = self.root().is_some_and(|r| r.format_type().is_cow());
        let excluded = self.dedicated_mount_points();
        let mut subvolumes_mounted = false;
        let mut last_error = None;

        for attempt in 1..=self.retry.max_attempts {
            for &i in &order {
                let record = &self.partitions[i];
                if record.is_mounted(runner, &self.target_root)? {
                    continue;
                }
                match record.mount(runner, &self.target_root) {
                    Ok(()) => {}
                    Err(e @ LayoutError::Tool { .. }) => {
                        debug!("mount pass {}: partition #{} not ready: {}", attempt, record.index(), e);
                        last_error = Some(e.to_string());
                        continue;
                    }
                    Err(e) => return Err(e),
                }
                if record.role() == Role::Root && cow_root && !subvolumes_mounted {
                    btrfs::mount_subvolumes(runner, &record.real_path()?, &self.target_root, &excluded)?;
                    subvolumes_mounted = true;
                }
            }

            let pending = self.count_unmounted(runner, &order)?;
            if pending == 0 {
                info!("all partitions mounted under {}", self.target_root.display());
                return Ok(());
            }
            debug!("mount pass {}: {} partition(s) pending", attempt, pending);
            std::thread::sleep(self.retry.delay);
        }

        Err(LayoutError::Timeout {
            operation: "mount".to_string(),
            attempts: self.retry.max_attempts,
            last_error,
        })
    }

    /// Disable swap, unmount children before parents, close LUKS mappings.
    ///
    /// Individual unmount failures are retried on the next pass; only a loop
    /// that never converges is an error.
    pub fn umount_partitions(&self, runner: &dyn CommandRunner) -> Result<()> {
        if let Err(e) = runner.run(&ToolCommand::new("swapoff").arg("-a")) {
            warn!("swapoff failed: {}", e);
        }

        let order = self.umount_order();
        let mut converged = order.is_empty();
        let mut last_error = None;
        for attempt in 1..=self.retry.max_attempts {
            let mut mounted = 0;
            for &i in &order {
                let record = &self.partitions[i];
                if !record.is_mounted(runner, &self.target_root)? {
                    continue;
                }
                if let Err(e) = record.try_umount(runner, &self.target_root) {
                    debug!("unmount pass {}: partition #{} busy: {}", attempt, record.index(), e);
                    last_error = Some(e.to_string());
                    mounted += 1;
                }
            }
            if mounted == 0 && self.count_unmounted(runner, &order)? == order.len() {
                converged = true;
                break;
            }
            debug!("unmount pass {}: {} partition(s) still mounted", attempt, mounted);
            std::thread::sleep(self.retry.delay);
        }

        for record in self.partitions.iter().filter(|p| p.is_encrypted()) {
            if let Some(name) = record.block_name() {
                if inspector::mapper_active(runner, name.as_str())? {
                    record.close_mapper(runner);
                }
            }
        }

        if converged {
            info!("all partitions unmounted from {}", self.target_root.display());
            Ok(())
        } else {
            Err(LayoutError::Timeout {
                operation: "unmount".to_string(),
                attempts: self.retry.max_attempts,
                last_error,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::partition::BlockName;
    use crate::testing::FakeRunner;

    fn record(index: u32, role: Role, path: &str) -> PartitionRecord {
        let mut r = PartitionRecord::planned(index, role, FormatType::Ext4, None);
        r.set_path(path);
        r
    }

    fn uefi_plan() -> PartitioningPlan {
        let mut plan = PartitioningPlan::default();
        plan.set_retry_policy(RetryPolicy::immediate(5));
        plan.set_main_disk(Some(PathBuf::from("/dev/sda")));
        plan.add_partition(record(1, Role::Efi, "/dev/sda1"));
        plan.add_partition(record(2, Role::Boot, "/dev/sda2"));
        plan.add_partition(record(3, Role::Root, "/dev/sda3"));
        plan.add_partition(record(4, Role::Home, "/dev/sda4"));
        plan
    }

    #[test]
    fn test_mount_order_parents_first() {
        let plan = uefi_plan();
        let mount: Vec<&str> = plan
            .mount_order()
            .into_iter()
            .filter_map(|i| plan.partitions()[i].mount_point())
            .collect();
        assert_eq!(mount, vec!["/", "/boot", "/home", "/boot/efi"]);

        let umount: Vec<&str> = plan
            .umount_order()
            .into_iter()
            .filter_map(|i| plan.partitions()[i].mount_point())
            .collect();
        assert_eq!(umount, vec!["/boot/efi", "/home", "/boot", "/"]);
    }

    #[test]
    fn test_swap_file_excludes_swap_partition() {
        let mut plan = uefi_plan();
        plan.set_swap_file_size(Some(4 << 30)).unwrap();
        assert!(plan.set_swap_file_size(Some(0)).is_err());

        plan.add_partition(record(5, Role::Swap, "/dev/sda5"));
        assert!(plan.validate().is_err());
        plan.set_swap_file_size(None).unwrap();
        assert!(plan.set_swap_file_size(Some(1 << 30)).is_err());
        plan.validate().unwrap();
    }

    #[test]
    fn test_validate_rejects_duplicates() {
        let mut plan = uefi_plan();
        plan.add_partition(record(5, Role::Root, "/dev/sda5"));
        assert!(matches!(plan.validate(), Err(LayoutError::Validation(_))));

        let mut plan = PartitioningPlan::default();
        plan.add_partition(record(1, Role::Home, "/dev/sda1"));
        assert!(matches!(plan.validate(), Err(LayoutError::MissingPartition(_))));
    }

    #[test]
    fn test_format_and_mount_sequence() {
        let runner = FakeRunner::new();
        let mut plan = uefi_plan();
        plan.format_and_mount_partitions(&runner).unwrap();

        let cmds = runner.commands();
        let mkfs: Vec<&String> = cmds.iter().filter(|c| c.starts_with("mkfs")).collect();
        assert_eq!(
            mkfs,
            vec![
                "mkfs.fat -F32 /dev/sda1",
                "mkfs.ext4 -F /dev/sda2",
                "mkfs.ext4 -F /dev/sda3",
                "mkfs.ext4 -F /dev/sda4"
            ]
        );
        assert_eq!(
            runner.mounted_targets(),
            vec!["/mnt", "/mnt/boot", "/mnt/home", "/mnt/boot/efi"]
        );
        assert!(!plan.btrfs_in_use());
    }

    #[test]
    fn test_mount_retries_until_parent_is_ready() {
        let runner = FakeRunner::new().fail_times(
            "mount --mkdir /dev/sda1 /mnt/boot/efi",
            2,
            32,
            "mount point does not exist",
        );
        let plan = uefi_plan();
        plan.mount_partitions(&runner).unwrap();

        let efi_attempts = runner
            .commands()
            .iter()
            .filter(|c| c.as_str() == "mount --mkdir /dev/sda1 /mnt/boot/efi")
            .count();
        assert_eq!(efi_attempts, 3);
        assert_eq!(runner.mounted_targets().len(), 4);
    }

    #[test]
    fn test_mount_never_converges() {
        let runner = FakeRunner::new().ghost_mount("/mnt/home");
        let plan = uefi_plan();
        match plan.mount_partitions(&runner) {
            Err(LayoutError::Timeout { operation, attempts, last_error }) => {
                assert_eq!(operation, "mount");
                assert_eq!(attempts, 5);
                assert_eq!(last_error, None);
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_mount_timeout_keeps_tool_error() {
        let runner = FakeRunner::new().fail(
            "mount --mkdir /dev/sda3 /mnt",
            32,
            "wrong fs type, bad superblock on /dev/sda3",
        );
        let plan = uefi_plan();
        let err = plan.mount_partitions(&runner).unwrap_err();
        match &err {
            LayoutError::Timeout { operation, last_error, .. } => {
                assert_eq!(operation, "mount");
                assert!(last_error.as_deref().unwrap().contains("bad superblock"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
        assert!(err.to_string().contains("wrong fs type, bad superblock on /dev/sda3"));
    }

    #[test]
    fn test_umount_timeout_keeps_tool_error() {
        let plan = uefi_plan();
        let runner = FakeRunner::new()
            .with_mount("/dev/sda3", "/mnt")
            .fail("umount /mnt", 32, "umount: /mnt: target is busy.");
        let err = plan.umount_partitions(&runner).unwrap_err();
        match err {
            LayoutError::Timeout { operation, last_error, .. } => {
                assert_eq!(operation, "unmount");
                assert!(last_error.unwrap().contains("target is busy"));
            }
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_passphrase_refused_before_any_command() {
        let runner = FakeRunner::new();
        let mut plan = uefi_plan();
        plan.partitions_mut()[3]
            .set_encryption(Some(BlockName::new("home").unwrap()))
            .unwrap();

        let err = plan.format_and_mount_partitions(&runner).unwrap_err();
        assert!(matches!(err, LayoutError::PassphraseMissing));
        assert!(!err.is_user_error());
        assert!(runner.commands().is_empty());
    }

    #[test]
    fn test_format_failure_unmounts_and_reports() {
        let runner = FakeRunner::new().fail("mkfs.ext4 -F /dev/sda3", 1, "device busy");
        let mut plan = uefi_plan();
        let err = plan.format_and_mount_partitions(&runner).unwrap_err();
        assert!(matches!(err, LayoutError::Tool { code: 1, .. }));

        let cmds = runner.commands();
        assert!(!cmds.iter().any(|c| c == "mkfs.ext4 -F /dev/sda4"));
        assert!(cmds.contains(&"swapoff -a".to_string()));
        assert!(runner.mounted_targets().is_empty());
    }

    #[test]
    fn test_unresolved_path_fails_at_format() {
        let runner = FakeRunner::new();
        let mut plan = PartitioningPlan::default();
        plan.add_partition(PartitionRecord::planned(2, Role::Root, FormatType::Ext4, None));
        let err = plan.format_and_mount_partitions(&runner).unwrap_err();
        assert!(matches!(err, LayoutError::Unresolved { index: 2 }));
    }

    #[test]
    fn test_btrfs_root_gets_subvolumes() {
        let runner = FakeRunner::new();
        let mut plan = uefi_plan();
        plan.partitions_mut()[2].set_format_type(FormatType::Btrfs).unwrap();
        plan.format_and_mount_partitions(&runner).unwrap();

        assert!(plan.btrfs_in_use());
        let cmds = runner.commands();
        assert!(cmds.contains(&"btrfs subvolume create /mnt/@".to_string()));
        // /home is a dedicated partition, so no @/home subvolume.
        assert!(!cmds.iter().any(|c| c.contains("subvol=@/home")));
        let targets = runner.mounted_targets();
        assert_eq!(targets[0], "/mnt");
        assert_eq!(targets[1], "/mnt/var");
        assert!(targets.contains(&"/mnt/boot/efi".to_string()));
    }

    #[test]
    fn test_umount_reverses_mount_and_closes_luks() {
        let runner = FakeRunner::new();
        let mut plan = uefi_plan();
        plan.partitions_mut()[3]
            .set_encryption(Some(BlockName::new("home").unwrap()))
            .unwrap();
        plan.set_passphrase(Some(Passphrase::new("pw").unwrap()));
        plan.format_and_mount_partitions(&runner).unwrap();
        assert!(runner.mapper_is_open("home"));

        let before = runner.commands().len();
        plan.umount_partitions(&runner).unwrap();
        let umounts: Vec<String> = runner.commands()[before..]
            .iter()
            .filter(|c| c.starts_with("umount"))
            .cloned()
            .collect();
        assert_eq!(
            umounts,
            vec!["umount /mnt/boot/efi", "umount /mnt/home", "umount /mnt/boot", "umount /mnt"]
        );
        assert!(!runner.mapper_is_open("home"));
        assert!(runner.mounted_targets().is_empty());
    }

    #[test]
    fn test_umount_closes_unmounted_mappers() {
        let runner = FakeRunner::new();
        let mut plan = uefi_plan();
        plan.partitions_mut()[2]
            .set_encryption(Some(BlockName::new("root").unwrap()))
            .unwrap();
        plan.set_passphrase(Some(Passphrase::new("pw").unwrap()));
        plan.partitions()[2].format_partition(&runner, Some(&Passphrase::new("pw").unwrap())).unwrap();
        assert!(runner.mapper_is_open("root"));

        plan.umount_partitions(&runner).unwrap();
        assert!(!runner.mapper_is_open("root"));
    }

    #[test]
    fn test_passphrase_not_serialized() {
        let mut plan = uefi_plan();
        plan.set_passphrase(Some(Passphrase::new("hunter2").unwrap()));
        let json = serde_json::to_string(&plan).unwrap();
        assert!(!json.contains("hunter2"));
        assert!(!format!("{:?}", plan).contains("hunter2"));
    }
}
