//! Manual Planner
//!
//! The user carves partitions with `cfdisk`; every Linux/EFI partition found
//! afterwards on the edited disks is classified one by one (role, mount point,
//! format, encryption). The finished plan must satisfy the boot requirements
//! checked by `validate_manual` or the pass is thrown away.

use crate::command_runner::{CommandRunner, ToolCommand};
use crate::disk::inspector::{inspect_disk, list_disks};
use crate::disk::partition::PartitionRecord;
use crate::engine::plan::PartitioningPlan;
use crate::engine::{ask_passphrase, PlannerOutcome};
use crate::error::{LayoutError, Result};
use crate::hardware::FirmwareMode;
use crate::prompt::Prompter;
use crate::types::{FormatType, Role};
use crate::units::parse_iec_size;
use std::path::{Path, PathBuf};
use strum::IntoEnumIterator;
use tracing::{debug, info};

/// Boot requirements of a hand-made layout, then the generic plan checks.
pub fn validate_manual(plan: &PartitioningPlan, firmware: FirmwareMode) -> Result<()> {
    if firmware.is_uefi() {
        let has_efi = plan.has_role(Role::Efi);
        let has_vfat_boot = plan
            .partitions()
            .iter()
            .any(|p| p.role() == Role::Boot && p.format_type() == FormatType::Vfat);
        if !has_efi && !has_vfat_boot {
            return Err(LayoutError::missing_partition(
                "UEFI systems need an EFI partition or a vfat BOOT partition",
            ));
        }
    }

    let root = plan
        .root()
        .ok_or_else(|| LayoutError::missing_partition("a ROOT partition is required"))?;

    if root.is_encrypted() && !plan.has_role(Role::Boot) {
        return Err(LayoutError::missing_partition(
            "an encrypted ROOT needs a separate BOOT partition",
        ));
    }

    plan.validate()
}

/// Roles offered in the classification menu.
pub fn selectable_roles(firmware: FirmwareMode) -> Vec<Role> {
    Role::iter()
        .filter(|role| firmware.is_uefi() || *role != Role::Efi)
        .collect()
}

pub struct ManualPlanner<'a> {
    runner: &'a dyn CommandRunner,
    prompter: &'a dyn Prompter,
    firmware: FirmwareMode,
    target_root: PathBuf,
}

impl<'a> ManualPlanner<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        prompter: &'a dyn Prompter,
        firmware: FirmwareMode,
        target_root: impl Into<PathBuf>,
    ) -> Self {
        Self {
            runner,
            prompter,
            firmware,
            target_root: target_root.into(),
        }
    }

    fn edit_disk(&self, disk: &Path, touched: &mut Vec<PathBuf>) -> Result<()> {
        info!("starting cfdisk on {}", disk.display());
        self.runner
            .run(&ToolCommand::new("cfdisk").arg(disk.display().to_string()).interactive())?;
        if !touched.iter().any(|d| d == disk) {
            touched.push(disk.to_path_buf());
        }
        Ok(())
    }

    /// Let the user edit disks until they pick "Done". Returns the edited disks.
    fn editing_passes(&self, first: Option<&Path>) -> Result<Vec<PathBuf>> {
        let mut touched = Vec::new();
        if let Some(disk) = first {
            self.edit_disk(disk, &mut touched)?;
        }
        loop {
            let disks = list_disks(self.runner)?;
            let mut items: Vec<String> = disks.iter().map(ToString::to_string).collect();
            items.push("Done".to_string());
            let default = if touched.is_empty() { 0 } else { disks.len() };
            let choice = self
                .prompter
                .select("Disk to partition with cfdisk", &items, default)?;
            match disks.get(choice) {
                Some(disk) => self.edit_disk(&disk.path, &mut touched)?,
                None => return Ok(touched),
            }
        }
    }

    fn ask_mount_point(&self, record: &mut PartitionRecord) -> Result<()> {
        loop {
            let answer = self.prompter.input(
                &format!("Mount point for {}", record),
                record.mount_point(),
            )?;
            match record.set_mount_point(answer.trim()) {
                Ok(()) => return Ok(()),
                Err(e) => self.prompter.notify(&e.to_string())?,
            }
        }
    }

    /// Role, mount point, format and encryption for one discovered partition.
    pub fn classify(&self, record: &mut PartitionRecord) -> Result<()> {
        let roles = selectable_roles(self.firmware);
        let items: Vec<String> = roles.iter().map(ToString::to_string).collect();
        let default = roles.iter().position(|r| *r == record.role()).unwrap_or(0);
        let question = format!("Role of {}", record);
        let role = roles[self.prompter.select(&question, &items, default)?];
        record.set_role(role);

        if role == Role::Other {
            self.ask_mount_point(record)?;
        }
        record.ask_for_format(self.prompter)?;
        record.ask_for_encryption(self.prompter, self.runner)?;
        debug!("classified {}", record);
        Ok(())
    }

    /// Inspect every edited disk and classify each usable partition.
    fn collect(&self, touched: &[PathBuf]) -> Result<PartitioningPlan> {
        let mut plan = PartitioningPlan::new(&self.target_root);
        for disk_path in touched {
            let disk = inspect_disk(self.runner, disk_path)?;
            for mut record in disk.into_partitions() {
                self.classify(&mut record)?;
                if record.role() == Role::Root {
                    let parent = record
                        .info()
                        .and_then(|i| i.parent_disk.as_deref())
                        .map(|name| PathBuf::from(format!("/dev/{}", name)))
                        .unwrap_or_else(|| disk_path.clone());
                    plan.set_main_disk(Some(parent));
                }
                plan.add_partition(record);
            }
        }
        Ok(plan)
    }

    fn ask_swap_file(&self, plan: &mut PartitioningPlan) -> Result<()> {
        let cow_root = plan.root().is_some_and(|r| r.format_type().is_cow());
        if plan.has_role(Role::Swap) || cow_root {
            return Ok(());
        }
        if !self.prompter.confirm("Create a swap file?", true)? {
            return Ok(());
        }
        loop {
            let answer = self.prompter.input("Swap file size", Some("4G"))?;
            let result = parse_iec_size(answer.trim()).and_then(|size| plan.set_swap_file_size(Some(size)));
            match result {
                Ok(()) => return Ok(()),
                Err(e) if e.is_user_error() => self.prompter.notify(&e.to_string())?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Ask whether to start over. `false` hands over to the automatic planner.
    fn start_over(&self) -> Result<bool> {
        self.prompter
            .confirm("Start over with manual partitioning?", true)
    }

    /// Interactive planning: edit -> classify -> validate -> swap file -> plan.
    pub fn run(&self, disk: Option<&Path>) -> Result<PlannerOutcome> {
        let mut first = disk;
        loop {
            let touched = self.editing_passes(first.take())?;
            if touched.is_empty() {
                self.prompter.notify("No disk was edited.")?;
                if self.start_over()? {
                    continue;
                }
                return Ok(PlannerOutcome::SwitchMode);
            }

            let mut plan = self.collect(&touched)?;
            if let Err(e) = validate_manual(&plan, self.firmware) {
                if !e.is_user_error() {
                    return Err(e);
                }
                plan.clear();
                self.prompter.notify(&e.to_string())?;
                if self.start_over()? {
                    continue;
                }
                return Ok(PlannerOutcome::SwitchMode);
            }

            self.ask_swap_file(&mut plan)?;

            let question = format!("{}\n\nUse this layout?", plan.summary());
            if !self.prompter.confirm(&question, true)? {
                if self.start_over()? {
                    continue;
                }
                return Ok(PlannerOutcome::SwitchMode);
            }

            if plan.needs_passphrase() {
                plan.set_passphrase(Some(ask_passphrase(self.prompter)?));
            }
            return Ok(PlannerOutcome::Accepted(plan));
        }
    }
}
