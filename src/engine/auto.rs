//! Automatic Planner
//!
//! Turns a disk snapshot and a handful of policy answers into a partition
//! table script plus the matching Partition Records.
//!
//! # Layout
//!
//! | Order | Partition | When |
//! |-------|-----------|------|
//! | 1 | BOOT (bootable, 1 GiB) | BIOS |
//! | 1 | EFI (512 MiB, vfat) | UEFI, fresh table |
//! | - | existing EFI, kept as-is | UEFI, dual boot |
//! | 2 | SWAP (size/32) | swap as partition |
//! | 3 | BOOT (1 GiB) | not yet present and encrypted root or btrfs/xfs root |
//! | 4 | ROOT (size/4, or the rest of the disk without /home) | always |
//! | 5 | HOME (rest of the disk) | separate home |
//!
//! "size" is the whole disk, or its free tail when dual-booting.
//!
//! # Pipeline
//!
//! `calculate_layout` is pure. `apply_layout` writes the table in one `sfdisk`
//! batch, then maps every record back to a device node: first from `sfdisk -J`
//! partition numbers, then by position in the live lsblk tree. Encryption is
//! applied to ROOT/HOME only after all paths are settled.

use crate::command_runner::{CommandRunner, ToolCommand};
use crate::disk::inspector::{self, inspect_disk, list_disks, partition_number, partition_path, Disk};
use crate::disk::partition::{BlockName, PartitionRecord};
use crate::engine::plan::PartitioningPlan;
use crate::engine::{ask_passphrase, PlannerOutcome};
use crate::error::{LayoutError, Result};
use crate::hardware::FirmwareMode;
use crate::prompt::Prompter;
use crate::types::{FormatType, Role, SwapPolicy};
use crate::units::{format_iec, sfdisk_size, GIB, MIB};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

pub const EFI_SIZE: u64 = 512 * MIB;
pub const BOOT_SIZE: u64 = GIB;
/// Dual boot is only offered above this much free space.
pub const DUAL_BOOT_MIN_FREE: u64 = 32 * GIB;

// ============================================================================
// Table script
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableLabel {
    Gpt,
    Dos,
}

/// Partition type column of a created partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PartKind {
    Efi,
    Swap,
    Linux,
    Home,
}

impl PartKind {
    /// sfdisk type alias for the given label.
    pub fn type_code(self, label: TableLabel) -> &'static str {
        match (label, self) {
            (TableLabel::Gpt, Self::Efi) => "U",
            (TableLabel::Gpt, Self::Swap) => "S",
            (TableLabel::Gpt, Self::Linux) => "L",
            (TableLabel::Gpt, Self::Home) => "H",
            (TableLabel::Dos, Self::Efi) => "ef",
            (TableLabel::Dos, Self::Swap) => "82",
            (TableLabel::Dos, Self::Linux | Self::Home) => "83",
        }
    }
}

/// One table-editor instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TableOp {
    /// Fresh partition table
    NewLabel(TableLabel),
    /// New partition; `size: None` takes the rest of the disk
    Create {
        number: u32,
        start: Option<u64>,
        size: Option<u64>,
        kind: PartKind,
        bootable: bool,
    },
    /// Commit the table
    Write,
}

/// The whole batch for one disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableScript {
    pub disk: PathBuf,
    pub label: TableLabel,
    pub ops: Vec<TableOp>,
    /// Add to the existing table instead of replacing it
    pub append: bool,
}

impl TableScript {
    /// sfdisk input for this batch.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for op in &self.ops {
            match op {
                TableOp::NewLabel(TableLabel::Gpt) => out.push_str("label: gpt\n"),
                TableOp::NewLabel(TableLabel::Dos) => out.push_str("label: dos\n"),
                TableOp::Create {
                    number,
                    start,
                    size,
                    kind,
                    bootable,
                } => {
                    let mut fields = Vec::new();
                    if let Some(start) = start {
                        fields.push(format!("start={}", sfdisk_size(*start)));
                    }
                    if let Some(size) = size {
                        fields.push(format!("size={}", sfdisk_size(*size)));
                    }
                    fields.push(format!("type={}", kind.type_code(self.label)));
                    if *bootable {
                        fields.push("bootable".to_string());
                    }
                    out.push_str(&format!(
                        "{} : {}\n",
                        partition_path(&self.disk, *number).display(),
                        fields.join(", ")
                    ));
                }
                TableOp::Write => out.push_str("write\n"),
            }
        }
        out
    }

    pub fn command(&self) -> ToolCommand {
        let cmd = ToolCommand::new("sfdisk");
        let cmd = if self.append {
            cmd.arg("--append")
        } else {
            cmd.args(["--wipe", "always"])
        };
        cmd.arg(self.disk.display().to_string()).stdin(self.render())
    }
}

impl fmt::Display for TableScript {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}

// ============================================================================
// Layout calculation
// ============================================================================

/// Everything the automatic planner asks the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoPolicy {
    pub firmware: FirmwareMode,
    pub swap: SwapPolicy,
    pub separate_home: bool,
    pub root_format: FormatType,
    pub encrypt_root: bool,
    pub encrypt_home: bool,
    pub dual_boot: bool,
}

impl AutoPolicy {
    pub fn new(firmware: FirmwareMode) -> Self {
        Self {
            firmware,
            swap: SwapPolicy::default(),
            separate_home: false,
            root_format: FormatType::default(),
            encrypt_root: false,
            encrypt_home: false,
            dual_boot: false,
        }
    }
}

/// A calculated, not yet written, layout.
#[derive(Debug, Clone)]
pub struct AutoLayout {
    pub script: TableScript,
    /// Records in table order; paths are unset except for a reused EFI.
    pub records: Vec<PartitionRecord>,
    pub swap_file_size: Option<u64>,
    pub encrypt_root: bool,
    pub encrypt_home: bool,
}

fn align_up(value: u64, alignment: u64) -> u64 {
    value.div_ceil(alignment) * alignment
}

/// Whether dual boot can be offered on this disk.
pub fn dual_boot_possible(disk: &Disk, firmware: FirmwareMode) -> bool {
    firmware.is_uefi() && disk.existing_efi().is_some() && disk.free_space() > DUAL_BOOT_MIN_FREE
}

/// Compute the table script and records for `disk` under `policy`. No I/O.
pub fn calculate_layout(disk: &Disk, policy: &AutoPolicy) -> Result<AutoLayout> {
    if policy.dual_boot && !dual_boot_possible(disk, policy.firmware) {
        return Err(LayoutError::validation(format!(
            "dual boot needs UEFI, an existing EFI partition and more than {} free on {}",
            format_iec(DUAL_BOOT_MIN_FREE),
            disk.path().display()
        )));
    }
    if !Role::Root.allowed_formats().contains(&policy.root_format) {
        return Err(LayoutError::UnsupportedFormat(policy.root_format.to_string()));
    }

    let base = if policy.dual_boot {
        disk.free_space()
    } else {
        disk.total_size()
    };
    let swap_size = base / 32;
    let root_size = base / 4;

    let label = if policy.firmware.is_bios() {
        TableLabel::Dos
    } else {
        TableLabel::Gpt
    };

    let mut ops = Vec::new();
    let mut records = Vec::new();
    let mut number: u32 = 1;
    // Appended partitions start after the last existing one, numbered past
    // the highest existing partition number.
    let mut start = None;

    if policy.dual_boot {
        number = disk.next_partition_number();
        start = Some(align_up(disk.total_size() - disk.free_space(), MIB));
    } else {
        ops.push(TableOp::NewLabel(label));
    }

    let mut create = |ops: &mut Vec<TableOp>,
                      records: &mut Vec<PartitionRecord>,
                      role: Role,
                      kind: PartKind,
                      size: Option<u64>,
                      planned_size: u64,
                      format: FormatType,
                      bootable: bool| {
        ops.push(TableOp::Create {
            number,
            start: start.take(),
            size,
            kind,
            bootable,
        });
        records.push(PartitionRecord::planned(number, role, format, Some(planned_size)));
        number += 1;
    };

    match (policy.firmware, policy.dual_boot) {
        (FirmwareMode::Bios, _) => create(
            &mut ops,
            &mut records,
            Role::Boot,
            PartKind::Linux,
            Some(BOOT_SIZE),
            BOOT_SIZE,
            FormatType::Ext4,
            true,
        ),
        (FirmwareMode::Uefi, false) => create(
            &mut ops,
            &mut records,
            Role::Efi,
            PartKind::Efi,
            Some(EFI_SIZE),
            EFI_SIZE,
            FormatType::Vfat,
            false,
        ),
        (FirmwareMode::Uefi, true) => {
            let existing = disk
                .existing_efi()
                .ok_or_else(|| LayoutError::missing_partition("no EFI partition to share"))?;
            let mut efi = existing.clone();
            efi.set_role(Role::Efi);
            efi.set_should_format(false);
            records.push(efi);
        }
    }

    if policy.swap == SwapPolicy::Partition {
        create(
            &mut ops,
            &mut records,
            Role::Swap,
            PartKind::Swap,
            Some(swap_size),
            swap_size,
            FormatType::default(),
            false,
        );
    }

    let has_boot = records.iter().any(|r| r.role() == Role::Boot);
    if !has_boot && (policy.encrypt_root || policy.root_format.requires_separate_boot()) {
        create(
            &mut ops,
            &mut records,
            Role::Boot,
            PartKind::Linux,
            Some(BOOT_SIZE),
            BOOT_SIZE,
            FormatType::Ext4,
            false,
        );
    }

    let fixed: u64 = records
        .iter()
        .filter(|r| r.path().is_none())
        .filter_map(PartitionRecord::planned_size)
        .sum();
    if fixed + root_size > base {
        return Err(LayoutError::validation(format!(
            "{} is too small: {} needed before /home, {} available",
            disk.path().display(),
            format_iec(fixed + root_size),
            format_iec(base)
        )));
    }

    if policy.separate_home {
        create(
            &mut ops,
            &mut records,
            Role::Root,
            PartKind::Linux,
            Some(root_size),
            root_size,
            policy.root_format,
            false,
        );
        let rest = base - fixed - root_size;
        create(
            &mut ops,
            &mut records,
            Role::Home,
            PartKind::Home,
            None,
            rest,
            policy.root_format,
            false,
        );
    } else {
        create(
            &mut ops,
            &mut records,
            Role::Root,
            PartKind::Linux,
            None,
            root_size,
            policy.root_format,
            false,
        );
    }
    ops.push(TableOp::Write);

    Ok(AutoLayout {
        script: TableScript {
            disk: disk.path().to_path_buf(),
            label,
            ops,
            append: policy.dual_boot,
        },
        records,
        swap_file_size: (policy.swap == SwapPolicy::File).then_some(swap_size),
        encrypt_root: policy.encrypt_root,
        encrypt_home: policy.encrypt_home && policy.separate_home,
    })
}

/// Set the pinned ROOT/HOME block names on records that should be encrypted.
fn apply_encryption(records: &mut [PartitionRecord], encrypt_root: bool, encrypt_home: bool) -> Result<()> {
    for record in records {
        let wanted = match record.role() {
            Role::Root => encrypt_root,
            Role::Home => encrypt_home,
            _ => false,
        };
        if let (true, Some(name)) = (wanted, record.role().pinned_block_name()) {
            record.set_encryption(Some(BlockName::new(name)?))?;
        }
    }
    Ok(())
}

impl AutoLayout {
    /// Plan as it will look once written, for the confirmation summary.
    pub fn preview(&self, target_root: &Path) -> Result<PartitioningPlan> {
        let mut records = self.records.clone();
        apply_encryption(&mut records, self.encrypt_root, self.encrypt_home)?;
        self.to_plan(records, target_root)
    }

    fn to_plan(&self, records: Vec<PartitionRecord>, target_root: &Path) -> Result<PartitioningPlan> {
        let mut plan = PartitioningPlan::new(target_root);
        plan.set_main_disk(Some(self.script.disk.clone()));
        for record in records {
            plan.add_partition(record);
        }
        plan.set_swap_file_size(self.swap_file_size)?;
        Ok(plan)
    }
}

/// Map records without a path to device nodes after the table was written.
pub fn resolve_paths(
    runner: &dyn CommandRunner,
    disk: &Path,
    records: &mut [PartitionRecord],
) -> Result<()> {
    if runner.is_dry_run() {
        for record in records.iter_mut().filter(|r| r.path().is_none()) {
            record.set_path(partition_path(disk, record.index()));
        }
        return Ok(());
    }

    let nodes: HashMap<u32, PathBuf> = inspector::query_table(runner, disk)?
        .map(|table| {
            table
                .partitions
                .iter()
                .filter_map(|p| {
                    let node = PathBuf::from(&p.node);
                    partition_number(disk, &node).map(|n| (n, node))
                })
                .collect()
        })
        .unwrap_or_default();

    let mut children: Option<Vec<PathBuf>> = None;
    for record in records.iter_mut().filter(|r| r.path().is_none()) {
        if let Some(node) = nodes.get(&record.index()) {
            record.set_path(node);
            continue;
        }
        if children.is_none() {
            children = Some(inspector::partition_children(runner, disk)?);
        }
        let live = children.as_deref().unwrap_or_default();
        // A child carrying the same number wins; position only counts when
        // the node names do not encode a number.
        let numbered = live
            .iter()
            .find(|c| partition_number(disk, c) == Some(record.index()));
        let nth = numbered.or_else(|| {
            live.iter()
                .all(|c| partition_number(disk, c).is_none())
                .then(|| live.get(record.index() as usize - 1))
                .flatten()
        });
        match nth {
            Some(child) => {
                warn!(
                    "partition #{} resolved by position to {}",
                    record.index(),
                    child.display()
                );
                record.set_path(child);
            }
            None => warn!("partition #{} could not be resolved on {}", record.index(), disk.display()),
        }
    }
    Ok(())
}

/// Write the table, resolve device paths, apply encryption, and build the plan.
pub fn apply_layout(
    runner: &dyn CommandRunner,
    layout: AutoLayout,
    target_root: &Path,
) -> Result<PartitioningPlan> {
    info!(
        "writing partition table on {}{}",
        layout.script.disk.display(),
        if layout.script.append { " (append)" } else { "" }
    );
    runner.run(&layout.script.command())?;
    runner.run(&ToolCommand::new("udevadm").arg("settle"))?;

    let mut records = layout.records.clone();
    resolve_paths(runner, &layout.script.disk, &mut records)?;
    apply_encryption(&mut records, layout.encrypt_root, layout.encrypt_home)?;
    layout.to_plan(records, target_root)
}

// ============================================================================
// Interactive planner
// ============================================================================

pub struct AutoPlanner<'a> {
    runner: &'a dyn CommandRunner,
    prompter: &'a dyn Prompter,
    firmware: FirmwareMode,
    target_root: PathBuf,
}

const SWAP_CHOICES: [(SwapPolicy, &str); 3] = [
    (SwapPolicy::File, "Swap file"),
    (SwapPolicy::Partition, "Swap partition"),
    (SwapPolicy::None, "No swap"),
];

impl<'a> AutoPlanner<'a> {
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

    fn choose_disk(&self) -> Result<PathBuf> {
        let disks = list_disks(self.runner)?;
        if disks.is_empty() {
            return Err(LayoutError::inspection("no disks found"));
        }
        let items: Vec<String> = disks.iter().map(ToString::to_string).collect();
        let choice = self.prompter.select("Disk to install on", &items, 0)?;
        Ok(disks[choice].path.clone())
    }

    /// Ask every policy question for `disk`.
    pub fn ask_policy(&self, disk: &Disk) -> Result<AutoPolicy> {
        let mut policy = AutoPolicy::new(self.firmware);
        let p = self.prompter;

        if dual_boot_possible(disk, self.firmware) {
            policy.dual_boot = p.confirm(
                &format!(
                    "An EFI partition and {} of free space were found. Install alongside the existing system?",
                    format_iec(disk.free_space())
                ),
                true,
            )?;
        }

        let items: Vec<String> = SWAP_CHOICES.iter().map(|(_, l)| l.to_string()).collect();
        policy.swap = SWAP_CHOICES[p.select("Swap", &items, 0)?].0;

        policy.separate_home = p.confirm("Create a separate /home partition?", false)?;

        let formats = Role::Root.allowed_formats();
        let items: Vec<String> = formats.iter().map(ToString::to_string).collect();
        policy.root_format = formats[p.select("Root filesystem", &items, 0)?];

        policy.encrypt_root = p.confirm("Encrypt the root partition?", false)?;
        if policy.separate_home {
            policy.encrypt_home = p.confirm("Encrypt the /home partition?", policy.encrypt_root)?;
        }
        Ok(policy)
    }

    /// Interactive planning: policy -> summary -> table write -> plan.
    pub fn run(&self, disk: Option<&Path>) -> Result<PlannerOutcome> {
        loop {
            let disk_path = match disk {
                Some(path) => path.to_path_buf(),
                None => self.choose_disk()?,
            };
            let snapshot = inspect_disk(self.runner, &disk_path)?;
            let policy = self.ask_policy(&snapshot)?;

            let layout = match calculate_layout(&snapshot, &policy) {
                Ok(layout) => layout,
                Err(e) if e.is_user_error() => {
                    self.prompter.notify(&e.to_string())?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            let preview = layout.preview(&self.target_root)?;
            let question = format!(
                "{}\n\nAll data outside the kept partitions on {} will be lost. Write this layout?",
                preview.summary(),
                disk_path.display()
            );
            if !self.prompter.confirm(&question, false)? {
                if self.prompter.confirm("Start over with automatic partitioning?", true)? {
                    continue;
                }
                return Ok(PlannerOutcome::SwitchMode);
            }

            let mut plan = apply_layout(self.runner, layout, &self.target_root)?;
            if plan.needs_passphrase() {
                plan.set_passphrase(Some(ask_passphrase(self.prompter)?));
            }
            return Ok(PlannerOutcome::Accepted(plan));
        }
    }
}
