//! Disk Inspector
//!
//! Read-only snapshots of the block-device layer, built from `lsblk -J` and
//! `sfdisk -J`. A `Disk` is never kept in sync with later table edits; callers
//! re-inspect after changing a table.
//!
//! Sizes are always read with `lsblk -b`: free space is the exact byte
//! difference between the disk size and the end of the last partition, so
//! lsblk's rounded human-readable column is never used.
//!
//! # Safety filter
//!
//! Only children whose partition-type name carries a Linux or EFI signature
//! become Partition Records. Anything else on the disk (Windows data, recovery
//! partitions, vendor blobs) is invisible to the planners and therefore never
//! formatted or mounted.

use crate::command_runner::{CommandRunner, ToolCommand};
use crate::disk::partition::{PartitionInfo, PartitionRecord};
use crate::error::{LayoutError, Result};
use crate::units::format_iec;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Columns requested for partition trees.
pub const LSBLK_COLUMNS: &str = "NAME,PATH,SIZE,TYPE,PARTTYPENAME,FSTYPE,UUID,MOUNTPOINT,PKNAME";

// ============================================================================
// lsblk / sfdisk JSON
// ============================================================================

#[derive(Debug, Deserialize)]
pub(crate) struct LsblkOutput {
    #[serde(default)]
    pub blockdevices: Vec<LsblkDevice>,
}

/// One node of the `lsblk -J` tree. Every column may be null.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct LsblkDevice {
    pub name: Option<String>,
    pub path: Option<String>,
    pub size: Option<LsblkSize>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub parttypename: Option<String>,
    pub fstype: Option<String>,
    pub uuid: Option<String>,
    pub mountpoint: Option<String>,
    pub pkname: Option<String>,
    pub model: Option<String>,
    #[serde(default)]
    pub children: Vec<LsblkDevice>,
}

/// `SIZE` under `-b`: a JSON number, or a numeric string on older util-linux.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub(crate) enum LsblkSize {
    Bytes(u64),
    Text(String),
}

impl LsblkDevice {
    pub fn size_bytes(&self) -> Result<u64> {
        match &self.size {
            Some(LsblkSize::Bytes(bytes)) => Ok(*bytes),
            Some(LsblkSize::Text(text)) => text
                .trim()
                .parse()
                .map_err(|_| LayoutError::InvalidSize(text.clone())),
            None => Err(LayoutError::inspection(format!(
                "lsblk reported no size for {}",
                self.name.as_deref().unwrap_or("?")
            ))),
        }
    }

    /// Partition-type names that mark a partition the installer may touch.
    pub fn has_linux_or_efi_signature(&self) -> bool {
        self.parttypename
            .as_deref()
            .is_some_and(|name| name.starts_with("Linux") || name.contains("EFI"))
    }

    pub fn device_path(&self) -> Option<PathBuf> {
        match (&self.path, &self.name) {
            (Some(path), _) => Some(PathBuf::from(path)),
            (None, Some(name)) => Some(PathBuf::from(format!("/dev/{}", name))),
            (None, None) => None,
        }
    }

    pub fn info(&self) -> Result<PartitionInfo> {
        Ok(PartitionInfo {
            size: self.size_bytes()?,
            parent_disk: non_empty(&self.pkname),
            fs_type: non_empty(&self.fstype),
            uuid: non_empty(&self.uuid),
            part_type: non_empty(&self.parttypename),
        })
    }
}

fn non_empty(value: &Option<String>) -> Option<String> {
    value.as_deref().filter(|s| !s.is_empty()).map(str::to_string)
}

#[derive(Debug, Deserialize)]
pub(crate) struct SfdiskOutput {
    pub partitiontable: SfdiskTable,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SfdiskTable {
    #[serde(default = "default_sector_size")]
    pub sectorsize: u64,
    #[serde(default)]
    pub partitions: Vec<SfdiskPartition>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SfdiskPartition {
    pub node: String,
    pub start: u64,
    pub size: u64,
}

fn default_sector_size() -> u64 {
    512
}

impl SfdiskTable {
    /// Highest partition number in the table (0 when empty).
    pub fn last_partition_number(&self, disk: &Path) -> u32 {
        self.partitions
            .iter()
            .filter_map(|p| partition_number(disk, Path::new(&p.node)))
            .max()
            .unwrap_or(0)
    }

    /// Byte offset just past the last partition in the table.
    pub fn end_of_last_partition(&self) -> u64 {
        self.partitions
            .iter()
            .map(|p| p.start.saturating_add(p.size).saturating_mul(self.sectorsize))
            .max()
            .unwrap_or(0)
    }
}

// ============================================================================
// Queries
// ============================================================================

/// `lsblk -J -b` for a single device, returning its node (with children).
pub(crate) fn query_device(runner: &dyn CommandRunner, device: &Path) -> Result<LsblkDevice> {
    let cmd = ToolCommand::query("lsblk").args([
        "-J".to_string(),
        "-b".to_string(),
        "-o".to_string(),
        LSBLK_COLUMNS.to_string(),
        device.display().to_string(),
    ]);
    let output = runner.run(&cmd)?;
    if output.stdout.trim().is_empty() {
        return Err(LayoutError::inspection(format!(
            "lsblk returned nothing for {}",
            device.display()
        )));
    }
    let parsed: LsblkOutput = serde_json::from_str(&output.stdout)?;
    parsed
        .blockdevices
        .into_iter()
        .next()
        .ok_or_else(|| LayoutError::device_missing(device))
}

/// `sfdisk -J` for a disk. A disk without a partition table yields `None`.
pub(crate) fn query_table(runner: &dyn CommandRunner, disk: &Path) -> Result<Option<SfdiskTable>> {
    let cmd = ToolCommand::query("sfdisk").args(["-J".to_string(), disk.display().to_string()]);
    let output = runner.execute(&cmd)?;
    if !output.success || output.stdout.trim().is_empty() {
        debug!("no readable partition table on {}", disk.display());
        return Ok(None);
    }
    let parsed: SfdiskOutput = serde_json::from_str(&output.stdout)?;
    Ok(Some(parsed.partitiontable))
}

/// Live children of a disk, in table order, unfiltered.
pub fn partition_children(runner: &dyn CommandRunner, disk: &Path) -> Result<Vec<PathBuf>> {
    let node = query_device(runner, disk)?;
    Ok(node
        .children
        .iter()
        .filter(|c| c.kind.as_deref() == Some("part"))
        .filter_map(LsblkDevice::device_path)
        .collect())
}

/// Mount targets currently backed by `device` (empty when unmounted).
pub fn mount_targets(runner: &dyn CommandRunner, device: &Path) -> Result<Vec<String>> {
    let cmd = ToolCommand::query("findmnt").args([
        "-n".to_string(),
        "-o".to_string(),
        "TARGET".to_string(),
        "-S".to_string(),
        device.display().to_string(),
    ]);
    let output = runner.execute(&cmd)?;
    if !output.success {
        return Ok(Vec::new());
    }
    Ok(output
        .stdout
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect())
}

/// Whether `device` is mounted exactly at `target`.
pub fn is_mounted_at(runner: &dyn CommandRunner, device: &Path, target: &Path) -> Result<bool> {
    let target = target.display().to_string();
    Ok(mount_targets(runner, device)?.iter().any(|t| *t == target))
}

/// Probe for an existing LUKS header.
pub fn is_luks(runner: &dyn CommandRunner, device: &Path) -> Result<bool> {
    runner.check(&ToolCommand::query("cryptsetup").args(["isLuks".to_string(), device.display().to_string()]))
}

/// Whether `/dev/mapper/<name>` is an active LUKS mapping.
pub fn mapper_active(runner: &dyn CommandRunner, name: &str) -> Result<bool> {
    runner.check(&ToolCommand::query("cryptsetup").args(["status", name]))
}

// ============================================================================
// Device naming
// ============================================================================

/// Partition number of `node` on `disk` (`/dev/sda3` -> 3, `/dev/nvme0n1p2` -> 2).
pub fn partition_number(disk: &Path, node: &Path) -> Option<u32> {
    let disk = disk.to_str()?;
    let node = node.to_str()?;
    let suffix = node.strip_prefix(disk)?;
    let suffix = if disk.ends_with(|c: char| c.is_ascii_digit()) {
        suffix.strip_prefix('p')?
    } else {
        suffix
    };
    suffix.parse().ok()
}

/// Device path of partition `number` on `disk`.
pub fn partition_path(disk: &Path, number: u32) -> PathBuf {
    let disk = disk.display().to_string();
    if disk.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{}p{}", disk, number))
    } else {
        PathBuf::from(format!("{}{}", disk, number))
    }
}

// ============================================================================
// Disk snapshot
// ============================================================================

/// Read-only snapshot of one disk.
#[derive(Debug, Clone)]
pub struct Disk {
    path: PathBuf,
    partitions: Vec<PartitionRecord>,
    partition_count: usize,
    last_partition_number: u32,
    total_size: u64,
    free_space: u64,
}

impl Disk {
    /// Build a snapshot from already-known values.
    pub fn new(
        path: impl Into<PathBuf>,
        partitions: Vec<PartitionRecord>,
        partition_count: usize,
        total_size: u64,
        free_space: u64,
    ) -> Self {
        Self {
            path: path.into(),
            partitions,
            partition_count,
            last_partition_number: partition_count as u32,
            total_size,
            free_space,
        }
    }

    /// Override the highest partition number when the table has gaps.
    pub fn with_last_partition_number(mut self, number: u32) -> Self {
        self.last_partition_number = number;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Linux/EFI partitions, in table order.
    pub fn partitions(&self) -> &[PartitionRecord] {
        &self.partitions
    }

    pub fn into_partitions(self) -> Vec<PartitionRecord> {
        self.partitions
    }

    /// Every partition in the table, including ones filtered out of `partitions`.
    pub fn partition_count(&self) -> usize {
        self.partition_count
    }

    /// Number the next appended partition gets. Gaps are never reused.
    pub fn next_partition_number(&self) -> u32 {
        self.last_partition_number + 1
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn free_space(&self) -> u64 {
        self.free_space
    }

    /// Existing VFAT EFI system partition, if the disk carries one.
    pub fn existing_efi(&self) -> Option<&PartitionRecord> {
        self.partitions.iter().find(|p| {
            p.info().is_some_and(|info| {
                info.part_type.as_deref().is_some_and(|t| t.contains("EFI"))
                    && info.fs_type.as_deref() == Some("vfat")
            })
        })
    }
}

impl fmt::Display for Disk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} total, {} free, {} partition(s)",
            self.path.display(),
            format_iec(self.total_size),
            format_iec(self.free_space),
            self.partition_count
        )?;
        for record in &self.partitions {
            let info = record.info();
            writeln!(
                f,
                "  {:<16} {:>10}  {:<8} {}",
                record
                    .path()
                    .map(|p| p.display().to_string())
                    .unwrap_or_else(|| "-".to_string()),
                info.map(|i| format_iec(i.size)).unwrap_or_default(),
                info.and_then(|i| i.fs_type.clone()).unwrap_or_default(),
                info.and_then(|i| i.part_type.clone()).unwrap_or_default(),
            )?;
        }
        Ok(())
    }
}

/// Inspect `path` and return a Disk snapshot.
pub fn inspect_disk(runner: &dyn CommandRunner, path: &Path) -> Result<Disk> {
    let node = query_device(runner, path)?;
    let total_size = node.size_bytes()?;

    let children: Vec<&LsblkDevice> = node
        .children
        .iter()
        .filter(|c| c.kind.as_deref() == Some("part"))
        .collect();

    let mut partitions = Vec::new();
    for child in &children {
        if !child.has_linux_or_efi_signature() {
            debug!(
                "ignoring {:?} ({:?}) on {}",
                child.name,
                child.parttypename,
                path.display()
            );
            continue;
        }
        let Some(device) = child.device_path() else {
            continue;
        };
        let index = partition_number(path, &device).ok_or_else(|| {
            LayoutError::inspection(format!(
                "cannot derive partition number of {} on {}",
                device.display(),
                path.display()
            ))
        })?;
        partitions.push(PartitionRecord::discovered(index, device, child.info()?));
    }

    let numbered_children = children
        .iter()
        .filter_map(|c| c.device_path())
        .filter_map(|device| partition_number(path, &device))
        .max()
        .unwrap_or(0);

    let (free_space, last_partition_number) = if children.is_empty() {
        (total_size, 0)
    } else {
        let table = query_table(runner, path)?.ok_or_else(|| {
            LayoutError::inspection(format!(
                "{} has partitions but no readable partition table",
                path.display()
            ))
        })?;
        (
            total_size.saturating_sub(table.end_of_last_partition()),
            table.last_partition_number(path).max(numbered_children),
        )
    };

    debug!(
        "inspected {}: total {}, free {}, {} usable partition(s)",
        path.display(),
        total_size,
        free_space,
        partitions.len()
    );

    Ok(Disk {
        path: path.to_path_buf(),
        partitions,
        partition_count: children.len(),
        last_partition_number,
        total_size,
        free_space,
    })
}

/// One whole disk offered for selection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiskSummary {
    pub path: PathBuf,
    pub size: u64,
    pub model: Option<String>,
}

impl fmt::Display for DiskSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.path.display(), format_iec(self.size))?;
        if let Some(model) = &self.model {
            write!(f, " {}", model)?;
        }
        Ok(())
    }
}

/// Whole disks attached to the machine (`lsblk -d`).
pub fn list_disks(runner: &dyn CommandRunner) -> Result<Vec<DiskSummary>> {
    let cmd = ToolCommand::query("lsblk").args(["-J", "-d", "-b", "-o", "NAME,PATH,SIZE,TYPE,MODEL"]);
    let output = runner.run(&cmd)?;
    let parsed: LsblkOutput = serde_json::from_str(&output.stdout)?;

    let mut disks = Vec::new();
    for dev in parsed.blockdevices {
        if dev.kind.as_deref() != Some("disk") {
            continue;
        }
        let Some(path) = dev.device_path() else {
            continue;
        };
        disks.push(DiskSummary {
            size: dev.size_bytes()?,
            model: non_empty(&dev.model).map(|m| m.trim().to_string()),
            path,
        });
    }
    Ok(disks)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeRunner;
    use crate::units::GIB;

    const SDA_TREE: &str = r#"{"blockdevices":[{"name":"sda","path":"/dev/sda","size":343597383680,"type":"disk",
        "parttypename":null,"fstype":null,"uuid":null,"mountpoint":null,"pkname":null,
        "children":[
          {"name":"sda1","path":"/dev/sda1","size":536870912,"type":"part","parttypename":"EFI System",
           "fstype":"vfat","uuid":"AB12-CD34","mountpoint":null,"pkname":"sda"},
          {"name":"sda2","path":"/dev/sda2","size":107374182400,"type":"part","parttypename":"Microsoft basic data",
           "fstype":"ntfs","uuid":"0011","mountpoint":null,"pkname":"sda"},
          {"name":"sda3","path":"/dev/sda3","size":53687091200,"type":"part","parttypename":"Linux filesystem",
           "fstype":"ext4","uuid":"u-3","mountpoint":null,"pkname":"sda"}
        ]}]}"#;

    const SDA_TABLE: &str = r#"{"partitiontable":{"label":"gpt","device":"/dev/sda","unit":"sectors",
        "sectorsize":512,"partitions":[
          {"node":"/dev/sda1","start":2048,"size":1048576,"type":"C12A7328-F81F-11D2-BA4B-00A0C93EC93B"},
          {"node":"/dev/sda2","start":1050624,"size":209715200},
          {"node":"/dev/sda3","start":210765824,"size":104857600}
        ]}}"#;

    #[test]
    fn test_inspect_filters_foreign_partitions() {
        let runner = FakeRunner::new()
            .respond("lsblk -J -b -o", SDA_TREE)
            .respond("sfdisk -J /dev/sda", SDA_TABLE);

        let disk = inspect_disk(&runner, Path::new("/dev/sda")).unwrap();
        assert_eq!(disk.total_size(), 320 * GIB);
        assert_eq!(disk.partition_count(), 3);

        let paths: Vec<_> = disk.partitions().iter().filter_map(|p| p.path()).collect();
        assert_eq!(paths, vec![Path::new("/dev/sda1"), Path::new("/dev/sda3")]);
        assert_eq!(disk.partitions()[1].index(), 3);

        let end = (210_765_824u64 + 104_857_600) * 512;
        assert_eq!(disk.free_space(), 320 * GIB - end);
        assert!(disk.existing_efi().is_some());
    }

    #[test]
    fn test_free_space_is_exact_bytes() {
        // 2 TB disk; lsblk -h would round this to "1.8T"
        let tree = r#"{"blockdevices":[{"name":"sdb","path":"/dev/sdb","size":"2000398934016","type":"disk",
            "children":[
              {"name":"sdb1","path":"/dev/sdb1","size":1949999988736,"type":"part","parttypename":"Linux filesystem","pkname":"sdb"}
            ]}]}"#;
        let table = r#"{"partitiontable":{"label":"gpt","sectorsize":512,"partitions":[
            {"node":"/dev/sdb1","start":2048,"size":3808591702}]}}"#;
        let runner = FakeRunner::new()
            .respond("lsblk -J -b -o", tree)
            .respond("sfdisk -J /dev/sdb", table);

        let disk = inspect_disk(&runner, Path::new("/dev/sdb")).unwrap();
        assert_eq!(disk.total_size(), 2_000_398_934_016);
        assert_eq!(disk.free_space(), 50_398_934_016);
        assert!(runner.commands()[0].starts_with("lsblk -J -b -o"));
    }

    #[test]
    fn test_next_partition_number_skips_gaps() {
        let tree = r#"{"blockdevices":[{"name":"sda","path":"/dev/sda","size":343597383680,"type":"disk",
            "children":[
              {"name":"sda1","path":"/dev/sda1","size":536870912,"type":"part","parttypename":"EFI System","fstype":"vfat","pkname":"sda"},
              {"name":"sda2","path":"/dev/sda2","size":16777216,"type":"part","parttypename":"Microsoft reserved","pkname":"sda"},
              {"name":"sda4","path":"/dev/sda4","size":107374182400,"type":"part","parttypename":"Microsoft basic data","pkname":"sda"}
            ]}]}"#;
        let table = r#"{"partitiontable":{"label":"gpt","sectorsize":512,"partitions":[
            {"node":"/dev/sda1","start":2048,"size":1048576},
            {"node":"/dev/sda2","start":1050624,"size":32768},
            {"node":"/dev/sda4","start":1083392,"size":209715200}]}}"#;
        let runner = FakeRunner::new()
            .respond("lsblk -J -b -o", tree)
            .respond("sfdisk -J /dev/sda", table);

        let disk = inspect_disk(&runner, Path::new("/dev/sda")).unwrap();
        assert_eq!(disk.partition_count(), 3);
        assert_eq!(disk.next_partition_number(), 5);
    }

    #[test]
    fn test_empty_disk_free_space_is_total() {
        let tree = r#"{"blockdevices":[{"name":"vdb","path":"/dev/vdb","size":21474836480,"type":"disk"}]}"#;
        let runner = FakeRunner::new().respond("lsblk -J -b -o", tree);

        let disk = inspect_disk(&runner, Path::new("/dev/vdb")).unwrap();
        assert_eq!(disk.free_space(), 20 * GIB);
        assert!(disk.partitions().is_empty());
        assert!(!runner.commands().iter().any(|c| c.starts_with("sfdisk")));
    }

    #[test]
    fn test_unparseable_size_is_fatal() {
        let tree = r#"{"blockdevices":[{"name":"vdb","path":"/dev/vdb","size":"lots","type":"disk"}]}"#;
        let runner = FakeRunner::new().respond("lsblk -J -b -o", tree);
        let err = inspect_disk(&runner, Path::new("/dev/vdb")).unwrap_err();
        assert!(matches!(err, LayoutError::InvalidSize(_)));
    }

    #[test]
    fn test_empty_lsblk_output_is_fatal() {
        let runner = FakeRunner::new().respond("lsblk -J -b -o", "");
        let err = inspect_disk(&runner, Path::new("/dev/sdz")).unwrap_err();
        assert!(matches!(err, LayoutError::Inspection(_)));
    }

    #[test]
    fn test_partition_naming() {
        assert_eq!(partition_path(Path::new("/dev/sda"), 2), PathBuf::from("/dev/sda2"));
        assert_eq!(
            partition_path(Path::new("/dev/nvme0n1"), 3),
            PathBuf::from("/dev/nvme0n1p3")
        );
        assert_eq!(partition_number(Path::new("/dev/sda"), Path::new("/dev/sda12")), Some(12));
        assert_eq!(
            partition_number(Path::new("/dev/nvme0n1"), Path::new("/dev/nvme0n1p2")),
            Some(2)
        );
        assert_eq!(partition_number(Path::new("/dev/sda"), Path::new("/dev/sdb1")), None);
    }

    #[test]
    fn test_list_disks_skips_non_disks() {
        let json = r#"{"blockdevices":[
            {"name":"sda","path":"/dev/sda","size":343597383680,"type":"disk","model":"Samsung SSD  "},
            {"name":"sr0","path":"/dev/sr0","size":1073741824,"type":"rom","model":"DVD"},
            {"name":"loop0","path":"/dev/loop0","size":838860800,"type":"loop","model":null}
        ]}"#;
        let runner = FakeRunner::new().respond("lsblk -J -d", json);
        let disks = list_disks(&runner).unwrap();
        assert_eq!(disks.len(), 1);
        assert_eq!(disks[0].model.as_deref(), Some("Samsung SSD"));
        assert_eq!(disks[0].to_string(), "/dev/sda (320 GiB) Samsung SSD");
    }

    #[test]
    fn test_end_of_last_partition() {
        let table: SfdiskOutput = serde_json::from_str(SDA_TABLE).unwrap();
        assert_eq!(
            table.partitiontable.end_of_last_partition(),
            (210_765_824 + 104_857_600) * 512
        );
    }
}
