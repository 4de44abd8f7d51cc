//! Partition Record
//!
//! The unit of planned or discovered partition state. A record is created by a
//! planner, classified through prompts, then driven through format, mount and
//! unmount by the Partitioning Plan.
//!
//! # Invariants
//!
//! Fields are private; every mutation goes through a setter that keeps them:
//!
//! - SWAP and NOT_USED records never carry a mount point
//! - an encrypted record always carries a valid `BlockName`
//! - only ROOT, HOME and OTHER can be encrypted
//! - EFI is always VFAT
//!
//! Deserialization goes through the same checks (`try_from`), so a hand-edited
//! session file cannot smuggle in an invalid record.

use crate::command_runner::{CommandRunner, ToolCommand};
use crate::disk::inspector::{self, query_device};
use crate::error::{LayoutError, Result};
use crate::prompt::Prompter;
use crate::types::{FormatType, Role};
use crate::units::format_iec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{info, warn};

const MAPPER_DIR: &str = "/dev/mapper";
const BLOCK_NAME_MAX_LEN: usize = 32;

// ============================================================================
// Value types
// ============================================================================

/// Name of a decrypted LUKS mapping (`/dev/mapper/<name>`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BlockName(String);

impl BlockName {
    /// Validate a lowercase identifier: `[a-z][a-z0-9_-]*`, at most 32 chars.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let mut chars = name.chars();
        let valid = name.len() <= BLOCK_NAME_MAX_LEN
            && chars.next().is_some_and(|c| c.is_ascii_lowercase())
            && chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_');
        if valid {
            Ok(Self(name))
        } else {
            Err(LayoutError::InvalidBlockName(name))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn mapper_path(&self) -> PathBuf {
        Path::new(MAPPER_DIR).join(&self.0)
    }
}

impl FromStr for BlockName {
    type Err = LayoutError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl fmt::Display for BlockName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// LUKS passphrase. Lives in memory only and never appears in Debug output.
#[derive(Clone, PartialEq, Eq)]
pub struct Passphrase(String);

impl Passphrase {
    pub fn new(secret: impl Into<String>) -> Result<Self> {
        let secret = secret.into();
        if secret.is_empty() {
            return Err(LayoutError::validation("passphrase must not be empty"));
        }
        Ok(Self(secret))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Passphrase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Passphrase(<redacted>)")
    }
}

/// Physical attributes read from the block-device layer by `refresh`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionInfo {
    pub size: u64,
    pub parent_disk: Option<String>,
    pub fs_type: Option<String>,
    pub uuid: Option<String>,
    pub part_type: Option<String>,
}

// ============================================================================
// Partition Record
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RecordRepr", into = "RecordRepr")]
pub struct PartitionRecord {
    index: u32,
    path: Option<PathBuf>,
    role: Role,
    mount_point: Option<String>,
    format_type: FormatType,
    should_format: bool,
    encryption: Option<BlockName>,
    planned_size: Option<u64>,
    info: Option<PartitionInfo>,
}

/// Persisted field set of a record.
#[derive(Serialize, Deserialize)]
struct RecordRepr {
    index: u32,
    #[serde(default)]
    path: Option<PathBuf>,
    role: Role,
    #[serde(default)]
    mount_point: Option<String>,
    format_type: FormatType,
    should_format: bool,
    #[serde(default)]
    encrypted: bool,
    #[serde(default)]
    block_name: Option<String>,
}

impl From<PartitionRecord> for RecordRepr {
    fn from(record: PartitionRecord) -> Self {
        Self {
            index: record.index,
            path: record.path,
            role: record.role,
            mount_point: record.mount_point,
            format_type: record.format_type,
            should_format: record.should_format,
            encrypted: record.encryption.is_some(),
            block_name: record.encryption.map(|b| b.0),
        }
    }
}

impl TryFrom<RecordRepr> for PartitionRecord {
    type Error = LayoutError;

    fn try_from(repr: RecordRepr) -> Result<Self> {
        let mount_point = repr.mount_point.filter(|mp| !mp.is_empty());
        if !repr.role.is_mountable() && mount_point.is_some() {
            return Err(LayoutError::validation(format!(
                "partition #{}: {} cannot have a mount point",
                repr.index, repr.role
            )));
        }

        let encryption = match (repr.encrypted, repr.block_name.filter(|b| !b.is_empty())) {
            (true, Some(name)) => Some(BlockName::new(name)?),
            (true, None) => {
                return Err(LayoutError::validation(format!(
                    "partition #{}: encrypted without a block name",
                    repr.index
                )));
            }
            (false, _) => None,
        };

        let mut record = Self {
            index: repr.index,
            path: repr.path,
            role: repr.role,
            mount_point,
            format_type: repr.format_type,
            should_format: repr.should_format,
            encryption: None,
            planned_size: None,
            info: None,
        };
        record.check_format(repr.format_type)?;
        record.set_encryption(encryption)?;
        Ok(record)
    }
}

impl PartitionRecord {
    /// A record synthesized by the automatic planner before the table exists.
    pub fn planned(index: u32, role: Role, format_type: FormatType, size: Option<u64>) -> Self {
        Self {
            index,
            path: None,
            role,
            mount_point: role.default_mount_point().map(str::to_string),
            format_type: if role == Role::Efi { FormatType::Vfat } else { format_type },
            should_format: role.is_mountable(),
            encryption: None,
            planned_size: size,
            info: None,
        }
    }

    /// A record for an existing partition, unclassified (OTHER, no mount point).
    pub fn discovered(index: u32, path: impl Into<PathBuf>, info: PartitionInfo) -> Self {
        let format_type = info
            .fs_type
            .as_deref()
            .and_then(FormatType::from_fs_type)
            .unwrap_or_default();
        Self {
            index,
            path: Some(path.into()),
            role: Role::Other,
            mount_point: None,
            format_type,
            should_format: false,
            encryption: None,
            planned_size: None,
            info: Some(info),
        }
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn mount_point(&self) -> Option<&str> {
        self.mount_point.as_deref()
    }

    pub fn format_type(&self) -> FormatType {
        self.format_type
    }

    pub fn should_format(&self) -> bool {
        self.should_format
    }

    pub fn is_encrypted(&self) -> bool {
        self.encryption.is_some()
    }

    pub fn block_name(&self) -> Option<&BlockName> {
        self.encryption.as_ref()
    }

    /// Size chosen by the automatic planner, if any.
    pub fn planned_size(&self) -> Option<u64> {
        self.planned_size
    }

    /// Cached attributes from the last `refresh` (or inspection).
    pub fn info(&self) -> Option<&PartitionInfo> {
        self.info.as_ref()
    }

    // ------------------------------------------------------------------------
    // Mutation
    // ------------------------------------------------------------------------

    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = Some(path.into());
    }

    /// Assign a role, resetting the mount point to the role default.
    pub fn set_role(&mut self, role: Role) {
        self.role = role;
        self.mount_point = role.default_mount_point().map(str::to_string);
        if !role.is_encryptable() {
            self.encryption = None;
        }
        if role == Role::Efi {
            self.format_type = FormatType::Vfat;
        }
        if !role.is_mountable() {
            self.should_format = false;
        }
    }

    /// User-chosen mount point. Must be absolute; rejected for SWAP/NOT_USED.
    pub fn set_mount_point(&mut self, mount_point: &str) -> Result<()> {
        if !self.role.is_mountable() {
            return Err(LayoutError::validation(format!(
                "{} partitions are not mounted",
                self.role
            )));
        }
        let mount_point = mount_point.trim();
        if !mount_point.starts_with('/') {
            return Err(LayoutError::validation(format!(
                "mount point '{}' must be an absolute path",
                mount_point
            )));
        }
        self.mount_point = Some(mount_point.to_string());
        Ok(())
    }

    pub fn set_format_type(&mut self, format_type: FormatType) -> Result<()> {
        self.check_format(format_type)?;
        self.format_type = format_type;
        Ok(())
    }

    fn check_format(&self, format_type: FormatType) -> Result<()> {
        let allowed = self.role.allowed_formats();
        if allowed.is_empty() || allowed.contains(&format_type) {
            Ok(())
        } else {
            Err(LayoutError::UnsupportedFormat(format!(
                "{} on a {} partition",
                format_type, self.role
            )))
        }
    }

    pub fn set_should_format(&mut self, should_format: bool) {
        self.should_format = should_format && self.role.is_mountable();
    }

    pub fn set_encryption(&mut self, encryption: Option<BlockName>) -> Result<()> {
        if encryption.is_some() && !self.role.is_encryptable() {
            return Err(LayoutError::validation(format!(
                "{} partitions cannot be encrypted",
                self.role
            )));
        }
        self.encryption = encryption;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------------

    /// Raw partition device, or `Unresolved` if the planner never mapped it.
    pub fn device(&self) -> Result<&Path> {
        self.path
            .as_deref()
            .ok_or(LayoutError::Unresolved { index: self.index })
    }

    /// Device used for format and mount: the mapper when encrypted.
    pub fn real_path(&self) -> Result<PathBuf> {
        match &self.encryption {
            Some(name) => Ok(name.mapper_path()),
            None => self.device().map(Path::to_path_buf),
        }
    }

    /// Absolute directory this record mounts at under `target_root`.
    pub fn target_dir(&self, target_root: &Path) -> Option<PathBuf> {
        let mount_point = self.mount_point.as_deref()?;
        let relative = mount_point.trim_start_matches('/');
        if relative.is_empty() {
            Some(target_root.to_path_buf())
        } else {
            Some(target_root.join(relative))
        }
    }

    /// Populate the cached `PartitionInfo` with one lsblk call.
    pub fn refresh(&mut self, runner: &dyn CommandRunner) -> Result<&PartitionInfo> {
        let node = query_device(runner, self.device()?)?;
        Ok(self.info.insert(node.info()?))
    }

    /// Mounted at its target under `target_root`. Unresolved records are not mounted.
    pub fn is_mounted(&self, runner: &dyn CommandRunner, target_root: &Path) -> Result<bool> {
        let (Ok(device), Some(dir)) = (self.real_path(), self.target_dir(target_root)) else {
            return Ok(false);
        };
        inspector::is_mounted_at(runner, &device, &dir)
    }

    // ------------------------------------------------------------------------
    // Classification prompts
    // ------------------------------------------------------------------------

    fn describe(&self) -> String {
        match &self.path {
            Some(path) => path.display().to_string(),
            None => format!("partition #{}", self.index),
        }
    }

    fn prompt_format_type(&mut self, prompter: &dyn Prompter) -> Result<()> {
        let allowed = self.role.allowed_formats();
        let chosen = match allowed {
            [] => return Ok(()),
            [only] => *only,
            _ => {
                let items: Vec<String> = allowed.iter().map(ToString::to_string).collect();
                let default = allowed
                    .iter()
                    .position(|f| *f == self.format_type)
                    .unwrap_or(0);
                let question = format!("Filesystem for {} ({})", self.describe(), self.role);
                allowed[prompter.select(&question, &items, default)?]
            }
        };
        self.format_type = chosen;
        Ok(())
    }

    /// Decide whether (and as what) this partition gets a fresh filesystem.
    pub fn ask_for_format(&mut self, prompter: &dyn Prompter) -> Result<()> {
        match self.role {
            Role::Swap | Role::NotUsed => {
                self.should_format = false;
            }
            Role::Root => {
                self.should_format = true;
                self.prompt_format_type(prompter)?;
            }
            Role::Efi | Role::Boot | Role::Home | Role::Other if self.is_encrypted() => {
                self.should_format = true;
                self.prompt_format_type(prompter)?;
            }
            Role::Efi | Role::Boot | Role::Home | Role::Other => {
                let question = format!("Format {} ({})?", self.describe(), self.role);
                self.should_format = prompter.confirm(&question, true)?;
                if self.should_format {
                    self.prompt_format_type(prompter)?;
                } else if let Some(detected) = self
                    .info
                    .as_ref()
                    .and_then(|i| i.fs_type.as_deref())
                    .and_then(FormatType::from_fs_type)
                    .filter(|f| self.role.allowed_formats().contains(f))
                {
                    self.format_type = detected;
                }
            }
        }
        Ok(())
    }

    /// Mapper name used for an existing container: pinned, else the device name.
    fn default_block_name(&self) -> Result<BlockName> {
        if let Some(pinned) = self.role.pinned_block_name() {
            return BlockName::new(pinned);
        }
        let device = self.device()?;
        let stem = device
            .file_name()
            .map(|n| n.to_string_lossy().to_ascii_lowercase())
            .unwrap_or_default();
        BlockName::new(stem).or_else(|_| BlockName::new(format!("crypt{}", self.index)))
    }

    fn prompt_block_name(&self, prompter: &dyn Prompter) -> Result<BlockName> {
        if let Some(pinned) = self.role.pinned_block_name() {
            return BlockName::new(pinned);
        }
        loop {
            let answer = prompter.input(
                &format!("Name for the decrypted {} device", self.describe()),
                None,
            )?;
            match BlockName::new(answer.trim()) {
                Ok(name) => return Ok(name),
                Err(e) => prompter.notify(&e.to_string())?,
            }
        }
    }

    /// Decide whether this partition is (or becomes) a LUKS container.
    pub fn ask_for_encryption(
        &mut self,
        prompter: &dyn Prompter,
        runner: &dyn CommandRunner,
    ) -> Result<()> {
        if !self.role.is_encryptable() {
            self.encryption = None;
            return Ok(());
        }

        if !self.should_format {
            self.encryption = if inspector::is_luks(runner, self.device()?)? {
                info!("{} is an existing LUKS container", self.describe());
                Some(self.default_block_name()?)
            } else {
                None
            };
            return Ok(());
        }

        let question = format!("Encrypt {} ({})?", self.describe(), self.role);
        self.encryption = if prompter.confirm(&question, false)? {
            Some(self.prompt_block_name(prompter)?)
        } else {
            None
        };
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Format / mount / unmount
    // ------------------------------------------------------------------------

    /// What formatting this record needs, decided by one exhaustive match.
    pub fn format_action(&self) -> Result<FormatAction> {
        Ok(match (self.role, &self.encryption, self.should_format) {
            (Role::NotUsed, _, _) => FormatAction::Skip,
            (Role::Swap, _, _) => FormatAction::Swap {
                device: self.device()?.to_path_buf(),
            },
            (_, Some(name), should_format) => FormatAction::Encrypted {
                device: self.device()?.to_path_buf(),
                name: name.clone(),
                luks_format: should_format,
                filesystem: should_format.then_some(self.format_type),
            },
            (_, None, should_format) => FormatAction::Plain {
                device: self.device()?.to_path_buf(),
                filesystem: should_format.then_some(self.format_type),
            },
        })
    }

    /// Run the commands of `format_action`, in order, stopping at the first failure.
    pub fn format_partition(
        &self,
        runner: &dyn CommandRunner,
        passphrase: Option<&Passphrase>,
    ) -> Result<()> {
        let commands = self.format_action()?.commands(passphrase)?;
        if commands.is_empty() {
            info!("{}: nothing to format", self.describe());
        }
        for cmd in &commands {
            runner.run(cmd)?;
        }
        Ok(())
    }

    /// Mount the real path at its target under `target_root`.
    pub fn mount(&self, runner: &dyn CommandRunner, target_root: &Path) -> Result<()> {
        let Some(dir) = self.target_dir(target_root) else {
            return Ok(());
        };
        let mut cmd = ToolCommand::new("mount").arg("--mkdir");
        if let Some(options) = self.format_type.mount_options() {
            cmd = cmd.args(["-o", options]);
        }
        let cmd = cmd.args([
            self.real_path()?.display().to_string(),
            dir.display().to_string(),
        ]);
        runner.run(&cmd)?;
        Ok(())
    }

    /// Unmount, then close the LUKS mapping. Failures are logged and reported as `false`.
    pub fn umount(&self, runner: &dyn CommandRunner, target_root: &Path) -> bool {
        match self.try_umount(runner, target_root) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to unmount {}: {}", self.describe(), e);
                false
            }
        }
    }

    /// `umount` that hands the tool error back instead of logging it.
    pub fn try_umount(&self, runner: &dyn CommandRunner, target_root: &Path) -> Result<()> {
        if let Some(dir) = self.target_dir(target_root) {
            let mut cmd = ToolCommand::new("umount");
            if self.role == Role::Root && self.format_type.is_cow() {
                cmd = cmd.arg("-R");
            }
            runner.run(&cmd.arg(dir.display().to_string()))?;
        }
        self.try_close_mapper(runner)
    }

    /// Close the LUKS mapping, if any. Failures are logged and reported as `false`.
    pub fn close_mapper(&self, runner: &dyn CommandRunner) -> bool {
        match self.try_close_mapper(runner) {
            Ok(()) => true,
            Err(e) => {
                warn!("failed to close the mapping of {}: {}", self.describe(), e);
                false
            }
        }
    }

    fn try_close_mapper(&self, runner: &dyn CommandRunner) -> Result<()> {
        if let Some(name) = &self.encryption {
            runner.run(&ToolCommand::new("cryptsetup").args(["close", name.as_str()]))?;
        }
        Ok(())
    }
}

impl fmt::Display for PartitionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{:<2} {:<16} {:<8}", self.index, self.describe(), self.role.to_string())?;
        write!(f, " {:<12}", self.mount_point.as_deref().unwrap_or("-"))?;
        if self.role.is_mountable() {
            let action = if self.should_format { "format" } else { "keep" };
            write!(f, " {:<6} {:<6}", self.format_type.to_string(), action)?;
        }
        if let Some(name) = &self.encryption {
            write!(f, " luks:{}", name)?;
        }
        if let Some(size) = self.planned_size.or(self.info.as_ref().map(|i| i.size)) {
            write!(f, " {}", format_iec(size))?;
        }
        Ok(())
    }
}

// ============================================================================
// Format actions
// ============================================================================

/// The formatting work for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FormatAction {
    /// NOT_USED: left untouched
    Skip,
    /// SWAP: mkswap + swapon
    Swap { device: PathBuf },
    /// Plain filesystem, created only when `filesystem` is set
    Plain {
        device: PathBuf,
        filesystem: Option<FormatType>,
    },
    /// LUKS container, optionally freshly formatted, always opened
    Encrypted {
        device: PathBuf,
        name: BlockName,
        luks_format: bool,
        filesystem: Option<FormatType>,
    },
}

fn mkfs(filesystem: FormatType, device: &Path) -> ToolCommand {
    let (program, flags) = filesystem.mkfs_command();
    ToolCommand::new(program)
        .args(flags.iter().copied())
        .arg(device.display().to_string())
}

impl FormatAction {
    /// Tool invocations for this action. Encrypted actions need the passphrase.
    pub fn commands(&self, passphrase: Option<&Passphrase>) -> Result<Vec<ToolCommand>> {
        let commands = match self {
            Self::Skip => Vec::new(),
            Self::Swap { device } => {
                let device = device.display().to_string();
                vec![
                    ToolCommand::new("mkswap").arg(device.clone()),
                    ToolCommand::new("swapon").arg(device),
                ]
            }
            Self::Plain { device, filesystem } => {
                filesystem.iter().map(|fs| mkfs(*fs, device)).collect()
            }
            Self::Encrypted {
                device,
                name,
                luks_format,
                filesystem,
            } => {
                let secret = passphrase.ok_or(LayoutError::PassphraseMissing)?;
                let device_arg = device.display().to_string();
                let mut commands = Vec::new();
                if *luks_format {
                    commands.push(
                        ToolCommand::new("cryptsetup")
                            .args(["-q", "--type", "luks2", "luksFormat"])
                            .arg(device_arg.clone())
                            .arg("--key-file=-")
                            .stdin(secret.expose()),
                    );
                }
                commands.push(
                    ToolCommand::new("cryptsetup")
                        .arg("open")
                        .arg(device_arg)
                        .arg(name.as_str())
                        .arg("--key-file=-")
                        .stdin(secret.expose()),
                );
                if let Some(fs) = filesystem {
                    commands.push(mkfs(*fs, &name.mapper_path()));
                }
                commands
            }
        };
        Ok(commands)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeRunner, ScriptedPrompter};

    fn root_on(path: &str) -> PartitionRecord {
        let mut record = PartitionRecord::planned(2, Role::Root, FormatType::Ext4, None);
        record.set_path(path);
        record
    }

    #[test]
    fn test_block_name_validation() {
        assert!(BlockName::new("root").is_ok());
        assert!(BlockName::new("data_2-x").is_ok());
        for bad in ["", "Root", "2data", "my data", "a/b", &"x".repeat(33)] {
            assert!(
                matches!(BlockName::new(bad), Err(LayoutError::InvalidBlockName(_))),
                "{bad}"
            );
        }
        assert_eq!(
            BlockName::new("home").unwrap().mapper_path(),
            PathBuf::from("/dev/mapper/home")
        );
    }

    #[test]
    fn test_passphrase_is_redacted() {
        let secret = Passphrase::new("hunter2").unwrap();
        assert!(!format!("{:?}", secret).contains("hunter2"));
        assert!(Passphrase::new("").is_err());
    }

    #[test]
    fn test_set_role_resets_mount_point() {
        let mut record = PartitionRecord::discovered(3, "/dev/sda3", PartitionInfo::default());
        record.set_role(Role::Home);
        assert_eq!(record.mount_point(), Some("/home"));

        record.set_role(Role::Swap);
        assert_eq!(record.mount_point(), None);
        assert!(record.set_mount_point("/data").is_err());

        record.set_role(Role::Other);
        record.set_mount_point("/srv/data").unwrap();
        assert_eq!(record.mount_point(), Some("/srv/data"));
        assert!(record.set_mount_point("relative").is_err());
    }

    #[test]
    fn test_encryption_only_for_encryptable_roles() {
        let mut record = PartitionRecord::planned(1, Role::Efi, FormatType::Vfat, None);
        let err = record.set_encryption(Some(BlockName::new("efi").unwrap()));
        assert!(err.is_err());

        let mut record = root_on("/dev/sda2");
        record.set_encryption(Some(BlockName::new("root").unwrap())).unwrap();
        record.set_role(Role::Boot);
        assert!(!record.is_encrypted());
    }

    #[test]
    fn test_real_path() {
        let mut record = root_on("/dev/sda2");
        assert_eq!(record.real_path().unwrap(), PathBuf::from("/dev/sda2"));

        record.set_encryption(Some(BlockName::new("root").unwrap())).unwrap();
        assert_eq!(record.real_path().unwrap(), PathBuf::from("/dev/mapper/root"));

        let unresolved = PartitionRecord::planned(4, Role::Home, FormatType::Ext4, None);
        assert!(matches!(
            unresolved.real_path(),
            Err(LayoutError::Unresolved { index: 4 })
        ));
    }

    #[test]
    fn test_target_dir() {
        let root = root_on("/dev/sda2");
        assert_eq!(root.target_dir(Path::new("/mnt")), Some(PathBuf::from("/mnt")));
        let efi = PartitionRecord::planned(1, Role::Efi, FormatType::Vfat, None);
        assert_eq!(
            efi.target_dir(Path::new("/mnt")),
            Some(PathBuf::from("/mnt/boot/efi"))
        );
        let swap = PartitionRecord::planned(2, Role::Swap, FormatType::Ext4, None);
        assert_eq!(swap.target_dir(Path::new("/mnt")), None);
    }

    #[test]
    fn test_format_action_matrix() {
        let mut swap = PartitionRecord::planned(2, Role::Swap, FormatType::Ext4, None);
        swap.set_path("/dev/sda2");
        let cmds: Vec<String> = swap
            .format_action()
            .unwrap()
            .commands(None)
            .unwrap()
            .iter()
            .map(ToolCommand::command_line)
            .collect();
        assert_eq!(cmds, vec!["mkswap /dev/sda2", "swapon /dev/sda2"]);

        let mut unused = PartitionRecord::planned(5, Role::NotUsed, FormatType::Ext4, None);
        unused.set_path("/dev/sda5");
        assert_eq!(unused.format_action().unwrap(), FormatAction::Skip);

        let mut reuse = PartitionRecord::discovered(4, "/dev/sda4", PartitionInfo::default());
        reuse.set_role(Role::Home);
        reuse.set_should_format(false);
        assert!(reuse.format_action().unwrap().commands(None).unwrap().is_empty());
    }

    #[test]
    fn test_encrypted_format_commands() {
        let mut root = root_on("/dev/sda3");
        root.set_format_type(FormatType::Btrfs).unwrap();
        root.set_encryption(Some(BlockName::new("root").unwrap())).unwrap();

        let action = root.format_action().unwrap();
        assert!(matches!(action.commands(None), Err(LayoutError::PassphraseMissing)));

        let secret = Passphrase::new("s3cret").unwrap();
        let cmds = action.commands(Some(&secret)).unwrap();
        let lines: Vec<String> = cmds.iter().map(ToolCommand::command_line).collect();
        assert_eq!(
            lines,
            vec![
                "cryptsetup -q --type luks2 luksFormat /dev/sda3 --key-file=-",
                "cryptsetup open /dev/sda3 root --key-file=-",
                "mkfs.btrfs -f /dev/mapper/root",
            ]
        );
        assert_eq!(cmds[0].stdin_data(), Some("s3cret"));
        assert!(lines.iter().all(|l| !l.contains("s3cret")));
    }

    #[test]
    fn test_refresh_caches_exact_attributes() {
        let node = r#"{"blockdevices":[{"name":"sda2","path":"/dev/sda2","size":64424509440,"type":"part",
            "parttypename":"Linux filesystem","fstype":"ext4","uuid":"0f1e","mountpoint":null,"pkname":"sda"}]}"#;
        let runner = FakeRunner::new().respond("lsblk -J -b -o", node);
        let mut root = root_on("/dev/sda2");
        assert!(root.info().is_none());

        let info = root.refresh(&runner).unwrap().clone();
        assert_eq!(info.size, 64_424_509_440);
        assert_eq!(info.parent_disk.as_deref(), Some("sda"));
        assert_eq!(info.fs_type.as_deref(), Some("ext4"));
        assert_eq!(root.info(), Some(&info));
        assert_eq!(runner.commands().len(), 1);
    }

    #[test]
    fn test_existing_container_is_only_opened() {
        let mut home = PartitionRecord::discovered(4, "/dev/sda4", PartitionInfo::default());
        home.set_role(Role::Home);
        home.set_encryption(Some(BlockName::new("home").unwrap())).unwrap();
        let secret = Passphrase::new("pw").unwrap();
        let lines: Vec<String> = home
            .format_action()
            .unwrap()
            .commands(Some(&secret))
            .unwrap()
            .iter()
            .map(ToolCommand::command_line)
            .collect();
        assert_eq!(lines, vec!["cryptsetup open /dev/sda4 home --key-file=-"]);
    }

    #[test]
    fn test_mount_adds_compression_for_btrfs() {
        let runner = FakeRunner::new();
        let mut root = root_on("/dev/sda2");
        root.set_format_type(FormatType::Btrfs).unwrap();
        root.mount(&runner, Path::new("/mnt")).unwrap();
        assert_eq!(
            runner.commands(),
            vec!["mount --mkdir -o compress=zstd /dev/sda2 /mnt"]
        );
        assert!(root.is_mounted(&runner, Path::new("/mnt")).unwrap());
    }

    #[test]
    fn test_umount_failure_is_not_fatal() {
        let runner = FakeRunner::new().fail("umount /mnt/home", 32, "target is busy");
        let mut home = PartitionRecord::planned(3, Role::Home, FormatType::Ext4, None);
        home.set_path("/dev/sda3");
        assert!(!home.umount(&runner, Path::new("/mnt")));
    }

    #[test]
    fn test_umount_closes_mapper() {
        let runner = FakeRunner::new();
        let mut root = root_on("/dev/sda2");
        root.set_encryption(Some(BlockName::new("root").unwrap())).unwrap();
        let secret = Passphrase::new("pw").unwrap();
        root.format_partition(&runner, Some(&secret)).unwrap();
        root.mount(&runner, Path::new("/mnt")).unwrap();
        assert!(runner.mapper_is_open("root"));

        assert!(root.umount(&runner, Path::new("/mnt")));
        assert!(!runner.mapper_is_open("root"));
        assert!(runner.commands().contains(&"cryptsetup close root".to_string()));
    }

    #[test]
    fn test_ask_for_format_root_always_formats() {
        let prompter = ScriptedPrompter::new().select(1);
        let mut root = PartitionRecord::discovered(2, "/dev/sda2", PartitionInfo::default());
        root.set_role(Role::Root);
        root.ask_for_format(&prompter).unwrap();
        assert!(root.should_format());
        assert_eq!(root.format_type(), FormatType::Btrfs);
    }

    #[test]
    fn test_ask_for_format_efi_pinned_to_vfat() {
        let prompter = ScriptedPrompter::new().confirm(true);
        let mut efi = PartitionRecord::discovered(1, "/dev/sda1", PartitionInfo::default());
        efi.set_role(Role::Efi);
        efi.ask_for_format(&prompter).unwrap();
        assert!(efi.should_format());
        assert_eq!(efi.format_type(), FormatType::Vfat);
        assert!(prompter.is_exhausted());
    }

    #[test]
    fn test_ask_for_format_reuse_keeps_detected_fs() {
        let prompter = ScriptedPrompter::new().confirm(false);
        let info = PartitionInfo {
            fs_type: Some("xfs".into()),
            ..PartitionInfo::default()
        };
        let mut home = PartitionRecord::discovered(4, "/dev/sda4", info);
        home.set_role(Role::Home);
        home.ask_for_format(&prompter).unwrap();
        assert!(!home.should_format());
        assert_eq!(home.format_type(), FormatType::Xfs);
    }

    #[test]
    fn test_ask_for_encryption_probes_existing_container() {
        let runner = FakeRunner::new().with_luks("/dev/sda4");
        let prompter = ScriptedPrompter::new();
        let mut data = PartitionRecord::discovered(4, "/dev/sda4", PartitionInfo::default());
        data.set_role(Role::Other);
        data.set_should_format(false);
        data.ask_for_encryption(&prompter, &runner).unwrap();
        assert_eq!(data.block_name().map(BlockName::as_str), Some("sda4"));

        let mut plain = PartitionRecord::discovered(5, "/dev/sda5", PartitionInfo::default());
        plain.set_role(Role::Home);
        plain.ask_for_encryption(&prompter, &runner).unwrap();
        assert!(!plain.is_encrypted());
        assert!(prompter.is_exhausted());
    }

    #[test]
    fn test_ask_for_encryption_reprompts_invalid_name() {
        let runner = FakeRunner::new();
        let prompter = ScriptedPrompter::new()
            .confirm(true)
            .input("Bad Name")
            .input("vault");
        let mut data = PartitionRecord::discovered(6, "/dev/sda6", PartitionInfo::default());
        data.set_role(Role::Other);
        data.set_should_format(true);
        data.ask_for_encryption(&prompter, &runner).unwrap();
        assert_eq!(data.block_name().map(BlockName::as_str), Some("vault"));
        assert_eq!(prompter.notifications().len(), 1);
    }

    #[test]
    fn test_serialized_field_set() {
        let mut root = root_on("/dev/sda2");
        root.set_encryption(Some(BlockName::new("root").unwrap())).unwrap();
        let value = serde_json::to_value(&root).unwrap();
        let mut keys: Vec<&str> = value.as_object().unwrap().keys().map(String::as_str).collect();
        keys.sort_unstable();
        assert_eq!(
            keys,
            vec![
                "block_name",
                "encrypted",
                "format_type",
                "index",
                "mount_point",
                "path",
                "role",
                "should_format"
            ]
        );
        assert_eq!(value["role"], "ROOT");
        assert_eq!(value["block_name"], "root");
    }

    #[test]
    fn test_deserialize_rejects_broken_invariants() {
        let swap_with_mount = r#"{"index":2,"role":"SWAP","mount_point":"/swap",
            "format_type":"ext4","should_format":false}"#;
        assert!(serde_json::from_str::<PartitionRecord>(swap_with_mount).is_err());

        let encrypted_without_name = r#"{"index":3,"role":"ROOT","mount_point":"/",
            "format_type":"ext4","should_format":true,"encrypted":true}"#;
        assert!(serde_json::from_str::<PartitionRecord>(encrypted_without_name).is_err());

        let efi_ext4 = r#"{"index":1,"role":"EFI","mount_point":"/boot/efi",
            "format_type":"ext4","should_format":true}"#;
        assert!(serde_json::from_str::<PartitionRecord>(efi_ext4).is_err());
    }
}
