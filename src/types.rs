//! Type-safe layout vocabulary
//!
//! Closed enums for partition roles, filesystem formats and planner policies.
//! Every role/format decision in the crate is an exhaustive `match` over these,
//! never a string comparison.

use serde::{Deserialize, Serialize};
use strum::{Display, EnumIter, EnumString};

/// Functional purpose assigned to a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    #[strum(serialize = "EFI")]
    Efi,
    #[strum(serialize = "ROOT")]
    Root,
    #[strum(serialize = "BOOT")]
    Boot,
    #[strum(serialize = "HOME")]
    Home,
    #[strum(serialize = "SWAP")]
    Swap,
    #[strum(serialize = "NOT_USED")]
    NotUsed,
    #[default]
    #[strum(serialize = "OTHER")]
    Other,
}

impl Role {
    /// Mount point implied by the role. OTHER is user-chosen, SWAP/NOT_USED have none.
    pub fn default_mount_point(self) -> Option<&'static str> {
        match self {
            Self::Efi => Some("/boot/efi"),
            Self::Root => Some("/"),
            Self::Boot => Some("/boot"),
            Self::Home => Some("/home"),
            Self::Swap | Self::NotUsed | Self::Other => None,
        }
    }

    /// Only ROOT, HOME and OTHER can live inside a LUKS container.
    pub fn is_encryptable(self) -> bool {
        matches!(self, Self::Root | Self::Home | Self::Other)
    }

    /// Mapper name pinned by the role, if any.
    pub fn pinned_block_name(self) -> Option<&'static str> {
        match self {
            Self::Root => Some("root"),
            Self::Home => Some("home"),
            _ => None,
        }
    }

    /// Whether a partition with this role is mounted under the target root.
    pub fn is_mountable(self) -> bool {
        !matches!(self, Self::Swap | Self::NotUsed)
    }

    /// Format types a user may pick for this role.
    pub fn allowed_formats(self) -> &'static [FormatType] {
        match self {
            Self::Efi => &[FormatType::Vfat],
            Self::Boot => &[FormatType::Ext4, FormatType::Vfat],
            Self::Root | Self::Home | Self::Other => {
                &[FormatType::Ext4, FormatType::Btrfs, FormatType::Xfs]
            }
            Self::Swap | Self::NotUsed => &[],
        }
    }
}

/// Filesystem created on (or reused from) a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum FormatType {
    #[strum(serialize = "vfat")]
    Vfat,
    #[default]
    #[strum(serialize = "ext4")]
    Ext4,
    #[strum(serialize = "btrfs")]
    Btrfs,
    #[strum(serialize = "xfs")]
    Xfs,
}

impl FormatType {
    /// Map a filesystem type reported by lsblk/blkid to a format type.
    pub fn from_fs_type(fs_type: &str) -> Option<Self> {
        match fs_type.to_ascii_lowercase().as_str() {
            "vfat" | "fat" | "fat32" => Some(Self::Vfat),
            "ext4" => Some(Self::Ext4),
            "btrfs" => Some(Self::Btrfs),
            "xfs" => Some(Self::Xfs),
            _ => None,
        }
    }

    /// Filesystem creation command and its force flag.
    pub fn mkfs_command(self) -> (&'static str, &'static [&'static str]) {
        match self {
            Self::Vfat => ("mkfs.fat", &["-F32"]),
            Self::Ext4 => ("mkfs.ext4", &["-F"]),
            Self::Btrfs => ("mkfs.btrfs", &["-f"]),
            Self::Xfs => ("mkfs.xfs", &["-f"]),
        }
    }

    /// Copy-on-write filesystem with subvolume layout.
    pub fn is_cow(self) -> bool {
        matches!(self, Self::Btrfs)
    }

    /// Root on this filesystem gets a dedicated BOOT partition from the automatic planner.
    pub fn requires_separate_boot(self) -> bool {
        matches!(self, Self::Btrfs | Self::Xfs)
    }

    /// Extra mount options applied when mounting.
    pub fn mount_options(self) -> Option<&'static str> {
        match self {
            Self::Btrfs => Some("compress=zstd"),
            Self::Vfat | Self::Ext4 | Self::Xfs => None,
        }
    }
}

/// How swap is provided on the installed system
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum SwapPolicy {
    #[strum(serialize = "partition")]
    Partition,
    #[default]
    #[strum(serialize = "file")]
    File,
    #[strum(serialize = "none")]
    None,
}

/// Which planner builds the partitioning plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[derive(Display, EnumString, EnumIter)]
#[serde(rename_all = "lowercase")]
pub enum PlanningMode {
    #[default]
    #[strum(serialize = "automatic")]
    Automatic,
    #[strum(serialize = "manual")]
    Manual,
}

impl PlanningMode {
    /// The other planning mode, used when the user abandons a planning pass.
    pub fn switched(self) -> Self {
        match self {
            Self::Automatic => Self::Manual,
            Self::Manual => Self::Automatic,
        }
    }
}
