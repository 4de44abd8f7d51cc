//! Firmware environment detection
//!
//! The planners need exactly one fact from the live environment: whether the
//! machine booted through UEFI or legacy BIOS. It is detected, never chosen.
//!
//! # Design
//!
//! - **Read-only**: a single `exists()` check on sysfs, no shelling out
//! - **Unambiguous**: the kernel exposes `/sys/firmware/efi` only on UEFI boots

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;

/// Canonical sysfs directory present only on UEFI boots.
pub const EFI_SYSFS_DIR: &str = "/sys/firmware/efi";

/// Detected firmware mode of the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirmwareMode {
    /// UEFI firmware: GPT, EFI system partition
    Uefi,
    /// Legacy BIOS firmware: DOS label, bootable BOOT partition
    Bios,
}

impl FirmwareMode {
    /// Returns true if the system booted in UEFI mode.
    pub fn is_uefi(self) -> bool {
        matches!(self, Self::Uefi)
    }

    /// Returns true if the system booted in legacy BIOS mode.
    pub fn is_bios(self) -> bool {
        matches!(self, Self::Bios)
    }
}

impl fmt::Display for FirmwareMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Uefi => write!(f, "UEFI"),
            Self::Bios => write!(f, "BIOS"),
        }
    }
}

/// Detect firmware mode by checking for the EFI sysfs directory.
pub fn detect_firmware_mode() -> FirmwareMode {
    detect_firmware_mode_at(Path::new(EFI_SYSFS_DIR))
}

/// Detect firmware mode against an arbitrary sysfs path.
pub fn detect_firmware_mode_at(efi_dir: &Path) -> FirmwareMode {
    if efi_dir.exists() {
        tracing::info!("UEFI firmware detected ({} exists)", efi_dir.display());
        FirmwareMode::Uefi
    } else {
        tracing::info!("BIOS firmware detected ({} not found)", efi_dir.display());
        FirmwareMode::Bios
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_uefi_when_dir_exists() {
        let dir = tempfile::tempdir().unwrap();
        assert_eq!(detect_firmware_mode_at(dir.path()), FirmwareMode::Uefi);
    }

    #[test]
    fn test_detect_bios_when_dir_missing() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("efi");
        assert_eq!(detect_firmware_mode_at(&missing), FirmwareMode::Bios);
    }

    #[test]
    fn test_display_and_serde() {
        assert_eq!(FirmwareMode::Uefi.to_string(), "UEFI");
        assert_eq!(serde_json::to_string(&FirmwareMode::Bios).unwrap(), "\"bios\"");
        assert!(FirmwareMode::Bios.is_bios());
        assert!(!FirmwareMode::Bios.is_uefi());
    }
}
