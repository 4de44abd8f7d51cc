//! Pre-flight sanity checks for the runtime environment
//!
//! Before any disk is touched:
//! - Required disk tools are present
//! - Running with root privileges (EUID 0)
//!
//! Missing optional tools (btrfs, xfs, cfdisk) only produce a warning; the
//! layouts that need them fail later with a tool error.

use crate::process_guard::IsolatedSpawn;
use std::process::Command;
use tracing::{debug, info, warn};

/// Result of environment verification
#[derive(Debug)]
pub struct SanityCheckResult {
    pub missing_binaries: Vec<String>,
    pub missing_optional: Vec<String>,
    pub is_root: bool,
}

impl SanityCheckResult {
    /// Returns true if all hard requirements are met
    pub fn is_ok(&self) -> bool {
        self.missing_binaries.is_empty() && self.is_root
    }
}

/// Required runtime binaries for partitioning
const REQUIRED_BINARIES: &[&str] = &[
    "lsblk",      // Block device tree (util-linux)
    "sfdisk",     // Scripted partition tables (util-linux)
    "findmnt",    // Mount state (util-linux)
    "mount",      // util-linux
    "cryptsetup", // LUKS containers
    "mkfs.ext4",  // e2fsprogs
    "mkfs.fat",   // EFI system partition (dosfstools)
];

/// Optional binaries (warn if missing but don't fail)
const OPTIONAL_BINARIES: &[&str] = &[
    "mkfs.btrfs", // Copy-on-write root
    "btrfs",      // Subvolume layout
    "mkfs.xfs",   // XFS root/home
    "cfdisk",     // Manual partitioning
];

/// Check if a binary is available in PATH
fn binary_exists(name: &str) -> bool {
    Command::new("which")
        .arg(name)
        .isolate()
        .output()
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn is_running_as_root() -> bool {
    nix::unistd::geteuid().is_root()
}

fn missing_from(binaries: &[&str], exists: impl Fn(&str) -> bool) -> Vec<String> {
    binaries
        .iter()
        .copied()
        .filter(|b| !exists(b))
        .map(str::to_string)
        .collect()
}

/// Perform all sanity checks and return the result
pub fn verify_environment() -> SanityCheckResult {
    let result = SanityCheckResult {
        missing_binaries: missing_from(REQUIRED_BINARIES, binary_exists),
        missing_optional: missing_from(OPTIONAL_BINARIES, binary_exists),
        is_root: is_running_as_root(),
    };
    for binary in &result.missing_optional {
        warn!("Optional binary not found: {} ({})", binary, get_package_for_binary(binary));
    }
    result
}

/// Human-readable failure report, one problem per paragraph
pub fn failure_report(result: &SanityCheckResult) -> String {
    let mut lines = vec!["Pre-flight check failed".to_string(), String::new()];

    if !result.is_root {
        lines.push("ERROR: Root privileges required".to_string());
        lines.push("   Partitioning, formatting and mounting need root. Run with sudo.".to_string());
        lines.push(String::new());
    }

    if !result.missing_binaries.is_empty() {
        lines.push("ERROR: Missing required binaries".to_string());
        for binary in &result.missing_binaries {
            lines.push(format!(
                "   - {} (install: pacman -S {})",
                binary,
                get_package_for_binary(binary)
            ));
        }
        let mut packages: Vec<&str> = result
            .missing_binaries
            .iter()
            .map(|b| get_package_for_binary(b))
            .collect();
        packages.dedup();
        lines.push(String::new());
        lines.push(format!("   Solution: pacman -S {}", packages.join(" ")));
    }

    lines.join("\n")
}

/// Map binary names to their Arch Linux package names
fn get_package_for_binary(binary: &str) -> &'static str {
    match binary {
        "lsblk" | "sfdisk" | "findmnt" | "mount" | "cfdisk" => "util-linux",
        "cryptsetup" => "cryptsetup",
        "mkfs.ext4" => "e2fsprogs",
        "mkfs.fat" => "dosfstools",
        "mkfs.btrfs" | "btrfs" => "btrfs-progs",
        "mkfs.xfs" => "xfsprogs",
        _ => "unknown",
    }
}

/// Skip root check (for development/testing)
/// Set ARCHDISK_SKIP_ROOT_CHECK=1 to skip
pub fn should_skip_root_check() -> bool {
    std::env::var("ARCHDISK_SKIP_ROOT_CHECK")
        .map(|v| v == "1" || v.to_lowercase() == "true")
        .unwrap_or(false)
}

/// Run pre-flight checks. `Err` carries the report to print before exiting.
pub fn run_preflight_checks(skip_root: bool) -> Result<(), String> {
    debug!("Running pre-flight sanity checks (skip_root={})...", skip_root);

    let mut result = verify_environment();

    if skip_root || should_skip_root_check() {
        warn!("Root check skipped");
        result.is_root = true;
    }

    if !result.is_ok() {
        return Err(failure_report(&result));
    }

    info!("Pre-flight checks passed");
    Ok(())
}
