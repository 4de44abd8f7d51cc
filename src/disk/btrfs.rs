//! Copy-on-write root layout
//!
//! When ROOT is btrfs, the root filesystem is split into a fixed catalog of
//! subvolumes under a top-level `@`, with a first snapshot
//! (`@/.snapshots/1/snapshot`) set as the default subvolume. Mounting the root
//! device without `subvol=` therefore lands in that snapshot, and the catalog
//! subvolumes are mounted on top of it.
//!
//! Catalog entries whose mount point is already served by a dedicated
//! partition in the plan (a separate `/home`, for instance) are skipped.

use crate::command_runner::{CommandRunner, ToolCommand};
use crate::error::Result;
use chrono::{DateTime, Utc};
use std::path::Path;
use tracing::info;

/// One subvolume of the catalog.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Subvolume {
    /// Path below `@`
    pub name: &'static str,
    /// Mount point in the installed system
    pub mount_point: &'static str,
}

pub const SNAPSHOTS: &str = ".snapshots";

pub const CATALOG: &[Subvolume] = &[
    Subvolume { name: "var", mount_point: "/var" },
    Subvolume { name: "opt", mount_point: "/opt" },
    Subvolume { name: "srv", mount_point: "/srv" },
    Subvolume { name: "tmp", mount_point: "/tmp" },
    Subvolume { name: "root", mount_point: "/root" },
    Subvolume { name: "usr/local", mount_point: "/usr/local" },
    Subvolume { name: "home", mount_point: "/home" },
    Subvolume { name: "swap", mount_point: "/swap" },
    Subvolume { name: SNAPSHOTS, mount_point: "/.snapshots" },
];

/// Catalog entries not superseded by a dedicated partition.
pub fn active_subvolumes<'a>(
    excluded_mount_points: &'a [String],
) -> impl Iterator<Item = &'static Subvolume> + 'a {
    CATALOG
        .iter()
        .filter(move |sv| !excluded_mount_points.iter().any(|mp| mp == sv.mount_point))
}

/// Snapper-compatible metadata for the first snapshot.
pub fn snapshot_info_xml(date: DateTime<Utc>) -> String {
    format!(
        "<?xml version=\"1.0\"?>\n\
         <snapshot>\n  \
         <type>single</type>\n  \
         <num>1</num>\n  \
         <date>{}</date>\n  \
         <description>first root filesystem</description>\n\
         </snapshot>\n",
        date.format("%Y-%m-%d %H:%M:%S")
    )
}

fn under(target: &Path, relative: &str) -> String {
    target.join(relative).display().to_string()
}

/// Create the subvolume layout on a freshly formatted root, then unmount it.
pub fn create_layout(
    runner: &dyn CommandRunner,
    device: &Path,
    target: &Path,
    excluded_mount_points: &[String],
) -> Result<()> {
    info!("creating btrfs subvolume layout on {}", device.display());
    let device_arg = device.display().to_string();

    runner.run(&ToolCommand::new("mount").args([
        "--mkdir".to_string(),
        device_arg,
        target.display().to_string(),
    ]))?;

    runner.run(&ToolCommand::new("btrfs").args(["subvolume", "create"]).arg(under(target, "@")))?;

    let mut with_snapshots = false;
    for sv in active_subvolumes(excluded_mount_points) {
        if let Some((parent, _)) = sv.name.rsplit_once('/') {
            runner.run(&ToolCommand::new("mkdir").arg("-p").arg(under(target, &format!("@/{}", parent))))?;
        }
        runner.run(
            &ToolCommand::new("btrfs")
                .args(["subvolume", "create"])
                .arg(under(target, &format!("@/{}", sv.name))),
        )?;
        with_snapshots |= sv.name == SNAPSHOTS;
    }

    let default_subvolume = if with_snapshots {
        let first = format!("@/{}/1", SNAPSHOTS);
        runner.run(&ToolCommand::new("mkdir").arg("-p").arg(under(target, &first)))?;
        runner.run(
            &ToolCommand::new("tee")
                .arg(under(target, &format!("{}/info.xml", first)))
                .stdin(snapshot_info_xml(Utc::now())),
        )?;
        let snapshot = format!("{}/snapshot", first);
        runner.run(&ToolCommand::new("btrfs").args(["subvolume", "create"]).arg(under(target, &snapshot)))?;
        snapshot
    } else {
        "@".to_string()
    };

    runner.run(
        &ToolCommand::new("btrfs")
            .args(["subvolume", "set-default"])
            .arg(under(target, &default_subvolume)),
    )?;

    runner.run(&ToolCommand::new("umount").arg(target.display().to_string()))?;
    Ok(())
}

/// Mount every active catalog subvolume under the already-mounted root.
pub fn mount_subvolumes(
    runner: &dyn CommandRunner,
    device: &Path,
    target: &Path,
    excluded_mount_points: &[String],
) -> Result<()> {
    for sv in active_subvolumes(excluded_mount_points) {
        let options = format!("subvol=@/{},compress=zstd", sv.name);
        runner.run(
            &ToolCommand::new("mount")
                .arg("--mkdir")
                .args(["-o".to_string(), options])
                .arg(device.display().to_string())
                .arg(under(target, sv.mount_point.trim_start_matches('/'))),
        )?;
    }
    Ok(())
}
