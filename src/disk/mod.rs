//! Disk and partition model
//!
//! - `inspector`: read-only snapshots of the block-device layer
//! - `partition`: the Partition Record and its per-record operations
//! - `btrfs`: subvolume layout for a copy-on-write root

pub mod btrfs;
pub mod inspector;
pub mod partition;

pub use inspector::{inspect_disk, list_disks, Disk, DiskSummary};
pub use partition::{BlockName, Passphrase, PartitionInfo, PartitionRecord};
