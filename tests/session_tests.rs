//! Session file tests: save, reload, validate and replay a plan.

use archdisk::engine::RetryPolicy;
use archdisk::testing::FakeRunner;
use archdisk::{
    BlockName, FirmwareMode, FormatType, InstallSession, LayoutError, Passphrase, PartitionRecord,
    PartitioningPlan, PlanningMode, PreLaunch, Role,
};
use tempfile::TempDir;

fn record(index: u32, role: Role, format: FormatType) -> PartitionRecord {
    let mut r = PartitionRecord::planned(index, role, format, None);
    r.set_path(format!("/dev/vda{}", index));
    r
}

fn encrypted_home_plan() -> PartitioningPlan {
    let mut plan = PartitioningPlan::new("/mnt");
    plan.set_main_disk(Some("/dev/vda".into()));
    plan.add_partition(record(1, Role::Efi, FormatType::Vfat));
    plan.add_partition(record(2, Role::Swap, FormatType::Ext4));
    plan.add_partition(record(3, Role::Root, FormatType::Xfs));
    let mut home = record(4, Role::Home, FormatType::Ext4);
    home.set_encryption(Some(BlockName::new("home").unwrap())).unwrap();
    plan.add_partition(home);
    plan
}

#[test]
fn test_session_file_layout() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.json");

    let mut plan = encrypted_home_plan();
    plan.set_passphrase(Some(Passphrase::new("hunter22").unwrap()));
    let session = InstallSession::new(PreLaunch::new(FirmwareMode::Uefi, PlanningMode::Manual), plan);
    session.save_to_file(&path).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    assert!(!text.contains("hunter22"));

    let value: serde_json::Value = serde_json::from_str(&text).unwrap();
    assert_eq!(value["prelaunch"]["firmware"], "uefi");
    assert_eq!(value["prelaunch"]["mode"], "manual");

    let home = &value["partitioning"]["partitions"][3];
    let mut keys: Vec<&str> = home.as_object().unwrap().keys().map(String::as_str).collect();
    keys.sort_unstable();
    assert_eq!(
        keys,
        vec!["block_name", "encrypted", "format_type", "index", "mount_point", "path", "role", "should_format"]
    );
    assert_eq!(home["role"], "HOME");
    assert_eq!(home["encrypted"], true);
    assert_eq!(home["block_name"], "home");
    assert_eq!(value["partitioning"]["partitions"][1]["mount_point"], serde_json::Value::Null);
}

#[test]
fn test_replay_saved_session() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.json");
    InstallSession::new(
        PreLaunch::new(FirmwareMode::Uefi, PlanningMode::Manual),
        encrypted_home_plan(),
    )
    .save_to_file(&path)
    .unwrap();

    let session = InstallSession::load_from_file(&path).unwrap();
    session.validate().unwrap();

    let mut plan = session.partitioning;
    assert!(plan.needs_passphrase());
    plan.set_retry_policy(RetryPolicy::immediate(5));

    let runner = FakeRunner::new();
    // Passphrase is not persisted: replay without one fails before touching anything
    let err = plan.format_and_mount_partitions(&runner).unwrap_err();
    assert!(matches!(err, LayoutError::PassphraseMissing));
    assert!(runner.commands().is_empty());
    assert!(runner.active_swaps().is_empty());

    plan.set_passphrase(Some(Passphrase::new("hunter22").unwrap()));
    let runner = FakeRunner::new();
    plan.format_and_mount_partitions(&runner).unwrap();
    assert!(plan.xfs_in_use());
    assert_eq!(runner.active_swaps(), vec!["/dev/vda2"]);
    assert_eq!(runner.mounted_targets(), vec!["/mnt", "/mnt/home", "/mnt/boot/efi"]);

    plan.umount_partitions(&runner).unwrap();
    assert!(runner.mounted_targets().is_empty());
    assert!(runner.active_swaps().is_empty());
    assert!(!runner.mapper_is_open("home"));
}

#[test]
fn test_validate_reports_broken_plan() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("session.json");

    let mut plan = encrypted_home_plan();
    plan.partitions_mut()[2].set_role(Role::Other);
    plan.partitions_mut()[2].set_mount_point("/srv").unwrap();
    InstallSession::new(PreLaunch::new(FirmwareMode::Uefi, PlanningMode::Automatic), plan)
        .save_to_file(&path)
        .unwrap();

    let session = InstallSession::load_from_file(&path).unwrap();
    let err = session.validate().unwrap_err();
    assert!(format!("{:#}", err).contains("ROOT"));
}
