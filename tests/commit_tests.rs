//! Commit engine integration tests
//!
//! Drive `Storage` end to end against a recording runner and a static
//! prober, with a temporary directory as the target root.

use std::fs;
use std::path::Path;

use storplan::fstab::FstabStore;
use storplan::lock::LockMode;
use storplan::model::{LvExtents, Volume};
use storplan::{
    codes, to_code, CommandRunner, CommitStage, Container, DryRunRunner, EngineConfig, ExtentPool, FsType,
    ModelSnapshot, PvInfo, RecordingRunner, StaticProber, Storage, StorageError, UsedBy, UsedByKind,
};
use tempfile::TempDir;

const PE: u64 = 4096;

fn config(root: &Path) -> EngineConfig {
    EngineConfig {
        device_wait_retries: 1,
        device_wait_interval_ms: 1,
        defer_signals: false,
        ..EngineConfig::for_root(root)
    }
}

fn open(root: &Path, runner: Box<dyn CommandRunner>, prober: StaticProber) -> Storage {
    Storage::new(config(root), runner, Box::new(prober)).expect("engine") // test: known-good input
}

fn tools(storage: &Storage) -> Vec<String> {
    storage.runner().history().iter().map(|c| c[0].clone()).collect()
}

fn position(tools: &[String], tool: &str) -> usize {
    tools.iter().position(|t| t == tool).unwrap_or(usize::MAX)
}

/// Committed volume group `data` on `/dev/sdb1` holding `x` and an ext4 `z`.
fn volume_group_model() -> Vec<Container> {
    let mut disk = Container::disk("/dev/sdb", 100 << 20, "gpt");
    disk.insert_volume(
        Volume::partition("/dev/sdb", 1, 1024, 101 << 10).with_used_by(UsedBy::new(UsedByKind::Lvm, "/dev/data")),
    )
    .expect("pv"); // test: known-good input

    let pool = ExtentPool::with_members(
        PE,
        vec![PvInfo {
            device: "/dev/sdb1".into(),
            num_pe: 25,
            free_pe: 15,
        }],
    );
    let mut vg = Container::lvm("data", pool);
    for (name, fs) in [("x", FsType::Unknown), ("z", FsType::Ext4)] {
        let mut extents = LvExtents::new(1, 0);
        extents.pe_map.insert("/dev/sdb1".into(), 5);
        extents.le = 5;
        vg.insert_volume(Volume::logical("/dev/data", name, PE, extents).with_fs(fs))
            .expect("lv"); // test: known-good input
    }
    vec![disk, vg]
}

fn load(storage: &mut Storage, containers: Vec<Container>) {
    storage.load_snapshot(ModelSnapshot { containers });
}

// ============================================================================
// Ordering
// ============================================================================

#[test]
fn test_remove_create_mount_run_in_stage_order() {
    let root = TempDir::new().expect("tempdir"); // test: known-good input
    let mut s = open(root.path(), Box::new(RecordingRunner::new()), StaticProber::new());
    load(&mut s, volume_group_model());

    s.change_mount("/dev/data/z", "/srv").expect("mount"); // test: known-good input
    s.create_lv("data", "y", 8 * PE, 1, 0).expect("create"); // test: known-good input
    s.remove_volume("/dev/data/x").expect("remove"); // test: known-good input
    s.check_consistency().expect("consistent"); // test: known-good input

    let stages: Vec<CommitStage> = s.plan().actions.iter().map(|a| a.stage).collect();
    assert_eq!(stages, vec![CommitStage::Decrease, CommitStage::Increase, CommitStage::Mount]);

    let report = s.commit().expect("commit"); // test: known-good input
    assert_eq!(report.executed.len(), 3);
    assert!(report.executed[0].starts_with("[DECREASE] Remove"));
    assert!(report.executed[0].contains("/dev/data/x"));
    assert!(report.executed[1].contains("/dev/data/y"));
    assert!(report.executed[2].starts_with("[MOUNT]"));
    assert_eq!(report.deferred_signal, None);

    let tools = tools(&s);
    assert!(position(&tools, "lvremove") < position(&tools, "lvcreate"));
    assert!(position(&tools, "lvcreate") < position(&tools, "mount"));
    assert!(s.subsystems().lvm);

    assert!(s.volume("/dev/data/x").is_none());
    assert!(s.plan().is_empty());
    s.check_consistency().expect("consistent after commit"); // test: known-good input

    let fstab = FstabStore::load(s.config().fstab_file()).expect("fstab"); // test: known-good input
    assert_eq!(fstab.find("/srv", None).map(|e| e.device.as_str()), Some("/dev/data/z"));
}

// ============================================================================
// Failures
// ============================================================================

#[test]
fn test_tool_failure_reports_global_index() {
    let root = TempDir::new().expect("tempdir"); // test: known-good input
    let runner = RecordingRunner::new().fail_on(&["mkfs.ext4", "-F", "/dev/sda2"], 1, "device is busy");
    let mut s = open(root.path(), Box::new(runner), StaticProber::new());
    s.add_container(Container::disk("/dev/sda", 100 << 20, "gpt"));

    for mount in ["/a", "/b"] {
        let dev = s.create_partition("/dev/sda", 1 << 20).expect("part"); // test: known-good input
        s.change_format(&dev, true, FsType::Ext4).expect("format"); // test: known-good input
        s.change_mount(&dev, mount).expect("mount"); // test: known-good input
    }

    let result = s.commit();
    assert_eq!(to_code(&result), codes::EXTERNAL_TOOL_FAILED);
    match result {
        Err(StorageError::CommitFailed { index, ref description, .. }) => {
            assert_eq!(index, 3);
            assert!(description.contains("/dev/sda2"));
        }
        other => panic!("unexpected result {other:?}"),
    }

    // work before the failure stays committed
    let first = s.volume("/dev/sda1").expect("sda1"); // test: known-good input
    assert!(!first.created && !first.format);
    assert_eq!(first.detected_fs, FsType::Ext4);
    let second = s.volume("/dev/sda2").expect("sda2"); // test: known-good input
    assert!(second.format);
    assert!(tools(&s).iter().all(|t| t != "mount"));
}

#[test]
fn test_declined_confirmation_runs_nothing() {
    let root = TempDir::new().expect("tempdir"); // test: known-good input
    let mut s = open(root.path(), Box::new(RecordingRunner::new()), StaticProber::new());
    load(&mut s, volume_group_model());
    s.remove_volume("/dev/data/x").expect("remove"); // test: known-good input
    s.set_confirm_callback(|action| !action.destructive);

    let result = s.commit();
    assert_eq!(to_code(&result), codes::COMMIT_ABORTED);
    assert!(s.runner().history().is_empty());
    assert!(s.plan().len() == 1);
}

#[test]
fn test_pool_member_cannot_be_removed() {
    let root = TempDir::new().expect("tempdir"); // test: known-good input
    let mut s = open(root.path(), Box::new(RecordingRunner::new()), StaticProber::new());
    load(&mut s, volume_group_model());

    let result = s.remove_volume("/dev/sdb1");
    assert_eq!(to_code(&result), codes::ALREADY_IN_USE);
    assert!(s.plan().is_empty());
}

#[test]
fn test_read_only_container_refuses_changes() {
    let root = TempDir::new().expect("tempdir"); // test: known-good input
    let mut s = open(root.path(), Box::new(RecordingRunner::new()), StaticProber::new());
    let mut model = volume_group_model();
    model[1].read_only = true;
    load(&mut s, model);

    assert!(matches!(s.remove_volume("/dev/data/x"), Err(StorageError::ReadOnly(_))));
    assert!(matches!(s.create_lv("data", "y", PE, 1, 0), Err(StorageError::ReadOnly(_))));
}

// ============================================================================
// fstab and dry-run
// ============================================================================

#[test]
fn test_commit_keeps_foreign_fstab_lines() {
    let root = TempDir::new().expect("tempdir"); // test: known-good input
    let prober = StaticProber::new().with_uuid("/dev/sda1", "0f3c-aa21");
    let mut s = open(root.path(), Box::new(RecordingRunner::new()), prober);
    let fstab_path = s.config().fstab_file();
    fs::create_dir_all(fstab_path.parent().expect("etc")).expect("mkdir"); // test: known-good input
    fs::write(&fstab_path, "# static table\n/dev/sdz1 / ext4 defaults 0 1\n").expect("write"); // test: known-good input

    s.add_container(Container::disk("/dev/sda", 100 << 20, "gpt"));
    let dev = s.create_partition("/dev/sda", 4 << 20).expect("part"); // test: known-good input
    s.change_format(&dev, true, FsType::Ext4).expect("format"); // test: known-good input
    s.change_mount(&dev, "/data").expect("mount"); // test: known-good input
    s.commit().expect("commit"); // test: known-good input

    let text = fs::read_to_string(&fstab_path).expect("read"); // test: known-good input
    assert!(text.starts_with("# static table\n"));
    let fstab = FstabStore::load(&fstab_path).expect("fstab"); // test: known-good input
    assert_eq!(fstab.entries().count(), 2);
    assert_eq!(fstab.find("/data", None).map(|e| e.device.as_str()), Some("UUID=0f3c-aa21"));
    assert!(fstab.find("/", Some("/dev/sdz1")).is_some());
}

#[test]
fn test_dry_run_records_commands_without_writing() {
    let root = TempDir::new().expect("tempdir"); // test: known-good input
    let mut s = open(root.path(), Box::new(DryRunRunner::new()), StaticProber::new().with_missing("/dev/sda1"));
    s.add_container(Container::disk("/dev/sda", 100 << 20, "gpt"));
    let dev = s.create_partition("/dev/sda", 4 << 20).expect("part"); // test: known-good input
    s.change_format(&dev, true, FsType::Xfs).expect("format"); // test: known-good input
    s.change_mount(&dev, "/srv").expect("mount"); // test: known-good input

    let report = s.commit().expect("dry-run commit"); // test: known-good input
    assert_eq!(report.executed.len(), 3);
    assert!(s.runner().is_dry_run());
    let tools = tools(&s);
    assert!(tools.contains(&"parted".to_string()));
    assert!(tools.contains(&"mkfs.xfs".to_string()));
    assert!(!s.config().fstab_file().exists());
}

// ============================================================================
// Locking and snapshots
// ============================================================================

#[test]
fn test_second_writer_is_locked_out() {
    let root = TempDir::new().expect("tempdir"); // test: known-good input
    let locked = EngineConfig {
        lock_path: Some(root.path().join("run/storplan.lock")),
        ..config(root.path())
    };
    let first = Storage::new(locked.clone(), Box::new(RecordingRunner::new()), Box::new(StaticProber::new()))
        .expect("first"); // test: known-good input
    assert_eq!(first.lock_mode(), Some(LockMode::Exclusive));

    let second = Storage::new(locked.clone(), Box::new(RecordingRunner::new()), Box::new(StaticProber::new()));
    assert_eq!(to_code(&second), codes::LOCKED);
    drop(first);

    let reader = EngineConfig {
        read_only: true,
        ..locked
    };
    let a = Storage::new(reader.clone(), Box::new(RecordingRunner::new()), Box::new(StaticProber::new()))
        .expect("reader a"); // test: known-good input
    let b = Storage::new(reader, Box::new(RecordingRunner::new()), Box::new(StaticProber::new()))
        .expect("reader b"); // test: known-good input
    assert_eq!(a.lock_mode(), Some(LockMode::Shared));
    assert_eq!(b.lock_mode(), Some(LockMode::Shared));
}

#[test]
fn test_snapshot_reloads_to_the_same_plan() {
    let root = TempDir::new().expect("tempdir"); // test: known-good input
    let mut s = open(root.path(), Box::new(RecordingRunner::new()), StaticProber::new());
    load(&mut s, volume_group_model());
    s.remove_volume("/dev/data/x").expect("remove"); // test: known-good input
    s.create_lv("data", "y", 3 * PE, 1, 0).expect("create"); // test: known-good input

    let json = serde_json::to_string(&s.snapshot()).expect("serialize"); // test: known-good input
    let snapshot: ModelSnapshot = serde_json::from_str(&json).expect("parse"); // test: known-good input

    let mut reloaded = open(root.path(), Box::new(RecordingRunner::new()), StaticProber::new());
    reloaded.load_snapshot(snapshot);
    assert_eq!(reloaded.plan().summary(), s.plan().summary());
    reloaded.check_consistency().expect("consistent"); // test: known-good input
}
