use super::*;
use std::fs;
use std::process::Command;
use std::sync::atomic::{AtomicU64, Ordering};

use snapback_core::{
    command_line, snapshot_volume_path, CommandExecutor, CommandFailure, HostLayout, SnapshotSize,
    SnapshotSpec,
};

use crate::metadata::{parse_metadata, render_metadata};

static TEST_LAYOUT_COUNTER: AtomicU64 = AtomicU64::new(0);

fn test_layout() -> HostLayout {
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system time")
        .as_nanos();
    let mut path = std::env::temp_dir();
    let sequence = TEST_LAYOUT_COUNTER.fetch_add(1, Ordering::Relaxed);
    path.push(format!(
        "snapback-lvm-tests-{}-{}-{}",
        std::process::id(),
        nanos,
        sequence
    ));
    let layout = HostLayout::new(path);
    layout.ensure_rollback_dirs().expect("must create dirs");
    layout
}

/// Simulated volume manager keeping one file per logical volume under the
/// test root's `/dev`.
struct FakeLvm {
    layout: HostLayout,
    calls: Vec<Vec<String>>,
    fail_on: Vec<String>,
    deferred_merge: bool,
}

impl FakeLvm {
    fn new(layout: &HostLayout) -> Self {
        Self {
            layout: layout.clone(),
            calls: Vec::new(),
            fail_on: Vec::new(),
            deferred_merge: false,
        }
    }

    fn failing_on(mut self, name: &str) -> Self {
        self.fail_on.push(name.to_string());
        self
    }

    fn add_volume(&self, volume: &str) {
        let device = self.layout.volume_device_path(volume);
        fs::create_dir_all(device.parent().expect("parent")).expect("must create vg dir");
        fs::write(&device, volume).expect("must create device");
    }

    fn has_volume(&self, volume: &str) -> bool {
        self.layout.volume_device_path(volume).exists()
    }

    fn calls_to(&self, program: &str) -> usize {
        self.calls.iter().filter(|call| call[0] == program).count()
    }
}

impl CommandExecutor for FakeLvm {
    fn execute(&mut self, command: &mut Command, context: &str) -> Result<String, CommandFailure> {
        let line = command_line(command);
        self.calls.push(line.clone());

        let target = match line[0].as_str() {
            "lvcreate" => {
                let name_at = line
                    .iter()
                    .position(|arg| arg == "--name")
                    .expect("lvcreate must name the snapshot");
                let origin = line.last().expect("origin");
                snapshot_volume_path(origin, &line[name_at + 1])
            }
            _ => line.last().expect("volume").clone(),
        };
        if self
            .fail_on
            .iter()
            .any(|name| snapback_core::volume_name(&target) == name)
        {
            return Err(CommandFailure::exited(
                command,
                context,
                5,
                "  Volume group \"vg0\" has insufficient free space",
            ));
        }

        match line[0].as_str() {
            "lvcreate" => {
                self.add_volume(&target);
                Ok(format!("  Logical volume \"{target}\" created.\n"))
            }
            "lvremove" => {
                fs::remove_file(self.layout.volume_device_path(&target)).expect("must remove");
                Ok(String::new())
            }
            "lvconvert" => {
                fs::remove_file(self.layout.volume_device_path(&target)).expect("must merge");
                if self.deferred_merge {
                    Ok(format!(
                        "  Merging of snapshot {target} will occur on next activation of vg0/root.\n"
                    ))
                } else {
                    Ok(format!("  Merged: {target}\n"))
                }
            }
            other => panic!("unexpected command {other}"),
        }
    }
}

fn spec(value: &str) -> SnapshotSpec {
    SnapshotSpec::parse(value).expect("valid spec")
}

#[test]
fn equal_triples_are_equal_regardless_of_root_and_state() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let plain = Snapshot::new(&spec("/dev/vg0/root:root_snap"), false);
    let mut root = Snapshot::new(&spec("/dev/vg0/root:root_snap"), true);
    root.create(&mut lvm).expect("must create");

    assert_eq!(plain, root);
    assert_ne!(plain, Snapshot::new(&spec("/dev/vg0/root:root_snap:5G"), false));
    assert_ne!(plain, Snapshot::new(&spec("/dev/vg0/root:other"), false));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn create_with_full_origin_size_issues_extent_form() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let mut snapshot = Snapshot::new(&spec("/dev/vg0/root:root_snap"), false);

    snapshot.create(&mut lvm).expect("must create");
    assert_eq!(
        lvm.calls,
        vec![vec![
            "lvcreate",
            "-l",
            "100%ORIGIN",
            "--snapshot",
            "--name",
            "root_snap",
            "/dev/vg0/root"
        ]]
    );
    assert_eq!(snapshot.path(), "/dev/vg0/root_snap");
    assert!(snapshot.exists());

    snapshot.create(&mut lvm).expect("second create is a no-op");
    assert_eq!(lvm.calls.len(), 1);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn create_with_explicit_size_uses_size_flag() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let mut snapshot = Snapshot::new(&spec("vg0/data:datasnap:5G"), false);

    snapshot.create(&mut lvm).expect("must create");
    assert_eq!(
        lvm.calls[0],
        vec!["lvcreate", "--size", "5G", "--snapshot", "--name", "datasnap", "vg0/data"]
    );
    assert_eq!(snapshot.path(), "vg0/datasnap");

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn failed_create_leaves_snapshot_absent_with_diagnostics() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout).failing_on("root_snap");
    let mut snapshot = Snapshot::new(&spec("/dev/vg0/root:root_snap"), false);

    let err = snapshot.create(&mut lvm).expect_err("must fail");
    assert!(!snapshot.exists());
    match err {
        SnapshotError::Command(failure) => {
            assert_eq!(failure.status, Some(5));
            assert!(failure.stderr.contains("insufficient free space"));
            assert!(failure.context.contains("/dev/vg0/root_snap"));
        }
        other => panic!("unexpected error {other:?}"),
    }

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn remove_twice_never_errors() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let mut snapshot = Snapshot::new(&spec("/dev/vg0/root"), false);
    snapshot.create(&mut lvm).expect("must create");

    snapshot.remove(&mut lvm).expect("must remove");
    snapshot.remove(&mut lvm).expect("second remove is a no-op");
    assert!(!snapshot.exists());
    assert!(!lvm.has_volume("/dev/vg0/snap_root"));
    assert_eq!(lvm.calls_to("lvremove"), 1);
    assert_eq!(
        lvm.calls.last().expect("call"),
        &vec!["lvremove", "-f", "/dev/vg0/snap_root"]
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn merge_requires_present_snapshot() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let mut snapshot = Snapshot::new(&spec("/dev/vg0/home"), false);

    let err = snapshot.merge(&mut lvm).expect_err("must fail");
    assert_eq!(
        err,
        SnapshotError::NotPresent {
            path: "/dev/vg0/snap_home".to_string()
        }
    );
    assert!(lvm.calls.is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn merge_of_root_is_pending_and_others_are_absent() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let mut root = Snapshot::new(&spec("/dev/vg0/root"), true);
    let mut home = Snapshot::new(&spec("/dev/vg0/home"), false);
    root.create(&mut lvm).expect("must create root");
    home.create(&mut lvm).expect("must create home");

    root.merge(&mut lvm).expect("must merge root");
    home.merge(&mut lvm).expect("must merge home");
    assert_eq!(root.state(), SnapshotState::MergePending);
    assert_eq!(home.state(), SnapshotState::Absent);
    assert!(!root.exists());
    assert!(!home.exists());
    assert_eq!(
        lvm.calls.last().expect("call"),
        &vec!["lvconvert", "--merge", "/dev/vg0/snap_home"]
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn merge_reported_as_deferred_is_pending() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    lvm.deferred_merge = true;
    let mut var = Snapshot::new(&spec("/dev/vg0/var"), false);
    var.create(&mut lvm).expect("must create");

    var.merge(&mut lvm).expect("must merge");
    assert_eq!(var.state(), SnapshotState::MergePending);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn metadata_round_trip_preserves_triples() {
    let layout = test_layout();
    let path = layout.snapshot_metadata_path();
    let mut store = SnapshotMetadataStore::open(&path);
    assert!(store.is_empty());

    store
        .save_all([
            SnapshotRecord::new("/dev/vg0/var", "snap_var", SnapshotSize::FullOrigin),
            SnapshotRecord::new(
                "/dev/vg0/root",
                "root_snap",
                SnapshotSize::Explicit("5G".to_string()),
            ),
        ])
        .expect("must save");

    let mut loaded = SnapshotMetadataStore::load(&path);
    let mut expected = store.records().to_vec();
    loaded.sort_by(|a, b| a.section.cmp(&b.section));
    expected.sort_by(|a, b| a.section.cmp(&b.section));
    assert_eq!(loaded, expected);

    let raw = fs::read_to_string(&path).expect("must read");
    assert!(raw.contains("[/dev/vg0/root_snap]\norigin_lv = /dev/vg0/root\nname = root_snap\nsize = 5G\n"));
    assert!(raw.contains("[/dev/vg0/snap_var]\norigin_lv = /dev/vg0/var\nname = snap_var\nsize =\n"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn metadata_save_upserts_and_remove_drops_sections() {
    let layout = test_layout();
    let mut store = SnapshotMetadataStore::open(layout.snapshot_metadata_path());
    store
        .save_all([SnapshotRecord::new("/dev/vg0/root", "s", SnapshotSize::FullOrigin)])
        .expect("must save");
    store
        .save_all([
            SnapshotRecord::new("/dev/vg0/root", "s", SnapshotSize::Explicit("1G".to_string())),
            SnapshotRecord::new("/dev/vg0/home", "h", SnapshotSize::FullOrigin),
        ])
        .expect("must upsert");
    assert_eq!(store.records().len(), 2);
    assert_eq!(
        store.get("/dev/vg0/s").map(|record| record.size.clone()),
        Some(SnapshotSize::Explicit("1G".to_string()))
    );

    store
        .remove_all(Some(&["/dev/vg0/s".to_string()]))
        .expect("must remove subset");
    assert!(store.get("/dev/vg0/s").is_none());
    assert!(store.get("/dev/vg0/h").is_some());

    store.remove_all(None).expect("must clear");
    assert!(SnapshotMetadataStore::load(store.path()).is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn metadata_parse_accepts_legacy_shapes_and_drops_incomplete_sections() {
    let raw = "# written by an older release\n[/dev/vg0/snap_root]\norigin_lv=/dev/vg0/root\nname: snap_root\nsize = \n\n[/dev/vg0/broken]\norigin_lv = /dev/vg0/broken\nname = broken\n";
    let records = parse_metadata(raw).expect("must parse");
    assert_eq!(
        records,
        vec![SnapshotRecord::new(
            "/dev/vg0/root",
            "snap_root",
            SnapshotSize::FullOrigin
        )]
    );
    assert_eq!(parse_metadata(&render_metadata(&records)).expect("must parse"), records);
}

#[test]
fn metadata_load_treats_garbage_as_empty() {
    let layout = test_layout();
    let path = layout.snapshot_metadata_path();
    fs::write(&path, "origin_lv = /dev/vg0/root\n[unterminated\n").expect("must write");
    assert!(SnapshotMetadataStore::load(&path).is_empty());

    fs::write(&path, "[a]\nname = x\n[a]\nname = y\n").expect("must write");
    assert!(SnapshotMetadataStore::load(&path).is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn set_load_purges_records_without_device() {
    let layout = test_layout();
    let lvm = FakeLvm::new(&layout);
    lvm.add_volume("/dev/vg0/snap_root");
    let mut store = SnapshotMetadataStore::open(layout.snapshot_metadata_path());
    store
        .save_all([
            SnapshotRecord::new("/dev/vg0/root", "snap_root", SnapshotSize::FullOrigin),
            SnapshotRecord::new("/dev/vg0/ghost", "ghost_snap", SnapshotSize::FullOrigin),
        ])
        .expect("must save");

    let set = SnapshotSet::load(&layout).expect("must load");
    assert_eq!(set.len(), 1);
    assert!(set.get("/dev/vg0/ghost_snap").is_none());
    assert!(set.get("/dev/vg0/snap_root").expect("loaded").exists());

    let raw = fs::read_to_string(layout.snapshot_metadata_path()).expect("must read");
    assert!(!raw.contains("ghost_snap"));
    assert!(raw.contains("[/dev/vg0/snap_root]"));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn set_rejects_conflicting_duplicate_and_keeps_state() {
    let layout = test_layout();
    let mut set = SnapshotSet::open(&layout, None, &[spec("/dev/vg0/data:datasnap:5G")])
        .expect("must open");

    let err = set
        .register(&spec("/dev/vg0/data:datasnap:10G"), false)
        .expect_err("must conflict");
    assert_eq!(
        err,
        SnapshotError::Conflict {
            path: "/dev/vg0/datasnap".to_string()
        }
    );
    assert!(err.to_string().contains("run clean-snapshots first"));
    assert_eq!(set.len(), 1);
    assert_eq!(
        set.get("/dev/vg0/datasnap").expect("member").size(),
        &SnapshotSize::Explicit("5G".to_string())
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn set_merges_identical_duplicates_and_tracks_root() {
    let layout = test_layout();
    let root = spec("/dev/vg0/root:root_snap");
    let set = SnapshotSet::open(
        &layout,
        Some(&root),
        &[spec("/dev/vg0/root:root_snap"), spec("/dev/vg0/home")],
    )
    .expect("must open");

    assert_eq!(set.len(), 2);
    assert_eq!(
        set.root_snapshot().map(Snapshot::path).as_deref(),
        Some("/dev/vg0/root_snap")
    );
    assert!(!set.get("/dev/vg0/snap_home").expect("member").is_root());
    assert_eq!(
        set.iter().map(Snapshot::path).collect::<Vec<_>>(),
        vec!["/dev/vg0/root_snap", "/dev/vg0/snap_home"]
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn set_rejects_second_root() {
    let layout = test_layout();
    let root = spec("/dev/vg0/root:first");
    let err = SnapshotSet::open(&layout, Some(&root), &[spec("/dev/vg0/root:second")])
        .expect_err("must reject");
    let err = err.downcast::<SnapshotError>().expect("snapshot error");
    assert!(matches!(err, SnapshotError::MultipleRoots { .. }));

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn create_snapshots_persists_whole_set() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let root = spec("/dev/vg0/root");
    let mut set = SnapshotSet::open(&layout, Some(&root), &[spec("/dev/vg0/var::2G")])
        .expect("must open");

    let report = set.create_snapshots(&mut lvm).expect("must run");
    assert!(report.succeeded());
    assert_eq!(report.completed, vec!["/dev/vg0/snap_root", "/dev/vg0/snap_var"]);
    assert!(lvm.has_volume("/dev/vg0/snap_root"));
    assert!(lvm.has_volume("/dev/vg0/snap_var"));

    let reloaded = SnapshotSet::load(&layout).expect("must reload");
    assert_eq!(reloaded.len(), 2);
    assert_eq!(
        reloaded.get("/dev/vg0/snap_var").expect("member").size(),
        &SnapshotSize::Explicit("2G".to_string())
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn create_failure_at_any_position_leaves_nothing_behind() {
    let names = ["snap_root", "snap_var", "snap_home"];
    for failing in names {
        let layout = test_layout();
        let mut lvm = FakeLvm::new(&layout).failing_on(failing);
        lvm.add_volume("/dev/vg0/snap_opt");
        SnapshotMetadataStore::open(layout.snapshot_metadata_path())
            .save_all([SnapshotRecord::new(
                "/dev/vg0/opt",
                "snap_opt",
                SnapshotSize::Explicit("1G".to_string()),
            )])
            .expect("must seed store");
        let seeded = fs::read(layout.snapshot_metadata_path()).expect("must read store");

        let mut set = SnapshotSet::open(
            &layout,
            Some(&spec("/dev/vg0/root")),
            &[spec("/dev/vg0/var"), spec("/dev/vg0/home")],
        )
        .expect("must open");
        assert_eq!(set.len(), 4);

        let report = set.create_snapshots(&mut lvm).expect("must run");
        assert!(!report.succeeded(), "failure at {failing} must be reported");
        assert_eq!(report.failures[0].snapshot, format!("/dev/vg0/{failing}"));
        assert!(report.completed.is_empty());
        for name in names {
            assert!(
                !lvm.has_volume(&format!("/dev/vg0/{name}")),
                "{name} must not remain after failure at {failing}"
            );
        }
        assert!(set
            .iter()
            .filter(|member| member.name() != "snap_opt")
            .all(|member| !member.exists()));
        assert!(lvm.has_volume("/dev/vg0/snap_opt"));
        assert_eq!(
            fs::read(layout.snapshot_metadata_path()).expect("must read store"),
            seeded,
            "store must be untouched after failure at {failing}"
        );

        let _ = fs::remove_dir_all(layout.root());
    }
}

#[test]
fn create_rolls_back_when_metadata_cannot_be_written() {
    let layout = test_layout();
    fs::create_dir_all(layout.snapshot_metadata_path()).expect("must block metadata path");
    let mut lvm = FakeLvm::new(&layout);
    let mut set = SnapshotSet::open(&layout, None, &[spec("/dev/vg0/root")]).expect("must open");

    assert!(set.create_snapshots(&mut lvm).is_err());
    assert!(!lvm.has_volume("/dev/vg0/snap_root"));
    assert_eq!(lvm.calls_to("lvremove"), 1);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn remove_snapshots_twice_clears_store() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let mut set = SnapshotSet::open(&layout, None, &[spec("/dev/vg0/root"), spec("/dev/vg0/var")])
        .expect("must open");
    set.create_snapshots(&mut lvm).expect("must create");

    let first = set.remove_snapshots(&mut lvm).expect("must remove");
    let second = set.remove_snapshots(&mut lvm).expect("must remove again");
    assert!(first.succeeded());
    assert!(second.succeeded());
    assert!(set.iter().all(|member| !member.exists()));
    assert!(set.store().is_empty());
    assert_eq!(lvm.calls_to("lvremove"), 2);

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn remove_snapshots_keeps_records_of_failed_members() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let mut set = SnapshotSet::open(&layout, None, &[spec("/dev/vg0/root"), spec("/dev/vg0/var")])
        .expect("must open");
    set.create_snapshots(&mut lvm).expect("must create");

    lvm.fail_on.push("snap_root".to_string());
    let report = set.remove_snapshots(&mut lvm).expect("must run");
    assert!(!report.succeeded());
    assert_eq!(report.completed, vec!["/dev/vg0/snap_var"]);

    let remaining = SnapshotMetadataStore::load(&layout.snapshot_metadata_path());
    assert_eq!(
        remaining.iter().map(|record| record.section.as_str()).collect::<Vec<_>>(),
        vec!["/dev/vg0/snap_root"]
    );

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn restore_continues_past_failed_merge_and_clears_store() {
    let layout = test_layout();
    let mut lvm = FakeLvm::new(&layout);
    let mut set = SnapshotSet::open(
        &layout,
        None,
        &[spec("/dev/vg0/root"), spec("/dev/vg0/var"), spec("/dev/vg0/home")],
    )
    .expect("must open");
    set.create_snapshots(&mut lvm).expect("must create");

    let mut set = SnapshotSet::load(&layout).expect("must reload");
    lvm.fail_on.push("snap_var".to_string());
    let report = set.restore_snapshots(&mut lvm).expect("must run");

    assert_eq!(report.completed, vec!["/dev/vg0/snap_root", "/dev/vg0/snap_home"]);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].snapshot, "/dev/vg0/snap_var");
    assert_eq!(lvm.calls_to("lvconvert"), 3);
    assert!(SnapshotMetadataStore::load(&layout.snapshot_metadata_path()).is_empty());

    let _ = fs::remove_dir_all(layout.root());
}

#[test]
fn snapshot_record_section_is_derived_path() {
    let record = SnapshotRecord::new("vg0/root", "s", SnapshotSize::FullOrigin);
    assert_eq!(record.section, "vg0/s");
    assert_eq!(record.path(), "vg0/s");
}
