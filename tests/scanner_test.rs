//! Scanner behavior against a real temp tree: insertion, idempotence,
//! modification, tombstones and USN discipline.

mod common;

use common::{new_device, Network};
use treesync::types::{FileStatus, FileType};
use treesync::util;

#[tokio::test]
async fn test_fresh_create_inserts_row() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("s", treesync::types::SyncType::Normal).unwrap();
	let tree = device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), treesync::types::BackupType::None)
		.unwrap();

	device.write("a.txt", b"hello");
	let summary = device.engine.refresh_now(tree.id).unwrap();
	assert_eq!(summary.inserted, 1);

	let row = device.row(&tree, "/a.txt").unwrap();
	assert_eq!(row.ftype, FileType::Reg);
	assert_eq!(row.status, FileStatus::Normal);
	assert_eq!(row.length, 5);
	assert_eq!(row.sha1, util::sha1_of_bytes(b"hello"));
	assert_eq!(row.local_vclock, 1);
	assert_eq!(row.usn, 1);
}

#[tokio::test]
async fn test_rescan_without_change_is_noop() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("s", treesync::types::SyncType::Normal).unwrap();
	let tree = device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), treesync::types::BackupType::None)
		.unwrap();

	device.write("a.txt", b"hello");
	device.mkdir("sub");
	device.write("sub/b.txt", b"world");
	device.engine.refresh_now(tree.id).unwrap();
	let before = device.rows(&tree);

	let summary = device.engine.refresh_now(tree.id).unwrap();
	assert_eq!(summary.changes(), 0);
	assert_eq!(device.rows(&tree), before);
}

#[tokio::test]
async fn test_modify_bumps_clock_and_usn() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("s", treesync::types::SyncType::Normal).unwrap();
	let tree = device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), treesync::types::BackupType::None)
		.unwrap();

	device.write("a.txt", b"hello");
	device.engine.refresh_now(tree.id).unwrap();
	let first = device.row(&tree, "/a.txt").unwrap();

	// content change with a different length is always observed
	device.write("a.txt", b"hello world");
	let summary = device.engine.refresh_now(tree.id).unwrap();
	assert_eq!(summary.updated, 1);

	let second = device.row(&tree, "/a.txt").unwrap();
	assert_eq!(second.local_vclock, first.local_vclock + 1);
	assert!(second.usn > first.usn);
	assert_eq!(second.sha1, util::sha1_of_bytes(b"hello world"));
}

#[tokio::test]
async fn test_delete_writes_tombstone_keeping_sha1() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("s", treesync::types::SyncType::Normal).unwrap();
	let tree = device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), treesync::types::BackupType::None)
		.unwrap();

	device.write("gone.txt", b"bye");
	device.engine.refresh_now(tree.id).unwrap();
	let live = device.row(&tree, "/gone.txt").unwrap();

	device.remove("gone.txt");
	let summary = device.engine.refresh_now(tree.id).unwrap();
	assert_eq!(summary.removed, 1);

	let tombstone = device.row(&tree, "/gone.txt").unwrap();
	assert_eq!(tombstone.status, FileStatus::Removed);
	assert_eq!(tombstone.sha1, live.sha1);
	assert_eq!(tombstone.local_vclock, live.local_vclock + 1);
	assert!(tombstone.usn > live.usn);

	// tombstones are idempotent under rescans
	let summary = device.engine.refresh_now(tree.id).unwrap();
	assert_eq!(summary.changes(), 0);
}

#[tokio::test]
async fn test_usn_strictly_monotonic_and_paths_unique() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("s", treesync::types::SyncType::Normal).unwrap();
	let tree = device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), treesync::types::BackupType::None)
		.unwrap();

	for i in 0..20 {
		device.write(&format!("f{:02}.txt", i), format!("content {}", i).as_bytes());
	}
	device.engine.refresh_now(tree.id).unwrap();
	device.write("f00.txt", b"changed content here");
	device.remove("f01.txt");
	device.engine.refresh_now(tree.id).unwrap();

	let rows = device.rows(&tree);
	assert_eq!(rows.len(), 20);

	let mut paths: Vec<&str> = rows.iter().map(|r| r.path.as_str()).collect();
	paths.sort();
	paths.dedup();
	assert_eq!(paths.len(), 20, "paths must be unique");

	let mut usns: Vec<i64> = rows.iter().map(|r| r.usn).collect();
	usns.sort();
	for pair in usns.windows(2) {
		assert!(pair[0] < pair[1], "usn values must be strictly increasing");
	}
}

#[tokio::test]
async fn test_include_list_limits_scan_scope() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("s", treesync::types::SyncType::Normal).unwrap();
	let tree = device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), treesync::types::BackupType::None)
		.unwrap();

	device.mkdir("docs");
	device.write("docs/keep.txt", b"keep");
	device.write("stray.txt", b"stray");
	device.engine.set_sync_list(tree.id, &[String::from("/docs")]).unwrap();
	device.engine.refresh_now(tree.id).unwrap();

	assert!(device.row(&tree, "/docs/keep.txt").is_some());
	assert!(device.row(&tree, "/docs").is_some());
	assert!(device.row(&tree, "/stray.txt").is_none(), "out-of-scope path must not be indexed");

	// widening the list back picks the stray up without touching /docs rows
	device.engine.set_sync_list(tree.id, &[]).unwrap();
	let summary = device.engine.refresh_now(tree.id).unwrap();
	assert_eq!(summary.inserted, 1);
	assert!(device.row(&tree, "/stray.txt").is_some());
}

#[tokio::test]
async fn test_dirs_are_rows_too() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("s", treesync::types::SyncType::Normal).unwrap();
	let tree = device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), treesync::types::BackupType::None)
		.unwrap();

	device.mkdir("docs/deep");
	device.write("docs/deep/x.txt", b"x");
	device.engine.refresh_now(tree.id).unwrap();

	let docs = device.row(&tree, "/docs").unwrap();
	assert_eq!(docs.ftype, FileType::Dir);
	assert!(docs.sha1.is_empty());
	assert!(device.row(&tree, "/docs/deep").is_some());
	assert!(device.row(&tree, "/docs/deep/x.txt").is_some());
}

// vim: ts=4
