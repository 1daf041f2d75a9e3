//! End-to-end two-device scenarios over the loopback fabric.

mod common;

use common::{link_two, Network};
use treesync::types::{BackupType, FileStatus};
use treesync::util;

#[tokio::test]
async fn test_fresh_create_propagates() {
	let net = Network::new();
	let pair = link_two(&net, None);

	pair.a.write("a.txt", b"hello");
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();
	pair.pull_into_b().await.unwrap();

	assert_eq!(pair.b.read("a.txt").unwrap(), b"hello");
	let row = pair.b.row(&pair.tree_b, "/a.txt").unwrap();
	assert_eq!(row.status, FileStatus::Normal);
	assert_eq!(row.length, 5);
	assert_eq!(row.sha1, util::sha1_of_bytes(b"hello"));
	// peer authored it once, this side not at all
	assert_eq!(row.local_vclock, 0);
	assert_eq!(row.remote_vclock, vec![1]);
}

#[tokio::test]
async fn test_two_way_convergence() {
	let net = Network::new();
	let pair = link_two(&net, None);

	pair.a.write("from_a.txt", b"alpha");
	pair.b.write("from_b.txt", b"beta");
	pair.a.mkdir("shared_dir");

	pair.converge_cycle().await.unwrap();
	pair.converge_cycle().await.unwrap();

	for device in [&pair.a, &pair.b] {
		assert_eq!(device.read("from_a.txt").unwrap(), b"alpha");
		assert_eq!(device.read("from_b.txt").unwrap(), b"beta");
		assert!(device.exists("shared_dir"));
	}

	// rows agree on content and clocks after convergence
	let row_a = pair.a.row(&pair.tree_a, "/from_a.txt").unwrap();
	let row_b = pair.b.row(&pair.tree_b, "/from_a.txt").unwrap();
	assert_eq!(row_a.sha1, row_b.sha1);
}

#[tokio::test]
async fn test_concurrent_edit_conflict_keeps_both_versions() {
	let net = Network::new();
	let pair = link_two(&net, None);

	// both devices author the same path while "offline"
	pair.a.write("x", b"version a");
	pair.b.write("x", b"version b");

	for _ in 0..3 {
		pair.converge_cycle().await.unwrap();
	}

	let a_uuid = pair.a.engine.device_uuid().to_string();
	let b_uuid = pair.b.engine.device_uuid().to_string();
	let (winner_content, loser_uuid): (&[u8], &str) = if a_uuid < b_uuid {
		(b"version a", b_uuid.as_str())
	} else {
		(b"version b", a_uuid.as_str())
	};

	let conflict_name = format!("x.conflict-{}", loser_uuid);
	for device in [&pair.a, &pair.b] {
		assert_eq!(device.read("x").unwrap(), winner_content, "winner keeps the path");
		assert!(device.exists(&conflict_name), "loser version survives as a copy");
	}
	let loser_content: &[u8] = if winner_content == b"version a" {
		b"version b"
	} else {
		b"version a"
	};
	assert_eq!(pair.a.read(&conflict_name).unwrap(), loser_content);
	assert_eq!(pair.b.read(&conflict_name).unwrap(), loser_content);
}

#[tokio::test]
async fn test_rename_does_not_redownload() {
	let net = Network::new();
	let pair = link_two(&net, None);

	pair.a.write("old", b"stable content");
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();
	pair.pull_into_b().await.unwrap();
	assert_eq!(pair.b.read("old").unwrap(), b"stable content");
	let downloaded_before = net.fetched(&pair.tree_a.uuid);

	pair.a.rename("old", "new");
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();
	pair.pull_into_b().await.unwrap();

	assert!(!pair.b.exists("old"));
	assert_eq!(pair.b.read("new").unwrap(), b"stable content");
	assert_eq!(
		net.fetched(&pair.tree_a.uuid),
		downloaded_before,
		"a pure rename must not transfer bytes"
	);
	let old_row = pair.b.row(&pair.tree_b, "/old").unwrap();
	assert_eq!(old_row.status, FileStatus::Removed);
	let new_row = pair.b.row(&pair.tree_b, "/new").unwrap();
	assert_eq!(new_row.status, FileStatus::Normal);
	assert_eq!(new_row.sha1, util::sha1_of_bytes(b"stable content"));
}

#[tokio::test]
async fn test_delete_propagates() {
	let net = Network::new();
	let pair = link_two(&net, None);

	pair.a.write("gone", b"short lived");
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();
	pair.pull_into_b().await.unwrap();
	assert!(pair.b.exists("gone"));
	let live = pair.b.row(&pair.tree_b, "/gone").unwrap();

	pair.a.remove("gone");
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();
	pair.pull_into_b().await.unwrap();

	assert!(!pair.b.exists("gone"), "file must be deleted on the peer");
	let tombstone = pair.b.row(&pair.tree_b, "/gone").unwrap();
	assert_eq!(tombstone.status, FileStatus::Removed);
	assert!(tombstone.usn > live.usn);
}

#[tokio::test]
async fn test_backup_dst_refuses_upstream() {
	let net = Network::new();
	let pair = link_two(&net, Some((BackupType::Src, BackupType::Dst)));

	pair.a.write("photo.jpg", b"pixels");
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();
	pair.pull_into_b().await.unwrap();
	assert_eq!(pair.b.read("photo.jpg").unwrap(), b"pixels");

	// destination loses the file locally
	pair.b.remove("photo.jpg");
	pair.b.engine.refresh_now(pair.tree_b.id).unwrap();

	// neither its own pull nor the source's pull may propagate the deletion
	pair.pull_into_b().await.unwrap();
	pair.pull_into_a().await.unwrap();
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();

	assert_eq!(
		pair.a.read("photo.jpg").unwrap(),
		b"pixels",
		"the backup source must keep its file"
	);
	let row = pair.a.row(&pair.tree_a, "/photo.jpg").unwrap();
	assert_eq!(row.status, FileStatus::Normal);
}

#[tokio::test]
async fn test_cancel_mid_batch_leaves_consistent_prefix() {
	let net = Network::new();
	let pair = link_two(&net, None);

	for i in 0..120 {
		pair.a.write(&format!("bulk/f{:03}.txt", i), format!("payload {}", i).as_bytes());
	}
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();

	let sync_fut = pair.pull_into_b();
	let canceller = async {
		tokio::time::sleep(std::time::Duration::from_millis(3)).await;
		pair.b.ctx().abort.abort_pair(pair.tree_b.id, pair.a_on_b.id);
	};
	let (result, _) = tokio::join!(sync_fut, canceller);
	// either the cancel landed mid-run or the run won the race
	if let Err(e) = result {
		assert!(e.is_cancel() || matches!(e, treesync::Error::General));
	}

	// whatever got applied must be internally consistent
	for row in pair.b.rows(&pair.tree_b) {
		if row.status == FileStatus::Normal && !row.sha1.is_empty() {
			let content = pair.b.read(&row.path[1..]).expect("row without file");
			assert_eq!(row.sha1, util::sha1_of_bytes(&content));
		}
	}

	// an uncancelled re-sync completes the set
	pair.b.ctx().abort.clear_pair(pair.tree_b.id, pair.a_on_b.id);
	pair.pull_into_b().await.unwrap();
	let live = pair
		.b
		.rows(&pair.tree_b)
		.into_iter()
		.filter(|r| r.status == FileStatus::Normal && !r.sha1.is_empty())
		.count();
	assert_eq!(live, 120);
	assert_eq!(pair.b.read("bulk/f119.txt").unwrap(), b"payload 119");
}

#[tokio::test]
async fn test_reapplying_same_find_page_is_noop() {
	let net = Network::new();
	let pair = link_two(&net, None);

	pair.a.write("a.txt", b"hello");
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();
	pair.pull_into_b().await.unwrap();

	let rows_before = pair.b.rows(&pair.tree_b);
	pair.pull_into_b().await.unwrap();
	assert_eq!(pair.b.rows(&pair.tree_b), rows_before, "second application changed rows");
}

#[tokio::test]
async fn test_push_filter_lists_only_missing_content() {
	let net = Network::new();
	let pair = link_two(&net, None);

	pair.a.write("shared.txt", b"same bytes");
	pair.b.write("shared.txt", b"same bytes");
	pair.b.write("only_b.txt", b"unique");
	pair.converge_cycle().await.unwrap();
	pair.converge_cycle().await.unwrap();

	// pushes only ever carried content the peer did not have
	let pushed = net.pushed_files.lock().unwrap().clone();
	assert!(
		!pushed.iter().any(|(_tree, path)| path == "/shared.txt"),
		"identical content must not be pushed: {:?}",
		pushed
	);
}

// vim: ts=4
