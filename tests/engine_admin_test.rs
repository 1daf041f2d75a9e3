//! Administrative surface: sync/tree creation rules, tombstone GC, the
//! query cache, remote-meta idempotence and the wire round trip.

mod common;

use common::{link_two, new_device, Network};
use treesync::engine::store_remote_meta;
use treesync::model::{FileStat, UnixAttr};
use treesync::protocol::messages::{RemoteMeta, RpcEnvelope};
use treesync::protocol::FileStatMsg;
use treesync::types::{BackupType, FileStatus, FileType, SyncType, TreeStatus};
use treesync::vclock::VectorClock;
use treesync::Error;

#[tokio::test]
async fn test_create_sync_rejects_duplicate_name() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	device.engine.create_sync("docs", SyncType::Normal).unwrap();
	let err = device.engine.create_sync("docs", SyncType::Normal).unwrap_err();
	assert!(matches!(err, Error::SyncExist { .. }));
}

#[tokio::test]
async fn test_create_tree_validations() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("docs", SyncType::Normal).unwrap();

	// relative roots are rejected
	let err = device.engine.create_tree(sync.id, "relative/path", BackupType::None).unwrap_err();
	assert!(matches!(err, Error::InvalidPath { .. }));

	// missing directories are rejected
	let missing = device.root.path().join("does-not-exist");
	let err = device
		.engine
		.create_tree(sync.id, missing.to_str().unwrap(), BackupType::None)
		.unwrap_err();
	assert!(matches!(err, Error::DirNoent { .. }));

	// a root nested under an existing tree is rejected
	device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), BackupType::None)
		.unwrap();
	let nested = device.root.path().join("inner");
	std::fs::create_dir_all(&nested).unwrap();
	let err = device
		.engine
		.create_tree(sync.id, nested.to_str().unwrap(), BackupType::None)
		.unwrap_err();
	assert!(matches!(err, Error::NestedTree { .. }));

	// unknown sync is rejected
	let elsewhere = tempfile::TempDir::new().unwrap();
	let err = device
		.engine
		.create_tree(999, elsewhere.path().to_str().unwrap(), BackupType::None)
		.unwrap_err();
	assert!(matches!(err, Error::SyncNoent { .. }));
}

#[tokio::test]
async fn test_query_cache_lists_created_syncs() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("docs", SyncType::Normal).unwrap();
	let tree = device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), BackupType::None)
		.unwrap();

	device.ctx().cache.recompute(&device.ctx().resolver).unwrap();
	let snapshot = device.engine.list_syncs();
	let entry = snapshot.syncs.iter().find(|s| s.sync_id == sync.id).expect("sync listed");
	assert_eq!(entry.name, "docs");
	assert_eq!(entry.trees.len(), 1);
	assert_eq!(entry.trees[0].tree_id, tree.id);
	assert!(entry.trees[0].is_local);
}

#[tokio::test]
async fn test_gc_tombstones_respects_peer_watermark() {
	let net = Network::new();
	let device = new_device("dev1", &net);
	let sync = device.engine.create_sync("docs", SyncType::Normal).unwrap();
	let tree = device
		.engine
		.create_tree(sync.id, device.root.path().to_str().unwrap(), BackupType::None)
		.unwrap();

	device.write("a.txt", b"a");
	device.write("b.txt", b"b");
	device.engine.refresh_now(tree.id).unwrap();
	device.remove("a.txt");
	device.engine.refresh_now(tree.id).unwrap();
	device.remove("b.txt");
	device.engine.refresh_now(tree.id).unwrap();

	let rows = device.rows(&tree);
	let usn_a = rows.iter().find(|r| r.path == "/a.txt").unwrap().usn;
	let usn_b = rows.iter().find(|r| r.path == "/b.txt").unwrap().usn;
	assert!(usn_a < usn_b);

	// peers have only seen up to a.txt's tombstone
	let collected = device.engine.gc_tombstones(tree.id, usn_a).unwrap();
	assert_eq!(collected, 1);
	assert!(device.row(&tree, "/a.txt").is_none());
	assert!(device.row(&tree, "/b.txt").is_some(), "unacknowledged tombstone must stay");
}

fn sample_stat() -> FileStat {
	FileStat {
		path: String::from("/dir/file.bin"),
		ftype: FileType::Reg,
		status: FileStatus::Normal,
		mtime: 1700000000,
		length: 4096,
		sha1: String::from("aaf4c61ddcc5e8a2dabede0f3b482cd9aea9434d"),
		usn: 42,
		local_vclock: 3,
		remote_vclock: vec![1, 0, 7],
		unix_attr: UnixAttr { mode: 0o100644, uid: 1000, gid: 1000 },
		android_attr: 0,
		win_attr: 32,
		modifier: String::from("devA"),
		time_stamp: 1700000001,
		alias: None,
	}
}

#[test]
fn test_file_stat_wire_round_trip() {
	let stat = sample_stat();
	let msg = FileStatMsg::from_stat(&stat);
	assert_eq!(msg.vclock, vec![3, 1, 0, 7]);

	let bytes = bincode::serialize(&msg).unwrap();
	let decoded: FileStatMsg = bincode::deserialize(&bytes).unwrap();
	assert_eq!(decoded, msg);

	// identity remap restores the split row exactly
	let back = decoded.into_stat(&VectorClock::from_vec(msg.vclock.clone()));
	assert_eq!(back.path, stat.path);
	assert_eq!(back.ftype, stat.ftype);
	assert_eq!(back.status, stat.status);
	assert_eq!(back.mtime, stat.mtime);
	assert_eq!(back.length, stat.length);
	assert_eq!(back.sha1, stat.sha1);
	assert_eq!(back.usn, stat.usn);
	assert_eq!(back.local_vclock, stat.local_vclock);
	assert_eq!(back.remote_vclock, stat.remote_vclock);
	assert_eq!(back.unix_attr, stat.unix_attr);
}

#[test]
fn test_envelope_round_trip() {
	let env = RpcEnvelope::new(
		"device-1",
		treesync::protocol::EncryptLevel::WithToken,
		treesync::protocol::messages::MsgBody::FindRequest {
			local_tree_uuid: String::from("lt"),
			remote_tree_uuid: String::from("rt"),
			sync_uuid: String::from("s"),
			since: 17,
			limit: 500,
			is_list_sync: false,
		},
	);
	let bytes = env.encode().unwrap();
	assert_eq!(RpcEnvelope::decode(&bytes).unwrap(), env);
}

#[tokio::test]
async fn test_store_remote_meta_is_idempotent() {
	let net = Network::new();
	let pair = link_two(&net, None);

	let meta = RemoteMeta {
		tree_uuids: vec![pair.tree_a.uuid.clone(), pair.tree_b.uuid.clone()],
		stats: vec![FileStatMsg::from_stat(&sample_stat())],
	};

	let written = store_remote_meta(pair.b.ctx(), &pair.a_on_b, &meta).unwrap();
	assert_eq!(written, 1);
	let rows = pair.b.rows(&pair.a_on_b);
	assert_eq!(rows.len(), 1);

	// same page again: nothing changes
	let written = store_remote_meta(pair.b.ctx(), &pair.a_on_b, &meta).unwrap();
	assert_eq!(written, 0);
	assert_eq!(pair.b.rows(&pair.a_on_b), rows);
}

#[tokio::test]
async fn test_permission_denial_transitions_to_token_diff() {
	let net = Network::new();
	let pair = link_two(&net, None);

	// the peer stops emitting (as after a token rotation)
	let mut sync_a = pair.sync_a.clone();
	sync_a.perm = treesync::types::SyncPerm::Wronly;
	pair.a
		.ctx()
		.resolver
		.update(treesync::model::MAIN_AUTHORITY, &sync_a)
		.unwrap();

	pair.a.write("x.txt", b"x");
	pair.a.engine.refresh_now(pair.tree_a.id).unwrap();
	let err = pair.pull_into_b().await.unwrap_err();
	assert!(matches!(err, Error::PermissionDeny));

	// the local end must stop emitting until repaired
	let sync_b: treesync::SyncRow = pair
		.b
		.ctx()
		.resolver
		.get(treesync::model::MAIN_AUTHORITY, &treesync::model::sync_key(pair.sync_b.id))
		.unwrap()
		.unwrap();
	assert_eq!(sync_b.perm, treesync::types::SyncPerm::TokenDiff);

	// and further sync attempts are rejected outright
	let err = pair.pull_into_b().await.unwrap_err();
	assert!(matches!(err, Error::SyncNoent { .. }));
}

#[tokio::test]
async fn test_store_remote_meta_learns_vclock_only_trees() {
	let net = Network::new();
	let pair = link_two(&net, None);

	// the sender mentions a third tree this device has never seen
	let stranger = String::from("00000000-feed-beef-0000-000000000000");
	let meta = RemoteMeta {
		tree_uuids: vec![pair.tree_a.uuid.clone(), stranger.clone()],
		stats: vec![FileStatMsg::from_stat(&sample_stat())],
	};
	store_remote_meta(pair.b.ctx(), &pair.a_on_b, &meta).unwrap();

	let trees: Vec<treesync::Tree> =
		pair.b.ctx().resolver.query_all(treesync::model::MAIN_AUTHORITY).unwrap();
	let placeholder = trees.iter().find(|t| t.uuid == stranger).expect("slot learned");
	assert_eq!(placeholder.status, TreeStatus::VclockOnly);
	assert!(!placeholder.is_enabled);
}

// vim: ts=4
