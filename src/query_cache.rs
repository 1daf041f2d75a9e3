//! Cached sync/backup listings
//!
//! UI-facing queries never hit the tables directly: a background task keeps
//! a self-consistent snapshot of sync and backup summaries, invalidated by
//! resolver observers and recomputed after a short debounce. Subscribers
//! receive keyed diffs against the previous snapshot.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::logging::*;
use crate::model::{Device, SyncRow, Tree, MAIN_AUTHORITY};
use crate::resolver::{ContentResolver, Uri};
use crate::types::{BackupType, SyncPerm, SyncStatus, SyncType, TreeStatus};

/// Recompute delay after the first invalidation.
pub const DEBOUNCE_MS: u64 = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TreeInfo {
	pub tree_id: i32,
	pub tree_uuid: String,
	pub device_id: i32,
	pub device_name: String,
	pub root: String,
	pub is_local: bool,
	pub backup_type: BackupType,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncInfo {
	pub sync_id: i32,
	pub uuid: String,
	pub name: String,
	pub perm: SyncPerm,
	pub last_sync: i64,
	pub trees: Vec<TreeInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BackupInfo {
	pub sync_id: i32,
	pub uuid: String,
	pub name: String,
	pub last_sync: i64,
	pub src_tree: Option<TreeInfo>,
	pub dst_trees: Vec<TreeInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheSnapshot {
	pub syncs: Vec<SyncInfo>,
	pub backups: Vec<BackupInfo>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiffKind {
	Insert,
	Update,
	Delete,
}

/// One changed row of the snapshot, keyed by sync id.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CacheDiff {
	pub kind: DiffKind,
	pub sync_id: i32,
}

#[derive(Default)]
pub struct QueryCache {
	snapshot: RwLock<Arc<CacheSnapshot>>,
	subscribers: Mutex<Vec<mpsc::UnboundedSender<Vec<CacheDiff>>>>,
}

impl QueryCache {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// The current snapshot; always self-consistent.
	pub fn snapshot(&self) -> Arc<CacheSnapshot> {
		self.snapshot.read().unwrap().clone()
	}

	pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Vec<CacheDiff>> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.subscribers.lock().unwrap().push(tx);
		rx
	}

	/// Rebuild the snapshot from the tables and publish the diff.
	pub fn recompute(&self, resolver: &ContentResolver) -> Result<Vec<CacheDiff>> {
		let next = build_snapshot(resolver)?;
		let previous = {
			let mut guard = self.snapshot.write().unwrap();
			std::mem::replace(&mut *guard, Arc::new(next.clone()))
		};
		let diffs = diff_snapshots(&previous, &next);
		if !diffs.is_empty() {
			let mut subscribers = self.subscribers.lock().unwrap();
			subscribers.retain(|tx| tx.send(diffs.clone()).is_ok());
		}
		Ok(diffs)
	}

	/// Spawn the invalidation listener: any write to the watched global
	/// tables schedules one debounced recompute.
	pub fn spawn(self: &Arc<Self>, resolver: Arc<ContentResolver>) -> tokio::task::JoinHandle<()> {
		let cache = Arc::clone(self);
		let mut handle = resolver.register_observer(Uri::authority(MAIN_AUTHORITY), true);
		tokio::spawn(async move {
			while let Some(uri) = handle.recv().await {
				if !watched(&uri) {
					continue;
				}
				tokio::time::sleep(Duration::from_millis(DEBOUNCE_MS)).await;
				while handle.try_recv().is_some() {}
				if let Err(e) = cache.recompute(&resolver) {
					warn!("query cache recompute failed: {}", e);
				}
			}
		})
	}
}

fn watched(uri: &Uri) -> bool {
	matches!(
		uri.table.as_deref(),
		Some("device") | Some("sync") | Some("tree") | Some("sync_mode") | Some("share_sync")
	)
}

fn build_snapshot(resolver: &ContentResolver) -> Result<CacheSnapshot> {
	let syncs: Vec<SyncRow> = resolver.query_all(MAIN_AUTHORITY)?;
	let trees: Vec<Tree> = resolver.query_all(MAIN_AUTHORITY)?;
	let devices: Vec<Device> = resolver.query_all(MAIN_AUTHORITY)?;
	let device_names: BTreeMap<i32, String> =
		devices.iter().map(|d| (d.id, d.name.clone())).collect();

	let tree_info = |tree: &Tree| TreeInfo {
		tree_id: tree.id,
		tree_uuid: tree.uuid.clone(),
		device_id: tree.device_id,
		device_name: device_names.get(&tree.device_id).cloned().unwrap_or_default(),
		root: tree.root.clone(),
		is_local: tree.is_local(),
		backup_type: tree.backup_type,
	};

	let mut snapshot = CacheSnapshot::default();
	for sync in syncs.iter().filter(|s| s.status == SyncStatus::Normal) {
		let sync_trees: Vec<TreeInfo> = trees
			.iter()
			.filter(|t| t.sync_id == sync.id && t.status == TreeStatus::Normal)
			.map(tree_info)
			.collect();
		match sync.stype {
			SyncType::Backup => {
				snapshot.backups.push(BackupInfo {
					sync_id: sync.id,
					uuid: sync.uuid.clone(),
					name: sync.name.clone(),
					last_sync: sync.last_sync,
					src_tree: sync_trees
						.iter()
						.find(|t| t.backup_type == BackupType::Src)
						.cloned(),
					dst_trees: sync_trees
						.into_iter()
						.filter(|t| t.backup_type == BackupType::Dst)
						.collect(),
				});
			}
			_ => {
				// a sync with no surviving trees has nothing to show
				if sync_trees.is_empty() && sync.perm != SyncPerm::Disconnect {
					continue;
				}
				snapshot.syncs.push(SyncInfo {
					sync_id: sync.id,
					uuid: sync.uuid.clone(),
					name: sync.name.clone(),
					perm: sync.perm,
					last_sync: sync.last_sync,
					trees: sync_trees,
				});
			}
		}
	}
	Ok(snapshot)
}

fn diff_snapshots(previous: &CacheSnapshot, next: &CacheSnapshot) -> Vec<CacheDiff> {
	let prev: BTreeMap<i32, &SyncInfo> =
		previous.syncs.iter().map(|s| (s.sync_id, s)).collect();
	let curr: BTreeMap<i32, &SyncInfo> = next.syncs.iter().map(|s| (s.sync_id, s)).collect();

	let mut diffs = Vec::new();
	for (id, info) in &curr {
		match prev.get(id) {
			None => diffs.push(CacheDiff { kind: DiffKind::Insert, sync_id: *id }),
			Some(old) if old != info => {
				diffs.push(CacheDiff { kind: DiffKind::Update, sync_id: *id })
			}
			Some(_) => {}
		}
	}
	for id in prev.keys() {
		if !curr.contains_key(id) {
			diffs.push(CacheDiff { kind: DiffKind::Delete, sync_id: *id });
		}
	}

	// backups share the id space with syncs
	let prev_b: BTreeMap<i32, &BackupInfo> =
		previous.backups.iter().map(|b| (b.sync_id, b)).collect();
	let curr_b: BTreeMap<i32, &BackupInfo> =
		next.backups.iter().map(|b| (b.sync_id, b)).collect();
	for (id, info) in &curr_b {
		match prev_b.get(id) {
			None => diffs.push(CacheDiff { kind: DiffKind::Insert, sync_id: *id }),
			Some(old) if old != info => {
				diffs.push(CacheDiff { kind: DiffKind::Update, sync_id: *id })
			}
			Some(_) => {}
		}
	}
	for id in prev_b.keys() {
		if !curr_b.contains_key(id) {
			diffs.push(CacheDiff { kind: DiffKind::Delete, sync_id: *id });
		}
	}
	diffs
}


// vim: ts=4
