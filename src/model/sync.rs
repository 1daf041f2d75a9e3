//! Sync rows, per-pair modes and per-tree include lists

use serde::{Deserialize, Serialize};

use crate::resolver::Record;
use crate::types::{SyncMode, SyncPerm, SyncStatus, SyncType};

/// A named group of trees that converge. One tree per participating device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRow {
	pub id: i32,
	pub uuid: String,
	pub name: String,
	pub last_sync: i64,
	pub stype: SyncType,
	pub status: SyncStatus,
	pub creator_device_id: i32,
	pub perm: SyncPerm,
	pub restore_share_perm: SyncPerm,
}

impl Record for SyncRow {
	const TABLE: &'static str = "sync";

	fn key(&self) -> String {
		sync_key(self.id)
	}
}

pub fn sync_key(id: i32) -> String {
	format!("{:010}", id)
}

impl SyncRow {
	pub fn is_normal(&self) -> bool {
		self.status == SyncStatus::Normal
	}
}

/// Synchronization mode of one (local tree, remote tree) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncModeRow {
	pub local_tree_id: i32,
	pub remote_tree_id: i32,
	pub mode: SyncMode,
	pub last_auto_sync_time: i64,
}

impl Record for SyncModeRow {
	const TABLE: &'static str = "sync_mode";

	fn key(&self) -> String {
		sync_mode_key(self.local_tree_id, self.remote_tree_id)
	}
}

pub fn sync_mode_key(local_tree_id: i32, remote_tree_id: i32) -> String {
	format!("{:010}:{:010}", local_tree_id, remote_tree_id)
}

/// One include-list entry (a favorite) of a tree. A tree with no entries
/// syncs everything under its root.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncListRow {
	pub tree_id: i32,
	pub prefix: String,
}

impl Record for SyncListRow {
	const TABLE: &'static str = "sync_list";

	fn key(&self) -> String {
		format!("{:010}:{}", self.tree_id, self.prefix)
	}
}

// vim: ts=4
