//! Tree rows

use serde::{Deserialize, Serialize};

use crate::resolver::Record;
use crate::types::{BackupType, RootStatus, TreeStatus};

/// One device's subtree participating in a sync.
///
/// A tree is local iff `device_id == 0`. Remote trees carry this device's
/// replica of the peer's file table under their own authority.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tree {
	pub id: i32,
	pub uuid: String,
	pub root: String,
	pub device_id: i32,
	pub sync_id: i32,
	pub status: TreeStatus,
	pub last_find: i64,
	pub backup_type: BackupType,
	pub is_enabled: bool,
	pub root_status: RootStatus,
}

impl Record for Tree {
	const TABLE: &'static str = "tree";

	fn key(&self) -> String {
		tree_key(self.id)
	}
}

pub fn tree_key(id: i32) -> String {
	format!("{:010}", id)
}

impl Tree {
	pub fn is_local(&self) -> bool {
		self.device_id == super::LOCAL_DEVICE_ID
	}

	pub fn is_normal(&self) -> bool {
		self.status == TreeStatus::Normal
	}

	/// Authority of this tree's file table.
	pub fn file_authority(&self) -> String {
		super::tree_authority(&self.uuid)
	}
}

// vim: ts=4
