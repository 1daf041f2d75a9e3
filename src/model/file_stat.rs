//! File rows
//!
//! One `FileStat` per path per tree. The vector clock is stored split: the
//! owning tree's component in `local_vclock`, the peer components packed in
//! `remote_vclock` following the tree's canonical layout.

use serde::{Deserialize, Serialize};

use crate::resolver::Record;
use crate::types::{FileStatus, FileType};
use crate::vclock::VectorClock;

/// Unix mode/ownership attributes carried with every row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct UnixAttr {
	pub mode: u32,
	pub uid: u32,
	pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStat {
	pub path: String,
	pub ftype: FileType,
	pub status: FileStatus,
	pub mtime: i64,
	pub length: i64,
	/// Hex SHA-1 of the content; empty for directories and tombstones
	pub sha1: String,
	/// Update sequence number, strictly monotonic within the tree
	pub usn: i64,
	pub local_vclock: i32,
	pub remote_vclock: Vec<i32>,
	pub unix_attr: UnixAttr,
	pub android_attr: i32,
	pub win_attr: i32,
	/// Device name that authored the last change
	pub modifier: String,
	pub time_stamp: i64,
	pub alias: Option<String>,
}

impl Record for FileStat {
	const TABLE: &'static str = "file";

	fn key(&self) -> String {
		self.path.clone()
	}
}

impl FileStat {
	pub fn is_normal(&self) -> bool {
		self.status == FileStatus::Normal
	}

	pub fn is_removed(&self) -> bool {
		self.status == FileStatus::Removed
	}

	pub fn is_dir(&self) -> bool {
		self.ftype == FileType::Dir
	}

	pub fn is_reg(&self) -> bool {
		self.ftype == FileType::Reg
	}

	/// Full vector clock in this tree's layout.
	pub fn vclock(&self) -> VectorClock {
		VectorClock::from_parts(self.local_vclock, &self.remote_vclock)
	}

	/// Store a full vector clock back into the split form.
	pub fn set_vclock(&mut self, vc: &VectorClock) {
		self.local_vclock = vc.local();
		self.remote_vclock = vc.remote();
	}
}

/// Persisted USN allocator of a tree, stored next to its file table so that
/// counter bumps commit atomically with the row batch that consumed them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsnCounter {
	pub value: i64,
}

impl Record for UsnCounter {
	const TABLE: &'static str = "meta";

	fn key(&self) -> String {
		String::from("usn")
	}
}

impl UsnCounter {
	pub const KEY: &'static str = "usn";
}


// vim: ts=4
