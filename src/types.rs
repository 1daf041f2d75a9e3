//! Core enums shared across the engine

use serde::{Deserialize, Serialize};

/// Kind of a file row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileType {
	Dir,
	Reg,
}

/// Liveness of a file row; `Removed` rows are tombstones kept for convergence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileStatus {
	Normal,
	Removed,
}

/// Tree liveness
///
/// `VclockOnly` trees exist only to hold a vector-clock slot for a peer tree
/// this device will never store files for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TreeStatus {
	Normal,
	Removed,
	VclockOnly,
}

/// Sync liveness
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncStatus {
	Normal,
	Removed,
}

/// Sync flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncType {
	Normal,
	Backup,
	Shared,
}

/// Access permission at the local end of a sync
///
/// `Disconnect`, `TokenDiff` and `CreatorDelete` forbid data flow while the
/// metadata is preserved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncPerm {
	Rdonly,
	Wronly,
	Rdwr,
	CreatorDelete,
	TokenDiff,
	Disconnect,
}

impl SyncPerm {
	/// Local end may ingest peer changes
	pub fn can_ingest(self) -> bool {
		matches!(self, SyncPerm::Wronly | SyncPerm::Rdwr)
	}

	/// Local end may emit changes to peers
	pub fn can_emit(self) -> bool {
		matches!(self, SyncPerm::Rdonly | SyncPerm::Rdwr)
	}

	/// Sync pair is usable at all
	pub fn allows_sync(self) -> bool {
		!matches!(self, SyncPerm::Disconnect | SyncPerm::TokenDiff | SyncPerm::CreatorDelete)
	}
}

/// Role of a tree in a backup sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BackupType {
	None,
	Src,
	Dst,
}

/// Per tree-pair synchronization mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SyncMode {
	#[default]
	Auto,
	Manual,
	Off,
}

/// Device reachability
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceStatus {
	Online,
	Offline,
}

/// State of a tree root directory on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RootStatus {
	Normal,
	Moved,
}


// vim: ts=4
