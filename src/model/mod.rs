//! Typed row structs for the engine's tables
//!
//! Each row implements [`crate::resolver::Record`], which binds it to a table
//! name and a storage key. Rows travel through the content resolver as
//! bincode blobs; nothing outside this module and the resolver knows the
//! encoding.

mod device;
mod file_stat;
mod sync;
mod tree;

pub use device::{device_key, Device, DeviceIp, StaticPeer};
pub use file_stat::{FileStat, UnixAttr, UsnCounter};
pub use sync::{sync_key, sync_mode_key, SyncListRow, SyncModeRow, SyncRow};
pub use tree::{tree_key, Tree};

/// Authority of the global tables (devices, syncs, trees, modes, peers).
pub const MAIN_AUTHORITY: &str = "main";

/// Authority of one tree's file table.
pub fn tree_authority(tree_uuid: &str) -> String {
	format!("tree/{}", tree_uuid)
}

/// The local device always has id 0.
pub const LOCAL_DEVICE_ID: i32 = 0;

// vim: ts=4
