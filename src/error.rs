//! Error types for the synchronization engine

use std::error::Error as StdError;
use std::fmt;
use std::io;

/// Crate-wide result alias
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for engine operations
///
/// Variants mirror the engine's error taxonomy. Most carry enough context to
/// be actionable in a log line; callers usually propagate with `?` and only
/// the surfaces (CLI, RPC handlers) map them to exit codes or wire errors.
#[derive(Debug)]
pub enum Error {
	/// Listen port already bound
	AddrInUse { port: u16 },

	/// Port outside the usable range
	InvalidPort { port: i64 },

	/// Path is not absolute, not normalizable, or escapes its root
	InvalidPath { path: String },

	/// A tree root may not nest inside another tree of the same device
	NestedTree { root: String, other: String },

	/// Sync does not exist
	SyncNoent { sync: String },

	/// Sync already exists
	SyncExist { sync: String },

	/// Tree does not exist
	TreeNoent { tree: String },

	/// Tree already exists
	TreeExist { tree: String },

	/// Directory does not exist on disk
	DirNoent { path: String },

	/// Engine has not been started up
	NotStartup,

	/// Content resolver failure (provider missing, row decode, storage)
	Content { message: String },

	/// Underlying I/O error
	OsIo(io::Error),

	/// Socket-level failure
	OsSocket { message: String },

	/// Timer subsystem failure
	OsTimer,

	/// Thread/task spawn failure
	OsThread,

	/// Remote call exceeded its deadline
	Timeout,

	/// Peer rejected the operation
	PermissionDeny,

	/// Malformed or unexpected wire message
	InvalidMsg { message: String },

	/// Local and remote tree do not belong to the same sync
	SyncdirMismatch,

	/// Device does not exist
	DeviceNoent { device: String },

	/// File row does not exist
	FileNoent { path: String },

	/// Tree root disappeared or moved
	RootMoved { root: String },

	/// Bad access key code
	InvalidKeyCode,

	/// Device-pair token mismatch
	MactokenMismatch,

	/// Operation aborted; partial work is retained
	Cancel,

	/// Aggregate failure; details were logged at the failure site
	General,
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Error::AddrInUse { port } => write!(f, "address already in use (port {})", port),
			Error::InvalidPort { port } => write!(f, "invalid port: {}", port),
			Error::InvalidPath { path } => write!(f, "invalid path: {}", path),
			Error::NestedTree { root, other } => {
				write!(f, "tree root {} nests with existing tree {}", root, other)
			}
			Error::SyncNoent { sync } => write!(f, "sync {} does not exist", sync),
			Error::SyncExist { sync } => write!(f, "sync {} already exists", sync),
			Error::TreeNoent { tree } => write!(f, "tree {} does not exist", tree),
			Error::TreeExist { tree } => write!(f, "tree {} already exists", tree),
			Error::DirNoent { path } => write!(f, "directory does not exist: {}", path),
			Error::NotStartup => write!(f, "engine is not started"),
			Error::Content { message } => write!(f, "content resolver error: {}", message),
			Error::OsIo(e) => write!(f, "I/O error: {}", e),
			Error::OsSocket { message } => write!(f, "socket error: {}", message),
			Error::OsTimer => write!(f, "timer error"),
			Error::OsThread => write!(f, "thread spawn error"),
			Error::Timeout => write!(f, "request timed out"),
			Error::PermissionDeny => write!(f, "permission denied by peer"),
			Error::InvalidMsg { message } => write!(f, "invalid message: {}", message),
			Error::SyncdirMismatch => write!(f, "trees belong to different syncs"),
			Error::DeviceNoent { device } => write!(f, "device {} does not exist", device),
			Error::FileNoent { path } => write!(f, "file row does not exist: {}", path),
			Error::RootMoved { root } => write!(f, "tree root moved or vanished: {}", root),
			Error::InvalidKeyCode => write!(f, "invalid key code"),
			Error::MactokenMismatch => write!(f, "device token mismatch"),
			Error::Cancel => write!(f, "operation cancelled"),
			Error::General => write!(f, "operation failed"),
		}
	}
}

impl StdError for Error {}

impl From<io::Error> for Error {
	fn from(e: io::Error) -> Self {
		Error::OsIo(e)
	}
}

impl From<redb::Error> for Error {
	fn from(e: redb::Error) -> Self {
		Error::Content { message: e.to_string() }
	}
}

impl From<redb::DatabaseError> for Error {
	fn from(e: redb::DatabaseError) -> Self {
		Error::Content { message: e.to_string() }
	}
}

impl From<redb::TransactionError> for Error {
	fn from(e: redb::TransactionError) -> Self {
		Error::Content { message: e.to_string() }
	}
}

impl From<redb::TableError> for Error {
	fn from(e: redb::TableError) -> Self {
		Error::Content { message: e.to_string() }
	}
}

impl From<redb::StorageError> for Error {
	fn from(e: redb::StorageError) -> Self {
		Error::Content { message: e.to_string() }
	}
}

impl From<redb::CommitError> for Error {
	fn from(e: redb::CommitError) -> Self {
		Error::Content { message: e.to_string() }
	}
}

impl From<Box<bincode::ErrorKind>> for Error {
	fn from(e: Box<bincode::ErrorKind>) -> Self {
		Error::Content { message: format!("row encoding: {}", e) }
	}
}

impl Error {
	/// True when the error should be swallowed rather than reported
	pub fn is_cancel(&self) -> bool {
		matches!(self, Error::Cancel)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_display_carries_context() {
		let e = Error::TreeExist { tree: "t-1".into() };
		assert!(e.to_string().contains("t-1"));
	}

	#[test]
	fn test_io_conversion() {
		let io_err = io::Error::new(io::ErrorKind::NotFound, "gone");
		let e: Error = io_err.into();
		assert!(matches!(e, Error::OsIo(_)));
	}
}

// vim: ts=4
