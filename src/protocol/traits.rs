//! Collaborator interfaces consumed by the core
//!
//! Implementations live outside the engine (TLS transport, DHT/LAN
//! discovery). Tests plug in loopback implementations.

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::abort::AbortFlag;
use crate::error::Result;

use super::messages::{MsgBody, RpcEnvelope};

/// One file the transport should move.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferFile {
	/// Canonical row path within the tree
	pub path: String,
	pub length: i64,
	pub sha1: String,
}

/// A file the transport materialized into the staging directory.
#[derive(Debug, Clone, PartialEq)]
pub struct Materialized {
	pub path: String,
	pub tmp_path: PathBuf,
	pub length: i64,
	pub sha1: String,
}

/// Bulk data mover. Batches are packed by the implementation (TAR over TLS
/// in production); the engine only sees file lists and staging directories.
#[async_trait]
pub trait Transport: Send + Sync {
	/// Fetch `files` of `tree_uuid` from the peer into `tmp_dir`. Files that
	/// could not be fetched are simply absent from the result; the caller
	/// reconciles.
	async fn fetch(
		&self,
		endpoint: &str,
		tree_uuid: &str,
		files: &[TransferFile],
		tmp_dir: &Path,
		cancel: AbortFlag,
	) -> Result<Vec<Materialized>>;

	/// Push staged files of `tree_uuid` to the peer.
	async fn push(
		&self,
		endpoint: &str,
		tree_uuid: &str,
		tmp_dir: &Path,
		files: &[TransferFile],
		cancel: AbortFlag,
	) -> Result<()>;

	/// Meta-only push. The reply lists the paths the peer actually wants
	/// bytes for.
	async fn upload_meta(
		&self,
		endpoint: &str,
		local_tree_uuid: &str,
		remote_tree_uuid: &str,
		meta: super::messages::RemoteMeta,
	) -> Result<Vec<String>>;
}

/// Request/response channel to one peer.
#[async_trait]
pub trait PeerRpc: Send + Sync {
	/// Send `envelope` and await the reply within `timeout`. Implementations
	/// surface expiry as `Error::Timeout`.
	async fn request(
		&self,
		endpoint: &str,
		envelope: RpcEnvelope,
		timeout: Duration,
	) -> Result<RpcEnvelope>;
}

/// Events the discovery collaborator feeds into the core.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerEvent {
	Online { device_uuid: String, endpoint: String, is_ipv6: bool, is_lan: bool },
	Erase { device_id: i32 },
}

/// Control surface the core exposes towards discovery.
pub trait Discovery: Send + Sync {
	fn announce(&self);
	fn broadcast(&self);
	fn set_foreground(&self);
	fn set_background(&self);
}

/// Convenience for handlers answering an envelope with a generic error body.
pub fn error_body(message: &str) -> MsgBody {
	MsgBody::ErrorResponse {
		error: super::messages::WireError::General,
		message: message.to_string(),
	}
}

// vim: ts=4
