//! Typed RPC message envelopes
//!
//! Envelopes are encoded with bincode for the wire. Every body variant has a
//! minimum acceptable encryption level; a receiver rejects any envelope whose
//! declared level is lower than the body demands.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::{FileStat, UnixAttr};
use crate::types::{FileStatus, FileType};
use crate::vclock::VectorClock;

/// Channel protection level of an envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EncryptLevel {
	None,
	/// Protected with the device-pair token
	WithToken,
	/// Protected with the account secret; only devices of the same account
	WithAccount,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MsgHead {
	pub device_uuid: String,
	pub level: EncryptLevel,
}

/// One file row on the wire. The vector clock travels in the sender's layout
/// and is remapped by the receiver via the uuid list of [`RemoteMeta`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileStatMsg {
	pub path: String,
	pub ftype: FileType,
	pub status: FileStatus,
	pub mtime: i64,
	pub length: i64,
	pub usn: i64,
	pub sha1: String,
	pub unix_attr: UnixAttr,
	pub android_attr: i32,
	pub win_attr: i32,
	pub vclock: Vec<i32>,
	pub modifier: String,
	pub time_stamp: i64,
}

impl FileStatMsg {
	/// Build the wire form of a row, expanding the split clock into the full
	/// vector in the owning tree's layout.
	pub fn from_stat(stat: &FileStat) -> Self {
		FileStatMsg {
			path: stat.path.clone(),
			ftype: stat.ftype,
			status: stat.status,
			mtime: stat.mtime,
			length: stat.length,
			usn: stat.usn,
			sha1: stat.sha1.clone(),
			unix_attr: stat.unix_attr,
			android_attr: stat.android_attr,
			win_attr: stat.win_attr,
			vclock: stat.vclock().as_slice().to_vec(),
			modifier: stat.modifier.clone(),
			time_stamp: stat.time_stamp,
		}
	}

	/// Store form of the wire row, with the clock already remapped into the
	/// receiving replica's layout.
	pub fn into_stat(self, mapped_vclock: &VectorClock) -> FileStat {
		let mut stat = FileStat {
			path: self.path,
			ftype: self.ftype,
			status: self.status,
			mtime: self.mtime,
			length: self.length,
			sha1: self.sha1,
			usn: self.usn,
			local_vclock: 0,
			remote_vclock: Vec::new(),
			unix_attr: self.unix_attr,
			android_attr: self.android_attr,
			win_attr: self.win_attr,
			modifier: self.modifier,
			time_stamp: self.time_stamp,
			alias: None,
		};
		stat.set_vclock(mapped_vclock);
		stat
	}
}

/// File table page of a Find exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMeta {
	/// The sender tree's clock layout: its own uuid first
	pub tree_uuids: Vec<String>,
	pub stats: Vec<FileStatMsg>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
	pub device_uuid: String,
	pub name: String,
	pub route_port: u16,
	pub data_port: u16,
	pub version: i32,
	pub is_mine: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupInfo {
	pub sync_uuid: String,
	pub root: String,
}

/// Coarse error class carried on the wire; the free-form message is for
/// logs only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireError {
	General,
	PermissionDeny,
	NotFound,
	InvalidMsg,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[allow(clippy::large_enum_variant)]
pub enum MsgBody {
	FindRequest {
		local_tree_uuid: String,
		remote_tree_uuid: String,
		sync_uuid: String,
		since: i64,
		limit: i64,
		is_list_sync: bool,
	},
	FindResponse {
		remote_meta: RemoteMeta,
	},
	FindFileRequest {
		local_tree_uuid: String,
		remote_tree_uuid: String,
		sync_uuid: String,
		path: String,
	},
	FindFileResponse {
		tree_uuids: Vec<String>,
		stat: Option<FileStatMsg>,
	},
	DeviceInfoRequest,
	DeviceInfoResponse {
		device: DeviceInfo,
	},
	PushDeviceInfoRequest {
		device: DeviceInfo,
	},
	PushDeviceInfoResponse,
	PushBackupInfoRequest {
		backup: BackupInfo,
	},
	PushBackupInfoResponse,
	ShareSyncRequest {
		sync_uuid: String,
		perm: i32,
	},
	ShareSyncResponse {
		accepted: bool,
	},
	DeviceMetaRequest,
	DeviceMetaResponse {
		device: DeviceInfo,
		sync_uuids: Vec<String>,
	},
	AnnounceExitRequest,
	AnnounceExitResponse,
	AnnounceTokenChangedRequest {
		new_token_hint: String,
	},
	AnnounceTokenChangedResponse,
	FilterPushSyncMetaRequest {
		local_tree_uuid: String,
		remote_tree_uuid: String,
		remote_meta: RemoteMeta,
	},
	FilterPushSyncMetaResponse {
		/// Paths the receiver wants bytes for
		wanted_paths: Vec<String>,
	},
	RemoveRemoteFileRequest {
		tree_uuid: String,
		path: String,
	},
	RemoveRemoteFileResponse {
		removed: bool,
	},
	ErrorResponse {
		error: WireError,
		message: String,
	},
}

impl MsgBody {
	/// Minimum channel protection the body demands.
	pub fn min_level(&self) -> EncryptLevel {
		match self {
			// discovery-adjacent chatter may run in the clear
			MsgBody::DeviceInfoRequest
			| MsgBody::DeviceInfoResponse { .. }
			| MsgBody::AnnounceExitRequest
			| MsgBody::AnnounceExitResponse
			| MsgBody::ErrorResponse { .. } => EncryptLevel::None,

			// mine-device-only administration
			MsgBody::DeviceMetaRequest
			| MsgBody::DeviceMetaResponse { .. }
			| MsgBody::PushBackupInfoRequest { .. }
			| MsgBody::PushBackupInfoResponse
			| MsgBody::AnnounceTokenChangedRequest { .. }
			| MsgBody::AnnounceTokenChangedResponse => EncryptLevel::WithAccount,

			// everything touching sync content needs the pair token
			_ => EncryptLevel::WithToken,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcEnvelope {
	pub head: MsgHead,
	pub body: MsgBody,
}

impl RpcEnvelope {
	pub fn new(device_uuid: &str, level: EncryptLevel, body: MsgBody) -> Self {
		RpcEnvelope { head: MsgHead { device_uuid: device_uuid.to_string(), level }, body }
	}

	/// Reject envelopes whose declared level is below what the body demands.
	pub fn check_level(&self) -> Result<()> {
		if self.head.level < self.body.min_level() {
			return Err(Error::InvalidMsg {
				message: format!(
					"encryption level {:?} below minimum {:?}",
					self.head.level,
					self.body.min_level()
				),
			});
		}
		Ok(())
	}

	pub fn encode(&self) -> Result<Vec<u8>> {
		Ok(bincode::serialize(self)?)
	}

	pub fn decode(bytes: &[u8]) -> Result<Self> {
		Ok(bincode::deserialize(bytes)?)
	}
}


// vim: ts=4
