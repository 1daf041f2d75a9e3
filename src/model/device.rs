//! Device rows and their address book

use serde::{Deserialize, Serialize};

use crate::resolver::Record;
use crate::types::DeviceStatus;

/// One participating device. Row 0 is the local device; peers are created on
/// first contact and only ever logically deleted (marked offline).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
	pub id: i32,
	pub uuid: String,
	pub name: String,
	pub route_port: u16,
	pub data_port: u16,
	pub status: DeviceStatus,
	pub dtype: i32,
	pub is_mine: bool,
	pub version: i32,
	pub backup_root: Option<String>,
	pub backup_dst_root: Option<String>,
}

impl Record for Device {
	const TABLE: &'static str = "device";

	fn key(&self) -> String {
		device_key(self.id)
	}
}

pub fn device_key(id: i32) -> String {
	format!("{:010}", id)
}

impl Device {
	pub fn is_local(&self) -> bool {
		self.id == super::LOCAL_DEVICE_ID
	}

	pub fn is_online(&self) -> bool {
		self.status == DeviceStatus::Online
	}
}

/// A known endpoint of a device. `no_response` is set when an RPC to this
/// address times out; discovery evicts such addresses.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceIp {
	pub device_id: i32,
	pub ip: String,
	pub is_ipv6: bool,
	pub is_lan: bool,
	pub last_seen: i64,
	pub no_response: bool,
}

impl Record for DeviceIp {
	const TABLE: &'static str = "device_ip";

	fn key(&self) -> String {
		format!("{:010}:{}", self.device_id, self.ip)
	}
}

/// Statically configured peer address, stored on behalf of the discovery
/// collaborator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StaticPeer {
	pub ip: String,
	pub port: u16,
}

impl Record for StaticPeer {
	const TABLE: &'static str = "static_peer";

	fn key(&self) -> String {
		format!("{}:{}", self.ip, self.port)
	}
}

// vim: ts=4
