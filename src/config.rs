//! Engine configuration
//!
//! A single `Config` struct is the source of truth. Values resolve through a
//! priority chain: built-in defaults, then the TOML config file, then
//! `TREESYNC_*` environment variables.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Default TCP port for the metadata route channel.
pub const DEFAULT_ROUTE_PORT: u16 = 8848;
/// Default TCP port for bulk data transfer.
pub const DEFAULT_DATA_PORT: u16 = 8849;
/// Rows per persisted batch in the scanner and the task runner.
pub const DEFAULT_BATCH_OPS: usize = 500;
/// Files per transfer batch handed to the transport.
pub const DEFAULT_TRANSFER_BATCH_FILES: usize = 100;
/// Bytes per transfer batch handed to the transport.
pub const DEFAULT_TRANSFER_BATCH_BYTES: i64 = 64 * 1024 * 1024;
/// Deadline for one outbound RPC.
pub const DEFAULT_RPC_TIMEOUT_SECS: u64 = 30;
/// Page size of the Find loop.
pub const DEFAULT_FIND_LIMIT: i64 = 500;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
	/// State directory: databases, tmp staging, config file
	pub data_dir: PathBuf,

	/// Port of the metadata route channel
	pub route_port: u16,

	/// Port of the bulk data channel
	pub data_port: u16,

	/// Worker pool sizes
	pub sync_workers: usize,
	pub refresh_workers: usize,
	pub outer_workers: usize,
	pub inner_workers: usize,

	/// Rows per persisted batch
	pub batch_ops: usize,

	/// Transfer batch caps
	pub transfer_batch_files: usize,
	pub transfer_batch_bytes: i64,

	/// Outbound RPC deadline, seconds
	pub rpc_timeout_secs: u64,

	/// Page size of the Find loop
	pub find_limit: i64,

	/// Human name of this device
	pub device_name: String,
}

impl Default for Config {
	fn default() -> Self {
		Config {
			data_dir: PathBuf::from(".treesync"),
			route_port: DEFAULT_ROUTE_PORT,
			data_port: DEFAULT_DATA_PORT,
			sync_workers: 2,
			refresh_workers: 2,
			outer_workers: 4,
			inner_workers: 2,
			batch_ops: DEFAULT_BATCH_OPS,
			transfer_batch_files: DEFAULT_TRANSFER_BATCH_FILES,
			transfer_batch_bytes: DEFAULT_TRANSFER_BATCH_BYTES,
			rpc_timeout_secs: DEFAULT_RPC_TIMEOUT_SECS,
			find_limit: DEFAULT_FIND_LIMIT,
			device_name: String::from("treesync-device"),
		}
	}
}

impl Config {
	/// Load configuration: defaults, overlaid by `<data_dir>/config.toml`
	/// when present, overlaid by environment variables.
	pub fn load(data_dir: &Path) -> Result<Self> {
		let mut config = Config { data_dir: data_dir.to_path_buf(), ..Config::default() };

		let file = data_dir.join("config.toml");
		if file.exists() {
			let text = std::fs::read_to_string(&file)?;
			config = toml::from_str(&text)
				.map_err(|e| Error::Content { message: format!("config.toml: {}", e) })?;
			config.data_dir = data_dir.to_path_buf();
		}

		config.apply_env();
		config.validate()?;
		Ok(config)
	}

	fn apply_env(&mut self) {
		if let Ok(v) = std::env::var("TREESYNC_ROUTE_PORT") {
			if let Ok(port) = v.parse() {
				self.route_port = port;
			}
		}
		if let Ok(v) = std::env::var("TREESYNC_DATA_PORT") {
			if let Ok(port) = v.parse() {
				self.data_port = port;
			}
		}
		if let Ok(v) = std::env::var("TREESYNC_DEVICE_NAME") {
			self.device_name = v;
		}
	}

	fn validate(&self) -> Result<()> {
		if self.route_port == 0 {
			return Err(Error::InvalidPort { port: 0 });
		}
		if self.data_port == 0 {
			return Err(Error::InvalidPort { port: 0 });
		}
		if self.batch_ops == 0 || self.transfer_batch_files == 0 {
			return Err(Error::Content { message: "batch caps must be positive".into() });
		}
		Ok(())
	}

	/// Directory for in-flight transfer staging.
	pub fn tmp_dir(&self) -> PathBuf {
		self.data_dir.join("tmp")
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_defaults_are_valid() {
		let config = Config::default();
		assert!(config.validate().is_ok());
		assert_eq!(config.batch_ops, DEFAULT_BATCH_OPS);
	}

	#[test]
	fn test_load_missing_file_uses_defaults() {
		let tmp = tempfile::TempDir::new().unwrap();
		let config = Config::load(tmp.path()).unwrap();
		assert_eq!(config.route_port, DEFAULT_ROUTE_PORT);
		assert_eq!(config.data_dir, tmp.path());
	}

	#[test]
	fn test_load_reads_toml() {
		let tmp = tempfile::TempDir::new().unwrap();
		std::fs::write(tmp.path().join("config.toml"), "route_port = 9999\n").unwrap();
		let config = Config::load(tmp.path()).unwrap();
		assert_eq!(config.route_port, 9999);
		// untouched fields keep defaults
		assert_eq!(config.data_port, DEFAULT_DATA_PORT);
	}
}

// vim: ts=4
