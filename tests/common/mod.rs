//! Two-device test harness
//!
//! Engines talk through an in-process loopback: the RPC collaborator calls
//! straight into the peer engine's handler, and the transport copies bytes
//! between the devices' tree roots. Fetch counters let tests assert that no
//! bytes moved when none should have.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use treesync::config::Config;
use treesync::engine::{self, Ctx, Engine};
use treesync::error::{Error, Result};
use treesync::model::{FileStat, SyncRow, Tree, MAIN_AUTHORITY};
use treesync::protocol::messages::{MsgBody, RemoteMeta};
use treesync::protocol::{
	EncryptLevel, Materialized, PeerRpc, RpcEnvelope, Transport, TransferFile,
};
use treesync::resolver::OnConflict;
use treesync::types::{BackupType, RootStatus, SyncType, TreeStatus};
use treesync::util;
use treesync::AbortFlag;

/// Shared fabric connecting loopback devices.
#[derive(Default)]
pub struct Network {
	peers: Mutex<HashMap<String, Arc<Ctx>>>,
	roots: Mutex<HashMap<String, PathBuf>>,
	pub fetched_files: Mutex<HashMap<String, usize>>,
	pub pushed_files: Mutex<Vec<(String, String)>>,
}

impl Network {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	fn peer(&self, endpoint: &str) -> Option<Arc<Ctx>> {
		let ip = endpoint.split(':').next().unwrap_or(endpoint);
		self.peers.lock().unwrap().get(ip).cloned()
	}

	pub fn fetched(&self, tree_uuid: &str) -> usize {
		self.fetched_files.lock().unwrap().get(tree_uuid).copied().unwrap_or(0)
	}
}

pub struct LoopbackTransport {
	net: Arc<Network>,
	/// Delay per fetch batch, to give cancellation tests a window
	pub fetch_delay: Duration,
}

#[async_trait]
impl Transport for LoopbackTransport {
	async fn fetch(
		&self,
		_endpoint: &str,
		tree_uuid: &str,
		files: &[TransferFile],
		tmp_dir: &Path,
		_cancel: AbortFlag,
	) -> Result<Vec<Materialized>> {
		if !self.fetch_delay.is_zero() {
			tokio::time::sleep(self.fetch_delay).await;
		}
		let root = self
			.net
			.roots
			.lock()
			.unwrap()
			.get(tree_uuid)
			.cloned()
			.ok_or(Error::TreeNoent { tree: tree_uuid.to_string() })?;
		let mut out = Vec::new();
		for file in files {
			let src = util::path_on_disk(&root, &file.path);
			let dst = tmp_dir.join(util::relative_part(&file.path));
			if let Some(parent) = dst.parent() {
				std::fs::create_dir_all(parent)?;
			}
			if std::fs::copy(&src, &dst).is_err() {
				continue;
			}
			out.push(Materialized {
				path: file.path.clone(),
				tmp_path: dst,
				length: file.length,
				sha1: file.sha1.clone(),
			});
		}
		let mut counts = self.net.fetched_files.lock().unwrap();
		*counts.entry(tree_uuid.to_string()).or_insert(0) += out.len();
		Ok(out)
	}

	async fn push(
		&self,
		_endpoint: &str,
		tree_uuid: &str,
		_tmp_dir: &Path,
		files: &[TransferFile],
		_cancel: AbortFlag,
	) -> Result<()> {
		let mut pushed = self.net.pushed_files.lock().unwrap();
		for file in files {
			pushed.push((tree_uuid.to_string(), file.path.clone()));
		}
		Ok(())
	}

	async fn upload_meta(
		&self,
		endpoint: &str,
		local_tree_uuid: &str,
		remote_tree_uuid: &str,
		meta: RemoteMeta,
	) -> Result<Vec<String>> {
		let peer = self.net.peer(endpoint).ok_or(Error::Timeout)?;
		let envelope = RpcEnvelope::new(
			"loopback",
			EncryptLevel::WithToken,
			MsgBody::FilterPushSyncMetaRequest {
				local_tree_uuid: local_tree_uuid.to_string(),
				remote_tree_uuid: remote_tree_uuid.to_string(),
				remote_meta: meta,
			},
		);
		match engine::handle_rpc(&peer, &envelope).await? {
			MsgBody::FilterPushSyncMetaResponse { wanted_paths } => Ok(wanted_paths),
			other => Err(Error::InvalidMsg { message: format!("{:?}", other) }),
		}
	}
}

pub struct LoopbackRpc {
	net: Arc<Network>,
}

#[async_trait]
impl PeerRpc for LoopbackRpc {
	async fn request(
		&self,
		endpoint: &str,
		envelope: RpcEnvelope,
		_timeout: Duration,
	) -> Result<RpcEnvelope> {
		let peer = self.net.peer(endpoint).ok_or(Error::Timeout)?;
		let body = match engine::handle_rpc(&peer, &envelope).await {
			Ok(body) => body,
			Err(e) => MsgBody::ErrorResponse {
				error: engine::wire_error(&e),
				message: e.to_string(),
			},
		};
		Ok(RpcEnvelope::new(&peer.device_uuid, envelope.head.level, body))
	}
}

pub struct TestDevice {
	pub name: String,
	pub engine: Engine,
	pub data: TempDir,
	pub root: TempDir,
	pub net: Arc<Network>,
}

impl TestDevice {
	pub fn ctx(&self) -> &Arc<Ctx> {
		self.engine.ctx()
	}

	pub fn write(&self, rel: &str, content: &[u8]) {
		let path = self.root.path().join(rel);
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent).unwrap();
		}
		std::fs::write(path, content).unwrap();
	}

	pub fn mkdir(&self, rel: &str) {
		std::fs::create_dir_all(self.root.path().join(rel)).unwrap();
	}

	pub fn remove(&self, rel: &str) {
		std::fs::remove_file(self.root.path().join(rel)).unwrap();
	}

	pub fn rename(&self, from: &str, to: &str) {
		std::fs::rename(self.root.path().join(from), self.root.path().join(to)).unwrap();
	}

	pub fn read(&self, rel: &str) -> Option<Vec<u8>> {
		std::fs::read(self.root.path().join(rel)).ok()
	}

	pub fn exists(&self, rel: &str) -> bool {
		self.root.path().join(rel).exists()
	}

	pub fn rows(&self, tree: &Tree) -> Vec<FileStat> {
		self.ctx().resolver.query_all(&tree.file_authority()).unwrap()
	}

	pub fn row(&self, tree: &Tree, path: &str) -> Option<FileStat> {
		self.ctx().resolver.get(&tree.file_authority(), path).unwrap()
	}
}

/// Start one engine with loopback collaborators registered under `name`.
pub fn new_device(name: &str, net: &Arc<Network>) -> TestDevice {
	let data = TempDir::new().unwrap();
	let root = TempDir::new().unwrap();
	let config = Config {
		data_dir: data.path().to_path_buf(),
		device_name: name.to_string(),
		transfer_batch_files: 25,
		..Config::default()
	};
	let transport = Arc::new(LoopbackTransport {
		net: net.clone(),
		fetch_delay: Duration::from_millis(1),
	});
	let rpc = Arc::new(LoopbackRpc { net: net.clone() });
	let engine = Engine::startup(config, transport, rpc).unwrap();
	net.peers.lock().unwrap().insert(name.to_string(), engine.ctx().clone());
	TestDevice { name: name.to_string(), engine, data, root, net: net.clone() }
}

fn next_id<I: Iterator<Item = i32>>(ids: I) -> i32 {
	ids.max().unwrap_or(0) + 1
}

/// Make `device` know a sync created elsewhere, keeping the shared uuid.
pub fn adopt_sync(device: &TestDevice, sync: &SyncRow) -> SyncRow {
	let resolver = &device.ctx().resolver;
	let syncs: Vec<SyncRow> = resolver.query_all(MAIN_AUTHORITY).unwrap();
	let mut row = sync.clone();
	row.id = next_id(syncs.iter().map(|s| s.id));
	resolver.insert(MAIN_AUTHORITY, &row, OnConflict::Abort).unwrap();
	row
}

/// Make `device` know a peer's tree as a remote tree of `sync_id`.
pub fn adopt_remote_tree(
	device: &TestDevice,
	peer_tree: &Tree,
	sync_id: i32,
	peer_device_uuid: &str,
) -> Tree {
	let resolver = &device.ctx().resolver;
	let devices: Vec<treesync::Device> = resolver.query_all(MAIN_AUTHORITY).unwrap();
	let device_id = devices
		.iter()
		.find(|d| d.uuid == peer_device_uuid)
		.map(|d| d.id)
		.expect("peer device must be registered first");
	let trees: Vec<Tree> = resolver.query_all(MAIN_AUTHORITY).unwrap();
	let row = Tree {
		id: next_id(trees.iter().map(|t| t.id)),
		uuid: peer_tree.uuid.clone(),
		root: String::new(),
		device_id,
		sync_id,
		status: TreeStatus::Normal,
		last_find: 0,
		backup_type: peer_tree.backup_type,
		is_enabled: true,
		root_status: RootStatus::Normal,
	};
	resolver.insert(MAIN_AUTHORITY, &row, OnConflict::Abort).unwrap();
	row
}

/// Two linked devices sharing one sync, each holding a replica slot for the
/// other's tree.
pub struct Linked {
	pub a: TestDevice,
	pub b: TestDevice,
	pub sync_a: SyncRow,
	pub sync_b: SyncRow,
	pub tree_a: Tree,
	pub tree_b: Tree,
	/// B's tree as seen from A
	pub b_on_a: Tree,
	/// A's tree as seen from B
	pub a_on_b: Tree,
}

impl Linked {
	/// Pull everything A has into B.
	pub async fn pull_into_b(&self) -> Result<()> {
		self.b.engine.sync_once(self.tree_b.id, self.a_on_b.id).await
	}

	/// Pull everything B has into A.
	pub async fn pull_into_a(&self) -> Result<()> {
		self.a.engine.sync_once(self.tree_a.id, self.b_on_a.id).await
	}

	/// One full bidirectional cycle with refreshes on both ends.
	pub async fn converge_cycle(&self) -> Result<()> {
		self.a.engine.refresh_now(self.tree_a.id)?;
		self.b.engine.refresh_now(self.tree_b.id)?;
		self.pull_into_b().await?;
		self.pull_into_a().await?;
		Ok(())
	}
}

/// Build a pair of devices joined into one sync.
pub fn link_two(net: &Arc<Network>, backup: Option<(BackupType, BackupType)>) -> Linked {
	let a = new_device("devA", net);
	let b = new_device("devB", net);
	let (backup_a, backup_b) = backup.unwrap_or((BackupType::None, BackupType::None));
	let stype = if backup.is_some() { SyncType::Backup } else { SyncType::Normal };

	let sync_a = a.engine.create_sync("shared", stype).unwrap();
	let sync_b = adopt_sync(&b, &sync_a);

	let tree_a = a
		.engine
		.create_tree(sync_a.id, a.root.path().to_str().unwrap(), backup_a)
		.unwrap();
	let tree_b = b
		.engine
		.create_tree(sync_b.id, b.root.path().to_str().unwrap(), backup_b)
		.unwrap();

	// introduce the devices to each other
	a.engine
		.on_peer_event(treesync::protocol::PeerEvent::Online {
			device_uuid: b.engine.device_uuid().to_string(),
			endpoint: String::from("devB"),
			is_ipv6: false,
			is_lan: true,
		})
		.unwrap();
	b.engine
		.on_peer_event(treesync::protocol::PeerEvent::Online {
			device_uuid: a.engine.device_uuid().to_string(),
			endpoint: String::from("devA"),
			is_ipv6: false,
			is_lan: true,
		})
		.unwrap();

	let b_on_a = adopt_remote_tree(&a, &tree_b, sync_a.id, b.engine.device_uuid());
	let a_on_b = adopt_remote_tree(&b, &tree_a, sync_b.id, a.engine.device_uuid());

	// register the data sources for the loopback transport
	{
		let mut roots = net.roots.lock().unwrap();
		roots.insert(tree_a.uuid.clone(), a.root.path().to_path_buf());
		roots.insert(tree_b.uuid.clone(), b.root.path().to_path_buf());
	}

	Linked { a, b, sync_a, sync_b, tree_a, tree_b, b_on_a, a_on_b }
}

// vim: ts=4
