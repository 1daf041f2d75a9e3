//! Engine assembly
//!
//! The `Engine` owns the explicit context every component works against: the
//! content resolver, the collaborators, the router and the background tasks.
//! There are no process-wide singletons; tests build isolated engines per
//! case.

use async_trait::async_trait;
use std::collections::HashSet;
use std::path::Path;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;
use uuid::Uuid;

use crate::abort::AbortRegistry;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::logging::*;
use crate::model::{
	device_key, sync_key, sync_mode_key, tree_authority, tree_key, Device, DeviceIp, FileStat,
	SyncListRow, SyncModeRow, SyncRow, Tree, UsnCounter, LOCAL_DEVICE_ID, MAIN_AUTHORITY,
};
use crate::protocol::messages::{DeviceInfo, MsgBody, RemoteMeta, WireError};
use crate::protocol::{
	Discovery, EncryptLevel, FileStatMsg, PeerEvent, PeerRpc, RpcEnvelope, Transport,
};
use crate::query_cache::{CacheSnapshot, QueryCache};
use crate::resolver::{ContentResolver, OnConflict, OperationList, Record, TableProvider};
use crate::router::{self, InnerJob, OuterJob, PoolSizes, RouterHandle, WorkHandler};
use crate::scanner::TreeScanner;
use crate::status::{StatusManager, TreePairSnapshot};
use crate::task::TaskIo;
use crate::types::{
	BackupType, DeviceStatus, FileStatus, RootStatus, SyncMode, SyncPerm, SyncStatus, SyncType,
	TreeStatus,
};
use crate::updater::SyncUpdater;
use crate::util;
use crate::vclock::{layout_for, remap, VectorClock};

const MAIN_TABLES: &[&str] = &["device", "device_ip", "static_peer", "sync", "tree", "sync_mode", "sync_list"];
const TREE_TABLES: &[&str] = &["file", "meta"];

/// Shared context handed to every component.
pub struct Ctx {
	pub config: Config,
	pub resolver: Arc<ContentResolver>,
	pub transport: Arc<dyn Transport>,
	pub rpc: Arc<dyn PeerRpc>,
	pub abort: AbortRegistry,
	pub status: Arc<StatusManager>,
	pub cache: Arc<QueryCache>,
	pub device_uuid: String,
	/// Pairs currently being applied; try-lock only
	pair_locks: Mutex<HashSet<(i32, i32)>>,
	/// Bound after the router is spawned
	router: OnceLock<RouterHandle>,
}

impl Ctx {
	fn try_lock_pair(&self, local: i32, remote: i32) -> bool {
		self.pair_locks.lock().unwrap().insert((local, remote))
	}

	fn unlock_pair(&self, local: i32, remote: i32) {
		self.pair_locks.lock().unwrap().remove(&(local, remote));
	}

	pub fn router(&self) -> Option<&RouterHandle> {
		self.router.get()
	}
}

pub struct Engine {
	ctx: Arc<Ctx>,
	router: RouterHandle,
	background: Vec<tokio::task::JoinHandle<()>>,
	discovery: Option<Arc<dyn Discovery>>,
}

impl Engine {
	/// Bring the engine up: open storage, ensure the local device row,
	/// register tree providers, start the router and background tasks.
	pub fn startup(
		config: Config,
		transport: Arc<dyn Transport>,
		rpc: Arc<dyn PeerRpc>,
	) -> Result<Engine> {
		std::fs::create_dir_all(&config.data_dir)?;
		std::fs::create_dir_all(config.tmp_dir())?;

		let resolver = Arc::new(ContentResolver::new());
		let main = TableProvider::open(&config.data_dir.join("main.redb"), MAIN_TABLES)?;
		resolver.register_provider(MAIN_AUTHORITY, main);

		// local device row, created on first start
		let device_uuid = match resolver.get::<Device>(MAIN_AUTHORITY, &device_key(LOCAL_DEVICE_ID))? {
			Some(device) => device.uuid,
			None => {
				let device = Device {
					id: LOCAL_DEVICE_ID,
					uuid: Uuid::new_v4().to_string(),
					name: config.device_name.clone(),
					route_port: config.route_port,
					data_port: config.data_port,
					status: DeviceStatus::Online,
					dtype: 0,
					is_mine: true,
					version: 1,
					backup_root: None,
					backup_dst_root: None,
				};
				resolver.insert(MAIN_AUTHORITY, &device, OnConflict::Abort)?;
				device.uuid
			}
		};

		// one provider per known tree
		let trees: Vec<Tree> = resolver.query_all(MAIN_AUTHORITY)?;
		for tree in &trees {
			let provider =
				TableProvider::open(&tree_db_path(&config, &tree.uuid), TREE_TABLES)?;
			resolver.register_provider(&tree_authority(&tree.uuid), provider);
		}

		let status = StatusManager::new();
		let cache = QueryCache::new();
		let ctx = Arc::new(Ctx {
			config,
			resolver: resolver.clone(),
			transport,
			rpc,
			abort: AbortRegistry::new(),
			status: status.clone(),
			cache: cache.clone(),
			device_uuid,
			pair_locks: Mutex::new(HashSet::new()),
			router: OnceLock::new(),
		});

		let sizes = PoolSizes {
			refresh: ctx.config.refresh_workers,
			sync: ctx.config.sync_workers,
			outer: ctx.config.outer_workers,
			inner: ctx.config.inner_workers,
		};
		let handler = Arc::new(EngineHandler { ctx: ctx.clone() });
		let (router, router_join) = router::spawn(handler, sizes);
		let _ = ctx.router.set(router.clone());

		let mut background = vec![router_join];
		background.push(status.spawn_ticker());
		background.push(cache.spawn(resolver));
		cache.recompute(&ctx.resolver)?;

		info!("engine up, device {}", ctx.device_uuid);
		Ok(Engine { ctx, router, background, discovery: None })
	}

	/// Hook up the discovery collaborator and announce this device.
	pub fn attach_discovery(&mut self, discovery: Arc<dyn Discovery>) {
		discovery.announce();
		self.discovery = Some(discovery);
	}

	/// The app came to the foreground: speed discovery up.
	pub fn set_foreground(&self) {
		if let Some(discovery) = &self.discovery {
			discovery.set_foreground();
			discovery.broadcast();
		}
	}

	pub fn set_background(&self) {
		if let Some(discovery) = &self.discovery {
			discovery.set_background();
		}
	}

	/// Stop accepting work and wind the background tasks down. Partial work
	/// already committed is retained.
	pub fn shutdown(&mut self) {
		self.ctx.abort.abort_all();
		self.router.shutdown();
		for task in self.background.drain(..) {
			task.abort();
		}
		info!("engine down");
	}

	pub fn ctx(&self) -> &Arc<Ctx> {
		&self.ctx
	}

	pub fn router(&self) -> &RouterHandle {
		&self.router
	}

	pub fn device_uuid(&self) -> &str {
		&self.ctx.device_uuid
	}

	// ------------------------------------------------------------------
	// administration
	// ------------------------------------------------------------------

	pub fn create_sync(&self, name: &str, stype: SyncType) -> Result<SyncRow> {
		let syncs: Vec<SyncRow> = self.ctx.resolver.query_all(MAIN_AUTHORITY)?;
		if syncs.iter().any(|s| s.name == name && s.status == SyncStatus::Normal) {
			return Err(Error::SyncExist { sync: name.to_string() });
		}
		let sync = SyncRow {
			id: next_id(syncs.iter().map(|s| s.id)),
			uuid: Uuid::new_v4().to_string(),
			name: name.to_string(),
			last_sync: 0,
			stype,
			status: SyncStatus::Normal,
			creator_device_id: LOCAL_DEVICE_ID,
			perm: SyncPerm::Rdwr,
			restore_share_perm: SyncPerm::Rdwr,
		};
		self.ctx.resolver.insert(MAIN_AUTHORITY, &sync, OnConflict::Abort)?;
		Ok(sync)
	}

	pub fn create_tree(&self, sync_id: i32, root: &str, backup_type: BackupType) -> Result<Tree> {
		let sync: SyncRow = self
			.ctx
			.resolver
			.get(MAIN_AUTHORITY, &sync_key(sync_id))?
			.ok_or(Error::SyncNoent { sync: sync_id.to_string() })?;
		if !sync.is_normal() {
			return Err(Error::SyncNoent { sync: sync.uuid });
		}
		let root_path = Path::new(root);
		if !root_path.is_absolute() {
			return Err(Error::InvalidPath { path: root.to_string() });
		}
		if !root_path.is_dir() {
			return Err(Error::DirNoent { path: root.to_string() });
		}

		let trees: Vec<Tree> = self.ctx.resolver.query_all(MAIN_AUTHORITY)?;
		for existing in trees.iter().filter(|t| t.is_local() && t.is_normal()) {
			let existing_root = Path::new(&existing.root);
			if existing_root == root_path {
				return Err(Error::TreeExist { tree: existing.uuid.clone() });
			}
			if root_path.starts_with(existing_root) || existing_root.starts_with(root_path) {
				return Err(Error::NestedTree {
					root: root.to_string(),
					other: existing.root.clone(),
				});
			}
		}

		let tree = Tree {
			id: next_id(trees.iter().map(|t| t.id)),
			uuid: Uuid::new_v4().to_string(),
			root: root.to_string(),
			device_id: LOCAL_DEVICE_ID,
			sync_id,
			status: TreeStatus::Normal,
			last_find: 0,
			backup_type,
			is_enabled: true,
			root_status: RootStatus::Normal,
		};
		let provider =
			TableProvider::open(&tree_db_path(&self.ctx.config, &tree.uuid), TREE_TABLES)?;
		self.ctx.resolver.register_provider(&tree.file_authority(), provider);
		self.ctx.resolver.insert(MAIN_AUTHORITY, &tree, OnConflict::Abort)?;
		Ok(tree)
	}

	pub fn list_syncs(&self) -> Arc<CacheSnapshot> {
		self.ctx.cache.snapshot()
	}

	pub fn refresh(&self, tree_id: i32) {
		self.router.refresh(tree_id);
	}

	/// Run one refresh synchronously, bypassing the router queue.
	pub fn refresh_now(&self, tree_id: i32) -> Result<crate::scanner::ScanSummary> {
		run_refresh(&self.ctx, tree_id)
	}

	pub fn sync_now(&self, local_tree_id: i32, remote_tree_id: i32, is_manual: bool) {
		self.router.sync(local_tree_id, remote_tree_id, is_manual);
	}

	/// Run one full sync cycle for a pair and wait for it, bypassing the
	/// router queue and the per-pair mode setting. Waits for the pair lock
	/// instead of dropping like the routed path does.
	pub async fn sync_once(&self, local_tree_id: i32, remote_tree_id: i32) -> Result<()> {
		run_sync_locked(&self.ctx, local_tree_id, remote_tree_id, true, true).await
	}

	pub fn refresh_all(&self) {
		self.router.inner(InnerJob::RefreshAll);
	}

	/// Queue syncs against every tree of one device, e.g. after discovery
	/// reports it online.
	pub fn sync_with_device(&self, device_id: i32) {
		self.router.inner(InnerJob::SyncWithDevice { device_id });
	}

	pub fn status(&self) -> Vec<TreePairSnapshot> {
		self.ctx.status.snapshots()
	}

	/// Replace a tree's include list (favorites). An empty list syncs the
	/// whole tree.
	pub fn set_sync_list(&self, tree_id: i32, prefixes: &[String]) -> Result<()> {
		let rows: Vec<SyncListRow> = self.ctx.resolver.query_all(MAIN_AUTHORITY)?;
		let mut ops = OperationList::new();
		for row in rows.iter().filter(|r| r.tree_id == tree_id) {
			ops.delete::<SyncListRow>(&row.key());
		}
		for prefix in prefixes {
			let prefix = util::normalize_path(prefix)?;
			ops.insert(&SyncListRow { tree_id, prefix }, OnConflict::Replace)?;
		}
		self.ctx.resolver.apply_batch(MAIN_AUTHORITY, ops)?;
		Ok(())
	}

	/// Physically drop tombstones every peer has observed. `min_peer_usn` is
	/// the minimum over all peers of their highest observed USN for this
	/// tree; rows newer than that must survive.
	pub fn gc_tombstones(&self, tree_id: i32, min_peer_usn: i64) -> Result<usize> {
		let tree: Tree = self
			.ctx
			.resolver
			.get(MAIN_AUTHORITY, &tree_key(tree_id))?
			.ok_or(Error::TreeNoent { tree: tree_id.to_string() })?;
		let authority = tree.file_authority();
		let rows: Vec<FileStat> = self.ctx.resolver.query_all(&authority)?;
		let mut ops = OperationList::new();
		for row in rows {
			if row.status == FileStatus::Removed && row.usn <= min_peer_usn {
				ops.delete::<FileStat>(&row.path);
			}
		}
		self.ctx.resolver.apply_batch(&authority, ops)
	}

	// ------------------------------------------------------------------
	// discovery callbacks
	// ------------------------------------------------------------------

	pub fn on_peer_event(&self, event: PeerEvent) -> Result<()> {
		match event {
			PeerEvent::Online { device_uuid, endpoint, is_ipv6, is_lan } => {
				let devices: Vec<Device> = self.ctx.resolver.query_all(MAIN_AUTHORITY)?;
				let device = match devices.iter().find(|d| d.uuid == device_uuid) {
					Some(device) => {
						let mut device = device.clone();
						device.status = DeviceStatus::Online;
						self.ctx.resolver.update(MAIN_AUTHORITY, &device)?;
						device
					}
					None => {
						let device = Device {
							id: next_id(devices.iter().map(|d| d.id)),
							uuid: device_uuid,
							name: String::new(),
							route_port: 0,
							data_port: 0,
							status: DeviceStatus::Online,
							dtype: 0,
							is_mine: false,
							version: 0,
							backup_root: None,
							backup_dst_root: None,
						};
						self.ctx.resolver.insert(MAIN_AUTHORITY, &device, OnConflict::Abort)?;
						device
					}
				};
				let ip = DeviceIp {
					device_id: device.id,
					ip: endpoint,
					is_ipv6,
					is_lan,
					last_seen: util::os_time_s(),
					no_response: false,
				};
				self.ctx.resolver.insert(MAIN_AUTHORITY, &ip, OnConflict::Replace)?;
			}
			PeerEvent::Erase { device_id } => {
				if let Some(mut device) =
					self.ctx.resolver.get::<Device>(MAIN_AUTHORITY, &device_key(device_id))?
				{
					device.status = DeviceStatus::Offline;
					self.ctx.resolver.update(MAIN_AUTHORITY, &device)?;
				}
			}
		}
		Ok(())
	}

	/// Entry point for an incoming peer RPC (wired by the server surface).
	pub async fn dispatch_rpc(&self, envelope: RpcEnvelope) -> Result<RpcEnvelope> {
		self.router
			.outer(envelope)
			.await
			.map_err(|_| Error::General)
	}
}

fn tree_db_path(config: &Config, tree_uuid: &str) -> std::path::PathBuf {
	config.data_dir.join("trees").join(format!("{}.redb", tree_uuid))
}

/// Open and register the storage of a tree's file table if it is not there
/// yet (replicas materialize lazily on first contact).
pub fn ensure_tree_provider(ctx: &Ctx, tree: &Tree) -> Result<()> {
	let authority = tree.file_authority();
	if !ctx.resolver.has_provider(&authority) {
		let provider = TableProvider::open(&tree_db_path(&ctx.config, &tree.uuid), TREE_TABLES)?;
		ctx.resolver.register_provider(&authority, provider);
	}
	Ok(())
}

fn next_id<I: Iterator<Item = i32>>(ids: I) -> i32 {
	ids.max().unwrap_or(0) + 1
}

/// Remote metadata ingestion, shared by the Find loop and the push handler.
///
/// Rows land in this device's replica of the peer tree, clocks remapped from
/// the sender's layout into the replica's canonical one. A row whose USN is
/// not newer than what the replica already has is skipped, which makes
/// re-application of the same page a no-op.
pub fn store_remote_meta(
	ctx: &Ctx,
	remote_tree: &Tree,
	meta: &RemoteMeta,
) -> Result<usize> {
	// learn clock slots for trees we have never seen
	let mut trees: Vec<Tree> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
	let known: HashSet<String> = trees.iter().map(|t| t.uuid.clone()).collect();
	for uuid in &meta.tree_uuids {
		if !known.contains(uuid) {
			let placeholder = Tree {
				id: next_id(trees.iter().map(|t| t.id)),
				uuid: uuid.clone(),
				root: String::new(),
				device_id: -1,
				sync_id: remote_tree.sync_id,
				status: TreeStatus::VclockOnly,
				last_find: 0,
				backup_type: BackupType::None,
				is_enabled: false,
				root_status: RootStatus::Normal,
			};
			ctx.resolver.insert(MAIN_AUTHORITY, &placeholder, OnConflict::Abort)?;
			trees.push(placeholder);
		}
	}

	let sync_uuids: Vec<String> = trees
		.iter()
		.filter(|t| t.sync_id == remote_tree.sync_id && t.status != TreeStatus::Removed)
		.map(|t| t.uuid.clone())
		.collect();
	let replica_layout = layout_for(&remote_tree.uuid, &sync_uuids);

	ensure_tree_provider(ctx, remote_tree)?;
	let authority = remote_tree.file_authority();

	let mut ops = OperationList::new();
	let mut written = 0usize;
	for stat_msg in &meta.stats {
		let existing: Option<FileStat> = ctx.resolver.get(&authority, &stat_msg.path)?;
		if let Some(existing) = &existing {
			if existing.usn >= stat_msg.usn {
				continue;
			}
		}
		let incoming = VectorClock::from_vec(stat_msg.vclock.clone());
		let mapped = remap(&incoming, &meta.tree_uuids, &replica_layout);
		let row = stat_msg.clone().into_stat(&mapped);
		ops.insert(&row, OnConflict::Replace)?;
		written += 1;
		if ops.len() >= ctx.config.batch_ops {
			ctx.resolver.apply_batch(&authority, std::mem::take(&mut ops))?;
		}
	}
	ctx.resolver.apply_batch(&authority, ops)?;
	Ok(written)
}

/// Find watermark of a replica: the highest USN confirmed through paging.
/// Rows that arrived out of band (pushes) do not advance it, so no page can
/// be skipped.
fn replica_find_watermark(ctx: &Ctx, tree: &Tree) -> Result<i64> {
	let authority = tree.file_authority();
	if !ctx.resolver.has_provider(&authority) {
		return Ok(0);
	}
	if let Some(counter) = ctx.resolver.get::<UsnCounter>(&authority, UsnCounter::KEY)? {
		return Ok(counter.value);
	}
	Ok(0)
}

/// USN allocator position of a local tree.
fn local_tree_max_usn(ctx: &Ctx, tree: &Tree) -> Result<i64> {
	let authority = tree.file_authority();
	if let Some(counter) = ctx.resolver.get::<UsnCounter>(&authority, UsnCounter::KEY)? {
		return Ok(counter.value);
	}
	let rows: Vec<FileStat> = ctx.resolver.query_all(&authority)?;
	Ok(rows.iter().map(|s| s.usn).max().unwrap_or(0))
}

/// Preferred endpoint of a device, skipping addresses marked unresponsive.
fn device_endpoint(ctx: &Ctx, device: &Device) -> Result<Option<String>> {
	let ips: Vec<DeviceIp> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
	let mut candidates: Vec<&DeviceIp> =
		ips.iter().filter(|ip| ip.device_id == device.id && !ip.no_response).collect();
	candidates.sort_by_key(|ip| std::cmp::Reverse(ip.last_seen));
	Ok(candidates.first().map(|ip| format!("{}:{}", ip.ip, device.route_port)))
}

fn mark_no_response(ctx: &Ctx, device_id: i32, endpoint: &str) {
	let ip_part = endpoint.rsplit_once(':').map(|(ip, _)| ip).unwrap_or(endpoint);
	let ips: Vec<DeviceIp> = match ctx.resolver.query_all(MAIN_AUTHORITY) {
		Ok(ips) => ips,
		Err(_) => return,
	};
	for ip in ips {
		if ip.device_id == device_id && ip.ip == ip_part {
			let mut ip = ip;
			ip.no_response = true;
			let _ = ctx.resolver.insert(MAIN_AUTHORITY, &ip, OnConflict::Replace);
		}
	}
}

// ----------------------------------------------------------------------
// routed work
// ----------------------------------------------------------------------

struct EngineHandler {
	ctx: Arc<Ctx>,
}

#[async_trait]
impl WorkHandler for EngineHandler {
	async fn handle_refresh(&self, tree_id: i32) {
		let ctx = self.ctx.clone();
		let result =
			tokio::task::spawn_blocking(move || run_refresh(&ctx, tree_id)).await;
		match result {
			Ok(Ok(_)) => {}
			Ok(Err(e)) if e.is_cancel() => {}
			Ok(Err(e)) => warn!("refresh tree {}: {}", tree_id, e),
			Err(e) => warn!("refresh tree {}: join error {}", tree_id, e),
		}
	}

	async fn handle_sync(&self, local_tree_id: i32, remote_tree_id: i32, is_manual: bool) {
		match run_sync(&self.ctx, local_tree_id, remote_tree_id, is_manual).await {
			Ok(()) => {}
			Err(e) if e.is_cancel() => {}
			Err(e) => warn!("sync ({}, {}): {}", local_tree_id, remote_tree_id, e),
		}
	}

	async fn handle_outer(&self, job: OuterJob) {
		let reply_body = match handle_rpc(&self.ctx, &job.envelope).await {
			Ok(body) => body,
			Err(e) => MsgBody::ErrorResponse { error: wire_error(&e), message: e.to_string() },
		};
		let reply =
			RpcEnvelope::new(&self.ctx.device_uuid, job.envelope.head.level, reply_body);
		let _ = job.reply.send(reply);
	}

	async fn handle_inner(&self, job: InnerJob) {
		if let Err(e) = self.run_inner(job).await {
			warn!("inner job failed: {}", e);
		}
	}
}

impl EngineHandler {
	async fn run_inner(&self, job: InnerJob) -> Result<()> {
		let ctx = &self.ctx;
		match job {
			InnerJob::RefreshAll => {
				let trees: Vec<Tree> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
				if let Some(router) = ctx.router() {
					for tree in
						trees.iter().filter(|t| t.is_local() && t.is_normal() && t.is_enabled)
					{
						router.refresh(tree.id);
					}
				}
			}
			InnerJob::SyncWithDevice { device_id } => {
				let trees: Vec<Tree> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
				if let Some(router) = ctx.router() {
					for remote in
						trees.iter().filter(|t| t.device_id == device_id && t.is_normal())
					{
						for local in trees.iter().filter(|t| {
							t.is_local() && t.is_normal() && t.sync_id == remote.sync_id
						}) {
							router.sync(local.id, remote.id, false);
						}
					}
				}
			}
		}
		Ok(())
	}
}

/// One synchronous refresh of a local tree.
fn run_refresh(ctx: &Ctx, tree_id: i32) -> Result<crate::scanner::ScanSummary> {
	let tree: Tree = ctx
		.resolver
		.get(MAIN_AUTHORITY, &tree_key(tree_id))?
		.ok_or(Error::TreeNoent { tree: tree_id.to_string() })?;
	let devices: Vec<Device> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
	let modifier = devices
		.iter()
		.find(|d| d.id == LOCAL_DEVICE_ID)
		.map(|d| d.name.clone())
		.unwrap_or_default();
	let scanner = TreeScanner::new(
		ctx.resolver.clone(),
		ctx.abort.clone(),
		ctx.config.batch_ops,
		&modifier,
	);
	scanner.refresh(&tree)
}

struct PairLockGuard<'a> {
	ctx: &'a Ctx,
	local: i32,
	remote: i32,
}

impl Drop for PairLockGuard<'_> {
	fn drop(&mut self) {
		self.ctx.unlock_pair(self.local, self.remote);
	}
}

/// One full sync cycle for a pair. Fails with `General` when another worker
/// already owns the pair; the scheduler re-dispatches later.
async fn run_sync(
	ctx: &Arc<Ctx>,
	local_tree_id: i32,
	remote_tree_id: i32,
	is_manual: bool,
) -> Result<()> {
	run_sync_locked(ctx, local_tree_id, remote_tree_id, is_manual, false).await
}

async fn run_sync_locked(
	ctx: &Arc<Ctx>,
	local_tree_id: i32,
	remote_tree_id: i32,
	is_manual: bool,
	wait_for_pair: bool,
) -> Result<()> {
	while !ctx.try_lock_pair(local_tree_id, remote_tree_id) {
		if !wait_for_pair {
			debug!("pair ({}, {}) already running, dropped", local_tree_id, remote_tree_id);
			return Err(Error::General);
		}
		tokio::time::sleep(Duration::from_millis(10)).await;
	}
	let _guard = PairLockGuard { ctx: ctx.as_ref(), local: local_tree_id, remote: remote_tree_id };

	let updater = SyncUpdater::new(&ctx.resolver, local_tree_id, remote_tree_id)?;
	if !updater.local_tree().is_enabled {
		return Ok(());
	}
	ensure_tree_provider(ctx, updater.remote_tree())?;
	if !is_manual && !auto_sync_enabled(ctx, updater.local_tree(), remote_tree_id)? {
		return Ok(());
	}

	let remote_device: Device = ctx
		.resolver
		.get(MAIN_AUTHORITY, &device_key(updater.remote_tree().device_id))?
		.ok_or(Error::DeviceNoent { device: updater.remote_tree().device_id.to_string() })?;
	let endpoint = if remote_device.is_local() {
		String::from("local")
	} else {
		if !remote_device.is_online() {
			debug!("device {} offline, skipping sync", remote_device.uuid);
			return Ok(());
		}
		match device_endpoint(ctx, &remote_device)? {
			Some(endpoint) => endpoint,
			None => return Err(Error::DeviceNoent { device: remote_device.uuid }),
		}
	};

	// refresh our replica of the peer tree first
	if !remote_device.is_local() {
		update_remote_meta(ctx, &updater, &remote_device, &endpoint).await?;
	}

	let mut task = updater.build_task(&ctx.resolver, &ctx.device_uuid, &ctx.abort)?;
	let pair_stat = ctx.status.pair(local_tree_id, remote_tree_id);
	updater.publish_counters(&task, &pair_stat);

	let io = TaskIo {
		resolver: &ctx.resolver,
		transport: ctx.transport.as_ref(),
		endpoint,
		tmp_root: ctx.config.tmp_dir(),
		abort: &ctx.abort,
		status: pair_stat,
		batch_cap: ctx.config.batch_ops,
		transfer_batch_files: ctx.config.transfer_batch_files,
		transfer_batch_bytes: ctx.config.transfer_batch_bytes,
		rpc_timeout: Duration::from_secs(ctx.config.rpc_timeout_secs),
	};
	task.run(&io).await?;

	// remember when this sync last converged
	let mut sync = updater.sync().clone();
	sync.last_sync = util::os_time_s();
	ctx.resolver.update(MAIN_AUTHORITY, &sync)?;
	Ok(())
}

/// Page the peer's file table into our replica via Find.
async fn update_remote_meta(
	ctx: &Ctx,
	updater: &SyncUpdater,
	remote_device: &Device,
	endpoint: &str,
) -> Result<()> {
	let remote_tree = updater.remote_tree();
	let mut since = replica_find_watermark(ctx, remote_tree)?;
	let timeout = Duration::from_secs(ctx.config.rpc_timeout_secs);

	loop {
		if ctx.abort.pair_aborted(updater.local_tree().id, remote_tree.id) {
			return Err(Error::Cancel);
		}
		let request = RpcEnvelope::new(
			&ctx.device_uuid,
			EncryptLevel::WithToken,
			MsgBody::FindRequest {
				local_tree_uuid: updater.local_tree().uuid.clone(),
				remote_tree_uuid: remote_tree.uuid.clone(),
				sync_uuid: updater.sync().uuid.clone(),
				since,
				limit: ctx.config.find_limit,
				is_list_sync: false,
			},
		);
		let response = match ctx.rpc.request(endpoint, request, timeout).await {
			Ok(response) => response,
			Err(Error::Timeout) => {
				mark_no_response(ctx, remote_device.id, endpoint);
				return Err(Error::Timeout);
			}
			Err(e) => return Err(e),
		};
		let meta = match response.body {
			MsgBody::FindResponse { remote_meta } => remote_meta,
			MsgBody::ErrorResponse { error: WireError::PermissionDeny, .. } => {
				// a denial on a token-protected exchange means the peer
				// rotated its token: stop emitting until an admin repairs it
				let mut sync = updater.sync().clone();
				if sync.perm != SyncPerm::TokenDiff {
					sync.perm = SyncPerm::TokenDiff;
					ctx.resolver.update(MAIN_AUTHORITY, &sync)?;
				}
				return Err(Error::PermissionDeny);
			}
			MsgBody::ErrorResponse { message, .. } => {
				return Err(Error::InvalidMsg { message })
			}
			_ => {
				return Err(Error::InvalidMsg {
					message: String::from("unexpected find reply"),
				})
			}
		};
		if meta.stats.is_empty() {
			break;
		}
		since = meta.stats.last().map(|s| s.usn).unwrap_or(since);
		let page_len = meta.stats.len() as i64;
		store_remote_meta(ctx, remote_tree, &meta)?;
		// only a confirmed page moves the watermark forward
		ctx.resolver.insert(
			&remote_tree.file_authority(),
			&UsnCounter { value: since },
			OnConflict::Replace,
		)?;
		if page_len < ctx.config.find_limit {
			break;
		}
	}

	let mut tree = remote_tree.clone();
	tree.last_find = util::os_time_s();
	ctx.resolver.update(MAIN_AUTHORITY, &tree)?;
	Ok(())
}

fn auto_sync_enabled(ctx: &Ctx, local_tree: &Tree, remote_tree_id: i32) -> Result<bool> {
	if local_tree.backup_type == BackupType::Dst {
		return Ok(false);
	}
	let mode: Option<SyncModeRow> =
		ctx.resolver.get(MAIN_AUTHORITY, &sync_mode_key(local_tree.id, remote_tree_id))?;
	Ok(mode.map(|m| m.mode == SyncMode::Auto).unwrap_or(true))
}

// ----------------------------------------------------------------------
// peer RPC handlers
// ----------------------------------------------------------------------

/// Answer one peer envelope. Encryption level is checked before any state is
/// touched; a token-level violation maps to `PermissionDeny` at the caller.
pub async fn handle_rpc(ctx: &Ctx, envelope: &RpcEnvelope) -> Result<MsgBody> {
	envelope.check_level()?;
	match &envelope.body {
		MsgBody::FindRequest { remote_tree_uuid, since, limit, .. } => {
			handle_find(ctx, remote_tree_uuid, *since, *limit)
		}
		MsgBody::FindFileRequest { remote_tree_uuid, path, .. } => {
			let (tree, layout) = serving_tree(ctx, remote_tree_uuid)?;
			let stat: Option<FileStat> =
				ctx.resolver.get(&tree.file_authority(), path)?;
			Ok(MsgBody::FindFileResponse {
				tree_uuids: layout,
				stat: stat.map(|s| FileStatMsg::from_stat(&s)),
			})
		}
		MsgBody::DeviceInfoRequest => {
			let device: Device = ctx
				.resolver
				.get(MAIN_AUTHORITY, &device_key(LOCAL_DEVICE_ID))?
				.ok_or(Error::NotStartup)?;
			Ok(MsgBody::DeviceInfoResponse { device: device_info(&device) })
		}
		MsgBody::PushDeviceInfoRequest { device } => {
			upsert_peer_device(ctx, device)?;
			Ok(MsgBody::PushDeviceInfoResponse)
		}
		MsgBody::PushBackupInfoRequest { backup } => {
			let devices: Vec<Device> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
			if let Some(device) = devices.iter().find(|d| d.uuid == envelope.head.device_uuid) {
				let mut device = device.clone();
				device.backup_root = Some(backup.root.clone());
				ctx.resolver.update(MAIN_AUTHORITY, &device)?;
			}
			Ok(MsgBody::PushBackupInfoResponse)
		}
		MsgBody::ShareSyncRequest { sync_uuid, .. } => {
			let syncs: Vec<SyncRow> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
			let accepted = syncs
				.iter()
				.any(|s| s.uuid == *sync_uuid && s.is_normal() && s.stype == SyncType::Shared);
			Ok(MsgBody::ShareSyncResponse { accepted })
		}
		MsgBody::DeviceMetaRequest => {
			let device: Device = ctx
				.resolver
				.get(MAIN_AUTHORITY, &device_key(LOCAL_DEVICE_ID))?
				.ok_or(Error::NotStartup)?;
			let syncs: Vec<SyncRow> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
			Ok(MsgBody::DeviceMetaResponse {
				device: device_info(&device),
				sync_uuids: syncs
					.iter()
					.filter(|s| s.is_normal())
					.map(|s| s.uuid.clone())
					.collect(),
			})
		}
		MsgBody::AnnounceExitRequest => {
			let devices: Vec<Device> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
			if let Some(device) = devices.iter().find(|d| d.uuid == envelope.head.device_uuid) {
				let mut device = device.clone();
				device.status = DeviceStatus::Offline;
				ctx.resolver.update(MAIN_AUTHORITY, &device)?;
			}
			Ok(MsgBody::AnnounceExitResponse)
		}
		MsgBody::AnnounceTokenChangedRequest { .. } => {
			// the peer rotated its token: stop emitting until repaired
			let devices: Vec<Device> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
			if let Some(peer) = devices.iter().find(|d| d.uuid == envelope.head.device_uuid) {
				let trees: Vec<Tree> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
				let syncs: Vec<SyncRow> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
				let affected: HashSet<i32> = trees
					.iter()
					.filter(|t| t.device_id == peer.id)
					.map(|t| t.sync_id)
					.collect();
				for sync in syncs {
					if affected.contains(&sync.id) && sync.perm != SyncPerm::TokenDiff {
						let mut sync = sync;
						sync.perm = SyncPerm::TokenDiff;
						ctx.resolver.update(MAIN_AUTHORITY, &sync)?;
					}
				}
			}
			Ok(MsgBody::AnnounceTokenChangedResponse)
		}
		MsgBody::FilterPushSyncMetaRequest { local_tree_uuid, remote_tree_uuid, remote_meta } => {
			handle_filter_push(ctx, local_tree_uuid, remote_tree_uuid, remote_meta)
		}
		MsgBody::RemoveRemoteFileRequest { tree_uuid, path } => {
			handle_remove_remote_file(ctx, tree_uuid, path)
		}
		_ => Err(Error::InvalidMsg { message: String::from("not a request") }),
	}
}

/// A tree this device may serve metadata for: local, normal, enabled.
/// Vclock-only placeholders have no rows and never answer.
fn serving_tree(ctx: &Ctx, tree_uuid: &str) -> Result<(Tree, Vec<String>)> {
	let trees: Vec<Tree> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
	let tree = trees
		.iter()
		.find(|t| t.uuid == tree_uuid && t.is_local() && t.status == TreeStatus::Normal)
		.cloned()
		.ok_or(Error::TreeNoent { tree: tree_uuid.to_string() })?;
	let sync: SyncRow = ctx
		.resolver
		.get(MAIN_AUTHORITY, &sync_key(tree.sync_id))?
		.ok_or(Error::SyncNoent { sync: tree.sync_id.to_string() })?;
	if !sync.perm.can_emit() {
		return Err(Error::PermissionDeny);
	}
	let uuids: Vec<String> = trees
		.iter()
		.filter(|t| t.sync_id == tree.sync_id && t.status != TreeStatus::Removed)
		.map(|t| t.uuid.clone())
		.collect();
	let layout = layout_for(&tree.uuid, &uuids);
	Ok((tree, layout))
}

fn handle_find(ctx: &Ctx, tree_uuid: &str, since: i64, limit: i64) -> Result<MsgBody> {
	let (tree, layout) = serving_tree(ctx, tree_uuid)?;
	let mut rows: Vec<FileStat> = ctx
		.resolver
		.query_all::<FileStat>(&tree.file_authority())?
		.into_iter()
		.filter(|s| s.usn > since)
		.collect();
	rows.sort_by_key(|s| s.usn);
	rows.truncate(limit.max(0) as usize);
	Ok(MsgBody::FindResponse {
		remote_meta: RemoteMeta {
			tree_uuids: layout,
			stats: rows.iter().map(FileStatMsg::from_stat).collect(),
		},
	})
}

fn handle_filter_push(
	ctx: &Ctx,
	pusher_tree_uuid: &str,
	target_tree_uuid: &str,
	meta: &RemoteMeta,
) -> Result<MsgBody> {
	let trees: Vec<Tree> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
	let pusher_tree = trees
		.iter()
		.find(|t| t.uuid == pusher_tree_uuid && !t.is_local())
		.cloned()
		.ok_or(Error::TreeNoent { tree: pusher_tree_uuid.to_string() })?;
	let target_tree = trees
		.iter()
		.find(|t| t.uuid == target_tree_uuid && t.is_local() && t.is_normal())
		.cloned()
		.ok_or(Error::TreeNoent { tree: target_tree_uuid.to_string() })?;
	let sync: SyncRow = ctx
		.resolver
		.get(MAIN_AUTHORITY, &sync_key(target_tree.sync_id))?
		.ok_or(Error::SyncNoent { sync: target_tree.sync_id.to_string() })?;
	if !sync.perm.can_ingest() {
		return Err(Error::PermissionDeny);
	}

	store_remote_meta(ctx, &pusher_tree, meta)?;

	// which of the offered rows do we lack bytes for?
	let mut wanted = Vec::new();
	for stat in &meta.stats {
		if stat.status != FileStatus::Normal || stat.sha1.is_empty() {
			continue;
		}
		let ours: Option<FileStat> =
			ctx.resolver.get(&target_tree.file_authority(), &stat.path)?;
		let have = ours
			.map(|o| o.is_normal() && o.sha1 == stat.sha1)
			.unwrap_or(false);
		if !have {
			wanted.push(stat.path.clone());
		}
	}

	// fold the pushed rows into the tree on the next cycle
	if let Some(router) = ctx.router() {
		router.sync(target_tree.id, pusher_tree.id, false);
	}
	Ok(MsgBody::FilterPushSyncMetaResponse { wanted_paths: wanted })
}

fn handle_remove_remote_file(ctx: &Ctx, tree_uuid: &str, path: &str) -> Result<MsgBody> {
	let (tree, _layout) = serving_tree(ctx, tree_uuid)?;
	let authority = tree.file_authority();
	let row: Option<FileStat> = ctx.resolver.get(&authority, path)?;
	let row = match row {
		Some(row) if row.is_normal() => row,
		_ => return Ok(MsgBody::RemoveRemoteFileResponse { removed: false }),
	};

	let disk = util::path_on_disk(Path::new(&tree.root), path);
	let removal = if row.is_dir() {
		std::fs::remove_dir(&disk)
	} else {
		std::fs::remove_file(&disk)
	};
	if let Err(e) = removal {
		if e.kind() != std::io::ErrorKind::NotFound {
			return Ok(MsgBody::RemoveRemoteFileResponse { removed: false });
		}
	}

	let usn = local_tree_max_usn(ctx, &tree)? + 1;
	let mut tombstone = row;
	tombstone.status = FileStatus::Removed;
	tombstone.usn = usn;
	tombstone.local_vclock += 1;
	let mut ops = OperationList::new();
	ops.update(&tombstone)?;
	ops.insert(&UsnCounter { value: usn }, OnConflict::Replace)?;
	ctx.resolver.apply_batch(&authority, ops)?;
	Ok(MsgBody::RemoveRemoteFileResponse { removed: true })
}

/// Wire classification of an engine error.
pub fn wire_error(error: &Error) -> WireError {
	match error {
		Error::PermissionDeny => WireError::PermissionDeny,
		Error::SyncNoent { .. }
		| Error::TreeNoent { .. }
		| Error::DeviceNoent { .. }
		| Error::FileNoent { .. } => WireError::NotFound,
		Error::InvalidMsg { .. } => WireError::InvalidMsg,
		_ => WireError::General,
	}
}

fn device_info(device: &Device) -> DeviceInfo {
	DeviceInfo {
		device_uuid: device.uuid.clone(),
		name: device.name.clone(),
		route_port: device.route_port,
		data_port: device.data_port,
		version: device.version,
		is_mine: device.is_mine,
	}
}

fn upsert_peer_device(ctx: &Ctx, info: &DeviceInfo) -> Result<()> {
	let devices: Vec<Device> = ctx.resolver.query_all(MAIN_AUTHORITY)?;
	match devices.iter().find(|d| d.uuid == info.device_uuid) {
		Some(existing) => {
			let mut device = existing.clone();
			device.name = info.name.clone();
			device.route_port = info.route_port;
			device.data_port = info.data_port;
			device.version = info.version;
			device.status = DeviceStatus::Online;
			ctx.resolver.update(MAIN_AUTHORITY, &device)
		}
		None => {
			let device = Device {
				id: next_id(devices.iter().map(|d| d.id)),
				uuid: info.device_uuid.clone(),
				name: info.name.clone(),
				route_port: info.route_port,
				data_port: info.data_port,
				status: DeviceStatus::Online,
				dtype: 0,
				is_mine: info.is_mine,
				version: info.version,
				backup_root: None,
				backup_dst_root: None,
			};
			ctx.resolver.insert(MAIN_AUTHORITY, &device, OnConflict::Abort)
		}
	}
}

// vim: ts=4
