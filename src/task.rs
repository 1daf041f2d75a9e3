//! Sync-file task runner
//!
//! One task per (local tree, remote tree) reconciliation. The updater feeds
//! classified pairs through [`SyncFileTask::add`]; `prepare` folds renames;
//! `run` applies everything in three ordered phases: renames first (path
//! rewrites without moving bytes), then metadata (creates top-down, removes
//! bottom-up), then content batches through the transport. The push side
//! offers local rows to the peer and ships the bytes the peer asks for.
//!
//! Batches commit independently. A failed batch leaves the database
//! consistent with whatever preceded it; the task then reports `General`
//! and the next cycle converges.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::abort::{AbortFlag, AbortRegistry};
use crate::consistency::{ConsistencyHandler, RenameVerdict, Verdict};
use crate::error::{Error, Result};
use crate::logging::*;
use crate::model::{FileStat, SyncRow, Tree, UsnCounter};
use crate::protocol::messages::RemoteMeta;
use crate::protocol::{FileStatMsg, Transport, TransferFile};
use crate::rename::RenameDetector;
use crate::resolver::{ContentResolver, OnConflict, OperationList};
use crate::status::TreePairStat;
use crate::sync_file::{
	backup_dst_refuses_emit, backup_src_refuses, decide_pair, remote_wins_conflict, PairDecision,
	PairKind, RenamePair, SyncFile,
};
use crate::util;

/// Everything the runner needs from the outside world.
pub struct TaskIo<'a> {
	pub resolver: &'a ContentResolver,
	pub transport: &'a dyn Transport,
	pub endpoint: String,
	pub tmp_root: PathBuf,
	pub abort: &'a AbortRegistry,
	pub status: Arc<TreePairStat>,
	pub batch_cap: usize,
	pub transfer_batch_files: usize,
	pub transfer_batch_bytes: i64,
	pub rpc_timeout: Duration,
}

pub struct SyncFileTask {
	local_tree: Tree,
	remote_tree: Tree,
	sync: SyncRow,
	local_device_uuid: String,
	remote_device_uuid: String,
	/// Local tree's clock layout, for serializing push metadata
	local_layout: Vec<String>,

	detector: RenameDetector,
	pull_renames: Vec<RenamePair>,
	pull_mk_meta: Vec<SyncFile>,
	pull_rm_meta: Vec<SyncFile>,
	pull_data: Vec<SyncFile>,
	push_candidates: Vec<FileStat>,

	num_file_consistent: i64,
	num_byte_consistent: i64,
	failed_units: usize,
}

impl SyncFileTask {
	pub fn new(
		local_tree: Tree,
		remote_tree: Tree,
		sync: SyncRow,
		local_device_uuid: &str,
		remote_device_uuid: &str,
		local_layout: Vec<String>,
	) -> Self {
		SyncFileTask {
			local_tree,
			remote_tree,
			sync,
			local_device_uuid: local_device_uuid.to_string(),
			remote_device_uuid: remote_device_uuid.to_string(),
			local_layout,
			detector: RenameDetector::new(),
			pull_renames: Vec::new(),
			pull_mk_meta: Vec::new(),
			pull_rm_meta: Vec::new(),
			pull_data: Vec::new(),
			push_candidates: Vec::new(),
			num_file_consistent: 0,
			num_byte_consistent: 0,
			failed_units: 0,
		}
	}

	/// Feed one path's pair. The remote clock must already be remapped into
	/// the local layout.
	pub fn add(&mut self, local: Option<FileStat>, remote: Option<FileStat>) {
		match decide_pair(local.as_ref(), remote.as_ref()) {
			PairDecision::Consistent => {
				if let Some(local) = &local {
					if local.is_normal() {
						self.num_file_consistent += 1;
						self.num_byte_consistent += local.length;
					}
				}
			}
			PairDecision::PushCandidate => {
				if self.sync.perm.can_emit()
					&& !backup_dst_refuses_emit(self.local_tree.backup_type)
				{
					if let Some(local) = local {
						self.push_candidates.push(local);
					}
				}
			}
			PairDecision::Pull(sf) | PairDecision::Conflict(sf) => {
				if !self.sync.perm.can_ingest() {
					return;
				}
				if backup_src_refuses(self.local_tree.backup_type, &sf) {
					return;
				}
				if sf.mask.kind() == PairKind::Conflict {
					self.route(sf);
					return;
				}
				if let Err(sf) = self.detector.add(sf) {
					self.route(sf);
				}
			}
		}
	}

	/// Fold renames and settle the queues.
	pub fn prepare(&mut self) {
		let outcome = std::mem::take(&mut self.detector).drain();
		self.pull_renames = outcome.renames;
		for sf in outcome.removes {
			self.route(sf);
		}
		for sf in outcome.creates {
			self.route(sf);
		}
		// creates top-down, removes bottom-up
		self.pull_mk_meta.sort_by(|a, b| a.path().cmp(b.path()));
		self.pull_rm_meta.sort_by(|a, b| b.path().cmp(a.path()));
		self.pull_data.sort_by(|a, b| a.path().cmp(b.path()));
	}

	fn route(&mut self, sf: SyncFile) {
		if sf.mask.kind() == PairKind::Conflict {
			self.route_conflict(sf);
		} else if sf.mask.is_data() {
			self.pull_data.push(sf);
		} else if sf.mask.is_remote_normal() || sf.local.is_none() {
			// dir creates, attribute updates, tombstone inserts
			self.pull_mk_meta.push(sf);
		} else {
			// the peer removed something we still hold
			self.pull_rm_meta.push(sf);
		}
	}

	/// Divergent pairs resolve on the losing side only; the winner leaves its
	/// row untouched so the loser still observes the conflict and produces
	/// the conflict copy. Edits always beat deletions.
	fn route_conflict(&mut self, sf: SyncFile) {
		let local_normal = sf.mask.is_local_normal();
		let remote_normal = sf.mask.is_remote_normal();
		match (local_normal, remote_normal) {
			(true, false) => {
				// peer deleted what we edited: our edit survives, the peer
				// resurrects on its own cycle
			}
			(false, false) => {
				// both gone; just join the clocks
				self.pull_mk_meta.push(sf);
			}
			(false, true) => {
				// we deleted what the peer edited: resurrect
				if sf.mask.is_data() {
					self.pull_data.push(sf);
				} else {
					self.pull_mk_meta.push(sf);
				}
			}
			(true, true) => {
				if !self.remote_wins() {
					return;
				}
				if sf.mask.is_data() {
					self.pull_data.push(sf);
				} else {
					self.pull_mk_meta.push(sf);
				}
			}
		}
	}

	fn remote_wins(&self) -> bool {
		remote_wins_conflict(&self.local_device_uuid, &self.remote_device_uuid)
	}

	pub fn num_file_to_download(&self) -> i64 {
		self.pull_data.len() as i64
	}

	pub fn num_byte_to_download(&self) -> i64 {
		self.pull_data.iter().map(|sf| sf.remote.length).sum()
	}

	pub fn num_file_to_upload(&self) -> i64 {
		self.push_candidates.len() as i64
	}

	pub fn num_byte_to_upload(&self) -> i64 {
		self.push_candidates.iter().filter(|s| s.is_normal()).map(|s| s.length).sum()
	}

	pub fn num_file_consistent(&self) -> i64 {
		self.num_file_consistent
	}

	pub fn num_byte_consistent(&self) -> i64 {
		self.num_byte_consistent
	}

	/// Apply everything. Phase order: renames, metadata, data, push.
	pub async fn run(&mut self, io: &TaskIo<'_>) -> Result<()> {
		let consistency = ConsistencyHandler::new(Path::new(&self.local_tree.root));
		let authority = self.local_tree.file_authority();
		let mut usn = self.load_usn(io.resolver, &authority)?;

		let renames = std::mem::take(&mut self.pull_renames);
		let mk_meta = std::mem::take(&mut self.pull_mk_meta);
		let rm_meta = std::mem::take(&mut self.pull_rm_meta);
		let mut data = std::mem::take(&mut self.pull_data);

		self.run_renames(io, &consistency, &authority, &mut usn, renames, &mut data)?;
		self.run_meta(io, &consistency, &authority, &mut usn, mk_meta, rm_meta)?;
		self.run_data(io, &consistency, &authority, &mut usn, data).await?;
		self.run_push(io).await?;

		if self.failed_units > 0 {
			warn!(
				"sync task {}->{}: {} unit(s) failed",
				self.remote_tree.uuid, self.local_tree.uuid, self.failed_units
			);
			return Err(Error::General);
		}
		Ok(())
	}

	fn load_usn(&self, resolver: &ContentResolver, authority: &str) -> Result<i64> {
		if let Some(counter) = resolver.get::<UsnCounter>(authority, UsnCounter::KEY)? {
			return Ok(counter.value);
		}
		let rows: Vec<FileStat> = resolver.query_all(authority)?;
		Ok(rows.iter().map(|s| s.usn).max().unwrap_or(0))
	}

	fn check_abort(&self, io: &TaskIo<'_>) -> Result<()> {
		if io.abort.pair_aborted(self.local_tree.id, self.remote_tree.id) {
			return Err(Error::Cancel);
		}
		Ok(())
	}

	// ------------------------------------------------------------------
	// phase 1: renames
	// ------------------------------------------------------------------

	fn run_renames(
		&mut self,
		io: &TaskIo<'_>,
		consistency: &ConsistencyHandler,
		authority: &str,
		usn: &mut i64,
		renames: Vec<RenamePair>,
		data: &mut Vec<SyncFile>,
	) -> Result<()> {
		if renames.is_empty() {
			return Ok(());
		}
		let root = PathBuf::from(&self.local_tree.root);
		let mut batch = Batch::new(io.batch_cap, authority);
		for pair in renames {
			self.check_abort(io)?;
			match consistency.check_rename(pair) {
				RenameVerdict::Proceed(pair) => {
					let from_disk = util::path_on_disk(&root, pair.from.path());
					let to_disk = util::path_on_disk(&root, pair.to.path());
					if let Some(parent) = to_disk.parent() {
						if let Err(e) = std::fs::create_dir_all(parent) {
							warn!("rename: mkdir {}: {}", parent.display(), e);
							self.failed_units += 1;
							continue;
						}
					}
					if let Err(e) = std::fs::rename(&from_disk, &to_disk) {
						warn!(
							"rename: {} -> {}: {}",
							from_disk.display(),
							to_disk.display(),
							e
						);
						self.failed_units += 1;
						continue;
					}
					// tombstone the source row with merged clocks
					if let Some(local) = &pair.from.local {
						*usn += 1;
						let row = merged_row(local, &pair.from.remote, *usn);
						if batch.ops.update(&row).is_err() {
							self.failed_units += 1;
						}
					}
					// destination inherits the peer's row; bytes are in place
					*usn += 1;
					let mut row = pair.to.remote.clone();
					row.usn = *usn;
					if batch.ops.insert(&row, OnConflict::Replace).is_err() {
						self.failed_units += 1;
					}
					apply_mtime(&to_disk, row.mtime);
					apply_mode(&to_disk, row.unix_attr.mode);
				}
				RenameVerdict::Split { from, to } => {
					if let Some(from) = from {
						self.pull_rm_meta.push(from);
					}
					if let Some(mut to) = to {
						to.mask.set_data();
						data.push(to);
					}
				}
				RenameVerdict::Drop => {}
			}
			if batch.flush_if_full(io.resolver, *usn).is_err() {
				self.failed_units += 1;
			}
		}
		if batch.flush(io.resolver, *usn).is_err() {
			self.failed_units += 1;
		}
		data.sort_by(|a, b| a.path().cmp(b.path()));
		Ok(())
	}

	// ------------------------------------------------------------------
	// phase 2: metadata
	// ------------------------------------------------------------------

	fn run_meta(
		&mut self,
		io: &TaskIo<'_>,
		consistency: &ConsistencyHandler,
		authority: &str,
		usn: &mut i64,
		mk_meta: Vec<SyncFile>,
		rm_meta: Vec<SyncFile>,
	) -> Result<()> {
		let extra_rm = std::mem::take(&mut self.pull_rm_meta);
		let mut rm_all = rm_meta;
		rm_all.extend(extra_rm);
		rm_all.sort_by(|a, b| b.path().cmp(a.path()));

		let root = PathBuf::from(&self.local_tree.root);
		let mut batch = Batch::new(io.batch_cap, authority);

		for sf in mk_meta {
			self.check_abort(io)?;
			match consistency.check(sf) {
				Verdict::Proceed(sf) => {
					if sf.mask.is_data() {
						// upgraded under our feet; move it to the data phase
						self.pull_data.push(sf);
						continue;
					}
					if let Err(e) = self.apply_mk_meta(&root, &sf, usn, &mut batch) {
						warn!("meta apply {} failed: {}", sf.path(), e);
						self.failed_units += 1;
					}
				}
				Verdict::Drop => {}
			}
			if batch.flush_if_full(io.resolver, *usn).is_err() {
				self.failed_units += 1;
			}
		}

		for sf in rm_all {
			self.check_abort(io)?;
			match consistency.check(sf) {
				Verdict::Proceed(sf) => {
					if let Err(e) = self.apply_rm_meta(&root, &sf, usn, &mut batch) {
						warn!("remove apply {} failed: {}", sf.path(), e);
						self.failed_units += 1;
					}
				}
				Verdict::Drop => {}
			}
			if batch.flush_if_full(io.resolver, *usn).is_err() {
				self.failed_units += 1;
			}
		}

		if batch.flush(io.resolver, *usn).is_err() {
			self.failed_units += 1;
		}
		Ok(())
	}

	fn apply_mk_meta(
		&self,
		root: &Path,
		sf: &SyncFile,
		usn: &mut i64,
		batch: &mut Batch,
	) -> Result<()> {
		match (&sf.local, sf.mask.kind()) {
			(None, _) => {
				// tombstone propagation or a fresh directory
				if sf.remote.is_normal() && sf.remote.is_dir() {
					let disk = util::path_on_disk(root, sf.path());
					std::fs::create_dir_all(&disk)?;
					apply_mode(&disk, sf.remote.unix_attr.mode);
				}
				*usn += 1;
				let mut row = sf.remote.clone();
				row.usn = *usn;
				batch.ops.insert(&row, OnConflict::Replace)?;
			}
			(Some(local), PairKind::Conflict) => {
				// only losing-side and both-removed conflicts are queued here
				if local.is_normal()
					&& local.is_reg() && sf.remote.is_normal()
					&& local.sha1 != sf.remote.sha1
				{
					self.conflict_copy_local(root, local, usn, batch)?;
				}
				if sf.remote.is_normal() && sf.remote.is_dir() {
					std::fs::create_dir_all(util::path_on_disk(root, sf.path()))?;
				}
				*usn += 1;
				let row = merged_row(local, &sf.remote, *usn);
				batch.ops.update(&row)?;
			}
			(Some(local), _) => {
				let disk = util::path_on_disk(root, sf.path());
				if sf.remote.is_normal() && sf.remote.is_dir() && !local.is_normal() {
					std::fs::create_dir_all(&disk)?;
				}
				*usn += 1;
				let row = merged_row(local, &sf.remote, *usn);
				if row.is_normal() {
					if row.is_reg() {
						apply_mtime(&disk, row.mtime);
					}
					apply_mode(&disk, row.unix_attr.mode);
				}
				batch.ops.update(&row)?;
			}
		}
		Ok(())
	}

	fn apply_rm_meta(
		&self,
		root: &Path,
		sf: &SyncFile,
		usn: &mut i64,
		batch: &mut Batch,
	) -> Result<()> {
		let local = match &sf.local {
			Some(local) => local,
			None => return Ok(()),
		};
		let disk = util::path_on_disk(root, sf.path());
		let removal = if local.is_dir() {
			std::fs::remove_dir(&disk)
		} else {
			std::fs::remove_file(&disk)
		};
		match removal {
			Ok(()) => {}
			Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
			Err(e) => {
				// a non-empty directory stays; the next cycle retries after
				// its children are gone
				debug!("remove {}: {}", disk.display(), e);
				return Err(e.into());
			}
		}
		*usn += 1;
		let row = merged_row(local, &sf.remote, *usn);
		batch.ops.update(&row)?;
		Ok(())
	}

	// ------------------------------------------------------------------
	// phase 3: data
	// ------------------------------------------------------------------

	async fn run_data(
		&mut self,
		io: &TaskIo<'_>,
		consistency: &ConsistencyHandler,
		authority: &str,
		usn: &mut i64,
		mut data: Vec<SyncFile>,
	) -> Result<()> {
		let upgraded = std::mem::take(&mut self.pull_data);
		data.extend(upgraded);
		if data.is_empty() {
			return Ok(());
		}
		let root = PathBuf::from(&self.local_tree.root);

		let mut batch_units: Vec<SyncFile> = Vec::new();
		let mut batch_bytes: i64 = 0;
		let mut batches: Vec<Vec<SyncFile>> = Vec::new();
		for sf in data {
			if batch_units.len() >= io.transfer_batch_files
				|| (batch_bytes + sf.remote.length > io.transfer_batch_bytes
					&& !batch_units.is_empty())
			{
				batches.push(std::mem::take(&mut batch_units));
				batch_bytes = 0;
			}
			batch_bytes += sf.remote.length;
			batch_units.push(sf);
		}
		if !batch_units.is_empty() {
			batches.push(batch_units);
		}

		for (batch_no, units) in batches.into_iter().enumerate() {
			self.check_abort(io)?;

			// last look at the disk before spending bandwidth
			let mut wanted: Vec<SyncFile> = Vec::new();
			let mut meta_batch = Batch::new(io.batch_cap, authority);
			for sf in units {
				match consistency.check(sf) {
					Verdict::Proceed(sf) if sf.mask.is_data() => wanted.push(sf),
					Verdict::Proceed(sf) => {
						// bytes arrived by other means; metadata still moves
						if let Err(e) = self.apply_mk_meta(&root, &sf, usn, &mut meta_batch) {
							warn!("meta apply {} failed: {}", sf.path(), e);
							self.failed_units += 1;
						}
					}
					Verdict::Drop => {}
				}
			}
			if meta_batch.flush(io.resolver, *usn).is_err() {
				self.failed_units += 1;
			}
			if wanted.is_empty() {
				continue;
			}

			let tmp_dir = io.tmp_root.join(format!(
				"fetch-{}-{}-{}",
				self.local_tree.id, self.remote_tree.id, batch_no
			));
			std::fs::create_dir_all(&tmp_dir)?;

			let files: Vec<TransferFile> = wanted
				.iter()
				.map(|sf| TransferFile {
					path: sf.remote.path.clone(),
					length: sf.remote.length,
					sha1: sf.remote.sha1.clone(),
				})
				.collect();

			let cancel = AbortFlag::new();
			let fetched = match io
				.transport
				.fetch(&io.endpoint, &self.remote_tree.uuid, &files, &tmp_dir, cancel)
				.await
			{
				Ok(fetched) => fetched,
				Err(e) => {
					warn!("fetch batch {} failed: {}", batch_no, e);
					self.failed_units += wanted.len();
					let _ = std::fs::remove_dir_all(&tmp_dir);
					continue;
				}
			};

			let mut batch = Batch::new(io.batch_cap, authority);
			for sf in &wanted {
				let materialized = fetched.iter().find(|m| m.path == sf.remote.path);
				let materialized = match materialized {
					Some(materialized) => materialized,
					None => {
						self.failed_units += 1;
						continue;
					}
				};
				io.status.set_download_path(&sf.remote.path);
				match self.apply_data(&root, sf, materialized.tmp_path.as_path(), usn, &mut batch)
				{
					Ok(bytes) => io.status.add_byte_downloaded(bytes),
					Err(e) => {
						warn!("data apply {} failed: {}", sf.path(), e);
						self.failed_units += 1;
					}
				}
				if batch.flush_if_full(io.resolver, *usn).is_err() {
					self.failed_units += 1;
				}
			}
			if batch.flush(io.resolver, *usn).is_err() {
				self.failed_units += 1;
			}
			let _ = std::fs::remove_dir_all(&tmp_dir);
		}
		Ok(())
	}

	fn apply_data(
		&self,
		root: &Path,
		sf: &SyncFile,
		tmp_path: &Path,
		usn: &mut i64,
		batch: &mut Batch,
	) -> Result<i64> {
		let target = util::path_on_disk(root, sf.path());
		if let Some(parent) = target.parent() {
			std::fs::create_dir_all(parent)?;
		}

		let conflict_copy = sf.mask.kind() == PairKind::Conflict
			&& sf.local.as_ref().map(|l| l.is_normal() && l.is_reg()).unwrap_or(false);
		if conflict_copy {
			self.conflict_copy_local(root, sf.local.as_ref().unwrap(), usn, batch)?;
		}

		std::fs::rename(tmp_path, &target)?;
		apply_mtime(&target, sf.remote.mtime);
		apply_mode(&target, sf.remote.unix_attr.mode);

		*usn += 1;
		let row = match &sf.local {
			Some(local) => merged_row(local, &sf.remote, *usn),
			None => {
				let mut row = sf.remote.clone();
				row.usn = *usn;
				row
			}
		};
		batch.ops.insert(&row, OnConflict::Replace)?;
		Ok(sf.remote.length)
	}

	/// Preserve the losing side of a content conflict: the live local file
	/// moves to a suffixed copy with a fresh row authored by this device.
	fn conflict_copy_local(
		&self,
		root: &Path,
		local: &FileStat,
		usn: &mut i64,
		batch: &mut Batch,
	) -> Result<()> {
		let copy_path = util::conflict_path(&local.path, &self.local_device_uuid, root);
		let copy_disk = util::path_on_disk(root, &copy_path);
		std::fs::rename(util::path_on_disk(root, &local.path), &copy_disk)?;
		*usn += 1;
		let mut copy_row = local.clone();
		copy_row.path = copy_path;
		copy_row.usn = *usn;
		copy_row.local_vclock = 1;
		copy_row.remote_vclock = Vec::new();
		copy_row.time_stamp = util::os_time_s();
		batch.ops.insert(&copy_row, OnConflict::Replace)?;
		Ok(())
	}

	// ------------------------------------------------------------------
	// phase 4: push
	// ------------------------------------------------------------------

	async fn run_push(&mut self, io: &TaskIo<'_>) -> Result<()> {
		if self.push_candidates.is_empty() {
			return Ok(());
		}
		self.check_abort(io)?;

		let stats: Vec<FileStatMsg> =
			self.push_candidates.iter().map(FileStatMsg::from_stat).collect();
		let meta = RemoteMeta { tree_uuids: self.local_layout.clone(), stats };

		let wanted = match io
			.transport
			.upload_meta(&io.endpoint, &self.local_tree.uuid, &self.remote_tree.uuid, meta)
			.await
		{
			Ok(wanted) => wanted,
			Err(e) => {
				warn!("upload_meta to {} failed: {}", io.endpoint, e);
				self.failed_units += self.push_candidates.len();
				return Ok(());
			}
		};
		if wanted.is_empty() {
			return Ok(());
		}

		let root = PathBuf::from(&self.local_tree.root);
		let tmp_dir = io
			.tmp_root
			.join(format!("push-{}-{}", self.local_tree.id, self.remote_tree.id));
		std::fs::create_dir_all(&tmp_dir)?;

		let mut files = Vec::new();
		for candidate in &self.push_candidates {
			if !wanted.contains(&candidate.path) || !candidate.is_normal() {
				continue;
			}
			let src = util::path_on_disk(&root, &candidate.path);
			let staged = tmp_dir.join(util::relative_part(&candidate.path));
			if let Some(parent) = staged.parent() {
				std::fs::create_dir_all(parent)?;
			}
			if let Err(e) = std::fs::copy(&src, &staged) {
				warn!("push stage {} failed: {}", candidate.path, e);
				self.failed_units += 1;
				continue;
			}
			io.status.set_upload_path(&candidate.path);
			files.push(TransferFile {
				path: candidate.path.clone(),
				length: candidate.length,
				sha1: candidate.sha1.clone(),
			});
		}

		if !files.is_empty() {
			let cancel = AbortFlag::new();
			let bytes: i64 = files.iter().map(|f| f.length).sum();
			match io
				.transport
				.push(&io.endpoint, &self.local_tree.uuid, &tmp_dir, &files, cancel)
				.await
			{
				Ok(()) => io.status.add_byte_uploaded(bytes),
				Err(e) => {
					warn!("push to {} failed: {}", io.endpoint, e);
					self.failed_units += files.len();
				}
			}
		}
		let _ = std::fs::remove_dir_all(&tmp_dir);
		Ok(())
	}
}

/// Local row updated by the peer's row: the peer's observable fields win,
/// the clocks merge pointwise, and the row gets a fresh USN. The local
/// authorship component survives the merge untouched.
fn merged_row(local: &FileStat, remote: &FileStat, usn: i64) -> FileStat {
	let mut row = local.clone();
	let mut vc = local.vclock();
	vc.merge(&remote.vclock());
	row.set_vclock(&vc);
	row.ftype = remote.ftype;
	row.status = remote.status;
	row.mtime = remote.mtime;
	row.length = remote.length;
	row.sha1 = remote.sha1.clone();
	row.unix_attr = remote.unix_attr;
	row.modifier = remote.modifier.clone();
	row.time_stamp = remote.time_stamp;
	row.usn = usn;
	row
}

fn apply_mtime(path: &Path, mtime: i64) {
	let _ = filetime::set_file_mtime(path, filetime::FileTime::from_unix_time(mtime, 0));
}

/// Mirror the peer's permission bits; ownership is recorded only.
#[allow(unused_variables)]
fn apply_mode(path: &Path, mode: u32) {
	#[cfg(unix)]
	if mode != 0 {
		use std::os::unix::fs::PermissionsExt;
		let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode & 0o7777));
	}
}

/// Operation list flushed every `cap` rows with the USN allocator persisted
/// alongside.
struct Batch {
	ops: OperationList,
	cap: usize,
	authority: String,
}

impl Batch {
	fn new(cap: usize, authority: &str) -> Self {
		Batch { ops: OperationList::new(), cap, authority: authority.to_string() }
	}

	fn flush_if_full(&mut self, resolver: &ContentResolver, usn: i64) -> Result<()> {
		if self.ops.len() >= self.cap {
			self.flush(resolver, usn)?;
		}
		Ok(())
	}

	fn flush(&mut self, resolver: &ContentResolver, usn: i64) -> Result<()> {
		if self.ops.is_empty() {
			return Ok(());
		}
		let mut ops = std::mem::take(&mut self.ops);
		ops.insert(&UsnCounter { value: usn }, OnConflict::Replace)?;
		resolver.apply_batch(&self.authority, ops)?;
		Ok(())
	}
}


// vim: ts=4
