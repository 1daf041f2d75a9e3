//! Tree scanner
//!
//! A *refresh* walks a local tree root and reconciles what it finds against
//! the stored file table: new paths are inserted, changed paths updated with
//! a bumped local clock and a fresh USN, missing paths tombstoned. Repeating
//! a refresh with no disk change writes nothing.

use globset::{Glob, GlobSet, GlobSetBuilder};
use ignore::WalkBuilder;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::abort::AbortRegistry;
use crate::error::{Error, Result};
use crate::logging::*;
use crate::model::{FileStat, SyncListRow, Tree, UsnCounter, MAIN_AUTHORITY};
use crate::resolver::{ContentResolver, OnConflict, OperationList};
use crate::types::{BackupType, FileStatus, FileType, TreeStatus};
use crate::util::{self, disk_stat, DiskStat};

/// Counters of one refresh.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanSummary {
	pub scanned: usize,
	pub inserted: usize,
	pub updated: usize,
	pub removed: usize,
	pub skipped_errors: usize,
}

impl ScanSummary {
	pub fn changes(&self) -> usize {
		self.inserted + self.updated + self.removed
	}
}

/// Per-tree include list (favorites). Empty means the whole tree.
pub struct IncludeList {
	set: Option<GlobSet>,
}

impl IncludeList {
	pub fn load(resolver: &ContentResolver, tree_id: i32) -> Result<Self> {
		let rows: Vec<SyncListRow> = resolver.query_all(MAIN_AUTHORITY)?;
		let prefixes: Vec<&SyncListRow> =
			rows.iter().filter(|r| r.tree_id == tree_id).collect();
		if prefixes.is_empty() {
			return Ok(IncludeList { set: None });
		}
		let mut builder = GlobSetBuilder::new();
		for row in prefixes {
			let prefix = row.prefix.trim_end_matches('/');
			let exact = Glob::new(prefix)
				.map_err(|e| Error::Content { message: format!("include list: {}", e) })?;
			let under = Glob::new(&format!("{}/**", prefix))
				.map_err(|e| Error::Content { message: format!("include list: {}", e) })?;
			builder.add(exact);
			builder.add(under);
		}
		let set = builder
			.build()
			.map_err(|e| Error::Content { message: format!("include list: {}", e) })?;
		Ok(IncludeList { set: Some(set) })
	}

	pub fn need_sync(&self, canonical: &str) -> bool {
		match &self.set {
			None => true,
			Some(set) => set.is_match(canonical),
		}
	}
}

/// Scans local trees and persists the observed mutations in batches.
pub struct TreeScanner {
	resolver: Arc<ContentResolver>,
	abort: AbortRegistry,
	batch_cap: usize,
	modifier: String,
}

impl TreeScanner {
	pub fn new(
		resolver: Arc<ContentResolver>,
		abort: AbortRegistry,
		batch_cap: usize,
		modifier: &str,
	) -> Self {
		TreeScanner { resolver, abort, batch_cap, modifier: modifier.to_string() }
	}

	/// Refresh one tree. Committed batches survive cancellation.
	pub fn refresh(&self, tree: &Tree) -> Result<ScanSummary> {
		if !tree.is_local() {
			return Err(Error::TreeNoent { tree: tree.uuid.clone() });
		}
		if tree.status != TreeStatus::Normal || !tree.is_enabled {
			return Err(Error::TreeNoent { tree: tree.uuid.clone() });
		}
		let root = Path::new(&tree.root);
		if !root.is_dir() {
			return Err(Error::RootMoved { root: tree.root.clone() });
		}

		let authority = tree.file_authority();
		let include = IncludeList::load(&self.resolver, tree.id)?;
		let mut stored: BTreeMap<String, FileStat> = BTreeMap::new();
		for stat in self.resolver.query_all::<FileStat>(&authority)? {
			stored.insert(stat.path.clone(), stat);
		}
		let mut usn = self.load_usn(&authority, &stored)?;
		let force_sha1 = tree.backup_type == BackupType::Dst;

		let mut summary = ScanSummary::default();
		let mut batch = Batch::new(self.batch_cap, &authority);
		let mut visited: Vec<String> = Vec::new();

		let walker = WalkBuilder::new(root)
			.standard_filters(false)
			.follow_links(false)
			.sort_by_file_path(|a, b| a.cmp(b))
			.build();

		for entry in walker {
			if self.abort.is_aborted() {
				batch.flush(&self.resolver, usn)?;
				return Err(Error::Cancel);
			}
			let entry = match entry {
				Ok(entry) => entry,
				Err(e) => {
					warn!("scan: walk error: {}", e);
					summary.skipped_errors += 1;
					continue;
				}
			};
			let path = entry.path();
			if path == root {
				continue;
			}
			let rel = match path.strip_prefix(root) {
				Ok(rel) => rel,
				Err(_) => continue,
			};
			let canonical = match util::normalize_path(&rel.to_string_lossy()) {
				Ok(canonical) => canonical,
				Err(_) => {
					summary.skipped_errors += 1;
					continue;
				}
			};
			if !include.need_sync(&canonical) {
				continue;
			}
			let meta = match std::fs::symlink_metadata(path) {
				Ok(meta) => meta,
				Err(e) => {
					warn!("scan: stat {} failed: {}", path.display(), e);
					summary.skipped_errors += 1;
					continue;
				}
			};
			if meta.file_type().is_symlink() || !(meta.is_dir() || meta.is_file()) {
				continue;
			}
			summary.scanned += 1;
			let disk = disk_stat(&meta);
			visited.push(canonical.clone());

			match stored.get(&canonical) {
				None => {
					let sha1 = match self.fingerprint(path, &disk) {
						Ok(sha1) => sha1,
						Err(e) => {
							warn!("scan: hash {} failed: {}", path.display(), e);
							summary.skipped_errors += 1;
							continue;
						}
					};
					usn += 1;
					let stat = self.new_row(&canonical, &disk, sha1, usn);
					batch.ops.insert(&stat, OnConflict::Abort)?;
					summary.inserted += 1;
				}
				Some(row) => {
					match self.observe(row, path, &disk, force_sha1) {
						Ok(None) => {}
						Ok(Some(sha1)) => {
							usn += 1;
							let mut updated = row.clone();
							updated.ftype = disk.ftype;
							updated.status = FileStatus::Normal;
							updated.mtime = disk.mtime;
							updated.length = disk.length;
							updated.sha1 = sha1;
							updated.unix_attr = disk.attr;
							updated.usn = usn;
							updated.local_vclock += 1;
							updated.modifier = self.modifier.clone();
							updated.time_stamp = util::os_time_s();
							batch.ops.update(&updated)?;
							summary.updated += 1;
						}
						Err(e) => {
							warn!("scan: observe {} failed: {}", path.display(), e);
							summary.skipped_errors += 1;
						}
					}
				}
			}
			batch.maybe_flush(&self.resolver, usn)?;
		}

		// anything stored, in scope and alive that we did not see is gone
		let visited: std::collections::BTreeSet<String> = visited.into_iter().collect();
		for (path, row) in &stored {
			if self.abort.is_aborted() {
				batch.flush(&self.resolver, usn)?;
				return Err(Error::Cancel);
			}
			if row.status == FileStatus::Removed
				|| visited.contains(path)
				|| !include.need_sync(path)
			{
				continue;
			}
			usn += 1;
			let mut tombstone = row.clone();
			tombstone.status = FileStatus::Removed;
			tombstone.usn = usn;
			tombstone.local_vclock += 1;
			tombstone.modifier = self.modifier.clone();
			tombstone.time_stamp = util::os_time_s();
			batch.ops.update(&tombstone)?;
			summary.removed += 1;
			batch.maybe_flush(&self.resolver, usn)?;
		}

		batch.flush(&self.resolver, usn)?;
		debug!(
			"scan: tree {} done, {} scanned, +{} ~{} -{}",
			tree.uuid, summary.scanned, summary.inserted, summary.updated, summary.removed
		);
		Ok(summary)
	}

	fn load_usn(&self, authority: &str, stored: &BTreeMap<String, FileStat>) -> Result<i64> {
		if let Some(counter) = self.resolver.get::<UsnCounter>(authority, UsnCounter::KEY)? {
			return Ok(counter.value);
		}
		Ok(stored.values().map(|s| s.usn).max().unwrap_or(0))
	}

	fn new_row(&self, canonical: &str, disk: &DiskStat, sha1: String, usn: i64) -> FileStat {
		FileStat {
			path: canonical.to_string(),
			ftype: disk.ftype,
			status: FileStatus::Normal,
			mtime: disk.mtime,
			length: disk.length,
			sha1,
			usn,
			local_vclock: 1,
			remote_vclock: Vec::new(),
			unix_attr: disk.attr,
			android_attr: 0,
			win_attr: 0,
			modifier: self.modifier.clone(),
			time_stamp: util::os_time_s(),
			alias: None,
		}
	}

	fn fingerprint(&self, path: &Path, disk: &DiskStat) -> Result<String> {
		match disk.ftype {
			FileType::Dir => Ok(String::new()),
			FileType::Reg => util::sha1_of_file(path),
		}
	}

	/// Compare a stored row with the disk. `Ok(None)` means unchanged;
	/// `Ok(Some(sha1))` carries the fingerprint for the updated row.
	///
	/// SHA-1 is lazy: when mtime and length both match a live regular row the
	/// content is assumed unchanged, except on backup destinations which
	/// always verify.
	fn observe(
		&self,
		row: &FileStat,
		path: &Path,
		disk: &DiskStat,
		force_sha1: bool,
	) -> Result<Option<String>> {
		let resurrected = row.status == FileStatus::Removed;
		let type_changed = row.ftype != disk.ftype;
		// ownership is recorded but not compared; it differs between devices
		// without meaning the content diverged
		let mode_changed = row.unix_attr.mode != disk.attr.mode;

		if disk.ftype == FileType::Dir {
			// directory mtimes move with every child change and carry no
			// content information
			if resurrected || type_changed || mode_changed {
				return Ok(Some(String::new()));
			}
			return Ok(None);
		}

		let attrs_changed = row.mtime != disk.mtime || row.length != disk.length || mode_changed;
		let stat_match = !resurrected && !type_changed && row.mtime == disk.mtime
			&& row.length == disk.length;
		if stat_match && !force_sha1 {
			if mode_changed {
				// permissions moved but the content stat is identical
				return Ok(Some(row.sha1.clone()));
			}
			return Ok(None);
		}

		let sha1 = util::sha1_of_file(path)?;
		if !resurrected && !type_changed && !attrs_changed && sha1 == row.sha1 {
			return Ok(None);
		}
		Ok(Some(sha1))
	}
}

/// Pending operation list flushed every `cap` rows, with the USN allocator
/// persisted in the same transaction.
struct Batch {
	ops: OperationList,
	cap: usize,
	authority: String,
}

impl Batch {
	fn new(cap: usize, authority: &str) -> Self {
		Batch { ops: OperationList::new(), cap, authority: authority.to_string() }
	}

	fn maybe_flush(&mut self, resolver: &ContentResolver, usn: i64) -> Result<()> {
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
