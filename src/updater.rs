//! Pair reconciliation driver
//!
//! Given a local tree and its replica of a peer tree, the updater walks both
//! file tables in path order like a merge join and feeds every pair into a
//! [`SyncFileTask`]. Peer clocks are remapped into the local layout before
//! any comparison, so the classifier only ever sees coherent vectors.

use std::sync::Arc;

use crate::abort::AbortRegistry;
use crate::error::{Error, Result};
use crate::model::{tree_key, Device, FileStat, SyncRow, Tree, MAIN_AUTHORITY};
use crate::resolver::ContentResolver;
use crate::scanner::IncludeList;
use crate::status::TreePairStat;
use crate::task::SyncFileTask;
use crate::types::TreeStatus;
use crate::vclock::{layout_for, remap};

pub struct SyncUpdater {
	local_tree: Tree,
	remote_tree: Tree,
	sync: SyncRow,
}

impl SyncUpdater {
	/// Validate the pair and load its rows. Rejects vclock-only trees,
	/// mismatched syncs, and syncs whose permission forbids data flow.
	pub fn new(resolver: &ContentResolver, local_tree_id: i32, remote_tree_id: i32) -> Result<Self> {
		if local_tree_id == remote_tree_id {
			return Err(Error::SyncdirMismatch);
		}
		let local_tree: Tree = resolver
			.get(MAIN_AUTHORITY, &tree_key(local_tree_id))?
			.ok_or(Error::TreeNoent { tree: local_tree_id.to_string() })?;
		if !local_tree.is_local() || local_tree.status != TreeStatus::Normal {
			return Err(Error::TreeNoent { tree: local_tree.uuid });
		}
		let remote_tree: Tree = resolver
			.get(MAIN_AUTHORITY, &tree_key(remote_tree_id))?
			.ok_or(Error::TreeNoent { tree: remote_tree_id.to_string() })?;
		if remote_tree.status != TreeStatus::Normal {
			return Err(Error::TreeNoent { tree: remote_tree.uuid });
		}
		if local_tree.sync_id != remote_tree.sync_id {
			return Err(Error::SyncdirMismatch);
		}
		let sync: SyncRow = resolver
			.get(MAIN_AUTHORITY, &crate::model::sync_key(local_tree.sync_id))?
			.ok_or(Error::SyncNoent { sync: local_tree.sync_id.to_string() })?;
		if !sync.is_normal() || !sync.perm.allows_sync() {
			return Err(Error::SyncNoent { sync: sync.uuid });
		}
		Ok(SyncUpdater { local_tree, remote_tree, sync })
	}

	pub fn local_tree(&self) -> &Tree {
		&self.local_tree
	}

	pub fn remote_tree(&self) -> &Tree {
		&self.remote_tree
	}

	pub fn sync(&self) -> &SyncRow {
		&self.sync
	}

	/// Clock layouts of both endpoints, derived from every tree of the sync
	/// (vclock-only trees keep their slot).
	fn layouts(&self, resolver: &ContentResolver) -> Result<(Vec<String>, Vec<String>)> {
		let trees: Vec<Tree> = resolver.query_all(MAIN_AUTHORITY)?;
		let uuids: Vec<String> = trees
			.iter()
			.filter(|t| t.sync_id == self.sync.id && t.status != TreeStatus::Removed)
			.map(|t| t.uuid.clone())
			.collect();
		let local_layout = layout_for(&self.local_tree.uuid, &uuids);
		let remote_layout = layout_for(&self.remote_tree.uuid, &uuids);
		Ok((local_layout, remote_layout))
	}

	/// Merge-join both tables and build the classified task.
	pub fn build_task(
		&self,
		resolver: &ContentResolver,
		local_device_uuid: &str,
		abort: &AbortRegistry,
	) -> Result<SyncFileTask> {
		let remote_device: Device = resolver
			.get(MAIN_AUTHORITY, &crate::model::device_key(self.remote_tree.device_id))?
			.ok_or(Error::DeviceNoent { device: self.remote_tree.device_id.to_string() })?;

		let (local_layout, remote_layout) = self.layouts(resolver)?;
		let include = IncludeList::load(resolver, self.local_tree.id)?;

		let mut task = SyncFileTask::new(
			self.local_tree.clone(),
			self.remote_tree.clone(),
			self.sync.clone(),
			local_device_uuid,
			&remote_device.uuid,
			local_layout.clone(),
		);

		let local_rows: Vec<FileStat> = resolver.query_all(&self.local_tree.file_authority())?;
		let remote_rows: Vec<FileStat> = resolver.query_all(&self.remote_tree.file_authority())?;

		let remap_remote = |mut stat: FileStat| -> FileStat {
			let mapped = remap(&stat.vclock(), &remote_layout, &local_layout);
			stat.set_vclock(&mapped);
			stat
		};

		let mut local_iter = local_rows.into_iter().peekable();
		let mut remote_iter = remote_rows.into_iter().peekable();
		let mut since_abort_check = 0usize;

		loop {
			since_abort_check += 1;
			if since_abort_check >= 256 {
				since_abort_check = 0;
				if abort.pair_aborted(self.local_tree.id, self.remote_tree.id) {
					return Err(Error::Cancel);
				}
			}
			match (local_iter.peek(), remote_iter.peek()) {
				(None, None) => break,
				(Some(local), None) => {
					let need = include.need_sync(&local.path);
					let local = local_iter.next().unwrap();
					if need {
						task.add(Some(local), None);
					}
				}
				(None, Some(remote)) => {
					let need = include.need_sync(&remote.path);
					let remote = remote_iter.next().unwrap();
					if need {
						task.add(None, Some(remap_remote(remote)));
					}
				}
				(Some(local), Some(remote)) => {
					let order = local.path.cmp(&remote.path);
					match order {
						std::cmp::Ordering::Equal => {
							let need = include.need_sync(&local.path);
							let local = local_iter.next().unwrap();
							let remote = remote_iter.next().unwrap();
							if need {
								task.add(Some(local), Some(remap_remote(remote)));
							}
						}
						std::cmp::Ordering::Less => {
							let need = include.need_sync(&local.path);
							let local = local_iter.next().unwrap();
							if need {
								task.add(Some(local), None);
							}
						}
						std::cmp::Ordering::Greater => {
							let need = include.need_sync(&remote.path);
							let remote = remote_iter.next().unwrap();
							if need {
								task.add(None, Some(remap_remote(remote)));
							}
						}
					}
				}
			}
		}

		task.prepare();
		Ok(task)
	}

	/// Publish the task's static counters to the pair's status cell.
	pub fn publish_counters(&self, task: &SyncFileTask, pair_stat: &Arc<TreePairStat>) {
		pair_stat.set_static(
			task.num_file_to_upload(),
			task.num_file_to_download(),
			task.num_file_consistent(),
			task.num_byte_to_upload(),
			task.num_byte_to_download(),
			task.num_byte_consistent(),
		);
	}
}

// vim: ts=4
