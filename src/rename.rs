//! Rename folding
//!
//! A rename on the peer arrives as a tombstone for the old path and a fresh
//! row for the new one. Matching the two by content fingerprint collapses
//! them into a single rename, which preserves vector-clock continuity and
//! saves re-downloading bytes that are already on disk.

use std::collections::HashMap;
use std::collections::VecDeque;

use crate::sync_file::{RenamePair, SyncFile};

/// Accumulates remove/create halves keyed by sha1 and emits folded pairs.
#[derive(Default)]
pub struct RenameDetector {
	pending_from: HashMap<String, VecDeque<SyncFile>>,
	pending_to: HashMap<String, VecDeque<SyncFile>>,
	renames: Vec<RenamePair>,
}

/// Residue of a drain: unmatched halves fall back to their plain meaning.
pub struct RenameOutcome {
	pub renames: Vec<RenamePair>,
	/// Unmatched remove sides: plain tombstone applications
	pub removes: Vec<SyncFile>,
	/// Unmatched create sides: plain inserts/updates
	pub creates: Vec<SyncFile>,
}

impl RenameDetector {
	pub fn new() -> Self {
		Self::default()
	}

	/// Offer one unit. Returns `false` when the unit is neither rename half,
	/// leaving it with the caller.
	pub fn add(&mut self, sf: SyncFile) -> Result<(), SyncFile> {
		if sf.is_rename_from() {
			let sha1 = sf.local.as_ref().map(|l| l.sha1.clone()).unwrap_or_default();
			match self.pending_to.get_mut(&sha1) {
				Some(queue) if !queue.is_empty() => {
					let to = queue.pop_front().unwrap();
					self.renames.push(RenamePair { from: sf, to });
				}
				_ => {
					self.pending_from.entry(sha1).or_default().push_back(sf);
				}
			}
			Ok(())
		} else if sf.is_rename_to() {
			let sha1 = sf.remote.sha1.clone();
			match self.pending_from.get_mut(&sha1) {
				Some(queue) if !queue.is_empty() => {
					let from = queue.pop_front().unwrap();
					self.renames.push(RenamePair { from, to: sf });
				}
				_ => {
					self.pending_to.entry(sha1).or_default().push_back(sf);
				}
			}
			Ok(())
		} else {
			Err(sf)
		}
	}

	/// Close the detector: matched pairs come out as renames, residues as
	/// their plain operations.
	pub fn drain(mut self) -> RenameOutcome {
		let mut removes = Vec::new();
		for (_sha1, mut queue) in self.pending_from.drain() {
			removes.extend(queue.drain(..));
		}
		let mut creates = Vec::new();
		for (_sha1, mut queue) in self.pending_to.drain() {
			creates.extend(queue.drain(..));
		}
		removes.sort_by(|a, b| a.path().cmp(b.path()));
		creates.sort_by(|a, b| a.path().cmp(b.path()));
		RenameOutcome { renames: std::mem::take(&mut self.renames), removes, creates }
	}
}


// vim: ts=4
