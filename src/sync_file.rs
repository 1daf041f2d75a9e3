//! Per-file reconciliation units
//!
//! For every path the updater pairs the local row with the peer's row and
//! encodes the situation in a small bit mask: liveness and kind of each side,
//! whether content bytes must move, and whether the pair is an insert, an
//! update or a conflict. The mask drives queue placement in the task runner
//! and the rename folding.

use crate::model::FileStat;
use crate::types::{BackupType, FileStatus, FileType};
use crate::vclock::VClockCmp;

pub const MASK_REMOTE_NORMAL: u32 = 0x01;
pub const MASK_REMOTE_DIR: u32 = 0x02;
pub const MASK_LOCAL_NORMAL: u32 = 0x04;
pub const MASK_LOCAL_DIR: u32 = 0x08;
pub const MASK_DATA: u32 = 0x40;

const KIND_SHIFT: u32 = 4;
const KIND_BITS: u32 = 0x30;
const KIND_INSERT: u32 = 0x0;
const KIND_UPDATE: u32 = 0x1;
const KIND_CONFLICT: u32 = 0x2;

/// Insert / update / conflict discriminator of a mask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairKind {
	Insert,
	Update,
	Conflict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncMask(pub u32);

impl SyncMask {
	pub fn new() -> Self {
		SyncMask(0)
	}

	pub fn is_remote_normal(self) -> bool {
		self.0 & MASK_REMOTE_NORMAL != 0
	}

	pub fn is_remote_dir(self) -> bool {
		self.0 & MASK_REMOTE_DIR != 0
	}

	pub fn is_local_normal(self) -> bool {
		self.0 & MASK_LOCAL_NORMAL != 0
	}

	pub fn is_local_dir(self) -> bool {
		self.0 & MASK_LOCAL_DIR != 0
	}

	pub fn is_data(self) -> bool {
		self.0 & MASK_DATA != 0
	}

	pub fn is_meta(self) -> bool {
		!self.is_data()
	}

	pub fn kind(self) -> PairKind {
		match (self.0 & KIND_BITS) >> KIND_SHIFT {
			KIND_INSERT => PairKind::Insert,
			KIND_UPDATE => PairKind::Update,
			_ => PairKind::Conflict,
		}
	}

	pub fn set_remote(&mut self, stat: &FileStat) {
		if stat.status == FileStatus::Normal {
			self.0 |= MASK_REMOTE_NORMAL;
		} else {
			self.0 &= !MASK_REMOTE_NORMAL;
		}
		if stat.ftype == FileType::Dir {
			self.0 |= MASK_REMOTE_DIR;
		} else {
			self.0 &= !MASK_REMOTE_DIR;
		}
	}

	pub fn set_local(&mut self, stat: &FileStat) {
		if stat.status == FileStatus::Normal {
			self.0 |= MASK_LOCAL_NORMAL;
		} else {
			self.0 &= !MASK_LOCAL_NORMAL;
		}
		if stat.ftype == FileType::Dir {
			self.0 |= MASK_LOCAL_DIR;
		} else {
			self.0 &= !MASK_LOCAL_DIR;
		}
	}

	pub fn set_kind(&mut self, kind: PairKind) {
		let bits = match kind {
			PairKind::Insert => KIND_INSERT,
			PairKind::Update => KIND_UPDATE,
			PairKind::Conflict => KIND_CONFLICT,
		};
		self.0 = (self.0 & !KIND_BITS) | (bits << KIND_SHIFT);
	}

	pub fn set_data(&mut self) {
		self.0 |= MASK_DATA;
	}

	pub fn set_meta(&mut self) {
		self.0 &= !MASK_DATA;
	}
}

impl Default for SyncMask {
	fn default() -> Self {
		Self::new()
	}
}

impl std::fmt::Display for SyncMask {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		let side = |dir: bool, normal: bool| match (dir, normal) {
			(false, true) => "FN",
			(false, false) => "FR",
			(true, true) => "DN",
			(true, false) => "DR",
		};
		write!(
			f,
			"{}_{}_{}_{}",
			side(self.is_local_dir(), self.is_local_normal()),
			side(self.is_remote_dir(), self.is_remote_normal()),
			match self.kind() {
				PairKind::Insert => "INSERT",
				PairKind::Update => "UPDATE",
				PairKind::Conflict => "CONFLICT",
			},
			if self.is_data() { "DATA" } else { "META" }
		)
	}
}

/// One classified pull unit: apply the remote row onto the local tree.
#[derive(Debug, Clone)]
pub struct SyncFile {
	pub mask: SyncMask,
	pub local: Option<FileStat>,
	pub remote: FileStat,
}

impl SyncFile {
	/// Classify a pull pair. `kind` comes from the vector-clock comparison
	/// done by the caller.
	pub fn pull(local: Option<FileStat>, remote: FileStat, kind: PairKind) -> Self {
		let mut mask = SyncMask::new();
		mask.set_remote(&remote);
		if let Some(local) = &local {
			mask.set_local(local);
		}
		mask.set_kind(kind);

		// content moves only towards a live remote regular file whose bytes
		// differ from what is on this side
		let needs_data = remote.status == FileStatus::Normal
			&& remote.ftype == FileType::Reg
			&& local
				.as_ref()
				.map(|l| {
					l.status != FileStatus::Normal
						|| l.ftype != FileType::Reg
						|| l.sha1 != remote.sha1
				})
				.unwrap_or(true);
		if needs_data {
			mask.set_data();
		} else {
			mask.set_meta();
		}

		SyncFile { mask, local, remote }
	}

	pub fn path(&self) -> &str {
		&self.remote.path
	}

	/// Remove-side half of a potential rename: the peer tombstoned a regular
	/// file we still hold.
	pub fn is_rename_from(&self) -> bool {
		self.mask.kind() == PairKind::Update
			&& !self.mask.is_remote_normal()
			&& !self.mask.is_remote_dir()
			&& self.mask.is_local_normal()
			&& !self.mask.is_local_dir()
			&& self.local.as_ref().map(|l| !l.sha1.is_empty()).unwrap_or(false)
	}

	/// Create-side half of a potential rename: the peer introduced content
	/// that may already exist here under another path.
	pub fn is_rename_to(&self) -> bool {
		self.mask.is_data()
			&& self.mask.kind() != PairKind::Conflict
			&& self.mask.is_remote_normal()
			&& !self.mask.is_remote_dir()
			&& !self.remote.sha1.is_empty()
	}
}

/// A folded delete+create pair: same content, new path.
#[derive(Debug, Clone)]
pub struct RenamePair {
	pub from: SyncFile,
	pub to: SyncFile,
}

/// Outcome of pairing the two rows of one path.
#[derive(Debug, Clone)]
pub enum PairDecision {
	/// Nothing to move in either direction
	Consistent,
	/// Apply the remote row locally
	Pull(SyncFile),
	/// Offer the local row to the peer
	PushCandidate,
	/// Both sides diverged
	Conflict(SyncFile),
}

/// Pure classification of one path's row pair. The remote clock must already
/// be remapped into the local layout.
pub fn decide_pair(local: Option<&FileStat>, remote: Option<&FileStat>) -> PairDecision {
	match (local, remote) {
		(None, None) => PairDecision::Consistent,
		(None, Some(remote)) => {
			PairDecision::Pull(SyncFile::pull(None, remote.clone(), PairKind::Insert))
		}
		(Some(_), None) => PairDecision::PushCandidate,
		(Some(local), Some(remote)) => match local.vclock().compare(&remote.vclock()) {
			VClockCmp::Equal => PairDecision::Consistent,
			VClockCmp::Greater => PairDecision::PushCandidate,
			VClockCmp::Less => PairDecision::Pull(SyncFile::pull(
				Some(local.clone()),
				remote.clone(),
				PairKind::Update,
			)),
			VClockCmp::Conflict => PairDecision::Conflict(SyncFile::pull(
				Some(local.clone()),
				remote.clone(),
				PairKind::Conflict,
			)),
		},
	}
}

/// A backup source never ingests a deletion coming back from its mirror.
pub fn backup_src_refuses(local_backup: BackupType, sf: &SyncFile) -> bool {
	local_backup == BackupType::Src && !sf.mask.is_remote_normal()
}

/// A backup destination never emits its local mutations upstream.
pub fn backup_dst_refuses_emit(local_backup: BackupType) -> bool {
	local_backup == BackupType::Dst
}

/// Winner of a divergent pair: the side with the lexicographically lower
/// device uuid keeps the path, the loser's content moves to a conflict copy.
pub fn remote_wins_conflict(local_device_uuid: &str, remote_device_uuid: &str) -> bool {
	remote_device_uuid < local_device_uuid
}


// vim: ts=4
