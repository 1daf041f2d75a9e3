//! Pre-apply consistency guard
//!
//! Classification and application are separated by a window in which the
//! user may touch the local file. Right before a unit is applied the disk is
//! re-checked against the stat captured at classification time; units that
//! raced a concurrent local edit are adjusted or dropped, so that everything
//! actually applied matches the then-current disk. The next refresh picks up
//! whatever was dropped.

use std::path::{Path, PathBuf};

use crate::logging::*;
use crate::model::FileStat;
use crate::sync_file::{RenamePair, SyncFile};
use crate::types::{FileStatus, FileType};
use crate::util;

/// Decision for a single unit.
#[derive(Debug)]
pub enum Verdict {
	Proceed(SyncFile),
	Drop,
}

/// Decision for a folded rename.
#[derive(Debug)]
pub enum RenameVerdict {
	Proceed(RenamePair),
	/// Only one half survived; it reverts to its plain meaning
	Split { from: Option<SyncFile>, to: Option<SyncFile> },
	Drop,
}

pub struct ConsistencyHandler {
	root: PathBuf,
}

impl ConsistencyHandler {
	pub fn new(root: &Path) -> Self {
		ConsistencyHandler { root: root.to_path_buf() }
	}

	/// Whether the disk still looks like the captured row.
	fn captured_matches_disk(&self, captured: &FileStat, disk: Option<&util::DiskStat>) -> bool {
		match (captured.status, disk) {
			(FileStatus::Removed, None) => true,
			(FileStatus::Removed, Some(_)) => false,
			(FileStatus::Normal, None) => false,
			(FileStatus::Normal, Some(disk)) => {
				if captured.ftype != disk.ftype {
					return false;
				}
				match captured.ftype {
					FileType::Dir => true,
					FileType::Reg => {
						captured.mtime == disk.mtime && captured.length == disk.length
					}
				}
			}
		}
	}

	fn stat(&self, canonical: &str) -> Option<util::DiskStat> {
		let disk_path = util::path_on_disk(&self.root, canonical);
		std::fs::symlink_metadata(&disk_path).ok().map(|m| util::disk_stat(&m))
	}

	/// Re-check one unit against the live filesystem.
	pub fn check(&self, mut sf: SyncFile) -> Verdict {
		let disk_path = util::path_on_disk(&self.root, sf.path());
		let disk = self.stat(sf.path());

		match &sf.local {
			None => match disk {
				None => Verdict::Proceed(sf),
				Some(disk) => {
					// something appeared here since classification
					if sf.mask.is_data() && disk.ftype == FileType::Reg {
						if let Ok(sha1) = util::sha1_of_file(&disk_path) {
							if sha1 == sf.remote.sha1 {
								// identical bytes already present
								sf.mask.set_meta();
								return Verdict::Proceed(sf);
							}
						}
					}
					debug!("consistency: {} appeared locally, dropping insert", sf.path());
					Verdict::Drop
				}
			},
			Some(captured) => {
				if self.captured_matches_disk(captured, disk.as_ref()) {
					return Verdict::Proceed(sf);
				}
				if !sf.mask.is_remote_normal() {
					// delete racing a concurrent local edit: keep the bytes
					if disk.is_some() {
						debug!("consistency: {} edited locally, dropping remove", sf.path());
						return Verdict::Drop;
					}
					return Verdict::Proceed(sf);
				}
				if sf.mask.is_remote_dir() {
					debug!("consistency: {} changed under dir apply, dropping", sf.path());
					return Verdict::Drop;
				}
				// remote side is a live regular file; decide by content
				match disk {
					None => {
						// captured file vanished: fetch the bytes again
						sf.mask.set_data();
						Verdict::Proceed(sf)
					}
					Some(disk) if disk.ftype == FileType::Reg => {
						match util::sha1_of_file(&disk_path) {
							Ok(sha1) if sha1 == sf.remote.sha1 => {
								sf.mask.set_meta();
								Verdict::Proceed(sf)
							}
							Ok(_) => {
								// content moved on while we were classified
								// as meta-only: bytes are needed after all
								sf.mask.set_data();
								Verdict::Proceed(sf)
							}
							Err(e) => {
								warn!("consistency: hash {} failed: {}", sf.path(), e);
								Verdict::Drop
							}
						}
					}
					Some(_) => Verdict::Drop,
				}
			}
		}
	}

	/// Re-check a folded rename; splits back into halves when only one side
	/// still matches the disk.
	pub fn check_rename(&self, pair: RenamePair) -> RenameVerdict {
		let from_ok = pair
			.from
			.local
			.as_ref()
			.map(|captured| self.captured_matches_disk(captured, self.stat(&captured.path).as_ref()))
			.unwrap_or(false);
		let to_free = self.stat(pair.to.path()).is_none();

		match (from_ok, to_free) {
			(true, true) => RenameVerdict::Proceed(pair),
			(false, true) => {
				debug!(
					"consistency: rename source {} changed, splitting",
					pair.from.path()
				);
				RenameVerdict::Split { from: None, to: Some(pair.to) }
			}
			(true, false) => {
				debug!(
					"consistency: rename target {} occupied, splitting",
					pair.to.path()
				);
				RenameVerdict::Split { from: Some(pair.from), to: None }
			}
			(false, false) => RenameVerdict::Drop,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::model::UnixAttr;
	use crate::sync_file::PairKind;

	fn row(path: &str, status: FileStatus, sha1: &str, mtime: i64, length: i64) -> FileStat {
		FileStat {
			path: path.to_string(),
			ftype: FileType::Reg,
			status,
			mtime,
			length,
			sha1: sha1.to_string(),
			usn: 1,
			local_vclock: 1,
			remote_vclock: vec![0],
			unix_attr: UnixAttr::default(),
			android_attr: 0,
			win_attr: 0,
			modifier: String::from("dev"),
			time_stamp: 0,
			alias: None,
		}
	}

	fn mtime_len(root: &Path, rel: &str) -> (i64, i64) {
		let meta = std::fs::metadata(root.join(rel)).unwrap();
		let stat = util::disk_stat(&meta);
		(stat.mtime, stat.length)
	}

	#[test]
	fn test_clean_insert_proceeds() {
		let tmp = tempfile::TempDir::new().unwrap();
		let handler = ConsistencyHandler::new(tmp.path());
		let sf = SyncFile::pull(
			None,
			row("/a.txt", FileStatus::Normal, "s1", 10, 5),
			PairKind::Insert,
		);
		assert!(matches!(handler.check(sf), Verdict::Proceed(_)));
	}

	#[test]
	fn test_insert_raced_by_local_create_drops() {
		let tmp = tempfile::TempDir::new().unwrap();
		std::fs::write(tmp.path().join("a.txt"), b"local edit").unwrap();
		let handler = ConsistencyHandler::new(tmp.path());
		let sf = SyncFile::pull(
			None,
			row("/a.txt", FileStatus::Normal, "s-remote", 10, 5),
			PairKind::Insert,
		);
		assert!(matches!(handler.check(sf), Verdict::Drop));
	}

	#[test]
	fn test_insert_with_identical_bytes_degrades_to_meta() {
		let tmp = tempfile::TempDir::new().unwrap();
		std::fs::write(tmp.path().join("a.txt"), b"hello").unwrap();
		let handler = ConsistencyHandler::new(tmp.path());
		let sha1 = util::sha1_of_bytes(b"hello");
		let sf = SyncFile::pull(
			None,
			row("/a.txt", FileStatus::Normal, &sha1, 10, 5),
			PairKind::Insert,
		);
		match handler.check(sf) {
			Verdict::Proceed(sf) => assert!(sf.mask.is_meta()),
			other => panic!("expected proceed, got {:?}", other),
		}
	}

	#[test]
	fn test_remove_raced_by_live_file_drops() {
		let tmp = tempfile::TempDir::new().unwrap();
		std::fs::write(tmp.path().join("a.txt"), b"edited since").unwrap();
		let handler = ConsistencyHandler::new(tmp.path());
		// captured stat diverges from the live file
		let sf = SyncFile::pull(
			Some(row("/a.txt", FileStatus::Normal, "s1", 1, 1)),
			row("/a.txt", FileStatus::Removed, "s1", 10, 5),
			PairKind::Update,
		);
		assert!(matches!(handler.check(sf), Verdict::Drop));
	}

	#[test]
	fn test_meta_update_upgrades_to_data_when_content_changed() {
		let tmp = tempfile::TempDir::new().unwrap();
		std::fs::write(tmp.path().join("a.txt"), b"replaced").unwrap();
		let handler = ConsistencyHandler::new(tmp.path());
		let remote = row("/a.txt", FileStatus::Normal, "s-remote", 10, 5);
		// captured local stat pretends the sha1 still matched the remote
		let mut local = row("/a.txt", FileStatus::Normal, "s-remote", 1, 1);
		local.remote_vclock = vec![0];
		let sf = SyncFile::pull(Some(local), remote, PairKind::Update);
		assert!(sf.mask.is_meta());
		match handler.check(sf) {
			Verdict::Proceed(sf) => assert!(sf.mask.is_data()),
			other => panic!("expected proceed, got {:?}", other),
		}
	}

	#[test]
	fn test_consistent_update_proceeds_unchanged() {
		let tmp = tempfile::TempDir::new().unwrap();
		std::fs::write(tmp.path().join("a.txt"), b"hello").unwrap();
		let (mtime, length) = mtime_len(tmp.path(), "a.txt");
		let handler = ConsistencyHandler::new(tmp.path());
		let sf = SyncFile::pull(
			Some(row("/a.txt", FileStatus::Normal, "s1", mtime, length)),
			row("/a.txt", FileStatus::Normal, "s2", 20, 7),
			PairKind::Update,
		);
		match handler.check(sf) {
			Verdict::Proceed(sf) => assert!(sf.mask.is_data()),
			other => panic!("expected proceed, got {:?}", other),
		}
	}

	#[test]
	fn test_rename_splits_when_source_changed() {
		let tmp = tempfile::TempDir::new().unwrap();
		// source file is gone on disk
		let handler = ConsistencyHandler::new(tmp.path());
		let from = SyncFile::pull(
			Some(row("/old", FileStatus::Normal, "s1", 10, 5)),
			row("/old", FileStatus::Removed, "s1", 10, 5),
			PairKind::Update,
		);
		let to = SyncFile::pull(
			None,
			row("/new", FileStatus::Normal, "s1", 10, 5),
			PairKind::Insert,
		);
		match handler.check_rename(RenamePair { from, to }) {
			RenameVerdict::Split { from: None, to: Some(to) } => {
				assert_eq!(to.path(), "/new");
			}
			other => panic!("expected split, got {:?}", other),
		}
	}

	#[test]
	fn test_rename_proceeds_when_both_sides_clean() {
		let tmp = tempfile::TempDir::new().unwrap();
		std::fs::write(tmp.path().join("old"), b"hello").unwrap();
		let (mtime, length) = mtime_len(tmp.path(), "old");
		let handler = ConsistencyHandler::new(tmp.path());
		let from = SyncFile::pull(
			Some(row("/old", FileStatus::Normal, "s1", mtime, length)),
			row("/old", FileStatus::Removed, "s1", 10, 5),
			PairKind::Update,
		);
		let to = SyncFile::pull(
			None,
			row("/new", FileStatus::Normal, "s1", 10, 5),
			PairKind::Insert,
		);
		assert!(matches!(
			handler.check_rename(RenamePair { from, to }),
			RenameVerdict::Proceed(_)
		));
	}
}

// vim: ts=4
