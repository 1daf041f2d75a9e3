//! Small helpers: path normalization, time, content fingerprints

use sha1::{Digest, Sha1};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::{Error, Result};
use crate::model::UnixAttr;
use crate::types::FileType;

/// Snapshot of what one stat call observed on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiskStat {
	pub ftype: FileType,
	pub mtime: i64,
	pub length: i64,
	pub attr: UnixAttr,
}

/// Reduce filesystem metadata to the fields the engine tracks.
pub fn disk_stat(meta: &std::fs::Metadata) -> DiskStat {
	let ftype = if meta.is_dir() { FileType::Dir } else { FileType::Reg };
	let mtime = meta
		.modified()
		.ok()
		.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0);
	let length = if meta.is_dir() { 0 } else { meta.len() as i64 };
	#[cfg(unix)]
	let attr = {
		use std::os::unix::fs::MetadataExt;
		UnixAttr { mode: meta.mode(), uid: meta.uid(), gid: meta.gid() }
	};
	#[cfg(not(unix))]
	let attr = UnixAttr::default();
	DiskStat { ftype, mtime, length, attr }
}

/// Normalize a tree-relative path to the canonical row form: '/'-separated,
/// leading '/', no trailing slash, no empty or dot segments.
///
/// Returns `InvalidPath` when a segment would escape the root (`..`).
pub fn normalize_path(raw: &str) -> Result<String> {
	let mut out = String::with_capacity(raw.len() + 1);
	for seg in raw.split(['/', '\\']) {
		match seg {
			"" | "." => continue,
			".." => return Err(Error::InvalidPath { path: raw.to_string() }),
			_ => {
				out.push('/');
				out.push_str(seg);
			}
		}
	}
	if out.is_empty() {
		out.push('/');
	}
	Ok(out)
}

/// Relative form of a canonical path, for joining onto a tree root.
pub fn relative_part(canonical: &str) -> &str {
	canonical.trim_start_matches('/')
}

/// Join a canonical row path onto a tree root directory.
pub fn path_on_disk(root: &Path, canonical: &str) -> PathBuf {
	root.join(relative_part(canonical))
}

/// Current time, seconds since the epoch.
pub fn os_time_s() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
}

/// Current time, milliseconds since the epoch.
pub fn os_time_ms() -> i64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// SHA-1 fingerprint of a file's content, hex-encoded.
pub fn sha1_of_file(path: &Path) -> Result<String> {
	let mut file = std::fs::File::open(path)?;
	let mut hasher = Sha1::new();
	let mut buf = [0u8; 64 * 1024];
	loop {
		let n = file.read(&mut buf)?;
		if n == 0 {
			break;
		}
		hasher.update(&buf[..n]);
	}
	Ok(hex::encode(hasher.finalize()))
}

/// SHA-1 fingerprint of a byte slice, hex-encoded.
pub fn sha1_of_bytes(bytes: &[u8]) -> String {
	let mut hasher = Sha1::new();
	hasher.update(bytes);
	hex::encode(hasher.finalize())
}

/// Name for the losing side of a content conflict. If the first candidate is
/// taken on disk a numeric suffix is appended.
pub fn conflict_path(canonical: &str, device_uuid: &str, root: &Path) -> String {
	let base = format!("{}.conflict-{}", canonical, device_uuid);
	if !path_on_disk(root, &base).exists() {
		return base;
	}
	let mut n = 2;
	loop {
		let candidate = format!("{}-{}", base, n);
		if !path_on_disk(root, &candidate).exists() {
			return candidate;
		}
		n += 1;
	}
}


// vim: ts=4
