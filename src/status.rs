//! Tree-pair transfer status
//!
//! Every (local tree, remote tree) pair tracks how much work the last
//! reconciliation found and how the running transfer is progressing. A
//! single global ticker derives transfer speeds for all pairs and pushes
//! coalesced snapshots to subscribers.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Smoothing factor of the speed average, per 1 s tick.
const SPEED_EWMA_ALPHA: f64 = 0.5;
/// Minimum interval between snapshots pushed for one pair.
pub const NOTIFY_INTERVAL_MS: i64 = 500;

#[derive(Debug, Default)]
pub struct TreePairStat {
	// totals published by the updater after classification
	static_file_to_upload: AtomicI64,
	static_file_to_download: AtomicI64,
	static_file_consistent: AtomicI64,
	static_byte_to_upload: AtomicI64,
	static_byte_to_download: AtomicI64,
	static_byte_consistent: AtomicI64,

	// live progress maintained by the task runner
	byte_uploaded: AtomicI64,
	byte_downloaded: AtomicI64,
	upload_path: Mutex<String>,
	download_path: Mutex<String>,

	// derived by the global ticker
	speed_upload: AtomicI64,
	speed_download: AtomicI64,
	tick_byte_uploaded: AtomicI64,
	tick_byte_downloaded: AtomicI64,
}

/// Point-in-time copy of one pair's counters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TreePairSnapshot {
	pub local_tree_id: i32,
	pub remote_tree_id: i32,
	pub file_to_upload: i64,
	pub file_to_download: i64,
	pub file_consistent: i64,
	pub byte_to_upload: i64,
	pub byte_to_download: i64,
	pub byte_consistent: i64,
	pub byte_uploaded: i64,
	pub byte_downloaded: i64,
	pub upload_path: String,
	pub download_path: String,
	pub speed_upload: i64,
	pub speed_download: i64,
}

impl TreePairStat {
	pub fn set_static(
		&self,
		file_to_upload: i64,
		file_to_download: i64,
		file_consistent: i64,
		byte_to_upload: i64,
		byte_to_download: i64,
		byte_consistent: i64,
	) {
		self.static_file_to_upload.store(file_to_upload, Ordering::Relaxed);
		self.static_file_to_download.store(file_to_download, Ordering::Relaxed);
		self.static_file_consistent.store(file_consistent, Ordering::Relaxed);
		self.static_byte_to_upload.store(byte_to_upload, Ordering::Relaxed);
		self.static_byte_to_download.store(byte_to_download, Ordering::Relaxed);
		self.static_byte_consistent.store(byte_consistent, Ordering::Relaxed);
	}

	pub fn add_byte_uploaded(&self, n: i64) {
		self.byte_uploaded.fetch_add(n, Ordering::Relaxed);
	}

	pub fn add_byte_downloaded(&self, n: i64) {
		self.byte_downloaded.fetch_add(n, Ordering::Relaxed);
	}

	pub fn set_upload_path(&self, path: &str) {
		*self.upload_path.lock().unwrap() = path.to_string();
	}

	pub fn set_download_path(&self, path: &str) {
		*self.download_path.lock().unwrap() = path.to_string();
	}

	/// One tick of the global timer: fold the byte delta into the speed.
	fn tick(&self) {
		let up = self.byte_uploaded.load(Ordering::Relaxed);
		let down = self.byte_downloaded.load(Ordering::Relaxed);
		let up_delta = up - self.tick_byte_uploaded.swap(up, Ordering::Relaxed);
		let down_delta = down - self.tick_byte_downloaded.swap(down, Ordering::Relaxed);

		let fold = |speed: &AtomicI64, delta: i64| {
			let old = speed.load(Ordering::Relaxed) as f64;
			let next = SPEED_EWMA_ALPHA * delta as f64 + (1.0 - SPEED_EWMA_ALPHA) * old;
			speed.store(next as i64, Ordering::Relaxed);
		};
		fold(&self.speed_upload, up_delta);
		fold(&self.speed_download, down_delta);
	}

	fn snapshot(&self, local_tree_id: i32, remote_tree_id: i32) -> TreePairSnapshot {
		TreePairSnapshot {
			local_tree_id,
			remote_tree_id,
			file_to_upload: self.static_file_to_upload.load(Ordering::Relaxed),
			file_to_download: self.static_file_to_download.load(Ordering::Relaxed),
			file_consistent: self.static_file_consistent.load(Ordering::Relaxed),
			byte_to_upload: self.static_byte_to_upload.load(Ordering::Relaxed),
			byte_to_download: self.static_byte_to_download.load(Ordering::Relaxed),
			byte_consistent: self.static_byte_consistent.load(Ordering::Relaxed),
			byte_uploaded: self.byte_uploaded.load(Ordering::Relaxed),
			byte_downloaded: self.byte_downloaded.load(Ordering::Relaxed),
			upload_path: self.upload_path.lock().unwrap().clone(),
			download_path: self.download_path.lock().unwrap().clone(),
			speed_upload: self.speed_upload.load(Ordering::Relaxed),
			speed_download: self.speed_download.load(Ordering::Relaxed),
		}
	}
}

/// Registry of pair stats plus the snapshot fan-out.
#[derive(Default)]
pub struct StatusManager {
	pairs: Mutex<HashMap<(i32, i32), Arc<TreePairStat>>>,
	subscribers: Mutex<Vec<mpsc::UnboundedSender<TreePairSnapshot>>>,
	last_sent: Mutex<HashMap<(i32, i32), (i64, TreePairSnapshot)>>,
}

impl StatusManager {
	pub fn new() -> Arc<Self> {
		Arc::new(Self::default())
	}

	/// The stat cell of a pair, created on first use.
	pub fn pair(&self, local_tree_id: i32, remote_tree_id: i32) -> Arc<TreePairStat> {
		let mut pairs = self.pairs.lock().unwrap();
		pairs.entry((local_tree_id, remote_tree_id)).or_default().clone()
	}

	pub fn subscribe(&self) -> mpsc::UnboundedReceiver<TreePairSnapshot> {
		let (tx, rx) = mpsc::unbounded_channel();
		self.subscribers.lock().unwrap().push(tx);
		rx
	}

	pub fn snapshots(&self) -> Vec<TreePairSnapshot> {
		let pairs = self.pairs.lock().unwrap();
		pairs.iter().map(|((l, r), stat)| stat.snapshot(*l, *r)).collect()
	}

	/// Run one timer tick: update speeds, then push changed snapshots, at
	/// most one per pair per notify interval.
	pub fn run_tick(&self, now_ms: i64) {
		let snapshots: Vec<TreePairSnapshot> = {
			let pairs = self.pairs.lock().unwrap();
			pairs
				.iter()
				.map(|((l, r), stat)| {
					stat.tick();
					stat.snapshot(*l, *r)
				})
				.collect()
		};

		let mut to_send = Vec::new();
		{
			let mut last_sent = self.last_sent.lock().unwrap();
			for snapshot in snapshots {
				let key = (snapshot.local_tree_id, snapshot.remote_tree_id);
				let due = match last_sent.get(&key) {
					Some((at, prev)) => {
						now_ms - at >= NOTIFY_INTERVAL_MS && *prev != snapshot
					}
					None => true,
				};
				if due {
					last_sent.insert(key, (now_ms, snapshot.clone()));
					to_send.push(snapshot);
				}
			}
		}

		if !to_send.is_empty() {
			let mut subscribers = self.subscribers.lock().unwrap();
			subscribers.retain(|tx| {
				to_send.iter().all(|snapshot| tx.send(snapshot.clone()).is_ok())
			});
		}
	}

	/// Spawn the global 1 s ticker driving speed calculation for all pairs.
	pub fn spawn_ticker(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
		let manager = Arc::clone(self);
		tokio::spawn(async move {
			let mut interval = tokio::time::interval(Duration::from_secs(1));
			loop {
				interval.tick().await;
				manager.run_tick(crate::util::os_time_ms());
			}
		})
	}
}


// vim: ts=4
