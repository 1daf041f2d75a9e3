//! Cooperative abort flags
//!
//! Long-running loops (scanner visitor, updater merge-join, task batch loop)
//! poll these between batch-sized units of work and return `Error::Cancel`
//! promptly. Partial work already committed stays committed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

/// A cloneable cancellation flag handed to in-flight transport calls.
#[derive(Clone, Default)]
pub struct AbortFlag(Arc<AtomicBool>);

impl AbortFlag {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn set(&self) {
		self.0.store(true, Ordering::SeqCst);
	}

	pub fn is_set(&self) -> bool {
		self.0.load(Ordering::SeqCst)
	}
}

/// Global shutdown flag plus a per tree-pair abort set.
#[derive(Clone, Default)]
pub struct AbortRegistry {
	inner: Arc<AbortInner>,
}

#[derive(Default)]
struct AbortInner {
	global: AtomicBool,
	pairs: Mutex<HashSet<(i32, i32)>>,
}

impl AbortRegistry {
	pub fn new() -> Self {
		Self::default()
	}

	/// Request engine-wide shutdown.
	pub fn abort_all(&self) {
		self.inner.global.store(true, Ordering::SeqCst);
	}

	pub fn is_aborted(&self) -> bool {
		self.inner.global.load(Ordering::SeqCst)
	}

	/// Abort work for one (local_tree, remote_tree) pair, e.g. when the pair
	/// is being deleted under a running sync.
	pub fn abort_pair(&self, local_tree_id: i32, remote_tree_id: i32) {
		let mut pairs = self.inner.pairs.lock().unwrap();
		pairs.insert((local_tree_id, remote_tree_id));
	}

	pub fn clear_pair(&self, local_tree_id: i32, remote_tree_id: i32) {
		let mut pairs = self.inner.pairs.lock().unwrap();
		pairs.remove(&(local_tree_id, remote_tree_id));
	}

	pub fn pair_aborted(&self, local_tree_id: i32, remote_tree_id: i32) -> bool {
		if self.is_aborted() {
			return true;
		}
		let pairs = self.inner.pairs.lock().unwrap();
		pairs.contains(&(local_tree_id, remote_tree_id))
	}
}


// vim: ts=4
