//! Per-file causal version vectors
//!
//! Every file row carries a vector clock indexed by the trees participating
//! in its sync. Position 0 is the tree owning the row; the remaining
//! positions follow the sync's canonical tree-uuid order (ascending). A peer
//! serializes its clocks in its own layout, so a receiver remaps positions
//! through [`remap`] before comparing.

use serde::{Deserialize, Serialize};

/// Outcome of a pointwise vector-clock comparison
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VClockCmp {
	Less,
	Equal,
	Greater,
	Conflict,
}

/// A causal version vector
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VectorClock {
	data: Vec<i32>,
}

impl VectorClock {
	pub fn new(len: usize) -> Self {
		VectorClock { data: vec![0; len] }
	}

	pub fn from_vec(data: Vec<i32>) -> Self {
		VectorClock { data }
	}

	/// Rebuild from the split storage form: one local counter plus the
	/// packed peer counters.
	pub fn from_parts(local: i32, remote: &[i32]) -> Self {
		let mut data = Vec::with_capacity(remote.len() + 1);
		data.push(local);
		data.extend_from_slice(remote);
		VectorClock { data }
	}

	/// Decode from the wire blob of 4-byte little-endian integers.
	pub fn from_blob(blob: &[u8]) -> Self {
		let data = blob
			.chunks_exact(4)
			.map(|c| i32::from_le_bytes([c[0], c[1], c[2], c[3]]))
			.collect();
		VectorClock { data }
	}

	/// Encode as 4-byte little-endian integers.
	pub fn to_blob(&self) -> Vec<u8> {
		let mut blob = Vec::with_capacity(self.data.len() * 4);
		for v in &self.data {
			blob.extend_from_slice(&v.to_le_bytes());
		}
		blob
	}

	pub fn len(&self) -> usize {
		self.data.len()
	}

	pub fn is_empty(&self) -> bool {
		self.data.is_empty()
	}

	/// Component at `idx`; positions beyond the stored length read as zero.
	pub fn at(&self, idx: usize) -> i32 {
		self.data.get(idx).copied().unwrap_or(0)
	}

	pub fn set(&mut self, idx: usize, value: i32) {
		if idx >= self.data.len() {
			self.data.resize(idx + 1, 0);
		}
		self.data[idx] = value;
	}

	/// Increment the owning tree's component.
	pub fn bump_local(&mut self) {
		if self.data.is_empty() {
			self.data.push(0);
		}
		self.data[0] += 1;
	}

	pub fn local(&self) -> i32 {
		self.at(0)
	}

	/// Peer components (everything after position 0).
	pub fn remote(&self) -> Vec<i32> {
		self.data.iter().skip(1).copied().collect()
	}

	pub fn as_slice(&self) -> &[i32] {
		&self.data
	}

	/// Pointwise comparison; missing positions on either side read as zero.
	pub fn compare(&self, other: &VectorClock) -> VClockCmp {
		let len = self.data.len().max(other.data.len());
		let mut result = VClockCmp::Equal;
		for i in 0..len {
			let a = self.at(i);
			let b = other.at(i);
			let step = if a < b {
				VClockCmp::Less
			} else if a == b {
				VClockCmp::Equal
			} else {
				VClockCmp::Greater
			};
			if result == VClockCmp::Equal {
				result = step;
			} else if step != VClockCmp::Equal && step != result {
				return VClockCmp::Conflict;
			}
		}
		result
	}

	/// Pointwise maximum, growing to the larger length.
	pub fn merge(&mut self, other: &VectorClock) {
		if self.data.len() < other.data.len() {
			self.data.resize(other.data.len(), 0);
		}
		for i in 0..self.data.len() {
			let b = other.at(i);
			if b > self.data[i] {
				self.data[i] = b;
			}
		}
	}
}

/// Canonical clock layout of a tree within its sync: the owning tree first,
/// then every other participating tree uuid in ascending order.
pub fn layout_for(owner_uuid: &str, all_tree_uuids: &[String]) -> Vec<String> {
	let mut layout = Vec::with_capacity(all_tree_uuids.len());
	layout.push(owner_uuid.to_string());
	let mut rest: Vec<&String> =
		all_tree_uuids.iter().filter(|u| u.as_str() != owner_uuid).collect();
	rest.sort();
	for u in rest {
		layout.push(u.clone());
	}
	layout
}

/// Remap a clock from one layout into another. Components for uuids unknown
/// to the target layout are dropped; unknown target positions read as zero.
pub fn remap(vc: &VectorClock, from_layout: &[String], to_layout: &[String]) -> VectorClock {
	let mut out = VectorClock::new(to_layout.len());
	for (i, uuid) in from_layout.iter().enumerate() {
		if let Some(j) = to_layout.iter().position(|u| u == uuid) {
			out.set(j, vc.at(i));
		}
	}
	out
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_compare_equal() {
		let a = VectorClock::from_vec(vec![1, 2, 3]);
		let b = VectorClock::from_vec(vec![1, 2, 3]);
		assert_eq!(a.compare(&b), VClockCmp::Equal);
	}

	#[test]
	fn test_compare_less_greater() {
		let a = VectorClock::from_vec(vec![1, 2, 3]);
		let b = VectorClock::from_vec(vec![1, 3, 3]);
		assert_eq!(a.compare(&b), VClockCmp::Less);
		assert_eq!(b.compare(&a), VClockCmp::Greater);
	}

	#[test]
	fn test_compare_conflict() {
		let a = VectorClock::from_vec(vec![2, 1]);
		let b = VectorClock::from_vec(vec![1, 2]);
		assert_eq!(a.compare(&b), VClockCmp::Conflict);
	}

	#[test]
	fn test_compare_length_mismatch_reads_zero() {
		let a = VectorClock::from_vec(vec![1]);
		let b = VectorClock::from_vec(vec![1, 1]);
		assert_eq!(a.compare(&b), VClockCmp::Less);
		let c = VectorClock::from_vec(vec![1, 0]);
		assert_eq!(a.compare(&c), VClockCmp::Equal);
	}

	#[test]
	fn test_merge_grows_and_maxes() {
		let mut a = VectorClock::from_vec(vec![3, 0]);
		let b = VectorClock::from_vec(vec![1, 2, 5]);
		a.merge(&b);
		assert_eq!(a.as_slice(), &[3, 2, 5]);
	}

	#[test]
	fn test_blob_round_trip() {
		let a = VectorClock::from_vec(vec![1, -1, 70000]);
		let blob = a.to_blob();
		assert_eq!(blob.len(), 12);
		assert_eq!(VectorClock::from_blob(&blob), a);
	}

	#[test]
	fn test_layout_owner_first_rest_sorted() {
		let uuids = vec!["b".to_string(), "c".to_string(), "a".to_string()];
		assert_eq!(layout_for("c", &uuids), vec!["c", "a", "b"]);
	}

	#[test]
	fn test_remap_between_layouts() {
		let uuids = vec!["a".to_string(), "b".to_string(), "c".to_string()];
		let remote_layout = layout_for("c", &uuids); // [c, a, b]
		let local_layout = layout_for("a", &uuids); // [a, b, c]
		let vc = VectorClock::from_vec(vec![7, 1, 2]); // c=7, a=1, b=2
		let mapped = remap(&vc, &remote_layout, &local_layout);
		assert_eq!(mapped.as_slice(), &[1, 2, 7]);
	}

	#[test]
	fn test_remap_round_trip_preserves_compare() {
		let uuids = vec!["a".to_string(), "b".to_string()];
		let la = layout_for("a", &uuids);
		let lb = layout_for("b", &uuids);
		let vc = VectorClock::from_vec(vec![4, 9]);
		let there = remap(&vc, &la, &lb);
		let back = remap(&there, &lb, &la);
		assert_eq!(back, vc);
	}
}

// vim: ts=4
