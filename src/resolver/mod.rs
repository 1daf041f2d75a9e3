//! Content resolver: a process-wide registry of storage providers
//!
//! Providers are keyed by *authority*. The engine uses one authority for the
//! global tables (`main`) and one per tree for its file table
//! (`tree/<uuid>`). All multi-row mutations go through [`apply_batch`],
//! which is atomic per authority; single-row helpers are one-op batches.
//!
//! Observers register per [`Uri`]; after every successful batch the resolver
//! notifies each observer at most once per touched table.
//!
//! [`apply_batch`]: ContentResolver::apply_batch

mod observer;
mod ops;
mod provider;

pub use observer::{ObserverHandle, Uri};
pub use ops::{OnConflict, Op, OpKind, OperationList};
pub use provider::{Provider, TableProvider};

use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

/// Binds a row struct to its table and storage key.
pub trait Record: Serialize + DeserializeOwned + Send + Sync + 'static {
	const TABLE: &'static str;

	fn key(&self) -> String;
}

/// The process-wide provider registry and notification hub.
pub struct ContentResolver {
	providers: RwLock<HashMap<String, Arc<dyn Provider>>>,
	observers: observer::ObserverRegistry,
}

impl Default for ContentResolver {
	fn default() -> Self {
		Self::new()
	}
}

impl ContentResolver {
	pub fn new() -> Self {
		ContentResolver {
			providers: RwLock::new(HashMap::new()),
			observers: observer::ObserverRegistry::new(),
		}
	}

	pub fn register_provider(&self, authority: &str, provider: Arc<dyn Provider>) {
		let mut providers = self.providers.write().unwrap();
		providers.insert(authority.to_string(), provider);
	}

	/// Remove a provider from the registry. Snapshots handed out earlier keep
	/// their own `Arc` and stay readable.
	pub fn remove_provider(&self, authority: &str) -> bool {
		let mut providers = self.providers.write().unwrap();
		providers.remove(authority).is_some()
	}

	pub fn has_provider(&self, authority: &str) -> bool {
		let providers = self.providers.read().unwrap();
		providers.contains_key(authority)
	}

	fn provider(&self, authority: &str) -> Result<Arc<dyn Provider>> {
		let providers = self.providers.read().unwrap();
		providers
			.get(authority)
			.cloned()
			.ok_or_else(|| Error::Content { message: format!("no provider for {}", authority) })
	}

	/// Fetch one row by key.
	pub fn get<R: Record>(&self, authority: &str, key: &str) -> Result<Option<R>> {
		let provider = self.provider(authority)?;
		match provider.get(R::TABLE, key)? {
			Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
			None => Ok(None),
		}
	}

	/// All rows of a table, in key order.
	pub fn query_all<R: Record>(&self, authority: &str) -> Result<Vec<R>> {
		let provider = self.provider(authority)?;
		let raw = provider.scan(R::TABLE)?;
		let mut rows = Vec::with_capacity(raw.len());
		for (_key, bytes) in raw {
			rows.push(bincode::deserialize(&bytes)?);
		}
		Ok(rows)
	}

	pub fn insert<R: Record>(&self, authority: &str, row: &R, on_conflict: OnConflict) -> Result<()> {
		let mut ops = OperationList::new();
		ops.insert(row, on_conflict)?;
		self.apply_batch(authority, ops)?;
		Ok(())
	}

	pub fn update<R: Record>(&self, authority: &str, row: &R) -> Result<()> {
		let mut ops = OperationList::new();
		ops.update(row)?;
		self.apply_batch(authority, ops)?;
		Ok(())
	}

	pub fn delete<R: Record>(&self, authority: &str, key: &str) -> Result<()> {
		let mut ops = OperationList::new();
		ops.delete::<R>(key);
		self.apply_batch(authority, ops)?;
		Ok(())
	}

	pub fn bulk_insert<R: Record>(
		&self,
		authority: &str,
		rows: &[R],
		on_conflict: OnConflict,
	) -> Result<usize> {
		let mut ops = OperationList::new();
		for row in rows {
			ops.insert(row, on_conflict)?;
		}
		self.apply_batch(authority, ops)
	}

	/// Apply a batch atomically against one authority. Returns the number of
	/// rows actually written. On error nothing of the batch is committed.
	pub fn apply_batch(&self, authority: &str, ops: OperationList) -> Result<usize> {
		if ops.is_empty() {
			return Ok(0);
		}
		let provider = self.provider(authority)?;
		let touched = ops.touched_tables();
		let written = provider.apply(ops.as_slice())?;
		let events: Vec<Uri> =
			touched.into_iter().map(|table| Uri::table(authority, table)).collect();
		self.observers.notify(&events);
		Ok(written)
	}

	/// Register an observer. With `notify_descendants` the observer also
	/// receives events for any table under the registered URI.
	pub fn register_observer(&self, uri: Uri, notify_descendants: bool) -> ObserverHandle {
		self.observers.register(uri, notify_descendants)
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use serde::Deserialize;

	#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
	struct Note {
		key: String,
		text: String,
	}

	impl Record for Note {
		const TABLE: &'static str = "note";

		fn key(&self) -> String {
			self.key.clone()
		}
	}

	fn resolver_with_provider() -> (tempfile::TempDir, ContentResolver) {
		let tmp = tempfile::TempDir::new().unwrap();
		let provider = TableProvider::open(&tmp.path().join("t.redb"), &["note"]).unwrap();
		let resolver = ContentResolver::new();
		resolver.register_provider("test", provider);
		(tmp, resolver)
	}

	#[test]
	fn test_insert_get_round_trip() {
		let (_tmp, resolver) = resolver_with_provider();
		let note = Note { key: "k1".into(), text: "hello".into() };
		resolver.insert("test", &note, OnConflict::Abort).unwrap();
		let read: Note = resolver.get("test", "k1").unwrap().unwrap();
		assert_eq!(read, note);
	}

	#[test]
	fn test_insert_abort_on_duplicate() {
		let (_tmp, resolver) = resolver_with_provider();
		let note = Note { key: "k1".into(), text: "hello".into() };
		resolver.insert("test", &note, OnConflict::Abort).unwrap();
		assert!(resolver.insert("test", &note, OnConflict::Abort).is_err());
		resolver.insert("test", &note, OnConflict::Ignore).unwrap();
		resolver.insert("test", &note, OnConflict::Replace).unwrap();
	}

	#[test]
	fn test_batch_is_atomic_on_conflict() {
		let (_tmp, resolver) = resolver_with_provider();
		let first = Note { key: "a".into(), text: "1".into() };
		resolver.insert("test", &first, OnConflict::Abort).unwrap();

		let mut ops = OperationList::new();
		ops.insert(&Note { key: "b".into(), text: "2".into() }, OnConflict::Abort).unwrap();
		ops.insert(&first, OnConflict::Abort).unwrap(); // duplicate, must fail
		assert!(resolver.apply_batch("test", ops).is_err());

		// the batch must not have committed its first op
		assert!(resolver.get::<Note>("test", "b").unwrap().is_none());
	}

	#[test]
	fn test_query_all_in_key_order() {
		let (_tmp, resolver) = resolver_with_provider();
		for key in ["c", "a", "b"] {
			let note = Note { key: key.into(), text: key.into() };
			resolver.insert("test", &note, OnConflict::Abort).unwrap();
		}
		let rows: Vec<Note> = resolver.query_all("test").unwrap();
		let keys: Vec<&str> = rows.iter().map(|n| n.key.as_str()).collect();
		assert_eq!(keys, vec!["a", "b", "c"]);
	}

	#[test]
	fn test_observer_sees_table_event_once_per_batch() {
		let (_tmp, resolver) = resolver_with_provider();
		let mut handle = resolver.register_observer(Uri::authority("test"), true);

		let mut ops = OperationList::new();
		ops.insert(&Note { key: "a".into(), text: "1".into() }, OnConflict::Abort).unwrap();
		ops.insert(&Note { key: "b".into(), text: "2".into() }, OnConflict::Abort).unwrap();
		resolver.apply_batch("test", ops).unwrap();

		let event = handle.try_recv().expect("one event");
		assert_eq!(event.authority, "test");
		assert!(handle.try_recv().is_none(), "coalesced to one event per table");
	}

	#[test]
	fn test_missing_provider_is_content_error() {
		let resolver = ContentResolver::new();
		let err = resolver.get::<Note>("nope", "k").unwrap_err();
		assert!(matches!(err, Error::Content { .. }));
	}
}

// vim: ts=4
