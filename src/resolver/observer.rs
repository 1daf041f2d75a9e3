//! Change observers
//!
//! Observers subscribe to a [`Uri`] and receive coalesced change events over
//! an unbounded channel. Registration entries are pruned lazily when their
//! receiver side is gone.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Address of a provider, a table, or a single row.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Uri {
	pub authority: String,
	pub table: Option<String>,
	pub key: Option<String>,
}

impl Uri {
	pub fn authority(authority: &str) -> Self {
		Uri { authority: authority.to_string(), table: None, key: None }
	}

	pub fn table(authority: &str, table: &str) -> Self {
		Uri { authority: authority.to_string(), table: Some(table.to_string()), key: None }
	}

	pub fn row(authority: &str, table: &str, key: &str) -> Self {
		Uri {
			authority: authority.to_string(),
			table: Some(table.to_string()),
			key: Some(key.to_string()),
		}
	}

	/// Whether an event at `event` falls under this URI.
	fn covers(&self, event: &Uri, descendants: bool) -> bool {
		if self.authority != event.authority {
			return false;
		}
		match &self.table {
			None => descendants || event.table.is_none(),
			Some(table) => match &event.table {
				Some(event_table) if table == event_table => match &self.key {
					None => descendants || event.key.is_none(),
					Some(key) => event.key.as_deref() == Some(key.as_str()),
				},
				_ => false,
			},
		}
	}
}

impl fmt::Display for Uri {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "content://{}", self.authority)?;
		if let Some(table) = &self.table {
			write!(f, "/{}", table)?;
		}
		if let Some(key) = &self.key {
			write!(f, "/{}", key)?;
		}
		Ok(())
	}
}

struct Entry {
	id: u64,
	uri: Uri,
	descendants: bool,
	tx: mpsc::UnboundedSender<Uri>,
}

/// Receiving side of an observer registration.
pub struct ObserverHandle {
	rx: mpsc::UnboundedReceiver<Uri>,
	pub id: u64,
}

impl ObserverHandle {
	/// Await the next change event.
	pub async fn recv(&mut self) -> Option<Uri> {
		self.rx.recv().await
	}

	/// Non-blocking poll, mostly for tests.
	pub fn try_recv(&mut self) -> Option<Uri> {
		self.rx.try_recv().ok()
	}
}

pub(super) struct ObserverRegistry {
	entries: Mutex<Vec<Entry>>,
	next_id: AtomicU64,
}

impl ObserverRegistry {
	pub fn new() -> Self {
		ObserverRegistry { entries: Mutex::new(Vec::new()), next_id: AtomicU64::new(1) }
	}

	pub fn register(&self, uri: Uri, descendants: bool) -> ObserverHandle {
		let (tx, rx) = mpsc::unbounded_channel();
		let id = self.next_id.fetch_add(1, Ordering::Relaxed);
		let mut entries = self.entries.lock().unwrap();
		entries.push(Entry { id, uri, descendants, tx });
		ObserverHandle { rx, id }
	}

	/// Deliver each event to every covering observer, at most once per event
	/// per observer, and drop registrations whose receiver went away.
	pub fn notify(&self, events: &[Uri]) {
		let mut entries = self.entries.lock().unwrap();
		entries.retain(|entry| {
			let mut alive = !entry.tx.is_closed();
			for event in events {
				if !alive {
					break;
				}
				if entry.uri.covers(event, entry.descendants) {
					alive = entry.tx.send(event.clone()).is_ok();
				}
			}
			alive
		});
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_uri_display() {
		let uri = Uri::row("main", "tree", "k");
		assert_eq!(uri.to_string(), "content://main/tree/k");
	}

	#[test]
	fn test_covers_descendants() {
		let root = Uri::authority("main");
		let event = Uri::table("main", "tree");
		assert!(root.covers(&event, true));
		assert!(!root.covers(&event, false));
	}

	#[test]
	fn test_covers_table_mismatch() {
		let uri = Uri::table("main", "tree");
		assert!(!uri.covers(&Uri::table("main", "device"), true));
		assert!(!uri.covers(&Uri::table("other", "tree"), true));
	}

	#[test]
	fn test_registry_delivers_and_prunes() {
		let registry = ObserverRegistry::new();
		let mut handle = registry.register(Uri::authority("main"), true);
		registry.notify(&[Uri::table("main", "tree")]);
		assert!(handle.try_recv().is_some());

		drop(handle);
		// next notify prunes the dead entry without panicking
		registry.notify(&[Uri::table("main", "tree")]);
	}
}

// vim: ts=4
