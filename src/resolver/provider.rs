//! Storage providers
//!
//! The default provider keeps each authority in its own redb database with
//! one key/value table per row type. Writers are serialized behind an
//! explicit lock; readers run on independent read transactions and see
//! atomic snapshots.

use redb::{ReadableDatabase, ReadableTable, TableDefinition};
use std::path::Path;
use std::sync::{Arc, RwLock};

use crate::error::{Error, Result};

use super::ops::{Op, OpKind, OnConflict};

/// Uniform CRUD surface the resolver talks to.
pub trait Provider: Send + Sync {
	fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>>;

	/// All rows of a table in key order.
	fn scan(&self, table: &str) -> Result<Vec<(String, Vec<u8>)>>;

	/// Apply the batch atomically. Returns the number of rows written.
	fn apply(&self, ops: &[Op]) -> Result<usize>;
}

fn table_def(name: &str) -> TableDefinition<'_, &'static str, &'static [u8]> {
	TableDefinition::new(name)
}

/// redb-backed provider for one authority.
pub struct TableProvider {
	db: redb::Database,
	rw: RwLock<()>,
}

impl TableProvider {
	/// Open (or create) the database and make sure the named tables exist, so
	/// that read transactions never race table creation.
	pub fn open(path: &Path, tables: &[&str]) -> Result<Arc<Self>> {
		if let Some(parent) = path.parent() {
			std::fs::create_dir_all(parent)?;
		}
		let db = redb::Database::create(path)?;
		{
			let write_txn = db.begin_write()?;
			for name in tables {
				let _ = write_txn.open_table(table_def(name))?;
			}
			write_txn.commit()?;
		}
		Ok(Arc::new(TableProvider { db, rw: RwLock::new(()) }))
	}
}

impl Provider for TableProvider {
	fn get(&self, table: &str, key: &str) -> Result<Option<Vec<u8>>> {
		let _read = self.rw.read().unwrap();
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(table_def(table))?;
		match table.get(key)? {
			Some(entry) => Ok(Some(entry.value().to_vec())),
			None => Ok(None),
		}
	}

	fn scan(&self, table: &str) -> Result<Vec<(String, Vec<u8>)>> {
		let _read = self.rw.read().unwrap();
		let read_txn = self.db.begin_read()?;
		let table = read_txn.open_table(table_def(table))?;
		let mut rows = Vec::new();
		let mut iter = table.iter()?;
		loop {
			match iter.next() {
				Some(Ok((key, value))) => {
					rows.push((key.value().to_string(), value.value().to_vec()));
				}
				Some(Err(e)) => return Err(e.into()),
				None => break,
			}
		}
		Ok(rows)
	}

	fn apply(&self, ops: &[Op]) -> Result<usize> {
		let _write = self.rw.write().unwrap();
		let write_txn = self.db.begin_write()?;
		let mut written = 0usize;
		{
			for op in ops {
				let mut table = write_txn.open_table(table_def(op.table))?;
				match op.kind {
					OpKind::Insert(on_conflict) => {
						let exists = table.get(op.key.as_str())?.is_some();
						match (exists, on_conflict) {
							(true, OnConflict::Abort) => {
								return Err(Error::Content {
									message: format!(
										"{}/{}: duplicate key",
										op.table, op.key
									),
								});
							}
							(true, OnConflict::Ignore) => continue,
							_ => {}
						}
						let value = op.value.as_deref().unwrap_or(&[]);
						table.insert(op.key.as_str(), value)?;
						written += 1;
					}
					OpKind::Update => {
						if table.get(op.key.as_str())?.is_none() {
							return Err(Error::Content {
								message: format!("{}/{}: update of missing row", op.table, op.key),
							});
						}
						let value = op.value.as_deref().unwrap_or(&[]);
						table.insert(op.key.as_str(), value)?;
						written += 1;
					}
					OpKind::Delete => {
						if table.remove(op.key.as_str())?.is_some() {
							written += 1;
						}
					}
				}
			}
		}
		write_txn.commit()?;
		Ok(written)
	}
}


// vim: ts=4
