//! Typed operation batches

use crate::error::Result;

use super::Record;

/// What to do when an insert hits an existing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnConflict {
	/// Fail the whole batch
	Abort,
	/// Keep the existing row
	Ignore,
	/// Overwrite
	Replace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
	Insert(OnConflict),
	Update,
	Delete,
}

/// One storage operation, already encoded.
#[derive(Debug, Clone)]
pub struct Op {
	pub table: &'static str,
	pub key: String,
	pub value: Option<Vec<u8>>,
	pub kind: OpKind,
}

/// An ordered list of operations applied atomically against one authority.
#[derive(Debug, Default)]
pub struct OperationList {
	ops: Vec<Op>,
}

impl OperationList {
	pub fn new() -> Self {
		OperationList { ops: Vec::new() }
	}

	pub fn insert<R: Record>(&mut self, row: &R, on_conflict: OnConflict) -> Result<()> {
		self.ops.push(Op {
			table: R::TABLE,
			key: row.key(),
			value: Some(bincode::serialize(row)?),
			kind: OpKind::Insert(on_conflict),
		});
		Ok(())
	}

	/// Replace an existing row; fails the batch when the key is absent.
	pub fn update<R: Record>(&mut self, row: &R) -> Result<()> {
		self.ops.push(Op {
			table: R::TABLE,
			key: row.key(),
			value: Some(bincode::serialize(row)?),
			kind: OpKind::Update,
		});
		Ok(())
	}

	/// Delete by key; absent keys are a no-op.
	pub fn delete<R: Record>(&mut self, key: &str) {
		self.ops.push(Op { table: R::TABLE, key: key.to_string(), value: None, kind: OpKind::Delete });
	}

	pub fn len(&self) -> usize {
		self.ops.len()
	}

	pub fn is_empty(&self) -> bool {
		self.ops.is_empty()
	}

	pub fn as_slice(&self) -> &[Op] {
		&self.ops
	}

	/// Distinct tables touched, in first-touch order.
	pub fn touched_tables(&self) -> Vec<&'static str> {
		let mut tables: Vec<&'static str> = Vec::new();
		for op in &self.ops {
			if !tables.contains(&op.table) {
				tables.push(op.table);
			}
		}
		tables
	}
}

// vim: ts=4
