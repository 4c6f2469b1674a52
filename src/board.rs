//! Durable update board (component C4).
//!
//! Grounded on `original_source/lib/core/components/impl/mysqlboard.py`:
//! the board is a FIFO of `(operation, serialized object)` commands backed
//! by one exclusively-locked table (`inventory_updates`). We keep that
//! contract as a trait (`UpdateBoardBackend`) so the core stays
//! store-agnostic (spec.md §1 non-goal: no bundled persistence layer), and
//! provide an in-memory implementation for tests.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// The operation carried by one board entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpdateOp {
    Embed,
    Unlink,
}

/// One queued command: an operation plus the detached entity it acts on,
/// serialized as JSON so the board itself never needs to know the entity
/// schema (mirrors the Python original storing update rows as opaque BLOBs).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEntry {
    pub id: u64,
    pub op: UpdateOp,
    pub object_type: String,
    pub payload: Value,
}

/// The contract a concrete backend (MySQL, SQLite, flat file, ...) must
/// satisfy. `lock`/`unlock` bracket a write session exactly as the Python
/// original's `_lock_board` does with `SELECT ... FOR UPDATE`.
pub trait UpdateBoardBackend {
    fn lock(&self) -> Result<()>;
    fn unlock(&self) -> Result<()>;
    /// Append new entries, returning their assigned ids in order.
    fn write_updates(&self, entries: &[(UpdateOp, String, Value)]) -> Result<Vec<u64>>;
    /// Read all entries with id greater than `since_id`, in id order.
    fn get_updates(&self, since_id: u64) -> Result<Vec<UpdateEntry>>;
    /// Drop all entries with id less than or equal to `through_id`.
    fn flush(&self, through_id: u64) -> Result<()>;
}

/// Thin wrapper adding the lock/unlock bracketing and id bookkeeping the
/// Python original's `MySQLInventoryUpdateBoard` provides around its
/// backend connection.
pub struct UpdateBoard<B: UpdateBoardBackend> {
    backend: B,
}

impl<B: UpdateBoardBackend> UpdateBoard<B> {
    pub fn new(backend: B) -> Self {
        UpdateBoard { backend }
    }

    pub fn write_updates(&self, entries: &[(UpdateOp, String, Value)]) -> Result<Vec<u64>> {
        self.backend.lock()?;
        let result = self.backend.write_updates(entries);
        self.backend.unlock()?;
        result
    }

    pub fn get_updates(&self, since_id: u64) -> Result<Vec<UpdateEntry>> {
        self.backend.get_updates(since_id)
    }

    pub fn flush(&self, through_id: u64) -> Result<()> {
        self.backend.lock()?;
        let result = self.backend.flush(through_id);
        self.backend.unlock()?;
        result
    }
}

pub mod memory {
    use super::*;
    use std::cell::{Cell, RefCell};

    /// In-process FIFO backend, used by tests and as documentation of the
    /// minimal semantics a real backend must provide.
    #[derive(Default)]
    pub struct InMemoryBoard {
        entries: RefCell<Vec<UpdateEntry>>,
        next_id: Cell<u64>,
        locked: Cell<bool>,
    }

    impl UpdateBoardBackend for InMemoryBoard {
        fn lock(&self) -> Result<()> {
            if self.locked.get() {
                anyhow::bail!("update board already locked");
            }
            self.locked.set(true);
            Ok(())
        }

        fn unlock(&self) -> Result<()> {
            self.locked.set(false);
            Ok(())
        }

        fn write_updates(&self, entries: &[(UpdateOp, String, Value)]) -> Result<Vec<u64>> {
            let mut ids = Vec::with_capacity(entries.len());
            let mut store = self.entries.borrow_mut();
            for (op, object_type, payload) in entries {
                let id = self.next_id.get() + 1;
                self.next_id.set(id);
                store.push(UpdateEntry { id, op: *op, object_type: object_type.clone(), payload: payload.clone() });
                ids.push(id);
            }
            Ok(ids)
        }

        fn get_updates(&self, since_id: u64) -> Result<Vec<UpdateEntry>> {
            Ok(self
                .entries
                .borrow()
                .iter()
                .filter(|e| e.id > since_id)
                .cloned()
                .collect())
        }

        fn flush(&self, through_id: u64) -> Result<()> {
            self.entries.borrow_mut().retain(|e| e.id > through_id);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::memory::InMemoryBoard;
    use super::*;
    use serde_json::json;

    #[test]
    fn writes_are_assigned_increasing_ids() {
        let board = UpdateBoard::new(InMemoryBoard::default());
        let ids = board
            .write_updates(&[
                (UpdateOp::Embed, "block".into(), json!({"name": "b0"})),
                (UpdateOp::Embed, "block".into(), json!({"name": "b1"})),
            ])
            .unwrap();
        assert_eq!(ids, vec![1, 2]);
    }

    #[test]
    fn get_updates_only_returns_newer_entries() {
        let board = UpdateBoard::new(InMemoryBoard::default());
        board.write_updates(&[(UpdateOp::Embed, "block".into(), json!({}))]).unwrap();
        let ids = board.write_updates(&[(UpdateOp::Unlink, "block".into(), json!({}))]).unwrap();
        let since_first = board.get_updates(1).unwrap();
        assert_eq!(since_first.len(), 1);
        assert_eq!(since_first[0].id, ids[0]);
    }

    #[test]
    fn flush_drops_entries_through_given_id() {
        let board = UpdateBoard::new(InMemoryBoard::default());
        board
            .write_updates(&[
                (UpdateOp::Embed, "block".into(), json!({})),
                (UpdateOp::Embed, "block".into(), json!({})),
            ])
            .unwrap();
        board.flush(1).unwrap();
        let remaining = board.get_updates(0).unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, 2);
    }
}
