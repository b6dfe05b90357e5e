//! The transaction store.
//!
//! Every statement runs inside a transaction that sees an isolated snapshot
//! of all table, sequence, and session-variable state. Snapshots are built
//! on persistent maps, so forking is O(1) regardless of database size and a
//! failed statement structurally cannot corrupt committed state: the parent
//! was never mutated, the in-flight child is simply dropped.
//!
//! Commit-time conflict detection compares the parent's *current* state
//! against the snapshot the child forked from by root-pointer identity, not
//! deep equality. Serial nested transactions always pass; a sibling that
//! committed in between changes the parent's roots and makes the stale
//! child's commit fail loudly.

use std::sync::Arc;

use parking_lot::Mutex;
use pgstub_error::{DbError, ErrorKind, Result};
use tracing::trace;

use crate::types::ScalarValue;
use crate::util::pmap::{PMap, PSet};

pub type TableId = u64;
pub type IndexId = u64;
pub type SequenceId = u64;
pub type RowId = u64;

/// A stored row. Shared between the row map and index entries.
pub type Row = Vec<ScalarValue>;

/// Composite index key: one scalar per keyed expression.
pub type IndexKey = Vec<ScalarValue>;

/// Versioned contents of one index, stored inside the snapshot so index
/// reads are always consistent with the row map of the same transaction.
#[derive(Debug, Clone, Default)]
pub struct IndexData {
    pub entries: PMap<IndexKey, PSet<RowId>>,
    /// Total rows indexed (an entry may hold several rows).
    pub row_count: usize,
}

/// Versioned contents of one table.
#[derive(Debug, Clone, Default)]
pub struct TableData {
    pub rows: PMap<RowId, Arc<Row>>,
    pub indexes: PMap<IndexId, IndexData>,
    pub next_row_id: RowId,
}

/// All mutable database state as of one point in time.
///
/// A fixed set of strongly-typed maps rather than an open bag keyed by
/// symbols; everything here clones in O(1).
#[derive(Debug, Clone, Default)]
pub struct Snapshot {
    pub tables: PMap<TableId, TableData>,
    pub sequences: PMap<SequenceId, i64>,
    pub variables: PMap<String, ScalarValue>,
}

impl Snapshot {
    /// Root-pointer identity across all three maps. This is the cheap test
    /// commit uses for conflict detection.
    fn same_roots(&self, other: &Snapshot) -> bool {
        self.tables.same_root(&other.tables)
            && self.sequences.same_root(&other.sequences)
            && self.variables.same_root(&other.variables)
    }
}

#[derive(Debug)]
struct TxNode {
    parent: Option<Arc<TxNode>>,
    /// The parent's state captured at fork time.
    base: Snapshot,
    /// Current state. Replaced wholesale when a child commits into this
    /// node; the functional accessors never touch it.
    state: Mutex<Snapshot>,
    /// Statement-scoped scratch state, independent of the persistent store.
    transient: PMap<String, ScalarValue>,
}

/// A handle to one isolated view of all mutable state.
///
/// Mutating accessors (`with_*`) return a new `Transaction` value sharing
/// the same parent; the caller threads the returned value forward. The
/// original handle keeps observing its own state.
#[derive(Debug, Clone)]
pub struct Transaction {
    node: Arc<TxNode>,
}

impl Default for Transaction {
    fn default() -> Self {
        Self::root()
    }
}

impl Transaction {
    /// A fresh root transaction with empty state.
    pub fn root() -> Self {
        Transaction {
            node: Arc::new(TxNode {
                parent: None,
                base: Snapshot::default(),
                state: Mutex::new(Snapshot::default()),
                transient: PMap::new(),
            }),
        }
    }

    pub fn is_child(&self) -> bool {
        self.node.parent.is_some()
    }

    fn snapshot(&self) -> Snapshot {
        self.node.state.lock().clone()
    }

    /// Fork a child whose reads see this transaction's current state and
    /// whose writes stay invisible until committed. O(1).
    pub fn fork(&self) -> Transaction {
        let base = self.snapshot();
        trace!("forking transaction");
        Transaction {
            node: Arc::new(TxNode {
                parent: Some(self.node.clone()),
                base: base.clone(),
                state: Mutex::new(base),
                transient: self.node.transient.clone(),
            }),
        }
    }

    /// Fold this child's state into its parent.
    ///
    /// Fails with a conflict error if the parent's state diverged from the
    /// snapshot this child forked from, which means another transaction
    /// committed in between. Detection is by root identity, so this is O(1).
    pub fn commit(self) -> Result<Transaction> {
        let parent = self.node.parent.clone().ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::TransactionConflict,
                "cannot commit a root transaction",
            )
        })?;

        {
            let mut parent_state = parent.state.lock();
            if !parent_state.same_roots(&self.node.base) {
                return Err(DbError::with_kind(
                    ErrorKind::TransactionConflict,
                    "concurrent transaction has modified the parent state",
                ));
            }
            *parent_state = self.snapshot();
        }
        trace!("committed transaction into parent");

        Ok(Transaction { node: parent })
    }

    /// Commit repeatedly until reaching the root.
    pub fn full_commit(mut self) -> Result<Transaction> {
        while self.is_child() {
            self = self.commit()?;
        }
        Ok(self)
    }

    /// Discard all of this child's writes and return the parent unchanged.
    /// Rolling back a root is a no-op.
    pub fn rollback(self) -> Transaction {
        match self.node.parent.clone() {
            Some(parent) => {
                trace!("rolled back transaction");
                Transaction { node: parent }
            }
            None => self,
        }
    }

    /// Produce a sibling handle with a different state value. Shares the
    /// parent link, so a later commit folds into the same place.
    fn replace(&self, state: Snapshot, transient: PMap<String, ScalarValue>) -> Transaction {
        Transaction {
            node: Arc::new(TxNode {
                parent: self.node.parent.clone(),
                base: self.node.base.clone(),
                state: Mutex::new(state),
                transient,
            }),
        }
    }

    fn with_state(&self, state: Snapshot) -> Transaction {
        self.replace(state, self.node.transient.clone())
    }

    // Table payloads.

    /// Contents of a table, default-initialized to empty on first access.
    pub fn table_data(&self, id: TableId) -> TableData {
        self.node
            .state
            .lock()
            .tables
            .get(&id)
            .cloned()
            .unwrap_or_default()
    }

    pub fn with_table_data(&self, id: TableId, data: TableData) -> Transaction {
        let mut state = self.snapshot();
        state.tables = state.tables.insert(id, data);
        self.with_state(state)
    }

    pub fn delete_table_data(&self, id: TableId) -> Transaction {
        let mut state = self.snapshot();
        state.tables = state.tables.remove(&id);
        self.with_state(state)
    }

    // Sequence counters.

    pub fn sequence_value(&self, id: SequenceId) -> Option<i64> {
        self.node.state.lock().sequences.get(&id).copied()
    }

    pub fn with_sequence(&self, id: SequenceId, value: i64) -> Transaction {
        let mut state = self.snapshot();
        state.sequences = state.sequences.insert(id, value);
        self.with_state(state)
    }

    // Session variables.

    pub fn variable(&self, name: &str) -> Option<ScalarValue> {
        self.node
            .state
            .lock()
            .variables
            .get(&name.to_string())
            .cloned()
    }

    pub fn with_variable(&self, name: impl Into<String>, value: ScalarValue) -> Transaction {
        let mut state = self.snapshot();
        state.variables = state.variables.insert(name.into(), value);
        self.with_state(state)
    }

    // Statement-scoped transient store.

    pub fn get_transient(&self, name: &str) -> Option<&ScalarValue> {
        self.node.transient.get(&name.to_string())
    }

    pub fn set_transient(&self, name: impl Into<String>, value: ScalarValue) -> Transaction {
        self.replace(self.snapshot(), self.node.transient.insert(name.into(), value))
    }

    /// Reset per-statement scratch state. Persistent data is unaffected.
    pub fn clear_transient_data(&self) -> Transaction {
        self.replace(self.snapshot(), PMap::new())
    }
}
