//! The session layer: the one place mutable state is threaded through.
//!
//! A [`Session`] owns a schema and the current [`Transaction`] handle.
//! Statements run on a fork of that handle, so a failing statement never
//! disturbs session state; explicit `BEGIN`/`COMMIT`/`ROLLBACK` stack one
//! more transaction level on top of the implicit per-statement one.

use pgstub_error::Result;
use tracing::{debug, warn};

use crate::catalog::Schema;
use crate::select::Selection;
use crate::txn::{Row, Transaction};
use crate::types::DataType;

/// One output column of a result, in the shape protocol adapters consume.
#[derive(Debug, Clone)]
pub struct ResultField {
    pub name: String,
    pub datatype: DataType,
    pub type_oid: u32,
}

/// A fully materialized statement result.
#[derive(Debug, Clone)]
pub struct QueryResult {
    /// Command tag, e.g. `SELECT` or `INSERT 0 1`.
    pub command: String,
    pub row_count: usize,
    pub fields: Vec<ResultField>,
    pub rows: Vec<Row>,
}

impl QueryResult {
    /// Result of a statement that returns no rows.
    pub fn command_only(command: impl Into<String>, row_count: usize) -> QueryResult {
        QueryResult {
            command: command.into(),
            row_count,
            fields: Vec::new(),
            rows: Vec::new(),
        }
    }
}

/// Materialize a selection into a [`QueryResult`] under one snapshot.
pub fn collect(selection: &Selection, txn: &Transaction) -> Result<QueryResult> {
    let fields = selection
        .columns()
        .iter()
        .map(|c| ResultField {
            name: c.name.clone(),
            type_oid: c.datatype.oid(),
            datatype: c.datatype.clone(),
        })
        .collect();
    let rows: Result<Vec<Row>> = selection
        .enumerate(txn)
        .map(|r| Ok((*r?).clone()))
        .collect();
    let rows = rows?;
    Ok(QueryResult {
        command: "SELECT".to_string(),
        row_count: rows.len(),
        fields,
        rows,
    })
}

pub struct Session {
    schema: Schema,
    txn: Transaction,
    explicit: bool,
}

impl Default for Session {
    fn default() -> Self {
        Self::new()
    }
}

impl Session {
    pub fn new() -> Session {
        Session {
            schema: Schema::new("public"),
            txn: Transaction::root(),
            explicit: false,
        }
    }

    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn schema_mut(&mut self) -> &mut Schema {
        &mut self.schema
    }

    /// The current snapshot, for reads outside `query`.
    pub fn transaction(&self) -> &Transaction {
        &self.txn
    }

    /// Whether an explicit transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.explicit
    }

    /// Open an explicit transaction. A `BEGIN` inside a transaction is a
    /// warning, not an error.
    pub fn begin(&mut self) {
        if self.explicit {
            warn!("there is already a transaction in progress");
            return;
        }
        self.txn = self.txn.clear_transient_data().fork();
        self.explicit = true;
        debug!("began explicit transaction");
    }

    /// Commit the explicit transaction. Outside of one, a warning.
    pub fn commit(&mut self) -> Result<()> {
        if !self.explicit {
            warn!("there is no transaction in progress");
            return Ok(());
        }
        self.txn = self.txn.clone().full_commit()?;
        self.explicit = false;
        debug!("committed explicit transaction");
        Ok(())
    }

    /// Discard the explicit transaction's writes.
    pub fn rollback(&mut self) {
        if !self.explicit {
            warn!("there is no transaction in progress");
            return;
        }
        self.txn = self.txn.clone().rollback();
        self.explicit = false;
        debug!("rolled back explicit transaction");
    }

    /// Run a read-only statement against the current snapshot.
    pub fn query(&mut self, selection: &Selection) -> Result<QueryResult> {
        self.txn = self.txn.clear_transient_data();
        collect(selection, &self.txn)
    }

    /// Run a mutating statement.
    ///
    /// The closure gets the schema and a statement-level transaction fork;
    /// on success the fork commits into the session (and, outside an
    /// explicit transaction, all the way to the root). On error the fork
    /// is dropped and the session's state is exactly what it was.
    pub fn mutate<T>(
        &mut self,
        f: impl FnOnce(&Schema, Transaction) -> Result<(Transaction, T)>,
    ) -> Result<T> {
        self.txn = self.txn.clear_transient_data();
        let statement = self.txn.fork();
        let (statement, out) = f(&self.schema, statement)?;
        let committed = statement.commit()?;
        self.txn = if self.explicit {
            committed
        } else {
            committed.full_commit()?
        };
        Ok(out)
    }

    /// Run a DDL statement.
    ///
    /// DDL commits eagerly: the open transaction is committed to the root
    /// first, then the schema mutates in place. Schema changes are not
    /// rolled back by a later `ROLLBACK`.
    pub fn ddl<T>(
        &mut self,
        f: impl FnOnce(&mut Schema, Transaction) -> Result<(Transaction, T)>,
    ) -> Result<T> {
        let txn = self.txn.clone().full_commit()?;
        self.explicit = false;
        let (txn, out) = f(&mut self.schema, txn)?;
        self.txn = txn.full_commit()?;
        Ok(out)
    }
}
