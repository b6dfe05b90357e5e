//! Tables and the mutation layer.
//!
//! A [`Table`] is the schema-side description of a relation: columns,
//! indexes, constraint hooks. Row storage lives in the transaction
//! snapshot, so every write takes a [`Transaction`] and returns the new
//! handle; on error the returned transaction is gone and the caller keeps
//! whatever handle it committed last, which is how a failed statement
//! leaves no partial state behind.

use std::fmt;
use std::sync::Arc;

use pgstub_error::{DbError, ErrorKind, Result};
use tracing::trace;

use crate::expr::Evaluator;
use crate::index::{IndexDef, index_insert, index_remove};
use crate::select::Selection;
use crate::txn::{Row, RowId, TableId, Transaction};
use crate::types::cast::cast_value;
use crate::types::{DataType, ScalarValue};

#[derive(Debug, Clone)]
pub struct ColumnDef {
    pub name: String,
    pub datatype: DataType,
    pub nullable: bool,
    /// Constant default expression, evaluated per inserted row.
    pub default: Option<Evaluator>,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, datatype: DataType) -> Self {
        ColumnDef {
            name: name.into(),
            datatype,
            nullable: true,
            default: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, default: Evaluator) -> Self {
        self.default = Some(default);
        self
    }
}

/// A change about to be applied to a table, handed to subscriptions.
#[derive(Debug, Clone)]
pub enum ChangeEvent {
    Insert { new: Arc<Row> },
    Update { old: Arc<Row>, new: Arc<Row> },
    Delete { old: Arc<Row> },
    Truncate,
}

pub type ChangeHook = Arc<dyn Fn(&ChangeEvent, &Transaction) -> Result<()>>;

#[derive(Clone, Default)]
struct Subscriptions {
    before_change: Vec<ChangeHook>,
    check_change: Vec<ChangeHook>,
}

#[derive(Clone)]
pub struct Table {
    pub id: TableId,
    pub name: String,
    pub columns: Vec<ColumnDef>,
    pub indexes: Vec<IndexDef>,
    /// System catalogs reject writes.
    pub read_only: bool,
    subscriptions: Subscriptions,
}

impl fmt::Debug for Table {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Table")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("columns", &self.columns)
            .field("indexes", &self.indexes)
            .field("read_only", &self.read_only)
            .finish_non_exhaustive()
    }
}

impl Table {
    pub fn new(id: TableId, name: impl Into<String>, columns: Vec<ColumnDef>) -> Table {
        Table {
            id,
            name: name.into(),
            columns,
            indexes: Vec::new(),
            read_only: false,
            subscriptions: Subscriptions::default(),
        }
    }

    pub fn read_only(mut self) -> Table {
        self.read_only = true;
        self
    }

    pub fn add_index(&mut self, def: IndexDef) {
        self.indexes.push(def);
    }

    /// Fires before a change is validated; used to maintain derived state.
    pub fn subscribe_before_change(&mut self, hook: ChangeHook) {
        self.subscriptions.before_change.push(hook);
    }

    /// Fires after validation, immediately before apply; an error vetoes
    /// the change. This is where constraint executors sit.
    pub fn subscribe_check_change(&mut self, hook: ChangeHook) {
        self.subscriptions.check_change.push(hook);
    }

    /// The read entry point: a scan over this table.
    pub fn selection(&self) -> Selection {
        Selection::scan(
            self.id,
            self.name.clone(),
            self.columns
                .iter()
                .map(|c| (c.name.clone(), c.datatype.clone()))
                .collect(),
            self.indexes.clone(),
        )
    }

    pub fn insert(&self, txn: Transaction, row: Row) -> Result<(Transaction, Arc<Row>)> {
        self.check_writable()?;
        let row = Arc::new(self.coerce_row(row, true, &txn)?);

        let event = ChangeEvent::Insert { new: row.clone() };
        self.fire_hooks(&event, &txn)?;

        let mut data = txn.table_data(self.id);
        let row_id = data.next_row_id;
        data.next_row_id += 1;
        for def in &self.indexes {
            let key = def.key_for_row(&row, &txn)?;
            let index = data.indexes.get(&def.id).cloned().unwrap_or_default();
            let index = index_insert(def, &index, key, row_id)?;
            data.indexes = data.indexes.insert(def.id, index);
        }
        data.rows = data.rows.insert(row_id, row.clone());

        trace!(table = %self.name, row_id, "inserted row");
        Ok((txn.with_table_data(self.id, data), row))
    }

    pub fn update(
        &self,
        txn: Transaction,
        row_id: RowId,
        new_row: Row,
    ) -> Result<(Transaction, Arc<Row>)> {
        self.check_writable()?;
        let mut data = txn.table_data(self.id);
        let old = data.rows.get(&row_id).cloned().ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::NotFound,
                format!("row {row_id} does not exist in table \"{}\"", self.name),
            )
        })?;
        let new_row = Arc::new(self.coerce_row(new_row, false, &txn)?);

        let event = ChangeEvent::Update {
            old: old.clone(),
            new: new_row.clone(),
        };
        self.fire_hooks(&event, &txn)?;

        for def in &self.indexes {
            let old_key = def.key_for_row(&old, &txn)?;
            let new_key = def.key_for_row(&new_row, &txn)?;
            let index = data.indexes.get(&def.id).cloned().unwrap_or_default();
            let index = index_remove(&index, &old_key, row_id);
            let index = index_insert(def, &index, new_key, row_id)?;
            data.indexes = data.indexes.insert(def.id, index);
        }
        data.rows = data.rows.insert(row_id, new_row.clone());

        trace!(table = %self.name, row_id, "updated row");
        Ok((txn.with_table_data(self.id, data), new_row))
    }

    pub fn delete(&self, txn: Transaction, row_id: RowId) -> Result<Transaction> {
        self.check_writable()?;
        let mut data = txn.table_data(self.id);
        let old = data.rows.get(&row_id).cloned().ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::NotFound,
                format!("row {row_id} does not exist in table \"{}\"", self.name),
            )
        })?;

        let event = ChangeEvent::Delete { old: old.clone() };
        self.fire_hooks(&event, &txn)?;

        for def in &self.indexes {
            let key = def.key_for_row(&old, &txn)?;
            let index = data.indexes.get(&def.id).cloned().unwrap_or_default();
            data.indexes = data.indexes.insert(def.id, index_remove(&index, &key, row_id));
        }
        data.rows = data.rows.remove(&row_id);

        trace!(table = %self.name, row_id, "deleted row");
        Ok(txn.with_table_data(self.id, data))
    }

    /// Drop every row. Row id assignment continues where it left off.
    pub fn truncate(&self, txn: Transaction) -> Result<Transaction> {
        self.check_writable()?;
        self.fire_hooks(&ChangeEvent::Truncate, &txn)?;
        let mut data = txn.table_data(self.id);
        data.rows = Default::default();
        data.indexes = Default::default();
        trace!(table = %self.name, "truncated table");
        Ok(txn.with_table_data(self.id, data))
    }

    /// Find the row id of a stored row by value, for update/delete callers
    /// that located the row through a selection.
    pub fn row_id_of(&self, row: &Row, txn: &Transaction) -> Option<RowId> {
        let data = txn.table_data(self.id);
        data.rows
            .iter()
            .find(|(_, stored)| ***stored == *row)
            .map(|(id, _)| *id)
    }

    fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DbError::with_kind(
                ErrorKind::Permission,
                format!("cannot modify read-only table \"{}\"", self.name),
            ));
        }
        Ok(())
    }

    fn fire_hooks(&self, event: &ChangeEvent, txn: &Transaction) -> Result<()> {
        for hook in &self.subscriptions.before_change {
            hook(event, txn)?;
        }
        for hook in &self.subscriptions.check_change {
            hook(event, txn)?;
        }
        Ok(())
    }

    /// Validate arity, fill defaults for missing trailing columns, coerce
    /// each value to the column type, and enforce not-null.
    fn coerce_row(&self, mut row: Row, fill_defaults: bool, txn: &Transaction) -> Result<Row> {
        if row.len() > self.columns.len() {
            return Err(DbError::new(format!(
                "INSERT has more expressions ({}) than target columns ({}) in table \"{}\"",
                row.len(),
                self.columns.len(),
                self.name
            )));
        }
        if fill_defaults {
            while row.len() < self.columns.len() {
                let col = &self.columns[row.len()];
                let value = match &col.default {
                    Some(default) => default.eval(&row, txn)?,
                    None => ScalarValue::Null,
                };
                row.push(value);
            }
        } else if row.len() != self.columns.len() {
            return Err(DbError::new(format!(
                "row has {} entries, table \"{}\" has {} columns",
                row.len(),
                self.name,
                self.columns.len()
            )));
        }

        for (value, col) in row.iter_mut().zip(&self.columns) {
            let natural = value.natural_type();
            if natural != col.datatype && !value.is_null() {
                *value = cast_value(&natural, value, &col.datatype).map_err(|e| {
                    e.with_field("column", col.name.clone())
                })?;
            }
            if value.is_null() && !col.nullable {
                return Err(DbError::with_kind(
                    ErrorKind::Constraint,
                    format!(
                        "null value in column \"{}\" of relation \"{}\" violates not-null constraint",
                        col.name, self.name
                    ),
                ));
            }
        }
        Ok(row)
    }
}
