//! Schemas: the named collections of tables, sequences, and types.
//!
//! A schema holds definitions only; row and counter state lives in the
//! transaction snapshot. DDL is therefore split in two: the schema mutates
//! in place (not transactional), while the data side of a DDL statement
//! (index backfill, dropped table contents, sequence counters) moves
//! through the transaction like any other write.

use hashbrown::HashMap;
use pgstub_error::{DbError, ErrorKind, Result};
use tracing::debug;

use crate::expr;
use crate::index::{IndexDef, index_insert};
use crate::table::{ColumnDef, Table};
use crate::txn::{IndexData, IndexId, SequenceId, TableId, Transaction};
use crate::types::registry::TypeRegistry;
use crate::types::DataType;

#[derive(Debug, Clone)]
pub struct Sequence {
    pub id: SequenceId,
    pub name: String,
    pub start: i64,
    pub increment: i64,
}

/// A named object looked up in the schema.
#[derive(Debug)]
pub enum SchemaObject<'a> {
    Table(&'a Table),
    Sequence(&'a Sequence),
    Index {
        table: &'a Table,
        index: &'a IndexDef,
    },
}

#[derive(Debug)]
pub struct Schema {
    pub name: String,
    tables: HashMap<String, Table>,
    sequences: HashMap<String, Sequence>,
    types: TypeRegistry,
    /// System schemas reject DDL and writes.
    pub read_only: bool,
    next_table_id: TableId,
    next_index_id: IndexId,
    next_sequence_id: SequenceId,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Schema {
        Schema {
            name: name.into(),
            tables: HashMap::new(),
            sequences: HashMap::new(),
            types: TypeRegistry::new(),
            read_only: false,
            next_table_id: 1,
            next_index_id: 1,
            next_sequence_id: 1,
        }
    }

    pub fn read_only(mut self) -> Schema {
        self.read_only = true;
        self
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    pub fn types_mut(&mut self) -> &mut TypeRegistry {
        &mut self.types
    }

    /// Resolve a type by its SQL name, e.g. `varchar(10)` or `int[]`.
    pub fn get_type(&mut self, name: &str) -> Result<DataType> {
        self.types.type_by_name(name)
    }

    pub fn get_type_by_oid(&self, oid: u32) -> Result<DataType> {
        self.types.type_by_oid(oid)
    }

    pub fn table(&self, name: &str) -> Result<&Table> {
        self.tables.get(name).ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::NotFound,
                format!("relation \"{name}\" does not exist"),
            )
        })
    }

    pub fn table_mut(&mut self, name: &str) -> Result<&mut Table> {
        self.tables.get_mut(name).ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::NotFound,
                format!("relation \"{name}\" does not exist"),
            )
        })
    }

    pub fn sequence(&self, name: &str) -> Result<&Sequence> {
        self.sequences.get(name).ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::NotFound,
                format!("sequence \"{name}\" does not exist"),
            )
        })
    }

    /// Look a name up across every object class in the schema.
    pub fn get_object(&self, name: &str) -> Result<SchemaObject<'_>> {
        if let Some(table) = self.tables.get(name) {
            return Ok(SchemaObject::Table(table));
        }
        if let Some(sequence) = self.sequences.get(name) {
            return Ok(SchemaObject::Sequence(sequence));
        }
        for table in self.tables.values() {
            if let Some(index) = table.indexes.iter().find(|ix| ix.name == name) {
                return Ok(SchemaObject::Index { table, index });
            }
        }
        Err(DbError::with_kind(
            ErrorKind::NotFound,
            format!("object \"{name}\" does not exist in schema \"{}\"", self.name),
        ))
    }

    /// Create a table, optionally with a primary key over the named
    /// columns: those become not-null and get a unique `<table>_pkey`
    /// index.
    pub fn create_table(
        &mut self,
        name: impl Into<String>,
        mut columns: Vec<ColumnDef>,
        primary_key: Option<&[&str]>,
    ) -> Result<&Table> {
        self.check_mutable()?;
        let name = name.into();
        if self.tables.contains_key(&name) {
            return Err(DbError::new(format!(
                "relation \"{name}\" already exists"
            )));
        }

        let table_id = self.next_table_id;
        self.next_table_id += 1;

        let pkey = match primary_key {
            Some(key_columns) => {
                let mut exprs = Vec::with_capacity(key_columns.len());
                for key in key_columns {
                    let (i, col) = columns
                        .iter_mut()
                        .enumerate()
                        .find(|(_, c)| c.name == *key)
                        .ok_or_else(|| {
                            DbError::with_kind(
                                ErrorKind::NotFound,
                                format!("column \"{key}\" named in key does not exist"),
                            )
                        })?;
                    col.nullable = false;
                    exprs.push(expr::column(i, col.name.clone(), col.datatype.clone()));
                }
                let id = self.next_index_id;
                self.next_index_id += 1;
                Some(IndexDef {
                    id,
                    name: format!("{name}_pkey"),
                    table_id,
                    exprs,
                    unique: true,
                })
            }
            None => None,
        };

        let mut table = Table::new(table_id, name.clone(), columns);
        if let Some(def) = pkey {
            table.add_index(def);
        }
        debug!(table = %name, id = table_id, "created table");
        Ok(self.tables.entry(name).or_insert(table))
    }

    /// Create an index over the named columns, backfilling it from the
    /// table's current rows. A unique violation in existing data fails the
    /// whole statement and leaves the schema unchanged.
    pub fn create_index(
        &mut self,
        txn: Transaction,
        table_name: &str,
        index_name: impl Into<String>,
        key_columns: &[&str],
        unique: bool,
    ) -> Result<Transaction> {
        self.check_mutable()?;
        let index_name = index_name.into();
        if self.get_object(&index_name).is_ok() {
            return Err(DbError::new(format!(
                "object \"{index_name}\" already exists"
            )));
        }
        let id = self.next_index_id;
        let table = self.tables.get(table_name).ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::NotFound,
                format!("relation \"{table_name}\" does not exist"),
            )
        })?;

        let mut exprs = Vec::with_capacity(key_columns.len());
        for key in key_columns {
            let (i, col) = table
                .columns
                .iter()
                .enumerate()
                .find(|(_, c)| c.name == *key)
                .ok_or_else(|| {
                    DbError::with_kind(
                        ErrorKind::NotFound,
                        format!("column \"{key}\" does not exist"),
                    )
                })?;
            exprs.push(expr::column(i, col.name.clone(), col.datatype.clone()));
        }
        let def = IndexDef {
            id,
            name: index_name.clone(),
            table_id: table.id,
            exprs,
            unique,
        };

        // Backfill before touching the schema.
        let mut data = txn.table_data(table.id);
        let mut index = IndexData::default();
        for (row_id, row) in data.rows.iter() {
            let key = def.key_for_row(row, &txn)?;
            index = index_insert(&def, &index, key, *row_id)?;
        }
        data.indexes = data.indexes.insert(def.id, index);
        let txn = txn.with_table_data(def.table_id, data);

        self.next_index_id += 1;
        if let Some(table) = self.tables.get_mut(table_name) {
            table.add_index(def);
        }
        debug!(index = %index_name, table = table_name, "created index");
        Ok(txn)
    }

    pub fn drop_table(&mut self, txn: Transaction, name: &str) -> Result<Transaction> {
        self.check_mutable()?;
        let table = self.tables.remove(name).ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::NotFound,
                format!("relation \"{name}\" does not exist"),
            )
        })?;
        debug!(table = %name, "dropped table");
        Ok(txn.delete_table_data(table.id))
    }

    pub fn drop_index(&mut self, txn: Transaction, name: &str) -> Result<Transaction> {
        self.check_mutable()?;
        for table in self.tables.values_mut() {
            if let Some(pos) = table.indexes.iter().position(|ix| ix.name == name) {
                let def = table.indexes.remove(pos);
                let mut data = txn.table_data(def.table_id);
                data.indexes = data.indexes.remove(&def.id);
                debug!(index = %name, "dropped index");
                return Ok(txn.with_table_data(def.table_id, data));
            }
        }
        Err(DbError::with_kind(
            ErrorKind::NotFound,
            format!("index \"{name}\" does not exist"),
        ))
    }

    pub fn create_sequence(&mut self, name: impl Into<String>) -> Result<&Sequence> {
        self.check_mutable()?;
        let name = name.into();
        if self.sequences.contains_key(&name) {
            return Err(DbError::new(format!(
                "relation \"{name}\" already exists"
            )));
        }
        let id = self.next_sequence_id;
        self.next_sequence_id += 1;
        let sequence = Sequence {
            id,
            name: name.clone(),
            start: 1,
            increment: 1,
        };
        debug!(sequence = %name, "created sequence");
        Ok(self.sequences.entry(name).or_insert(sequence))
    }

    pub fn drop_sequence(&mut self, name: &str) -> Result<()> {
        self.check_mutable()?;
        self.sequences.remove(name).map(|_| ()).ok_or_else(|| {
            DbError::with_kind(
                ErrorKind::NotFound,
                format!("sequence \"{name}\" does not exist"),
            )
        })
    }

    /// Advance a sequence. The counter lives in the transaction snapshot,
    /// so it rolls back with the transaction.
    pub fn sequence_next(&self, txn: Transaction, name: &str) -> Result<(Transaction, i64)> {
        let sequence = self.sequence(name)?;
        let next = match txn.sequence_value(sequence.id) {
            Some(current) => current + sequence.increment,
            None => sequence.start,
        };
        Ok((txn.with_sequence(sequence.id, next), next))
    }

    fn check_mutable(&self) -> Result<()> {
        if self.read_only {
            return Err(DbError::with_kind(
                ErrorKind::Permission,
                format!("schema \"{}\" is read-only", self.name),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::expr::{eq, lit};
    use crate::select::Selection;
    use crate::types::ScalarValue;

    fn int(v: i64) -> ScalarValue {
        ScalarValue::Int(v)
    }

    fn schema_with_users() -> Schema {
        let mut schema = Schema::new("public");
        schema
            .create_table(
                "users",
                vec![
                    ColumnDef::new("id", DataType::Int),
                    ColumnDef::new("name", DataType::TEXT),
                ],
                Some(&["id"]),
            )
            .unwrap();
        schema
    }

    #[test]
    fn create_table_with_primary_key() {
        let schema = schema_with_users();
        let table = schema.table("users").unwrap();
        assert!(!table.columns[0].nullable);
        assert_eq!("users_pkey", table.indexes[0].name);
        assert!(table.indexes[0].unique);

        // The key columns enforce uniqueness through the index.
        let txn = Transaction::root();
        let (txn, _) = table.insert(txn, vec![int(1), ScalarValue::text("a")]).unwrap();
        let err = table
            .insert(txn, vec![int(1), ScalarValue::text("b")])
            .unwrap_err();
        assert_eq!(ErrorKind::Constraint, err.kind());
    }

    #[test]
    fn duplicate_table_rejected() {
        let mut schema = schema_with_users();
        let err = schema
            .create_table("users", vec![ColumnDef::new("x", DataType::Int)], None)
            .unwrap_err();
        assert!(err.message().contains("already exists"));
    }

    #[test]
    fn create_index_backfills_existing_rows() {
        let mut schema = schema_with_users();
        let txn = Transaction::root();
        let table = schema.table("users").unwrap().clone();
        let (txn, _) = table.insert(txn, vec![int(1), ScalarValue::text("ann")]).unwrap();
        let (txn, _) = table.insert(txn, vec![int(2), ScalarValue::text("bob")]).unwrap();

        let txn = schema
            .create_index(txn, "users", "users_name_idx", &["name"], false)
            .unwrap();

        let table = schema.table("users").unwrap();
        let scan = Arc::new(table.selection());
        let filter = Selection::filter(
            scan.clone(),
            eq(scan.column_ref(None, "name").unwrap(), lit("bob")).unwrap(),
        )
        .unwrap();
        assert_eq!("index-lookup", filter.explain(&txn).entry.items["strategy"]);
        assert_eq!(1, filter.enumerate(&txn).count());
    }

    #[test]
    fn unique_index_backfill_fails_on_duplicates() {
        let mut schema = schema_with_users();
        let txn = Transaction::root();
        let table = schema.table("users").unwrap().clone();
        let (txn, _) = table.insert(txn, vec![int(1), ScalarValue::text("dup")]).unwrap();
        let (txn, _) = table.insert(txn, vec![int(2), ScalarValue::text("dup")]).unwrap();

        let err = schema
            .create_index(txn, "users", "users_name_key", &["name"], true)
            .unwrap_err();
        assert_eq!(ErrorKind::Constraint, err.kind());
        // The failed index never made it into the schema.
        assert!(schema.get_object("users_name_key").is_err());
    }

    #[test]
    fn drop_table_discards_data() {
        let mut schema = schema_with_users();
        let table = schema.table("users").unwrap().clone();
        let (txn, _) = table
            .insert(Transaction::root(), vec![int(1), ScalarValue::text("a")])
            .unwrap();

        let txn = schema.drop_table(txn, "users").unwrap();
        assert!(schema.table("users").is_err());
        assert!(txn.table_data(table.id).rows.is_empty());
    }

    #[test]
    fn object_lookup_covers_all_classes() {
        let mut schema = schema_with_users();
        schema.create_sequence("users_id_seq").unwrap();

        assert!(matches!(
            schema.get_object("users"),
            Ok(SchemaObject::Table(_))
        ));
        assert!(matches!(
            schema.get_object("users_id_seq"),
            Ok(SchemaObject::Sequence(_))
        ));
        assert!(matches!(
            schema.get_object("users_pkey"),
            Ok(SchemaObject::Index { .. })
        ));
        let err = schema.get_object("nope").unwrap_err();
        assert_eq!(ErrorKind::NotFound, err.kind());
    }

    #[test]
    fn sequence_counter_lives_in_the_transaction() {
        let mut schema = Schema::new("public");
        schema.create_sequence("s").unwrap();

        let txn = Transaction::root();
        let (txn, v1) = schema.sequence_next(txn, "s").unwrap();
        let (txn, v2) = schema.sequence_next(txn, "s").unwrap();
        assert_eq!((1, 2), (v1, v2));

        // Advancing inside a rolled-back child does not stick.
        let child = txn.fork();
        let (child, v3) = schema.sequence_next(child, "s").unwrap();
        assert_eq!(3, v3);
        let txn = child.rollback();
        let (_, v4) = schema.sequence_next(txn, "s").unwrap();
        assert_eq!(3, v4);
    }

    #[test]
    fn read_only_schema_rejects_ddl() {
        let mut schema = Schema::new("pg_catalog").read_only();
        let err = schema
            .create_table("t", vec![ColumnDef::new("x", DataType::Int)], None)
            .unwrap_err();
        assert_eq!(ErrorKind::Permission, err.kind());
    }

    #[test]
    fn type_resolution_goes_through_the_registry() {
        let mut schema = Schema::new("public");
        assert_eq!(DataType::Int, schema.get_type("bigint").unwrap());
        assert_eq!(
            DataType::Text(Some(12)),
            schema.get_type("varchar(12)").unwrap()
        );
    }
}
