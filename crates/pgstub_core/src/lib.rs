//! An embeddable, in-process, postgres-compatible relational engine.
//!
//! The crate is a test double for postgres: it keeps all state in memory
//! inside persistent (structurally shared) maps, which makes transactions
//! O(1) to fork and roll back, and it implements the postgres type system's
//! observable behavior, including three-valued comparison and implicit
//! casts.
//!
//! The layers, bottom up:
//!
//! - [`util`]: persistent ordered maps and a totally ordered float.
//! - [`types`]: data types, scalar values, comparison, casting,
//!   reconciliation.
//! - [`expr`]: typed row expressions.
//! - [`txn`]: snapshot transactions with O(1) conflict detection.
//! - [`index`]: snapshot-consistent indexes with entropy estimates.
//! - [`select`]: the composable selection graph and its planner.
//! - [`table`]: tables, constraints, and the mutation path.
//! - [`catalog`]: schemas, sequences, and DDL.
//! - [`engine`]: sessions and the result shape adapters consume.

pub mod catalog;
pub mod engine;
pub mod expr;
pub mod index;
pub mod select;
pub mod table;
pub mod txn;
pub mod types;
pub mod util;

pub use pgstub_error::{DbError, ErrorKind, Result};
