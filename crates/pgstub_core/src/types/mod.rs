//! The type system: data types, scalar values, comparison, casting, and
//! type reconciliation.

pub mod cast;
pub mod compare;
pub mod datatype;
pub mod parse;
pub mod reconcile;
pub mod registry;
pub mod value;

pub use datatype::{DataType, EnumType, Field};
pub use value::ScalarValue;
