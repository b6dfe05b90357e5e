//! Data type definitions.
//!
//! Types form a closed tagged union. Parameterized types (bounded text,
//! arrays) carry their parameter inline; structurally equal types compare
//! equal, and the registry memoizes the shared `Arc`s so equal parameterized
//! types are also pointer-equal.

use std::fmt;
use std::sync::Arc;

/// A named field of a record type.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub datatype: DataType,
}

/// A DDL-created enum type. Ordering of values follows label order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EnumType {
    pub name: String,
    pub oid: u32,
    pub labels: Vec<String>,
}

impl EnumType {
    /// Position of a label, used for enum ordering.
    pub fn label_index(&self, label: &str) -> Option<usize> {
        self.labels.iter().position(|l| l == label)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DataType {
    /// The type of an untyped NULL literal ("unknown" in postgres).
    Null,
    Bool,
    /// 64-bit integer.
    Int,
    /// 64-bit float.
    Float,
    /// Text with an optional length bound (`varchar(n)` vs `text`).
    Text(Option<u32>),
    Timestamp,
    Date,
    Uuid,
    Json,
    Array(Arc<DataType>),
    /// Composite row type, produced by whole-row references to aliased
    /// selections.
    Record(Arc<[Field]>),
    Enum(Arc<EnumType>),
}

impl DataType {
    pub const TEXT: DataType = DataType::Text(None);

    pub fn is_null(&self) -> bool {
        matches!(self, DataType::Null)
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, DataType::Int | DataType::Float)
    }

    pub fn is_text(&self) -> bool {
        matches!(self, DataType::Text(_))
    }

    /// Postgres-compatible oid reported in result metadata.
    pub fn oid(&self) -> u32 {
        match self {
            DataType::Null => 705, // unknown
            DataType::Bool => 16,
            DataType::Int => 20,   // int8
            DataType::Float => 701, // float8
            DataType::Text(None) => 25,
            DataType::Text(Some(_)) => 1043, // varchar
            DataType::Timestamp => 1114,
            DataType::Date => 1082,
            DataType::Uuid => 2950,
            DataType::Json => 3802, // jsonb
            DataType::Array(elem) => match elem.as_ref() {
                DataType::Bool => 1000,
                DataType::Int => 1016,
                DataType::Float => 1022,
                DataType::Text(_) => 1009,
                _ => 0,
            },
            DataType::Record(_) => 2249,
            DataType::Enum(e) => e.oid,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Null => write!(f, "unknown"),
            DataType::Bool => write!(f, "boolean"),
            DataType::Int => write!(f, "bigint"),
            DataType::Float => write!(f, "double precision"),
            DataType::Text(None) => write!(f, "text"),
            DataType::Text(Some(n)) => write!(f, "character varying({n})"),
            DataType::Timestamp => write!(f, "timestamp without time zone"),
            DataType::Date => write!(f, "date"),
            DataType::Uuid => write!(f, "uuid"),
            DataType::Json => write!(f, "jsonb"),
            DataType::Array(elem) => write!(f, "{elem}[]"),
            DataType::Record(_) => write!(f, "record"),
            DataType::Enum(e) => write!(f, "{}", e.name),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_names() {
        assert_eq!("bigint", DataType::Int.to_string());
        assert_eq!("character varying(32)", DataType::Text(Some(32)).to_string());
        assert_eq!(
            "bigint[]",
            DataType::Array(Arc::new(DataType::Int)).to_string()
        );
    }

    #[test]
    fn structural_equality() {
        let a = DataType::Array(Arc::new(DataType::Text(None)));
        let b = DataType::Array(Arc::new(DataType::Text(None)));
        assert_eq!(a, b);
    }

    #[test]
    fn array_oids() {
        assert_eq!(1016, DataType::Array(Arc::new(DataType::Int)).oid());
        assert_eq!(1009, DataType::Array(Arc::new(DataType::TEXT)).oid());
    }
}
