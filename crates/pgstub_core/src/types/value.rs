//! Scalar values.
//!
//! `ScalarValue` carries a *total* `Eq/Ord/Hash` so values can serve as
//! index keys and dedup-set members. That order is distinct from SQL
//! comparison semantics: SQL three-valued comparison lives in
//! [`super::compare`] and returns unknown for null operands, while the total
//! order here treats `Null` as an ordinary (greatest) value.

use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use chrono::{NaiveDate, NaiveDateTime};
use uuid::Uuid;

use crate::util::ordfloat::OrdF64;

use super::datatype::DataType;

#[derive(Debug, Clone)]
pub enum ScalarValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(OrdF64),
    Text(String),
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Uuid(Uuid),
    Json(serde_json::Value),
    Array(Vec<ScalarValue>),
    Record(Vec<ScalarValue>),
}

impl ScalarValue {
    pub fn float(v: f64) -> Self {
        ScalarValue::Float(OrdF64::new(v))
    }

    pub fn text(v: impl Into<String>) -> Self {
        ScalarValue::Text(v.into())
    }

    pub fn is_null(&self) -> bool {
        matches!(self, ScalarValue::Null)
    }

    /// The natural type of this value, without contextual information.
    ///
    /// Text values report unbounded text; array element types are inferred
    /// from the first non-null element. Contextual types (bounded text, enum
    /// values) live on the expression, not the value.
    pub fn natural_type(&self) -> DataType {
        match self {
            ScalarValue::Null => DataType::Null,
            ScalarValue::Bool(_) => DataType::Bool,
            ScalarValue::Int(_) => DataType::Int,
            ScalarValue::Float(_) => DataType::Float,
            ScalarValue::Text(_) => DataType::TEXT,
            ScalarValue::Timestamp(_) => DataType::Timestamp,
            ScalarValue::Date(_) => DataType::Date,
            ScalarValue::Uuid(_) => DataType::Uuid,
            ScalarValue::Json(_) => DataType::Json,
            ScalarValue::Array(vals) => {
                let elem = vals
                    .iter()
                    .find(|v| !v.is_null())
                    .map(|v| v.natural_type())
                    .unwrap_or(DataType::Null);
                DataType::Array(std::sync::Arc::new(elem))
            }
            ScalarValue::Record(_) => DataType::Record(std::sync::Arc::from([])),
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ScalarValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Variant rank for the cross-variant total order.
    fn rank(&self) -> u8 {
        match self {
            ScalarValue::Bool(_) => 0,
            ScalarValue::Int(_) => 1,
            ScalarValue::Float(_) => 2,
            ScalarValue::Text(_) => 3,
            ScalarValue::Timestamp(_) => 4,
            ScalarValue::Date(_) => 5,
            ScalarValue::Uuid(_) => 6,
            ScalarValue::Json(_) => 7,
            ScalarValue::Array(_) => 8,
            ScalarValue::Record(_) => 9,
            // Nulls sort last so unbounded index range scans see them at the
            // end.
            ScalarValue::Null => 10,
        }
    }
}

impl PartialEq for ScalarValue {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for ScalarValue {}

impl PartialOrd for ScalarValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScalarValue {
    fn cmp(&self, other: &Self) -> Ordering {
        use ScalarValue::*;
        match (self, other) {
            (Null, Null) => Ordering::Equal,
            (Bool(a), Bool(b)) => a.cmp(b),
            (Int(a), Int(b)) => a.cmp(b),
            (Float(a), Float(b)) => a.cmp(b),
            // Mixed numerics land in one index when an int literal probes a
            // float column; order them numerically.
            (Int(a), Float(b)) => OrdF64::new(*a as f64).cmp(b),
            (Float(a), Int(b)) => a.cmp(&OrdF64::new(*b as f64)),
            (Text(a), Text(b)) => a.cmp(b),
            (Timestamp(a), Timestamp(b)) => a.cmp(b),
            (Date(a), Date(b)) => a.cmp(b),
            (Uuid(a), Uuid(b)) => a.cmp(b),
            (Json(a), Json(b)) => a.to_string().cmp(&b.to_string()),
            (Array(a), Array(b)) | (Record(a), Record(b)) => a.cmp(b),
            (a, b) => a.rank().cmp(&b.rank()),
        }
    }
}

impl Hash for ScalarValue {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            ScalarValue::Null => 10u8.hash(state),
            ScalarValue::Bool(b) => {
                0u8.hash(state);
                b.hash(state);
            }
            // Ints hash as floats so Int(1) and Float(1.0), which compare
            // equal, also hash equal.
            ScalarValue::Int(v) => {
                2u8.hash(state);
                OrdF64::new(*v as f64).hash(state);
            }
            ScalarValue::Float(v) => {
                2u8.hash(state);
                v.hash(state);
            }
            ScalarValue::Text(v) => {
                3u8.hash(state);
                v.hash(state);
            }
            ScalarValue::Timestamp(v) => {
                4u8.hash(state);
                v.hash(state);
            }
            ScalarValue::Date(v) => {
                5u8.hash(state);
                v.hash(state);
            }
            ScalarValue::Uuid(v) => {
                6u8.hash(state);
                v.hash(state);
            }
            ScalarValue::Json(v) => {
                7u8.hash(state);
                v.to_string().hash(state);
            }
            ScalarValue::Array(vals) => {
                8u8.hash(state);
                vals.hash(state);
            }
            ScalarValue::Record(vals) => {
                9u8.hash(state);
                vals.hash(state);
            }
        }
    }
}

impl fmt::Display for ScalarValue {
    /// Postgres text rendering, used for casts to text and array
    /// serialization.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Null => write!(f, "NULL"),
            ScalarValue::Bool(b) => write!(f, "{}", if *b { "true" } else { "false" }),
            ScalarValue::Int(v) => write!(f, "{v}"),
            ScalarValue::Float(v) => {
                if v.fract() == 0.0 && v.is_finite() && v.abs() < 1e15 {
                    write!(f, "{}", **v as i64)
                } else {
                    write!(f, "{}", **v)
                }
            }
            ScalarValue::Text(v) => write!(f, "{v}"),
            ScalarValue::Timestamp(v) => write!(f, "{}", v.format("%Y-%m-%d %H:%M:%S%.f")),
            ScalarValue::Date(v) => write!(f, "{}", v.format("%Y-%m-%d")),
            ScalarValue::Uuid(v) => write!(f, "{v}"),
            ScalarValue::Json(v) => write!(f, "{v}"),
            ScalarValue::Array(vals) => {
                write!(f, "{{")?;
                for (idx, v) in vals.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, "}}")
            }
            ScalarValue::Record(vals) => {
                write!(f, "(")?;
                for (idx, v) in vals.iter().enumerate() {
                    if idx > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{v}")?;
                }
                write!(f, ")")
            }
        }
    }
}

impl From<bool> for ScalarValue {
    fn from(v: bool) -> Self {
        ScalarValue::Bool(v)
    }
}

impl From<i64> for ScalarValue {
    fn from(v: i64) -> Self {
        ScalarValue::Int(v)
    }
}

impl From<f64> for ScalarValue {
    fn from(v: f64) -> Self {
        ScalarValue::float(v)
    }
}

impl From<&str> for ScalarValue {
    fn from(v: &str) -> Self {
        ScalarValue::Text(v.to_string())
    }
}

impl From<String> for ScalarValue {
    fn from(v: String) -> Self {
        ScalarValue::Text(v)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn total_order_nulls_last() {
        let mut vals = vec![
            ScalarValue::Null,
            ScalarValue::Int(2),
            ScalarValue::Int(1),
        ];
        vals.sort();
        assert_eq!(
            vec![ScalarValue::Int(1), ScalarValue::Int(2), ScalarValue::Null],
            vals
        );
    }

    #[test]
    fn mixed_numeric_order() {
        assert_eq!(
            Ordering::Less,
            ScalarValue::Int(1).cmp(&ScalarValue::float(1.5))
        );
        assert_eq!(ScalarValue::Int(2), ScalarValue::float(2.0));
    }

    #[test]
    fn mixed_numeric_hash_agrees() {
        use std::hash::BuildHasher;
        let state = ahash::RandomState::with_seeds(1, 2, 3, 4);
        assert_eq!(
            state.hash_one(ScalarValue::Int(2)),
            state.hash_one(ScalarValue::float(2.0)),
        );
    }

    #[test]
    fn array_display() {
        let arr = ScalarValue::Array(vec![
            ScalarValue::Int(1),
            ScalarValue::Int(2),
            ScalarValue::Null,
        ]);
        assert_eq!("{1,2,NULL}", arr.to_string());
    }

    #[test]
    fn float_display_integral() {
        assert_eq!("3", ScalarValue::float(3.0).to_string());
        assert_eq!("3.5", ScalarValue::float(3.5).to_string());
    }
}
