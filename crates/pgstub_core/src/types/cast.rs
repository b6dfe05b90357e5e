//! Casting and implicit-conversion rules.
//!
//! Three related relations, kept separate because postgres treats them
//! differently:
//!
//! - `can_convert_implicit`: may a value of one type silently participate in
//!   an expression or index lookup expecting another (int literal in a float
//!   column).
//! - `can_cast` / `cast_value`: explicit `CAST` / `::` conversions.
//! - `prefer`: binary-operator type resolution, used by reconciliation.

use std::sync::Arc;

use chrono::NaiveTime;
use pgstub_error::{DbError, ErrorKind, Result};

use super::datatype::DataType;
use super::parse;
use super::value::ScalarValue;

/// May a value of `from` silently convert to `to`?
pub fn can_convert_implicit(from: &DataType, to: &DataType) -> bool {
    if from == to {
        return true;
    }
    match (from, to) {
        (DataType::Null, _) => true,
        (DataType::Int, DataType::Float) => true,
        // varchar(n) widens to text or a larger varchar, never the reverse.
        (DataType::Text(Some(_)), DataType::Text(None)) => true,
        (DataType::Text(Some(m)), DataType::Text(Some(n))) => n >= m,
        (DataType::Date, DataType::Timestamp) => true,
        (DataType::Array(a), DataType::Array(b)) => can_convert_implicit(a, b),
        _ => false,
    }
}

/// Binary-operator type resolution: the common type of `a op b`, or `None`
/// if the pair is not unifiable.
pub fn prefer(a: &DataType, b: &DataType) -> Option<DataType> {
    if a == b {
        return Some(a.clone());
    }
    match (a, b) {
        (DataType::Null, other) | (other, DataType::Null) => Some(other.clone()),
        (DataType::Int, DataType::Float) | (DataType::Float, DataType::Int) => {
            Some(DataType::Float)
        }
        (DataType::Text(m), DataType::Text(n)) => match (m, n) {
            (Some(m), Some(n)) => Some(DataType::Text(Some(*m.max(n)))),
            _ => Some(DataType::Text(None)),
        },
        (DataType::Date, DataType::Timestamp) | (DataType::Timestamp, DataType::Date) => {
            Some(DataType::Timestamp)
        }
        (DataType::Array(ea), DataType::Array(eb)) => {
            Some(DataType::Array(Arc::new(prefer(ea, eb)?)))
        }
        _ => None,
    }
}

/// May a value of `from` be explicitly cast to `to`?
///
/// Casting is one-directional unless both directions are listed here.
pub fn can_cast(from: &DataType, to: &DataType) -> bool {
    if from == to {
        return true;
    }
    match (from, to) {
        (DataType::Null, _) => true,
        // Everything renders to text.
        (_, DataType::Text(_)) => true,
        // Text parses into most concrete types.
        (DataType::Text(_), DataType::Bool)
        | (DataType::Text(_), DataType::Int)
        | (DataType::Text(_), DataType::Float)
        | (DataType::Text(_), DataType::Date)
        | (DataType::Text(_), DataType::Timestamp)
        | (DataType::Text(_), DataType::Uuid)
        | (DataType::Text(_), DataType::Json)
        | (DataType::Text(_), DataType::Enum(_))
        | (DataType::Text(_), DataType::Array(_)) => true,
        (DataType::Int, DataType::Float) | (DataType::Float, DataType::Int) => true,
        (DataType::Bool, DataType::Int) | (DataType::Int, DataType::Bool) => true,
        (DataType::Date, DataType::Timestamp) | (DataType::Timestamp, DataType::Date) => true,
        (DataType::Array(a), DataType::Array(b)) => can_cast(a, b),
        _ => false,
    }
}

/// Cast a value from one type to another.
///
/// Fails with a cast error if [`can_cast`] is false or the value does not
/// parse/fit under the target type. Null casts to null of any type.
pub fn cast_value(from: &DataType, value: &ScalarValue, to: &DataType) -> Result<ScalarValue> {
    if value.is_null() {
        return Ok(ScalarValue::Null);
    }
    if !can_cast(from, to) {
        return Err(cast_error(from, to, "no cast defined"));
    }
    if from == to {
        return Ok(value.clone());
    }

    match to {
        DataType::Text(bound) => {
            let rendered = match value {
                ScalarValue::Text(s) => s.clone(),
                other => other.to_string(),
            };
            cast_to_text(from, rendered, *bound)
        }
        DataType::Bool => match value {
            ScalarValue::Text(s) => parse::parse_bool(s)
                .map(ScalarValue::Bool)
                .ok_or_else(|| cast_error(from, to, s)),
            ScalarValue::Int(v) => Ok(ScalarValue::Bool(*v != 0)),
            _ => Err(cast_error(from, to, "unsupported source value")),
        },
        DataType::Int => match value {
            ScalarValue::Text(s) => parse::parse_int(s)
                .map(ScalarValue::Int)
                .ok_or_else(|| cast_error(from, to, s)),
            // Non-integer numerics round, they do not truncate.
            ScalarValue::Float(f) => {
                if !f.is_finite() {
                    return Err(cast_error(from, to, "non-finite value"));
                }
                Ok(ScalarValue::Int(f.round() as i64))
            }
            ScalarValue::Bool(b) => Ok(ScalarValue::Int(i64::from(*b))),
            _ => Err(cast_error(from, to, "unsupported source value")),
        },
        DataType::Float => match value {
            ScalarValue::Text(s) => parse::parse_float(s)
                .map(ScalarValue::float)
                .ok_or_else(|| cast_error(from, to, s)),
            ScalarValue::Int(v) => Ok(ScalarValue::float(*v as f64)),
            _ => Err(cast_error(from, to, "unsupported source value")),
        },
        DataType::Date => match value {
            ScalarValue::Text(s) => parse::parse_date(s)
                .map(ScalarValue::Date)
                .ok_or_else(|| cast_error(from, to, s)),
            ScalarValue::Timestamp(ts) => Ok(ScalarValue::Date(ts.date())),
            _ => Err(cast_error(from, to, "unsupported source value")),
        },
        DataType::Timestamp => match value {
            ScalarValue::Text(s) => parse::parse_timestamp(s)
                .map(ScalarValue::Timestamp)
                .ok_or_else(|| cast_error(from, to, s)),
            ScalarValue::Date(d) => Ok(ScalarValue::Timestamp(d.and_time(NaiveTime::MIN))),
            _ => Err(cast_error(from, to, "unsupported source value")),
        },
        DataType::Uuid => match value {
            ScalarValue::Text(s) => parse::parse_uuid(s)
                .map(ScalarValue::Uuid)
                .ok_or_else(|| cast_error(from, to, s)),
            _ => Err(cast_error(from, to, "unsupported source value")),
        },
        DataType::Json => match value {
            ScalarValue::Text(s) => parse::parse_json(s)
                .map(ScalarValue::Json)
                .ok_or_else(|| cast_error(from, to, s)),
            _ => Err(cast_error(from, to, "unsupported source value")),
        },
        DataType::Enum(e) => match value {
            ScalarValue::Text(s) => {
                if e.label_index(s).is_some() {
                    Ok(ScalarValue::Text(s.clone()))
                } else {
                    Err(DbError::with_kind(
                        ErrorKind::Cast,
                        format!("invalid input value for enum {}: \"{s}\"", e.name),
                    ))
                }
            }
            _ => Err(cast_error(from, to, "unsupported source value")),
        },
        DataType::Array(elem) => match (from, value) {
            (DataType::Array(from_elem), ScalarValue::Array(vals)) => {
                let cast: Result<Vec<_>> = vals
                    .iter()
                    .map(|v| cast_value(from_elem, v, elem))
                    .collect();
                Ok(ScalarValue::Array(cast?))
            }
            (DataType::Text(_), ScalarValue::Text(s)) => {
                let raw = parse::parse_array_literal(s)
                    .ok_or_else(|| cast_error(from, to, s))?;
                let cast: Result<Vec<_>> = raw
                    .into_iter()
                    .map(|elem_str| match elem_str {
                        None => Ok(ScalarValue::Null),
                        Some(s) => {
                            cast_value(&DataType::TEXT, &ScalarValue::Text(s), elem)
                        }
                    })
                    .collect();
                Ok(ScalarValue::Array(cast?))
            }
            _ => Err(cast_error(from, to, "unsupported source value")),
        },
        DataType::Null | DataType::Record(_) => {
            Err(cast_error(from, to, "unsupported target"))
        }
    }
}

/// Apply the length bound for casts into `varchar(n)`.
///
/// A source of unknown length (unbounded text) that exceeds the bound is a
/// value-too-long error; bounded or rendered sources truncate.
fn cast_to_text(from: &DataType, rendered: String, bound: Option<u32>) -> Result<ScalarValue> {
    let Some(n) = bound else {
        return Ok(ScalarValue::Text(rendered));
    };
    let n = n as usize;
    let char_count = rendered.chars().count();
    if char_count <= n {
        return Ok(ScalarValue::Text(rendered));
    }
    if matches!(from, DataType::Text(None)) {
        return Err(DbError::with_kind(
            ErrorKind::Cast,
            format!("value too long for type character varying({n})"),
        ));
    }
    Ok(ScalarValue::Text(rendered.chars().take(n).collect()))
}

fn cast_error(from: &DataType, to: &DataType, detail: impl std::fmt::Display) -> DbError {
    DbError::with_kind(ErrorKind::Cast, format!("cannot cast {from} to {to}"))
        .with_field("detail", detail)
}

#[cfg(test)]
mod tests {
    use chrono::NaiveDate;

    use super::*;

    fn text(s: &str) -> ScalarValue {
        ScalarValue::text(s)
    }

    #[test]
    fn implicit_int_to_float_only() {
        assert!(can_convert_implicit(&DataType::Int, &DataType::Float));
        assert!(!can_convert_implicit(&DataType::Float, &DataType::Int));
        assert!(!can_convert_implicit(&DataType::TEXT, &DataType::Int));
        assert!(can_convert_implicit(&DataType::Null, &DataType::Uuid));
    }

    #[test]
    fn prefer_numeric() {
        assert_eq!(
            Some(DataType::Float),
            prefer(&DataType::Int, &DataType::Float)
        );
        assert_eq!(Some(DataType::Int), prefer(&DataType::Null, &DataType::Int));
        assert_eq!(None, prefer(&DataType::TEXT, &DataType::Int));
    }

    #[test]
    fn prefer_text_widens() {
        assert_eq!(
            Some(DataType::Text(Some(20))),
            prefer(&DataType::Text(Some(10)), &DataType::Text(Some(20)))
        );
        assert_eq!(
            Some(DataType::TEXT),
            prefer(&DataType::Text(Some(10)), &DataType::TEXT)
        );
    }

    #[test]
    fn float_to_int_rounds() {
        let v = cast_value(&DataType::Float, &ScalarValue::float(2.6), &DataType::Int).unwrap();
        assert_eq!(ScalarValue::Int(3), v);
        let v = cast_value(&DataType::Float, &ScalarValue::float(-2.6), &DataType::Int).unwrap();
        assert_eq!(ScalarValue::Int(-3), v);
    }

    #[test]
    fn text_to_int_validity() {
        assert_eq!(
            ScalarValue::Int(2),
            cast_value(&DataType::TEXT, &text("2.0"), &DataType::Int).unwrap()
        );
        assert!(cast_value(&DataType::TEXT, &text("2.5"), &DataType::Int).is_err());
        assert!(cast_value(&DataType::TEXT, &text("abc"), &DataType::Int).is_err());
    }

    #[test]
    fn date_text_roundtrip() {
        let d = cast_value(&DataType::TEXT, &text("2024-01-02"), &DataType::Date).unwrap();
        assert_eq!(
            ScalarValue::Date(NaiveDate::from_ymd_opt(2024, 1, 2).unwrap()),
            d
        );
        let back = cast_value(&DataType::Date, &d, &DataType::TEXT).unwrap();
        assert_eq!(text("2024-01-02"), back);
    }

    #[test]
    fn value_too_long() {
        // Unbounded source that exceeds the bound errors.
        let err = cast_value(&DataType::TEXT, &text("toolong"), &DataType::Text(Some(3)))
            .unwrap_err();
        assert_eq!(ErrorKind::Cast, err.kind());
        // Bounded source truncates.
        let v = cast_value(
            &DataType::Text(Some(10)),
            &text("truncated"),
            &DataType::Text(Some(5)),
        )
        .unwrap();
        assert_eq!(text("trunc"), v);
    }

    #[test]
    fn null_casts_to_anything() {
        let v = cast_value(&DataType::Null, &ScalarValue::Null, &DataType::Uuid).unwrap();
        assert_eq!(ScalarValue::Null, v);
    }

    #[test]
    fn array_text_roundtrip() {
        let arr_ty = DataType::Array(Arc::new(DataType::Int));
        let v = cast_value(&DataType::TEXT, &text("{1,2,3}"), &arr_ty).unwrap();
        assert_eq!(
            ScalarValue::Array(vec![
                ScalarValue::Int(1),
                ScalarValue::Int(2),
                ScalarValue::Int(3)
            ]),
            v
        );
        let back = cast_value(&arr_ty, &v, &DataType::TEXT).unwrap();
        assert_eq!(text("{1,2,3}"), back);
    }

    #[test]
    fn no_cast_defined() {
        let err = cast_value(&DataType::Uuid, &ScalarValue::Uuid(uuid::Uuid::nil()), &DataType::Int)
            .unwrap_err();
        assert_eq!(ErrorKind::Cast, err.kind());
    }
}
