//! SQL three-valued comparison.
//!
//! Any null operand yields unknown (`None`), which callers translate into
//! SQL three-valued logic. Concrete comparisons are driven by the declared
//! type, not the value variant, so enum values (stored as text) order by
//! label position and arrays compare element-wise.

use std::cmp::Ordering;

use pgstub_error::{DbError, ErrorKind, Result};

use super::datatype::DataType;
use super::value::ScalarValue;

/// Type-directed ordering of two non-null values. Returns `None` if either
/// operand is null.
pub fn sql_cmp(ty: &DataType, a: &ScalarValue, b: &ScalarValue) -> Result<Option<Ordering>> {
    if a.is_null() || b.is_null() {
        return Ok(None);
    }

    match ty {
        DataType::Enum(e) => {
            let (ScalarValue::Text(la), ScalarValue::Text(lb)) = (a, b) else {
                return Err(type_mismatch(ty, a, b));
            };
            let ia = e.label_index(la).ok_or_else(|| bad_label(e, la))?;
            let ib = e.label_index(lb).ok_or_else(|| bad_label(e, lb))?;
            Ok(Some(ia.cmp(&ib)))
        }
        DataType::Array(elem) => {
            let (ScalarValue::Array(va), ScalarValue::Array(vb)) = (a, b) else {
                return Err(type_mismatch(ty, a, b));
            };
            // Element-wise, length as the final tiebreak: a strict prefix
            // sorts before the longer array.
            for (ea, eb) in va.iter().zip(vb.iter()) {
                match sql_cmp(elem, ea, eb)? {
                    Some(Ordering::Equal) => continue,
                    Some(ord) => return Ok(Some(ord)),
                    // Null element: fall back to the total order so array
                    // comparison stays deterministic.
                    None => match ea.cmp(eb) {
                        Ordering::Equal => continue,
                        ord => return Ok(Some(ord)),
                    },
                }
            }
            Ok(Some(va.len().cmp(&vb.len())))
        }
        _ => Ok(Some(a.cmp(b))),
    }
}

pub fn sql_eq(ty: &DataType, a: &ScalarValue, b: &ScalarValue) -> Result<Option<bool>> {
    Ok(sql_cmp(ty, a, b)?.map(|ord| ord == Ordering::Equal))
}

pub fn sql_gt(ty: &DataType, a: &ScalarValue, b: &ScalarValue) -> Result<Option<bool>> {
    Ok(sql_cmp(ty, a, b)?.map(|ord| ord == Ordering::Greater))
}

pub fn sql_lt(ty: &DataType, a: &ScalarValue, b: &ScalarValue) -> Result<Option<bool>> {
    Ok(sql_cmp(ty, a, b)?.map(|ord| ord == Ordering::Less))
}

/// `a >= b`, derived as `gt or eq`.
pub fn sql_ge(ty: &DataType, a: &ScalarValue, b: &ScalarValue) -> Result<Option<bool>> {
    Ok(sql_cmp(ty, a, b)?.map(|ord| ord != Ordering::Less))
}

/// `a <= b`, derived as `lt or eq`.
pub fn sql_le(ty: &DataType, a: &ScalarValue, b: &ScalarValue) -> Result<Option<bool>> {
    Ok(sql_cmp(ty, a, b)?.map(|ord| ord != Ordering::Greater))
}

fn type_mismatch(ty: &DataType, a: &ScalarValue, b: &ScalarValue) -> DbError {
    DbError::with_kind(ErrorKind::Cast, format!("cannot compare values as {ty}"))
        .with_field("left", format!("{a:?}"))
        .with_field("right", format!("{b:?}"))
}

fn bad_label(e: &super::datatype::EnumType, label: &str) -> DbError {
    DbError::with_kind(
        ErrorKind::Cast,
        format!("invalid input value for enum {}: \"{label}\"", e.name),
    )
}
