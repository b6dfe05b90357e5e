//! Type reconciliation: inferring one common type for a heterogeneous set
//! of expressions (UNION, CASE, COALESCE, array literals).
//!
//! Postgres treats literals and column references asymmetrically: a literal
//! `1` unifies with a float column, but a float column does not silently
//! become int. So unification folds [`prefer`] over the non-constant inputs
//! only, and constants are then checked castable to the resolved type at
//! the literal level.

use pgstub_error::{DbError, ErrorKind, Result};

use super::cast::{can_cast, can_convert_implicit, prefer};
use super::datatype::DataType;

/// One input to reconciliation: its type and whether it is a row-independent
/// constant.
#[derive(Debug, Clone)]
pub struct ReconcileInput {
    pub datatype: DataType,
    pub is_constant: bool,
}

impl ReconcileInput {
    pub fn new(datatype: DataType, is_constant: bool) -> Self {
        ReconcileInput {
            datatype,
            is_constant,
        }
    }
}

pub fn reconcile_types(inputs: &[ReconcileInput]) -> Result<DataType> {
    if inputs.is_empty() {
        return Err(DbError::new("cannot reconcile an empty set of types"));
    }

    // All-null resolves to text.
    if inputs.iter().all(|i| i.datatype.is_null()) {
        return Ok(DataType::TEXT);
    }

    // A single concrete type shared by every non-null input wins outright.
    let mut concrete = inputs.iter().filter(|i| !i.datatype.is_null());
    let first = concrete.next().map(|i| i.datatype.clone());
    if let Some(first) = first {
        if concrete.all(|i| i.datatype == first) && inputs.iter().all(|i| i.datatype.is_null() || i.datatype == first) {
            return Ok(first);
        }
    }

    // Fold `prefer` over the non-constant inputs. Constants are exempt here;
    // they get cast at the literal level below.
    let mut resolved = DataType::Null;
    for input in inputs.iter().filter(|i| !i.is_constant) {
        resolved = prefer(&resolved, &input.datatype).ok_or_else(|| {
            unify_error(&resolved, &input.datatype)
        })?;
    }
    // Nothing but constants: fold over all of them instead.
    if resolved.is_null() {
        for input in inputs {
            resolved = prefer(&resolved, &input.datatype)
                .ok_or_else(|| unify_error(&resolved, &input.datatype))?;
        }
    }

    // Every non-constant input must implicitly convert to the resolved type;
    // constants only need an explicit cast to exist.
    for input in inputs {
        let ok = if input.is_constant {
            can_cast(&input.datatype, &resolved)
        } else {
            can_convert_implicit(&input.datatype, &resolved)
        };
        if !ok {
            return Err(DbError::with_kind(
                ErrorKind::Cast,
                format!(
                    "cannot convert {} to resolved common type {resolved}",
                    input.datatype
                ),
            ));
        }
    }

    Ok(resolved)
}

fn unify_error(a: &DataType, b: &DataType) -> DbError {
    DbError::with_kind(
        ErrorKind::Cast,
        format!("cannot unify types {a} and {b}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn col(ty: DataType) -> ReconcileInput {
        ReconcileInput::new(ty, false)
    }

    fn lit(ty: DataType) -> ReconcileInput {
        ReconcileInput::new(ty, true)
    }

    #[test]
    fn all_null_is_text() {
        let out = reconcile_types(&[col(DataType::Null), lit(DataType::Null)]).unwrap();
        assert_eq!(DataType::TEXT, out);
    }

    #[test]
    fn single_concrete_type_wins() {
        let out = reconcile_types(&[col(DataType::Uuid), col(DataType::Uuid)]).unwrap();
        assert_eq!(DataType::Uuid, out);
    }

    #[test]
    fn int_float_null_resolves_float_all_permutations() {
        let types = [DataType::Int, DataType::Float, DataType::Null];
        // All orderings of the three inputs must agree.
        let perms: [[usize; 3]; 6] = [
            [0, 1, 2],
            [0, 2, 1],
            [1, 0, 2],
            [1, 2, 0],
            [2, 0, 1],
            [2, 1, 0],
        ];
        for perm in perms {
            let inputs: Vec<_> = perm.iter().map(|&i| col(types[i].clone())).collect();
            assert_eq!(DataType::Float, reconcile_types(&inputs).unwrap());
        }
    }

    #[test]
    fn text_int_columns_error() {
        let err = reconcile_types(&[col(DataType::TEXT), col(DataType::Int)]).unwrap_err();
        assert_eq!(ErrorKind::Cast, err.kind());
    }

    #[test]
    fn text_column_int_literal_resolves_text() {
        // The literal is exempt from unification; it will be cast at the
        // literal level.
        let out = reconcile_types(&[col(DataType::TEXT), lit(DataType::Int)]).unwrap();
        assert_eq!(DataType::TEXT, out);
    }

    #[test]
    fn int_column_text_literal_resolves_int() {
        let out = reconcile_types(&[col(DataType::Int), lit(DataType::TEXT)]).unwrap();
        assert_eq!(DataType::Int, out);
    }

    #[test]
    fn non_constant_float_does_not_narrow() {
        // A float column with an int column resolves float, never int.
        let out = reconcile_types(&[col(DataType::Float), col(DataType::Int)]).unwrap();
        assert_eq!(DataType::Float, out);
    }

    #[test]
    fn constant_only_inputs_fold() {
        let out = reconcile_types(&[lit(DataType::Int), lit(DataType::Float)]).unwrap();
        assert_eq!(DataType::Float, out);
    }
}
