//! Typed expressions over rows.
//!
//! An [`Evaluator`] is the engine's value abstraction: every column
//! reference, literal, cast, and predicate is one. Evaluators are immutable,
//! structurally hashable (equal evaluators are guaranteed to compute equal
//! results for equal rows, which is how predicates get matched against index
//! key expressions), and know their output type at build time.
//!
//! Constructors normalize types eagerly: comparisons reconcile their operand
//! types and cast constant literals at build time, so type errors surface
//! before any row is processed.

use std::fmt;

use pgstub_error::{DbError, ErrorKind, Result};

use crate::txn::{Row, Transaction};
use crate::types::cast::{can_cast, cast_value};
use crate::types::compare::{sql_eq, sql_ge, sql_gt, sql_le, sql_lt};
use crate::types::reconcile::{ReconcileInput, reconcile_types};
use crate::types::{DataType, ScalarValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    /// Flip sides: `a >= b` becomes `b <= a`.
    pub fn flip(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Eq,
            CmpOp::NotEq => CmpOp::NotEq,
            CmpOp::Lt => CmpOp::Gt,
            CmpOp::LtEq => CmpOp::GtEq,
            CmpOp::Gt => CmpOp::Lt,
            CmpOp::GtEq => CmpOp::LtEq,
        }
    }
}

impl fmt::Display for CmpOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CmpOp::Eq => "=",
            CmpOp::NotEq => "<>",
            CmpOp::Lt => "<",
            CmpOp::LtEq => "<=",
            CmpOp::Gt => ">",
            CmpOp::GtEq => ">=",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LogicOp {
    And,
    Or,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Evaluator {
    /// Reference to a column of the input row.
    Column {
        index: usize,
        name: String,
        datatype: DataType,
    },
    Constant {
        value: ScalarValue,
        datatype: DataType,
    },
    Cast {
        input: Box<Evaluator>,
        to: DataType,
    },
    /// Three-valued comparison. Both sides share one reconciled type.
    Comparison {
        op: CmpOp,
        left: Box<Evaluator>,
        right: Box<Evaluator>,
    },
    Logical {
        op: LogicOp,
        inputs: Vec<Evaluator>,
    },
    Not(Box<Evaluator>),
    IsNull {
        input: Box<Evaluator>,
        negated: bool,
    },
    /// `expr IN (list)` / `expr NOT IN (list)`.
    InList {
        expr: Box<Evaluator>,
        list: Vec<Evaluator>,
        negated: bool,
    },
    /// Whole-row composite value of an aliased selection.
    Record {
        name: String,
        fields: Vec<Evaluator>,
        datatype: DataType,
    },
}

impl Evaluator {
    pub fn datatype(&self) -> DataType {
        match self {
            Evaluator::Column { datatype, .. } => datatype.clone(),
            Evaluator::Constant { datatype, .. } => datatype.clone(),
            Evaluator::Cast { to, .. } => to.clone(),
            Evaluator::Comparison { .. }
            | Evaluator::Logical { .. }
            | Evaluator::Not(_)
            | Evaluator::IsNull { .. }
            | Evaluator::InList { .. } => DataType::Bool,
            Evaluator::Record { datatype, .. } => datatype.clone(),
        }
    }

    /// Row-independent: evaluates to the same value for every row.
    pub fn is_constant(&self) -> bool {
        match self {
            Evaluator::Column { .. } | Evaluator::Record { .. } => false,
            Evaluator::Constant { .. } => true,
            Evaluator::Cast { input, .. } => input.is_constant(),
            Evaluator::Comparison { left, right, .. } => {
                left.is_constant() && right.is_constant()
            }
            Evaluator::Logical { inputs, .. } => inputs.iter().all(|i| i.is_constant()),
            Evaluator::Not(input) => input.is_constant(),
            Evaluator::IsNull { input, .. } => input.is_constant(),
            Evaluator::InList { expr, list, .. } => {
                expr.is_constant() && list.iter().all(|i| i.is_constant())
            }
        }
    }

    /// Evaluate against one row under a transaction snapshot.
    pub fn eval(&self, row: &Row, txn: &Transaction) -> Result<ScalarValue> {
        match self {
            Evaluator::Column { index, name, .. } => {
                row.get(*index).cloned().ok_or_else(|| {
                    DbError::new(format!("row is missing column {name} at index {index}"))
                })
            }
            Evaluator::Constant { value, .. } => Ok(value.clone()),
            Evaluator::Cast { input, to } => {
                let v = input.eval(row, txn)?;
                cast_value(&input.datatype(), &v, to)
            }
            Evaluator::Comparison { op, left, right } => {
                let ty = left.datatype();
                let a = left.eval(row, txn)?;
                let b = right.eval(row, txn)?;
                let tri = match op {
                    CmpOp::Eq => sql_eq(&ty, &a, &b)?,
                    CmpOp::NotEq => sql_eq(&ty, &a, &b)?.map(|v| !v),
                    CmpOp::Lt => sql_lt(&ty, &a, &b)?,
                    CmpOp::LtEq => sql_le(&ty, &a, &b)?,
                    CmpOp::Gt => sql_gt(&ty, &a, &b)?,
                    CmpOp::GtEq => sql_ge(&ty, &a, &b)?,
                };
                Ok(tri_to_value(tri))
            }
            Evaluator::Logical { op, inputs } => {
                // SQL three-valued AND/OR with short circuit on the
                // deciding value.
                let mut saw_null = false;
                for input in inputs {
                    match input.eval(row, txn)?.as_bool() {
                        Some(true) if matches!(op, LogicOp::Or) => {
                            return Ok(ScalarValue::Bool(true));
                        }
                        Some(false) if matches!(op, LogicOp::And) => {
                            return Ok(ScalarValue::Bool(false));
                        }
                        Some(_) => {}
                        None => saw_null = true,
                    }
                }
                if saw_null {
                    return Ok(ScalarValue::Null);
                }
                Ok(ScalarValue::Bool(matches!(op, LogicOp::And)))
            }
            Evaluator::Not(input) => Ok(tri_to_value(
                input.eval(row, txn)?.as_bool().map(|b| !b),
            )),
            Evaluator::IsNull { input, negated } => {
                let is_null = input.eval(row, txn)?.is_null();
                Ok(ScalarValue::Bool(is_null != *negated))
            }
            Evaluator::InList {
                expr,
                list,
                negated,
            } => {
                let ty = expr.datatype();
                let needle = expr.eval(row, txn)?;
                let mut saw_null = false;
                for item in list {
                    match sql_eq(&ty, &needle, &item.eval(row, txn)?)? {
                        Some(true) => return Ok(ScalarValue::Bool(!negated)),
                        Some(false) => {}
                        None => saw_null = true,
                    }
                }
                if saw_null {
                    return Ok(ScalarValue::Null);
                }
                Ok(ScalarValue::Bool(*negated))
            }
            Evaluator::Record { fields, .. } => {
                let vals: Result<Vec<_>> =
                    fields.iter().map(|f| f.eval(row, txn)).collect();
                Ok(ScalarValue::Record(vals?))
            }
        }
    }

    /// Wrap in a cast to the target type.
    ///
    /// Constant inputs fold eagerly so unparseable literals error at build
    /// time, not mid-enumeration. Fails if no cast is defined.
    pub fn cast(self, to: DataType) -> Result<Evaluator> {
        let from = self.datatype();
        if from == to {
            return Ok(self);
        }
        if !can_cast(&from, &to) {
            return Err(DbError::with_kind(
                ErrorKind::Cast,
                format!("cannot cast type {from} to {to}"),
            ));
        }
        if let Evaluator::Constant { value, .. } = &self {
            let value = cast_value(&from, value, &to)?;
            return Ok(Evaluator::Constant {
                value,
                datatype: to,
            });
        }
        Ok(Evaluator::Cast {
            input: Box::new(self),
            to,
        })
    }

    /// Build a comparison, reconciling both operand types and casting as
    /// needed so evaluation compares like with like.
    pub fn compare(op: CmpOp, left: Evaluator, right: Evaluator) -> Result<Evaluator> {
        let ty = reconcile_types(&[
            ReconcileInput::new(left.datatype(), left.is_constant()),
            ReconcileInput::new(right.datatype(), right.is_constant()),
        ])?;
        Ok(Evaluator::Comparison {
            op,
            left: Box::new(left.cast(ty.clone())?),
            right: Box::new(right.cast(ty)?),
        })
    }

    /// Build `expr IN (list)` with all members reconciled to one type.
    pub fn in_list(expr: Evaluator, list: Vec<Evaluator>, negated: bool) -> Result<Evaluator> {
        let mut inputs = vec![ReconcileInput::new(expr.datatype(), expr.is_constant())];
        inputs.extend(
            list.iter()
                .map(|e| ReconcileInput::new(e.datatype(), e.is_constant())),
        );
        let ty = reconcile_types(&inputs)?;

        let list: Result<Vec<_>> = list.into_iter().map(|e| e.cast(ty.clone())).collect();
        Ok(Evaluator::InList {
            expr: Box::new(expr.cast(ty)?),
            list: list?,
            negated,
        })
    }

    /// Flatten a conjunction into its conjuncts. Non-AND expressions return
    /// themselves.
    pub fn conjuncts(&self) -> Vec<&Evaluator> {
        match self {
            Evaluator::Logical {
                op: LogicOp::And,
                inputs,
            } => inputs.iter().flat_map(|i| i.conjuncts()).collect(),
            other => vec![other],
        }
    }

    /// Largest column index referenced, for build-time arity validation.
    pub fn max_column_index(&self) -> Option<usize> {
        match self {
            Evaluator::Column { index, .. } => Some(*index),
            Evaluator::Constant { .. } => None,
            Evaluator::Cast { input, .. } | Evaluator::Not(input) => input.max_column_index(),
            Evaluator::IsNull { input, .. } => input.max_column_index(),
            Evaluator::Comparison { left, right, .. } => {
                left.max_column_index().max(right.max_column_index())
            }
            Evaluator::Logical { inputs, .. } => {
                inputs.iter().filter_map(|i| i.max_column_index()).max()
            }
            Evaluator::InList { expr, list, .. } => expr
                .max_column_index()
                .max(list.iter().filter_map(|i| i.max_column_index()).max()),
            Evaluator::Record { fields, .. } => {
                fields.iter().filter_map(|f| f.max_column_index()).max()
            }
        }
    }

    /// Rewrite column references by subtracting `offset`, moving an
    /// expression from a join's combined row back into the right child's
    /// own layout. Returns `None` if any reference lands below zero, i.e.
    /// the expression also touches the left side.
    pub fn unshift_columns(&self, offset: usize) -> Option<Evaluator> {
        match self {
            Evaluator::Column {
                index,
                name,
                datatype,
            } => Some(Evaluator::Column {
                index: index.checked_sub(offset)?,
                name: name.clone(),
                datatype: datatype.clone(),
            }),
            Evaluator::Constant { .. } => Some(self.clone()),
            Evaluator::Cast { input, to } => Some(Evaluator::Cast {
                input: Box::new(input.unshift_columns(offset)?),
                to: to.clone(),
            }),
            Evaluator::Comparison { op, left, right } => Some(Evaluator::Comparison {
                op: *op,
                left: Box::new(left.unshift_columns(offset)?),
                right: Box::new(right.unshift_columns(offset)?),
            }),
            Evaluator::Logical { op, inputs } => Some(Evaluator::Logical {
                op: *op,
                inputs: inputs
                    .iter()
                    .map(|i| i.unshift_columns(offset))
                    .collect::<Option<Vec<_>>>()?,
            }),
            Evaluator::Not(input) => {
                Some(Evaluator::Not(Box::new(input.unshift_columns(offset)?)))
            }
            Evaluator::IsNull { input, negated } => Some(Evaluator::IsNull {
                input: Box::new(input.unshift_columns(offset)?),
                negated: *negated,
            }),
            Evaluator::InList {
                expr,
                list,
                negated,
            } => Some(Evaluator::InList {
                expr: Box::new(expr.unshift_columns(offset)?),
                list: list
                    .iter()
                    .map(|i| i.unshift_columns(offset))
                    .collect::<Option<Vec<_>>>()?,
                negated: *negated,
            }),
            Evaluator::Record {
                name,
                fields,
                datatype,
            } => Some(Evaluator::Record {
                name: name.clone(),
                fields: fields
                    .iter()
                    .map(|f| f.unshift_columns(offset))
                    .collect::<Option<Vec<_>>>()?,
                datatype: datatype.clone(),
            }),
        }
    }

    /// Rewrite column references by adding `offset`, used when an expression
    /// moves into the combined row of a join.
    pub fn shift_columns(&self, offset: usize) -> Evaluator {
        match self {
            Evaluator::Column {
                index,
                name,
                datatype,
            } => Evaluator::Column {
                index: index + offset,
                name: name.clone(),
                datatype: datatype.clone(),
            },
            Evaluator::Constant { .. } => self.clone(),
            Evaluator::Cast { input, to } => Evaluator::Cast {
                input: Box::new(input.shift_columns(offset)),
                to: to.clone(),
            },
            Evaluator::Comparison { op, left, right } => Evaluator::Comparison {
                op: *op,
                left: Box::new(left.shift_columns(offset)),
                right: Box::new(right.shift_columns(offset)),
            },
            Evaluator::Logical { op, inputs } => Evaluator::Logical {
                op: *op,
                inputs: inputs.iter().map(|i| i.shift_columns(offset)).collect(),
            },
            Evaluator::Not(input) => Evaluator::Not(Box::new(input.shift_columns(offset))),
            Evaluator::IsNull { input, negated } => Evaluator::IsNull {
                input: Box::new(input.shift_columns(offset)),
                negated: *negated,
            },
            Evaluator::InList {
                expr,
                list,
                negated,
            } => Evaluator::InList {
                expr: Box::new(expr.shift_columns(offset)),
                list: list.iter().map(|i| i.shift_columns(offset)).collect(),
                negated: *negated,
            },
            Evaluator::Record {
                name,
                fields,
                datatype,
            } => Evaluator::Record {
                name: name.clone(),
                fields: fields.iter().map(|f| f.shift_columns(offset)).collect(),
                datatype: datatype.clone(),
            },
        }
    }
}

impl fmt::Display for Evaluator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Evaluator::Column { name, .. } => write!(f, "{name}"),
            Evaluator::Constant { value, .. } => match value {
                ScalarValue::Text(s) => write!(f, "'{s}'"),
                other => write!(f, "{other}"),
            },
            Evaluator::Cast { input, to } => write!(f, "CAST({input} AS {to})"),
            Evaluator::Comparison { op, left, right } => write!(f, "({left} {op} {right})"),
            Evaluator::Logical { op, inputs } => {
                let sep = match op {
                    LogicOp::And => " AND ",
                    LogicOp::Or => " OR ",
                };
                write!(f, "(")?;
                for (i, input) in inputs.iter().enumerate() {
                    if i > 0 {
                        write!(f, "{sep}")?;
                    }
                    write!(f, "{input}")?;
                }
                write!(f, ")")
            }
            Evaluator::Not(input) => write!(f, "(NOT {input})"),
            Evaluator::IsNull { input, negated } => {
                if *negated {
                    write!(f, "({input} IS NOT NULL)")
                } else {
                    write!(f, "({input} IS NULL)")
                }
            }
            Evaluator::InList {
                expr,
                list,
                negated,
            } => {
                write!(f, "({expr} ")?;
                if *negated {
                    write!(f, "NOT ")?;
                }
                write!(f, "IN (")?;
                for (i, item) in list.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "))")
            }
            Evaluator::Record { name, .. } => write!(f, "{name}"),
        }
    }
}

fn tri_to_value(tri: Option<bool>) -> ScalarValue {
    match tri {
        Some(b) => ScalarValue::Bool(b),
        None => ScalarValue::Null,
    }
}

// Shorthand constructors, mostly for building plans by hand and in tests.

pub fn column(index: usize, name: impl Into<String>, datatype: DataType) -> Evaluator {
    Evaluator::Column {
        index,
        name: name.into(),
        datatype,
    }
}

pub fn lit(value: impl Into<ScalarValue>) -> Evaluator {
    let value = value.into();
    let datatype = value.natural_type();
    Evaluator::Constant { value, datatype }
}

pub fn null_lit() -> Evaluator {
    Evaluator::Constant {
        value: ScalarValue::Null,
        datatype: DataType::Null,
    }
}

pub fn eq(left: Evaluator, right: Evaluator) -> Result<Evaluator> {
    Evaluator::compare(CmpOp::Eq, left, right)
}

pub fn and(inputs: Vec<Evaluator>) -> Evaluator {
    Evaluator::Logical {
        op: LogicOp::And,
        inputs,
    }
}

pub fn or(inputs: Vec<Evaluator>) -> Evaluator {
    Evaluator::Logical {
        op: LogicOp::Or,
        inputs,
    }
}
