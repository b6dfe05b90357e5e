//! Aggregate functions and their streaming accumulators.

use std::sync::Arc;

use hashbrown::HashMap;
use pgstub_error::{DbError, Result};
use tracing::debug;

use super::{RowIter, Selection};
use crate::expr::Evaluator;
use crate::txn::{Row, Transaction};
use crate::types::compare::sql_cmp;
use crate::types::{DataType, ScalarValue};

#[derive(Debug, Clone, PartialEq)]
pub enum AggFunc {
    CountStar,
    Count(Evaluator),
    Sum(Evaluator),
    Avg(Evaluator),
    Min(Evaluator),
    Max(Evaluator),
}

impl AggFunc {
    pub fn output_type(&self) -> DataType {
        match self {
            AggFunc::CountStar | AggFunc::Count(_) => DataType::Int,
            AggFunc::Sum(e) => e.datatype(),
            AggFunc::Avg(_) => DataType::Float,
            AggFunc::Min(e) | AggFunc::Max(e) => e.datatype(),
        }
    }

    /// Build-time validation: argument arity and, for arithmetic
    /// aggregates, a numeric argument type.
    pub(crate) fn validate(&self, ncols: usize) -> Result<()> {
        let arg = match self {
            AggFunc::CountStar => return Ok(()),
            AggFunc::Count(e)
            | AggFunc::Sum(e)
            | AggFunc::Avg(e)
            | AggFunc::Min(e)
            | AggFunc::Max(e) => e,
        };
        if let Some(max) = arg.max_column_index() {
            if max >= ncols {
                return Err(DbError::new(format!(
                    "aggregate argument references column index {max} but the input has {ncols} columns"
                )));
            }
        }
        if matches!(self, AggFunc::Sum(_) | AggFunc::Avg(_)) {
            let ty = arg.datatype();
            if !ty.is_numeric() && !ty.is_null() {
                return Err(DbError::new(format!(
                    "function does not exist for argument type {ty}"
                )));
            }
        }
        Ok(())
    }
}

/// One named aggregate output.
#[derive(Debug, Clone)]
pub struct AggregateExpr {
    pub func: AggFunc,
    pub name: String,
}

impl AggregateExpr {
    pub fn new(func: AggFunc, name: impl Into<String>) -> Self {
        AggregateExpr {
            func,
            name: name.into(),
        }
    }
}

/// Streaming accumulator for one aggregate within one group.
pub(crate) enum AggState {
    Count {
        value: i64,
        expr: Option<Evaluator>,
    },
    Sum {
        int_acc: i64,
        float_acc: f64,
        count: i64,
        float: bool,
        expr: Evaluator,
    },
    Avg {
        sum: f64,
        count: i64,
        expr: Evaluator,
    },
    Extreme {
        best: Option<ScalarValue>,
        want_greater: bool,
        ty: DataType,
        expr: Evaluator,
    },
}

impl AggState {
    pub fn new(func: &AggFunc) -> AggState {
        match func {
            AggFunc::CountStar => AggState::Count {
                value: 0,
                expr: None,
            },
            AggFunc::Count(e) => AggState::Count {
                value: 0,
                expr: Some(e.clone()),
            },
            AggFunc::Sum(e) => AggState::Sum {
                int_acc: 0,
                float_acc: 0.0,
                count: 0,
                float: e.datatype() == DataType::Float,
                expr: e.clone(),
            },
            AggFunc::Avg(e) => AggState::Avg {
                sum: 0.0,
                count: 0,
                expr: e.clone(),
            },
            AggFunc::Min(e) => AggState::Extreme {
                best: None,
                want_greater: false,
                ty: e.datatype(),
                expr: e.clone(),
            },
            AggFunc::Max(e) => AggState::Extreme {
                best: None,
                want_greater: true,
                ty: e.datatype(),
                expr: e.clone(),
            },
        }
    }

    pub fn feed(&mut self, row: &Row, txn: &Transaction) -> Result<()> {
        match self {
            AggState::Count { value, expr } => match expr {
                None => *value += 1,
                Some(e) => {
                    if !e.eval(row, txn)?.is_null() {
                        *value += 1;
                    }
                }
            },
            AggState::Sum {
                int_acc,
                float_acc,
                count,
                float,
                expr,
            } => match expr.eval(row, txn)? {
                ScalarValue::Null => {}
                v => {
                    if *float {
                        *float_acc += numeric(&v)?;
                    } else {
                        *int_acc = int_acc
                            .checked_add(integral(&v)?)
                            .ok_or_else(|| DbError::new("bigint out of range"))?;
                    }
                    *count += 1;
                }
            },
            AggState::Avg { sum, count, expr } => match expr.eval(row, txn)? {
                ScalarValue::Null => {}
                v => {
                    *sum += numeric(&v)?;
                    *count += 1;
                }
            },
            AggState::Extreme {
                best,
                want_greater,
                ty,
                expr,
            } => {
                let v = expr.eval(row, txn)?;
                if v.is_null() {
                    return Ok(());
                }
                let better = match best {
                    None => true,
                    Some(current) => {
                        let ord = sql_cmp(ty, &v, current)?;
                        match ord {
                            Some(ord) if *want_greater => ord.is_gt(),
                            Some(ord) => ord.is_lt(),
                            None => false,
                        }
                    }
                };
                if better {
                    *best = Some(v);
                }
            }
        }
        Ok(())
    }

    pub fn finish(self) -> ScalarValue {
        match self {
            AggState::Count { value, .. } => ScalarValue::Int(value),
            AggState::Sum {
                int_acc,
                float_acc,
                count,
                float,
                ..
            } => {
                if count == 0 {
                    ScalarValue::Null
                } else if float {
                    ScalarValue::float(float_acc)
                } else {
                    ScalarValue::Int(int_acc)
                }
            }
            AggState::Avg { sum, count, .. } => {
                if count == 0 {
                    ScalarValue::Null
                } else {
                    ScalarValue::float(sum / count as f64)
                }
            }
            AggState::Extreme { best, .. } => best.unwrap_or(ScalarValue::Null),
        }
    }
}

fn numeric(v: &ScalarValue) -> Result<f64> {
    match v {
        ScalarValue::Int(i) => Ok(*i as f64),
        ScalarValue::Float(f) => Ok(f.0),
        other => Err(DbError::new(format!(
            "aggregate argument is not numeric: {other}"
        ))),
    }
}

fn integral(v: &ScalarValue) -> Result<i64> {
    match v {
        ScalarValue::Int(i) => Ok(*i),
        other => Err(DbError::new(format!(
            "aggregate argument is not an integer: {other}"
        ))),
    }
}

/// Group keys match an index on a bare scan and every aggregate is a bare
/// COUNT(*): answer from the index's key and count statistics without
/// touching a single row.
fn index_fast_path(
    input: &Selection,
    group_by: &[Evaluator],
    aggregates: &[AggregateExpr],
    txn: &Transaction,
) -> Option<RowIter> {
    if group_by.is_empty()
        || !matches!(input, Selection::Scan { .. })
        || !aggregates
            .iter()
            .all(|a| matches!(a.func, AggFunc::CountStar))
    {
        return None;
    }
    let index = input.index_matching(group_by)?;
    let keys = index.iterate_keys(txn)?;
    debug!(index = %index.name, "aggregate computed from index statistics");
    let txn = txn.clone();
    let n_aggs = aggregates.len();
    Some(Box::new(keys.map(move |key| {
        let count = index
            .stats(&txn, Some(&key))
            .map(|s| s.count as i64)
            .unwrap_or(0);
        let mut row: Row = key;
        row.extend(std::iter::repeat_n(ScalarValue::Int(count), n_aggs));
        Ok(Arc::new(row))
    })))
}

pub(crate) fn enumerate(
    input: &Arc<Selection>,
    group_by: &[Evaluator],
    aggregates: &[AggregateExpr],
    txn: &Transaction,
) -> RowIter {
    if let Some(fast) = index_fast_path(input, group_by, aggregates, txn) {
        return fast;
    }
    match compute_streaming(input, group_by, aggregates, txn) {
        Ok(rows) => Box::new(rows.into_iter().map(Ok)),
        Err(e) => Box::new(std::iter::once(Err(e))),
    }
}

/// Whether [`enumerate`] will answer from index statistics; explain reports
/// the same decision.
pub(crate) fn uses_index(
    input: &Selection,
    group_by: &[Evaluator],
    aggregates: &[AggregateExpr],
    txn: &Transaction,
) -> bool {
    index_fast_path(input, group_by, aggregates, txn).is_some()
}

fn compute_streaming(
    input: &Arc<Selection>,
    group_by: &[Evaluator],
    aggregates: &[AggregateExpr],
    txn: &Transaction,
) -> Result<Vec<Arc<Row>>> {
    let mut groups: HashMap<Vec<ScalarValue>, Vec<AggState>> = HashMap::new();
    // Output follows first appearance of each group.
    let mut order: Vec<Vec<ScalarValue>> = Vec::new();

    for r in input.enumerate(txn) {
        let row = r?;
        let key: Result<Vec<ScalarValue>> =
            group_by.iter().map(|e| e.eval(&row, txn)).collect();
        let key = key?;
        if !groups.contains_key(&key) {
            order.push(key.clone());
            groups.insert(
                key.clone(),
                aggregates.iter().map(|a| AggState::new(&a.func)).collect(),
            );
        }
        if let Some(states) = groups.get_mut(&key) {
            for state in states.iter_mut() {
                state.feed(&row, txn)?;
            }
        }
    }

    // A global aggregate over zero rows still produces one output row.
    if group_by.is_empty() && order.is_empty() {
        order.push(Vec::new());
        groups.insert(
            Vec::new(),
            aggregates.iter().map(|a| AggState::new(&a.func)).collect(),
        );
    }

    let mut out = Vec::with_capacity(order.len());
    for key in order {
        if let Some(states) = groups.remove(&key) {
            let mut row = key;
            row.extend(states.into_iter().map(AggState::finish));
            out.push(Arc::new(row));
        }
    }
    Ok(out)
}
