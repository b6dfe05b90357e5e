//! Enumeration strategy for filters and joins.
//!
//! Strategy selection is repeated per `enumerate` call against the current
//! snapshot, so a plan never outlives the statistics it was based on.

use std::sync::Arc;

use pgstub_error::Result;
use tracing::debug;

use super::{JoinKind, RowIter, Selection, keep};
use crate::expr::{CmpOp, Evaluator, LogicOp};
use crate::index::{IndexDef, IndexOp};
use crate::txn::{Row, Transaction};
use crate::types::ScalarValue;

/// A predicate conjunct matched against an index.
pub(crate) struct IndexMatch {
    pub index: IndexDef,
    pub op: IndexOp,
}

pub(crate) enum FilterStrategy {
    /// One indexed conjunct drives; every conjunct is re-checked.
    IndexDriven(IndexMatch),
    /// Top-level OR: enumerate each arm, skipping rows an earlier arm
    /// already emitted.
    Disjunction(Vec<Evaluator>),
    SeqScan,
}

pub(crate) fn plan_filter(
    input: &Selection,
    predicate: &Evaluator,
    txn: &Transaction,
) -> FilterStrategy {
    if let Evaluator::Logical {
        op: LogicOp::Or,
        inputs,
    } = predicate
    {
        return FilterStrategy::Disjunction(inputs.clone());
    }

    let mut best: Option<(IndexMatch, f64)> = None;
    for conjunct in predicate.conjuncts() {
        if let Some(m) = match_conjunct(input, conjunct, txn) {
            let entropy = m.index.entropy(&m.op, txn);
            if best.as_ref().is_none_or(|(_, b)| entropy < *b) {
                best = Some((m, entropy));
            }
        }
    }
    match best {
        Some((m, entropy)) => {
            debug!(index = %m.index.name, entropy, "filter drives through index");
            FilterStrategy::IndexDriven(m)
        }
        None => FilterStrategy::SeqScan,
    }
}

/// Match one conjunct against the input's indexes: a comparison or IN list
/// over an indexed expression, with the other side constant.
fn match_conjunct(
    input: &Selection,
    conjunct: &Evaluator,
    txn: &Transaction,
) -> Option<IndexMatch> {
    match conjunct {
        Evaluator::Comparison { op, left, right } => {
            match_comparison(input, *op, left, right, txn)
                .or_else(|| match_comparison(input, op.flip(), right, left, txn))
        }
        Evaluator::InList {
            expr,
            list,
            negated,
        } => {
            let index = input.index_matching(std::slice::from_ref(expr.as_ref()))?;
            let keys: Option<Vec<Vec<ScalarValue>>> = list
                .iter()
                .map(|e| constant_value(e, txn).map(|v| vec![v]))
                .collect();
            let keys = keys?;
            let op = if *negated {
                IndexOp::Nin(keys)
            } else {
                IndexOp::Inside(keys)
            };
            Some(IndexMatch { index, op })
        }
        _ => None,
    }
}

fn match_comparison(
    input: &Selection,
    op: CmpOp,
    key_side: &Evaluator,
    const_side: &Evaluator,
    txn: &Transaction,
) -> Option<IndexMatch> {
    let index = input.index_matching(std::slice::from_ref(key_side))?;
    let key = vec![constant_value(const_side, txn)?];
    let op = match op {
        CmpOp::Eq => IndexOp::Eq(key),
        CmpOp::NotEq => IndexOp::Neq(key),
        CmpOp::Lt => IndexOp::Lt(key),
        CmpOp::LtEq => IndexOp::Le(key),
        CmpOp::Gt => IndexOp::Gt(key),
        CmpOp::GtEq => IndexOp::Ge(key),
    };
    Some(IndexMatch { index, op })
}

fn constant_value(expr: &Evaluator, txn: &Transaction) -> Option<ScalarValue> {
    if !expr.is_constant() {
        return None;
    }
    expr.eval(&Vec::new(), txn).ok()
}

pub(crate) fn filter_entropy(input: &Selection, predicate: &Evaluator, txn: &Transaction) -> f64 {
    match plan_filter(input, predicate, txn) {
        FilterStrategy::IndexDriven(m) => m.index.entropy(&m.op, txn),
        FilterStrategy::Disjunction(disjuncts) => disjuncts
            .iter()
            .map(|d| filter_entropy(input, d, txn))
            .sum(),
        FilterStrategy::SeqScan => input.entropy(txn),
    }
}

pub(crate) fn enumerate_filter(
    input: &Arc<Selection>,
    predicate: &Evaluator,
    txn: &Transaction,
) -> RowIter {
    match plan_filter(input, predicate, txn) {
        FilterStrategy::IndexDriven(m) => {
            let conjuncts: Vec<Evaluator> =
                predicate.conjuncts().into_iter().cloned().collect();
            let txn2 = txn.clone();
            Box::new(
                input
                    .enumerate_keyed(&m.index, m.op, txn)
                    .filter_map(move |r| apply_conjuncts(r, &conjuncts, &txn2)),
            )
        }
        FilterStrategy::Disjunction(disjuncts) => {
            // Each arm emits the rows it matches minus those an earlier arm
            // matched, so a row satisfying several arms appears once while
            // distinct value-identical rows all survive.
            let mut arms: Vec<RowIter> = Vec::with_capacity(disjuncts.len());
            for (i, d) in disjuncts.iter().enumerate() {
                let earlier: Vec<Evaluator> = disjuncts[..i].to_vec();
                let txn2 = txn.clone();
                arms.push(Box::new(enumerate_filter(input, d, txn).filter_map(
                    move |r| {
                        let row = match r {
                            Ok(row) => row,
                            Err(e) => return Some(Err(e)),
                        };
                        for prev in &earlier {
                            match keep(&row, prev, &txn2) {
                                Err(e) => return Some(Err(e)),
                                Ok(true) => return None,
                                Ok(false) => {}
                            }
                        }
                        Some(Ok(row))
                    },
                )));
            }
            Box::new(arms.into_iter().flatten())
        }
        FilterStrategy::SeqScan => {
            let conjuncts = vec![predicate.clone()];
            let txn2 = txn.clone();
            Box::new(
                input
                    .enumerate(txn)
                    .filter_map(move |r| apply_conjuncts(r, &conjuncts, &txn2)),
            )
        }
    }
}

fn apply_conjuncts(
    r: Result<Arc<Row>>,
    conjuncts: &[Evaluator],
    txn: &Transaction,
) -> Option<Result<Arc<Row>>> {
    let row = match r {
        Ok(row) => row,
        Err(e) => return Some(Err(e)),
    };
    for conjunct in conjuncts {
        match keep(&row, conjunct, txn) {
            Err(e) => return Some(Err(e)),
            Ok(false) => return None,
            Ok(true) => {}
        }
    }
    Some(Ok(row))
}

/// How a join will execute: which side drives, and whether the probe goes
/// through an index.
pub(crate) struct JoinPlan {
    pub restrictive_left: bool,
    pub probe: Option<ProbeIndex>,
}

pub(crate) struct ProbeIndex {
    pub index: IndexDef,
    /// Key expression in the restrictive side's own row layout.
    pub restrictive_key: Evaluator,
}

pub(crate) fn plan_join(
    kind: JoinKind,
    left: &Selection,
    right: &Selection,
    on: &Evaluator,
    txn: &Transaction,
) -> JoinPlan {
    // Outer joins must drive from the side whose rows always appear; inner
    // joins drive from whichever side is expected to be smaller.
    let restrictive_left = match kind {
        JoinKind::Left | JoinKind::Full => true,
        JoinKind::Right => false,
        JoinKind::Inner => left.entropy(txn) <= right.entropy(txn),
    };
    let left_len = left.columns().len();
    let probe_side = if restrictive_left { right } else { left };

    let mut probe = None;
    'conjuncts: for conjunct in on.conjuncts() {
        let Evaluator::Comparison {
            op: CmpOp::Eq,
            left: a,
            right: b,
        } = conjunct
        else {
            continue;
        };
        for (r_expr, p_expr) in [(a, b), (b, a)] {
            let split = if restrictive_left {
                let within_left = r_expr
                    .max_column_index()
                    .is_none_or(|m| m < left_len);
                within_left
                    .then(|| p_expr.unshift_columns(left_len))
                    .flatten()
                    .map(|p| ((**r_expr).clone(), p))
            } else {
                let within_left = p_expr
                    .max_column_index()
                    .is_none_or(|m| m < left_len);
                within_left
                    .then(|| r_expr.unshift_columns(left_len))
                    .flatten()
                    .map(|r| (r, (**p_expr).clone()))
            };
            let Some((restrictive_key, probe_local)) = split else {
                continue;
            };
            if let Some(index) =
                probe_side.index_matching(std::slice::from_ref(&probe_local))
            {
                debug!(index = %index.name, "join probes through index");
                probe = Some(ProbeIndex {
                    index,
                    restrictive_key,
                });
                break 'conjuncts;
            }
        }
    }

    JoinPlan {
        restrictive_left,
        probe,
    }
}

pub(crate) fn join_entropy(
    kind: JoinKind,
    left: &Selection,
    right: &Selection,
    on: &Evaluator,
    txn: &Transaction,
) -> f64 {
    let plan = plan_join(kind, left, right, on, txn);
    let (restrictive, probe) = if plan.restrictive_left {
        (left, right)
    } else {
        (right, left)
    };
    let r = restrictive.entropy(txn);
    match plan.probe {
        Some(_) => r,
        None => r * probe.entropy(txn).max(1.0),
    }
}

pub(crate) fn enumerate_join(
    kind: JoinKind,
    left: &Arc<Selection>,
    right: &Arc<Selection>,
    on: &Evaluator,
    txn: &Transaction,
) -> RowIter {
    let plan = plan_join(kind, left, right, on, txn);
    let left_len = left.columns().len();
    let right_len = right.columns().len();
    let restrictive_left = plan.restrictive_left;

    let restrictive = if restrictive_left { left } else { right };
    let probe_sel = if restrictive_left {
        right.clone()
    } else {
        left.clone()
    };
    let probe_len = if restrictive_left { right_len } else { left_len };
    let outer = !matches!(kind, JoinKind::Inner);
    let probe = plan.probe;
    let on_owned = on.clone();
    let txn2 = txn.clone();

    let main = restrictive
        .enumerate(txn)
        .flat_map(move |r| -> Vec<Result<Arc<Row>>> {
            let r_row = match r {
                Ok(row) => row,
                Err(e) => return vec![Err(e)],
            };

            let candidates: RowIter = match &probe {
                Some(p) => match p.restrictive_key.eval(&r_row, &txn2) {
                    Err(e) => return vec![Err(e)],
                    // A null key never joins.
                    Ok(v) if v.is_null() => Box::new(std::iter::empty()),
                    Ok(v) => {
                        probe_sel.enumerate_keyed(&p.index, IndexOp::Eq(vec![v]), &txn2)
                    }
                },
                None => probe_sel.enumerate(&txn2),
            };

            let mut out = Vec::new();
            for candidate in candidates {
                let p_row = match candidate {
                    Ok(row) => row,
                    Err(e) => {
                        out.push(Err(e));
                        continue;
                    }
                };
                let combined = if restrictive_left {
                    concat(&r_row, &p_row)
                } else {
                    concat(&p_row, &r_row)
                };
                match keep(&combined, &on_owned, &txn2) {
                    Err(e) => out.push(Err(e)),
                    Ok(true) => out.push(Ok(Arc::new(combined))),
                    Ok(false) => {}
                }
            }
            if out.is_empty() && outer {
                let nulls = vec![ScalarValue::Null; probe_len];
                let combined = if restrictive_left {
                    concat(&r_row, &nulls)
                } else {
                    concat(&nulls, &r_row)
                };
                out.push(Ok(Arc::new(combined)));
            }
            out
        });

    if kind != JoinKind::Full {
        return Box::new(main);
    }

    // Full join: a second pass emits the right rows no left row matched.
    let left2 = left.clone();
    let on2 = on.clone();
    let txn3 = txn.clone();
    let unmatched = right.enumerate(txn).filter_map(move |r| {
        let r_row = match r {
            Ok(row) => row,
            Err(e) => return Some(Err(e)),
        };
        for l in left2.enumerate(&txn3) {
            let l_row = match l {
                Ok(row) => row,
                Err(e) => return Some(Err(e)),
            };
            let combined = concat(&l_row, &r_row);
            match keep(&combined, &on2, &txn3) {
                Err(e) => return Some(Err(e)),
                Ok(true) => return None,
                Ok(false) => {}
            }
        }
        let mut combined = vec![ScalarValue::Null; left_len];
        combined.extend(r_row.iter().cloned());
        Some(Ok(Arc::new(combined)))
    });
    Box::new(main.chain(unmatched))
}

fn concat(a: &[ScalarValue], b: &[ScalarValue]) -> Row {
    a.iter().chain(b).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::expr::{column, eq, lit, or};
    use crate::index::index_insert;
    use crate::txn::{IndexData, TableData};
    use crate::types::DataType;

    fn int(v: i64) -> ScalarValue {
        ScalarValue::Int(v)
    }

    /// Two tables: users(id, name) with a unique id index, and
    /// orders(user_id, total) with a plain user_id index.
    fn setup() -> (Arc<Selection>, Arc<Selection>, Transaction) {
        let users_pk = IndexDef {
            id: 1,
            name: "users_pkey".to_string(),
            table_id: 1,
            exprs: vec![column(0, "id", DataType::Int)],
            unique: true,
        };
        let orders_idx = IndexDef {
            id: 1,
            name: "orders_user_id_idx".to_string(),
            table_id: 2,
            exprs: vec![column(0, "user_id", DataType::Int)],
            unique: false,
        };

        let txn = Transaction::root();
        let mut load = |table_id,
                        def: &IndexDef,
                        rows: Vec<Vec<ScalarValue>>,
                        txn: &Transaction| {
            let mut data = TableData::default();
            let mut index = IndexData::default();
            for row in rows {
                let row_id = data.next_row_id;
                data.next_row_id += 1;
                let arc = Arc::new(row);
                index = index_insert(
                    def,
                    &index,
                    def.key_for_row(&arc, txn).unwrap(),
                    row_id,
                )
                .unwrap();
                data.rows = data.rows.insert(row_id, arc);
            }
            data.indexes = data.indexes.insert(def.id, index);
            txn.with_table_data(table_id, data)
        };

        let txn = load(
            1,
            &users_pk,
            vec![
                vec![int(1), ScalarValue::text("ann")],
                vec![int(2), ScalarValue::text("bob")],
            ],
            &txn,
        );
        let txn = load(
            2,
            &orders_idx,
            vec![
                vec![int(1), int(100)],
                vec![int(1), int(150)],
                vec![int(3), int(700)],
            ],
            &txn,
        );

        let users = Selection::scan(
            1,
            "users",
            vec![
                ("id".to_string(), DataType::Int),
                ("name".to_string(), DataType::TEXT),
            ],
            vec![users_pk],
        );
        let orders = Selection::scan(
            2,
            "orders",
            vec![
                ("user_id".to_string(), DataType::Int),
                ("total".to_string(), DataType::Int),
            ],
            vec![orders_idx],
        );
        (Arc::new(users), Arc::new(orders), txn)
    }

    fn join_on(left: &Arc<Selection>, right: &Arc<Selection>) -> Evaluator {
        // users.id = orders.user_id in the combined layout.
        let left_len = left.columns().len();
        eq(
            column(0, "id", DataType::Int),
            column(left_len, "user_id", DataType::Int),
        )
        .unwrap()
    }

    fn rows_of(sel: &Selection, txn: &Transaction) -> Vec<Row> {
        sel.enumerate(txn).map(|r| (*r.unwrap()).clone()).collect()
    }

    #[test]
    fn inner_join_probes_index() {
        let (users, orders, txn) = setup();
        let on = join_on(&users, &orders);
        let join =
            Selection::join(JoinKind::Inner, users.clone(), orders.clone(), on.clone())
                .unwrap();

        let mut rows = rows_of(&join, &txn);
        rows.sort();
        assert_eq!(2, rows.len());
        assert_eq!(int(100), rows[0][3]);
        assert_eq!(int(150), rows[1][3]);

        // Users (2 rows) drives against orders (3 rows) via its index.
        let plan = plan_join(JoinKind::Inner, &users, &orders, &on, &txn);
        assert!(plan.restrictive_left);
        assert!(plan.probe.is_some());
    }

    #[test]
    fn left_join_null_extends() {
        let (users, orders, txn) = setup();
        let on = join_on(&users, &orders);
        let join = Selection::join(JoinKind::Left, users, orders, on).unwrap();

        let mut rows = rows_of(&join, &txn);
        rows.sort();
        assert_eq!(3, rows.len());
        // Bob has no orders; his probe columns are null.
        let bob: Vec<&Row> = rows.iter().filter(|r| r[0] == int(2)).collect();
        assert_eq!(1, bob.len());
        assert_eq!(ScalarValue::Null, bob[0][2]);
        assert_eq!(ScalarValue::Null, bob[0][3]);
    }

    #[test]
    fn right_join_drives_from_right() {
        let (users, orders, txn) = setup();
        let on = join_on(&users, &orders);
        let plan = plan_join(JoinKind::Right, &users, &orders, &on, &txn);
        assert!(!plan.restrictive_left);

        let join = Selection::join(JoinKind::Right, users, orders, on).unwrap();
        let rows = rows_of(&join, &txn);
        // All three orders appear; the one for user 3 gets null users.
        assert_eq!(3, rows.len());
        let orphan: Vec<&Row> = rows.iter().filter(|r| r[2] == int(3)).collect();
        assert_eq!(ScalarValue::Null, orphan[0][0]);
    }

    #[test]
    fn full_join_emits_both_unmatched_sides() {
        let (users, orders, txn) = setup();
        let on = join_on(&users, &orders);
        let join = Selection::join(JoinKind::Full, users, orders, on).unwrap();

        let rows = rows_of(&join, &txn);
        // ann x2, bob null-extended, order for user 3 null-extended.
        assert_eq!(4, rows.len());
        assert!(rows.iter().any(|r| r[0] == int(2) && r[2].is_null()));
        assert!(rows.iter().any(|r| r[0].is_null() && r[2] == int(3)));
    }

    #[test]
    fn or_filter_keeps_value_identical_rows() {
        // A table with no unique index may legally hold identical rows;
        // an OR filter must return the same multiset a single-pass
        // predicate evaluation would.
        let txn = Transaction::root();
        let mut data = TableData::default();
        for _ in 0..2 {
            let row_id = data.next_row_id;
            data.next_row_id += 1;
            data.rows = data.rows.insert(row_id, Arc::new(vec![int(1)]));
        }
        let txn = txn.with_table_data(5, data);
        let scan = Arc::new(Selection::scan(
            5,
            "bag",
            vec![("id".to_string(), DataType::Int)],
            Vec::new(),
        ));

        let id = column(0, "id", DataType::Int);
        let plain =
            Selection::filter(scan.clone(), eq(id.clone(), lit(1_i64)).unwrap()).unwrap();
        let either = Selection::filter(
            scan,
            or(vec![
                eq(id.clone(), lit(1_i64)).unwrap(),
                eq(id, lit(2_i64)).unwrap(),
            ]),
        )
        .unwrap();

        assert_eq!(2, plain.enumerate(&txn).count());
        assert_eq!(2, either.enumerate(&txn).count());
    }

    #[test]
    fn join_without_index_still_joins() {
        let (users, orders, txn) = setup();
        // Join on a non-indexed pairing: users.id = orders.total / nothing
        // indexed on total, so the plan has no probe index.
        let on = eq(
            column(1, "name", DataType::TEXT),
            column(3, "total", DataType::Int).cast(DataType::TEXT).unwrap(),
        );
        // Text/int unify only through the explicit cast above.
        let on = on.unwrap();
        let plan = plan_join(JoinKind::Inner, &users, &orders, &on, &txn);
        assert!(plan.probe.is_none());

        let join = Selection::join(JoinKind::Inner, users, orders, on).unwrap();
        assert!(rows_of(&join, &txn).is_empty());
    }
}
