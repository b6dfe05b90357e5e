//! End-to-end behavior through the public API.

use std::sync::Arc;

use chrono::NaiveDate;
use pgstub_core::catalog::Schema;
use pgstub_core::engine::Session;
use pgstub_core::expr::{self, CmpOp, Evaluator};
use pgstub_core::select::{JoinKind, Selection, SortKey};
use pgstub_core::table::ColumnDef;
use pgstub_core::txn::Transaction;
use pgstub_core::types::cast::cast_value;
use pgstub_core::types::{DataType, ScalarValue};

fn int(v: i64) -> ScalarValue {
    ScalarValue::Int(v)
}

fn text(v: &str) -> ScalarValue {
    ScalarValue::text(v)
}

fn session_with_items() -> Session {
    let mut session = Session::new();
    session
        .ddl(|schema, txn| {
            schema.create_table(
                "items",
                vec![
                    ColumnDef::new("id", DataType::Int),
                    ColumnDef::new("label", DataType::TEXT),
                ],
                Some(&["id"]),
            )?;
            Ok((txn, ()))
        })
        .unwrap();
    session
}

fn insert_item(session: &mut Session, id: i64, label: &str) -> pgstub_core::Result<()> {
    let label = label.to_string();
    session.mutate(move |schema, txn| {
        let table = schema.table("items")?;
        let (txn, _) = table.insert(txn, vec![int(id), ScalarValue::Text(label)])?;
        Ok((txn, ()))
    })
}

fn label_of(session: &mut Session, id: i64) -> Option<String> {
    let scan = Arc::new(session.schema().table("items").ok()?.selection());
    let filter = Selection::filter(
        scan.clone(),
        expr::eq(scan.column_ref(None, "id").ok()?, expr::lit(id)).ok()?,
    )
    .ok()?;
    let result = session.query(&filter).ok()?;
    match result.rows.first()?.get(1)? {
        ScalarValue::Text(s) => Some(s.clone()),
        _ => None,
    }
}

#[test]
fn rollback_restores_the_previous_value() {
    let mut session = session_with_items();
    insert_item(&mut session, 1, "a").unwrap();

    session.begin();
    session
        .mutate(|schema, txn| {
            let table = schema.table("items")?;
            let row_id = table
                .row_id_of(&vec![int(1), text("a")], &txn)
                .ok_or_else(|| pgstub_core::DbError::new("row not found"))?;
            let (txn, _) = table.update(txn, row_id, vec![int(1), text("b")])?;
            Ok((txn, ()))
        })
        .unwrap();
    assert_eq!(Some("b".to_string()), label_of(&mut session, 1));

    session.rollback();
    assert_eq!(Some("a".to_string()), label_of(&mut session, 1));
}

#[test]
fn in_list_with_order_by() {
    let mut session = session_with_items();
    for (id, label) in [(3, "c"), (1, "a"), (4, "d"), (2, "b")] {
        insert_item(&mut session, id, label).unwrap();
    }

    let scan = Arc::new(session.schema().table("items").unwrap().selection());
    let id = scan.column_ref(None, "id").unwrap();
    let filter = Selection::filter(
        scan.clone(),
        Evaluator::in_list(
            id.clone(),
            vec![expr::lit(4_i64), expr::lit(1_i64), expr::lit(3_i64)],
            false,
        )
        .unwrap(),
    )
    .unwrap();
    let sorted = Selection::order_by(
        Arc::new(filter),
        vec![SortKey {
            expr: id,
            descending: true,
        }],
    )
    .unwrap();

    let result = session.query(&sorted).unwrap();
    let ids: Vec<ScalarValue> = result.rows.iter().map(|r| r[0].clone()).collect();
    assert_eq!(vec![int(4), int(3), int(1)], ids);
}

#[test]
fn casting_a_date_to_timestamp_yields_midnight() {
    let e = expr::lit("2024-03-05")
        .cast(DataType::Date)
        .unwrap()
        .cast(DataType::Timestamp)
        .unwrap();
    let value = e.eval(&Vec::new(), &Transaction::root()).unwrap();

    let expected = NaiveDate::from_ymd_opt(2024, 3, 5)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap();
    assert_eq!(ScalarValue::Timestamp(expected), value);
}

#[test]
fn comparing_with_null_is_unknown_not_false() {
    let txn = Transaction::root();
    let cmp = expr::eq(expr::lit(1_i64), expr::null_lit()).unwrap();
    assert_eq!(ScalarValue::Null, cmp.eval(&Vec::new(), &txn).unwrap());

    let is_null = Evaluator::IsNull {
        input: Box::new(cmp),
        negated: false,
    };
    assert_eq!(
        ScalarValue::Bool(true),
        is_null.eval(&Vec::new(), &txn).unwrap()
    );
}

#[test]
fn unique_violation_rolls_back_the_whole_statement() {
    let mut session = session_with_items();
    insert_item(&mut session, 5, "existing").unwrap();

    // One statement inserting two rows; the second hits the unique index.
    let err = session
        .mutate(|schema, txn| {
            let table = schema.table("items")?;
            let (txn, _) = table.insert(txn, vec![int(6), text("fine")])?;
            let (txn, _) = table.insert(txn, vec![int(5), text("duplicate")])?;
            Ok((txn, ()))
        })
        .unwrap_err();
    assert_eq!(pgstub_core::ErrorKind::Constraint, err.kind());

    // Neither row of the failed statement is visible.
    assert_eq!(None, label_of(&mut session, 6));
    assert_eq!(Some("existing".to_string()), label_of(&mut session, 5));
}

#[test]
fn left_join_null_extends_and_probes_through_the_index() {
    let mut session = Session::new();
    session
        .ddl(|schema, txn| {
            schema.create_table(
                "users",
                vec![
                    ColumnDef::new("id", DataType::Int),
                    ColumnDef::new("name", DataType::TEXT),
                ],
                Some(&["id"]),
            )?;
            schema.create_table(
                "orders",
                vec![
                    ColumnDef::new("user_id", DataType::Int),
                    ColumnDef::new("total", DataType::Int),
                ],
                None,
            )?;
            let txn = schema.create_index(txn, "orders", "orders_user_id_idx", &["user_id"], false)?;
            Ok((txn, ()))
        })
        .unwrap();

    session
        .mutate(|schema, txn| {
            let users = schema.table("users")?;
            let (txn, _) = users.insert(txn, vec![int(1), text("ann")])?;
            let (txn, _) = users.insert(txn, vec![int(2), text("bob")])?;
            let orders = schema.table("orders")?;
            let (txn, _) = orders.insert(txn, vec![int(1), int(100)])?;
            Ok((txn, ()))
        })
        .unwrap();

    let users = Arc::new(session.schema().table("users").unwrap().selection());
    let orders = Arc::new(session.schema().table("orders").unwrap().selection());
    let on = expr::eq(
        users.column_ref(None, "id").unwrap(),
        orders.column_ref(None, "user_id").unwrap().shift_columns(2),
    )
    .unwrap();
    let join = Selection::join(JoinKind::Left, users, orders, on).unwrap();

    let node = join.explain(session.transaction());
    assert_eq!("left", node.entry.items["type"]);
    assert_eq!("left", node.entry.items["restrictive"]);
    assert_eq!("index-lookup", node.entry.items["strategy"]);

    let result = session.query(&join).unwrap();
    assert_eq!(2, result.row_count);
    let bob: Vec<&Vec<ScalarValue>> = result
        .rows
        .iter()
        .filter(|r| r[0] == int(2))
        .collect();
    assert_eq!(1, bob.len());
    assert_eq!(ScalarValue::Null, bob[0][2]);
    assert_eq!(ScalarValue::Null, bob[0][3]);
}

#[test]
fn index_and_seq_scan_agree() {
    let mut session = session_with_items();
    for id in 0..20 {
        insert_item(&mut session, id, &format!("label-{id}")).unwrap();
    }

    let table = session.schema().table("items").unwrap();
    let indexed = Arc::new(table.selection());
    // The same relation without its indexes can only seq-scan.
    let bare = Arc::new(Selection::scan(
        table.id,
        table.name.clone(),
        table
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.datatype.clone()))
            .collect(),
        Vec::new(),
    ));

    for (sel, expect_strategy) in [(&indexed, "index-lookup"), (&bare, "seq-scan")] {
        let pred = Evaluator::compare(
            CmpOp::GtEq,
            sel.column_ref(None, "id").unwrap(),
            expr::lit(15_i64),
        )
        .unwrap();
        let filter = Selection::filter(Arc::clone(sel), pred).unwrap();
        assert_eq!(
            *expect_strategy,
            filter.explain(session.transaction()).entry.items["strategy"]
        );

        let mut ids: Vec<ScalarValue> = session
            .query(&filter)
            .unwrap()
            .rows
            .into_iter()
            .map(|r| r[0].clone())
            .collect();
        ids.sort();
        assert_eq!(
            vec![int(15), int(16), int(17), int(18), int(19)],
            ids
        );
    }
}

#[test]
fn casts_round_trip_through_text() {
    let samples = [
        (DataType::Int, int(42)),
        (DataType::Float, ScalarValue::float(2.5)),
        (DataType::Bool, ScalarValue::Bool(true)),
        (
            DataType::Date,
            ScalarValue::Date(NaiveDate::from_ymd_opt(2021, 12, 31).unwrap()),
        ),
    ];
    for (ty, value) in samples {
        let rendered = cast_value(&ty, &value, &DataType::TEXT).unwrap();
        let back = cast_value(&DataType::TEXT, &rendered, &ty).unwrap();
        assert_eq!(value, back, "round trip through text for {ty}");
    }
}

#[test]
fn schema_is_shared_state_but_rows_are_not() {
    // Two sessions over distinct schemas do not see each other at all;
    // snapshots only fork within one engine.
    let mut a = session_with_items();
    let mut b = session_with_items();
    insert_item(&mut a, 1, "a-only").unwrap();
    assert_eq!(None, label_of(&mut b, 1));
    drop(a);

    // A schema can still be inspected independently of any session.
    let schema = Schema::new("scratch");
    assert!(schema.table("items").is_err());
}
