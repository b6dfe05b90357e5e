//! Explain introspection for selections.
//!
//! `explain` runs the same planning the enumerator would and reports the
//! decisions as a serializable tree, so tests and users can assert on the
//! chosen strategy without tracing enumeration.

use std::collections::BTreeMap;
use std::fmt;

use serde::Serialize;

use super::plan::{self, FilterStrategy};
use super::{Selection, aggregate};
use crate::txn::Transaction;

#[derive(Debug, Clone, Serialize)]
pub struct ExplainEntry {
    pub name: String,
    pub items: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ExplainNode {
    pub entry: ExplainEntry,
    pub children: Vec<ExplainNode>,
}

pub struct EntryBuilder {
    name: String,
    items: BTreeMap<String, String>,
}

impl EntryBuilder {
    pub fn new(name: impl Into<String>) -> Self {
        EntryBuilder {
            name: name.into(),
            items: BTreeMap::new(),
        }
    }

    pub fn item(mut self, key: impl Into<String>, value: impl fmt::Display) -> Self {
        self.items.insert(key.into(), value.to_string());
        self
    }

    pub fn build(self, children: Vec<ExplainNode>) -> ExplainNode {
        ExplainNode {
            entry: ExplainEntry {
                name: self.name,
                items: self.items,
            },
            children,
        }
    }
}

impl Selection {
    pub fn explain(&self, txn: &Transaction) -> ExplainNode {
        match self {
            Selection::Scan { name, .. } => EntryBuilder::new("scan")
                .item("table", name)
                .item("rows", self.entropy(txn))
                .build(Vec::new()),
            Selection::Filter { input, predicate } => {
                let builder = EntryBuilder::new("filter").item("predicate", predicate);
                let builder = match plan::plan_filter(input, predicate, txn) {
                    FilterStrategy::IndexDriven(m) => {
                        // A single conjunct is answered by the index alone;
                        // more means the index narrows and the rest re-check.
                        let strategy = if predicate.conjuncts().len() > 1 {
                            "index-restricted"
                        } else {
                            "index-lookup"
                        };
                        builder
                            .item("strategy", strategy)
                            .item("index", &m.index.name)
                            .item("op", &m.op)
                    }
                    FilterStrategy::Disjunction(_) => builder.item("strategy", "or-union"),
                    FilterStrategy::SeqScan => builder.item("strategy", "seq-scan"),
                };
                builder
                    .item("entropy", self.entropy(txn))
                    .build(vec![input.explain(txn)])
            }
            Selection::Alias { input, name, .. } => EntryBuilder::new("alias")
                .item("as", name)
                .build(vec![input.explain(txn)]),
            Selection::Join {
                kind,
                left,
                right,
                on,
                ..
            } => {
                let p = plan::plan_join(*kind, left, right, on, txn);
                EntryBuilder::new("join")
                    .item("type", kind.as_str())
                    .item("on", on)
                    .item(
                        "restrictive",
                        if p.restrictive_left { "left" } else { "right" },
                    )
                    .item(
                        "strategy",
                        match &p.probe {
                            Some(_) => "index-lookup",
                            None => "catastrophic",
                        },
                    )
                    .build(vec![left.explain(txn), right.explain(txn)])
            }
            Selection::Project { input, columns, .. } => {
                let names: Vec<&str> =
                    columns.iter().map(|c| c.name.as_str()).collect();
                EntryBuilder::new("project")
                    .item("columns", names.join(", "))
                    .build(vec![input.explain(txn)])
            }
            Selection::OrderBy { input, keys } => {
                let keys: Vec<String> = keys
                    .iter()
                    .map(|k| {
                        let dir = if k.descending { " desc" } else { "" };
                        format!("{}{dir}", k.expr)
                    })
                    .collect();
                EntryBuilder::new("order-by")
                    .item("keys", keys.join(", "))
                    .build(vec![input.explain(txn)])
            }
            Selection::Limit {
                input,
                limit,
                offset,
            } => {
                let builder = EntryBuilder::new("limit").item("offset", offset);
                let builder = match limit {
                    Some(n) => builder.item("limit", n),
                    None => builder,
                };
                builder.build(vec![input.explain(txn)])
            }
            Selection::Distinct { input, key } => {
                let builder = EntryBuilder::new("distinct");
                let indexed = key.as_ref().is_some_and(|exprs| {
                    matches!(input.as_ref(), Selection::Scan { .. })
                        && input.index_matching(exprs).is_some()
                });
                builder
                    .item(
                        "strategy",
                        if indexed { "index-keys" } else { "streaming" },
                    )
                    .build(vec![input.explain(txn)])
            }
            Selection::Union { left, right } => EntryBuilder::new("union")
                .build(vec![left.explain(txn), right.explain(txn)]),
            Selection::Aggregate {
                input,
                group_by,
                aggregates,
                ..
            } => {
                let keys: Vec<String> = group_by.iter().map(|e| e.to_string()).collect();
                let strategy = if aggregate::uses_index(input, group_by, aggregates, txn) {
                    "index-stats"
                } else {
                    "streaming"
                };
                EntryBuilder::new("aggregate")
                    .item("group-by", keys.join(", "))
                    .item("strategy", strategy)
                    .build(vec![input.explain(txn)])
            }
            Selection::Values { rows, .. } => EntryBuilder::new("values")
                .item("rows", rows.len())
                .build(Vec::new()),
        }
    }
}
