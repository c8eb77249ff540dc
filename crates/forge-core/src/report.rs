// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Profile report sink.
//!
//! Serialises the database into the JSON schema the external viewer
//! consumes. The schema is load-bearing: `built == 0` means "executed in
//! the most recent run" (counters descend with age), and every index in
//! `depends` is strictly less than the record's own index. Records are
//! therefore emitted in a stable topological order (DFS from each entry in
//! id order), not raw insertion order, since rebuilds can point an old
//! entry at a newer dependency.

use std::path::Path;

use serde::Serialize;

use crate::db::{Database, TraceSpan};
use crate::error::EngineError;

/// One record of the viewer schema.
#[derive(Serialize)]
struct ReportEntry<'a> {
    name: &'a str,
    built: u32,
    changed: u32,
    depends: Vec<usize>,
    execution: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    traces: Option<&'a [TraceSpan]>,
}

/// Renders the report JSON.
pub(crate) fn render(db: &Database) -> Result<String, EngineError> {
    let entries = db.entries();
    let order = topo_order(db);
    let mut position = vec![0usize; entries.len()];
    for (at, &id) in order.iter().enumerate() {
        position[id] = at;
    }

    let run = db.run();
    let records: Vec<ReportEntry<'_>> = order
        .iter()
        .map(|&id| {
            let entry = &entries[id];
            ReportEntry {
                name: entry.key.text(),
                built: run - entry.built,
                changed: run - entry.changed,
                depends: entry.flat_deps().map(|dep| position[dep.index()]).collect(),
                execution: entry.execution,
                traces: if entry.traces.is_empty() {
                    None
                } else {
                    Some(&entry.traces)
                },
            }
        })
        .collect();

    serde_json::to_string(&records)
        .map_err(|_| EngineError::Internal("profile report serialisation failed"))
}

/// Writes the report JSON to `path`.
pub(crate) fn write(db: &Database, path: &Path) -> Result<(), EngineError> {
    let json = render(db)?;
    std::fs::write(path, json)
        .map_err(|err| EngineError::user(format!("cannot write report {}: {err}", path.display())))
}

/// Stable dependency-first ordering: iterative DFS from each entry in id
/// order, emitting post-order. The database is acyclic, so every
/// dependency lands before its dependents.
fn topo_order(db: &Database) -> Vec<usize> {
    let entries = db.entries();
    let flat: Vec<Vec<usize>> = entries
        .iter()
        .map(|e| e.flat_deps().map(|id| id.index()).collect())
        .collect();
    let mut emitted = vec![false; entries.len()];
    let mut order = Vec::with_capacity(entries.len());
    for root in 0..entries.len() {
        if emitted[root] {
            continue;
        }
        let mut stack: Vec<(usize, usize)> = vec![(root, 0)];
        while let Some(&mut (node, ref mut next)) = stack.last_mut() {
            if *next < flat[node].len() {
                let dep = flat[node][*next];
                *next += 1;
                if !emitted[dep] && !stack.iter().any(|&(n, _)| n == dep) {
                    stack.push((dep, 0));
                }
            } else {
                if !emitted[node] {
                    emitted[node] = true;
                    order.push(node);
                }
                stack.pop();
            }
        }
    }
    order
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::db::Database;
    use crate::ident::make_type_tag;
    use crate::key::{Key, Value};

    #[test]
    fn depends_indices_precede_their_record() {
        let mut db = Database::fresh();
        let tag = make_type_tag("file");
        // Record the dependent first so raw insertion order would violate
        // the invariant after a remap.
        let b = Key::from_text(tag, "b");
        let a = Key::from_text(tag, "a");
        let b_id = db.record(&b, Value::from_text("B"), 1, 1, vec![], 0.0, vec![]);
        let a_id = db.record(&a, Value::from_text("A"), 1, 1, vec![], 0.0, vec![]);
        // Rewire b to depend on a (recorded later, higher id).
        db.record(&b, Value::from_text("B"), 1, 1, vec![vec![a_id]], 0.0, vec![]);
        assert!(a_id > b_id);

        let json = render(&db).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();
        let records = parsed.as_array().unwrap();
        for (at, record) in records.iter().enumerate() {
            for dep in record["depends"].as_array().unwrap() {
                let dep = usize::try_from(dep.as_u64().unwrap()).unwrap();
                assert!(dep < at, "depends[{dep}] must precede record {at}");
            }
        }
    }

    #[test]
    fn most_recent_run_reports_built_zero() {
        let mut db = Database::fresh();
        let tag = make_type_tag("file");
        let k = Key::from_text(tag, "k");
        let run = db.run();
        db.record(&k, Value::from_text("v"), run, run, vec![], 0.5, vec![]);
        let parsed: serde_json::Value = serde_json::from_str(&render(&db).unwrap()).unwrap();
        assert_eq!(parsed[0]["built"], 0);
        assert_eq!(parsed[0]["changed"], 0);
        assert_eq!(parsed[0]["name"], "k");
    }

    #[test]
    fn empty_traces_are_omitted() {
        let mut db = Database::fresh();
        let tag = make_type_tag("file");
        let k = Key::from_text(tag, "k");
        db.record(&k, Value::from_text("v"), 1, 1, vec![], 0.0, vec![]);
        let parsed: serde_json::Value = serde_json::from_str(&render(&db).unwrap()).unwrap();
        assert!(parsed[0].get("traces").is_none());
    }
}
