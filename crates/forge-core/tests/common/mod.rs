// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code)]

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use forge_core::{
    make_type_tag, Action, BuildFn, CompareFn, EngineError, Key, MemorySink, Options, RuleDef,
    Rules, StoredFn, TypeTag, Value, Verbosity,
};

/// Tag shared by every test rule.
pub fn test_tag() -> TypeTag {
    make_type_tag("test/str")
}

/// Key under the shared test tag.
pub fn key(name: &str) -> Key {
    Key::from_text(test_tag(), name)
}

/// Shared log of rule executions, in completion order.
pub type RunLog = Arc<Mutex<Vec<String>>>;

pub fn new_log() -> RunLog {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn log_entries(log: &RunLog) -> Vec<String> {
    log.lock().unwrap().clone()
}

pub fn clear_log(log: &RunLog) {
    log.lock().unwrap().clear();
}

/// Registers a rule matching exactly `name`.
pub fn add_rule(
    rules: &mut Rules,
    name: &'static str,
    build: impl Fn(&mut Action) -> Result<Value, EngineError> + Send + Sync + 'static,
) {
    add_rule_full(rules, name, build, None, None);
}

/// Registers a rule matching exactly `name`, with an optional comparator
/// and stored-value probe.
pub fn add_rule_full(
    rules: &mut Rules,
    name: &'static str,
    build: impl Fn(&mut Action) -> Result<Value, EngineError> + Send + Sync + 'static,
    comparator: Option<CompareFn>,
    stored: Option<StoredFn>,
) {
    let build: BuildFn = Arc::new(build);
    let matcher = Arc::new(move |k: &Key| (k.text() == name).then(|| Arc::clone(&build)));
    let mut def = RuleDef::new(test_tag(), name, matcher);
    if let Some(comparator) = comparator {
        def = def.with_comparator(comparator);
    }
    if let Some(stored) = stored {
        def = def.with_stored(stored);
    }
    rules.add_rule(def);
}

/// Temp-dir scaffolding for one engine under test.
pub struct Harness {
    pub dir: tempfile::TempDir,
    pub sink: Arc<MemorySink>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("tempdir"),
            sink: Arc::new(MemorySink::new()),
        }
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.path().join("forge.db")
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.path().join("report.json")
    }

    /// Options pointing at this harness's database, quiet enough for tests.
    pub fn options(&self) -> Options {
        Options::new(self.db_path()).with_verbosity(Verbosity::Normal)
    }

    /// Lines captured by the memory sink so far.
    pub fn lines(&self) -> Vec<String> {
        self.sink.lines().into_iter().map(|(_, line)| line).collect()
    }

    /// Parses the profile report written by the last run.
    pub fn report(&self) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.report_path()).expect("report file");
        serde_json::from_str(&raw).expect("report JSON")
    }
}

/// Index of the record named `name` in a parsed report.
pub fn report_index(report: &serde_json::Value, name: &str) -> usize {
    report
        .as_array()
        .expect("report array")
        .iter()
        .position(|record| record["name"] == name)
        .unwrap_or_else(|| panic!("no report record named {name}"))
}
