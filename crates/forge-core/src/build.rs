// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Dependency resolution: the `apply` primitive and the per-key build
//! state machine.
//!
//! Each key touched by a run owns one [`Cell`]: a state machine moving
//! `New → Running → Ready | Failed`, guarded by a per-key mutex taken only
//! during transitions. The rule body itself runs lock-free on the pool. A
//! key is therefore absent, running (exactly one worker), or resolved at
//! any instant, and at most one body ever executes per key per run.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};

use rustc_hash::FxHashMap;

use crate::action::Action;
use crate::context::{lock, Global, Stack};
use crate::db::Entry;
use crate::error::EngineError;
use crate::ident::{EntryId, Fingerprint};
use crate::key::{Key, Value};
use crate::lint;
use crate::registry::RuleHit;
use crate::rule::ValueChange;

/// What a resolved dependency hands back to its requesters.
#[derive(Clone)]
pub(crate) struct Resolved {
    /// Compact database id, recorded into the requester's dependency group.
    pub(crate) id: EntryId,
    /// The key's up-to-date value.
    pub(crate) value: Value,
    /// Run at which the value last differed, for freshness checks.
    pub(crate) changed: u32,
}

/// Build state of one key during one run.
enum CellState {
    /// Untouched this run.
    New,
    /// Exactly one worker owns the build.
    Running,
    /// Fresh this run.
    Ready(Resolved),
    /// The build failed; every waiter sees the same error.
    Failed(Arc<EngineError>),
}

/// Per-key synchronisation point.
pub(crate) struct Cell {
    key: Key,
    state: Mutex<CellState>,
    done: Condvar,
}

impl Cell {
    fn new(key: Key) -> Self {
        Self {
            key,
            state: Mutex::new(CellState::New),
            done: Condvar::new(),
        }
    }

    fn is_terminal(&self) -> bool {
        matches!(
            &*lock(&self.state),
            CellState::Ready(_) | CellState::Failed(_)
        )
    }

    /// Blocks until the key is resolved; callers release their pool slot
    /// first (see [`apply_keys`]).
    fn wait(&self) -> Result<Resolved, Arc<EngineError>> {
        let mut state = lock(&self.state);
        loop {
            match &*state {
                CellState::Ready(res) => return Ok(res.clone()),
                CellState::Failed(err) => return Err(Arc::clone(err)),
                CellState::New | CellState::Running => {
                    state = match self.done.wait(state) {
                        Ok(guard) => guard,
                        Err(poisoned) => poisoned.into_inner(),
                    };
                }
            }
        }
    }

    fn finish(&self, outcome: Result<Resolved, Arc<EngineError>>) {
        let mut state = lock(&self.state);
        *state = match outcome {
            Ok(res) => CellState::Ready(res),
            Err(err) => CellState::Failed(err),
        };
        drop(state);
        self.done.notify_all();
    }
}

/// Fingerprint-indexed cells for the current run.
#[derive(Default)]
pub(crate) struct CellMap {
    cells: Mutex<FxHashMap<Fingerprint, Arc<Cell>>>,
}

impl CellMap {
    fn cell(&self, key: &Key) -> Arc<Cell> {
        let mut cells = lock(&self.cells);
        Arc::clone(
            cells
                .entry(key.fingerprint())
                .or_insert_with(|| Arc::new(Cell::new(key.clone()))),
        )
    }
}

/// Resolves a list of keys for the executing rule.
///
/// The algorithm of the dependency resolver:
/// 1. fail fast inside a `block_apply` scope;
/// 2. fail with a cycle if any key is already on the requesting stack;
/// 3. claim every unresolved key (`New → Running`) and enqueue its build;
/// 4. release the worker slot and block until all keys are terminal;
/// 5. on success, append the keys as one dependency group in caller order
///    and hand back the resolved values; on failure, report the first
///    failing key in input order.
pub(crate) fn apply_keys(action: &mut Action, keys: &[Key]) -> Result<Vec<Resolved>, EngineError> {
    if let Some(reason) = &action.local.block_apply {
        return Err(EngineError::BlockedApply {
            reason: reason.clone(),
        });
    }
    for key in keys {
        if action.local.stack.contains(key) {
            return Err(EngineError::Cycle {
                stack: action.local.stack.cycle_names(key),
            });
        }
    }

    let global = Arc::clone(&action.global);
    let cells: Vec<Arc<Cell>> = keys.iter().map(|k| global.cells.cell(k)).collect();
    for cell in &cells {
        maybe_start(&global, cell, &action.local.stack);
    }

    let mut outcomes = Vec::with_capacity(cells.len());
    if cells.iter().all(|c| c.is_terminal()) {
        for cell in &cells {
            outcomes.push(cell.wait());
        }
    } else {
        // The only suspension point: give the slot back so ready work can
        // run while this rule waits.
        global.pool.blocking(|| {
            for cell in &cells {
                outcomes.push(cell.wait());
            }
        });
    }

    let mut resolved = Vec::with_capacity(outcomes.len());
    for outcome in outcomes {
        match outcome {
            Ok(res) => resolved.push(res),
            Err(err) => return Err((*err).clone()),
        }
    }

    action
        .local
        .deps
        .push(resolved.iter().map(|r| r.id).collect());
    for key in keys {
        action.local.applied.insert(key.fingerprint());
    }
    Ok(resolved)
}

/// Claims the cell for building if nobody has this run.
fn maybe_start(global: &Arc<Global>, cell: &Arc<Cell>, stack: &Stack) {
    {
        let mut state = lock(&cell.state);
        if !matches!(&*state, CellState::New) {
            return;
        }
        *state = CellState::Running;
    }
    let child_stack = stack.push(cell.key.clone());
    let global = Arc::clone(global);
    let cell = Arc::clone(cell);
    let pool = Arc::clone(&global.pool);
    pool.spawn(Box::new(move || build_key(&global, &cell, child_stack)));
}

/// Pool job owning one key's resolution for this run.
fn build_key(global: &Arc<Global>, cell: &Arc<Cell>, stack: Stack) {
    if global.failure.shutting_down() {
        let err = global.failure.first().unwrap_or_else(|| {
            Arc::new(EngineError::Internal("shutdown without a recorded failure"))
        });
        cell.finish(Err(err));
        return;
    }
    match resolve_key(global, &cell.key, stack) {
        Ok(resolved) => cell.finish(Ok(resolved)),
        Err(err) => {
            let err = Arc::new(err);
            global.failure.record(&err);
            global.progress.note_failed();
            cell.finish(Err(err));
        }
    }
}

/// Decides between reusing the stored entry and executing the rule body.
fn resolve_key(global: &Arc<Global>, key: &Key, stack: Stack) -> Result<Resolved, EngineError> {
    let rule = global.registry.lookup(key)?;
    let stored = lock(&global.db).snapshot(key.fingerprint());
    if let Some((id, prev)) = &stored {
        if entry_is_fresh(global, key, &rule, prev, &stack)? {
            lock(&global.db).bump_built(*id, global.run);
            global.progress.note_skipped();
            tracing::debug!(key = %key, "up to date; skipping");
            return Ok(Resolved {
                id: *id,
                value: prev.value.clone(),
                changed: prev.changed,
            });
        }
    }
    execute_rule(global, key, &rule, stored, stack)
}

/// The staleness decision for an entry persisted by an earlier run.
///
/// The entry is fresh when every stored dependency, resolved as if the
/// stored rule had requested it, still has `changed <= built`, and the
/// rule's stored-value probe (when present) re-derives a value its
/// comparator calls equal.
fn entry_is_fresh(
    global: &Arc<Global>,
    key: &Key,
    rule: &RuleHit,
    prev: &Entry,
    stack: &Stack,
) -> Result<bool, EngineError> {
    if !prev.deps.is_empty() {
        let mut checker = Action::for_rule(Arc::clone(global), stack.clone());
        for group in &prev.deps {
            let group_keys = lock(&global.db).dep_keys(group)?;
            let resolved = apply_keys(&mut checker, &group_keys)?;
            if resolved.iter().any(|dep| dep.changed > prev.built) {
                tracing::debug!(key = %key, "dependency changed; rebuilding");
                return Ok(false);
            }
        }
    }
    if let Some(probe) = &rule.stored {
        match probe(key) {
            Some(current)
                if (rule.comparator)(&prev.value, &current) == ValueChange::Equal => {}
            _ => {
                tracing::debug!(key = %key, "stored value diverged; rebuilding");
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Runs the rule body and records the outcome.
fn execute_rule(
    global: &Arc<Global>,
    key: &Key,
    rule: &RuleHit,
    stored: Option<(EntryId, Entry)>,
    stack: Stack,
) -> Result<Resolved, EngineError> {
    let run = global.run;
    let mut action = Action::for_rule(Arc::clone(global), stack);
    global.progress.enter_running();
    let started = global.seconds();
    let body = catch_unwind(AssertUnwindSafe(|| (rule.build)(&mut action)));
    let execution = global.seconds() - started;
    global.progress.exit_running();

    let produced = match body {
        Ok(result) => result,
        Err(panic) => Err(EngineError::user(format!(
            "rule body panicked: {}",
            panic_text(panic.as_ref())
        ))),
    };
    let value = match produced {
        Ok(value) => value,
        Err(err) => return Err(err.with_stack(&action.local.stack.names())),
    };

    if global.options.lint.enabled() {
        lint::finished(&action)?;
    }

    let (built, changed) = match &stored {
        Some((_, prev)) => match (rule.comparator)(&prev.value, &value) {
            ValueChange::Equal | ValueChange::RebuiltButEquivalent => (run, prev.changed),
            ValueChange::Changed => (run, run),
        },
        None => (run, run),
    };

    let local = action.into_local();
    let id = lock(&global.db).record(
        key,
        value.clone(),
        built,
        changed,
        local.deps,
        execution,
        local.traces,
    );
    global.progress.note_built();
    tracing::debug!(key = %key, built, changed, "executed");
    Ok(Resolved { id, value, changed })
}

fn panic_text(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(text) = payload.downcast_ref::<&str>() {
        text
    } else if let Some(text) = payload.downcast_ref::<String>() {
        text
    } else {
        "opaque panic payload"
    }
}
