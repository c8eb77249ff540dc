// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Execution environments.
//!
//! Every rule body runs against two environments: a read-only [`Global`]
//! shared by all rule executions in a build, and an owned, mutable
//! [`Local`] that travels with the execution. Scoped operations on the
//! local are restored on every exit path, panics included, via drop
//! guards.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use rustc_hash::FxHashSet;

use crate::build::CellMap;
use crate::db::{Database, TraceSpan};
use crate::error::EngineError;
use crate::ident::{EntryId, Fingerprint};
use crate::key::Key;
use crate::options::{Options, Verbosity};
use crate::output::OutputGate;
use crate::pool::Pool;
use crate::progress::Progress;
use crate::registry::Rules;

/// Locks a mutex, recovering the guard when a panicking rule poisoned it.
/// Engine state behind these mutexes stays consistent because every
/// critical section is a plain field update.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Deferred IO registered by rules: after-hooks and the cleanup registry.
pub(crate) type Hook = Box<dyn FnOnce() + Send + 'static>;

/// Read-only environment shared by every rule execution in a build.
pub(crate) struct Global {
    /// The options the build was started with; invariant across the run.
    pub(crate) options: Options,
    /// Registered rules.
    pub(crate) registry: Rules,
    /// The dependency database.
    pub(crate) db: Mutex<Database>,
    /// Current run counter, cached out of the database.
    pub(crate) run: u32,
    /// Per-key build state for this run.
    pub(crate) cells: CellMap,
    /// The worker pool.
    pub(crate) pool: Arc<Pool>,
    /// Monotonic timestamp source: seconds since build start.
    start: Instant,
    /// Serialised output gate.
    pub(crate) output: OutputGate,
    /// Shared progress counters.
    pub(crate) progress: Progress,
    /// After-hooks, most recently registered first; run on success.
    pub(crate) after: Mutex<Vec<Hook>>,
    /// Cleanup registry; runs when the build ends, success or not.
    pub(crate) cleanup: Mutex<Vec<Hook>>,
    /// Tracked writes with no owning rule, keyed `(owner, key)`.
    pub(crate) lint_absent: Mutex<BTreeMap<(String, String), ()>>,
    /// Failure collection and shutdown flag.
    pub(crate) failure: FailureLog,
}

impl Global {
    pub(crate) fn new(
        options: Options,
        registry: Rules,
        db: Database,
        pool: Arc<Pool>,
        output: OutputGate,
    ) -> Self {
        let run = db.run();
        let staunch = options.staunch;
        Self {
            options,
            registry,
            db: Mutex::new(db),
            run,
            cells: CellMap::default(),
            pool,
            start: Instant::now(),
            output,
            progress: Progress::default(),
            after: Mutex::new(Vec::new()),
            cleanup: Mutex::new(Vec::new()),
            lint_absent: Mutex::new(BTreeMap::new()),
            failure: FailureLog::new(staunch),
        }
    }

    /// Seconds since the build started.
    pub(crate) fn seconds(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }

    /// Emits one line through the serialised gate.
    pub(crate) fn emit(&self, verbosity: Verbosity, line: &str) {
        self.output.emit(verbosity, line);
    }
}

/// Collects failures and drives the shutdown policy.
///
/// With staunch off, the first failure flips the shutdown flag: no new
/// rule bodies start, in-flight bodies finish naturally. With staunch on,
/// the build continues and every failure is kept for the final summary.
pub(crate) struct FailureLog {
    staunch: bool,
    shutdown: AtomicBool,
    errors: Mutex<Vec<Arc<EngineError>>>,
}

impl FailureLog {
    fn new(staunch: bool) -> Self {
        Self {
            staunch,
            shutdown: AtomicBool::new(false),
            errors: Mutex::new(Vec::new()),
        }
    }

    /// Records a failure once; duplicates (the same error propagating
    /// through several dependents) are collapsed by rendered message.
    pub(crate) fn record(&self, err: &Arc<EngineError>) {
        let mut errors = lock(&self.errors);
        let text = err.to_string();
        if !errors.iter().any(|e| e.to_string() == text) {
            errors.push(Arc::clone(err));
        }
        drop(errors);
        if !self.staunch {
            self.shutdown.store(true, Ordering::Release);
        }
    }

    /// Whether new rule bodies may still start.
    pub(crate) fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Forces shutdown without recording an error (timeout path).
    pub(crate) fn force_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// First recorded failure, if any.
    pub(crate) fn first(&self) -> Option<Arc<EngineError>> {
        lock(&self.errors).first().cloned()
    }

    /// Every unique failure, in record order.
    pub(crate) fn all(&self) -> Vec<Arc<EngineError>> {
        lock(&self.errors).clone()
    }
}

/// The call stack above (and including) the executing rule.
///
/// Each execution carries the full chain of ancestors, so cycle detection
/// is a membership test against the requesting stack — the graph is
/// materialised lazily and never walked globally.
#[derive(Debug, Clone, Default)]
pub(crate) struct Stack {
    frames: Vec<Key>,
}

impl Stack {
    /// Returns a child stack with `key` pushed on top.
    pub(crate) fn push(&self, key: Key) -> Stack {
        let mut frames = self.frames.clone();
        frames.push(key);
        Stack { frames }
    }

    /// Whether `key` is anywhere on the stack.
    pub(crate) fn contains(&self, key: &Key) -> bool {
        self.frames.iter().any(|k| k == key)
    }

    /// The key currently being built, if any.
    pub(crate) fn top(&self) -> Option<&Key> {
        self.frames.last()
    }

    /// Printable frames, most-recent-first, for error prefixes.
    pub(crate) fn names(&self) -> Vec<String> {
        self.frames
            .iter()
            .rev()
            .map(|k| k.text().to_owned())
            .collect()
    }

    /// Printable frames in request order, with the repeated key appended;
    /// the payload of a cycle error.
    pub(crate) fn cycle_names(&self, repeated: &Key) -> Vec<String> {
        let mut names: Vec<String> = self.frames.iter().map(|k| k.text().to_owned()).collect();
        names.push(repeated.text().to_owned());
        names
    }
}

/// Predicate marking keys a rule may read or write without owning them.
pub(crate) type AllowPred = Arc<dyn Fn(&Key) -> bool + Send + Sync>;

/// Mutable per-execution environment.
pub(crate) struct Local {
    /// Keys being built above this execution, own key on top.
    pub(crate) stack: Stack,
    /// Dependency groups, one per `apply` call, in program order.
    pub(crate) deps: Vec<Vec<EntryId>>,
    /// Fingerprints of every key this execution has applied.
    pub(crate) applied: FxHashSet<Fingerprint>,
    /// Trace spans recorded so far.
    pub(crate) traces: Vec<TraceSpan>,
    /// Active verbosity; scoped overrides restore the previous value.
    pub(crate) verbosity: Verbosity,
    /// When set, `apply` fails, quoting the reason.
    pub(crate) block_apply: Option<String>,
    /// Lint allow predicates in force for the rest of the execution.
    pub(crate) lint_allow: Vec<AllowPred>,
    /// Tracked reads awaiting their deferred justification.
    pub(crate) lint_pending: Vec<Key>,
}

impl Local {
    pub(crate) fn new(stack: Stack, verbosity: Verbosity) -> Self {
        Self {
            stack,
            deps: Vec::new(),
            applied: FxHashSet::default(),
            traces: Vec::new(),
            verbosity,
            block_apply: None,
            lint_allow: Vec::new(),
            lint_pending: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ident::make_type_tag;

    fn key(name: &str) -> Key {
        Key::from_text(make_type_tag("t"), name)
    }

    #[test]
    fn stack_membership_spans_all_ancestors() {
        let stack = Stack::default().push(key("a")).push(key("b"));
        assert!(stack.contains(&key("a")));
        assert!(stack.contains(&key("b")));
        assert!(!stack.contains(&key("c")));
        assert_eq!(stack.top().map(Key::text), Some("b"));
    }

    #[test]
    fn cycle_names_end_with_the_repeated_key() {
        let stack = Stack::default().push(key("x")).push(key("y"));
        let names = stack.cycle_names(&key("x"));
        assert_eq!(names, vec!["x", "y", "x"]);
    }

    #[test]
    fn failure_log_collapses_duplicate_messages() {
        let log = FailureLog::new(true);
        let e1 = Arc::new(EngineError::user("boom"));
        let e2 = Arc::new(EngineError::user("boom"));
        log.record(&e1);
        log.record(&e2);
        assert_eq!(log.all().len(), 1);
        assert!(!log.shutting_down(), "staunch keeps the build running");
    }

    #[test]
    fn first_failure_without_staunch_forces_shutdown() {
        let log = FailureLog::new(false);
        log.record(&Arc::new(EngineError::user("boom")));
        assert!(log.shutting_down());
    }
}
