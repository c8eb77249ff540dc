// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The per-rule execution context and its contract operations.
//!
//! An [`Action`] is handed to every rule body. It borrows the build-wide
//! [`Global`](crate::context::Global) environment and owns the rule's
//! [`Local`](crate::context::Local) state: stack, dependency groups,
//! traces, verbosity, lint tracking. Scoped operations restore the local
//! on both the normal and the failing path; the drop guards below are the
//! masked-restore of the original design.

use std::sync::Arc;

use crate::context::{lock, AllowPred, Global, Local, Stack};
use crate::db::TraceSpan;
use crate::error::EngineError;
use crate::key::{Key, Value};
use crate::lint;
use crate::options::{Options, Verbosity};
use crate::progress::ProgressSnapshot;

/// Execution context threaded through every rule body.
pub struct Action {
    pub(crate) global: Arc<Global>,
    pub(crate) local: Local,
}

/// Runs a closure exactly once when dropped, unless disarmed.
struct RunOnDrop<F: FnOnce()>(Option<F>);

impl<F: FnOnce()> Drop for RunOnDrop<F> {
    fn drop(&mut self) {
        if let Some(f) = self.0.take() {
            f();
        }
    }
}

impl Action {
    /// Context for a rule body; `stack` already carries the rule's own key.
    pub(crate) fn for_rule(global: Arc<Global>, stack: Stack) -> Self {
        let verbosity = global.options.verbosity;
        Self {
            global,
            local: Local::new(stack, verbosity),
        }
    }

    /// Context for the top-level wants, with an empty stack.
    pub(crate) fn for_root(global: Arc<Global>) -> Self {
        Self::for_rule(global, Stack::default())
    }

    /// Consumes the context, releasing its local state for recording.
    pub(crate) fn into_local(self) -> Local {
        self.local
    }

    // ------------------------------------------------------------------
    // Environment access
    // ------------------------------------------------------------------

    /// The options the build was started with; invariant across the build.
    #[must_use]
    pub fn options(&self) -> &Options {
        &self.global.options
    }

    /// Samples the shared progress counters.
    #[must_use]
    pub fn progress(&self) -> ProgressSnapshot {
        self.global.progress.snapshot()
    }

    /// Seconds since the build started, from the shared monotonic source.
    #[must_use]
    pub fn elapsed_seconds(&self) -> f64 {
        self.global.seconds()
    }

    // ------------------------------------------------------------------
    // Deferred IO
    // ------------------------------------------------------------------

    /// Registers IO to run after the build completes successfully.
    ///
    /// Hooks run in reverse registration order. A failing build skips them.
    pub fn run_after(&self, hook: impl FnOnce() + Send + 'static) {
        lock(&self.global.after).insert(0, Box::new(hook));
    }

    /// Registers IO in the build-wide cleanup registry; it runs when the
    /// build ends, whether it succeeded or not.
    pub fn register_cleanup(&self, hook: impl FnOnce() + Send + 'static) {
        lock(&self.global.cleanup).insert(0, Box::new(hook));
    }

    /// Runs `act`; if it fails (including by panicking), runs `cleanup`
    /// exactly once. A successful `act` skips `cleanup`.
    pub fn on_exception<R>(
        &mut self,
        act: impl FnOnce(&mut Action) -> Result<R, EngineError>,
        cleanup: impl FnOnce(),
    ) -> Result<R, EngineError> {
        let mut guard = RunOnDrop(Some(cleanup));
        let out = act(self);
        match out {
            Ok(value) => {
                // Disarm: the cleanup must not run on success.
                let _ = guard.0.take();
                Ok(value)
            }
            Err(err) => {
                drop(guard);
                Err(err)
            }
        }
    }

    /// Runs `act`, then `cleanup`, exactly once on both the success and
    /// the failure path; the registration/run pair cannot be skipped by a
    /// panic.
    pub fn finally<R>(
        &mut self,
        act: impl FnOnce(&mut Action) -> Result<R, EngineError>,
        cleanup: impl FnOnce(),
    ) -> Result<R, EngineError> {
        let _guard = RunOnDrop(Some(cleanup));
        act(self)
    }

    // ------------------------------------------------------------------
    // Verbosity and output
    // ------------------------------------------------------------------

    /// Runs `act` with the local verbosity overridden; the previous value
    /// is restored on every exit path.
    pub fn with_verbosity<R>(
        &mut self,
        verbosity: Verbosity,
        act: impl FnOnce(&mut Action) -> R,
    ) -> R {
        let prev = std::mem::replace(&mut self.local.verbosity, verbosity);
        struct Restore<'a> {
            action: &'a mut Action,
            prev: Verbosity,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                self.action.local.verbosity = self.prev;
            }
        }
        let restore = Restore { action: self, prev };
        act(&mut *restore.action)
    }

    /// Runs `act` at [`Verbosity::Quiet`].
    pub fn quietly<R>(&mut self, act: impl FnOnce(&mut Action) -> R) -> R {
        self.with_verbosity(Verbosity::Quiet, act)
    }

    /// Emits a line iff the local verbosity is at least `verbosity`.
    ///
    /// Emissions are globally serialised; lines from concurrent rules never
    /// interleave.
    pub fn put_when(&self, verbosity: Verbosity, line: &str) {
        if self.local.verbosity >= verbosity {
            self.global.emit(verbosity, line);
        }
    }

    /// Wraps IO in a recorded trace span.
    ///
    /// Captures start and stop against the build clock, announces
    /// `# <command> (for <key>)` at [`Verbosity::Normal`], and appends the
    /// span to the rule's traces before returning. Inside
    /// [`Action::quietly`] the announcement is suppressed but the span is
    /// still recorded.
    pub fn traced<R>(
        &mut self,
        command: impl Into<String>,
        act: impl FnOnce(&mut Action) -> Result<R, EngineError>,
    ) -> Result<R, EngineError> {
        let command = command.into();
        let owner = self
            .local
            .stack
            .top()
            .map_or_else(|| "top-level".to_owned(), |k| k.text().to_owned());
        self.put_when(Verbosity::Normal, &format!("# {command} (for {owner})"));
        let start = self.global.seconds();
        let out = act(self)?;
        let stop = self.global.seconds();
        self.local.traces.push(TraceSpan {
            command,
            start,
            stop,
        });
        Ok(out)
    }

    // ------------------------------------------------------------------
    // Apply gating
    // ------------------------------------------------------------------

    /// Runs `act` with `apply` forbidden; any `apply` inside fails with a
    /// blocking error quoting `reason`.
    pub fn block_apply<R>(
        &mut self,
        reason: impl Into<String>,
        act: impl FnOnce(&mut Action) -> R,
    ) -> R {
        let prev = self.local.block_apply.replace(reason.into());
        self.scoped_block(prev, act)
    }

    /// Runs `act` with any `apply` block cleared.
    pub fn unsafe_allow_apply<R>(&mut self, act: impl FnOnce(&mut Action) -> R) -> R {
        let prev = self.local.block_apply.take();
        self.scoped_block(prev, act)
    }

    fn scoped_block<R>(
        &mut self,
        prev: Option<String>,
        act: impl FnOnce(&mut Action) -> R,
    ) -> R {
        struct Restore<'a> {
            action: &'a mut Action,
            prev: Option<Option<String>>,
        }
        impl Drop for Restore<'_> {
            fn drop(&mut self) {
                if let Some(prev) = self.prev.take() {
                    self.action.local.block_apply = prev;
                }
            }
        }
        let restore = Restore {
            action: self,
            prev: Some(prev),
        };
        act(&mut *restore.action)
    }

    // ------------------------------------------------------------------
    // Dependencies
    // ------------------------------------------------------------------

    /// Declares dependencies and returns their values, in the caller's
    /// order.
    ///
    /// Each key is resolved to a cached value, awaited if another rule is
    /// already building it, or built here and now. The whole key list is
    /// appended to this rule's dependencies as one group. On failure the
    /// first failing key (in input order) decides the error, and every
    /// caller awaiting that key sees the same failure.
    ///
    /// # Errors
    ///
    /// Fails with [`EngineError::BlockedApply`] inside a
    /// [`Action::block_apply`] scope, [`EngineError::Cycle`] when a key is
    /// already on the requesting stack, and otherwise propagates the first
    /// failing dependency.
    pub fn apply(&mut self, keys: &[Key]) -> Result<Vec<Value>, EngineError> {
        let resolved = crate::build::apply_keys(self, keys)?;
        Ok(resolved.into_iter().map(|r| r.value).collect())
    }

    /// Single-key convenience over [`Action::apply`].
    ///
    /// # Errors
    ///
    /// As [`Action::apply`].
    pub fn apply1(&mut self, key: &Key) -> Result<Value, EngineError> {
        let mut values = self.apply(std::slice::from_ref(key))?;
        values
            .pop()
            .ok_or(EngineError::Internal("apply returned no value for its key"))
    }

    // ------------------------------------------------------------------
    // Lint tracking
    // ------------------------------------------------------------------

    /// Declares that this rule has read the given keys' values.
    ///
    /// No-op unless a lint mode is active.
    pub fn lint_track_read(&mut self, keys: &[Key]) {
        lint::track_read(self, keys);
    }

    /// Declares that this rule has written the given keys.
    ///
    /// No-op unless a lint mode is active.
    pub fn lint_track_write(&mut self, keys: &[Key]) {
        lint::track_write(self, keys);
    }

    /// Installs an allow predicate for the rest of this execution; keys it
    /// matches are exempt from read/write tracking.
    pub fn lint_allow(&mut self, pred: impl Fn(&Key) -> bool + Send + Sync + 'static) {
        let pred: AllowPred = Arc::new(pred);
        self.local.lint_allow.push(pred);
    }
}
