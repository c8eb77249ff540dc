// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The engine entry point.
//!
//! `run` loads the database, starts the pool, lets the caller populate the
//! rule registry, pushes the wants through `apply`, waits at the outermost
//! point (honouring the build-wide timeout), runs after-hooks on success,
//! persists the database, writes the profile report, and finally invokes
//! the cleanup registry.

use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};

use crate::action::Action;
use crate::context::{lock, Global, Hook};
use crate::db::Database;
use crate::error::{EngineError, LintKind};
use crate::options::{Options, Verbosity};
use crate::output::{OutputGate, OutputSink, StderrSink};
use crate::pool::Pool;
use crate::registry::Rules;
use crate::report;

/// Runs a build: `register` populates the rule registry, then the wants in
/// `options` are produced.
///
/// # Errors
///
/// Returns the first failure; with staunch enabled, every unique failure
/// has been reported through the output sink before this returns. Map the
/// error to a process exit status with [`EngineError::exit_code`].
pub fn run(options: Options, register: impl FnOnce(&mut Rules)) -> Result<(), EngineError> {
    run_with_sink(options, Arc::new(StderrSink), register)
}

/// As [`run`], with an explicit output sink.
///
/// # Errors
///
/// As [`run`].
pub fn run_with_sink(
    options: Options,
    sink: Arc<dyn OutputSink>,
    register: impl FnOnce(&mut Rules),
) -> Result<(), EngineError> {
    let mut registry = Rules::new();
    register(&mut registry);

    let db = Database::load(&options.db_file)?;
    tracing::info!(run = db.run(), entries = db.len(), "database loaded");

    let pool = Pool::new(options.parallelism);
    let global = Arc::new(Global::new(
        options,
        registry,
        db,
        Arc::clone(&pool),
        OutputGate::new(sink),
    ));

    let root_result = wait_for_wants(&global);

    if let RootOutcome::TimedOut(err) = &root_result {
        // In-flight IO is left to finish naturally; nothing further is
        // admitted and the database is not rewritten underneath it.
        pool.abandon();
        run_hooks(&global.cleanup);
        return Err((**err).clone());
    }
    pool.shutdown();

    if let RootOutcome::Finished(Err(err)) = &root_result {
        // Failures born at the root (cycles among wants) are not recorded
        // by any rule body; fold them into the log for the summary.
        global.failure.record(&Arc::new(err.clone()));
    }

    let lint_failure = audit_unowned_writes(&global);
    let failures = global.failure.all();
    let succeeded = failures.is_empty() && lint_failure.is_none();

    if succeeded {
        run_hooks(&global.after);
    } else {
        for failure in &failures {
            if global.options.verbosity >= Verbosity::Quiet {
                global.emit(Verbosity::Quiet, &failure.to_string());
            }
        }
    }

    let saved = lock(&global.db).save(&global.options.db_file);
    let reported = match &global.options.report_file {
        Some(path) => report::write(&lock(&global.db), path),
        None => Ok(()),
    };

    run_hooks(&global.cleanup);

    let snapshot = global.progress.snapshot();
    tracing::info!(
        built = snapshot.built,
        skipped = snapshot.skipped,
        failed = snapshot.failed,
        "build finished"
    );

    if let Some(failure) = failures.first() {
        if let Err(err) = &saved {
            tracing::warn!(%err, "database not saved");
        }
        return Err((**failure).clone());
    }
    if let Some(failure) = lint_failure {
        return Err(failure);
    }
    saved?;
    reported
}

enum RootOutcome {
    Finished(Result<(), EngineError>),
    TimedOut(Arc<EngineError>),
}

/// Pushes the wants through `apply` on the pool and waits at the
/// outermost point, applying the build-wide timeout if one is set.
fn wait_for_wants(global: &Arc<Global>) -> RootOutcome {
    let wants = global.options.wants.clone();
    let (tx, rx) = mpsc::channel();
    let pool = Arc::clone(&global.pool);
    let worker_global = Arc::clone(global);
    pool.spawn(Box::new(move || {
        let mut root = Action::for_root(Arc::clone(&worker_global));
        let result = root.apply(&wants).map(|_| ());
        let _ = tx.send(result);
    }));

    match global.options.timeout {
        Some(limit) => match rx.recv_timeout(limit) {
            Ok(result) => RootOutcome::Finished(result),
            Err(RecvTimeoutError::Timeout) => {
                let err = Arc::new(EngineError::user(format!(
                    "build timed out after {:.1}s",
                    limit.as_secs_f64()
                )));
                global.failure.record(&err);
                global.failure.force_shutdown();
                RootOutcome::TimedOut(err)
            }
            Err(RecvTimeoutError::Disconnected) => RootOutcome::Finished(Err(
                EngineError::Internal("root build worker vanished"),
            )),
        },
        None => match rx.recv() {
            Ok(result) => RootOutcome::Finished(result),
            Err(_) => RootOutcome::Finished(Err(EngineError::Internal(
                "root build worker vanished",
            ))),
        },
    }
}

/// Reports tracked writes that no rule owned, collected across the build.
fn audit_unowned_writes(global: &Arc<Global>) -> Option<EngineError> {
    if !global.options.lint.enabled() {
        return None;
    }
    let absent = lock(&global.lint_absent);
    let mut first = None;
    for ((owner, key), ()) in absent.iter() {
        let failure = EngineError::Lint {
            kind: LintKind::UnownedWrite,
            key: key.clone(),
            owner: owner.clone(),
        };
        if global.options.verbosity >= Verbosity::Quiet {
            global.emit(Verbosity::Quiet, &failure.to_string());
        }
        if first.is_none() {
            first = Some(failure);
        }
    }
    first
}

/// Drains a hook list in stored order (hooks are prepended at
/// registration, so this is reverse registration order).
fn run_hooks(hooks: &Mutex<Vec<Hook>>) {
    let drained = std::mem::take(&mut *lock(hooks));
    for hook in drained {
        hook();
    }
}
