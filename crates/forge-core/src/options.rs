// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Build options.
use std::path::PathBuf;
use std::time::Duration;

use crate::key::Key;

/// Message levels, ordered from quietest to loudest.
///
/// An emission at level `v` is visible when the active verbosity is at
/// least `v`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    /// No output at all, not even errors.
    Silent,
    /// Errors only.
    Quiet,
    /// Errors and interesting messages (the default).
    Normal,
    /// Per-rule chatter.
    Loud,
    /// Everything, including engine internals.
    Diagnostic,
}

/// Lint-mode selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintMode {
    /// No auditing.
    None,
    /// Audit tracked reads and writes against declared dependencies.
    Basic,
    /// As [`LintMode::Basic`], plus change auditing in outer rule layers.
    Change,
}

impl LintMode {
    /// Whether any auditing is active.
    #[must_use]
    pub fn enabled(self) -> bool {
        !matches!(self, LintMode::None)
    }
}

/// How outer file-rule layers detect changes; the core records the choice
/// and hands it to rules through [`Action::options`](crate::Action::options).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeMode {
    /// Modification time only.
    ModtimeOnly,
    /// Modification time first, content digest to confirm.
    ModtimeAndDigest,
    /// Content digest only.
    DigestOnly,
}

/// Options controlling one engine run.
///
/// Construct with [`Options::new`] and refine with the fluent setters, the
/// way the engine builder in the wider workspace does.
#[derive(Debug, Clone)]
pub struct Options {
    /// Maximum number of rule bodies executing at once.
    pub parallelism: usize,
    /// Keep going past failures and report them all at the end.
    pub staunch: bool,
    /// Read/write auditing mode.
    pub lint: LintMode,
    /// Default verbosity for every rule body.
    pub verbosity: Verbosity,
    /// Where to write the profile report, if anywhere.
    pub report_file: Option<PathBuf>,
    /// On-disk dependency database location.
    pub db_file: PathBuf,
    /// Build-wide timeout applied at the outermost wait.
    pub timeout: Option<Duration>,
    /// Change-detection mode surfaced to outer rule layers.
    pub change_mode: ChangeMode,
    /// Top-level keys the build must produce.
    pub wants: Vec<Key>,
}

impl Options {
    /// Creates options with defaults: parallelism = available cores, no
    /// staunch, no lint, [`Verbosity::Normal`], no report, no timeout,
    /// [`ChangeMode::ModtimeAndDigest`].
    pub fn new(db_file: impl Into<PathBuf>) -> Self {
        Self {
            parallelism: default_parallelism(),
            staunch: false,
            lint: LintMode::None,
            verbosity: Verbosity::Normal,
            report_file: None,
            db_file: db_file.into(),
            timeout: None,
            change_mode: ChangeMode::ModtimeAndDigest,
            wants: Vec::new(),
        }
    }

    /// Sets the worker count.
    #[must_use]
    pub fn with_parallelism(mut self, n: usize) -> Self {
        self.parallelism = n;
        self
    }

    /// Enables or disables staunch mode.
    #[must_use]
    pub fn with_staunch(mut self, staunch: bool) -> Self {
        self.staunch = staunch;
        self
    }

    /// Selects a lint mode.
    #[must_use]
    pub fn with_lint(mut self, lint: LintMode) -> Self {
        self.lint = lint;
        self
    }

    /// Selects the default verbosity.
    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    /// Requests a profile report at the given path.
    #[must_use]
    pub fn with_report_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.report_file = Some(path.into());
        self
    }

    /// Applies a build-wide timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Selects the change-detection mode.
    #[must_use]
    pub fn with_change_mode(mut self, mode: ChangeMode) -> Self {
        self.change_mode = mode;
        self
    }

    /// Adds top-level wants.
    #[must_use]
    pub fn with_wants(mut self, wants: impl IntoIterator<Item = Key>) -> Self {
        self.wants.extend(wants);
        self
    }
}

/// Returns the default worker count.
///
/// Precedence:
/// 1. `FORGE_WORKERS` environment variable (if set and valid)
/// 2. `available_parallelism()`
fn default_parallelism() -> usize {
    if let Ok(val) = std::env::var("FORGE_WORKERS") {
        if let Ok(n) = val.parse::<usize>() {
            return n.max(1);
        }
    }
    std::thread::available_parallelism()
        .map(std::num::NonZero::get)
        .unwrap_or(1)
}
