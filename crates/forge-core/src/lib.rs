// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! forge-core: demand-driven, dependency-tracking build engine.
//!
//! Given rules mapping abstract keys to values and a set of top-level
//! wants, the engine produces the wanted values by running the minimum set
//! of rules whose inputs have changed since the last run, parallelising
//! independent work.
//!
//! The core is polymorphic over any key/value pair: keys are erased to
//! `(TypeTag, bytes)` and values to opaque bytes, so the database and the
//! dispatcher stay homogeneous while rule layers keep strong types at the
//! boundary. Work is always keyed, each key runs at most once per build,
//! and a rule declares its dependencies by calling [`Action::apply`] —
//! which also suspends it until those dependencies resolve.
//!
//! # Persistence
//!
//! Between runs the engine keeps every entry's value, the run counters at
//! which it was last executed and last changed, its dependency groups in
//! declaration order, and its trace spans. The on-disk format is versioned;
//! a schema mismatch triggers a full rebuild rather than a migration.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::dbg_macro,
    clippy::print_stdout
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::missing_const_for_fn,
    clippy::module_name_repetitions,
    clippy::cast_possible_truncation,
    clippy::missing_errors_doc
)]

mod action;
mod build;
mod context;
mod db;
mod error;
mod ident;
mod key;
mod lint;
mod options;
mod output;
mod pool;
mod progress;
mod registry;
mod report;
mod rule;
mod run;

// Re-exports for the stable public API.
pub use action::Action;
pub use db::TraceSpan;
pub use error::{EngineError, LintKind};
pub use ident::{make_fingerprint, make_type_tag, EntryId, Fingerprint, Hash, TypeTag};
pub use key::{Key, Value};
pub use options::{ChangeMode, LintMode, Options, Verbosity};
pub use output::{MemorySink, NullSink, OutputSink, StderrSink};
pub use progress::ProgressSnapshot;
pub use registry::Rules;
pub use rule::{
    always_changed, default_compare, BuildFn, CompareFn, MatchFn, RuleDef, StoredFn, ValueChange,
};
pub use run::{run, run_with_sink};
