// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Error types for the build engine.
use std::fmt;

use thiserror::Error;

/// Kinds of lint violation the audit can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LintKind {
    /// A tracked read was never justified by a dependency.
    UsedNotDepended,
    /// The dependency arrived, but only after the value had been read, and
    /// the read key has dependencies of its own.
    DependedAfterUse,
    /// A tracked write to a key the rule does not own.
    UnownedWrite,
}

impl fmt::Display for LintKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LintKind::UsedNotDepended => f.write_str("value was used but not depended upon"),
            LintKind::DependedAfterUse => f.write_str("depended upon after being used"),
            LintKind::UnownedWrite => f.write_str("wrote to a key outside the rule's ownership"),
        }
    }
}

/// Errors emitted by the engine.
///
/// Errors raised inside a rule body propagate unchanged to every caller
/// awaiting that rule's key, so the type is `Clone` and shared behind an
/// `Arc` internally.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    /// A rule body raised an application-level failure.
    #[error("{}", render_stacked(.stack, .message))]
    User {
        /// The failure message the rule raised.
        message: String,
        /// Dependency stack, most-recent-first.
        stack: Vec<String>,
    },
    /// A dependency cycle was detected before any rule in it ran twice.
    #[error("dependency cycle detected:\n{}", render_frames(.stack))]
    Cycle {
        /// The requesting stack up to and including the repeated key.
        stack: Vec<String>,
    },
    /// No registered rule matched a key.
    #[error("no rule matched key: {key}")]
    MissingRule {
        /// Printable form of the unmatched key.
        key: String,
    },
    /// The lint audit found an undeclared use or an unowned write.
    #[error("lint: {kind}: {key} (rule {owner})")]
    Lint {
        /// Which audit tripped.
        kind: LintKind,
        /// Printable form of the offending key.
        key: String,
        /// Printable form of the rule that owns the violation.
        owner: String,
    },
    /// `apply` was called inside a `block_apply` scope.
    #[error("apply is not allowed here: {reason}")]
    BlockedApply {
        /// The reason quoted by the blocking scope.
        reason: String,
    },
    /// The on-disk database failed to decode; deleting the file recovers.
    #[error("database corrupt ({detail}); delete the database file to rebuild")]
    DatabaseCorrupt {
        /// What the decoder tripped on.
        detail: String,
    },
    /// An engine invariant was violated; never expected.
    #[error("internal invariant violated: {0}")]
    Internal(&'static str),
}

impl EngineError {
    /// Convenience constructor for rule-raised failures; the engine fills
    /// in the dependency stack when the error crosses a rule boundary.
    pub fn user(message: impl Into<String>) -> Self {
        EngineError::User {
            message: message.into(),
            stack: Vec::new(),
        }
    }

    /// Attaches a dependency stack to a rule-raised failure that does not
    /// carry one yet. Other variants are returned unchanged.
    #[must_use]
    pub(crate) fn with_stack(self, frames: &[String]) -> Self {
        match self {
            EngineError::User { message, stack } if stack.is_empty() => EngineError::User {
                message,
                stack: frames.to_vec(),
            },
            other => other,
        }
    }

    /// Process exit status this error maps to: rule failures exit 1, user
    /// errors (bad options, cycles, lint, corrupt database) exit 2.
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self {
            EngineError::User { .. } | EngineError::BlockedApply { .. } => 1,
            EngineError::Cycle { .. }
            | EngineError::MissingRule { .. }
            | EngineError::Lint { .. }
            | EngineError::DatabaseCorrupt { .. }
            | EngineError::Internal(_) => 2,
        }
    }
}

fn render_frames(stack: &[String]) -> String {
    let mut out = String::new();
    for frame in stack {
        out.push_str("  * ");
        out.push_str(frame);
        out.push('\n');
    }
    out.pop();
    out
}

fn render_stacked(stack: &[String], message: &str) -> String {
    if stack.is_empty() {
        return message.to_owned();
    }
    let mut out = String::new();
    for frame in stack {
        out.push_str("* ");
        out.push_str(frame);
        out.push('\n');
    }
    out.push_str(message);
    out
}
