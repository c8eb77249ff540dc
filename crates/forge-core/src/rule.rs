// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rule definitions.
use std::sync::Arc;

use crate::action::Action;
use crate::error::EngineError;
use crate::ident::TypeTag;
use crate::key::{Key, Value};

/// Verdict of a rule's value comparator.
///
/// The comparator is consulted after a rule body re-executes, with the value
/// stored from the previous run and the freshly produced one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueChange {
    /// The new value is the old value; dependents stay fresh and the entry's
    /// change run is untouched.
    Equal,
    /// The value differs; dependents must rebuild.
    Changed,
    /// The rule re-executed and produced a different representation that is
    /// equivalent for dependents; the new value is stored but the change run
    /// is untouched, so dependents do not rebuild.
    RebuiltButEquivalent,
}

/// Closure that produces a key's value inside an execution context.
pub type BuildFn = Arc<dyn Fn(&mut Action) -> Result<Value, EngineError> + Send + Sync>;

/// Closure that decides whether a key belongs to a rule, returning its
/// builder when it does.
pub type MatchFn = Arc<dyn Fn(&Key) -> Option<BuildFn> + Send + Sync>;

/// Closure comparing the stored value against a freshly produced one.
pub type CompareFn = Arc<dyn Fn(&Value, &Value) -> ValueChange + Send + Sync>;

/// Closure that cheaply re-derives a key's current value from the
/// environment, without running the rule body.
///
/// Source-like rules (file stats, oracle probes) supply one so the engine
/// can notice out-of-band changes; returning `None` marks the key stale
/// unconditionally. Rules without a probe are validated purely through
/// their recorded dependencies.
pub type StoredFn = Arc<dyn Fn(&Key) -> Option<Value> + Send + Sync>;

/// Descriptor for a build rule registered with the engine.
///
/// Each rule owns:
/// * the [`TypeTag`] of the key family it serves
/// * a human-readable name for logs and diagnostics
/// * callbacks for matching, comparison, and (optionally) stored-value probing
/// * a priority used when several definitions claim the same tag
pub struct RuleDef {
    /// Key family this rule serves.
    pub tag: TypeTag,
    /// Human-readable name for logs and diagnostics.
    pub name: &'static str,
    /// Callback deciding whether a key belongs to this rule.
    pub matcher: MatchFn,
    /// Callback comparing stored and fresh values.
    pub comparator: CompareFn,
    /// Optional cheap re-derivation of the current value.
    pub stored: Option<StoredFn>,
    /// Dispatch priority; higher wins when several definitions match.
    pub priority: u32,
}

impl RuleDef {
    /// Creates a rule with the default byte-equality comparator, no stored
    /// probe, and priority zero.
    pub fn new(tag: TypeTag, name: &'static str, matcher: MatchFn) -> Self {
        Self {
            tag,
            name,
            matcher,
            comparator: default_compare(),
            stored: None,
            priority: 0,
        }
    }

    /// Replaces the comparator.
    #[must_use]
    pub fn with_comparator(mut self, comparator: CompareFn) -> Self {
        self.comparator = comparator;
        self
    }

    /// Installs a stored-value probe.
    #[must_use]
    pub fn with_stored(mut self, stored: StoredFn) -> Self {
        self.stored = Some(stored);
        self
    }

    /// Overrides the dispatch priority.
    #[must_use]
    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }
}

impl core::fmt::Debug for RuleDef {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("RuleDef")
            .field("tag", &self.tag)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .finish_non_exhaustive()
    }
}

/// Default comparator: serialised byte equality.
#[must_use]
pub fn default_compare() -> CompareFn {
    Arc::new(|old: &Value, new: &Value| {
        if old.as_bytes() == new.as_bytes() {
            ValueChange::Equal
        } else {
            ValueChange::Changed
        }
    })
}

/// Comparator that reports every rebuild as a change.
///
/// Useful for oracle-style rules whose dependents must always follow a
/// re-execution.
#[must_use]
pub fn always_changed() -> CompareFn {
    Arc::new(|_: &Value, _: &Value| ValueChange::Changed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_compare_is_byte_equality() {
        let cmp = default_compare();
        let a = Value::from_text("same");
        let b = Value::from_text("same");
        let c = Value::from_text("other");
        assert_eq!(cmp(&a, &b), ValueChange::Equal);
        assert_eq!(cmp(&a, &c), ValueChange::Changed);
    }

    #[test]
    fn always_changed_ignores_contents() {
        let cmp = always_changed();
        let a = Value::from_text("same");
        assert_eq!(cmp(&a, &a.clone()), ValueChange::Changed);
    }
}
