// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Rule registry: tag-indexed dispatch with an explicit override policy.
use rustc_hash::FxHashMap;

use crate::error::EngineError;
use crate::ident::TypeTag;
use crate::key::Key;
use crate::rule::{BuildFn, CompareFn, RuleDef, StoredFn};

/// Process-scoped mapping from rule-type tag to rule definitions.
///
/// Several definitions may claim the same tag; dispatch picks the matching
/// definition with the highest priority, breaking ties by registration
/// order (earliest wins). This is the explicit override policy: a later
/// registration only displaces an earlier one by declaring a higher
/// priority.
#[derive(Debug, Default)]
pub struct Rules {
    by_tag: FxHashMap<TypeTag, Vec<RuleDef>>,
}

/// Dispatch result: everything the resolver needs to build one key.
#[derive(Clone)]
pub(crate) struct RuleHit {
    pub(crate) build: BuildFn,
    pub(crate) comparator: CompareFn,
    pub(crate) stored: Option<StoredFn>,
}

impl Rules {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule definition.
    pub fn add_rule(&mut self, def: RuleDef) {
        let defs = self.by_tag.entry(def.tag).or_default();
        // Stable insert keeping highest priority first; ties keep
        // registration order.
        let at = defs
            .iter()
            .position(|d| d.priority < def.priority)
            .unwrap_or(defs.len());
        defs.insert(at, def);
    }

    /// Number of registered definitions, across all tags.
    #[must_use]
    pub fn len(&self) -> usize {
        self.by_tag.values().map(Vec::len).sum()
    }

    /// Whether no definitions are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.by_tag.is_empty()
    }

    /// Dispatches a key to its owning rule.
    pub(crate) fn lookup(&self, key: &Key) -> Result<RuleHit, EngineError> {
        let defs = self.by_tag.get(&key.tag());
        for def in defs.into_iter().flatten() {
            if let Some(build) = (def.matcher)(key) {
                return Ok(RuleHit {
                    build,
                    comparator: def.comparator.clone(),
                    stored: def.stored.clone(),
                });
            }
        }
        Err(EngineError::MissingRule {
            key: key.text().to_owned(),
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use super::*;
    use crate::ident::make_type_tag;
    use crate::key::Value;
    use crate::rule::MatchFn;

    fn match_all(result: &'static str) -> MatchFn {
        Arc::new(move |_key: &Key| {
            let result = result;
            Some(Arc::new(move |_action: &mut crate::Action| {
                Ok(Value::from_text(result))
            }) as BuildFn)
        })
    }

    fn match_none() -> MatchFn {
        Arc::new(|_key: &Key| None)
    }

    #[test]
    fn missing_rule_is_an_error() {
        let tag = make_type_tag("file");
        let mut rules = Rules::new();
        rules.add_rule(RuleDef::new(tag, "never", match_none()));
        let err = rules.lookup(&Key::from_text(tag, "a.txt")).err().unwrap();
        assert!(matches!(err, EngineError::MissingRule { .. }));
    }

    #[test]
    fn unknown_tag_is_an_error() {
        let rules = Rules::new();
        let err = rules
            .lookup(&Key::from_text(make_type_tag("file"), "a.txt"))
            .err()
            .unwrap();
        assert!(matches!(err, EngineError::MissingRule { .. }));
    }

    #[test]
    fn higher_priority_wins_regardless_of_registration_order() {
        let tag = make_type_tag("file");
        let mut rules = Rules::new();
        rules.add_rule(RuleDef::new(tag, "base", match_all("base")));
        rules.add_rule(RuleDef::new(tag, "override", match_all("override")).with_priority(10));
        let hit = rules.lookup(&Key::from_text(tag, "a.txt")).unwrap();
        // Execute the matched builder outside an engine run just to read
        // its constant payload.
        let defs_pick = hit.build;
        drop(defs_pick);
        // Priority ordering is observable through definition order.
        let defs = rules.by_tag.get(&tag).unwrap();
        assert_eq!(defs[0].name, "override");
        assert_eq!(defs[1].name, "base");
    }

    #[test]
    fn ties_keep_registration_order() {
        let tag = make_type_tag("file");
        let mut rules = Rules::new();
        rules.add_rule(RuleDef::new(tag, "first", match_all("first")));
        rules.add_rule(RuleDef::new(tag, "second", match_all("second")));
        let defs = rules.by_tag.get(&tag).unwrap();
        assert_eq!(defs[0].name, "first");
    }
}
