// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Lint tracking: auditing reads and writes against declared dependencies.
//!
//! Tracked reads are justified immediately when the rule reads its own
//! output, has already applied the key, or an allow predicate matches.
//! Anything else is tentative and resolved when the rule finishes: by then
//! the key must have been applied and must be a source key (no stored
//! dependencies of its own), otherwise the read happened before the apply
//! that authorised it. Tracked writes outside the rule's own key go into a
//! build-wide absent-owner map, reported after the build.

use crate::action::Action;
use crate::context::lock;
use crate::error::{EngineError, LintKind};
use crate::key::Key;

/// Records a tracked read; cheap checks now, the rest at rule finish.
pub(crate) fn track_read(action: &mut Action, keys: &[Key]) {
    if !action.global.options.lint.enabled() {
        return;
    }
    for key in keys {
        if action.local.stack.top() == Some(key) {
            continue; // reading its own output
        }
        if action.local.applied.contains(&key.fingerprint()) {
            continue; // already depended upon
        }
        if action.local.lint_allow.iter().any(|pred| pred(key)) {
            continue;
        }
        action.local.lint_pending.push(key.clone());
    }
}

/// Records a tracked write; anything the rule does not own goes into the
/// build-wide absent map.
pub(crate) fn track_write(action: &mut Action, keys: &[Key]) {
    if !action.global.options.lint.enabled() {
        return;
    }
    for key in keys {
        if action.local.stack.top() == Some(key) {
            continue;
        }
        if action.local.lint_allow.iter().any(|pred| pred(key)) {
            continue;
        }
        let owner = action
            .local
            .stack
            .top()
            .map_or_else(|| "self".to_owned(), |k| k.text().to_owned());
        lock(&action.global.lint_absent).insert((owner, key.text().to_owned()), ());
    }
}

/// Deferred check at rule finish: every tentative read must by now be an
/// applied source key.
///
/// # Errors
///
/// Returns the first [`EngineError::Lint`] violation: a read that was
/// never depended upon, or one that was depended upon only after being
/// used (the key has dependencies of its own, so it is no source key).
pub(crate) fn finished(action: &Action) -> Result<(), EngineError> {
    let owner = action
        .local
        .stack
        .top()
        .map_or_else(|| "top-level".to_owned(), |k| k.text().to_owned());
    for key in &action.local.lint_pending {
        if action.local.lint_allow.iter().any(|pred| pred(key)) {
            continue; // an allow predicate arrived after the read
        }
        if action.local.applied.contains(&key.fingerprint()) {
            let has_deps = lock(&action.global.db)
                .snapshot(key.fingerprint())
                .is_some_and(|(_, entry)| entry.deps.iter().any(|group| !group.is_empty()));
            if has_deps {
                return Err(EngineError::Lint {
                    kind: LintKind::DependedAfterUse,
                    key: key.text().to_owned(),
                    owner,
                });
            }
        } else {
            return Err(EngineError::Lint {
                kind: LintKind::UsedNotDepended,
                key: key.text().to_owned(),
                owner,
            });
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use std::sync::Arc;

    use super::*;
    use crate::context::{Global, Stack};
    use crate::db::Database;
    use crate::ident::make_type_tag;
    use crate::key::Value;
    use crate::options::{LintMode, Options};
    use crate::output::{NullSink, OutputGate};
    use crate::pool::Pool;
    use crate::registry::Rules;

    fn key(name: &str) -> Key {
        Key::from_text(make_type_tag("t"), name)
    }

    fn action_for(stack_key: &Key, db: Database) -> Action {
        let options = Options::new("unused.db").with_lint(LintMode::Basic);
        let global = Arc::new(Global::new(
            options,
            Rules::new(),
            db,
            Pool::new(1),
            OutputGate::new(Arc::new(NullSink)),
        ));
        Action::for_rule(global, Stack::default().push(stack_key.clone()))
    }

    #[test]
    fn reading_own_output_is_always_valid() {
        let own = key("self");
        let mut action = action_for(&own, Database::fresh());
        track_read(&mut action, std::slice::from_ref(&own));
        assert!(action.local.lint_pending.is_empty());
        assert!(finished(&action).is_ok());
    }

    #[test]
    fn applied_keys_are_valid_reads() {
        let own = key("self");
        let dep = key("dep");
        let mut action = action_for(&own, Database::fresh());
        action.local.applied.insert(dep.fingerprint());
        track_read(&mut action, std::slice::from_ref(&dep));
        assert!(action.local.lint_pending.is_empty());
    }

    #[test]
    fn allow_predicate_exempts_reads() {
        let own = key("self");
        let other = key("generated/header.h");
        let mut action = action_for(&own, Database::fresh());
        action
            .local
            .lint_allow
            .push(Arc::new(|k: &Key| k.text().starts_with("generated/")));
        track_read(&mut action, std::slice::from_ref(&other));
        assert!(action.local.lint_pending.is_empty());
    }

    #[test]
    fn unapplied_read_is_used_not_depended() {
        let own = key("self");
        let dep = key("dep");
        let mut action = action_for(&own, Database::fresh());
        track_read(&mut action, std::slice::from_ref(&dep));
        let err = finished(&action).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Lint {
                kind: LintKind::UsedNotDepended,
                ..
            }
        ));
    }

    #[test]
    fn deferred_read_of_source_key_is_valid() {
        let own = key("self");
        let dep = key("dep");
        let mut db = Database::fresh();
        db.record(&dep, Value::from_text("v"), 1, 1, vec![], 0.0, vec![]);
        let mut action = action_for(&own, db);
        track_read(&mut action, std::slice::from_ref(&dep));
        // The apply arrives after the read; dep is a source key.
        action.local.applied.insert(dep.fingerprint());
        assert!(finished(&action).is_ok());
    }

    #[test]
    fn deferred_read_of_derived_key_is_depended_after_use() {
        let own = key("self");
        let source = key("source");
        let derived = key("derived");
        let mut db = Database::fresh();
        let src_id = db.record(&source, Value::from_text("s"), 1, 1, vec![], 0.0, vec![]);
        db.record(
            &derived,
            Value::from_text("d"),
            1,
            1,
            vec![vec![src_id]],
            0.0,
            vec![],
        );
        let mut action = action_for(&own, db);
        track_read(&mut action, std::slice::from_ref(&derived));
        action.local.applied.insert(derived.fingerprint());
        let err = finished(&action).unwrap_err();
        assert!(matches!(
            err,
            EngineError::Lint {
                kind: LintKind::DependedAfterUse,
                ..
            }
        ));
    }

    #[test]
    fn unowned_write_lands_in_the_absent_map() {
        let own = key("writer");
        let other = key("other");
        let mut action = action_for(&own, Database::fresh());
        track_write(&mut action, std::slice::from_ref(&own));
        track_write(&mut action, std::slice::from_ref(&other));
        let absent = lock(&action.global.lint_absent);
        assert_eq!(absent.len(), 1);
        let ((owner, key_text), ()) = absent.iter().next().unwrap();
        assert_eq!(owner, "writer");
        assert_eq!(key_text, "other");
    }
}
