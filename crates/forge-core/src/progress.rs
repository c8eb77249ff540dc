// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Build progress counters.
use std::sync::atomic::{AtomicUsize, Ordering};

/// Shared, lock-free progress counters sampled by rules.
#[derive(Debug, Default)]
pub(crate) struct Progress {
    built: AtomicUsize,
    skipped: AtomicUsize,
    failed: AtomicUsize,
    running: AtomicUsize,
}

impl Progress {
    pub(crate) fn note_built(&self) {
        self.built.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_skipped(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_failed(&self) {
        self.failed.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn enter_running(&self) {
        self.running.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn exit_running(&self) {
        self.running.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> ProgressSnapshot {
        ProgressSnapshot {
            built: self.built.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            running: self.running.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time sample of the build's progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSnapshot {
    /// Rule bodies executed to completion this run.
    pub built: usize,
    /// Entries validated fresh without executing.
    pub skipped: usize,
    /// Rule bodies that failed.
    pub failed: usize,
    /// Rule bodies currently executing.
    pub running: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let p = Progress::default();
        p.note_built();
        p.note_built();
        p.note_skipped();
        p.enter_running();
        let snap = p.snapshot();
        assert_eq!(snap.built, 2);
        assert_eq!(snap.skipped, 1);
        assert_eq!(snap.running, 1);
        p.exit_running();
        assert_eq!(p.snapshot().running, 0);
    }
}
