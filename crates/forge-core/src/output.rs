// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Output sink trait for build messages without coupling to I/O.
//!
//! Rule emissions flow through this trait, so adapters decide where lines
//! go (stderr, a file, a test buffer). The engine serialises every emission
//! behind one gate, so lines from concurrent rules never interleave.

use std::io::Write;
use std::sync::{Arc, Mutex};

use crate::options::Verbosity;

/// Destination for build messages.
///
/// Implementations receive whole lines together with the level they were
/// emitted at; the caller has already applied the verbosity gate.
pub trait OutputSink: Send + Sync {
    /// Writes one line.
    fn write_line(&self, verbosity: Verbosity, line: &str);
}

/// Sink that writes to standard error, one line per emission.
#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl OutputSink for StderrSink {
    fn write_line(&self, _verbosity: Verbosity, line: &str) {
        let stderr = std::io::stderr();
        let mut handle = stderr.lock();
        let _ = writeln!(handle, "{line}");
    }
}

/// Sink that discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl OutputSink for NullSink {
    fn write_line(&self, _verbosity: Verbosity, _line: &str) {}
}

/// Sink that collects lines in memory, for tests.
#[derive(Debug, Default)]
pub struct MemorySink {
    lines: Mutex<Vec<(Verbosity, String)>>,
}

impl MemorySink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every line captured so far, in emission order.
    #[must_use]
    pub fn lines(&self) -> Vec<(Verbosity, String)> {
        self.lines.lock().map(|g| g.clone()).unwrap_or_default()
    }
}

impl OutputSink for MemorySink {
    fn write_line(&self, verbosity: Verbosity, line: &str) {
        if let Ok(mut guard) = self.lines.lock() {
            guard.push((verbosity, line.to_owned()));
        }
    }
}

/// Globally serialised gate in front of a sink.
///
/// Emissions are FIFO by the time the emitting rule reached the gate, which
/// keeps concurrent rules' lines whole and ordered.
pub(crate) struct OutputGate {
    sink: Mutex<Arc<dyn OutputSink>>,
}

impl OutputGate {
    pub(crate) fn new(sink: Arc<dyn OutputSink>) -> Self {
        Self {
            sink: Mutex::new(sink),
        }
    }

    /// Writes one line through the gate. The caller applies the verbosity
    /// gate; this only guarantees serialisation.
    pub(crate) fn emit(&self, verbosity: Verbosity, line: &str) {
        if let Ok(sink) = self.sink.lock() {
            sink.write_line(verbosity, line);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_sink_preserves_emission_order() {
        let sink = MemorySink::new();
        sink.write_line(Verbosity::Normal, "first");
        sink.write_line(Verbosity::Loud, "second");
        let lines = sink.lines();
        assert_eq!(lines[0].1, "first");
        assert_eq!(lines[1].1, "second");
    }
}
