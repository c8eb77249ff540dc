// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Persistent dependency database.
//!
//! The database maps key fingerprints to entries: the last produced value,
//! the run counters, the recorded dependency groups, and the trace spans.
//! On disk it is a little-endian record stream behind a magic/version
//! prefix; a version mismatch discards the entries (full rebuild) rather
//! than attempting migration.
//!
//! # Determinism
//!
//! Encoding is fully deterministic: entries are written in id order, and
//! decode followed by encode reproduces the input bytes exactly.

use std::fmt;
use std::io::Write as _;
use std::path::Path;

use rustc_hash::FxHashMap;
use serde::Serialize;

use crate::error::EngineError;
use crate::ident::{EntryId, Fingerprint, TypeTag};
use crate::key::{Key, Value};

/// File magic for the on-disk database.
const MAGIC: &[u8; 8] = b"FORGEDB\0";

/// Schema version; bumping it invalidates existing databases.
const VERSION: u32 = 1;

/// A time-stamped span recorded inside a rule body, typically wrapping a
/// sub-process call. Times are seconds since the start of the build that
/// recorded the span.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TraceSpan {
    /// What the span wrapped, e.g. a command line.
    pub command: String,
    /// Span start, seconds since build start.
    pub start: f64,
    /// Span end, seconds since build start.
    pub stop: f64,
}

/// The persisted unit: one key's last build outcome.
#[derive(Debug, Clone)]
pub(crate) struct Entry {
    /// The erased key this entry belongs to.
    pub(crate) key: Key,
    /// Last produced value.
    pub(crate) value: Value,
    /// Run counter at which the rule last executed.
    pub(crate) built: u32,
    /// Run counter at which the value last differed.
    pub(crate) changed: u32,
    /// Dependency groups, one per `apply` call, in program order.
    pub(crate) deps: Vec<Vec<EntryId>>,
    /// Wall-clock seconds of the last execution.
    pub(crate) execution: f64,
    /// Trace spans recorded during the last execution.
    pub(crate) traces: Vec<TraceSpan>,
}

impl Entry {
    /// Flattened dependency ids in declaration order.
    pub(crate) fn flat_deps(&self) -> impl Iterator<Item = EntryId> + '_ {
        self.deps.iter().flatten().copied()
    }
}

/// In-memory image of the dependency database.
pub(crate) struct Database {
    /// Current run counter; entries built this run carry this value.
    run: u32,
    /// Entries indexed by compact id.
    entries: Vec<Entry>,
    /// Fingerprint index over `entries`.
    index: FxHashMap<Fingerprint, EntryId>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("run", &self.run)
            .field("entries", &self.entries.len())
            .finish_non_exhaustive()
    }
}

impl Database {
    /// Creates an empty database positioned at the first run.
    pub(crate) fn fresh() -> Self {
        Self {
            run: 1,
            entries: Vec::new(),
            index: FxHashMap::default(),
        }
    }

    /// Loads the database and advances it to the next run.
    ///
    /// A missing file or a schema-version mismatch yields a fresh database
    /// (full rebuild). Any other decode failure is reported as
    /// [`EngineError::DatabaseCorrupt`]; deleting the file recovers.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::DatabaseCorrupt`] when the file exists, has
    /// the current schema version, and still fails to decode.
    pub(crate) fn load(path: &Path) -> Result<Self, EngineError> {
        let bytes = match std::fs::read(path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Self::fresh());
            }
            Err(err) => {
                return Err(EngineError::DatabaseCorrupt {
                    detail: format!("unreadable: {err}"),
                })
            }
        };
        match Self::decode(&bytes) {
            Ok(mut db) => {
                db.run += 1;
                Ok(db)
            }
            Err(DecodeFailure::WrongVersion { found }) => {
                tracing::warn!(found, expected = VERSION, "database schema changed; rebuilding");
                Ok(Self::fresh())
            }
            Err(DecodeFailure::Corrupt(detail)) => Err(EngineError::DatabaseCorrupt { detail }),
        }
    }

    /// Writes the database back to disk.
    ///
    /// # Errors
    ///
    /// Propagates filesystem errors; encoding itself only fails on lengths
    /// beyond the format's u32 ranges, surfaced as [`EngineError::Internal`].
    pub(crate) fn save(&self, path: &Path) -> Result<(), EngineError> {
        let bytes = self.encode()?;
        let mut file = std::fs::File::create(path)
            .map_err(|err| EngineError::user(format!("cannot write {}: {err}", path.display())))?;
        file.write_all(&bytes)
            .map_err(|err| EngineError::user(format!("cannot write {}: {err}", path.display())))
    }

    /// Current run counter.
    pub(crate) fn run(&self) -> u32 {
        self.run
    }

    /// Number of entries.
    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    /// All entries in id order, for the report sink.
    pub(crate) fn entries(&self) -> &[Entry] {
        &self.entries
    }

    /// Looks up an entry by fingerprint, cloning it out.
    pub(crate) fn snapshot(&self, fp: Fingerprint) -> Option<(EntryId, Entry)> {
        let id = *self.index.get(&fp)?;
        Some((id, self.entries[id.index()].clone()))
    }

    /// Resolves dependency ids back to their keys.
    ///
    /// # Errors
    ///
    /// Returns [`EngineError::Internal`] if an id does not resolve; stored
    /// dependencies always refer to entries that existed when the list was
    /// frozen.
    pub(crate) fn dep_keys(&self, ids: &[EntryId]) -> Result<Vec<Key>, EngineError> {
        ids.iter()
            .map(|id| {
                self.entries
                    .get(id.index())
                    .map(|e| e.key.clone())
                    .ok_or(EngineError::Internal("dangling dependency id"))
            })
            .collect()
    }

    /// Marks a stored entry fresh this run without executing its rule.
    pub(crate) fn bump_built(&mut self, id: EntryId, run: u32) {
        if let Some(entry) = self.entries.get_mut(id.index()) {
            entry.built = run;
        }
    }

    /// Records a finished execution, inserting or replacing the entry, and
    /// returns its compact id.
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn record(
        &mut self,
        key: &Key,
        value: Value,
        built: u32,
        changed: u32,
        deps: Vec<Vec<EntryId>>,
        execution: f64,
        traces: Vec<TraceSpan>,
    ) -> EntryId {
        let fp = key.fingerprint();
        let entry = Entry {
            key: key.clone(),
            value,
            built,
            changed,
            deps,
            execution,
            traces,
        };
        if let Some(&id) = self.index.get(&fp) {
            self.entries[id.index()] = entry;
            id
        } else {
            let id = EntryId(self.entries.len() as u32);
            self.entries.push(entry);
            self.index.insert(fp, id);
            id
        }
    }

    // ------------------------------------------------------------------
    // Wire format
    // ------------------------------------------------------------------

    /// Serialises the database deterministically.
    pub(crate) fn encode(&self) -> Result<Vec<u8>, EngineError> {
        let mut out = Vec::new();
        out.extend_from_slice(MAGIC);
        put_u32(&mut out, VERSION);
        put_u32(&mut out, self.run);
        put_u32(&mut out, u32_len(self.entries.len())?);
        for entry in &self.entries {
            out.extend_from_slice(entry.key.tag().as_bytes());
            put_slice(&mut out, entry.key.payload())?;
            put_slice(&mut out, entry.key.text().as_bytes())?;
            put_slice(&mut out, entry.value.as_bytes())?;
            put_u32(&mut out, entry.built);
            put_u32(&mut out, entry.changed);
            put_u32(&mut out, u32_len(entry.deps.len())?);
            for group in &entry.deps {
                put_u32(&mut out, u32_len(group.len())?);
                for id in group {
                    put_u32(&mut out, id.0);
                }
            }
            put_u64(&mut out, entry.execution.to_bits());
            put_u32(&mut out, u32_len(entry.traces.len())?);
            for span in &entry.traces {
                put_slice(&mut out, span.command.as_bytes())?;
                put_u64(&mut out, span.start.to_bits());
                put_u64(&mut out, span.stop.to_bits());
            }
        }
        Ok(out)
    }

    /// Decodes a database image. The run counter is returned as stored;
    /// [`Database::load`] advances it.
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, DecodeFailure> {
        let mut r = Reader::new(bytes);
        let magic = r.take(MAGIC.len())?;
        if magic != MAGIC {
            return Err(DecodeFailure::Corrupt("bad magic".into()));
        }
        let version = r.u32()?;
        if version != VERSION {
            return Err(DecodeFailure::WrongVersion { found: version });
        }
        let run = r.u32()?;
        let count = r.u32()? as usize;
        let mut entries = Vec::with_capacity(count);
        let mut index = FxHashMap::default();
        for i in 0..count {
            let mut tag = [0u8; 32];
            tag.copy_from_slice(r.take(32)?);
            let tag = TypeTag(tag);
            let payload = r.slice()?.to_vec();
            let text = String::from_utf8(r.slice()?.to_vec())
                .map_err(|_| DecodeFailure::Corrupt("key text is not UTF-8".into()))?;
            let key = Key::new(tag, text, payload);
            let value = Value::from_bytes(r.slice()?.to_vec());
            let built = r.u32()?;
            let changed = r.u32()?;
            if changed > built {
                return Err(DecodeFailure::Corrupt("changed run exceeds built run".into()));
            }
            if built > run {
                return Err(DecodeFailure::Corrupt("built run exceeds the run counter".into()));
            }
            let group_count = r.u32()? as usize;
            let mut deps = Vec::with_capacity(group_count);
            for _ in 0..group_count {
                let len = r.u32()? as usize;
                let mut group = Vec::with_capacity(len);
                for _ in 0..len {
                    let id = r.u32()?;
                    if id as usize >= count {
                        return Err(DecodeFailure::Corrupt("dependency id out of range".into()));
                    }
                    group.push(EntryId(id));
                }
                deps.push(group);
            }
            let execution = f64::from_bits(r.u64()?);
            let trace_count = r.u32()? as usize;
            let mut traces = Vec::with_capacity(trace_count);
            for _ in 0..trace_count {
                let command = String::from_utf8(r.slice()?.to_vec())
                    .map_err(|_| DecodeFailure::Corrupt("trace command is not UTF-8".into()))?;
                let start = f64::from_bits(r.u64()?);
                let stop = f64::from_bits(r.u64()?);
                traces.push(TraceSpan {
                    command,
                    start,
                    stop,
                });
            }
            let fp = key.fingerprint();
            if index.insert(fp, EntryId(i as u32)).is_some() {
                return Err(DecodeFailure::Corrupt("duplicate key fingerprint".into()));
            }
            entries.push(Entry {
                key,
                value,
                built,
                changed,
                deps,
                execution,
                traces,
            });
        }
        if !r.is_empty() {
            return Err(DecodeFailure::Corrupt("trailing bytes".into()));
        }
        Ok(Self {
            run,
            entries,
            index,
        })
    }
}

/// Why a decode failed.
#[derive(Debug)]
pub(crate) enum DecodeFailure {
    /// Recognised file with a different schema version; entries are
    /// discarded, not upgraded.
    WrongVersion {
        /// The version found in the file.
        found: u32,
    },
    /// Anything else; actionable by deleting the database file.
    Corrupt(String),
}

fn u32_len(n: usize) -> Result<u32, EngineError> {
    u32::try_from(n).map_err(|_| EngineError::Internal("length exceeds wire format range"))
}

fn put_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_u64(out: &mut Vec<u8>, v: u64) {
    out.extend_from_slice(&v.to_le_bytes());
}

fn put_slice(out: &mut Vec<u8>, bytes: &[u8]) -> Result<(), EngineError> {
    put_u32(out, u32_len(bytes.len())?);
    out.extend_from_slice(bytes);
    Ok(())
}

/// Bounds-checked little-endian reader over the database image.
struct Reader<'a> {
    bytes: &'a [u8],
    at: usize,
}

impl<'a> Reader<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, at: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8], DecodeFailure> {
        let end = self
            .at
            .checked_add(n)
            .filter(|&end| end <= self.bytes.len())
            .ok_or_else(|| DecodeFailure::Corrupt("truncated".into()))?;
        let out = &self.bytes[self.at..end];
        self.at = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, DecodeFailure> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.take(4)?);
        Ok(u32::from_le_bytes(b))
    }

    fn u64(&mut self) -> Result<u64, DecodeFailure> {
        let mut b = [0u8; 8];
        b.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(b))
    }

    fn slice(&mut self) -> Result<&'a [u8], DecodeFailure> {
        let len = self.u32()? as usize;
        self.take(len)
    }

    fn is_empty(&self) -> bool {
        self.at == self.bytes.len()
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::ident::make_type_tag;

    fn sample() -> Database {
        let mut db = Database::fresh();
        let tag = make_type_tag("file");
        let a = Key::from_text(tag, "a.txt");
        let b = Key::from_text(tag, "b.txt");
        let a_id = db.record(&a, Value::from_text("A"), 1, 1, vec![], 0.25, vec![]);
        db.record(
            &b,
            Value::from_text("B(A)"),
            1,
            1,
            vec![vec![a_id]],
            1.5,
            vec![TraceSpan {
                command: "cc -o b".into(),
                start: 0.1,
                stop: 1.4,
            }],
        );
        db
    }

    #[test]
    fn decode_then_encode_is_byte_identical() {
        let db = sample();
        let bytes = db.encode().unwrap();
        let decoded = Database::decode(&bytes).unwrap();
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn record_reuses_ids_for_known_keys() {
        let mut db = sample();
        let tag = make_type_tag("file");
        let a = Key::from_text(tag, "a.txt");
        let before = db.len();
        let id = db.record(&a, Value::from_text("A'"), 2, 2, vec![], 0.1, vec![]);
        assert_eq!(db.len(), before);
        assert_eq!(id, EntryId(0));
        let (_, entry) = db.snapshot(a.fingerprint()).unwrap();
        assert_eq!(entry.value.as_text(), Some("A'"));
    }

    #[test]
    fn version_mismatch_yields_fresh_database() {
        let db = sample();
        let mut bytes = db.encode().unwrap();
        // Patch the version field (bytes 8..12).
        bytes[8] = 0xFF;
        assert!(matches!(
            Database::decode(&bytes),
            Err(DecodeFailure::WrongVersion { .. })
        ));
    }

    #[test]
    fn truncation_is_corrupt() {
        let db = sample();
        let bytes = db.encode().unwrap();
        let cut = &bytes[..bytes.len() - 3];
        assert!(matches!(
            Database::decode(cut),
            Err(DecodeFailure::Corrupt(_))
        ));
    }

    #[test]
    fn out_of_range_dependency_is_corrupt() {
        let mut db = Database::fresh();
        let tag = make_type_tag("file");
        let k = Key::from_text(tag, "k");
        // Forge an entry that references a nonexistent id.
        db.record(&k, Value::from_text("v"), 1, 1, vec![vec![EntryId(7)]], 0.0, vec![]);
        let bytes = db.encode().unwrap();
        assert!(matches!(
            Database::decode(&bytes),
            Err(DecodeFailure::Corrupt(_))
        ));
    }

    #[test]
    fn save_and_load_round_trip_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.db");
        let db = sample();
        db.save(&path).unwrap();
        let loaded = Database::load(&path).unwrap();
        // load advances the run counter for the new build.
        assert_eq!(loaded.run(), db.run() + 1);
        assert_eq!(loaded.len(), db.len());
    }

    #[test]
    fn missing_file_loads_fresh() {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::load(&dir.path().join("absent.db")).unwrap();
        assert_eq!(db.run(), 1);
        assert_eq!(db.len(), 0);
    }

    #[test]
    fn garbage_is_reported_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.db");
        std::fs::write(&path, b"not a forge database at all").unwrap();
        assert!(matches!(
            Database::load(&path),
            Err(EngineError::DatabaseCorrupt { .. })
        ));
    }

    #[test]
    fn truncated_current_version_file_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("forge.db");
        let bytes = sample().encode().unwrap();
        std::fs::write(&path, &bytes[..bytes.len() - 5]).unwrap();
        assert!(matches!(
            Database::load(&path),
            Err(EngineError::DatabaseCorrupt { .. })
        ));
    }
}
