// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Identifier and hashing utilities.
use blake3::Hasher;

/// Canonical 256-bit hash used throughout the engine for addressing rule
/// types and key fingerprints.
pub type Hash = [u8; 32];

/// Strongly typed identifier for a rule type.
///
/// `TypeTag` values are produced by [`make_type_tag`] which hashes a label;
/// using a dedicated wrapper prevents accidental mixing of rule-type tags
/// and key fingerprints. Every [`Key`](crate::Key) carries the tag of the
/// rule family that owns it, and the registry dispatches on it.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct TypeTag(pub Hash);

impl TypeTag {
    /// Returns the canonical byte representation of this tag.
    #[must_use]
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

/// Content fingerprint of an erased key, used as the database index.
///
/// Fingerprints are derived from the key's tag and payload bytes, so two
/// keys of different rule types never collide even when their payloads are
/// byte-identical.
#[repr(transparent)]
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct Fingerprint(pub Hash);

impl Fingerprint {
    /// Returns the canonical byte representation of this fingerprint.
    #[must_use]
    pub fn as_bytes(&self) -> &Hash {
        &self.0
    }
}

/// Compact, database-local entry identifier.
///
/// The database maps canonical 256-bit fingerprints to compact u32 handles
/// when an entry is first recorded. Dependency lists store these handles;
/// they are stable across runs for as long as the database file survives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EntryId(pub u32);

impl EntryId {
    /// Returns the handle as a plain index.
    #[must_use]
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Produces a stable, domain-separated rule-type tag (prefix `b"tag:"`) using BLAKE3.
pub fn make_type_tag(label: &str) -> TypeTag {
    let mut hasher = Hasher::new();
    hasher.update(b"tag:");
    hasher.update(label.as_bytes());
    TypeTag(hasher.finalize().into())
}

/// Produces the fingerprint of an erased key (prefix `b"key:"`) using BLAKE3.
pub fn make_fingerprint(tag: &TypeTag, payload: &[u8]) -> Fingerprint {
    let mut hasher = Hasher::new();
    hasher.update(b"key:");
    hasher.update(tag.as_bytes());
    hasher.update(payload);
    Fingerprint(hasher.finalize().into())
}
