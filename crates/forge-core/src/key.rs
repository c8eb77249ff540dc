// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Erased keys and values.
//!
//! Rule authors work with strongly typed identifiers at the boundary; inside
//! the engine every key is erased to `(TypeTag, payload bytes)` plus a
//! printable form, so the database and the dispatcher stay homogeneous.
//! Typed façades re-cast at the boundary by owning the encoding of their
//! payload bytes.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;

use crate::ident::{make_fingerprint, Fingerprint, TypeTag};

/// An erased build key: the unit of addressing in the engine.
///
/// Keys are totally ordered and hashable over `(tag, payload)`; the printable
/// `text` takes no part in identity and exists for stacks, logs and the
/// profile report.
#[derive(Clone)]
pub struct Key {
    tag: TypeTag,
    payload: Bytes,
    text: String,
}

impl Key {
    /// Creates a key from a tag, a printable form, and an explicit payload.
    pub fn new(tag: TypeTag, text: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            tag,
            payload: payload.into(),
            text: text.into(),
        }
    }

    /// Creates a key whose payload is the UTF-8 bytes of its printable form.
    ///
    /// This is the common case for path-like and query-like keys.
    pub fn from_text(tag: TypeTag, text: impl Into<String>) -> Self {
        let text = text.into();
        let payload = Bytes::from(text.clone().into_bytes());
        Self { tag, payload, text }
    }

    /// Rule-type tag this key dispatches on.
    #[must_use]
    pub fn tag(&self) -> TypeTag {
        self.tag
    }

    /// Erased payload bytes.
    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Printable form of the key.
    #[must_use]
    pub fn text(&self) -> &str {
        &self.text
    }

    /// Content fingerprint used as the database index.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        make_fingerprint(&self.tag, &self.payload)
    }
}

impl PartialEq for Key {
    fn eq(&self, other: &Self) -> bool {
        self.tag == other.tag && self.payload == other.payload
    }
}

impl Eq for Key {}

impl PartialOrd for Key {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Key {
    fn cmp(&self, other: &Self) -> Ordering {
        self.tag
            .cmp(&other.tag)
            .then_with(|| self.payload.cmp(&other.payload))
    }
}

impl std::hash::Hash for Key {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.tag.hash(state);
        self.payload.hash(state);
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Key").field("text", &self.text).finish_non_exhaustive()
    }
}

/// An erased rule output: an opaque payload round-trippable through bytes.
///
/// Values carry no schema; their rule's comparator is the only component
/// that interprets them. The default comparator is byte equality.
#[derive(Clone, PartialEq, Eq)]
pub struct Value {
    bytes: Bytes,
}

impl Value {
    /// Wraps raw bytes as a value.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    /// Convenience constructor for UTF-8 string payloads.
    pub fn from_text(text: impl AsRef<str>) -> Self {
        Self {
            bytes: Bytes::from(text.as_ref().as_bytes().to_vec()),
        }
    }

    /// Serialised form of the value.
    #[must_use]
    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Interprets the payload as UTF-8 text, if it is.
    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        std::str::from_utf8(&self.bytes).ok()
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_text() {
            Some(text) => write!(f, "Value({text:?})"),
            None => write!(f, "Value({} bytes)", self.bytes.len()),
        }
    }
}
