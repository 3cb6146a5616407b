//! Namespace-scoped cache keys for the shared LMDB cache.
//!
//! A single LMDB cache directory may hold entries for several record
//! namespaces. Keys cannot be built without a namespace, so two namespaces
//! that happen to use the same record key never see each other's entries.
//!
//! # Binary format
//!
//! ```text
//! [namespace: UTF-8][0xFF separator][record key: UTF-8]
//! ```
//!
//! `0xFF` never appears in valid UTF-8, so the separator is unambiguous.

use plumb_core::RecordKey;

const SEPARATOR: u8 = 0xFF;

/// A record key scoped to a namespace.
///
/// The fields are private so a key is only ever built through [`NamespacedKey::new`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NamespacedKey {
    inner: NamespacedKeyInner,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct NamespacedKeyInner {
    namespace: String,
    key: RecordKey,
}

impl NamespacedKey {
    pub fn new(namespace: impl Into<String>, key: RecordKey) -> Self {
        Self {
            inner: NamespacedKeyInner {
                namespace: namespace.into(),
                key,
            },
        }
    }

    pub fn namespace(&self) -> &str {
        &self.inner.namespace
    }

    pub fn key(&self) -> &RecordKey {
        &self.inner.key
    }

    /// Encode into the binary key layout.
    pub fn encode(&self) -> Vec<u8> {
        let ns = self.inner.namespace.as_bytes();
        let key = self.inner.key.as_bytes();
        let mut bytes = Vec::with_capacity(ns.len() + 1 + key.len());
        bytes.extend_from_slice(ns);
        bytes.push(SEPARATOR);
        bytes.extend_from_slice(key);
        bytes
    }

    /// Decode from bytes. Returns `None` on any malformed input.
    pub fn decode(bytes: &[u8]) -> Option<Self> {
        let split = bytes.iter().position(|b| *b == SEPARATOR)?;
        let namespace = std::str::from_utf8(&bytes[..split]).ok()?;
        let key = std::str::from_utf8(&bytes[split + 1..]).ok()?;
        let key = RecordKey::new(key).ok()?;
        Some(Self::new(namespace, key))
    }

    /// Prefix shared by every key in `namespace`, for prefix scans.
    pub fn namespace_prefix(namespace: &str) -> Vec<u8> {
        let mut prefix = Vec::with_capacity(namespace.len() + 1);
        prefix.extend_from_slice(namespace.as_bytes());
        prefix.push(SEPARATOR);
        prefix
    }
}
