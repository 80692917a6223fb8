//! RPC plumbing for the CSI plug-in runtime.
//!
//! This crate carries no CSI-specific knowledge beyond the shape of a unary
//! exchange. It provides the pieces the transport layer is assembled from:
//!
//! | Module | Purpose |
//! |---|---|
//! | [`status`] | gRPC-compatible [`Status`]/[`Code`] surfaced on the wire. |
//! | [`envelope`] | Header block + payload encoding for one exchange. |
//! | [`frame`] | Unary frame protocol over any `AsyncRead`/`AsyncWrite`. |

use std::collections::BTreeMap;

pub mod envelope;
pub mod frame;
pub mod status;

pub use envelope::EnvelopeError;
pub use frame::{read_method, write_method, Frame, FrameReader, FrameWriter};
pub use status::{Code, Status};

/// Request/response header entries.
///
/// CSI exchanges carry a handful of short textual headers (the request id
/// under `csi.requestid`, the call budget under `csi.timeout`), so this is a
/// plain string map. Backed by a `BTreeMap` so the wire encoding is
/// deterministic. Size ceilings are enforced when an envelope is encoded,
/// not on insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetaData {
    /// Header entries by name
    entries: BTreeMap<String, String>,
}

impl MetaData {
    /// Create an empty header map.
    #[must_use]
    #[inline]
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Create a header map holding a single entry.
    #[must_use]
    pub fn with_entry(name: impl Into<String>, value: impl Into<String>) -> Self {
        let mut meta = Self::new();
        meta.insert(name, value);
        meta
    }

    /// Insert an entry, replacing any previous value under the same name.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(name.into(), value.into());
    }

    /// Look an entry up by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&str> {
        self.entries.get(name).map(String::as_str)
    }

    /// Remove an entry, returning its previous value if any.
    pub fn remove(&mut self, name: &str) -> Option<String> {
        self.entries.remove(name)
    }

    /// Whether the map has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Iterate over all entries, sorted by name.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .map(|(name, value)| (name.as_str(), value.as_str()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_remove() {
        let mut meta = MetaData::new();
        meta.insert("csi.requestid", "42");
        meta.insert("csi.timeout", "1000");

        assert_eq!(meta.len(), 2);
        assert_eq!(meta.get("csi.requestid"), Some("42"));
        assert_eq!(meta.get("missing"), None);

        assert_eq!(meta.remove("csi.timeout"), Some("1000".to_owned()));
        assert_eq!(meta.len(), 1);
    }

    #[test]
    fn with_entry_holds_one() {
        let meta = MetaData::with_entry("csi.requestid", "7");
        assert_eq!(meta.len(), 1);
        assert_eq!(meta.get("csi.requestid"), Some("7"));
    }

    #[test]
    fn insert_replaces_previous_value() {
        let mut meta = MetaData::new();
        meta.insert("csi.requestid", "1");
        meta.insert("csi.requestid", "2");
        assert_eq!(meta.len(), 1);
        assert_eq!(meta.get("csi.requestid"), Some("2"));
    }

    #[test]
    fn iteration_is_sorted_by_name() {
        let mut meta = MetaData::new();
        meta.insert("b", "2");
        meta.insert("a", "1");
        let names: Vec<&str> = meta.iter().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["a", "b"]);
    }
}
