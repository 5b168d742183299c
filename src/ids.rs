use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Separator between the parts of a chunk id.
const CHUNK_ID_SEPARATOR: char = ':';

/// Hex characters of the content fingerprint embedded in chunk ids.
const FINGERPRINT_CHARS: usize = 8;

/// A validated document identifier such as `RI-2024Q4`.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    /// Validate and wrap a document identifier.
    ///
    /// Identifiers must be non-empty and may not contain whitespace or the
    /// chunk id separator (`:`).
    pub fn new(raw: &str) -> Result<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return Err(Error::ingestion(raw, "document id is empty"));
        }
        if trimmed
            .chars()
            .any(|c| c.is_whitespace() || c == CHUNK_ID_SEPARATOR)
        {
            return Err(Error::ingestion(
                raw,
                "document id may not contain whitespace or ':'",
            ));
        }
        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for DocumentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Content fingerprint of a normalized document (blake3, hex).
pub fn fingerprint(content: &str) -> String {
    blake3::hash(content.as_bytes()).to_hex().to_string()
}

/// Build a chunk id from its document, the document fingerprint and the
/// chunk's byte offset in the page stream.
///
/// The offset is zero-padded so lexical order follows document order, and
/// the fingerprint keeps ids of a superseding edition distinct from the
/// edition it replaces.
///
/// # Examples
///
/// ```
/// use lastro::ids::{DocumentId, chunk_id};
///
/// let doc = DocumentId::new("RI-2024Q4").unwrap();
/// let id = chunk_id(&doc, "0123456789abcdef", 42);
/// assert_eq!(id, "RI-2024Q4:01234567:00000042");
/// ```
pub fn chunk_id(document: &DocumentId, fingerprint: &str, offset: usize) -> String {
    let short = fingerprint
        .char_indices()
        .nth(FINGERPRINT_CHARS)
        .map_or(fingerprint, |(end, _)| &fingerprint[..end]);
    format!("{document}{CHUNK_ID_SEPARATOR}{short}{CHUNK_ID_SEPARATOR}{offset:08}")
}

/// Recover the document id part of a chunk id.
pub fn document_of_chunk(chunk_id: &str) -> Option<&str> {
    chunk_id.split(CHUNK_ID_SEPARATOR).next().filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn document_id_trims_and_validates() {
        let id = DocumentId::new("  RI-2024Q4 ").unwrap();
        assert_eq!(id.as_str(), "RI-2024Q4");
        assert!(DocumentId::new("").is_err());
        assert!(DocumentId::new("RI 2024").is_err());
        assert!(DocumentId::new("RI:2024").is_err());
    }

    #[test]
    fn fingerprint_is_deterministic() {
        assert_eq!(fingerprint("abc"), fingerprint("abc"));
        assert_ne!(fingerprint("abc"), fingerprint("abd"));
        assert_eq!(fingerprint("abc").len(), 64);
    }

    #[test]
    fn chunk_ids_sort_by_offset() {
        let doc = DocumentId::new("RPM-2025Q1").unwrap();
        let fp = fingerprint("content");
        let a = chunk_id(&doc, &fp, 900);
        let b = chunk_id(&doc, &fp, 10_000);
        assert!(a < b);
    }

    #[test]
    fn editions_get_distinct_chunk_ids() {
        let doc = DocumentId::new("RI-2024Q4").unwrap();
        let old = chunk_id(&doc, &fingerprint("first edition"), 0);
        let new = chunk_id(&doc, &fingerprint("second edition"), 0);
        assert_ne!(old, new);
    }

    #[test]
    fn chunk_id_shortens_by_characters() {
        let doc = DocumentId::new("RI-2024Q4").unwrap();
        assert_eq!(chunk_id(&doc, "ééééééééé", 0), "RI-2024Q4:éééééééé:00000000");
        assert_eq!(chunk_id(&doc, "abc", 1), "RI-2024Q4:abc:00000001");
    }

    #[test]
    fn document_of_chunk_roundtrip() {
        let doc = DocumentId::new("RI-2024Q4").unwrap();
        let id = chunk_id(&doc, &fingerprint("x"), 7);
        assert_eq!(document_of_chunk(&id), Some("RI-2024Q4"));
        assert_eq!(document_of_chunk(""), None);
    }
}
