//! Documents, pages and chunks: the units the index is built from.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{
    error::{Error, Result},
    ids::DocumentId,
};

/// Edition date of a quarterly report (`YYYY-MM`).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(try_from = "String", into = "String")]
pub struct ReportDate {
    pub year: u16,
    pub month: u8,
}

impl ReportDate {
    pub fn new(year: u16, month: u8) -> Result<Self> {
        if !(1..=12).contains(&month) {
            return Err(Error::Config(format!("invalid month {month} in report date")));
        }
        Ok(Self { year, month })
    }

    /// Calendar quarter (1-4) the edition closes.
    pub fn quarter(&self) -> u8 {
        self.month.div_ceil(3)
    }
}

impl std::str::FromStr for ReportDate {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (year, month) = s
            .trim()
            .split_once('-')
            .ok_or_else(|| Error::Config(format!("expected YYYY-MM, got '{s}'")))?;
        let year = year
            .parse()
            .map_err(|_| Error::Config(format!("invalid year in '{s}'")))?;
        let month = month
            .parse()
            .map_err(|_| Error::Config(format!("invalid month in '{s}'")))?;
        Self::new(year, month)
    }
}

impl TryFrom<String> for ReportDate {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<ReportDate> for String {
    fn from(value: ReportDate) -> Self {
        value.to_string()
    }
}

impl std::fmt::Display for ReportDate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:04}-{:02}", self.year, self.month)
    }
}

/// A document as handed over by the acquisition side: page boundaries are
/// already resolved, text is still raw.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawDocument {
    pub id: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub published: Option<ReportDate>,
    #[serde(default)]
    pub source: Option<PathBuf>,
    pub pages: Vec<String>,
}

/// One page of normalized text. Page numbers are 1-based.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page {
    pub number: u32,
    pub text: String,
}

/// An ingested document. Immutable; a new edition supersedes it as a whole.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: DocumentId,
    pub title: String,
    pub published: Option<ReportDate>,
    pub source: Option<String>,
    /// blake3 hex digest of the normalized page stream.
    pub fingerprint: String,
    pub pages: Vec<Page>,
}

impl Document {
    pub fn page(&self, number: u32) -> Option<&Page> {
        self.pages.iter().find(|p| p.number == number)
    }
}

/// The unit of retrieval.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: String,
    pub document_id: DocumentId,
    pub first_page: u32,
    pub last_page: u32,
    /// Byte offset of the chunk in the document's page stream.
    pub start: usize,
    /// Exclusive end offset in the page stream.
    pub end: usize,
    pub text: String,
}

impl Chunk {
    pub fn spans_pages(&self) -> bool {
        self.first_page != self.last_page
    }

    /// Length of the byte range shared with `other`, if both come from
    /// the same document.
    pub fn overlap_with(&self, other: &Chunk) -> usize {
        if self.document_id != other.document_id {
            return 0;
        }
        self.end.min(other.end).saturating_sub(self.start.max(other.start))
    }

    /// Human-readable page reference ("p. 4" or "pp. 4-5").
    pub fn page_label(&self) -> String {
        page_label(self.first_page, self.last_page)
    }
}

pub fn page_label(first: u32, last: u32) -> String {
    if first == last {
        format!("p. {first}")
    } else {
        format!("pp. {first}-{last}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(doc: &str, start: usize, end: usize) -> Chunk {
        Chunk {
            id: format!("{doc}:x:{start:08}"),
            document_id: DocumentId::new(doc).unwrap(),
            first_page: 1,
            last_page: 1,
            start,
            end,
            text: "x".repeat(end - start),
        }
    }

    #[test]
    fn report_date_parse_and_display() {
        let date: ReportDate = "2024-12".parse().unwrap();
        assert_eq!(date, ReportDate { year: 2024, month: 12 });
        assert_eq!(date.to_string(), "2024-12");
        assert_eq!(date.quarter(), 4);
        assert!("2024-13".parse::<ReportDate>().is_err());
        assert!("2024".parse::<ReportDate>().is_err());
    }

    #[test]
    fn report_dates_order_chronologically() {
        let a: ReportDate = "2023-12".parse().unwrap();
        let b: ReportDate = "2024-03".parse().unwrap();
        assert!(a < b);
    }

    #[test]
    fn report_date_serde_as_string() {
        let date: ReportDate = "2025-03".parse().unwrap();
        let json = serde_json::to_string(&date).unwrap();
        assert_eq!(json, "\"2025-03\"");
        let back: ReportDate = serde_json::from_str(&json).unwrap();
        assert_eq!(back, date);
    }

    #[test]
    fn overlap_within_same_document() {
        let a = chunk("RI-2024Q4", 0, 100);
        let b = chunk("RI-2024Q4", 60, 160);
        let c = chunk("RI-2024Q3", 60, 160);
        assert_eq!(a.overlap_with(&b), 40);
        assert_eq!(a.overlap_with(&c), 0);
    }

    #[test]
    fn page_labels() {
        assert_eq!(page_label(4, 4), "p. 4");
        assert_eq!(page_label(4, 5), "pp. 4-5");
    }
}
