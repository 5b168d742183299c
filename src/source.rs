//! Discovery of raw report texts under the data directory.
//!
//! Acquisition and PDF extraction happen elsewhere; this module only finds
//! their output (`.txt` with form-feed page breaks, or `.json` records),
//! derives report identity from the bank's file naming, and selects which
//! files a batch should ingest.

use std::path::{Path, PathBuf};

use crate::{
    document::{RawDocument, ReportDate},
    error::{Error, Result},
};

/// Page separator emitted by `pdftotext`.
const FORM_FEED: char = '\x0c';

/// Supported file extensions for document discovery.
const SUPPORTED_EXTENSIONS: &[&str] = &["txt", "json"];

/// Identity derived from a report file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportIdentity {
    pub id: String,
    pub title: String,
    pub published: Option<ReportDate>,
}

/// Map a file stem to a report identity.
///
/// `ri202412p` is the Relatório de Inflação of December 2024 (`RI-2024Q4`);
/// `rpm202503p` the Relatório de Política Monetária of March 2025
/// (`RPM-2025Q1`). Any other stem is used verbatim as the id.
///
/// # Examples
///
/// ```
/// use lastro::source::identify;
///
/// let report = identify("ri202412p");
/// assert_eq!(report.id, "RI-2024Q4");
/// assert_eq!(report.title, "Relatório de Inflação 12/2024");
/// ```
pub fn identify(stem: &str) -> ReportIdentity {
    let lower = stem.to_ascii_lowercase();
    let families = [
        ("rpm", "RPM", "Relatório de Política Monetária"),
        ("ri", "RI", "Relatório de Inflação"),
    ];

    for (prefix, code, name) in families {
        let Some(rest) = lower.strip_prefix(prefix) else {
            continue;
        };
        let digits = rest.strip_suffix('p').unwrap_or(rest);
        if digits.len() != 6 || !digits.chars().all(|c| c.is_ascii_digit()) {
            continue;
        }
        let (Ok(year), Ok(month)) = (digits[..4].parse(), digits[4..].parse()) else {
            continue;
        };
        let Ok(date) = ReportDate::new(year, month) else {
            continue;
        };
        return ReportIdentity {
            id: format!("{code}-{}Q{}", date.year, date.quarter()),
            title: format!("{name} {:02}/{}", date.month, date.year),
            published: Some(date),
        };
    }

    ReportIdentity {
        id: stem.to_string(),
        title: stem.to_string(),
        published: None,
    }
}

/// A raw report file found under the raw directory.
#[derive(Debug, Clone)]
pub struct SourceFile {
    /// Path relative to the raw directory.
    pub relative_path: PathBuf,
    /// Fully resolved absolute path.
    pub absolute_path: PathBuf,
    pub identity: ReportIdentity,
}

/// Recursively walk a directory and discover report files.
///
/// Skips hidden files/directories (names starting with `.`) and only
/// returns files with supported extensions (.txt, .json).
pub fn discover(root: &Path) -> Result<Vec<SourceFile>> {
    let canonical_root = root.canonicalize()?;
    let mut results = Vec::new();
    walk_dir(&canonical_root, &canonical_root, &mut results)?;
    results.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(results)
}

fn walk_dir(root: &Path, current: &Path, results: &mut Vec<SourceFile>) -> Result<()> {
    for entry in std::fs::read_dir(current)? {
        let entry = entry?;
        let file_name = entry.file_name();
        if file_name.to_string_lossy().starts_with('.') {
            continue;
        }

        let path = entry.path();
        let file_type = entry.file_type()?;
        if file_type.is_dir() {
            walk_dir(root, &path, results)?;
        } else if (file_type.is_file() || path.is_file()) && is_supported(&path) {
            let stem = path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            results.push(SourceFile {
                relative_path: path.strip_prefix(root).unwrap_or(&path).to_path_buf(),
                identity: identify(stem),
                absolute_path: path,
            });
        }
    }
    Ok(())
}

fn is_supported(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| SUPPORTED_EXTENSIONS.contains(&ext))
}

/// Which discovered files a batch should ingest.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    /// Only the most recent `count` dated reports.
    pub count: Option<usize>,
    /// Inclusive lower bound on the edition date.
    pub from: Option<ReportDate>,
    /// Inclusive upper bound on the edition date.
    pub to: Option<ReportDate>,
    /// Glob over the path relative to the raw directory.
    pub pattern: Option<String>,
}

impl Selection {
    fn is_dated(&self) -> bool {
        self.count.is_some() || self.from.is_some() || self.to.is_some()
    }

    /// Filter `files`. Undated files are dropped by count and range
    /// selections. Dated selections come back in chronological order.
    pub fn apply(&self, files: Vec<SourceFile>) -> Result<Vec<SourceFile>> {
        let matcher = self
            .pattern
            .as_deref()
            .map(|pattern| {
                globset::Glob::new(pattern)
                    .map(|g| g.compile_matcher())
                    .map_err(|e| Error::Config(format!("invalid pattern '{pattern}': {e}")))
            })
            .transpose()?;

        let mut selected: Vec<SourceFile> = files
            .into_iter()
            .filter(|f| {
                matcher.as_ref().is_none_or(|m| {
                    m.is_match(&f.relative_path)
                        || f.relative_path
                            .file_name()
                            .is_some_and(|name| m.is_match(name))
                })
            })
            .filter(|f| {
                if !self.is_dated() {
                    return true;
                }
                let Some(date) = f.identity.published else {
                    return false;
                };
                self.from.is_none_or(|from| date >= from) && self.to.is_none_or(|to| date <= to)
            })
            .collect();

        if self.is_dated() {
            selected.sort_by(|a, b| {
                a.identity
                    .published
                    .cmp(&b.identity.published)
                    .then_with(|| a.relative_path.cmp(&b.relative_path))
            });
        }
        if let Some(count) = self.count {
            let skip = selected.len().saturating_sub(count);
            selected.drain(..skip);
        }

        Ok(selected)
    }
}

/// Read one source file into a raw document.
///
/// Any failure is reported as an ingestion error for that document.
pub fn read(file: &SourceFile) -> Result<RawDocument> {
    let fail = |reason: String| Error::ingestion(&file.identity.id, reason);

    let content = std::fs::read_to_string(&file.absolute_path)
        .map_err(|e| fail(format!("cannot read {}: {e}", file.absolute_path.display())))?;

    let is_json = file
        .absolute_path
        .extension()
        .is_some_and(|ext| ext == "json");

    let mut raw = if is_json {
        serde_json::from_str::<RawDocument>(&content)
            .map_err(|e| fail(format!("invalid JSON document: {e}")))?
    } else {
        let mut pages: Vec<String> = content.split(FORM_FEED).map(str::to_string).collect();
        if pages.len() > 1 && pages.last().is_some_and(|p| p.trim().is_empty()) {
            pages.pop();
        }
        RawDocument {
            id: file.identity.id.clone(),
            title: None,
            published: None,
            source: None,
            pages,
        }
    };

    if raw.id.trim().is_empty() {
        raw.id = file.identity.id.clone();
    }
    if raw.title.is_none() {
        raw.title = Some(file.identity.title.clone());
    }
    if raw.published.is_none() {
        raw.published = file.identity.published;
    }
    raw.source = Some(file.absolute_path.clone());

    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write(dir: &Path, name: &str, content: &str) {
        std::fs::write(dir.join(name), content).unwrap();
    }

    fn names(files: &[SourceFile]) -> Vec<String> {
        files
            .iter()
            .map(|f| f.relative_path.to_string_lossy().to_string())
            .collect()
    }

    #[test]
    fn identifies_report_families() {
        let ri = identify("ri202412p");
        assert_eq!(ri.id, "RI-2024Q4");
        assert_eq!(ri.published, Some(ReportDate::new(2024, 12).unwrap()));

        let rpm = identify("rpm202503p");
        assert_eq!(rpm.id, "RPM-2025Q1");
        assert_eq!(rpm.title, "Relatório de Política Monetária 03/2025");

        let other = identify("nota-tecnica");
        assert_eq!(other.id, "nota-tecnica");
        assert_eq!(other.published, None);

        assert_eq!(identify("ri202413p").published, None);
    }

    #[test]
    fn discovers_txt_and_json() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "ri202412p.txt", "a");
        write(tmp.path(), "rpm202503p.json", "{}");
        write(tmp.path(), "ri202412p.pdf", "binary");
        write(tmp.path(), ".hidden.txt", "secret");

        let files = discover(tmp.path()).unwrap();
        assert_eq!(names(&files), vec!["ri202412p.txt", "rpm202503p.json"]);
    }

    #[test]
    fn recurses_subdirectories() {
        let tmp = tempfile::tempdir().unwrap();
        let sub = tmp.path().join("2024");
        std::fs::create_dir(&sub).unwrap();
        write(&sub, "ri202406p.txt", "x");

        let files = discover(tmp.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].identity.id, "RI-2024Q2");
    }

    #[test]
    fn selection_by_count_keeps_most_recent() {
        let tmp = tempfile::tempdir().unwrap();
        for stem in ["ri202403p", "ri202406p", "ri202409p", "ri202412p", "notas"] {
            write(tmp.path(), &format!("{stem}.txt"), "x");
        }
        let files = discover(tmp.path()).unwrap();

        let selected = Selection {
            count: Some(2),
            ..Default::default()
        }
        .apply(files.clone())
        .unwrap();
        assert_eq!(names(&selected), vec!["ri202409p.txt", "ri202412p.txt"]);

        let all = Selection::default().apply(files).unwrap();
        assert_eq!(all.len(), 5);
    }

    #[test]
    fn selection_by_range_and_pattern() {
        let tmp = tempfile::tempdir().unwrap();
        for stem in ["ri202409p", "ri202412p", "rpm202503p", "rpm202506p"] {
            write(tmp.path(), &format!("{stem}.txt"), "x");
        }
        let files = discover(tmp.path()).unwrap();

        let selected = Selection {
            from: Some("2024-12".parse().unwrap()),
            to: Some("2025-03".parse().unwrap()),
            ..Default::default()
        }
        .apply(files.clone())
        .unwrap();
        assert_eq!(names(&selected), vec!["ri202412p.txt", "rpm202503p.txt"]);

        let rpm_only = Selection {
            pattern: Some("rpm*".to_string()),
            ..Default::default()
        }
        .apply(files)
        .unwrap();
        assert_eq!(names(&rpm_only), vec!["rpm202503p.txt", "rpm202506p.txt"]);
    }

    #[test]
    fn invalid_pattern_is_config_error() {
        let result = Selection {
            pattern: Some("[".to_string()),
            ..Default::default()
        }
        .apply(Vec::new());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn reads_form_feed_pages() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "ri202412p.txt", "página um\x0cpágina dois\x0c");
        let files = discover(tmp.path()).unwrap();

        let raw = read(&files[0]).unwrap();
        assert_eq!(raw.id, "RI-2024Q4");
        assert_eq!(raw.pages, vec!["página um", "página dois"]);
        assert_eq!(raw.title.as_deref(), Some("Relatório de Inflação 12/2024"));
        assert!(raw.source.is_some());
    }

    #[test]
    fn reads_json_documents() {
        let tmp = tempfile::tempdir().unwrap();
        write(
            tmp.path(),
            "rpm202503p.json",
            r#"{"id": "RPM-2025Q1", "pages": ["primeira", "segunda"]}"#,
        );
        let files = discover(tmp.path()).unwrap();

        let raw = read(&files[0]).unwrap();
        assert_eq!(raw.pages.len(), 2);
        assert_eq!(raw.published, Some(ReportDate::new(2025, 3).unwrap()));
    }

    #[test]
    fn malformed_json_is_ingestion_error() {
        let tmp = tempfile::tempdir().unwrap();
        write(tmp.path(), "ri202412p.json", "{not json");
        let files = discover(tmp.path()).unwrap();

        let err = read(&files[0]).unwrap_err();
        assert!(matches!(err, Error::Ingestion { document, .. } if document == "RI-2024Q4"));
    }
}
