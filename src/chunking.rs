//! Page normalization and chunking.
//!
//! Pages are cleaned line by line (whitespace, stray page numbers, running
//! headers and footers), joined into a single page stream, and split into
//! overlapping windows that prefer paragraph, then sentence, then word
//! boundaries over hard cuts. Every chunk is a byte span of the page stream,
//! so its text is always a contiguous substring of the source pages.

use std::collections::{HashMap, HashSet};

use crate::{
    document::{Chunk, Page},
    ids::{DocumentId, chunk_id},
    text::{collapse_whitespace, is_page_number, mask_digits},
};

/// Default target chunk length in characters.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Default overlap between adjacent chunks, as a fraction of the chunk size.
pub const DEFAULT_CHUNK_OVERLAP: f32 = 0.25;

/// Separator placed between pages in the page stream.
pub const PAGE_SEPARATOR: &str = "\n\n";

/// Characters that end a sentence when followed by whitespace.
const SENTENCE_TERMINATORS: &[char] = &['.', '!', '?'];

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ChunkingConfig {
    /// Target chunk length in characters.
    pub chunk_size: usize,
    /// Overlap between adjacent chunks as a fraction of `chunk_size`.
    pub overlap: f32,
    /// Never let a chunk cross a page break.
    pub split_at_page_breaks: bool,
    /// Share of pages a line must appear on to count as a header/footer.
    pub boilerplate_min_fraction: f32,
    /// Documents shorter than this skip header/footer detection.
    pub boilerplate_min_pages: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            overlap: DEFAULT_CHUNK_OVERLAP,
            split_at_page_breaks: true,
            boilerplate_min_fraction: 0.6,
            boilerplate_min_pages: 3,
        }
    }
}

impl ChunkingConfig {
    /// Overlap in characters, always strictly smaller than the chunk size.
    pub fn overlap_chars(&self) -> usize {
        let size = self.chunk_size.max(1);
        let chars = (size as f32 * self.overlap.clamp(0.0, 1.0)).round() as usize;
        chars.min(size - 1)
    }
}

/// Clean raw page texts.
///
/// Collapses whitespace, drops isolated page numbers and lines that repeat
/// across most pages (digit-masked, so numbered running headers match), and
/// reduces blank-line runs to a single paragraph break.
pub fn normalize_pages(pages: &[String], config: &ChunkingConfig) -> Vec<String> {
    let cleaned: Vec<Vec<String>> = pages
        .iter()
        .map(|page| page.lines().map(collapse_whitespace).collect())
        .collect();

    let boilerplate = detect_boilerplate(&cleaned, config);

    cleaned
        .iter()
        .map(|lines| {
            let mut out = String::new();
            let mut pending_break = false;
            for line in lines {
                if line.is_empty() {
                    pending_break = !out.is_empty();
                    continue;
                }
                if is_page_number(line) || boilerplate.contains(&mask_digits(line)) {
                    continue;
                }
                if !out.is_empty() {
                    out.push_str(if pending_break { "\n\n" } else { "\n" });
                }
                out.push_str(line);
                pending_break = false;
            }
            out
        })
        .collect()
}

fn detect_boilerplate(
    pages: &[Vec<String>],
    config: &ChunkingConfig,
) -> HashSet<String> {
    if pages.len() < config.boilerplate_min_pages.max(2) {
        return HashSet::new();
    }

    let mut counts: HashMap<String, usize> = HashMap::new();
    for lines in pages {
        let unique: HashSet<String> = lines
            .iter()
            .filter(|l| !l.is_empty())
            .map(|l| mask_digits(l))
            .collect();
        for key in unique {
            *counts.entry(key).or_default() += 1;
        }
    }

    let min_pages =
        ((pages.len() as f32 * config.boilerplate_min_fraction).ceil() as usize).max(2);
    counts
        .into_iter()
        .filter(|(_, count)| *count >= min_pages)
        .map(|(key, _)| key)
        .collect()
}

/// Pages joined with [`PAGE_SEPARATOR`], plus the offset of each page.
#[derive(Debug, Clone)]
pub struct PageStream {
    pub text: String,
    starts: Vec<usize>,
    numbers: Vec<u32>,
}

impl PageStream {
    pub fn new(pages: &[Page]) -> Self {
        let mut text = String::new();
        let mut starts = Vec::with_capacity(pages.len());
        let mut numbers = Vec::with_capacity(pages.len());

        for (i, page) in pages.iter().enumerate() {
            if i > 0 {
                text.push_str(PAGE_SEPARATOR);
            }
            starts.push(text.len());
            numbers.push(page.number);
            text.push_str(&page.text);
        }

        Self {
            text,
            starts,
            numbers,
        }
    }

    /// Byte range of page `index` (0-based position in the stream).
    fn page_range(&self, index: usize) -> (usize, usize) {
        let start = self.starts[index];
        let end = self
            .starts
            .get(index + 1)
            .map(|next| next - PAGE_SEPARATOR.len())
            .unwrap_or(self.text.len());
        (start, end)
    }

    fn page_index_at(&self, offset: usize) -> usize {
        self.starts
            .partition_point(|&start| start <= offset)
            .saturating_sub(1)
    }

    /// First and last page numbers covered by a byte span.
    pub fn pages_for(&self, start: usize, end: usize) -> (u32, u32) {
        if self.numbers.is_empty() {
            return (1, 1);
        }
        let first = self.page_index_at(start);
        let last = self.page_index_at(end.saturating_sub(1).max(start));
        (self.numbers[first], self.numbers[last])
    }
}

/// Split normalized pages into chunks.
pub fn chunk_pages(
    document_id: &DocumentId,
    fingerprint: &str,
    pages: &[Page],
    config: &ChunkingConfig,
) -> Vec<Chunk> {
    let stream = PageStream::new(pages);
    let overlap = config.overlap_chars();

    let spans: Vec<(usize, usize)> = if config.split_at_page_breaks {
        (0..pages.len())
            .flat_map(|i| {
                let (page_start, page_end) = stream.page_range(i);
                split_spans(&stream.text[page_start..page_end], config.chunk_size, overlap)
                    .into_iter()
                    .map(move |(s, e)| (page_start + s, page_start + e))
            })
            .collect()
    } else {
        split_spans(&stream.text, config.chunk_size, overlap)
    };

    spans
        .into_iter()
        .map(|(start, end)| {
            let (first_page, last_page) = stream.pages_for(start, end);
            Chunk {
                id: chunk_id(document_id, fingerprint, start),
                document_id: document_id.clone(),
                first_page,
                last_page,
                start,
                end,
                text: stream.text[start..end].to_string(),
            }
        })
        .collect()
}

/// Split text into overlapping, whitespace-trimmed byte spans of roughly
/// `chunk_size` characters.
///
/// Properly handles UTF-8 multi-byte characters: sizes are counted in
/// characters and spans always fall on character boundaries.
///
/// # Examples
///
/// ```
/// use lastro::chunking::split_spans;
///
/// let text = "First sentence here. Second sentence here. Third one.";
/// let spans = split_spans(text, 30, 0);
/// assert_eq!(&text[spans[0].0..spans[0].1], "First sentence here.");
/// ```
pub fn split_spans(text: &str, chunk_size: usize, overlap: usize) -> Vec<(usize, usize)> {
    let chars: Vec<char> = text.chars().collect();
    let char_to_byte: Vec<usize> = text
        .char_indices()
        .map(|(byte_idx, _)| byte_idx)
        .chain(std::iter::once(text.len()))
        .collect();

    let n = chars.len();
    let size = chunk_size.max(1);
    let overlap = overlap.min(size - 1);
    let mut spans = Vec::new();

    let Some(mut start) = (0..n).find(|&i| !chars[i].is_whitespace()) else {
        return spans;
    };
    let mut prev_end = start;

    loop {
        let window_end = (start + size).min(n);
        let end = if window_end == n {
            n
        } else {
            let floor = (start + (window_end - start) / 2).max(prev_end + 1).max(start + 1);
            find_break(&chars, floor.min(window_end), window_end)
        };

        if let Some((s, e)) = trim_span(&chars, start, end) {
            spans.push((char_to_byte[s], char_to_byte[e]));
        }

        if end >= n {
            break;
        }
        prev_end = end;

        let next = next_start(&chars, start, end, overlap);
        let Some(next) = (next..n).find(|&i| !chars[i].is_whitespace()) else {
            break;
        };
        start = next;
    }

    spans
}

/// Pick the end of a window, scanning back from `window_end` to `floor`:
/// paragraph break, then sentence end, then whitespace, else a hard cut.
fn find_break(chars: &[char], floor: usize, window_end: usize) -> usize {
    let candidates = || (floor..=window_end).rev();

    if let Some(p) = candidates()
        .find(|&p| chars.get(p) == Some(&'\n') && chars.get(p + 1) == Some(&'\n'))
    {
        return p;
    }

    if let Some(p) = candidates().find(|&p| {
        p > 0
            && SENTENCE_TERMINATORS.contains(&chars[p - 1])
            && chars.get(p).is_some_and(|c| c.is_whitespace())
    }) {
        return p;
    }

    if let Some(p) = candidates().find(|&p| chars.get(p).is_some_and(|c| c.is_whitespace())) {
        return p;
    }

    window_end
}

/// Start of the next window: inside the overlap region, prefer the first
/// sentence start, then the first word start.
fn next_start(chars: &[char], start: usize, end: usize, overlap: usize) -> usize {
    if overlap == 0 {
        return end;
    }
    let target = end.saturating_sub(overlap).max(start + 1);
    if target >= end {
        return end;
    }

    if let Some(p) = (target..end).find(|&p| is_sentence_start(chars, p)) {
        return p;
    }

    (target..end)
        .find(|&p| p > 0 && chars[p - 1].is_whitespace() && !chars[p].is_whitespace())
        .unwrap_or(target)
}

fn is_sentence_start(chars: &[char], p: usize) -> bool {
    if chars[p].is_whitespace() || p == 0 || !chars[p - 1].is_whitespace() {
        return false;
    }
    let mut q = p;
    while q > 0 && chars[q - 1].is_whitespace() {
        q -= 1;
    }
    if q == 0 {
        return true;
    }
    let newlines = chars[q..p].iter().filter(|&&c| c == '\n').count();
    newlines >= 2 || SENTENCE_TERMINATORS.contains(&chars[q - 1])
}

fn trim_span(chars: &[char], mut start: usize, mut end: usize) -> Option<(usize, usize)> {
    while start < end && chars[start].is_whitespace() {
        start += 1;
    }
    while end > start && chars[end - 1].is_whitespace() {
        end -= 1;
    }
    (start < end).then_some((start, end))
}
