//! Turns reranked candidates into the labeled excerpts handed to the
//! generator.

use crate::{
    document::{Chunk, page_label},
    reranker::RankedCandidate,
    settings::Settings,
    shared::IndexGeneration,
    text::truncate_at_word,
};

/// Marker appended to a chunk cut short by the budget.
pub const TRUNCATION_MARKER: &str = "[...]";

const ENTRY_SEPARATOR: &str = "\n\n";

/// Where an excerpt came from. `ordinal` is the 1-based label number.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Citation {
    pub document_id: String,
    pub first_page: u32,
    pub last_page: u32,
    pub ordinal: usize,
}

impl Citation {
    pub fn label(&self) -> String {
        format!("Excerpt {}", self.ordinal)
    }

    pub fn page_label(&self) -> String {
        page_label(self.first_page, self.last_page)
    }
}

impl std::fmt::Display for Citation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}] {}, {}", self.label(), self.document_id, self.page_label())
    }
}

#[derive(Debug, Clone)]
pub struct ContextEntry {
    pub chunk: Chunk,
    pub citation: Citation,
    pub score: f32,
    /// Header line plus (possibly truncated) chunk text.
    pub rendered: String,
    pub truncated: bool,
}

/// The excerpts for one question. An empty context is a valid result and
/// means no grounding was found.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub entries: Vec<ContextEntry>,
    pub budget: usize,
    /// Characters of the rendered block.
    pub used_chars: usize,
    pub dropped_duplicates: usize,
    pub dropped_for_budget: usize,
    pub missing: usize,
}

impl AssembledContext {
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Citation for label number `ordinal`, if it exists.
    pub fn citation(&self, ordinal: usize) -> Option<&Citation> {
        ordinal
            .checked_sub(1)
            .and_then(|i| self.entries.get(i))
            .map(|e| &e.citation)
    }

    /// The block passed to the generator.
    pub fn render(&self) -> String {
        self.entries
            .iter()
            .map(|e| e.rendered.as_str())
            .collect::<Vec<_>>()
            .join(ENTRY_SEPARATOR)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ContextAssembler {
    /// Maximum size of the rendered block, in characters.
    pub budget: usize,
    /// Same-document chunks whose byte ranges overlap by at least this
    /// fraction of the shorter one are treated as duplicates.
    pub dedup_overlap: f32,
}

impl Default for ContextAssembler {
    fn default() -> Self {
        Self {
            budget: 6000,
            dedup_overlap: 0.5,
        }
    }
}

impl ContextAssembler {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            budget: settings.context_budget,
            dedup_overlap: settings.dedup_overlap,
        }
    }

    fn is_duplicate(&self, candidate: &Chunk, kept: &[&Chunk]) -> bool {
        kept.iter().any(|k| {
            if k.text.trim() == candidate.text.trim() {
                return true;
            }
            let overlap = k.overlap_with(candidate);
            if overlap == 0 {
                return false;
            }
            let shorter = (k.end - k.start).min(candidate.end - candidate.start).max(1);
            overlap as f32 / shorter as f32 >= self.dedup_overlap
        })
    }

    /// Resolve, deduplicate, label and budget `ranked` (best first).
    ///
    /// Entries are kept in rank order until the next one would overflow
    /// the budget; everything after it is dropped. When even the first entry
    /// does not fit, its text is cut at a word boundary and flagged. If the
    /// budget cannot hold its header and some text, the context is empty.
    pub fn assemble(
        &self,
        snapshot: &IndexGeneration,
        ranked: &[RankedCandidate],
    ) -> AssembledContext {
        let mut context = AssembledContext {
            budget: self.budget,
            ..AssembledContext::default()
        };

        let mut selected: Vec<(&Chunk, f32)> = Vec::new();
        for candidate in ranked {
            let Some(chunk) = snapshot.chunk(&candidate.chunk_id) else {
                tracing::warn!(chunk = %candidate.chunk_id, "ranked chunk missing from index");
                context.missing += 1;
                continue;
            };
            let kept: Vec<&Chunk> = selected.iter().map(|(c, _)| *c).collect();
            if self.is_duplicate(chunk, &kept) {
                context.dropped_duplicates += 1;
                continue;
            }
            selected.push((chunk, candidate.score));
        }

        for (position, (chunk, score)) in selected.iter().enumerate() {
            let citation = Citation {
                document_id: chunk.document_id.to_string(),
                first_page: chunk.first_page,
                last_page: chunk.last_page,
                ordinal: context.entries.len() + 1,
            };
            let title = snapshot
                .document(&chunk.document_id)
                .map(|d| d.title.as_str())
                .unwrap_or_else(|| chunk.document_id.as_str());
            let header = format!(
                "[{}] {title} ({}), {}",
                citation.label(),
                chunk.document_id,
                chunk.page_label()
            );

            let separator = if context.entries.is_empty() {
                0
            } else {
                ENTRY_SEPARATOR.len()
            };
            let full = format!("{header}\n{}", chunk.text);
            let cost = full.chars().count() + separator;

            if context.used_chars + cost <= self.budget {
                context.used_chars += cost;
                context.entries.push(ContextEntry {
                    chunk: (*chunk).clone(),
                    citation,
                    score: *score,
                    rendered: full,
                    truncated: false,
                });
                continue;
            }

            let fixed = header.chars().count() + 2 + TRUNCATION_MARKER.len();
            let room = self.budget.saturating_sub(fixed);
            let cut = truncate_at_word(&chunk.text, room).trim_end();
            if context.entries.is_empty() && !cut.is_empty() {
                let rendered = format!("{header}\n{cut} {TRUNCATION_MARKER}");
                context.used_chars = rendered.chars().count();
                context.entries.push(ContextEntry {
                    chunk: (*chunk).clone(),
                    citation,
                    score: *score,
                    rendered,
                    truncated: true,
                });
                tracing::debug!(chunk = %chunk.id, room, "top excerpt truncated to fit budget");
                context.dropped_for_budget = selected.len() - position - 1;
            } else {
                context.dropped_for_budget = selected.len() - position;
            }
            break;
        }

        tracing::debug!(
            excerpts = context.entries.len(),
            used = context.used_chars,
            budget = self.budget,
            duplicates = context.dropped_duplicates,
            over_budget = context.dropped_for_budget,
            "context assembled"
        );
        context
    }
}
