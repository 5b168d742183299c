use rayon::prelude::*;

use crate::{
    chunking::{ChunkingConfig, PageStream, chunk_pages, normalize_pages},
    document::{Chunk, Document, Page, RawDocument},
    embedding::Embedder,
    error::{Error, Result},
    ids::{DocumentId, fingerprint},
    shared::{CommitOutcome, SharedIndex},
    source::{SourceFile, read},
};

/// A document that has been normalized, chunked and embedded, ready to be
/// committed.
#[derive(Debug, Clone)]
pub struct PreparedDocument {
    pub document: Document,
    pub chunks: Vec<Chunk>,
    /// One vector per chunk, in chunk order.
    pub vectors: Vec<Vec<f32>>,
}

/// Normalize, chunk and embed a raw document. Nothing is written.
pub fn prepare(
    raw: &RawDocument,
    embedder: &dyn Embedder,
    config: &ChunkingConfig,
) -> Result<PreparedDocument> {
    let id = DocumentId::new(&raw.id)?;
    let fail = |reason: String| Error::ingestion(id.as_str(), reason);

    if raw.pages.iter().all(|p| p.trim().is_empty()) {
        return Err(fail("document has no text".into()));
    }

    let pages: Vec<Page> = normalize_pages(&raw.pages, config)
        .into_iter()
        .enumerate()
        .map(|(i, text)| Page {
            number: i as u32 + 1,
            text,
        })
        .collect();

    let stream = PageStream::new(&pages);
    if stream.text.trim().is_empty() {
        return Err(fail("no text left after removing boilerplate".into()));
    }
    let fingerprint = fingerprint(&stream.text);

    let chunks = chunk_pages(&id, &fingerprint, &pages, config);
    if chunks.is_empty() {
        return Err(fail("document produced no chunks".into()));
    }

    let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = embedder
        .embed_documents(&texts)
        .map_err(|e| fail(format!("embedding failed: {e}")))?;
    if vectors.len() != chunks.len() {
        return Err(fail(format!(
            "embedder returned {} vectors for {} chunks",
            vectors.len(),
            chunks.len()
        )));
    }

    tracing::debug!(
        document = %id,
        pages = pages.len(),
        chunks = chunks.len(),
        "document prepared"
    );

    Ok(PreparedDocument {
        document: Document {
            title: raw.title.clone().unwrap_or_else(|| id.to_string()),
            id,
            published: raw.published,
            source: raw.source.as_ref().map(|p| p.display().to_string()),
            fingerprint,
            pages,
        },
        chunks,
        vectors,
    })
}

/// Prepare and commit a single document.
pub fn ingest_document(
    shared: &SharedIndex,
    embedder: &dyn Embedder,
    config: &ChunkingConfig,
    raw: &RawDocument,
    supersede: bool,
) -> Result<CommitOutcome> {
    if !supersede {
        let id = DocumentId::new(&raw.id)?;
        if shared.contains_document(&id)? {
            return Err(Error::DuplicateDocument(id.to_string()));
        }
    }
    let prepared = prepare(raw, embedder, config)?;
    shared.commit(prepared, supersede)
}

/// Per-document outcome of a batch.
#[derive(Debug, Default)]
pub struct IngestReport {
    pub ingested: Vec<(String, CommitOutcome)>,
    /// Already indexed and not superseded. Not a failure.
    pub duplicates: Vec<String>,
    pub failed: Vec<(String, Error)>,
}

impl IngestReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.ingested.len() + self.duplicates.len() + self.failed.len()
    }
}

enum Stage {
    Ready(PreparedDocument),
    Duplicate(String),
    Failed(String, Error),
}

/// Ingest raw report files: read and prepare in parallel, commit serially.
pub fn ingest_files(
    shared: &SharedIndex,
    embedder: &dyn Embedder,
    config: &ChunkingConfig,
    files: &[SourceFile],
    supersede: bool,
) -> IngestReport {
    let loaded: Vec<(String, Result<RawDocument>)> = files
        .par_iter()
        .map(|f| (f.identity.id.clone(), read(f)))
        .collect();
    ingest_batch(shared, embedder, config, loaded, supersede)
}

/// Ingest documents already in memory.
pub fn ingest_documents(
    shared: &SharedIndex,
    embedder: &dyn Embedder,
    config: &ChunkingConfig,
    documents: Vec<RawDocument>,
    supersede: bool,
) -> IngestReport {
    let loaded = documents
        .into_iter()
        .map(|raw| (raw.id.clone(), Ok(raw)))
        .collect();
    ingest_batch(shared, embedder, config, loaded, supersede)
}

fn ingest_batch(
    shared: &SharedIndex,
    embedder: &dyn Embedder,
    config: &ChunkingConfig,
    loaded: Vec<(String, Result<RawDocument>)>,
    supersede: bool,
) -> IngestReport {
    let mut report = IngestReport::default();

    let snapshot = match shared.snapshot() {
        Ok(snapshot) => snapshot,
        Err(e) => {
            let message = e.to_string();
            report.failed = loaded
                .into_iter()
                .map(|(label, _)| (label, Error::Config(message.clone())))
                .collect();
            return report;
        }
    };

    let stages: Vec<Stage> = loaded
        .into_par_iter()
        .map(|(label, raw)| {
            let raw = match raw {
                Ok(raw) => raw,
                Err(e) => return Stage::Failed(label, e),
            };
            if !supersede
                && let Ok(id) = DocumentId::new(&raw.id)
                && snapshot.document(&id).is_some()
            {
                return Stage::Duplicate(id.to_string());
            }
            match prepare(&raw, embedder, config) {
                Ok(prepared) => Stage::Ready(prepared),
                Err(e) => Stage::Failed(raw.id.clone(), e),
            }
        })
        .collect();

    for stage in stages {
        match stage {
            Stage::Ready(prepared) => {
                let id = prepared.document.id.to_string();
                match shared.commit(prepared, supersede) {
                    Ok(outcome) => {
                        tracing::info!(document = %id, ?outcome, "document ingested");
                        report.ingested.push((id, outcome));
                    }
                    Err(Error::DuplicateDocument(dup)) => {
                        tracing::info!(document = %dup, "document already indexed");
                        report.duplicates.push(dup);
                    }
                    Err(e) => {
                        tracing::warn!(document = %id, error = %e, "ingestion failed");
                        report.failed.push((id, e));
                    }
                }
            }
            Stage::Duplicate(id) => {
                tracing::info!(document = %id, "document already indexed");
                report.duplicates.push(id);
            }
            Stage::Failed(id, e) => {
                tracing::warn!(document = %id, error = %e, "ingestion failed");
                report.failed.push((id, e));
            }
        }
    }

    report
}
