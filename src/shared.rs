//! Snapshot-isolated access to the index.
//!
//! Readers take an `Arc` to the current [`IndexGeneration`] and keep using it
//! for as long as they like. The single writer clones the current
//! generation, applies one document, persists it, and only then publishes
//! the new generation, so a reader never sees half of a document.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    path::Path,
    sync::{Arc, Mutex, RwLock},
};

use crate::{
    document::{Chunk, Document},
    error::{Error, Result},
    ids::DocumentId,
    index::{AnnConfig, VectorIndex},
    ingest::PreparedDocument,
    store::{DocumentCommit, IndexStore, StoreCounts},
};

/// One immutable version of the index and its chunk catalog.
#[derive(Debug, Clone)]
pub struct IndexGeneration {
    number: u64,
    model_id: String,
    index: VectorIndex,
    documents: BTreeMap<DocumentId, Document>,
    chunks: HashMap<String, Chunk>,
}

impl IndexGeneration {
    fn empty(model_id: &str, config: AnnConfig) -> Self {
        Self {
            number: 0,
            model_id: model_id.to_string(),
            index: VectorIndex::new(config),
            documents: BTreeMap::new(),
            chunks: HashMap::new(),
        }
    }

    /// Monotonic generation counter, bumped on every commit.
    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn index(&self) -> &VectorIndex {
        &self.index
    }

    pub fn chunk(&self, chunk_id: &str) -> Option<&Chunk> {
        self.chunks.get(chunk_id)
    }

    pub fn document(&self, id: &DocumentId) -> Option<&Document> {
        self.documents.get(id)
    }

    /// Documents ordered by id.
    pub fn documents(&self) -> impl Iterator<Item = &Document> {
        self.documents.values()
    }

    /// Every chunk, in no particular order.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.chunks.values()
    }

    pub fn document_count(&self) -> usize {
        self.documents.len()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    fn chunk_ids_of(&self, document: &DocumentId) -> Vec<String> {
        let mut ids: Vec<String> = self
            .chunks
            .values()
            .filter(|c| &c.document_id == document)
            .map(|c| c.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

/// Result of committing one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitOutcome {
    Inserted { chunks: usize },
    Superseded { chunks: usize, replaced: usize },
}

fn poisoned() -> Error {
    Error::Config("index lock poisoned".into())
}

/// The live index: current generation plus the single writer.
pub struct SharedIndex {
    current: RwLock<Arc<IndexGeneration>>,
    writer: Mutex<IndexStore>,
}

impl SharedIndex {
    /// Load the index at `path`, creating it if missing.
    ///
    /// Fails with [`Error::IndexIncompatible`] when the stored vectors were
    /// produced by another embedding model.
    pub fn open(path: &Path, model_id: &str, config: AnnConfig) -> Result<Self> {
        let store = IndexStore::open(path, model_id)?;
        let generation = Self::load_generation(&store, config)?;
        tracing::info!(
            path = %path.display(),
            model = model_id,
            documents = generation.document_count(),
            chunks = generation.chunk_count(),
            partitioned = generation.index.is_partitioned(),
            "index opened"
        );
        Ok(Self::from_parts(store, generation))
    }

    /// Wipe the index at `path` and start an empty one for `model_id`.
    pub fn recreate(path: &Path, model_id: &str, config: AnnConfig) -> Result<Self> {
        let store = IndexStore::recreate(path, model_id)?;
        let generation = IndexGeneration::empty(model_id, config);
        Ok(Self::from_parts(store, generation))
    }

    fn from_parts(store: IndexStore, generation: IndexGeneration) -> Self {
        Self {
            current: RwLock::new(Arc::new(generation)),
            writer: Mutex::new(store),
        }
    }

    fn load_generation(store: &IndexStore, config: AnnConfig) -> Result<IndexGeneration> {
        let stored = store.load()?;

        let chunk_ids: HashSet<&str> = stored.chunks.iter().map(|c| c.id.as_str()).collect();
        let vector_ids: HashSet<&str> = stored.vectors.iter().map(|(id, _)| id.as_str()).collect();
        if chunk_ids != vector_ids {
            return Err(Error::Config(format!(
                "index is inconsistent: {} chunks but {} vectors; run `lastro rebuild`",
                chunk_ids.len(),
                vector_ids.len()
            )));
        }

        let index =
            VectorIndex::from_parts(config, stored.dimension, stored.vectors, stored.centroids)?;

        Ok(IndexGeneration {
            number: 0,
            model_id: stored.model_id,
            index,
            documents: stored
                .documents
                .into_iter()
                .map(|d| (d.id.clone(), d))
                .collect(),
            chunks: stored.chunks.into_iter().map(|c| (c.id.clone(), c)).collect(),
        })
    }

    /// The current generation. Cheap; never blocks on the writer.
    pub fn snapshot(&self) -> Result<Arc<IndexGeneration>> {
        self.current.read().map(|g| Arc::clone(&*g)).map_err(|_| poisoned())
    }

    pub fn model_id(&self) -> Result<String> {
        Ok(self.snapshot()?.model_id().to_string())
    }

    pub fn contains_document(&self, id: &DocumentId) -> Result<bool> {
        Ok(self.snapshot()?.document(id).is_some())
    }

    /// Add one prepared document.
    ///
    /// An already indexed id fails with [`Error::DuplicateDocument`] unless
    /// `supersede` is set, in which case the old chunk set is replaced in the
    /// same transaction. On any error the published generation and the
    /// persisted rows are left untouched.
    pub fn commit(&self, prepared: PreparedDocument, supersede: bool) -> Result<CommitOutcome> {
        let store = self.writer.lock().map_err(|_| poisoned())?;
        let current = self.snapshot()?;

        let PreparedDocument {
            document,
            chunks,
            vectors,
        } = prepared;

        if chunks.is_empty() || chunks.len() != vectors.len() {
            return Err(Error::ingestion(
                document.id.as_str(),
                format!("{} chunks with {} vectors", chunks.len(), vectors.len()),
            ));
        }

        let exists = current.document(&document.id).is_some();
        if exists && !supersede {
            return Err(Error::DuplicateDocument(document.id.to_string()));
        }

        let mut next = IndexGeneration::clone(&current);

        let replaced = next.chunk_ids_of(&document.id);
        if !replaced.is_empty() {
            let doomed: HashSet<&str> = replaced.iter().map(String::as_str).collect();
            next.index.remove_where(|id| doomed.contains(id));
            next.chunks.retain(|id, _| !doomed.contains(id.as_str()));
        }

        for (chunk, vector) in chunks.iter().zip(&vectors) {
            next.index.insert(&chunk.id, vector)?;
        }

        let stored_vectors: Vec<Vec<f32>> = chunks
            .iter()
            .map(|c| next.index.vector(&c.id).map(<[f32]>::to_vec).unwrap_or_default())
            .collect();
        let centroids = next.index.centroids();

        store.commit_document(&DocumentCommit {
            document: &document,
            chunks: &chunks,
            vectors: &stored_vectors,
            replaced: &replaced,
            dimension: next.index.dimension().unwrap_or_default(),
            centroids: centroids.as_ref(),
        })?;

        let count = chunks.len();
        next.chunks.extend(chunks.into_iter().map(|c| (c.id.clone(), c)));
        next.documents.insert(document.id.clone(), document);
        next.number += 1;

        let mut slot = self.current.write().map_err(|_| poisoned())?;
        *slot = Arc::new(next);

        Ok(if exists {
            CommitOutcome::Superseded {
                chunks: count,
                replaced: replaced.len(),
            }
        } else {
            CommitOutcome::Inserted { chunks: count }
        })
    }

    /// Persisted row counts.
    pub fn counts(&self) -> Result<StoreCounts> {
        self.writer.lock().map_err(|_| poisoned())?.counts()
    }

    /// Wait for in-flight commits and check that disk matches memory.
    ///
    /// Every commit is durable when it returns, so this only verifies.
    pub fn flush(&self) -> Result<StoreCounts> {
        let counts = self.counts()?;
        let current = self.snapshot()?;
        if counts.documents != current.document_count() as u64
            || counts.chunks != current.chunk_count() as u64
            || counts.vectors != current.index().len() as u64
        {
            return Err(Error::Config(format!(
                "index out of sync: {} documents/{} chunks on disk, {}/{} in memory",
                counts.documents,
                counts.chunks,
                current.document_count(),
                current.chunk_count()
            )));
        }
        tracing::debug!(generation = current.number(), "index flushed");
        Ok(counts)
    }
}

impl std::fmt::Debug for SharedIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedIndex").finish_non_exhaustive()
    }
}
