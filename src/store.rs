use std::path::Path;

use redb::{
    Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition,
};

use crate::{
    document::{Chunk, Document},
    error::{Error, Result},
    index::Centroids,
};

const META: TableDefinition<&str, &str> = TableDefinition::new("meta");
const DOCUMENTS: TableDefinition<&str, &[u8]> = TableDefinition::new("documents");
const CHUNKS: TableDefinition<&str, &[u8]> = TableDefinition::new("chunks");
const VECTORS: TableDefinition<&str, &[u8]> = TableDefinition::new("vectors");
const CENTROIDS: TableDefinition<u64, &[u8]> = TableDefinition::new("centroids");

const META_MODEL: &str = "embedding_model";
const META_DIMENSION: &str = "dimension";
const META_FORMAT: &str = "format_version";
const META_TRAINED_AT: &str = "trained_at";

/// Bumped whenever the on-disk layout changes.
const FORMAT_VERSION: &str = "1";

/// Everything persisted for one index, as loaded from disk.
#[derive(Debug, Default)]
pub struct StoredIndex {
    pub model_id: String,
    pub dimension: Option<usize>,
    pub documents: Vec<Document>,
    pub chunks: Vec<Chunk>,
    pub vectors: Vec<(String, Vec<f32>)>,
    pub centroids: Option<Centroids>,
}

/// Row counts, as reported by `lastro status`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreCounts {
    pub documents: u64,
    pub chunks: u64,
    pub vectors: u64,
}

/// One document's worth of rows, written in a single transaction.
pub struct DocumentCommit<'a> {
    pub document: &'a Document,
    pub chunks: &'a [Chunk],
    pub vectors: &'a [Vec<f32>],
    /// Chunk ids of the edition being superseded, if any.
    pub replaced: &'a [String],
    pub dimension: usize,
    pub centroids: Option<&'a Centroids>,
}

/// Durable storage for documents, chunks, vectors and centroids.
///
/// Vectors are stored as little-endian f32 blobs; documents and chunks as
/// JSON records keyed by id. The `meta` table pins the embedding model the
/// vectors were produced with.
pub struct IndexStore {
    db: Database,
    model_id: String,
}

/// Decode a little-endian f32 blob.
///
/// redb does not guarantee 4-byte alignment of values, so fall back to a
/// copying decode when the slice cannot be reinterpreted in place.
fn decode_vector(bytes: &[u8]) -> Vec<f32> {
    match bytemuck::try_cast_slice::<u8, f32>(bytes) {
        Ok(values) => values.to_vec(),
        Err(_) => bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect(),
    }
}

impl IndexStore {
    /// Open or create the index database for `model_id`.
    ///
    /// Fails with [`Error::IndexIncompatible`] if the database was built
    /// with a different embedding model.
    pub fn open(path: &Path, model_id: &str) -> Result<Self> {
        let store = Self::open_tables(path, model_id)?;

        match store.stored_model()? {
            Some(stored) if stored != model_id => {
                return Err(Error::IndexIncompatible {
                    stored,
                    configured: model_id.to_string(),
                });
            }
            Some(_) => {}
            None => store.write_meta(&[(META_MODEL, model_id), (META_FORMAT, FORMAT_VERSION)])?,
        }

        Ok(store)
    }

    /// Open the database and wipe it, pinning it to `model_id`.
    ///
    /// Used by `rebuild`, which must work even when the stored index was
    /// built with another model.
    pub fn recreate(path: &Path, model_id: &str) -> Result<Self> {
        let store = Self::open_tables(path, model_id)?;
        store.clear()?;
        Ok(store)
    }

    fn open_tables(path: &Path, model_id: &str) -> Result<Self> {
        let db = Database::create(path)?;

        let txn = db.begin_write()?;
        txn.open_table(META)?;
        txn.open_table(DOCUMENTS)?;
        txn.open_table(CHUNKS)?;
        txn.open_table(VECTORS)?;
        txn.open_table(CENTROIDS)?;
        txn.commit()?;

        Ok(Self {
            db,
            model_id: model_id.to_string(),
        })
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub fn stored_model(&self) -> Result<Option<String>> {
        let txn = self.db.begin_read()?;
        let table = txn.open_table(META)?;
        Ok(table.get(META_MODEL)?.map(|v| v.value().to_string()))
    }

    fn write_meta(&self, entries: &[(&str, &str)]) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(META)?;
            for (key, value) in entries {
                table.insert(*key, *value)?;
            }
        }
        txn.commit()?;
        Ok(())
    }

    /// Remove every row and reset the metadata to the current model.
    pub fn clear(&self) -> Result<()> {
        let txn = self.db.begin_write()?;
        {
            txn.open_table(DOCUMENTS)?.retain(|_, _| false)?;
            txn.open_table(CHUNKS)?.retain(|_, _| false)?;
            txn.open_table(VECTORS)?.retain(|_, _| false)?;
            txn.open_table(CENTROIDS)?.retain(|_, _| false)?;

            let mut meta = txn.open_table(META)?;
            meta.retain(|_, _| false)?;
            meta.insert(META_MODEL, self.model_id.as_str())?;
            meta.insert(META_FORMAT, FORMAT_VERSION)?;
        }
        txn.commit()?;
        tracing::info!(model = %self.model_id, "index store cleared");
        Ok(())
    }

    /// Persist a document with its chunks and vectors atomically, removing
    /// the rows of the edition it replaces.
    pub fn commit_document(&self, commit: &DocumentCommit<'_>) -> Result<()> {
        if commit.chunks.len() != commit.vectors.len() {
            return Err(Error::ingestion(
                commit.document.id.as_str(),
                format!(
                    "{} chunks but {} vectors",
                    commit.chunks.len(),
                    commit.vectors.len()
                ),
            ));
        }

        let dimension = commit.dimension.to_string();
        let txn = self.db.begin_write()?;
        {
            let mut documents = txn.open_table(DOCUMENTS)?;
            let mut chunks = txn.open_table(CHUNKS)?;
            let mut vectors = txn.open_table(VECTORS)?;

            for chunk_id in commit.replaced {
                chunks.remove(chunk_id.as_str())?;
                vectors.remove(chunk_id.as_str())?;
            }

            let record = serde_json::to_vec(commit.document)?;
            documents.insert(commit.document.id.as_str(), record.as_slice())?;

            for (chunk, vector) in commit.chunks.iter().zip(commit.vectors) {
                let record = serde_json::to_vec(chunk)?;
                chunks.insert(chunk.id.as_str(), record.as_slice())?;
                vectors.insert(chunk.id.as_str(), bytemuck::cast_slice::<f32, u8>(vector))?;
            }

            let mut meta = txn.open_table(META)?;
            meta.insert(META_DIMENSION, dimension.as_str())?;

            let mut centroids = txn.open_table(CENTROIDS)?;
            centroids.retain(|_, _| false)?;
            match commit.centroids {
                Some(trained) => {
                    for (i, centroid) in trained.vectors.iter().enumerate() {
                        centroids.insert(i as u64, bytemuck::cast_slice::<f32, u8>(centroid))?;
                    }
                    meta.insert(META_TRAINED_AT, trained.trained_at.to_string().as_str())?;
                }
                None => {
                    meta.remove(META_TRAINED_AT)?;
                }
            }
        }
        txn.commit()?;

        tracing::debug!(
            document = %commit.document.id,
            chunks = commit.chunks.len(),
            replaced = commit.replaced.len(),
            "document committed"
        );
        Ok(())
    }

    /// Load every persisted row.
    pub fn load(&self) -> Result<StoredIndex> {
        let txn = self.db.begin_read()?;

        let meta = txn.open_table(META)?;
        let read_meta = |key: &str| -> Result<Option<String>> {
            Ok(meta.get(key)?.map(|v| v.value().to_string()))
        };
        let parse_meta = |key: &str, value: String| -> Result<usize> {
            value
                .parse()
                .map_err(|_| Error::Config(format!("corrupt index metadata {key}='{value}'")))
        };

        let model_id = read_meta(META_MODEL)?.unwrap_or_else(|| self.model_id.clone());
        let dimension = read_meta(META_DIMENSION)?
            .map(|v| parse_meta(META_DIMENSION, v))
            .transpose()?;
        let trained_at = read_meta(META_TRAINED_AT)?
            .map(|v| parse_meta(META_TRAINED_AT, v))
            .transpose()?;

        let mut documents = Vec::new();
        for entry in txn.open_table(DOCUMENTS)?.iter()? {
            let (_, v) = entry?;
            documents.push(serde_json::from_slice::<Document>(v.value())?);
        }

        let mut chunks = Vec::new();
        for entry in txn.open_table(CHUNKS)?.iter()? {
            let (_, v) = entry?;
            chunks.push(serde_json::from_slice::<Chunk>(v.value())?);
        }

        let mut vectors = Vec::new();
        for entry in txn.open_table(VECTORS)?.iter()? {
            let (k, v) = entry?;
            vectors.push((k.value().to_string(), decode_vector(v.value())));
        }

        let mut centroid_vectors = Vec::new();
        for entry in txn.open_table(CENTROIDS)?.iter()? {
            let (_, v) = entry?;
            centroid_vectors.push(decode_vector(v.value()));
        }
        let centroids = match trained_at {
            Some(trained_at) if !centroid_vectors.is_empty() => Some(Centroids {
                vectors: centroid_vectors,
                trained_at,
            }),
            _ => None,
        };

        Ok(StoredIndex {
            model_id,
            dimension,
            documents,
            chunks,
            vectors,
            centroids,
        })
    }

    pub fn counts(&self) -> Result<StoreCounts> {
        let txn = self.db.begin_read()?;
        Ok(StoreCounts {
            documents: txn.open_table(DOCUMENTS)?.len()?,
            chunks: txn.open_table(CHUNKS)?.len()?,
            vectors: txn.open_table(VECTORS)?.len()?,
        })
    }
}

impl std::fmt::Debug for IndexStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IndexStore")
            .field("model_id", &self.model_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{document::Page, ids::DocumentId};

    fn document(id: &str, fingerprint: &str) -> Document {
        Document {
            id: DocumentId::new(id).unwrap(),
            title: format!("Relatório {id}"),
            published: None,
            source: None,
            fingerprint: fingerprint.to_string(),
            pages: vec![Page {
                number: 1,
                text: "Texto da página.".to_string(),
            }],
        }
    }

    fn chunk(doc: &str, id: &str) -> Chunk {
        Chunk {
            id: id.to_string(),
            document_id: DocumentId::new(doc).unwrap(),
            first_page: 1,
            last_page: 1,
            start: 0,
            end: 16,
            text: "Texto da página.".to_string(),
        }
    }

    fn commit(store: &IndexStore, doc: &Document, chunks: &[Chunk], replaced: &[String]) {
        let vectors: Vec<Vec<f32>> = chunks.iter().map(|_| vec![0.6, 0.8]).collect();
        store
            .commit_document(&DocumentCommit {
                document: doc,
                chunks,
                vectors: &vectors,
                replaced,
                dimension: 2,
                centroids: None,
            })
            .unwrap();
    }

    #[test]
    fn open_pins_model_id() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.redb");

        let store = IndexStore::open(&path, "hashing-v1-384").unwrap();
        assert_eq!(store.stored_model().unwrap().as_deref(), Some("hashing-v1-384"));
        drop(store);

        let err = IndexStore::open(&path, "colbert:other").unwrap_err();
        assert!(matches!(err, Error::IndexIncompatible { .. }));
    }

    #[test]
    fn commit_and_load_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&tmp.path().join("index.redb"), "m").unwrap();

        let doc = document("RI-2024Q4", "aa");
        commit(&store, &doc, &[chunk("RI-2024Q4", "RI-2024Q4:aa:00000000")], &[]);

        let loaded = store.load().unwrap();
        assert_eq!(loaded.model_id, "m");
        assert_eq!(loaded.dimension, Some(2));
        assert_eq!(loaded.documents, vec![doc]);
        assert_eq!(loaded.chunks.len(), 1);
        assert_eq!(loaded.vectors, vec![("RI-2024Q4:aa:00000000".to_string(), vec![0.6, 0.8])]);
        assert!(loaded.centroids.is_none());

        let counts = store.counts().unwrap();
        assert_eq!(counts, StoreCounts { documents: 1, chunks: 1, vectors: 1 });
    }

    #[test]
    fn replaced_chunks_are_removed_in_same_commit() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&tmp.path().join("index.redb"), "m").unwrap();

        let old = document("RI-2024Q4", "aa");
        commit(&store, &old, &[chunk("RI-2024Q4", "RI-2024Q4:aa:00000000")], &[]);

        let new = document("RI-2024Q4", "bb");
        commit(
            &store,
            &new,
            &[chunk("RI-2024Q4", "RI-2024Q4:bb:00000000")],
            &["RI-2024Q4:aa:00000000".to_string()],
        );

        let loaded = store.load().unwrap();
        assert_eq!(loaded.documents, vec![new]);
        assert_eq!(loaded.chunks[0].id, "RI-2024Q4:bb:00000000");
        assert_eq!(loaded.vectors.len(), 1);
    }

    #[test]
    fn centroids_persist() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&tmp.path().join("index.redb"), "m").unwrap();
        let doc = document("RPM-2025Q1", "cc");
        let chunks = [chunk("RPM-2025Q1", "RPM-2025Q1:cc:00000000")];
        let trained = Centroids {
            vectors: vec![vec![1.0, 0.0], vec![0.0, 1.0]],
            trained_at: 1,
        };
        store
            .commit_document(&DocumentCommit {
                document: &doc,
                chunks: &chunks,
                vectors: &[vec![1.0, 0.0]],
                replaced: &[],
                dimension: 2,
                centroids: Some(&trained),
            })
            .unwrap();

        assert_eq!(store.load().unwrap().centroids, Some(trained));
    }

    #[test]
    fn mismatched_vectors_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let store = IndexStore::open(&tmp.path().join("index.redb"), "m").unwrap();
        let doc = document("RI-2024Q4", "aa");
        let chunks = [chunk("RI-2024Q4", "RI-2024Q4:aa:00000000")];
        let result = store.commit_document(&DocumentCommit {
            document: &doc,
            chunks: &chunks,
            vectors: &[],
            replaced: &[],
            dimension: 2,
            centroids: None,
        });
        assert!(matches!(result, Err(Error::Ingestion { .. })));
        assert_eq!(store.counts().unwrap(), StoreCounts::default());
    }

    #[test]
    fn recreate_wipes_and_repins() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("index.redb");
        {
            let store = IndexStore::open(&path, "old-model").unwrap();
            commit(&store, &document("RI-2024Q4", "aa"), &[chunk("RI-2024Q4", "RI-2024Q4:aa:00000000")], &[]);
        }

        let store = IndexStore::recreate(&path, "new-model").unwrap();
        assert_eq!(store.counts().unwrap(), StoreCounts::default());
        assert_eq!(store.stored_model().unwrap().as_deref(), Some("new-model"));
        drop(store);
        IndexStore::open(&path, "new-model").unwrap();
    }

    #[test]
    fn decode_vector_handles_unaligned_input() {
        let values = [1.5f32, -2.25];
        let mut bytes = vec![0u8];
        bytes.extend_from_slice(bytemuck::cast_slice(&values));
        assert_eq!(decode_vector(&bytes[1..]), values.to_vec());
    }
}
