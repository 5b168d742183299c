//! Embedders turn chunk and query text into fixed-dimension vectors.
//!
//! Every embedder carries a model id. The index records the id it was built
//! with and refuses to load under a different one, since vectors from
//! different models are not comparable.

use std::sync::{Arc, Mutex};

use candle_core::Tensor;

use crate::{
    error::{Error, Result},
    model_manager::ModelManager,
    settings::{EmbedderKind, Settings},
    text::content_tokens,
};

/// Documents sent to the model per forward pass.
const EMBED_BATCH_SIZE: usize = 32;

/// Default dimension of the hashing embedder.
pub const DEFAULT_HASHING_DIMENSION: usize = 384;

pub trait Embedder: Send + Sync {
    /// Identifier stored alongside the vectors it produced.
    fn model_id(&self) -> &str;

    /// One L2-normalized vector per input text, in input order.
    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>>;

    /// L2-normalized vector for a query.
    fn embed_query(&self, query: &str) -> Result<Vec<f32>>;
}

/// Scale `vector` to unit length in place. Zero vectors are left alone.
pub fn normalize(vector: &mut [f32]) {
    let norm = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > f32::EPSILON {
        vector.iter_mut().for_each(|x| *x /= norm);
    }
}

/// Build the embedder selected in `settings`.
pub fn from_settings(settings: &Settings) -> Arc<dyn Embedder> {
    match settings.embedder {
        EmbedderKind::Colbert => Arc::new(ColbertEmbedder::new(&settings.model)),
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::default()),
    }
}

/// Single-vector embeddings from a ColBERT model: token embeddings are
/// mean-pooled, then normalized.
///
/// The underlying model is loaded lazily on first use.
pub struct ColbertEmbedder {
    model: Mutex<ModelManager>,
    model_id: String,
}

impl ColbertEmbedder {
    pub fn new(model: &str) -> Self {
        Self {
            model: Mutex::new(ModelManager::new(model)),
            model_id: format!("colbert:{model}"),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, ModelManager>> {
        self.model
            .lock()
            .map_err(|_| Error::Model("model lock poisoned".into()))
    }

    /// Token-level query embeddings, `[Q, D]`.
    pub fn query_tokens(&self, query: &str) -> Result<Tensor> {
        self.lock()?.encode_query(query)
    }

    /// Token-level document embeddings, `[B, T, D]`.
    pub fn document_tokens(&self, texts: &[String]) -> Result<Tensor> {
        self.lock()?.encode_documents(texts)
    }
}

impl Embedder for ColbertEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        let mut vectors = Vec::with_capacity(texts.len());
        for batch in texts.chunks(EMBED_BATCH_SIZE) {
            let tokens = self.document_tokens(batch)?;
            // [B, T, D] -> [B, D]
            let pooled: Vec<Vec<f32>> = tokens.mean(1)?.to_vec2()?;
            vectors.extend(pooled.into_iter().map(|mut v| {
                normalize(&mut v);
                v
            }));
        }
        Ok(vectors)
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        let mut vector: Vec<f32> = self.query_tokens(query)?.mean(0)?.to_vec1()?;
        normalize(&mut vector);
        Ok(vector)
    }
}

/// Model-free embedder using signed feature hashing of content words and
/// their character trigrams.
///
/// Deterministic and instant, which makes it the embedder of choice for
/// tests and for machines that cannot run the ColBERT model.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
    model_id: String,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(DEFAULT_HASHING_DIMENSION)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        let dimension = dimension.max(1);
        Self {
            dimension,
            model_id: format!("hashing-v1-{dimension}"),
        }
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    fn add_feature(&self, vector: &mut [f32], feature: &str, weight: f32) {
        let hash = blake3::hash(feature.as_bytes());
        let bytes = hash.as_bytes();
        let mut head = [0u8; 8];
        head.copy_from_slice(&bytes[..8]);
        let h = u64::from_le_bytes(head);

        let slot = (h % self.dimension as u64) as usize;
        let sign = if h >> 63 == 0 { 1.0 } else { -1.0 };
        vector[slot] += sign * weight;
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0; self.dimension];
        for token in content_tokens(text) {
            self.add_feature(&mut vector, &format!("w:{token}"), 1.0);

            let chars: Vec<char> = token.chars().collect();
            if chars.len() > 3 {
                for window in chars.windows(3) {
                    let gram: String = window.iter().collect();
                    self.add_feature(&mut vector, &format!("g:{gram}"), 0.25);
                }
            }
        }
        normalize(&mut vector);
        vector
    }
}

impl Embedder for HashingEmbedder {
    fn model_id(&self) -> &str {
        &self.model_id
    }

    fn embed_documents(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed(t)).collect())
    }

    fn embed_query(&self, query: &str) -> Result<Vec<f32>> {
        Ok(self.embed(query))
    }
}
