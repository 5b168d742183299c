//! In-memory vector index over chunk embeddings.
//!
//! Small indexes are scanned exhaustively. Once the index reaches
//! `train_threshold` vectors it is partitioned with spherical k-means into
//! `sqrt(n)` inverted lists, and queries only score the lists whose
//! centroids are closest to the query. List membership is always "nearest
//! centroid, lowest index on ties", so an index restored from its vectors and
//! centroids answers exactly like the one that was saved.

use std::{cmp::Ordering, collections::HashMap};

use rayon::prelude::*;

use crate::{
    embedding::normalize,
    error::{Error, Result},
};

/// Lloyd iterations per training run.
const KMEANS_ITERATIONS: usize = 10;

/// Retrain once the index has grown this many times past its last training.
const RETRAIN_GROWTH: usize = 4;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AnnConfig {
    /// Vector count at which the index switches to inverted lists.
    pub train_threshold: usize,
    /// Lists scanned per query.
    pub probes: usize,
}

impl Default for AnnConfig {
    fn default() -> Self {
        Self {
            train_threshold: 1024,
            probes: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchHit {
    pub chunk_id: String,
    pub score: f32,
}

/// Trained k-means partition of the index.
#[derive(Debug, Clone)]
struct InvertedLists {
    /// `nlist * dimension` normalized centroids.
    centroids: Vec<f32>,
    /// Slot indices per centroid.
    lists: Vec<Vec<usize>>,
    /// Vector count when the centroids were trained.
    trained_at: usize,
}

/// Persistable form of the trained partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Centroids {
    pub vectors: Vec<Vec<f32>>,
    pub trained_at: usize,
}

#[derive(Debug, Clone)]
pub struct VectorIndex {
    config: AnnConfig,
    dimension: Option<usize>,
    ids: Vec<String>,
    data: Vec<f32>,
    slots: HashMap<String, usize>,
    ivf: Option<InvertedLists>,
}

fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

fn by_score_then_id(a: &SearchHit, b: &SearchHit) -> Ordering {
    b.score
        .partial_cmp(&a.score)
        .unwrap_or(Ordering::Equal)
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

impl VectorIndex {
    pub fn new(config: AnnConfig) -> Self {
        Self {
            config,
            dimension: None,
            ids: Vec::new(),
            data: Vec::new(),
            slots: HashMap::new(),
            ivf: None,
        }
    }

    /// Rebuild an index from persisted parts.
    ///
    /// Vectors are taken as stored (already normalized). When centroids are
    /// given, list membership is recomputed from them instead of retraining.
    pub fn from_parts(
        config: AnnConfig,
        dimension: Option<usize>,
        entries: Vec<(String, Vec<f32>)>,
        centroids: Option<Centroids>,
    ) -> Result<Self> {
        let mut index = Self::new(config);
        index.dimension = dimension;

        for (chunk_id, vector) in entries {
            index.check_dimension(vector.len())?;
            if index.slots.contains_key(&chunk_id) {
                return Err(Error::DuplicateChunk(chunk_id));
            }
            index.push(chunk_id, &vector);
        }

        match centroids {
            Some(c) if !c.vectors.is_empty() => {
                let dim = *index.dimension.get_or_insert(c.vectors[0].len());
                if let Some(bad) = c.vectors.iter().find(|v| v.len() != dim) {
                    return Err(Error::DimensionMismatch {
                        expected: dim,
                        actual: bad.len(),
                    });
                }
                let flat: Vec<f32> = c.vectors.into_iter().flatten().collect();
                index.ivf = Some(index.partition(flat, c.trained_at));
            }
            _ => index.maybe_train(),
        }

        Ok(index)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.dimension
    }

    pub fn contains(&self, chunk_id: &str) -> bool {
        self.slots.contains_key(chunk_id)
    }

    /// Whether queries go through the inverted lists.
    pub fn is_partitioned(&self) -> bool {
        self.ivf.is_some()
    }

    /// Number of inverted lists, zero while the index is scanned exactly.
    pub fn list_count(&self) -> usize {
        self.ivf.as_ref().map_or(0, |ivf| ivf.lists.len())
    }

    pub fn vector(&self, chunk_id: &str) -> Option<&[f32]> {
        let dim = self.dimension?;
        self.slots
            .get(chunk_id)
            .map(|&slot| &self.data[slot * dim..(slot + 1) * dim])
    }

    /// Iterate over `(chunk_id, vector)` pairs in insertion order.
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[f32])> {
        let dim = self.dimension.unwrap_or(0).max(1);
        self.ids
            .iter()
            .zip(self.data.chunks_exact(dim))
            .map(|(id, v)| (id.as_str(), v))
    }

    pub fn centroids(&self) -> Option<Centroids> {
        let ivf = self.ivf.as_ref()?;
        let dim = self.dimension?;
        Some(Centroids {
            vectors: ivf.centroids.chunks_exact(dim).map(<[f32]>::to_vec).collect(),
            trained_at: ivf.trained_at,
        })
    }

    fn check_dimension(&mut self, actual: usize) -> Result<()> {
        match self.dimension {
            Some(expected) if expected != actual => {
                Err(Error::DimensionMismatch { expected, actual })
            }
            Some(_) => Ok(()),
            None if actual == 0 => Err(Error::DimensionMismatch {
                expected: 1,
                actual,
            }),
            None => {
                self.dimension = Some(actual);
                Ok(())
            }
        }
    }

    fn push(&mut self, chunk_id: String, vector: &[f32]) -> usize {
        let slot = self.ids.len();
        self.slots.insert(chunk_id.clone(), slot);
        self.ids.push(chunk_id);
        self.data.extend_from_slice(vector);
        slot
    }

    /// Append a vector. Existing chunk ids are never overwritten.
    pub fn insert(&mut self, chunk_id: &str, vector: &[f32]) -> Result<()> {
        if self.slots.contains_key(chunk_id) {
            return Err(Error::DuplicateChunk(chunk_id.to_string()));
        }
        self.check_dimension(vector.len())?;

        let mut normalized = vector.to_vec();
        normalize(&mut normalized);
        let slot = self.push(chunk_id.to_string(), &normalized);

        if let Some(dim) = self.dimension
            && let Some(ivf) = self.ivf.as_mut()
        {
            let list = nearest_centroid(&ivf.centroids, dim, &normalized);
            ivf.lists[list].push(slot);
        }

        self.maybe_train();
        Ok(())
    }

    /// Drop every vector whose chunk id matches `predicate`. Returns the
    /// number removed. Centroids are kept; lists are recomputed.
    pub fn remove_where(&mut self, predicate: impl Fn(&str) -> bool) -> usize {
        let Some(dim) = self.dimension else {
            return 0;
        };

        let before = self.ids.len();
        let mut ids = Vec::with_capacity(before);
        let mut data = Vec::with_capacity(self.data.len());
        for (id, vector) in self.ids.drain(..).zip(self.data.chunks_exact(dim)) {
            if !predicate(&id) {
                ids.push(id);
                data.extend_from_slice(vector);
            }
        }
        self.ids = ids;
        self.data = data;
        self.slots = self
            .ids
            .iter()
            .enumerate()
            .map(|(slot, id)| (id.clone(), slot))
            .collect();

        if let Some(ivf) = self.ivf.take() {
            self.ivf = Some(self.partition(ivf.centroids, ivf.trained_at));
        }

        before - self.ids.len()
    }

    /// Top `k` chunks by cosine similarity, highest first, ties broken by
    /// chunk id.
    pub fn search(&self, query: &[f32], k: usize) -> Result<Vec<SearchHit>> {
        let Some(dim) = self.dimension else {
            return Ok(Vec::new());
        };
        if k == 0 || self.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != dim {
            return Err(Error::DimensionMismatch {
                expected: dim,
                actual: query.len(),
            });
        }

        let mut query = query.to_vec();
        normalize(&mut query);

        let score_slot = |slot: usize| SearchHit {
            chunk_id: self.ids[slot].clone(),
            score: dot(&query, &self.data[slot * dim..(slot + 1) * dim]),
        };

        let mut hits: Vec<SearchHit> = match &self.ivf {
            None => (0..self.ids.len()).into_par_iter().map(score_slot).collect(),
            Some(ivf) => self
                .probe(ivf, dim, &query, k)
                .into_par_iter()
                .map(score_slot)
                .collect(),
        };

        hits.sort_by(by_score_then_id);
        hits.truncate(k);
        Ok(hits)
    }

    /// Slots from the closest lists: at least `probes` lists, more while
    /// fewer than `k` vectors have been gathered.
    fn probe(&self, ivf: &InvertedLists, dim: usize, query: &[f32], k: usize) -> Vec<usize> {
        let mut order: Vec<(usize, f32)> = ivf
            .centroids
            .chunks_exact(dim)
            .map(|c| dot(query, c))
            .enumerate()
            .collect();
        order.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        let mut slots = Vec::new();
        for (probed, (list, _)) in order.into_iter().enumerate() {
            if probed >= self.config.probes && slots.len() >= k {
                break;
            }
            slots.extend_from_slice(&ivf.lists[list]);
        }
        slots
    }

    fn maybe_train(&mut self) {
        let n = self.len();
        if n < self.config.train_threshold.max(1) {
            return;
        }
        let due = match &self.ivf {
            None => true,
            Some(ivf) => n >= ivf.trained_at.saturating_mul(RETRAIN_GROWTH),
        };
        if due {
            self.train();
        }
    }

    /// Spherical k-means with `sqrt(n)` centroids.
    ///
    /// Initial centroids are evenly spaced over the vectors sorted by chunk
    /// id, so training is deterministic for a given set of chunks.
    fn train(&mut self) {
        let Some(dim) = self.dimension else {
            return;
        };
        let n = self.len();
        let nlist = ((n as f64).sqrt().round() as usize).clamp(1, n);

        let mut by_id: Vec<usize> = (0..n).collect();
        by_id.sort_by(|&a, &b| self.ids[a].cmp(&self.ids[b]));

        let mut centroids: Vec<f32> = (0..nlist)
            .flat_map(|i| {
                let slot = by_id[i * n / nlist];
                self.data[slot * dim..(slot + 1) * dim].to_vec()
            })
            .collect();

        for _ in 0..KMEANS_ITERATIONS {
            let assignment: Vec<usize> = self
                .data
                .par_chunks_exact(dim)
                .map(|v| nearest_centroid(&centroids, dim, v))
                .collect();

            let mut sums = vec![0.0f32; nlist * dim];
            let mut counts = vec![0usize; nlist];
            for (slot, &list) in assignment.iter().enumerate() {
                counts[list] += 1;
                let v = &self.data[slot * dim..(slot + 1) * dim];
                for (s, x) in sums[list * dim..(list + 1) * dim].iter_mut().zip(v) {
                    *s += x;
                }
            }

            for list in 0..nlist {
                if counts[list] == 0 {
                    continue;
                }
                let mut centroid = sums[list * dim..(list + 1) * dim].to_vec();
                normalize(&mut centroid);
                centroids[list * dim..(list + 1) * dim].copy_from_slice(&centroid);
            }
        }

        tracing::debug!(vectors = n, lists = nlist, "trained inverted lists");
        self.ivf = Some(self.partition(centroids, n));
    }

    fn partition(&self, centroids: Vec<f32>, trained_at: usize) -> InvertedLists {
        let dim = self.dimension.unwrap_or(1).max(1);
        let nlist = centroids.len() / dim;
        let mut lists = vec![Vec::new(); nlist];

        let assignment: Vec<usize> = self
            .data
            .par_chunks_exact(dim)
            .map(|v| nearest_centroid(&centroids, dim, v))
            .collect();
        for (slot, list) in assignment.into_iter().enumerate() {
            lists[list].push(slot);
        }

        InvertedLists {
            centroids,
            lists,
            trained_at,
        }
    }
}

/// Index of the most similar centroid, lowest index on ties.
fn nearest_centroid(centroids: &[f32], dim: usize, vector: &[f32]) -> usize {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (i, centroid) in centroids.chunks_exact(dim).enumerate() {
        let score = dot(centroid, vector);
        if score > best_score {
            best = i;
            best_score = score;
        }
    }
    best
}
