use std::{
    collections::{HashMap, HashSet},
    sync::Arc,
};

use candle_core::Tensor;
use rayon::prelude::*;

use crate::{
    document::Chunk,
    embedding::ColbertEmbedder,
    error::{Error, Result},
    retrieval::RetrievalCandidate,
    settings::{RerankerKind, Settings},
    shared::IndexGeneration,
    text::{content_tokens, is_negation, is_numeric_token, tokenize},
};

/// A candidate after joint (query, chunk) scoring.
#[derive(Debug, Clone, PartialEq)]
pub struct RankedCandidate {
    pub chunk_id: String,
    pub score: f32,
    pub stage1_rank: usize,
    pub stage1_score: f32,
}

/// Scores (query, chunk) pairs jointly.
pub trait PairScorer: Send + Sync {
    fn name(&self) -> &'static str;

    /// One score per candidate, in input order. Higher is better.
    fn score(&self, query: &str, candidates: &[(&RetrievalCandidate, &Chunk)]) -> Result<Vec<f32>>;
}

/// Build the scorer selected in `settings`.
///
/// `maxsim` scores with `colbert`, so a caller that also embeds with ColBERT
/// can hand over the same instance and load the checkpoint once.
pub fn from_settings(settings: &Settings, colbert: &Arc<ColbertEmbedder>) -> Arc<dyn PairScorer> {
    match settings.reranker {
        RerankerKind::MaxSim => Arc::new(MaxSimScorer::new(Arc::clone(colbert))),
        RerankerKind::Lexical => Arc::new(LexicalScorer::default()),
    }
}

/// Rerank stage-1 candidates and keep the best `precision_k`.
///
/// Candidates whose chunk is missing from the snapshot are skipped. The
/// result is sorted by score descending, ties by stage-1 rank, and is always
/// a subset of the input.
pub fn rerank(
    scorer: &dyn PairScorer,
    query: &str,
    candidates: &[RetrievalCandidate],
    snapshot: &IndexGeneration,
    precision_k: usize,
) -> Result<Vec<RankedCandidate>> {
    if candidates.is_empty() || precision_k == 0 {
        return Ok(Vec::new());
    }

    let resolved: Vec<(&RetrievalCandidate, &Chunk)> = candidates
        .iter()
        .filter_map(|c| match snapshot.chunk(&c.chunk_id) {
            Some(chunk) => Some((c, chunk)),
            None => {
                tracing::warn!(chunk = %c.chunk_id, "candidate chunk missing from index");
                None
            }
        })
        .collect();
    if resolved.is_empty() {
        return Ok(Vec::new());
    }

    let scores = scorer.score(query, &resolved)?;
    if scores.len() != resolved.len() {
        return Err(Error::Model(format!(
            "{} scorer returned {} scores for {} candidates",
            scorer.name(),
            scores.len(),
            resolved.len()
        )));
    }

    let mut ranked: Vec<RankedCandidate> = resolved
        .iter()
        .zip(scores)
        .map(|((candidate, _), score)| RankedCandidate {
            chunk_id: candidate.chunk_id.clone(),
            score,
            stage1_rank: candidate.rank,
            stage1_score: candidate.score,
        })
        .collect();

    // Sort by score descending, then by stage-1 rank.
    ranked.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.stage1_rank.cmp(&b.stage1_rank))
    });
    ranked.truncate(precision_k);

    tracing::debug!(
        scorer = scorer.name(),
        candidates = candidates.len(),
        kept = ranked.len(),
        "reranked"
    );
    Ok(ranked)
}

/// ColBERT late interaction computed over each pair at query time.
pub struct MaxSimScorer {
    model: Arc<ColbertEmbedder>,
}

impl MaxSimScorer {
    pub fn new(model: Arc<ColbertEmbedder>) -> Self {
        Self { model }
    }
}

impl PairScorer for MaxSimScorer {
    fn name(&self) -> &'static str {
        "maxsim"
    }

    fn score(&self, query: &str, candidates: &[(&RetrievalCandidate, &Chunk)]) -> Result<Vec<f32>> {
        let query_embedding = self.model.query_tokens(query)?;
        let texts: Vec<String> = candidates.iter().map(|(_, c)| c.text.clone()).collect();
        let documents = self.model.document_tokens(&texts)?;

        let per_document: Vec<Tensor> = (0..candidates.len())
            .map(|i| documents.get(i))
            .collect::<std::result::Result<_, _>>()?;

        // Compute MaxSim in parallel across candidates.
        per_document
            .par_iter()
            .map(|doc| maxsim(&query_embedding, doc))
            .collect()
    }
}

/// Compute the MaxSim score between a query embedding and a document embedding.
///
/// query_embedding: [Q, D] where Q = query tokens, D = embedding dimension
/// doc_embedding: [T, D] where T = document tokens, D = embedding dimension
///
/// MaxSim = sum over query tokens of max(query_token . doc_token for all doc tokens)
fn maxsim(query_embedding: &Tensor, doc_embedding: &Tensor) -> Result<f32> {
    // Compute similarity matrix [Q, T] = query_emb @ doc_emb^T
    let sim_matrix = query_embedding.matmul(&doc_embedding.t()?)?;

    // Take max along dimension 1 (best document token per query token)
    let row_maxes = sim_matrix.max(1)?;

    // Sum the maxes to get the final score
    Ok(row_maxes.sum_all()?.to_scalar::<f32>()?)
}

/// Model-free pair scorer.
///
/// Combines IDF-weighted coverage of the query's content words (IDF taken
/// over the candidate set), a penalty for every number in the query that the
/// chunk does not contain, a penalty when the chunk's polarity around the
/// query terms disagrees with the query's, and a small share of the stage-1
/// similarity.
#[derive(Debug, Clone, Copy)]
pub struct LexicalScorer {
    pub numeric_miss_penalty: f32,
    pub negation_penalty: f32,
    pub stage1_weight: f32,
    /// Tokens before a query term in which a negation counts against it.
    pub negation_window: usize,
}

impl Default for LexicalScorer {
    fn default() -> Self {
        Self {
            numeric_miss_penalty: 0.15,
            negation_penalty: 0.1,
            stage1_weight: 0.2,
            negation_window: 3,
        }
    }
}

impl LexicalScorer {
    fn negates_terms(&self, tokens: &[String], terms: &HashSet<&str>) -> bool {
        tokens.iter().enumerate().any(|(i, token)| {
            terms.contains(token.as_str())
                && tokens[i.saturating_sub(self.negation_window)..i]
                    .iter()
                    .any(|t| is_negation(t))
        })
    }
}

impl PairScorer for LexicalScorer {
    fn name(&self) -> &'static str {
        "lexical"
    }

    fn score(&self, query: &str, candidates: &[(&RetrievalCandidate, &Chunk)]) -> Result<Vec<f32>> {
        let mut terms: Vec<String> = content_tokens(query);
        terms.sort();
        terms.dedup();
        let terms: Vec<&str> = terms.iter().map(String::as_str).collect();
        let term_set: HashSet<&str> = terms.iter().copied().collect();
        let query_negated = tokenize(query).iter().any(|t| is_negation(t));

        let tokenized: Vec<Vec<String>> = candidates
            .par_iter()
            .map(|(_, chunk)| tokenize(&chunk.text))
            .collect();
        let token_sets: Vec<HashSet<&str>> = tokenized
            .iter()
            .map(|tokens| tokens.iter().map(String::as_str).collect())
            .collect();

        let n = candidates.len() as f32;
        let idf: HashMap<&str, f32> = terms
            .iter()
            .map(|&term| {
                let df = token_sets.iter().filter(|set| set.contains(term)).count() as f32;
                (term, ((n - df + 0.5) / (df + 0.5) + 1.0).ln())
            })
            .collect();
        let total_weight: f32 = idf.values().sum();

        let scores = candidates
            .iter()
            .zip(tokenized.iter().zip(&token_sets))
            .map(|((candidate, _), (tokens, set))| {
                let coverage = if total_weight > 0.0 {
                    terms
                        .iter()
                        .filter(|t| set.contains(*t))
                        .map(|t| idf[t])
                        .sum::<f32>()
                        / total_weight
                } else {
                    0.0
                };

                let missing_numbers = terms
                    .iter()
                    .filter(|t| is_numeric_token(t) && !set.contains(*t))
                    .count() as f32;

                let chunk_negated = self.negates_terms(tokens, &term_set);
                let negation = if query_negated != chunk_negated {
                    self.negation_penalty
                } else {
                    0.0
                };

                coverage - missing_numbers * self.numeric_miss_penalty - negation
                    + self.stage1_weight * candidate.score
            })
            .collect();

        Ok(scores)
    }
}
