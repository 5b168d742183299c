use std::sync::Arc;

use serde::Serialize;

use crate::{
    embedding::{ColbertEmbedder, Embedder, HashingEmbedder},
    error::{Error, Result},
    reranker::{self, PairScorer, RankedCandidate},
    settings::{EmbedderKind, MAX_QUERY_CHARS, Settings},
    shared::IndexGeneration,
    text::truncate_at_word,
};

/// A stage-1 hit. `rank` is 1-based.
#[derive(Debug, Clone, PartialEq)]
pub struct RetrievalCandidate {
    pub chunk_id: String,
    pub score: f32,
    pub rank: usize,
}

/// Reject empty or overlong questions. Returns the trimmed query.
pub fn validate_query(query: &str) -> Result<&str> {
    let trimmed = query.trim();
    if trimmed.is_empty() {
        return Err(Error::InvalidQuery("query is empty".into()));
    }
    let chars = trimmed.chars().count();
    if chars > MAX_QUERY_CHARS {
        return Err(Error::InvalidQuery(format!(
            "query is {chars} characters long, the limit is {MAX_QUERY_CHARS}"
        )));
    }
    Ok(trimmed)
}

/// Stage 1: embed the query and take the `recall_k` nearest chunks.
///
/// The embedder must be the one the index was built with. An empty index
/// yields no candidates without touching the model.
pub fn retrieve(
    snapshot: &IndexGeneration,
    embedder: &dyn Embedder,
    query: &str,
    recall_k: usize,
) -> Result<Vec<RetrievalCandidate>> {
    let query = validate_query(query)?;

    if embedder.model_id() != snapshot.model_id() {
        return Err(Error::IndexIncompatible {
            stored: snapshot.model_id().to_string(),
            configured: embedder.model_id().to_string(),
        });
    }
    if snapshot.is_empty() || recall_k == 0 {
        return Ok(Vec::new());
    }

    let vector = embedder.embed_query(query)?;
    let hits = snapshot.index().search(&vector, recall_k)?;

    tracing::debug!(
        generation = snapshot.number(),
        hits = hits.len(),
        recall_k,
        "stage-1 retrieval"
    );

    Ok(hits
        .into_iter()
        .enumerate()
        .map(|(i, hit)| RetrievalCandidate {
            chunk_id: hit.chunk_id,
            score: hit.score,
            rank: i + 1,
        })
        .collect())
}

fn stages(
    settings: &Settings,
    colbert: &Arc<ColbertEmbedder>,
) -> (Arc<dyn Embedder>, Arc<dyn PairScorer>) {
    let embedder: Arc<dyn Embedder> = match settings.embedder {
        EmbedderKind::Colbert => colbert.clone(),
        EmbedderKind::Hashing => Arc::new(HashingEmbedder::default()),
    };
    (embedder, reranker::from_settings(settings, colbert))
}

/// Both retrieval stages, configured once.
#[derive(Clone)]
pub struct Retriever {
    embedder: Arc<dyn Embedder>,
    scorer: Arc<dyn PairScorer>,
    recall_k: usize,
    precision_k: usize,
}

impl Retriever {
    pub fn new(
        embedder: Arc<dyn Embedder>,
        scorer: Arc<dyn PairScorer>,
        recall_k: usize,
        precision_k: usize,
    ) -> Self {
        Self {
            embedder,
            scorer,
            recall_k,
            precision_k,
        }
    }

    /// Both stages share one ColBERT instance, so the checkpoint is loaded
    /// at most once.
    pub fn from_settings(settings: &Settings) -> Self {
        let colbert = Arc::new(ColbertEmbedder::new(&settings.model));
        let (embedder, scorer) = stages(settings, &colbert);
        Self::new(embedder, scorer, settings.recall_k, settings.precision_k)
    }

    pub fn embedder(&self) -> &Arc<dyn Embedder> {
        &self.embedder
    }

    pub fn precision_k(&self) -> usize {
        self.precision_k
    }

    /// Use a different final cut-off, clamped to the recall depth.
    pub fn with_precision_k(mut self, precision_k: usize) -> Self {
        self.precision_k = precision_k.min(self.recall_k);
        self
    }

    /// Stage 1 followed by stage 2 against one snapshot.
    pub fn run(&self, snapshot: &IndexGeneration, query: &str) -> Result<Vec<RankedCandidate>> {
        let candidates = retrieve(snapshot, self.embedder.as_ref(), query, self.recall_k)?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }
        reranker::rerank(
            self.scorer.as_ref(),
            query.trim(),
            &candidates,
            snapshot,
            self.precision_k,
        )
    }
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("embedder", &self.embedder.model_id())
            .field("scorer", &self.scorer.name())
            .field("recall_k", &self.recall_k)
            .field("precision_k", &self.precision_k)
            .finish()
    }
}

/// A reranked excerpt with enough metadata to print it.
#[derive(Debug, Clone, Serialize)]
pub struct FinalResult {
    pub rank: usize,
    pub score: f32,
    pub stage1_score: f32,
    pub chunk_id: String,
    pub document_id: String,
    pub title: String,
    pub pages: String,
    pub text: String,
}

/// Resolve reranked candidates against the snapshot they came from.
pub fn resolve(snapshot: &IndexGeneration, ranked: &[RankedCandidate]) -> Vec<FinalResult> {
    ranked
        .iter()
        .filter_map(|r| {
            let chunk = snapshot.chunk(&r.chunk_id)?;
            let title = snapshot
                .document(&chunk.document_id)
                .map(|d| d.title.clone())
                .unwrap_or_default();
            Some(FinalResult {
                rank: 0,
                score: r.score,
                stage1_score: r.stage1_score,
                chunk_id: r.chunk_id.clone(),
                document_id: chunk.document_id.to_string(),
                title,
                pages: chunk.page_label(),
                text: chunk.text.clone(),
            })
        })
        .enumerate()
        .map(|(i, mut r)| {
            r.rank = i + 1;
            r
        })
        .collect()
}

/// Format results for human-readable terminal output.
pub fn format_human(results: &[FinalResult]) {
    if results.is_empty() {
        println!("No results found.");
        return;
    }

    for r in results {
        println!(
            "{:>3}. [{:.3}] {}, {} ({})",
            r.rank, r.score, r.document_id, r.pages, r.title
        );
        let preview = r.text.replace('\n', " ");
        let cut = truncate_at_word(&preview, 200);
        if cut.len() < preview.len() {
            println!("     {cut} [...]");
        } else {
            println!("     {cut}");
        }
    }
    println!("\n{} result(s)", results.len());
}

/// Format results as JSON output.
pub fn format_json(results: &[FinalResult], query: &str) -> Result<()> {
    let value = serde_json::json!({
        "query": query,
        "result_count": results.len(),
        "results": results,
    });
    println!("{}", serde_json::to_string_pretty(&value)?);
    Ok(())
}
