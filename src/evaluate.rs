//! Retrieval hit rate measured with synthetic questions.
//!
//! A random sample of indexed chunks is drawn and the generator writes one
//! question per chunk, seeing only that chunk. Both retrieval stages then
//! run on the question. A sample is a hit when its own chunk is among the
//! final results.

use std::{sync::Arc, time::Duration};

use rand::{SeedableRng, rngs::StdRng, seq::index};
use serde::Serialize;

use crate::{
    document::Chunk,
    error::{Error, GenerationFailure, Result},
    generator::{GenerationRequest, Generator, generate_within},
    retrieval::Retriever,
    retry::RetryPolicy,
    settings::Settings,
    shared::IndexGeneration,
};

pub const DEFAULT_SAMPLES: usize = 5;

/// Instruction for the question writer.
pub const QUESTION_INSTRUCTION: &str = "\
Você elabora perguntas para avaliar um sistema de busca sobre relatórios do \
Banco Central do Brasil. Leia o trecho e escreva uma única pergunta, em \
português, que possa ser respondida somente com as informações desse \
trecho. Responda apenas com a pergunta, sem comentários.";

const QUESTION_REQUEST: &str = "Escreva a pergunta.";

/// What happened to one sampled chunk.
#[derive(Debug, Clone, Serialize)]
pub struct SampleOutcome {
    pub chunk_id: String,
    pub document_id: String,
    pub pages: String,
    pub question: Option<String>,
    /// 1-based position of the sampled chunk in the final results.
    pub hit_rank: Option<usize>,
    pub error: Option<String>,
}

impl SampleOutcome {
    fn new(chunk: &Chunk) -> Self {
        Self {
            chunk_id: chunk.id.clone(),
            document_id: chunk.document_id.to_string(),
            pages: chunk.page_label(),
            question: None,
            hit_rank: None,
            error: None,
        }
    }

    pub fn is_hit(&self) -> bool {
        self.hit_rank.is_some()
    }

    pub fn is_failed(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EvaluationReport {
    pub seed: u64,
    /// How many final results each question was allowed.
    pub cutoff: usize,
    pub samples: Vec<SampleOutcome>,
}

impl EvaluationReport {
    pub fn hits(&self) -> usize {
        self.samples.iter().filter(|s| s.is_hit()).count()
    }

    pub fn failed(&self) -> usize {
        self.samples.iter().filter(|s| s.is_failed()).count()
    }

    /// Samples that produced a question and ran retrieval.
    pub fn evaluated(&self) -> usize {
        self.samples.len() - self.failed()
    }

    /// Hits over evaluated samples. Failed samples measure the generator,
    /// not retrieval, and are left out.
    pub fn hit_rate(&self) -> Option<f64> {
        match self.evaluated() {
            0 => None,
            n => Some(self.hits() as f64 / n as f64),
        }
    }

    /// Mean of `1 / hit_rank` over evaluated samples, misses counting 0.
    pub fn mean_reciprocal_rank(&self) -> Option<f64> {
        match self.evaluated() {
            0 => None,
            n => {
                let sum: f64 = self
                    .samples
                    .iter()
                    .filter_map(|s| s.hit_rank)
                    .map(|rank| 1.0 / rank as f64)
                    .sum();
                Some(sum / n as f64)
            }
        }
    }
}

/// Pick up to `count` distinct chunks. The same seed over the same index
/// always picks the same chunks.
pub fn sample_chunks(snapshot: &IndexGeneration, count: usize, seed: u64) -> Vec<&Chunk> {
    let mut chunks: Vec<&Chunk> = snapshot.chunks().collect();
    chunks.sort_by(|a, b| a.id.cmp(&b.id));

    let amount = count.min(chunks.len());
    let mut rng = StdRng::seed_from_u64(seed);
    index::sample(&mut rng, chunks.len(), amount)
        .into_iter()
        .map(|i| chunks[i])
        .collect()
}

/// First non-empty line of a generator reply, without quotes or a leading
/// "Pergunta:" label.
pub fn clean_question(reply: &str) -> Option<String> {
    let line = reply.lines().map(str::trim).find(|l| !l.is_empty())?;
    let line = match line.split_once(':') {
        Some((label, rest)) if label.trim().eq_ignore_ascii_case("pergunta") => rest.trim(),
        _ => line,
    };
    let line = line.trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '«' | '»'));
    let line = line.trim();
    (!line.is_empty()).then(|| line.to_string())
}

/// Runs synthetic-question evaluations against one index snapshot.
pub struct Evaluator {
    retriever: Retriever,
    generator: Arc<dyn Generator>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl Evaluator {
    pub fn new(retriever: Retriever, generator: Arc<dyn Generator>, settings: &Settings) -> Self {
        Self {
            retriever,
            generator,
            timeout: settings.generator_timeout(),
            retry: settings.retry_policy(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Sample `samples` chunks with `seed` and score retrieval on each.
    ///
    /// A failure on one sample is recorded in its outcome. An index built
    /// with another embedder fails the whole run.
    pub async fn evaluate(
        &self,
        snapshot: Arc<IndexGeneration>,
        samples: usize,
        seed: u64,
    ) -> Result<EvaluationReport> {
        let configured = self.retriever.embedder().model_id();
        if configured != snapshot.model_id() {
            return Err(Error::IndexIncompatible {
                stored: snapshot.model_id().to_string(),
                configured: configured.to_string(),
            });
        }

        let picked: Vec<Chunk> = sample_chunks(&snapshot, samples, seed)
            .into_iter()
            .cloned()
            .collect();
        tracing::info!(samples = picked.len(), seed, "evaluating retrieval");

        let mut outcomes = Vec::with_capacity(picked.len());
        for chunk in &picked {
            let mut outcome = SampleOutcome::new(chunk);
            match self.score(&snapshot, chunk).await {
                Ok((question, hit_rank)) => {
                    outcome.question = Some(question);
                    outcome.hit_rank = hit_rank;
                }
                Err(e) => {
                    tracing::warn!(chunk = %chunk.id, error = %e, "evaluation sample failed");
                    outcome.error = Some(e.to_string());
                }
            }
            outcomes.push(outcome);
        }

        let report = EvaluationReport {
            seed,
            cutoff: self.retriever.precision_k(),
            samples: outcomes,
        };
        tracing::info!(
            hits = report.hits(),
            evaluated = report.evaluated(),
            failed = report.failed(),
            "evaluation finished"
        );
        Ok(report)
    }

    async fn score(
        &self,
        snapshot: &Arc<IndexGeneration>,
        chunk: &Chunk,
    ) -> Result<(String, Option<usize>)> {
        let request = GenerationRequest {
            instruction: QUESTION_INSTRUCTION.to_string(),
            context: chunk.text.clone(),
            question: QUESTION_REQUEST.to_string(),
        };
        let reply = self
            .retry
            .retry("synthesize question", || {
                generate_within(self.generator.as_ref(), &request, self.timeout)
            })
            .await?;
        let question = clean_question(&reply).ok_or_else(|| {
            Error::Generation(GenerationFailure::permanent(format!(
                "{} wrote no question",
                self.generator.name()
            )))
        })?;

        let retriever = self.retriever.clone();
        let snapshot = Arc::clone(snapshot);
        let query = question.clone();
        let ranked = tokio::task::spawn_blocking(move || retriever.run(&snapshot, &query))
            .await
            .map_err(|e| Error::Model(format!("retrieval worker failed: {e}")))??;

        let hit_rank = ranked
            .iter()
            .position(|r| r.chunk_id == chunk.id)
            .map(|i| i + 1);
        tracing::debug!(chunk = %chunk.id, %question, ?hit_rank, "evaluation sample");
        Ok((question, hit_rank))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    };

    use async_trait::async_trait;

    use super::*;
    use crate::{
        document::RawDocument,
        embedding::{Embedder, HashingEmbedder},
        ingest::ingest_document,
        reranker::LexicalScorer,
        shared::SharedIndex,
    };

    /// Asks about the first sentence of whatever excerpt it is shown.
    struct Parrot {
        calls: AtomicUsize,
        failing_calls: Mutex<Vec<usize>>,
    }

    impl Parrot {
        fn new(failing_calls: Vec<usize>) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                failing_calls: Mutex::new(failing_calls),
            })
        }
    }

    #[async_trait]
    impl Generator for Parrot {
        fn name(&self) -> &str {
            "parrot"
        }

        async fn generate(&self, request: &GenerationRequest) -> Result<String> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            assert_eq!(request.instruction, QUESTION_INSTRUCTION);
            if self.failing_calls.lock().unwrap().contains(&call) {
                return Ok("   \n".into());
            }
            let sentence = request.context.split('.').next().unwrap_or_default();
            Ok(format!("Pergunta: \"{}?\"\n", sentence.trim()))
        }
    }

    fn corpus(tmp: &tempfile::TempDir) -> (SharedIndex, Retriever) {
        let embedder = Arc::new(HashingEmbedder::default());
        let shared = SharedIndex::open(
            &tmp.path().join("index.redb"),
            embedder.model_id(),
            Settings::default().ann(),
        )
        .unwrap();
        let pages = [
            "O Copom elevou a taxa Selic para 10,75% ao ano.",
            "A projeção de inflação para 2025 é 4,5%, acima da meta.",
            "O mercado de trabalho segue aquecido com desemprego baixo.",
            "O crédito às famílias desacelerou no segundo semestre.",
        ];
        ingest_document(
            &shared,
            embedder.as_ref(),
            &Settings::default().chunking(),
            &RawDocument {
                id: "RI-2024Q4".into(),
                title: None,
                published: None,
                source: None,
                pages: pages.iter().map(|p| p.to_string()).collect(),
            },
            false,
        )
        .unwrap();
        let retriever = Retriever::new(embedder, Arc::new(LexicalScorer::default()), 4, 1);
        (shared, retriever)
    }

    fn outcome(hit_rank: Option<usize>, error: Option<&str>) -> SampleOutcome {
        SampleOutcome {
            chunk_id: "RI-2024Q4:f:00000000".into(),
            document_id: "RI-2024Q4".into(),
            pages: "p. 1".into(),
            question: error.is_none().then(|| "pergunta?".into()),
            hit_rank,
            error: error.map(str::to_string),
        }
    }

    #[test]
    fn clean_question_strips_labels_and_quotes() {
        assert_eq!(
            clean_question("\n  Pergunta: \"Qual a meta?\"\nExplicação...").as_deref(),
            Some("Qual a meta?")
        );
        assert_eq!(clean_question("Qual a Selic?").as_deref(), Some("Qual a Selic?"));
        assert_eq!(clean_question("  \n\n"), None);
        assert_eq!(clean_question("Pergunta: \"\""), None);
    }

    #[test]
    fn report_rates_skip_failed_samples() {
        let report = EvaluationReport {
            seed: 1,
            cutoff: 5,
            samples: vec![
                outcome(Some(1), None),
                outcome(Some(2), None),
                outcome(None, None),
                outcome(None, Some("timeout")),
            ],
        };
        assert_eq!(report.hits(), 2);
        assert_eq!(report.evaluated(), 3);
        assert_eq!(report.failed(), 1);
        assert!((report.hit_rate().unwrap() - 2.0 / 3.0).abs() < 1e-9);
        assert!((report.mean_reciprocal_rank().unwrap() - 0.5).abs() < 1e-9);

        let empty = EvaluationReport {
            seed: 1,
            cutoff: 5,
            samples: vec![outcome(None, Some("x"))],
        };
        assert_eq!(empty.hit_rate(), None);
    }

    #[test]
    fn sampling_is_seeded_and_bounded() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, _) = corpus(&tmp);
        let snapshot = shared.snapshot().unwrap();

        let ids = |seed| -> Vec<String> {
            sample_chunks(&snapshot, 2, seed).iter().map(|c| c.id.clone()).collect()
        };
        assert_eq!(ids(7), ids(7));
        assert_eq!(ids(7).len(), 2);

        let mut all: Vec<String> = sample_chunks(&snapshot, 50, 3)
            .iter()
            .map(|c| c.id.clone())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), snapshot.chunk_count());
    }

    #[tokio::test]
    async fn questions_from_a_chunk_retrieve_it() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = corpus(&tmp);
        let generator = Parrot::new(vec![]);
        let evaluator = Evaluator::new(retriever, generator.clone(), &Settings::default());

        let report = evaluator.evaluate(shared.snapshot().unwrap(), 4, 11).await.unwrap();

        assert_eq!(report.samples.len(), 4);
        assert_eq!(report.cutoff, 1);
        assert_eq!(report.hits(), 4);
        assert_eq!(report.hit_rate(), Some(1.0));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 4);
        assert!(report.samples.iter().all(|s| s.hit_rank == Some(1)));
    }

    #[tokio::test]
    async fn a_blank_question_fails_only_its_sample() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = corpus(&tmp);
        let evaluator = Evaluator::new(retriever, Parrot::new(vec![2]), &Settings::default())
            .with_retry_policy(RetryPolicy::none());

        let report = evaluator.evaluate(shared.snapshot().unwrap(), 3, 5).await.unwrap();

        assert_eq!(report.samples.len(), 3);
        assert_eq!(report.failed(), 1);
        assert!(report.samples[1].is_failed());
        assert_eq!(report.evaluated(), 2);
    }

    #[tokio::test]
    async fn other_embedder_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, _) = corpus(&tmp);
        let retriever = Retriever::new(
            Arc::new(HashingEmbedder::new(64)),
            Arc::new(LexicalScorer::default()),
            4,
            1,
        );
        let evaluator = Evaluator::new(retriever, Parrot::new(vec![]), &Settings::default());

        let result = evaluator.evaluate(shared.snapshot().unwrap(), 2, 0).await;
        assert!(matches!(result, Err(Error::IndexIncompatible { .. })));
    }

    #[tokio::test]
    async fn empty_index_yields_empty_report() {
        let tmp = tempfile::tempdir().unwrap();
        let embedder = Arc::new(HashingEmbedder::default());
        let shared = SharedIndex::open(
            &tmp.path().join("index.redb"),
            embedder.model_id(),
            Settings::default().ann(),
        )
        .unwrap();
        let retriever = Retriever::new(embedder, Arc::new(LexicalScorer::default()), 4, 1);
        let generator = Parrot::new(vec![]);
        let evaluator = Evaluator::new(retriever, generator.clone(), &Settings::default());

        let report = evaluator.evaluate(shared.snapshot().unwrap(), 5, 0).await.unwrap();
        assert!(report.samples.is_empty());
        assert_eq!(report.hit_rate(), None);
        assert_eq!(generator.calls.load(Ordering::SeqCst), 0);
    }
}
