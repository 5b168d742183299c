use std::{sync::Arc, time::Duration};

use tokio::sync::Semaphore;

use crate::{
    context::{AssembledContext, Citation, ContextAssembler},
    error::{Error, Result},
    generator::{GenerationRequest, Generator, generate_within},
    retrieval::{Retriever, validate_query},
    retry::RetryPolicy,
    settings::Settings,
    shared::SharedIndex,
};

/// Returned verbatim when nothing relevant was retrieved.
pub const NO_EVIDENCE_ANSWER: &str = "Não foram encontradas evidências nos relatórios indexados \
                                      para responder a esta pergunta.";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AnswerStatus {
    Grounded,
    NoEvidence,
}

#[derive(Debug, Clone)]
pub struct Answer {
    pub text: String,
    /// Citations the text actually references, in order of first use.
    pub citations: Vec<Citation>,
    /// The excerpts the answer was generated from.
    pub context: AssembledContext,
    pub status: AnswerStatus,
}

impl Answer {
    fn no_evidence(context: AssembledContext) -> Self {
        Self {
            text: NO_EVIDENCE_ANSWER.to_string(),
            citations: Vec::new(),
            context,
            status: AnswerStatus::NoEvidence,
        }
    }
}

/// Parse one `[...]` group body. `None` unless every part is a label.
///
/// The first part must read `Excerpt N`; later parts may be `Excerpt M` or
/// just `M`, separated by commas or semicolons.
fn parse_group(body: &str) -> Option<Vec<usize>> {
    let mut ordinals = Vec::new();
    for (i, part) in body.split([',', ';']).enumerate() {
        let part = part.trim();
        let number = match part.split_once(char::is_whitespace) {
            Some((word, rest)) if word.eq_ignore_ascii_case("excerpt") => rest.trim(),
            _ if i > 0 => part,
            _ => return None,
        };
        if number.is_empty() || !number.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        ordinals.push(number.parse().ok()?);
    }
    Some(ordinals)
}

/// Map `[Excerpt N]` references in `text` back to the context's citations.
///
/// Malformed groups and labels the context does not have are ignored.
pub fn parse_citations(text: &str, context: &AssembledContext) -> Vec<Citation> {
    let mut citations: Vec<Citation> = Vec::new();
    let mut rest = text;

    while let Some(open) = rest.find('[') {
        let after = &rest[open + 1..];
        let Some(close) = after.find(']') else {
            break;
        };
        let body = &after[..close];
        // A nested '[' restarts the scan at the inner bracket.
        if let Some(inner) = body.rfind('[') {
            rest = &after[inner..];
            continue;
        }

        if let Some(ordinals) = parse_group(body) {
            for ordinal in ordinals {
                match context.citation(ordinal) {
                    Some(c) if !citations.contains(c) => citations.push(c.clone()),
                    Some(_) => {}
                    None => tracing::debug!(ordinal, "ignoring citation outside the context"),
                }
            }
        }
        rest = &after[close + 1..];
    }

    citations
}

/// Answers questions against the shared index.
pub struct Orchestrator {
    index: Arc<SharedIndex>,
    retriever: Retriever,
    assembler: ContextAssembler,
    generator: Arc<dyn Generator>,
    timeout: Duration,
    retry: RetryPolicy,
    permits: Arc<Semaphore>,
}

impl Orchestrator {
    pub fn new(
        index: Arc<SharedIndex>,
        retriever: Retriever,
        generator: Arc<dyn Generator>,
        settings: &Settings,
    ) -> Self {
        Self {
            index,
            retriever,
            assembler: ContextAssembler::from_settings(settings),
            generator,
            timeout: settings.generator_timeout(),
            retry: settings.retry_policy(),
            permits: Arc::new(Semaphore::new(settings.max_concurrent_queries.max(1))),
        }
    }

    /// Override the per-attempt generator deadline.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Retrieve, assemble and, if anything was found, generate.
    ///
    /// Fails fast with [`Error::Busy`] when every query slot is taken.
    pub async fn ask(&self, question: &str) -> Result<Answer> {
        let question = validate_query(question)?.to_string();
        let _permit = Arc::clone(&self.permits)
            .try_acquire_owned()
            .map_err(|_| Error::Busy)?;

        let context = self.gather(&question).await?;
        if context.is_empty() {
            tracing::info!("no evidence retrieved, skipping generation");
            return Ok(Answer::no_evidence(context));
        }

        let request = GenerationRequest::grounded(context.render(), &question);
        let text = self
            .retry
            .retry("generate", || self.generate_once(&request))
            .await?;

        let citations = parse_citations(&text, &context);
        tracing::info!(
            excerpts = context.len(),
            cited = citations.len(),
            generator = self.generator.name(),
            "answer generated"
        );

        Ok(Answer {
            text,
            citations,
            context,
            status: AnswerStatus::Grounded,
        })
    }

    /// Run both retrieval stages and context assembly on a blocking worker.
    async fn gather(&self, question: &str) -> Result<AssembledContext> {
        let snapshot = self.index.snapshot()?;
        let retriever = self.retriever.clone();
        let assembler = self.assembler;
        let question = question.to_string();

        tokio::task::spawn_blocking(move || {
            let ranked = retriever.run(&snapshot, &question)?;
            Ok(assembler.assemble(&snapshot, &ranked))
        })
        .await
        .map_err(|e| Error::Model(format!("retrieval worker failed: {e}")))?
    }

    async fn generate_once(&self, request: &GenerationRequest) -> Result<String> {
        generate_within(self.generator.as_ref(), request, self.timeout).await
    }
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("retriever", &self.retriever)
            .field("generator", &self.generator.name())
            .field("timeout", &self.timeout)
            .field("available_permits", &self.permits.available_permits())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
    };

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use super::*;
    use crate::{
        context::ContextEntry,
        document::{Chunk, RawDocument},
        embedding::{Embedder, HashingEmbedder},
        error::GenerationFailure,
        ids::DocumentId,
        ingest::ingest_document,
        reranker::LexicalScorer,
    };

    fn entry(ordinal: usize, doc: &str, page: u32) -> ContextEntry {
        ContextEntry {
            chunk: Chunk {
                id: format!("{doc}:f:{ordinal:08}"),
                document_id: DocumentId::new(doc).unwrap(),
                first_page: page,
                last_page: page,
                start: 0,
                end: 1,
                text: "x".into(),
            },
            citation: Citation {
                document_id: doc.to_string(),
                first_page: page,
                last_page: page,
                ordinal,
            },
            score: 1.0,
            rendered: String::new(),
            truncated: false,
        }
    }

    fn context(n: usize) -> AssembledContext {
        AssembledContext {
            entries: (1..=n).map(|i| entry(i, "RI-2024Q4", i as u32 + 10)).collect(),
            ..AssembledContext::default()
        }
    }

    fn ordinals(citations: &[Citation]) -> Vec<usize> {
        citations.iter().map(|c| c.ordinal).collect()
    }

    #[test]
    fn parses_single_and_grouped_labels() {
        let ctx = context(3);
        let text = "A inflação cai [Excerpt 2]. Juros sobem [Excerpt 1, Excerpt 3] e [Excerpt 3; 1].";
        assert_eq!(ordinals(&parse_citations(text, &ctx)), vec![2, 1, 3]);
    }

    #[test]
    fn drops_out_of_range_and_malformed_groups() {
        let ctx = context(2);
        let text = "[Excerpt 0] [Excerpt 7] [Excerpt two] [Excerpt 1, foo] [2] [Excerpt 2] [Excerpt 1";
        assert_eq!(ordinals(&parse_citations(text, &ctx)), vec![2]);
    }

    #[test]
    fn nested_bracket_restarts_scan() {
        let ctx = context(1);
        assert_eq!(ordinals(&parse_citations("[nota [Excerpt 1]]", &ctx)), vec![1]);
    }

    #[test]
    fn no_citations_in_empty_context() {
        assert!(parse_citations("[Excerpt 1]", &AssembledContext::default()).is_empty());
    }

    /// Replays scripted results and counts calls.
    struct Scripted {
        replies: Mutex<VecDeque<Result<String>>>,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into()),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        fn name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _: &GenerationRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.replies
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Ok("[Excerpt 1]".into()))
        }
    }

    /// Never answers.
    struct Stalled {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Generator for Stalled {
        fn name(&self) -> &str {
            "stalled"
        }

        async fn generate(&self, _: &GenerationRequest) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            std::future::pending().await
        }
    }

    /// Signals when called, then waits to be released.
    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl Generator for Gate {
        fn name(&self) -> &str {
            "gate"
        }

        async fn generate(&self, _: &GenerationRequest) -> Result<String> {
            self.entered.notify_one();
            self.release.notified().await;
            Ok("Resposta [Excerpt 1].".into())
        }
    }

    fn settings() -> Settings {
        Settings {
            max_concurrent_queries: 1,
            ..Settings::default()
        }
    }

    fn index(tmp: &tempfile::TempDir, with_document: bool) -> (Arc<SharedIndex>, Retriever) {
        let embedder = Arc::new(HashingEmbedder::default());
        let shared = Arc::new(
            SharedIndex::open(
                &tmp.path().join("index.redb"),
                embedder.model_id(),
                settings().ann(),
            )
            .unwrap(),
        );
        if with_document {
            ingest_document(
                &shared,
                embedder.as_ref(),
                &settings().chunking(),
                &RawDocument {
                    id: "RI-2024Q4".into(),
                    title: Some("Relatório de Inflação".into()),
                    published: None,
                    source: None,
                    pages: vec!["A projeção de inflação para 2025 é 4,5%.".into()],
                },
                false,
            )
            .unwrap();
        }
        let retriever = Retriever::new(embedder, Arc::new(LexicalScorer::default()), 20, 5);
        (shared, retriever)
    }

    fn quick_retry() -> RetryPolicy {
        RetryPolicy::new(2, Duration::from_millis(1))
    }

    #[tokio::test]
    async fn answers_with_citations_from_context() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = index(&tmp, true);
        let generator = Scripted::new(vec![Ok("A projeção é 4,5% [Excerpt 1] [Excerpt 9].".into())]);
        let orchestrator = Orchestrator::new(shared, retriever, generator.clone(), &settings());

        let answer = orchestrator.ask("qual a projeção de inflação para 2025?").await.unwrap();

        assert_eq!(answer.status, AnswerStatus::Grounded);
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(answer.citations[0].document_id, "RI-2024Q4");
        assert_eq!(answer.citations[0].first_page, 1);
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn empty_index_never_calls_generator() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = index(&tmp, false);
        let generator = Scripted::new(vec![]);
        let orchestrator = Orchestrator::new(shared, retriever, generator.clone(), &settings());

        let answer = orchestrator.ask("qual a taxa Selic?").await.unwrap();

        assert_eq!(answer.status, AnswerStatus::NoEvidence);
        assert_eq!(answer.text, NO_EVIDENCE_ANSWER);
        assert!(answer.citations.is_empty());
        assert!(answer.context.is_empty());
        assert_eq!(generator.calls(), 0);
    }

    #[tokio::test]
    async fn unconfigured_backend_is_not_needed_without_evidence() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = index(&tmp, false);
        let settings = Settings {
            generator: crate::settings::GeneratorKind::Groq,
            ..settings()
        };
        let generator = Arc::new(crate::generator::DeferredGenerator::new(&settings));
        let orchestrator = Orchestrator::new(shared, retriever, generator.clone(), &settings);

        let answer = orchestrator.ask("qual a taxa Selic?").await.unwrap();

        assert_eq!(answer.status, AnswerStatus::NoEvidence);
        assert!(!generator.is_initialized());
    }

    #[tokio::test]
    async fn invalid_question_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = index(&tmp, false);
        let orchestrator = Orchestrator::new(shared, retriever, Scripted::new(vec![]), &settings());
        assert!(matches!(orchestrator.ask("  ").await, Err(Error::InvalidQuery(_))));
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = index(&tmp, true);
        let generator = Scripted::new(vec![
            Err(Error::Generation(GenerationFailure::transient("503"))),
            Ok("Sim [Excerpt 1].".into()),
        ]);
        let orchestrator = Orchestrator::new(shared, retriever, generator.clone(), &settings())
            .with_retry_policy(quick_retry());

        let answer = orchestrator.ask("projeção de inflação").await.unwrap();
        assert_eq!(answer.citations.len(), 1);
        assert_eq!(generator.calls(), 2);
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = index(&tmp, true);
        let generator =
            Scripted::new(vec![Err(Error::Generation(GenerationFailure::permanent("401")))]);
        let orchestrator = Orchestrator::new(shared, retriever, generator.clone(), &settings())
            .with_retry_policy(quick_retry());

        let err = orchestrator.ask("projeção de inflação").await.unwrap_err();
        assert!(matches!(err, Error::Generation(ref f) if !f.transient));
        assert_eq!(generator.calls(), 1);
    }

    #[tokio::test]
    async fn timeouts_fail_after_retries() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = index(&tmp, true);
        let generator = Arc::new(Stalled {
            calls: AtomicUsize::new(0),
        });
        let orchestrator = Orchestrator::new(shared, retriever, generator.clone(), &settings())
            .with_timeout(Duration::from_millis(20))
            .with_retry_policy(quick_retry());

        let err = orchestrator.ask("projeção de inflação").await.unwrap_err();
        assert!(matches!(err, Error::Generation(_)));
        assert_eq!(generator.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn saturated_pool_rejects_with_busy() {
        let tmp = tempfile::tempdir().unwrap();
        let (shared, retriever) = index(&tmp, true);
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let orchestrator =
            Arc::new(Orchestrator::new(shared, retriever, gate.clone(), &settings()));

        let first = tokio::spawn({
            let orchestrator = Arc::clone(&orchestrator);
            async move { orchestrator.ask("projeção de inflação").await }
        });
        gate.entered.notified().await;

        assert!(matches!(
            orchestrator.ask("outra pergunta").await,
            Err(Error::Busy)
        ));

        gate.release.notify_one();
        let answer = first.await.unwrap().unwrap();
        assert_eq!(answer.citations.len(), 1);

        // The slot is free again.
        gate.release.notify_one();
        assert!(orchestrator.ask("projeção de inflação").await.is_ok());
    }
}
