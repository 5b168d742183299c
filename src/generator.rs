//! Answer generation backends.
//!
//! A generator turns a fixed instruction, the rendered excerpts and the
//! question into free text. Every failure becomes [`Error::Generation`];
//! the transient flag only decides whether the orchestrator retries.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tokio::sync::OnceCell;

use crate::{
    error::{Error, GenerationFailure, Result},
    settings::{GeneratorKind, Settings},
};

pub const DEFAULT_OLLAMA_MODEL: &str = "llama3.1:8b";
pub const DEFAULT_GROQ_MODEL: &str = "llama-3.3-70b-versatile";
pub const GROQ_BASE_URL: &str = "https://api.groq.com";

/// Environment variables checked, in order, for the Groq API key.
pub const GROQ_KEY_VARS: &[&str] = &["LASTRO_GROQ_API_KEY", "GROQ_API_KEY"];

/// Sent with every question.
pub const GROUNDING_INSTRUCTION: &str = "\
Você é um analista de política monetária. Responda em português usando \
somente as informações dos trechos fornecidos, que foram extraídos de \
relatórios do Banco Central do Brasil. Cite cada afirmação com o rótulo do \
trecho entre colchetes, por exemplo [Excerpt 1] ou [Excerpt 1, Excerpt 3]. \
Não use conhecimento externo. Se os trechos não contiverem evidência \
suficiente para responder, diga explicitamente que não há evidência \
suficiente nos relatórios.";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GenerationRequest {
    pub instruction: String,
    pub context: String,
    pub question: String,
}

impl GenerationRequest {
    pub fn grounded(context: String, question: &str) -> Self {
        Self {
            instruction: GROUNDING_INSTRUCTION.to_string(),
            context,
            question: question.to_string(),
        }
    }

    /// Excerpts and question as a single user message.
    pub fn user_prompt(&self) -> String {
        format!("Trechos:\n\n{}\n\nPergunta: {}", self.context, self.question)
    }
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// One call to `generator`, bounded by `timeout`. Running out of time is a
/// transient failure.
pub async fn generate_within(
    generator: &dyn Generator,
    request: &GenerationRequest,
    timeout: Duration,
) -> Result<String> {
    match tokio::time::timeout(timeout, generator.generate(request)).await {
        Ok(result) => result,
        Err(_) => Err(generation_error(GenerationFailure::transient(format!(
            "{} did not answer within {timeout:?}",
            generator.name()
        )))),
    }
}

/// Build the generator selected in `settings`.
///
/// Fails when the selected backend needs a credential that is not set.
pub fn from_settings(settings: &Settings) -> Result<Arc<dyn Generator>> {
    Ok(match settings.generator {
        GeneratorKind::Ollama => Arc::new(OllamaGenerator::new(
            &settings.ollama_url,
            settings.generator_model.as_deref().unwrap_or(DEFAULT_OLLAMA_MODEL),
        )),
        GeneratorKind::Groq => {
            let key = GROQ_KEY_VARS
                .iter()
                .find_map(|var| std::env::var(var).ok().filter(|v| !v.trim().is_empty()))
                .ok_or_else(|| {
                    Error::Config(format!(
                        "the groq generator needs an API key in {}",
                        GROQ_KEY_VARS.join(" or ")
                    ))
                })?;
            Arc::new(GroqGenerator::new(
                GROQ_BASE_URL,
                key,
                settings.generator_model.as_deref().unwrap_or(DEFAULT_GROQ_MODEL),
            ))
        }
    })
}

/// Builds the configured backend on the first request.
///
/// A question that never reaches generation (nothing retrieved) does not
/// need a reachable or credentialed backend.
pub struct DeferredGenerator {
    settings: Settings,
    backend: OnceCell<Arc<dyn Generator>>,
}

impl DeferredGenerator {
    pub fn new(settings: &Settings) -> Self {
        Self {
            settings: settings.clone(),
            backend: OnceCell::new(),
        }
    }

    pub fn is_initialized(&self) -> bool {
        self.backend.initialized()
    }
}

#[async_trait]
impl Generator for DeferredGenerator {
    fn name(&self) -> &str {
        match self.backend.get() {
            Some(backend) => backend.name(),
            None => match self.settings.generator {
                GeneratorKind::Ollama => "ollama",
                GeneratorKind::Groq => "groq",
            },
        }
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let backend = self
            .backend
            .get_or_try_init(|| async { from_settings(&self.settings) })
            .await?;
        backend.generate(request).await
    }
}

impl std::fmt::Debug for DeferredGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredGenerator")
            .field("generator", &self.settings.generator)
            .field("initialized", &self.is_initialized())
            .finish()
    }
}

fn generation_error(failure: GenerationFailure) -> Error {
    Error::Generation(failure)
}

/// Rate limits and server errors are worth retrying; any other non-success
/// status is not.
fn status_failure(backend: &str, status: reqwest::StatusCode, body: &str) -> GenerationFailure {
    let message = format!("{backend} returned {status}: {}", body.trim());
    if status == reqwest::StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        GenerationFailure::transient(message)
    } else {
        GenerationFailure::permanent(message)
    }
}

fn send_failure(backend: &str, e: &reqwest::Error) -> GenerationFailure {
    let message = format!("failed to reach {backend}: {e}");
    if e.is_timeout() || e.is_connect() || e.is_request() {
        GenerationFailure::transient(message)
    } else {
        GenerationFailure::permanent(message)
    }
}

fn non_empty(backend: &str, text: String) -> Result<String> {
    if text.trim().is_empty() {
        Err(generation_error(GenerationFailure::permanent(format!(
            "{backend} returned an empty answer"
        ))))
    } else {
        Ok(text)
    }
}

async fn post_json<B: Serialize, R: DeserializeOwned>(
    backend: &str,
    request: reqwest::RequestBuilder,
    body: &B,
) -> Result<R> {
    let response = request
        .json(body)
        .send()
        .await
        .map_err(|e| generation_error(send_failure(backend, &e)))?;

    let status = response.status();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(generation_error(status_failure(backend, status, &body)));
    }

    let text = response
        .text()
        .await
        .map_err(|e| generation_error(send_failure(backend, &e)))?;
    serde_json::from_str(&text).map_err(|e| {
        generation_error(GenerationFailure::permanent(format!(
            "malformed {backend} response: {e}"
        )))
    })
}

/// Local models through Ollama's non-streaming `/api/generate`.
#[derive(Debug, Clone)]
pub struct OllamaGenerator {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    system: &'a str,
    prompt: String,
    stream: bool,
    options: OllamaOptions,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

impl OllamaGenerator {
    pub fn new(base_url: &str, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn body<'a>(&'a self, request: &'a GenerationRequest) -> OllamaRequest<'a> {
        OllamaRequest {
            model: &self.model,
            system: &request.instruction,
            prompt: request.user_prompt(),
            stream: false,
            options: OllamaOptions { temperature: 0.0 },
        }
    }
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn name(&self) -> &str {
        "ollama"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        tracing::debug!(url = %url, model = %self.model, "calling ollama");
        let response: OllamaResponse =
            post_json("ollama", self.client.post(&url), &self.body(request)).await?;
        non_empty("ollama", response.response)
    }
}

/// Hosted models through Groq's OpenAI-compatible chat endpoint.
#[derive(Clone)]
pub struct GroqGenerator {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    #[serde(default)]
    content: Option<String>,
}

impl GroqGenerator {
    pub fn new(base_url: &str, api_key: String, model: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

impl std::fmt::Debug for GroqGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GroqGenerator")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Generator for GroqGenerator {
    fn name(&self) -> &str {
        "groq"
    }

    async fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let url = format!("{}/openai/v1/chat/completions", self.base_url);
        let user = request.user_prompt();
        let body = ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.instruction,
                },
                ChatMessage {
                    role: "user",
                    content: &user,
                },
            ],
            temperature: 0.0,
        };

        tracing::debug!(url = %url, model = %self.model, "calling groq");
        let response: ChatResponse =
            post_json("groq", self.client.post(&url).bearer_auth(&self.api_key), &body).await?;

        let text = response
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| {
                generation_error(GenerationFailure::permanent("groq response has no choices"))
            })?;
        non_empty("groq", text)
    }
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::*;

    fn request() -> GenerationRequest {
        GenerationRequest::grounded("[Excerpt 1] RI (RI-2024Q4), p. 4\ntexto".into(), "pergunta?")
    }

    #[test]
    fn status_classification() {
        assert!(status_failure("x", StatusCode::TOO_MANY_REQUESTS, "").transient);
        assert!(status_failure("x", StatusCode::BAD_GATEWAY, "").transient);
        assert!(!status_failure("x", StatusCode::UNAUTHORIZED, "").transient);
        assert!(!status_failure("x", StatusCode::BAD_REQUEST, "").transient);
    }

    #[test]
    fn user_prompt_carries_context_and_question() {
        let prompt = request().user_prompt();
        assert!(prompt.contains("[Excerpt 1]"));
        assert!(prompt.ends_with("Pergunta: pergunta?"));
    }

    #[test]
    fn ollama_body_is_non_streaming() {
        let generator = OllamaGenerator::new("http://localhost:11434/", "m");
        let req = request();
        let body = serde_json::to_value(generator.body(&req)).unwrap();
        assert_eq!(body["stream"], false);
        assert_eq!(body["model"], "m");
        assert_eq!(body["system"], GROUNDING_INSTRUCTION);
        assert_eq!(generator.base_url, "http://localhost:11434");
    }

    #[test]
    fn empty_answers_are_permanent_failures() {
        let err = non_empty("ollama", "  \n".into()).unwrap_err();
        assert!(matches!(err, Error::Generation(ref f) if !f.transient));
    }

    #[test]
    fn chat_response_without_content_parses() {
        let parsed: ChatResponse =
            serde_json::from_str(r#"{"choices":[{"message":{"role":"assistant"}}]}"#).unwrap();
        assert!(parsed.choices[0].message.content.is_none());
    }

    #[tokio::test]
    async fn unreachable_backend_is_transient() {
        // Nothing listens on the discard port.
        let generator = OllamaGenerator::new("http://127.0.0.1:9", "m");
        let err = generator.generate(&request()).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
    }

    #[tokio::test]
    async fn deferred_backend_is_built_on_first_request() {
        let settings = Settings {
            ollama_url: "http://127.0.0.1:9".into(),
            ..Settings::default()
        };
        let generator = DeferredGenerator::new(&settings);
        assert!(!generator.is_initialized());
        assert_eq!(generator.name(), "ollama");

        let err = generator.generate(&request()).await.unwrap_err();
        assert!(err.is_transient(), "{err}");
        assert!(generator.is_initialized());
    }
}
