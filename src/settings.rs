//! Runtime tunables.
//!
//! Values resolve in layers: built-in defaults, then keys persisted in the
//! config database, then `LASTRO_<KEY>` environment variables. Command-line
//! flags are applied last by the binary. Credentials never pass through
//! here; generator backends read them from the environment directly.

use std::{fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{
    chunking::{ChunkingConfig, DEFAULT_CHUNK_OVERLAP, DEFAULT_CHUNK_SIZE},
    config_db::ConfigDb,
    error::{Error, Result},
    index::AnnConfig,
    model_manager::DEFAULT_MODEL_ID,
    retry::RetryPolicy,
};

/// Prefix for environment overrides (`LASTRO_RECALL_K`, ...).
pub const ENV_PREFIX: &str = "LASTRO_";

/// Longest question accepted, in characters.
pub const MAX_QUERY_CHARS: usize = 2000;

/// Smallest context budget that still leaves room for an excerpt header
/// and some text.
pub const MIN_CONTEXT_BUDGET: usize = 200;

pub const DEFAULT_OLLAMA_URL: &str = "http://localhost:11434";

macro_rules! named_choice {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(rename_all = "lowercase")]
        pub enum $name {
            $($variant),+
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                match s.trim().to_ascii_lowercase().as_str() {
                    $($text => Ok(Self::$variant),)+
                    other => Err(Error::Config(format!(
                        concat!("unknown ", stringify!($name), " '{}' (expected one of: {})"),
                        other,
                        [$($text),+].join(", "),
                    ))),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(match self {
                    $(Self::$variant => $text),+
                })
            }
        }
    };
}

named_choice!(EmbedderKind {
    Colbert => "colbert",
    Hashing => "hashing",
});

named_choice!(RerankerKind {
    MaxSim => "maxsim",
    Lexical => "lexical",
});

named_choice!(GeneratorKind {
    Ollama => "ollama",
    Groq => "groq",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub chunk_size: usize,
    pub chunk_overlap: f32,
    pub split_at_page_breaks: bool,
    pub boilerplate_min_fraction: f32,
    pub recall_k: usize,
    pub precision_k: usize,
    pub context_budget: usize,
    pub dedup_overlap: f32,
    pub generator_timeout_secs: u64,
    pub generator_retries: u32,
    pub retry_initial_backoff_ms: u64,
    pub max_concurrent_queries: usize,
    pub ann_train_threshold: usize,
    pub ann_probes: usize,
    pub embedder: EmbedderKind,
    /// ColBERT checkpoint used by the `colbert` embedder and `maxsim` scorer.
    pub model: String,
    pub reranker: RerankerKind,
    pub generator: GeneratorKind,
    /// Backend-specific model name; `None` uses the backend default.
    pub generator_model: Option<String>,
    pub ollama_url: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            chunk_overlap: DEFAULT_CHUNK_OVERLAP,
            split_at_page_breaks: true,
            boilerplate_min_fraction: 0.6,
            recall_k: 20,
            precision_k: 5,
            context_budget: 6000,
            dedup_overlap: 0.5,
            generator_timeout_secs: 60,
            generator_retries: 2,
            retry_initial_backoff_ms: 500,
            max_concurrent_queries: 4,
            ann_train_threshold: 1024,
            ann_probes: 8,
            embedder: EmbedderKind::Colbert,
            model: DEFAULT_MODEL_ID.to_string(),
            reranker: RerankerKind::MaxSim,
            generator: GeneratorKind::Ollama,
            generator_model: None,
            ollama_url: DEFAULT_OLLAMA_URL.to_string(),
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::Config(format!("invalid value '{value}' for {key}")))
}

impl Settings {
    /// Every key accepted by [`Settings::set`].
    pub const KEYS: &'static [&'static str] = &[
        "chunk_size",
        "chunk_overlap",
        "split_at_page_breaks",
        "boilerplate_min_fraction",
        "recall_k",
        "precision_k",
        "context_budget",
        "dedup_overlap",
        "generator_timeout",
        "generator_retries",
        "retry_initial_backoff_ms",
        "max_concurrent_queries",
        "ann_train_threshold",
        "ann_probes",
        "embedder",
        "model",
        "reranker",
        "generator",
        "generator_model",
        "ollama_url",
    ];

    /// Defaults overlaid with persisted settings and environment overrides.
    pub fn load(config: &ConfigDb) -> Result<Self> {
        Self::load_with_env(config, |key| std::env::var(key).ok())
    }

    pub fn load_with_env(
        config: &ConfigDb,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut settings = Self::default();

        for (key, value) in config.list_settings()? {
            if !Self::KEYS.contains(&key.as_str()) {
                tracing::warn!(key, "ignoring unknown persisted setting");
                continue;
            }
            settings.set(&key, &value)?;
        }

        for key in Self::KEYS {
            let var = format!("{ENV_PREFIX}{}", key.to_ascii_uppercase());
            if let Some(value) = env(&var) {
                tracing::debug!(key, var, "setting overridden from environment");
                settings.set(key, &value)?;
            }
        }

        settings.validate()?;
        Ok(settings)
    }

    /// Assign one key from its textual form.
    pub fn set(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "chunk_size" => self.chunk_size = parse(key, value)?,
            "chunk_overlap" => self.chunk_overlap = parse(key, value)?,
            "split_at_page_breaks" => self.split_at_page_breaks = parse(key, value)?,
            "boilerplate_min_fraction" => {
                self.boilerplate_min_fraction = parse(key, value)?
            }
            "recall_k" => self.recall_k = parse(key, value)?,
            "precision_k" => self.precision_k = parse(key, value)?,
            "context_budget" => self.context_budget = parse(key, value)?,
            "dedup_overlap" => self.dedup_overlap = parse(key, value)?,
            "generator_timeout" => self.generator_timeout_secs = parse(key, value)?,
            "generator_retries" => self.generator_retries = parse(key, value)?,
            "retry_initial_backoff_ms" => {
                self.retry_initial_backoff_ms = parse(key, value)?
            }
            "max_concurrent_queries" => self.max_concurrent_queries = parse(key, value)?,
            "ann_train_threshold" => self.ann_train_threshold = parse(key, value)?,
            "ann_probes" => self.ann_probes = parse(key, value)?,
            "embedder" => self.embedder = value.parse()?,
            "model" => self.model = value.trim().to_string(),
            "reranker" => self.reranker = value.parse()?,
            "generator" => self.generator = value.parse()?,
            "generator_model" => {
                let value = value.trim();
                self.generator_model = (!value.is_empty()).then(|| value.to_string());
            }
            "ollama_url" => self.ollama_url = value.trim().trim_end_matches('/').to_string(),
            other => {
                return Err(Error::Config(format!(
                    "unknown setting '{other}' (known: {})",
                    Self::KEYS.join(", ")
                )));
            }
        }
        Ok(())
    }

    /// Textual value of a key, as `config show` prints it.
    pub fn get(&self, key: &str) -> Option<String> {
        let value = match key {
            "chunk_size" => self.chunk_size.to_string(),
            "chunk_overlap" => self.chunk_overlap.to_string(),
            "split_at_page_breaks" => self.split_at_page_breaks.to_string(),
            "boilerplate_min_fraction" => self.boilerplate_min_fraction.to_string(),
            "recall_k" => self.recall_k.to_string(),
            "precision_k" => self.precision_k.to_string(),
            "context_budget" => self.context_budget.to_string(),
            "dedup_overlap" => self.dedup_overlap.to_string(),
            "generator_timeout" => self.generator_timeout_secs.to_string(),
            "generator_retries" => self.generator_retries.to_string(),
            "retry_initial_backoff_ms" => self.retry_initial_backoff_ms.to_string(),
            "max_concurrent_queries" => self.max_concurrent_queries.to_string(),
            "ann_train_threshold" => self.ann_train_threshold.to_string(),
            "ann_probes" => self.ann_probes.to_string(),
            "embedder" => self.embedder.to_string(),
            "model" => self.model.clone(),
            "reranker" => self.reranker.to_string(),
            "generator" => self.generator.to_string(),
            "generator_model" => self.generator_model.clone().unwrap_or_default(),
            "ollama_url" => self.ollama_url.clone(),
            _ => return None,
        };
        Some(value)
    }

    pub fn entries(&self) -> Vec<(&'static str, String)> {
        Self::KEYS
            .iter()
            .filter_map(|key| self.get(key).map(|value| (*key, value)))
            .collect()
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("chunk_size", self.chunk_size),
            ("recall_k", self.recall_k),
            ("precision_k", self.precision_k),
            ("context_budget", self.context_budget),
            ("max_concurrent_queries", self.max_concurrent_queries),
            ("ann_train_threshold", self.ann_train_threshold),
            ("ann_probes", self.ann_probes),
        ];
        for (key, value) in positive {
            if value == 0 {
                return Err(Error::Config(format!("{key} must be greater than 0")));
            }
        }

        if self.context_budget < MIN_CONTEXT_BUDGET {
            return Err(Error::Config(format!(
                "context_budget must be at least {MIN_CONTEXT_BUDGET} characters, got {}",
                self.context_budget
            )));
        }
        if !(0.0..=0.9).contains(&self.chunk_overlap) {
            return Err(Error::Config(format!(
                "chunk_overlap must be within [0, 0.9], got {}",
                self.chunk_overlap
            )));
        }
        for (key, value) in [
            ("dedup_overlap", self.dedup_overlap),
            ("boilerplate_min_fraction", self.boilerplate_min_fraction),
        ] {
            if !(value > 0.0 && value <= 1.0) {
                return Err(Error::Config(format!(
                    "{key} must be within (0, 1], got {value}"
                )));
            }
        }
        if self.precision_k > self.recall_k {
            return Err(Error::Config(format!(
                "precision_k ({}) may not exceed recall_k ({})",
                self.precision_k, self.recall_k
            )));
        }
        if self.generator_timeout_secs == 0 {
            return Err(Error::Config("generator_timeout must be at least 1 second".into()));
        }
        if self.model.is_empty() {
            return Err(Error::Config("model may not be empty".into()));
        }
        Ok(())
    }

    pub fn chunking(&self) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: self.chunk_size,
            overlap: self.chunk_overlap,
            split_at_page_breaks: self.split_at_page_breaks,
            boilerplate_min_fraction: self.boilerplate_min_fraction,
            ..ChunkingConfig::default()
        }
    }

    pub fn ann(&self) -> AnnConfig {
        AnnConfig {
            train_threshold: self.ann_train_threshold,
            probes: self.ann_probes,
        }
    }

    pub fn generator_timeout(&self) -> Duration {
        Duration::from_secs(self.generator_timeout_secs)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.generator_retries,
            Duration::from_millis(self.retry_initial_backoff_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn test_db() -> (tempfile::TempDir, ConfigDb) {
        let tmp = tempfile::tempdir().unwrap();
        let db = ConfigDb::open(&tmp.path().join("config.redb")).unwrap();
        (tmp, db)
    }

    #[test]
    fn defaults_are_valid() {
        let settings = Settings::default();
        settings.validate().unwrap();
        assert_eq!(settings.chunk_size, 1000);
        assert_eq!(settings.recall_k, 20);
        assert_eq!(settings.precision_k, 5);
        assert_eq!(settings.context_budget, 6000);
        assert_eq!(settings.generator_timeout(), Duration::from_secs(60));
    }

    #[test]
    fn every_key_round_trips_through_get() {
        let settings = Settings::default();
        for key in Settings::KEYS {
            assert!(settings.get(key).is_some(), "missing getter for {key}");
        }
        assert_eq!(settings.entries().len(), Settings::KEYS.len());
    }

    #[test]
    fn set_parses_values() {
        let mut settings = Settings::default();
        settings.set("recall_k", "40").unwrap();
        settings.set("chunk_overlap", "0.1").unwrap();
        settings.set("reranker", "Lexical").unwrap();
        settings.set("generator_model", "").unwrap();
        settings.set("ollama_url", "http://gpu:11434/").unwrap();

        assert_eq!(settings.recall_k, 40);
        assert_eq!(settings.chunk_overlap, 0.1);
        assert_eq!(settings.reranker, RerankerKind::Lexical);
        assert_eq!(settings.generator_model, None);
        assert_eq!(settings.ollama_url, "http://gpu:11434");
    }

    #[test]
    fn set_rejects_bad_input() {
        let mut settings = Settings::default();
        assert!(matches!(settings.set("recall_k", "many"), Err(Error::Config(_))));
        assert!(matches!(settings.set("bogus", "1"), Err(Error::Config(_))));
        assert!(matches!(settings.set("generator", "gpt"), Err(Error::Config(_))));
    }

    #[test]
    fn validate_rejects_inconsistent_values() {
        let mut settings = Settings::default();
        settings.precision_k = 30;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.chunk_overlap = 0.95;
        assert!(settings.validate().is_err());

        let mut settings = Settings::default();
        settings.chunk_size = 0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn tiny_context_budget_is_rejected() {
        let mut settings = Settings::default();
        settings.context_budget = 20;
        assert!(matches!(settings.validate(), Err(Error::Config(_))));

        settings.context_budget = MIN_CONTEXT_BUDGET;
        settings.validate().unwrap();
    }

    #[test]
    fn env_overrides_persisted_settings() {
        let (_tmp, db) = test_db();
        db.set_setting("recall_k", "30").unwrap();
        db.set_setting("precision_k", "4").unwrap();

        let env: HashMap<&str, &str> = [("LASTRO_RECALL_K", "50")].into();
        let settings =
            Settings::load_with_env(&db, |k| env.get(k).map(|v| v.to_string())).unwrap();

        assert_eq!(settings.recall_k, 50);
        assert_eq!(settings.precision_k, 4);
    }

    #[test]
    fn invalid_persisted_value_fails_load() {
        let (_tmp, db) = test_db();
        db.set_setting("precision_k", "100").unwrap();
        let result = Settings::load_with_env(&db, |_| None);
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn chunking_config_follows_settings() {
        let mut settings = Settings::default();
        settings.set("chunk_size", "500").unwrap();
        settings.set("split_at_page_breaks", "false").unwrap();
        let chunking = settings.chunking();
        assert_eq!(chunking.chunk_size, 500);
        assert!(!chunking.split_at_page_breaks);
        assert_eq!(chunking.overlap_chars(), 125);
    }
}
