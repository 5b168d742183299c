//! lastro - grounded question answering over Banco Central do Brasil
//! monetary-policy reports.
//!
//! Report texts are split into page-aware chunks, embedded and stored in a
//! persistent vector index. A question is answered in four steps: a
//! stage-1 vector search for broad recall, a stage-2 pairwise reranker for
//! precision, assembly of a budgeted context with `[Excerpt N]` labels, and
//! a call to an external generator whose citations are mapped back to
//! report pages. When nothing relevant is found the generator is not called.
//!
//! # Quick start
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use lastro::{ConfigDb, DataDir, Settings, SharedIndex};
//! use lastro::answer::Orchestrator;
//! use lastro::retrieval::Retriever;
//!
//! # async fn run() -> lastro::Result<()> {
//! let data_dir = DataDir::resolve(None)?;
//! let settings = Settings::load(&ConfigDb::open(&data_dir.config_db())?)?;
//!
//! let retriever = Retriever::from_settings(&settings);
//! let index = Arc::new(SharedIndex::open(
//!     &data_dir.index_db(),
//!     retriever.embedder().model_id(),
//!     settings.ann(),
//! )?);
//! let generator = lastro::generator::from_settings(&settings)?;
//! let orchestrator = Orchestrator::new(index, retriever, generator, &settings);
//!
//! let answer = orchestrator.ask("qual a projeção de inflação para 2025?").await?;
//! println!("{}", answer.text);
//! for citation in &answer.citations {
//!     println!("{citation}");
//! }
//! # Ok(())
//! # }
//! ```

pub mod answer;
pub mod chunking;
pub mod config_db;
pub mod context;
pub mod data_dir;
pub mod document;
pub mod embedding;
pub mod error;
pub mod evaluate;
pub mod generator;
pub mod ids;
pub mod index;
pub mod ingest;
pub mod model_manager;
pub mod reranker;
pub mod retrieval;
pub mod retry;
pub mod settings;
pub mod shared;
pub mod source;
pub mod store;
pub mod text;

pub use config_db::ConfigDb;
pub use data_dir::DataDir;
pub use error::{Error, Result};
pub use ids::DocumentId;
pub use model_manager::ModelManager;
pub use settings::Settings;
pub use shared::SharedIndex;
