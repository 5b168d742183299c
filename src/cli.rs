use std::path::PathBuf;

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

use lastro::document::ReportDate;

#[derive(Debug, Parser)]
#[command(
    name = "lastro",
    version,
    about = "Grounded answers from Banco Central do Brasil monetary-policy reports"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Override the ColBERT model ID or local model path
    #[arg(long, global = true)]
    pub model: Option<String>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ingest report texts from the raw directory
    Ingest(IngestArgs),
    /// Ask a question and get a cited answer
    Ask(AskArgs),
    /// Show the excerpts a question retrieves, without generating an answer
    Search(SearchArgs),
    /// Measure retrieval hit rate with generated questions
    Evaluate(EvaluateArgs),
    /// Drop the index and re-ingest every raw report
    Rebuild(RebuildArgs),
    /// Show system status and statistics
    Status(StatusArgs),
    /// Show or change persisted settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Ingest --

#[derive(Debug, Parser)]
pub struct IngestArgs {
    /// Ingest only the N most recent reports
    #[arg(short = 'n', long, conflicts_with_all = ["from", "to"])]
    pub count: Option<usize>,

    /// First edition to ingest (YYYY-MM)
    #[arg(long, value_parser = parse_report_date)]
    pub from: Option<ReportDate>,

    /// Last edition to ingest (YYYY-MM)
    #[arg(long, value_parser = parse_report_date)]
    pub to: Option<ReportDate>,

    /// Glob over file paths relative to the source directory
    #[arg(long)]
    pub pattern: Option<String>,

    /// Replace reports that are already indexed
    #[arg(long)]
    pub supersede: bool,

    /// Read reports from this directory instead of `<data-dir>/raw`
    #[arg(long)]
    pub source: Option<PathBuf>,
}

fn parse_report_date(s: &str) -> Result<ReportDate, String> {
    s.parse().map_err(|e: lastro::Error| e.to_string())
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question
    pub question: String,

    /// Also print the excerpts the answer was grounded on
    #[arg(long)]
    pub show_context: bool,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The search query
    pub query: String,

    /// Number of excerpts to return (at most `recall_k`)
    #[arg(short = 'n', long)]
    pub count: Option<usize>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Evaluate --

#[derive(Debug, Parser)]
pub struct EvaluateArgs {
    /// Number of chunks to sample
    #[arg(short = 'n', long, default_value_t = lastro::evaluate::DEFAULT_SAMPLES)]
    pub samples: usize,

    /// Results each question may return (defaults to `precision_k`)
    #[arg(short = 'k', long)]
    pub cutoff: Option<usize>,

    /// Sampling seed, for repeatable runs
    #[arg(long)]
    pub seed: Option<u64>,

    /// Output the report as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Rebuild --

#[derive(Debug, Parser)]
pub struct RebuildArgs {
    /// Read reports from this directory instead of `<data-dir>/raw`
    #[arg(long)]
    pub source: Option<PathBuf>,
}

// -- Status --

#[derive(Debug, Parser)]
pub struct StatusArgs {
    /// Output as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Config --

#[derive(Debug, Subcommand)]
pub enum ConfigAction {
    /// Show effective settings
    Show {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },
    /// Persist a setting in config.redb
    Set {
        /// Setting name
        key: String,
        /// New value
        value: String,
    },
    /// Remove a persisted setting (revert to default)
    Unset {
        /// Setting name
        key: String,
    },
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(self.shell, &mut cmd, "lastro", &mut std::io::stdout());
    }
}
