use std::{path::PathBuf, process::ExitCode, sync::Arc};

use clap::Parser;
use lastro::{
    ConfigDb, DataDir, Error, Result, Settings, SharedIndex,
    answer::{AnswerStatus, Orchestrator},
    embedding::{self, Embedder},
    evaluate::{EvaluationReport, Evaluator},
    generator::DeferredGenerator,
    ingest::{self, IngestReport},
    retrieval::{self, Retriever},
    shared::CommitOutcome,
    source::{self, Selection},
};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{Cli, Command, ConfigAction};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("LASTRO_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.quiet);

    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(ExitCode::SUCCESS);
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;
    let config_db = ConfigDb::open(&data_dir.config_db())?;
    let mut settings = Settings::load(&config_db)?;
    if let Some(model) = cli.model {
        settings.model = model;
        settings.validate()?;
    }

    match cli.command {
        Command::Ingest(args) => {
            let selection = Selection {
                count: args.count,
                from: args.from,
                to: args.to,
                pattern: args.pattern,
            };
            cmd_ingest(&data_dir, &settings, args.source, &selection, args.supersede)
        }
        Command::Ask(args) => {
            cmd_ask(&data_dir, &settings, &args.question, args.show_context)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Search(args) => {
            cmd_search(&data_dir, &settings, &args)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Evaluate(args) => {
            cmd_evaluate(&data_dir, &settings, &args)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Rebuild(args) => cmd_rebuild(&data_dir, &settings, args.source),
        Command::Status(args) => {
            cmd_status(&data_dir, &settings, args.json)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Config { action } => {
            cmd_config(&config_db, &settings, action)?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Completions(_) => Ok(ExitCode::SUCCESS),
    }
}

fn open_index(
    data_dir: &DataDir,
    settings: &Settings,
    embedder: &dyn Embedder,
) -> Result<SharedIndex> {
    SharedIndex::open(&data_dir.index_db(), embedder.model_id(), settings.ann())
}

fn source_root(data_dir: &DataDir, source: Option<PathBuf>) -> Result<PathBuf> {
    match source {
        Some(path) if path.is_dir() => Ok(path),
        Some(path) => Err(Error::Config(format!(
            "source directory does not exist: {}",
            path.display()
        ))),
        None => data_dir.raw_dir(),
    }
}

fn print_report(report: &IngestReport) {
    for (id, outcome) in &report.ingested {
        match outcome {
            CommitOutcome::Inserted { chunks } => println!("  ingested    {id} ({chunks} chunks)"),
            CommitOutcome::Superseded { chunks, replaced } => {
                println!("  superseded  {id} ({chunks} chunks, replaced {replaced})")
            }
        }
    }
    for id in &report.duplicates {
        println!("  duplicate   {id} (already indexed)");
    }
    for (id, e) in &report.failed {
        println!("  failed      {id}: {e}");
    }
    println!(
        "\n{} ingested, {} duplicate(s), {} failed",
        report.ingested.len(),
        report.duplicates.len(),
        report.failed.len()
    );
}

fn cmd_ingest(
    data_dir: &DataDir,
    settings: &Settings,
    source: Option<PathBuf>,
    selection: &Selection,
    supersede: bool,
) -> Result<ExitCode> {
    let root = source_root(data_dir, source)?;
    let files = selection.apply(source::discover(&root)?)?;
    if files.is_empty() {
        println!("No reports found in {}", root.display());
        return Ok(ExitCode::SUCCESS);
    }
    eprintln!("Ingesting {} report(s) from {}", files.len(), root.display());

    let embedder = embedding::from_settings(settings);
    let index = open_index(data_dir, settings, embedder.as_ref())?;
    let report = ingest::ingest_files(
        &index,
        embedder.as_ref(),
        &settings.chunking(),
        &files,
        supersede,
    );
    index.flush()?;

    print_report(&report);
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_ask(data_dir: &DataDir, settings: &Settings, question: &str, show_context: bool) -> Result<()> {
    let retriever = Retriever::from_settings(settings);
    let index = Arc::new(open_index(data_dir, settings, retriever.embedder().as_ref())?);
    let generator = Arc::new(DeferredGenerator::new(settings));
    let orchestrator = Orchestrator::new(index, retriever, generator, settings);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let answer = runtime.block_on(orchestrator.ask(question))?;

    println!("{}", answer.text.trim());
    if answer.status == AnswerStatus::NoEvidence {
        return Ok(());
    }

    if !answer.citations.is_empty() {
        println!("\nCitations:");
        for citation in &answer.citations {
            println!("  {citation}");
        }
    }

    if show_context {
        println!("\nContext ({} of {} characters):", answer.context.used_chars, answer.context.budget);
        for entry in &answer.context.entries {
            let marker = if entry.truncated { " (truncated)" } else { "" };
            println!("\n{}{marker}", entry.rendered);
        }
    }
    Ok(())
}

fn cmd_search(data_dir: &DataDir, settings: &Settings, args: &cli::SearchArgs) -> Result<()> {
    let mut retriever = Retriever::from_settings(settings);
    let index = open_index(data_dir, settings, retriever.embedder().as_ref())?;
    if let Some(count) = args.count {
        retriever = retriever.with_precision_k(count);
    }

    let snapshot = index.snapshot()?;
    let ranked = retriever.run(&snapshot, &args.query)?;
    let results = retrieval::resolve(&snapshot, &ranked);

    if args.json {
        retrieval::format_json(&results, &args.query)?;
    } else {
        retrieval::format_human(&results);
    }
    Ok(())
}

fn cmd_evaluate(data_dir: &DataDir, settings: &Settings, args: &cli::EvaluateArgs) -> Result<()> {
    let mut retriever = Retriever::from_settings(settings);
    let index = open_index(data_dir, settings, retriever.embedder().as_ref())?;
    if let Some(cutoff) = args.cutoff {
        retriever = retriever.with_precision_k(cutoff);
    }

    let snapshot = index.snapshot()?;
    if snapshot.is_empty() {
        println!("The index is empty. Run `lastro ingest` first.");
        return Ok(());
    }

    let seed = args.seed.unwrap_or_else(rand::random);
    let evaluator = Evaluator::new(
        retriever,
        Arc::new(DeferredGenerator::new(settings)),
        settings,
    );
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;
    let report = runtime.block_on(evaluator.evaluate(snapshot, args.samples, seed))?;

    if args.json {
        let value = serde_json::json!({
            "hit_rate": report.hit_rate(),
            "mean_reciprocal_rank": report.mean_reciprocal_rank(),
            "hits": report.hits(),
            "evaluated": report.evaluated(),
            "failed": report.failed(),
            "report": report,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        print_evaluation(&report);
    }
    Ok(())
}

fn print_evaluation(report: &EvaluationReport) {
    let total = report.samples.len();
    for (i, sample) in report.samples.iter().enumerate() {
        println!("[{}/{total}] {}, {}", i + 1, sample.document_id, sample.pages);
        if let Some(question) = &sample.question {
            println!("  question: {question}");
        }
        match (&sample.error, sample.hit_rank) {
            (Some(e), _) => println!("  result:   error: {e}"),
            (None, Some(rank)) => println!("  result:   hit (rank {rank})"),
            (None, None) => println!("  result:   miss"),
        }
    }

    match (report.hit_rate(), report.mean_reciprocal_rank()) {
        (Some(rate), Some(mrr)) => println!(
            "\nHit rate: {:.1}% ({}/{}) at top {}, MRR {mrr:.3}, {} failed, seed {}",
            rate * 100.0,
            report.hits(),
            report.evaluated(),
            report.cutoff,
            report.failed(),
            report.seed
        ),
        _ => println!("\nNo sample could be evaluated ({} failed, seed {})", report.failed(), report.seed),
    }
}

fn cmd_rebuild(data_dir: &DataDir, settings: &Settings, source: Option<PathBuf>) -> Result<ExitCode> {
    let root = source_root(data_dir, source)?;
    let files = source::discover(&root)?;

    let embedder = embedding::from_settings(settings);
    let index = SharedIndex::recreate(&data_dir.index_db(), embedder.model_id(), settings.ann())?;
    eprintln!(
        "Rebuilding index with {} from {} report(s)...",
        embedder.model_id(),
        files.len()
    );

    let report = ingest::ingest_files(&index, embedder.as_ref(), &settings.chunking(), &files, false);
    index.flush()?;

    print_report(&report);
    eprintln!("Rebuild complete.");
    Ok(if report.is_success() {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    })
}

fn cmd_status(data_dir: &DataDir, settings: &Settings, json: bool) -> Result<()> {
    let embedder = embedding::from_settings(settings);
    let index = open_index(data_dir, settings, embedder.as_ref())?;
    let counts = index.flush()?;
    let snapshot = index.snapshot()?;

    if json {
        let value = serde_json::json!({
            "data_dir": data_dir.root().display().to_string(),
            "embedding_model": snapshot.model_id(),
            "documents": counts.documents,
            "chunks": counts.chunks,
            "vectors": counts.vectors,
            "partitioned": snapshot.index().is_partitioned(),
            "reranker": settings.reranker.to_string(),
            "generator": settings.generator.to_string(),
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        println!("Data directory: {}", data_dir.root().display());
        println!("Embedding model: {}", snapshot.model_id());
        println!("Reranker: {}", settings.reranker);
        println!("Generator: {}", settings.generator);
        println!("Documents: {}", counts.documents);
        for document in snapshot.documents() {
            let published = document
                .published
                .map(|d| d.to_string())
                .unwrap_or_else(|| "-".into());
            println!("  {}  {published}  {}", document.id, document.title);
        }
        println!("Chunks: {}", counts.chunks);
        println!(
            "Vectors: {}{}",
            counts.vectors,
            if snapshot.index().is_partitioned() {
                format!(" in {} lists", snapshot.index().list_count())
            } else {
                String::new()
            }
        );
    }
    Ok(())
}

fn cmd_config(config_db: &ConfigDb, settings: &Settings, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { json } => {
            if json {
                println!("{}", serde_json::to_string_pretty(settings)?);
            } else {
                let persisted = config_db.list_settings()?;
                for (key, value) in settings.entries() {
                    let marker = if persisted.iter().any(|(k, _)| k == key) {
                        " (set)"
                    } else {
                        ""
                    };
                    println!("{key} = {value}{marker}");
                }
            }
        }
        ConfigAction::Set { key, value } => {
            if !Settings::KEYS.contains(&key.as_str()) {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key,
                });
            }
            let mut candidate = settings.clone();
            candidate.set(&key, &value)?;
            candidate.validate()?;
            config_db.set_setting(&key, value.trim())?;
            println!("{key} = {}", value.trim());
        }
        ConfigAction::Unset { key } => {
            if !config_db.remove_setting(&key)? {
                return Err(Error::NotFound {
                    kind: "setting",
                    name: key,
                });
            }
            println!("Removed setting '{key}'");
        }
    }
    Ok(())
}
