#![forbid(unsafe_code)]

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use clap::{Args, Parser, Subcommand};
use gapfill_domain::{MarketTiming, RunId, RunRequest};
use gapfill_grid::JsonWorkbookCodec;
use gapfill_journal_core::{verify_chain, NoopJournal, RunJournal};
use gapfill_journal_sqlite::SqliteRunJournal;
use gapfill_orchestrator::{
    build_storage, CompletionNotifier, DocumentStorage, HttpCompletionNotifier, LocalDirStorage,
    RunConfig, RunCoordinator,
};
use gapfill_provider::build_model_backend;
use gapfill_tools::tool_specs;
use gapfill_workflow::{default_pipeline, load_pipeline_from_path};
use tracing_subscriber::EnvFilter;
use ulid::Ulid;

#[derive(Debug, Parser)]
#[command(name = "gapfill")]
#[command(about = "Fill gaps in financial statement spreadsheets with a tool-calling model")]
struct Cli {
    /// Emit logs as JSON lines on stderr.
    #[arg(long, global = true, default_value_t = false)]
    log_json: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    Run(RunArgs),
    Journal(JournalArgs),
    Verify(RunRef),
    Export(ExportArgs),
    /// Print every tool schema offered to the model.
    Schemas,
}

#[derive(Debug, Args)]
struct RunArgs {
    #[arg(long)]
    ticker: String,
    #[arg(long)]
    report_date: String,
    #[arg(long, default_value = "afterhours")]
    timing: String,
    #[arg(long)]
    fiscal_period_end: Option<String>,
    /// Pipeline YAML; the built-in twelve-document pipeline when omitted.
    #[arg(long)]
    pipeline: Option<PathBuf>,
    #[arg(long)]
    journal_db: Option<PathBuf>,
    /// Use a local directory of buckets instead of the configured storage backend.
    #[arg(long)]
    storage_root: Option<PathBuf>,
    #[arg(long)]
    callback_url: Option<String>,
    #[arg(long)]
    run_id: Option<String>,
    #[arg(long)]
    working_root: Option<PathBuf>,
    #[arg(long, default_value_t = false)]
    keep_working_dir: bool,
}

#[derive(Debug, Args)]
struct JournalArgs {
    #[command(subcommand)]
    command: JournalSubcommand,
}

#[derive(Debug, Subcommand)]
enum JournalSubcommand {
    Runs {
        #[arg(long)]
        journal_db: PathBuf,
    },
    Events(RunRef),
    Notes(RunRef),
}

#[derive(Debug, Args)]
struct RunRef {
    #[arg(long)]
    journal_db: PathBuf,
    #[arg(long)]
    run_id: String,
}

#[derive(Debug, Args)]
struct ExportArgs {
    #[arg(long)]
    journal_db: PathBuf,
    #[arg(long)]
    run_id: String,
    #[arg(long)]
    out: PathBuf,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.log_json);

    match cli.command {
        Commands::Run(args) => run_command(args),
        Commands::Journal(args) => journal_command(args),
        Commands::Verify(args) => verify_command(&args),
        Commands::Export(args) => export_command(&args),
        Commands::Schemas => schemas_command(),
    }
}

fn init_logging(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    let installed = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = installed {
        eprintln!("failed to install log subscriber: {err}");
    }
}

fn run_command(args: RunArgs) -> Result<()> {
    let pipeline = match &args.pipeline {
        Some(path) => load_pipeline_from_path(path)?,
        None => default_pipeline()?,
    };
    let timing = MarketTiming::parse(&args.timing).ok_or_else(|| {
        anyhow!(
            "invalid timing '{}'; use 'premarket' or 'afterhours'",
            args.timing
        )
    })?;
    let request = RunRequest {
        ticker: args.ticker,
        report_date: args.report_date,
        timing,
        fiscal_period_end: args.fiscal_period_end,
    };
    request.validate()?;

    let model = build_model_backend(&pipeline.config.model)?;
    let storage: Box<dyn DocumentStorage> = match &args.storage_root {
        Some(root) => Box::new(LocalDirStorage::new(root)),
        None => build_storage(&pipeline.config.storage)?,
    };
    let journal: Box<dyn RunJournal> = match &args.journal_db {
        Some(path) => Box::new(SqliteRunJournal::open_migrated(path)?),
        None => Box::new(NoopJournal),
    };
    let notifier = args
        .callback_url
        .as_deref()
        .map(|url| HttpCompletionNotifier::new(url, &pipeline.config.callback));

    let config = RunConfig {
        run_id: args.run_id.as_deref().map(parse_run_id).transpose()?,
        working_root: args.working_root,
        keep_working_dir: args.keep_working_dir,
    };
    let codec = JsonWorkbookCodec;
    let mut coordinator = RunCoordinator::new(
        &pipeline,
        model.as_ref(),
        storage.as_ref(),
        &codec,
        journal.as_ref(),
    )
    .with_config(config);
    if let Some(notifier) = &notifier {
        coordinator = coordinator.with_notifier(notifier as &dyn CompletionNotifier);
    }

    let outcome = coordinator.run(&request);
    println!("{}", serde_json::to_string(&outcome)?);
    if !outcome.success {
        bail!(
            "run {} failed: {}",
            outcome.run_id,
            outcome.error.as_deref().unwrap_or("unknown error")
        );
    }
    Ok(())
}

fn journal_command(args: JournalArgs) -> Result<()> {
    match args.command {
        JournalSubcommand::Runs { journal_db } => {
            let journal = SqliteRunJournal::open_migrated(&journal_db)?;
            for run in journal.list_runs()? {
                println!("{}", serde_json::to_string(&run)?);
            }
        }
        JournalSubcommand::Events(args) => {
            let journal = SqliteRunJournal::open_migrated(&args.journal_db)?;
            let run_id = parse_run_id(&args.run_id)?;
            for event in journal.list_events_for_run(run_id)? {
                println!("{}", serde_json::to_string(&event)?);
            }
        }
        JournalSubcommand::Notes(args) => {
            let journal = SqliteRunJournal::open_migrated(&args.journal_db)?;
            let run_id = parse_run_id(&args.run_id)?;
            for note in journal.list_notes_for_run(run_id)? {
                println!("{}", serde_json::to_string(&note)?);
            }
        }
    }
    Ok(())
}

fn verify_command(args: &RunRef) -> Result<()> {
    let journal = SqliteRunJournal::open_migrated(&args.journal_db)?;
    let run_id = parse_run_id(&args.run_id)?;
    let report = verify_chain(&journal, run_id)?;
    println!("{}", serde_json::to_string(&report)?);
    if !report.chain_valid {
        bail!(
            "hash chain for run {run_id} is broken at event {}",
            report
                .first_broken_seq
                .map_or_else(|| "-".to_string(), |seq| seq.to_string())
        );
    }
    Ok(())
}

fn export_command(args: &ExportArgs) -> Result<()> {
    let journal = SqliteRunJournal::open_migrated(&args.journal_db)?;
    let run_id = parse_run_id(&args.run_id)?;
    let events = journal.list_events_for_run(run_id)?;

    let output = File::create(&args.out)?;
    let mut writer = BufWriter::new(output);
    for event in &events {
        writeln!(writer, "{}", serde_json::to_string(&event)?)?;
    }
    writer.flush()?;

    eprintln!("exported {} events to {}", events.len(), args.out.display());
    Ok(())
}

fn schemas_command() -> Result<()> {
    for spec in tool_specs() {
        println!("{}", serde_json::to_string(&spec)?);
    }
    Ok(())
}

fn parse_run_id(input: &str) -> Result<RunId> {
    let value = Ulid::from_str(input).map_err(|err| anyhow!("invalid run_id ULID: {err}"))?;
    Ok(RunId(value))
}
