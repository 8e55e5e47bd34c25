//! Chatsoul CLI
//!
//! Runs the chat-analysis pipeline and inspects its checkpoints.

mod telemetry;

use std::path::PathBuf;
use std::process::ExitCode;

use chatsoul_core::config::{PipelineConfig, RegenerationMode};
use chatsoul_core::models::LlmProvider;
use chatsoul_core::pipeline::{
    Collaborators, Orchestrator, PipelineEvent, PipelineEventKind, RunOutcome, RunSummary, Stage,
    StageState,
};
use chatsoul_core::report::{write_report, MarkdownReportRenderer};
use chatsoul_core::state::{CheckpointStore, PipelineDb};
use clap::{Parser, Subcommand};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(author, version, about = "Chatsoul - resumable chat analysis pipeline")]
struct Args {
    /// Config file (defaults to .chatsoul/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Checkpoint database
    #[arg(long, global = true)]
    db: Option<PathBuf>,
    #[command(subcommand)]
    command: CliCommand,
}

#[derive(Subcommand)]
enum CliCommand {
    /// Run the pipeline, skipping stages with valid checkpoints
    Run(RunArgs),
    /// Show what a run would skip or execute, without running anything
    Plan(RunArgs),
    /// Show which stages and chats have checkpoints
    Status,
    /// List stored versions of a checkpoint
    History {
        #[arg(long)]
        stage: Stage,
        #[arg(long)]
        chat: Option<String>,
    },
    /// Delete checkpoints of one stage, or of all stages
    Reset {
        #[arg(long)]
        stage: Option<Stage>,
    },
}

#[derive(clap::Args)]
struct RunArgs {
    /// Directory with exported chats
    #[arg(long)]
    source: Option<PathBuf>,
    /// Report directory
    #[arg(long)]
    output: Option<PathBuf>,
    /// Last stage to run
    #[arg(long)]
    until: Option<Stage>,
    /// Trust earlier checkpoints and run from this stage
    #[arg(long)]
    resume_from: Option<Stage>,
    /// Regenerate this stage even if its checkpoint is valid (repeatable)
    #[arg(long = "force", value_name = "STAGE")]
    force: Vec<Stage>,
    /// Re-analyse every chat when any chat is stale
    #[arg(long)]
    full: bool,
    #[arg(long)]
    max_retries: Option<u32>,
    #[arg(long)]
    retry_backoff_ms: Option<u64>,
    /// Chats analysed concurrently
    #[arg(long)]
    workers: Option<usize>,
    #[arg(long)]
    messages_limit: Option<usize>,
    #[arg(long)]
    clusters: Option<usize>,
    #[arg(long)]
    user_name: Option<String>,
    /// LLM provider for analysis and strategy
    #[arg(long)]
    provider: Option<LlmProvider>,
    /// Analysis model
    #[arg(long)]
    model: Option<String>,
    #[arg(long)]
    strategy_model: Option<String>,
    /// Do not write the markdown report
    #[arg(long)]
    no_report: bool,
    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

impl RunArgs {
    fn apply(&self, config: &mut PipelineConfig) {
        if let Some(source) = &self.source {
            config.chat_source_dir = source.clone();
        }
        if let Some(output) = &self.output {
            config.output_dir = output.clone();
        }
        if let Some(until) = self.until {
            config.terminal_stage = until;
        }
        if self.resume_from.is_some() {
            config.resume_from = self.resume_from;
        }
        config.force_regenerate.extend(self.force.iter().copied());
        if self.full {
            config.regeneration_mode = RegenerationMode::Full;
        }
        if let Some(n) = self.max_retries {
            config.max_retries = n;
        }
        if let Some(ms) = self.retry_backoff_ms {
            config.retry_backoff_base_ms = ms;
        }
        if let Some(n) = self.workers {
            config.max_concurrent_chat_workers = n;
        }
        if let Some(n) = self.messages_limit {
            config.messages_limit = n;
        }
        if let Some(n) = self.clusters {
            config.cluster_count = n;
        }
        if let Some(name) = &self.user_name {
            config.user_name = name.clone();
        }
        if let Some(provider) = self.provider {
            config.analysis_model.provider = provider;
            config.strategy_model.provider = provider;
        }
        if let Some(model) = &self.model {
            config.analysis_model.model = model.clone();
        }
        if let Some(model) = &self.strategy_model {
            config.strategy_model.model = model.clone();
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // API keys may live in .env
    dotenvy::dotenv().ok();
    telemetry::init_tracing()?;

    let args = Args::parse();
    let config_path = args
        .config
        .clone()
        .unwrap_or_else(PipelineConfig::default_path);
    let mut config = PipelineConfig::load(&config_path).await?;
    if let Some(db) = &args.db {
        config.db_path = db.clone();
    }

    let db = PipelineDb::open_at(&config.db_path)?;
    let store = CheckpointStore::new(&db);

    match args.command {
        CliCommand::Run(run) => {
            run.apply(&mut config);
            run_pipeline(config, store, &run).await
        }
        CliCommand::Plan(run) => {
            run.apply(&mut config);
            let orchestrator =
                Orchestrator::new(config.clone(), store, Collaborators::live(&config));
            println!("📋 Plan (terminal stage: {})", config.terminal_stage);
            for planned in orchestrator.plan()? {
                println!("   {:<11} {}", planned.stage.as_str(), planned.decision);
            }
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Status => {
            println!("📦 Checkpoints in {:?}", config.db_path);
            for stage in store.overview()? {
                println!(
                    "   {:<11} {:>4} key(s) {:>5} version(s)   latest: {}",
                    stage.stage.as_str(),
                    stage.keys,
                    stage.versions,
                    stage.latest_at.as_deref().unwrap_or("-")
                );
            }
            for stage in [Stage::Collect, Stage::Analyze] {
                let chats = store.list_chat_ids(stage)?;
                if !chats.is_empty() {
                    let chats: Vec<&str> = chats.iter().map(String::as_str).collect();
                    println!("   {} chats: {}", stage, chats.join(", "));
                }
            }
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::History { stage, chat } => {
            let versions = store.history(stage, chat.as_deref())?;
            if versions.is_empty() {
                println!("No checkpoints for {}", stage);
            }
            for version in versions {
                println!(
                    "   #{:<6} {}{}",
                    version.id,
                    version.created_at,
                    if version.readable { "" } else { "  (unreadable)" }
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        CliCommand::Reset { stage } => {
            let removed = store.clear(stage)?;
            match stage {
                Some(stage) => println!("🗑️  Removed {} {} checkpoint(s)", removed, stage),
                None => println!("🗑️  Removed {} checkpoint(s)", removed),
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_pipeline(
    config: PipelineConfig,
    store: CheckpointStore,
    run: &RunArgs,
) -> anyhow::Result<ExitCode> {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after in-flight work");
            token.cancel();
        }
    });

    let (event_tx, mut event_rx) = mpsc::channel::<PipelineEvent>(256);
    let quiet = run.json;
    let printer = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            if !quiet {
                print_event(&event);
            }
        }
    });

    let orchestrator = Orchestrator::new(config.clone(), store.clone(), Collaborators::live(&config))
        .with_event_channel(event_tx)
        .with_cancellation(cancel);
    let summary = orchestrator.run().await;
    // Closes the event channel
    drop(orchestrator);
    drain_printer(printer).await;
    let summary = summary?;

    if run.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary);
    }

    let reached_strategy = matches!(
        summary.state(Stage::Strategize),
        StageState::Done | StageState::Skipped
    );
    if summary.is_success() && reached_strategy && !run.no_report {
        match write_report(&MarkdownReportRenderer, &store, &config.output_dir).await {
            Ok(path) if !run.json => println!("📄 Report: {}", path.display()),
            Ok(_) => {}
            Err(e) => tracing::warn!("Failed to write report: {:#}", e),
        }
    }

    Ok(ExitCode::from(summary.exit_code() as u8))
}

/// Wait for the event printer to finish. Returns false if it panicked.
async fn drain_printer(printer: JoinHandle<()>) -> bool {
    match printer.await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "Event printer stopped unexpectedly");
            false
        }
    }
}

fn print_event(event: &PipelineEvent) {
    let stage = event.stage.map(|s| s.as_str()).unwrap_or("-");
    let chat = event
        .chat_id
        .as_deref()
        .map(|c| format!(" [{}]", c))
        .unwrap_or_default();
    let detail = |key: &str| {
        event
            .data
            .as_ref()
            .and_then(|d| d.get(key))
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string()
    };

    match event.kind {
        PipelineEventKind::StageSkipped => println!("⏭️  {} skipped ({})", stage, detail("reason")),
        PipelineEventKind::StageStarted => println!("▶️  {} started ({})", stage, detail("reason")),
        PipelineEventKind::StageCompleted => println!("✅ {} done", stage),
        PipelineEventKind::StageFailed => println!("❌ {} failed: {}", stage, detail("reason")),
        PipelineEventKind::UnitRetried => println!("   🔁 {}{} retrying: {}", stage, chat, detail("error")),
        PipelineEventKind::UnitFailed => println!("   ⚠️  {}{} skipped: {}", stage, chat, detail("reason")),
        _ => {}
    }
}

fn print_summary(summary: &RunSummary) {
    println!();
    println!("Run {}", summary.run_id);
    for entry in &summary.stages {
        let decision = entry
            .decision
            .as_ref()
            .map(|d| d.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "   {:<11} {:<8} {:<40} written {:>3}, reused {:>3}",
            entry.stage.as_str(),
            entry.state.as_str(),
            decision,
            entry.artifacts_written,
            entry.units_reused
        );
    }

    if !summary.unit_failures.is_empty() {
        println!("Skipped units:");
        for failure in &summary.unit_failures {
            println!(
                "   {} {}: {} (attempts: {})",
                failure.stage,
                failure.chat_id.as_deref().unwrap_or("-"),
                failure.reason,
                failure.attempts
            );
        }
    }

    match &summary.outcome {
        RunOutcome::Succeeded => println!("✅ Pipeline completed"),
        RunOutcome::Failed { stage, reason } => println!("❌ Pipeline failed at {}: {}", stage, reason),
        RunOutcome::Cancelled { stage } => match stage {
            Some(stage) => println!("🛑 Pipeline cancelled at {}", stage),
            None => println!("🛑 Pipeline cancelled"),
        },
    }
}
