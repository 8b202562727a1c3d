//! `docchat`: ingest a PDF into Qdrant and answer questions about it.

mod repl;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use docchat_rag::{
    Answer, BatchStatus, CancellationToken, FailurePolicy, IngestOptions, IngestReport, SearchResult,
    Settings,
};
use docchat_server::{AppState, ChainCache, ServerConfig, SettingsChainFactory, run_server};
use docchat_telemetry::{LogFormat, TelemetryConfig, TurnTraceStore, init_telemetry, shutdown_telemetry};
use tracing::{info, warn};

#[derive(Debug, Parser)]
#[command(name = "docchat", version, about = "Chat with a PDF through retrieval-augmented generation")]
struct Cli {
    /// Log output format: text or json.
    #[arg(long, global = true, default_value = "text")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load, chunk, embed and store the source document.
    Ingest {
        /// Source file; defaults to PDF_PATH.
        #[arg(long)]
        pdf: Option<PathBuf>,
        /// Drop the collection first instead of upserting into it.
        #[arg(long)]
        recreate: bool,
        /// Stop at the first failed batch.
        #[arg(long)]
        abort_on_error: bool,
    },
    /// Serve the chat UI and JSON API.
    Serve {
        #[arg(long)]
        host: Option<String>,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Interactive chat in the terminal.
    Chat,
    /// Answer one question and exit.
    Ask {
        #[arg(required = true, num_args = 1..)]
        question: Vec<String>,
    },
    /// Validate settings and prompt files and print the resolved configuration.
    Check {
        /// Also confirm the collection exists with the configured dimensions.
        #[arg(long)]
        connect: bool,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let outcome = run(cli).await;
    shutdown_telemetry();
    match outcome {
        Ok(code) => code,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let settings = Settings::from_env().context("failed to load settings")?;

    // Interactive commands keep the terminal quiet unless RUST_LOG says otherwise.
    let default_filter = match cli.command {
        Command::Chat | Command::Ask { .. } | Command::Check { .. } => "warn",
        Command::Ingest { .. } | Command::Serve { .. } => "info",
    };
    let traces = Arc::new(TurnTraceStore::new());
    let mut telemetry = TelemetryConfig::new(settings.service_name.clone())
        .with_log_format(cli.log_format)
        .with_default_filter(default_filter)
        .with_otlp_endpoint(settings.otlp_endpoint.clone());
    if matches!(cli.command, Command::Serve { .. }) {
        telemetry = telemetry.with_turn_traces(traces.clone());
    }
    init_telemetry(&telemetry).context("failed to initialise telemetry")?;

    match cli.command {
        Command::Ingest { pdf, recreate, abort_on_error } => {
            ingest(&settings, pdf, recreate, abort_on_error).await
        }
        Command::Serve { host, port } => {
            let config = ServerConfig {
                host: host.unwrap_or_else(|| settings.host.clone()),
                port: port.unwrap_or(settings.port),
            };
            serve(config, traces).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Chat => {
            let chain = settings.build_chain()?;
            chain.verify().await?;
            repl::run(&chain).await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Ask { question } => {
            let chain = settings.build_chain()?;
            chain.verify().await?;
            match chain.answer(&question.join(" ")).await {
                Ok(answer) => {
                    print!("{}", render_answer(&answer));
                    Ok(ExitCode::SUCCESS)
                }
                Err(err) => {
                    warn!(error = %err, "answer failed");
                    eprintln!("{}", err.user_message());
                    Ok(ExitCode::FAILURE)
                }
            }
        }
        Command::Check { connect } => check(&settings, connect).await,
    }
}

async fn ingest(
    settings: &Settings,
    pdf: Option<PathBuf>,
    recreate: bool,
    abort_on_error: bool,
) -> anyhow::Result<ExitCode> {
    let mut config = settings.rag_config()?;
    if abort_on_error {
        config.failure_policy = FailurePolicy::Abort;
    }
    let path = pdf.unwrap_or_else(|| settings.pdf_path.clone());
    let ingestor = settings.build_ingestor(config)?;

    let cancel = CancellationToken::new();
    let interrupt = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupt received, stopping after the current batch");
                cancel.cancel();
            }
        })
    };

    info!(path = %path.display(), collection = ingestor.collection(), recreate, "starting ingestion");
    let report = ingestor.ingest_source(&path, IngestOptions { recreate }, &cancel).await;
    interrupt.abort();
    let report = report.with_context(|| format!("ingestion of {} failed", path.display()))?;

    print!("{}", render_report(&report));
    Ok(if report.is_success() { ExitCode::SUCCESS } else { ExitCode::FAILURE })
}

async fn serve(config: ServerConfig, traces: Arc<TurnTraceStore>) -> anyhow::Result<()> {
    let chains = Arc::new(ChainCache::new(Arc::new(SettingsChainFactory)));
    // Build eagerly so configuration problems show up in the startup log.
    if let Err(err) = chains.get().await {
        warn!(error = %err, "chain not ready; requests will retry the build");
    }
    let state = AppState::new(chains).with_traces(traces);
    run_server(config, state).await
}

async fn check(settings: &Settings, connect: bool) -> anyhow::Result<ExitCode> {
    let described = settings.describe();
    let width = described.iter().map(|(key, _)| key.len()).max().unwrap_or(0);
    for (key, value) in &described {
        println!("{key:<width$}  {value}");
    }

    let templates = settings.prompt_templates().context("prompt templates are invalid")?;
    println!();
    println!("prompt templates: {} and {} OK", templates.system.name(), templates.user.name());

    if connect {
        let chain = settings.build_chain()?;
        chain.verify().await.context("collection check failed")?;
        println!("collection '{}' OK", chain.collection());
    }
    Ok(ExitCode::SUCCESS)
}

fn render_report(report: &IngestReport) -> String {
    let mut out = format!(
        "chunks: {}  committed: {}  batches: {}\n",
        report.total_chunks,
        report.committed_chunks(),
        report.batches.len()
    );
    for batch in report.failed_batches() {
        if let BatchStatus::Failed { message, .. } = &batch.status {
            out.push_str(&format!(
                "  batch {} failed after {} attempts: {}\n",
                batch.index + 1,
                batch.attempts,
                message
            ));
        }
    }
    let skipped = report.skipped_batches();
    if skipped > 0 {
        out.push_str(&format!("  {skipped} batches skipped\n"));
    }
    if report.cancelled {
        out.push_str("  cancelled before completion\n");
    }
    out.push_str(if report.is_success() { "ingestion complete\n" } else { "ingestion incomplete\n" });
    out
}

fn render_answer(answer: &Answer) -> String {
    let mut out = format!("{}\n", answer.text.trim());
    if !answer.context.is_empty() {
        out.push('\n');
        out.push_str(&render_sources(&answer.context));
    }
    out
}

fn render_sources(context: &[SearchResult]) -> String {
    let mut out = String::from("Sources:\n");
    for (i, result) in context.iter().enumerate() {
        let source = result.chunk.source().unwrap_or(&result.chunk.document_id);
        match result.chunk.page() {
            Some(page) => out.push_str(&format!("  [{}] {source} (page {page}), score {:.3}\n", i + 1, result.score)),
            None => out.push_str(&format!("  [{}] {source}, score {:.3}\n", i + 1, result.score)),
        }
    }
    out
}
