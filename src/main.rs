//! # Video Quality Analyzer - Main Entry Point
//!
//! Questo è il punto di ingresso principale dell'applicazione.
//!
//! ## Responsabilità:
//! - Parsing degli argomenti della command line con `clap`
//! - Inizializzazione del sistema di logging con `tracing` (su stderr)
//! - Caricamento della configurazione e applicazione degli override CLI
//! - Pulizia delle workspace abbandonate da run precedenti
//! - Avvio dell'analisi tramite `AnalysisService` e gestione di Ctrl-C
//!
//! ## Flusso di esecuzione:
//! 1. Parsa gli argomenti CLI (reference, distorted, modello, formato, etc.)
//! 2. Configura il logging (INFO o DEBUG a seconda del flag verbose, `RUST_LOG` rispettato)
//! 3. Carica `Config` dal file e applica gli override
//! 4. Sottomette il job e attende lo stato terminale
//! 5. Exit code: 0 completato, 1 fallito, 130 cancellato
//!
//! ## Esempio di utilizzo:
//! ```bash
//! quality-analyzer original.mp4 encoded.mp4 --model vmaf_4k_v0.6.1 --format xml --verbose
//! quality-analyzer tools
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use video_quality_analyzer::json_output::{JsonMessage, JsonSubscriber};
use video_quality_analyzer::progress::{CliSubscriber, ProgressManager};
use video_quality_analyzer::utils::format_size;
use video_quality_analyzer::{
    AnalysisJob, AnalysisService, CancelSignal, Config, PipelineError, PipelineOrchestrator,
    PipelineState, PixelFormat, ReportFormat, RunHandle, TracingSink,
};

#[derive(Parser)]
#[command(name = "quality-analyzer")]
#[command(about = "Compare a distorted video against its reference with a perceptual quality analyzer")]
#[command(args_conflicts_with_subcommands = true)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,

    /// Reference (original) video
    reference: Option<PathBuf>,

    /// Distorted (encoded) video
    distorted: Option<PathBuf>,

    /// Analyzer model (version name or path to a model file)
    #[arg(short, long)]
    model: Option<String>,

    /// Report format: json, xml or csv
    #[arg(short, long)]
    format: Option<ReportFormat>,

    /// Copy the raw analyzer report to this path
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Config file (defaults to the user config directory)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Directory where per-run workspaces are created
    #[arg(long)]
    workspace: Option<PathBuf>,

    /// Force the intermediate pixel format (e.g. yuv420p10le)
    #[arg(long)]
    pixel_format: Option<PixelFormat>,

    /// Analyzer worker threads
    #[arg(short, long)]
    threads: Option<usize>,

    /// Per-subprocess timeout in seconds
    #[arg(long)]
    timeout: Option<u64>,

    /// Convert the inputs one after the other
    #[arg(long)]
    sequential: bool,

    /// Emit JSON lines on stdout instead of a progress bar
    #[arg(long)]
    json: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Show where the converter and analyzer were found, with their versions
    Tools,
    /// Write the effective configuration to the config file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let args = Args::parse();

    // Logs go to stderr so stdout stays clean for --json
    let default_level = if args.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = args.config.clone().or_else(Config::default_path);
    let mut config = match &config_path {
        Some(path) => Config::from_file(path).await?,
        None => Config::default(),
    };
    apply_overrides(&mut config, &args);
    config.validate()?;

    match args.command {
        Some(Command::Tools) => {
            let orchestrator = PipelineOrchestrator::new(config, Arc::new(TracingSink));
            let report = orchestrator
                .resolver()
                .tools_report(orchestrator.runner(), &CancelSignal::never())
                .await;
            println!("{}", report);
            return Ok(ExitCode::SUCCESS);
        }
        Some(Command::InitConfig) => {
            let path = config_path.ok_or_else(|| anyhow::anyhow!("No config directory available, pass --config"))?;
            config.save_to_file(&path).await?;
            info!("Configuration written to {}", path.display());
            return Ok(ExitCode::SUCCESS);
        }
        None => {}
    }

    let (Some(reference), Some(distorted)) = (args.reference, args.distorted) else {
        return Err(anyhow::anyhow!("Both a reference and a distorted video are required"));
    };

    let orchestrator = PipelineOrchestrator::new(config, Arc::new(TracingSink));
    if orchestrator.config().purge_stale_workspaces {
        let purged = orchestrator.workspaces().purge_stale().await;
        if purged > 0 {
            info!("Removed {} stale workspace(s) from {}", purged, orchestrator.workspaces().root().display());
        }
    }

    let config = orchestrator.config();
    let mut job = AnalysisJob::new(reference, distorted, &config.model, config.output_format);
    job.report_copy_path = args.output;
    info!(
        "Analyzing {} against {} (model {})",
        job.distorted.path.display(),
        job.reference.path.display(),
        job.model
    );

    let service = AnalysisService::new(orchestrator);

    let (state, outcome) = if args.json {
        JsonMessage::start(&job).emit();
        let subscriber = Arc::new(JsonSubscriber::new());
        let handle = service.submit_analysis(job, subscriber.clone());
        let state = wait_with_interrupt(handle).await;
        (state, subscriber.take_outcome())
    } else {
        let subscriber = Arc::new(CliSubscriber::new(ProgressManager::new()));
        let handle = service.submit_analysis(job, subscriber.clone());
        let state = wait_with_interrupt(handle).await;
        (state, subscriber.take_outcome())
    };

    match outcome {
        Some(Ok(report)) => {
            if !args.json {
                println!("VMAF score: {:.2} ({} frames)", report.overall_score, report.frame_count());
            }
        }
        Some(Err(PipelineError::ToolNotFound(e))) => {
            error!("{}", e);
            error!("Install with: {}", service.orchestrator().resolver().install_instructions(e.kind));
        }
        Some(Err(PipelineError::InsufficientSpace { path, required, available })) => {
            error!(
                "Not enough free space in {}: {} required, {} available",
                path.display(),
                format_size(required),
                format_size(available)
            );
        }
        Some(Err(PipelineError::Cancelled)) => warn!("Analysis cancelled"),
        Some(Err(e)) => error!("Analysis failed: {}", e),
        None => error!("Analysis ended without an outcome"),
    }

    Ok(ExitCode::from(exit_code(state)))
}

/// Wait for the run; the first Ctrl-C cancels it, later ones are swallowed until teardown ends
async fn wait_with_interrupt(handle: RunHandle) -> PipelineState {
    let cancel = handle.cancel_handle();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling analysis...");
            cancel.cancel();
        }
    });

    let state = handle.wait().await;
    interrupt.abort();
    state
}

fn apply_overrides(config: &mut Config, args: &Args) {
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(format) = args.format {
        config.output_format = format;
    }
    if let Some(workspace) = &args.workspace {
        config.workspace_root = Some(workspace.clone());
    }
    if let Some(pixel_format) = args.pixel_format {
        config.pixel_format = Some(pixel_format);
    }
    if let Some(threads) = args.threads {
        config.analyzer_threads = Some(threads);
    }
    if let Some(timeout) = args.timeout {
        config.stage_timeout_secs = Some(timeout);
    }
    if args.sequential {
        config.parallel_conversion = false;
    }
}

fn exit_code(state: PipelineState) -> u8 {
    match state {
        PipelineState::Completed => 0,
        PipelineState::Cancelled => 130,
        _ => 1,
    }
}
