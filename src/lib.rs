//! # Video Quality Analyzer Library
//!
//! Questo è il modulo principale della libreria che espone tutte le API pubbliche.
//!
//! ## Responsabilità:
//! - Definisce la struttura modulare dell'applicazione
//! - Espone i tipi e le funzioni principali tramite re-exports
//! - Fornisce un'interfaccia pulita per il main.rs e per altri consumatori (UI, host)
//!
//! ## Architettura dei moduli:
//! - `config`: Gestione configurazione e validazione parametri
//! - `error`: Tipi di errore custom per ogni componente
//! - `cancel`: Cancellazione cooperativa
//! - `events`: Eventi strutturati della pipeline e sink iniettabili
//! - `platform`: Dettagli specifici del sistema operativo
//! - `tool_resolver`: Localizzazione di converter (ffmpeg) e analyzer (vmaf)
//! - `runner`: Esecuzione di sottoprocessi con streaming, timeout e terminazione
//! - `stream_parser`: Parsing incrementale del progresso dell'analyzer
//! - `report`: Lettura dei report json/xml/csv
//! - `y4m`: Lettura degli header degli intermedi
//! - `workspace`: Directory temporanea per run
//! - `pipeline`: Stage di conversione/analisi, orchestratore e service
//! - `progress`: Progress bar della CLI
//! - `json_output`: Protocollo JSON-lines per l'host
//!
//! ## Utilizzo:
//! ```rust,ignore
//! use video_quality_analyzer::{AnalysisJob, Config, NoopObserver, PipelineOrchestrator, ReportFormat, TracingSink};
//!
//! let orchestrator = PipelineOrchestrator::new(Config::default(), Arc::new(TracingSink));
//! let job = AnalysisJob::new("ref.mp4", "dist.mp4", "vmaf_v0.6.1", ReportFormat::Json);
//! let report = orchestrator.run(&job, &NoopObserver, &CancelSignal::never()).await?;
//! println!("VMAF: {:.2}", report.overall_score);
//! ```

pub mod cancel;
pub mod config;
pub mod error;
pub mod events;
pub mod json_output;
pub mod pipeline;
pub mod platform;
pub mod progress;
pub mod report;
pub mod runner;
pub mod stream_parser;
pub mod tool_resolver;
pub mod utils;
pub mod workspace;
pub mod y4m;

pub use cancel::{CancelHandle, CancelSignal};
pub use config::Config;
pub use error::{InputRole, PipelineError};
pub use events::{CapturingSink, EventSink, PipelineEvent, TracingSink};
pub use pipeline::{
    AnalysisJob, AnalysisService, AnalysisSubscriber, InputFile, NoopObserver, PipelineOrchestrator,
    PipelineState, PixelFormat, ProgressObserver, RunHandle, Stage, StageStatus,
};
pub use report::{AnalysisReport, ReportFormat};
pub use stream_parser::ProgressSample;
pub use tool_resolver::{ToolKind, ToolPathResolver};
