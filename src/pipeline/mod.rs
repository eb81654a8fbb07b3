//! # Pipeline Module
//!
//! Modulo che compone gli stage della pipeline di analisi:
//! - `conversion`: Conversione degli input nel formato intermedio (Y4M)
//! - `analysis`: Esecuzione dell'analyzer con progresso in streaming
//! - `orchestrator`: Macchina a stati che sequenzia gli stage e gestisce la workspace
//! - `service`: Interfaccia per i collaboratori (submit, cancel, subscription)

pub mod analysis;
pub mod conversion;
pub mod orchestrator;
pub mod service;

pub use analysis::{AnalysisRequest, AnalysisStage};
pub use conversion::{ConversionStage, ConversionTask, Container, PixelFormat};
pub use orchestrator::{
    AnalysisJob, InputFile, NoopObserver, PipelineOrchestrator, PipelineState, ProgressObserver, Stage,
    StageStatus,
};
pub use service::{AnalysisService, AnalysisSubscriber, RunHandle};
