//! # JSON Output Module
//!
//! Questo modulo gestisce l'output strutturato in JSON per comunicazione con l'host (UI/Electron).
//!
//! ## Responsabilità:
//! - Emette un messaggio JSON per riga su stdout per ogni evento della pipeline
//! - Traduce stati, stage, progresso ed esito finale nel protocollo dell'host
//! - Fornisce interfaccia standardizzata per comunicazione inter-processo
//!
//! ## Tipi di messaggi:
//! - `start`: Inizio analisi (input, modello, formato)
//! - `state`: Transizione della state machine
//! - `stage`: Inizio/fine di una conversione o dell'analisi
//! - `progress`: Frame corrente, totale, fps, ETA, VMAF parziale
//! - `complete`: Report finale
//! - `error`: Errore con tag `kind` leggibile dalla macchina
//! - `cancelled`: Run cancellato

use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use crate::error::PipelineError;
use crate::pipeline::{AnalysisJob, AnalysisSubscriber, PipelineState, ProgressObserver, Stage, StageStatus};
use crate::report::{AnalysisReport, PooledMetric, ReportFormat};
use crate::stream_parser::ProgressSample;

/// Tipo di messaggio JSON
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
pub enum JsonMessage {
    /// Inizio dell'analisi
    #[serde(rename = "start")]
    Start {
        reference: PathBuf,
        distorted: PathBuf,
        model: String,
        output_format: ReportFormat,
    },

    /// Transizione di stato
    #[serde(rename = "state")]
    State { state: PipelineState },

    /// Inizio o fine di uno stage
    #[serde(rename = "stage")]
    Stage {
        stage: Stage,
        status: &'static str,
        success: Option<bool>,
    },

    /// Progresso dell'analisi
    #[serde(rename = "progress")]
    Progress {
        frame: u64,
        total_frames: Option<u64>,
        percentage: Option<f64>,
        fps: f64,
        vmaf: Option<f64>,
        elapsed_seconds: f64,
        eta_seconds: Option<f64>,
    },

    /// Analisi completata
    #[serde(rename = "complete")]
    Complete {
        overall_score: f64,
        frames: usize,
        aggregates: BTreeMap<String, PooledMetric>,
        analyzer_version: Option<String>,
        duration_seconds: f64,
    },

    /// Errore generale
    #[serde(rename = "error")]
    Error {
        kind: &'static str,
        message: String,
        details: Option<String>,
    },

    /// Run cancellato dall'utente
    #[serde(rename = "cancelled")]
    Cancelled,
}

impl JsonMessage {
    /// Emette il messaggio JSON su stdout
    pub fn emit(&self) {
        if let Ok(json) = serde_json::to_string(self) {
            println!("{}", json);
        }
    }

    /// Crea un messaggio di inizio
    pub fn start(job: &AnalysisJob) -> Self {
        Self::Start {
            reference: job.reference.path.clone(),
            distorted: job.distorted.path.clone(),
            model: job.model.clone(),
            output_format: job.output_format,
        }
    }

    pub fn stage(stage: Stage, status: StageStatus) -> Self {
        match status {
            StageStatus::Started => Self::Stage { stage, status: "started", success: None },
            StageStatus::Finished { success } => Self::Stage {
                stage,
                status: "finished",
                success: Some(success),
            },
        }
    }

    /// Crea un messaggio di progresso
    pub fn progress(sample: &ProgressSample) -> Self {
        Self::Progress {
            frame: sample.current_frame,
            total_frames: sample.total_frames,
            percentage: sample.percent(),
            fps: sample.frames_per_second,
            vmaf: sample.running_quality,
            elapsed_seconds: sample.elapsed.as_secs_f64(),
            eta_seconds: sample.remaining.map(|d| d.as_secs_f64()),
        }
    }

    /// Crea un messaggio di completamento
    pub fn complete(report: &AnalysisReport, duration_seconds: f64) -> Self {
        Self::Complete {
            overall_score: report.overall_score,
            frames: report.frame_count(),
            aggregates: report.aggregates.clone(),
            analyzer_version: report.analyzer_version.clone(),
            duration_seconds,
        }
    }

    /// Crea un messaggio di errore, o `cancelled` se il run è stato cancellato
    pub fn from_error(error: &PipelineError) -> Self {
        if error.is_cancelled() {
            return Self::Cancelled;
        }
        let details = match error {
            PipelineError::ConversionFailed { stage, .. } => Some(format!("stage: {}", stage)),
            PipelineError::ToolNotFound(e) => Some(format!("tool: {}", e.kind)),
            _ => None,
        };
        Self::Error {
            kind: error.kind(),
            message: error.to_string(),
            details,
        }
    }
}

/// Subscriber che emette il protocollo JSON e conserva l'esito
pub struct JsonSubscriber {
    started: Instant,
    outcome: Mutex<Option<Result<AnalysisReport, PipelineError>>>,
}

impl JsonSubscriber {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            outcome: Mutex::new(None),
        }
    }

    pub fn take_outcome(&self) -> Option<Result<AnalysisReport, PipelineError>> {
        self.outcome.lock().ok().and_then(|mut outcome| outcome.take())
    }

    fn store(&self, result: Result<AnalysisReport, PipelineError>) {
        if let Ok(mut outcome) = self.outcome.lock() {
            *outcome = Some(result);
        }
    }
}

impl Default for JsonSubscriber {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for JsonSubscriber {
    fn on_state(&self, state: PipelineState) {
        JsonMessage::State { state }.emit();
    }

    fn on_stage(&self, stage: Stage, status: StageStatus) {
        JsonMessage::stage(stage, status).emit();
    }

    fn on_progress(&self, sample: &ProgressSample) {
        JsonMessage::progress(sample).emit();
    }
}

impl AnalysisSubscriber for JsonSubscriber {
    fn on_complete(&self, report: AnalysisReport) {
        JsonMessage::complete(&report, self.started.elapsed().as_secs_f64()).emit();
        self.store(Ok(report));
    }

    fn on_error(&self, error: PipelineError) {
        JsonMessage::from_error(&error).emit();
        self.store(Err(error));
    }
}
