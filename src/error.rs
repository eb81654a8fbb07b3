//! # Error Types Module
//!
//! Questo modulo definisce tutti i tipi di errore custom della pipeline di analisi.
//!
//! ## Responsabilità:
//! - Definisce un enum di errore per ogni componente (runner, tool locator, stage, workspace)
//! - Definisce `PipelineError`, l'esito terminale di un run fallito o cancellato
//! - Integra con `thiserror` per messaggi e conversioni automatiche
//! - Conserva sempre il contesto: quale stage, quale exit code, quale estratto di stderr
//!
//! ## Categorie di errori (`PipelineError`):
//! - `ToolNotFound`: Tool esterno non trovato (precondizione fatale)
//! - `InsufficientSpace`: Spazio disco sotto il minimo calcolato (precondizione fatale)
//! - `ConversionFailed`: Conversione reference/distorted fallita
//! - `AnalysisFailed`: Il tool di analisi è uscito con errore
//! - `MalformedReport`: Exit 0 ma report assente o non parsabile
//! - `Cancelled`: Esito terminale distinto, richiesto dall'utente
//!
//! Il fallimento del cleanup non è un errore restituito: viene solo loggato
//! tramite `PipelineEvent::CleanupFailed`.
//!
//! ## Esempio:
//! ```rust,ignore
//! return Err(PipelineError::ToolNotFound(ToolNotFoundError { kind: ToolKind::Analyzer }));
//! ```

use std::fmt;
use std::path::PathBuf;

use crate::tool_resolver::ToolKind;

/// Which of the two inputs a conversion belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputRole {
    Reference,
    Distorted,
}

impl fmt::Display for InputRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InputRole::Reference => write!(f, "reference"),
            InputRole::Distorted => write!(f, "distorted"),
        }
    }
}

/// No candidate executable exists for a tool
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} tool not found (searched bundled dir, PATH and fallback locations)")]
pub struct ToolNotFoundError {
    pub kind: ToolKind,
}

/// Errors raised by the subprocess runner itself (not by the child)
#[derive(thiserror::Error, Debug)]
pub enum RunnerError {
    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to wait for {program}: {source}")]
    Wait {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

/// Conversion stage failure
#[derive(thiserror::Error, Debug)]
pub enum ConversionError {
    #[error("converter failed (exit code {}): {stderr_excerpt}", display_code(.exit_code))]
    Failed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },

    #[error(transparent)]
    ToolNotFound(#[from] ToolNotFoundError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("conversion cancelled")]
    Cancelled,
}

/// Analysis stage failure
#[derive(thiserror::Error, Debug)]
pub enum AnalysisError {
    #[error("analyzer failed (exit code {}): {stderr_excerpt}", display_code(.exit_code))]
    Failed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },

    #[error("malformed report: {0}")]
    MalformedReport(String),

    #[error(transparent)]
    ToolNotFound(#[from] ToolNotFoundError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("analysis cancelled")]
    Cancelled,
}

/// Workspace allocation failures
#[derive(thiserror::Error, Debug)]
pub enum WorkspaceError {
    #[error("insufficient disk space in {}: {required} bytes required, {available} available", .path.display())]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("workspace IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Terminal error of one pipeline run
#[derive(thiserror::Error, Debug)]
pub enum PipelineError {
    #[error(transparent)]
    ToolNotFound(#[from] ToolNotFoundError),

    #[error("insufficient disk space in {}: {required} bytes required, {available} available", .path.display())]
    InsufficientSpace {
        path: PathBuf,
        required: u64,
        available: u64,
    },

    #[error("{stage} conversion failed (exit code {}): {stderr_excerpt}", display_code(.exit_code))]
    ConversionFailed {
        stage: InputRole,
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },

    #[error("analysis failed (exit code {}): {stderr_excerpt}", display_code(.exit_code))]
    AnalysisFailed {
        exit_code: Option<i32>,
        stderr_excerpt: String,
    },

    #[error("malformed report: {0}")]
    MalformedReport(String),

    #[error("analysis cancelled")]
    Cancelled,

    #[error("failed to launch {program}: {source}")]
    Launch {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("workspace IO error: {0}")]
    Workspace(#[from] std::io::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

impl PipelineError {
    /// Wrap a conversion failure with the stage it happened in
    pub fn conversion(stage: InputRole, err: ConversionError) -> Self {
        match err {
            ConversionError::Failed { exit_code, stderr_excerpt } => PipelineError::ConversionFailed {
                stage,
                exit_code,
                stderr_excerpt,
            },
            ConversionError::ToolNotFound(e) => PipelineError::ToolNotFound(e),
            ConversionError::Runner(e) => e.into(),
            ConversionError::Cancelled => PipelineError::Cancelled,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, PipelineError::Cancelled)
    }

    /// Short machine-readable tag, used by the JSON host protocol
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::ToolNotFound(_) => "tool_not_found",
            PipelineError::InsufficientSpace { .. } => "insufficient_space",
            PipelineError::ConversionFailed { .. } => "conversion_failed",
            PipelineError::AnalysisFailed { .. } => "analysis_failed",
            PipelineError::MalformedReport(_) => "malformed_report",
            PipelineError::Cancelled => "cancelled",
            PipelineError::Launch { .. } => "launch_failed",
            PipelineError::Workspace(_) => "workspace",
            PipelineError::Validation(_) => "validation",
        }
    }
}

impl From<AnalysisError> for PipelineError {
    fn from(err: AnalysisError) -> Self {
        match err {
            AnalysisError::Failed { exit_code, stderr_excerpt } => {
                PipelineError::AnalysisFailed { exit_code, stderr_excerpt }
            }
            AnalysisError::MalformedReport(reason) => PipelineError::MalformedReport(reason),
            AnalysisError::ToolNotFound(e) => PipelineError::ToolNotFound(e),
            AnalysisError::Runner(e) => e.into(),
            AnalysisError::Cancelled => PipelineError::Cancelled,
        }
    }
}

impl From<WorkspaceError> for PipelineError {
    fn from(err: WorkspaceError) -> Self {
        match err {
            WorkspaceError::InsufficientSpace { path, required, available } => {
                PipelineError::InsufficientSpace { path, required, available }
            }
            WorkspaceError::Io(e) => PipelineError::Workspace(e),
        }
    }
}

impl From<RunnerError> for PipelineError {
    fn from(err: RunnerError) -> Self {
        match err {
            RunnerError::Launch { program, source } | RunnerError::Wait { program, source } => {
                PipelineError::Launch { program, source }
            }
        }
    }
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string()).unwrap_or_else(|| "n/a".to_string())
}
