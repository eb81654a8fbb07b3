//! # Observability Events
//!
//! Modulo che definisce l'interfaccia di osservabilità iniettata nei componenti.
//!
//! ## Responsabilità:
//! - `PipelineEvent`: eventi strutturati emessi da runner, workspace, stage e orchestratore
//! - `EventSink`: trait iniettato in ogni componente al posto di un logger globale
//! - `TracingSink`: implementazione di default che inoltra gli eventi a `tracing`
//! - `CapturingSink`: implementazione per i test, conserva gli eventi in memoria
//!
//! ## Esempio:
//! ```rust,ignore
//! let sink: Arc<dyn EventSink> = Arc::new(TracingSink);
//! sink.emit(&PipelineEvent::StaleWorkspacePurged { path });
//! ```

use std::path::PathBuf;
use std::sync::Mutex;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::pipeline::{PipelineState, Stage};
use crate::tool_resolver::{ToolKind, ToolOrigin};
use crate::workspace::RunId;

/// Why a subprocess was stopped before it exited on its own
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TerminationReason {
    Cancelled,
    TimedOut,
}

/// Structured event emitted by the pipeline components
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    StateChanged {
        run: RunId,
        from: PipelineState,
        to: PipelineState,
    },
    ToolResolved {
        kind: ToolKind,
        path: PathBuf,
        origin: ToolOrigin,
    },
    WorkspaceCreated {
        run: RunId,
        path: PathBuf,
        required_bytes: u64,
        available_bytes: u64,
    },
    StageStarted {
        run: RunId,
        stage: Stage,
    },
    StageFinished {
        run: RunId,
        stage: Stage,
        success: bool,
        duration_ms: u64,
    },
    SubprocessLaunched {
        program: String,
        pid: Option<u32>,
    },
    SubprocessTerminated {
        program: String,
        reason: TerminationReason,
        forced: bool,
    },
    ProgressUnitSkipped {
        unit: String,
        reason: String,
    },
    WorkspaceRemoved {
        run: RunId,
        path: PathBuf,
        bytes_freed: u64,
    },
    CleanupFailed {
        run: RunId,
        path: PathBuf,
        error: String,
    },
    StaleWorkspacePurged {
        path: PathBuf,
    },
}

/// Destination for pipeline events
pub trait EventSink: Send + Sync {
    fn emit(&self, event: &PipelineEvent);
}

/// Forwards every event to `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl EventSink for TracingSink {
    fn emit(&self, event: &PipelineEvent) {
        match event {
            PipelineEvent::StateChanged { run, from, to } => {
                debug!(run = %run, ?from, ?to, "Pipeline state changed");
            }
            PipelineEvent::ToolResolved { kind, path, origin } => {
                debug!(%kind, ?origin, "Resolved tool: {}", path.display());
            }
            PipelineEvent::WorkspaceCreated { run, path, required_bytes, available_bytes } => {
                info!(
                    run = %run,
                    required_bytes,
                    available_bytes,
                    "Created workspace: {}",
                    path.display()
                );
            }
            PipelineEvent::StageStarted { run, stage } => {
                info!(run = %run, stage = %stage, "Stage started");
            }
            PipelineEvent::StageFinished { run, stage, success, duration_ms } => {
                if *success {
                    info!(run = %run, stage = %stage, duration_ms, "Stage finished");
                } else {
                    warn!(run = %run, stage = %stage, duration_ms, "Stage failed");
                }
            }
            PipelineEvent::SubprocessLaunched { program, pid } => {
                debug!(?pid, "Launched {}", program);
            }
            PipelineEvent::SubprocessTerminated { program, reason, forced } => {
                warn!(?reason, forced, "Terminated {}", program);
            }
            PipelineEvent::ProgressUnitSkipped { unit, reason } => {
                debug!(%reason, "Skipping progress unit: {:?}", unit);
            }
            PipelineEvent::WorkspaceRemoved { run, path, bytes_freed } => {
                info!(run = %run, bytes_freed, "Removed workspace: {}", path.display());
            }
            PipelineEvent::CleanupFailed { run, path, error } => {
                warn!(run = %run, %error, "Failed to remove workspace: {}", path.display());
            }
            PipelineEvent::StaleWorkspacePurged { path } => {
                info!("Purged stale workspace: {}", path.display());
            }
        }
    }
}

/// Keeps every event in memory, for assertions in tests
#[derive(Debug, Default)]
pub struct CapturingSink {
    events: Mutex<Vec<PipelineEvent>>,
}

impl CapturingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<PipelineEvent> {
        self.events.lock().map(|events| events.clone()).unwrap_or_default()
    }

    pub fn count(&self, predicate: impl Fn(&PipelineEvent) -> bool) -> usize {
        self.events
            .lock()
            .map(|events| events.iter().filter(|e| predicate(e)).count())
            .unwrap_or(0)
    }
}

impl EventSink for CapturingSink {
    fn emit(&self, event: &PipelineEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}
