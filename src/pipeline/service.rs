//! # Analysis Service
//!
//! Interfaccia esposta ai collaboratori (UI, renderer, host): sottomette un
//! job, restituisce un handle cancellabile e notifica il subscriber.
//!
//! ## Contratto del subscriber:
//! - `on_state` / `on_stage` / `on_progress` durante il run
//! - esattamente uno tra `on_complete` e `on_error` alla fine
//!   (la cancellazione arriva come `on_error(PipelineError::Cancelled)`)

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;

use crate::cancel::CancelHandle;
use crate::error::PipelineError;
use crate::pipeline::orchestrator::{AnalysisJob, PipelineOrchestrator, PipelineState, ProgressObserver};
use crate::report::AnalysisReport;

/// Receives the outcome of a submitted analysis
pub trait AnalysisSubscriber: ProgressObserver {
    fn on_complete(&self, report: AnalysisReport);
    fn on_error(&self, error: PipelineError);
}

/// Handle of a submitted run
#[derive(Debug)]
pub struct RunHandle {
    id: u64,
    cancel: CancelHandle,
    task: JoinHandle<PipelineState>,
}

impl RunHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Request cancellation; the subscriber still receives `on_error(Cancelled)`
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Cancellation handle that outlives `wait()`
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Wait for the terminal state of the run
    pub async fn wait(self) -> PipelineState {
        match self.task.await {
            Ok(state) => state,
            Err(e) => {
                warn!("Analysis run {} aborted: {}", self.id, e);
                PipelineState::Failed
            }
        }
    }
}

/// Runs submitted analyses on the tokio runtime
pub struct AnalysisService {
    orchestrator: Arc<PipelineOrchestrator>,
    next_id: AtomicU64,
}

impl AnalysisService {
    pub fn new(orchestrator: PipelineOrchestrator) -> Self {
        Self {
            orchestrator: Arc::new(orchestrator),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn orchestrator(&self) -> &PipelineOrchestrator {
        &self.orchestrator
    }

    pub fn submit_analysis(&self, job: AnalysisJob, subscriber: Arc<dyn AnalysisSubscriber>) -> RunHandle {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelHandle::new();
        let signal = cancel.signal();
        let orchestrator = Arc::clone(&self.orchestrator);

        let task = tokio::spawn(async move {
            match orchestrator.run(&job, subscriber.as_ref(), &signal).await {
                Ok(report) => {
                    subscriber.on_complete(report);
                    PipelineState::Completed
                }
                Err(error) => {
                    let state = if error.is_cancelled() {
                        PipelineState::Cancelled
                    } else {
                        PipelineState::Failed
                    };
                    subscriber.on_error(error);
                    state
                }
            }
        });

        RunHandle { id, cancel, task }
    }

    pub fn cancel(&self, handle: &RunHandle) {
        handle.cancel();
    }
}
