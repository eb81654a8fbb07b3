//! # Pipeline Orchestrator
//!
//! Orchestratore principale: compone conversione → analisi → report in
//! un'unica operazione cancellabile e osservabile.
//!
//! ## Macchina a stati:
//! ```text
//! Idle → ValidatingInputs → ConvertingReference / ConvertingDistorted → Analyzing → Completed
//!            │                        │                                   │
//!            └────────────► Cancelling → Cancelled ◄──────────────────────┘
//!            └────────────► Failed (da qualunque stage)
//! ```
//!
//! ## Responsabilità:
//! - Valida gli input e risolve entrambi i tool prima di lanciare qualsiasi processo
//! - Possiede la workspace del run: la crea, la passa agli stage, la distrugge sempre
//! - Esegue le due conversioni in parallelo (o in sequenza da configurazione);
//!   il fallimento di una cancella l'altra
//! - Inoltra il progresso fine dell'analisi e quello grossolano (start/end) delle conversioni
//! - Restituisce esattamente un esito: report, errore o `Cancelled`
//!
//! ## Garanzie:
//! - La teardown della workspace avviene su ogni percorso di uscita
//! - Un errore di cleanup viene emesso come evento, mai restituito
//! - Nessun report parziale in caso di cancellazione

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use serde::{Serialize, Serializer};
use tracing::{debug, warn};

use crate::cancel::{CancelHandle, CancelSignal};
use crate::config::Config;
use crate::error::{InputRole, PipelineError};
use crate::events::{EventSink, PipelineEvent};
use crate::pipeline::analysis::{AnalysisRequest, AnalysisSettings, AnalysisStage};
use crate::pipeline::conversion::{Container, ConversionStage, ConversionTask, PixelFormat};
use crate::report::{AnalysisReport, ReportFormat};
use crate::runner::SubprocessRunner;
use crate::stream_parser::ProgressSample;
use crate::tool_resolver::{ToolKind, ToolPathResolver, ToolSearch};
use crate::workspace::{DiskSpaceProbe, RunId, StatvfsProbe, Workspace, WorkspaceManager};

/// Lifecycle of one pipeline run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Idle,
    ValidatingInputs,
    ConvertingReference,
    ConvertingDistorted,
    Analyzing,
    Completed,
    Cancelling,
    Cancelled,
    Failed,
}

impl PipelineState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PipelineState::Completed | PipelineState::Cancelled | PipelineState::Failed)
    }

    pub fn can_transition_to(&self, next: PipelineState) -> bool {
        use PipelineState::*;

        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (Cancelling, Cancelled) => true,
            (Cancelling, _) => false,
            (_, Cancelling) | (_, Failed) => true,
            (Idle, ValidatingInputs) => true,
            (ValidatingInputs, ConvertingReference) | (ValidatingInputs, ConvertingDistorted) => true,
            (ConvertingReference, ConvertingDistorted) | (ConvertingDistorted, ConvertingReference) => true,
            (ConvertingReference, Analyzing) | (ConvertingDistorted, Analyzing) => true,
            (Analyzing, Completed) => true,
            _ => false,
        }
    }
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Idle => "idle",
            PipelineState::ValidatingInputs => "validating inputs",
            PipelineState::ConvertingReference => "converting reference",
            PipelineState::ConvertingDistorted => "converting distorted",
            PipelineState::Analyzing => "analyzing",
            PipelineState::Completed => "completed",
            PipelineState::Cancelling => "cancelling",
            PipelineState::Cancelled => "cancelled",
            PipelineState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// A unit of work inside a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Conversion(InputRole),
    Analysis,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Conversion(role) => write!(f, "{}_conversion", role),
            Stage::Analysis => f.write_str("analysis"),
        }
    }
}

impl Serialize for Stage {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Coarse stage progress
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Started,
    Finished { success: bool },
}

/// Input file as supplied by the file selector
#[derive(Debug, Clone, PartialEq)]
pub struct InputFile {
    pub path: PathBuf,
    pub codec: Option<String>,
    pub bit_depth: Option<u8>,
}

impl InputFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            codec: None,
            bit_depth: None,
        }
    }
}

/// One analysis request
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisJob {
    pub reference: InputFile,
    pub distorted: InputFile,
    pub model: String,
    pub output_format: ReportFormat,
    /// Copy the raw analyzer report here before the workspace is removed
    pub report_copy_path: Option<PathBuf>,
}

impl AnalysisJob {
    pub fn new(reference: impl Into<PathBuf>, distorted: impl Into<PathBuf>, model: &str, output_format: ReportFormat) -> Self {
        Self {
            reference: InputFile::new(reference),
            distorted: InputFile::new(distorted),
            model: model.to_string(),
            output_format,
            report_copy_path: None,
        }
    }
}

/// Receives state changes and progress of a run
pub trait ProgressObserver: Send + Sync {
    fn on_state(&self, _state: PipelineState) {}
    fn on_stage(&self, _stage: Stage, _status: StageStatus) {}
    fn on_progress(&self, _sample: &ProgressSample) {}
}

/// Observer that ignores everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {}

/// Tracks the current state and reports every transition
struct StateTracker<'a, O: ProgressObserver + ?Sized> {
    run_id: RunId,
    state: PipelineState,
    events: &'a dyn EventSink,
    observer: &'a O,
}

impl<'a, O: ProgressObserver + ?Sized> StateTracker<'a, O> {
    fn new(run_id: RunId, events: &'a dyn EventSink, observer: &'a O) -> Self {
        Self {
            run_id,
            state: PipelineState::Idle,
            events,
            observer,
        }
    }

    fn set(&mut self, next: PipelineState) {
        if self.state == next {
            return;
        }
        if !self.state.can_transition_to(next) {
            warn!("Unexpected pipeline transition {:?} -> {:?}", self.state, next);
        }
        self.events.emit(&PipelineEvent::StateChanged {
            run: self.run_id.clone(),
            from: self.state,
            to: next,
        });
        self.state = next;
        self.observer.on_state(next);
    }
}

/// Drives one analysis run from raw inputs to a report
pub struct PipelineOrchestrator {
    config: Config,
    resolver: Arc<ToolPathResolver>,
    runner: Arc<SubprocessRunner>,
    workspaces: WorkspaceManager,
    conversion: ConversionStage,
    analysis: AnalysisStage,
    events: Arc<dyn EventSink>,
}

impl PipelineOrchestrator {
    pub fn new(config: Config, events: Arc<dyn EventSink>) -> Self {
        let search = ToolSearch::from_config(&config);
        Self::with_parts(config, search, Arc::new(StatvfsProbe), events)
    }

    /// Build with an explicit tool search and free-space source
    pub fn with_parts(
        config: Config,
        search: ToolSearch,
        probe: Arc<dyn DiskSpaceProbe>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let resolver = Arc::new(ToolPathResolver::new(search, Arc::clone(&events)));
        let runner = Arc::new(SubprocessRunner::new(config.termination_grace(), Arc::clone(&events)));
        let workspaces = WorkspaceManager::with_probe(
            config.workspace_root(),
            config.space_policy(),
            probe,
            Arc::clone(&events),
        );
        let conversion = ConversionStage::new(
            Arc::clone(&resolver),
            Arc::clone(&runner),
            config.stage_timeout(),
            config.stderr_excerpt_bytes,
        );
        let analysis = AnalysisStage::new(
            Arc::clone(&resolver),
            Arc::clone(&runner),
            Arc::clone(&events),
            AnalysisSettings {
                timeout: config.stage_timeout(),
                excerpt_bytes: config.stderr_excerpt_bytes,
                rate_smoothing: config.rate_smoothing,
                threads: config.analyzer_threads,
            },
        );

        Self {
            config,
            resolver,
            runner,
            workspaces,
            conversion,
            analysis,
            events,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn resolver(&self) -> &ToolPathResolver {
        &self.resolver
    }

    pub fn runner(&self) -> &SubprocessRunner {
        &self.runner
    }

    pub fn workspaces(&self) -> &WorkspaceManager {
        &self.workspaces
    }

    /// Run the whole pipeline. Returns exactly one of: a report, an error,
    /// or `PipelineError::Cancelled`.
    pub async fn run<O: ProgressObserver + ?Sized>(
        &self,
        job: &AnalysisJob,
        observer: &O,
        cancel: &CancelSignal,
    ) -> Result<AnalysisReport, PipelineError> {
        let run_id = RunId::new(&[&job.reference.path, &job.distorted.path]);
        let mut tracker = StateTracker::new(run_id.clone(), self.events.as_ref(), observer);
        let started = Instant::now();

        tracker.set(PipelineState::ValidatingInputs);
        let result = self.execute(&run_id, job, &mut tracker, cancel).await;

        // once cancellation was requested the run can only end as Cancelled
        let result = match result {
            Ok(_) if cancel.is_cancelled() => Err(PipelineError::Cancelled),
            Err(e) if cancel.is_cancelled() && !e.is_cancelled() => {
                debug!("Run {} failed while cancelling: {}", run_id, e);
                Err(PipelineError::Cancelled)
            }
            other => other,
        };
        match &result {
            Ok(_) => tracker.set(PipelineState::Completed),
            Err(PipelineError::Cancelled) => {
                tracker.set(PipelineState::Cancelling);
                tracker.set(PipelineState::Cancelled);
            }
            Err(_) => tracker.set(PipelineState::Failed),
        }
        debug!("Run {} ended as {} after {:?}", run_id, tracker.state, started.elapsed());
        result
    }

    async fn execute<O: ProgressObserver + ?Sized>(
        &self,
        run_id: &RunId,
        job: &AnalysisJob,
        tracker: &mut StateTracker<'_, O>,
        cancel: &CancelSignal,
    ) -> Result<AnalysisReport, PipelineError> {
        self.validate(job)?;
        // both tools must exist before anything is launched
        self.resolver.resolve(ToolKind::Converter)?;
        self.resolver.resolve(ToolKind::Analyzer)?;
        cancel.checkpoint()?;

        let mut workspace = self
            .workspaces
            .create(run_id, &[job.reference.path.as_path(), job.distorted.path.as_path()])
            .await?;

        let result = self.run_stages(run_id, job, &workspace, tracker, cancel).await;

        if matches!(result, Err(PipelineError::Cancelled)) || cancel.is_cancelled() {
            tracker.set(PipelineState::Cancelling);
        }
        // failure is reported as CleanupFailed and never masks the result
        self.workspaces.destroy(&mut workspace).await;
        result
    }

    fn validate(&self, job: &AnalysisJob) -> Result<(), PipelineError> {
        if job.model.trim().is_empty() {
            return Err(PipelineError::Validation("model identifier is empty".to_string()));
        }
        for (role, input) in [(InputRole::Reference, &job.reference), (InputRole::Distorted, &job.distorted)] {
            if input.path.as_os_str().is_empty() {
                return Err(PipelineError::Validation(format!("{} path is empty", role)));
            }
        }
        Ok(())
    }

    fn pixel_format_for(&self, job: &AnalysisJob) -> PixelFormat {
        self.config.pixel_format.unwrap_or_else(|| {
            PixelFormat::for_bit_depth(job.reference.bit_depth.max(job.distorted.bit_depth))
        })
    }

    async fn run_stages<O: ProgressObserver + ?Sized>(
        &self,
        run_id: &RunId,
        job: &AnalysisJob,
        workspace: &Workspace,
        tracker: &mut StateTracker<'_, O>,
        cancel: &CancelSignal,
    ) -> Result<AnalysisReport, PipelineError> {
        let pixel_format = self.pixel_format_for(job);
        let task_for = |role: InputRole, input: &InputFile| ConversionTask {
            input_path: input.path.clone(),
            output_path: workspace.intermediate_path(role),
            target_pixel_format: pixel_format,
            target_container: Container::Y4m,
        };
        let reference_task = task_for(InputRole::Reference, &job.reference);
        let distorted_task = task_for(InputRole::Distorted, &job.distorted);

        if self.config.parallel_conversion {
            let sibling = CancelHandle::new();
            let linked = cancel.linked(&sibling);

            tracker.set(PipelineState::ConvertingReference);
            tracker.set(PipelineState::ConvertingDistorted);
            let observer = tracker.observer;
            let (reference, distorted) = tokio::join!(
                self.convert_one(run_id, InputRole::Reference, &reference_task, observer, &linked, &sibling),
                self.convert_one(run_id, InputRole::Distorted, &distorted_task, observer, &linked, &sibling),
            );
            merge_conversion_results(reference, distorted)?;
        } else {
            let unused_sibling = CancelHandle::new();
            tracker.set(PipelineState::ConvertingReference);
            self.convert_one(run_id, InputRole::Reference, &reference_task, tracker.observer, cancel, &unused_sibling)
                .await?;
            cancel.checkpoint()?;
            tracker.set(PipelineState::ConvertingDistorted);
            self.convert_one(run_id, InputRole::Distorted, &distorted_task, tracker.observer, cancel, &unused_sibling)
                .await?;
        }
        cancel.checkpoint()?;

        tracker.set(PipelineState::Analyzing);
        let request = AnalysisRequest {
            reference: reference_task.output_path.clone(),
            distorted: distorted_task.output_path.clone(),
            model: job.model.clone(),
            output_format: job.output_format,
            output_path: workspace.report_path(job.output_format),
        };
        let report = self.analyze(run_id, &request, tracker.observer, cancel).await?;
        cancel.checkpoint()?;

        if let Some(destination) = &job.report_copy_path {
            if let Some(parent) = destination.parent().filter(|p| !p.as_os_str().is_empty()) {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(&request.output_path, destination).await?;
            debug!("Copied report to {}", destination.display());
        }

        Ok(report)
    }

    /// Convert one input; a real failure cancels the sibling conversion
    async fn convert_one<O: ProgressObserver + ?Sized>(
        &self,
        run_id: &RunId,
        role: InputRole,
        task: &ConversionTask,
        observer: &O,
        cancel: &CancelSignal,
        sibling: &CancelHandle,
    ) -> Result<(), PipelineError> {
        let stage = Stage::Conversion(role);
        let started = self.stage_started(run_id, stage, observer);

        let result = self
            .conversion
            .convert(task, cancel)
            .await
            .map_err(|e| PipelineError::conversion(role, e));
        if let Err(e) = &result {
            if !e.is_cancelled() {
                sibling.cancel();
            }
        }

        self.stage_finished(run_id, stage, observer, started, result.is_ok());
        result
    }

    async fn analyze<O: ProgressObserver + ?Sized>(
        &self,
        run_id: &RunId,
        request: &AnalysisRequest,
        observer: &O,
        cancel: &CancelSignal,
    ) -> Result<AnalysisReport, PipelineError> {
        let started = self.stage_started(run_id, Stage::Analysis, observer);
        let mut on_progress = |sample: &ProgressSample| observer.on_progress(sample);
        let result = self
            .analysis
            .analyze(request, &mut on_progress, cancel)
            .await
            .map_err(PipelineError::from);
        self.stage_finished(run_id, Stage::Analysis, observer, started, result.is_ok());
        result
    }

    fn stage_started<O: ProgressObserver + ?Sized>(&self, run_id: &RunId, stage: Stage, observer: &O) -> Instant {
        self.events.emit(&PipelineEvent::StageStarted { run: run_id.clone(), stage });
        observer.on_stage(stage, StageStatus::Started);
        Instant::now()
    }

    fn stage_finished<O: ProgressObserver + ?Sized>(
        &self,
        run_id: &RunId,
        stage: Stage,
        observer: &O,
        started: Instant,
        success: bool,
    ) {
        self.events.emit(&PipelineEvent::StageFinished {
            run: run_id.clone(),
            stage,
            success,
            duration_ms: started.elapsed().as_millis() as u64,
        });
        observer.on_stage(stage, StageStatus::Finished { success });
    }
}

/// A real failure wins over a cancellation it caused in the sibling
fn merge_conversion_results(
    reference: Result<(), PipelineError>,
    distorted: Result<(), PipelineError>,
) -> Result<(), PipelineError> {
    match (reference, distorted) {
        (Ok(()), Ok(())) => Ok(()),
        (Err(e), _) if !e.is_cancelled() => Err(e),
        (_, Err(e)) if !e.is_cancelled() => Err(e),
        _ => Err(PipelineError::Cancelled),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CapturingSink;
    use crate::workspace::FixedSpaceProbe;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct RecordingObserver {
        states: Mutex<Vec<PipelineState>>,
    }

    impl ProgressObserver for RecordingObserver {
        fn on_state(&self, state: PipelineState) {
            self.states.lock().unwrap().push(state);
        }
    }

    #[test]
    fn test_state_machine_transitions() {
        use PipelineState::*;

        assert!(Idle.can_transition_to(ValidatingInputs));
        assert!(ValidatingInputs.can_transition_to(ConvertingReference));
        assert!(ConvertingReference.can_transition_to(ConvertingDistorted));
        assert!(ConvertingDistorted.can_transition_to(Analyzing));
        assert!(Analyzing.can_transition_to(Completed));
        assert!(Analyzing.can_transition_to(Cancelling));
        assert!(Cancelling.can_transition_to(Cancelled));
        assert!(ValidatingInputs.can_transition_to(Failed));

        assert!(!Idle.can_transition_to(Analyzing));
        assert!(!ValidatingInputs.can_transition_to(Completed));
        assert!(!Cancelling.can_transition_to(Completed));
        assert!(!Completed.can_transition_to(Cancelling));
        assert!(!Failed.can_transition_to(Cancelling));
        assert!(Cancelled.is_terminal());
    }

    #[test]
    fn test_real_failure_wins_over_sibling_cancellation() {
        let failure = || PipelineError::ConversionFailed {
            stage: InputRole::Distorted,
            exit_code: Some(1),
            stderr_excerpt: "bad".into(),
        };
        let merged = merge_conversion_results(Err(PipelineError::Cancelled), Err(failure()));
        assert!(matches!(merged, Err(PipelineError::ConversionFailed { stage: InputRole::Distorted, .. })));

        let merged = merge_conversion_results(Err(PipelineError::Cancelled), Err(PipelineError::Cancelled));
        assert!(matches!(merged, Err(PipelineError::Cancelled)));
        assert!(merge_conversion_results(Ok(()), Ok(())).is_ok());
    }

    #[test]
    fn test_stage_names() {
        assert_eq!(Stage::Conversion(InputRole::Reference).to_string(), "reference_conversion");
        assert_eq!(serde_json::to_value(Stage::Analysis).unwrap(), "analysis");
    }

    #[tokio::test]
    async fn test_missing_tool_fails_before_workspace() {
        let root = TempDir::new().unwrap();
        let sink = Arc::new(CapturingSink::new());
        let config = Config {
            workspace_root: Some(root.path().to_path_buf()),
            ..Default::default()
        };
        let search = ToolSearch {
            tools_dir: None,
            search_path: Some(std::ffi::OsString::new()),
            converter_name: "no-such-converter".into(),
            analyzer_name: "no-such-analyzer".into(),
            converter_fallbacks: vec![],
            analyzer_fallbacks: vec![],
        };
        let orchestrator = PipelineOrchestrator::with_parts(config, search, Arc::new(FixedSpaceProbe(u64::MAX)), sink.clone());
        let observer = RecordingObserver::default();

        let job = AnalysisJob::new("/in/ref.mp4", "/in/dist.mp4", "vmaf_v0.6.1", ReportFormat::Json);
        let err = orchestrator.run(&job, &observer, &CancelSignal::never()).await.unwrap_err();

        assert!(matches!(err, PipelineError::ToolNotFound(_)));
        assert_eq!(
            *observer.states.lock().unwrap(),
            vec![PipelineState::ValidatingInputs, PipelineState::Failed]
        );
        assert_eq!(sink.count(|e| matches!(e, PipelineEvent::WorkspaceCreated { .. })), 0);
        assert_eq!(sink.count(|e| matches!(e, PipelineEvent::SubprocessLaunched { .. })), 0);
    }

    #[tokio::test]
    async fn test_empty_model_is_a_validation_error() {
        let orchestrator = PipelineOrchestrator::new(Config::default(), Arc::new(CapturingSink::new()));
        let job = AnalysisJob::new("/in/ref.mp4", "/in/dist.mp4", " ", ReportFormat::Json);
        let err = orchestrator.run(&job, &NoopObserver, &CancelSignal::never()).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn test_cancel_before_start_is_cancelled() {
        let handle = CancelHandle::new();
        handle.cancel();
        let orchestrator = PipelineOrchestrator::new(Config::default(), Arc::new(CapturingSink::new()));
        let job = AnalysisJob::new("/in/ref.mp4", "/in/dist.mp4", "vmaf_v0.6.1", ReportFormat::Json);
        let observer = RecordingObserver::default();

        let err = orchestrator.run(&job, &observer, &handle.signal()).await.unwrap_err();
        assert!(err.is_cancelled());
        let states = observer.states.lock().unwrap().clone();
        assert_eq!(
            states,
            vec![PipelineState::ValidatingInputs, PipelineState::Cancelling, PipelineState::Cancelled]
        );
    }
}
