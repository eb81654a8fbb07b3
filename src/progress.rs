//! # Progress Rendering Module
//!
//! Questo modulo gestisce la visualizzazione del progresso nella CLI.
//!
//! ## Responsabilità:
//! - Progress bar visuale con `indicatif` per feedback real-time
//! - Spinner durante le conversioni (progresso solo start/end)
//! - Barra con frame corrente, rate smussato, ETA e VMAF parziale durante l'analisi
//! - Riepilogo finale del report (punteggio, frame, min/max/harmonic mean)
//!
//! ## Componenti principali:
//! - `ProgressManager`: Gestisce la progress bar
//! - `AnalysisSummary`: Riepilogo testuale di un `AnalysisReport`
//! - `CliSubscriber`: Subscriber della pipeline che aggiorna la barra
//!
//! ## Visual feedback:
//! ```text
//! ⠋ [00:02:15] [██████████████████░░░░░░░░░░░░░░░░░░░░░░] 1500/3000 (50%) 48.2 fps · ETA 0:31 · VMAF 94.12
//! ```

use indicatif::{ProgressBar, ProgressStyle};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::PipelineError;
use crate::pipeline::{AnalysisSubscriber, PipelineState, ProgressObserver, Stage, StageStatus};
use crate::report::{AnalysisReport, OVERALL_METRIC};
use crate::stream_parser::ProgressSample;
use crate::utils::format_duration;

const BAR_TEMPLATE: &str =
    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({percent}%) {msg}";
const SPINNER_TEMPLATE: &str = "{spinner:.green} [{elapsed_precise}] {msg}";

/// Manages the progress bar of one analysis
#[derive(Clone)]
pub struct ProgressManager {
    bar: ProgressBar,
}

impl ProgressManager {
    /// Start as a spinner; becomes a bar once the frame total is known
    pub fn new() -> Self {
        Self::with_bar(ProgressBar::new_spinner())
    }

    /// Progress manager that draws nothing (JSON mode, tests)
    pub fn hidden() -> Self {
        Self::with_bar(ProgressBar::hidden())
    }

    fn with_bar(bar: ProgressBar) -> Self {
        if let Ok(style) = ProgressStyle::default_spinner().template(SPINNER_TEMPLATE) {
            bar.set_style(style);
        }
        bar.enable_steady_tick(Duration::from_millis(100));
        Self { bar }
    }

    /// Set a custom message without moving the bar
    pub fn set_message(&self, message: &str) {
        self.bar.set_message(message.to_string());
    }

    /// Update from an analysis sample
    pub fn update(&self, sample: &ProgressSample) {
        if let Some(total) = sample.total_frames {
            if self.bar.length() != Some(total) {
                self.bar.set_length(total);
                if let Ok(style) = ProgressStyle::default_bar().template(BAR_TEMPLATE) {
                    self.bar.set_style(style.progress_chars("█▓░"));
                }
            }
        }
        self.bar.set_position(sample.current_frame);
        self.bar.set_message(Self::describe(sample));
    }

    /// `48.2 fps · ETA 0:31 · VMAF 94.12`
    pub fn describe(sample: &ProgressSample) -> String {
        let mut parts = vec![format!("{:.1} fps", sample.frames_per_second)];
        if let Some(remaining) = sample.remaining {
            parts.push(format!("ETA {}", format_duration(remaining)));
        }
        if let Some(quality) = sample.running_quality {
            parts.push(format!("VMAF {:.2}", quality));
        }
        parts.join(" · ")
    }

    /// Finish with a final message
    pub fn finish(&self, message: &str) {
        self.bar.finish_with_message(message.to_string());
    }

    /// Stop drawing, leaving the last state visible
    pub fn abandon(&self, message: &str) {
        self.bar.abandon_with_message(message.to_string());
    }
}

impl Default for ProgressManager {
    fn default() -> Self {
        Self::new()
    }
}

/// Human-readable summary of a finished analysis
#[derive(Debug, Clone)]
pub struct AnalysisSummary {
    pub overall_score: f64,
    pub frames: usize,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub harmonic_mean: Option<f64>,
    pub duration: Duration,
}

impl AnalysisSummary {
    pub fn new(report: &AnalysisReport, duration: Duration) -> Self {
        let pooled = report.aggregates.get(OVERALL_METRIC);
        Self {
            overall_score: report.overall_score,
            frames: report.frame_count(),
            min: pooled.map(|p| p.min),
            max: pooled.map(|p| p.max),
            harmonic_mean: pooled.map(|p| p.harmonic_mean),
            duration,
        }
    }

    pub fn format_summary(&self) -> String {
        let mut summary = format!("VMAF: {:.2} | Frames: {}", self.overall_score, self.frames);
        if let (Some(min), Some(max)) = (self.min, self.max) {
            summary.push_str(&format!(" | Min: {:.2} | Max: {:.2}", min, max));
        }
        if let Some(harmonic) = self.harmonic_mean {
            summary.push_str(&format!(" | Harmonic mean: {:.2}", harmonic));
        }
        summary.push_str(&format!(" | Time: {}", format_duration(self.duration)));
        summary
    }
}

/// Subscriber that drives the CLI progress bar and keeps the outcome
pub struct CliSubscriber {
    progress: ProgressManager,
    started: Instant,
    outcome: Mutex<Option<Result<AnalysisReport, PipelineError>>>,
}

impl CliSubscriber {
    pub fn new(progress: ProgressManager) -> Self {
        Self {
            progress,
            started: Instant::now(),
            outcome: Mutex::new(None),
        }
    }

    /// Outcome of the run, once `on_complete` or `on_error` fired
    pub fn take_outcome(&self) -> Option<Result<AnalysisReport, PipelineError>> {
        self.outcome.lock().ok().and_then(|mut outcome| outcome.take())
    }

    fn store(&self, result: Result<AnalysisReport, PipelineError>) {
        if let Ok(mut outcome) = self.outcome.lock() {
            *outcome = Some(result);
        }
    }
}

impl ProgressObserver for CliSubscriber {
    fn on_state(&self, state: PipelineState) {
        if !state.is_terminal() {
            self.progress.set_message(&format!("{}...", state));
        }
    }

    fn on_stage(&self, stage: Stage, status: StageStatus) {
        match status {
            StageStatus::Started => self.progress.set_message(&format!("{} started", stage)),
            StageStatus::Finished { success: true } => {
                self.progress.set_message(&format!("✅ {} done", stage));
            }
            StageStatus::Finished { success: false } => {
                self.progress.set_message(&format!("❌ {} failed", stage));
            }
        }
    }

    fn on_progress(&self, sample: &ProgressSample) {
        self.progress.update(sample);
    }
}

impl AnalysisSubscriber for CliSubscriber {
    fn on_complete(&self, report: AnalysisReport) {
        let summary = AnalysisSummary::new(&report, self.started.elapsed());
        self.progress.finish(&format!("✅ {}", summary.format_summary()));
        self.store(Ok(report));
    }

    fn on_error(&self, error: PipelineError) {
        if error.is_cancelled() {
            self.progress.abandon("⚠️  Cancelled");
        } else {
            self.progress.abandon(&format!("❌ {}", error));
        }
        self.store(Err(error));
    }
}
