//! # Analysis Stage
//!
//! Esegue l'analyzer sulla coppia di intermedi e produce l'`AnalysisReport`.
//!
//! ## Responsabilità:
//! - Costruisce gli argomenti da `AnalysisRequest` (reference, distorted, modello, output, formato)
//! - Scopre il numero totale di frame dagli header Y4M prima del lancio
//! - Collega il Progress Stream Parser al Subprocess Runner e inoltra ogni `ProgressSample`
//! - Dopo un'uscita con successo legge e valida il report finale
//! - In caso di cancellazione non restituisce mai un report parziale
//!
//! ## Invocazione:
//! ```text
//! vmaf --reference ref.y4m --distorted dist.y4m --model version=vmaf_v0.6.1
//!      --output report.json --json [--threads N]
//! ```

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::args;
use crate::cancel::CancelSignal;
use crate::error::AnalysisError;
use crate::events::EventSink;
use crate::pipeline::conversion::path_arg;
use crate::report::{read_report, AnalysisReport, ReportFormat};
use crate::runner::{SubprocessRunner, SubprocessSpec};
use crate::stream_parser::{ProgressConsumer, ProgressSample, ProgressStreamParser};
use crate::tool_resolver::{ToolKind, ToolPathResolver};
use crate::y4m;

/// Everything the analyzer needs for one run
#[derive(Debug, Clone, PartialEq)]
pub struct AnalysisRequest {
    pub reference: PathBuf,
    pub distorted: PathBuf,
    /// Model version identifier, model file path, or a raw `key=value` selector
    pub model: String,
    pub output_format: ReportFormat,
    pub output_path: PathBuf,
}

/// Analyzer settings that do not change between runs
#[derive(Debug, Clone, Copy)]
pub struct AnalysisSettings {
    pub timeout: Option<Duration>,
    pub excerpt_bytes: usize,
    pub rate_smoothing: f64,
    pub threads: Option<usize>,
}

/// Runs the analyzer for one request
pub struct AnalysisStage {
    resolver: Arc<ToolPathResolver>,
    runner: Arc<SubprocessRunner>,
    events: Arc<dyn EventSink>,
    settings: AnalysisSettings,
}

impl AnalysisStage {
    pub fn new(
        resolver: Arc<ToolPathResolver>,
        runner: Arc<SubprocessRunner>,
        events: Arc<dyn EventSink>,
        settings: AnalysisSettings,
    ) -> Self {
        Self { resolver, runner, events, settings }
    }

    /// Model selector as the analyzer expects it
    pub fn model_argument(model: &str) -> String {
        let model = model.trim();
        if model.contains('=') {
            model.to_string()
        } else if model.ends_with(".json") || model.ends_with(".pkl") {
            format!("path={}", model)
        } else {
            format!("version={}", model)
        }
    }

    pub fn build_args(&self, request: &AnalysisRequest) -> Vec<String> {
        let mut args = args![
            "--reference",
            path_arg(&request.reference),
            "--distorted",
            path_arg(&request.distorted),
            "--model",
            Self::model_argument(&request.model),
            "--output",
            path_arg(&request.output_path),
            request.output_format.flag()
        ];
        if let Some(threads) = self.settings.threads {
            args.extend(args!["--threads", threads]);
        }
        args
    }

    pub async fn analyze(
        &self,
        request: &AnalysisRequest,
        on_progress: &mut (dyn FnMut(&ProgressSample) + Send),
        cancel: &CancelSignal,
    ) -> Result<AnalysisReport, AnalysisError> {
        let analyzer = self.resolver.resolve(ToolKind::Analyzer)?;
        if cancel.is_cancelled() {
            return Err(AnalysisError::Cancelled);
        }

        let total_frames = self.discover_total_frames(request).await;
        debug!("Total frames before analysis: {:?}", total_frames);

        // a report left by an earlier attempt must not be mistaken for this one
        if let Err(e) = tokio::fs::remove_file(&request.output_path).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                debug!("Could not remove old report {}: {}", request.output_path.display(), e);
            }
        }

        let mut parser = ProgressStreamParser::new(self.settings.rate_smoothing);
        parser.set_total_frames(total_frames);
        let mut consumer = ProgressConsumer::new(parser, &mut *on_progress, Arc::clone(&self.events));

        let spec = SubprocessSpec::new(&analyzer.path)
            .args(self.build_args(request))
            .timeout(self.settings.timeout);
        let outcome = self.runner.run(&spec, cancel, Some(&mut consumer)).await?;

        if outcome.was_cancelled() {
            return Err(AnalysisError::Cancelled);
        }
        if !outcome.succeeded() {
            return Err(AnalysisError::Failed {
                exit_code: outcome.exit_code(),
                stderr_excerpt: outcome.stderr_excerpt(self.settings.excerpt_bytes),
            });
        }

        read_report(&request.output_path, request.output_format).await
    }

    /// Smaller frame count of the two intermediates, when both can be read
    async fn discover_total_frames(&self, request: &AnalysisRequest) -> Option<u64> {
        let mut total: Option<u64> = None;
        for path in [&request.reference, &request.distorted] {
            match y4m::probe_frame_count(path).await {
                Ok(Some(count)) => total = Some(total.map_or(count, |t| t.min(count))),
                Ok(None) => return None,
                Err(e) => {
                    debug!("Cannot probe {}: {}", path.display(), e);
                    return None;
                }
            }
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CapturingSink;
    use crate::tool_resolver::ToolSearch;
    use tempfile::TempDir;

    fn settings() -> AnalysisSettings {
        AnalysisSettings {
            timeout: None,
            excerpt_bytes: 512,
            rate_smoothing: 0.5,
            threads: Some(4),
        }
    }

    fn stage(analyzer_fallbacks: Vec<PathBuf>, sink: Arc<CapturingSink>) -> AnalysisStage {
        let search = ToolSearch {
            tools_dir: None,
            search_path: Some(std::ffi::OsString::new()),
            converter_name: "fake-ffmpeg".into(),
            analyzer_name: "fake-vmaf".into(),
            converter_fallbacks: vec![],
            analyzer_fallbacks,
        };
        let resolver = Arc::new(ToolPathResolver::new(search, sink.clone()));
        let runner = Arc::new(SubprocessRunner::new(Duration::from_millis(200), sink.clone()));
        AnalysisStage::new(resolver, runner, sink, settings())
    }

    fn request(dir: &TempDir) -> AnalysisRequest {
        AnalysisRequest {
            reference: dir.path().join("reference.y4m"),
            distorted: dir.path().join("distorted.y4m"),
            model: "vmaf_4k_v0.6.1".into(),
            output_format: ReportFormat::Json,
            output_path: dir.path().join("report.json"),
        }
    }

    #[test]
    fn test_model_argument() {
        assert_eq!(AnalysisStage::model_argument("vmaf_v0.6.1"), "version=vmaf_v0.6.1");
        assert_eq!(AnalysisStage::model_argument("/models/custom.json"), "path=/models/custom.json");
        assert_eq!(
            AnalysisStage::model_argument("version=vmaf_v0.6.1neg:name=neg"),
            "version=vmaf_v0.6.1neg:name=neg"
        );
    }

    #[test]
    fn test_build_args() {
        let dir = TempDir::new().unwrap();
        let stage = stage(vec![], Arc::new(CapturingSink::new()));
        let args = stage.build_args(&request(&dir));
        let joined = args.join(" ");
        assert!(joined.contains("--model version=vmaf_4k_v0.6.1"));
        assert!(joined.contains("--output"));
        assert!(joined.contains("--json"));
        assert!(joined.ends_with("--threads 4"));
    }

    #[tokio::test]
    async fn test_missing_analyzer_is_tool_not_found() {
        let dir = TempDir::new().unwrap();
        let stage = stage(vec![], Arc::new(CapturingSink::new()));
        let mut on_progress = |_: &ProgressSample| {};
        let err = stage
            .analyze(&request(&dir), &mut on_progress, &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, AnalysisError::ToolNotFound(_)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_analysis_streams_progress_then_reads_report() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let analyzer = dir.path().join("fake-vmaf");
        let script = r#"#!/bin/sh
while [ $# -gt 0 ]; do
  if [ "$1" = "--output" ]; then out="$2"; fi
  shift
done
echo "frame=1 fps=10"
echo "frame=2 fps=10 vmaf=95.5"
cat > "$out" <<'EOF'
{"frames": [{"frameNum": 0, "metrics": {"vmaf": 95.0}}, {"frameNum": 1, "metrics": {"vmaf": 96.0}}],
 "pooled_metrics": {"vmaf": {"min": 95.0, "max": 96.0, "mean": 95.5, "harmonic_mean": 95.49}}}
EOF
"#;
        std::fs::write(&analyzer, script).unwrap();
        std::fs::set_permissions(&analyzer, std::fs::Permissions::from_mode(0o755)).unwrap();

        let stage = stage(vec![analyzer], Arc::new(CapturingSink::new()));
        let mut frames = Vec::new();
        let mut on_progress = |s: &ProgressSample| frames.push(s.current_frame);
        let report = stage
            .analyze(&request(&dir), &mut on_progress, &CancelSignal::never())
            .await
            .unwrap();

        assert_eq!(frames, vec![1, 2]);
        assert_eq!(report.overall_score, 95.5);
        assert_eq!(report.frame_count(), 2);
    }
}
