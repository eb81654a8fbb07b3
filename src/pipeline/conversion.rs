//! # Conversion Stage
//!
//! Converte un input (qualsiasi codec/container) nel formato intermedio
//! richiesto dall'analyzer.
//!
//! ## Responsabilità:
//! - Risolve il converter tramite il Tool Locator
//! - Costruisce l'insieme fisso di argomenti (pixel format, muxer, overwrite)
//! - Esegue il converter tramite il Subprocess Runner
//! - Converte ogni esito non riuscito in `ConversionError` con estratto di stderr
//!
//! ## Pipeline di conversione:
//! ```text
//! ffmpeg -hide_banner -nostdin -loglevel error -y -i <input>
//!        -map 0:v:0 -an -sn -pix_fmt <fmt> -strict -1 -f yuv4mpegpipe <output>
//! ```
//! Risoluzione e frame rate passano invariati; solo il primo stream video
//! viene convertito. Nessun retry automatico.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::args;
use crate::cancel::CancelSignal;
use crate::error::ConversionError;
use crate::runner::{SubprocessRunner, SubprocessSpec};
use crate::tool_resolver::{ToolKind, ToolPathResolver};

/// Planar pixel formats accepted by the analyzer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuv420p,
    Yuv420p10le,
    Yuv422p,
    Yuv422p10le,
    Yuv444p,
    Yuv444p10le,
}

impl PixelFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            PixelFormat::Yuv420p => "yuv420p",
            PixelFormat::Yuv420p10le => "yuv420p10le",
            PixelFormat::Yuv422p => "yuv422p",
            PixelFormat::Yuv422p10le => "yuv422p10le",
            PixelFormat::Yuv444p => "yuv444p",
            PixelFormat::Yuv444p10le => "yuv444p10le",
        }
    }

    /// 8-bit 4:2:0 unless the source carries more than 8 bits per sample
    pub fn for_bit_depth(bit_depth: Option<u8>) -> Self {
        match bit_depth {
            Some(depth) if depth > 8 => PixelFormat::Yuv420p10le,
            _ => PixelFormat::Yuv420p,
        }
    }
}

impl fmt::Display for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PixelFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        [
            PixelFormat::Yuv420p,
            PixelFormat::Yuv420p10le,
            PixelFormat::Yuv422p,
            PixelFormat::Yuv422p10le,
            PixelFormat::Yuv444p,
            PixelFormat::Yuv444p10le,
        ]
        .into_iter()
        .find(|f| f.as_str().eq_ignore_ascii_case(s))
        .ok_or_else(|| format!("unsupported pixel format '{}'", s))
    }
}

/// Intermediate container
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Container {
    /// Self-describing raw stream (YUV4MPEG2)
    #[default]
    Y4m,
}

impl Container {
    /// Converter muxer name
    pub fn muxer(&self) -> &'static str {
        match self {
            Container::Y4m => "yuv4mpegpipe",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            Container::Y4m => "y4m",
        }
    }
}

/// One input to convert into the run's workspace
#[derive(Debug, Clone, PartialEq)]
pub struct ConversionTask {
    pub input_path: PathBuf,
    pub output_path: PathBuf,
    pub target_pixel_format: PixelFormat,
    pub target_container: Container,
}

/// Runs the converter for one task
pub struct ConversionStage {
    resolver: Arc<ToolPathResolver>,
    runner: Arc<SubprocessRunner>,
    timeout: Option<Duration>,
    excerpt_bytes: usize,
}

impl ConversionStage {
    pub fn new(
        resolver: Arc<ToolPathResolver>,
        runner: Arc<SubprocessRunner>,
        timeout: Option<Duration>,
        excerpt_bytes: usize,
    ) -> Self {
        Self { resolver, runner, timeout, excerpt_bytes }
    }

    /// Fixed converter argument set for a task
    pub fn build_args(task: &ConversionTask) -> Vec<String> {
        args![
            "-hide_banner",
            "-nostdin",
            "-loglevel",
            "error",
            "-y",
            "-i",
            path_arg(&task.input_path),
            "-map",
            "0:v:0",
            "-an",
            "-sn",
            "-pix_fmt",
            task.target_pixel_format,
            // 10-bit Y4M is a non-standard extension for the muxer
            "-strict",
            "-1",
            "-f",
            task.target_container.muxer(),
            path_arg(&task.output_path)
        ]
    }

    pub async fn convert(&self, task: &ConversionTask, cancel: &CancelSignal) -> Result<(), ConversionError> {
        let converter = self.resolver.resolve(ToolKind::Converter)?;
        if cancel.is_cancelled() {
            return Err(ConversionError::Cancelled);
        }

        // nothing to launch for a missing input; report it as the converter would
        if tokio::fs::metadata(&task.input_path).await.is_err() {
            return Err(ConversionError::Failed {
                exit_code: None,
                stderr_excerpt: format!("{}: No such file or directory", task.input_path.display()),
            });
        }

        let spec = SubprocessSpec::new(&converter.path)
            .args(Self::build_args(task))
            .timeout(self.timeout);
        let outcome = self.runner.run(&spec, cancel, None).await?;

        if outcome.was_cancelled() {
            return Err(ConversionError::Cancelled);
        }
        if !outcome.succeeded() {
            return Err(ConversionError::Failed {
                exit_code: outcome.exit_code(),
                stderr_excerpt: outcome.stderr_excerpt(self.excerpt_bytes),
            });
        }

        match tokio::fs::metadata(&task.output_path).await {
            Ok(metadata) if metadata.len() > 0 => {
                debug!(
                    "Converted {} -> {} ({} bytes)",
                    task.input_path.display(),
                    task.output_path.display(),
                    metadata.len()
                );
                Ok(())
            }
            _ => Err(ConversionError::Failed {
                exit_code: outcome.exit_code(),
                stderr_excerpt: format!(
                    "converter exited successfully but produced no output at {}",
                    task.output_path.display()
                ),
            }),
        }
    }
}

/// Path as a command-line argument; relative paths that look like options get `./`
pub(crate) fn path_arg(path: &Path) -> String {
    let text = path.to_string_lossy();
    if text.starts_with('-') {
        format!(".{}{}", std::path::MAIN_SEPARATOR, text)
    } else {
        text.into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CapturingSink, PipelineEvent};
    use crate::tool_resolver::ToolSearch;
    use tempfile::TempDir;

    fn task(input: &Path, output: &Path) -> ConversionTask {
        ConversionTask {
            input_path: input.to_path_buf(),
            output_path: output.to_path_buf(),
            target_pixel_format: PixelFormat::Yuv420p10le,
            target_container: Container::Y4m,
        }
    }

    #[test]
    fn test_build_args() {
        let args = ConversionStage::build_args(&task(Path::new("/in/a.mp4"), Path::new("/ws/reference.y4m")));
        let joined = args.join(" ");
        assert!(joined.contains("-i /in/a.mp4"));
        assert!(joined.contains("-pix_fmt yuv420p10le"));
        assert!(joined.contains("-f yuv4mpegpipe"));
        assert!(args.contains(&"-y".to_string()));
        assert_eq!(args.last().unwrap(), "/ws/reference.y4m");
        // no scaling or frame rate change
        assert!(!args.contains(&"-s".to_string()));
        assert!(!args.contains(&"-r".to_string()));
    }

    #[test]
    fn test_pixel_format_selection() {
        assert_eq!(PixelFormat::for_bit_depth(None), PixelFormat::Yuv420p);
        assert_eq!(PixelFormat::for_bit_depth(Some(8)), PixelFormat::Yuv420p);
        assert_eq!(PixelFormat::for_bit_depth(Some(10)), PixelFormat::Yuv420p10le);
        assert_eq!("YUV444P".parse::<PixelFormat>().unwrap(), PixelFormat::Yuv444p);
        assert!("rgb24".parse::<PixelFormat>().is_err());
    }

    #[test]
    fn test_option_like_paths_are_protected() {
        assert_eq!(path_arg(Path::new("-weird.mp4")), format!(".{}-weird.mp4", std::path::MAIN_SEPARATOR));
        assert_eq!(path_arg(Path::new("/abs/-x.mp4")), "/abs/-x.mp4");
    }

    #[cfg(unix)]
    fn stage_with_converter(dir: &TempDir, script: &str, sink: Arc<CapturingSink>) -> ConversionStage {
        use std::os::unix::fs::PermissionsExt;

        let converter = dir.path().join("fake-ffmpeg");
        std::fs::write(&converter, script).unwrap();
        std::fs::set_permissions(&converter, std::fs::Permissions::from_mode(0o755)).unwrap();

        let search = ToolSearch {
            tools_dir: None,
            search_path: Some(std::ffi::OsString::new()),
            converter_name: "fake-ffmpeg".into(),
            analyzer_name: "fake-vmaf".into(),
            converter_fallbacks: vec![converter],
            analyzer_fallbacks: vec![],
        };
        let resolver = Arc::new(ToolPathResolver::new(search, sink.clone()));
        let runner = Arc::new(SubprocessRunner::new(Duration::from_millis(200), sink));
        ConversionStage::new(resolver, runner, None, 256)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_missing_input_fails_without_launching() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(CapturingSink::new());
        let stage = stage_with_converter(&dir, "#!/bin/sh\nexit 0\n", sink.clone());

        let err = stage
            .convert(&task(&dir.path().join("missing.mp4"), &dir.path().join("out.y4m")), &CancelSignal::never())
            .await
            .unwrap_err();
        match err {
            ConversionError::Failed { exit_code, stderr_excerpt } => {
                assert_eq!(exit_code, None);
                assert!(stderr_excerpt.contains("No such file"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(sink.count(|e| matches!(e, PipelineEvent::SubprocessLaunched { .. })), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_converter_failure_carries_stderr() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"data").unwrap();
        let stage = stage_with_converter(
            &dir,
            "#!/bin/sh\necho 'Invalid data found when processing input' >&2\nexit 183\n",
            Arc::new(CapturingSink::new()),
        );

        let err = stage
            .convert(&task(&input, &dir.path().join("out.y4m")), &CancelSignal::never())
            .await
            .unwrap_err();
        match err {
            ConversionError::Failed { exit_code, stderr_excerpt } => {
                assert_eq!(exit_code, Some(183));
                assert_eq!(stderr_excerpt, "Invalid data found when processing input");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_successful_conversion_and_empty_output() {
        let dir = TempDir::new().unwrap();
        let input = dir.path().join("in.mp4");
        std::fs::write(&input, b"data").unwrap();

        // last argument is the output path
        let writer = "#!/bin/sh\nfor a in \"$@\"; do out=\"$a\"; done\nprintf 'YUV4MPEG2 W4 H2\\n' > \"$out\"\n";
        let stage = stage_with_converter(&dir, writer, Arc::new(CapturingSink::new()));
        let output = dir.path().join("out.y4m");
        stage.convert(&task(&input, &output), &CancelSignal::never()).await.unwrap();
        assert!(output.exists());

        let silent = TempDir::new().unwrap();
        let stage = stage_with_converter(&silent, "#!/bin/sh\nexit 0\n", Arc::new(CapturingSink::new()));
        let err = stage
            .convert(&task(&input, &silent.path().join("none.y4m")), &CancelSignal::never())
            .await
            .unwrap_err();
        assert!(matches!(err, ConversionError::Failed { exit_code: Some(0), .. }));
    }
}
