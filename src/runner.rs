//! # Subprocess Runner
//!
//! Questo modulo lancia un singolo processo esterno e ne supervisiona la vita.
//!
//! ## Responsabilità:
//! - Spawn asincrono con `tokio::process::Command`
//! - Cattura completa e indipendente di stdout e stderr
//! - Drenaggio concorrente dei due stream (nessun deadlock su output a raffica)
//! - Consumer incrementale opzionale che riceve i chunk appena arrivano
//! - Cancellazione: SIGTERM, periodo di grazia limitato, poi kill forzato
//! - Timeout opzionale per processo, gestito come la cancellazione
//!
//! ## Rilascio risorse:
//! Il child è creato con `kill_on_drop(true)`: se il future viene abbandonato
//! il processo viene terminato e le pipe chiuse. Un errore di spawn non lascia
//! nulla da rilasciare.
//!
//! ## Esempio:
//! ```rust,ignore
//! let spec = SubprocessSpec::new("ffmpeg").args(["-version"]);
//! let outcome = runner.run(&spec, &cancel, None).await?;
//! assert!(outcome.succeeded());
//! ```

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::error::RunnerError;
use crate::events::{EventSink, PipelineEvent, TerminationReason};

const READ_BUFFER_SIZE: usize = 8 * 1024;
const CHUNK_CHANNEL_CAPACITY: usize = 64;

/// Which output stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receives output chunks while the process is still running
pub trait OutputConsumer: Send {
    fn on_chunk(&mut self, stream: StreamKind, chunk: &[u8]);

    /// Called once after the last chunk of a process that exited on its own
    fn on_finish(&mut self) {}
}

/// What to launch
#[derive(Debug, Clone)]
pub struct SubprocessSpec {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl SubprocessSpec {
    pub fn new(program: impl AsRef<Path>) -> Self {
        Self {
            program: program.as_ref().to_path_buf(),
            args: Vec::new(),
            working_dir: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn working_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.working_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Short program name for logs and events
    pub fn display_name(&self) -> String {
        self.program
            .file_name()
            .map(|name| name.to_string_lossy().to_string())
            .unwrap_or_else(|| self.program.display().to_string())
    }
}

/// How a subprocess ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitState {
    /// Exited on its own with this code
    Exited(i32),
    /// Killed by a signal it did not receive from us
    Signaled,
    /// Stopped because the cancel signal was raised
    Cancelled,
    /// Stopped because it exceeded its timeout
    TimedOut,
}

/// Result of one subprocess invocation
#[derive(Debug, Clone)]
pub struct SubprocessOutcome {
    pub exit: ExitState,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub duration: Duration,
}

impl SubprocessOutcome {
    pub fn succeeded(&self) -> bool {
        self.exit == ExitState::Exited(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.exit {
            ExitState::Exited(code) => Some(code),
            _ => None,
        }
    }

    pub fn was_cancelled(&self) -> bool {
        self.exit == ExitState::Cancelled
    }

    /// Tail of stderr, at most `max_bytes`, lossily decoded and trimmed
    pub fn stderr_excerpt(&self, max_bytes: usize) -> String {
        let mut excerpt = crate::utils::lossy_tail(&self.stderr, max_bytes);
        if self.exit == ExitState::TimedOut {
            let note = format!("timed out after {:.1}s", self.duration.as_secs_f64());
            excerpt = if excerpt.is_empty() { note } else { format!("{}\n{}", excerpt, note) };
        }
        excerpt
    }
}

/// Launches and supervises external processes
pub struct SubprocessRunner {
    grace_period: Duration,
    events: Arc<dyn EventSink>,
}

impl SubprocessRunner {
    pub fn new(grace_period: Duration, events: Arc<dyn EventSink>) -> Self {
        Self { grace_period, events }
    }

    /// Run a process to completion, cancellation or timeout.
    ///
    /// `Err` is returned only when the process could not be launched or
    /// waited on; every other ending is described by the outcome.
    pub async fn run(
        &self,
        spec: &SubprocessSpec,
        cancel: &CancelSignal,
        mut consumer: Option<&mut dyn OutputConsumer>,
    ) -> Result<SubprocessOutcome, RunnerError> {
        let program = spec.display_name();
        let start = Instant::now();

        if cancel.is_cancelled() {
            debug!("Not launching {}: already cancelled", program);
            return Ok(SubprocessOutcome {
                exit: ExitState::Cancelled,
                stdout: Vec::new(),
                stderr: Vec::new(),
                duration: Duration::ZERO,
            });
        }

        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        debug!("Running {}: {:?}", program, spec.args);
        let mut child = command.spawn().map_err(|source| RunnerError::Launch {
            program: program.clone(),
            source,
        })?;
        self.events.emit(&PipelineEvent::SubprocessLaunched {
            program: program.clone(),
            pid: child.id(),
        });

        let (tx, mut rx) = mpsc::channel::<(StreamKind, Vec<u8>)>(CHUNK_CHANNEL_CAPACITY);
        let mut readers: Vec<JoinHandle<()>> = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            readers.push(tokio::spawn(drain(stdout, StreamKind::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            readers.push(tokio::spawn(drain(stderr, StreamKind::Stderr, tx.clone())));
        }
        drop(tx);

        let deadline = spec.timeout.map(|t| tokio::time::Instant::now() + t);
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut status = None;
        let mut streams_open = true;
        let mut interrupted = None;
        // bounds the wait for EOF once the child is gone
        let mut drain_deadline = None;
        let mut output_detached = false;

        while status.is_none() || streams_open {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    interrupted = Some(TerminationReason::Cancelled);
                    break;
                }
                _ = deadline_elapsed(deadline) => {
                    interrupted = Some(TerminationReason::TimedOut);
                    break;
                }
                chunk = rx.recv(), if streams_open => match chunk {
                    Some((stream, bytes)) => {
                        if let Some(consumer) = consumer.as_mut() {
                            consumer.on_chunk(stream, &bytes);
                        }
                        match stream {
                            StreamKind::Stdout => stdout.extend_from_slice(&bytes),
                            StreamKind::Stderr => stderr.extend_from_slice(&bytes),
                        }
                    }
                    None => streams_open = false,
                },
                waited = child.wait(), if status.is_none() => {
                    let exit = waited.map_err(|source| RunnerError::Wait {
                        program: program.clone(),
                        source,
                    })?;
                    status = Some(exit);
                    drain_deadline = Some(tokio::time::Instant::now() + self.grace_period);
                }
                _ = deadline_elapsed(drain_deadline), if streams_open && drain_deadline.is_some() => {
                    debug!("{} exited but its output is still held open by another process", program);
                    streams_open = false;
                    output_detached = true;
                }
            }
        }

        if let Some(reason) = interrupted {
            let forced = match status {
                Some(_) => false,
                None => self.terminate(&mut child, &program).await,
            };
            self.events.emit(&PipelineEvent::SubprocessTerminated {
                program: program.clone(),
                reason,
                forced,
            });

            // Collect what is still buffered so diagnostics are not lost
            while let Ok(Some((stream, bytes))) = tokio::time::timeout(self.grace_period, rx.recv()).await {
                match stream {
                    StreamKind::Stdout => stdout.extend_from_slice(&bytes),
                    StreamKind::Stderr => stderr.extend_from_slice(&bytes),
                }
            }
            for reader in readers {
                reader.abort();
            }

            return Ok(SubprocessOutcome {
                exit: match reason {
                    TerminationReason::Cancelled => ExitState::Cancelled,
                    TerminationReason::TimedOut => ExitState::TimedOut,
                },
                stdout,
                stderr,
                duration: start.elapsed(),
            });
        }

        for reader in readers {
            if output_detached {
                reader.abort();
            } else if let Err(e) = reader.await {
                debug!("Output reader for {} ended abnormally: {}", program, e);
            }
        }
        if let Some(consumer) = consumer.as_mut() {
            consumer.on_finish();
        }

        let exit = match status.and_then(|s| s.code()) {
            Some(code) => ExitState::Exited(code),
            None => ExitState::Signaled,
        };
        debug!("{} finished with {:?} in {:?}", program, exit, start.elapsed());

        Ok(SubprocessOutcome {
            exit,
            stdout,
            stderr,
            duration: start.elapsed(),
        })
    }

    /// Graceful termination request, bounded wait, then forced kill.
    /// Returns true when the kill was needed.
    async fn terminate(&self, child: &mut Child, program: &str) -> bool {
        if let Ok(Some(_)) = child.try_wait() {
            return false;
        }

        let requested = child.id().map(crate::platform::request_termination).unwrap_or(false);
        if requested {
            if let Ok(Ok(_)) = tokio::time::timeout(self.grace_period, child.wait()).await {
                debug!("{} exited after termination request", program);
                return false;
            }
        }

        if let Err(e) = child.kill().await {
            warn!("Failed to kill {}: {}", program, e);
        }
        true
    }
}

/// Read a stream to EOF, forwarding every chunk
async fn drain<R>(mut reader: R, stream: StreamKind, tx: mpsc::Sender<(StreamKind, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => return,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    return;
                }
            }
            Err(e) => {
                debug!("Error reading {:?}: {}", stream, e);
                return;
            }
        }
    }
}

async fn deadline_elapsed(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::cancel::CancelHandle;
    use crate::events::CapturingSink;

    fn runner(sink: Arc<CapturingSink>) -> SubprocessRunner {
        SubprocessRunner::new(Duration::from_millis(300), sink)
    }

    fn sh(script: &str) -> SubprocessSpec {
        SubprocessSpec::new("/bin/sh").args(["-c", script])
    }

    #[derive(Default)]
    struct Recorder {
        chunks: Vec<(StreamKind, Vec<u8>)>,
        finished: bool,
    }

    impl OutputConsumer for Recorder {
        fn on_chunk(&mut self, stream: StreamKind, chunk: &[u8]) {
            self.chunks.push((stream, chunk.to_vec()));
        }

        fn on_finish(&mut self) {
            self.finished = true;
        }
    }

    #[tokio::test]
    async fn test_captures_both_streams_and_exit_code() {
        let sink = Arc::new(CapturingSink::new());
        let outcome = runner(sink.clone())
            .run(&sh("echo out; echo err >&2; exit 3"), &CancelSignal::never(), None)
            .await
            .unwrap();

        assert_eq!(outcome.exit, ExitState::Exited(3));
        assert_eq!(outcome.exit_code(), Some(3));
        assert!(!outcome.succeeded());
        assert_eq!(String::from_utf8_lossy(&outcome.stdout), "out\n");
        assert_eq!(outcome.stderr_excerpt(100), "err");
        assert_eq!(sink.count(|e| matches!(e, PipelineEvent::SubprocessLaunched { .. })), 1);
    }

    #[tokio::test]
    async fn test_large_bursty_stderr_does_not_deadlock() {
        // ~1 MiB on stderr while stdout stays idle
        let script = "head -c 1048576 /dev/zero | tr '\\0' 'x' >&2; echo done";
        let outcome = tokio::time::timeout(
            Duration::from_secs(20),
            runner(Arc::new(CapturingSink::new())).run(&sh(script), &CancelSignal::never(), None),
        )
        .await
        .expect("runner deadlocked")
        .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(outcome.stderr.len(), 1_048_576);
        assert_eq!(String::from_utf8_lossy(&outcome.stdout), "done\n");
    }

    #[tokio::test]
    async fn test_consumer_sees_chunks_and_full_capture_is_kept() {
        let mut recorder = Recorder::default();
        let outcome = runner(Arc::new(CapturingSink::new()))
            .run(
                &sh("printf 'a\\n'; sleep 0.1; printf 'b\\n'"),
                &CancelSignal::never(),
                Some(&mut recorder),
            )
            .await
            .unwrap();

        assert!(outcome.succeeded());
        assert_eq!(String::from_utf8_lossy(&outcome.stdout), "a\nb\n");
        let seen: Vec<u8> = recorder
            .chunks
            .iter()
            .filter(|(stream, _)| *stream == StreamKind::Stdout)
            .flat_map(|(_, bytes)| bytes.clone())
            .collect();
        assert_eq!(seen, b"a\nb\n");
        assert!(recorder.finished);
    }

    #[tokio::test]
    async fn test_cancellation_terminates_process() {
        let sink = Arc::new(CapturingSink::new());
        let handle = CancelHandle::new();
        let signal = handle.signal();

        let canceller = tokio::spawn({
            let handle = handle.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(100)).await;
                handle.cancel();
            }
        });

        let started = Instant::now();
        let outcome = runner(sink.clone()).run(&sh("sleep 30"), &signal, None).await.unwrap();
        canceller.await.unwrap();

        assert_eq!(outcome.exit, ExitState::Cancelled);
        assert!(outcome.was_cancelled());
        assert_eq!(outcome.exit_code(), None);
        assert!(started.elapsed() < Duration::from_secs(10));
        assert_eq!(
            sink.count(|e| matches!(
                e,
                PipelineEvent::SubprocessTerminated { reason: TerminationReason::Cancelled, .. }
            )),
            1
        );
    }

    #[tokio::test]
    async fn test_process_ignoring_sigterm_is_killed() {
        let sink = Arc::new(CapturingSink::new());
        let handle = CancelHandle::new();
        let signal = handle.signal();

        tokio::spawn({
            let handle = handle.clone();
            async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                handle.cancel();
            }
        });

        let outcome = runner(sink.clone())
            .run(&sh("trap '' TERM; sleep 30"), &signal, None)
            .await
            .unwrap();

        assert_eq!(outcome.exit, ExitState::Cancelled);
        assert_eq!(
            sink.count(|e| matches!(e, PipelineEvent::SubprocessTerminated { forced: true, .. })),
            1
        );
    }

    #[tokio::test]
    async fn test_already_cancelled_never_launches() {
        let sink = Arc::new(CapturingSink::new());
        let handle = CancelHandle::new();
        handle.cancel();

        let outcome = runner(sink.clone()).run(&sh("echo hi"), &handle.signal(), None).await.unwrap();
        assert!(outcome.was_cancelled());
        assert_eq!(sink.count(|e| matches!(e, PipelineEvent::SubprocessLaunched { .. })), 0);
    }

    #[tokio::test]
    async fn test_timeout_is_reported_in_excerpt() {
        let spec = sh("echo working >&2; sleep 30").timeout(Some(Duration::from_millis(200)));
        let outcome = runner(Arc::new(CapturingSink::new()))
            .run(&spec, &CancelSignal::never(), None)
            .await
            .unwrap();

        assert_eq!(outcome.exit, ExitState::TimedOut);
        assert!(!outcome.succeeded());
        assert!(outcome.stderr_excerpt(1024).contains("timed out"));
    }

    #[tokio::test]
    async fn test_launch_failure_is_an_error() {
        let err = runner(Arc::new(CapturingSink::new()))
            .run(
                &SubprocessSpec::new("/definitely/not/a/program"),
                &CancelSignal::never(),
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RunnerError::Launch { .. }));
    }

    #[tokio::test]
    async fn test_working_dir_and_env_are_applied() {
        let dir = tempfile::TempDir::new().unwrap();
        let spec = sh("pwd; echo $VQA_TEST_VALUE").working_dir(dir.path()).env("VQA_TEST_VALUE", "42");
        let outcome = runner(Arc::new(CapturingSink::new()))
            .run(&spec, &CancelSignal::never(), None)
            .await
            .unwrap();

        let stdout = String::from_utf8_lossy(&outcome.stdout);
        let canonical = dir.path().canonicalize().unwrap();
        assert!(stdout.contains(&*canonical.to_string_lossy()) || stdout.contains(&*dir.path().to_string_lossy()));
        assert!(stdout.ends_with("42\n"));
    }

    #[tokio::test]
    async fn test_inherited_output_does_not_block_after_exit() {
        let start = Instant::now();
        let outcome = runner(Arc::new(CapturingSink::new()))
            .run(&sh("sleep 30 & echo done"), &CancelSignal::never(), None)
            .await
            .unwrap();

        assert!(start.elapsed() < Duration::from_secs(10));
        assert_eq!(outcome.exit, ExitState::Exited(0));
        assert!(String::from_utf8_lossy(&outcome.stdout).contains("done"));
    }
}
