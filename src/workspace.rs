//! # Workspace Manager
//!
//! Gestisce la directory di lavoro isolata di ogni run.
//!
//! ## Responsabilità:
//! - `RunId`: identificativo breve (SHA-256) di un run, usato in directory ed eventi
//! - Controllo preventivo dello spazio disco (fallisce subito con `InsufficientSpace`)
//! - Creazione di una directory per run con marker `owner.json`
//! - Distruzione idempotente, anche su directory parzialmente popolate
//! - Pulizia all'avvio delle workspace orfane lasciate da processi terminati
//!
//! ## Ciclo di vita:
//! ```text
//! create() ──► Workspace ──► destroy() ──► (destroy() di nuovo: no-op)
//!                  │
//!                  └── drop senza destroy(): rimozione da parte di `TempDir`
//! ```
//!
//! Il fallimento della rimozione non è mai un errore del run: viene emesso
//! `PipelineEvent::CleanupFailed` e il risultato primario resta invariato.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{InputRole, WorkspaceError};
use crate::events::{EventSink, PipelineEvent};
use crate::platform;
use crate::report::ReportFormat;

/// Directory name prefix of every workspace
pub const WORKSPACE_PREFIX: &str = "vqa-run-";
const OWNER_MARKER: &str = "owner.json";
/// Unmarked directories younger than this may still be in creation
const UNMARKED_GRACE: Duration = Duration::from_secs(60);

static RUN_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Short identifier of one pipeline run
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    /// Derive a fresh id from the inputs, the clock, a counter and the pid
    pub fn new(inputs: &[&Path]) -> Self {
        let mut hasher = Sha256::new();
        for input in inputs {
            hasher.update(input.to_string_lossy().as_bytes());
            hasher.update([0u8]);
        }
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        hasher.update(nanos.to_le_bytes());
        hasher.update(RUN_COUNTER.fetch_add(1, Ordering::Relaxed).to_le_bytes());
        hasher.update(std::process::id().to_le_bytes());

        let digest = hex::encode(hasher.finalize());
        Self(digest[..12].to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Source of free-space figures
pub trait DiskSpaceProbe: Send + Sync {
    fn available(&self, path: &Path) -> io::Result<u64>;
}

/// Free space as reported by the filesystem
#[derive(Debug, Default, Clone, Copy)]
pub struct StatvfsProbe;

impl DiskSpaceProbe for StatvfsProbe {
    fn available(&self, path: &Path) -> io::Result<u64> {
        platform::available_space(path)
    }
}

/// Always reports the same amount; for tests and dry runs
#[derive(Debug, Clone, Copy)]
pub struct FixedSpaceProbe(pub u64);

impl DiskSpaceProbe for FixedSpaceProbe {
    fn available(&self, _path: &Path) -> io::Result<u64> {
        Ok(self.0)
    }
}

/// How much free space a run needs before it may start
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SpacePolicy {
    /// Intermediates are uncompressed, so they dwarf the inputs
    pub multiplier: f64,
    pub min_free_bytes: u64,
}

impl SpacePolicy {
    pub fn required_for(&self, input_bytes: u64) -> u64 {
        let scaled = (input_bytes as f64 * self.multiplier).ceil();
        let scaled = if scaled >= u64::MAX as f64 { u64::MAX } else { scaled as u64 };
        scaled.max(self.min_free_bytes)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct OwnerMarker {
    pid: u32,
    run_id: String,
    created_at: u64,
}

/// Scratch directory exclusively owned by one run
#[derive(Debug)]
pub struct Workspace {
    run_id: RunId,
    /// `None` once `close()` was attempted
    dir: Option<TempDir>,
    path: PathBuf,
    created_at: SystemTime,
    destroyed: bool,
}

impl Workspace {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn created_at(&self) -> SystemTime {
        self.created_at
    }

    /// Converted intermediate for one input
    pub fn intermediate_path(&self, role: InputRole) -> PathBuf {
        self.path.join(format!("{}.y4m", role))
    }

    /// Where the analyzer writes its report
    pub fn report_path(&self, format: ReportFormat) -> PathBuf {
        self.path.join(format!("report.{}", format.extension()))
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

/// Allocates and removes per-run workspaces under one root directory
pub struct WorkspaceManager {
    root: PathBuf,
    policy: SpacePolicy,
    probe: Arc<dyn DiskSpaceProbe>,
    events: Arc<dyn EventSink>,
}

impl WorkspaceManager {
    pub fn new(root: PathBuf, policy: SpacePolicy, events: Arc<dyn EventSink>) -> Self {
        Self::with_probe(root, policy, Arc::new(StatvfsProbe), events)
    }

    pub fn with_probe(
        root: PathBuf,
        policy: SpacePolicy,
        probe: Arc<dyn DiskSpaceProbe>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self { root, policy, probe, events }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Check free space, then create the run's directory.
    ///
    /// Inputs that cannot be stat'ed count as zero bytes; the conversion
    /// stage reports them properly.
    pub async fn create(&self, run_id: &RunId, inputs: &[&Path]) -> Result<Workspace, WorkspaceError> {
        tokio::fs::create_dir_all(&self.root).await?;

        let mut input_bytes = 0u64;
        for input in inputs {
            if let Ok(metadata) = tokio::fs::metadata(input).await {
                input_bytes = input_bytes.saturating_add(metadata.len());
            }
        }

        let required = self.policy.required_for(input_bytes);
        let available = self.probe.available(&self.root)?;
        if available < required {
            return Err(WorkspaceError::InsufficientSpace {
                path: self.root.clone(),
                required,
                available,
            });
        }

        let prefix = format!("{}{}-", WORKSPACE_PREFIX, run_id);
        let dir = tempfile::Builder::new().prefix(&prefix).tempdir_in(&self.root)?;
        let created_at = SystemTime::now();
        let workspace = Workspace {
            run_id: run_id.clone(),
            path: dir.path().to_path_buf(),
            dir: Some(dir),
            created_at,
            destroyed: false,
        };

        let marker = OwnerMarker {
            pid: std::process::id(),
            run_id: run_id.to_string(),
            created_at: created_at
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or_default(),
        };
        let marker = serde_json::to_vec_pretty(&marker).map_err(io::Error::from)?;
        tokio::fs::write(workspace.path.join(OWNER_MARKER), marker).await?;

        self.events.emit(&PipelineEvent::WorkspaceCreated {
            run: run_id.clone(),
            path: workspace.path.clone(),
            required_bytes: required,
            available_bytes: available,
        });
        Ok(workspace)
    }

    /// Recursively remove a workspace. Idempotent.
    ///
    /// Returns false when removal failed; `CleanupFailed` has then been
    /// emitted and a later call retries.
    pub async fn destroy(&self, workspace: &mut Workspace) -> bool {
        if workspace.destroyed {
            return true;
        }

        let measured = workspace.path.clone();
        let bytes_freed = tokio::task::spawn_blocking(move || disk_usage(&measured))
            .await
            .unwrap_or(0);

        let removal = match workspace.dir.take() {
            Some(dir) => tokio::task::spawn_blocking(move || dir.close())
                .await
                .unwrap_or_else(|e| Err(io::Error::new(io::ErrorKind::Other, e))),
            // an earlier close() failed and consumed the handle
            None => tokio::fs::remove_dir_all(&workspace.path).await,
        };

        match removal {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => {
                self.events.emit(&PipelineEvent::CleanupFailed {
                    run: workspace.run_id.clone(),
                    path: workspace.path.clone(),
                    error: e.to_string(),
                });
                return false;
            }
        }

        workspace.destroyed = true;
        self.events.emit(&PipelineEvent::WorkspaceRemoved {
            run: workspace.run_id.clone(),
            path: workspace.path.clone(),
            bytes_freed,
        });
        true
    }

    /// Remove workspaces left behind by processes that no longer exist.
    /// Returns how many were removed.
    pub async fn purge_stale(&self) -> usize {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(e) => {
                debug!("No workspaces to purge in {}: {}", self.root.display(), e);
                return 0;
            }
        };

        let mut purged = 0;
        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let is_workspace = entry.file_name().to_string_lossy().starts_with(WORKSPACE_PREFIX)
                && entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false);
            if !is_workspace || !self.is_stale(&path).await {
                continue;
            }

            match tokio::fs::remove_dir_all(&path).await {
                Ok(()) => {
                    purged += 1;
                    self.events.emit(&PipelineEvent::StaleWorkspacePurged { path });
                }
                Err(e) => debug!("Could not purge {}: {}", path.display(), e),
            }
        }
        purged
    }

    async fn is_stale(&self, path: &Path) -> bool {
        match tokio::fs::read(path.join(OWNER_MARKER)).await {
            Ok(bytes) => match serde_json::from_slice::<OwnerMarker>(&bytes) {
                Ok(owner) => owner.pid != std::process::id() && !platform::is_process_alive(owner.pid),
                Err(_) => true,
            },
            Err(_) => {
                let age = tokio::fs::metadata(path)
                    .await
                    .and_then(|m| m.modified())
                    .ok()
                    .and_then(|modified| modified.elapsed().ok());
                age.is_some_and(|age| age > UNMARKED_GRACE)
            }
        }
    }
}

/// Total size of the regular files under `path`
pub fn disk_usage(path: &Path) -> u64 {
    WalkDir::new(path)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum()
}
