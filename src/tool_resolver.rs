//! # Tool Path Resolver
//!
//! This module handles finding the external tools the pipeline drives:
//! - Bundled next to the application (tools dir, per-platform subfolders)
//! - System-installed tools on `PATH`
//! - Known fallback absolute locations (Homebrew, /usr/local, ...)
//!
//! Each location is a lookup strategy; the resolver evaluates them in order
//! and takes the first match. Successful resolutions are cached for the
//! lifetime of the resolver and are read-only afterwards.

use std::collections::HashMap;
use std::env;
use std::ffi::OsString;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::cancel::CancelSignal;
use crate::config::Config;
use crate::error::{RunnerError, ToolNotFoundError};
use crate::events::{EventSink, PipelineEvent};
use crate::platform;
use crate::runner::{SubprocessRunner, SubprocessSpec};

/// Environment variable overriding the bundled tools directory
pub const TOOLS_DIR_ENV: &str = "VQA_TOOLS_DIR";

/// The two external tools the pipeline needs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    Converter,
    Analyzer,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Converter => write!(f, "converter"),
            ToolKind::Analyzer => write!(f, "analyzer"),
        }
    }
}

/// Where a tool binary was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolOrigin {
    Bundled,
    SystemPath,
    Fallback,
}

/// A resolved tool executable
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolBinary {
    pub kind: ToolKind,
    pub path: PathBuf,
    pub origin: ToolOrigin,
}

/// Search settings for the resolver
#[derive(Debug, Clone)]
pub struct ToolSearch {
    /// Bundled tools directory (None = autodetect)
    pub tools_dir: Option<PathBuf>,
    /// PATH value to search (None = process PATH)
    pub search_path: Option<OsString>,
    pub converter_name: String,
    pub analyzer_name: String,
    pub converter_fallbacks: Vec<PathBuf>,
    pub analyzer_fallbacks: Vec<PathBuf>,
}

impl ToolSearch {
    pub fn from_config(config: &Config) -> Self {
        Self {
            tools_dir: config.tools_dir.clone(),
            search_path: None,
            converter_name: config.converter_name.clone(),
            analyzer_name: config.analyzer_name.clone(),
            converter_fallbacks: config.converter_fallbacks.clone(),
            analyzer_fallbacks: config.analyzer_fallbacks.clone(),
        }
    }

    fn name_for(&self, kind: ToolKind) -> &str {
        match kind {
            ToolKind::Converter => &self.converter_name,
            ToolKind::Analyzer => &self.analyzer_name,
        }
    }

    fn fallbacks_for(&self, kind: ToolKind) -> &[PathBuf] {
        match kind {
            ToolKind::Converter => &self.converter_fallbacks,
            ToolKind::Analyzer => &self.analyzer_fallbacks,
        }
    }
}

type Lookup = Box<dyn Fn(ToolKind) -> Option<PathBuf> + Send + Sync>;

/// One location strategy, evaluated in order
struct Strategy {
    origin: ToolOrigin,
    lookup: Lookup,
}

/// Tool path resolver with ordered, first-match strategies
pub struct ToolPathResolver {
    strategies: Vec<Strategy>,
    search: Arc<ToolSearch>,
    tools_dir: Option<PathBuf>,
    cache: RwLock<HashMap<ToolKind, ToolBinary>>,
    events: Arc<dyn EventSink>,
}

impl ToolPathResolver {
    /// Create a resolver with the standard bundled → PATH → fallback order
    pub fn new(search: ToolSearch, events: Arc<dyn EventSink>) -> Self {
        let tools_dir = search
            .tools_dir
            .clone()
            .filter(|dir| dir.is_dir())
            .or_else(Self::detect_bundled_tools_dir);
        let search = Arc::new(search);

        let bundled = {
            let search = Arc::clone(&search);
            let tools_dir = tools_dir.clone();
            Strategy {
                origin: ToolOrigin::Bundled,
                lookup: Box::new(move |kind| {
                    let dir = tools_dir.as_deref()?;
                    Self::bundled_candidates(dir, search.name_for(kind))
                        .into_iter()
                        .find(|path| platform::is_executable(path))
                }),
            }
        };

        let system = {
            let search = Arc::clone(&search);
            Strategy {
                origin: ToolOrigin::SystemPath,
                lookup: Box::new(move |kind| Self::find_in_system_path(&search, kind)),
            }
        };

        let fallback = {
            let search = Arc::clone(&search);
            Strategy {
                origin: ToolOrigin::Fallback,
                lookup: Box::new(move |kind| {
                    search
                        .fallbacks_for(kind)
                        .iter()
                        .find(|path| platform::is_executable(path))
                        .cloned()
                }),
            }
        };

        Self {
            strategies: vec![bundled, system, fallback],
            search,
            tools_dir,
            cache: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Detect the bundled tools directory
    fn detect_bundled_tools_dir() -> Option<PathBuf> {
        // Strategy 1: explicit environment override
        if let Some(dir) = env::var_os(TOOLS_DIR_ENV).map(PathBuf::from) {
            debug!("Checking {}: {:?}", TOOLS_DIR_ENV, dir);
            if dir.is_dir() {
                return Some(dir);
            }
        }

        // Strategy 2: directories shipped next to the executable
        let exe_path = env::current_exe().ok()?;
        let app_dir = exe_path.parent()?;
        let possible_paths = [
            app_dir.join("tools"),
            app_dir.join("resources").join("tools"),
            app_dir.join("..").join("Resources").join("tools"),
        ];

        for path in &possible_paths {
            debug!("Checking bundled path: {:?}", path);
            if path.is_dir() {
                return Some(path.clone());
            }
        }

        debug!("No bundled tools directory found");
        None
    }

    /// Candidate locations for a bundled tool, in preference order
    fn bundled_candidates(tools_dir: &Path, tool_name: &str) -> Vec<PathBuf> {
        let file_name = platform::executable_name(tool_name);
        let platform_dir = tools_dir.join(platform::platform_dir());
        vec![
            // tools/{platform}/{tool}
            platform_dir.join(&file_name),
            // tools/{platform}/{tool}/{tool}
            platform_dir.join(tool_name).join(&file_name),
            // tools/{tool}
            tools_dir.join(&file_name),
        ]
    }

    /// Find tool in system PATH
    fn find_in_system_path(search: &ToolSearch, kind: ToolKind) -> Option<PathBuf> {
        let name = search.name_for(kind);
        let found = match &search.search_path {
            Some(paths) => {
                let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
                which::which_in(name, Some(paths), cwd)
            }
            None => which::which(name),
        };
        found.ok()
    }

    /// Resolve the path to a tool, first match wins
    pub fn resolve(&self, kind: ToolKind) -> Result<ToolBinary, ToolNotFoundError> {
        if let Some(cached) = self.cache.read().ok().and_then(|cache| cache.get(&kind).cloned()) {
            return Ok(cached);
        }

        let binary = self
            .strategies
            .iter()
            .find_map(|strategy| {
                (strategy.lookup)(kind).map(|path| ToolBinary {
                    kind,
                    path,
                    origin: strategy.origin,
                })
            })
            .ok_or_else(|| {
                warn!("Tool not found: {} ({})", self.search.name_for(kind), kind);
                ToolNotFoundError { kind }
            })?;

        self.events.emit(&PipelineEvent::ToolResolved {
            kind,
            path: binary.path.clone(),
            origin: binary.origin,
        });

        if let Ok(mut cache) = self.cache.write() {
            cache.entry(kind).or_insert_with(|| binary.clone());
        }
        Ok(binary)
    }

    /// Check if a specific tool is available
    pub fn is_tool_available(&self, kind: ToolKind) -> bool {
        self.resolve(kind).is_ok()
    }

    /// Run the tool's version query and return the first line it prints.
    ///
    /// Resolution only proves that an executable exists; callers that need to
    /// know it is really the expected tool use this probe.
    pub async fn probe_version(
        &self,
        runner: &SubprocessRunner,
        binary: &ToolBinary,
        cancel: &CancelSignal,
    ) -> Result<Option<String>, RunnerError> {
        let flag = match binary.kind {
            ToolKind::Converter => "-version",
            ToolKind::Analyzer => "--version",
        };
        let spec = SubprocessSpec::new(&binary.path).arg(flag);
        let outcome = runner.run(&spec, cancel, None).await?;

        let first_line = |bytes: &[u8]| {
            String::from_utf8_lossy(bytes)
                .lines()
                .map(str::trim)
                .find(|line| !line.is_empty())
                .map(str::to_string)
        };

        if !outcome.succeeded() {
            return Ok(None);
        }
        Ok(first_line(&outcome.stdout).or_else(|| first_line(&outcome.stderr)))
    }

    /// Get installation instructions for a tool
    pub fn install_instructions(&self, kind: ToolKind) -> String {
        let name = self.search.name_for(kind);
        match (kind, env::consts::OS) {
            (ToolKind::Converter, "macos") => "brew install ffmpeg".to_string(),
            (ToolKind::Converter, "linux") => "sudo apt-get install ffmpeg".to_string(),
            (ToolKind::Analyzer, "macos") => "brew install libvmaf".to_string(),
            (ToolKind::Analyzer, "linux") => {
                "sudo apt-get install vmaf  # or build libvmaf from https://github.com/Netflix/vmaf".to_string()
            }
            _ => format!("install '{}' and make sure it is on PATH", name),
        }
    }

    /// Get a report of tool availability
    pub async fn tools_report(&self, runner: &SubprocessRunner, cancel: &CancelSignal) -> String {
        let mut report = String::new();
        report.push_str("Tool Path Resolver Report\n");
        report.push_str(&format!("Platform: {}\n", platform::SystemInfo::current()));
        report.push_str(&format!("Bundled tools dir: {:?}\n", self.tools_dir));
        report.push_str("\nTool Availability:\n");

        for kind in [ToolKind::Converter, ToolKind::Analyzer] {
            let name = self.search.name_for(kind);
            match self.resolve(kind) {
                Ok(binary) => {
                    let version = match self.probe_version(runner, &binary, cancel).await {
                        Ok(Some(version)) => version,
                        Ok(None) => "version probe failed".to_string(),
                        Err(e) => e.to_string(),
                    };
                    report.push_str(&format!(
                        "  ✅ {} ({}) -> {:?} [{:?}]\n     {}\n",
                        name, kind, binary.path, binary.origin, version
                    ));
                }
                Err(_) => {
                    report.push_str(&format!(
                        "  ❌ {} ({}) (install with: {})\n",
                        name,
                        kind,
                        self.install_instructions(kind)
                    ));
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CapturingSink;
    use tempfile::TempDir;

    fn search_with(tools_dir: Option<PathBuf>, path: &Path) -> ToolSearch {
        ToolSearch {
            tools_dir,
            search_path: Some(path.as_os_str().to_owned()),
            converter_name: "fake-ffmpeg".to_string(),
            analyzer_name: "fake-vmaf".to_string(),
            converter_fallbacks: Vec::new(),
            analyzer_fallbacks: Vec::new(),
        }
    }

    #[cfg(unix)]
    fn make_executable(path: &Path) {
        use std::os::unix::fs::PermissionsExt;
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, "#!/bin/sh\necho fake 1.0\n").unwrap();
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[test]
    fn test_not_found_when_no_candidate() {
        let empty = TempDir::new().unwrap();
        let resolver = ToolPathResolver::new(
            search_with(None, empty.path()),
            Arc::new(CapturingSink::new()),
        );
        let err = resolver.resolve(ToolKind::Analyzer).unwrap_err();
        assert_eq!(err.kind, ToolKind::Analyzer);
        assert!(!resolver.is_tool_available(ToolKind::Converter));
    }

    #[cfg(unix)]
    #[test]
    fn test_bundled_wins_over_system_path() {
        let tools = TempDir::new().unwrap();
        let bin = TempDir::new().unwrap();
        let bundled = tools.path().join(platform::platform_dir()).join("fake-vmaf");
        make_executable(&bundled);
        make_executable(&bin.path().join("fake-vmaf"));

        let sink = Arc::new(CapturingSink::new());
        let resolver = ToolPathResolver::new(
            search_with(Some(tools.path().to_path_buf()), bin.path()),
            sink.clone(),
        );
        let binary = resolver.resolve(ToolKind::Analyzer).unwrap();
        assert_eq!(binary.origin, ToolOrigin::Bundled);
        assert_eq!(binary.path, bundled);
        assert_eq!(sink.count(|e| matches!(e, PipelineEvent::ToolResolved { .. })), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_system_path_then_fallback() {
        let bin = TempDir::new().unwrap();
        let fallback_dir = TempDir::new().unwrap();
        make_executable(&bin.path().join("fake-ffmpeg"));
        let fallback = fallback_dir.path().join("vmaf-fallback");
        make_executable(&fallback);

        let mut search = search_with(None, bin.path());
        search.analyzer_fallbacks = vec![PathBuf::from("/definitely/missing/vmaf"), fallback.clone()];
        let resolver = ToolPathResolver::new(search, Arc::new(CapturingSink::new()));

        let converter = resolver.resolve(ToolKind::Converter).unwrap();
        assert_eq!(converter.origin, ToolOrigin::SystemPath);

        let analyzer = resolver.resolve(ToolKind::Analyzer).unwrap();
        assert_eq!(analyzer.origin, ToolOrigin::Fallback);
        assert_eq!(analyzer.path, fallback);
    }

    #[cfg(unix)]
    #[test]
    fn test_resolution_is_cached() {
        let bin = TempDir::new().unwrap();
        let tool = bin.path().join("fake-ffmpeg");
        make_executable(&tool);

        let sink = Arc::new(CapturingSink::new());
        let resolver = ToolPathResolver::new(search_with(None, bin.path()), sink.clone());
        let first = resolver.resolve(ToolKind::Converter).unwrap();

        std::fs::remove_file(&tool).unwrap();
        let second = resolver.resolve(ToolKind::Converter).unwrap();
        assert_eq!(first, second);
        assert_eq!(sink.count(|e| matches!(e, PipelineEvent::ToolResolved { .. })), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_non_executable_bundled_file_is_skipped() {
        let tools = TempDir::new().unwrap();
        let empty = TempDir::new().unwrap();
        let bundled = tools.path().join("fake-vmaf");
        std::fs::write(&bundled, "not executable").unwrap();

        let resolver = ToolPathResolver::new(
            search_with(Some(tools.path().to_path_buf()), empty.path()),
            Arc::new(CapturingSink::new()),
        );
        assert!(resolver.resolve(ToolKind::Analyzer).is_err());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_probe_version_reads_first_line() {
        let bin = TempDir::new().unwrap();
        make_executable(&bin.path().join("fake-vmaf"));
        let sink: Arc<dyn EventSink> = Arc::new(CapturingSink::new());
        let resolver = ToolPathResolver::new(search_with(None, bin.path()), sink.clone());
        let runner = SubprocessRunner::new(std::time::Duration::from_millis(200), sink);

        let binary = resolver.resolve(ToolKind::Analyzer).unwrap();
        let version = resolver
            .probe_version(&runner, &binary, &CancelSignal::never())
            .await
            .unwrap();
        assert_eq!(version.as_deref(), Some("fake 1.0"));
    }
}
