//! # Configuration Management Module
//!
//! Questo modulo gestisce tutta la configurazione dell'applicazione (Settings Store).
//!
//! ## Responsabilità:
//! - Definisce la struct `Config` con tutti i parametri della pipeline di analisi
//! - Fornisce validazione robusta dei parametri di input
//! - Supporta caricamento/salvataggio configurazione da/verso file JSON
//! - Fornisce valori di default sensati per tutti i parametri
//!
//! ## Parametri di configurazione:
//! - `model`: Modello di qualità dell'analyzer (default: "vmaf_v0.6.1")
//! - `output_format`: Formato del report (json, xml, csv; default: json)
//! - `pixel_format`: Formato pixel forzato per gli intermedi (default: None = auto)
//! - `tools_dir`: Directory dei tool bundled (anche via `VQA_TOOLS_DIR`)
//! - `workspace_root`: Directory che ospita le workspace (default: temp di sistema)
//! - `space_multiplier` / `min_free_bytes`: Precondizione sullo spazio disco
//! - `termination_grace_ms`: Attesa tra SIGTERM e kill forzato (default: 3000)
//! - `stage_timeout_secs`: Timeout per sottoprocesso (default: None)
//! - `parallel_conversion`: Converte reference e distorted in parallelo (default: true)
//! - `rate_smoothing`: Alpha della media mobile esponenziale del rate (default: 0.3)
//!
//! ## Validazione:
//! - Controlla che il modello non sia vuoto
//! - Controlla che rate_smoothing sia in (0, 1]
//! - Controlla che space_multiplier sia > 0
//! - Controlla che i percorsi di fallback siano assoluti
//!
//! ## Esempio:
//! ```rust,ignore
//! let config = Config {
//!     model: "vmaf_4k_v0.6.1".to_string(),
//!     output_format: ReportFormat::Xml,
//!     ..Default::default()
//! };
//! config.validate()?;
//! ```

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pipeline::conversion::PixelFormat;
use crate::report::ReportFormat;
use crate::workspace::SpacePolicy;

/// Configuration for quality analysis runs
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Quality model identifier or model file path
    pub model: String,
    /// Report format requested from the analyzer
    pub output_format: ReportFormat,
    /// Forced intermediate pixel format (None = from input bit depth)
    pub pixel_format: Option<PixelFormat>,
    /// Bundled tools directory
    pub tools_dir: Option<PathBuf>,
    /// Converter executable name looked up on PATH
    pub converter_name: String,
    /// Analyzer executable name looked up on PATH
    pub analyzer_name: String,
    /// Absolute paths tried when the converter is not bundled nor on PATH
    pub converter_fallbacks: Vec<PathBuf>,
    /// Absolute paths tried when the analyzer is not bundled nor on PATH
    pub analyzer_fallbacks: Vec<PathBuf>,
    /// Where run workspaces are created (None = system temp dir)
    pub workspace_root: Option<PathBuf>,
    /// Required free space = input size × multiplier
    pub space_multiplier: f64,
    /// Lower bound of the required free space
    pub min_free_bytes: u64,
    /// Grace period between termination request and forced kill
    pub termination_grace_ms: u64,
    /// Per-subprocess wall clock limit
    pub stage_timeout_secs: Option<u64>,
    /// Convert reference and distorted concurrently
    pub parallel_conversion: bool,
    /// Analyzer worker threads (None = tool default)
    pub analyzer_threads: Option<usize>,
    /// EMA alpha for the processing rate, in (0, 1]
    pub rate_smoothing: f64,
    /// Bytes of stderr tail carried in errors
    pub stderr_excerpt_bytes: usize,
    /// Remove workspaces of dead processes at startup
    pub purge_stale_workspaces: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: "vmaf_v0.6.1".to_string(),
            output_format: ReportFormat::Json,
            pixel_format: None,
            tools_dir: None,
            converter_name: "ffmpeg".to_string(),
            analyzer_name: "vmaf".to_string(),
            converter_fallbacks: default_fallbacks("ffmpeg"),
            analyzer_fallbacks: default_fallbacks("vmaf"),
            workspace_root: None,
            space_multiplier: 12.0,
            min_free_bytes: 1024 * 1024 * 1024,
            termination_grace_ms: 3000,
            stage_timeout_secs: None,
            parallel_conversion: true,
            analyzer_threads: None,
            rate_smoothing: 0.3,
            stderr_excerpt_bytes: 4096,
            purge_stale_workspaces: true,
        }
    }
}

/// Common install locations outside PATH (GUI apps often start with a minimal PATH)
fn default_fallbacks(name: &str) -> Vec<PathBuf> {
    if cfg!(windows) {
        vec![PathBuf::from(format!("C:\\Program Files\\{}\\bin\\{}.exe", name, name))]
    } else {
        ["/opt/homebrew/bin", "/usr/local/bin", "/usr/bin"]
            .iter()
            .map(|dir| Path::new(dir).join(name))
            .collect()
    }
}

impl Config {
    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.model.trim().is_empty() {
            return Err(anyhow::anyhow!("Model identifier must not be empty"));
        }

        if self.rate_smoothing.is_nan() || self.rate_smoothing <= 0.0 || self.rate_smoothing > 1.0 {
            return Err(anyhow::anyhow!("Rate smoothing must be in (0, 1]"));
        }

        if !self.space_multiplier.is_finite() || self.space_multiplier <= 0.0 {
            return Err(anyhow::anyhow!("Space multiplier must be greater than 0"));
        }

        if self.stderr_excerpt_bytes == 0 {
            return Err(anyhow::anyhow!("Stderr excerpt size must be greater than 0"));
        }

        if self.converter_name.trim().is_empty() || self.analyzer_name.trim().is_empty() {
            return Err(anyhow::anyhow!("Tool names must not be empty"));
        }

        if let Some(path) = self
            .converter_fallbacks
            .iter()
            .chain(&self.analyzer_fallbacks)
            .find(|p| !p.is_absolute())
        {
            return Err(anyhow::anyhow!("Fallback path must be absolute: {}", path.display()));
        }

        if self.analyzer_threads == Some(0) {
            return Err(anyhow::anyhow!("Analyzer threads must be greater than 0"));
        }

        Ok(())
    }

    /// Default config file location
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("video-quality-analyzer").join("config.json"))
    }

    /// Load configuration from file
    pub async fn from_file(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path).await?;
        let config: Config = serde_json::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to file
    pub async fn save_to_file(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_string_pretty(self)?;
        tokio::fs::write(path, content).await?;
        Ok(())
    }

    pub fn workspace_root(&self) -> PathBuf {
        self.workspace_root.clone().unwrap_or_else(std::env::temp_dir)
    }

    pub fn space_policy(&self) -> SpacePolicy {
        SpacePolicy {
            multiplier: self.space_multiplier,
            min_free_bytes: self.min_free_bytes,
        }
    }

    pub fn termination_grace(&self) -> Duration {
        Duration::from_millis(self.termination_grace_ms)
    }

    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_ok());

        config.model = "  ".to_string();
        assert!(config.validate().is_err());

        config.model = "vmaf_v0.6.1".to_string();
        config.rate_smoothing = 0.0;
        assert!(config.validate().is_err());

        config.rate_smoothing = 1.0;
        config.space_multiplier = -1.0;
        assert!(config.validate().is_err());

        config.space_multiplier = 12.0;
        config.analyzer_fallbacks = vec![PathBuf::from("relative/vmaf")];
        assert!(config.validate().is_err());

        config.analyzer_fallbacks.clear();
        config.stderr_excerpt_bytes = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_default() {
        let config = Config::default();
        assert_eq!(config.model, "vmaf_v0.6.1");
        assert_eq!(config.output_format, ReportFormat::Json);
        assert_eq!(config.converter_name, "ffmpeg");
        assert_eq!(config.analyzer_name, "vmaf");
        assert_eq!(config.space_policy().required_for(0), 1024 * 1024 * 1024);
        assert_eq!(config.termination_grace(), Duration::from_secs(3));
        assert!(config.stage_timeout().is_none());
        assert!(config.parallel_conversion);
    }

    #[tokio::test]
    async fn test_config_save_load() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("nested").join("config.json");

        let original_config = Config {
            model: "vmaf_4k_v0.6.1".to_string(),
            output_format: ReportFormat::Csv,
            pixel_format: Some(PixelFormat::Yuv420p10le),
            stage_timeout_secs: Some(600),
            parallel_conversion: false,
            ..Default::default()
        };

        // Save config
        original_config.save_to_file(&config_path).await.unwrap();

        // Load config
        let loaded_config = Config::from_file(&config_path).await.unwrap();

        assert_eq!(loaded_config.model, "vmaf_4k_v0.6.1");
        assert_eq!(loaded_config.output_format, ReportFormat::Csv);
        assert_eq!(loaded_config.pixel_format, Some(PixelFormat::Yuv420p10le));
        assert_eq!(loaded_config.stage_timeout(), Some(Duration::from_secs(600)));
        assert!(!loaded_config.parallel_conversion);
    }

    #[tokio::test]
    async fn test_partial_file_uses_defaults() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        tokio::fs::write(&config_path, r#"{"model": "custom"}"#).await.unwrap();

        let config = Config::from_file(&config_path).await.unwrap();
        assert_eq!(config.model, "custom");
        assert_eq!(config.rate_smoothing, 0.3);

        let missing = Config::from_file(&temp_dir.path().join("missing.json")).await.unwrap();
        assert_eq!(missing.model, "vmaf_v0.6.1");
    }

    #[test]
    fn test_invalid_file_is_rejected() {
        let temp_dir = TempDir::new().unwrap();
        let config_path = temp_dir.path().join("config.json");
        std::fs::write(&config_path, r#"{"rate_smoothing": 2.5}"#).unwrap();

        let result = tokio_test::block_on(Config::from_file(&config_path));
        assert!(result.is_err());
    }
}
