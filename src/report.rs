//! # Analysis Report
//!
//! Lettura e validazione del report finale scritto dall'analyzer.
//!
//! ## Responsabilità:
//! - `AnalysisReport`: punteggio complessivo, punteggi per frame, metriche aggregate
//! - Parser per i tre formati di output: JSON, XML, CSV
//! - Metriche opzionali mancanti restano assenti (mai zero)
//! - Un report con zero frame è degenere ma valido (JSON/XML)
//! - Un report senza punteggio complessivo viene rifiutato come `MalformedReport`
//! - Aggregati mancanti nella sezione pooled vengono calcolati localmente
//!
//! ## Formato JSON atteso:
//! ```json
//! {
//!   "version": "3.0.0",
//!   "frames": [{"frameNum": 0, "metrics": {"vmaf": 94.1, "integer_adm2": 0.98}}],
//!   "pooled_metrics": {"vmaf": {"min": 90.0, "max": 98.0, "mean": 94.1, "harmonic_mean": 94.0}}
//! }
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::AnalysisError;

/// Metric carrying the overall quality score
pub const OVERALL_METRIC: &str = "vmaf";

/// Output format selector passed to the analyzer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportFormat {
    #[default]
    Json,
    Xml,
    Csv,
}

impl ReportFormat {
    /// Analyzer flag selecting this format
    pub fn flag(&self) -> &'static str {
        match self {
            ReportFormat::Json => "--json",
            ReportFormat::Xml => "--xml",
            ReportFormat::Csv => "--csv",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ReportFormat::Json => "json",
            ReportFormat::Xml => "xml",
            ReportFormat::Csv => "csv",
        }
    }
}

impl fmt::Display for ReportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ReportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "json" => Ok(ReportFormat::Json),
            "xml" => Ok(ReportFormat::Xml),
            "csv" => Ok(ReportFormat::Csv),
            other => Err(format!("unknown report format '{}' (expected json, xml or csv)", other)),
        }
    }
}

/// Metric values of one frame
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FrameScores {
    pub frame_index: u64,
    pub metrics: BTreeMap<String, f64>,
}

/// Min / max / mean / harmonic mean of one metric over the whole run
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PooledMetric {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    pub harmonic_mean: f64,
}

impl PooledMetric {
    /// Pool a set of per-frame values. Harmonic mean follows libvmaf:
    /// `1 / mean(1 / (x + 1)) - 1`.
    pub fn from_values(values: &[f64]) -> Option<Self> {
        if values.is_empty() {
            return None;
        }
        let n = values.len() as f64;
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / n;
        let inverse_sum: f64 = values.iter().map(|v| 1.0 / (v + 1.0)).sum();
        let harmonic_mean = n / inverse_sum - 1.0;
        Some(Self { min, max, mean, harmonic_mean })
    }
}

/// Final result of one analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AnalysisReport {
    pub overall_score: f64,
    pub frames: Vec<FrameScores>,
    pub aggregates: BTreeMap<String, PooledMetric>,
    pub format: ReportFormat,
    pub analyzer_version: Option<String>,
}

impl AnalysisReport {
    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    /// Values of one metric across frames, skipping frames where it is absent
    pub fn metric_series(&self, metric: &str) -> Vec<(u64, f64)> {
        self.frames
            .iter()
            .filter_map(|f| f.metrics.get(metric).map(|v| (f.frame_index, *v)))
            .collect()
    }

    /// Fill in aggregates for metrics that appear per frame but not pooled
    fn complete_aggregates(&mut self) {
        let mut names: Vec<String> = self
            .frames
            .iter()
            .flat_map(|f| f.metrics.keys().cloned())
            .collect();
        names.sort();
        names.dedup();

        for name in names {
            if self.aggregates.contains_key(&name) {
                continue;
            }
            let values: Vec<f64> = self.metric_series(&name).into_iter().map(|(_, v)| v).collect();
            if let Some(pooled) = PooledMetric::from_values(&values) {
                self.aggregates.insert(name, pooled);
            }
        }
    }
}

/// Read and parse a report file
pub async fn read_report(path: &Path, format: ReportFormat) -> Result<AnalysisReport, AnalysisError> {
    let content = tokio::fs::read_to_string(path).await.map_err(|e| {
        AnalysisError::MalformedReport(format!("cannot read report {}: {}", path.display(), e))
    })?;
    parse_report(&content, format)
}

/// Parse report content in the given format
pub fn parse_report(content: &str, format: ReportFormat) -> Result<AnalysisReport, AnalysisError> {
    if content.trim().is_empty() {
        return Err(AnalysisError::MalformedReport("report is empty".to_string()));
    }

    let mut report = match format {
        ReportFormat::Json => parse_json(content)?,
        ReportFormat::Xml => parse_xml(content)?,
        ReportFormat::Csv => parse_csv(content)?,
    };

    if !report.overall_score.is_finite() {
        return Err(malformed(format!("overall score is not finite ({})", report.overall_score)));
    }
    report.frames.sort_by_key(|f| f.frame_index);
    report.complete_aggregates();
    Ok(report)
}

fn malformed(reason: impl Into<String>) -> AnalysisError {
    AnalysisError::MalformedReport(reason.into())
}

fn parse_json(content: &str) -> Result<AnalysisReport, AnalysisError> {
    let json: Value = serde_json::from_str(content).map_err(|e| malformed(format!("invalid JSON: {}", e)))?;

    let frames_value = json
        .get("frames")
        .and_then(Value::as_array)
        .ok_or_else(|| malformed("missing 'frames' array"))?;

    let mut frames = Vec::with_capacity(frames_value.len());
    for (position, frame) in frames_value.iter().enumerate() {
        let frame_index = frame
            .get("frameNum")
            .and_then(Value::as_u64)
            .ok_or_else(|| malformed(format!("frame #{} has no frameNum", position)))?;
        let metrics = frame
            .get("metrics")
            .and_then(Value::as_object)
            .map(|m| {
                m.iter()
                    .filter_map(|(name, v)| v.as_f64().map(|v| (name.clone(), v)))
                    .collect()
            })
            .unwrap_or_default();
        frames.push(FrameScores { frame_index, metrics });
    }

    let mut aggregates = BTreeMap::new();
    if let Some(pooled) = json.get("pooled_metrics").and_then(Value::as_object) {
        for (name, stats) in pooled {
            let field = |key: &str| stats.get(key).and_then(Value::as_f64);
            if let (Some(min), Some(max), Some(mean), Some(harmonic_mean)) =
                (field("min"), field("max"), field("mean"), field("harmonic_mean"))
            {
                aggregates.insert(name.clone(), PooledMetric { min, max, mean, harmonic_mean });
            }
        }
    }

    // older analyzers put the score under aggregate "VMAF_score" / top-level "VMAF score"
    let overall_score = json
        .get("pooled_metrics")
        .and_then(|p| p.get(OVERALL_METRIC))
        .and_then(|m| m.get("mean"))
        .and_then(Value::as_f64)
        .or_else(|| json.get("aggregate").and_then(|a| a.get("VMAF_score")).and_then(Value::as_f64))
        .or_else(|| json.get("VMAF score").and_then(Value::as_f64))
        .ok_or_else(|| malformed("missing overall score (pooled_metrics.vmaf.mean)"))?;

    let analyzer_version = json
        .get("version")
        .and_then(Value::as_str)
        .map(str::to_string);

    Ok(AnalysisReport {
        overall_score,
        frames,
        aggregates,
        format: ReportFormat::Json,
        analyzer_version,
    })
}

fn parse_xml(content: &str) -> Result<AnalysisReport, AnalysisError> {
    let doc = roxmltree::Document::parse(content).map_err(|e| malformed(format!("XML parse error: {}", e)))?;
    let root = doc.root_element();

    let frames_node = root
        .children()
        .find(|n| n.has_tag_name("frames"))
        .ok_or_else(|| malformed("missing <frames> element"))?;

    let mut frames = Vec::new();
    for (position, node) in frames_node.children().filter(|n| n.has_tag_name("frame")).enumerate() {
        let frame_index = node
            .attribute("frameNum")
            .and_then(|v| v.parse::<u64>().ok())
            .ok_or_else(|| malformed(format!("frame #{} has no frameNum", position)))?;
        let metrics = node
            .attributes()
            .filter(|a| a.name() != "frameNum")
            .filter_map(|a| a.value().parse::<f64>().ok().map(|v| (a.name().to_string(), v)))
            .collect();
        frames.push(FrameScores { frame_index, metrics });
    }

    let mut aggregates = BTreeMap::new();
    if let Some(pooled) = root.children().find(|n| n.has_tag_name("pooled_metrics")) {
        for metric in pooled.children().filter(|n| n.has_tag_name("metric")) {
            let Some(name) = metric.attribute("name") else {
                continue;
            };
            let field = |key: &str| metric.attribute(key).and_then(|v| v.parse::<f64>().ok());
            if let (Some(min), Some(max), Some(mean), Some(harmonic_mean)) =
                (field("min"), field("max"), field("mean"), field("harmonic_mean"))
            {
                aggregates.insert(name.to_string(), PooledMetric { min, max, mean, harmonic_mean });
            }
        }
    }

    let overall_score = aggregates
        .get(OVERALL_METRIC)
        .map(|m| m.mean)
        .or_else(|| {
            root.children()
                .find(|n| n.has_tag_name("aggregate"))
                .and_then(|n| n.attribute("VMAF_score"))
                .and_then(|v| v.parse::<f64>().ok())
        })
        .ok_or_else(|| malformed("missing overall score (pooled vmaf mean)"))?;

    Ok(AnalysisReport {
        overall_score,
        frames,
        aggregates,
        format: ReportFormat::Xml,
        analyzer_version: root.attribute("version").map(str::to_string),
    })
}

/// CSV carries no pooled section; the overall score is the mean of the
/// per-frame `vmaf` column, so a report without frames has no score.
fn parse_csv(content: &str) -> Result<AnalysisReport, AnalysisError> {
    let mut lines = content.lines().map(str::trim).filter(|l| !l.is_empty());
    let header: Vec<&str> = lines
        .next()
        .ok_or_else(|| malformed("missing CSV header"))?
        .split(',')
        .map(str::trim)
        .collect();

    let frame_col = header
        .iter()
        .position(|h| h.eq_ignore_ascii_case("frame") || *h == "frameNum")
        .ok_or_else(|| malformed("CSV header has no Frame column"))?;

    let mut frames = Vec::new();
    for (row, line) in lines.enumerate() {
        let cells: Vec<&str> = line.split(',').map(str::trim).collect();
        let frame_index = cells
            .get(frame_col)
            .and_then(|c| c.parse::<u64>().ok())
            .ok_or_else(|| malformed(format!("CSV row {} has no frame index", row + 1)))?;
        let metrics = header
            .iter()
            .enumerate()
            .filter(|(i, name)| *i != frame_col && !name.is_empty())
            .filter_map(|(i, name)| {
                cells
                    .get(i)
                    .and_then(|c| c.parse::<f64>().ok())
                    .map(|v| (name.to_string(), v))
            })
            .collect();
        frames.push(FrameScores { frame_index, metrics });
    }

    let scores: Vec<f64> = frames
        .iter()
        .filter_map(|f| f.metrics.get(OVERALL_METRIC).copied())
        .collect();
    if scores.is_empty() {
        return Err(malformed("CSV report has no vmaf values"));
    }
    let overall_score = scores.iter().sum::<f64>() / scores.len() as f64;

    Ok(AnalysisReport {
        overall_score,
        frames,
        aggregates: BTreeMap::new(),
        format: ReportFormat::Csv,
        analyzer_version: None,
    })
}
