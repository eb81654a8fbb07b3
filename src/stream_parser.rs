//! # Progress Stream Parser
//!
//! Macchina a stati pura che estrae il progresso dall'output live dell'analyzer.
//!
//! ## Responsabilità:
//! - Bufferizza i chunk di stdout/stderr e li divide in unità (`\n` o `\r`)
//! - Riconosce le unità di progresso (stile libvmaf e stile `chiave=valore`)
//! - Distingue il progresso dal payload strutturato finale (`{` o `<`)
//! - Calcola un rate smussato (media mobile esponenziale) e il tempo residuo
//! - Non fallisce mai: un'unità malformata viene segnalata e saltata
//!
//! ## Grammatica delle unità:
//! ```text
//! 120 frames  ⠙ 45.31 FPS
//! frame=120 fps=45.3 vmaf=93.12 total=240
//! frame=  120 fps= 45.3
//! ```
//!
//! Il parser non conosce processi: viene alimentato con byte e un tempo
//! trascorso, quindi è testabile senza lanciare nulla. `ProgressConsumer`
//! lo collega al `SubprocessRunner`.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::events::{EventSink, PipelineEvent};
use crate::runner::{OutputConsumer, StreamKind};

/// Longest unterminated unit kept in the rolling buffer
pub const MAX_UNIT_BYTES: usize = 64 * 1024;

const UNIT_PREVIEW_CHARS: usize = 120;

/// One progress observation during analysis
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressSample {
    pub current_frame: u64,
    /// Unknown until discovered from the intermediates or the tool output
    pub total_frames: Option<u64>,
    /// Smoothed processing rate
    pub frames_per_second: f64,
    pub running_quality: Option<f64>,
    pub elapsed: Duration,
    /// Undefined when the total is unknown or the rate is zero
    pub remaining: Option<Duration>,
}

impl ProgressSample {
    /// Completion percentage, when the total is known
    pub fn percent(&self) -> Option<f64> {
        match self.total_frames {
            Some(total) if total > 0 => Some((self.current_frame as f64 / total as f64 * 100.0).min(100.0)),
            _ => None,
        }
    }
}

/// Remaining time = (total - current) / fps
pub fn remaining_time(total_frames: Option<u64>, current_frame: u64, fps: f64) -> Option<Duration> {
    let total = total_frames?;
    if !fps.is_finite() || fps <= 0.0 {
        return None;
    }
    let left = total.saturating_sub(current_frame) as f64;
    Some(Duration::from_secs_f64(left / fps))
}

/// Exponential moving average of the processing rate
#[derive(Debug, Clone)]
pub struct RateEstimator {
    alpha: f64,
    smoothed: Option<f64>,
    last: Option<(u64, Duration)>,
}

impl RateEstimator {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha: alpha.clamp(f64::MIN_POSITIVE, 1.0),
            smoothed: None,
            last: None,
        }
    }

    /// Feed one observation; returns the smoothed rate.
    ///
    /// A rate reported by the tool is preferred. Otherwise the rate is the
    /// frame delta over the time delta since the previous observation;
    /// observations sharing a timestamp (same chunk) contribute nothing.
    pub fn update(&mut self, frame: u64, reported: Option<f64>, elapsed: Duration) -> f64 {
        let measured = match self.last {
            Some((last_frame, last_elapsed)) if elapsed > last_elapsed => {
                let dt = (elapsed - last_elapsed).as_secs_f64();
                Some(frame.saturating_sub(last_frame) as f64 / dt)
            }
            _ => None,
        };
        if self.last.map_or(true, |(_, last_elapsed)| elapsed > last_elapsed) {
            self.last = Some((frame, elapsed));
        }

        let instant = reported.filter(|fps| fps.is_finite() && *fps >= 0.0).or(measured);
        if let Some(rate) = instant {
            self.smoothed = Some(match self.smoothed {
                Some(prev) => self.alpha * rate + (1.0 - self.alpha) * prev,
                None => rate,
            });
        }
        self.smoothed.unwrap_or(0.0)
    }

    pub fn current(&self) -> f64 {
        self.smoothed.unwrap_or(0.0)
    }

    pub fn reset(&mut self) {
        self.smoothed = None;
        self.last = None;
    }
}

/// What the parser produced for one unit
#[derive(Debug, Clone, PartialEq)]
pub enum ParserOutput {
    Sample(ProgressSample),
    Skipped { unit: String, reason: String },
}

/// Fields extracted from one progress unit
#[derive(Debug, Clone, Default, PartialEq)]
struct RawProgress {
    frame: u64,
    fps: Option<f64>,
    quality: Option<f64>,
    total: Option<u64>,
}

#[derive(Debug, PartialEq)]
enum Unit {
    Progress(RawProgress),
    Ignored,
    Malformed(String),
}

/// Per-stream rolling buffer
#[derive(Debug, Default)]
struct StreamBuffer {
    pending: Vec<u8>,
    payload: Option<Vec<u8>>,
    /// Dropping bytes until the next delimiter after an overflow
    discarding: bool,
}

/// Incremental parser for the analyzer's live output
#[derive(Debug)]
pub struct ProgressStreamParser {
    stdout: StreamBuffer,
    stderr: StreamBuffer,
    rate: RateEstimator,
    total_frames: Option<u64>,
    last_frame: Option<u64>,
    last_quality: Option<f64>,
}

impl ProgressStreamParser {
    pub fn new(rate_smoothing: f64) -> Self {
        Self {
            stdout: StreamBuffer::default(),
            stderr: StreamBuffer::default(),
            rate: RateEstimator::new(rate_smoothing),
            total_frames: None,
            last_frame: None,
            last_quality: None,
        }
    }

    /// Total frames discovered before the run (e.g. from the intermediates)
    pub fn set_total_frames(&mut self, total: Option<u64>) {
        self.total_frames = total;
    }

    pub fn total_frames(&self) -> Option<u64> {
        self.total_frames
    }

    /// Structured payload seen on a stream, if any
    pub fn payload(&self, stream: StreamKind) -> Option<&[u8]> {
        self.buffer(stream).payload.as_deref()
    }

    /// Forget everything, ready for a new run
    pub fn reset(&mut self) {
        self.stdout = StreamBuffer::default();
        self.stderr = StreamBuffer::default();
        self.rate.reset();
        self.total_frames = None;
        self.last_frame = None;
        self.last_quality = None;
    }

    /// Feed one chunk; returns samples and skipped units in stream order
    pub fn feed(&mut self, stream: StreamKind, chunk: &[u8], elapsed: Duration) -> Vec<ParserOutput> {
        let mut units = Vec::new();
        let mut out = Vec::new();
        {
            let buf = self.buffer_mut(stream);
            if let Some(payload) = buf.payload.as_mut() {
                payload.extend_from_slice(chunk);
                return out;
            }
            buf.pending.extend_from_slice(chunk);
            Self::split_units(buf, &mut units, &mut out);
        }

        for unit in units {
            if let Some(output) = self.process_unit(&unit, elapsed) {
                out.push(output);
            }
        }
        out
    }

    /// Flush the trailing unterminated units at end of stream
    pub fn finish(&mut self, elapsed: Duration) -> Vec<ParserOutput> {
        let mut out = Vec::new();
        for stream in [StreamKind::Stdout, StreamKind::Stderr] {
            let buf = self.buffer_mut(stream);
            if buf.payload.is_some() || buf.discarding {
                buf.pending.clear();
                continue;
            }
            let unit = std::mem::take(&mut buf.pending);
            if let Some(output) = self.process_unit(&unit, elapsed) {
                out.push(output);
            }
        }
        out
    }

    fn buffer(&self, stream: StreamKind) -> &StreamBuffer {
        match stream {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    fn buffer_mut(&mut self, stream: StreamKind) -> &mut StreamBuffer {
        match stream {
            StreamKind::Stdout => &mut self.stdout,
            StreamKind::Stderr => &mut self.stderr,
        }
    }

    /// Cut complete units out of the buffer, switching to payload mode
    /// as soon as the buffer head starts a structured document
    fn split_units(buf: &mut StreamBuffer, units: &mut Vec<Vec<u8>>, out: &mut Vec<ParserOutput>) {
        loop {
            if !buf.discarding && starts_payload(&buf.pending) {
                buf.payload = Some(std::mem::take(&mut buf.pending));
                return;
            }

            let Some(pos) = buf.pending.iter().position(|b| *b == b'\n' || *b == b'\r') else {
                if buf.pending.len() > MAX_UNIT_BYTES {
                    if !buf.discarding {
                        out.push(ParserOutput::Skipped {
                            unit: preview(&buf.pending),
                            reason: format!("unit longer than {} bytes", MAX_UNIT_BYTES),
                        });
                    }
                    buf.pending.clear();
                    buf.discarding = true;
                }
                return;
            };

            let unit: Vec<u8> = buf.pending.drain(..=pos).take(pos).collect();
            if buf.discarding {
                buf.discarding = false;
                continue;
            }
            units.push(unit);
        }
    }

    fn process_unit(&mut self, unit: &[u8], elapsed: Duration) -> Option<ParserOutput> {
        let text = strip_ansi(&String::from_utf8_lossy(unit));
        let text = text.trim();
        if text.is_empty() {
            return None;
        }

        let raw = match parse_unit(text) {
            Unit::Progress(raw) => raw,
            Unit::Ignored => return None,
            Unit::Malformed(reason) => {
                return Some(ParserOutput::Skipped { unit: preview(text.as_bytes()), reason });
            }
        };

        if let Some(last) = self.last_frame {
            if raw.frame < last {
                return Some(ParserOutput::Skipped {
                    unit: preview(text.as_bytes()),
                    reason: format!("frame went backwards ({} < {})", raw.frame, last),
                });
            }
        }

        if raw.total.is_some() {
            self.total_frames = raw.total;
        }
        if raw.quality.is_some() {
            self.last_quality = raw.quality;
        }
        self.last_frame = Some(raw.frame);

        let fps = self.rate.update(raw.frame, raw.fps, elapsed);
        Some(ParserOutput::Sample(ProgressSample {
            current_frame: raw.frame,
            total_frames: self.total_frames,
            frames_per_second: fps,
            running_quality: self.last_quality,
            elapsed,
            remaining: remaining_time(self.total_frames, raw.frame, fps),
        }))
    }
}

fn starts_payload(bytes: &[u8]) -> bool {
    matches!(
        bytes.iter().find(|b| **b != b' ' && **b != b'\t'),
        Some(b'{') | Some(b'<')
    )
}

/// Drop terminal escape sequences (libvmaf ends each counter with `ESC [K`)
fn strip_ansi(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars();
    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.next() {
            // CSI: parameters up to a final byte in '@'..='~'
            Some('[') => {
                for c in chars.by_ref() {
                    if ('@'..='~').contains(&c) {
                        break;
                    }
                }
            }
            Some(_) | None => {}
        }
    }
    out
}

fn preview(bytes: &[u8]) -> String {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim();
    if text.chars().count() > UNIT_PREVIEW_CHARS {
        let cut: String = text.chars().take(UNIT_PREVIEW_CHARS).collect();
        format!("{}…", cut)
    } else {
        text.to_string()
    }
}

fn parse_unit(text: &str) -> Unit {
    let lower = text.to_ascii_lowercase();
    if lower.starts_with("frame=") || lower.starts_with("frame =") {
        return parse_key_value(text);
    }
    if text.starts_with(|c: char| c.is_ascii_digit()) {
        return parse_frame_counter(text);
    }
    Unit::Ignored
}

/// `<n> frame(s) <spinner> <fps> FPS`
fn parse_frame_counter(text: &str) -> Unit {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let Ok(frame) = tokens[0].parse::<u64>() else {
        return Unit::Malformed(format!("invalid frame count '{}'", tokens[0]));
    };
    if !tokens.get(1).is_some_and(|t| t.eq_ignore_ascii_case("frame") || t.eq_ignore_ascii_case("frames")) {
        return Unit::Malformed("expected 'frames' after frame count".to_string());
    }

    let fps = match tokens.iter().position(|t| t.eq_ignore_ascii_case("fps")) {
        Some(idx) if idx >= 3 => match tokens[idx - 1].parse::<f64>() {
            Ok(fps) if fps.is_finite() => Some(fps),
            _ => return Unit::Malformed(format!("invalid rate '{}'", tokens[idx - 1])),
        },
        Some(_) => return Unit::Malformed("rate missing before 'FPS'".to_string()),
        None => None,
    };

    Unit::Progress(RawProgress { frame, fps, ..Default::default() })
}

/// `frame=<n> [fps=<f>] [vmaf|score|quality=<q>] [total|total_frames=<n>]`
fn parse_key_value(text: &str) -> Unit {
    let mut raw = RawProgress::default();
    let mut saw_frame = false;

    for (key, value) in key_value_pairs(text) {
        let key = key.to_ascii_lowercase();
        match key.as_str() {
            "frame" => match value.parse::<u64>() {
                Ok(frame) => {
                    raw.frame = frame;
                    saw_frame = true;
                }
                Err(_) => return Unit::Malformed(format!("invalid frame value '{}'", value)),
            },
            "fps" => match value.parse::<f64>() {
                Ok(fps) if fps.is_finite() => raw.fps = Some(fps),
                _ => return Unit::Malformed(format!("invalid fps value '{}'", value)),
            },
            "vmaf" | "score" | "quality" => match value.parse::<f64>() {
                Ok(q) if q.is_finite() => raw.quality = Some(q),
                _ => return Unit::Malformed(format!("invalid score value '{}'", value)),
            },
            "total" | "total_frames" => match value.parse::<u64>() {
                Ok(total) => raw.total = Some(total),
                Err(_) => return Unit::Malformed(format!("invalid total value '{}'", value)),
            },
            _ => {}
        }
    }

    if saw_frame {
        Unit::Progress(raw)
    } else {
        Unit::Malformed("missing frame value".to_string())
    }
}

/// Split `a=1 b= 2 c =3` into pairs, tolerating blanks around `=`
fn key_value_pairs(text: &str) -> Vec<(String, String)> {
    let tokens: Vec<&str> = text.split_whitespace().collect();
    let mut pairs = Vec::new();
    let mut i = 0;
    while i < tokens.len() {
        let token = tokens[i];
        if let Some((key, value)) = token.split_once('=') {
            if value.is_empty() {
                // `key= value`
                let value = tokens.get(i + 1).copied().unwrap_or_default();
                pairs.push((key.to_string(), value.to_string()));
                i += 2;
            } else {
                pairs.push((key.to_string(), value.to_string()));
                i += 1;
            }
        } else if tokens.get(i + 1).is_some_and(|t| t.starts_with('=')) {
            // `key =value` or `key = value`
            let rest = &tokens[i + 1][1..];
            if rest.is_empty() {
                let value = tokens.get(i + 2).copied().unwrap_or_default();
                pairs.push((token.to_string(), value.to_string()));
                i += 3;
            } else {
                pairs.push((token.to_string(), rest.to_string()));
                i += 2;
            }
        } else {
            i += 1;
        }
    }
    pairs
}

/// Attaches the parser to a running subprocess
pub struct ProgressConsumer<'a> {
    parser: ProgressStreamParser,
    started: Instant,
    on_sample: &'a mut (dyn FnMut(&ProgressSample) + Send),
    events: Arc<dyn EventSink>,
}

impl<'a> ProgressConsumer<'a> {
    pub fn new(
        parser: ProgressStreamParser,
        on_sample: &'a mut (dyn FnMut(&ProgressSample) + Send),
        events: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            parser,
            started: Instant::now(),
            on_sample,
            events,
        }
    }

    pub fn parser(&self) -> &ProgressStreamParser {
        &self.parser
    }

    fn dispatch(&mut self, outputs: Vec<ParserOutput>) {
        for output in outputs {
            match output {
                ParserOutput::Sample(sample) => (self.on_sample)(&sample),
                ParserOutput::Skipped { unit, reason } => {
                    self.events.emit(&PipelineEvent::ProgressUnitSkipped { unit, reason });
                }
            }
        }
    }
}

impl OutputConsumer for ProgressConsumer<'_> {
    fn on_chunk(&mut self, stream: StreamKind, chunk: &[u8]) {
        let outputs = self.parser.feed(stream, chunk, self.started.elapsed());
        self.dispatch(outputs);
    }

    fn on_finish(&mut self) {
        let outputs = self.parser.finish(self.started.elapsed());
        self.dispatch(outputs);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CapturingSink;

    fn samples(outputs: &[ParserOutput]) -> Vec<ProgressSample> {
        outputs
            .iter()
            .filter_map(|o| match o {
                ParserOutput::Sample(s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    fn skipped(outputs: &[ParserOutput]) -> usize {
        outputs.iter().filter(|o| matches!(o, ParserOutput::Skipped { .. })).count()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    #[test]
    fn test_libvmaf_style_units_split_on_carriage_return() {
        let mut parser = ProgressStreamParser::new(1.0);
        let out = parser.feed(StreamKind::Stderr, "10 frames ⠋ 25.00 FPS\r20 frames ⠙ 30.50 FPS\r".as_bytes(), secs(1));
        let got = samples(&out);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].current_frame, 10);
        assert_eq!(got[1].current_frame, 20);
        assert_eq!(got[1].frames_per_second, 30.5);
        assert_eq!(got[1].total_frames, None);
        assert_eq!(got[1].remaining, None);
    }

    #[test]
    fn test_libvmaf_counter_with_erase_line_sequence() {
        let mut parser = ProgressStreamParser::new(1.0);
        parser.set_total_frames(Some(100));
        let out = parser.feed(
            StreamKind::Stderr,
            "\r1 frame  ⠋ 25.00 FPS\x1b[K\r2 frames ⠙ 30.50 FPS\x1b[K\r".as_bytes(),
            secs(1),
        );
        let got = samples(&out);
        assert_eq!(got.len(), 2);
        assert_eq!(got[1].current_frame, 2);
        assert_eq!(got[1].frames_per_second, 30.5);
        assert!(got[1].remaining.is_some());
        assert_eq!(skipped(&out), 0);
    }

    #[test]
    fn test_strip_ansi() {
        assert_eq!(strip_ansi("12 frames ⠋ 3.00 FPS\x1b[K"), "12 frames ⠋ 3.00 FPS");
        assert_eq!(strip_ansi("\x1b[1;32mok\x1b[0m"), "ok");
        assert_eq!(strip_ansi("plain"), "plain");
    }

    #[test]
        fn test_key_value_units_with_blanks_after_equals() {
        let mut parser = ProgressStreamParser::new(1.0);
        let out = parser.feed(
            StreamKind::Stdout,
            b"frame=  120 fps= 40.0 vmaf=93.5 total=240\n",
            secs(3),
        );
        let got = samples(&out);
        assert_eq!(got.len(), 1);
        let sample = &got[0];
        assert_eq!(sample.current_frame, 120);
        assert_eq!(sample.total_frames, Some(240));
        assert_eq!(sample.running_quality, Some(93.5));
        assert_eq!(sample.remaining, Some(Duration::from_secs(3)));
        assert_eq!(sample.percent(), Some(50.0));
    }

    #[test]
    fn test_unit_split_across_chunks() {
        let mut parser = ProgressStreamParser::new(1.0);
        assert!(parser.feed(StreamKind::Stdout, b"frame=4", secs(1)).is_empty());
        let out = parser.feed(StreamKind::Stdout, b"2 fps=10\n", secs(1));
        assert_eq!(samples(&out)[0].current_frame, 42);
    }

    #[test]
    fn test_malformed_unit_is_skipped_and_parsing_continues() {
        let mut parser = ProgressStreamParser::new(1.0);
        let out = parser.feed(
            StreamKind::Stdout,
            b"VMAF version 3.0.0\nframe=abc\n12x frames\nframe=5 fps=10\n",
            secs(1),
        );
        assert_eq!(skipped(&out), 2);
        let got = samples(&out);
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].current_frame, 5);
    }

    #[test]
    fn test_backwards_frame_is_dropped() {
        let mut parser = ProgressStreamParser::new(1.0);
        let out = parser.feed(StreamKind::Stdout, b"frame=10\nframe=7\nframe=10\nframe=11\n", secs(1));
        let frames: Vec<u64> = samples(&out).iter().map(|s| s.current_frame).collect();
        assert_eq!(frames, vec![10, 10, 11]);
        assert_eq!(skipped(&out), 1);
    }

    #[test]
    fn test_structured_payload_stops_sampling() {
        let mut parser = ProgressStreamParser::new(1.0);
        let out = parser.feed(StreamKind::Stdout, b"frame=1\n{\"frames\": [\n", secs(1));
        assert_eq!(samples(&out).len(), 1);

        let out = parser.feed(StreamKind::Stdout, b"frame=2\n]}\n", secs(2));
        assert!(out.is_empty());
        assert_eq!(parser.payload(StreamKind::Stdout).unwrap(), b"{\"frames\": [\nframe=2\n]}\n");

        // the other stream is unaffected
        let out = parser.feed(StreamKind::Stderr, b"frame=3\n", secs(3));
        assert_eq!(samples(&out).len(), 1);
    }

    #[test]
    fn test_overlong_unit_is_dropped_once() {
        let mut parser = ProgressStreamParser::new(1.0);
        let junk = vec![b'x'; MAX_UNIT_BYTES + 10];
        let out = parser.feed(StreamKind::Stdout, &junk, secs(1));
        assert_eq!(skipped(&out), 1);

        let out = parser.feed(StreamKind::Stdout, b"more junk\nframe=9\n", secs(1));
        assert_eq!(skipped(&out), 0);
        assert_eq!(samples(&out)[0].current_frame, 9);
    }

    #[test]
    fn test_finish_flushes_trailing_unit() {
        let mut parser = ProgressStreamParser::new(1.0);
        assert!(parser.feed(StreamKind::Stderr, b"frame=77", secs(1)).is_empty());
        let out = parser.finish(secs(2));
        assert_eq!(samples(&out)[0].current_frame, 77);
    }

    #[test]
    fn test_rate_is_smoothed_not_instantaneous() {
        let mut rate = RateEstimator::new(0.5);
        assert_eq!(rate.update(0, None, secs(0)), 0.0);
        assert_eq!(rate.update(10, None, secs(1)), 10.0);
        // a burst of 30 frames in one second only moves the estimate half way
        assert_eq!(rate.update(40, None, secs(2)), 20.0);
        // same timestamp contributes nothing
        assert_eq!(rate.update(90, None, secs(2)), 20.0);
        assert_eq!(rate.update(100, Some(40.0), secs(3)), 30.0);
    }

    #[test]
    fn test_remaining_time_is_undefined_without_total_or_rate() {
        assert_eq!(remaining_time(None, 10, 5.0), None);
        assert_eq!(remaining_time(Some(100), 10, 0.0), None);
        assert_eq!(remaining_time(Some(100), 50, 10.0), Some(Duration::from_secs(5)));
        assert_eq!(remaining_time(Some(100), 150, 10.0), Some(Duration::ZERO));
    }

    #[test]
    fn test_preset_total_is_used_until_overridden() {
        let mut parser = ProgressStreamParser::new(1.0);
        parser.set_total_frames(Some(100));
        let out = parser.feed(StreamKind::Stdout, b"frame=10 fps=10\nframe=20 fps=10 total=50\n", secs(1));
        let got = samples(&out);
        assert_eq!(got[0].total_frames, Some(100));
        assert_eq!(got[1].total_frames, Some(50));
        assert_eq!(got[1].remaining, Some(Duration::from_secs(3)));

        parser.reset();
        assert_eq!(parser.total_frames(), None);
    }

    #[test]
    fn test_consumer_forwards_samples_and_reports_skips() {
        let sink = Arc::new(CapturingSink::new());
        let mut seen = Vec::new();
        {
            let mut on_sample = |s: &ProgressSample| seen.push(s.current_frame);
            let mut consumer = ProgressConsumer::new(ProgressStreamParser::new(0.3), &mut on_sample, sink.clone());
            consumer.on_chunk(StreamKind::Stdout, b"frame=1\nframe=oops\n");
            consumer.on_chunk(StreamKind::Stdout, b"frame=2");
            consumer.on_finish();
        }
        assert_eq!(seen, vec![1, 2]);
        assert_eq!(sink.count(|e| matches!(e, PipelineEvent::ProgressUnitSkipped { .. })), 1);
    }
}
