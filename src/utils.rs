//! # Utility Functions Module
//!
//! Small helpers shared by the stages and the CLI: argument vector building
//! for subprocesses, human-readable sizes and durations, and stderr excerpts.

use std::time::Duration;

/// Converts any iterable of string-like items to `Vec<String>`.
///
/// Used to build subprocess argument vectors without repeating `.to_string()`.
///
/// # Example
/// ```rust
/// use video_quality_analyzer::utils::to_string_vec;
///
/// let threads = 4;
/// let args = to_string_vec(["--threads", &threads.to_string(), "--json"]);
/// assert_eq!(args, vec!["--threads", "4", "--json"]);
/// ```
pub fn to_string_vec<T, I>(items: I) -> Vec<String>
where
    T: ToString,
    I: IntoIterator<Item = T>,
{
    items.into_iter().map(|item| item.to_string()).collect()
}

/// Macro for building argument vectors from mixed types.
///
/// # Example
/// ```rust
/// use video_quality_analyzer::args;
///
/// let args = args!["-pix_fmt", "yuv420p", "-y"];
/// assert_eq!(args.len(), 3);
/// ```
#[macro_export]
macro_rules! args {
    [$($item:expr),* $(,)?] => {
        $crate::utils::to_string_vec([$($item.to_string()),*])
    };
}

/// Format a byte count in binary units
pub fn format_size(size: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = size as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", size as u64, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Format a duration as `h:mm:ss`, or `m:ss` under one hour
pub fn format_duration(duration: Duration) -> String {
    let total = duration.as_secs();
    let (hours, minutes, seconds) = (total / 3600, (total % 3600) / 60, total % 60);
    if hours > 0 {
        format!("{}:{:02}:{:02}", hours, minutes, seconds)
    } else {
        format!("{}:{:02}", minutes, seconds)
    }
}

/// Last `max_bytes` of a byte buffer, lossily decoded and trimmed.
///
/// The cut is moved forward to a char boundary so the excerpt never starts
/// with a replacement character from a split UTF-8 sequence.
pub fn lossy_tail(bytes: &[u8], max_bytes: usize) -> String {
    let start = bytes.len().saturating_sub(max_bytes);
    let mut tail = &bytes[start..];
    if start > 0 {
        // skip UTF-8 continuation bytes
        let skip = tail.iter().take(3).take_while(|b| (**b & 0xC0) == 0x80).count();
        tail = &tail[skip..];
    }
    String::from_utf8_lossy(tail).trim().to_string()
}
