//! Y4M (YUV4MPEG2) header probe.
//!
//! The intermediates are raw planar frames behind a one-line stream header,
//! so the frame count follows from the file size once the frame size is known.

use std::io;
use std::path::Path;

use tokio::io::AsyncReadExt;

const SIGNATURE: &[u8] = b"YUV4MPEG2 ";
const MAX_HEADER_BYTES: usize = 1024;
/// `FRAME\n` before every frame (no per-frame parameters)
const FRAME_HEADER_BYTES: u64 = 6;

/// Parsed stream header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Y4mHeader {
    pub width: u64,
    pub height: u64,
    /// Colorspace tag, `420jpeg` when absent
    pub colorspace: String,
    /// Header length including the trailing newline
    pub header_len: u64,
}

impl Y4mHeader {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if !bytes.starts_with(SIGNATURE) {
            return None;
        }
        let end = bytes.iter().position(|b| *b == b'\n')?;
        let line = std::str::from_utf8(&bytes[SIGNATURE.len()..end]).ok()?;

        let mut width = None;
        let mut height = None;
        let mut colorspace = "420jpeg".to_string();
        for token in line.split_ascii_whitespace() {
            let Some(tag) = token.get(..1) else {
                continue;
            };
            let value = &token[1..];
            match tag {
                "W" => width = value.parse::<u64>().ok(),
                "H" => height = value.parse::<u64>().ok(),
                "C" => colorspace = value.to_string(),
                _ => {}
            }
        }

        Some(Self {
            width: width.filter(|w| *w > 0)?,
            height: height.filter(|h| *h > 0)?,
            colorspace,
            header_len: end as u64 + 1,
        })
    }

    /// Bytes of pixel data in one frame
    pub fn frame_size(&self) -> Option<u64> {
        let cs = self.colorspace.as_str();
        let bytes_per_sample = if cs.contains("p10") || cs.contains("p12") || cs.contains("p16") { 2 } else { 1 };
        let (w, h) = (self.width, self.height);
        let luma = w.checked_mul(h)?;
        let half = |v: u64| v / 2 + v % 2;
        let chroma = |cw: u64, ch: u64| -> Option<u64> { cw.checked_mul(ch)?.checked_mul(2) };

        let samples = if cs.starts_with("420") {
            luma.checked_add(chroma(half(w), half(h))?)?
        } else if cs.starts_with("422") {
            luma.checked_add(chroma(half(w), h)?)?
        } else if cs == "444alpha" {
            luma.checked_mul(4)?
        } else if cs.starts_with("444") {
            luma.checked_mul(3)?
        } else if cs.starts_with("411") {
            luma.checked_add(chroma(w / 4 + u64::from(w % 4 != 0), h)?)?
        } else if cs.starts_with("mono") {
            luma
        } else {
            return None;
        };
        samples.checked_mul(bytes_per_sample)
    }

    /// Frames in a file of `file_size` bytes
    pub fn frame_count(&self, file_size: u64) -> Option<u64> {
        let per_frame = self.frame_size()?.checked_add(FRAME_HEADER_BYTES)?;
        Some(file_size.saturating_sub(self.header_len) / per_frame)
    }
}

/// Number of frames in a Y4M file; `None` when it is not a readable Y4M stream
pub async fn probe_frame_count(path: &Path) -> io::Result<Option<u64>> {
    let mut file = tokio::fs::File::open(path).await?;
    let file_size = file.metadata().await?.len();

    let mut head = vec![0u8; MAX_HEADER_BYTES.min(file_size as usize)];
    let mut filled = 0;
    while filled < head.len() {
        let n = file.read(&mut head[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    head.truncate(filled);

    Ok(Y4mHeader::parse(&head).and_then(|h| h.frame_count(file_size)))
}
