//! Reading a window's piped output log.

use std::{io::SeekFrom, path::Path, sync::LazyLock};

use anyhow::{Context, Result};
use regex::Regex;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

static TERMINAL_ESCAPES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[PX^_][^\x1b]*\x1b\\|\x1b[@-Z\\-_]|\x1b[()][0-9A-Za-z]",
    )
    .expect("escape regex is valid")
});

/// Removes terminal escape sequences and control bytes, normalising carriage
/// returns to newlines.
pub fn strip_ansi(raw: &str) -> String {
    let without_escapes = TERMINAL_ESCAPES.replace_all(raw, "");
    without_escapes
        .replace("\r\n", "\n")
        .replace('\r', "\n")
        .chars()
        .filter(|ch| *ch == '\n' || *ch == '\t' || !ch.is_control())
        .collect()
}

pub fn has_meaningful_content(text: &str) -> bool {
    text.chars().any(char::is_alphanumeric)
}

pub async fn output_len(path: &Path) -> Result<u64> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(metadata.len()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(0),
        Err(error) => Err(error).with_context(|| format!("failed to stat {}", path.display())),
    }
}

async fn read_span(path: &Path, offset: u64, len: u64) -> Result<Vec<u8>> {
    let mut file = tokio::fs::File::open(path)
        .await
        .with_context(|| format!("failed to open {}", path.display()))?;
    file.seek(SeekFrom::Start(offset))
        .await
        .with_context(|| format!("failed to seek {}", path.display()))?;
    let mut buffer = Vec::with_capacity(len as usize);
    file.take(len)
        .read_to_end(&mut buffer)
        .await
        .with_context(|| format!("failed to read {}", path.display()))?;
    Ok(buffer)
}

/// Length of `bytes` without a trailing, unfinished UTF-8 sequence.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let byte = bytes[len - back];
        if byte & 0b1100_0000 == 0b1000_0000 {
            continue;
        }
        let width = match byte {
            0xC0..=0xDF => 2,
            0xE0..=0xEF => 3,
            0xF0..=0xF7 => 4,
            _ => 1,
        };
        return if back < width { len - back } else { len };
    }
    len
}

/// Reads everything after `offset`. Returns the raw text and the end offset.
/// A log shorter than `offset` yields nothing and keeps `offset`. A character
/// still being written is left for the next read.
pub async fn read_output_from(path: &Path, offset: u64) -> Result<(String, u64)> {
    let len = output_len(path).await?;
    if len <= offset {
        return Ok((String::new(), offset));
    }
    let mut buffer = read_span(path, offset, len - offset).await?;
    buffer.truncate(complete_utf8_len(&buffer));
    let end = offset + buffer.len() as u64;
    Ok((String::from_utf8_lossy(&buffer).into_owned(), end))
}

/// Up to `limit` bytes of output ending at `end`, starting on a character
/// boundary.
pub async fn read_output_before(path: &Path, end: u64, limit: u64) -> Result<String> {
    let start = end.saturating_sub(limit);
    if start >= end {
        return Ok(String::new());
    }
    let buffer = read_span(path, start, end - start).await?;
    let skip = buffer
        .iter()
        .take(3)
        .take_while(|byte| **byte & 0b1100_0000 == 0b1000_0000)
        .count();
    Ok(String::from_utf8_lossy(&buffer[skip..]).into_owned())
}

/// Starts a fresh log for a new session.
pub async fn reset_output(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    tokio::fs::write(path, b"")
        .await
        .with_context(|| format!("failed to truncate {}", path.display()))
}
