//! Newline-delimited JSON, as spoken by the RPC helper on its stdio and as
//! printed by container CLIs run with `--format '{{json .}}'`.

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

pub const MAX_LINE_BYTES: usize = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("line {line} is {size} bytes, over the {max} byte limit")]
    TooLong { line: usize, size: usize, max: usize },
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("line {line}: {message}")]
    Decode { line: usize, message: String },
}

/// Serializes `value` as one line, newline included.
pub fn encode_line<T: Serialize>(value: &T) -> Result<Vec<u8>, FrameError> {
    let mut encoded =
        serde_json::to_vec(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > MAX_LINE_BYTES {
        return Err(FrameError::TooLong {
            line: 1,
            size: encoded.len(),
            max: MAX_LINE_BYTES,
        });
    }
    encoded.push(b'\n');
    Ok(encoded)
}

/// Decodes one line. Blank lines yield `None`; `line` numbers the error.
pub fn decode_line<T: DeserializeOwned>(raw: &str, line: usize) -> Option<Result<T, FrameError>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if trimmed.len() > MAX_LINE_BYTES {
        return Some(Err(FrameError::TooLong {
            line,
            size: trimmed.len(),
            max: MAX_LINE_BYTES,
        }));
    }
    Some(serde_json::from_str(trimmed).map_err(|err| FrameError::Decode {
        line,
        message: err.to_string(),
    }))
}

/// Rows that decoded, and one error for each non-blank line that did not.
#[derive(Debug, Clone)]
pub struct JsonLines<T> {
    pub rows: Vec<T>,
    pub rejected: Vec<FrameError>,
}

pub fn parse_json_lines<T: DeserializeOwned>(input: &str) -> JsonLines<T> {
    let mut parsed = JsonLines {
        rows: Vec::new(),
        rejected: Vec::new(),
    };
    for (index, raw) in input.lines().enumerate() {
        match decode_line(raw, index + 1) {
            Some(Ok(row)) => parsed.rows.push(row),
            Some(Err(err)) => parsed.rejected.push(err),
            None => {}
        }
    }
    parsed
}
