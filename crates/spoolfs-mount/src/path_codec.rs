//! Reversible encoding of logical paths into cache file names.
//!
//! Data files and sidecars are named after the logical path they cache.
//! The encoding must be free of path separators and unambiguous for
//! arbitrary inputs, so a percent-style byte escape is used: `/`, `%`,
//! control bytes and a leading `.` are written as `%XX`, everything else
//! verbatim. Decoding is exact; the round trip is property-tested.

use std::borrow::Cow;

use thiserror::Error;

/// Suffix of the metadata sidecar next to each data file.
pub const SIDECAR_SUFFIX: &str = ".meta";

fn must_escape(b: u8, first: bool) -> bool {
    b == b'/' || b == b'%' || b < 0x20 || b == 0x7f || (first && b == b'.')
}

/// Encode a logical path into a single filesystem-safe component.
///
/// Only ASCII bytes are ever escaped, so multi-byte UTF-8 sequences pass
/// through untouched and the output is always valid UTF-8.
pub fn encode(path: &str) -> String {
    let mut out = String::with_capacity(path.len() + 8);
    for (i, c) in path.chars().enumerate() {
        if c.is_ascii() && must_escape(c as u8, i == 0) {
            out.push('%');
            out.push_str(&format!("{:02X}", c as u8));
        } else {
            out.push(c);
        }
    }
    out
}

/// Failures decoding a cache file name back into a path.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    /// A `%` escape without two hex digits.
    #[error("truncated escape in {0:?}")]
    Truncated(String),

    /// A `%` escape with non-hex digits.
    #[error("invalid escape %{0}")]
    BadEscape(String),

    /// Decoded bytes are not UTF-8 (encoded names always are).
    #[error("decoded name is not valid UTF-8")]
    NotUtf8,
}

/// Decode a cache file name produced by [`encode`].
pub fn decode(name: &str) -> Result<String, DecodeError> {
    let bytes = name.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let Some(hex) = bytes.get(i + 1..i + 3) else {
                return Err(DecodeError::Truncated(name.to_string()));
            };
            let hex = std::str::from_utf8(hex).map_err(|_| DecodeError::NotUtf8)?;
            let b = u8::from_str_radix(hex, 16)
                .map_err(|_| DecodeError::BadEscape(hex.to_string()))?;
            out.push(b);
            i += 3;
        } else {
            out.push(bytes[i]);
            i += 1;
        }
    }
    String::from_utf8(out).map_err(|_| DecodeError::NotUtf8)
}

/// Strip the sidecar suffix, if present.
pub fn strip_sidecar(name: &str) -> Option<Cow<'_, str>> {
    name.strip_suffix(SIDECAR_SUFFIX).map(Cow::Borrowed)
}
