//! `Range` header parsing.
//!
//! Standard `bytes=` range semantics: explicit windows are clamped to the
//! entity size, suffix ranges select the last N bytes, and a syntactically
//! valid header whose ranges all fall past the end is distinguished as
//! [`RangeError::NoOverlap`] so the caller can answer 416 with
//! `Content-Range: bytes */<size>`.

use std::fmt;

/// An inclusive byte window within an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpRange {
    pub start: i64,
    pub end: i64,
}

/// Why a Range header could not be used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RangeError {
    /// Header is not a well-formed byte-range set
    Malformed,
    /// Well-formed, but no range overlaps the entity
    NoOverlap,
}

impl fmt::Display for RangeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RangeError::Malformed => write!(f, "invalid range"),
            RangeError::NoOverlap => write!(f, "invalid range: failed to overlap"),
        }
    }
}

/// Parse a `Range` header against an entity of `size` bytes.
///
/// Returns at least one range on success; rejecting multi-range requests is
/// the caller's policy decision.
pub fn parse(header: &str, size: i64) -> Result<Vec<HttpRange>, RangeError> {
    let spec = header
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?;

    let mut ranges = Vec::new();
    let mut no_overlap = false;

    for piece in spec.split(',') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (start_text, end_text) = piece.split_once('-').ok_or(RangeError::Malformed)?;
        let (start_text, end_text) = (start_text.trim(), end_text.trim());

        if start_text.is_empty() {
            // Suffix range: the final N bytes
            let suffix: i64 = end_text.parse().map_err(|_| RangeError::Malformed)?;
            if suffix < 0 {
                return Err(RangeError::Malformed);
            }
            let suffix = suffix.min(size);
            if suffix == 0 {
                no_overlap = true;
                continue;
            }
            ranges.push(HttpRange {
                start: size - suffix,
                end: size - 1,
            });
        } else {
            let start: i64 = start_text.parse().map_err(|_| RangeError::Malformed)?;
            if start < 0 {
                return Err(RangeError::Malformed);
            }
            if start >= size {
                no_overlap = true;
                continue;
            }
            let end = if end_text.is_empty() {
                size - 1
            } else {
                let end: i64 = end_text.parse().map_err(|_| RangeError::Malformed)?;
                if end < start {
                    return Err(RangeError::Malformed);
                }
                end.min(size - 1)
            };
            ranges.push(HttpRange { start, end });
        }
    }

    if ranges.is_empty() {
        return Err(if no_overlap {
            RangeError::NoOverlap
        } else {
            RangeError::Malformed
        });
    }
    Ok(ranges)
}
