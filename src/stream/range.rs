//! Range header parsing and response framing
//!
//! Single-range only. Framing is computed once per request from the metadata
//! snapshot taken at negotiation time.

use tracing::debug;

use crate::config::MultiRangePolicy;
use crate::error::{Result, StreamError};

/// Inclusive, 0-indexed byte span with `start <= end < size`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        if self.is_empty() {
            0
        } else {
            self.end - self.start + 1
        }
    }

    /// True only for a span built with `start > end`
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }
}

/// How a response body is framed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseFraming {
    /// Entire object, 200
    Full { size: u64 },
    /// One span of the object, 206
    Partial { range: ByteRange, size: u64 },
}

impl ResponseFraming {
    pub fn status(&self) -> u16 {
        match self {
            ResponseFraming::Full { .. } => 200,
            ResponseFraming::Partial { .. } => 206,
        }
    }

    pub fn content_length(&self) -> u64 {
        match self {
            ResponseFraming::Full { size } => *size,
            ResponseFraming::Partial { range, .. } => range.len(),
        }
    }

    /// `Content-Range` value for partial responses
    pub fn content_range(&self) -> Option<String> {
        match self {
            ResponseFraming::Full { .. } => None,
            ResponseFraming::Partial { range, size } => {
                Some(format!("bytes {}-{}/{}", range.start, range.end, size))
            }
        }
    }

    /// Span to pull from upstream, `None` for an empty object
    pub fn byte_range(&self) -> Option<ByteRange> {
        match self {
            ResponseFraming::Full { size: 0 } => None,
            ResponseFraming::Full { size } => Some(ByteRange {
                start: 0,
                end: size - 1,
            }),
            ResponseFraming::Partial { range, .. } => Some(*range),
        }
    }
}

/// One `first-last` element of a byte range set, before validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RangeSpec {
    /// `start-end` or `start-`
    FromStart { start: u64, end: Option<u64> },
    /// `-n`
    Suffix(u64),
}

/// Pick the framing for a request
///
/// # Arguments
/// * `range_header` - raw `Range` value, if the request had one
/// * `size` - object size from the metadata snapshot
/// * `multi_range` - what to do with multi-span requests
pub fn negotiate(
    range_header: Option<&str>,
    size: u64,
    multi_range: MultiRangePolicy,
) -> Result<ResponseFraming> {
    let header = match range_header {
        None => return Ok(ResponseFraming::Full { size }),
        Some(h) => h,
    };

    let specs = parse_range_header(header)?;
    if specs.len() > 1 {
        debug!(range = header, policy = ?multi_range, "Multi-range request");
        return match multi_range {
            MultiRangePolicy::Full => Ok(ResponseFraming::Full { size }),
            MultiRangePolicy::Reject => Err(StreamError::BadRequest(
                "multiple ranges are not supported".to_string(),
            )),
        };
    }

    let range = resolve(specs[0], size)?;
    Ok(ResponseFraming::Partial { range, size })
}

/// Syntax check of a `Range` header
///
/// Errors here are malformed requests (400), never unsatisfiable ones.
fn parse_range_header(header: &str) -> Result<Vec<RangeSpec>> {
    let header = header.trim();
    let set = header
        .strip_prefix("bytes=")
        .ok_or_else(|| StreamError::BadRequest(format!("unsupported range unit in {:?}", header)))?;

    let mut specs = Vec::new();
    for part in set.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (first, last) = part
            .split_once('-')
            .ok_or_else(|| StreamError::BadRequest(format!("missing '-' in range {:?}", part)))?;
        let (first, last) = (first.trim(), last.trim());

        let spec = match (first.is_empty(), last.is_empty()) {
            (true, true) => {
                return Err(StreamError::BadRequest(format!("empty range {:?}", part)));
            }
            (true, false) => RangeSpec::Suffix(parse_offset(last)?),
            (false, true) => RangeSpec::FromStart {
                start: parse_offset(first)?,
                end: None,
            },
            (false, false) => RangeSpec::FromStart {
                start: parse_offset(first)?,
                end: Some(parse_offset(last)?),
            },
        };
        specs.push(spec);
    }

    if specs.is_empty() {
        return Err(StreamError::BadRequest("no ranges in header".to_string()));
    }
    Ok(specs)
}

fn parse_offset(raw: &str) -> Result<u64> {
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(StreamError::BadRequest(format!("invalid byte offset {:?}", raw)));
    }
    raw.parse::<u64>()
        .map_err(|_| StreamError::BadRequest(format!("byte offset {:?} out of range", raw)))
}

/// Check a parsed spec against the object size
fn resolve(spec: RangeSpec, size: u64) -> Result<ByteRange> {
    let unsatisfiable = StreamError::RangeNotSatisfiable { size };
    match spec {
        RangeSpec::FromStart { start, end } => {
            let end = end.unwrap_or(size.saturating_sub(1));
            if start >= size || start > end || end >= size {
                return Err(unsatisfiable);
            }
            Ok(ByteRange { start, end })
        }
        RangeSpec::Suffix(n) => {
            if n == 0 || size == 0 {
                return Err(unsatisfiable);
            }
            Ok(ByteRange {
                start: size.saturating_sub(n),
                end: size - 1,
            })
        }
    }
}
