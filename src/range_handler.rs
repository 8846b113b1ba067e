//! Range Handler Module
//!
//! Parses HTTP Range headers into a validated byte interval against a known
//! object size. Only the single-range `bytes=` form is served; multi-range
//! requests are rejected as unsatisfiable instead of producing multipart bodies.

use crate::error::RangeError;
use tracing::{debug, warn};

/// Closed byte interval `[start, end]` within an object, `start <= end < size`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range (inclusive)
    ///
    /// # Example
    /// ```
    /// # use vault_stream::range_handler::ByteRange;
    /// # let range = ByteRange { start: 0, end: 99 };
    /// # assert_eq!(range.len(), 100);
    /// ```
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Always false for a range produced by the parser
    pub fn is_empty(&self) -> bool {
        self.start > self.end
    }

    /// `Content-Range` header value for a 206 response
    pub fn content_range(&self, total_size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, total_size)
    }

    /// `Range` header value to send upstream
    pub fn to_header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end)
    }
}

/// What the client asked for, resolved against the object size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedRange {
    /// Whole object, served with 200 and no `Content-Range`
    Full,
    /// Sub-range, served with 206
    Partial(ByteRange),
}

impl RequestedRange {
    /// Number of body bytes the response will carry
    pub fn body_len(&self, total_size: u64) -> u64 {
        match self {
            RequestedRange::Full => total_size,
            RequestedRange::Partial(range) => range.len(),
        }
    }

    /// The explicit interval, if any
    pub fn byte_range(&self) -> Option<ByteRange> {
        match self {
            RequestedRange::Full => None,
            RequestedRange::Partial(range) => Some(*range),
        }
    }
}

/// `Content-Range` header value for a 416 response
pub fn unsatisfied_content_range(total_size: u64) -> String {
    format!("bytes */{}", total_size)
}

/// Outcome of parsing one `start-end` spec before validation against the size
enum SpecSyntax {
    /// `start-end` or `start-` (end `None`)
    FromStart { start: u64, end: Option<u64> },
    /// `-N`
    Suffix(u64),
}

/// Parse a Range header against a known object size.
///
/// - No header → [`RequestedRange::Full`].
/// - Syntactically malformed header (wrong unit, non-numeric bounds,
///   `start > end`) → ignored, [`RequestedRange::Full`].
/// - More than one range → [`RangeError::Unsatisfiable`].
/// - `start >= total_size` or a zero-length suffix → [`RangeError::Unsatisfiable`].
/// - `end >= total_size` is clamped to `total_size - 1`.
pub fn parse_range_header(
    range_header: Option<&str>,
    total_size: u64,
) -> std::result::Result<RequestedRange, RangeError> {
    let range_header = match range_header {
        Some(value) => value.trim(),
        None => return Ok(RequestedRange::Full),
    };

    debug!("Parsing Range header: {}", range_header);

    let specs = match range_header.strip_prefix("bytes=") {
        Some(specs) => specs,
        None => {
            warn!("Ignoring Range header with unsupported unit: {}", range_header);
            return Ok(RequestedRange::Full);
        }
    };

    let parts: Vec<&str> = specs.split(',').map(str::trim).collect();
    if parts.len() > 1 {
        debug!("Rejecting multi-range request: {}", range_header);
        return Err(RangeError::Unsatisfiable { total_size });
    }

    let syntax = match parse_single_range_spec(parts[0]) {
        Some(syntax) => syntax,
        None => {
            warn!("Ignoring malformed Range header: {}", range_header);
            return Ok(RequestedRange::Full);
        }
    };

    match syntax {
        SpecSyntax::FromStart { start, end } => {
            if start >= total_size {
                return Err(RangeError::Unsatisfiable { total_size });
            }
            let last = total_size - 1;
            let end = end.map_or(last, |end| end.min(last));
            Ok(RequestedRange::Partial(ByteRange { start, end }))
        }
        SpecSyntax::Suffix(suffix) => {
            if suffix == 0 || total_size == 0 {
                return Err(RangeError::Unsatisfiable { total_size });
            }
            Ok(RequestedRange::Partial(ByteRange {
                start: total_size.saturating_sub(suffix),
                end: total_size - 1,
            }))
        }
    }
}

/// Parse a single `start-end`, `start-` or `-suffix` spec.
/// Returns `None` when the spec is not syntactically valid.
fn parse_single_range_spec(range_spec: &str) -> Option<SpecSyntax> {
    let (start_str, end_str) = range_spec.split_once('-')?;
    let start_str = start_str.trim();
    let end_str = end_str.trim();

    match (start_str.is_empty(), end_str.is_empty()) {
        (false, false) => {
            let start = parse_position(start_str)?;
            let end = parse_position(end_str)?;
            if start > end {
                return None;
            }
            Some(SpecSyntax::FromStart {
                start,
                end: Some(end),
            })
        }
        (false, true) => Some(SpecSyntax::FromStart {
            start: parse_position(start_str)?,
            end: None,
        }),
        (true, false) => Some(SpecSyntax::Suffix(parse_position(end_str)?)),
        (true, true) => None,
    }
}

/// Digits only: `u64::from_str` would also accept a leading `+`
fn parse_position(value: &str) -> Option<u64> {
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    value.parse::<u64>().ok()
}
