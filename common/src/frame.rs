use std::path::{Path, PathBuf};

use bytes::{BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use tokio::time::Instant;

/// One decoded, validated image ready for streaming.
///
/// Frames are immutable once built. The cache hands them out as `Arc<Frame>`
/// and the payload is a reference-counted `Bytes`, so sessions never copy
/// the image data.
#[derive(Debug, Clone)]
pub struct Frame {
    payload: Bytes,
    sequence: u64,
    published_at: Instant,
    published_wall: DateTime<Utc>,
    origin: Option<PathBuf>,
}

impl Frame {
    /// Create a frame stamped with the current time.
    pub fn new(payload: impl Into<Bytes>, sequence: u64) -> Self {
        Self::with_timestamp(payload, sequence, Instant::now())
    }

    /// Create a frame with an explicit monotonic publish time.
    ///
    /// The wall-clock time is back-dated by however long ago `published_at`
    /// was; an instant in the future maps to now.
    pub fn with_timestamp(payload: impl Into<Bytes>, sequence: u64, published_at: Instant) -> Self {
        let age = Instant::now().saturating_duration_since(published_at);
        let published_wall =
            Utc::now() - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        Self {
            payload: payload.into(),
            sequence,
            published_at,
            published_wall,
            origin: None,
        }
    }

    /// Record the producer file this frame was decoded from.
    pub fn with_origin(mut self, path: impl Into<PathBuf>) -> Self {
        self.origin = Some(path.into());
        self
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    pub fn published_at(&self) -> Instant {
        self.published_at
    }

    pub fn published_wall(&self) -> DateTime<Utc> {
        self.published_wall
    }

    pub fn origin(&self) -> Option<&Path> {
        self.origin.as_deref()
    }
}

// -- Multipart framing ---------------------------------------------------------

/// MIME type of every payload served by the stream.
pub const PART_CONTENT_TYPE: &str = "image/jpeg";

/// `Content-Type` header value for a `multipart/x-mixed-replace` response.
pub fn stream_content_type(boundary: &str) -> String {
    format!("multipart/x-mixed-replace; boundary={boundary}")
}

/// Encode one multipart part.
///
/// Layout:
///   --{boundary}\r\n
///   Content-Type: image/jpeg\r\n
///   Content-Length: {n}\r\n
///   \r\n
///   {n payload bytes}\r\n
pub fn encode_part(boundary: &str, payload: &[u8]) -> Bytes {
    let header = format!(
        "--{boundary}\r\nContent-Type: {PART_CONTENT_TYPE}\r\nContent-Length: {len}\r\n\r\n",
        len = payload.len()
    );
    let mut buf = BytesMut::with_capacity(header.len() + payload.len() + 2);
    buf.put_slice(header.as_bytes());
    buf.put_slice(payload);
    buf.put_slice(b"\r\n");
    buf.freeze()
}

/// A multipart part split back into its pieces.
#[derive(Debug, PartialEq, Eq)]
pub struct DecodedPart<'a> {
    pub content_type: &'a str,
    pub content_length: usize,
    pub body: &'a [u8],
}

/// Parse a single part produced by [`encode_part`], checking that the declared
/// length matches the body.
pub fn decode_part<'a>(boundary: &str, part: &'a [u8]) -> Result<DecodedPart<'a>, PartError> {
    let delimiter = format!("--{boundary}\r\n");
    let rest = part
        .strip_prefix(delimiter.as_bytes())
        .ok_or(PartError::MissingBoundary)?;

    let header_end = find_subsequence(rest, b"\r\n\r\n").ok_or(PartError::MissingHeaderEnd)?;
    let headers = std::str::from_utf8(&rest[..header_end]).map_err(|_| PartError::BadHeader)?;
    let body_with_crlf = &rest[header_end + 4..];

    let mut content_type = None;
    let mut content_length = None;
    for line in headers.split("\r\n") {
        let (name, value) = line.split_once(':').ok_or(PartError::BadHeader)?;
        let value = value.trim();
        if name.eq_ignore_ascii_case("content-type") {
            content_type = Some(value);
        } else if name.eq_ignore_ascii_case("content-length") {
            content_length = Some(value.parse::<usize>().map_err(|_| PartError::BadHeader)?);
        }
    }
    let content_type = content_type.ok_or(PartError::BadHeader)?;
    let content_length = content_length.ok_or(PartError::BadHeader)?;

    let body = body_with_crlf
        .strip_suffix(b"\r\n")
        .ok_or(PartError::MissingTrailer)?;
    if body.len() != content_length {
        return Err(PartError::LengthMismatch {
            declared: content_length,
            actual: body.len(),
        });
    }

    Ok(DecodedPart {
        content_type,
        content_length,
        body,
    })
}

/// Find the position of `needle` in `haystack`.
fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PartError {
    #[error("part does not start with the boundary delimiter")]
    MissingBoundary,
    #[error("part headers are not terminated")]
    MissingHeaderEnd,
    #[error("malformed part header")]
    BadHeader,
    #[error("part body is not followed by CRLF")]
    MissingTrailer,
    #[error("declared Content-Length {declared} but body has {actual} bytes")]
    LengthMismatch { declared: usize, actual: usize },
}
