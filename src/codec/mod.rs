//! Wire codec: request/response framing with YAML front-matter (spec §4.A).
//!
//! A request is one line — `VERB PATH\n` — optionally followed by a
//! `---`-delimited YAML block, optionally followed by a body (PUBLISH only).
//! A response is always `---\n<yaml>\n---\n<body>`.

use std::collections::BTreeMap;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::status::Status;

/// Hard cap on the request line, per spec §4.A.
pub const MAX_LINE_BYTES: usize = 4096;
/// Hard cap on the YAML front-matter block, per spec §4.A.
pub const MAX_FRONTMATTER_BYTES: usize = 65536;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("request line exceeds {MAX_LINE_BYTES} bytes")]
    LineTooLong,
    #[error("front-matter exceeds {MAX_FRONTMATTER_BYTES} bytes")]
    FrontMatterTooLong,
    #[error("malformed or non-flat front-matter")]
    InvalidYaml,
    #[error("unknown or missing verb")]
    BadVerb,
    #[error("path must start with '/' and contain no control characters")]
    BadPath,
    #[error("stream ended before a complete request was read")]
    UnexpectedEof,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verb {
    Fetch,
    List,
    Versions,
    Publish,
    Archive,
}

impl Verb {
    pub fn as_str(self) -> &'static str {
        match self {
            Verb::Fetch => "FETCH",
            Verb::List => "LIST",
            Verb::Versions => "VERSIONS",
            Verb::Publish => "PUBLISH",
            Verb::Archive => "ARCHIVE",
        }
    }

    fn parse(s: &str) -> Result<Verb, CodecError> {
        match s {
            "FETCH" => Ok(Verb::Fetch),
            "LIST" => Ok(Verb::List),
            "VERSIONS" => Ok(Verb::Versions),
            "PUBLISH" => Ok(Verb::Publish),
            "ARCHIVE" => Ok(Verb::Archive),
            _ => Err(CodecError::BadVerb),
        }
    }
}

/// A decoded request (spec §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub verb: Verb,
    pub path: String,
    pub metadata: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// A response ready to be written back to the stream (spec §3, §4.A).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: Status,
    pub metadata: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn new(status: Status) -> Self {
        Self {
            status,
            metadata: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    pub fn with_meta(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Vec<u8>) -> Self {
        self.body = body;
        self
    }

    /// Serializes this response to its full wire form: `---\n<yaml>---\n<body>`.
    ///
    /// Metadata values are opaque strings the codec never coerces (spec
    /// §4.A), so this writes plain `key: value` lines by hand rather than
    /// going through a general YAML serializer — there is no quoting or
    /// type-inference concern to delegate, since every value we ever emit
    /// (hex digests, decimal versions, RFC3339 timestamps, "true"/"false")
    /// is colon- and newline-free.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(32 + self.body.len());
        out.extend_from_slice(b"---\n");
        out.extend_from_slice(format!("status: {}\n", self.status.as_str()).as_bytes());
        for (k, v) in &self.metadata {
            out.extend_from_slice(format!("{k}: {v}\n").as_bytes());
        }
        out.extend_from_slice(b"---\n");
        out.extend_from_slice(&self.body);
        out
    }
}

/// A response as reconstructed by a lenient reader; unlike [`Response`] its
/// status may be absent, per spec §4.A's fallback rule for unframed input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedResponse {
    pub status: Option<Status>,
    pub metadata: BTreeMap<String, String>,
    pub body: Vec<u8>,
}

/// Parses the raw bytes of a response. A buffer with no opening `---` is
/// treated as an entirely-body response with empty status and metadata.
pub fn decode_response(bytes: &[u8]) -> ParsedResponse {
    let first_nl = bytes.iter().position(|&b| b == b'\n');
    let (first_line, rest_start) = match first_nl {
        Some(idx) => (&bytes[..idx], idx + 1),
        None => (bytes, bytes.len()),
    };
    let first_line = strip_cr(first_line);

    if first_line != b"---" {
        return ParsedResponse {
            status: None,
            metadata: BTreeMap::new(),
            body: bytes.to_vec(),
        };
    }

    let remainder = &bytes[rest_start..];
    let Some(close_idx) = find_closing_delimiter(remainder) else {
        return ParsedResponse {
            status: None,
            metadata: BTreeMap::new(),
            body: bytes.to_vec(),
        };
    };
    let yaml_bytes = &remainder[..close_idx.yaml_end];
    let body = remainder[close_idx.body_start..].to_vec();

    let map = match parse_flat_yaml(yaml_bytes) {
        Ok(m) => m,
        Err(_) => BTreeMap::new(),
    };
    let mut metadata = map;
    let status = metadata.remove("status").map(|s| Status::parse(&s));

    ParsedResponse {
        status,
        metadata,
        body,
    }
}

struct ClosingDelimiter {
    yaml_end: usize,
    body_start: usize,
}

/// Scans `buf` line-by-line for a line that is exactly `---`, returning the
/// offset of the yaml block's end and where the body starts right after it.
fn find_closing_delimiter(buf: &[u8]) -> Option<ClosingDelimiter> {
    let mut pos = 0usize;
    while pos <= buf.len() {
        let line_end = buf[pos..].iter().position(|&b| b == b'\n').map(|i| pos + i);
        let (line, next) = match line_end {
            Some(idx) => (&buf[pos..idx], idx + 1),
            None => (&buf[pos..], buf.len()),
        };
        if strip_cr(line) == b"---" {
            return Some(ClosingDelimiter {
                yaml_end: pos,
                body_start: next,
            });
        }
        if line_end.is_none() {
            return None;
        }
        pos = next;
    }
    None
}

fn strip_cr(line: &[u8]) -> &[u8] {
    if line.last() == Some(&b'\r') {
        &line[..line.len() - 1]
    } else {
        line
    }
}

/// Parses a flat `key: value` block, one mapping entry per line, rejecting
/// any nested structure, list, or non-string value (spec §4.A). Duplicate
/// keys take the last value, since later `insert`s into the `BTreeMap`
/// simply overwrite earlier ones.
fn parse_flat_yaml(buf: &[u8]) -> Result<BTreeMap<String, String>, CodecError> {
    let text = std::str::from_utf8(buf).map_err(|_| CodecError::InvalidYaml)?;
    let mut out = BTreeMap::new();
    for line in text.split('\n') {
        if line.is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') || line.starts_with('-') {
            // Indentation or a list marker means this isn't a flat mapping.
            return Err(CodecError::InvalidYaml);
        }
        let (key, value) = line.split_once(':').ok_or(CodecError::InvalidYaml)?;
        let key = key.trim();
        if key.is_empty() {
            return Err(CodecError::InvalidYaml);
        }
        let value = unquote(value.trim());
        out.insert(key.to_string(), value.to_string());
    }
    Ok(out)
}

/// Strips one layer of matching single or double quotes, the common YAML
/// scalar quoting style, leaving unquoted text untouched.
fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if (first == b'"' && last == b'"') || (first == b'\'' && last == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}

fn validate_path(path: &str) -> Result<(), CodecError> {
    if !path.starts_with('/') {
        return Err(CodecError::BadPath);
    }
    if path.bytes().any(|b| b == 0x00 || (b < 0x20 && b != 0x09) || b == 0x7f) {
        return Err(CodecError::BadPath);
    }
    Ok(())
}

/// Reads one LF-terminated line, capped at `cap` bytes. Returns `None` if the
/// stream hit EOF before any byte was read.
async fn read_line_capped<R: AsyncRead + Unpin>(
    reader: &mut R,
    cap: usize,
) -> Result<Option<Vec<u8>>, CodecError> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        let n = reader.read(&mut byte).await?;
        if n == 0 {
            if line.is_empty() {
                return Ok(None);
            }
            break;
        }
        if byte[0] == b'\n' {
            break;
        }
        line.push(byte[0]);
        if line.len() > cap {
            return Err(CodecError::LineTooLong);
        }
    }
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Result of peeking for the `---\n` front-matter sentinel one byte at a
/// time. Body content has no line-length limit, so this can't be done with
/// [`read_line_capped`] — a request whose body starts with a long unbroken
/// run of bytes would otherwise be mistaken for an oversized front-matter
/// line.
enum SentinelPeek {
    Open,
    /// The sentinel wasn't there; these are the bytes already consumed
    /// while checking, which belong at the front of whatever comes next.
    Absent(Vec<u8>),
}

async fn peek_frontmatter_sentinel<R: AsyncRead + Unpin>(
    reader: &mut R,
) -> Result<SentinelPeek, CodecError> {
    const SENTINEL: &[u8] = b"---\n";
    let mut consumed = Vec::with_capacity(SENTINEL.len());
    for &expected in SENTINEL {
        let mut byte = [0u8; 1];
        let n = reader.read(&mut byte).await?;
        if n == 0 || byte[0] != expected {
            if n != 0 {
                consumed.push(byte[0]);
            }
            return Ok(SentinelPeek::Absent(consumed));
        }
        consumed.push(byte[0]);
    }
    Ok(SentinelPeek::Open)
}

/// Reads and validates a request from a QUIC stream (or anything else that
/// implements `AsyncRead`). `max_body_bytes` bounds how much of a PUBLISH
/// body is buffered before the store's own size check runs.
pub async fn read_request<R: AsyncRead + Unpin>(
    reader: &mut R,
    max_body_bytes: usize,
) -> Result<Request, CodecError> {
    let line = read_line_capped(reader, MAX_LINE_BYTES)
        .await?
        .ok_or(CodecError::UnexpectedEof)?;
    let line = std::str::from_utf8(&line).map_err(|_| CodecError::BadVerb)?;
    let (verb_str, path) = line.split_once(' ').ok_or(CodecError::BadVerb)?;
    let verb = Verb::parse(verb_str)?;
    validate_path(path)?;
    let path = path.to_string();

    let mut metadata = BTreeMap::new();
    let mut leading_body_bytes = Vec::new();

    match peek_frontmatter_sentinel(reader).await? {
        SentinelPeek::Open => {
            let mut yaml_buf = Vec::new();
            let mut total = 0usize;
            loop {
                let fm_line = read_line_capped(reader, MAX_FRONTMATTER_BYTES)
                    .await?
                    .ok_or(CodecError::UnexpectedEof)?;
                if fm_line == b"---" {
                    break;
                }
                total += fm_line.len() + 1;
                if total > MAX_FRONTMATTER_BYTES {
                    return Err(CodecError::FrontMatterTooLong);
                }
                yaml_buf.extend_from_slice(&fm_line);
                yaml_buf.push(b'\n');
            }
            metadata = parse_flat_yaml(&yaml_buf)?;
        }
        SentinelPeek::Absent(bytes) => leading_body_bytes = bytes,
    }

    let body = if verb == Verb::Publish {
        let mut buf = leading_body_bytes;
        let remaining_cap = (max_body_bytes + 1).saturating_sub(buf.len());
        let mut limited = reader.take(remaining_cap as u64);
        limited.read_to_end(&mut buf).await?;
        buf
    } else {
        Vec::new()
    };

    Ok(Request {
        verb,
        path,
        metadata,
        body,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    async fn parse(bytes: &[u8]) -> Result<Request, CodecError> {
        let mut cursor = Cursor::new(bytes.to_vec());
        read_request(&mut cursor, 10 * 1024 * 1024).await
    }

    #[tokio::test]
    async fn parses_fetch_without_frontmatter() {
        let req = parse(b"FETCH /a.md\n").await.unwrap();
        assert_eq!(req.verb, Verb::Fetch);
        assert_eq!(req.path, "/a.md");
        assert!(req.metadata.is_empty());
        assert!(req.body.is_empty());
    }

    #[tokio::test]
    async fn parses_publish_with_frontmatter_and_body() {
        let req = parse(b"PUBLISH /a.md\n---\nauth: tok123\n---\n# Hi").await.unwrap();
        assert_eq!(req.verb, Verb::Publish);
        assert_eq!(req.metadata.get("auth").map(String::as_str), Some("tok123"));
        assert_eq!(req.body, b"# Hi");
    }

    #[tokio::test]
    async fn rejects_unknown_verb() {
        assert!(matches!(parse(b"DELETE /a.md\n").await, Err(CodecError::BadVerb)));
    }

    #[tokio::test]
    async fn rejects_path_without_leading_slash() {
        assert!(matches!(parse(b"FETCH a.md\n").await, Err(CodecError::BadPath)));
    }

    #[tokio::test]
    async fn rejects_control_characters_in_path() {
        let mut line = b"FETCH /a\x01.md\n".to_vec();
        let mut cursor = Cursor::new(std::mem::take(&mut line));
        assert!(matches!(
            read_request(&mut cursor, 1024).await,
            Err(CodecError::BadPath)
        ));
    }

    #[tokio::test]
    async fn rejects_oversized_request_line() {
        let mut line = b"FETCH /".to_vec();
        line.extend(std::iter::repeat(b'a').take(MAX_LINE_BYTES + 10));
        line.push(b'\n');
        assert!(matches!(parse(&line).await, Err(CodecError::LineTooLong)));
    }

    #[tokio::test]
    async fn rejects_oversized_frontmatter() {
        let mut msg = b"PUBLISH /a.md\n---\n".to_vec();
        for i in 0..2000 {
            msg.extend_from_slice(format!("k{i}: {}\n", "v".repeat(40)).as_bytes());
        }
        msg.extend_from_slice(b"---\nbody");
        assert!(matches!(
            parse(&msg).await,
            Err(CodecError::FrontMatterTooLong)
        ));
    }

    #[tokio::test]
    async fn rejects_nested_frontmatter_value() {
        let msg = b"PUBLISH /a.md\n---\nauth:\n  nested: true\n---\nbody";
        assert!(matches!(parse(msg).await, Err(CodecError::InvalidYaml)));
    }

    #[test]
    fn response_round_trips_through_encode_decode() {
        let resp = Response::new(Status::Ok)
            .with_meta("version", "3")
            .with_meta("etag", "abc123")
            .with_body(b"# Hello".to_vec());
        let encoded = resp.encode();
        let parsed = decode_response(&encoded);
        assert_eq!(parsed.status, Some(Status::Ok));
        assert_eq!(parsed.metadata.get("version").map(String::as_str), Some("3"));
        assert_eq!(parsed.metadata.get("etag").map(String::as_str), Some("abc123"));
        assert_eq!(parsed.body, b"# Hello");
    }

    #[test]
    fn response_without_delimiter_is_treated_as_pure_body() {
        let parsed = decode_response(b"just some text\nmore text");
        assert_eq!(parsed.status, None);
        assert!(parsed.metadata.is_empty());
        assert_eq!(parsed.body, b"just some text\nmore text");
    }

    #[test]
    fn duplicate_frontmatter_keys_take_last_value() {
        let map = parse_flat_yaml(b"k: one\nk: two\n").unwrap();
        assert_eq!(map.get("k").map(String::as_str), Some("two"));
    }
}
