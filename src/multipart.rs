use bytes::Bytes;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MultipartError {
    #[error("Missing boundary parameter in content type: {0}")]
    MissingBoundary(String),

    #[error("Malformed multipart body: {0}")]
    MalformedBody(String),

    #[error("Invalid part header: {0}")]
    InvalidHeader(String),
}

/// Content type assumed for parts that do not declare one
pub const DEFAULT_PART_CONTENT_TYPE: &str = "application/octet-stream";

/// A single body part: its header block and raw content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Part {
    pub headers: Vec<(String, String)>,
    pub content: Bytes,
}

impl Part {
    pub fn new(headers: Vec<(String, String)>, content: impl Into<Bytes>) -> Self {
        Self {
            headers,
            content: content.into(),
        }
    }

    /// Build a form-data part whose name and filename are both `name`
    pub fn form_data(name: &str, content_type: &str, content: impl Into<Bytes>) -> Self {
        Self::new(
            vec![
                (
                    "Content-Disposition".to_string(),
                    format!("form-data; name=\"{}\"; filename=\"{}\"", name, name),
                ),
                ("Content-Type".to_string(), content_type.to_string()),
            ],
            content,
        )
    }

    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("Content-Type")
            .unwrap_or(DEFAULT_PART_CONTENT_TYPE)
    }

    /// The `name` parameter of the Content-Disposition header
    pub fn name(&self) -> Option<&str> {
        self.header("Content-Disposition")
            .and_then(|value| header_param(value, "name"))
    }

    /// The Content-ID header with its angle brackets removed
    pub fn content_id(&self) -> Option<&str> {
        self.header("Content-ID").map(|value| {
            value
                .trim()
                .trim_start_matches('<')
                .trim_end_matches('>')
        })
    }

    pub fn is_json(&self) -> bool {
        self.content_type()
            .trim_start()
            .to_ascii_lowercase()
            .starts_with("application/json")
    }
}

/// An ordered sequence of parts
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MultipartMessage {
    pub parts: Vec<Part>,
}

impl MultipartMessage {
    pub fn new(parts: Vec<Part>) -> Self {
        Self { parts }
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    /// First JSON part, which carries the directive or metadata
    pub fn metadata(&self) -> Option<&Part> {
        self.parts.iter().find(|part| part.is_json())
    }

    /// Non-JSON parts in the order they were received
    pub fn attachments(&self) -> impl Iterator<Item = &Part> {
        self.parts.iter().filter(|part| !part.is_json())
    }

    /// Look up a part by Content-ID or by its Content-Disposition name
    pub fn part(&self, key: &str) -> Option<&Part> {
        self.parts
            .iter()
            .find(|part| part.content_id() == Some(key) || part.name() == Some(key))
    }
}

/// Content-Type header value for an outbound form-data body
pub fn form_data_content_type(boundary: &str) -> String {
    format!("multipart/form-data; boundary={}", boundary)
}

/// Extract a `key=value` parameter from a header value such as a content type
pub fn header_param<'a>(value: &'a str, key: &str) -> Option<&'a str> {
    value.split(';').skip(1).find_map(|param| {
        let (name, raw) = param.split_once('=')?;
        if !name.trim().eq_ignore_ascii_case(key) {
            return None;
        }
        let raw = raw.trim();
        Some(
            raw.strip_prefix('"')
                .and_then(|quoted| quoted.strip_suffix('"'))
                .unwrap_or(raw),
        )
    })
}

pub fn boundary_from_content_type(content_type: &str) -> Result<&str, MultipartError> {
    match header_param(content_type, "boundary") {
        Some(boundary) if !boundary.is_empty() => Ok(boundary),
        _ => Err(MultipartError::MissingBoundary(content_type.to_string())),
    }
}

/// Encode parts into a multipart body delimited by `boundary`
pub fn encode(parts: &[Part], boundary: &str) -> Vec<u8> {
    let mut body = Vec::new();

    for part in parts {
        body.extend_from_slice(b"--");
        body.extend_from_slice(boundary.as_bytes());
        body.extend_from_slice(b"\r\n");
        for (name, value) in &part.headers {
            body.extend_from_slice(name.as_bytes());
            body.extend_from_slice(b": ");
            body.extend_from_slice(value.as_bytes());
            body.extend_from_slice(b"\r\n");
        }
        body.extend_from_slice(b"\r\n");
        body.extend_from_slice(&part.content);
        body.extend_from_slice(b"\r\n");
    }

    body.extend_from_slice(b"--");
    body.extend_from_slice(boundary.as_bytes());
    body.extend_from_slice(b"--\r\n");
    body
}

/// Decode a multipart body using the boundary declared in `content_type`.
///
/// Header values keep their whitespace apart from the single space that
/// follows the colon, so `decode(encode(parts))` yields `parts` again.
pub fn decode(body: &[u8], content_type: &str) -> Result<MultipartMessage, MultipartError> {
    let boundary = boundary_from_content_type(content_type)?;

    if is_blank(body) {
        return Ok(MultipartMessage::default());
    }

    let delimiter = format!("--{}", boundary).into_bytes();
    let mut separator = b"\r\n".to_vec();
    separator.extend_from_slice(&delimiter);

    let first = find(body, &delimiter, 0)
        .ok_or_else(|| MultipartError::MalformedBody("opening boundary not found".to_string()))?;
    let mut cursor = first + delimiter.len();
    let mut parts = Vec::new();

    loop {
        if body[cursor..].starts_with(b"--") {
            break;
        }

        let line_end = find(body, b"\r\n", cursor).ok_or_else(|| {
            MultipartError::MalformedBody("body truncated after boundary".to_string())
        })?;
        if !body[cursor..line_end]
            .iter()
            .all(|byte| *byte == b' ' || *byte == b'\t')
        {
            return Err(MultipartError::MalformedBody(
                "unexpected data after boundary".to_string(),
            ));
        }
        let part_start = line_end + 2;

        let Some(part_end) = find(body, &separator, part_start) else {
            // Some servers drop the close delimiter after trailing padding
            if is_blank(&body[part_start..]) {
                break;
            }
            return Err(MultipartError::MalformedBody(
                "closing boundary not found".to_string(),
            ));
        };

        let raw = &body[part_start..part_end];
        cursor = part_end + separator.len();
        let is_last = body[cursor..].starts_with(b"--");

        // A header-less part always starts with the empty line ending its header block
        if is_last && is_blank(raw) && !raw.starts_with(b"\r\n") {
            break;
        }
        parts.push(parse_part(raw)?);
    }

    log::debug!("Decoded multipart body with {} parts", parts.len());
    Ok(MultipartMessage { parts })
}

fn parse_part(raw: &[u8]) -> Result<Part, MultipartError> {
    if let Some(content) = raw.strip_prefix(b"\r\n") {
        return Ok(Part::new(Vec::new(), Bytes::copy_from_slice(content)));
    }

    let header_end = find(raw, b"\r\n\r\n", 0).ok_or_else(|| {
        MultipartError::MalformedBody("part header block is not terminated".to_string())
    })?;
    let block = std::str::from_utf8(&raw[..header_end])
        .map_err(|_| MultipartError::InvalidHeader("header block is not UTF-8".to_string()))?;

    let mut headers = Vec::new();
    for line in block.split("\r\n") {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| MultipartError::InvalidHeader(line.to_string()))?;
        let name = name.trim();
        if name.is_empty() {
            return Err(MultipartError::InvalidHeader(line.to_string()));
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        headers.push((name.to_string(), value.to_string()));
    }

    Ok(Part::new(
        headers,
        Bytes::copy_from_slice(&raw[header_end + 4..]),
    ))
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if from > haystack.len() || needle.is_empty() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|window| window == needle)
        .map(|position| position + from)
}

fn is_blank(bytes: &[u8]) -> bool {
    bytes.iter().all(u8::is_ascii_whitespace)
}
