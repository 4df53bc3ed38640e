//! # Session Transport
//!
//! A single multiplexed HTTP/2 session to one authority. Every call opens
//! its own stream, so request/response exchanges and the long-lived push
//! stream progress independently on the same connection.
//!
//! Two implementations are provided:
//! - [`http2::H2Transport`]: real sockets, TLS with ALPN `h2`
//! - [`memory::MemoryTransport`]: canned responses and recorded streams, for tests

pub mod http2;
pub mod memory;

use async_trait::async_trait;
use bytes::Bytes;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;

pub use http2::H2Transport;
pub use memory::MemoryTransport;

/// Ordered header name/value pairs, pseudo-headers included
pub type HeaderList = Vec<(String, String)>;

/// Pseudo-headers every request must carry
pub const PSEUDO_HEADERS: [&str; 4] = [":method", ":scheme", ":authority", ":path"];

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("HTTP/2 error: {0}")]
    Http2(#[from] h2::Error),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Stream reset: {0}")]
    Reset(String),

    #[error("Connection closed")]
    Closed,

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Complete response of a request stream
#[derive(Debug, Clone)]
pub struct StreamResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl StreamResponse {
    /// Case-insensitive header lookup
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }
}

/// A stream kept open for server push; chunks arrive as the server sends them
#[derive(Debug)]
pub struct PushStream {
    status: u16,
    headers: HeaderList,
    chunks: mpsc::Receiver<Result<Bytes, TransportError>>,
}

impl PushStream {
    pub fn new(
        status: u16,
        headers: HeaderList,
        chunks: mpsc::Receiver<Result<Bytes, TransportError>>,
    ) -> Self {
        Self {
            status,
            headers,
            chunks,
        }
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    pub fn headers(&self) -> &HeaderList {
        &self.headers
    }

    /// Next body chunk; `None` once the stream or its connection has closed
    pub async fn next_chunk(&mut self) -> Option<Result<Bytes, TransportError>> {
        self.chunks.recv().await
    }
}

/// Opens sessions to an authority
#[async_trait]
pub trait Transport: Send + Sync {
    type Connection: Connection;

    /// Connect (over TLS when `secure`) without sending any application frames
    async fn open(&self, authority: &str, secure: bool) -> Result<Self::Connection, TransportError>;
}

/// One live session; each call below runs on its own stream
#[async_trait]
pub trait Connection: Send + Sync {
    fn authority(&self) -> &str;

    fn is_secure(&self) -> bool;

    /// Send headers and optional body, then wait for the complete response
    async fn request(
        &self,
        headers: HeaderList,
        body: Option<Bytes>,
    ) -> Result<StreamResponse, TransportError>;

    /// Open a body-less stream that stays open for server push
    async fn open_push_stream(&self, headers: HeaderList) -> Result<PushStream, TransportError>;

    /// Tear the session down; open push streams observe the closure
    fn close(&self);
}

/// Case-insensitive lookup in a header list
pub fn find_header<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}

/// Fetch a mandatory pseudo-header
pub fn pseudo_header<'a>(headers: &'a [(String, String)], name: &str) -> Result<&'a str, TransportError> {
    find_header(headers, name)
        .filter(|value| !value.is_empty())
        .ok_or_else(|| TransportError::InvalidRequest(format!("missing pseudo-header {}", name)))
}

pub fn validate_headers(headers: &[(String, String)]) -> Result<(), TransportError> {
    for name in PSEUDO_HEADERS {
        pseudo_header(headers, name)?;
    }
    Ok(())
}
