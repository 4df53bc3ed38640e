use super::{find_header, validate_headers, Connection, HeaderList, PushStream, StreamResponse, Transport, TransportError};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::mpsc;

/// A response the in-memory transport replays for the next request stream
#[derive(Debug, Clone)]
pub struct CannedResponse {
    pub status: u16,
    pub headers: HeaderList,
    pub body: Bytes,
}

impl CannedResponse {
    pub fn status(status: u16) -> Self {
        Self {
            status,
            headers: Vec::new(),
            body: Bytes::new(),
        }
    }

    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }
}

/// A stream as it was handed to the transport
#[derive(Debug, Clone)]
pub struct RecordedStream {
    pub headers: HeaderList,
    pub body: Option<Bytes>,
}

impl RecordedStream {
    pub fn header(&self, name: &str) -> Option<&str> {
        find_header(&self.headers, name)
    }
}

#[derive(Default)]
struct Shared {
    responses: VecDeque<Result<CannedResponse, String>>,
    push_responses: VecDeque<CannedResponse>,
    streams: Vec<RecordedStream>,
    push_senders: Vec<mpsc::Sender<Result<Bytes, TransportError>>>,
    sessions_opened: usize,
    refuse_connections: bool,
}

/// Session transport backed by a queue of canned responses
#[derive(Clone, Default)]
pub struct MemoryTransport {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        lock(&self.shared)
    }

    /// Queue the response for the next request stream
    pub fn mock_response(&self, response: CannedResponse) {
        self.lock().responses.push_back(Ok(response));
    }

    /// Make the next request stream fail as if the server reset it
    pub fn mock_reset(&self, reason: &str) {
        self.lock().responses.push_back(Err(reason.to_string()));
    }

    /// Queue the response headers and initial body for the next push stream.
    ///
    /// Without one, push streams open with status 200 and stay open for [`push`](Self::push).
    pub fn mock_push_response(&self, response: CannedResponse) {
        self.lock().push_responses.push_back(response);
    }

    /// Make `open` fail as if the socket connect was refused
    pub fn refuse_connections(&self) {
        self.lock().refuse_connections = true;
    }

    /// Most recently opened stream, push streams included
    pub fn recent_stream(&self) -> Option<RecordedStream> {
        self.lock().streams.last().cloned()
    }

    pub fn streams(&self) -> Vec<RecordedStream> {
        self.lock().streams.clone()
    }

    pub fn sessions_opened(&self) -> usize {
        self.lock().sessions_opened
    }

    /// Deliver a chunk on the most recent push stream; false if none is open
    pub async fn push(&self, chunk: impl Into<Bytes>) -> bool {
        let sender = self.lock().push_senders.last().cloned();
        match sender {
            Some(sender) => sender.send(Ok(chunk.into())).await.is_ok(),
            None => false,
        }
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    type Connection = MemoryConnection;

    async fn open(&self, authority: &str, secure: bool) -> Result<MemoryConnection, TransportError> {
        let mut shared = self.lock();
        if shared.refuse_connections {
            return Err(TransportError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("connection to {} refused", authority),
            )));
        }
        shared.sessions_opened += 1;

        Ok(MemoryConnection {
            authority: authority.to_string(),
            secure,
            shared: Arc::clone(&self.shared),
            closed: AtomicBool::new(false),
        })
    }
}

pub struct MemoryConnection {
    authority: String,
    secure: bool,
    shared: Arc<Mutex<Shared>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn authority(&self) -> &str {
        &self.authority
    }

    fn is_secure(&self) -> bool {
        self.secure
    }

    async fn request(
        &self,
        headers: HeaderList,
        body: Option<Bytes>,
    ) -> Result<StreamResponse, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        validate_headers(&headers)?;

        let mut shared = lock(&self.shared);
        shared.streams.push(RecordedStream { headers, body });

        match shared.responses.pop_front() {
            Some(Ok(canned)) => Ok(StreamResponse {
                status: canned.status,
                headers: canned.headers,
                body: canned.body,
            }),
            Some(Err(reason)) => Err(TransportError::Reset(reason)),
            None => Err(TransportError::Reset("no response queued".to_string())),
        }
    }

    async fn open_push_stream(&self, headers: HeaderList) -> Result<PushStream, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        validate_headers(&headers)?;

        let (tx, rx) = mpsc::channel(32);
        let mut shared = lock(&self.shared);
        shared.streams.push(RecordedStream {
            headers,
            body: None,
        });

        let canned = shared.push_responses.pop_front().unwrap_or_else(|| {
            CannedResponse::status(200)
                .with_header("content-type", "multipart/related; boundary=------downchannel")
        });
        if !canned.body.is_empty() {
            // Fresh channel, so there is room for the initial body
            let _ = tx.try_send(Ok(canned.body));
        }
        if (200..300).contains(&canned.status) {
            shared.push_senders.retain(|sender| !sender.is_closed());
            shared.push_senders.push(tx);
        }

        Ok(PushStream::new(canned.status, canned.headers, rx))
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the senders ends every push stream reader
        lock(&self.shared).push_senders.clear();
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
