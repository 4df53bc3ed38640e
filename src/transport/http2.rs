use super::{pseudo_header, validate_headers, Connection, HeaderList, PushStream, StreamResponse, Transport, TransportError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use h2::client::SendRequest;
use h2::{RecvStream, SendStream};
use log::{debug, info, warn};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Default bound on connecting and on each request stream
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

const PUSH_CHANNEL_CAPACITY: usize = 32;

/// HTTP/2 over TCP, with TLS (ALPN `h2`) for secure sessions
#[derive(Debug, Clone)]
pub struct H2Transport {
    timeout: Duration,
}

impl Default for H2Transport {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEOUT)
    }
}

impl H2Transport {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl Transport for H2Transport {
    type Connection = H2Connection;

    async fn open(&self, authority: &str, secure: bool) -> Result<H2Connection, TransportError> {
        info!(
            "📡 Connecting to {} ({})",
            authority,
            if secure { "TLS" } else { "plaintext" }
        );

        let connect = async {
            let address = socket_address(authority, secure);
            let tcp = TcpStream::connect(&address).await?;
            tcp.set_nodelay(true)?;

            let cancel = CancellationToken::new();
            let send_request = if secure {
                let connector = native_tls::TlsConnector::builder()
                    .request_alpns(&["h2"])
                    .build()?;
                let connector = tokio_native_tls::TlsConnector::from(connector);
                let tls = connector.connect(host_name(authority), tcp).await?;

                match tls.get_ref().negotiated_alpn() {
                    Ok(Some(protocol)) if protocol == b"h2" => {}
                    Ok(other) => warn!("Server did not negotiate h2 via ALPN: {:?}", other),
                    Err(e) => warn!("Could not read negotiated ALPN protocol: {}", e),
                }

                handshake(tls, cancel.clone()).await?
            } else {
                handshake(tcp, cancel.clone()).await?
            };

            Ok::<_, TransportError>(H2Connection {
                authority: authority.to_string(),
                secure,
                send_request,
                cancel,
                timeout: self.timeout,
            })
        };

        let connection = tokio::time::timeout(self.timeout, connect)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        info!("✅ HTTP/2 session established with {}", authority);
        Ok(connection)
    }
}

/// A live HTTP/2 session; dropping it closes the session
pub struct H2Connection {
    authority: String,
    secure: bool,
    send_request: SendRequest<Bytes>,
    cancel: CancellationToken,
    timeout: Duration,
}

impl H2Connection {
    async fn exchange(
        &self,
        headers: HeaderList,
        body: Option<Bytes>,
    ) -> Result<StreamResponse, TransportError> {
        let request = build_request(&headers)?;
        let mut send_request = self.send_request.clone().ready().await?;

        let (response, mut stream) = send_request.send_request(request, body.is_none())?;
        if let Some(body) = body {
            send_body(&mut stream, body).await?;
        }

        let (parts, mut recv) = response.await?.into_parts();
        let mut collected = BytesMut::new();
        while let Some(chunk) = recv.data().await {
            let chunk = chunk?;
            if let Err(e) = recv.flow_control().release_capacity(chunk.len()) {
                debug!("Failed to release {} bytes of stream capacity: {}", chunk.len(), e);
            }
            collected.extend_from_slice(&chunk);
        }

        debug!(
            "📥 Stream complete: status {} ({} bytes)",
            parts.status.as_u16(),
            collected.len()
        );

        Ok(StreamResponse {
            status: parts.status.as_u16(),
            headers: convert_headers(&parts.headers),
            body: collected.freeze(),
        })
    }
}

#[async_trait]
impl Connection for H2Connection {
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
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }

        tokio::select! {
            result = tokio::time::timeout(self.timeout, self.exchange(headers, body)) => {
                result.map_err(|_| TransportError::Timeout(self.timeout))?
            }
            _ = self.cancel.cancelled() => Err(TransportError::Closed),
        }
    }

    async fn open_push_stream(&self, headers: HeaderList) -> Result<PushStream, TransportError> {
        if self.cancel.is_cancelled() {
            return Err(TransportError::Closed);
        }

        let open = async {
            let request = build_request(&headers)?;
            let mut send_request = self.send_request.clone().ready().await?;
            let (response, _) = send_request.send_request(request, true)?;
            Ok::<_, TransportError>(response.await?)
        };

        let response = tokio::time::timeout(self.timeout, open)
            .await
            .map_err(|_| TransportError::Timeout(self.timeout))??;

        let (parts, recv) = response.into_parts();
        let (tx, rx) = mpsc::channel(PUSH_CHANNEL_CAPACITY);
        tokio::spawn(pump_push_stream(recv, tx, self.cancel.clone()));

        info!("📡 Push stream open: status {}", parts.status.as_u16());
        Ok(PushStream::new(
            parts.status.as_u16(),
            convert_headers(&parts.headers),
            rx,
        ))
    }

    fn close(&self) {
        if !self.cancel.is_cancelled() {
            info!("Closing HTTP/2 session with {}", self.authority);
            self.cancel.cancel();
        }
    }
}

impl Drop for H2Connection {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Perform the HTTP/2 handshake and drive the session on its own task
async fn handshake<S>(io: S, cancel: CancellationToken) -> Result<SendRequest<Bytes>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (send_request, connection) = h2::client::handshake(io).await?;

    tokio::spawn(async move {
        tokio::select! {
            result = connection => match result {
                Ok(()) => info!("HTTP/2 session ended by peer"),
                Err(e) => warn!("HTTP/2 session failed: {}", e),
            },
            _ = cancel.cancelled() => debug!("HTTP/2 session driver stopped"),
        }
        // Wake any push stream pumps still waiting on this session
        cancel.cancel();
    });

    Ok(send_request)
}

/// Forward push stream data to the reader until the stream or session ends
async fn pump_push_stream(
    mut recv: RecvStream,
    chunks: mpsc::Sender<Result<Bytes, TransportError>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            next = recv.data() => next,
            _ = cancel.cancelled() => {
                info!("Push stream closed with its session");
                break;
            }
            _ = chunks.closed() => {
                debug!("Push stream reader dropped");
                break;
            }
        };

        match next {
            Some(Ok(chunk)) => {
                if let Err(e) = recv.flow_control().release_capacity(chunk.len()) {
                    debug!("Failed to release {} bytes of push stream capacity: {}", chunk.len(), e);
                }
                debug!("📥 Push stream chunk: {} bytes", chunk.len());
                if chunks.send(Ok(chunk)).await.is_err() {
                    break;
                }
            }
            Some(Err(e)) => {
                warn!("Push stream failed: {}", e);
                let _ = chunks.send(Err(e.into())).await;
                break;
            }
            None => {
                info!("Push stream ended by server");
                break;
            }
        }
    }
}

/// Send a request body, waiting for flow-control capacity as needed
async fn send_body(stream: &mut SendStream<Bytes>, mut body: Bytes) -> Result<(), TransportError> {
    if body.is_empty() {
        stream.send_data(body, true)?;
        return Ok(());
    }

    while !body.is_empty() {
        stream.reserve_capacity(body.len());
        let granted = match std::future::poll_fn(|cx| stream.poll_capacity(cx)).await {
            Some(granted) => granted?,
            None => return Err(TransportError::Closed),
        };
        if granted == 0 {
            continue;
        }

        let chunk = body.split_to(granted.min(body.len()));
        stream.send_data(chunk, body.is_empty())?;
    }

    Ok(())
}

fn build_request(headers: &HeaderList) -> Result<http::Request<()>, TransportError> {
    validate_headers(headers)?;

    let uri = http::Uri::builder()
        .scheme(pseudo_header(headers, ":scheme")?)
        .authority(pseudo_header(headers, ":authority")?)
        .path_and_query(pseudo_header(headers, ":path")?)
        .build()
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))?;

    let mut builder = http::Request::builder()
        .method(pseudo_header(headers, ":method")?)
        .uri(uri);

    for (name, value) in headers.iter().filter(|(name, _)| !name.starts_with(':')) {
        builder = builder.header(name.to_ascii_lowercase(), value.as_str());
    }

    builder
        .body(())
        .map_err(|e| TransportError::InvalidRequest(e.to_string()))
}

fn convert_headers(headers: &http::HeaderMap) -> HeaderList {
    headers
        .iter()
        .map(|(name, value)| {
            (
                name.as_str().to_string(),
                String::from_utf8_lossy(value.as_bytes()).into_owned(),
            )
        })
        .collect()
}

fn has_port(authority: &str) -> bool {
    authority
        .rsplit_once(':')
        .map(|(host, port)| !host.ends_with(':') && port.parse::<u16>().is_ok())
        .unwrap_or(false)
}

fn socket_address(authority: &str, secure: bool) -> String {
    if has_port(authority) {
        authority.to_string()
    } else {
        format!("{}:{}", authority, if secure { 443 } else { 80 })
    }
}

fn host_name(authority: &str) -> &str {
    if has_port(authority) {
        authority
            .rsplit_once(':')
            .map(|(host, _)| host)
            .unwrap_or(authority)
    } else {
        authority
    }
}
