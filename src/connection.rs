//! # Connection Manager
//!
//! Owns the HTTP/2 session to the service and implements its operations:
//! opening the connection, the directives downchannel, device state
//! synchronisation, speech recognition and ping.
//!
//! ```text
//! Disconnected --create_connection--> Connected --establish_downchannel_stream--> DownchannelEstablished
//!      ^                                  |                                            |
//!      +-------------- close -------------+--------------------------------------------+
//! ```

use crate::auth::AuthHeaders;
use crate::config::AvsConfig;
use crate::error::{AvsError, Result};
use crate::ids::{IdGenerator, UuidIdGenerator};
use crate::multipart::{self, MultipartError, Part};
use crate::protocol::{
    AvsResponse, Event, EventEnvelope, AUDIO_CONTENT_TYPE, DIRECTIVES_PATH, EVENTS_PATH,
    EVENT_BOUNDARY, JSON_CONTENT_TYPE, PING_PATH,
};
use crate::transport::{Connection, H2Transport, HeaderList, PushStream, StreamResponse, Transport};
use bytes::Bytes;
use log::{debug, info, warn};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::io::{AsyncRead, AsyncReadExt};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    DownchannelEstablished,
}

pub struct ConnectionManager<T: Transport = H2Transport> {
    transport: T,
    config: AvsConfig,
    ids: Arc<dyn IdGenerator>,
    connection: Option<T::Connection>,
    downchannel: Option<PushStream>,
    downchannel_established: bool,
    last_activity: Mutex<Option<Instant>>,
}

impl ConnectionManager<H2Transport> {
    /// Manager speaking HTTP/2 to the configured endpoint
    pub fn new(config: AvsConfig) -> Self {
        let transport = H2Transport::new(config.request_timeout);
        Self::with_transport(transport, config)
    }
}

impl<T: Transport> ConnectionManager<T> {
    pub fn with_transport(transport: T, config: AvsConfig) -> Self {
        Self {
            transport,
            config,
            ids: Arc::new(UuidIdGenerator),
            connection: None,
            downchannel: None,
            downchannel_established: false,
            last_activity: Mutex::new(None),
        }
    }

    /// Replace the identifier source, e.g. with fixed ids in tests
    pub fn with_id_generator(mut self, ids: impl IdGenerator + 'static) -> Self {
        self.ids = Arc::new(ids);
        self
    }

    pub fn config(&self) -> &AvsConfig {
        &self.config
    }

    pub fn state(&self) -> ConnectionState {
        match (&self.connection, self.downchannel_established) {
            (None, _) => ConnectionState::Disconnected,
            (Some(_), false) => ConnectionState::Connected,
            (Some(_), true) => ConnectionState::DownchannelEstablished,
        }
    }

    /// The live connection, or a state error before `create_connection`
    pub fn connection(&self) -> Result<&T::Connection> {
        self.connection
            .as_ref()
            .ok_or_else(|| AvsError::State("not connected; call create_connection first".to_string()))
    }

    /// Open the session to the configured endpoint.
    ///
    /// Only one session may be live per manager: calling this again while
    /// connected is a state error. Call [`close`](Self::close) first to reconnect.
    pub async fn create_connection(&mut self) -> Result<()> {
        if let Some(connection) = &self.connection {
            return Err(AvsError::State(format!(
                "already connected to {}",
                connection.authority()
            )));
        }

        let connection = self
            .transport
            .open(&self.config.endpoint, self.config.secure)
            .await?;
        info!("🔗 Connected to {}", connection.authority());

        self.connection = Some(connection);
        self.mark_activity();
        Ok(())
    }

    /// Open the directives downchannel, replacing any previous one
    pub async fn establish_downchannel_stream(&mut self, auth: &AuthHeaders) -> Result<()> {
        let headers = self.request_headers("GET", DIRECTIVES_PATH, None, auth)?;
        let mut stream = self.connection()?.open_push_stream(headers).await?;

        if !is_success(stream.status()) {
            let status = stream.status();
            let mut body = Vec::new();
            while let Some(Ok(chunk)) = stream.next_chunk().await {
                body.extend_from_slice(&chunk);
            }
            warn!("❌ Downchannel rejected with status {}", status);
            return Err(AvsError::Http { status, body });
        }

        if self.downchannel.replace(stream).is_some() {
            info!("🔄 Replaced existing downchannel stream");
        } else {
            info!("📡 Downchannel stream established");
        }
        self.downchannel_established = true;
        self.mark_activity();
        Ok(())
    }

    /// Hand the downchannel to a reader running on its own task
    pub fn take_downchannel(&mut self) -> Option<PushStream> {
        self.downchannel.take()
    }

    /// Send `System.SynchronizeState` carrying `device_state` as context
    pub async fn synchronize_device_state(
        &self,
        auth: &AuthHeaders,
        device_state: &Value,
    ) -> Result<()> {
        let envelope = EventEnvelope {
            context: device_state,
            event: Event::synchronize_state(self.ids.message_id()),
        };
        let parts = [Part::form_data(
            "metadata",
            JSON_CONTENT_TYPE,
            serde_json::to_vec(&envelope)?,
        )];

        let response = self.send_event(auth, &parts).await?;
        match response.status {
            200 | 204 => {
                info!("✅ Device state synchronized");
                Ok(())
            }
            _ => Err(http_error(response)),
        }
    }

    /// Send a `SpeechRecognizer.Recognize` event and decode the reply.
    ///
    /// Returns `None` when the service answers 204 (nothing to say).
    pub async fn recognize<R>(
        &self,
        auth: &AuthHeaders,
        device_state: &Value,
        mut audio: R,
    ) -> Result<Option<AvsResponse>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let mut audio_data = Vec::new();
        audio.read_to_end(&mut audio_data).await?;
        debug!("🎤 Read {} bytes of audio to recognize", audio_data.len());

        let envelope = EventEnvelope {
            context: device_state,
            event: Event::recognize(self.ids.message_id(), self.ids.dialog_request_id()),
        };
        let parts = [
            Part::form_data("request", JSON_CONTENT_TYPE, serde_json::to_vec(&envelope)?),
            Part::form_data("audio", AUDIO_CONTENT_TYPE, audio_data),
        ];

        let response = self.send_event(auth, &parts).await?;
        match response.status {
            200 => {
                let content_type = response
                    .content_type()
                    .ok_or_else(|| MultipartError::MissingBoundary(String::new()))?;
                let message = multipart::decode(&response.body, content_type)?;
                let decoded = AvsResponse::from_multipart(&message)?;
                info!(
                    "📥 Recognize response: {} directives, {} attachments",
                    decoded.directives.len(),
                    decoded.attachments.len()
                );
                Ok(Some(decoded))
            }
            204 => {
                info!("Recognize response had no content");
                Ok(None)
            }
            _ => Err(http_error(response)),
        }
    }

    /// Send recorded audio and return the spoken reply, if there is one
    pub async fn send_audio_file<R>(
        &self,
        auth: &AuthHeaders,
        device_state: &Value,
        audio: R,
    ) -> Result<Option<Bytes>>
    where
        R: AsyncRead + Unpin + Send,
    {
        let response = self.recognize(auth, device_state, audio).await?;
        Ok(response.and_then(AvsResponse::into_audio))
    }

    /// Single liveness check; any 2xx is success
    pub async fn ping(&self, auth: &AuthHeaders) -> Result<()> {
        let headers = self.request_headers("GET", PING_PATH, None, auth)?;
        let response = self.connection()?.request(headers, None).await?;
        self.mark_activity();

        if is_success(response.status) {
            debug!("🏓 Ping ok ({})", response.status);
            Ok(())
        } else {
            Err(http_error(response))
        }
    }

    /// Ping only when nothing has been exchanged for the configured interval.
    ///
    /// Returns whether a ping was sent.
    pub async fn ping_if_due(&self, auth: &AuthHeaders) -> Result<bool> {
        let due = match *self.last_activity() {
            Some(last) => last.elapsed() >= self.config.ping_interval,
            None => true,
        };
        if !due {
            return Ok(false);
        }

        self.ping(auth).await?;
        Ok(true)
    }

    /// Close the session; the downchannel reader sees its stream end
    pub fn close(&mut self) {
        self.downchannel = None;
        self.downchannel_established = false;
        if let Some(connection) = self.connection.take() {
            info!("👋 Closing connection to {}", connection.authority());
            connection.close();
        }
    }

    async fn send_event(&self, auth: &AuthHeaders, parts: &[Part]) -> Result<StreamResponse> {
        let content_type = multipart::form_data_content_type(EVENT_BOUNDARY);
        let headers = self.request_headers("POST", EVENTS_PATH, Some(&content_type), auth)?;
        let body = Bytes::from(multipart::encode(parts, EVENT_BOUNDARY));

        debug!("📤 Sending event: {} parts, {} bytes", parts.len(), body.len());
        let response = self.connection()?.request(headers, Some(body)).await?;
        self.mark_activity();
        Ok(response)
    }

    fn request_headers(
        &self,
        method: &str,
        path: &str,
        content_type: Option<&str>,
        auth: &AuthHeaders,
    ) -> Result<HeaderList> {
        let connection = self.connection()?;
        let scheme = if connection.is_secure() { "https" } else { "http" };

        let mut headers = vec![
            (":method".to_string(), method.to_string()),
            (":scheme".to_string(), scheme.to_string()),
            (":path".to_string(), path.to_string()),
            (":authority".to_string(), connection.authority().to_string()),
        ];
        if let Some(content_type) = content_type {
            headers.push(("content-type".to_string(), content_type.to_string()));
        }
        headers.extend(
            auth.iter()
                .map(|(name, value)| (name.to_string(), value.to_string())),
        );
        Ok(headers)
    }

    fn last_activity(&self) -> std::sync::MutexGuard<'_, Option<Instant>> {
        self.last_activity
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mark_activity(&self) {
        *self.last_activity() = Some(Instant::now());
    }
}

impl<T: Transport> Drop for ConnectionManager<T> {
    fn drop(&mut self) {
        self.close();
    }
}

fn is_success(status: u16) -> bool {
    (200..300).contains(&status)
}

fn http_error(response: StreamResponse) -> AvsError {
    warn!(
        "❌ Unexpected response status {} ({} bytes)",
        response.status,
        response.body.len()
    );
    AvsError::Http {
        status: response.status,
        body: response.body.to_vec(),
    }
}
