use avs_client_rs::{
    multipart,
    transport::memory::{CannedResponse, MemoryTransport},
    transport::{Connection, TransportError},
    AuthHeaders, AvsConfig, AvsError, ConnectionManager, ConnectionState, FixedIds,
};
use bytes::Bytes;
use serde_json::{json, Value};
use std::time::Duration;

const RESPONSE_BOUNDARY: &str = "22b41228-f803-447b-9cde-f99d0a1652b1";
const RESPONSE_CONTENT_TYPE: &str = "multipart/related;boundary=22b41228-f803-447b-9cde-f99d0a1652b1;start=metadata.1503696654430;type=\"application/json\"";
const AUDIO_RESPONSE_DATA: &[u8] =
    b"ID3\x04\x00\x00\x00\x00\x00#TSSE\x00\x00\x00\x0f\x00\x00\x03Lavf57.71.100\x00\xff\xf3\x18\xc4\x00\x00\x00\x03H";

fn audio_response_multipart() -> Vec<u8> {
    let directive = json!({
        "directive": {
            "header": {
                "namespace": "SpeechSynthesizer",
                "name": "Speak",
                "messageId": "e07b2e05-3d4b-4fb5-b0a3-1e8de1ad4c35",
                "dialogRequestId": "dialogue-id"
            },
            "payload": {
                "url": "cid:DeviceTTSRendererV4_e1d3c9ab_1503696654",
                "format": "AUDIO_MPEG",
                "token": "amzn1.as-ct.v1.ThirdPartySdkSpeechlet#ACRI#DeviceTTSRendererV4"
            }
        }
    });

    let mut body = Vec::new();
    body.extend_from_slice(format!("--{}\r\n", RESPONSE_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-Type: application/json; charset=UTF-8\r\n\r\n");
    body.extend_from_slice(directive.to_string().as_bytes());
    body.extend_from_slice(format!("\r\n--{}\r\n", RESPONSE_BOUNDARY).as_bytes());
    body.extend_from_slice(b"Content-ID: <DeviceTTSRendererV4_e1d3c9ab_1503696654>\r\n");
    body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
    body.extend_from_slice(AUDIO_RESPONSE_DATA);
    body.extend_from_slice(format!("\r\n--{}--\r\n", RESPONSE_BOUNDARY).as_bytes());
    body
}

fn manager() -> (ConnectionManager<MemoryTransport>, MemoryTransport) {
    let transport = MemoryTransport::new();
    let manager = ConnectionManager::with_transport(transport.clone(), AvsConfig::default())
        .with_id_generator(FixedIds::new("message-id", "dialogue-id"));
    (manager, transport)
}

fn auth() -> AuthHeaders {
    AuthHeaders::new().with("auth", "value")
}

fn device_state() -> Value {
    json!({"device": "state"})
}

fn pairs(list: &[(&str, &str)]) -> Vec<(String, String)> {
    list.iter()
        .map(|(name, value)| (name.to_string(), value.to_string()))
        .collect()
}

fn event_headers() -> Vec<(String, String)> {
    pairs(&[
        (":method", "POST"),
        (":scheme", "https"),
        (":path", "/v20160207/events"),
        (":authority", "avs-alexa-eu.amazon.com"),
        ("content-type", "multipart/form-data; boundary=avs-event-boundary"),
        ("auth", "value"),
    ])
}

/// Decode the body of the most recent request stream
fn sent_parts(transport: &MemoryTransport) -> multipart::MultipartMessage {
    let stream = transport.recent_stream().unwrap();
    let content_type = stream.header("content-type").unwrap().to_string();
    multipart::decode(&stream.body.unwrap(), &content_type).unwrap()
}

#[tokio::test]
async fn test_create_connection() {
    let (mut manager, transport) = manager();
    assert_eq!(manager.state(), ConnectionState::Disconnected);

    manager.create_connection().await.unwrap();

    let connection = manager.connection().unwrap();
    assert_eq!(connection.authority(), "avs-alexa-eu.amazon.com");
    assert!(connection.is_secure());
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(transport.sessions_opened(), 1);
}

#[tokio::test]
async fn test_second_create_connection_is_state_error() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();

    let result = manager.create_connection().await;

    assert!(matches!(result, Err(AvsError::State(_))));
    assert_eq!(transport.sessions_opened(), 1);
}

#[tokio::test]
async fn test_operations_before_connecting_are_state_errors() {
    let (mut manager, transport) = manager();

    assert!(matches!(manager.ping(&auth()).await, Err(AvsError::State(_))));
    assert!(matches!(
        manager.synchronize_device_state(&auth(), &device_state()).await,
        Err(AvsError::State(_))
    ));
    assert!(matches!(
        manager.send_audio_file(&auth(), &device_state(), &b"things"[..]).await,
        Err(AvsError::State(_))
    ));
    assert!(matches!(
        manager.establish_downchannel_stream(&auth()).await,
        Err(AvsError::State(_))
    ));
    assert!(transport.streams().is_empty());
}

#[tokio::test]
async fn test_refused_connection_is_connection_error() {
    let (mut manager, transport) = manager();
    transport.refuse_connections();

    let result = manager.create_connection().await;

    assert!(matches!(
        result,
        Err(AvsError::Connection(TransportError::Io(_)))
    ));
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[test_log::test(tokio::test)]
async fn test_establish_downchannel_stream() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();

    manager.establish_downchannel_stream(&auth()).await.unwrap();

    let stream = transport.recent_stream().unwrap();
    assert_eq!(
        stream.headers,
        pairs(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/v20160207/directives"),
            (":authority", "avs-alexa-eu.amazon.com"),
            ("auth", "value"),
        ])
    );
    assert!(stream.body.is_none());
    assert_eq!(manager.state(), ConnectionState::DownchannelEstablished);
}

#[tokio::test]
async fn test_downchannel_reader_sees_pushes_and_closure() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    manager.establish_downchannel_stream(&auth()).await.unwrap();
    let mut downchannel = manager.take_downchannel().unwrap();

    let reader = tokio::spawn(async move {
        let mut received = Vec::new();
        while let Some(chunk) = downchannel.next_chunk().await {
            received.push(chunk.unwrap());
        }
        received
    });

    assert!(transport.push("directive-1").await);
    assert!(transport.push("directive-2").await);
    manager.close();

    let received = tokio::time::timeout(Duration::from_secs(5), reader)
        .await
        .expect("downchannel reader should finish once the connection closes")
        .unwrap();
    assert_eq!(
        received,
        vec![Bytes::from_static(b"directive-1"), Bytes::from_static(b"directive-2")]
    );
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn test_reestablishing_downchannel_replaces_stream() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();

    manager.establish_downchannel_stream(&auth()).await.unwrap();
    manager.establish_downchannel_stream(&auth()).await.unwrap();

    assert_eq!(transport.streams().len(), 2);
    assert!(manager.take_downchannel().is_some());
    assert!(manager.take_downchannel().is_none());
    assert_eq!(manager.state(), ConnectionState::DownchannelEstablished);
}

#[tokio::test]
async fn test_rejected_downchannel_is_http_error() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_push_response(CannedResponse::status(403).with_body("denied"));

    let result = manager.establish_downchannel_stream(&auth()).await;

    match result {
        Err(AvsError::Http { status, body }) => {
            assert_eq!(status, 403);
            assert_eq!(body, b"denied".to_vec());
        }
        other => panic!("expected HTTP error, got {:?}", other),
    }
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert!(manager.take_downchannel().is_none());
}

#[tokio::test]
async fn test_rejected_downchannel_keeps_previous_stream() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    manager.establish_downchannel_stream(&auth()).await.unwrap();
    transport.mock_push_response(CannedResponse::status(403).with_body("denied"));

    let result = manager.establish_downchannel_stream(&auth()).await;

    assert!(matches!(result, Err(AvsError::Http { status: 403, .. })));
    assert_eq!(manager.state(), ConnectionState::DownchannelEstablished);
    let mut downchannel = manager.take_downchannel().unwrap();
    assert!(transport.push("directive").await);
    assert_eq!(
        downchannel.next_chunk().await.unwrap().unwrap(),
        Bytes::from_static(b"directive")
    );
}

#[tokio::test]
async fn test_synchronize_device_state() {
    for status in [200, 204] {
        let transport = MemoryTransport::new();
        let mut manager =
            ConnectionManager::with_transport(transport.clone(), AvsConfig::default())
                .with_id_generator(FixedIds::new("", "dialogue-id"));
        manager.create_connection().await.unwrap();
        transport.mock_response(CannedResponse::status(status));

        manager
            .synchronize_device_state(&auth(), &device_state())
            .await
            .unwrap();

        assert_eq!(transport.recent_stream().unwrap().headers, event_headers());

        let parsed = sent_parts(&transport);
        assert_eq!(parsed.parts.len(), 1);
        assert_eq!(
            parsed.parts[0].headers,
            pairs(&[
                (
                    "Content-Disposition",
                    "form-data; name=\"metadata\"; filename=\"metadata\""
                ),
                ("Content-Type", "application/json"),
            ])
        );

        let metadata: Value = serde_json::from_slice(&parsed.parts[0].content).unwrap();
        assert_eq!(
            metadata,
            json!({
                "context": device_state(),
                "event": {
                    "header": {
                        "messageId": "",
                        "name": "SynchronizeState",
                        "namespace": "System"
                    },
                    "payload": {}
                }
            })
        );
    }
}

#[tokio::test]
async fn test_synchronize_device_state_error_status() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_response(CannedResponse::status(403).with_body("forbidden"));

    let error = manager
        .synchronize_device_state(&auth(), &device_state())
        .await
        .unwrap_err();

    match error {
        AvsError::Http { status, body } => {
            assert_eq!(status, 403);
            assert_eq!(body, b"forbidden".to_vec());
        }
        other => panic!("expected HTTP error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_send_audio_file_request() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_response(CannedResponse::status(204));

    manager
        .send_audio_file(&auth(), &device_state(), &b"things"[..])
        .await
        .unwrap();

    assert_eq!(transport.recent_stream().unwrap().headers, event_headers());

    let parsed = sent_parts(&transport);
    assert_eq!(parsed.parts.len(), 2);
    assert_eq!(
        parsed.parts[0].headers,
        pairs(&[
            (
                "Content-Disposition",
                "form-data; name=\"request\"; filename=\"request\""
            ),
            ("Content-Type", "application/json"),
        ])
    );

    let request: Value = serde_json::from_slice(&parsed.parts[0].content).unwrap();
    assert_eq!(
        request,
        json!({
            "context": device_state(),
            "event": {
                "payload": {
                    "profile": "CLOSE_TALK",
                    "format": "AUDIO_L16_RATE_16000_CHANNELS_1"
                },
                "header": {
                    "namespace": "SpeechRecognizer",
                    "dialogRequestId": "dialogue-id",
                    "name": "Recognize",
                    "messageId": "message-id"
                }
            }
        })
    );

    assert_eq!(
        parsed.parts[1].headers,
        pairs(&[
            (
                "Content-Disposition",
                "form-data; name=\"audio\"; filename=\"audio\""
            ),
            ("Content-Type", "application/octet-stream"),
        ])
    );
    assert_eq!(parsed.parts[1].content, Bytes::from_static(b"things"));
}

#[tokio::test]
async fn test_send_audio_file_200_returns_audio() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_response(
        CannedResponse::status(200)
            .with_header("access-control-allow-origin", "*")
            .with_header("x-amzn-requestid", "06aaf3fffec6be28-00003161-00006c28")
            .with_header("content-type", RESPONSE_CONTENT_TYPE)
            .with_body(audio_response_multipart()),
    );

    let audio = manager
        .send_audio_file(&auth(), &device_state(), &b"things"[..])
        .await
        .unwrap();

    assert_eq!(audio, Some(Bytes::from_static(AUDIO_RESPONSE_DATA)));
}

#[tokio::test]
async fn test_recognize_returns_directives() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_response(
        CannedResponse::status(200)
            .with_header("content-type", RESPONSE_CONTENT_TYPE)
            .with_body(audio_response_multipart()),
    );

    let response = manager
        .recognize(&auth(), &device_state(), &b"things"[..])
        .await
        .unwrap()
        .unwrap();

    assert_eq!(response.directives.len(), 1);
    let speak = &response.directives[0];
    assert_eq!(speak.header.namespace, "SpeechSynthesizer");
    assert_eq!(speak.header.name, "Speak");
    assert_eq!(speak.header.dialog_request_id.as_deref(), Some("dialogue-id"));
    assert_eq!(
        speak.attachment_id(),
        Some("DeviceTTSRendererV4_e1d3c9ab_1503696654")
    );
    assert_eq!(
        response.attachment("DeviceTTSRendererV4_e1d3c9ab_1503696654"),
        Some(&Bytes::from_static(AUDIO_RESPONSE_DATA))
    );
}

#[tokio::test]
async fn test_send_audio_file_from_disk() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_response(
        CannedResponse::status(200)
            .with_header("content-type", RESPONSE_CONTENT_TYPE)
            .with_body(audio_response_multipart()),
    );

    let dir = tempfile::tempdir().unwrap();
    let input = dir.path().join("utterance.raw");
    let output = dir.path().join("reply.mp3");
    let recorded: Vec<u8> = (0..=255u8).cycle().take(16_000).collect();
    tokio::fs::write(&input, &recorded).await.unwrap();

    let file = tokio::fs::File::open(&input).await.unwrap();
    let reply = manager
        .send_audio_file(&auth(), &device_state(), file)
        .await
        .unwrap()
        .unwrap();
    tokio::fs::write(&output, &reply).await.unwrap();

    assert_eq!(sent_parts(&transport).parts[1].content, Bytes::from(recorded));
    assert_eq!(tokio::fs::read(&output).await.unwrap(), AUDIO_RESPONSE_DATA);
}

#[tokio::test]
async fn test_send_audio_204_response() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_response(CannedResponse::status(204));

    let response = manager
        .send_audio_file(&auth(), &device_state(), &b"things"[..])
        .await
        .unwrap();

    assert!(response.is_none());
}

#[tokio::test]
async fn test_send_audio_non_200_response() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();

    for status in (200..600).filter(|code| *code != 200 && *code != 204) {
        transport.mock_response(CannedResponse::status(status));

        let error = manager
            .send_audio_file(&auth(), &device_state(), &b"things"[..])
            .await
            .unwrap_err();

        assert_eq!(error.status(), Some(status), "status {}", status);
    }
}

#[tokio::test]
async fn test_send_audio_200_without_boundary_is_parse_error() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_response(
        CannedResponse::status(200)
            .with_header("content-type", "multipart/related")
            .with_body(audio_response_multipart()),
    );

    let result = manager
        .send_audio_file(&auth(), &device_state(), &b"things"[..])
        .await;

    assert!(matches!(result, Err(AvsError::Parse(_))));
}

#[tokio::test]
async fn test_send_audio_truncated_response_is_parse_error() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    let mut body = audio_response_multipart();
    body.truncate(body.len() / 2);
    transport.mock_response(
        CannedResponse::status(200)
            .with_header("content-type", RESPONSE_CONTENT_TYPE)
            .with_body(body),
    );

    let result = manager
        .send_audio_file(&auth(), &device_state(), &b"things"[..])
        .await;

    assert!(matches!(result, Err(AvsError::Parse(_))));
}

#[tokio::test]
async fn test_stream_reset_is_connection_error() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_reset("REFUSED_STREAM");

    let result = manager
        .send_audio_file(&auth(), &device_state(), &b"things"[..])
        .await;

    assert!(matches!(
        result,
        Err(AvsError::Connection(TransportError::Reset(_)))
    ));
}

#[tokio::test]
async fn test_ping() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_response(CannedResponse::status(204));

    manager.ping(&auth()).await.unwrap();

    let stream = transport.recent_stream().unwrap();
    assert_eq!(
        stream.headers,
        pairs(&[
            (":method", "GET"),
            (":scheme", "https"),
            (":path", "/ping"),
            (":authority", "avs-alexa-eu.amazon.com"),
            ("auth", "value"),
        ])
    );
    assert!(stream.body.is_none());
}

#[tokio::test]
async fn test_ping_non_2xx_response() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();

    for status in [301, 400, 403, 500, 503] {
        transport.mock_response(CannedResponse::status(status));
        let error = manager.ping(&auth()).await.unwrap_err();
        assert_eq!(error.status(), Some(status));
    }
}

#[tokio::test]
async fn test_ping_if_due() {
    let transport = MemoryTransport::new();
    let config = AvsConfig {
        ping_interval: Duration::from_secs(3600),
        ..AvsConfig::default()
    };
    let mut manager = ConnectionManager::with_transport(transport.clone(), config);
    manager.create_connection().await.unwrap();

    // Connecting counts as activity
    assert!(!manager.ping_if_due(&auth()).await.unwrap());
    assert!(transport.streams().is_empty());

    let transport = MemoryTransport::new();
    let config = AvsConfig {
        ping_interval: Duration::ZERO,
        ..AvsConfig::default()
    };
    let mut manager = ConnectionManager::with_transport(transport.clone(), config);
    manager.create_connection().await.unwrap();
    transport.mock_response(CannedResponse::status(204));

    assert!(manager.ping_if_due(&auth()).await.unwrap());
    assert_eq!(transport.streams().len(), 1);
}

#[tokio::test]
async fn test_concurrent_calls_get_their_own_streams() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    transport.mock_response(CannedResponse::status(204));
    transport.mock_response(CannedResponse::status(204));

    let auth = auth();
    let state = device_state();
    let (ping, sync) = tokio::join!(
        manager.ping(&auth),
        manager.synchronize_device_state(&auth, &state)
    );
    ping.unwrap();
    sync.unwrap();

    let streams = transport.streams();
    assert_eq!(streams.len(), 2);
    let mut paths: Vec<_> = streams
        .iter()
        .map(|stream| stream.header(":path").unwrap().to_string())
        .collect();
    paths.sort();
    assert_eq!(paths, vec!["/ping", "/v20160207/events"]);
}

#[tokio::test]
async fn test_close_then_reconnect() {
    let (mut manager, transport) = manager();
    manager.create_connection().await.unwrap();
    manager.close();
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(matches!(manager.ping(&auth()).await, Err(AvsError::State(_))));

    manager.create_connection().await.unwrap();
    assert_eq!(transport.sessions_opened(), 2);
    assert_eq!(manager.state(), ConnectionState::Connected);
}
