//! Mastodon public timeline streaming over server-sent events

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use serde_json::{Map, Value};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

use super::{EventStream, EventStreamClient, StreamMessage};
use crate::error::{IngestionError, Result};
use crate::http_client::HttpClient;
use crate::roster::SourceDescriptor;
use crate::schemas::{EventType, Record};

/// Federated public timeline
pub const PUBLIC_STREAM_PATH: &str = "/api/v1/streaming/public";

/// One dispatched server-sent event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseFrame {
    /// `:` line, used by servers as a heartbeat
    Comment(String),
    Event { event: Option<String>, data: String },
}

/// Incremental `text/event-stream` decoder. Chunks may split lines anywhere,
/// including inside a multi-byte character.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feeds a chunk and returns every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buffer.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line);
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }
        frames
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            if self.data.is_empty() && self.event.is_none() {
                return None;
            }
            let data = self.data.join("\n");
            self.data.clear();
            return Some(SseFrame::Event {
                event: self.event.take(),
                data,
            });
        }

        if let Some(comment) = line.strip_prefix(':') {
            return Some(SseFrame::Comment(comment.trim().to_string()));
        }

        let (field, value) = match line.find(':') {
            Some(i) => {
                let value = &line[i + 1..];
                (&line[..i], value.strip_prefix(' ').unwrap_or(value))
            }
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            // id and retry carry nothing we use
            _ => {}
        }
        None
    }
}

/// Converts a frame into a stream message. Events without a payload are
/// dropped; an undecodable payload is a decode error for that event only.
pub fn frame_to_message(frame: SseFrame) -> Result<Option<StreamMessage>> {
    let (event, data) = match frame {
        SseFrame::Comment(_) => return Ok(Some(StreamMessage::Heartbeat)),
        SseFrame::Event { event, data } => (event, data),
    };

    let event_type = EventType::from(event.as_deref().unwrap_or("message"));
    let payload = data.trim();
    if payload.is_empty() {
        debug!(event = %event_type, "Dropping event without payload");
        return Ok(None);
    }

    let record = match event_type {
        EventType::Delete => {
            // A bare id, occasionally sent as a JSON string
            let id = match serde_json::from_str::<Value>(payload) {
                Ok(Value::String(s)) => s,
                _ => payload.to_string(),
            };
            let mut fields = Map::new();
            fields.insert("id".to_string(), Value::String(id));
            Record::new(fields)
        }
        _ => {
            let value: Value = serde_json::from_str(payload).map_err(|e| {
                IngestionError::SseError(format!("{} payload: {}", event_type, e))
            })?;
            Record::from_value(value)?
        }
    };

    Ok(Some(StreamMessage::Event { event_type, record }))
}

struct DecodeState<S> {
    bytes: S,
    decoder: SseDecoder,
    pending: VecDeque<Result<StreamMessage>>,
    done: bool,
}

/// Wraps a byte stream as an `EventStream`. A transport error is yielded once
/// and ends the stream.
pub fn decode_event_stream<S, B, E>(bytes: S) -> EventStream
where
    S: Stream<Item = std::result::Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
    E: Into<IngestionError> + Send + 'static,
{
    let state = DecodeState {
        bytes: Box::pin(bytes),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        done: false,
    };

    Box::pin(futures::stream::unfold(state, |mut st| async move {
        loop {
            if let Some(item) = st.pending.pop_front() {
                return Some((item, st));
            }
            if st.done {
                return None;
            }
            match st.bytes.next().await {
                Some(Ok(chunk)) => {
                    for frame in st.decoder.push(chunk.as_ref()) {
                        if let Some(message) = frame_to_message(frame).transpose() {
                            st.pending.push_back(message);
                        }
                    }
                }
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e.into()), st));
                }
                None => return None,
            }
        }
    }))
}

/// Subscribes to `GET {api_base_url}/api/v1/streaming/public`
pub struct MastodonStreamClient {
    http: Arc<HttpClient>,
}

impl MastodonStreamClient {
    pub fn new(http: Arc<HttpClient>) -> Self {
        Self { http }
    }
}

#[async_trait]
impl EventStreamClient for MastodonStreamClient {
    async fn subscribe(&self, source: &SourceDescriptor) -> Result<EventStream> {
        let url = source.endpoint(PUBLIC_STREAM_PATH)?;
        let response = self
            .http
            .open_stream(url, source.credential.as_deref())
            .await?;
        Ok(decode_event_stream(response.bytes_stream()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SAMPLE: &str = concat!(
        ":thump\n",
        "\n",
        "event: update\n",
        "data: {\"id\": \"109\", \"url\": \"https://example.social/@a/109\"}\n",
        "\n",
        "event: delete\n",
        "data: 108\n",
        "\n",
    );

    #[test]
    fn test_decoder_handles_split_chunks() {
        let mut decoder = SseDecoder::new();
        let bytes = SAMPLE.as_bytes();
        let mut frames = Vec::new();
        for chunk in bytes.chunks(7) {
            frames.extend(decoder.push(chunk));
        }

        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0], SseFrame::Comment("thump".into()));
        assert_eq!(
            frames[2],
            SseFrame::Event {
                event: Some("delete".into()),
                data: "108".into()
            }
        );
    }

    #[test]
    fn test_multiline_data_and_crlf() {
        let mut decoder = SseDecoder::new();
        let frames = decoder.push(b"event: update\r\ndata: {\"a\":\r\ndata: 1}\r\n\r\n");
        assert_eq!(
            frames,
            vec![SseFrame::Event {
                event: Some("update".into()),
                data: "{\"a\":\n1}".into()
            }]
        );
        let message = frame_to_message(frames[0].clone()).unwrap().unwrap();
        assert!(matches!(message, StreamMessage::Event { event_type: EventType::Update, .. }));
    }

    #[test]
    fn test_delete_becomes_id_record() {
        let message = frame_to_message(SseFrame::Event {
            event: Some("delete".into()),
            data: "108".into(),
        })
        .unwrap()
        .unwrap();

        match message {
            StreamMessage::Event { event_type, record } => {
                assert_eq!(event_type, EventType::Delete);
                assert_eq!(record.identity_key("id").as_deref(), Some("108"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_bad_payload_is_decode_error() {
        let err = frame_to_message(SseFrame::Event {
            event: Some("update".into()),
            data: "{not json".into(),
        })
        .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Decode);
    }

    #[tokio::test]
    async fn test_decode_event_stream() {
        let chunks: Vec<std::result::Result<Vec<u8>, IngestionError>> =
            vec![Ok(SAMPLE.as_bytes()[..20].to_vec()), Ok(SAMPLE.as_bytes()[20..].to_vec())];
        let messages: Vec<_> = decode_event_stream(futures::stream::iter(chunks))
            .collect::<Vec<_>>()
            .await;

        assert_eq!(messages.len(), 3);
        assert!(matches!(messages[0], Ok(StreamMessage::Heartbeat)));
        assert!(matches!(
            messages[1],
            Ok(StreamMessage::Event { event_type: EventType::Update, .. })
        ));
    }

    #[tokio::test]
    async fn test_subscribe_against_server() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path(PUBLIC_STREAM_PATH))
            .and(header("authorization", "Bearer tok"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(SAMPLE),
            )
            .mount(&server)
            .await;

        let client = MastodonStreamClient::new(Arc::new(HttpClient::with_defaults().unwrap()));
        let source = SourceDescriptor::new(&server.uri(), Some("tok".into())).unwrap();
        let stream = client.subscribe(&source).await.unwrap();
        let messages: Vec<_> = stream.collect().await;

        assert_eq!(messages.len(), 3);
        assert!(messages.iter().all(|m| m.is_ok()));
    }
}
