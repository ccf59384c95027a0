//! Newline-delimited JSON streaming for the `/api/chat` endpoint.
//!
//! Provides [`StreamEvent`] and [`OllamaClient::chat_stream`], which turns a
//! streaming response into an async stream of thinking and content deltas as
//! they arrive off the wire.

use async_stream::try_stream;
use serde::Deserialize;
use tracing::{debug, trace, warn};

use crate::{ChatRequest, EventStream, GenerationError, OllamaClient};

/// A single event from a streaming generation pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// An incremental answer text delta.
    ContentDelta(String),
    /// An incremental chain-of-thought delta.
    ThinkingDelta(String),
    /// The stream is complete.
    Done,
}

/// One NDJSON line from the streaming API.
#[derive(Deserialize, Debug)]
struct StreamChunk {
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
    error: Option<String>,
}

#[derive(Deserialize, Debug)]
struct StreamMessage {
    #[serde(default)]
    content: String,
    thinking: Option<String>,
}

impl OllamaClient {
    /// Send a chat request with streaming enabled.
    ///
    /// The response body is read incrementally via `chunk()` so long answers
    /// never hit a single-body timeout. Dropping the returned stream drops
    /// the in-flight request.
    pub fn chat_stream(&self, body: ChatRequest) -> EventStream {
        let client = self.client.clone();
        let url = self.chat_url();

        Box::pin(try_stream! {
            let mut body = body;
            body.stream = true;
            debug!(
                "Sending streaming chat request: model={}, messages={}",
                body.model,
                body.messages.len()
            );

            let resp = client
                .post(&url)
                .json(&body)
                .send()
                .await
                .map_err(GenerationError::from)?;
            let mut resp = success_or_http_error(resp).await?;

            // Bytes, not text: a chunk may end inside a multi-byte character.
            let mut buffer: Vec<u8> = Vec::new();
            let mut done = false;
            let mut event_count = 0usize;

            while let Some(chunk) = resp.chunk().await.map_err(GenerationError::from)? {
                buffer.extend_from_slice(&chunk);

                while let Some(newline_pos) = buffer.iter().position(|&b| b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline_pos).collect();
                    for event in parse_ndjson_line(&String::from_utf8_lossy(&line))? {
                        if event == StreamEvent::Done {
                            done = true;
                        }
                        event_count += 1;
                        yield event;
                    }
                    if done {
                        break;
                    }
                }

                if done {
                    break;
                }
            }

            // Any remaining data in the buffer (final line without newline).
            if !done {
                for event in parse_ndjson_line(&String::from_utf8_lossy(&buffer))? {
                    if event == StreamEvent::Done {
                        done = true;
                    }
                    event_count += 1;
                    yield event;
                }
            }

            if !done {
                yield StreamEvent::Done;
            }

            debug!("Stream completed with {} events", event_count);
        })
    }
}

/// Pass a successful response through. Any other status becomes
/// [`GenerationError::Http`] carrying the response body.
async fn success_or_http_error(
    resp: reqwest::Response,
) -> Result<reqwest::Response, GenerationError> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body = resp.text().await.unwrap_or_default();
    Err(GenerationError::Http {
        status: status.as_u16(),
        body,
    })
}

/// Parse a single NDJSON line into stream events.
///
/// Blank and malformed lines produce no events. A line carrying an `error`
/// field fails the stream.
pub(crate) fn parse_ndjson_line(line: &str) -> Result<Vec<StreamEvent>, GenerationError> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(Vec::new());
    }

    let chunk = match serde_json::from_str::<StreamChunk>(line) {
        Ok(chunk) => chunk,
        Err(e) => {
            warn!("Failed to parse stream chunk: {e} (data: {line})");
            return Ok(Vec::new());
        }
    };

    if let Some(err) = chunk.error {
        return Err(GenerationError::Service(err));
    }

    let mut events = Vec::new();
    if let Some(message) = chunk.message {
        if let Some(thinking) = message.thinking
            && !thinking.is_empty()
        {
            events.push(StreamEvent::ThinkingDelta(thinking));
        }
        if !message.content.is_empty() {
            events.push(StreamEvent::ContentDelta(message.content));
        }
    }
    if chunk.done {
        trace!("Stream chunk marked done");
        events.push(StreamEvent::Done);
    }
    Ok(events)
}
