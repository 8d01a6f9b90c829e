//! Streaming transport helpers.
//!
//! Upstream bodies arrive as arbitrary byte chunks. [`SseDataReader`]
//! reassembles server-sent-event `data:` payloads across chunk boundaries and
//! [`JsonArrayReader`] does the same for a streamed top-level JSON array.
//! A [`ChunkDecoder`] turns those payloads into canonical chunks, and
//! [`sse_body`] encodes canonical chunks back into an SSE response body
//! terminated by `data: [DONE]`.

use axum::body::Body;
use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use serde::Serialize;

use super::types::{ChatCompletionChunk, Usage};
use crate::error::{Error, Result};

/// Cap on buffered bytes without a line terminator.
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Cap on buffered bytes for a single JSON array element.
const MAX_ELEMENT_BYTES: usize = 4 * 1024 * 1024;

/// Terminal sentinel of an SSE completion stream.
pub const SSE_DONE: &[u8] = b"data: [DONE]\n\n";

/// Canonical chunk stream produced by provider adapters.
pub type ChunkStream = BoxStream<'static, Result<ChatCompletionChunk>>;

/// A payload outgrew its reader's buffer cap. The reader ignores all input
/// after reporting it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("stream payload exceeds {limit} bytes")]
pub struct Oversized {
    pub limit: usize,
}

impl Oversized {
    /// Translation failure attributed to `provider`.
    pub fn into_error(self, provider: &str) -> Error {
        Error::Translation {
            provider: provider.to_string(),
            message: self.to_string(),
            raw: String::new(),
        }
    }
}

/// Output of one reader push: completed payloads, then at most one overflow.
pub type Payloads = Vec<std::result::Result<String, Oversized>>;

/// Line-buffered extraction of `data:` payloads from an SSE byte stream.
///
/// Handles CRLF line endings, `data:` with or without a following space and
/// ignores `event:`, `id:`, `retry:` and comment lines. A line longer than
/// 64 KiB ends the stream with [`Oversized`].
#[derive(Debug, Default)]
pub struct SseDataReader {
    buffer: Vec<u8>,
    overflowed: bool,
}

impl SseDataReader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes; returns the data payloads completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Payloads {
        if self.overflowed {
            return Vec::new();
        }
        self.buffer.extend_from_slice(bytes);

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            if let Some(data) = Self::data_of(&line[..line.len() - 1]) {
                payloads.push(Ok(data));
            }
        }

        if self.buffer.len() > MAX_LINE_BYTES {
            tracing::warn!(
                buffered = self.buffer.len(),
                limit = MAX_LINE_BYTES,
                "SSE line exceeds buffer cap"
            );
            self.buffer = Vec::new();
            self.overflowed = true;
            payloads.push(Err(Oversized {
                limit: MAX_LINE_BYTES,
            }));
        }
        payloads
    }

    /// Treat any remaining bytes as a final line.
    pub fn finish(&mut self) -> Option<String> {
        let line = std::mem::take(&mut self.buffer);
        Self::data_of(&line)
    }

    fn data_of(line: &[u8]) -> Option<String> {
        let line = line.strip_suffix(b"\r").unwrap_or(line);
        let text = std::str::from_utf8(line).ok()?;
        let data = text.strip_prefix("data:")?;
        Some(data.strip_prefix(' ').unwrap_or(data).to_string())
    }
}

/// Incremental splitter for a streamed top-level JSON array of objects.
///
/// Yields the raw text of each complete element as soon as its closing brace
/// arrives. Separators, whitespace and the enclosing brackets are skipped.
/// An element larger than 4 MiB ends the stream with [`Oversized`].
#[derive(Debug, Default)]
pub struct JsonArrayReader {
    element: Vec<u8>,
    depth: usize,
    in_string: bool,
    escaped: bool,
    overflowed: bool,
}

impl JsonArrayReader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) -> Payloads {
        if self.overflowed {
            return Vec::new();
        }
        let mut elements = Vec::new();

        for &b in bytes {
            if self.depth == 0 {
                // Between elements: only an opening brace starts a new one.
                if b == b'{' {
                    self.depth = 1;
                    self.element.push(b);
                }
                continue;
            }

            self.element.push(b);
            if self.in_string {
                match (self.escaped, b) {
                    (true, _) => self.escaped = false,
                    (false, b'\\') => self.escaped = true,
                    (false, b'"') => self.in_string = false,
                    _ => {}
                }
                continue;
            }

            match b {
                b'"' => self.in_string = true,
                b'{' | b'[' => self.depth += 1,
                b'}' | b']' => {
                    self.depth -= 1;
                    if self.depth == 0 {
                        let raw = std::mem::take(&mut self.element);
                        elements.push(Ok(String::from_utf8_lossy(&raw).into_owned()));
                    }
                }
                _ => {}
            }
        }

        if self.element.len() > MAX_ELEMENT_BYTES {
            tracing::warn!(
                buffered = self.element.len(),
                limit = MAX_ELEMENT_BYTES,
                "JSON stream element exceeds buffer cap"
            );
            self.element = Vec::new();
            self.depth = 0;
            self.overflowed = true;
            elements.push(Err(Oversized {
                limit: MAX_ELEMENT_BYTES,
            }));
        }
        elements
    }

    /// Bytes of an element that never completed.
    pub fn pending(&self) -> Option<String> {
        (!self.element.is_empty()).then(|| String::from_utf8_lossy(&self.element).into_owned())
    }
}

/// Converts a provider's streamed body into canonical chunks.
pub trait ChunkDecoder: Send + 'static {
    /// Decode the payloads completed by `bytes`.
    fn decode(&mut self, bytes: &[u8]) -> Vec<Result<ChatCompletionChunk>>;

    /// Called once when the upstream body ends.
    fn finish(&mut self) -> Vec<Result<ChatCompletionChunk>>;
}

/// Drive `decoder` over an upstream byte stream.
///
/// The stream ends after the first error. Dropping it drops the upstream
/// body, which releases the connection.
pub fn decode_stream<S, D>(upstream: S, decoder: D, provider: &str) -> ChunkStream
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
    D: ChunkDecoder,
{
    let provider = provider.to_string();
    let state = (upstream.boxed(), decoder, false);

    stream::unfold(state, move |(mut upstream, mut decoder, finished)| {
        let provider = provider.clone();
        async move {
            if finished {
                return None;
            }
            match upstream.next().await {
                Some(Ok(bytes)) => {
                    let batch = decoder.decode(&bytes);
                    Some((batch, (upstream, decoder, false)))
                }
                Some(Err(e)) => {
                    let err = Error::upstream(provider, e);
                    Some((vec![Err(err)], (upstream, decoder, true)))
                }
                None => {
                    let batch = decoder.finish();
                    Some((batch, (upstream, decoder, true)))
                }
            }
        }
    })
    .flat_map(stream::iter)
    .scan(false, |failed, item| {
        if *failed {
            return futures::future::ready(None);
        }
        *failed = item.is_err();
        futures::future::ready(Some(item))
    })
    .boxed()
}

/// One SSE event carrying `value` as JSON.
pub fn sse_event<T: Serialize>(value: &T) -> Bytes {
    match serde_json::to_string(value) {
        Ok(json) => Bytes::from(format!("data: {}\n\n", json)),
        Err(e) => Bytes::from(format!(
            "data: {{\"error\":{{\"message\":\"{}\",\"type\":\"internal_error\"}}}}\n\n",
            e
        )),
    }
}

/// SSE event carrying the canonical error envelope.
pub fn sse_error(error: &Error) -> Bytes {
    sse_event(&serde_json::json!({
        "error": {
            "message": error.to_string(),
            "type": error.error_type(),
            "code": error.status_code().as_u16(),
        }
    }))
}

/// Encode canonical chunks as an SSE body.
///
/// `shape` maps each chunk to the wire object (chat chunk or text completion).
/// `on_usage` fires for every chunk carrying usage. A clean end is followed by
/// `data: [DONE]`; an error is sent as a final error event instead.
pub fn sse_body<T, F, U>(chunks: ChunkStream, shape: F, mut on_usage: U) -> Body
where
    T: Serialize,
    F: Fn(ChatCompletionChunk) -> T + Send + 'static,
    U: FnMut(Usage) + Send + 'static,
{
    let events = chunks
        .map(move |item| match item {
            Ok(chunk) => {
                if let Some(usage) = chunk.usage {
                    on_usage(usage);
                }
                (sse_event(&shape(chunk)), false)
            }
            Err(e) => {
                tracing::error!(error = %e, "Error in upstream stream");
                (sse_error(&e), true)
            }
        })
        .scan(false, |errored, (bytes, is_error)| {
            if *errored {
                return futures::future::ready(None);
            }
            *errored = is_error;
            futures::future::ready(Some((bytes, is_error)))
        });

    // [DONE] only follows a stream that ended without an error event.
    let body = stream::unfold(
        (events.boxed(), false, false),
        |(mut events, errored, done)| async move {
            if done {
                return None;
            }
            match events.next().await {
                Some((bytes, is_error)) => Some((bytes, (events, errored || is_error, false))),
                None if errored => None,
                None => Some((Bytes::from_static(SSE_DONE), (events, errored, true))),
            }
        },
    )
    .map(Ok::<_, std::io::Error>);

    Body::from_stream(body)
}
