use std::collections::VecDeque;

use async_trait::async_trait;
use futures_util::{stream, StreamExt};
use reqwest::header::{HeaderValue, ACCEPT, AUTHORIZATION, CACHE_CONTROL};
use reqwest::Client;
use tracing::debug;

use crate::stream::client::StreamClientError;
use crate::transport::{bearer_value, FrameStream, OpenRequest, Transport};

/// HTTP streaming GET transport.
///
/// Frames are either SSE `data:` payloads or bare newline-delimited lines;
/// both may appear on the same response.
#[derive(Clone, Debug)]
pub struct SseTransport {
    http: Client,
}

impl SseTransport {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn open(&self, request: OpenRequest) -> Result<FrameStream, StreamClientError> {
        let mut builder = self
            .http
            .get(request.url.clone())
            .header(ACCEPT, "text/event-stream")
            .header(CACHE_CONTROL, "no-cache");

        if let Some(token) = &request.token {
            let mut value = HeaderValue::from_str(&bearer_value(token))
                .map_err(|_| StreamClientError::InvalidToken)?;
            value.set_sensitive(true);
            builder = builder.header(AUTHORIZATION, value);
        }

        let response = builder.send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(StreamClientError::Status(status.as_u16()));
        }
        debug!(event = "sse_response_open", status = status.as_u16());

        let body = Box::pin(response.bytes_stream().fuse());
        let frames = stream::unfold(
            (body, SseDecoder::default(), VecDeque::new()),
            |(mut body, mut decoder, mut ready)| async move {
                loop {
                    if let Some(frame) = ready.pop_front() {
                        return Some((Ok(frame), (body, decoder, ready)));
                    }
                    match body.next().await {
                        Some(Ok(chunk)) => match decoder.feed(&chunk) {
                            Ok(frames) => ready.extend(frames),
                            Err(err) => return Some((Err(err), (body, decoder, ready))),
                        },
                        Some(Err(err)) => {
                            return Some((Err(StreamClientError::Http(err)), (body, decoder, ready)))
                        }
                        None => {
                            let rest = decoder.finish();
                            if rest.is_empty() {
                                return None;
                            }
                            ready.extend(rest);
                        }
                    }
                }
            },
        );

        Ok(Box::pin(frames))
    }
}

/// Upper bound on bytes buffered for one pending frame.
pub const MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Incremental splitter from response body chunks into text frames.
///
/// Lines may be split across chunks at any byte, including inside a UTF-8
/// sequence. A pending line or `data:` block larger than the limit is an
/// error.
#[derive(Debug)]
pub struct SseDecoder {
    line: Vec<u8>,
    data: Vec<String>,
    data_len: usize,
    limit: usize,
}

impl Default for SseDecoder {
    fn default() -> Self {
        Self::with_limit(MAX_FRAME_BYTES)
    }
}

impl SseDecoder {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            line: Vec::new(),
            data: Vec::new(),
            data_len: 0,
            limit,
        }
    }

    /// Feeds one body chunk and returns the frames it completed.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<String>, StreamClientError> {
        let mut frames = Vec::new();
        for &byte in chunk {
            if byte == b'\n' {
                let raw = std::mem::take(&mut self.line);
                self.process_line(&String::from_utf8_lossy(&raw), &mut frames);
            } else {
                self.line.push(byte);
            }
            if self.line.len() + self.data_len > self.limit {
                self.line.clear();
                self.data.clear();
                self.data_len = 0;
                return Err(StreamClientError::FrameTooLarge { limit: self.limit });
            }
        }
        Ok(frames)
    }

    /// Flushes a trailing line and any pending `data:` block at end of body.
    pub fn finish(&mut self) -> Vec<String> {
        let mut frames = Vec::new();
        if !self.line.is_empty() {
            let raw = std::mem::take(&mut self.line);
            self.process_line(&String::from_utf8_lossy(&raw), &mut frames);
        }
        self.flush_data(&mut frames);
        frames
    }

    fn process_line(&mut self, line: &str, frames: &mut Vec<String>) {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line.is_empty() {
            self.flush_data(frames);
            return;
        }
        if line.starts_with(':') {
            return;
        }
        if let Some(rest) = line.strip_prefix("data:") {
            let value = rest.strip_prefix(' ').unwrap_or(rest);
            self.data_len += value.len() + 1;
            self.data.push(value.to_string());
            return;
        }
        if is_ignored_field(line) {
            return;
        }

        self.flush_data(frames);
        frames.push(line.to_string());
    }

    fn flush_data(&mut self, frames: &mut Vec<String>) {
        if self.data.is_empty() {
            return;
        }
        frames.push(self.data.join("\n"));
        self.data.clear();
        self.data_len = 0;
    }
}

fn is_ignored_field(line: &str) -> bool {
    ["event", "id", "retry"].iter().any(|field| {
        line.strip_prefix(field)
            .is_some_and(|rest| rest.is_empty() || rest.starts_with(':'))
    })
}
