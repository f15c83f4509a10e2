//! Incremental decoding of the chat response body.
//!
//! The backend answers a chat turn with one JSON object per line:
//! ```text
//! {"type":"tool","tool_status":"started","tool_call_id":"1","message":"Searching the news"}
//! {"type":"tool","tool_status":"ended","tool_call_id":"1"}
//! {"type":"model","message":"Here are"}
//! {"type":"model","message":" the latest updates"}
//! {"type":"title","message":{"title":"Stock market updates"}}
//! ```
//! There is no end marker; the stream is over when the body ends.

use std::fmt::Display;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{AbortHandle, Abortable, BoxStream};
use futures::{Stream, StreamExt};

use crate::error::StreamError;
use crate::protocol::ChatEvent;

/// Splits a byte stream into complete lines.
///
/// Bytes are buffered until a `\n` arrives, and each line is decoded as a
/// whole, so a multi-byte character split across reads is never mangled.
#[derive(Debug, Default)]
pub struct LineDecoder {
    buffer: Vec<u8>,
    /// Prefix of `buffer` already known to hold no `\n`.
    scanned: usize,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `chunk` and returns every non-blank line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buffer.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        let mut from = self.scanned;
        while let Some(offset) = self.buffer[from..].iter().position(|b| *b == b'\n') {
            let end = from + offset;
            if let Some(line) = decode_line(&self.buffer[start..end]) {
                lines.push(line);
            }
            start = end + 1;
            from = start;
        }
        self.buffer.drain(..start);
        self.scanned = self.buffer.len();
        lines
    }

    /// Takes whatever unterminated fragment is left once the body has ended.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        self.scanned = 0;
        decode_line(&rest)
    }

    pub fn pending(&self) -> usize {
        self.buffer.len()
    }
}

fn decode_line(raw: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(raw);
    let text = text.trim_end_matches('\r');
    if text.trim().is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Parses one line; malformed lines are logged and dropped.
pub fn parse_line(line: &str) -> Option<ChatEvent> {
    match ChatEvent::from_line(line) {
        Ok(ChatEvent::Unknown) => {
            tracing::debug!(line, "unrecognized chat event type");
            Some(ChatEvent::Unknown)
        }
        Ok(event) => Some(event),
        Err(err) => {
            tracing::warn!(line, error = %err, "failed to parse stream line");
            None
        }
    }
}

/// Turns a raw body stream into chat events.
///
/// A transport error ends the stream after yielding a single `Err`. When the
/// body ends cleanly, a final line without a trailing `\n` is still parsed
/// rather than discarded; a body that ends in `\n` yields exactly the same
/// events either way.
pub fn decode_events<S, E>(
    byte_stream: S,
) -> impl Stream<Item = Result<ChatEvent, StreamError>> + Send + 'static
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Display + Send + 'static,
{
    async_stream::stream! {
        let mut bytes_stream = std::pin::pin!(byte_stream);
        let mut decoder = LineDecoder::new();

        while let Some(chunk) = bytes_stream.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    tracing::warn!(error = %err, "chat stream interrupted");
                    yield Err(StreamError(err.to_string()));
                    return;
                }
            };

            for line in decoder.push(&chunk) {
                if let Some(event) = parse_line(&line) {
                    yield Ok(event);
                }
            }
        }

        if let Some(line) = decoder.finish() {
            tracing::debug!(line = %line, "parsing unterminated final line");
            if let Some(event) = parse_line(&line) {
                yield Ok(event);
            }
        }
    }
}

/// A single chat turn's event stream. Not restartable.
pub struct ChatStream {
    inner: Abortable<BoxStream<'static, Result<ChatEvent, StreamError>>>,
    handle: AbortHandle,
}

impl ChatStream {
    pub fn new<S, E>(byte_stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Display + Send + 'static,
    {
        let (inner, handle) = futures::stream::abortable(decode_events(byte_stream).boxed());
        Self { inner, handle }
    }

    pub fn from_response(response: reqwest::Response) -> Self {
        Self::new(response.bytes_stream())
    }

    /// Handle that ends the stream at its next poll and drops the body.
    pub fn abort_handle(&self) -> AbortHandle {
        self.handle.clone()
    }

    pub fn is_aborted(&self) -> bool {
        self.inner.is_aborted()
    }
}

impl Stream for ChatStream {
    type Item = Result<ChatEvent, StreamError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.inner).poll_next(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    const BODY: &str = concat!(
        "{\"type\":\"tool\",\"tool_status\":\"started\",\"tool_call_id\":\"1\",\"message\":\"Lecture des articles…\"}\n",
        "\n",
        "{\"type\":\"tool\",\"tool_status\":\"ended\",\"tool_call_id\":\"1\"}\r\n",
        "{\"type\":\"model\",\"message\":\"Caf\u{e9} \u{2615} prices\"}\n",
        "{\"type\":\"model\",\"message\":\" rose\"}\n",
        "{\"type\":\"title\",\"message\":{\"title\":\"Coffee\"}}\n",
    );

    async fn collect(chunks: Vec<Vec<u8>>) -> Vec<Result<ChatEvent, StreamError>> {
        let source = futures::stream::iter(
            chunks
                .into_iter()
                .map(|chunk| Ok::<Bytes, Infallible>(Bytes::from(chunk))),
        );
        ChatStream::new(source).collect().await
    }

    fn expected() -> Vec<Result<ChatEvent, StreamError>> {
        vec![
            Ok(ChatEvent::tool_started("1", Some("Lecture des articles…"))),
            Ok(ChatEvent::tool_ended("1")),
            Ok(ChatEvent::model("Caf\u{e9} \u{2615} prices")),
            Ok(ChatEvent::model(" rose")),
            Ok(ChatEvent::title("Coffee")),
        ]
    }

    #[tokio::test]
    async fn single_read_yields_all_events() {
        let events = collect(vec![BODY.as_bytes().to_vec()]).await;
        assert_eq!(events, expected());
    }

    #[tokio::test]
    async fn every_two_way_split_yields_same_events() {
        let bytes = BODY.as_bytes();
        for split in 0..=bytes.len() {
            let events = collect(vec![bytes[..split].to_vec(), bytes[split..].to_vec()]).await;
            assert_eq!(events, expected(), "split at byte {split}");
        }
    }

    #[tokio::test]
    async fn byte_at_a_time_yields_same_events() {
        let chunks = BODY.bytes().map(|b| vec![b]).collect();
        assert_eq!(collect(chunks).await, expected());
    }

    #[test]
    fn split_line_completes_only_with_second_chunk() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(br#"{"type":"mo"#).is_empty());
        assert_eq!(decoder.pending(), 11);
        let lines = decoder.push(b"del\",\"message\":\"Hi\"}\n");
        assert_eq!(lines, vec![r#"{"type":"model","message":"Hi"}"#.to_string()]);
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn long_line_in_small_chunks_is_scanned_once() {
        let line = format!(r#"{{"type":"model","message":"{}"}}"#, "x".repeat(4096));
        let mut decoder = LineDecoder::new();
        for chunk in line.as_bytes().chunks(3) {
            assert!(decoder.push(chunk).is_empty());
            assert_eq!(decoder.scanned, decoder.pending());
        }
        assert_eq!(decoder.push(b"\n{\"type\""), vec![line]);
        assert_eq!(decoder.pending(), 7);
        assert_eq!(decoder.scanned, 7);
    }

    #[test]
    fn blank_and_whitespace_lines_are_skipped() {
        let mut decoder = LineDecoder::new();
        assert!(decoder.push(b"\n   \n\t\r\n").is_empty());
        assert_eq!(decoder.finish(), None);
    }

    #[tokio::test]
    async fn malformed_line_does_not_stop_the_stream() {
        let events = collect(vec![
            b"{not json\n{\"type\":\"model\",\"message\":\"still here\"}\n".to_vec(),
        ])
        .await;
        assert_eq!(events, vec![Ok(ChatEvent::model("still here"))]);
    }

    #[tokio::test]
    async fn unterminated_final_line_is_parsed_at_end() {
        let events = collect(vec![b"{\"type\":\"model\",\"message\":\"tail\"}".to_vec()]).await;
        assert_eq!(events, vec![Ok(ChatEvent::model("tail"))]);
    }

    #[tokio::test]
    async fn transport_error_is_terminal() {
        let source = futures::stream::iter(vec![
            Ok(Bytes::from_static(b"{\"type\":\"model\",\"message\":\"a\"}\n")),
            Err("connection reset"),
            Ok(Bytes::from_static(b"{\"type\":\"model\",\"message\":\"b\"}\n")),
        ]);
        let events: Vec<_> = ChatStream::new(source).collect().await;
        assert_eq!(
            events,
            vec![
                Ok(ChatEvent::model("a")),
                Err(StreamError("connection reset".to_string())),
            ]
        );
    }

    #[tokio::test]
    async fn aborted_stream_yields_nothing_more() {
        let source = futures::stream::iter(vec![Ok::<Bytes, Infallible>(Bytes::from_static(
            b"{\"type\":\"model\",\"message\":\"a\"}\n",
        ))]);
        let mut stream = ChatStream::new(source);
        stream.abort_handle().abort();
        assert!(stream.next().await.is_none());
        assert!(stream.is_aborted());
    }
}
