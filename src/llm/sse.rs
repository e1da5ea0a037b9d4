//! Incremental decoding of `text/event-stream` response bodies.
//!
//! The decoder is pull driven: each poll of the returned stream reads from the
//! body only when no complete line is left in the buffer, so nothing beyond the
//! undecoded tail of the last network chunk is held between pulls. Dropping the
//! stream drops the body and with it the connection.

use bytes::{ Bytes, BytesMut };
use futures::{ stream, Stream, StreamExt };
use log::{ debug, warn };
use std::fmt;
use std::pin::Pin;

use super::CompletionError;

pub type TextStream = Pin<Box<dyn Stream<Item = Result<String, CompletionError>> + Send>>;

type BodyStream = Pin<Box<dyn Stream<Item = Result<Bytes, CompletionError>> + Send>>;

/// One decoded unit of a provider stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    Content(String),
    Done,
    /// The provider reported an error inside a 2xx stream.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedLine {
    pub line: String,
    pub reason: String,
}

impl fmt::Display for MalformedLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (line: {})", self.reason, self.line)
    }
}

/// Turns individual SSE lines into [`StreamEvent`]s for one provider format.
pub trait EventParser: Send {
    /// `Ok(None)` means the line carried nothing to emit (blank, comment,
    /// metadata). `Err` marks a line that should have carried a payload but
    /// could not be decoded; the decoder skips it.
    fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>, MalformedLine>;

    /// Called once when the body ends without a terminal event.
    fn finish(&mut self) -> Option<StreamEvent> {
        None
    }
}

/// Returns the payload of an SSE field line, e.g. `field_value("data: x", "data") == Some("x")`.
pub fn field_value<'a>(line: &'a str, field: &str) -> Option<&'a str> {
    let rest = line.strip_prefix(field)?.strip_prefix(':')?;
    Some(rest.strip_prefix(' ').unwrap_or(rest))
}

/// Longest partial line the decoder buffers before giving up on the body.
pub const MAX_LINE_BYTES: usize = 1 << 20;

/// Accumulates raw body bytes and hands out complete lines.
#[derive(Debug)]
pub struct LineBuffer {
    buf: BytesMut,
    /// Bytes already searched for a newline.
    scanned: usize,
    max_line: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_max_line(MAX_LINE_BYTES)
    }
}

impl LineBuffer {
    pub fn with_max_line(max_line: usize) -> Self {
        Self { buf: BytesMut::new(), scanned: 0, max_line }
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Terminates a trailing unterminated line so it can be drained.
    pub fn close(&mut self) {
        if !self.buf.is_empty() && !self.buf.ends_with(b"\n") {
            self.buf.extend_from_slice(b"\n");
        }
    }

    pub fn next_line(&mut self) -> Option<String> {
        let Some(offset) = self.buf[self.scanned..].iter().position(|b| *b == b'\n') else {
            self.scanned = self.buf.len();
            return None;
        };
        let pos = self.scanned + offset;
        self.scanned = 0;
        let raw = self.buf.split_to(pos + 1);
        let mut line = &raw[..pos];
        if let Some(stripped) = line.strip_suffix(b"\r") {
            line = stripped;
        }
        Some(String::from_utf8_lossy(line).into_owned())
    }

    /// True once the unterminated tail is longer than the line limit.
    pub fn overflowed(&self) -> bool {
        self.buf.len() > self.max_line
    }

    pub fn max_line(&self) -> usize {
        self.max_line
    }
}

struct EventDecoder<P> {
    body: BodyStream,
    lines: LineBuffer,
    parser: P,
    eof: bool,
    finished: bool,
    skipped: usize,
}

impl<P: EventParser> EventDecoder<P> {
    async fn next_fragment(&mut self) -> Option<Result<String, CompletionError>> {
        if self.finished {
            return None;
        }
        loop {
            while let Some(line) = self.lines.next_line() {
                match self.parser.parse_line(&line) {
                    Ok(Some(event)) => {
                        return self.emit(event);
                    }
                    Ok(None) => {}
                    Err(malformed) => {
                        self.skipped += 1;
                        debug!("Skipping malformed stream line: {}", malformed);
                    }
                }
            }

            if self.lines.overflowed() {
                self.close();
                return Some(
                    Err(CompletionError::Stream(format!("stream line exceeds {} bytes", self.lines.max_line())))
                );
            }

            if self.eof {
                return match self.parser.finish() {
                    Some(event) => self.emit(event),
                    None => {
                        self.close();
                        None
                    }
                };
            }

            match self.body.next().await {
                Some(Ok(chunk)) => self.lines.push(&chunk),
                Some(Err(e)) => {
                    self.close();
                    return Some(Err(e));
                }
                None => {
                    self.lines.close();
                    self.eof = true;
                }
            }
        }
    }

    fn emit(&mut self, event: StreamEvent) -> Option<Result<String, CompletionError>> {
        match event {
            StreamEvent::Content(text) => Some(Ok(text)),
            StreamEvent::Done => {
                self.close();
                None
            }
            StreamEvent::Failed(message) => {
                self.close();
                Some(Err(CompletionError::Stream(message)))
            }
        }
    }

    fn close(&mut self) {
        self.finished = true;
        if self.skipped > 0 {
            warn!("Skipped {} malformed stream line(s)", self.skipped);
        }
    }
}

/// Decodes an SSE body into a lazy stream of text fragments.
pub fn decode_event_stream<S, E, P>(body: S, parser: P) -> TextStream
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<CompletionError> + 'static,
        P: EventParser + 'static
{
    decode_with_buffer(body, parser, LineBuffer::default())
}

fn decode_with_buffer<S, E, P>(body: S, parser: P, lines: LineBuffer) -> TextStream
    where
        S: Stream<Item = Result<Bytes, E>> + Send + 'static,
        E: Into<CompletionError> + 'static,
        P: EventParser + 'static
{
    let body: BodyStream = Box::pin(body.map(|chunk| chunk.map_err(Into::<CompletionError>::into)));
    let decoder = EventDecoder {
        body,
        lines,
        parser,
        eof: false,
        finished: false,
        skipped: 0,
    };

    Box::pin(
        stream::unfold(decoder, |mut decoder| async move {
            let item = decoder.next_fragment().await?;
            Some((item, decoder))
        })
    )
}

/// Wraps an already complete reply as a single-fragment stream.
pub fn single_fragment(text: String) -> TextStream {
    let items = if text.is_empty() { Vec::new() } else { vec![Ok(text)] };
    Box::pin(stream::iter(items))
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Emits every `data:` line verbatim, `data: END` terminates, `data: !` is malformed.
    struct EchoParser;

    impl EventParser for EchoParser {
        fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>, MalformedLine> {
            match field_value(line, "data") {
                Some("END") => Ok(Some(StreamEvent::Done)),
                Some("FAIL") => Ok(Some(StreamEvent::Failed("boom".to_string()))),
                Some("!") =>
                    Err(MalformedLine { line: line.to_string(), reason: "bang".to_string() }),
                Some(data) => Ok(Some(StreamEvent::Content(data.to_string()))),
                None => Ok(None),
            }
        }
    }

    fn body(chunks: &[&'static str]) -> impl Stream<Item = Result<Bytes, CompletionError>> + Send {
        let items: Vec<Result<Bytes, CompletionError>> = chunks
            .iter()
            .copied()
            .map(|c| Ok(Bytes::from_static(c.as_bytes())))
            .collect();
        stream::iter(items)
    }

    async fn collect(stream: TextStream) -> Vec<Result<String, CompletionError>> {
        stream.collect().await
    }

    #[test]
    fn line_buffer_strips_crlf_and_keeps_partial_tail() {
        let mut lines = LineBuffer::default();
        lines.push(b"data: a\r\ndata: b");
        assert_eq!(lines.next_line().as_deref(), Some("data: a"));
        assert_eq!(lines.next_line(), None);
        lines.push(b"c\n");
        assert_eq!(lines.next_line().as_deref(), Some("data: bc"));
    }

    #[test]
    fn line_buffer_reassembles_split_utf8() {
        let mut lines = LineBuffer::default();
        let text = "data: caf\u{e9}\n".as_bytes();
        let split = text.len() - 2;
        lines.push(&text[..split]);
        assert_eq!(lines.next_line(), None);
        lines.push(&text[split..]);
        assert_eq!(lines.next_line().as_deref(), Some("data: caf\u{e9}"));
    }

    #[test]
    fn line_split_over_many_chunks_is_found_once_terminated() {
        let mut lines = LineBuffer::default();
        lines.push(b"data: ");
        for _ in 0..1000 {
            lines.push(b"x");
            assert_eq!(lines.next_line(), None);
        }
        lines.push(b"\ndata: y\n");
        assert_eq!(lines.next_line().map(|l| l.len()), Some(1006));
        assert_eq!(lines.next_line().as_deref(), Some("data: y"));
        assert_eq!(lines.next_line(), None);
    }

    #[test]
    fn oversized_partial_line_overflows() {
        let mut lines = LineBuffer::with_max_line(8);
        lines.push(b"data: 01");
        assert!(!lines.overflowed());
        lines.push(b"2");
        assert_eq!(lines.next_line(), None);
        assert!(lines.overflowed());
    }

    #[tokio::test]
    async fn endless_line_fails_the_stream() {
        let chunks: Vec<Result<Bytes, CompletionError>> = vec![
            Ok(Bytes::from_static(b"data: a\n")),
            Ok(Bytes::from_static(b"data: 0123456789")),
            Ok(Bytes::from_static(b"0123456789"))
        ];
        let results = collect(decode_with_buffer(stream::iter(chunks), EchoParser, LineBuffer::with_max_line(16))).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_deref().ok(), Some("a"));
        assert!(matches!(&results[1], Err(CompletionError::Stream(msg)) if msg.contains("16 bytes")));
    }

    #[test]
    fn field_value_accepts_optional_space() {
        assert_eq!(field_value("data: x", "data"), Some("x"));
        assert_eq!(field_value("data:x", "data"), Some("x"));
        assert_eq!(field_value("event: output", "data"), None);
        assert_eq!(field_value("dataset: x", "data"), None);
    }

    #[tokio::test]
    async fn yields_fragments_across_chunk_boundaries() {
        let stream = decode_event_stream(body(&["data: he", "llo\ndata: wor", "ld\n"]), EchoParser);
        let items: Vec<String> = collect(stream)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(items, vec!["hello", "world"]);
    }

    #[tokio::test]
    async fn terminal_event_ignores_trailing_bytes() {
        let stream = decode_event_stream(
            body(&["data: a\ndata: END\ndata: b\n", "data: c\n"]),
            EchoParser
        );
        let items: Vec<String> = collect(stream)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(items, vec!["a"]);
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let stream = decode_event_stream(body(&["data: !\ndata: a\ndata: !\ndata: b\n"]), EchoParser);
        let items: Vec<String> = collect(stream)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(items, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn unterminated_last_line_is_decoded() {
        let stream = decode_event_stream(body(&["data: a\ndata: b"]), EchoParser);
        let items: Vec<String> = collect(stream)
            .await
            .into_iter()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(items, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn body_error_ends_stream_after_partial_output() {
        let items: Vec<Result<Bytes, CompletionError>> = vec![
            Ok(Bytes::from_static(b"data: a\n")),
            Err(CompletionError::Stream("reset".to_string())),
            Ok(Bytes::from_static(b"data: b\n"))
        ];
        let results = collect(decode_event_stream(stream::iter(items), EchoParser)).await;
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].as_deref().ok(), Some("a"));
        assert!(matches!(results[1], Err(CompletionError::Stream(_))));
    }

    #[tokio::test]
    async fn failed_event_surfaces_as_stream_error() {
        let results = collect(decode_event_stream(body(&["data: a\ndata: FAIL\ndata: b\n"]), EchoParser)).await;
        assert_eq!(results.len(), 2);
        assert!(matches!(&results[1], Err(CompletionError::Stream(msg)) if msg == "boom"));
    }

    #[tokio::test]
    async fn single_fragment_skips_empty_text() {
        assert!(collect(single_fragment(String::new())).await.is_empty());
        let items = collect(single_fragment("full reply".to_string())).await;
        assert_eq!(items[0].as_deref().ok(), Some("full reply"));
    }
}
