//! Server-Sent Events framing shared by the upstream provider client and the
//! RPC client.
//!
//! Handles line buffering across chunk boundaries, `\r\n` endings, comments,
//! multi-line `data:` fields, and a trailing frame without a blank line.

use std::collections::VecDeque;

use bytes::{Buf, Bytes, BytesMut};
use futures::{Stream, StreamExt};

/// One dispatched SSE frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SseFrame {
    pub event: Option<String>,
    pub data: String,
}

impl SseFrame {
    /// The event name, defaulting to `message` as browsers do.
    pub fn event_name(&self) -> &str {
        self.event.as_deref().unwrap_or("message")
    }
}

/// Incremental decoder: push raw chunks, receive complete frames.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: BytesMut,
    event: Option<String>,
    data: Vec<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseFrame> {
        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        while let Some(newline_pos) = self.buffer.iter().position(|&b| b == b'\n') {
            let mut line = self.buffer.split_to(newline_pos + 1);
            line.truncate(line.len() - 1);
            if line.last() == Some(&b'\r') {
                line.truncate(line.len() - 1);
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            if let Some(frame) = self.process_line(&line) {
                frames.push(frame);
            }
        }

        frames
    }

    /// Flush whatever is left once the underlying stream has ended.
    pub fn finish(&mut self) -> Option<SseFrame> {
        if self.buffer.has_remaining() {
            let rest = std::mem::take(&mut self.buffer);
            let line = String::from_utf8_lossy(&rest);
            let line = line.trim_end_matches(['\r', '\n']).to_string();
            if let Some(frame) = self.process_line(&line) {
                return Some(frame);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            return self.dispatch();
        }
        if line.starts_with(':') {
            return None;
        }

        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line, ""),
        };

        match field {
            "event" => self.event = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {} // id, retry
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseFrame> {
        let event = self.event.take();
        if self.data.is_empty() {
            return None;
        }
        let data = std::mem::take(&mut self.data).join("\n");
        Some(SseFrame { event, data })
    }
}

/// Turn a byte stream into a stream of SSE frames. Transport errors are
/// forwarded and end the stream.
pub fn frames<S, E>(byte_stream: S) -> impl Stream<Item = Result<SseFrame, E>> + Send
where
    S: Stream<Item = Result<Bytes, E>> + Send + Unpin + 'static,
    E: Send + 'static,
{
    futures::stream::unfold(
        (byte_stream, SseDecoder::new(), VecDeque::new(), false),
        |(mut stream, mut decoder, mut pending, mut done)| async move {
            loop {
                if let Some(frame) = pending.pop_front() {
                    return Some((Ok(frame), (stream, decoder, pending, done)));
                }
                if done {
                    return None;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => pending.extend(decoder.push(&chunk)),
                    Some(Err(e)) => {
                        return Some((Err(e), (stream, decoder, pending, true)));
                    }
                    None => {
                        done = true;
                        pending.extend(decoder.finish());
                    }
                }
            }
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_frame() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"data: {\"a\":1}\n\n");
        assert_eq!(frames, vec![SseFrame { event: None, data: "{\"a\":1}".into() }]);
        assert_eq!(frames[0].event_name(), "message");
    }

    #[test]
    fn named_event_and_crlf() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"event: error\r\ndata: boom\r\n\r\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event_name(), "error");
        assert_eq!(frames[0].data, "boom");
    }

    #[test]
    fn frame_split_across_chunks() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: hel").is_empty());
        assert!(d.push(b"lo\n").is_empty());
        let frames = d.push(b"\n");
        assert_eq!(frames[0].data, "hello");
    }

    #[test]
    fn multi_line_data_joined() {
        let mut d = SseDecoder::new();
        let frames = d.push(b"data: one\ndata: two\n\n");
        assert_eq!(frames[0].data, "one\ntwo");
    }

    #[test]
    fn comments_and_unknown_fields_ignored() {
        let mut d = SseDecoder::new();
        let frames = d.push(b": keep-alive\nid: 7\nretry: 100\n\ndata:x\n\n");
        assert_eq!(frames, vec![SseFrame { event: None, data: "x".into() }]);
    }

    #[test]
    fn blank_frame_without_data_not_dispatched() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"event: ping\n\n").is_empty());
        let frames = d.push(b"data: after\n\n");
        assert_eq!(frames[0].event, None, "event name must reset after a blank line");
    }

    #[test]
    fn finish_flushes_trailing_frame() {
        let mut d = SseDecoder::new();
        assert!(d.push(b"data: [DONE]").is_empty());
        assert_eq!(d.finish().unwrap().data, "[DONE]");
        assert!(d.finish().is_none());
    }

    #[tokio::test]
    async fn frames_over_chunked_stream() {
        let chunks: Vec<Result<Bytes, std::io::Error>> = vec![
            Ok(Bytes::from_static(b"data: a\n\nda")),
            Ok(Bytes::from_static(b"ta: b\n\n")),
            Ok(Bytes::from_static(b"data: c")),
        ];
        let collected: Vec<_> = frames(futures::stream::iter(chunks))
            .map(|f| f.unwrap().data)
            .collect()
            .await;
        assert_eq!(collected, vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn frames_forward_transport_error() {
        let chunks: Vec<Result<Bytes, &'static str>> = vec![
            Ok(Bytes::from_static(b"data: a\n\n")),
            Err("reset"),
            Ok(Bytes::from_static(b"data: never\n\n")),
        ];
        let collected: Vec<_> = frames(futures::stream::iter(chunks)).collect().await;
        assert_eq!(collected.len(), 2);
        assert!(collected[0].is_ok());
        assert_eq!(collected[1].as_ref().unwrap_err(), &"reset");
    }
}
