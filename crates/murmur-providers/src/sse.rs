//! Server-Sent Events decoding.
//!
//! [`SseDecoder`] is a push parser: feed it raw body bytes in whatever chunks
//! the network delivers and it yields complete events. [`parse_sse_stream`]
//! wraps it around a `reqwest::Response`.

use std::pin::Pin;

use futures::Stream;
use tokio_stream::StreamExt;

/// A parsed SSE event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseEvent {
    pub event: Option<String>,
    pub data: String,
    pub id: Option<String>,
}

#[derive(Debug, Default)]
pub struct SseDecoder {
    /// Raw bytes not yet terminated by a newline. Kept as bytes so a UTF-8
    /// sequence split across network chunks is decoded whole.
    pending: Vec<u8>,
    event: Option<String>,
    data: Vec<String>,
    id: Option<String>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Consume a body chunk and return every event it completes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        self.pending.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1]);
            let line = line.trim_end_matches('\r');
            if let Some(event) = self.process_line(line) {
                events.push(event);
            }
        }
        events
    }

    /// Flush a trailing event when the body ends without a blank line.
    pub fn finish(&mut self) -> Option<SseEvent> {
        if !self.pending.is_empty() {
            let rest = std::mem::take(&mut self.pending);
            let line = String::from_utf8_lossy(&rest).trim_end_matches('\r').to_string();
            if let Some(event) = self.process_line(&line) {
                return Some(event);
            }
        }
        self.dispatch()
    }

    fn process_line(&mut self, line: &str) -> Option<SseEvent> {
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
            "id" => self.id = Some(value.to_string()),
            _ => {}
        }
        None
    }

    fn dispatch(&mut self) -> Option<SseEvent> {
        if self.data.is_empty() {
            self.event = None;
            return None;
        }
        let event = SseEvent {
            event: self.event.take(),
            data: self.data.join("\n"),
            id: self.id.take(),
        };
        self.data.clear();
        Some(event)
    }
}

type ByteStream = Pin<Box<dyn Stream<Item = Result<bytes::Bytes, reqwest::Error>> + Send>>;

struct SseState {
    body: ByteStream,
    decoder: SseDecoder,
    ready: std::collections::VecDeque<SseEvent>,
    done: bool,
}

/// Parse a reqwest response body as an SSE stream.
pub fn parse_sse_stream(
    response: reqwest::Response,
) -> impl Stream<Item = anyhow::Result<SseEvent>> + Send {
    futures::stream::unfold(
        SseState {
            body: Box::pin(response.bytes_stream()),
            decoder: SseDecoder::new(),
            ready: Default::default(),
            done: false,
        },
        |mut state| async move {
            loop {
                if let Some(event) = state.ready.pop_front() {
                    return Some((Ok(event), state));
                }
                if state.done {
                    return None;
                }
                match state.body.next().await {
                    Some(Ok(chunk)) => {
                        let events = state.decoder.push(&chunk);
                        state.ready.extend(events);
                    }
                    Some(Err(e)) => {
                        state.done = true;
                        return Some((Err(anyhow::anyhow!("SSE stream error: {e}")), state));
                    }
                    None => {
                        state.done = true;
                        state.ready.extend(state.decoder.finish());
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
    fn test_single_event() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b"event: message\ndata: {\"a\":1}\nid: 7\n\n");
        assert_eq!(
            events,
            vec![SseEvent {
                event: Some("message".into()),
                data: "{\"a\":1}".into(),
                id: Some("7".into()),
            }]
        );
    }

    #[test]
    fn test_event_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: hel").is_empty());
        assert!(decoder.push(b"lo\r\n").is_empty());
        let events = decoder.push(b"\r\ndata: next\n\n");
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].data, "hello");
        assert_eq!(events[1].data, "next");
    }

    #[test]
    fn test_multibyte_char_split_across_chunks() {
        let mut decoder = SseDecoder::new();
        let payload = "data: caf\u{e9}\n\n".as_bytes();
        let split = payload.iter().position(|b| *b == 0xc3).unwrap() + 1;
        assert!(decoder.push(&payload[..split]).is_empty());
        let events = decoder.push(&payload[split..]);
        assert_eq!(events[0].data, "caf\u{e9}");
    }

    #[test]
    fn test_multiline_data_and_comments() {
        let mut decoder = SseDecoder::new();
        let events = decoder.push(b": keepalive\ndata: one\ndata: two\n\n");
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].data, "one\ntwo");
        assert!(events[0].event.is_none());
    }

    #[test]
    fn test_blank_lines_without_data_are_ignored() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"\n\nevent: ping\n\n").is_empty());
    }

    #[test]
    fn test_finish_flushes_unterminated_event() {
        let mut decoder = SseDecoder::new();
        assert!(decoder.push(b"data: tail").is_empty());
        let event = decoder.finish().unwrap();
        assert_eq!(event.data, "tail");
        assert!(decoder.finish().is_none());
    }
}
