use serde_json::Value;
use tracing::trace;

use crate::error::classify_detail;
use crate::events::{Role, StreamErrorKind, StreamEvent};

/// Prefix carried by every payload line of the response stream.
pub const DATA_PREFIX: &str = "data:";
/// Payload marking the end of one response.
pub const DONE_SENTINEL: &str = "[DONE]";

const INTERNAL_SERVER_ERROR_LINE: &str = "internal server error";

/// Incremental decoder for one streamed response.
///
/// Bytes may arrive split at arbitrary points; only complete lines are
/// decoded. After `Done` or an `Error` the decoder is finished and ignores
/// all further input. Decoding a new response requires a new decoder.
#[derive(Debug, Default)]
pub struct StreamDecoder {
    pending: Vec<u8>,
    finished: bool,
}

impl StreamDecoder {
    /// Feed arbitrary bytes and drain the events of every completed line.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.pending.extend_from_slice(bytes);
        while let Some(split) = self.pending.iter().position(|byte| *byte == b'\n') {
            let line = self.pending.drain(..=split).collect::<Vec<u8>>();
            if let Some(event) = self.decode_line(&String::from_utf8_lossy(&line)) {
                events.push(event);
            }
            if self.finished {
                self.pending.clear();
                break;
            }
        }

        events
    }

    /// Decode a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<StreamEvent> {
        if self.pending.is_empty() {
            return Vec::new();
        }
        let line = std::mem::take(&mut self.pending);
        self.decode_line(&String::from_utf8_lossy(&line))
            .into_iter()
            .collect()
    }

    /// Decode exactly one line of the stream.
    pub fn decode_line(&mut self, line: &str) -> Option<StreamEvent> {
        if self.finished {
            return None;
        }

        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        if line.eq_ignore_ascii_case(INTERNAL_SERVER_ERROR_LINE) {
            return self.terminate(StreamEvent::Error {
                kind: StreamErrorKind::Server,
                detail: "Internal Server Error".to_owned(),
            });
        }

        let payload = strip_data_prefix(line);
        if payload == DONE_SENTINEL {
            return self.terminate(StreamEvent::Done);
        }

        let record = match serde_json::from_str::<Value>(payload) {
            Ok(record) => record,
            Err(error) => {
                trace!(%error, "skipping non-JSON stream line");
                return None;
            }
        };

        let event = map_record(&record)?;
        if event.is_terminal() {
            return self.terminate(event);
        }
        Some(event)
    }

    /// Lazily decode a finite source of lines, stopping after the first
    /// terminal event.
    pub fn decode<I>(lines: I) -> Decode<I::IntoIter>
    where
        I: IntoIterator,
        I::Item: AsRef<str>,
    {
        Decode {
            lines: lines.into_iter(),
            decoder: Self::default(),
        }
    }

    /// Decode a complete response body in one shot.
    pub fn decode_str(input: &str) -> Vec<StreamEvent> {
        Self::decode(input.lines()).collect()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn is_empty_buffer(&self) -> bool {
        self.pending.iter().all(u8::is_ascii_whitespace)
    }

    fn terminate(&mut self, event: StreamEvent) -> Option<StreamEvent> {
        self.finished = true;
        Some(event)
    }
}

/// Iterator returned by [`StreamDecoder::decode`].
#[derive(Debug)]
pub struct Decode<I> {
    lines: I,
    decoder: StreamDecoder,
}

impl<I> Iterator for Decode<I>
where
    I: Iterator,
    I::Item: AsRef<str>,
{
    type Item = StreamEvent;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.decoder.is_finished() {
            let line = self.lines.next()?;
            if let Some(event) = self.decoder.decode_line(line.as_ref()) {
                return Some(event);
            }
        }
        None
    }
}

fn strip_data_prefix(line: &str) -> &str {
    match line.strip_prefix(DATA_PREFIX) {
        Some(rest) => rest.trim_start(),
        None => line,
    }
}

fn map_record(record: &Value) -> Option<StreamEvent> {
    if let Some(detail) = record.get("detail").filter(|detail| !detail.is_null()) {
        let (kind, detail) = classify_detail(detail);
        return Some(StreamEvent::Error { kind, detail });
    }

    let Some(message) = record.get("message").filter(|message| message.is_object()) else {
        if let Some(error) = record
            .get("error")
            .filter(|error| error.is_string() || error.is_object())
        {
            let (kind, detail) = classify_detail(error);
            return Some(StreamEvent::Error { kind, detail });
        }
        return None;
    };

    let role = message
        .get("author")
        .and_then(|author| author.get("role"))
        .and_then(Value::as_str)
        .and_then(Role::parse);
    if role != Some(Role::Assistant) {
        return None;
    }

    // Records without content are progress markers, not replies.
    let content = message.get("content")?;

    let message_id = message.get("id").and_then(Value::as_str);
    let conversation_id = record.get("conversation_id").and_then(Value::as_str);
    let (Some(message_id), Some(conversation_id)) = (message_id, conversation_id) else {
        return Some(StreamEvent::Error {
            kind: StreamErrorKind::Malformed,
            detail: "assistant record is missing message.id or conversation_id".to_owned(),
        });
    };

    let text = content
        .get("parts")
        .and_then(Value::as_array)
        .and_then(|parts| parts.first())
        .and_then(Value::as_str)
        .unwrap_or("");

    let finish_details = message
        .get("metadata")
        .and_then(|metadata| metadata.get("finish_details"))
        .and_then(|details| details.get("type"))
        .and_then(Value::as_str)
        .map(ToOwned::to_owned);

    Some(StreamEvent::Delta {
        text: text.to_owned(),
        conversation_id: conversation_id.to_owned(),
        message_id: message_id.to_owned(),
        finish_details,
        end_turn: message.get("end_turn").and_then(Value::as_bool),
    })
}
