//! Server-sent event codec.
//!
//! Every frame is a single `data: <json>\n\n` line carrying a
//! [`WireEvent`]. The decoder is incremental: feed it bytes as they arrive
//! and it returns the events completed so far, however the input was split.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::marker::PhantomData;

use crate::models::{Chunk, ChunkUpdate, QuestionStatus, ToolState};
use crate::stream::PART_SEPARATOR;

/// One event of the answer stream, as sent to clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WireEvent {
    Meta {
        collection_key: String,
        resources: Vec<String>,
        provider: String,
        model: String,
        thread_id: String,
    },
    Add {
        chunk: Chunk,
    },
    Update {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delta: Option<String>,
        #[serde(default, skip_serializing_if = "is_false")]
        reset: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        state: Option<ToolState>,
    },
    Done {
        answer: String,
        status: QuestionStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        question_id: Option<String>,
    },
    Error {
        message: String,
    },
}

fn is_false(value: &bool) -> bool {
    !*value
}

impl From<ChunkUpdate> for WireEvent {
    fn from(update: ChunkUpdate) -> Self {
        match update {
            ChunkUpdate::Add(chunk) => WireEvent::Add { chunk },
            ChunkUpdate::Update {
                id,
                delta,
                reset,
                state,
            } => WireEvent::Update {
                id,
                delta,
                reset,
                state,
            },
        }
    }
}

/// Serializes one event as a complete SSE frame.
pub fn encode_frame(event: &WireEvent) -> Result<String, serde_json::Error> {
    Ok(format!("data: {}\n\n", serde_json::to_string(event)?))
}

/// Incremental SSE parser yielding the JSON payload of each `data` event.
///
/// Only `data` fields are used; `event`, `id`, `retry` and comment lines are
/// skipped. A frame whose payload does not parse as `T` is logged and
/// dropped without affecting later frames.
pub struct SseDecoder<T> {
    buf: Vec<u8>,
    data: Vec<String>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Default for SseDecoder<T> {
    fn default() -> Self {
        Self {
            buf: Vec::new(),
            data: Vec::new(),
            _marker: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> SseDecoder<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `bytes` and returns every event they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<T> {
        self.buf.extend_from_slice(bytes);
        let mut out = Vec::new();
        // bytes stay buffered until a full line arrives, so a multi-byte
        // character split across reads is decoded whole
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.line(trim_line_end(&line), &mut out);
        }
        out
    }

    /// Flushes a trailing event that was not followed by a blank line.
    pub fn finish(&mut self) -> Vec<T> {
        let mut out = Vec::new();
        if !self.buf.is_empty() {
            let rest = std::mem::take(&mut self.buf);
            self.line(trim_line_end(&rest), &mut out);
        }
        self.dispatch(&mut out);
        out
    }

    fn line(&mut self, line: &[u8], out: &mut Vec<T>) {
        if line.is_empty() {
            self.dispatch(out);
            return;
        }
        if line[0] == b':' {
            return;
        }
        let line = String::from_utf8_lossy(line);
        let (field, value) = match line.split_once(':') {
            Some((field, value)) => (field, value.strip_prefix(' ').unwrap_or(value)),
            None => (line.as_ref(), ""),
        };
        if field == "data" {
            self.data.push(value.to_string());
        }
    }

    fn dispatch(&mut self, out: &mut Vec<T>) {
        if self.data.is_empty() {
            return;
        }
        let payload = self.data.join("\n");
        self.data.clear();
        match serde_json::from_str::<T>(&payload) {
            Ok(event) => out.push(event),
            Err(err) => {
                tracing::warn!(error = %err, frame = %payload, "skipping malformed SSE frame")
            }
        }
    }
}

fn trim_line_end(line: &[u8]) -> &[u8] {
    let line = line.strip_suffix(b"\n").unwrap_or(line);
    line.strip_suffix(b"\r").unwrap_or(line)
}

/// Rebuilds chunk contents from a sequence of wire events.
///
/// Text is tracked cumulatively per chunk id, so a `reset` update replaces
/// the chunk's text and nothing is ever rendered twice.
#[derive(Debug, Default)]
pub struct Transcript {
    order: Vec<String>,
    chunks: HashMap<String, Chunk>,
    meta: Option<WireEvent>,
    done: Option<(String, QuestionStatus, Option<String>)>,
    error: Option<String>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn apply(&mut self, event: &WireEvent) {
        match event {
            WireEvent::Meta { .. } => self.meta = Some(event.clone()),
            WireEvent::Add { chunk } => {
                let id = chunk.id().to_string();
                if !self.chunks.contains_key(&id) {
                    self.order.push(id.clone());
                }
                self.chunks.insert(id, chunk.clone());
            }
            WireEvent::Update {
                id,
                delta,
                reset,
                state,
            } => {
                let Some(chunk) = self.chunks.get_mut(id) else {
                    tracing::debug!(id = %id, "update for unknown chunk");
                    return;
                };
                match chunk {
                    Chunk::Text { text, .. } | Chunk::Reasoning { text, .. } => {
                        if let Some(delta) = delta {
                            if *reset {
                                text.clear();
                            }
                            text.push_str(delta);
                        }
                    }
                    Chunk::Tool { state: current, .. } => {
                        if let Some(state) = state {
                            if *state > *current {
                                *current = *state;
                            }
                        }
                    }
                    Chunk::File { .. } => {}
                }
            }
            WireEvent::Done {
                answer,
                status,
                question_id,
            } => self.done = Some((answer.clone(), *status, question_id.clone())),
            WireEvent::Error { message } => self.error = Some(message.clone()),
        }
    }

    /// Chunks in the order they were first added, with their current contents.
    pub fn chunks(&self) -> impl Iterator<Item = &Chunk> {
        self.order.iter().filter_map(|id| self.chunks.get(id))
    }

    pub fn get(&self, id: &str) -> Option<&Chunk> {
        self.chunks.get(id)
    }

    /// Text chunks joined the same way the server builds its answer.
    pub fn answer(&self) -> String {
        self.chunks()
            .filter_map(|chunk| match chunk {
                Chunk::Text { text, .. } if !text.is_empty() => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join(PART_SEPARATOR)
    }

    pub fn meta(&self) -> Option<&WireEvent> {
        self.meta.as_ref()
    }

    pub fn status(&self) -> Option<QuestionStatus> {
        self.done.as_ref().map(|(_, status, _)| *status)
    }

    /// The answer reported by the `done` event, if one arrived.
    pub fn final_answer(&self) -> Option<&str> {
        self.done.as_ref().map(|(answer, _, _)| answer.as_str())
    }

    pub fn question_id(&self) -> Option<&str> {
        self.done.as_ref().and_then(|(_, _, id)| id.as_deref())
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }
}
