//! Stream reducer.
//!
//! Turns the raw [`AgentEvent`]s of one question into an ordered sequence of
//! [`ChunkUpdate`]s. Text and reasoning parts are tracked by id with their
//! latest full text, so a resent or out-of-order report never re-emits
//! characters a consumer has already seen. Tool calls only move forward
//! through their states.
//!
//! Consumers must track cumulative text per chunk id: an update with
//! `reset` set replaces the chunk's text rather than extending it. This
//! happens only when the agent resends a value that does not extend what it
//! reported before.

use futures_util::{Stream, StreamExt};
use std::collections::{HashMap, HashSet};
use tokio_util::sync::CancellationToken;

use crate::error::AgentError;
use crate::events::{AgentEvent, MessageRole};
use crate::models::{Chunk, ChunkUpdate, QuestionStatus, ToolState};

/// Separator placed between consecutive text parts in the final answer.
pub const PART_SEPARATOR: &str = "\n\n";

/// Updates produced by one event, and whether the question is finished.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Step {
    pub updates: Vec<ChunkUpdate>,
    pub finished: bool,
}

/// Result of driving one question to completion or cancellation.
#[derive(Debug, Clone)]
pub struct Outcome {
    pub status: QuestionStatus,
    pub answer: String,
    pub updates: Vec<ChunkUpdate>,
}

#[derive(Clone, Copy)]
enum PartKind {
    Text,
    Reasoning,
}

#[derive(Debug, Default)]
pub struct StreamReducer {
    text_order: Vec<String>,
    reasoning_order: Vec<String>,
    texts: HashMap<String, String>,
    tools: HashMap<String, ToolState>,
    user_messages: HashSet<String>,
    emitted: Vec<ChunkUpdate>,
    cursor: usize,
    files_seen: usize,
    finished: bool,
}

impl StreamReducer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Every update emitted so far, in order.
    pub fn emitted(&self) -> &[ChunkUpdate] {
        &self.emitted
    }

    /// Ids of the text parts, in the order they first appeared.
    pub fn text_ids(&self) -> &[String] {
        &self.text_order
    }

    /// The answer so far: every text part's latest text, in order.
    pub fn answer(&self) -> String {
        self.text_order
            .iter()
            .filter_map(|id| self.texts.get(id))
            .filter(|text| !text.is_empty())
            .map(String::as_str)
            .collect::<Vec<_>>()
            .join(PART_SEPARATOR)
    }

    /// Folds one raw event into the reducer state.
    ///
    /// Once an `Idle` event has been seen, further events are ignored. An
    /// agent-reported error is returned as [`AgentError::Provider`]; updates
    /// emitted before it stay available through [`emitted`](Self::emitted).
    pub fn apply(&mut self, event: AgentEvent) -> Result<Step, AgentError> {
        if self.finished {
            return Ok(Step {
                updates: Vec::new(),
                finished: true,
            });
        }

        let update = match event {
            AgentEvent::Message { message_id, role } => {
                if role == MessageRole::User {
                    self.user_messages.insert(message_id);
                }
                None
            }
            AgentEvent::TextPart {
                part_id,
                message_id,
                text,
                delta,
            } => {
                if self.is_user_part(message_id.as_deref()) {
                    None
                } else {
                    self.part(PartKind::Text, part_id, text, delta)
                }
            }
            AgentEvent::ReasoningPart {
                part_id,
                message_id,
                text,
                delta,
            } => {
                if self.is_user_part(message_id.as_deref()) {
                    None
                } else {
                    self.part(PartKind::Reasoning, part_id, text, delta)
                }
            }
            AgentEvent::ToolPart {
                call_id,
                tool,
                state,
            } => self.tool(call_id, tool, state),
            AgentEvent::FilePart {
                part_id,
                message_id,
                path,
            } => {
                if self.is_user_part(message_id.as_deref()) {
                    None
                } else {
                    self.files_seen += 1;
                    let id = part_id.unwrap_or_else(|| format!("file-{}", self.files_seen));
                    Some(ChunkUpdate::Add(Chunk::File { id, path }))
                }
            }
            AgentEvent::Idle => {
                self.finished = true;
                None
            }
            AgentEvent::Error { name, message } => {
                return Err(AgentError::Provider { name, message });
            }
            AgentEvent::Other => None,
        };

        if let Some(update) = update {
            self.emitted.push(update);
        }
        let updates = self.emitted[self.cursor..].to_vec();
        self.cursor = self.emitted.len();
        Ok(Step {
            updates,
            finished: self.finished,
        })
    }

    fn is_user_part(&self, message_id: Option<&str>) -> bool {
        message_id.is_some_and(|id| self.user_messages.contains(id))
    }

    fn part(
        &mut self,
        kind: PartKind,
        part_id: String,
        text: Option<String>,
        delta: Option<String>,
    ) -> Option<ChunkUpdate> {
        let Some(recorded) = self.texts.get(&part_id) else {
            let initial = text.or(delta).unwrap_or_default();
            self.texts.insert(part_id.clone(), initial.clone());
            let chunk = match kind {
                PartKind::Text => {
                    self.text_order.push(part_id.clone());
                    Chunk::Text {
                        id: part_id,
                        text: initial,
                    }
                }
                PartKind::Reasoning => {
                    self.reasoning_order.push(part_id.clone());
                    Chunk::Reasoning {
                        id: part_id,
                        text: initial,
                    }
                }
            };
            return Some(ChunkUpdate::Add(chunk));
        };

        let current = match (text, delta) {
            (Some(text), _) => text,
            (None, Some(delta)) => format!("{}{}", recorded, delta),
            (None, None) => return None,
        };

        let (delta, reset) = match current.strip_prefix(recorded.as_str()) {
            Some(suffix) => (suffix.to_string(), false),
            None => (current.clone(), true),
        };
        if delta.is_empty() {
            return None;
        }

        self.texts.insert(part_id.clone(), current);
        Some(ChunkUpdate::Update {
            id: part_id,
            delta: Some(delta),
            reset,
            state: None,
        })
    }

    fn tool(&mut self, call_id: String, tool: String, state: ToolState) -> Option<ChunkUpdate> {
        match self.tools.get(&call_id).copied() {
            None => {
                self.tools.insert(call_id.clone(), state);
                Some(ChunkUpdate::Add(Chunk::Tool {
                    id: call_id,
                    tool_name: tool,
                    state,
                }))
            }
            Some(previous) if state > previous => {
                self.tools.insert(call_id.clone(), state);
                Some(ChunkUpdate::Update {
                    id: call_id,
                    delta: None,
                    reset: false,
                    state: Some(state),
                })
            }
            Some(_) => None,
        }
    }

    fn outcome(&self, status: QuestionStatus) -> Outcome {
        Outcome {
            status,
            answer: self.answer(),
            updates: self.emitted.clone(),
        }
    }

    /// Consumes `events` until the agent goes idle or `cancel` fires,
    /// handing each update to `sink` in order.
    ///
    /// Cancellation wins over a ready event and yields a
    /// [`QuestionStatus::Canceled`] outcome holding what was emitted so far.
    /// The stream ending before `Idle` is [`AgentError::StreamClosed`].
    pub async fn drive<S, F>(
        &mut self,
        events: S,
        cancel: &CancellationToken,
        mut sink: F,
    ) -> Result<Outcome, AgentError>
    where
        S: Stream<Item = Result<AgentEvent, AgentError>>,
        F: FnMut(ChunkUpdate),
    {
        futures_util::pin_mut!(events);

        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    tracing::debug!(emitted = self.emitted.len(), "stream canceled");
                    return Ok(self.outcome(QuestionStatus::Canceled));
                }
                next = events.next() => next,
            };

            let event = match next {
                Some(event) => event?,
                None => return Err(AgentError::StreamClosed),
            };
            tracing::trace!(?event, "agent event");

            let step = self.apply(event)?;
            for update in step.updates {
                sink(update);
            }
            if step.finished {
                return Ok(self.outcome(QuestionStatus::Completed));
            }
        }
    }
}
