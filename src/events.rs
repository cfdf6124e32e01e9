//! Raw agent events.
//!
//! The agent server publishes loosely-typed JSON events on its `/event`
//! stream. [`AgentEvent::from_wire`] folds them into a closed set of
//! variants scoped to one session, which the stream reducer then matches
//! exhaustively.

use serde_json::Value;

use crate::models::ToolState;

/// Author of an agent-side message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AgentEvent {
    /// A message was created or updated. Used to tell the echoed prompt
    /// apart from the assistant's output.
    Message {
        message_id: String,
        role: MessageRole,
    },
    TextPart {
        part_id: String,
        message_id: Option<String>,
        /// Full current text, when the agent reports it.
        text: Option<String>,
        /// Characters appended since the previous report.
        delta: Option<String>,
    },
    ReasoningPart {
        part_id: String,
        message_id: Option<String>,
        text: Option<String>,
        delta: Option<String>,
    },
    ToolPart {
        call_id: String,
        tool: String,
        state: ToolState,
    },
    FilePart {
        part_id: Option<String>,
        message_id: Option<String>,
        path: String,
    },
    /// The session finished answering.
    Idle,
    Error {
        name: String,
        message: String,
    },
    /// Anything else, including events for other sessions.
    Other,
}

impl AgentEvent {
    /// Interprets one decoded event payload for `session_id`.
    pub fn from_wire(value: &Value, session_id: &str) -> AgentEvent {
        let kind = value.get("type").and_then(Value::as_str).unwrap_or_default();
        let props = value.get("properties").unwrap_or(&Value::Null);

        match kind {
            "message.updated" => {
                let info = props.get("info").unwrap_or(&Value::Null);
                if !belongs_to(str_field(info, "sessionID"), session_id) {
                    return AgentEvent::Other;
                }
                let role = match str_field(info, "role") {
                    Some("user") => MessageRole::User,
                    Some("assistant") => MessageRole::Assistant,
                    _ => return AgentEvent::Other,
                };
                match str_field(info, "id") {
                    Some(id) => AgentEvent::Message {
                        message_id: id.to_string(),
                        role,
                    },
                    None => AgentEvent::Other,
                }
            }
            "message.part.updated" => {
                let part = props.get("part").unwrap_or(&Value::Null);
                if !belongs_to(str_field(part, "sessionID"), session_id) {
                    return AgentEvent::Other;
                }
                part_event(part, str_field(props, "delta"))
            }
            "session.idle" => {
                if belongs_to(str_field(props, "sessionID"), session_id) {
                    AgentEvent::Idle
                } else {
                    AgentEvent::Other
                }
            }
            "session.status" => {
                let idle = props
                    .get("status")
                    .and_then(|s| s.get("type"))
                    .and_then(Value::as_str)
                    == Some("idle");
                if idle && belongs_to(str_field(props, "sessionID"), session_id) {
                    AgentEvent::Idle
                } else {
                    AgentEvent::Other
                }
            }
            "session.error" => {
                // errors without a session id are process-wide and apply to us too
                match str_field(props, "sessionID") {
                    Some(id) if id != session_id => return AgentEvent::Other,
                    _ => {}
                }
                let error = props.get("error").unwrap_or(&Value::Null);
                let name = str_field(error, "name").unwrap_or("UnknownError").to_string();
                let message = error
                    .get("data")
                    .and_then(|d| str_field(d, "message"))
                    .or_else(|| str_field(error, "message"))
                    .unwrap_or(name.as_str())
                    .to_string();
                AgentEvent::Error { name, message }
            }
            _ => AgentEvent::Other,
        }
    }
}

fn part_event(part: &Value, delta: Option<&str>) -> AgentEvent {
    let message_id = str_field(part, "messageID").map(str::to_string);
    let text = str_field(part, "text").map(str::to_string);
    let delta = delta.map(str::to_string);

    match str_field(part, "type") {
        Some("text") => match str_field(part, "id") {
            Some(id) => AgentEvent::TextPart {
                part_id: id.to_string(),
                message_id,
                text,
                delta,
            },
            None => AgentEvent::Other,
        },
        Some("reasoning") => match str_field(part, "id") {
            Some(id) => AgentEvent::ReasoningPart {
                part_id: id.to_string(),
                message_id,
                text,
                delta,
            },
            None => AgentEvent::Other,
        },
        Some("tool") => {
            let call_id = str_field(part, "callID").or_else(|| str_field(part, "id"));
            let state = part
                .get("state")
                .and_then(|s| str_field(s, "status"))
                .and_then(ToolState::parse);
            match (call_id, state) {
                (Some(call_id), Some(state)) => AgentEvent::ToolPart {
                    call_id: call_id.to_string(),
                    tool: str_field(part, "tool").unwrap_or("tool").to_string(),
                    state,
                },
                _ => AgentEvent::Other,
            }
        }
        Some("file") => {
            let path = part
                .get("source")
                .and_then(|s| str_field(s, "path"))
                .or_else(|| str_field(part, "filename"))
                .or_else(|| str_field(part, "url"));
            match path {
                Some(path) => AgentEvent::FilePart {
                    part_id: str_field(part, "id").map(str::to_string),
                    message_id,
                    path: path.to_string(),
                },
                None => AgentEvent::Other,
            }
        }
        _ => AgentEvent::Other,
    }
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

fn belongs_to(reported: Option<&str>, session_id: &str) -> bool {
    reported == Some(session_id)
}
