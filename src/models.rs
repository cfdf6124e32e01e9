//! Core data models used throughout repo-ask.
//!
//! These types describe the resources that get cached, the collections
//! assembled from them, the chunks streamed back from the agent, and the
//! persisted conversation threads.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A named, immutable description of a knowledge source.
///
/// Loaded from `[[resources]]` tables in the configuration, tagged by
/// `type = "git"` or `type = "local"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResourceDefinition {
    Git {
        name: String,
        url: String,
        branch: String,
        #[serde(default)]
        search_paths: Vec<String>,
        #[serde(default)]
        notes: String,
    },
    Local {
        name: String,
        path: PathBuf,
        #[serde(default)]
        notes: String,
    },
}

impl ResourceDefinition {
    pub fn name(&self) -> &str {
        match self {
            ResourceDefinition::Git { name, .. } | ResourceDefinition::Local { name, .. } => name,
        }
    }

    pub fn notes(&self) -> &str {
        match self {
            ResourceDefinition::Git { notes, .. } | ResourceDefinition::Local { notes, .. } => {
                notes
            }
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ResourceDefinition::Git { .. } => "git",
            ResourceDefinition::Local { .. } => "local",
        }
    }

    /// Human-readable origin: the remote URL (with branch) or the local path.
    pub fn origin(&self) -> String {
        match self {
            ResourceDefinition::Git { url, branch, .. } => format!("{}#{}", url, branch),
            ResourceDefinition::Local { path, .. } => path.display().to_string(),
        }
    }
}

/// The materialized-on-disk form of a resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CachedResource {
    pub name: String,
    pub path: PathBuf,
}

/// A symlink union of cached resources, used as the agent's working directory.
#[derive(Debug, Clone, Serialize)]
pub struct Collection {
    /// Sorted, deduplicated resource names joined with `+`.
    pub key: String,
    pub path: PathBuf,
    /// Resource names in key order.
    pub resources: Vec<String>,
    /// Agent-facing notes, one `name: notes` line per resource that has any.
    pub notes: String,
}

/// Lifecycle of a tool call reported by the agent. Ordered: a call only
/// ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolState {
    Pending,
    Running,
    Completed,
}

impl ToolState {
    /// Maps an agent-reported status string; terminal failures count as completed.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(ToolState::Pending),
            "running" => Some(ToolState::Running),
            "completed" | "error" | "failed" => Some(ToolState::Completed),
            _ => None,
        }
    }
}

/// One normalized unit of agent output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Chunk {
    Text {
        id: String,
        text: String,
    },
    Reasoning {
        id: String,
        text: String,
    },
    Tool {
        id: String,
        #[serde(rename = "toolName")]
        tool_name: String,
        state: ToolState,
    },
    File {
        id: String,
        path: String,
    },
}

impl Chunk {
    pub fn id(&self) -> &str {
        match self {
            Chunk::Text { id, .. }
            | Chunk::Reasoning { id, .. }
            | Chunk::Tool { id, .. }
            | Chunk::File { id, .. } => id,
        }
    }
}

/// A change emitted by the stream reducer: a new chunk, or an in-place
/// update to a chunk emitted earlier with the same id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkUpdate {
    Add(Chunk),
    Update {
        id: String,
        /// Characters to apply to the chunk's text.
        delta: Option<String>,
        /// When set, `delta` replaces the chunk's text instead of extending it.
        reset: bool,
        state: Option<ToolState>,
    },
}

impl ChunkUpdate {
    pub fn id(&self) -> &str {
        match self {
            ChunkUpdate::Add(chunk) => chunk.id(),
            ChunkUpdate::Update { id, .. } => id,
        }
    }

    /// Whether the update concerns a text part (the only kind shown in quiet mode).
    pub fn is_text(&self, text_ids: &[String]) -> bool {
        match self {
            ChunkUpdate::Add(Chunk::Text { .. }) => true,
            ChunkUpdate::Add(_) => false,
            ChunkUpdate::Update { id, .. } => text_ids.iter().any(|t| t == id),
        }
    }
}

/// Status of a persisted question. `Streaming` is the only non-terminal
/// state; a question leaves it exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QuestionStatus {
    Streaming,
    Completed,
    Canceled,
    Failed,
}

impl QuestionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            QuestionStatus::Streaming => "streaming",
            QuestionStatus::Completed => "completed",
            QuestionStatus::Canceled => "canceled",
            QuestionStatus::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "streaming" => Some(QuestionStatus::Streaming),
            "completed" => Some(QuestionStatus::Completed),
            "canceled" => Some(QuestionStatus::Canceled),
            "failed" => Some(QuestionStatus::Failed),
            _ => None,
        }
    }
}

/// One persisted conversation turn.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Question {
    pub id: String,
    pub thread_id: String,
    pub order: i64,
    /// Resources this question newly introduced to its thread.
    pub resources: Vec<String>,
    pub provider: String,
    pub model: String,
    pub prompt: String,
    pub answer: String,
    pub status: QuestionStatus,
    pub metadata: serde_json::Value,
    pub created_at: i64,
}

/// A conversation thread with its questions in order.
#[derive(Debug, Clone, Serialize)]
pub struct Thread {
    pub id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub questions: Vec<Question>,
}

impl Thread {
    /// Sorted union of every question's newly-introduced resources.
    pub fn resources(&self) -> Vec<String> {
        let mut all: Vec<String> = self
            .questions
            .iter()
            .flat_map(|q| q.resources.iter().cloned())
            .collect();
        all.sort();
        all.dedup();
        all
    }
}

/// Listing row for `threads list` and `GET /threads`.
#[derive(Debug, Clone, Serialize)]
pub struct ThreadSummary {
    pub id: String,
    pub created_at: i64,
    pub updated_at: i64,
    pub question_count: i64,
    pub resources: Vec<String>,
    /// The first question's prompt, if any.
    pub title: Option<String>,
}
