//! The ask pipeline.
//!
//! One call answers one question: resolve the resources (including those the
//! thread already uses), materialize their collection, run an agent session
//! in it, reduce the agent's events into chunks for the caller, and record
//! the question in its thread with the final status.
//!
//! Cancellation is a status. A canceled question is stored with the answer
//! accumulated up to the moment of cancellation.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::agent::AgentBackend;
use crate::collection::{resource_names, CollectionAssembler};
use crate::config::AgentConfig;
use crate::error::{AgentError, AskError, ValidationError};
use crate::models::{Chunk, ChunkUpdate, Collection, Question, QuestionStatus};
use crate::sse::WireEvent;
use crate::stream::{Outcome, StreamReducer};
use crate::threads::{NewQuestion, QuestionPatch, ThreadStore};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AskRequest {
    pub question: String,
    #[serde(default)]
    pub resources: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thread_id: Option<String>,
    /// Only stream text chunks.
    #[serde(default)]
    pub quiet: bool,
}

/// A recorded question and where it was answered.
#[derive(Debug, Clone)]
pub struct Answer {
    pub thread_id: String,
    pub collection: Collection,
    pub question: Question,
}

pub struct Asker {
    agent: AgentConfig,
    assembler: Arc<CollectionAssembler>,
    backend: Arc<dyn AgentBackend>,
    store: ThreadStore,
}

/// System instructions for a session over `collection`.
pub fn build_instructions(extra: Option<&str>, collection: &Collection) -> String {
    let mut out = format!(
        "You answer questions about the repositories in your working directory. \
         Each top-level directory is one resource: {}. \
         Search and read the files before answering, cite the paths you relied on, \
         and never modify anything.",
        collection.resources.join(", ")
    );
    if let Some(extra) = extra.map(str::trim).filter(|e| !e.is_empty()) {
        out.push_str("\n\n");
        out.push_str(extra);
    }
    if !collection.notes.is_empty() {
        out.push_str("\n\nResource notes:\n");
        out.push_str(&collection.notes);
    }
    out
}

impl Asker {
    pub fn new(
        agent: AgentConfig,
        assembler: Arc<CollectionAssembler>,
        backend: Arc<dyn AgentBackend>,
        store: ThreadStore,
    ) -> Self {
        Self {
            agent,
            assembler,
            backend,
            store,
        }
    }

    pub fn store(&self) -> &ThreadStore {
        &self.store
    }

    /// Answers `request`, passing every wire event to `sink` in order.
    ///
    /// The question is stored as streaming before `meta` is sent and updated
    /// once when the session ends. The event sequence is `meta`, the chunk
    /// frames, then `done` (also for a canceled question) or `error`.
    /// Failures before `meta` are only returned, not sent.
    pub async fn ask<F>(
        &self,
        request: AskRequest,
        cancel: CancellationToken,
        mut sink: F,
    ) -> Result<Answer, AskError>
    where
        F: FnMut(WireEvent) + Send,
    {
        let prompt = request.question.trim().to_string();
        if prompt.is_empty() {
            return Err(ValidationError::new("question", "must not be empty").into());
        }

        let (thread, accumulated) = match &request.thread_id {
            Some(id) => {
                let thread = self
                    .store
                    .get_thread(id)
                    .await
                    .map_err(AskError::Store)?
                    .ok_or_else(|| AskError::ThreadNotFound(id.clone()))?;
                let accumulated = thread.resources();
                (Some(thread), accumulated)
            }
            None => (None, Vec::new()),
        };

        let requested = resource_names(&request.resources);
        let all = requested.iter().chain(accumulated.iter());
        let collection = self.assembler.ensure(all).await?;

        let thread_id = match thread {
            Some(thread) => thread.id,
            None => self.store.create_thread().await.map_err(AskError::Store)?.id,
        };
        let introduced: Vec<String> = requested
            .into_iter()
            .filter(|name| !accumulated.contains(name))
            .collect();

        let pending = self
            .store
            .append_question(
                &thread_id,
                NewQuestion {
                    resources: introduced,
                    provider: self.agent.provider.clone(),
                    model: self.agent.model.clone(),
                    prompt: prompt.clone(),
                    answer: String::new(),
                    status: QuestionStatus::Streaming,
                    metadata: json!({ "collection_key": collection.key }),
                },
            )
            .await
            .map_err(AskError::Store)?;

        tracing::info!(
            thread = %thread_id,
            question = %pending.id,
            key = %collection.key,
            provider = %self.agent.provider,
            model = %self.agent.model,
            "asking"
        );
        sink(WireEvent::Meta {
            collection_key: collection.key.clone(),
            resources: collection.resources.clone(),
            provider: self.agent.provider.clone(),
            model: self.agent.model.clone(),
            thread_id: thread_id.clone(),
        });

        let instructions = build_instructions(self.agent.instructions.as_deref(), &collection);
        let mut reducer = StreamReducer::new();
        let quiet = request.quiet;
        let mut text_ids: Vec<String> = Vec::new();
        let mut forward = |update: ChunkUpdate| {
            if let ChunkUpdate::Add(Chunk::Text { id, .. }) = &update {
                text_ids.push(id.clone());
            }
            if quiet && !update.is_text(&text_ids) {
                return;
            }
            sink(WireEvent::from(update));
        };

        let result = self
            .run_session(&collection, &instructions, &prompt, &cancel, &mut reducer, &mut forward)
            .await;

        let (status, answer, error) = match result {
            Ok(outcome) => (outcome.status, outcome.answer, None),
            Err(err) => {
                tracing::error!(thread = %thread_id, error = %err, "agent failed");
                (QuestionStatus::Failed, reducer.answer(), Some(err))
            }
        };

        let mut metadata = pending.metadata.clone();
        if let Some(err) = &error {
            metadata["error"] = json!(err.to_string());
        }
        let recorded = self
            .store
            .update_question(
                &pending.id,
                QuestionPatch {
                    answer: Some(answer),
                    status: Some(status),
                    metadata: Some(metadata),
                },
            )
            .await;
        let question = match recorded {
            Ok(question) => question,
            Err(err) => {
                tracing::error!(thread = %thread_id, question = %pending.id, error = %format!("{:#}", err), "failed to record answer");
                let err = AskError::Store(err);
                sink(WireEvent::Error {
                    message: err.to_string(),
                });
                return Err(err);
            }
        };

        match error {
            Some(err) => {
                sink(WireEvent::Error {
                    message: err.to_string(),
                });
                Err(err.into())
            }
            None => {
                tracing::info!(thread = %thread_id, question = %question.id, status = status.as_str(), "question recorded");
                sink(WireEvent::Done {
                    answer: question.answer.clone(),
                    status,
                    question_id: Some(question.id.clone()),
                });
                Ok(Answer {
                    thread_id,
                    collection,
                    question,
                })
            }
        }
    }

    /// Runs one agent session to completion or cancellation and always
    /// closes it.
    async fn run_session(
        &self,
        collection: &Collection,
        instructions: &str,
        prompt: &str,
        cancel: &CancellationToken,
        reducer: &mut StreamReducer,
        sink: &mut (dyn FnMut(ChunkUpdate) + Send),
    ) -> Result<Outcome, AgentError> {
        let mut session = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Ok(Outcome {
                    status: QuestionStatus::Canceled,
                    answer: String::new(),
                    updates: Vec::new(),
                });
            }
            started = self.backend.start(&collection.path, instructions) => started?,
        };

        let result = async {
            let events = session.events().await?;
            session.prompt(prompt).await?;
            reducer.drive(events, cancel, sink).await
        }
        .await;

        if matches!(&result, Ok(outcome) if outcome.status == QuestionStatus::Canceled) {
            if let Err(err) = session.abort().await {
                tracing::warn!(session = %session.id(), error = %err, "abort failed");
            }
        }
        if let Err(err) = session.close().await {
            tracing::warn!(session = %session.id(), error = %err, "close failed");
        }
        result
    }
}
