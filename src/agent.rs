//! Agent session abstraction.
//!
//! An [`AgentBackend`] starts one [`AgentSession`] per question, rooted at a
//! collection directory. The session is owned by whoever started it; there
//! is no shared "current session". [`OpenCodeBackend`](crate::opencode::OpenCodeBackend)
//! drives a real agent server, while [`ScriptedBackend`] replays a fixed
//! event sequence.

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::AgentError;
use crate::events::AgentEvent;

/// Raw events of one session, in arrival order.
pub type EventStream = BoxStream<'static, Result<AgentEvent, AgentError>>;

#[async_trait]
pub trait AgentBackend: Send + Sync {
    /// Launches an agent working in `collection_path` with the given system
    /// instructions and opens a session on it.
    async fn start(
        &self,
        collection_path: &Path,
        instructions: &str,
    ) -> Result<Box<dyn AgentSession>, AgentError>;
}

#[async_trait]
pub trait AgentSession: Send {
    fn id(&self) -> &str;

    /// Subscribes to the session's events. Call before [`prompt`](Self::prompt)
    /// so nothing is missed; a second call fails.
    async fn events(&mut self) -> Result<EventStream, AgentError>;

    async fn prompt(&mut self, text: &str) -> Result<(), AgentError>;

    /// Asks the agent to stop working on the current prompt.
    async fn abort(&mut self) -> Result<(), AgentError>;

    /// Releases the session and the process behind it.
    async fn close(&mut self) -> Result<(), AgentError>;
}

/// What a [`ScriptedBackend`] was asked to do.
#[derive(Debug, Default, Clone)]
pub struct ScriptLog {
    pub started_in: Vec<PathBuf>,
    pub instructions: Vec<String>,
    pub prompts: Vec<String>,
    pub aborts: usize,
    pub closes: usize,
}

/// Backend that replays the same events for every session.
#[derive(Clone, Default)]
pub struct ScriptedBackend {
    events: Vec<Result<AgentEvent, String>>,
    delay: Option<Duration>,
    hold_open: bool,
    log: Arc<Mutex<ScriptLog>>,
}

impl ScriptedBackend {
    pub fn new(events: Vec<AgentEvent>) -> Self {
        Self {
            events: events.into_iter().map(Ok).collect(),
            ..Self::default()
        }
    }

    /// Ends the script with a transport failure instead of running dry.
    pub fn then_fail(mut self, message: impl Into<String>) -> Self {
        self.events.push(Err(message.into()));
        self
    }

    /// Waits `delay` before each event.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Keeps the stream open after the last event, like an agent that is
    /// still working.
    pub fn hold_open(mut self) -> Self {
        self.hold_open = true;
        self
    }

    pub fn log(&self) -> ScriptLog {
        self.log
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn record(&self, f: impl FnOnce(&mut ScriptLog)) {
        f(&mut self.log.lock().unwrap_or_else(|poisoned| poisoned.into_inner()));
    }
}

#[async_trait]
impl AgentBackend for ScriptedBackend {
    async fn start(
        &self,
        collection_path: &Path,
        instructions: &str,
    ) -> Result<Box<dyn AgentSession>, AgentError> {
        self.record(|log| {
            log.started_in.push(collection_path.to_path_buf());
            log.instructions.push(instructions.to_string());
        });
        Ok(Box::new(ScriptedSession {
            id: format!("scripted-{}", uuid::Uuid::new_v4()),
            backend: self.clone(),
            subscribed: false,
        }))
    }
}

struct ScriptedSession {
    id: String,
    backend: ScriptedBackend,
    subscribed: bool,
}

#[async_trait]
impl AgentSession for ScriptedSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn events(&mut self) -> Result<EventStream, AgentError> {
        if self.subscribed {
            return Err(AgentError::StreamClosed);
        }
        self.subscribed = true;

        let delay = self.backend.delay;
        let script = futures_util::stream::iter(self.backend.events.clone()).then(move |event| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            event.map_err(AgentError::Http)
        });
        if self.backend.hold_open {
            Ok(script.chain(futures_util::stream::pending()).boxed())
        } else {
            Ok(script.boxed())
        }
    }

    async fn prompt(&mut self, text: &str) -> Result<(), AgentError> {
        self.backend.record(|log| log.prompts.push(text.to_string()));
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), AgentError> {
        self.backend.record(|log| log.aborts += 1);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        self.backend.record(|log| log.closes += 1);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_session_replays_and_records() {
        let backend = ScriptedBackend::new(vec![AgentEvent::Idle]);
        let mut session = backend
            .start(Path::new("/tmp/collection"), "be brief")
            .await
            .unwrap();

        let events: Vec<_> = session.events().await.unwrap().collect().await;
        assert!(matches!(events.as_slice(), [Ok(AgentEvent::Idle)]));
        assert!(session.events().await.is_err());

        session.prompt("hello").await.unwrap();
        session.close().await.unwrap();

        let log = backend.log();
        assert_eq!(log.started_in, vec![PathBuf::from("/tmp/collection")]);
        assert_eq!(log.instructions, vec!["be brief".to_string()]);
        assert_eq!(log.prompts, vec!["hello".to_string()]);
        assert_eq!(log.closes, 1);
        assert_eq!(log.aborts, 0);
    }

    #[tokio::test]
    async fn scripted_failure_surfaces_as_error() {
        let backend = ScriptedBackend::new(vec![]).then_fail("connection reset");
        let mut session = backend.start(Path::new("/tmp"), "").await.unwrap();
        let events: Vec<_> = session.events().await.unwrap().collect().await;
        assert!(matches!(events.as_slice(), [Err(AgentError::Http(_))]));
    }
}
