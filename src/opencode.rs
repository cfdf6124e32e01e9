//! Agent backend that launches an `opencode serve` process per session.
//!
//! The process listens on a freshly picked local port with the collection as
//! its working directory. Startup is bounded twice: by `port_attempts`
//! launches and by `startup_timeout_secs` per launch. The session then
//! speaks the server's HTTP API:
//!
//! | Call | Request |
//! |------|---------|
//! | health | `GET /global/health` |
//! | create | `POST /session` |
//! | events | `GET /event` (server-sent events) |
//! | prompt | `POST /session/{id}/prompt_async` |
//! | abort  | `POST /session/{id}/abort` |

use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use std::net::TcpListener;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::time::Instant;

use crate::agent::{AgentBackend, AgentSession, EventStream};
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::events::AgentEvent;
use crate::sse::SseDecoder;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const HEALTH_POLL_INTERVAL: Duration = Duration::from_millis(150);

pub struct OpenCodeBackend {
    config: AgentConfig,
    http: reqwest::Client,
}

enum Launch {
    Ready(Child),
    Retry(String),
}

impl OpenCodeBackend {
    pub fn new(config: AgentConfig) -> Result<Self, AgentError> {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self { config, http })
    }

    fn pick_port(&self) -> Result<u16, AgentError> {
        let listener = TcpListener::bind((self.config.hostname.as_str(), 0))
            .map_err(|e| AgentError::Startup(format!("no free port on {}: {}", self.config.hostname, e)))?;
        let port = listener
            .local_addr()
            .map_err(|e| AgentError::Startup(e.to_string()))?
            .port();
        Ok(port)
    }

    async fn launch(&self, collection_path: &Path, port: u16) -> Result<Launch, AgentError> {
        let port_arg = port.to_string();
        let mut child = Command::new(&self.config.command)
            .args(["serve", "--hostname", self.config.hostname.as_str(), "--port", port_arg.as_str()])
            .current_dir(collection_path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| AgentError::Spawn {
                command: self.config.command.clone(),
                source,
            })?;

        let base_url = format!("http://{}:{}", self.config.hostname, port);
        let deadline = Instant::now() + Duration::from_secs(self.config.startup_timeout_secs);

        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Ok(Launch::Retry(format!("agent exited during startup ({})", status)));
                }
                Ok(None) => {}
                Err(e) => return Err(AgentError::Startup(e.to_string())),
            }

            let healthy = self
                .http
                .get(format!("{}/global/health", base_url))
                .timeout(Duration::from_secs(1))
                .send()
                .await
                .map(|r| r.status().is_success())
                .unwrap_or(false);
            if healthy {
                return Ok(Launch::Ready(child));
            }

            if Instant::now() >= deadline {
                let _ = child.start_kill();
                return Ok(Launch::Retry(format!(
                    "agent not healthy after {}s",
                    self.config.startup_timeout_secs
                )));
            }
            tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl AgentBackend for OpenCodeBackend {
    async fn start(
        &self,
        collection_path: &Path,
        instructions: &str,
    ) -> Result<Box<dyn AgentSession>, AgentError> {
        for attempt in 1..=self.config.port_attempts {
            let port = self.pick_port()?;
            tracing::info!(
                command = %self.config.command,
                port,
                attempt,
                dir = %collection_path.display(),
                "starting agent"
            );

            let child = match self.launch(collection_path, port).await? {
                Launch::Ready(child) => child,
                Launch::Retry(reason) => {
                    tracing::warn!(port, attempt, reason = %reason, "agent startup failed");
                    continue;
                }
            };

            let base_url = format!("http://{}:{}", self.config.hostname, port);
            let session = OpenCodeSession::create(
                self.http.clone(),
                base_url,
                Some(child),
                &self.config.provider,
                &self.config.model,
                instructions,
            )
            .await?;
            return Ok(Box::new(session));
        }

        Err(AgentError::PortExhausted {
            attempts: self.config.port_attempts,
        })
    }
}

/// One conversation on a running agent server.
pub struct OpenCodeSession {
    http: reqwest::Client,
    base_url: String,
    id: String,
    provider: String,
    model: String,
    system: String,
    child: Option<Child>,
    subscribed: bool,
}

impl OpenCodeSession {
    /// Creates a session on the server at `base_url`. `child`, when given,
    /// is killed when the session closes.
    pub async fn create(
        http: reqwest::Client,
        base_url: String,
        child: Option<Child>,
        provider: &str,
        model: &str,
        system: &str,
    ) -> Result<Self, AgentError> {
        let response = http
            .post(format!("{}/session", base_url))
            .timeout(REQUEST_TIMEOUT)
            .json(&json!({}))
            .send()
            .await?;
        let body: Value = checked(response, "create session").await?.json().await?;
        let id = body
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| AgentError::Http("create session: response has no id".to_string()))?
            .to_string();
        tracing::debug!(session = %id, "agent session created");

        Ok(Self {
            http,
            base_url,
            id,
            provider: provider.to_string(),
            model: model.to_string(),
            system: system.to_string(),
            child,
            subscribed: false,
        })
    }
}

async fn checked(response: reqwest::Response, what: &str) -> Result<reqwest::Response, AgentError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(AgentError::Http(format!("{}: {} {}", what, status, body.trim())))
}

#[async_trait]
impl AgentSession for OpenCodeSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn events(&mut self) -> Result<EventStream, AgentError> {
        if self.subscribed {
            return Err(AgentError::StreamClosed);
        }
        let response = self
            .http
            .get(format!("{}/event", self.base_url))
            .header("Accept", "text/event-stream")
            .send()
            .await?;
        let response = checked(response, "subscribe").await?;
        self.subscribed = true;

        let session_id = self.id.clone();
        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::<Value>::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for raw in decoder.feed(&chunk) {
                            tracing::debug!(event = %raw, "agent event");
                            match AgentEvent::from_wire(&raw, &session_id) {
                                AgentEvent::Other => {}
                                event => {
                                    yield Ok(event);
                                }
                            }
                        }
                    }
                    Err(err) => {
                        yield Err(AgentError::from(err));
                        return;
                    }
                }
            }
            for raw in decoder.finish() {
                match AgentEvent::from_wire(&raw, &session_id) {
                    AgentEvent::Other => {}
                    event => {
                        yield Ok(event);
                    }
                }
            }
        };
        Ok(stream.boxed())
    }

    async fn prompt(&mut self, text: &str) -> Result<(), AgentError> {
        let mut body = json!({
            "parts": [{"type": "text", "text": text}],
            "model": {"providerID": self.provider, "modelID": self.model},
        });
        if !self.system.is_empty() {
            body["system"] = Value::String(self.system.clone());
        }
        let response = self
            .http
            .post(format!("{}/session/{}/prompt_async", self.base_url, self.id))
            .timeout(REQUEST_TIMEOUT)
            .json(&body)
            .send()
            .await?;
        checked(response, "prompt").await?;
        Ok(())
    }

    async fn abort(&mut self) -> Result<(), AgentError> {
        let response = self
            .http
            .post(format!("{}/session/{}/abort", self.base_url, self.id))
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        checked(response, "abort").await?;
        Ok(())
    }

    async fn close(&mut self) -> Result<(), AgentError> {
        if let Some(mut child) = self.child.take() {
            // SIGKILL without waiting; tokio reaps the process in the background
            if let Err(e) = child.start_kill() {
                tracing::debug!(session = %self.id, error = %e, "agent already gone");
            }
        }
        Ok(())
    }
}
