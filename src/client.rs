//! Client for a running `rask serve`.

use anyhow::{bail, Result};
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use std::time::Duration;

use crate::ask::AskRequest;
use crate::sse::{SseDecoder, WireEvent};

pub struct RemoteClient {
    base_url: String,
    http: reqwest::Client,
}

impl RemoteClient {
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = url::Url::parse(base_url)?.as_str().trim_end_matches('/').to_string();
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self { base_url, http })
    }

    pub async fn health(&self) -> Result<bool> {
        let response = self
            .http
            .get(format!("{}/health", self.base_url))
            .timeout(Duration::from_secs(5))
            .send()
            .await?;
        Ok(response.status().is_success())
    }

    /// Posts a question and returns its events as they arrive.
    ///
    /// A JSON error response (the question was rejected before streaming
    /// began) is returned as an error carrying the server's code and message.
    pub async fn ask_stream(&self, request: &AskRequest) -> Result<BoxStream<'static, Result<WireEvent>>> {
        let response = self
            .http
            .post(format!("{}/question/stream", self.base_url))
            .header("Accept", "text/event-stream")
            .json(request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body: serde_json::Value = response.json().await.unwrap_or_default();
            let code = body["error"]["code"].as_str().unwrap_or("unknown");
            let message = body["error"]["message"].as_str().unwrap_or("no message");
            bail!("server returned {} ({}): {}", status, code, message);
        }

        let mut bytes = response.bytes_stream();
        let stream = async_stream::stream! {
            let mut decoder = SseDecoder::<WireEvent>::new();
            while let Some(chunk) = bytes.next().await {
                match chunk {
                    Ok(chunk) => {
                        for event in decoder.feed(&chunk) {
                            yield Ok(event);
                        }
                    }
                    Err(err) => {
                        yield Err(anyhow::Error::from(err));
                        return;
                    }
                }
            }
            for event in decoder.finish() {
                yield Ok(event);
            }
        };
        Ok(stream.boxed())
    }
}
