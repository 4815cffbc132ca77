#[cfg(test)]
#[path = "openai_test.rs"]
mod tests;

use crate::backend::{ArcBackend, ArcReplySink, Backend};
use crate::config::constants::MAX_BLANK_DELTAS;
use crate::config::user_agent;
use crate::models::{BackendConnection, Turn};
use async_trait::async_trait;
use eyre::{Context, Result};
use futures::TryStreamExt;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::{fmt::Display, time};
use thiserror::Error;
use tokio::io::AsyncBufReadExt;
use tokio_util::io::StreamReader;

/// Reply used when a stream degenerates into whitespace.
pub const BLANK_OUTPUT_NOTICE: &str =
    "[The model kept producing blank output. The reply was cut off.]";

/// Client for an OpenAI-compatible chat completion server, such as a local
/// llama.cpp server.
pub struct OpenAI {
    alias: String,
    endpoint: String,
    api_key: Option<String>,
    model: String,
    timeout: Option<time::Duration>,
    max_output_tokens: Option<usize>,
    temperature: Option<f32>,
}

#[async_trait]
impl Backend for OpenAI {
    fn name(&self) -> &str {
        &self.alias
    }

    async fn complete(&self, turns: Vec<Turn>) -> Result<String> {
        let res = self
            .send_completion(&turns, false)
            .await
            .wrap_err("sending completion request")?;

        let res = res
            .json::<CompletionResponse>()
            .await
            .wrap_err("parsing completion response")?;

        let text = res
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();
        Ok(text.trim().to_string())
    }

    async fn stream(&self, turns: Vec<Turn>, sink: ArcReplySink) -> Result<String> {
        let res = self
            .send_completion(&turns, true)
            .await
            .wrap_err("sending streaming completion request")?;

        let stream = res
            .bytes_stream()
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::Interrupted, e.to_string()));

        let mut line_readers = StreamReader::new(stream).lines();

        let mut text = String::new();
        let mut blank_deltas = 0;

        while let Some(line) = line_readers
            .next_line()
            .await
            .wrap_err("reading completion stream")?
        {
            let line = line.trim();
            log::trace!("streaming response: {}", line);
            let Some(data) = line.strip_prefix("data: ") else {
                continue;
            };
            if data == "[DONE]" {
                break;
            }

            let data = serde_json::from_str::<CompletionResponse>(data)
                .wrap_err(format!("parsing completion response line: {}", data))?;

            let delta = match data.choices.first().and_then(|c| c.delta.as_ref()) {
                Some(delta) => delta,
                None => continue,
            };
            let Some(content) = delta.content.as_deref() else {
                continue;
            };

            if content.trim().is_empty() {
                blank_deltas += 1;
                if blank_deltas > MAX_BLANK_DELTAS {
                    log::warn!("{} blank deltas in a row, cutting the reply", blank_deltas);
                    sink.partial(BLANK_OUTPUT_NOTICE).await;
                    return Ok(BLANK_OUTPUT_NOTICE.to_string());
                }
                // kept for line breaks, shown with the next visible delta
                text.push_str(content);
                continue;
            }
            blank_deltas = 0;

            text.push_str(content);
            sink.partial(&text).await;
        }

        Ok(text.trim().to_string())
    }
}

impl From<OpenAI> for ArcBackend {
    fn from(value: OpenAI) -> Self {
        Arc::new(value)
    }
}

impl From<&BackendConnection> for OpenAI {
    fn from(value: &BackendConnection) -> Self {
        let mut openai = OpenAI::default()
            .with_endpoint(value.endpoint())
            .with_model(value.model());

        if let Some(api_key) = value.api_key() {
            openai.api_key = Some(api_key.to_string());
        }

        if let Some(timeout) = value.timeout() {
            openai.timeout = Some(timeout);
        }

        openai.max_output_tokens = value.max_output_tokens();
        openai.temperature = value.temperature();
        openai
    }
}

impl OpenAI {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_endpoint(mut self, endpoint: &str) -> Self {
        self.endpoint = endpoint.trim_end_matches('/').to_string();
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.model = model.to_string();
        self
    }

    pub fn with_api_key(mut self, api_key: &str) -> Self {
        self.api_key = Some(api_key.to_string());
        self
    }

    pub fn with_timeout(mut self, timeout: time::Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_deref()
    }

    pub fn timeout(&self) -> Option<time::Duration> {
        self.timeout
    }

    async fn send_completion(&self, turns: &[Turn], stream: bool) -> Result<reqwest::Response> {
        let completion_req = CompletionRequest {
            model: self.model.clone(),
            messages: turns.iter().map(MessageRequest::from).collect(),
            stream,
            max_tokens: self.max_output_tokens,
            temperature: self.temperature,
        };

        let mut req = reqwest::Client::new()
            .post(format!("{}/v1/chat/completions", self.endpoint))
            .header("Content-Type", "application/json")
            .header("User-Agent", user_agent());

        if let Some(timeout) = self.timeout {
            req = req.timeout(timeout);
        }

        if let Some(token) = &self.api_key {
            req = req.bearer_auth(token);
        }

        log::trace!("Sending completion request: {:?}", completion_req);

        let res = req
            .json(&completion_req)
            .send()
            .await
            .wrap_err(format!("connecting to {}", self.endpoint))?;

        if !res.status().is_success() {
            let http_code = res.status().as_u16();
            let resp = res.text().await.wrap_err("reading error response")?;
            log::error!("Error response: {}", resp);
            let mut err = match serde_json::from_str::<ErrorResponse>(&resp) {
                Ok(err) => err.error,
                Err(_) => OpenAIError {
                    message: resp,
                    ..Default::default()
                },
            };
            err.http_code = http_code;
            return Err(err.into());
        }
        Ok(res)
    }
}

impl Default for OpenAI {
    fn default() -> Self {
        let connection = BackendConnection::default();
        Self {
            alias: "OpenAI".to_string(),
            endpoint: connection.endpoint().to_string(),
            api_key: None,
            model: connection.model().to_string(),
            timeout: None,
            max_output_tokens: None,
            temperature: None,
        }
    }
}

#[derive(Default, Debug, Clone, Serialize, Deserialize)]
struct MessageRequest {
    role: String,
    content: String,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionRequest {
    model: String,
    messages: Vec<MessageRequest>,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    temperature: Option<f32>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionMessageResponse {
    content: Option<String>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionChoiceResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<CompletionMessageResponse>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    delta: Option<CompletionMessageResponse>,
    finish_reason: Option<String>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct CompletionResponse {
    #[serde(default)]
    id: String,
    choices: Vec<CompletionChoiceResponse>,
}

#[derive(Default, Debug, Serialize, Deserialize)]
struct ErrorResponse {
    error: OpenAIError,
}

#[derive(Default, Error, Debug, Serialize, Deserialize)]
pub struct OpenAIError {
    #[serde(skip)]
    pub http_code: u16,
    pub message: String,
    #[serde(rename = "type", default)]
    pub err_type: String,
    pub param: Option<String>,
    pub code: Option<serde_json::Value>,
}

impl Display for OpenAIError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "OpenAI error ({}): {}", self.http_code, self.message)
    }
}

impl From<&Turn> for MessageRequest {
    fn from(turn: &Turn) -> Self {
        Self {
            role: turn.role().to_string(),
            content: turn.content().to_string(),
        }
    }
}
