use async_trait::async_trait;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, warn};

use super::{FragmentSink, TokenSource, TurnRequest};
use crate::errors::AppError;
use crate::models::{timestamp, Message, ModelInfo, ModelParameters};

/// Streams replies from a local Ollama server via `POST /api/chat`.
///
/// The response body is newline-delimited JSON; every line carries the next
/// piece of the reply and the last one has `done: true`. A body that ends
/// without that line is a failure, not a short reply.
#[derive(Clone)]
pub struct OllamaTokenSource {
    client: reqwest::Client,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct ChatBody<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f64,
    top_p: f64,
    top_k: u32,
    repeat_penalty: f64,
    num_predict: u32,
}

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChunkMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChunkMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Debug, Deserialize)]
struct TagModel {
    name: String,
    #[serde(default)]
    size: u64,
    #[serde(default)]
    modified_at: Option<String>,
}

enum LineOutcome {
    Continue,
    Done,
    Stopped,
}

impl OllamaTokenSource {
    pub fn new(base_url: &str) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| AppError::InvalidConfig {
                key: "OLLAMA_API_BASE_URL".to_string(),
                message: format!("failed to build HTTP client: {e}"),
            })?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn transport_error(&self, model: &str, e: reqwest::Error) -> AppError {
        if e.is_connect() || e.is_timeout() {
            AppError::OllamaUnavailable { host: self.base_url.clone() }
        } else if e.status() == Some(reqwest::StatusCode::NOT_FOUND) {
            AppError::ModelNotFound { model_name: model.to_string() }
        } else {
            AppError::inference(e.to_string())
        }
    }

    async fn handle_line(&self, line: &[u8], sink: &FragmentSink) -> Result<LineOutcome, AppError> {
        let line = trim_ascii(line);
        if line.is_empty() {
            return Ok(LineOutcome::Continue);
        }
        let chunk: ChatChunk = serde_json::from_slice(line)
            .map_err(|e| AppError::inference(format!("malformed stream line: {e}")))?;
        if let Some(message) = chunk.error {
            return Err(AppError::inference(message));
        }
        if let Some(message) = chunk.message {
            if !sink.send(message.content).await {
                return Ok(LineOutcome::Stopped);
            }
        }
        Ok(if chunk.done { LineOutcome::Done } else { LineOutcome::Continue })
    }
}

fn to_chat_messages<'a>(system_prompt: &'a str, history: &'a [Message]) -> Vec<ChatMessage<'a>> {
    let system = (!system_prompt.trim().is_empty())
        .then_some(ChatMessage { role: "system", content: system_prompt });
    system
        .into_iter()
        .chain(history.iter().map(|m| ChatMessage {
            role: m.role.as_str(),
            content: &m.content,
        }))
        .collect()
}

fn trim_ascii(bytes: &[u8]) -> &[u8] {
    let start = bytes.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(bytes.len());
    let end = bytes.iter().rposition(|b| !b.is_ascii_whitespace()).map_or(start, |i| i + 1);
    &bytes[start..end]
}

fn format_size(bytes: u64) -> String {
    format!("{:.1}GB", bytes as f64 / 1_000_000_000.0)
}

#[async_trait]
impl TokenSource for OllamaTokenSource {
    async fn produce(&self, request: TurnRequest, sink: FragmentSink) -> Result<(), AppError> {
        let settings = &request.settings;
        let body = ChatBody {
            model: &settings.model,
            messages: to_chat_messages(&settings.system_prompt, &request.history),
            stream: true,
            options: ChatOptions {
                temperature: settings.temperature,
                top_p: settings.top_p,
                top_k: settings.top_k,
                repeat_penalty: settings.repeat_penalty,
                num_predict: settings.max_tokens,
            },
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| {
                error!("Ollama chat request failed for model {}: {e}", settings.model);
                self.transport_error(&settings.model, e)
            })?;

        let mut bytes = Box::pin(response.bytes_stream());
        let mut pending: Vec<u8> = Vec::new();

        loop {
            let next = tokio::select! {
                _ = sink.cancelled() => {
                    debug!("Ollama stream cancelled by consumer");
                    return Ok(());
                }
                next = bytes.next() => next,
            };
            let Some(chunk) = next else { break };
            let chunk = chunk.map_err(|e| self.transport_error(&settings.model, e))?;
            pending.extend_from_slice(&chunk);

            while let Some(newline) = pending.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = pending.drain(..=newline).collect();
                match self.handle_line(&line, &sink).await? {
                    LineOutcome::Continue => {}
                    LineOutcome::Done | LineOutcome::Stopped => return Ok(()),
                }
            }
        }

        match self.handle_line(&pending, &sink).await? {
            LineOutcome::Done | LineOutcome::Stopped => Ok(()),
            LineOutcome::Continue => {
                warn!("Ollama stream ended before completion");
                Err(AppError::inference("stream ended before the reply was complete"))
            }
        }
    }

    async fn list_models(&self) -> Result<Vec<ModelInfo>, AppError> {
        let tags: TagsResponse = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| self.transport_error("", e))?
            .json()
            .await
            .map_err(|e| AppError::inference(format!("malformed model list: {e}")))?;

        Ok(tags
            .models
            .into_iter()
            .map(|m| ModelInfo {
                display_name: m.name.clone(),
                size: format_size(m.size),
                modified: m.modified_at.as_deref().and_then(|t| timestamp::parse(t).ok()),
                parameters: ModelParameters::default(),
                name: m.name,
            })
            .collect())
    }

    async fn check_connection(&self) -> bool {
        match self.client.get(format!("{}/api/tags", self.base_url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(e) => {
                warn!("Ollama unreachable at {}: {e}", self.base_url);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;

    #[test]
    fn system_prompt_leads_the_history_when_set() {
        let history = vec![Message::user("hi"), Message::assistant("m")];
        let with_prompt = to_chat_messages("be terse", &history);
        assert_eq!(with_prompt.len(), 3);
        assert_eq!(with_prompt[0].role, "system");
        assert_eq!(with_prompt[1].role, "user");
        assert_eq!(with_prompt[2].role, "assistant");

        assert_eq!(to_chat_messages("  ", &history).len(), 2);
    }

    #[test]
    fn parses_stream_lines() {
        let chunk: ChatChunk =
            serde_json::from_str(r#"{"model":"m","message":{"role":"assistant","content":"Hel"},"done":false}"#)
                .unwrap();
        assert_eq!(chunk.message.unwrap().content, "Hel");
        assert!(!chunk.done);

        let last: ChatChunk = serde_json::from_str(r#"{"model":"m","done":true,"eval_count":3}"#).unwrap();
        assert!(last.done);
        assert!(last.message.is_none());
    }

    #[test]
    fn trims_line_whitespace() {
        assert_eq!(trim_ascii(b"  {}\r\n"), b"{}");
        assert_eq!(trim_ascii(b"\n"), b"");
    }

    #[test]
    fn formats_sizes_in_gigabytes() {
        assert_eq!(format_size(4_700_000_000), "4.7GB");
    }

    #[test]
    fn trailing_slash_is_dropped_from_base_url() {
        let source = OllamaTokenSource::new("http://localhost:11434/").unwrap();
        assert_eq!(source.base_url, "http://localhost:11434");
    }
}
