//! Upstream LLM provider access
//!
//! Two concerns live here: how each provider frames its streaming records
//! ([`UpstreamFormat::decode`]), and how requests are issued ([`UpstreamClient`]).
//! Streaming goes through `reqwest` so the relay can read raw SSE bytes; the
//! non-streaming completion path goes through `genai`.

use genai::adapter::AdapterKind;
use genai::resolver::{AuthData, Endpoint, ServiceTargetResolver};
use genai::{ModelIden, ServiceTarget};
use serde::Deserialize;
use serde_json::json;

use crate::backoff::{self, BackoffPolicy};
use crate::chat::{ChatMessage, ChatRole, to_genai_request};
use crate::config::UpstreamConfig;
use crate::error::RelayError;
use crate::sse::SseFrame;

/// Longest upstream error body echoed back as `detail`
const MAX_DETAIL_LEN: usize = 512;

/// Provider wire format
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display, strum::EnumString)]
#[strum(serialize_all = "lowercase", ascii_case_insensitive)]
pub enum UpstreamFormat {
    /// OpenAI-compatible chat completions
    #[strum(serialize = "openai")]
    OpenAi,
    /// Anthropic messages API
    Anthropic,
}

/// What one upstream record means for the relay
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decoded {
    Text(String),
    /// Keep-alive, empty delta, or a record we cannot read
    Skip,
    /// Provider sentinel marking the end of the stream
    Finished,
    /// Provider reported an error inside the stream
    Failed(String),
}

/// OpenAI streaming record: `{choices:[{delta:{content}}]}`
#[derive(Debug, Deserialize)]
pub struct UpstreamChatChunk {
    #[serde(default)]
    pub choices: Vec<UpstreamChoice>,
    #[serde(default)]
    pub error: Option<UpstreamErrorBody>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamChoice {
    #[serde(default)]
    pub delta: Option<UpstreamDelta>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamDelta {
    #[serde(default)]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct UpstreamErrorBody {
    #[serde(default)]
    pub message: String,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum AnthropicRecord {
    ContentBlockDelta {
        delta: AnthropicDelta,
    },
    MessageStop,
    Error {
        error: UpstreamErrorBody,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct AnthropicDelta {
    #[serde(default)]
    text: String,
}

impl UpstreamFormat {
    #[must_use]
    pub const fn default_base_url(self) -> &'static str {
        match self {
            UpstreamFormat::OpenAi => "https://api.openai.com/v1",
            UpstreamFormat::Anthropic => "https://api.anthropic.com/v1",
        }
    }

    #[must_use]
    pub fn stream_url(
        self,
        base_url: &str,
    ) -> String {
        let base = base_url.trim_end_matches('/');
        match self {
            UpstreamFormat::OpenAi => format!("{base}/chat/completions"),
            UpstreamFormat::Anthropic => format!("{base}/messages"),
        }
    }

    const fn adapter_kind(self) -> AdapterKind {
        match self {
            UpstreamFormat::OpenAi => AdapterKind::OpenAI,
            UpstreamFormat::Anthropic => AdapterKind::Anthropic,
        }
    }

    /// Map one upstream frame onto the relay's vocabulary.
    #[must_use]
    pub fn decode(
        self,
        frame: &SseFrame,
    ) -> Decoded {
        let data = frame.data.trim();
        if data.is_empty() {
            return Decoded::Skip;
        }

        match self {
            UpstreamFormat::OpenAi => {
                if data == "[DONE]" {
                    return Decoded::Finished;
                }
                let Ok(chunk) = serde_json::from_str::<UpstreamChatChunk>(data) else {
                    return Decoded::Skip;
                };
                if let Some(error) = chunk.error {
                    return Decoded::Failed(error.message);
                }
                let text: String = chunk
                    .choices
                    .into_iter()
                    .filter_map(|choice| choice.delta.and_then(|delta| delta.content))
                    .collect();
                if text.is_empty() { Decoded::Skip } else { Decoded::Text(text) }
            }
            UpstreamFormat::Anthropic => match serde_json::from_str::<AnthropicRecord>(data) {
                Ok(AnthropicRecord::ContentBlockDelta { delta }) if !delta.text.is_empty() => {
                    Decoded::Text(delta.text)
                }
                Ok(AnthropicRecord::MessageStop) => Decoded::Finished,
                Ok(AnthropicRecord::Error { error }) => Decoded::Failed(error.message),
                Ok(_) | Err(_) => Decoded::Skip,
            },
        }
    }

    /// Streaming request body in the provider's shape
    #[must_use]
    pub fn stream_body(
        self,
        config: &UpstreamConfig,
        messages: &[ChatMessage],
    ) -> serde_json::Value {
        match self {
            UpstreamFormat::OpenAi => json!({
                "model": config.model,
                "messages": messages,
                "stream": true,
                "max_tokens": config.max_tokens,
                "temperature": config.temperature,
            }),
            UpstreamFormat::Anthropic => {
                let system: Vec<&str> = messages
                    .iter()
                    .filter(|m| m.role == ChatRole::System)
                    .map(|m| m.content.as_str())
                    .collect();
                let turns: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != ChatRole::System).collect();
                json!({
                    "model": config.model,
                    "system": system.join("\n\n"),
                    "messages": turns,
                    "stream": true,
                    "max_tokens": config.max_tokens,
                    "temperature": config.temperature,
                })
            }
        }
    }
}

/// Issues requests to the configured provider
#[derive(Clone)]
pub struct UpstreamClient {
    http: reqwest::Client,
    genai: genai::Client,
    config: UpstreamConfig,
    backoff: BackoffPolicy,
}

impl UpstreamClient {
    #[must_use]
    pub fn new(
        config: UpstreamConfig,
        backoff: BackoffPolicy,
    ) -> Self {
        if config.api_key.is_none() {
            tracing::warn!("No upstream API key configured; requests will be sent unauthenticated");
        }

        Self {
            http: reqwest::Client::new(),
            genai: create_genai_client(&config),
            config,
            backoff,
        }
    }

    #[must_use]
    pub const fn format(&self) -> UpstreamFormat {
        self.config.format
    }

    #[must_use]
    pub const fn config(&self) -> &UpstreamConfig {
        &self.config
    }

    fn request(
        &self,
        url: &str,
    ) -> reqwest::RequestBuilder {
        let builder = self.http.post(url).header("Accept", "text/event-stream");
        match (self.config.format, self.config.api_key.as_deref()) {
            (UpstreamFormat::OpenAi, Some(key)) => builder.bearer_auth(key),
            (UpstreamFormat::Anthropic, key) => {
                let builder = builder.header("anthropic-version", "2023-06-01");
                match key {
                    Some(key) => builder.header("x-api-key", key),
                    None => builder,
                }
            }
            (UpstreamFormat::OpenAi, None) => builder,
        }
    }

    /// Open the streaming upstream request, retrying transient failures.
    ///
    /// # Errors
    ///
    /// `UpstreamConnect` when the provider could not be reached after all retries,
    /// `UpstreamStatus` when it answered with a non-success status.
    pub async fn open_stream(
        &self,
        messages: &[ChatMessage],
    ) -> Result<reqwest::Response, RelayError> {
        let url = self.config.format.stream_url(&self.config.base_url);
        let body = self.config.format.stream_body(&self.config, messages);

        let result = backoff::issue(&self.backoff, || self.request(&url).json(&body).send()).await;

        match result {
            Err(e) => {
                tracing::error!("Upstream connect failed: {}", e);
                Err(RelayError::upstream_connect(e.to_string()))
            }
            Ok(response) if response.status().is_success() => Ok(response),
            Ok(response) => {
                let status = response.status().as_u16();
                let mut detail = response.text().await.unwrap_or_default();
                truncate_utf8(&mut detail, MAX_DETAIL_LEN);
                tracing::error!("Upstream returned {}: {}", status, detail);
                Err(RelayError::UpstreamStatus { status, detail })
            }
        }
    }

    /// Non-streaming completion through `genai`
    ///
    /// # Errors
    ///
    /// Returns `UpstreamConnect` when the call fails and `UpstreamStatus` when the
    /// model produced no text.
    pub async fn complete(
        &self,
        messages: &[ChatMessage],
    ) -> Result<String, RelayError> {
        let options = genai::chat::ChatOptions::default()
            .with_max_tokens(self.config.max_tokens)
            .with_temperature(f64::from(self.config.temperature));

        let response = self
            .genai
            .exec_chat(&self.config.model, to_genai_request(messages), Some(&options))
            .await
            .map_err(|e| RelayError::upstream_connect(format!("Chat request failed: {e}")))?;

        response
            .content_text_into_string()
            .ok_or_else(|| RelayError::UpstreamStatus {
                status: 502,
                detail: "No response from AI model".to_string(),
            })
    }
}

/// `genai` client pinned to our endpoint, adapter and key
fn create_genai_client(config: &UpstreamConfig) -> genai::Client {
    let endpoint = format!("{}/", config.base_url.trim_end_matches('/'));
    let adapter_kind = config.format.adapter_kind();
    let key = config.api_key.clone().unwrap_or_default();

    let target_resolver = ServiceTargetResolver::from_resolver_fn(
        move |service_target: ServiceTarget| -> Result<ServiceTarget, genai::resolver::Error> {
            let ServiceTarget { model, .. } = service_target;
            Ok(ServiceTarget {
                endpoint: Endpoint::from_owned(endpoint.clone()),
                auth: AuthData::from_single(key.clone()),
                model: ModelIden::new(adapter_kind, model.model_name),
            })
        },
    );

    genai::Client::builder()
        .with_service_target_resolver(target_resolver)
        .build()
}

fn truncate_utf8(
    text: &mut String,
    max: usize,
) {
    if text.len() <= max {
        return;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    text.truncate(end);
}
