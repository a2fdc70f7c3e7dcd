use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Free-text generation boundary shared by extraction, query planning and
/// answer synthesis. Each call is a single blocking request/response.
#[async_trait]
pub trait TextGenerator: Send + Sync {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;

    /// Ask for a JSON-only completion. Backends without a JSON mode fall
    /// back to plain generation.
    async fn generate_json(&self, prompt: &str) -> Result<String, LlmError> {
        self.generate(prompt).await
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("model service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to decode model response: {0}")]
    Decode(String),
    #[error("model returned an empty response")]
    Empty,
}

impl LlmError {
    /// Transport failures, rate limiting and server errors are worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

/// Wire protocol spoken by the model service.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmApi {
    /// `POST {base_url}/api/generate`
    #[default]
    Ollama,
    /// `POST {base_url}/chat/completions` (OpenAI, Groq and compatible hosts)
    OpenAi,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    #[serde(default)]
    pub api: LlmApi,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default)]
    pub temperature: f32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    120
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api: LlmApi::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "llama3".to_string(),
            api_key: None,
            temperature: 0.0,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Clone)]
pub struct LlmClient {
    config: LlmConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct OllamaRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<&'a str>, // "json" for structured output
    options: OllamaOptions,
}

#[derive(Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    response: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    temperature: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    response_format: Option<ResponseFormat>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl LlmClient {
    pub fn new(config: LlmConfig, retry: RetryPolicy) -> Result<Self, LlmError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| LlmError::Client(e.to_string()))?;

        Ok(Self { config, client, retry })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn complete(&self, prompt: &str, json: bool) -> Result<String, LlmError> {
        let text = self
            .retry
            .retry("llm.generate", || self.send_once(prompt, json), LlmError::is_transient)
            .await?;

        if text.trim().is_empty() {
            return Err(LlmError::Empty);
        }
        Ok(text)
    }

    async fn send_once(&self, prompt: &str, json: bool) -> Result<String, LlmError> {
        match self.config.api {
            LlmApi::Ollama => self.send_ollama(prompt, json).await,
            LlmApi::OpenAi => self.send_chat(prompt, json).await,
        }
    }

    async fn send_ollama(&self, prompt: &str, json: bool) -> Result<String, LlmError> {
        let url = format!("{}/api/generate", self.config.base_url.trim_end_matches('/'));

        let request = OllamaRequest {
            model: &self.config.model,
            prompt,
            stream: false,
            format: json.then_some("json"),
            options: OllamaOptions {
                temperature: self.config.temperature,
            },
        };

        let response = self.post(&url, &request).await?;
        let ollama_response: OllamaResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        Ok(ollama_response.response)
    }

    async fn send_chat(&self, prompt: &str, json: bool) -> Result<String, LlmError> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));

        let request = ChatRequest {
            model: &self.config.model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
            temperature: self.config.temperature,
            response_format: json.then_some(ResponseFormat { kind: "json_object" }),
        };

        let response = self.post(&url, &request).await?;
        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Decode(e.to_string()))?;

        chat.choices
            .into_iter()
            .next()
            .and_then(|choice| choice.message.content)
            .ok_or(LlmError::Empty)
    }

    async fn post<T: Serialize + ?Sized>(&self, url: &str, body: &T) -> Result<reqwest::Response, LlmError> {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|source| LlmError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status {
                status: status.as_u16(),
                body,
            });
        }

        Ok(response)
    }
}

#[async_trait]
impl TextGenerator for LlmClient {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.complete(prompt, false).await
    }

    async fn generate_json(&self, prompt: &str) -> Result<String, LlmError> {
        self.complete(prompt, true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        let rate_limited = LlmError::Status { status: 429, body: String::new() };
        let server = LlmError::Status { status: 503, body: String::new() };
        let bad_request = LlmError::Status { status: 400, body: String::new() };

        assert!(rate_limited.is_transient());
        assert!(server.is_transient());
        assert!(!bad_request.is_transient());
        assert!(!LlmError::Empty.is_transient());
    }

    #[test]
    fn api_flavour_parses_from_config_strings() {
        let config: LlmConfig = serde_json::from_str(
            r#"{"api": "openai", "base_url": "https://api.groq.com/openai/v1", "model": "llama-3.3-70b-versatile"}"#,
        )
        .unwrap();
        assert_eq!(config.api, LlmApi::OpenAi);
        assert_eq!(config.temperature, 0.0);
        assert_eq!(config.timeout_secs, 120);
    }

    #[test]
    fn chat_request_asks_for_json_object() {
        let request = ChatRequest {
            model: "m",
            messages: vec![ChatMessage { role: "user", content: "hi" }],
            temperature: 0.0,
            response_format: Some(ResponseFormat { kind: "json_object" }),
        };
        let body = serde_json::to_value(&request).unwrap();
        assert_eq!(body["response_format"]["type"], "json_object");
        assert_eq!(body["messages"][0]["role"], "user");
    }
}
