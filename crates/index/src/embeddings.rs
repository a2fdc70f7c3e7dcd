use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use extract::{LlmApi, RetryPolicy};

/// Text to fixed-dimension vector.
#[async_trait]
pub trait Embedder: Send + Sync {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError>;
}

#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("failed to build HTTP client: {0}")]
    Client(String),
    #[error("embedding request to {url} failed: {source}")]
    Transport {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("embedding service returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("failed to parse embedding response: {0}")]
    Decode(String),
    #[error("embedding service returned an empty vector")]
    Empty,
}

impl EmbeddingError {
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport { .. } => true,
            Self::Status { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    #[serde(default)]
    pub api: LlmApi,
    pub base_url: String,
    pub model: String,
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_timeout_secs() -> u64 {
    60
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            api: LlmApi::Ollama,
            base_url: "http://localhost:11434".to_string(),
            model: "nomic-embed-text".to_string(),
            api_key: None,
            timeout_secs: default_timeout_secs(),
        }
    }
}

#[derive(Clone)]
pub struct EmbeddingClient {
    config: EmbeddingConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
}

#[derive(Serialize)]
struct OllamaEmbeddingRequest<'a> {
    model: &'a str,
    prompt: &'a str,
}

#[derive(Deserialize)]
struct OllamaEmbeddingResponse {
    embedding: Vec<f32>,
}

#[derive(Serialize)]
struct OpenAiEmbeddingRequest<'a> {
    model: &'a str,
    input: &'a str,
}

#[derive(Deserialize)]
struct OpenAiEmbeddingResponse {
    data: Vec<OpenAiEmbedding>,
}

#[derive(Deserialize)]
struct OpenAiEmbedding {
    embedding: Vec<f32>,
}

impl EmbeddingClient {
    pub fn new(config: EmbeddingConfig, retry: RetryPolicy) -> Result<Self, EmbeddingError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EmbeddingError::Client(e.to_string()))?;

        Ok(Self { config, client, retry })
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    async fn embed_once(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let base = self.config.base_url.trim_end_matches('/');
        match self.config.api {
            LlmApi::Ollama => {
                let url = format!("{base}/api/embeddings");
                let request = OllamaEmbeddingRequest {
                    model: &self.config.model,
                    prompt: text,
                };
                let response: OllamaEmbeddingResponse = self.post(&url, &request).await?;
                Ok(response.embedding)
            }
            LlmApi::OpenAi => {
                let url = format!("{base}/embeddings");
                let request = OpenAiEmbeddingRequest {
                    model: &self.config.model,
                    input: text,
                };
                let response: OpenAiEmbeddingResponse = self.post(&url, &request).await?;
                response
                    .data
                    .into_iter()
                    .next()
                    .map(|d| d.embedding)
                    .ok_or(EmbeddingError::Empty)
            }
        }
    }

    async fn post<B, T>(&self, url: &str, body: &B) -> Result<T, EmbeddingError>
    where
        B: Serialize + ?Sized,
        T: for<'de> Deserialize<'de>,
    {
        let mut request = self.client.post(url).json(body);
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|source| EmbeddingError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(EmbeddingError::Status {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json()
            .await
            .map_err(|e| EmbeddingError::Decode(e.to_string()))
    }
}

#[async_trait]
impl Embedder for EmbeddingClient {
    /// Generate embedding for text
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let embedding = self
            .retry
            .retry("embedding", || self.embed_once(text), EmbeddingError::is_transient)
            .await?;

        if embedding.is_empty() {
            return Err(EmbeddingError::Empty);
        }
        Ok(embedding)
    }
}
