use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::sync::Arc;

use ingest::Chunk;

use crate::error::ExtractionError;
use crate::llm::TextGenerator;
use crate::prompt;
use crate::schema::GraphSchema;

/// Untrusted model output for one chunk. Types and properties are whatever
/// the model proposed; nothing here has passed the schema gate yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RawExtraction {
    #[serde(default, alias = "entities")]
    pub nodes: Vec<RawNode>,
    #[serde(default, alias = "relations")]
    pub relationships: Vec<RawRelationship>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNode {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
    /// Either an object or a list of `{key, value}` pairs
    #[serde(default)]
    pub properties: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawNodeRef {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    #[serde(rename = "type")]
    pub node_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRelationship {
    pub source: RawNodeRef,
    pub target: RawNodeRef,
    #[serde(rename = "type")]
    pub rel_type: String,
    #[serde(default)]
    pub properties: serde_json::Value,
}

fn string_or_number<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::String(s) => Ok(s),
        serde_json::Value::Number(n) => Ok(n.to_string()),
        other => Err(serde::de::Error::custom(format!("expected string id, got {other}"))),
    }
}

/// Turns a chunk into raw typed graph fragments. Implementations may be
/// model-driven and non-deterministic; whatever they return is forced
/// through the schema gate by the [`Extractor`](crate::Extractor).
#[async_trait]
pub trait ExtractionProvider: Send + Sync {
    async fn extract(&self, chunk: &Chunk, schema: &GraphSchema) -> Result<RawExtraction, ExtractionError>;
}

/// Extraction through a generative model in JSON mode, with one repair
/// round-trip when the first answer does not parse.
pub struct LlmExtractionProvider {
    llm: Arc<dyn TextGenerator>,
}

impl LlmExtractionProvider {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self { llm }
    }
}

#[async_trait]
impl ExtractionProvider for LlmExtractionProvider {
    async fn extract(&self, chunk: &Chunk, schema: &GraphSchema) -> Result<RawExtraction, ExtractionError> {
        let prompt = prompt::build_extraction_prompt(&chunk.text, schema);

        let response = self
            .llm
            .generate_json(&prompt)
            .await
            .map_err(|source| ExtractionError::Model {
                chunk_id: chunk.chunk_id.clone(),
                source,
            })?;

        let first_error = match parse_extraction(&response) {
            Ok(raw) => return Ok(raw),
            Err(e) => e,
        };

        tracing::debug!(chunk = %chunk.chunk_id, error = %first_error, "extraction JSON invalid, asking model to repair");

        let repaired = self
            .llm
            .generate_json(&prompt::build_retry_prompt(&response))
            .await
            .map_err(|source| ExtractionError::Model {
                chunk_id: chunk.chunk_id.clone(),
                source,
            })?;

        parse_extraction(&repaired).map_err(|e| ExtractionError::Unparseable {
            chunk_id: chunk.chunk_id.clone(),
            message: e.to_string(),
        })
    }
}

/// Parse model output, tolerating markdown fences and prose around the
/// JSON object.
pub fn parse_extraction(response: &str) -> Result<RawExtraction, serde_json::Error> {
    let trimmed = response.trim();
    let body = match (trimmed.find('{'), trimmed.rfind('}')) {
        (Some(start), Some(end)) if start < end => &trimmed[start..=end],
        _ => trimmed,
    };
    serde_json::from_str(body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::LlmError;
    use std::sync::Mutex;

    struct Scripted {
        replies: Mutex<Vec<Result<String, LlmError>>>,
    }

    impl Scripted {
        fn new(replies: Vec<Result<String, LlmError>>) -> Arc<Self> {
            Arc::new(Self {
                replies: Mutex::new(replies.into_iter().rev().collect()),
            })
        }
    }

    #[async_trait]
    impl TextGenerator for Scripted {
        async fn generate(&self, _prompt: &str) -> Result<String, LlmError> {
            self.replies.lock().unwrap().pop().unwrap_or(Err(LlmError::Empty))
        }
    }

    fn chunk() -> Chunk {
        Chunk::new("doc".into(), 0, "Patient John has Diabetes.".into(), "note.txt".into(), (0, 26))
    }

    const GOOD: &str = r#"{"nodes": [{"id": "John", "type": "Patient"}], "relationships": []}"#;

    #[test]
    fn parses_fenced_output_and_aliases() {
        let raw = parse_extraction(
            "```json\n{\"entities\": [{\"id\": 42, \"type\": \"Patient\"}], \"relations\": []}\n```",
        )
        .unwrap();
        assert_eq!(raw.nodes.len(), 1);
        assert_eq!(raw.nodes[0].id, "42");
    }

    #[tokio::test]
    async fn valid_json_needs_no_repair() {
        let provider = LlmExtractionProvider::new(Scripted::new(vec![Ok(GOOD.into())]));
        let raw = provider.extract(&chunk(), &GraphSchema::biomedical()).await.unwrap();
        assert_eq!(raw.nodes[0].id, "John");
    }

    #[tokio::test]
    async fn repairs_invalid_json_once() {
        let provider = LlmExtractionProvider::new(Scripted::new(vec![
            Ok("{nodes: [oops".into()),
            Ok(GOOD.into()),
        ]));
        let raw = provider.extract(&chunk(), &GraphSchema::biomedical()).await.unwrap();
        assert_eq!(raw.nodes.len(), 1);
    }

    #[tokio::test]
    async fn unrepairable_output_is_an_error() {
        let provider = LlmExtractionProvider::new(Scripted::new(vec![
            Ok("not json".into()),
            Ok("still not json".into()),
        ]));
        let err = provider.extract(&chunk(), &GraphSchema::biomedical()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Unparseable { .. }));
    }

    #[tokio::test]
    async fn model_failure_is_an_error() {
        let provider = LlmExtractionProvider::new(Scripted::new(vec![Err(LlmError::Status {
            status: 500,
            body: "boom".into(),
        })]));
        let err = provider.extract(&chunk(), &GraphSchema::biomedical()).await.unwrap_err();
        assert!(matches!(err, ExtractionError::Model { .. }));
    }
}
