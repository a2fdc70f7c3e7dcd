pub mod error;
pub mod gate;
pub mod graph;
pub mod llm;
pub mod normalizer;
pub mod prompt;
pub mod provider;
pub mod retry;
pub mod schema;

pub use error::ExtractionError;
pub use gate::{conform, Conformed, Rejection};
pub use graph::{
    Entity, EntityKey, GraphFragment, Properties, PropertyValue, Provenance, Relationship, StagedGraph,
};
pub use llm::{LlmApi, LlmClient, LlmConfig, LlmError, TextGenerator};
pub use normalizer::{is_identifier, EntityNormalizer};
pub use provider::{ExtractionProvider, LlmExtractionProvider, RawExtraction};
pub use retry::{RetryConfig, RetryPolicy};
pub use schema::{GraphSchema, SchemaError};

use ingest::Chunk;
use std::sync::Arc;

/// Schema-conformant extraction result for one chunk.
#[derive(Debug, Clone)]
pub struct ExtractedChunk {
    pub chunk_id: String,
    pub doc_id: String,
    pub fragment: GraphFragment,
    pub rejections: Vec<Rejection>,
}

/// Runs a provider over chunks and forces its output through the schema gate.
#[derive(Clone)]
pub struct Extractor {
    provider: Arc<dyn ExtractionProvider>,
    schema: GraphSchema,
    normalizer: EntityNormalizer,
}

impl Extractor {
    pub fn new(provider: Arc<dyn ExtractionProvider>, schema: GraphSchema) -> Self {
        Self {
            provider,
            schema,
            normalizer: EntityNormalizer::new(),
        }
    }

    pub fn schema(&self) -> &GraphSchema {
        &self.schema
    }

    /// Extract entities and relationships from a chunk
    pub async fn extract_chunk(&self, chunk: &Chunk) -> Result<ExtractedChunk, ExtractionError> {
        let raw = self.provider.extract(chunk, &self.schema).await?;
        let provenance = Provenance::new(&chunk.source, &chunk.chunk_id);

        let Conformed { fragment, rejections } = conform(&self.schema, &self.normalizer, raw, &provenance);

        if !rejections.is_empty() {
            tracing::debug!(
                chunk = %chunk.chunk_id,
                rejected = rejections.len(),
                "dropped out-of-schema extraction output"
            );
        }

        Ok(ExtractedChunk {
            chunk_id: chunk.chunk_id.clone(),
            doc_id: chunk.doc_id.clone(),
            fragment,
            rejections,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use provider::{RawNode, RawNodeRef, RawRelationship};

    struct Fixed(RawExtraction);

    #[async_trait]
    impl ExtractionProvider for Fixed {
        async fn extract(&self, _chunk: &Chunk, _schema: &GraphSchema) -> Result<RawExtraction, ExtractionError> {
            Ok(self.0.clone())
        }
    }

    #[tokio::test]
    async fn extracted_chunk_carries_provenance() {
        let raw = RawExtraction {
            nodes: vec![RawNode {
                id: "John".into(),
                node_type: "Patient".into(),
                properties: serde_json::Value::Null,
            }],
            relationships: vec![RawRelationship {
                source: RawNodeRef { id: "John".into(), node_type: "Patient".into() },
                target: RawNodeRef { id: "Hospital A".into(), node_type: "Hospital".into() },
                rel_type: "TREATED_BY".into(),
                properties: serde_json::Value::Null,
            }],
        };
        let extractor = Extractor::new(Arc::new(Fixed(raw)), GraphSchema::biomedical());
        let chunk = Chunk::new("doc".into(), 0, "John".into(), "note.pdf".into(), (0, 4));

        let extracted = extractor.extract_chunk(&chunk).await.unwrap();

        assert_eq!(extracted.doc_id, "doc");
        assert_eq!(extracted.fragment.entities.len(), 1);
        assert_eq!(extracted.fragment.entities[0].provenance.source, "note.pdf");
        assert!(extracted.fragment.entities[0].provenance.chunk_ids.contains(&chunk.chunk_id));
        assert_eq!(extracted.rejections.len(), 1);
    }
}
