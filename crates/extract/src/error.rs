use crate::llm::LlmError;

/// Failure to extract one chunk. Ingestion records it and moves on.
#[derive(Debug, thiserror::Error)]
pub enum ExtractionError {
    #[error("extraction model call failed for chunk {chunk_id}: {source}")]
    Model {
        chunk_id: String,
        #[source]
        source: LlmError,
    },
    #[error("extraction output for chunk {chunk_id} is not valid graph JSON: {message}")]
    Unparseable { chunk_id: String, message: String },
}

impl ExtractionError {
    pub fn chunk_id(&self) -> &str {
        match self {
            Self::Model { chunk_id, .. } | Self::Unparseable { chunk_id, .. } => chunk_id,
        }
    }
}
