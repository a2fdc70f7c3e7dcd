//! Session-level orchestration: one full-replace ingestion pass and the
//! question-answer pass, sharing one explicit [`PipelineContext`].

pub mod context;
pub mod error;
pub mod ingestion;

pub use context::{PipelineConfig, PipelineContext, Services};
pub use error::{IngestError, QueryError};
pub use ingestion::{IngestionReport, SkippedChunk};
