use index::{IndexError, StoreError};
use ingest::ReadError;
use query::{QaError, QueryExecutionError, QueryPlanningError, SynthesisError};

/// Fatal ingestion failures. The store keeps its previous content in all
/// of these cases.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("an ingestion is already in progress")]
    Busy,
    #[error(transparent)]
    Read(#[from] ReadError),
    #[error("document {0} contains no text")]
    NoText(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
}

/// Per-question failures. None of them end the session.
#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error("no document has been ingested yet")]
    NotReady,
    #[error("question is empty")]
    EmptyQuestion,
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error(transparent)]
    Planning(#[from] QueryPlanningError),
    #[error("{source}")]
    Execution {
        query: String,
        #[source]
        source: QueryExecutionError,
    },
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}

impl From<QaError> for QueryError {
    fn from(err: QaError) -> Self {
        match err {
            QaError::Planning(e) => Self::Planning(e),
            QaError::Execution { query, source } => Self::Execution { query, source },
            QaError::Synthesis(e) => Self::Synthesis(e),
        }
    }
}

impl QueryError {
    /// The generated query, when the failure happened after planning
    pub fn generated_query(&self) -> Option<&str> {
        match self {
            Self::Execution { query, .. } => Some(query),
            _ => None,
        }
    }
}
