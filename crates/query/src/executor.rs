use std::sync::Arc;

use index::{GraphStore, Row, StoreError};

use crate::lint::{LintError, lint};

pub const DEFAULT_TOP_K: usize = 10;

#[derive(Debug, thiserror::Error)]
pub enum QueryExecutionError {
    #[error("query rejected before execution: {0}")]
    Rejected(#[from] LintError),
    /// The database message, passed through untouched.
    #[error("{0}")]
    Store(#[from] StoreError),
}

/// Runs a generated query against the store, read-only and capped at
/// `top_k` rows.
#[derive(Clone)]
pub struct QueryExecutor {
    store: Arc<dyn GraphStore>,
    top_k: usize,
}

impl QueryExecutor {
    pub fn new(store: Arc<dyn GraphStore>, top_k: usize) -> Self {
        Self {
            store,
            top_k: top_k.max(1),
        }
    }

    pub fn top_k(&self) -> usize {
        self.top_k
    }

    pub async fn execute(&self, query: &str) -> Result<Vec<Row>, QueryExecutionError> {
        lint(query)?;

        let mut rows = self.store.execute(query).await?;
        if rows.len() > self.top_k {
            tracing::debug!(returned = rows.len(), top_k = self.top_k, "truncating result rows");
            rows.truncate(self.top_k);
        }
        Ok(rows)
    }
}
