use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;

use extract::TextGenerator;
use index::{GraphStore, Row, SearchHit, StoreSchema};

use crate::executor::{QueryExecutionError, QueryExecutor};
use crate::planner::{QueryPlanner, QueryPlanningError};
use crate::synthesizer::{AnswerSynthesizer, SynthesisError, format_rows};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryResult {
    pub question: String,
    pub answer: String,
    pub generated_query: String,
    pub result_rows: Vec<Row>,
    /// Full chain output: `query`, `result` and the intermediate steps
    /// (generated query, then the rows used as context).
    pub raw_response: Value,
}

#[derive(Debug, thiserror::Error)]
pub enum QaError {
    #[error(transparent)]
    Planning(#[from] QueryPlanningError),
    #[error("query execution failed: {source}")]
    Execution {
        query: String,
        #[source]
        source: QueryExecutionError,
    },
    #[error(transparent)]
    Synthesis(#[from] SynthesisError),
}

/// Question answering over the graph: plan a query, run it, and phrase
/// the rows as an answer. One attempt per question, no retries.
#[derive(Clone)]
pub struct GraphQa {
    planner: QueryPlanner,
    executor: QueryExecutor,
    synthesizer: AnswerSynthesizer,
}

impl GraphQa {
    pub fn new(planner: QueryPlanner, executor: QueryExecutor, synthesizer: AnswerSynthesizer) -> Self {
        Self {
            planner,
            executor,
            synthesizer,
        }
    }

    /// Planner and synthesizer share one model.
    pub fn with_model(llm: Arc<dyn TextGenerator>, store: Arc<dyn GraphStore>, top_k: usize) -> Self {
        Self::new(
            QueryPlanner::new(llm.clone()),
            QueryExecutor::new(store, top_k),
            AnswerSynthesizer::new(llm),
        )
    }

    pub fn top_k(&self) -> usize {
        self.executor.top_k()
    }

    pub async fn ask(&self, question: &str, schema: &StoreSchema, hints: &[SearchHit]) -> Result<QueryResult, QaError> {
        let generated_query = self.planner.plan(question, schema, hints).await?;
        tracing::info!(%question, query = %generated_query, "generated cypher");

        let result_rows = self
            .executor
            .execute(&generated_query)
            .await
            .map_err(|source| QaError::Execution {
                query: generated_query.clone(),
                source,
            })?;
        tracing::debug!(rows = result_rows.len(), context = %format_rows(&result_rows), "query results");

        let answer = self.synthesizer.synthesize(question, &result_rows).await?;

        let raw_response = json!({
            "query": question,
            "result": answer,
            "intermediate_steps": [
                { "query": generated_query },
                { "context": result_rows },
            ],
        });

        Ok(QueryResult {
            question: question.to_string(),
            answer,
            generated_query,
            result_rows,
            raw_response,
        })
    }
}
