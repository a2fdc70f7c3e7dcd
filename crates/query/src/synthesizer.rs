use serde_json::Value;
use std::sync::Arc;

use extract::{LlmError, TextGenerator};
use index::Row;

/// Fixed reply when the query matched nothing.
pub const NOT_FOUND_ANSWER: &str = "I couldn't find that information in the document.";

#[derive(Debug, thiserror::Error)]
pub enum SynthesisError {
    #[error("answer model call failed: {0}")]
    Model(#[from] LlmError),
}

/// Turns result rows into a conversational answer. Answers are grounded in
/// the rows only; with no usable rows the model is not called at all.
#[derive(Clone)]
pub struct AnswerSynthesizer {
    llm: Arc<dyn TextGenerator>,
}

impl AnswerSynthesizer {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self { llm }
    }

    pub async fn synthesize(&self, question: &str, rows: &[Row]) -> Result<String, SynthesisError> {
        if !has_content(rows) {
            return Ok(NOT_FOUND_ANSWER.to_string());
        }

        let context = serde_json::to_string(rows).unwrap_or_default();
        let prompt = build_answer_prompt(question, &context);
        let answer = self.llm.generate(&prompt).await?;
        Ok(answer.trim().to_string())
    }
}

/// Rows made only of nulls (an unmatched `OPTIONAL`-style projection) carry
/// nothing to answer from.
fn has_content(rows: &[Row]) -> bool {
    rows.iter().any(|row| row.values().any(|v| !v.is_null()))
}

pub fn build_answer_prompt(question: &str, context: &str) -> String {
    format!(
        r#"Based on the question and database results, provide a natural, conversational answer.

Question: {question}

Database Results: {context}

Instructions:
1. Answer in a natural, conversational tone
2. If results show medications, diseases or symptoms, explain them clearly
3. Provide context and relevant details from the data
4. Use only the database results; do not add facts that are not in them
5. If no results, say "{NOT_FOUND_ANSWER}"
6. Keep it concise but informative

Answer:"#
    )
}

/// Render rows for logs and UIs, one `key: value` list per row.
pub fn format_rows(rows: &[Row]) -> String {
    rows.iter()
        .map(|row| {
            row.iter()
                .map(|(k, v)| match v {
                    Value::String(s) => format!("{k}: {s}"),
                    other => format!("{k}: {other}"),
                })
                .collect::<Vec<_>>()
                .join(", ")
        })
        .collect::<Vec<_>>()
        .join("\n")
}
