use regex::Regex;
use std::sync::{Arc, LazyLock};

use extract::{LlmError, TextGenerator};
use index::{SearchHit, StoreSchema};

static FENCED: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z]*\s*\n?(.*?)```").expect("valid regex"));
/// The prompt ends in "Cypher Query:", which models often echo back.
static ECHOED_LABEL: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:cypher\s+query|cypher|query)\s*:\s*").expect("valid regex"));
static MATCH_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)^(?:OPTIONAL\s+)?MATCH\s*(?:\(|\w+\s*=)").expect("valid regex"));
static CLAUSE_START: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)^(?:WITH|UNWIND|CALL)\b.*(?:[()\[\]{}.'"=$]|\bAS\b)"#).expect("valid regex"));
static CONTINUATION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)^(?:(?:OPTIONAL|MATCH|WHERE|WITH|UNWIND|CALL|YIELD|RETURN|ORDER|SKIP|LIMIT|AND|OR|XOR|NOT|UNION|AS|DISTINCT|CASE|WHEN|THEN|ELSE|END|ASC|DESC|ASCENDING|DESCENDING|IS|IN|CONTAINS|STARTS|ENDS)\b|[^A-Za-z\s]|[A-Za-z_]\w*\s*(?:[.(,)\]}]|$))",
    )
    .expect("valid regex")
});
static RETURN_CLAUSE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bRETURN\b").expect("valid regex"));

#[derive(Debug, thiserror::Error)]
pub enum QueryPlanningError {
    #[error("query model call failed: {0}")]
    Model(#[from] LlmError),
    #[error("model did not produce a usable query: {response:?}")]
    NoQuery { response: String },
}

/// Maps a question plus the live store schema to one Cypher query.
/// Schema conformance is requested in the prompt, not checked.
#[derive(Clone)]
pub struct QueryPlanner {
    llm: Arc<dyn TextGenerator>,
}

impl QueryPlanner {
    pub fn new(llm: Arc<dyn TextGenerator>) -> Self {
        Self { llm }
    }

    pub async fn plan(
        &self,
        question: &str,
        schema: &StoreSchema,
        hints: &[SearchHit],
    ) -> Result<String, QueryPlanningError> {
        let prompt = build_cypher_prompt(&schema.render(), question, hints);
        let response = self.llm.generate(&prompt).await?;

        let query = extract_cypher(&response).ok_or(QueryPlanningError::NoQuery { response })?;
        tracing::debug!(%query, "planned query");
        Ok(query)
    }
}

pub fn build_cypher_prompt(schema: &str, question: &str, hints: &[SearchHit]) -> String {
    let hints = if hints.is_empty() {
        String::new()
    } else {
        let lines: Vec<String> = hints
            .iter()
            .map(|h| format!("- ({}:{{id: '{}'}})", h.label, h.id.replace('\'', "\\'")))
            .collect();
        format!(
            "\nEntities in the graph that look related to the question (use these exact ids when filtering):\n{}\n",
            lines.join("\n")
        )
    };

    format!(
        r#"Task: Generate a Cypher query to retrieve information from a Neo4j graph database.

Use ONLY the provided schema and relationship types.

Schema:
{schema}
{hints}
Instructions:
1. Generate syntactically correct Cypher queries
2. Use only node labels and relationship types from the schema
3. For questions about entities, use MATCH patterns to find them
4. Use RETURN to specify what information to retrieve
5. Keep queries simple and focused: one hop unless the question needs a chain of relationships
6. Output only the query, no explanations

Examples:
- "What medications?" → MATCH (p:Patient)-[:TAKES_MEDICATION]->(m:Medication) RETURN m.id
- "What diseases?" → MATCH (d:Disease) RETURN d.id
- "What symptoms?" → MATCH (s:Symptom) RETURN s.id
- "Which drugs target proteins expressed by BRCA1?" → MATCH (g:Gene {{id: 'BRCA1'}})-[:EXPRESSES]->(p:Protein)<-[:TARGETS]-(m:Medication) RETURN m.id

Question: {question}

Cypher Query:"#
    )
}

/// Pull the query text out of a model answer. The statement must start at
/// the beginning of a line (inside the fenced block when there is one) with
/// `MATCH`, `OPTIONAL MATCH`, `WITH`, `UNWIND` or `CALL`, and runs over the
/// following lines, blank ones included, until a line of prose. The
/// statement is kept whole; a query without `RETURN` is not usable.
pub fn extract_cypher(response: &str) -> Option<String> {
    let body = FENCED
        .captures(response)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str())
        .unwrap_or(response);

    let mut lines = body.lines().map(str::trim);
    let first = lines.by_ref().find_map(statement_start)?;

    let mut statement = vec![first];
    for line in lines {
        if line.is_empty() {
            continue;
        }
        if !continues_statement(line) {
            break;
        }
        statement.push(line);
    }

    let query = statement.join(" ").split_whitespace().collect::<Vec<_>>().join(" ");
    let query = query.trim_end_matches(';').trim().to_string();

    RETURN_CLAUSE.is_match(&query).then_some(query)
}

fn statement_start(line: &str) -> Option<&str> {
    let line = match ECHOED_LABEL.find(line) {
        Some(label) => &line[label.end()..],
        None => line,
    };
    (MATCH_START.is_match(line) || CLAUSE_START.is_match(line)).then_some(line)
}

fn continues_statement(line: &str) -> bool {
    !line.ends_with(':') && !line.ends_with('.') && CONTINUATION.is_match(line)
}
