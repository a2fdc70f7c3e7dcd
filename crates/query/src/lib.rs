pub mod executor;
pub mod lint;
pub mod planner;
pub mod qa;
pub mod synthesizer;

pub use executor::{DEFAULT_TOP_K, QueryExecutionError, QueryExecutor};
pub use lint::{LintError, lint};
pub use planner::{QueryPlanner, QueryPlanningError, build_cypher_prompt, extract_cypher};
pub use qa::{GraphQa, QaError, QueryResult};
pub use synthesizer::{AnswerSynthesizer, NOT_FOUND_ANSWER, SynthesisError, build_answer_prompt, format_rows};
