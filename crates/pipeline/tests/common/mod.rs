//! Offline fakes for the model, extraction and embedding services.

#![allow(dead_code)]

use async_trait::async_trait;
use regex::Regex;
use serde_json::{Value, json};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use tokio::sync::Notify;

use extract::provider::{RawNode, RawNodeRef, RawRelationship};
use extract::{ExtractionError, ExtractionProvider, GraphSchema, LlmError, RawExtraction, TextGenerator};
use index::{
    Embedder, EmbeddingError, EntityIndex, GraphStats, GraphStore, IndexError, MemoryGraphStore, Row, SearchHit,
    StoreError, StoreSchema, VectorEntry,
};
use ingest::Chunk;
use pipeline::{PipelineConfig, PipelineContext, Services};

static HAS: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Patient (\w+) has ([A-Za-z0-9 ]+?)\.").unwrap());
static TAKES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"Patient (\w+) takes (\w+)(?: (\d+ mg))?\.").unwrap());
static WORKS_AT: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"Patient (\w+) works at (\w+)\.").unwrap());

fn node(id: &str, node_type: &str, properties: Value) -> RawNode {
    RawNode {
        id: id.into(),
        node_type: node_type.into(),
        properties,
    }
}

fn edge(source: (&str, &str), rel_type: &str, target: (&str, &str)) -> RawRelationship {
    RawRelationship {
        source: RawNodeRef {
            id: source.0.into(),
            node_type: source.1.into(),
        },
        target: RawNodeRef {
            id: target.0.into(),
            node_type: target.1.into(),
        },
        rel_type: rel_type.into(),
        properties: Value::Null,
    }
}

/// Reads three sentence shapes out of a chunk, the way a model would:
/// "Patient X has Y.", "Patient X takes Y [N mg].", "Patient X works at Y."
/// The last one proposes a `Hospital`/`WORKS_AT` pair outside the schema.
/// Chunks containing "garbled" fail like an unparseable model answer.
#[derive(Default)]
pub struct SentenceExtraction {
    pub calls: AtomicUsize,
}

#[async_trait]
impl ExtractionProvider for SentenceExtraction {
    async fn extract(&self, chunk: &Chunk, _schema: &GraphSchema) -> Result<RawExtraction, ExtractionError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if chunk.text.contains("garbled") {
            return Err(ExtractionError::Unparseable {
                chunk_id: chunk.chunk_id.clone(),
                message: "expected value at line 1 column 1".into(),
            });
        }

        let mut raw = RawExtraction::default();
        for caps in HAS.captures_iter(&chunk.text) {
            raw.nodes.push(node(&caps[1], "Patient", Value::Null));
            raw.nodes.push(node(&caps[2], "Disease", Value::Null));
            raw.relationships
                .push(edge((&caps[1], "Patient"), "HAS_DISEASE", (&caps[2], "Disease")));
        }
        for caps in TAKES.captures_iter(&chunk.text) {
            let properties = caps
                .get(3)
                .map(|dosage| json!({ "dosage": dosage.as_str() }))
                .unwrap_or(Value::Null);
            raw.nodes.push(node(&caps[1], "Patient", Value::Null));
            raw.nodes.push(node(&caps[2], "medication", properties));
            raw.relationships
                .push(edge((&caps[1], "Patient"), "takes medication", (&caps[2], "Medication")));
        }
        for caps in WORKS_AT.captures_iter(&chunk.text) {
            raw.nodes.push(node(&caps[2], "Hospital", Value::Null));
            raw.relationships
                .push(edge((&caps[1], "Patient"), "WORKS_AT", (&caps[2], "Hospital")));
        }
        Ok(raw)
    }
}

/// Extraction that parks on its first call until released, to hold an
/// ingestion open.
pub struct ParkedExtraction {
    pub entered: Notify,
    pub release: Notify,
    first: AtomicBool,
    inner: SentenceExtraction,
}

impl ParkedExtraction {
    pub fn new() -> Self {
        Self {
            entered: Notify::new(),
            release: Notify::new(),
            first: AtomicBool::new(true),
            inner: SentenceExtraction::default(),
        }
    }
}

#[async_trait]
impl ExtractionProvider for ParkedExtraction {
    async fn extract(&self, chunk: &Chunk, schema: &GraphSchema) -> Result<RawExtraction, ExtractionError> {
        if self.first.swap(false, Ordering::SeqCst) {
            self.entered.notify_one();
            self.release.notified().await;
        }
        self.inner.extract(chunk, schema).await
    }
}

/// Free-text model fake. Planning prompts are answered from a table of
/// question fragments to Cypher; answer prompts echo the database results,
/// so answers only ever mention what the rows contain.
pub struct FakeLlm {
    plans: Vec<(String, String)>,
    pub prompts: Mutex<Vec<String>>,
}

impl FakeLlm {
    pub fn new(plans: &[(&str, &str)]) -> Self {
        Self {
            plans: plans
                .iter()
                .map(|(q, cypher)| (q.to_lowercase(), cypher.to_string()))
                .collect(),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn answer_calls(&self) -> usize {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.contains("Database Results:"))
            .count()
    }

    pub fn last_planning_prompt(&self) -> Option<String> {
        self.prompts
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|p| p.trim_end().ends_with("Cypher Query:"))
            .cloned()
    }
}

#[async_trait]
impl TextGenerator for FakeLlm {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        self.prompts.lock().unwrap().push(prompt.to_string());

        if prompt.trim_end().ends_with("Cypher Query:") {
            let question = prompt
                .lines()
                .rev()
                .find_map(|l| l.strip_prefix("Question: "))
                .unwrap_or_default()
                .to_lowercase();
            let plan = self
                .plans
                .iter()
                .find(|(fragment, _)| question.contains(fragment.as_str()))
                .map(|(_, cypher)| format!("```cypher\n{cypher}\n```"));
            return Ok(plan.unwrap_or_else(|| "I am not sure how to query that.".into()));
        }

        match prompt.lines().find_map(|l| l.strip_prefix("Database Results: ")) {
            Some(results) => Ok(format!("From the graph: {results}")),
            None => Err(LlmError::Empty),
        }
    }
}

/// Deterministic three-axis embedding: metabolic terms, cardiac terms, and a
/// constant bias so no vector is zero. Switch `down` on to simulate an
/// unreachable service.
#[derive(Default)]
pub struct TopicEmbedder {
    pub down: AtomicBool,
    pub calls: AtomicUsize,
}

const METABOLIC: &[&str] = &["diabetes", "mellitus", "blood sugar", "glucose", "metformin", "insulin"];
const CARDIAC: &[&str] = &["hypertension", "blood pressure", "heart", "cardiac", "lisinopril"];

#[async_trait]
impl Embedder for TopicEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.down.load(Ordering::SeqCst) {
            return Err(EmbeddingError::Status {
                status: 503,
                body: "embedding service unavailable".into(),
            });
        }
        let text = text.to_lowercase();
        let score = |terms: &[&str]| terms.iter().filter(|t| text.contains(*t)).count() as f32;
        Ok(vec![score(METABOLIC), score(CARDIAC), 0.1])
    }
}

/// Memory store whose writes can be made to fail. Keeps the embeddings
/// handed to the last successful write.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryGraphStore,
    pub fail_writes: AtomicBool,
    pub embeddings: Mutex<Vec<VectorEntry>>,
}

#[async_trait]
impl GraphStore for FlakyStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.inner.ping().await
    }

    async fn replace(&self, graph: &extract::StagedGraph, embeddings: &[VectorEntry]) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Write("transaction rolled back".into()));
        }
        self.inner.replace(graph, embeddings).await?;
        *self.embeddings.lock().unwrap() = embeddings.to_vec();
        Ok(())
    }

    async fn schema(&self) -> Result<StoreSchema, StoreError> {
        self.inner.schema().await
    }

    async fn execute(&self, query: &str) -> Result<Vec<Row>, StoreError> {
        self.inner.execute(query).await
    }

    async fn stats(&self) -> Result<GraphStats, StoreError> {
        self.inner.stats().await
    }
}

pub fn clinic_schema() -> GraphSchema {
    GraphSchema::new(
        ["Patient", "Disease", "Medication"],
        ["HAS_DISEASE", "TAKES_MEDICATION"],
    )
    .unwrap()
}

pub struct Harness {
    pub context: Arc<PipelineContext>,
    pub store: Arc<FlakyStore>,
    pub llm: Arc<FakeLlm>,
    pub embedder: Arc<TopicEmbedder>,
    pub store_index: Option<Arc<StoreSideIndex>>,
}

pub fn harness(config: PipelineConfig, schema: GraphSchema, plans: &[(&str, &str)]) -> Harness {
    harness_with(config, schema, plans, Arc::new(SentenceExtraction::default()))
}

/// Stands in for a database-side vector and fulltext index: answers every
/// lookup with the embedded entities of the last write, in write order.
pub struct StoreSideIndex {
    pub store: Arc<FlakyStore>,
    pub lookups: AtomicUsize,
}

#[async_trait]
impl EntityIndex for StoreSideIndex {
    async fn lookup(&self, embedding: &[f32], _text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        let entries = self.store.embeddings.lock().unwrap().clone();
        Ok(entries
            .into_iter()
            .filter(|e| e.embedding.len() == embedding.len())
            .take(limit)
            .enumerate()
            .map(|(i, e)| SearchHit {
                id: e.id,
                label: e.key.entity_type,
                text: e.text,
                score: 1.0 / (i + 1) as f32,
                semantic_rank: Some(i + 1),
                keyword_rank: None,
            })
            .collect())
    }

    fn is_empty(&self) -> bool {
        self.store.embeddings.lock().unwrap().is_empty()
    }
}

pub fn harness_with(
    config: PipelineConfig,
    schema: GraphSchema,
    plans: &[(&str, &str)],
    extraction: Arc<dyn ExtractionProvider>,
) -> Harness {
    build_harness(config, schema, plans, extraction, false)
}

/// Harness whose entity search is served by [`StoreSideIndex`].
pub fn harness_with_store_index(config: PipelineConfig, schema: GraphSchema) -> (Harness, Arc<StoreSideIndex>) {
    let h = build_harness(config, schema, &[], Arc::new(SentenceExtraction::default()), true);
    let index = h.store_index.clone().unwrap();
    (h, index)
}

fn build_harness(
    config: PipelineConfig,
    schema: GraphSchema,
    plans: &[(&str, &str)],
    extraction: Arc<dyn ExtractionProvider>,
    store_side_index: bool,
) -> Harness {
    let store = Arc::new(FlakyStore::default());
    let llm = Arc::new(FakeLlm::new(plans));
    let embedder = Arc::new(TopicEmbedder::default());
    let store_index = store_side_index.then(|| {
        Arc::new(StoreSideIndex {
            store: store.clone(),
            lookups: AtomicUsize::new(0),
        })
    });
    let context = PipelineContext::new(
        config,
        schema,
        Services {
            store: store.clone(),
            extraction,
            llm: llm.clone(),
            embedder: embedder.clone(),
            entity_index: store_index.clone().map(|index| index as Arc<dyn EntityIndex>),
        },
    )
    .unwrap();

    Harness {
        context: Arc::new(context),
        store,
        llm,
        embedder,
        store_index,
    }
}

pub fn rows_column(rows: &[Row], column: &str) -> Vec<String> {
    rows.iter()
        .filter_map(|r| r.get(column).and_then(Value::as_str).map(str::to_string))
        .collect()
}
