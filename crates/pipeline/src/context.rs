use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};

use extract::{ExtractionProvider, Extractor, GraphSchema, TextGenerator};
use index::{Embedder, EntityIndex, GraphStats, GraphStore, IndexConfig, SearchHit, StoreError, VectorIndexer};
use ingest::{Chunker, ChunkerConfig, ChunkerError};
use query::{DEFAULT_TOP_K, GraphQa, QueryResult};

use crate::error::QueryError;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub chunking: ChunkerConfig,
    pub index: IndexConfig,
    /// Row cap for generated queries
    pub top_k: usize,
    /// Entity hints offered to the planner per question
    pub hint_limit: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            chunking: ChunkerConfig::default(),
            index: IndexConfig::default(),
            top_k: DEFAULT_TOP_K,
            hint_limit: 5,
        }
    }
}

/// External collaborators the pipeline is wired to.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<dyn GraphStore>,
    pub extraction: Arc<dyn ExtractionProvider>,
    /// Free-text model used for query planning and answers
    pub llm: Arc<dyn TextGenerator>,
    pub embedder: Arc<dyn Embedder>,
    /// Entity search served by the store itself (Neo4j vector and fulltext
    /// indexes). Without one, each ingestion builds an in-process index.
    pub entity_index: Option<Arc<dyn EntityIndex>>,
}

/// Everything one session needs: model handles, the store, the derived
/// index and the "graph is built" flag. Created once at startup and shared
/// by reference; at most one ingestion runs at a time while questions run
/// concurrently.
pub struct PipelineContext {
    pub(crate) store: Arc<dyn GraphStore>,
    pub(crate) extractor: Extractor,
    pub(crate) indexer: VectorIndexer,
    pub(crate) chunker: Chunker,
    qa: GraphQa,
    config: PipelineConfig,
    pub(crate) store_index: Option<Arc<dyn EntityIndex>>,
    pub(crate) index: RwLock<Option<Arc<dyn EntityIndex>>>,
    pub(crate) ingestion: Mutex<()>,
    pub(crate) ready: AtomicBool,
}

impl PipelineContext {
    pub fn new(config: PipelineConfig, schema: GraphSchema, services: Services) -> Result<Self, ChunkerError> {
        let chunker = Chunker::new(config.chunking)?;
        let Services {
            store,
            extraction,
            llm,
            embedder,
            entity_index,
        } = services;

        Ok(Self {
            extractor: Extractor::new(extraction, schema),
            indexer: VectorIndexer::new(embedder, config.index.clone()),
            qa: GraphQa::with_model(llm, store.clone(), config.top_k),
            chunker,
            store,
            config,
            store_index: entity_index,
            index: RwLock::new(None),
            ingestion: Mutex::new(()),
            ready: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn schema(&self) -> &GraphSchema {
        self.extractor.schema()
    }

    /// True once an ingestion has completed in this session
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    pub fn is_ingesting(&self) -> bool {
        self.ingestion.try_lock().is_err()
    }

    pub async fn health(&self) -> Result<(), StoreError> {
        self.store.ping().await
    }

    pub async fn stats(&self) -> Result<GraphStats, StoreError> {
        self.store.stats().await
    }

    /// Answer one question: plan against the live schema, execute, and
    /// phrase the rows. Failures are scoped to this question.
    pub async fn ask(&self, question: &str) -> Result<QueryResult, QueryError> {
        if !self.is_ready() {
            return Err(QueryError::NotReady);
        }
        let question = question.trim();
        if question.is_empty() {
            return Err(QueryError::EmptyQuestion);
        }

        let schema = self.store.schema().await?;
        let hints = self.entity_hints(question).await;

        Ok(self.qa.ask(question, &schema, &hints).await?)
    }

    /// Hybrid lookup over the indexed entities.
    pub async fn search(&self, text: &str, limit: usize) -> Result<Vec<SearchHit>, QueryError> {
        let index = self.current_index().await.ok_or(QueryError::NotReady)?;
        Ok(self.indexer.search(index.as_ref(), text, limit).await?)
    }

    async fn current_index(&self) -> Option<Arc<dyn EntityIndex>> {
        self.index.read().await.clone()
    }

    /// Best effort: planning works without hints, so an unreachable
    /// embedding service only costs hint quality.
    async fn entity_hints(&self, question: &str) -> Vec<SearchHit> {
        let Some(index) = self.current_index().await else {
            return Vec::new();
        };
        match self.indexer.search(index.as_ref(), question, self.config.hint_limit).await {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "entity hint lookup failed, planning without hints");
                Vec::new()
            }
        }
    }
}
