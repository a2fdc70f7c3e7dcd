use serde::Serialize;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;
use uuid::Uuid;

use extract::StagedGraph;
use index::EntityIndex;
use ingest::{Document, FileReader};

use crate::context::PipelineContext;
use crate::error::IngestError;

#[derive(Debug, Clone, Serialize)]
pub struct SkippedChunk {
    pub chunk_id: String,
    pub index: usize,
    pub reason: String,
}

/// Outcome of one full-replace ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct IngestionReport {
    pub run_id: Uuid,
    pub doc_id: String,
    pub source: String,
    pub chunks: usize,
    pub entities: usize,
    pub relationships: usize,
    pub indexed_entities: usize,
    pub skipped_chunks: Vec<SkippedChunk>,
    /// Out-of-schema nodes, edges and properties dropped by the gate
    pub rejected: usize,
    pub duration_ms: u64,
}

impl PipelineContext {
    /// Load raw bytes (PDF or UTF-8 text) and ingest them.
    pub async fn ingest_bytes(&self, bytes: &[u8], source: &str) -> Result<IngestionReport, IngestError> {
        let document = FileReader::read_bytes(bytes, source)?;
        self.ingest(&document).await
    }

    /// Rebuild the graph and index from one document.
    ///
    /// Extraction failures skip their chunk. Store and embedding failures
    /// abort the run before anything is written, so the previous graph and
    /// index stay in place.
    pub async fn ingest(&self, document: &Document) -> Result<IngestionReport, IngestError> {
        let _guard = self.ingestion.try_lock().map_err(|_| IngestError::Busy)?;
        let started = Instant::now();
        let run_id = Uuid::new_v4();

        if document.is_blank() {
            return Err(IngestError::NoText(document.source.clone()));
        }

        tracing::info!(%run_id, source = %document.source, doc_id = %document.doc_id, "ingestion started");

        self.store.ping().await?;

        let chunks = self.chunker.chunk_document(document);
        tracing::info!(%run_id, chunks = chunks.len(), "document chunked");

        let mut staged = StagedGraph::new();
        let mut skipped_chunks = Vec::new();
        let mut rejected = 0;

        for chunk in &chunks {
            match self.extractor.extract_chunk(chunk).await {
                Ok(extracted) => {
                    rejected += extracted.rejections.len();
                    staged.merge(extracted.fragment);
                }
                Err(e) => {
                    tracing::warn!(%run_id, chunk = %chunk.chunk_id, error = %e, "chunk extraction failed, skipping");
                    skipped_chunks.push(SkippedChunk {
                        chunk_id: chunk.chunk_id.clone(),
                        index: chunk.index,
                        reason: e.to_string(),
                    });
                }
            }
        }

        if !chunks.is_empty() && skipped_chunks.len() == chunks.len() {
            tracing::warn!(%run_id, "every chunk failed extraction, the graph will be empty");
        }

        let index = self.indexer.build(&staged).await?;
        let indexed_entities = index.len();

        self.store.replace(&staged, index.entries()).await?;
        let current: Arc<dyn EntityIndex> = match &self.store_index {
            Some(store_index) => store_index.clone(),
            None => Arc::new(index),
        };
        *self.index.write().await = Some(current);
        self.ready.store(true, Ordering::Release);

        let report = IngestionReport {
            run_id,
            doc_id: document.doc_id.clone(),
            source: document.source.clone(),
            chunks: chunks.len(),
            entities: staged.entity_count(),
            relationships: staged.relationship_count(),
            indexed_entities,
            skipped_chunks,
            rejected,
            duration_ms: started.elapsed().as_millis() as u64,
        };

        tracing::info!(
            %run_id,
            entities = report.entities,
            relationships = report.relationships,
            skipped = report.skipped_chunks.len(),
            rejected = report.rejected,
            duration_ms = report.duration_ms,
            "ingestion complete"
        );

        Ok(report)
    }
}
