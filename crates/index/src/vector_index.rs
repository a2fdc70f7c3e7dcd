//! Hybrid similarity index over entities of one designated label.
//!
//! Every entity of `node_label` is rendered as text from the configured
//! properties and embedded. Lookups rank entries twice, by cosine similarity
//! and by BM25 keyword relevance, and fuse both rankings with Reciprocal
//! Rank Fusion. [`HybridIndex`] does this in process; stores that keep their
//! own vector and fulltext indexes implement [`EntityIndex`] instead.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;
use std::sync::Arc;

use extract::{Entity, EntityKey, StagedGraph};

use crate::embeddings::{Embedder, EmbeddingError};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexConfig {
    /// Label whose entities are indexed
    pub node_label: String,
    /// Properties concatenated into each entry's text
    pub text_properties: Vec<String>,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            node_label: "Patient".to_string(),
            text_properties: vec!["id".to_string(), "text".to_string()],
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("vector index unavailable: {0}")]
    Unavailable(#[from] EmbeddingError),
    #[error("embedding dimension mismatch: index uses {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("index lookup failed: {0}")]
    Lookup(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VectorEntry {
    pub key: EntityKey,
    pub id: String,
    pub text: String,
    #[serde(skip)]
    pub embedding: Vec<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub id: String,
    pub label: String,
    pub text: String,
    pub score: f32,
    pub semantic_rank: Option<usize>,
    pub keyword_rank: Option<usize>,
}

/// Ranked entity lookup with both halves fused by RRF.
#[async_trait]
pub trait EntityIndex: Send + Sync {
    async fn lookup(&self, embedding: &[f32], text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError>;

    /// Nothing to search; lets callers skip embedding the query.
    fn is_empty(&self) -> bool;
}

/// RRF parameters
#[derive(Debug, Clone)]
pub struct RrfFusion {
    /// Constant k (typically 60)
    pub k: f32,
    pub semantic_weight: f32,
    pub keyword_weight: f32,
}

impl Default for RrfFusion {
    fn default() -> Self {
        Self {
            k: 60.0,
            semantic_weight: 0.6,
            keyword_weight: 0.4,
        }
    }
}

/// One key of a fused ranking with its 1-based rank in each input.
#[derive(Debug, Clone, PartialEq)]
pub struct Fused<K> {
    pub key: K,
    pub score: f32,
    pub semantic_rank: Option<usize>,
    pub keyword_rank: Option<usize>,
}

impl RrfFusion {
    fn score(&self, semantic_rank: Option<usize>, keyword_rank: Option<usize>) -> f32 {
        let semantic = semantic_rank
            .map(|r| self.semantic_weight / (self.k + r as f32))
            .unwrap_or(0.0);
        let keyword = keyword_rank
            .map(|r| self.keyword_weight / (self.k + r as f32))
            .unwrap_or(0.0);
        semantic + keyword
    }

    /// Union of two best-first rankings, scored by weighted RRF. The result
    /// is unordered; see [`sort_hits`].
    pub fn fuse<K: Eq + Hash + Clone>(&self, semantic: &[K], keyword: &[K]) -> Vec<Fused<K>> {
        let mut ranks: HashMap<K, (Option<usize>, Option<usize>)> = HashMap::new();
        for (rank, key) in semantic.iter().enumerate() {
            ranks.entry(key.clone()).or_default().0.get_or_insert(rank + 1);
        }
        for (rank, key) in keyword.iter().enumerate() {
            ranks.entry(key.clone()).or_default().1.get_or_insert(rank + 1);
        }
        ranks
            .into_iter()
            .map(|(key, (semantic_rank, keyword_rank))| Fused {
                key,
                score: self.score(semantic_rank, keyword_rank),
                semantic_rank,
                keyword_rank,
            })
            .collect()
    }
}

/// Best score first, ties by id, cut to `limit`.
pub fn sort_hits(hits: &mut Vec<SearchHit>, limit: usize) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
    hits.truncate(limit);
}

/// `id: John\ntext: ...` for the properties `value` finds
pub fn render_entry_text(properties: &[String], value: impl Fn(&str) -> Option<String>) -> String {
    properties
        .iter()
        .filter_map(|property| value(property).map(|v| format!("{property}: {v}")))
        .collect::<Vec<_>>()
        .join("\n")
}

pub(crate) fn tokens(text: &str) -> impl Iterator<Item = String> + '_ {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
}

fn cosine(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let norm_a = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let norm_b = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm_a == 0.0 || norm_b == 0.0 {
        0.0
    } else {
        dot / (norm_a * norm_b)
    }
}

/// Term saturation
const BM25_K1: f32 = 1.2;
/// Length normalization
const BM25_B: f32 = 0.75;

/// Okapi BM25 statistics over the entry texts.
#[derive(Debug, Clone, Default)]
struct Bm25 {
    term_freqs: Vec<HashMap<String, usize>>,
    lengths: Vec<usize>,
    doc_freq: HashMap<String, usize>,
    avg_len: f32,
}

impl Bm25 {
    fn new<'a>(texts: impl Iterator<Item = &'a str>) -> Self {
        let mut bm25 = Self::default();
        for text in texts {
            let mut freqs: HashMap<String, usize> = HashMap::new();
            let mut length = 0;
            for token in tokens(text) {
                *freqs.entry(token).or_default() += 1;
                length += 1;
            }
            for term in freqs.keys() {
                *bm25.doc_freq.entry(term.clone()).or_default() += 1;
            }
            bm25.term_freqs.push(freqs);
            bm25.lengths.push(length);
        }
        if !bm25.lengths.is_empty() {
            let total: usize = bm25.lengths.iter().sum();
            bm25.avg_len = (total as f32 / bm25.lengths.len() as f32).max(1.0);
        }
        bm25
    }

    fn idf(&self, term: &str) -> f32 {
        let docs = self.term_freqs.len() as f32;
        let df = self.doc_freq.get(term).copied().unwrap_or(0) as f32;
        ((docs - df + 0.5) / (df + 0.5) + 1.0).ln()
    }

    fn score(&self, doc: usize, terms: &BTreeSet<String>) -> f32 {
        let length_norm = 1.0 - BM25_B + BM25_B * self.lengths[doc] as f32 / self.avg_len;
        terms
            .iter()
            .filter_map(|term| {
                let tf = *self.term_freqs[doc].get(term)? as f32;
                Some(self.idf(term) * tf * (BM25_K1 + 1.0) / (tf + BM25_K1 * length_norm))
            })
            .sum()
    }
}

#[derive(Debug, Clone, Default)]
pub struct HybridIndex {
    entries: Vec<VectorEntry>,
    dimension: usize,
    bm25: Bm25,
    fusion: RrfFusion,
}

impl HybridIndex {
    pub fn new(entries: Vec<VectorEntry>) -> Result<Self, IndexError> {
        let dimension = entries.first().map(|e| e.embedding.len()).unwrap_or(0);
        if let Some(bad) = entries.iter().find(|e| e.embedding.len() != dimension) {
            return Err(IndexError::DimensionMismatch {
                expected: dimension,
                actual: bad.embedding.len(),
            });
        }
        Ok(Self {
            bm25: Bm25::new(entries.iter().map(|e| e.text.as_str())),
            entries,
            dimension,
            fusion: RrfFusion::default(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Vector size shared by every entry, 0 when empty
    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn entries(&self) -> &[VectorEntry] {
        &self.entries
    }

    /// Entry positions ranked by cosine similarity, best first.
    pub fn semantic(&self, query: &[f32], limit: usize) -> Result<Vec<(usize, f32)>, IndexError> {
        if self.entries.is_empty() {
            return Ok(Vec::new());
        }
        if query.len() != self.dimension {
            return Err(IndexError::DimensionMismatch {
                expected: self.dimension,
                actual: query.len(),
            });
        }
        let mut ranked: Vec<(usize, f32)> = self
            .entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i, cosine(query, &e.embedding)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        Ok(ranked)
    }

    /// Entry positions ranked by BM25 score, best first. Entries sharing
    /// no term with the query are left out.
    pub fn keyword(&self, text: &str, limit: usize) -> Vec<(usize, f32)> {
        let terms: BTreeSet<String> = tokens(text).collect();
        if terms.is_empty() {
            return Vec::new();
        }
        let mut ranked: Vec<(usize, f32)> = (0..self.entries.len())
            .filter(|&i| terms.iter().any(|t| self.bm25.term_freqs[i].contains_key(t)))
            .map(|i| (i, self.bm25.score(i, &terms)))
            .collect();
        ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        ranked.truncate(limit);
        ranked
    }

    /// Union of both rankings, re-ranked by RRF score.
    pub fn hybrid(&self, query_embedding: &[f32], text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let semantic: Vec<usize> = self.semantic(query_embedding, limit)?.into_iter().map(|(i, _)| i).collect();
        let keyword: Vec<usize> = self.keyword(text, limit).into_iter().map(|(i, _)| i).collect();

        let mut hits: Vec<SearchHit> = self
            .fusion
            .fuse(&semantic, &keyword)
            .into_iter()
            .map(|fused| {
                let entry = &self.entries[fused.key];
                SearchHit {
                    id: entry.id.clone(),
                    label: entry.key.entity_type.clone(),
                    text: entry.text.clone(),
                    score: fused.score,
                    semantic_rank: fused.semantic_rank,
                    keyword_rank: fused.keyword_rank,
                }
            })
            .collect();

        sort_hits(&mut hits, limit);
        Ok(hits)
    }
}

#[async_trait]
impl EntityIndex for HybridIndex {
    async fn lookup(&self, embedding: &[f32], text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        self.hybrid(embedding, text, limit)
    }

    fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Builds [`HybridIndex`]es and queries any [`EntityIndex`] with one
/// embedding backend.
#[derive(Clone)]
pub struct VectorIndexer {
    embedder: Arc<dyn Embedder>,
    config: IndexConfig,
}

impl VectorIndexer {
    pub fn new(embedder: Arc<dyn Embedder>, config: IndexConfig) -> Self {
        Self { embedder, config }
    }

    pub fn config(&self) -> &IndexConfig {
        &self.config
    }

    pub fn entry_text(&self, entity: &Entity) -> String {
        render_entry_text(&self.config.text_properties, |property| {
            if property == "id" {
                Some(entity.id.clone())
            } else {
                entity.properties.get(property).map(|v| v.to_string())
            }
        })
    }

    /// Embed every entity of the configured label. Any embedding failure
    /// fails the whole build, as does an embedder whose vectors change size
    /// between entries.
    pub async fn build(&self, graph: &StagedGraph) -> Result<HybridIndex, IndexError> {
        let mut entries = Vec::new();
        for entity in graph.entities_of_type(&self.config.node_label) {
            let text = self.entry_text(entity);
            let embedding = self.embedder.embed(&text).await?;
            entries.push(VectorEntry {
                key: entity.entity_key(),
                id: entity.id.clone(),
                text,
                embedding,
            });
        }

        let index = HybridIndex::new(entries)?;
        tracing::info!(
            label = %self.config.node_label,
            entries = index.len(),
            dimension = index.dimension(),
            "vector index built"
        );
        Ok(index)
    }

    pub async fn search(&self, index: &dyn EntityIndex, text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        if index.is_empty() || limit == 0 {
            return Ok(Vec::new());
        }
        let embedding = self.embedder.embed(text).await?;
        index.lookup(&embedding, text, limit).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use extract::{GraphFragment, Properties, PropertyValue, Provenance};

    /// Maps texts onto a two-axis "metabolic vs cardiac" space.
    struct TopicEmbedder;

    #[async_trait]
    impl Embedder for TopicEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
            let text = text.to_lowercase();
            let metabolic = ["diabetes", "sugar", "glucose", "insulin"]
                .iter()
                .filter(|w| text.contains(*w))
                .count() as f32;
            let cardiac = ["heart", "cardiac", "hypertension", "blood pressure"]
                .iter()
                .filter(|w| text.contains(*w))
                .count() as f32;
            Ok(vec![metabolic + 0.01, cardiac + 0.01])
        }
    }

    struct Down;

    #[async_trait]
    impl Embedder for Down {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>, EmbeddingError> {
            Err(EmbeddingError::Status {
                status: 503,
                body: "unavailable".into(),
            })
        }
    }

    fn entity(entity_type: &str, id: &str, text: Option<&str>) -> Entity {
        let mut properties = Properties::new();
        if let Some(text) = text {
            properties.insert("text".into(), PropertyValue::Text(text.into()));
        }
        Entity {
            entity_type: entity_type.into(),
            id: id.into(),
            key: id.to_lowercase(),
            properties,
            provenance: Provenance::new("note.txt", "c1"),
        }
    }

    fn conditions() -> StagedGraph {
        let mut staged = StagedGraph::new();
        staged.merge(GraphFragment {
            entities: vec![
                entity("Disease", "T2DM", Some("diabetes mellitus type 2")),
                entity("Disease", "Hypertension", Some("chronic high blood pressure")),
                entity("Patient", "John", None),
            ],
            relationships: vec![],
        });
        staged
    }

    fn disease_indexer(embedder: Arc<dyn Embedder>) -> VectorIndexer {
        VectorIndexer::new(embedder, IndexConfig {
            node_label: "Disease".into(),
            text_properties: vec!["id".into(), "text".into()],
        })
    }

    #[tokio::test]
    async fn indexes_only_the_designated_label() {
        let indexer = disease_indexer(Arc::new(TopicEmbedder));
        let index = indexer.build(&conditions()).await.unwrap();

        assert_eq!(index.len(), 2);
        assert!(index.entries().iter().all(|e| e.key.entity_type == "Disease"));
        assert!(index.entries()[0].text.starts_with("id: "));
    }

    #[tokio::test]
    async fn semantic_and_keyword_queries_find_the_same_entity() {
        let indexer = disease_indexer(Arc::new(TopicEmbedder));
        let index = indexer.build(&conditions()).await.unwrap();

        let semantic = indexer.search(&index, "blood sugar disorder", 1).await.unwrap();
        assert_eq!(semantic[0].id, "T2DM");

        let exact = indexer.search(&index, "diabetes", 1).await.unwrap();
        assert_eq!(exact[0].id, "T2DM");
        assert_eq!(exact[0].keyword_rank, Some(1));
    }

    #[tokio::test]
    async fn embedding_outage_is_index_unavailable() {
        let indexer = disease_indexer(Arc::new(Down));
        let err = indexer.build(&conditions()).await.unwrap_err();
        assert!(matches!(err, IndexError::Unavailable(_)));
    }

    #[test]
    fn fusion_prefers_entries_found_by_both_rankings() {
        let entry = |id: &str, text: &str, embedding: Vec<f32>| VectorEntry {
            key: EntityKey::new("Disease", id.to_lowercase()),
            id: id.into(),
            text: text.into(),
            embedding,
        };
        let index = HybridIndex::new(vec![
            entry("A", "asthma", vec![1.0, 0.0]),
            entry("B", "bronchitis cough", vec![0.9, 0.1]),
            entry("C", "cough", vec![0.0, 1.0]),
        ])
        .unwrap();

        let hits = index.hybrid(&[1.0, 0.05], "cough", 3).unwrap();
        assert_eq!(hits[0].id, "B");
        assert!(hits.iter().any(|h| h.id == "C" && h.semantic_rank == Some(3)));
    }

    #[test]
    fn rejects_mixed_dimensions() {
        let entry = |embedding: Vec<f32>| VectorEntry {
            key: EntityKey::new("Patient", "x"),
            id: "x".into(),
            text: "x".into(),
            embedding,
        };
        assert!(HybridIndex::new(vec![entry(vec![1.0]), entry(vec![1.0, 2.0])]).is_err());
    }

    #[test]
    fn keyword_half_is_scored_with_bm25() {
        let entry = |id: &str, text: &str| VectorEntry {
            key: EntityKey::new("Medication", id.to_lowercase()),
            id: id.into(),
            text: text.into(),
            embedding: vec![1.0],
        };
        let index = HybridIndex::new(vec![
            entry("Aspirin", "aspirin daily dosage with food"),
            entry("Ibuprofen", "ibuprofen dosage"),
            entry("Metformin", "metformin dosage"),
            entry("Insulin", "insulin before meals"),
        ])
        .unwrap();

        // The rare term outweighs the common one.
        let ranked = index.keyword("metformin dosage", 10);
        assert_eq!(ranked[0].0, 2);
        assert_eq!(ranked.len(), 3);

        // Equal term frequency: the shorter text ranks first.
        let ranked = index.keyword("dosage", 10);
        assert_ne!(ranked[0].0, 0);
        assert_eq!(ranked.last().map(|r| r.0), Some(0));

        assert!(index.keyword("warfarin", 10).is_empty());
        assert!(index.keyword("  ", 10).is_empty());
    }

    #[test]
    fn fusion_keeps_ranks_from_both_inputs() {
        let fused = RrfFusion::default().fuse(&["a", "b"], &["b", "c"]);
        let by_key: HashMap<_, _> = fused.into_iter().map(|f| (f.key, f)).collect();

        assert_eq!(by_key["b"].semantic_rank, Some(2));
        assert_eq!(by_key["b"].keyword_rank, Some(1));
        assert_eq!(by_key["c"].semantic_rank, None);
        assert!(by_key["b"].score > by_key["a"].score);
        assert!(by_key["a"].score > by_key["c"].score);
    }
}
