use async_trait::async_trait;
use neo4rs::{ConfigBuilder, Graph, Query};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};

use extract::{Entity, EntityKey, PropertyValue, Relationship, StagedGraph};

use crate::store::{GraphStats, GraphStore, Row, StoreError, StoreSchema};
use crate::vector_index::{
    EntityIndex, IndexConfig, IndexError, RrfFusion, SearchHit, VectorEntry, render_entry_text, sort_hits, tokens,
};

/// Vector index over the `embedding` property of indexed nodes
pub const VECTOR_INDEX: &str = "vector_index";
/// Fulltext (Lucene, BM25-scored) index over the indexed text properties
pub const FULLTEXT_INDEX: &str = "entity_index";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Neo4jConfig {
    pub uri: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_database")]
    pub database: String,
}

fn default_database() -> String {
    "neo4j".to_string()
}

/// Graph store backed by Neo4j. Also serves entity lookups from the
/// database's own vector and fulltext indexes over `index.node_label`.
pub struct Neo4jStore {
    graph: Graph,
    index: IndexConfig,
    fusion: RrfFusion,
    /// Entries and vector size written by the last successful replace
    indexed: AtomicUsize,
    dimension: AtomicUsize,
}

impl Neo4jStore {
    pub fn new(graph: Graph, index: IndexConfig) -> Self {
        Self {
            graph,
            index,
            fusion: RrfFusion::default(),
            indexed: AtomicUsize::new(0),
            dimension: AtomicUsize::new(0),
        }
    }

    pub async fn connect(config: &Neo4jConfig, index: IndexConfig) -> Result<Self, StoreError> {
        let neo4j_config = ConfigBuilder::default()
            .uri(config.uri.as_str())
            .user(config.username.as_str())
            .password(config.password.as_str())
            .db(config.database.as_str())
            .build()
            .map_err(|e| StoreError::Connection(e.to_string()))?;

        let graph = Graph::connect(neo4j_config)
            .await
            .map_err(|e| StoreError::Connection(format!("{}: {e}", config.uri)))?;

        Ok(Self::new(graph, index))
    }

    /// Create lookup indexes on the merge key for every label in use, and
    /// recreate the entity search indexes for this run's vector size.
    async fn ensure_indexes(&self, graph: &StagedGraph, dimension: Option<usize>) -> Result<(), StoreError> {
        let mut labels: Vec<&str> = graph.entities().map(|e| e.entity_type.as_str()).collect();
        labels.sort_unstable();
        labels.dedup();

        for label in labels {
            let query = Query::new(format!(
                "CREATE INDEX {}_key_index IF NOT EXISTS FOR (n:`{label}`) ON (n.key)",
                label.to_lowercase()
            ));
            self.graph
                .run(query)
                .await
                .map_err(|e| StoreError::Write(format!("failed to create index on {label}.key: {e}")))?;
        }

        let mut statements = vec![
            format!("DROP INDEX {VECTOR_INDEX} IF EXISTS"),
            format!("DROP INDEX {FULLTEXT_INDEX} IF EXISTS"),
        ];
        if let Some(dimension) = dimension {
            statements.push(vector_index_statement(&self.index.node_label, dimension));
        }
        if !self.index.text_properties.is_empty() {
            statements.push(fulltext_index_statement(&self.index));
        }
        for statement in statements {
            self.graph
                .run(Query::new(statement.clone()))
                .await
                .map_err(|e| StoreError::Write(format!("{statement}: {e}")))?;
        }
        Ok(())
    }

    /// Collect every row of a query, keyed by column name.
    async fn rows(&self, query: Query) -> Result<Vec<Row>, String> {
        let mut result = self.graph.execute(query).await.map_err(|e| e.to_string())?;
        let mut rows = Vec::new();
        while let Some(row) = result.next().await.map_err(|e| e.to_string())? {
            let values: BTreeMap<String, serde_json::Value> = row.to().map_err(|e| e.to_string())?;
            rows.push(values.into_iter().collect());
        }
        Ok(rows)
    }

    async fn read(&self, cypher: &str) -> Result<Vec<Row>, StoreError> {
        self.rows(Query::new(cypher.to_string()))
            .await
            .map_err(StoreError::Read)
    }
}

fn vector_index_statement(label: &str, dimension: usize) -> String {
    format!(
        "CREATE VECTOR INDEX {VECTOR_INDEX} IF NOT EXISTS FOR (n:`{label}`) ON (n.embedding) \
         OPTIONS {{indexConfig: {{`vector.dimensions`: {dimension}, `vector.similarity_function`: 'cosine'}}}}"
    )
}

fn fulltext_index_statement(index: &IndexConfig) -> String {
    let properties: Vec<String> = index.text_properties.iter().map(|p| format!("n.`{p}`")).collect();
    format!(
        "CREATE FULLTEXT INDEX {FULLTEXT_INDEX} IF NOT EXISTS FOR (n:`{}`) ON EACH [{}]",
        index.node_label,
        properties.join(", ")
    )
}

/// Columns shared by both index lookups: merge key, id, and the text
/// properties in configured order.
const HIT_COLUMNS: &str = "node.key AS key, node.id AS id, [p IN $properties | toStringOrNull(node[p])] AS values";

fn with_property(query: Query, name: &str, value: &PropertyValue) -> Query {
    match value {
        PropertyValue::Bool(b) => query.param(name, *b),
        PropertyValue::Integer(i) => query.param(name, *i),
        PropertyValue::Float(x) => query.param(name, *x),
        PropertyValue::Text(s) => query.param(name, s.clone()),
    }
}

/// Property keys are snake_case identifiers and labels come from the
/// schema, so both can be spliced into the statement.
fn entity_query(entity: &Entity, embedding: Option<&[f32]>) -> Query {
    let mut cypher = format!(
        "MERGE (n:`{}` {{key: $key}}) SET n.id = $id, n.source = $source, n.chunk_ids = $chunk_ids",
        entity.entity_type
    );
    for (i, key) in entity.properties.keys().enumerate() {
        cypher.push_str(&format!(", n.`{key}` = $p{i}"));
    }
    if embedding.is_some() {
        cypher.push_str(", n.embedding = $embedding");
    }

    let mut query = Query::new(cypher)
        .param("key", entity.key.clone())
        .param("id", entity.id.clone())
        .param("source", entity.provenance.source.clone())
        .param("chunk_ids", entity.provenance.chunk_ids.iter().cloned().collect::<Vec<String>>());
    for (i, value) in entity.properties.values().enumerate() {
        query = with_property(query, &format!("p{i}"), value);
    }
    if let Some(embedding) = embedding {
        query = query.param("embedding", embedding.iter().map(|&x| f64::from(x)).collect::<Vec<f64>>());
    }
    query
}

fn relationship_query(relationship: &Relationship) -> Query {
    let mut cypher = format!(
        "MATCH (a:`{}` {{key: $source_key}}), (b:`{}` {{key: $target_key}}) MERGE (a)-[r:`{}`]->(b)",
        relationship.source.entity_type, relationship.target.entity_type, relationship.rel_type
    );
    for (i, key) in relationship.properties.keys().enumerate() {
        cypher.push_str(if i == 0 { " SET " } else { ", " });
        cypher.push_str(&format!("r.`{key}` = $p{i}"));
    }

    let mut query = Query::new(cypher)
        .param("source_key", relationship.source.key.clone())
        .param("target_key", relationship.target.key.clone());
    for (i, value) in relationship.properties.values().enumerate() {
        query = with_property(query, &format!("p{i}"), value);
    }
    query
}

fn text(row: &Row, column: &str) -> Option<String> {
    row.get(column).and_then(|v| v.as_str()).map(str::to_string)
}

/// One index hit: merge key, id and rendered entry text.
#[derive(Debug, Clone, PartialEq)]
struct IndexedNode {
    key: String,
    id: String,
    text: String,
}

fn indexed_nodes(rows: &[Row], properties: &[String]) -> Vec<IndexedNode> {
    rows.iter()
        .filter_map(|row| {
            let values = row.get("values").and_then(|v| v.as_array());
            let text = render_entry_text(properties, |property| {
                let position = properties.iter().position(|p| p == property)?;
                values?.get(position)?.as_str().map(str::to_string)
            });
            Some(IndexedNode {
                key: self::text(row, "key")?,
                id: self::text(row, "id")?,
                text,
            })
        })
        .collect()
}

/// Fuse the two index rankings into hits for `label`.
fn fuse_hits(
    fusion: &RrfFusion,
    label: &str,
    semantic: Vec<IndexedNode>,
    keyword: Vec<IndexedNode>,
    limit: usize,
) -> Vec<SearchHit> {
    let semantic_keys: Vec<String> = semantic.iter().map(|n| n.key.clone()).collect();
    let keyword_keys: Vec<String> = keyword.iter().map(|n| n.key.clone()).collect();
    let nodes: HashMap<String, IndexedNode> = semantic.into_iter().chain(keyword).map(|n| (n.key.clone(), n)).collect();

    let mut hits: Vec<SearchHit> = fusion
        .fuse(&semantic_keys, &keyword_keys)
        .into_iter()
        .filter_map(|fused| {
            let node = nodes.get(&fused.key)?;
            Some(SearchHit {
                id: node.id.clone(),
                label: label.to_string(),
                text: node.text.clone(),
                score: fused.score,
                semantic_rank: fused.semantic_rank,
                keyword_rank: fused.keyword_rank,
            })
        })
        .collect();
    sort_hits(&mut hits, limit);
    hits
}

#[async_trait]
impl GraphStore for Neo4jStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.rows(Query::new("RETURN 1 AS ok".to_string()))
            .await
            .map(|_| ())
            .map_err(StoreError::Connection)
    }

    async fn replace(&self, graph: &StagedGraph, embeddings: &[VectorEntry]) -> Result<(), StoreError> {
        let dimension = embeddings.first().map(|e| e.embedding.len());
        self.ensure_indexes(graph, dimension).await?;
        let by_key: HashMap<&EntityKey, &[f32]> =
            embeddings.iter().map(|e| (&e.key, e.embedding.as_slice())).collect();

        let mut txn = self
            .graph
            .start_txn()
            .await
            .map_err(|e| StoreError::Write(format!("failed to open transaction: {e}")))?;

        let mut statements = vec![Query::new("MATCH (n) DETACH DELETE n".to_string())];
        statements.extend(
            graph
                .entities()
                .map(|entity| entity_query(entity, by_key.get(&entity.entity_key()).copied())),
        );
        statements.extend(graph.relationships().map(relationship_query));

        for statement in statements {
            if let Err(e) = txn.run(statement).await {
                if let Err(rollback) = txn.rollback().await {
                    tracing::warn!(error = %rollback, "rollback after failed graph write also failed");
                }
                return Err(StoreError::Write(e.to_string()));
            }
        }

        txn.commit()
            .await
            .map_err(|e| StoreError::Write(format!("commit failed: {e}")))?;

        self.indexed.store(embeddings.len(), Ordering::Release);
        self.dimension.store(dimension.unwrap_or(0), Ordering::Release);

        // Index population is asynchronous; lookups right after ingestion
        // would otherwise miss fresh nodes.
        if let Err(e) = self.graph.run(Query::new("CALL db.awaitIndexes(60)".to_string())).await {
            tracing::warn!(error = %e, "entity indexes still populating");
        }

        tracing::info!(
            entities = graph.entity_count(),
            relationships = graph.relationship_count(),
            embeddings = embeddings.len(),
            "graph replaced"
        );
        Ok(())
    }

    async fn schema(&self) -> Result<StoreSchema, StoreError> {
        let mut schema = StoreSchema::default();

        let node_keys = self
            .read("MATCH (n) UNWIND labels(n) AS label UNWIND keys(n) AS key RETURN DISTINCT label, key")
            .await?;
        for row in &node_keys {
            if let (Some(label), Some(key)) = (text(row, "label"), text(row, "key")) {
                schema.add_node_property(&label, &key);
            }
        }

        let rel_keys = self
            .read(
                "MATCH ()-[r]->() WITH type(r) AS rel, keys(r) AS ks \
                 UNWIND CASE WHEN size(ks) = 0 THEN [null] ELSE ks END AS key \
                 RETURN DISTINCT rel, key",
            )
            .await?;
        for row in &rel_keys {
            if let Some(rel) = text(row, "rel") {
                schema.add_relationship_property(&rel, text(row, "key").as_deref());
            }
        }

        let patterns = self
            .read(
                "MATCH (a)-[r]->(b) UNWIND labels(a) AS source UNWIND labels(b) AS target \
                 RETURN DISTINCT source, type(r) AS rel, target",
            )
            .await?;
        for row in &patterns {
            if let (Some(source), Some(rel), Some(target)) =
                (text(row, "source"), text(row, "rel"), text(row, "target"))
            {
                schema.patterns.insert((source, rel, target));
            }
        }

        Ok(schema)
    }

    async fn execute(&self, query: &str) -> Result<Vec<Row>, StoreError> {
        self.rows(Query::new(query.to_string()))
            .await
            .map_err(StoreError::Execution)
    }

    async fn stats(&self) -> Result<GraphStats, StoreError> {
        let mut stats = GraphStats::default();

        for row in self
            .read("MATCH (n) UNWIND labels(n) AS label RETURN label, count(*) AS count")
            .await?
        {
            let count = row.get("count").and_then(|v| v.as_u64()).unwrap_or(0) as usize;
            if let Some(label) = text(&row, "label") {
                stats.node_count += count;
                stats.nodes_by_label.insert(label, count);
            }
        }

        let relationships = self.read("MATCH ()-[r]->() RETURN count(r) AS count").await?;
        stats.relationship_count = relationships
            .first()
            .and_then(|row| row.get("count"))
            .and_then(|v| v.as_u64())
            .unwrap_or(0) as usize;

        Ok(stats)
    }
}

#[async_trait]
impl EntityIndex for Neo4jStore {
    async fn lookup(&self, embedding: &[f32], text: &str, limit: usize) -> Result<Vec<SearchHit>, IndexError> {
        let expected = self.dimension.load(Ordering::Acquire);
        if embedding.len() != expected {
            return Err(IndexError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }
        let properties = self.index.text_properties.clone();

        let semantic = self
            .rows(
                Query::new(format!(
                    "CALL db.index.vector.queryNodes($index, $k, $embedding) YIELD node, score \
                     RETURN {HIT_COLUMNS} ORDER BY score DESC"
                ))
                .param("index", VECTOR_INDEX)
                .param("k", limit as i64)
                .param("embedding", embedding.iter().map(|&x| f64::from(x)).collect::<Vec<f64>>())
                .param("properties", properties.clone()),
            )
            .await
            .map_err(IndexError::Lookup)?;

        // Lowercased alphanumeric terms carry no Lucene syntax.
        let terms = tokens(text).collect::<Vec<_>>().join(" ");
        let keyword = if terms.is_empty() || properties.is_empty() {
            Vec::new()
        } else {
            self.rows(
                Query::new(format!(
                    "CALL db.index.fulltext.queryNodes($index, $terms) YIELD node, score \
                     RETURN {HIT_COLUMNS} ORDER BY score DESC LIMIT $k"
                ))
                .param("index", FULLTEXT_INDEX)
                .param("terms", terms)
                .param("k", limit as i64)
                .param("properties", properties.clone()),
            )
            .await
            .map_err(IndexError::Lookup)?
        };

        Ok(fuse_hits(
            &self.fusion,
            &self.index.node_label,
            indexed_nodes(&semantic, &properties),
            indexed_nodes(&keyword, &properties),
            limit,
        ))
    }

    fn is_empty(&self) -> bool {
        self.indexed.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(key: &str, id: &str, values: serde_json::Value) -> Row {
        json!({"key": key, "id": id, "values": values})
            .as_object()
            .cloned()
            .unwrap()
    }

    #[test]
    fn index_statements_follow_the_index_config() {
        let config = IndexConfig {
            node_label: "Disease".into(),
            text_properties: vec!["id".into(), "text".into()],
        };

        let vector = vector_index_statement(&config.node_label, 768);
        assert!(vector.starts_with("CREATE VECTOR INDEX vector_index IF NOT EXISTS FOR (n:`Disease`) ON (n.embedding)"));
        assert!(vector.contains("`vector.dimensions`: 768"));
        assert!(vector.contains("'cosine'"));

        assert_eq!(
            fulltext_index_statement(&config),
            "CREATE FULLTEXT INDEX entity_index IF NOT EXISTS FOR (n:`Disease`) ON EACH [n.`id`, n.`text`]"
        );
    }

    #[test]
    fn rows_render_entry_text_without_missing_properties() {
        let properties = vec!["id".to_string(), "text".to_string()];
        let nodes = indexed_nodes(
            &[
                row("t2dm", "T2DM", json!(["T2DM", "diabetes mellitus type 2"])),
                row("asthma", "Asthma", json!(["Asthma", null])),
            ],
            &properties,
        );

        assert_eq!(nodes[0].text, "id: T2DM\ntext: diabetes mellitus type 2");
        assert_eq!(nodes[1].text, "id: Asthma");
    }

    #[test]
    fn index_rankings_are_fused_per_node() {
        let node = |key: &str| IndexedNode {
            key: key.into(),
            id: key.to_uppercase(),
            text: format!("id: {}", key.to_uppercase()),
        };
        let hits = fuse_hits(
            &RrfFusion::default(),
            "Disease",
            vec![node("a"), node("b")],
            vec![node("b"), node("c")],
            2,
        );

        assert_eq!(hits.len(), 2);
        assert_eq!(hits[0].id, "B");
        assert_eq!((hits[0].semantic_rank, hits[0].keyword_rank), (Some(2), Some(1)));
        assert_eq!(hits[1].id, "A");
        assert!(hits.iter().all(|h| h.label == "Disease"));
    }
}
