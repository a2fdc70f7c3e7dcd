//! Process-local graph store.
//!
//! Holds the whole graph behind one lock and answers a read-only subset of
//! Cypher (see [`cypher`]). Used for offline runs and by the test suites;
//! production deployments talk to Neo4j.

pub mod cypher;
mod eval;

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tokio::sync::RwLock;

use extract::{EntityKey, StagedGraph};

use crate::store::{GraphStats, GraphStore, Row, StoreError, StoreSchema};
use crate::vector_index::VectorEntry;

#[derive(Debug, Clone, PartialEq)]
pub struct StoredNode {
    pub label: String,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoredEdge {
    pub rel_type: String,
    pub source: usize,
    pub target: usize,
    pub properties: Map<String, Value>,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryGraph {
    pub(crate) nodes: Vec<StoredNode>,
    pub(crate) edges: Vec<StoredEdge>,
}

impl MemoryGraph {
    /// Lay out a staged graph as stored nodes and edges, with the same
    /// property layout the Neo4j backend writes.
    pub fn from_staged(staged: &StagedGraph) -> Self {
        let mut graph = Self::default();
        let mut positions: BTreeMap<EntityKey, usize> = BTreeMap::new();

        for entity in staged.entities() {
            let mut properties: Map<String, Value> = entity
                .properties
                .iter()
                .map(|(k, v)| (k.clone(), v.to_json()))
                .collect();
            properties.insert("id".into(), Value::String(entity.id.clone()));
            properties.insert("key".into(), Value::String(entity.key.clone()));
            properties.insert("source".into(), Value::String(entity.provenance.source.clone()));
            properties.insert(
                "chunk_ids".into(),
                entity.provenance.chunk_ids.iter().cloned().map(Value::String).collect(),
            );

            positions.insert(entity.entity_key(), graph.nodes.len());
            graph.nodes.push(StoredNode {
                label: entity.entity_type.clone(),
                properties,
            });
        }

        for relationship in staged.relationships() {
            let (Some(&source), Some(&target)) =
                (positions.get(&relationship.source), positions.get(&relationship.target))
            else {
                continue;
            };
            graph.edges.push(StoredEdge {
                rel_type: relationship.rel_type.clone(),
                source,
                target,
                properties: relationship
                    .properties
                    .iter()
                    .map(|(k, v)| (k.clone(), v.to_json()))
                    .collect(),
            });
        }

        graph
    }

    pub fn nodes(&self) -> &[StoredNode] {
        &self.nodes
    }

    pub fn edges(&self) -> &[StoredEdge] {
        &self.edges
    }

    /// `(label, id)` of every node
    pub fn node_ids(&self) -> Vec<(String, String)> {
        self.nodes
            .iter()
            .map(|n| {
                let id = n.properties.get("id").and_then(Value::as_str).unwrap_or_default();
                (n.label.clone(), id.to_string())
            })
            .collect()
    }

    /// `(source id, type, target id)` of every edge
    pub fn edge_triples(&self) -> Vec<(String, String, String)> {
        let id = |index: usize| {
            self.nodes[index]
                .properties
                .get("id")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        self.edges
            .iter()
            .map(|e| (id(e.source), e.rel_type.clone(), id(e.target)))
            .collect()
    }
}

#[derive(Debug, Default)]
pub struct MemoryGraphStore {
    graph: RwLock<MemoryGraph>,
}

impl MemoryGraphStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current graph for inspection.
    pub async fn snapshot(&self) -> MemoryGraph {
        self.graph.read().await.clone()
    }
}

#[async_trait]
impl GraphStore for MemoryGraphStore {
    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Embeddings stay with the in-process [`HybridIndex`](crate::HybridIndex).
    async fn replace(&self, graph: &StagedGraph, _embeddings: &[VectorEntry]) -> Result<(), StoreError> {
        // Built in full before the lock is taken; readers see old or new, never a mix.
        let next = MemoryGraph::from_staged(graph);
        *self.graph.write().await = next;
        Ok(())
    }

    async fn schema(&self) -> Result<StoreSchema, StoreError> {
        let graph = self.graph.read().await;
        let mut schema = StoreSchema::default();

        for node in &graph.nodes {
            for key in node.properties.keys() {
                schema.add_node_property(&node.label, key);
            }
        }
        for edge in &graph.edges {
            if edge.properties.is_empty() {
                schema.add_relationship_property(&edge.rel_type, None);
            }
            for key in edge.properties.keys() {
                schema.add_relationship_property(&edge.rel_type, Some(key));
            }
            schema.patterns.insert((
                graph.nodes[edge.source].label.clone(),
                edge.rel_type.clone(),
                graph.nodes[edge.target].label.clone(),
            ));
        }

        Ok(schema)
    }

    async fn execute(&self, query: &str) -> Result<Vec<Row>, StoreError> {
        let parsed = cypher::parse(query).map_err(|e| StoreError::Execution(e.to_string()))?;
        let graph = self.graph.read().await;
        eval::run(&graph, &parsed).map_err(|e| StoreError::Execution(e.to_string()))
    }

    async fn stats(&self) -> Result<GraphStats, StoreError> {
        let graph = self.graph.read().await;
        let mut nodes_by_label = BTreeMap::new();
        for node in &graph.nodes {
            *nodes_by_label.entry(node.label.clone()).or_insert(0) += 1;
        }
        Ok(GraphStats {
            node_count: graph.nodes.len(),
            relationship_count: graph.edges.len(),
            nodes_by_label,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use extract::{Entity, GraphFragment, Properties, PropertyValue, Provenance, Relationship};
    use serde_json::json;

    fn entity(entity_type: &str, id: &str, properties: Properties) -> Entity {
        Entity {
            entity_type: entity_type.into(),
            id: id.into(),
            key: id.to_lowercase(),
            properties,
            provenance: Provenance::new("note.txt", "c1"),
        }
    }

    fn staged(patient: &str) -> StagedGraph {
        let john = entity("Patient", patient, Properties::new());
        let metformin = entity(
            "Medication",
            "Metformin",
            [("dosage".to_string(), PropertyValue::Text("500 mg".into()))].into(),
        );
        let takes = Relationship {
            rel_type: "TAKES_MEDICATION".into(),
            source: john.entity_key(),
            target: metformin.entity_key(),
            properties: Properties::new(),
        };
        let mut staged = StagedGraph::new();
        staged.merge(GraphFragment {
            entities: vec![john, metformin],
            relationships: vec![takes],
        });
        staged
    }

    #[tokio::test]
    async fn replace_swaps_whole_graph() {
        let store = MemoryGraphStore::new();
        store.replace(&staged("John"), &[]).await.unwrap();
        store.replace(&staged("Mary"), &[]).await.unwrap();

        let rows = store.execute("MATCH (p:Patient) RETURN p.id").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["p.id"], json!("Mary"));

        let snapshot = store.snapshot().await;
        assert_eq!(snapshot.edge_triples(), vec![(
            "Mary".to_string(),
            "TAKES_MEDICATION".to_string(),
            "Metformin".to_string()
        )]);
    }

    #[tokio::test]
    async fn reports_live_schema_and_stats() {
        let store = MemoryGraphStore::new();
        store.replace(&staged("John"), &[]).await.unwrap();

        let schema = store.schema().await.unwrap();
        assert!(schema.has_label("Patient"));
        assert!(schema.node_properties["Medication"].contains("dosage"));
        assert!(!schema.node_properties["Medication"].contains("key"));
        assert!(schema.render().contains("(:Patient)-[:TAKES_MEDICATION]->(:Medication)"));

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.node_count, 2);
        assert_eq!(stats.relationship_count, 1);
        assert_eq!(stats.nodes_by_label["Patient"], 1);
    }

    #[tokio::test]
    async fn execution_errors_are_verbatim() {
        let store = MemoryGraphStore::new();
        let err = store.execute("MATCH (p:Patient) RETURN m.id").await.unwrap_err();
        assert!(matches!(err, StoreError::Execution(ref m) if m == "Variable `m` not defined"));
    }

    #[tokio::test]
    async fn empty_graph_empties_the_store() {
        let store = MemoryGraphStore::new();
        store.replace(&staged("John"), &[]).await.unwrap();
        store.replace(&StagedGraph::new(), &[]).await.unwrap();
        assert!(store.schema().await.unwrap().is_empty());
        assert!(store.execute("MATCH (n) RETURN n.id").await.unwrap().is_empty());
    }
}
