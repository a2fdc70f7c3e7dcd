use async_trait::async_trait;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};

use extract::StagedGraph;

use crate::vector_index::VectorEntry;

/// One result row: projected column name to value.
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Node properties the store keeps for its own bookkeeping. They are not
/// part of the schema shown to the query planner.
pub const INTERNAL_PROPERTIES: &[&str] = &["key", "chunk_ids", "embedding"];

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("graph store unreachable: {0}")]
    Connection(String),
    #[error("graph write failed, previous graph kept: {0}")]
    Write(String),
    #[error("graph read failed: {0}")]
    Read(String),
    /// The database's own message for a rejected query, unmodified
    #[error("{0}")]
    Execution(String),
}

/// Persistent home of the knowledge graph.
///
/// Writes are whole-graph only: [`replace`](GraphStore::replace) swaps the
/// current content for a staged graph in one step, so a failed write never
/// leaves old and new data mixed.
#[async_trait]
pub trait GraphStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    /// Atomically clear the store and write `graph` in its place. Stores
    /// that search entities themselves keep `embeddings` on the matching
    /// nodes; an empty graph leaves the store empty.
    async fn replace(&self, graph: &StagedGraph, embeddings: &[VectorEntry]) -> Result<(), StoreError>;

    /// Labels, relationship types and property keys currently in use
    async fn schema(&self) -> Result<StoreSchema, StoreError>;

    /// Run a read query and collect its rows.
    async fn execute(&self, query: &str) -> Result<Vec<Row>, StoreError>;

    async fn stats(&self) -> Result<GraphStats, StoreError>;
}

/// The schema actually present in the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreSchema {
    pub node_properties: BTreeMap<String, BTreeSet<String>>,
    pub relationship_properties: BTreeMap<String, BTreeSet<String>>,
    /// `(source label, relationship type, target label)`
    pub patterns: BTreeSet<(String, String, String)>,
}

impl StoreSchema {
    pub fn is_empty(&self) -> bool {
        self.node_properties.is_empty()
    }

    pub fn has_label(&self, label: &str) -> bool {
        self.node_properties.contains_key(label)
    }

    pub fn has_relationship_type(&self, rel_type: &str) -> bool {
        self.relationship_properties.contains_key(rel_type)
            || self.patterns.iter().any(|(_, t, _)| t == rel_type)
    }

    pub(crate) fn add_node_property(&mut self, label: &str, key: &str) {
        let keys = self.node_properties.entry(label.to_string()).or_default();
        if !INTERNAL_PROPERTIES.contains(&key) {
            keys.insert(key.to_string());
        }
    }

    pub(crate) fn add_relationship_property(&mut self, rel_type: &str, key: Option<&str>) {
        let keys = self.relationship_properties.entry(rel_type.to_string()).or_default();
        if let Some(key) = key {
            keys.insert(key.to_string());
        }
    }

    /// Text layout handed to the query planner.
    pub fn render(&self) -> String {
        let mut out = String::from("Node properties:\n");
        for (label, keys) in &self.node_properties {
            out.push_str(&format!("{label} {{{}}}\n", join(keys)));
        }

        out.push_str("Relationship properties:\n");
        for (rel_type, keys) in &self.relationship_properties {
            if !keys.is_empty() {
                out.push_str(&format!("{rel_type} {{{}}}\n", join(keys)));
            }
        }

        out.push_str("The relationships:\n");
        for (source, rel_type, target) in &self.patterns {
            out.push_str(&format!("(:{source})-[:{rel_type}]->(:{target})\n"));
        }
        out
    }
}

fn join(keys: &BTreeSet<String>) -> String {
    keys.iter().map(String::as_str).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    pub node_count: usize,
    pub relationship_count: usize,
    pub nodes_by_label: BTreeMap<String, usize>,
}
