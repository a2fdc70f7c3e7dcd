use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::normalizer::is_identifier;

/// The closed catalogue of node and relationship types a deployment may
/// extract or query, plus the property-capture policy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphSchema {
    allowed_node_types: BTreeSet<String>,
    allowed_relationship_types: BTreeSet<String>,
    #[serde(default = "enabled")]
    node_properties: bool,
    #[serde(default = "enabled")]
    relationship_properties: bool,
}

fn enabled() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SchemaError {
    #[error("schema type {0:?} is not a valid identifier")]
    InvalidTypeName(String),
    #[error("schema must allow at least one node type")]
    NoNodeTypes,
}

impl GraphSchema {
    pub fn new<N, R, S, T>(node_types: N, relationship_types: R) -> Result<Self, SchemaError>
    where
        N: IntoIterator<Item = S>,
        R: IntoIterator<Item = T>,
        S: Into<String>,
        T: Into<String>,
    {
        let allowed_node_types: BTreeSet<String> = node_types.into_iter().map(Into::into).collect();
        let allowed_relationship_types: BTreeSet<String> =
            relationship_types.into_iter().map(Into::into).collect();

        if allowed_node_types.is_empty() {
            return Err(SchemaError::NoNodeTypes);
        }
        // Type names end up as Cypher labels, so they must be plain identifiers.
        if let Some(bad) = allowed_node_types
            .iter()
            .chain(allowed_relationship_types.iter())
            .find(|t| !is_identifier(t))
        {
            return Err(SchemaError::InvalidTypeName(bad.clone()));
        }

        Ok(Self {
            allowed_node_types,
            allowed_relationship_types,
            node_properties: true,
            relationship_properties: true,
        })
    }

    /// Clinical and research entity catalogue used by default.
    pub fn biomedical() -> Self {
        Self {
            allowed_node_types: [
                "Patient", "Disease", "Medication", "Test", "Symptom", "Doctor",
                "Procedure", "Anatomy", "Gene", "Protein", "Biomarker", "ClinicalTrial",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            allowed_relationship_types: [
                "HAS_DISEASE", "TAKES_MEDICATION", "UNDERWENT_TEST", "HAS_SYMPTOM", "TREATED_BY",
                "EXPRESSES", "MUTATES", "TARGETS", "ENROLLED_IN", "AFFECTS", "UNDERWENT_PROCEDURE",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            node_properties: true,
            relationship_properties: true,
        }
    }

    pub fn with_property_capture(mut self, node_properties: bool, relationship_properties: bool) -> Self {
        self.node_properties = node_properties;
        self.relationship_properties = relationship_properties;
        self
    }

    pub fn node_types(&self) -> impl Iterator<Item = &str> {
        self.allowed_node_types.iter().map(String::as_str)
    }

    pub fn relationship_types(&self) -> impl Iterator<Item = &str> {
        self.allowed_relationship_types.iter().map(String::as_str)
    }

    pub fn captures_node_properties(&self) -> bool {
        self.node_properties
    }

    pub fn captures_relationship_properties(&self) -> bool {
        self.relationship_properties
    }

    pub fn allows_node_type(&self, node_type: &str) -> bool {
        self.allowed_node_types.contains(node_type)
    }

    pub fn allows_relationship_type(&self, relationship_type: &str) -> bool {
        self.allowed_relationship_types.contains(relationship_type)
    }

    /// Map a model-proposed node type onto the schema, tolerating case,
    /// spacing and punctuation differences (`clinical trial` -> `ClinicalTrial`).
    pub fn canonical_node_type(&self, proposed: &str) -> Option<&str> {
        canonical(&self.allowed_node_types, proposed)
    }

    /// Same as [`canonical_node_type`](Self::canonical_node_type) for
    /// relationship types (`takes medication` -> `TAKES_MEDICATION`).
    pub fn canonical_relationship_type(&self, proposed: &str) -> Option<&str> {
        canonical(&self.allowed_relationship_types, proposed)
    }
}

impl Default for GraphSchema {
    fn default() -> Self {
        Self::biomedical()
    }
}

fn canonical<'a>(allowed: &'a BTreeSet<String>, proposed: &str) -> Option<&'a str> {
    if let Some(exact) = allowed.get(proposed) {
        return Some(exact.as_str());
    }
    let folded = fold(proposed);
    if folded.is_empty() {
        return None;
    }
    allowed
        .iter()
        .find(|candidate| fold(candidate) == folded)
        .map(String::as_str)
}

fn fold(name: &str) -> String {
    name.chars()
        .filter(char::is_ascii_alphanumeric)
        .map(|c| c.to_ascii_lowercase())
        .collect()
}
