//! Post-extraction schema gate.
//!
//! Every provider's output passes through [`conform`] before it can reach
//! the graph store. Types outside the schema are remapped when they are a
//! spelling variant of an allowed type and dropped otherwise; a relationship
//! whose endpoint type is dropped is dropped with it.

use serde::Serialize;
use std::collections::BTreeSet;

use crate::graph::{Entity, EntityKey, GraphFragment, Properties, PropertyValue, Provenance, Relationship};
use crate::normalizer::EntityNormalizer;
use crate::provider::{RawExtraction, RawNodeRef};
use crate::schema::GraphSchema;

/// Something the gate refused to let through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rejection {
    NodeType { id: String, proposed: String },
    RelationshipType { proposed: String },
    Endpoint { relationship: String, id: String, proposed: String },
    EmptyId { proposed_type: String },
    Property { owner: String, key: String },
}

#[derive(Debug, Clone, Default)]
pub struct Conformed {
    pub fragment: GraphFragment,
    pub rejections: Vec<Rejection>,
}

pub fn conform(
    schema: &GraphSchema,
    normalizer: &EntityNormalizer,
    raw: RawExtraction,
    provenance: &Provenance,
) -> Conformed {
    let mut out = Conformed::default();
    let mut seen: BTreeSet<EntityKey> = BTreeSet::new();

    for node in raw.nodes {
        let Some(entity_type) = schema.canonical_node_type(&node.node_type) else {
            out.rejections.push(Rejection::NodeType {
                id: node.id,
                proposed: node.node_type,
            });
            continue;
        };

        let Some(mut entity) = make_entity(normalizer, entity_type, &node.id, provenance) else {
            out.rejections.push(Rejection::EmptyId {
                proposed_type: node.node_type,
            });
            continue;
        };

        if schema.captures_node_properties() {
            let owner = entity.entity_key().to_string();
            entity.properties = convert_properties(normalizer, &node.properties, &owner, &mut out.rejections);
        }

        seen.insert(entity.entity_key());
        out.fragment.entities.push(entity);
    }

    for rel in raw.relationships {
        let Some(rel_type) = schema.canonical_relationship_type(&rel.rel_type) else {
            out.rejections.push(Rejection::RelationshipType { proposed: rel.rel_type });
            continue;
        };

        let source = endpoint(schema, normalizer, &rel.source, rel_type, provenance, &mut out.rejections);
        let target = endpoint(schema, normalizer, &rel.target, rel_type, provenance, &mut out.rejections);
        let (Some(source), Some(target)) = (source, target) else {
            continue;
        };

        let properties = if schema.captures_relationship_properties() {
            let owner = format!("{}-[{}]->{}", source.entity_key(), rel_type, target.entity_key());
            convert_properties(normalizer, &rel.properties, &owner, &mut out.rejections)
        } else {
            Properties::new()
        };

        let relationship = Relationship {
            rel_type: rel_type.to_string(),
            source: source.entity_key(),
            target: target.entity_key(),
            properties,
        };

        // Endpoints mentioned only inside a relationship still become nodes.
        for endpoint in [source, target] {
            if seen.insert(endpoint.entity_key()) {
                out.fragment.entities.push(endpoint);
            }
        }
        out.fragment.relationships.push(relationship);
    }

    out
}

fn make_entity(
    normalizer: &EntityNormalizer,
    entity_type: &str,
    raw_id: &str,
    provenance: &Provenance,
) -> Option<Entity> {
    let key = normalizer.normalize(raw_id);
    if key.is_empty() {
        return None;
    }
    Some(Entity {
        entity_type: entity_type.to_string(),
        id: normalizer.display_id(raw_id),
        key,
        properties: Properties::new(),
        provenance: provenance.clone(),
    })
}

fn endpoint(
    schema: &GraphSchema,
    normalizer: &EntityNormalizer,
    node: &RawNodeRef,
    rel_type: &str,
    provenance: &Provenance,
    rejections: &mut Vec<Rejection>,
) -> Option<Entity> {
    let Some(entity_type) = schema.canonical_node_type(&node.node_type) else {
        rejections.push(Rejection::Endpoint {
            relationship: rel_type.to_string(),
            id: node.id.clone(),
            proposed: node.node_type.clone(),
        });
        return None;
    };

    let entity = make_entity(normalizer, entity_type, &node.id, provenance);
    if entity.is_none() {
        rejections.push(Rejection::EmptyId {
            proposed_type: node.node_type.clone(),
        });
    }
    entity
}

/// Accepts `{"k": v}` objects and LangChain-style `[{"key": k, "value": v}]` lists.
fn convert_properties(
    normalizer: &EntityNormalizer,
    raw: &serde_json::Value,
    owner: &str,
    rejections: &mut Vec<Rejection>,
) -> Properties {
    let pairs: Vec<(String, &serde_json::Value)> = match raw {
        serde_json::Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v)).collect(),
        serde_json::Value::Array(items) => items
            .iter()
            .filter_map(|item| {
                let key = item.get("key")?.as_str()?;
                Some((key.to_string(), item.get("value")?))
            })
            .collect(),
        _ => Vec::new(),
    };

    let mut properties = Properties::new();
    for (raw_key, raw_value) in pairs {
        match (normalizer.property_key(&raw_key), PropertyValue::from_json(raw_value)) {
            (Some(key), Some(value)) => {
                properties.insert(key, value);
            }
            _ => rejections.push(Rejection::Property {
                owner: owner.to_string(),
                key: raw_key,
            }),
        }
    }
    properties
}
