use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

/// Scalar property value carried by nodes and edges.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PropertyValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
}

impl PropertyValue {
    /// Scalars only; null, arrays and objects have no property form.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::Bool(b) => Some(Self::Bool(*b)),
            serde_json::Value::Number(n) => n
                .as_i64()
                .map(Self::Integer)
                .or_else(|| n.as_f64().map(Self::Float)),
            serde_json::Value::String(s) if !s.trim().is_empty() => Some(Self::Text(s.trim().to_string())),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Self::Bool(b) => serde_json::Value::Bool(*b),
            Self::Integer(i) => serde_json::Value::from(*i),
            Self::Float(f) => serde_json::Number::from_f64(*f)
                .map(serde_json::Value::Number)
                .unwrap_or(serde_json::Value::Null),
            Self::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

impl fmt::Display for PropertyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(x) => write!(f, "{x}"),
            Self::Text(s) => f.write_str(s),
        }
    }
}

pub type Properties = BTreeMap<String, PropertyValue>;

/// Natural key of an entity: its type plus normalized id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityKey {
    pub entity_type: String,
    pub key: String,
}

impl EntityKey {
    pub fn new(entity_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            key: key.into(),
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.key)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Provenance {
    pub source: String,
    pub chunk_ids: BTreeSet<String>,
}

impl Provenance {
    pub fn new(source: impl Into<String>, chunk_id: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            chunk_ids: BTreeSet::from([chunk_id.into()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    #[serde(rename = "type")]
    pub entity_type: String,
    /// Surface form shown to users and matched by queries (`p.id`)
    pub id: String,
    /// Normalized id, the identity half of [`EntityKey`]
    pub key: String,
    pub properties: Properties,
    pub provenance: Provenance,
}

impl Entity {
    pub fn entity_key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.key)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    #[serde(rename = "type")]
    pub rel_type: String,
    pub source: EntityKey,
    pub target: EntityKey,
    pub properties: Properties,
}

pub type Triple = (EntityKey, String, EntityKey);

impl Relationship {
    pub fn triple(&self) -> Triple {
        (self.source.clone(), self.rel_type.clone(), self.target.clone())
    }
}

/// Schema-conformant output for one chunk. Every relationship endpoint is
/// also listed in `entities`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GraphFragment {
    pub entities: Vec<Entity>,
    pub relationships: Vec<Relationship>,
}

impl GraphFragment {
    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }
}

/// Accumulates fragments for one ingestion run before they are written.
///
/// Entities merge on [`EntityKey`]; the first surface id is kept, property
/// conflicts resolve last-write-wins and provenance accumulates.
/// Relationships collapse on (type, source, target).
#[derive(Debug, Clone, Default)]
pub struct StagedGraph {
    entities: BTreeMap<EntityKey, Entity>,
    relationships: BTreeMap<Triple, Relationship>,
}

impl StagedGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn merge(&mut self, fragment: GraphFragment) {
        for entity in fragment.entities {
            match self.entities.get_mut(&entity.entity_key()) {
                Some(existing) => {
                    existing.properties.extend(entity.properties);
                    existing.provenance.chunk_ids.extend(entity.provenance.chunk_ids);
                }
                None => {
                    self.entities.insert(entity.entity_key(), entity);
                }
            }
        }

        for relationship in fragment.relationships {
            match self.relationships.get_mut(&relationship.triple()) {
                Some(existing) => existing.properties.extend(relationship.properties),
                None => {
                    self.relationships.insert(relationship.triple(), relationship);
                }
            }
        }
    }

    pub fn entities(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    pub fn relationships(&self) -> impl Iterator<Item = &Relationship> {
        self.relationships.values()
    }

    pub fn entity(&self, key: &EntityKey) -> Option<&Entity> {
        self.entities.get(key)
    }

    pub fn entities_of_type<'a>(&'a self, entity_type: &'a str) -> impl Iterator<Item = &'a Entity> + 'a {
        self.entities.values().filter(move |e| e.entity_type == entity_type)
    }

    pub fn entity_count(&self) -> usize {
        self.entities.len()
    }

    pub fn relationship_count(&self) -> usize {
        self.relationships.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}
