//! Pattern matching and projection over a [`MemoryGraph`].

use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};

use super::cypher::{AggregateFn, CompareOp, CypherError, Direction, Expr, NodePattern, Query, RelPattern};
use super::MemoryGraph;
use crate::store::{Row, INTERNAL_PROPERTIES};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Node(usize),
    Edge(usize),
}

type Binding = BTreeMap<String, Bound>;

pub fn run(graph: &MemoryGraph, query: &Query) -> Result<Vec<Row>, CypherError> {
    let mut bindings = Vec::new();
    for index in 0..graph.nodes.len() {
        if !node_matches(graph, index, &query.pattern.start) {
            continue;
        }
        let mut binding = Binding::new();
        if let Some(var) = &query.pattern.start.var {
            binding.insert(var.clone(), Bound::Node(index));
        }
        extend(graph, &query.pattern.hops, index, binding, &mut Vec::new(), &mut bindings);
    }

    if let Some(filter) = &query.filter {
        let mut kept = Vec::with_capacity(bindings.len());
        for binding in bindings {
            if eval(graph, &binding, filter)? == Value::Bool(true) {
                kept.push(binding);
            }
        }
        bindings = kept;
    }

    let mut rows = if query.items.iter().any(|item| item.expr.is_aggregate()) {
        aggregate(graph, query, bindings)?
    } else {
        let mut rows = Vec::with_capacity(bindings.len());
        for binding in bindings {
            let values = query
                .items
                .iter()
                .map(|item| eval(graph, &binding, &item.expr))
                .collect::<Result<Vec<_>, _>>()?;
            rows.push((values, binding));
        }
        rows
    };

    if query.distinct {
        let mut seen = BTreeSet::new();
        rows.retain(|(values, _)| seen.insert(Value::Array(values.clone()).to_string()));
    }

    if !query.order_by.is_empty() {
        rows = order(graph, query, rows)?;
    }

    let skip = query.skip.unwrap_or(0);
    let limit = query.limit.unwrap_or(usize::MAX);

    Ok(rows
        .into_iter()
        .skip(skip)
        .take(limit)
        .map(|(values, _)| {
            query
                .items
                .iter()
                .map(|item| item.column.clone())
                .zip(values)
                .collect::<Row>()
        })
        .collect())
}

fn node_matches(graph: &MemoryGraph, index: usize, pattern: &NodePattern) -> bool {
    let node = &graph.nodes[index];
    pattern.labels.iter().all(|label| *label == node.label)
        && properties_match(&node.properties, &pattern.properties)
}

fn properties_match(properties: &Map<String, Value>, wanted: &[(String, Value)]) -> bool {
    wanted
        .iter()
        .all(|(key, value)| properties.get(key).is_some_and(|actual| values_equal(actual, value)))
}

fn edge_candidates(graph: &MemoryGraph, edge_index: usize, rel: &RelPattern, current: usize) -> Vec<usize> {
    let edge = &graph.edges[edge_index];
    if !rel.types.is_empty() && !rel.types.contains(&edge.rel_type) {
        return Vec::new();
    }
    if !properties_match(&edge.properties, &rel.properties) {
        return Vec::new();
    }

    let mut others = Vec::new();
    if matches!(rel.direction, Direction::Outgoing | Direction::Either) && edge.source == current {
        others.push(edge.target);
    }
    if matches!(rel.direction, Direction::Incoming | Direction::Either)
        && edge.target == current
        && !others.contains(&edge.source)
    {
        others.push(edge.source);
    }
    others
}

/// Depth-first expansion of the remaining hops. A relationship is used at
/// most once per path.
fn extend(
    graph: &MemoryGraph,
    hops: &[(RelPattern, NodePattern)],
    current: usize,
    binding: Binding,
    used: &mut Vec<usize>,
    out: &mut Vec<Binding>,
) {
    let Some(((rel, next), rest)) = hops.split_first() else {
        out.push(binding);
        return;
    };

    for edge_index in 0..graph.edges.len() {
        if used.contains(&edge_index) {
            continue;
        }
        for other in edge_candidates(graph, edge_index, rel, current) {
            if !node_matches(graph, other, next) {
                continue;
            }

            let mut extended = binding.clone();
            if let Some(var) = &next.var {
                match extended.get(var) {
                    Some(Bound::Node(bound)) if *bound != other => continue,
                    Some(Bound::Edge(_)) => continue,
                    _ => {
                        extended.insert(var.clone(), Bound::Node(other));
                    }
                }
            }
            if let Some(var) = &rel.var {
                extended.insert(var.clone(), Bound::Edge(edge_index));
            }

            used.push(edge_index);
            extend(graph, rest, other, extended, used, out);
            used.pop();
        }
    }
}

type ProjectedRow = (Vec<Value>, Binding);

fn aggregate(graph: &MemoryGraph, query: &Query, bindings: Vec<Binding>) -> Result<Vec<ProjectedRow>, CypherError> {
    struct Group {
        keys: Vec<Value>,
        binding: Binding,
        inputs: Vec<Vec<Value>>,
    }

    let aggregate_slots: Vec<usize> = query
        .items
        .iter()
        .enumerate()
        .filter(|(_, item)| item.expr.is_aggregate())
        .map(|(i, _)| i)
        .collect();

    let mut groups: Vec<Group> = Vec::new();
    let mut positions: BTreeMap<String, usize> = BTreeMap::new();

    for binding in bindings {
        let mut keys = Vec::new();
        for item in query.items.iter().filter(|item| !item.expr.is_aggregate()) {
            keys.push(eval(graph, &binding, &item.expr)?);
        }

        let mut inputs = Vec::with_capacity(aggregate_slots.len());
        for &slot in &aggregate_slots {
            let value = match &query.items[slot].expr {
                Expr::Aggregate { arg: Some(arg), .. } => eval(graph, &binding, arg)?,
                _ => Value::Bool(true),
            };
            inputs.push(value);
        }

        let group_key = Value::Array(keys.clone()).to_string();
        let position = match positions.get(&group_key) {
            Some(&position) => position,
            None => {
                positions.insert(group_key, groups.len());
                groups.push(Group {
                    keys,
                    binding,
                    inputs: vec![Vec::new(); aggregate_slots.len()],
                });
                groups.len() - 1
            }
        };
        for (slot_inputs, value) in groups[position].inputs.iter_mut().zip(inputs) {
            slot_inputs.push(value);
        }
    }

    // Aggregating nothing still yields one row when there is no grouping key.
    if groups.is_empty() && aggregate_slots.len() == query.items.len() {
        groups.push(Group {
            keys: Vec::new(),
            binding: Binding::new(),
            inputs: vec![Vec::new(); aggregate_slots.len()],
        });
    }

    let rows = groups
        .into_iter()
        .map(|group| {
            let mut keys = group.keys.into_iter();
            let mut inputs = group.inputs.into_iter();
            let values = query
                .items
                .iter()
                .map(|item| match &item.expr {
                    Expr::Aggregate { func, distinct, .. } => {
                        finish_aggregate(*func, *distinct, inputs.next().unwrap_or_default())
                    }
                    _ => keys.next().unwrap_or(Value::Null),
                })
                .collect();
            (values, group.binding)
        })
        .collect();
    Ok(rows)
}

fn finish_aggregate(func: AggregateFn, distinct: bool, inputs: Vec<Value>) -> Value {
    let mut values: Vec<Value> = inputs.into_iter().filter(|v| !v.is_null()).collect();
    if distinct {
        let mut seen = BTreeSet::new();
        values.retain(|v| seen.insert(v.to_string()));
    }
    match func {
        AggregateFn::Count => Value::from(values.len()),
        AggregateFn::Collect => Value::Array(values),
    }
}

fn order(graph: &MemoryGraph, query: &Query, rows: Vec<ProjectedRow>) -> Result<Vec<ProjectedRow>, CypherError> {
    let mut keyed = Vec::with_capacity(rows.len());
    for (values, binding) in rows {
        let mut keys = Vec::with_capacity(query.order_by.len());
        for item in &query.order_by {
            let text = match &item.expr {
                Expr::Variable(v) => v.clone(),
                other => other.to_string(),
            };
            let key = match query.items.iter().position(|i| i.column == text) {
                Some(column) => values[column].clone(),
                None => eval(graph, &binding, &item.expr)?,
            };
            keys.push(key);
        }
        keyed.push((keys, (values, binding)));
    }

    keyed.sort_by(|(a, _), (b, _)| {
        for ((x, y), item) in a.iter().zip(b).zip(&query.order_by) {
            let ordering = total_order(x, y);
            let ordering = if item.descending { ordering.reverse() } else { ordering };
            if ordering != Ordering::Equal {
                return ordering;
            }
        }
        Ordering::Equal
    });

    Ok(keyed.into_iter().map(|(_, row)| row).collect())
}

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Object(_) => 0,
        Value::Array(_) => 1,
        Value::String(_) => 2,
        Value::Bool(_) => 3,
        Value::Number(_) => 4,
        Value::Null => 5,
    }
}

/// Ascending sort order; nulls sort last.
fn total_order(a: &Value, b: &Value) -> Ordering {
    compare_values(a, b).unwrap_or_else(|| type_rank(a).cmp(&type_rank(b)))
}

fn compare_values(a: &Value, b: &Value) -> Option<Ordering> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64()?.partial_cmp(&y.as_f64()?),
        (Value::String(x), Value::String(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => None,
    }
}

fn values_equal(a: &Value, b: &Value) -> bool {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => x.as_f64() == y.as_f64(),
        (Value::Array(x), Value::Array(y)) => {
            x.len() == y.len() && x.iter().zip(y).all(|(p, q)| values_equal(p, q))
        }
        _ => a == b,
    }
}

fn node_value(graph: &MemoryGraph, index: usize) -> Value {
    let properties = graph.nodes[index]
        .properties
        .iter()
        .filter(|(key, _)| !INTERNAL_PROPERTIES.contains(&key.as_str()))
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();
    Value::Object(properties)
}

fn lookup<'a>(binding: &'a Binding, var: &str) -> Result<&'a Bound, CypherError> {
    binding
        .get(var)
        .ok_or_else(|| CypherError::UndefinedVariable(var.to_string()))
}

fn eval(graph: &MemoryGraph, binding: &Binding, expr: &Expr) -> Result<Value, CypherError> {
    Ok(match expr {
        Expr::Literal(value) => value.clone(),
        Expr::List(items) => Value::Array(
            items
                .iter()
                .map(|item| eval(graph, binding, item))
                .collect::<Result<_, _>>()?,
        ),
        Expr::Variable(var) => match lookup(binding, var)? {
            Bound::Node(index) => node_value(graph, *index),
            Bound::Edge(index) => Value::Object(graph.edges[*index].properties.clone()),
        },
        Expr::Property(var, key) => {
            let properties = match lookup(binding, var)? {
                Bound::Node(index) => &graph.nodes[*index].properties,
                Bound::Edge(index) => &graph.edges[*index].properties,
            };
            properties.get(key).cloned().unwrap_or(Value::Null)
        }
        Expr::Call { name, args } => call(graph, binding, name, args)?,
        Expr::Aggregate { .. } => {
            return Err(CypherError::Invalid(format!("Invalid use of aggregating function {expr}")));
        }
        Expr::Not(inner) => match eval(graph, binding, inner)? {
            Value::Bool(b) => Value::Bool(!b),
            _ => Value::Null,
        },
        Expr::And(a, b) => {
            match (truth(eval(graph, binding, a)?), truth(eval(graph, binding, b)?)) {
                (Some(false), _) | (_, Some(false)) => Value::Bool(false),
                (Some(true), Some(true)) => Value::Bool(true),
                _ => Value::Null,
            }
        }
        Expr::Or(a, b) => {
            match (truth(eval(graph, binding, a)?), truth(eval(graph, binding, b)?)) {
                (Some(true), _) | (_, Some(true)) => Value::Bool(true),
                (Some(false), Some(false)) => Value::Bool(false),
                _ => Value::Null,
            }
        }
        Expr::Compare(a, op, b) => compare(*op, &eval(graph, binding, a)?, &eval(graph, binding, b)?),
        Expr::IsNull { expr, negated } => Value::Bool(eval(graph, binding, expr)?.is_null() != *negated),
    })
}

fn truth(value: Value) -> Option<bool> {
    match value {
        Value::Bool(b) => Some(b),
        _ => None,
    }
}

fn compare(op: CompareOp, left: &Value, right: &Value) -> Value {
    if left.is_null() || right.is_null() {
        return Value::Null;
    }
    let strings = match (left, right) {
        (Value::String(l), Value::String(r)) => Some((l.as_str(), r.as_str())),
        _ => None,
    };
    match op {
        CompareOp::Eq => Value::Bool(values_equal(left, right)),
        CompareOp::Neq => Value::Bool(!values_equal(left, right)),
        CompareOp::Lt | CompareOp::Gt | CompareOp::Le | CompareOp::Ge => match compare_values(left, right) {
            Some(ordering) => Value::Bool(match op {
                CompareOp::Lt => ordering == Ordering::Less,
                CompareOp::Gt => ordering == Ordering::Greater,
                CompareOp::Le => ordering != Ordering::Greater,
                _ => ordering != Ordering::Less,
            }),
            None => Value::Null,
        },
        CompareOp::Contains => strings.map_or(Value::Null, |(l, r)| Value::Bool(l.contains(r))),
        CompareOp::StartsWith => strings.map_or(Value::Null, |(l, r)| Value::Bool(l.starts_with(r))),
        CompareOp::EndsWith => strings.map_or(Value::Null, |(l, r)| Value::Bool(l.ends_with(r))),
        CompareOp::In => match right {
            Value::Array(items) => Value::Bool(items.iter().any(|item| values_equal(left, item))),
            _ => Value::Null,
        },
    }
}

fn call(graph: &MemoryGraph, binding: &Binding, name: &str, args: &[Expr]) -> Result<Value, CypherError> {
    let lowered = name.to_ascii_lowercase();
    let arity = |expected: usize| -> Result<(), CypherError> {
        if args.len() == expected {
            Ok(())
        } else {
            Err(CypherError::Invalid(format!(
                "Function {name}() expects {expected} argument(s), got {}",
                args.len()
            )))
        }
    };

    match lowered.as_str() {
        "type" | "labels" => {
            arity(1)?;
            let Expr::Variable(var) = &args[0] else {
                return Err(CypherError::TypeMismatch(format!("{name}() expects a variable")));
            };
            match (lowered.as_str(), lookup(binding, var)?) {
                ("type", Bound::Edge(index)) => Ok(Value::String(graph.edges[*index].rel_type.clone())),
                ("labels", Bound::Node(index)) => Ok(Value::Array(vec![Value::String(
                    graph.nodes[*index].label.clone(),
                )])),
                ("type", _) => Err(CypherError::TypeMismatch(format!("expected Relationship but was Node ({var})"))),
                _ => Err(CypherError::TypeMismatch(format!("expected Node but was Relationship ({var})"))),
            }
        }
        "tolower" | "toupper" => {
            arity(1)?;
            Ok(match eval(graph, binding, &args[0])? {
                Value::String(s) if lowered == "tolower" => Value::String(s.to_lowercase()),
                Value::String(s) => Value::String(s.to_uppercase()),
                Value::Null => Value::Null,
                other => return Err(CypherError::TypeMismatch(format!("expected String but was {other}"))),
            })
        }
        "tostring" => {
            arity(1)?;
            Ok(match eval(graph, binding, &args[0])? {
                Value::Null => Value::Null,
                Value::String(s) => Value::String(s),
                other => Value::String(other.to_string()),
            })
        }
        "coalesce" => {
            for arg in args {
                let value = eval(graph, binding, arg)?;
                if !value.is_null() {
                    return Ok(value);
                }
            }
            Ok(Value::Null)
        }
        _ => Err(CypherError::UnknownFunction(name.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::super::cypher::parse;
    use super::super::{StoredEdge, StoredNode};
    use super::*;
    use serde_json::json;

    fn node(label: &str, id: &str, extra: Value) -> StoredNode {
        let mut properties = Map::new();
        properties.insert("id".into(), json!(id));
        properties.insert("key".into(), json!(id.to_lowercase()));
        if let Value::Object(extra) = extra {
            properties.extend(extra);
        }
        StoredNode {
            label: label.into(),
            properties,
        }
    }

    fn edge(rel_type: &str, source: usize, target: usize) -> StoredEdge {
        StoredEdge {
            rel_type: rel_type.into(),
            source,
            target,
            properties: Map::new(),
        }
    }

    fn clinic() -> MemoryGraph {
        MemoryGraph {
            nodes: vec![
                node("Patient", "John", json!({"age": 54})),
                node("Disease", "Diabetes", json!({})),
                node("Medication", "Metformin", json!({"dosage": "500 mg"})),
                node("Medication", "Insulin", json!({})),
                node("Patient", "Mary", json!({"age": 31})),
            ],
            edges: vec![
                edge("HAS_DISEASE", 0, 1),
                edge("TAKES_MEDICATION", 0, 2),
                edge("TAKES_MEDICATION", 4, 3),
                edge("HAS_DISEASE", 4, 1),
            ],
        }
    }

    fn rows(query: &str) -> Vec<Row> {
        run(&clinic(), &parse(query).unwrap()).unwrap()
    }

    fn column(rows: &[Row], name: &str) -> Vec<Value> {
        rows.iter().map(|r| r[name].clone()).collect()
    }

    #[test]
    fn single_hop_projection() {
        let result = rows(
            "MATCH (p:Patient {id: 'John'})-[:TAKES_MEDICATION]->(m:Medication) RETURN m.id, m.dosage",
        );
        assert_eq!(result.len(), 1);
        assert_eq!(result[0]["m.id"], json!("Metformin"));
        assert_eq!(result[0]["m.dosage"], json!("500 mg"));
    }

    #[test]
    fn direction_is_respected() {
        assert!(rows("MATCH (m:Medication)-[:TAKES_MEDICATION]->(p:Patient) RETURN p.id").is_empty());
        assert_eq!(rows("MATCH (m:Medication)<-[:TAKES_MEDICATION]-(p) RETURN p.id").len(), 2);
        assert_eq!(rows("MATCH (d:Disease)--(p) RETURN p.id").len(), 2);
    }

    #[test]
    fn two_hop_traversal_uses_each_edge_once() {
        let result = rows(
            "MATCH (m:Medication)<-[:TAKES_MEDICATION]-(p:Patient)-[:HAS_DISEASE]->(d:Disease) \
             WHERE d.id = 'Diabetes' RETURN m.id ORDER BY m.id",
        );
        assert_eq!(column(&result, "m.id"), vec![json!("Insulin"), json!("Metformin")]);

        let result = rows("MATCH (a:Patient)-[:HAS_DISEASE]->(d)<-[:HAS_DISEASE]-(b:Patient) RETURN a.id, b.id");
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|r| r["a.id"] != r["b.id"]));
    }

    #[test]
    fn where_operators_and_functions() {
        let result = rows("MATCH (p:Patient) WHERE p.age > 40 AND toLower(p.id) STARTS WITH 'jo' RETURN p.id");
        assert_eq!(column(&result, "p.id"), vec![json!("John")]);

        let result = rows("MATCH (m:Medication) WHERE m.dosage IS NULL RETURN m.id");
        assert_eq!(column(&result, "m.id"), vec![json!("Insulin")]);

        let result = rows("MATCH (n) WHERE n.id IN ['Mary', 'Diabetes'] RETURN labels(n) AS l ORDER BY n.id");
        assert_eq!(column(&result, "l"), vec![json!(["Disease"]), json!(["Patient"])]);
    }

    #[test]
    fn aggregation_groups_by_remaining_columns() {
        let result = rows("MATCH (p:Patient)-[r]->(x) RETURN p.id AS patient, count(r) AS n, collect(type(r)) AS types ORDER BY patient");
        assert_eq!(column(&result, "patient"), vec![json!("John"), json!("Mary")]);
        assert_eq!(column(&result, "n"), vec![json!(2), json!(2)]);

        let empty = rows("MATCH (t:ClinicalTrial) RETURN count(t)");
        assert_eq!(empty[0]["count(t)"], json!(0));
        assert!(rows("MATCH (t:ClinicalTrial) RETURN t.id").is_empty());
    }

    #[test]
    fn distinct_order_and_limit() {
        let result = rows("MATCH (p:Patient)-[:HAS_DISEASE]->(d) RETURN DISTINCT d.id");
        assert_eq!(result.len(), 1);

        let result = rows("MATCH (n) RETURN n.id ORDER BY n.id DESC SKIP 1 LIMIT 2");
        assert_eq!(column(&result, "n.id"), vec![json!("Mary"), json!("John")]);
    }

    #[test]
    fn whole_nodes_hide_bookkeeping() {
        let result = rows("MATCH (m:Medication {id: 'Metformin'}) RETURN m");
        assert_eq!(result[0]["m"], json!({"id": "Metformin", "dosage": "500 mg"}));
    }

    #[test]
    fn runtime_type_errors_are_reported() {
        let query = parse("MATCH (p:Patient) RETURN type(p)").unwrap();
        assert!(matches!(run(&clinic(), &query), Err(CypherError::TypeMismatch(_))));

        let query = parse("MATCH (p:Patient) RETURN frobnicate(p.id)").unwrap();
        assert_eq!(
            run(&clinic(), &query).unwrap_err().to_string(),
            "Unknown function 'frobnicate'"
        );
    }
}
