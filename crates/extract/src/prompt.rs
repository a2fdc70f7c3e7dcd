use crate::schema::GraphSchema;

pub fn build_extraction_prompt(chunk_text: &str, schema: &GraphSchema) -> String {
    let node_types = schema.node_types().collect::<Vec<_>>().join(", ");
    let relationship_types = schema.relationship_types().collect::<Vec<_>>().join(", ");

    let property_rules = match (
        schema.captures_node_properties(),
        schema.captures_relationship_properties(),
    ) {
        (true, true) => {
            "- Attach quantitative details as properties: dosages, dates, test values, units, frequencies\n\
             - Relationship properties may carry a date or confidence when the text states one"
        }
        (true, false) => {
            "- Attach quantitative details to nodes as properties: dosages, dates, test values\n\
             - Leave relationship properties empty"
        }
        (false, true) => {
            "- Leave node properties empty\n\
             - Relationship properties may carry a date or confidence when the text states one"
        }
        (false, false) => "- Leave all properties empty",
    };

    format!(
        r#"Extract a biomedical knowledge graph from the following text.

INSTRUCTIONS:
1. Identify entities and the relationships between them
2. Use ONLY these node types: {node_types}
3. Use ONLY these relationship types: {relationship_types}
4. Output ONLY valid JSON, nothing else
5. Use the exact schema below

SCHEMA:
{{
  "nodes": [
    {{"id": "Metformin", "type": "Medication", "properties": {{"dosage": "500 mg"}}}}
  ],
  "relationships": [
    {{"source": {{"id": "John", "type": "Patient"}}, "target": {{"id": "Metformin", "type": "Medication"}}, "type": "TAKES_MEDICATION", "properties": {{"date": "2023-01-10"}}}}
  ]
}}

RULES:
- Node ids are human-readable names taken from the text, never numbers or generic labels
- Refer to the same entity with the same id everywhere
- Skip anything that does not fit the allowed types
{property_rules}
- Output ONLY the JSON object, no markdown, no explanations

TEXT:
{chunk_text}

JSON OUTPUT:"#
    )
}

pub fn build_retry_prompt(invalid_json: &str) -> String {
    format!(
        r#"The following JSON is invalid:

{}

Fix this JSON. Output only valid JSON with no markdown formatting, no code blocks, no explanations. Just the raw JSON object."#,
        invalid_json
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prompt_lists_only_schema_types() {
        let schema = GraphSchema::new(["Patient", "Disease"], ["HAS_DISEASE"]).unwrap();
        let prompt = build_extraction_prompt("Patient John has Diabetes.", &schema);

        assert!(prompt.contains("node types: Disease, Patient"));
        assert!(prompt.contains("relationship types: HAS_DISEASE"));
        assert!(prompt.contains("Patient John has Diabetes."));
        assert!(!prompt.contains("ClinicalTrial"));
    }

    #[test]
    fn prompt_follows_property_policy() {
        let schema = GraphSchema::biomedical().with_property_capture(false, false);
        let prompt = build_extraction_prompt("text", &schema);
        assert!(prompt.contains("Leave all properties empty"));
    }
}
