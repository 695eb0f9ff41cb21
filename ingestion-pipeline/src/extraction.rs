use common::{error::AppError, ontology::Ontology};
use serde::Deserialize;
use serde_json::json;

/// One entity occurrence as returned by the extraction model.
#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExtractedEntity {
    pub name: String,
    #[serde(rename = "type")]
    pub entity_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct ExtractedRelation {
    pub from: String,
    pub to: String,
    #[serde(rename = "type")]
    pub relation_type: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
pub struct ExtractionResult {
    #[serde(default)]
    pub entities: Vec<ExtractedEntity>,
    #[serde(default)]
    pub relations: Vec<ExtractedRelation>,
}

/// Response-format schema handed to the chat API so the model is held to
/// strict JSON.
pub fn extraction_schema() -> serde_json::Value {
    json!({
        "type": "object",
        "properties": {
            "entities": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "name": { "type": "string" },
                        "type": { "type": "string" },
                        "description": { "type": "string" }
                    },
                    "required": ["name", "type", "description"],
                    "additionalProperties": false
                }
            },
            "relations": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "from": { "type": "string" },
                        "to": { "type": "string" },
                        "type": { "type": "string" },
                        "description": { "type": "string" }
                    },
                    "required": ["from", "to", "type", "description"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["entities", "relations"],
        "additionalProperties": false
    })
}

/// System prompt: the ontology rendered as extraction instructions.
pub fn build_system_prompt(ontology: &Ontology) -> String {
    let mut prompt = String::from(
        "You extract a knowledge graph from documents. Return JSON with \
         `entities` and `relations`. Use only the entity types listed below; \
         anything else must not be invented. Keep entity names exactly as \
         written in the text.\n\nEntity types:\n",
    );

    for def in &ontology.entity_types {
        prompt.push_str(&format!("- {}: {}", def.name, def.description));
        if !def.examples.is_empty() {
            prompt.push_str(&format!(" (examples: {})", def.examples.join(", ")));
        }
        prompt.push('\n');
    }

    prompt.push_str("\nRelation types:\n");
    for def in &ontology.relation_types {
        prompt.push_str(&format!("- {}: {}\n", def.name, def.description));
    }

    if !ontology.priority_entities.is_empty() {
        prompt.push_str(&format!(
            "\nPrioritise these entity types: {}.\n",
            ontology.priority_entities.join(", ")
        ));
    }
    if !ontology.priority_relations.is_empty() {
        prompt.push_str(&format!(
            "Prioritise these relation types: {}.\n",
            ontology.priority_relations.join(", ")
        ));
    }

    prompt.push_str(&format!(
        "\nExtract at most {} entities and {} relations per passage.\n",
        ontology.max_entities, ontology.max_relations
    ));

    if !ontology.instructions.is_empty() {
        prompt.push('\n');
        prompt.push_str(&ontology.instructions);
        prompt.push('\n');
    }

    prompt
}

/// User prompt: cumulative context from prior chunks plus the chunk text.
pub fn build_user_prompt(context_json: &str, chunk_text: &str) -> String {
    format!(
        "Already extracted from earlier passages of this document:\n{context_json}\n\n\
         Passage:\n{chunk_text}"
    )
}

/// Strict parse first; on failure, a single lenient retry that isolates the
/// outermost JSON object. Anything else is the caller's cue to skip the
/// chunk.
pub fn parse_extraction(content: &str) -> Result<ExtractionResult, AppError> {
    match serde_json::from_str::<ExtractionResult>(content) {
        Ok(result) => Ok(result),
        Err(strict_err) => {
            let start = content.find('{');
            let end = content.rfind('}');
            if let (Some(start), Some(end)) = (start, end) {
                if start < end {
                    if let Ok(result) =
                        serde_json::from_str::<ExtractionResult>(&content[start..=end])
                    {
                        return Ok(result);
                    }
                }
            }
            Err(AppError::llm(format!(
                "extraction response was not valid JSON: {strict_err}"
            )))
        }
    }
}

/// Slices text into extraction chunks of at most `size` characters, split on
/// char boundaries, no overlap. This pass is distinct from the retrieval
/// chunker.
pub fn slice_extraction_chunks(text: &str, size: usize) -> Vec<String> {
    let size = size.max(1);
    let chars: Vec<char> = text.chars().collect();
    if chars.is_empty() {
        return Vec::new();
    }
    chars
        .chunks(size)
        .map(|chunk| chunk.iter().collect())
        .collect()
}
