use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::AppError;

/// Fallback type for entities whose extracted type is not declared by the
/// active ontology.
pub const OTHER_ENTITY_TYPE: &str = "Other";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TypeDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub examples: Vec<String>,
}

/// An extraction schema: permitted entity/relation types plus extraction
/// rules. Immutable once loaded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ontology {
    pub name: String,
    #[serde(default)]
    pub entity_types: Vec<TypeDef>,
    #[serde(default)]
    pub relation_types: Vec<TypeDef>,
    #[serde(default)]
    pub priority_entities: Vec<String>,
    #[serde(default)]
    pub priority_relations: Vec<String>,
    #[serde(default)]
    pub instructions: String,
    #[serde(default = "default_max_entities")]
    pub max_entities: usize,
    #[serde(default = "default_max_relations")]
    pub max_relations: usize,
}

fn default_max_entities() -> usize {
    50
}

fn default_max_relations() -> usize {
    80
}

impl Ontology {
    /// Maps a raw extracted entity type onto a declared type name, matching
    /// case-insensitively. Unknown types coerce to [`OTHER_ENTITY_TYPE`].
    pub fn normalise_entity_type(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        self.entity_types
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(trimmed))
            .map(|t| t.name.clone())
            .unwrap_or_else(|| OTHER_ENTITY_TYPE.to_string())
    }

    /// Relation types outside the ontology are kept verbatim; declared ones
    /// get the declared casing.
    pub fn normalise_relation_type(&self, raw: &str) -> String {
        let trimmed = raw.trim();
        self.relation_types
            .iter()
            .find(|t| t.name.eq_ignore_ascii_case(trimmed))
            .map(|t| t.name.clone())
            .unwrap_or_else(|| trimmed.to_string())
    }
}

/// Registry of all ontologies loaded at startup. Read-only afterwards.
#[derive(Clone, Default)]
pub struct OntologyRegistry {
    ontologies: HashMap<String, Arc<Ontology>>,
}

impl OntologyRegistry {
    /// Loads every `*.json` ontology document in `dir`. A missing directory
    /// or a malformed document fails startup with the offending path in the
    /// message.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self, AppError> {
        let dir = dir.as_ref();
        let entries = std::fs::read_dir(dir).map_err(|e| {
            AppError::InvalidArgument(format!(
                "ontology directory {} is not readable: {e}",
                dir.display()
            ))
        })?;

        let mut ontologies = HashMap::new();
        for entry in entries {
            let path = entry
                .map_err(|e| AppError::Internal(format!("reading ontology directory: {e}")))?
                .path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let raw = std::fs::read_to_string(&path).map_err(|e| {
                AppError::InvalidArgument(format!("ontology {} unreadable: {e}", path.display()))
            })?;
            let mut ontology: Ontology = serde_json::from_str(&raw).map_err(|e| {
                AppError::InvalidArgument(format!("ontology {} malformed: {e}", path.display()))
            })?;

            if ontology.name.is_empty() {
                ontology.name = path
                    .file_stem()
                    .and_then(|s| s.to_str())
                    .unwrap_or_default()
                    .to_string();
            }
            if ontology.name.is_empty() {
                return Err(AppError::InvalidArgument(format!(
                    "ontology {} has no usable name",
                    path.display()
                )));
            }

            info!(
                ontology = %ontology.name,
                entity_types = ontology.entity_types.len(),
                relation_types = ontology.relation_types.len(),
                "loaded ontology"
            );
            ontologies.insert(ontology.name.clone(), Arc::new(ontology));
        }

        Ok(Self { ontologies })
    }

    pub fn from_ontologies(list: Vec<Ontology>) -> Self {
        let ontologies = list
            .into_iter()
            .map(|o| (o.name.clone(), Arc::new(o)))
            .collect();
        Self { ontologies }
    }

    pub fn get(&self, name: &str) -> Option<Arc<Ontology>> {
        self.ontologies.get(name).cloned()
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.ontologies.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn summaries(&self) -> Vec<serde_json::Value> {
        self.names()
            .into_iter()
            .filter_map(|name| self.get(&name))
            .map(|o| {
                serde_json::json!({
                    "name": o.name,
                    "entity_types": o.entity_types.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
                    "relation_types": o.relation_types.iter().map(|t| t.name.clone()).collect::<Vec<_>>(),
                })
            })
            .collect()
    }
}
