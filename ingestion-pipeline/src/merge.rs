use std::collections::HashMap;
use std::sync::Arc;

use common::ontology::Ontology;
use serde_json::json;

use crate::extraction::ExtractionResult;

/// An entity after cross-chunk deduplication, ready for the graph MERGE.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedEntity {
    pub name: String,
    pub entity_type: String,
    pub description: String,
    pub mentions: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergedRelation {
    pub from: String,
    pub to: String,
    pub relation_type: String,
    pub description: String,
}

/// Accumulates per-chunk extraction results across a document. Also serves
/// as the cumulative context for later chunks, serialised under a character
/// budget with lowest-mention entries evicted first.
pub struct ExtractionAccumulator {
    ontology: Arc<Ontology>,
    context_budget: usize,
    entities: Vec<MergedEntity>,
    entity_index: HashMap<(String, String), usize>,
    relations: Vec<MergedRelation>,
    relation_index: HashMap<(String, String, String), usize>,
}

fn name_key(name: &str) -> String {
    name.trim().to_lowercase()
}

/// Union of description segments, joined `" | "`, deduplicated by equality.
fn union_description(existing: &mut String, incoming: &str) {
    let incoming = incoming.trim();
    if incoming.is_empty() {
        return;
    }
    if existing.split(" | ").any(|segment| segment == incoming) {
        return;
    }
    if existing.is_empty() {
        existing.push_str(incoming);
    } else {
        existing.push_str(" | ");
        existing.push_str(incoming);
    }
}

impl ExtractionAccumulator {
    pub fn new(ontology: Arc<Ontology>, context_budget: usize) -> Self {
        Self {
            ontology,
            context_budget,
            entities: Vec::new(),
            entity_index: HashMap::new(),
            relations: Vec::new(),
            relation_index: HashMap::new(),
        }
    }

    /// Folds one chunk's extraction into the running state. Entity types are
    /// normalised against the ontology at this point, unknown ones coerce to
    /// `Other`; relation types are kept verbatim when undeclared.
    pub fn absorb(&mut self, result: ExtractionResult) {
        for entity in result.entities {
            let name = entity.name.trim();
            if name.is_empty() {
                continue;
            }
            let entity_type = self.ontology.normalise_entity_type(&entity.entity_type);
            let key = (name_key(name), entity_type.to_lowercase());

            match self.entity_index.get(&key) {
                Some(&index) => {
                    let merged = &mut self.entities[index];
                    merged.mentions += 1;
                    union_description(&mut merged.description, &entity.description);
                }
                None => {
                    self.entity_index.insert(key, self.entities.len());
                    self.entities.push(MergedEntity {
                        name: name.to_string(),
                        entity_type,
                        description: entity.description.trim().to_string(),
                        mentions: 1,
                    });
                }
            }
        }

        for relation in result.relations {
            let from = relation.from.trim();
            let to = relation.to.trim();
            if from.is_empty() || to.is_empty() {
                continue;
            }
            let relation_type = self.ontology.normalise_relation_type(&relation.relation_type);
            let key = (
                name_key(from),
                name_key(to),
                relation_type.to_lowercase(),
            );

            match self.relation_index.get(&key) {
                Some(&index) => {
                    union_description(&mut self.relations[index].description, &relation.description);
                }
                None => {
                    self.relation_index.insert(key, self.relations.len());
                    self.relations.push(MergedRelation {
                        from: from.to_string(),
                        to: to.to_string(),
                        relation_type,
                        description: relation.description.trim().to_string(),
                    });
                }
            }
        }
    }

    pub fn entities(&self) -> &[MergedEntity] {
        &self.entities
    }

    pub fn relations(&self) -> &[MergedRelation] {
        &self.relations
    }

    pub fn counts(&self) -> (usize, usize) {
        (self.entities.len(), self.relations.len())
    }

    /// Compact JSON of what has been extracted so far, for the next chunk's
    /// prompt. Entities enter by descending mention count until ~70% of the
    /// budget, relations between retained entities fill the rest; the output
    /// is deterministic for a given state.
    pub fn context_json(&self) -> String {
        let mut ordered: Vec<&MergedEntity> = self.entities.iter().collect();
        ordered.sort_by(|a, b| b.mentions.cmp(&a.mentions).then(a.name.cmp(&b.name)));

        let entity_budget = self.context_budget.saturating_mul(7) / 10;
        let mut spent = 0usize;
        let mut kept = Vec::new();
        let mut kept_names: Vec<String> = Vec::new();
        for entity in ordered {
            let entry = json!({
                "name": entity.name,
                "type": entity.entity_type,
                "mentions": entity.mentions,
            });
            let cost = entry.to_string().len() + 1;
            if spent + cost > entity_budget {
                break;
            }
            spent += cost;
            kept_names.push(name_key(&entity.name));
            kept.push(entry);
        }

        let mut relation_entries = Vec::new();
        for relation in &self.relations {
            if !kept_names.contains(&name_key(&relation.from))
                || !kept_names.contains(&name_key(&relation.to))
            {
                continue;
            }
            let entry = json!({
                "from": relation.from,
                "to": relation.to,
                "type": relation.relation_type,
            });
            let cost = entry.to_string().len() + 1;
            if spent + cost > self.context_budget {
                break;
            }
            spent += cost;
            relation_entries.push(entry);
        }

        json!({ "entities": kept, "relations": relation_entries }).to_string()
    }
}
