use std::collections::HashSet;

use crate::storage::types::relation::Relation;
use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::deterministic_id},
    stored_object,
};

stored_object!(Entity, "entity", {
    memory_id: String,
    name: String,
    entity_type: String,
    description: String,
    mentions: u64,
    source_docs: Vec<String>
});

/// Separator between per-document description segments.
const DESCRIPTION_SEPARATOR: &str = " | ";

/// An entity with its immediate surroundings, as returned by search and
/// context lookups.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct EntityContext {
    pub entity: Entity,
    pub neighbours: Vec<Entity>,
    pub relations: Vec<Relation>,
}

/// Appends `incoming` to a `" | "`-joined description unless one of the
/// stored segments already covers it by substring equality.
pub fn merge_description(existing: &str, incoming: &str) -> String {
    let incoming = incoming.trim();
    if incoming.is_empty() {
        return existing.to_string();
    }
    if existing.is_empty() {
        return incoming.to_string();
    }
    if existing.contains(incoming) {
        return existing.to_string();
    }

    format!("{existing}{DESCRIPTION_SEPARATOR}{incoming}")
}

impl Entity {
    /// Merge key: `(memory_id, name, type)`, case-insensitive on name and
    /// type. The stored name keeps the casing of its first appearance.
    pub fn id_for(memory_id: &str, name: &str, entity_type: &str) -> String {
        deterministic_id(&[
            memory_id,
            &name.to_lowercase(),
            &entity_type.to_lowercase(),
        ])
    }

    /// MERGEs an extracted occurrence into the graph: first occurrence
    /// creates the node, later ones accumulate mentions, description
    /// segments and source documents. The flag reports whether the node was
    /// created rather than merged.
    pub async fn merge_into(
        db: &SurrealDbClient,
        memory_id: &str,
        name: &str,
        entity_type: &str,
        description: &str,
        mentions: u64,
        source_doc: &str,
    ) -> Result<(Entity, bool), AppError> {
        let id = Self::id_for(memory_id, name, entity_type);
        let now = Utc::now();

        let (merged, created) = match db.get_item::<Entity>(&id).await? {
            Some(existing) => {
                let mut source_docs = existing.source_docs;
                if !source_docs.iter().any(|d| d == source_doc) {
                    source_docs.push(source_doc.to_string());
                }
                (
                    Entity {
                        id: id.clone(),
                        created_at: existing.created_at,
                        updated_at: now,
                        memory_id: existing.memory_id,
                        name: existing.name,
                        entity_type: existing.entity_type,
                        description: merge_description(&existing.description, description),
                        mentions: existing.mentions + mentions,
                        source_docs,
                    },
                    false,
                )
            }
            None => (
                Entity {
                    id: id.clone(),
                    created_at: now,
                    updated_at: now,
                    memory_id: memory_id.to_string(),
                    name: name.to_string(),
                    entity_type: entity_type.to_string(),
                    description: description.trim().to_string(),
                    mentions,
                    source_docs: vec![source_doc.to_string()],
                },
                true,
            ),
        };

        db.client
            .query("UPSERT type::thing('entity', $id) CONTENT $entity")
            .bind(("id", id))
            .bind(("entity", merged.clone()))
            .await?
            .check()?;

        Ok((merged, created))
    }

    pub async fn list_by_memory(
        db: &SurrealDbClient,
        memory_id: &str,
    ) -> Result<Vec<Entity>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM entity WHERE memory_id = $memory_id")
            .bind(("memory_id", memory_id.to_owned()))
            .await?;
        let mut entities: Vec<Entity> = response.take(0)?;
        entities.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entities)
    }

    pub async fn find_by_name(
        db: &SurrealDbClient,
        memory_id: &str,
        name: &str,
    ) -> Result<Option<Entity>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM entity \
                 WHERE memory_id = $memory_id AND string::lowercase(name) = string::lowercase($name) \
                 LIMIT 1",
            )
            .bind(("memory_id", memory_id.to_owned()))
            .bind(("name", name.to_owned()))
            .await?;
        let entities: Vec<Entity> = response.take(0)?;
        Ok(entities.into_iter().next())
    }

    pub async fn get_many(
        db: &SurrealDbClient,
        ids: &[String],
    ) -> Result<Vec<Entity>, AppError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let things: Vec<Thing> = ids
            .iter()
            .map(|id| Thing::from(("entity", id.as_str())))
            .collect();
        let mut response = db
            .client
            .query("SELECT * FROM entity WHERE id IN $things")
            .bind(("things", things))
            .await?;
        Ok(response.take(0)?)
    }

    /// The entity plus its 1-hop neighbourhood and incident relations.
    pub async fn context(
        db: &SurrealDbClient,
        memory_id: &str,
        entity: Entity,
    ) -> Result<EntityContext, AppError> {
        let relations = Relation::incident_to(db, memory_id, &entity.id).await?;

        let neighbour_ids: Vec<String> = relations
            .iter()
            .flat_map(|r| [r.in_.clone(), r.out.clone()])
            .filter(|id| id != &entity.id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let mut neighbours = Entity::get_many(db, &neighbour_ids).await?;
        neighbours.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(EntityContext {
            entity,
            neighbours,
            relations,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = &Uuid::new_v4().to_string();
        SurrealDbClient::memory("test_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    #[test]
    fn description_merge_dedups_by_substring() {
        assert_eq!(merge_description("", "a company"), "a company");
        assert_eq!(
            merge_description("a French cloud company", "cloud company"),
            "a French cloud company"
        );
        assert_eq!(
            merge_description("a company", "signs contracts"),
            "a company | signs contracts"
        );
    }

    #[tokio::test]
    async fn merge_accumulates_mentions_and_sources() {
        let db = setup_db().await;

        let (first, created) = Entity::merge_into(
            &db,
            "m1",
            "Cloud Temple",
            "Organization",
            "a cloud provider",
            2,
            "doc1",
        )
        .await
        .expect("first merge");
        assert!(created);
        assert_eq!(first.mentions, 2);
        assert_eq!(first.source_docs, vec!["doc1".to_string()]);

        let (second, created) = Entity::merge_into(
            &db,
            "m1",
            "cloud temple",
            "organization",
            "signs contracts",
            1,
            "doc2",
        )
        .await
        .expect("second merge");

        assert!(!created);
        assert_eq!(second.id, first.id);
        assert_eq!(second.mentions, 3);
        // Name keeps the casing of the first appearance.
        assert_eq!(second.name, "Cloud Temple");
        assert_eq!(second.description, "a cloud provider | signs contracts");
        assert_eq!(
            second.source_docs,
            vec!["doc1".to_string(), "doc2".to_string()]
        );

        let all = Entity::list_by_memory(&db, "m1").await.expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn merge_key_distinguishes_type_and_memory() {
        let db = setup_db().await;

        Entity::merge_into(&db, "m1", "Mercury", "Planet", "", 1, "d1")
            .await
            .expect("planet");
        Entity::merge_into(&db, "m1", "Mercury", "Element", "", 1, "d1")
            .await
            .expect("element");
        Entity::merge_into(&db, "m2", "Mercury", "Planet", "", 1, "d9")
            .await
            .expect("other memory");

        assert_eq!(Entity::list_by_memory(&db, "m1").await.expect("m1").len(), 2);
        assert_eq!(Entity::list_by_memory(&db, "m2").await.expect("m2").len(), 1);
    }

    #[tokio::test]
    async fn find_by_name_is_case_insensitive() {
        let db = setup_db().await;
        Entity::merge_into(&db, "m1", "Réversibilité", "Concept", "", 1, "d1")
            .await
            .expect("merge");

        let found = Entity::find_by_name(&db, "m1", "réversibilité")
            .await
            .expect("find");
        assert!(found.is_some());

        let missing = Entity::find_by_name(&db, "m2", "Réversibilité")
            .await
            .expect("find other memory");
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn context_includes_neighbours_and_relations() {
        let db = setup_db().await;
        let (a, _) = Entity::merge_into(&db, "m1", "A", "Organization", "", 1, "d1")
            .await
            .expect("a");
        let (b, _) = Entity::merge_into(&db, "m1", "B", "Organization", "", 1, "d1")
            .await
            .expect("b");

        Relation::new(
            a.id.clone(),
            b.id.clone(),
            "m1".into(),
            "PARTY_TO".into(),
            String::new(),
            "d1".into(),
        )
        .merge(&db)
        .await
        .expect("relation");

        let context = Entity::context(&db, "m1", a.clone()).await.expect("context");
        assert_eq!(context.entity.id, a.id);
        assert_eq!(context.neighbours.len(), 1);
        assert_eq!(context.neighbours[0].id, b.id);
        assert_eq!(context.relations.len(), 1);
    }
}
