use serde::{Deserialize, Serialize};
use surrealdb::sql::Thing;

use crate::storage::types::deterministic_id;
use crate::storage::types::entity::deserialize_flexible_id;
use crate::{error::AppError, storage::db::SurrealDbClient};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct RelationMetadata {
    pub memory_id: String,
    pub relation_type: String,
    pub description: String,
    pub source_doc: String,
}

/// A typed directed edge between two entities of the same memory, stored as
/// a `relates_to` graph edge.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Relation {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    #[serde(rename = "in", deserialize_with = "deserialize_flexible_id")]
    pub in_: String,
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub out: String,
    pub metadata: RelationMetadata,
}

impl Relation {
    /// Merge key: `(memory_id, from, to, type)`.
    pub fn id_for(memory_id: &str, from_entity: &str, to_entity: &str, relation_type: &str) -> String {
        deterministic_id(&[memory_id, from_entity, to_entity, relation_type])
    }

    pub fn new(
        from_entity_id: String,
        to_entity_id: String,
        memory_id: String,
        relation_type: String,
        description: String,
        source_doc: String,
    ) -> Self {
        Self {
            id: Self::id_for(&memory_id, &from_entity_id, &to_entity_id, &relation_type),
            in_: from_entity_id,
            out: to_entity_id,
            metadata: RelationMetadata {
                memory_id,
                relation_type,
                description,
                source_doc,
            },
        }
    }

    pub async fn get(db: &SurrealDbClient, id: &str) -> Result<Option<Relation>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM type::thing('relates_to', $id)")
            .bind(("id", id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }

    /// Upserts the edge under its deterministic id. The delete-then-relate
    /// pair keeps the operation idempotent for repeated merges.
    pub async fn merge(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query(
                r#"BEGIN TRANSACTION;
                LET $in_entity = type::thing('entity', $in_id);
                LET $out_entity = type::thing('entity', $out_id);
                LET $relation = type::thing('relates_to', $rel_id);
                DELETE type::thing('relates_to', $rel_id);
                RELATE $in_entity->$relation->$out_entity SET
                    metadata.memory_id = $memory_id,
                    metadata.relation_type = $relation_type,
                    metadata.description = $description,
                    metadata.source_doc = $source_doc;
                COMMIT TRANSACTION;"#,
            )
            .bind(("rel_id", self.id.clone()))
            .bind(("in_id", self.in_.clone()))
            .bind(("out_id", self.out.clone()))
            .bind(("memory_id", self.metadata.memory_id.clone()))
            .bind(("relation_type", self.metadata.relation_type.clone()))
            .bind(("description", self.metadata.description.clone()))
            .bind(("source_doc", self.metadata.source_doc.clone()))
            .await?
            .check()?;

        Ok(())
    }

    pub async fn list_by_memory(
        db: &SurrealDbClient,
        memory_id: &str,
    ) -> Result<Vec<Relation>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM relates_to WHERE metadata.memory_id = $memory_id")
            .bind(("memory_id", memory_id.to_owned()))
            .await?;
        let mut relations: Vec<Relation> = response.take(0)?;
        relations.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(relations)
    }

    /// Edges incident to the given entity, in either direction.
    pub async fn incident_to(
        db: &SurrealDbClient,
        memory_id: &str,
        entity_id: &str,
    ) -> Result<Vec<Relation>, AppError> {
        let thing = Thing::from(("entity", entity_id));
        let mut response = db
            .client
            .query(
                "SELECT * FROM relates_to \
                 WHERE (in = $entity OR out = $entity) AND metadata.memory_id = $memory_id",
            )
            .bind(("entity", thing))
            .bind(("memory_id", memory_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }
}

/// A `MENTIONS` edge from a document to an entity it sources.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct Mention {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    #[serde(rename = "in", deserialize_with = "deserialize_flexible_id")]
    pub in_: String,
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub out: String,
    pub memory_id: String,
}

impl Mention {
    pub fn id_for(document_id: &str, entity_id: &str) -> String {
        deterministic_id(&[document_id, entity_id])
    }

    pub async fn link(
        db: &SurrealDbClient,
        memory_id: &str,
        document_id: &str,
        entity_id: &str,
    ) -> Result<(), AppError> {
        let id = Self::id_for(document_id, entity_id);
        db.client
            .query(
                r#"BEGIN TRANSACTION;
                LET $doc = type::thing('document', $document_id);
                LET $entity = type::thing('entity', $entity_id);
                LET $mention = type::thing('mentions', $mention_id);
                DELETE type::thing('mentions', $mention_id);
                RELATE $doc->$mention->$entity SET memory_id = $memory_id;
                COMMIT TRANSACTION;"#,
            )
            .bind(("mention_id", id))
            .bind(("document_id", document_id.to_owned()))
            .bind(("entity_id", entity_id.to_owned()))
            .bind(("memory_id", memory_id.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn list_by_memory(
        db: &SurrealDbClient,
        memory_id: &str,
    ) -> Result<Vec<Mention>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM mentions WHERE memory_id = $memory_id")
            .bind(("memory_id", memory_id.to_owned()))
            .await?;
        let mut mentions: Vec<Mention> = response.take(0)?;
        mentions.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(mentions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::types::entity::Entity;
    use uuid::Uuid;

    async fn setup_db() -> SurrealDbClient {
        let database = &Uuid::new_v4().to_string();
        SurrealDbClient::memory("test_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb")
    }

    async fn create_entity(db: &SurrealDbClient, memory_id: &str, name: &str) -> String {
        let (entity, _) = Entity::merge_into(
            db,
            memory_id,
            name,
            "Organization",
            &format!("Description for {name}"),
            1,
            "doc1",
        )
        .await
        .expect("entity merge");
        entity.id
    }

    #[tokio::test]
    async fn merge_is_idempotent_per_key() {
        let db = setup_db().await;
        let a = create_entity(&db, "m1", "Cloud Temple").await;
        let b = create_entity(&db, "m1", "Acme").await;

        let relation = Relation::new(
            a.clone(),
            b.clone(),
            "m1".into(),
            "SIGNED_BY".into(),
            "contract signature".into(),
            "doc1".into(),
        );
        relation.merge(&db).await.expect("first merge");
        relation.merge(&db).await.expect("second merge");

        let relations = Relation::list_by_memory(&db, "m1").await.expect("list");
        assert_eq!(relations.len(), 1);
        assert_eq!(relations[0].metadata.relation_type, "SIGNED_BY");
        assert_eq!(relations[0].in_, a);
        assert_eq!(relations[0].out, b);
    }

    #[tokio::test]
    async fn distinct_types_make_distinct_edges() {
        let db = setup_db().await;
        let a = create_entity(&db, "m1", "Cloud Temple").await;
        let b = create_entity(&db, "m1", "Acme").await;

        for rel_type in ["SIGNED_BY", "PARTY_TO"] {
            Relation::new(
                a.clone(),
                b.clone(),
                "m1".into(),
                rel_type.into(),
                String::new(),
                "doc1".into(),
            )
            .merge(&db)
            .await
            .expect("merge");
        }

        let relations = Relation::list_by_memory(&db, "m1").await.expect("list");
        assert_eq!(relations.len(), 2);
    }

    #[tokio::test]
    async fn incident_to_sees_both_directions() {
        let db = setup_db().await;
        let a = create_entity(&db, "m1", "A").await;
        let b = create_entity(&db, "m1", "B").await;
        let c = create_entity(&db, "m1", "C").await;

        Relation::new(a.clone(), b.clone(), "m1".into(), "KNOWS".into(), String::new(), "d".into())
            .merge(&db)
            .await
            .expect("a->b");
        Relation::new(c.clone(), a.clone(), "m1".into(), "KNOWS".into(), String::new(), "d".into())
            .merge(&db)
            .await
            .expect("c->a");

        let incident = Relation::incident_to(&db, "m1", &a).await.expect("incident");
        assert_eq!(incident.len(), 2);
    }

    #[tokio::test]
    async fn mention_link_is_idempotent() {
        let db = setup_db().await;
        let entity_id = create_entity(&db, "m1", "Cloud Temple").await;

        Mention::link(&db, "m1", "doc1", &entity_id)
            .await
            .expect("first link");
        Mention::link(&db, "m1", "doc1", &entity_id)
            .await
            .expect("second link");

        let mentions = Mention::list_by_memory(&db, "m1").await.expect("list");
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].out, entity_id);
    }
}
