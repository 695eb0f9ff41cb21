use crate::{
    error::AppError,
    storage::{db::SurrealDbClient, types::deterministic_id},
    stored_object,
};

stored_object!(Document, "document", {
    memory_id: String,
    filename: String,
    content_hash: String,
    size_bytes: u64,
    content_type: String,
    object_uri: String,
    source_path: Option<String>,
    source_modified_at: Option<String>,
    text_length: usize
});

/// What a document delete removed besides the document itself.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct DocumentCascade {
    pub entities: usize,
    pub relations: usize,
    pub chunks: usize,
}

#[derive(serde::Deserialize)]
struct IdRow {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    id: String,
}

#[derive(serde::Deserialize)]
struct CountRow {
    count: usize,
}

impl Document {
    /// The document id is derived from `(memory_id, content_hash)`, so
    /// re-ingesting identical bytes addresses the same node.
    pub fn id_for(memory_id: &str, content_hash: &str) -> String {
        deterministic_id(&[memory_id, content_hash])
    }

    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory_id: String,
        filename: String,
        content_hash: String,
        size_bytes: u64,
        content_type: String,
        object_uri: String,
        source_path: Option<String>,
        source_modified_at: Option<String>,
        text_length: usize,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Self::id_for(&memory_id, &content_hash),
            created_at: now,
            updated_at: now,
            memory_id,
            filename,
            content_hash,
            size_bytes,
            content_type,
            object_uri,
            source_path,
            source_modified_at,
            text_length,
        }
    }

    pub async fn upsert(&self, db: &SurrealDbClient) -> Result<(), AppError> {
        db.client
            .query("UPSERT type::thing('document', $id) CONTENT $doc")
            .bind(("id", self.id.clone()))
            .bind(("doc", self.clone()))
            .await?
            .check()?;
        Ok(())
    }

    pub async fn find_by_hash(
        db: &SurrealDbClient,
        memory_id: &str,
        content_hash: &str,
    ) -> Result<Option<Document>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM document WHERE memory_id = $memory_id AND content_hash = $content_hash LIMIT 1",
            )
            .bind(("memory_id", memory_id.to_owned()))
            .bind(("content_hash", content_hash.to_owned()))
            .await?;
        let docs: Vec<Document> = response.take(0)?;
        Ok(docs.into_iter().next())
    }

    pub async fn get_in_memory(
        db: &SurrealDbClient,
        memory_id: &str,
        document_id: &str,
    ) -> Result<Document, AppError> {
        let doc = db
            .get_item::<Document>(document_id)
            .await?
            .filter(|d| d.memory_id == memory_id)
            .ok_or_else(|| AppError::NotFound(format!("document {document_id}")))?;
        Ok(doc)
    }

    pub async fn list_by_memory(
        db: &SurrealDbClient,
        memory_id: &str,
    ) -> Result<Vec<Document>, AppError> {
        let mut response = db
            .client
            .query("SELECT * FROM document WHERE memory_id = $memory_id")
            .bind(("memory_id", memory_id.to_owned()))
            .await?;
        let mut docs: Vec<Document> = response.take(0)?;
        docs.sort_by(|a, b| a.filename.cmp(&b.filename));
        Ok(docs)
    }

    /// Every `object_uri` known to the graph store, across all memories.
    pub async fn all_object_uris(db: &SurrealDbClient) -> Result<Vec<String>, AppError> {
        let mut response = db
            .client
            .query("SELECT VALUE object_uri FROM document")
            .await?;
        let uris: Vec<String> = response.take(0)?;
        Ok(uris)
    }

    /// Deletes the document with orphan cleanup: MENTIONS edges go first,
    /// then the document is subtracted from every entity's `source_docs`;
    /// entities left without a source are deleted along with their incident
    /// relations; finally the document's chunks and the document itself.
    pub async fn delete_cascade(
        db: &SurrealDbClient,
        memory_id: &str,
        document_id: &str,
    ) -> Result<DocumentCascade, AppError> {
        let document = Self::get_in_memory(db, memory_id, document_id).await?;

        db.client
            .query("DELETE mentions WHERE in = type::thing('document', $document_id)")
            .query(
                "UPDATE entity SET source_docs -= $document_id \
                 WHERE memory_id = $memory_id AND source_docs CONTAINS $document_id",
            )
            .bind(("document_id", document.id.clone()))
            .bind(("memory_id", memory_id.to_owned()))
            .await?
            .check()?;

        let mut orphan_response = db
            .client
            .query(
                "SELECT id FROM entity WHERE memory_id = $memory_id AND array::len(source_docs) = 0",
            )
            .bind(("memory_id", memory_id.to_owned()))
            .await?;
        let orphan_rows: Vec<IdRow> = orphan_response.take(0)?;
        let orphan_things: Vec<Thing> = orphan_rows
            .iter()
            .map(|row| Thing::from(("entity", row.id.as_str())))
            .collect();

        let mut relations_deleted = 0;
        if !orphan_things.is_empty() {
            let mut rel_count = db
                .client
                .query(
                    "SELECT count() AS count FROM relates_to \
                     WHERE in IN $orphans OR out IN $orphans GROUP ALL",
                )
                .bind(("orphans", orphan_things.clone()))
                .await?;
            let rows: Vec<CountRow> = rel_count.take(0)?;
            relations_deleted = rows.first().map_or(0, |r| r.count);

            db.client
                .query("DELETE relates_to WHERE in IN $orphans OR out IN $orphans")
                .query("DELETE mentions WHERE out IN $orphans")
                .query("DELETE entity WHERE memory_id = $memory_id AND array::len(source_docs) = 0")
                .bind(("orphans", orphan_things))
                .bind(("memory_id", memory_id.to_owned()))
                .await?
                .check()?;
        }

        let mut chunk_count = db
            .client
            .query("SELECT count() AS count FROM chunk WHERE document_id = $document_id GROUP ALL")
            .bind(("document_id", document.id.clone()))
            .await?;
        let chunk_rows: Vec<CountRow> = chunk_count.take(0)?;
        let chunks_deleted = chunk_rows.first().map_or(0, |r| r.count);

        db.client
            .query("DELETE chunk WHERE document_id = $document_id")
            .bind(("document_id", document.id.clone()))
            .await?
            .check()?;

        db.delete_item::<Document>(&document.id).await?;

        Ok(DocumentCascade {
            entities: orphan_rows.len(),
            relations: relations_deleted,
            chunks: chunks_deleted,
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

    fn sample_document(memory_id: &str, hash: &str) -> Document {
        Document::new(
            memory_id.to_string(),
            "contract.md".to_string(),
            hash.to_string(),
            128,
            "text/markdown".to_string(),
            format!("memories/{memory_id}/documents/x"),
            None,
            None,
            96,
        )
    }

    #[tokio::test]
    async fn document_id_is_deterministic_per_memory_and_hash() {
        let a = Document::id_for("m1", "hash");
        let b = Document::id_for("m1", "hash");
        let c = Document::id_for("m2", "hash");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[tokio::test]
    async fn upsert_then_find_by_hash() {
        let db = setup_db().await;
        let doc = sample_document("m1", "abc123");
        doc.upsert(&db).await.expect("upsert");

        let found = Document::find_by_hash(&db, "m1", "abc123")
            .await
            .expect("find")
            .expect("document present");
        assert_eq!(found.id, doc.id);

        // Upsert with the same hash is idempotent on the id.
        doc.upsert(&db).await.expect("second upsert");
        let all = Document::list_by_memory(&db, "m1").await.expect("list");
        assert_eq!(all.len(), 1);
    }

    #[tokio::test]
    async fn find_by_hash_is_memory_scoped() {
        let db = setup_db().await;
        sample_document("m1", "h1").upsert(&db).await.expect("m1");

        let other = Document::find_by_hash(&db, "m2", "h1").await.expect("find");
        assert!(other.is_none());
    }

    #[tokio::test]
    async fn delete_cascade_missing_document_errors() {
        let db = setup_db().await;
        let err = Document::delete_cascade(&db, "m1", "nope").await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn delete_cascade_removes_orphan_entities_and_their_edges() {
        use crate::storage::types::{
            chunk::Chunk,
            entity::Entity,
            relation::{Mention, Relation},
        };
        use crate::storage::indexes::ensure_vector_index;

        let db = setup_db().await;
        ensure_vector_index(&db, 3).await.expect("vector index");

        let mut doc1 = sample_document("m1", "h1");
        doc1.id = "d1".into();
        doc1.upsert(&db).await.expect("d1");
        let mut doc2 = sample_document("m1", "h2");
        doc2.id = "d2".into();
        doc2.upsert(&db).await.expect("d2");

        // `solo` is only mentioned by d1; `shared` by both documents.
        let (solo, _) = Entity::merge_into(&db, "m1", "Solo", "Organization", "", 1, "d1")
            .await
            .expect("solo");
        let (shared, _) = Entity::merge_into(&db, "m1", "Shared", "Organization", "", 1, "d1")
            .await
            .expect("shared d1");
        Entity::merge_into(&db, "m1", "Shared", "Organization", "", 1, "d2")
            .await
            .expect("shared d2");

        Mention::link(&db, "m1", "d1", &solo.id).await.expect("m1");
        Mention::link(&db, "m1", "d1", &shared.id).await.expect("m2");
        Mention::link(&db, "m1", "d2", &shared.id).await.expect("m3");

        Relation::new(
            solo.id.clone(),
            shared.id.clone(),
            "m1".into(),
            "PARTY_TO".into(),
            String::new(),
            "d1".into(),
        )
        .merge(&db)
        .await
        .expect("relation");

        Chunk::insert_batch(
            &db,
            &[Chunk::new(
                "m1".into(),
                "d1".into(),
                0,
                4,
                vec![],
                "passage".into(),
                vec![1.0, 0.0, 0.0],
            )],
        )
        .await
        .expect("chunk");

        let cascade = Document::delete_cascade(&db, "m1", "d1").await.expect("cascade");
        assert_eq!(cascade.entities, 1, "only the solo entity orphans");
        assert_eq!(cascade.relations, 1, "its incident edge goes with it");
        assert_eq!(cascade.chunks, 1);

        let remaining = Entity::list_by_memory(&db, "m1").await.expect("entities");
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].name, "Shared");
        assert_eq!(remaining[0].source_docs, vec!["d2".to_string()]);

        let relations = Relation::list_by_memory(&db, "m1").await.expect("relations");
        assert!(relations.is_empty());

        let mentions = Mention::list_by_memory(&db, "m1").await.expect("mentions");
        assert_eq!(mentions.len(), 1);
        assert_eq!(mentions[0].in_, "d2");
    }
}
