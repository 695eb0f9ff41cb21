use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};
use uuid::Uuid;

stored_object!(Chunk, "chunk", {
    memory_id: String,
    document_id: String,
    sequence: u32,
    token_count: usize,
    section_path: Vec<String>,
    text: String,
    embedding: Vec<f32>
});

/// A chunk surfaced by vector search, with its cosine score. The embedding is
/// not rehydrated.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, PartialEq)]
pub struct ScoredChunk {
    #[serde(deserialize_with = "deserialize_flexible_id")]
    pub id: String,
    pub memory_id: String,
    pub document_id: String,
    pub sequence: u32,
    pub token_count: usize,
    #[serde(default)]
    pub section_path: Vec<String>,
    pub text: String,
    pub score: f32,
}

impl Chunk {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        memory_id: String,
        document_id: String,
        sequence: u32,
        token_count: usize,
        section_path: Vec<String>,
        text: String,
        embedding: Vec<f32>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            created_at: now,
            updated_at: now,
            memory_id,
            document_id,
            sequence,
            token_count,
            section_path,
            text,
            embedding,
        }
    }

    pub async fn insert_batch(db: &SurrealDbClient, chunks: &[Chunk]) -> Result<(), AppError> {
        for chunk in chunks {
            db.store_item(chunk.clone()).await?;
        }
        Ok(())
    }

    pub async fn delete_by_document(
        db: &SurrealDbClient,
        document_id: &str,
    ) -> Result<(), AppError> {
        db.client
            .query("DELETE chunk WHERE document_id = $document_id")
            .bind(("document_id", document_id.to_owned()))
            .await?
            .check()?;
        Ok(())
    }

    /// Top-k cosine search over a memory's chunks, optionally restricted to a
    /// document set (the Graph-Guided path). Results are ordered by
    /// descending score; thresholding is the caller's concern.
    pub async fn vector_search(
        db: &SurrealDbClient,
        memory_id: &str,
        document_ids: Option<&[String]>,
        query_embedding: Vec<f32>,
        take: usize,
    ) -> Result<Vec<ScoredChunk>, AppError> {
        if take == 0 {
            return Ok(Vec::new());
        }

        let document_filter = if document_ids.is_some() {
            "AND document_id IN $documents"
        } else {
            ""
        };
        let sql = format!(
            "SELECT id, memory_id, document_id, sequence, token_count, section_path, text, \
                vector::similarity::cosine(embedding, $embedding) AS score \
             FROM chunk \
             WHERE memory_id = $memory_id {document_filter} \
               AND embedding <|{take},80|> $embedding \
             ORDER BY score DESC \
             LIMIT {take}"
        );

        let mut query = db
            .client
            .query(sql)
            .bind(("memory_id", memory_id.to_owned()))
            .bind(("embedding", query_embedding));
        if let Some(documents) = document_ids {
            query = query.bind(("documents", documents.to_vec()));
        }

        let mut response = query.await?;
        Ok(response.take(0)?)
    }

    /// All chunks of a memory in a stable order, embeddings included. Used by
    /// backup export.
    pub async fn export_by_memory(
        db: &SurrealDbClient,
        memory_id: &str,
    ) -> Result<Vec<Chunk>, AppError> {
        let mut response = db
            .client
            .query(
                "SELECT * FROM chunk WHERE memory_id = $memory_id \
                 ORDER BY document_id, sequence",
            )
            .bind(("memory_id", memory_id.to_owned()))
            .await?;
        Ok(response.take(0)?)
    }
}
