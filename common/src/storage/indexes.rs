use std::sync::atomic::Ordering;

use crate::error::AppError;

use super::db::SurrealDbClient;

/// HNSW index over chunk embeddings. Dimension comes from the configured
/// embedding model.
pub async fn ensure_vector_index(
    db: &SurrealDbClient,
    dimensions: usize,
) -> Result<(), AppError> {
    db.client
        .query(format!(
            "DEFINE INDEX IF NOT EXISTS idx_chunk_embedding ON chunk FIELDS embedding HNSW DIMENSION {dimensions} DIST COSINE"
        ))
        .await?;
    Ok(())
}

/// Plain lookup indexes for the hot filters.
pub async fn ensure_lookup_indexes(db: &SurrealDbClient) -> Result<(), AppError> {
    db.client
        .query("DEFINE INDEX IF NOT EXISTS idx_document_memory ON document FIELDS memory_id")
        .await?;
    db.client
        .query(
            "DEFINE INDEX IF NOT EXISTS idx_document_hash ON document FIELDS memory_id, content_hash",
        )
        .await?;
    db.client
        .query("DEFINE INDEX IF NOT EXISTS idx_entity_memory ON entity FIELDS memory_id")
        .await?;
    db.client
        .query("DEFINE INDEX IF NOT EXISTS idx_chunk_document ON chunk FIELDS document_id")
        .await?;
    db.client
        .query("DEFINE INDEX IF NOT EXISTS idx_chunk_memory ON chunk FIELDS memory_id")
        .await?;
    Ok(())
}

/// Full-text index over entity names with ASCII folding (`é→e`, lowercased),
/// created lazily on the first search and guarded by a process-local flag so
/// repeat searches skip the DDL round-trip. The statements themselves are
/// idempotent.
pub async fn ensure_entity_search_index(db: &SurrealDbClient) -> Result<(), AppError> {
    if db.search_index_ready.load(Ordering::Acquire) {
        return Ok(());
    }

    db.client
        .query(
            "DEFINE ANALYZER IF NOT EXISTS entity_folding TOKENIZERS class FILTERS lowercase, ascii",
        )
        .await?;
    db.client
        .query(
            "DEFINE INDEX IF NOT EXISTS idx_entity_name_search ON entity FIELDS name \
             SEARCH ANALYZER entity_folding BM25 HIGHLIGHTS",
        )
        .await?;

    db.search_index_ready.store(true, Ordering::Release);
    Ok(())
}
