use std::collections::HashSet;
use std::sync::Arc;

use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs,
};
use async_openai::{config::OpenAIConfig, Client};
use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info};

use common::{
    config::AppConfig,
    error::AppError,
    storage::{
        db::SurrealDbClient,
        types::{chunk::Chunk, chunk::ScoredChunk, document::Document, entity::EntityContext},
    },
    utils::embedding::Embedder,
};

use crate::graph_search::search_entities;
use crate::tokenize::Stopwords;

#[derive(Debug, Clone, Copy)]
pub struct RetrievalConfig {
    pub limit: usize,
    pub chunk_limit: usize,
    pub score_threshold: f32,
}

impl RetrievalConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            limit: config.graph_search_limit,
            chunk_limit: config.rag_chunk_limit,
            score_threshold: config.rag_score_threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RetrievalMode {
    #[serde(rename = "graph-guided")]
    GraphGuided,
    #[serde(rename = "rag-only")]
    RagOnly,
}

/// The shared retrieval core behind `question_answer` and `memory_query`.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievalOutcome {
    pub mode: RetrievalMode,
    pub entities: Vec<EntityContext>,
    pub chunks: Vec<ScoredChunk>,
    pub documents: Vec<Document>,
}

/// Query-time remote calls, mockable for tests.
#[async_trait]
pub trait QueryServices: Send + Sync {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError>;

    async fn answer(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AppError>;
}

pub struct DefaultQueryServices {
    openai_client: Arc<Client<OpenAIConfig>>,
    embedder: Embedder,
    chat_model: String,
}

impl DefaultQueryServices {
    pub fn new(openai_client: Arc<Client<OpenAIConfig>>, config: &AppConfig) -> Self {
        Self {
            embedder: Embedder::new(Arc::clone(&openai_client), config),
            openai_client,
            chat_model: config.chat_model.clone(),
        }
    }
}

#[async_trait]
impl QueryServices for DefaultQueryServices {
    async fn embed_query(&self, text: &str) -> Result<Vec<f32>, AppError> {
        self.embedder.embed_one(text).await
    }

    async fn answer(&self, system_prompt: &str, user_prompt: &str) -> Result<String, AppError> {
        let request = CreateChatCompletionRequestArgs::default()
            .model(&self.chat_model)
            .messages([
                ChatCompletionRequestSystemMessage::from(system_prompt.to_string()).into(),
                ChatCompletionRequestUserMessage::from(user_prompt.to_string()).into(),
            ])
            .build()?;

        let response = self.openai_client.chat().create(request).await?;
        response
            .choices
            .first()
            .and_then(|choice| choice.message.content.clone())
            .ok_or_else(|| AppError::llm("no content found in answer response"))
    }
}

/// Graph-Guided RAG: the graph narrows candidate documents, the vector store
/// retrieves passages inside them; with no graph hits the search falls back
/// to the whole memory. Chunks under the score threshold are dropped.
pub async fn retrieve(
    db: &SurrealDbClient,
    services: &dyn QueryServices,
    stopwords: &Stopwords,
    memory_id: &str,
    query: &str,
    config: RetrievalConfig,
) -> Result<RetrievalOutcome, AppError> {
    let entities = search_entities(db, memory_id, query, config.limit, stopwords).await?;

    let mut source_docs: Vec<String> = Vec::new();
    let mut seen_docs = HashSet::new();
    for context in &entities {
        for doc in &context.entity.source_docs {
            if seen_docs.insert(doc.clone()) {
                source_docs.push(doc.clone());
            }
        }
    }

    let mode = if source_docs.is_empty() {
        RetrievalMode::RagOnly
    } else {
        RetrievalMode::GraphGuided
    };

    let query_embedding = services.embed_query(query).await?;
    let document_filter = match mode {
        RetrievalMode::GraphGuided => Some(source_docs.as_slice()),
        RetrievalMode::RagOnly => None,
    };
    let candidates = Chunk::vector_search(
        db,
        memory_id,
        document_filter,
        query_embedding,
        config.chunk_limit,
    )
    .await?;

    let mut chunks = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        let accepted = candidate.score >= config.score_threshold;
        debug!(
            chunk_id = %candidate.id,
            document_id = %candidate.document_id,
            score = candidate.score,
            accepted,
            "rag chunk scored"
        );
        if accepted {
            chunks.push(candidate);
        }
    }

    let mut document_ids: Vec<String> = Vec::new();
    let mut seen = HashSet::new();
    for chunk in &chunks {
        if seen.insert(chunk.document_id.clone()) {
            document_ids.push(chunk.document_id.clone());
        }
    }
    for doc in &source_docs {
        if seen.insert(doc.clone()) {
            document_ids.push(doc.clone());
        }
    }

    let all_documents = Document::list_by_memory(db, memory_id).await?;
    let documents: Vec<Document> = all_documents
        .into_iter()
        .filter(|d| document_ids.contains(&d.id))
        .collect();

    info!(
        memory_id,
        mode = ?mode,
        graph_hits = entities.len(),
        retained_chunks = chunks.len(),
        documents = documents.len(),
        "retrieval core finished"
    );

    Ok(RetrievalOutcome {
        mode,
        entities,
        chunks,
        documents,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::storage::indexes::ensure_vector_index;
    use common::storage::types::entity::Entity;
    use uuid::Uuid;

    struct MockQueryServices {
        embedding: Vec<f32>,
    }

    #[async_trait]
    impl QueryServices for MockQueryServices {
        async fn embed_query(&self, _text: &str) -> Result<Vec<f32>, AppError> {
            Ok(self.embedding.clone())
        }

        async fn answer(&self, _system: &str, _user: &str) -> Result<String, AppError> {
            Ok("mock answer".to_string())
        }
    }

    async fn setup_db() -> SurrealDbClient {
        let database = &Uuid::new_v4().to_string();
        let db = SurrealDbClient::memory("test_ns", database)
            .await
            .expect("Failed to start in-memory surrealdb");
        ensure_vector_index(&db, 3).await.expect("vector index");
        db
    }

    async fn seed_document(db: &SurrealDbClient, memory_id: &str, document_id: &str) {
        let mut doc = Document::new(
            memory_id.to_string(),
            format!("{document_id}.md"),
            format!("hash-{document_id}"),
            10,
            "text/markdown".to_string(),
            format!("memories/{memory_id}/documents/{document_id}"),
            None,
            None,
            10,
        );
        doc.id = document_id.to_string();
        doc.upsert(db).await.expect("upsert document");
    }

    async fn seed_chunk(
        db: &SurrealDbClient,
        memory_id: &str,
        document_id: &str,
        sequence: u32,
        embedding: Vec<f32>,
    ) {
        Chunk::insert_batch(
            db,
            &[Chunk::new(
                memory_id.to_string(),
                document_id.to_string(),
                sequence,
                10,
                vec![],
                format!("passage {sequence} of {document_id}"),
                embedding,
            )],
        )
        .await
        .expect("insert chunk");
    }

    fn config() -> RetrievalConfig {
        RetrievalConfig {
            limit: 10,
            chunk_limit: 8,
            score_threshold: 0.58,
        }
    }

    #[tokio::test]
    async fn graph_guided_restricts_chunks_to_entity_documents() {
        let db = setup_db().await;
        seed_document(&db, "m1", "d1").await;
        seed_document(&db, "m1", "d2").await;

        Entity::merge_into(&db, "m1", "Résiliation", "Concept", "clause", 1, "d1")
            .await
            .expect("entity");

        // Identical embeddings in both documents; only d1 may surface.
        seed_chunk(&db, "m1", "d1", 0, vec![1.0, 0.0, 0.0]).await;
        seed_chunk(&db, "m1", "d2", 0, vec![1.0, 0.0, 0.0]).await;

        let services = MockQueryServices {
            embedding: vec![1.0, 0.0, 0.0],
        };
        let outcome = retrieve(
            &db,
            &services,
            &Stopwords::built_in(),
            "m1",
            "résiliation",
            config(),
        )
        .await
        .expect("retrieve");

        assert_eq!(outcome.mode, RetrievalMode::GraphGuided);
        assert_eq!(outcome.entities.len(), 1);
        assert!(!outcome.chunks.is_empty());
        assert!(outcome.chunks.iter().all(|c| c.document_id == "d1"));
        assert!(outcome.documents.iter().any(|d| d.id == "d1"));
    }

    #[tokio::test]
    async fn falls_back_to_rag_only_when_graph_is_empty() {
        let db = setup_db().await;
        seed_document(&db, "m1", "d1").await;
        seed_chunk(&db, "m1", "d1", 0, vec![0.0, 1.0, 0.0]).await;

        let services = MockQueryServices {
            embedding: vec![0.0, 1.0, 0.0],
        };
        let outcome = retrieve(
            &db,
            &services,
            &Stopwords::built_in(),
            "m1",
            "sujet inconnu",
            config(),
        )
        .await
        .expect("retrieve");

        assert_eq!(outcome.mode, RetrievalMode::RagOnly);
        assert!(outcome.entities.is_empty());
        assert_eq!(outcome.chunks.len(), 1);
        assert_eq!(outcome.documents.len(), 1);
    }

    #[tokio::test]
    async fn low_scoring_chunks_are_dropped() {
        let db = setup_db().await;
        seed_document(&db, "m1", "d1").await;
        // Orthogonal to the query embedding: cosine 0.
        seed_chunk(&db, "m1", "d1", 0, vec![0.0, 0.0, 1.0]).await;

        let services = MockQueryServices {
            embedding: vec![1.0, 0.0, 0.0],
        };
        let outcome = retrieve(
            &db,
            &services,
            &Stopwords::built_in(),
            "m1",
            "sujet inconnu",
            config(),
        )
        .await
        .expect("retrieve");

        assert!(outcome.chunks.is_empty());
        assert!(outcome.documents.is_empty());
    }

    #[tokio::test]
    async fn entity_documents_count_even_without_retained_chunks() {
        let db = setup_db().await;
        seed_document(&db, "m1", "d1").await;
        Entity::merge_into(&db, "m1", "Réversibilité", "Concept", "clause", 1, "d1")
            .await
            .expect("entity");

        let services = MockQueryServices {
            embedding: vec![1.0, 0.0, 0.0],
        };
        let outcome = retrieve(
            &db,
            &services,
            &Stopwords::built_in(),
            "m1",
            "réversibilité",
            config(),
        )
        .await
        .expect("retrieve");

        assert_eq!(outcome.mode, RetrievalMode::GraphGuided);
        assert!(outcome.chunks.is_empty());
        assert_eq!(outcome.documents.len(), 1);
        assert_eq!(outcome.documents[0].id, "d1");
    }
}
