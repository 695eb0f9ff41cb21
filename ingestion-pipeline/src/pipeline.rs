use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_openai::types::{
    ChatCompletionRequestSystemMessage, ChatCompletionRequestUserMessage,
    CreateChatCompletionRequestArgs, ResponseFormat, ResponseFormatJsonSchema,
};
use async_openai::{config::OpenAIConfig, Client};
use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

use common::{
    config::AppConfig,
    error::AppError,
    ontology::{Ontology, OntologyRegistry},
    storage::{
        db::SurrealDbClient,
        object::{self, ObjectStorage},
        types::{
            chunk::Chunk,
            document::Document,
            entity::Entity,
            memory::Memory,
            relation::{Mention, Relation},
        },
    },
    utils::{
        embedding::Embedder,
        progress::{ProgressEvent, ProgressSink},
    },
};

use crate::chunker::{chunk_text, ChunkerConfig};
use crate::decode::{decode_document, detect_content_type};
use crate::extraction::{
    build_system_prompt, build_user_prompt, extraction_schema, parse_extraction,
    slice_extraction_chunks, ExtractionResult,
};
use crate::merge::ExtractionAccumulator;

pub struct IngestionRequest {
    pub memory_id: String,
    pub filename: String,
    pub bytes: Bytes,
    pub force: bool,
    pub source_path: Option<String>,
    pub source_modified_at: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct IngestionOutcome {
    pub document_id: String,
    pub deduplicated: bool,
    pub entities_new: usize,
    pub entities_merged: usize,
    pub relations: usize,
    pub chunks: usize,
    pub failed_extraction_chunks: usize,
}

/// The remote calls the pipeline depends on, behind a seam so tests can run
/// without network services.
#[async_trait]
pub trait PipelineServices: Send + Sync {
    async fn extract(
        &self,
        ontology: &Ontology,
        context_json: &str,
        chunk_text: &str,
    ) -> Result<ExtractionResult, AppError>;

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError>;
}

pub struct DefaultPipelineServices {
    openai_client: Arc<Client<OpenAIConfig>>,
    embedder: Embedder,
    config: AppConfig,
}

impl DefaultPipelineServices {
    pub fn new(openai_client: Arc<Client<OpenAIConfig>>, config: AppConfig) -> Self {
        let embedder = Embedder::new(Arc::clone(&openai_client), &config);
        Self {
            openai_client,
            embedder,
            config,
        }
    }
}

#[async_trait]
impl PipelineServices for DefaultPipelineServices {
    async fn extract(
        &self,
        ontology: &Ontology,
        context_json: &str,
        chunk_text: &str,
    ) -> Result<ExtractionResult, AppError> {
        let response_format = ResponseFormat::JsonSchema {
            json_schema: ResponseFormatJsonSchema {
                description: Some("Typed entities and relations found in the passage".into()),
                name: "graph_extraction".into(),
                schema: Some(extraction_schema()),
                strict: Some(true),
            },
        };

        let mut builder = CreateChatCompletionRequestArgs::default();
        builder
            .model(&self.config.chat_model)
            .messages([
                ChatCompletionRequestSystemMessage::from(build_system_prompt(ontology)).into(),
                ChatCompletionRequestUserMessage::from(build_user_prompt(context_json, chunk_text))
                    .into(),
            ])
            .response_format(response_format);
        if let Some(max_tokens) = self.config.extraction_max_tokens {
            builder.max_completion_tokens(max_tokens);
        }
        let request = builder.build()?;

        let timeout = Duration::from_secs(self.config.extraction_timeout_s);
        let response = tokio::time::timeout(timeout, self.openai_client.chat().create(request))
            .await
            .map_err(|_| {
                AppError::llm(format!(
                    "extraction call exceeded {}s",
                    self.config.extraction_timeout_s
                ))
            })??;

        let content = response
            .choices
            .first()
            .and_then(|choice| choice.message.content.as_ref())
            .ok_or_else(|| AppError::llm("no content found in extraction response"))?;

        parse_extraction(content)
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
        self.embedder.embed_batch(texts).await
    }
}

pub struct IngestionPipeline {
    db: Arc<SurrealDbClient>,
    storage: ObjectStorage,
    ontologies: OntologyRegistry,
    services: Arc<dyn PipelineServices>,
    config: AppConfig,
}

impl IngestionPipeline {
    pub fn new(
        db: Arc<SurrealDbClient>,
        storage: ObjectStorage,
        ontologies: OntologyRegistry,
        services: Arc<dyn PipelineServices>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            storage,
            ontologies,
            services,
            config,
        }
    }

    /// Runs the full ingest: decode, dedup, upload, chunked extraction with
    /// cumulative context, merge, graph persist, retrieval chunking, batched
    /// embedding, vector write. The uploaded artifact is the commit point;
    /// later failures leave document and graph state in place.
    #[tracing::instrument(
        skip_all,
        fields(memory_id = %request.memory_id, filename = %request.filename, force = request.force)
    )]
    pub async fn ingest(
        &self,
        request: IngestionRequest,
        progress: &ProgressSink,
    ) -> Result<IngestionOutcome, AppError> {
        let started = Instant::now();

        if request.bytes.len() as u64 > self.config.max_document_size_bytes() {
            return Err(AppError::QuotaExceeded(format!(
                "document is {} bytes, limit is {} MB",
                request.bytes.len(),
                self.config.max_document_size_mb
            )));
        }

        let memory = Memory::get(&self.db, &request.memory_id).await?;
        let ontology = self.ontologies.get(&memory.ontology_name).ok_or_else(|| {
            AppError::InvalidArgument(format!(
                "memory {} references unknown ontology {}",
                memory.id, memory.ontology_name
            ))
        })?;

        self.emit(progress, "decode", 0, 1, 0, 0, started);
        let text = decode_document(&request.filename, &request.bytes, self.config.max_text_length)?;

        let content_hash = {
            let digest = Sha256::digest(&request.bytes);
            format!("{digest:x}")
        };

        if let Some(existing) =
            Document::find_by_hash(&self.db, &request.memory_id, &content_hash).await?
        {
            if !request.force {
                info!(document_id = %existing.id, "identical content already ingested");
                return Ok(IngestionOutcome {
                    document_id: existing.id,
                    deduplicated: true,
                    entities_new: 0,
                    entities_merged: 0,
                    relations: 0,
                    chunks: 0,
                    failed_extraction_chunks: 0,
                });
            }
        }

        let document_id = Document::id_for(&request.memory_id, &content_hash);
        let object_uri = object::document_key(&request.memory_id, &document_id);
        let content_type = detect_content_type(&request.filename);

        self.emit(progress, "upload", 0, 1, 0, 0, started);
        self.storage
            .put(&object_uri, request.bytes.clone(), &content_type)
            .await?;

        let document = Document::new(
            request.memory_id.clone(),
            request.filename.clone(),
            content_hash,
            request.bytes.len() as u64,
            content_type,
            object_uri,
            request.source_path.clone(),
            request.source_modified_at.clone(),
            text.chars().count(),
        );
        document.upsert(&self.db).await?;

        if request.force {
            Chunk::delete_by_document(&self.db, &document_id).await?;
        }

        let extraction_chunks = slice_extraction_chunks(&text, self.config.extraction_chunk_size);
        let total_chunks = extraction_chunks.len() as u32;
        let mut accumulator =
            ExtractionAccumulator::new(ontology.clone(), self.config.extraction_context_budget);
        let mut failed_extraction_chunks = 0usize;

        for (index, extraction_chunk) in extraction_chunks.iter().enumerate() {
            let context_json = accumulator.context_json();
            match self
                .services
                .extract(ontology.as_ref(), &context_json, extraction_chunk)
                .await
            {
                Ok(result) => accumulator.absorb(result),
                Err(err) => {
                    // A failed or timed-out chunk is skipped; the partial
                    // result beats losing the whole document.
                    warn!(
                        chunk = index + 1,
                        total = total_chunks,
                        error = %err,
                        "extraction chunk failed, skipping"
                    );
                    failed_extraction_chunks += 1;
                }
            }

            let (entity_count, relation_count) = accumulator.counts();
            self.emit(
                progress,
                "extract",
                (index + 1) as u32,
                total_chunks,
                entity_count,
                relation_count,
                started,
            );
        }

        let mut entities_new = 0usize;
        let mut entities_merged = 0usize;
        let mut ids_by_name: HashMap<String, String> = HashMap::new();
        for merged in accumulator.entities() {
            let (entity, created) = Entity::merge_into(
                &self.db,
                &request.memory_id,
                &merged.name,
                &merged.entity_type,
                &merged.description,
                merged.mentions,
                &document_id,
            )
            .await?;
            if created {
                entities_new += 1;
            } else {
                entities_merged += 1;
            }
            Mention::link(&self.db, &request.memory_id, &document_id, &entity.id).await?;
            ids_by_name.insert(merged.name.trim().to_lowercase(), entity.id);
        }

        let mut relations_persisted = 0usize;
        for relation in accumulator.relations() {
            let from = ids_by_name.get(&relation.from.trim().to_lowercase());
            let to = ids_by_name.get(&relation.to.trim().to_lowercase());
            let (Some(from), Some(to)) = (from, to) else {
                debug!(
                    from = %relation.from,
                    to = %relation.to,
                    "dropping relation with unextracted endpoint"
                );
                continue;
            };
            Relation::new(
                from.clone(),
                to.clone(),
                request.memory_id.clone(),
                relation.relation_type.clone(),
                relation.description.clone(),
                document_id.clone(),
            )
            .merge(&self.db)
            .await?;
            relations_persisted += 1;
        }

        let (entity_count, relation_count) = accumulator.counts();
        self.emit(
            progress,
            "persist-graph",
            1,
            1,
            entity_count,
            relation_count,
            started,
        );

        let chunker_config = ChunkerConfig {
            target_tokens: self.config.chunk_size,
            overlap_tokens: self.config.chunk_overlap,
        };
        let pieces = chunk_text(&text, &chunker_config);
        self.emit(
            progress,
            "chunk",
            pieces.len() as u32,
            pieces.len() as u32,
            entity_count,
            relation_count,
            started,
        );

        let batch_size = self.config.embedding_batch_size.max(1);
        let total_batches = pieces.len().div_ceil(batch_size).max(1) as u32;
        let mut stored_chunks: Vec<Chunk> = Vec::with_capacity(pieces.len());
        for (batch_index, batch) in pieces.chunks(batch_size).enumerate() {
            let texts: Vec<String> = batch.iter().map(|p| p.text.clone()).collect();
            let vectors = self.services.embed(&texts).await?;
            if vectors.len() != batch.len() {
                return Err(AppError::llm(format!(
                    "embedding batch returned {} vectors for {} chunks",
                    vectors.len(),
                    batch.len()
                )));
            }
            for (piece, vector) in batch.iter().zip(vectors) {
                stored_chunks.push(Chunk::new(
                    request.memory_id.clone(),
                    document_id.clone(),
                    piece.sequence,
                    piece.token_count,
                    piece.section_path.clone(),
                    piece.text.clone(),
                    vector,
                ));
            }
            self.emit(
                progress,
                "embed",
                (batch_index + 1) as u32,
                total_batches,
                entity_count,
                relation_count,
                started,
            );
        }

        Chunk::insert_batch(&self.db, &stored_chunks).await?;
        self.emit(
            progress,
            "persist-vectors",
            1,
            1,
            entity_count,
            relation_count,
            started,
        );

        info!(
            document_id = %document_id,
            entities_new,
            entities_merged,
            relations = relations_persisted,
            chunks = stored_chunks.len(),
            failed_extraction_chunks,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "ingestion finished"
        );

        Ok(IngestionOutcome {
            document_id,
            deduplicated: false,
            entities_new,
            entities_merged,
            relations: relations_persisted,
            chunks: stored_chunks.len(),
            failed_extraction_chunks,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn emit(
        &self,
        progress: &ProgressSink,
        phase: &str,
        current: u32,
        total: u32,
        entities: usize,
        relations: usize,
        started: Instant,
    ) {
        progress.emit(ProgressEvent {
            phase: phase.to_string(),
            current,
            total,
            entities,
            relations,
            elapsed_ms: started.elapsed().as_millis() as u64,
            message: None,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extraction::{ExtractedEntity, ExtractedRelation};
    use common::config::StorageKind;
    use common::ontology::TypeDef;
    use common::storage::indexes::ensure_vector_index;
    use object_store::memory::InMemory;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use uuid::Uuid;

    struct MockServices {
        extract_calls: AtomicUsize,
        fail_on_call: Option<usize>,
    }

    impl MockServices {
        fn new() -> Self {
            Self {
                extract_calls: AtomicUsize::new(0),
                fail_on_call: None,
            }
        }

        fn failing_on(call: usize) -> Self {
            Self {
                extract_calls: AtomicUsize::new(0),
                fail_on_call: Some(call),
            }
        }
    }

    #[async_trait]
    impl PipelineServices for MockServices {
        async fn extract(
            &self,
            _ontology: &Ontology,
            _context_json: &str,
            chunk_text: &str,
        ) -> Result<ExtractionResult, AppError> {
            let call = self.extract_calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_on_call == Some(call) {
                return Err(AppError::llm("mock extraction failure"));
            }

            let mut result = ExtractionResult::default();
            if chunk_text.contains("Cloud Temple") {
                result.entities.push(ExtractedEntity {
                    name: "Cloud Temple".into(),
                    entity_type: "Organization".into(),
                    description: "signs contracts".into(),
                });
                result.entities.push(ExtractedEntity {
                    name: "Acme".into(),
                    entity_type: "Organization".into(),
                    description: "counterparty".into(),
                });
                result.relations.push(ExtractedRelation {
                    from: "Cloud Temple".into(),
                    to: "Acme".into(),
                    relation_type: "SIGNED_BY".into(),
                    description: "contract".into(),
                });
            }
            Ok(result)
        }

        async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, AppError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0, 0.0]).collect())
        }
    }

    fn legal_ontology() -> Ontology {
        Ontology {
            name: "legal".into(),
            entity_types: vec![TypeDef {
                name: "Organization".into(),
                description: "A company".into(),
                examples: vec![],
            }],
            relation_types: vec![TypeDef {
                name: "SIGNED_BY".into(),
                description: "Signature".into(),
                examples: vec![],
            }],
            priority_entities: vec![],
            priority_relations: vec![],
            instructions: String::new(),
            max_entities: 50,
            max_relations: 80,
        }
    }

    async fn setup_pipeline(services: Arc<dyn PipelineServices>) -> (IngestionPipeline, Arc<SurrealDbClient>) {
        let database = &Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        ensure_vector_index(&db, 3).await.expect("vector index");

        let storage =
            ObjectStorage::with_backend(Arc::new(InMemory::new()), StorageKind::Memory);
        let ontologies = OntologyRegistry::from_ontologies(vec![legal_ontology()]);
        let config = AppConfig::default();

        for memory_id in ["legal", "other"] {
            Memory::new(
                memory_id.into(),
                memory_id.into(),
                String::new(),
                "legal".into(),
            )
            .create(&db)
            .await
            .expect("create memory");
        }

        (
            IngestionPipeline::new(Arc::clone(&db), storage, ontologies, services, config),
            db,
        )
    }

    fn request(memory_id: &str, content: &str, force: bool) -> IngestionRequest {
        IngestionRequest {
            memory_id: memory_id.into(),
            filename: "contrat.md".into(),
            bytes: Bytes::from(content.as_bytes().to_vec()),
            force,
            source_path: None,
            source_modified_at: None,
        }
    }

    const CONTRACT: &str = "Cloud Temple signe avec Acme le 2024-05-01.";

    #[tokio::test]
    async fn ingest_builds_graph_and_chunks() {
        let (pipeline, db) = setup_pipeline(Arc::new(MockServices::new())).await;

        let outcome = pipeline
            .ingest(request("legal", CONTRACT, false), &ProgressSink::disabled())
            .await
            .expect("ingest");

        assert!(!outcome.deduplicated);
        assert_eq!(outcome.entities_new, 2);
        assert_eq!(outcome.entities_merged, 0);
        assert_eq!(outcome.relations, 1);
        assert!(outcome.chunks >= 1);

        let entities = Entity::list_by_memory(&db, "legal").await.expect("entities");
        assert_eq!(entities.len(), 2);
        assert!(entities.iter().any(|e| e.name == "Cloud Temple"));
        assert!(entities
            .iter()
            .all(|e| e.source_docs == vec![outcome.document_id.clone()]));

        let mentions = Mention::list_by_memory(&db, "legal").await.expect("mentions");
        assert_eq!(mentions.len(), 2);

        let chunks = Chunk::export_by_memory(&db, "legal").await.expect("chunks");
        assert_eq!(chunks.len(), outcome.chunks);
        assert!(chunks.iter().all(|c| c.document_id == outcome.document_id));

        let counts = Memory::stats(&db, "legal").await.expect("stats");
        assert_eq!(counts.documents, 1);
    }

    #[tokio::test]
    async fn identical_bytes_dedup_without_force() {
        let (pipeline, db) = setup_pipeline(Arc::new(MockServices::new())).await;

        let first = pipeline
            .ingest(request("legal", CONTRACT, false), &ProgressSink::disabled())
            .await
            .expect("first ingest");
        let second = pipeline
            .ingest(request("legal", CONTRACT, false), &ProgressSink::disabled())
            .await
            .expect("second ingest");

        assert_eq!(first.document_id, second.document_id);
        assert!(second.deduplicated);
        assert_eq!(second.entities_new, 0);

        let entities = Entity::list_by_memory(&db, "legal").await.expect("entities");
        assert_eq!(entities.len(), 2, "dedup must not add entities");
    }

    #[tokio::test]
    async fn force_replaces_chunks_and_merges_entities() {
        let (pipeline, db) = setup_pipeline(Arc::new(MockServices::new())).await;

        let first = pipeline
            .ingest(request("legal", CONTRACT, false), &ProgressSink::disabled())
            .await
            .expect("first ingest");
        let chunks_before = Chunk::export_by_memory(&db, "legal").await.expect("chunks");

        let second = pipeline
            .ingest(request("legal", CONTRACT, true), &ProgressSink::disabled())
            .await
            .expect("forced ingest");

        assert_eq!(first.document_id, second.document_id);
        assert!(!second.deduplicated);
        assert_eq!(second.entities_new, 0);
        assert_eq!(second.entities_merged, 2);

        let entities = Entity::list_by_memory(&db, "legal").await.expect("entities");
        assert_eq!(entities.len(), 2, "force merges entities by (name, type)");

        let chunks_after = Chunk::export_by_memory(&db, "legal").await.expect("chunks");
        assert_eq!(chunks_after.len(), chunks_before.len());
        // Replaced, not appended: chunk ids are fresh.
        assert!(chunks_after
            .iter()
            .all(|c| chunks_before.iter().all(|b| b.id != c.id)));
    }

    #[tokio::test]
    async fn ingest_into_one_memory_leaves_others_untouched() {
        let (pipeline, db) = setup_pipeline(Arc::new(MockServices::new())).await;

        pipeline
            .ingest(request("legal", CONTRACT, false), &ProgressSink::disabled())
            .await
            .expect("ingest");

        let other_entities = Entity::list_by_memory(&db, "other").await.expect("other");
        assert!(other_entities.is_empty());
        let other_counts = Memory::stats(&db, "other").await.expect("stats");
        assert_eq!(other_counts.documents, 0);
        assert_eq!(other_counts.chunks, 0);
    }

    #[tokio::test]
    async fn oversized_document_is_rejected_before_decode() {
        let services: Arc<dyn PipelineServices> = Arc::new(MockServices::new());
        let (mut pipeline, _db) = setup_pipeline(Arc::clone(&services)).await;
        pipeline.config.max_document_size_mb = 1;

        let big = "x".repeat(2 * 1024 * 1024);
        let err = pipeline
            .ingest(request("legal", &big, false), &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::QuotaExceeded(_)));
    }

    #[tokio::test]
    async fn unknown_memory_is_not_found() {
        let (pipeline, _db) = setup_pipeline(Arc::new(MockServices::new())).await;
        let err = pipeline
            .ingest(request("ghost", CONTRACT, false), &ProgressSink::disabled())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[tokio::test]
    async fn failed_extraction_chunk_is_skipped_not_fatal() {
        let (pipeline, _db) = setup_pipeline(Arc::new(MockServices::failing_on(0))).await;

        let outcome = pipeline
            .ingest(request("legal", CONTRACT, false), &ProgressSink::disabled())
            .await
            .expect("ingest despite failing chunk");

        assert_eq!(outcome.failed_extraction_chunks, 1);
        assert_eq!(outcome.entities_new, 0);
        assert!(outcome.chunks >= 1, "vector path still runs");
    }

    #[tokio::test]
    async fn progress_events_cover_every_phase() {
        let (pipeline, _db) = setup_pipeline(Arc::new(MockServices::new())).await;
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);

        pipeline
            .ingest(request("legal", CONTRACT, false), &ProgressSink::new(tx))
            .await
            .expect("ingest");

        let mut phases = Vec::new();
        while let Ok(event) = rx.try_recv() {
            phases.push(event.phase);
        }
        for expected in [
            "decode",
            "upload",
            "extract",
            "persist-graph",
            "chunk",
            "embed",
            "persist-vectors",
        ] {
            assert!(
                phases.iter().any(|p| p == expected),
                "missing phase {expected} in {phases:?}"
            );
        }
    }
}
