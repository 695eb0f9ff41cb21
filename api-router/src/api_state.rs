use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{Mutex, OwnedMutexGuard};

use backup_service::BackupService;
use common::{
    config::AppConfig,
    error::AppError,
    ontology::OntologyRegistry,
    storage::{db::SurrealDbClient, object::ObjectStorage},
};
use ingestion_pipeline::{DefaultPipelineServices, IngestionPipeline, PipelineServices};
use retrieval_pipeline::{DefaultQueryServices, QueryServices, Stopwords};

use crate::mcp::session::SessionRegistry;

/// Serialises writers per memory: ingest queues, backup try-locks.
#[derive(Clone, Default)]
pub struct MemoryLocks {
    inner: Arc<Mutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl MemoryLocks {
    async fn entry(&self, memory_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.inner.lock().await;
        Arc::clone(
            map.entry(memory_id.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(()))),
        )
    }

    pub async fn lock(&self, memory_id: &str) -> OwnedMutexGuard<()> {
        self.entry(memory_id).await.lock_owned().await
    }

    pub async fn try_lock(&self, memory_id: &str) -> Option<OwnedMutexGuard<()>> {
        self.entry(memory_id).await.try_lock_owned().ok()
    }
}

#[derive(Clone)]
pub struct ApiState {
    pub db: Arc<SurrealDbClient>,
    pub storage: ObjectStorage,
    pub config: AppConfig,
    pub ontologies: OntologyRegistry,
    pub stopwords: Arc<Stopwords>,
    pub pipeline: Arc<IngestionPipeline>,
    pub query_services: Arc<dyn QueryServices>,
    pub backup: Arc<BackupService>,
    pub sessions: SessionRegistry,
    pub memory_locks: MemoryLocks,
}

impl ApiState {
    /// Production wiring: OpenAI-compatible clients built from config.
    pub async fn new(
        config: &AppConfig,
        db: Arc<SurrealDbClient>,
        storage: ObjectStorage,
        ontologies: OntologyRegistry,
    ) -> Result<Self, AppError> {
        let openai_client = Arc::new(async_openai::Client::with_config(
            async_openai::config::OpenAIConfig::new()
                .with_api_key(&config.llm_api_key)
                .with_api_base(&config.llm_base_url),
        ));

        let pipeline_services: Arc<dyn PipelineServices> = Arc::new(
            DefaultPipelineServices::new(Arc::clone(&openai_client), config.clone()),
        );
        let query_services: Arc<dyn QueryServices> =
            Arc::new(DefaultQueryServices::new(openai_client, config));

        Self::with_services(
            config,
            db,
            storage,
            ontologies,
            pipeline_services,
            query_services,
        )
    }

    /// Wiring with injected remote-call seams, used by tests.
    pub fn with_services(
        config: &AppConfig,
        db: Arc<SurrealDbClient>,
        storage: ObjectStorage,
        ontologies: OntologyRegistry,
        pipeline_services: Arc<dyn PipelineServices>,
        query_services: Arc<dyn QueryServices>,
    ) -> Result<Self, AppError> {
        let stopwords = Arc::new(Stopwords::from_config(config.stopwords_path.as_deref())?);

        let pipeline = Arc::new(IngestionPipeline::new(
            Arc::clone(&db),
            storage.clone(),
            ontologies.clone(),
            pipeline_services,
            config.clone(),
        ));

        let backup = Arc::new(BackupService::new(
            Arc::clone(&db),
            storage.clone(),
            config.backup_retention_count,
        ));

        Ok(Self {
            db,
            storage,
            config: config.clone(),
            ontologies,
            stopwords,
            pipeline,
            query_services,
            backup,
            sessions: SessionRegistry::default(),
            memory_locks: MemoryLocks::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_locks_serialise_and_conflict() {
        let locks = MemoryLocks::default();

        let guard = locks.lock("m1").await;
        assert!(locks.try_lock("m1").await.is_none(), "held lock conflicts");
        assert!(locks.try_lock("m2").await.is_some(), "other memory is free");

        drop(guard);
        assert!(locks.try_lock("m1").await.is_some(), "released lock is free");
    }
}
