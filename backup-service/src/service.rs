use std::collections::HashSet;
use std::sync::Arc;

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        object::{backup_prefix, ObjectStorage},
        types::{
            chunk::Chunk,
            document::Document,
            entity::Entity,
            memory::Memory,
            relation::{Mention, Relation},
        },
    },
};

use crate::manifest::{
    bytes_sha256, snapshot_checksum, BackupCounts, BackupManifest, DOCUMENT_KEYS_FILE, GRAPH_FILE,
    MANIFEST_FILE, SCHEMA_VERSION, VECTORS_FILE,
};

/// Canonical graph snapshot rooted at one memory.
#[derive(Debug, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub memory: Memory,
    pub documents: Vec<Document>,
    pub entities: Vec<Entity>,
    pub relations: Vec<Relation>,
    pub mentions: Vec<Mention>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VectorPayload {
    pub memory_id: String,
    pub document_id: String,
    pub sequence: u32,
    pub token_count: usize,
    #[serde(default)]
    pub section_path: Vec<String>,
    pub text: String,
}

/// One line of `vectors.jsonl`.
#[derive(Debug, Serialize, Deserialize)]
pub struct VectorRecord {
    pub id: String,
    pub payload: VectorPayload,
    pub vector: Vec<f32>,
}

pub struct BackupService {
    pub(crate) db: Arc<SurrealDbClient>,
    storage: ObjectStorage,
    retention_count: usize,
}

impl BackupService {
    pub fn new(db: Arc<SurrealDbClient>, storage: ObjectStorage, retention_count: usize) -> Self {
        Self {
            db,
            storage,
            retention_count: retention_count.max(1),
        }
    }

    pub fn storage(&self) -> &ObjectStorage {
        &self.storage
    }

    /// Snapshots the memory into `_backups/{memory_id}/{timestamp}/` and
    /// enforces retention.
    pub async fn create(
        &self,
        memory_id: &str,
        description: Option<String>,
    ) -> Result<BackupManifest, AppError> {
        let snapshot = self.export_graph(memory_id).await?;
        let chunks = Chunk::export_by_memory(&self.db, memory_id).await?;

        let counts = BackupCounts {
            entities: snapshot.entities.len(),
            relations: snapshot.relations.len(),
            documents: snapshot.documents.len(),
            chunks: chunks.len(),
        };

        let graph_bytes = serde_json::to_vec_pretty(&snapshot)
            .map_err(|e| AppError::Internal(format!("serialising graph snapshot: {e}")))?;
        let vectors_bytes = encode_vectors(&chunks)?;
        let document_keys: Vec<String> =
            snapshot.documents.iter().map(|d| d.object_uri.clone()).collect();
        let keys_bytes = serde_json::to_vec_pretty(&document_keys)
            .map_err(|e| AppError::Internal(format!("serialising document keys: {e}")))?;

        let created_at = Utc::now();
        let timestamp = created_at.format("%Y%m%dT%H%M%S%3fZ").to_string();
        let backup_id = format!("{memory_id}/{timestamp}");

        let manifest = BackupManifest {
            schema_version: SCHEMA_VERSION,
            backup_id: backup_id.clone(),
            memory_id: memory_id.to_string(),
            created_at: created_at.to_rfc3339(),
            description,
            counts,
            checksum_sha256: snapshot_checksum(&graph_bytes, &vectors_bytes, &keys_bytes),
            includes_documents: false,
            archive_sha256: None,
        };
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| AppError::Internal(format!("serialising manifest: {e}")))?;

        let prefix = format!("_backups/{backup_id}/");
        for (name, data) in [
            (MANIFEST_FILE, manifest_bytes),
            (GRAPH_FILE, graph_bytes),
            (VECTORS_FILE, vectors_bytes),
            (DOCUMENT_KEYS_FILE, keys_bytes),
        ] {
            self.storage
                .put(&format!("{prefix}{name}"), Bytes::from(data), "application/json")
                .await?;
        }

        self.enforce_retention(memory_id).await?;

        info!(
            backup_id = %manifest.backup_id,
            entities = counts.entities,
            chunks = counts.chunks,
            "backup created"
        );
        Ok(manifest)
    }

    /// Reads manifests under `_backups/`, optionally scoped to one memory,
    /// newest first.
    pub async fn list(&self, memory_id: Option<&str>) -> Result<Vec<BackupManifest>, AppError> {
        let prefix = match memory_id {
            Some(memory_id) => backup_prefix(memory_id),
            None => "_backups/".to_string(),
        };

        let mut manifests = Vec::new();
        for key in self.storage.list_prefix(&prefix).await? {
            if !key.ends_with(MANIFEST_FILE) {
                continue;
            }
            let bytes = self.storage.get(&key).await?;
            match serde_json::from_slice::<BackupManifest>(&bytes) {
                Ok(manifest) => manifests.push(manifest),
                Err(err) => warn!(%key, error = %err, "skipping unreadable backup manifest"),
            }
        }

        manifests.sort_by(|a, b| b.backup_id.cmp(&a.backup_id));
        Ok(manifests)
    }

    /// Replays a stored backup. The target memory must not exist; a replay
    /// failure deletes the partially-created memory.
    pub async fn restore(&self, backup_id: &str) -> Result<BackupManifest, AppError> {
        let prefix = format!("_backups/{backup_id}/");
        let manifest_bytes = self.storage.get(&format!("{prefix}{MANIFEST_FILE}")).await?;
        let manifest: BackupManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| AppError::InvalidArgument(format!("manifest unreadable: {e}")))?;

        let graph_bytes = self.storage.get(&format!("{prefix}{GRAPH_FILE}")).await?;
        let vectors_bytes = self.storage.get(&format!("{prefix}{VECTORS_FILE}")).await?;

        let snapshot: GraphSnapshot = serde_json::from_slice(&graph_bytes)
            .map_err(|e| AppError::InvalidArgument(format!("graph snapshot unreadable: {e}")))?;
        let records = decode_vectors(&vectors_bytes)?;

        self.replay(&manifest, snapshot, records).await?;
        Ok(manifest)
    }

    /// Deletes a backup's prefix from the object store.
    pub async fn delete(&self, backup_id: &str) -> Result<usize, AppError> {
        Ok(self
            .storage
            .delete_prefix(&format!("_backups/{backup_id}/"))
            .await?)
    }

    pub(crate) async fn export_graph(&self, memory_id: &str) -> Result<GraphSnapshot, AppError> {
        let memory = Memory::get(&self.db, memory_id).await?;
        Ok(GraphSnapshot {
            memory,
            documents: Document::list_by_memory(&self.db, memory_id).await?,
            entities: Entity::list_by_memory(&self.db, memory_id).await?,
            relations: Relation::list_by_memory(&self.db, memory_id).await?,
            mentions: Mention::list_by_memory(&self.db, memory_id).await?,
        })
    }

    /// Graph replay then vector replay, with strict coupling: any failure
    /// tears the new memory down again.
    pub(crate) async fn replay(
        &self,
        manifest: &BackupManifest,
        snapshot: GraphSnapshot,
        records: Vec<VectorRecord>,
    ) -> Result<(), AppError> {
        let memory_id = manifest.memory_id.clone();
        if self.db.get_item::<Memory>(&memory_id).await?.is_some() {
            return Err(AppError::AlreadyExists(format!(
                "memory {memory_id} must not exist before restore"
            )));
        }

        let result = self.replay_inner(&memory_id, snapshot, records).await;
        if let Err(err) = result {
            warn!(memory_id = %memory_id, error = %err, "restore failed, removing partial memory");
            if let Err(cleanup) = Memory::delete_cascade(&self.db, &memory_id).await {
                warn!(error = %cleanup, "cleanup after failed restore also failed");
            }
            return Err(err);
        }

        info!(backup_id = %manifest.backup_id, memory_id = %memory_id, "backup restored");
        Ok(())
    }

    async fn replay_inner(
        &self,
        memory_id: &str,
        snapshot: GraphSnapshot,
        records: Vec<VectorRecord>,
    ) -> Result<(), AppError> {
        self.db.store_item(snapshot.memory).await?;

        for document in &snapshot.documents {
            document.upsert(&self.db).await?;
        }
        for entity in snapshot.entities {
            self.db
                .client
                .query("UPSERT type::thing('entity', $id) CONTENT $entity")
                .bind(("id", entity.id.clone()))
                .bind(("entity", entity))
                .await?
                .check()?;
        }
        for relation in &snapshot.relations {
            relation.merge(&self.db).await?;
        }
        for mention in &snapshot.mentions {
            Mention::link(&self.db, memory_id, &mention.in_, &mention.out).await?;
        }

        let chunks: Vec<Chunk> = records
            .into_iter()
            .map(|record| {
                let now = Utc::now();
                Chunk {
                    id: record.id,
                    created_at: now,
                    updated_at: now,
                    memory_id: record.payload.memory_id,
                    document_id: record.payload.document_id,
                    sequence: record.payload.sequence,
                    token_count: record.payload.token_count,
                    section_path: record.payload.section_path,
                    text: record.payload.text,
                    embedding: record.vector,
                }
            })
            .collect();
        Chunk::insert_batch(&self.db, &chunks).await?;

        Ok(())
    }

    /// Keeps the `retention_count` most recent backups of a memory.
    async fn enforce_retention(&self, memory_id: &str) -> Result<(), AppError> {
        let prefix = backup_prefix(memory_id);
        let keys = self.storage.list_prefix(&prefix).await?;

        let mut timestamps: Vec<String> = keys
            .iter()
            .filter_map(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|rest| rest.split('/').next())
                    .map(str::to_string)
            })
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        timestamps.sort();

        while timestamps.len() > self.retention_count {
            let oldest = timestamps.remove(0);
            let removed = self
                .storage
                .delete_prefix(&format!("{prefix}{oldest}/"))
                .await?;
            info!(memory_id, backup = %oldest, objects = removed, "retention removed old backup");
        }

        Ok(())
    }
}

pub(crate) fn encode_vectors(chunks: &[Chunk]) -> Result<Vec<u8>, AppError> {
    let mut out = Vec::new();
    for chunk in chunks {
        let record = VectorRecord {
            id: chunk.id.clone(),
            payload: VectorPayload {
                memory_id: chunk.memory_id.clone(),
                document_id: chunk.document_id.clone(),
                sequence: chunk.sequence,
                token_count: chunk.token_count,
                section_path: chunk.section_path.clone(),
                text: chunk.text.clone(),
            },
            vector: chunk.embedding.clone(),
        };
        let line = serde_json::to_vec(&record)
            .map_err(|e| AppError::Internal(format!("serialising vector record: {e}")))?;
        out.extend_from_slice(&line);
        out.push(b'\n');
    }
    Ok(out)
}

pub(crate) fn decode_vectors(bytes: &[u8]) -> Result<Vec<VectorRecord>, AppError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|e| AppError::InvalidArgument(format!("vectors file is not UTF-8: {e}")))?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            serde_json::from_str::<VectorRecord>(line)
                .map_err(|e| AppError::InvalidArgument(format!("vector record unreadable: {e}")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::StorageKind;
    use common::storage::indexes::ensure_vector_index;
    use object_store::memory::InMemory;
    use uuid::Uuid;

    async fn setup() -> (BackupService, Arc<SurrealDbClient>, ObjectStorage) {
        let database = &Uuid::new_v4().to_string();
        let db = Arc::new(
            SurrealDbClient::memory("test_ns", database)
                .await
                .expect("Failed to start in-memory surrealdb"),
        );
        ensure_vector_index(&db, 3).await.expect("vector index");
        let storage = ObjectStorage::with_backend(Arc::new(InMemory::new()), StorageKind::Memory);
        (
            BackupService::new(Arc::clone(&db), storage.clone(), 2),
            db,
            storage,
        )
    }

    async fn seed_memory(db: &SurrealDbClient, storage: &ObjectStorage, memory_id: &str) {
        Memory::new(
            memory_id.into(),
            "Legal".into(),
            String::new(),
            "legal".into(),
        )
        .create(db)
        .await
        .expect("memory");

        let mut document = Document::new(
            memory_id.into(),
            "contrat.md".into(),
            "hash1".into(),
            42,
            "text/markdown".into(),
            format!("memories/{memory_id}/documents/d1"),
            None,
            None,
            42,
        );
        document.id = "d1".into();
        document.upsert(db).await.expect("document");
        storage
            .put(&document.object_uri, Bytes::from_static(b"raw bytes"), "text/markdown")
            .await
            .expect("object");

        let (a, _) = Entity::merge_into(db, memory_id, "Cloud Temple", "Organization", "x", 2, "d1")
            .await
            .expect("entity a");
        let (b, _) = Entity::merge_into(db, memory_id, "Acme", "Organization", "y", 1, "d1")
            .await
            .expect("entity b");
        Relation::new(
            a.id.clone(),
            b.id.clone(),
            memory_id.into(),
            "SIGNED_BY".into(),
            String::new(),
            "d1".into(),
        )
        .merge(db)
        .await
        .expect("relation");
        Mention::link(db, memory_id, "d1", &a.id).await.expect("mention a");
        Mention::link(db, memory_id, "d1", &b.id).await.expect("mention b");

        Chunk::insert_batch(
            db,
            &[Chunk::new(
                memory_id.into(),
                "d1".into(),
                0,
                12,
                vec![],
                "Cloud Temple signe avec Acme.".into(),
                vec![0.25, 0.5, 0.75],
            )],
        )
        .await
        .expect("chunk");
    }

    #[tokio::test]
    async fn backup_roundtrip_restores_counts_and_vectors() {
        let (service, db, storage) = setup().await;
        seed_memory(&db, &storage, "legal").await;

        let before = Memory::stats(&db, "legal").await.expect("stats before");
        let original_chunks = Chunk::export_by_memory(&db, "legal").await.expect("chunks");

        let manifest = service
            .create("legal", Some("test".into()))
            .await
            .expect("backup");
        assert_eq!(manifest.counts.entities, 2);
        assert_eq!(manifest.counts.chunks, 1);

        Memory::delete_cascade(&db, "legal").await.expect("delete");
        assert!(db.get_item::<Memory>("legal").await.expect("get").is_none());

        service.restore(&manifest.backup_id).await.expect("restore");

        let after = Memory::stats(&db, "legal").await.expect("stats after");
        assert_eq!(before, after);

        let restored_chunks = Chunk::export_by_memory(&db, "legal").await.expect("chunks");
        assert_eq!(restored_chunks.len(), original_chunks.len());
        assert_eq!(restored_chunks[0].embedding, original_chunks[0].embedding);
        assert_eq!(restored_chunks[0].text, original_chunks[0].text);
    }

    #[tokio::test]
    async fn restore_refuses_existing_memory() {
        let (service, db, storage) = setup().await;
        seed_memory(&db, &storage, "legal").await;

        let manifest = service.create("legal", None).await.expect("backup");
        let err = service.restore(&manifest.backup_id).await.unwrap_err();
        assert!(matches!(err, AppError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn list_is_scoped_and_newest_first() {
        let (service, db, storage) = setup().await;
        seed_memory(&db, &storage, "legal").await;

        let first = service.create("legal", None).await.expect("backup 1");
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = service.create("legal", None).await.expect("backup 2");

        let listed = service.list(Some("legal")).await.expect("list");
        assert_eq!(listed.len(), 2);
        assert_eq!(listed[0].backup_id, second.backup_id);
        assert_eq!(listed[1].backup_id, first.backup_id);

        let other = service.list(Some("nothing")).await.expect("list other");
        assert!(other.is_empty());
    }

    #[tokio::test]
    async fn retention_drops_oldest_backups() {
        let (service, db, storage) = setup().await;
        seed_memory(&db, &storage, "legal").await;

        let mut ids = Vec::new();
        for _ in 0..4 {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            ids.push(service.create("legal", None).await.expect("backup").backup_id);
        }

        let listed = service.list(Some("legal")).await.expect("list");
        assert_eq!(listed.len(), 2, "retention_count is 2");
        assert_eq!(listed[0].backup_id, ids[3]);
        assert_eq!(listed[1].backup_id, ids[2]);
    }

    #[tokio::test]
    async fn delete_removes_the_backup_prefix() {
        let (service, db, storage) = setup().await;
        seed_memory(&db, &storage, "legal").await;

        let manifest = service.create("legal", None).await.expect("backup");
        let removed = service.delete(&manifest.backup_id).await.expect("delete");
        assert_eq!(removed, 4);

        let listed = service.list(Some("legal")).await.expect("list");
        assert!(listed.is_empty());
    }

    #[test]
    fn vectors_roundtrip_exactly() {
        let chunk = Chunk::new(
            "m".into(),
            "d".into(),
            3,
            7,
            vec!["S".into()],
            "texte".into(),
            vec![0.1, -0.2, 0.3],
        );
        let encoded = encode_vectors(std::slice::from_ref(&chunk)).expect("encode");
        let decoded = decode_vectors(&encoded).expect("decode");
        assert_eq!(decoded.len(), 1);
        assert_eq!(decoded[0].id, chunk.id);
        assert_eq!(decoded[0].vector, chunk.embedding);
        assert_eq!(decoded[0].payload.sequence, 3);
    }
}
