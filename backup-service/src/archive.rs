use std::collections::HashMap;
use std::io::{Read, Write};

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use common::error::AppError;

use crate::manifest::{
    bytes_sha256, snapshot_checksum, BackupManifest, DOCUMENT_KEYS_FILE, GRAPH_FILE, MANIFEST_FILE,
    VECTORS_FILE,
};
use crate::service::{decode_vectors, BackupService, GraphSnapshot};

const DOCUMENTS_DIR: &str = "documents/";

impl BackupService {
    /// Packages a stored backup as a gzip'd tar archive. With
    /// `include_documents` the raw document bytes come along under
    /// `documents/`. Returns the archive and its SHA-256; the digest is also
    /// recorded in the stored manifest.
    pub async fn download(
        &self,
        backup_id: &str,
        include_documents: bool,
    ) -> Result<(Vec<u8>, String), AppError> {
        let prefix = format!("_backups/{backup_id}/");

        let manifest_bytes = self.storage().get(&format!("{prefix}{MANIFEST_FILE}")).await?;
        let mut manifest: BackupManifest = serde_json::from_slice(&manifest_bytes)
            .map_err(|e| AppError::InvalidArgument(format!("manifest unreadable: {e}")))?;
        let graph_bytes = self.storage().get(&format!("{prefix}{GRAPH_FILE}")).await?;
        let vectors_bytes = self.storage().get(&format!("{prefix}{VECTORS_FILE}")).await?;
        let keys_bytes = self
            .storage()
            .get(&format!("{prefix}{DOCUMENT_KEYS_FILE}"))
            .await?;

        let mut archived_manifest = manifest.clone();
        archived_manifest.includes_documents = include_documents;
        archived_manifest.archive_sha256 = None;
        let archived_manifest_bytes = serde_json::to_vec_pretty(&archived_manifest)
            .map_err(|e| AppError::Internal(format!("serialising manifest: {e}")))?;

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        append_entry(&mut builder, MANIFEST_FILE, &archived_manifest_bytes)?;
        append_entry(&mut builder, GRAPH_FILE, &graph_bytes)?;
        append_entry(&mut builder, VECTORS_FILE, &vectors_bytes)?;
        append_entry(&mut builder, DOCUMENT_KEYS_FILE, &keys_bytes)?;

        if include_documents {
            let keys: Vec<String> = serde_json::from_slice(&keys_bytes)
                .map_err(|e| AppError::InvalidArgument(format!("document keys unreadable: {e}")))?;
            for key in keys {
                let document_id = key.rsplit('/').next().unwrap_or(&key).to_string();
                let bytes = self.storage().get(&key).await?;
                append_entry(
                    &mut builder,
                    &format!("{DOCUMENTS_DIR}{document_id}"),
                    &bytes,
                )?;
            }
        }

        let encoder = builder
            .into_inner()
            .map_err(|e| AppError::Internal(format!("finalising archive: {e}")))?;
        let archive = encoder
            .finish()
            .map_err(|e| AppError::Internal(format!("compressing archive: {e}")))?;
        let digest = bytes_sha256(&archive);

        manifest.archive_sha256 = Some(digest.clone());
        let updated = serde_json::to_vec_pretty(&manifest)
            .map_err(|e| AppError::Internal(format!("serialising manifest: {e}")))?;
        self.storage()
            .put(
                &format!("{prefix}{MANIFEST_FILE}"),
                Bytes::from(updated),
                "application/json",
            )
            .await?;

        info!(backup_id, bytes = archive.len(), include_documents, "backup archive built");
        Ok((archive, digest))
    }

    /// Restores a memory from an uploaded archive: validates the snapshot
    /// checksum, re-uploads any bundled documents, replays graph then
    /// vectors.
    pub async fn restore_archive(&self, archive: &[u8]) -> Result<BackupManifest, AppError> {
        let entries = read_archive(archive)?;

        let manifest_bytes = entries
            .get(MANIFEST_FILE)
            .ok_or_else(|| AppError::InvalidArgument("archive has no manifest.json".into()))?;
        let manifest: BackupManifest = serde_json::from_slice(manifest_bytes)
            .map_err(|e| AppError::InvalidArgument(format!("manifest unreadable: {e}")))?;

        let graph_bytes = entries
            .get(GRAPH_FILE)
            .ok_or_else(|| AppError::InvalidArgument("archive has no graph_data.json".into()))?;
        let vectors_bytes = entries
            .get(VECTORS_FILE)
            .ok_or_else(|| AppError::InvalidArgument("archive has no vectors.jsonl".into()))?;
        let keys_bytes = entries
            .get(DOCUMENT_KEYS_FILE)
            .ok_or_else(|| AppError::InvalidArgument("archive has no document_keys.json".into()))?;

        let checksum = snapshot_checksum(graph_bytes, vectors_bytes, keys_bytes);
        if checksum != manifest.checksum_sha256 {
            return Err(AppError::InvalidArgument(format!(
                "archive checksum mismatch: manifest says {}, content hashes to {checksum}",
                manifest.checksum_sha256
            )));
        }

        let document_entries: Vec<(&String, &Vec<u8>)> = entries
            .iter()
            .filter(|(name, _)| name.starts_with(DOCUMENTS_DIR))
            .collect();
        if manifest.includes_documents && document_entries.is_empty() {
            return Err(AppError::InvalidArgument(
                "manifest claims bundled documents but the archive has none".into(),
            ));
        }

        let snapshot: GraphSnapshot = serde_json::from_slice(graph_bytes)
            .map_err(|e| AppError::InvalidArgument(format!("graph snapshot unreadable: {e}")))?;
        let records = decode_vectors(vectors_bytes)?;

        if self
            .db
            .get_item::<common::storage::types::memory::Memory>(&manifest.memory_id)
            .await?
            .is_some()
        {
            return Err(AppError::AlreadyExists(format!(
                "memory {} must not exist before restore",
                manifest.memory_id
            )));
        }

        // Re-upload bundled documents before the graph points at them.
        for (name, bytes) in document_entries {
            let document_id = name.trim_start_matches(DOCUMENTS_DIR);
            let document = snapshot
                .documents
                .iter()
                .find(|d| d.id == document_id)
                .ok_or_else(|| {
                    AppError::InvalidArgument(format!(
                        "archive bundles unknown document {document_id}"
                    ))
                })?;
            self.storage()
                .put(
                    &document.object_uri,
                    Bytes::from(bytes.clone()),
                    &document.content_type,
                )
                .await?;
        }

        self.replay(&manifest, snapshot, records).await?;
        Ok(manifest)
    }
}

fn append_entry<W: Write>(
    builder: &mut tar::Builder<W>,
    name: &str,
    data: &[u8],
) -> Result<(), AppError> {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder
        .append_data(&mut header, name, data)
        .map_err(|e| AppError::Internal(format!("writing archive entry {name}: {e}")))
}

fn read_archive(archive: &[u8]) -> Result<HashMap<String, Vec<u8>>, AppError> {
    let mut entries = HashMap::new();
    let mut tar = tar::Archive::new(GzDecoder::new(archive));
    let iter = tar
        .entries()
        .map_err(|e| AppError::InvalidArgument(format!("archive unreadable: {e}")))?;
    for entry in iter {
        let mut entry =
            entry.map_err(|e| AppError::InvalidArgument(format!("archive entry broken: {e}")))?;
        let name = entry
            .path()
            .map_err(|e| AppError::InvalidArgument(format!("archive entry path: {e}")))?
            .to_string_lossy()
            .into_owned();
        let mut data = Vec::new();
        entry
            .read_to_end(&mut data)
            .map_err(|e| AppError::InvalidArgument(format!("archive entry read: {e}")))?;
        entries.insert(name, data);
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::StorageKind;
    use common::storage::db::SurrealDbClient;
    use common::storage::indexes::ensure_vector_index;
    use common::storage::object::ObjectStorage;
    use common::storage::types::{
        chunk::Chunk, document::Document, entity::Entity, memory::Memory,
    };
    use object_store::memory::InMemory;
    use std::sync::Arc;
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
            BackupService::new(Arc::clone(&db), storage.clone(), 5),
            db,
            storage,
        )
    }

    async fn seed(db: &SurrealDbClient, storage: &ObjectStorage) {
        Memory::new("legal".into(), "Legal".into(), String::new(), "legal".into())
            .create(db)
            .await
            .expect("memory");

        let mut document = Document::new(
            "legal".into(),
            "contrat.md".into(),
            "hash1".into(),
            9,
            "text/markdown".into(),
            "memories/legal/documents/d1".into(),
            None,
            None,
            9,
        );
        document.id = "d1".into();
        document.upsert(db).await.expect("document");
        storage
            .put(&document.object_uri, Bytes::from_static(b"raw bytes"), "text/markdown")
            .await
            .expect("object");

        Entity::merge_into(db, "legal", "Cloud Temple", "Organization", "x", 1, "d1")
            .await
            .expect("entity");

        Chunk::insert_batch(
            db,
            &[Chunk::new(
                "legal".into(),
                "d1".into(),
                0,
                5,
                vec![],
                "Cloud Temple signe.".into(),
                vec![0.5, 0.5, 0.0],
            )],
        )
        .await
        .expect("chunk");
    }

    #[tokio::test]
    async fn archive_roundtrip_with_documents() {
        let (service, db, storage) = setup().await;
        seed(&db, &storage).await;

        let before = Memory::stats(&db, "legal").await.expect("stats");
        let manifest = service.create("legal", None).await.expect("backup");

        let (archive, digest) = service
            .download(&manifest.backup_id, true)
            .await
            .expect("download");
        assert_eq!(digest, bytes_sha256(&archive));

        // The stored manifest now records the archive digest.
        let stored = service
            .list(Some("legal"))
            .await
            .expect("list")
            .remove(0);
        assert_eq!(stored.archive_sha256, Some(digest));

        // Wipe everything, including the object store.
        Memory::delete_cascade(&db, "legal").await.expect("delete memory");
        service.delete(&manifest.backup_id).await.expect("delete backup");
        storage
            .delete_prefix("memories/legal/")
            .await
            .expect("delete objects");

        let restored = service.restore_archive(&archive).await.expect("restore");
        assert_eq!(restored.memory_id, "legal");

        let after = Memory::stats(&db, "legal").await.expect("stats");
        assert_eq!(before, after);

        let raw = storage
            .get("memories/legal/documents/d1")
            .await
            .expect("document bytes back in object store");
        assert_eq!(raw.as_ref(), b"raw bytes");
    }

    #[tokio::test]
    async fn archive_without_documents_restores_graph_only() {
        let (service, db, storage) = setup().await;
        seed(&db, &storage).await;

        let manifest = service.create("legal", None).await.expect("backup");
        let (archive, _) = service
            .download(&manifest.backup_id, false)
            .await
            .expect("download");

        Memory::delete_cascade(&db, "legal").await.expect("delete memory");
        service.restore_archive(&archive).await.expect("restore");

        let stats = Memory::stats(&db, "legal").await.expect("stats");
        assert_eq!(stats.entities, 1);
        assert_eq!(stats.chunks, 1);
    }

    #[tokio::test]
    async fn tampered_archive_is_rejected() {
        let (service, db, storage) = setup().await;
        seed(&db, &storage).await;

        let manifest = service.create("legal", None).await.expect("backup");
        let (archive, _) = service
            .download(&manifest.backup_id, false)
            .await
            .expect("download");

        // Rebuild the archive with altered graph data but the old manifest.
        let mut entries = read_archive(&archive).expect("read");
        let graph = entries.get_mut(GRAPH_FILE).expect("graph entry");
        graph.extend_from_slice(b" ");

        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, data) in &entries {
            append_entry(&mut builder, name, data).expect("append");
        }
        let tampered = builder
            .into_inner()
            .expect("inner")
            .finish()
            .expect("finish");

        let err = service.restore_archive(&tampered).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        assert!(err.to_string().contains("checksum"));
    }

    #[tokio::test]
    async fn manifest_claiming_documents_without_entries_fails() {
        let (service, db, storage) = setup().await;
        seed(&db, &storage).await;

        let manifest = service.create("legal", None).await.expect("backup");
        let (archive, _) = service
            .download(&manifest.backup_id, true)
            .await
            .expect("download");

        // Strip the documents/ entries while keeping the claiming manifest.
        let entries = read_archive(&archive).expect("read");
        let mut builder = tar::Builder::new(GzEncoder::new(Vec::new(), Compression::default()));
        for (name, data) in entries
            .iter()
            .filter(|(name, _)| !name.starts_with(DOCUMENTS_DIR))
        {
            append_entry(&mut builder, name, data).expect("append");
        }
        let stripped = builder
            .into_inner()
            .expect("inner")
            .finish()
            .expect("finish");

        Memory::delete_cascade(&db, "legal").await.expect("delete memory");
        let err = service.restore_archive(&stripped).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidArgument(_)));
        assert!(err.to_string().contains("bundled documents"));
    }
}
