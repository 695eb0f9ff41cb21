use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const SCHEMA_VERSION: u32 = 1;

pub const MANIFEST_FILE: &str = "manifest.json";
pub const GRAPH_FILE: &str = "graph_data.json";
pub const VECTORS_FILE: &str = "vectors.jsonl";
pub const DOCUMENT_KEYS_FILE: &str = "document_keys.json";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupCounts {
    pub entities: usize,
    pub relations: usize,
    pub documents: usize,
    pub chunks: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupManifest {
    pub schema_version: u32,
    pub backup_id: String,
    pub memory_id: String,
    pub created_at: String,
    #[serde(default)]
    pub description: Option<String>,
    pub counts: BackupCounts,
    /// SHA-256 over graph, vectors and document-keys bytes, in that order.
    pub checksum_sha256: String,
    #[serde(default)]
    pub includes_documents: bool,
    /// Digest of the last downloaded archive, recorded after the fact.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archive_sha256: Option<String>,
}

/// Checksum over the three snapshot payloads in fixed order.
pub fn snapshot_checksum(graph: &[u8], vectors: &[u8], document_keys: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(graph);
    hasher.update(vectors);
    hasher.update(document_keys);
    format!("{:x}", hasher.finalize())
}

pub fn bytes_sha256(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}
