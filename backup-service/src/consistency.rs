use std::collections::HashSet;

use serde::Serialize;
use tracing::info;

use common::{
    error::AppError,
    storage::{
        db::SurrealDbClient,
        object::{memory_prefix, ObjectStorage},
        types::document::Document,
    },
};

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StorageReport {
    pub scanned_keys: usize,
    pub known_uris: usize,
    pub orphans: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct CleanupReport {
    pub dry_run: bool,
    pub orphans: Vec<String>,
    pub deleted: usize,
}

/// Compares object-store keys under `memories/` against the graph's
/// `object_uri` set. The known set always spans *all* memories, so a
/// document of another memory is never flagged when the scan is scoped.
/// Backup keys live under `_backups/` and are out of scope by construction.
pub async fn storage_check(
    db: &SurrealDbClient,
    storage: &ObjectStorage,
    memory_id: Option<&str>,
) -> Result<StorageReport, AppError> {
    let prefix = match memory_id {
        Some(memory_id) => memory_prefix(memory_id),
        None => "memories/".to_string(),
    };

    let keys = storage.list_prefix(&prefix).await?;
    let known: HashSet<String> = Document::all_object_uris(db).await?.into_iter().collect();

    let orphans: Vec<String> = keys
        .iter()
        .filter(|key| !known.contains(*key))
        .cloned()
        .collect();

    info!(
        %prefix,
        scanned = keys.len(),
        known = known.len(),
        orphans = orphans.len(),
        "storage check finished"
    );

    Ok(StorageReport {
        scanned_keys: keys.len(),
        known_uris: known.len(),
        orphans,
    })
}

/// Deletes detected orphans; dry-run reports without deleting. Idempotent.
pub async fn storage_cleanup(
    db: &SurrealDbClient,
    storage: &ObjectStorage,
    memory_id: Option<&str>,
    dry_run: bool,
) -> Result<CleanupReport, AppError> {
    let report = storage_check(db, storage, memory_id).await?;

    let mut deleted = 0;
    if !dry_run {
        for key in &report.orphans {
            storage.delete(key).await?;
            deleted += 1;
        }
        info!(deleted, "storage cleanup removed orphans");
    }

    Ok(CleanupReport {
        dry_run,
        orphans: report.orphans,
        deleted,
    })
}
