use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

stored_object!(Memory, "memory", {
    name: String,
    description: String,
    ontology_name: String
});

/// Per-type record counts for a memory, used by stats and cascade reporting.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct MemoryCounts {
    pub documents: usize,
    pub entities: usize,
    pub relations: usize,
    pub chunks: usize,
}

#[derive(serde::Deserialize)]
struct CountRow {
    count: usize,
}

async fn count_scoped(
    db: &SurrealDbClient,
    table: &str,
    field: &str,
    memory_id: &str,
) -> Result<usize, AppError> {
    let sql = format!("SELECT count() AS count FROM {table} WHERE {field} = $memory_id GROUP ALL");
    let rows: Vec<CountRow> = db
        .client
        .query(sql)
        .bind(("memory_id", memory_id.to_owned()))
        .await?
        .take(0)?;
    Ok(rows.first().map_or(0, |r| r.count))
}

impl Memory {
    pub fn new(memory_id: String, name: String, description: String, ontology_name: String) -> Self {
        let now = Utc::now();
        Self {
            id: memory_id,
            created_at: now,
            updated_at: now,
            name,
            description,
            ontology_name,
        }
    }

    /// Creates the memory node, rejecting duplicates.
    pub async fn create(self, db: &SurrealDbClient) -> Result<Memory, AppError> {
        if db.get_item::<Memory>(&self.id).await?.is_some() {
            return Err(AppError::AlreadyExists(format!("memory {}", self.id)));
        }
        db.store_item(self.clone()).await?;
        Ok(self)
    }

    pub async fn get(db: &SurrealDbClient, memory_id: &str) -> Result<Memory, AppError> {
        db.get_item::<Memory>(memory_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("memory {memory_id}")))
    }

    pub async fn list(db: &SurrealDbClient) -> Result<Vec<Memory>, AppError> {
        let mut memories: Vec<Memory> = db.get_all_stored_items().await?;
        memories.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(memories)
    }

    pub async fn stats(db: &SurrealDbClient, memory_id: &str) -> Result<MemoryCounts, AppError> {
        Memory::get(db, memory_id).await?;
        Ok(MemoryCounts {
            documents: count_scoped(db, "document", "memory_id", memory_id).await?,
            entities: count_scoped(db, "entity", "memory_id", memory_id).await?,
            relations: count_scoped(db, "relates_to", "metadata.memory_id", memory_id).await?,
            chunks: count_scoped(db, "chunk", "memory_id", memory_id).await?,
        })
    }

    /// Removes the memory and everything under it from the graph store.
    /// Object-store cleanup is the caller's responsibility.
    pub async fn delete_cascade(
        db: &SurrealDbClient,
        memory_id: &str,
    ) -> Result<MemoryCounts, AppError> {
        let counts = Memory::stats(db, memory_id).await?;

        db.client
            .query("DELETE relates_to WHERE metadata.memory_id = $memory_id")
            .query("DELETE mentions WHERE memory_id = $memory_id")
            .query("DELETE chunk WHERE memory_id = $memory_id")
            .query("DELETE entity WHERE memory_id = $memory_id")
            .query("DELETE document WHERE memory_id = $memory_id")
            .bind(("memory_id", memory_id.to_owned()))
            .await?
            .check()?;

        db.delete_item::<Memory>(memory_id).await?;

        Ok(counts)
    }
}
