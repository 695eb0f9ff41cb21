use std::ops::Deref;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use surrealdb::{
    engine::any::{connect, Any},
    opt::auth::Root,
    Error, Surreal,
};

use super::indexes;
use super::types::StoredObject;
use crate::error::AppError;

#[derive(Clone)]
pub struct SurrealDbClient {
    pub client: Surreal<Any>,
    /// Set once the lazy entity search index has been defined.
    pub(crate) search_index_ready: Arc<AtomicBool>,
}

impl SurrealDbClient {
    pub async fn new(
        address: &str,
        username: &str,
        password: &str,
        namespace: &str,
        database: &str,
    ) -> Result<Self, Error> {
        let db = connect(address).await?;

        db.signin(Root { username, password }).await?;
        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient {
            client: db,
            search_index_ready: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Defines the schema-level indexes the service relies on. Idempotent.
    pub async fn ensure_initialized(&self, embedding_dimensions: usize) -> Result<(), AppError> {
        indexes::ensure_vector_index(self, embedding_dimensions).await?;
        indexes::ensure_lookup_indexes(self).await?;
        Ok(())
    }

    /// Operation to store an object, requires the struct to implement StoredObject
    pub async fn store_item<T>(&self, item: T) -> Result<Option<T>, Error>
    where
        T: StoredObject + Send + Sync + 'static,
    {
        self.client
            .create((T::table_name(), item.get_id()))
            .content(item)
            .await
    }

    pub async fn get_all_stored_items<T>(&self) -> Result<Vec<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select(T::table_name()).await
    }

    pub async fn get_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.select((T::table_name(), id)).await
    }

    pub async fn delete_item<T>(&self, id: &str) -> Result<Option<T>, Error>
    where
        T: for<'de> StoredObject,
    {
        self.client.delete((T::table_name(), id)).await
    }

    /// Cheap connectivity probe used by health reporting.
    pub async fn ping(&self) -> Result<(), Error> {
        self.client.query("RETURN 1").await?.check()?;
        Ok(())
    }
}

impl Deref for SurrealDbClient {
    type Target = Surreal<Any>;

    fn deref(&self) -> &Self::Target {
        &self.client
    }
}

#[cfg(any(test, feature = "test-utils"))]
impl SurrealDbClient {
    /// Create an in-memory SurrealDB client for testing.
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, Error> {
        let db = connect("mem://").await?;

        db.use_ns(namespace).use_db(database).await?;

        Ok(SurrealDbClient {
            client: db,
            search_index_ready: Arc::new(AtomicBool::new(false)),
        })
    }
}
