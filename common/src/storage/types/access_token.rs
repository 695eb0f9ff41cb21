use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::{error::AppError, storage::db::SurrealDbClient, stored_object};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    Read,
    Write,
    Admin,
}

impl Permission {
    /// Whether a held permission satisfies a required one. Admin covers
    /// everything, write covers read.
    pub fn satisfies(self, required: Permission) -> bool {
        match required {
            Permission::Read => true,
            Permission::Write => matches!(self, Permission::Write | Permission::Admin),
            Permission::Admin => matches!(self, Permission::Admin),
        }
    }
}

stored_object!(AccessToken, "system_token", {
    client_name: String,
    email: Option<String>,
    permissions: Vec<Permission>,
    memory_ids: Vec<String>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    expires_at: Option<DateTime<Utc>>,
    #[serde(
        serialize_with = "serialize_option_datetime",
        deserialize_with = "deserialize_option_datetime",
        default
    )]
    revoked_at: Option<DateTime<Utc>>
});

/// The authenticated caller a tool invocation runs as.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct Principal {
    pub client_name: String,
    pub permissions: Vec<Permission>,
    /// Empty means unrestricted.
    pub memory_ids: Vec<String>,
}

impl Principal {
    /// The configured bootstrap key acts as an unrestricted admin, available
    /// before any token exists.
    pub fn bootstrap() -> Self {
        Self {
            client_name: "bootstrap-admin".to_string(),
            permissions: vec![Permission::Admin],
            memory_ids: Vec::new(),
        }
    }

    pub fn can(&self, required: Permission) -> bool {
        self.permissions.iter().any(|p| p.satisfies(required))
    }

    pub fn allows_memory(&self, memory_id: &str) -> bool {
        self.memory_ids.is_empty() || self.memory_ids.iter().any(|m| m == memory_id)
    }
}

pub fn hash_token(raw: &str) -> String {
    let digest = Sha256::digest(raw.as_bytes());
    format!("{digest:x}")
}

/// How `update_token` mutates `memory_ids`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryScopeAction {
    Add,
    Remove,
    Set,
}

impl AccessToken {
    /// Creates a token node and returns `(raw_token, record)`. The raw token
    /// is shown once and never persisted.
    pub async fn create(
        db: &SurrealDbClient,
        client_name: String,
        email: Option<String>,
        permissions: Vec<Permission>,
        memory_ids: Vec<String>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<(String, AccessToken), AppError> {
        if permissions.is_empty() {
            return Err(AppError::InvalidArgument(
                "a token needs at least one permission".to_string(),
            ));
        }

        let raw = format!(
            "gmk_{}{}",
            Uuid::new_v4().simple(),
            Uuid::new_v4().simple()
        );
        let now = Utc::now();
        let token = AccessToken {
            id: hash_token(&raw),
            created_at: now,
            updated_at: now,
            client_name,
            email,
            permissions,
            memory_ids,
            expires_at,
            revoked_at: None,
        };

        db.store_item(token.clone()).await?;
        Ok((raw, token))
    }

    pub async fn find_by_raw(
        db: &SurrealDbClient,
        raw: &str,
    ) -> Result<Option<AccessToken>, AppError> {
        Ok(db.get_item::<AccessToken>(&hash_token(raw)).await?)
    }

    pub async fn list(db: &SurrealDbClient) -> Result<Vec<AccessToken>, AppError> {
        let mut tokens: Vec<AccessToken> = db.get_all_stored_items().await?;
        tokens.sort_by(|a, b| a.client_name.cmp(&b.client_name));
        Ok(tokens)
    }

    pub async fn revoke(db: &SurrealDbClient, token_hash: &str) -> Result<AccessToken, AppError> {
        let mut token = db
            .get_item::<AccessToken>(token_hash)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("token {token_hash}")))?;
        if token.revoked_at.is_none() {
            token.revoked_at = Some(Utc::now());
            token.updated_at = Utc::now();
            db.client
                .query("UPSERT type::thing('system_token', $id) CONTENT $token")
                .bind(("id", token.id.clone()))
                .bind(("token", token.clone()))
                .await?
                .check()?;
        }
        Ok(token)
    }

    pub async fn update_memory_scope(
        db: &SurrealDbClient,
        token_hash: &str,
        action: MemoryScopeAction,
        memory_ids: Vec<String>,
    ) -> Result<AccessToken, AppError> {
        let mut token = db
            .get_item::<AccessToken>(token_hash)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("token {token_hash}")))?;

        match action {
            MemoryScopeAction::Add => {
                for id in memory_ids {
                    if !token.memory_ids.contains(&id) {
                        token.memory_ids.push(id);
                    }
                }
            }
            MemoryScopeAction::Remove => {
                token.memory_ids.retain(|id| !memory_ids.contains(id));
            }
            MemoryScopeAction::Set => token.memory_ids = memory_ids,
        }
        token.updated_at = Utc::now();

        db.client
            .query("UPSERT type::thing('system_token', $id) CONTENT $token")
            .bind(("id", token.id.clone()))
            .bind(("token", token.clone()))
            .await?
            .check()?;
        Ok(token)
    }

    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        if self.revoked_at.is_some() {
            return false;
        }
        match self.expires_at {
            Some(expires) => now < expires,
            None => true,
        }
    }

    pub fn principal(&self) -> Principal {
        Principal {
            client_name: self.client_name.clone(),
            permissions: self.permissions.clone(),
            memory_ids: self.memory_ids.clone(),
        }
    }

    /// Token metadata safe to return to admins (no raw token exists anymore).
    pub fn describe(&self) -> serde_json::Value {
        serde_json::json!({
            "token_hash": self.id,
            "client_name": self.client_name,
            "email": self.email,
            "permissions": self.permissions,
            "memory_ids": self.memory_ids,
            "created_at": self.created_at.to_rfc3339(),
            "expires_at": self.expires_at.map(|d| d.to_rfc3339()),
            "revoked_at": self.revoked_at.map(|d| d.to_rfc3339()),
        })
    }
}
