use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};

use backup_service::{storage_check, storage_cleanup};
use common::{
    error::AppError,
    ontology::OntologyRegistry,
    storage::{
        object,
        types::{
            access_token::{AccessToken, MemoryScopeAction, Permission, Principal},
            document::Document,
            entity::Entity,
            memory::Memory,
            relation::Relation,
        },
    },
    utils::progress::ProgressSink,
};
use ingestion_pipeline::IngestionRequest;
use retrieval_pipeline::{
    graph_search::search_entities, memory_query, question_answer, RetrievalConfig,
};

use crate::api_state::ApiState;

fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, AppError> {
    serde_json::from_value(args)
        .map_err(|e| AppError::InvalidArgument(format!("bad tool arguments: {e}")))
}

fn to_value<T: serde::Serialize>(value: &T) -> Result<Value, AppError> {
    serde_json::to_value(value).map_err(|e| AppError::Internal(format!("serialising result: {e}")))
}

fn retrieval_config(state: &ApiState, limit: Option<usize>) -> RetrievalConfig {
    let mut config = RetrievalConfig::from_app_config(&state.config);
    if let Some(limit) = limit {
        config.limit = limit;
    }
    config
}

/// Executes a registered tool. Authorisation already happened in the
/// dispatcher.
pub async fn invoke(
    state: &ApiState,
    principal: &Principal,
    name: &str,
    args: Value,
    progress: &ProgressSink,
) -> Result<Value, AppError> {
    match name {
        "memory_create" => memory_create(state, args).await,
        "memory_delete" => memory_delete(state, args).await,
        "memory_list" => memory_list(state, principal).await,
        "memory_stats" => memory_stats(state, args).await,
        "memory_graph" => memory_graph(state, args).await,
        "memory_ingest" => memory_ingest(state, args, progress).await,
        "memory_search" => memory_search(state, args).await,
        "memory_get_context" => memory_get_context(state, args).await,
        "question_answer" => run_question_answer(state, args).await,
        "memory_query" => run_memory_query(state, args).await,
        "document_list" => document_list(state, args).await,
        "document_get" => document_get(state, args).await,
        "document_delete" => document_delete(state, args).await,
        "ontology_list" => ontology_list(&state.ontologies),
        "storage_check" => run_storage_check(state, args).await,
        "storage_cleanup" => run_storage_cleanup(state, args).await,
        "backup_create" => backup_create(state, args).await,
        "backup_list" => backup_list(state, args).await,
        "backup_restore" => backup_restore(state, args).await,
        "backup_download" => backup_download(state, args).await,
        "backup_delete" => backup_delete(state, args).await,
        "backup_restore_archive" => backup_restore_archive(state, args).await,
        "admin_create_token" => admin_create_token(state, args).await,
        "admin_list_tokens" => admin_list_tokens(state).await,
        "admin_revoke_token" => admin_revoke_token(state, args).await,
        "admin_update_token" => admin_update_token(state, args).await,
        "system_health" => system_health(state).await,
        other => Err(AppError::NotFound(format!("tool {other}"))),
    }
}

#[derive(Deserialize)]
struct MemoryCreateArgs {
    memory_id: String,
    name: String,
    #[serde(default)]
    description: String,
    ontology: String,
}

async fn memory_create(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: MemoryCreateArgs = parse_args(args)?;
    if state.ontologies.get(&args.ontology).is_none() {
        return Err(AppError::InvalidArgument(format!(
            "unknown ontology {}",
            args.ontology
        )));
    }

    let memory = Memory::new(args.memory_id, args.name, args.description, args.ontology)
        .create(&state.db)
        .await?;
    Ok(json!({ "created": true, "memory_id": memory.id }))
}

#[derive(Deserialize)]
struct MemoryIdArgs {
    memory_id: String,
}

async fn memory_delete(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: MemoryIdArgs = parse_args(args)?;
    let counts = Memory::delete_cascade(&state.db, &args.memory_id).await?;
    state
        .storage
        .delete_prefix(&object::memory_prefix(&args.memory_id))
        .await?;
    to_value(&counts)
}

async fn memory_list(state: &ApiState, principal: &Principal) -> Result<Value, AppError> {
    let memories = Memory::list(&state.db).await?;
    let visible: Vec<Value> = memories
        .into_iter()
        .filter(|m| principal.allows_memory(&m.id))
        .map(|m| {
            json!({
                "memory_id": m.id,
                "name": m.name,
                "description": m.description,
                "ontology_name": m.ontology_name,
                "created_at": m.created_at.to_rfc3339(),
            })
        })
        .collect();
    Ok(json!({ "memories": visible }))
}

async fn memory_stats(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: MemoryIdArgs = parse_args(args)?;
    let counts = Memory::stats(&state.db, &args.memory_id).await?;
    to_value(&counts)
}

async fn memory_graph(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: MemoryIdArgs = parse_args(args)?;
    let memory = Memory::get(&state.db, &args.memory_id).await?;
    let entities = Entity::list_by_memory(&state.db, &args.memory_id).await?;
    let relations = Relation::list_by_memory(&state.db, &args.memory_id).await?;
    let documents = Document::list_by_memory(&state.db, &args.memory_id).await?;

    Ok(json!({
        "memory_id": memory.id,
        "nodes": to_value(&entities)?,
        "edges": to_value(&relations)?,
        "documents": to_value(&documents)?,
    }))
}

#[derive(Deserialize)]
struct IngestArgs {
    memory_id: String,
    filename: String,
    content_base64: String,
    #[serde(default)]
    force: bool,
    #[serde(default)]
    source_path: Option<String>,
    #[serde(default)]
    source_modified_at: Option<String>,
}

async fn memory_ingest(
    state: &ApiState,
    args: Value,
    progress: &ProgressSink,
) -> Result<Value, AppError> {
    let args: IngestArgs = parse_args(args)?;
    let bytes = BASE64
        .decode(args.content_base64.as_bytes())
        .map_err(|e| AppError::InvalidArgument(format!("content_base64 is not base64: {e}")))?;

    // Writers on a memory are serialised; concurrent ingests queue here.
    let _guard = state.memory_locks.lock(&args.memory_id).await;

    let outcome = state
        .pipeline
        .ingest(
            IngestionRequest {
                memory_id: args.memory_id,
                filename: args.filename,
                bytes: Bytes::from(bytes),
                force: args.force,
                source_path: args.source_path,
                source_modified_at: args.source_modified_at,
            },
            progress,
        )
        .await?;
    to_value(&outcome)
}

#[derive(Deserialize)]
struct SearchArgs {
    memory_id: String,
    query: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn memory_search(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: SearchArgs = parse_args(args)?;
    Memory::get(&state.db, &args.memory_id).await?;
    let limit = args.limit.unwrap_or(state.config.graph_search_limit);
    let entities = search_entities(
        &state.db,
        &args.memory_id,
        &args.query,
        limit,
        &state.stopwords,
    )
    .await?;
    Ok(json!({ "entities": to_value(&entities)? }))
}

#[derive(Deserialize)]
struct GetContextArgs {
    memory_id: String,
    entity_name: String,
}

async fn memory_get_context(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: GetContextArgs = parse_args(args)?;
    let entity = Entity::find_by_name(&state.db, &args.memory_id, &args.entity_name)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("entity {}", args.entity_name)))?;
    let context = Entity::context(&state.db, &args.memory_id, entity).await?;
    to_value(&context)
}

#[derive(Deserialize)]
struct QuestionArgs {
    memory_id: String,
    question: String,
    #[serde(default)]
    limit: Option<usize>,
}

async fn run_question_answer(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: QuestionArgs = parse_args(args)?;
    Memory::get(&state.db, &args.memory_id).await?;
    let result = question_answer(
        &state.db,
        state.query_services.as_ref(),
        &state.stopwords,
        &args.memory_id,
        &args.question,
        retrieval_config(state, args.limit),
    )
    .await?;
    to_value(&result)
}

async fn run_memory_query(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: SearchArgs = parse_args(args)?;
    Memory::get(&state.db, &args.memory_id).await?;
    let outcome = memory_query(
        &state.db,
        state.query_services.as_ref(),
        &state.stopwords,
        &args.memory_id,
        &args.query,
        retrieval_config(state, args.limit),
    )
    .await?;
    to_value(&outcome)
}

async fn document_list(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: MemoryIdArgs = parse_args(args)?;
    Memory::get(&state.db, &args.memory_id).await?;
    let documents = Document::list_by_memory(&state.db, &args.memory_id).await?;
    Ok(json!({ "documents": to_value(&documents)? }))
}

#[derive(Deserialize)]
struct DocumentArgs {
    memory_id: String,
    document_id: String,
}

async fn document_get(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: DocumentArgs = parse_args(args)?;
    let document = Document::get_in_memory(&state.db, &args.memory_id, &args.document_id).await?;
    to_value(&document)
}

async fn document_delete(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: DocumentArgs = parse_args(args)?;
    let document = Document::get_in_memory(&state.db, &args.memory_id, &args.document_id).await?;
    let cascade = Document::delete_cascade(&state.db, &args.memory_id, &args.document_id).await?;
    state.storage.delete(&document.object_uri).await?;
    to_value(&cascade)
}

fn ontology_list(ontologies: &OntologyRegistry) -> Result<Value, AppError> {
    Ok(json!({ "ontologies": ontologies.summaries() }))
}

#[derive(Deserialize)]
struct StorageCheckArgs {
    #[serde(default)]
    memory_id: Option<String>,
}

async fn run_storage_check(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: StorageCheckArgs = parse_args(args)?;
    let report = storage_check(&state.db, &state.storage, args.memory_id.as_deref()).await?;
    to_value(&report)
}

#[derive(Deserialize)]
struct StorageCleanupArgs {
    #[serde(default)]
    memory_id: Option<String>,
    #[serde(default = "default_dry_run")]
    dry_run: bool,
}

fn default_dry_run() -> bool {
    true
}

async fn run_storage_cleanup(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: StorageCleanupArgs = parse_args(args)?;
    let report = storage_cleanup(
        &state.db,
        &state.storage,
        args.memory_id.as_deref(),
        args.dry_run,
    )
    .await?;
    to_value(&report)
}

#[derive(Deserialize)]
struct BackupCreateArgs {
    memory_id: String,
    #[serde(default)]
    description: Option<String>,
}

async fn backup_create(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: BackupCreateArgs = parse_args(args)?;
    // A memory being written must not be snapshotted mid-flight.
    let Some(_guard) = state.memory_locks.try_lock(&args.memory_id).await else {
        return Err(AppError::Conflict(format!(
            "memory {} is being written, retry once the ingest finishes",
            args.memory_id
        )));
    };
    let manifest = state.backup.create(&args.memory_id, args.description).await?;
    to_value(&manifest)
}

async fn backup_list(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: StorageCheckArgs = parse_args(args)?;
    let manifests = state.backup.list(args.memory_id.as_deref()).await?;
    Ok(json!({ "backups": to_value(&manifests)? }))
}

#[derive(Deserialize)]
struct BackupIdArgs {
    backup_id: String,
}

async fn backup_restore(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: BackupIdArgs = parse_args(args)?;
    let manifest = state.backup.restore(&args.backup_id).await?;
    to_value(&manifest)
}

#[derive(Deserialize)]
struct BackupDownloadArgs {
    backup_id: String,
    #[serde(default)]
    include_documents: bool,
}

async fn backup_download(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: BackupDownloadArgs = parse_args(args)?;
    let (archive, sha256) = state
        .backup
        .download(&args.backup_id, args.include_documents)
        .await?;
    Ok(json!({
        "backup_id": args.backup_id,
        "archive_base64": BASE64.encode(&archive),
        "sha256": sha256,
        "size_bytes": archive.len(),
    }))
}

async fn backup_delete(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: BackupIdArgs = parse_args(args)?;
    let removed = state.backup.delete(&args.backup_id).await?;
    Ok(json!({ "deleted_objects": removed }))
}

#[derive(Deserialize)]
struct RestoreArchiveArgs {
    archive_base64: String,
}

async fn backup_restore_archive(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: RestoreArchiveArgs = parse_args(args)?;
    let archive = BASE64
        .decode(args.archive_base64.as_bytes())
        .map_err(|e| AppError::InvalidArgument(format!("archive_base64 is not base64: {e}")))?;
    let manifest = state.backup.restore_archive(&archive).await?;
    to_value(&manifest)
}

#[derive(Deserialize)]
struct CreateTokenArgs {
    client_name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default = "default_permissions")]
    permissions: Vec<Permission>,
    #[serde(default)]
    memory_ids: Vec<String>,
    #[serde(default)]
    expires_at: Option<String>,
}

fn default_permissions() -> Vec<Permission> {
    vec![Permission::Read]
}

async fn admin_create_token(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: CreateTokenArgs = parse_args(args)?;
    let expires_at = match args.expires_at.as_deref() {
        Some(raw) => Some(
            DateTime::parse_from_rfc3339(raw)
                .map(|dt| dt.with_timezone(&Utc))
                .map_err(|e| {
                    AppError::InvalidArgument(format!("expires_at is not RFC 3339: {e}"))
                })?,
        ),
        None => None,
    };

    let (raw_token, token) = AccessToken::create(
        &state.db,
        args.client_name,
        args.email,
        args.permissions,
        args.memory_ids,
        expires_at,
    )
    .await?;

    Ok(json!({
        "token": raw_token,
        "info": token.describe(),
    }))
}

async fn admin_list_tokens(state: &ApiState) -> Result<Value, AppError> {
    let tokens = AccessToken::list(&state.db).await?;
    let described: Vec<Value> = tokens.iter().map(AccessToken::describe).collect();
    Ok(json!({ "tokens": described }))
}

#[derive(Deserialize)]
struct TokenHashArgs {
    token_hash: String,
}

async fn admin_revoke_token(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: TokenHashArgs = parse_args(args)?;
    let token = AccessToken::revoke(&state.db, &args.token_hash).await?;
    Ok(token.describe())
}

#[derive(Deserialize)]
struct UpdateTokenArgs {
    token_hash: String,
    action: MemoryScopeAction,
    memory_ids: Vec<String>,
}

async fn admin_update_token(state: &ApiState, args: Value) -> Result<Value, AppError> {
    let args: UpdateTokenArgs = parse_args(args)?;
    let token = AccessToken::update_memory_scope(
        &state.db,
        &args.token_hash,
        args.action,
        args.memory_ids,
    )
    .await?;
    Ok(token.describe())
}

pub async fn system_health(state: &ApiState) -> Result<Value, AppError> {
    let graph_store = match state.db.ping().await {
        Ok(()) => "ok".to_string(),
        Err(err) => format!("error: {err}"),
    };
    let object_store = match state.storage.exists("_health/probe").await {
        Ok(_) => "ok".to_string(),
        Err(err) => format!("error: {err}"),
    };

    Ok(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "dependencies": {
            "graph_store": graph_store,
            "object_store": object_store,
        },
    }))
}
