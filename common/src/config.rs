use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Clone, Deserialize, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
    Memory,
    S3,
}

#[derive(Clone, Deserialize, Debug)]
pub struct AppConfig {
    // Graph store
    pub surrealdb_address: String,
    pub surrealdb_username: String,
    pub surrealdb_password: String,
    #[serde(default = "default_namespace")]
    pub surrealdb_namespace: String,
    #[serde(default = "default_database")]
    pub surrealdb_database: String,

    // Object store
    #[serde(default = "default_storage_kind")]
    pub storage: StorageKind,
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
    #[serde(default)]
    pub s3_bucket: Option<String>,

    // LLM + embeddings (OpenAI-compatible)
    pub llm_api_key: String,
    #[serde(default = "default_base_url")]
    pub llm_base_url: String,
    #[serde(default = "default_chat_model")]
    pub chat_model: String,
    #[serde(default = "default_embedding_model")]
    pub embedding_model: String,
    #[serde(default = "default_embedding_dimensions")]
    pub embedding_dimensions: u32,

    // Authentication
    pub bootstrap_admin_key: String,

    // Server
    #[serde(default = "default_http_port")]
    pub http_port: u16,

    // Ontologies + language resources
    #[serde(default = "default_ontology_dir")]
    pub ontology_dir: String,
    #[serde(default)]
    pub stopwords_path: Option<String>,

    // Tunables
    #[serde(default = "default_max_document_size_mb")]
    pub max_document_size_mb: u64,
    #[serde(default = "default_max_text_length")]
    pub max_text_length: usize,
    #[serde(default = "default_extraction_chunk_size")]
    pub extraction_chunk_size: usize,
    #[serde(default = "default_extraction_timeout_s")]
    pub extraction_timeout_s: u64,
    #[serde(default = "default_extraction_context_budget")]
    pub extraction_context_budget: usize,
    #[serde(default)]
    pub extraction_max_tokens: Option<u32>,
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    #[serde(default = "default_chunk_overlap")]
    pub chunk_overlap: usize,
    #[serde(default = "default_embedding_batch_size")]
    pub embedding_batch_size: usize,
    #[serde(default = "default_embedding_concurrency")]
    pub embedding_concurrency: usize,
    #[serde(default = "default_rag_score_threshold")]
    pub rag_score_threshold: f32,
    #[serde(default = "default_rag_chunk_limit")]
    pub rag_chunk_limit: usize,
    #[serde(default = "default_graph_search_limit")]
    pub graph_search_limit: usize,
    #[serde(default = "default_backup_retention_count")]
    pub backup_retention_count: usize,
}

fn default_namespace() -> String {
    "graph_memory".to_string()
}

fn default_database() -> String {
    "main".to_string()
}

fn default_storage_kind() -> StorageKind {
    StorageKind::Local
}

fn default_data_dir() -> String {
    "./data".to_string()
}

fn default_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_chat_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_embedding_model() -> String {
    "text-embedding-3-large".to_string()
}

fn default_embedding_dimensions() -> u32 {
    1024
}

fn default_http_port() -> u16 {
    8787
}

fn default_ontology_dir() -> String {
    "./ontologies".to_string()
}

fn default_max_document_size_mb() -> u64 {
    50
}

fn default_max_text_length() -> usize {
    950_000
}

fn default_extraction_chunk_size() -> usize {
    25_000
}

fn default_extraction_timeout_s() -> u64 {
    600
}

fn default_extraction_context_budget() -> usize {
    8_000
}

fn default_chunk_size() -> usize {
    500
}

fn default_chunk_overlap() -> usize {
    50
}

fn default_embedding_batch_size() -> usize {
    32
}

fn default_embedding_concurrency() -> usize {
    2
}

fn default_rag_score_threshold() -> f32 {
    0.58
}

fn default_rag_chunk_limit() -> usize {
    8
}

fn default_graph_search_limit() -> usize {
    10
}

fn default_backup_retention_count() -> usize {
    5
}

impl AppConfig {
    pub fn max_document_size_bytes(&self) -> u64 {
        self.max_document_size_mb * 1024 * 1024
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            surrealdb_address: "mem://".to_string(),
            surrealdb_username: "root".to_string(),
            surrealdb_password: "root".to_string(),
            surrealdb_namespace: default_namespace(),
            surrealdb_database: default_database(),
            storage: StorageKind::Memory,
            data_dir: default_data_dir(),
            s3_bucket: None,
            llm_api_key: "test-key".to_string(),
            llm_base_url: default_base_url(),
            chat_model: default_chat_model(),
            embedding_model: default_embedding_model(),
            embedding_dimensions: default_embedding_dimensions(),
            bootstrap_admin_key: "bootstrap-admin-key".to_string(),
            http_port: default_http_port(),
            ontology_dir: default_ontology_dir(),
            stopwords_path: None,
            max_document_size_mb: default_max_document_size_mb(),
            max_text_length: default_max_text_length(),
            extraction_chunk_size: default_extraction_chunk_size(),
            extraction_timeout_s: default_extraction_timeout_s(),
            extraction_context_budget: default_extraction_context_budget(),
            extraction_max_tokens: None,
            chunk_size: default_chunk_size(),
            chunk_overlap: default_chunk_overlap(),
            embedding_batch_size: default_embedding_batch_size(),
            embedding_concurrency: default_embedding_concurrency(),
            rag_score_threshold: default_rag_score_threshold(),
            rag_chunk_limit: default_rag_chunk_limit(),
            graph_search_limit: default_graph_search_limit(),
            backup_retention_count: default_backup_retention_count(),
        }
    }
}

pub fn get_config() -> Result<AppConfig, ConfigError> {
    let config = Config::builder()
        .add_source(File::with_name("config").required(false))
        .add_source(Environment::default())
        .build()?;

    config.try_deserialize()
}
