use serde_json::{json, Value};

use common::{
    error::AppError,
    storage::types::access_token::{Permission, Principal},
    utils::progress::ProgressSink,
};

use crate::api_state::ApiState;

use super::tools;

pub struct ToolArg {
    pub name: &'static str,
    pub kind: &'static str,
    pub required: bool,
}

pub struct ToolDef {
    pub name: &'static str,
    pub description: &'static str,
    pub permission: Permission,
    /// Argument checked against the principal's memory scope when present.
    pub memory_scope_param: Option<&'static str>,
    pub args: &'static [ToolArg],
}

macro_rules! arg {
    ($name:literal, $kind:literal) => {
        ToolArg {
            name: $name,
            kind: $kind,
            required: true,
        }
    };
    ($name:literal, $kind:literal, optional) => {
        ToolArg {
            name: $name,
            kind: $kind,
            required: false,
        }
    };
}

pub static TOOLS: &[ToolDef] = &[
    ToolDef {
        name: "memory_create",
        description: "Create a new memory bound to an ontology",
        permission: Permission::Write,
        memory_scope_param: Some("memory_id"),
        args: &[
            arg!("memory_id", "string"),
            arg!("name", "string"),
            arg!("description", "string", optional),
            arg!("ontology", "string"),
        ],
    },
    ToolDef {
        name: "memory_delete",
        description: "Delete a memory and everything under it",
        permission: Permission::Admin,
        memory_scope_param: Some("memory_id"),
        args: &[arg!("memory_id", "string")],
    },
    ToolDef {
        name: "memory_list",
        description: "List memories visible to the caller",
        permission: Permission::Read,
        memory_scope_param: None,
        args: &[],
    },
    ToolDef {
        name: "memory_stats",
        description: "Per-type record counts of a memory",
        permission: Permission::Read,
        memory_scope_param: Some("memory_id"),
        args: &[arg!("memory_id", "string")],
    },
    ToolDef {
        name: "memory_graph",
        description: "Full graph of a memory: nodes, edges, documents",
        permission: Permission::Read,
        memory_scope_param: Some("memory_id"),
        args: &[arg!("memory_id", "string")],
    },
    ToolDef {
        name: "memory_ingest",
        description: "Ingest a document into a memory",
        permission: Permission::Write,
        memory_scope_param: Some("memory_id"),
        args: &[
            arg!("memory_id", "string"),
            arg!("filename", "string"),
            arg!("content_base64", "string"),
            arg!("force", "boolean", optional),
            arg!("source_path", "string", optional),
            arg!("source_modified_at", "string", optional),
        ],
    },
    ToolDef {
        name: "memory_search",
        description: "Accent-insensitive entity search with context",
        permission: Permission::Read,
        memory_scope_param: Some("memory_id"),
        args: &[
            arg!("memory_id", "string"),
            arg!("query", "string"),
            arg!("limit", "integer", optional),
        ],
    },
    ToolDef {
        name: "memory_get_context",
        description: "One entity with its neighbourhood",
        permission: Permission::Read,
        memory_scope_param: Some("memory_id"),
        args: &[arg!("memory_id", "string"), arg!("entity_name", "string")],
    },
    ToolDef {
        name: "question_answer",
        description: "Graph-Guided RAG answer with citations",
        permission: Permission::Read,
        memory_scope_param: Some("memory_id"),
        args: &[
            arg!("memory_id", "string"),
            arg!("question", "string"),
            arg!("limit", "integer", optional),
        ],
    },
    ToolDef {
        name: "memory_query",
        description: "Structured retrieval without answer composition",
        permission: Permission::Read,
        memory_scope_param: Some("memory_id"),
        args: &[
            arg!("memory_id", "string"),
            arg!("query", "string"),
            arg!("limit", "integer", optional),
        ],
    },
    ToolDef {
        name: "document_list",
        description: "Documents of a memory",
        permission: Permission::Read,
        memory_scope_param: Some("memory_id"),
        args: &[arg!("memory_id", "string")],
    },
    ToolDef {
        name: "document_get",
        description: "Metadata of one document",
        permission: Permission::Read,
        memory_scope_param: Some("memory_id"),
        args: &[arg!("memory_id", "string"), arg!("document_id", "string")],
    },
    ToolDef {
        name: "document_delete",
        description: "Delete a document with orphan cascade",
        permission: Permission::Write,
        memory_scope_param: Some("memory_id"),
        args: &[arg!("memory_id", "string"), arg!("document_id", "string")],
    },
    ToolDef {
        name: "ontology_list",
        description: "Loaded ontologies",
        permission: Permission::Read,
        memory_scope_param: None,
        args: &[],
    },
    ToolDef {
        name: "storage_check",
        description: "Detect object-store orphans",
        permission: Permission::Admin,
        memory_scope_param: Some("memory_id"),
        args: &[arg!("memory_id", "string", optional)],
    },
    ToolDef {
        name: "storage_cleanup",
        description: "Delete object-store orphans (dry-run by default)",
        permission: Permission::Admin,
        memory_scope_param: Some("memory_id"),
        args: &[
            arg!("memory_id", "string", optional),
            arg!("dry_run", "boolean", optional),
        ],
    },
    ToolDef {
        name: "backup_create",
        description: "Snapshot a memory into the backup namespace",
        permission: Permission::Admin,
        memory_scope_param: Some("memory_id"),
        args: &[
            arg!("memory_id", "string"),
            arg!("description", "string", optional),
        ],
    },
    ToolDef {
        name: "backup_list",
        description: "List backups, optionally for one memory",
        permission: Permission::Admin,
        memory_scope_param: Some("memory_id"),
        args: &[arg!("memory_id", "string", optional)],
    },
    ToolDef {
        name: "backup_restore",
        description: "Restore a backup into a fresh memory",
        permission: Permission::Admin,
        memory_scope_param: None,
        args: &[arg!("backup_id", "string")],
    },
    ToolDef {
        name: "backup_download",
        description: "Download a backup as a tar.gz archive",
        permission: Permission::Admin,
        memory_scope_param: None,
        args: &[
            arg!("backup_id", "string"),
            arg!("include_documents", "boolean", optional),
        ],
    },
    ToolDef {
        name: "backup_delete",
        description: "Delete a backup from the object store",
        permission: Permission::Admin,
        memory_scope_param: None,
        args: &[arg!("backup_id", "string")],
    },
    ToolDef {
        name: "backup_restore_archive",
        description: "Restore a memory from an uploaded archive",
        permission: Permission::Admin,
        memory_scope_param: None,
        args: &[arg!("archive_base64", "string")],
    },
    ToolDef {
        name: "admin_create_token",
        description: "Create an access token; the raw token is shown once",
        permission: Permission::Admin,
        memory_scope_param: None,
        args: &[
            arg!("client_name", "string"),
            arg!("email", "string", optional),
            arg!("permissions", "array", optional),
            arg!("memory_ids", "array", optional),
            arg!("expires_at", "string", optional),
        ],
    },
    ToolDef {
        name: "admin_list_tokens",
        description: "List token metadata",
        permission: Permission::Admin,
        memory_scope_param: None,
        args: &[],
    },
    ToolDef {
        name: "admin_revoke_token",
        description: "Revoke a token by hash",
        permission: Permission::Admin,
        memory_scope_param: None,
        args: &[arg!("token_hash", "string")],
    },
    ToolDef {
        name: "admin_update_token",
        description: "Adjust a token's memory scope",
        permission: Permission::Admin,
        memory_scope_param: None,
        args: &[
            arg!("token_hash", "string"),
            arg!("action", "string"),
            arg!("memory_ids", "array"),
        ],
    },
    ToolDef {
        name: "system_health",
        description: "Per-dependency status",
        permission: Permission::Read,
        memory_scope_param: None,
        args: &[],
    },
];

pub fn find(name: &str) -> Option<&'static ToolDef> {
    TOOLS.iter().find(|tool| tool.name == name)
}

pub fn input_schema(def: &ToolDef) -> Value {
    let mut properties = serde_json::Map::new();
    let mut required = Vec::new();
    for arg in def.args {
        properties.insert(arg.name.to_string(), json!({ "type": arg.kind }));
        if arg.required {
            required.push(arg.name);
        }
    }
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
        "additionalProperties": false,
    })
}

/// Authorises and runs one tool call for the given principal.
pub async fn dispatch(
    state: &ApiState,
    principal: &Principal,
    name: &str,
    args: Value,
    progress: &ProgressSink,
) -> Result<Value, AppError> {
    let def = find(name).ok_or_else(|| AppError::NotFound(format!("tool {name}")))?;

    if !principal.can(def.permission) {
        return Err(AppError::Forbidden(format!(
            "tool {name} requires the {:?} permission",
            def.permission
        )));
    }

    if let Some(param) = def.memory_scope_param {
        if let Some(memory_id) = args.get(param).and_then(Value::as_str) {
            if !principal.allows_memory(memory_id) {
                return Err(AppError::Forbidden(format!(
                    "memory {memory_id} is outside this token's scope"
                )));
            }
        }
    }

    tracing::debug!(tool = name, client = %principal.client_name, "dispatching tool call");
    tools::invoke(state, principal, name, args, progress).await
}
