//! Agent-facing tools: JSON-schema definitions and a dispatcher over [`MemoryManager`].
//!
//! An MCP server lists [`definitions`] and forwards each call to [`call_tool`].

use {
    serde::{Deserialize, Serialize, de::DeserializeOwned},
    serde_json::{Value, json},
    tracing::debug,
};

use crate::{
    error::{MemoryError, Result},
    manager::{ContextRequest, MemoryManager},
    model::{Category, NewMemory},
    search::SearchRequest,
};

pub const MEMORY_SAVE: &str = "memory_save";
pub const MEMORY_SEARCH: &str = "memory_search";
pub const MEMORY_CONTEXT: &str = "memory_context";
pub const MEMORY_DETAILS: &str = "memory_details";
pub const MEMORY_DELETE: &str = "memory_delete";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolDefinition {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

#[derive(Debug, Deserialize)]
struct SaveParams {
    #[serde(flatten)]
    memory: NewMemory,
    #[serde(default)]
    enrich: bool,
}

#[derive(Debug, Deserialize)]
struct IdParams {
    id: String,
}

fn filter_properties() -> Value {
    json!({
        "project": {"type": "string", "description": "Only memories of this project"},
        "source": {"type": "string", "description": "Only memories saved by this agent"},
        "limit": {"type": "integer", "minimum": 1, "description": "Maximum results (default 5)"},
        "semantic": {
            "type": "string",
            "enum": ["auto", "always", "never"],
            "description": "Override whether embeddings are used"
        }
    })
}

fn with_properties(mut base: Value, extra: Value) -> Value {
    if let (Some(base), Value::Object(extra)) = (base.as_object_mut(), extra) {
        base.extend(extra);
    }
    base
}

/// Tool definitions in the shape MCP `tools/list` expects.
pub fn definitions() -> Vec<ToolDefinition> {
    let categories: Vec<&str> = Category::ALL.iter().map(Category::as_str).collect();
    vec![
        ToolDefinition {
            name: MEMORY_SAVE,
            description: "Save a decision, bug fix, pattern or learning for future sessions. \
                          Secrets are redacted before anything is written.",
            input_schema: json!({
                "type": "object",
                "properties": {
                    "title": {"type": "string", "description": "One-line summary"},
                    "what": {"type": "string", "description": "What happened or was decided"},
                    "why": {"type": "string"},
                    "impact": {"type": "string"},
                    "details": {"type": "string", "description": "Longer context, steps, snippets"},
                    "tags": {"type": "array", "items": {"type": "string"}},
                    "category": {"type": "string", "enum": categories},
                    "related_files": {"type": "array", "items": {"type": "string"}},
                    "source": {"type": "string", "description": "Agent that saved the memory"},
                    "project": {"type": "string"},
                    "enrich": {"type": "boolean", "description": "Ask the enrichment model for extra tags"}
                },
                "required": ["title", "what", "project"]
            }),
        },
        ToolDefinition {
            name: MEMORY_SEARCH,
            description: "Search saved memories by keywords and meaning. Returns compact pointers; \
                          use memory_details for the full record.",
            input_schema: json!({
                "type": "object",
                "properties": with_properties(
                    json!({"query": {"type": "string"}}),
                    filter_properties(),
                ),
                "required": ["query"]
            }),
        },
        ToolDefinition {
            name: MEMORY_CONTEXT,
            description: "Recent memories for a project, or a search when a query is given, \
                          with the total number of memories.",
            input_schema: json!({
                "type": "object",
                "properties": with_properties(
                    json!({"query": {"type": "string"}}),
                    filter_properties(),
                ),
            }),
        },
        ToolDefinition {
            name: MEMORY_DETAILS,
            description: "Full record of one memory by id or unique id prefix (at least 4 characters).",
            input_schema: json!({
                "type": "object",
                "properties": {"id": {"type": "string"}},
                "required": ["id"]
            }),
        },
        ToolDefinition {
            name: MEMORY_DELETE,
            description: "Delete one memory by id or unique id prefix from the vault and the index.",
            input_schema: json!({
                "type": "object",
                "properties": {"id": {"type": "string"}},
                "required": ["id"]
            }),
        },
    ]
}

fn parse<T: DeserializeOwned>(tool: &str, params: Value) -> Result<T> {
    serde_json::from_value(params)
        .map_err(|e| MemoryError::Validation(format!("invalid arguments for {tool}: {e}")))
}

fn to_value<T: Serialize>(value: &T) -> Result<Value> {
    serde_json::to_value(value)
        .map_err(|e| MemoryError::Validation(format!("unserializable result: {e}")))
}

/// Run one tool call and return its JSON result.
pub async fn call_tool(manager: &MemoryManager, name: &str, params: Value) -> Result<Value> {
    debug!(tool = name, "memory tool call");
    match name {
        MEMORY_SAVE => {
            let SaveParams { memory, enrich } = parse(name, params)?;
            to_value(&manager.save(memory, enrich).await?)
        },
        MEMORY_SEARCH => {
            let request: SearchRequest = parse(name, params)?;
            to_value(&manager.search(&request).await?)
        },
        MEMORY_CONTEXT => {
            let request: ContextRequest = parse(name, params)?;
            to_value(&manager.context(&request).await?)
        },
        MEMORY_DETAILS => {
            let IdParams { id } = parse(name, params)?;
            to_value(&manager.details(&id).await?)
        },
        MEMORY_DELETE => {
            let IdParams { id } = parse(name, params)?;
            let deleted = manager.delete(&id).await?;
            Ok(json!({ "deleted": deleted }))
        },
        other => Err(MemoryError::Validation(format!("unknown tool: {other}"))),
    }
}
