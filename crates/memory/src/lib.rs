//! Memory core: redacted notes → markdown vault → rebuildable SQLite index → hybrid search.

pub mod codec;
pub mod config;
pub mod embeddings;
pub mod embeddings_ollama;
pub mod embeddings_openai;
pub mod enrichment;
pub mod error;
pub mod lock;
pub mod manager;
pub mod model;
pub mod redaction;
pub mod reindex;
pub mod schema;
pub mod search;
pub mod store;
pub mod store_sqlite;
pub mod summary;
#[cfg(test)]
mod testing;
pub mod tools;
pub mod vault;

pub use {
    config::MemoryConfig,
    error::{MemoryError, Result},
    manager::MemoryManager,
    model::{Category, MemoryRecord, NewMemory},
};
