use std::path::PathBuf;

use crate::{codec::CodecError, embeddings::VectorSpace};

/// Errors surfaced by the memory core.
///
/// Anything that could lose a memory (`Validation`, `Persistence`) reaches the
/// caller. `Index` and `Provider` only degrade retrieval and are usually logged
/// by the manager instead of propagated. Redaction has no variant: it fails
/// closed by masking.
#[derive(Debug, thiserror::Error)]
pub enum MemoryError {
    #[error("invalid memory: {0}")]
    Validation(String),

    #[error("vault write failed for {}: {source}", path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed vault file {}: {source}", path.display())]
    Codec {
        path: PathBuf,
        #[source]
        source: CodecError,
    },

    #[error("index error: {0}")]
    Index(#[from] sqlx::Error),

    #[error("vector index was built with {stored}, active model is {active}; run reindex")]
    NeedsReindex {
        stored: VectorSpace,
        active: VectorSpace,
    },

    #[error("provider error: {0}")]
    Provider(String),

    #[error("no memory found for {0}")]
    NotFound(String),

    #[error("prefix {prefix} matches {count} memories; use a longer prefix")]
    AmbiguousPrefix { prefix: String, count: usize },
}

impl MemoryError {
    pub(crate) fn persistence(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Persistence {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T, E = MemoryError> = std::result::Result<T, E>;
