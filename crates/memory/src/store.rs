use {
    async_trait::async_trait,
    chrono::{DateTime, Utc},
    serde::Serialize,
};

use crate::{
    embeddings::VectorSpace,
    error::Result,
    model::{Category, MemoryRecord},
    summary::summarize,
};

/// Compact, search-facing view of a memory as held by the index.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexRow {
    pub id: String,
    pub project: String,
    pub category: Category,
    pub tags: Vec<String>,
    pub title: String,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub file_path: String,
    pub summary: String,
    pub has_more: bool,
}

/// Everything needed to (re)write one memory into the index.
#[derive(Debug, Clone)]
pub struct IndexEntry {
    pub row: IndexRow,
    pub what: String,
    pub why: Option<String>,
    pub impact: Option<String>,
    pub vector: Option<Vec<f32>>,
}

impl IndexEntry {
    pub fn from_record(
        record: &MemoryRecord,
        file_path: &str,
        summary_tokens: usize,
        summary_chars: usize,
    ) -> Self {
        let (summary, truncated) = summarize(&record.what, summary_tokens, summary_chars);
        Self {
            row: IndexRow {
                id: record.id.clone(),
                project: record.project.clone(),
                category: record.category,
                tags: record.tags.clone(),
                title: record.title.clone(),
                source: record.source.clone(),
                created_at: record.created_at,
                file_path: file_path.to_string(),
                summary,
                has_more: truncated || record.has_extra_fields(),
            },
            what: record.what.clone(),
            why: record.why.clone(),
            impact: record.impact.clone(),
            vector: None,
        }
    }

    pub fn with_vector(mut self, vector: Option<Vec<f32>>) -> Self {
        self.vector = vector;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Hit {
    pub row: IndexRow,
    /// Channel-native score: negated BM25 for keywords, cosine for vectors.
    pub score: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchFilter {
    pub project: Option<String>,
    pub source: Option<String>,
}

/// What happened to the vector part of an upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VectorOutcome {
    Stored,
    /// No vector was supplied.
    Absent,
    /// The index holds vectors from another model; the row was stored without one.
    Incompatible { stored: VectorSpace },
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IndexStats {
    pub memories: usize,
    pub vectors: usize,
}

/// Secondary index over the vault. Every method is safe to lose: the vault
/// can always rebuild it.
#[async_trait]
pub trait IndexStore: Send + Sync {
    /// Insert or replace one memory. Keyword data is always written; the
    /// vector only when it belongs to the index's vector space.
    async fn upsert(&self, entry: &IndexEntry, space: Option<&VectorSpace>)
    -> Result<VectorOutcome>;

    /// BM25-ranked prefix search; best first.
    async fn keyword_search(
        &self,
        query: &str,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<Hit>>;

    /// Cosine-ranked search; fails with `NeedsReindex` when `space` differs
    /// from the stored one.
    async fn vector_search(
        &self,
        query: &[f32],
        space: &VectorSpace,
        filter: &SearchFilter,
        limit: usize,
    ) -> Result<Vec<Hit>>;

    /// Newest first.
    async fn recent(&self, filter: &SearchFilter, limit: usize) -> Result<Vec<IndexRow>>;

    async fn count(&self, filter: &SearchFilter) -> Result<usize>;

    async fn resolve_prefix(&self, prefix: &str) -> Result<Vec<IndexRow>>;

    async fn contains(&self, id: &str) -> Result<bool>;

    async fn delete(&self, ids: &[String]) -> Result<usize>;

    /// Drop every row and load `entries` in a single transaction.
    async fn replace_all(&self, entries: &[IndexEntry], space: Option<&VectorSpace>) -> Result<()>;

    /// Vector space of the stored vectors, if any were ever written.
    async fn vector_space(&self) -> Result<Option<VectorSpace>>;

    async fn stats(&self) -> Result<IndexStats>;
}
