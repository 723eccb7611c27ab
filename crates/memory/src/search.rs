//! Hybrid retrieval: keyword and vector channels merged by weighted reciprocal rank fusion.

use std::{collections::HashMap, time::Duration};

use {
    chrono::{DateTime, Utc},
    echovault_config::SemanticMode,
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

#[cfg(feature = "metrics")]
use metrics::{counter, histogram};

use crate::{
    embeddings::{EmbeddingProvider, embed_bounded},
    error::{MemoryError, Result},
    model::Category,
    store::{Hit, IndexRow, IndexStore, SearchFilter},
};

/// Inputs of a search. Everything but the query is optional.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub project: Option<String>,
    #[serde(default)]
    pub source: Option<String>,
    #[serde(default)]
    pub limit: Option<usize>,
    #[serde(default)]
    pub semantic: Option<SemanticMode>,
}

/// Compact pointer returned by search; `details` fetches the full record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MemoryPointer {
    pub id: String,
    pub title: String,
    pub category: Category,
    pub tags: Vec<String>,
    pub project: String,
    pub source: Option<String>,
    pub created_at: DateTime<Utc>,
    pub summary: String,
    pub has_more: bool,
    pub score: f64,
    /// Added by recent top-up rather than matched by the query.
    pub recent: bool,
}

impl MemoryPointer {
    pub fn from_row(row: IndexRow, score: f64, recent: bool) -> Self {
        Self {
            id: row.id,
            title: row.title,
            category: row.category,
            tags: row.tags,
            project: row.project,
            source: row.source,
            created_at: row.created_at,
            summary: row.summary,
            has_more: row.has_more,
            score,
            recent,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Hybrid,
    Keyword,
    /// No query: most recent memories only.
    Recent,
}

impl SearchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hybrid => "hybrid",
            Self::Keyword => "keyword",
            Self::Recent => "recent",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchOutcome {
    pub results: Vec<MemoryPointer>,
    pub mode: SearchMode,
    /// Stored vectors come from another model; `reindex` restores semantic search.
    pub needs_reindex: bool,
    /// Why the vector channel was skipped, when it was wanted.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub degraded: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionWeights {
    pub keyword: f64,
    pub vector: f64,
    pub k: f64,
}

impl Default for FusionWeights {
    fn default() -> Self {
        Self {
            keyword: 0.3,
            vector: 0.7,
            k: 60.0,
        }
    }
}

/// Tunables the engine needs from the invocation context.
#[derive(Debug, Clone)]
pub struct SearchParams {
    pub weights: FusionWeights,
    pub default_limit: usize,
    pub semantic: SemanticMode,
    pub topup_recent: bool,
    pub timeout: Duration,
}

/// Weighted reciprocal rank fusion: `Σ w / (k + rank)` with 1-based ranks.
///
/// Raw channel scores are ignored. Ties break by newest first, then id.
pub fn fuse_ranks(keyword: &[Hit], vector: &[Hit], weights: &FusionWeights) -> Vec<(IndexRow, f64)> {
    let mut fused: HashMap<&str, (&IndexRow, f64)> = HashMap::new();
    for (hits, weight) in [(keyword, weights.keyword), (vector, weights.vector)] {
        for (i, hit) in hits.iter().enumerate() {
            let contribution = weight / (weights.k + (i + 1) as f64);
            fused
                .entry(hit.row.id.as_str())
                .or_insert((&hit.row, 0.0))
                .1 += contribution;
        }
    }
    let mut ranked: Vec<(IndexRow, f64)> = fused
        .into_values()
        .map(|(row, score)| (row.clone(), score))
        .collect();
    ranked.sort_by(|(a, sa), (b, sb)| {
        sb.total_cmp(sa)
            .then_with(|| b.created_at.cmp(&a.created_at))
            .then_with(|| a.id.cmp(&b.id))
    });
    ranked
}

enum Semantic<'a> {
    Off,
    Mismatch,
    On(&'a dyn EmbeddingProvider),
}

async fn resolve_semantic<'a>(
    mode: SemanticMode,
    embedder: Option<&'a dyn EmbeddingProvider>,
    store: &dyn IndexStore,
) -> Semantic<'a> {
    let Some(provider) = embedder else {
        return Semantic::Off;
    };
    match mode {
        SemanticMode::Never => Semantic::Off,
        SemanticMode::Always => Semantic::On(provider),
        SemanticMode::Auto => match store.vector_space().await {
            Ok(Some(stored)) if stored == provider.vector_space() => Semantic::On(provider),
            Ok(Some(stored)) => {
                debug!(%stored, active = %provider.vector_space(), "vector index built by another model");
                Semantic::Mismatch
            },
            Ok(None) => Semantic::Off,
            Err(e) => {
                warn!(error = %e, "could not read vector metadata, using keyword search");
                Semantic::Off
            },
        },
    }
}

/// Run both channels, fuse, cut to the limit and optionally top up with recent memories.
///
/// Keyword failures propagate; vector failures degrade to keyword-only.
pub async fn hybrid_search(
    store: &dyn IndexStore,
    embedder: Option<&dyn EmbeddingProvider>,
    request: &SearchRequest,
    params: &SearchParams,
) -> Result<SearchOutcome> {
    #[cfg(feature = "metrics")]
    let start = std::time::Instant::now();

    let limit = request.limit.unwrap_or(params.default_limit).max(1);
    let depth = (limit * 2).max(10);
    let filter = SearchFilter {
        project: request.project.clone(),
        source: request.source.clone(),
    };
    let query = request.query.trim();

    let keyword = store.keyword_search(query, &filter, depth).await?;

    let mut needs_reindex = false;
    let mut degraded = None;
    let wanted = request.semantic.unwrap_or(params.semantic);
    let vector = if query.is_empty() {
        None
    } else {
        match resolve_semantic(wanted, embedder, store).await {
            Semantic::Off => None,
            Semantic::Mismatch => {
                needs_reindex = true;
                degraded = Some("vector index was built with another model; run reindex".into());
                None
            },
            Semantic::On(provider) => {
                match vector_channel(store, provider, query, &filter, depth, params.timeout).await {
                    Ok(hits) => Some(hits),
                    Err(e) => {
                        needs_reindex |= matches!(e, MemoryError::NeedsReindex { .. });
                        warn!(error = %e, "vector search unavailable, using keyword results");
                        #[cfg(feature = "metrics")]
                        counter!("echovault_embedding_failures_total").increment(1);
                        degraded = Some(e.to_string());
                        None
                    },
                }
            },
        }
    };

    let mode = if vector.as_ref().is_some_and(|hits| !hits.is_empty()) {
        SearchMode::Hybrid
    } else {
        SearchMode::Keyword
    };
    let mut results: Vec<MemoryPointer> =
        fuse_ranks(&keyword, vector.as_deref().unwrap_or(&[]), &params.weights)
            .into_iter()
            .take(limit)
            .map(|(row, score)| MemoryPointer::from_row(row, score, false))
            .collect();

    if params.topup_recent && results.len() < limit {
        top_up(store, &filter, limit, &mut results).await?;
    }

    debug!(
        query,
        mode = mode.as_str(),
        keyword_hits = keyword.len(),
        vector_hits = vector.as_ref().map_or(0, Vec::len),
        returned = results.len(),
        "search complete"
    );

    #[cfg(feature = "metrics")]
    {
        counter!("echovault_searches_total", "mode" => mode.as_str()).increment(1);
        histogram!("echovault_search_duration_seconds").record(start.elapsed().as_secs_f64());
    }

    Ok(SearchOutcome {
        results,
        mode,
        needs_reindex,
        degraded,
    })
}

async fn vector_channel(
    store: &dyn IndexStore,
    provider: &dyn EmbeddingProvider,
    query: &str,
    filter: &SearchFilter,
    depth: usize,
    timeout: Duration,
) -> Result<Vec<Hit>> {
    let embedding = embed_bounded(provider, query, timeout).await?;
    store
        .vector_search(&embedding, &provider.vector_space(), filter, depth)
        .await
}

/// Append the newest memories under `filter` that are not already listed.
pub async fn top_up(
    store: &dyn IndexStore,
    filter: &SearchFilter,
    limit: usize,
    results: &mut Vec<MemoryPointer>,
) -> Result<()> {
    let missing = limit.saturating_sub(results.len());
    if missing == 0 {
        return Ok(());
    }
    let recent = store.recent(filter, limit + results.len()).await?;
    for row in recent {
        if results.len() >= limit {
            break;
        }
        if results.iter().any(|p| p.id == row.id) {
            continue;
        }
        results.push(MemoryPointer::from_row(row, 0.0, true));
    }
    Ok(())
}
