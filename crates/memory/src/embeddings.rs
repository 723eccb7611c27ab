use std::{fmt, time::Duration};

use {
    async_trait::async_trait,
    echovault_config::{EmbeddingConfig, EmbeddingProviderKind},
    serde::{Deserialize, Serialize},
    tracing::{debug, warn},
};

use crate::{
    embeddings_ollama::OllamaEmbeddingProvider,
    embeddings_openai::OpenAiEmbeddingProvider,
    error::{MemoryError, Result},
};

/// Trait for generating text embeddings.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Embed a single text.
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>>;

    /// Embed multiple texts. Default calls `embed` sequentially.
    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        let mut results = Vec::with_capacity(texts.len());
        for text in texts {
            results.push(self.embed(text).await?);
        }
        Ok(results)
    }

    /// Model name used for display.
    fn model_name(&self) -> &str;

    /// Number of dimensions every vector from this provider has.
    fn dimensions(&self) -> usize;

    /// Stable key identifying the vector space (backend + endpoint + model).
    fn provider_key(&self) -> &str {
        self.model_name()
    }

    fn vector_space(&self) -> VectorSpace {
        VectorSpace::new(self.provider_key(), self.dimensions())
    }
}

/// The model key and dimension a set of vectors was produced in.
///
/// Vectors from different spaces are never compared.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct VectorSpace {
    pub model: String,
    pub dims: usize,
}

impl VectorSpace {
    pub fn new(model: impl Into<String>, dims: usize) -> Self {
        Self {
            model: model.into(),
            dims,
        }
    }
}

impl fmt::Display for VectorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({} dims)", self.model, self.dims)
    }
}

/// Build the configured embedding provider, or `None` when embeddings are disabled.
///
/// Misconfiguration (missing key, unknown dimension) disables semantic search
/// with a warning instead of failing the invocation.
pub fn provider_from_config(config: &EmbeddingConfig) -> Option<Box<dyn EmbeddingProvider>> {
    let timeout = Duration::from_secs(config.timeout_secs.max(1));
    let base_url = config.base_url().map(str::to_string);
    match config.provider {
        EmbeddingProviderKind::None => None,
        EmbeddingProviderKind::Ollama => {
            let Some(dims) = config
                .dimensions
                .or_else(|| OllamaEmbeddingProvider::known_dimensions(&config.model))
            else {
                warn!(
                    model = %config.model,
                    "unknown ollama model dimension; set embedding.dimensions to enable semantic search"
                );
                return None;
            };
            let mut provider =
                OllamaEmbeddingProvider::new(config.model.clone(), dims).with_timeout(timeout);
            if let Some(url) = base_url {
                provider = provider.with_base_url(url);
            }
            debug!(model = %config.model, dims, "using ollama embeddings");
            Some(Box::new(provider))
        },
        EmbeddingProviderKind::Openai | EmbeddingProviderKind::Openrouter => {
            let Some(api_key) = config.api_key() else {
                warn!(provider = %config.provider, "no api_key configured, semantic search disabled");
                return None;
            };
            let dims = config
                .dimensions
                .or_else(|| OpenAiEmbeddingProvider::known_dimensions(&config.model));
            let Some(dims) = dims else {
                warn!(
                    model = %config.model,
                    "unknown embedding dimension; set embedding.dimensions to enable semantic search"
                );
                return None;
            };
            let mut provider = OpenAiEmbeddingProvider::new(api_key.to_string())
                .with_model(config.model.clone(), dims)
                .with_timeout(timeout);
            if let Some(url) = base_url {
                provider = provider.with_base_url(url);
            }
            debug!(provider = %config.provider, model = %config.model, dims, "using openai-compatible embeddings");
            Some(Box::new(provider))
        },
    }
}

/// Embed `text` under an outer deadline and check the result fits the provider's space.
pub async fn embed_bounded(
    provider: &dyn EmbeddingProvider,
    text: &str,
    timeout: Duration,
) -> Result<Vec<f32>> {
    let vector = match tokio::time::timeout(timeout, provider.embed(text)).await {
        Ok(Ok(vector)) => vector,
        Ok(Err(e)) => return Err(MemoryError::Provider(format!("embedding failed: {e:#}"))),
        Err(_) => {
            return Err(MemoryError::Provider(format!(
                "embedding timed out after {}s",
                timeout.as_secs()
            )));
        },
    };
    if vector.len() != provider.dimensions() {
        return Err(MemoryError::Provider(format!(
            "provider returned {} dimensions, expected {}",
            vector.len(),
            provider.dimensions()
        )));
    }
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(MemoryError::Provider(
            "provider returned a non-finite vector".into(),
        ));
    }
    Ok(vector)
}

/// Little-endian f32 blob, the on-disk vector format.
pub fn vector_to_blob(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn blob_to_vector(blob: &[u8]) -> Option<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return None;
    }
    Some(
        blob.chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect(),
    )
}

/// Cosine similarity; zero vectors and length mismatches score 0.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom == 0.0 { 0.0 } else { dot / denom }
}
