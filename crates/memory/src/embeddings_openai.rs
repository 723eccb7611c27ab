/// OpenAI-compatible embeddings provider (`/v1/embeddings`), also used for OpenRouter.
use std::time::Duration;

use async_trait::async_trait;
use {
    secrecy::ExposeSecret,
    serde::{Deserialize, Serialize},
    sha2::{Digest, Sha256},
};

#[cfg(feature = "metrics")]
use metrics::histogram;

use crate::embeddings::EmbeddingProvider;

pub struct OpenAiEmbeddingProvider {
    client: reqwest::Client,
    api_key: secrecy::Secret<String>,
    base_url: String,
    model: String,
    dims: usize,
    provider_key: String,
}

/// `<model>#<endpoint hash>`: the same model behind two endpoints is two spaces.
fn compute_provider_key(base_url: &str, model: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(b"openai:");
    hasher.update(base_url.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    format!("{model}#{}", &digest[..8])
}

fn normalize_base_url(url: &str) -> String {
    url.trim_end_matches('/').to_string()
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = normalize_base_url(base_url);
    if normalized.ends_with("/embeddings") {
        return normalized;
    }
    if has_version_suffix(&normalized) {
        return format!("{normalized}/embeddings");
    }
    format!("{normalized}/v1/embeddings")
}

fn build_client(timeout: Option<Duration>) -> reqwest::Client {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    builder.build().unwrap_or_else(|_| reqwest::Client::new())
}

impl OpenAiEmbeddingProvider {
    pub fn new(api_key: String) -> Self {
        let base_url = normalize_base_url("https://api.openai.com");
        let model = "text-embedding-3-small".to_string();
        let provider_key = compute_provider_key(&base_url, &model);
        Self {
            client: build_client(None),
            api_key: secrecy::Secret::new(api_key),
            base_url,
            model,
            dims: 1536,
            provider_key,
        }
    }

    /// Dimensions of the well-known OpenAI embedding models.
    pub fn known_dimensions(model: &str) -> Option<usize> {
        match model.rsplit('/').next().unwrap_or(model) {
            "text-embedding-3-small" | "text-embedding-ada-002" => Some(1536),
            "text-embedding-3-large" => Some(3072),
            _ => None,
        }
    }

    pub fn with_model(mut self, model: String, dims: usize) -> Self {
        self.model = model;
        self.dims = dims;
        self.provider_key = compute_provider_key(&self.base_url, &self.model);
        self
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = normalize_base_url(&url);
        self.provider_key = compute_provider_key(&self.base_url, &self.model);
        self
    }

    /// HTTP-level deadline; callers add their own outer timeout on top.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = build_client(Some(timeout));
        self
    }
}

#[derive(Serialize)]
struct EmbeddingRequest<'a> {
    model: &'a str,
    input: &'a [String],
    #[serde(skip_serializing_if = "Option::is_none")]
    dimensions: Option<usize>,
}

#[derive(Deserialize)]
struct EmbeddingResponse {
    data: Vec<EmbeddingData>,
}

#[derive(Deserialize)]
struct EmbeddingData {
    embedding: Vec<f32>,
}

#[async_trait]
impl EmbeddingProvider for OpenAiEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("empty embedding response"))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        // Only the text-embedding-3 family accepts a shortened dimension.
        let dimensions = (self.model.contains("text-embedding-3")
            && Self::known_dimensions(&self.model) != Some(self.dims))
        .then_some(self.dims);
        let req = EmbeddingRequest {
            model: &self.model,
            input: texts,
            dimensions,
        };

        let result = self
            .client
            .post(embeddings_endpoint(&self.base_url))
            .bearer_auth(self.api_key.expose_secret())
            .json(&req)
            .send()
            .await?
            .error_for_status()?
            .json::<EmbeddingResponse>()
            .await;

        #[cfg(feature = "metrics")]
        histogram!("echovault_embedding_duration_seconds", "provider" => "openai")
            .record(start.elapsed().as_secs_f64());

        let resp = result?;
        if resp.data.len() != texts.len() {
            anyhow::bail!(
                "embedding response has {} vectors for {} inputs",
                resp.data.len(),
                texts.len()
            );
        }
        Ok(resp.data.into_iter().map(|d| d.embedding).collect())
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn dimensions(&self) -> usize {
        self.dims
    }

    fn provider_key(&self) -> &str {
        &self.provider_key
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_from_host_base_uses_v1_embeddings() {
        assert_eq!(
            embeddings_endpoint("https://api.openai.com"),
            "https://api.openai.com/v1/embeddings"
        );
    }

    #[test]
    fn endpoint_from_openrouter_base_appends_embeddings_once() {
        assert_eq!(
            embeddings_endpoint("https://openrouter.ai/api/v1/"),
            "https://openrouter.ai/api/v1/embeddings"
        );
    }

    #[test]
    fn endpoint_preserves_explicit_embeddings_url() {
        assert_eq!(
            embeddings_endpoint("https://api.example.com/v1/embeddings"),
            "https://api.example.com/v1/embeddings"
        );
    }

    #[test]
    fn provider_key_tracks_endpoint_and_model() {
        let a = OpenAiEmbeddingProvider::new("k".into());
        let b = OpenAiEmbeddingProvider::new("k".into())
            .with_base_url("https://openrouter.ai/api/v1".into());
        let c = OpenAiEmbeddingProvider::new("k".into())
            .with_model("text-embedding-3-large".into(), 3072);
        assert_ne!(a.provider_key(), b.provider_key());
        assert_ne!(a.provider_key(), c.provider_key());
        assert!(c.provider_key().starts_with("text-embedding-3-large#"));
        assert_eq!(c.dimensions(), 3072);
    }

    #[test]
    fn known_dimensions_accept_routed_names() {
        assert_eq!(
            OpenAiEmbeddingProvider::known_dimensions("openai/text-embedding-3-small"),
            Some(1536)
        );
        assert_eq!(OpenAiEmbeddingProvider::known_dimensions("mystery"), None);
    }
}
