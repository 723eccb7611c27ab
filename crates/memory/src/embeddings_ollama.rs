//! Local embeddings through an Ollama server (`/api/embed`).
//!
//! No API key; the dimension comes from config or the table of well-known
//! models, since Ollama does not report it up front.

use std::time::Duration;

use {
    async_trait::async_trait,
    serde::{Deserialize, Serialize},
};

#[cfg(feature = "metrics")]
use metrics::histogram;

use crate::embeddings::EmbeddingProvider;

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

pub struct OllamaEmbeddingProvider {
    client: reqwest::Client,
    base_url: String,
    model: String,
    dims: usize,
    provider_key: String,
}

impl OllamaEmbeddingProvider {
    pub fn new(model: String, dims: usize) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: DEFAULT_BASE_URL.to_string(),
            provider_key: format!("ollama/{model}"),
            model,
            dims,
        }
    }

    pub fn known_dimensions(model: &str) -> Option<usize> {
        // Tags such as `nomic-embed-text:latest` share the base model's size.
        match model.split(':').next().unwrap_or(model) {
            "nomic-embed-text" => Some(768),
            "mxbai-embed-large" => Some(1024),
            "all-minilm" => Some(384),
            "snowflake-arctic-embed" => Some(1024),
            "bge-m3" => Some(1024),
            _ => None,
        }
    }

    pub fn with_base_url(mut self, url: String) -> Self {
        self.base_url = url.trim_end_matches('/').to_string();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        self
    }

    fn endpoint(&self) -> String {
        format!("{}/api/embed", self.base_url)
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[async_trait]
impl EmbeddingProvider for OllamaEmbeddingProvider {
    async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
        self.embed_batch(&[text.to_string()])
            .await?
            .pop()
            .ok_or_else(|| anyhow::anyhow!("ollama returned no embedding"))
    }

    async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
        #[cfg(feature = "metrics")]
        let start = std::time::Instant::now();

        let result = self
            .client
            .post(self.endpoint())
            .json(&EmbedRequest {
                model: &self.model,
                input: texts,
            })
            .send()
            .await?
            .error_for_status()?
            .json::<EmbedResponse>()
            .await;

        #[cfg(feature = "metrics")]
        histogram!("echovault_embedding_duration_seconds", "provider" => "ollama")
            .record(start.elapsed().as_secs_f64());

        let resp = result?;
        if resp.embeddings.len() != texts.len() {
            anyhow::bail!(
                "ollama returned {} embeddings for {} inputs",
                resp.embeddings.len(),
                texts.len()
            );
        }
        Ok(resp.embeddings)
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
