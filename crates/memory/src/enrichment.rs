//! Optional tag suggestions from a chat model.

use std::time::Duration;

use {
    async_trait::async_trait,
    echovault_config::{EmbeddingProviderKind, EnrichmentConfig},
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize},
    tracing::warn,
};

use crate::model::NewMemory;

const MAX_SUGGESTED_TAGS: usize = 5;

#[async_trait]
pub trait TagEnricher: Send + Sync {
    /// Suggest extra tags for an already-redacted memory.
    async fn suggest_tags(&self, memory: &NewMemory) -> anyhow::Result<Vec<String>>;
}

/// Chat-completions enricher; Ollama serves the same API under `/v1`.
pub struct ChatTagEnricher {
    client: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<Secret<String>>,
}

impl ChatTagEnricher {
    pub fn new(base_url: &str, model: String, api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            client: reqwest::Client::builder()
                .timeout(timeout)
                .build()
                .unwrap_or_else(|_| reqwest::Client::new()),
            endpoint: chat_endpoint(base_url),
            model,
            api_key: api_key.map(Secret::new),
        }
    }
}

fn chat_endpoint(base_url: &str) -> String {
    let base = base_url.trim_end_matches('/');
    if base.ends_with("/chat/completions") {
        base.to_string()
    } else if base.ends_with("/v1") {
        format!("{base}/chat/completions")
    } else {
        format!("{base}/v1/chat/completions")
    }
}

pub fn enricher_from_config(
    config: &EnrichmentConfig,
    timeout: Duration,
) -> Option<Box<dyn TagEnricher>> {
    if config.provider == EmbeddingProviderKind::None {
        return None;
    }
    let base_url = config.base_url()?;
    let api_key = config.api_key().map(str::to_string);
    if api_key.is_none() && config.provider != EmbeddingProviderKind::Ollama {
        warn!(provider = %config.provider, "enrichment needs an api_key, skipping");
        return None;
    }
    Some(Box::new(ChatTagEnricher::new(
        base_url,
        config.model.clone(),
        api_key,
        timeout,
    )))
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatReply,
}

#[derive(Deserialize)]
struct ChatReply {
    content: String,
}

#[async_trait]
impl TagEnricher for ChatTagEnricher {
    async fn suggest_tags(&self, memory: &NewMemory) -> anyhow::Result<Vec<String>> {
        let mut prompt = format!("Title: {}\nWhat: {}\n", memory.title, memory.what);
        if let Some(why) = &memory.why {
            prompt.push_str(&format!("Why: {why}\n"));
        }
        if !memory.tags.is_empty() {
            prompt.push_str(&format!("Existing tags: {}\n", memory.tags.join(", ")));
        }
        let request = ChatRequest {
            model: &self.model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: format!(
                        "Suggest up to {MAX_SUGGESTED_TAGS} short lowercase tags for this engineering note. \
                         Reply with a JSON array of strings only."
                    ),
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            temperature: 0.0,
        };

        let mut builder = self.client.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }
        let response = builder
            .send()
            .await?
            .error_for_status()?
            .json::<ChatResponse>()
            .await?;
        let content = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| anyhow::anyhow!("chat response has no choices"))?;
        parse_tag_reply(&content)
    }
}

/// Pull the first JSON array of strings out of a model reply.
pub fn parse_tag_reply(content: &str) -> anyhow::Result<Vec<String>> {
    let start = content
        .find('[')
        .ok_or_else(|| anyhow::anyhow!("reply has no JSON array"))?;
    let end = content
        .rfind(']')
        .filter(|end| *end > start)
        .ok_or_else(|| anyhow::anyhow!("reply has no JSON array"))?;
    let tags: Vec<String> = serde_json::from_str(&content[start..=end])?;
    Ok(tags
        .into_iter()
        .map(|t| t.trim().to_lowercase())
        .filter(|t| !t.is_empty() && t.len() <= 40)
        .take(MAX_SUGGESTED_TAGS)
        .collect())
}
