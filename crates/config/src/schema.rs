use std::{fmt, str::FromStr};

use {
    secrecy::{ExposeSecret, Secret},
    serde::{Deserialize, Serialize, Serializer},
};

/// Root of `config.yaml`. Every section falls back to its defaults when absent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EchoVaultConfig {
    pub embedding: EmbeddingConfig,
    pub enrichment: EnrichmentConfig,
    pub context: ContextConfig,
    pub redaction: RedactionConfig,
    pub search: SearchConfig,
}

impl EchoVaultConfig {
    /// Render the effective configuration with API keys masked.
    pub fn to_display_yaml(&self) -> String {
        serde_yaml::to_string(self).unwrap_or_else(|e| format!("# failed to render config: {e}\n"))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProviderKind {
    None,
    #[default]
    Ollama,
    Openai,
    Openrouter,
}

impl EmbeddingProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Ollama => "ollama",
            Self::Openai => "openai",
            Self::Openrouter => "openrouter",
        }
    }

    /// Endpoint used when `base_url` is not set.
    pub fn default_base_url(&self) -> Option<&'static str> {
        match self {
            Self::None => None,
            Self::Ollama => Some("http://localhost:11434"),
            Self::Openai => Some("https://api.openai.com"),
            Self::Openrouter => Some("https://openrouter.ai/api/v1"),
        }
    }
}

impl fmt::Display for EmbeddingProviderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(serialize_with = "serialize_masked")]
    pub api_key: Option<Secret<String>>,
    /// Vector size produced by `model`. Guessed from well-known model names when unset.
    pub dimensions: Option<usize>,
    /// Upper bound for a single provider round-trip.
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::Ollama,
            model: "nomic-embed-text".into(),
            base_url: None,
            api_key: None,
            dimensions: None,
            timeout_secs: 30,
        }
    }
}

impl EmbeddingConfig {
    pub fn base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .or_else(|| self.provider.default_base_url())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|k| k.expose_secret().as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnrichmentConfig {
    pub provider: EmbeddingProviderKind,
    pub model: String,
    pub base_url: Option<String>,
    #[serde(serialize_with = "serialize_masked")]
    pub api_key: Option<Secret<String>>,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            provider: EmbeddingProviderKind::None,
            model: "llama3.2".into(),
            base_url: None,
            api_key: None,
        }
    }
}

impl EnrichmentConfig {
    pub fn base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .or_else(|| self.provider.default_base_url())
    }

    pub fn api_key(&self) -> Option<&str> {
        self.api_key.as_ref().map(|k| k.expose_secret().as_str())
    }
}

/// Whether retrieval uses embeddings.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SemanticMode {
    /// Use vectors when a provider is configured and the index holds compatible vectors.
    #[default]
    Auto,
    Always,
    Never,
}

impl FromStr for SemanticMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "always" | "true" => Ok(Self::Always),
            "never" | "false" => Ok(Self::Never),
            other => Err(format!("unknown semantic mode: {other}")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub semantic: SemanticMode,
    pub topup_recent: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            semantic: SemanticMode::Auto,
            topup_recent: true,
        }
    }
}

/// How aggressively credential-shaped text is masked.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Sensitivity {
    /// Well-known key prefixes and private key blocks only.
    Low,
    #[default]
    Standard,
    /// Lower entropy threshold; masks most opaque identifiers.
    Strict,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RedactionConfig {
    pub sensitivity: Sensitivity,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SearchConfig {
    pub keyword_weight: f64,
    pub vector_weight: f64,
    pub rrf_k: f64,
    pub default_limit: usize,
    pub summary_max_tokens: usize,
    pub summary_max_chars: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            keyword_weight: 0.3,
            vector_weight: 0.7,
            rrf_k: 60.0,
            default_limit: 5,
            summary_max_tokens: 50,
            summary_max_chars: 320,
        }
    }
}

fn serialize_masked<S: Serializer>(
    value: &Option<Secret<String>>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    match value {
        Some(_) => serializer.serialize_some("<redacted>"),
        None => serializer.serialize_none(),
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let cfg = EchoVaultConfig::default();
        assert_eq!(cfg.embedding.provider, EmbeddingProviderKind::Ollama);
        assert_eq!(cfg.embedding.model, "nomic-embed-text");
        assert_eq!(cfg.embedding.timeout_secs, 30);
        assert_eq!(cfg.enrichment.provider, EmbeddingProviderKind::None);
        assert_eq!(cfg.context.semantic, SemanticMode::Auto);
        assert!(cfg.context.topup_recent);
        assert_eq!(cfg.redaction.sensitivity, Sensitivity::Standard);
        assert_eq!(cfg.search.summary_max_tokens, 50);
    }

    #[test]
    fn display_masks_api_keys() {
        let mut cfg = EchoVaultConfig::default();
        cfg.embedding.api_key = Some(Secret::new("sk-live-abcdef".into()));
        let rendered = cfg.to_display_yaml();
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("sk-live-abcdef"));
    }

    #[test]
    fn semantic_mode_parses_booleans() {
        assert_eq!("true".parse::<SemanticMode>().unwrap(), SemanticMode::Always);
        assert_eq!("never".parse::<SemanticMode>().unwrap(), SemanticMode::Never);
        assert!("sometimes".parse::<SemanticMode>().is_err());
    }
}
