use std::{
    ffi::OsString,
    path::{Path, PathBuf},
};

use {
    secrecy::Secret,
    tracing::{debug, warn},
};

use crate::schema::{EchoVaultConfig, EmbeddingProviderKind};

/// File name of the configuration inside the memory home.
pub const CONFIG_FILE: &str = "config.yaml";

/// Starter configuration written by `config init`.
pub const CONFIG_TEMPLATE: &str = "\
# EchoVault configuration

# Embedding provider for semantic search.
# Without this, keyword search (FTS5) still works.
embedding:
  provider: ollama              # none | ollama | openai | openrouter
  model: nomic-embed-text
  # api_key: sk-...            # required for openai / openrouter
  # dimensions: 768            # inferred for well-known models
  timeout_secs: 30

# Optional LLM enrichment (extra tags on save --enrich).
enrichment:
  provider: none                # none | ollama | openai | openrouter

# How memories are retrieved at session start.
# \"auto\" uses vectors when available, falls back to keywords.
context:
  semantic: auto                # auto | always | never
  topup_recent: true            # also include recent memories

redaction:
  sensitivity: standard         # low | standard | strict
";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid configuration in {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("{} already exists", path.display())]
    AlreadyExists { path: PathBuf },
}

/// Resolve the memory home: `$MEMORY_HOME`, else `~/.memory`.
pub fn memory_home() -> PathBuf {
    let home = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf());
    memory_home_from(std::env::var_os("MEMORY_HOME"), home)
}

/// Pure form of [`memory_home`] so resolution can be tested without touching the environment.
pub fn memory_home_from(env_value: Option<OsString>, home_dir: Option<PathBuf>) -> PathBuf {
    if let Some(value) = env_value.filter(|v| !v.is_empty()) {
        return PathBuf::from(value);
    }
    home_dir
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".memory")
}

/// Load `config.yaml`. A missing or empty file yields the defaults.
pub fn load_config(path: &Path) -> Result<EchoVaultConfig, ConfigError> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "no config file, using defaults");
            return Ok(apply_env_overrides(EchoVaultConfig::default()));
        },
        Err(source) => {
            return Err(ConfigError::Read {
                path: path.to_path_buf(),
                source,
            });
        },
    };

    let config = if raw.trim().is_empty() {
        EchoVaultConfig::default()
    } else {
        serde_yaml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?
    };
    Ok(apply_env_overrides(config))
}

/// Write [`CONFIG_TEMPLATE`] to `path`, refusing to clobber an existing file unless `force`.
pub fn write_template(path: &Path, force: bool) -> Result<(), ConfigError> {
    if path.exists() && !force {
        return Err(ConfigError::AlreadyExists {
            path: path.to_path_buf(),
        });
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
            path: parent.to_path_buf(),
            source,
        })?;
    }
    std::fs::write(path, CONFIG_TEMPLATE).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn apply_env_overrides(mut config: EchoVaultConfig) -> EchoVaultConfig {
    if config.embedding.api_key.is_none() {
        let from_env = std::env::var("ECHOVAULT_EMBEDDING_API_KEY").ok().or_else(|| {
            (config.embedding.provider == EmbeddingProviderKind::Openai)
                .then(|| std::env::var("OPENAI_API_KEY").ok())
                .flatten()
        });
        if let Some(key) = from_env.filter(|k| !k.trim().is_empty()) {
            config.embedding.api_key = Some(Secret::new(key));
        }
    }
    if matches!(
        config.embedding.provider,
        EmbeddingProviderKind::Openai | EmbeddingProviderKind::Openrouter
    ) && config.embedding.api_key.is_none()
    {
        warn!(
            provider = %config.embedding.provider,
            "embedding provider needs an api_key; semantic search will be unavailable"
        );
    }
    config
}
