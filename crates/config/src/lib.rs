//! Configuration for EchoVault: `config.yaml` in the memory home.

pub mod loader;
pub mod schema;

pub use {
    loader::{
        CONFIG_FILE, CONFIG_TEMPLATE, ConfigError, load_config, memory_home, memory_home_from,
        write_template,
    },
    schema::{
        ContextConfig, EchoVaultConfig, EmbeddingConfig, EmbeddingProviderKind, EnrichmentConfig,
        RedactionConfig, SearchConfig, SemanticMode, Sensitivity,
    },
};
