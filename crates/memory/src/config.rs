use std::{path::PathBuf, time::Duration};

use echovault_config::{EchoVaultConfig, SemanticMode, Sensitivity};

use crate::redaction::IGNORE_FILE;

/// Resolved settings for one invocation of the memory core.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Root of the markdown vault (source of truth).
    pub vault_dir: PathBuf,
    /// SQLite index file.
    pub db_path: PathBuf,
    /// `.memoryignore` files, applied in order. Missing files are skipped.
    pub ignore_files: Vec<PathBuf>,
    pub sensitivity: Sensitivity,
    /// Weight for vector ranks in fusion.
    pub vector_weight: f64,
    /// Weight for keyword ranks in fusion.
    pub keyword_weight: f64,
    pub rrf_k: f64,
    pub default_limit: usize,
    pub summary_max_tokens: usize,
    pub summary_max_chars: usize,
    pub semantic: SemanticMode,
    pub topup_recent: bool,
    /// Outer deadline for each provider call.
    pub provider_timeout: Duration,
}

impl MemoryConfig {
    /// Lay out the vault and index under `home` and copy the tunables from `config`.
    pub fn from_home(home: impl Into<PathBuf>, config: &EchoVaultConfig) -> Self {
        let home = home.into();
        Self {
            vault_dir: home.join("vault"),
            db_path: home.join("index.db"),
            ignore_files: vec![home.join(IGNORE_FILE)],
            sensitivity: config.redaction.sensitivity,
            vector_weight: config.search.vector_weight.max(0.0),
            keyword_weight: config.search.keyword_weight.max(0.0),
            rrf_k: if config.search.rrf_k > 0.0 {
                config.search.rrf_k
            } else {
                60.0
            },
            default_limit: config.search.default_limit.max(1),
            summary_max_tokens: config.search.summary_max_tokens.max(1),
            summary_max_chars: config.search.summary_max_chars.max(16),
            semantic: config.context.semantic,
            topup_recent: config.context.topup_recent,
            provider_timeout: Duration::from_secs(config.embedding.timeout_secs.max(1)),
        }
    }

    /// Also honour a project-local `.memoryignore`.
    pub fn with_project_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.ignore_files.push(dir.into().join(IGNORE_FILE));
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_home() {
        let cfg = MemoryConfig::from_home("/data/mem", &EchoVaultConfig::default())
            .with_project_dir("/src/app");
        assert_eq!(cfg.vault_dir, PathBuf::from("/data/mem/vault"));
        assert_eq!(cfg.db_path, PathBuf::from("/data/mem/index.db"));
        assert_eq!(cfg.ignore_files, vec![
            PathBuf::from("/data/mem/.memoryignore"),
            PathBuf::from("/src/app/.memoryignore"),
        ]);
        assert_eq!(cfg.default_limit, 5);
        assert_eq!(cfg.provider_timeout, Duration::from_secs(30));
    }

    #[test]
    fn nonsense_tunables_are_clamped() {
        let mut raw = EchoVaultConfig::default();
        raw.search.rrf_k = -1.0;
        raw.search.default_limit = 0;
        raw.search.summary_max_chars = 0;
        let cfg = MemoryConfig::from_home("/m", &raw);
        assert_eq!(cfg.rrf_k, 60.0);
        assert_eq!(cfg.default_limit, 1);
        assert_eq!(cfg.summary_max_chars, 16);
    }
}
