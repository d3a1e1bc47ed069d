use crate::error::ConfigError;
use crate::models::FileType;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_FILE: &str = "novelseek.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub embedder: EmbedderConfig,

    #[serde(default)]
    pub indexer: IndexerConfig,

    #[serde(default)]
    pub search: SearchConfig,

    /// Independently indexed collections, addressed by `key` in search requests
    #[serde(default = "default_corpora", rename = "corpus")]
    pub corpora: Vec<CorpusConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbedderKind {
    Http,
    Onnx,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbedderConfig {
    #[serde(default = "default_embedder_kind")]
    pub kind: EmbedderKind,

    /// Model service endpoint for the `http` embedder
    #[serde(default = "default_embedder_url")]
    pub url: String,

    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,

    /// Directory holding `model.onnx` and `tokenizer.json` for the `onnx` embedder
    #[serde(default)]
    pub model_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_read_chars")]
    pub read_chars: usize,

    /// How many times a failed batch is retried before it is skipped
    #[serde(default = "default_batch_retries")]
    pub batch_retries: usize,

    /// Upper bound on a single `ffprobe` run
    #[serde(default = "default_probe_timeout")]
    pub probe_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,

    #[serde(default = "default_min_score")]
    pub min_score: f32,

    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorpusConfig {
    pub key: String,
    pub name: String,
    pub root: PathBuf,
    pub catalog: PathBuf,
    pub index: PathBuf,
    pub file_type: FileType,
    pub extensions: Vec<String>,
}

fn default_addr() -> String {
    "127.0.0.1:5000".to_string()
}

fn default_embedder_kind() -> EmbedderKind {
    EmbedderKind::Http
}

fn default_embedder_url() -> String {
    "http://127.0.0.1:8080/embed".to_string()
}

fn default_embed_timeout() -> u64 {
    120
}

fn default_batch_size() -> usize {
    64
}

fn default_read_chars() -> usize {
    1000
}

fn default_batch_retries() -> usize {
    1
}

fn default_probe_timeout() -> u64 {
    30
}

fn default_candidate_limit() -> usize {
    1000
}

fn default_min_score() -> f32 {
    0.3
}

fn default_page_size() -> usize {
    20
}

fn default_corpora() -> Vec<CorpusConfig> {
    vec![CorpusConfig {
        key: "novels".to_string(),
        name: "Local_Novels".to_string(),
        root: PathBuf::from("./novels"),
        catalog: PathBuf::from("db_novels.sqlite"),
        index: PathBuf::from("index_novels.nsvi"),
        file_type: FileType::Text,
        extensions: vec!["txt".to_string(), "md".to_string()],
    }]
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
        }
    }
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self {
            kind: default_embedder_kind(),
            url: default_embedder_url(),
            timeout_secs: default_embed_timeout(),
            model_dir: None,
        }
    }
}

impl EmbedderConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            read_chars: default_read_chars(),
            batch_retries: default_batch_retries(),
            probe_timeout_secs: default_probe_timeout(),
        }
    }
}

impl IndexerConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.probe_timeout_secs)
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            candidate_limit: default_candidate_limit(),
            min_score: default_min_score(),
            page_size: default_page_size(),
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            embedder: EmbedderConfig::default(),
            indexer: IndexerConfig::default(),
            search: SearchConfig::default(),
            corpora: default_corpora(),
        }
    }
}

/// Case-insensitive extension match; configured extensions may carry a leading dot.
pub fn extension_allowed(path: &Path, extensions: &[String]) -> bool {
    let Some(ext) = path.extension().and_then(|e| e.to_str()) else {
        return false;
    };
    extensions
        .iter()
        .any(|allowed| allowed.trim_start_matches('.').eq_ignore_ascii_case(ext))
}

impl AppConfig {
    pub fn from_toml(text: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load the config file, falling back to defaults when it does not exist.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            log::warn!("Config file {:?} not found, using defaults", path);
            return Ok(Self::default());
        }

        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml(&text)?;
        log::info!(
            "Loaded config from {:?} ({} corpora)",
            path,
            config.corpora.len()
        );
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.indexer.batch_size == 0 {
            return Err(ConfigError::Zero("indexer.batch_size"));
        }
        if self.indexer.read_chars == 0 {
            return Err(ConfigError::Zero("indexer.read_chars"));
        }
        if self.indexer.probe_timeout_secs == 0 {
            return Err(ConfigError::Zero("indexer.probe_timeout_secs"));
        }
        if self.embedder.timeout_secs == 0 {
            return Err(ConfigError::Zero("embedder.timeout_secs"));
        }
        if self.search.candidate_limit == 0 {
            return Err(ConfigError::Zero("search.candidate_limit"));
        }
        if self.search.page_size == 0 {
            return Err(ConfigError::Zero("search.page_size"));
        }

        let mut seen = HashSet::new();
        for corpus in &self.corpora {
            if !seen.insert(corpus.key.as_str()) {
                return Err(ConfigError::DuplicateKey(corpus.key.clone()));
            }
            if corpus.extensions.is_empty() {
                return Err(ConfigError::NoExtensions(corpus.key.clone()));
            }
        }
        Ok(())
    }

    pub fn corpus(&self, key: &str) -> Option<&CorpusConfig> {
        self.corpora.iter().find(|c| c.key == key)
    }
}
