//! Configuration file management for termplan.
//!
//! Provides a TOML-based config file at `~/.config/termplan/config.toml` and
//! a resolution chain: CLI flag > env var > config file > default.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use termplan_core::agent::OpenAiChatConfig;
use termplan_core::config::EngineConfig;
use termplan_core::embedding::OpenAiEmbedderConfig;
use termplan_core::retrieval::QdrantConfig;

pub const DEFAULT_HOST: &str = "127.0.0.1";
pub const DEFAULT_PORT: u16 = 8000;

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigFile {
    pub server: ServerSection,
    pub vector_store: VectorStoreSection,
    pub model: ModelSection,
    pub embedding: EmbeddingSection,
    pub engine: EngineConfig,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Allowed CORS origins; empty allows any origin.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub cors_origins: Vec<String>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VectorStoreSection {
    /// Qdrant URL. Without one the built-in catalog is searched in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub collection: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filter_payload: Option<bool>,
    /// TOML corpus file for the in-memory index.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub corpus: Option<PathBuf>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,
}

#[derive(Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EmbeddingSection {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dimension: Option<usize>,
}

fn redacted(key: &Option<String>) -> &'static str {
    if key.is_some() { "Some(<redacted>)" } else { "None" }
}

impl fmt::Debug for VectorStoreSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VectorStoreSection")
            .field("url", &self.url)
            .field("api_key", &redacted(&self.api_key))
            .field("collection", &self.collection)
            .field("filter_payload", &self.filter_payload)
            .field("corpus", &self.corpus)
            .finish()
    }
}

impl fmt::Debug for ModelSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelSection")
            .field("base_url", &self.base_url)
            .field("api_key", &redacted(&self.api_key))
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .finish()
    }
}

impl fmt::Debug for EmbeddingSection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmbeddingSection")
            .field("base_url", &self.base_url)
            .field("api_key", &redacted(&self.api_key))
            .field("model", &self.model)
            .field("dimension", &self.dimension)
            .finish()
    }
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the termplan config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/termplan` or
/// `~/.config/termplan`, also on macOS.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("termplan");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("termplan")
}

/// Return the path to the termplan config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read / write
// -----------------------------------------------------------------------

/// Load and parse a config file.
pub fn load_config_from(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let config: ConfigFile = toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Serialize and write the config file, creating parent dirs as needed.
/// Sets file permissions to 0600 on Unix.
pub fn save_config_to(config: &ConfigFile, path: &Path) -> Result<()> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create config directory {}", dir.display()))?;
    }

    let contents = toml::to_string_pretty(config).context("failed to serialize config")?;
    std::fs::write(path, &contents)
        .with_context(|| format!("failed to write config file at {}", path.display()))?;

    // Owner read/write only: the file may hold API keys.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o600);
        std::fs::set_permissions(path, perms)
            .with_context(|| format!("failed to set permissions on {}", path.display()))?;
    }

    Ok(())
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line; they win over everything else.
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub host: Option<String>,
    pub port: Option<u16>,
    pub qdrant_url: Option<String>,
    pub model: Option<String>,
}

/// Where reference fragments are searched.
#[derive(Debug, Clone)]
pub enum IndexBackend {
    Qdrant(QdrantConfig),
    /// In-memory index over a corpus file, or the built-in catalog.
    Memory { corpus: Option<PathBuf> },
}

/// Fully resolved configuration, ready for use.
#[derive(Debug, Clone)]
pub struct TermplanConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    pub index: IndexBackend,
    /// Remote embedding backend; `None` uses the local hashing embedder.
    pub embedding: Option<OpenAiEmbedderConfig>,
    pub chat: OpenAiChatConfig,
    pub engine: EngineConfig,
}

/// A non-empty environment variable.
fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn first(values: impl IntoIterator<Item = Option<String>>) -> Option<String> {
    values.into_iter().flatten().next()
}

impl TermplanConfig {
    /// Resolve configuration using the chain: CLI flag > env var > config
    /// file > default.
    ///
    /// - Qdrant: `--qdrant-url` > `QDRANT_URL` > `vector_store.url`; none
    ///   selects the in-memory index
    /// - Model key: `GROQ_API_KEY` > `OPENAI_API_KEY` > `model.api_key`
    /// - Embedding key: `OPENAI_API_KEY` > `embedding.api_key`
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = match &cli.config {
            Some(path) => load_config_from(path)?,
            None => {
                let path = config_path();
                if path.exists() {
                    load_config_from(&path)?
                } else {
                    ConfigFile::default()
                }
            }
        };
        Self::from_parts(cli, file)
    }

    fn from_parts(cli: &CliOverrides, file: ConfigFile) -> Result<Self> {
        let host = first([cli.host.clone(), env_var("HOST"), file.server.host])
            .unwrap_or_else(|| DEFAULT_HOST.to_string());
        let port = match (cli.port, env_var("PORT")) {
            (Some(p), _) => p,
            (None, Some(p)) => p
                .parse()
                .with_context(|| format!("PORT env var is not a valid port: {p}"))?,
            (None, None) => file.server.port.unwrap_or(DEFAULT_PORT),
        };

        let store = file.vector_store;
        let qdrant_url = first([cli.qdrant_url.clone(), env_var("QDRANT_URL"), store.url]);
        let index = match qdrant_url {
            Some(url) => IndexBackend::Qdrant(QdrantConfig {
                url,
                api_key: first([env_var("QDRANT_API_KEY"), store.api_key]),
                collection: first([env_var("QDRANT_COLLECTION"), store.collection]),
                filter_payload: store.filter_payload.unwrap_or(false),
                ..QdrantConfig::default()
            }),
            None => IndexBackend::Memory {
                corpus: store.corpus,
            },
        };

        let embedding = match index {
            IndexBackend::Qdrant(_) => {
                let defaults = OpenAiEmbedderConfig::default();
                let section = file.embedding;
                Some(OpenAiEmbedderConfig {
                    base_url: first([env_var("EMBEDDING_BASE_URL"), section.base_url]).unwrap_or(defaults.base_url),
                    api_key: first([env_var("OPENAI_API_KEY"), section.api_key]),
                    model: first([env_var("EMBEDDING_MODEL"), section.model]).unwrap_or(defaults.model),
                    dimension: section.dimension.unwrap_or(defaults.dimension),
                    ..defaults
                })
            }
            IndexBackend::Memory { .. } => None,
        };

        let defaults = OpenAiChatConfig::default();
        let section = file.model;
        let chat = OpenAiChatConfig {
            base_url: first([env_var("LLM_BASE_URL"), section.base_url]).unwrap_or(defaults.base_url),
            api_key: first([env_var("GROQ_API_KEY"), env_var("OPENAI_API_KEY"), section.api_key]),
            model: first([cli.model.clone(), env_var("LLM_MODEL"), section.model]).unwrap_or(defaults.model),
            timeout: section.timeout_secs.map(Duration::from_secs).unwrap_or(defaults.timeout),
        };

        Ok(Self {
            host,
            port,
            cors_origins: file.server.cors_origins,
            index,
            embedding,
            chat,
            engine: file.engine,
        })
    }
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const VARS: [&str; 12] = [
        "HOST",
        "PORT",
        "QDRANT_URL",
        "QDRANT_API_KEY",
        "QDRANT_COLLECTION",
        "LLM_BASE_URL",
        "GROQ_API_KEY",
        "OPENAI_API_KEY",
        "LLM_MODEL",
        "EMBEDDING_BASE_URL",
        "EMBEDDING_MODEL",
        "XDG_CONFIG_HOME",
    ];

    fn lock_env() -> std::sync::MutexGuard<'static, ()> {
        let guard = crate::test_util::lock_env();
        for var in VARS {
            unsafe { std::env::remove_var(var) };
        }
        guard
    }

    #[test]
    fn save_and_load_config_roundtrip() {
        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("termplan").join("config.toml");

        let original = ConfigFile {
            vector_store: VectorStoreSection {
                url: Some("http://qdrant:6333".to_string()),
                ..VectorStoreSection::default()
            },
            model: ModelSection {
                api_key: Some("gsk-test".to_string()),
                ..ModelSection::default()
            },
            ..ConfigFile::default()
        };
        save_config_to(&original, &path).unwrap();

        let loaded = load_config_from(&path).unwrap();
        assert_eq!(loaded.vector_store.url.as_deref(), Some("http://qdrant:6333"));
        assert_eq!(loaded.model.api_key.as_deref(), Some("gsk-test"));
        assert_eq!(loaded.engine, EngineConfig::default());
    }

    #[cfg(unix)]
    #[test]
    fn save_config_sets_permissions() {
        use std::os::unix::fs::PermissionsExt;

        let _lock = lock_env();
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        save_config_to(&ConfigFile::default(), &path).unwrap();

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }

    #[test]
    fn defaults_use_memory_index_and_groq() {
        let _lock = lock_env();
        let config = TermplanConfig::from_parts(&CliOverrides::default(), ConfigFile::default()).unwrap();
        assert_eq!(config.host, DEFAULT_HOST);
        assert_eq!(config.port, DEFAULT_PORT);
        assert!(matches!(config.index, IndexBackend::Memory { corpus: None }));
        assert!(config.embedding.is_none());
        assert_eq!(config.chat.base_url, "https://api.groq.com/openai/v1");
        assert_eq!(config.chat.api_key, None);
    }

    #[test]
    fn cli_flag_overrides_env_and_file() {
        let _lock = lock_env();
        unsafe { std::env::set_var("QDRANT_URL", "http://env:6333") };
        let file = ConfigFile {
            vector_store: VectorStoreSection {
                url: Some("http://file:6333".to_string()),
                ..VectorStoreSection::default()
            },
            ..ConfigFile::default()
        };
        let cli = CliOverrides {
            qdrant_url: Some("http://cli:6333".to_string()),
            ..CliOverrides::default()
        };
        let config = TermplanConfig::from_parts(&cli, file).unwrap();
        unsafe { std::env::remove_var("QDRANT_URL") };

        match config.index {
            IndexBackend::Qdrant(q) => assert_eq!(q.url, "http://cli:6333"),
            other => panic!("expected qdrant, got {other:?}"),
        }
        assert!(config.embedding.is_some());
    }

    #[test]
    fn env_overrides_file() {
        let _lock = lock_env();
        unsafe { std::env::set_var("LLM_MODEL", "env-model") };
        unsafe { std::env::set_var("PORT", "9100") };
        let file = ConfigFile {
            model: ModelSection {
                model: Some("file-model".to_string()),
                ..ModelSection::default()
            },
            server: ServerSection {
                port: Some(7000),
                ..ServerSection::default()
            },
            ..ConfigFile::default()
        };
        let config = TermplanConfig::from_parts(&CliOverrides::default(), file).unwrap();
        unsafe { std::env::remove_var("LLM_MODEL") };
        unsafe { std::env::remove_var("PORT") };

        assert_eq!(config.chat.model, "env-model");
        assert_eq!(config.port, 9100);
    }

    #[test]
    fn groq_key_preferred_over_openai_key_for_the_model() {
        let _lock = lock_env();
        unsafe { std::env::set_var("GROQ_API_KEY", "gsk-groq") };
        unsafe { std::env::set_var("OPENAI_API_KEY", "sk-openai") };
        unsafe { std::env::set_var("QDRANT_URL", "http://env:6333") };
        let config = TermplanConfig::from_parts(&CliOverrides::default(), ConfigFile::default()).unwrap();
        for var in ["GROQ_API_KEY", "OPENAI_API_KEY", "QDRANT_URL"] {
            unsafe { std::env::remove_var(var) };
        }

        assert_eq!(config.chat.api_key.as_deref(), Some("gsk-groq"));
        assert_eq!(
            config.embedding.and_then(|e| e.api_key).as_deref(),
            Some("sk-openai")
        );
    }

    #[test]
    fn invalid_port_env_is_an_error() {
        let _lock = lock_env();
        unsafe { std::env::set_var("PORT", "eighty") };
        let result = TermplanConfig::from_parts(&CliOverrides::default(), ConfigFile::default());
        unsafe { std::env::remove_var("PORT") };
        assert!(result.is_err());
    }

    #[test]
    fn debug_output_redacts_keys() {
        let section = ModelSection {
            api_key: Some("gsk-very-secret".to_string()),
            ..ModelSection::default()
        };
        let printed = format!("{section:?}");
        assert!(!printed.contains("gsk-very-secret"));
        assert!(printed.contains("<redacted>"));
    }

    #[test]
    fn partial_engine_section_keeps_defaults() {
        let file: ConfigFile = toml::from_str(
            r#"
[engine]
top_k = 20

[server]
port = 8080
"#,
        )
        .unwrap();
        assert_eq!(file.engine.top_k, 20);
        assert_eq!(file.engine.max_generation_rounds, EngineConfig::default().max_generation_rounds);
        assert_eq!(file.server.port, Some(8080));
    }

    #[test]
    fn config_path_ends_with_expected_filename() {
        let _lock = lock_env();
        let path = config_path();
        assert!(
            path.ends_with("termplan/config.toml"),
            "unexpected config path: {}",
            path.display()
        );
    }
}
