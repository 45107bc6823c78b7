//! Backend construction from a resolved [`TermplanConfig`].

use std::sync::Arc;

use anyhow::{Context, Result};

use termplan_core::PlanEngine;
use termplan_core::agent::{LanguageModel, OpenAiChatModel};
use termplan_core::catalog::Catalog;
use termplan_core::embedding::{Embedder, HashingEmbedder, OpenAiEmbedder};
use termplan_core::retrieval::memory::load_corpus;
use termplan_core::retrieval::{MemoryIndex, QdrantIndex, VectorIndex};

use crate::config::{IndexBackend, TermplanConfig};

/// Build the embedder and vector index pair.
///
/// Qdrant is paired with the remote embedder its collections were built
/// with; the in-memory index is embedded locally with the hashing
/// embedder, over a corpus file or the built-in catalog.
pub fn build_index(config: &TermplanConfig) -> Result<(Arc<dyn Embedder>, Arc<dyn VectorIndex>)> {
    match &config.index {
        IndexBackend::Qdrant(qdrant) => {
            let embedding = config.embedding.clone().unwrap_or_default();
            if embedding.api_key.is_none() {
                tracing::warn!("no embedding API key configured; set OPENAI_API_KEY");
            }
            let embedder = OpenAiEmbedder::new(embedding).context("failed to build embedding client")?;
            let index = QdrantIndex::new(qdrant.clone()).context("failed to build Qdrant client")?;
            tracing::info!(url = %qdrant.url, "using Qdrant vector store");
            Ok((Arc::new(embedder), Arc::new(index)))
        }
        IndexBackend::Memory { corpus } => {
            let entries = match corpus {
                Some(path) => load_corpus(path)?,
                None => Catalog::builtin().context("built-in catalog is invalid")?.corpus(),
            };
            let embedder = HashingEmbedder::default();
            let index = MemoryIndex::hashed(entries, &embedder);
            tracing::info!(fragments = index.len(), "using in-memory index");
            Ok((Arc::new(embedder), Arc::new(index)))
        }
    }
}

/// Build the chat model client.
pub fn build_model(config: &TermplanConfig) -> Result<Arc<dyn LanguageModel>> {
    if config.chat.api_key.is_none() {
        tracing::warn!("no model API key configured; set GROQ_API_KEY or OPENAI_API_KEY");
    }
    let model = OpenAiChatModel::new(config.chat.clone()).context("failed to build model client")?;
    Ok(Arc::new(model))
}

/// Build a ready engine plus the index it searches.
pub fn build_engine(config: &TermplanConfig) -> Result<(PlanEngine, Arc<dyn VectorIndex>)> {
    let (embedder, index) = build_index(config)?;
    let model = build_model(config)?;
    let engine = PlanEngine::new(config.engine.clone(), embedder, index.clone(), model);
    Ok((engine, index))
}

#[cfg(test)]
mod tests {
    use super::*;

    use termplan_core::config::EngineConfig;
    use termplan_core::agent::OpenAiChatConfig;

    fn memory_config(corpus: Option<std::path::PathBuf>) -> TermplanConfig {
        TermplanConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            cors_origins: Vec::new(),
            index: IndexBackend::Memory { corpus },
            embedding: None,
            chat: OpenAiChatConfig::default(),
            engine: EngineConfig::default(),
        }
    }

    #[tokio::test]
    async fn memory_index_defaults_to_catalog() {
        let (embedder, index) = build_index(&memory_config(None)).unwrap();
        assert_eq!(index.name(), "memory");
        assert_eq!(embedder.dimension(), HashingEmbedder::DEFAULT_DIMENSION);
        assert_eq!(index.list_collections().await.unwrap(), vec!["memory".to_string()]);
    }

    #[test]
    fn missing_corpus_file_is_an_error() {
        let missing = std::path::PathBuf::from("/nonexistent/termplan/corpus.toml");
        assert!(build_index(&memory_config(Some(missing))).is_err());
    }

    #[test]
    fn corpus_file_is_loaded() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("corpus.toml");
        std::fs::write(
            &path,
            r#"
[[fragments]]
id = "std-1"
source_type = "curriculum_standard"
text = "Add and subtract fractions with unlike denominators."
subject = "Math"
grade = "5"
"#,
        )
        .unwrap();
        assert!(build_index(&memory_config(Some(path))).is_ok());
    }

    #[test]
    fn engine_builds_without_keys() {
        let (engine, _index) = build_engine(&memory_config(None)).unwrap();
        assert_eq!(engine.config(), &EngineConfig::default());
    }
}
