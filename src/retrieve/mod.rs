//! Evidence sources, selected by name.

pub mod cache;
pub mod human;
pub mod knowledge;
pub mod web;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use indexmap::IndexMap;

use crate::config::Config;
use crate::error::{FactError, Result as FactResult};
use crate::llm::openai::{LlmClient, SamplingParams};
use crate::oracle::OracleAdapter;
use crate::serper::Serper;
use crate::types::EvidenceUnit;

pub use cache::EvidenceCache;
pub use human::{ElasticBm25, HumanRetriever, PassageIndex};
pub use knowledge::KnowledgeRetriever;
pub use web::WebRetriever;

/// Evidence per sample, per claim: one list of units for every claim.
pub type EvidenceBatch = Vec<Vec<Vec<EvidenceUnit>>>;

/// An evidence source. `queries[s][c]` holds the search queries of claim `c`
/// in sample `s`; the result must have exactly that sample/claim shape.
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    async fn retrieve(
        &self,
        queries: &[Vec<Vec<String>>],
        reference_answers: &[Vec<String>],
    ) -> Result<EvidenceBatch>;
}

/// Configured sources in registration order.
#[derive(Clone, Default)]
pub struct RetrieverRegistry {
    sources: IndexMap<String, Arc<dyn Retriever>>,
}

impl RetrieverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, name: impl Into<String>, retriever: Arc<dyn Retriever>) -> Self {
        self.sources.insert(name.into(), retriever);
        self
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.sources.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Arc<dyn Retriever>)> {
        self.sources.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.sources.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Builds every source named in `pipeline.sources`.
    pub fn from_config(config: &Config) -> FactResult<Self> {
        let mut registry = Self::new();
        for name in &config.pipeline.sources {
            let retriever: Arc<dyn Retriever> = match name.as_str() {
                "human" => {
                    let cfg = &config.retriever.human;
                    let index = ElasticBm25::new(&cfg.es_url, &cfg.index_name, &cfg.text_field)
                        .map_err(|e| FactError::Config(e.to_string()))?;
                    Arc::new(HumanRetriever::new(Arc::new(index), cfg.search_num))
                }
                "web" => {
                    let cfg = &config.retriever.web;
                    let key = cfg
                        .serper_api_key
                        .clone()
                        .filter(|k| !k.is_empty())
                        .ok_or_else(|| {
                            FactError::Config("web source needs a Serper API key".into())
                        })?;
                    let serper = Serper::new(key, cfg.qps, cfg.timeout_ms, cfg.max_retries)
                        .map_err(|e| FactError::Config(e.to_string()))?;
                    let cache = match &cfg.cache_path {
                        Some(path) => EvidenceCache::load(path),
                        None => EvidenceCache::in_memory(),
                    };
                    Arc::new(WebRetriever::new(Arc::new(serper), cache, cfg.snippet_cnt))
                }
                "knowledge" => {
                    let cfg = &config.retriever.knowledge;
                    let llm = LlmClient::from_config(&config.llm).with_params(SamplingParams {
                        max_tokens: cfg.max_tokens,
                        temperature: cfg.temperature,
                        top_p: cfg.top_p,
                        n: cfg.sampled_n,
                        logprobs: config.llm.logprobs,
                        top_logprobs: config.llm.top_logprobs,
                    });
                    let oracle = OracleAdapter::new(Arc::new(llm))
                        .with_rounds(config.pipeline.oracle_rounds);
                    let delay = Duration::from_millis(config.pipeline.stage_retry_delay_ms);
                    Arc::new(KnowledgeRetriever::new(oracle, delay))
                }
                other => return Err(FactError::UnknownSource(other.to_string())),
            };
            registry = registry.register(name.clone(), retriever);
        }
        Ok(registry)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Empty;

    #[async_trait::async_trait]
    impl Retriever for Empty {
        async fn retrieve(
            &self,
            queries: &[Vec<Vec<String>>],
            _: &[Vec<String>],
        ) -> Result<EvidenceBatch> {
            Ok(queries.iter().map(|s| vec![Vec::new(); s.len()]).collect())
        }
    }

    #[test]
    fn registration_order_is_kept() {
        let reg = RetrieverRegistry::new()
            .register("web", Arc::new(Empty))
            .register("human", Arc::new(Empty))
            .register("knowledge", Arc::new(Empty));
        assert_eq!(reg.names().collect::<Vec<_>>(), vec!["web", "human", "knowledge"]);
        assert_eq!(reg.len(), 3);
        assert!(!reg.is_empty());
        assert!(RetrieverRegistry::new().is_empty());
    }

    #[test]
    fn unknown_source_name_is_rejected() {
        let mut config = Config::default();
        config.pipeline.sources = vec!["template".into()];
        assert!(matches!(
            RetrieverRegistry::from_config(&config),
            Err(FactError::UnknownSource(name)) if name == "template"
        ));
    }

    #[test]
    fn web_source_requires_key() {
        let mut config = Config::default();
        config.pipeline.sources = vec!["web".into()];
        config.retriever.web.serper_api_key = None;
        assert!(matches!(RetrieverRegistry::from_config(&config), Err(FactError::Config(_))));
    }
}
