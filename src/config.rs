//! Layered configuration: built-in defaults, then an optional YAML file, then
//! environment variables. CLI flags are applied on top by the binary.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{FactError, Result};
use crate::oracle::RetryMode;
use crate::scoring::AggregationMode;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub llm: LlmConfig,
    pub pipeline: PipelineConfig,
    pub retriever: RetrieverConfig,
    pub aggregation: AggregationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub model: String,
    pub base_url: Option<String>,
    pub api_key: Option<String>,
    pub max_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
    pub logprobs: bool,
    pub top_logprobs: u8,
    pub request_timeout_secs: u64,
    pub request_retries: usize,
    pub max_concurrency: usize,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            model: "Qwen2.5-14B-Instruct".into(),
            base_url: None,
            api_key: None,
            max_tokens: 2500,
            temperature: 0.0,
            top_p: 1.0,
            logprobs: true,
            top_logprobs: 3,
            request_timeout_secs: 1200,
            request_retries: 3,
            max_concurrency: 64,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub batch_size: usize,
    /// Retrieval sources, in registration order.
    pub sources: Vec<String>,
    pub oracle_rounds: usize,
    pub stage_retry_delay_ms: u64,
    pub retry: StageRetry,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            batch_size: 10,
            sources: vec!["human".into(), "web".into(), "knowledge".into()],
            oracle_rounds: 5,
            stage_retry_delay_ms: 1000,
            retry: StageRetry::default(),
        }
    }
}

/// What each stage does with requests the oracle never settled.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StageRetry {
    pub decompose: RetryMode,
    pub query_gen: RetryMode,
    pub extraction: RetryMode,
    pub verification: RetryMode,
}

impl Default for StageRetry {
    fn default() -> Self {
        Self {
            decompose: RetryMode::Unbounded,
            query_gen: RetryMode::Unbounded,
            extraction: RetryMode::Fallback,
            verification: RetryMode::Fallback,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrieverConfig {
    pub human: HumanConfig,
    pub web: WebConfig,
    pub knowledge: KnowledgeConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HumanConfig {
    pub es_url: String,
    pub index_name: String,
    pub text_field: String,
    pub search_num: usize,
}

impl Default for HumanConfig {
    fn default() -> Self {
        Self {
            es_url: "http://localhost:9200".into(),
            index_name: "bm25_psgs_index".into(),
            text_field: "content".into(),
            search_num: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub serper_api_key: Option<String>,
    pub snippet_cnt: usize,
    pub cache_path: Option<String>,
    pub qps: u32,
    pub max_retries: usize,
    pub timeout_ms: u64,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            serper_api_key: None,
            snippet_cnt: 10,
            cache_path: Some("./data/web_cache.json".into()),
            qps: 5,
            max_retries: 5,
            timeout_ms: 60_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct KnowledgeConfig {
    pub temperature: f32,
    pub sampled_n: u8,
    pub top_p: f32,
    pub max_tokens: u32,
}

impl Default for KnowledgeConfig {
    fn default() -> Self {
        Self { temperature: 0.7, sampled_n: 3, top_p: 1.0, max_tokens: 512 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    pub mode: AggregationMode,
    /// Source priority for ordered mode, pooling order for unordered mode.
    pub sources: Vec<String>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            mode: AggregationMode::Ordered,
            sources: vec!["human".into(), "web".into(), "knowledge".into()],
        }
    }
}

impl Config {
    /// Defaults, overlaid with `path` when given, then with the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) => Self::from_yaml(&std::fs::read_to_string(p)?)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(text: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    pub fn apply_env(&mut self) {
        if let Ok(key) = std::env::var("OPENAI_API_KEY") {
            self.llm.api_key = Some(key);
        }
        if let Ok(url) = std::env::var("OPENAI_BASEURL") {
            self.llm.base_url = Some(url);
        }
        if let Ok(model) = std::env::var("OPENAI_MODEL_NAME") {
            self.llm.model = model;
        }
        if let Ok(key) = std::env::var("SERPER_API_KEY") {
            self.retriever.web.serper_api_key = Some(key);
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.pipeline.batch_size == 0 {
            return Err(FactError::Config("pipeline.batch_size must be > 0".into()));
        }
        if self.pipeline.oracle_rounds == 0 {
            return Err(FactError::Config("pipeline.oracle_rounds must be > 0".into()));
        }
        if self.retriever.knowledge.sampled_n == 0 {
            return Err(FactError::Config("retriever.knowledge.sampled_n must be > 0".into()));
        }
        Ok(())
    }
}
