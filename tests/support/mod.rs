#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use ufo_rs::config::PipelineConfig;
use ufo_rs::llm::{Completion, Llm, Prompt};
use ufo_rs::retrieve::{EvidenceBatch, Retriever, RetrieverRegistry};
use ufo_rs::types::{EvidenceUnit, NOANS};
use ufo_rs::Pipeline;

fn between<'a>(text: &'a str, start: &str, end: &str) -> Option<&'a str> {
    text.split(start).nth(1)?.split(end).next()
}

/// A model that behaves like a careful but literal fact checker:
/// - claims are the sentences of the text,
/// - each claim is its own single query,
/// - evidence mentioning "unknown" answers nothing, evidence mentioning
///   "false" answers "no", anything else answers "yes",
/// - a claim is factual exactly when the answer is "yes".
pub struct WorldLlm {
    pub calls: AtomicUsize,
}

impl WorldLlm {
    pub fn new() -> Arc<Self> {
        Arc::new(Self { calls: AtomicUsize::new(0) })
    }

    fn answer(prompt: &Prompt) -> Option<String> {
        let reply = if prompt.system.contains("factual claims") {
            let text = between(&prompt.user, "Text:\n", "\n\nReturn")?;
            let claims: Vec<_> = text
                .split('.')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| json!({ "claim": s }))
                .collect();
            json!(claims)
        } else if prompt.system.contains("search queries") {
            let claim = between(&prompt.user, "Claim:\n", "\n\n")?;
            json!([claim])
        } else if prompt.system.contains("ONLY that evidence") {
            let evidence = between(&prompt.user, "Evidence:\n", "\n\nReturn")?.to_lowercase();
            let answer = if evidence.contains("unknown") {
                NOANS
            } else if evidence.contains("false") {
                "no"
            } else {
                "yes"
            };
            json!({ "reasoning": "read the evidence", "answer": answer })
        } else if prompt.system.contains("fact checker") {
            let answer = between(&prompt.user, "Answer:\n", "\n\nReturn")?;
            let verdict = if answer == "yes" { "TRUE" } else { "FALSE" };
            json!({ "reasoning": "compared", "factuality": verdict })
        } else {
            return None;
        };
        Some(reply.to_string())
    }
}

#[async_trait]
impl Llm for WorldLlm {
    async fn chat_many(&self, prompts: Vec<Prompt>) -> Result<Vec<Option<Completion>>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(prompts.iter().map(|p| Self::answer(p).map(Completion::text)).collect())
    }
}

/// Returns `"<prefix>: <joined queries>"` as the single evidence unit of
/// every claim.
pub struct EchoRetriever {
    pub prefix: &'static str,
}

#[async_trait]
impl Retriever for EchoRetriever {
    async fn retrieve(
        &self,
        queries: &[Vec<Vec<String>>],
        _: &[Vec<String>],
    ) -> Result<EvidenceBatch> {
        Ok(queries
            .iter()
            .map(|claims| {
                claims
                    .iter()
                    .map(|qs| {
                        let text = format!("{}: {}", self.prefix, qs.join(" "));
                        vec![EvidenceUnit::text(text)]
                    })
                    .collect()
            })
            .collect())
    }
}

/// Confirms every claim regardless of content.
pub struct ConfirmingRetriever;

#[async_trait]
impl Retriever for ConfirmingRetriever {
    async fn retrieve(
        &self,
        queries: &[Vec<Vec<String>>],
        _: &[Vec<String>],
    ) -> Result<EvidenceBatch> {
        Ok(queries
            .iter()
            .map(|claims| claims.iter().map(|_| vec![EvidenceUnit::text("confirmed")]).collect())
            .collect())
    }
}

pub struct BrokenRetriever;

#[async_trait]
impl Retriever for BrokenRetriever {
    async fn retrieve(&self, _: &[Vec<Vec<String>>], _: &[Vec<String>]) -> Result<EvidenceBatch> {
        bail!("index offline")
    }
}

pub fn test_config() -> PipelineConfig {
    PipelineConfig {
        batch_size: 2,
        sources: vec!["A".into(), "B".into()],
        oracle_rounds: 3,
        stage_retry_delay_ms: 0,
        ..PipelineConfig::default()
    }
}

/// Source "A" echoes the claim; source "B" confirms everything.
pub fn world_pipeline() -> Pipeline {
    let registry = RetrieverRegistry::new()
        .register("A", Arc::new(EchoRetriever { prefix: "A" }))
        .register("B", Arc::new(ConfirmingRetriever));
    Pipeline::new(WorldLlm::new(), registry, &test_config())
}
