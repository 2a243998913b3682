use serde_json::Value;

use crate::error::Result;
use crate::llm::Prompt;
use crate::oracle::{ExpectedShape, OracleAdapter, Reply, RetryPolicy};
use crate::shape::split_by_lengths;
use crate::types::{EvidenceUnit, ExtractionUnit, NOANS};

const SYSTEM: &str = "You read a piece of evidence and answer a question using ONLY that evidence.";

/// One claim with its queries and the evidence retrieved for it.
#[derive(Debug, Clone, Copy)]
pub struct ExtractionInput<'a> {
    pub claim: &'a str,
    pub queries: &'a [String],
    pub evidence: &'a [EvidenceUnit],
}

pub(crate) fn query_text(queries: &[String]) -> String {
    if queries.is_empty() {
        "No query.".to_string()
    } else {
        queries.join(" ")
    }
}

fn build_extraction_prompt(question: &str, evidence: &str) -> Prompt {
    Prompt::new(
        SYSTEM,
        format!(
            "Question:\n{question}\n\nEvidence:\n{evidence}\n\n\
Return JSON: {{\"reasoning\": \"...\", \"answer\": \"...\"}}. \
If the evidence does not answer the question, set answer to \"{NOANS}\"."
        ),
    )
}

pub(crate) fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

fn parse_extraction(reply: Reply) -> Option<ExtractionUnit> {
    let candidate = reply.first()?;
    let obj = candidate.value.as_object()?;
    let answer = obj.get("answer").filter(|v| !v.is_null()).map(value_text)?;
    let reasoning = obj.get("reasoning").map(value_text).unwrap_or_default();
    Some(ExtractionUnit { reasoning, answer, answer_ppl: candidate.ppl })
}

/// Derives a candidate answer from every (claim, evidence) pair.
pub struct Extractor {
    oracle: OracleAdapter,
    policy: RetryPolicy<ExtractionUnit>,
}

impl Extractor {
    pub fn new(oracle: OracleAdapter) -> Self {
        Self { oracle, policy: RetryPolicy::BoundedWithFallback(ExtractionUnit::fallback()) }
    }

    pub fn with_policy(mut self, policy: RetryPolicy<ExtractionUnit>) -> Self {
        self.policy = policy;
        self
    }

    /// Output row `i` has exactly one extraction per evidence unit of input `i`.
    pub async fn call(&self, inputs: &[ExtractionInput<'_>]) -> Result<Vec<Vec<ExtractionUnit>>> {
        let lengths: Vec<usize> = inputs.iter().map(|i| i.evidence.len()).collect();
        let prompts: Vec<Prompt> = inputs
            .iter()
            .flat_map(|input| {
                let question = query_text(input.queries);
                input
                    .evidence
                    .iter()
                    .map(move |e| build_extraction_prompt(&question, &e.evidence))
            })
            .collect();

        let flat = self
            .oracle
            .resolve("extraction", &prompts, ExpectedShape::Mapping, &self.policy, parse_extraction)
            .await;
        split_by_lengths(flat, &lengths)
    }
}
