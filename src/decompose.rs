use std::time::Duration;

use serde_json::Value;

use crate::llm::Prompt;
use crate::oracle::{ExpectedShape, OracleAdapter, Reply, RetryPolicy};

const SYSTEM: &str = "You are an expert at extracting verifiable factual claims. \
Break the text into atomic, self-contained claims that can each be checked independently. \
Ignore opinions, advice and fiction.";

fn build_decompose_prompt(text: &str) -> Prompt {
    Prompt::new(
        SYSTEM,
        format!(
            "Text:\n{text}\n\nReturn a JSON array of objects of the form {{\"claim\": \"...\"}}. \
Return [] if the text contains no verifiable claim."
        ),
    )
}

/// Accepts `[{"claim": "..."}, ...]` or a bare array of strings.
fn parse_claims(reply: Reply) -> Option<(Vec<String>, Option<f64>)> {
    let candidate = reply.first()?;
    let items = candidate.value.as_array()?;
    let claims = items
        .iter()
        .map(|item| match item {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map.get("claim")?.as_str().map(str::to_string),
            _ => None,
        })
        .collect::<Option<Vec<_>>>()?;
    Some((claims, candidate.ppl))
}

/// Splits evaluated texts into atomic claims.
pub struct Decomposer {
    oracle: OracleAdapter,
    policy: RetryPolicy<(Vec<String>, Option<f64>)>,
}

impl Decomposer {
    pub fn new(oracle: OracleAdapter, retry_delay: Duration) -> Self {
        Self { oracle, policy: RetryPolicy::Unbounded { delay: retry_delay } }
    }

    pub fn with_policy(mut self, policy: RetryPolicy<(Vec<String>, Option<f64>)>) -> Self {
        self.policy = policy;
        self
    }

    /// Claims per text, plus the confidence of each text's claim list.
    pub async fn call(&self, texts: &[String]) -> (Vec<Vec<String>>, Vec<Option<f64>>) {
        let prompts: Vec<Prompt> = texts.iter().map(|t| build_decompose_prompt(t)).collect();
        self.oracle
            .resolve("decompose", &prompts, ExpectedShape::Sequence, &self.policy, parse_claims)
            .await
            .into_iter()
            .unzip()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::Candidate;
    use serde_json::json;

    fn reply(value: Value) -> Reply {
        Reply { candidates: vec![Candidate { value, ppl: Some(1.5) }] }
    }

    #[test]
    fn parses_claim_objects_and_strings() {
        let (claims, ppl) = parse_claims(reply(json!([{"claim": "A"}, "B"]))).unwrap();
        assert_eq!(claims, vec!["A", "B"]);
        assert_eq!(ppl, Some(1.5));
    }

    #[test]
    fn empty_list_is_a_valid_answer() {
        let (claims, _) = parse_claims(reply(json!([]))).unwrap();
        assert!(claims.is_empty());
    }

    #[test]
    fn objects_without_claim_are_rejected() {
        assert!(parse_claims(reply(json!([{"text": "A"}]))).is_none());
    }
}
