use std::time::Duration;

use crate::llm::Prompt;
use crate::oracle::{ExpectedShape, OracleAdapter, Reply, RetryPolicy};

const SYSTEM: &str =
    "You write search queries that would find evidence to confirm or refute a factual claim.";

fn build_query_prompt(claim: &str) -> Prompt {
    Prompt::new(
        SYSTEM,
        format!("Claim:\n{claim}\n\nReturn a JSON array of short search query strings."),
    )
}

fn parse_queries(reply: Reply) -> Option<(Vec<String>, Option<f64>)> {
    let candidate = reply.first()?;
    let queries = candidate
        .value
        .as_array()?
        .iter()
        .map(|q| q.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()?;
    Some((queries, candidate.ppl))
}

/// Turns claims into search queries.
pub struct QueryGenerator {
    oracle: OracleAdapter,
    policy: RetryPolicy<(Vec<String>, Option<f64>)>,
}

impl QueryGenerator {
    pub fn new(oracle: OracleAdapter, retry_delay: Duration) -> Self {
        Self { oracle, policy: RetryPolicy::Unbounded { delay: retry_delay } }
    }

    pub fn with_policy(mut self, policy: RetryPolicy<(Vec<String>, Option<f64>)>) -> Self {
        self.policy = policy;
        self
    }

    pub async fn call(&self, claims: &[String]) -> (Vec<Vec<String>>, Vec<Option<f64>>) {
        let prompts: Vec<Prompt> = claims.iter().map(|c| build_query_prompt(c)).collect();
        self.oracle
            .resolve(
                "query_generation",
                &prompts,
                ExpectedShape::Sequence,
                &self.policy,
                parse_queries,
            )
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

    #[test]
    fn non_string_queries_are_rejected() {
        let reply = Reply { candidates: vec![Candidate { value: json!(["a", 3]), ppl: None }] };
        assert!(parse_queries(reply).is_none());
    }

    #[test]
    fn string_queries_pass_through() {
        let reply = Reply {
            candidates: vec![Candidate { value: json!(["who", "when"]), ppl: Some(2.0) }],
        };
        assert_eq!(parse_queries(reply), Some((vec!["who".into(), "when".into()], Some(2.0))));
    }
}
