use std::time::Duration;

use anyhow::Result;

use super::{EvidenceBatch, Retriever};
use crate::extraction::query_text;
use crate::llm::Prompt;
use crate::oracle::{ExpectedShape, OracleAdapter, Reply, RetryPolicy};
use crate::shape::split_by_lengths;
use crate::types::EvidenceUnit;

const SYSTEM: &str = "You are a knowledgeable assistant. Write a short, factual background passage \
that answers the question as accurately as you can.";

fn build_knowledge_prompt(question: &str) -> Prompt {
    Prompt::new(SYSTEM, format!("Question:\n{question}\n\nPassage:"))
}

fn parse_passages(reply: Reply) -> Option<Vec<EvidenceUnit>> {
    reply
        .candidates
        .into_iter()
        .map(|c| {
            Some(EvidenceUnit {
                evidence: c.value.as_str()?.to_string(),
                evidence_ppl: c.ppl,
                score: None,
            })
        })
        .collect()
}

/// Background passages generated by the model itself; every sampled
/// candidate becomes one evidence unit.
pub struct KnowledgeRetriever {
    oracle: OracleAdapter,
    policy: RetryPolicy<Vec<EvidenceUnit>>,
}

impl KnowledgeRetriever {
    pub fn new(oracle: OracleAdapter, retry_delay: Duration) -> Self {
        Self { oracle, policy: RetryPolicy::Unbounded { delay: retry_delay } }
    }
}

#[async_trait::async_trait]
impl Retriever for KnowledgeRetriever {
    async fn retrieve(
        &self,
        queries: &[Vec<Vec<String>>],
        _reference_answers: &[Vec<String>],
    ) -> Result<EvidenceBatch> {
        let lengths: Vec<usize> = queries.iter().map(Vec::len).collect();
        let prompts: Vec<Prompt> = queries
            .iter()
            .flatten()
            .map(|qs| build_knowledge_prompt(&query_text(qs)))
            .collect();

        let passages = self
            .oracle
            .resolve("knowledge", &prompts, ExpectedShape::Text, &self.policy, parse_passages)
            .await;
        Ok(split_by_lengths(passages, &lengths)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::{Choice, Completion, Llm};
    use std::sync::Arc;

    struct Sampler;

    #[async_trait::async_trait]
    impl Llm for Sampler {
        async fn chat_many(&self, prompts: Vec<Prompt>) -> Result<Vec<Option<Completion>>> {
            Ok(prompts
                .iter()
                .map(|p| {
                    Some(Completion {
                        choices: vec![
                            Choice {
                                content: format!("{} (a)", p.user.len()),
                                logprobs: Some(vec![0.0]),
                            },
                            Choice { content: "second".into(), logprobs: None },
                        ],
                    })
                })
                .collect())
        }
    }

    #[tokio::test]
    async fn one_unit_per_sampled_candidate() {
        let oracle = OracleAdapter::new(Arc::new(Sampler));
        let retriever = KnowledgeRetriever::new(oracle, Duration::ZERO);
        let queries = vec![
            vec![vec!["q1".to_string()], vec!["q2".to_string()]],
            vec![],
            vec![vec!["q3".to_string()]],
        ];
        let out = retriever.retrieve(&queries, &[]).await.unwrap();
        assert_eq!(out.iter().map(Vec::len).collect::<Vec<_>>(), vec![2, 0, 1]);
        assert_eq!(out[0][0].len(), 2);
        assert_eq!(out[0][0][0].evidence_ppl, Some(1.0));
        assert_eq!(out[0][0][1].evidence, "second");
        assert_eq!(out[0][0][1].evidence_ppl, None);
    }
}
