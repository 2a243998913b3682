use crate::error::{FactError, Result};
use crate::extraction::value_text;
use crate::llm::Prompt;
use crate::oracle::{ExpectedShape, OracleAdapter, Reply, RetryPolicy};
use crate::shape::split_by_lengths;
use crate::types::{EvidenceUnit, ExtractionUnit, Factuality, VerificationUnit, NOANS};

const SYSTEM: &str =
    "You are a meticulous fact checker. Judge the claim ONLY against the provided answer.";

/// One claim with its evidence and the answers extracted from it.
#[derive(Debug, Clone, Copy)]
pub struct VerificationInput<'a> {
    pub claim: &'a str,
    pub queries: &'a [String],
    pub evidence: &'a [EvidenceUnit],
    pub extractions: &'a [ExtractionUnit],
}

fn build_verify_prompt(claim: &str, answer: &str) -> Prompt {
    Prompt::new(
        SYSTEM,
        format!(
            "Claim:\n{claim}\n\nAnswer:\n{answer}\n\n\
Return JSON: {{\"reasoning\": \"...\", \"factuality\": true | false}}. \
If the answer is \"{NOANS}\" or unrelated to the claim, mention {NOANS} in the reasoning."
        ),
    )
}

fn parse_verdict(reply: Reply) -> Option<VerificationUnit> {
    let candidate = reply.first()?;
    let obj = candidate.value.as_object()?;
    let factuality = Factuality::from_value(obj.get("factuality")?);
    let reasoning = obj.get("reasoning").map(value_text).unwrap_or_default();
    Some(VerificationUnit { factuality, reasoning, factuality_ppl: candidate.ppl })
}

/// Judges every claim against every extracted answer.
pub struct Verifier {
    oracle: OracleAdapter,
    policy: RetryPolicy<VerificationUnit>,
}

impl Verifier {
    pub fn new(oracle: OracleAdapter) -> Self {
        Self { oracle, policy: RetryPolicy::BoundedWithFallback(VerificationUnit::fallback()) }
    }

    pub fn with_policy(mut self, policy: RetryPolicy<VerificationUnit>) -> Self {
        self.policy = policy;
        self
    }

    pub async fn call(
        &self,
        inputs: &[VerificationInput<'_>],
    ) -> Result<Vec<Vec<VerificationUnit>>> {
        for (i, input) in inputs.iter().enumerate() {
            if input.evidence.len() != input.extractions.len() {
                return Err(FactError::ShapeMismatch(format!(
                    "claim {i}: {} evidence units but {} extractions",
                    input.evidence.len(),
                    input.extractions.len()
                )));
            }
        }

        let lengths: Vec<usize> = inputs.iter().map(|i| i.extractions.len()).collect();
        let prompts: Vec<Prompt> = inputs
            .iter()
            .flat_map(|input| {
                input
                    .extractions
                    .iter()
                    .map(move |x| build_verify_prompt(input.claim, &x.answer))
            })
            .collect();

        let flat = self
            .oracle
            .resolve("verification", &prompts, ExpectedShape::Mapping, &self.policy, parse_verdict)
            .await;
        split_by_lengths(flat, &lengths)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeLlm;
    use serde_json::json;

    fn extraction(answer: &str) -> ExtractionUnit {
        ExtractionUnit { reasoning: "r".into(), answer: answer.into(), answer_ppl: None }
    }

    #[tokio::test]
    async fn verdicts_keep_shape_and_fall_back() {
        let llm = FakeLlm::new(|p| {
            if p.user.contains("Answer:\n1889") {
                Some(r#"{"reasoning": "matches", "factuality": "TRUE"}"#.into())
            } else if p.user.contains("Answer:\n1900") {
                Some(r#"{"reasoning": "differs", "factuality": false}"#.into())
            } else {
                Some("garbage".into())
            }
        });
        let verifier = Verifier::new(OracleAdapter::new(llm).with_rounds(1));

        let q = vec!["q".to_string()];
        let ev = vec![EvidenceUnit::text("a"), EvidenceUnit::text("b"), EvidenceUnit::text("c")];
        let ex = vec![extraction("1889"), extraction("1900"), extraction("???")];
        let out = verifier
            .call(&[
                VerificationInput {
                    claim: "Built in 1889",
                    queries: &q,
                    evidence: &ev,
                    extractions: &ex,
                },
                VerificationInput { claim: "none", queries: &q, evidence: &[], extractions: &[] },
            ])
            .await
            .unwrap();

        assert_eq!(out.len(), 2);
        assert_eq!(out[0][0].factuality, Factuality::Valid(true));
        assert_eq!(out[0][1].factuality, Factuality::Valid(false));
        assert_eq!(out[0][2], VerificationUnit::fallback());
        assert!(out[1].is_empty());
    }

    #[tokio::test]
    async fn misaligned_extractions_are_fatal() {
        let llm = FakeLlm::new(|_| None);
        let verifier = Verifier::new(OracleAdapter::new(llm.clone()));
        let ev = vec![EvidenceUnit::text("a")];
        let err = verifier
            .call(&[VerificationInput {
                claim: "c",
                queries: &[],
                evidence: &ev,
                extractions: &[],
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, FactError::ShapeMismatch(_)));
        assert_eq!(llm.calls(), 0);
    }

    #[test]
    fn integer_factuality_is_kept_invalid() {
        use crate::oracle::Candidate;
        let reply = Reply {
            candidates: vec![Candidate {
                value: json!({"factuality": 1, "reasoning": "x"}),
                ppl: Some(1.0),
            }],
        };
        let unit = parse_verdict(reply).unwrap();
        assert_eq!(unit.factuality, Factuality::Invalid(json!(1)));
    }
}
