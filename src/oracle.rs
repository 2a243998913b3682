//! Typed, retried access to the language model.
//!
//! [`OracleAdapter::run`] re-submits only the requests whose previous answer
//! failed validation, for at most `max_rounds` rounds, and then gives up with
//! a `None` for each unsettled slot. Stages decide what a `None` means through
//! a [`RetryPolicy`].

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::llm::{Choice, Completion, Llm, Prompt};

pub const DEFAULT_ROUNDS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectedShape {
    Text,
    Sequence,
    Mapping,
}

impl ExpectedShape {
    /// Parses a raw model answer, returning `None` unless it has this shape.
    pub fn parse(self, raw: &str) -> Option<Value> {
        match self {
            Self::Text => Some(Value::String(raw.trim().to_string())),
            Self::Sequence => parse_structured(raw).filter(Value::is_array),
            Self::Mapping => parse_structured(raw).filter(Value::is_object),
        }
    }
}

fn parse_structured(raw: &str) -> Option<Value> {
    let body = strip_code_fence(raw.trim());
    serde_json::from_str(body)
        .or_else(|_| serde_json::from_str(&fix_literals(body)))
        .ok()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = rest.split_once('\n').map_or("", |(_, body)| body);
    body.trim_end().strip_suffix("```").unwrap_or(body).trim()
}

/// Rewrites a Python literal (`repr` of lists, dicts and strings) as JSON:
/// single-quoted strings become double-quoted and the bare words `True`,
/// `False` and `None` become `true`, `false` and `null`. String contents are
/// never touched.
fn fix_literals(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '"' | '\'' => {
                out.push('"');
                while let Some(ch) = chars.next() {
                    match ch {
                        '\\' => match chars.next() {
                            Some('\'') => out.push('\''),
                            Some(escaped) => {
                                out.push('\\');
                                out.push(escaped);
                            }
                            None => out.push('\\'),
                        },
                        _ if ch == c => break,
                        '"' => out.push_str("\\\""),
                        _ => out.push(ch),
                    }
                }
                out.push('"');
            }
            _ if c.is_alphabetic() || c == '_' => {
                let mut word = String::from(c);
                while let Some(&next) = chars.peek() {
                    if !(next.is_alphanumeric() || next == '_') {
                        break;
                    }
                    word.push(next);
                    chars.next();
                }
                out.push_str(match word.as_str() {
                    "True" => "true",
                    "False" => "false",
                    "None" => "null",
                    other => other,
                });
            }
            _ => out.push(c),
        }
    }
    out
}

/// `exp(-mean(logprobs))`; `None` without token scores.
pub fn perplexity(logprobs: &[f64]) -> Option<f64> {
    if logprobs.is_empty() {
        return None;
    }
    let mean = logprobs.iter().sum::<f64>() / logprobs.len() as f64;
    Some((-mean).exp())
}

#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub value: Value,
    pub ppl: Option<f64>,
}

/// A validated answer: one candidate per sampled choice.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub candidates: Vec<Candidate>,
}

impl Reply {
    pub fn first(self) -> Option<Candidate> {
        self.candidates.into_iter().next()
    }

    fn validate(completion: Completion, shape: ExpectedShape) -> Option<Self> {
        if completion.choices.is_empty() {
            return None;
        }
        let candidates = completion
            .choices
            .into_iter()
            .map(|Choice { content, logprobs }| {
                shape.parse(&content).map(|value| Candidate {
                    value,
                    ppl: logprobs.as_deref().and_then(perplexity),
                })
            })
            .collect::<Option<Vec<_>>>()?;
        Some(Self { candidates })
    }
}

/// What a stage does with requests that are still null after the adapter
/// gave up on them.
#[derive(Debug, Clone)]
pub enum RetryPolicy<T> {
    /// Resubmit the unsettled requests until every one of them settles.
    Unbounded { delay: Duration },
    /// One adapter run; unsettled slots take the fallback value.
    BoundedWithFallback(T),
}

/// Configured name of a [`RetryPolicy`], without its stage-specific payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetryMode {
    Unbounded,
    Fallback,
}

impl RetryMode {
    pub fn policy<T>(self, delay: Duration, fallback: T) -> RetryPolicy<T> {
        match self {
            Self::Unbounded => RetryPolicy::Unbounded { delay },
            Self::Fallback => RetryPolicy::BoundedWithFallback(fallback),
        }
    }
}

#[derive(Clone)]
pub struct OracleAdapter {
    llm: Arc<dyn Llm>,
    max_rounds: usize,
}

impl OracleAdapter {
    pub fn new(llm: Arc<dyn Llm>) -> Self {
        Self { llm, max_rounds: DEFAULT_ROUNDS }
    }

    pub fn with_rounds(mut self, rounds: usize) -> Self {
        self.max_rounds = rounds.max(1);
        self
    }

    pub async fn run(&self, prompts: &[Prompt], shape: ExpectedShape) -> Vec<Option<Reply>> {
        let mut replies: Vec<Option<Reply>> = vec![None; prompts.len()];
        let mut pending: Vec<usize> = (0..prompts.len()).collect();
        let mut round = 0;

        while round < self.max_rounds && !pending.is_empty() {
            round += 1;
            let batch = pending.iter().map(|&i| prompts[i].clone()).collect();
            let completions = match self.llm.chat_many(batch).await {
                Ok(c) if c.len() == pending.len() => c,
                Ok(c) => {
                    warn!(
                        expected = pending.len(),
                        got = c.len(),
                        "oracle returned a mis-sized batch"
                    );
                    vec![None; pending.len()]
                }
                Err(e) => {
                    warn!(error = %e, "oracle batch failed");
                    vec![None; pending.len()]
                }
            };

            let mut unsettled = Vec::new();
            for (idx, completion) in pending.into_iter().zip(completions) {
                match completion.and_then(|c| Reply::validate(c, shape)) {
                    Some(reply) => replies[idx] = Some(reply),
                    None => unsettled.push(idx),
                }
            }
            pending = unsettled;
            debug!(round, pending = pending.len(), ?shape, "oracle round finished");
        }

        if !pending.is_empty() {
            warn!(unsettled = pending.len(), rounds = round, "oracle retries exhausted");
        }
        replies
    }

    /// Results and confidences of the first candidate of every request.
    pub async fn run_single(
        &self,
        prompts: &[Prompt],
        shape: ExpectedShape,
    ) -> (Vec<Option<Value>>, Vec<Option<f64>>) {
        self.run(prompts, shape)
            .await
            .into_iter()
            .map(|reply| match reply.and_then(Reply::first) {
                Some(c) => (Some(c.value), c.ppl),
                None => (None, None),
            })
            .unzip()
    }

    /// Runs `prompts` and converts each reply with `parse` under `policy`.
    /// A reply that `parse` rejects counts as null.
    pub async fn resolve<T, F>(
        &self,
        stage: &str,
        prompts: &[Prompt],
        shape: ExpectedShape,
        policy: &RetryPolicy<T>,
        parse: F,
    ) -> Vec<T>
    where
        T: Clone,
        F: Fn(Reply) -> Option<T>,
    {
        match policy {
            RetryPolicy::BoundedWithFallback(fallback) => {
                let replies = self.run(prompts, shape).await;
                let mut fallbacks = 0;
                let out: Vec<T> = replies
                    .into_iter()
                    .map(|reply| {
                        reply.and_then(&parse).unwrap_or_else(|| {
                            fallbacks += 1;
                            fallback.clone()
                        })
                    })
                    .collect();
                if fallbacks > 0 {
                    warn!(stage, fallbacks, total = out.len(), "substituted fallback records");
                }
                out
            }
            RetryPolicy::Unbounded { delay } => {
                let mut out: Vec<Option<T>> = vec![None; prompts.len()];
                let mut pending: Vec<usize> = (0..prompts.len()).collect();
                let mut attempt = 0usize;
                while !pending.is_empty() {
                    attempt += 1;
                    let batch: Vec<Prompt> = pending.iter().map(|&i| prompts[i].clone()).collect();
                    let replies = self.run(&batch, shape).await;
                    let mut unsettled = Vec::new();
                    for (idx, reply) in pending.into_iter().zip(replies) {
                        match reply.and_then(&parse) {
                            Some(v) => out[idx] = Some(v),
                            None => unsettled.push(idx),
                        }
                    }
                    pending = unsettled;
                    if !pending.is_empty() {
                        warn!(
                            stage,
                            attempt,
                            pending = pending.len(),
                            "null results remain, retrying batch"
                        );
                        tokio::time::sleep(*delay).await;
                    }
                }
                out.into_iter().flatten().collect()
            }
        }
    }
}
