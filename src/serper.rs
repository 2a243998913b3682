// src/serper.rs
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use governor::{clock::DefaultClock, state::InMemoryState, state::NotKeyed, Quota, RateLimiter};
use nonzero_ext::nonzero;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::warn;

const SERPER_URL: &str = "https://google.serper.dev/search";
pub const NO_RESULT: &str = "No good Google Search Result was found";

type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Batch web search: one raw result object per query, in query order.
#[async_trait::async_trait]
pub trait Searcher: Send + Sync {
    async fn search_batch(&self, queries: &[String]) -> Result<Vec<Value>>;
}

pub struct Serper {
    http: Client,
    key: String,
    limiter: Arc<DirectLimiter>,
    gl: String,
    hl: String,
    max_retries: usize,
}

impl Serper {
    pub fn new(key: String, qps: u32, timeout_ms: u64, max_retries: usize) -> Result<Self> {
        let http = Client::builder().timeout(Duration::from_millis(timeout_ms)).build()?;
        let qps = NonZeroU32::new(qps).unwrap_or(nonzero!(1u32));
        let limiter = Arc::new(RateLimiter::direct(Quota::per_second(qps)));
        Ok(Self {
            http,
            key,
            limiter,
            gl: "us".into(),
            hl: "en".into(),
            max_retries: max_retries.max(1),
        })
    }

    async fn post_batch(&self, payload: &Value) -> Result<Vec<Value>> {
        self.limiter.until_ready().await;
        let resp = self.http
            .post(SERPER_URL)
            .header("X-API-KEY", &self.key)
            .json(payload)
            .send().await?
            .error_for_status()?
            .json::<Vec<Value>>().await?;
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl Searcher for Serper {
    async fn search_batch(&self, queries: &[String]) -> Result<Vec<Value>> {
        if queries.is_empty() {
            return Ok(Vec::new());
        }
        let payload = Value::Array(
            queries.iter().map(|q| json!({ "q": q, "gl": self.gl, "hl": self.hl })).collect(),
        );

        let mut attempt = 0;
        let results = loop {
            attempt += 1;
            match self.post_batch(&payload).await {
                Ok(r) => break r,
                Err(e) if attempt < self.max_retries => {
                    let backoff = Duration::from_millis(500 * (1u64 << attempt.min(6)));
                    warn!(attempt, error = %e, ?backoff, "serper search failed, backing off");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    return Err(e.context(format!("serper search failed after {attempt} attempts")))
                }
            }
        };

        if results.len() != queries.len() {
            bail!("serper returned {} results for {} queries", results.len(), queries.len());
        }
        Ok(results)
    }
}

fn text_of(v: &Value) -> Option<String> {
    match v {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Array(items) if !items.is_empty() => {
            Some(items.iter().filter_map(Value::as_str).collect::<Vec<_>>().join(" "))
        }
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn attributes(v: &Value) -> impl Iterator<Item = String> + '_ {
    v.get("attributes")
        .and_then(Value::as_object)
        .into_iter()
        .flatten()
        .map(|(k, val)| format!("{k}: {}", text_of(val).unwrap_or_default()))
}

/// Renders one search result as evidence text. A direct answer box wins;
/// otherwise knowledge-graph facts and up to `k` organic snippets are listed
/// as `[i] text` lines.
pub fn parse_results(results: &Value, k: usize) -> String {
    let answer_box = results
        .get("answerBox")
        .filter(|v| v.as_object().is_some_and(|o| !o.is_empty()));
    if let Some(answer_box) = answer_box {
        if let Some(answer) = answer_box.get("answer").and_then(text_of) {
            return answer;
        }
        if let Some(snippet) = answer_box.get("snippet").and_then(text_of) {
            return snippet.replace('\n', " ");
        }
        if let Some(highlighted) = answer_box.get("snippetHighlighted").and_then(text_of) {
            return highlighted;
        }
    }

    let mut snippets = Vec::new();
    if let Some(kg) = results.get("knowledgeGraph") {
        if let Some(kind) = kg.get("type").and_then(text_of) {
            let title = kg.get("title").and_then(text_of).unwrap_or_default();
            snippets.push(format!("{title}: {kind}"));
        }
        if let Some(description) = kg.get("description").and_then(text_of) {
            snippets.push(description);
        }
        snippets.extend(attributes(kg));
    }

    let organic = results
        .get("organic")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or_default();
    for result in organic.iter().take(k) {
        if let Some(snippet) = result.get("snippet").and_then(text_of) {
            snippets.push(snippet);
        }
        snippets.extend(attributes(result));
    }

    if snippets.is_empty() {
        return NO_RESULT.to_string();
    }
    snippets
        .iter()
        .enumerate()
        .map(|(i, s)| format!("[{}] {s}", i + 1))
        .collect::<Vec<_>>()
        .join("\n")
}
