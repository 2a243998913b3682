use std::sync::Arc;

use anyhow::{bail, Result};
use reqwest::Client;
use serde_json::{json, Value};
use tracing::debug;

use super::{EvidenceBatch, Retriever};
use crate::types::EvidenceUnit;

/// Ranked passage search over a human-written corpus.
#[async_trait::async_trait]
pub trait PassageIndex: Send + Sync {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<(String, f64)>>;
}

/// BM25 `match` queries against an Elasticsearch index.
pub struct ElasticBm25 {
    http: Client,
    url: String,
    index: String,
    text_field: String,
}

impl ElasticBm25 {
    pub fn new(url: &str, index: &str, text_field: &str) -> Result<Self> {
        Ok(Self {
            http: Client::builder().build()?,
            url: url.trim_end_matches('/').to_string(),
            index: index.to_string(),
            text_field: text_field.to_string(),
        })
    }
}

#[async_trait::async_trait]
impl PassageIndex for ElasticBm25 {
    async fn search(&self, query: &str, k: usize) -> Result<Vec<(String, f64)>> {
        let body = json!({
            "query": { "match": { &self.text_field: query } },
            "size": k,
        });
        let resp: Value = self.http
            .post(format!("{}/{}/_search", self.url, self.index))
            .json(&body)
            .send().await?
            .error_for_status()?
            .json().await?;

        let hits = resp["hits"]["hits"].as_array().cloned().unwrap_or_default();
        Ok(hits
            .iter()
            .filter_map(|hit| {
                let text = hit["_source"][&self.text_field].as_str()?;
                Some((text.to_string(), hit["_score"].as_f64().unwrap_or(0.0)))
            })
            .collect())
    }
}

/// Passages from a human-written index, followed by the sample's reference
/// answers (score 0) for every claim.
pub struct HumanRetriever {
    index: Arc<dyn PassageIndex>,
    search_num: usize,
}

impl HumanRetriever {
    pub fn new(index: Arc<dyn PassageIndex>, search_num: usize) -> Self {
        Self { index, search_num }
    }
}

#[async_trait::async_trait]
impl Retriever for HumanRetriever {
    async fn retrieve(
        &self,
        queries: &[Vec<Vec<String>>],
        reference_answers: &[Vec<String>],
    ) -> Result<EvidenceBatch> {
        if !reference_answers.is_empty() && reference_answers.len() != queries.len() {
            bail!(
                "{} samples but {} reference answer lists",
                queries.len(),
                reference_answers.len()
            );
        }

        let mut results = Vec::with_capacity(queries.len());
        for (i, claims) in queries.iter().enumerate() {
            let answers = reference_answers.get(i).map(Vec::as_slice).unwrap_or_default();
            let mut per_claim = Vec::with_capacity(claims.len());
            for claim_queries in claims {
                let mut evidence = Vec::new();
                if !claim_queries.is_empty() {
                    let hits = self.index.search(&claim_queries.join(" "), self.search_num).await?;
                    evidence.extend(hits.into_iter().map(|(text, score)| EvidenceUnit {
                        evidence: text,
                        evidence_ppl: None,
                        score: Some(score),
                    }));
                }
                evidence.extend(answers.iter().map(|a| EvidenceUnit {
                    evidence: a.clone(),
                    evidence_ppl: None,
                    score: Some(0.0),
                }));
                per_claim.push(evidence);
            }
            debug!(sample = i, claims = per_claim.len(), "human evidence retrieved");
            results.push(per_claim);
        }
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct FakeIndex {
        seen: Mutex<Vec<(String, usize)>>,
    }

    #[async_trait::async_trait]
    impl PassageIndex for FakeIndex {
        async fn search(&self, query: &str, k: usize) -> Result<Vec<(String, f64)>> {
            self.seen.lock().unwrap().push((query.to_string(), k));
            Ok(vec![(format!("passage for {query}"), 7.5)])
        }
    }

    #[tokio::test]
    async fn reference_answers_follow_index_hits() {
        let index = Arc::new(FakeIndex { seen: Mutex::new(Vec::new()) });
        let retriever = HumanRetriever::new(index.clone(), 3);
        let queries = vec![
            vec![vec!["eiffel".to_string(), "height".to_string()], vec![]],
            vec![vec!["louvre".to_string()]],
        ];
        let answers = vec![vec!["It is 330 m tall.".to_string()], vec![]];

        let out = retriever.retrieve(&queries, &answers).await.unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(out[0][0].len(), 2);
        assert_eq!(out[0][0][0].evidence, "passage for eiffel height");
        assert_eq!(out[0][0][0].score, Some(7.5));
        assert_eq!(out[0][0][1].evidence, "It is 330 m tall.");
        assert_eq!(out[0][0][1].score, Some(0.0));
        // no queries: only the reference answer
        assert_eq!(out[0][1].len(), 1);
        assert_eq!(out[1][0].len(), 1);
        assert_eq!(
            *index.seen.lock().unwrap(),
            vec![("eiffel height".to_string(), 3), ("louvre".to_string(), 3)]
        );
    }

    #[tokio::test]
    async fn mismatched_reference_answers_fail() {
        let index = Arc::new(FakeIndex { seen: Mutex::new(Vec::new()) });
        let retriever = HumanRetriever::new(index, 3);
        let queries = vec![vec![vec!["q".to_string()]]];
        let answers = vec![vec![], vec![]];
        assert!(retriever.retrieve(&queries, &answers).await.is_err());
    }
}
