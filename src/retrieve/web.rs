use std::sync::Arc;

use anyhow::Result;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::{EvidenceBatch, EvidenceCache, Retriever};
use crate::serper::{parse_results, Searcher};
use crate::types::EvidenceUnit;

const NO_EVIDENCE: &str = "No evidence.";

/// Web search evidence, one rendered result per claim, served from the
/// on-disk cache whenever the exact query text was searched before.
pub struct WebRetriever {
    searcher: Arc<dyn Searcher>,
    cache: Mutex<EvidenceCache>,
    snippet_cnt: usize,
}

impl WebRetriever {
    pub fn new(searcher: Arc<dyn Searcher>, cache: EvidenceCache, snippet_cnt: usize) -> Self {
        Self { searcher, cache: Mutex::new(cache), snippet_cnt }
    }
}

#[async_trait::async_trait]
impl Retriever for WebRetriever {
    async fn retrieve(
        &self,
        queries: &[Vec<Vec<String>>],
        _reference_answers: &[Vec<String>],
    ) -> Result<EvidenceBatch> {
        let mut cache = self.cache.lock().await;
        let mut results = Vec::with_capacity(queries.len());

        for (i, claims) in queries.iter().enumerate() {
            let texts: Vec<Option<String>> = claims
                .iter()
                .map(|qs| (!qs.is_empty()).then(|| qs.join(" ")))
                .collect();

            let mut misses: Vec<String> = Vec::new();
            for text in texts.iter().flatten() {
                if cache.get(text).is_none() && !misses.contains(text) {
                    misses.push(text.clone());
                }
            }

            if !misses.is_empty() {
                let raw = self.searcher.search_batch(&misses).await?;
                for (query, result) in misses.iter().zip(&raw) {
                    cache.insert(query, parse_results(result, self.snippet_cnt));
                }
                if let Err(e) = cache.save() {
                    warn!(error = %e, "failed to persist web cache");
                }
            }
            debug!(
                sample = i,
                searched = misses.len(),
                cached = texts.len() - misses.len(),
                "web evidence retrieved"
            );

            results.push(
                texts
                    .iter()
                    .map(|text| {
                        let evidence =
                            text.as_deref().and_then(|t| cache.get(t)).unwrap_or(NO_EVIDENCE);
                        vec![EvidenceUnit::text(evidence)]
                    })
                    .collect(),
            );
        }
        Ok(results)
    }
}
