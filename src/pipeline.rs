//! Five ordered stages over the whole dataset: decompose, generate queries,
//! retrieve, extract, verify. Every stage takes the samples produced by the
//! previous one and hands them back with new fields; nothing is overwritten.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{Config, PipelineConfig};
use crate::decompose::Decomposer;
use crate::error::{FactError, Result};
use crate::extraction::{ExtractionInput, Extractor};
use crate::llm::{openai::LlmClient, Llm};
use crate::oracle::OracleAdapter;
use crate::query_gen::QueryGenerator;
use crate::retrieve::RetrieverRegistry;
use crate::shape::{flatten, restore, shape_of, Nested};
use crate::types::{ClaimRecord, EvidenceUnit, ExtractionUnit, Sample, VerificationUnit};
use crate::verification::{VerificationInput, Verifier};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Decompose,
    GenerateQueries,
    Retrieve,
    Extract,
    Verify,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Decompose => "decompose",
            Self::GenerateQueries => "generate_queries",
            Self::Retrieve => "retrieve",
            Self::Extract => "extract",
            Self::Verify => "verify",
        };
        f.write_str(name)
    }
}

pub struct Pipeline {
    decomposer: Decomposer,
    generator: QueryGenerator,
    retrievers: RetrieverRegistry,
    extractor: Extractor,
    verifier: Verifier,
    batch_size: usize,
}

impl Pipeline {
    pub fn new(llm: Arc<dyn Llm>, retrievers: RetrieverRegistry, cfg: &PipelineConfig) -> Self {
        let oracle = OracleAdapter::new(llm).with_rounds(cfg.oracle_rounds);
        let delay = Duration::from_millis(cfg.stage_retry_delay_ms);
        let retry = &cfg.retry;
        if retrievers.is_empty() {
            warn!("no retrieval sources registered; claims will get no evidence");
        }
        Self {
            decomposer: Decomposer::new(oracle.clone(), delay)
                .with_policy(retry.decompose.policy(delay, (Vec::new(), None))),
            generator: QueryGenerator::new(oracle.clone(), delay)
                .with_policy(retry.query_gen.policy(delay, (Vec::new(), None))),
            retrievers,
            extractor: Extractor::new(oracle.clone())
                .with_policy(retry.extraction.policy(delay, ExtractionUnit::fallback())),
            verifier: Verifier::new(oracle)
                .with_policy(retry.verification.policy(delay, VerificationUnit::fallback())),
            batch_size: cfg.batch_size.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Result<Self> {
        let llm = Arc::new(LlmClient::from_config(&config.llm));
        let retrievers = RetrieverRegistry::from_config(config)?;
        Ok(Self::new(llm, retrievers, &config.pipeline))
    }

    pub async fn run(&self, samples: Vec<Sample>) -> Result<Vec<Sample>> {
        let samples = self.decompose(samples).await?;
        let samples = self.generate_queries(samples).await?;
        let samples = self.retrieve(samples).await?;
        let samples = self.extract(samples).await?;
        self.verify(samples).await
    }

    pub async fn decompose(&self, mut samples: Vec<Sample>) -> Result<Vec<Sample>> {
        let started = Instant::now();
        if let Some(i) = samples.iter().position(|s| !s.output.is_empty()) {
            return Err(FactError::AlreadyWritten { field: "claims".into(), sample: i });
        }

        let texts: Vec<String> = samples.iter().map(|s| s.response.clone()).collect();
        let batches = texts.len().div_ceil(self.batch_size);
        let mut claims = Vec::with_capacity(texts.len());
        let mut claims_ppl = Vec::with_capacity(texts.len());
        for (b, batch) in texts.chunks(self.batch_size).enumerate() {
            let (c, p) = self.decomposer.call(batch).await;
            claims.extend(c);
            claims_ppl.extend(p);
            debug!(stage = %Stage::Decompose, batch = b + 1, of = batches, "batch done");
        }

        let mut total = 0;
        for (sample, (claims, ppl)) in samples.iter_mut().zip(claims.into_iter().zip(claims_ppl)) {
            total += claims.len();
            sample.output = claims.into_iter().map(|c| ClaimRecord::new(c, ppl)).collect();
        }
        info!(
            stage = %Stage::Decompose,
            samples = samples.len(),
            claims = total,
            elapsed = ?started.elapsed(),
            "stage finished"
        );
        Ok(samples)
    }

    pub async fn generate_queries(&self, mut samples: Vec<Sample>) -> Result<Vec<Sample>> {
        let started = Instant::now();
        ensure_unwritten(&samples, "queries", |c| c.queries.is_some())?;

        let claims: Vec<Vec<String>> = samples
            .iter()
            .map(|s| s.output.iter().map(|c| c.claim.clone()).collect())
            .collect();
        let nested = Nested::from_ragged(claims);
        let structure = shape_of(&nested);
        let flat = flatten(&nested);

        let batches = flat.len().div_ceil(self.batch_size);
        let mut generated = Vec::with_capacity(flat.len());
        for (b, batch) in flat.chunks(self.batch_size).enumerate() {
            let (queries, ppl) = self.generator.call(batch).await;
            generated.extend(queries.into_iter().zip(ppl));
            debug!(stage = %Stage::GenerateQueries, batch = b + 1, of = batches, "batch done");
        }

        let restored = restore(generated, &structure)?;
        for (i, (sample, node)) in samples.iter_mut().zip(restored).enumerate() {
            let per_claim = node.into_leaves();
            if per_claim.len() != sample.output.len() {
                return Err(FactError::ShapeMismatch(format!(
                    "sample {i}: {} claims but {} query lists",
                    sample.output.len(),
                    per_claim.len()
                )));
            }
            for (record, (queries, ppl)) in sample.output.iter_mut().zip(per_claim) {
                record.queries = Some(queries);
                record.queries_ppl = ppl;
            }
        }
        info!(
            stage = %Stage::GenerateQueries,
            claims = flat.len(),
            elapsed = ?started.elapsed(),
            "stage finished"
        );
        Ok(samples)
    }

    pub async fn retrieve(&self, mut samples: Vec<Sample>) -> Result<Vec<Sample>> {
        let queries: Vec<Vec<Vec<String>>> = samples
            .iter()
            .map(|s| s.output.iter().map(|c| c.queries().to_vec()).collect())
            .collect();
        let references: Vec<Vec<String>> =
            samples.iter().map(|s| s.reference_answers.clone()).collect();

        let total = self.retrievers.len();
        for (n, (name, retriever)) in self.retrievers.iter().enumerate() {
            let started = Instant::now();
            ensure_unwritten(&samples, &format!("{name}_sources"), |c| {
                c.track(name).is_some_and(|t| t.sources.is_some())
            })?;

            let evidence = retriever
                .retrieve(&queries, &references)
                .await
                .map_err(|e| FactError::retrieval(name, e))?;

            if evidence.len() != samples.len() {
                return Err(FactError::ShapeMismatch(format!(
                    "source `{name}` returned {} samples, expected {}",
                    evidence.len(),
                    samples.len()
                )));
            }
            for (i, (sample, per_claim)) in samples.iter_mut().zip(evidence).enumerate() {
                if per_claim.len() != sample.output.len() {
                    return Err(FactError::ShapeMismatch(format!(
                        "source `{name}`, sample {i}: {} evidence lists for {} claims",
                        per_claim.len(),
                        sample.output.len()
                    )));
                }
                for (record, units) in sample.output.iter_mut().zip(per_claim) {
                    record.track_mut(name).sources = Some(units);
                }
            }
            info!(
                stage = %Stage::Retrieve,
                source = name,
                index = n + 1,
                total,
                elapsed = ?started.elapsed(),
                "source finished"
            );
        }
        Ok(samples)
    }

    pub async fn extract(&self, mut samples: Vec<Sample>) -> Result<Vec<Sample>> {
        let total = self.retrievers.len();
        for (n, name) in self.retrievers.names().enumerate() {
            let started = Instant::now();
            ensure_unwritten(&samples, &format!("{name}_extractions"), |c| {
                c.track(name).is_some_and(|t| t.extractions.is_some())
            })?;

            for (i, sample) in samples.iter_mut().enumerate() {
                let extractions = {
                    let inputs = sample
                        .output
                        .iter()
                        .map(|c| {
                            Ok(ExtractionInput {
                                claim: &c.claim,
                                queries: c.queries(),
                                evidence: evidence_of(c, name, i)?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    self.extractor.call(&inputs).await?
                };
                for (record, units) in sample.output.iter_mut().zip(extractions) {
                    record.track_mut(name).extractions = Some(units);
                }
                debug!(stage = %Stage::Extract, source = name, sample = i, "sample done");
            }
            info!(
                stage = %Stage::Extract,
                source = name,
                index = n + 1,
                total,
                elapsed = ?started.elapsed(),
                "source finished"
            );
        }
        Ok(samples)
    }

    pub async fn verify(&self, mut samples: Vec<Sample>) -> Result<Vec<Sample>> {
        let total = self.retrievers.len();
        for (n, name) in self.retrievers.names().enumerate() {
            let started = Instant::now();
            ensure_unwritten(&samples, &format!("{name}_details"), |c| {
                c.track(name).is_some_and(|t| t.details.is_some())
            })?;

            for (i, sample) in samples.iter_mut().enumerate() {
                let details = {
                    let inputs = sample
                        .output
                        .iter()
                        .map(|c| {
                            Ok(VerificationInput {
                                claim: &c.claim,
                                queries: c.queries(),
                                evidence: evidence_of(c, name, i)?,
                                extractions: extractions_of(c, name, i)?,
                            })
                        })
                        .collect::<Result<Vec<_>>>()?;
                    self.verifier.call(&inputs).await?
                };
                for (record, units) in sample.output.iter_mut().zip(details) {
                    record.track_mut(name).details = Some(units);
                }
                debug!(stage = %Stage::Verify, source = name, sample = i, "sample done");
            }
            info!(
                stage = %Stage::Verify,
                source = name,
                index = n + 1,
                total,
                elapsed = ?started.elapsed(),
                "source finished"
            );
        }
        Ok(samples)
    }
}

fn ensure_unwritten(
    samples: &[Sample],
    field: &str,
    written: impl Fn(&ClaimRecord) -> bool,
) -> Result<()> {
    match samples.iter().position(|s| s.output.iter().any(&written)) {
        Some(sample) => Err(FactError::AlreadyWritten { field: field.to_string(), sample }),
        None => Ok(()),
    }
}

fn evidence_of<'a>(
    record: &'a ClaimRecord,
    source: &str,
    sample: usize,
) -> Result<&'a [EvidenceUnit]> {
    record
        .track(source)
        .and_then(|t| t.sources.as_deref())
        .ok_or_else(|| {
            FactError::ShapeMismatch(format!("sample {sample}: no `{source}_sources` for claim"))
        })
}

fn extractions_of<'a>(
    record: &'a ClaimRecord,
    source: &str,
    sample: usize,
) -> Result<&'a [ExtractionUnit]> {
    record
        .track(source)
        .and_then(|t| t.extractions.as_deref())
        .ok_or_else(|| {
            let msg = format!("sample {sample}: no `{source}_extractions` for claim");
            FactError::ShapeMismatch(msg)
        })
}
