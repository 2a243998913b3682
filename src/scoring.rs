//! Turns per-source verification results into one decision per claim and one
//! score per sample.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::types::{
    contains_noans, ClaimRecord, EvidenceUnit, ExtractionUnit, JudgmentRecord, Sample,
    VerificationUnit, NOANS,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregationMode {
    /// Majority over the evidence of every source pooled together.
    #[serde(alias = "multi_major")]
    Unordered,
    /// Majority within the first source, in priority order, with usable evidence.
    #[default]
    #[serde(alias = "multi_sequence_major")]
    Ordered,
}

impl std::str::FromStr for AggregationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unordered" | "multi_major" => Ok(Self::Unordered),
            "ordered" | "multi_sequence_major" => Ok(Self::Ordered),
            other => Err(format!("unknown aggregation mode `{other}`")),
        }
    }
}

/// One usable (evidence, extraction, verification) triple.
struct Vote<'a> {
    source: &'a str,
    evidence: &'a EvidenceUnit,
    extraction: &'a ExtractionUnit,
    verdict: u8,
    reasoning: &'a str,
}

/// Valid votes of one source for one claim. Lists of unequal length are
/// truncated to the shortest; a missing source yields nothing.
fn votes<'a>(record: &'a ClaimRecord, source: &'a str) -> Vec<Vote<'a>> {
    let Some(track) = record.track(source) else {
        return Vec::new();
    };
    let (Some(evidence), Some(extractions), Some(details)) =
        (&track.sources, &track.extractions, &track.details)
    else {
        return Vec::new();
    };

    evidence
        .iter()
        .zip(extractions)
        .zip(details)
        .filter(|((_, ext), ver)| usable(ext, ver))
        .map(|((evidence, extraction), ver)| Vote {
            source,
            evidence,
            extraction,
            verdict: ver.factuality.score(),
            reasoning: &ver.reasoning,
        })
        .collect()
}

fn usable(extraction: &ExtractionUnit, verification: &VerificationUnit) -> bool {
    !(contains_noans(&extraction.reasoning)
        || contains_noans(&extraction.answer)
        || contains_noans(&verification.reasoning))
}

/// Most frequent value; on a tie the value seen first wins.
fn majority(values: &[u8]) -> Option<u8> {
    let mut counts: IndexMap<u8, usize> = IndexMap::new();
    for v in values {
        *counts.entry(*v).or_default() += 1;
    }
    let mut best: Option<(u8, usize)> = None;
    for (value, count) in counts {
        if best.map_or(true, |(_, c)| count > c) {
            best = Some((value, count));
        }
    }
    best.map(|(value, _)| value)
}

fn decide(record: &ClaimRecord, votes: &[Vote<'_>]) -> (u8, JudgmentRecord) {
    let query = record.queries().join(" ");
    let verdicts: Vec<u8> = votes.iter().map(|v| v.verdict).collect();
    let Some(mode) = majority(&verdicts) else {
        return (0, JudgmentRecord::exhausted(&record.claim, &query));
    };

    let chosen = votes
        .iter()
        .find(|v| v.verdict == mode)
        .expect("the majority value is taken from a non-empty vote list");
    let judgment = JudgmentRecord {
        claim: record.claim.clone(),
        factuality: mode,
        query,
        source: chosen.source.to_string(),
        evidence: chosen.evidence.evidence.clone(),
        answer: chosen.extraction.answer.clone(),
        reasoning: chosen.reasoning.to_string(),
    };
    (mode, judgment)
}

/// Majority over every source's usable evidence, pooled in `sources` order.
pub fn aggregate_unordered(record: &ClaimRecord, sources: &[String]) -> (u8, JudgmentRecord) {
    let pooled: Vec<Vote<'_>> = sources.iter().flat_map(|s| votes(record, s)).collect();
    decide(record, &pooled)
}

/// Majority within the highest-priority source that has any usable evidence.
/// Lower-priority sources are never looked at once a decision is made.
pub fn aggregate_ordered(record: &ClaimRecord, sources: &[String]) -> (u8, JudgmentRecord) {
    for source in sources {
        let found = votes(record, source);
        if !found.is_empty() {
            return decide(record, &found);
        }
        debug!(claim = %record.claim, source = %source, "no usable evidence, trying next source");
    }
    decide(record, &[])
}

/// Per-sample scores (mean claim decision, 0 for claimless samples) and the
/// judgment behind every claim decision.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub sample_scores: Vec<f64>,
    pub judgments: Vec<Vec<JudgmentRecord>>,
}

impl Aggregate {
    pub fn mean_score(&self) -> f64 {
        if self.sample_scores.is_empty() {
            return 0.0;
        }
        self.sample_scores.iter().sum::<f64>() / self.sample_scores.len() as f64
    }
}

pub fn aggregate(samples: &[Sample], mode: AggregationMode, sources: &[String]) -> Aggregate {
    let mut result = Aggregate::default();
    for sample in samples {
        let mut decisions = Vec::with_capacity(sample.output.len());
        let mut judgments = Vec::with_capacity(sample.output.len());
        for record in &sample.output {
            let (decision, judgment) = match mode {
                AggregationMode::Unordered => aggregate_unordered(record, sources),
                AggregationMode::Ordered => aggregate_ordered(record, sources),
            };
            decisions.push(f64::from(decision));
            judgments.push(judgment);
        }
        let score = if decisions.is_empty() {
            0.0
        } else {
            decisions.iter().sum::<f64>() / decisions.len() as f64
        };
        result.sample_scores.push(score);
        result.judgments.push(judgments);
    }
    result
}

/// `[false, true]` decision counts per deciding source, `NOANS` included.
pub fn tally_sources(
    judgments: &[Vec<JudgmentRecord>],
    sources: &[String],
) -> IndexMap<String, [usize; 2]> {
    let mut tally: IndexMap<String, [usize; 2]> = sources
        .iter()
        .cloned()
        .chain(std::iter::once(NOANS.to_string()))
        .map(|s| (s, [0, 0]))
        .collect();
    for judgment in judgments.iter().flatten() {
        let slot = tally.entry(judgment.source.clone()).or_default();
        slot[usize::from(judgment.factuality.min(1))] += 1;
    }
    tally
}
