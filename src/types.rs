use indexmap::IndexMap;
use serde::de::Error as _;
use serde::ser::SerializeMap;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Marker for "no usable answer or evidence here".
pub const NOANS: &str = "NOANS";

/// Perplexity written into fallback records; far above any real score.
pub const FAILURE_PPL: f64 = 1e6;

/// Case-insensitive check for the [`NOANS`] marker.
pub fn contains_noans(text: &str) -> bool {
    text.to_uppercase().contains(NOANS)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sample {
    pub response: String,
    #[serde(default)]
    pub reference_answers: Vec<String>,
    #[serde(default)]
    pub output: Vec<ClaimRecord>,
    /// Dataset fields the pipeline does not touch (labels, ids, ...).
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl Sample {
    pub fn new(response: impl Into<String>, reference_answers: Vec<String>) -> Self {
        Self {
            response: response.into(),
            reference_answers,
            output: Vec::new(),
            extra: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceUnit {
    pub evidence: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ppl: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
}

impl EvidenceUnit {
    pub fn text(evidence: impl Into<String>) -> Self {
        Self { evidence: evidence.into(), evidence_ppl: None, score: None }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionUnit {
    pub reasoning: String,
    pub answer: String,
    #[serde(default)]
    pub answer_ppl: Option<f64>,
}

impl ExtractionUnit {
    /// Record used when the oracle never produced a usable extraction.
    pub fn fallback() -> Self {
        Self {
            reasoning: "No answer.".into(),
            answer: NOANS.into(),
            answer_ppl: Some(FAILURE_PPL),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationUnit {
    pub factuality: Factuality,
    pub reasoning: String,
    #[serde(default)]
    pub factuality_ppl: Option<f64>,
}

impl VerificationUnit {
    /// Record used when the oracle never produced a usable verdict.
    pub fn fallback() -> Self {
        Self {
            factuality: Factuality::Valid(false),
            reasoning: "No reasoning.".into(),
            factuality_ppl: Some(FAILURE_PPL),
        }
    }
}

/// Verdict as ingested from the oracle.
///
/// Booleans are taken as-is and any string counts as true exactly when it
/// contains `TRUE` (case-insensitive). Everything else is kept verbatim as
/// `Invalid` so the raw value survives serialization.
#[derive(Debug, Clone, PartialEq)]
pub enum Factuality {
    Valid(bool),
    Invalid(Value),
}

impl Factuality {
    pub fn from_value(value: &Value) -> Self {
        match value {
            Value::Bool(b) => Self::Valid(*b),
            Value::String(s) => Self::Valid(s.to_uppercase().contains("TRUE")),
            other => Self::Invalid(other.clone()),
        }
    }

    /// 0/1 score; invalid verdicts are logged and count as false.
    pub fn score(&self) -> u8 {
        match self {
            Self::Valid(b) => u8::from(*b),
            Self::Invalid(raw) => {
                tracing::warn!(value = %raw, "invalid factuality type, treating as false");
                0
            }
        }
    }
}

impl Serialize for Factuality {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Self::Valid(b) => serializer.serialize_bool(*b),
            Self::Invalid(raw) => raw.serialize(serializer),
        }
    }
}

impl<'de> Deserialize<'de> for Factuality {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = Value::deserialize(deserializer)?;
        Ok(Self::from_value(&raw))
    }
}

/// Per-source results for one claim. Index `i` of each list refers to the
/// same evidence unit.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SourceTrack {
    pub sources: Option<Vec<EvidenceUnit>>,
    pub extractions: Option<Vec<ExtractionUnit>>,
    pub details: Option<Vec<VerificationUnit>>,
}

/// One atomic claim and everything the pipeline learned about it.
///
/// Serialized flat: per-source lists appear as `<source>_sources`,
/// `<source>_extractions` and `<source>_details`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClaimRecord {
    pub claim: String,
    pub claims_ppl: Option<f64>,
    pub queries: Option<Vec<String>>,
    pub queries_ppl: Option<f64>,
    pub sources: IndexMap<String, SourceTrack>,
}

impl ClaimRecord {
    pub fn new(claim: impl Into<String>, claims_ppl: Option<f64>) -> Self {
        Self {
            claim: claim.into(),
            claims_ppl,
            queries: None,
            queries_ppl: None,
            sources: IndexMap::new(),
        }
    }

    pub fn track(&self, source: &str) -> Option<&SourceTrack> {
        self.sources.get(source)
    }

    pub fn track_mut(&mut self, source: &str) -> &mut SourceTrack {
        self.sources.entry(source.to_string()).or_default()
    }

    pub fn queries(&self) -> &[String] {
        self.queries.as_deref().unwrap_or_default()
    }

    fn from_fields(raw: IndexMap<String, Value>) -> Result<Self, serde_json::Error> {
        let mut claim = None;
        let mut record = Self::new(String::new(), None);
        for (key, value) in raw {
            match key.as_str() {
                "claim" | "claims" => claim = Some(serde_json::from_value(value)?),
                "claims_ppl" => record.claims_ppl = serde_json::from_value(value)?,
                "queries" => record.queries = Some(serde_json::from_value(value)?),
                "queries_ppl" => record.queries_ppl = serde_json::from_value(value)?,
                _ => {
                    if let Some(name) = key.strip_suffix("_sources") {
                        record.track_mut(name).sources = Some(serde_json::from_value(value)?);
                    } else if let Some(name) = key.strip_suffix("_extractions") {
                        record.track_mut(name).extractions = Some(serde_json::from_value(value)?);
                    } else if let Some(name) = key.strip_suffix("_details") {
                        record.track_mut(name).details = Some(serde_json::from_value(value)?);
                    }
                }
            }
        }
        record.claim = claim.ok_or_else(|| serde_json::Error::missing_field("claim"))?;
        Ok(record)
    }
}

impl Serialize for ClaimRecord {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        map.serialize_entry("claim", &self.claim)?;
        map.serialize_entry("claims_ppl", &self.claims_ppl)?;
        if let Some(queries) = &self.queries {
            map.serialize_entry("queries", queries)?;
            map.serialize_entry("queries_ppl", &self.queries_ppl)?;
        }
        for (name, track) in &self.sources {
            if let Some(sources) = &track.sources {
                map.serialize_entry(&format!("{name}_sources"), sources)?;
            }
            if let Some(extractions) = &track.extractions {
                map.serialize_entry(&format!("{name}_extractions"), extractions)?;
            }
            if let Some(details) = &track.details {
                map.serialize_entry(&format!("{name}_details"), details)?;
            }
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for ClaimRecord {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = IndexMap::<String, Value>::deserialize(deserializer)?;
        Self::from_fields(raw).map_err(D::Error::custom)
    }
}

/// Final decision for one claim and the evidence it was drawn from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgmentRecord {
    pub claim: String,
    pub factuality: u8,
    pub query: String,
    pub source: String,
    pub evidence: String,
    pub answer: String,
    pub reasoning: String,
}

impl JudgmentRecord {
    /// Outcome when no source produced any valid evidence.
    pub fn exhausted(claim: &str, query: &str) -> Self {
        Self {
            claim: claim.to_string(),
            factuality: 0,
            query: query.to_string(),
            source: NOANS.into(),
            evidence: NOANS.into(),
            answer: NOANS.into(),
            reasoning: NOANS.into(),
        }
    }
}
