use std::sync::Arc;

use axum::{extract::State, http::StatusCode, routing::post, Json, Router};
use serde::{Deserialize, Serialize};
use tracing::{error, info};

use crate::config::AggregationConfig;
use crate::pipeline::Pipeline;
use crate::scoring::{aggregate, AggregationMode};
use crate::types::{JudgmentRecord, Sample};

pub struct Engine {
    pipeline: Pipeline,
    mode: AggregationMode,
    sources: Vec<String>,
}

impl Engine {
    pub fn new(pipeline: Pipeline, aggregation: &AggregationConfig) -> Self {
        Self { pipeline, mode: aggregation.mode, sources: aggregation.sources.clone() }
    }
}

#[derive(Deserialize)]
pub struct EvaluateItem {
    pub response: String,
    #[serde(default)]
    pub reference_answers: Vec<String>,
}

#[derive(Deserialize)]
pub struct EvaluateReq {
    pub samples: Vec<EvaluateItem>,
    pub mode: Option<AggregationMode>,
    pub sources: Option<Vec<String>>,
}

#[derive(Serialize)]
pub struct EvaluateResp {
    pub scores: Vec<f64>,
    pub judgments: Vec<Vec<JudgmentRecord>>,
}

pub async fn evaluate(
    State(engine): State<Arc<Engine>>,
    Json(req): Json<EvaluateReq>,
) -> Result<Json<EvaluateResp>, StatusCode> {
    let samples: Vec<Sample> = req
        .samples
        .into_iter()
        .map(|s| Sample::new(s.response, s.reference_answers))
        .collect();
    let count = samples.len();

    let samples = engine.pipeline.run(samples).await.map_err(|e| {
        error!(error = %e, "evaluation failed");
        StatusCode::INTERNAL_SERVER_ERROR
    })?;

    let mode = req.mode.unwrap_or(engine.mode);
    let sources = req.sources.as_deref().unwrap_or(&engine.sources);
    let result = aggregate(&samples, mode, sources);
    info!(samples = count, mode = ?mode, mean = result.mean_score(), "evaluated");
    Ok(Json(EvaluateResp { scores: result.sample_scores, judgments: result.judgments }))
}

pub fn router(engine: Arc<Engine>) -> Router {
    Router::new()
        .route("/factuality/evaluate", post(evaluate))
        .with_state(engine)
}

pub async fn run_server(engine: Engine, addr: &str) -> anyhow::Result<()> {
    let app = router(Arc::new(engine));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "listening");
    axum::serve(listener, app).await?;
    Ok(())
}
