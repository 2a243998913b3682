use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use ufo_rs::dataset::{load_samples, save_samples};
use ufo_rs::scoring::{aggregate, tally_sources, AggregationMode};
use ufo_rs::server::{run_server, Engine};
use ufo_rs::{Config, Pipeline};

#[derive(Parser)]
#[command(name = "ufo", version)]
struct Cli {
    #[command(subcommand)]
    cmd: Cmd,
    /// YAML config; defaults plus environment when omitted
    #[arg(long, env = "UFO_CONFIG", global = true)]
    config: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Cmd {
    /// Decompose, query, retrieve, extract and verify every sample
    Run {
        #[arg(long)]
        input_file: PathBuf,
        #[arg(long)]
        output_file: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
        /// Overrides `pipeline.sources`, e.g. `--sources web,knowledge`
        #[arg(long, value_delimiter = ',')]
        sources: Option<Vec<String>>,
    },
    /// Aggregate a pipeline output file into factuality scores
    Score {
        #[arg(long)]
        input_file: PathBuf,
        /// unordered | ordered (also multi_major | multi_sequence_major)
        #[arg(long)]
        mode: Option<AggregationMode>,
        #[arg(long, value_delimiter = ',')]
        sources: Option<Vec<String>>,
        /// Where to write per-claim judgments
        #[arg(long)]
        judgments_file: Option<PathBuf>,
    },
    /// Serve `POST /factuality/evaluate`
    Serve {
        #[arg(long, default_value = "0.0.0.0:8080")]
        addr: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,ufo_rs=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load(cli.config.as_deref()).context("loading config")?;

    match cli.cmd {
        Cmd::Run { input_file, output_file, limit, sources } => {
            if let Some(sources) = sources {
                config.pipeline.sources = sources;
            }
            let samples = load_samples(&input_file, limit)
                .with_context(|| format!("reading {}", input_file.display()))?;
            tracing::info!(
                samples = samples.len(),
                sources = ?config.pipeline.sources,
                "starting run"
            );

            let pipeline = Pipeline::from_config(&config).context("building pipeline")?;
            let samples = pipeline.run(samples).await?;
            save_samples(&output_file, &samples)
                .with_context(|| format!("writing {}", output_file.display()))?;
            tracing::info!(output = %output_file.display(), "run finished");
        }
        Cmd::Score { input_file, mode, sources, judgments_file } => {
            let mode = mode.unwrap_or(config.aggregation.mode);
            let sources = sources.unwrap_or(config.aggregation.sources);
            let samples = load_samples(&input_file, None)
                .with_context(|| format!("reading {}", input_file.display()))?;

            let result = aggregate(&samples, mode, &sources);
            println!("mode: {mode:?}");
            println!("samples: {}", result.sample_scores.len());
            println!("mean factuality: {:.4}", result.mean_score());
            for (source, [falses, trues]) in tally_sources(&result.judgments, &sources) {
                println!("  {source}: false={falses} true={trues}");
            }

            if let Some(path) = judgments_file {
                std::fs::write(&path, serde_json::to_string_pretty(&result)?)
                    .with_context(|| format!("writing {}", path.display()))?;
            }
        }
        Cmd::Serve { addr } => {
            let pipeline = Pipeline::from_config(&config).context("building pipeline")?;
            run_server(Engine::new(pipeline, &config.aggregation), &addr).await?;
        }
    }
    Ok(())
}
