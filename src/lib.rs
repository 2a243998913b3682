pub mod config;
pub mod dataset;
pub mod decompose;
pub mod error;
pub mod extraction;
pub mod llm;
pub mod oracle;
pub mod pipeline;
pub mod query_gen;
pub mod retrieve;
pub mod scoring;
pub mod serper;
pub mod server;
pub mod shape;
pub mod types;
pub mod verification;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use error::{FactError, Result};
pub use pipeline::Pipeline;
pub use scoring::{aggregate, AggregationMode};
