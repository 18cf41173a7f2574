//! Embedding build orchestrator - runs fetch, normalize, embed, write

use anyhow::{Context, Result};
use chrono::{Datelike, Utc};
use comp_recommender::comps::embedding::{EmbeddingArtifact, EmbeddingIndex, EMBEDDING_DIM};
use comp_recommender::config::EngineConfig;
use comp_recommender::ingestion::{load_dataset, write, SaleRecord, WriteStats};
use std::env;
use std::path::PathBuf;
use tracing::{info, warn};

fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_level(true)
        .init();

    info!("Starting embedding build pipeline");

    dotenvy::dotenv().ok();
    let config = BuildConfig::from_env()?;
    info!("Configuration loaded");

    let stats = run_build(&config)?;
    info!("✓ Embedding build completed: {}", stats);

    Ok(())
}

/// Build the embedding artifact from the configured dataset
fn run_build(config: &BuildConfig) -> Result<WriteStats> {
    info!("=== Embedding Pipeline ===");

    // Step 1: Fetch and normalize raw records
    info!("Step 1/4: Loading dataset {:?}...", config.engine.dataset_path);
    let dataset = load_dataset(&config.engine.dataset_path, &config.engine.normalize_options())
        .with_context(|| format!("Failed to load {}", config.engine.dataset_path.display()))?;
    info!("✓ Loaded {} sale records", dataset.sales.len());

    // Step 2: Report normalization results
    info!("Step 2/4: Checking normalization...");
    let sales = limit(dataset.sales, config.limit_records);
    if dataset.stats.dropped > 0 {
        warn!("{} records could not be normalized", dataset.stats.dropped);
    }
    info!("✓ Normalized ({})", dataset.stats);

    // Step 3: Fit the scaler and embed every sale
    info!("Step 3/4: Embedding {} sales...", sales.len());
    let reference_year = Utc::now().year();
    let index = EmbeddingIndex::build(&sales, reference_year).context("Failed to build embeddings")?;
    info!("✓ Built {} x {} embedding matrix", index.len(), EMBEDDING_DIM);

    // Step 4: Write the artifact atomically
    info!("Step 4/4: Writing {:?}...", config.engine.embeddings_path);
    let records = sales.len();
    let artifact = EmbeddingArtifact::new(&index, sales);
    let stats = write::write_json_atomic(&config.engine.embeddings_path, &artifact, records)
        .context("Failed to write embedding artifact")?;
    info!("✓ Write complete");

    Ok(stats)
}

fn limit(sales: Vec<SaleRecord>, limit_records: usize) -> Vec<SaleRecord> {
    if limit_records > 0 && limit_records < sales.len() {
        warn!("Limiting to first {} records (testing mode)", limit_records);
        sales.into_iter().take(limit_records).collect()
    } else {
        sales
    }
}

/// Configuration loaded from environment variables and arguments
#[derive(Debug, Clone)]
struct BuildConfig {
    engine: EngineConfig,
    limit_records: usize, // 0 = no limit
}

impl BuildConfig {
    /// `build-embeddings [DATASET_PATH] [EMBEDDINGS_PATH]`; arguments override the environment
    fn from_env() -> Result<Self> {
        let mut engine = EngineConfig::from_env()?;
        let args: Vec<String> = env::args().skip(1).collect();
        if let Some(dataset) = args.first() {
            engine.dataset_path = PathBuf::from(dataset);
        }
        if let Some(output) = args.get(1) {
            engine.embeddings_path = PathBuf::from(output);
        }

        Ok(BuildConfig {
            engine,
            limit_records: env::var("LIMIT_RECORDS")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .context("LIMIT_RECORDS must be a valid number")?,
        })
    }
}
