//! Canopy engine command line
//!
//! Operates on a JSON file store: analyze content, record interactions, run
//! the similarity index in batches and query similar content, preferences
//! and recommendations. Results are printed to stdout as JSON.

use anyhow::Context;
use canopy::models::{FindSimilarParams, IndexBatchParams, RecommendParams};
use canopy::similarity::AudienceIndex;
use canopy::{
    BehaviorTracker, ContentId, ContentRecord, CorpusIndex, EngineConfig, EngineStorage,
    FeatureExtractor, FileStorage, InteractionEvent, RecommendationEngine, SimilarityAlgorithm,
    SimilarityEngine, Strategy, UserId,
};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "canopy-engine")]
#[command(about = "Canopy content similarity and recommendation engine")]
struct Args {
    /// Engine storage directory
    #[arg(long, default_value = ".canopy")]
    data_dir: PathBuf,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Extract and store features for content records (JSON array file)
    Analyze {
        #[arg(long)]
        input: PathBuf,
    },
    /// Record interaction events (JSON array file)
    Record {
        #[arg(long)]
        input: PathBuf,
    },
    /// Find content similar to a stored item
    Similar {
        #[arg(long)]
        content_id: ContentId,
        #[arg(long, default_value_t = 5)]
        limit: usize,
        #[arg(long, default_value = "hybrid")]
        algorithm: SimilarityAlgorithm,
        #[arg(long)]
        threshold: Option<f64>,
        /// Read neighbors from the similarity index instead of scoring live
        #[arg(long)]
        indexed: bool,
    },
    /// Run one batch of the similarity index build
    Index {
        #[arg(long)]
        batch_size: Option<usize>,
        /// Start over from the first pair
        #[arg(long)]
        restart: bool,
    },
    /// Drop the stored similarity edges of a content item
    Invalidate {
        #[arg(long)]
        content_id: ContentId,
    },
    /// Show a user's preference weights
    Preferences {
        #[arg(long)]
        user_id: UserId,
    },
    /// Recommend content for a user
    Recommend {
        #[arg(long)]
        user_id: UserId,
        #[arg(long)]
        strategy: Option<Strategy>,
        #[arg(long)]
        limit: Option<usize>,
        /// Content ids to leave out
        #[arg(long, value_delimiter = ',')]
        exclude: Vec<ContentId>,
    },
    /// Print the JSON schema of a request type (recommend, similar or index)
    Schema { name: String },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let log_level = if args.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(format!("canopy={},canopy_engine={}", log_level, log_level))
        .with_writer(std::io::stderr)
        .init();

    tracing::debug!("Canopy version: {}", canopy::VERSION);

    if let Command::Schema { name } = &args.command {
        return print_schema(name);
    }

    let config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };

    tracing::info!("Data directory: {}", args.data_dir.display());
    let store: Arc<dyn EngineStorage> = Arc::new(
        FileStorage::new(&args.data_dir)
            .await
            .context("Failed to open storage directory")?,
    );

    match args.command {
        Command::Analyze { input } => analyze(store, &config, &input).await,
        Command::Record { input } => record(store, &config, &input).await,
        Command::Similar {
            content_id,
            limit,
            algorithm,
            threshold,
            indexed,
        } => {
            let params = FindSimilarParams {
                content_id,
                limit,
                algorithm,
                threshold,
            };
            similar(store, &config, params, indexed).await
        }
        Command::Index {
            batch_size,
            restart,
        } => {
            let params = IndexBatchParams {
                batch_size,
                restart,
            };
            let engine = SimilarityEngine::new(config.similarity.clone());
            let report = engine
                .build_index_batch(store.as_ref(), params.batch_size, params.restart)
                .await?;
            print_json(&report)
        }
        Command::Invalidate { content_id } => {
            let engine = SimilarityEngine::new(config.similarity.clone());
            let removed = engine.invalidate_content(store.as_ref(), content_id).await?;
            print_json(&serde_json::json!({ "content_id": content_id, "removed_edges": removed }))
        }
        Command::Preferences { user_id } => {
            let tracker = BehaviorTracker::new(store, config.tracker.clone());
            print_json(&tracker.get_preferences(user_id).await?)
        }
        Command::Recommend {
            user_id,
            strategy,
            limit,
            exclude,
        } => {
            let params = RecommendParams {
                user_id,
                strategy,
                limit,
                exclude_ids: exclude,
            };
            let engine = RecommendationEngine::from_config(store, &config);
            print_json(&engine.recommend_params(&params).await?)
        }
        Command::Schema { .. } => Ok(()),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_schema(name: &str) -> anyhow::Result<()> {
    let schema = match name {
        "recommend" => schemars::schema_for!(RecommendParams),
        "similar" => schemars::schema_for!(FindSimilarParams),
        "index" => schemars::schema_for!(IndexBatchParams),
        other => anyhow::bail!("Unknown schema '{}': expected recommend, similar or index", other),
    };
    print_json(&schema)
}

async fn read_input<T: serde::de::DeserializeOwned>(path: &Path) -> anyhow::Result<Vec<T>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&content).with_context(|| format!("Failed to parse {}", path.display()))
}

#[derive(Serialize)]
struct AnalyzeSummary {
    content_id: ContentId,
    environmental_score: f64,
    word_count: usize,
    keywords: Vec<String>,
    invalidated_edges: usize,
}

/// Extract features for a batch of records. IDF statistics cover the stored
/// corpus as well as the batch. Items analyzed before have their similarity
/// edges dropped so the next index pass recomputes them.
async fn analyze(
    store: Arc<dyn EngineStorage>,
    config: &EngineConfig,
    input: &Path,
) -> anyhow::Result<()> {
    let records: Vec<ContentRecord> = read_input(input).await?;
    let extractor = FeatureExtractor::new(config.extractor.clone());
    let similarity = SimilarityEngine::new(config.similarity.clone());
    let stored = store.get_all_features().await?;
    let corpus = CorpusIndex::with_stored(&extractor, &stored, &records);

    let mut summaries = Vec::with_capacity(records.len());
    for record in &records {
        if record.id == 0 {
            tracing::warn!("Skipping content record with invalid id 0");
            continue;
        }
        let features = extractor.extract(record, &corpus);
        let environmental_score = features.environmental_score;
        let word_count = features.word_count;
        let keywords = features.keywords().map(str::to_string).collect();

        let existed = store.get_features(record.id).await?.is_some();
        store.upsert_features(features).await?;
        let invalidated_edges = if existed {
            similarity.invalidate_content(store.as_ref(), record.id).await?
        } else {
            0
        };

        summaries.push(AnalyzeSummary {
            content_id: record.id,
            environmental_score,
            word_count,
            keywords,
            invalidated_edges,
        });
    }

    tracing::info!("Analyzed {} content records", summaries.len());
    print_json(&summaries)
}

async fn record(
    store: Arc<dyn EngineStorage>,
    config: &EngineConfig,
    input: &Path,
) -> anyhow::Result<()> {
    let events: Vec<InteractionEvent> = read_input(input).await?;
    let tracker = BehaviorTracker::new(store, config.tracker.clone());

    let mut outcomes = Vec::with_capacity(events.len());
    for event in events {
        outcomes.push(tracker.record(event).await?);
    }
    let applied = outcomes.iter().filter(|o| o.is_applied()).count();
    tracing::info!("Recorded {} of {} events", applied, outcomes.len());
    print_json(&outcomes)
}

async fn similar(
    store: Arc<dyn EngineStorage>,
    config: &EngineConfig,
    params: FindSimilarParams,
    indexed: bool,
) -> anyhow::Result<()> {
    let engine = SimilarityEngine::new(config.similarity.clone());
    let threshold = params.threshold.unwrap_or(engine.config().find_threshold);

    if indexed {
        let neighbors = engine
            .find_similar_indexed(store.as_ref(), params.content_id, params.limit, threshold)
            .await?;
        return print_json(&neighbors);
    }

    let Some(target) = store.get_features(params.content_id).await? else {
        tracing::warn!("No features stored for content {}", params.content_id);
        return print_json(&Vec::<canopy::similarity::SimilarContent>::new());
    };
    let candidates: Vec<_> = store
        .get_all_features()
        .await?
        .into_iter()
        .filter(|f| f.published)
        .collect();
    let interactions = store.get_interactions(None).await?;
    let audience = AudienceIndex::from_interactions(&interactions);

    let neighbors = engine.find_similar(
        &target,
        &candidates,
        params.limit,
        params.algorithm,
        threshold,
        Some(&audience),
    );
    print_json(&neighbors)
}
