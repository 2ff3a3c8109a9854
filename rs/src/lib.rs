//! Canopy: content similarity scoring and recommendation engine
//!
//! Turns raw content into feature bags, scores pairs of content items under
//! several similarity algorithms, learns per-user preferences from
//! interaction events and serves ranked recommendation lists.
//!
//! Components receive their collaborators explicitly; the storage seam is the
//! [`EngineStorage`] trait, with in-memory and JSON-file implementations.

pub mod cache;
pub mod config;
pub mod constants;
pub mod features;
pub mod models;
pub mod recommend;
pub mod similarity;
pub mod storage;
pub mod tracker;

// Re-export main types for convenience
pub use cache::RecommendationCache;
pub use config::EngineConfig;
pub use features::{CorpusIndex, CorpusStats, FeatureExtractor};
pub use models::{
    ContentFeatures, ContentId, ContentRecord, EngineStorage, InputError, InteractionAction,
    InteractionEvent, Recommendation, RecommendationSet, SimilarityAlgorithm, SimilarityEdge,
    Strategy, UserId, UserPreferenceWeight,
};
pub use recommend::RecommendationEngine;
pub use similarity::{IndexBatchReport, SimilarityEngine};
pub use storage::{FileStorage, MemoryStorage, StorageError};
pub use tracker::{BehaviorTracker, RecordOutcome};

/// Result type used throughout the library
pub type Result<T> = anyhow::Result<T>;

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
