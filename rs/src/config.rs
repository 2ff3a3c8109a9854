//! Engine configuration
//!
//! Every section deserializes with defaults for missing fields, so a config
//! file only needs to mention what it changes:
//!
//! ```json
//! { "recommender": { "diversity_threshold": 0.6 } }
//! ```

use crate::constants::*;
use crate::models::{InputError, SimilarityAlgorithm};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// Complete engine configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub extractor: ExtractorConfig,
    pub similarity: SimilarityConfig,
    pub tracker: TrackerConfig,
    pub recommender: RecommenderConfig,
}

impl EngineConfig {
    /// Load a JSON config file and validate it
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: EngineConfig = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        config.validate()?;
        tracing::debug!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    /// Reject configurations that would break score ranges
    pub fn validate(&self) -> Result<(), InputError> {
        let invalid = |message: String| Err(InputError::InvalidConfig { message });

        if self.extractor.max_environmental_raw <= 0.0 {
            return invalid("extractor.max_environmental_raw must be positive".into());
        }
        if let Some((term, weight)) = self
            .extractor
            .environmental_keywords
            .iter()
            .find(|(_, w)| **w < 0.0)
        {
            return invalid(format!("environmental keyword '{term}' has negative weight {weight}"));
        }
        if !(0.0..1.0).contains(&self.tracker.smoothing_retention) {
            return invalid("tracker.smoothing_retention must be in [0, 1)".into());
        }
        for (name, value) in [
            ("similarity.find_threshold", self.similarity.find_threshold),
            ("similarity.index_threshold", self.similarity.index_threshold),
            ("recommender.diversity_threshold", self.recommender.diversity_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return invalid(format!("{name} must be in [0, 1], got {value}"));
            }
        }
        if self.similarity.index_batch_size == 0 {
            return invalid("similarity.index_batch_size must be positive".into());
        }
        if self.recommender.max_limit == 0 {
            return invalid("recommender.max_limit must be positive".into());
        }
        let weights = &self.recommender.strategy_weights;
        if [
            weights.personalized,
            weights.environmental,
            weights.trending,
            weights.collaborative,
        ]
        .iter()
        .any(|w| *w < 0.0)
        {
            return invalid("recommender.strategy_weights must not be negative".into());
        }
        Ok(())
    }
}

/// Feature extraction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExtractorConfig {
    pub top_keywords: usize,
    pub min_token_chars: usize,
    pub max_environmental_raw: f64,
    pub environmental_category_bonus: f64,
    pub environmental_keywords: BTreeMap<String, f64>,
    pub environmental_categories: BTreeSet<String>,
    pub stop_words: BTreeSet<String>,
}

impl Default for ExtractorConfig {
    fn default() -> Self {
        Self {
            top_keywords: TOP_KEYWORDS,
            min_token_chars: MIN_TOKEN_CHARS,
            max_environmental_raw: MAX_ENVIRONMENTAL_RAW,
            environmental_category_bonus: ENVIRONMENTAL_CATEGORY_BONUS,
            environmental_keywords: ENVIRONMENTAL_KEYWORDS
                .iter()
                .map(|(term, weight)| (term.to_string(), *weight))
                .collect(),
            environmental_categories: ENVIRONMENTAL_CATEGORIES
                .iter()
                .map(|c| c.to_string())
                .collect(),
            stop_words: STOP_WORDS.iter().map(|w| w.to_string()).collect(),
        }
    }
}

/// Weights of the hybrid similarity blend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSimilarityWeights {
    pub cosine: f64,
    pub jaccard: f64,
    pub environmental: f64,
    pub behavioral: f64,
}

impl Default for HybridSimilarityWeights {
    fn default() -> Self {
        Self {
            cosine: HYBRID_WEIGHT_COSINE,
            jaccard: HYBRID_WEIGHT_JACCARD,
            environmental: HYBRID_WEIGHT_ENVIRONMENTAL,
            behavioral: HYBRID_WEIGHT_BEHAVIORAL,
        }
    }
}

/// Weights of the environmental similarity blend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentalSimilarityWeights {
    pub score: f64,
    pub keywords: f64,
    pub categories: f64,
    pub tags: f64,
}

impl Default for EnvironmentalSimilarityWeights {
    fn default() -> Self {
        Self {
            score: ENVIRONMENTAL_WEIGHT_SCORE,
            keywords: ENVIRONMENTAL_WEIGHT_KEYWORDS,
            categories: ENVIRONMENTAL_WEIGHT_CATEGORIES,
            tags: ENVIRONMENTAL_WEIGHT_TAGS,
        }
    }
}

/// Similarity engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SimilarityConfig {
    pub hybrid_weights: HybridSimilarityWeights,
    pub environmental_weights: EnvironmentalSimilarityWeights,
    pub find_threshold: f64,
    pub index_threshold: f64,
    pub index_batch_size: usize,
}

impl Default for SimilarityConfig {
    fn default() -> Self {
        Self {
            hybrid_weights: HybridSimilarityWeights::default(),
            environmental_weights: EnvironmentalSimilarityWeights::default(),
            find_threshold: FIND_SIMILAR_THRESHOLD,
            index_threshold: INDEX_EDGE_THRESHOLD,
            index_batch_size: INDEX_BATCH_SIZE,
        }
    }
}

/// Base weight per interaction action
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ActionWeights {
    pub view: f64,
    pub click: f64,
    pub share: f64,
    pub like: f64,
    pub comment: f64,
    pub scroll: f64,
    pub bookmark: f64,
    pub download: f64,
    /// Magnitude of a five-star (or one-star) rating
    pub rating: f64,
    /// Magnitude of the de-preference applied by a dismissal
    pub dismissal: f64,
}

impl Default for ActionWeights {
    fn default() -> Self {
        Self {
            view: 1.0,
            click: 2.0,
            share: 3.0,
            like: 2.0,
            comment: 3.5,
            scroll: 0.5,
            bookmark: 3.5,
            download: 4.5,
            rating: 3.0,
            dismissal: 2.0,
        }
    }
}

impl ActionWeights {
    /// Largest positive weight a single action can carry before multipliers
    pub fn max_base(&self) -> f64 {
        [
            self.view,
            self.click,
            self.share,
            self.like,
            self.comment,
            self.scroll,
            self.bookmark,
            self.download,
            self.rating,
        ]
        .into_iter()
        .fold(0.0, f64::max)
    }
}

/// Behavior tracker parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    pub action_weights: ActionWeights,
    pub smoothing_retention: f64,
    pub dwell_unit_seconds: f64,
    pub max_dwell_bonus: f64,
    pub neutral_rating: f64,
    pub rating_half_range: f64,
    pub material_weight_change: f64,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            action_weights: ActionWeights::default(),
            smoothing_retention: SMOOTHING_RETENTION,
            dwell_unit_seconds: DWELL_UNIT_SECONDS,
            max_dwell_bonus: MAX_DWELL_BONUS,
            neutral_rating: NEUTRAL_RATING,
            rating_half_range: RATING_HALF_RANGE,
            material_weight_change: MATERIAL_WEIGHT_CHANGE,
        }
    }
}

/// Weights of the hybrid recommendation blend
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyWeights {
    pub personalized: f64,
    pub environmental: f64,
    pub trending: f64,
    pub collaborative: f64,
}

impl Default for StrategyWeights {
    fn default() -> Self {
        Self {
            personalized: STRATEGY_WEIGHT_PERSONALIZED,
            environmental: STRATEGY_WEIGHT_ENVIRONMENTAL,
            trending: STRATEGY_WEIGHT_TRENDING,
            collaborative: STRATEGY_WEIGHT_COLLABORATIVE,
        }
    }
}

/// Recommendation engine parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecommenderConfig {
    pub default_limit: usize,
    pub max_limit: usize,
    /// 0 disables the recommendation cache
    pub cache_ttl_seconds: u64,
    pub cache_max_entries: u64,
    pub diversity_threshold: f64,
    pub diversity_algorithm: SimilarityAlgorithm,
    pub strategy_weights: StrategyWeights,
    pub personalized_max_preferences: usize,
    pub personalized_exclusion_days: i64,
    pub similar_lookback_days: i64,
    pub similar_max_seeds: usize,
    pub trending_window_days: i64,
    pub trending_exclusion_days: i64,
    pub environmental_exclusion_days: i64,
    /// Minimum environmental score (0-100 scale) for the environmental strategy
    pub environmental_min_score: f64,
    pub collaborative_max_neighbors: usize,
    pub collaborative_min_common: usize,
    pub collaborative_min_support: usize,
}

impl Default for RecommenderConfig {
    fn default() -> Self {
        Self {
            default_limit: DEFAULT_LIMIT,
            max_limit: MAX_LIMIT,
            cache_ttl_seconds: CACHE_TTL_SECONDS,
            cache_max_entries: CACHE_MAX_ENTRIES,
            diversity_threshold: DIVERSITY_THRESHOLD,
            diversity_algorithm: SimilarityAlgorithm::Hybrid,
            strategy_weights: StrategyWeights::default(),
            personalized_max_preferences: PERSONALIZED_MAX_PREFERENCES,
            personalized_exclusion_days: PERSONALIZED_EXCLUSION_DAYS,
            similar_lookback_days: SIMILAR_LOOKBACK_DAYS,
            similar_max_seeds: SIMILAR_MAX_SEEDS,
            trending_window_days: TRENDING_WINDOW_DAYS,
            trending_exclusion_days: TRENDING_EXCLUSION_DAYS,
            environmental_exclusion_days: ENVIRONMENTAL_EXCLUSION_DAYS,
            environmental_min_score: ENVIRONMENTAL_MIN_SCORE,
            collaborative_max_neighbors: COLLABORATIVE_MAX_NEIGHBORS,
            collaborative_min_common: COLLABORATIVE_MIN_COMMON,
            collaborative_min_support: COLLABORATIVE_MIN_SUPPORT,
        }
    }
}
