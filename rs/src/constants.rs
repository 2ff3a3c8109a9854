//! Default tuning parameters for the Canopy scoring engine
//!
//! Every value here can be overridden through [`crate::config::EngineConfig`];
//! these are only the defaults used when a config section omits a field.

// Feature extraction

/// Number of keywords kept per content item after frequency ranking.
pub const TOP_KEYWORDS: usize = 20;

/// Tokens with this many characters or fewer are discarded.
pub const MIN_TOKEN_CHARS: usize = 2;

/// Raw environmental signal that maps to a score of 100.
pub const MAX_ENVIRONMENTAL_RAW: f64 = 200.0;

/// Bonus added to the raw environmental signal when the item sits in an environmental category.
pub const ENVIRONMENTAL_CATEGORY_BONUS: f64 = 20.0;

/// Word count at which the `content_length` vector dimension saturates.
pub const CONTENT_LENGTH_SATURATION: f64 = 1000.0;

/// Readability used when a text has no sentences or words.
pub const DEFAULT_READABILITY: f64 = 50.0;

pub const STRUCTURE_HEADING_POINTS: f64 = 20.0;
pub const STRUCTURE_LIST_POINTS: f64 = 15.0;
pub const STRUCTURE_LINK_POINTS: f64 = 10.0;

// Similarity

pub const HYBRID_WEIGHT_COSINE: f64 = 0.4;
pub const HYBRID_WEIGHT_JACCARD: f64 = 0.2;
pub const HYBRID_WEIGHT_ENVIRONMENTAL: f64 = 0.3;
pub const HYBRID_WEIGHT_BEHAVIORAL: f64 = 0.1;

pub const ENVIRONMENTAL_WEIGHT_SCORE: f64 = 0.4;
pub const ENVIRONMENTAL_WEIGHT_KEYWORDS: f64 = 0.3;
pub const ENVIRONMENTAL_WEIGHT_CATEGORIES: f64 = 0.2;
pub const ENVIRONMENTAL_WEIGHT_TAGS: f64 = 0.1;

/// Minimum similarity for a candidate to be returned by `find_similar`.
pub const FIND_SIMILAR_THRESHOLD: f64 = 0.1;

/// Minimum hybrid similarity for an edge to be persisted by the batch index.
pub const INDEX_EDGE_THRESHOLD: f64 = 0.05;

/// Pairs evaluated per batch index call.
pub const INDEX_BATCH_SIZE: usize = 500;

// Preference tracking

/// Share of the old weight retained on every preference update.
pub const SMOOTHING_RETENTION: f64 = 0.8;

/// Seconds of dwell time that add one unit to the view multiplier.
pub const DWELL_UNIT_SECONDS: f64 = 60.0;

/// Cap on the dwell-time bonus (4x total for 3+ minutes).
pub const MAX_DWELL_BONUS: f64 = 3.0;

/// Rating considered neutral (neither preference nor de-preference).
pub const NEUTRAL_RATING: f64 = 3.0;

/// Distance from neutral to the top of the rating scale.
pub const RATING_HALF_RANGE: f64 = 2.0;

/// Preference value used for the environmental affinity row.
pub const HIGH_IMPACT_PREFERENCE: &str = "high_impact";

/// Weight changes smaller than this do not invalidate cached recommendations.
pub const MATERIAL_WEIGHT_CHANGE: f64 = 0.01;

// Recommendation

pub const DEFAULT_LIMIT: usize = 10;
pub const MAX_LIMIT: usize = 100;
pub const CACHE_TTL_SECONDS: u64 = 3600;
pub const CACHE_MAX_ENTRIES: u64 = 10_000;
pub const DIVERSITY_THRESHOLD: f64 = 0.7;

pub const STRATEGY_WEIGHT_PERSONALIZED: f64 = 0.3;
pub const STRATEGY_WEIGHT_ENVIRONMENTAL: f64 = 0.3;
pub const STRATEGY_WEIGHT_TRENDING: f64 = 0.2;
pub const STRATEGY_WEIGHT_COLLABORATIVE: f64 = 0.2;

/// Score given to a personalized candidate when no preference overlaps it.
pub const NEUTRAL_SCORE: f64 = 0.5;

pub const PERSONALIZED_MAX_PREFERENCES: usize = 10;
pub const SIMILAR_LOOKBACK_DAYS: i64 = 30;
pub const SIMILAR_MAX_SEEDS: usize = 10;
pub const TRENDING_WINDOW_DAYS: i64 = 7;
pub const TRENDING_EXCLUSION_DAYS: i64 = 7;
pub const PERSONALIZED_EXCLUSION_DAYS: i64 = 7;
pub const TRENDING_WEIGHT_POPULARITY: f64 = 0.6;
pub const TRENDING_WEIGHT_ENGAGEMENT: f64 = 0.4;
pub const ENVIRONMENTAL_EXCLUSION_DAYS: i64 = 14;
pub const ENVIRONMENTAL_MIN_SCORE: f64 = 0.5;
pub const ENVIRONMENTAL_RANK_WEIGHT_SCORE: f64 = 0.7;
pub const ENVIRONMENTAL_RANK_WEIGHT_RATING: f64 = 0.3;
pub const COLLABORATIVE_MAX_NEIGHBORS: usize = 50;
pub const COLLABORATIVE_MIN_COMMON: usize = 3;
pub const COLLABORATIVE_MIN_SUPPORT: usize = 2;

/// Curated environmental dictionary: term and importance weight (4-10).
///
/// Terms are matched as case-insensitive substrings, so short fragments that
/// occur inside everyday words ("eco", "air", "tree") are deliberately absent.
pub const ENVIRONMENTAL_KEYWORDS: &[(&str, f64)] = &[
    ("climate change", 10.0),
    ("global warming", 10.0),
    ("climate", 10.0),
    ("biodiversity", 9.0),
    ("deforestation", 9.0),
    ("carbon neutral", 9.0),
    ("sustainability", 9.0),
    ("sustainable", 8.0),
    ("carbon", 8.0),
    ("emissions", 8.0),
    ("greenhouse", 8.0),
    ("renewable", 8.0),
    ("solar", 8.0),
    ("conservation", 8.0),
    ("ecosystem", 8.0),
    ("pollution", 8.0),
    ("reforestation", 8.0),
    ("extinction", 8.0),
    ("fossil fuel", 8.0),
    ("clean energy", 8.0),
    ("net zero", 8.0),
    ("rainforest", 8.0),
    ("wind power", 7.0),
    ("wind energy", 7.0),
    ("recycling", 7.0),
    ("recycle", 7.0),
    ("environmental", 7.0),
    ("environment", 7.0),
    ("wildlife", 7.0),
    ("habitat", 7.0),
    ("endangered", 7.0),
    ("energy efficiency", 7.0),
    ("zero waste", 7.0),
    ("methane", 7.0),
    ("coral reef", 7.0),
    ("water conservation", 7.0),
    ("circular economy", 7.0),
    ("sea level", 7.0),
    ("compost", 6.0),
    ("electric vehicle", 6.0),
    ("plastic", 6.0),
    ("ocean", 6.0),
    ("reduce", 6.0),
    ("reuse", 6.0),
    ("protect", 6.0),
    ("conserve", 6.0),
    ("footprint", 6.0),
    ("drought", 6.0),
    ("wetland", 6.0),
    ("air quality", 6.0),
    ("biodegradable", 6.0),
    ("permaculture", 6.0),
    ("hydropower", 6.0),
    ("geothermal", 6.0),
    ("eco-friendly", 6.0),
    ("regenerative", 6.0),
    ("glacier", 6.0),
    ("pollinator", 6.0),
    ("organic", 5.0),
    ("waste", 5.0),
    ("nature", 5.0),
    ("flood", 5.0),
    ("species", 5.0),
    ("upcycling", 5.0),
    ("pesticide", 5.0),
    ("green", 4.0),
];

/// Categories that mark an item as environmental content.
pub const ENVIRONMENTAL_CATEGORIES: &[&str] = &[
    "environment",
    "environmental",
    "sustainability",
    "climate",
    "conservation",
    "renewable energy",
    "green living",
    "nature",
];

/// Default English stop words removed before keyword ranking.
pub const STOP_WORDS: &[&str] = &[
    "the", "and", "for", "are", "but", "not", "you", "all", "any", "can", "had", "her", "was",
    "one", "our", "out", "day", "get", "has", "him", "his", "how", "man", "new", "now", "old",
    "see", "two", "way", "who", "boy", "did", "its", "let", "put", "say", "she", "too", "use",
    "that", "with", "have", "this", "will", "your", "from", "they", "know", "want", "been",
    "good", "much", "some", "time", "very", "when", "come", "here", "just", "like", "long",
    "make", "many", "over", "such", "take", "than", "them", "well", "were", "what", "which",
    "their", "there", "these", "those", "would", "could", "should", "about", "after", "again",
    "also", "into", "more", "most", "only", "other", "then", "while", "where", "being", "because",
    "each", "few", "off", "own", "same", "both", "before", "between", "through", "during",
    "under", "above", "below", "does", "doing", "having", "itself", "yourself", "ours",
];
