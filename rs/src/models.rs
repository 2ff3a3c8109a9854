//! Core data models for the Canopy scoring engine
//!
//! Everything the engine reads or produces is defined here, together with the
//! [`EngineStorage`] trait that keeps the algorithms independent of where the
//! rows actually live.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use uuid::Uuid;

/// Identifier of a content item. Zero is never a valid id.
pub type ContentId = u64;

/// Identifier of a user. Zero is never a valid id.
pub type UserId = u64;

/// Malformed requests rejected before any processing happens
#[derive(Error, Debug, Clone, PartialEq)]
pub enum InputError {
    #[error("Invalid user id: {0}")]
    InvalidUserId(UserId),

    #[error("Invalid content id: {0}")]
    InvalidContentId(ContentId),

    #[error("Invalid limit {limit}: must be between 1 and {max}")]
    InvalidLimit { limit: usize, max: usize },

    #[error("Unknown {kind}: {value}")]
    UnknownVariant { kind: &'static str, value: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },
}

/// Raw content as supplied by the host application
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentRecord {
    pub id: ContentId,

    #[serde(default)]
    pub title: String,

    /// Body text, may contain HTML or Markdown markup
    #[serde(default)]
    pub body: String,

    #[serde(default = "default_content_type")]
    pub content_type: String,

    #[serde(default)]
    pub categories: Vec<String>,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default = "default_published")]
    pub published: bool,

    /// Set when the host attaches an image outside the body (e.g. a featured image)
    #[serde(default)]
    pub has_featured_image: bool,

    /// Editorial sustainability rating on a 0-1 scale
    #[serde(default)]
    pub sustainability_rating: Option<f64>,
}

fn default_content_type() -> String {
    "post".to_string()
}

fn default_published() -> bool {
    true
}

impl ContentRecord {
    pub fn new(id: ContentId, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            id,
            title: title.into(),
            body: body.into(),
            content_type: default_content_type(),
            categories: Vec::new(),
            tags: Vec::new(),
            published: true,
            has_featured_image: false,
            sustainability_rating: None,
        }
    }

    pub fn with_categories<I, S>(mut self, categories: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.categories = categories.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_tags<I, S>(mut self, tags: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags = tags.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = content_type.into();
        self
    }
}

/// Sparse feature vector keyed by dimension name
///
/// Keys are kept ordered so that every reduction (dot product, norm) visits
/// dimensions in the same order regardless of operand order.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct SparseVector(BTreeMap<String, f64>);

impl SparseVector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a dimension. Zero and non-finite values are not stored.
    pub fn insert(&mut self, dimension: impl Into<String>, value: f64) {
        let dimension = dimension.into();
        if value == 0.0 || !value.is_finite() {
            self.0.remove(&dimension);
        } else {
            self.0.insert(dimension, value);
        }
    }

    /// Value of a dimension, 0 when absent
    pub fn get(&self, dimension: &str) -> f64 {
        self.0.get(dimension).copied().unwrap_or(0.0)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.0.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn squared_norm(&self) -> f64 {
        self.0.values().map(|v| v * v).sum()
    }

    /// Dot product over the shared dimensions (absent keys count as 0)
    pub fn dot(&self, other: &SparseVector) -> f64 {
        let (small, large) = if self.len() <= other.len() {
            (self, other)
        } else {
            (other, self)
        };
        // Iterate the smaller map; both maps are ordered so the summation
        // order is the ascending key order either way.
        small
            .0
            .iter()
            .filter_map(|(k, v)| large.0.get(k).map(|w| v * w))
            .sum()
    }

    /// Cosine similarity over the union of dimensions, clamped to [0, 1]
    pub fn cosine(&self, other: &SparseVector) -> f64 {
        let denom = (self.squared_norm() * other.squared_norm()).sqrt();
        if denom == 0.0 || !denom.is_finite() {
            return 0.0;
        }
        let result = self.dot(other) / denom;
        if !result.is_finite() {
            return 0.0;
        }
        result.clamp(0.0, 1.0)
    }
}

impl FromIterator<(String, f64)> for SparseVector {
    fn from_iter<T: IntoIterator<Item = (String, f64)>>(iter: T) -> Self {
        let mut vector = SparseVector::new();
        for (k, v) in iter {
            vector.insert(k, v);
        }
        vector
    }
}

/// A dictionary term found in a content item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EnvironmentalKeyword {
    pub count: u32,
    pub weight: f64,
    /// `count * weight`
    pub score: f64,
}

/// Structured feature bag derived from one content item
///
/// A pure function of the [`ContentRecord`] and corpus statistics it was
/// extracted from. Rows are always replaced wholesale, never patched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ContentFeatures {
    pub content_id: ContentId,
    pub content_type: String,
    pub published: bool,

    /// Top keywords by frequency, most frequent first
    pub keyword_frequencies: Vec<(String, u32)>,

    pub environmental_keywords: BTreeMap<String, EnvironmentalKeyword>,

    /// Normalized environmental signal, 0-100
    pub environmental_score: f64,

    pub content_vector: SparseVector,

    /// Distinct tokens of the item, counted once in corpus statistics
    #[serde(default)]
    pub terms: BTreeSet<String>,

    pub categories: BTreeSet<String>,
    pub tags: BTreeSet<String>,

    pub word_count: usize,
    pub readability_score: f64,
    pub structure_score: f64,

    pub has_image: bool,
    pub has_video: bool,

    /// Editorial sustainability rating, 0-1
    pub sustainability_rating: f64,
}

impl ContentFeatures {
    /// Features of an item with no usable content
    pub fn empty(content_id: ContentId, content_type: impl Into<String>) -> Self {
        Self {
            content_id,
            content_type: content_type.into(),
            published: true,
            keyword_frequencies: Vec::new(),
            environmental_keywords: BTreeMap::new(),
            environmental_score: 0.0,
            content_vector: SparseVector::new(),
            terms: BTreeSet::new(),
            categories: BTreeSet::new(),
            tags: BTreeSet::new(),
            word_count: 0,
            readability_score: 0.0,
            structure_score: 0.0,
            has_image: false,
            has_video: false,
            sustainability_rating: 0.0,
        }
    }

    pub fn keywords(&self) -> impl Iterator<Item = &str> {
        self.keyword_frequencies.iter().map(|(k, _)| k.as_str())
    }

    /// Environmental score on a 0-1 scale
    pub fn environmental_ratio(&self) -> f64 {
        (self.environmental_score / 100.0).clamp(0.0, 1.0)
    }
}

/// Algorithms understood by the similarity engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum SimilarityAlgorithm {
    Cosine,
    Jaccard,
    Environmental,
    Behavioral,
    #[default]
    Hybrid,
}

impl SimilarityAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cosine => "cosine",
            Self::Jaccard => "jaccard",
            Self::Environmental => "environmental",
            Self::Behavioral => "behavioral",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for SimilarityAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SimilarityAlgorithm {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "cosine" => Ok(Self::Cosine),
            "jaccard" => Ok(Self::Jaccard),
            "environmental" => Ok(Self::Environmental),
            "behavioral" => Ok(Self::Behavioral),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(InputError::UnknownVariant {
                kind: "similarity algorithm",
                value: other.to_string(),
            }),
        }
    }
}

/// Stored similarity between two content items
///
/// The pair is unordered; constructors normalize it so `content_a < content_b`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarityEdge {
    pub content_a: ContentId,
    pub content_b: ContentId,
    pub score: f64,
    pub algorithm: SimilarityAlgorithm,
    pub computed_at: DateTime<Utc>,
}

impl SimilarityEdge {
    pub fn new(a: ContentId, b: ContentId, score: f64, algorithm: SimilarityAlgorithm) -> Self {
        let (content_a, content_b) = pair_key(a, b);
        Self {
            content_a,
            content_b,
            score: score.clamp(0.0, 1.0),
            algorithm,
            computed_at: Utc::now(),
        }
    }

    pub fn key(&self) -> (ContentId, ContentId) {
        (self.content_a, self.content_b)
    }

    /// The endpoint that is not `id`, if `id` is part of this edge
    pub fn other(&self, id: ContentId) -> Option<ContentId> {
        if self.content_a == id {
            Some(self.content_b)
        } else if self.content_b == id {
            Some(self.content_a)
        } else {
            None
        }
    }
}

/// Canonical ordering of an unordered pair
pub fn pair_key(a: ContentId, b: ContentId) -> (ContentId, ContentId) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

/// Resume point of the batch similarity index: the last pair fully processed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
pub struct IndexCursor {
    pub content_a: ContentId,
    pub content_b: ContentId,
}

/// Kinds of preference tracked per user
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "snake_case")]
pub enum PreferenceType {
    Category,
    Tag,
    ContentType,
    Environmental,
}

impl PreferenceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Tag => "tag",
            Self::ContentType => "content_type",
            Self::Environmental => "environmental",
        }
    }
}

impl fmt::Display for PreferenceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Smoothed affinity of one user for one feature value
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserPreferenceWeight {
    pub user_id: UserId,
    pub preference_type: PreferenceType,
    pub preference_value: String,
    pub weight: f64,
    pub interaction_count: u64,
    pub last_updated: DateTime<Utc>,
}

impl UserPreferenceWeight {
    /// Row created by the first qualifying interaction
    pub fn new(
        user_id: UserId,
        preference_type: PreferenceType,
        preference_value: impl Into<String>,
        weight: f64,
    ) -> Self {
        Self {
            user_id,
            preference_type,
            preference_value: preference_value.into(),
            weight: weight.max(0.0),
            interaction_count: 1,
            last_updated: Utc::now(),
        }
    }

    /// Exponential smoothing: `retention * old + (1 - retention) * incoming`,
    /// never below zero. Returns the change in weight.
    pub fn apply_smoothing(&mut self, incoming: f64, retention: f64) -> f64 {
        let old = self.weight;
        let blended = retention * old + (1.0 - retention) * incoming;
        self.weight = if blended.is_finite() { blended.max(0.0) } else { old };
        self.interaction_count += 1;
        self.last_updated = Utc::now();
        self.weight - old
    }

    pub fn key(&self) -> (UserId, PreferenceType, &str) {
        (self.user_id, self.preference_type, self.preference_value.as_str())
    }
}

/// One smoothing step requested for a (user, type, value) row
#[derive(Debug, Clone, PartialEq)]
pub struct PreferenceUpdate {
    pub user_id: UserId,
    pub preference_type: PreferenceType,
    pub preference_value: String,
    /// Incoming weight; negative values express de-preference
    pub incoming: f64,
}

/// Result of applying a [`PreferenceUpdate`]
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PreferenceChange {
    pub preference: UserPreferenceWeight,
    pub delta: f64,
    pub created: bool,
}

/// User actions the tracker understands
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum InteractionAction {
    View,
    Click,
    Share,
    Like,
    Comment,
    Scroll,
    Rating,
    Dismissal,
    Bookmark,
    Download,
}

impl InteractionAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::View => "view",
            Self::Click => "click",
            Self::Share => "share",
            Self::Like => "like",
            Self::Comment => "comment",
            Self::Scroll => "scroll",
            Self::Rating => "rating",
            Self::Dismissal => "dismissal",
            Self::Bookmark => "bookmark",
            Self::Download => "download",
        }
    }

    /// Actions that show active engagement beyond consumption
    pub fn is_engagement(&self) -> bool {
        matches!(
            self,
            Self::Share | Self::Like | Self::Comment | Self::Bookmark | Self::Download
        )
    }
}

impl fmt::Display for InteractionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InteractionAction {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "view" => Ok(Self::View),
            "click" => Ok(Self::Click),
            "share" => Ok(Self::Share),
            "like" => Ok(Self::Like),
            "comment" => Ok(Self::Comment),
            "scroll" => Ok(Self::Scroll),
            "rating" => Ok(Self::Rating),
            "dismissal" | "dismiss" => Ok(Self::Dismissal),
            "bookmark" => Ok(Self::Bookmark),
            "download" => Ok(Self::Download),
            other => Err(InputError::UnknownVariant {
                kind: "interaction action",
                value: other.to_string(),
            }),
        }
    }
}

/// A discrete user interaction with a content item
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InteractionEvent {
    /// Event id; redelivered events with the same id are ignored
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,

    pub user_id: UserId,
    pub content_id: ContentId,
    pub action: InteractionAction,

    /// Multiplier for the action weight, or the star rating for `rating`
    #[serde(default = "default_event_value")]
    pub value: f64,

    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,

    /// Dwell time for `view` events
    #[serde(default)]
    pub duration_seconds: Option<f64>,

    /// Scroll depth for `scroll` events, 0-1
    #[serde(default)]
    pub scroll_fraction: Option<f64>,
}

fn default_event_value() -> f64 {
    1.0
}

impl InteractionEvent {
    pub fn new(user_id: UserId, content_id: ContentId, action: InteractionAction) -> Self {
        Self {
            id: Uuid::new_v4(),
            user_id,
            content_id,
            action,
            value: default_event_value(),
            timestamp: Utc::now(),
            duration_seconds: None,
            scroll_fraction: None,
        }
    }

    pub fn with_value(mut self, value: f64) -> Self {
        self.value = value;
        self
    }

    pub fn with_duration(mut self, seconds: f64) -> Self {
        self.duration_seconds = Some(seconds);
        self
    }

    pub fn with_scroll_fraction(mut self, fraction: f64) -> Self {
        self.scroll_fraction = Some(fraction);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }
}

/// Recommendation strategies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Personalized,
    SimilarContent,
    Trending,
    Environmental,
    Collaborative,
    #[default]
    Hybrid,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Personalized => "personalized",
            Self::SimilarContent => "similar_content",
            Self::Trending => "trending",
            Self::Environmental => "environmental",
            Self::Collaborative => "collaborative",
            Self::Hybrid => "hybrid",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Strategy {
    type Err = InputError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().replace('-', "_").as_str() {
            "personalized" => Ok(Self::Personalized),
            "similar_content" | "similar" => Ok(Self::SimilarContent),
            "trending" => Ok(Self::Trending),
            "environmental" => Ok(Self::Environmental),
            "collaborative" => Ok(Self::Collaborative),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(InputError::UnknownVariant {
                kind: "strategy",
                value: other.to_string(),
            }),
        }
    }
}

/// One ranked recommendation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Recommendation {
    pub content_id: ContentId,
    pub content_type: String,
    /// Ranking score, 0-1
    pub score: f64,
    /// Strategy that produced the item
    pub strategy: Strategy,
    pub reason: String,
}

impl Recommendation {
    pub fn new(
        features: &ContentFeatures,
        score: f64,
        strategy: Strategy,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            content_id: features.content_id,
            content_type: features.content_type.clone(),
            score: if score.is_finite() { score.clamp(0.0, 1.0) } else { 0.0 },
            strategy,
            reason: reason.into(),
        }
    }

    /// Identity used for deduplication
    pub fn identity(&self) -> (ContentId, &str) {
        (self.content_id, self.content_type.as_str())
    }
}

/// A recommendation list together with how it was produced
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecommendationSet {
    pub user_id: UserId,
    pub requested_strategy: Strategy,
    pub recommendations: Vec<Recommendation>,
    /// True when the requested strategy had no data and trending was served instead
    pub fallback_used: bool,
    pub generated_at: DateTime<Utc>,
}

/// Storage interface for everything the engine persists
///
/// Implementations must make [`EngineStorage::record_event`] and
/// [`EngineStorage::insert_similarity_if_absent`] atomic with respect to
/// concurrent callers, and leave memory untouched when persisting fails.
#[async_trait::async_trait]
pub trait EngineStorage: Send + Sync {
    /// Replace the features row of a content item
    async fn upsert_features(&self, features: ContentFeatures) -> crate::Result<()>;

    async fn get_features(&self, id: ContentId) -> crate::Result<Option<ContentFeatures>>;

    /// All feature rows, ordered by content id
    async fn get_all_features(&self) -> crate::Result<Vec<ContentFeatures>>;

    async fn remove_features(&self, id: ContentId) -> crate::Result<bool>;

    async fn get_similarity(
        &self,
        a: ContentId,
        b: ContentId,
    ) -> crate::Result<Option<SimilarityEdge>>;

    /// Store an edge unless the pair is already indexed. Returns whether it was inserted.
    async fn insert_similarity_if_absent(&self, edge: SimilarityEdge) -> crate::Result<bool>;

    /// Store an edge, replacing any existing one for the pair
    async fn upsert_similarity(&self, edge: SimilarityEdge) -> crate::Result<()>;

    /// Edges touching a content item
    async fn get_edges_for(&self, id: ContentId) -> crate::Result<Vec<SimilarityEdge>>;

    /// Drop every edge touching a content item, returning how many were removed
    async fn invalidate_similarity(&self, id: ContentId) -> crate::Result<usize>;

    async fn count_similarity_edges(&self) -> crate::Result<usize>;

    async fn get_preferences(&self, user_id: UserId) -> crate::Result<Vec<UserPreferenceWeight>>;

    /// Append an event to the interaction log. Returns false for a duplicate event id.
    async fn record_interaction(&self, event: InteractionEvent) -> crate::Result<bool>;

    /// Log an event and apply its preference updates as one unit.
    ///
    /// Each update is one smoothing step on its row; a new row is inserted
    /// only for a positive incoming weight. Returns `None` for a duplicate
    /// event id. On error neither the event
    /// nor any update is visible, so the same event can be retried.
    async fn record_event(
        &self,
        event: InteractionEvent,
        updates: Vec<PreferenceUpdate>,
        retention: f64,
    ) -> crate::Result<Option<Vec<PreferenceChange>>>;

    /// Interaction log entries at or after `since` (all when `None`)
    async fn get_interactions(
        &self,
        since: Option<DateTime<Utc>>,
    ) -> crate::Result<Vec<InteractionEvent>>;

    async fn get_user_interactions(
        &self,
        user_id: UserId,
        since: Option<DateTime<Utc>>,
    ) -> crate::Result<Vec<InteractionEvent>>;

    async fn load_index_checkpoint(&self) -> crate::Result<Option<IndexCursor>>;

    async fn save_index_checkpoint(&self, cursor: Option<IndexCursor>) -> crate::Result<()>;
}


// Request parameter structs

/// Parameters for a recommendation request
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct RecommendParams {
    /// User to recommend for
    pub user_id: UserId,
    /// Strategy to use; hybrid when omitted
    #[serde(default)]
    pub strategy: Option<Strategy>,
    /// Maximum number of items to return
    #[serde(default)]
    pub limit: Option<usize>,
    /// Content ids that must not be returned
    #[serde(default)]
    pub exclude_ids: Vec<ContentId>,
}

/// Parameters for a similar-content lookup
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct FindSimilarParams {
    pub content_id: ContentId,
    #[serde(default = "default_similar_limit")]
    pub limit: usize,
    #[serde(default)]
    pub algorithm: SimilarityAlgorithm,
    /// Minimum similarity to include
    #[serde(default)]
    pub threshold: Option<f64>,
}

fn default_similar_limit() -> usize {
    5
}

/// Parameters for one batch of the similarity index build
#[derive(Debug, Clone, Deserialize, Serialize, JsonSchema)]
pub struct IndexBatchParams {
    /// Maximum pairs to evaluate in this call
    #[serde(default)]
    pub batch_size: Option<usize>,
    /// Ignore the stored checkpoint and start from the first pair
    #[serde(default)]
    pub restart: bool,
}
