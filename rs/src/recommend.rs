//! Recommendation engine
//!
//! Produces ranked, deduplicated, diversity-filtered recommendation lists
//! from stored features, similarity edges, preferences and the interaction
//! log. A request is a pure function of that stored state and the current
//! time; when the requested strategy has nothing to offer the engine serves
//! the trending list instead and says so in [`RecommendationSet::fallback_used`].

use crate::cache::{CacheKey, RecommendationCache};
use crate::config::{EngineConfig, RecommenderConfig, TrackerConfig};
use crate::constants::{
    ENVIRONMENTAL_RANK_WEIGHT_RATING, ENVIRONMENTAL_RANK_WEIGHT_SCORE, HIGH_IMPACT_PREFERENCE,
    NEUTRAL_SCORE, TRENDING_WEIGHT_ENGAGEMENT, TRENDING_WEIGHT_POPULARITY,
};
use crate::models::{
    ContentFeatures, ContentId, EngineStorage, InputError, InteractionAction, InteractionEvent,
    PreferenceType, RecommendParams, Recommendation, RecommendationSet, Strategy, UserId,
    UserPreferenceWeight,
};
use crate::similarity::{jaccard, AudienceIndex, SimilarityEngine};
use crate::tracker::{interaction_weight, BehaviorTracker};
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

/// Stored state a single request is answered from
struct RequestContext {
    user_id: UserId,
    now: DateTime<Utc>,
    /// Published content only
    features: BTreeMap<ContentId, ContentFeatures>,
    interactions: Vec<InteractionEvent>,
    audience: AudienceIndex,
    /// Caller exclusions plus everything the user dismissed
    excluded: BTreeSet<ContentId>,
}

impl RequestContext {
    fn user_events(&self) -> impl Iterator<Item = &InteractionEvent> {
        self.interactions
            .iter()
            .filter(move |e| e.user_id == self.user_id)
    }

    /// Content the user interacted with in the last `days` days
    fn recently_touched(&self, days: i64) -> BTreeSet<ContentId> {
        let since = self.now - Duration::days(days);
        self.user_events()
            .filter(|e| e.timestamp >= since)
            .map(|e| e.content_id)
            .collect()
    }

    fn is_candidate(&self, id: ContentId) -> bool {
        self.features.contains_key(&id) && !self.excluded.contains(&id)
    }

    fn candidates(&self) -> impl Iterator<Item = &ContentFeatures> {
        self.features
            .values()
            .filter(move |f| !self.excluded.contains(&f.content_id))
    }
}

/// Score descending, then content id ascending
fn rank(recommendations: &mut [Recommendation]) {
    recommendations.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then(a.content_id.cmp(&b.content_id))
            .then_with(|| a.content_type.cmp(&b.content_type))
    });
}

/// Keep the first occurrence of every (content id, content type)
fn dedup(recommendations: Vec<Recommendation>) -> Vec<Recommendation> {
    let mut seen: HashSet<(ContentId, String)> = HashSet::new();
    recommendations
        .into_iter()
        .filter(|r| seen.insert((r.content_id, r.content_type.clone())))
        .collect()
}

/// How strongly `features` carries the value a preference is about, 0-1
fn preference_match(preference: &UserPreferenceWeight, features: &ContentFeatures) -> f64 {
    let value = preference.preference_value.as_str();
    let matched = match preference.preference_type {
        PreferenceType::Category => features.categories.contains(value),
        PreferenceType::Tag => features.tags.contains(value),
        PreferenceType::ContentType => features.content_type == value,
        PreferenceType::Environmental => {
            return if value == HIGH_IMPACT_PREFERENCE {
                features.environmental_ratio()
            } else {
                0.0
            };
        }
    };
    if matched {
        1.0
    } else {
        0.0
    }
}

/// Produces recommendation lists
pub struct RecommendationEngine {
    store: Arc<dyn EngineStorage>,
    similarity: SimilarityEngine,
    config: RecommenderConfig,
    tracker_config: TrackerConfig,
    cache: Option<Arc<RecommendationCache>>,
}

impl RecommendationEngine {
    pub fn new(
        store: Arc<dyn EngineStorage>,
        similarity: SimilarityEngine,
        config: RecommenderConfig,
    ) -> Self {
        Self {
            store,
            similarity,
            config,
            tracker_config: TrackerConfig::default(),
            cache: None,
        }
    }

    /// Engine wired from a full configuration, with a recommendation cache
    /// unless `cache_ttl_seconds` is 0
    pub fn from_config(store: Arc<dyn EngineStorage>, config: &EngineConfig) -> Self {
        let engine = Self::new(
            store,
            SimilarityEngine::new(config.similarity.clone()),
            config.recommender.clone(),
        )
        .with_tracker_config(config.tracker.clone());
        match RecommendationCache::from_config(&config.recommender) {
            Some(cache) => engine.with_cache(Arc::new(cache)),
            None => engine,
        }
    }

    /// Action weights used to score interactions in collaborative filtering
    pub fn with_tracker_config(mut self, tracker_config: TrackerConfig) -> Self {
        self.tracker_config = tracker_config;
        self
    }

    pub fn with_cache(mut self, cache: Arc<RecommendationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &RecommenderConfig {
        &self.config
    }

    /// Tracker over the same store that invalidates this engine's cache
    pub fn tracker(&self) -> BehaviorTracker {
        let tracker = BehaviorTracker::new(self.store.clone(), self.tracker_config.clone());
        match &self.cache {
            Some(cache) => tracker.with_cache(cache.clone()),
            None => tracker,
        }
    }

    pub async fn recommend_params(
        &self,
        params: &RecommendParams,
    ) -> crate::Result<RecommendationSet> {
        self.recommend(params.user_id, params.strategy, params.limit, &params.exclude_ids)
            .await
    }

    /// Ranked recommendations for a user.
    ///
    /// `strategy` defaults to hybrid and `limit` to the configured default.
    /// Only malformed input is an error: a user id of 0 or a limit outside
    /// `1..=max_limit`.
    pub async fn recommend(
        &self,
        user_id: UserId,
        strategy: Option<Strategy>,
        limit: Option<usize>,
        exclude_ids: &[ContentId],
    ) -> crate::Result<RecommendationSet> {
        if user_id == 0 {
            return Err(InputError::InvalidUserId(user_id).into());
        }
        let limit = limit.unwrap_or(self.config.default_limit);
        if limit == 0 || limit > self.config.max_limit {
            return Err(InputError::InvalidLimit {
                limit,
                max: self.config.max_limit,
            }
            .into());
        }
        let strategy = strategy.unwrap_or_default();

        let key = CacheKey::new(user_id, strategy, limit, exclude_ids);
        if let Some(cache) = &self.cache {
            if let Some(cached) = cache.get(&key).await {
                tracing::debug!("Serving cached {} recommendations for user {}", strategy, user_id);
                return Ok(cached);
            }
        }

        let start = std::time::Instant::now();
        let ctx = self.load_context(user_id, exclude_ids).await?;

        let raw = self.run_strategy(strategy, &ctx, limit).await?;
        let mut recommendations = self.finalize(&ctx, raw, limit);
        let mut fallback_used = false;

        if recommendations.is_empty() && strategy != Strategy::Trending {
            tracing::debug!(
                "Strategy {} produced nothing for user {}, falling back to trending",
                strategy,
                user_id
            );
            let trending = self.trending(&ctx);
            recommendations = self.finalize(&ctx, trending, limit);
            fallback_used = true;
        }

        tracing::info!(
            "Generated {} {} recommendations for user {} in {:?}{}",
            recommendations.len(),
            strategy,
            user_id,
            start.elapsed(),
            if fallback_used { " (trending fallback)" } else { "" }
        );

        let set = RecommendationSet {
            user_id,
            requested_strategy: strategy,
            recommendations,
            fallback_used,
            generated_at: Utc::now(),
        };
        if let Some(cache) = &self.cache {
            cache.put(key, set.clone()).await;
        }
        Ok(set)
    }

    async fn load_context(
        &self,
        user_id: UserId,
        exclude_ids: &[ContentId],
    ) -> crate::Result<RequestContext> {
        let features: BTreeMap<ContentId, ContentFeatures> = self
            .store
            .get_all_features()
            .await?
            .into_iter()
            .filter(|f| f.published)
            .map(|f| (f.content_id, f))
            .collect();
        let interactions = self.store.get_interactions(None).await?;
        let audience = AudienceIndex::from_interactions(&interactions);

        let mut excluded: BTreeSet<ContentId> = exclude_ids.iter().copied().collect();
        excluded.extend(
            interactions
                .iter()
                .filter(|e| e.user_id == user_id && e.action == InteractionAction::Dismissal)
                .map(|e| e.content_id),
        );

        Ok(RequestContext {
            user_id,
            now: Utc::now(),
            features,
            interactions,
            audience,
            excluded,
        })
    }

    async fn run_strategy(
        &self,
        strategy: Strategy,
        ctx: &RequestContext,
        limit: usize,
    ) -> crate::Result<Vec<Recommendation>> {
        if strategy == Strategy::Hybrid {
            return self.hybrid(ctx, limit).await;
        }
        self.single_strategy(strategy, ctx, limit).await
    }

    /// Raw, ranked output of one non-hybrid strategy
    async fn single_strategy(
        &self,
        strategy: Strategy,
        ctx: &RequestContext,
        limit: usize,
    ) -> crate::Result<Vec<Recommendation>> {
        let mut recommendations = match strategy {
            Strategy::Personalized => {
                let preferences = self.store.get_preferences(ctx.user_id).await?;
                self.personalized(ctx, preferences)
            }
            Strategy::SimilarContent => self.similar_content(ctx, limit).await?,
            Strategy::Trending => self.trending(ctx),
            Strategy::Environmental => self.environmental(ctx),
            Strategy::Collaborative => self.collaborative(ctx),
            Strategy::Hybrid => Vec::new(),
        };
        rank(&mut recommendations);
        Ok(recommendations)
    }

    /// Content matching the user's strongest preferences
    fn personalized(
        &self,
        ctx: &RequestContext,
        mut preferences: Vec<UserPreferenceWeight>,
    ) -> Vec<Recommendation> {
        preferences.retain(|p| p.weight > 0.0);
        preferences.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.key().cmp(&b.key()))
        });
        preferences.truncate(self.config.personalized_max_preferences);
        if preferences.is_empty() {
            return Vec::new();
        }

        let considered: f64 = preferences.iter().map(|p| p.weight).sum();
        let recently_touched = ctx.recently_touched(self.config.personalized_exclusion_days);
        ctx.candidates()
            .filter(|f| !recently_touched.contains(&f.content_id))
            .filter_map(|features| {
                let mut matched = 0.0;
                let mut strongest: Option<(&UserPreferenceWeight, f64)> = None;
                for preference in &preferences {
                    let contribution = preference_match(preference, features) * preference.weight;
                    if contribution > 0.0 {
                        matched += contribution;
                        if strongest.map_or(true, |(_, c)| contribution > c) {
                            strongest = Some((preference, contribution));
                        }
                    }
                }
                let (preference, _) = strongest?;
                let score = if considered > 0.0 {
                    matched / considered
                } else {
                    NEUTRAL_SCORE
                };
                Some(Recommendation::new(
                    features,
                    score,
                    Strategy::Personalized,
                    format!(
                        "matches your interest in {} {}",
                        preference.preference_type, preference.preference_value
                    ),
                ))
            })
            .collect()
    }

    /// Neighbors of what the user recently engaged with
    async fn similar_content(
        &self,
        ctx: &RequestContext,
        limit: usize,
    ) -> crate::Result<Vec<Recommendation>> {
        let since = ctx.now - Duration::days(self.config.similar_lookback_days);
        let mut recent: Vec<&InteractionEvent> = ctx
            .user_events()
            .filter(|e| e.timestamp >= since && e.action != InteractionAction::Dismissal)
            .collect();
        recent.sort_by(|a, b| {
            b.timestamp
                .cmp(&a.timestamp)
                .then(a.content_id.cmp(&b.content_id))
        });

        let mut seeds: Vec<ContentId> = Vec::new();
        for event in recent {
            if seeds.len() >= self.config.similar_max_seeds {
                break;
            }
            if ctx.features.contains_key(&event.content_id) && !seeds.contains(&event.content_id)
            {
                seeds.push(event.content_id);
            }
        }
        if seeds.is_empty() {
            return Ok(Vec::new());
        }

        let per_seed = limit.div_ceil(seeds.len());
        let threshold = self.similarity.config().find_threshold;
        let pool: Vec<ContentFeatures> = ctx
            .candidates()
            .filter(|f| !seeds.contains(&f.content_id))
            .cloned()
            .collect();

        let mut best: BTreeMap<ContentId, Recommendation> = BTreeMap::new();
        for seed in &seeds {
            let indexed = self
                .similarity
                .find_similar_indexed(self.store.as_ref(), *seed, usize::MAX, threshold)
                .await?;
            let mut neighbors: Vec<(ContentId, f64)> = indexed
                .into_iter()
                .filter(|n| ctx.is_candidate(n.content_id) && !seeds.contains(&n.content_id))
                .map(|n| (n.content_id, n.score))
                .take(per_seed)
                .collect();

            if neighbors.is_empty() {
                // Seed not indexed yet, score against the pool directly
                if let Some(target) = ctx.features.get(seed) {
                    neighbors = self
                        .similarity
                        .find_similar(
                            target,
                            &pool,
                            per_seed,
                            crate::models::SimilarityAlgorithm::Hybrid,
                            threshold,
                            Some(&ctx.audience),
                        )
                        .into_iter()
                        .map(|n| (n.content_id, n.score))
                        .collect();
                }
            }

            for (content_id, score) in neighbors {
                let Some(features) = ctx.features.get(&content_id) else {
                    continue;
                };
                let replace = best.get(&content_id).map_or(true, |r| score > r.score);
                if replace {
                    best.insert(
                        content_id,
                        Recommendation::new(
                            features,
                            score,
                            Strategy::SimilarContent,
                            format!("similar to content {seed}"),
                        ),
                    );
                }
            }
        }
        Ok(best.into_values().collect())
    }

    /// Popular and engaging content of the trending window
    fn trending(&self, ctx: &RequestContext) -> Vec<Recommendation> {
        let since = ctx.now - Duration::days(self.config.trending_window_days);
        let recently_touched = ctx.recently_touched(self.config.trending_exclusion_days);

        // content id -> (interactions, engaged interactions)
        let mut activity: BTreeMap<ContentId, (u64, u64)> = BTreeMap::new();
        for event in &ctx.interactions {
            if event.timestamp < since || event.action == InteractionAction::Dismissal {
                continue;
            }
            let entry = activity.entry(event.content_id).or_default();
            entry.0 += 1;
            if event.action.is_engagement() {
                entry.1 += 1;
            }
        }

        let max_total = activity.values().map(|(total, _)| *total).max().unwrap_or(0);
        if max_total == 0 {
            return Vec::new();
        }
        let max_log = (1.0 + max_total as f64).ln();

        activity
            .into_iter()
            .filter(|(id, _)| ctx.is_candidate(*id) && !recently_touched.contains(id))
            .filter_map(|(id, (total, engaged))| {
                let features = ctx.features.get(&id)?;
                let popularity = (1.0 + total as f64).ln() / max_log;
                let engagement = engaged as f64 / total as f64;
                let score = TRENDING_WEIGHT_POPULARITY * popularity
                    + TRENDING_WEIGHT_ENGAGEMENT * engagement;
                Some(Recommendation::new(
                    features,
                    score,
                    Strategy::Trending,
                    format!("trending with {total} recent interactions"),
                ))
            })
            .collect()
    }

    /// Content with a strong environmental signal
    fn environmental(&self, ctx: &RequestContext) -> Vec<Recommendation> {
        let recently_touched = ctx.recently_touched(self.config.environmental_exclusion_days);
        ctx.candidates()
            .filter(|f| f.environmental_score > self.config.environmental_min_score)
            .filter(|f| !recently_touched.contains(&f.content_id))
            .map(|features| {
                let score = ENVIRONMENTAL_RANK_WEIGHT_SCORE * features.environmental_ratio()
                    + ENVIRONMENTAL_RANK_WEIGHT_RATING * features.sustainability_rating;
                Recommendation::new(
                    features,
                    score,
                    Strategy::Environmental,
                    format!("environmental impact score {:.0}", features.environmental_score),
                )
            })
            .collect()
    }

    /// Content liked by users with overlapping interaction histories
    fn collaborative(&self, ctx: &RequestContext) -> Vec<Recommendation> {
        let max_base = self.tracker_config.action_weights.max_base();
        if max_base <= 0.0 {
            return Vec::new();
        }

        // user -> content -> strongest normalized interaction score
        let mut profiles: BTreeMap<UserId, BTreeMap<ContentId, f64>> = BTreeMap::new();
        // user -> content -> supporting interaction count
        let mut support: BTreeMap<UserId, BTreeMap<ContentId, usize>> = BTreeMap::new();
        let mut touched_by_user: BTreeSet<ContentId> = BTreeSet::new();

        for event in &ctx.interactions {
            if event.user_id == ctx.user_id {
                touched_by_user.insert(event.content_id);
            }
            let weight = interaction_weight(event, &self.tracker_config);
            if weight <= 0.0 {
                continue;
            }
            let score = (weight / max_base).min(1.0);
            let entry = profiles
                .entry(event.user_id)
                .or_default()
                .entry(event.content_id)
                .or_insert(0.0);
            *entry = f64::max(*entry, score);
            *support
                .entry(event.user_id)
                .or_default()
                .entry(event.content_id)
                .or_insert(0) += 1;
        }

        let Some(own) = profiles.get(&ctx.user_id) else {
            return Vec::new();
        };
        let own_items: BTreeSet<ContentId> = own.keys().copied().collect();
        let own_keys: Vec<String> = own_items.iter().map(|id| id.to_string()).collect();

        let mut neighbors: Vec<(UserId, f64)> = profiles
            .iter()
            .filter(|(user, _)| **user != ctx.user_id)
            .filter_map(|(user, items)| {
                let common = items.keys().filter(|id| own_items.contains(id)).count();
                if common < self.config.collaborative_min_common {
                    return None;
                }
                let item_keys: Vec<String> = items.keys().map(|id| id.to_string()).collect();
                Some((*user, jaccard(&own_keys, &item_keys)))
            })
            .collect();
        neighbors.sort_by(|a, b| b.1.total_cmp(&a.1).then(a.0.cmp(&b.0)));
        neighbors.truncate(self.config.collaborative_max_neighbors);
        if neighbors.is_empty() {
            return Vec::new();
        }

        // content -> (score sum, neighbor count, interaction count)
        let mut aggregate: BTreeMap<ContentId, (f64, usize, usize)> = BTreeMap::new();
        for (neighbor, _) in &neighbors {
            let (Some(items), Some(counts)) = (profiles.get(neighbor), support.get(neighbor))
            else {
                continue;
            };
            for (content_id, score) in items {
                if touched_by_user.contains(content_id) || !ctx.is_candidate(*content_id) {
                    continue;
                }
                let entry = aggregate.entry(*content_id).or_insert((0.0, 0, 0));
                entry.0 += score;
                entry.1 += 1;
                entry.2 += counts.get(content_id).copied().unwrap_or(0);
            }
        }

        let mut ranked: Vec<(ContentId, f64, usize)> = aggregate
            .into_iter()
            .filter(|(_, (_, _, interactions))| {
                *interactions >= self.config.collaborative_min_support
            })
            .map(|(id, (sum, users, interactions))| (id, sum / users as f64, interactions))
            .collect();
        ranked.sort_by(|a, b| {
            b.1.total_cmp(&a.1)
                .then(b.2.cmp(&a.2))
                .then(a.0.cmp(&b.0))
        });

        ranked
            .into_iter()
            .filter_map(|(id, average, interactions)| {
                let features = ctx.features.get(&id)?;
                Some(Recommendation::new(
                    features,
                    average,
                    Strategy::Collaborative,
                    format!("{interactions} interactions from similar users"),
                ))
            })
            .collect()
    }

    /// Weighted blend of personalized, environmental, trending and collaborative
    async fn hybrid(
        &self,
        ctx: &RequestContext,
        limit: usize,
    ) -> crate::Result<Vec<Recommendation>> {
        let weights = &self.config.strategy_weights;
        let parts = [
            (Strategy::Personalized, weights.personalized),
            (Strategy::Environmental, weights.environmental),
            (Strategy::Trending, weights.trending),
            (Strategy::Collaborative, weights.collaborative),
        ];

        let mut merged = Vec::new();
        for (strategy, weight) in parts {
            if weight <= 0.0 {
                continue;
            }
            let wanted = (2.0 * limit as f64 * weight).ceil() as usize;
            let results = self.single_strategy(strategy, ctx, limit).await?;
            merged.extend(results.into_iter().take(wanted).map(|mut r| {
                r.score *= weight;
                r
            }));
        }
        rank(&mut merged);
        Ok(dedup(merged))
    }

    /// Rank, deduplicate and diversity-filter raw strategy output
    fn finalize(
        &self,
        ctx: &RequestContext,
        mut recommendations: Vec<Recommendation>,
        limit: usize,
    ) -> Vec<Recommendation> {
        rank(&mut recommendations);
        let recommendations = dedup(recommendations);

        let mut accepted: Vec<Recommendation> = Vec::with_capacity(limit);
        for candidate in recommendations {
            if accepted.len() >= limit {
                break;
            }
            if self.is_diverse(ctx, &candidate, &accepted) {
                accepted.push(candidate);
            }
        }
        accepted
    }

    /// True when `candidate` is not too similar to anything already accepted
    fn is_diverse(
        &self,
        ctx: &RequestContext,
        candidate: &Recommendation,
        accepted: &[Recommendation],
    ) -> bool {
        let Some(features) = ctx.features.get(&candidate.content_id) else {
            return true;
        };
        accepted.iter().all(|other| {
            ctx.features.get(&other.content_id).map_or(true, |other_features| {
                self.similarity.similarity_with_audience(
                    features,
                    other_features,
                    self.config.diversity_algorithm,
                    &ctx.audience,
                ) <= self.config.diversity_threshold
            })
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::features::{CorpusIndex, FeatureExtractor};
    use crate::models::{ContentRecord, SimilarityAlgorithm};
    use crate::storage::MemoryStorage;
    use crate::tracker::RecordOutcome;

    const SOLAR_BODY: &str = "Solar panels reduce carbon emissions and protect biodiversity";

    fn records() -> Vec<ContentRecord> {
        vec![
            ContentRecord::new(1, "Solar panels", SOLAR_BODY)
                .with_categories(["energy"])
                .with_tags(["solar"]),
            ContentRecord::new(
                2,
                "Wind farms",
                "Renewable wind energy cuts emissions and pollution",
            )
            .with_categories(["energy"])
            .with_tags(["wind"]),
            ContentRecord::new(3, "Bakery", "Local bakery opens new store downtown")
                .with_categories(["food"]),
            ContentRecord::new(
                4,
                "Recycling",
                "Recycling plastic waste protects the ocean and wildlife",
            )
            .with_categories(["waste"])
            .with_tags(["plastic"]),
            ContentRecord::new(5, "Market", "Farmers market sells fresh bread and pastries")
                .with_categories(["food"]),
            ContentRecord::new(6, "Concert", "Jazz band plays downtown on Friday night")
                .with_categories(["music"]),
        ]
    }

    async fn store_with(records: &[ContentRecord]) -> Arc<MemoryStorage> {
        let store = Arc::new(MemoryStorage::new());
        let extractor = FeatureExtractor::default();
        let corpus = CorpusIndex::build(&extractor, records);
        for record in records {
            store
                .upsert_features(extractor.extract(record, &corpus))
                .await
                .unwrap();
        }
        store
    }

    fn uncached_config() -> EngineConfig {
        EngineConfig {
            recommender: RecommenderConfig {
                cache_ttl_seconds: 0,
                ..RecommenderConfig::default()
            },
            ..EngineConfig::default()
        }
    }

    fn engine(store: Arc<MemoryStorage>) -> RecommendationEngine {
        RecommendationEngine::from_config(store, &uncached_config())
    }

    async fn interact(
        store: &MemoryStorage,
        user: UserId,
        content: ContentId,
        action: InteractionAction,
    ) {
        store
            .record_interaction(InteractionEvent::new(user, content, action))
            .await
            .unwrap();
    }

    fn ids(set: &RecommendationSet) -> Vec<ContentId> {
        set.recommendations.iter().map(|r| r.content_id).collect()
    }

    #[tokio::test]
    async fn test_rejects_malformed_input() {
        let engine = engine(store_with(&records()).await);

        let err = engine.recommend(0, None, Some(5), &[]).await.unwrap_err();
        assert_eq!(err.downcast_ref::<InputError>(), Some(&InputError::InvalidUserId(0)));

        let err = engine.recommend(1, None, Some(0), &[]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InputError>(),
            Some(InputError::InvalidLimit { limit: 0, .. })
        ));

        let err = engine.recommend(1, None, Some(101), &[]).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<InputError>(),
            Some(InputError::InvalidLimit { limit: 101, max: 100 })
        ));
    }

    #[tokio::test]
    async fn test_empty_engine_returns_empty_list() {
        let engine = engine(Arc::new(MemoryStorage::new()));
        let set = engine.recommend(1, None, None, &[]).await.unwrap();
        assert!(set.recommendations.is_empty());
        assert!(set.fallback_used);
    }

    #[tokio::test]
    async fn test_personalized_falls_back_to_trending() {
        let store = store_with(&records()).await;
        interact(&store, 2, 3, InteractionAction::View).await;
        interact(&store, 3, 3, InteractionAction::Like).await;
        interact(&store, 2, 6, InteractionAction::View).await;
        let engine = engine(store);

        let personalized = engine
            .recommend(1, Some(Strategy::Personalized), Some(5), &[])
            .await
            .unwrap();
        let trending = engine
            .recommend(1, Some(Strategy::Trending), Some(5), &[])
            .await
            .unwrap();

        assert!(personalized.fallback_used);
        assert!(!trending.fallback_used);
        assert_eq!(personalized.recommendations, trending.recommendations);
        assert_eq!(ids(&trending), vec![3, 6]);
    }

    #[tokio::test]
    async fn test_trending_excludes_recently_touched() {
        let store = store_with(&records()).await;
        interact(&store, 2, 3, InteractionAction::View).await;
        interact(&store, 2, 5, InteractionAction::View).await;
        interact(&store, 1, 3, InteractionAction::View).await;
        let engine = engine(store);

        let set = engine
            .recommend(1, Some(Strategy::Trending), Some(5), &[])
            .await
            .unwrap();
        assert_eq!(ids(&set), vec![5]);
    }

    #[tokio::test]
    async fn test_environmental_strategy() {
        let engine = engine(store_with(&records()).await);
        let set = engine
            .recommend(1, Some(Strategy::Environmental), Some(10), &[4])
            .await
            .unwrap();

        assert!(!set.fallback_used);
        let returned = ids(&set);
        assert!(returned.contains(&1));
        assert!(returned.contains(&2));
        assert!(!returned.contains(&3));
        assert!(!returned.contains(&4));
        assert!(set
            .recommendations
            .iter()
            .all(|r| r.strategy == Strategy::Environmental));
    }

    #[tokio::test]
    async fn test_personalized_uses_preferences() {
        let store = store_with(&records()).await;
        let tracker = BehaviorTracker::new(store.clone(), TrackerConfig::default());
        tracker
            .record(InteractionEvent::new(1, 3, InteractionAction::Like))
            .await
            .unwrap();
        let engine = engine(store);

        let set = engine
            .recommend(1, Some(Strategy::Personalized), Some(3), &[])
            .await
            .unwrap();
        assert!(!set.fallback_used);
        // The liked bakery post is not offered back; the other food item leads
        assert!(!ids(&set).contains(&3));
        assert_eq!(set.recommendations[0].content_id, 5);
        assert_eq!(set.recommendations[0].score, 1.0);
        assert!(set.recommendations.iter().all(|r| r.score > 0.0 && r.score <= 1.0));
    }

    #[tokio::test]
    async fn test_similar_content_from_recent_views() {
        let store = store_with(&records()).await;
        interact(&store, 1, 1, InteractionAction::View).await;
        let engine = engine(store);

        let set = engine
            .recommend(1, Some(Strategy::SimilarContent), Some(3), &[])
            .await
            .unwrap();
        assert!(!set.fallback_used);
        assert!(!ids(&set).contains(&1));
        assert_eq!(set.recommendations[0].content_id, 2);
    }

    #[tokio::test]
    async fn test_collaborative_requires_overlap_and_support() {
        let store = store_with(&records()).await;
        for item in [1, 2, 3] {
            interact(&store, 1, item, InteractionAction::Like).await;
            interact(&store, 2, item, InteractionAction::Like).await;
            interact(&store, 3, item, InteractionAction::Like).await;
        }
        // Two neighbors support item 4, a single one supports item 6
        interact(&store, 2, 4, InteractionAction::Share).await;
        interact(&store, 3, 4, InteractionAction::Like).await;
        interact(&store, 2, 6, InteractionAction::View).await;
        let engine = engine(store);

        let set = engine
            .recommend(1, Some(Strategy::Collaborative), Some(5), &[])
            .await
            .unwrap();
        assert!(!set.fallback_used);
        assert_eq!(ids(&set), vec![4]);
    }

    #[tokio::test]
    async fn test_dismissed_content_never_returned() {
        let store = store_with(&records()).await;
        interact(&store, 1, 2, InteractionAction::Dismissal).await;
        let engine = engine(store);

        for strategy in [Strategy::Environmental, Strategy::Hybrid] {
            let set = engine.recommend(1, Some(strategy), Some(10), &[]).await.unwrap();
            assert!(!ids(&set).contains(&2));
        }
    }

    #[tokio::test]
    async fn test_hybrid_dedup_and_diversity() {
        let mut records = records();
        // Near-duplicate of item 1
        records.push(
            ContentRecord::new(7, "Solar panels", SOLAR_BODY)
                .with_categories(["energy"])
                .with_tags(["solar"]),
        );
        let store = store_with(&records).await;
        interact(&store, 2, 1, InteractionAction::Share).await;
        interact(&store, 2, 7, InteractionAction::Share).await;
        let engine = engine(store.clone());

        let set = engine.recommend(1, None, Some(10), &[]).await.unwrap();
        assert_eq!(set.requested_strategy, Strategy::Hybrid);
        assert!(set.recommendations.len() <= 10);

        let mut seen = HashSet::new();
        for r in &set.recommendations {
            assert!(seen.insert((r.content_id, r.content_type.clone())));
        }

        let features: Vec<ContentFeatures> = store.get_all_features().await.unwrap();
        let interactions = store.get_interactions(None).await.unwrap();
        let audience = AudienceIndex::from_interactions(&interactions);
        let similarity = SimilarityEngine::default();
        for (i, a) in set.recommendations.iter().enumerate() {
            for b in &set.recommendations[i + 1..] {
                let fa = features.iter().find(|f| f.content_id == a.content_id).unwrap();
                let fb = features.iter().find(|f| f.content_id == b.content_id).unwrap();
                let score = similarity.similarity_with_audience(
                    fa,
                    fb,
                    SimilarityAlgorithm::Hybrid,
                    &audience,
                );
                assert!(score <= engine.config().diversity_threshold);
            }
        }
        let returned = ids(&set);
        assert!(!(returned.contains(&1) && returned.contains(&7)));
    }

    #[tokio::test]
    async fn test_results_are_cached_until_preferences_change() {
        let store = store_with(&records()).await;
        let engine = RecommendationEngine::from_config(store, &EngineConfig::default());
        let tracker = engine.tracker();

        let first = engine.recommend(1, None, Some(5), &[]).await.unwrap();
        let second = engine.recommend(1, None, Some(5), &[]).await.unwrap();
        assert_eq!(first.generated_at, second.generated_at);

        let outcome = tracker
            .record(InteractionEvent::new(1, 1, InteractionAction::Like))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RecordOutcome::Applied {
                cache_invalidated: true,
                ..
            }
        ));
        let third = engine.recommend(1, None, Some(5), &[]).await.unwrap();
        assert!(third.generated_at > first.generated_at);
    }

    #[tokio::test]
    async fn test_zero_ttl_serves_fresh_lists() {
        let store = store_with(&records()).await;
        let cached = RecommendationEngine::from_config(store.clone(), &EngineConfig::default());
        let uncached = engine(store.clone());

        let before = cached
            .recommend(1, Some(Strategy::Trending), Some(5), &[])
            .await
            .unwrap();
        assert!(before.recommendations.is_empty());
        assert!(uncached
            .recommend(1, Some(Strategy::Trending), Some(5), &[])
            .await
            .unwrap()
            .recommendations
            .is_empty());

        interact(&store, 2, 3, InteractionAction::Like).await;

        // The interaction log changed without a tracked preference update
        let stale = cached
            .recommend(1, Some(Strategy::Trending), Some(5), &[])
            .await
            .unwrap();
        assert!(stale.recommendations.is_empty());
        let fresh = uncached
            .recommend(1, Some(Strategy::Trending), Some(5), &[])
            .await
            .unwrap();
        assert_eq!(ids(&fresh), vec![3]);
    }
}
