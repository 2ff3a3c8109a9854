//! Behavior tracker
//!
//! Turns interaction events into smoothed per-user preference weights over
//! the categories, tags, content type and environmental impact of the
//! content a user touches.

use crate::cache::RecommendationCache;
use crate::config::TrackerConfig;
use crate::constants::HIGH_IMPACT_PREFERENCE;
use crate::models::{
    ContentFeatures, EngineStorage, InputError, InteractionAction, InteractionEvent,
    PreferenceChange, PreferenceType, PreferenceUpdate, UserId, UserPreferenceWeight,
};
use serde::Serialize;
use std::sync::Arc;

/// Why an event did not update any preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IgnoreReason {
    InvalidUser,
    UnknownContent,
    DuplicateEvent,
}

/// What [`BehaviorTracker::record`] did with an event
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RecordOutcome {
    Applied {
        /// Signed weight derived from the event
        weight: f64,
        changes: Vec<PreferenceChange>,
        cache_invalidated: bool,
    },
    Ignored { reason: IgnoreReason },
}

impl RecordOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }
}

/// Signed preference weight of one event.
///
/// Positive actions scale their base weight by `value`, view dwell time and
/// scroll depth. Ratings are signed around the neutral star value and
/// dismissals are always negative.
pub fn interaction_weight(event: &InteractionEvent, config: &TrackerConfig) -> f64 {
    let weights = &config.action_weights;
    let value = if event.value.is_finite() { event.value } else { 0.0 };

    let weight = match event.action {
        InteractionAction::Rating => {
            let signed = (value - config.neutral_rating) / config.rating_half_range;
            weights.rating * signed.clamp(-1.0, 1.0)
        }
        InteractionAction::Dismissal => -weights.dismissal * value.abs(),
        InteractionAction::View => {
            let mut weight = weights.view * value;
            if let Some(duration) = event.duration_seconds.filter(|d| d.is_finite()) {
                let minutes = duration.max(0.0) / config.dwell_unit_seconds;
                weight *= 1.0 + minutes.min(config.max_dwell_bonus);
            }
            weight
        }
        InteractionAction::Scroll => {
            let mut weight = weights.scroll * value;
            if let Some(fraction) = event.scroll_fraction.filter(|f| f.is_finite()) {
                weight *= 0.5 + fraction.clamp(0.0, 1.0);
            }
            weight
        }
        InteractionAction::Click => weights.click * value,
        InteractionAction::Share => weights.share * value,
        InteractionAction::Like => weights.like * value,
        InteractionAction::Comment => weights.comment * value,
        InteractionAction::Bookmark => weights.bookmark * value,
        InteractionAction::Download => weights.download * value,
    };

    if weight.is_finite() {
        weight
    } else {
        0.0
    }
}

/// Preference rows touched by an event on `features`
fn preference_updates(
    user_id: UserId,
    features: &ContentFeatures,
    weight: f64,
) -> Vec<PreferenceUpdate> {
    let update = |preference_type, value: &str, incoming| PreferenceUpdate {
        user_id,
        preference_type,
        preference_value: value.to_string(),
        incoming,
    };

    let mut updates = Vec::new();
    for category in &features.categories {
        updates.push(update(PreferenceType::Category, category, weight));
    }
    for tag in &features.tags {
        updates.push(update(PreferenceType::Tag, tag, weight));
    }
    if !features.content_type.is_empty() {
        updates.push(update(PreferenceType::ContentType, &features.content_type, weight));
    }
    if features.environmental_score > 0.0 {
        updates.push(update(
            PreferenceType::Environmental,
            HIGH_IMPACT_PREFERENCE,
            weight * features.environmental_ratio(),
        ));
    }
    updates
}

/// Records interactions and maintains preference weights
pub struct BehaviorTracker {
    store: Arc<dyn EngineStorage>,
    config: TrackerConfig,
    cache: Option<Arc<RecommendationCache>>,
}

impl BehaviorTracker {
    pub fn new(store: Arc<dyn EngineStorage>, config: TrackerConfig) -> Self {
        Self {
            store,
            config,
            cache: None,
        }
    }

    /// Invalidate this cache's entries for a user whenever their preferences move
    pub fn with_cache(mut self, cache: Arc<RecommendationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &TrackerConfig {
        &self.config
    }

    /// Log an interaction and fold it into the user's preferences.
    ///
    /// Events for user 0, for content without features, or with an already
    /// seen id are ignored rather than rejected.
    pub async fn record(&self, event: InteractionEvent) -> crate::Result<RecordOutcome> {
        if event.user_id == 0 {
            tracing::warn!("Ignoring {} event with invalid user id 0", event.action);
            return Ok(RecordOutcome::Ignored {
                reason: IgnoreReason::InvalidUser,
            });
        }

        let features = match self.store.get_features(event.content_id).await? {
            Some(features) if event.content_id != 0 => features,
            _ => {
                tracing::warn!(
                    "Ignoring {} event for unknown content {}",
                    event.action,
                    event.content_id
                );
                return Ok(RecordOutcome::Ignored {
                    reason: IgnoreReason::UnknownContent,
                });
            }
        };

        let user_id = event.user_id;
        let weight = interaction_weight(&event, &self.config);
        let event_id = event.id;
        let updates = if weight != 0.0 {
            preference_updates(user_id, &features, weight)
        } else {
            Vec::new()
        };
        let Some(changes) = self
            .store
            .record_event(event, updates, self.config.smoothing_retention)
            .await?
        else {
            tracing::debug!("Ignoring duplicate event {}", event_id);
            return Ok(RecordOutcome::Ignored {
                reason: IgnoreReason::DuplicateEvent,
            });
        };

        let material = changes
            .iter()
            .any(|c| c.created || c.delta.abs() > self.config.material_weight_change);
        let mut cache_invalidated = false;
        if material {
            if let Some(cache) = &self.cache {
                cache.invalidate_user(user_id).await;
                cache_invalidated = true;
            }
        }

        tracing::debug!(
            "Recorded event {} for user {}: weight {:.3}, {} preference rows updated",
            event_id,
            user_id,
            weight,
            changes.len()
        );

        Ok(RecordOutcome::Applied {
            weight,
            changes,
            cache_invalidated,
        })
    }

    /// Preferences of a user, strongest first
    pub async fn get_preferences(
        &self,
        user_id: UserId,
    ) -> crate::Result<Vec<UserPreferenceWeight>> {
        if user_id == 0 {
            return Err(InputError::InvalidUserId(user_id).into());
        }
        let mut preferences = self.store.get_preferences(user_id).await?;
        preferences.sort_by(|a, b| {
            b.weight
                .total_cmp(&a.weight)
                .then_with(|| a.preference_type.cmp(&b.preference_type))
                .then_with(|| a.preference_value.cmp(&b.preference_value))
        });
        Ok(preferences)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheKey;
    use crate::models::{RecommendationSet, Strategy};
    use crate::storage::{FileStorage, MemoryStorage};
    use chrono::Utc;

    fn features() -> ContentFeatures {
        let mut features = ContentFeatures::empty(10, "post");
        features.categories.insert("solar".to_string());
        features.tags.insert("panels".to_string());
        features.environmental_score = 50.0;
        features
    }

    async fn tracker() -> (BehaviorTracker, Arc<MemoryStorage>) {
        let store = Arc::new(MemoryStorage::new());
        store.upsert_features(features()).await.unwrap();
        (
            BehaviorTracker::new(store.clone(), TrackerConfig::default()),
            store,
        )
    }

    fn weight_of(prefs: &[UserPreferenceWeight], kind: PreferenceType, value: &str) -> f64 {
        prefs
            .iter()
            .find(|p| p.preference_type == kind && p.preference_value == value)
            .map(|p| p.weight)
            .unwrap_or(0.0)
    }

    #[test]
    fn test_interaction_weights() {
        let config = TrackerConfig::default();
        let view = InteractionEvent::new(1, 10, InteractionAction::View);
        assert_eq!(interaction_weight(&view, &config), 1.0);
        assert_eq!(interaction_weight(&view.clone().with_duration(60.0), &config), 2.0);
        // Dwell bonus caps at 4x
        assert_eq!(interaction_weight(&view.with_duration(3600.0), &config), 4.0);

        let scroll =
            InteractionEvent::new(1, 10, InteractionAction::Scroll).with_scroll_fraction(1.0);
        assert_eq!(interaction_weight(&scroll, &config), 0.75);

        let share = InteractionEvent::new(1, 10, InteractionAction::Share).with_value(2.0);
        assert_eq!(interaction_weight(&share, &config), 6.0);
    }

    #[test]
    fn test_signed_feedback() {
        let config = TrackerConfig::default();
        let rating =
            |stars| InteractionEvent::new(1, 10, InteractionAction::Rating).with_value(stars);
        assert_eq!(interaction_weight(&rating(5.0), &config), 3.0);
        assert_eq!(interaction_weight(&rating(3.0), &config), 0.0);
        assert_eq!(interaction_weight(&rating(1.0), &config), -3.0);

        let dismissal = InteractionEvent::new(1, 10, InteractionAction::Dismissal);
        assert_eq!(interaction_weight(&dismissal, &config), -2.0);
    }

    #[tokio::test]
    async fn test_record_updates_all_touched_rows() {
        let (tracker, _store) = tracker().await;
        let outcome = tracker
            .record(InteractionEvent::new(1, 10, InteractionAction::Click))
            .await
            .unwrap();
        assert!(outcome.is_applied());

        let prefs = tracker.get_preferences(1).await.unwrap();
        assert_eq!(prefs.len(), 4);
        assert_eq!(weight_of(&prefs, PreferenceType::Category, "solar"), 2.0);
        assert_eq!(weight_of(&prefs, PreferenceType::Tag, "panels"), 2.0);
        assert_eq!(weight_of(&prefs, PreferenceType::ContentType, "post"), 2.0);
        assert_eq!(
            weight_of(&prefs, PreferenceType::Environmental, HIGH_IMPACT_PREFERENCE),
            1.0
        );
        // Strongest first
        assert!(prefs.windows(2).all(|w| w[0].weight >= w[1].weight));
    }

    #[tokio::test]
    async fn test_dwell_example() {
        let (tracker, _store) = tracker().await;
        for _ in 0..5 {
            tracker
                .record(InteractionEvent::new(1, 10, InteractionAction::View).with_duration(60.0))
                .await
                .unwrap();
        }
        let prefs = tracker.get_preferences(1).await.unwrap();
        let solar = weight_of(&prefs, PreferenceType::Category, "solar");
        assert!(solar > tracker.config().action_weights.view);
        assert!(solar < tracker.config().action_weights.comment);
    }

    #[tokio::test]
    async fn test_negative_feedback_moves_toward_zero() {
        let (tracker, _store) = tracker().await;

        // No row is created from a dismissal alone
        tracker
            .record(InteractionEvent::new(1, 10, InteractionAction::Dismissal))
            .await
            .unwrap();
        assert!(tracker.get_preferences(1).await.unwrap().is_empty());

        tracker
            .record(InteractionEvent::new(1, 10, InteractionAction::Like))
            .await
            .unwrap();
        let prefs = tracker.get_preferences(1).await.unwrap();
        let before = weight_of(&prefs, PreferenceType::Category, "solar");
        for _ in 0..20 {
            tracker
                .record(InteractionEvent::new(1, 10, InteractionAction::Rating).with_value(1.0))
                .await
                .unwrap();
        }
        let prefs = tracker.get_preferences(1).await.unwrap();
        let after = weight_of(&prefs, PreferenceType::Category, "solar");
        assert!(after < before);
        assert!(prefs.iter().all(|p| p.weight >= 0.0));
    }

    #[tokio::test]
    async fn test_ignored_events() {
        let (tracker, store) = tracker().await;

        let outcome = tracker
            .record(InteractionEvent::new(0, 10, InteractionAction::View))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RecordOutcome::Ignored {
                reason: IgnoreReason::InvalidUser
            }
        );

        let outcome = tracker
            .record(InteractionEvent::new(1, 999, InteractionAction::View))
            .await
            .unwrap();
        assert_eq!(
            outcome,
            RecordOutcome::Ignored {
                reason: IgnoreReason::UnknownContent
            }
        );

        let event = InteractionEvent::new(1, 10, InteractionAction::View);
        assert!(tracker.record(event.clone()).await.unwrap().is_applied());
        assert_eq!(
            tracker.record(event).await.unwrap(),
            RecordOutcome::Ignored {
                reason: IgnoreReason::DuplicateEvent
            }
        );
        assert_eq!(store.get_interactions(None).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_invalid_user_preferences() {
        let (tracker, _store) = tracker().await;
        let err = tracker.get_preferences(0).await.unwrap_err();
        assert_eq!(err.downcast_ref::<InputError>(), Some(&InputError::InvalidUserId(0)));
    }

    #[tokio::test]
    async fn test_material_change_invalidates_cache() {
        let store = Arc::new(MemoryStorage::new());
        store.upsert_features(features()).await.unwrap();
        let cache = Arc::new(RecommendationCache::new(std::time::Duration::from_secs(60), 100));
        let tracker =
            BehaviorTracker::new(store, TrackerConfig::default()).with_cache(cache.clone());

        let key = CacheKey::new(1, Strategy::Hybrid, 5, &[]);
        let set = RecommendationSet {
            user_id: 1,
            requested_strategy: Strategy::Hybrid,
            recommendations: Vec::new(),
            fallback_used: true,
            generated_at: Utc::now(),
        };
        cache.put(key.clone(), set).await;

        let outcome = tracker
            .record(InteractionEvent::new(1, 10, InteractionAction::Share))
            .await
            .unwrap();
        assert!(matches!(
            outcome,
            RecordOutcome::Applied {
                cache_invalidated: true,
                ..
            }
        ));
        assert!(cache.get(&key).await.is_none());
    }

    #[tokio::test]
    async fn test_failed_record_can_be_retried() {
        let temp_dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(FileStorage::new(temp_dir.path()).await.unwrap());
        store.upsert_features(features()).await.unwrap();
        let tracker = BehaviorTracker::new(store, TrackerConfig::default());
        let event = InteractionEvent::new(1, 10, InteractionAction::Like);

        let blocker = temp_dir.path().join("preferences.json");
        std::fs::create_dir(&blocker).unwrap();
        std::fs::write(blocker.join("keep"), "x").unwrap();
        assert!(tracker.record(event.clone()).await.is_err());
        assert!(tracker.get_preferences(1).await.unwrap().is_empty());

        std::fs::remove_dir_all(&blocker).unwrap();
        assert!(tracker.record(event).await.unwrap().is_applied());
        let prefs = tracker.get_preferences(1).await.unwrap();
        assert_eq!(weight_of(&prefs, PreferenceType::Category, "solar"), 2.0);
        assert!(prefs.iter().all(|p| p.interaction_count == 1));
    }
}
