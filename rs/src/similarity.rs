//! Similarity engine
//!
//! Pairwise similarity between content feature bags under several
//! interchangeable algorithms, candidate ranking, and the resumable batch job
//! that maintains the persisted similarity index.
//!
//! Every score is in [0, 1] and symmetric in its operands. Missing data
//! resolves to 0 instead of an error.

use crate::config::SimilarityConfig;
use crate::models::{
    ContentFeatures, ContentId, EngineStorage, IndexCursor, InteractionAction,
    InteractionEvent, SimilarityAlgorithm, SimilarityEdge, UserId,
};
use anyhow::Context;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Users who interacted with each content item, built from an interaction log
#[derive(Debug, Clone, Default)]
pub struct AudienceIndex {
    audiences: HashMap<ContentId, BTreeSet<UserId>>,
}

impl AudienceIndex {
    /// Dismissals are not counted as interest in the item.
    pub fn from_interactions<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a InteractionEvent>,
    {
        let mut audiences: HashMap<ContentId, BTreeSet<UserId>> = HashMap::new();
        for event in events {
            if event.action == InteractionAction::Dismissal {
                continue;
            }
            audiences
                .entry(event.content_id)
                .or_default()
                .insert(event.user_id);
        }
        Self { audiences }
    }

    pub fn audience(&self, content_id: ContentId) -> Option<&BTreeSet<UserId>> {
        self.audiences.get(&content_id)
    }

    pub fn is_empty(&self) -> bool {
        self.audiences.is_empty()
    }
}

/// A candidate returned by [`SimilarityEngine::find_similar`]
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SimilarContent {
    pub content_id: ContentId,
    pub content_type: String,
    pub score: f64,
}

/// Outcome of one batch index call
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct IndexBatchReport {
    /// Pairs visited in this call
    pub evaluated: usize,
    /// New edges written
    pub stored: usize,
    /// Pairs already indexed (by an earlier run or a concurrent one)
    pub skipped_existing: usize,
    /// Pairs whose score did not exceed the index threshold
    pub below_threshold: usize,
    /// Pairs that could not be scored or written
    pub failed: usize,
    /// Where the next call resumes; `None` once the pass is complete
    pub next_cursor: Option<IndexCursor>,
    pub complete: bool,
}

/// Computes similarity between content items
#[derive(Debug, Clone, Default)]
pub struct SimilarityEngine {
    config: SimilarityConfig,
}

impl SimilarityEngine {
    pub fn new(config: SimilarityConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SimilarityConfig {
        &self.config
    }

    /// Similarity from features alone. Behavioral similarity needs an
    /// interaction log and is 0 here; see [`Self::similarity_with_audience`].
    pub fn similarity(
        &self,
        a: &ContentFeatures,
        b: &ContentFeatures,
        algorithm: SimilarityAlgorithm,
    ) -> f64 {
        self.score(a, b, algorithm, None)
    }

    pub fn similarity_with_audience(
        &self,
        a: &ContentFeatures,
        b: &ContentFeatures,
        algorithm: SimilarityAlgorithm,
        audience: &AudienceIndex,
    ) -> f64 {
        self.score(a, b, algorithm, Some(audience))
    }

    fn score(
        &self,
        a: &ContentFeatures,
        b: &ContentFeatures,
        algorithm: SimilarityAlgorithm,
        audience: Option<&AudienceIndex>,
    ) -> f64 {
        let score = match algorithm {
            SimilarityAlgorithm::Cosine => a.content_vector.cosine(&b.content_vector),
            SimilarityAlgorithm::Jaccard => content_jaccard(a, b),
            SimilarityAlgorithm::Environmental => self.environmental(a, b),
            SimilarityAlgorithm::Behavioral => audience
                .map(|index| behavioral(index, a.content_id, b.content_id))
                .unwrap_or(0.0),
            SimilarityAlgorithm::Hybrid => self.hybrid(a, b, audience),
        };
        if score.is_finite() {
            score.clamp(0.0, 1.0)
        } else {
            0.0
        }
    }

    /// Weighted blend of score closeness and keyword/category/tag overlap.
    ///
    /// A term only counts toward the denominator when it has inputs: keyword,
    /// category and tag terms need at least one non-empty side, the score term
    /// needs both scores above zero.
    pub fn environmental(&self, a: &ContentFeatures, b: &ContentFeatures) -> f64 {
        let weights = &self.config.environmental_weights;
        let mut numerator = 0.0;
        let mut denominator = 0.0;

        if a.environmental_score > 0.0 && b.environmental_score > 0.0 {
            let closeness = 1.0 - (a.environmental_score - b.environmental_score).abs() / 100.0;
            numerator += closeness.clamp(0.0, 1.0) * weights.score;
            denominator += weights.score;
        }

        let terms = [
            (
                jaccard_opt(a.environmental_keywords.keys(), b.environmental_keywords.keys()),
                weights.keywords,
            ),
            (jaccard_opt(a.categories.iter(), b.categories.iter()), weights.categories),
            (jaccard_opt(a.tags.iter(), b.tags.iter()), weights.tags),
        ];
        for (value, weight) in terms {
            if let Some(value) = value {
                numerator += value * weight;
                denominator += weight;
            }
        }

        if denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        }
    }

    /// Weighted blend of the other algorithms; zero sub-scores are left out
    /// of both numerator and denominator.
    fn hybrid(
        &self,
        a: &ContentFeatures,
        b: &ContentFeatures,
        audience: Option<&AudienceIndex>,
    ) -> f64 {
        let weights = &self.config.hybrid_weights;
        let behavioral_score = audience
            .map(|index| behavioral(index, a.content_id, b.content_id))
            .unwrap_or(0.0);
        let parts = [
            (a.content_vector.cosine(&b.content_vector), weights.cosine),
            (content_jaccard(a, b), weights.jaccard),
            (self.environmental(a, b), weights.environmental),
            (behavioral_score, weights.behavioral),
        ];

        let mut numerator = 0.0;
        let mut denominator = 0.0;
        for (score, weight) in parts {
            if score > 0.0 && weight > 0.0 {
                numerator += score * weight;
                denominator += weight;
            }
        }
        if denominator == 0.0 {
            0.0
        } else {
            numerator / denominator
        }
    }

    /// Rank `candidates` by similarity to `target`.
    ///
    /// Candidates scoring below `threshold` and the target itself are dropped;
    /// ties keep candidate order.
    pub fn find_similar(
        &self,
        target: &ContentFeatures,
        candidates: &[ContentFeatures],
        limit: usize,
        algorithm: SimilarityAlgorithm,
        threshold: f64,
        audience: Option<&AudienceIndex>,
    ) -> Vec<SimilarContent> {
        let mut scored: Vec<SimilarContent> = candidates
            .iter()
            .filter(|c| c.content_id != target.content_id)
            .filter_map(|candidate| {
                let score = self.score(target, candidate, algorithm, audience);
                (score >= threshold && score > 0.0).then(|| SimilarContent {
                    content_id: candidate.content_id,
                    content_type: candidate.content_type.clone(),
                    score,
                })
            })
            .collect();

        scored.sort_by(|a, b| b.score.total_cmp(&a.score));
        scored.truncate(limit);
        scored
    }

    /// Neighbors of `content_id` read from the persisted index
    pub async fn find_similar_indexed(
        &self,
        store: &dyn EngineStorage,
        content_id: ContentId,
        limit: usize,
        threshold: f64,
    ) -> crate::Result<Vec<SimilarContent>> {
        let edges = store.get_edges_for(content_id).await?;
        let mut neighbors = Vec::with_capacity(edges.len());
        for edge in edges {
            if edge.score < threshold {
                continue;
            }
            let Some(other) = edge.other(content_id) else {
                continue;
            };
            let Some(features) = store.get_features(other).await? else {
                continue;
            };
            neighbors.push(SimilarContent {
                content_id: other,
                content_type: features.content_type,
                score: edge.score,
            });
        }
        neighbors.sort_by(|a, b| {
            b.score
                .total_cmp(&a.score)
                .then(a.content_id.cmp(&b.content_id))
        });
        neighbors.truncate(limit);
        Ok(neighbors)
    }

    /// Similarity of two stored items; 0 when either has no features
    pub async fn similarity_by_id(
        &self,
        store: &dyn EngineStorage,
        a: ContentId,
        b: ContentId,
        algorithm: SimilarityAlgorithm,
    ) -> crate::Result<f64> {
        let (Some(fa), Some(fb)) = (store.get_features(a).await?, store.get_features(b).await?)
        else {
            tracing::debug!("Missing features for pair ({}, {}), similarity is 0", a, b);
            return Ok(0.0);
        };
        if algorithm == SimilarityAlgorithm::Behavioral || algorithm == SimilarityAlgorithm::Hybrid
        {
            let interactions = store.get_interactions(None).await?;
            let audience = AudienceIndex::from_interactions(&interactions);
            Ok(self.similarity_with_audience(&fa, &fb, algorithm, &audience))
        } else {
            Ok(self.similarity(&fa, &fb, algorithm))
        }
    }

    /// Compute and persist one hybrid edge on demand, replacing any stored one.
    ///
    /// Returns the edge only when it clears the index threshold.
    pub async fn compute_edge(
        &self,
        store: &dyn EngineStorage,
        a: ContentId,
        b: ContentId,
    ) -> crate::Result<Option<SimilarityEdge>> {
        if a == b {
            return Ok(None);
        }
        let score = self
            .similarity_by_id(store, a, b, SimilarityAlgorithm::Hybrid)
            .await?;
        if score <= self.config.index_threshold {
            return Ok(None);
        }
        let edge = SimilarityEdge::new(a, b, score, SimilarityAlgorithm::Hybrid);
        store.upsert_similarity(edge.clone()).await?;
        Ok(Some(edge))
    }

    /// Drop all stored edges of an item so the next batch pass recomputes them
    pub async fn invalidate_content(
        &self,
        store: &dyn EngineStorage,
        content_id: ContentId,
    ) -> crate::Result<usize> {
        let removed = store.invalidate_similarity(content_id).await?;
        tracing::info!("Invalidated {} similarity edges for content {}", removed, content_id);
        Ok(removed)
    }

    /// Run one chunk of the all-pairs index build.
    ///
    /// Pairs are visited in ascending `(a, b)` order starting after the stored
    /// checkpoint. At most `batch_size` pairs are evaluated; the checkpoint is
    /// saved after the chunk and cleared once the pass reaches the last pair.
    /// Already-indexed pairs are skipped, so overlapping runs never duplicate
    /// an edge.
    pub async fn build_index_batch(
        &self,
        store: &dyn EngineStorage,
        batch_size: Option<usize>,
        restart: bool,
    ) -> crate::Result<IndexBatchReport> {
        let batch_size = batch_size.unwrap_or(self.config.index_batch_size).max(1);
        let cursor = if restart {
            None
        } else {
            store
                .load_index_checkpoint()
                .await
                .context("Failed to load similarity index checkpoint")?
        };

        let mut features: Vec<ContentFeatures> = store
            .get_all_features()
            .await?
            .into_iter()
            .filter(|f| f.published)
            .collect();
        features.sort_by_key(|f| f.content_id);
        let interactions = store.get_interactions(None).await?;
        let audience = AudienceIndex::from_interactions(&interactions);

        tracing::info!(
            "Similarity index batch: {} items, batch size {}, resuming after {:?}",
            features.len(),
            batch_size,
            cursor
        );

        let mut report = IndexBatchReport::default();
        let mut last: Option<IndexCursor> = None;
        let mut more_pairs = false;

        'outer: for (i, a) in features.iter().enumerate() {
            if cursor.is_some_and(|c| a.content_id < c.content_a) {
                continue;
            }
            for b in &features[i + 1..] {
                let position = IndexCursor {
                    content_a: a.content_id,
                    content_b: b.content_id,
                };
                if cursor.is_some_and(|c| position <= c) {
                    continue;
                }
                if report.evaluated >= batch_size {
                    more_pairs = true;
                    break 'outer;
                }
                report.evaluated += 1;
                last = Some(position);

                match store.get_similarity(a.content_id, b.content_id).await {
                    Ok(Some(_)) => {
                        report.skipped_existing += 1;
                        continue;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        tracing::warn!(
                            "Failed to check edge ({}, {}): {:#}",
                            a.content_id,
                            b.content_id,
                            e
                        );
                        report.failed += 1;
                        continue;
                    }
                }

                let score = self.hybrid(a, b, Some(&audience));
                if !score.is_finite() {
                    report.failed += 1;
                    continue;
                }
                if score <= self.config.index_threshold {
                    report.below_threshold += 1;
                    continue;
                }

                let edge = SimilarityEdge::new(
                    a.content_id,
                    b.content_id,
                    score,
                    SimilarityAlgorithm::Hybrid,
                );
                match store.insert_similarity_if_absent(edge).await {
                    Ok(true) => report.stored += 1,
                    Ok(false) => report.skipped_existing += 1,
                    Err(e) => {
                        tracing::warn!(
                            "Failed to store edge ({}, {}): {:#}",
                            a.content_id,
                            b.content_id,
                            e
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        report.complete = !more_pairs;
        report.next_cursor = if more_pairs { last } else { None };

        store
            .save_index_checkpoint(report.next_cursor)
            .await
            .context("Failed to save similarity index checkpoint")?;

        tracing::info!(
            "Similarity index batch: evaluated {}, stored {}, skipped {}, \
             below threshold {}, failed {}, complete {}",
            report.evaluated,
            report.stored,
            report.skipped_existing,
            report.below_threshold,
            report.failed,
            report.complete
        );
        Ok(report)
    }
}

/// Jaccard over categories, tags and keyword keys combined
pub fn content_jaccard(a: &ContentFeatures, b: &ContentFeatures) -> f64 {
    let set_a = a
        .categories
        .iter()
        .chain(a.tags.iter())
        .map(String::as_str)
        .chain(a.keywords());
    let set_b = b
        .categories
        .iter()
        .chain(b.tags.iter())
        .map(String::as_str)
        .chain(b.keywords());
    jaccard(set_a, set_b)
}

/// `|A ∩ B| / |A ∪ B|` over normalized (lowercased, trimmed) strings, 0 for empty sets
pub fn jaccard<A, B, S, T>(a: A, b: B) -> f64
where
    A: IntoIterator<Item = S>,
    B: IntoIterator<Item = T>,
    S: AsRef<str>,
    T: AsRef<str>,
{
    jaccard_opt(a, b).unwrap_or(0.0)
}

/// Jaccard index, or `None` when both sets are empty
fn jaccard_opt<A, B, S, T>(a: A, b: B) -> Option<f64>
where
    A: IntoIterator<Item = S>,
    B: IntoIterator<Item = T>,
    S: AsRef<str>,
    T: AsRef<str>,
{
    let set_a = normalized(a);
    let set_b = normalized(b);
    let union = set_a.union(&set_b).count();
    if union == 0 {
        return None;
    }
    let intersection = set_a.intersection(&set_b).count();
    Some(intersection as f64 / union as f64)
}

fn normalized<I, S>(values: I) -> BTreeSet<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    values
        .into_iter()
        .map(|v| v.as_ref().trim().to_lowercase())
        .filter(|v| !v.is_empty())
        .collect()
}

/// Jaccard of the audiences of two items
pub fn behavioral(index: &AudienceIndex, a: ContentId, b: ContentId) -> f64 {
    match (index.audience(a), index.audience(b)) {
        (Some(users_a), Some(users_b)) => {
            let union = users_a.union(users_b).count();
            if union == 0 {
                return 0.0;
            }
            users_a.intersection(users_b).count() as f64 / union as f64
        }
        _ => 0.0,
    }
}
